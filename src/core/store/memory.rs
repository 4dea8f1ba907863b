// SPDX-License-Identifier: MIT OR Apache-2.0

// src/core/store/memory.rs
// In-memory backing store. Mostly for tests, which also use the failure
// injection hooks to exercise the write-behind retry path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use uuid::Uuid;

use crate::core::item::VersionedItem;
use crate::core::store::{BackingStore, StoreError};

#[derive(Debug, Default)]
pub struct InMemoryBackingStore {
    rows: Mutex<HashMap<Uuid, VersionedItem>>,
    fail_remaining: AtomicU32,
}

impl InMemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail with a retryable error.
    pub fn fail_next_ops(&self, count: u32) {
        self.fail_remaining.store(count, Ordering::SeqCst);
    }

    fn check_fault(&self) -> Result<(), StoreError> {
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected fault".to_string()));
        }
        Ok(())
    }

    pub fn item_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.rows.lock().unwrap().contains_key(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<VersionedItem> {
        self.rows.lock().unwrap().get(id).cloned()
    }
}

impl BackingStore for InMemoryBackingStore {
    fn load_all(&self) -> Result<Vec<VersionedItem>, StoreError> {
        self.check_fault()?;
        Ok(self.rows.lock().unwrap().values().cloned().collect())
    }

    fn insert(&self, item: &VersionedItem) -> Result<(), StoreError> {
        self.check_fault()?;
        self.rows.lock().unwrap().insert(item.id, item.clone());
        Ok(())
    }

    fn delete(&self, id: &Uuid) -> Result<(), StoreError> {
        self.check_fault()?;
        self.rows.lock().unwrap().remove(id);
        Ok(())
    }
}
