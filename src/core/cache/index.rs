// SPDX-License-Identifier: MIT OR Apache-2.0

// src/core/cache/index.rs

//! The three-index item store.
//!
//! One name index (current-version pointer), one identity index (full
//! history including tombstones) and one per-data-type accelerator. The
//! engine mutates all three inside a single critical section per item, so
//! readers never see one index reflecting an update the others do not.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::core::item::{ItemRef, VersionedItem};

#[derive(Debug, Default)]
pub(crate) struct CacheIndexSet {
    /// Unique name to the current version slot.
    pub(crate) by_name: HashMap<String, Arc<ItemRef>>,
    /// Item id to every version ever accepted, tombstones included.
    pub(crate) by_id: HashMap<Uuid, Arc<ItemRef>>,
    /// Data type name to a unique-name sub-index. Purely an accelerator
    /// for type-scoped scans.
    pub(crate) by_type: HashMap<String, HashMap<String, Arc<ItemRef>>>,
}

impl CacheIndexSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Live items to scan for a query: the type sub-index when a data type
    /// is given, otherwise every current version.
    pub(crate) fn candidates(&self, data_type: Option<&str>) -> Vec<Arc<VersionedItem>> {
        match data_type {
            Some(data_type) => self
                .by_type
                .get(data_type)
                .map(|sub_index| {
                    sub_index
                        .values()
                        .filter_map(|item_ref| item_ref.item())
                        .collect()
                })
                .unwrap_or_default(),
            None => self
                .by_name
                .values()
                .filter_map(|item_ref| item_ref.item())
                .collect(),
        }
    }

    /// Reclaim slack capacity after pruning.
    pub(crate) fn shrink(&mut self) {
        self.by_name.shrink_to_fit();
        self.by_id.shrink_to_fit();
        for sub_index in self.by_type.values_mut() {
            sub_index.shrink_to_fit();
        }
        self.by_type.shrink_to_fit();
    }
}
