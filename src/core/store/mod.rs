// SPDX-License-Identifier: MIT OR Apache-2.0

// src/core/store/mod.rs

//! Write-behind persistence engine.
//!
//! The cache is authoritative; the backing store catches up asynchronously.
//! Inserts and deletes queue in FIFO order under one lock and a single
//! worker drains them, inserts ahead of deletes, until both queues are
//! empty or an operation fails. A failed operation stays at the head of
//! its queue and the retry timer guarantees another drain attempt once the
//! fault clears, so nothing is ever silently dropped. Duplicate inserts of
//! the same id can reach the backing store; its upsert semantics absorb
//! them.

pub mod memory;
pub mod sqlite;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::core::item::VersionedItem;
use crate::core::util::PeriodicTimer;

pub use self::memory::InMemoryBackingStore;
pub use self::sqlite::SqliteBackingStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("corrupt record '{id}': {message}")]
    Corrupt { id: String, message: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable storage consumed by the cache. `insert` must upsert.
pub trait BackingStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<VersionedItem>, StoreError>;
    fn insert(&self, item: &VersionedItem) -> Result<(), StoreError>;
    fn delete(&self, id: &Uuid) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct StoreQueues {
    inserts: VecDeque<Arc<VersionedItem>>,
    deletes: VecDeque<Uuid>,
    signaled: bool,
    stopping: bool,
}

#[derive(Debug, Default)]
struct StoreShared {
    queues: Mutex<StoreQueues>,
    wake: Condvar,
    completed: AtomicU64,
    exceptions: AtomicU64,
}

enum StoreOp {
    Insert(Arc<VersionedItem>),
    Delete(Uuid),
}

pub struct StoreEngine {
    backing: Arc<dyn BackingStore>,
    shared: Arc<StoreShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    retry_timer: Mutex<Option<PeriodicTimer>>,
    retry_interval: Duration,
}

impl StoreEngine {
    pub fn new(backing: Arc<dyn BackingStore>, retry_interval: Duration) -> Self {
        Self {
            backing,
            shared: Arc::new(StoreShared::default()),
            worker: Mutex::new(None),
            retry_timer: Mutex::new(None),
            retry_interval,
        }
    }

    /// Spawn the drain worker and the retry timer.
    pub fn start(&self) {
        let shared = Arc::clone(&self.shared);
        let backing = Arc::clone(&self.backing);
        let worker = thread::Builder::new()
            .name("store-engine".to_string())
            .spawn(move || Self::run_worker(&shared, backing.as_ref()))
            .expect("failed to spawn store worker");
        *self.worker.lock().unwrap() = Some(worker);

        let shared = Arc::clone(&self.shared);
        let timer = PeriodicTimer::start("store-retry", self.retry_interval, move || {
            Self::signal(&shared);
        });
        *self.retry_timer.lock().unwrap() = Some(timer);
    }

    /// Synchronous full read, used once at startup before the cache
    /// starts serving.
    pub fn sync_load_all(&self) -> Result<Vec<VersionedItem>, StoreError> {
        self.backing.load_all()
    }

    pub fn enqueue_insert(&self, item: Arc<VersionedItem>) {
        let mut queues = self.shared.queues.lock().unwrap();
        queues.inserts.push_back(item);
        queues.signaled = true;
        self.shared.wake.notify_one();
    }

    pub fn enqueue_delete(&self, id: Uuid) {
        let mut queues = self.shared.queues.lock().unwrap();
        queues.deletes.push_back(id);
        queues.signaled = true;
        self.shared.wake.notify_one();
    }

    pub fn completed_count(&self) -> u64 {
        self.shared.completed.load(Ordering::SeqCst)
    }

    pub fn exception_count(&self) -> u64 {
        self.shared.exceptions.load(Ordering::SeqCst)
    }

    pub fn queued_inserts(&self) -> usize {
        self.shared.queues.lock().unwrap().inserts.len()
    }

    pub fn queued_deletes(&self) -> usize {
        self.shared.queues.lock().unwrap().deletes.len()
    }

    /// Wait for the queues to drain, then stop the worker and the retry
    /// timer. Logs a warning when work remains past the timeout.
    pub fn stop(&self, drain_timeout: Duration) {
        if let Some(timer) = self.retry_timer.lock().unwrap().take() {
            timer.stop();
        }
        let deadline = Instant::now() + drain_timeout;
        loop {
            {
                let queues = self.shared.queues.lock().unwrap();
                if queues.inserts.is_empty() && queues.deletes.is_empty() {
                    break;
                }
            }
            if Instant::now() >= deadline {
                let queues = self.shared.queues.lock().unwrap();
                log::warn!(
                    "store engine stopping with undrained work: {} inserts, {} deletes",
                    queues.inserts.len(),
                    queues.deletes.len()
                );
                break;
            }
            Self::signal(&self.shared);
            thread::sleep(Duration::from_millis(10));
        }
        {
            let mut queues = self.shared.queues.lock().unwrap();
            queues.stopping = true;
        }
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }

    fn signal(shared: &Arc<StoreShared>) {
        let mut queues = shared.queues.lock().unwrap();
        queues.signaled = true;
        shared.wake.notify_one();
    }

    fn run_worker(shared: &Arc<StoreShared>, backing: &dyn BackingStore) {
        loop {
            {
                let mut queues = shared.queues.lock().unwrap();
                while !queues.signaled && !queues.stopping {
                    queues = shared.wake.wait(queues).unwrap();
                }
                if queues.stopping {
                    return;
                }
                queues.signaled = false;
            }
            Self::drain(shared, backing);
        }
    }

    /// Drain both queues, inserts first. Stops at the first failure,
    /// leaving the failed operation at the head of its queue for the next
    /// attempt.
    fn drain(shared: &StoreShared, backing: &dyn BackingStore) {
        loop {
            let op = {
                let queues = shared.queues.lock().unwrap();
                if let Some(item) = queues.inserts.front() {
                    StoreOp::Insert(Arc::clone(item))
                } else if let Some(id) = queues.deletes.front() {
                    StoreOp::Delete(*id)
                } else {
                    return;
                }
            };
            let result = match &op {
                StoreOp::Insert(item) => backing.insert(item),
                StoreOp::Delete(id) => backing.delete(id),
            };
            match result {
                Ok(()) => {
                    let mut queues = shared.queues.lock().unwrap();
                    match op {
                        StoreOp::Insert(_) => {
                            queues.inserts.pop_front();
                        }
                        StoreOp::Delete(_) => {
                            queues.deletes.pop_front();
                        }
                    }
                    shared.completed.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    shared.exceptions.fetch_add(1, Ordering::SeqCst);
                    match &op {
                        StoreOp::Insert(item) => log::error!(
                            "store insert '{}' ({}) failed, will retry: {e}",
                            item.name,
                            item.id
                        ),
                        StoreOp::Delete(id) => {
                            log::error!("store delete ({id}) failed, will retry: {e}")
                        }
                    }
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for StoreEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreEngine")
            .field("completed", &self.completed_count())
            .field("exceptions", &self.exception_count())
            .field("queued_inserts", &self.queued_inserts())
            .field("queued_deletes", &self.queued_deletes())
            .finish()
    }
}
