// SPDX-License-Identifier: MIT OR Apache-2.0

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use common::{build_item, init_logging, wait_for};
use corecache::core::item::VersionedItem;
use corecache::core::store::{
    BackingStore, InMemoryBackingStore, SqliteBackingStore, StoreEngine, StoreError,
};

/// Records the order of operations reaching the backing store and can fail
/// a configurable number of leading calls.
#[derive(Debug, Default)]
struct JournalingStore {
    journal: Mutex<Vec<String>>,
    fail_remaining: Mutex<u32>,
}

impl JournalingStore {
    fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    fn fail_next_ops(&self, count: u32) {
        *self.fail_remaining.lock().unwrap() = count;
    }

    fn check_fault(&self) -> Result<(), StoreError> {
        let mut remaining = self.fail_remaining.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(StoreError::Unavailable("injected fault".to_string()));
        }
        Ok(())
    }
}

impl BackingStore for JournalingStore {
    fn load_all(&self) -> Result<Vec<VersionedItem>, StoreError> {
        Ok(Vec::new())
    }

    fn insert(&self, item: &VersionedItem) -> Result<(), StoreError> {
        self.check_fault()?;
        self.journal.lock().unwrap().push(format!("insert:{}", item.name));
        Ok(())
    }

    fn delete(&self, id: &Uuid) -> Result<(), StoreError> {
        self.check_fault()?;
        self.journal.lock().unwrap().push(format!("delete:{id}"));
        Ok(())
    }
}

fn engine_over(backing: Arc<dyn BackingStore>) -> Arc<StoreEngine> {
    init_logging();
    let engine = Arc::new(StoreEngine::new(backing, Duration::from_millis(50)));
    engine.start();
    engine
}

#[test]
fn test_inserts_drain_in_fifo_order_ahead_of_deletes() {
    let backing = Arc::new(JournalingStore::default());
    let engine = Arc::new(StoreEngine::new(
        Arc::clone(&backing) as _,
        Duration::from_millis(50),
    ));

    // queue everything before the worker exists so one drain sees it all
    let now = Utc::now();
    let delete_id = Uuid::new_v4();
    engine.enqueue_insert(Arc::new(build_item("first", "S", "T", b"1", now)));
    engine.enqueue_delete(delete_id);
    engine.enqueue_insert(Arc::new(build_item("second", "S", "T", b"2", now)));
    engine.enqueue_insert(Arc::new(build_item("third", "S", "T", b"3", now)));
    engine.start();

    assert!(wait_for(
        || engine.completed_count() == 4,
        Duration::from_secs(5)
    ));
    assert_eq!(
        backing.journal(),
        vec![
            "insert:first".to_string(),
            "insert:second".to_string(),
            "insert:third".to_string(),
            format!("delete:{delete_id}"),
        ]
    );
    engine.stop(Duration::from_secs(1));
}

#[test]
fn test_failed_operation_is_retried_not_dropped() {
    let backing = Arc::new(InMemoryBackingStore::new());
    let engine = engine_over(Arc::clone(&backing) as _);

    backing.fail_next_ops(1);
    let item = Arc::new(build_item("retry-me", "S", "T", b"x", Utc::now()));
    let id = item.id;
    engine.enqueue_insert(item);

    // the retry timer drives the second, successful attempt
    assert!(wait_for(
        || engine.completed_count() == 1,
        Duration::from_secs(5)
    ));
    assert_eq!(engine.exception_count(), 1);
    assert_eq!(engine.queued_inserts(), 0);
    assert!(backing.contains(&id));
    engine.stop(Duration::from_secs(1));
}

#[test]
fn test_repeated_failures_keep_operation_at_queue_head() {
    let backing = Arc::new(JournalingStore::default());
    let engine = Arc::new(StoreEngine::new(
        Arc::clone(&backing) as _,
        Duration::from_millis(50),
    ));

    backing.fail_next_ops(3);
    let now = Utc::now();
    engine.enqueue_insert(Arc::new(build_item("head", "S", "T", b"1", now)));
    engine.enqueue_insert(Arc::new(build_item("tail", "S", "T", b"2", now)));
    engine.start();

    assert!(wait_for(
        || engine.completed_count() == 2,
        Duration::from_secs(10)
    ));
    assert_eq!(engine.exception_count(), 3);
    // order preserved across the retries
    assert_eq!(
        backing.journal(),
        vec!["insert:head".to_string(), "insert:tail".to_string()]
    );
    engine.stop(Duration::from_secs(1));
}

#[test]
fn test_stop_drains_pending_work() {
    let backing = Arc::new(InMemoryBackingStore::new());
    let engine = engine_over(Arc::clone(&backing) as _);
    for index in 0..20 {
        engine.enqueue_insert(Arc::new(build_item(
            &format!("item-{index}"),
            "S",
            "T",
            b"x",
            Utc::now(),
        )));
    }
    engine.stop(Duration::from_secs(5));
    assert_eq!(backing.item_count(), 20);
    assert_eq!(engine.completed_count(), 20);
}

#[test]
fn test_sqlite_round_trip_through_engine() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let backing = Arc::new(SqliteBackingStore::open(path.to_str().unwrap()).unwrap());
    let engine = engine_over(Arc::clone(&backing) as _);

    let mut item = build_item("Curve.USD", "Prod", "Curve", b"payload", Utc::now());
    item.store_usn = 11;
    engine.enqueue_insert(Arc::new(item.clone()));
    assert!(wait_for(
        || engine.completed_count() == 1,
        Duration::from_secs(5)
    ));
    engine.stop(Duration::from_secs(1));

    // a fresh store over the same file sees the row
    let reopened = SqliteBackingStore::open(path.to_str().unwrap()).unwrap();
    let loaded = reopened.load_all().unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].id, item.id);
    assert_eq!(loaded[0].store_usn, 11);
    assert_eq!(loaded[0].payload_bytes(), Some(&b"payload"[..]));
}
