// SPDX-License-Identifier: MIT OR Apache-2.0

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use corecache::core::item::{ItemBuilder, ItemKind, VersionedItem};
use corecache::core::server::ServerConfig;
use corecache::core::transport::{ItemPage, Transport};

/// Transport that records every delivered page and lets tests invalidate
/// connections to drive the liveness sweep.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pages: Mutex<Vec<ItemPage>>,
    invalid: Mutex<HashSet<Uuid>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn drop_connection(&self, client_id: Uuid) {
        self.invalid.lock().unwrap().insert(client_id);
    }

    pub fn pages(&self) -> Vec<ItemPage> {
        self.pages.lock().unwrap().clone()
    }

    /// Item ids delivered for one subscription, replay and live alike, in
    /// delivery order.
    pub fn delivered_item_ids(&self, subscription_id: Uuid) -> Vec<Uuid> {
        self.pages
            .lock()
            .unwrap()
            .iter()
            .filter(|page| page.subscription_id == Some(subscription_id))
            .flat_map(|page| page.items.iter().map(|item| item.id))
            .collect()
    }

    pub fn pages_for_request(&self, request_id: Uuid) -> Vec<ItemPage> {
        self.pages
            .lock()
            .unwrap()
            .iter()
            .filter(|page| page.request_id == Some(request_id))
            .cloned()
            .collect()
    }
}

impl Transport for RecordingTransport {
    fn is_connection_valid(&self, client_id: &Uuid) -> bool {
        !self.invalid.lock().unwrap().contains(client_id)
    }

    fn send_page(&self, page: ItemPage) {
        self.pages.lock().unwrap().push(page);
    }
}

/// Transport whose liveness check blocks while a test holds the gate.
/// Used to park the housekeeping pipeline inside the liveness phase so
/// that coalescing of queued ticks becomes observable.
#[derive(Debug)]
pub struct GatedTransport {
    pub inner: Arc<RecordingTransport>,
    pub gate: Arc<Mutex<()>>,
}

impl Transport for GatedTransport {
    fn is_connection_valid(&self, client_id: &Uuid) -> bool {
        let _held = self.gate.lock().unwrap();
        self.inner.is_connection_valid(client_id)
    }

    fn send_page(&self, page: ItemPage) {
        self.inner.send_page(page);
    }
}

/// Config with test-sized windows so retention tests drive a manual clock
/// in seconds rather than minutes.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        housekeep_interval: Duration::from_secs(3600),
        deleted_item_retention: chrono::Duration::seconds(60),
        ancient_id_retention: chrono::Duration::seconds(120),
        store_retry_interval: Duration::from_millis(50),
        shutdown_drain_timeout: Duration::from_secs(5),
    }
}

pub fn build_item(
    name: &str,
    scope: &str,
    data_type: &str,
    payload: &[u8],
    created: DateTime<Utc>,
) -> VersionedItem {
    ItemBuilder::new(ItemKind::Object, name)
        .app_scope(scope)
        .data_type(data_type)
        .payload(payload.to_vec())
        .seal(created)
}

/// Route crate logs to the test harness. Safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll until `check` passes or the timeout lapses.
pub fn wait_for(check: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    check()
}
