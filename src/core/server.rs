// SPDX-License-Identifier: MIT OR Apache-2.0

// src/core/server.rs

//! Composition root.
//!
//! Wires the cache engine, the optional write-behind store engine and the
//! transport collaborator together, loads persisted state before serving,
//! and owns the housekeeping timer. Shutdown runs one final housekeeping
//! pass and drains both engines with a bounded timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::Duration;

use crate::core::cache::CacheEngine;
use crate::core::error::CoreError;
use crate::core::item::ItemSource;
use crate::core::store::{BackingStore, StoreEngine};
use crate::core::transport::Transport;
use crate::core::util::{Clock, PeriodicTimer, SystemClock};

/// Tunable intervals and retention windows.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How often the housekeeping pipeline runs.
    pub housekeep_interval: StdDuration,
    /// Grace window a superseded version stays readable by id.
    pub deleted_item_retention: Duration,
    /// How long a tombstone keeps its identity entry before full pruning.
    pub ancient_id_retention: Duration,
    /// Retry cadence for failed backing store operations.
    pub store_retry_interval: StdDuration,
    /// How long shutdown waits for the work queues to drain.
    pub shutdown_drain_timeout: StdDuration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            housekeep_interval: StdDuration::from_secs(30),
            deleted_item_retention: Duration::seconds(60),
            ancient_id_retention: Duration::seconds(120),
            store_retry_interval: StdDuration::from_secs(60),
            shutdown_drain_timeout: StdDuration::from_secs(30),
        }
    }
}

pub struct CoreServer {
    config: ServerConfig,
    cache: Arc<CacheEngine>,
    store: Option<Arc<StoreEngine>>,
    housekeep_timer: Mutex<Option<PeriodicTimer>>,
    started: AtomicBool,
}

impl CoreServer {
    pub fn new(
        config: ServerConfig,
        backing: Option<Arc<dyn BackingStore>>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::with_clock(config, backing, transport, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: ServerConfig,
        backing: Option<Arc<dyn BackingStore>>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = backing
            .map(|backing| Arc::new(StoreEngine::new(backing, config.store_retry_interval)));
        let cache = CacheEngine::new(config.clone(), clock, transport, store.clone());
        Self {
            config,
            cache,
            store,
            housekeep_timer: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn cache(&self) -> &Arc<CacheEngine> {
        &self.cache
    }

    pub fn store(&self) -> Option<&Arc<StoreEngine>> {
        self.store.as_ref()
    }

    /// Load persisted state, restore subscriptions, start the background
    /// machinery. Items load synchronously so the cache is complete before
    /// the first query arrives.
    pub fn start(&self) -> Result<(), CoreError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(store) = &self.store {
            store.start();
            log::debug!("querying store...");
            let items = store.sync_load_all()?;
            log::debug!("loading {} items...", items.len());
            for item in items {
                self.cache.process_new_item(item, ItemSource::LocalStore);
            }
            log::debug!(
                "loaded items up to sequence {}",
                self.cache.last_store_usn()
            );
            let restored = self.cache.restore_saved_subscriptions();
            if restored > 0 {
                log::info!("restored {restored} subscriptions");
            }
        }
        let cache = Arc::clone(&self.cache);
        let timer = PeriodicTimer::start("housekeep", self.config.housekeep_interval, move || {
            cache.housekeep_tick();
        });
        *self.housekeep_timer.lock().unwrap() = Some(timer);
        Ok(())
    }

    /// One final housekeeping pass, then bounded drains of both engines.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(timer) = self.housekeep_timer.lock().unwrap().take() {
            timer.stop();
        }
        self.cache.housekeep_tick();
        self.cache.shutdown(self.config.shutdown_drain_timeout);
        if let Some(store) = &self.store {
            store.stop(self.config.shutdown_drain_timeout);
        }
    }
}

impl Drop for CoreServer {
    fn drop(&mut self) {
        self.stop();
    }
}
