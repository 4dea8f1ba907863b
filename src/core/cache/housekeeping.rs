// SPDX-License-Identifier: MIT OR Apache-2.0

// src/core/cache/housekeeping.rs

//! The six-phase maintenance pipeline.
//!
//! A repeating timer calls [`CacheEngine::housekeep_tick`]. Each phase is
//! gated by a pending counter: the tick increments it and dispatches the
//! phase onto the engine's serial queue, and the phase body runs only when
//! it is the last pending call, so a burst of timer fires collapses into a
//! single pass. Phases chain strictly in order because each one depends on
//! the previous phase's effects. A failing phase is logged and the chain
//! continues; the next tick gets another chance.
//!
//! 1. name-index hygiene and the write-behind persist trigger
//! 2. tombstoning of expired and superseded versions, ancient pruning
//! 3. payload deduplication by content hash
//! 4. per-type sub-index hygiene
//! 5. subscription liveness sweep
//! 6. allocator slack reclamation

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::core::cache::CacheEngine;
use crate::core::item::{ItemRef, PayloadHash, VersionedItem};

pub(crate) const PHASE_COUNT: usize = 6;
const PHASE_NAMES: [&str; PHASE_COUNT] = [
    "names",
    "identities",
    "dedup",
    "types",
    "subscriptions",
    "reclaim",
];

/// One pending counter per phase. A re-trigger while a run is already
/// pending is a no-op, which bounds background work to one pass per phase
/// per tick burst no matter how many timer events fired.
#[derive(Debug, Default)]
pub(crate) struct HousekeepGates {
    pending: [AtomicI32; PHASE_COUNT],
}

impl HousekeepGates {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn arm(&self, phase: usize) {
        self.pending[phase].fetch_add(1, Ordering::SeqCst);
    }

    /// True when this call is the last armed one and the phase should run.
    fn disarm(&self, phase: usize) -> bool {
        self.pending[phase].fetch_sub(1, Ordering::SeqCst) == 1
    }
}

impl CacheEngine {
    /// Entry point for the housekeeping timer. Also called once more
    /// during shutdown for a final pass.
    pub fn housekeep_tick(&self) {
        self.schedule_phase(0);
    }

    fn schedule_phase(&self, phase: usize) {
        let Some(engine) = self.self_ref.upgrade() else {
            return;
        };
        self.gates.arm(phase);
        self.dispatcher.dispatch(move || engine.run_phase(phase));
    }

    fn run_phase(&self, phase: usize) {
        // calls are accumulative, not discrete
        if !self.gates.disarm(phase) {
            return;
        }
        let started = Instant::now();
        let now = self.clock.now();
        let outcome = catch_unwind(AssertUnwindSafe(|| match phase {
            0 => self.housekeep_names(now),
            1 => self.housekeep_identities(now),
            2 => self.housekeep_dedup(),
            3 => self.housekeep_types(now),
            4 => self.housekeep_subscriptions(),
            _ => self.housekeep_reclaim(),
        }));
        if let Err(panic) = outcome {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::error!("housekeep {} failed: {message}", PHASE_NAMES[phase]);
        }
        self.stats()
            .add_to_hierarchy(&format!("Housekeep.{}", PHASE_NAMES[phase]));
        log::debug!(
            "housekeep {} took {:.3}s",
            PHASE_NAMES[phase],
            started.elapsed().as_secs_f64()
        );
        if phase + 1 < PHASE_COUNT {
            self.schedule_phase(phase + 1);
        }
    }

    /// Phase 1: push unpersisted current items to the write-behind queue
    /// and drop name entries whose visibility window has lapsed. The
    /// identity entries stay; phase 2 deals with those.
    fn housekeep_names(&self, now: DateTime<Utc>) {
        let mut to_persist: Vec<Arc<VersionedItem>> = Vec::new();
        let total;
        let mut expired = 0;
        {
            let mut indexes = self.indexes.lock().unwrap();
            total = indexes.by_name.len();
            let mut old_names: Vec<String> = Vec::new();
            for (name, item_ref) in &indexes.by_name {
                match item_ref.item() {
                    Some(item) => {
                        if self.store.is_some() && !item.transient && !item_ref.persisted() {
                            item_ref.mark_persisted(now);
                            to_persist.push(Arc::clone(&item));
                        }
                        if !item.is_current(now) {
                            old_names.push(name.clone());
                        }
                    }
                    None => old_names.push(name.clone()),
                }
            }
            for name in old_names {
                expired += 1;
                indexes.by_name.remove(&name);
            }
        }
        let stored = to_persist.len();
        if let Some(store) = &self.store {
            for item in to_persist {
                store.enqueue_insert(item);
            }
        }
        log::debug!("---------- housekeep names ----------");
        log::debug!("  Total   : {total}");
        log::debug!("  Expired : {expired}");
        log::debug!("  Stored  : {stored}");
    }

    /// Phase 2: tombstone identity entries that expired or have been
    /// superseded for longer than the grace retention, propagate deletes
    /// for persistent ones, and prune tombstones past the ancient
    /// retention entirely.
    fn housekeep_identities(&self, now: DateTime<Utc>) {
        let total;
        let mut tombstoned: Vec<Arc<VersionedItem>> = Vec::new();
        {
            let mut indexes = self.indexes.lock().unwrap();
            total = indexes.by_id.len();
            let mut to_tombstone: Vec<(Arc<ItemRef>, Arc<VersionedItem>)> = Vec::new();
            let mut ancient_ids: Vec<Uuid> = Vec::new();
            for (id, item_ref) in &indexes.by_id {
                match item_ref.item() {
                    Some(item) => {
                        if !item.is_current(now) {
                            to_tombstone.push((Arc::clone(item_ref), item));
                            continue;
                        }
                        // an unexpired item must still be the one its name
                        // slot points at, or sit inside the grace window
                        // protecting in-flight readers of a prior version
                        match indexes
                            .by_name
                            .get(&item.unique_name())
                            .and_then(|named| named.item())
                        {
                            Some(named) => {
                                if named.id != item.id
                                    && now.signed_duration_since(named.created)
                                        > self.config.deleted_item_retention
                                {
                                    to_tombstone.push((Arc::clone(item_ref), item));
                                }
                            }
                            None => to_tombstone.push((Arc::clone(item_ref), item)),
                        }
                    }
                    None => {
                        if now.signed_duration_since(item_ref.changed())
                            > self.config.ancient_id_retention
                        {
                            ancient_ids.push(*id);
                        }
                    }
                }
            }
            for (item_ref, item) in to_tombstone {
                item_ref.tombstone(now);
                tombstoned.push(item);
            }
            for id in &ancient_ids {
                indexes.by_id.remove(id);
            }
            log::debug!("---------- housekeep identities ----------");
            log::debug!("  Total   : {total}");
            log::debug!("  Expired : {}", tombstoned.len());
            log::debug!("  Deleted : {}", ancient_ids.len());
        }
        if let Some(store) = &self.store {
            for item in &tombstoned {
                if !item.transient {
                    store.enqueue_delete(item.id);
                }
            }
        }
    }

    /// Phase 3: content-address every payload and rebind duplicates to the
    /// first-seen buffer. The equality check is a spot check only, length
    /// plus first and last byte; a mismatch under an equal hash is a
    /// data-integrity error and the payload is left untouched.
    fn housekeep_dedup(&self) {
        let mut unique_buffers: HashMap<PayloadHash, Arc<Vec<u8>>> = HashMap::new();
        let mut total_items = 0usize;
        let mut total_bytes = 0usize;
        let mut unique_items = 0usize;
        let mut unique_bytes = 0usize;
        let mut rebound = 0usize;
        {
            let indexes = self.indexes.lock().unwrap();
            for item_ref in indexes.by_id.values() {
                let Some(item) = item_ref.item() else {
                    continue;
                };
                let (Some(payload), Some(hash)) = (item.payload().cloned(), item.payload_hash())
                else {
                    continue;
                };
                if payload.is_empty() {
                    continue;
                }
                total_items += 1;
                total_bytes += payload.len();
                match unique_buffers.get(&hash) {
                    Some(first) => {
                        if Arc::ptr_eq(first, &payload) {
                            continue;
                        }
                        let length = first.len();
                        if length == payload.len()
                            && first[0] == payload[0]
                            && first[length - 1] == payload[length - 1]
                        {
                            let mut shared = (*item).clone();
                            shared.set_payload_buffer(Arc::clone(first));
                            item_ref.replace_item(Arc::new(shared));
                            rebound += 1;
                        } else {
                            log::error!(
                                "payload hash collision on item '{}' ({}): buffers differ",
                                item.name,
                                item.id
                            );
                        }
                    }
                    None => {
                        unique_items += 1;
                        unique_bytes += payload.len();
                        unique_buffers.insert(hash, payload);
                    }
                }
            }
        }
        log::debug!("---------- housekeep dedup ----------");
        log::debug!("  Total   : {total_items} ({total_bytes} bytes)");
        log::debug!("  Unique  : {unique_items} ({unique_bytes} bytes)");
        log::debug!("  Rebound : {rebound}");
    }

    /// Phase 4: drop expired and tombstoned entries from each per-type
    /// sub-index. Empty sub-indices are kept.
    fn housekeep_types(&self, now: DateTime<Utc>) {
        let mut removed = 0usize;
        {
            let mut indexes = self.indexes.lock().unwrap();
            for sub_index in indexes.by_type.values_mut() {
                let mut old_names: Vec<String> = Vec::new();
                for (name, item_ref) in sub_index.iter() {
                    let live = item_ref.item().map_or(false, |item| item.is_current(now));
                    if !live {
                        old_names.push(name.clone());
                    }
                }
                for name in old_names {
                    removed += 1;
                    sub_index.remove(&name);
                }
            }
        }
        log::debug!("---------- housekeep types ----------");
        log::debug!("  Removed : {removed}");
    }

    /// Phase 5: drop subscriptions whose owning connection is gone and
    /// expire their recovery records.
    fn housekeep_subscriptions(&self) {
        let mut active = 0usize;
        let mut expired: Vec<(Uuid, Uuid)> = Vec::new();
        for subscription in self.subscriptions.snapshot() {
            if self.transport.is_connection_valid(&subscription.client_id) {
                active += 1;
            } else {
                expired.push((subscription.subscription_id, subscription.client_id));
            }
        }
        for (subscription_id, client_id) in &expired {
            self.cancel_subscription(subscription_id);
            log::debug!("subscription '{subscription_id}' expired ({client_id})");
        }
        log::debug!("---------- housekeep subscriptions ----------");
        log::debug!("  Active  : {active}");
        log::debug!("  Expired : {}", expired.len());
    }

    /// Phase 6: give excess index capacity back to the allocator.
    fn housekeep_reclaim(&self) {
        let mut indexes = self.indexes.lock().unwrap();
        indexes.shrink();
    }
}
