// SPDX-License-Identifier: MIT OR Apache-2.0

// src/core/cache/mod.rs

//! The cache engine.
//!
//! Owns the three-index item store, the subscription registry and the
//! serial dispatch queue everything asynchronous runs on. Ingestion is
//! fire-and-forget; queries run synchronously on the caller's thread under
//! short critical sections; subscribers are notified outside the index
//! lock so a slow transport never stalls ingestion.

pub(crate) mod index;
pub(crate) mod housekeeping;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::core::cache::housekeeping::HousekeepGates;
use crate::core::cache::index::CacheIndexSet;
use crate::core::error::CoreError;
use crate::core::item::{ItemBuilder, ItemKind, ItemRef, ItemSource, VersionedItem};
use crate::core::query::ItemQuery;
use crate::core::server::ServerConfig;
use crate::core::store::StoreEngine;
use crate::core::subscription::{
    ClientSubscription, SubscriptionRegistry, SubscriptionRequest, SubscriptionState,
    SUBSCRIPTION_STATE_PREFIX, SUBSCRIPTION_STATE_TYPE,
};
use crate::core::transport::{ItemPage, Transport};
use crate::core::util::{Clock, DispatchQueue, StatsCounters};
use crate::query_api::expression::{ExprContext, ExprError, Expression};

/// Hard cap on items per delivered page.
pub const MAX_PAGE_ITEMS: usize = 50;
/// Estimated-byte budget per delivered page.
pub const MAX_PAGE_BYTES: usize = 4 * 1024 * 1024;

/// Kind/scope/type filter plus the query expression, applied to one item.
/// Expression failures propagate; the caller decides whether that is a
/// non-match (queries) or fatal (subscriptions).
pub(crate) fn item_matches_filter(
    item: &VersionedItem,
    item_kind: Option<ItemKind>,
    app_scopes: &[String],
    data_type: Option<&str>,
    expr: Option<&Expression>,
) -> Result<bool, ExprError> {
    if let Some(kind) = item_kind {
        if item.item_kind != kind {
            return Ok(false);
        }
    }
    if let Some(data_type) = data_type {
        if !data_type.is_empty() && item.data_type_name != data_type {
            return Ok(false);
        }
    }
    if !app_scopes.is_empty()
        && !app_scopes
            .iter()
            .any(|scope| scope.eq_ignore_ascii_case(&item.app_scope))
    {
        return Ok(false);
    }
    match expr {
        None => Ok(true),
        Some(expr) => {
            let ctx = ExprContext::new(&item.app_props, &item.name, item.created, item.expires);
            expr.matches(&ctx)
        }
    }
}

pub struct CacheEngine {
    pub(crate) config: ServerConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) store: Option<Arc<StoreEngine>>,
    pub(crate) indexes: Mutex<CacheIndexSet>,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) dispatcher: DispatchQueue,
    pub(crate) gates: HousekeepGates,
    /// Handle to the owning `Arc`, taken by jobs dispatched onto the
    /// worker queue.
    pub(crate) self_ref: Weak<CacheEngine>,
    last_store_usn: AtomicI64,
    stats: StatsCounters,
}

impl CacheEngine {
    pub fn new(
        config: ServerConfig,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn Transport>,
        store: Option<Arc<StoreEngine>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            clock,
            transport,
            store,
            indexes: Mutex::new(CacheIndexSet::new()),
            subscriptions: SubscriptionRegistry::new(),
            dispatcher: DispatchQueue::new("cache"),
            gates: HousekeepGates::new(),
            self_ref: self_ref.clone(),
            last_store_usn: AtomicI64::new(0),
            stats: StatsCounters::new(),
        })
    }

    pub fn stats(&self) -> &StatsCounters {
        &self.stats
    }

    pub fn last_store_usn(&self) -> i64 {
        self.last_store_usn.load(Ordering::SeqCst)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn item_count(&self) -> usize {
        self.indexes.lock().unwrap().by_name.len()
    }

    pub fn identity_count(&self) -> usize {
        self.indexes.lock().unwrap().by_id.len()
    }

    // ---------------------------------------------------------------
    // ingestion
    // ---------------------------------------------------------------

    /// Fire-and-forget ingestion. The item is indexed and fanned out on
    /// the engine's worker thread; the caller returns immediately.
    pub fn submit_item(&self, item: VersionedItem, source: ItemSource) {
        let Some(engine) = self.self_ref.upgrade() else {
            return;
        };
        self.dispatcher
            .dispatch(move || engine.process_new_item(item, source));
    }

    /// Index a new item and notify subscribers. An item is ignored when
    /// its id is already known; it is retained as history but not promoted
    /// to current when a same-name item with an equal or later creation
    /// time already holds the slot.
    pub fn process_new_item(&self, item: VersionedItem, source: ItemSource) {
        let now = self.clock.now();
        let unique_name = item.unique_name();
        let mut item = item;
        let indexed_item: Arc<VersionedItem>;
        {
            let mut indexes = self.indexes.lock().unwrap();
            if indexes.by_id.contains_key(&item.id) {
                log::debug!("ignoring duplicate item '{}' ({})", item.name, item.id);
                return;
            }
            let out_of_date = match indexes
                .by_name
                .get(&unique_name)
                .and_then(|item_ref| item_ref.item())
            {
                // an equal creation time does not displace the holder
                Some(current) => current.created >= item.created,
                None => false,
            };
            // every accepted item gets a sequence number; only load-time
            // items keep the one the store assigned last time around
            if source == ItemSource::LocalStore {
                self.last_store_usn
                    .fetch_max(item.store_usn, Ordering::SeqCst);
            } else {
                item.store_usn = self.last_store_usn.fetch_add(1, Ordering::SeqCst) + 1;
            }
            let arc_item = Arc::new(item);
            let item_ref = Arc::new(ItemRef::new(
                Arc::clone(&arc_item),
                source == ItemSource::LocalStore,
                now,
            ));
            if out_of_date {
                log::debug!(
                    "item '{}' ({}) is out-of-date, retained as history only",
                    arc_item.name,
                    arc_item.id
                );
            } else {
                self.stats.add_to_hierarchy(&format!(
                    "SaveType.{}.{}",
                    arc_item.item_kind, arc_item.data_type_name
                ));
                self.stats
                    .add_to_hierarchy(&format!("SaveTime.{}", now.format("%a.%H")));
                self.stats
                    .add_to_hierarchy(&format!("SaveDate.{}", now.format("%b.%d")));
                indexes
                    .by_name
                    .insert(unique_name.clone(), Arc::clone(&item_ref));
            }
            indexes.by_id.insert(arc_item.id, Arc::clone(&item_ref));
            if !arc_item.data_type_name.is_empty() {
                indexes
                    .by_type
                    .entry(arc_item.data_type_name.clone())
                    .or_default()
                    .insert(unique_name, item_ref);
            }
            indexed_item = arc_item;
        }
        // fan out with the index lock released
        self.notify_subscribers(&indexed_item);
    }

    fn notify_subscribers(&self, item: &Arc<VersionedItem>) {
        for subscription in self.subscriptions.snapshot() {
            if !self.transport.is_connection_valid(&subscription.client_id) {
                continue;
            }
            match subscription.wants_item(item) {
                Ok(false) => {}
                Ok(true) => {
                    let delivered = if subscription.exclude_data_body {
                        Arc::new(item.without_body())
                    } else {
                        Arc::clone(item)
                    };
                    self.transport.send_page(ItemPage {
                        client_id: subscription.client_id,
                        subscription_id: Some(subscription.subscription_id),
                        request_id: None,
                        items: vec![delivered],
                    });
                }
                Err(e) => {
                    // fail fast for this one subscription only
                    log::error!(
                        "subscription '{}' failed evaluating against item '{}': {e}",
                        subscription.subscription_id,
                        item.name
                    );
                    self.cancel_subscription(&subscription.subscription_id);
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // queries
    // ---------------------------------------------------------------

    /// Run a query against the cache: filter, optional order-by, row
    /// range. Paging into transport-sized chunks is the caller's step.
    pub fn get_cache_items(&self, query: &ItemQuery) -> Vec<Arc<VersionedItem>> {
        let candidates = {
            let indexes = self.indexes.lock().unwrap();
            indexes.candidates(query.data_type.as_deref())
        };
        let mut results: Vec<Arc<VersionedItem>> = candidates
            .into_iter()
            .filter(|item| {
                item.store_usn > query.minimum_usn
                    && query
                        .maximum_usn
                        .map_or(true, |max| item.store_usn <= max)
                    && (!query.exclude_deleted || item.is_current(query.as_at_time))
                    && item_matches_filter(
                        item,
                        query.item_kind,
                        &query.app_scopes,
                        query.data_type.as_deref(),
                        query.expr.as_ref(),
                    )
                    .unwrap_or_else(|e| {
                        if query.debug {
                            log::debug!(
                                "query expression failed on item '{}': {e}",
                                item.name
                            );
                        }
                        false
                    })
            })
            .collect();
        if let Some(order_expr) = &query.order_expr {
            results.sort_by(|a, b| {
                let key_a = Self::order_key(order_expr, a);
                let key_b = Self::order_key(order_expr, b);
                match (key_a, key_b) {
                    (Some(a), Some(b)) => a.compare(&b).unwrap_or(std::cmp::Ordering::Equal),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                }
            });
        }
        if query.start_row > 0 || query.row_count.is_some() {
            let end = query
                .row_count
                .map(|count| (query.start_row + count).min(results.len()))
                .unwrap_or(results.len());
            let start = query.start_row.min(end);
            results = results[start..end].to_vec();
        }
        results
    }

    fn order_key(
        order_expr: &Expression,
        item: &VersionedItem,
    ) -> Option<crate::query_api::PropertyValue> {
        let ctx = ExprContext::new(&item.app_props, &item.name, item.created, item.expires);
        order_expr.evaluate(&ctx).ok().flatten()
    }

    /// Point lookup by id.
    pub fn select_by_id(
        &self,
        id: &Uuid,
        minimum_usn: i64,
        as_at_time: DateTime<Utc>,
        exclude_deleted: bool,
    ) -> Option<Arc<VersionedItem>> {
        let indexes = self.indexes.lock().unwrap();
        let item = indexes.by_id.get(id)?.item()?;
        if item.store_usn > minimum_usn && (!exclude_deleted || item.is_current(as_at_time)) {
            Some(item)
        } else {
            None
        }
    }

    /// Point lookup by the current-version slot.
    #[allow(clippy::too_many_arguments)]
    pub fn select_by_name(
        &self,
        item_kind: ItemKind,
        app_scope: &str,
        name: &str,
        data_type: Option<&str>,
        minimum_usn: i64,
        as_at_time: DateTime<Utc>,
        exclude_deleted: bool,
    ) -> Option<Arc<VersionedItem>> {
        let unique_name = crate::core::item::make_unique_name(item_kind, app_scope, name);
        let indexes = self.indexes.lock().unwrap();
        let item = indexes.by_name.get(&unique_name)?.item()?;
        if item.store_usn > minimum_usn
            && data_type.map_or(true, |dt| item.data_type_name == dt)
            && (!exclude_deleted || item.is_current(as_at_time))
        {
            Some(item)
        } else {
            None
        }
    }

    /// Run a query and deliver the answer to a client in bounded pages.
    pub fn answer_query(&self, client_id: Uuid, request_id: Uuid, query: &ItemQuery) {
        let results = self.get_cache_items(query);
        if query.debug {
            log::debug!("query '{request_id}' found {} items", results.len());
        }
        for page in Self::paginate_items(&results, query.exclude_data_body) {
            self.transport.send_page(ItemPage {
                client_id,
                subscription_id: None,
                request_id: Some(request_id),
                items: page,
            });
        }
    }

    /// Split a result list into transport pages bounded by item count and
    /// estimated byte size. Always yields a final page, possibly empty,
    /// which doubles as the completion marker.
    pub fn paginate_items(
        items: &[Arc<VersionedItem>],
        exclude_data_body: bool,
    ) -> Vec<Vec<Arc<VersionedItem>>> {
        let mut pages = Vec::new();
        let mut current: Vec<Arc<VersionedItem>> = Vec::new();
        let mut current_bytes = 0usize;
        for item in items {
            let size = item.estimated_size_bytes(exclude_data_body);
            if !current.is_empty()
                && (current.len() >= MAX_PAGE_ITEMS || current_bytes + size >= MAX_PAGE_BYTES)
            {
                pages.push(std::mem::take(&mut current));
                current_bytes = 0;
            }
            let delivered = if exclude_data_body {
                Arc::new(item.without_body())
            } else {
                Arc::clone(item)
            };
            current.push(delivered);
            current_bytes += size;
        }
        pages.push(current);
        pages
    }

    // ---------------------------------------------------------------
    // subscriptions
    // ---------------------------------------------------------------

    /// Register a subscription, persist its recovery record, then replay
    /// matching existing items. The registration and the sequence
    /// watermark are taken under the index lock, so every item is covered
    /// exactly once: at or below the watermark by the replay snapshot,
    /// above it by the live stream.
    pub fn create_subscription(&self, client_id: Uuid, request: SubscriptionRequest) -> Uuid {
        let subscription_id = Uuid::new_v4();
        let subscription = {
            let _indexes = self.indexes.lock().unwrap();
            let live_floor = self.last_store_usn.load(Ordering::SeqCst);
            let subscription = Arc::new(ClientSubscription::from_request(
                client_id,
                subscription_id,
                &request,
                live_floor,
            ));
            self.subscriptions.set(Arc::clone(&subscription));
            subscription
        };
        self.save_subscription_state(&subscription);
        log::debug!("subscription '{subscription_id}' created ({client_id})");
        if !subscription.exclude_existing {
            let query = subscription.replay_query();
            let existing = self.get_cache_items(&query);
            if subscription.debug {
                log::debug!(
                    "subscription '{subscription_id}' replaying {} existing items",
                    existing.len()
                );
            }
            for page in Self::paginate_items(&existing, subscription.exclude_data_body) {
                self.transport.send_page(ItemPage {
                    client_id,
                    subscription_id: Some(subscription_id),
                    request_id: None,
                    items: page,
                });
            }
        }
        subscription_id
    }

    /// Drop the registry entry and expire its recovery record.
    pub fn cancel_subscription(&self, subscription_id: &Uuid) {
        if let Some(subscription) = self.subscriptions.remove(subscription_id) {
            self.delete_subscription_state(subscription_id);
            log::debug!(
                "subscription '{subscription_id}' removed ({})",
                subscription.client_id
            );
        }
    }

    /// Keep-alive placeholder for the transport layer.
    pub fn extend_subscription(&self, subscription_id: &Uuid) {
        log::debug!("subscription '{subscription_id}' extended");
    }

    /// Re-register a subscription from its recovery record. No replay.
    pub fn restore_subscription(&self, state: &SubscriptionState) -> Result<Uuid, CoreError> {
        let subscription = Arc::new(ClientSubscription::from_state(state)?);
        let subscription_id = subscription.subscription_id;
        self.subscriptions.set(subscription);
        log::debug!("subscription '{subscription_id}' restored");
        Ok(subscription_id)
    }

    /// Scan surviving recovery records and re-register each of them.
    /// Called once at startup after the store load.
    pub fn restore_saved_subscriptions(&self) -> usize {
        let query = ItemQuery::new(self.clock.now())
            .with_kind(ItemKind::Local)
            .with_data_type(SUBSCRIPTION_STATE_TYPE)
            .with_expr(Expression::starts_with(
                crate::query_api::expression::PROP_ITEM_NAME,
                SUBSCRIPTION_STATE_PREFIX,
            ));
        let mut restored = 0;
        for item in self.get_cache_items(&query) {
            let Some(payload) = item.payload_bytes() else {
                continue;
            };
            match serde_json::from_slice::<SubscriptionState>(payload) {
                Ok(state) => match self.restore_subscription(&state) {
                    Ok(_) => restored += 1,
                    Err(e) => log::warn!(
                        "discarding unusable subscription record '{}': {e}",
                        item.name
                    ),
                },
                Err(e) => log::warn!(
                    "discarding unreadable subscription record '{}': {e}",
                    item.name
                ),
            }
        }
        restored
    }

    /// Persist the recovery record as an ordinary non-transient item. It
    /// rides the same ingestion and write-behind pipeline as client data.
    fn save_subscription_state(&self, subscription: &ClientSubscription) {
        let state = subscription.to_state();
        let name = ClientSubscription::state_item_name(&subscription.subscription_id);
        match ItemBuilder::new(ItemKind::Local, &name)
            .data_type(SUBSCRIPTION_STATE_TYPE)
            .json_payload(&state)
        {
            Ok(builder) => {
                self.process_new_item(builder.seal(self.clock.now()), ItemSource::Client)
            }
            Err(e) => log::error!(
                "failed to serialize subscription state '{}': {e}",
                subscription.subscription_id
            ),
        }
    }

    /// Expire the recovery record by writing a zero-lifetime replacement
    /// through the normal pipeline; housekeeping then tombstones it and
    /// propagates the delete to the store.
    fn delete_subscription_state(&self, subscription_id: &Uuid) {
        let name = ClientSubscription::state_item_name(subscription_id);
        let item = ItemBuilder::new(ItemKind::Local, &name)
            .data_type(SUBSCRIPTION_STATE_TYPE)
            .lifetime(Duration::zero())
            .seal(self.clock.now());
        self.process_new_item(item, ItemSource::Client);
    }

    // ---------------------------------------------------------------
    // lifecycle
    // ---------------------------------------------------------------

    /// Block until the dispatch queue is idle. Test and shutdown helper.
    pub fn wait_until_idle(&self, timeout: StdDuration) -> bool {
        self.dispatcher.wait_until_empty(timeout)
    }

    /// Drain the dispatch queue within the timeout and stop its worker.
    pub fn shutdown(&self, drain_timeout: StdDuration) {
        if !self.dispatcher.wait_until_empty(drain_timeout) {
            log::warn!(
                "cache engine stopping with {} undrained jobs",
                self.dispatcher.pending()
            );
        }
        self.dispatcher.shutdown();
    }
}

impl std::fmt::Debug for CacheEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEngine")
            .field("items", &self.item_count())
            .field("identities", &self.identity_count())
            .field("subscriptions", &self.subscription_count())
            .field("last_store_usn", &self.last_store_usn())
            .finish()
    }
}
