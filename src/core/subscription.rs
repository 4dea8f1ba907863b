// SPDX-License-Identifier: MIT OR Apache-2.0

// src/core/subscription.rs

//! Live query subscriptions and their persisted recovery records.
//!
//! A subscription is matched against every item accepted by the cache.
//! Its recovery record is written through the ordinary ingestion pipeline
//! as a non-transient item under a reserved name prefix, which means it
//! rides the same write-behind persistence and survives a restart without
//! any separate channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::CoreError;
use crate::core::item::{ItemKind, VersionedItem};
use crate::core::query::ItemQuery;
use crate::query_api::expression::{ExprContext, ExprError, Expression};

/// Reserved name prefix for persisted subscription recovery records.
pub const SUBSCRIPTION_STATE_PREFIX: &str = "Subscription.State.";
/// Data type name of subscription recovery records.
pub const SUBSCRIPTION_STATE_TYPE: &str = "SubscriptionState";

/// Client request to open a subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub item_kind: Option<ItemKind>,
    pub data_type_name: Option<String>,
    pub expression: Expression,
    pub app_scopes: Vec<String>,
    pub minimum_usn: i64,
    pub exclude_existing: bool,
    pub exclude_deleted: bool,
    pub exclude_data_body: bool,
    pub as_at_time: DateTime<Utc>,
    pub debug: bool,
}

impl SubscriptionRequest {
    pub fn matching_all(as_at_time: DateTime<Utc>) -> Self {
        Self {
            item_kind: None,
            data_type_name: None,
            expression: Expression::all(),
            app_scopes: Vec::new(),
            minimum_usn: 0,
            exclude_existing: false,
            exclude_deleted: true,
            exclude_data_body: false,
            as_at_time,
            debug: false,
        }
    }
}

/// A registered subscription.
#[derive(Debug)]
pub struct ClientSubscription {
    pub client_id: Uuid,
    pub subscription_id: Uuid,
    pub item_kind: Option<ItemKind>,
    pub data_type_name: Option<String>,
    pub expression: Expression,
    pub app_scopes: Vec<String>,
    pub minimum_usn: i64,
    pub exclude_existing: bool,
    pub exclude_deleted: bool,
    pub exclude_data_body: bool,
    pub as_at_time: DateTime<Utc>,
    pub debug: bool,
    /// Sequence watermark at registration time. The live stream only
    /// carries items above it; everything at or below belongs to the
    /// replay snapshot. Keeps replay-then-live delivery exactly-once.
    pub live_floor: i64,
}

impl ClientSubscription {
    pub fn from_request(
        client_id: Uuid,
        subscription_id: Uuid,
        request: &SubscriptionRequest,
        live_floor: i64,
    ) -> Self {
        Self {
            client_id,
            subscription_id,
            item_kind: request.item_kind,
            data_type_name: request.data_type_name.clone(),
            expression: request.expression.clone(),
            app_scopes: request.app_scopes.clone(),
            minimum_usn: request.minimum_usn,
            exclude_existing: request.exclude_existing,
            exclude_deleted: request.exclude_deleted,
            exclude_data_body: request.exclude_data_body,
            as_at_time: request.as_at_time,
            debug: request.debug,
            live_floor,
        }
    }

    /// The replay query covering everything the live stream will not send.
    pub fn replay_query(&self) -> ItemQuery {
        let mut query = ItemQuery::new(self.as_at_time)
            .with_minimum_usn(self.minimum_usn);
        query.app_scopes = self.app_scopes.clone();
        query.item_kind = self.item_kind;
        query.data_type = self.data_type_name.clone();
        query.expr = Some(self.expression.clone());
        query.maximum_usn = Some(self.live_floor);
        query.exclude_deleted = self.exclude_deleted;
        query.exclude_data_body = self.exclude_data_body;
        query.debug = self.debug;
        query
    }

    /// Whether the live stream should carry `item` to this subscriber.
    /// An evaluation error is fatal to the subscription; the caller
    /// cancels it.
    pub fn wants_item(&self, item: &VersionedItem) -> Result<bool, ExprError> {
        if item.store_usn <= self.live_floor || item.store_usn <= self.minimum_usn {
            return Ok(false);
        }
        if self.exclude_deleted && !item.is_current(self.as_at_time) {
            return Ok(false);
        }
        if let Some(kind) = self.item_kind {
            if item.item_kind != kind {
                return Ok(false);
            }
        }
        if let Some(data_type) = &self.data_type_name {
            if !data_type.is_empty() && item.data_type_name != *data_type {
                return Ok(false);
            }
        }
        if !self.app_scopes.is_empty()
            && !self
                .app_scopes
                .iter()
                .any(|scope| scope.eq_ignore_ascii_case(&item.app_scope))
        {
            return Ok(false);
        }
        let ctx = ExprContext::new(&item.app_props, &item.name, item.created, item.expires);
        self.expression.matches(&ctx)
    }

    pub fn to_state(&self) -> SubscriptionState {
        SubscriptionState {
            connection_id: self.client_id.to_string(),
            subscription_id: self.subscription_id.to_string(),
            data_type_name: self.data_type_name.clone(),
            item_kind: self.item_kind,
            expression: self.expression.to_json().unwrap_or_default(),
            app_scopes: self.app_scopes.clone(),
            minimum_usn: self.minimum_usn,
            exclude_existing: self.exclude_existing,
            exclude_deleted: self.exclude_deleted,
            as_at_time: self.as_at_time.to_rfc3339(),
            exclude_data_body: self.exclude_data_body,
            debug: self.debug,
        }
    }

    /// Rebuild a subscription from its recovery record. Restored
    /// subscriptions get no replay, so the live floor falls back to the
    /// recorded minimum sequence number.
    pub fn from_state(state: &SubscriptionState) -> Result<Self, CoreError> {
        let client_id = state
            .connection_id
            .parse::<Uuid>()
            .map_err(|e| CoreError::InvalidSubscriptionState(format!("connection id: {e}")))?;
        let subscription_id = state
            .subscription_id
            .parse::<Uuid>()
            .map_err(|e| CoreError::InvalidSubscriptionState(format!("subscription id: {e}")))?;
        let expression = Expression::from_json(&state.expression)
            .map_err(|e| CoreError::InvalidSubscriptionState(format!("expression: {e}")))?;
        let as_at_time = DateTime::parse_from_rfc3339(&state.as_at_time)
            .map_err(|e| CoreError::InvalidSubscriptionState(format!("as-at time: {e}")))?
            .with_timezone(&Utc);
        Ok(Self {
            client_id,
            subscription_id,
            item_kind: state.item_kind,
            data_type_name: state.data_type_name.clone(),
            expression,
            app_scopes: state.app_scopes.clone(),
            minimum_usn: state.minimum_usn,
            exclude_existing: state.exclude_existing,
            exclude_deleted: state.exclude_deleted,
            exclude_data_body: state.exclude_data_body,
            as_at_time,
            debug: state.debug,
            live_floor: state.minimum_usn,
        })
    }

    /// Name of the recovery record item for this subscription.
    pub fn state_item_name(subscription_id: &Uuid) -> String {
        format!("{SUBSCRIPTION_STATE_PREFIX}{subscription_id}")
    }
}

/// Persisted recovery record. Serialized as the JSON payload of an
/// ordinary cached item; field names are part of the stored format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub connection_id: String,
    pub subscription_id: String,
    pub data_type_name: Option<String>,
    pub item_kind: Option<ItemKind>,
    pub expression: String,
    pub app_scopes: Vec<String>,
    pub minimum_usn: i64,
    pub exclude_existing: bool,
    pub exclude_deleted: bool,
    pub as_at_time: String,
    pub exclude_data_body: bool,
    pub debug: bool,
}

/// Guarded map of the live subscriptions.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: Mutex<HashMap<Uuid, Arc<ClientSubscription>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, subscription: Arc<ClientSubscription>) {
        self.subscriptions
            .lock()
            .unwrap()
            .insert(subscription.subscription_id, subscription);
    }

    pub fn remove(&self, subscription_id: &Uuid) -> Option<Arc<ClientSubscription>> {
        self.subscriptions.lock().unwrap().remove(subscription_id)
    }

    pub fn get(&self, subscription_id: &Uuid) -> Option<Arc<ClientSubscription>> {
        self.subscriptions
            .lock()
            .unwrap()
            .get(subscription_id)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<ClientSubscription>> {
        self.subscriptions.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::item::ItemBuilder;

    fn subscription(kind: Option<ItemKind>, data_type: Option<&str>) -> ClientSubscription {
        let request = SubscriptionRequest {
            item_kind: kind,
            data_type_name: data_type.map(str::to_string),
            ..SubscriptionRequest::matching_all(Utc::now())
        };
        ClientSubscription::from_request(Uuid::new_v4(), Uuid::new_v4(), &request, 0)
    }

    fn item_of_type(data_type: &str, usn: i64) -> VersionedItem {
        let mut item = ItemBuilder::new(ItemKind::Object, "x")
            .data_type(data_type)
            .seal(Utc::now());
        item.store_usn = usn;
        item
    }

    #[test]
    fn test_data_type_filter() {
        let sub = subscription(None, Some("Foo"));
        assert!(sub.wants_item(&item_of_type("Foo", 1)).unwrap());
        assert!(!sub.wants_item(&item_of_type("Bar", 2)).unwrap());
    }

    #[test]
    fn test_live_floor_fences_replayed_items() {
        let request = SubscriptionRequest::matching_all(Utc::now());
        let sub = ClientSubscription::from_request(Uuid::new_v4(), Uuid::new_v4(), &request, 5);
        assert!(!sub.wants_item(&item_of_type("Foo", 5)).unwrap());
        assert!(sub.wants_item(&item_of_type("Foo", 6)).unwrap());
    }

    #[test]
    fn test_state_roundtrip() {
        let original = subscription(Some(ItemKind::Object), Some("Foo"));
        let state = original.to_state();
        let json = serde_json::to_string(&state).unwrap();
        let parsed: SubscriptionState = serde_json::from_str(&json).unwrap();
        let restored = ClientSubscription::from_state(&parsed).unwrap();
        assert_eq!(restored.client_id, original.client_id);
        assert_eq!(restored.subscription_id, original.subscription_id);
        assert_eq!(restored.expression, original.expression);
        assert_eq!(restored.data_type_name, original.data_type_name);
    }

    #[test]
    fn test_bad_state_is_rejected() {
        let mut state = subscription(None, None).to_state();
        state.connection_id = "not-a-uuid".to_string();
        assert!(ClientSubscription::from_state(&state).is_err());
    }
}
