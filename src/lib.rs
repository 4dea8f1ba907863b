// SPDX-License-Identifier: MIT OR Apache-2.0

// src/lib.rs

//! corecache: a versioned, multi-indexed in-memory object store with live
//! query subscriptions, asynchronous write-behind persistence and a
//! cooperative six-phase housekeeping pipeline.
//!
//! The cache is the authority; durable storage catches up asynchronously
//! and the transport layer is a collaborator behind a trait. Items are
//! immutable versions competing for a `(kind, scope, name)` slot, decided
//! by creation time, with every version retained in an identity index
//! until housekeeping tombstones and eventually prunes it.

pub mod core;
pub mod query_api;

pub use crate::core::{
    BackingStore, CacheEngine, ClientSubscription, CoreError, CoreServer, ItemBuilder, ItemKind,
    ItemPage, ItemQuery, ItemSource, NullTransport, ServerConfig, StoreEngine, StoreError,
    SubscriptionRequest, SubscriptionState, Transport, VersionedItem,
};
pub use crate::query_api::{ExprContext, ExprError, Expression, PropertySet, PropertyValue};
