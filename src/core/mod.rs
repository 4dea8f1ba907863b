// SPDX-License-Identifier: MIT OR Apache-2.0

// src/core/mod.rs

pub mod cache;
pub mod error;
pub mod item;
pub mod query;
pub mod server;
pub mod store;
pub mod subscription;
pub mod transport;
pub mod util;

pub use self::cache::CacheEngine;
pub use self::error::CoreError;
pub use self::item::{ItemBuilder, ItemKind, ItemRef, ItemSource, VersionedItem};
pub use self::query::ItemQuery;
pub use self::server::{CoreServer, ServerConfig};
pub use self::store::{BackingStore, StoreEngine, StoreError};
pub use self::subscription::{
    ClientSubscription, SubscriptionRegistry, SubscriptionRequest, SubscriptionState,
};
pub use self::transport::{ItemPage, NullTransport, Transport};
