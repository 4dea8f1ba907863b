// SPDX-License-Identifier: MIT OR Apache-2.0

// src/core/transport.rs

//! Transport collaborator seam.
//!
//! The cache never talks to sockets. Query answers, subscription replays
//! and live notifications all leave through [`Transport::send_page`], and
//! subscription liveness is decided by [`Transport::is_connection_valid`].
//! Delivery is fire-and-forget from the cache's point of view; a transport
//! that needs to block must queue internally.

use std::sync::Arc;

use uuid::Uuid;

use crate::core::item::VersionedItem;

/// One page of items addressed to a client connection. `subscription_id`
/// is set for replay and live notification pages, `request_id` for query
/// answers.
#[derive(Debug, Clone)]
pub struct ItemPage {
    pub client_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub request_id: Option<Uuid>,
    pub items: Vec<Arc<VersionedItem>>,
}

pub trait Transport: Send + Sync {
    fn is_connection_valid(&self, client_id: &Uuid) -> bool;
    fn send_page(&self, page: ItemPage);
}

/// Transport that accepts every connection and discards every page. Used
/// when the cache runs headless, for bulk loads and tooling.
#[derive(Debug, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn is_connection_valid(&self, _client_id: &Uuid) -> bool {
        true
    }

    fn send_page(&self, _page: ItemPage) {}
}
