// SPDX-License-Identifier: MIT OR Apache-2.0

// src/core/item.rs

//! The cached entity and its index wrapper.
//!
//! A [`VersionedItem`] is immutable once sealed. Versioning works through
//! the unique name: items sharing `(kind, scope, name)` compete for one
//! "current version" slot, decided by their `created` timestamp. The id is
//! never reused, so the identity index doubles as an audit trail of every
//! version ever ingested.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::query_api::properties::PropertySet;

/// Scope used for internally generated items when the caller gives none.
pub const DEFAULT_APP_SCOPE: &str = "Default";

/// Broad category of a cached item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    /// Ordinary application object.
    Object,
    /// Platform configuration and bootstrap data.
    System,
    /// Server-internal state such as subscription recovery records.
    Local,
    /// Diagnostic payloads.
    Debug,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemKind::Object => "Object",
            ItemKind::System => "System",
            ItemKind::Local => "Local",
            ItemKind::Debug => "Debug",
        };
        write!(f, "{name}")
    }
}

impl FromStr for ItemKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Object" => Ok(ItemKind::Object),
            "System" => Ok(ItemKind::System),
            "Local" => Ok(ItemKind::Local),
            "Debug" => Ok(ItemKind::Debug),
            other => Err(format!("unknown item kind '{other}'")),
        }
    }
}

/// Where an ingested item came from. Load-time items keep their persisted
/// sequence numbers; everything else gets a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemSource {
    Client,
    LocalStore,
    Peer,
}

pub type PayloadHash = [u8; 32];

fn hash_payload(payload: &[u8]) -> PayloadHash {
    let mut hash = PayloadHash::default();
    hash.copy_from_slice(&Sha256::digest(payload));
    hash
}

/// One immutable version of a cached object.
#[derive(Debug, Clone)]
pub struct VersionedItem {
    pub id: Uuid,
    pub item_kind: ItemKind,
    pub name: String,
    pub app_scope: String,
    pub data_type_name: String,
    pub app_props: PropertySet,
    pub sys_props: PropertySet,
    payload: Option<Arc<Vec<u8>>>,
    payload_hash: Option<PayloadHash>,
    pub signature: Option<Vec<u8>>,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub transient: bool,
    pub store_usn: i64,
}

impl VersionedItem {
    /// Reassemble an item from its persisted columns. The content hash is
    /// recomputed because the store does not keep it.
    #[allow(clippy::too_many_arguments)]
    pub fn from_stored_parts(
        id: Uuid,
        item_kind: ItemKind,
        name: String,
        app_scope: String,
        data_type_name: String,
        app_props: PropertySet,
        sys_props: PropertySet,
        payload: Option<Vec<u8>>,
        signature: Option<Vec<u8>>,
        created: DateTime<Utc>,
        expires: DateTime<Utc>,
        transient: bool,
        store_usn: i64,
    ) -> Self {
        let payload_hash = payload.as_deref().map(hash_payload);
        Self {
            id,
            item_kind,
            name,
            app_scope,
            data_type_name,
            app_props,
            sys_props,
            payload: payload.map(Arc::new),
            payload_hash,
            signature,
            created,
            expires,
            transient,
            store_usn,
        }
    }

    /// Composite key of the current-version slot this item competes for.
    /// Scope and name fold case so clients disagreeing on capitalization
    /// still address the same slot.
    pub fn unique_name(&self) -> String {
        make_unique_name(self.item_kind, &self.app_scope, &self.name)
    }

    pub fn is_current(&self, as_at: DateTime<Utc>) -> bool {
        self.expires > as_at
    }

    pub fn payload(&self) -> Option<&Arc<Vec<u8>>> {
        self.payload.as_ref()
    }

    pub fn payload_bytes(&self) -> Option<&[u8]> {
        self.payload.as_deref().map(|buffer| buffer.as_slice())
    }

    pub fn payload_hash(&self) -> Option<PayloadHash> {
        self.payload_hash
    }

    /// Rebind the payload to an already cached buffer. The caller is
    /// responsible for having verified the buffers are identical.
    pub(crate) fn set_payload_buffer(&mut self, buffer: Arc<Vec<u8>>) {
        self.payload = Some(buffer);
    }

    /// Clone without the payload body, for data-body-excluded delivery.
    pub fn without_body(&self) -> VersionedItem {
        let mut stripped = self.clone();
        stripped.payload = None;
        stripped
    }

    /// Rough wire-size estimate used for page budgeting.
    pub fn estimated_size_bytes(&self, exclude_data_body: bool) -> usize {
        let body = if exclude_data_body {
            0
        } else {
            self.payload.as_deref().map(|b| b.len()).unwrap_or(0)
        };
        64 + self.name.len()
            + self.app_scope.len()
            + self.data_type_name.len()
            + self.app_props.estimated_size_bytes()
            + self.sys_props.estimated_size_bytes()
            + body
    }
}

pub fn make_unique_name(kind: ItemKind, app_scope: &str, name: &str) -> String {
    format!(
        "{kind}|{}|{}",
        app_scope.to_lowercase(),
        name.to_lowercase()
    )
}

/// Staged construction of a [`VersionedItem`]. `seal` stamps the creation
/// time from the supplied clock time, derives the expiry from the lifetime
/// and fixes the payload hash; after that the item never changes.
#[derive(Debug)]
pub struct ItemBuilder {
    id: Option<Uuid>,
    item_kind: ItemKind,
    name: String,
    app_scope: String,
    data_type_name: String,
    app_props: PropertySet,
    sys_props: PropertySet,
    payload: Option<Vec<u8>>,
    signature: Option<Vec<u8>>,
    transient: bool,
    lifetime: Option<Duration>,
}

impl ItemBuilder {
    pub fn new(item_kind: ItemKind, name: &str) -> Self {
        Self {
            id: None,
            item_kind,
            name: name.to_string(),
            app_scope: DEFAULT_APP_SCOPE.to_string(),
            data_type_name: String::new(),
            app_props: PropertySet::new(),
            sys_props: PropertySet::new(),
            payload: None,
            signature: None,
            transient: false,
            lifetime: None,
        }
    }

    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn app_scope(mut self, scope: &str) -> Self {
        self.app_scope = scope.to_string();
        self
    }

    pub fn data_type(mut self, data_type_name: &str) -> Self {
        self.data_type_name = data_type_name.to_string();
        self
    }

    pub fn props(mut self, props: PropertySet) -> Self {
        self.app_props.merge(&props);
        self
    }

    pub fn prop(mut self, name: &str, value: impl Into<crate::query_api::PropertyValue>) -> Self {
        self.app_props.set(name, value);
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn json_payload<T: Serialize>(mut self, value: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_vec(value)?);
        Ok(self)
    }

    pub fn signature(mut self, signature: Vec<u8>) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    /// How long the item stays current. Omitted means it never expires.
    pub fn lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    pub fn seal(self, now: DateTime<Utc>) -> VersionedItem {
        let created = now;
        let expires = match self.lifetime {
            None => DateTime::<Utc>::MAX_UTC,
            Some(lifetime) => {
                let lifetime = lifetime.max(Duration::zero());
                created
                    .checked_add_signed(lifetime)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            }
        };
        let payload_hash = self.payload.as_deref().map(hash_payload);
        VersionedItem {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            item_kind: self.item_kind,
            name: self.name,
            app_scope: self.app_scope,
            data_type_name: self.data_type_name,
            app_props: self.app_props,
            sys_props: self.sys_props,
            payload: self.payload.map(Arc::new),
            payload_hash,
            signature: self.signature,
            created,
            expires,
            transient: self.transient,
            store_usn: 0,
        }
    }
}

#[derive(Debug)]
struct ItemRefState {
    changed: DateTime<Utc>,
    item: Option<Arc<VersionedItem>>,
    persisted: bool,
}

/// Index cell wrapping an item. Tombstoning clears the item while the cell
/// keeps its identity and change time, which retention decisions run on.
#[derive(Debug)]
pub struct ItemRef {
    state: Mutex<ItemRefState>,
}

impl ItemRef {
    pub fn new(item: Arc<VersionedItem>, persisted: bool, now: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(ItemRefState {
                changed: now,
                item: Some(item),
                persisted,
            }),
        }
    }

    pub fn item(&self) -> Option<Arc<VersionedItem>> {
        self.state.lock().unwrap().item.clone()
    }

    pub fn is_tombstone(&self) -> bool {
        self.state.lock().unwrap().item.is_none()
    }

    pub fn persisted(&self) -> bool {
        self.state.lock().unwrap().persisted
    }

    pub fn changed(&self) -> DateTime<Utc> {
        self.state.lock().unwrap().changed
    }

    pub fn mark_persisted(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        if state.persisted {
            return;
        }
        state.persisted = true;
        state.changed = now;
    }

    /// Clear the payload-bearing item, leaving a tombstone.
    pub fn tombstone(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        state.item = None;
        state.changed = now;
    }

    /// Swap the item in place without touching the change time or the
    /// persisted flag. Used by payload deduplication only.
    pub(crate) fn replace_item(&self, item: Arc<VersionedItem>) {
        self.state.lock().unwrap().item = Some(item);
    }
}
