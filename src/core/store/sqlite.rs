// SPDX-License-Identifier: MIT OR Apache-2.0

// src/core/store/sqlite.rs
// SQLite backing store. One table, id-keyed, property maps stored as JSON
// columns, timestamps as epoch microseconds (the never-expires sentinel is
// far outside the RFC 3339 year range). Insert is an upsert so write-behind
// retries and duplicate queue entries are harmless.

use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::core::item::{ItemKind, VersionedItem};
use crate::core::store::{BackingStore, StoreError};
use crate::query_api::properties::PropertySet;

const CREATE_TABLE_SQL: &str = "
    CREATE TABLE IF NOT EXISTS cache_items (
        id          TEXT PRIMARY KEY,
        item_kind   TEXT NOT NULL,
        name        TEXT NOT NULL,
        app_scope   TEXT NOT NULL,
        data_type   TEXT NOT NULL,
        app_props   TEXT NOT NULL,
        sys_props   TEXT NOT NULL,
        payload     BLOB,
        signature   BLOB,
        created_us  INTEGER NOT NULL,
        expires_us  INTEGER NOT NULL,
        transient   INTEGER NOT NULL,
        store_usn   INTEGER NOT NULL
    )";

const UPSERT_SQL: &str = "
    INSERT INTO cache_items
        (id, item_kind, name, app_scope, data_type, app_props, sys_props,
         payload, signature, created_us, expires_us, transient, store_usn)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
    ON CONFLICT(id) DO UPDATE SET
        item_kind  = excluded.item_kind,
        name       = excluded.name,
        app_scope  = excluded.app_scope,
        data_type  = excluded.data_type,
        app_props  = excluded.app_props,
        sys_props  = excluded.sys_props,
        payload    = excluded.payload,
        signature  = excluded.signature,
        created_us = excluded.created_us,
        expires_us = excluded.expires_us,
        transient  = excluded.transient,
        store_usn  = excluded.store_usn";

#[derive(Debug)]
pub struct SqliteBackingStore {
    conn: Mutex<Connection>,
}

impl SqliteBackingStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute(CREATE_TABLE_SQL, [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn parse_props(id: &str, column: &str, text: &str) -> Result<PropertySet, StoreError> {
        serde_json::from_str(text).map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            message: format!("{column}: {e}"),
        })
    }

    fn parse_time(id: &str, column: &str, micros: i64) -> Result<DateTime<Utc>, StoreError> {
        DateTime::from_timestamp_micros(micros).ok_or_else(|| StoreError::Corrupt {
            id: id.to_string(),
            message: format!("{column}: timestamp {micros} out of range"),
        })
    }
}

impl BackingStore for SqliteBackingStore {
    fn load_all(&self) -> Result<Vec<VersionedItem>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut statement = conn.prepare(
            "SELECT id, item_kind, name, app_scope, data_type, app_props, sys_props,
                    payload, signature, created_us, expires_us, transient, store_usn
             FROM cache_items",
        )?;
        let mut rows = statement.query([])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            let id_text: String = row.get(0)?;
            let id = Uuid::from_str(&id_text).map_err(|e| StoreError::Corrupt {
                id: id_text.clone(),
                message: format!("id: {e}"),
            })?;
            let kind_text: String = row.get(1)?;
            let item_kind = ItemKind::from_str(&kind_text).map_err(|message| StoreError::Corrupt {
                id: id_text.clone(),
                message,
            })?;
            let app_props_text: String = row.get(5)?;
            let sys_props_text: String = row.get(6)?;
            items.push(VersionedItem::from_stored_parts(
                id,
                item_kind,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                Self::parse_props(&id_text, "app_props", &app_props_text)?,
                Self::parse_props(&id_text, "sys_props", &sys_props_text)?,
                row.get(7)?,
                row.get(8)?,
                Self::parse_time(&id_text, "created_us", row.get(9)?)?,
                Self::parse_time(&id_text, "expires_us", row.get(10)?)?,
                row.get(11)?,
                row.get(12)?,
            ));
        }
        Ok(items)
    }

    fn insert(&self, item: &VersionedItem) -> Result<(), StoreError> {
        let app_props = serde_json::to_string(&item.app_props)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let sys_props = serde_json::to_string(&item.sys_props)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            UPSERT_SQL,
            params![
                item.id.to_string(),
                item.item_kind.to_string(),
                item.name,
                item.app_scope,
                item.data_type_name,
                app_props,
                sys_props,
                item.payload_bytes(),
                item.signature,
                item.created.timestamp_micros(),
                item.expires.timestamp_micros(),
                item.transient,
                item.store_usn,
            ],
        )?;
        Ok(())
    }

    fn delete(&self, id: &Uuid) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM cache_items WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::item::ItemBuilder;
    use chrono::Duration;

    fn sample_item(name: &str) -> VersionedItem {
        let mut item = ItemBuilder::new(ItemKind::Object, name)
            .app_scope("Test")
            .data_type("Curve")
            .prop("Currency", "USD")
            .payload(b"payload".to_vec())
            .lifetime(Duration::days(30))
            .seal(Utc::now());
        item.store_usn = 7;
        item
    }

    #[test]
    fn test_upsert_and_load_roundtrip() {
        let store = SqliteBackingStore::open_in_memory().unwrap();
        let item = sample_item("Curve.USD");
        store.insert(&item).unwrap();
        // duplicate insert of the same id is an update, not an error
        store.insert(&item).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        let back = &loaded[0];
        assert_eq!(back.id, item.id);
        assert_eq!(back.name, item.name);
        assert_eq!(back.store_usn, 7);
        assert_eq!(back.app_props.get_str("Currency"), Some("USD"));
        assert_eq!(back.payload_bytes(), Some(&b"payload"[..]));
        assert_eq!(back.payload_hash(), item.payload_hash());
        assert_eq!(back.created.timestamp_micros(), item.created.timestamp_micros());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = SqliteBackingStore::open_in_memory().unwrap();
        let item = sample_item("x");
        store.insert(&item).unwrap();
        store.delete(&item.id).unwrap();
        store.delete(&item.id).unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }
}
