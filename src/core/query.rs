// SPDX-License-Identifier: MIT OR Apache-2.0

// src/core/query.rs

//! Query descriptor for cache reads and subscription replays.

use chrono::{DateTime, Utc};

use crate::core::item::ItemKind;
use crate::query_api::expression::Expression;

/// Filter plus paging for a cache read. `data_type` routes the scan
/// through the per-type sub-index when present; everything else is pure
/// predicate. An empty scope list matches every scope.
#[derive(Debug, Clone)]
pub struct ItemQuery {
    pub app_scopes: Vec<String>,
    pub item_kind: Option<ItemKind>,
    pub data_type: Option<String>,
    pub expr: Option<Expression>,
    /// Sort key evaluated per item before row-range selection.
    pub order_expr: Option<Expression>,
    /// Only items with a strictly greater sequence number match.
    pub minimum_usn: i64,
    /// Upper sequence bound, used to fence subscription replays off from
    /// the live stream.
    pub maximum_usn: Option<i64>,
    pub as_at_time: DateTime<Utc>,
    pub exclude_deleted: bool,
    pub exclude_data_body: bool,
    pub start_row: usize,
    pub row_count: Option<usize>,
    pub debug: bool,
}

impl ItemQuery {
    pub fn new(as_at_time: DateTime<Utc>) -> Self {
        Self {
            app_scopes: Vec::new(),
            item_kind: None,
            data_type: None,
            expr: None,
            order_expr: None,
            minimum_usn: 0,
            maximum_usn: None,
            as_at_time,
            exclude_deleted: true,
            exclude_data_body: false,
            start_row: 0,
            row_count: None,
            debug: false,
        }
    }

    pub fn with_scopes(mut self, scopes: &[&str]) -> Self {
        self.app_scopes = scopes.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_kind(mut self, kind: ItemKind) -> Self {
        self.item_kind = Some(kind);
        self
    }

    pub fn with_data_type(mut self, data_type: &str) -> Self {
        self.data_type = Some(data_type.to_string());
        self
    }

    pub fn with_expr(mut self, expr: Expression) -> Self {
        self.expr = Some(expr);
        self
    }

    pub fn with_order(mut self, order_expr: Expression) -> Self {
        self.order_expr = Some(order_expr);
        self
    }

    pub fn with_minimum_usn(mut self, minimum_usn: i64) -> Self {
        self.minimum_usn = minimum_usn;
        self
    }

    pub fn with_deleted(mut self) -> Self {
        self.exclude_deleted = false;
        self
    }

    pub fn with_rows(mut self, start_row: usize, row_count: usize) -> Self {
        self.start_row = start_row;
        self.row_count = Some(row_count);
        self
    }
}
