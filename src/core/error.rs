// SPDX-License-Identifier: MIT OR Apache-2.0

// src/core/error.rs

use crate::core::store::StoreError;
use crate::query_api::expression::ExprError;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("expression error: {0}")]
    Expression(#[from] ExprError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid subscription state: {0}")]
    InvalidSubscriptionState(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}
