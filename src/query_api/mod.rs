// SPDX-License-Identifier: MIT OR Apache-2.0

// src/query_api/mod.rs

pub mod expression;
pub mod properties;

pub use self::expression::{CompareOp, ExprContext, ExprError, Expression};
pub use self::properties::{PropertySet, PropertyValue};
