// SPDX-License-Identifier: MIT OR Apache-2.0

// src/query_api/expression.rs

//! Query expression AST and evaluator.
//!
//! Expressions are plain data: a small tagged tree built with the factory
//! constructors below, serialized as JSON. The serialized form is persisted
//! inside subscription recovery records, so variant and field names here
//! are part of the stored format and must stay stable.
//!
//! Evaluation is pure and runs against an [`ExprContext`]: the item's
//! application properties plus the builtin pseudo-properties `ItemName`,
//! `Created` and `Expires`. A comparison against a missing property is
//! false; a comparison between incompatible types is an error, which the
//! subscription layer treats as fatal for that one subscription.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::query_api::properties::{PropertySet, PropertyValue};

pub const PROP_ITEM_NAME: &str = "ItemName";
pub const PROP_CREATED: &str = "Created";
pub const PROP_EXPIRES: &str = "Expires";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        };
        write!(f, "{symbol}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Literal(PropertyValue),
    Prop(String),
    Compare {
        op: CompareOp,
        lhs: Box<Expression>,
        rhs: Box<Expression>,
    },
    And(Vec<Expression>),
    Or(Vec<Expression>),
    Not(Box<Expression>),
    IsNull(Box<Expression>),
    IsNotNull(Box<Expression>),
    StartsWith(Box<Expression>, Box<Expression>),
    EndsWith(Box<Expression>, Box<Expression>),
    Contains(Box<Expression>, Box<Expression>),
}

#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("cannot compare {lhs} with {rhs}")]
    Incomparable {
        lhs: &'static str,
        rhs: &'static str,
    },
    #[error("{context} requires a boolean operand, got {found}")]
    NotBoolean {
        context: &'static str,
        found: &'static str,
    },
    #[error("{context} requires string operands, got {found}")]
    NotString {
        context: &'static str,
        found: &'static str,
    },
    #[error("expression did not evaluate to a boolean")]
    NonBooleanResult,
    #[error("malformed expression: {0}")]
    Malformed(String),
}

/// Evaluation context: one item's matchable surface.
pub struct ExprContext<'a> {
    props: &'a PropertySet,
    item_name: &'a str,
    created: DateTime<Utc>,
    expires: DateTime<Utc>,
}

impl<'a> ExprContext<'a> {
    pub fn new(
        props: &'a PropertySet,
        item_name: &'a str,
        created: DateTime<Utc>,
        expires: DateTime<Utc>,
    ) -> Self {
        Self {
            props,
            item_name,
            created,
            expires,
        }
    }

    fn lookup(&self, name: &str) -> Option<PropertyValue> {
        match name {
            PROP_ITEM_NAME => Some(PropertyValue::Str(self.item_name.to_string())),
            PROP_CREATED => Some(PropertyValue::Date(self.created)),
            PROP_EXPIRES => Some(PropertyValue::Date(self.expires)),
            _ => self.props.get(name).cloned(),
        }
    }
}

impl Expression {
    // factory constructors

    /// The expression that matches every item.
    pub fn all() -> Expression {
        Expression::Literal(PropertyValue::Bool(true))
    }

    pub fn lit(value: impl Into<PropertyValue>) -> Expression {
        Expression::Literal(value.into())
    }

    pub fn prop(name: &str) -> Expression {
        Expression::Prop(name.to_string())
    }

    pub fn compare(op: CompareOp, lhs: Expression, rhs: Expression) -> Expression {
        Expression::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn is_eq(name: &str, value: impl Into<PropertyValue>) -> Expression {
        Self::compare(CompareOp::Eq, Self::prop(name), Self::lit(value))
    }

    pub fn is_ne(name: &str, value: impl Into<PropertyValue>) -> Expression {
        Self::compare(CompareOp::Ne, Self::prop(name), Self::lit(value))
    }

    pub fn is_gtr(name: &str, value: impl Into<PropertyValue>) -> Expression {
        Self::compare(CompareOp::Gt, Self::prop(name), Self::lit(value))
    }

    pub fn is_geq(name: &str, value: impl Into<PropertyValue>) -> Expression {
        Self::compare(CompareOp::Ge, Self::prop(name), Self::lit(value))
    }

    pub fn is_lss(name: &str, value: impl Into<PropertyValue>) -> Expression {
        Self::compare(CompareOp::Lt, Self::prop(name), Self::lit(value))
    }

    pub fn is_leq(name: &str, value: impl Into<PropertyValue>) -> Expression {
        Self::compare(CompareOp::Le, Self::prop(name), Self::lit(value))
    }

    pub fn and(terms: Vec<Expression>) -> Expression {
        Expression::And(terms)
    }

    pub fn or(terms: Vec<Expression>) -> Expression {
        Expression::Or(terms)
    }

    pub fn not(term: Expression) -> Expression {
        Expression::Not(Box::new(term))
    }

    pub fn is_null(name: &str) -> Expression {
        Expression::IsNull(Box::new(Self::prop(name)))
    }

    pub fn is_not_null(name: &str) -> Expression {
        Expression::IsNotNull(Box::new(Self::prop(name)))
    }

    pub fn starts_with(name: &str, prefix: &str) -> Expression {
        Expression::StartsWith(Box::new(Self::prop(name)), Box::new(Self::lit(prefix)))
    }

    pub fn ends_with(name: &str, suffix: &str) -> Expression {
        Expression::EndsWith(Box::new(Self::prop(name)), Box::new(Self::lit(suffix)))
    }

    pub fn contains(name: &str, needle: &str) -> Expression {
        Expression::Contains(Box::new(Self::prop(name)), Box::new(Self::lit(needle)))
    }

    // serialization (the persisted wire form)

    pub fn to_json(&self) -> Result<String, ExprError> {
        serde_json::to_string(self).map_err(|e| ExprError::Malformed(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Expression, ExprError> {
        serde_json::from_str(text).map_err(|e| ExprError::Malformed(e.to_string()))
    }

    // evaluation

    /// Evaluate to a value; `None` means a missing property.
    pub fn evaluate(&self, ctx: &ExprContext<'_>) -> Result<Option<PropertyValue>, ExprError> {
        match self {
            Expression::Literal(value) => Ok(Some(value.clone())),
            Expression::Prop(name) => Ok(ctx.lookup(name)),
            Expression::Compare { op, lhs, rhs } => {
                let lhs = lhs.evaluate(ctx)?;
                let rhs = rhs.evaluate(ctx)?;
                match (lhs, rhs) {
                    // a missing operand matches nothing
                    (None, _) | (_, None) => Ok(Some(PropertyValue::Bool(false))),
                    (Some(lhs), Some(rhs)) => {
                        let ordering =
                            lhs.compare(&rhs).ok_or_else(|| ExprError::Incomparable {
                                lhs: lhs.type_name(),
                                rhs: rhs.type_name(),
                            })?;
                        let matched = match op {
                            CompareOp::Eq => ordering == Ordering::Equal,
                            CompareOp::Ne => ordering != Ordering::Equal,
                            CompareOp::Gt => ordering == Ordering::Greater,
                            CompareOp::Ge => ordering != Ordering::Less,
                            CompareOp::Lt => ordering == Ordering::Less,
                            CompareOp::Le => ordering != Ordering::Greater,
                        };
                        Ok(Some(PropertyValue::Bool(matched)))
                    }
                }
            }
            Expression::And(terms) => {
                for term in terms {
                    if !term.evaluate_bool(ctx, "And")? {
                        return Ok(Some(PropertyValue::Bool(false)));
                    }
                }
                Ok(Some(PropertyValue::Bool(true)))
            }
            Expression::Or(terms) => {
                for term in terms {
                    if term.evaluate_bool(ctx, "Or")? {
                        return Ok(Some(PropertyValue::Bool(true)));
                    }
                }
                Ok(Some(PropertyValue::Bool(false)))
            }
            Expression::Not(term) => {
                let value = term.evaluate_bool(ctx, "Not")?;
                Ok(Some(PropertyValue::Bool(!value)))
            }
            Expression::IsNull(term) => Ok(Some(PropertyValue::Bool(term.evaluate(ctx)?.is_none()))),
            Expression::IsNotNull(term) => {
                Ok(Some(PropertyValue::Bool(term.evaluate(ctx)?.is_some())))
            }
            Expression::StartsWith(lhs, rhs) => Self::string_test(ctx, lhs, rhs, "StartsWith"),
            Expression::EndsWith(lhs, rhs) => Self::string_test(ctx, lhs, rhs, "EndsWith"),
            Expression::Contains(lhs, rhs) => Self::string_test(ctx, lhs, rhs, "Contains"),
        }
    }

    fn string_test(
        ctx: &ExprContext<'_>,
        lhs: &Expression,
        rhs: &Expression,
        context: &'static str,
    ) -> Result<Option<PropertyValue>, ExprError> {
        let lhs = lhs.evaluate(ctx)?;
        let rhs = rhs.evaluate(ctx)?;
        let (subject, operand) = match (lhs, rhs) {
            (None, _) | (_, None) => return Ok(Some(PropertyValue::Bool(false))),
            (Some(lhs), Some(rhs)) => (lhs, rhs),
        };
        match (&subject, &operand) {
            (PropertyValue::Str(subject), PropertyValue::Str(operand)) => {
                let matched = match context {
                    "StartsWith" => subject.starts_with(operand.as_str()),
                    "EndsWith" => subject.ends_with(operand.as_str()),
                    _ => subject.contains(operand.as_str()),
                };
                Ok(Some(PropertyValue::Bool(matched)))
            }
            _ => Err(ExprError::NotString {
                context,
                found: if subject.as_str().is_none() {
                    subject.type_name()
                } else {
                    operand.type_name()
                },
            }),
        }
    }

    fn evaluate_bool(&self, ctx: &ExprContext<'_>, context: &'static str) -> Result<bool, ExprError> {
        match self.evaluate(ctx)? {
            Some(PropertyValue::Bool(value)) => Ok(value),
            Some(other) => Err(ExprError::NotBoolean {
                context,
                found: other.type_name(),
            }),
            None => Ok(false),
        }
    }

    /// Evaluate as a match predicate. Any non-boolean outcome is an error.
    pub fn matches(&self, ctx: &ExprContext<'_>) -> Result<bool, ExprError> {
        match self.evaluate(ctx)? {
            Some(PropertyValue::Bool(value)) => Ok(value),
            _ => Err(ExprError::NonBooleanResult),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Literal(value) => write!(f, "{value}"),
            Expression::Prop(name) => write!(f, "[{name}]"),
            Expression::Compare { op, lhs, rhs } => write!(f, "({lhs} {op} {rhs})"),
            Expression::And(terms) => {
                let parts: Vec<String> = terms.iter().map(|t| t.to_string()).collect();
                write!(f, "({})", parts.join(" AND "))
            }
            Expression::Or(terms) => {
                let parts: Vec<String> = terms.iter().map(|t| t.to_string()).collect();
                write!(f, "({})", parts.join(" OR "))
            }
            Expression::Not(term) => write!(f, "(NOT {term})"),
            Expression::IsNull(term) => write!(f, "({term} IS NULL)"),
            Expression::IsNotNull(term) => write!(f, "({term} IS NOT NULL)"),
            Expression::StartsWith(lhs, rhs) => write!(f, "StartsWith({lhs}, {rhs})"),
            Expression::EndsWith(lhs, rhs) => write!(f, "EndsWith({lhs}, {rhs})"),
            Expression::Contains(lhs, rhs) => write!(f, "Contains({lhs}, {rhs})"),
        }
    }
}
