// SPDX-License-Identifier: MIT OR Apache-2.0

// src/query_api/properties.rs

//! Property values and property sets.
//!
//! Items carry two property maps (application and system). The application
//! map is what query expressions evaluate against, so the value type here
//! defines the whole comparison semantics of the query layer: longs and
//! doubles compare numerically across the two variants, everything else
//! compares within its own variant only.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Str(String),
    Long(i64),
    Double(f64),
    Bool(bool),
    Date(DateTime<Utc>),
}

impl PropertyValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Str(_) => "Str",
            PropertyValue::Long(_) => "Long",
            PropertyValue::Double(_) => "Double",
            PropertyValue::Bool(_) => "Bool",
            PropertyValue::Date(_) => "Date",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric view used for cross-variant comparison.
    pub fn to_number(&self) -> Option<f64> {
        match self {
            PropertyValue::Long(v) => Some(*v as f64),
            PropertyValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Ordering with long/double coercion. `None` when the variants are
    /// not comparable.
    pub fn compare(&self, other: &PropertyValue) -> Option<std::cmp::Ordering> {
        use PropertyValue::*;
        match (self, other) {
            (Str(a), Str(b)) => Some(a.cmp(b)),
            (Long(a), Long(b)) => Some(a.cmp(b)),
            (Bool(a), Bool(b)) => Some(a.cmp(b)),
            (Date(a), Date(b)) => Some(a.cmp(b)),
            _ => match (self.to_number(), other.to_number()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Str(s) => write!(f, "'{s}'"),
            PropertyValue::Long(v) => write!(f, "{v}"),
            PropertyValue::Double(v) => write!(f, "{v}"),
            PropertyValue::Bool(b) => write!(f, "{b}"),
            PropertyValue::Date(d) => write!(f, "{}", d.to_rfc3339()),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Str(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Str(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Long(v as i64)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Long(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Double(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<DateTime<Utc>> for PropertyValue {
    fn from(v: DateTime<Utc>) -> Self {
        PropertyValue::Date(v)
    }
}

/// Named property map attached to every cached item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertySet {
    values: HashMap<String, PropertyValue>,
}

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<PropertyValue>) {
        self.values.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.values.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(PropertyValue::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(PropertyValue::as_i64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(PropertyValue::as_bool)
    }

    pub fn remove(&mut self, name: &str) -> Option<PropertyValue> {
        self.values.remove(name)
    }

    /// Copy every entry of `other` into this set, overwriting collisions.
    pub fn merge(&mut self, other: &PropertySet) {
        for (name, value) in &other.values {
            self.values.insert(name.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Rough wire-size estimate used for page budgeting.
    pub fn estimated_size_bytes(&self) -> usize {
        self.values
            .iter()
            .map(|(name, value)| {
                name.len()
                    + match value {
                        PropertyValue::Str(s) => s.len(),
                        _ => 16,
                    }
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_numeric_coercion_across_variants() {
        let long = PropertyValue::Long(2);
        let double = PropertyValue::Double(2.0);
        assert_eq!(long.compare(&double), Some(Ordering::Equal));
        assert_eq!(
            PropertyValue::Double(1.5).compare(&PropertyValue::Long(2)),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_incomparable_variants() {
        let s = PropertyValue::Str("USD".into());
        let n = PropertyValue::Long(1);
        assert_eq!(s.compare(&n), None);
    }

    #[test]
    fn test_property_set_roundtrip() {
        let mut props = PropertySet::new();
        props.set("Currency", "USD");
        props.set("Notional", 1_000_000i64);
        props.set("Live", true);
        assert_eq!(props.get_str("Currency"), Some("USD"));
        assert_eq!(props.get_i64("Notional"), Some(1_000_000));
        assert_eq!(props.get_bool("Live"), Some(true));

        let json = serde_json::to_string(&props).unwrap();
        let back: PropertySet = serde_json::from_str(&json).unwrap();
        assert_eq!(props, back);
    }
}
