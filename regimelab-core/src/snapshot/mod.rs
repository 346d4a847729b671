//! Indicator snapshots: the per-bar view of precomputed indicator values.
//!
//! Indicators are computed outside the engine. The engine only sees one
//! immutable snapshot per bar (merged across timeframes by [`align`]) plus a
//! bounded window of earlier snapshots ([`history`]) for functions that need
//! the previous bar or a rolling window.

pub mod align;
pub mod history;

pub use align::{SnapshotAligner, TimeframeFeed};
pub use history::SnapshotHistory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One indicator's output on one bar: a primary value plus optional named
/// sub-fields (e.g. MACD `signal` / `histogram`, Bollinger `upper` / `lower`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IndicatorValue {
    pub value: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, f64>,
}

impl IndicatorValue {
    pub fn new(value: f64) -> Self {
        Self {
            value,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Resolve a sub-field; a missing field falls back to the primary value.
    pub fn field(&self, name: Option<&str>) -> f64 {
        match name {
            Some(n) => self.fields.get(n).copied().unwrap_or(self.value),
            None => self.value,
        }
    }
}

/// Mapping indicator-id → value for a single bar.
///
/// Backed by a `BTreeMap` so iteration order (and therefore hashing) is
/// deterministic.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    values: BTreeMap<String, IndicatorValue>,
}

impl IndicatorSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, value: IndicatorValue) {
        self.values.insert(id.into(), value);
    }

    /// Builder-style insert of a plain value.
    pub fn with(mut self, id: impl Into<String>, value: f64) -> Self {
        self.insert(id, IndicatorValue::new(value));
        self
    }

    pub fn get(&self, id: &str) -> Option<&IndicatorValue> {
        self.values.get(id)
    }

    /// Numeric value of `id[field]`, or `None` if the id is absent or the value is NaN.
    pub fn resolve(&self, id: &str, field: Option<&str>) -> Option<f64> {
        self.values
            .get(id)
            .map(|v| v.field(field))
            .filter(|v| !v.is_nan())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.values.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Copy entries from `other` whose ids are not already present.
    pub fn merge_missing(&mut self, other: &IndicatorSnapshot) {
        for (id, value) in &other.values {
            self.values
                .entry(id.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

/// A snapshot stamped with the close time of the bar it describes.
///
/// The timestamp is the earliest instant at which the values may be observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedSnapshot {
    pub close_time: DateTime<Utc>,
    pub snapshot: IndicatorSnapshot,
}
