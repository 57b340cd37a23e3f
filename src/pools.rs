//! # Value Pools — Persisted Realistic Bind Values
//!
//! Pools are sampled from the target table by the out-of-band template
//! preparation step and loaded once at run start; at run time they are
//! immutable. Three pool kinds exist:
//!
//! | Kind | Contents | Consumed by |
//! |------|----------|-------------|
//! | `KEY` | real key-column values | POINT_LOOKUP, UPDATE, id-form RANGE_SCAN |
//! | `RANGE` | time-column cutoffs | time-form RANGE_SCAN |
//! | `ROW` | whole sampled rows (column → value) | INSERT |
//!
//! Workers walk a pool with a per-worker cursor whose stride equals the run
//! concurrency, so early in a run workers traverse nearly disjoint subsets
//! (a shared walk produced massive backend result-cache hit rates and
//! artificially low tail latencies).

use crate::error::EngineError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// A host-typed bind value decoded from backend-native storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
}

impl Value {
    /// Decode a JSON-encoded pool value into a host value. Strings that
    /// parse as timestamps or dates become temporal values so they bind
    /// correctly against timestamp columns.
    pub fn from_json(v: &serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::from_text(s),
            // Arrays/objects stay as their JSON text form; backends that
            // support variant columns re-parse on bind.
            other => Value::Text(other.to_string()),
        }
    }

    /// Parse a backend-reported text value into a host value. Temporal
    /// strings (RFC 3339 and the space-separated Postgres form, with or
    /// without zone) become timestamps; bare dates become dates.
    pub fn from_text(s: &str) -> Value {
        let t = s.trim();
        if let Ok(ts) = DateTime::parse_from_rfc3339(t) {
            return Value::Timestamp(ts.with_timezone(&Utc));
        }
        if let Ok(ts) = DateTime::parse_from_str(t, "%Y-%m-%d %H:%M:%S%.f%#z") {
            return Value::Timestamp(ts.with_timezone(&Utc));
        }
        for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
            if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(t, fmt) {
                return Value::Timestamp(naive.and_utc());
            }
        }
        if let Ok(d) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
            return Value::Date(d);
        }
        Value::Text(s.to_string())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            Value::Date(d) => d.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc()),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Value::Date(d) => write!(f, "{d}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolKind {
    Key,
    Range,
    Row,
}

impl PoolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PoolKind::Key => "KEY",
            PoolKind::Range => "RANGE",
            PoolKind::Row => "ROW",
        }
    }
}

/// The full pool set for one template, loaded into memory at run start.
/// Column keys are uppercase.
#[derive(Clone, Debug, Default)]
pub struct ValuePools {
    key: HashMap<String, Vec<Value>>,
    range: HashMap<String, Vec<Value>>,
    row: Vec<BTreeMap<String, Value>>,
}

impl ValuePools {
    pub fn empty() -> ValuePools {
        ValuePools::default()
    }

    pub fn push_key(&mut self, column: &str, value: Value) {
        self.key.entry(column.to_uppercase()).or_default().push(value);
    }

    pub fn push_range(&mut self, column: &str, value: Value) {
        self.range.entry(column.to_uppercase()).or_default().push(value);
    }

    pub fn push_row(&mut self, row: BTreeMap<String, Value>) {
        self.row.push(
            row.into_iter()
                .map(|(k, v)| (k.to_uppercase(), v))
                .collect(),
        );
    }

    pub fn key_values(&self, column: &str) -> &[Value] {
        self.key
            .get(&column.to_uppercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn range_values(&self, column: &str) -> &[Value] {
        self.range
            .get(&column.to_uppercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn rows(&self) -> &[BTreeMap<String, Value>] {
        &self.row
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty() && self.range.is_empty() && self.row.is_empty()
    }
}

/// Read-only source of persisted pools, keyed by the template's pool id.
#[async_trait::async_trait]
pub trait ValuePoolStore: Send + Sync {
    async fn load(&self, pool_id: &str) -> Result<ValuePools, EngineError>;
}

/// A store that always returns empty pools (runs fall back to profile-based
/// value generation).
pub struct NoPools;

#[async_trait::async_trait]
impl ValuePoolStore for NoPools {
    async fn load(&self, _pool_id: &str) -> Result<ValuePools, EngineError> {
        Ok(ValuePools::empty())
    }
}

// ── Pool sizing for the preparation step ───────────────────────

pub fn key_pool_size(concurrency: u32) -> usize {
    (5_000usize.max(concurrency as usize * 50)).clamp(1, 1_000_000)
}

pub fn range_pool_size(concurrency: u32) -> usize {
    (2_000usize.max(concurrency as usize * 10)).clamp(1, 1_000_000)
}

pub fn row_pool_size(concurrency: u32) -> usize {
    (2_000usize.max(concurrency as usize * 10)).clamp(1, 100_000)
}
