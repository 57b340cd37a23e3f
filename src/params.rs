//! # Parameter Generator — Bind Values per Operation
//!
//! Produces the positional bind list for one operation from the pools, the
//! table profile, and the worker's position in the run.
//!
//! ## Cursor Stride
//!
//! Each worker keeps a counter per (pool kind, column). The pool index for
//! draw `n` is `(n * stride + worker_id) % len` where `stride` is the run
//! concurrency (times the worker-group count on multi-node runs). Workers
//! therefore traverse nearly disjoint key subsets early in a run; a shared
//! sequential walk previously produced backend result-cache hit rates high
//! enough to corrupt P95 readings.
//!
//! ## Fallback ladder
//!
//! Pool value → profile-derived random value → capability error. An
//! enabled kind that reaches the bottom of the ladder fails its operation
//! with a clear error; it never silently produces garbage SQL.

use crate::error::EngineError;
use crate::pools::{PoolKind, Value, ValuePools};
use crate::profile::TableProfile;
use crate::scenario::Scenario;
use crate::Kind;
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

fn decimal_scale_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\((\d+)\s*,\s*(\d+)\)").expect("static regex"))
}

fn string_len_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:VARCHAR|CHAR|CHARACTER|TEXT|STRING)\s*\(\s*(\d+)\s*\)")
            .expect("static regex")
    })
}

fn insert_form_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?is)\binsert\s+into\s+.+?\(\s*(?P<cols>.*?)\s*\)\s*values\s*\(\s*(?P<vals>.*?)\s*\)",
        )
        .expect("static regex")
    })
}

pub struct ParamGenerator {
    worker_id: u32,
    stride: u32,
    cursors: HashMap<(PoolKind, String), u64>,
    /// Monotonic insert-id sequence shared by all workers of a run, rooted
    /// at `id_max + 1`. Concurrent runs against one table are uncoordinated.
    next_insert_id: Arc<AtomicI64>,
}

impl ParamGenerator {
    pub fn new(worker_id: u32, stride: u32, next_insert_id: Arc<AtomicI64>) -> ParamGenerator {
        ParamGenerator {
            worker_id,
            stride: stride.max(1),
            cursors: HashMap::new(),
            next_insert_id,
        }
    }

    /// Next pool value for (kind, column) under this worker's strided walk.
    pub fn next_from_pool(
        &mut self,
        kind: PoolKind,
        column: &str,
        pools: &ValuePools,
    ) -> Option<Value> {
        let values = match kind {
            PoolKind::Key => pools.key_values(column),
            PoolKind::Range => pools.range_values(column),
            PoolKind::Row => return None,
        };
        if values.is_empty() {
            return None;
        }
        let n = self
            .cursors
            .entry((kind, column.to_uppercase()))
            .or_insert(0);
        let idx = (*n as usize)
            .wrapping_mul(self.stride as usize)
            .wrapping_add(self.worker_id as usize)
            % values.len();
        *n += 1;
        Some(values[idx].clone())
    }

    fn next_row<'p>(
        &mut self,
        pools: &'p ValuePools,
    ) -> Option<&'p std::collections::BTreeMap<String, Value>> {
        let rows = pools.rows();
        if rows.is_empty() {
            return None;
        }
        let n = self.cursors.entry((PoolKind::Row, String::new())).or_insert(0);
        let idx = (*n as usize)
            .wrapping_mul(self.stride as usize)
            .wrapping_add(self.worker_id as usize)
            % rows.len();
        *n += 1;
        Some(&rows[idx])
    }

    /// Choose a key value: KEY pool first, else a uniform random id from the
    /// profiled bounds.
    fn choose_key(
        &mut self,
        profile: &TableProfile,
        pools: &ValuePools,
    ) -> Result<Value, EngineError> {
        let id_column = profile.id_column.as_deref().ok_or_else(|| {
            EngineError::Capability("cannot choose key value: table has no id column".into())
        })?;
        if let Some(v) = self.next_from_pool(PoolKind::Key, id_column, pools) {
            return Ok(v);
        }
        if profile.id_bounds_usable() {
            let (lo, hi) = (profile.id_min.unwrap_or(0), profile.id_max.unwrap_or(0));
            return Ok(Value::Int(rand::rng().random_range(lo..=hi)));
        }
        Err(EngineError::Capability(
            "cannot choose key value (missing KEY pool and id bounds)".into(),
        ))
    }

    fn choose_range_cutoff(
        &mut self,
        profile: &TableProfile,
        pools: &ValuePools,
    ) -> Result<Value, EngineError> {
        let time_column = profile.time_column.as_deref().ok_or_else(|| {
            EngineError::Capability(
                "range scan SQL expects a time cutoff but no time column was detected".into(),
            )
        })?;
        if let Some(v) = self.next_from_pool(PoolKind::Range, time_column, pools) {
            return Ok(v);
        }
        if profile.time_bounds_usable() {
            let lo = profile.time_min.unwrap_or_else(Utc::now);
            let hi = profile.time_max.unwrap_or_else(Utc::now);
            let span = (hi - lo).num_milliseconds().max(0);
            let offset = if span > 0 {
                rand::rng().random_range(0..=span)
            } else {
                0
            };
            return Ok(Value::Timestamp(lo + ChronoDuration::milliseconds(offset)));
        }
        Err(EngineError::Capability(
            "cannot choose range cutoff (missing RANGE pool and time bounds)".into(),
        ))
    }

    /// Build the bind list for one operation. `sql` already has `{table}`
    /// substituted.
    pub fn params_for(
        &mut self,
        kind: Kind,
        sql: &str,
        scenario: &Scenario,
        profile: &TableProfile,
        pools: &ValuePools,
    ) -> Result<Vec<Value>, EngineError> {
        match kind {
            Kind::PointLookup => Ok(vec![self.choose_key(profile, pools)?]),
            Kind::RangeScan => {
                if count_placeholders(sql) == 1 {
                    Ok(vec![self.choose_range_cutoff(profile, pools)?])
                } else {
                    // id-based BETWEEN form binds (start, start).
                    let start = self.choose_key(profile, pools)?;
                    Ok(vec![start.clone(), start])
                }
            }
            Kind::Insert => self.insert_params(sql, scenario, profile, pools),
            Kind::Update => self.update_params(sql, scenario, profile, pools),
        }
    }

    fn insert_params(
        &mut self,
        sql: &str,
        scenario: &Scenario,
        profile: &TableProfile,
        pools: &ValuePools,
    ) -> Result<Vec<Value>, EngineError> {
        let ph = count_placeholders(sql);
        if ph == 0 {
            return Err(EngineError::Capability(
                "INSERT SQL must use ? placeholders".into(),
            ));
        }

        let parsed = insert_placeholder_columns(sql);
        let columns: Vec<String> = if parsed.len() == ph {
            parsed
        } else {
            // Fall back to the template's insert_columns ordering, then the
            // profiled column order.
            let advisory: Vec<String> = scenario
                .ai
                .insert_columns
                .iter()
                .map(|c| c.trim().to_uppercase())
                .filter(|c| !c.is_empty())
                .collect();
            let base: Vec<String> = if advisory.is_empty() {
                profile.columns.iter().map(|(c, _)| c.clone()).collect()
            } else {
                advisory
            };
            base.into_iter().take(ph).collect()
        };

        let sample_row = self.next_row(pools).cloned();
        let mut out = Vec::with_capacity(columns.len());
        for col in &columns {
            if profile.id_column.as_deref() == Some(col.as_str()) {
                let col_type = profile.column_type(col).unwrap_or("");
                if is_numeric(col_type) {
                    out.push(Value::Int(self.next_insert_id.fetch_add(1, Ordering::Relaxed)));
                } else {
                    out.push(Value::Text(uuid::Uuid::new_v4().to_string()));
                }
                continue;
            }
            if let Some(v) = sample_row.as_ref().and_then(|r| r.get(col)) {
                out.push(v.clone());
                continue;
            }
            out.push(synthesize_value(profile.column_type(col).unwrap_or("")));
        }
        Ok(out)
    }

    fn update_params(
        &mut self,
        sql: &str,
        scenario: &Scenario,
        profile: &TableProfile,
        pools: &ValuePools,
    ) -> Result<Vec<Value>, EngineError> {
        let key = self.choose_key(profile, pools)?;
        if count_placeholders(sql) == 1 {
            // Degenerate form: WHERE key = ? only.
            return Ok(vec![key]);
        }
        let column = scenario
            .ai
            .update_columns
            .iter()
            .map(|c| c.trim().to_uppercase())
            .find(|c| !c.is_empty())
            .or_else(|| {
                profile
                    .columns
                    .iter()
                    .map(|(c, _)| c.clone())
                    .find(|c| profile.id_column.as_deref() != Some(c.as_str()))
            });
        let new_value = match column {
            Some(col) => synthesize_value(profile.column_type(&col).unwrap_or("")),
            None => Value::Text(short_token(None)),
        };
        Ok(vec![new_value, key])
    }
}

fn is_numeric(sql_type: &str) -> bool {
    let t = sql_type.to_uppercase();
    t.contains("NUMBER") || t.contains("INT") || t.contains("DECIMAL") || t.contains("NUMERIC")
}

/// A short unique-ish string: `T` + the head of a v4 UUID, optionally
/// truncated to a declared varchar length.
fn short_token(max_len: Option<usize>) -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    let mut s = format!("T{}", &raw[..12]);
    if let Some(n) = max_len {
        s.truncate(n);
    }
    s
}

/// Synthesize a value for a column from its declared type.
pub fn synthesize_value(sql_type: &str) -> Value {
    let t = sql_type.to_uppercase();
    if t.contains("TIMESTAMP") {
        return Value::Timestamp(Utc::now());
    }
    if t.contains("DATE") {
        return Value::Date(Utc::now().date_naive());
    }
    if is_numeric(&t) {
        // Honor a declared (precision, scale): keep values small but valid.
        if let Some(caps) = decimal_scale_re().captures(&t) {
            let scale: u32 = caps[2].parse().unwrap_or(0);
            if scale > 0 {
                let factor = 10f64.powi(scale as i32);
                let v = rand::rng().random_range(0.0..1000.0);
                return Value::Float((v * factor).round() / factor);
            }
        }
        return Value::Int(rand::rng().random_range(1..=1_000_000));
    }
    // Strings: respect the declared length.
    let max_len = string_len_re()
        .captures(&t)
        .and_then(|c| c[1].parse::<usize>().ok())
        .filter(|n| *n > 0);
    if max_len == Some(1) {
        let letter = (b'A' + rand::rng().random_range(0..26u8)) as char;
        return Value::Text(letter.to_string());
    }
    Value::Text(short_token(max_len))
}

/// Count `?` placeholders outside single-quoted literals.
pub fn count_placeholders(sql: &str) -> usize {
    let mut count = 0;
    let mut in_quote = false;
    for ch in sql.chars() {
        match ch {
            '\'' => in_quote = !in_quote,
            '?' if !in_quote => count += 1,
            _ => {}
        }
    }
    count
}

/// Column names in `?`-placeholder order from an
/// `INSERT INTO t (col, …) VALUES (expr, …)` statement. Columns whose value
/// expression contains no placeholder are skipped; an expression with
/// several placeholders repeats its column. Returns empty when the SQL
/// doesn't match the form or the lists disagree in length.
pub fn insert_placeholder_columns(sql: &str) -> Vec<String> {
    let Some(caps) = insert_form_re().captures(sql) else {
        return Vec::new();
    };
    let cols: Vec<String> = split_top_level_csv(&caps["cols"])
        .into_iter()
        .map(|c| clean_identifier(&c))
        .collect();
    let vals = split_top_level_csv(&caps["vals"]);
    if cols.is_empty() || cols.len() != vals.len() {
        return Vec::new();
    }
    let mut out = Vec::new();
    for (col, expr) in cols.iter().zip(vals.iter()) {
        for _ in 0..count_placeholders(expr) {
            out.push(col.clone());
        }
    }
    out
}

/// Split on top-level commas, honoring single-quoted literals and nested
/// parentheses.
fn split_top_level_csv(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut depth: i32 = 0;
    let mut in_quote = false;
    for ch in s.chars() {
        if in_quote {
            cur.push(ch);
            if ch == '\'' {
                in_quote = false;
            }
            continue;
        }
        match ch {
            '\'' => {
                in_quote = true;
                cur.push(ch);
            }
            '(' => {
                depth += 1;
                cur.push(ch);
            }
            ')' => {
                depth = (depth - 1).max(0);
                cur.push(ch);
            }
            ',' if depth == 0 => {
                let token = cur.trim().to_string();
                if !token.is_empty() {
                    out.push(token);
                }
                cur.clear();
            }
            _ => cur.push(ch),
        }
    }
    let tail = cur.trim().to_string();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

fn clean_identifier(token: &str) -> String {
    let t = token.trim();
    let t = t.strip_prefix('"').and_then(|s| s.strip_suffix('"')).unwrap_or(t);
    t.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TemplateConfig;
    use std::collections::BTreeMap;

    fn profile_with_bounds() -> TableProfile {
        TableProfile {
            id_column: Some("ID".into()),
            id_min: Some(1),
            id_max: Some(1000),
            time_column: Some("TS".into()),
            time_min: Some("2024-01-01T00:00:00Z".parse().unwrap()),
            time_max: Some("2024-06-01T00:00:00Z".parse().unwrap()),
            columns: vec![
                ("ID".into(), "NUMBER(38,0)".into()),
                ("DATA".into(), "VARCHAR(255)".into()),
                ("TS".into(), "TIMESTAMP_NTZ".into()),
            ],
            required_columns: vec!["ID".into()],
        }
    }

    fn scenario() -> Scenario {
        let cfg: TemplateConfig = serde_json::from_value(serde_json::json!({
            "workload_type": "CUSTOM",
            "custom_point_lookup_pct": 25,
            "custom_range_scan_pct": 25,
            "custom_insert_pct": 35,
            "custom_update_pct": 15,
            "custom_point_lookup_query": "SELECT * FROM {table} WHERE ID = ?",
            "custom_range_scan_query": "SELECT * FROM {table} WHERE TS >= ? LIMIT 100",
            "custom_insert_query": "INSERT INTO {table} (ID, DATA, TS) VALUES (?, ?, ?)",
            "custom_update_query": "UPDATE {table} SET DATA = ? WHERE ID = ?",
            "database": "D", "schema": "S", "table_name": "T",
            "concurrent_connections": 4
        }))
        .unwrap();
        Scenario::from_template(&cfg).unwrap()
    }

    fn key_pool(n: i64) -> ValuePools {
        let mut pools = ValuePools::empty();
        for i in 0..n {
            pools.push_key("ID", Value::Int(i));
        }
        pools
    }

    #[test]
    fn cursor_walk_is_disjoint_across_workers_before_wraparound() {
        // Pool of length 100, concurrency 4: the first 25 draws of each
        // worker must all be distinct values.
        let pools = key_pool(100);
        let seq = Arc::new(AtomicI64::new(1));
        let mut seen = std::collections::HashSet::new();
        for worker_id in 0..4u32 {
            let mut generator = ParamGenerator::new(worker_id, 4, seq.clone());
            for _ in 0..25 {
                let v = generator
                    .next_from_pool(PoolKind::Key, "ID", &pools)
                    .unwrap();
                assert!(seen.insert(format!("{v}")), "duplicate draw {v}");
            }
        }
        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn cursor_wraps_modulo_pool_length() {
        let pools = key_pool(10);
        let seq = Arc::new(AtomicI64::new(1));
        let mut generator = ParamGenerator::new(1, 4, seq);
        let first = generator.next_from_pool(PoolKind::Key, "ID", &pools).unwrap();
        for _ in 0..9 {
            generator.next_from_pool(PoolKind::Key, "ID", &pools).unwrap();
        }
        // 10 draws with stride 4 over length 10 revisit the start cell
        // after len/gcd(stride,len) = 5 distinct cells; just verify we
        // never panic and values stay in range.
        assert!(matches!(first, Value::Int(i) if (0..10).contains(&i)));
    }

    #[test]
    fn point_lookup_uses_pool_then_bounds() {
        let scenario = scenario();
        let profile = profile_with_bounds();
        let seq = Arc::new(AtomicI64::new(1001));

        let pools = key_pool(5);
        let mut generator = ParamGenerator::new(0, 1, seq.clone());
        let params = generator
            .params_for(Kind::PointLookup, "SELECT 1 WHERE ID = ?", &scenario, &profile, &pools)
            .unwrap();
        assert_eq!(params, vec![Value::Int(0)]);

        // Empty pool falls back to the profiled id range.
        let mut generator = ParamGenerator::new(0, 1, seq);
        let params = generator
            .params_for(
                Kind::PointLookup,
                "SELECT 1 WHERE ID = ?",
                &scenario,
                &profile,
                &ValuePools::empty(),
            )
            .unwrap();
        match &params[0] {
            Value::Int(i) => assert!((1..=1000).contains(i)),
            other => panic!("expected int key, got {other:?}"),
        }
    }

    #[test]
    fn point_lookup_without_keys_is_a_capability_error() {
        let scenario = scenario();
        let profile = TableProfile::default();
        let mut generator = ParamGenerator::new(0, 1, Arc::new(AtomicI64::new(1)));
        let err = generator
            .params_for(
                Kind::PointLookup,
                "SELECT 1 WHERE ID = ?",
                &scenario,
                &profile,
                &ValuePools::empty(),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::Capability(_)));
    }

    #[test]
    fn range_scan_two_placeholders_binds_start_twice() {
        let scenario = scenario();
        let profile = profile_with_bounds();
        let mut generator = ParamGenerator::new(0, 1, Arc::new(AtomicI64::new(1)));
        let params = generator
            .params_for(
                Kind::RangeScan,
                "SELECT 1 WHERE ID BETWEEN ? AND ?",
                &scenario,
                &profile,
                &ValuePools::empty(),
            )
            .unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0], params[1]);
    }

    #[test]
    fn range_scan_single_placeholder_uses_time_cutoff() {
        let scenario = scenario();
        let profile = profile_with_bounds();
        let mut generator = ParamGenerator::new(0, 1, Arc::new(AtomicI64::new(1)));
        let params = generator
            .params_for(
                Kind::RangeScan,
                "SELECT 1 WHERE TS >= ?",
                &scenario,
                &profile,
                &ValuePools::empty(),
            )
            .unwrap();
        match &params[0] {
            Value::Timestamp(ts) => {
                assert!(*ts >= profile.time_min.unwrap());
                assert!(*ts <= profile.time_max.unwrap());
            }
            other => panic!("expected timestamp cutoff, got {other:?}"),
        }
    }

    #[test]
    fn insert_ids_are_monotonic_across_workers() {
        let scenario = scenario();
        let profile = profile_with_bounds();
        let seq = Arc::new(AtomicI64::new(1001));
        let sql = "INSERT INTO T (ID, DATA, TS) VALUES (?, ?, ?)";

        let mut a = ParamGenerator::new(0, 2, seq.clone());
        let mut b = ParamGenerator::new(1, 2, seq.clone());
        let pa = a
            .params_for(Kind::Insert, sql, &scenario, &profile, &ValuePools::empty())
            .unwrap();
        let pb = b
            .params_for(Kind::Insert, sql, &scenario, &profile, &ValuePools::empty())
            .unwrap();
        assert_eq!(pa[0], Value::Int(1001));
        assert_eq!(pb[0], Value::Int(1002));
        assert_eq!(pa.len(), 3);
        // DATA synthesized as text, TS as timestamp.
        assert!(matches!(pa[1], Value::Text(_)));
        assert!(matches!(pa[2], Value::Timestamp(_)));
    }

    #[test]
    fn insert_prefers_row_pool_values() {
        let scenario = scenario();
        let profile = profile_with_bounds();
        let mut pools = ValuePools::empty();
        let mut row = BTreeMap::new();
        row.insert("DATA".to_string(), Value::Text("pooled".into()));
        pools.push_row(row);

        let mut generator = ParamGenerator::new(0, 1, Arc::new(AtomicI64::new(1)));
        let params = generator
            .params_for(
                Kind::Insert,
                "INSERT INTO T (ID, DATA, TS) VALUES (?, ?, ?)",
                &scenario,
                &profile,
                &pools,
            )
            .unwrap();
        assert_eq!(params[1], Value::Text("pooled".into()));
    }

    #[test]
    fn update_binds_new_value_then_key() {
        let scenario = scenario();
        let profile = profile_with_bounds();
        let mut generator = ParamGenerator::new(0, 1, Arc::new(AtomicI64::new(1)));
        let params = generator
            .params_for(
                Kind::Update,
                "UPDATE T SET DATA = ? WHERE ID = ?",
                &scenario,
                &profile,
                &ValuePools::empty(),
            )
            .unwrap();
        assert_eq!(params.len(), 2);
        assert!(matches!(params[0], Value::Text(_)));
        assert!(matches!(params[1], Value::Int(_)));
    }

    #[test]
    fn update_degenerate_form_binds_key_only() {
        let scenario = scenario();
        let profile = profile_with_bounds();
        let mut generator = ParamGenerator::new(0, 1, Arc::new(AtomicI64::new(1)));
        let params = generator
            .params_for(
                Kind::Update,
                "UPDATE T SET TS = CURRENT_TIMESTAMP WHERE ID = ?",
                &scenario,
                &profile,
                &ValuePools::empty(),
            )
            .unwrap();
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn placeholder_count_skips_quoted_text() {
        assert_eq!(count_placeholders("SELECT '?' FROM t WHERE a = ?"), 1);
        assert_eq!(count_placeholders("INSERT INTO t VALUES (?, ?, '??')"), 2);
        assert_eq!(count_placeholders("SELECT 1"), 0);
    }

    #[test]
    fn insert_columns_parse_in_placeholder_order() {
        let cols = insert_placeholder_columns(
            "INSERT INTO D.S.T (\"ID\", DATA, TS) VALUES (?, ?, CURRENT_TIMESTAMP)",
        );
        assert_eq!(cols, vec!["ID".to_string(), "DATA".to_string()]);
    }

    #[test]
    fn insert_columns_handle_nested_exprs_and_quotes() {
        let cols = insert_placeholder_columns(
            "insert into t (A, B, C) values (coalesce(?, 0), 'lit,eral', ?)",
        );
        assert_eq!(cols, vec!["A".to_string(), "C".to_string()]);
    }

    #[test]
    fn insert_columns_empty_on_mismatch() {
        assert!(insert_placeholder_columns("UPDATE t SET a = ?").is_empty());
    }

    #[test]
    fn synthesized_values_respect_declared_types() {
        assert!(matches!(synthesize_value("TIMESTAMP_NTZ"), Value::Timestamp(_)));
        assert!(matches!(synthesize_value("DATE"), Value::Date(_)));
        assert!(matches!(synthesize_value("NUMBER(38,0)"), Value::Int(_)));
        match synthesize_value("NUMBER(10,2)") {
            Value::Float(f) => {
                let scaled = f * 100.0;
                assert!((scaled - scaled.round()).abs() < 1e-6, "scale not honored: {f}");
            }
            other => panic!("expected float for scaled decimal, got {other:?}"),
        }
        match synthesize_value("VARCHAR(5)") {
            Value::Text(s) => assert!(s.len() <= 5),
            other => panic!("expected text, got {other:?}"),
        }
        match synthesize_value("CHAR(1)") {
            Value::Text(s) => assert_eq!(s.len(), 1),
            other => panic!("expected single char, got {other:?}"),
        }
    }
}
