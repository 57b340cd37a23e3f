//! # Table Profiler — Schema Discovery for Adaptive Workloads
//!
//! Profiles the target table once at run setup so parameter generation can
//! adapt to unknown schemas: which column is the key, which column carries
//! time, what the id range is, and which columns an INSERT must populate.
//!
//! ## Heuristics
//!
//! - **id column**: an explicit primary key wins; otherwise a numeric
//!   not-null column named `ID` or `*_ID`; otherwise none. The template's
//!   advisory `key_column` is consulted only when no primary key exists.
//! - **time column**: a not-null timestamp/date column matching
//!   `CREATED_AT` / `UPDATED_AT` / `TIMESTAMP` / `*_AT`; otherwise the
//!   advisory `time_column` when it names a real column; otherwise the
//!   first timestamp column; otherwise none.
//!
//! Profiling failure is non-fatal — the run degrades (point lookups and
//! updates fall back to pool keys, then fail per-operation) rather than
//! aborting, unless no enabled kind can execute at all.

use crate::error::EngineError;
use crate::pools::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One column as reported by the backend catalog.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub primary_key: bool,
}

/// Catalog seam: DESCRIBE / information_schema plus MIN-MAX aggregates.
#[async_trait::async_trait]
pub trait TableCatalog: Send + Sync {
    async fn describe(
        &self,
        database: &str,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ColumnInfo>, EngineError>;

    /// `SELECT MIN(col), MAX(col) FROM table` as decoded host values.
    async fn minmax(
        &self,
        table: &str,
        column: &str,
    ) -> Result<(Option<Value>, Option<Value>), EngineError>;
}

/// Immutable profile built once at setup.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TableProfile {
    pub id_column: Option<String>,
    pub id_min: Option<i64>,
    pub id_max: Option<i64>,
    pub time_column: Option<String>,
    pub time_min: Option<DateTime<Utc>>,
    pub time_max: Option<DateTime<Utc>>,
    /// Ordered (column, declared type), uppercase.
    pub columns: Vec<(String, String)>,
    /// Non-nullable columns with no default — every INSERT must cover these.
    pub required_columns: Vec<String>,
}

impl TableProfile {
    pub fn column_type(&self, name: &str) -> Option<&str> {
        let upper = name.to_uppercase();
        self.columns
            .iter()
            .find(|(c, _)| *c == upper)
            .map(|(_, t)| t.as_str())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_type(name).is_some()
    }

    /// Whether random ids can be drawn from `[id_min, id_max]`.
    pub fn id_bounds_usable(&self) -> bool {
        matches!((self.id_min, self.id_max), (Some(lo), Some(hi)) if hi >= lo)
    }

    pub fn time_bounds_usable(&self) -> bool {
        matches!((self.time_min, self.time_max), (Some(lo), Some(hi)) if hi >= lo)
    }
}

fn is_numeric_type(sql_type: &str) -> bool {
    let t = sql_type.to_uppercase();
    t.contains("NUMBER") || t.contains("INT") || t.contains("DECIMAL") || t.contains("NUMERIC")
}

fn is_temporal_type(sql_type: &str) -> bool {
    let t = sql_type.to_uppercase();
    t.contains("TIMESTAMP") || t.contains("DATE")
}

fn pick_id_column(columns: &[ColumnInfo], advisory: Option<&str>) -> Option<String> {
    // An explicit primary key always wins; the advisory hint only breaks
    // ties on tables that have none.
    if let Some(pk) = columns.iter().find(|c| c.primary_key) {
        return Some(pk.name.clone());
    }
    if let Some(hint) = advisory {
        let upper = hint.to_uppercase();
        if columns.iter().any(|c| c.name == upper) {
            return Some(upper);
        }
    }
    columns
        .iter()
        .find(|c| {
            !c.nullable
                && is_numeric_type(&c.sql_type)
                && (c.name == "ID" || c.name.ends_with("_ID"))
        })
        .map(|c| c.name.clone())
}

fn pick_time_column(columns: &[ColumnInfo], advisory: Option<&str>) -> Option<String> {
    let named = columns.iter().find(|c| {
        !c.nullable
            && is_temporal_type(&c.sql_type)
            && (c.name == "CREATED_AT"
                || c.name == "UPDATED_AT"
                || c.name == "TIMESTAMP"
                || c.name.ends_with("_AT"))
    });
    if let Some(c) = named {
        return Some(c.name.clone());
    }
    // No conventionally named column: take the advisory hint, then any
    // timestamp column at all.
    if let Some(hint) = advisory {
        let upper = hint.to_uppercase();
        if columns.iter().any(|c| c.name == upper) {
            return Some(upper);
        }
    }
    columns
        .iter()
        .find(|c| c.sql_type.to_uppercase().contains("TIMESTAMP"))
        .map(|c| c.name.clone())
}

/// Build the profile: DESCRIBE, designate columns, then one MIN/MAX query
/// per designated column. Partial failure degrades the profile instead of
/// failing it.
pub async fn build_profile(
    catalog: &dyn TableCatalog,
    database: &str,
    schema: &str,
    table: &str,
    key_hint: Option<&str>,
    time_hint: Option<&str>,
) -> Result<TableProfile, EngineError> {
    let mut columns = catalog.describe(database, schema, table).await?;
    for c in &mut columns {
        c.name = c.name.to_uppercase();
    }

    let full_name = format!("{database}.{schema}.{table}");
    let id_column = pick_id_column(&columns, key_hint);
    let time_column = pick_time_column(&columns, time_hint);

    let mut profile = TableProfile {
        id_column: id_column.clone(),
        time_column: time_column.clone(),
        columns: columns
            .iter()
            .map(|c| (c.name.clone(), c.sql_type.to_uppercase()))
            .collect(),
        required_columns: columns
            .iter()
            .filter(|c| !c.nullable && c.default.is_none())
            .map(|c| c.name.clone())
            .collect(),
        ..TableProfile::default()
    };

    if let Some(col) = &id_column {
        let numeric = profile.column_type(col).map(is_numeric_type).unwrap_or(false);
        if numeric {
            match catalog.minmax(&full_name, col).await {
                Ok((lo, hi)) => {
                    profile.id_min = lo.and_then(|v| v.as_i64());
                    profile.id_max = hi.and_then(|v| v.as_i64());
                }
                Err(e) => warn!(table = %full_name, column = %col, error = %e,
                    "id MIN/MAX failed; point lookups fall back to pool keys"),
            }
        }
    }

    if let Some(col) = &time_column {
        match catalog.minmax(&full_name, col).await {
            Ok((lo, hi)) => {
                profile.time_min = lo.and_then(|v| v.as_timestamp());
                profile.time_max = hi.and_then(|v| v.as_timestamp());
            }
            Err(e) => warn!(table = %full_name, column = %col, error = %e,
                "time MIN/MAX failed; range scans fall back to pool cutoffs"),
        }
    }

    if profile.id_column.is_some() && !profile.id_bounds_usable() {
        warn!(
            table = %full_name,
            "table has an id column but no usable min/max; key-based kinds degrade to pools"
        );
    }

    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, sql_type: &str, nullable: bool, pk: bool) -> ColumnInfo {
        ColumnInfo {
            name: name.into(),
            sql_type: sql_type.into(),
            nullable,
            default: None,
            primary_key: pk,
        }
    }

    #[test]
    fn primary_key_wins_id_designation() {
        let cols = vec![
            col("ORDER_ID", "NUMBER(38,0)", false, false),
            col("ID", "NUMBER(38,0)", false, true),
        ];
        assert_eq!(pick_id_column(&cols, None).as_deref(), Some("ID"));
    }

    #[test]
    fn id_suffix_heuristic_when_no_pk() {
        let cols = vec![
            col("DATA", "VARCHAR(255)", true, false),
            col("CUSTOMER_ID", "NUMBER(38,0)", false, false),
        ];
        assert_eq!(pick_id_column(&cols, None).as_deref(), Some("CUSTOMER_ID"));
    }

    #[test]
    fn nullable_or_text_id_is_skipped() {
        let cols = vec![
            col("ID", "VARCHAR(36)", false, false),
            col("OTHER_ID", "NUMBER(38,0)", true, false),
        ];
        assert_eq!(pick_id_column(&cols, None), None);
    }

    #[test]
    fn primary_key_outranks_advisory_hint() {
        let cols = vec![
            col("ID", "NUMBER(38,0)", false, true),
            col("SKU", "NUMBER(38,0)", false, false),
        ];
        // A real primary key is authoritative; the hint never displaces it.
        assert_eq!(pick_id_column(&cols, Some("sku")).as_deref(), Some("ID"));
    }

    #[test]
    fn advisory_hint_applies_only_without_a_pk() {
        let cols = vec![
            col("ORDER_ID", "NUMBER(38,0)", false, false),
            col("SKU", "NUMBER(38,0)", false, false),
        ];
        assert_eq!(pick_id_column(&cols, Some("sku")).as_deref(), Some("SKU"));
        // A bogus hint falls through to the name heuristic.
        assert_eq!(
            pick_id_column(&cols, Some("NOPE")).as_deref(),
            Some("ORDER_ID")
        );
    }

    #[test]
    fn time_column_prefers_conventional_names() {
        let cols = vec![
            col("TS", "TIMESTAMP_NTZ", true, false),
            col("CREATED_AT", "TIMESTAMP_NTZ", false, false),
        ];
        assert_eq!(pick_time_column(&cols, None).as_deref(), Some("CREATED_AT"));
        // A hint does not displace a conventionally named column.
        assert_eq!(
            pick_time_column(&cols, Some("ts")).as_deref(),
            Some("CREATED_AT")
        );
    }

    #[test]
    fn time_hint_applies_before_the_first_timestamp_fallback() {
        let cols = vec![
            col("TOUCHED", "TIMESTAMP_NTZ", true, false),
            col("SEEN", "TIMESTAMP_NTZ", true, false),
        ];
        assert_eq!(pick_time_column(&cols, Some("seen")).as_deref(), Some("SEEN"));
        assert_eq!(pick_time_column(&cols, None).as_deref(), Some("TOUCHED"));
    }

    #[test]
    fn first_timestamp_is_time_fallback() {
        let cols = vec![
            col("DATA", "VARCHAR(255)", true, false),
            col("TS", "TIMESTAMP_NTZ", true, false),
        ];
        assert_eq!(pick_time_column(&cols, None).as_deref(), Some("TS"));
    }

    #[test]
    fn bounds_usable_requires_both_ends() {
        let mut p = TableProfile {
            id_min: Some(1),
            ..TableProfile::default()
        };
        assert!(!p.id_bounds_usable());
        p.id_max = Some(1000);
        assert!(p.id_bounds_usable());
        p.id_max = Some(0);
        assert!(!p.id_bounds_usable());
    }

    #[test]
    fn required_columns_exclude_defaults_and_nullables() {
        let cols = vec![
            ColumnInfo {
                name: "ID".into(),
                sql_type: "NUMBER".into(),
                nullable: false,
                default: None,
                primary_key: true,
            },
            ColumnInfo {
                name: "TS".into(),
                sql_type: "TIMESTAMP".into(),
                nullable: false,
                default: Some("CURRENT_TIMESTAMP".into()),
                primary_key: false,
            },
            ColumnInfo {
                name: "DATA".into(),
                sql_type: "VARCHAR".into(),
                nullable: true,
                default: None,
                primary_key: false,
            },
        ];
        let required: Vec<String> = cols
            .iter()
            .filter(|c| !c.nullable && c.default.is_none())
            .map(|c| c.name.clone())
            .collect();
        assert_eq!(required, vec!["ID".to_string()]);
    }
}
