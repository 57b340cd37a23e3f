//! # Template Config — Benchmark Run Input
//!
//! The JSON template a run is planned from. Templates arrive pre-normalized:
//! preset workloads have already been rewritten to `CUSTOM` with explicit
//! weights and SQL by the template layer, so the engine rejects anything
//! else at the door.
//!
//! ## Validation Rules
//!
//! - `workload_type` must be `CUSTOM`.
//! - The four `custom_*_pct` weights are non-negative and sum to exactly 100.
//! - Each kind with weight > 0 carries a non-empty SQL template containing
//!   exactly one `{table}` token.
//! - `database` / `schema` / `table_name` match `^[A-Z0-9_]+$`.
//! - `concurrent_connections ≥ 1` (`≥ min_connections` in QPS mode) and at
//!   most the `LOADMARK_MAX_WORKERS` hard ceiling.
//! - QPS mode requires a positive `target_qps`.

use crate::error::EngineError;
use crate::{Kind, PerKind};
use serde::{Deserialize, Serialize};

/// Hard ceiling on configured concurrency; overridable via env.
pub const MAX_WORKERS_ENV: &str = "LOADMARK_MAX_WORKERS";
pub const DEFAULT_MAX_WORKERS: u32 = 500;

/// Target table flavor. The engine only cares about which backend dialect
/// the table lives in; everything else is advisory metadata.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableType {
    #[default]
    Standard,
    Hybrid,
    Interactive,
    Postgres,
    SnowflakePostgres,
}

impl TableType {
    pub fn is_postgres(self) -> bool {
        matches!(self, TableType::Postgres | TableType::SnowflakePostgres)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadMode {
    #[default]
    Concurrency,
    Qps,
    FindMaxConcurrency,
}

/// Scaling bounds used by the QPS controller.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ScalingConfig {
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_min_connections() -> u32 {
    1
}

/// Advisory workload metadata persisted alongside the template by the
/// preparation step. Everything here is optional hints, never required.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AiWorkload {
    #[serde(default)]
    pub pool_id: Option<String>,
    #[serde(default)]
    pub insert_columns: Vec<String>,
    #[serde(default)]
    pub update_columns: Vec<String>,
    #[serde(default)]
    pub projection_columns: Vec<String>,
    #[serde(default)]
    pub key_column: Option<String>,
    #[serde(default)]
    pub time_column: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub workload_type: String,

    #[serde(default)]
    pub custom_point_lookup_pct: u32,
    #[serde(default)]
    pub custom_range_scan_pct: u32,
    #[serde(default)]
    pub custom_insert_pct: u32,
    #[serde(default)]
    pub custom_update_pct: u32,

    #[serde(default)]
    pub custom_point_lookup_query: Option<String>,
    #[serde(default)]
    pub custom_range_scan_query: Option<String>,
    #[serde(default)]
    pub custom_insert_query: Option<String>,
    #[serde(default)]
    pub custom_update_query: Option<String>,

    pub database: String,
    pub schema: String,
    pub table_name: String,
    #[serde(default)]
    pub table_type: TableType,

    #[serde(default = "default_duration")]
    pub duration: u64,
    #[serde(default)]
    pub warmup: u64,
    #[serde(default = "default_concurrency")]
    pub concurrent_connections: u32,
    #[serde(default)]
    pub load_mode: LoadMode,
    #[serde(default)]
    pub target_qps: Option<f64>,
    #[serde(default)]
    pub scaling: Option<ScalingConfig>,
    #[serde(default = "default_true")]
    pub use_cached_result: bool,
    #[serde(default)]
    pub think_time_ms: u64,
    #[serde(default)]
    pub collect_query_history: bool,

    // Per-kind SLO targets (enabled when positive; error-rate targets are
    // enabled when >= 0).
    #[serde(default)]
    pub target_point_lookup_p95_latency_ms: Option<f64>,
    #[serde(default)]
    pub target_point_lookup_p99_latency_ms: Option<f64>,
    #[serde(default)]
    pub target_point_lookup_error_rate_pct: Option<f64>,
    #[serde(default)]
    pub target_range_scan_p95_latency_ms: Option<f64>,
    #[serde(default)]
    pub target_range_scan_p99_latency_ms: Option<f64>,
    #[serde(default)]
    pub target_range_scan_error_rate_pct: Option<f64>,
    #[serde(default)]
    pub target_insert_p95_latency_ms: Option<f64>,
    #[serde(default)]
    pub target_insert_p99_latency_ms: Option<f64>,
    #[serde(default)]
    pub target_insert_error_rate_pct: Option<f64>,
    #[serde(default)]
    pub target_update_p95_latency_ms: Option<f64>,
    #[serde(default)]
    pub target_update_p99_latency_ms: Option<f64>,
    #[serde(default)]
    pub target_update_error_rate_pct: Option<f64>,

    // Resource guardrails; a run that exceeds either ceiling stops FAILED.
    #[serde(default)]
    pub max_host_cpu_pct: Option<f64>,
    #[serde(default)]
    pub max_memory_pct: Option<f64>,

    // FIND_MAX_CONCURRENCY step-search settings.
    #[serde(default)]
    pub find_max_start_concurrency: Option<u32>,
    #[serde(default = "default_find_max_increment")]
    pub find_max_increment: u32,
    #[serde(default = "default_find_max_step_duration")]
    pub find_max_step_duration_seconds: u64,
    #[serde(default = "default_qps_drop_pct")]
    pub find_max_qps_drop_pct: f64,
    #[serde(default = "default_latency_rise_pct")]
    pub find_max_latency_rise_pct: f64,
    #[serde(default = "default_max_error_rate_pct")]
    pub find_max_max_error_rate_pct: f64,

    #[serde(default)]
    pub ai_workload: Option<AiWorkload>,
}

fn default_duration() -> u64 {
    60
}

fn default_concurrency() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_find_max_increment() -> u32 {
    2
}

fn default_find_max_step_duration() -> u64 {
    30
}

fn default_qps_drop_pct() -> f64 {
    10.0
}

fn default_latency_rise_pct() -> f64 {
    30.0
}

fn default_max_error_rate_pct() -> f64 {
    5.0
}

impl TemplateConfig {
    pub fn weights(&self) -> PerKind<u32> {
        PerKind([
            self.custom_point_lookup_pct,
            self.custom_range_scan_pct,
            self.custom_insert_pct,
            self.custom_update_pct,
        ])
    }

    pub fn sql_for(&self, kind: Kind) -> Option<&str> {
        let q = match kind {
            Kind::PointLookup => &self.custom_point_lookup_query,
            Kind::RangeScan => &self.custom_range_scan_query,
            Kind::Insert => &self.custom_insert_query,
            Kind::Update => &self.custom_update_query,
        };
        q.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    pub fn slo_for(&self, kind: Kind) -> (Option<f64>, Option<f64>, Option<f64>) {
        match kind {
            Kind::PointLookup => (
                self.target_point_lookup_p95_latency_ms,
                self.target_point_lookup_p99_latency_ms,
                self.target_point_lookup_error_rate_pct,
            ),
            Kind::RangeScan => (
                self.target_range_scan_p95_latency_ms,
                self.target_range_scan_p99_latency_ms,
                self.target_range_scan_error_rate_pct,
            ),
            Kind::Insert => (
                self.target_insert_p95_latency_ms,
                self.target_insert_p99_latency_ms,
                self.target_insert_error_rate_pct,
            ),
            Kind::Update => (
                self.target_update_p95_latency_ms,
                self.target_update_p99_latency_ms,
                self.target_update_error_rate_pct,
            ),
        }
    }

    pub fn min_connections(&self) -> u32 {
        self.scaling
            .as_ref()
            .map(|s| s.min_connections.max(1))
            .unwrap_or(1)
    }

    /// The hard worker ceiling from the environment (or the built-in default).
    pub fn hard_max_workers() -> u32 {
        std::env::var(MAX_WORKERS_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_WORKERS)
    }

    /// Validate the template against the engine's entry contract.
    pub fn validate(&self, hard_max_workers: u32) -> Result<(), EngineError> {
        if self.workload_type.trim().to_uppercase() != "CUSTOM" {
            return Err(EngineError::Configuration(format!(
                "workload_type must be CUSTOM at engine entry, got {:?}",
                self.workload_type
            )));
        }

        let ident = regex::Regex::new(r"^[A-Z0-9_]+$").expect("static regex");
        for (field, value) in [
            ("database", &self.database),
            ("schema", &self.schema),
            ("table_name", &self.table_name),
        ] {
            if !ident.is_match(value) {
                return Err(EngineError::Configuration(format!(
                    "{field} must match ^[A-Z0-9_]+$, got {value:?}"
                )));
            }
        }

        let weights = self.weights();
        let total: u32 = Kind::ALL.iter().map(|k| *weights.get(*k)).sum();
        if total != 100 {
            return Err(EngineError::Configuration(format!(
                "custom workload weights must sum to 100 (currently {total})"
            )));
        }

        for kind in Kind::ALL {
            if *weights.get(kind) == 0 {
                continue;
            }
            let sql = self.sql_for(kind).ok_or_else(|| {
                EngineError::Configuration(format!(
                    "missing SQL for {kind} (weight {})",
                    weights.get(kind)
                ))
            })?;
            let tokens = sql.matches("{table}").count();
            if tokens != 1 {
                return Err(EngineError::Configuration(format!(
                    "{kind} SQL must contain exactly one {{table}} token, found {tokens}"
                )));
            }
        }

        if self.concurrent_connections == 0 {
            return Err(EngineError::Configuration(
                "concurrent_connections must be >= 1".into(),
            ));
        }
        if self.concurrent_connections > hard_max_workers {
            return Err(EngineError::Configuration(format!(
                "concurrent_connections {} exceeds the hard ceiling {hard_max_workers}",
                self.concurrent_connections
            )));
        }

        match self.load_mode {
            LoadMode::Qps => {
                let min = self.min_connections();
                if min > self.concurrent_connections {
                    return Err(EngineError::Configuration(format!(
                        "scaling.min_connections {min} exceeds concurrent_connections {}",
                        self.concurrent_connections
                    )));
                }
                match self.target_qps {
                    Some(q) if q > 0.0 => {}
                    _ => {
                        return Err(EngineError::Configuration(
                            "QPS mode requires a positive target_qps".into(),
                        ))
                    }
                }
            }
            LoadMode::FindMaxConcurrency => {
                if self.find_max_increment == 0 {
                    return Err(EngineError::Configuration(
                        "find_max_increment must be >= 1".into(),
                    ));
                }
            }
            LoadMode::Concurrency => {}
        }

        Ok(())
    }
}
