//! # Snapshot & Summary Wire Types
//!
//! The two JSON payloads the engine emits: the 1 Hz [`LiveSnapshot`]
//! published to subscribers while a run is non-terminal, and the single
//! [`RunSummary`] written when a run reaches a terminal state.
//!
//! Field layout is part of the external contract — dashboards and the
//! results store consume these shapes — so additions are fine but renames
//! are not.

use crate::aggregator::percentile;
use crate::controller::FindMaxReport;
use crate::resources::ResourceSample;
use crate::run::{Phase, RunStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OpsBlock {
    pub total: u64,
    pub current_per_sec: f64,
    pub avg_per_sec: f64,
    pub peak_per_sec: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OperationsBlock {
    pub reads: u64,
    pub writes: u64,
    pub updates: u64,
    pub deletes: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LatencyBlock {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub avg: f64,
}

/// Per-kind live percentiles. `samples_available=false` distinguishes "no
/// traffic yet" from a genuine 0 ms reading.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KindLatency {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub samples: usize,
    pub samples_available: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ThroughputBlock {
    pub bytes_per_sec: f64,
    pub rows_per_sec: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ErrorsBlock {
    pub count: u64,
    pub rate: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConnectionsBlock {
    pub active: u32,
    pub target: u32,
    pub idle: u32,
}

/// Extension point carrying the resource sample and the live controller
/// telemetry (mode-specific shape).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CustomMetrics {
    pub resources: ResourceSample,
    pub controller: serde_json::Value,
}

/// One 1 Hz live metrics payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LiveSnapshot {
    pub timestamp: DateTime<Utc>,
    pub phase: Phase,
    pub status: RunStatus,
    /// Seconds since the run started (spans warmup + measurement, for UI
    /// progress bars).
    pub elapsed_total_seconds: f64,
    /// Seconds since the measurement window opened.
    pub elapsed_display_seconds: f64,
    pub ops: OpsBlock,
    pub operations: OperationsBlock,
    pub latency: LatencyBlock,
    pub latency_by_kind: BTreeMap<String, KindLatency>,
    pub throughput: ThroughputBlock,
    pub errors: ErrorsBlock,
    pub connections: ConnectionsBlock,
    pub custom_metrics: CustomMetrics,
}

// ── Terminal summary ───────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct LatencyStats {
    pub min: f64,
    pub avg: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

impl LatencyStats {
    /// Compute from an unsorted sample set. Empty input yields all zeros.
    pub fn from_samples(samples: &[f64]) -> LatencyStats {
        if samples.is_empty() {
            return LatencyStats::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        LatencyStats {
            min: sorted[0],
            avg: sorted.iter().sum::<f64>() / sorted.len() as f64,
            p50: percentile(&sorted, 50.0),
            p90: percentile(&sorted, 90.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
            max: sorted[sorted.len() - 1],
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KindSummary {
    pub count: u64,
    pub success: u64,
    pub errors: u64,
    pub samples: usize,
    pub latency: LatencyStats,
}

/// Where the summary percentiles came from: `durable` (PERCENTILE_CONT on
/// the persisted outcome stream), `memory` (full in-process measurement
/// stream), or `reservoir` (bounded live reservoir — degraded).
pub const PERCENTILE_SOURCE_DURABLE: &str = "durable";
pub const PERCENTILE_SOURCE_MEMORY: &str = "memory";
pub const PERCENTILE_SOURCE_RESERVOIR: &str = "reservoir";

/// The single record emitted when a run reaches COMPLETED / CANCELLED /
/// FAILED.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: uuid::Uuid,
    pub status: RunStatus,
    pub termination_reason: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: f64,

    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub read_operations: u64,
    pub write_operations: u64,
    pub rows_read: u64,
    pub rows_written: u64,
    pub operations_per_second: f64,

    pub overall: LatencyStats,
    pub read: LatencyStats,
    pub write: LatencyStats,
    pub by_kind: BTreeMap<String, KindSummary>,

    pub percentile_source: String,
    /// App-side overhead percentiles (app elapsed minus server elapsed),
    /// present when server-side timings were joined at finalize.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_overhead: Option<LatencyStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub find_max: Option<FindMaxReport>,
    pub durable_sink_degraded: bool,
}
