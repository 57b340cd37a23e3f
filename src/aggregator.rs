//! # Metrics Aggregator — Shared Per-Run Telemetry
//!
//! The single shared-mutable structure of a run. Workers append outcomes,
//! the 1 Hz tick derives QPS, and the controller reads windowed throughput
//! and per-step buckets. One fine-grained mutex guards the hot path
//! (counter increments + reservoir append); snapshot reads take the same
//! mutex briefly to copy state, then compute percentiles on the copy after
//! releasing it.
//!
//! ## Latency Storage
//!
//! - **Reservoir** (bounded ring, cap 10,000, drop-oldest): feeds the live
//!   snapshot percentiles only.
//! - **Summary streams** (unbounded, measurement-phase only): per-kind and
//!   read/write sample vectors the terminal summary is computed from.
//! - **Step buckets**: reset by the FIND_MAX controller at each step start.
//!
//! ## QPS
//!
//! Two readings per tick: an EMA with α = 0.3 for display smoothing, and a
//! trailing-window rate `(ops_now − ops_window_ago) / window` the QPS
//! controller steers on. Peak and average (over the measurement window)
//! ride along.

use crate::resources::ResourceSample;
use crate::run::{Phase, RunStatus};
use crate::snapshot::{
    ConnectionsBlock, CustomMetrics, ErrorsBlock, KindLatency, LatencyBlock, LiveSnapshot,
    OperationsBlock, OpsBlock, ThroughputBlock,
};
use crate::worker::Outcome;
use crate::{Kind, PerKind};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

pub const RESERVOIR_CAP: usize = 10_000;
pub const EMA_ALPHA: f64 = 0.3;
pub const DEFAULT_QPS_WINDOW_SECONDS: f64 = 5.0;

/// Linear-interpolation percentile over a sorted slice. `p` in [0, 100].
/// Empty input reports 0; a single sample is every percentile.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (p / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            if lo == hi {
                sorted[lo]
            } else {
                sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
            }
        }
    }
}

fn sorted_copy(values: &VecDeque<f64>) -> Vec<f64> {
    let mut v: Vec<f64> = values.iter().copied().collect();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    v
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OpCounters {
    pub count: u64,
    pub success: u64,
    pub errors: u64,
    pub total_duration_ms: f64,
}

/// Per-kind metrics captured for one FIND_MAX step.
#[derive(Clone, Debug, Default)]
pub struct KindStepMetrics {
    pub ops: u64,
    pub errors: u64,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub error_rate_pct: Option<f64>,
}

/// Aggregate metrics for one FIND_MAX step window.
#[derive(Clone, Debug, Default)]
pub struct StepMetrics {
    pub ops: u64,
    pub errors: u64,
    pub qps: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub error_rate_pct: f64,
    pub by_kind: PerKind<KindStepMetrics>,
}

#[derive(Default)]
struct StepBuckets {
    latencies: Vec<f64>,
    by_kind: PerKind<Vec<f64>>,
    ops_by_kind: PerKind<u64>,
    errors_by_kind: PerKind<u64>,
    start_ops: u64,
    start_errors: u64,
}

#[derive(Default)]
struct AggState {
    total_ops: u64,
    successful_ops: u64,
    failed_ops: u64,
    rows_read: u64,
    rows_written: u64,
    by_kind: PerKind<OpCounters>,

    reservoir: VecDeque<f64>,
    reservoir_by_kind: PerKind<VecDeque<f64>>,

    // Measurement-phase summary streams (warmup excluded).
    samples_by_kind: PerKind<Vec<f64>>,
    read_samples: Vec<f64>,
    write_samples: Vec<f64>,

    step: Option<StepBuckets>,

    qps_samples: VecDeque<(Instant, u64)>,
    qps_smoothed: Option<f64>,
    qps_windowed: Option<f64>,
    last_tick: Option<(Instant, u64)>,
    peak_qps: f64,
    avg_qps: f64,
    measurement_started_mono: Option<Instant>,
    measurement_started_wall: Option<DateTime<Utc>>,
}

/// Reservoir copies for cross-publisher percentile union.
#[derive(Clone, Debug, Default)]
pub struct ReservoirSet {
    pub overall: Vec<f64>,
    pub by_kind: PerKind<Vec<f64>>,
}

/// Counter totals copied out of the aggregator for the terminal summary.
pub struct SummaryInputs {
    pub total_ops: u64,
    pub successful_ops: u64,
    pub failed_ops: u64,
    pub rows_read: u64,
    pub rows_written: u64,
    pub by_kind: PerKind<OpCounters>,
    pub samples_by_kind: PerKind<Vec<f64>>,
    pub read_samples: Vec<f64>,
    pub write_samples: Vec<f64>,
    pub reservoir: Vec<f64>,
    pub avg_qps: f64,
    pub measurement_started_wall: Option<DateTime<Utc>>,
}

pub struct Aggregator {
    start: Instant,
    start_wall: DateTime<Utc>,
    window_seconds: f64,
    state: Mutex<AggState>,
    latest_resources: Mutex<ResourceSample>,
    controller_state: Mutex<serde_json::Value>,
    queue_status: Mutex<Option<(u64, u64)>>,
}

impl Aggregator {
    pub fn new(qps_window_seconds: f64) -> Aggregator {
        Aggregator {
            start: Instant::now(),
            start_wall: Utc::now(),
            window_seconds: qps_window_seconds.max(1.0),
            state: Mutex::new(AggState::default()),
            latest_resources: Mutex::new(ResourceSample::default()),
            controller_state: Mutex::new(serde_json::Value::Null),
            queue_status: Mutex::new(None),
        }
    }

    pub fn started_wall(&self) -> DateTime<Utc> {
        self.start_wall
    }

    pub fn elapsed_total_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn elapsed_measurement_seconds(&self) -> f64 {
        self.state
            .lock()
            .unwrap()
            .measurement_started_mono
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Record one outcome. Live counters and the reservoir update in every
    /// phase (the UI keeps moving during warmup); summary streams only once
    /// the measurement window is open and the outcome is not a warmup op.
    pub fn record(&self, outcome: &Outcome) {
        let mut s = self.state.lock().unwrap();
        s.total_ops += 1;
        let kc = s.by_kind.get_mut(outcome.kind);
        kc.count += 1;

        if outcome.success {
            s.successful_ops += 1;
            let kc = s.by_kind.get_mut(outcome.kind);
            kc.success += 1;
            kc.total_duration_ms += outcome.app_elapsed_ms;

            if outcome.kind.is_read() {
                s.rows_read += outcome.rows_returned;
            } else {
                s.rows_written += outcome.rows_affected.unwrap_or(1).max(0) as u64;
            }

            push_bounded(&mut s.reservoir, outcome.app_elapsed_ms);
            push_bounded(
                s.reservoir_by_kind.get_mut(outcome.kind),
                outcome.app_elapsed_ms,
            );

            if !outcome.warmup {
                s.samples_by_kind
                    .get_mut(outcome.kind)
                    .push(outcome.app_elapsed_ms);
                if outcome.kind.is_read() {
                    s.read_samples.push(outcome.app_elapsed_ms);
                } else {
                    s.write_samples.push(outcome.app_elapsed_ms);
                }
            }

            if let Some(step) = s.step.as_mut() {
                step.latencies.push(outcome.app_elapsed_ms);
                step.by_kind.get_mut(outcome.kind).push(outcome.app_elapsed_ms);
                *step.ops_by_kind.get_mut(outcome.kind) += 1;
            }
        } else {
            s.failed_ops += 1;
            s.by_kind.get_mut(outcome.kind).errors += 1;
            if let Some(step) = s.step.as_mut() {
                *step.ops_by_kind.get_mut(outcome.kind) += 1;
                *step.errors_by_kind.get_mut(outcome.kind) += 1;
            }
        }
    }

    /// Open the measurement window: summary counters and the reservoir
    /// reset; the run-level elapsed clock keeps going.
    pub fn measurement_begin(&self) {
        let mut s = self.state.lock().unwrap();
        s.total_ops = 0;
        s.successful_ops = 0;
        s.failed_ops = 0;
        s.rows_read = 0;
        s.rows_written = 0;
        s.by_kind = PerKind::default();
        s.reservoir.clear();
        s.reservoir_by_kind = PerKind::default();
        s.samples_by_kind = PerKind::default();
        s.read_samples.clear();
        s.write_samples.clear();
        s.qps_samples.clear();
        s.qps_smoothed = None;
        s.qps_windowed = None;
        s.last_tick = None;
        s.peak_qps = 0.0;
        s.avg_qps = 0.0;
        s.measurement_started_mono = Some(Instant::now());
        s.measurement_started_wall = Some(Utc::now());
    }

    /// 1 Hz QPS bookkeeping: EMA for display, trailing window for the
    /// controller, peak/avg tracking.
    pub fn tick(&self) {
        let now = Instant::now();
        let mut s = self.state.lock().unwrap();
        let total = s.total_ops;

        if let Some((last_at, last_ops)) = s.last_tick {
            let dt = now.duration_since(last_at).as_secs_f64();
            if dt > 0.0 {
                let instant_qps = (total.saturating_sub(last_ops)) as f64 / dt;
                s.qps_smoothed = Some(match s.qps_smoothed {
                    Some(prev) => EMA_ALPHA * instant_qps + (1.0 - EMA_ALPHA) * prev,
                    None => instant_qps,
                });
                if instant_qps > s.peak_qps {
                    s.peak_qps = instant_qps;
                }
            }
        }
        s.last_tick = Some((now, total));

        s.qps_samples.push_back((now, total));
        let window = self.window_seconds;
        while let Some(&(t, _)) = s.qps_samples.front() {
            if now.duration_since(t).as_secs_f64() > window {
                s.qps_samples.pop_front();
            } else {
                break;
            }
        }
        if s.qps_samples.len() >= 2 {
            let (oldest_t, oldest_ops) = *s.qps_samples.front().unwrap();
            let (newest_t, newest_ops) = *s.qps_samples.back().unwrap();
            let span = newest_t.duration_since(oldest_t).as_secs_f64();
            if span > 0.0 {
                s.qps_windowed = Some((newest_ops.saturating_sub(oldest_ops)) as f64 / span);
            }
        }

        if let Some(started) = s.measurement_started_mono {
            let elapsed = started.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                s.avg_qps = total as f64 / elapsed;
            }
        }
    }

    /// Windowed QPS for controller decisions; falls back to the EMA before
    /// the window has two samples.
    pub fn qps_windowed(&self) -> f64 {
        let s = self.state.lock().unwrap();
        s.qps_windowed.or(s.qps_smoothed).unwrap_or(0.0)
    }

    pub fn totals(&self) -> (u64, u64, u64) {
        let s = self.state.lock().unwrap();
        (s.total_ops, s.successful_ops, s.failed_ops)
    }

    pub fn set_resources(&self, sample: ResourceSample) {
        *self.latest_resources.lock().unwrap() = sample;
    }

    pub fn resources(&self) -> ResourceSample {
        self.latest_resources.lock().unwrap().clone()
    }

    pub fn set_controller_state(&self, state: serde_json::Value) {
        *self.controller_state.lock().unwrap() = state;
    }

    /// Warehouse queue depth `(queued, blocked)` reported by an external
    /// monitor; the FIND_MAX stability check reads it.
    pub fn set_queue_status(&self, queued: u64, blocked: u64) {
        *self.queue_status.lock().unwrap() = Some((queued, blocked));
    }

    pub fn queue_status(&self) -> Option<(u64, u64)> {
        *self.queue_status.lock().unwrap()
    }

    /// Copy of the live reservoir (for cross-publisher union percentiles).
    pub fn reservoir_copy(&self) -> Vec<f64> {
        self.state.lock().unwrap().reservoir.iter().copied().collect()
    }

    /// Overall + per-kind reservoir copies, published alongside snapshots
    /// so a multi-worker run can recompute aggregate percentiles from the
    /// union.
    pub fn reservoir_set(&self) -> ReservoirSet {
        let s = self.state.lock().unwrap();
        ReservoirSet {
            overall: s.reservoir.iter().copied().collect(),
            by_kind: s.reservoir_by_kind.map(|_, r| r.iter().copied().collect()),
        }
    }

    // ── FIND_MAX step buckets ──────────────────────────────────

    pub fn step_begin(&self) {
        let mut s = self.state.lock().unwrap();
        s.step = Some(StepBuckets {
            start_ops: s.total_ops,
            start_errors: s.failed_ops,
            ..StepBuckets::default()
        });
    }

    /// Close the current step and compute its metrics over `elapsed_seconds`.
    pub fn step_end(&self, elapsed_seconds: f64) -> StepMetrics {
        let mut s = self.state.lock().unwrap();
        let Some(step) = s.step.take() else {
            return StepMetrics::default();
        };
        let ops = s.total_ops.saturating_sub(step.start_ops);
        let errors = s.failed_ops.saturating_sub(step.start_errors);
        drop(s);

        let mut sorted = step.latencies;
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let by_kind = step.by_kind.map(|kind, lats| {
            let mut lats = lats.clone();
            lats.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let ops = *step.ops_by_kind.get(kind);
            let errs = *step.errors_by_kind.get(kind);
            KindStepMetrics {
                ops,
                errors: errs,
                p95_ms: (!lats.is_empty()).then(|| percentile(&lats, 95.0)),
                p99_ms: (!lats.is_empty()).then(|| percentile(&lats, 99.0)),
                error_rate_pct: (ops > 0).then(|| errs as f64 / ops as f64 * 100.0),
            }
        });

        StepMetrics {
            ops,
            errors,
            qps: if elapsed_seconds > 0.0 {
                ops as f64 / elapsed_seconds
            } else {
                0.0
            },
            p95_ms: percentile(&sorted, 95.0),
            p99_ms: percentile(&sorted, 99.0),
            error_rate_pct: if ops > 0 {
                errors as f64 / ops as f64 * 100.0
            } else {
                0.0
            },
            by_kind,
        }
    }

    // ── Snapshot / summary assembly ────────────────────────────

    /// Assemble the 1 Hz live snapshot. Counter state is copied under the
    /// lock; percentile sorting happens on the copy.
    pub fn build_snapshot(
        &self,
        phase: Phase,
        status: RunStatus,
        connections: ConnectionsBlock,
    ) -> LiveSnapshot {
        let (
            total_ops,
            failed_ops,
            by_kind,
            reservoir,
            reservoir_by_kind,
            qps_smoothed,
            avg_qps,
            peak_qps,
            rows_read,
            rows_written,
            measurement_started,
        ) = {
            let s = self.state.lock().unwrap();
            (
                s.total_ops,
                s.failed_ops,
                s.by_kind,
                sorted_copy(&s.reservoir),
                s.reservoir_by_kind.map(|_, r| sorted_copy(r)),
                s.qps_smoothed.unwrap_or(0.0),
                s.avg_qps,
                s.peak_qps,
                s.rows_read,
                s.rows_written,
                s.measurement_started_mono,
            )
        };

        let elapsed_total = self.elapsed_total_seconds();
        let elapsed_display = measurement_started
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        let latency_by_kind = Kind::ALL
            .iter()
            .map(|kind| {
                let sorted = reservoir_by_kind.get(*kind);
                (
                    kind.as_str().to_string(),
                    KindLatency {
                        p50: percentile(sorted, 50.0),
                        p95: percentile(sorted, 95.0),
                        p99: percentile(sorted, 99.0),
                        samples: sorted.len(),
                        samples_available: !sorted.is_empty(),
                    },
                )
            })
            .collect();

        let avg_latency = if reservoir.is_empty() {
            0.0
        } else {
            reservoir.iter().sum::<f64>() / reservoir.len() as f64
        };

        let reads = by_kind.get(Kind::PointLookup).count + by_kind.get(Kind::RangeScan).count;
        let writes = by_kind.get(Kind::Insert).count + by_kind.get(Kind::Update).count;

        LiveSnapshot {
            timestamp: Utc::now(),
            phase,
            status,
            elapsed_total_seconds: elapsed_total,
            elapsed_display_seconds: elapsed_display,
            ops: OpsBlock {
                total: total_ops,
                current_per_sec: qps_smoothed,
                avg_per_sec: avg_qps,
                peak_per_sec: peak_qps,
            },
            operations: OperationsBlock {
                reads,
                writes,
                updates: by_kind.get(Kind::Update).count,
                deletes: 0,
            },
            latency: LatencyBlock {
                p50: percentile(&reservoir, 50.0),
                p95: percentile(&reservoir, 95.0),
                p99: percentile(&reservoir, 99.0),
                avg: avg_latency,
            },
            latency_by_kind,
            throughput: ThroughputBlock {
                bytes_per_sec: 0.0,
                rows_per_sec: if elapsed_display > 0.0 {
                    (rows_read + rows_written) as f64 / elapsed_display
                } else {
                    0.0
                },
            },
            errors: ErrorsBlock {
                count: failed_ops,
                rate: if total_ops > 0 {
                    failed_ops as f64 / total_ops as f64
                } else {
                    0.0
                },
            },
            connections,
            custom_metrics: CustomMetrics {
                resources: self.resources(),
                controller: self.controller_state.lock().unwrap().clone(),
            },
        }
    }

    /// Copy everything the terminal summary needs in one lock acquisition.
    pub fn summary_inputs(&self) -> SummaryInputs {
        let s = self.state.lock().unwrap();
        SummaryInputs {
            total_ops: s.total_ops,
            successful_ops: s.successful_ops,
            failed_ops: s.failed_ops,
            rows_read: s.rows_read,
            rows_written: s.rows_written,
            by_kind: s.by_kind,
            samples_by_kind: s.samples_by_kind.map(|_, v| v.clone()),
            read_samples: s.read_samples.clone(),
            write_samples: s.write_samples.clone(),
            reservoir: s.reservoir.iter().copied().collect(),
            avg_qps: s.avg_qps,
            measurement_started_wall: s.measurement_started_wall,
        }
    }
}

fn push_bounded(ring: &mut VecDeque<f64>, value: f64) {
    if ring.len() >= RESERVOIR_CAP {
        ring.pop_front();
    }
    ring.push_back(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn outcome(kind: Kind, success: bool, latency_ms: f64, warmup: bool) -> Outcome {
        Outcome {
            execution_id: Uuid::new_v4(),
            worker_id: 0,
            kind,
            start_ts: Utc::now(),
            end_ts: Utc::now(),
            app_elapsed_ms: latency_ms,
            success,
            error: if success { None } else { Some("boom".into()) },
            rows_returned: if kind.is_read() { 3 } else { 0 },
            rows_affected: if kind.is_read() { None } else { Some(1) },
            warmup,
            query_id: None,
            sql: String::new(),
            server_elapsed_ms: None,
        }
    }

    #[test]
    fn percentile_interpolates_linearly() {
        let sorted = vec![10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&sorted, 0.0), 10.0);
        assert_eq!(percentile(&sorted, 100.0), 40.0);
        assert_eq!(percentile(&sorted, 50.0), 25.0);
        assert!((percentile(&sorted, 95.0) - 38.5).abs() < 1e-9);
    }

    #[test]
    fn percentile_edge_cases() {
        assert_eq!(percentile(&[], 95.0), 0.0);
        assert_eq!(percentile(&[7.5], 50.0), 7.5);
        assert_eq!(percentile(&[7.5], 99.0), 7.5);
    }

    #[test]
    fn counters_conserve_totals() {
        let agg = Aggregator::new(5.0);
        agg.measurement_begin();
        for i in 0..50 {
            agg.record(&outcome(Kind::PointLookup, i % 10 != 0, 5.0, false));
        }
        let (total, ok, failed) = agg.totals();
        assert_eq!(total, 50);
        assert_eq!(ok + failed, total);
        assert_eq!(failed, 5);
    }

    #[test]
    fn warmup_outcomes_feed_live_but_not_summary() {
        let agg = Aggregator::new(5.0);
        agg.record(&outcome(Kind::Insert, true, 4.0, true));
        agg.record(&outcome(Kind::Insert, true, 4.0, false));

        let inputs = agg.summary_inputs();
        // Live counters saw both; the summary stream saw one.
        assert_eq!(inputs.total_ops, 2);
        assert_eq!(inputs.samples_by_kind.get(Kind::Insert).len(), 1);
        assert_eq!(inputs.write_samples.len(), 1);
    }

    #[test]
    fn measurement_begin_resets_summary_counters() {
        let agg = Aggregator::new(5.0);
        for _ in 0..10 {
            agg.record(&outcome(Kind::RangeScan, true, 2.0, true));
        }
        agg.measurement_begin();
        let (total, _, _) = agg.totals();
        assert_eq!(total, 0);
        assert!(agg.summary_inputs().reservoir.is_empty());
    }

    #[test]
    fn reservoir_drops_oldest_at_capacity() {
        let agg = Aggregator::new(5.0);
        for i in 0..(RESERVOIR_CAP + 100) {
            agg.record(&outcome(Kind::PointLookup, true, i as f64, false));
        }
        let reservoir = agg.reservoir_copy();
        assert_eq!(reservoir.len(), RESERVOIR_CAP);
        // The first 100 samples were evicted.
        assert!(reservoir.iter().all(|v| *v >= 100.0));
    }

    #[test]
    fn snapshot_percentiles_are_monotonic() {
        let agg = Aggregator::new(5.0);
        for i in 1..=1000 {
            agg.record(&outcome(Kind::PointLookup, true, i as f64, false));
        }
        let snap = agg.build_snapshot(
            Phase::Measurement,
            RunStatus::Measuring,
            ConnectionsBlock::default(),
        );
        assert!(snap.latency.p50 <= snap.latency.p95);
        assert!(snap.latency.p95 <= snap.latency.p99);
        let kl = &snap.latency_by_kind["POINT_LOOKUP"];
        assert!(kl.samples_available);
        assert!(kl.p50 <= kl.p95 && kl.p95 <= kl.p99);
        let empty = &snap.latency_by_kind["UPDATE"];
        assert!(!empty.samples_available);
        assert_eq!(empty.p95, 0.0);
    }

    #[test]
    fn qps_window_tracks_op_rate() {
        let agg = Aggregator::new(5.0);
        agg.tick();
        for _ in 0..100 {
            agg.record(&outcome(Kind::PointLookup, true, 1.0, false));
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
        agg.tick();
        // 100 ops in ~50 ms → roughly 2000/s. Allow generous slop since
        // the sleep is imprecise under load.
        let qps = agg.qps_windowed();
        assert!(qps > 200.0, "windowed qps {qps}");
    }

    #[test]
    fn step_buckets_isolate_step_metrics() {
        let agg = Aggregator::new(5.0);
        agg.record(&outcome(Kind::PointLookup, true, 99.0, false));

        agg.step_begin();
        for _ in 0..20 {
            agg.record(&outcome(Kind::PointLookup, true, 10.0, false));
        }
        for _ in 0..5 {
            agg.record(&outcome(Kind::Insert, false, 0.0, false));
        }
        let step = agg.step_end(2.0);
        assert_eq!(step.ops, 25);
        assert_eq!(step.errors, 5);
        assert_eq!(step.qps, 12.5);
        assert_eq!(step.error_rate_pct, 20.0);
        // The pre-step 99 ms sample is not in the step buckets.
        assert!(step.p95_ms <= 10.0 + 1e-9);
        let pl = step.by_kind.get(Kind::PointLookup);
        assert_eq!(pl.ops, 20);
        assert_eq!(pl.error_rate_pct, Some(0.0));
        let ins = step.by_kind.get(Kind::Insert);
        assert_eq!(ins.ops, 5);
        assert_eq!(ins.errors, 5);
        assert_eq!(ins.error_rate_pct, Some(100.0));
        assert!(ins.p95_ms.is_none());
    }
}
