//! # Run Lifecycle — The State Machine Around One Benchmark
//!
//! ```text
//! PREPARED --start--> WARMING_UP --warmup elapsed--> MEASURING
//! MEASURING --duration elapsed--> STOPPING -> PROCESSING -> COMPLETED
//! <any non-terminal> --stop-->      STOPPING -> PROCESSING -> CANCELLED
//! <any non-terminal> --fatal-->     STOPPING -> PROCESSING -> FAILED
//! <any non-terminal> --guardrail--> STOPPING -> PROCESSING -> FAILED
//! ```
//!
//! Transitions are monotonic — a run never returns to an earlier state.
//! Termination always follows the same ordering: stop-signal every worker,
//! await them with a grace timeout (force-abort stragglers), close per-run
//! resources, finalize the durable sink, compute the summary, write the
//! terminal state.
//!
//! On entering MEASURING only the aggregator's *summary* state resets; the
//! 1 Hz snapshot tick runs uninterrupted from start to terminal state so
//! dashboards keep moving through warmup and processing.

use crate::aggregator::Aggregator;
use crate::connection::ConnectionPool;
use crate::controller::{ControlExit, Controller, FindMaxReport, WorkerSet};
use crate::error::EngineError;
use crate::pools::{ValuePoolStore, ValuePools};
use crate::profile::{build_profile, TableCatalog, TableProfile};
use crate::registry::RunRegistry;
use crate::resources::ResourceSampler;
use crate::scenario::Scenario;
use crate::sink::{BulkLoader, DurableSink, DurablePercentiles, FileSink};
use crate::snapshot::{
    ConnectionsBlock, KindSummary, LatencyStats, RunSummary, PERCENTILE_SOURCE_DURABLE,
    PERCENTILE_SOURCE_MEMORY, PERCENTILE_SOURCE_RESERVOIR,
};
use crate::template::LoadMode;
use crate::worker::WorkerContext;
use crate::Kind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Prepared,
    WarmingUp,
    Measuring,
    Stopping,
    Processing,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Prepared => "PREPARED",
            RunStatus::WarmingUp => "WARMING_UP",
            RunStatus::Measuring => "MEASURING",
            RunStatus::Stopping => "STOPPING",
            RunStatus::Processing => "PROCESSING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Cancelled => "CANCELLED",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Cancelled | RunStatus::Failed
        )
    }

    /// Monotonic ordering rank; terminal states share the top rank.
    fn rank(self) -> u8 {
        match self {
            RunStatus::Prepared => 0,
            RunStatus::WarmingUp => 1,
            RunStatus::Measuring => 2,
            RunStatus::Stopping => 3,
            RunStatus::Processing => 4,
            RunStatus::Completed | RunStatus::Cancelled | RunStatus::Failed => 5,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    None,
    Warmup,
    Measurement,
}

/// Why the run left its steady state. First cause wins.
#[derive(Clone, Debug)]
pub enum StopCause {
    DurationElapsed,
    /// FIND_MAX search finished; carries the search's own reason.
    SearchComplete(String),
    External,
    Guardrail(String),
    Fatal(String),
}

impl StopCause {
    fn terminal_status(&self) -> RunStatus {
        match self {
            StopCause::DurationElapsed | StopCause::SearchComplete(_) => RunStatus::Completed,
            StopCause::External => RunStatus::Cancelled,
            StopCause::Guardrail(_) | StopCause::Fatal(_) => RunStatus::Failed,
        }
    }

    fn reason(&self) -> String {
        match self {
            StopCause::DurationElapsed => "duration elapsed".to_string(),
            StopCause::SearchComplete(r) => r.clone(),
            StopCause::External => "stopped by request".to_string(),
            StopCause::Guardrail(r) => r.clone(),
            StopCause::Fatal(r) => format!("fatal: {r}"),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub phase: Phase,
    pub start_ts: Option<DateTime<Utc>>,
    pub warmup_start_ts: Option<DateTime<Utc>>,
    pub measurement_start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
    pub effective_target_concurrency: u32,
    pub termination_reason: Option<String>,
}

/// External collaborators injected into a run. The run owns none of the
/// global state behind these — per the dependency-injection discipline, no
/// process-wide singleton is consulted anywhere in the engine.
pub struct RunDeps {
    pub pool: Arc<dyn ConnectionPool>,
    pub catalog: Option<Arc<dyn TableCatalog>>,
    pub pool_store: Arc<dyn ValuePoolStore>,
    pub sink: Arc<dyn DurableSink>,
    /// The concrete file sink when the durable channel spools to disk;
    /// drives finalize/cleanup.
    pub file_sink: Option<Arc<FileSink>>,
    pub loader: Option<Arc<dyn BulkLoader>>,
    pub registry: Option<Arc<RunRegistry>>,
    pub worker_group_id: u32,
    pub worker_group_count: u32,
    /// Resource sample source for the 1 Hz tick; `None` means the real
    /// sysinfo/cgroup sampler. Taken once by the ticker.
    pub resource_probe: Mutex<Option<Box<dyn crate::resources::ResourceProbe>>>,
}

pub struct Run {
    id: Uuid,
    scenario: Arc<Scenario>,
    deps: RunDeps,
    state: Arc<Mutex<RunState>>,
    aggregator: Arc<Aggregator>,
    run_stop: Arc<AtomicBool>,
    measurement_active: Arc<AtomicBool>,
    ticker_stop: Arc<AtomicBool>,
    stop_cause: Mutex<Option<StopCause>>,
}

impl Run {
    pub fn new(scenario: Scenario, deps: RunDeps) -> Arc<Run> {
        Run::with_id(scenario, deps, Uuid::new_v4())
    }

    /// Build a run under a caller-chosen id (the CLI allocates the id up
    /// front so the spool sink and the results store agree on it).
    pub fn with_id(scenario: Scenario, deps: RunDeps, id: Uuid) -> Arc<Run> {
        let state = RunState {
            run_id: id,
            status: RunStatus::Prepared,
            phase: Phase::None,
            start_ts: None,
            warmup_start_ts: None,
            measurement_start_ts: None,
            end_ts: None,
            effective_target_concurrency: scenario.concurrency,
            termination_reason: None,
        };
        Arc::new(Run {
            id,
            scenario: Arc::new(scenario),
            deps,
            state: Arc::new(Mutex::new(state)),
            aggregator: Arc::new(Aggregator::new(
                crate::aggregator::DEFAULT_QPS_WINDOW_SECONDS,
            )),
            run_stop: Arc::new(AtomicBool::new(false)),
            measurement_active: Arc::new(AtomicBool::new(false)),
            ticker_stop: Arc::new(AtomicBool::new(false)),
            stop_cause: Mutex::new(None),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    pub fn aggregator(&self) -> Arc<Aggregator> {
        self.aggregator.clone()
    }

    pub fn state(&self) -> RunState {
        self.state.lock().unwrap().clone()
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.run_stop.clone()
    }

    /// External stop request. Idempotent; the first cause wins.
    pub fn request_stop(&self) {
        self.flag_stop(StopCause::External);
    }

    fn flag_stop(&self, cause: StopCause) {
        let mut slot = self.stop_cause.lock().unwrap();
        if slot.is_none() {
            info!(run_id = %self.id, reason = %cause.reason(), "stop requested");
            *slot = Some(cause);
        }
        self.run_stop.store(true, Ordering::Relaxed);
    }

    fn stop_cause(&self) -> StopCause {
        self.stop_cause
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(StopCause::External)
    }

    /// Monotonic transition; regressions are a bug and are refused loudly.
    fn transition(&self, status: RunStatus, phase: Phase) {
        let mut s = self.state.lock().unwrap();
        if status.rank() < s.status.rank() {
            error!(
                run_id = %self.id,
                from = ?s.status,
                to = ?status,
                "refusing state regression"
            );
            return;
        }
        info!(run_id = %self.id, from = ?s.status, to = ?status, "run transition");
        s.status = status;
        s.phase = phase;
        let now = Utc::now();
        match status {
            RunStatus::WarmingUp => {
                s.start_ts.get_or_insert(now);
                s.warmup_start_ts.get_or_insert(now);
            }
            RunStatus::Measuring => {
                s.start_ts.get_or_insert(now);
                s.measurement_start_ts.get_or_insert(now);
            }
            _ if status.is_terminal() => {
                s.end_ts.get_or_insert(now);
            }
            _ => {}
        }
    }

    /// Drive the run from PREPARED to a terminal state and return the
    /// summary. Errors inside the run steer the state machine; the only
    /// `Err` from here is calling it twice.
    pub async fn execute(self: &Arc<Self>) -> Result<RunSummary, EngineError> {
        {
            let s = self.state.lock().unwrap();
            if s.status != RunStatus::Prepared {
                return Err(EngineError::Configuration(format!(
                    "run {} already started (status {:?})",
                    self.id, s.status
                )));
            }
        }

        // ── Setup: profile, pools, capability check ────────────
        let setup = self.setup().await;
        let (profile, pools, next_insert_id) = match setup {
            Ok(v) => v,
            Err(e) => {
                warn!(run_id = %self.id, error = %e, "setup failed");
                self.flag_stop(StopCause::Fatal(e.to_string()));
                return Ok(self.terminate(None).await);
            }
        };

        let spawn_gate = Arc::new(tokio::sync::Semaphore::new(
            Controller::max_parallel_creates(),
        ));
        let ctx = WorkerContext {
            run_id: self.id,
            scenario: self.scenario.clone(),
            profile: Arc::new(profile),
            pools: Arc::new(pools),
            aggregator: self.aggregator.clone(),
            pool: self.deps.pool.clone(),
            sink: self.deps.sink.clone(),
            run_stop: self.run_stop.clone(),
            measurement_active: self.measurement_active.clone(),
            next_insert_id,
            param_stride: self.scenario.concurrency * self.deps.worker_group_count.max(1),
            spawn_gate,
        };
        let mut set = WorkerSet::new(
            ctx,
            self.deps.worker_group_id,
            self.deps.worker_group_count.max(1),
        );
        let controller = Controller::new(
            self.scenario.clone(),
            self.aggregator.clone(),
            self.run_stop.clone(),
        );

        let ticker = self.spawn_ticker();

        // ── Warmup ─────────────────────────────────────────────
        self.transition(RunStatus::WarmingUp, Phase::Warmup);
        let initial_target = match self.scenario.load_mode {
            LoadMode::Concurrency => self.scenario.concurrency,
            LoadMode::Qps => self.scenario.min_workers,
            LoadMode::FindMaxConcurrency => self.scenario.find_max.start_concurrency,
        };
        self.set_target(initial_target);
        let warmup = Duration::from_secs(self.scenario.warmup_seconds);
        match controller.run_hold(&mut set, initial_target, warmup, true).await {
            ControlExit::Completed => {}
            ControlExit::Guardrail(reason) => self.flag_stop(StopCause::Guardrail(reason)),
            ControlExit::Stopped => {}
        }

        // ── Measurement ────────────────────────────────────────
        if !self.run_stop.load(Ordering::Relaxed) {
            self.aggregator.measurement_begin();
            self.measurement_active.store(true, Ordering::Relaxed);
            self.transition(RunStatus::Measuring, Phase::Measurement);

            let duration = Duration::from_secs(self.scenario.duration_seconds);
            let mut find_max_report = None;
            let exit = match self.scenario.load_mode {
                LoadMode::Concurrency => {
                    controller
                        .run_hold(&mut set, self.scenario.concurrency, duration, false)
                        .await
                }
                LoadMode::Qps => {
                    controller
                        .run_qps(
                            &mut set,
                            self.scenario.target_qps.unwrap_or(0.0),
                            self.scenario.min_workers,
                            self.scenario.concurrency,
                            duration,
                        )
                        .await
                }
                LoadMode::FindMaxConcurrency => {
                    let (exit, report) = controller.run_find_max(&mut set).await;
                    find_max_report = Some(report);
                    exit
                }
            };
            match exit {
                ControlExit::Completed => match &find_max_report {
                    Some(report) => self.flag_stop(StopCause::SearchComplete(
                        report.termination_reason.clone(),
                    )),
                    None => self.flag_stop(StopCause::DurationElapsed),
                },
                ControlExit::Guardrail(reason) => self.flag_stop(StopCause::Guardrail(reason)),
                ControlExit::Stopped => {}
            }

            let summary = self.terminate_with_workers(&mut set, find_max_report).await;
            ticker.abort();
            return Ok(summary);
        }

        let summary = self.terminate_with_workers(&mut set, None).await;
        ticker.abort();
        Ok(summary)
    }

    async fn setup(
        &self,
    ) -> Result<(TableProfile, ValuePools, Arc<AtomicI64>), EngineError> {
        let profile = match &self.deps.catalog {
            Some(catalog) => {
                let parts: Vec<&str> = self.scenario.table.split('.').collect();
                let (db, schema, table) = match parts.as_slice() {
                    [db, schema, table] => (*db, *schema, *table),
                    _ => ("", "", self.scenario.table.as_str()),
                };
                match build_profile(
                    catalog.as_ref(),
                    db,
                    schema,
                    table,
                    self.scenario.ai.key_column.as_deref(),
                    self.scenario.ai.time_column.as_deref(),
                )
                .await
                {
                    Ok(p) => p,
                    Err(e) => {
                        // Profiling failure degrades the run rather than
                        // killing it; the capability check below decides
                        // whether anything can still execute.
                        warn!(run_id = %self.id, error = %e, "table profiling failed");
                        TableProfile::default()
                    }
                }
            }
            None => TableProfile::default(),
        };

        let pools = match &self.scenario.ai.pool_id {
            Some(pool_id) => self.deps.pool_store.load(pool_id).await.unwrap_or_else(|e| {
                warn!(run_id = %self.id, error = %e, "value pool load failed");
                ValuePools::empty()
            }),
            None => ValuePools::empty(),
        };

        self.check_capabilities(&profile, &pools)?;

        let next_insert_id = Arc::new(AtomicI64::new(
            profile.id_max.map(|m| m + 1).unwrap_or(1),
        ));
        Ok((profile, pools, next_insert_id))
    }

    /// Every kind with weight > 0 must be executable with the profile and
    /// pools at hand; otherwise the run fails at setup with a clear error.
    fn check_capabilities(
        &self,
        profile: &TableProfile,
        pools: &ValuePools,
    ) -> Result<(), EngineError> {
        let key_capable = profile
            .id_column
            .as_deref()
            .map(|col| !pools.key_values(col).is_empty() || profile.id_bounds_usable())
            .unwrap_or(false);

        for kind in Kind::ALL {
            if *self.scenario.weights.get(kind) == 0 {
                continue;
            }
            let Some(sql) = self.scenario.bound_sql(kind) else {
                continue;
            };
            match kind {
                Kind::PointLookup | Kind::Update => {
                    if !key_capable {
                        return Err(EngineError::Capability(format!(
                            "{kind} enabled but table has neither a KEY pool nor usable id bounds"
                        )));
                    }
                }
                Kind::RangeScan => {
                    if crate::params::count_placeholders(&sql) == 1 {
                        let time_capable = profile
                            .time_column
                            .as_deref()
                            .map(|col| {
                                !pools.range_values(col).is_empty()
                                    || profile.time_bounds_usable()
                            })
                            .unwrap_or(false);
                        if !time_capable {
                            return Err(EngineError::Capability(
                                "RANGE_SCAN expects a time cutoff but neither a RANGE pool nor time bounds exist"
                                    .into(),
                            ));
                        }
                    } else if !key_capable {
                        return Err(EngineError::Capability(
                            "id-based RANGE_SCAN enabled but no key source exists".into(),
                        ));
                    }
                }
                Kind::Insert => {
                    if crate::params::count_placeholders(&sql) == 0 {
                        return Err(EngineError::Capability(
                            "INSERT SQL must use ? placeholders".into(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn set_target(&self, target: u32) {
        self.state.lock().unwrap().effective_target_concurrency = target;
    }

    /// 1 Hz tick: QPS bookkeeping, resource sampling, snapshot publish.
    fn spawn_ticker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let run = self.clone();
        let mut sampler: Box<dyn crate::resources::ResourceProbe> = self
            .deps
            .resource_probe
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Box::new(ResourceSampler::new()));
        tokio::spawn(async move {
            loop {
                if run.ticker_stop.load(Ordering::Relaxed) {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
                run.aggregator.tick();
                run.aggregator.set_resources(sampler.sample());

                let (status, phase, target) = {
                    let s = run.state.lock().unwrap();
                    (s.status, s.phase, s.effective_target_concurrency)
                };
                if status.is_terminal() {
                    break;
                }
                let stats = run.deps.pool.stats();
                let snapshot = run.aggregator.build_snapshot(
                    phase,
                    status,
                    ConnectionsBlock {
                        active: stats.active,
                        target,
                        idle: stats.idle,
                    },
                );
                run.deps.sink.append_snapshot(&snapshot);
                if let Some(registry) = &run.deps.registry {
                    registry.publish(
                        run.id,
                        run.deps.worker_group_id,
                        snapshot,
                        run.aggregator.reservoir_set(),
                    );
                }
            }
        })
    }

    async fn terminate_with_workers(
        self: &Arc<Self>,
        set: &mut WorkerSet,
        find_max: Option<FindMaxReport>,
    ) -> RunSummary {
        self.transition(RunStatus::Stopping, self.state().phase);
        self.run_stop.store(true, Ordering::Relaxed);
        let forced = set.stop_all(STOP_GRACE).await;
        if forced > 0 {
            warn!(run_id = %self.id, forced, "termination force-cancelled workers");
        }
        self.terminate(find_max).await
    }

    /// STOPPING → PROCESSING → terminal. Sink finalize happens here; its
    /// failure degrades the summary, never the termination.
    async fn terminate(self: &Arc<Self>, find_max: Option<FindMaxReport>) -> RunSummary {
        self.transition(RunStatus::Stopping, self.state().phase);
        self.transition(RunStatus::Processing, self.state().phase);

        let cause = self.stop_cause();
        let terminal = cause.terminal_status();

        let mut durable: Option<DurablePercentiles> = None;
        let mut sink_degraded = self.deps.sink.degraded();
        if let Some(file_sink) = &self.deps.file_sink {
            if terminal == RunStatus::Failed {
                // Failed runs keep their spool files on disk for inspection.
                file_sink.cleanup_on_error();
            } else {
                match file_sink
                    .finalize(self.deps.loader.as_ref().map(|l| l.as_ref()))
                    .await
                {
                    Ok(p) => durable = p,
                    Err(e) => {
                        warn!(run_id = %self.id, error = %e, "sink finalize failed");
                        sink_degraded = true;
                        file_sink.cleanup_on_error();
                    }
                }
            }
        }

        let reason = cause.reason();
        {
            let mut s = self.state.lock().unwrap();
            s.termination_reason = Some(reason.clone());
        }
        self.transition(terminal, self.state().phase);
        self.ticker_stop.store(true, Ordering::Relaxed);

        let summary = self.build_summary(terminal, reason, durable, find_max, sink_degraded);
        info!(
            run_id = %self.id,
            status = ?terminal,
            total_ops = summary.total_operations,
            ops_per_sec = summary.operations_per_second,
            "run finished"
        );
        summary
    }

    fn build_summary(
        &self,
        status: RunStatus,
        termination_reason: String,
        durable: Option<DurablePercentiles>,
        find_max: Option<FindMaxReport>,
        sink_degraded: bool,
    ) -> RunSummary {
        let inputs = self.aggregator.summary_inputs();
        let state = self.state();

        let started_at = state.start_ts.unwrap_or_else(Utc::now);
        let ended_at = state.end_ts.unwrap_or_else(Utc::now);
        let duration_seconds = (ended_at - started_at).num_milliseconds().max(0) as f64 / 1000.0;

        let have_streams = inputs
            .samples_by_kind
            .iter()
            .any(|(_, v)| !v.is_empty());

        let mut overall_samples: Vec<f64> = Vec::new();
        for (_, samples) in inputs.samples_by_kind.iter() {
            overall_samples.extend_from_slice(samples);
        }

        let (percentile_source, overall, read, write) = if let Some(d) = &durable {
            (
                PERCENTILE_SOURCE_DURABLE.to_string(),
                d.overall,
                LatencyStats::from_samples(&inputs.read_samples),
                LatencyStats::from_samples(&inputs.write_samples),
            )
        } else if have_streams {
            (
                PERCENTILE_SOURCE_MEMORY.to_string(),
                LatencyStats::from_samples(&overall_samples),
                LatencyStats::from_samples(&inputs.read_samples),
                LatencyStats::from_samples(&inputs.write_samples),
            )
        } else {
            (
                PERCENTILE_SOURCE_RESERVOIR.to_string(),
                LatencyStats::from_samples(&inputs.reservoir),
                LatencyStats::default(),
                LatencyStats::default(),
            )
        };

        let mut by_kind = BTreeMap::new();
        for kind in Kind::ALL {
            let counters = inputs.by_kind.get(kind);
            let samples = inputs.samples_by_kind.get(kind);
            let latency = durable
                .as_ref()
                .and_then(|d| d.by_kind.get(kind.as_str()).copied())
                .unwrap_or_else(|| LatencyStats::from_samples(samples));
            by_kind.insert(
                kind.as_str().to_string(),
                KindSummary {
                    count: counters.count,
                    success: counters.success,
                    errors: counters.errors,
                    samples: samples.len(),
                    latency,
                },
            );
        }

        let reads = inputs.by_kind.get(Kind::PointLookup).count
            + inputs.by_kind.get(Kind::RangeScan).count;
        let writes =
            inputs.by_kind.get(Kind::Insert).count + inputs.by_kind.get(Kind::Update).count;

        let measurement_seconds = inputs
            .measurement_started_wall
            .map(|t| (ended_at - t).num_milliseconds().max(0) as f64 / 1000.0)
            .unwrap_or(duration_seconds);
        let operations_per_second = if inputs.avg_qps > 0.0 {
            inputs.avg_qps
        } else if measurement_seconds > 0.0 {
            inputs.total_ops as f64 / measurement_seconds
        } else {
            0.0
        };

        RunSummary {
            run_id: self.id,
            status,
            termination_reason,
            started_at,
            ended_at,
            duration_seconds,
            total_operations: inputs.total_ops,
            successful_operations: inputs.successful_ops,
            failed_operations: inputs.failed_ops,
            read_operations: reads,
            write_operations: writes,
            rows_read: inputs.rows_read,
            rows_written: inputs.rows_written,
            operations_per_second,
            overall,
            read,
            write,
            by_kind,
            percentile_source,
            app_overhead: durable.as_ref().and_then(|d| d.app_overhead),
            find_max,
            durable_sink_degraded: sink_degraded,
        }
    }
}
