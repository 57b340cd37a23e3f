//! # Worker — One Logical Execution Thread
//!
//! A worker loops until its stop signal (or the run-wide one) is observed:
//! pick the next kind from the schedule, bind parameters, issue the SQL,
//! record the outcome. Its only observable API is `run()`; everything else
//! it touches is shared state injected at spawn time.
//!
//! ## Failure Semantics
//!
//! - A per-operation error is recorded and swallowed; the loop continues.
//! - Pool exhaustion retries the *same* operation slot with exponential
//!   backoff capped at 50 ms.
//! - 100 consecutive hard errors flip the worker to DEAD and end the loop;
//!   the controller replaces dead workers on its next tick.
//!
//! ## Warmup Tagging
//!
//! Workers spawned during warmup tag outcomes `warmup=true` only until the
//! measurement window opens — the flag is re-derived at the top of every
//! iteration, so a warmup-spawned worker that survives into measurement
//! contributes to the summary from its next operation on.

use crate::aggregator::Aggregator;
use crate::connection::ConnectionPool;
use crate::error::EngineError;
use crate::params::ParamGenerator;
use crate::pools::ValuePools;
use crate::profile::TableProfile;
use crate::scenario::Scenario;
use crate::sink::DurableSink;
use crate::{Kind, PerKind};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Consecutive hard errors before a worker declares itself DEAD.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 100;
/// Backoff ceiling between retries of a pool-exhausted operation slot.
pub const BACKOFF_CAP_MS: u64 = 50;

/// One executed operation.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Outcome {
    pub execution_id: Uuid,
    pub worker_id: u32,
    pub kind: Kind,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    /// Monotonic-clock latency; authoritative over `end_ts - start_ts`.
    pub app_elapsed_ms: f64,
    pub success: bool,
    pub error: Option<String>,
    pub rows_returned: u64,
    pub rows_affected: Option<i64>,
    pub warmup: bool,
    pub query_id: Option<String>,
    pub sql: String,
    pub server_elapsed_ms: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerStatus {
    Starting = 0,
    Running = 1,
    Stopped = 2,
    Dead = 3,
}

impl WorkerStatus {
    pub fn from_u8(v: u8) -> WorkerStatus {
        match v {
            0 => WorkerStatus::Starting,
            1 => WorkerStatus::Running,
            3 => WorkerStatus::Dead,
            _ => WorkerStatus::Stopped,
        }
    }
}

/// Everything a worker shares with the rest of its run.
#[derive(Clone)]
pub struct WorkerContext {
    pub run_id: Uuid,
    pub scenario: Arc<Scenario>,
    pub profile: Arc<TableProfile>,
    pub pools: Arc<ValuePools>,
    pub aggregator: Arc<Aggregator>,
    pub pool: Arc<dyn ConnectionPool>,
    pub sink: Arc<dyn DurableSink>,
    /// Run-wide stop signal.
    pub run_stop: Arc<AtomicBool>,
    /// Flipped when the measurement window opens.
    pub measurement_active: Arc<AtomicBool>,
    /// Shared insert-id sequence rooted at `id_max + 1`.
    pub next_insert_id: Arc<AtomicI64>,
    /// Pool-walk stride (concurrency × worker-group count).
    pub param_stride: u32,
    /// Bounds concurrent worker start-up (`max_parallel_creates`): a fresh
    /// worker holds a permit through its first operation, which is where
    /// its connection gets established. Prevents connection storms when the
    /// controller scales up sharply.
    pub spawn_gate: Arc<tokio::sync::Semaphore>,
}

/// Controller-side view of one spawned worker.
pub struct WorkerHandle {
    pub id: u32,
    pub stop: Arc<AtomicBool>,
    status: Arc<AtomicU8>,
    pub join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    /// Running (or starting) and not yet told to stop.
    pub fn is_active(&self) -> bool {
        !self.stop.load(Ordering::Relaxed)
            && !self.join.is_finished()
            && matches!(self.status(), WorkerStatus::Starting | WorkerStatus::Running)
    }

    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Spawn a worker task. `spawned_in_warmup` controls the warmup tagging of
/// its outcomes until the measurement window opens.
pub fn spawn_worker(id: u32, ctx: WorkerContext, spawned_in_warmup: bool) -> WorkerHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let status = Arc::new(AtomicU8::new(WorkerStatus::Starting as u8));
    let worker = Worker {
        id,
        ctx,
        spawned_in_warmup,
        stop: stop.clone(),
        status: status.clone(),
    };
    let join = tokio::spawn(worker.run());
    WorkerHandle {
        id,
        stop,
        status,
        join,
    }
}

struct Worker {
    id: u32,
    ctx: WorkerContext,
    spawned_in_warmup: bool,
    stop: Arc<AtomicBool>,
    status: Arc<AtomicU8>,
}

impl Worker {
    fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Relaxed) || self.ctx.run_stop.load(Ordering::Relaxed)
    }

    fn record(&self, outcome: &Outcome) {
        self.ctx.aggregator.record(outcome);
        // Warmup ops are always captured for troubleshooting; measurement
        // ops only when the scenario asks for query history.
        if outcome.warmup || self.ctx.scenario.collect_query_history {
            self.ctx.sink.append_outcome(outcome);
        }
    }

    async fn run(self) {
        debug!(worker_id = self.id, "worker started");
        self.status
            .store(WorkerStatus::Running as u8, Ordering::Relaxed);

        let scenario = self.ctx.scenario.clone();
        let bound_sql: PerKind<Option<String>> =
            scenario.weights.map(|kind, _| scenario.bound_sql(kind));
        let mut generator =
            ParamGenerator::new(self.id, self.ctx.param_stride, self.ctx.next_insert_id.clone());

        let schedule_len = scenario.schedule.len().max(1);
        let mut cursor = self.id as usize % schedule_len;
        let mut consecutive_errors: u32 = 0;
        // Wait for a spawn permit without going deaf to the stop signal.
        let mut spawn_permit = None;
        while !self.should_stop() {
            match self.ctx.spawn_gate.clone().try_acquire_owned() {
                Ok(p) => {
                    spawn_permit = Some(p);
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }

        'ops: loop {
            if self.should_stop() {
                break;
            }

            let kind = scenario.schedule.kind_at(cursor);
            cursor = (cursor + 1) % schedule_len;

            let Some(sql) = bound_sql.get(kind).as_deref() else {
                // Zero-weight kinds never appear in the schedule.
                continue;
            };

            let params = match generator.params_for(
                kind,
                sql,
                &scenario,
                &self.ctx.profile,
                &self.ctx.pools,
            ) {
                Ok(p) => p,
                Err(e) => {
                    let now = Utc::now();
                    self.record(&Outcome {
                        execution_id: Uuid::new_v4(),
                        worker_id: self.id,
                        kind,
                        start_ts: now,
                        end_ts: now,
                        app_elapsed_ms: 0.0,
                        success: false,
                        error: Some(e.to_string()),
                        rows_returned: 0,
                        rows_affected: None,
                        warmup: self.is_warmup_op(),
                        query_id: None,
                        sql: sql.to_string(),
                        server_elapsed_ms: None,
                    });
                    consecutive_errors += 1;
                    if self.check_dead(consecutive_errors) {
                        return;
                    }
                    continue;
                }
            };

            // Retry loop for the same operation slot (pool exhaustion only).
            let mut backoff_ms: u64 = 1;
            loop {
                if self.should_stop() {
                    break 'ops;
                }

                let warmup = self.is_warmup_op();
                let start_ts = Utc::now();
                let t0 = Instant::now();
                let result = self.ctx.pool.execute(sql, &params, kind.is_read()).await;
                let app_elapsed_ms = t0.elapsed().as_secs_f64() * 1000.0;
                let end_ts = Utc::now();
                // First operation done — the connection exists now, so stop
                // gating other spawns on this worker.
                spawn_permit.take();

                match result {
                    Ok(out) => {
                        self.record(&Outcome {
                            execution_id: Uuid::new_v4(),
                            worker_id: self.id,
                            kind,
                            start_ts,
                            end_ts,
                            app_elapsed_ms,
                            success: true,
                            error: None,
                            rows_returned: out.rows_returned,
                            rows_affected: out.info.rowcount,
                            warmup,
                            query_id: out.info.query_id,
                            sql: sql.to_string(),
                            server_elapsed_ms: out.info.server_elapsed_ms,
                        });
                        consecutive_errors = 0;
                        break;
                    }
                    Err(e) => {
                        let exhausted = matches!(e, EngineError::PoolExhausted(_));
                        if !warmup {
                            debug!(worker_id = self.id, %kind, error = %e, "operation failed");
                        }
                        self.record(&Outcome {
                            execution_id: Uuid::new_v4(),
                            worker_id: self.id,
                            kind,
                            start_ts,
                            end_ts,
                            app_elapsed_ms,
                            success: false,
                            error: Some(e.to_string()),
                            rows_returned: 0,
                            rows_affected: None,
                            warmup,
                            query_id: None,
                            sql: sql.to_string(),
                            server_elapsed_ms: None,
                        });
                        consecutive_errors += 1;
                        if self.check_dead(consecutive_errors) {
                            return;
                        }
                        if exhausted {
                            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                            backoff_ms = (backoff_ms * 2).min(BACKOFF_CAP_MS);
                            continue;
                        }
                        break;
                    }
                }
            }

            if scenario.think_time_ms > 0 {
                tokio::time::sleep(Duration::from_millis(scenario.think_time_ms)).await;
            }
        }

        self.status
            .store(WorkerStatus::Stopped as u8, Ordering::Relaxed);
        debug!(worker_id = self.id, "worker stopped");
    }

    fn is_warmup_op(&self) -> bool {
        self.spawned_in_warmup && !self.ctx.measurement_active.load(Ordering::Relaxed)
    }

    /// Returns true (and transitions to DEAD) when the consecutive error
    /// budget is spent.
    fn check_dead(&self, consecutive_errors: u32) -> bool {
        if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
            warn!(
                worker_id = self.id,
                consecutive_errors, "worker exceeded consecutive error budget, going DEAD"
            );
            self.status.store(WorkerStatus::Dead as u8, Ordering::Relaxed);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_u8() {
        for s in [
            WorkerStatus::Starting,
            WorkerStatus::Running,
            WorkerStatus::Stopped,
            WorkerStatus::Dead,
        ] {
            assert_eq!(WorkerStatus::from_u8(s as u8), s);
        }
    }

    #[test]
    fn outcome_invariants_hold_for_success() {
        let now = Utc::now();
        let o = Outcome {
            execution_id: Uuid::new_v4(),
            worker_id: 1,
            kind: Kind::PointLookup,
            start_ts: now,
            end_ts: now + chrono::Duration::milliseconds(5),
            app_elapsed_ms: 5.0,
            success: true,
            error: None,
            rows_returned: 1,
            rows_affected: Some(1),
            warmup: false,
            query_id: None,
            sql: "SELECT 1".into(),
            server_elapsed_ms: None,
        };
        assert!(o.app_elapsed_ms >= 0.0);
        assert!(o.end_ts >= o.start_ts);
        assert!(o.success && o.error.is_none());
    }

    #[test]
    fn outcome_serde_round_trip() {
        let now = Utc::now();
        let o = Outcome {
            execution_id: Uuid::new_v4(),
            worker_id: 2,
            kind: Kind::Update,
            start_ts: now,
            end_ts: now,
            app_elapsed_ms: 1.25,
            success: false,
            error: Some("backend error: reset".into()),
            rows_returned: 0,
            rows_affected: None,
            warmup: true,
            query_id: Some("01af-22".into()),
            sql: "UPDATE t SET a = ? WHERE id = ?".into(),
            server_elapsed_ms: None,
        };
        let json = serde_json::to_string(&o).unwrap();
        let back: Outcome = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, Kind::Update);
        assert_eq!(back.error.as_deref(), Some("backend error: reset"));
        assert!(back.warmup);
    }
}
