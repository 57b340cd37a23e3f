//! # Controller — Worker-Set Steering
//!
//! A periodic loop (2 s tick) that reads the aggregator's live state and
//! mutates the worker set to satisfy the load-mode target:
//!
//! - **CONCURRENCY** — scale once to the target and hold (replacing DEAD
//!   workers as they fall over).
//! - **QPS** — estimate per-worker throughput each tick and scale toward
//!   `target_qps / qps_per_worker`, clamped to the configured bounds.
//! - **FIND_MAX_CONCURRENCY** — step search upward until a step turns
//!   unstable, then back off to the best stable concurrency and probe the
//!   midpoint before terminating.
//!
//! Guardrails run on every tick in all modes: when effective CPU or memory
//! exceeds its ceiling the controller reports a breach and the run stops
//! FAILED.
//!
//! The controller never mutates worker state directly — it toggles
//! per-worker stop signals and spawns replacements. Stops target the
//! highest worker ids first to keep the id space compact, and metric
//! counters are never reset by scaling.

use crate::aggregator::{Aggregator, StepMetrics};
use crate::scenario::Scenario;
use crate::worker::{spawn_worker, WorkerContext, WorkerHandle, WorkerStatus};
use crate::Kind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const TICK: Duration = Duration::from_secs(2);
pub const STEP_SETTLE: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_PARALLEL_CREATES: usize = 8;
pub const MAX_PARALLEL_CREATES_ENV: &str = "LOADMARK_MAX_PARALLEL_CREATES";

/// Why a controller loop returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlExit {
    /// The configured duration (or the step search) ran to completion.
    Completed,
    /// A resource ceiling tripped; the message names metric and threshold.
    Guardrail(String),
    /// The run-wide stop signal was observed.
    Stopped,
}

/// One FIND_MAX step, kept in the report's `step_history`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_num: u32,
    pub concurrency: u32,
    pub qps: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub error_rate_pct: f64,
    pub stable: bool,
    pub stop_reason: Option<String>,
    pub is_backoff: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FindMaxReport {
    pub best_concurrency: u32,
    pub best_qps: f64,
    pub baseline_p95_latency_ms: Option<f64>,
    pub baseline_p99_latency_ms: Option<f64>,
    pub termination_reason: String,
    pub step_history: Vec<StepRecord>,
}

/// The mutable pool of workers owned by one run. Worker ids start at
/// `id_base` and advance by `id_step` so multi-node worker groups occupy
/// disjoint id spaces (which keeps pool-cursor strides disjoint too).
pub struct WorkerSet {
    ctx: WorkerContext,
    workers: BTreeMap<u32, WorkerHandle>,
    next_id: u32,
    id_step: u32,
}

impl WorkerSet {
    pub fn new(ctx: WorkerContext, id_base: u32, id_step: u32) -> WorkerSet {
        WorkerSet {
            ctx,
            workers: BTreeMap::new(),
            next_id: id_base,
            id_step: id_step.max(1),
        }
    }

    fn prune_finished(&mut self) {
        self.workers.retain(|_, h| !h.join.is_finished());
    }

    pub fn active_ids(&self) -> Vec<u32> {
        self.workers
            .values()
            .filter(|h| h.is_active())
            .map(|h| h.id)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.workers.values().filter(|h| h.is_active()).count()
    }

    pub fn dead_count(&self) -> usize {
        self.workers
            .values()
            .filter(|h| h.status() == WorkerStatus::Dead)
            .count()
    }

    /// Spawn or stop workers until exactly `target` are active. Stops go to
    /// the highest ids first; spawns take fresh ids.
    pub async fn scale_to(&mut self, target: u32, warmup: bool) {
        self.prune_finished();
        let active = self.active_ids();
        let running = active.len() as u32;

        if running < target {
            for _ in 0..(target - running) {
                let id = self.next_id;
                self.next_id += self.id_step;
                let handle = spawn_worker(id, self.ctx.clone(), warmup);
                self.workers.insert(id, handle);
            }
        } else if running > target {
            let stop_n = (running - target) as usize;
            for id in active.iter().rev().take(stop_n) {
                if let Some(h) = self.workers.get(id) {
                    h.signal_stop();
                }
            }
        }
    }

    /// Signal every worker and await them within `grace`. Workers still
    /// running after grace are force-aborted (their partial state is not
    /// flushed). Returns the number force-aborted.
    pub async fn stop_all(&mut self, grace: Duration) -> usize {
        for h in self.workers.values() {
            h.signal_stop();
        }
        let deadline = Instant::now() + grace;
        let mut forced = 0;
        for (_, h) in std::mem::take(&mut self.workers) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, h.join).await {
                Ok(_) => {}
                Err(_) => {
                    forced += 1;
                }
            }
        }
        if forced > 0 {
            warn!(forced, "workers force-cancelled after grace timeout");
        }
        forced
    }
}

pub struct Controller {
    scenario: Arc<Scenario>,
    aggregator: Arc<Aggregator>,
    run_stop: Arc<AtomicBool>,
}

impl Controller {
    pub fn new(
        scenario: Arc<Scenario>,
        aggregator: Arc<Aggregator>,
        run_stop: Arc<AtomicBool>,
    ) -> Controller {
        Controller {
            scenario,
            aggregator,
            run_stop,
        }
    }

    pub fn max_parallel_creates() -> usize {
        std::env::var(MAX_PARALLEL_CREATES_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_PARALLEL_CREATES)
    }

    fn stopped(&self) -> bool {
        self.run_stop.load(Ordering::Relaxed)
    }

    /// Sleep in small chunks so a stop signal is observed within ~100 ms.
    /// Returns true when the stop signal ended the sleep.
    async fn sleep_or_stop(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.stopped() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let chunk = (deadline - now).min(Duration::from_millis(100));
            tokio::time::sleep(chunk).await;
        }
    }

    /// Effective CPU / memory vs the configured ceilings.
    pub fn guardrail_breach(&self) -> Option<String> {
        let g = self.scenario.guardrails;
        let r = self.aggregator.resources();
        if let Some(limit) = g.max_host_cpu_pct {
            let v = r.effective_cpu_pct();
            if v > limit {
                return Some(format!(
                    "guardrail: effective_host_cpu_pct {v:.1} > {limit:.1}"
                ));
            }
        }
        if let Some(limit) = g.max_memory_pct {
            let v = r.effective_mem_pct();
            if v > limit {
                return Some(format!(
                    "guardrail: effective_host_memory_pct {v:.1} > {limit:.1}"
                ));
            }
        }
        None
    }

    // ── CONCURRENCY mode ───────────────────────────────────────

    /// Hold a constant worker count for `duration`, replacing DEAD workers
    /// and enforcing guardrails each tick. `warmup` tags newly spawned
    /// workers as warmup-spawned (used while the warmup window is open).
    pub async fn run_hold(
        &self,
        set: &mut WorkerSet,
        target: u32,
        duration: Duration,
        warmup: bool,
    ) -> ControlExit {
        let deadline = Instant::now() + duration;
        loop {
            if self.stopped() {
                return ControlExit::Stopped;
            }
            if Instant::now() >= deadline {
                return ControlExit::Completed;
            }
            if let Some(reason) = self.guardrail_breach() {
                return ControlExit::Guardrail(reason);
            }

            set.scale_to(target, warmup).await;
            self.aggregator.set_controller_state(serde_json::json!({
                "mode": "CONCURRENCY",
                "target_workers": target,
                "current_qps": self.aggregator.qps_windowed(),
                "active_worker_count": set.active_count(),
                "dead_worker_count": set.dead_count(),
            }));

            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.sleep_or_stop(remaining.min(TICK)).await {
                return ControlExit::Stopped;
            }
        }
    }

    // ── QPS mode ───────────────────────────────────────────────

    /// Scale the worker count toward `target_qps` for `duration`.
    pub async fn run_qps(
        &self,
        set: &mut WorkerSet,
        target_qps: f64,
        min_workers: u32,
        max_workers: u32,
        duration: Duration,
    ) -> ControlExit {
        let deadline = Instant::now() + duration;
        loop {
            if self.stopped() {
                return ControlExit::Stopped;
            }
            if Instant::now() >= deadline {
                return ControlExit::Completed;
            }
            if let Some(reason) = self.guardrail_breach() {
                return ControlExit::Guardrail(reason);
            }

            let current_qps = self.aggregator.qps_windowed();
            let current_workers = set.active_count() as u32;

            let desired = if current_qps > 0.0 {
                let qps_per_worker = current_qps / current_workers.max(1) as f64;
                if qps_per_worker > 0.0 {
                    (target_qps / qps_per_worker).ceil() as u32
                } else {
                    current_workers + 1
                }
            } else {
                current_workers + 1
            };
            let desired = desired.clamp(min_workers, max_workers);

            self.aggregator.set_controller_state(serde_json::json!({
                "mode": "QPS",
                "target_qps": target_qps,
                "current_qps": current_qps,
                "current_workers": current_workers,
                "desired_workers": desired,
                "min_workers": min_workers,
                "max_workers": max_workers,
            }));

            if desired != current_workers {
                debug!(
                    current_workers,
                    desired, current_qps, target_qps, "qps controller scaling"
                );
                set.scale_to(desired, false).await;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.sleep_or_stop(remaining.min(TICK)).await {
                return ControlExit::Stopped;
            }
        }
    }

    // ── FIND_MAX_CONCURRENCY mode ──────────────────────────────

    /// Step search over concurrency. Returns the exit cause plus the full
    /// report (always attached to the terminal summary in this mode).
    pub async fn run_find_max(&self, set: &mut WorkerSet) -> (ControlExit, FindMaxReport) {
        let fm = self.scenario.find_max;
        info!(
            start = fm.start_concurrency,
            increment = fm.increment,
            max = fm.max_concurrency,
            step_seconds = fm.step_duration_seconds,
            "find-max controller starting"
        );

        let mut history: Vec<StepRecord> = Vec::new();
        let mut best_concurrency = fm.start_concurrency;
        let mut best_qps = 0.0f64;
        let mut baseline_p95: Option<f64> = None;
        let mut baseline_p99: Option<f64> = None;
        let mut step_num: u32 = 0;
        let mut backoff_attempts: u32 = 0;
        let mut termination_reason: Option<String> = None;
        let mut exit = ControlExit::Completed;

        let mut cc = fm.start_concurrency;
        'search: while cc <= fm.max_concurrency {
            step_num += 1;
            let step = match self
                .run_step(set, cc, step_num, false, best_concurrency, best_qps, &history)
                .await
            {
                Ok(s) => s,
                Err(e) => {
                    exit = e;
                    break 'search;
                }
            };
            if baseline_p95.is_none() {
                baseline_p95 = Some(step.p95_latency_ms);
                baseline_p99 = Some(step.p99_latency_ms);
            }
            let stable = step.stable;
            let stop_reason = step.stop_reason.clone();
            let qps = step.qps;
            history.push(step);

            if stable {
                if qps >= best_qps {
                    best_concurrency = cc;
                    best_qps = qps;
                }
                cc += fm.increment;
                continue;
            }

            if termination_reason.is_none() {
                termination_reason = stop_reason;
            }

            // Verify the best still holds, then probe the midpoint between
            // best and the failing concurrency.
            if backoff_attempts < fm.backoff_attempts_max && best_concurrency < cc {
                backoff_attempts += 1;
                step_num += 1;
                info!(best_concurrency, "find-max backing off to verify best");
                let backoff = match self
                    .run_step(
                        set,
                        best_concurrency,
                        step_num,
                        true,
                        best_concurrency,
                        best_qps,
                        &history,
                    )
                    .await
                {
                    Ok(s) => s,
                    Err(e) => {
                        exit = e;
                        break 'search;
                    }
                };
                let backoff_stable = backoff.stable;
                history.push(backoff);

                if backoff_stable {
                    let midpoint = best_concurrency + (cc - best_concurrency) / 2;
                    if midpoint > best_concurrency && midpoint < cc {
                        step_num += 1;
                        let mid = match self
                            .run_step(
                                set,
                                midpoint,
                                step_num,
                                false,
                                best_concurrency,
                                best_qps,
                                &history,
                            )
                            .await
                        {
                            Ok(s) => s,
                            Err(e) => {
                                exit = e;
                                break 'search;
                            }
                        };
                        let mid_stable = mid.stable;
                        let mid_qps = mid.qps;
                        history.push(mid);
                        if mid_stable && mid_qps >= best_qps {
                            best_concurrency = midpoint;
                            best_qps = mid_qps;
                            cc = midpoint + fm.increment;
                            continue 'search;
                        }
                    }
                }
            }

            break 'search;
        }

        let final_reason = termination_reason.unwrap_or_else(|| {
            match &exit {
                ControlExit::Guardrail(r) => r.clone(),
                ControlExit::Stopped => "stopped".to_string(),
                ControlExit::Completed => "reached max concurrency".to_string(),
            }
        });

        info!(
            best_concurrency,
            best_qps, reason = %final_reason, "find-max complete"
        );

        (
            exit,
            FindMaxReport {
                best_concurrency,
                best_qps,
                baseline_p95_latency_ms: baseline_p95,
                baseline_p99_latency_ms: baseline_p99,
                termination_reason: final_reason,
                step_history: history,
            },
        )
    }

    /// Run one step: scale, settle, collect for the step duration, classify.
    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        set: &mut WorkerSet,
        cc: u32,
        step_num: u32,
        is_backoff: bool,
        best_concurrency: u32,
        best_qps: f64,
        history: &[StepRecord],
    ) -> Result<StepRecord, ControlExit> {
        let fm = self.scenario.find_max;
        info!(step_num, concurrency = cc, is_backoff, "find-max step starting");

        set.scale_to(cc, false).await;
        if self.sleep_or_stop(STEP_SETTLE).await {
            return Err(ControlExit::Stopped);
        }

        self.aggregator.step_begin();
        let step_duration = Duration::from_secs(fm.step_duration_seconds.max(1));
        let step_start = Instant::now();
        let step_end_at_ms =
            chrono::Utc::now().timestamp_millis() + step_duration.as_millis() as i64;

        loop {
            if self.stopped() {
                return Err(ControlExit::Stopped);
            }
            if let Some(reason) = self.guardrail_breach() {
                return Err(ControlExit::Guardrail(reason));
            }
            self.aggregator.set_controller_state(serde_json::json!({
                "mode": "FIND_MAX_CONCURRENCY",
                "status": "STEP_RUNNING",
                "current_step": step_num,
                "current_concurrency": cc,
                "best_concurrency": best_concurrency,
                "best_qps": best_qps,
                "active_worker_count": set.active_count(),
                "step_duration_seconds": fm.step_duration_seconds,
                "step_end_at_ms": step_end_at_ms,
                "step_history": history,
            }));
            let elapsed = step_start.elapsed();
            if elapsed >= step_duration {
                break;
            }
            let remaining = step_duration - elapsed;
            if self.sleep_or_stop(remaining.min(Duration::from_secs(1))).await {
                return Err(ControlExit::Stopped);
            }
        }

        let metrics = self
            .aggregator
            .step_end(step_start.elapsed().as_secs_f64());
        let (stable, stop_reason) = self.classify_step(&metrics, history);

        info!(
            step_num,
            concurrency = cc,
            qps = metrics.qps,
            p95 = metrics.p95_ms,
            error_rate = metrics.error_rate_pct,
            stable,
            "find-max step complete"
        );

        Ok(StepRecord {
            step_num,
            concurrency: cc,
            qps: metrics.qps,
            p95_latency_ms: metrics.p95_ms,
            p99_latency_ms: metrics.p99_ms,
            error_rate_pct: metrics.error_rate_pct,
            stable,
            stop_reason,
            is_backoff,
        })
    }

    /// Stability classification. Check order is part of the contract:
    /// error rate → queue depth → per-kind SLO → QPS drop → p95 rise. The
    /// first failed check names the reason.
    fn classify_step(
        &self,
        metrics: &StepMetrics,
        history: &[StepRecord],
    ) -> (bool, Option<String>) {
        let fm = self.scenario.find_max;

        if metrics.error_rate_pct > fm.max_error_rate_pct {
            return (
                false,
                Some(format!(
                    "error rate {:.2}% > {:.2}%",
                    metrics.error_rate_pct, fm.max_error_rate_pct
                )),
            );
        }

        if let Some((queued, blocked)) = self.aggregator.queue_status() {
            if queued > 0 || blocked > 0 {
                return (
                    false,
                    Some(format!("queue buildup: {queued} queued, {blocked} blocked")),
                );
            }
        }

        if let Some(reason) = self.check_slo(metrics) {
            return (false, Some(reason));
        }

        let prev_stable = history.iter().rev().find(|r| r.stable && !r.is_backoff);
        if let Some(prev) = prev_stable {
            if prev.qps > 0.0 {
                let qps_change_pct = (metrics.qps - prev.qps) / prev.qps * 100.0;
                if qps_change_pct < -fm.qps_drop_pct {
                    return (
                        false,
                        Some(format!(
                            "QPS dropped {:.1}% vs previous stable step",
                            -qps_change_pct
                        )),
                    );
                }
            }
            if prev.p95_latency_ms > 0.0 && metrics.p95_ms > 0.0 {
                let rise_pct =
                    (metrics.p95_ms - prev.p95_latency_ms) / prev.p95_latency_ms * 100.0;
                if rise_pct > fm.latency_rise_pct {
                    return (
                        false,
                        Some(format!("p95 latency increased {rise_pct:.1}%")),
                    );
                }
            }
        }

        (true, None)
    }

    /// Per-kind SLO evaluation. A kind with weight > 0 and any enabled SLO
    /// must produce samples; `no operations observed` is itself a failure.
    fn check_slo(&self, metrics: &StepMetrics) -> Option<String> {
        for kind in Kind::ALL {
            if *self.scenario.weights.get(kind) == 0 {
                continue;
            }
            let slo = self.scenario.slo.get(kind);
            if !slo.any_enabled() {
                continue;
            }
            let km = metrics.by_kind.get(kind);
            if km.ops == 0 {
                return Some(format!("{kind}: no operations observed"));
            }
            if slo.error_rate_enabled() {
                let target = slo.error_rate_pct.unwrap_or(0.0);
                let observed = km.error_rate_pct.unwrap_or(0.0);
                if observed > target {
                    return Some(format!(
                        "{kind}: error rate {observed:.2}% > {target:.2}%"
                    ));
                }
            }
            if slo.p99_enabled() {
                let target = slo.p99_ms.unwrap_or(0.0);
                match km.p99_ms {
                    None => return Some(format!("{kind}: no samples for p99")),
                    Some(observed) if observed > target => {
                        return Some(format!("{kind}: p99 {observed:.1}ms > {target:.1}ms"))
                    }
                    _ => {}
                }
            }
            if slo.p95_enabled() {
                let target = slo.p95_ms.unwrap_or(0.0);
                match km.p95_ms {
                    None => return Some(format!("{kind}: no samples for p95")),
                    Some(observed) if observed > target => {
                        return Some(format!("{kind}: p95 {observed:.1}ms > {target:.1}ms"))
                    }
                    _ => {}
                }
            }
        }
        None
    }
}
