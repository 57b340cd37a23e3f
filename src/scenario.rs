//! # Scenario — Frozen Workload Plan
//!
//! A validated template is compiled into an immutable [`Scenario`]: the
//! weights, bound SQL, load-mode settings, and the deterministic
//! [`Schedule`] every worker walks. Nothing in a scenario changes for the
//! lifetime of a run.
//!
//! ## Smooth Weighted Round-Robin
//!
//! The schedule is 100 slots long. At each tick every kind's accumulator
//! gains its weight, the maximum accumulator wins the slot, and the winner
//! pays back 100. Over one full cycle each kind appears exactly
//! `weight` times, and the interleaving is as even as integer weights
//! allow. Ties break by the declaration order of [`Kind`], so the same
//! weight vector always produces the same schedule.

use crate::error::EngineError;
use crate::template::{AiWorkload, LoadMode, TemplateConfig};
use crate::{Kind, PerKind};
use serde::{Deserialize, Serialize};

pub const SCHEDULE_LEN: usize = 100;

/// Per-kind SLO targets. `p95_ms`/`p99_ms` are enabled when positive,
/// `error_rate_pct` when non-negative.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct SloTargets {
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub error_rate_pct: Option<f64>,
}

impl SloTargets {
    pub fn p95_enabled(&self) -> bool {
        self.p95_ms.is_some_and(|v| v.is_finite() && v > 0.0)
    }

    pub fn p99_enabled(&self) -> bool {
        self.p99_ms.is_some_and(|v| v.is_finite() && v > 0.0)
    }

    pub fn error_rate_enabled(&self) -> bool {
        self.error_rate_pct.is_some_and(|v| v.is_finite() && v >= 0.0)
    }

    pub fn any_enabled(&self) -> bool {
        self.p95_enabled() || self.p99_enabled() || self.error_rate_enabled()
    }
}

/// Resource ceilings enforced by the controller every tick.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Guardrails {
    pub max_host_cpu_pct: Option<f64>,
    pub max_memory_pct: Option<f64>,
}

/// FIND_MAX_CONCURRENCY step-search settings.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FindMaxSettings {
    pub start_concurrency: u32,
    pub increment: u32,
    pub max_concurrency: u32,
    pub step_duration_seconds: u64,
    pub qps_drop_pct: f64,
    pub latency_rise_pct: f64,
    pub max_error_rate_pct: f64,
    pub backoff_attempts_max: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Snowflake,
    Postgres,
}

/// The deterministic 100-slot kind sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schedule(Vec<Kind>);

impl Schedule {
    /// Build via smooth weighted round-robin. Kinds with weight 0 never
    /// appear. Weights must already sum to 100.
    pub fn build(weights: &PerKind<u32>) -> Schedule {
        let total: i64 = Kind::ALL.iter().map(|k| *weights.get(*k) as i64).sum();
        let mut current: PerKind<i64> = PerKind::default();
        let mut out = Vec::with_capacity(total as usize);
        for _ in 0..total {
            for kind in Kind::ALL {
                *current.get_mut(kind) += *weights.get(kind) as i64;
            }
            // Stable max: strict `>` keeps the earliest kind on ties.
            let mut winner = Kind::PointLookup;
            let mut best = i64::MIN;
            for kind in Kind::ALL {
                if *current.get(kind) > best {
                    best = *current.get(kind);
                    winner = kind;
                }
            }
            out.push(winner);
            *current.get_mut(winner) -= total;
        }
        Schedule(out)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn kind_at(&self, pos: usize) -> Kind {
        self.0[pos % self.0.len()]
    }

    pub fn kinds(&self) -> &[Kind] {
        &self.0
    }

    pub fn count_of(&self, kind: Kind) -> usize {
        self.0.iter().filter(|k| **k == kind).count()
    }
}

/// Immutable plan for one run.
#[derive(Clone, Debug)]
pub struct Scenario {
    pub name: String,
    pub backend: Backend,
    /// Fully qualified `DATABASE.SCHEMA.TABLE`.
    pub table: String,
    pub weights: PerKind<u32>,
    /// SQL template per kind; `None` for zero-weight kinds.
    pub sql: PerKind<Option<String>>,
    pub duration_seconds: u64,
    pub warmup_seconds: u64,
    pub load_mode: LoadMode,
    /// CONCURRENCY-mode target and QPS/FIND_MAX upper bound.
    pub concurrency: u32,
    pub min_workers: u32,
    pub target_qps: Option<f64>,
    pub think_time_ms: u64,
    pub use_cached_result: bool,
    pub collect_query_history: bool,
    pub slo: PerKind<SloTargets>,
    pub guardrails: Guardrails,
    pub find_max: FindMaxSettings,
    pub ai: AiWorkload,
    pub schedule: Schedule,
}

impl Scenario {
    /// Compile a validated template into a frozen scenario. Validation runs
    /// first, so a scenario never exists for an invalid template.
    pub fn from_template(cfg: &TemplateConfig) -> Result<Scenario, EngineError> {
        cfg.validate(TemplateConfig::hard_max_workers())?;

        let weights = cfg.weights();
        let sql = weights.map(|kind, w| {
            if *w > 0 {
                cfg.sql_for(kind).map(str::to_owned)
            } else {
                None
            }
        });
        let slo = weights.map(|kind, _| {
            let (p95, p99, err) = cfg.slo_for(kind);
            SloTargets {
                p95_ms: p95,
                p99_ms: p99,
                error_rate_pct: err,
            }
        });

        let backend = if cfg.table_type.is_postgres() {
            Backend::Postgres
        } else {
            Backend::Snowflake
        };

        Ok(Scenario {
            name: format!("{}.{}.{}", cfg.database, cfg.schema, cfg.table_name),
            backend,
            table: format!("{}.{}.{}", cfg.database, cfg.schema, cfg.table_name),
            weights,
            sql,
            duration_seconds: cfg.duration,
            warmup_seconds: cfg.warmup,
            load_mode: cfg.load_mode,
            concurrency: cfg.concurrent_connections,
            min_workers: cfg.min_connections(),
            target_qps: cfg.target_qps,
            think_time_ms: cfg.think_time_ms,
            use_cached_result: cfg.use_cached_result,
            collect_query_history: cfg.collect_query_history,
            slo,
            guardrails: Guardrails {
                max_host_cpu_pct: cfg.max_host_cpu_pct,
                max_memory_pct: cfg.max_memory_pct,
            },
            find_max: FindMaxSettings {
                start_concurrency: cfg
                    .find_max_start_concurrency
                    .unwrap_or(cfg.min_connections())
                    .max(1),
                increment: cfg.find_max_increment.max(1),
                max_concurrency: cfg.concurrent_connections,
                step_duration_seconds: cfg.find_max_step_duration_seconds,
                qps_drop_pct: cfg.find_max_qps_drop_pct,
                latency_rise_pct: cfg.find_max_latency_rise_pct,
                max_error_rate_pct: cfg.find_max_max_error_rate_pct,
                backoff_attempts_max: 3,
            },
            ai: cfg.ai_workload.clone().unwrap_or_default(),
            schedule: Schedule::build(&weights),
        })
    }

    /// SQL for a kind with `{table}` substituted. `None` for zero-weight kinds.
    pub fn bound_sql(&self, kind: Kind) -> Option<String> {
        self.sql
            .get(kind)
            .as_ref()
            .map(|tpl| tpl.replace("{table}", &self.table))
    }
}

/// Preview-only weight adjustment for tables where key-based kinds cannot
/// execute: POINT_LOOKUP and UPDATE weights fold into INSERT when neither a
/// key pool nor id bounds exist. At run time the affected kinds fail with a
/// capability error instead; this is what the adjustment UI shows ahead of
/// that.
pub fn redistribute_weights_preview(weights: &PerKind<u32>, key_capable: bool) -> PerKind<u32> {
    if key_capable {
        return *weights;
    }
    let mut out = *weights;
    let folded = *out.get(Kind::PointLookup) + *out.get(Kind::Update);
    *out.get_mut(Kind::PointLookup) = 0;
    *out.get_mut(Kind::Update) = 0;
    *out.get_mut(Kind::Insert) += folded;
    out
}
