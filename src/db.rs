//! # Results Store — PostgreSQL Persistence Layer
//!
//! Durable storage behind the sink: per-operation outcomes, 1 Hz snapshot
//! history, terminal run records, and the persisted value pools, all via
//! `sqlx::PgPool`.
//!
//! ## Schema
//!
//! - `bench_runs`: one row per run — status, timestamps, summary JSON
//! - `bench_outcomes`: one row per operation (bulk-loaded from spool files)
//! - `bench_snapshots`: 1 Hz live snapshots (payload JSON)
//! - `bench_value_pools`: `(pool_id, pool_kind, column_name, seq, value)`
//!
//! ## Exact Percentiles
//!
//! Terminal summary percentiles are computed server-side with
//! `PERCENTILE_CONT` over the measurement-phase outcome stream, so the
//! reported tail latencies do not depend on the bounded in-process
//! reservoir.

use crate::error::EngineError;
use crate::pools::{PoolKind, Value, ValuePools};
use crate::profile::{ColumnInfo, TableCatalog, TableProfile};
use crate::sink::{BulkLoader, DurablePercentiles};
use crate::snapshot::{LatencyStats, LiveSnapshot, RunSummary};
use crate::worker::Outcome;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Rows per bulk-insert statement (bounded by the Postgres parameter cap).
const INSERT_CHUNK: usize = 1_000;

/// The store is off the hot path: it sees bulk loads at finalize, 1 Hz
/// snapshot batches, and run bookkeeping. A handful of connections is
/// plenty, and keeps the store from competing with the workload pool.
const STORE_MAX_CONNECTIONS: u32 = 4;

#[derive(Clone)]
pub struct ResultsStore {
    pool: PgPool,
}

impl ResultsStore {
    pub async fn connect(database_url: &str) -> Result<Self, EngineError> {
        let opts: PgConnectOptions = database_url
            .parse()
            .map_err(|e| EngineError::Configuration(format!("results store url: {e}")))?;
        let pool = PgPoolOptions::new()
            .max_connections(STORE_MAX_CONNECTIONS)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(opts)
            .await
            .map_err(|e| EngineError::TransientBackend(format!("results store connect: {e}")))?;
        Ok(ResultsStore { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        ResultsStore { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), EngineError> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS bench_runs (
                 run_id UUID PRIMARY KEY,
                 scenario TEXT NOT NULL,
                 status TEXT NOT NULL,
                 started_at TIMESTAMPTZ,
                 ended_at TIMESTAMPTZ,
                 termination_reason TEXT,
                 summary JSONB
             );
             CREATE TABLE IF NOT EXISTS bench_outcomes (
                 run_id UUID NOT NULL,
                 execution_id UUID NOT NULL,
                 worker_id BIGINT NOT NULL,
                 kind TEXT NOT NULL,
                 start_ts TIMESTAMPTZ NOT NULL,
                 end_ts TIMESTAMPTZ NOT NULL,
                 app_elapsed_ms DOUBLE PRECISION NOT NULL,
                 success BOOLEAN NOT NULL,
                 error TEXT,
                 rows_returned BIGINT NOT NULL DEFAULT 0,
                 rows_affected BIGINT,
                 warmup BOOLEAN NOT NULL DEFAULT FALSE,
                 query_id TEXT,
                 query_text TEXT,
                 server_elapsed_ms DOUBLE PRECISION
             );
             CREATE INDEX IF NOT EXISTS idx_bench_outcomes_run
                 ON bench_outcomes (run_id, warmup, success);
             CREATE TABLE IF NOT EXISTS bench_snapshots (
                 run_id UUID NOT NULL,
                 ts TIMESTAMPTZ NOT NULL,
                 payload JSONB NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_bench_snapshots_run
                 ON bench_snapshots (run_id, ts);
             CREATE TABLE IF NOT EXISTS bench_value_pools (
                 pool_id TEXT NOT NULL,
                 pool_kind TEXT NOT NULL,
                 column_name TEXT,
                 seq BIGINT NOT NULL,
                 value JSONB
             );
             CREATE INDEX IF NOT EXISTS idx_bench_value_pools_walk
                 ON bench_value_pools (pool_id, pool_kind, column_name, seq);",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::TransientBackend(format!("schema setup: {e}")))?;
        Ok(())
    }

    pub async fn insert_run_start(
        &self,
        run_id: Uuid,
        scenario_name: &str,
    ) -> Result<(), EngineError> {
        sqlx::query(
            "INSERT INTO bench_runs (run_id, scenario, status, started_at)
             VALUES ($1, $2, 'PREPARED', NOW())
             ON CONFLICT (run_id) DO NOTHING",
        )
        .bind(run_id)
        .bind(scenario_name)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::TransientBackend(format!("run insert: {e}")))?;
        Ok(())
    }

    pub async fn update_run_final(&self, summary: &RunSummary) -> Result<(), EngineError> {
        let payload = serde_json::to_string(summary)
            .map_err(|e| EngineError::TransientBackend(format!("summary encode: {e}")))?;
        sqlx::query(
            "UPDATE bench_runs
             SET status = $2, ended_at = $3, termination_reason = $4, summary = $5::jsonb
             WHERE run_id = $1",
        )
        .bind(summary.run_id)
        .bind(summary.status.as_str())
        .bind(summary.ended_at)
        .bind(summary.termination_reason.as_str())
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::TransientBackend(format!("run update: {e}")))?;
        Ok(())
    }

    /// Load a persisted terminal summary back (round-trip check, history
    /// views).
    pub async fn load_run_summary(&self, run_id: Uuid) -> Result<Option<RunSummary>, EngineError> {
        let row = sqlx::query("SELECT summary::text FROM bench_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| EngineError::TransientBackend(format!("run load: {e}")))?;
        let Some(row) = row else { return Ok(None) };
        let text: Option<String> = row
            .try_get(0)
            .map_err(|e| EngineError::TransientBackend(format!("run decode: {e}")))?;
        match text {
            Some(t) => serde_json::from_str(&t)
                .map(Some)
                .map_err(|e| EngineError::TransientBackend(format!("summary decode: {e}"))),
            None => Ok(None),
        }
    }

    async fn percentile_row(
        &self,
        sql: &str,
        run_id: Uuid,
    ) -> Result<Option<LatencyStats>, EngineError> {
        let row = sqlx::query(sql)
            .bind(run_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| EngineError::TransientBackend(format!("percentile query: {e}")))?;
        let count: i64 = row
            .try_get("n")
            .map_err(|e| EngineError::TransientBackend(format!("percentile decode: {e}")))?;
        if count == 0 {
            return Ok(None);
        }
        let get = |name: &str| -> f64 {
            row.try_get::<Option<f64>, _>(name).ok().flatten().unwrap_or(0.0)
        };
        Ok(Some(LatencyStats {
            min: get("min_ms"),
            avg: get("avg_ms"),
            p50: get("p50"),
            p90: get("p90"),
            p95: get("p95"),
            p99: get("p99"),
            max: get("max_ms"),
        }))
    }
}

#[async_trait::async_trait]
impl BulkLoader for ResultsStore {
    async fn load_outcomes(&self, run_id: Uuid, rows: &[Outcome]) -> Result<u64, EngineError> {
        let mut loaded = 0u64;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new(
                "INSERT INTO bench_outcomes (run_id, execution_id, worker_id, kind, start_ts, \
                 end_ts, app_elapsed_ms, success, error, rows_returned, rows_affected, warmup, \
                 query_id, query_text, server_elapsed_ms) ",
            );
            builder.push_values(chunk, |mut b, o| {
                b.push_bind(run_id)
                    .push_bind(o.execution_id)
                    .push_bind(o.worker_id as i64)
                    .push_bind(o.kind.as_str())
                    .push_bind(o.start_ts)
                    .push_bind(o.end_ts)
                    .push_bind(o.app_elapsed_ms)
                    .push_bind(o.success)
                    .push_bind(o.error.as_deref())
                    .push_bind(o.rows_returned as i64)
                    .push_bind(o.rows_affected)
                    .push_bind(o.warmup)
                    .push_bind(o.query_id.as_deref())
                    .push_bind(o.sql.as_str())
                    .push_bind(o.server_elapsed_ms);
            });
            let done = builder
                .build()
                .execute(&self.pool)
                .await
                .map_err(|e| EngineError::TransientBackend(format!("outcome load: {e}")))?;
            loaded += done.rows_affected();
        }
        debug!(%run_id, loaded, "outcomes bulk-loaded");
        Ok(loaded)
    }

    async fn load_snapshots(
        &self,
        run_id: Uuid,
        snaps: &[LiveSnapshot],
    ) -> Result<u64, EngineError> {
        let mut loaded = 0u64;
        for chunk in snaps.chunks(INSERT_CHUNK) {
            let mut builder = sqlx::QueryBuilder::<sqlx::Postgres>::new(
                "INSERT INTO bench_snapshots (run_id, ts, payload) ",
            );
            builder.push_values(chunk, |mut b, s| {
                let payload = serde_json::to_string(s).unwrap_or_else(|_| "{}".into());
                b.push_bind(run_id).push_bind(s.timestamp);
                b.push_bind(payload).push_unseparated("::jsonb");
            });
            let done = builder
                .build()
                .execute(&self.pool)
                .await
                .map_err(|e| EngineError::TransientBackend(format!("snapshot load: {e}")))?;
            loaded += done.rows_affected();
        }
        Ok(loaded)
    }

    async fn summary_percentiles(
        &self,
        run_id: Uuid,
    ) -> Result<Option<DurablePercentiles>, EngineError> {
        let overall = self
            .percentile_row(
                "SELECT count(*) AS n,
                        min(app_elapsed_ms) AS min_ms,
                        avg(app_elapsed_ms) AS avg_ms,
                        percentile_cont(0.50) WITHIN GROUP (ORDER BY app_elapsed_ms) AS p50,
                        percentile_cont(0.90) WITHIN GROUP (ORDER BY app_elapsed_ms) AS p90,
                        percentile_cont(0.95) WITHIN GROUP (ORDER BY app_elapsed_ms) AS p95,
                        percentile_cont(0.99) WITHIN GROUP (ORDER BY app_elapsed_ms) AS p99,
                        max(app_elapsed_ms) AS max_ms
                 FROM bench_outcomes
                 WHERE run_id = $1 AND success AND NOT warmup",
                run_id,
            )
            .await?;
        let Some(overall) = overall else {
            return Ok(None);
        };

        let mut by_kind = BTreeMap::new();
        let rows = sqlx::query(
            "SELECT kind,
                    count(*) AS n,
                    min(app_elapsed_ms) AS min_ms,
                    avg(app_elapsed_ms) AS avg_ms,
                    percentile_cont(0.50) WITHIN GROUP (ORDER BY app_elapsed_ms) AS p50,
                    percentile_cont(0.90) WITHIN GROUP (ORDER BY app_elapsed_ms) AS p90,
                    percentile_cont(0.95) WITHIN GROUP (ORDER BY app_elapsed_ms) AS p95,
                    percentile_cont(0.99) WITHIN GROUP (ORDER BY app_elapsed_ms) AS p99,
                    max(app_elapsed_ms) AS max_ms
             FROM bench_outcomes
             WHERE run_id = $1 AND success AND NOT warmup
             GROUP BY kind",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::TransientBackend(format!("kind percentiles: {e}")))?;
        for row in rows {
            let kind: String = row
                .try_get("kind")
                .map_err(|e| EngineError::TransientBackend(format!("kind decode: {e}")))?;
            let get = |name: &str| -> f64 {
                row.try_get::<Option<f64>, _>(name).ok().flatten().unwrap_or(0.0)
            };
            by_kind.insert(
                kind,
                LatencyStats {
                    min: get("min_ms"),
                    avg: get("avg_ms"),
                    p50: get("p50"),
                    p90: get("p90"),
                    p95: get("p95"),
                    p99: get("p99"),
                    max: get("max_ms"),
                },
            );
        }

        // App-side overhead requires server timings joined onto outcomes.
        let app_overhead = self
            .percentile_row(
                "SELECT count(*) AS n,
                        min(app_elapsed_ms - server_elapsed_ms) AS min_ms,
                        avg(app_elapsed_ms - server_elapsed_ms) AS avg_ms,
                        percentile_cont(0.50) WITHIN GROUP (ORDER BY app_elapsed_ms - server_elapsed_ms) AS p50,
                        percentile_cont(0.90) WITHIN GROUP (ORDER BY app_elapsed_ms - server_elapsed_ms) AS p90,
                        percentile_cont(0.95) WITHIN GROUP (ORDER BY app_elapsed_ms - server_elapsed_ms) AS p95,
                        percentile_cont(0.99) WITHIN GROUP (ORDER BY app_elapsed_ms - server_elapsed_ms) AS p99,
                        max(app_elapsed_ms - server_elapsed_ms) AS max_ms
                 FROM bench_outcomes
                 WHERE run_id = $1 AND success AND NOT warmup
                   AND server_elapsed_ms IS NOT NULL",
                run_id,
            )
            .await?;

        Ok(Some(DurablePercentiles {
            overall,
            by_kind,
            app_overhead,
        }))
    }
}

// ── Value pool store ───────────────────────────────────────────

pub struct PgValuePoolStore {
    pool: PgPool,
}

impl PgValuePoolStore {
    pub fn new(pool: PgPool) -> Self {
        PgValuePoolStore { pool }
    }

    /// Sample the target table into the pool table (the out-of-band
    /// preparation step). Existing entries for the pool id are replaced.
    pub async fn prepare(
        &self,
        pool_id: &str,
        table: &str,
        profile: &TableProfile,
        concurrency: u32,
    ) -> Result<(), EngineError> {
        sqlx::query("DELETE FROM bench_value_pools WHERE pool_id = $1")
            .bind(pool_id)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::TransientBackend(format!("pool clear: {e}")))?;

        if let Some(key_col) = &profile.id_column {
            let n = crate::pools::key_pool_size(concurrency);
            self.sample_column(pool_id, PoolKind::Key, table, key_col, n).await?;
        }
        if let Some(time_col) = &profile.time_column {
            let n = crate::pools::range_pool_size(concurrency);
            self.sample_column(pool_id, PoolKind::Range, table, time_col, n).await?;
        }
        let n = crate::pools::row_pool_size(concurrency);
        let sql = format!(
            "INSERT INTO bench_value_pools (pool_id, pool_kind, column_name, seq, value)
             SELECT $1, 'ROW', NULL, row_number() OVER () - 1, to_jsonb(t)
             FROM (SELECT * FROM {table} ORDER BY random() LIMIT {n}) t"
        );
        sqlx::query(&sql)
            .bind(pool_id)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::TransientBackend(format!("row pool sample: {e}")))?;

        info!(pool_id, table, "value pools prepared");
        Ok(())
    }

    async fn sample_column(
        &self,
        pool_id: &str,
        kind: PoolKind,
        table: &str,
        column: &str,
        n: usize,
    ) -> Result<(), EngineError> {
        let sql = format!(
            "INSERT INTO bench_value_pools (pool_id, pool_kind, column_name, seq, value)
             SELECT $1, $2, $3, row_number() OVER () - 1, to_jsonb(v)
             FROM (SELECT \"{column}\" AS v FROM {table}
                   WHERE \"{column}\" IS NOT NULL ORDER BY random() LIMIT {n}) s"
        );
        sqlx::query(&sql)
            .bind(pool_id)
            .bind(kind.as_str())
            .bind(column)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::TransientBackend(format!("pool sample {column}: {e}")))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl crate::pools::ValuePoolStore for PgValuePoolStore {
    async fn load(&self, pool_id: &str) -> Result<ValuePools, EngineError> {
        let rows = sqlx::query(
            "SELECT pool_kind, column_name, value::text
             FROM bench_value_pools
             WHERE pool_id = $1
             ORDER BY pool_kind, column_name, seq",
        )
        .bind(pool_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::TransientBackend(format!("pool load: {e}")))?;

        let mut pools = ValuePools::empty();
        for row in rows {
            let kind: String = row
                .try_get(0)
                .map_err(|e| EngineError::TransientBackend(format!("pool decode: {e}")))?;
            let column: Option<String> = row
                .try_get(1)
                .map_err(|e| EngineError::TransientBackend(format!("pool decode: {e}")))?;
            let raw: Option<String> = row
                .try_get(2)
                .map_err(|e| EngineError::TransientBackend(format!("pool decode: {e}")))?;
            let Some(raw) = raw else { continue };
            let json: serde_json::Value = serde_json::from_str(&raw)
                .map_err(|e| EngineError::TransientBackend(format!("pool value parse: {e}")))?;

            match kind.to_uppercase().as_str() {
                "KEY" => {
                    if let Some(col) = &column {
                        pools.push_key(col, Value::from_json(&json));
                    }
                }
                "RANGE" => {
                    if let Some(col) = &column {
                        pools.push_range(col, Value::from_json(&json));
                    }
                }
                "ROW" => {
                    if let serde_json::Value::Object(map) = json {
                        let row_map: BTreeMap<String, Value> = map
                            .iter()
                            .map(|(k, v)| (k.clone(), Value::from_json(v)))
                            .collect();
                        pools.push_row(row_map);
                    }
                }
                _ => {}
            }
        }
        Ok(pools)
    }
}

// ── Table catalog ──────────────────────────────────────────────

pub struct PostgresCatalog {
    pool: PgPool,
}

impl PostgresCatalog {
    pub fn new(pool: PgPool) -> Self {
        PostgresCatalog { pool }
    }
}

#[async_trait::async_trait]
impl TableCatalog for PostgresCatalog {
    async fn describe(
        &self,
        _database: &str,
        schema: &str,
        table: &str,
    ) -> Result<Vec<ColumnInfo>, EngineError> {
        let columns = sqlx::query(
            "SELECT column_name, data_type, is_nullable, column_default
             FROM information_schema.columns
             WHERE upper(table_schema) = upper($1) AND upper(table_name) = upper($2)
             ORDER BY ordinal_position",
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::Profile(format!("describe failed: {e}")))?;
        if columns.is_empty() {
            return Err(EngineError::Profile(format!(
                "table {schema}.{table} has no columns (missing table?)"
            )));
        }

        let pk_rows = sqlx::query(
            "SELECT kcu.column_name
             FROM information_schema.table_constraints tc
             JOIN information_schema.key_column_usage kcu
               ON tc.constraint_name = kcu.constraint_name
              AND tc.table_schema = kcu.table_schema
             WHERE tc.constraint_type = 'PRIMARY KEY'
               AND upper(tc.table_schema) = upper($1)
               AND upper(tc.table_name) = upper($2)",
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::Profile(format!("pk lookup failed: {e}")))?;
        let pk_cols: Vec<String> = pk_rows
            .iter()
            .filter_map(|r| r.try_get::<String, _>(0).ok())
            .map(|c| c.to_uppercase())
            .collect();

        let mut out = Vec::with_capacity(columns.len());
        for row in columns {
            let name: String = row
                .try_get(0)
                .map_err(|e| EngineError::Profile(format!("describe decode: {e}")))?;
            let sql_type: String = row
                .try_get(1)
                .map_err(|e| EngineError::Profile(format!("describe decode: {e}")))?;
            let nullable: String = row
                .try_get(2)
                .map_err(|e| EngineError::Profile(format!("describe decode: {e}")))?;
            let default: Option<String> = row
                .try_get(3)
                .map_err(|e| EngineError::Profile(format!("describe decode: {e}")))?;
            let upper = name.to_uppercase();
            out.push(ColumnInfo {
                primary_key: pk_cols.contains(&upper),
                name: upper,
                sql_type,
                nullable: nullable.eq_ignore_ascii_case("yes"),
                default,
            });
        }
        Ok(out)
    }

    async fn minmax(
        &self,
        table: &str,
        column: &str,
    ) -> Result<(Option<Value>, Option<Value>), EngineError> {
        let sql =
            format!("SELECT min(\"{column}\")::text, max(\"{column}\")::text FROM {table}");
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| EngineError::Profile(format!("min/max failed: {e}")))?;
        let lo: Option<String> = row
            .try_get(0)
            .map_err(|e| EngineError::Profile(format!("min/max decode: {e}")))?;
        let hi: Option<String> = row
            .try_get(1)
            .map_err(|e| EngineError::Profile(format!("min/max decode: {e}")))?;
        Ok((
            lo.map(|s| Value::from_text(&s)),
            hi.map(|s| Value::from_text(&s)),
        ))
    }
}
