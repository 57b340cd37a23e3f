//! Shared test helpers for integration tests.
//!
//! No database or network access required: the mock pool executes
//! operations in-process with configurable latency and fault injection,
//! and the mock catalog/pool-store reproduce the canonical test table
//! (`ID NUMBER PK`, `DATA VARCHAR(255)`, `TS TIMESTAMP`, id range 1–1000,
//! 5000 pooled keys, 2000 pooled time cutoffs).

#![allow(dead_code)]

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use loadmark::connection::{ConnectionPool, ExecInfo, ExecOutput, PoolStats};
use loadmark::error::EngineError;
use loadmark::pools::{Value, ValuePoolStore, ValuePools};
use loadmark::profile::{ColumnInfo, TableCatalog};
use loadmark::resources::{ResourceProbe, ResourceSample};
use loadmark::run::{Run, RunDeps};
use loadmark::scenario::Scenario;
use loadmark::sink::{DurableSink, NullSink};
use loadmark::template::TemplateConfig;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-process stand-in for a backend connection pool.
pub struct MockPool {
    pub base_latency: Duration,
    /// When `Some((threshold, slow))`, operations observe `slow` latency
    /// while more than `threshold` calls are in flight.
    pub slow_above: Option<(usize, Duration)>,
    /// Fail every Nth operation with a transient backend error.
    pub fail_every: Option<u64>,
    pub max_connections: u32,
    active: AtomicUsize,
    executed: AtomicU64,
}

impl MockPool {
    pub fn fast() -> Arc<MockPool> {
        MockPool::with_latency(Duration::from_millis(1))
    }

    pub fn with_latency(latency: Duration) -> Arc<MockPool> {
        Arc::new(MockPool {
            base_latency: latency,
            slow_above: None,
            fail_every: None,
            max_connections: 64,
            active: AtomicUsize::new(0),
            executed: AtomicU64::new(0),
        })
    }

    pub fn degrading(
        latency: Duration,
        threshold: usize,
        slow: Duration,
    ) -> Arc<MockPool> {
        Arc::new(MockPool {
            base_latency: latency,
            slow_above: Some((threshold, slow)),
            fail_every: None,
            max_connections: 64,
            active: AtomicUsize::new(0),
            executed: AtomicU64::new(0),
        })
    }

    pub fn flaky(latency: Duration, fail_every: u64) -> Arc<MockPool> {
        Arc::new(MockPool {
            base_latency: latency,
            slow_above: None,
            fail_every: Some(fail_every),
            max_connections: 64,
            active: AtomicUsize::new(0),
            executed: AtomicU64::new(0),
        })
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl ConnectionPool for MockPool {
    async fn execute(
        &self,
        _sql: &str,
        _params: &[Value],
        fetch: bool,
    ) -> Result<ExecOutput, EngineError> {
        let n = self.executed.fetch_add(1, Ordering::Relaxed);
        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        let latency = match self.slow_above {
            Some((threshold, slow)) if active > threshold => slow,
            _ => self.base_latency,
        };
        tokio::time::sleep(latency).await;
        self.active.fetch_sub(1, Ordering::Relaxed);

        if let Some(k) = self.fail_every {
            if k > 0 && n % k == k - 1 {
                return Err(EngineError::TransientBackend("injected failure".into()));
            }
        }
        Ok(ExecOutput {
            rows_returned: if fetch { 1 } else { 0 },
            info: ExecInfo {
                query_id: Some(format!("MOCK_{n}")),
                rowcount: Some(1),
                server_elapsed_ms: None,
            },
        })
    }

    fn stats(&self) -> PoolStats {
        let active = self.active.load(Ordering::Relaxed) as u32;
        PoolStats {
            active,
            idle: self.max_connections.saturating_sub(active),
            max: self.max_connections,
        }
    }
}

/// Catalog reporting the canonical test table.
pub struct MockCatalog;

#[async_trait::async_trait]
impl TableCatalog for MockCatalog {
    async fn describe(
        &self,
        _database: &str,
        _schema: &str,
        _table: &str,
    ) -> Result<Vec<ColumnInfo>, EngineError> {
        Ok(vec![
            ColumnInfo {
                name: "ID".into(),
                sql_type: "NUMBER(38,0)".into(),
                nullable: false,
                default: None,
                primary_key: true,
            },
            ColumnInfo {
                name: "DATA".into(),
                sql_type: "VARCHAR(255)".into(),
                nullable: true,
                default: None,
                primary_key: false,
            },
            ColumnInfo {
                name: "TS".into(),
                sql_type: "TIMESTAMP_NTZ".into(),
                nullable: false,
                default: None,
                primary_key: false,
            },
        ])
    }

    async fn minmax(
        &self,
        _table: &str,
        column: &str,
    ) -> Result<(Option<Value>, Option<Value>), EngineError> {
        match column {
            "ID" => Ok((Some(Value::Int(1)), Some(Value::Int(1000)))),
            "TS" => Ok((
                Some(Value::Timestamp(
                    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                )),
                Some(Value::Timestamp(
                    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
                )),
            )),
            other => Err(EngineError::Profile(format!("unknown column {other}"))),
        }
    }
}

/// Pool store with 5000 keys and 2000 time cutoffs.
pub struct MockPoolStore;

#[async_trait::async_trait]
impl ValuePoolStore for MockPoolStore {
    async fn load(&self, _pool_id: &str) -> Result<ValuePools, EngineError> {
        let mut pools = ValuePools::empty();
        for i in 0..5000i64 {
            pools.push_key("ID", Value::Int(1 + (i % 1000)));
        }
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for i in 0..2000i64 {
            pools.push_range("TS", Value::Timestamp(base + ChronoDuration::hours(i)));
        }
        Ok(pools)
    }
}

/// Probe returning a scripted constant sample.
pub struct FixedProbe(pub ResourceSample);

impl ResourceProbe for FixedProbe {
    fn sample(&mut self) -> ResourceSample {
        self.0.clone()
    }
}

/// The canonical mixed-workload template; tweak fields per test.
pub fn template(overrides: serde_json::Value) -> TemplateConfig {
    let mut base = serde_json::json!({
        "workload_type": "CUSTOM",
        "custom_point_lookup_pct": 25,
        "custom_range_scan_pct": 25,
        "custom_insert_pct": 35,
        "custom_update_pct": 15,
        "custom_point_lookup_query": "SELECT * FROM {table} WHERE ID = ?",
        "custom_range_scan_query": "SELECT * FROM {table} WHERE TS >= ? LIMIT 100",
        "custom_insert_query": "INSERT INTO {table} (ID, DATA, TS) VALUES (?, ?, ?)",
        "custom_update_query": "UPDATE {table} SET DATA = ? WHERE ID = ?",
        "database": "BENCH_DB",
        "schema": "PUBLIC",
        "table_name": "ORDERS",
        "duration": 2,
        "warmup": 1,
        "concurrent_connections": 4,
        "ai_workload": { "pool_id": "test-pool" }
    });
    if let (Some(base_map), Some(patch)) = (base.as_object_mut(), overrides.as_object()) {
        for (k, v) in patch {
            base_map.insert(k.clone(), v.clone());
        }
    }
    serde_json::from_value(base).expect("test template must parse")
}

pub fn scenario(overrides: serde_json::Value) -> Scenario {
    Scenario::from_template(&template(overrides)).expect("test template must validate")
}

/// Assemble a run against the mock collaborators.
pub fn mock_run(scenario: Scenario, pool: Arc<MockPool>) -> Arc<Run> {
    mock_run_with(scenario, pool, Arc::new(NullSink), None)
}

pub fn mock_run_with(
    scenario: Scenario,
    pool: Arc<MockPool>,
    sink: Arc<dyn DurableSink>,
    probe: Option<Box<dyn ResourceProbe>>,
) -> Arc<Run> {
    Run::new(
        scenario,
        RunDeps {
            pool,
            catalog: Some(Arc::new(MockCatalog)),
            pool_store: Arc::new(MockPoolStore),
            sink,
            file_sink: None,
            loader: None,
            registry: None,
            worker_group_id: 0,
            worker_group_count: 1,
            resource_probe: Mutex::new(probe),
        },
    )
}
