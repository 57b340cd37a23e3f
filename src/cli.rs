//! # CLI Handlers — Headless Run, Validate, Pool Preparation
//!
//! Command implementations behind `main.rs`. A headless run drives one
//! worker group against the target database, streams progress lines to
//! stderr (the dashboard consumes the same snapshots through the registry
//! when embedded), and exits 0 on COMPLETED, 130 on CANCELLED, 1
//! otherwise.

use crate::connection::PostgresPool;
use crate::db::{PgValuePoolStore, PostgresCatalog, ResultsStore};
use crate::pools::NoPools;
use crate::profile::build_profile;
use crate::registry::RunRegistry;
use crate::run::{Run, RunDeps, RunStatus};
use crate::scenario::Scenario;
use crate::sink::{BulkLoader, DurableSink, FileSink, DEFAULT_FLUSH_THRESHOLD};
use crate::template::TemplateConfig;
use crate::Kind;
use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub struct RunOptions {
    pub database_url: Option<String>,
    pub results_url: Option<String>,
    pub template_path: PathBuf,
    pub template_id: Option<String>,
    pub worker_group_id: u32,
    pub worker_group_count: u32,
    pub concurrency: Option<u32>,
    pub target_qps: Option<f64>,
    pub duration: Option<u64>,
    pub spool_dir: PathBuf,
    pub no_store: bool,
}

pub fn load_template(path: &Path) -> Result<TemplateConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read template {}", path.display()))?;
    let cfg: TemplateConfig = serde_json::from_str(&raw)
        .with_context(|| format!("cannot parse template {}", path.display()))?;
    Ok(cfg)
}

/// Validate a template and print the planned schedule.
pub fn run_validate(path: &Path) -> Result<()> {
    let cfg = load_template(path)?;
    let scenario = Scenario::from_template(&cfg)?;
    println!("template: OK");
    println!("table:    {}", scenario.table);
    println!("backend:  {:?}", scenario.backend);
    println!("mode:     {:?}", scenario.load_mode);
    for kind in Kind::ALL {
        let weight = scenario.weights.get(kind);
        println!(
            "  {:<14} weight {:>3}  schedule slots {:>3}",
            kind.as_str(),
            weight,
            scenario.schedule.count_of(kind)
        );
    }
    Ok(())
}

/// Sample the target table into persisted value pools (the out-of-band
/// template preparation step).
pub async fn run_prepare_pools(
    database_url: &str,
    path: &Path,
    pool_id: Option<String>,
) -> Result<()> {
    let cfg = load_template(path)?;
    let scenario = Scenario::from_template(&cfg)?;
    let pool_id = pool_id
        .or_else(|| scenario.ai.pool_id.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let store = ResultsStore::connect(database_url).await?;
    store.ensure_schema().await?;
    let catalog = PostgresCatalog::new(store.pool().clone());
    let parts: Vec<&str> = scenario.table.split('.').collect();
    let (db, schema, table) = match parts.as_slice() {
        [db, schema, table] => (*db, *schema, *table),
        _ => bail!("table name must be DATABASE.SCHEMA.TABLE"),
    };
    let profile = build_profile(&catalog, db, schema, table, None, None).await?;

    let pg_table = format!("{schema}.{table}");
    PgValuePoolStore::new(store.pool().clone())
        .prepare(&pool_id, &pg_table, &profile, scenario.concurrency)
        .await?;
    println!("pools prepared: pool_id={pool_id}");
    Ok(())
}

/// Execute one benchmark run headlessly. Returns the process exit code.
pub async fn run_benchmark(opts: RunOptions) -> Result<i32> {
    let database_url = opts
        .database_url
        .as_deref()
        .context("DATABASE_URL is required (set via --database-url or env)")?;

    let mut cfg = load_template(&opts.template_path)?;
    if let Some(cc) = opts.concurrency {
        cfg.concurrent_connections = cc;
    }
    if let Some(qps) = opts.target_qps {
        cfg.target_qps = Some(qps);
    }
    if let Some(duration) = opts.duration {
        cfg.duration = duration;
    }
    let scenario = Scenario::from_template(&cfg)?;

    let workload_pool = Arc::new(
        PostgresPool::connect(database_url, scenario.concurrency.max(scenario.min_workers))
            .await?,
    );
    let catalog = Arc::new(PostgresCatalog::new(workload_pool.inner().clone()));

    let store = if opts.no_store {
        None
    } else {
        let url = opts.results_url.as_deref().unwrap_or(database_url);
        let store = ResultsStore::connect(url).await?;
        store.ensure_schema().await?;
        Some(Arc::new(store))
    };

    let run_id = Uuid::new_v4();
    let file_sink = Arc::new(FileSink::new(
        run_id,
        &opts.spool_dir.join(run_id.simple().to_string()),
        DEFAULT_FLUSH_THRESHOLD,
    )?);
    // Workers gate per-operation capture themselves (warmup ops always,
    // measurement ops only with collect_query_history); snapshots always
    // spool.
    let sink: Arc<dyn DurableSink> = file_sink.clone();

    let pool_store: Arc<dyn crate::pools::ValuePoolStore> = match &store {
        Some(s) => Arc::new(PgValuePoolStore::new(s.pool().clone())),
        None => Arc::new(NoPools),
    };
    let loader: Option<Arc<dyn BulkLoader>> = store
        .as_ref()
        .map(|s| s.clone() as Arc<dyn BulkLoader>);

    let registry = Arc::new(RunRegistry::new());
    let run = Run::with_id(
        scenario,
        RunDeps {
            pool: workload_pool,
            catalog: Some(catalog),
            pool_store,
            sink,
            file_sink: Some(file_sink),
            loader,
            registry: Some(registry.clone()),
            worker_group_id: opts.worker_group_id,
            worker_group_count: opts.worker_group_count,
            resource_probe: std::sync::Mutex::new(None),
        },
        run_id,
    );

    if let Some(store) = &store {
        let name = opts
            .template_id
            .clone()
            .unwrap_or_else(|| run.scenario().name.clone());
        store.insert_run_start(run_id, &name).await?;
    }

    registry.register(run_id, run.stop_flag(), None);
    spawn_progress_reporter(&registry, run_id);

    // Ctrl-C requests a graceful stop; the run drains and lands CANCELLED.
    {
        let run = run.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping run");
                run.request_stop();
            }
        });
    }

    info!(%run_id, template = %opts.template_path.display(), "starting benchmark run");
    let summary = run.execute().await?;

    if let Some(store) = &store {
        if let Err(e) = store.update_run_final(&summary).await {
            warn!(error = %e, "failed to persist terminal summary");
        }
    }

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(match summary.status {
        RunStatus::Completed => 0,
        RunStatus::Cancelled => 130,
        _ => 1,
    })
}

/// Print one progress line per second to stderr while the run is live.
fn spawn_progress_reporter(registry: &Arc<RunRegistry>, run_id: Uuid) {
    let Some(subscription) = registry.subscribe(run_id) else {
        return;
    };
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            let Some(snap) = subscription.drain().into_iter().last() else {
                continue;
            };
            let secs = snap.elapsed_total_seconds as u64;
            eprintln!(
                "[{:02}:{:02}:{:02}] {:?} | ops: {} | {:.1}/s | p95: {:.1}ms | errors: {} | workers: {}",
                secs / 3600,
                (secs % 3600) / 60,
                secs % 60,
                snap.phase,
                snap.ops.total,
                snap.ops.current_per_sec,
                snap.latency.p95,
                snap.errors.count,
                snap.connections.target,
            );
            if snap.status.is_terminal() {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_template(dir: &Path, body: serde_json::Value) -> PathBuf {
        let path = dir.join("template.json");
        std::fs::write(&path, serde_json::to_string_pretty(&body).unwrap()).unwrap();
        path
    }

    #[test]
    fn load_template_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_template(
            dir.path(),
            serde_json::json!({
                "workload_type": "CUSTOM",
                "custom_point_lookup_pct": 100,
                "custom_point_lookup_query": "SELECT * FROM {table} WHERE ID = ?",
                "database": "D", "schema": "S", "table_name": "T",
                "concurrent_connections": 2
            }),
        );
        let cfg = load_template(&path).unwrap();
        assert_eq!(cfg.table_name, "T");
        assert_eq!(cfg.custom_point_lookup_pct, 100);
    }

    #[test]
    fn validate_accepts_good_and_rejects_bad() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_template(
            dir.path(),
            serde_json::json!({
                "workload_type": "CUSTOM",
                "custom_insert_pct": 100,
                "custom_insert_query": "INSERT INTO {table} (ID) VALUES (?)",
                "database": "D", "schema": "S", "table_name": "T",
                "concurrent_connections": 2
            }),
        );
        run_validate(&good).unwrap();

        let bad = write_template(
            dir.path(),
            serde_json::json!({
                "workload_type": "READ_HEAVY",
                "database": "D", "schema": "S", "table_name": "T"
            }),
        );
        assert!(run_validate(&bad).is_err());
    }

    #[test]
    fn missing_template_file_is_an_error() {
        let err = load_template(Path::new("/nonexistent/t.json")).unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }
}
