//! # Metrics Sink — Durable Channel
//!
//! Per-operation outcomes and 1 Hz snapshots buffer in memory; when a
//! buffer reaches its threshold it is handed to a background writer thread
//! that appends a spool file on disk (atomic temp-file + rename, so a
//! mid-write crash never leaves a torn file). At finalize the spool files
//! are bulk-loaded into the results store and summary percentiles are
//! computed with `PERCENTILE_CONT` semantics on the durable side.
//!
//! ## Failure Containment
//!
//! Sink errors never reach the worker hot path: appends are lock-push
//! only, writer errors are counted and logged, and a failed finalize
//! leaves the spool files on disk for the cleanup helper while the run
//! summary reports the degraded channel (`percentile_source` falls back).

use crate::error::EngineError;
use crate::snapshot::{LatencyStats, LiveSnapshot};
use crate::worker::Outcome;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Outcomes buffered before a spool file is cut.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 5_000;
/// Upper bound on retained per-operation records.
pub const HISTORY_CAP: usize = 200_000;

/// Exact percentiles computed on the durable outcome stream at finalize.
#[derive(Clone, Debug, Default)]
pub struct DurablePercentiles {
    pub overall: LatencyStats,
    pub by_kind: BTreeMap<String, LatencyStats>,
    /// App-side overhead (app elapsed − server elapsed) when server-side
    /// timings were joined.
    pub app_overhead: Option<LatencyStats>,
}

/// Destination the spool files are bulk-loaded into.
#[async_trait::async_trait]
pub trait BulkLoader: Send + Sync {
    async fn load_outcomes(&self, run_id: Uuid, rows: &[Outcome]) -> Result<u64, EngineError>;
    async fn load_snapshots(
        &self,
        run_id: Uuid,
        snaps: &[LiveSnapshot],
    ) -> Result<u64, EngineError>;
    async fn summary_percentiles(
        &self,
        run_id: Uuid,
    ) -> Result<Option<DurablePercentiles>, EngineError>;
}

/// The durable half of the metrics sink.
pub trait DurableSink: Send + Sync {
    /// Append-cheap; called at wire rate from workers.
    fn append_outcome(&self, outcome: &Outcome);
    fn append_snapshot(&self, snapshot: &LiveSnapshot);
    fn degraded(&self) -> bool;
}

/// Sink that drops everything (tests, dry runs).
pub struct NullSink;

impl DurableSink for NullSink {
    fn append_outcome(&self, _outcome: &Outcome) {}
    fn append_snapshot(&self, _snapshot: &LiveSnapshot) {}
    fn degraded(&self) -> bool {
        false
    }
}

enum WriteJob {
    Spool { path: PathBuf, lines: Vec<String> },
    Barrier(mpsc::Sender<()>),
}

/// File-then-bulk-load sink. Owns its spool directory exclusively.
pub struct FileSink {
    run_id: Uuid,
    dir: PathBuf,
    threshold: usize,
    outcomes: Mutex<Vec<Outcome>>,
    snapshots: Mutex<Vec<LiveSnapshot>>,
    outcome_files: Mutex<Vec<PathBuf>>,
    snapshot_files: Mutex<Vec<PathBuf>>,
    file_seq: AtomicU64,
    appended: AtomicU64,
    dropped: AtomicU64,
    job_tx: Mutex<Option<mpsc::Sender<WriteJob>>>,
    writer_failed: std::sync::Arc<AtomicU64>,
    writer: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl FileSink {
    pub fn new(run_id: Uuid, dir: &Path, threshold: usize) -> Result<FileSink, EngineError> {
        std::fs::create_dir_all(dir).map_err(|e| {
            EngineError::Configuration(format!("cannot create spool dir {}: {e}", dir.display()))
        })?;

        let (tx, rx) = mpsc::channel::<WriteJob>();
        let failed = std::sync::Arc::new(AtomicU64::new(0));
        let failed_writer = failed.clone();
        let writer = std::thread::Builder::new()
            .name("loadmark-spool-writer".into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    match job {
                        WriteJob::Spool { path, lines } => {
                            if let Err(e) = write_spool_file(&path, &lines) {
                                failed_writer.fetch_add(1, Ordering::Relaxed);
                                error!(path = %path.display(), error = %e, "spool write failed");
                            }
                        }
                        WriteJob::Barrier(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })
            .map_err(|e| EngineError::Configuration(format!("cannot start spool writer: {e}")))?;

        let sink = FileSink {
            run_id,
            dir: dir.to_path_buf(),
            threshold: threshold.max(1),
            outcomes: Mutex::new(Vec::new()),
            snapshots: Mutex::new(Vec::new()),
            outcome_files: Mutex::new(Vec::new()),
            snapshot_files: Mutex::new(Vec::new()),
            file_seq: AtomicU64::new(0),
            appended: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            job_tx: Mutex::new(Some(tx)),
            writer_failed: failed,
            writer: Mutex::new(Some(writer)),
        };
        Ok(sink)
    }

    fn next_path(&self, prefix: &str) -> PathBuf {
        let seq = self.file_seq.fetch_add(1, Ordering::Relaxed);
        self.dir
            .join(format!("{prefix}_{}_{seq:05}.jsonl", self.run_id.simple()))
    }

    fn submit(&self, path: PathBuf, lines: Vec<String>, registry: &Mutex<Vec<PathBuf>>) {
        registry.lock().unwrap().push(path.clone());
        if let Some(tx) = self.job_tx.lock().unwrap().as_ref() {
            if tx.send(WriteJob::Spool { path, lines }).is_err() {
                self.writer_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn flush_outcomes_locked(&self, buf: &mut Vec<Outcome>) {
        if buf.is_empty() {
            return;
        }
        let lines: Vec<String> = buf
            .drain(..)
            .filter_map(|o| serde_json::to_string(&o).ok())
            .collect();
        self.submit(self.next_path("outcomes"), lines, &self.outcome_files);
    }

    fn flush_snapshots_locked(&self, buf: &mut Vec<LiveSnapshot>) {
        if buf.is_empty() {
            return;
        }
        let lines: Vec<String> = buf
            .drain(..)
            .filter_map(|s| serde_json::to_string(&s).ok())
            .collect();
        self.submit(self.next_path("snapshots"), lines, &self.snapshot_files);
    }

    /// Block until the writer thread has drained every submitted job.
    fn drain_writer(&self) {
        let guard = self.job_tx.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            let (done_tx, done_rx) = mpsc::channel();
            if tx.send(WriteJob::Barrier(done_tx)).is_ok() {
                let _ = done_rx.recv_timeout(std::time::Duration::from_secs(30));
            }
        }
    }

    pub fn spool_files(&self) -> Vec<PathBuf> {
        let mut all = self.outcome_files.lock().unwrap().clone();
        all.extend(self.snapshot_files.lock().unwrap().iter().cloned());
        all
    }

    /// Flush remaining buffers, bulk-load every spool file through the
    /// loader, and compute durable percentiles. Files are removed on
    /// success; on failure they stay on disk and [`cleanup_on_error`]
    /// decides their fate.
    ///
    /// [`cleanup_on_error`]: FileSink::cleanup_on_error
    pub async fn finalize(
        &self,
        loader: Option<&dyn BulkLoader>,
    ) -> Result<Option<DurablePercentiles>, EngineError> {
        self.flush_outcomes_locked(&mut self.outcomes.lock().unwrap());
        self.flush_snapshots_locked(&mut self.snapshots.lock().unwrap());
        self.drain_writer();

        let Some(loader) = loader else {
            // No durable store configured: the spool files are the output.
            info!(dir = %self.dir.display(), "no results store; spool files retained");
            return Ok(None);
        };

        let outcome_files = self.outcome_files.lock().unwrap().clone();
        let snapshot_files = self.snapshot_files.lock().unwrap().clone();

        let mut loaded_outcomes = 0u64;
        for path in &outcome_files {
            let rows: Vec<Outcome> = read_spool_file(path)?;
            if !rows.is_empty() {
                loaded_outcomes += loader.load_outcomes(self.run_id, &rows).await?;
            }
        }
        let mut loaded_snapshots = 0u64;
        for path in &snapshot_files {
            let snaps: Vec<LiveSnapshot> = read_spool_file(path)?;
            if !snaps.is_empty() {
                loaded_snapshots += loader.load_snapshots(self.run_id, &snaps).await?;
            }
        }
        debug!(loaded_outcomes, loaded_snapshots, "bulk load complete");

        let percentiles = loader.summary_percentiles(self.run_id).await?;

        for path in self.spool_files() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "spool cleanup failed");
            }
        }
        Ok(percentiles)
    }

    /// Invoked when a run fails: spool files stay on disk for inspection,
    /// and this logs where to find them.
    pub fn cleanup_on_error(&self) {
        self.drain_writer();
        let files = self.spool_files();
        if !files.is_empty() {
            warn!(
                dir = %self.dir.display(),
                files = files.len(),
                "run failed; spool files left on disk"
            );
        }
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.appended.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }
}

impl DurableSink for FileSink {
    fn append_outcome(&self, outcome: &Outcome) {
        let appended = self.appended.fetch_add(1, Ordering::Relaxed);
        if appended >= HISTORY_CAP as u64 {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut buf = self.outcomes.lock().unwrap();
        buf.push(outcome.clone());
        if buf.len() >= self.threshold {
            self.flush_outcomes_locked(&mut buf);
        }
    }

    fn append_snapshot(&self, snapshot: &LiveSnapshot) {
        let mut buf = self.snapshots.lock().unwrap();
        buf.push(snapshot.clone());
        if buf.len() >= self.threshold {
            self.flush_snapshots_locked(&mut buf);
        }
    }

    fn degraded(&self) -> bool {
        self.writer_failed.load(Ordering::Relaxed) > 0
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        // Closing the channel ends the writer thread.
        self.job_tx.lock().unwrap().take();
        if let Some(handle) = self.writer.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Atomic spool write: temp file, then rename into place.
fn write_spool_file(path: &Path, lines: &[String]) -> std::io::Result<()> {
    let tmp = path.with_extension("jsonl.tmp");
    let mut content = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
    for line in lines {
        content.push_str(line);
        content.push('\n');
    }
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_spool_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, EngineError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| EngineError::TransientBackend(format!("spool read {}: {e}", path.display())))?;
    let mut out = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let row = serde_json::from_str(line).map_err(|e| {
            EngineError::TransientBackend(format!("spool parse {}: {e}", path.display()))
        })?;
        out.push(row);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Kind;
    use chrono::Utc;

    fn outcome(i: u32) -> Outcome {
        Outcome {
            execution_id: Uuid::new_v4(),
            worker_id: i,
            kind: Kind::PointLookup,
            start_ts: Utc::now(),
            end_ts: Utc::now(),
            app_elapsed_ms: i as f64,
            success: true,
            error: None,
            rows_returned: 1,
            rows_affected: Some(1),
            warmup: false,
            query_id: None,
            sql: "SELECT 1".into(),
            server_elapsed_ms: None,
        }
    }

    #[tokio::test]
    async fn threshold_flush_creates_spool_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(Uuid::new_v4(), dir.path(), 10).unwrap();
        for i in 0..25 {
            sink.append_outcome(&outcome(i));
        }
        sink.drain_writer();
        // Two full batches flushed; 5 remain buffered.
        let files = sink.outcome_files.lock().unwrap().clone();
        assert_eq!(files.len(), 2);
        for f in &files {
            assert!(f.exists(), "spool file missing: {}", f.display());
        }
        let rows: Vec<Outcome> = read_spool_file(&files[0]).unwrap();
        assert_eq!(rows.len(), 10);
    }

    struct CountingLoader {
        outcomes: AtomicU64,
        snapshots: AtomicU64,
    }

    #[async_trait::async_trait]
    impl BulkLoader for CountingLoader {
        async fn load_outcomes(&self, _run: Uuid, rows: &[Outcome]) -> Result<u64, EngineError> {
            self.outcomes.fetch_add(rows.len() as u64, Ordering::Relaxed);
            Ok(rows.len() as u64)
        }

        async fn load_snapshots(
            &self,
            _run: Uuid,
            snaps: &[LiveSnapshot],
        ) -> Result<u64, EngineError> {
            self.snapshots.fetch_add(snaps.len() as u64, Ordering::Relaxed);
            Ok(snaps.len() as u64)
        }

        async fn summary_percentiles(
            &self,
            _run: Uuid,
        ) -> Result<Option<DurablePercentiles>, EngineError> {
            Ok(Some(DurablePercentiles::default()))
        }
    }

    #[tokio::test]
    async fn finalize_loads_everything_and_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(Uuid::new_v4(), dir.path(), 10).unwrap();
        for i in 0..23 {
            sink.append_outcome(&outcome(i));
        }
        let loader = CountingLoader {
            outcomes: AtomicU64::new(0),
            snapshots: AtomicU64::new(0),
        };
        let result = sink.finalize(Some(&loader)).await.unwrap();
        assert!(result.is_some());
        assert_eq!(loader.outcomes.load(Ordering::Relaxed), 23);
        // All spool files were deleted after the successful load.
        for f in sink.spool_files() {
            assert!(!f.exists());
        }
    }

    #[tokio::test]
    async fn finalize_without_loader_retains_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(Uuid::new_v4(), dir.path(), 5).unwrap();
        for i in 0..7 {
            sink.append_outcome(&outcome(i));
        }
        let result = sink.finalize(None).await.unwrap();
        assert!(result.is_none());
        let files = sink.spool_files();
        assert!(!files.is_empty());
        for f in files {
            assert!(f.exists());
        }
    }

    #[test]
    fn history_cap_drops_excess_records() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(Uuid::new_v4(), dir.path(), usize::MAX >> 1).unwrap();
        // Simulate a run that already appended up to the cap.
        sink.appended.store(HISTORY_CAP as u64, Ordering::Relaxed);
        sink.append_outcome(&outcome(1));
        let (_, dropped) = sink.stats();
        assert_eq!(dropped, 1);
        assert!(sink.outcomes.lock().unwrap().is_empty());
    }

    #[test]
    fn null_sink_is_inert() {
        let sink = NullSink;
        sink.append_outcome(&outcome(0));
        assert!(!sink.degraded());
    }
}
