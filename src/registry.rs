//! # Run Registry — Ownership and the Live Channel
//!
//! The registry owns runs (runs hold no back-pointer; subscribers receive
//! run ids and re-resolve as needed) and fans live snapshots out to
//! bounded subscriber queues.
//!
//! ## Delivery
//!
//! Each subscriber queue holds at most 50 snapshots; on overflow the
//! oldest is dropped — a slow dashboard client falls behind, it never
//! stalls the publisher.
//!
//! ## Publisher Health
//!
//! A run may have several publishers (worker groups on distinct nodes).
//! Health derives from the age of a publisher's last snapshot: `HEALTHY`
//! under 30 s, `STALE` between 30 and 60 s, `DEAD` beyond. The aggregate
//! snapshot sums counters and QPS across non-DEAD publishers, sums
//! connections across all of them, and recomputes latency percentiles from
//! the union of the publishers' reservoirs.

use crate::aggregator::{percentile, ReservoirSet};
use crate::snapshot::{KindLatency, LiveSnapshot};
use crate::Kind;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const SUBSCRIBER_QUEUE_CAP: usize = 50;
pub const HEALTHY_MAX_AGE: Duration = Duration::from_secs(30);
pub const STALE_MAX_AGE: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublisherHealth {
    Healthy,
    Stale,
    Dead,
}

impl PublisherHealth {
    pub fn from_age(age: Duration) -> PublisherHealth {
        if age < HEALTHY_MAX_AGE {
            PublisherHealth::Healthy
        } else if age < STALE_MAX_AGE {
            PublisherHealth::Stale
        } else {
            PublisherHealth::Dead
        }
    }
}

type SnapshotQueue = Arc<Mutex<VecDeque<LiveSnapshot>>>;

/// A subscriber's bounded view of one run's snapshot stream.
pub struct Subscription {
    queue: SnapshotQueue,
}

impl Subscription {
    /// Take everything queued since the last drain.
    pub fn drain(&self) -> Vec<LiveSnapshot> {
        self.queue.lock().unwrap().drain(..).collect()
    }

    pub fn try_recv(&self) -> Option<LiveSnapshot> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }
}

struct PublisherState {
    last_at: Instant,
    last: LiveSnapshot,
    reservoirs: ReservoirSet,
}

struct RunEntry {
    stop: Arc<AtomicBool>,
    task: Option<tokio::task::JoinHandle<()>>,
    subscribers: Vec<SnapshotQueue>,
    publishers: HashMap<u32, PublisherState>,
}

/// Registry with an explicit lifecycle: `new` → `register`/`publish` →
/// `shutdown`. Shutdown signals every registered run and awaits them with
/// a grace timeout, in place of process-wide singletons.
#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<uuid::Uuid, RunEntry>>,
}

impl RunRegistry {
    pub fn new() -> RunRegistry {
        RunRegistry::default()
    }

    /// Register a run's stop flag (and optionally its driving task) so
    /// `shutdown` can cancel it.
    pub fn register(
        &self,
        run_id: uuid::Uuid,
        stop: Arc<AtomicBool>,
        task: Option<tokio::task::JoinHandle<()>>,
    ) {
        self.runs.lock().unwrap().insert(
            run_id,
            RunEntry {
                stop,
                task,
                subscribers: Vec::new(),
                publishers: HashMap::new(),
            },
        );
    }

    pub fn remove(&self, run_id: uuid::Uuid) {
        self.runs.lock().unwrap().remove(&run_id);
    }

    pub fn subscribe(&self, run_id: uuid::Uuid) -> Option<Subscription> {
        let mut runs = self.runs.lock().unwrap();
        let entry = runs.get_mut(&run_id)?;
        let queue: SnapshotQueue =
            Arc::new(Mutex::new(VecDeque::with_capacity(SUBSCRIBER_QUEUE_CAP)));
        entry.subscribers.push(queue.clone());
        Some(Subscription { queue })
    }

    /// Publish one snapshot from a worker group. Subscriber queues are
    /// bounded; the oldest snapshot gives way on overflow.
    pub fn publish(
        &self,
        run_id: uuid::Uuid,
        group_id: u32,
        snapshot: LiveSnapshot,
        reservoirs: ReservoirSet,
    ) {
        let mut runs = self.runs.lock().unwrap();
        let Some(entry) = runs.get_mut(&run_id) else {
            return;
        };
        for queue in &entry.subscribers {
            let mut q = queue.lock().unwrap();
            if q.len() >= SUBSCRIBER_QUEUE_CAP {
                q.pop_front();
            }
            q.push_back(snapshot.clone());
        }
        entry.publishers.insert(
            group_id,
            PublisherState {
                last_at: Instant::now(),
                last: snapshot,
                reservoirs,
            },
        );
    }

    pub fn publisher_health(&self, run_id: uuid::Uuid, group_id: u32) -> Option<PublisherHealth> {
        let runs = self.runs.lock().unwrap();
        let entry = runs.get(&run_id)?;
        let publisher = entry.publishers.get(&group_id)?;
        Some(PublisherHealth::from_age(publisher.last_at.elapsed()))
    }

    /// Merge the latest snapshots of every publisher of a run into one
    /// aggregate view. Returns `None` until at least one publisher exists.
    pub fn aggregate(&self, run_id: uuid::Uuid) -> Option<LiveSnapshot> {
        let runs = self.runs.lock().unwrap();
        let entry = runs.get(&run_id)?;
        if entry.publishers.is_empty() {
            return None;
        }

        let mut publishers: Vec<(&PublisherState, PublisherHealth)> = entry
            .publishers
            .values()
            .map(|p| (p, PublisherHealth::from_age(p.last_at.elapsed())))
            .collect();
        // Deterministic template: the most recent snapshot.
        publishers.sort_by_key(|(p, _)| std::cmp::Reverse(p.last_at));
        let mut merged = publishers[0].0.last.clone();

        let mut union = ReservoirSet::default();
        let mut ops = crate::snapshot::OpsBlock::default();
        let mut operations = crate::snapshot::OperationsBlock::default();
        let mut errors = crate::snapshot::ErrorsBlock::default();
        let mut connections = crate::snapshot::ConnectionsBlock::default();

        for (p, health) in &publishers {
            // Connections count for every publisher, even dead ones.
            connections.active += p.last.connections.active;
            connections.idle += p.last.connections.idle;
            connections.target += p.last.connections.target;

            if *health == PublisherHealth::Dead {
                continue;
            }
            ops.total += p.last.ops.total;
            ops.current_per_sec += p.last.ops.current_per_sec;
            ops.avg_per_sec += p.last.ops.avg_per_sec;
            ops.peak_per_sec += p.last.ops.peak_per_sec;
            operations.reads += p.last.operations.reads;
            operations.writes += p.last.operations.writes;
            operations.updates += p.last.operations.updates;
            operations.deletes += p.last.operations.deletes;
            errors.count += p.last.errors.count;

            union.overall.extend_from_slice(&p.reservoirs.overall);
            for kind in Kind::ALL {
                union
                    .by_kind
                    .get_mut(kind)
                    .extend_from_slice(p.reservoirs.by_kind.get(kind));
            }
        }
        errors.rate = if ops.total > 0 {
            errors.count as f64 / ops.total as f64
        } else {
            0.0
        };

        merged.ops = ops;
        merged.operations = operations;
        merged.errors = errors;
        merged.connections = connections;

        union
            .overall
            .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        merged.latency.p50 = percentile(&union.overall, 50.0);
        merged.latency.p95 = percentile(&union.overall, 95.0);
        merged.latency.p99 = percentile(&union.overall, 99.0);
        merged.latency.avg = if union.overall.is_empty() {
            0.0
        } else {
            union.overall.iter().sum::<f64>() / union.overall.len() as f64
        };

        merged.latency_by_kind = Kind::ALL
            .iter()
            .map(|kind| {
                let mut samples = union.by_kind.get(*kind).clone();
                samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                (
                    kind.as_str().to_string(),
                    KindLatency {
                        p50: percentile(&samples, 50.0),
                        p95: percentile(&samples, 95.0),
                        p99: percentile(&samples, 99.0),
                        samples: samples.len(),
                        samples_available: !samples.is_empty(),
                    },
                )
            })
            .collect();

        Some(merged)
    }

    /// Cancel every registered run and await the driving tasks with a
    /// grace timeout.
    pub async fn shutdown(&self, grace: Duration) {
        let entries: Vec<(uuid::Uuid, Arc<AtomicBool>, Option<tokio::task::JoinHandle<()>>)> = {
            let mut runs = self.runs.lock().unwrap();
            runs.drain()
                .map(|(id, mut e)| (id, e.stop.clone(), e.task.take()))
                .collect()
        };
        for (_, stop, _) in &entries {
            stop.store(true, Ordering::Relaxed);
        }
        let deadline = Instant::now() + grace;
        for (run_id, _, task) in entries {
            let Some(task) = task else { continue };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, task).await.is_err() {
                warn!(%run_id, "run did not stop within shutdown grace");
            }
        }
        info!("registry shutdown complete");
    }
}
