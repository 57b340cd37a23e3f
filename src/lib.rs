//! # Loadmark — Core Library
//!
//! Re-exports the benchmark engine modules and provides shared types used
//! across the workload pipeline: the operation [`Kind`] sum type and the
//! [`PerKind`] container that most metric structures are built from.
//!
//! ## Module Organization
//!
//! **Workload modules** (plan → bind → execute):
//! - [`template`] — template config parsing and validation
//! - [`scenario`] — frozen run scenario + smooth weighted round-robin schedule
//! - [`profile`] — table profiling (key/time column discovery, id bounds)
//! - [`pools`] — persisted value pools and the host `Value` type
//! - [`params`] — per-worker bind-parameter generation
//! - [`worker`] — the operation loop issuing SQL and recording outcomes
//!
//! **Control modules** (steer → observe → persist):
//! - [`controller`] — worker-set scaling for the three load modes + guardrails
//! - [`aggregator`] — counters, latency reservoirs, QPS windows
//! - [`resources`] — host/process/cgroup resource sampling
//! - [`run`] — the run lifecycle state machine
//! - [`registry`] — run ownership and the live snapshot channel
//! - [`sink`], [`db`] — buffered durable persistence of outcomes and results
//!
//! ## Design Philosophy
//!
//! Every operation flows the same pipeline: **schedule → bind → execute →
//! record**. The connection pool, table catalog, value-pool store, and
//! durable sink are trait seams so a run can execute against Postgres,
//! Snowflake, or an in-memory mock without the engine knowing which.

pub mod aggregator;
pub mod cli;
pub mod connection;
pub mod controller;
pub mod db;
pub mod error;
pub mod params;
pub mod pools;
pub mod profile;
pub mod registry;
pub mod resources;
pub mod run;
pub mod scenario;
pub mod sink;
pub mod snapshot;
pub mod template;
pub mod worker;

use serde::{Deserialize, Serialize};

/// The four canonical operation kinds of a workload. Declaration order is
/// load-bearing: schedule ties break by this order, and [`PerKind`] indexes
/// by it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Kind {
    PointLookup,
    RangeScan,
    Insert,
    Update,
}

impl Kind {
    /// All kinds in stable declaration order.
    pub const ALL: [Kind; 4] = [Kind::PointLookup, Kind::RangeScan, Kind::Insert, Kind::Update];

    /// Wire name, matching the template config and durable storage.
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::PointLookup => "POINT_LOOKUP",
            Kind::RangeScan => "RANGE_SCAN",
            Kind::Insert => "INSERT",
            Kind::Update => "UPDATE",
        }
    }

    /// Reads fetch result rows; writes only report affected counts.
    pub fn is_read(self) -> bool {
        matches!(self, Kind::PointLookup | Kind::RangeScan)
    }

    fn index(self) -> usize {
        match self {
            Kind::PointLookup => 0,
            Kind::RangeScan => 1,
            Kind::Insert => 2,
            Kind::Update => 3,
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Kind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "POINT_LOOKUP" => Ok(Kind::PointLookup),
            "RANGE_SCAN" => Ok(Kind::RangeScan),
            "INSERT" => Ok(Kind::Insert),
            "UPDATE" => Ok(Kind::Update),
            other => Err(format!("unknown operation kind: {other:?}")),
        }
    }
}

/// One value per [`Kind`], indexed in declaration order. Used for weights,
/// SQL templates, counters, and latency buckets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PerKind<T>(pub [T; 4]);

impl<T> PerKind<T> {
    pub fn get(&self, kind: Kind) -> &T {
        &self.0[kind.index()]
    }

    pub fn get_mut(&mut self, kind: Kind) -> &mut T {
        &mut self.0[kind.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Kind, &T)> {
        Kind::ALL.iter().map(move |k| (*k, &self.0[k.index()]))
    }

    pub fn map<U>(&self, mut f: impl FnMut(Kind, &T) -> U) -> PerKind<U> {
        PerKind([
            f(Kind::PointLookup, &self.0[0]),
            f(Kind::RangeScan, &self.0[1]),
            f(Kind::Insert, &self.0[2]),
            f(Kind::Update, &self.0[3]),
        ])
    }
}
