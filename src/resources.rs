//! # Resources — Host, Process, and Cgroup Telemetry
//!
//! Samples resource usage once per metrics tick using the [`sysinfo`]
//! crate, augmented with direct cgroup reads so containerized runs see
//! their real ceilings instead of the host's.
//!
//! ## Collected Metrics
//!
//! | Metric | Source | Unit |
//! |--------|--------|------|
//! | Process CPU | `Process::cpu_usage()` | percent |
//! | Process RSS | `Process::memory()` | MB |
//! | Host CPU | `System::global_cpu_usage()` | percent (0–100) |
//! | Host memory | `used_memory() / total_memory()` | percent |
//! | Cgroup CPU | `cpu.stat` / `cpuacct.usage` delta | percent of quota |
//! | Cgroup memory | `memory.current` vs `memory.max` | percent of limit |
//!
//! Cgroup CPU percent is derived from the delta of the cumulative CPU-time
//! counter (µs on v2, ns on v1) divided by elapsed wall time × quota cores.
//! The first sample after startup only primes the delta and reports none.
//!
//! The `sysinfo::System` instance is reused across calls to amortize
//! initialization cost.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use sysinfo::System;

/// One point-in-time resource reading, attached to every live snapshot.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceSample {
    pub process_cpu_pct: f32,
    pub process_rss_mb: f64,
    pub host_cpu_pct: f32,
    pub host_mem_pct: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroup_cpu_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroup_mem_pct: Option<f64>,
}

impl ResourceSample {
    /// Cgroup CPU when the process is containerized, host CPU otherwise.
    pub fn effective_cpu_pct(&self) -> f64 {
        self.cgroup_cpu_pct.unwrap_or(self.host_cpu_pct as f64)
    }

    pub fn effective_mem_pct(&self) -> f64 {
        self.cgroup_mem_pct.unwrap_or(self.host_mem_pct as f64)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CpuUsageUnit {
    Micros,
    Nanos,
}

struct CgroupReading {
    quota_cores: Option<f64>,
    cpu_usage: Option<f64>,
    usage_unit: CpuUsageUnit,
    memory_mb: Option<f64>,
    memory_limit_mb: Option<f64>,
}

/// Stateful sampler — owns the `sysinfo` handle and the previous cgroup
/// CPU-time reading used for delta computation.
pub struct ResourceSampler {
    sys: System,
    pid: sysinfo::Pid,
    cgroup_prev: Option<(f64, Instant)>,
    cgroup_root: std::path::PathBuf,
}

impl ResourceSampler {
    pub fn new() -> ResourceSampler {
        ResourceSampler {
            sys: System::new(),
            pid: sysinfo::Pid::from_u32(std::process::id()),
            cgroup_prev: None,
            cgroup_root: std::path::PathBuf::from("/sys/fs/cgroup"),
        }
    }

    #[cfg(test)]
    fn with_cgroup_root(root: &Path) -> ResourceSampler {
        let mut s = ResourceSampler::new();
        s.cgroup_root = root.to_path_buf();
        s
    }

    pub fn sample(&mut self) -> ResourceSample {
        self.sys.refresh_cpu_all();
        self.sys.refresh_memory();
        self.sys.refresh_processes(
            sysinfo::ProcessesToUpdate::Some(&[self.pid]),
            true,
        );

        let mem_total = self.sys.total_memory() as f64;
        let mem_used = self.sys.used_memory() as f64;
        let host_mem_pct = if mem_total > 0.0 {
            (mem_used / mem_total * 100.0) as f32
        } else {
            0.0
        };

        let (process_cpu_pct, process_rss_mb) = self
            .sys
            .process(self.pid)
            .map(|p| (p.cpu_usage(), p.memory() as f64 / (1024.0 * 1024.0)))
            .unwrap_or((0.0, 0.0));

        let mut sample = ResourceSample {
            process_cpu_pct,
            process_rss_mb,
            host_cpu_pct: self.sys.global_cpu_usage(),
            host_mem_pct,
            cgroup_cpu_pct: None,
            cgroup_mem_pct: None,
        };

        if let Some(cg) = self.read_cgroup() {
            if let (Some(mem), Some(limit)) = (cg.memory_mb, cg.memory_limit_mb) {
                if limit > 0.0 {
                    sample.cgroup_mem_pct = Some(mem / limit * 100.0);
                }
            }
            sample.cgroup_cpu_pct =
                self.cgroup_cpu_percent(cg.cpu_usage, cg.usage_unit, cg.quota_cores);
        }

        sample
    }

    /// Delta-based cgroup CPU percent. Returns `None` on the priming call
    /// and whenever the counter goes backwards (cgroup was recreated).
    fn cgroup_cpu_percent(
        &mut self,
        usage: Option<f64>,
        unit: CpuUsageUnit,
        quota_cores: Option<f64>,
    ) -> Option<f64> {
        let usage = usage?;
        let cores = quota_cores.filter(|c| *c > 0.0)?;
        let now = Instant::now();
        let prev = self.cgroup_prev.replace((usage, now));
        let (prev_usage, prev_at) = prev?;
        let delta_t = now.duration_since(prev_at).as_secs_f64();
        let delta_usage = usage - prev_usage;
        if delta_t <= 0.0 || delta_usage < 0.0 {
            return None;
        }
        let used_seconds = match unit {
            CpuUsageUnit::Micros => delta_usage / 1e6,
            CpuUsageUnit::Nanos => delta_usage / 1e9,
        };
        let pct = used_seconds / (delta_t * cores) * 100.0;
        pct.is_finite().then_some(pct)
    }

    fn read_cgroup(&self) -> Option<CgroupReading> {
        let root = self.cgroup_root.as_path();
        if !root.is_dir() {
            return None;
        }
        // cgroup v2 has cgroup.controllers at the root.
        if root.join("cgroup.controllers").exists() {
            self.read_cgroup_v2(root)
        } else {
            self.read_cgroup_v1(root)
        }
    }

    fn read_cgroup_v2(&self, root: &Path) -> Option<CgroupReading> {
        let quota_cores = read_text(&root.join("cpu.max")).and_then(|s| {
            let mut parts = s.split_whitespace();
            let quota = parts.next()?;
            let period: f64 = parts.next()?.parse().ok()?;
            if quota == "max" || period <= 0.0 {
                return None;
            }
            quota.parse::<f64>().ok().map(|q| q / period)
        });

        let cpu_usage = read_text(&root.join("cpu.stat")).and_then(|s| {
            s.lines()
                .find(|l| l.starts_with("usage_usec"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|v| v.parse().ok())
        });

        let memory_mb = read_f64(&root.join("memory.current")).map(|b| b / (1024.0 * 1024.0));
        let memory_limit_mb = read_text(&root.join("memory.max"))
            .filter(|s| s != "max")
            .and_then(|s| s.parse::<f64>().ok())
            .map(|b| b / (1024.0 * 1024.0));

        if quota_cores.is_none()
            && cpu_usage.is_none()
            && memory_mb.is_none()
            && memory_limit_mb.is_none()
        {
            return None;
        }
        Some(CgroupReading {
            quota_cores,
            cpu_usage,
            usage_unit: CpuUsageUnit::Micros,
            memory_mb,
            memory_limit_mb,
        })
    }

    fn read_cgroup_v1(&self, root: &Path) -> Option<CgroupReading> {
        let quota_us = read_f64(&root.join("cpu/cpu.cfs_quota_us"));
        let period_us = read_f64(&root.join("cpu/cpu.cfs_period_us"));
        let quota_cores = match (quota_us, period_us) {
            (Some(q), Some(p)) if q > 0.0 && p > 0.0 => Some(q / p),
            _ => None,
        };

        let cpu_usage = read_f64(&root.join("cpuacct/cpuacct.usage"));
        let memory_mb =
            read_f64(&root.join("memory/memory.usage_in_bytes")).map(|b| b / (1024.0 * 1024.0));
        // Ignore the "unlimited" sentinel (a huge page-aligned value).
        let memory_limit_mb = read_f64(&root.join("memory/memory.limit_in_bytes"))
            .filter(|b| *b < (1u64 << 60) as f64)
            .map(|b| b / (1024.0 * 1024.0));

        if quota_cores.is_none()
            && cpu_usage.is_none()
            && memory_mb.is_none()
            && memory_limit_mb.is_none()
        {
            return None;
        }
        Some(CgroupReading {
            quota_cores,
            cpu_usage,
            usage_unit: CpuUsageUnit::Nanos,
            memory_mb,
            memory_limit_mb,
        })
    }
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Source of resource samples for the metrics tick. The real sampler reads
/// sysinfo + cgroups; tests inject scripted readings to drive guardrails
/// deterministically.
pub trait ResourceProbe: Send {
    fn sample(&mut self) -> ResourceSample;
}

impl ResourceProbe for ResourceSampler {
    fn sample(&mut self) -> ResourceSample {
        ResourceSampler::sample(self)
    }
}

fn read_text(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn read_f64(path: &Path) -> Option<f64> {
    read_text(path)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_returns_plausible_values() {
        let mut sampler = ResourceSampler::new();
        let s = sampler.sample();
        assert!(s.host_mem_pct >= 0.0 && s.host_mem_pct <= 100.0);
        assert!(s.process_rss_mb >= 0.0);
        assert!(s.host_cpu_pct >= 0.0);
    }

    #[test]
    fn effective_metrics_prefer_cgroup() {
        let s = ResourceSample {
            host_cpu_pct: 10.0,
            host_mem_pct: 20.0,
            cgroup_cpu_pct: Some(80.0),
            cgroup_mem_pct: None,
            ..ResourceSample::default()
        };
        assert_eq!(s.effective_cpu_pct(), 80.0);
        assert_eq!(s.effective_mem_pct(), 20.0);
    }

    #[test]
    fn cgroup_cpu_percent_primes_then_reports() {
        let mut sampler = ResourceSampler::new();
        // First call primes the delta.
        assert!(sampler
            .cgroup_cpu_percent(Some(1_000_000.0), CpuUsageUnit::Micros, Some(2.0))
            .is_none());
        std::thread::sleep(std::time::Duration::from_millis(20));
        // 1 extra CPU-second over ~20ms of wall at 2 cores is a huge but
        // finite percentage.
        let pct = sampler
            .cgroup_cpu_percent(Some(2_000_000.0), CpuUsageUnit::Micros, Some(2.0))
            .unwrap();
        assert!(pct > 0.0);
    }

    #[test]
    fn cgroup_counter_regression_reports_none() {
        let mut sampler = ResourceSampler::new();
        sampler.cgroup_cpu_percent(Some(5_000.0), CpuUsageUnit::Nanos, Some(1.0));
        assert!(sampler
            .cgroup_cpu_percent(Some(1_000.0), CpuUsageUnit::Nanos, Some(1.0))
            .is_none());
    }

    #[test]
    fn cgroup_v2_files_parse() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cgroup.controllers"), "cpu memory").unwrap();
        std::fs::write(dir.path().join("cpu.max"), "200000 100000").unwrap();
        std::fs::write(dir.path().join("cpu.stat"), "usage_usec 123456\nuser_usec 100").unwrap();
        std::fs::write(dir.path().join("memory.current"), "104857600").unwrap();
        std::fs::write(dir.path().join("memory.max"), "209715200").unwrap();

        let sampler = ResourceSampler::with_cgroup_root(dir.path());
        let cg = sampler.read_cgroup().unwrap();
        assert_eq!(cg.quota_cores, Some(2.0));
        assert_eq!(cg.cpu_usage, Some(123456.0));
        assert_eq!(cg.usage_unit, CpuUsageUnit::Micros);
        assert_eq!(cg.memory_mb, Some(100.0));
        assert_eq!(cg.memory_limit_mb, Some(200.0));
    }

    #[test]
    fn cgroup_v2_unlimited_cpu_reports_no_quota() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cgroup.controllers"), "cpu").unwrap();
        std::fs::write(dir.path().join("cpu.max"), "max 100000").unwrap();
        std::fs::write(dir.path().join("cpu.stat"), "usage_usec 42").unwrap();

        let sampler = ResourceSampler::with_cgroup_root(dir.path());
        let cg = sampler.read_cgroup().unwrap();
        assert!(cg.quota_cores.is_none());
        assert_eq!(cg.cpu_usage, Some(42.0));
    }
}
