//! Host load sampling and the throttle/accelerate decision.

use crate::config::BatchConfig;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// CPU and memory utilisation, both in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// Source of [`ResourceSample`]s. `None` means "unknown" and never
/// triggers an adjustment.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> Option<ResourceSample>;
}

/// Sampler that knows nothing; the pool stays at its initial size.
#[derive(Debug, Default)]
pub struct NoopSampler;

impl ResourceSampler for NoopSampler {
    fn sample(&self) -> Option<ResourceSample> {
        None
    }
}

/// Linux sampler backed by `/proc/stat` and `/proc/meminfo`.
///
/// CPU usage is the busy share of jiffies since the previous call, so the
/// first call only primes the counters and returns `None`, as does a call
/// that sees no elapsed jiffies.
#[derive(Debug, Default)]
pub struct ProcSampler {
    last_cpu: Mutex<Option<(u64, u64)>>,
}

impl ProcSampler {
    pub fn new() -> Self {
        Self::default()
    }
}

/// `(idle, total)` jiffies from the aggregate `cpu` line of `/proc/stat`.
pub(crate) fn parse_cpu_line(stat: &str) -> Option<(u64, u64)> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some((idle, fields.iter().sum()))
}

/// Busy CPU share between two `(idle, total)` readings; `None` when no
/// jiffies elapsed.
pub(crate) fn cpu_busy_percent(prev: (u64, u64), now: (u64, u64)) -> Option<f32> {
    let dt = now.1.checked_sub(prev.1).filter(|d| *d > 0)? as f32;
    let di = now.0.saturating_sub(prev.0) as f32;
    Some(((dt - di) / dt * 100.0).clamp(0.0, 100.0))
}

/// Used-memory percentage from `/proc/meminfo`.
pub(crate) fn parse_meminfo(meminfo: &str) -> Option<f32> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some((total.saturating_sub(available)) as f32 * 100.0 / total as f32)
}

impl ResourceSampler for ProcSampler {
    fn sample(&self) -> Option<ResourceSample> {
        let stat = std::fs::read_to_string("/proc/stat").ok()?;
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        let cpu = parse_cpu_line(&stat)?;
        let memory_percent = parse_meminfo(&meminfo)?;

        let mut last = self.last_cpu.lock().unwrap_or_else(|p| p.into_inner());
        let previous = last.replace(cpu);
        Some(ResourceSample {
            cpu_percent: cpu_busy_percent(previous?, cpu)?,
            memory_percent,
        })
    }
}

/// The platform default sampler.
pub fn default_sampler() -> Box<dyn ResourceSampler> {
    if cfg!(target_os = "linux") {
        Box::new(ProcSampler::new())
    } else {
        Box::new(NoopSampler)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Throttle,
    Accelerate,
    Hold,
}

/// Counts consecutive high/low samples and decides when to adjust.
#[derive(Debug, Clone)]
pub struct LoadTracker {
    cpu_high: f32,
    cpu_low: f32,
    mem_high: f32,
    mem_low: f32,
    adjust_after: u32,
    high_streak: u32,
    low_streak: u32,
}

impl LoadTracker {
    pub fn new(config: &BatchConfig) -> Self {
        Self {
            cpu_high: config.cpu_high,
            cpu_low: config.cpu_low,
            mem_high: config.mem_high,
            mem_low: config.mem_low,
            adjust_after: config.adjust_after.max(1),
            high_streak: 0,
            low_streak: 0,
        }
    }

    pub fn observe(&mut self, sample: ResourceSample) -> Adjustment {
        let high = sample.cpu_percent > self.cpu_high || sample.memory_percent > self.mem_high;
        let low = sample.cpu_percent < self.cpu_low && sample.memory_percent < self.mem_low;

        if high {
            self.high_streak += 1;
            self.low_streak = 0;
        } else if low {
            self.low_streak += 1;
            self.high_streak = 0;
        } else {
            self.high_streak = 0;
            self.low_streak = 0;
        }

        if self.high_streak >= self.adjust_after {
            self.high_streak = 0;
            Adjustment::Throttle
        } else if self.low_streak >= self.adjust_after {
            self.low_streak = 0;
            Adjustment::Accelerate
        } else {
            Adjustment::Hold
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn s(cpu: f32, mem: f32) -> ResourceSample {
        ResourceSample {
            cpu_percent: cpu,
            memory_percent: mem,
        }
    }

    #[test]
    fn three_high_samples_throttle() {
        let mut t = LoadTracker::new(&BatchConfig::default());
        assert_eq!(t.observe(s(90.0, 10.0)), Adjustment::Hold);
        assert_eq!(t.observe(s(90.0, 10.0)), Adjustment::Hold);
        assert_eq!(t.observe(s(10.0, 80.0)), Adjustment::Throttle);
        assert_eq!(t.observe(s(90.0, 10.0)), Adjustment::Hold);
    }

    #[test]
    fn mid_sample_breaks_streak() {
        let mut t = LoadTracker::new(&BatchConfig::default());
        t.observe(s(10.0, 10.0));
        t.observe(s(10.0, 10.0));
        assert_eq!(t.observe(s(60.0, 10.0)), Adjustment::Hold);
        t.observe(s(10.0, 10.0));
        t.observe(s(10.0, 10.0));
        assert_eq!(t.observe(s(10.0, 10.0)), Adjustment::Accelerate);
    }

    #[test]
    fn low_needs_both_cpu_and_memory() {
        let mut t = LoadTracker::new(&BatchConfig::default());
        for _ in 0..5 {
            assert_eq!(t.observe(s(10.0, 60.0)), Adjustment::Hold);
        }
    }

    #[test]
    fn parses_proc_files() {
        let stat = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 1 2 3 4\n";
        assert_eq!(parse_cpu_line(stat), Some((800, 1000)));
        let meminfo = "MemTotal:       1000 kB\nMemFree:  100 kB\nMemAvailable:   250 kB\n";
        assert_eq!(parse_meminfo(meminfo), Some(75.0));
        assert_eq!(parse_meminfo("garbage"), None);
    }

    #[test]
    fn cpu_share_needs_two_readings() {
        assert_eq!(cpu_busy_percent((800, 1000), (850, 1100)), Some(50.0));
        assert_eq!(cpu_busy_percent((800, 1000), (800, 1000)), None);
        assert_eq!(cpu_busy_percent((800, 1000), (900, 1100)), Some(0.0));
    }

    #[test]
    fn proc_sampler_skips_its_priming_read() {
        if !Path::new("/proc/stat").exists() {
            return;
        }
        let sampler = ProcSampler::new();
        assert!(sampler.sample().is_none());
        assert!(sampler.last_cpu.lock().unwrap().is_some());
    }

    #[test]
    fn noop_sampler_is_silent() {
        assert!(NoopSampler.sample().is_none());
    }
}
