//! Periodic free-capacity reporting
//!
//! A background task samples the host every interval and keeps the last
//! value. The `free` request only ever reads that snapshot, so answering it
//! never waits on a sample.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

/// Failure to take a capacity sample
#[derive(Error, Debug)]
pub enum SampleError {
    /// Reading the sampling source failed
    #[error("Failed to read sampling source: {0}")]
    Io(#[from] std::io::Error),

    /// The sampling source had an unexpected format
    #[error("Malformed sample: {0}")]
    Malformed(String),
}

/// Source of free-capacity samples, in percent
///
/// Samples are taken on the blocking thread pool.
pub trait CapacitySampler: Send + 'static {
    /// Take one sample
    fn sample(&mut self) -> Result<f64, SampleError>;
}

impl<F> CapacitySampler for F
where
    F: FnMut() -> Result<f64, SampleError> + Send + 'static,
{
    fn sample(&mut self) -> Result<f64, SampleError> {
        self()
    }
}

/// Free CPU derived from `/proc/stat` deltas between consecutive samples
#[derive(Debug, Default)]
pub struct ProcStatSampler {
    previous: Option<CpuTimes>,
}

#[derive(Debug, Clone, Copy)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

impl ProcStatSampler {
    /// Create a sampler; the first sample covers the time since boot
    pub fn new() -> Self {
        Self::default()
    }

    fn parse(stat: &str) -> Result<CpuTimes, SampleError> {
        let line = stat
            .lines()
            .find(|line| line.starts_with("cpu "))
            .ok_or_else(|| SampleError::Malformed("no aggregate cpu line".to_string()))?;

        let fields = line
            .split_whitespace()
            .skip(1)
            .map(|field| {
                field
                    .parse::<u64>()
                    .map_err(|e| SampleError::Malformed(format!("{}: {}", field, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if fields.len() < 4 {
            return Err(SampleError::Malformed(format!(
                "expected at least 4 cpu fields, got {}",
                fields.len()
            )));
        }

        // idle + iowait
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        Ok(CpuTimes {
            idle,
            total: fields.iter().sum(),
        })
    }

    fn free_between(previous: Option<CpuTimes>, current: CpuTimes) -> Result<f64, SampleError> {
        let (idle, total) = match previous {
            Some(prev) => (
                current.idle.saturating_sub(prev.idle),
                current.total.saturating_sub(prev.total),
            ),
            None => (current.idle, current.total),
        };

        if total == 0 {
            return Err(SampleError::Malformed("no cpu time elapsed".to_string()));
        }
        Ok(idle as f64 / total as f64 * 100.0)
    }
}

impl CapacitySampler for ProcStatSampler {
    fn sample(&mut self) -> Result<f64, SampleError> {
        let stat = std::fs::read_to_string("/proc/stat")?;
        let current = Self::parse(&stat)?;
        let free = Self::free_between(self.previous, current);
        self.previous = Some(current);
        free
    }
}

/// Last known capacity of this media node
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapacitySnapshot {
    /// Free capacity in percent, `None` until the first successful sample
    pub free: Option<f64>,
    /// Whether the latest sample failed
    pub degraded: bool,
    /// When `free` was sampled
    pub sampled_at: Option<DateTime<Utc>>,
}

impl Default for CapacitySnapshot {
    fn default() -> Self {
        Self {
            free: None,
            degraded: false,
            sampled_at: None,
        }
    }
}

/// Periodic capacity sampler with a shared snapshot
#[derive(Debug)]
pub struct CapacityReporter {
    interval: Duration,
    snapshot: Arc<RwLock<CapacitySnapshot>>,
    handle: Option<JoinHandle<()>>,
}

impl CapacityReporter {
    /// Create a reporter refreshing every `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            snapshot: Arc::new(RwLock::new(CapacitySnapshot::default())),
            handle: None,
        }
    }

    /// Start sampling in the background. The first sample is taken immediately.
    pub fn start<S: CapacitySampler>(&mut self, mut sampler: S) {
        if self.handle.is_some() {
            return;
        }

        let snapshot = Arc::clone(&self.snapshot);
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);

            loop {
                ticker.tick().await;

                // Samplers may do blocking I/O such as reading /proc/stat
                let sampled = tokio::task::spawn_blocking(move || {
                    let result = sampler.sample();
                    (sampler, result)
                })
                .await;
                let result = match sampled {
                    Ok((returned, result)) => {
                        sampler = returned;
                        result
                    }
                    Err(e) => {
                        error!("Capacity sampler panicked, reporting stopped: {}", e);
                        snapshot.write().degraded = true;
                        break;
                    }
                };

                match result {
                    Ok(free) => {
                        let mut current = snapshot.write();
                        if current.degraded {
                            info!("Capacity sampling recovered");
                        }
                        *current = CapacitySnapshot {
                            free: Some(free.clamp(0.0, 100.0)),
                            degraded: false,
                            sampled_at: Some(Utc::now()),
                        };
                        debug!("Free capacity {:.1}%", free);
                    }
                    Err(e) => {
                        // Keep the last known value
                        let mut current = snapshot.write();
                        if !current.degraded {
                            warn!("Capacity sampling failed: {}", e);
                        }
                        current.degraded = true;
                    }
                }
            }
        });

        self.handle = Some(handle);
        info!("Started capacity reporting every {:?}", self.interval);
    }

    /// Stop sampling; the last snapshot stays readable
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            info!("Stopped capacity reporting");
        }
    }

    /// Whether the sampling task is running
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Last known free capacity
    pub fn free(&self) -> Option<f64> {
        self.snapshot.read().free
    }

    /// Whether the latest sample failed
    pub fn is_degraded(&self) -> bool {
        self.snapshot.read().degraded
    }

    /// Full snapshot
    pub fn snapshot(&self) -> CapacitySnapshot {
        *self.snapshot.read()
    }

    pub(crate) fn shared(&self) -> Arc<RwLock<CapacitySnapshot>> {
        Arc::clone(&self.snapshot)
    }
}

impl Drop for CapacityReporter {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Instant;

    const STAT: &str = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 100 0 50 800 50 0 0 0 0 0\n";

    #[test]
    fn test_parse_proc_stat() {
        let times = ProcStatSampler::parse(STAT).unwrap();
        assert_eq!(times.idle, 850);
        assert_eq!(times.total, 1000);

        let free = ProcStatSampler::free_between(None, times).unwrap();
        assert!((free - 85.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_free_uses_deltas() {
        let before = CpuTimes { idle: 850, total: 1000 };
        let after = CpuTimes { idle: 900, total: 1200 };
        let free = ProcStatSampler::free_between(Some(before), after).unwrap();
        assert!((free - 25.0).abs() < 1e-9);

        assert!(ProcStatSampler::free_between(Some(after), after).is_err());
        assert!(ProcStatSampler::parse("intr 1 2 3").is_err());
    }

    #[tokio::test]
    async fn test_reporter_keeps_last_value_when_degraded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let sampler = move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(42.0)
            } else {
                Err(SampleError::Malformed("sensor gone".to_string()))
            }
        };

        let mut reporter = CapacityReporter::new(Duration::from_millis(20));
        reporter.start(sampler);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(reporter.free(), Some(42.0));
        assert!(reporter.is_degraded());

        reporter.stop();
    }

    #[tokio::test]
    async fn test_slow_sampler_does_not_stall_runtime() {
        let entered = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&entered);
        let sampler = move || -> Result<f64, SampleError> {
            flag.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            Ok(30.0)
        };

        let mut reporter = CapacityReporter::new(Duration::from_secs(5));
        let started = Instant::now();
        reporter.start(sampler);

        while !entered.load(Ordering::SeqCst) && started.elapsed() < Duration::from_secs(1) {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(reporter.free(), None);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(reporter.free(), Some(30.0));
    }

    #[tokio::test]
    async fn test_reporter_recovers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let sampler = move || match counter.fetch_add(1, Ordering::SeqCst) {
            0 => Err(SampleError::Malformed("warming up".to_string())),
            _ => Ok(60.0),
        };

        let mut reporter = CapacityReporter::new(Duration::from_millis(20));
        reporter.start(sampler);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let snapshot = reporter.snapshot();
        assert_eq!(snapshot.free, Some(60.0));
        assert!(!snapshot.degraded);
        assert!(snapshot.sampled_at.is_some());
    }
}
