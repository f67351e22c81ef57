//! Resource sampling (component #5, spec.md §4.4): four independent rolling
//! series — CPU, memory, scheduler latency, client rate-limit errors — each
//! capped by age rather than count.
//!
//! CPU/memory accounting reads cgroup v2 accounting files directly, the same
//! technique `dennisss-dacha`'s `container::runtime::cgroup::Cgroup` uses to
//! measure a running container: `cpu.stat`'s `usage_usec` is diffed between
//! two reads to get a ratio, and `memory.current`/`memory.max` are read
//! as-is. Falling back to `/proc` keeps the crate usable outside a cgroup
//! (e.g. under a container runtime that doesn't expose one, or on a dev
//! workstation).

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::config::Configuration;

/// Thresholds and sampling intervals for [`Snapshotter`] (spec.md §4.4
/// defaults).
#[derive(Debug, Clone)]
pub struct SnapshotterConfig {
    pub cpu_interval: Duration,
    pub memory_interval: Duration,
    pub event_loop_interval: Duration,
    pub client_interval: Duration,
    pub max_age: Duration,
    pub max_used_cpu_ratio: f64,
    pub max_used_memory_ratio: f64,
    pub max_blocked_millis: u64,
    pub max_client_errors: u64,
    pub cgroup_dir: PathBuf,
}

impl Default for SnapshotterConfig {
    fn default() -> Self {
        Self {
            cpu_interval: Duration::from_secs(1),
            memory_interval: Duration::from_secs(1),
            event_loop_interval: Duration::from_millis(500),
            client_interval: Duration::from_secs(1),
            max_age: Duration::from_secs(30),
            max_used_cpu_ratio: 0.95,
            max_used_memory_ratio: 0.9,
            max_blocked_millis: 50,
            max_client_errors: 1,
            cgroup_dir: PathBuf::from("/sys/fs/cgroup"),
        }
    }
}

/// One rolling, time-bounded series of `isOverloaded` observations.
struct Series {
    samples: VecDeque<(Instant, bool)>,
    max_age: Duration,
}

impl Series {
    fn new(max_age: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            max_age,
        }
    }

    fn push(&mut self, overloaded: bool) {
        let now = Instant::now();
        self.samples.push_back((now, overloaded));
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > self.max_age {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Fraction of samples within `window` that were overloaded. `0.0` if
    /// the window contains no samples (an un-sampled metric never gates
    /// scale-up/down on its own).
    fn overloaded_ratio(&self, window: Duration) -> f64 {
        let now = Instant::now();
        let in_window: Vec<bool> = self
            .samples
            .iter()
            .filter(|&&(at, _)| now.duration_since(at) <= window)
            .map(|&(_, overloaded)| overloaded)
            .collect();
        if in_window.is_empty() {
            return 0.0;
        }
        in_window.iter().filter(|&&o| o).count() as f64 / in_window.len() as f64
    }
}

/// CPU/memory snapshot reader, mirroring `Cgroup::collect_measurement` /
/// `Cgroup::cpu_usage`: two successive reads of `cpu.stat` are diffed to
/// yield a ratio, since the counter itself is cumulative.
struct CgroupReader {
    dir: PathBuf,
    previous: Option<(Instant, Duration)>,
    total_memory_bytes: Option<u64>,
}

impl CgroupReader {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            previous: None,
            total_memory_bytes: None,
        }
    }

    fn read_key_value(contents: &str, key: &str) -> Option<u64> {
        contents.lines().find_map(|line| {
            let (k, v) = line.split_once(' ')?;
            (k == key).then(|| v.trim().parse().ok()).flatten()
        })
    }

    /// Returns `Some(used_ratio)` if cgroup accounting files were readable
    /// and at least two samples have been taken.
    async fn cpu_used_ratio(&mut self) -> Option<f64> {
        let stat = tokio::fs::read_to_string(self.dir.join("cpu.stat")).await.ok()?;
        let usage_usec = Self::read_key_value(&stat, "usage_usec")?;
        let now = Instant::now();
        let usage = Duration::from_micros(usage_usec);

        let ratio = match self.previous {
            Some((prev_time, prev_usage)) => {
                let elapsed = now.duration_since(prev_time);
                let used = usage.saturating_sub(prev_usage);
                if elapsed.is_zero() {
                    None
                } else {
                    Some(used.as_secs_f64() / elapsed.as_secs_f64())
                }
            }
            None => None,
        };
        self.previous = Some((now, usage));
        ratio
    }

    async fn memory_used_ratio(&mut self, override_mbytes: Option<u64>) -> Option<f64> {
        let current: u64 = tokio::fs::read_to_string(self.dir.join("memory.current"))
            .await
            .ok()?
            .trim()
            .parse()
            .ok()?;

        let total = if let Some(mbytes) = override_mbytes {
            mbytes * 1024 * 1024
        } else if let Some(cached) = self.total_memory_bytes {
            cached
        } else {
            let max = tokio::fs::read_to_string(self.dir.join("memory.max")).await.ok()?;
            let max = max.trim();
            let total = if max == "max" {
                Self::proc_meminfo_total_bytes().await?
            } else {
                max.parse().ok()?
            };
            self.total_memory_bytes = Some(total);
            total
        };

        if total == 0 {
            return None;
        }
        Some(current as f64 / total as f64)
    }

    async fn proc_meminfo_total_bytes() -> Option<u64> {
        let meminfo = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
        let kb = Self::read_key_value(&meminfo.replace("kB", ""), "MemTotal")?;
        Some(kb * 1024)
    }
}

/// Periodic sampler maintaining the four rolling series [`SystemStatus`]
/// reads from.
///
/// [`SystemStatus`]: crate::system_status::SystemStatus
pub struct Snapshotter {
    config: SnapshotterConfig,
    cpu: Mutex<Series>,
    memory: Mutex<Series>,
    event_loop: Mutex<Series>,
    client: Mutex<Series>,
    client_error_count: AtomicU64,
    memory_mbytes_override: Option<u64>,
}

impl Snapshotter {
    pub fn new(config: SnapshotterConfig) -> Self {
        let max_age = config.max_age;
        Self {
            memory_mbytes_override: Configuration::global().memory_mbytes,
            config,
            cpu: Mutex::new(Series::new(max_age)),
            memory: Mutex::new(Series::new(max_age)),
            event_loop: Mutex::new(Series::new(max_age)),
            client: Mutex::new(Series::new(max_age)),
            client_error_count: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SnapshotterConfig::default())
    }

    /// Called by the crawler whenever a blocked/rate-limited response is
    /// observed; accumulates into the next client-error sample.
    pub fn record_client_error(&self) {
        self.client_error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cpu_overloaded_ratio(&self, window: Duration) -> f64 {
        self.cpu.lock().overloaded_ratio(window)
    }

    pub fn memory_overloaded_ratio(&self, window: Duration) -> f64 {
        self.memory.lock().overloaded_ratio(window)
    }

    pub fn event_loop_overloaded_ratio(&self, window: Duration) -> f64 {
        self.event_loop.lock().overloaded_ratio(window)
    }

    pub fn client_overloaded_ratio(&self, window: Duration) -> f64 {
        self.client.lock().overloaded_ratio(window)
    }

    /// Drive all four sampling loops until `shutdown` resolves. Intended to
    /// be spawned as a single background task (`tokio::spawn`); each series
    /// ticks on its own interval inside one `tokio::select!`.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut cpu_reader = CgroupReader::new(self.config.cgroup_dir.clone());
        let mut cpu_tick = interval(self.config.cpu_interval);
        let mut mem_tick = interval(self.config.memory_interval);
        let mut loop_tick = interval(self.config.event_loop_interval);
        let mut client_tick = interval(self.config.client_interval);

        loop {
            tokio::select! {
                _ = cpu_tick.tick() => self.sample_cpu(&mut cpu_reader).await,
                _ = mem_tick.tick() => self.sample_memory(&mut cpu_reader).await,
                _ = loop_tick.tick() => self.sample_event_loop().await,
                _ = client_tick.tick() => self.sample_client(),
                _ = &mut shutdown => {
                    debug!("snapshotter shutting down");
                    break;
                }
            }
        }
    }

    async fn sample_cpu(&self, reader: &mut CgroupReader) {
        match reader.cpu_used_ratio().await {
            Some(ratio) => {
                let overloaded = ratio > self.config.max_used_cpu_ratio;
                self.cpu.lock().push(overloaded);
            }
            None => debug!("no cpu sample available this tick"),
        }
    }

    async fn sample_memory(&self, reader: &mut CgroupReader) {
        match reader.memory_used_ratio(self.memory_mbytes_override).await {
            Some(ratio) => {
                let overloaded = ratio > self.config.max_used_memory_ratio;
                self.memory.lock().push(overloaded);
            }
            None => debug!("no memory sample available this tick"),
        }
    }

    /// The scheduler-latency analogue of "blocked event loop": schedule a
    /// short sleep and measure how much longer it actually took than
    /// requested. A heavily-loaded tokio runtime delays timer delivery the
    /// same way a blocked Node.js event loop delays `setTimeout`.
    async fn sample_event_loop(&self) {
        const PROBE: Duration = Duration::from_millis(5);
        let started = Instant::now();
        tokio::time::sleep(PROBE).await;
        let actual = started.elapsed();
        let exceeded = actual.saturating_sub(PROBE).as_millis() as u64;
        let overloaded = exceeded > self.config.max_blocked_millis;
        if overloaded {
            warn!(exceeded_ms = exceeded, "scheduler latency exceeded threshold");
        }
        self.event_loop.lock().push(overloaded);
    }

    fn sample_client(&self) {
        let count = self.client_error_count.swap(0, Ordering::Relaxed);
        let overloaded = count > self.config.max_client_errors;
        self.client.lock().push(overloaded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn series_prunes_samples_past_max_age() {
        let mut series = Series::new(Duration::from_millis(20));
        series.push(true);
        std::thread::sleep(Duration::from_millis(30));
        series.push(false);
        assert_eq!(series.samples.len(), 1);
    }

    #[test]
    fn overloaded_ratio_is_zero_with_no_samples() {
        let series = Series::new(Duration::from_secs(30));
        assert_eq!(series.overloaded_ratio(Duration::from_secs(5)), 0.0);
    }

    #[test]
    fn overloaded_ratio_reflects_recent_window() {
        let mut series = Series::new(Duration::from_secs(30));
        series.push(true);
        series.push(true);
        series.push(false);
        assert!((series.overloaded_ratio(Duration::from_secs(30)) - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn read_key_value_parses_cpu_stat_format() {
        let contents = "usage_usec 12345\nuser_usec 10000\nsystem_usec 2345\n";
        assert_eq!(CgroupReader::read_key_value(contents, "usage_usec"), Some(12345));
        assert_eq!(CgroupReader::read_key_value(contents, "missing"), None);
    }

    #[tokio::test]
    async fn record_client_error_feeds_next_sample() {
        let snapshotter = Snapshotter::new(SnapshotterConfig {
            max_client_errors: 0,
            ..SnapshotterConfig::default()
        });
        snapshotter.record_client_error();
        snapshotter.sample_client();
        assert_eq!(snapshotter.client_overloaded_ratio(Duration::from_secs(1)), 1.0);
    }
}
