//! Per-crawl timing and retry statistics with periodic persistence
//! (component #9, spec.md §4.8).
//!
//! `Statistics` generalizes `fusillade::batch::BatchStatus`'s aggregate
//! counts (`is_finished`/`is_running` over a fixed batch) to an open-ended
//! crawl: counters are plain atomics updated from any worker task, and a
//! snapshot is serialized to a key-value record on a timer the same way
//! `fusillade`'s daemon persists its own periodic status line, except here
//! the persisted form is data rather than a log line.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;
use crate::storage::{KeyValueRecord, KeyValueStoreId, Storage};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PersistedStatistics {
    requests_finished: u64,
    requests_failed: u64,
    total_duration_millis: u64,
    retries: HashMap<u32, u64>,
}

/// A durable summary snapshot, separate from the live atomics so it can be
/// serialized, `Display`-ed, and handed to a user's own reporting without
/// borrowing the live `Statistics`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatisticsSummary {
    pub requests_finished: u64,
    pub requests_failed: u64,
    pub mean_request_duration_millis: f64,
    /// `retries[n]` = count of handled requests that took exactly `n`
    /// retries before finishing.
    pub retries: HashMap<u32, u64>,
}

impl fmt::Display for StatisticsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "finished={} failed={} mean_duration={:.1}ms retries={:?}",
            self.requests_finished, self.requests_failed, self.mean_request_duration_millis, self.retries
        )
    }
}

/// Counts `requestsFinished`, `requestsFailed`, per-request durations, and
/// a retry histogram (spec.md §4.8).
pub struct Statistics {
    storage: Option<(Box<dyn Storage>, KeyValueStoreId, String)>,
    requests_finished: AtomicU64,
    requests_failed: AtomicU64,
    total_duration_millis: AtomicU64,
    retries: Mutex<HashMap<u32, u64>>,
    started_at: Instant,
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            storage: None,
            requests_finished: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            total_duration_millis: AtomicU64::new(0),
            retries: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
        }
    }

    /// Opens (or creates) the key-value store used to persist snapshots,
    /// and recovers prior state from `persist_key` if it exists — "recovers
    /// on startup" (spec.md §4.8).
    pub async fn open(storage: impl Storage + 'static, kv_store_name: &str, persist_key: impl Into<String>) -> Result<Self> {
        let kv_store = storage.get_or_create_key_value_store(kv_store_name).await?;
        let key = persist_key.into();

        let mut stats = Self::new();
        if let Some(record) = storage.get_record(kv_store, &key).await? {
            let persisted: PersistedStatistics = serde_json::from_slice(&record.value)?;
            debug!(finished = persisted.requests_finished, failed = persisted.requests_failed, "recovered statistics");
            stats.requests_finished.store(persisted.requests_finished, Ordering::Relaxed);
            stats.requests_failed.store(persisted.requests_failed, Ordering::Relaxed);
            stats.total_duration_millis.store(persisted.total_duration_millis, Ordering::Relaxed);
            *stats.retries.lock() = persisted.retries;
        }
        stats.storage = Some((Box::new(storage), kv_store, key));
        Ok(stats)
    }

    /// Records a successfully handled request: increments `requestsFinished`,
    /// accumulates its duration, and bumps `retries[retry_count]`.
    pub fn record_finished(&self, duration: Duration, retry_count: u32) {
        self.requests_finished.fetch_add(1, Ordering::Relaxed);
        self.total_duration_millis.fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        *self.retries.lock().entry(retry_count).or_insert(0) += 1;
    }

    /// Records a terminally failed request (retries exhausted or `noRetry`).
    pub fn record_failed(&self, duration: Duration, retry_count: u32) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
        self.total_duration_millis.fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        *self.retries.lock().entry(retry_count).or_insert(0) += 1;
    }

    pub fn requests_finished(&self) -> u64 {
        self.requests_finished.load(Ordering::Relaxed)
    }

    pub fn requests_failed(&self) -> u64 {
        self.requests_failed.load(Ordering::Relaxed)
    }

    pub fn crawl_duration(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn summary(&self) -> StatisticsSummary {
        let finished = self.requests_finished.load(Ordering::Relaxed);
        let failed = self.requests_failed.load(Ordering::Relaxed);
        let total_handled = finished + failed;
        let mean = if total_handled == 0 {
            0.0
        } else {
            self.total_duration_millis.load(Ordering::Relaxed) as f64 / total_handled as f64
        };
        StatisticsSummary {
            requests_finished: finished,
            requests_failed: failed,
            mean_request_duration_millis: mean,
            retries: self.retries.lock().clone(),
        }
    }

    /// Persists the current snapshot, the way spec.md §4.8 requires on
    /// every `persistStateIntervalMillis` tick. A no-op if no backend was
    /// configured via [`Statistics::open`].
    pub async fn persist_state(&self) -> Result<()> {
        let Some((storage, kv_store, key)) = &self.storage else {
            return Ok(());
        };
        let persisted = PersistedStatistics {
            requests_finished: self.requests_finished.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            total_duration_millis: self.total_duration_millis.load(Ordering::Relaxed),
            retries: self.retries.lock().clone(),
        };
        let bytes = serde_json::to_vec(&persisted)?;
        storage
            .set_record(
                *kv_store,
                KeyValueRecord {
                    key: key.clone(),
                    value: bytes,
                    content_type: "application/json".into(),
                },
            )
            .await
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    #[test]
    fn summary_mean_duration_is_zero_with_no_requests() {
        let stats = Statistics::new();
        assert_eq!(stats.summary().mean_request_duration_millis, 0.0);
    }

    #[test]
    fn record_finished_updates_histogram_and_counts() {
        let stats = Statistics::new();
        stats.record_finished(Duration::from_millis(100), 0);
        stats.record_finished(Duration::from_millis(300), 2);
        stats.record_failed(Duration::from_millis(50), 3);

        let summary = stats.summary();
        assert_eq!(summary.requests_finished, 2);
        assert_eq!(summary.requests_failed, 1);
        assert_eq!(summary.retries.get(&0), Some(&1));
        assert_eq!(summary.retries.get(&2), Some(&1));
        assert_eq!(summary.retries.get(&3), Some(&1));
        assert_eq!(summary.mean_request_duration_millis, 150.0);
    }

    #[tokio::test]
    async fn persisted_statistics_are_recovered_on_reopen() {
        let storage = std::sync::Arc::new(MemoryStorage::new());
        let stats = Statistics::open(storage.clone(), "statistics", "default").await.unwrap();
        stats.record_finished(Duration::from_millis(200), 1);
        stats.persist_state().await.unwrap();

        let reopened = Statistics::open(storage, "statistics", "default").await.unwrap();
        assert_eq!(reopened.requests_finished(), 1);
        assert_eq!(reopened.summary().retries.get(&1), Some(&1));
    }

    #[test]
    fn display_formats_a_readable_summary() {
        let stats = Statistics::new();
        stats.record_finished(Duration::from_millis(10), 0);
        let rendered = stats.summary().to_string();
        assert!(rendered.contains("finished=1"));
    }
}
