//! The persistent, deduplicated, FIFO-with-forefront request queue
//! (component #2, spec.md §4.2).
//!
//! The head-cache algorithm, reclaim delay, and `isFinished` consistency
//! barrier are implemented exactly as spec.md §4.2 describes them; the
//! retry/backoff arithmetic on reclaim is `Request<InProgress>::reclaim`
//! from [`crate::request::transitions`].

use std::collections::{HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::Configuration;
use crate::error::{CrawlError, Result};
use crate::request::transitions::RetryConfig;
use crate::request::{AnyRequest, Handled, InProgress, Pending, Request, RequestId, RequestInput};
use crate::storage::{AddRequestResult, QueueId, Storage};

#[derive(Debug, Clone, Copy)]
pub struct RequestQueueConfig {
    pub query_head_min_length: usize,
    pub storage_consistency_delay: Duration,
    pub api_processed_requests_delay: Duration,
    pub dedup_cache_capacity: usize,
}

impl Default for RequestQueueConfig {
    fn default() -> Self {
        let defaults = Configuration::default();
        Self {
            query_head_min_length: defaults.query_head_min_length,
            storage_consistency_delay: Duration::from_millis(defaults.storage_consistency_delay_millis),
            api_processed_requests_delay: Duration::from_millis(defaults.api_processed_requests_delay_millis),
            dedup_cache_capacity: defaults.dedup_cache_capacity,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DedupEntry {
    id: RequestId,
    was_already_handled: bool,
}

/// Local front-end state over a backend [`Storage`]'s request-queue
/// methods: a head cache, an in-progress set, a reclaim-delay hold set,
/// and a `uniqueKey` dedup cache.
pub struct RequestQueue<S: Storage> {
    storage: S,
    queue: QueueId,
    config: RequestQueueConfig,
    head_cache: Mutex<VecDeque<RequestId>>,
    in_progress: Mutex<HashSet<RequestId>>,
    reclaimed_held: Mutex<Vec<(RequestId, Instant)>>,
    dedup: Mutex<LruCache<String, DedupEntry>>,
    queue_modified_at: Mutex<chrono::DateTime<Utc>>,
    had_multiple_clients: Mutex<bool>,
}

impl<S: Storage> RequestQueue<S> {
    pub fn new(storage: S, queue: QueueId, config: RequestQueueConfig) -> Self {
        let capacity = NonZeroUsize::new(config.dedup_cache_capacity.max(1)).unwrap();
        Self {
            storage,
            queue,
            config,
            head_cache: Mutex::new(VecDeque::new()),
            in_progress: Mutex::new(HashSet::new()),
            reclaimed_held: Mutex::new(Vec::new()),
            dedup: Mutex::new(LruCache::new(capacity)),
            queue_modified_at: Mutex::new(Utc::now()),
            had_multiple_clients: Mutex::new(false),
        }
    }

    /// Opens (or creates) a named queue and wraps it.
    pub async fn open(storage: S, name: &str, config: RequestQueueConfig) -> Result<Self> {
        let queue = storage.get_or_create_request_queue(name).await?;
        Ok(Self::new(storage, queue, config))
    }

    /// `addRequest`: idempotent on `uniqueKey`. The dedup cache
    /// short-circuits a repeat insert it already confirmed with the
    /// backend; a cache miss always falls through to the backend (the
    /// cache never denies insertion on its own).
    pub async fn add_request(&self, input: RequestInput, forefront: bool) -> Result<AddRequestResult> {
        let request = Request::new(input)?;
        let unique_key = request.unique_key().to_string();

        if let Some(entry) = self.dedup.lock().get(&unique_key).copied() {
            return Ok(AddRequestResult {
                id: entry.id,
                was_already_present: true,
                was_already_handled: entry.was_already_handled,
            });
        }

        let result = self.storage.add_request(self.queue, request, forefront).await?;
        self.dedup.lock().put(
            unique_key,
            DedupEntry {
                id: result.id,
                was_already_handled: result.was_already_handled,
            },
        );

        if !result.was_already_present && !result.was_already_handled {
            let mut head = self.head_cache.lock();
            if forefront {
                head.push_front(result.id);
            } else {
                head.push_back(result.id);
            }
        }

        Ok(result)
    }

    /// `addRequests`: bulk insert. Returns `(results, unprocessed)` —
    /// inputs that failed with a transient backend error and should be
    /// retried by the caller after a backoff (spec.md §4.2: "~1 s").
    pub async fn add_requests(
        &self,
        inputs: Vec<RequestInput>,
        forefront: bool,
    ) -> (Vec<AddRequestResult>, Vec<RequestInput>) {
        let mut results = Vec::with_capacity(inputs.len());
        let mut unprocessed = Vec::new();
        for input in inputs {
            let retry = input.clone();
            match self.add_request(input, forefront).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!(error = %e, "addRequests: one input failed, queued for caller retry");
                    unprocessed.push(retry);
                }
            }
        }
        (results, unprocessed)
    }

    /// Convenience wrapper noted in the design notes: build a
    /// [`RequestInput`] per URL with defaults and enqueue them all.
    pub async fn add_requests_from_urls(
        &self,
        urls: impl IntoIterator<Item = impl Into<String>>,
        forefront: bool,
    ) -> (Vec<AddRequestResult>, Vec<RequestInput>) {
        let inputs = urls.into_iter().map(|u| RequestInput::new(u.into())).collect();
        self.add_requests(inputs, forefront).await
    }

    fn is_held_for_reclaim(&self, id: RequestId, now: Instant) -> bool {
        let mut held = self.reclaimed_held.lock();
        held.retain(|&(_, at)| now.duration_since(at) < self.config.storage_consistency_delay);
        held.iter().any(|&(held_id, _)| held_id == id)
    }

    /// `fetchNextRequest`: head-cache algorithm (spec.md §4.2 steps 1-3).
    pub async fn fetch_next_request(&self) -> Result<Option<Request<InProgress>>> {
        loop {
            let next = self.head_cache.lock().pop_front();
            let Some(id) = next else {
                if !self.refill_head_cache().await? {
                    return Ok(None);
                }
                if self.head_cache.lock().is_empty() {
                    return Ok(None);
                }
                continue;
            };

            match self.storage.get_request(self.queue, id).await? {
                None => {
                    trace!(%id, "head cache id missing from backend, treating as transient");
                    continue;
                }
                Some(AnyRequest::Pending(pending)) => {
                    let in_progress = pending.lease(self.queue, &self.storage).await?;
                    self.in_progress.lock().insert(id);
                    return Ok(Some(in_progress));
                }
                Some(_) => {
                    trace!(%id, "head cache id already leased or handled, skipping");
                    continue;
                }
            }
        }
    }

    /// Step 2 of the head-cache algorithm: query the backend and populate
    /// the local cache. Returns whether any candidate ids were added.
    async fn refill_head_cache(&self) -> Result<bool> {
        let in_progress_len = self.in_progress.lock().len();
        let limit = self.config.query_head_min_length.max((in_progress_len as f64).sqrt().ceil() as usize);

        let result = self.storage.list_head(self.queue, limit).await?;
        *self.queue_modified_at.lock() = result.queue_modified_at;
        if result.had_multiple_clients {
            *self.had_multiple_clients.lock() = true;
        }

        let now = Instant::now();
        let in_progress = self.in_progress.lock();
        let mut head = self.head_cache.lock();
        let mut added = false;
        for id in result.items {
            if in_progress.contains(&id) || self.is_held_for_reclaim(id, now) {
                continue;
            }
            head.push_back(id);
            added = true;
        }
        Ok(added)
    }

    /// `markRequestHandled`: terminal success. Errors if `req.id` was not
    /// locally tracked as in-progress.
    pub async fn mark_request_handled(&self, request: Request<InProgress>) -> Result<Request<Handled>> {
        let id = request.id();
        if !self.in_progress.lock().remove(&id) {
            return Err(CrawlError::InvalidState(
                id,
                "not-in-progress".into(),
                "handled".into(),
            ));
        }
        let unique_key = request.unique_key().to_string();
        let handled = request.mark_handled(self.queue, &self.storage).await?;
        if let Some(entry) = self.dedup.lock().get_mut(&unique_key) {
            entry.was_already_handled = true;
        }
        Ok(handled)
    }

    /// Terminal failure path: retries exhausted or `noRetry` set. Not
    /// named directly in spec.md's `RequestQueue` contract (§4.2 only
    /// lists `markRequestHandled`) — the error-handler funnel of §4.7
    /// calls this instead of `mark_request_handled` when giving up, so the
    /// final error message still lands on the persisted record.
    pub async fn mark_request_failed(
        &self,
        request: Request<InProgress>,
        error_message: impl Into<String>,
    ) -> Result<Request<Handled>> {
        let id = request.id();
        if !self.in_progress.lock().remove(&id) {
            return Err(CrawlError::InvalidState(
                id,
                "not-in-progress".into(),
                "handled".into(),
            ));
        }
        let unique_key = request.unique_key().to_string();
        let handled = request.fail(self.queue, error_message, &self.storage).await?;
        if let Some(entry) = self.dedup.lock().get_mut(&unique_key) {
            entry.was_already_handled = true;
        }
        Ok(handled)
    }

    /// `reclaimRequest`: return to pending, held out of the head cache for
    /// `STORAGE_CONSISTENCY_DELAY_MILLIS` so a reader that just saw the
    /// record `in-progress` sees a coherent view.
    pub async fn reclaim_request(
        &self,
        request: Request<InProgress>,
        forefront: bool,
        error_message: impl Into<String>,
        retry_config: &RetryConfig,
    ) -> Result<Request<Pending>> {
        let id = request.id();
        self.in_progress.lock().remove(&id);
        let pending = request
            .reclaim(self.queue, forefront, error_message, retry_config, &self.storage)
            .await?;
        self.reclaimed_held.lock().push((id, Instant::now()));
        Ok(pending)
    }

    pub async fn get_request(&self, id: RequestId) -> Result<Option<AnyRequest>> {
        self.storage.get_request(self.queue, id).await
    }

    pub async fn handled_count(&self) -> Result<u64> {
        self.storage.handled_count(self.queue).await
    }

    /// `isEmpty()`: nothing cached locally and the backend confirms it.
    pub async fn is_empty(&self) -> Result<bool> {
        if !self.head_cache.lock().is_empty() || !self.in_progress.lock().is_empty() {
            return Ok(false);
        }
        let result = self.storage.list_head(self.queue, 1).await?;
        Ok(result.items.is_empty())
    }

    /// `isFinished()` consistency barrier (spec.md §4.2): only true once
    /// the local caches, the backend, and the staleness window all agree.
    pub async fn is_finished(&self) -> Result<bool> {
        if !self.head_cache.lock().is_empty() || !self.in_progress.lock().is_empty() {
            return Ok(false);
        }

        let result = self.storage.list_head(self.queue, 1).await?;
        if !result.items.is_empty() {
            return Ok(false);
        }

        let modified_at = *self.queue_modified_at.lock();
        let age = Utc::now().signed_duration_since(modified_at);
        let threshold = chrono::Duration::from_std(self.config.api_processed_requests_delay).unwrap_or_default();
        if age < threshold {
            debug!(age_ms = age.num_milliseconds(), "queue modified too recently, not finished yet");
            return Ok(false);
        }

        Ok(true)
    }

    pub async fn drop_queue(&self) -> Result<()> {
        self.storage.delete_request_queue(self.queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    async fn queue() -> RequestQueue<MemoryStorage> {
        let storage = MemoryStorage::new();
        RequestQueue::open(storage, "q", RequestQueueConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn add_request_is_idempotent_on_unique_key() {
        let q = queue().await;
        let a = q.add_request(RequestInput::new("https://example.com"), false).await.unwrap();
        let b = q.add_request(RequestInput::new("https://example.com"), false).await.unwrap();
        assert_eq!(a.id, b.id);
        assert!(b.was_already_present);
    }

    #[tokio::test]
    async fn fetch_next_request_leases_and_mark_handled_completes() {
        let q = queue().await;
        q.add_request(RequestInput::new("https://example.com/a"), false).await.unwrap();

        let leased = q.fetch_next_request().await.unwrap().expect("a request should be ready");
        assert!(q.fetch_next_request().await.unwrap().is_none());

        q.mark_request_handled(leased).await.unwrap();
        assert_eq!(q.handled_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reclaimed_request_is_held_out_of_head_cache_briefly() {
        let q = queue().await;
        q.add_request(RequestInput::new("https://example.com/a"), false).await.unwrap();
        let leased = q.fetch_next_request().await.unwrap().unwrap();

        q.reclaim_request(leased, false, "boom", &RetryConfig::default())
            .await
            .unwrap();

        // Refilling immediately must not resurface the just-reclaimed id.
        assert!(q.fetch_next_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn is_finished_is_false_until_processed_delay_elapses() {
        let mut config = RequestQueueConfig::default();
        config.api_processed_requests_delay = Duration::from_millis(50);
        let storage = MemoryStorage::new();
        let q = RequestQueue::open(storage, "q", config).await.unwrap();

        assert!(q.is_finished().await.unwrap());

        q.add_request(RequestInput::new("https://example.com/a"), false).await.unwrap();
        let leased = q.fetch_next_request().await.unwrap().unwrap();
        q.mark_request_handled(leased).await.unwrap();

        assert!(!q.is_finished().await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(q.is_finished().await.unwrap());
    }
}
