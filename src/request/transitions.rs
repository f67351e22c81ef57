//! Lifecycle transitions for [`Request<S>`].
//!
//! Adapts `fusillade::request::transitions` directly: each transition
//! consumes `self`, persists the new state through [`Storage`], and
//! returns the request typed at its new state — the compiler then refuses
//! to let a caller act on a request as though it were still in its old
//! state.

use chrono::Utc;

use crate::error::Result;
use crate::storage::{QueueId, Storage};

use super::{AnyRequest, Handled, InProgress, Pending, Request};

/// Retry/backoff policy, the same shape as
/// `fusillade::request::transitions::RetryConfig`.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_request_retries: u32,
    pub backoff_ms: u64,
    pub backoff_factor: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_request_retries: 3,
            backoff_ms: 1000,
            backoff_factor: 2,
            max_backoff_ms: 30_000,
        }
    }
}

fn compute_backoff_millis(retry_count: u32, config: &RetryConfig) -> u64 {
    let exponential = config
        .backoff_ms
        .saturating_mul(config.backoff_factor.saturating_pow(retry_count));
    exponential.min(config.max_backoff_ms)
}

impl Request<Pending> {
    /// Lease this request to a worker. Spec.md §4.2 `fetchNextRequest`
    /// moves the record to `in-progress`.
    pub async fn lease<S: Storage + ?Sized>(self, queue: QueueId, storage: &S) -> Result<Request<InProgress>> {
        let request = Request {
            data: self.data,
            state: InProgress {
                leased_at: Utc::now(),
            },
        };
        storage
            .update_request(queue, AnyRequest::from(request.clone()), false)
            .await?;
        Ok(request)
    }
}

impl Request<InProgress> {
    /// Whether this request still has retry budget, per spec.md §8
    /// ("retryCount(R) ≤ maxRequestRetries at any observable point").
    pub fn can_retry(&self, config: &RetryConfig) -> bool {
        !self.data.no_retry && self.data.retry_count < config.max_request_retries
    }

    /// Terminal success: `markRequestHandled` (spec.md §4.2). Fails if the
    /// caller doesn't hold a valid lease, which the type system already
    /// prevents — this can only be called on a `Request<InProgress>`.
    pub async fn mark_handled<S: Storage + ?Sized>(
        self,
        queue: QueueId,
        storage: &S,
    ) -> Result<Request<Handled>> {
        let request = Request {
            data: self.data,
            state: Handled {
                handled_at: Utc::now(),
                succeeded: true,
            },
        };
        storage
            .update_request(queue, AnyRequest::from(request.clone()), false)
            .await?;
        Ok(request)
    }

    /// Terminal failure: retries are exhausted or `noRetry` is set. The
    /// request is still marked handled (spec.md §3: "once handledAt is set
    /// the request is terminal" — there is no separate failed bucket at
    /// the request level; [`crate::statistics::Statistics`] is what
    /// records the failure). `error_message` is appended to
    /// `errorMessages` before the terminal transition, the same as a
    /// reclaim does for a retried failure.
    pub async fn fail<S: Storage + ?Sized>(
        mut self,
        queue: QueueId,
        error_message: impl Into<String>,
        storage: &S,
    ) -> Result<Request<Handled>> {
        self.data.error_messages.push(error_message.into());
        let request = Request {
            data: self.data,
            state: Handled {
                handled_at: Utc::now(),
                succeeded: false,
            },
        };
        storage
            .update_request(queue, AnyRequest::from(request.clone()), false)
            .await?;
        Ok(request)
    }

    /// Return this request to `Pending` for a retry, guarded by the
    /// reclaim-delay/backoff of spec.md §4.2: `not_before` is set from the
    /// exponential-backoff arithmetic below, not merely the 50ms storage
    /// consistency delay (that delay is enforced by
    /// `RequestQueue::fetch_next_request`'s head-cache exclusion, not here).
    ///
    /// `forefront` controls whether the reclaimed id re-enters the head of
    /// the ready set (hint only, per spec.md §5); `error_message` is
    /// appended to `errorMessages` and `retryCount` is incremented.
    pub async fn reclaim<S: Storage + ?Sized>(
        mut self,
        queue: QueueId,
        forefront: bool,
        error_message: impl Into<String>,
        config: &RetryConfig,
        storage: &S,
    ) -> Result<Request<Pending>> {
        self.data.retry_count += 1;
        self.data.error_messages.push(error_message.into());

        let backoff = compute_backoff_millis(self.data.retry_count, config);
        let not_before = Some(Utc::now() + chrono::Duration::milliseconds(backoff as i64));

        let request = Request {
            data: self.data,
            state: Pending { not_before },
        };
        storage
            .update_request(queue, AnyRequest::from(request.clone()), forefront)
            .await?;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestInput;
    use crate::storage::memory::MemoryStorage;

    #[tokio::test]
    async fn reclaim_increments_retry_count_and_appends_message() {
        let storage = MemoryStorage::new();
        let queue = storage.get_or_create_request_queue("q").await.unwrap();

        let pending = Request::new(RequestInput::new("https://example.com")).unwrap();
        storage.add_request(queue, pending.clone(), false).await.unwrap();
        let in_progress = pending.lease(queue, &storage).await.unwrap();

        let reclaimed = in_progress
            .reclaim(queue, false, "boom", &RetryConfig::default(), &storage)
            .await
            .unwrap();

        assert_eq!(reclaimed.data.retry_count, 1);
        assert_eq!(reclaimed.data.error_messages, vec!["boom".to_string()]);
        assert!(reclaimed.state.not_before.is_some());
    }

    #[tokio::test]
    async fn can_retry_respects_no_retry_flag() {
        let storage = MemoryStorage::new();
        let queue = storage.get_or_create_request_queue("q").await.unwrap();

        let mut input = RequestInput::new("https://example.com");
        input.no_retry = true;
        let pending = Request::new(input).unwrap();
        storage.add_request(queue, pending.clone(), false).await.unwrap();
        let in_progress = pending.lease(queue, &storage).await.unwrap();

        assert!(!in_progress.can_retry(&RetryConfig::default()));
    }

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let config = RetryConfig {
            max_request_retries: 10,
            backoff_ms: 100,
            backoff_factor: 2,
            max_backoff_ms: 500,
        };
        assert_eq!(compute_backoff_millis(0, &config), 100);
        assert_eq!(compute_backoff_millis(1, &config), 200);
        assert_eq!(compute_backoff_millis(2, &config), 400);
        assert_eq!(compute_backoff_millis(3, &config), 500); // capped
    }
}
