//! The core loop gluing components #2-7 together into the per-request
//! state machine of spec.md §4.7: lease, acquire session, hooks, navigate,
//! handle, mark-handled | reclaim | fail.
//!
//! The dispatch shell is [`crate::autoscaled_pool::AutoscaledPool`] (itself
//! grounded on `fusillade::daemon::Daemon::run`); what's new here is the
//! per-request pipeline and the error-handler funnel, which generalizes
//! `daemon::mod.rs`'s own claim → process → complete-or-unclaim shape from
//! "one HTTP POST" to the nine-step sequence spec.md §4.7 describes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::autoscaled_pool::{AutoscaledPool, AutoscaledPoolConfig, PredicateFn, TaskFn};
use crate::error::{CrawlError, Result};
use crate::events::{CrawlerEvent, EventBus};
use crate::navigation::{CrawlingContext, Hook, NavigationHandler};
use crate::request::transitions::RetryConfig;
use crate::request::{InProgress, Request, RequestInput};
use crate::request_list::RequestList;
use crate::request_queue::RequestQueue;
use crate::session::SessionPool;
use crate::snapshotter::{Snapshotter, SnapshotterConfig};
use crate::statistics::Statistics;
use crate::storage::{AddRequestResult, Storage};
use crate::system_status::{SystemStatus, SystemStatusConfig};

pub type RequestHandlerFn<S> = Arc<dyn Fn(CrawlingContext<S>) -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub type FailedRequestHandlerFn<S> =
    Arc<dyn Fn(CrawlingContext<S>, CrawlError) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Knobs for the core loop (spec.md §4.7, §5, §9).
#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    /// Soft ceiling on `requestsFinished + requestsFailed` (spec.md §4.7
    /// "max-requests guard"). `None` means unbounded.
    pub max_requests_per_crawl: Option<u64>,
    /// Bound on the user request handler (step 7).
    pub request_handler_timeout: Duration,
    /// Bound applied to the error-handler's own `failedRequestHandler`
    /// invocation and to internal suspension points.
    pub internal_timeout: Duration,
    /// Response statuses that trigger a `BlockedError` and session
    /// retirement (step 5).
    pub blocked_status_codes: Vec<u16>,
    /// Retry/backoff policy shared with [`crate::request_queue::RequestQueue`].
    pub retry: RetryConfig,
    /// How often [`Crawler::persist_state`] runs on a timer.
    pub persist_state_interval: Duration,
    /// Grace period given to in-flight tasks on a `Migrating` event
    /// (spec.md §5, `SAFE_MIGRATION_WAIT_MILLIS`).
    pub safe_migration_wait: Duration,
    pub pool: AutoscaledPoolConfig,
    pub snapshotter: SnapshotterConfig,
    pub system_status: SystemStatusConfig,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        let defaults = crate::config::Configuration::default();
        Self {
            max_requests_per_crawl: None,
            request_handler_timeout: Duration::from_secs(60),
            internal_timeout: Duration::from_millis(defaults.internal_timeout_millis),
            blocked_status_codes: vec![401, 403, 429],
            retry: RetryConfig::default(),
            persist_state_interval: Duration::from_secs(60),
            safe_migration_wait: Duration::from_millis(defaults.safe_migration_wait_millis),
            pool: AutoscaledPoolConfig::default(),
            snapshotter: SnapshotterConfig::default(),
            system_status: SystemStatusConfig::default(),
        }
    }
}

/// Drives requests from an optional [`RequestList`] and a [`RequestQueue`]
/// through a [`NavigationHandler`] and a user-supplied request handler,
/// under an [`AutoscaledPool`].
pub struct Crawler<S: Storage, N: NavigationHandler> {
    queue: Arc<RequestQueue<S>>,
    request_list: Option<Arc<RequestList<S>>>,
    navigation: Arc<N>,
    sessions: Option<Arc<SessionPool>>,
    statistics: Arc<Statistics>,
    events: EventBus,
    config: CrawlerConfig,
    pre_navigation_hooks: Vec<Hook<S>>,
    post_navigation_hooks: Vec<Hook<S>>,
    request_handler: RequestHandlerFn<S>,
    failed_request_handler: Option<FailedRequestHandlerFn<S>>,
    /// Maps a queue-assigned id back to the `RequestList` id it was
    /// promoted from (spec.md §4.7 step 1), so the list's own bookkeeping
    /// can be closed out once the queue-side record reaches a terminal
    /// state.
    promoted: DashMap<crate::request::RequestId, crate::request::RequestId>,
    pending_work: Mutex<std::collections::VecDeque<Request<InProgress>>>,
    pool_handle: Mutex<Option<Arc<AutoscaledPool>>>,
    /// Set once `run()` spawns the snapshotter, so the request pipeline
    /// can feed it observed client errors (spec.md §3/§4.4 "client"
    /// series). `None` before `run()` starts or if the crawler is only
    /// being used to seed a queue.
    snapshotter_handle: Mutex<Option<Arc<Snapshotter>>>,
}

impl<S: Storage + 'static, N: NavigationHandler + 'static> Crawler<S, N> {
    pub fn new(
        queue: Arc<RequestQueue<S>>,
        navigation: Arc<N>,
        request_handler: RequestHandlerFn<S>,
        config: CrawlerConfig,
    ) -> Self {
        Self {
            queue,
            request_list: None,
            navigation,
            sessions: None,
            statistics: Arc::new(Statistics::new()),
            events: EventBus::default(),
            config,
            pre_navigation_hooks: Vec::new(),
            post_navigation_hooks: Vec::new(),
            request_handler,
            failed_request_handler: None,
            promoted: DashMap::new(),
            pending_work: Mutex::new(std::collections::VecDeque::new()),
            pool_handle: Mutex::new(None),
            snapshotter_handle: Mutex::new(None),
        }
    }

    pub fn with_request_list(mut self, list: Arc<RequestList<S>>) -> Self {
        self.request_list = Some(list);
        self
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionPool>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_statistics(mut self, statistics: Arc<Statistics>) -> Self {
        self.statistics = statistics;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_failed_request_handler(mut self, handler: FailedRequestHandlerFn<S>) -> Self {
        self.failed_request_handler = Some(handler);
        self
    }

    pub fn with_pre_navigation_hook(mut self, hook: Hook<S>) -> Self {
        self.pre_navigation_hooks.push(hook);
        self
    }

    pub fn with_post_navigation_hook(mut self, hook: Hook<S>) -> Self {
        self.post_navigation_hooks.push(hook);
        self
    }

    pub fn statistics(&self) -> Arc<Statistics> {
        self.statistics.clone()
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// Convenience pass-through to the underlying queue, for seeding a
    /// crawl with starting URLs (spec.md §1's `enqueueLinks`-style
    /// convenience, applied to initial seeding rather than link
    /// extraction).
    pub async fn add_requests_from_urls(
        &self,
        urls: impl IntoIterator<Item = impl Into<String>>,
    ) -> (Vec<AddRequestResult>, Vec<RequestInput>) {
        self.queue.add_requests_from_urls(urls, false).await
    }

    fn abort(&self) {
        if let Some(pool) = self.pool_handle.lock().clone() {
            pool.abort();
        }
    }

    /// Drive the crawl to completion: spawns the background snapshotter,
    /// the periodic persist-state ticker, and an event-reaction task, then
    /// runs the [`AutoscaledPool`] dispatch loop until both sources report
    /// finished and no task is in flight.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let snapshotter = Arc::new(Snapshotter::new(self.config.snapshotter.clone()));
        let system_status = Arc::new(SystemStatus::new(snapshotter.clone(), self.config.system_status));
        let pool = Arc::new(AutoscaledPool::new(self.config.pool.clone(), system_status));
        *self.pool_handle.lock() = Some(pool.clone());
        *self.snapshotter_handle.lock() = Some(snapshotter.clone());

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let snapshotter_task = tokio::spawn(snapshotter.clone().run(shutdown_rx));

        let persist_task = {
            let this = self.clone();
            let interval_duration = self.config.persist_state_interval;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(interval_duration);
                tick.tick().await; // first tick fires immediately; skip it
                loop {
                    tick.tick().await;
                    if let Err(e) = this.persist_state().await {
                        warn!(error = %e, "periodic persist_state failed");
                    }
                }
            })
        };

        let events_task = {
            let this = self.clone();
            let pool = pool.clone();
            let mut rx = self.events.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = rx.recv().await {
                    match event {
                        CrawlerEvent::Aborting => {
                            let _ = this.persist_state().await;
                            pool.abort();
                        }
                        CrawlerEvent::Migrating => {
                            let _ = this.persist_state().await;
                            if let Err(e) = pool.drain(this.config.safe_migration_wait).await {
                                warn!(error = %e, "tasks did not finish within the safe migration window");
                            }
                        }
                        CrawlerEvent::PersistState => {
                            let _ = this.persist_state().await;
                        }
                        _ => {}
                    }
                }
            })
        };

        let run_task: TaskFn = {
            let this = self.clone();
            Arc::new(move || {
                let this = this.clone();
                Box::pin(async move {
                    this.run_one_dispatched_task().await;
                    Ok(())
                }) as BoxFuture<'static, Result<()>>
            })
        };
        let is_task_ready: PredicateFn = {
            let this = self.clone();
            Arc::new(move || {
                let this = this.clone();
                Box::pin(async move { this.try_reserve_next().await }) as BoxFuture<'static, bool>
            })
        };
        let is_finished: PredicateFn = {
            let this = self.clone();
            Arc::new(move || {
                let this = this.clone();
                Box::pin(async move {
                    match this.default_is_finished().await {
                        Ok(finished) => finished,
                        Err(e) => {
                            error!(error = %e, "is_finished check failed, treating as not finished");
                            false
                        }
                    }
                }) as BoxFuture<'static, bool>
            })
        };

        let result = pool.run(run_task, is_task_ready, is_finished).await;

        let _ = shutdown_tx.send(());
        let _ = snapshotter_task.await;
        persist_task.abort();
        events_task.abort();
        self.persist_state().await?;
        result
    }

    async fn default_is_finished(&self) -> Result<bool> {
        if let Some(max) = self.config.max_requests_per_crawl {
            let handled = self.statistics.requests_finished() + self.statistics.requests_failed();
            if handled >= max {
                return Ok(true);
            }
        }
        let queue_finished = self.queue.is_finished().await?;
        let list_finished = match &self.request_list {
            Some(list) => list.is_finished(),
            None => true,
        };
        Ok(queue_finished && list_finished)
    }

    async fn try_reserve_next(self: &Arc<Self>) -> bool {
        if let Some(max) = self.config.max_requests_per_crawl {
            let handled = self.statistics.requests_finished() + self.statistics.requests_failed();
            if handled >= max {
                return false;
            }
        }
        match self.lease_next().await {
            Ok(Some(request)) => {
                self.pending_work.lock().push_back(request);
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!(error = %e, "failed to lease the next request");
                false
            }
        }
    }

    /// Step 1 of the per-request pipeline: promote one `RequestList` item
    /// into the queue (forefront) if a list is configured, then lease from
    /// the queue as normal. Promoting before leasing lets a list item
    /// share deduplication with queue items without changing the
    /// externally observed order (spec.md §4.7).
    async fn lease_next(&self) -> Result<Option<Request<InProgress>>> {
        if let Some(list) = &self.request_list {
            if let Some((list_id, data)) = list.fetch_next_request() {
                let input = RequestInput {
                    url: data.url.clone(),
                    method: Some(data.method),
                    payload: data.payload.clone(),
                    headers: data.headers.clone(),
                    user_data: Some(data.user_data.clone()),
                    unique_key: Some(data.unique_key.clone()),
                    no_retry: data.no_retry,
                };
                match self.queue.add_request(input, true).await {
                    Ok(result) if result.was_already_handled => {
                        debug!(%list_id, "request-list item was already handled via the queue, closing it out");
                        list.mark_request_handled(list_id)?;
                    }
                    Ok(result) => {
                        self.promoted.insert(result.id, list_id);
                    }
                    Err(e) => {
                        list.reclaim_request(list_id)?;
                        return Err(e);
                    }
                }
            }
        }

        self.queue.fetch_next_request().await
    }

    async fn run_one_dispatched_task(self: Arc<Self>) {
        let Some(request) = self.pending_work.lock().pop_front() else {
            warn!("dispatched task had no reserved request waiting; this indicates a scheduling bug");
            return;
        };
        self.process_request(request).await;
    }

    async fn run_hooks(&self, hooks: &[Hook<S>], ctx: &mut CrawlingContext<S>) -> Result<()> {
        for hook in hooks {
            hook(ctx).await?;
        }
        Ok(())
    }

    /// Steps 2-9 of spec.md §4.7.
    async fn process_request(self: Arc<Self>, request: Request<InProgress>) {
        let started = Instant::now();

        let session = match &self.sessions {
            Some(pool) => match pool.get_session() {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!(error = %e, "proceeding without a session for this request");
                    None
                }
            },
            None => None,
        };

        let mut ctx = CrawlingContext::new(request.id(), request.data.clone(), session.clone(), self.queue.clone());

        if let Err(e) = self.run_hooks(&self.pre_navigation_hooks, &mut ctx).await {
            self.handle_request_error(request, started, session, e).await;
            return;
        }

        let response = match self.navigation.navigate(&ctx.request, ctx.session.as_deref()).await {
            Ok(response) => response,
            Err(e) => {
                self.handle_request_error(request, started, session, e).await;
                return;
            }
        };

        if self.config.blocked_status_codes.contains(&response.status) {
            if let Some(session) = &session {
                session.retire();
            }
            if let Some(snapshotter) = self.snapshotter_handle.lock().clone() {
                snapshotter.record_client_error();
            }
            self.handle_request_error(request, started, session, CrawlError::Blocked { status: response.status })
                .await;
            return;
        }
        ctx.response = Some(response);

        if let Err(e) = self.run_hooks(&self.post_navigation_hooks, &mut ctx).await {
            self.handle_request_error(request, started, session, e).await;
            return;
        }

        let handler_future = (self.request_handler)(ctx);
        match tokio::time::timeout(self.config.request_handler_timeout, handler_future).await {
            Ok(Ok(())) => self.complete_request(request, started, session).await,
            Ok(Err(e)) => self.handle_request_error(request, started, session, e).await,
            Err(_elapsed) => {
                let millis = self.config.request_handler_timeout.as_millis() as u32;
                self.handle_request_error(request, started, session, CrawlError::TimedOut(millis)).await;
            }
        }
    }

    async fn complete_request(
        self: &Arc<Self>,
        request: Request<InProgress>,
        started: Instant,
        session: Option<Arc<crate::session::Session>>,
    ) {
        let id = request.id();
        let retry_count = request.data.retry_count;
        match self.queue.mark_request_handled(request).await {
            Ok(_) => {
                if let Some(session) = &session {
                    session.mark_good();
                }
                self.close_out_promotion(id);
                self.statistics.record_finished(started.elapsed(), retry_count);
            }
            Err(e) => error!(%id, error = %e, "failed to mark request handled"),
        }
    }

    /// Spec.md §4.7 "Error handler": append the message, retry if budget
    /// remains, otherwise mark failed and hand off to the user's
    /// `failedRequestHandler`.
    async fn handle_request_error(
        self: &Arc<Self>,
        request: Request<InProgress>,
        started: Instant,
        session: Option<Arc<crate::session::Session>>,
        error: CrawlError,
    ) {
        if let Some(session) = &session {
            session.mark_bad();
        }

        if request.can_retry(&self.config.retry) {
            let message = error.to_string();
            if let Err(e) = self.queue.reclaim_request(request, false, message, &self.config.retry).await {
                error!(error = %e, "failed to reclaim request after a handler error");
            }
            return;
        }

        let id = request.id();
        let retry_count = request.data.retry_count;
        let message = error.to_string();

        let failed = match self.queue.mark_request_failed(request, message).await {
            Ok(failed) => failed,
            Err(e) => {
                error!(%id, error = %e, "failed to mark request failed");
                return;
            }
        };
        debug!(%id, handled_at = ?failed.state.handled_at, "request exhausted retries");
        self.close_out_promotion(id);
        self.statistics.record_failed(started.elapsed(), retry_count);

        if let Some(handler) = &self.failed_request_handler {
            // Cloned after `fail()` has pushed the terminal error onto
            // `errorMessages`, so `failedRequestHandler` sees the complete
            // history (spec.md §8 scenario 2: `errorMessages.length == 4`).
            let ctx_data = failed.data.clone();
            let ctx = CrawlingContext::new(id, ctx_data, session, self.queue.clone());
            let fut = handler(ctx, error);
            match tokio::time::timeout(self.config.internal_timeout, fut).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(%id, error = %e, "failedRequestHandler returned an error; not propagated"),
                Err(_elapsed) => {
                    error!(%id, "failedRequestHandler exceeded its own timeout; aborting crawl");
                    self.abort();
                }
            }
        }
    }

    fn close_out_promotion(&self, queue_id: crate::request::RequestId) {
        if let Some((_, list_id)) = self.promoted.remove(&queue_id) {
            if let Some(list) = &self.request_list {
                if let Err(e) = list.mark_request_handled(list_id) {
                    warn!(%list_id, error = %e, "failed to close out the promoted request-list entry");
                }
            }
        }
    }

    /// Persists statistics and (if configured with a persist key) the
    /// request list's cursor. A `RequestList` with no persist key simply
    /// skips its own persistence rather than failing the whole tick.
    pub async fn persist_state(&self) -> Result<()> {
        if let Some(list) = &self.request_list {
            match list.persist_state().await {
                Ok(()) | Err(CrawlError::Persistence(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.statistics.persist_state().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autoscaled_pool::AutoscaledPoolConfig;
    use crate::navigation::MockNavigationHandler;
    use crate::request_queue::RequestQueueConfig;
    use crate::storage::memory::MemoryStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> CrawlerConfig {
        CrawlerConfig {
            pool: AutoscaledPoolConfig {
                tick_interval: Duration::from_millis(5),
                initial_concurrency: 4,
                max_concurrency: 4,
                ..AutoscaledPoolConfig::default()
            },
            persist_state_interval: Duration::from_secs(3600),
            ..CrawlerConfig::default()
        }
    }

    /// Shrinks the queue's processed-requests staleness window so
    /// `is_finished()` doesn't make every test wait out the 10s production
    /// default.
    fn fast_queue_config() -> RequestQueueConfig {
        RequestQueueConfig {
            storage_consistency_delay: Duration::from_millis(5),
            api_processed_requests_delay: Duration::from_millis(20),
            ..RequestQueueConfig::default()
        }
    }

    #[tokio::test]
    async fn processes_every_seeded_request_exactly_once() {
        let storage = MemoryStorage::new();
        let queue = Arc::new(RequestQueue::open(storage, "q", fast_queue_config()).await.unwrap());
        queue.add_requests_from_urls(["https://a.example", "https://b.example", "https://c.example"], false).await;

        let navigation = Arc::new(MockNavigationHandler::new());
        navigation.set_default_status(200);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_for_handler = seen.clone();
        let handler: RequestHandlerFn<MemoryStorage> = Arc::new(move |ctx| {
            let seen = seen_for_handler.clone();
            Box::pin(async move {
                seen.lock().push(ctx.request.url.clone());
                Ok(())
            }) as BoxFuture<'static, Result<()>>
        });

        let crawler = Arc::new(Crawler::new(queue.clone(), navigation, handler, test_config()));
        crawler.run().await.unwrap();

        let mut urls = seen.lock().clone();
        urls.sort();
        assert_eq!(urls, vec!["https://a.example", "https://b.example", "https://c.example"]);
        assert_eq!(crawler.statistics().requests_finished(), 3);
    }

    #[tokio::test]
    async fn handler_error_retries_then_fails_into_failed_handler() {
        let storage = MemoryStorage::new();
        let queue = Arc::new(RequestQueue::open(storage, "q", fast_queue_config()).await.unwrap());
        queue.add_request(RequestInput::new("https://flaky.example"), false).await.unwrap();

        let navigation = Arc::new(MockNavigationHandler::new());
        navigation.set_default_status(200);

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_for_handler = attempts.clone();
        let handler: RequestHandlerFn<MemoryStorage> = Arc::new(move |_ctx| {
            let attempts = attempts_for_handler.clone();
            Box::pin(async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(CrawlError::Handler("page was not ready".into()))
            }) as BoxFuture<'static, Result<()>>
        });

        let failed_seen = Arc::new(AtomicUsize::new(0));
        let failed_seen_for_handler = failed_seen.clone();
        let failed_error_count = Arc::new(Mutex::new(0usize));
        let failed_error_count_for_handler = failed_error_count.clone();
        let failed_handler: FailedRequestHandlerFn<MemoryStorage> = Arc::new(move |ctx, _err| {
            let failed_seen = failed_seen_for_handler.clone();
            let failed_error_count = failed_error_count_for_handler.clone();
            Box::pin(async move {
                failed_seen.fetch_add(1, Ordering::SeqCst);
                *failed_error_count.lock() = ctx.request.error_messages.len();
                Ok(())
            }) as BoxFuture<'static, Result<()>>
        });

        let mut config = test_config();
        config.retry.max_request_retries = 2;
        config.retry.backoff_ms = 1;
        config.retry.max_backoff_ms = 1;

        let crawler = Arc::new(
            Crawler::new(queue.clone(), navigation, handler, config).with_failed_request_handler(failed_handler),
        );
        crawler.run().await.unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3); // initial + 2 retries
        assert_eq!(failed_seen.load(Ordering::SeqCst), 1);
        // One errorMessages entry per attempt (initial + 2 retries), including
        // the terminal failure itself.
        assert_eq!(*failed_error_count.lock(), 3);
        assert_eq!(crawler.statistics().requests_failed(), 1);
        assert_eq!(crawler.statistics().requests_finished(), 0);
    }

    #[tokio::test]
    async fn max_requests_per_crawl_is_a_soft_ceiling() {
        let storage = MemoryStorage::new();
        let queue = Arc::new(RequestQueue::open(storage, "q", fast_queue_config()).await.unwrap());
        queue
            .add_requests_from_urls(["https://a.example", "https://b.example", "https://c.example"], false)
            .await;

        let navigation = Arc::new(MockNavigationHandler::new());
        navigation.set_default_status(200);

        let handler: RequestHandlerFn<MemoryStorage> = Arc::new(|_ctx| Box::pin(async move { Ok(()) }) as BoxFuture<'static, Result<()>>);

        let mut config = test_config();
        config.max_requests_per_crawl = Some(1);
        let crawler = Arc::new(Crawler::new(queue, navigation, handler, config));
        crawler.run().await.unwrap();

        assert_eq!(crawler.statistics().requests_finished(), 1);
    }

    #[tokio::test]
    async fn request_list_items_are_promoted_into_the_queue_and_deduplicated() {
        let storage = std::sync::Arc::new(MemoryStorage::new());
        let queue = Arc::new(RequestQueue::open(storage.clone(), "q", fast_queue_config()).await.unwrap());
        let list = Arc::new(
            RequestList::open(
                storage,
                "lists",
                None,
                vec![RequestInput::new("https://shared.example"), RequestInput::new("https://only-list.example")],
            )
            .await
            .unwrap(),
        );

        // Simulate the same URL already having been enqueued (and handled)
        // directly through the queue before the list ever offers it.
        let direct = queue.add_request(RequestInput::new("https://shared.example"), false).await.unwrap();
        let leased = queue.fetch_next_request().await.unwrap().unwrap();
        assert_eq!(leased.id(), direct.id);
        queue.mark_request_handled(leased).await.unwrap();

        let navigation = Arc::new(MockNavigationHandler::new());
        navigation.set_default_status(200);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_for_handler = seen.clone();
        let handler: RequestHandlerFn<std::sync::Arc<MemoryStorage>> = Arc::new(move |ctx| {
            let seen = seen_for_handler.clone();
            Box::pin(async move {
                seen.lock().push(ctx.request.url.clone());
                Ok(())
            }) as BoxFuture<'static, Result<()>>
        });

        let crawler = Arc::new(Crawler::new(queue, navigation, handler, test_config()).with_request_list(list.clone()));
        crawler.run().await.unwrap();

        // The already-handled shared URL must not be processed again; only
        // the list-exclusive URL goes through the handler.
        assert_eq!(seen.lock().clone(), vec!["https://only-list.example".to_string()]);
        assert!(list.is_finished());
    }

    #[tokio::test]
    async fn blocked_status_retires_session_and_never_runs_handler() {
        let storage = MemoryStorage::new();
        let queue = Arc::new(RequestQueue::open(storage, "q", fast_queue_config()).await.unwrap());
        queue
            .add_requests_from_urls(["https://blocked-401.example", "https://blocked-403.example", "https://blocked-429.example"], false)
            .await;

        let navigation = Arc::new(MockNavigationHandler::new());
        navigation.push_status("https://blocked-401.example", 401);
        navigation.push_status("https://blocked-403.example", 403);
        navigation.push_status("https://blocked-429.example", 429);

        let handler_ran = Arc::new(AtomicUsize::new(0));
        let handler_ran_for_handler = handler_ran.clone();
        let handler: RequestHandlerFn<MemoryStorage> = Arc::new(move |_ctx| {
            let handler_ran = handler_ran_for_handler.clone();
            Box::pin(async move {
                handler_ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }) as BoxFuture<'static, Result<()>>
        });

        let failures = Arc::new(Mutex::new(Vec::new()));
        let failures_for_handler = failures.clone();
        let failed_handler: FailedRequestHandlerFn<MemoryStorage> = Arc::new(move |ctx, _err| {
            let failures = failures_for_handler.clone();
            Box::pin(async move {
                failures.lock().push(ctx.request.error_messages.first().cloned().unwrap_or_default());
                Ok(())
            }) as BoxFuture<'static, Result<()>>
        });

        let mut config = test_config();
        config.retry.max_request_retries = 0;
        let events = EventBus::default();
        let mut retired_events = events.subscribe();
        let sessions = Arc::new(SessionPool::new(crate::session::SessionPoolConfig::default(), events.clone()));

        let crawler = Arc::new(
            Crawler::new(queue, navigation, handler, config)
                .with_sessions(sessions.clone())
                .with_events(events)
                .with_failed_request_handler(failed_handler),
        );
        crawler.run().await.unwrap();

        assert_eq!(handler_ran.load(Ordering::SeqCst), 0);
        assert_eq!(crawler.statistics().requests_failed(), 3);
        let messages = failures.lock().clone();
        assert_eq!(messages.len(), 3);
        for status in ["401", "403", "429"] {
            assert!(
                messages.iter().any(|m| m.contains(&format!("received {status} status code"))),
                "expected a blocked message mentioning status {status}, got {messages:?}"
            );
        }

        // Eviction (and its `SessionRetired` event) happens lazily on the
        // next `get_session()` call; force it so the last blocked
        // request's retirement is observable too.
        let _ = sessions.get_session();

        let mut retired_count = 0;
        while let Ok(event) = retired_events.try_recv() {
            if matches!(event, CrawlerEvent::SessionRetired(_)) {
                retired_count += 1;
            }
        }
        assert!(retired_count >= 3, "expected at least 3 retired-session events, got {retired_count}");
    }

    #[tokio::test]
    async fn forefront_insertion_runs_ahead_of_already_queued_requests() {
        // Single-worker pool so handling order is deterministic: enqueue A,
        // B; while handling A, enqueue C with forefront=true. Expected
        // order: A, C, B.
        let storage = MemoryStorage::new();
        let queue = Arc::new(RequestQueue::open(storage, "q", fast_queue_config()).await.unwrap());
        queue.add_request(RequestInput::new("https://a.example"), false).await.unwrap();
        queue.add_request(RequestInput::new("https://b.example"), false).await.unwrap();

        let navigation = Arc::new(MockNavigationHandler::new());
        navigation.set_default_status(200);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_for_handler = seen.clone();
        let handler: RequestHandlerFn<MemoryStorage> = Arc::new(move |ctx| {
            let seen = seen_for_handler.clone();
            Box::pin(async move {
                if ctx.request.url == "https://a.example" {
                    ctx.enqueue_links(["https://c.example"], true).await;
                }
                seen.lock().push(ctx.request.url.clone());
                Ok(())
            }) as BoxFuture<'static, Result<()>>
        });

        let mut config = test_config();
        config.pool.initial_concurrency = 1;
        config.pool.max_concurrency = 1;
        config.pool.min_concurrency = 1;

        let crawler = Arc::new(Crawler::new(queue, navigation, handler, config));
        crawler.run().await.unwrap();

        assert_eq!(
            seen.lock().clone(),
            vec!["https://a.example".to_string(), "https://c.example".to_string(), "https://b.example".to_string()]
        );
    }
}
