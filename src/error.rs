//! Crate-wide error taxonomy and `Result` alias.
//!
//! The variants map 1:1 onto the error categories of the request-lifecycle
//! design: validation failures never retry, transient backend errors are
//! retried by the bounded-timeout wrapper, navigation/blocked/handler errors
//! count against a request's retry budget, and fatal errors stop the
//! crawler outright.

use crate::request::RequestId;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CrawlError>;

#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    /// Bad input to a public operation. Never retried; surfaces synchronously.
    #[error("validation error: {0}")]
    Validation(String),

    /// Storage timeout or lost response. Retried by the bounded-timeout
    /// wrapper up to a fixed number of attempts before surfacing.
    #[error("transient backend error: {0}")]
    TransientBackend(String),

    /// The fetch layer failed (timeout, network, non-2xx the handler
    /// considers fatal). Counts against a request's retry budget.
    #[error("navigation error for {url}: {message}")]
    Navigation { url: String, message: String },

    /// Response status was in the configured blocked set. Counts against
    /// a request's retry budget and retires the session that received it.
    #[error("request blocked - received {status} status code")]
    Blocked { status: u16 },

    /// The user-supplied request handler threw. Counts against a
    /// request's retry budget.
    #[error("request handler error: {0}")]
    Handler(String),

    /// Unrecoverable state: storage corruption, or the error-handler
    /// itself threw. The crawler stops and `run()` rejects.
    #[error("fatal crawler error: {0}")]
    Fatal(String),

    /// A `persistState()` call with no name configured, or a persist that
    /// otherwise cannot complete.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A request operation referenced an id not tracked by the queue
    /// (e.g. `markRequestHandled` on an id not in `in-progress`).
    #[error("request {0} not found")]
    RequestNotFound(RequestId),

    /// A request operation found the record in the wrong state for the
    /// requested transition.
    #[error("request {0} is in state '{1}', expected '{2}'")]
    InvalidState(RequestId, String, String),

    /// Suspension point exceeded its bounded wait and exhausted internal
    /// retries (§5 "every suspension point is wrapped in a bounded wait").
    #[error("operation timed out after {0}ms")]
    TimedOut(u32),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CrawlError {
    /// True for the categories that should count against a request's
    /// retry budget (Navigation, Blocked, Handler) rather than being
    /// retried transparently by an internal bounded wrapper.
    pub fn counts_as_request_failure(&self) -> bool {
        matches!(
            self,
            CrawlError::Navigation { .. } | CrawlError::Blocked { .. } | CrawlError::Handler(_)
        )
    }
}
