//! The unit of work driven through the crawler (spec.md §3 "Request").
//!
//! `Request<S>` is typestate-parameterized over its lifecycle position —
//! `Pending`, `InProgress`, `Handled` — the same shape
//! `fusillade::request::Request<State>` uses for its own (finer-grained)
//! `Pending`/`Claimed`/`Processing`/`Completed`/`Failed`/`Canceled` states.
//! Shared, state-independent fields live on [`RequestData`]; fields that
//! only make sense in one state live on the state marker struct, exactly as
//! `fusillade` splits e.g. `claimed_at` out of its shared request payload.

pub mod transitions;

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{CrawlError, Result};

/// Unique identifier assigned to a request by the queue on first insert.
/// Stable once assigned (spec.md §3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        RequestId(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        RequestId(uuid)
    }
}

impl std::ops::Deref for RequestId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// HTTP-ish method of a request. The core never performs the fetch itself
/// (that's the `NavigationHandler`'s job) but needs the method to compute
/// `uniqueKey` and to reject GET requests constructed with a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    fn allows_payload(self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        };
        write!(f, "{s}")
    }
}

/// Marker trait for request lifecycle states, mirroring
/// `fusillade::request::RequestState`. Implemented only by the state
/// structs in this module; used as a bound on `Storage::persist`.
pub trait RequestState: Send + Sync + Clone + fmt::Debug {}

/// The request is eligible to be leased by a worker. `not_before` (set on
/// reclaim-with-backoff) delays eligibility until a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pending {
    pub not_before: Option<DateTime<Utc>>,
}
impl RequestState for Pending {}

/// The request has been leased to a worker and is being fetched/handled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InProgress {
    pub leased_at: DateTime<Utc>,
}
impl RequestState for InProgress {}

/// Terminal: the request was either handled successfully or given up on
/// after exhausting retries. `succeeded` distinguishes the two for
/// statistics purposes; the data model otherwise does not distinguish
/// them (spec.md §3: "once handledAt is set the request is terminal").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handled {
    pub handled_at: DateTime<Utc>,
    pub succeeded: bool,
}
impl RequestState for Handled {}

/// Fields shared across every lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestData {
    pub id: RequestId,
    pub unique_key: String,
    pub url: String,
    pub loaded_url: Option<String>,
    pub method: Method,
    pub payload: Option<String>,
    pub headers: HashMap<String, String>,
    pub user_data: serde_json::Value,
    pub retry_count: u32,
    pub no_retry: bool,
    pub error_messages: Vec<String>,
}

impl RequestData {
    /// The `label` routing tag convention (spec.md §3 "userData may carry
    /// a label routing tag").
    pub fn label(&self) -> Option<&str> {
        self.user_data.get("label").and_then(|v| v.as_str())
    }
}

/// A request at a specific point in its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request<S: RequestState> {
    pub data: RequestData,
    pub state: S,
}

impl<S: RequestState> Request<S> {
    pub fn id(&self) -> RequestId {
        self.data.id
    }

    pub fn unique_key(&self) -> &str {
        &self.data.unique_key
    }
}

/// Builder input for constructing a new [`Request<Pending>`].
#[derive(Debug, Clone, Default)]
pub struct RequestInput {
    pub url: String,
    pub method: Option<Method>,
    pub payload: Option<String>,
    pub headers: HashMap<String, String>,
    pub user_data: Option<serde_json::Value>,
    pub unique_key: Option<String>,
    pub no_retry: bool,
}

impl RequestInput {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Compute the default `uniqueKey`: the normalized URL for GET/HEAD, or the
/// URL + method + a SHA-256 digest of the payload for POST/PUT/PATCH
/// (spec.md §3 and SPEC_FULL.md's resolution of the "optional payload
/// digest" ambiguity: always computed for payload-bearing methods, never
/// for GET/HEAD).
fn default_unique_key(url: &str, method: Method, payload: Option<&str>) -> String {
    let normalized_url = url.trim_end_matches('/');
    if !method.allows_payload() {
        return normalized_url.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(payload.unwrap_or_default().as_bytes());
    let digest = hasher.finalize();
    format!("{method}:{normalized_url}:{digest:x}")
}

impl Request<Pending> {
    /// Construct a new request in the `Pending` state. The queue assigns
    /// `id` on insert; this constructor assigns a fresh id up front so the
    /// caller can reference it before enqueueing, and the queue overwrites
    /// it only if the record already existed under the same `uniqueKey`.
    ///
    /// Rejects a GET/HEAD request constructed with a non-empty payload
    /// (spec.md §8 "boundary behaviors"), and rejects `userData` that does
    /// not round-trip through JSON (SPEC_FULL.md's resolution of the
    /// `maybeStringify`/`undefined` open question: reject up front rather
    /// than silently dropping fields).
    pub fn new(input: RequestInput) -> Result<Self> {
        let method = input.method.unwrap_or(Method::Get);

        if !method.allows_payload() && input.payload.as_deref().is_some_and(|p| !p.is_empty()) {
            return Err(CrawlError::Validation(format!(
                "{method} requests may not carry a payload"
            )));
        }

        let user_data = input.user_data.unwrap_or(serde_json::Value::Null);
        if !user_data.is_null() {
            serde_json::to_vec(&user_data).map_err(|e| {
                CrawlError::Validation(format!("userData is not serializable: {e}"))
            })?;
        }

        let unique_key = input
            .unique_key
            .unwrap_or_else(|| default_unique_key(&input.url, method, input.payload.as_deref()));

        Ok(Request {
            data: RequestData {
                id: RequestId::new(),
                unique_key,
                url: input.url,
                loaded_url: None,
                method,
                payload: input.payload,
                headers: input.headers,
                user_data,
                retry_count: 0,
                no_retry: input.no_retry,
                error_messages: Vec::new(),
            },
            state: Pending { not_before: None },
        })
    }
}

/// A request in any lifecycle state, for call sites that operate
/// uniformly over heterogeneous records (mirrors `fusillade::AnyRequest`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AnyRequest {
    Pending(Request<Pending>),
    InProgress(Request<InProgress>),
    Handled(Request<Handled>),
}

impl AnyRequest {
    pub fn id(&self) -> RequestId {
        match self {
            AnyRequest::Pending(r) => r.id(),
            AnyRequest::InProgress(r) => r.id(),
            AnyRequest::Handled(r) => r.id(),
        }
    }

    pub fn data(&self) -> &RequestData {
        match self {
            AnyRequest::Pending(r) => &r.data,
            AnyRequest::InProgress(r) => &r.data,
            AnyRequest::Handled(r) => &r.data,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AnyRequest::Handled(_))
    }
}

impl From<Request<Pending>> for AnyRequest {
    fn from(r: Request<Pending>) -> Self {
        AnyRequest::Pending(r)
    }
}
impl From<Request<InProgress>> for AnyRequest {
    fn from(r: Request<InProgress>) -> Self {
        AnyRequest::InProgress(r)
    }
}
impl From<Request<Handled>> for AnyRequest {
    fn from(r: Request<Handled>) -> Self {
        AnyRequest::Handled(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_with_payload_is_rejected() {
        let input = RequestInput {
            payload: Some("body".into()),
            ..RequestInput::new("https://example.com")
        };
        let err = Request::new(input).unwrap_err();
        assert!(matches!(err, CrawlError::Validation(_)));
    }

    #[test]
    fn identical_get_urls_share_unique_key() {
        let a = Request::new(RequestInput::new("https://example.com/page")).unwrap();
        let b = Request::new(RequestInput::new("https://example.com/page/")).unwrap();
        assert_eq!(a.unique_key(), b.unique_key());
    }

    #[test]
    fn post_unique_key_depends_on_payload() {
        let a = Request::new(RequestInput {
            method: Some(Method::Post),
            payload: Some("a".into()),
            ..RequestInput::new("https://example.com/api")
        })
        .unwrap();
        let b = Request::new(RequestInput {
            method: Some(Method::Post),
            payload: Some("b".into()),
            ..RequestInput::new("https://example.com/api")
        })
        .unwrap();
        assert_ne!(a.unique_key(), b.unique_key());
    }

    #[test]
    fn label_reads_from_user_data() {
        let input = RequestInput {
            user_data: Some(serde_json::json!({"label": "detail"})),
            ..RequestInput::new("https://example.com")
        };
        let req = Request::new(input).unwrap();
        assert_eq!(req.data.label(), Some("detail"));
    }
}
