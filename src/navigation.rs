//! The pluggable fetch strategy (spec.md §1 "the core treats fetching as a
//! pluggable `NavigationHandler`") and the per-request context handed to
//! hooks and the user's request handler (spec.md §4.7 step 3).
//!
//! `NavigationHandler` plays the role `fusillade::http::HttpClient` plays for
//! HTTP in the teacher: a single-method `async_trait`, swappable, mockable.
//! Besides [`MockNavigationHandler`] (for tests), the `reqwest-navigation`
//! feature ships [`ReqwestNavigationHandler`], a plain-HTTP implementation —
//! a headless-browser-backed handler is still left to the caller, but a
//! bring-your-own-fetcher crate with no working default would be unusable
//! out of the box.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::error::{CrawlError, Result};
use crate::request::{RequestData, RequestId};
use crate::session::Session;
use crate::storage::{AddRequestResult, Storage};

/// The result of navigating to a request's URL. Abstract: the core never
/// interprets the body, it only inspects `status` to decide whether to
/// retire the session and raise a `BlockedError` (spec.md §4.7 step 5).
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }
}

/// The abstract fetch strategy (spec.md §1, §4.7 step 5). Implementations
/// are out of scope for this crate — a headless browser, an HTTP client, or
/// (in tests) a scripted mock all satisfy this trait identically.
#[async_trait]
pub trait NavigationHandler: Send + Sync {
    async fn navigate(&self, request: &RequestData, session: Option<&Session>) -> Result<Response>;
}

/// The immutable-ish bag passed through pre-navigation hooks, the
/// `NavigationHandler`, post-navigation hooks, and the request handler
/// (spec.md §4.7 step 3: "an immutable bag `{id, request, session?,
/// proxyInfo?, sendRequest, enqueueLinks, handlerLog}`").
///
/// `response` starts `None` and is populated by the crawler after step 5;
/// hooks registered before navigation never see it, hooks registered after
/// always do.
pub struct CrawlingContext<S: Storage> {
    pub id: RequestId,
    pub request: RequestData,
    pub session: Option<Arc<Session>>,
    pub response: Option<Response>,
    queue: Arc<crate::request_queue::RequestQueue<S>>,
}

impl<S: Storage> CrawlingContext<S> {
    pub(crate) fn new(
        id: RequestId,
        request: RequestData,
        session: Option<Arc<Session>>,
        queue: Arc<crate::request_queue::RequestQueue<S>>,
    ) -> Self {
        Self {
            id,
            request,
            session,
            response: None,
            queue,
        }
    }

    /// The thin `add`-adapter named in spec.md §1 ("link-extraction /
    /// enqueue-links helper — a thin adapter over the queue's `add`
    /// operation"). This crate does not parse HTML; a handler that extracts
    /// links itself calls this with the URLs it found.
    pub async fn enqueue_links(
        &self,
        urls: impl IntoIterator<Item = impl Into<String>> + Send,
        forefront: bool,
    ) -> (Vec<AddRequestResult>, Vec<crate::request::RequestInput>) {
        self.queue.add_requests_from_urls(urls, forefront).await
    }
}

/// A pre- or post-navigation hook (spec.md §4.7 steps 4 and 6: "run
/// sequentially in registration order").
pub type Hook<S> =
    Arc<dyn Fn(&mut CrawlingContext<S>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Scripted [`NavigationHandler`] for tests, mirroring the shape of
/// `fusillade`'s own `MockHttpClient` (a FIFO of canned responses per key,
/// with a call log for assertions) — not present in this crate's retrieval
/// pack, so reconstructed here from its usage in `daemon::mod.rs`'s tests.
#[derive(Default)]
pub struct MockNavigationHandler {
    responses: Mutex<HashMap<String, VecDeque<Result<Response>>>>,
    default_response: Mutex<Option<Response>>,
    calls: Mutex<Vec<String>>,
}

impl MockNavigationHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the given URL; repeated calls for the same URL
    /// queue multiple responses, consumed FIFO.
    pub fn push_response(&self, url: impl Into<String>, response: Result<Response>) {
        self.responses
            .lock()
            .entry(url.into())
            .or_default()
            .push_back(response);
    }

    pub fn push_status(&self, url: impl Into<String>, status: u16) {
        self.push_response(url, Ok(Response::new(status)));
    }

    /// A response returned for any URL with no scripted queue of its own.
    pub fn set_default_status(&self, status: u16) {
        *self.default_response.lock() = Some(Response::new(status));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl NavigationHandler for MockNavigationHandler {
    async fn navigate(&self, request: &RequestData, _session: Option<&Session>) -> Result<Response> {
        self.calls.lock().push(request.url.clone());

        if let Some(queue) = self.responses.lock().get_mut(&request.url) {
            if let Some(response) = queue.pop_front() {
                return response;
            }
        }
        if let Some(response) = self.default_response.lock().clone() {
            return Ok(response);
        }
        Err(CrawlError::Navigation {
            url: request.url.clone(),
            message: "no scripted response for this url".into(),
        })
    }
}

/// Always returns a bare `200` with no body. Used where a test wants the
/// navigation step to be a no-op and only cares about the request handler.
pub struct NoopNavigationHandler;

#[async_trait]
impl NavigationHandler for NoopNavigationHandler {
    async fn navigate(&self, _request: &RequestData, _session: Option<&Session>) -> Result<Response> {
        Ok(Response::new(200))
    }
}

/// Plain-HTTP [`NavigationHandler`] built on `reqwest` (feature
/// `reqwest-navigation`, enabled by default). Sends the request's method,
/// headers and payload, seeds the outgoing request with whatever cookies
/// the session has accumulated, and folds any `Set-Cookie` response headers
/// back into the session before returning.
///
/// Grounded on `fusillade::http::HttpClient`'s own `reqwest::Client`
/// wrapper: one shared client reused across calls (connection pooling),
/// errors folded into the crate's own error type rather than leaking
/// `reqwest::Error` to callers.
#[cfg(feature = "reqwest-navigation")]
pub struct ReqwestNavigationHandler {
    client: reqwest::Client,
}

#[cfg(feature = "reqwest-navigation")]
impl ReqwestNavigationHandler {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| CrawlError::Navigation {
                url: String::new(),
                message: format!("failed to build http client: {e}"),
            })?;
        Ok(Self { client })
    }

    fn method(method: crate::request::Method) -> reqwest::Method {
        use crate::request::Method::*;
        match method {
            Get => reqwest::Method::GET,
            Head => reqwest::Method::HEAD,
            Post => reqwest::Method::POST,
            Put => reqwest::Method::PUT,
            Patch => reqwest::Method::PATCH,
            Delete => reqwest::Method::DELETE,
        }
    }
}

#[cfg(feature = "reqwest-navigation")]
impl Default for ReqwestNavigationHandler {
    fn default() -> Self {
        Self::new().expect("default reqwest client configuration is always valid")
    }
}

#[cfg(feature = "reqwest-navigation")]
#[async_trait]
impl NavigationHandler for ReqwestNavigationHandler {
    async fn navigate(&self, request: &RequestData, session: Option<&Session>) -> Result<Response> {
        let mut builder = self.client.request(Self::method(request.method), &request.url);

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        if let Some(session) = session {
            let cookies = session.cookies();
            if !cookies.is_empty() {
                let cookie_header = cookies
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                builder = builder.header(reqwest::header::COOKIE, cookie_header);
            }
        }

        if let Some(payload) = &request.payload {
            builder = builder.body(payload.clone());
        }

        let response = builder.send().await.map_err(|e| CrawlError::Navigation {
            url: request.url.clone(),
            message: e.to_string(),
        })?;

        let status = response.status().as_u16();

        if let Some(session) = session {
            for cookie in response.cookies() {
                session.set_cookie(cookie.name().to_string(), cookie.value().to_string());
            }
        }

        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|v| (name.to_string(), v.to_string()))
            })
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| CrawlError::Navigation {
                url: request.url.clone(),
                message: format!("failed to read response body: {e}"),
            })?
            .to_vec();

        Ok(Response { status, headers, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(url: &str) -> RequestData {
        crate::request::Request::new(crate::request::RequestInput::new(url))
            .unwrap()
            .data
    }

    #[tokio::test]
    async fn mock_returns_scripted_responses_in_order() {
        let mock = MockNavigationHandler::new();
        mock.push_status("https://example.com", 200);
        mock.push_status("https://example.com", 429);

        let data = req("https://example.com");
        assert_eq!(mock.navigate(&data, None).await.unwrap().status, 200);
        assert_eq!(mock.navigate(&data, None).await.unwrap().status, 429);
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn mock_errors_with_no_scripted_response() {
        let mock = MockNavigationHandler::new();
        let data = req("https://example.com/unscripted");
        assert!(mock.navigate(&data, None).await.is_err());
    }

    #[tokio::test]
    async fn noop_always_returns_200() {
        let data = req("https://example.com");
        let response = NoopNavigationHandler.navigate(&data, None).await.unwrap();
        assert_eq!(response.status, 200);
    }
}
