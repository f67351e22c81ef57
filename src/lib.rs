//! Scheduling, request-lifecycle and concurrency-control core for a web
//! crawling framework: a persistent deduplicated request queue, an optional
//! frozen request list, a session pool, resource-aware autoscaling, and the
//! per-request state machine gluing them into a runnable crawler.
//!
//! Fetching (`NavigationHandler`) and result storage (`Storage`) are
//! pluggable; this crate owns scheduling and lifecycle, not how bytes are
//! fetched off the wire or where they ultimately live.

pub mod autoscaled_pool;
pub mod config;
pub mod crawler;
pub mod error;
pub mod events;
pub mod navigation;
pub mod request;
pub mod request_list;
pub mod request_queue;
pub mod session;
pub mod snapshotter;
pub mod statistics;
pub mod storage;
pub mod system_status;

pub use autoscaled_pool::{AutoscaledPool, AutoscaledPoolConfig};
pub use config::Configuration;
pub use crawler::{Crawler, CrawlerConfig, FailedRequestHandlerFn, RequestHandlerFn};
pub use error::{CrawlError, Result};
pub use events::{CrawlerEvent, EventBus};
pub use navigation::{CrawlingContext, Hook, NavigationHandler, Response};
#[cfg(feature = "reqwest-navigation")]
pub use navigation::ReqwestNavigationHandler;
pub use request::transitions::RetryConfig;
pub use request::{Handled, InProgress, Method, Pending, Request, RequestData, RequestId, RequestInput, RequestState};
pub use request_list::RequestList;
pub use request_queue::{RequestQueue, RequestQueueConfig};
pub use session::{Session, SessionId, SessionPool, SessionPoolConfig};
pub use snapshotter::{Snapshotter, SnapshotterConfig};
pub use statistics::{Statistics, StatisticsSummary};
pub use storage::{
    AddRequestResult, DatasetId, EntityMetadata, KeyValueRecord, KeyValueStoreId, ListHeadResult,
    ListItemsOptions, ListKeysOptions, QueueId, Storage,
};
pub use system_status::{SystemSnapshot, SystemStatus, SystemStatusConfig};
