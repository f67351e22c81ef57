//! The persistent storage abstraction (spec.md §6): typed CRUD for the
//! three entity kinds the core relies on — request queues, key-value
//! stores, and datasets.
//!
//! Shaped after `fusillade::manager::Storage`: one `async_trait` with
//! methods keyed by id/name rather than returned "handle" objects, which
//! keeps implementations trait-object-friendly and avoids a second layer
//! of boxed handles for what is, underneath, still just CRUD against three
//! tables.

pub mod local;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::request::{AnyRequest, Pending, Request, RequestId};

macro_rules! entity_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                $name(uuid)
            }
        }

        impl std::ops::Deref for $name {
            type Target = Uuid;
            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", &self.0.to_string()[..8])
            }
        }
    };
}

entity_id!(DatasetId);
entity_id!(KeyValueStoreId);
entity_id!(QueueId);

/// Metadata common to any stored entity (spec.md §6 on-disk layout:
/// "`*/<id>/__metadata__.json` entity metadata").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A key-value record: an opaque byte payload plus the content type it was
/// stored with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValueRecord {
    pub key: String,
    pub value: Vec<u8>,
    pub content_type: String,
}

/// Options for `list_dataset_items`.
#[derive(Debug, Clone, Default)]
pub struct ListItemsOptions {
    pub offset: usize,
    pub limit: Option<usize>,
    pub desc: bool,
}

/// Options for `list_keys`, supporting exclusive-start-key pagination
/// (spec.md §6).
#[derive(Debug, Clone, Default)]
pub struct ListKeysOptions {
    pub exclusive_start_key: Option<String>,
    pub limit: Option<usize>,
}

/// Result of `add_request`: whether the record already existed, and
/// whether it was already handled (spec.md §4.2).
#[derive(Debug, Clone, Copy)]
pub struct AddRequestResult {
    pub id: RequestId,
    pub was_already_present: bool,
    pub was_already_handled: bool,
}

/// Result of `list_head` (spec.md §4.2 / §6): the ready-to-fetch ids plus
/// the backend metadata the head-cache algorithm and the `isFinished`
/// consistency barrier need.
#[derive(Debug, Clone)]
pub struct ListHeadResult {
    pub items: Vec<RequestId>,
    pub queue_modified_at: DateTime<Utc>,
    pub had_multiple_clients: bool,
}

/// Typed CRUD for datasets, key-value stores, and request queues.
///
/// Backends MUST (spec.md §6): assign stable ids on first insert; return
/// `was_already_present`/`was_already_handled` truthfully; include
/// `queue_modified_at`/`had_multiple_clients` in `list_head`; tolerate
/// concurrent writers; be safe to restart against.
#[async_trait]
pub trait Storage: Send + Sync {
    // -- Datasets ---------------------------------------------------
    async fn get_or_create_dataset(&self, name: &str) -> Result<DatasetId>;
    async fn list_datasets(&self) -> Result<Vec<EntityMetadata>>;
    async fn push_dataset_items(&self, id: DatasetId, items: Vec<serde_json::Value>) -> Result<()>;
    async fn list_dataset_items(
        &self,
        id: DatasetId,
        options: ListItemsOptions,
    ) -> Result<Vec<serde_json::Value>>;
    async fn get_dataset(&self, id: DatasetId) -> Result<EntityMetadata>;
    async fn delete_dataset(&self, id: DatasetId) -> Result<()>;

    // -- Key-value stores --------------------------------------------
    async fn get_or_create_key_value_store(&self, name: &str) -> Result<KeyValueStoreId>;
    async fn list_key_value_stores(&self) -> Result<Vec<EntityMetadata>>;
    async fn get_record(
        &self,
        store: KeyValueStoreId,
        key: &str,
    ) -> Result<Option<KeyValueRecord>>;
    async fn set_record(&self, store: KeyValueStoreId, record: KeyValueRecord) -> Result<()>;
    async fn delete_record(&self, store: KeyValueStoreId, key: &str) -> Result<()>;
    async fn list_keys(
        &self,
        store: KeyValueStoreId,
        options: ListKeysOptions,
    ) -> Result<Vec<String>>;
    async fn get_key_value_store(&self, store: KeyValueStoreId) -> Result<EntityMetadata>;
    async fn delete_key_value_store(&self, store: KeyValueStoreId) -> Result<()>;

    // -- Request queues ------------------------------------------------
    async fn get_or_create_request_queue(&self, name: &str) -> Result<QueueId>;
    async fn list_request_queues(&self) -> Result<Vec<EntityMetadata>>;

    /// Idempotent w.r.t. `uniqueKey` (spec.md §4.2). `forefront` is a hint:
    /// it affects only where the id lands in whatever ready-set ordering
    /// the backend maintains.
    async fn add_request(
        &self,
        queue: QueueId,
        request: Request<Pending>,
        forefront: bool,
    ) -> Result<AddRequestResult>;

    async fn get_request(&self, queue: QueueId, id: RequestId) -> Result<Option<AnyRequest>>;

    /// Persist a request's new state. `forefront` only matters when the
    /// new state is `Pending` (a reclaim); it is ignored otherwise.
    async fn update_request(
        &self,
        queue: QueueId,
        request: AnyRequest,
        forefront: bool,
    ) -> Result<()>;

    /// Backend-side "give me up to `limit` ready ids" query (spec.md §4.2
    /// head-cache algorithm step 2). Must exclude ids already `in-progress`
    /// or already handled.
    async fn list_head(&self, queue: QueueId, limit: usize) -> Result<ListHeadResult>;

    async fn handled_count(&self, queue: QueueId) -> Result<u64>;
    async fn get_request_queue(&self, queue: QueueId) -> Result<EntityMetadata>;
    async fn delete_request_queue(&self, queue: QueueId) -> Result<()>;
}

/// Delegating impl so a backend can be shared across several front-ends
/// (a [`crate::request_list::RequestList`] and a
/// [`crate::request_queue::RequestQueue`] over the same on-disk store, say)
/// by wrapping it once in an `Arc` rather than requiring `Clone`.
#[async_trait]
impl<T: Storage + ?Sized> Storage for std::sync::Arc<T> {
    async fn get_or_create_dataset(&self, name: &str) -> Result<DatasetId> {
        (**self).get_or_create_dataset(name).await
    }
    async fn list_datasets(&self) -> Result<Vec<EntityMetadata>> {
        (**self).list_datasets().await
    }
    async fn push_dataset_items(&self, id: DatasetId, items: Vec<serde_json::Value>) -> Result<()> {
        (**self).push_dataset_items(id, items).await
    }
    async fn list_dataset_items(
        &self,
        id: DatasetId,
        options: ListItemsOptions,
    ) -> Result<Vec<serde_json::Value>> {
        (**self).list_dataset_items(id, options).await
    }
    async fn get_dataset(&self, id: DatasetId) -> Result<EntityMetadata> {
        (**self).get_dataset(id).await
    }
    async fn delete_dataset(&self, id: DatasetId) -> Result<()> {
        (**self).delete_dataset(id).await
    }

    async fn get_or_create_key_value_store(&self, name: &str) -> Result<KeyValueStoreId> {
        (**self).get_or_create_key_value_store(name).await
    }
    async fn list_key_value_stores(&self) -> Result<Vec<EntityMetadata>> {
        (**self).list_key_value_stores().await
    }
    async fn get_record(&self, store: KeyValueStoreId, key: &str) -> Result<Option<KeyValueRecord>> {
        (**self).get_record(store, key).await
    }
    async fn set_record(&self, store: KeyValueStoreId, record: KeyValueRecord) -> Result<()> {
        (**self).set_record(store, record).await
    }
    async fn delete_record(&self, store: KeyValueStoreId, key: &str) -> Result<()> {
        (**self).delete_record(store, key).await
    }
    async fn list_keys(&self, store: KeyValueStoreId, options: ListKeysOptions) -> Result<Vec<String>> {
        (**self).list_keys(store, options).await
    }
    async fn get_key_value_store(&self, store: KeyValueStoreId) -> Result<EntityMetadata> {
        (**self).get_key_value_store(store).await
    }
    async fn delete_key_value_store(&self, store: KeyValueStoreId) -> Result<()> {
        (**self).delete_key_value_store(store).await
    }

    async fn get_or_create_request_queue(&self, name: &str) -> Result<QueueId> {
        (**self).get_or_create_request_queue(name).await
    }
    async fn list_request_queues(&self) -> Result<Vec<EntityMetadata>> {
        (**self).list_request_queues().await
    }
    async fn add_request(&self, queue: QueueId, request: Request<Pending>, forefront: bool) -> Result<AddRequestResult> {
        (**self).add_request(queue, request, forefront).await
    }
    async fn get_request(&self, queue: QueueId, id: RequestId) -> Result<Option<AnyRequest>> {
        (**self).get_request(queue, id).await
    }
    async fn update_request(&self, queue: QueueId, request: AnyRequest, forefront: bool) -> Result<()> {
        (**self).update_request(queue, request, forefront).await
    }
    async fn list_head(&self, queue: QueueId, limit: usize) -> Result<ListHeadResult> {
        (**self).list_head(queue, limit).await
    }
    async fn handled_count(&self, queue: QueueId) -> Result<u64> {
        (**self).handled_count(queue).await
    }
    async fn get_request_queue(&self, queue: QueueId) -> Result<EntityMetadata> {
        (**self).get_request_queue(queue).await
    }
    async fn delete_request_queue(&self, queue: QueueId) -> Result<()> {
        (**self).delete_request_queue(queue).await
    }
}
