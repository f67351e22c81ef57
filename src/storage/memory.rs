//! Pure in-memory [`Storage`] implementation.
//!
//! Used as the zero-config default and throughout the test suite. Mirrors
//! the concurrent-map usage `fusillade`'s `Cargo.toml` already declares
//! (`dashmap`) but that its retrieved sources don't exercise directly —
//! here it backs all three entity kinds.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{CrawlError, Result};
use crate::request::{AnyRequest, Pending, Request, RequestId};

use super::{
    AddRequestResult, DatasetId, EntityMetadata, KeyValueRecord, KeyValueStoreId,
    ListHeadResult, ListItemsOptions, ListKeysOptions, QueueId, Storage,
};

struct DatasetEntry {
    metadata: EntityMetadata,
    items: Vec<serde_json::Value>,
}

struct KeyValueStoreEntry {
    metadata: EntityMetadata,
    records: HashMap<String, KeyValueRecord>,
}

struct QueueEntry {
    metadata: EntityMetadata,
    records: HashMap<RequestId, AnyRequest>,
    unique_keys: HashMap<String, RequestId>,
    order: VecDeque<RequestId>,
    modified_at: chrono::DateTime<Utc>,
}

impl QueueEntry {
    fn new(metadata: EntityMetadata) -> Self {
        Self {
            metadata,
            records: HashMap::new(),
            unique_keys: HashMap::new(),
            order: VecDeque::new(),
            modified_at: Utc::now(),
        }
    }
}

/// In-memory backend. Cheap to clone (an `Arc` internally via `DashMap`'s
/// own sharding is not exposed; wrap in `Arc<MemoryStorage>` at the call
/// site, the same way every `Storage` consumer in this crate does).
#[derive(Default)]
pub struct MemoryStorage {
    datasets: DashMap<DatasetId, Mutex<DatasetEntry>>,
    dataset_names: DashMap<String, DatasetId>,
    kv_stores: DashMap<KeyValueStoreId, Mutex<KeyValueStoreEntry>>,
    kv_store_names: DashMap<String, KeyValueStoreId>,
    queues: DashMap<QueueId, Mutex<QueueEntry>>,
    queue_names: DashMap<String, QueueId>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(kind: &str, id: Uuid) -> CrawlError {
    CrawlError::Persistence(format!("{kind} {id} not found"))
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_or_create_dataset(&self, name: &str) -> Result<DatasetId> {
        if let Some(id) = self.dataset_names.get(name) {
            return Ok(*id);
        }
        let id = DatasetId(Uuid::new_v4());
        self.datasets.insert(
            id,
            Mutex::new(DatasetEntry {
                metadata: EntityMetadata {
                    id: *id,
                    name: name.to_string(),
                    created_at: Utc::now(),
                },
                items: Vec::new(),
            }),
        );
        self.dataset_names.insert(name.to_string(), id);
        Ok(id)
    }

    async fn list_datasets(&self) -> Result<Vec<EntityMetadata>> {
        Ok(self
            .datasets
            .iter()
            .map(|entry| entry.value().lock().metadata.clone())
            .collect())
    }

    async fn push_dataset_items(&self, id: DatasetId, items: Vec<serde_json::Value>) -> Result<()> {
        let entry = self.datasets.get(&id).ok_or_else(|| not_found("dataset", *id))?;
        entry.lock().items.extend(items);
        Ok(())
    }

    async fn list_dataset_items(
        &self,
        id: DatasetId,
        options: ListItemsOptions,
    ) -> Result<Vec<serde_json::Value>> {
        let entry = self.datasets.get(&id).ok_or_else(|| not_found("dataset", *id))?;
        let items = &entry.lock().items;
        let mut slice: Vec<_> = items.iter().cloned().collect();
        if options.desc {
            slice.reverse();
        }
        let end = options
            .limit
            .map(|limit| (options.offset + limit).min(slice.len()))
            .unwrap_or(slice.len());
        let start = options.offset.min(slice.len());
        Ok(slice[start..end].to_vec())
    }

    async fn get_dataset(&self, id: DatasetId) -> Result<EntityMetadata> {
        let entry = self.datasets.get(&id).ok_or_else(|| not_found("dataset", *id))?;
        Ok(entry.lock().metadata.clone())
    }

    async fn delete_dataset(&self, id: DatasetId) -> Result<()> {
        self.datasets.remove(&id);
        Ok(())
    }

    async fn get_or_create_key_value_store(&self, name: &str) -> Result<KeyValueStoreId> {
        if let Some(id) = self.kv_store_names.get(name) {
            return Ok(*id);
        }
        let id = KeyValueStoreId(Uuid::new_v4());
        self.kv_stores.insert(
            id,
            Mutex::new(KeyValueStoreEntry {
                metadata: EntityMetadata {
                    id: *id,
                    name: name.to_string(),
                    created_at: Utc::now(),
                },
                records: HashMap::new(),
            }),
        );
        self.kv_store_names.insert(name.to_string(), id);
        Ok(id)
    }

    async fn list_key_value_stores(&self) -> Result<Vec<EntityMetadata>> {
        Ok(self
            .kv_stores
            .iter()
            .map(|entry| entry.value().lock().metadata.clone())
            .collect())
    }

    async fn get_record(
        &self,
        store: KeyValueStoreId,
        key: &str,
    ) -> Result<Option<KeyValueRecord>> {
        let entry = self
            .kv_stores
            .get(&store)
            .ok_or_else(|| not_found("key-value store", *store))?;
        Ok(entry.lock().records.get(key).cloned())
    }

    async fn set_record(&self, store: KeyValueStoreId, record: KeyValueRecord) -> Result<()> {
        let entry = self
            .kv_stores
            .get(&store)
            .ok_or_else(|| not_found("key-value store", *store))?;
        entry.lock().records.insert(record.key.clone(), record);
        Ok(())
    }

    async fn delete_record(&self, store: KeyValueStoreId, key: &str) -> Result<()> {
        let entry = self
            .kv_stores
            .get(&store)
            .ok_or_else(|| not_found("key-value store", *store))?;
        entry.lock().records.remove(key);
        Ok(())
    }

    async fn list_keys(
        &self,
        store: KeyValueStoreId,
        options: ListKeysOptions,
    ) -> Result<Vec<String>> {
        let entry = self
            .kv_stores
            .get(&store)
            .ok_or_else(|| not_found("key-value store", *store))?;
        let mut keys: Vec<String> = entry.lock().records.keys().cloned().collect();
        keys.sort();
        if let Some(start) = &options.exclusive_start_key {
            keys.retain(|k| k.as_str() > start.as_str());
        }
        if let Some(limit) = options.limit {
            keys.truncate(limit);
        }
        Ok(keys)
    }

    async fn get_key_value_store(&self, store: KeyValueStoreId) -> Result<EntityMetadata> {
        let entry = self
            .kv_stores
            .get(&store)
            .ok_or_else(|| not_found("key-value store", *store))?;
        Ok(entry.lock().metadata.clone())
    }

    async fn delete_key_value_store(&self, store: KeyValueStoreId) -> Result<()> {
        self.kv_stores.remove(&store);
        Ok(())
    }

    async fn get_or_create_request_queue(&self, name: &str) -> Result<QueueId> {
        if let Some(id) = self.queue_names.get(name) {
            return Ok(*id);
        }
        let id = QueueId(Uuid::new_v4());
        self.queues.insert(
            id,
            Mutex::new(QueueEntry::new(EntityMetadata {
                id: *id,
                name: name.to_string(),
                created_at: Utc::now(),
            })),
        );
        self.queue_names.insert(name.to_string(), id);
        Ok(id)
    }

    async fn list_request_queues(&self) -> Result<Vec<EntityMetadata>> {
        Ok(self
            .queues
            .iter()
            .map(|entry| entry.value().lock().metadata.clone())
            .collect())
    }

    async fn add_request(
        &self,
        queue: QueueId,
        request: Request<Pending>,
        forefront: bool,
    ) -> Result<AddRequestResult> {
        let entry = self
            .queues
            .get(&queue)
            .ok_or_else(|| not_found("request queue", *queue))?;
        let mut entry = entry.lock();

        if let Some(existing_id) = entry.unique_keys.get(request.unique_key()).copied() {
            let was_already_handled = matches!(
                entry.records.get(&existing_id),
                Some(AnyRequest::Handled(_))
            );
            return Ok(AddRequestResult {
                id: existing_id,
                was_already_present: true,
                was_already_handled,
            });
        }

        let id = request.id();
        entry.unique_keys.insert(request.unique_key().to_string(), id);
        entry.records.insert(id, AnyRequest::Pending(request));
        if forefront {
            entry.order.push_front(id);
        } else {
            entry.order.push_back(id);
        }
        entry.modified_at = Utc::now();

        Ok(AddRequestResult {
            id,
            was_already_present: false,
            was_already_handled: false,
        })
    }

    async fn get_request(&self, queue: QueueId, id: RequestId) -> Result<Option<AnyRequest>> {
        let entry = self
            .queues
            .get(&queue)
            .ok_or_else(|| not_found("request queue", *queue))?;
        Ok(entry.lock().records.get(&id).cloned())
    }

    async fn update_request(
        &self,
        queue: QueueId,
        request: AnyRequest,
        forefront: bool,
    ) -> Result<()> {
        let entry = self
            .queues
            .get(&queue)
            .ok_or_else(|| not_found("request queue", *queue))?;
        let mut entry = entry.lock();
        let id = request.id();

        if matches!(request, AnyRequest::Pending(_)) {
            entry.order.retain(|existing| *existing != id);
            if forefront {
                entry.order.push_front(id);
            } else {
                entry.order.push_back(id);
            }
        }

        entry.records.insert(id, request);
        entry.modified_at = Utc::now();
        Ok(())
    }

    async fn list_head(&self, queue: QueueId, limit: usize) -> Result<ListHeadResult> {
        let entry = self
            .queues
            .get(&queue)
            .ok_or_else(|| not_found("request queue", *queue))?;
        let mut entry = entry.lock();

        let now = Utc::now();
        let mut ready = Vec::new();
        let mut stale = Vec::new();

        for id in entry.order.iter().copied() {
            match entry.records.get(&id) {
                Some(AnyRequest::Pending(req)) => {
                    if req.state.not_before.is_none_or(|nb| nb <= now) {
                        ready.push(id);
                        if ready.len() >= limit {
                            break;
                        }
                    }
                }
                _ => stale.push(id),
            }
        }

        for id in stale {
            entry.order.retain(|existing| *existing != id);
        }

        Ok(ListHeadResult {
            items: ready,
            queue_modified_at: entry.modified_at,
            had_multiple_clients: false,
        })
    }

    async fn handled_count(&self, queue: QueueId) -> Result<u64> {
        let entry = self
            .queues
            .get(&queue)
            .ok_or_else(|| not_found("request queue", *queue))?;
        Ok(entry
            .lock()
            .records
            .values()
            .filter(|r| r.is_terminal())
            .count() as u64)
    }

    async fn get_request_queue(&self, queue: QueueId) -> Result<EntityMetadata> {
        let entry = self
            .queues
            .get(&queue)
            .ok_or_else(|| not_found("request queue", *queue))?;
        Ok(entry.lock().metadata.clone())
    }

    async fn delete_request_queue(&self, queue: QueueId) -> Result<()> {
        self.queues.remove(&queue);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestInput;

    #[tokio::test]
    async fn add_request_is_idempotent_on_unique_key() {
        let storage = MemoryStorage::new();
        let queue = storage.get_or_create_request_queue("default").await.unwrap();

        let req = Request::new(RequestInput::new("https://example.com")).unwrap();
        let first = storage.add_request(queue, req.clone(), false).await.unwrap();
        assert!(!first.was_already_present);

        let duplicate = Request::new(RequestInput::new("https://example.com")).unwrap();
        let second = storage.add_request(queue, duplicate, false).await.unwrap();
        assert!(second.was_already_present);
        assert_eq!(second.id, first.id);
    }

    #[tokio::test]
    async fn list_head_respects_forefront() {
        let storage = MemoryStorage::new();
        let queue = storage.get_or_create_request_queue("default").await.unwrap();

        let a = Request::new(RequestInput::new("https://example.com/a")).unwrap();
        let b = Request::new(RequestInput::new("https://example.com/b")).unwrap();
        let a_result = storage.add_request(queue, a, false).await.unwrap();
        storage.add_request(queue, b, false).await.unwrap();

        let c = Request::new(RequestInput::new("https://example.com/c")).unwrap();
        let c_result = storage.add_request(queue, c, true).await.unwrap();

        let head = storage.list_head(queue, 10).await.unwrap();
        assert_eq!(head.items[0], c_result.id);
        assert_eq!(head.items[1], a_result.id);
    }

    #[tokio::test]
    async fn dataset_items_round_trip_in_order() {
        let storage = MemoryStorage::new();
        let dataset = storage.get_or_create_dataset("out").await.unwrap();
        let items = vec![serde_json::json!({"n": 1}), serde_json::json!({"n": 2})];
        storage.push_dataset_items(dataset, items.clone()).await.unwrap();
        let listed = storage
            .list_dataset_items(dataset, ListItemsOptions::default())
            .await
            .unwrap();
        assert_eq!(listed, items);
    }
}
