//! On-disk [`Storage`] backend using the exact layout of spec.md §6:
//!
//! ```text
//! <storageDir>/
//!   datasets/<id>/NNNNNNNNN.json         9-digit zero-padded item index
//!   key_value_stores/<id>/<key>.<ext>    + optional __metadata__.json
//!   request_queues/<id>/entries.json
//!   */<id>/__metadata__.json             entity metadata (createdAt, …)
//! ```
//!
//! No pack repo writes this exact layout; the concurrency discipline
//! (§9: "the on-disk implementation may buffer writes, but its contract is
//! synchronous from the core's perspective") is carried from
//! `fusillade`'s own storage contract — every write here is awaited and
//! durable-or-erred before the call returns. Per-queue read-modify-write on
//! `entries.json` is serialized through a `tokio::sync::Mutex` held across
//! the read/write `.await` points, the same way `fusillade`'s own
//! `request/transitions.rs` holds its lock across an async boundary
//! (a `parking_lot` guard is `!Send` and can't cross one).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{CrawlError, Result};
use crate::request::{AnyRequest, Pending, Request, RequestId};

use super::{
    AddRequestResult, DatasetId, EntityMetadata, KeyValueRecord, KeyValueStoreId,
    ListHeadResult, ListItemsOptions, ListKeysOptions, QueueId, Storage,
};

/// On-disk backend rooted at a configurable directory
/// (`Configuration::storage_dir`, overridden by `CRAWLEE_STORAGE_DIR`).
pub struct LocalStorage {
    root: PathBuf,
    dataset_counters: DashMap<DatasetId, AtomicU64>,
    queue_locks: DashMap<QueueId, Arc<Mutex<()>>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NameIndex(HashMap<String, Uuid>);

#[derive(Debug, Serialize, Deserialize, Default)]
struct QueueEntries {
    records: HashMap<RequestId, AnyRequest>,
    unique_keys: HashMap<String, RequestId>,
    order: Vec<RequestId>,
    modified_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContentTypeIndex(HashMap<String, String>);

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            dataset_counters: DashMap::new(),
            queue_locks: DashMap::new(),
        }
    }

    fn dataset_dir(&self, id: DatasetId) -> PathBuf {
        self.root.join("datasets").join(id.0.to_string())
    }
    fn kv_store_dir(&self, id: KeyValueStoreId) -> PathBuf {
        self.root.join("key_value_stores").join(id.0.to_string())
    }
    fn queue_dir(&self, id: QueueId) -> PathBuf {
        self.root.join("request_queues").join(id.0.to_string())
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_json<T: Serialize + Sync>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(value)?;
        fs::write(path, bytes).await?;
        Ok(())
    }

    async fn name_index_path(&self, kind: &str) -> PathBuf {
        self.root.join(kind).join("__names__.json")
    }

    async fn resolve_or_create_id<F>(&self, kind: &str, name: &str, make_dir: F) -> Result<Uuid>
    where
        F: FnOnce(Uuid) -> PathBuf,
    {
        let index_path = self.name_index_path(kind).await;
        let mut index: NameIndex = Self::read_json(&index_path)
            .await?
            .unwrap_or_else(|| NameIndex(HashMap::new()));

        if let Some(id) = index.0.get(name) {
            return Ok(*id);
        }

        let id = Uuid::new_v4();
        let dir = make_dir(id);
        fs::create_dir_all(&dir).await?;
        Self::write_json(
            &dir.join("__metadata__.json"),
            &EntityMetadata {
                id,
                name: name.to_string(),
                created_at: Utc::now(),
            },
        )
        .await?;

        index.0.insert(name.to_string(), id);
        Self::write_json(&index_path, &index).await?;
        Ok(id)
    }

    async fn read_metadata(dir: &Path, id: Uuid) -> Result<EntityMetadata> {
        Self::read_json(&dir.join("__metadata__.json"))
            .await?
            .ok_or_else(|| CrawlError::Persistence(format!("entity {id} has no metadata file")))
    }

    async fn read_queue_entries(&self, queue: QueueId) -> Result<QueueEntries> {
        let path = self.queue_dir(queue).join("entries.json");
        Ok(Self::read_json(&path).await?.unwrap_or_default())
    }

    async fn write_queue_entries(&self, queue: QueueId, entries: &QueueEntries) -> Result<()> {
        let path = self.queue_dir(queue).join("entries.json");
        Self::write_json(&path, entries).await
    }

    fn content_type_extension(content_type: &str) -> &'static str {
        if content_type.contains("json") {
            "json"
        } else if content_type.starts_with("text/") {
            "txt"
        } else {
            "bin"
        }
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn get_or_create_dataset(&self, name: &str) -> Result<DatasetId> {
        let id = self
            .resolve_or_create_id("datasets", name, |id| {
                self.root.join("datasets").join(id.to_string())
            })
            .await?;
        Ok(DatasetId(id))
    }

    async fn list_datasets(&self) -> Result<Vec<EntityMetadata>> {
        let index_path = self.name_index_path("datasets").await;
        let index: NameIndex = Self::read_json(&index_path).await?.unwrap_or_else(|| NameIndex(HashMap::new()));
        let mut out = Vec::new();
        for id in index.0.values() {
            out.push(Self::read_metadata(&self.root.join("datasets").join(id.to_string()), *id).await?);
        }
        Ok(out)
    }

    async fn push_dataset_items(&self, id: DatasetId, items: Vec<serde_json::Value>) -> Result<()> {
        let dir = self.dataset_dir(id);
        fs::create_dir_all(&dir).await?;

        let counter = self
            .dataset_counters
            .entry(id)
            .or_insert_with(|| AtomicU64::new(Self::scan_dataset_count(&dir)));

        for item in items {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            let filename = format!("{index:09}.json");
            Self::write_json(&dir.join(filename), &item).await?;
        }
        Ok(())
    }

    async fn list_dataset_items(
        &self,
        id: DatasetId,
        options: ListItemsOptions,
    ) -> Result<Vec<serde_json::Value>> {
        let dir = self.dataset_dir(id);
        let mut filenames = Vec::new();
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".json") && name != "__metadata__.json" {
                filenames.push(name);
            }
        }
        filenames.sort();
        if options.desc {
            filenames.reverse();
        }

        let end = options
            .limit
            .map(|limit| (options.offset + limit).min(filenames.len()))
            .unwrap_or(filenames.len());
        let start = options.offset.min(filenames.len());

        let mut items = Vec::new();
        for filename in &filenames[start..end] {
            let bytes = fs::read(dir.join(filename)).await?;
            items.push(serde_json::from_slice(&bytes)?);
        }
        Ok(items)
    }

    async fn get_dataset(&self, id: DatasetId) -> Result<EntityMetadata> {
        Self::read_metadata(&self.dataset_dir(id), *id).await
    }

    async fn delete_dataset(&self, id: DatasetId) -> Result<()> {
        let dir = self.dataset_dir(id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_or_create_key_value_store(&self, name: &str) -> Result<KeyValueStoreId> {
        let id = self
            .resolve_or_create_id("key_value_stores", name, |id| {
                self.root.join("key_value_stores").join(id.to_string())
            })
            .await?;
        Ok(KeyValueStoreId(id))
    }

    async fn list_key_value_stores(&self) -> Result<Vec<EntityMetadata>> {
        let index_path = self.name_index_path("key_value_stores").await;
        let index: NameIndex = Self::read_json(&index_path).await?.unwrap_or_else(|| NameIndex(HashMap::new()));
        let mut out = Vec::new();
        for id in index.0.values() {
            out.push(
                Self::read_metadata(&self.root.join("key_value_stores").join(id.to_string()), *id).await?,
            );
        }
        Ok(out)
    }

    async fn get_record(
        &self,
        store: KeyValueStoreId,
        key: &str,
    ) -> Result<Option<KeyValueRecord>> {
        let dir = self.kv_store_dir(store);
        let content_types: ContentTypeIndex = Self::read_json(&dir.join(".content_types.json"))
            .await?
            .unwrap_or_else(|| ContentTypeIndex(HashMap::new()));
        let Some(content_type) = content_types.0.get(key) else {
            return Ok(None);
        };
        let ext = Self::content_type_extension(content_type);
        let path = dir.join(format!("{key}.{ext}"));
        match fs::read(&path).await {
            Ok(value) => Ok(Some(KeyValueRecord {
                key: key.to_string(),
                value,
                content_type: content_type.clone(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_record(&self, store: KeyValueStoreId, record: KeyValueRecord) -> Result<()> {
        let dir = self.kv_store_dir(store);
        fs::create_dir_all(&dir).await?;

        let ct_path = dir.join(".content_types.json");
        let mut content_types: ContentTypeIndex = Self::read_json(&ct_path)
            .await?
            .unwrap_or_else(|| ContentTypeIndex(HashMap::new()));

        let ext = Self::content_type_extension(&record.content_type);
        fs::write(dir.join(format!("{}.{}", record.key, ext)), &record.value).await?;

        content_types
            .0
            .insert(record.key.clone(), record.content_type.clone());
        Self::write_json(&ct_path, &content_types).await?;
        Ok(())
    }

    async fn delete_record(&self, store: KeyValueStoreId, key: &str) -> Result<()> {
        let dir = self.kv_store_dir(store);
        let ct_path = dir.join(".content_types.json");
        let mut content_types: ContentTypeIndex = Self::read_json(&ct_path)
            .await?
            .unwrap_or_else(|| ContentTypeIndex(HashMap::new()));

        if let Some(content_type) = content_types.0.remove(key) {
            let ext = Self::content_type_extension(&content_type);
            let _ = fs::remove_file(dir.join(format!("{key}.{ext}"))).await;
            Self::write_json(&ct_path, &content_types).await?;
        }
        Ok(())
    }

    async fn list_keys(
        &self,
        store: KeyValueStoreId,
        options: ListKeysOptions,
    ) -> Result<Vec<String>> {
        let dir = self.kv_store_dir(store);
        let content_types: ContentTypeIndex = Self::read_json(&dir.join(".content_types.json"))
            .await?
            .unwrap_or_else(|| ContentTypeIndex(HashMap::new()));
        let mut keys: Vec<String> = content_types.0.into_keys().collect();
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
        Self::read_metadata(&self.kv_store_dir(store), *store).await
    }

    async fn delete_key_value_store(&self, store: KeyValueStoreId) -> Result<()> {
        let dir = self.kv_store_dir(store);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_or_create_request_queue(&self, name: &str) -> Result<QueueId> {
        let id = self
            .resolve_or_create_id("request_queues", name, |id| {
                self.root.join("request_queues").join(id.to_string())
            })
            .await?;
        Ok(QueueId(id))
    }

    async fn list_request_queues(&self) -> Result<Vec<EntityMetadata>> {
        let index_path = self.name_index_path("request_queues").await;
        let index: NameIndex = Self::read_json(&index_path).await?.unwrap_or_else(|| NameIndex(HashMap::new()));
        let mut out = Vec::new();
        for id in index.0.values() {
            out.push(
                Self::read_metadata(&self.root.join("request_queues").join(id.to_string()), *id).await?,
            );
        }
        Ok(out)
    }

    async fn add_request(
        &self,
        queue: QueueId,
        request: Request<Pending>,
        forefront: bool,
    ) -> Result<AddRequestResult> {
        let lock = self.queue_locks.entry(queue).or_default().clone();
        let _guard = lock.lock().await;

        let mut entries = self.read_queue_entries(queue).await?;

        if let Some(existing_id) = entries.unique_keys.get(request.unique_key()).copied() {
            let was_already_handled = matches!(
                entries.records.get(&existing_id),
                Some(AnyRequest::Handled(_))
            );
            return Ok(AddRequestResult {
                id: existing_id,
                was_already_present: true,
                was_already_handled,
            });
        }

        let id = request.id();
        entries
            .unique_keys
            .insert(request.unique_key().to_string(), id);
        entries.records.insert(id, AnyRequest::Pending(request));
        if forefront {
            entries.order.insert(0, id);
        } else {
            entries.order.push(id);
        }
        entries.modified_at = Utc::now();

        self.write_queue_entries(queue, &entries).await?;

        Ok(AddRequestResult {
            id,
            was_already_present: false,
            was_already_handled: false,
        })
    }

    async fn get_request(&self, queue: QueueId, id: RequestId) -> Result<Option<AnyRequest>> {
        let entries = self.read_queue_entries(queue).await?;
        Ok(entries.records.get(&id).cloned())
    }

    async fn update_request(
        &self,
        queue: QueueId,
        request: AnyRequest,
        forefront: bool,
    ) -> Result<()> {
        let lock = self.queue_locks.entry(queue).or_default().clone();
        let _guard = lock.lock().await;

        let mut entries = self.read_queue_entries(queue).await?;
        let id = request.id();

        if matches!(request, AnyRequest::Pending(_)) {
            entries.order.retain(|existing| *existing != id);
            if forefront {
                entries.order.insert(0, id);
            } else {
                entries.order.push(id);
            }
        }

        entries.records.insert(id, request);
        entries.modified_at = Utc::now();
        self.write_queue_entries(queue, &entries).await
    }

    async fn list_head(&self, queue: QueueId, limit: usize) -> Result<ListHeadResult> {
        let lock = self.queue_locks.entry(queue).or_default().clone();
        let _guard = lock.lock().await;

        let mut entries = self.read_queue_entries(queue).await?;
        let now = Utc::now();
        let mut ready = Vec::new();
        let mut stale = Vec::new();

        for id in entries.order.iter().copied() {
            match entries.records.get(&id) {
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

        let modified_at = entries.modified_at;
        if !stale.is_empty() {
            entries.order.retain(|id| !stale.contains(id));
            self.write_queue_entries(queue, &entries).await?;
        }

        Ok(ListHeadResult {
            items: ready,
            queue_modified_at: modified_at,
            had_multiple_clients: false,
        })
    }

    async fn handled_count(&self, queue: QueueId) -> Result<u64> {
        let entries = self.read_queue_entries(queue).await?;
        Ok(entries.records.values().filter(|r| r.is_terminal()).count() as u64)
    }

    async fn get_request_queue(&self, queue: QueueId) -> Result<EntityMetadata> {
        Self::read_metadata(&self.queue_dir(queue), *queue).await
    }

    async fn delete_request_queue(&self, queue: QueueId) -> Result<()> {
        let dir = self.queue_dir(queue);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl LocalStorage {
    fn scan_dataset_count(dir: &Path) -> u64 {
        std::fs::read_dir(dir)
            .map(|rd| {
                rd.filter_map(|entry| entry.ok())
                    .filter(|entry| {
                        let name = entry.file_name().to_string_lossy().to_string();
                        name.ends_with(".json") && name != "__metadata__.json"
                    })
                    .count() as u64
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestInput;

    #[tokio::test]
    async fn dataset_items_persist_with_zero_padded_filenames() {
        let dir = tempdir();
        let storage = LocalStorage::new(&dir);
        let dataset = storage.get_or_create_dataset("out").await.unwrap();
        storage
            .push_dataset_items(dataset, vec![serde_json::json!({"n": 1})])
            .await
            .unwrap();

        let expected = dir.join("datasets").join(dataset.0.to_string()).join("000000000.json");
        assert!(expected.exists());
    }

    #[tokio::test]
    async fn request_queue_survives_restart() {
        let dir = tempdir();
        let queue_id;
        {
            let storage = LocalStorage::new(&dir);
            queue_id = storage.get_or_create_request_queue("q").await.unwrap();
            let req = Request::new(RequestInput::new("https://example.com")).unwrap();
            storage.add_request(queue_id, req, false).await.unwrap();
        }
        {
            let storage = LocalStorage::new(&dir);
            let head = storage.list_head(queue_id, 10).await.unwrap();
            assert_eq!(head.items.len(), 1);
        }
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("crawler-core-test-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
