//! Immutable ordered source of URLs with a resumable cursor (component #2,
//! spec.md §4.1).
//!
//! Unlike [`crate::request_queue::RequestQueue`], a `RequestList` does not
//! own per-record state in a backend — its records are frozen at `open()`
//! time into a plain `Vec`. Only the *cursor* (`{next_index, reclaimed,
//! handled}`) is persisted, under a single key-value record, the way
//! `fusillade`'s daemon persists its own run-level checkpoint rather than
//! per-row state for each claimed request.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CrawlError, Result};
use crate::request::{Request, RequestData, RequestId, RequestInput};
use crate::storage::{KeyValueRecord, KeyValueStoreId, Storage};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PersistedState {
    next_index: usize,
    reclaimed: Vec<usize>,
    handled: Vec<usize>,
}

/// Ordered, finite producer of requests frozen at construction time
/// (spec.md §4.1: "not a back-pressure primitive"). `fetch_next_request`
/// hands out `reclaimed` indices before advancing the cursor over unseen
/// ones, matching "reclaimed requests re-emerge before unseen ones".
pub struct RequestList<S: Storage> {
    storage: S,
    kv_store: KeyValueStoreId,
    persist_key: Option<String>,
    sources: Vec<RequestData>,
    id_to_index: HashMap<RequestId, usize>,
    next_index: AtomicUsize,
    reclaimed: Mutex<VecDeque<usize>>,
    in_flight: Mutex<HashSet<usize>>,
    handled: Mutex<HashSet<usize>>,
}

impl<S: Storage> RequestList<S> {
    /// `open(name, sources)`: freezes `sources` into concrete requests (and
    /// rejects invalid ones the same way `Request::new` would for a queue
    /// insert), then recovers any previously persisted cursor from
    /// `persist_key` if one is given and a record already exists.
    pub async fn open(
        storage: S,
        kv_store_name: &str,
        persist_key: Option<String>,
        sources: Vec<RequestInput>,
    ) -> Result<Self> {
        let mut built = Vec::with_capacity(sources.len());
        for input in sources {
            built.push(Request::new(input)?.data);
        }

        let mut id_to_index = HashMap::with_capacity(built.len());
        for (index, data) in built.iter().enumerate() {
            id_to_index.insert(data.id, index);
        }

        let kv_store = storage.get_or_create_key_value_store(kv_store_name).await?;

        let mut list = Self {
            storage,
            kv_store,
            persist_key,
            sources: built,
            id_to_index,
            next_index: AtomicUsize::new(0),
            reclaimed: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(HashSet::new()),
            handled: Mutex::new(HashSet::new()),
        };
        list.recover().await?;
        Ok(list)
    }

    async fn recover(&mut self) -> Result<()> {
        let Some(key) = self.persist_key.clone() else {
            return Ok(());
        };
        let Some(record) = self.storage.get_record(self.kv_store, &key).await? else {
            return Ok(());
        };
        let state: PersistedState = serde_json::from_slice(&record.value)?;
        debug!(next_index = state.next_index, handled = state.handled.len(), "recovered request list cursor");
        self.next_index.store(state.next_index, Ordering::Relaxed);
        *self.reclaimed.lock() = state.reclaimed.into_iter().collect();
        *self.handled.lock() = state.handled.into_iter().collect();
        Ok(())
    }

    /// `persistState()`: fails with `PersistenceError` if no name was
    /// configured (spec.md §4.1).
    pub async fn persist_state(&self) -> Result<()> {
        let key = self.persist_key.clone().ok_or_else(|| {
            CrawlError::Persistence("request list has no persist key configured".into())
        })?;

        let state = PersistedState {
            next_index: self.next_index.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.lock().iter().copied().collect(),
            handled: self.handled.lock().iter().copied().collect(),
        };
        let bytes = serde_json::to_vec(&state)?;
        self.storage
            .set_record(
                self.kv_store,
                KeyValueRecord {
                    key,
                    value: bytes,
                    content_type: "application/json".into(),
                },
            )
            .await
    }

    /// `fetchNextRequest()`: reclaimed indices first, then the next unseen
    /// one in source order. Skips indices already handled (defensive: a
    /// handled index should never re-enter `reclaimed`, but a restart could
    /// in principle recover overlapping state if persistence raced a
    /// handled-mark).
    pub fn fetch_next_request(&self) -> Option<(RequestId, RequestData)> {
        loop {
            let index = {
                let mut reclaimed = self.reclaimed.lock();
                if let Some(index) = reclaimed.pop_front() {
                    index
                } else {
                    drop(reclaimed);
                    let index = self.next_index.fetch_add(1, Ordering::AcqRel);
                    if index >= self.sources.len() {
                        self.next_index.fetch_sub(1, Ordering::AcqRel);
                        return None;
                    }
                    index
                }
            };

            if self.handled.lock().contains(&index) {
                continue;
            }

            self.in_flight.lock().insert(index);
            let data = self.sources[index].clone();
            return Some((data.id, data));
        }
    }

    fn index_of(&self, id: RequestId) -> Result<usize> {
        self.id_to_index
            .get(&id)
            .copied()
            .ok_or(CrawlError::RequestNotFound(id))
    }

    /// `markRequestHandled(r)`.
    pub fn mark_request_handled(&self, id: RequestId) -> Result<()> {
        let index = self.index_of(id)?;
        if !self.in_flight.lock().remove(&index) {
            return Err(CrawlError::InvalidState(
                id,
                "not-in-flight".into(),
                "handled".into(),
            ));
        }
        self.handled.lock().insert(index);
        Ok(())
    }

    /// `reclaimRequest(r)`: returns the index to the front of the
    /// reclaimed queue, re-emerging ahead of unseen sources.
    pub fn reclaim_request(&self, id: RequestId) -> Result<()> {
        let index = self.index_of(id)?;
        if !self.in_flight.lock().remove(&index) {
            warn!(%id, "reclaim_request called on an id that was not in-flight");
        }
        self.reclaimed.lock().push_back(index);
        Ok(())
    }

    pub fn get(&self, id: RequestId) -> Option<RequestData> {
        self.id_to_index.get(&id).map(|&i| self.sources[i].clone())
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reclaimed.lock().is_empty() && self.next_index.load(Ordering::Relaxed) >= self.sources.len()
    }

    /// `isFinished()`: no reclaimed work, no unseen sources, and nothing
    /// currently leased out.
    pub fn is_finished(&self) -> bool {
        self.is_empty() && self.in_flight.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    async fn list(urls: &[&str]) -> RequestList<MemoryStorage> {
        let storage = MemoryStorage::new();
        let sources = urls.iter().map(|u| RequestInput::new(*u)).collect();
        RequestList::open(storage, "request-lists", Some("default".into()), sources)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn yields_requests_in_source_order() {
        let list = list(&["https://a.example", "https://b.example"]).await;
        let (_, first) = list.fetch_next_request().unwrap();
        let (_, second) = list.fetch_next_request().unwrap();
        assert_eq!(first.url, "https://a.example");
        assert_eq!(second.url, "https://b.example");
        assert!(list.fetch_next_request().is_none());
    }

    #[tokio::test]
    async fn reclaimed_requests_re_emerge_before_unseen_ones() {
        let list = list(&["https://a.example", "https://b.example"]).await;
        let (first_id, _) = list.fetch_next_request().unwrap();
        list.reclaim_request(first_id).unwrap();

        let (next_id, next_data) = list.fetch_next_request().unwrap();
        assert_eq!(next_id, first_id);
        assert_eq!(next_data.url, "https://a.example");
    }

    #[tokio::test]
    async fn mark_request_handled_requires_in_flight() {
        let list = list(&["https://a.example"]).await;
        let (id, _) = list.fetch_next_request().unwrap();
        list.mark_request_handled(id).unwrap();
        assert!(list.mark_request_handled(id).is_err());
    }

    #[tokio::test]
    async fn is_finished_waits_for_in_flight_to_drain() {
        let list = list(&["https://a.example"]).await;
        let (id, _) = list.fetch_next_request().unwrap();
        assert!(!list.is_finished());
        list.mark_request_handled(id).unwrap();
        assert!(list.is_finished());
    }

    #[tokio::test]
    async fn persist_state_fails_without_a_configured_key() {
        let storage = MemoryStorage::new();
        let list = RequestList::open(storage, "request-lists", None, vec![RequestInput::new("https://a.example")])
            .await
            .unwrap();
        assert!(matches!(list.persist_state().await, Err(CrawlError::Persistence(_))));
    }

    #[tokio::test]
    async fn persisted_cursor_is_recovered_on_reopen() {
        let storage = std::sync::Arc::new(MemoryStorage::new());
        let sources = vec![RequestInput::new("https://a.example"), RequestInput::new("https://b.example")];
        let list = RequestList::open(storage.clone(), "request-lists", Some("default".into()), sources.clone())
            .await
            .unwrap();
        list.fetch_next_request().unwrap();
        list.persist_state().await.unwrap();

        let reopened = RequestList::open(storage, "request-lists", Some("default".into()), sources)
            .await
            .unwrap();
        let (_, data) = reopened.fetch_next_request().unwrap();
        assert_eq!(data.url, "https://b.example");
    }
}
