//! Multi-writer [`Storage`] backend on PostgreSQL (feature `postgres`).
//!
//! Grounded on `fusillade::manager::postgres::PostgresRequestManager`:
//! claiming ready rows through `UPDATE ... WHERE id IN (SELECT ... FOR
//! UPDATE SKIP LOCKED) RETURNING ...` rather than a plain `SELECT`, and
//! persisting a typestate transition through one `UPDATE ... SET state =
//! '<new state>', ...` statement per target state. Queries here use the
//! runtime-checked `sqlx::query`/`query_as` API (bind + `try_get`) rather
//! than the `query!` macro, the same style `PostgresRequestManager::list_files`
//! already falls back to for a query whose shape isn't known until
//! runtime — appropriate here too, since this backend ships without a
//! compile-time-verified `DATABASE_URL`/`sqlx-data.json` of its own.
//!
//! Expected schema (migrations are the caller's responsibility, the same
//! division of concerns `fusillade` leaves to its own deployment):
//!
//! ```sql
//! CREATE TABLE datasets (
//!     id UUID PRIMARY KEY, name TEXT UNIQUE NOT NULL, created_at TIMESTAMPTZ NOT NULL
//! );
//! CREATE TABLE dataset_items (
//!     dataset_id UUID NOT NULL, idx BIGINT NOT NULL, data JSONB NOT NULL,
//!     PRIMARY KEY (dataset_id, idx)
//! );
//! CREATE TABLE key_value_stores (
//!     id UUID PRIMARY KEY, name TEXT UNIQUE NOT NULL, created_at TIMESTAMPTZ NOT NULL
//! );
//! CREATE TABLE key_value_records (
//!     store_id UUID NOT NULL, key TEXT NOT NULL, value BYTEA NOT NULL,
//!     content_type TEXT NOT NULL, PRIMARY KEY (store_id, key)
//! );
//! CREATE TABLE request_queues (
//!     id UUID PRIMARY KEY, name TEXT UNIQUE NOT NULL, created_at TIMESTAMPTZ NOT NULL,
//!     modified_at TIMESTAMPTZ NOT NULL, last_writer_id UUID
//! );
//! CREATE TABLE requests (
//!     id UUID PRIMARY KEY, queue_id UUID NOT NULL, unique_key TEXT NOT NULL,
//!     url TEXT NOT NULL, loaded_url TEXT, method TEXT NOT NULL, payload TEXT,
//!     headers JSONB NOT NULL, user_data JSONB NOT NULL, retry_count INT NOT NULL,
//!     no_retry BOOLEAN NOT NULL, error_messages JSONB NOT NULL,
//!     state TEXT NOT NULL, not_before TIMESTAMPTZ, locked_until TIMESTAMPTZ,
//!     leased_at TIMESTAMPTZ, handled_at TIMESTAMPTZ, succeeded BOOLEAN,
//!     UNIQUE (queue_id, unique_key)
//! );
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{CrawlError, Result};
use crate::request::{AnyRequest, Handled, InProgress, Method, Pending, Request, RequestData, RequestId};

use super::{
    AddRequestResult, DatasetId, EntityMetadata, KeyValueRecord, KeyValueStoreId, ListHeadResult,
    ListItemsOptions, ListKeysOptions, QueueId, Storage,
};

fn sqlx_err(context: &str, error: sqlx::Error) -> CrawlError {
    CrawlError::TransientBackend(format!("{context}: {error}"))
}

fn method_to_str(method: Method) -> &'static str {
    match method {
        Method::Get => "GET",
        Method::Head => "HEAD",
        Method::Post => "POST",
        Method::Put => "PUT",
        Method::Patch => "PATCH",
        Method::Delete => "DELETE",
    }
}

fn method_from_str(value: &str) -> Result<Method> {
    Ok(match value {
        "GET" => Method::Get,
        "HEAD" => Method::Head,
        "POST" => Method::Post,
        "PUT" => Method::Put,
        "PATCH" => Method::Patch,
        "DELETE" => Method::Delete,
        other => return Err(CrawlError::Other(anyhow::anyhow!("unknown request method '{other}' in database row"))),
    })
}

/// PostgreSQL-backed [`Storage`]. `instance_id` is a fresh id per process,
/// stamped onto `request_queues.last_writer_id` on every write so
/// `list_head` can tell whether some *other* process touched the queue
/// since this one last looked (`had_multiple_clients`, spec.md §4.2/§6).
pub struct PostgresStorage {
    pool: PgPool,
    instance_id: Uuid,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            instance_id: Uuid::new_v4(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_request_data(row: &sqlx::postgres::PgRow) -> Result<RequestData> {
        let headers_json: serde_json::Value = row.try_get("headers").map_err(|e| sqlx_err("reading headers", e))?;
        let headers: HashMap<String, String> = serde_json::from_value(headers_json)?;
        let error_messages_json: serde_json::Value =
            row.try_get("error_messages").map_err(|e| sqlx_err("reading error_messages", e))?;
        let error_messages: Vec<String> = serde_json::from_value(error_messages_json)?;

        Ok(RequestData {
            id: RequestId(row.try_get("id").map_err(|e| sqlx_err("reading id", e))?),
            unique_key: row.try_get("unique_key").map_err(|e| sqlx_err("reading unique_key", e))?,
            url: row.try_get("url").map_err(|e| sqlx_err("reading url", e))?,
            loaded_url: row.try_get("loaded_url").map_err(|e| sqlx_err("reading loaded_url", e))?,
            method: method_from_str(row.try_get::<String, _>("method").map_err(|e| sqlx_err("reading method", e))?.as_str())?,
            payload: row.try_get("payload").map_err(|e| sqlx_err("reading payload", e))?,
            headers,
            user_data: row.try_get("user_data").map_err(|e| sqlx_err("reading user_data", e))?,
            retry_count: row.try_get::<i32, _>("retry_count").map_err(|e| sqlx_err("reading retry_count", e))? as u32,
            no_retry: row.try_get("no_retry").map_err(|e| sqlx_err("reading no_retry", e))?,
            error_messages,
        })
    }

    fn row_to_any_request(row: &sqlx::postgres::PgRow) -> Result<AnyRequest> {
        let data = Self::row_to_request_data(row)?;
        let state: String = row.try_get("state").map_err(|e| sqlx_err("reading state", e))?;
        match state.as_str() {
            "pending" => {
                let not_before: Option<DateTime<Utc>> =
                    row.try_get("not_before").map_err(|e| sqlx_err("reading not_before", e))?;
                Ok(AnyRequest::Pending(Request { data, state: Pending { not_before } }))
            }
            "in-progress" => {
                let leased_at: DateTime<Utc> =
                    row.try_get("leased_at").map_err(|e| sqlx_err("reading leased_at", e))?;
                Ok(AnyRequest::InProgress(Request { data, state: InProgress { leased_at } }))
            }
            "handled" => {
                let handled_at: DateTime<Utc> =
                    row.try_get("handled_at").map_err(|e| sqlx_err("reading handled_at", e))?;
                let succeeded: bool = row.try_get("succeeded").map_err(|e| sqlx_err("reading succeeded", e))?;
                Ok(AnyRequest::Handled(Request { data, state: Handled { handled_at, succeeded } }))
            }
            other => Err(CrawlError::Other(anyhow::anyhow!("unknown request state '{other}' in database row"))),
        }
    }

    async fn touch_queue(&self, queue: QueueId) -> Result<()> {
        sqlx::query("UPDATE request_queues SET modified_at = now(), last_writer_id = $1 WHERE id = $2")
            .bind(self.instance_id)
            .bind(*queue)
            .execute(&self.pool)
            .await
            .map_err(|e| sqlx_err("touching queue modified_at", e))?;
        Ok(())
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn get_or_create_dataset(&self, name: &str) -> Result<DatasetId> {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO datasets (id, name, created_at) VALUES ($1, $2, now()) \
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| sqlx_err("get_or_create_dataset", e))?;
        Ok(DatasetId(id))
    }

    async fn list_datasets(&self) -> Result<Vec<EntityMetadata>> {
        let rows = sqlx::query("SELECT id, name, created_at FROM datasets ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| sqlx_err("list_datasets", e))?;
        rows.iter()
            .map(|row| {
                Ok(EntityMetadata {
                    id: row.try_get("id").map_err(|e| sqlx_err("reading id", e))?,
                    name: row.try_get("name").map_err(|e| sqlx_err("reading name", e))?,
                    created_at: row.try_get("created_at").map_err(|e| sqlx_err("reading created_at", e))?,
                })
            })
            .collect()
    }

    async fn push_dataset_items(&self, id: DatasetId, items: Vec<serde_json::Value>) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| sqlx_err("begin push_dataset_items", e))?;

        let next_idx: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(idx), -1) + 1 FROM dataset_items WHERE dataset_id = $1")
            .bind(*id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| sqlx_err("computing next dataset index", e))?;

        for (offset, item) in items.into_iter().enumerate() {
            sqlx::query("INSERT INTO dataset_items (dataset_id, idx, data) VALUES ($1, $2, $3)")
                .bind(*id)
                .bind(next_idx + offset as i64)
                .bind(item)
                .execute(&mut *tx)
                .await
                .map_err(|e| sqlx_err("inserting dataset item", e))?;
        }

        tx.commit().await.map_err(|e| sqlx_err("commit push_dataset_items", e))?;
        Ok(())
    }

    async fn list_dataset_items(&self, id: DatasetId, options: ListItemsOptions) -> Result<Vec<serde_json::Value>> {
        let order = if options.desc { "DESC" } else { "ASC" };
        let query = format!(
            "SELECT data FROM dataset_items WHERE dataset_id = $1 ORDER BY idx {order} OFFSET $2 LIMIT $3"
        );
        let rows = sqlx::query(&query)
            .bind(*id)
            .bind(options.offset as i64)
            .bind(options.limit.map(|l| l as i64).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| sqlx_err("list_dataset_items", e))?;
        rows.iter()
            .map(|row| row.try_get("data").map_err(|e| sqlx_err("reading data", e)))
            .collect()
    }

    async fn get_dataset(&self, id: DatasetId) -> Result<EntityMetadata> {
        let row = sqlx::query("SELECT id, name, created_at FROM datasets WHERE id = $1")
            .bind(*id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| sqlx_err("get_dataset", e))?
            .ok_or_else(|| CrawlError::Other(anyhow::anyhow!("dataset {id} not found")))?;
        Ok(EntityMetadata {
            id: row.try_get("id").map_err(|e| sqlx_err("reading id", e))?,
            name: row.try_get("name").map_err(|e| sqlx_err("reading name", e))?,
            created_at: row.try_get("created_at").map_err(|e| sqlx_err("reading created_at", e))?,
        })
    }

    async fn delete_dataset(&self, id: DatasetId) -> Result<()> {
        sqlx::query("DELETE FROM datasets WHERE id = $1")
            .bind(*id)
            .execute(&self.pool)
            .await
            .map_err(|e| sqlx_err("delete_dataset", e))?;
        Ok(())
    }

    async fn get_or_create_key_value_store(&self, name: &str) -> Result<KeyValueStoreId> {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO key_value_stores (id, name, created_at) VALUES ($1, $2, now()) \
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| sqlx_err("get_or_create_key_value_store", e))?;
        Ok(KeyValueStoreId(id))
    }

    async fn list_key_value_stores(&self) -> Result<Vec<EntityMetadata>> {
        let rows = sqlx::query("SELECT id, name, created_at FROM key_value_stores ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| sqlx_err("list_key_value_stores", e))?;
        rows.iter()
            .map(|row| {
                Ok(EntityMetadata {
                    id: row.try_get("id").map_err(|e| sqlx_err("reading id", e))?,
                    name: row.try_get("name").map_err(|e| sqlx_err("reading name", e))?,
                    created_at: row.try_get("created_at").map_err(|e| sqlx_err("reading created_at", e))?,
                })
            })
            .collect()
    }

    async fn get_record(&self, store: KeyValueStoreId, key: &str) -> Result<Option<KeyValueRecord>> {
        let row = sqlx::query("SELECT value, content_type FROM key_value_records WHERE store_id = $1 AND key = $2")
            .bind(*store)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| sqlx_err("get_record", e))?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(KeyValueRecord {
            key: key.to_string(),
            value: row.try_get("value").map_err(|e| sqlx_err("reading value", e))?,
            content_type: row.try_get("content_type").map_err(|e| sqlx_err("reading content_type", e))?,
        }))
    }

    async fn set_record(&self, store: KeyValueStoreId, record: KeyValueRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO key_value_records (store_id, key, value, content_type) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (store_id, key) DO UPDATE SET value = EXCLUDED.value, content_type = EXCLUDED.content_type",
        )
        .bind(*store)
        .bind(&record.key)
        .bind(&record.value)
        .bind(&record.content_type)
        .execute(&self.pool)
        .await
        .map_err(|e| sqlx_err("set_record", e))?;
        Ok(())
    }

    async fn delete_record(&self, store: KeyValueStoreId, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM key_value_records WHERE store_id = $1 AND key = $2")
            .bind(*store)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| sqlx_err("delete_record", e))?;
        Ok(())
    }

    async fn list_keys(&self, store: KeyValueStoreId, options: ListKeysOptions) -> Result<Vec<String>> {
        let query = "SELECT key FROM key_value_records WHERE store_id = $1 AND key > $2 ORDER BY key ASC LIMIT $3";
        let rows = sqlx::query(query)
            .bind(*store)
            .bind(options.exclusive_start_key.unwrap_or_default())
            .bind(options.limit.map(|l| l as i64).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| sqlx_err("list_keys", e))?;
        rows.iter()
            .map(|row| row.try_get("key").map_err(|e| sqlx_err("reading key", e)))
            .collect()
    }

    async fn get_key_value_store(&self, store: KeyValueStoreId) -> Result<EntityMetadata> {
        let row = sqlx::query("SELECT id, name, created_at FROM key_value_stores WHERE id = $1")
            .bind(*store)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| sqlx_err("get_key_value_store", e))?
            .ok_or_else(|| CrawlError::Other(anyhow::anyhow!("key-value store {store} not found")))?;
        Ok(EntityMetadata {
            id: row.try_get("id").map_err(|e| sqlx_err("reading id", e))?,
            name: row.try_get("name").map_err(|e| sqlx_err("reading name", e))?,
            created_at: row.try_get("created_at").map_err(|e| sqlx_err("reading created_at", e))?,
        })
    }

    async fn delete_key_value_store(&self, store: KeyValueStoreId) -> Result<()> {
        sqlx::query("DELETE FROM key_value_stores WHERE id = $1")
            .bind(*store)
            .execute(&self.pool)
            .await
            .map_err(|e| sqlx_err("delete_key_value_store", e))?;
        Ok(())
    }

    async fn get_or_create_request_queue(&self, name: &str) -> Result<QueueId> {
        let id: Uuid = sqlx::query_scalar(
            "INSERT INTO request_queues (id, name, created_at, modified_at) VALUES ($1, $2, now(), now()) \
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| sqlx_err("get_or_create_request_queue", e))?;
        Ok(QueueId(id))
    }

    async fn list_request_queues(&self) -> Result<Vec<EntityMetadata>> {
        let rows = sqlx::query("SELECT id, name, created_at FROM request_queues ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| sqlx_err("list_request_queues", e))?;
        rows.iter()
            .map(|row| {
                Ok(EntityMetadata {
                    id: row.try_get("id").map_err(|e| sqlx_err("reading id", e))?,
                    name: row.try_get("name").map_err(|e| sqlx_err("reading name", e))?,
                    created_at: row.try_get("created_at").map_err(|e| sqlx_err("reading created_at", e))?,
                })
            })
            .collect()
    }

    async fn add_request(&self, queue: QueueId, request: Request<Pending>, forefront: bool) -> Result<AddRequestResult> {
        let _ = forefront; // ordering is read back from `created_at`; forefront only matters for in-memory head caches
        let existing = sqlx::query("SELECT id, state FROM requests WHERE queue_id = $1 AND unique_key = $2")
            .bind(*queue)
            .bind(request.unique_key())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| sqlx_err("checking for existing request", e))?;

        if let Some(row) = existing {
            let id: Uuid = row.try_get("id").map_err(|e| sqlx_err("reading id", e))?;
            let state: String = row.try_get("state").map_err(|e| sqlx_err("reading state", e))?;
            return Ok(AddRequestResult {
                id: RequestId(id),
                was_already_present: true,
                was_already_handled: state == "handled",
            });
        }

        let headers = serde_json::to_value(&request.data.headers)?;
        let error_messages = serde_json::to_value(&request.data.error_messages)?;

        sqlx::query(
            "INSERT INTO requests \
             (id, queue_id, unique_key, url, loaded_url, method, payload, headers, user_data, \
              retry_count, no_retry, error_messages, state, not_before) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 'pending', $13)",
        )
        .bind(*request.id())
        .bind(*queue)
        .bind(request.unique_key())
        .bind(&request.data.url)
        .bind(&request.data.loaded_url)
        .bind(method_to_str(request.data.method))
        .bind(&request.data.payload)
        .bind(headers)
        .bind(&request.data.user_data)
        .bind(request.data.retry_count as i32)
        .bind(request.data.no_retry)
        .bind(error_messages)
        .bind(request.state.not_before)
        .execute(&self.pool)
        .await
        .map_err(|e| sqlx_err("inserting request", e))?;

        self.touch_queue(queue).await?;

        Ok(AddRequestResult { id: request.id(), was_already_present: false, was_already_handled: false })
    }

    async fn get_request(&self, queue: QueueId, id: RequestId) -> Result<Option<AnyRequest>> {
        let row = sqlx::query("SELECT * FROM requests WHERE queue_id = $1 AND id = $2")
            .bind(*queue)
            .bind(*id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| sqlx_err("get_request", e))?;
        row.as_ref().map(Self::row_to_any_request).transpose()
    }

    async fn update_request(&self, queue: QueueId, request: AnyRequest, forefront: bool) -> Result<()> {
        let id = *request.id();
        match request {
            AnyRequest::Pending(req) => {
                sqlx::query(
                    "UPDATE requests SET state = 'pending', retry_count = $3, error_messages = $4, \
                     not_before = $5, locked_until = NULL, leased_at = NULL WHERE queue_id = $1 AND id = $2",
                )
                .bind(*queue)
                .bind(id)
                .bind(req.data.retry_count as i32)
                .bind(serde_json::to_value(&req.data.error_messages)?)
                .bind(req.state.not_before)
                .execute(&self.pool)
                .await
                .map_err(|e| sqlx_err("persisting reclaimed request", e))?;
                let _ = forefront; // no in-memory head cache to reorder at this layer
            }
            AnyRequest::InProgress(req) => {
                sqlx::query(
                    "UPDATE requests SET state = 'in-progress', leased_at = $3 WHERE queue_id = $1 AND id = $2",
                )
                .bind(*queue)
                .bind(id)
                .bind(req.state.leased_at)
                .execute(&self.pool)
                .await
                .map_err(|e| sqlx_err("persisting leased request", e))?;
            }
            AnyRequest::Handled(req) => {
                sqlx::query(
                    "UPDATE requests SET state = 'handled', handled_at = $3, succeeded = $4, \
                     error_messages = $5, locked_until = NULL WHERE queue_id = $1 AND id = $2",
                )
                .bind(*queue)
                .bind(id)
                .bind(req.state.handled_at)
                .bind(req.state.succeeded)
                .bind(serde_json::to_value(&req.data.error_messages)?)
                .execute(&self.pool)
                .await
                .map_err(|e| sqlx_err("persisting handled request", e))?;
            }
        }

        self.touch_queue(queue).await?;
        Ok(())
    }

    /// Reserves up to `limit` ready rows with `UPDATE ... WHERE id IN
    /// (SELECT ... FOR UPDATE SKIP LOCKED) RETURNING id`, the same shape
    /// `PostgresRequestManager::claim_requests` uses, stamping
    /// `locked_until` so a second concurrent caller (this process or
    /// another) skips them until the reservation lapses. `had_multiple_clients`
    /// reports whether some other process's `instance_id` last touched
    /// this queue.
    async fn list_head(&self, queue: QueueId, limit: usize) -> Result<ListHeadResult> {
        let mut tx = self.pool.begin().await.map_err(|e| sqlx_err("begin list_head", e))?;

        let rows = sqlx::query(
            "UPDATE requests SET locked_until = now() + interval '30 seconds' \
             WHERE id IN ( \
                 SELECT id FROM requests \
                 WHERE queue_id = $1 AND state = 'pending' \
                     AND (not_before IS NULL OR not_before <= now()) \
                     AND (locked_until IS NULL OR locked_until <= now()) \
                 ORDER BY url ASC \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING id",
        )
        .bind(*queue)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| sqlx_err("reserving ready requests", e))?;

        let meta = sqlx::query("SELECT modified_at, last_writer_id FROM request_queues WHERE id = $1")
            .bind(*queue)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| sqlx_err("reading queue metadata", e))?;

        tx.commit().await.map_err(|e| sqlx_err("commit list_head", e))?;

        let items = rows
            .iter()
            .map(|row| row.try_get::<Uuid, _>("id").map(RequestId).map_err(|e| sqlx_err("reading reserved id", e)))
            .collect::<Result<Vec<_>>>()?;

        let (queue_modified_at, had_multiple_clients) = match meta {
            Some(row) => {
                let modified_at: DateTime<Utc> =
                    row.try_get("modified_at").map_err(|e| sqlx_err("reading modified_at", e))?;
                let last_writer_id: Option<Uuid> =
                    row.try_get("last_writer_id").map_err(|e| sqlx_err("reading last_writer_id", e))?;
                let had_multiple_clients = last_writer_id.is_some_and(|writer| writer != self.instance_id);
                (modified_at, had_multiple_clients)
            }
            None => (Utc::now(), false),
        };

        Ok(ListHeadResult { items, queue_modified_at, had_multiple_clients })
    }

    async fn handled_count(&self, queue: QueueId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM requests WHERE queue_id = $1 AND state = 'handled'")
            .bind(*queue)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| sqlx_err("handled_count", e))?;
        Ok(count as u64)
    }

    async fn get_request_queue(&self, queue: QueueId) -> Result<EntityMetadata> {
        let row = sqlx::query("SELECT id, name, created_at FROM request_queues WHERE id = $1")
            .bind(*queue)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| sqlx_err("get_request_queue", e))?
            .ok_or_else(|| CrawlError::Other(anyhow::anyhow!("request queue {queue} not found")))?;
        Ok(EntityMetadata {
            id: row.try_get("id").map_err(|e| sqlx_err("reading id", e))?,
            name: row.try_get("name").map_err(|e| sqlx_err("reading name", e))?,
            created_at: row.try_get("created_at").map_err(|e| sqlx_err("reading created_at", e))?,
        })
    }

    async fn delete_request_queue(&self, queue: QueueId) -> Result<()> {
        sqlx::query("DELETE FROM request_queues WHERE id = $1")
            .bind(*queue)
            .execute(&self.pool)
            .await
            .map_err(|e| sqlx_err("delete_request_queue", e))?;
        Ok(())
    }
}
