use std::path::Path;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, ConnectionAddr, ConnectionInfo, Direction, RedisConnectionInfo};
use tracing::{debug, error, info, warn};
use workq_config::WorkItemsConfig;
use workq_domain::{
    validate_file_size, validate_filename, DomainError, Payload, QueueName, SeedItem,
    WorkItemException, WorkItemId, WorkItemState, EXCEPTION_TTL_SECONDS, ITEM_TTL_SECONDS,
};

use crate::adapter::WorkItemAdapter;
use crate::error::AdapterError;
use crate::fs_store::FsBlobStore;
use crate::retry::{with_retry, RetryPolicy};

/// Work-item queue backed by Redis, for horizontally scaled workers.
///
/// Key schema, namespaced per queue:
///
/// | Key | Kind | Meaning |
/// |---|---|---|
/// | `{q}:pending` | list | FIFO: pushed at head, reserved from tail |
/// | `{q}:processing` | list | currently RESERVED ids |
/// | `{q}:done`, `{q}:failed` | set | terminal ids |
/// | `{q}:payload:{id}` | hash | `payload` (JSON), `queue_name`, `state` |
/// | `{q}:files:{id}` | hash | filename to base64 inline or `file://` path |
/// | `{q}:timestamps:{id}` | hash | `created_at`, `reserved_at`, `released_at` |
/// | `{q}:exception:{id}` | hash | `type`, `code`, `message` (24 h TTL) |
/// | `{q}:state:{id}` | string | terminal state marker |
/// | `{q}:parent:{id}` | string | parent id |
/// | `origin_queue:{id}` | string | which queue holds the id (hint, 7 d TTL) |
///
/// Every per-id key carries a 7-day TTL. Reservation is a single atomic
/// `LMOVE` from the pending tail to the processing head, so concurrent
/// workers can never pop the same id.
#[derive(Clone)]
pub struct RedisAdapter {
    conn: ConnectionManager,
    queue: QueueName,
    output_queue: QueueName,
    files: FsBlobStore,
    orphan_timeout_minutes: u64,
    inline_threshold: usize,
    retry: RetryPolicy,
}

impl std::fmt::Debug for RedisAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisAdapter")
            .field("queue", &self.queue)
            .field("output_queue", &self.output_queue)
            .field("files", &self.files)
            .field("orphan_timeout_minutes", &self.orphan_timeout_minutes)
            .field("inline_threshold", &self.inline_threshold)
            .field("retry", &self.retry)
            .finish()
    }
}

fn map_redis_err(err: redis::RedisError) -> AdapterError {
    if err.is_io_error()
        || err.is_timeout()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
    {
        AdapterError::TransientUnavailable(err.to_string())
    } else {
        AdapterError::Internal(err.to_string())
    }
}

impl RedisAdapter {
    /// Connect, ping the server, and hand out the adapter.
    ///
    /// The managed connection multiplexes all commands over one
    /// auto-reconnecting socket and is cheap to clone per call.
    pub async fn connect(config: &WorkItemsConfig) -> Result<Self, AdapterError> {
        let settings = config.redis.as_ref().ok_or_else(|| {
            AdapterError::InvalidArgument("redis settings missing from configuration".into())
        })?;

        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(settings.host.clone(), settings.port),
            redis: RedisConnectionInfo {
                db: settings.db,
                password: settings.password.clone(),
                ..Default::default()
            },
        };
        let client = Client::open(info).map_err(map_redis_err)?;
        let mut conn = client.get_connection_manager().await.map_err(map_redis_err)?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_err)?;

        let adapter = Self {
            conn,
            queue: config.queue.clone(),
            output_queue: config.queue.output(),
            files: FsBlobStore::open(&config.files_dir)?,
            orphan_timeout_minutes: config.orphan_timeout_minutes,
            inline_threshold: config.file_size_threshold,
            retry: RetryPolicy::default(),
        };

        info!(
            host = %settings.host,
            port = settings.port,
            db = settings.db,
            queue = %adapter.queue,
            max_connections = settings.max_connections,
            "redis adapter initialized"
        );
        Ok(adapter)
    }

    fn queue_key(&self, queue: &QueueName, suffix: &str) -> String {
        format!("{queue}:{suffix}")
    }

    fn item_key(&self, queue: &QueueName, suffix: &str, id: &WorkItemId) -> String {
        format!("{queue}:{suffix}:{id}")
    }

    fn origin_key(id: &WorkItemId) -> String {
        format!("origin_queue:{id}")
    }

    /// Locate the queue holding `id`: the input queue first, then the
    /// origin-queue hint (verified, never trusted blindly), then the
    /// output queue.
    async fn resolve_item_queue(&self, id: &WorkItemId) -> Result<QueueName, AdapterError> {
        let mut conn = self.conn.clone();

        let in_input: bool = conn
            .hexists(self.item_key(&self.queue, "payload", id), "payload")
            .await
            .map_err(map_redis_err)?;
        if in_input {
            return Ok(self.queue.clone());
        }

        let origin: Option<String> =
            conn.get(Self::origin_key(id)).await.map_err(map_redis_err)?;
        if let Some(origin) = origin {
            let origin = QueueName::new(origin);
            let found: bool = conn
                .hexists(self.item_key(&origin, "payload", id), "payload")
                .await
                .map_err(map_redis_err)?;
            if found {
                return Ok(origin);
            }
        }

        let in_output: bool = conn
            .hexists(self.item_key(&self.output_queue, "payload", id), "payload")
            .await
            .map_err(map_redis_err)?;
        if in_output {
            return Ok(self.output_queue.clone());
        }

        Err(AdapterError::NotFound { item_id: id.to_string() })
    }

    /// Write the metadata keys for a fresh PENDING item. The caller pushes
    /// onto `{queue}:pending` afterwards, once everything else is in place.
    async fn insert_item(
        &self,
        queue: &QueueName,
        item_id: &WorkItemId,
        parent_id: Option<&WorkItemId>,
        payload: Option<&Payload>,
    ) -> Result<(), AdapterError> {
        let mut conn = self.conn.clone();
        let payload_json = match payload {
            Some(payload) => serde_json::to_string(payload)?,
            None => "{}".to_string(),
        };

        let payload_key = self.item_key(queue, "payload", item_id);
        let _: () = conn
            .hset_multiple(
                &payload_key,
                &[
                    ("payload", payload_json.as_str()),
                    ("queue_name", queue.as_str()),
                    ("state", WorkItemState::Pending.as_str()),
                ],
            )
            .await
            .map_err(map_redis_err)?;
        let _: () = conn
            .expire(&payload_key, ITEM_TTL_SECONDS as i64)
            .await
            .map_err(map_redis_err)?;

        if let Some(parent) = parent_id.filter(|p| !p.as_str().is_empty()) {
            let parent_key = self.item_key(queue, "parent", item_id);
            let _: () = conn
                .set_ex(&parent_key, parent.as_str(), ITEM_TTL_SECONDS)
                .await
                .map_err(map_redis_err)?;
        }

        let ts_key = self.item_key(queue, "timestamps", item_id);
        let _: () = conn
            .hset(&ts_key, "created_at", Utc::now().to_rfc3339())
            .await
            .map_err(map_redis_err)?;
        let _: () = conn
            .expire(&ts_key, ITEM_TTL_SECONDS as i64)
            .await
            .map_err(map_redis_err)?;

        Ok(())
    }

    async fn try_reserve(&self) -> Result<WorkItemId, AdapterError> {
        let mut conn = self.conn.clone();
        let pending = self.queue_key(&self.queue, "pending");
        let processing = self.queue_key(&self.queue, "processing");

        // Atomic move: pending tail to processing head.
        let popped: Option<String> = conn
            .lmove(&pending, &processing, Direction::Right, Direction::Left)
            .await
            .map_err(map_redis_err)?;

        let Some(id) = popped else {
            return Err(AdapterError::EmptyQueue { queue: self.queue.to_string() });
        };
        let id = WorkItemId(id);

        let _: () = conn
            .hset(
                self.item_key(&self.queue, "timestamps", &id),
                "reserved_at",
                Utc::now().to_rfc3339(),
            )
            .await
            .map_err(map_redis_err)?;
        let _: () = conn
            .hset(
                self.item_key(&self.queue, "payload", &id),
                "state",
                WorkItemState::Reserved.as_str(),
            )
            .await
            .map_err(map_redis_err)?;

        info!(item_id = %id, queue = %self.queue, "reserved input work item");
        Ok(id)
    }

    async fn try_release(
        &self,
        id: &WorkItemId,
        state: WorkItemState,
        exception: Option<&WorkItemException>,
    ) -> Result<(), AdapterError> {
        let mut conn = self.conn.clone();

        let known: bool = conn
            .hexists(self.item_key(&self.queue, "payload", id), "payload")
            .await
            .map_err(map_redis_err)?;
        if !known {
            warn!(item_id = %id, "work item not found for release");
            return Ok(());
        }

        let _: () = conn
            .lrem(self.queue_key(&self.queue, "processing"), 0, id.as_str())
            .await
            .map_err(map_redis_err)?;

        match state {
            WorkItemState::Completed => {
                let _: () = conn
                    .sadd(self.queue_key(&self.queue, "done"), id.as_str())
                    .await
                    .map_err(map_redis_err)?;
            }
            WorkItemState::Failed => {
                let _: () = conn
                    .sadd(self.queue_key(&self.queue, "failed"), id.as_str())
                    .await
                    .map_err(map_redis_err)?;
                if let Some(exc) = exception {
                    let exc_key = self.item_key(&self.queue, "exception", id);
                    let _: () = conn
                        .hset_multiple(
                            &exc_key,
                            &[
                                ("type", exc.type_or_default()),
                                ("code", exc.code_or_default()),
                                ("message", exc.message.as_str()),
                            ],
                        )
                        .await
                        .map_err(map_redis_err)?;
                    let _: () = conn
                        .expire(&exc_key, EXCEPTION_TTL_SECONDS as i64)
                        .await
                        .map_err(map_redis_err)?;
                }
            }
            _ => unreachable!("validated terminal"),
        }

        let _: () = conn
            .hset(
                self.item_key(&self.queue, "timestamps", id),
                "released_at",
                Utc::now().to_rfc3339(),
            )
            .await
            .map_err(map_redis_err)?;
        let _: () = conn
            .set(self.item_key(&self.queue, "state", id), state.as_str())
            .await
            .map_err(map_redis_err)?;
        let _: () = conn
            .hset(self.item_key(&self.queue, "payload", id), "state", state.as_str())
            .await
            .map_err(map_redis_err)?;

        if state == WorkItemState::Failed {
            error!(item_id = %id, queue = %self.queue, exception = ?exception,
                "released work item as FAILED");
        } else {
            info!(item_id = %id, queue = %self.queue, "released work item as COMPLETED");
        }
        Ok(())
    }

    async fn try_create_output(
        &self,
        item_id: &WorkItemId,
        parent_id: &WorkItemId,
        payload: Option<&Payload>,
    ) -> Result<(), AdapterError> {
        self.insert_item(&self.output_queue, item_id, Some(parent_id), payload)
            .await?;

        let mut conn = self.conn.clone();
        let _: () = conn
            .lpush(self.queue_key(&self.output_queue, "pending"), item_id.as_str())
            .await
            .map_err(map_redis_err)?;
        // Origin hint so payload/file calls can find the output later.
        let _: () = conn
            .set_ex(
                Self::origin_key(item_id),
                self.output_queue.as_str(),
                ITEM_TTL_SECONDS,
            )
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }

    async fn try_add_file(
        &self,
        id: &WorkItemId,
        name: &str,
        content: &[u8],
    ) -> Result<(), AdapterError> {
        let queue = self.resolve_item_queue(id).await?;
        let mut conn = self.conn.clone();
        let files_key = self.item_key(&queue, "files", id);

        let exists: bool = conn.hexists(&files_key, name).await.map_err(map_redis_err)?;
        if exists {
            return Err(AdapterError::FileExists {
                item_id: id.to_string(),
                name: name.to_string(),
            });
        }

        if content.len() > self.inline_threshold {
            let path = self.files.write(id, name, content)?;
            let _: () = conn
                .hset(&files_key, name, format!("file://{}", path.display()))
                .await
                .map_err(map_redis_err)?;
            debug!(item_id = %id, name, size = content.len(), "stored large file on filesystem");
        } else {
            let _: () = conn
                .hset(&files_key, name, BASE64.encode(content))
                .await
                .map_err(map_redis_err)?;
            debug!(item_id = %id, name, size = content.len(), "stored small file inline");
        }

        let _: () = conn
            .expire(&files_key, ITEM_TTL_SECONDS as i64)
            .await
            .map_err(map_redis_err)?;
        Ok(())
    }
}

#[async_trait]
impl WorkItemAdapter for RedisAdapter {
    async fn reserve_input(&self) -> Result<WorkItemId, AdapterError> {
        info!(queue = %self.queue, "reserving next input work item from redis queue");
        with_retry(&self.retry, "reserve_input", || self.try_reserve()).await
    }

    async fn release_input(
        &self,
        id: &WorkItemId,
        state: WorkItemState,
        exception: Option<WorkItemException>,
    ) -> Result<(), AdapterError> {
        if !state.is_terminal() {
            return Err(DomainError::NotATerminalState(state).into());
        }
        match (state, &exception) {
            (WorkItemState::Failed, Some(exc)) if !exc.message.is_empty() => {}
            (WorkItemState::Failed, _) => return Err(DomainError::MissingException.into()),
            _ => {}
        }

        with_retry(&self.retry, "release_input", || {
            self.try_release(id, state, exception.as_ref())
        })
        .await
    }

    async fn create_output(
        &self,
        parent_id: &WorkItemId,
        payload: Option<Payload>,
    ) -> Result<WorkItemId, AdapterError> {
        let item_id = WorkItemId::generate();

        with_retry(&self.retry, "create_output", || {
            self.try_create_output(&item_id, parent_id, payload.as_ref())
        })
        .await?;

        info!(item_id = %item_id, queue = %self.output_queue, "created output work item");
        Ok(item_id)
    }

    async fn seed_input(&self, seed: SeedItem) -> Result<WorkItemId, AdapterError> {
        if seed.callid.is_some() {
            debug!("callid deduplication is not supported by the redis backend, ignoring");
        }
        let item_id = WorkItemId::generate();
        self.insert_item(&self.queue, &item_id, seed.parent_id.as_ref(), seed.payload.as_ref())
            .await?;

        for (name, content) in &seed.files {
            self.add_file(&item_id, name, content).await?;
        }

        let mut conn = self.conn.clone();
        let _: () = conn
            .lpush(self.queue_key(&self.queue, "pending"), item_id.as_str())
            .await
            .map_err(map_redis_err)?;

        info!(item_id = %item_id, queue = %self.queue, "seeded input work item");
        Ok(item_id)
    }

    async fn load_payload(&self, id: &WorkItemId) -> Result<Payload, AdapterError> {
        with_retry(&self.retry, "load_payload", || async move {
            let queue = self.resolve_item_queue(id).await?;
            let mut conn = self.conn.clone();
            let payload_json: Option<String> = conn
                .hget(self.item_key(&queue, "payload", id), "payload")
                .await
                .map_err(map_redis_err)?;
            let payload_json =
                payload_json.ok_or_else(|| AdapterError::NotFound { item_id: id.to_string() })?;
            Ok(serde_json::from_str(&payload_json)?)
        })
        .await
    }

    async fn save_payload(&self, id: &WorkItemId, payload: &Payload) -> Result<(), AdapterError> {
        with_retry(&self.retry, "save_payload", || async move {
            let queue = self.resolve_item_queue(id).await?;
            let mut conn = self.conn.clone();
            let payload_key = self.item_key(&queue, "payload", id);
            let payload_json = serde_json::to_string(payload)?;
            let _: () = conn
                .hset(&payload_key, "payload", payload_json)
                .await
                .map_err(map_redis_err)?;
            // Saving extends the item's lease on life.
            let _: () = conn
                .expire(&payload_key, ITEM_TTL_SECONDS as i64)
                .await
                .map_err(map_redis_err)?;
            debug!(item_id = %id, "saved payload");
            Ok(())
        })
        .await
    }

    async fn list_files(&self, id: &WorkItemId) -> Result<Vec<String>, AdapterError> {
        with_retry(&self.retry, "list_files", || async move {
            let queue = self.resolve_item_queue(id).await?;
            let mut conn = self.conn.clone();
            let mut names: Vec<String> = conn
                .hkeys(self.item_key(&queue, "files", id))
                .await
                .map_err(map_redis_err)?;
            names.sort();
            Ok(names)
        })
        .await
    }

    async fn get_file(&self, id: &WorkItemId, name: &str) -> Result<Vec<u8>, AdapterError> {
        with_retry(&self.retry, "get_file", || async move {
            let queue = self.resolve_item_queue(id).await?;
            let mut conn = self.conn.clone();
            let file_ref: Option<String> = conn
                .hget(self.item_key(&queue, "files", id), name)
                .await
                .map_err(map_redis_err)?;
            let file_ref = file_ref.ok_or_else(|| AdapterError::FileNotFound {
                item_id: id.to_string(),
                name: name.to_string(),
            })?;

            match file_ref.strip_prefix("file://") {
                Some(path) => self.files.read(Path::new(path)),
                None => BASE64.decode(&file_ref).map_err(|e| {
                    AdapterError::Internal(format!("corrupt inline file {name}: {e}"))
                }),
            }
        })
        .await
    }

    async fn add_file(
        &self,
        id: &WorkItemId,
        name: &str,
        content: &[u8],
    ) -> Result<(), AdapterError> {
        validate_filename(name)?;
        validate_file_size(content.len())?;
        with_retry(&self.retry, "add_file", || self.try_add_file(id, name, content)).await
    }

    async fn remove_file(&self, id: &WorkItemId, name: &str) -> Result<(), AdapterError> {
        with_retry(&self.retry, "remove_file", || async move {
            let queue = self.resolve_item_queue(id).await?;
            let mut conn = self.conn.clone();
            let files_key = self.item_key(&queue, "files", id);

            let file_ref: Option<String> =
                conn.hget(&files_key, name).await.map_err(map_redis_err)?;
            let file_ref = file_ref.ok_or_else(|| AdapterError::FileNotFound {
                item_id: id.to_string(),
                name: name.to_string(),
            })?;

            if let Some(path) = file_ref.strip_prefix("file://") {
                self.files.remove(Path::new(path))?;
            }
            let _: () = conn.hdel(&files_key, name).await.map_err(map_redis_err)?;
            info!(item_id = %id, name, "removed file from work item");
            Ok(())
        })
        .await
    }

    async fn recover_orphaned_work_items(
        &self,
        timeout_minutes: Option<u64>,
    ) -> Result<Vec<WorkItemId>, AdapterError> {
        let timeout = timeout_minutes.unwrap_or(self.orphan_timeout_minutes);
        let cutoff = Utc::now() - chrono::Duration::minutes(timeout as i64);
        let mut conn = self.conn.clone();

        let pending = self.queue_key(&self.queue, "pending");
        let processing = self.queue_key(&self.queue, "processing");

        let processing_ids: Vec<String> = conn
            .lrange(&processing, 0, -1)
            .await
            .map_err(map_redis_err)?;

        let mut recovered = Vec::new();
        for raw_id in processing_ids {
            let id = WorkItemId(raw_id);
            let ts_key = self.item_key(&self.queue, "timestamps", &id);

            let reserved_at: Option<String> =
                conn.hget(&ts_key, "reserved_at").await.map_err(map_redis_err)?;
            let Some(raw) = reserved_at else { continue };
            let Ok(reserved_at) = DateTime::parse_from_rfc3339(&raw) else { continue };

            if reserved_at.with_timezone(&Utc) < cutoff {
                let _: () = conn
                    .lrem(&processing, 0, id.as_str())
                    .await
                    .map_err(map_redis_err)?;
                let _: () = conn.lpush(&pending, id.as_str()).await.map_err(map_redis_err)?;
                let _: () = conn
                    .hdel(&ts_key, "reserved_at")
                    .await
                    .map_err(map_redis_err)?;
                let _: () = conn
                    .hset(
                        self.item_key(&self.queue, "payload", &id),
                        "state",
                        WorkItemState::Pending.as_str(),
                    )
                    .await
                    .map_err(map_redis_err)?;
                warn!(item_id = %id, "recovered orphaned work item");
                recovered.push(id);
            }
        }

        if recovered.is_empty() {
            debug!(timeout_minutes = timeout, "no orphaned work items found");
        } else {
            info!(count = recovered.len(), timeout_minutes = timeout,
                "recovered orphaned work items");
        }
        Ok(recovered)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
//
// Gated behind TEST_REDIS_HOST. Run with:
//   docker run -d --name workq-redis -p 6379:6379 redis:7
//   TEST_REDIS_HOST=127.0.0.1 cargo test -p workq-adapter -- --ignored redis
