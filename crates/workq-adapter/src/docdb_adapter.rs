use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use futures_util::{AsyncReadExt, AsyncWriteExt, TryStreamExt};
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::gridfs::GridFsBucket;
use mongodb::options::{
    GridFsBucketOptions, IndexOptions, ReadPreference, ReturnDocument, SelectionCriteria, Tls,
    TlsOptions,
};
use mongodb::{Client, Collection, Database, IndexModel};
use tracing::{debug, error, info, warn};
use workq_config::WorkItemsConfig;
use workq_domain::{
    validate_file_size, validate_filename, DomainError, Payload, QueueName, SeedItem,
    WorkItemException, WorkItemId, WorkItemState, ITEM_TTL_SECONDS,
};

use crate::adapter::WorkItemAdapter;
use crate::error::AdapterError;
use crate::retry::{with_retry, RetryPolicy};

/// Work-item queue backed by a MongoDB-compatible document store
/// (Amazon DocumentDB in production).
///
/// Each queue of a flow gets its own collection, `{q}_work_items` and
/// `{q}_output_work_items`, holding one document per item:
///
/// ```text
/// { item_id, queue_name, parent_id, state, payload, files, exception,
///   timestamps: { created_at, reserved_at, released_at },
///   callid?, expires_at }
/// ```
///
/// Attachments at or below the configured threshold are stored base64
/// inline under `files.{name}`; larger ones go to the `{q}_files` GridFS
/// bucket with `{ gridfs_id }` left behind as the reference. A TTL index on
/// `expires_at` removes documents 7 days after creation. Reservation is a
/// single findAndModify, atomic across workers.
#[derive(Clone, Debug)]
pub struct DocDbAdapter {
    db: Database,
    bucket: GridFsBucket,
    queue: QueueName,
    output_queue: QueueName,
    orphan_timeout_minutes: u64,
    inline_threshold: usize,
    retry: RetryPolicy,
}

fn map_mongo_err(err: MongoError) -> AdapterError {
    match err.kind.as_ref() {
        ErrorKind::ServerSelection { .. }
        | ErrorKind::Io(_)
        | ErrorKind::ConnectionPoolCleared { .. } => {
            AdapterError::TransientUnavailable(err.to_string())
        }
        _ => AdapterError::Internal(err.to_string()),
    }
}

fn is_duplicate_key(err: &MongoError) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_err)) => write_err.code == 11000,
        ErrorKind::Command(command_err) => command_err.code == 11000,
        _ => false,
    }
}

fn bson_now() -> bson::DateTime {
    bson::DateTime::from_millis(Utc::now().timestamp_millis())
}

impl DocDbAdapter {
    /// Connect to the cluster, ping it, and create the per-queue
    /// collections' indexes (idempotent).
    pub async fn connect(config: &WorkItemsConfig) -> Result<Self, AdapterError> {
        let settings = config.docdb.as_ref().ok_or_else(|| {
            AdapterError::InvalidArgument("docdb settings missing from configuration".into())
        })?;

        let uri = match &settings.uri {
            Some(uri) => uri.clone(),
            None => {
                let hostname = settings.hostname.as_deref().ok_or_else(|| {
                    AdapterError::InvalidArgument("docdb hostname missing".into())
                })?;
                let auth = match (&settings.username, &settings.password) {
                    (Some(user), Some(pass)) => format!("{user}:{pass}@"),
                    _ => String::new(),
                };
                let replica = settings
                    .replica_set
                    .as_deref()
                    .map(|rs| format!("?replicaSet={rs}"))
                    .unwrap_or_default();
                format!("mongodb://{auth}{hostname}:{}/{replica}", settings.port)
            }
        };

        let mut options = mongodb::options::ClientOptions::parse(&uri)
            .await
            .map_err(map_mongo_err)?;
        options.server_selection_timeout = Some(Duration::from_secs(5));
        options.connect_timeout = Some(Duration::from_secs(10));
        options.max_pool_size = Some(50);
        options.min_pool_size = Some(5);
        options.max_idle_time = Some(Duration::from_secs(30));
        // DocumentDB does not implement retryable writes.
        options.retry_writes = Some(false);
        options.selection_criteria = Some(SelectionCriteria::ReadPreference(
            ReadPreference::PrimaryPreferred { options: Default::default() },
        ));
        if let Some(ca_file) = &settings.tls_ca_file {
            options.tls = Some(Tls::Enabled(
                TlsOptions::builder().ca_file_path(ca_file.clone()).build(),
            ));
        }

        let client = Client::with_options(options).map_err(map_mongo_err)?;
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(map_mongo_err)?;

        let db = client.database(&settings.database);
        let bucket = db.gridfs_bucket(
            GridFsBucketOptions::builder()
                .bucket_name(format!("{}_files", config.queue))
                .build(),
        );

        let adapter = Self {
            db,
            bucket,
            queue: config.queue.clone(),
            output_queue: config.queue.output(),
            orphan_timeout_minutes: config.orphan_timeout_minutes,
            inline_threshold: config.file_size_threshold,
            retry: RetryPolicy::default(),
        };
        adapter.ensure_indexes().await?;

        info!(
            database = %settings.database,
            queue = %adapter.queue,
            replica_set = settings.replica_set.as_deref().unwrap_or("none"),
            "docdb adapter initialized"
        );
        Ok(adapter)
    }

    fn collection(&self, queue: &QueueName) -> Collection<Document> {
        self.db.collection(&format!("{queue}_work_items"))
    }

    async fn ensure_indexes(&self) -> Result<(), AdapterError> {
        for queue in [&self.queue, &self.output_queue] {
            let models = vec![
                IndexModel::builder()
                    .keys(doc! { "queue_name": 1, "state": 1, "timestamps.created_at": 1 })
                    .options(
                        IndexOptions::builder()
                            .name("queue_state_created_idx".to_string())
                            .build(),
                    )
                    .build(),
                IndexModel::builder()
                    .keys(doc! { "item_id": 1 })
                    .options(
                        IndexOptions::builder()
                            .name("item_id_unique_idx".to_string())
                            .unique(true)
                            .build(),
                    )
                    .build(),
                // Sparse: only seeded items carry a callid.
                IndexModel::builder()
                    .keys(doc! { "callid": 1 })
                    .options(
                        IndexOptions::builder()
                            .name("callid_idx".to_string())
                            .unique(true)
                            .sparse(true)
                            .build(),
                    )
                    .build(),
                IndexModel::builder()
                    .keys(doc! { "state": 1, "timestamps.reserved_at": 1 })
                    .options(
                        IndexOptions::builder()
                            .name("orphan_recovery_idx".to_string())
                            .sparse(true)
                            .build(),
                    )
                    .build(),
                // Documents vanish at the instant stored in expires_at.
                IndexModel::builder()
                    .keys(doc! { "expires_at": 1 })
                    .options(
                        IndexOptions::builder()
                            .name("ttl_idx".to_string())
                            .expire_after(Duration::from_secs(0))
                            .build(),
                    )
                    .build(),
            ];
            self.collection(queue)
                .create_indexes(models)
                .await
                .map_err(map_mongo_err)?;
            debug!(queue = %queue, "collection indexes ensured");
        }
        Ok(())
    }

    /// Locate the queue holding `id`: input collection first, then output.
    async fn resolve_item_queue(&self, id: &WorkItemId) -> Result<QueueName, AdapterError> {
        for queue in [&self.queue, &self.output_queue] {
            let found = self
                .collection(queue)
                .find_one(doc! { "item_id": id.as_str() })
                .projection(doc! { "item_id": 1 })
                .await
                .map_err(map_mongo_err)?;
            if found.is_some() {
                return Ok(queue.clone());
            }
        }
        Err(AdapterError::NotFound { item_id: id.to_string() })
    }

    fn new_item_document(
        &self,
        item_id: &WorkItemId,
        queue: &QueueName,
        parent_id: Option<&WorkItemId>,
        payload: Option<&Payload>,
        callid: Option<&str>,
    ) -> Result<Document, AdapterError> {
        let payload_bson = match payload {
            Some(payload) => bson::to_bson(payload)
                .map_err(|e| AdapterError::Internal(format!("bson encode: {e}")))?,
            None => Bson::Document(Document::new()),
        };
        let now = Utc::now();
        let expires_at = bson::DateTime::from_millis(
            (now + chrono::Duration::seconds(ITEM_TTL_SECONDS as i64)).timestamp_millis(),
        );
        let parent = match parent_id.filter(|p| !p.as_str().is_empty()) {
            Some(parent) => Bson::String(parent.as_str().to_string()),
            None => Bson::Null,
        };

        let mut document = doc! {
            "item_id": item_id.as_str(),
            "queue_name": queue.as_str(),
            "parent_id": parent,
            "state": WorkItemState::Pending.as_str(),
            "payload": payload_bson,
            "files": {},
            "timestamps": { "created_at": bson::DateTime::from_millis(now.timestamp_millis()) },
            "expires_at": expires_at,
        };
        if let Some(callid) = callid {
            document.insert("callid", callid);
        }
        Ok(document)
    }

    async fn try_reserve(&self) -> Result<WorkItemId, AdapterError> {
        let reserved = self
            .collection(&self.queue)
            .find_one_and_update(
                doc! { "queue_name": self.queue.as_str(), "state": "PENDING" },
                doc! { "$set": { "state": "RESERVED", "timestamps.reserved_at": bson_now() } },
            )
            .sort(doc! { "timestamps.created_at": 1 })
            .return_document(ReturnDocument::After)
            .await
            .map_err(map_mongo_err)?;

        let document = reserved
            .ok_or_else(|| AdapterError::EmptyQueue { queue: self.queue.to_string() })?;
        let item_id = document
            .get_str("item_id")
            .map_err(|e| AdapterError::Internal(format!("malformed work item document: {e}")))?;

        info!(item_id, queue = %self.queue, "reserved input work item");
        Ok(WorkItemId::new(item_id))
    }

    async fn try_release(
        &self,
        id: &WorkItemId,
        state: WorkItemState,
        exception: Option<&WorkItemException>,
    ) -> Result<(), AdapterError> {
        let mut set = doc! {
            "state": state.as_str(),
            "timestamps.released_at": bson_now(),
        };
        if let Some(exc) = exception {
            set.insert(
                "exception",
                doc! {
                    "type": exc.type_or_default(),
                    "code": exc.code_or_default(),
                    "message": exc.message.as_str(),
                },
            );
        }

        let result = self
            .collection(&self.queue)
            .update_one(doc! { "item_id": id.as_str() }, doc! { "$set": set })
            .await
            .map_err(map_mongo_err)?;

        if result.matched_count == 0 {
            warn!(item_id = %id, "work item not found for release");
            return Ok(());
        }

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
        let document =
            self.new_item_document(item_id, &self.output_queue, Some(parent_id), payload, None)?;
        self.collection(&self.output_queue)
            .insert_one(document)
            .await
            .map_err(map_mongo_err)?;
        Ok(())
    }

    /// Read the `files` subdocument of an item, resolving its queue first.
    async fn load_files_document(
        &self,
        id: &WorkItemId,
    ) -> Result<(QueueName, Document), AdapterError> {
        let queue = self.resolve_item_queue(id).await?;
        let document = self
            .collection(&queue)
            .find_one(doc! { "item_id": id.as_str() })
            .projection(doc! { "files": 1 })
            .await
            .map_err(map_mongo_err)?;
        let files = document
            .and_then(|d| d.get_document("files").ok().cloned())
            .unwrap_or_default();
        Ok((queue, files))
    }

    async fn try_add_file(
        &self,
        id: &WorkItemId,
        name: &str,
        content: &[u8],
    ) -> Result<(), AdapterError> {
        let (queue, files) = self.load_files_document(id).await?;
        if files.contains_key(name) {
            return Err(AdapterError::FileExists {
                item_id: id.to_string(),
                name: name.to_string(),
            });
        }

        let file_data = if content.len() > self.inline_threshold {
            let mut upload = self
                .bucket
                .open_upload_stream(format!("{id}/{name}"))
                .metadata(doc! { "item_id": id.as_str(), "original_name": name })
                .await
                .map_err(map_mongo_err)?;
            let gridfs_id = upload.id().clone();
            upload
                .write_all(content)
                .await
                .map_err(|e| AdapterError::Internal(format!("gridfs upload: {e}")))?;
            upload
                .close()
                .await
                .map_err(|e| AdapterError::Internal(format!("gridfs upload: {e}")))?;
            debug!(item_id = %id, name, size = content.len(), "stored large file in gridfs");
            Bson::Document(doc! { "gridfs_id": gridfs_id })
        } else {
            debug!(item_id = %id, name, size = content.len(), "stored small file inline");
            Bson::String(BASE64.encode(content))
        };

        let mut set = Document::new();
        set.insert(format!("files.{name}"), file_data);
        self.collection(&queue)
            .update_one(doc! { "item_id": id.as_str() }, doc! { "$set": set })
            .await
            .map_err(map_mongo_err)?;
        Ok(())
    }
}

#[async_trait]
impl WorkItemAdapter for DocDbAdapter {
    async fn reserve_input(&self) -> Result<WorkItemId, AdapterError> {
        info!(queue = %self.queue, "reserving next input work item from docdb queue");
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
        let exception = match (state, exception) {
            (WorkItemState::Failed, Some(exc)) if !exc.message.is_empty() => Some(exc),
            (WorkItemState::Failed, _) => return Err(DomainError::MissingException.into()),
            _ => None,
        };

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
        let item_id = WorkItemId::generate();
        let document = self.new_item_document(
            &item_id,
            &self.queue,
            seed.parent_id.as_ref(),
            seed.payload.as_ref(),
            seed.callid.as_deref(),
        )?;

        match self.collection(&self.queue).insert_one(document).await {
            Ok(_) => {}
            Err(err) if is_duplicate_key(&err) && seed.callid.is_some() => {
                let callid = seed.callid.unwrap();
                warn!(callid, "duplicate callid detected");
                return Err(AdapterError::DuplicateCallId { callid });
            }
            Err(err) => return Err(map_mongo_err(err)),
        }

        for (name, content) in &seed.files {
            self.add_file(&item_id, name, content).await?;
        }

        info!(item_id = %item_id, queue = %self.queue, callid = ?seed.callid,
            "seeded input work item");
        Ok(item_id)
    }

    async fn load_payload(&self, id: &WorkItemId) -> Result<Payload, AdapterError> {
        with_retry(&self.retry, "load_payload", || async move {
            let queue = self.resolve_item_queue(id).await?;
            let document = self
                .collection(&queue)
                .find_one(doc! { "item_id": id.as_str() })
                .projection(doc! { "payload": 1 })
                .await
                .map_err(map_mongo_err)?
                .ok_or_else(|| AdapterError::NotFound { item_id: id.to_string() })?;

            let payload = document
                .get("payload")
                .cloned()
                .unwrap_or(Bson::Document(Document::new()));
            Ok(payload.into())
        })
        .await
    }

    async fn save_payload(&self, id: &WorkItemId, payload: &Payload) -> Result<(), AdapterError> {
        with_retry(&self.retry, "save_payload", || async move {
            let queue = self.resolve_item_queue(id).await?;
            let payload_bson = bson::to_bson(payload)
                .map_err(|e| AdapterError::Internal(format!("bson encode: {e}")))?;
            let result = self
                .collection(&queue)
                .update_one(
                    doc! { "item_id": id.as_str() },
                    doc! { "$set": { "payload": payload_bson } },
                )
                .await
                .map_err(map_mongo_err)?;
            if result.matched_count == 0 {
                return Err(AdapterError::NotFound { item_id: id.to_string() });
            }
            debug!(item_id = %id, "saved payload");
            Ok(())
        })
        .await
    }

    async fn list_files(&self, id: &WorkItemId) -> Result<Vec<String>, AdapterError> {
        with_retry(&self.retry, "list_files", || async move {
            let (_, files) = self.load_files_document(id).await?;
            let mut names: Vec<String> = files.keys().cloned().collect();
            names.sort();
            Ok(names)
        })
        .await
    }

    async fn get_file(&self, id: &WorkItemId, name: &str) -> Result<Vec<u8>, AdapterError> {
        with_retry(&self.retry, "get_file", || async move {
            let (_, files) = self.load_files_document(id).await?;
            let file_data = files.get(name).ok_or_else(|| AdapterError::FileNotFound {
                item_id: id.to_string(),
                name: name.to_string(),
            })?;

            match file_data {
                Bson::String(encoded) => BASE64.decode(encoded).map_err(|e| {
                    AdapterError::Internal(format!("corrupt inline file {name}: {e}"))
                }),
                Bson::Document(reference) => {
                    let gridfs_id = reference.get("gridfs_id").cloned().ok_or_else(|| {
                        AdapterError::Internal(format!("invalid file reference for {name}"))
                    })?;
                    let mut stream = self
                        .bucket
                        .open_download_stream(gridfs_id)
                        .await
                        .map_err(map_mongo_err)?;
                    let mut content = Vec::new();
                    stream
                        .read_to_end(&mut content)
                        .await
                        .map_err(|e| AdapterError::Internal(format!("gridfs download: {e}")))?;
                    Ok(content)
                }
                other => Err(AdapterError::Internal(format!(
                    "invalid file data format for {name}: {other:?}"
                ))),
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
            let (queue, files) = self.load_files_document(id).await?;
            let file_data = files.get(name).ok_or_else(|| AdapterError::FileNotFound {
                item_id: id.to_string(),
                name: name.to_string(),
            })?;

            // Delete the blob before unsetting the reference.
            if let Bson::Document(reference) = file_data {
                if let Some(gridfs_id) = reference.get("gridfs_id") {
                    self.bucket
                        .delete(gridfs_id.clone())
                        .await
                        .map_err(map_mongo_err)?;
                }
            }

            let mut unset = Document::new();
            unset.insert(format!("files.{name}"), "");
            self.collection(&queue)
                .update_one(doc! { "item_id": id.as_str() }, doc! { "$unset": unset })
                .await
                .map_err(map_mongo_err)?;

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
        let cutoff = bson::DateTime::from_millis(
            (Utc::now() - chrono::Duration::minutes(timeout as i64)).timestamp_millis(),
        );

        let collection = self.collection(&self.queue);
        let mut orphans = collection
            .find(doc! {
                "state": "RESERVED",
                "timestamps.reserved_at": { "$lt": cutoff },
            })
            .projection(doc! { "item_id": 1 })
            .await
            .map_err(map_mongo_err)?;

        let mut recovered = Vec::new();
        while let Some(document) = orphans.try_next().await.map_err(map_mongo_err)? {
            let Ok(item_id) = document.get_str("item_id") else { continue };

            let result = collection
                .update_one(
                    doc! { "item_id": item_id },
                    doc! {
                        "$set": { "state": "PENDING" },
                        "$unset": { "timestamps.reserved_at": "" },
                    },
                )
                .await
                .map_err(map_mongo_err)?;

            if result.modified_count > 0 {
                warn!(item_id, "recovered orphaned work item");
                recovered.push(WorkItemId::new(item_id));
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
// Gated behind TEST_DOCDB_URI. Run with:
//   docker run -d --name workq-mongo -p 27017:27017 mongo:7
//   TEST_DOCDB_URI=mongodb://127.0.0.1:27017 cargo test -p workq-adapter -- --ignored docdb
