use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{ConnectOptions, Connection, SqlitePool};
use tracing::{debug, error, info, warn};
use workq_config::WorkItemsConfig;
use workq_domain::{
    validate_file_size, validate_filename, DomainError, Payload, QueueName, SeedItem,
    WorkItemException, WorkItemId, WorkItemState,
};

use crate::adapter::WorkItemAdapter;
use crate::error::AdapterError;
use crate::fs_store::FsBlobStore;
use crate::retry::{with_retry, RetryPolicy};

/// Highest schema version this build knows how to reach.
const SCHEMA_VERSION: i64 = 4;

// ── Migrations ────────────────────────────────────────────────────────────────
//
// Applied in order inside one transaction each; schema_version records the
// high-water mark. v4 rebuilds work_items because SQLite cannot alter a
// CHECK constraint in place.

// v1: initial schema. The state CHECK still carries the legacy DONE value.
const MIGRATION_V1: &[&str] = &[
    "CREATE TABLE work_items (
        id TEXT PRIMARY KEY,
        queue_name TEXT NOT NULL,
        parent_id TEXT,
        payload TEXT,
        state TEXT DEFAULT 'PENDING'
            CHECK(state IN ('PENDING', 'RESERVED', 'DONE', 'FAILED')),
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY (parent_id) REFERENCES work_items(id)
    )",
    "CREATE INDEX idx_queue_state ON work_items(queue_name, state, created_at)",
    "CREATE INDEX idx_parent ON work_items(parent_id)",
    "CREATE TABLE work_item_files (
        work_item_id TEXT NOT NULL,
        filename TEXT NOT NULL,
        filepath TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        PRIMARY KEY (work_item_id, filename),
        FOREIGN KEY (work_item_id) REFERENCES work_items(id) ON DELETE CASCADE
    )",
];

// v2: exception capture on failed releases.
const MIGRATION_V2: &[&str] = &[
    "ALTER TABLE work_items ADD COLUMN exception_type TEXT",
    "ALTER TABLE work_items ADD COLUMN exception_code TEXT",
    "ALTER TABLE work_items ADD COLUMN exception_message TEXT",
];

// v3: lifecycle timestamps and the partial index the orphan sweep scans.
const MIGRATION_V3: &[&str] = &[
    "ALTER TABLE work_items ADD COLUMN reserved_at TEXT",
    "ALTER TABLE work_items ADD COLUMN released_at TEXT",
    "CREATE INDEX idx_orphan_check ON work_items(state, reserved_at)
        WHERE state = 'RESERVED'",
];

// v4: replace DONE with COMPLETED in the CHECK constraint. Requires a
// shadow-table rebuild; existing DONE rows are rewritten on the way over.
const MIGRATION_V4: &[&str] = &[
    "CREATE TABLE work_items_new (
        id TEXT PRIMARY KEY,
        queue_name TEXT NOT NULL,
        parent_id TEXT,
        payload TEXT,
        state TEXT DEFAULT 'PENDING'
            CHECK(state IN ('PENDING', 'RESERVED', 'COMPLETED', 'FAILED')),
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        exception_type TEXT,
        exception_code TEXT,
        exception_message TEXT,
        reserved_at TEXT,
        released_at TEXT,
        FOREIGN KEY (parent_id) REFERENCES work_items_new(id)
    )",
    "INSERT INTO work_items_new
     SELECT id, queue_name, parent_id, payload,
            CASE WHEN state = 'DONE' THEN 'COMPLETED' ELSE state END,
            created_at, exception_type, exception_code, exception_message,
            reserved_at, released_at
     FROM work_items",
    "DROP INDEX IF EXISTS idx_queue_state",
    "DROP INDEX IF EXISTS idx_parent",
    "DROP INDEX IF EXISTS idx_orphan_check",
    "DROP TABLE work_items",
    "ALTER TABLE work_items_new RENAME TO work_items",
    "CREATE INDEX idx_queue_state ON work_items(queue_name, state, created_at)",
    "CREATE INDEX idx_parent ON work_items(parent_id)",
    "CREATE INDEX idx_orphan_check ON work_items(state, reserved_at)
        WHERE state = 'RESERVED'",
];

fn migration_statements(version: i64) -> &'static [&'static str] {
    match version {
        1 => MIGRATION_V1,
        2 => MIGRATION_V2,
        3 => MIGRATION_V3,
        4 => MIGRATION_V4,
        _ => &[],
    }
}

async fn apply_migration(conn: &mut SqliteConnection, version: i64) -> Result<(), AdapterError> {
    info!(version, "applying schema migration");
    let mut tx = conn.begin().await.map_err(map_sqlx_err)?;
    for statement in migration_statements(version) {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
    }
    sqlx::query("INSERT INTO schema_version (version) VALUES (?1)")
        .bind(version)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;
    tx.commit().await.map_err(map_sqlx_err)
}

/// Bring the database at `path` up to [`SCHEMA_VERSION`].
///
/// Runs on a dedicated connection with foreign-key enforcement off: the v4
/// rebuild drops and renames a table that work_item_files references, and
/// the implicit delete of DROP TABLE must not cascade into the file rows.
async fn migrate(path: &Path) -> Result<(), AdapterError> {
    let mut conn = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(false)
        .connect()
        .await
        .map_err(map_sqlx_err)?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(&mut conn)
    .await
    .map_err(map_sqlx_err)?;

    let current: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
        .fetch_one(&mut conn)
        .await
        .map_err(map_sqlx_err)?;

    if current > SCHEMA_VERSION {
        return Err(AdapterError::SchemaVersionMismatch {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }

    for version in (current + 1)..=SCHEMA_VERSION {
        apply_migration(&mut conn, version).await?;
    }

    conn.close().await.map_err(map_sqlx_err)?;
    debug!(version = SCHEMA_VERSION, "database schema up to date");
    Ok(())
}

fn map_sqlx_err(err: sqlx::Error) -> AdapterError {
    match &err {
        sqlx::Error::PoolTimedOut => AdapterError::PoolExhausted(err.to_string()),
        sqlx::Error::Database(db) if db.message().contains("database is locked") => {
            AdapterError::TransientUnavailable(err.to_string())
        }
        _ => AdapterError::Internal(err.to_string()),
    }
}

// ── Adapter ───────────────────────────────────────────────────────────────────

/// Work-item queue backed by an embedded SQLite database.
///
/// Both queues of a flow share one `work_items` table, discriminated by
/// `queue_name`. Attachments always live on the filesystem at
/// `{files_dir}/{item_id}/{filename}`, referenced from `work_item_files`.
/// Suitable for local development and single-host deployments; no TTL is
/// applied, items are retained indefinitely.
#[derive(Clone, Debug)]
pub struct SqliteAdapter {
    pool: SqlitePool,
    queue: QueueName,
    output_queue: QueueName,
    files: FsBlobStore,
    orphan_timeout_minutes: u64,
    retry: RetryPolicy,
}

impl SqliteAdapter {
    /// Open (or create) the database, run pending migrations, and set up
    /// the connection pool (WAL, synchronous=NORMAL, 5 s busy timeout).
    pub async fn connect(config: &WorkItemsConfig) -> Result<Self, AdapterError> {
        let settings = config.sqlite.as_ref().ok_or_else(|| {
            AdapterError::InvalidArgument("sqlite settings missing from configuration".into())
        })?;

        if let Some(parent) = settings.db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AdapterError::Internal(format!("create db dir: {e}")))?;
        }

        migrate(&settings.db_path).await?;

        let options = SqliteConnectOptions::new()
            .filename(&settings.db_path)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(map_sqlx_err)?;

        let adapter = Self {
            pool,
            queue: config.queue.clone(),
            output_queue: config.queue.output(),
            files: FsBlobStore::open(&config.files_dir)?,
            orphan_timeout_minutes: config.orphan_timeout_minutes,
            retry: RetryPolicy::default(),
        };

        info!(
            db = %settings.db_path.display(),
            queue = %adapter.queue,
            files_dir = %config.files_dir.display(),
            "sqlite adapter initialized"
        );
        Ok(adapter)
    }

    async fn try_reserve(&self) -> Result<WorkItemId, AdapterError> {
        let reserved: Option<String> = sqlx::query_scalar(
            "UPDATE work_items
             SET state = 'RESERVED', reserved_at = ?1
             WHERE id = (
                 SELECT id FROM work_items
                 WHERE queue_name = ?2 AND state = 'PENDING'
                 ORDER BY created_at ASC, id ASC
                 LIMIT 1
             )
             RETURNING id",
        )
        .bind(Utc::now())
        .bind(self.queue.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        match reserved {
            Some(id) => {
                info!(item_id = %id, queue = %self.queue, "reserved input work item");
                Ok(WorkItemId(id))
            }
            None => Err(AdapterError::EmptyQueue { queue: self.queue.to_string() }),
        }
    }

    async fn insert_item(
        &self,
        item_id: &WorkItemId,
        queue: &QueueName,
        parent_id: Option<&WorkItemId>,
        payload: Option<Payload>,
    ) -> Result<(), AdapterError> {
        let payload_json =
            serde_json::to_string(&payload.unwrap_or_else(|| Payload::Object(Default::default())))?;
        sqlx::query(
            "INSERT INTO work_items (id, queue_name, parent_id, payload, state, created_at)
             VALUES (?1, ?2, ?3, ?4, 'PENDING', ?5)",
        )
        .bind(item_id.as_str())
        .bind(queue.as_str())
        .bind(parent_id.filter(|p| !p.as_str().is_empty()).map(|p| p.as_str().to_string()))
        .bind(payload_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }
}

#[async_trait]
impl WorkItemAdapter for SqliteAdapter {
    async fn reserve_input(&self) -> Result<WorkItemId, AdapterError> {
        info!(queue = %self.queue, "reserving next input work item from sqlite queue");
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

        let result = sqlx::query(
            "UPDATE work_items
             SET state = ?1, released_at = ?2,
                 exception_type = ?3, exception_code = ?4, exception_message = ?5
             WHERE id = ?6",
        )
        .bind(state.as_str())
        .bind(Utc::now())
        .bind(exception.as_ref().map(|e| e.type_or_default().to_string()))
        .bind(exception.as_ref().map(|e| e.code_or_default().to_string()))
        .bind(exception.as_ref().map(|e| e.message.clone()))
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
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

    async fn create_output(
        &self,
        parent_id: &WorkItemId,
        payload: Option<Payload>,
    ) -> Result<WorkItemId, AdapterError> {
        let item_id = WorkItemId::generate();
        self.insert_item(&item_id, &self.output_queue, Some(parent_id), payload)
            .await?;
        info!(item_id = %item_id, queue = %self.output_queue, "created output work item");
        Ok(item_id)
    }

    async fn seed_input(&self, seed: SeedItem) -> Result<WorkItemId, AdapterError> {
        if seed.callid.is_some() {
            debug!("callid deduplication is not supported by the sqlite backend, ignoring");
        }
        let item_id = WorkItemId::generate();
        self.insert_item(&item_id, &self.queue, seed.parent_id.as_ref(), seed.payload)
            .await?;
        for (name, content) in &seed.files {
            self.add_file(&item_id, name, content).await?;
        }
        info!(item_id = %item_id, queue = %self.queue, "seeded input work item");
        Ok(item_id)
    }

    async fn load_payload(&self, id: &WorkItemId) -> Result<Payload, AdapterError> {
        let row: Option<Option<String>> =
            sqlx::query_scalar("SELECT payload FROM work_items WHERE id = ?1")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_err)?;

        let payload_json = row.ok_or_else(|| AdapterError::NotFound { item_id: id.to_string() })?;
        match payload_json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Payload::Object(Default::default())),
        }
    }

    async fn save_payload(&self, id: &WorkItemId, payload: &Payload) -> Result<(), AdapterError> {
        let payload_json = serde_json::to_string(payload)?;
        let result = sqlx::query("UPDATE work_items SET payload = ?1 WHERE id = ?2")
            .bind(payload_json)
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(AdapterError::NotFound { item_id: id.to_string() });
        }
        debug!(item_id = %id, "saved payload");
        Ok(())
    }

    async fn list_files(&self, id: &WorkItemId) -> Result<Vec<String>, AdapterError> {
        sqlx::query_scalar(
            "SELECT filename FROM work_item_files WHERE work_item_id = ?1 ORDER BY filename",
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)
    }

    async fn get_file(&self, id: &WorkItemId, name: &str) -> Result<Vec<u8>, AdapterError> {
        let filepath: Option<String> = sqlx::query_scalar(
            "SELECT filepath FROM work_item_files WHERE work_item_id = ?1 AND filename = ?2",
        )
        .bind(id.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let filepath = filepath.ok_or_else(|| AdapterError::FileNotFound {
            item_id: id.to_string(),
            name: name.to_string(),
        })?;
        self.files.read(Path::new(&filepath))
    }

    async fn add_file(
        &self,
        id: &WorkItemId,
        name: &str,
        content: &[u8],
    ) -> Result<(), AdapterError> {
        validate_filename(name)?;
        validate_file_size(content.len())?;

        let path = self.files.blob_path(id, name);

        // Metadata insert first: the primary key rejects duplicates
        // atomically before any blob hits the filesystem.
        let inserted = sqlx::query(
            "INSERT INTO work_item_files (work_item_id, filename, filepath)
             VALUES (?1, ?2, ?3)",
        )
        .bind(id.as_str())
        .bind(name)
        .bind(path.display().to_string())
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(AdapterError::FileExists {
                    item_id: id.to_string(),
                    name: name.to_string(),
                });
            }
            Err(err) => return Err(map_sqlx_err(err)),
        }

        if let Err(err) = self.files.write(id, name, content) {
            let _ = sqlx::query(
                "DELETE FROM work_item_files WHERE work_item_id = ?1 AND filename = ?2",
            )
            .bind(id.as_str())
            .bind(name)
            .execute(&self.pool)
            .await;
            return Err(err);
        }

        info!(item_id = %id, name, size = content.len(), "added file to work item");
        Ok(())
    }

    async fn remove_file(&self, id: &WorkItemId, name: &str) -> Result<(), AdapterError> {
        let filepath: Option<String> = sqlx::query_scalar(
            "SELECT filepath FROM work_item_files WHERE work_item_id = ?1 AND filename = ?2",
        )
        .bind(id.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let filepath = filepath.ok_or_else(|| AdapterError::FileNotFound {
            item_id: id.to_string(),
            name: name.to_string(),
        })?;

        sqlx::query("DELETE FROM work_item_files WHERE work_item_id = ?1 AND filename = ?2")
            .bind(id.as_str())
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        self.files.remove(Path::new(&filepath))?;
        info!(item_id = %id, name, "removed file from work item");
        Ok(())
    }

    async fn recover_orphaned_work_items(
        &self,
        timeout_minutes: Option<u64>,
    ) -> Result<Vec<WorkItemId>, AdapterError> {
        let timeout = timeout_minutes.unwrap_or(self.orphan_timeout_minutes);
        let cutoff = Utc::now() - chrono::Duration::minutes(timeout as i64);

        let recovered: Vec<String> = sqlx::query_scalar(
            "UPDATE work_items
             SET state = 'PENDING', reserved_at = NULL
             WHERE state = 'RESERVED' AND reserved_at < ?1
             RETURNING id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if recovered.is_empty() {
            debug!(timeout_minutes = timeout, "no orphaned work items found");
        } else {
            warn!(
                count = recovered.len(),
                timeout_minutes = timeout,
                ids = ?recovered,
                "recovered orphaned work items"
            );
        }
        Ok(recovered.into_iter().map(WorkItemId).collect())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use chrono::DateTime;
    use serde_json::json;
    use tempfile::TempDir;
    use workq_config::{AdapterKind, SqliteSettings};

    use super::*;

    fn test_config(dir: &TempDir) -> WorkItemsConfig {
        WorkItemsConfig {
            adapter: AdapterKind::Sqlite,
            queue: QueueName::new("test"),
            files_dir: dir.path().join("files"),
            orphan_timeout_minutes: 30,
            file_size_threshold: 1_000_000,
            sqlite: Some(SqliteSettings { db_path: dir.path().join("work_items.db") }),
            redis: None,
            docdb: None,
        }
    }

    async fn test_adapter(dir: &TempDir) -> SqliteAdapter {
        SqliteAdapter::connect(&test_config(dir)).await.unwrap()
    }

    async fn seed(adapter: &SqliteAdapter, payload: Payload) -> WorkItemId {
        adapter.seed_input(SeedItem::with_payload(payload)).await.unwrap()
    }

    #[tokio::test]
    async fn fifo_order_and_empty_queue() {
        let dir = TempDir::new().unwrap();
        let adapter = test_adapter(&dir).await;

        let mut seeded = Vec::new();
        for i in 0..5 {
            seeded.push(seed(&adapter, json!({"i": i})).await);
        }

        for expected in &seeded {
            let got = adapter.reserve_input().await.unwrap();
            assert_eq!(&got, expected);
        }

        let err = adapter.reserve_input().await.unwrap_err();
        assert!(matches!(err, AdapterError::EmptyQueue { .. }));
    }

    #[tokio::test]
    async fn release_failed_persists_exception() {
        let dir = TempDir::new().unwrap();
        let adapter = test_adapter(&dir).await;

        let id = seed(&adapter, json!({})).await;
        let reserved = adapter.reserve_input().await.unwrap();
        assert_eq!(reserved, id);

        let exc = WorkItemException {
            exception_type: Some("ValueError".into()),
            code: None,
            message: "bad".into(),
        };
        adapter
            .release_input(&id, WorkItemState::Failed, Some(exc))
            .await
            .unwrap();

        // Terminal items are never re-reserved.
        assert!(matches!(
            adapter.reserve_input().await.unwrap_err(),
            AdapterError::EmptyQueue { .. }
        ));

        let (state, exc_type, exc_message): (String, Option<String>, Option<String>) =
            sqlx::query_as(
                "SELECT state, exception_type, exception_message FROM work_items WHERE id = ?1",
            )
            .bind(id.as_str())
            .fetch_one(&adapter.pool)
            .await
            .unwrap();
        assert_eq!(state, "FAILED");
        assert_eq!(exc_type.as_deref(), Some("ValueError"));
        assert_eq!(exc_message.as_deref(), Some("bad"));
    }

    #[tokio::test]
    async fn release_completed_sets_released_at() {
        let dir = TempDir::new().unwrap();
        let adapter = test_adapter(&dir).await;

        let id = seed(&adapter, json!({})).await;
        adapter.reserve_input().await.unwrap();
        adapter
            .release_input(&id, WorkItemState::Completed, None)
            .await
            .unwrap();

        let (state, released_at): (String, Option<DateTime<Utc>>) =
            sqlx::query_as("SELECT state, released_at FROM work_items WHERE id = ?1")
                .bind(id.as_str())
                .fetch_one(&adapter.pool)
                .await
                .unwrap();
        assert_eq!(state, "COMPLETED");
        assert!(released_at.is_some());
    }

    #[tokio::test]
    async fn release_rejects_non_terminal_state() {
        let dir = TempDir::new().unwrap();
        let adapter = test_adapter(&dir).await;
        let id = seed(&adapter, json!({})).await;
        adapter.reserve_input().await.unwrap();

        for state in [WorkItemState::Pending, WorkItemState::Reserved] {
            let err = adapter.release_input(&id, state, None).await.unwrap_err();
            assert!(matches!(err, AdapterError::InvalidArgument(_)));
        }
    }

    #[tokio::test]
    async fn release_failed_requires_exception_message() {
        let dir = TempDir::new().unwrap();
        let adapter = test_adapter(&dir).await;
        let id = seed(&adapter, json!({})).await;
        adapter.reserve_input().await.unwrap();

        let err = adapter
            .release_input(&id, WorkItemState::Failed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::InvalidArgument(_)));

        let err = adapter
            .release_input(
                &id,
                WorkItemState::Failed,
                Some(WorkItemException::new("")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn release_unknown_id_is_noop() {
        let dir = TempDir::new().unwrap();
        let adapter = test_adapter(&dir).await;
        adapter
            .release_input(
                &WorkItemId::new("does-not-exist"),
                WorkItemState::Completed,
                None,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn outputs_are_not_reserved_as_inputs() {
        let dir = TempDir::new().unwrap();
        let adapter = test_adapter(&dir).await;

        let id = seed(&adapter, json!({})).await;
        adapter.reserve_input().await.unwrap();
        let output_id = adapter
            .create_output(&id, Some(json!({"k": "v"})))
            .await
            .unwrap();

        // The output lives in test_output, not test.
        assert!(matches!(
            adapter.reserve_input().await.unwrap_err(),
            AdapterError::EmptyQueue { .. }
        ));

        // But its payload is reachable through queue resolution.
        assert_eq!(adapter.load_payload(&output_id).await.unwrap(), json!({"k": "v"}));

        let queue: String = sqlx::query_scalar("SELECT queue_name FROM work_items WHERE id = ?1")
            .bind(output_id.as_str())
            .fetch_one(&adapter.pool)
            .await
            .unwrap();
        assert_eq!(queue, "test_output");
    }

    #[tokio::test]
    async fn orphan_recovery_returns_stale_reservations() {
        let dir = TempDir::new().unwrap();
        let adapter = test_adapter(&dir).await;

        let id = seed(&adapter, json!({})).await;
        adapter.reserve_input().await.unwrap();

        // Back-date the reservation past the 30 minute cutoff.
        sqlx::query("UPDATE work_items SET reserved_at = ?1 WHERE id = ?2")
            .bind(Utc::now() - chrono::Duration::minutes(31))
            .bind(id.as_str())
            .execute(&adapter.pool)
            .await
            .unwrap();

        let recovered = adapter.recover_orphaned_work_items(Some(30)).await.unwrap();
        assert_eq!(recovered, vec![id.clone()]);

        let (state, reserved_at): (String, Option<DateTime<Utc>>) =
            sqlx::query_as("SELECT state, reserved_at FROM work_items WHERE id = ?1")
                .bind(id.as_str())
                .fetch_one(&adapter.pool)
                .await
                .unwrap();
        assert_eq!(state, "PENDING");
        assert!(reserved_at.is_none());

        // The recovered item is reservable again.
        assert_eq!(adapter.reserve_input().await.unwrap(), id);
    }

    #[tokio::test]
    async fn fresh_reservations_are_not_recovered() {
        let dir = TempDir::new().unwrap();
        let adapter = test_adapter(&dir).await;

        seed(&adapter, json!({})).await;
        adapter.reserve_input().await.unwrap();

        let recovered = adapter.recover_orphaned_work_items(Some(30)).await.unwrap();
        assert!(recovered.is_empty());
    }

    #[tokio::test]
    async fn file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let adapter = test_adapter(&dir).await;
        let id = seed(&adapter, json!({})).await;

        adapter.add_file(&id, "small.txt", b"hello").await.unwrap();
        adapter.add_file(&id, "big.bin", &vec![7u8; 4096]).await.unwrap();

        assert_eq!(
            adapter.list_files(&id).await.unwrap(),
            vec!["big.bin".to_string(), "small.txt".to_string()]
        );
        assert_eq!(adapter.get_file(&id, "small.txt").await.unwrap(), b"hello");
        assert_eq!(adapter.get_file(&id, "big.bin").await.unwrap(), vec![7u8; 4096]);

        adapter.remove_file(&id, "small.txt").await.unwrap();
        assert_eq!(adapter.list_files(&id).await.unwrap(), vec!["big.bin".to_string()]);
        assert!(matches!(
            adapter.get_file(&id, "small.txt").await.unwrap_err(),
            AdapterError::FileNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn duplicate_file_rejected() {
        let dir = TempDir::new().unwrap();
        let adapter = test_adapter(&dir).await;
        let id = seed(&adapter, json!({})).await;

        adapter.add_file(&id, "a.txt", b"1").await.unwrap();
        let err = adapter.add_file(&id, "a.txt", b"2").await.unwrap_err();
        assert!(matches!(err, AdapterError::FileExists { .. }));
        // Original content untouched.
        assert_eq!(adapter.get_file(&id, "a.txt").await.unwrap(), b"1");
    }

    #[tokio::test]
    async fn file_validation() {
        let dir = TempDir::new().unwrap();
        let adapter = test_adapter(&dir).await;
        let id = seed(&adapter, json!({})).await;

        for bad in ["a/b.txt", "a\\b.txt", ""] {
            let err = adapter.add_file(&id, bad, b"x").await.unwrap_err();
            assert!(matches!(err, AdapterError::InvalidArgument(_)));
        }
        let long = "a".repeat(256);
        assert!(matches!(
            adapter.add_file(&id, &long, b"x").await.unwrap_err(),
            AdapterError::InvalidArgument(_)
        ));
        let just_fits = "a".repeat(255);
        adapter.add_file(&id, &just_fits, b"x").await.unwrap();
    }

    #[tokio::test]
    async fn payload_save_and_load() {
        let dir = TempDir::new().unwrap();
        let adapter = test_adapter(&dir).await;

        let id = seed(&adapter, json!({"before": true})).await;
        assert_eq!(adapter.load_payload(&id).await.unwrap(), json!({"before": true}));

        adapter.save_payload(&id, &json!({"after": [1, 2, 3]})).await.unwrap();
        assert_eq!(adapter.load_payload(&id).await.unwrap(), json!({"after": [1, 2, 3]}));

        let missing = WorkItemId::new("missing");
        assert!(matches!(
            adapter.load_payload(&missing).await.unwrap_err(),
            AdapterError::NotFound { .. }
        ));
        assert!(matches!(
            adapter.save_payload(&missing, &json!({})).await.unwrap_err(),
            AdapterError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn empty_payload_stored_as_object() {
        let dir = TempDir::new().unwrap();
        let adapter = test_adapter(&dir).await;
        let id = adapter.seed_input(SeedItem::default()).await.unwrap();
        assert_eq!(adapter.load_payload(&id).await.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn seed_with_files_attaches_them() {
        let dir = TempDir::new().unwrap();
        let adapter = test_adapter(&dir).await;
        let id = adapter
            .seed_input(SeedItem {
                payload: Some(json!({"k": 1})),
                files: vec![("in.csv".into(), b"a,b\n".to_vec())],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(adapter.list_files(&id).await.unwrap(), vec!["in.csv".to_string()]);
        assert_eq!(adapter.get_file(&id, "in.csv").await.unwrap(), b"a,b\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_never_duplicate() {
        let dir = TempDir::new().unwrap();
        let adapter = Arc::new(test_adapter(&dir).await);

        let total = 40;
        for i in 0..total {
            seed(&adapter, json!({"i": i})).await;
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let adapter = Arc::clone(&adapter);
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    match adapter.reserve_input().await {
                        Ok(id) => mine.push(id),
                        Err(AdapterError::EmptyQueue { .. }) => break,
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                }
                mine
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), total, "every seeded item reserved exactly once");
        assert_eq!(unique.len(), total, "no id handed to two workers");
    }

    #[tokio::test]
    async fn migration_rewrites_legacy_done_rows() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let db_path = config.sqlite.as_ref().unwrap().db_path.clone();

        // Build a v1-era database by hand with a legacy DONE row.
        {
            let mut conn = SqliteConnectOptions::new()
                .filename(&db_path)
                .create_if_missing(true)
                .foreign_keys(false)
                .connect()
                .await
                .unwrap();
            sqlx::query(
                "CREATE TABLE schema_version (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
                )",
            )
            .execute(&mut conn)
            .await
            .unwrap();
            for statement in migration_statements(1) {
                sqlx::query(statement).execute(&mut conn).await.unwrap();
            }
            sqlx::query("INSERT INTO schema_version (version) VALUES (1)")
                .execute(&mut conn)
                .await
                .unwrap();
            sqlx::query(
                "INSERT INTO work_items (id, queue_name, payload, state)
                 VALUES ('legacy', 'test', '{}', 'DONE')",
            )
            .execute(&mut conn)
            .await
            .unwrap();
            conn.close().await.unwrap();
        }

        let adapter = SqliteAdapter::connect(&config).await.unwrap();

        let version: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
                .fetch_one(&adapter.pool)
                .await
                .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        let state: String = sqlx::query_scalar("SELECT state FROM work_items WHERE id = 'legacy'")
            .fetch_one(&adapter.pool)
            .await
            .unwrap();
        assert_eq!(state, "COMPLETED");
    }

    #[tokio::test]
    async fn newer_schema_version_is_fatal() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let db_path = config.sqlite.as_ref().unwrap().db_path.clone();

        {
            let mut conn = SqliteConnectOptions::new()
                .filename(&db_path)
                .create_if_missing(true)
                .connect()
                .await
                .unwrap();
            sqlx::query(
                "CREATE TABLE schema_version (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
                )",
            )
            .execute(&mut conn)
            .await
            .unwrap();
            sqlx::query("INSERT INTO schema_version (version) VALUES (99)")
                .execute(&mut conn)
                .await
                .unwrap();
            conn.close().await.unwrap();
        }

        let err = SqliteAdapter::connect(&config).await.unwrap_err();
        assert!(matches!(
            err,
            AdapterError::SchemaVersionMismatch { found: 99, supported: SCHEMA_VERSION }
        ));
    }
}
