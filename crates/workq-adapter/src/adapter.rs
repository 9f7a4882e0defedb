use async_trait::async_trait;
use workq_domain::{Payload, SeedItem, WorkItemException, WorkItemId, WorkItemState};

use crate::error::AdapterError;

/// The contract every queue backend implements.
///
/// Workers hold a `dyn WorkItemAdapter` selected by
/// [`create_adapter`](crate::factory::create_adapter) at startup. Every
/// operation is durable when it returns and safe to call from concurrent
/// tasks; reservation in particular is linearizable, so no two workers ever
/// receive the same id from concurrent `reserve_input` calls.
#[async_trait]
pub trait WorkItemAdapter: Send + Sync + std::fmt::Debug + 'static {
    /// Atomically reserve the oldest PENDING item in the input queue,
    /// moving it to RESERVED and stamping `reserved_at`.
    ///
    /// Returns `EmptyQueue` when nothing is pending.
    async fn reserve_input(&self) -> Result<WorkItemId, AdapterError>;

    /// Release a reserved item into a terminal state.
    ///
    /// `state` must be COMPLETED or FAILED; an exception record with a
    /// non-empty message is required iff FAILED. Releasing an unknown id
    /// logs a warning and succeeds.
    async fn release_input(
        &self,
        id: &WorkItemId,
        state: WorkItemState,
        exception: Option<WorkItemException>,
    ) -> Result<(), AdapterError>;

    /// Create a PENDING item in the output queue, recording `parent_id`
    /// lineage. The output queue is never consumed by [`reserve_input`].
    async fn create_output(
        &self,
        parent_id: &WorkItemId,
        payload: Option<Payload>,
    ) -> Result<WorkItemId, AdapterError>;

    /// Developer helper: enqueue an item directly into the input queue,
    /// optionally attaching files. `callid` deduplication is enforced where
    /// the backend supports it (`DuplicateCallId`).
    async fn seed_input(&self, seed: SeedItem) -> Result<WorkItemId, AdapterError>;

    /// Load the JSON payload of an item in either the input or output queue.
    async fn load_payload(&self, id: &WorkItemId) -> Result<Payload, AdapterError>;

    /// Overwrite the JSON payload of an item in either queue.
    async fn save_payload(&self, id: &WorkItemId, payload: &Payload)
        -> Result<(), AdapterError>;

    /// List attachment filenames, sorted.
    async fn list_files(&self, id: &WorkItemId) -> Result<Vec<String>, AdapterError>;

    /// Read attachment bytes, whether stored inline or in the blob store.
    async fn get_file(&self, id: &WorkItemId, name: &str) -> Result<Vec<u8>, AdapterError>;

    /// Attach a file. Rejects duplicate names (`FileExists`), path
    /// separators and over-long names, and contents above 100 MB.
    async fn add_file(
        &self,
        id: &WorkItemId,
        name: &str,
        content: &[u8],
    ) -> Result<(), AdapterError>;

    /// Remove an attachment and its underlying blob, if external.
    async fn remove_file(&self, id: &WorkItemId, name: &str) -> Result<(), AdapterError>;

    /// Reset RESERVED items whose `reserved_at` is older than the timeout
    /// back to PENDING, clearing `reserved_at`. Returns the recovered ids.
    ///
    /// `timeout_minutes = None` uses the configured default.
    async fn recover_orphaned_work_items(
        &self,
        timeout_minutes: Option<u64>,
    ) -> Result<Vec<WorkItemId>, AdapterError>;
}
