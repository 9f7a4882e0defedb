use thiserror::Error;
use workq_domain::DomainError;

/// Errors surfaced by the adapter contract. Every backend maps its native
/// failures onto these kinds; callers never see driver error types.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// No PENDING items to reserve. Expected during normal drain.
    #[error("no pending work items in queue: {queue}")]
    EmptyQueue { queue: String },

    #[error("work item not found: {item_id}")]
    NotFound { item_id: String },

    #[error("file not found: {name} (work item: {item_id})")]
    FileNotFound { item_id: String, name: String },

    #[error("file already exists: {name} (work item: {item_id})")]
    FileExists { item_id: String, name: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unique-constraint hit on a `seed_input` callid (document backend).
    #[error("work item with callid {callid} already exists")]
    DuplicateCallId { callid: String },

    /// Network hiccup, lock contention, timeout. Retried by the retry
    /// layer; surfaced only once the attempt budget is exhausted.
    #[error("backend temporarily unavailable: {0}")]
    TransientUnavailable(String),

    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),

    /// The persisted schema is newer than this build. Fatal.
    #[error("schema version {found} is newer than this build supports ({supported})")]
    SchemaVersionMismatch { found: i64, supported: i64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal adapter error: {0}")]
    Internal(String),
}

impl AdapterError {
    /// Whether the retry layer may re-attempt the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, AdapterError::TransientUnavailable(_))
    }
}

impl From<DomainError> for AdapterError {
    fn from(err: DomainError) -> Self {
        AdapterError::InvalidArgument(err.to_string())
    }
}
