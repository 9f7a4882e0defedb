use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Opaque JSON payload carried by a work item.
pub type Payload = Value;

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItemId(pub String);

impl WorkItemId {
    pub fn new(s: impl Into<String>) -> Self {
        WorkItemId(s.into())
    }

    /// Generate a fresh random (UUID v4) id.
    pub fn generate() -> Self {
        WorkItemId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical queue name. The derived output queue for `q` is `q_output`:
/// a physically separate queue that `reserve_input` on `q` never touches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(pub String);

impl QueueName {
    pub fn new(s: impl Into<String>) -> Self {
        QueueName(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The output queue paired with this input queue.
    pub fn output(&self) -> QueueName {
        QueueName(format!("{}_output", self.0))
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Lifecycle state machine ───────────────────────────────────────────────────

/// The lifecycle state of a work item.
///
/// Transitions:
///   Pending → Reserved → Completed | Failed
///   Reserved → Pending (orphan recovery)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkItemState {
    /// Waiting in a queue, eligible for reservation.
    #[default]
    Pending,
    /// Assigned to exactly one worker; `reserved_at` is set.
    Reserved,
    /// Released successfully. Terminal.
    Completed,
    /// Released with an exception record. Terminal.
    Failed,
}

impl WorkItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemState::Pending => "PENDING",
            WorkItemState::Reserved => "RESERVED",
            WorkItemState::Completed => "COMPLETED",
            WorkItemState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(WorkItemState::Pending),
            "RESERVED" => Some(WorkItemState::Reserved),
            "COMPLETED" => Some(WorkItemState::Completed),
            "FAILED" => Some(WorkItemState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkItemState::Completed | WorkItemState::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: WorkItemState) -> bool {
        match (self, next) {
            (WorkItemState::Pending, WorkItemState::Reserved) => true,
            (WorkItemState::Reserved, WorkItemState::Completed) => true,
            (WorkItemState::Reserved, WorkItemState::Failed) => true,
            // Orphan recovery puts a stale reservation back in the queue.
            (WorkItemState::Reserved, WorkItemState::Pending) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for WorkItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Exception record ──────────────────────────────────────────────────────────

/// Durable record of why a work item failed. Present iff state is `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemException {
    /// Exception class or category, e.g. "ValueError".
    #[serde(rename = "type")]
    pub exception_type: Option<String>,
    /// Machine-readable error code.
    pub code: Option<String>,
    /// Human-readable description. Required.
    pub message: String,
}

impl WorkItemException {
    pub fn new(message: impl Into<String>) -> Self {
        Self { exception_type: None, code: None, message: message.into() }
    }

    /// Category persisted when the caller supplied none.
    pub fn type_or_default(&self) -> &str {
        self.exception_type.as_deref().unwrap_or("UnknownException")
    }

    pub fn code_or_default(&self) -> &str {
        self.code.as_deref().unwrap_or("")
    }
}

// ── Seeding ───────────────────────────────────────────────────────────────────

/// Arguments to the developer seeding helper (`seed_input`).
#[derive(Debug, Clone, Default)]
pub struct SeedItem {
    /// JSON payload; `None` stores an empty object.
    pub payload: Option<Payload>,
    /// Lineage pointer; `None` for root items.
    pub parent_id: Option<WorkItemId>,
    /// Attachments written through the normal file path after insert.
    pub files: Vec<(String, Vec<u8>)>,
    /// Caller-supplied dedup key. Enforced by the document backend only;
    /// other backends accept and ignore it.
    pub callid: Option<String>,
}

impl SeedItem {
    pub fn with_payload(payload: Payload) -> Self {
        Self { payload: Some(payload), ..Default::default() }
    }
}
