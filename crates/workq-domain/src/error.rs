use thiserror::Error;

use crate::types::WorkItemState;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid filename: {0}")]
    InvalidFilename(String),

    #[error("file too large: {size} bytes (max {max})")]
    FileTooLarge { size: usize, max: usize },

    #[error("release state must be COMPLETED or FAILED, got {0}")]
    NotATerminalState(WorkItemState),

    #[error("exception message required when releasing as FAILED")]
    MissingException,
}
