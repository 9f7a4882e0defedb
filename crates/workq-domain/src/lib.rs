pub mod error;
pub mod files;
pub mod types;

mod tests;

pub use error::DomainError;
pub use files::{
    validate_file_size, validate_filename, DEFAULT_INLINE_THRESHOLD, EXCEPTION_TTL_SECONDS,
    ITEM_TTL_SECONDS, MAX_FILENAME_BYTES, MAX_FILE_SIZE,
};
pub use types::{
    Payload, QueueName, SeedItem, WorkItemException, WorkItemId, WorkItemState,
};
