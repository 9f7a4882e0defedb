use crate::error::DomainError;

/// Longest accepted filename, in bytes.
pub const MAX_FILENAME_BYTES: usize = 255;

/// Largest accepted attachment: 100 MB.
pub const MAX_FILE_SIZE: usize = 104_857_600;

/// Default inline-vs-external storage threshold (1 MB). Attachments at or
/// below this size are stored inside the metadata record; larger ones go to
/// the blob store or filesystem.
pub const DEFAULT_INLINE_THRESHOLD: usize = 1_000_000;

/// Work items expire 7 days after creation on backends that support TTL.
pub const ITEM_TTL_SECONDS: u64 = 604_800;

/// Exception records on the KV backend expire after 24 hours.
pub const EXCEPTION_TTL_SECONDS: u64 = 86_400;

/// Validate an attachment filename: non-empty, no path separators,
/// at most [`MAX_FILENAME_BYTES`] bytes.
pub fn validate_filename(name: &str) -> Result<(), DomainError> {
    if name.is_empty() {
        return Err(DomainError::InvalidFilename("empty filename".into()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(DomainError::InvalidFilename(format!(
            "no path separators allowed: {name}"
        )));
    }
    if name.len() > MAX_FILENAME_BYTES {
        return Err(DomainError::InvalidFilename(format!(
            "filename too long ({} bytes, max {MAX_FILENAME_BYTES})",
            name.len()
        )));
    }
    Ok(())
}

/// Validate an attachment size against [`MAX_FILE_SIZE`].
pub fn validate_file_size(size: usize) -> Result<(), DomainError> {
    if size > MAX_FILE_SIZE {
        return Err(DomainError::FileTooLarge { size, max: MAX_FILE_SIZE });
    }
    Ok(())
}
