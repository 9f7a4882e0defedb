use std::path::{Path, PathBuf};

use workq_domain::WorkItemId;

use crate::error::AdapterError;

/// Filesystem store for large attachment blobs.
///
/// Blobs live at `{root}/{item_id}/{filename}`. The directory for an item
/// is owned by that work item; blobs are removed when the attachment is
/// removed.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Open the store rooted at `root`, creating it if missing.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, AdapterError> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| AdapterError::Internal(format!("create files dir: {e}")))?;
        Ok(Self { root })
    }

    /// The on-disk path for an attachment, whether or not it exists.
    pub fn blob_path(&self, item_id: &WorkItemId, name: &str) -> PathBuf {
        self.root.join(item_id.as_str()).join(name)
    }

    /// Write a blob, creating the item directory as needed.
    pub fn write(
        &self,
        item_id: &WorkItemId,
        name: &str,
        content: &[u8],
    ) -> Result<PathBuf, AdapterError> {
        let path = self.blob_path(item_id, name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AdapterError::Internal(format!("create item dir: {e}")))?;
        }
        std::fs::write(&path, content)
            .map_err(|e| AdapterError::Internal(format!("write blob {}: {e}", path.display())))?;
        Ok(path)
    }

    /// Read a blob back. The caller resolved `path` from backend metadata,
    /// so a missing file is an inconsistency, not a FileNotFound.
    pub fn read(&self, path: &Path) -> Result<Vec<u8>, AdapterError> {
        std::fs::read(path).map_err(|e| {
            AdapterError::Internal(format!("blob missing from filesystem {}: {e}", path.display()))
        })
    }

    /// Delete a blob. Already-missing files are ignored.
    pub fn remove(&self, path: &Path) -> Result<(), AdapterError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AdapterError::Internal(format!(
                "remove blob {}: {e}",
                path.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_read_remove_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::open(dir.path().join("blobs")).unwrap();
        let id = WorkItemId::new("item-1");

        let path = store.write(&id, "report.pdf", b"content").unwrap();
        assert_eq!(store.read(&path).unwrap(), b"content");

        store.remove(&path).unwrap();
        assert!(store.read(&path).is_err());
        // Removing twice is fine.
        store.remove(&path).unwrap();
    }

    #[test]
    fn blobs_are_namespaced_by_item() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        let a = store.write(&WorkItemId::new("a"), "f.bin", b"1").unwrap();
        let b = store.write(&WorkItemId::new("b"), "f.bin", b"2").unwrap();
        assert_ne!(a, b);
        assert_eq!(store.read(&a).unwrap(), b"1");
        assert_eq!(store.read(&b).unwrap(), b"2");
    }
}
