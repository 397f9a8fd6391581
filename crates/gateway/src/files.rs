//! Session Files: blob attachments stored as content-addressed files under
//! `<attachments_root>/<session_id>/<sha256>`.
//!
//! Adapted from the read-cache pattern the teacher uses for workspace file
//! reads (hash the bytes, key by hash) into a write path: the hash *is* the
//! generated filename, so identical attachments within a session are
//! automatically deduplicated.

use std::path::{Path, PathBuf};

use cc_domain::error::{Error, Result};
use sha2::{Digest, Sha256};

/// A stored attachment's identity: the session it belongs to and the
/// content hash that names its file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub session_id: String,
    pub hash: String,
}

impl FileRef {
    pub fn path(&self, root: &Path) -> PathBuf {
        root.join(&self.session_id).join(&self.hash)
    }
}

/// Write `bytes` into the session's attachment directory, naming the file
/// by its sha256 hash. Writing the same bytes twice is a no-op past the
/// first call and returns the same `FileRef`.
pub fn store(root: &Path, session_id: &str, bytes: &[u8]) -> Result<FileRef> {
    let hash = hex::encode(Sha256::digest(bytes));
    let dir = root.join(session_id);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(&hash);
    if !path.exists() {
        std::fs::write(&path, bytes)?;
    }
    Ok(FileRef { session_id: session_id.to_string(), hash })
}

/// Read a previously stored attachment back.
pub fn load(root: &Path, reference: &FileRef) -> Result<Vec<u8>> {
    std::fs::read(reference.path(root)).map_err(|e| {
        Error::Store(format!(
            "attachment {}/{} unreadable: {e}",
            reference.session_id, reference.hash
        ))
    })
}

/// Delete every attachment belonging to a session (called when the session
/// itself is deleted, mirroring the store's `ON DELETE CASCADE`).
pub fn delete_session_files(root: &Path, session_id: &str) -> Result<()> {
    let dir = root.join(session_id);
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let reference = store(dir.path(), "s1", b"hello world").unwrap();
        let bytes = load(dir.path(), &reference).unwrap();
        assert_eq!(bytes, b"hello world");
    }

    #[test]
    fn identical_content_dedupes_to_the_same_hash() {
        let dir = tempfile::tempdir().unwrap();
        let a = store(dir.path(), "s1", b"same bytes").unwrap();
        let b = store(dir.path(), "s1", b"same bytes").unwrap();
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn delete_session_files_removes_the_whole_directory() {
        let dir = tempfile::tempdir().unwrap();
        store(dir.path(), "s1", b"bytes").unwrap();
        delete_session_files(dir.path(), "s1").unwrap();
        assert!(!dir.path().join("s1").exists());
    }

    #[test]
    fn different_sessions_keep_separate_namespaces() {
        let dir = tempfile::tempdir().unwrap();
        let a = store(dir.path(), "s1", b"x").unwrap();
        let b = store(dir.path(), "s2", b"x").unwrap();
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.path(dir.path()), b.path(dir.path()));
    }
}
