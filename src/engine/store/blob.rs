//! Content-addressed attachment storage
//!
//! Attachment bytes live outside SQLite, keyed by their SHA-1 digest. The
//! store only needs `store`/`read`; `FileBlobStore` and `MemoryBlobStore` are
//! the two backends shipped with the crate.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::RwLock;
use sha1::{Digest, Sha1};
use thiserror::Error;

const BLOB_EXTENSION: &str = "blob";
const DIGEST_PREFIX: &str = "sha1-";

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid blob key: {0}")]
    InvalidKey(String),
}

/// SHA-1 digest of a blob's contents
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlobKey([u8; 20]);

impl BlobKey {
    pub fn for_contents(data: &[u8]) -> Self {
        Self(Sha1::digest(data).into())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlobError> {
        let raw: [u8; 20] = bytes
            .try_into()
            .map_err(|_| BlobError::InvalidKey(format!("expected 20 bytes, got {}", bytes.len())))?;
        Ok(Self(raw))
    }

    /// Parse a `"sha1-<base64>"` attachment digest
    pub fn from_digest(digest: &str) -> Result<Self, BlobError> {
        let encoded = digest
            .strip_prefix(DIGEST_PREFIX)
            .ok_or_else(|| BlobError::InvalidKey(digest.to_string()))?;
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|_| BlobError::InvalidKey(digest.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// `"sha1-<base64>"`
    pub fn digest(&self) -> String {
        format!("{}{}", DIGEST_PREFIX, STANDARD.encode(self.0))
    }

    fn filename(&self) -> String {
        format!("{}.{}", hex::encode_upper(self.0), BLOB_EXTENSION)
    }
}

impl fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobKey({})", hex::encode(self.0))
    }
}

/// Attachment byte storage
pub trait BlobStore: Send + Sync {
    fn store(&self, data: &[u8]) -> Result<BlobKey, BlobError>;

    fn read(&self, key: &BlobKey) -> Result<Option<Vec<u8>>, BlobError>;

    fn contains(&self, key: &BlobKey) -> Result<bool, BlobError> {
        Ok(self.read(key)?.is_some())
    }

    /// Delete every blob not in `keep`, returning how many were removed
    fn retain(&self, keep: &HashSet<BlobKey>) -> Result<usize, BlobError>;
}

/// One file per blob under a directory, named by the hex digest
pub struct FileBlobStore {
    path: PathBuf,
}

impl FileBlobStore {
    pub fn open(path: &Path) -> Result<Self, BlobError> {
        fs::create_dir_all(path)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn path_for_key(&self, key: &BlobKey) -> PathBuf {
        self.path.join(key.filename())
    }

    fn key_for_filename(name: &str) -> Option<BlobKey> {
        let stem = name.strip_suffix(&format!(".{}", BLOB_EXTENSION))?;
        let bytes = hex::decode(stem).ok()?;
        BlobKey::from_bytes(&bytes).ok()
    }
}

impl BlobStore for FileBlobStore {
    fn store(&self, data: &[u8]) -> Result<BlobKey, BlobError> {
        let key = BlobKey::for_contents(data);
        let path = self.path_for_key(&key);
        if path.exists() {
            return Ok(key);
        }

        // Write beside the target then rename, so readers never see a partial blob
        let mut tmp = tempfile::NamedTempFile::new_in(&self.path)?;
        tmp.write_all(data)?;
        tmp.persist(&path).map_err(|e| BlobError::Io(e.error))?;
        Ok(key)
    }

    fn read(&self, key: &BlobKey) -> Result<Option<Vec<u8>>, BlobError> {
        match fs::read(self.path_for_key(key)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn contains(&self, key: &BlobKey) -> Result<bool, BlobError> {
        Ok(self.path_for_key(key).exists())
    }

    fn retain(&self, keep: &HashSet<BlobKey>) -> Result<usize, BlobError> {
        let mut deleted = 0;
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(key) = Self::key_for_filename(&name) {
                if !keep.contains(&key) {
                    fs::remove_file(entry.path())?;
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }
}

/// Blobs held in memory; used by in-memory stores and tests
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<BlobKey, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn store(&self, data: &[u8]) -> Result<BlobKey, BlobError> {
        let key = BlobKey::for_contents(data);
        self.blobs.write().entry(key).or_insert_with(|| data.to_vec());
        Ok(key)
    }

    fn read(&self, key: &BlobKey) -> Result<Option<Vec<u8>>, BlobError> {
        Ok(self.blobs.read().get(key).cloned())
    }

    fn retain(&self, keep: &HashSet<BlobKey>) -> Result<usize, BlobError> {
        let mut blobs = self.blobs.write();
        let before = blobs.len();
        blobs.retain(|key, _| keep.contains(key));
        Ok(before - blobs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_digest_round_trip() {
        let key = BlobKey::for_contents(b"hello");
        let digest = key.digest();
        assert!(digest.starts_with("sha1-"));
        assert_eq!(BlobKey::from_digest(&digest).unwrap(), key);
        assert!(BlobKey::from_digest("md5-abc").is_err());
    }

    #[test]
    fn test_file_store() {
        let dir = tempdir().unwrap();
        let store = FileBlobStore::open(&dir.path().join("blobs")).unwrap();

        let a = store.store(b"alpha").unwrap();
        let b = store.store(b"beta").unwrap();
        assert_eq!(store.store(b"alpha").unwrap(), a);
        assert_eq!(store.read(&a).unwrap().unwrap(), b"alpha");
        assert!(store.contains(&b).unwrap());

        let keep: HashSet<BlobKey> = [a].into_iter().collect();
        assert_eq!(store.retain(&keep).unwrap(), 1);
        assert!(store.read(&b).unwrap().is_none());
        assert!(store.contains(&a).unwrap());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryBlobStore::new();
        let key = store.store(b"gamma").unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.read(&key).unwrap().unwrap(), b"gamma");
        assert_eq!(store.retain(&HashSet::new()).unwrap(), 1);
        assert!(store.is_empty());
    }
}
