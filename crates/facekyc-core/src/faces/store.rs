use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::errors::{AppError, AppResult};

/// Address of a blob in a content store.
///
/// Identical bytes always map to the same identifier. Identifiers are never
/// mutated; a user's record moves on to a new one instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Lowercase hex SHA-256 of `bytes`.
    pub fn for_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content-addressed blob storage the verification core depends on.
///
/// Implementations report an unknown identifier as
/// [`AppError::ContentNotFound`] and transport trouble as
/// [`AppError::StorageUnavailable`]; callers rely on telling these apart.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn put(&self, bytes: Vec<u8>) -> AppResult<ContentId>;

    async fn get(&self, cid: &ContentId) -> AppResult<Vec<u8>>;

    /// Reachability probe run once when the service is constructed.
    async fn check(&self) -> AppResult<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryContentStore {
    blobs: RwLock<HashMap<ContentId, Vec<u8>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, cid: &ContentId) -> bool {
        self.blobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(cid)
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, bytes: Vec<u8>) -> AppResult<ContentId> {
        let cid = ContentId::for_bytes(&bytes);
        self.blobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(cid.clone())
            .or_insert(bytes);
        Ok(cid)
    }

    async fn get(&self, cid: &ContentId) -> AppResult<Vec<u8>> {
        self.blobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(cid)
            .cloned()
            .ok_or_else(|| AppError::ContentNotFound { cid: cid.clone() })
    }
}

/// One file per blob, named by its identifier, under a single directory.
#[derive(Debug, Clone)]
pub struct FilesystemContentStore {
    root: PathBuf,
}

impl FilesystemContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, cid: &ContentId) -> Option<PathBuf> {
        let name = cid.as_str();
        if name.is_empty() || !name.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            return None;
        }
        Some(self.root.join(name))
    }
}

#[async_trait]
impl ContentStore for FilesystemContentStore {
    async fn put(&self, bytes: Vec<u8>) -> AppResult<ContentId> {
        let cid = ContentId::for_bytes(&bytes);
        let path = self.root.join(cid.as_str());
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || write_blob(&root, &path, &bytes))
            .await
            .map_err(|err| AppError::StorageUnavailable(format!("blob writer failed: {err}")))??;
        debug!(cid = %cid, "stored blob");
        Ok(cid)
    }

    async fn get(&self, cid: &ContentId) -> AppResult<Vec<u8>> {
        let path = self
            .blob_path(cid)
            .ok_or_else(|| AppError::ContentNotFound { cid: cid.clone() })?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(AppError::ContentNotFound { cid: cid.clone() })
            }
            Err(err) => Err(AppError::StorageUnavailable(format!(
                "failed to read {}: {err}",
                path.display()
            ))),
        }
    }

    async fn check(&self) -> AppResult<()> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || fs::create_dir_all(&root))
            .await
            .map_err(|err| AppError::StorageUnavailable(format!("store probe failed: {err}")))?
            .map_err(|err| {
                AppError::StorageUnavailable(format!(
                    "content directory {} unusable: {err}",
                    self.root.display()
                ))
            })
    }
}

fn write_blob(root: &Path, path: &Path, bytes: &[u8]) -> AppResult<()> {
    let unavailable = |err: io::Error| {
        AppError::StorageUnavailable(format!("failed to write {}: {err}", path.display()))
    };

    if path.exists() {
        return Ok(());
    }
    fs::create_dir_all(root).map_err(unavailable)?;

    let mut tmp = NamedTempFile::new_in(root).map_err(unavailable)?;
    {
        let file = tmp.as_file_mut();
        let mut writer = BufWriter::new(&mut *file);
        writer.write_all(bytes).map_err(unavailable)?;
        writer.flush().map_err(unavailable)?;
    }
    tmp.as_file().sync_all().map_err(unavailable)?;

    let file = tmp.persist(path).map_err(|err| unavailable(err.error))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.metadata().map_err(unavailable)?.permissions();
        perms.set_mode(0o600);
        file.set_permissions(perms).map_err(unavailable)?;
    }
    #[cfg(not(unix))]
    drop(file);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn content_id_is_hex_sha256() {
        let cid = ContentId::for_bytes(b"abc");
        assert_eq!(
            cid.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_ne!(cid, ContentId::for_bytes(b"abd"));
    }

    #[tokio::test]
    async fn memory_store_is_idempotent() {
        let store = MemoryContentStore::new();
        let first = store.put(b"blob".to_vec()).await.unwrap();
        let second = store.put(b"blob".to_vec()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&first).await.unwrap(), b"blob".to_vec());
    }

    #[tokio::test]
    async fn memory_store_reports_unknown_ids() {
        let store = MemoryContentStore::new();
        let err = store.get(&ContentId::new("missing")).await.unwrap_err();
        assert!(matches!(err, AppError::ContentNotFound { .. }));
    }

    #[tokio::test]
    async fn filesystem_store_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemContentStore::new(tmp.path().join("content"));
        store.check().await.unwrap();

        let cid = store.put(b"ciphertext".to_vec()).await.unwrap();
        let again = store.put(b"ciphertext".to_vec()).await.unwrap();
        assert_eq!(cid, again);
        assert!(store.root().join(cid.as_str()).exists());
        assert_eq!(store.get(&cid).await.unwrap(), b"ciphertext".to_vec());
    }

    #[tokio::test]
    async fn filesystem_store_distinguishes_missing_content() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemContentStore::new(tmp.path());
        let missing = ContentId::for_bytes(b"never stored");
        assert!(matches!(
            store.get(&missing).await,
            Err(AppError::ContentNotFound { .. })
        ));
        assert!(matches!(
            store.get(&ContentId::new("../escape")).await,
            Err(AppError::ContentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn filesystem_store_reports_unreadable_blob_as_unavailable() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemContentStore::new(tmp.path());
        let cid = ContentId::for_bytes(b"directory in the way");
        fs::create_dir_all(tmp.path().join(cid.as_str())).unwrap();
        let err = store.get(&cid).await.unwrap_err();
        assert!(matches!(err, AppError::StorageUnavailable(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn filesystem_store_restricts_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let store = FilesystemContentStore::new(tmp.path());
        let cid = store.put(b"private".to_vec()).await.unwrap();
        let mode = fs::metadata(tmp.path().join(cid.as_str()))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
