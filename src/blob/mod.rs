//! Blob store: key-addressable storage for job payload files
//!
//! `FsBlobStore` maps each key to a file under a root directory. Keys are
//! sanitised to a single path component so a key can never escape the root.

use crate::error::StorageError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stream the blob stored under `key` into `destination`.
    async fn download_file(
        &self,
        key: &str,
        destination: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, StorageError>;

    /// Store everything readable from `source` under `key`, replacing any
    /// previous blob.
    async fn upload_file(
        &self,
        source: &mut (dyn AsyncRead + Unpin + Send),
        key: &str,
    ) -> Result<u64, StorageError>;
}

/// Filesystem-backed blob store
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create or open a store rooted at `root`
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        if key.is_empty() || key == "." || key == ".." {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        let safe_key: String = key
            .chars()
            .map(|c| if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
            .collect();
        Ok(self.root.join(safe_key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn download_file(
        &self,
        key: &str,
        destination: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64, StorageError> {
        let path = self.blob_path(key)?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let bytes = tokio::io::copy(&mut file, &mut *destination).await?;
        destination.flush().await?;
        debug!(key = key, bytes = bytes, "Blob downloaded");
        Ok(bytes)
    }

    async fn upload_file(
        &self,
        source: &mut (dyn AsyncRead + Unpin + Send),
        key: &str,
    ) -> Result<u64, StorageError> {
        let path = self.blob_path(key)?;
        let mut partial = path.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        let mut file = tokio::fs::File::create(&partial).await?;
        let bytes = tokio::io::copy(source, &mut file).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&partial, &path).await?;

        debug!(key = key, bytes = bytes, "Blob uploaded");
        Ok(bytes)
    }
}
