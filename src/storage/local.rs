//! Content-addressed local object store
//!
//! Objects live under `{root}/objects/{hh}/{hash}` where `hh` is the first
//! two hex chars of the SHA-256 hash. Writes go through a temp file and an
//! atomic rename, so concurrent writers of the same object are safe and a
//! crash never leaves a partial object at its final path.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::NodeError;
use crate::types::sha256_hex;

pub struct ObjectStore {
    root_dir: PathBuf,
}

impl ObjectStore {
    /// Create an object store rooted at the given directory
    pub async fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self, NodeError> {
        let root_dir = root_dir.as_ref().to_path_buf();

        fs::create_dir_all(root_dir.join("objects")).await?;
        fs::create_dir_all(root_dir.join("tmp")).await?;

        info!(path = %root_dir.display(), "Initialized object store");

        Ok(Self { root_dir })
    }

    fn object_path(&self, hash: &str) -> PathBuf {
        let subdir = &hash[..2.min(hash.len())];
        self.root_dir.join("objects").join(subdir).join(hash)
    }

    /// Store raw bytes, returning their SHA-256 hex hash. Duplicate puts are
    /// idempotent: the object is keyed by its own digest.
    pub async fn put(&self, data: &[u8]) -> Result<String, NodeError> {
        let hash = sha256_hex(data);
        let path = self.object_path(&hash);

        if fs::metadata(&path).await.is_ok() {
            debug!(hash = %hash, "Object already exists");
            return Ok(hash);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = self
            .root_dir
            .join("tmp")
            .join(format!("{}-{}", uuid::Uuid::new_v4(), &hash[..8]));
        let mut tmp = fs::File::create(&tmp_path).await?;
        tmp.write_all(data).await?;
        tmp.sync_all().await?;
        drop(tmp);

        fs::rename(&tmp_path, &path).await?;

        debug!(hash = %hash, size = data.len(), "Stored object");
        Ok(hash)
    }

    /// Store bytes under a caller-supplied key. Used to cache IPFS content
    /// under its CID; the bytes are not re-hashed.
    pub async fn put_at(&self, key: &str, data: &[u8]) -> Result<(), NodeError> {
        let path = self.object_path(key);

        if fs::metadata(&path).await.is_ok() {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = self
            .root_dir
            .join("tmp")
            .join(format!("{}-{}", uuid::Uuid::new_v4(), &key[..8.min(key.len())]));
        let mut tmp = fs::File::create(&tmp_path).await?;
        tmp.write_all(data).await?;
        tmp.sync_all().await?;
        drop(tmp);

        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    pub async fn get(&self, hash: &str) -> Result<Vec<u8>, NodeError> {
        match fs::read(self.object_path(hash)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(NodeError::NotFound(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, hash: &str) -> bool {
        fs::metadata(self.object_path(hash)).await.is_ok()
    }

    pub async fn size(&self, hash: &str) -> Result<u64, NodeError> {
        match fs::metadata(self.object_path(hash)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(NodeError::NotFound(hash.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, hash: &str) -> Result<(), NodeError> {
        match fs::remove_file(self.object_path(hash)).await {
            Ok(()) => {
                debug!(hash = %hash, "Deleted object");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
