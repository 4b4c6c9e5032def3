//! Content-addressed storage
//!
//! Two backends behind one interface: the local object store (SHA-256 keyed)
//! and the IPFS daemon (CIDv0 keyed). Remote content fetched once is
//! persisted locally so later readers stay local.

pub mod gc;
pub mod ipfs;
pub mod local;

use serde_json::Value;
use tracing::debug;

use crate::error::NodeError;
use crate::types::ItemType;
pub use ipfs::IpfsClient;
pub use local::ObjectStore;

pub struct StorageService {
    local: ObjectStore,
    ipfs: Option<IpfsClient>,
}

impl StorageService {
    pub fn new(local: ObjectStore, ipfs: Option<IpfsClient>) -> Self {
        Self { local, ipfs }
    }

    pub fn local(&self) -> &ObjectStore {
        &self.local
    }

    /// Fetch content by hash. `engine` selects the backend: `storage` reads
    /// the local object store, `ipfs` reads the local cache first and falls
    /// back to the daemon, persisting on a hit.
    pub async fn get_content(&self, hash: &str, engine: ItemType) -> Result<Vec<u8>, NodeError> {
        match engine {
            ItemType::Storage => self.local.get(hash).await,
            ItemType::Ipfs => {
                if let Ok(data) = self.local.get(hash).await {
                    return Ok(data);
                }
                let ipfs = self
                    .ipfs
                    .as_ref()
                    .ok_or_else(|| NodeError::Ipfs("IPFS disabled".to_string()))?;
                let data = ipfs.block_get(hash).await?;

                // Cache under the CID so the next reader is local
                self.local.put_at(hash, &data).await?;
                debug!(cid = %hash, size = data.len(), "Fetched and cached IPFS content");
                Ok(data)
            }
            ItemType::Inline => Err(NodeError::Internal(
                "inline content is carried in the envelope".to_string(),
            )),
        }
    }

    pub async fn get_json(&self, hash: &str, engine: ItemType) -> Result<Value, NodeError> {
        let bytes = self.get_content(hash, engine).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Store raw bytes locally, returning the SHA-256 hash.
    pub async fn add_bytes(&self, data: &[u8]) -> Result<String, NodeError> {
        self.local.put(data).await
    }

    pub async fn exists(&self, hash: &str, engine: ItemType) -> bool {
        match engine {
            ItemType::Ipfs | ItemType::Storage => self.local.exists(hash).await,
            ItemType::Inline => false,
        }
    }

    /// Pin content so GC will not reclaim it on the remote side. Local
    /// objects have nothing to pin.
    pub async fn pin(&self, hash: &str, engine: ItemType) -> Result<(), NodeError> {
        if engine == ItemType::Ipfs {
            if let Some(ipfs) = &self.ipfs {
                ipfs.pin_add(hash).await?;
            }
        }
        Ok(())
    }

    pub async fn unpin(&self, hash: &str, engine: ItemType) -> Result<(), NodeError> {
        if engine == ItemType::Ipfs {
            if let Some(ipfs) = &self.ipfs {
                ipfs.pin_rm(hash).await?;
            }
        }
        Ok(())
    }

    /// Remove the local copy. For IPFS content this drops the cache; the
    /// daemon copy goes away on its next repo GC after unpinning.
    pub async fn delete_local(&self, hash: &str) -> Result<(), NodeError> {
        self.local.delete(hash).await
    }

    /// Size of a locally held object.
    pub async fn size(&self, hash: &str) -> Result<u64, NodeError> {
        self.local.size(hash).await
    }
}
