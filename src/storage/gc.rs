//! Time-based garbage collector for stored files
//!
//! Collects files whose pin count reached zero and whose grace period has
//! elapsed. The STORE handler serialises pin mutations through the store, so
//! a file re-pinned between the query and the delete simply loses its
//! `pin_delete_at` and is skipped on the next pass; each pass re-reads the
//! row before acting.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::db::files::{self, FileStorage};
use crate::db::{unix_now, Db};
use crate::error::NodeError;
use crate::storage::StorageService;
use crate::types::ItemType;

pub struct GarbageCollector {
    db: Arc<Db>,
    storage: Arc<StorageService>,
    interval: Duration,
}

impl GarbageCollector {
    pub fn new(db: Arc<Db>, storage: Arc<StorageService>, interval_secs: u64) -> Self {
        Self {
            db,
            storage,
            interval: Duration::from_secs(interval_secs),
        }
    }

    /// Run until shutdown, one pass per interval.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_secs = self.interval.as_secs(), "Garbage collector started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.collect_once(unix_now()).await {
                        Ok(0) => debug!("GC pass: nothing to collect"),
                        Ok(n) => info!(collected = n, "GC pass complete"),
                        Err(e) => error!(error = %e, "GC pass failed"),
                    }
                }
                _ = shutdown.recv() => {
                    info!("Garbage collector stopping");
                    break;
                }
            }
        }
    }

    /// One collection pass. Idempotent: re-running over the same state
    /// deletes nothing twice.
    pub async fn collect_once(&self, now: i64) -> Result<u64, NodeError> {
        let candidates = self.db.with_conn(|conn| files::collectable_files(conn, now))?;

        let mut collected = 0u64;
        for file in candidates {
            // Re-read under the write lock: a STORE processed since the
            // query may have re-pinned the file.
            let still_due = self.db.with_conn(|conn| {
                Ok(files::get_file(conn, &file.file_hash)?
                    .map(|f| f.pin_count == 0 && f.pin_delete_at.is_some_and(|at| at <= now))
                    .unwrap_or(false))
            })?;
            if !still_due {
                continue;
            }

            let result = match file.storage {
                FileStorage::Ipfs => self.storage.unpin(&file.file_hash, ItemType::Ipfs).await,
                FileStorage::Local => Ok(()),
            };
            if let Err(e) = result {
                warn!(file = %file.file_hash, error = %e, "Unpin failed, retrying next pass");
                continue;
            }

            if let Err(e) = self.storage.delete_local(&file.file_hash).await {
                warn!(file = %file.file_hash, error = %e, "Local delete failed, retrying next pass");
                continue;
            }

            self.db
                .with_conn(|conn| files::delete_file_row(conn, &file.file_hash))?;
            debug!(file = %file.file_hash, "Collected file");
            collected += 1;
        }

        Ok(collected)
    }
}
