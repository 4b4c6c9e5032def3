//! SQLite-backed relational store
//!
//! Durable state for the whole pipeline: the pending work queues, confirmed
//! messages, the derived tables built by the content handlers, balances and
//! chain cursors.
//!
//! Queue claims use single-statement `UPDATE ... RETURNING`, which under
//! SQLite's serialised writers gives the same effect as row locks with
//! skip-locked semantics: a row is claimed exactly once until its claim
//! expires.

pub mod aggregates;
pub mod balances;
pub mod chains;
pub mod files;
pub mod messages;
pub mod pending_messages;
pub mod pending_txs;
pub mod posts;
pub mod programs;
pub mod schema;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::NodeError;

/// Shared handle to the node database
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    /// Open or create the database
    pub fn open(data_dir: &Path) -> Result<Self, NodeError> {
        let db_path = data_dir.join("ccn.db");
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(&db_path)?;

        // WAL keeps readers unblocked while a writer commits
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, NodeError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<(), NodeError> {
        self.with_conn(|conn| schema::init_schema(conn))
    }

    /// Run a read against the connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, NodeError>
    where
        F: FnOnce(&Connection) -> Result<T, NodeError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| NodeError::Internal(format!("lock poisoned: {e}")))?;
        f(&conn)
    }

    /// Run a write (or transaction) with exclusive access
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, NodeError>
    where
        F: FnOnce(&mut Connection) -> Result<T, NodeError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| NodeError::Internal(format!("lock poisoned: {e}")))?;
        f(&mut conn)
    }

    /// Gauge values exposed to the external metrics component
    pub fn metrics(&self) -> Result<NodeMetrics, NodeError> {
        self.with_conn(|conn| {
            let pending_messages_total: u64 =
                conn.query_row("SELECT COUNT(*) FROM pending_message", [], |r| r.get(0))?;
            let pending_txs_total: u64 =
                conn.query_row("SELECT COUNT(*) FROM pending_tx", [], |r| r.get(0))?;
            let messages_total: u64 =
                conn.query_row("SELECT COUNT(*) FROM message", [], |r| r.get(0))?;

            let mut stmt = conn.prepare("SELECT chain, last_height FROM chain_cursor")?;
            let last_committed_height = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            Ok(NodeMetrics {
                pending_messages_total,
                pending_txs_total,
                messages_total,
                last_committed_height,
            })
        })
    }
}

/// Snapshot of the pipeline gauges
#[derive(Debug, Clone, Serialize)]
pub struct NodeMetrics {
    pub pending_messages_total: u64,
    pub pending_txs_total: u64,
    pub messages_total: u64,
    pub last_committed_height: Vec<(String, u64)>,
}

/// Wall-clock seconds since the epoch
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_and_migrates_in_memory() {
        let db = Db::open_in_memory().unwrap();
        let metrics = db.metrics().unwrap();
        assert_eq!(metrics.pending_messages_total, 0);
        assert_eq!(metrics.messages_total, 0);
    }
}
