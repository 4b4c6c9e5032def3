//! Chain indexer cursors, advanced monotonically by each indexer

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::NodeError;
use crate::types::Chain;

#[derive(Debug, Clone)]
pub struct ChainCursor {
    pub chain: Chain,
    pub last_height: u64,
    pub last_tx_hash: Option<String>,
}

pub fn get_cursor(conn: &Connection, chain: Chain) -> Result<Option<ChainCursor>, NodeError> {
    let row = conn
        .query_row(
            "SELECT last_height, last_tx_hash FROM chain_cursor WHERE chain = ?1",
            params![chain.as_str()],
            |row| {
                Ok(ChainCursor {
                    chain,
                    last_height: row.get(0)?,
                    last_tx_hash: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Set the cursor. Reorg rewinds pass a lower height on purpose, so this
/// does not enforce monotonicity; the indexer does.
pub fn upsert_cursor(
    conn: &Connection,
    chain: Chain,
    height: u64,
    tx_hash: Option<&str>,
    now: i64,
) -> Result<(), NodeError> {
    conn.execute(
        "INSERT INTO chain_cursor (chain, last_height, last_tx_hash, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (chain) DO UPDATE SET
            last_height = excluded.last_height,
            last_tx_hash = excluded.last_tx_hash,
            updated_at = excluded.updated_at",
        params![chain.as_str(), height, tx_hash, now],
    )?;
    Ok(())
}
