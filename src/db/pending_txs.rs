//! Pending-transaction queue accessors

use rusqlite::{params, Connection, Row};

use crate::error::NodeError;
use crate::types::Chain;

/// How the batched payload is carried: inline JSON array or a CAS reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxProtocol {
    BatchInline,
    BatchRef,
}

impl TxProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxProtocol::BatchInline => "batch_inline",
            TxProtocol::BatchRef => "batch_ref",
        }
    }

    pub fn parse(s: &str) -> Result<Self, NodeError> {
        match s {
            "batch_inline" => Ok(TxProtocol::BatchInline),
            "batch_ref" => Ok(TxProtocol::BatchRef),
            other => Err(NodeError::InvalidMessage(format!(
                "unknown tx protocol: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingTxRow {
    pub chain: Chain,
    pub tx_hash: String,
    pub height: u64,
    pub tx_index: u64,
    pub publisher: String,
    pub protocol: TxProtocol,
    /// JSON array text for `batch_inline`, content hash for `batch_ref`
    pub payload: String,
    pub retries: u32,
    pub next_attempt_at: i64,
}

impl PendingTxRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let chain: String = row.get("chain")?;
        let protocol: String = row.get("protocol")?;
        Ok(Self {
            chain: Chain::parse(&chain)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            tx_hash: row.get("tx_hash")?,
            height: row.get("height")?,
            tx_index: row.get("tx_index")?,
            publisher: row.get("publisher")?,
            protocol: TxProtocol::parse(&protocol)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            payload: row.get("payload")?,
            retries: row.get("retries")?,
            next_attempt_at: row.get("next_attempt_at")?,
        })
    }
}

/// Idempotent insert keyed on (chain, tx_hash). Re-scans after a reorg hit
/// the conflict branch and change nothing.
pub fn upsert_pending_tx(conn: &Connection, tx: &PendingTxRow, now: i64) -> Result<bool, NodeError> {
    let inserted = conn.execute(
        "INSERT INTO pending_tx
            (chain, tx_hash, height, tx_index, publisher, protocol, payload,
             retries, next_attempt_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0, ?8)
         ON CONFLICT (chain, tx_hash) DO NOTHING",
        params![
            tx.chain.as_str(),
            tx.tx_hash,
            tx.height,
            tx.tx_index,
            tx.publisher,
            tx.protocol.as_str(),
            tx.payload,
            now,
        ],
    )?;
    Ok(inserted > 0)
}

/// Atomically claim up to `limit` due transactions. Expired claims
/// (older than `claim_timeout` seconds) are re-claimable.
pub fn claim_due(
    conn: &Connection,
    now: i64,
    claim_timeout: i64,
    limit: usize,
) -> Result<Vec<PendingTxRow>, NodeError> {
    let mut stmt = conn.prepare(
        "UPDATE pending_tx SET claimed_at = ?1
         WHERE (chain, tx_hash) IN (
             SELECT chain, tx_hash FROM pending_tx
             WHERE next_attempt_at <= ?1
               AND (claimed_at IS NULL OR claimed_at <= ?2)
             ORDER BY height ASC, tx_index ASC
             LIMIT ?3
         )
         RETURNING chain, tx_hash, height, tx_index, publisher, protocol,
                   payload, retries, next_attempt_at",
    )?;

    let rows = stmt
        .query_map(params![now, now - claim_timeout, limit as i64], |row| {
            PendingTxRow::from_row(row)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Release a claim and push the next attempt out by `delay` seconds.
pub fn reschedule(
    conn: &Connection,
    chain: Chain,
    tx_hash: &str,
    now: i64,
    delay: i64,
) -> Result<(), NodeError> {
    conn.execute(
        "UPDATE pending_tx
         SET retries = retries + 1, next_attempt_at = ?3, claimed_at = NULL
         WHERE chain = ?1 AND tx_hash = ?2",
        params![chain.as_str(), tx_hash, now + delay],
    )?;
    Ok(())
}

pub fn delete_pending_tx(conn: &Connection, chain: Chain, tx_hash: &str) -> Result<(), NodeError> {
    conn.execute(
        "DELETE FROM pending_tx WHERE chain = ?1 AND tx_hash = ?2",
        params![chain.as_str(), tx_hash],
    )?;
    Ok(())
}

/// Drop a transaction for good and record why.
pub fn reject_pending_tx(
    conn: &Connection,
    chain: Chain,
    tx_hash: &str,
    reason: &str,
    now: i64,
) -> Result<(), NodeError> {
    conn.execute(
        "INSERT INTO rejected_tx (chain, tx_hash, reason, rejected_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (chain, tx_hash) DO UPDATE SET reason = excluded.reason",
        params![chain.as_str(), tx_hash, reason, now],
    )?;
    delete_pending_tx(conn, chain, tx_hash)
}

pub fn count_pending_txs(conn: &Connection) -> Result<u64, NodeError> {
    Ok(conn.query_row("SELECT COUNT(*) FROM pending_tx", [], |r| r.get(0))?)
}
