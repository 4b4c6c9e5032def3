//! Pending-message queue accessors

use rusqlite::{params, Connection, Row};

use crate::error::NodeError;
use crate::types::{Chain, Confirmation, ItemType, MessageEnvelope, MessageOrigin, MessageType};

#[derive(Debug, Clone)]
pub struct PendingMessageRow {
    pub id: i64,
    pub envelope: MessageEnvelope,
    pub origin: MessageOrigin,
    pub confirmation: Option<Confirmation>,
    pub retries: u32,
    pub next_attempt_at: i64,
    pub check_message: bool,
}

impl PendingMessageRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        fn parse_err(e: NodeError) -> rusqlite::Error {
            rusqlite::Error::ToSqlConversionFailure(Box::new(e))
        }

        let chain: String = row.get("chain")?;
        let message_type: String = row.get("type")?;
        let item_type: String = row.get("item_type")?;
        let origin: String = row.get("origin")?;

        let confirmation = match row.get::<_, Option<String>>("conf_chain")? {
            Some(conf_chain) => Some(Confirmation {
                chain: Chain::parse(&conf_chain).map_err(parse_err)?,
                height: row.get("conf_height")?,
                tx_hash: row.get("conf_tx_hash")?,
            }),
            None => None,
        };

        Ok(Self {
            id: row.get("id")?,
            envelope: MessageEnvelope {
                chain: Chain::parse(&chain).map_err(parse_err)?,
                sender: row.get("sender")?,
                message_type: MessageType::parse(&message_type).map_err(parse_err)?,
                channel: row.get("channel")?,
                time: row.get("time")?,
                item_type: ItemType::parse(&item_type).map_err(parse_err)?,
                item_hash: row.get("item_hash")?,
                item_content: row.get("item_content")?,
                signature: row.get("signature")?,
            },
            origin: MessageOrigin::parse(&origin).map_err(parse_err)?,
            confirmation,
            retries: row.get("retries")?,
            next_attempt_at: row.get("next_attempt_at")?,
            check_message: row.get("check_message")?,
        })
    }
}

const PENDING_COLUMNS: &str = "id, item_hash, sender, chain, signature, type, channel, time, \
     item_type, item_content, origin, conf_chain, conf_height, conf_tx_hash, \
     retries, next_attempt_at, check_message";

/// Enqueue an envelope. Duplicate (item_hash, confirmation) pairs are
/// silently ignored, which keeps both P2P re-announcements and chain
/// re-scans idempotent.
pub fn insert_pending_message(
    conn: &Connection,
    envelope: &MessageEnvelope,
    origin: MessageOrigin,
    confirmation: Option<&Confirmation>,
    check_message: bool,
    now: i64,
) -> Result<bool, NodeError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO pending_message
            (item_hash, sender, chain, signature, type, channel, time, item_type,
             item_content, origin, conf_chain, conf_height, conf_tx_hash,
             retries, next_attempt_at, check_message, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0, 0, ?14, ?15)",
        params![
            envelope.item_hash,
            envelope.sender,
            envelope.chain.as_str(),
            envelope.signature,
            envelope.message_type.as_str(),
            envelope.channel,
            envelope.time,
            envelope.item_type.as_str(),
            envelope.item_content,
            origin.as_str(),
            confirmation.map(|c| c.chain.as_str()),
            confirmation.map(|c| c.height),
            confirmation.map(|c| c.tx_hash.as_str()),
            check_message,
            now,
        ],
    )?;
    Ok(inserted > 0)
}

/// Atomically claim up to `limit` due rows of the allowed types.
pub fn claim_due(
    conn: &Connection,
    now: i64,
    claim_timeout: i64,
    limit: usize,
    allowed_types: &[MessageType],
) -> Result<Vec<PendingMessageRow>, NodeError> {
    if allowed_types.is_empty() {
        return Ok(Vec::new());
    }

    let type_placeholders = (0..allowed_types.len())
        .map(|i| format!("?{}", i + 4))
        .collect::<Vec<_>>()
        .join(", ");

    let sql = format!(
        "UPDATE pending_message SET claimed_at = ?1
         WHERE id IN (
             SELECT id FROM pending_message
             WHERE next_attempt_at <= ?1
               AND (claimed_at IS NULL OR claimed_at <= ?2)
               AND type IN ({type_placeholders})
             ORDER BY time ASC, id ASC
             LIMIT ?3
         )
         RETURNING {PENDING_COLUMNS}"
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![
        Box::new(now),
        Box::new(now - claim_timeout),
        Box::new(limit as i64),
    ];
    for mt in allowed_types {
        params_vec.push(Box::new(mt.as_str()));
    }

    let rows = stmt
        .query_map(
            rusqlite::params_from_iter(params_vec.iter().map(|p| p.as_ref())),
            PendingMessageRow::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn pending_exists(conn: &Connection, item_hash: &str) -> Result<bool, NodeError> {
    let count: u64 = conn.query_row(
        "SELECT COUNT(*) FROM pending_message WHERE item_hash = ?1",
        params![item_hash],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

/// Release the claim and push the next attempt out by `delay` seconds.
pub fn reschedule(conn: &Connection, id: i64, now: i64, delay: i64) -> Result<(), NodeError> {
    conn.execute(
        "UPDATE pending_message
         SET retries = retries + 1, next_attempt_at = ?2, claimed_at = NULL
         WHERE id = ?1",
        params![id, now + delay],
    )?;
    Ok(())
}

pub fn delete_pending_message(conn: &Connection, id: i64) -> Result<(), NodeError> {
    conn.execute("DELETE FROM pending_message WHERE id = ?1", params![id])?;
    Ok(())
}

/// Record a terminal rejection and drop the row from the live queue.
pub fn reject_pending_message(
    conn: &Connection,
    row: &PendingMessageRow,
    reason: &str,
    now: i64,
) -> Result<(), NodeError> {
    conn.execute(
        "INSERT INTO rejected_message (item_hash, sender, type, reason, rejected_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (item_hash) DO UPDATE SET reason = excluded.reason",
        params![
            row.envelope.item_hash,
            row.envelope.sender,
            row.envelope.message_type.as_str(),
            reason,
            now,
        ],
    )?;
    delete_pending_message(conn, row.id)
}

pub fn count_pending_messages(conn: &Connection) -> Result<u64, NodeError> {
    Ok(conn.query_row("SELECT COUNT(*) FROM pending_message", [], |r| r.get(0))?)
}
