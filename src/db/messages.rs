//! Confirmed message accessors

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::error::NodeError;
use crate::types::{Chain, Confirmation, ItemType, MessageType};

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub item_hash: String,
    pub sender: String,
    pub chain: Chain,
    pub signature: String,
    pub message_type: MessageType,
    pub channel: String,
    pub time: f64,
    pub item_type: ItemType,
    /// None once the message has been forgotten
    pub content: Option<Value>,
    pub size: u64,
    pub forgotten_by: Option<String>,
}

impl MessageRow {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        fn parse_err(e: NodeError) -> rusqlite::Error {
            rusqlite::Error::ToSqlConversionFailure(Box::new(e))
        }

        let chain: String = row.get("chain")?;
        let message_type: String = row.get("type")?;
        let item_type: String = row.get("item_type")?;
        let content: Option<String> = row.get("content")?;
        let content = match content {
            Some(text) => Some(
                serde_json::from_str(&text)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            ),
            None => None,
        };

        Ok(Self {
            item_hash: row.get("item_hash")?,
            sender: row.get("sender")?,
            chain: Chain::parse(&chain).map_err(parse_err)?,
            signature: row.get("signature")?,
            message_type: MessageType::parse(&message_type).map_err(parse_err)?,
            channel: row.get("channel")?,
            time: row.get("time")?,
            item_type: ItemType::parse(&item_type).map_err(parse_err)?,
            content,
            size: row.get("size")?,
            forgotten_by: row.get("forgotten_by")?,
        })
    }
}

const MESSAGE_COLUMNS: &str = "item_hash, sender, chain, signature, type, channel, time, \
     item_type, content, size, forgotten_by";

pub fn message_exists(conn: &Connection, item_hash: &str) -> Result<bool, NodeError> {
    let count: u64 = conn.query_row(
        "SELECT COUNT(*) FROM message WHERE item_hash = ?1",
        params![item_hash],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

pub fn get_message(conn: &Connection, item_hash: &str) -> Result<Option<MessageRow>, NodeError> {
    let row = conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM message WHERE item_hash = ?1"),
            params![item_hash],
            MessageRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Promote a validated message. The caller runs this inside the same
/// transaction as the handler effects so a crash leaves no partial state.
#[allow(clippy::too_many_arguments)]
pub fn insert_message(
    conn: &Connection,
    item_hash: &str,
    sender: &str,
    chain: Chain,
    signature: &str,
    message_type: MessageType,
    channel: &str,
    time: f64,
    item_type: ItemType,
    content: &Value,
    size: u64,
    now: i64,
) -> Result<(), NodeError> {
    conn.execute(
        "INSERT INTO message
            (item_hash, sender, chain, signature, type, channel, time, item_type,
             content, size, processed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            item_hash,
            sender,
            chain.as_str(),
            signature,
            message_type.as_str(),
            channel,
            time,
            item_type.as_str(),
            serde_json::to_string(content)?,
            size,
            now,
        ],
    )?;
    Ok(())
}

/// Merge a confirmation into the message's set. Idempotent.
pub fn upsert_confirmation(
    conn: &Connection,
    item_hash: &str,
    confirmation: &Confirmation,
) -> Result<bool, NodeError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO message_confirmation (item_hash, chain, height, tx_hash)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            item_hash,
            confirmation.chain.as_str(),
            confirmation.height,
            confirmation.tx_hash,
        ],
    )?;
    Ok(inserted > 0)
}

pub fn get_confirmations(
    conn: &Connection,
    item_hash: &str,
) -> Result<Vec<Confirmation>, NodeError> {
    let mut stmt = conn.prepare(
        "SELECT chain, height, tx_hash FROM message_confirmation
         WHERE item_hash = ?1 ORDER BY chain, height",
    )?;
    let rows = stmt
        .query_map(params![item_hash], |row| {
            let chain: String = row.get(0)?;
            Ok(Confirmation {
                chain: Chain::parse(&chain)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
                height: row.get(1)?,
                tx_hash: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Tombstone a message: null the content, keep the row.
pub fn forget_message_row(
    conn: &Connection,
    item_hash: &str,
    forgotten_by: &str,
) -> Result<(), NodeError> {
    conn.execute(
        "UPDATE message SET content = NULL, forgotten_by = ?2 WHERE item_hash = ?1",
        params![item_hash, forgotten_by],
    )?;
    Ok(())
}

pub fn count_messages(conn: &Connection) -> Result<u64, NodeError> {
    Ok(conn.query_row("SELECT COUNT(*) FROM message", [], |r| r.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    #[test]
    fn confirmations_merge_as_a_set() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert_message(
                conn,
                "h1",
                "0xA",
                Chain::Eth,
                "0xsig",
                MessageType::Post,
                "TEST",
                100.0,
                ItemType::Inline,
                &serde_json::json!({"address": "0xA"}),
                10,
                1,
            )?;

            let conf = Confirmation {
                chain: Chain::Eth,
                height: 10,
                tx_hash: "0xtx".to_string(),
            };
            assert!(upsert_confirmation(conn, "h1", &conf)?);
            assert!(!upsert_confirmation(conn, "h1", &conf)?);

            let conf2 = Confirmation {
                chain: Chain::Bnb,
                height: 22,
                tx_hash: "0xother".to_string(),
            };
            assert!(upsert_confirmation(conn, "h1", &conf2)?);

            assert_eq!(get_confirmations(conn, "h1")?.len(), 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn forgetting_nulls_content_but_keeps_row() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert_message(
                conn,
                "h1",
                "0xA",
                Chain::Eth,
                "0xsig",
                MessageType::Post,
                "TEST",
                100.0,
                ItemType::Inline,
                &serde_json::json!({"body": "hello"}),
                10,
                1,
            )?;

            forget_message_row(conn, "h1", "hforget")?;

            let row = get_message(conn, "h1")?.unwrap();
            assert!(row.content.is_none());
            assert_eq!(row.forgotten_by.as_deref(), Some("hforget"));
            Ok(())
        })
        .unwrap();
    }
}
