//! Post accessors
//!
//! Original posts carry `ref_hash = NULL`; amendments point at the original.
//! The visible content of a post is the newest among the original and its
//! amendments, ties broken by item hash.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::NodeError;

#[derive(Debug, Clone)]
pub struct PostRow {
    pub item_hash: String,
    pub address: String,
    pub post_type: String,
    pub ref_hash: Option<String>,
    pub content: Option<Value>,
    pub time: f64,
    pub channel: String,
}

fn post_from_row(row: &rusqlite::Row) -> Result<PostRow, rusqlite::Error> {
    let content: Option<String> = row.get(4)?;
    let content = match content {
        Some(text) => Some(
            serde_json::from_str(&text)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        ),
        None => None,
    };
    Ok(PostRow {
        item_hash: row.get(0)?,
        address: row.get(1)?,
        post_type: row.get(2)?,
        ref_hash: row.get(3)?,
        content,
        time: row.get(5)?,
        channel: row.get(6)?,
    })
}

const POST_COLUMNS: &str = "item_hash, address, type, ref_hash, content, time, channel";

pub fn insert_post(conn: &Connection, post: &PostRow) -> Result<(), NodeError> {
    conn.execute(
        "INSERT OR IGNORE INTO post (item_hash, address, type, ref_hash, content, time, channel)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            post.item_hash,
            post.address,
            post.post_type,
            post.ref_hash,
            post.content
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            post.time,
            post.channel,
        ],
    )?;
    Ok(())
}

pub fn get_post(conn: &Connection, item_hash: &str) -> Result<Option<PostRow>, NodeError> {
    let row = conn
        .query_row(
            &format!("SELECT {POST_COLUMNS} FROM post WHERE item_hash = ?1"),
            params![item_hash],
            post_from_row,
        )
        .optional()?;
    Ok(row)
}

pub fn delete_post(conn: &Connection, item_hash: &str) -> Result<(), NodeError> {
    conn.execute("DELETE FROM post WHERE item_hash = ?1", params![item_hash])?;
    Ok(())
}

/// The revision whose content is visible for an original post: the original
/// or the amendment with the highest (time, item_hash).
pub fn get_effective_revision(
    conn: &Connection,
    original_hash: &str,
) -> Result<Option<PostRow>, NodeError> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {POST_COLUMNS} FROM post
                 WHERE item_hash = ?1 OR ref_hash = ?1
                 ORDER BY time DESC, item_hash DESC
                 LIMIT 1"
            ),
            params![original_hash],
            post_from_row,
        )
        .optional()?;
    Ok(row)
}

/// Amendments pointing at an original, for reversal bookkeeping.
pub fn amendment_hashes(conn: &Connection, original_hash: &str) -> Result<Vec<String>, NodeError> {
    let mut stmt = conn.prepare("SELECT item_hash FROM post WHERE ref_hash = ?1")?;
    let rows = stmt
        .query_map(params![original_hash], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use serde_json::json;

    fn post(hash: &str, ref_hash: Option<&str>, time: f64, body: &str) -> PostRow {
        PostRow {
            item_hash: hash.to_string(),
            address: "0xA".to_string(),
            post_type: "blog".to_string(),
            ref_hash: ref_hash.map(|s| s.to_string()),
            content: Some(json!({"body": body})),
            time,
            channel: "TEST".to_string(),
        }
    }

    #[test]
    fn newest_amendment_wins() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert_post(conn, &post("p0", None, 10.0, "A"))?;
            insert_post(conn, &post("p1", Some("p0"), 20.0, "B"))?;
            insert_post(conn, &post("p2", Some("p0"), 15.0, "C"))?;

            let visible = get_effective_revision(conn, "p0")?.unwrap();
            assert_eq!(visible.item_hash, "p1");
            assert_eq!(visible.content, Some(json!({"body": "B"})));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn original_visible_when_unamended() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| {
            insert_post(conn, &post("p0", None, 10.0, "A"))?;
            let visible = get_effective_revision(conn, "p0")?.unwrap();
            assert_eq!(visible.item_hash, "p0");
            Ok(())
        })
        .unwrap();
    }
}
