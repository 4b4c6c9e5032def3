//! Aggregate elements and their materialised views
//!
//! An aggregate is the deep merge of all AGGREGATE message contents for one
//! (address, key), folded in content-time order. Elements are kept raw so the
//! view can be refolded after out-of-order arrivals or forgets.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::config::TieBreak;
use crate::error::NodeError;

#[derive(Debug, Clone)]
pub struct AggregateElementRow {
    pub item_hash: String,
    pub address: String,
    pub key: String,
    pub content: Value,
    pub creation_time: f64,
}

#[derive(Debug, Clone)]
pub struct AggregateRow {
    pub address: String,
    pub key: String,
    pub content: Value,
    pub creation_time: f64,
    pub last_revision_time: f64,
    pub last_revision_hash: String,
}

/// Deep-merge `patch` into `base`: objects merge recursively, any other
/// value replaces, an explicit null removes the key.
pub fn deep_merge(base: &mut Value, patch: &Value) {
    let Some(patch_map) = patch.as_object() else {
        *base = patch.clone();
        return;
    };

    if !base.is_object() {
        *base = Value::Object(serde_json::Map::new());
    }
    let base_map = base.as_object_mut().expect("base coerced to object");

    for (key, patch_value) in patch_map {
        if patch_value.is_null() {
            base_map.remove(key);
        } else if patch_value.is_object() {
            let slot = base_map
                .entry(key.clone())
                .or_insert(Value::Object(serde_json::Map::new()));
            deep_merge(slot, patch_value);
        } else {
            base_map.insert(key.clone(), patch_value.clone());
        }
    }
}

pub fn insert_element(conn: &Connection, element: &AggregateElementRow) -> Result<(), NodeError> {
    conn.execute(
        "INSERT OR IGNORE INTO aggregate_element
            (item_hash, address, key, content, creation_time)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            element.item_hash,
            element.address,
            element.key,
            serde_json::to_string(&element.content)?,
            element.creation_time,
        ],
    )?;
    Ok(())
}

pub fn delete_element(conn: &Connection, item_hash: &str) -> Result<Option<(String, String)>, NodeError> {
    let owner = conn
        .query_row(
            "DELETE FROM aggregate_element WHERE item_hash = ?1 RETURNING address, key",
            params![item_hash],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(owner)
}

pub fn get_element(conn: &Connection, item_hash: &str) -> Result<Option<AggregateElementRow>, NodeError> {
    let row = conn
        .query_row(
            "SELECT item_hash, address, key, content, creation_time
             FROM aggregate_element WHERE item_hash = ?1",
            params![item_hash],
            element_from_row,
        )
        .optional()?;
    Ok(row)
}

fn element_from_row(row: &rusqlite::Row) -> Result<AggregateElementRow, rusqlite::Error> {
    let content: String = row.get(3)?;
    Ok(AggregateElementRow {
        item_hash: row.get(0)?,
        address: row.get(1)?,
        key: row.get(2)?,
        content: serde_json::from_str(&content)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        creation_time: row.get(4)?,
    })
}

/// All elements for one aggregate, in fold order.
pub fn get_elements(
    conn: &Connection,
    address: &str,
    key: &str,
    tie_break: TieBreak,
) -> Result<Vec<AggregateElementRow>, NodeError> {
    let order = match tie_break {
        TieBreak::ItemHashAsc => "creation_time ASC, item_hash ASC",
        TieBreak::ItemHashDesc => "creation_time ASC, item_hash DESC",
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT item_hash, address, key, content, creation_time
         FROM aggregate_element WHERE address = ?1 AND key = ?2
         ORDER BY {order}"
    ))?;
    let rows = stmt
        .query_map(params![address, key], element_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn element_hashes_for_key(
    conn: &Connection,
    address: &str,
    key: &str,
) -> Result<Vec<String>, NodeError> {
    let mut stmt = conn.prepare(
        "SELECT item_hash FROM aggregate_element WHERE address = ?1 AND key = ?2",
    )?;
    let rows = stmt
        .query_map(params![address, key], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_aggregate(
    conn: &Connection,
    address: &str,
    key: &str,
) -> Result<Option<AggregateRow>, NodeError> {
    let row = conn
        .query_row(
            "SELECT address, key, content, creation_time, last_revision_time, last_revision_hash
             FROM aggregate WHERE address = ?1 AND key = ?2",
            params![address, key],
            |row| {
                let content: String = row.get(2)?;
                Ok(AggregateRow {
                    address: row.get(0)?,
                    key: row.get(1)?,
                    content: serde_json::from_str(&content)
                        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
                    creation_time: row.get(3)?,
                    last_revision_time: row.get(4)?,
                    last_revision_hash: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn upsert_aggregate(conn: &Connection, aggregate: &AggregateRow) -> Result<(), NodeError> {
    conn.execute(
        "INSERT INTO aggregate
            (address, key, content, creation_time, last_revision_time, last_revision_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (address, key) DO UPDATE SET
            content = excluded.content,
            creation_time = excluded.creation_time,
            last_revision_time = excluded.last_revision_time,
            last_revision_hash = excluded.last_revision_hash",
        params![
            aggregate.address,
            aggregate.key,
            serde_json::to_string(&aggregate.content)?,
            aggregate.creation_time,
            aggregate.last_revision_time,
            aggregate.last_revision_hash,
        ],
    )?;
    Ok(())
}

/// Rebuild the materialised view from the raw elements. Deletes the view if
/// no elements remain. The fold order makes the result independent of the
/// order messages were processed in.
pub fn refresh_aggregate(
    conn: &Connection,
    address: &str,
    key: &str,
    tie_break: TieBreak,
) -> Result<(), NodeError> {
    let elements = get_elements(conn, address, key, tie_break)?;

    let Some(last) = elements.last() else {
        conn.execute(
            "DELETE FROM aggregate WHERE address = ?1 AND key = ?2",
            params![address, key],
        )?;
        return Ok(());
    };

    let mut content = Value::Object(serde_json::Map::new());
    for element in &elements {
        deep_merge(&mut content, &element.content);
    }

    upsert_aggregate(
        conn,
        &AggregateRow {
            address: address.to_string(),
            key: key.to_string(),
            content,
            creation_time: elements[0].creation_time,
            last_revision_time: last.creation_time,
            last_revision_hash: last.item_hash.clone(),
        },
    )
}
