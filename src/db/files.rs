//! Stored-file index and pin bookkeeping
//!
//! `stored_file.pin_count` tracks confirmed, non-forgotten STORE messages
//! referencing the file. When it drops to zero the file is scheduled for
//! deletion after a grace period; the garbage collector does the actual
//! removal.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::NodeError;

/// Backend holding the file bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStorage {
    Local,
    Ipfs,
}

impl FileStorage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStorage::Local => "local",
            FileStorage::Ipfs => "ipfs",
        }
    }

    pub fn parse(s: &str) -> Result<Self, NodeError> {
        match s {
            "local" => Ok(FileStorage::Local),
            "ipfs" => Ok(FileStorage::Ipfs),
            other => Err(NodeError::InvalidMessage(format!(
                "unknown file storage: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredFileRow {
    pub file_hash: String,
    pub storage: FileStorage,
    pub size: u64,
    pub pin_count: u32,
    pub pin_delete_at: Option<i64>,
    pub last_access: i64,
}

fn file_from_row(row: &rusqlite::Row) -> Result<StoredFileRow, rusqlite::Error> {
    let storage: String = row.get(1)?;
    Ok(StoredFileRow {
        file_hash: row.get(0)?,
        storage: FileStorage::parse(&storage)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        size: row.get(2)?,
        pin_count: row.get(3)?,
        pin_delete_at: row.get(4)?,
        last_access: row.get(5)?,
    })
}

const FILE_COLUMNS: &str = "file_hash, storage, size, pin_count, pin_delete_at, last_access";

pub fn get_file(conn: &Connection, file_hash: &str) -> Result<Option<StoredFileRow>, NodeError> {
    let row = conn
        .query_row(
            &format!("SELECT {FILE_COLUMNS} FROM stored_file WHERE file_hash = ?1"),
            params![file_hash],
            file_from_row,
        )
        .optional()?;
    Ok(row)
}

pub fn upsert_file(
    conn: &Connection,
    file_hash: &str,
    storage: FileStorage,
    size: u64,
    now: i64,
) -> Result<(), NodeError> {
    conn.execute(
        "INSERT INTO stored_file (file_hash, storage, size, pin_count, pin_delete_at, last_access, created_at)
         VALUES (?1, ?2, ?3, 0, NULL, ?4, ?4)
         ON CONFLICT (file_hash) DO UPDATE SET
            size = MAX(stored_file.size, excluded.size),
            last_access = excluded.last_access",
        params![file_hash, storage.as_str(), size, now],
    )?;
    Ok(())
}

/// Record the STORE message's pin and bump the count. A 0 -> 1 transition
/// cancels any scheduled deletion. The tag is the update chain the pin
/// belongs to (the original STORE's item hash).
pub fn add_pin(
    conn: &Connection,
    item_hash: &str,
    file_hash: &str,
    owner: &str,
    tag: &str,
    now: i64,
) -> Result<(), NodeError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO file_pin (item_hash, file_hash, owner, tag, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![item_hash, file_hash, owner, tag, now],
    )?;
    if inserted > 0 {
        conn.execute(
            "UPDATE stored_file
             SET pin_count = pin_count + 1, pin_delete_at = NULL, last_access = ?2
             WHERE file_hash = ?1",
            params![file_hash, now],
        )?;
    }
    Ok(())
}

/// Remove a STORE message's pin, returning (file_hash, tag). On the last
/// pin, schedule deletion at `delete_at`.
pub fn remove_pin(
    conn: &Connection,
    item_hash: &str,
    delete_at: i64,
) -> Result<Option<(String, String)>, NodeError> {
    let removed: Option<(String, String)> = conn
        .query_row(
            "DELETE FROM file_pin WHERE item_hash = ?1 RETURNING file_hash, tag",
            params![item_hash],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    if let Some((ref file_hash, _)) = removed {
        conn.execute(
            "UPDATE stored_file
             SET pin_count = MAX(pin_count - 1, 0),
                 pin_delete_at = CASE WHEN pin_count <= 1 THEN ?2 ELSE pin_delete_at END
             WHERE file_hash = ?1",
            params![file_hash, delete_at],
        )?;
    }
    Ok(removed)
}

pub fn get_pin(conn: &Connection, item_hash: &str) -> Result<Option<String>, NodeError> {
    let row = conn
        .query_row(
            "SELECT file_hash FROM file_pin WHERE item_hash = ?1",
            params![item_hash],
            |row| row.get(0),
        )
        .optional()?;
    Ok(row)
}

#[derive(Debug, Clone)]
pub struct FileTagRow {
    pub tag: String,
    pub owner: String,
    pub file_hash: String,
}

pub fn get_tag(conn: &Connection, tag: &str) -> Result<Option<FileTagRow>, NodeError> {
    let row = conn
        .query_row(
            "SELECT tag, owner, file_hash FROM file_tag WHERE tag = ?1",
            params![tag],
            |row| {
                Ok(FileTagRow {
                    tag: row.get(0)?,
                    owner: row.get(1)?,
                    file_hash: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn upsert_tag(
    conn: &Connection,
    tag: &str,
    owner: &str,
    file_hash: &str,
    now: i64,
) -> Result<(), NodeError> {
    conn.execute(
        "INSERT INTO file_tag (tag, owner, file_hash, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (tag) DO UPDATE SET
            file_hash = excluded.file_hash,
            updated_at = excluded.updated_at",
        params![tag, owner, file_hash, now],
    )?;
    Ok(())
}

/// Re-point a tag at the newest surviving pin in its chain, or drop it when
/// the whole chain is gone. Called after a pin in the chain is removed.
pub fn refresh_tag(conn: &Connection, tag: &str, now: i64) -> Result<(), NodeError> {
    let latest: Option<(String, String)> = conn
        .query_row(
            "SELECT file_hash, owner FROM file_pin
             WHERE tag = ?1 ORDER BY created_at DESC, item_hash DESC LIMIT 1",
            params![tag],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match latest {
        Some((file_hash, owner)) => upsert_tag(conn, tag, &owner, &file_hash, now),
        None => {
            conn.execute("DELETE FROM file_tag WHERE tag = ?1", params![tag])?;
            Ok(())
        }
    }
}

/// Files eligible for collection: zero pins and a due deletion time.
pub fn collectable_files(conn: &Connection, now: i64) -> Result<Vec<StoredFileRow>, NodeError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FILE_COLUMNS} FROM stored_file
         WHERE pin_count = 0 AND pin_delete_at IS NOT NULL AND pin_delete_at <= ?1"
    ))?;
    let rows = stmt
        .query_map(params![now], file_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn delete_file_row(conn: &Connection, file_hash: &str) -> Result<(), NodeError> {
    conn.execute(
        "DELETE FROM stored_file WHERE file_hash = ?1",
        params![file_hash],
    )?;
    Ok(())
}

/// Schedule deletion regardless of pin state. Used by the balance
/// reconciler to flag overage files.
pub fn schedule_delete(conn: &Connection, file_hash: &str, at: i64) -> Result<(), NodeError> {
    conn.execute(
        "UPDATE stored_file SET pin_delete_at = ?2 WHERE file_hash = ?1",
        params![file_hash, at],
    )?;
    Ok(())
}

/// Total bytes pinned by an address, via its STORE pins.
pub fn usage_for_address(conn: &Connection, address: &str) -> Result<u64, NodeError> {
    let total: Option<f64> = conn.query_row(
        "SELECT SUM(f.size) FROM file_pin p
         JOIN stored_file f ON f.file_hash = p.file_hash
         WHERE p.owner = ?1",
        params![address],
        |r| r.get(0),
    )?;
    Ok(total.unwrap_or(0.0) as u64)
}

/// The address's pinned files, least recently touched first.
pub fn files_by_lru(conn: &Connection, address: &str) -> Result<Vec<StoredFileRow>, NodeError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT DISTINCT f.file_hash, f.storage, f.size, f.pin_count, f.pin_delete_at, f.last_access
         FROM stored_file f
         JOIN file_pin p ON p.file_hash = f.file_hash
         WHERE p.owner = ?1
         ORDER BY f.last_access ASC"
    ))?;
    let rows = stmt
        .query_map(params![address], file_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
