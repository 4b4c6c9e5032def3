//! Program descriptors, indexed by trigger
//!
//! The node only persists descriptors; a separate program runtime consumes
//! this table.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::NodeError;
use crate::types::ProgramTriggers;

#[derive(Debug, Clone)]
pub struct ProgramRow {
    pub item_hash: String,
    pub owner: String,
    pub triggers: ProgramTriggers,
    pub descriptor: Value,
}

pub fn insert_program(conn: &Connection, program: &ProgramRow, now: i64) -> Result<(), NodeError> {
    conn.execute(
        "INSERT OR IGNORE INTO program
            (item_hash, owner, http_trigger, cron_schedule, aleph_filters, descriptor, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            program.item_hash,
            program.owner,
            program.triggers.http,
            program.triggers.cron,
            program
                .triggers
                .aleph
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            serde_json::to_string(&program.descriptor)?,
            now,
        ],
    )?;
    Ok(())
}

pub fn get_program(conn: &Connection, item_hash: &str) -> Result<Option<ProgramRow>, NodeError> {
    let row = conn
        .query_row(
            "SELECT item_hash, owner, http_trigger, cron_schedule, aleph_filters, descriptor
             FROM program WHERE item_hash = ?1",
            params![item_hash],
            |row| {
                let aleph: Option<String> = row.get(4)?;
                let descriptor: String = row.get(5)?;
                Ok(ProgramRow {
                    item_hash: row.get(0)?,
                    owner: row.get(1)?,
                    triggers: ProgramTriggers {
                        http: row.get(2)?,
                        cron: row.get(3)?,
                        aleph: aleph
                            .map(|text| serde_json::from_str(&text))
                            .transpose()
                            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
                    },
                    descriptor: serde_json::from_str(&descriptor)
                        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn delete_program(conn: &Connection, item_hash: &str) -> Result<(), NodeError> {
    conn.execute(
        "DELETE FROM program WHERE item_hash = ?1",
        params![item_hash],
    )?;
    Ok(())
}
