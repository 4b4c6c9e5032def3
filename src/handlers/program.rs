//! PROGRAM handler
//!
//! Persists the program descriptor with its trigger index. No execution
//! happens here; the program runtime is a separate consumer of the table.

use rusqlite::Connection;

use crate::db::messages::MessageRow;
use crate::db::programs::{self, ProgramRow};
use crate::error::{NodeError, ProcessingError};
use crate::handlers::{ContentHandler, RelatedContent, ValidatedMessage};
use crate::types::MessageContent;

pub struct ProgramHandler;

impl ProgramHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ProgramHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ContentHandler for ProgramHandler {
    fn process(
        &self,
        conn: &Connection,
        message: &ValidatedMessage,
        _related: Option<&RelatedContent>,
        now: i64,
    ) -> Result<(), ProcessingError> {
        let MessageContent::Program(content) = &message.content else {
            return Err(ProcessingError::permanent(NodeError::InvalidMessage(
                "program handler got non-program content".to_string(),
            )));
        };

        programs::insert_program(
            conn,
            &ProgramRow {
                item_hash: message.item_hash.clone(),
                owner: content.address.clone(),
                triggers: content.on.clone(),
                descriptor: message.raw_content.clone(),
            },
            now,
        )
        .map_err(ProcessingError::transient)?;
        Ok(())
    }

    fn reverse(
        &self,
        conn: &Connection,
        target: &MessageRow,
        _now: i64,
    ) -> Result<Vec<String>, NodeError> {
        programs::delete_program(conn, &target.item_hash)?;
        Ok(Vec::new())
    }
}
