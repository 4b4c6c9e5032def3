//! FORGET handler
//!
//! Target orchestration (tombstoning and per-type reversal) lives in the
//! handler registry, which can reach every other handler's reverse effect.
//! This handler owns the dependency checks: a FORGET waits for its targets
//! to finish processing, and must name at least one target.

use rusqlite::Connection;

use crate::db::aggregates::get_aggregate;
use crate::db::messages::{message_exists, MessageRow};
use crate::error::{NodeError, ProcessingError};
use crate::handlers::{ContentHandler, RelatedContent, ValidatedMessage};
use crate::types::MessageContent;

pub struct ForgetHandler;

impl ForgetHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ForgetHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ContentHandler for ForgetHandler {
    fn check_dependencies(
        &self,
        conn: &Connection,
        message: &ValidatedMessage,
    ) -> Result<(), ProcessingError> {
        let MessageContent::Forget(content) = &message.content else {
            return Err(ProcessingError::permanent(NodeError::InvalidMessage(
                "forget handler got non-forget content".to_string(),
            )));
        };

        if content.hashes.is_empty() && content.aggregates.is_empty() {
            return Err(ProcessingError::permanent(NodeError::InvalidMessage(
                "forget names no targets".to_string(),
            )));
        }

        for target in &content.hashes {
            // Targets may still be in flight: retry until they land
            if !message_exists(conn, target).map_err(ProcessingError::transient)? {
                return Err(ProcessingError::transient(NodeError::ContentUnavailable(
                    format!("forget target {target} not processed yet"),
                )));
            }
        }

        for key in &content.aggregates {
            if get_aggregate(conn, &content.address, key)
                .map_err(ProcessingError::transient)?
                .is_none()
            {
                return Err(ProcessingError::transient(NodeError::ContentUnavailable(
                    format!("forget target aggregate {key} does not exist"),
                )));
            }
        }

        Ok(())
    }

    fn process(
        &self,
        _conn: &Connection,
        _message: &ValidatedMessage,
        _related: Option<&RelatedContent>,
        _now: i64,
    ) -> Result<(), ProcessingError> {
        // Dispatched through ContentHandlers::process_forget instead
        Err(ProcessingError::permanent(NodeError::Internal(
            "forget processing must go through the handler registry".to_string(),
        )))
    }

    fn reverse(
        &self,
        _conn: &Connection,
        target: &MessageRow,
        _now: i64,
    ) -> Result<Vec<String>, NodeError> {
        // FORGET is never itself forgettable; the registry rejects before
        // getting here
        Err(NodeError::Internal(format!(
            "attempted to reverse FORGET {}",
            target.item_hash
        )))
    }
}
