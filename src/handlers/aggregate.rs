//! AGGREGATE handler
//!
//! Stores the raw element and maintains the materialised per-(address, key)
//! view. Elements arriving in time order append with a single merge; an
//! out-of-order arrival triggers a full refold, which is what makes the view
//! independent of processing order.

use rusqlite::Connection;
use tracing::debug;

use crate::config::TieBreak;
use crate::db::aggregates::{
    self, deep_merge, get_aggregate, insert_element, refresh_aggregate, AggregateElementRow,
    AggregateRow,
};
use crate::db::messages::MessageRow;
use crate::error::{NodeError, ProcessingError};
use crate::handlers::{ContentHandler, RelatedContent, ValidatedMessage};
use crate::types::MessageContent;

pub struct AggregateHandler {
    tie_break: TieBreak,
}

impl AggregateHandler {
    pub fn new(tie_break: TieBreak) -> Self {
        Self { tie_break }
    }
}

#[async_trait::async_trait]
impl ContentHandler for AggregateHandler {
    fn process(
        &self,
        conn: &Connection,
        message: &ValidatedMessage,
        _related: Option<&RelatedContent>,
        _now: i64,
    ) -> Result<(), ProcessingError> {
        let MessageContent::Aggregate(content) = &message.content else {
            return Err(ProcessingError::permanent(NodeError::InvalidMessage(
                "aggregate handler got non-aggregate content".to_string(),
            )));
        };

        let element = AggregateElementRow {
            item_hash: message.item_hash.clone(),
            address: content.address.clone(),
            key: content.key.clone(),
            content: content.content.clone(),
            creation_time: content.time,
        };
        insert_element(conn, &element).map_err(ProcessingError::transient)?;

        // Fast path: strictly newer than the current view, merge on top.
        // Equal timestamps go through the refold so the tie-break applies.
        let existing = get_aggregate(conn, &content.address, &content.key)
            .map_err(ProcessingError::transient)?;
        match existing {
            Some(aggregate) if aggregate.last_revision_time < element.creation_time => {
                let mut merged = aggregate.content;
                deep_merge(&mut merged, &element.content);
                aggregates::upsert_aggregate(
                    conn,
                    &AggregateRow {
                        address: content.address.clone(),
                        key: content.key.clone(),
                        content: merged,
                        creation_time: aggregate.creation_time,
                        last_revision_time: element.creation_time,
                        last_revision_hash: element.item_hash.clone(),
                    },
                )
                .map_err(ProcessingError::transient)?;
            }
            _ => {
                debug!(
                    address = %content.address,
                    key = %content.key,
                    "Out-of-order aggregate element, refolding view"
                );
                refresh_aggregate(conn, &content.address, &content.key, self.tie_break)
                    .map_err(ProcessingError::transient)?;
            }
        }

        Ok(())
    }

    fn reverse(
        &self,
        conn: &Connection,
        target: &MessageRow,
        _now: i64,
    ) -> Result<Vec<String>, NodeError> {
        if let Some((address, key)) = aggregates::delete_element(conn, &target.item_hash)? {
            refresh_aggregate(conn, &address, &key, self.tie_break)?;
        }
        Ok(Vec::new())
    }
}
