//! POST handler
//!
//! Original posts are amendable: a later POST carrying `ref = original`
//! replaces the visible content. The amendment target must already be a
//! confirmed message; if it is still in flight the message retries.
//!
//! Balance snapshots also arrive this way: POSTs of a dedicated type from
//! trusted addresses are folded into the balance table.

use rusqlite::Connection;
use serde_json::Value;
use tracing::debug;

use crate::db::balances::upsert_balance;
use crate::db::messages::{message_exists, MessageRow};
use crate::db::posts::{self, PostRow};
use crate::error::{NodeError, ProcessingError};
use crate::handlers::{ContentHandler, RelatedContent, ValidatedMessage};
use crate::types::{Chain, MessageContent, PostContent};

pub struct PostHandler {
    balances_post_type: String,
    balances_addresses: Vec<String>,
}

impl PostHandler {
    pub fn new(balances_post_type: String, balances_addresses: Vec<String>) -> Self {
        Self {
            balances_post_type,
            balances_addresses,
        }
    }

    /// Fold a trusted balance snapshot into the balance table. The post
    /// body is `{"chain": ..., "balances": {address: amount}}`.
    fn ingest_balances(
        &self,
        conn: &Connection,
        message: &ValidatedMessage,
        content: &PostContent,
        now: i64,
    ) -> Result<(), NodeError> {
        if content.post_type != self.balances_post_type
            || !self.balances_addresses.contains(&message.sender)
        {
            return Ok(());
        }

        let Some(body) = &content.content else {
            return Ok(());
        };
        let chain = body
            .get("chain")
            .and_then(Value::as_str)
            .and_then(|s| Chain::parse(s).ok())
            .unwrap_or(message.chain);
        let Some(balances) = body.get("balances").and_then(Value::as_object) else {
            return Ok(());
        };

        for (address, amount) in balances {
            if let Some(amount) = amount.as_f64() {
                upsert_balance(conn, address, chain, "ALEPH", amount, now)?;
            }
        }
        debug!(count = balances.len(), chain = %chain, "Ingested balance snapshot");
        Ok(())
    }
}

#[async_trait::async_trait]
impl ContentHandler for PostHandler {
    fn check_dependencies(
        &self,
        conn: &Connection,
        message: &ValidatedMessage,
    ) -> Result<(), ProcessingError> {
        let MessageContent::Post(content) = &message.content else {
            return Err(ProcessingError::permanent(NodeError::InvalidMessage(
                "post handler got non-post content".to_string(),
            )));
        };

        if let Some(amended) = &content.amends {
            // The original may still be in the pipeline: retry, don't reject
            if !message_exists(conn, amended).map_err(ProcessingError::transient)? {
                return Err(ProcessingError::transient(NodeError::ContentUnavailable(
                    format!("amended post {amended} not processed yet"),
                )));
            }
        }
        Ok(())
    }

    fn process(
        &self,
        conn: &Connection,
        message: &ValidatedMessage,
        _related: Option<&RelatedContent>,
        now: i64,
    ) -> Result<(), ProcessingError> {
        let MessageContent::Post(content) = &message.content else {
            return Err(ProcessingError::permanent(NodeError::InvalidMessage(
                "post handler got non-post content".to_string(),
            )));
        };

        posts::insert_post(
            conn,
            &PostRow {
                item_hash: message.item_hash.clone(),
                address: content.address.clone(),
                post_type: content.post_type.clone(),
                ref_hash: content.amends.clone(),
                content: content.content.clone(),
                time: content.time,
                channel: message.channel.clone(),
            },
        )
        .map_err(ProcessingError::transient)?;

        self.ingest_balances(conn, message, content, now)
            .map_err(ProcessingError::transient)?;
        Ok(())
    }

    fn reverse(
        &self,
        conn: &Connection,
        target: &MessageRow,
        _now: i64,
    ) -> Result<Vec<String>, NodeError> {
        // An original takes its amendment rows with it; the amendment
        // messages themselves stay confirmed
        if let Some(post) = posts::get_post(conn, &target.item_hash)? {
            if post.ref_hash.is_none() {
                for amendment in posts::amendment_hashes(conn, &target.item_hash)? {
                    posts::delete_post(conn, &amendment)?;
                }
            }
        }
        posts::delete_post(conn, &target.item_hash)?;
        Ok(Vec::new())
    }
}
