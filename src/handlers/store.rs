//! STORE handler
//!
//! Pins a file into the node: fetches (or IPFS-pins) the bytes before the
//! commit transaction, then records the pin. Storage beyond the free limit
//! is charged against the sender's balance. The reverse effect drops the
//! pin and, on the last one, schedules deletion after the grace period.
//!
//! A STORE may carry `ref = <original STORE hash>` to update the original's
//! file tag: the tag keeps pointing at the newest file in the chain, and
//! forgetting an update falls back to the previous one. Only the tag owner
//! may update it, and updates of updates are refused.

use rusqlite::Connection;
use serde_json::Value;
use tracing::debug;

use crate::db::balances::total_balance;
use crate::db::files::{self, FileStorage};
use crate::db::messages::{get_message, MessageRow};
use crate::error::{NodeError, ProcessingError};
use crate::handlers::{ContentHandler, RelatedContent, ValidatedMessage};
use crate::storage::StorageService;
use crate::types::{item_type_from_hash, ItemType, MessageContent, MessageType, StoreContent};

const MIB: f64 = 1024.0 * 1024.0;

/// Tokens required per MiB of pinned storage beyond the free allowance.
const MIB_PER_TOKEN: f64 = 3.0;

pub struct StoreHandler {
    grace_period: i64,
    free_storage_limit: u64,
}

impl StoreHandler {
    pub fn new(grace_period: i64, free_storage_limit: u64) -> Self {
        Self {
            grace_period,
            free_storage_limit,
        }
    }

    fn content_of<'a>(
        &self,
        message: &'a ValidatedMessage,
    ) -> Result<&'a StoreContent, ProcessingError> {
        match &message.content {
            MessageContent::Store(content) => Ok(content),
            _ => Err(ProcessingError::permanent(NodeError::InvalidMessage(
                "store handler got non-store content".to_string(),
            ))),
        }
    }
}

#[async_trait::async_trait]
impl ContentHandler for StoreHandler {
    fn check_dependencies(
        &self,
        conn: &Connection,
        message: &ValidatedMessage,
    ) -> Result<(), ProcessingError> {
        let content = self.content_of(message)?;
        let Some(reference) = &content.reference else {
            return Ok(());
        };

        // The referenced STORE may still be in the pipeline: retry
        let Some(original) =
            get_message(conn, reference).map_err(ProcessingError::transient)?
        else {
            return Err(ProcessingError::transient(NodeError::ContentUnavailable(
                format!("referenced store {reference} not processed yet"),
            )));
        };

        if original.message_type != MessageType::Store {
            return Err(ProcessingError::permanent(NodeError::InvalidMessage(
                format!("store ref {reference} is not a STORE message"),
            )));
        }
        // No update chains of updates: the ref must name the original
        let original_ref = original
            .content
            .as_ref()
            .and_then(|raw| raw.get("ref"))
            .and_then(Value::as_str);
        if original_ref.is_some() {
            return Err(ProcessingError::permanent(NodeError::InvalidMessage(
                format!("store ref {reference} is itself an update"),
            )));
        }

        if let Some(tag) = files::get_tag(conn, reference).map_err(ProcessingError::transient)? {
            if tag.owner != content.address {
                return Err(ProcessingError::permanent(NodeError::PermissionDenied(
                    format!("tag {reference} belongs to {}", tag.owner),
                )));
            }
        }

        Ok(())
    }

    async fn fetch_related_content(
        &self,
        storage: &StorageService,
        message: &ValidatedMessage,
    ) -> Result<Option<RelatedContent>, ProcessingError> {
        let content = self.content_of(message)?;

        // The declared engine must match the hash shape
        let engine = item_type_from_hash(&content.item_hash)
            .map_err(ProcessingError::permanent)?;
        let declared = content.item_type;
        if (declared == ItemType::Ipfs) != (engine == ItemType::Ipfs) {
            return Err(ProcessingError::permanent(NodeError::InvalidMessage(
                format!(
                    "item_type {} does not match hash {}",
                    declared.as_str(),
                    content.item_hash
                ),
            )));
        }

        let data = storage
            .get_content(&content.item_hash, engine)
            .await
            .map_err(ProcessingError::transient)?;
        storage
            .pin(&content.item_hash, engine)
            .await
            .map_err(ProcessingError::transient)?;

        debug!(file = %content.item_hash, size = data.len(), "Fetched stored file");
        Ok(Some(RelatedContent {
            file_size: data.len() as u64,
            file_storage: if engine == ItemType::Ipfs {
                FileStorage::Ipfs
            } else {
                FileStorage::Local
            },
        }))
    }

    fn process(
        &self,
        conn: &Connection,
        message: &ValidatedMessage,
        related: Option<&RelatedContent>,
        now: i64,
    ) -> Result<(), ProcessingError> {
        let content = self.content_of(message)?;
        let related = related.ok_or_else(|| {
            ProcessingError::transient(NodeError::Internal(
                "store processed without fetched file".to_string(),
            ))
        })?;

        // Large holdings must be covered by the sender's balance
        if related.file_size > self.free_storage_limit {
            let usage = files::usage_for_address(conn, &content.address)
                .map_err(ProcessingError::transient)?;
            let required_tokens =
                ((usage + related.file_size) as f64 / MIB) / MIB_PER_TOKEN;
            let balance = total_balance(conn, &content.address)
                .map_err(ProcessingError::transient)?;
            if balance < required_tokens {
                return Err(ProcessingError::permanent(NodeError::PermissionDenied(
                    format!(
                        "insufficient balance: {balance:.2} tokens for {required_tokens:.2} required"
                    ),
                )));
            }
        }

        files::upsert_file(
            conn,
            &content.item_hash,
            related.file_storage,
            related.file_size,
            now,
        )
        .map_err(ProcessingError::transient)?;

        // An update joins the original's chain; an original starts its own
        let tag = content
            .reference
            .clone()
            .unwrap_or_else(|| message.item_hash.clone());
        files::add_pin(
            conn,
            &message.item_hash,
            &content.item_hash,
            &content.address,
            &tag,
            now,
        )
        .map_err(ProcessingError::transient)?;
        files::upsert_tag(conn, &tag, &content.address, &content.item_hash, now)
            .map_err(ProcessingError::transient)?;

        Ok(())
    }

    fn reverse(
        &self,
        conn: &Connection,
        target: &MessageRow,
        now: i64,
    ) -> Result<Vec<String>, NodeError> {
        if let Some((_, tag)) =
            files::remove_pin(conn, &target.item_hash, now + self.grace_period)?
        {
            files::refresh_tag(conn, &tag, now)?;
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::balances::upsert_balance;
    use crate::db::Db;
    use crate::types::{sha256_hex, Chain, MessageType, StoreContent};
    use serde_json::json;

    fn message(hash: &str, file_hash: &str) -> ValidatedMessage {
        message_with_ref(hash, file_hash, None)
    }

    fn message_with_ref(hash: &str, file_hash: &str, reference: Option<&str>) -> ValidatedMessage {
        let mut raw = json!({
            "address": "0xA",
            "item_type": "storage",
            "item_hash": file_hash,
            "time": 100.0,
        });
        if let Some(reference) = reference {
            raw["ref"] = json!(reference);
        }
        ValidatedMessage {
            item_hash: hash.to_string(),
            sender: "0xA".to_string(),
            chain: Chain::Eth,
            signature: "0xsig".to_string(),
            message_type: MessageType::Store,
            channel: "TEST".to_string(),
            time: 100.0,
            item_type: ItemType::Inline,
            content: MessageContent::Store(StoreContent {
                address: "0xA".to_string(),
                item_type: ItemType::Storage,
                item_hash: file_hash.to_string(),
                reference: reference.map(|s| s.to_string()),
                mime_type: None,
                time: 100.0,
            }),
            raw_content: raw,
            size: 0,
        }
    }

    fn confirm(conn: &rusqlite::Connection, msg: &ValidatedMessage) {
        crate::db::messages::insert_message(
            conn,
            &msg.item_hash,
            &msg.sender,
            msg.chain,
            &msg.signature,
            msg.message_type,
            &msg.channel,
            msg.time,
            msg.item_type,
            &msg.raw_content,
            msg.size,
            1,
        )
        .unwrap();
    }

    fn related(size: u64) -> RelatedContent {
        RelatedContent {
            file_size: size,
            file_storage: FileStorage::Local,
        }
    }

    #[test]
    fn pin_and_reverse_lifecycle() {
        let db = Db::open_in_memory().unwrap();
        let handler = StoreHandler::new(3600, 25 * 1024 * 1024);
        let file_hash = sha256_hex(b"file bytes");

        db.with_conn(|conn| {
            handler
                .process(conn, &message("m1", &file_hash), Some(&related(2 * 1024 * 1024)), 100)
                .unwrap();
            let file = files::get_file(conn, &file_hash)?.unwrap();
            assert_eq!(file.pin_count, 1);

            let target = MessageRow {
                item_hash: "m1".to_string(),
                sender: "0xA".to_string(),
                chain: Chain::Eth,
                signature: String::new(),
                message_type: MessageType::Store,
                channel: "TEST".to_string(),
                time: 100.0,
                item_type: ItemType::Inline,
                content: None,
                size: 0,
                forgotten_by: None,
            };
            handler.reverse(conn, &target, 200)?;

            let file = files::get_file(conn, &file_hash)?.unwrap();
            assert_eq!(file.pin_count, 0);
            assert_eq!(file.pin_delete_at, Some(200 + 3600));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn ref_update_repoints_the_tag_and_reverse_restores_it() {
        let db = Db::open_in_memory().unwrap();
        let handler = StoreHandler::new(3600, 25 * 1024 * 1024);
        let first_file = sha256_hex(b"v1");
        let second_file = sha256_hex(b"v2");

        db.with_conn(|conn| {
            let original = message("m1", &first_file);
            handler.process(conn, &original, Some(&related(10)), 100).unwrap();
            confirm(conn, &original);
            assert_eq!(files::get_tag(conn, "m1")?.unwrap().file_hash, first_file);

            // Update must wait for the original to be confirmed: it is, so
            // the dependency check passes and the tag moves
            let update = message_with_ref("m2", &second_file, Some("m1"));
            handler.check_dependencies(conn, &update).unwrap();
            handler.process(conn, &update, Some(&related(20)), 200).unwrap();
            confirm(conn, &update);
            assert_eq!(files::get_tag(conn, "m1")?.unwrap().file_hash, second_file);

            // Updating the update is refused
            let grandchild = message_with_ref("m3", &first_file, Some("m2"));
            let err = handler.check_dependencies(conn, &grandchild).unwrap_err();
            assert!(!err.is_transient());

            // Forgetting the update falls back to the original file
            let target = MessageRow {
                item_hash: "m2".to_string(),
                sender: "0xA".to_string(),
                chain: Chain::Eth,
                signature: String::new(),
                message_type: MessageType::Store,
                channel: "TEST".to_string(),
                time: 200.0,
                item_type: ItemType::Inline,
                content: None,
                size: 0,
                forgotten_by: None,
            };
            handler.reverse(conn, &target, 300)?;
            assert_eq!(files::get_tag(conn, "m1")?.unwrap().file_hash, first_file);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn ref_to_unprocessed_store_retries() {
        let db = Db::open_in_memory().unwrap();
        let handler = StoreHandler::new(3600, 25 * 1024 * 1024);
        let file_hash = sha256_hex(b"v2");

        db.with_conn(|conn| {
            let update = message_with_ref("m2", &file_hash, Some("m-not-yet"));
            let err = handler.check_dependencies(conn, &update).unwrap_err();
            assert!(err.is_transient());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn foreign_tag_cannot_be_updated() {
        let db = Db::open_in_memory().unwrap();
        let handler = StoreHandler::new(3600, 25 * 1024 * 1024);
        let file_hash = sha256_hex(b"theirs");

        db.with_conn(|conn| {
            let mut original = message("m1", &file_hash);
            original.sender = "0xB".to_string();
            if let MessageContent::Store(ref mut content) = original.content {
                content.address = "0xB".to_string();
            }
            original.raw_content["address"] = json!("0xB");
            handler.process(conn, &original, Some(&related(10)), 100).unwrap();
            confirm(conn, &original);

            // 0xA tries to repoint 0xB's tag
            let hijack = message_with_ref("m2", &sha256_hex(b"mine"), Some("m1"));
            let err = handler.check_dependencies(conn, &hijack).unwrap_err();
            assert!(!err.is_transient());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn large_file_requires_balance() {
        let db = Db::open_in_memory().unwrap();
        let handler = StoreHandler::new(3600, 25 * 1024 * 1024);
        let file_hash = sha256_hex(b"big");
        let big = 100 * 1024 * 1024;

        db.with_conn(|conn| {
            let err = handler
                .process(conn, &message("m1", &file_hash), Some(&related(big)), 100)
                .unwrap_err();
            assert!(!err.is_transient());

            // With enough balance it goes through
            upsert_balance(conn, "0xA", Chain::Eth, "ALEPH", 1000.0, 1)?;
            handler
                .process(conn, &message("m1", &file_hash), Some(&related(big)), 100)
                .unwrap();
            assert!(files::get_file(conn, &file_hash)?.is_some());
            Ok(())
        })
        .unwrap();
    }
}
