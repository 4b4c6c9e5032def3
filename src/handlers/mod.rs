//! Per-type message handlers
//!
//! Each message kind defines its effect on the derived tables and the
//! reverse of that effect for FORGET. Handlers split their work in three:
//! dependency checks inside the claim, async side-effects (file fetches and
//! pins) before the commit transaction, and the transactional effect itself.

pub mod aggregate;
pub mod forget;
pub mod post;
pub mod program;
pub mod store;

use async_trait::async_trait;
use rusqlite::Connection;
use serde_json::Value;

use crate::config::Config;
use crate::db::files::FileStorage;
use crate::db::messages::MessageRow;
use crate::error::{NodeError, ProcessingError};
use crate::storage::StorageService;
use crate::types::{Chain, ItemType, MessageContent, MessageEnvelope, MessageType};

pub use aggregate::AggregateHandler;
pub use forget::ForgetHandler;
pub use post::PostHandler;
pub use program::ProgramHandler;
pub use store::StoreHandler;

/// A pending message that passed fetch and validation: typed content plus
/// the raw document that gets persisted.
#[derive(Debug, Clone)]
pub struct ValidatedMessage {
    pub item_hash: String,
    pub sender: String,
    pub chain: Chain,
    pub signature: String,
    pub message_type: MessageType,
    pub channel: String,
    pub time: f64,
    pub item_type: ItemType,
    pub content: MessageContent,
    pub raw_content: Value,
    pub size: u64,
}

impl ValidatedMessage {
    pub fn new(
        envelope: &MessageEnvelope,
        content: MessageContent,
        raw_content: Value,
        size: u64,
    ) -> Self {
        Self {
            item_hash: envelope.item_hash.clone(),
            sender: envelope.sender.clone(),
            chain: envelope.chain,
            signature: envelope.signature.clone(),
            message_type: envelope.message_type,
            channel: envelope.channel.clone(),
            time: envelope.time,
            item_type: envelope.item_type,
            content,
            raw_content,
            size,
        }
    }
}

/// Side-effect results carried from the async fetch stage into the commit
/// transaction.
#[derive(Debug, Clone)]
pub struct RelatedContent {
    pub file_size: u64,
    pub file_storage: FileStorage,
}

#[async_trait]
pub trait ContentHandler: Send + Sync {
    /// Checks that must pass before the message can be applied. A missing
    /// dependency (a ref still in flight) is transient.
    fn check_dependencies(
        &self,
        _conn: &Connection,
        _message: &ValidatedMessage,
    ) -> Result<(), ProcessingError> {
        Ok(())
    }

    /// Async side-effects before the commit transaction: file fetches,
    /// remote pins.
    async fn fetch_related_content(
        &self,
        _storage: &StorageService,
        _message: &ValidatedMessage,
    ) -> Result<Option<RelatedContent>, ProcessingError> {
        Ok(None)
    }

    /// Apply the message effect. Runs inside the promotion transaction.
    fn process(
        &self,
        conn: &Connection,
        message: &ValidatedMessage,
        related: Option<&RelatedContent>,
        now: i64,
    ) -> Result<(), ProcessingError>;

    /// Reverse the effect for FORGET. Returns additional message hashes
    /// that must be tombstoned along with the target.
    fn reverse(
        &self,
        conn: &Connection,
        target: &MessageRow,
        now: i64,
    ) -> Result<Vec<String>, NodeError>;
}

/// Registry dispatching to the per-type handlers. FORGET orchestration lives
/// here because it reaches back into every other handler's reverse effect.
pub struct ContentHandlers {
    aggregate: AggregateHandler,
    post: PostHandler,
    store: StoreHandler,
    program: ProgramHandler,
    forget: ForgetHandler,
}

impl ContentHandlers {
    pub fn new(config: &Config) -> Self {
        Self {
            aggregate: AggregateHandler::new(config.pipeline.aggregate_tie_break),
            post: PostHandler::new(
                config.balances.post_type.clone(),
                config.balances.addresses.clone(),
            ),
            store: StoreHandler::new(
                config.storage.grace_period_secs as i64,
                config.storage.free_storage_limit_bytes,
            ),
            program: ProgramHandler::new(),
            forget: ForgetHandler::new(),
        }
    }

    fn handler(&self, message_type: MessageType) -> &dyn ContentHandler {
        match message_type {
            MessageType::Aggregate => &self.aggregate,
            MessageType::Post => &self.post,
            MessageType::Store => &self.store,
            MessageType::Program => &self.program,
            MessageType::Forget => &self.forget,
        }
    }

    pub fn check_dependencies(
        &self,
        conn: &Connection,
        message: &ValidatedMessage,
    ) -> Result<(), ProcessingError> {
        self.handler(message.message_type)
            .check_dependencies(conn, message)
    }

    pub async fn fetch_related_content(
        &self,
        storage: &StorageService,
        message: &ValidatedMessage,
    ) -> Result<Option<RelatedContent>, ProcessingError> {
        self.handler(message.message_type)
            .fetch_related_content(storage, message)
            .await
    }

    /// Apply a message inside the promotion transaction.
    pub fn process(
        &self,
        conn: &Connection,
        message: &ValidatedMessage,
        related: Option<&RelatedContent>,
        now: i64,
    ) -> Result<(), ProcessingError> {
        if message.message_type == MessageType::Forget {
            return self.process_forget(conn, message, now);
        }
        self.handler(message.message_type)
            .process(conn, message, related, now)
    }

    /// Tombstone each target and reverse its effect. Already-forgotten
    /// targets are silent no-ops; forgetting a FORGET is refused.
    fn process_forget(
        &self,
        conn: &Connection,
        message: &ValidatedMessage,
        now: i64,
    ) -> Result<(), ProcessingError> {
        let MessageContent::Forget(content) = &message.content else {
            return Err(ProcessingError::permanent(NodeError::InvalidMessage(
                "forget handler got non-forget content".to_string(),
            )));
        };

        let mut targets = content.hashes.clone();
        for key in &content.aggregates {
            targets.extend(
                crate::db::aggregates::element_hashes_for_key(conn, &content.address, key)
                    .map_err(ProcessingError::transient)?,
            );
        }

        let mut queue = targets;
        while let Some(target_hash) = queue.pop() {
            let Some(target) = crate::db::messages::get_message(conn, &target_hash)
                .map_err(ProcessingError::transient)?
            else {
                // Dependency checks saw it; losing it mid-transaction is a
                // conflict worth retrying
                return Err(ProcessingError::transient(NodeError::Internal(format!(
                    "forget target {target_hash} disappeared"
                ))));
            };

            if target.forgotten_by.is_some() {
                continue;
            }
            if target.message_type == MessageType::Forget {
                return Err(ProcessingError::permanent(NodeError::InvalidMessage(
                    format!("cannot forget FORGET message {target_hash}"),
                )));
            }
            // Ownership follows the address the target's content acts for,
            // not its envelope signer: a message a delegate sent on the
            // owner's behalf is still the owner's to forget
            let target_owner = target
                .content
                .as_ref()
                .and_then(|raw| MessageContent::parse(target.message_type, raw).ok())
                .map(|parsed| parsed.address().to_string())
                .unwrap_or_else(|| target.sender.clone());
            if target_owner != content.address {
                return Err(ProcessingError::permanent(NodeError::PermissionDenied(
                    format!("{target_hash} belongs to another address"),
                )));
            }

            crate::db::messages::forget_message_row(conn, &target_hash, &message.item_hash)
                .map_err(ProcessingError::transient)?;
            let extra = self
                .handler(target.message_type)
                .reverse(conn, &target, now)
                .map_err(ProcessingError::transient)?;
            queue.extend(extra);
        }

        Ok(())
    }
}
