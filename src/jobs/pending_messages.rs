//! Pending-message processor
//!
//! The central pipeline: claim, fetch, validate, deduplicate, authorize,
//! process, retire. Cross-source exactly-once comes from the promotion
//! transaction being keyed on `item_hash`: a second arrival of the same hash
//! merges its confirmation into the existing message and never re-runs the
//! handler.
//!
//! A bounded worker pool drains the queue; per-type semaphores keep heavy
//! STORE traffic from starving the light message kinds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};

use crate::context::NodeContext;
use crate::db::messages::{insert_message, message_exists, upsert_confirmation};
use crate::db::pending_messages::{
    claim_due, delete_pending_message, reject_pending_message, reschedule, PendingMessageRow,
};
use crate::db::unix_now;
use crate::error::{NodeError, ProcessingError};
use crate::handlers::ValidatedMessage;
use crate::jobs::backoff_delay;
use crate::permissions::check_sender_authorization;
use crate::signing::verify_signature;
use crate::types::{
    item_type_from_hash, sha256_hex, ItemType, MessageContent, MessageOrigin, MessageType,
    MAX_INLINE_CONTENT_SIZE,
};

/// Terminal outcome of one processing attempt.
#[derive(Debug)]
enum Outcome {
    Done { publish: bool },
    Retry(String),
    Reject(String),
}

pub struct PendingMessageProcessor {
    ctx: Arc<NodeContext>,
    worker_slots: Arc<Semaphore>,
    type_slots: HashMap<MessageType, Arc<Semaphore>>,
}

impl PendingMessageProcessor {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        let config = &ctx.config.pipeline;
        let worker_slots = Arc::new(Semaphore::new(config.workers));
        let type_slots = MessageType::ALL
            .iter()
            .zip(config.per_type_limits.iter())
            .map(|(mt, &limit)| (*mt, Arc::new(Semaphore::new(limit.max(1)))))
            .collect();
        Self {
            ctx,
            worker_slots,
            type_slots,
        }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let config = &self.ctx.config.pipeline;
        info!(workers = config.workers, "Pending-message processor started");
        let poll = Duration::from_millis(config.poll_interval_ms);

        loop {
            let claimed = match self.claim_and_dispatch().await {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "Claim pass failed");
                    0
                }
            };

            if claimed == 0 {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            } else if !matches!(
                shutdown.try_recv(),
                Err(broadcast::error::TryRecvError::Empty)
            ) {
                break;
            }
        }

        // Drain: no new claims; in-flight rows get 30 s to finish. Anything
        // abandoned becomes re-claimable after the claim timeout.
        info!("Pending-message processor draining");
        let workers = self.ctx.config.pipeline.workers as u32;
        if tokio::time::timeout(
            Duration::from_secs(30),
            self.worker_slots.acquire_many(workers),
        )
        .await
        .is_err()
        {
            warn!("Drain timed out, abandoning in-flight rows");
        }
        info!("Pending-message processor stopped");
    }

    /// Claim and process every currently-due row to a terminal state,
    /// sequentially. One-shot drain for tests and maintenance runs; the
    /// live daemon uses [`run`](Self::run).
    pub async fn process_available(&self) -> Result<usize, NodeError> {
        let config = &self.ctx.config.pipeline;
        let mut total = 0;
        loop {
            let rows = self.ctx.db.with_conn(|conn| {
                claim_due(
                    conn,
                    unix_now(),
                    config.claim_timeout_secs as i64,
                    config.batch_size,
                    &MessageType::ALL,
                )
            })?;
            if rows.is_empty() {
                return Ok(total);
            }
            for row in rows {
                process_claimed(Arc::clone(&self.ctx), row).await;
                total += 1;
            }
        }
    }

    /// Claim up to a batch of due rows and hand them to workers. Returns the
    /// number of rows dispatched.
    async fn claim_and_dispatch(&self) -> Result<usize, NodeError> {
        let config = &self.ctx.config.pipeline;

        // Claim no more than the pool can absorb, and only message kinds
        // with free per-type slots
        let slots = self.worker_slots.available_permits();
        if slots == 0 {
            return Ok(0);
        }
        let allowed: Vec<MessageType> = MessageType::ALL
            .iter()
            .filter(|mt| self.type_slots[mt].available_permits() > 0)
            .copied()
            .collect();
        if allowed.is_empty() {
            return Ok(0);
        }

        let rows = self.ctx.db.with_conn(|conn| {
            claim_due(
                conn,
                unix_now(),
                config.claim_timeout_secs as i64,
                config.batch_size.min(slots),
                &allowed,
            )
        })?;

        let dispatched = rows.len();
        for row in rows {
            let ctx = Arc::clone(&self.ctx);
            let global = Arc::clone(&self.worker_slots);
            let per_type = Arc::clone(&self.type_slots[&row.envelope.message_type]);
            tokio::spawn(async move {
                let Ok(_global_permit) = global.acquire_owned().await else {
                    return;
                };
                let Ok(_type_permit) = per_type.acquire_owned().await else {
                    return;
                };
                process_claimed(ctx, row).await;
            });
        }
        Ok(dispatched)
    }
}

/// Drive one claimed row to a terminal state.
async fn process_claimed(ctx: Arc<NodeContext>, row: PendingMessageRow) {
    let outcome = match run_stages(&ctx, &row).await {
        Ok(outcome) => outcome,
        Err(ProcessingError::Transient(e)) => Outcome::Retry(e.to_string()),
        Err(ProcessingError::Permanent(e)) => Outcome::Reject(e.to_string()),
    };

    let config = &ctx.config.pipeline;
    let now = unix_now();
    let item_hash = &row.envelope.item_hash;

    let result = match outcome {
        Outcome::Done { publish } => {
            debug!(item_hash = %item_hash, "Message processed");
            if publish {
                if let Some(publisher) = &ctx.publisher {
                    if let Err(e) = publisher.publish_envelope(&row.envelope).await {
                        // Best effort: the message is committed either way
                        warn!(item_hash = %item_hash, error = %e, "Publish failed");
                    }
                }
            }
            Ok(())
        }
        Outcome::Retry(reason) if row.retries + 1 >= config.max_retries => {
            warn!(item_hash = %item_hash, reason = %reason, "Message exhausted its retries");
            ctx.db
                .with_conn(|conn| reject_pending_message(conn, &row, &reason, now))
        }
        Outcome::Retry(reason) => {
            let delay = backoff_delay(config.retry_base_secs, config.retry_cap_secs, row.retries);
            debug!(item_hash = %item_hash, retry_in = delay, reason = %reason, "Deferring message");
            ctx.db
                .with_conn(|conn| reschedule(conn, row.id, now, delay))
        }
        Outcome::Reject(reason) => {
            warn!(item_hash = %item_hash, reason = %reason, "Rejecting message");
            ctx.db
                .with_conn(|conn| reject_pending_message(conn, &row, &reason, now))
        }
    };

    if let Err(e) = result {
        error!(item_hash = %item_hash, error = %e, "Failed to record message outcome");
    }
}

/// The FETCHING -> VALIDATING -> PROCESSING stages.
async fn run_stages(
    ctx: &NodeContext,
    row: &PendingMessageRow,
) -> Result<Outcome, ProcessingError> {
    let envelope = &row.envelope;

    // FETCHING
    let (raw_content, size) = fetch_content(ctx, row).await?;

    // VALIDATING: typed content first, then the signature
    let content = MessageContent::parse(envelope.message_type, &raw_content)
        .map_err(ProcessingError::permanent)?;

    let skip_signature = !row.check_message && ctx.config.pipeline.trusted_onchain;
    if !skip_signature {
        verify_signature(envelope).map_err(ProcessingError::permanent)?;
    }

    let message = ValidatedMessage::new(envelope, content, raw_content, size);

    // Deduplicate before doing any work; the promotion transaction
    // re-checks under the write lock
    let exists = ctx
        .db
        .with_conn(|conn| message_exists(conn, &message.item_hash))
        .map_err(ProcessingError::transient)?;
    if exists {
        merge_and_retire(ctx, row)?;
        return Ok(Outcome::Done { publish: false });
    }

    // Authorize delegated content
    let authorized = ctx
        .db
        .with_conn(|conn| check_sender_authorization(conn, envelope, &message.content))
        .map_err(ProcessingError::transient)?;
    if !authorized {
        return Err(ProcessingError::permanent(NodeError::PermissionDenied(
            format!(
                "{} is not authorized to act for {}",
                message.sender,
                message.content.address()
            ),
        )));
    }

    let deps = ctx
        .db
        .with_conn(|conn| Ok(ctx.handlers.check_dependencies(conn, &message)))
        .map_err(ProcessingError::transient)?;
    deps?;

    // Async side effects (file fetch, remote pin) before the transaction
    let related = ctx
        .handlers
        .fetch_related_content(&ctx.storage, &message)
        .await?;

    // PROCESSING: everything commits or nothing does
    let now = unix_now();
    let publish = row.origin == MessageOrigin::Http;
    let result = ctx
        .db
        .with_conn_mut(|conn| {
            let db_tx = conn.transaction()?;

            if message_exists(&db_tx, &message.item_hash)? {
                if let Some(confirmation) = &row.confirmation {
                    upsert_confirmation(&db_tx, &message.item_hash, confirmation)?;
                }
                delete_pending_message(&db_tx, row.id)?;
                db_tx.commit()?;
                return Ok(Ok(Outcome::Done { publish: false }));
            }

            insert_message(
                &db_tx,
                &message.item_hash,
                &message.sender,
                message.chain,
                &message.signature,
                message.message_type,
                &message.channel,
                message.time,
                message.item_type,
                &message.raw_content,
                message.size,
                now,
            )?;
            if let Some(confirmation) = &row.confirmation {
                upsert_confirmation(&db_tx, &message.item_hash, confirmation)?;
            }

            match ctx
                .handlers
                .process(&db_tx, &message, related.as_ref(), now)
            {
                Ok(()) => {
                    delete_pending_message(&db_tx, row.id)?;
                    db_tx.commit()?;
                    Ok(Ok(Outcome::Done { publish }))
                }
                // Dropping the transaction rolls the promotion back
                Err(e) => Ok(Err(e)),
            }
        })
        .map_err(ProcessingError::transient)?;

    result
}

/// FETCHING: resolve the content document and its size.
async fn fetch_content(
    ctx: &NodeContext,
    row: &PendingMessageRow,
) -> Result<(serde_json::Value, u64), ProcessingError> {
    let envelope = &row.envelope;

    if envelope.item_type == ItemType::Inline {
        let text = envelope.item_content.as_deref().ok_or_else(|| {
            ProcessingError::permanent(NodeError::InvalidMessage(
                "inline message without item_content".to_string(),
            ))
        })?;
        if text.len() > MAX_INLINE_CONTENT_SIZE {
            return Err(ProcessingError::permanent(NodeError::InvalidMessage(
                format!("inline content exceeds {MAX_INLINE_CONTENT_SIZE} bytes"),
            )));
        }
        let digest = sha256_hex(text.as_bytes());
        if digest != envelope.item_hash {
            return Err(ProcessingError::permanent(NodeError::HashMismatch {
                expected: envelope.item_hash.clone(),
                actual: digest,
            }));
        }
        let value: serde_json::Value = serde_json::from_str(text).map_err(|e| {
            ProcessingError::permanent(NodeError::InvalidMessage(format!(
                "inline content is not JSON: {e}"
            )))
        })?;
        return Ok((value, text.len() as u64));
    }

    // Remote content: the hash shape must match the declared engine
    let engine =
        item_type_from_hash(&envelope.item_hash).map_err(ProcessingError::permanent)?;
    if engine != envelope.item_type {
        return Err(ProcessingError::permanent(NodeError::InvalidMessage(
            format!(
                "item_type {} does not match hash {}",
                envelope.item_type.as_str(),
                envelope.item_hash
            ),
        )));
    }

    let fetch_timeout = Duration::from_secs(ctx.config.pipeline.fetch_timeout_secs);
    let bytes = tokio::time::timeout(
        fetch_timeout,
        ctx.storage.get_content(&envelope.item_hash, engine),
    )
    .await
    .map_err(|_| {
        ProcessingError::transient(NodeError::ContentUnavailable(format!(
            "timed out fetching {}",
            envelope.item_hash
        )))
    })?
    .map_err(ProcessingError::transient)?;

    if engine == ItemType::Storage {
        let digest = sha256_hex(&bytes);
        if digest != envelope.item_hash {
            return Err(ProcessingError::permanent(NodeError::HashMismatch {
                expected: envelope.item_hash.clone(),
                actual: digest,
            }));
        }
    }

    let value: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| {
        ProcessingError::permanent(NodeError::InvalidMessage(format!(
            "content is not JSON: {e}"
        )))
    })?;
    Ok((value, bytes.len() as u64))
}

/// Duplicate of a confirmed message: merge the confirmation, retire the row.
fn merge_and_retire(ctx: &NodeContext, row: &PendingMessageRow) -> Result<(), ProcessingError> {
    ctx.db
        .with_conn_mut(|conn| {
            let db_tx = conn.transaction()?;
            if let Some(confirmation) = &row.confirmation {
                upsert_confirmation(&db_tx, &row.envelope.item_hash, confirmation)?;
            }
            delete_pending_message(&db_tx, row.id)?;
            db_tx.commit()?;
            Ok(())
        })
        .map_err(ProcessingError::transient)?;
    debug!(
        item_hash = %row.envelope.item_hash,
        "Duplicate message, confirmations merged"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::pending_messages::insert_pending_message;
    use crate::db::Db;
    use crate::storage::{ObjectStore, StorageService};
    use crate::types::{Chain, Confirmation, MessageEnvelope};
    use tempfile::TempDir;

    async fn context(dir: &TempDir) -> Arc<NodeContext> {
        let mut config = Config::default();
        config.pipeline.trusted_onchain = true;
        let db = Arc::new(Db::open_in_memory().unwrap());
        let storage = Arc::new(StorageService::new(
            ObjectStore::new(dir.path()).await.unwrap(),
            None,
        ));
        Arc::new(NodeContext::new(config, db, storage, None))
    }

    fn aggregate_envelope(content: &serde_json::Value) -> MessageEnvelope {
        let item_content = content.to_string();
        MessageEnvelope {
            chain: Chain::Eth,
            sender: "0xA".to_string(),
            message_type: MessageType::Aggregate,
            channel: "TEST".to_string(),
            time: 100.0,
            item_type: ItemType::Inline,
            item_hash: sha256_hex(item_content.as_bytes()),
            item_content: Some(item_content),
            signature: "0xsig".to_string(),
        }
    }

    fn enqueue(
        ctx: &NodeContext,
        envelope: &MessageEnvelope,
        origin: MessageOrigin,
        confirmation: Option<&Confirmation>,
    ) -> PendingMessageRow {
        ctx.db
            .with_conn(|conn| {
                insert_pending_message(conn, envelope, origin, confirmation, false, 1)?;
                let mut rows = claim_due(conn, unix_now(), 300, 10, &MessageType::ALL)?;
                Ok(rows.pop().expect("row just inserted"))
            })
            .unwrap()
    }

    #[tokio::test]
    async fn inline_aggregate_processes_end_to_end() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;

        let envelope = aggregate_envelope(&serde_json::json!({
            "address": "0xA", "key": "profile", "content": {"name": "x"}, "time": 100.0,
        }));
        let row = enqueue(&ctx, &envelope, MessageOrigin::P2p, None);

        process_claimed(Arc::clone(&ctx), row).await;

        ctx.db
            .with_conn(|conn| {
                assert!(message_exists(conn, &envelope.item_hash)?);
                let aggregate =
                    crate::db::aggregates::get_aggregate(conn, "0xA", "profile")?.unwrap();
                assert_eq!(aggregate.content, serde_json::json!({"name": "x"}));
                assert_eq!(
                    crate::db::pending_messages::count_pending_messages(conn)?,
                    0
                );
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn duplicate_merges_confirmations_without_side_effects() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;

        let envelope = aggregate_envelope(&serde_json::json!({
            "address": "0xA", "key": "profile", "content": {"n": 1}, "time": 100.0,
        }));

        // First via P2P
        let row = enqueue(&ctx, &envelope, MessageOrigin::P2p, None);
        process_claimed(Arc::clone(&ctx), row).await;

        // Then the on-chain copy
        let confirmation = Confirmation {
            chain: Chain::Eth,
            height: 7,
            tx_hash: "0xtx".to_string(),
        };
        let row = enqueue(&ctx, &envelope, MessageOrigin::Onchain, Some(&confirmation));
        process_claimed(Arc::clone(&ctx), row).await;

        ctx.db
            .with_conn(|conn| {
                // One message, one element, one confirmation
                assert_eq!(crate::db::messages::count_messages(conn)?, 1);
                let confirmations =
                    crate::db::messages::get_confirmations(conn, &envelope.item_hash)?;
                assert_eq!(confirmations.len(), 1);
                assert_eq!(confirmations[0].height, 7);
                let elements: u64 =
                    conn.query_row("SELECT COUNT(*) FROM aggregate_element", [], |r| r.get(0))?;
                assert_eq!(elements, 1);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn bad_inline_hash_rejects() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;

        let mut envelope = aggregate_envelope(&serde_json::json!({
            "address": "0xA", "key": "profile", "content": {}, "time": 100.0,
        }));
        envelope.item_hash = sha256_hex(b"something else");
        let row = enqueue(&ctx, &envelope, MessageOrigin::P2p, None);

        process_claimed(Arc::clone(&ctx), row).await;

        ctx.db
            .with_conn(|conn| {
                let rejected: u64 =
                    conn.query_row("SELECT COUNT(*) FROM rejected_message", [], |r| r.get(0))?;
                assert_eq!(rejected, 1);
                assert_eq!(
                    crate::db::pending_messages::count_pending_messages(conn)?,
                    0
                );
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn unauthorized_delegation_rejects() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;

        // 0xB signs content claiming to act for 0xA with no delegation
        let mut envelope = aggregate_envelope(&serde_json::json!({
            "address": "0xA", "key": "profile", "content": {"name": "evil"}, "time": 100.0,
        }));
        envelope.sender = "0xB".to_string();
        let row = enqueue(&ctx, &envelope, MessageOrigin::P2p, None);

        process_claimed(Arc::clone(&ctx), row).await;

        ctx.db
            .with_conn(|conn| {
                assert!(crate::db::aggregates::get_aggregate(conn, "0xA", "profile")?.is_none());
                let rejected: u64 =
                    conn.query_row("SELECT COUNT(*) FROM rejected_message", [], |r| r.get(0))?;
                assert_eq!(rejected, 1);
                Ok(())
            })
            .unwrap();
    }

    #[tokio::test]
    async fn missing_remote_content_retries_with_backoff() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir).await;

        let missing_hash = sha256_hex(b"not yet stored");
        let envelope = MessageEnvelope {
            chain: Chain::Eth,
            sender: "0xA".to_string(),
            message_type: MessageType::Post,
            channel: "TEST".to_string(),
            time: 100.0,
            item_type: ItemType::Storage,
            item_hash: missing_hash,
            item_content: None,
            signature: "0xsig".to_string(),
        };
        let row = enqueue(&ctx, &envelope, MessageOrigin::P2p, None);

        process_claimed(Arc::clone(&ctx), row).await;

        ctx.db
            .with_conn(|conn| {
                let (retries, next): (u32, i64) = conn.query_row(
                    "SELECT retries, next_attempt_at FROM pending_message",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?;
                assert_eq!(retries, 1);
                assert!(next > unix_now());
                Ok(())
            })
            .unwrap();
    }
}
