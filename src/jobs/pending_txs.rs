//! Pending-transaction processor
//!
//! Unpacks claimed chain transactions into pending messages, each stamped
//! with the confirmation of the transaction that carried it. The fan-out and
//! the queue-row delete commit in one transaction, so a crash re-runs the tx
//! and the per-confirmation uniqueness of `pending_message` absorbs the
//! replay.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::context::NodeContext;
use crate::db::pending_messages::insert_pending_message;
use crate::db::pending_txs::{self, PendingTxRow, TxProtocol};
use crate::db::unix_now;
use crate::error::{NodeError, ProcessingError};
use crate::jobs::backoff_delay;
use crate::types::{item_type_from_hash, Confirmation, MessageEnvelope, MessageOrigin};

const TX_BATCH: usize = 20;

pub struct PendingTxProcessor {
    ctx: Arc<NodeContext>,
}

impl PendingTxProcessor {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("Pending-tx processor started");
        let poll = Duration::from_millis(self.ctx.config.pipeline.poll_interval_ms);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Pending-tx processor stopping");
                    break;
                }
                _ = tokio::time::sleep(poll) => {}
            }

            if let Err(e) = self.process_batch().await {
                error!(error = %e, "Pending-tx batch failed");
            }
        }
    }

    async fn process_batch(&self) -> Result<(), NodeError> {
        let config = &self.ctx.config.pipeline;
        let now = unix_now();

        // Queue backpressure: chain data is never dropped, but the fan-out
        // slows down while the message queue is saturated
        let batch = {
            let pending = self
                .ctx
                .db
                .with_conn(crate::db::pending_messages::count_pending_messages)?;
            if pending > config.pending_high_watermark {
                debug!(pending, "Message queue above high watermark, slowing tx fan-out");
                1
            } else {
                TX_BATCH
            }
        };

        let claimed = self.ctx.db.with_conn(|conn| {
            pending_txs::claim_due(conn, now, config.claim_timeout_secs as i64, batch)
        })?;

        for tx in claimed {
            self.process_tx(tx).await?;
        }
        Ok(())
    }

    /// Drive one claimed transaction to a terminal state.
    pub async fn process_tx(&self, tx: PendingTxRow) -> Result<(), NodeError> {
        let config = &self.ctx.config.pipeline;
        let now = unix_now();

        match self.unpack(&tx).await {
            Ok(envelopes) => {
                let count = envelopes.len();
                self.fan_out(&tx, envelopes, now)?;
                debug!(
                    chain = %tx.chain,
                    tx_hash = %tx.tx_hash,
                    messages = count,
                    "Unpacked chain transaction"
                );
            }
            Err(ProcessingError::Permanent(e)) => {
                warn!(
                    chain = %tx.chain,
                    tx_hash = %tx.tx_hash,
                    error = %e,
                    "Dropping undecodable chain transaction"
                );
                self.ctx.db.with_conn(|conn| {
                    pending_txs::reject_pending_tx(conn, tx.chain, &tx.tx_hash, &e.to_string(), now)
                })?;
            }
            Err(ProcessingError::Transient(e)) => {
                if tx.retries + 1 >= config.max_retries {
                    warn!(
                        chain = %tx.chain,
                        tx_hash = %tx.tx_hash,
                        error = %e,
                        "Chain transaction exhausted its retries"
                    );
                    self.ctx.db.with_conn(|conn| {
                        pending_txs::reject_pending_tx(
                            conn,
                            tx.chain,
                            &tx.tx_hash,
                            &format!("retries exhausted: {e}"),
                            now,
                        )
                    })?;
                } else {
                    let delay =
                        backoff_delay(config.retry_base_secs, config.retry_cap_secs, tx.retries);
                    debug!(
                        chain = %tx.chain,
                        tx_hash = %tx.tx_hash,
                        retry_in = delay,
                        error = %e,
                        "Deferring chain transaction"
                    );
                    self.ctx.db.with_conn(|conn| {
                        pending_txs::reschedule(conn, tx.chain, &tx.tx_hash, now, delay)
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Resolve the transaction payload into message envelopes.
    async fn unpack(&self, tx: &PendingTxRow) -> Result<Vec<MessageEnvelope>, ProcessingError> {
        let raw: serde_json::Value = match tx.protocol {
            TxProtocol::BatchInline => serde_json::from_str(&tx.payload).map_err(|e| {
                ProcessingError::permanent(NodeError::InvalidMessage(format!(
                    "inline batch is not JSON: {e}"
                )))
            })?,
            TxProtocol::BatchRef => {
                let engine = item_type_from_hash(&tx.payload)
                    .map_err(ProcessingError::permanent)?;
                let value = self
                    .ctx
                    .storage
                    .get_json(&tx.payload, engine)
                    .await
                    .map_err(ProcessingError::transient)?;
                // Keep the batch object alive on the network
                self.ctx
                    .storage
                    .pin(&tx.payload, engine)
                    .await
                    .map_err(ProcessingError::transient)?;
                value
            }
        };

        let items = raw.as_array().ok_or_else(|| {
            ProcessingError::permanent(NodeError::InvalidMessage(
                "batch content is not an array".to_string(),
            ))
        })?;

        let mut envelopes = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<MessageEnvelope>(item.clone()) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => {
                    // One bad envelope does not poison the batch
                    warn!(
                        chain = %tx.chain,
                        tx_hash = %tx.tx_hash,
                        error = %e,
                        "Skipping malformed envelope in chain batch"
                    );
                }
            }
        }
        Ok(envelopes)
    }

    /// Insert the envelopes and delete the tx row in one transaction.
    fn fan_out(
        &self,
        tx: &PendingTxRow,
        envelopes: Vec<MessageEnvelope>,
        now: i64,
    ) -> Result<(), NodeError> {
        let confirmation = Confirmation {
            chain: tx.chain,
            height: tx.height,
            tx_hash: tx.tx_hash.clone(),
        };

        self.ctx.db.with_conn_mut(|conn| {
            let db_tx = conn.transaction()?;
            for envelope in &envelopes {
                insert_pending_message(
                    &db_tx,
                    envelope,
                    MessageOrigin::Onchain,
                    Some(&confirmation),
                    true,
                    now,
                )?;
            }
            pending_txs::delete_pending_tx(&db_tx, tx.chain, &tx.tx_hash)?;
            db_tx.commit()?;
            Ok(())
        })
    }
}
