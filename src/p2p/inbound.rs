//! P2P inbound: topic subscription into the pending-message queue
//!
//! Envelopes are normalised and queued; content is never fetched here, that
//! is the processor's job. Duplicates are suppressed against a hot in-memory
//! set and the queue/message tables, and the queue's high watermark pushes
//! back on the firehose.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::context::NodeContext;
use crate::db::pending_messages::{count_pending_messages, insert_pending_message, pending_exists};
use crate::db::messages::message_exists;
use crate::db::unix_now;
use crate::error::NodeError;
use crate::p2p::P2pClient;
use crate::types::{MessageEnvelope, MessageOrigin};

/// Hot-dedup cache bound; the set resets when it grows past this.
const SEEN_CACHE_LIMIT: usize = 100_000;

pub struct P2pInbound {
    ctx: Arc<NodeContext>,
    client: Arc<P2pClient>,
    seen: DashMap<String, ()>,
}

impl P2pInbound {
    pub fn new(ctx: Arc<NodeContext>, client: Arc<P2pClient>) -> Self {
        Self {
            ctx,
            client,
            seen: DashMap::new(),
        }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<(), NodeError> {
        let topic = self.ctx.config.p2p.topic.clone();
        let mut receiver = self.client.subscribe(&topic).await?;
        info!(topic = %topic, "Subscribed to message topic");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("P2P inbound stopping");
                    return Ok(());
                }
                message = receiver.recv() => {
                    match message {
                        Ok(msg) if msg.topic == topic => {
                            if let Err(e) = self.handle_announcement(&msg.data) {
                                debug!(error = %e, "Dropped P2P announcement");
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "P2P inbound lagged, announcements dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(NodeError::P2p("daemon stream closed".to_string()));
                        }
                    }
                }
            }
        }
    }

    fn handle_announcement(&self, data: &[u8]) -> Result<(), NodeError> {
        let envelope: MessageEnvelope = serde_json::from_slice(data)
            .map_err(|e| NodeError::InvalidMessage(format!("announcement is not an envelope: {e}")))?;

        // Hot path: a hash we have seen recently needs no queries
        if self.seen.contains_key(&envelope.item_hash) {
            return Ok(());
        }

        let queued = self.ctx.db.with_conn(|conn| {
            if pending_exists(conn, &envelope.item_hash)?
                || message_exists(conn, &envelope.item_hash)?
            {
                return Ok(false);
            }

            // Backpressure: above the high watermark the firehose is shed;
            // peers will re-announce
            let pending = count_pending_messages(conn)?;
            if pending > self.ctx.config.pipeline.pending_high_watermark {
                warn!(pending, "Pending queue saturated, dropping P2P announcement");
                return Ok(false);
            }

            insert_pending_message(conn, &envelope, MessageOrigin::P2p, None, true, unix_now())
        })?;

        if queued {
            if self.seen.len() > SEEN_CACHE_LIMIT {
                self.seen.clear();
            }
            self.seen.insert(envelope.item_hash.clone(), ());
            debug!(item_hash = %envelope.item_hash, "Queued P2P message");
        }
        Ok(())
    }
}
