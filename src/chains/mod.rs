//! Chain indexers
//!
//! One resumable poller per configured chain projects the on-chain log of
//! batched sync transactions into the pending-tx queue. The cursor advances
//! only after the queue write commits, and every write is an idempotent
//! upsert, so crashes and reorg re-scans never duplicate work.

pub mod chaindata;
pub mod ethereum;
pub mod nuls2;
pub mod tezos;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::ChainConfig;
use crate::context::NodeContext;
use crate::db::chains::{get_cursor, upsert_cursor};
use crate::db::pending_txs::{upsert_pending_tx, PendingTxRow};
use crate::db::unix_now;
use crate::error::NodeError;
use crate::types::Chain;

/// A sync transaction observed on-chain.
#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub height: u64,
    pub tx_index: u64,
    pub tx_hash: String,
    pub publisher: String,
    /// The chaindata document carried by the transaction
    pub payload: Value,
}

/// Chain-specific read access: head height and sync events per block range.
#[async_trait]
pub trait ChainReader: Send + Sync {
    fn chain(&self) -> Chain;

    async fn head_height(&self) -> Result<u64, NodeError>;

    /// Sync events in the half-open range `(from, to]`, ordered by
    /// (height, tx_index).
    async fn fetch_events(&self, from: u64, to: u64) -> Result<Vec<SyncEvent>, NodeError>;
}

/// Resumable polling indexer around a [`ChainReader`].
pub struct ChainIndexer {
    ctx: Arc<NodeContext>,
    reader: Box<dyn ChainReader>,
    config: ChainConfig,
}

impl ChainIndexer {
    pub fn new(ctx: Arc<NodeContext>, reader: Box<dyn ChainReader>, config: ChainConfig) -> Self {
        Self {
            ctx,
            reader,
            config,
        }
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let chain = self.reader.chain();
        info!(chain = %chain, endpoint = %self.config.rpc_endpoint, "Chain indexer started");

        let poll = Duration::from_secs(self.config.poll_interval_secs);
        let mut rpc_backoff = Duration::from_secs(1);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(chain = %chain, "Chain indexer stopping");
                    break;
                }
                _ = tokio::time::sleep(poll) => {}
            }

            match self.poll_once().await {
                Ok(()) => {
                    rpc_backoff = Duration::from_secs(1);
                }
                Err(e) => {
                    error!(chain = %chain, error = %e, "Indexer poll failed, backing off");
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(rpc_backoff) => {}
                    }
                    rpc_backoff = (rpc_backoff * 2).min(Duration::from_secs(60));
                }
            }
        }
    }

    /// One polling pass: scan `(cursor, head - confirmation_depth]` in
    /// window-sized ranges.
    pub async fn poll_once(&self) -> Result<(), NodeError> {
        let chain = self.reader.chain();
        let head = self.reader.head_height().await?;
        let safe_head = head.saturating_sub(self.config.confirmation_depth);

        let mut cursor = self
            .ctx
            .db
            .with_conn(|conn| get_cursor(conn, chain))?
            .map(|c| c.last_height)
            .unwrap_or(self.config.start_height);

        // A head below the cursor means the chain reorganised; rewind and
        // re-scan (the queue upserts make this idempotent)
        if safe_head < cursor {
            warn!(chain = %chain, cursor, safe_head, "Cursor ahead of safe head, rewinding");
            self.ctx
                .db
                .with_conn(|conn| upsert_cursor(conn, chain, safe_head, None, unix_now()))?;
            cursor = safe_head;
        }

        while cursor < safe_head {
            let to = (cursor + self.config.window).min(safe_head);
            let events = self.reader.fetch_events(cursor, to).await?;
            self.ingest(&events, to)?;
            debug!(chain = %chain, from = cursor, to, events = events.len(), "Indexed range");
            cursor = to;
        }
        Ok(())
    }

    /// Write a range's events and advance the cursor in one transaction.
    fn ingest(&self, events: &[SyncEvent], range_end: u64) -> Result<(), NodeError> {
        let chain = self.reader.chain();
        let now = unix_now();

        self.ctx.db.with_conn_mut(|conn| {
            let db_tx = conn.transaction()?;
            let mut last_tx_hash = None;

            for event in events {
                let (protocol, payload) = match chaindata::parse_chaindata(&event.payload) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        // Malformed payloads are logged and skipped; the
                        // cursor still advances
                        warn!(
                            chain = %chain,
                            tx_hash = %event.tx_hash,
                            error = %e,
                            "Skipping malformed chaindata"
                        );
                        continue;
                    }
                };

                upsert_pending_tx(
                    &db_tx,
                    &PendingTxRow {
                        chain,
                        tx_hash: event.tx_hash.clone(),
                        height: event.height,
                        tx_index: event.tx_index,
                        publisher: event.publisher.clone(),
                        protocol,
                        payload,
                        retries: 0,
                        next_attempt_at: 0,
                    },
                    now,
                )?;
                last_tx_hash = Some(event.tx_hash.clone());
            }

            upsert_cursor(&db_tx, chain, range_end, last_tx_hash.as_deref(), now)?;
            db_tx.commit()?;
            Ok(())
        })
    }
}

/// Build an indexer for each configured chain and spawn it.
pub fn spawn_indexers(
    ctx: &Arc<NodeContext>,
    shutdown: &broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    for chain_config in ctx.config.chains.clone() {
        let reader: Box<dyn ChainReader> = match chain_config.chain {
            Chain::Eth | Chain::Bnb => Box::new(ethereum::EthereumReader::new(
                chain_config.chain,
                &chain_config.rpc_endpoint,
                &chain_config.contract_address,
            )),
            Chain::Tezos => Box::new(tezos::TezosReader::new(
                &chain_config.rpc_endpoint,
                &chain_config.contract_address,
            )),
            Chain::Nuls2 => Box::new(nuls2::Nuls2Reader::new(
                &chain_config.rpc_endpoint,
                &chain_config.contract_address,
            )),
            other => {
                warn!(chain = %other, "No indexer available for chain, skipping");
                continue;
            }
        };

        let indexer = ChainIndexer::new(Arc::clone(ctx), reader, chain_config);
        let receiver = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            indexer.run(receiver).await;
        }));
    }

    handles
}
