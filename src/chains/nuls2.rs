//! NULS2 chain reader
//!
//! Reads the explorer's `transactions.json` endpoint for transfers to the
//! sync address. The chaindata document travels in the transaction `info`
//! field; the `remark` marks Aleph sync transactions.

use async_trait::async_trait;
use serde_json::Value;

use crate::chains::{ChainReader, SyncEvent};
use crate::error::NodeError;
use crate::types::Chain;

const SYNC_REMARK: &str = "ALEPH-SYNC";
const PAGE_SIZE: usize = 500;

pub struct Nuls2Reader {
    endpoint: String,
    sync_address: String,
    client: reqwest::Client,
}

impl Nuls2Reader {
    pub fn new(endpoint: &str, sync_address: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            sync_address: sync_address.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChainReader for Nuls2Reader {
    fn chain(&self) -> Chain {
        Chain::Nuls2
    }

    async fn head_height(&self) -> Result<u64, NodeError> {
        let response: Value = self
            .client
            .get(format!("{}/status.json", self.endpoint))
            .send()
            .await?
            .json()
            .await?;
        response["last_height"]
            .as_u64()
            .ok_or_else(|| NodeError::ChainRpc("explorer has no last_height".to_string()))
    }

    async fn fetch_events(&self, from: u64, to: u64) -> Result<Vec<SyncEvent>, NodeError> {
        let response: Value = self
            .client
            .get(format!("{}/transactions.json", self.endpoint))
            .query(&[
                ("address", self.sync_address.as_str()),
                ("sort_order", "1"),
                ("startHeight", &(from + 1).to_string()),
                ("pagination", &PAGE_SIZE.to_string()),
            ])
            .send()
            .await?
            .json()
            .await?;

        let txs = response["transactions"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let mut events = Vec::new();
        for tx in txs {
            let height = tx["height"].as_u64().unwrap_or(0);
            if height <= from || height > to {
                continue;
            }
            if tx["remark"].as_str() != Some(SYNC_REMARK) {
                continue;
            }

            let payload = match &tx["info"] {
                Value::String(text) => serde_json::from_str(text)
                    .map_err(|e| NodeError::ChainRpc(format!("bad tx info: {e}")))?,
                other => other.clone(),
            };

            events.push(SyncEvent {
                height,
                tx_index: tx["index"].as_u64().unwrap_or(0),
                tx_hash: tx["hash"].as_str().unwrap_or_default().to_string(),
                publisher: tx["from"].as_str().unwrap_or_default().to_string(),
                payload,
            });
        }

        events.sort_by_key(|e| (e.height, e.tx_index));
        Ok(events)
    }
}
