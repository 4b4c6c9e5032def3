//! Tezos chain reader
//!
//! Tezos sync events come from a GraphQL indexer rather than the node RPC:
//! the head is the indexer's most recent block and events are `MessageEvent`
//! entries emitted by the sync contract.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::chains::{ChainReader, SyncEvent};
use crate::error::NodeError;
use crate::types::Chain;

const EVENT_TYPE: &str = "MessageEvent";
const PAGE_SIZE: usize = 200;

pub struct TezosReader {
    endpoint: String,
    contract_address: String,
    client: reqwest::Client,
}

impl TezosReader {
    pub fn new(endpoint: &str, contract_address: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            contract_address: contract_address.to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn graphql(&self, query: String) -> Result<Value, NodeError> {
        let response: Value = self
            .client
            .post(&self.endpoint)
            .json(&json!({"query": query}))
            .send()
            .await?
            .json()
            .await?;

        if let Some(errors) = response.get("errors") {
            return Err(NodeError::ChainRpc(format!("indexer errors: {errors}")));
        }
        response
            .get("data")
            .cloned()
            .ok_or_else(|| NodeError::ChainRpc("indexer returned no data".to_string()))
    }

    fn events_query(&self, limit: usize, skip: usize) -> String {
        format!(
            r#"{{
  indexStatus {{ recentBlock status }}
  events(limit: {limit}, skip: {skip}, source: "{}", type: "{EVENT_TYPE}") {{
    source timestamp blockLevel operationHash type payload
  }}
}}"#,
            self.contract_address
        )
    }
}

#[async_trait]
impl ChainReader for TezosReader {
    fn chain(&self) -> Chain {
        Chain::Tezos
    }

    async fn head_height(&self) -> Result<u64, NodeError> {
        let data = self.graphql("{indexStatus {recentBlock}}".to_string()).await?;
        data["indexStatus"]["recentBlock"]
            .as_u64()
            .ok_or_else(|| NodeError::ChainRpc("indexer has no recentBlock".to_string()))
    }

    async fn fetch_events(&self, from: u64, to: u64) -> Result<Vec<SyncEvent>, NodeError> {
        let mut events = Vec::new();
        let mut skip = 0;

        loop {
            let data = self.graphql(self.events_query(PAGE_SIZE, skip)).await?;
            let page = data["events"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            let page_len = page.len();

            for event in page {
                let height = event["blockLevel"].as_u64().unwrap_or(0);
                if height <= from || height > to {
                    continue;
                }

                // The indexer delivers the payload either as a JSON object
                // or as its string form
                let payload = match &event["payload"] {
                    Value::String(text) => serde_json::from_str(text)
                        .map_err(|e| NodeError::ChainRpc(format!("bad event payload: {e}")))?,
                    other => other.clone(),
                };

                events.push(SyncEvent {
                    height,
                    tx_index: 0,
                    tx_hash: event["operationHash"].as_str().unwrap_or_default().to_string(),
                    publisher: event["source"].as_str().unwrap_or_default().to_string(),
                    payload,
                });
            }

            if page_len < PAGE_SIZE {
                break;
            }
            skip += PAGE_SIZE;
        }

        events.sort_by_key(|e| e.height);
        Ok(events)
    }
}
