//! EVM-family chain reader (ETH, BNB)
//!
//! Talks plain JSON-RPC: `eth_blockNumber` for the head and `eth_getLogs`
//! over the sync contract for events. The sync event indexes the publisher
//! address in `topics[1]` and ABI-encodes the chaindata JSON string in the
//! log data.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::chains::{ChainReader, SyncEvent};
use crate::error::NodeError;
use crate::types::Chain;

pub struct EthereumReader {
    chain: Chain,
    endpoint: String,
    contract_address: String,
    client: reqwest::Client,
}

impl EthereumReader {
    pub fn new(chain: Chain, endpoint: &str, contract_address: &str) -> Self {
        Self {
            chain,
            endpoint: endpoint.to_string(),
            contract_address: contract_address.to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, NodeError> {
        let response: Value = self
            .client
            .post(&self.endpoint)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await?
            .json()
            .await?;

        if let Some(error) = response.get("error") {
            return Err(NodeError::ChainRpc(format!("{method}: {error}")));
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| NodeError::ChainRpc(format!("{method}: empty result")))
    }
}

fn parse_hex_u64(value: &Value) -> Result<u64, NodeError> {
    let text = value
        .as_str()
        .ok_or_else(|| NodeError::ChainRpc("expected hex quantity".to_string()))?;
    u64::from_str_radix(text.trim_start_matches("0x"), 16)
        .map_err(|e| NodeError::ChainRpc(format!("bad hex quantity {text}: {e}")))
}

/// Decode a single ABI-encoded string argument from log data.
fn decode_abi_string(data: &[u8]) -> Result<String, NodeError> {
    if data.len() < 64 {
        return Err(NodeError::ChainRpc("log data too short".to_string()));
    }
    let offset = u64::from_be_bytes(data[24..32].try_into().expect("8 bytes")) as usize;
    let len_start = offset + 24;
    if data.len() < len_start + 8 {
        return Err(NodeError::ChainRpc("log data truncated".to_string()));
    }
    let length =
        u64::from_be_bytes(data[len_start..len_start + 8].try_into().expect("8 bytes")) as usize;
    let body_start = offset + 32;
    if data.len() < body_start + length {
        return Err(NodeError::ChainRpc("log data truncated".to_string()));
    }
    String::from_utf8(data[body_start..body_start + length].to_vec())
        .map_err(|e| NodeError::ChainRpc(format!("log string is not UTF-8: {e}")))
}

fn publisher_from_topic(topic: &str) -> Result<String, NodeError> {
    let bytes = hex::decode(topic.trim_start_matches("0x"))
        .map_err(|e| NodeError::ChainRpc(format!("bad topic hex: {e}")))?;
    if bytes.len() != 32 {
        return Err(NodeError::ChainRpc("topic is not 32 bytes".to_string()));
    }
    Ok(format!("0x{}", hex::encode(&bytes[12..])))
}

#[async_trait]
impl ChainReader for EthereumReader {
    fn chain(&self) -> Chain {
        self.chain
    }

    async fn head_height(&self) -> Result<u64, NodeError> {
        let result = self.rpc("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&result)
    }

    async fn fetch_events(&self, from: u64, to: u64) -> Result<Vec<SyncEvent>, NodeError> {
        let result = self
            .rpc(
                "eth_getLogs",
                json!([{
                    "address": self.contract_address,
                    "fromBlock": format!("0x{:x}", from + 1),
                    "toBlock": format!("0x{:x}", to),
                }]),
            )
            .await?;

        let logs = result
            .as_array()
            .ok_or_else(|| NodeError::ChainRpc("eth_getLogs: expected array".to_string()))?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            let height = parse_hex_u64(&log["blockNumber"])?;
            let tx_index = parse_hex_u64(&log["logIndex"]).unwrap_or(0);
            let tx_hash = log["transactionHash"]
                .as_str()
                .ok_or_else(|| NodeError::ChainRpc("log without transactionHash".to_string()))?
                .to_string();

            let publisher = log["topics"]
                .get(1)
                .and_then(Value::as_str)
                .map(publisher_from_topic)
                .transpose()?
                .unwrap_or_default();

            let data = hex::decode(
                log["data"]
                    .as_str()
                    .unwrap_or_default()
                    .trim_start_matches("0x"),
            )
            .map_err(|e| NodeError::ChainRpc(format!("bad log data hex: {e}")))?;
            let message = decode_abi_string(&data)?;
            let payload: Value = serde_json::from_str(&message)
                .map_err(|e| NodeError::ChainRpc(format!("chaindata is not JSON: {e}")))?;

            events.push(SyncEvent {
                height,
                tx_index,
                tx_hash,
                publisher,
                payload,
            });
        }

        events.sort_by_key(|e| (e.height, e.tx_index));
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abi_encode_string(text: &str) -> Vec<u8> {
        let mut out = vec![0u8; 32];
        out[31] = 32; // offset
        let mut len_word = [0u8; 32];
        len_word[24..].copy_from_slice(&(text.len() as u64).to_be_bytes());
        out.extend_from_slice(&len_word);
        out.extend_from_slice(text.as_bytes());
        // Pad to a 32-byte boundary
        while out.len() % 32 != 0 {
            out.push(0);
        }
        out
    }

    #[test]
    fn abi_string_round_trip() {
        let encoded = abi_encode_string(r#"{"protocol":"aleph"}"#);
        assert_eq!(decode_abi_string(&encoded).unwrap(), r#"{"protocol":"aleph"}"#);
    }

    #[test]
    fn publisher_topic_decoding() {
        let topic = format!("0x{}{}", "0".repeat(24), "ab".repeat(20));
        let publisher = publisher_from_topic(&topic).unwrap();
        assert_eq!(publisher, format!("0x{}", "ab".repeat(20)));
    }

    #[test]
    fn hex_quantities() {
        assert_eq!(parse_hex_u64(&serde_json::json!("0x10")).unwrap(), 16);
        assert!(parse_hex_u64(&serde_json::json!(16)).is_err());
    }
}
