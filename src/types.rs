//! Wire types shared across the pipeline
//!
//! The message envelope is the unit replicated between nodes. Its dynamic
//! `content` payload is validated at the boundary into one typed variant per
//! message kind; everything downstream works with the typed form.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::NodeError;

/// Inline message content is capped at 200 kB.
pub const MAX_INLINE_CONTENT_SIZE: usize = 200 * 1024;

/// Chains the node accepts messages and sync transactions from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Chain {
    #[serde(rename = "ETH")]
    Eth,
    #[serde(rename = "BNB")]
    Bnb,
    #[serde(rename = "NULS2")]
    Nuls2,
    #[serde(rename = "TEZOS")]
    Tezos,
    #[serde(rename = "CSDK")]
    Csdk,
    #[serde(rename = "SOL")]
    Sol,
    #[serde(rename = "DOT")]
    Dot,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Eth => "ETH",
            Chain::Bnb => "BNB",
            Chain::Nuls2 => "NULS2",
            Chain::Tezos => "TEZOS",
            Chain::Csdk => "CSDK",
            Chain::Sol => "SOL",
            Chain::Dot => "DOT",
        }
    }

    pub fn parse(s: &str) -> Result<Self, NodeError> {
        match s {
            "ETH" => Ok(Chain::Eth),
            "BNB" => Ok(Chain::Bnb),
            "NULS2" => Ok(Chain::Nuls2),
            "TEZOS" => Ok(Chain::Tezos),
            "CSDK" => Ok(Chain::Csdk),
            "SOL" => Ok(Chain::Sol),
            "DOT" => Ok(Chain::Dot),
            other => Err(NodeError::InvalidMessage(format!("unknown chain: {other}"))),
        }
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message kinds, each with its own content handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "AGGREGATE")]
    Aggregate,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "STORE")]
    Store,
    #[serde(rename = "FORGET")]
    Forget,
    #[serde(rename = "PROGRAM")]
    Program,
}

impl MessageType {
    pub const ALL: [MessageType; 5] = [
        MessageType::Aggregate,
        MessageType::Post,
        MessageType::Store,
        MessageType::Forget,
        MessageType::Program,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Aggregate => "AGGREGATE",
            MessageType::Post => "POST",
            MessageType::Store => "STORE",
            MessageType::Forget => "FORGET",
            MessageType::Program => "PROGRAM",
        }
    }

    pub fn parse(s: &str) -> Result<Self, NodeError> {
        match s {
            "AGGREGATE" => Ok(MessageType::Aggregate),
            "POST" => Ok(MessageType::Post),
            "STORE" => Ok(MessageType::Store),
            "FORGET" => Ok(MessageType::Forget),
            "PROGRAM" => Ok(MessageType::Program),
            other => Err(NodeError::InvalidMessage(format!(
                "unknown message type: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the message content lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Inline,
    Storage,
    Ipfs,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Inline => "inline",
            ItemType::Storage => "storage",
            ItemType::Ipfs => "ipfs",
        }
    }

    pub fn parse(s: &str) -> Result<Self, NodeError> {
        match s {
            "inline" => Ok(ItemType::Inline),
            "storage" => Ok(ItemType::Storage),
            "ipfs" => Ok(ItemType::Ipfs),
            other => Err(NodeError::InvalidMessage(format!(
                "unknown item type: {other}"
            ))),
        }
    }
}

/// Which ingress delivered a pending message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageOrigin {
    P2p,
    Http,
    Onchain,
}

impl MessageOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageOrigin::P2p => "p2p",
            MessageOrigin::Http => "http",
            MessageOrigin::Onchain => "onchain",
        }
    }

    pub fn parse(s: &str) -> Result<Self, NodeError> {
        match s {
            "p2p" => Ok(MessageOrigin::P2p),
            "http" => Ok(MessageOrigin::Http),
            "onchain" => Ok(MessageOrigin::Onchain),
            other => Err(NodeError::InvalidMessage(format!(
                "unknown origin: {other}"
            ))),
        }
    }
}

/// Proof that a message was ordered on-chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Confirmation {
    pub chain: Chain,
    pub height: u64,
    pub tx_hash: String,
}

/// The signed message envelope as it travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub chain: Chain,
    pub sender: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub channel: String,
    /// Seconds since epoch, fractional.
    pub time: f64,
    pub item_type: ItemType,
    pub item_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_content: Option<String>,
    pub signature: String,
}

/// Typed content payloads, one per message kind. User-defined fields stay
/// opaque JSON.
#[derive(Debug, Clone)]
pub enum MessageContent {
    Aggregate(AggregateContent),
    Post(PostContent),
    Store(StoreContent),
    Forget(ForgetContent),
    Program(ProgramContent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateContent {
    pub address: String,
    pub key: String,
    pub content: Value,
    pub time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostContent {
    pub address: String,
    #[serde(rename = "type")]
    pub post_type: String,
    #[serde(default)]
    pub content: Option<Value>,
    /// Item hash of the original post this one amends, if any.
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub amends: Option<String>,
    pub time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreContent {
    pub address: String,
    pub item_type: ItemType,
    pub item_hash: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgetContent {
    pub address: String,
    #[serde(default)]
    pub hashes: Vec<String>,
    #[serde(default)]
    pub aggregates: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub time: f64,
}

/// Program trigger declarations. The descriptor body stays opaque; only the
/// trigger index is interpreted here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgramTriggers {
    #[serde(default)]
    pub http: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aleph: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramContent {
    pub address: String,
    pub time: f64,
    #[serde(default)]
    pub on: ProgramTriggers,
    /// Remaining descriptor fields (code, runtime, volumes, ...).
    #[serde(flatten)]
    pub descriptor: Value,
}

impl MessageContent {
    /// Validate a raw content document against the envelope's message type.
    pub fn parse(message_type: MessageType, raw: &Value) -> Result<Self, NodeError> {
        let content = match message_type {
            MessageType::Aggregate => {
                MessageContent::Aggregate(serde_json::from_value(raw.clone())?)
            }
            MessageType::Post => MessageContent::Post(serde_json::from_value(raw.clone())?),
            MessageType::Store => MessageContent::Store(serde_json::from_value(raw.clone())?),
            MessageType::Forget => MessageContent::Forget(serde_json::from_value(raw.clone())?),
            MessageType::Program => MessageContent::Program(serde_json::from_value(raw.clone())?),
        };
        Ok(content)
    }

    /// The address the content claims to act for. Authorization is checked
    /// against this when it differs from the envelope sender.
    pub fn address(&self) -> &str {
        match self {
            MessageContent::Aggregate(c) => &c.address,
            MessageContent::Post(c) => &c.address,
            MessageContent::Store(c) => &c.address,
            MessageContent::Forget(c) => &c.address,
            MessageContent::Program(c) => &c.address,
        }
    }

    pub fn time(&self) -> f64 {
        match self {
            MessageContent::Aggregate(c) => c.time,
            MessageContent::Post(c) => c.time,
            MessageContent::Store(c) => c.time,
            MessageContent::Forget(c) => c.time,
            MessageContent::Program(c) => c.time,
        }
    }
}

/// SHA-256 of `data`, lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Infer the storage engine from the shape of a hash: 64 lowercase hex chars
/// is a SHA-256 (local storage), 46 chars starting with "Qm" is a CIDv0.
pub fn item_type_from_hash(hash: &str) -> Result<ItemType, NodeError> {
    if hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(ItemType::Storage)
    } else if hash.len() == 46 && hash.starts_with("Qm") {
        Ok(ItemType::Ipfs)
    } else {
        Err(NodeError::InvalidMessage(format!(
            "not a sha256 digest or CIDv0: {hash}"
        )))
    }
}

/// CIDv0 of raw bytes: base58btc of the sha2-256 multihash.
pub fn cid_v0(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut multihash = Vec::with_capacity(34);
    multihash.push(0x12);
    multihash.push(0x20);
    multihash.extend_from_slice(&digest);
    bs58::encode(multihash).into_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_wire_format() {
        let raw = r#"{
            "chain": "ETH",
            "sender": "0xA",
            "type": "AGGREGATE",
            "channel": "TEST",
            "time": 100.0,
            "item_type": "inline",
            "item_hash": "abc",
            "item_content": "{}",
            "signature": "0xdead"
        }"#;
        let env: MessageEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.chain, Chain::Eth);
        assert_eq!(env.message_type, MessageType::Aggregate);
        assert_eq!(env.item_type, ItemType::Inline);

        let out = serde_json::to_value(&env).unwrap();
        assert_eq!(out["type"], "AGGREGATE");
        assert_eq!(out["item_type"], "inline");
    }

    #[test]
    fn content_parse_rejects_wrong_shape() {
        let raw = serde_json::json!({"address": "0xA", "time": 1.0});
        assert!(MessageContent::parse(MessageType::Aggregate, &raw).is_err());
        assert!(MessageContent::parse(MessageType::Store, &raw).is_err());
    }

    #[test]
    fn item_type_inference() {
        let sha = sha256_hex(b"x");
        assert_eq!(item_type_from_hash(&sha).unwrap(), ItemType::Storage);
        let cid = cid_v0(b"x");
        assert_eq!(item_type_from_hash(&cid).unwrap(), ItemType::Ipfs);
        assert!(item_type_from_hash("nonsense").is_err());
    }

    #[test]
    fn cid_v0_shape() {
        let cid = cid_v0(b"hello");
        assert!(cid.starts_with("Qm"));
        assert_eq!(cid.len(), 46);
    }
}
