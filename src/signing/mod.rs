//! Message signature verification
//!
//! Every envelope is signed over the canonical encoding of
//! `{chain, item_hash, sender, type}` (sorted keys, no whitespace). Each
//! chain family has its own signature scheme and address binding; the
//! verifier dispatches on the envelope chain.
//!
//! Verification is pure computation and never suspends.

pub mod cosmos;
pub mod dot;
pub mod evm;
pub mod nuls2;
pub mod sol;
pub mod tezos;

use crate::error::NodeError;
use crate::types::{Chain, MessageEnvelope};

/// The canonical byte string the signature covers: JSON with sorted keys and
/// no whitespace.
pub fn verification_buffer(envelope: &MessageEnvelope) -> Vec<u8> {
    // serde_json's default map is ordered, which gives sorted keys for free
    let mut doc = serde_json::Map::new();
    doc.insert(
        "chain".to_string(),
        serde_json::Value::String(envelope.chain.as_str().to_string()),
    );
    doc.insert(
        "item_hash".to_string(),
        serde_json::Value::String(envelope.item_hash.clone()),
    );
    doc.insert(
        "sender".to_string(),
        serde_json::Value::String(envelope.sender.clone()),
    );
    doc.insert(
        "type".to_string(),
        serde_json::Value::String(envelope.message_type.as_str().to_string()),
    );
    serde_json::Value::Object(doc).to_string().into_bytes()
}

/// Verify an envelope's signature with the chain-appropriate scheme.
///
/// Returns `Ok(())` only when the signature is valid *and* binds to the
/// envelope sender. All failures are permanent from the pipeline's point of
/// view.
pub fn verify_signature(envelope: &MessageEnvelope) -> Result<(), NodeError> {
    let buffer = verification_buffer(envelope);
    match envelope.chain {
        Chain::Eth | Chain::Bnb => evm::verify(envelope, &buffer),
        Chain::Nuls2 => nuls2::verify(envelope, &buffer),
        Chain::Sol => sol::verify(envelope, &buffer),
        Chain::Dot => dot::verify(envelope, &buffer),
        Chain::Tezos => tezos::verify(envelope, &buffer),
        Chain::Csdk => cosmos::verify(envelope, &buffer),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chain, ItemType, MessageType};

    #[test]
    fn buffer_is_sorted_and_compact() {
        let env = MessageEnvelope {
            chain: Chain::Eth,
            sender: "0xA".to_string(),
            message_type: MessageType::Aggregate,
            channel: "T".to_string(),
            time: 1.0,
            item_type: ItemType::Inline,
            item_hash: "abc".to_string(),
            item_content: None,
            signature: String::new(),
        };
        let buffer = String::from_utf8(verification_buffer(&env)).unwrap();
        assert_eq!(
            buffer,
            r#"{"chain":"ETH","item_hash":"abc","sender":"0xA","type":"AGGREGATE"}"#
        );
    }
}
