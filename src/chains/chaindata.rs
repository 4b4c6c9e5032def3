//! On-chain payload decoding
//!
//! A sync transaction carries either the message batch inline
//! (`{"protocol":"aleph","version":1,"content":[...]}`) or a reference to a
//! CAS object with the same shape
//! (`{"protocol":"aleph-offchain","version":1,"content":"<CIDv0>"}`).

use serde_json::Value;

use crate::db::pending_txs::TxProtocol;
use crate::error::NodeError;

const PROTOCOL_INLINE: &str = "aleph";
const PROTOCOL_OFFCHAIN: &str = "aleph-offchain";
const SUPPORTED_VERSION: i64 = 1;

/// Decode a chaindata document into the queue's protocol + payload pair:
/// the serialized envelope array for inline batches, the content hash for
/// off-chain ones.
pub fn parse_chaindata(doc: &Value) -> Result<(TxProtocol, String), NodeError> {
    let protocol = doc
        .get("protocol")
        .and_then(Value::as_str)
        .ok_or_else(|| NodeError::InvalidMessage("chaindata without protocol".to_string()))?;
    let version = doc.get("version").and_then(Value::as_i64).unwrap_or(0);
    if version != SUPPORTED_VERSION {
        return Err(NodeError::InvalidMessage(format!(
            "unsupported chaindata version {version}"
        )));
    }

    match protocol {
        PROTOCOL_INLINE => {
            // Both the bare array and the {"messages": [...]} wrapper are in
            // the wild
            let content = doc
                .get("content")
                .ok_or_else(|| NodeError::InvalidMessage("chaindata without content".to_string()))?;
            let messages = match content {
                Value::Array(items) => items,
                Value::Object(map) => map
                    .get("messages")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        NodeError::InvalidMessage("inline chaindata without messages".to_string())
                    })?,
                _ => {
                    return Err(NodeError::InvalidMessage(
                        "inline chaindata content is not a batch".to_string(),
                    ))
                }
            };
            Ok((
                TxProtocol::BatchInline,
                serde_json::to_string(messages)?,
            ))
        }
        PROTOCOL_OFFCHAIN => {
            let hash = doc
                .get("content")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    NodeError::InvalidMessage("offchain chaindata without hash".to_string())
                })?;
            Ok((TxProtocol::BatchRef, hash.to_string()))
        }
        other => Err(NodeError::InvalidMessage(format!(
            "unknown chaindata protocol: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inline_array_form() {
        let (protocol, payload) = parse_chaindata(&json!({
            "protocol": "aleph", "version": 1, "content": [{"k": 1}],
        }))
        .unwrap();
        assert_eq!(protocol, TxProtocol::BatchInline);
        assert_eq!(payload, r#"[{"k":1}]"#);
    }

    #[test]
    fn inline_messages_wrapper_form() {
        let (protocol, payload) = parse_chaindata(&json!({
            "protocol": "aleph", "version": 1, "content": {"messages": []},
        }))
        .unwrap();
        assert_eq!(protocol, TxProtocol::BatchInline);
        assert_eq!(payload, "[]");
    }

    #[test]
    fn offchain_reference_form() {
        let (protocol, payload) = parse_chaindata(&json!({
            "protocol": "aleph-offchain", "version": 1,
            "content": "QmNrgEMcUygbKzZeZgYFosdd27VE9KnWbyUD73bKZJ3bGi",
        }))
        .unwrap();
        assert_eq!(protocol, TxProtocol::BatchRef);
        assert!(payload.starts_with("Qm"));
    }

    #[test]
    fn rejects_unknown_protocol_and_version() {
        assert!(parse_chaindata(&json!({"protocol": "other", "version": 1, "content": []})).is_err());
        assert!(parse_chaindata(&json!({"protocol": "aleph", "version": 2, "content": []})).is_err());
        assert!(parse_chaindata(&json!({"version": 1, "content": []})).is_err());
    }
}
