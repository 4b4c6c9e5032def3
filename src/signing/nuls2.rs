//! NULS2 signatures
//!
//! The signature field is base64 of the 33-byte compressed secp256k1 public
//! key followed by the 64-byte compact signature over sha256(buffer). The
//! sender address embeds a chain id and an address type ahead of
//! ripemd160(sha256(pubkey)), base58-encoded with a trailing XOR checksum
//! byte; the embedded key must re-derive the sender.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k256::ecdsa::signature::Verifier as _;
use k256::ecdsa::{Signature, VerifyingKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::error::NodeError;
use crate::types::MessageEnvelope;

/// Decode a NULS address into (chain_id, address_type, hash160).
fn decode_address(address: &str) -> Result<(u16, u8, [u8; 20]), NodeError> {
    let decoded = bs58::decode(address)
        .into_vec()
        .map_err(|e| NodeError::InvalidSignature(format!("bad address base58: {e}")))?;
    if decoded.len() != 24 {
        return Err(NodeError::InvalidSignature(format!(
            "unexpected address length {}",
            decoded.len()
        )));
    }

    let (body, checksum) = decoded.split_at(23);
    let expected = body.iter().fold(0u8, |acc, b| acc ^ b);
    if checksum[0] != expected {
        return Err(NodeError::InvalidSignature(
            "address checksum mismatch".to_string(),
        ));
    }

    let chain_id = u16::from_le_bytes([body[0], body[1]]);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&body[3..23]);
    Ok((chain_id, body[2], hash))
}

fn encode_address(chain_id: u16, address_type: u8, hash: &[u8; 20]) -> String {
    let mut body = Vec::with_capacity(24);
    body.extend_from_slice(&chain_id.to_le_bytes());
    body.push(address_type);
    body.extend_from_slice(hash);
    let checksum = body.iter().fold(0u8, |acc, b| acc ^ b);
    body.push(checksum);
    bs58::encode(body).into_string()
}

fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    Ripemd160::digest(sha).into()
}

/// Derive the address the embedded key belongs to, reusing the chain id and
/// address type carried by the sender address.
fn address_for_key(sender: &str, key: &VerifyingKey) -> Result<String, NodeError> {
    let (chain_id, address_type, _) = decode_address(sender)?;
    let key_hash = hash160(key.to_encoded_point(true).as_bytes());
    Ok(encode_address(chain_id, address_type, &key_hash))
}

pub fn verify(envelope: &MessageEnvelope, buffer: &[u8]) -> Result<(), NodeError> {
    let raw = BASE64
        .decode(&envelope.signature)
        .map_err(|e| NodeError::InvalidSignature(format!("not base64: {e}")))?;
    if raw.len() != 97 {
        return Err(NodeError::InvalidSignature(format!(
            "expected 97 signature bytes, got {}",
            raw.len()
        )));
    }

    let verifying_key = VerifyingKey::from_sec1_bytes(&raw[..33])
        .map_err(|e| NodeError::InvalidSignature(format!("bad public key: {e}")))?;
    let signature = Signature::from_slice(&raw[33..])
        .map_err(|e| NodeError::InvalidSignature(format!("malformed signature: {e}")))?;

    if address_for_key(&envelope.sender, &verifying_key)? != envelope.sender {
        return Err(NodeError::InvalidSignature(format!(
            "public key does not derive sender {}",
            envelope.sender
        )));
    }

    verifying_key
        .verify(buffer, &signature)
        .map_err(|e| NodeError::InvalidSignature(format!("secp256k1 verification failed: {e}")))
}
