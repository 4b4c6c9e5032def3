//! Substrate signatures
//!
//! The signature field is JSON `{"curve": "ed25519", "data": <hex>}` and the
//! sender is an SS58 address. The public key is extracted from the address;
//! its checksum is the first two bytes of blake2b-512("SS58PRE" || payload).
//! sr25519 signatures are not supported and reject permanently.

use blake2::digest::consts::U64;
use blake2::{Blake2b, Digest};
use ed25519_dalek::{Signature, VerifyingKey};
use serde::Deserialize;

use crate::error::NodeError;
use crate::types::MessageEnvelope;

type Blake2b512 = Blake2b<U64>;

#[derive(Debug, Deserialize)]
struct SubstrateSignature {
    #[serde(default = "default_curve")]
    curve: String,
    data: String,
}

fn default_curve() -> String {
    "sr25519".to_string()
}

/// Decode an SS58 address into its 32-byte public key.
fn ss58_public_key(address: &str) -> Result<[u8; 32], NodeError> {
    let decoded = bs58::decode(address)
        .into_vec()
        .map_err(|e| NodeError::InvalidSignature(format!("bad SS58 base58: {e}")))?;
    // 1-byte simple format: prefix + key + 2-byte checksum
    if decoded.len() != 35 {
        return Err(NodeError::InvalidSignature(format!(
            "unsupported SS58 payload length {}",
            decoded.len()
        )));
    }

    let (payload, checksum) = decoded.split_at(33);
    let mut hasher = Blake2b512::new();
    hasher.update(b"SS58PRE");
    hasher.update(payload);
    let digest = hasher.finalize();
    if checksum != &digest[..2] {
        return Err(NodeError::InvalidSignature(
            "SS58 checksum mismatch".to_string(),
        ));
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&payload[1..]);
    Ok(key)
}

pub fn verify(envelope: &MessageEnvelope, buffer: &[u8]) -> Result<(), NodeError> {
    let parsed: SubstrateSignature = serde_json::from_str(&envelope.signature)
        .map_err(|e| NodeError::InvalidSignature(format!("signature not JSON: {e}")))?;

    if parsed.curve != "ed25519" {
        return Err(NodeError::InvalidSignature(format!(
            "unsupported substrate curve: {}",
            parsed.curve
        )));
    }

    let sig_bytes: [u8; 64] = hex::decode(parsed.data.trim_start_matches("0x"))
        .map_err(|e| NodeError::InvalidSignature(format!("bad signature hex: {e}")))?
        .try_into()
        .map_err(|_| NodeError::InvalidSignature("signature must be 64 bytes".to_string()))?;

    let key_bytes = ss58_public_key(&envelope.sender)?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| NodeError::InvalidSignature(format!("bad public key: {e}")))?;

    // Wallets wrap the signed payload in <Bytes> framing
    let mut framed = Vec::with_capacity(buffer.len() + 15);
    framed.extend_from_slice(b"<Bytes>");
    framed.extend_from_slice(buffer);
    framed.extend_from_slice(b"</Bytes>");

    verifying_key
        .verify_strict(&framed, &Signature::from_bytes(&sig_bytes))
        .or_else(|_| verifying_key.verify_strict(buffer, &Signature::from_bytes(&sig_bytes)))
        .map_err(|e| NodeError::InvalidSignature(format!("ed25519 verification failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::test_support::envelope;
    use crate::signing::verification_buffer;
    use crate::types::Chain;
    use ed25519_dalek::{Signer, SigningKey};

    fn ss58_address(public_key: &[u8; 32]) -> String {
        let mut payload = Vec::with_capacity(33);
        payload.push(42u8); // generic substrate prefix
        payload.extend_from_slice(public_key);

        let mut hasher = Blake2b512::new();
        hasher.update(b"SS58PRE");
        hasher.update(&payload);
        let digest = hasher.finalize();

        payload.extend_from_slice(&digest[..2]);
        bs58::encode(payload).into_string()
    }

    fn signed_envelope() -> crate::types::MessageEnvelope {
        let signing_key = SigningKey::from_bytes(&[5u8; 32]);
        let mut env = envelope(Chain::Dot);
        env.sender = ss58_address(&signing_key.verifying_key().to_bytes());

        let buffer = verification_buffer(&env);
        let mut framed = Vec::new();
        framed.extend_from_slice(b"<Bytes>");
        framed.extend_from_slice(&buffer);
        framed.extend_from_slice(b"</Bytes>");
        let signature = signing_key.sign(&framed);

        env.signature = serde_json::json!({
            "curve": "ed25519",
            "data": format!("0x{}", hex::encode(signature.to_bytes())),
        })
        .to_string();
        env
    }

    #[test]
    fn accepts_valid_framed_signature() {
        let env = signed_envelope();
        assert!(verify(&env, &verification_buffer(&env)).is_ok());
    }

    #[test]
    fn rejects_sr25519() {
        let mut env = signed_envelope();
        env.signature = serde_json::json!({"curve": "sr25519", "data": "0x00"}).to_string();
        let err = verify(&env, &verification_buffer(&env)).unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }

    #[test]
    fn rejects_corrupted_ss58_checksum() {
        let mut env = signed_envelope();
        // Flip a character in the address body
        let mut chars: Vec<char> = env.sender.chars().collect();
        let mid = chars.len() / 2;
        chars[mid] = if chars[mid] == '1' { '2' } else { '1' };
        env.sender = chars.into_iter().collect();
        assert!(verify(&env, &verification_buffer(&env)).is_err());
    }
}
