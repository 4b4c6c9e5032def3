//! Solana signatures
//!
//! The signature field is a JSON object `{"signature": <base58>,
//! "publicKey": <base58>}`; the public key must equal the sender address and
//! the ed25519 signature covers the raw verification buffer.

use ed25519_dalek::{Signature, VerifyingKey};
use serde::Deserialize;

use crate::error::NodeError;
use crate::types::MessageEnvelope;

#[derive(Debug, Deserialize)]
struct SolanaSignature {
    signature: String,
    #[serde(rename = "publicKey")]
    public_key: String,
}

pub fn verify(envelope: &MessageEnvelope, buffer: &[u8]) -> Result<(), NodeError> {
    let parsed: SolanaSignature = serde_json::from_str(&envelope.signature)
        .map_err(|e| NodeError::InvalidSignature(format!("signature not JSON: {e}")))?;

    if parsed.public_key != envelope.sender {
        return Err(NodeError::InvalidSignature(format!(
            "public key {} does not match sender {}",
            parsed.public_key, envelope.sender
        )));
    }

    let key_bytes: [u8; 32] = bs58::decode(&parsed.public_key)
        .into_vec()
        .map_err(|e| NodeError::InvalidSignature(format!("bad public key base58: {e}")))?
        .try_into()
        .map_err(|_| NodeError::InvalidSignature("public key must be 32 bytes".to_string()))?;
    let sig_bytes: [u8; 64] = bs58::decode(&parsed.signature)
        .into_vec()
        .map_err(|e| NodeError::InvalidSignature(format!("bad signature base58: {e}")))?
        .try_into()
        .map_err(|_| NodeError::InvalidSignature("signature must be 64 bytes".to_string()))?;

    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| NodeError::InvalidSignature(format!("bad public key: {e}")))?;
    verifying_key
        .verify_strict(buffer, &Signature::from_bytes(&sig_bytes))
        .map_err(|e| NodeError::InvalidSignature(format!("ed25519 verification failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::test_support::envelope;
    use crate::signing::verification_buffer;
    use crate::types::Chain;
    use ed25519_dalek::{Signer, SigningKey};

    fn signed_envelope() -> crate::types::MessageEnvelope {
        let signing_key = SigningKey::from_bytes(&[3u8; 32]);
        let public_key = bs58::encode(signing_key.verifying_key().to_bytes()).into_string();

        let mut env = envelope(Chain::Sol);
        env.sender = public_key.clone();

        let signature = signing_key.sign(&verification_buffer(&env));
        env.signature = serde_json::json!({
            "signature": bs58::encode(signature.to_bytes()).into_string(),
            "publicKey": public_key,
        })
        .to_string();
        env
    }

    #[test]
    fn accepts_valid_signature() {
        let env = signed_envelope();
        assert!(verify(&env, &verification_buffer(&env)).is_ok());
    }

    #[test]
    fn rejects_key_not_matching_sender() {
        let mut env = signed_envelope();
        env.sender = bs58::encode([9u8; 32]).into_string();
        assert!(verify(&env, &verification_buffer(&env)).is_err());
    }

    #[test]
    fn rejects_tampered_buffer() {
        let mut env = signed_envelope();
        let good_buffer = verification_buffer(&env);
        env.item_hash = "different".to_string();
        let bad_buffer = verification_buffer(&env);
        assert_ne!(good_buffer, bad_buffer);
        assert!(verify(&env, &bad_buffer).is_err());
    }
}
