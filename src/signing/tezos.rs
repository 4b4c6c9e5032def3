//! Tezos signatures
//!
//! The signature field is JSON `{"publicKey": <edpk...>, "signature":
//! <edsig.../sig...>, "signingType": "raw"|"micheline", "dAppUrl": ...}`.
//! Key material is base58check with the usual Tezos prefixes; the ed25519
//! signature covers the blake2b-256 digest of the (possibly
//! Micheline-wrapped) buffer. The public key must hash to the sender's tz1
//! address.

use blake2::digest::consts::U32;
use blake2::digest::{Update, VariableOutput};
use blake2::{Blake2b, Blake2bVar, Digest};
use ed25519_dalek::{Signature, VerifyingKey};
use serde::Deserialize;

use crate::error::NodeError;
use crate::types::MessageEnvelope;

type Blake2b256 = Blake2b<U32>;

const PREFIX_EDPK: [u8; 4] = [13, 15, 37, 217];
const PREFIX_EDSIG: [u8; 5] = [9, 245, 205, 134, 18];
const PREFIX_SIG: [u8; 3] = [4, 130, 43];
const PREFIX_TZ1: [u8; 3] = [6, 161, 159];

const DEFAULT_DAPP_URL: &str = "aleph.im";

#[derive(Debug, Deserialize)]
struct TezosSignature {
    #[serde(rename = "publicKey")]
    public_key: String,
    signature: String,
    #[serde(rename = "signingType", default = "default_signing_type")]
    signing_type: String,
    #[serde(rename = "dAppUrl", default = "default_dapp_url")]
    dapp_url: String,
}

fn default_signing_type() -> String {
    "raw".to_string()
}

fn default_dapp_url() -> String {
    DEFAULT_DAPP_URL.to_string()
}

fn base58check_payload(encoded: &str, prefix: &[u8]) -> Result<Vec<u8>, NodeError> {
    let decoded = bs58::decode(encoded)
        .with_check(None)
        .into_vec()
        .map_err(|e| NodeError::InvalidSignature(format!("bad base58check: {e}")))?;
    decoded
        .strip_prefix(prefix)
        .map(|payload| payload.to_vec())
        .ok_or_else(|| NodeError::InvalidSignature(format!("unexpected prefix in {encoded}")))
}

/// tz1 address of an ed25519 public key: base58check of the blake2b-20 hash.
fn public_key_hash(key_bytes: &[u8]) -> Result<String, NodeError> {
    let mut hasher = Blake2bVar::new(20)
        .map_err(|e| NodeError::Internal(format!("blake2b-160: {e}")))?;
    hasher.update(key_bytes);
    let mut digest = [0u8; 20];
    hasher
        .finalize_variable(&mut digest)
        .map_err(|e| NodeError::Internal(format!("blake2b-160: {e}")))?;

    let mut payload = Vec::with_capacity(23);
    payload.extend_from_slice(&PREFIX_TZ1);
    payload.extend_from_slice(&digest);
    Ok(bs58::encode(payload).with_check().into_string())
}

/// ISO-8601 with millisecond precision and a literal Z, the format web
/// wallets embed in the signed payload.
fn timestamp_iso8601(time: f64) -> String {
    let datetime = chrono::DateTime::from_timestamp_millis((time * 1000.0) as i64)
        .unwrap_or_else(|| chrono::DateTime::from_timestamp_millis(0).expect("epoch"));
    datetime.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// The Micheline string-packing wrapper applied by web wallets.
fn micheline_buffer(buffer: &[u8], time: f64, dapp_url: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(b"Tezos Signed Message:");
    payload.push(b' ');
    payload.extend_from_slice(dapp_url.as_bytes());
    payload.push(b' ');
    payload.extend_from_slice(timestamp_iso8601(time).as_bytes());
    payload.push(b' ');
    payload.extend_from_slice(buffer);

    let hex_len = hex::encode(&payload).len().to_string();

    let mut framed = vec![0x05, 0x01, 0x00];
    framed.extend_from_slice(hex_len.as_bytes());
    framed.extend_from_slice(&payload);
    framed
}

pub fn verify(envelope: &MessageEnvelope, buffer: &[u8]) -> Result<(), NodeError> {
    let parsed: TezosSignature = serde_json::from_str(&envelope.signature)
        .map_err(|e| NodeError::InvalidSignature(format!("signature not JSON: {e}")))?;

    let key_bytes: [u8; 32] = base58check_payload(&parsed.public_key, &PREFIX_EDPK)?
        .try_into()
        .map_err(|_| NodeError::InvalidSignature("public key must be 32 bytes".to_string()))?;

    if public_key_hash(&key_bytes)? != envelope.sender {
        return Err(NodeError::InvalidSignature(format!(
            "public key does not hash to sender {}",
            envelope.sender
        )));
    }

    let sig_payload = if parsed.signature.starts_with("edsig") {
        base58check_payload(&parsed.signature, &PREFIX_EDSIG)?
    } else {
        base58check_payload(&parsed.signature, &PREFIX_SIG)?
    };
    let sig_bytes: [u8; 64] = sig_payload
        .try_into()
        .map_err(|_| NodeError::InvalidSignature("signature must be 64 bytes".to_string()))?;

    let signed_bytes = match parsed.signing_type.as_str() {
        "raw" => buffer.to_vec(),
        "micheline" => micheline_buffer(buffer, envelope.time, &parsed.dapp_url),
        other => {
            return Err(NodeError::InvalidSignature(format!(
                "unsupported signing type: {other}"
            )))
        }
    };

    let digest: [u8; 32] = Blake2b256::digest(&signed_bytes).into();

    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| NodeError::InvalidSignature(format!("bad public key: {e}")))?;
    verifying_key
        .verify_strict(&digest, &Signature::from_bytes(&sig_bytes))
        .map_err(|e| NodeError::InvalidSignature(format!("ed25519 verification failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::test_support::envelope;
    use crate::signing::verification_buffer;
    use crate::types::Chain;
    use ed25519_dalek::{Signer, SigningKey};

    fn encode_edpk(key_bytes: &[u8; 32]) -> String {
        let mut payload = Vec::new();
        payload.extend_from_slice(&PREFIX_EDPK);
        payload.extend_from_slice(key_bytes);
        bs58::encode(payload).with_check().into_string()
    }

    fn encode_edsig(sig_bytes: &[u8; 64]) -> String {
        let mut payload = Vec::new();
        payload.extend_from_slice(&PREFIX_EDSIG);
        payload.extend_from_slice(sig_bytes);
        bs58::encode(payload).with_check().into_string()
    }

    fn signed_envelope(signing_type: &str) -> crate::types::MessageEnvelope {
        let signing_key = SigningKey::from_bytes(&[11u8; 32]);
        let key_bytes = signing_key.verifying_key().to_bytes();

        let mut env = envelope(Chain::Tezos);
        env.sender = public_key_hash(&key_bytes).unwrap();

        let buffer = verification_buffer(&env);
        let signed_bytes = match signing_type {
            "raw" => buffer.clone(),
            "micheline" => micheline_buffer(&buffer, env.time, DEFAULT_DAPP_URL),
            _ => unreachable!(),
        };
        let digest: [u8; 32] = Blake2b256::digest(&signed_bytes).into();
        let signature = signing_key.sign(&digest);

        env.signature = serde_json::json!({
            "publicKey": encode_edpk(&key_bytes),
            "signature": encode_edsig(&signature.to_bytes()),
            "signingType": signing_type,
        })
        .to_string();
        env
    }

    #[test]
    fn accepts_raw_signature() {
        let env = signed_envelope("raw");
        assert!(env.sender.starts_with("tz1"));
        assert!(verify(&env, &verification_buffer(&env)).is_ok());
    }

    #[test]
    fn accepts_micheline_signature() {
        let env = signed_envelope("micheline");
        assert!(verify(&env, &verification_buffer(&env)).is_ok());
    }

    #[test]
    fn rejects_key_not_hashing_to_sender() {
        let mut env = signed_envelope("raw");
        env.sender = "tz1VSUr8wwNhLAzempoch5d6hLRiTh8Cjcjb".to_string();
        assert!(verify(&env, &verification_buffer(&env)).is_err());
    }
}
