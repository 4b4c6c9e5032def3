//! EVM-family signatures (ETH, BNB)
//!
//! Personal-sign (EIP-191) over the verification buffer. The signature is
//! the usual 65-byte `r || s || v` hex string; the signer address is
//! recovered from it and compared to the envelope sender.

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use sha3::{Digest, Keccak256};
use tracing::warn;

use crate::error::NodeError;
use crate::types::MessageEnvelope;

/// keccak256(0x19 "Ethereum Signed Message:\n" len(buffer) buffer)
fn personal_sign_digest(buffer: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", buffer.len()).as_bytes());
    hasher.update(buffer);
    hasher.finalize().into()
}

/// Checksumless lowercase address from an uncompressed public key.
fn address_from_key(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let mut hasher = Keccak256::new();
    hasher.update(&point.as_bytes()[1..]);
    let digest = hasher.finalize();
    format!("0x{}", hex::encode(&digest[12..]))
}

pub fn verify(envelope: &MessageEnvelope, buffer: &[u8]) -> Result<(), NodeError> {
    let sig_hex = envelope.signature.trim_start_matches("0x");
    let sig_bytes = hex::decode(sig_hex)
        .map_err(|e| NodeError::InvalidSignature(format!("not hex: {e}")))?;
    if sig_bytes.len() != 65 {
        return Err(NodeError::InvalidSignature(format!(
            "expected 65 signature bytes, got {}",
            sig_bytes.len()
        )));
    }

    let signature = Signature::from_slice(&sig_bytes[..64])
        .map_err(|e| NodeError::InvalidSignature(format!("malformed signature: {e}")))?;
    let v = sig_bytes[64];
    let recovery_id = RecoveryId::try_from(if v >= 27 { v - 27 } else { v })
        .map_err(|e| NodeError::InvalidSignature(format!("bad recovery id {v}: {e}")))?;

    let digest = personal_sign_digest(buffer);
    let recovered = VerifyingKey::recover_from_prehash(&digest, &signature, recovery_id)
        .map_err(|e| NodeError::InvalidSignature(format!("recovery failed: {e}")))?;

    let address = address_from_key(&recovered);
    if !address.eq_ignore_ascii_case(&envelope.sender) {
        warn!(
            recovered = %address,
            sender = %envelope.sender,
            "Received bad signature"
        );
        return Err(NodeError::InvalidSignature(format!(
            "recovered {address}, expected {}",
            envelope.sender
        )));
    }
    Ok(())
}
