//! Cosmos-SDK signatures (ADR-036 style)
//!
//! The wallet signs a zero-fee sign-doc wrapping the verification buffer in
//! a `signutil/MsgSignText` message. The signature field carries the base64
//! compact signature and the secp256k1 public key; the key must derive the
//! bech32 sender address (hrp taken from the sender itself).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k256::ecdsa::signature::Verifier as _;
use k256::ecdsa::{Signature, VerifyingKey};
use ripemd::Ripemd160;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::NodeError;
use crate::types::MessageEnvelope;

#[derive(Debug, Deserialize)]
struct CosmosSignature {
    signature: String,
    pub_key: CosmosPubKey,
}

#[derive(Debug, Deserialize)]
struct CosmosPubKey {
    #[serde(rename = "type")]
    key_type: String,
    value: String,
}

/// The canonical sign-doc: sorted keys, no whitespace, zero fee/sequence.
fn sign_doc(buffer: &[u8], signer: &str) -> Vec<u8> {
    // serde_json's default map ordering is sorted, matching the canonical
    // encoding wallets produce
    json!({
        "chain_id": "signed-message-v1",
        "account_number": "0",
        "fee": {"amount": [], "gas": "0"},
        "memo": "",
        "sequence": "0",
        "msgs": [{
            "type": "signutil/MsgSignText",
            "value": {
                "message": String::from_utf8_lossy(buffer),
                "signer": signer,
            },
        }],
    })
    .to_string()
    .into_bytes()
}

mod bech32 {
    //! Minimal bech32 encoder (BIP-173), enough to re-derive an address
    //! from a public key hash.

    const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";
    const GENERATOR: [u32; 5] = [0x3b6a_57b2, 0x2650_8e6d, 0x1ea1_19fa, 0x3d42_33dd, 0x2a14_62b3];

    fn polymod(values: &[u8]) -> u32 {
        let mut chk: u32 = 1;
        for &v in values {
            let top = chk >> 25;
            chk = (chk & 0x01ff_ffff) << 5 ^ u32::from(v);
            for (i, g) in GENERATOR.iter().enumerate() {
                if (top >> i) & 1 == 1 {
                    chk ^= g;
                }
            }
        }
        chk
    }

    fn hrp_expand(hrp: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(hrp.len() * 2 + 1);
        out.extend(hrp.bytes().map(|b| b >> 5));
        out.push(0);
        out.extend(hrp.bytes().map(|b| b & 31));
        out
    }

    fn to_five_bit(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut acc: u32 = 0;
        let mut bits = 0u32;
        for &b in data {
            acc = (acc << 8) | u32::from(b);
            bits += 8;
            while bits >= 5 {
                bits -= 5;
                out.push(((acc >> bits) & 31) as u8);
            }
        }
        if bits > 0 {
            out.push(((acc << (5 - bits)) & 31) as u8);
        }
        out
    }

    pub fn encode(hrp: &str, data: &[u8]) -> String {
        let five_bit = to_five_bit(data);

        let mut values = hrp_expand(hrp);
        values.extend_from_slice(&five_bit);
        values.extend_from_slice(&[0; 6]);
        let checksum = polymod(&values) ^ 1;

        let mut out = String::with_capacity(hrp.len() + 1 + five_bit.len() + 6);
        out.push_str(hrp);
        out.push('1');
        for v in five_bit {
            out.push(CHARSET[v as usize] as char);
        }
        for i in 0..6 {
            out.push(CHARSET[((checksum >> (5 * (5 - i))) & 31) as usize] as char);
        }
        out
    }
}

fn address_from_key(hrp: &str, key: &VerifyingKey) -> String {
    let sha = Sha256::digest(key.to_encoded_point(true).as_bytes());
    let hash: [u8; 20] = Ripemd160::digest(sha).into();
    bech32::encode(hrp, &hash)
}

pub fn verify(envelope: &MessageEnvelope, buffer: &[u8]) -> Result<(), NodeError> {
    let parsed: CosmosSignature = serde_json::from_str(&envelope.signature)
        .map_err(|e| NodeError::InvalidSignature(format!("signature not JSON: {e}")))?;

    if parsed.pub_key.key_type != "tendermint/PubKeySecp256k1" {
        return Err(NodeError::InvalidSignature(format!(
            "unsupported key type: {}",
            parsed.pub_key.key_type
        )));
    }

    let key_bytes = BASE64
        .decode(&parsed.pub_key.value)
        .map_err(|e| NodeError::InvalidSignature(format!("bad public key base64: {e}")))?;
    let verifying_key = VerifyingKey::from_sec1_bytes(&key_bytes)
        .map_err(|e| NodeError::InvalidSignature(format!("bad public key: {e}")))?;

    let hrp = envelope
        .sender
        .split_once('1')
        .map(|(hrp, _)| hrp)
        .ok_or_else(|| NodeError::InvalidSignature("sender is not bech32".to_string()))?;
    if address_from_key(hrp, &verifying_key) != envelope.sender {
        return Err(NodeError::InvalidSignature(format!(
            "public key does not derive sender {}",
            envelope.sender
        )));
    }

    let sig_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|e| NodeError::InvalidSignature(format!("bad signature base64: {e}")))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| NodeError::InvalidSignature(format!("malformed signature: {e}")))?;

    let doc = sign_doc(buffer, &envelope.sender);
    verifying_key
        .verify(&doc, &signature)
        .map_err(|e| NodeError::InvalidSignature(format!("secp256k1 verification failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::test_support::envelope;
    use crate::signing::verification_buffer;
    use crate::types::Chain;
    use k256::ecdsa::{signature::Signer, SigningKey};

    fn signed_envelope() -> crate::types::MessageEnvelope {
        let signing_key = SigningKey::from_bytes(&[21u8; 32].into()).unwrap();
        let key = signing_key.verifying_key();

        let mut env = envelope(Chain::Csdk);
        env.sender = address_from_key("cosmos", key);

        let doc = sign_doc(&verification_buffer(&env), &env.sender);
        let signature: Signature = signing_key.sign(&doc);

        env.signature = serde_json::json!({
            "signature": BASE64.encode(signature.to_bytes()),
            "pub_key": {
                "type": "tendermint/PubKeySecp256k1",
                "value": BASE64.encode(key.to_encoded_point(true).as_bytes()),
            },
        })
        .to_string();
        env
    }

    #[test]
    fn accepts_valid_sign_doc_signature() {
        let env = signed_envelope();
        assert!(env.sender.starts_with("cosmos1"));
        assert!(verify(&env, &verification_buffer(&env)).is_ok());
    }

    #[test]
    fn rejects_unsupported_key_type() {
        let mut env = signed_envelope();
        env.signature = serde_json::json!({
            "signature": "AA==",
            "pub_key": {"type": "tendermint/PubKeyEd25519", "value": "AA=="},
        })
        .to_string();
        assert!(verify(&env, &verification_buffer(&env)).is_err());
    }

    #[test]
    fn bech32_known_vector() {
        // BIP-173 test vector: empty data, hrp "bc" is not representative;
        // use a fixed 20-byte hash and check shape + determinism instead
        let addr = bech32::encode("cosmos", &[0u8; 20]);
        assert!(addr.starts_with("cosmos1"));
        assert_eq!(addr, bech32::encode("cosmos", &[0u8; 20]));
    }
}
