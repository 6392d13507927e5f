//! did:key codec for Ed25519
//!
//! `did:key:z<base58btc(0xed 0x01 ‖ public_key)>`. The two-byte multicodec
//! header marks an Ed25519 public key; `z` is the base58btc multibase flag.

use serde::{Deserialize, Serialize};

/// Multicodec header for an Ed25519 public key.
const ED25519_MULTICODEC: [u8; 2] = [0xed, 0x01];

/// Expected decoded length: 2-byte header + 32-byte key.
const DECODED_LEN: usize = 34;

/// DID parsing/validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DidError {
    /// Not a `did:key:` identifier.
    #[error("not a did:key identifier: {0}")]
    InvalidPrefix(String),
    /// Missing the `z` base58btc multibase flag.
    #[error("did:key is not base58btc multibase encoded")]
    InvalidMultibase,
    /// The base58 payload did not decode.
    #[error("did:key payload is not valid base58")]
    InvalidEncoding,
    /// Decoded payload has the wrong length.
    #[error("did:key payload has length {0}, expected {DECODED_LEN}")]
    InvalidLength(usize),
    /// Multicodec header is not Ed25519.
    #[error("did:key multicodec header is not ed25519")]
    InvalidCodec,
}

impl DidError {
    /// Stable error code for user-visible failures.
    pub fn code(&self) -> &'static str {
        "INVALID_DID"
    }
}

/// Encode an Ed25519 public key as a `did:key` identifier.
pub fn public_key_to_did(public_key: &[u8; 32]) -> String {
    let mut payload = Vec::with_capacity(DECODED_LEN);
    payload.extend_from_slice(&ED25519_MULTICODEC);
    payload.extend_from_slice(public_key);
    format!("did:key:z{}", bs58::encode(payload).into_string())
}

/// Decode a `did:key` identifier back to the 32-byte Ed25519 public key.
pub fn did_to_public_key(did: &str) -> Result<[u8; 32], DidError> {
    let rest = did
        .strip_prefix("did:key:")
        .ok_or_else(|| DidError::InvalidPrefix(did.to_string()))?;
    let encoded = rest.strip_prefix('z').ok_or(DidError::InvalidMultibase)?;
    let decoded = bs58::decode(encoded)
        .into_vec()
        .map_err(|_| DidError::InvalidEncoding)?;
    if decoded.len() != DECODED_LEN {
        return Err(DidError::InvalidLength(decoded.len()));
    }
    if decoded[..2] != ED25519_MULTICODEC {
        return Err(DidError::InvalidCodec);
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&decoded[2..]);
    Ok(key)
}

/// Validate a `did:key` identifier without returning the key.
pub fn validate_did(did: &str) -> Result<(), DidError> {
    did_to_public_key(did).map(|_| ())
}

/// W3C DID Document for a `did:key` identity, rendered to `did.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DidDocument {
    /// JSON-LD context.
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    /// The DID itself.
    pub id: String,
    /// Verification methods (a single Ed25519 key).
    #[serde(rename = "verificationMethod")]
    pub verification_method: Vec<VerificationMethod>,
    /// Authentication key references.
    pub authentication: Vec<String>,
    /// Assertion key references.
    #[serde(rename = "assertionMethod")]
    pub assertion_method: Vec<String>,
}

/// A single verification method entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationMethod {
    /// Key identifier (`<did>#<fragment>`).
    pub id: String,
    /// Verification method type.
    #[serde(rename = "type")]
    pub method_type: String,
    /// Controller DID.
    pub controller: String,
    /// Multibase-encoded public key.
    #[serde(rename = "publicKeyMultibase")]
    pub public_key_multibase: String,
}

impl DidDocument {
    /// Build the document for a public key.
    pub fn for_public_key(public_key: &[u8; 32]) -> Self {
        let did = public_key_to_did(public_key);
        let fragment = did
            .rsplit(':')
            .next()
            .unwrap_or_default()
            .to_string();
        let key_id = format!("{did}#{fragment}");
        Self {
            context: vec![
                "https://www.w3.org/ns/did/v1".to_string(),
                "https://w3id.org/security/suites/ed25519-2020/v1".to_string(),
            ],
            id: did.clone(),
            verification_method: vec![VerificationMethod {
                id: key_id.clone(),
                method_type: "Ed25519VerificationKey2020".to_string(),
                controller: did,
                public_key_multibase: fragment,
            }],
            authentication: vec![key_id.clone()],
            assertion_method: vec![key_id],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn known_prefix_shape() {
        let did = public_key_to_did(&[7u8; 32]);
        assert!(did.starts_with("did:key:z"));
        assert!(validate_did(&did).is_ok());
    }

    #[test]
    fn rejects_wrong_prefix_and_codec() {
        assert!(matches!(
            did_to_public_key("did:web:example.com"),
            Err(DidError::InvalidPrefix(_))
        ));
        assert!(matches!(
            did_to_public_key("did:key:abc"),
            Err(DidError::InvalidMultibase)
        ));

        // Valid base58 payload with a non-ed25519 header.
        let mut payload = vec![0xec, 0x01];
        payload.extend_from_slice(&[1u8; 32]);
        let bogus = format!("did:key:z{}", bs58::encode(payload).into_string());
        assert_eq!(did_to_public_key(&bogus), Err(DidError::InvalidCodec));
    }

    #[test]
    fn rejects_truncated_payload() {
        let mut payload = vec![0xed, 0x01];
        payload.extend_from_slice(&[1u8; 16]);
        let short = format!("did:key:z{}", bs58::encode(payload).into_string());
        assert_eq!(did_to_public_key(&short), Err(DidError::InvalidLength(18)));
    }

    #[test]
    fn did_document_references_own_key() {
        let doc = DidDocument::for_public_key(&[9u8; 32]);
        assert_eq!(doc.verification_method.len(), 1);
        assert_eq!(doc.verification_method[0].controller, doc.id);
        assert_eq!(doc.authentication, doc.assertion_method);
    }

    proptest! {
        #[test]
        fn roundtrip(pk in any::<[u8; 32]>()) {
            let did = public_key_to_did(&pk);
            prop_assert_eq!(did_to_public_key(&did).unwrap(), pk);
        }
    }
}
