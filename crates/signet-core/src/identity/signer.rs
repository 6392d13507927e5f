//! Ed25519 detached signatures
//!
//! Signatures travel as standard-alphabet base64 strings; verification can
//! bind to either a raw public key or a `did:key` identifier.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};

use super::did::{did_to_public_key, public_key_to_did, DidError};

/// Signing/verification failures.
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    /// Signature string is not valid base64 or not 64 bytes.
    #[error("malformed signature encoding")]
    MalformedSignature,
    /// Public key bytes do not form a valid Ed25519 point.
    #[error("invalid public key")]
    InvalidPublicKey,
    /// The signature does not verify over the given bytes.
    #[error("signature verification failed")]
    BadSignature,
    /// The DID could not be decoded to a public key.
    #[error(transparent)]
    Did(#[from] DidError),
}

impl SignerError {
    /// Stable error code for user-visible failures.
    pub fn code(&self) -> &'static str {
        match self {
            SignerError::MalformedSignature => "MALFORMED_SIGNATURE",
            SignerError::InvalidPublicKey => "INVALID_PUBLIC_KEY",
            SignerError::BadSignature => "BAD_SIGNATURE",
            SignerError::Did(_) => "INVALID_DID",
        }
    }
}

/// Holder of the Ed25519 signing key, producing detached signatures.
pub struct Signer {
    signing_key: SigningKey,
    did: String,
}

impl Signer {
    /// Wrap an existing signing key.
    pub fn new(signing_key: SigningKey) -> Self {
        let did = public_key_to_did(signing_key.verifying_key().as_bytes());
        Self { signing_key, did }
    }

    /// Construct from raw private key bytes.
    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self::new(SigningKey::from_bytes(secret))
    }

    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut rand::rngs::OsRng))
    }

    /// Detached signature over `message`, base64 encoded.
    pub fn sign(&self, message: &[u8]) -> String {
        BASE64.encode(self.signing_key.sign(message).to_bytes())
    }

    /// The signer's 32-byte public key.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The signer's `did:key` identifier.
    pub fn did(&self) -> &str {
        &self.did
    }

    /// Verify one of this signer's own signatures.
    pub fn verify(&self, message: &[u8], signature_b64: &str) -> Result<(), SignerError> {
        verify_detached(&self.public_key_bytes(), message, signature_b64)
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("Signer").field("did", &self.did).finish()
    }
}

/// Verify a detached base64 signature against a raw public key.
pub fn verify_detached(
    public_key: &[u8; 32],
    message: &[u8],
    signature_b64: &str,
) -> Result<(), SignerError> {
    let sig_bytes = BASE64
        .decode(signature_b64)
        .map_err(|_| SignerError::MalformedSignature)?;
    let sig_array: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|_| SignerError::MalformedSignature)?;
    let signature = Signature::from_bytes(&sig_array);
    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| SignerError::InvalidPublicKey)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| SignerError::BadSignature)
}

/// Verify a detached base64 signature against the key a DID encodes.
pub fn verify_with_did(did: &str, message: &[u8], signature_b64: &str) -> Result<(), SignerError> {
    let public_key = did_to_public_key(did)?;
    verify_detached(&public_key, message, signature_b64)
}
