//! Identity & signing
//!
//! Machine-bound key vault, Ed25519 detached signatures, and the `did:key`
//! identity derived from the signing public key.

mod did;
mod machine;
mod signer;
mod vault;

pub use did::{did_to_public_key, public_key_to_did, validate_did, DidDocument, DidError};
pub use machine::resolve_machine_id;
pub use signer::{verify_detached, verify_with_did, Signer, SignerError};
pub use vault::{derive_master_key, KeyVault, VaultError, KDF_VERSION_MACHINE};
