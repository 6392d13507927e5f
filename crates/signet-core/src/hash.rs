//! Content hashing
//!
//! BLAKE2b-256 over normalized content is the deduplication key for the
//! whole store, and the same primitive (with domain-separated prefixes)
//! feeds the Merkle layer.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use unicode_normalization::UnicodeNormalization;

/// BLAKE2b with a 32-byte output.
pub type Blake2b256 = Blake2b<U32>;

/// Prefix for Merkle leaf hashes.
pub const LEAF_PREFIX: u8 = 0x00;

/// Prefix for Merkle internal node hashes.
pub const NODE_PREFIX: u8 = 0x01;

/// Domain string mixed into the vault master key derivation.
pub const SECRETS_DOMAIN: &[u8] = b"signet:secrets:";

/// A 32-byte BLAKE2b-256 digest.
pub type Digest32 = [u8; 32];

/// Normalize content for hashing: NFC, trim, collapse whitespace runs to a
/// single space, lowercase.
///
/// Two strings that differ only in case or whitespace runs normalize to the
/// same bytes and therefore share a content hash.
pub fn normalize_content(content: &str) -> String {
    let nfc: String = content.nfc().collect();
    let collapsed = nfc
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    collapsed.to_lowercase()
}

/// BLAKE2b-256 of arbitrary bytes.
pub fn blake2b_256(bytes: &[u8]) -> Digest32 {
    let mut hasher = Blake2b256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Content hash: BLAKE2b-256 hex of the normalized content string.
pub fn content_hash(content: &str) -> String {
    hex::encode(blake2b_256(normalize_content(content).as_bytes()))
}

/// Hash a Merkle leaf: `BLAKE2b-256(0x00 ‖ bytes)`.
///
/// The prefix keeps leaves and internal nodes in separate hash domains so a
/// leaf can never be confused with a node preimage.
pub fn hash_leaf(bytes: &[u8]) -> Digest32 {
    let mut hasher = Blake2b256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Hash a Merkle internal node: `BLAKE2b-256(0x01 ‖ left ‖ right)`.
pub fn hash_node(left: &Digest32, right: &Digest32) -> Digest32 {
    let mut hasher = Blake2b256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Canonical root of an empty tree: `BLAKE2b-256("")`.
pub fn empty_root() -> Digest32 {
    blake2b_256(b"")
}
