//! Provenance
//!
//! Periodic Merkle commitments over the live memory set, with optional DID
//! signatures and chain anchoring through the external `Chain` capability.

use chrono::Utc;
use uuid::Uuid;

use crate::capabilities::Chain;
use crate::hash::Digest32;
use crate::identity::Signer;
use crate::memory::MerkleRootRecord;
use crate::merkle::{InclusionProof, MerkleTree};
use crate::storage::{Result, Store, StoreError};

/// Leaf hashes are retained on the row only for trees up to this size.
pub const LEAF_RETENTION_MAX: usize = 1000;

fn decode_leaf(hash_hex: &str) -> Result<Vec<u8>> {
    hex::decode(hash_hex)
        .map_err(|_| StoreError::InvalidInput(format!("malformed content hash: {hash_hex}")))
}

/// Build the Merkle tree over the live memory set.
///
/// Leaves are the raw bytes of each content hash, in ascending hex order —
/// the canonical ordering every node computes identically.
pub fn build_memory_tree(store: &Store) -> Result<(MerkleTree, Vec<String>)> {
    let hashes = store.live_content_hashes()?;
    let leaves = hashes
        .iter()
        .map(|h| decode_leaf(h))
        .collect::<Result<Vec<_>>>()?;
    Ok((MerkleTree::build(&leaves), hashes))
}

/// Compute and persist a Merkle root snapshot, optionally signed by the
/// daemon's DID key.
pub fn compute_memory_root(
    store: &Store,
    signer: Option<&Signer>,
) -> Result<MerkleRootRecord> {
    let (tree, hashes) = build_memory_tree(store)?;
    let root_hex = hex::encode(tree.root());

    let (signature, signer_did) = match signer {
        Some(signer) => (
            Some(signer.sign(root_hex.as_bytes())),
            Some(signer.did().to_string()),
        ),
        None => (None, None),
    };

    let record = MerkleRootRecord {
        id: Uuid::new_v4().to_string(),
        root_hash: root_hex,
        memory_count: hashes.len() as i64,
        leaf_hashes: (hashes.len() <= LEAF_RETENTION_MAX).then_some(hashes),
        computed_at: Utc::now(),
        signature,
        signer_did,
        anchor_chain: None,
        anchor_tx: None,
        anchor_block: None,
        anchor_timestamp: None,
    };
    store.insert_merkle_root(&record)?;
    tracing::info!(
        root = %record.root_hash,
        leaves = record.memory_count,
        "merkle root computed"
    );
    Ok(record)
}

/// Inclusion proof for a live memory's content hash against the current
/// tree. Returns the proof plus the root it verifies under, or `None` when
/// the hash is not in the live set.
pub fn inclusion_proof(
    store: &Store,
    content_hash: &str,
) -> Result<Option<(InclusionProof, Digest32)>> {
    let (tree, hashes) = build_memory_tree(store)?;
    let Some(index) = hashes.iter().position(|h| h == content_hash) else {
        return Ok(None);
    };
    Ok(tree.prove(index).map(|proof| (proof, tree.root())))
}

/// Anchor the latest root through the external chain capability.
///
/// A chain outage is degradation: the root row stays unanchored and the
/// error is surfaced to the caller for retry.
pub fn anchor_latest_root(
    store: &Store,
    chain: &dyn Chain,
) -> Result<Option<MerkleRootRecord>> {
    let Some(record) = store.latest_merkle_root()? else {
        return Ok(None);
    };
    if record.anchor_tx.is_some() {
        return Ok(Some(record));
    }

    match chain.anchor(&record.root_hash) {
        Ok(receipt) => {
            store.record_anchor(
                &record.id,
                &receipt.chain,
                &receipt.tx_id,
                receipt.block.as_deref(),
            )?;
            store.latest_merkle_root()
        }
        Err(e) => {
            tracing::warn!("chain anchor unavailable: {e}");
            Ok(Some(record))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{AnchorReceipt, CapabilityError};
    use crate::memory::{ChangeContext, MemoryInput};
    use crate::merkle::verify_proof;
    use tempfile::TempDir;

    fn seeded_store(contents: &[&str]) -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("memories.db")).unwrap();
        for content in contents {
            store
                .insert_memory(
                    &MemoryInput {
                        content: content.to_string(),
                        ..Default::default()
                    },
                    &ChangeContext::default(),
                    None,
                )
                .unwrap();
        }
        (store, dir)
    }

    #[test]
    fn root_is_stable_and_excludes_deleted() {
        let (store, _dir) = seeded_store(&["one", "two", "three"]);
        let first = compute_memory_root(&store, None).unwrap();
        let second = compute_memory_root(&store, None).unwrap();
        assert_eq!(first.root_hash, second.root_hash);
        assert_eq!(first.memory_count, 3);

        // Soft-deleting a row changes the commitment.
        let victim = store
            .list(&crate::memory::MemoryFilter::default())
            .unwrap()
            .pop()
            .unwrap();
        store
            .soft_delete(&victim.id, "drop", &ChangeContext::default())
            .unwrap();
        let third = compute_memory_root(&store, None).unwrap();
        assert_ne!(third.root_hash, first.root_hash);
        assert_eq!(third.memory_count, 2);
    }

    #[test]
    fn signed_root_verifies() {
        let (store, _dir) = seeded_store(&["signed root"]);
        let signer = Signer::from_bytes(&[5u8; 32]);
        let record = compute_memory_root(&store, Some(&signer)).unwrap();
        let signature = record.signature.unwrap();
        assert!(crate::identity::verify_with_did(
            signer.did(),
            record.root_hash.as_bytes(),
            &signature
        )
        .is_ok());
    }

    #[test]
    fn inclusion_proofs_verify_against_root() {
        let (store, _dir) = seeded_store(&["alpha", "beta", "gamma"]);
        let memory = store
            .list(&crate::memory::MemoryFilter::default())
            .unwrap()
            .pop()
            .unwrap();

        let (proof, root) = inclusion_proof(&store, &memory.content_hash)
            .unwrap()
            .unwrap();
        let leaf = hex::decode(&memory.content_hash).unwrap();
        assert!(verify_proof(&leaf, &proof, &root));

        assert!(inclusion_proof(&store, &"00".repeat(32)).unwrap().is_none());
    }

    #[test]
    fn empty_store_commits_to_empty_root() {
        let (store, _dir) = seeded_store(&[]);
        let record = compute_memory_root(&store, None).unwrap();
        assert_eq!(record.memory_count, 0);
        assert_eq!(record.root_hash, hex::encode(crate::hash::empty_root()));
    }

    struct FakeChain;
    impl Chain for FakeChain {
        fn anchor(&self, _root: &str) -> std::result::Result<AnchorReceipt, CapabilityError> {
            Ok(AnchorReceipt {
                chain: "testchain".to_string(),
                tx_id: "0xabc".to_string(),
                block: Some("42".to_string()),
            })
        }
    }

    struct DownChain;
    impl Chain for DownChain {
        fn anchor(&self, _root: &str) -> std::result::Result<AnchorReceipt, CapabilityError> {
            Err(CapabilityError::Unavailable("rpc down".to_string()))
        }
    }

    #[test]
    fn anchoring_records_receipt_and_degrades() {
        let (store, _dir) = seeded_store(&["anchored"]);
        compute_memory_root(&store, None).unwrap();

        // Outage leaves the row unanchored but does not fail.
        let unanchored = anchor_latest_root(&store, &DownChain).unwrap().unwrap();
        assert!(unanchored.anchor_tx.is_none());

        let anchored = anchor_latest_root(&store, &FakeChain).unwrap().unwrap();
        assert_eq!(anchored.anchor_chain.as_deref(), Some("testchain"));
        assert_eq!(anchored.anchor_tx.as_deref(), Some("0xabc"));

        // Already-anchored roots are left alone.
        let again = anchor_latest_root(&store, &DownChain).unwrap().unwrap();
        assert_eq!(again.anchor_tx.as_deref(), Some("0xabc"));
    }
}
