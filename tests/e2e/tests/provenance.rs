//! Merkle provenance end-to-end: roots over the live memory set, inclusion
//! proofs, and the odd-promotion commitment semantics.

use signet_core::memory::ChangeContext;
use signet_core::merkle::{verify_proof, MerkleTree};
use signet_core::{compute_memory_root, inclusion_proof};
use signet_e2e::{MemorySpec, TestNode};

#[test]
fn odd_leaf_promotion_proof() {
    // Three leaves: h3 is promoted at layer 0, so its proof has a single
    // step (the pair hash of h1 and h2).
    let leaves: Vec<Vec<u8>> = ["h1", "h2", "h3"]
        .iter()
        .map(|l| l.as_bytes().to_vec())
        .collect();
    let tree = MerkleTree::build(&leaves);
    let proof = tree.prove(2).unwrap();
    assert_eq!(proof.steps.len(), 1);
    assert!(verify_proof(&leaves[2], &proof, &tree.root()));

    // The duplicated-leaf tree commits to a different root, and the proof
    // does not transfer.
    let mut padded = leaves.clone();
    padded.push(leaves[2].clone());
    let padded_root = MerkleTree::build(&padded).root();
    assert_ne!(tree.root(), padded_root);
    assert!(!verify_proof(&leaves[2], &proof, &padded_root));
}

#[test]
fn memory_root_covers_live_rows_only() {
    let node = TestNode::new(20, "merkle-node");
    let ids: Vec<String> = ["alpha", "beta", "gamma"]
        .into_iter()
        .map(|content| {
            node.insert(MemorySpec {
                content,
                ..Default::default()
            })
        })
        .collect();

    let record = compute_memory_root(&node.store, Some(node.signer.as_ref())).unwrap();
    assert_eq!(record.memory_count, 3);
    assert_eq!(record.leaf_hashes.as_ref().unwrap().len(), 3);

    // The root is signed by the node's DID.
    signet_core::verify_with_did(
        node.did(),
        record.root_hash.as_bytes(),
        record.signature.as_deref().unwrap(),
    )
    .expect("root signature verifies");

    // Inclusion proof for a live row verifies against the tree.
    let memory = node.store.get(&ids[0]).unwrap().unwrap();
    let (proof, root) = inclusion_proof(&node.store, &memory.content_hash)
        .unwrap()
        .unwrap();
    let leaf = hex::decode(&memory.content_hash).unwrap();
    assert!(verify_proof(&leaf, &proof, &root));
    assert_eq!(hex::encode(root), record.root_hash);

    // Soft-deleting a row drops it from the commitment.
    node.store
        .soft_delete(&ids[1], "retracted", &ChangeContext::default())
        .unwrap();
    let after = compute_memory_root(&node.store, None).unwrap();
    assert_eq!(after.memory_count, 2);
    assert_ne!(after.root_hash, record.root_hash);

    let deleted = node.store.get(&ids[1]).unwrap().unwrap();
    assert!(inclusion_proof(&node.store, &deleted.content_hash)
        .unwrap()
        .is_none());
}

#[test]
fn roots_are_stored_latest_first() {
    let node = TestNode::new(21, "root-history-node");
    node.insert(MemorySpec {
        content: "one",
        ..Default::default()
    });
    compute_memory_root(&node.store, None).unwrap();

    node.insert(MemorySpec {
        content: "two",
        ..Default::default()
    });
    let second = compute_memory_root(&node.store, None).unwrap();

    let latest = node.store.latest_merkle_root().unwrap().unwrap();
    assert_eq!(latest.root_hash, second.root_hash);
    assert_eq!(latest.memory_count, 2);
}
