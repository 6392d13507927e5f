//! Merkle tree over content hashes
//!
//! Binary hash tree with domain-separated leaf/node hashing and inclusion
//! proofs. An odd node at any layer is promoted to the next layer rather
//! than paired with a copy of itself, so `[A, B, C]` and `[A, B, C, C]`
//! commit to different roots.

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::hash::{empty_root, hash_leaf, hash_node, Digest32};

/// Which side of the running hash a proof sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SiblingPosition {
    /// Sibling is the left input of the parent hash.
    Left,
    /// Sibling is the right input of the parent hash.
    Right,
}

/// One step of an inclusion proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    /// The sibling digest at this layer.
    pub sibling: Digest32,
    /// Side the sibling occupies.
    pub position: SiblingPosition,
}

/// Inclusion proof for a single leaf.
///
/// Layers where the leaf's ancestor was promoted contribute no step, so a
/// proof can be shorter than `ceil(log2(n))`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    /// Index of the proven leaf in the original leaf set.
    pub leaf_index: usize,
    /// Sibling path from the leaf layer up to the root.
    pub steps: Vec<ProofStep>,
}

/// A built Merkle tree, retaining every layer for proof generation.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    layers: Vec<Vec<Digest32>>,
}

impl MerkleTree {
    /// Build a tree from raw leaf payloads. Each payload is hashed with the
    /// leaf prefix before pairing.
    pub fn build<L: AsRef<[u8]>>(leaves: &[L]) -> Self {
        let leaf_layer: Vec<Digest32> = leaves.iter().map(|l| hash_leaf(l.as_ref())).collect();
        Self::from_leaf_hashes(leaf_layer)
    }

    /// Build a tree from already-computed leaf digests.
    pub fn from_leaf_hashes(leaf_layer: Vec<Digest32>) -> Self {
        let mut layers = vec![leaf_layer];
        while layers.last().map(|l| l.len()).unwrap_or(0) > 1 {
            let current = layers.last().unwrap();
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            let mut i = 0;
            while i + 1 < current.len() {
                next.push(hash_node(&current[i], &current[i + 1]));
                i += 2;
            }
            if i < current.len() {
                // Odd node: promote unchanged.
                next.push(current[i]);
            }
            layers.push(next);
        }
        Self { layers }
    }

    /// Number of leaves the tree was built from.
    pub fn leaf_count(&self) -> usize {
        self.layers.first().map(|l| l.len()).unwrap_or(0)
    }

    /// Leaf digests at layer zero.
    pub fn leaf_hashes(&self) -> &[Digest32] {
        self.layers.first().map(|l| l.as_slice()).unwrap_or(&[])
    }

    /// Root digest. An empty tree commits to `BLAKE2b-256("")`.
    pub fn root(&self) -> Digest32 {
        match self.layers.last().and_then(|l| l.first()) {
            Some(root) => *root,
            None => empty_root(),
        }
    }

    /// Generate an inclusion proof for the leaf at `index`, or `None` if the
    /// index is out of range.
    pub fn prove(&self, index: usize) -> Option<InclusionProof> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut steps = Vec::new();
        let mut i = index;
        // Walk every layer below the root.
        for layer in &self.layers[..self.layers.len().saturating_sub(1)] {
            let sibling_index = i ^ 1;
            if sibling_index < layer.len() {
                steps.push(ProofStep {
                    sibling: layer[sibling_index],
                    position: if i % 2 == 0 {
                        SiblingPosition::Right
                    } else {
                        SiblingPosition::Left
                    },
                });
            }
            // Promoted nodes keep their digest and contribute no step.
            i /= 2;
        }
        Some(InclusionProof {
            leaf_index: index,
            steps,
        })
    }
}

/// Verify an inclusion proof against a root.
///
/// Applies the same domain-separated hashing bottom-up and compares the
/// result to `root` in constant time.
pub fn verify_proof(leaf: &[u8], proof: &InclusionProof, root: &Digest32) -> bool {
    let mut acc = hash_leaf(leaf);
    for step in &proof.steps {
        acc = match step.position {
            SiblingPosition::Right => hash_node(&acc, &step.sibling),
            SiblingPosition::Left => hash_node(&step.sibling, &acc),
        };
    }
    acc.ct_eq(root).into()
}
