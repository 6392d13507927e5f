//! External capabilities
//!
//! The daemon consumes three outside services through narrow traits: an
//! embedder that turns text into fixed-length vectors, a judge that assesses
//! contradictions, and a chain that anchors Merkle roots. All of them being
//! offline is degradation, not failure; callers fall back per operation.

use serde::{Deserialize, Serialize};

use crate::memory::ContradictionResolution;

/// Capability failure. `Unavailable` is the expected steady-state error for
/// an offline provider and is always retryable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CapabilityError {
    /// The provider is offline or unreachable.
    #[error("capability unavailable: {0}")]
    Unavailable(String),
    /// The provider answered with something unusable.
    #[error("capability returned invalid data: {0}")]
    InvalidResponse(String),
}

impl CapabilityError {
    /// Stable error code for user-visible failures.
    pub fn code(&self) -> &'static str {
        match self {
            CapabilityError::Unavailable(_) => "UNAVAILABLE",
            CapabilityError::InvalidResponse(_) => "INVALID_RESPONSE",
        }
    }

    /// Whether retrying the operation can help.
    pub fn retryable(&self) -> bool {
        matches!(self, CapabilityError::Unavailable(_))
    }
}

/// Produces fixed-length dense vectors for text.
pub trait Embedder: Send + Sync {
    /// Vector dimensionality this embedder produces.
    fn dimensions(&self) -> usize;

    /// Embed one text.
    fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError>;
}

/// Verdict from the contradiction judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum JudgeVerdict {
    /// The two contents do not conflict.
    NoConflict,
    /// The contents conflict; the judge proposes a resolution.
    Contradiction {
        /// Proposed resolution.
        resolution: ContradictionResolution,
        /// Judge reasoning.
        reasoning: String,
    },
}

/// Assesses whether new content contradicts existing content.
pub trait Judge: Send + Sync {
    /// Compare new content against an existing memory's content.
    fn assess(&self, new_content: &str, old_content: &str)
        -> Result<JudgeVerdict, CapabilityError>;
}

/// Receipt returned by a chain anchor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorReceipt {
    /// Chain identifier.
    pub chain: String,
    /// Transaction id.
    pub tx_id: String,
    /// Block reference, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<String>,
}

/// Anchors a Merkle root on an external chain.
pub trait Chain: Send + Sync {
    /// Anchor a root hash; returns the transaction receipt.
    fn anchor(&self, root_hash: &str) -> Result<AnchorReceipt, CapabilityError>;
}
