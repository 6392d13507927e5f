//! # Signet Core
//!
//! Local-first agent memory substrate:
//!
//! - **Identity**: machine-bound key vault, Ed25519 detached signatures,
//!   `did:key` identity
//! - **Memory store**: SQLite with content-hash deduplication, soft-delete,
//!   append-only history, and a migration runner
//! - **Hybrid search**: HNSW vector KNN + BM25 keyword search with score
//!   blending and filters
//! - **Temporal strength**: exponential decay with rehearsal bonuses and an
//!   importance floor
//! - **Provenance**: domain-separated Merkle commitments with inclusion
//!   proofs over the live memory set
//! - **Publish policy**: declarative rules deciding what may leave the
//!   boundary to which peers
//!
//! The federation wire protocol lives in the daemon crate; this crate owns
//! everything that touches disk.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use signet_core::{ChangeContext, MemoryInput, Store};
//!
//! let store = Store::open("memory/memories.db")?;
//! let outcome = store.insert_memory(
//!     &MemoryInput {
//!         content: "API runs on port 3000".to_string(),
//!         ..Default::default()
//!     },
//!     &ChangeContext::default(),
//!     None,
//! )?;
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod capabilities;
pub mod config;
pub mod export;
pub mod hash;
pub mod identity;
pub mod memory;
pub mod merkle;
pub mod provenance;
pub mod publish;
pub mod storage;
pub mod temporal;

#[cfg(feature = "vector-search")]
pub mod search;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Identity & signing
pub use identity::{
    did_to_public_key, public_key_to_did, validate_did, verify_detached, verify_with_did,
    DidDocument, DidError, KeyVault, Signer, SignerError, VaultError,
};

// Hashing & Merkle provenance
pub use hash::{blake2b_256, content_hash, normalize_content, Digest32};
pub use merkle::{verify_proof, InclusionProof, MerkleTree, ProofStep, SiblingPosition};
pub use provenance::{build_memory_tree, compute_memory_root, inclusion_proof};

// Memory data model
pub use memory::{
    ChangeContext, Contradiction, ContradictionResolution, Decision, EmbeddingRecord, Entity,
    EntityMention, HistoryEntry, HistoryEvent, InsertOutcome, Memory, MemoryFilter, MemoryInput,
    MemoryPatch, MemoryType, MerkleRootRecord, Peer, PublishRule, ReceivedMemory, Relation,
    ResolvedBy, SharedMemory, TrustLevel,
};

// Storage layer
pub use storage::{Store, StoreError, StoreStats};

// Temporal strength model
pub use temporal::{strength, StrengthInputs, TemporalScorer};

// Publish policy
pub use publish::PublishPolicy;

// Configuration & layout
pub use config::{AgentConfig, ConfigError, Layout};

// Export bundle
pub use export::{
    export_bundle, import_bundle, read_bundle, Bundle, BundleError, BundleMetadata, ImportReport,
    MergeStrategy,
};

// External capabilities
pub use capabilities::{AnchorReceipt, CapabilityError, Chain, Embedder, Judge, JudgeVerdict};

// Search (when feature enabled)
#[cfg(feature = "vector-search")]
pub use search::{
    sanitize_fts_query, ScoreSource, SearchEngine, SearchError, SearchOptions, SearchResult,
    VectorIndex, VectorIndexConfig, VectorIndexError,
};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage.
pub mod prelude {
    pub use crate::{
        ChangeContext, InsertOutcome, KeyVault, Memory, MemoryFilter, MemoryInput, MemoryType,
        PublishPolicy, Signer, Store, StoreError, TemporalScorer, TrustLevel,
    };

    #[cfg(feature = "vector-search")]
    pub use crate::{ScoreSource, SearchEngine, SearchOptions};
}
