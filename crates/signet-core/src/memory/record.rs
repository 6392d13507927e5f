//! Memory records
//!
//! The central `Memory` entity plus the input/patch/history shapes that
//! travel through the store's write API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// MEMORY TYPES
// ============================================================================

/// Classification of a memory row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryType {
    /// A discrete fact.
    #[default]
    Fact,
    /// A user or agent preference.
    Preference,
    /// A decision that was taken.
    Decision,
    /// The rationale behind a decision.
    Rationale,
    /// A daily log entry.
    DailyLog,
    /// An event or experience.
    Episodic,
    /// How-to knowledge.
    Procedural,
    /// Consolidated general knowledge.
    Semantic,
    /// System/bookkeeping memory.
    System,
    /// A recognized recurring pattern.
    Pattern,
}

impl MemoryType {
    /// String form as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Fact => "fact",
            MemoryType::Preference => "preference",
            MemoryType::Decision => "decision",
            MemoryType::Rationale => "rationale",
            MemoryType::DailyLog => "daily-log",
            MemoryType::Episodic => "episodic",
            MemoryType::Procedural => "procedural",
            MemoryType::Semantic => "semantic",
            MemoryType::System => "system",
            MemoryType::Pattern => "pattern",
        }
    }

    /// Parse from the stored string; unknown values map to `Fact`.
    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "fact" => MemoryType::Fact,
            "preference" => MemoryType::Preference,
            "decision" => MemoryType::Decision,
            "rationale" => MemoryType::Rationale,
            "daily-log" => MemoryType::DailyLog,
            "episodic" => MemoryType::Episodic,
            "procedural" => MemoryType::Procedural,
            "semantic" => MemoryType::Semantic,
            "system" => MemoryType::System,
            "pattern" => MemoryType::Pattern,
            _ => MemoryType::Fact,
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// MEMORY
// ============================================================================

/// A memory row.
///
/// `content_hash` is BLAKE2b-256 over the normalized content and is unique
/// among non-deleted rows; `signature`, when present, is a detached Ed25519
/// signature over `content` by `signer_did`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    /// Unique identifier (UUID v4).
    pub id: String,
    /// Deduplication key: BLAKE2b-256 hex of the normalized content.
    pub content_hash: String,
    /// Full text.
    pub content: String,
    /// Whitespace-collapsed, lowercased key the hash was computed over.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized_content: Option<String>,
    /// Classification.
    pub memory_type: MemoryType,
    /// Optional category label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Tags (stored comma-separated).
    pub tags: Vec<String>,

    // ========== Provenance ==========
    /// Kind of source that produced this memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    /// Identifier within the source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    /// Principal that authored or observed the content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub who: Option<String>,
    /// Detached Ed25519 signature over `content`, base64.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// DID of the signing key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer_did: Option<String>,

    // ========== Quality ==========
    /// Confidence in the content, 0..=1.
    pub confidence: f64,
    /// Importance weighting, 0..=1.
    pub importance: f64,
    /// Pinned rows never decay.
    pub pinned: bool,

    // ========== Temporal ==========
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Last read access.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<DateTime<Utc>>,
    /// Last explicit rehearsal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_rehearsed: Option<DateTime<Utc>>,
    /// Number of rehearsals.
    pub rehearsal_count: i64,
    /// Number of accesses.
    pub access_count: i64,
    /// Current decayed strength, 0..=1.
    pub strength: f64,

    // ========== Lifecycle ==========
    /// Soft-deletion flag.
    pub is_deleted: bool,
    /// When the row was soft-deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Input for inserting a new memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryInput {
    /// The content text (must be non-empty).
    pub content: String,
    /// Classification.
    pub memory_type: MemoryType,
    /// Optional category.
    pub category: Option<String>,
    /// Tags.
    pub tags: Vec<String>,
    /// Source kind.
    pub source_type: Option<String>,
    /// Source identifier.
    pub source_id: Option<String>,
    /// Authoring principal.
    pub who: Option<String>,
    /// Confidence, 0..=1.
    pub confidence: Option<f64>,
    /// Importance, 0..=1.
    pub importance: Option<f64>,
    /// Pin against decay.
    pub pinned: bool,
    /// Sign the content with the daemon's key.
    pub sign: bool,
    /// Pre-computed embedding vector; absent vectors queue an embedding job.
    pub embedding: Option<Vec<f32>>,
}

/// Partial update for an existing memory. `None` fields are untouched.
#[derive(Debug, Clone, Default)]
pub struct MemoryPatch {
    /// Replacement content (re-hashes and re-signs).
    pub content: Option<String>,
    /// Replacement classification.
    pub memory_type: Option<MemoryType>,
    /// Replacement category.
    pub category: Option<Option<String>>,
    /// Replacement tags.
    pub tags: Option<Vec<String>>,
    /// Replacement confidence.
    pub confidence: Option<f64>,
    /// Replacement importance.
    pub importance: Option<f64>,
    /// Replacement pin state.
    pub pinned: Option<bool>,
}

/// Outcome of an insert: either a fresh row or the surviving duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertOutcome {
    /// Row id (existing id when `duplicate` is set).
    pub id: String,
    /// True when a live row with the same content hash already existed.
    pub duplicate: bool,
}

// ============================================================================
// HISTORY
// ============================================================================

/// Audit event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryEvent {
    /// Row created.
    Created,
    /// Row content or metadata updated.
    Updated,
    /// Row soft-deleted.
    Deleted,
    /// Row recovered from soft-delete.
    Recovered,
    /// Row merged into another.
    Merged,
    /// Row split from another.
    Split,
    /// Placeholder event.
    None,
}

impl HistoryEvent {
    /// Stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryEvent::Created => "created",
            HistoryEvent::Updated => "updated",
            HistoryEvent::Deleted => "deleted",
            HistoryEvent::Recovered => "recovered",
            HistoryEvent::Merged => "merged",
            HistoryEvent::Split => "split",
            HistoryEvent::None => "none",
        }
    }

    /// Parse from the stored string.
    pub fn parse_name(s: &str) -> Self {
        match s {
            "created" => HistoryEvent::Created,
            "updated" => HistoryEvent::Updated,
            "deleted" => HistoryEvent::Deleted,
            "recovered" => HistoryEvent::Recovered,
            "merged" => HistoryEvent::Merged,
            "split" => HistoryEvent::Split,
            _ => HistoryEvent::None,
        }
    }
}

/// One append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Row id.
    pub id: i64,
    /// Memory the event refers to.
    pub memory_id: String,
    /// Event kind.
    pub event: HistoryEvent,
    /// Content before the event.
    pub old_content: Option<String>,
    /// Content after the event.
    pub new_content: Option<String>,
    /// Principal that made the change.
    pub changed_by: Option<String>,
    /// Free-form reason.
    pub reason: Option<String>,
    /// Session correlation id.
    pub session_id: Option<String>,
    /// Request correlation id.
    pub request_id: Option<String>,
    /// Kind of actor (human, agent, system).
    pub actor_type: Option<String>,
    /// Event time.
    pub created_at: DateTime<Utc>,
}

/// Who/why context attached to a mutation, copied into history rows.
#[derive(Debug, Clone, Default)]
pub struct ChangeContext {
    /// Principal making the change.
    pub changed_by: Option<String>,
    /// Free-form reason.
    pub reason: Option<String>,
    /// Session correlation id.
    pub session_id: Option<String>,
    /// Request correlation id.
    pub request_id: Option<String>,
    /// Kind of actor.
    pub actor_type: Option<String>,
}

// ============================================================================
// FILTERS
// ============================================================================

/// Row filter shared by `Store::list` and the search engine.
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    /// Restrict to one classification.
    pub memory_type: Option<MemoryType>,
    /// Restrict to one category.
    pub category: Option<String>,
    /// All of these tags must be present.
    pub tags: Vec<String>,
    /// Restrict to one authoring principal.
    pub who: Option<String>,
    /// Restrict by pin state.
    pub pinned: Option<bool>,
    /// Minimum importance (inclusive).
    pub importance_min: Option<f64>,
    /// Created strictly after this instant.
    pub created_since: Option<DateTime<Utc>>,
    /// Include soft-deleted rows.
    pub include_deleted: bool,
    /// Row cap.
    pub limit: Option<usize>,
}

// ============================================================================
// EMBEDDINGS & MERKLE SNAPSHOTS
// ============================================================================

/// Stored embedding vector, one per content hash.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    /// Row id.
    pub id: String,
    /// Content hash the vector belongs to.
    pub content_hash: String,
    /// Vector dimensionality.
    pub dimensions: usize,
    /// The vector itself.
    pub vector: Vec<f32>,
    /// Back-reference source kind.
    pub source_type: Option<String>,
    /// Back-reference source id.
    pub source_id: Option<String>,
    /// When the vector was stored.
    pub created_at: DateTime<Utc>,
}

/// Persisted Merkle snapshot over the live memory set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleRootRecord {
    /// Row id.
    pub id: String,
    /// Root hash, hex.
    pub root_hash: String,
    /// Number of committed leaves.
    pub memory_count: i64,
    /// Leaf hashes, retained for small trees.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leaf_hashes: Option<Vec<String>>,
    /// When the root was computed.
    pub computed_at: DateTime<Utc>,
    /// Detached signature over the root hash by the daemon's DID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// DID that signed the root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer_did: Option<String>,
    /// Chain the root was anchored on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_chain: Option<String>,
    /// Anchoring transaction id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_tx: Option<String>,
    /// Anchoring block reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_block: Option<String>,
    /// When the anchor landed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_timestamp: Option<DateTime<Utc>>,
}
