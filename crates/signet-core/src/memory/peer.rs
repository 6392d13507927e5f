//! Federation peer records
//!
//! Peers, trust levels, publish rules, and the shared/received bookkeeping
//! tables the sync protocol writes through the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::MemoryType;

/// Local trust label for a remote peer.
///
/// Trust transitions are explicit local operations; the federation layer
/// reads this but never changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// Known but not yet trusted; may handshake and ping only.
    #[default]
    Pending,
    /// Full sync and push allowed.
    Trusted,
    /// Refused at handshake.
    Blocked,
}

impl TrustLevel {
    /// Stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Pending => "pending",
            TrustLevel::Trusted => "trusted",
            TrustLevel::Blocked => "blocked",
        }
    }

    /// Parse from the stored string; unknown values are pending.
    pub fn parse_name(s: &str) -> Self {
        match s {
            "trusted" => TrustLevel::Trusted,
            "blocked" => TrustLevel::Blocked,
            _ => TrustLevel::Pending,
        }
    }
}

/// A known remote peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    /// Row id.
    pub id: String,
    /// The peer's `did:key` identifier.
    pub did: String,
    /// Human-readable name, from the handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// WebSocket URL for dialing out, if we initiate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Base64 public key, pinned at first handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Local trust label.
    pub trust_level: TrustLevel,
    /// On-chain address advertised by the peer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_address: Option<String>,
    /// Count of memories shipped to this peer.
    pub memories_shared: i64,
    /// Count of memories received from this peer.
    pub memories_received: i64,
    /// Last completed sync.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    /// When the peer was first recorded.
    pub created_at: DateTime<Utc>,
}

/// Declarative filter deciding which memories may leave the boundary.
///
/// A rule applies to a peer when `peer_ids` is `None` (all trusted peers)
/// or contains the peer's id. `query` is a substring filter over content,
/// `tags` and `types` match any-of, `min_importance` is inclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRule {
    /// Row id.
    pub id: String,
    /// Unique rule name.
    pub name: String,
    /// Substring filter over content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Match any of these tags.
    pub tags: Vec<String>,
    /// Match any of these types.
    pub types: Vec<MemoryType>,
    /// Inclusive importance floor.
    pub min_importance: f64,
    /// Restrict to these peers; `None` means all trusted peers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_ids: Option<Vec<String>>,
    /// Run proactively on the publish heartbeat.
    pub auto_publish: bool,
    /// When the rule was created.
    pub created_at: DateTime<Utc>,
}

/// Bookkeeping row: this memory was shipped to this peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedMemory {
    /// The shipped memory.
    pub memory_id: String,
    /// The receiving peer.
    pub peer_id: String,
    /// When it was shipped.
    pub shared_at: DateTime<Utc>,
}

/// A memory received from a peer, quarantined outside the main store.
///
/// Rows here never auto-promote into `memories`; promotion is an explicit
/// operator action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMemory {
    /// Row id.
    pub id: String,
    /// The sending peer.
    pub peer_id: String,
    /// Content exactly as received.
    pub original_content: String,
    /// Sender's classification, if provided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<MemoryType>,
    /// Sender's detached signature over the content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// DID the signature claims.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer_did: Option<String>,
    /// True iff signature and signer DID were both present and verified.
    pub verified: bool,
    /// When the row arrived.
    pub received_at: DateTime<Utc>,
    /// Set when an operator promoted this row into the main store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promoted_memory_id: Option<String>,
}
