//! Wire framing
//!
//! Every frame is UTF-8 JSON: `{type, payload, timestamp, signature,
//! sender_did}`. The signable bytes are the canonical JSON of
//! `{type, payload, timestamp}` — serialized from a fixed struct so the key
//! order (`type`, `payload`, `timestamp`) and the absence of whitespace are
//! deterministic. Signatures are standard-alphabet base64 Ed25519.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use signet_core::identity::{validate_did, verify_with_did, Signer};
use signet_core::memory::MemoryType;

/// Frames outside `now ± 5 min` are rejected as replay-window violations.
pub const REPLAY_WINDOW_SECS: i64 = 300;

/// Frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    /// Initiator's opening frame.
    #[serde(rename = "HANDSHAKE")]
    Handshake,
    /// Responder's answer, proving key custody.
    #[serde(rename = "HANDSHAKE_ACK")]
    HandshakeAck,
    /// Pull request for publishable memories.
    #[serde(rename = "SYNC_REQUEST")]
    SyncRequest,
    /// Reply carrying memories.
    #[serde(rename = "SYNC_RESPONSE")]
    SyncResponse,
    /// Single-memory push.
    #[serde(rename = "MEMORY_PUSH")]
    MemoryPush,
    /// Acknowledgement for a push.
    #[serde(rename = "MEMORY_ACK")]
    MemoryAck,
    /// Keepalive (also carries the initiator's counter-challenge response).
    #[serde(rename = "PING")]
    Ping,
    /// Keepalive reply.
    #[serde(rename = "PONG")]
    Pong,
    /// Protocol error report.
    #[serde(rename = "ERROR")]
    Error,
}

/// Frame validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Not parseable as a frame, or a payload of the wrong shape.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    /// `sender_did` is not a DID.
    #[error("sender is not a did")]
    InvalidDid,
    /// Signature missing or failing verification.
    #[error("frame signature invalid")]
    BadSignature,
    /// Timestamp outside the replay window.
    #[error("frame timestamp outside the replay window")]
    ReplayWindow,
}

impl FrameError {
    /// Stable error code, also used on the wire in ERROR payloads.
    pub fn code(&self) -> &'static str {
        match self {
            FrameError::MalformedFrame(_) => "MALFORMED_FRAME",
            FrameError::InvalidDid => "INVALID_DID",
            FrameError::BadSignature => "BAD_SIGNATURE",
            FrameError::ReplayWindow => "REPLAY_WINDOW",
        }
    }

    /// Authentication-related failures close the connection (1008); the
    /// rest are answered with an ERROR frame on an open socket.
    pub fn closes_connection(&self) -> bool {
        matches!(self, FrameError::BadSignature | FrameError::InvalidDid)
    }
}

/// Signable subset, serialized in declaration order.
#[derive(Serialize)]
struct SignableFrame<'a> {
    #[serde(rename = "type")]
    frame_type: FrameType,
    payload: &'a Value,
    timestamp: &'a DateTime<Utc>,
}

/// A signed wire frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Frame kind.
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    /// Frame-specific payload.
    pub payload: Value,
    /// Sender clock at send time.
    pub timestamp: DateTime<Utc>,
    /// Base64 Ed25519 signature over the signable bytes.
    pub signature: String,
    /// The sender's DID; the verification key is derived from it.
    pub sender_did: String,
}

impl Frame {
    /// Canonical signable bytes for a (type, payload, timestamp) triple.
    pub fn signable_bytes(
        frame_type: FrameType,
        payload: &Value,
        timestamp: &DateTime<Utc>,
    ) -> Vec<u8> {
        serde_json::to_vec(&SignableFrame {
            frame_type,
            payload,
            timestamp,
        })
        .expect("signable frame serialization is infallible")
    }

    /// Build and sign a frame with the local key.
    pub fn build(frame_type: FrameType, payload: Value, signer: &Signer) -> Self {
        let timestamp = Utc::now();
        let signature = signer.sign(&Self::signable_bytes(frame_type, &payload, &timestamp));
        Self {
            frame_type,
            payload,
            timestamp,
            signature,
            sender_did: signer.did().to_string(),
        }
    }

    /// Parse a frame from wire text.
    pub fn decode(raw: &str) -> Result<Self, FrameError> {
        serde_json::from_str(raw).map_err(|e| FrameError::MalformedFrame(e.to_string()))
    }

    /// Serialize for the wire.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("frame serialization is infallible")
    }

    /// Validate a received frame: signature present, DID shape, replay
    /// window, and signature verification against the DID-derived key.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), FrameError> {
        if self.signature.is_empty() {
            return Err(FrameError::BadSignature);
        }
        if !self.sender_did.starts_with("did:") {
            return Err(FrameError::InvalidDid);
        }
        let age = (now - self.timestamp).num_seconds().abs();
        if age > REPLAY_WINDOW_SECS {
            return Err(FrameError::ReplayWindow);
        }
        validate_did(&self.sender_did).map_err(|_| FrameError::InvalidDid)?;

        let signable = Self::signable_bytes(self.frame_type, &self.payload, &self.timestamp);
        verify_with_did(&self.sender_did, &signable, &self.signature)
            .map_err(|_| FrameError::BadSignature)
    }

    /// Decode the payload into a typed shape.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, FrameError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| FrameError::MalformedFrame(e.to_string()))
    }
}

// ============================================================================
// PAYLOADS
// ============================================================================

/// HANDSHAKE payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakePayload {
    /// Advertised DID (must match `sender_did`).
    pub did: String,
    /// Advertised base64 public key (must match the DID).
    pub public_key: String,
    /// 32 random bytes, hex; the responder must sign these.
    pub challenge: String,
    /// Optional display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Optional chain address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_address: Option<String>,
}

/// HANDSHAKE_ACK payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeAckPayload {
    /// Responder's DID.
    pub did: String,
    /// Responder's base64 public key.
    pub public_key: String,
    /// Signature over the initiator's challenge, proving key custody.
    pub challenge_response: String,
    /// Responder's own challenge for the initiator.
    pub counter_challenge: String,
    /// Optional display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Optional chain address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_address: Option<String>,
}

/// PING payload. The first ping from an initiator carries the
/// counter-challenge response that completes mutual authentication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingPayload {
    /// Signature over the responder's counter-challenge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counter_response: Option<String>,
}

/// SYNC_REQUEST payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncRequestPayload {
    /// Only memories created strictly after this instant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    /// Type whitelist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<MemoryType>>,
    /// Row cap (default 100).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// A memory as it travels between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMemory {
    /// Sender-side row id (informational only).
    pub id: String,
    /// Content text.
    pub content: String,
    /// Classification.
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    /// Tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Importance.
    pub importance: f64,
    /// Sender-side creation time.
    pub created_at: DateTime<Utc>,
    /// Detached signature over `content`, if the row was signed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// DID of the content signer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer_did: Option<String>,
}

impl WireMemory {
    /// Project a store row onto the wire shape.
    pub fn from_memory(memory: &signet_core::Memory) -> Self {
        Self {
            id: memory.id.clone(),
            content: memory.content.clone(),
            memory_type: memory.memory_type,
            tags: memory.tags.clone(),
            importance: memory.importance,
            created_at: memory.created_at,
            signature: memory.signature.clone(),
            signer_did: memory.signer_did.clone(),
        }
    }
}

/// SYNC_RESPONSE payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponsePayload {
    /// Shipped memories.
    pub memories: Vec<WireMemory>,
    /// Whether more rows matched beyond `limit`.
    pub has_more: bool,
    /// Responder clock at sync time.
    pub synced_at: DateTime<Utc>,
}

/// MEMORY_PUSH payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPushPayload {
    /// The pushed memory.
    pub memory: WireMemory,
}

/// MEMORY_ACK payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryAckPayload {
    /// Id echoed from the push.
    pub memory_id: String,
    /// Whether the memory was durably recorded.
    pub accepted: bool,
    /// Rejection reason, when not accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// ERROR payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Stable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl ErrorPayload {
    /// Build an ERROR frame payload.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Value {
        serde_json::to_value(Self {
            code: code.into(),
            message: message.into(),
        })
        .expect("error payload serialization is infallible")
    }
}

/// Generate a 32-byte hex challenge.
pub fn generate_challenge() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}
