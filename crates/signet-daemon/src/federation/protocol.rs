//! Authenticated protocol handling
//!
//! Everything that runs after the handshake: sync request/response, the
//! single-memory push path, and keepalive. Trust gating happens here —
//! the handshake lets pending peers in, but only trusted peers can move
//! memories.

use std::sync::Arc;

use chrono::Utc;

use signet_core::identity::{verify_with_did, Signer};
use signet_core::memory::{Peer, TrustLevel};
use signet_core::{PublishPolicy, Store};

use super::frame::{
    ErrorPayload, Frame, FrameType, MemoryAckPayload, MemoryPushPayload, SyncRequestPayload,
    SyncResponsePayload, WireMemory,
};
use super::handshake::PeerIdentity;

/// Default row cap for a sync response.
pub const DEFAULT_SYNC_LIMIT: usize = 100;

/// Handles authenticated frames against the store.
pub struct ProtocolHandler {
    store: Arc<Store>,
    signer: Arc<Signer>,
}

impl ProtocolHandler {
    /// Handler over the shared store and signing key.
    pub fn new(store: Arc<Store>, signer: Arc<Signer>) -> Self {
        Self { store, signer }
    }

    /// Upsert the peer row for an authenticated identity and return it.
    pub fn register_peer(&self, identity: &PeerIdentity) -> Result<Peer, signet_core::StoreError> {
        self.store.upsert_peer(
            &identity.did,
            identity.display_name.as_deref(),
            None,
            Some(&identity.public_key_b64),
            identity.chain_address.as_deref(),
        )
    }

    /// Dispatch one authenticated frame; returns the reply frame, if any.
    pub fn handle(&self, peer_did: &str, frame: &Frame) -> Option<Frame> {
        match frame.frame_type {
            FrameType::Ping => Some(Frame::build(
                FrameType::Pong,
                serde_json::json!({}),
                &self.signer,
            )),
            FrameType::Pong => None,
            FrameType::SyncRequest => Some(self.handle_sync_request(peer_did, frame)),
            FrameType::MemoryPush => Some(self.handle_memory_push(peer_did, frame)),
            FrameType::SyncResponse => {
                match frame.payload_as::<SyncResponsePayload>() {
                    Ok(payload) => {
                        if let Err(e) = self.process_sync_response(peer_did, &payload) {
                            tracing::warn!(peer = peer_did, "sync response processing failed: {e}");
                        }
                    }
                    Err(e) => tracing::warn!(peer = peer_did, "malformed sync response: {e}"),
                }
                None
            }
            FrameType::MemoryAck | FrameType::Error => None,
            // Re-handshakes on an authenticated connection are ignored.
            FrameType::Handshake | FrameType::HandshakeAck => None,
        }
    }

    fn peer_for(&self, peer_did: &str) -> Option<Peer> {
        self.store.peer_by_did(peer_did).ok().flatten()
    }

    /// SYNC_REQUEST: trusted peers get publishable memories; pending peers
    /// get `NOT_TRUSTED`.
    fn handle_sync_request(&self, peer_did: &str, frame: &Frame) -> Frame {
        let payload: SyncRequestPayload = match frame.payload_as() {
            Ok(p) => p,
            Err(e) => {
                return Frame::build(
                    FrameType::Error,
                    ErrorPayload::new("MALFORMED_FRAME", e.to_string()),
                    &self.signer,
                )
            }
        };
        let Some(peer) = self.peer_for(peer_did) else {
            return Frame::build(
                FrameType::Error,
                ErrorPayload::new("UNKNOWN_PEER", "no peer row for sender"),
                &self.signer,
            );
        };
        if peer.trust_level != TrustLevel::Trusted {
            return Frame::build(
                FrameType::Error,
                ErrorPayload::new("NOT_TRUSTED", "peer is not trusted for sync"),
                &self.signer,
            );
        }

        let limit = payload.limit.unwrap_or(DEFAULT_SYNC_LIMIT).max(1);
        let selected = match PublishPolicy::select_publishable(&self.store, &peer.id) {
            Ok(memories) => memories,
            Err(e) => {
                tracing::error!(peer = %peer.did, "publish selection failed: {e}");
                return Frame::build(
                    FrameType::Error,
                    ErrorPayload::new("DB_ERROR", "selection failed"),
                    &self.signer,
                );
            }
        };

        // Apply since (strictly greater) and the type whitelist, then cap.
        let filtered: Vec<_> = selected
            .into_iter()
            .filter(|memory| match payload.since {
                Some(since) => memory.created_at > since,
                None => true,
            })
            .filter(|memory| match &payload.types {
                Some(types) => types.contains(&memory.memory_type),
                None => true,
            })
            .collect();
        let has_more = filtered.len() > limit;
        let shipped: Vec<_> = filtered.into_iter().take(limit).collect();

        let shipped_ids: Vec<String> = shipped.iter().map(|m| m.id.clone()).collect();
        if let Err(e) = self.store.record_shared(&peer.id, &shipped_ids) {
            tracing::error!(peer = %peer.did, "failed to record shared memories: {e}");
            return Frame::build(
                FrameType::Error,
                ErrorPayload::new("DB_ERROR", "bookkeeping failed"),
                &self.signer,
            );
        }

        tracing::info!(peer = %peer.did, count = shipped.len(), has_more, "sync response prepared");
        let response = SyncResponsePayload {
            memories: shipped.iter().map(WireMemory::from_memory).collect(),
            has_more,
            synced_at: Utc::now(),
        };
        Frame::build(
            FrameType::SyncResponse,
            serde_json::to_value(response).expect("sync response serializes"),
            &self.signer,
        )
    }

    /// MEMORY_PUSH: at-most-one-ack single-memory path. The ACK is built
    /// only after the received row is durably written.
    fn handle_memory_push(&self, peer_did: &str, frame: &Frame) -> Frame {
        let payload: MemoryPushPayload = match frame.payload_as() {
            Ok(p) => p,
            Err(e) => {
                return Frame::build(
                    FrameType::Error,
                    ErrorPayload::new("MALFORMED_FRAME", e.to_string()),
                    &self.signer,
                )
            }
        };
        let memory = payload.memory;

        let ack = |accepted: bool, reason: Option<&str>| {
            Frame::build(
                FrameType::MemoryAck,
                serde_json::to_value(MemoryAckPayload {
                    memory_id: memory.id.clone(),
                    accepted,
                    reason: reason.map(str::to_string),
                })
                .expect("ack payload serializes"),
                &self.signer,
            )
        };

        let Some(peer) = self.peer_for(peer_did) else {
            return ack(false, Some("unknown peer"));
        };
        // Trust gate: a pending peer's push writes nothing, anywhere.
        if peer.trust_level != TrustLevel::Trusted {
            return ack(false, Some("not trusted"));
        }

        match self.record_received(&peer, &memory) {
            Ok(_) => ack(true, None),
            Err(e) => {
                tracing::error!(peer = %peer.did, "failed to record pushed memory: {e}");
                ack(false, Some("storage failure"))
            }
        }
    }

    /// Write one wire memory into the received quarantine.
    fn record_received(
        &self,
        peer: &Peer,
        memory: &WireMemory,
    ) -> Result<bool, signet_core::StoreError> {
        // verified = signature and signer DID both present and valid.
        let verified = match (&memory.signature, &memory.signer_did) {
            (Some(signature), Some(signer_did)) => {
                verify_with_did(signer_did, memory.content.as_bytes(), signature).is_ok()
            }
            _ => false,
        };

        let (_, inserted) = self.store.insert_received(
            &peer.id,
            &memory.content,
            Some(memory.memory_type),
            memory.signature.as_deref(),
            memory.signer_did.as_deref(),
            verified,
        )?;
        Ok(inserted)
    }

    /// SYNC_RESPONSE: quarantine every shipped memory. Rows never
    /// auto-promote into `memories`.
    pub fn process_sync_response(
        &self,
        peer_did: &str,
        payload: &SyncResponsePayload,
    ) -> Result<usize, signet_core::StoreError> {
        let Some(peer) = self.peer_for(peer_did) else {
            return Ok(0);
        };
        let mut inserted = 0;
        for memory in &payload.memories {
            if self.record_received(&peer, memory)? {
                inserted += 1;
            }
        }
        tracing::info!(peer = %peer.did, inserted, "sync response recorded");
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signet_core::memory::{ChangeContext, MemoryFilter, MemoryInput, MemoryType};
    use tempfile::TempDir;

    struct Fixture {
        handler: ProtocolHandler,
        store: Arc<Store>,
        local: Arc<Signer>,
        remote: Signer,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(dir.path().join("memories.db")).unwrap());
        let local = Arc::new(Signer::from_bytes(&[1u8; 32]));
        let remote = Signer::from_bytes(&[2u8; 32]);
        Fixture {
            handler: ProtocolHandler::new(store.clone(), local.clone()),
            store,
            local,
            remote,
            _dir: dir,
        }
    }

    fn seed_memory(store: &Store, content: &str, tags: &[&str]) -> String {
        store
            .insert_memory(
                &MemoryInput {
                    content: content.to_string(),
                    tags: tags.iter().map(|t| t.to_string()).collect(),
                    importance: Some(0.9),
                    ..Default::default()
                },
                &ChangeContext::default(),
                None,
            )
            .unwrap()
            .id
    }

    fn add_peer(fixture: &Fixture, trust: TrustLevel) -> Peer {
        let peer = fixture
            .store
            .upsert_peer(fixture.remote.did(), None, None, None, None)
            .unwrap();
        fixture.store.set_peer_trust(&peer.id, trust).unwrap();
        fixture.store.peer_by_id(&peer.id).unwrap().unwrap()
    }

    fn sync_request(fixture: &Fixture, payload: SyncRequestPayload) -> Frame {
        Frame::build(
            FrameType::SyncRequest,
            serde_json::to_value(payload).unwrap(),
            &fixture.remote,
        )
    }

    #[test]
    fn trusted_sync_ships_rule_matches() {
        let fixture = fixture();
        add_peer(&fixture, TrustLevel::Trusted);
        seed_memory(&fixture.store, "shareable alpha", &["shareable"]);
        seed_memory(&fixture.store, "private fact", &[]);
        fixture
            .store
            .create_publish_rule("share", None, &["shareable".to_string()], &[], 0.0, None, false)
            .unwrap();

        let reply = fixture
            .handler
            .handle(
                fixture.remote.did(),
                &sync_request(&fixture, SyncRequestPayload::default()),
            )
            .unwrap();
        assert_eq!(reply.frame_type, FrameType::SyncResponse);
        let payload: SyncResponsePayload = reply.payload_as().unwrap();
        assert_eq!(payload.memories.len(), 1);
        assert_eq!(payload.memories[0].content, "shareable alpha");
        assert!(!payload.has_more);

        // Bookkeeping makes a second sync empty.
        let again = fixture
            .handler
            .handle(
                fixture.remote.did(),
                &sync_request(&fixture, SyncRequestPayload::default()),
            )
            .unwrap();
        let payload: SyncResponsePayload = again.payload_as().unwrap();
        assert!(payload.memories.is_empty());
    }

    #[test]
    fn pending_peer_sync_is_not_trusted() {
        let fixture = fixture();
        add_peer(&fixture, TrustLevel::Pending);
        seed_memory(&fixture.store, "anything", &["shareable"]);
        fixture
            .store
            .create_publish_rule("share", None, &[], &[], 0.0, None, false)
            .unwrap();

        let reply = fixture
            .handler
            .handle(
                fixture.remote.did(),
                &sync_request(&fixture, SyncRequestPayload::default()),
            )
            .unwrap();
        assert_eq!(reply.frame_type, FrameType::Error);
        let payload: ErrorPayload = reply.payload_as().unwrap();
        assert_eq!(payload.code, "NOT_TRUSTED");
    }

    #[test]
    fn sync_respects_since_types_and_limit() {
        let fixture = fixture();
        add_peer(&fixture, TrustLevel::Trusted);
        for i in 0..5 {
            seed_memory(&fixture.store, &format!("fact number {i}"), &["shareable"]);
        }
        fixture
            .store
            .create_publish_rule("share", None, &["shareable".to_string()], &[], 0.0, None, false)
            .unwrap();

        let reply = fixture
            .handler
            .handle(
                fixture.remote.did(),
                &sync_request(
                    &fixture,
                    SyncRequestPayload {
                        limit: Some(2),
                        ..Default::default()
                    },
                ),
            )
            .unwrap();
        let payload: SyncResponsePayload = reply.payload_as().unwrap();
        assert_eq!(payload.memories.len(), 2);
        assert!(payload.has_more);

        // A type whitelist that matches nothing ships nothing.
        let reply = fixture
            .handler
            .handle(
                fixture.remote.did(),
                &sync_request(
                    &fixture,
                    SyncRequestPayload {
                        types: Some(vec![MemoryType::Decision]),
                        ..Default::default()
                    },
                ),
            )
            .unwrap();
        let payload: SyncResponsePayload = reply.payload_as().unwrap();
        assert!(payload.memories.is_empty());
    }

    #[test]
    fn push_from_trusted_peer_quarantines_and_acks() {
        let fixture = fixture();
        add_peer(&fixture, TrustLevel::Trusted);

        let content = "pushed fact";
        let wire = WireMemory {
            id: "remote-1".to_string(),
            content: content.to_string(),
            memory_type: MemoryType::Fact,
            tags: vec![],
            importance: 0.8,
            created_at: Utc::now(),
            signature: Some(fixture.remote.sign(content.as_bytes())),
            signer_did: Some(fixture.remote.did().to_string()),
        };
        let push = Frame::build(
            FrameType::MemoryPush,
            serde_json::to_value(MemoryPushPayload { memory: wire }).unwrap(),
            &fixture.remote,
        );

        let reply = fixture.handler.handle(fixture.remote.did(), &push).unwrap();
        assert_eq!(reply.frame_type, FrameType::MemoryAck);
        let ack: MemoryAckPayload = reply.payload_as().unwrap();
        assert!(ack.accepted);
        assert_eq!(ack.memory_id, "remote-1");

        // Quarantined and verified, but not in the main store.
        let peer = fixture.store.peer_by_did(fixture.remote.did()).unwrap().unwrap();
        let received = fixture.store.received_for(&peer.id).unwrap();
        assert_eq!(received.len(), 1);
        assert!(received[0].verified);
        assert!(fixture
            .store
            .list(&MemoryFilter::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn push_from_pending_peer_writes_nothing() {
        let fixture = fixture();
        let peer = add_peer(&fixture, TrustLevel::Pending);

        let wire = WireMemory {
            id: "remote-2".to_string(),
            content: "unsolicited".to_string(),
            memory_type: MemoryType::Fact,
            tags: vec![],
            importance: 0.5,
            created_at: Utc::now(),
            signature: None,
            signer_did: None,
        };
        let push = Frame::build(
            FrameType::MemoryPush,
            serde_json::to_value(MemoryPushPayload { memory: wire }).unwrap(),
            &fixture.remote,
        );

        let reply = fixture.handler.handle(fixture.remote.did(), &push).unwrap();
        let ack: MemoryAckPayload = reply.payload_as().unwrap();
        assert!(!ack.accepted);
        assert_eq!(ack.reason.as_deref(), Some("not trusted"));

        // No received row, no memory row, no shared row.
        assert!(fixture.store.received_for(&peer.id).unwrap().is_empty());
        assert!(fixture
            .store
            .list(&MemoryFilter::default())
            .unwrap()
            .is_empty());
        assert!(fixture.store.shared_memory_ids(&peer.id).unwrap().is_empty());
    }

    #[test]
    fn sync_response_quarantines_with_verification() {
        let fixture = fixture();
        add_peer(&fixture, TrustLevel::Trusted);

        let good_content = "verified remote";
        let payload = SyncResponsePayload {
            memories: vec![
                WireMemory {
                    id: "r1".to_string(),
                    content: good_content.to_string(),
                    memory_type: MemoryType::Fact,
                    tags: vec![],
                    importance: 0.9,
                    created_at: Utc::now(),
                    signature: Some(fixture.remote.sign(good_content.as_bytes())),
                    signer_did: Some(fixture.remote.did().to_string()),
                },
                WireMemory {
                    id: "r2".to_string(),
                    content: "unsigned remote".to_string(),
                    memory_type: MemoryType::Fact,
                    tags: vec![],
                    importance: 0.9,
                    created_at: Utc::now(),
                    signature: None,
                    signer_did: None,
                },
            ],
            has_more: false,
            synced_at: Utc::now(),
        };

        let inserted = fixture
            .handler
            .process_sync_response(fixture.remote.did(), &payload)
            .unwrap();
        assert_eq!(inserted, 2);

        let peer = fixture.store.peer_by_did(fixture.remote.did()).unwrap().unwrap();
        let received = fixture.store.received_for(&peer.id).unwrap();
        assert_eq!(received.len(), 2);
        let verified: Vec<bool> = received.iter().map(|r| r.verified).collect();
        assert!(verified.contains(&true));
        assert!(verified.contains(&false));
        assert_eq!(peer.memories_received, 2);
    }

    #[test]
    fn ping_gets_pong_signed_locally() {
        let fixture = fixture();
        add_peer(&fixture, TrustLevel::Pending);
        let ping = Frame::build(FrameType::Ping, serde_json::json!({}), &fixture.remote);
        let reply = fixture.handler.handle(fixture.remote.did(), &ping).unwrap();
        assert_eq!(reply.frame_type, FrameType::Pong);
        assert_eq!(reply.sender_did, fixture.local.did());
        assert!(reply.validate(Utc::now()).is_ok());
    }
}
