//! Federation end-to-end: real WebSocket listeners, mutual handshake,
//! sync and push flows, trust gating, and the imposter rejection path.

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use signet_core::identity::Signer;
use signet_core::memory::{MemoryFilter, TrustLevel};
use signet_daemon::federation::{
    generate_challenge, ClientError, ErrorPayload, FederationClient, Frame, FrameType,
    HandshakePayload, MemoryPushPayload, SyncRequestPayload, WireMemory,
};
use signet_e2e::{MemorySpec, TestNode};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

fn shareable(content: &'static str) -> MemorySpec {
    MemorySpec {
        content,
        tags: vec!["shareable"],
        importance: 0.9,
        sign: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn trusted_sync_roundtrip() {
    let node_a = TestNode::new(10, "alice");
    let node_b = TestNode::new(11, "bob");

    // B holds three signed, shareable memories behind a tag rule.
    for content in ["api runs on port 3000", "we use sqlite", "deploys are on fridays"] {
        node_b.insert(shareable(content));
    }
    node_b
        .store
        .create_publish_rule("share", None, &["shareable".to_string()], &[], 0.0, None, false)
        .unwrap();
    node_b.add_peer(&node_a, TrustLevel::Trusted);

    let server = node_b.serve().await;
    let url = format!("ws://{}", server.local_addr());
    let client = FederationClient::connect(node_a.ctx.clone(), url);

    let response = client.sync(SyncRequestPayload::default()).await.unwrap();
    assert_eq!(response.memories.len(), 3);
    assert!(!response.has_more);

    // A quarantined all three, signature-verified against B's DID.
    let peer_b = node_a.store.peer_by_did(node_b.did()).unwrap().unwrap();
    let received = node_a.store.received_for(&peer_b.id).unwrap();
    assert_eq!(received.len(), 3);
    assert!(received.iter().all(|row| row.verified));
    assert!(received.iter().all(|row| row.signer_did.as_deref() == Some(node_b.did())));

    // Nothing auto-promoted into A's main store.
    assert!(node_a.store.list(&MemoryFilter::default()).unwrap().is_empty());

    // B recorded the share and stamped last_sync.
    let peer_a = node_b.store.peer_by_did(node_a.did()).unwrap().unwrap();
    assert_eq!(peer_a.memories_shared, 3);
    assert!(peer_a.last_sync.is_some());
    assert_eq!(node_b.store.shared_memory_ids(&peer_a.id).unwrap().len(), 3);

    // A second sync ships nothing new.
    let again = client.sync(SyncRequestPayload::default()).await.unwrap();
    assert!(again.memories.is_empty());

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn pending_peer_cannot_move_memories() {
    let node_a = TestNode::new(12, "carol");
    let node_b = TestNode::new(13, "dave");

    node_b.insert(shareable("secret-ish fact"));
    node_b
        .store
        .create_publish_rule("share", None, &[], &[], 0.0, None, false)
        .unwrap();
    // B knows A only as pending (the handshake default).

    let server = node_b.serve().await;
    let url = format!("ws://{}", server.local_addr());
    let client = FederationClient::connect(node_a.ctx.clone(), url);

    // SYNC_REQUEST is refused with NOT_TRUSTED.
    let sync_result = client.sync(SyncRequestPayload::default()).await;
    match sync_result {
        Err(ClientError::Remote { code, .. }) => assert_eq!(code, "NOT_TRUSTED"),
        other => panic!("expected NOT_TRUSTED, got {other:?}"),
    }

    // MEMORY_PUSH is rejected in the ACK.
    let content = "unsolicited push";
    let ack = client
        .push_memory(WireMemory {
            id: "push-1".to_string(),
            content: content.to_string(),
            memory_type: signet_core::MemoryType::Fact,
            tags: vec![],
            importance: 0.5,
            created_at: chrono::Utc::now(),
            signature: Some(node_a.signer.sign(content.as_bytes())),
            signer_did: Some(node_a.did().to_string()),
        })
        .await
        .unwrap();
    assert!(!ack.accepted);

    // No rows moved anywhere on B.
    let peer_a = node_b.store.peer_by_did(node_a.did()).unwrap().unwrap();
    assert!(node_b.store.received_for(&peer_a.id).unwrap().is_empty());
    assert!(node_b.store.shared_memory_ids(&peer_a.id).unwrap().is_empty());
    assert_eq!(node_b.store.list(&MemoryFilter::default()).unwrap().len(), 1);

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn trusted_push_is_quarantined_and_acked() {
    let node_a = TestNode::new(14, "erin");
    let node_b = TestNode::new(15, "frank");
    node_b.add_peer(&node_a, TrustLevel::Trusted);

    let server = node_b.serve().await;
    let url = format!("ws://{}", server.local_addr());
    let client = FederationClient::connect(node_a.ctx.clone(), url);

    let content = "a pushed, signed memory";
    let ack = client
        .push_memory(WireMemory {
            id: "push-2".to_string(),
            content: content.to_string(),
            memory_type: signet_core::MemoryType::Fact,
            tags: vec![],
            importance: 0.7,
            created_at: chrono::Utc::now(),
            signature: Some(node_a.signer.sign(content.as_bytes())),
            signer_did: Some(node_a.did().to_string()),
        })
        .await
        .unwrap();
    assert!(ack.accepted);
    assert_eq!(ack.memory_id, "push-2");

    let peer_a = node_b.store.peer_by_did(node_a.did()).unwrap().unwrap();
    let received = node_b.store.received_for(&peer_a.id).unwrap();
    assert_eq!(received.len(), 1);
    assert!(received[0].verified);
    // Quarantine only; the main store is untouched.
    assert!(node_b.store.list(&MemoryFilter::default()).unwrap().is_empty());

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn imposter_handshake_is_rejected() {
    let node_b = TestNode::new(16, "grace");
    let server = node_b.serve().await;
    let url = format!("ws://{}", server.local_addr());

    // A frame claiming one DID but signed by a different key.
    let claimed = Signer::from_bytes(&[77u8; 32]);
    let imposter = Signer::from_bytes(&[78u8; 32]);
    let payload = HandshakePayload {
        did: claimed.did().to_string(),
        public_key: BASE64.encode(claimed.public_key_bytes()),
        challenge: generate_challenge(),
        display_name: None,
        chain_address: None,
    };
    let mut frame = Frame::build(
        FrameType::Handshake,
        serde_json::to_value(payload).unwrap(),
        &imposter,
    );
    frame.sender_did = claimed.did().to_string();

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws.send(Message::Text(frame.encode().into())).await.unwrap();

    // Expect ERROR {BAD_SIGNATURE}, then the socket closes.
    let mut saw_bad_signature = false;
    let mut closed = false;
    while let Some(Ok(message)) = ws.next().await {
        match message {
            Message::Text(text) => {
                let reply = Frame::decode(text.as_str()).unwrap();
                if reply.frame_type == FrameType::Error {
                    let payload: ErrorPayload = reply.payload_as().unwrap();
                    assert_eq!(payload.code, "BAD_SIGNATURE");
                    saw_bad_signature = true;
                }
            }
            Message::Close(_) => {
                closed = true;
                break;
            }
            _ => {}
        }
    }
    assert!(saw_bad_signature, "no BAD_SIGNATURE error observed");
    assert!(closed || ws.next().await.is_none());

    // No peer row was created for the claimed identity.
    assert!(node_b.store.peer_by_did(claimed.did()).unwrap().is_none());

    server.shutdown();
}

#[tokio::test]
async fn blocked_peer_is_refused_at_handshake() {
    let node_a = TestNode::new(17, "heidi");
    let node_b = TestNode::new(18, "ivan");
    node_b.add_peer(&node_a, TrustLevel::Blocked);

    let server = node_b.serve().await;
    let url = format!("ws://{}", server.local_addr());
    let client = FederationClient::connect(node_a.ctx.clone(), url);

    // The handshake never completes, so the request fails.
    let result = client.sync(SyncRequestPayload::default()).await;
    assert!(result.is_err());

    client.shutdown();
    server.shutdown();
}

#[tokio::test]
async fn push_payload_shape_matches_protocol() {
    // The wire shape of a push is {memory: {...}} with kebab-free keys.
    let content = "wire shape check";
    let signer = Signer::from_bytes(&[19u8; 32]);
    let wire = WireMemory {
        id: "w1".to_string(),
        content: content.to_string(),
        memory_type: signet_core::MemoryType::DailyLog,
        tags: vec!["a".to_string()],
        importance: 0.4,
        created_at: chrono::Utc::now(),
        signature: None,
        signer_did: None,
    };
    let value = serde_json::to_value(MemoryPushPayload { memory: wire }).unwrap();
    assert_eq!(value["memory"]["type"], "daily-log");
    assert_eq!(value["memory"]["content"], content);

    let frame = Frame::build(FrameType::MemoryPush, value, &signer);
    assert!(frame.validate(chrono::Utc::now()).is_ok());
}
