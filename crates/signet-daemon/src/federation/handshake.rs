//! Handshake state machine
//!
//! Mutual DID authentication with challenge/counter-challenge. The machine
//! is a transition function over `(state, frame) -> (state, actions)`; it
//! never touches the socket or the store, which keeps both sides fully
//! exercisable in unit tests. Ed25519 signing is deterministic, so
//! transitions are reproducible given the same inputs.
//!
//! Initiator: `OPEN → HANDSHAKE_SENT → AUTHENTICATED → CLOSED`
//! Responder: `OPEN → AWAITING_COUNTER → AUTHENTICATED → CLOSED`
//! Any protocol error closes, with an ERROR frame where possible.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use signet_core::identity::{did_to_public_key, verify_detached, Signer};
use signet_core::memory::TrustLevel;

use super::frame::{
    generate_challenge, ErrorPayload, Frame, FrameType, HandshakeAckPayload, HandshakePayload,
    PingPayload,
};

/// The authenticated remote identity, pinned at handshake time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// The peer's DID.
    pub did: String,
    /// The peer's raw public key (derived from the DID and cross-checked
    /// against the advertised key).
    pub public_key: [u8; 32],
    /// The advertised base64 public key, stored with the peer row.
    pub public_key_b64: String,
    /// Display name from the handshake.
    pub display_name: Option<String>,
    /// Chain address from the handshake.
    pub chain_address: Option<String>,
}

/// Per-connection authentication state.
#[derive(Debug, Clone)]
pub enum ConnState {
    /// Fresh connection, nothing sent.
    Open,
    /// Initiator: HANDSHAKE sent, waiting for the ACK.
    HandshakeSent {
        /// The challenge the responder must sign.
        challenge: String,
    },
    /// Responder: ACK sent, waiting for the counter-challenge response.
    AwaitingCounter {
        /// The challenge the initiator must sign.
        counter_challenge: String,
        /// Peer identity established so far.
        peer: PeerIdentity,
    },
    /// Mutual authentication complete.
    Authenticated {
        /// The authenticated peer.
        peer: PeerIdentity,
    },
    /// Terminal state.
    Closed,
}

impl ConnState {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ConnState::Open => "open",
            ConnState::HandshakeSent { .. } => "handshake_sent",
            ConnState::AwaitingCounter { .. } => "awaiting_counter",
            ConnState::Authenticated { .. } => "authenticated",
            ConnState::Closed => "closed",
        }
    }
}

/// Effects the connection task must carry out after a transition.
#[derive(Debug, Clone)]
pub enum Action {
    /// Send this frame to the peer.
    Send(Frame),
    /// Persist/refresh the peer row for this identity.
    RegisterPeer(PeerIdentity),
    /// Close the connection (policy code 1008 for auth failures).
    Close,
}

/// Validate the DID/public-key binding a handshake advertises.
fn bind_identity(
    did: &str,
    public_key_b64: &str,
    display_name: Option<String>,
    chain_address: Option<String>,
) -> Result<PeerIdentity, &'static str> {
    let from_did = did_to_public_key(did).map_err(|_| "did does not decode")?;
    let advertised = BASE64
        .decode(public_key_b64)
        .map_err(|_| "public key is not base64")?;
    if advertised != from_did {
        return Err("did does not encode the advertised public key");
    }
    Ok(PeerIdentity {
        did: did.to_string(),
        public_key: from_did,
        public_key_b64: public_key_b64.to_string(),
        display_name,
        chain_address,
    })
}

/// Driver for one connection's handshake.
pub struct HandshakeMachine {
    state: ConnState,
    signer: Arc<Signer>,
    display_name: Option<String>,
    chain_address: Option<String>,
}

impl HandshakeMachine {
    /// Machine in the OPEN state.
    pub fn new(
        signer: Arc<Signer>,
        display_name: Option<String>,
        chain_address: Option<String>,
    ) -> Self {
        Self {
            state: ConnState::Open,
            signer,
            display_name,
            chain_address,
        }
    }

    /// Current state.
    pub fn state(&self) -> &ConnState {
        &self.state
    }

    /// The authenticated peer, once mutual auth completed.
    pub fn authenticated_peer(&self) -> Option<&PeerIdentity> {
        match &self.state {
            ConnState::Authenticated { peer } => Some(peer),
            _ => None,
        }
    }

    /// Whether higher-level traffic is allowed.
    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, ConnState::Authenticated { .. })
    }

    /// Whether the connection is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConnState::Closed)
    }

    fn error_and_close(&mut self, code: &str, message: &str) -> Vec<Action> {
        self.state = ConnState::Closed;
        vec![
            Action::Send(Frame::build(
                FrameType::Error,
                ErrorPayload::new(code, message),
                &self.signer,
            )),
            Action::Close,
        ]
    }

    /// Initiator entry point: emit the opening HANDSHAKE.
    /// Panics if the machine already left OPEN (a caller bug).
    pub fn initiate(&mut self) -> Frame {
        assert!(
            matches!(self.state, ConnState::Open),
            "initiate() called in state {}",
            self.state.name()
        );
        let challenge = generate_challenge();
        let payload = HandshakePayload {
            did: self.signer.did().to_string(),
            public_key: BASE64.encode(self.signer.public_key_bytes()),
            challenge: challenge.clone(),
            display_name: self.display_name.clone(),
            chain_address: self.chain_address.clone(),
        };
        self.state = ConnState::HandshakeSent { challenge };
        Frame::build(
            FrameType::Handshake,
            serde_json::to_value(payload).expect("handshake payload serializes"),
            &self.signer,
        )
    }

    /// Feed a validated frame through the handshake. `peer_trust` is the
    /// locally stored trust for `frame.sender_did` (pending when unknown).
    ///
    /// Frames that belong to the post-handshake protocol return no actions
    /// once authenticated; the connection task dispatches those itself.
    pub fn on_frame(&mut self, frame: &Frame, peer_trust: TrustLevel) -> Vec<Action> {
        match (&self.state, frame.frame_type) {
            // ================= responder side =================
            (ConnState::Open, FrameType::Handshake) => {
                let payload: HandshakePayload = match frame.payload_as() {
                    Ok(p) => p,
                    Err(e) => return self.error_and_close("MALFORMED_FRAME", &e.to_string()),
                };
                if payload.did != frame.sender_did {
                    return self.error_and_close(
                        "INVALID_DID",
                        "handshake did does not match frame sender",
                    );
                }
                let peer = match bind_identity(
                    &payload.did,
                    &payload.public_key,
                    payload.display_name.clone(),
                    payload.chain_address.clone(),
                ) {
                    Ok(peer) => peer,
                    Err(reason) => return self.error_and_close("INVALID_DID", reason),
                };
                if peer_trust == TrustLevel::Blocked {
                    tracing::warn!(peer = %peer.did, "blocked peer refused at handshake");
                    return self.error_and_close("BLOCKED", "peer is blocked");
                }

                // Prove custody of our key by signing their challenge, and
                // demand the same proof back.
                let counter_challenge = generate_challenge();
                let ack = HandshakeAckPayload {
                    did: self.signer.did().to_string(),
                    public_key: BASE64.encode(self.signer.public_key_bytes()),
                    challenge_response: self.signer.sign(payload.challenge.as_bytes()),
                    counter_challenge: counter_challenge.clone(),
                    display_name: self.display_name.clone(),
                    chain_address: self.chain_address.clone(),
                };
                let ack_frame = Frame::build(
                    FrameType::HandshakeAck,
                    serde_json::to_value(ack).expect("ack payload serializes"),
                    &self.signer,
                );
                self.state = ConnState::AwaitingCounter {
                    counter_challenge,
                    peer,
                };
                vec![Action::Send(ack_frame)]
            }

            (ConnState::AwaitingCounter { counter_challenge, peer }, FrameType::Ping) => {
                let payload: PingPayload = match frame.payload_as() {
                    Ok(p) => p,
                    Err(e) => return self.error_and_close("MALFORMED_FRAME", &e.to_string()),
                };
                let Some(counter_response) = payload.counter_response else {
                    return self
                        .error_and_close("BAD_SIGNATURE", "counter-challenge response missing");
                };
                let verified = verify_detached(
                    &peer.public_key,
                    counter_challenge.as_bytes(),
                    &counter_response,
                )
                .is_ok();
                if !verified {
                    return self
                        .error_and_close("BAD_SIGNATURE", "counter-challenge response invalid");
                }

                let peer = peer.clone();
                tracing::info!(peer = %peer.did, "peer authenticated (responder)");
                self.state = ConnState::Authenticated { peer: peer.clone() };
                vec![
                    Action::RegisterPeer(peer),
                    Action::Send(Frame::build(
                        FrameType::Pong,
                        serde_json::json!({}),
                        &self.signer,
                    )),
                ]
            }

            // ================= initiator side =================
            (ConnState::HandshakeSent { challenge }, FrameType::HandshakeAck) => {
                let payload: HandshakeAckPayload = match frame.payload_as() {
                    Ok(p) => p,
                    Err(e) => return self.error_and_close("MALFORMED_FRAME", &e.to_string()),
                };
                if payload.did != frame.sender_did {
                    return self.error_and_close(
                        "INVALID_DID",
                        "handshake_ack did does not match frame sender",
                    );
                }
                let peer = match bind_identity(
                    &payload.did,
                    &payload.public_key,
                    payload.display_name.clone(),
                    payload.chain_address.clone(),
                ) {
                    Ok(peer) => peer,
                    Err(reason) => return self.error_and_close("INVALID_DID", reason),
                };
                if peer_trust == TrustLevel::Blocked {
                    return self.error_and_close("BLOCKED", "peer is blocked");
                }
                let custody_proven = verify_detached(
                    &peer.public_key,
                    challenge.as_bytes(),
                    &payload.challenge_response,
                )
                .is_ok();
                if !custody_proven {
                    return self.error_and_close("BAD_SIGNATURE", "challenge response invalid");
                }

                // Answer their counter-challenge inside the first PING.
                let ping = PingPayload {
                    counter_response: Some(self.signer.sign(payload.counter_challenge.as_bytes())),
                };
                let ping_frame = Frame::build(
                    FrameType::Ping,
                    serde_json::to_value(ping).expect("ping payload serializes"),
                    &self.signer,
                );
                tracing::info!(peer = %peer.did, "peer authenticated (initiator)");
                self.state = ConnState::Authenticated { peer: peer.clone() };
                vec![Action::RegisterPeer(peer), Action::Send(ping_frame)]
            }

            // ================= everything else =================
            (ConnState::Authenticated { .. }, _) => Vec::new(),
            (ConnState::Closed, _) => Vec::new(),

            // Higher-level traffic before mutual auth completes.
            (ConnState::AwaitingCounter { .. }, _) | (ConnState::Open, _)
            | (ConnState::HandshakeSent { .. }, _) => self.error_and_close(
                "NOT_AUTHENTICATED",
                "frame received before handshake completion",
            ),
        }
    }
}
