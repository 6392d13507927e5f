//! Federation
//!
//! DID-authenticated memory exchange over WebSocket. The wire format is
//! signed JSON frames; the handshake is a challenge/counter-challenge
//! state machine; trust gating and selective publish decide what actually
//! moves.

mod client;
mod frame;
mod handshake;
mod protocol;
mod rate_limit;
mod server;

pub use client::{ClientError, FederationClient};
pub use frame::{
    generate_challenge, ErrorPayload, Frame, FrameError, FrameType, HandshakeAckPayload,
    HandshakePayload, MemoryAckPayload, MemoryPushPayload, PingPayload, SyncRequestPayload,
    SyncResponsePayload, WireMemory, REPLAY_WINDOW_SECS,
};
pub use handshake::{Action, ConnState, HandshakeMachine, PeerIdentity};
pub use protocol::{ProtocolHandler, DEFAULT_SYNC_LIMIT};
pub use rate_limit::RateLimiter;
pub use server::{FederationContext, FederationServer};
