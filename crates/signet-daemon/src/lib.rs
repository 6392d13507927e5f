//! # Signet Daemon
//!
//! The per-user memory daemon: owns the identity vault and the store,
//! serves DID-authenticated federation over WebSocket, and runs the
//! periodic maintenance tasks (strength decay, Merkle snapshots, the
//! auto-publish heartbeat).

#![warn(rustdoc::missing_crate_level_docs)]

pub mod daemon;
pub mod federation;

pub use daemon::Daemon;
pub use federation::{
    ClientError, FederationClient, FederationContext, FederationServer, Frame, FrameError,
    FrameType, HandshakeMachine, ProtocolHandler, RateLimiter, WireMemory,
};
