//! Federation client
//!
//! Dials a peer, performs the mutual handshake, and exposes sync/push as
//! request futures correlated with their reply frames. The connection wraps
//! an exponential-backoff reconnect loop; pending futures fail with
//! `ConnectionClosed` the moment the socket drops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::frame::{
    ErrorPayload, Frame, FrameType, MemoryAckPayload, MemoryPushPayload, SyncRequestPayload,
    SyncResponsePayload, WireMemory,
};
use super::handshake::{Action, HandshakeMachine};
use super::protocol::ProtocolHandler;
use super::server::{send_frame, FederationContext};

/// Backoff base delay.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Backoff ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Bound on queued outbound requests; a full queue returns `Busy`.
const COMMAND_QUEUE_CAPACITY: usize = 32;

/// Client-side failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// The socket dropped with the request outstanding.
    #[error("connection closed")]
    ConnectionClosed,
    /// The outbound queue is full.
    #[error("outbound queue full")]
    Busy,
    /// The handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// The peer answered with an ERROR frame.
    #[error("peer error {code}: {message}")]
    Remote {
        /// Stable error code from the peer.
        code: String,
        /// Peer's message.
        message: String,
    },
    /// The client task is gone.
    #[error("client shut down")]
    Shutdown,
}

impl ClientError {
    /// Whether retrying (with backoff) can help.
    pub fn retryable(&self) -> bool {
        matches!(self, ClientError::ConnectionClosed | ClientError::Busy)
    }
}

enum Command {
    Sync {
        payload: SyncRequestPayload,
        reply: oneshot::Sender<Result<SyncResponsePayload, ClientError>>,
    },
    Push {
        memory: WireMemory,
        reply: oneshot::Sender<Result<MemoryAckPayload, ClientError>>,
    },
}

/// Handle to a dialing federation connection.
pub struct FederationClient {
    command_tx: mpsc::Sender<Command>,
    handle: JoinHandle<()>,
}

impl FederationClient {
    /// Dial `url` and keep the connection alive with reconnect/backoff.
    pub fn connect(ctx: Arc<FederationContext>, url: String) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let handle = tokio::spawn(run_client(ctx, url, command_rx));
        Self { command_tx, handle }
    }

    /// Request a sync from the peer; resolves with the peer's response
    /// after the received rows are durably quarantined.
    pub async fn sync(
        &self,
        payload: SyncRequestPayload,
    ) -> Result<SyncResponsePayload, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .try_send(Command::Sync {
                payload,
                reply: reply_tx,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ClientError::Busy,
                mpsc::error::TrySendError::Closed(_) => ClientError::Shutdown,
            })?;
        reply_rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Push a single memory; resolves with the peer's ACK. Returns `Busy`
    /// when the bounded outbound queue is full rather than queuing without
    /// limit.
    pub async fn push_memory(&self, memory: WireMemory) -> Result<MemoryAckPayload, ClientError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .try_send(Command::Push {
                memory,
                reply: reply_tx,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ClientError::Busy,
                mpsc::error::TrySendError::Closed(_) => ClientError::Shutdown,
            })?;
        reply_rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Tear the connection down.
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

/// Outstanding request futures, correlated by frame type (sync) and
/// memory id (push).
#[derive(Default)]
struct PendingRequests {
    sync: Option<oneshot::Sender<Result<SyncResponsePayload, ClientError>>>,
    pushes: HashMap<String, oneshot::Sender<Result<MemoryAckPayload, ClientError>>>,
}

impl PendingRequests {
    fn fail_all(&mut self) {
        if let Some(sender) = self.sync.take() {
            let _ = sender.send(Err(ClientError::ConnectionClosed));
        }
        for (_, sender) in self.pushes.drain() {
            let _ = sender.send(Err(ClientError::ConnectionClosed));
        }
    }
}

async fn run_client(
    ctx: Arc<FederationContext>,
    url: String,
    mut command_rx: mpsc::Receiver<Command>,
) {
    let max_attempts = ctx.config.max_reconnect_attempts;
    let mut attempt: u32 = 0;

    loop {
        match run_session(&ctx, &url, &mut command_rx).await {
            Ok(()) => {
                // Authenticated session ended (socket loss); reset backoff.
                attempt = 0;
            }
            Err(e) => {
                attempt += 1;
                tracing::warn!(%url, attempt, "federation session failed: {e}");
                if attempt >= max_attempts {
                    tracing::error!(%url, "reconnect attempts exhausted");
                    break;
                }
            }
        }

        // min(base · 2^n, cap) + jitter
        let exp = BACKOFF_BASE
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(BACKOFF_CAP);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
        let delay = exp + jitter;
        tracing::debug!(%url, ?delay, "reconnecting after backoff");

        // While backing off, fail incoming requests instead of queueing.
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                command = command_rx.recv() => match command {
                    Some(Command::Sync { reply, .. }) => {
                        let _ = reply.send(Err(ClientError::ConnectionClosed));
                    }
                    Some(Command::Push { reply, .. }) => {
                        let _ = reply.send(Err(ClientError::ConnectionClosed));
                    }
                    None => return,
                },
            }
        }
    }
}

/// One connection lifetime: dial, handshake, serve requests until the
/// socket drops. `Ok(())` means the session authenticated before ending.
async fn run_session(
    ctx: &Arc<FederationContext>,
    url: &str,
    command_rx: &mut mpsc::Receiver<Command>,
) -> Result<(), ClientError> {
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| ClientError::Handshake(format!("dial failed: {e}")))?;
    let (mut sink, mut stream) = ws.split();

    let handler = ProtocolHandler::new(ctx.store.clone(), ctx.signer.clone());
    let mut machine = HandshakeMachine::new(
        ctx.signer.clone(),
        ctx.display_name.clone(),
        None,
    );

    // ==================== handshake phase ====================
    send_frame(&mut sink, machine.initiate()).await;
    let deadline = tokio::time::Instant::now()
        + Duration::from_millis(ctx.config.handshake_timeout_ms);

    while !machine.is_authenticated() {
        let message = tokio::time::timeout_at(deadline, stream.next())
            .await
            .map_err(|_| ClientError::Handshake("handshake timeout".to_string()))?
            .ok_or_else(|| ClientError::Handshake("socket closed during handshake".to_string()))?
            .map_err(|e| ClientError::Handshake(e.to_string()))?;

        let Message::Text(text) = message else { continue };
        let frame = Frame::decode(text.as_str())
            .map_err(|e| ClientError::Handshake(e.to_string()))?;
        frame
            .validate(Utc::now())
            .map_err(|e| ClientError::Handshake(e.to_string()))?;

        if frame.frame_type == FrameType::Error {
            let payload: ErrorPayload = frame
                .payload_as()
                .unwrap_or_else(|_| ErrorPayload {
                    code: "UNKNOWN".to_string(),
                    message: "unreadable error".to_string(),
                });
            return Err(ClientError::Remote {
                code: payload.code,
                message: payload.message,
            });
        }

        let trust = ctx
            .store
            .peer_by_did(&frame.sender_did)
            .ok()
            .flatten()
            .map(|peer| peer.trust_level)
            .unwrap_or_default();
        for action in machine.on_frame(&frame, trust) {
            match action {
                Action::Send(out) => send_frame(&mut sink, out).await,
                Action::RegisterPeer(identity) => {
                    if let Err(e) = handler.register_peer(&identity) {
                        tracing::error!(peer = %identity.did, "failed to register peer: {e}");
                    }
                }
                Action::Close => {
                    return Err(ClientError::Handshake("peer refused handshake".to_string()))
                }
            }
        }
        if machine.is_closed() {
            return Err(ClientError::Handshake("handshake failed".to_string()));
        }
    }

    let peer_did = machine
        .authenticated_peer()
        .map(|peer| peer.did.clone())
        .unwrap_or_default();
    tracing::info!(peer = %peer_did, %url, "outbound federation link authenticated");

    // ==================== request phase ====================
    let mut pending = PendingRequests::default();
    let mut keepalive = tokio::time::interval(Duration::from_millis(ctx.config.ping_interval_ms));
    keepalive.tick().await;

    loop {
        tokio::select! {
            _ = keepalive.tick() => {
                let ping = Frame::build(FrameType::Ping, serde_json::json!({}), &ctx.signer);
                send_frame(&mut sink, ping).await;
            }

            command = command_rx.recv() => match command {
                Some(Command::Sync { payload, reply }) => {
                    if pending.sync.is_some() {
                        let _ = reply.send(Err(ClientError::Busy));
                        continue;
                    }
                    let frame = Frame::build(
                        FrameType::SyncRequest,
                        serde_json::to_value(payload).expect("sync request serializes"),
                        &ctx.signer,
                    );
                    pending.sync = Some(reply);
                    send_frame(&mut sink, frame).await;
                }
                Some(Command::Push { memory, reply }) => {
                    let memory_id = memory.id.clone();
                    let frame = Frame::build(
                        FrameType::MemoryPush,
                        serde_json::to_value(MemoryPushPayload { memory })
                            .expect("push payload serializes"),
                        &ctx.signer,
                    );
                    pending.pushes.insert(memory_id, reply);
                    send_frame(&mut sink, frame).await;
                }
                None => {
                    pending.fail_all();
                    return Ok(());
                }
            },

            inbound = stream.next() => {
                let Some(Ok(message)) = inbound else {
                    pending.fail_all();
                    return Ok(());
                };
                let Message::Text(text) = message else { continue };
                let Ok(frame) = Frame::decode(text.as_str()) else {
                    tracing::debug!(peer = %peer_did, "dropping malformed frame");
                    continue;
                };
                if let Err(e) = frame.validate(Utc::now()) {
                    tracing::warn!(peer = %peer_did, "dropping invalid frame: {e}");
                    if e.closes_connection() {
                        pending.fail_all();
                        return Ok(());
                    }
                    continue;
                }

                match frame.frame_type {
                    FrameType::SyncResponse => {
                        match frame.payload_as::<SyncResponsePayload>() {
                            Ok(payload) => {
                                // Quarantine before resolving the future, so
                                // a resolved sync implies durable rows.
                                if let Err(e) =
                                    handler.process_sync_response(&peer_did, &payload)
                                {
                                    tracing::error!("failed to record sync response: {e}");
                                }
                                if let Some(sender) = pending.sync.take() {
                                    let _ = sender.send(Ok(payload));
                                }
                            }
                            Err(e) => tracing::warn!("malformed sync response: {e}"),
                        }
                    }
                    FrameType::MemoryAck => {
                        if let Ok(ack) = frame.payload_as::<MemoryAckPayload>() {
                            if let Some(sender) = pending.pushes.remove(&ack.memory_id) {
                                let _ = sender.send(Ok(ack));
                            }
                        }
                    }
                    FrameType::Error => {
                        if let Ok(payload) = frame.payload_as::<ErrorPayload>() {
                            tracing::warn!(
                                peer = %peer_did,
                                code = %payload.code,
                                "peer reported error: {}",
                                payload.message
                            );
                            if let Some(sender) = pending.sync.take() {
                                let _ = sender.send(Err(ClientError::Remote {
                                    code: payload.code,
                                    message: payload.message,
                                }));
                            }
                        }
                    }
                    // Symmetric traffic: the remote may sync from us too.
                    _ => {
                        if let Some(reply) = handler.handle(&frame.sender_did, &frame) {
                            send_frame(&mut sink, reply).await;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let delays: Vec<Duration> = (0..8)
            .map(|attempt| {
                BACKOFF_BASE
                    .saturating_mul(2u32.saturating_pow(attempt))
                    .min(BACKOFF_CAP)
            })
            .collect();
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[5], Duration::from_secs(32));
        assert_eq!(delays[6], Duration::from_secs(60));
        assert_eq!(delays[7], Duration::from_secs(60));
    }

    #[test]
    fn failed_pending_requests_resolve_with_closed() {
        let mut pending = PendingRequests::default();
        let (sync_tx, mut sync_rx) = oneshot::channel();
        let (push_tx, mut push_rx) = oneshot::channel();
        pending.sync = Some(sync_tx);
        pending.pushes.insert("m1".to_string(), push_tx);

        pending.fail_all();

        assert!(matches!(
            sync_rx.try_recv().unwrap(),
            Err(ClientError::ConnectionClosed)
        ));
        assert!(matches!(
            push_rx.try_recv().unwrap(),
            Err(ClientError::ConnectionClosed)
        ));
    }
}
