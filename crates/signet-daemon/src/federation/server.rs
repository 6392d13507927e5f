//! Federation server
//!
//! Accepts inbound peers over WebSocket. Each connection runs its own task:
//! frames are processed strictly in arrival order, the handshake is bounded
//! by a deadline, a sliding rate limiter caps inbound work, and keepalive
//! pings drop unresponsive sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use signet_core::config::FederationConfig;
use signet_core::identity::Signer;
use signet_core::memory::TrustLevel;
use signet_core::Store;

use super::frame::{ErrorPayload, Frame, FrameType};
use super::handshake::{Action, HandshakeMachine};
use super::protocol::ProtocolHandler;
use super::rate_limit::RateLimiter;

/// Shared dependencies for both server and client connections.
pub struct FederationContext {
    /// The store (sole writer).
    pub store: Arc<Store>,
    /// The daemon's signing key.
    pub signer: Arc<Signer>,
    /// Federation knobs.
    pub config: FederationConfig,
    /// Display name advertised in handshakes.
    pub display_name: Option<String>,
}

impl FederationContext {
    /// Bundle the shared dependencies.
    pub fn new(
        store: Arc<Store>,
        signer: Arc<Signer>,
        config: FederationConfig,
        display_name: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            signer,
            config,
            display_name,
        })
    }
}

/// Running accept loop.
pub struct FederationServer {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl FederationServer {
    /// Bind the configured listen address and start accepting peers.
    pub async fn bind(ctx: Arc<FederationContext>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&ctx.config.listen).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "federation server listening");
        let handle = tokio::spawn(accept_loop(listener, ctx));
        Ok(Self { local_addr, handle })
    }

    /// The bound address (useful when the config asked for port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections.
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<FederationContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, addr, ctx).await {
                        tracing::debug!(%addr, "connection ended: {e}");
                    }
                });
            }
            Err(e) => {
                tracing::warn!("accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<FederationContext>,
) -> anyhow::Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    tracing::debug!(%addr, "peer connected");
    serve_connection(ws, ctx).await;
    Ok(())
}

/// Outcome of processing one inbound text frame.
enum FrameDisposition {
    Continue,
    Close(CloseCode),
}

/// Drive one accepted connection to completion.
pub(crate) async fn serve_connection<S>(ws: WebSocketStream<S>, ctx: Arc<FederationContext>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let mut machine = HandshakeMachine::new(
        ctx.signer.clone(),
        ctx.display_name.clone(),
        None,
    );
    let handler = ProtocolHandler::new(ctx.store.clone(), ctx.signer.clone());
    let mut limiter = RateLimiter::new(ctx.config.max_messages_per_minute);

    let handshake_deadline = tokio::time::sleep(Duration::from_millis(
        ctx.config.handshake_timeout_ms,
    ));
    tokio::pin!(handshake_deadline);

    let mut keepalive = tokio::time::interval(Duration::from_millis(ctx.config.ping_interval_ms));
    keepalive.tick().await; // first tick fires immediately; skip it
    let mut saw_activity = true;

    loop {
        tokio::select! {
            // Handshake must complete within the deadline.
            _ = &mut handshake_deadline, if !machine.is_authenticated() => {
                tracing::debug!("handshake deadline expired");
                let _ = sink
                    .send(close_message(CloseCode::Policy, "handshake timeout"))
                    .await;
                break;
            }

            // Keepalive: ping every interval; a peer silent for a whole
            // interval after a ping is dropped.
            _ = keepalive.tick(), if machine.is_authenticated() => {
                if !saw_activity {
                    tracing::debug!("peer unresponsive to keepalive, dropping");
                    break;
                }
                saw_activity = false;
                let ping = Frame::build(FrameType::Ping, serde_json::json!({}), &ctx.signer);
                if sink.send(Message::Text(ping.encode().into())).await.is_err() {
                    break;
                }
            }

            inbound = stream.next() => {
                let Some(message) = inbound else { break };
                let message = match message {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::debug!("socket error: {e}");
                        break;
                    }
                };
                saw_activity = true;
                match message {
                    Message::Text(text) => {
                        let disposition = process_text_frame(
                            text.as_str(),
                            &mut machine,
                            &handler,
                            &mut limiter,
                            &ctx,
                            &mut sink,
                        )
                        .await;
                        match disposition {
                            FrameDisposition::Continue => {}
                            FrameDisposition::Close(code) => {
                                let _ = sink.send(close_message(code, "protocol error")).await;
                                break;
                            }
                        }
                        if machine.is_closed() {
                            break;
                        }
                    }
                    Message::Ping(data) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Message::Close(_) => break,
                    Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {}
                }
            }
        }
    }
    tracing::debug!("connection closed");
}

fn close_message(code: CloseCode, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}

/// Send one frame, ignoring transport errors (the read side will notice).
pub(crate) async fn send_frame<S>(sink: &mut S, frame: Frame)
where
    S: futures_util::Sink<Message> + Unpin,
{
    let _ = sink.send(Message::Text(frame.encode().into())).await;
}

async fn process_text_frame<S>(
    text: &str,
    machine: &mut HandshakeMachine,
    handler: &ProtocolHandler,
    limiter: &mut RateLimiter,
    ctx: &FederationContext,
    sink: &mut S,
) -> FrameDisposition
where
    S: futures_util::Sink<Message> + Unpin,
{
    // Rate limit first: overruns get an ERROR but stay connected.
    if !limiter.allow() {
        let error = Frame::build(
            FrameType::Error,
            ErrorPayload::new("RATE_LIMITED", "per-connection message budget exceeded"),
            &ctx.signer,
        );
        send_frame(sink, error).await;
        return FrameDisposition::Continue;
    }

    let frame = match Frame::decode(text) {
        Ok(frame) => frame,
        Err(e) => {
            let error = Frame::build(
                FrameType::Error,
                ErrorPayload::new(e.code(), e.to_string()),
                &ctx.signer,
            );
            send_frame(sink, error).await;
            return FrameDisposition::Continue;
        }
    };

    if let Err(e) = frame.validate(Utc::now()) {
        let error = Frame::build(
            FrameType::Error,
            ErrorPayload::new(e.code(), e.to_string()),
            &ctx.signer,
        );
        send_frame(sink, error).await;
        return if e.closes_connection() {
            FrameDisposition::Close(CloseCode::Policy)
        } else {
            FrameDisposition::Continue
        };
    }

    // Current local trust for the sender.
    let trust = ctx
        .store
        .peer_by_did(&frame.sender_did)
        .ok()
        .flatten()
        .map(|peer| peer.trust_level)
        .unwrap_or_default();

    if machine.is_authenticated() {
        // Trust may have been revoked mid-connection.
        if trust == TrustLevel::Blocked {
            let error = Frame::build(
                FrameType::Error,
                ErrorPayload::new("BLOCKED", "peer is blocked"),
                &ctx.signer,
            );
            send_frame(sink, error).await;
            return FrameDisposition::Close(CloseCode::Policy);
        }
        if let Some(reply) = handler.handle(&frame.sender_did, &frame) {
            send_frame(sink, reply).await;
        }
        return FrameDisposition::Continue;
    }

    // Still inside the handshake.
    let actions = machine.on_frame(&frame, trust);
    for action in actions {
        match action {
            Action::Send(out) => send_frame(sink, out).await,
            Action::RegisterPeer(identity) => {
                if let Err(e) = handler.register_peer(&identity) {
                    tracing::error!(peer = %identity.did, "failed to register peer: {e}");
                }
            }
            Action::Close => return FrameDisposition::Close(CloseCode::Policy),
        }
    }
    FrameDisposition::Continue
}
