//! Session protocol client for the agent gateway.
//!
//! One WebSocket connection per logical session: versioned handshake, a
//! single `chat.send` turn start, then an event loop that aggregates the
//! turn's streamed output. The connection is owned exclusively by the call
//! and dropped when it returns; there is no pooling, no reconnect and no
//! retry at this layer.
//!
//! Failure policy: every transport-level error is absorbed here and
//! surfaced to callers as `None` with the cause logged. Both the role
//! engines and the orchestrator treat "no text" as a legitimate outcome to
//! react to, never as an exception to unwind past.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use uuid::Uuid;

use crewline_protocol::gateway::{ServerFrame, TurnEvent, chat_send_request, connect_request};

use crate::config::GatewaySettings;

/// How many incoming frames to inspect for the handshake response.
const HANDSHAKE_POLL_LIMIT: usize = 10;

/// Per-frame wait while polling for the handshake response.
const HANDSHAKE_WAIT: Duration = Duration::from_secs(5);

/// Wait for the `chat.send` response.
const TURN_START_WAIT: Duration = Duration::from_secs(30);

/// Default overall budget for the event loop.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(1800);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Errors that can end a gateway session call.
///
/// `SessionError` never crosses the public `run_session` boundary; it is
/// logged and collapsed to `None` there.
#[derive(Debug, Error)]
pub enum SessionError {
    /// WebSocket connection could not be established.
    #[error("websocket connect failed: {0}")]
    Connect(#[source] tokio_tungstenite::tungstenite::Error),

    /// Sending a request frame failed.
    #[error("websocket send failed: {0}")]
    Send(#[source] tokio_tungstenite::tungstenite::Error),

    /// No positive `connect` response arrived within the poll budget.
    #[error("gateway handshake failed")]
    HandshakeFailed,

    /// The `chat.send` request was rejected or its response never arrived.
    #[error("chat.send rejected or timed out")]
    TurnStartFailed,

    /// Request serialization failed.
    #[error("request encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Consumer of a session's streamed output.
///
/// `on_text` receives the full cumulative text per call, not a delta: each
/// call replaces everything delivered before it. Implementations must
/// overwrite, never append.
#[async_trait]
pub trait SessionSink: Send + Sync {
    /// Latest cumulative assistant text snapshot.
    async fn on_text(&self, text: &str);

    /// A tool invocation reported by the agent. Default: ignored.
    async fn on_tool_use(&self, _tool: &str, _args: &Value) {}
}

/// Sink that discards all streamed output. Callers that only want the
/// aggregated return value use this.
pub struct NullSink;

#[async_trait]
impl SessionSink for NullSink {
    async fn on_text(&self, _text: &str) {}
}

/// Client for running agent sessions against the gateway.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    url: String,
    token: String,
}

impl GatewayClient {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
        }
    }

    pub fn from_settings(settings: &GatewaySettings) -> Self {
        Self::new(&settings.url, &settings.token)
    }

    fn ws_url(&self) -> String {
        self.url
            .replace("http://", "ws://")
            .replace("https://", "wss://")
    }

    /// Run one agent turn over a fresh connection.
    ///
    /// Returns the final accumulated text, or `None` when nothing
    /// accumulated or the session failed outright.
    pub async fn run_session(
        &self,
        session_key: &str,
        message: &str,
        sink: &dyn SessionSink,
        timeout: Duration,
    ) -> Option<String> {
        match self.run_session_inner(session_key, message, sink, timeout).await {
            Ok(text) => text,
            Err(err) => {
                error!("session {session_key} error: {err}");
                None
            }
        }
    }

    async fn run_session_inner(
        &self,
        session_key: &str,
        message: &str,
        sink: &dyn SessionSink,
        timeout: Duration,
    ) -> Result<Option<String>, SessionError> {
        let (socket, _) = connect_async(self.ws_url())
            .await
            .map_err(SessionError::Connect)?;
        let (mut write, mut read) = socket.split();

        // 1. Handshake
        let connect_id = Uuid::new_v4().to_string();
        send_request(&mut write, &connect_request(&connect_id, &self.token)).await?;

        let mut handshake_ok = false;
        for _ in 0..HANDSHAKE_POLL_LIMIT {
            let Ok(frame) = next_frame(&mut read, HANDSHAKE_WAIT).await else {
                break;
            };
            if let Some(ServerFrame::Res(res)) = frame
                && res.id == connect_id
                && res.ok
            {
                handshake_ok = true;
                break;
            }
        }
        if !handshake_ok {
            return Err(SessionError::HandshakeFailed);
        }

        // 2. Turn start. The idempotency key is fresh per call so remote
        // de-duplication never collapses two distinct turns.
        let req_id = Uuid::new_v4().to_string();
        let idempotency_key = Uuid::new_v4().to_string();
        send_request(
            &mut write,
            &chat_send_request(&req_id, session_key, message, &idempotency_key),
        )
        .await?;

        let run_id = loop {
            match next_frame(&mut read, TURN_START_WAIT).await {
                Err(_) => {
                    warn!("timeout waiting for chat.send response: {session_key}");
                    return Err(SessionError::TurnStartFailed);
                }
                Ok(Some(ServerFrame::Res(res))) if res.id == req_id => {
                    if !res.ok {
                        error!("chat.send failed for {session_key}: {:?}", res.error);
                        return Err(SessionError::TurnStartFailed);
                    }
                    let run_id = res.run_id();
                    debug!("session {session_key} got run_id={run_id:?}");
                    break run_id;
                }
                Ok(_) => continue,
            }
        };

        // 3. Event loop. Collect the turn's output, filtered by run id when
        // the gateway assigned one.
        let mut accumulated = String::new();

        loop {
            let frame = match next_frame(&mut read, timeout).await {
                Err(FrameEnd::TimedOut) => {
                    warn!("session {session_key} timed out");
                    break;
                }
                Err(FrameEnd::Closed) => {
                    info!("session {session_key} connection closed");
                    break;
                }
                Ok(None) => continue,
                Ok(Some(frame)) => frame,
            };

            let ServerFrame::Event(event) = frame else {
                continue;
            };

            // Skip cross-talk from other runs sharing the transport.
            if let (Some(expected), Some(run)) = (run_id.as_deref(), event.run())
                && run != expected
            {
                continue;
            }

            match event.classify() {
                Some(TurnEvent::ToolUse { tool, args }) => {
                    sink.on_tool_use(&tool, &args).await;
                }
                Some(TurnEvent::AssistantText { text }) => {
                    // Full cumulative text per event: replace, never append.
                    accumulated = text;
                    sink.on_text(&accumulated).await;
                }
                Some(TurnEvent::Final { message }) => {
                    if accumulated.is_empty()
                        && let Some(body) = message
                    {
                        accumulated = body;
                        sink.on_text(&accumulated).await;
                    }
                    info!("session {session_key} turn complete");
                    break;
                }
                None => {}
            }
        }

        Ok((!accumulated.is_empty()).then_some(accumulated))
    }
}

async fn send_request<P: Serialize>(
    write: &mut WsSink,
    request: &crewline_protocol::gateway::Request<P>,
) -> Result<(), SessionError> {
    let json = serde_json::to_string(request)?;
    write
        .send(Message::text(json))
        .await
        .map_err(SessionError::Send)
}

/// Why a frame wait ended without a frame.
enum FrameEnd {
    TimedOut,
    Closed,
}

/// Wait up to `wait` for the next decodable frame.
///
/// `Ok(None)` means a frame arrived but was not a protocol frame (ping,
/// binary, or an envelope kind we do not speak) — it still consumes one
/// poll slot, matching the handshake's frame-count budget.
async fn next_frame(read: &mut WsSource, wait: Duration) -> Result<Option<ServerFrame>, FrameEnd> {
    match tokio::time::timeout(wait, read.next()).await {
        Err(_) => Err(FrameEnd::TimedOut),
        Ok(None) => Err(FrameEnd::Closed),
        Ok(Some(Err(err))) => {
            debug!("websocket read error: {err}");
            Err(FrameEnd::Closed)
        }
        Ok(Some(Ok(Message::Text(text)))) => Ok(serde_json::from_str(text.as_str()).ok()),
        Ok(Some(Ok(Message::Close(_)))) => Err(FrameEnd::Closed),
        Ok(Some(Ok(_))) => Ok(None),
    }
}
