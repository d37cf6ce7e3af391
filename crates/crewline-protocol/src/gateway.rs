//! Agent gateway wire envelopes.
//!
//! The gateway speaks small JSON envelopes over a message-framed WebSocket
//! connection. There are three envelope kinds:
//!
//! - `req` — client request (`connect`, `chat.send`), correlated by `id`
//! - `res` — response to a request, correlated by the same `id`
//! - `event` — server push scoped to a run (`chat`, `agent`)
//!
//! Frames the bridge does not understand are skipped, never errors.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version spoken by the bridge. Pinned: both `minProtocol` and
/// `maxProtocol` are sent as this value.
pub const PROTOCOL_VERSION: u32 = 3;

// ============================================================================
// Outbound requests
// ============================================================================

/// Client identity descriptor sent in the connect handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub mode: String,
    pub platform: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            id: "crewline-bridge".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            mode: "backend".to_string(),
            platform: std::env::consts::OS.to_string(),
        }
    }
}

/// Authentication block inside the connect params.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthParams {
    pub token: String,
}

/// Params for the `connect` handshake request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub client: ClientInfo,
    pub auth: AuthParams,
    pub min_protocol: u32,
    pub max_protocol: u32,
}

/// Params for the `chat.send` turn-start request.
///
/// The idempotency key must be fresh per call (distinct from the session
/// key) so transport-level retries are safe to de-duplicate remotely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSendParams {
    pub session_key: String,
    pub message: String,
    pub idempotency_key: String,
}

/// Outbound `req` envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Request<P> {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub id: String,
    pub method: &'static str,
    pub params: P,
}

/// Build a `connect` handshake request.
pub fn connect_request(id: impl Into<String>, token: impl Into<String>) -> Request<ConnectParams> {
    Request {
        frame_type: "req",
        id: id.into(),
        method: "connect",
        params: ConnectParams {
            client: ClientInfo::default(),
            auth: AuthParams {
                token: token.into(),
            },
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
        },
    }
}

/// Build a `chat.send` turn-start request.
pub fn chat_send_request(
    id: impl Into<String>,
    session_key: impl Into<String>,
    message: impl Into<String>,
    idempotency_key: impl Into<String>,
) -> Request<ChatSendParams> {
    Request {
        frame_type: "req",
        id: id.into(),
        method: "chat.send",
        params: ChatSendParams {
            session_key: session_key.into(),
            message: message.into(),
            idempotency_key: idempotency_key.into(),
        },
    }
}

// ============================================================================
// Inbound frames
// ============================================================================

/// Inbound frame, tagged by the `type` field. Unknown tags fail to
/// deserialize and are skipped by the session client.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Res(Response),
    Event(Event),
}

/// Response envelope correlated to an earlier request by `id`.
#[derive(Debug, Clone, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl Response {
    /// Run identifier assigned by the gateway for this turn, if any.
    /// Absent run ids disable event filtering on the client side.
    pub fn run_id(&self) -> Option<String> {
        self.result
            .as_ref()?
            .get("runId")?
            .as_str()
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
    }
}

/// Event envelope pushed by the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct Event {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

/// The events that matter during one conversation turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// The agent invoked a tool.
    ToolUse { tool: String, args: Value },
    /// Cumulative assistant text. Each snapshot carries the full text so
    /// far, so a later snapshot replaces an earlier one outright.
    AssistantText { text: String },
    /// Turn complete. Carries the final message body when the gateway did
    /// not stream it.
    Final { message: Option<String> },
}

impl Event {
    /// The run identifier this event belongs to, if present and non-empty.
    pub fn run(&self) -> Option<&str> {
        self.payload
            .get("run")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Classify a raw gateway event into a [`TurnEvent`], or `None` for
    /// event kinds the bridge does not consume.
    pub fn classify(&self) -> Option<TurnEvent> {
        match self.event.as_str() {
            "chat" => match self.payload.get("state").and_then(Value::as_str) {
                Some("tool_use") => Some(TurnEvent::ToolUse {
                    tool: self
                        .payload
                        .get("tool")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    args: self
                        .payload
                        .get("args")
                        .cloned()
                        .unwrap_or_else(|| Value::Object(Default::default())),
                }),
                Some("final") => Some(TurnEvent::Final {
                    message: self
                        .payload
                        .pointer("/message/content")
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .map(ToString::to_string),
                }),
                _ => None,
            },
            "agent" if self.payload.get("stream").and_then(Value::as_str) == Some("assistant") => {
                let data = self.payload.get("data")?;
                // The gateway sends the full accumulated text per event; the
                // delta field only exists on older gateways.
                let text = data
                    .get("text")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .or_else(|| {
                        data.get("delta")
                            .and_then(Value::as_str)
                            .filter(|s| !s.is_empty())
                    })?;
                Some(TurnEvent::AssistantText {
                    text: text.to_string(),
                })
            }
            _ => None,
        }
    }
}
