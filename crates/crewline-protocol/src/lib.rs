//! Protocol types for crewline agent communication.
//!
//! This crate defines the two wire formats the bridge speaks:
//!
//! ```text
//! Feishu群聊 <--[webhook/IM API]--> Bridge <--[WS: req/res/event envelopes]--> Agent Gateway
//!                                     |
//!                               Coordinator decisions (JSON actions)
//! ```
//!
//! - [`gateway`] — the JSON envelopes exchanged with the agent gateway over
//!   a WebSocket connection: outbound `req` frames and inbound `res`/`event`
//!   frames, plus classification of raw events into the handful the bridge
//!   cares about.
//! - [`coordination`] — the coordinator's decision format (`delegate` /
//!   `complete`) and the lenient parser that recovers it from free-form
//!   agent output.

pub mod coordination;
pub mod gateway;

pub use coordination::{Decision, parse_decision};
pub use gateway::{
    ChatSendParams, ClientInfo, ConnectParams, Event, PROTOCOL_VERSION, Request, Response,
    ServerFrame, TurnEvent, chat_send_request, connect_request,
};
