//! Unified Feishu webhook endpoint.
//!
//! All role bots share one endpoint; routing is done by the `app_id` in
//! the event header. Feishu retries webhook delivery, so events are
//! de-duplicated by event id before dispatch.

use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::State;
use dashmap::DashMap;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::router::{identify_target_role, is_task_trigger};
use crate::server::AppState;

/// Seen event ids are kept this long.
const EVENT_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Cache size that triggers a prune of expired entries.
const EVENT_CACHE_PRUNE_LEN: usize = 1000;

/// Webhook event-id de-duplication cache.
#[derive(Default)]
pub struct EventDeduper {
    seen: DashMap<String, Instant>,
}

impl EventDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event id. Returns `false` when it was already seen.
    pub fn insert(&self, event_id: &str) -> bool {
        if self.seen.contains_key(event_id) {
            return false;
        }
        self.seen.insert(event_id.to_string(), Instant::now());
        if self.seen.len() > EVENT_CACHE_PRUNE_LEN {
            let cutoff = Instant::now() - EVENT_CACHE_TTL;
            self.seen.retain(|_, seen_at| *seen_at > cutoff);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Main webhook handler for all Feishu bot events.
pub async fn handle_webhook(State(state): State<AppState>, Json(data): Json<Value>) -> Json<Value> {
    // Challenge verification during endpoint registration.
    if let Some(challenge) = data.get("challenge") {
        return Json(json!({"challenge": challenge}));
    }

    // Idempotency: Feishu redelivers on slow responses.
    if let Some(event_id) = data.pointer("/header/event_id").and_then(Value::as_str)
        && !state.deduper.insert(event_id)
    {
        debug!("duplicate event {event_id} ignored");
        return Json(json!({"status": "success"}));
    }

    let event_type = data
        .pointer("/header/event_type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if event_type != "im.message.receive_v1" {
        info!("ignoring event type: {event_type}");
        return Json(json!({"status": "skipped"}));
    }

    let Some(role) = identify_target_role(&state.registry, &data) else {
        warn!("no matching role for this webhook event");
        return Json(json!({"status": "no_role"}));
    };

    let Some(incoming) = extract_message(&data) else {
        return Json(json!({"status": "success"}));
    };

    info!(
        "[{} {}] message from {} in {}: {}",
        role.emoji,
        role.display_name,
        incoming.sender_id,
        incoming.chat_id,
        truncate(&incoming.text, 100)
    );

    if is_task_trigger(&role, state.registry.coordinator_id(), &incoming.text) {
        // Task mode: the coordinator orchestrates the team.
        let task_id = format!("task_{}", Uuid::new_v4().simple());
        let tracker_key = task_id.clone();
        let orchestrator = state.orchestrator.clone();
        info!("starting orchestration task {task_id}");
        state.tracker.spawn_background(&tracker_key, async move {
            orchestrator
                .run(
                    &incoming.text,
                    &incoming.sender_id,
                    &incoming.chat_id,
                    &task_id,
                )
                .await;
        });
    } else if let Some(engine) = state.engines.get(&role.role_id).cloned() {
        // Direct chat: the role answers independently. One live turn per
        // (role, chat) pair.
        let session_id = format!("{}:{}", role.role_id, incoming.chat_id);
        state.tracker.spawn_chat(&session_id, async move {
            engine
                .handle_direct_chat(&incoming.text, &incoming.sender_id, &incoming.chat_id)
                .await;
        });
    }

    Json(json!({"status": "success"}))
}

struct IncomingMessage {
    text: String,
    sender_id: String,
    chat_id: String,
}

/// Pull the pieces the bridge needs out of an `im.message.receive_v1`
/// event. Non-text messages and empty texts are dropped.
fn extract_message(data: &Value) -> Option<IncomingMessage> {
    let message = data.pointer("/event/message")?;

    let msg_type = message
        .get("message_type")
        .and_then(Value::as_str)
        .unwrap_or("text");
    if msg_type != "text" {
        info!("ignoring non-text message type: {msg_type}");
        return None;
    }

    let chat_id = message.get("chat_id").and_then(Value::as_str)?.to_string();

    let sender = data.pointer("/event/sender/sender_id");
    let sender_id = ["user_id", "open_id", "union_id"]
        .iter()
        .find_map(|key| sender?.get(*key)?.as_str().filter(|s| !s.is_empty()))
        .unwrap_or("unknown")
        .to_string();

    // The content field is itself a JSON string.
    let content = message.get("content").and_then(Value::as_str)?;
    let content: Value = serde_json::from_str(content).ok()?;
    let text = content.get("text").and_then(Value::as_str)?.trim();
    if text.is_empty() {
        return None;
    }

    let text = strip_mention_prefix(text);
    if text.is_empty() {
        return None;
    }

    Some(IncomingMessage {
        text,
        sender_id,
        chat_id,
    })
}

static INTERNAL_MENTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@_user_\d+\s*").expect("valid regex"));

static DISPLAY_MENTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"@\S+\s*").expect("valid regex"));

/// Strip the @BotName mention prefix Feishu puts at the start of group
/// messages that mention a bot.
fn strip_mention_prefix(text: &str) -> String {
    let cleaned = INTERNAL_MENTION.replace_all(text, "");
    let cleaned = DISPLAY_MENTION.replace(cleaned.trim(), "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        text.trim().to_string()
    } else {
        cleaned.to_string()
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => &text[..cut],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deduper() {
        let deduper = EventDeduper::new();
        assert!(deduper.insert("evt-1"));
        assert!(!deduper.insert("evt-1"));
        assert!(deduper.insert("evt-2"));
        assert_eq!(deduper.len(), 2);
    }

    #[test]
    fn test_strip_internal_mentions() {
        assert_eq!(strip_mention_prefix("@_user_1 build the site"), "build the site");
        assert_eq!(
            strip_mention_prefix("@_user_1 @_user_2 status please"),
            "status please"
        );
    }

    #[test]
    fn test_strip_display_mention() {
        assert_eq!(strip_mention_prefix("@CTO how is the rollout?"), "how is the rollout?");
    }

    #[test]
    fn test_mention_only_falls_back_to_original() {
        assert_eq!(strip_mention_prefix("@_user_1"), "@_user_1");
    }

    #[test]
    fn test_extract_message() {
        let data = serde_json::json!({
            "header": {"event_type": "im.message.receive_v1", "app_id": "cli_a"},
            "event": {
                "message": {
                    "message_type": "text",
                    "chat_id": "oc_123",
                    "content": "{\"text\": \"@_user_1 write a status page\"}",
                },
                "sender": {"sender_id": {"open_id": "ou_9"}},
            },
        });

        let msg = extract_message(&data).unwrap();
        assert_eq!(msg.text, "write a status page");
        assert_eq!(msg.chat_id, "oc_123");
        assert_eq!(msg.sender_id, "ou_9");
    }

    #[test]
    fn test_extract_ignores_non_text() {
        let data = serde_json::json!({
            "event": {
                "message": {"message_type": "image", "chat_id": "oc_123", "content": "{}"},
                "sender": {"sender_id": {"open_id": "ou_9"}},
            },
        });
        assert!(extract_message(&data).is_none());
    }
}
