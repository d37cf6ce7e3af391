//! Inbound event routing.
//!
//! Feishu delivers an event to the app whose bot was @mentioned, so the
//! `app_id` in the event header is the primary routing key.

use std::sync::Arc;

use log::{info, warn};
use serde_json::Value;

use crate::roles::{RoleConfig, RoleRegistry};

/// Status-query phrases that keep a coordinator message in direct-chat
/// mode instead of starting an orchestration run.
const STATUS_KEYWORDS: &[&str] = &["status", "progress", "report", "update"];

/// Determine which role should handle this webhook event.
pub fn identify_target_role(registry: &RoleRegistry, data: &Value) -> Option<Arc<RoleConfig>> {
    let app_id = data
        .pointer("/header/app_id")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if app_id.is_empty() {
        warn!("no app_id found in webhook header");
        return None;
    }

    match registry.by_app_id(app_id) {
        Some(role) => {
            info!("routed to {} {} via app_id", role.emoji, role.display_name);
            Some(role)
        }
        None => {
            warn!("unknown app_id in webhook: {app_id}");
            None
        }
    }
}

/// Whether this message should start an orchestration run.
///
/// Only messages to the coordinator qualify, and short status queries
/// still go to direct chat.
pub fn is_task_trigger(role: &RoleConfig, coordinator_id: &str, message_text: &str) -> bool {
    if role.role_id != coordinator_id {
        return false;
    }

    let text = message_text.trim().to_lowercase();
    for keyword in STATUS_KEYWORDS {
        if text == *keyword
            || text == format!("check {keyword}")
            || text == format!("show {keyword}")
        {
            return false;
        }
    }

    true
}
