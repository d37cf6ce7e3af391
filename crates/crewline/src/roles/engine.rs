//! Role engine.
//!
//! Processes messages directed at a single role. Two modes:
//!
//! - **Direct chat** — a user @mentions the role; it answers on its own,
//!   without the orchestrator.
//! - **Task execution** — the orchestrator hands the role a piece of work;
//!   the role posts progress and its report to the group, and the report
//!   is also returned for the orchestrator to evaluate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::info;
use serde_json::Value;

use crate::feishu::FeishuClient;
use crate::gateway::{GatewayClient, NullSink, SessionSink};
use crate::roles::registry::{RoleConfig, RoleRegistry};

/// Fallback posted when a direct-chat session produced no text, so the user
/// is never left without an acknowledgement.
const EMPTY_REPLY_NOTICE: &str = "I can't respond right now, please try again later.";

pub struct RoleEngine {
    config: Arc<RoleConfig>,
    registry: Arc<RoleRegistry>,
    gateway: GatewayClient,
    feishu: FeishuClient,
    session_timeout: Duration,
}

impl RoleEngine {
    pub fn new(
        config: Arc<RoleConfig>,
        registry: Arc<RoleRegistry>,
        gateway: GatewayClient,
        feishu: FeishuClient,
        session_timeout: Duration,
    ) -> Self {
        Self {
            config,
            registry,
            gateway,
            feishu,
            session_timeout,
        }
    }

    pub fn config(&self) -> &Arc<RoleConfig> {
        &self.config
    }

    /// Handle a direct @mention from a user to this role.
    pub async fn handle_direct_chat(&self, message: &str, sender_id: &str, chat_id: &str) {
        let session_key = format!("feishu:role:{}:chat:{}", self.config.role_id, chat_id);
        info!(
            "[{}] direct chat from {sender_id} over {session_key}",
            self.config.display_name
        );

        let prompt = self.build_direct_prompt(message);
        let reply = self
            .gateway
            .run_session(&session_key, &prompt, &NullSink, self.session_timeout)
            .await;

        let text = match reply {
            Some(reply) => format!("{} {}", self.config.emoji, reply.trim()),
            None => format!("{} {}", self.config.emoji, EMPTY_REPLY_NOTICE),
        };
        self.feishu
            .send_message_as_role(&self.config, chat_id, &text)
            .await;
    }

    /// Execute a task assigned by the orchestrator.
    ///
    /// Returns the role's report text; this return value is the only
    /// channel by which task results reach the coordination loop.
    pub async fn execute_task(
        &self,
        task_description: &str,
        task_id: &str,
        chat_id: &str,
    ) -> Option<String> {
        let session_key = format!("feishu:role:{}:task:{}", self.config.role_id, task_id);
        info!(
            "[{}] executing task {task_id} over {session_key}",
            self.config.display_name
        );

        let prompt = self.build_task_prompt(task_description);
        let sink = ToolProgressSink {
            feishu: self.feishu.clone(),
            role: self.config.clone(),
            chat_id: chat_id.to_string(),
        };
        let report = self
            .gateway
            .run_session(&session_key, &prompt, &sink, self.session_timeout)
            .await
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());

        if let Some(report) = &report {
            self.feishu
                .send_message_as_role(
                    &self.config,
                    chat_id,
                    &format!("{} {}", self.config.emoji, report),
                )
                .await;
        }

        report
    }

    fn build_direct_prompt(&self, user_message: &str) -> String {
        let colleagues = self
            .registry
            .iter()
            .filter(|r| r.role_id != self.config.role_id)
            .map(|r| format!("- @{}", r.display_name))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "[ROLE IDENTITY]\n\
             You are {name} at ClawCompany.\n\
             {prompt}\n\n\
             [COMMUNICATION STYLE]\n\
             - Reply concisely and clearly, like a real person in a work chat.\n\
             - Do NOT be verbose. Get to the point.\n\
             - If the question is outside your expertise, suggest the user ask the appropriate colleague:\n\
             {colleagues}\n\n\
             [USER MESSAGE]\n\
             {message}",
            name = self.config.display_name,
            prompt = self.config.system_prompt,
            colleagues = colleagues,
            message = user_message,
        )
    }

    fn build_task_prompt(&self, task_description: &str) -> String {
        format!(
            "[ROLE IDENTITY]\n\
             You are {name} at ClawCompany.\n\
             {prompt}\n\n\
             [COMMUNICATION STYLE]\n\
             - Be concise and professional, like a real team member reporting work.\n\
             - Focus on deliverables and results.\n\
             - Do NOT repeat the task description back.\n\
             - Output key findings, decisions, or file paths clearly.\n\n\
             [TASK]\n\
             {task}",
            name = self.config.display_name,
            prompt = self.config.system_prompt,
            task = task_description,
        )
    }
}

/// Sink that turns tool-use events into short progress lines in the group
/// chat. Streamed text is ignored; the engine uses the session's final
/// aggregated text instead.
struct ToolProgressSink {
    feishu: FeishuClient,
    role: Arc<RoleConfig>,
    chat_id: String,
}

#[async_trait]
impl SessionSink for ToolProgressSink {
    async fn on_text(&self, _text: &str) {}

    async fn on_tool_use(&self, tool: &str, args: &Value) {
        if let Some(desc) = describe_tool(tool, args) {
            self.feishu
                .send_message_as_role(&self.role, &self.chat_id, &format!("🔨 {desc}"))
                .await;
        }
    }
}

/// Short human-readable rendering of a tool invocation, or `None` for
/// tools not worth surfacing.
pub fn describe_tool(tool: &str, args: &Value) -> Option<String> {
    fn arg<'a>(args: &'a Value, keys: &[&str]) -> &'a str {
        keys.iter()
            .find_map(|k| args.get(k).and_then(Value::as_str))
            .unwrap_or_default()
    }

    match tool {
        "run_command" | "exec" => {
            let cmd = arg(args, &["command", "CommandLine"]);
            if cmd.is_empty() {
                return None;
            }
            Some(match cmd.char_indices().nth(40) {
                Some((cut, _)) => format!("running: {}...", &cmd[..cut]),
                None => format!("running: {cmd}"),
            })
        }
        "read_file" | "view_file" => {
            let path = arg(args, &["path", "AbsolutePath"]);
            if path.is_empty() {
                return None;
            }
            Some(format!("reading: {}", basename(path)))
        }
        "write_file" | "write_to_file" => {
            let path = arg(args, &["path", "TargetFile"]);
            if path.is_empty() {
                return None;
            }
            Some(format!("writing: {}", basename(path)))
        }
        _ => None,
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
