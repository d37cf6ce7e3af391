//! The delegation loop.
//!
//! One coordinating role drives multi-role task execution: it analyzes the
//! task, delegates to one role at a time, folds each result back into its
//! context and decides the next step, until it declares completion or the
//! round budget runs out.
//!
//! The coordinator is an agent, not a strict protocol peer, so two error
//! classes are handled by feeding corrective context into the next round
//! instead of aborting: unparseable output and delegation to an unknown
//! role. Neither gets a separate retry budget — the shared round counter
//! bounds everything, so a stuck coordinator cannot loop forever on parse
//! errors alone.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info, warn};

use crewline_protocol::coordination::{Decision, parse_decision};

use crate::feishu::FeishuClient;
use crate::gateway::{GatewayClient, NullSink};
use crate::roles::{RoleConfig, RoleEngine, RoleRegistry};

/// How much of a malformed coordinator reply is quoted back in the repair
/// context.
const REPAIR_QUOTE_CHARS: usize = 300;

/// Calls into role agents on behalf of the orchestrator.
#[async_trait]
pub trait RoleCaller: Send + Sync {
    /// One coordinator turn over the persistent orchestration session.
    async fn call_coordinator(&self, session_key: &str, context: &str) -> Option<String>;

    /// Run a delegated task on the named role, returning its report.
    async fn run_role_task(
        &self,
        role_id: &str,
        instruction: &str,
        task_id: &str,
        chat_id: &str,
    ) -> Option<String>;
}

/// Posts messages to the group chat as a role's bot. Best-effort.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, role: &RoleConfig, chat_id: &str, text: &str) -> bool;
}

#[async_trait]
impl Notifier for FeishuClient {
    async fn notify(&self, role: &RoleConfig, chat_id: &str, text: &str) -> bool {
        self.send_message_as_role(role, chat_id, text).await
    }
}

/// Production [`RoleCaller`] backed by the gateway and the role engines.
pub struct GatewayRoleCaller {
    gateway: GatewayClient,
    engines: Arc<HashMap<String, Arc<RoleEngine>>>,
    session_timeout: Duration,
}

impl GatewayRoleCaller {
    pub fn new(
        gateway: GatewayClient,
        engines: Arc<HashMap<String, Arc<RoleEngine>>>,
        session_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            engines,
            session_timeout,
        }
    }
}

#[async_trait]
impl RoleCaller for GatewayRoleCaller {
    async fn call_coordinator(&self, session_key: &str, context: &str) -> Option<String> {
        self.gateway
            .run_session(session_key, context, &NullSink, self.session_timeout)
            .await
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
    }

    async fn run_role_task(
        &self,
        role_id: &str,
        instruction: &str,
        task_id: &str,
        chat_id: &str,
    ) -> Option<String> {
        let engine = self.engines.get(role_id)?;
        engine.execute_task(instruction, task_id, chat_id).await
    }
}

/// The coordination state machine.
pub struct Orchestrator {
    registry: Arc<RoleRegistry>,
    caller: Arc<dyn RoleCaller>,
    notifier: Arc<dyn Notifier>,
    max_rounds: u32,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<RoleRegistry>,
        caller: Arc<dyn RoleCaller>,
        notifier: Arc<dyn Notifier>,
        max_rounds: u32,
    ) -> Self {
        Self {
            registry,
            caller,
            notifier,
            max_rounds,
        }
    }

    /// Run one task to completion (or to the round budget).
    pub async fn run(&self, task_description: &str, sender_id: &str, chat_id: &str, task_id: &str) {
        let Some(coordinator) = self.registry.coordinator() else {
            error!("coordinator role not configured; dropping task {task_id}");
            return;
        };

        info!("task {task_id} from {sender_id}: {}", task_description);

        self.notifier
            .notify(
                &coordinator,
                chat_id,
                &format!(
                    "{} Task received — analyzing and lining up the team...",
                    coordinator.emoji
                ),
            )
            .await;

        // Stable across the whole task so the coordination session keeps
        // its memory between rounds.
        let session_key = format!(
            "feishu:role:{}:orchestrate:{}",
            coordinator.role_id, task_id
        );

        let mut context = self.initial_context(&coordinator, task_description);

        for round in 1..=self.max_rounds {
            info!("[orchestrator] round {round}/{} for task {task_id}", self.max_rounds);

            let Some(decision_text) = self.caller.call_coordinator(&session_key, &context).await
            else {
                self.notifier
                    .notify(
                        &coordinator,
                        chat_id,
                        &format!(
                            "{} ⚠️ Coordination hit a problem, please try again later.",
                            coordinator.emoji
                        ),
                    )
                    .await;
                return;
            };

            let Some(decision) = parse_decision(&decision_text) else {
                warn!(
                    "[orchestrator] failed to parse decision: {}",
                    quote(&decision_text, 200)
                );
                context = repair_context(&decision_text);
                continue;
            };

            match decision {
                Decision::Complete { summary } => {
                    self.notifier
                        .notify(
                            &coordinator,
                            chat_id,
                            &format!("{} Task complete!\n\n{summary}", coordinator.emoji),
                        )
                        .await;
                    info!("[orchestrator] task {task_id} completed in {round} rounds");
                    return;
                }
                Decision::Delegate { role, instruction } => {
                    let Some(target) = self.registry.get(&role) else {
                        context = format!(
                            "Invalid role_id '{role}'. Valid roles: {}. Please try again.",
                            self.registry.role_ids().join(", ")
                        );
                        continue;
                    };

                    self.notifier
                        .notify(
                            &coordinator,
                            chat_id,
                            &format!(
                                "{} @{} {instruction}",
                                coordinator.emoji, target.display_name
                            ),
                        )
                        .await;

                    let result = self
                        .caller
                        .run_role_task(&role, &instruction, task_id, chat_id)
                        .await
                        .unwrap_or_else(|| "(No output from this role)".to_string());

                    context = format!(
                        "[RESULT FROM {}]\n{result}\n\n\
                         Based on this result, decide the next step. \
                         Respond with a JSON action (delegate or complete).",
                        target.display_name
                    );
                }
            }
        }

        self.notifier
            .notify(
                &coordinator,
                chat_id,
                &format!(
                    "{} ⚠️ Coordination reached the maximum number of rounds ({}). \
                     Task paused — please check progress.",
                    coordinator.emoji, self.max_rounds
                ),
            )
            .await;
    }

    fn initial_context(&self, coordinator: &RoleConfig, task_description: &str) -> String {
        let available_roles = self
            .registry
            .iter()
            .filter(|r| r.role_id != coordinator.role_id)
            .map(|r| format!("- role_id: \"{}\" | name: {} {}", r.role_id, r.display_name, r.emoji))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "You are {name} at ClawCompany. Your job is to coordinate a team to complete a task.\n\
             {prompt}\n\n\
             [AVAILABLE TEAM MEMBERS]\n{available_roles}\n\n\
             [COORDINATION RULES]\n\
             1. Analyze the task and decide which team member should work on it next.\n\
             2. You must respond with a JSON action. Two possible actions:\n\
             \x20  a) DELEGATE: assign work to a team member\n\
             \x20     {{\"action\": \"delegate\", \"role\": \"<role_id>\", \"instruction\": \"<specific instruction for that role>\"}}\n\
             \x20  b) COMPLETE: task is done, deliver the final result\n\
             \x20     {{\"action\": \"complete\", \"summary\": \"<final report>\"}}\n\
             3. The 'instruction' should be clear and specific. Include references to files or prior results.\n\
             4. You can only delegate to ONE role at a time.\n\
             5. After receiving a role's output, decide the next step.\n\
             6. Keep group messages SHORT and natural, like a real team lead.\n\
             7. ALWAYS respond with valid JSON, nothing else.\n\n\
             [TASK]\n{task}",
            name = coordinator.display_name,
            prompt = coordinator.system_prompt,
            available_roles = available_roles,
            task = task_description,
        )
    }
}

fn repair_context(previous_response: &str) -> String {
    format!(
        "Your previous response was not valid JSON. Please respond with exactly one JSON object:\n\
         Either: {{\"action\": \"delegate\", \"role\": \"<role_id>\", \"instruction\": \"...\"}}\n\
         Or: {{\"action\": \"complete\", \"summary\": \"...\"}}\n\
         Your previous response was: {}",
        quote(previous_response, REPAIR_QUOTE_CHARS)
    )
}

fn quote(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => &text[..cut],
        None => text,
    }
}
