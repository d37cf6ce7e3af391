//! HTTP server and shared application state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::info;
use serde_json::{Value, json};

use crate::config::Settings;
use crate::feishu::{EventDeduper, FeishuClient, webhook};
use crate::gateway::GatewayClient;
use crate::orchestrator::{GatewayRoleCaller, Orchestrator};
use crate::roles::{RoleEngine, RoleRegistry};
use crate::tasks::TaskTracker;

/// Everything the handlers need, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: Arc<RoleRegistry>,
    pub engines: Arc<HashMap<String, Arc<RoleEngine>>>,
    pub gateway: GatewayClient,
    pub feishu: FeishuClient,
    pub tracker: TaskTracker,
    pub deduper: Arc<EventDeduper>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(settings: Settings) -> Result<Self> {
        if settings.roles.is_empty() {
            bail!("no roles configured; add [[roles]] entries to the configuration");
        }

        let settings = Arc::new(settings);
        let registry = Arc::new(RoleRegistry::from_settings(&settings)?);
        if registry.coordinator().is_none() {
            bail!(
                "coordinator role '{}' is not among the configured roles",
                registry.coordinator_id()
            );
        }

        let gateway = GatewayClient::from_settings(&settings.gateway);
        let feishu = FeishuClient::new();
        let session_timeout = Duration::from_secs(settings.gateway.session_timeout_secs);

        let engines: Arc<HashMap<String, Arc<RoleEngine>>> = Arc::new(
            registry
                .iter()
                .map(|role| {
                    (
                        role.role_id.clone(),
                        Arc::new(RoleEngine::new(
                            role.clone(),
                            registry.clone(),
                            gateway.clone(),
                            feishu.clone(),
                            session_timeout,
                        )),
                    )
                })
                .collect(),
        );

        let caller = Arc::new(GatewayRoleCaller::new(
            gateway.clone(),
            engines.clone(),
            session_timeout,
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            caller,
            Arc::new(feishu.clone()),
            settings.orchestrator.max_rounds,
        ));

        info!(
            "bridge initialized: {} roles, coordinator '{}'",
            registry.len(),
            registry.coordinator_id()
        );

        Ok(Self {
            settings,
            registry,
            engines,
            gateway,
            feishu,
            tracker: TaskTracker::new(),
            deduper: Arc::new(EventDeduper::new()),
            orchestrator,
        })
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook::handle_webhook))
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let roles: Vec<Value> = state
        .registry
        .iter()
        .map(|role| {
            json!({
                "id": role.role_id,
                "name": role.display_name,
                "emoji": role.emoji,
            })
        })
        .collect();

    Json(json!({
        "status": "ok",
        "service": "crewline",
        "active_roles": roles.len(),
        "roles": roles,
    }))
}
