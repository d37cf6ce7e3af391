//! Role registry.
//!
//! Built once at startup from [`Settings`] and treated as a read-only
//! snapshot for the process lifetime. Looked up by role id (delegation),
//! by Feishu app id (webhook routing) and by the coordinator designation.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::config::{RoleSettings, Settings};

/// Immutable configuration for a single bot role.
#[derive(Debug, Clone)]
pub struct RoleConfig {
    pub role_id: String,
    pub display_name: String,
    pub emoji: String,
    pub app_id: String,
    pub app_secret: String,
    pub system_prompt: String,
}

/// Read-only snapshot of all configured roles.
pub struct RoleRegistry {
    ordered: Vec<Arc<RoleConfig>>,
    by_role_id: HashMap<String, Arc<RoleConfig>>,
    by_app_id: HashMap<String, Arc<RoleConfig>>,
    coordinator_id: String,
}

impl RoleRegistry {
    /// Build the registry from settings, loading prompt files as needed.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut ordered = Vec::with_capacity(settings.roles.len());
        let mut by_role_id = HashMap::new();
        let mut by_app_id = HashMap::new();

        for role in &settings.roles {
            let config = Arc::new(RoleConfig {
                role_id: role.id.clone(),
                display_name: role.display_name.clone(),
                emoji: role.emoji.clone(),
                app_id: role.app_id.clone(),
                app_secret: role.app_secret.clone(),
                system_prompt: load_system_prompt(role)?,
            });

            if by_role_id
                .insert(config.role_id.clone(), config.clone())
                .is_some()
            {
                warn!("duplicate role id '{}' in configuration", config.role_id);
            }
            by_app_id.insert(config.app_id.clone(), config.clone());
            info!(
                "registered role: {} {} (app_id={}...)",
                config.emoji,
                config.display_name,
                truncate_id(&config.app_id)
            );
            ordered.push(config);
        }

        info!("role registry built: {} roles active", ordered.len());

        Ok(Self {
            ordered,
            by_role_id,
            by_app_id,
            coordinator_id: settings.orchestrator.coordinator.clone(),
        })
    }

    /// Look up a role by its stable identifier.
    pub fn get(&self, role_id: &str) -> Option<Arc<RoleConfig>> {
        self.by_role_id.get(role_id).cloned()
    }

    /// Look up a role by its Feishu app id.
    pub fn by_app_id(&self, app_id: &str) -> Option<Arc<RoleConfig>> {
        self.by_app_id.get(app_id).cloned()
    }

    /// The designated coordinating role, if configured and present.
    pub fn coordinator(&self) -> Option<Arc<RoleConfig>> {
        self.get(&self.coordinator_id)
    }

    pub fn coordinator_id(&self) -> &str {
        &self.coordinator_id
    }

    /// All roles in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<RoleConfig>> {
        self.ordered.iter()
    }

    pub fn role_ids(&self) -> Vec<&str> {
        self.ordered.iter().map(|r| r.role_id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}

fn load_system_prompt(role: &RoleSettings) -> Result<String> {
    if let Some(path) = &role.prompt_file {
        return std::fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .with_context(|| format!("reading prompt file for role '{}'", role.id));
    }
    if let Some(prompt) = &role.system_prompt
        && !prompt.trim().is_empty()
    {
        return Ok(prompt.trim().to_string());
    }
    Ok(format!("You are {}.", role.display_name))
}

fn truncate_id(id: &str) -> &str {
    &id[..id.len().min(8)]
}
