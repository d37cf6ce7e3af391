//! Service configuration.
//!
//! Settings load from an optional TOML file plus `CREWLINE_`-prefixed
//! environment variables (`CREWLINE_GATEWAY__TOKEN` overrides
//! `gateway.token`, and so on). Role credentials live in the `[[roles]]`
//! table array; prompts may be inline or loaded from a file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

/// Top-level settings for the bridge.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    #[serde(default)]
    pub roles: Vec<RoleSettings>,
}

/// Agent gateway connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    /// Gateway base URL; http(s) is rewritten to ws(s) for the connection.
    #[serde(default = "default_gateway_url")]
    pub url: String,
    /// Gateway auth token, sent in the connect handshake.
    #[serde(default)]
    pub token: String,
    /// Overall per-session budget for the event loop, in seconds.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            url: default_gateway_url(),
            token: String::new(),
            session_timeout_secs: default_session_timeout_secs(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Delegation loop settings.
#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorSettings {
    /// Role id of the coordinating role.
    #[serde(default = "default_coordinator")]
    pub coordinator: String,
    /// Hard cap on coordination rounds per task.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            coordinator: default_coordinator(),
            max_rounds: default_max_rounds(),
        }
    }
}

/// One role's identity and credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct RoleSettings {
    /// Stable role identifier (used in session keys and delegation).
    pub id: String,
    /// Display name used in group chat messages.
    pub display_name: String,
    /// Short identity marker prefixed to the role's posts.
    #[serde(default)]
    pub emoji: String,
    /// Feishu app credentials for this role's bot.
    pub app_id: String,
    pub app_secret: String,
    /// Inline system prompt. Ignored when `prompt_file` is set.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Path to a prompt file loaded at registry build time.
    #[serde(default)]
    pub prompt_file: Option<PathBuf>,
}

fn default_gateway_url() -> String {
    "http://127.0.0.1:18789".to_string()
}

fn default_session_timeout_secs() -> u64 {
    1800
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_coordinator() -> String {
    "ceo_assistant".to_string()
}

fn default_max_rounds() -> u32 {
    20
}

impl Settings {
    /// Load settings from the given file (or the default `crewline.toml`
    /// if present) plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        builder = match path {
            Some(path) => builder.add_source(File::from(path).format(FileFormat::Toml)),
            None => builder.add_source(File::with_name("crewline").required(false)),
        };

        let cfg = builder
            .add_source(Environment::with_prefix("CREWLINE").separator("__"))
            .build()
            .context("loading configuration")?;

        cfg.try_deserialize().context("parsing configuration")
    }
}
