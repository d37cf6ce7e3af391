//! Feishu Open Platform API client.
//!
//! Each role posts as its own bot app, so tenant access tokens are cached
//! per app id. Message delivery is best-effort: failures are logged and
//! reported as `false`, never propagated — a lost group message must not
//! take down the session or orchestration that produced it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::roles::RoleConfig;

const DEFAULT_BASE_URL: &str = "https://open.feishu.cn/open-apis";

/// Tokens are refreshed this long before their reported expiry.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Delivery attempts per message.
const SEND_ATTEMPTS: u32 = 3;

/// Errors from the Feishu API. Absorbed inside [`FeishuClient`]'s public
/// methods; exposed for logging detail only.
#[derive(Debug, Error)]
pub enum FeishuError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Feishu API error: {msg} (code {code})")]
    Api { code: i64, msg: String },

    #[error("no tenant token available for app {0}")]
    NoToken(String),
}

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Client for sending group messages as role bots.
#[derive(Clone)]
pub struct FeishuClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<DashMap<String, CachedToken>>,
}

impl Default for FeishuClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FeishuClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Point the client at a different API base. Used by tests.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            tokens: Arc::new(DashMap::new()),
        }
    }

    /// Send a text message to a group chat as the given role's bot.
    ///
    /// Retries transient failures a few times, then gives up. Returns
    /// whether delivery succeeded.
    pub async fn send_message_as_role(
        &self,
        role: &RoleConfig,
        chat_id: &str,
        text: &str,
    ) -> bool {
        for attempt in 1..=SEND_ATTEMPTS {
            match self.send_text(role, chat_id, text).await {
                Ok(()) => return true,
                Err(err) => {
                    warn!(
                        "send as {} failed (attempt {attempt}/{SEND_ATTEMPTS}): {err}",
                        role.display_name
                    );
                    if attempt < SEND_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                    }
                }
            }
        }
        error!(
            "giving up sending to {chat_id} as {} after {SEND_ATTEMPTS} attempts",
            role.display_name
        );
        false
    }

    async fn send_text(
        &self,
        role: &RoleConfig,
        chat_id: &str,
        text: &str,
    ) -> Result<(), FeishuError> {
        let token = self.tenant_token(&role.app_id, &role.app_secret).await?;

        let body: ApiStatus = self
            .http
            .post(format!("{}/im/v1/messages", self.base_url))
            .query(&[("receive_id_type", "chat_id")])
            .bearer_auth(token)
            .json(&json!({
                "receive_id": chat_id,
                "msg_type": "text",
                "content": json!({"text": text}).to_string(),
            }))
            .send()
            .await?
            .json()
            .await?;

        if body.code != 0 {
            return Err(FeishuError::Api {
                code: body.code,
                msg: body.msg,
            });
        }
        Ok(())
    }

    /// Tenant access token for one app, cached until shortly before expiry.
    async fn tenant_token(&self, app_id: &str, app_secret: &str) -> Result<String, FeishuError> {
        if let Some(cached) = self.tokens.get(app_id)
            && cached.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN
        {
            return Ok(cached.token.clone());
        }

        let body: TokenResponse = self
            .http
            .post(format!(
                "{}/auth/v3/tenant_access_token/internal",
                self.base_url
            ))
            .json(&json!({"app_id": app_id, "app_secret": app_secret}))
            .send()
            .await?
            .json()
            .await?;

        if body.code != 0 {
            error!("token fetch failed for app {app_id}: {} ({})", body.msg, body.code);
            return Err(FeishuError::NoToken(app_id.to_string()));
        }

        let token = body.tenant_access_token;
        self.tokens.insert(
            app_id.to_string(),
            CachedToken {
                token: token.clone(),
                expires_at: Instant::now() + Duration::from_secs(body.expire),
            },
        );
        info!("refreshed tenant token for app {app_id}");
        Ok(token)
    }
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    tenant_access_token: String,
    #[serde(default = "default_expire")]
    expire: u64,
}

fn default_expire() -> u64 {
    7200
}
