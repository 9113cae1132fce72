// ABOUTME: Bearer token provider backed by a refreshable Supabase session
// ABOUTME: Forces a session refresh on demand and persists rotated refresh tokens

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::RemoteConfig;

/// Source of bearer tokens for batch calls.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Refresh the session and return its access token.
    ///
    /// `None` means there is no session or the refresh failed; the caller
    /// should treat the session as expired.
    async fn fresh_token(&self) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds
    #[serde(default)]
    pub expires_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
}

impl From<TokenResponse> for Session {
    fn from(resp: TokenResponse) -> Self {
        let expires_at = resp.expires_at.or_else(|| {
            resp.expires_in
                .map(|secs| chrono::Utc::now().timestamp() + secs)
        });
        Session {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            expires_at,
        }
    }
}

pub struct SessionTokenProvider {
    client: Client,
    token_url: String,
    anon_key: String,
    session: RwLock<Option<Session>>,
    session_file: Option<PathBuf>,
}

impl SessionTokenProvider {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        let stored = match &config.session_file {
            Some(path) => load_session(path)?,
            None => None,
        };
        let session = stored.or_else(|| {
            config.refresh_token.clone().map(|refresh_token| Session {
                access_token: String::new(),
                refresh_token,
                expires_at: None,
            })
        });

        Ok(Self {
            client,
            token_url: format!(
                "{}/auth/v1/token?grant_type=refresh_token",
                config.supabase_url.trim_end_matches('/')
            ),
            anon_key: config.anon_key.clone(),
            session: RwLock::new(session),
            session_file: config.session_file.clone(),
        })
    }

    /// Access token of the stored session, without refreshing it.
    pub async fn current_token(&self) -> Option<String> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.access_token.clone())
            .filter(|t| !t.is_empty())
    }

    pub async fn has_session(&self) -> bool {
        self.session.read().await.is_some()
    }

    /// Exchange `refresh_token` for a new session.
    ///
    /// `Ok(None)` when the auth server refuses the token.
    async fn refresh(&self, refresh_token: &str) -> Result<Option<Session>> {
        let response = self
            .client
            .post(&self.token_url)
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .context("Failed to reach the auth server")?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Session refresh refused: {}", body);
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Session refresh failed with status {}: {}", status, body);
        }

        let token: TokenResponse = response
            .json()
            .await
            .context("Failed to parse session refresh response")?;
        Ok(Some(token.into()))
    }

    fn persist(&self, session: Option<&Session>) {
        let Some(path) = &self.session_file else {
            return;
        };
        if let Err(e) = save_session(path, session) {
            warn!("Failed to persist session to {}: {:#}", path.display(), e);
        }
    }
}

#[async_trait]
impl TokenProvider for SessionTokenProvider {
    async fn fresh_token(&self) -> Option<String> {
        let mut guard = self.session.write().await;
        let refresh_token = match guard.as_ref() {
            Some(session) => session.refresh_token.clone(),
            None => {
                debug!("No session available for token refresh");
                return None;
            }
        };

        match self.refresh(&refresh_token).await {
            Ok(Some(session)) => {
                let token = session.access_token.clone();
                self.persist(Some(&session));
                *guard = Some(session);
                debug!("Session refreshed");
                Some(token)
            }
            Ok(None) => {
                info!("Refresh token was refused, clearing session");
                *guard = None;
                self.persist(None);
                None
            }
            Err(e) => {
                warn!("Session refresh failed: {:#}", e);
                None
            }
        }
    }
}

fn load_session(path: &Path) -> Result<Option<Session>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read session file {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let session = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse session file {}", path.display()))?;
    Ok(Some(session))
}

fn save_session(path: &Path, session: Option<&Session>) -> Result<()> {
    match session {
        Some(session) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, serde_json::to_vec_pretty(session)?)?;
        }
        None => {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
    }
    Ok(())
}
