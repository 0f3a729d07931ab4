//! OAuth bearer-token cache with serialized refresh.

use parking_lot::RwLock;
use serde::Deserialize;
use snafu::ResultExt;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::info;

use crate::error::HttpSnafu;
use crate::error::OAuthSnafu;
use crate::error::Result;

/// How the worker proves its identity to the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    /// `grant_type=refresh_token` with a long-lived offline token.
    RefreshToken { offline_token: String },
    /// `grant_type=client_credentials` with a client secret.
    ClientCredentials { client_secret: String },
}

/// Token endpoint settings.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub token_url: String,
    pub client_id: String,
    pub grant: Grant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Holds the current access token.
///
/// Reads are lock-free for practical purposes (a `parking_lot` read lock is
/// never held across an await). Refreshes serialize on an async mutex so that
/// concurrent lanes hitting a 401 at the same time exchange the token once.
pub struct TokenCache {
    config: OAuthConfig,
    http: reqwest::Client,
    token: RwLock<Option<String>>,
    refresh_lock: Mutex<()>,
}

impl TokenCache {
    pub fn new(config: OAuthConfig, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            token: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Current token, if one was acquired.
    pub fn current(&self) -> Option<String> {
        self.token.read().clone()
    }

    /// Replace `stale` with a fresh token.
    ///
    /// When another task refreshed while this one waited for the lock, the
    /// token it obtained is returned without a second exchange.
    pub async fn refresh(&self, stale: Option<&str>) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;

        if let Some(current) = self.current() {
            if Some(current.as_str()) != stale {
                debug!("token refreshed concurrently, reusing it");
                return Ok(current);
            }
        }

        let token = self.exchange().await?;
        *self.token.write() = Some(token.clone());
        info!(token_url = %self.config.token_url, "acquired new access token");
        Ok(token)
    }

    async fn exchange(&self) -> Result<String> {
        let form: Vec<(&str, &str)> = match &self.config.grant {
            Grant::RefreshToken { offline_token } => vec![
                ("grant_type", "refresh_token"),
                ("client_id", &self.config.client_id),
                ("refresh_token", offline_token),
            ],
            Grant::ClientCredentials { client_secret } => vec![
                ("grant_type", "client_credentials"),
                ("client_id", &self.config.client_id),
                ("client_secret", client_secret),
            ],
        };

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&form)
            .send()
            .await
            .context(HttpSnafu {
                url: self.config.token_url.clone(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return OAuthSnafu {
                reason: format!("token endpoint returned {status}: {body}"),
            }
            .fail();
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            OAuthSnafu {
                reason: format!("malformed token response: {e}"),
            }
            .build()
        })?;
        Ok(token.access_token)
    }
}
