//! OAuth token handling
//!
//! Access tokens are refreshed once the cached expiry (minus a skew) has
//! passed. The refreshed tokens are sealed and written back onto the account
//! before the provider call goes ahead.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use kindling_common::config::OAuthClientConfig;
use kindling_common::types::AccountId;
use kindling_common::{Error, Result};
use kindling_storage::AccountRepository;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{http_error, status_error};
use crate::vault::{AccountSecrets, CredentialVault, OAuthTokens};

/// Supplies a bearer token for provider API calls
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl TokenResponse {
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.expires_in.map(|secs| now + Duration::seconds(secs))
    }
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Token endpoint client for one OAuth application
#[derive(Clone)]
pub struct OAuthClient {
    http: reqwest::Client,
    config: OAuthClientConfig,
}

impl OAuthClient {
    pub fn new(http: reqwest::Client, config: OAuthClientConfig) -> Self {
        Self { http, config }
    }

    /// Exchange an authorization code from the consent redirect
    pub async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenResponse> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
        ])
        .await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
        ])
        .await
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let response = self
            .http
            .post(&self.config.token_url)
            .form(form)
            .send()
            .await
            .map_err(http_error)?;

        let status = response.status();
        let body = response.text().await.map_err(http_error)?;
        if !status.is_success() {
            return Err(token_error(status, &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| Error::Transport(format!("Malformed token response: {}", e)))
    }
}

/// `invalid_grant` and `unauthorized_client` mean the grant is gone
pub(crate) fn token_error(status: reqwest::StatusCode, body: &str) -> Error {
    match serde_json::from_str::<TokenErrorResponse>(body) {
        Ok(e) if matches!(e.error.as_str(), "invalid_grant" | "unauthorized_client") => {
            Error::Auth(format!(
                "OAuth grant rejected: {}",
                e.error_description.unwrap_or(e.error)
            ))
        }
        _ => status_error(status, body),
    }
}

struct CachedTokens {
    tokens: OAuthTokens,
    expires_at: Option<DateTime<Utc>>,
}

/// Per-account token source backed by a stored refresh token
pub struct OAuthTokenSource {
    client: OAuthClient,
    account_id: AccountId,
    skew: Duration,
    vault: Arc<dyn CredentialVault>,
    accounts: Arc<dyn AccountRepository>,
    cached: Mutex<CachedTokens>,
}

impl OAuthTokenSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: reqwest::Client,
        config: OAuthClientConfig,
        account_id: AccountId,
        tokens: OAuthTokens,
        expires_at: Option<DateTime<Utc>>,
        skew_secs: i64,
        vault: Arc<dyn CredentialVault>,
        accounts: Arc<dyn AccountRepository>,
    ) -> Self {
        Self {
            client: OAuthClient::new(http, config),
            account_id,
            skew: Duration::seconds(skew_secs),
            vault,
            accounts,
            cached: Mutex::new(CachedTokens { tokens, expires_at }),
        }
    }
}

#[async_trait]
impl TokenSource for OAuthTokenSource {
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now();

        let fresh = cached
            .expires_at
            .map_or(true, |expires_at| now + self.skew < expires_at);
        if fresh {
            return Ok(cached.tokens.access_token.clone());
        }

        let refresh_token = cached.tokens.refresh_token.clone().ok_or_else(|| {
            Error::Auth("Access token expired and no refresh token is stored".to_string())
        })?;

        debug!(account_id = %self.account_id, "Refreshing OAuth access token");
        let response = self.client.refresh(&refresh_token).await?;

        let tokens = OAuthTokens {
            access_token: response.access_token.clone(),
            refresh_token: response.refresh_token.clone().or(Some(refresh_token)),
        };
        let expires_at = response.expires_at(now);

        let sealed = self.vault.seal_secrets(&AccountSecrets::OAuth(tokens.clone()))?;
        self.accounts
            .update_credentials(self.account_id, &sealed, expires_at)
            .await?;

        info!(account_id = %self.account_id, "OAuth access token refreshed");
        *cached = CachedTokens { tokens, expires_at };
        Ok(response.access_token)
    }
}

/// Fixed token, for tests and short-lived tools
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}
