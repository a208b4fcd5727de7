//! Google Workspace domain-wide delegation
//!
//! A service account signs an RS256 assertion naming the mailbox it acts
//! for and trades it at the token endpoint for a short-lived access token.
//! Tokens are cached per (service account, subject).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use kindling_common::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::oauth::{token_error, TokenResponse, TokenSource};
use super::{check_status, http_error};
use crate::vault::ServiceAccountKey;

pub const GMAIL_SCOPE: &str = "https://mail.google.com/";
pub const DIRECTORY_SCOPE: &str = "https://www.googleapis.com/auth/admin.directory.user.readonly";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    sub: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// Validate an uploaded service-account key file
pub fn parse_service_account(json: &str) -> Result<ServiceAccountKey> {
    let key: ServiceAccountKey = serde_json::from_str(json)
        .map_err(|e| Error::Validation(format!("Invalid service account JSON: {}", e)))?;

    let missing: Vec<&str> = [
        ("private_key", key.private_key.trim().is_empty()),
        ("client_email", key.client_email.trim().is_empty()),
        ("client_id", key.client_id.trim().is_empty()),
    ]
    .into_iter()
    .filter_map(|(field, empty)| empty.then_some(field))
    .collect();
    if !missing.is_empty() {
        return Err(Error::Validation(format!(
            "Service account JSON is missing {}",
            missing.join(", ")
        )));
    }

    EncodingKey::from_rsa_pem(key.private_key.as_bytes())
        .map_err(|e| Error::Validation(format!("Service account private key is invalid: {}", e)))?;
    Ok(key)
}

/// Sign the delegation assertion for `subject`
pub fn sign_assertion(
    key: &ServiceAccountKey,
    subject: &str,
    scope: &str,
    now: DateTime<Utc>,
) -> Result<String> {
    let encoding = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
        .map_err(|e| Error::Auth(format!("Service account private key is invalid: {}", e)))?;
    let claims = Claims {
        iss: &key.client_email,
        sub: subject,
        scope,
        aud: &key.token_uri,
        iat: now.timestamp(),
        exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
    };
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &encoding)
        .map_err(|e| Error::Internal(format!("Failed to sign assertion: {}", e)))
}

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

type TokenCache = Arc<Mutex<HashMap<(String, String, String), CachedToken>>>;

/// Shared token cache for every delegated mailbox
pub struct DelegatedTokenSource {
    http: reqwest::Client,
    cache: TokenCache,
}

impl DelegatedTokenSource {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Gmail token source acting as `subject`
    pub fn for_subject(&self, key: ServiceAccountKey, subject: &str) -> Arc<dyn TokenSource> {
        self.scoped(key, subject, GMAIL_SCOPE)
    }

    pub fn scoped(&self, key: ServiceAccountKey, subject: &str, scope: &str) -> Arc<dyn TokenSource> {
        Arc::new(DelegatedSubject {
            http: self.http.clone(),
            cache: self.cache.clone(),
            key,
            subject: subject.to_string(),
            scope: scope.to_string(),
        })
    }
}

struct DelegatedSubject {
    http: reqwest::Client,
    cache: TokenCache,
    key: ServiceAccountKey,
    subject: String,
    scope: String,
}

#[async_trait]
impl TokenSource for DelegatedSubject {
    async fn access_token(&self) -> Result<String> {
        let cache_key = (
            self.key.client_email.clone(),
            self.subject.clone(),
            self.scope.clone(),
        );
        let mut cache = self.cache.lock().await;
        let now = Utc::now();
        if let Some(cached) = cache.get(&cache_key) {
            if now + Duration::seconds(EXPIRY_SKEW_SECS) < cached.expires_at {
                return Ok(cached.access_token.clone());
            }
        }

        debug!(subject = %self.subject, "Requesting delegated access token");
        let assertion = sign_assertion(&self.key, &self.subject, &self.scope, now)?;
        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(http_error)?;

        let status = response.status();
        let body = response.text().await.map_err(http_error)?;
        if !status.is_success() {
            return Err(token_error(status, &body));
        }
        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| Error::Transport(format!("Malformed token response: {}", e)))?;

        let expires_at = token
            .expires_at(now)
            .unwrap_or_else(|| now + Duration::seconds(ASSERTION_LIFETIME_SECS));
        cache.insert(
            cache_key,
            CachedToken {
                access_token: token.access_token.clone(),
                expires_at,
            },
        );
        Ok(token.access_token)
    }
}

/// A Workspace user returned by the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub email: String,
    pub name: String,
    pub suspended: bool,
}

/// Lists the users of a Workspace domain
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Active users of the admin's domain
    async fn list_users(
        &self,
        key: &ServiceAccountKey,
        admin_email: &str,
    ) -> Result<Vec<DirectoryUser>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserName {
    #[serde(default)]
    full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserEntry {
    primary_email: String,
    #[serde(default)]
    name: Option<UserName>,
    #[serde(default)]
    suspended: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserPage {
    #[serde(default)]
    users: Vec<UserEntry>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Admin SDK directory client
pub struct GoogleDirectoryClient {
    http: reqwest::Client,
    base: String,
    delegated: Arc<DelegatedTokenSource>,
}

impl GoogleDirectoryClient {
    pub fn new(http: reqwest::Client, base: String, delegated: Arc<DelegatedTokenSource>) -> Self {
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            delegated,
        }
    }

    async fn fetch_users(&self, tokens: &dyn TokenSource, domain: &str) -> Result<Vec<DirectoryUser>> {
        let mut users = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("domain", domain.to_string()),
                ("maxResults", "500".to_string()),
                ("orderBy", "email".to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let response = self
                .http
                .get(format!("{}/users", self.base))
                .bearer_auth(tokens.access_token().await?)
                .query(&query)
                .send()
                .await
                .map_err(http_error)?;
            let page: UserPage = check_status(response)
                .await?
                .json()
                .await
                .map_err(|e| Error::Transport(format!("Malformed directory response: {}", e)))?;

            users.extend(page.users.into_iter().map(|u| DirectoryUser {
                name: u
                    .name
                    .and_then(|n| n.full_name)
                    .unwrap_or_else(|| u.primary_email.clone()),
                email: u.primary_email,
                suspended: u.suspended,
            }));

            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        users.retain(|u| !u.suspended);
        Ok(users)
    }
}

#[async_trait]
impl DirectoryClient for GoogleDirectoryClient {
    async fn list_users(
        &self,
        key: &ServiceAccountKey,
        admin_email: &str,
    ) -> Result<Vec<DirectoryUser>> {
        let domain = admin_email
            .rsplit_once('@')
            .map(|(_, d)| d)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| Error::Validation(format!("Invalid admin email {}", admin_email)))?;

        let tokens = self.delegated.scoped(key.clone(), admin_email, DIRECTORY_SCOPE);
        let users = self.fetch_users(tokens.as_ref(), domain).await?;
        info!(domain, count = users.len(), "Fetched directory users");
        Ok(users)
    }
}
