//! Provider transports
//!
//! One capability set over every way an account can be connected: SMTP with
//! IMAP, the Gmail API, Microsoft Graph, and Gmail through domain-wide
//! delegation. The variant is chosen once per account by the factory.

pub mod delegation;
pub mod gmail;
pub mod imap;
pub mod oauth;
pub mod outlook;
pub mod smtp;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kindling_common::config::OAuthConfig;
use kindling_common::types::{ConnectionType, Provider};
use kindling_common::{Error, Result};
use kindling_storage::{Account, AccountRepository};
use mail_builder::headers::address::Address;
use mail_builder::headers::raw::Raw;
use mail_builder::MessageBuilder;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::vault::{AccountSecrets, CredentialVault};

pub use delegation::{DelegatedTokenSource, DirectoryClient, DirectoryUser, GoogleDirectoryClient};
pub use gmail::GmailTransport;
pub use imap::ImapClient;
pub use oauth::{OAuthTokenSource, TokenSource};
pub use outlook::GraphTransport;
pub use smtp::SmtpImapTransport;

/// Boolean marker on every warmup message
pub const WARMUP_HEADER: &str = "X-Warmup-Email";
/// Opaque correlation id, the message's `correlation_id`
pub const CORRELATION_HEADER: &str = "X-Warmup-Id";

/// A message ready to hand to a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub from: String,
    pub from_name: Option<String>,
    pub to: String,
    pub subject: String,
    pub body: String,
    pub correlation_id: Uuid,
    /// Bare Message-ID, without angle brackets
    pub rfc_message_id: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

impl OutgoingMessage {
    /// Render as RFC 5322 bytes with the marker headers
    pub fn to_rfc5322(&self) -> Result<Vec<u8>> {
        let from: Address = match &self.from_name {
            Some(name) => (name.as_str(), self.from.as_str()).into(),
            None => self.from.as_str().into(),
        };

        let mut builder = MessageBuilder::new()
            .from(from)
            .to(self.to.as_str())
            .subject(self.subject.as_str())
            .date(Utc::now().timestamp())
            .message_id(self.rfc_message_id.as_str())
            .header(WARMUP_HEADER, Raw::new("true"))
            .header(CORRELATION_HEADER, Raw::new(self.correlation_id.to_string()))
            .text_body(self.body.as_str());

        if let Some(parent) = &self.in_reply_to {
            builder = builder.in_reply_to(parent.as_str());
        }
        if !self.references.is_empty() {
            builder = builder.references(self.references.as_slice());
        }

        builder
            .write_to_vec()
            .map_err(|e| Error::Internal(format!("Failed to render message: {}", e)))
    }
}

/// Provider identifiers for an accepted message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub provider_message_id: String,
    pub provider_thread_id: Option<String>,
}

/// A tagged, unread message found in a mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessageRef {
    pub id: String,
    pub thread_id: Option<String>,
    /// Parsed from the correlation header when present
    pub correlation_id: Option<Uuid>,
    /// Found in the spam or junk folder rather than the inbox
    pub in_spam: bool,
}

/// A fetched message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub id: String,
    pub thread_id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub is_warmup: bool,
    pub correlation_id: Option<Uuid>,
    pub in_spam: bool,
    pub unread: bool,
}

/// What to archive: the provider ids and the RFC id of one warmup message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveTarget {
    pub provider_message_id: Option<String>,
    pub provider_thread_id: Option<String>,
    pub rfc_message_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Archived,
    /// Nothing matched in the mailbox
    NotFound,
    /// The connection has no archive path
    Unsupported,
}

/// Uniform provider capability
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: &OutgoingMessage) -> Result<SentMessage>;

    /// Unread messages carrying the warmup marker, inbox and spam
    async fn list_tagged_unread(&self, limit: usize) -> Result<Vec<ProviderMessageRef>>;

    async fn archive_thread(&self, target: &ArchiveTarget) -> Result<ArchiveOutcome>;

    async fn get_message(&self, id: &str) -> Result<ProviderMessage>;

    /// Mark a found message read, the engine's stand-in for an open
    async fn mark_read(&self, message: &ProviderMessageRef) -> Result<()>;

    /// Cheap authenticated round trip
    async fn test_connection(&self) -> Result<()>;
}

/// Selects the transport variant for an account
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn for_account(&self, account: &Account) -> Result<Arc<dyn Transport>>;
}

/// Transport variant for a (provider, connection) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    SmtpImap,
    GmailOAuth,
    OutlookOAuth,
    DomainWide,
}

impl TransportKind {
    pub fn select(provider: Provider, connection: ConnectionType) -> Result<Self> {
        match (provider, connection) {
            (_, ConnectionType::Smtp | ConnectionType::AppPassword) => Ok(Self::SmtpImap),
            (Provider::Gmail, ConnectionType::OAuth) => Ok(Self::GmailOAuth),
            (Provider::Outlook, ConnectionType::OAuth) => Ok(Self::OutlookOAuth),
            (Provider::Gmail, ConnectionType::DomainWide) => Ok(Self::DomainWide),
            (provider, connection) => Err(Error::Validation(format!(
                "{} accounts cannot connect with {}",
                provider, connection
            ))),
        }
    }

    pub fn for_account(account: &Account) -> Result<Self> {
        let provider = account.provider_enum().ok_or_else(|| {
            Error::Validation(format!("Unknown provider {}", account.provider))
        })?;
        let connection = account.connection_enum().ok_or_else(|| {
            Error::Validation(format!("Unknown connection type {}", account.connection_type))
        })?;
        Self::select(provider, connection)
    }
}

/// Classify a reqwest failure: timeouts and connection errors are transient
pub(crate) fn http_error(e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        Error::Transient(e.to_string())
    } else {
        Error::Transport(e.to_string())
    }
}

/// Map a provider API status to the error taxonomy
pub(crate) fn status_error(status: reqwest::StatusCode, body: &str) -> Error {
    let message = format!("{} {}", status.as_u16(), body.trim());
    match status.as_u16() {
        401 | 403 => Error::Auth(message),
        404 => Error::NotFound(message),
        408 | 429 => Error::Transient(message),
        s if s >= 500 => Error::Transient(message),
        _ => Error::Transport(message),
    }
}

/// Fail unless the response is a success, consuming the body for the error
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

/// Factory over the real providers
pub struct ProviderTransportFactory {
    http: reqwest::Client,
    oauth: OAuthConfig,
    vault: Arc<dyn CredentialVault>,
    accounts: Arc<dyn AccountRepository>,
    delegated: Arc<DelegatedTokenSource>,
}

impl ProviderTransportFactory {
    pub fn new(
        oauth: OAuthConfig,
        vault: Arc<dyn CredentialVault>,
        accounts: Arc<dyn AccountRepository>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(oauth.http_timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            delegated: Arc::new(DelegatedTokenSource::new(http.clone())),
            http,
            oauth,
            vault,
            accounts,
        })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn open_secrets(&self, account: &Account) -> Result<AccountSecrets> {
        let sealed = account.credentials.as_deref().ok_or_else(|| {
            Error::Auth(format!("Account {} has no stored credentials", account.email))
        })?;
        self.vault.open_secrets(sealed)
    }

    fn oauth_source(
        &self,
        account: &Account,
        client: &kindling_common::config::OAuthClientConfig,
    ) -> Result<Arc<dyn TokenSource>> {
        let AccountSecrets::OAuth(tokens) = self.open_secrets(account)? else {
            return Err(Error::Auth(format!(
                "Account {} has no OAuth tokens",
                account.email
            )));
        };
        Ok(Arc::new(OAuthTokenSource::new(
            self.http.clone(),
            client.clone(),
            account.id,
            tokens,
            account.token_expires_at,
            self.oauth.refresh_skew_secs,
            self.vault.clone(),
            self.accounts.clone(),
        )))
    }
}

#[async_trait]
impl TransportFactory for ProviderTransportFactory {
    async fn for_account(&self, account: &Account) -> Result<Arc<dyn Transport>> {
        let transport: Arc<dyn Transport> = match TransportKind::for_account(account)? {
            TransportKind::SmtpImap => {
                let AccountSecrets::Mailbox(login) = self.open_secrets(account)? else {
                    return Err(Error::Auth(format!(
                        "Account {} has no SMTP credentials",
                        account.email
                    )));
                };
                let provider = account.provider_enum().unwrap_or(Provider::Custom);
                Arc::new(SmtpImapTransport::new(login, provider))
            }
            TransportKind::GmailOAuth => {
                let tokens = self.oauth_source(account, &self.oauth.google)?;
                Arc::new(GmailTransport::new(
                    self.http.clone(),
                    self.oauth.gmail_api_base.clone(),
                    tokens,
                ))
            }
            TransportKind::OutlookOAuth => {
                let tokens = self.oauth_source(account, &self.oauth.microsoft)?;
                Arc::new(GraphTransport::new(
                    self.http.clone(),
                    self.oauth.graph_api_base.clone(),
                    tokens,
                ))
            }
            TransportKind::DomainWide => {
                let AccountSecrets::ServiceAccount(key) = self.open_secrets(account)? else {
                    return Err(Error::Auth(format!(
                        "Account {} has no service-account key",
                        account.email
                    )));
                };
                let tokens = self.delegated.for_subject(key, &account.email);
                Arc::new(GmailTransport::new(
                    self.http.clone(),
                    self.oauth.gmail_api_base.clone(),
                    tokens,
                ))
            }
        };
        Ok(transport)
    }
}

/// Case-insensitive header lookup over `(name, value)` pairs
pub(crate) fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.trim())
}

/// Marker and correlation id from a header set
pub(crate) fn marker_from_headers(headers: &[(String, String)]) -> (bool, Option<Uuid>) {
    let is_warmup = header_value(headers, WARMUP_HEADER)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let correlation_id = header_value(headers, CORRELATION_HEADER).and_then(|v| v.parse().ok());
    (is_warmup, correlation_id)
}
