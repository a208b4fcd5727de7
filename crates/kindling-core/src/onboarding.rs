//! Onboarding hooks
//!
//! Enrollment validation, connection tests, pause/resume and directory
//! imports. Validation errors are returned to the caller synchronously and
//! never reach the job queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kindling_common::config::OAuthConfig;
use kindling_common::types::{AccountId, AccountStatus, ConnectionType, EmailAddress, Provider};
use kindling_common::{Error, Result};
use kindling_storage::{Account, AccountRepository, AuditRepository, CreateAccount, NewAuditEvent};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::transport::delegation::parse_service_account;
use crate::transport::oauth::OAuthClient;
use crate::transport::{DirectoryClient, TransportFactory, TransportKind};
use crate::vault::{
    AccountSecrets, CredentialVault, MailboxLogin, OAuthTokens, Security, ServerSettings,
};

/// SMTP and IMAP servers preset for well-known providers
pub fn provider_presets(provider: Provider) -> Option<(ServerSettings, ServerSettings)> {
    let (smtp, imap) = match provider {
        Provider::Gmail => ("smtp.gmail.com", "imap.gmail.com"),
        Provider::Outlook => ("smtp-mail.outlook.com", "outlook.office365.com"),
        Provider::Custom => return None,
    };
    Some((
        ServerSettings {
            host: smtp.to_string(),
            port: 587,
            security: Security::StartTls,
        },
        ServerSettings {
            host: imap.to_string(),
            port: 993,
            security: Security::Tls,
        },
    ))
}

fn default_emails_per_day() -> i32 {
    20
}

fn default_start_volume() -> i32 {
    5
}

fn default_target_volume() -> i32 {
    40
}

fn default_duration_weeks() -> i32 {
    4
}

/// Sending limits chosen at enrollment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendingLimits {
    #[serde(default = "default_emails_per_day")]
    pub emails_per_day: i32,
    #[serde(default)]
    pub use_gradual_increase: bool,
    #[serde(default = "default_start_volume")]
    pub gradual_start_volume: i32,
    #[serde(default = "default_target_volume")]
    pub gradual_target_volume: i32,
    #[serde(default = "default_duration_weeks")]
    pub gradual_duration_weeks: i32,
}

impl Default for SendingLimits {
    fn default() -> Self {
        Self {
            emails_per_day: default_emails_per_day(),
            use_gradual_increase: false,
            gradual_start_volume: default_start_volume(),
            gradual_target_volume: default_target_volume(),
            gradual_duration_weeks: default_duration_weeks(),
        }
    }
}

impl SendingLimits {
    fn validate(&self) -> Result<()> {
        if self.emails_per_day < 1 {
            return Err(Error::Validation("emailsPerDay must be at least 1".to_string()));
        }
        if self.use_gradual_increase {
            if self.gradual_start_volume < 1 {
                return Err(Error::Validation(
                    "gradualStartVolume must be at least 1".to_string(),
                ));
            }
            if self.gradual_start_volume > self.gradual_target_volume {
                return Err(Error::Validation(
                    "gradualStartVolume cannot exceed gradualTargetVolume".to_string(),
                ));
            }
            if self.gradual_duration_weeks < 1 {
                return Err(Error::Validation(
                    "gradualDurationWeeks must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Once the ramp finishes the static limit applies, so it starts at
    /// least at the ramp target
    fn apply(&self, input: &mut CreateAccount) {
        input.use_gradual_increase = self.use_gradual_increase;
        input.gradual_start_volume = self.gradual_start_volume;
        input.gradual_target_volume = self.gradual_target_volume;
        input.gradual_duration_weeks = self.gradual_duration_weeks;
        input.emails_per_day = if self.use_gradual_increase {
            self.emails_per_day.max(self.gradual_target_volume)
        } else {
            self.emails_per_day
        };
    }
}

/// Account enrollment input
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentRequest {
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub provider: Provider,
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub smtp: Option<ServerSettings>,
    #[serde(default)]
    pub imap: Option<ServerSettings>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub authorization_code: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub service_account_json: Option<String>,
    #[serde(flatten)]
    pub limits: SendingLimits,
}

impl EnrollmentRequest {
    pub fn new(email: impl Into<String>, provider: Provider, connection_type: ConnectionType) -> Self {
        Self {
            email: email.into(),
            display_name: None,
            provider,
            connection_type,
            smtp: None,
            imap: None,
            username: None,
            password: None,
            access_token: None,
            refresh_token: None,
            token_expires_at: None,
            authorization_code: None,
            redirect_uri: None,
            service_account_json: None,
            limits: SendingLimits::default(),
        }
    }
}

/// Credentials as supplied, before any code exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialInput {
    Ready(AccountSecrets),
    AuthorizationCode { code: String, redirect_uri: String },
}

/// A request that passed validation
#[derive(Debug, Clone)]
pub struct ValidatedEnrollment {
    pub account: CreateAccount,
    pub credentials: CredentialInput,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn check_server(kind: &str, server: &ServerSettings) -> Result<()> {
    if server.host.trim().is_empty() || server.port == 0 {
        return Err(Error::Validation(format!("{} host and port are required", kind)));
    }
    Ok(())
}

/// Check an enrollment request without touching storage or the network
pub fn validate_enrollment(request: &EnrollmentRequest) -> Result<ValidatedEnrollment> {
    let address: EmailAddress = request.email.parse()?;
    TransportKind::select(request.provider, request.connection_type)?;
    request.limits.validate()?;

    let credentials = match request.connection_type {
        ConnectionType::Smtp | ConnectionType::AppPassword => {
            let password = present(&request.password)
                .ok_or_else(|| Error::Validation("password is required".to_string()))?;
            let presets = provider_presets(request.provider);
            let smtp = match (&request.smtp, &presets) {
                (Some(smtp), _) => smtp.clone(),
                (None, Some((smtp, _))) => smtp.clone(),
                (None, None) => {
                    return Err(Error::Validation("smtp settings are required".to_string()))
                }
            };
            let imap = match (&request.imap, &presets) {
                (Some(imap), _) => imap.clone(),
                (None, Some((_, imap))) => imap.clone(),
                (None, None) => {
                    return Err(Error::Validation("imap settings are required".to_string()))
                }
            };
            check_server("smtp", &smtp)?;
            check_server("imap", &imap)?;

            CredentialInput::Ready(AccountSecrets::Mailbox(MailboxLogin {
                smtp,
                imap,
                username: present(&request.username)
                    .unwrap_or(request.email.trim())
                    .to_string(),
                password: password.to_string(),
            }))
        }
        ConnectionType::OAuth => {
            if let Some(access_token) = present(&request.access_token) {
                CredentialInput::Ready(AccountSecrets::OAuth(OAuthTokens {
                    access_token: access_token.to_string(),
                    refresh_token: present(&request.refresh_token).map(str::to_string),
                }))
            } else if let Some(code) = present(&request.authorization_code) {
                let redirect_uri = present(&request.redirect_uri).ok_or_else(|| {
                    Error::Validation("redirectUri is required with an authorization code".to_string())
                })?;
                CredentialInput::AuthorizationCode {
                    code: code.to_string(),
                    redirect_uri: redirect_uri.to_string(),
                }
            } else {
                return Err(Error::Validation(
                    "accessToken or authorizationCode is required".to_string(),
                ));
            }
        }
        ConnectionType::DomainWide => {
            let json = present(&request.service_account_json).ok_or_else(|| {
                Error::Validation("serviceAccountJson is required".to_string())
            })?;
            CredentialInput::Ready(AccountSecrets::ServiceAccount(parse_service_account(json)?))
        }
    };

    let mut account = CreateAccount::new(address.to_string(), request.provider, request.connection_type);
    account.display_name = present(&request.display_name).map(str::to_string);
    account.token_expires_at = request.token_expires_at;
    request.limits.apply(&mut account);

    Ok(ValidatedEnrollment {
        account,
        credentials,
    })
}

/// Outcome of a connection test
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTestResult {
    pub account_id: AccountId,
    pub ok: bool,
    pub status: AccountStatus,
    pub error: Option<String>,
    pub tested_at: DateTime<Utc>,
}

/// Directory import input
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryImport {
    pub domain: String,
    pub admin_email: String,
    pub service_account_json: String,
    #[serde(flatten)]
    pub limits: SendingLimits,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub imported: Vec<String>,
    pub already_enrolled: u32,
    pub other_domain: u32,
}

pub struct Onboarding {
    accounts: Arc<dyn AccountRepository>,
    audit: Arc<dyn AuditRepository>,
    vault: Arc<dyn CredentialVault>,
    transports: Arc<dyn TransportFactory>,
    directory: Arc<dyn DirectoryClient>,
    http: reqwest::Client,
    oauth: OAuthConfig,
}

impl Onboarding {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        audit: Arc<dyn AuditRepository>,
        vault: Arc<dyn CredentialVault>,
        transports: Arc<dyn TransportFactory>,
        directory: Arc<dyn DirectoryClient>,
        http: reqwest::Client,
        oauth: OAuthConfig,
    ) -> Self {
        Self {
            accounts,
            audit,
            vault,
            transports,
            directory,
            http,
            oauth,
        }
    }

    async fn account(&self, id: AccountId) -> Result<Account> {
        self.accounts
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found("account", id))
    }

    async fn audit(&self, action: &str, id: AccountId, details: serde_json::Value) {
        let event = NewAuditEvent::new(action, "account", Some(id)).with_details(details);
        if let Err(e) = self.audit.append(event).await {
            warn!(account_id = %id, action, error = %e, "Failed to write audit event");
        }
    }

    /// Validate, exchange any authorization code, seal the secrets and
    /// persist the account as active
    pub async fn enroll(&self, request: &EnrollmentRequest) -> Result<Account> {
        let ValidatedEnrollment {
            mut account,
            credentials,
        } = validate_enrollment(request)?;

        if self.accounts.get_by_email(&account.email).await?.is_some() {
            return Err(Error::Validation(format!(
                "Account {} is already enrolled",
                account.email
            )));
        }

        let secrets = match credentials {
            CredentialInput::Ready(secrets) => secrets,
            CredentialInput::AuthorizationCode { code, redirect_uri } => {
                let client = match request.provider {
                    Provider::Outlook => self.oauth.microsoft.clone(),
                    _ => self.oauth.google.clone(),
                };
                let response = OAuthClient::new(self.http.clone(), client)
                    .exchange_code(&code, &redirect_uri)
                    .await?;
                account.token_expires_at = response.expires_at(Utc::now());
                AccountSecrets::OAuth(OAuthTokens {
                    access_token: response.access_token,
                    refresh_token: response.refresh_token,
                })
            }
        };
        account.credentials = Some(self.vault.seal_secrets(&secrets)?);

        let created = self.accounts.create(account).await?;
        self.audit(
            "account.enrolled",
            created.id,
            serde_json::json!({
                "provider": created.provider,
                "connectionType": created.connection_type,
            }),
        )
        .await;

        info!(email = %created.email, connection = %created.connection_type, "Account enrolled");
        Ok(created)
    }

    /// Test the account's transport and record the result
    pub async fn test_connection(&self, id: AccountId) -> Result<ConnectionTestResult> {
        let account = self.account(id).await?;

        let checked = match self.transports.for_account(&account).await {
            Ok(transport) => transport.test_connection().await,
            Err(e) => Err(e),
        };

        let tested_at = Utc::now();
        let (status, error) = match &checked {
            Ok(()) if account.status_enum() == Some(AccountStatus::Paused) => {
                (AccountStatus::Paused, None)
            }
            Ok(()) => (AccountStatus::Active, None),
            Err(e) => (AccountStatus::Error, Some(e.to_string())),
        };

        self.accounts
            .record_connection_test(id, status, error.as_deref(), tested_at)
            .await?;
        self.audit(
            "account.connection_test",
            id,
            serde_json::json!({ "ok": checked.is_ok(), "error": error }),
        )
        .await;

        match &error {
            Some(e) => warn!(email = %account.email, error = %e, "Connection test failed"),
            None => debug!(email = %account.email, "Connection test passed"),
        }

        Ok(ConnectionTestResult {
            account_id: id,
            ok: checked.is_ok(),
            status,
            error,
            tested_at,
        })
    }

    /// Stop selecting the account; jobs already queued still run
    pub async fn pause(&self, id: AccountId) -> Result<Account> {
        let account = self.account(id).await?;
        self.accounts
            .set_warmup_enabled(id, false, AccountStatus::Paused)
            .await?;
        self.audit(
            "account.paused",
            id,
            serde_json::json!({ "previousStatus": account.status }),
        )
        .await;
        info!(email = %account.email, "Warmup paused");
        self.account(id).await
    }

    /// Re-enable warmup. An account in error stays in error until a
    /// connection test passes.
    pub async fn resume(&self, id: AccountId) -> Result<Account> {
        let account = self.account(id).await?;
        let status = match account.status_enum() {
            Some(AccountStatus::Error) => AccountStatus::Error,
            Some(AccountStatus::Disconnected) => AccountStatus::Disconnected,
            _ => AccountStatus::Active,
        };
        self.accounts.set_warmup_enabled(id, true, status).await?;
        self.audit("account.resumed", id, serde_json::json!({ "status": status })).await;
        info!(email = %account.email, status = %status, "Warmup resumed");
        self.account(id).await
    }

    /// Enroll every active directory user of `domain` not enrolled yet
    pub async fn import_domain_users(&self, import: &DirectoryImport) -> Result<ImportSummary> {
        let domain = import.domain.trim().to_ascii_lowercase();
        let admin: EmailAddress = import.admin_email.parse()?;
        if admin.domain != domain {
            return Err(Error::Validation(format!(
                "Admin {} is not in domain {}",
                import.admin_email, domain
            )));
        }
        import.limits.validate()?;
        let key = parse_service_account(&import.service_account_json)?;
        let sealed = self
            .vault
            .seal_secrets(&AccountSecrets::ServiceAccount(key.clone()))?;

        let users = self.directory.list_users(&key, &admin.to_string()).await?;
        let mut summary = ImportSummary::default();

        for user in users.into_iter().filter(|u| !u.suspended) {
            let Some(address) = EmailAddress::parse(&user.email) else {
                warn!(email = %user.email, "Skipping directory user with invalid address");
                continue;
            };
            if address.domain != domain {
                summary.other_domain += 1;
                continue;
            }
            let email = address.to_string();
            if self.accounts.get_by_email(&email).await?.is_some() {
                summary.already_enrolled += 1;
                continue;
            }

            let mut input = CreateAccount::new(email.clone(), Provider::Gmail, ConnectionType::DomainWide);
            input.display_name = Some(user.name.clone());
            input.credentials = Some(sealed.clone());
            import.limits.apply(&mut input);

            let created = self.accounts.create(input).await?;
            self.audit(
                "account.imported",
                created.id,
                serde_json::json!({ "domain": domain, "admin": admin.to_string() }),
            )
            .await;
            summary.imported.push(email);
        }

        info!(
            domain = %domain,
            imported = summary.imported.len(),
            already_enrolled = summary.already_enrolled,
            "Directory import complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeFactory, FakeTransport, TEST_KEY};
    use crate::transport::DirectoryUser;
    use crate::vault::{ChaChaVault, ServiceAccountKey};
    use async_trait::async_trait;
    use kindling_common::config::OAuthClientConfig;
    use kindling_storage::memory::MemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FakeDirectory(Vec<DirectoryUser>);

    #[async_trait]
    impl DirectoryClient for FakeDirectory {
        async fn list_users(&self, _key: &ServiceAccountKey, _admin: &str) -> Result<Vec<DirectoryUser>> {
            Ok(self.0.clone())
        }
    }

    fn service_account_json() -> String {
        json!({
            "client_email": "warmup@project.iam.gserviceaccount.com",
            "client_id": "1234",
            "private_key": TEST_KEY,
        })
        .to_string()
    }

    fn vault() -> Arc<ChaChaVault> {
        Arc::new(ChaChaVault::new("k1", [7u8; 32]))
    }

    fn onboarding(
        store: &Arc<MemoryStore>,
        factory: FakeFactory,
        users: Vec<DirectoryUser>,
        oauth: OAuthConfig,
    ) -> Onboarding {
        Onboarding::new(
            store.clone(),
            store.clone(),
            vault(),
            Arc::new(factory),
            Arc::new(FakeDirectory(users)),
            reqwest::Client::new(),
            oauth,
        )
    }

    fn smtp_request() -> EnrollmentRequest {
        let mut request = EnrollmentRequest::new("sam@gmail.com", Provider::Gmail, ConnectionType::AppPassword);
        request.password = Some("app-password".to_string());
        request
    }

    #[test]
    fn test_presets_fill_mailbox_settings() {
        let validated = validate_enrollment(&smtp_request()).unwrap();
        let CredentialInput::Ready(AccountSecrets::Mailbox(login)) = validated.credentials else {
            panic!("expected mailbox credentials");
        };
        assert_eq!(login.smtp.host, "smtp.gmail.com");
        assert_eq!(login.smtp.port, 587);
        assert_eq!(login.imap.host, "imap.gmail.com");
        assert_eq!(login.imap.port, 993);
        assert_eq!(login.username, "sam@gmail.com");
    }

    #[test]
    fn test_validation_failures() {
        let mut bad_email = smtp_request();
        bad_email.email = "not-an-address".to_string();
        assert!(matches!(validate_enrollment(&bad_email), Err(Error::Validation(_))));

        let mut no_password = smtp_request();
        no_password.password = None;
        assert!(matches!(validate_enrollment(&no_password), Err(Error::Validation(_))));

        let custom = {
            let mut r = EnrollmentRequest::new("a@corp.example", Provider::Custom, ConnectionType::Smtp);
            r.password = Some("pw".to_string());
            r
        };
        assert!(matches!(validate_enrollment(&custom), Err(Error::Validation(_))));

        let mismatch = EnrollmentRequest::new("a@corp.example", Provider::Outlook, ConnectionType::DomainWide);
        assert!(matches!(validate_enrollment(&mismatch), Err(Error::Validation(_))));

        let oauth_without_tokens = EnrollmentRequest::new("a@gmail.com", Provider::Gmail, ConnectionType::OAuth);
        assert!(matches!(validate_enrollment(&oauth_without_tokens), Err(Error::Validation(_))));

        let mut missing_key = EnrollmentRequest::new("a@corp.example", Provider::Gmail, ConnectionType::DomainWide);
        missing_key.service_account_json = Some(json!({ "client_email": "x@y.z", "client_id": "1" }).to_string());
        assert!(matches!(validate_enrollment(&missing_key), Err(Error::Validation(_))));

        let mut inverted_ramp = smtp_request();
        inverted_ramp.limits.use_gradual_increase = true;
        inverted_ramp.limits.gradual_start_volume = 50;
        inverted_ramp.limits.gradual_target_volume = 10;
        assert!(matches!(validate_enrollment(&inverted_ramp), Err(Error::Validation(_))));

        let mut zero_weeks = smtp_request();
        zero_weeks.limits.use_gradual_increase = true;
        zero_weeks.limits.gradual_duration_weeks = 0;
        assert!(matches!(validate_enrollment(&zero_weeks), Err(Error::Validation(_))));
    }

    #[test]
    fn test_request_deserializes_camel_case_with_flat_limits() {
        let request: EnrollmentRequest = serde_json::from_value(json!({
            "email": "sam@outlook.com",
            "provider": "outlook",
            "connectionType": "app_password",
            "password": "pw",
            "useGradualIncrease": true,
            "gradualTargetVolume": 60,
        }))
        .unwrap();
        assert_eq!(request.connection_type, ConnectionType::AppPassword);
        assert!(request.limits.use_gradual_increase);
        assert_eq!(request.limits.gradual_start_volume, 5);

        let validated = validate_enrollment(&request).unwrap();
        assert_eq!(validated.account.emails_per_day, 60);
        assert_eq!(validated.account.gradual_target_volume, 60);
    }

    #[tokio::test]
    async fn test_enroll_seals_credentials_and_rejects_duplicates() {
        let store = Arc::new(MemoryStore::new());
        let service = onboarding(&store, FakeFactory::default(), vec![], OAuthConfig::default());

        let account = service.enroll(&smtp_request()).await.unwrap();
        assert_eq!(account.status_enum(), Some(AccountStatus::Active));
        let sealed = account.credentials.clone().unwrap();
        assert!(sealed.starts_with("enc:v1:k1:"));
        assert!(matches!(
            vault().open_secrets(&sealed).unwrap(),
            AccountSecrets::Mailbox(_)
        ));

        let err = service.enroll(&smtp_request()).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let actions: Vec<String> = store.audit_events().into_iter().map(|e| e.action).collect();
        assert_eq!(actions, vec!["account.enrolled".to_string()]);
    }

    #[tokio::test]
    async fn test_enroll_exchanges_authorization_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("code=auth-code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "ya29.fresh",
                "refresh_token": "1//refresh",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let oauth = OAuthConfig {
            google: OAuthClientConfig {
                client_id: "client".to_string(),
                client_secret: "secret".to_string(),
                token_url: format!("{}/token", server.uri()),
            },
            ..Default::default()
        };
        let store = Arc::new(MemoryStore::new());
        let service = onboarding(&store, FakeFactory::default(), vec![], oauth);

        let mut request = EnrollmentRequest::new("sam@gmail.com", Provider::Gmail, ConnectionType::OAuth);
        request.authorization_code = Some("auth-code".to_string());
        request.redirect_uri = Some("https://app.example/callback".to_string());

        let account = service.enroll(&request).await.unwrap();
        assert!(account.token_expires_at.is_some());
        let secrets = vault().open_secrets(account.credentials.as_deref().unwrap()).unwrap();
        assert_eq!(
            secrets,
            AccountSecrets::OAuth(OAuthTokens {
                access_token: "ya29.fresh".to_string(),
                refresh_token: Some("1//refresh".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn test_connection_test_records_outcome() {
        let store = Arc::new(MemoryStore::new());
        let setup = onboarding(&store, FakeFactory::default(), vec![], OAuthConfig::default());
        let account = setup.enroll(&smtp_request()).await.unwrap();

        let transport = FakeTransport::default();
        let service = onboarding(
            &store,
            FakeFactory::default().with(account.id, transport.clone()),
            vec![],
            OAuthConfig::default(),
        );

        transport.fail_connection_with(|| Error::Auth("535 authentication failed".to_string()));
        let failed = service.test_connection(account.id).await.unwrap();
        assert!(!failed.ok);
        assert_eq!(failed.status, AccountStatus::Error);
        let stored = AccountRepository::get(store.as_ref(), account.id).await.unwrap().unwrap();
        assert_eq!(stored.status_enum(), Some(AccountStatus::Error));
        assert!(stored.last_error.unwrap().contains("535"));
        assert!(stored.last_tested_at.is_some());

        let healthy = onboarding(
            &store,
            FakeFactory::default().with(account.id, FakeTransport::default()),
            vec![],
            OAuthConfig::default(),
        );
        let passed = healthy.test_connection(account.id).await.unwrap();
        assert!(passed.ok);
        let stored = AccountRepository::get(store.as_ref(), account.id).await.unwrap().unwrap();
        assert_eq!(stored.status_enum(), Some(AccountStatus::Active));
        assert_eq!(stored.last_error, None);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let store = Arc::new(MemoryStore::new());
        let service = onboarding(&store, FakeFactory::default(), vec![], OAuthConfig::default());
        let account = service.enroll(&smtp_request()).await.unwrap();

        let paused = service.pause(account.id).await.unwrap();
        assert!(!paused.warmup_enabled);
        assert_eq!(paused.status_enum(), Some(AccountStatus::Paused));

        let resumed = service.resume(account.id).await.unwrap();
        assert!(resumed.warmup_enabled);
        assert_eq!(resumed.status_enum(), Some(AccountStatus::Active));

        service.pause(account.id).await.unwrap();
        store.update_account(account.id, |a| a.status = AccountStatus::Error.as_str().to_string());
        let still_error = service.resume(account.id).await.unwrap();
        assert!(still_error.warmup_enabled);
        assert_eq!(still_error.status_enum(), Some(AccountStatus::Error));
    }

    #[tokio::test]
    async fn test_directory_import_skips_enrolled_suspended_and_foreign() {
        let store = Arc::new(MemoryStore::new());
        let users = vec![
            DirectoryUser { email: "ana@corp.example".to_string(), name: "Ana".to_string(), suspended: false },
            DirectoryUser { email: "ben@corp.example".to_string(), name: "Ben".to_string(), suspended: false },
            DirectoryUser { email: "old@corp.example".to_string(), name: "Old".to_string(), suspended: true },
            DirectoryUser { email: "eve@other.example".to_string(), name: "Eve".to_string(), suspended: false },
        ];
        let service = onboarding(&store, FakeFactory::default(), users, OAuthConfig::default());
        AccountRepository::create(
            store.as_ref(),
            CreateAccount::new("ben@corp.example", Provider::Gmail, ConnectionType::DomainWide),
        )
        .await
        .unwrap();

        let summary = service
            .import_domain_users(&DirectoryImport {
                domain: "corp.example".to_string(),
                admin_email: "admin@corp.example".to_string(),
                service_account_json: service_account_json(),
                limits: SendingLimits::default(),
            })
            .await
            .unwrap();

        assert_eq!(
            summary,
            ImportSummary {
                imported: vec!["ana@corp.example".to_string()],
                already_enrolled: 1,
                other_domain: 1,
            }
        );
        let ana = store.get_by_email("ana@corp.example").await.unwrap().unwrap();
        assert_eq!(ana.connection_enum(), Some(ConnectionType::DomainWide));
        assert_eq!(ana.display_name.as_deref(), Some("Ana"));
        assert!(matches!(
            vault().open_secrets(ana.credentials.as_deref().unwrap()).unwrap(),
            AccountSecrets::ServiceAccount(_)
        ));
    }

    #[tokio::test]
    async fn test_directory_import_requires_admin_in_domain() {
        let store = Arc::new(MemoryStore::new());
        let service = onboarding(&store, FakeFactory::default(), vec![], OAuthConfig::default());
        let err = service
            .import_domain_users(&DirectoryImport {
                domain: "corp.example".to_string(),
                admin_email: "admin@elsewhere.example".to_string(),
                service_account_json: service_account_json(),
                limits: SendingLimits::default(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
