//! Configuration for Kindling

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Warmup behaviour
    #[serde(default)]
    pub warmup: WarmupConfig,

    /// Job queue tuning
    #[serde(default)]
    pub queue: QueueConfig,

    /// OAuth provider clients
    #[serde(default)]
    pub oauth: OAuthConfig,

    /// Credential vault
    #[serde(default)]
    pub vault: VaultConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Node name reported in logs
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            bind_address: default_bind_address(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend (only "postgres" is supported)
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Seconds a worker waits for a free connection
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: default_db_backend(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable the HTTP surface
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// API port
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// CORS allowed origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_api_port(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Warmup behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupConfig {
    /// Use minute-scale reply delays for fast iteration
    #[serde(default)]
    pub testing_mode: bool,

    /// Lower bound of the reply delay in hours
    #[serde(default = "default_min_reply_delay_hours")]
    pub min_reply_delay_hours: u64,

    /// Upper bound of the reply delay in hours
    #[serde(default = "default_max_reply_delay_hours")]
    pub max_reply_delay_hours: u64,

    /// Pause between provider archive calls (milliseconds)
    #[serde(default = "default_archive_delay_ms")]
    pub archive_delay_ms: u64,

    /// Window in which a repeated pairing is avoided (hours)
    #[serde(default = "default_recent_pair_window_hours")]
    pub recent_pair_window_hours: i64,

    /// Smallest number of messages in a conversation
    #[serde(default = "default_min_steps")]
    pub min_steps: i32,

    /// Largest number of messages in a conversation
    #[serde(default = "default_max_steps")]
    pub max_steps: i32,

    /// Maximum tagged messages collected per inbox scan
    #[serde(default = "default_inbox_scan_limit")]
    pub inbox_scan_limit: usize,

    /// Template language
    #[serde(default = "default_language")]
    pub language: String,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            testing_mode: false,
            min_reply_delay_hours: default_min_reply_delay_hours(),
            max_reply_delay_hours: default_max_reply_delay_hours(),
            archive_delay_ms: default_archive_delay_ms(),
            recent_pair_window_hours: default_recent_pair_window_hours(),
            min_steps: default_min_steps(),
            max_steps: default_max_steps(),
            inbox_scan_limit: default_inbox_scan_limit(),
            language: default_language(),
        }
    }
}

fn default_min_reply_delay_hours() -> u64 {
    2
}

fn default_max_reply_delay_hours() -> u64 {
    8
}

fn default_archive_delay_ms() -> u64 {
    1000
}

fn default_recent_pair_window_hours() -> i64 {
    24
}

fn default_min_steps() -> i32 {
    2
}

fn default_max_steps() -> i32 {
    4
}

fn default_inbox_scan_limit() -> usize {
    50
}

fn default_language() -> String {
    "en".to_string()
}

/// Job queue tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Number of worker loops started by the server
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Maximum concurrent jobs per worker
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Interval between queue polls (seconds)
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Jobs claimed per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,

    /// Attempts before a job is marked failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// Base delay of the exponential backoff (seconds)
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    /// Upper bound of the exponential backoff (seconds)
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    /// Fixed delay applied when a sender is out of quota (seconds)
    #[serde(default = "default_quota_defer_secs")]
    pub quota_defer_secs: u64,

    /// Deferrals allowed before the job is failed
    #[serde(default = "default_max_deferrals")]
    pub max_deferrals: i32,

    /// Processing jobs older than this are released back to pending (seconds)
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            concurrency: default_concurrency(),
            poll_interval_secs: default_poll_interval_secs(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            quota_defer_secs: default_quota_defer_secs(),
            max_deferrals: default_max_deferrals(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

fn default_workers() -> usize {
    2
}

fn default_concurrency() -> usize {
    10
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_batch_size() -> i64 {
    20
}

fn default_max_attempts() -> i32 {
    3
}

fn default_backoff_base_secs() -> u64 {
    5
}

fn default_backoff_max_secs() -> u64 {
    3600
}

fn default_quota_defer_secs() -> u64 {
    3600
}

fn default_max_deferrals() -> i32 {
    24
}

fn default_stale_after_secs() -> u64 {
    900
}

/// OAuth provider clients and API endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Google OAuth client
    #[serde(default = "default_google_client")]
    pub google: OAuthClientConfig,

    /// Microsoft OAuth client
    #[serde(default = "default_microsoft_client")]
    pub microsoft: OAuthClientConfig,

    /// Gmail REST base URL
    #[serde(default = "default_gmail_api_base")]
    pub gmail_api_base: String,

    /// Microsoft Graph base URL
    #[serde(default = "default_graph_api_base")]
    pub graph_api_base: String,

    /// Google Admin SDK directory base URL
    #[serde(default = "default_directory_api_base")]
    pub directory_api_base: String,

    /// Refresh access tokens this many seconds before they expire
    #[serde(default = "default_refresh_skew_secs")]
    pub refresh_skew_secs: i64,

    /// HTTP timeout for provider calls (seconds)
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            google: default_google_client(),
            microsoft: default_microsoft_client(),
            gmail_api_base: default_gmail_api_base(),
            graph_api_base: default_graph_api_base(),
            directory_api_base: default_directory_api_base(),
            refresh_skew_secs: default_refresh_skew_secs(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

/// A single OAuth client registration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthClientConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub token_url: String,
}

fn default_google_client() -> OAuthClientConfig {
    OAuthClientConfig {
        token_url: "https://oauth2.googleapis.com/token".to_string(),
        ..Default::default()
    }
}

fn default_microsoft_client() -> OAuthClientConfig {
    OAuthClientConfig {
        token_url: "https://login.microsoftonline.com/common/oauth2/v2.0/token".to_string(),
        ..Default::default()
    }
}

fn default_gmail_api_base() -> String {
    "https://gmail.googleapis.com/gmail/v1".to_string()
}

fn default_graph_api_base() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_directory_api_base() -> String {
    "https://admin.googleapis.com/admin/directory/v1".to_string()
}

fn default_refresh_skew_secs() -> i64 {
    60
}

fn default_http_timeout_secs() -> u64 {
    30
}

/// Credential vault configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Base64 (URL-safe, unpadded) 32-byte key
    pub key: Option<String>,

    /// Identifier embedded in sealed values
    #[serde(default = "default_key_id")]
    pub key_id: String,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            key: None,
            key_id: default_key_id(),
        }
    }
}

fn default_key_id() -> String {
    "k1".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from the first file found in the default
    /// locations, overlaid with `KINDLING__SECTION__KEY` environment variables
    pub fn load() -> crate::Result<Self> {
        let paths = [
            PathBuf::from("./kindling.toml"),
            PathBuf::from("./config/kindling.toml"),
            PathBuf::from("/etc/kindling/kindling.toml"),
        ];

        let file = paths.into_iter().find(|p| p.exists());
        Self::load_layered(file.as_deref())
    }

    /// Load an optional TOML file overlaid with environment variables
    pub fn load_layered(file: Option<&Path>) -> crate::Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = file {
            tracing::info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        builder
            .add_source(
                config::Environment::with_prefix("KINDLING")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<Config>())
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> crate::Result<()> {
        let w = &self.warmup;
        if w.min_steps < 2 || w.max_steps < w.min_steps {
            return Err(crate::Error::Config(format!(
                "warmup steps must satisfy 2 <= min_steps <= max_steps (got {}..={})",
                w.min_steps, w.max_steps
            )));
        }
        if w.max_reply_delay_hours < w.min_reply_delay_hours {
            return Err(crate::Error::Config(
                "warmup.max_reply_delay_hours is below min_reply_delay_hours".to_string(),
            ));
        }
        if self.queue.max_attempts < 1 {
            return Err(crate::Error::Config(
                "queue.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
