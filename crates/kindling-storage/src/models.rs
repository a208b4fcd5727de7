//! Database models

use chrono::{DateTime, NaiveDate, Utc};
use kindling_common::types::{
    AccountId, AccountStatus, ConnectionType, ConversationId, ConversationStatus, JobId,
    JobStatus, MessageStatus, Provider, TemplateCategory, TemplateId, WarmupMessageId,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Enrolled mailbox
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub email: String,
    pub display_name: Option<String>,
    pub provider: String,
    pub connection_type: String,
    /// Sealed credential blob, see the vault
    #[serde(skip_serializing)]
    pub credentials: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub status: String,
    pub last_error: Option<String>,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub warmup_enabled: bool,
    pub emails_per_day: i32,
    pub use_gradual_increase: bool,
    pub gradual_start_volume: i32,
    pub gradual_target_volume: i32,
    pub gradual_duration_weeks: i32,
    pub gradual_current_volume: Option<i32>,
    pub gradual_start_date: Option<NaiveDate>,
    pub daily_emails_sent: i32,
    pub daily_emails_received: i32,
    pub last_reset_date: NaiveDate,
    pub total_sent: i64,
    pub total_received: i64,
    pub replies_sent: i64,
    pub health_score: f64,
    pub inbox_rate: f64,
    pub spam_rate: f64,
    pub open_rate: f64,
    pub reply_rate: f64,
    pub bounce_rate: f64,
    pub health_updated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn provider_enum(&self) -> Option<Provider> {
        self.provider.parse().ok()
    }

    pub fn connection_enum(&self) -> Option<ConnectionType> {
        self.connection_type.parse().ok()
    }

    pub fn status_enum(&self) -> Option<AccountStatus> {
        self.status.parse().ok()
    }

    /// Daily send cap: the ramp's current volume while ramping, else the static limit
    pub fn current_limit(&self) -> i32 {
        if self.use_gradual_increase {
            self.gradual_current_volume
                .unwrap_or(self.gradual_start_volume)
        } else {
            self.emails_per_day
        }
    }

    /// Sends already counted against `today`. A stale reset date means
    /// the counter belongs to a previous day.
    pub fn sent_today(&self, today: NaiveDate) -> i32 {
        if self.last_reset_date < today {
            0
        } else {
            self.daily_emails_sent
        }
    }
}

/// Create account input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAccount {
    pub email: String,
    pub display_name: Option<String>,
    pub provider: Provider,
    pub connection_type: ConnectionType,
    pub credentials: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub emails_per_day: i32,
    pub use_gradual_increase: bool,
    pub gradual_start_volume: i32,
    pub gradual_target_volume: i32,
    pub gradual_duration_weeks: i32,
}

impl CreateAccount {
    /// Minimal input with default limits, mostly for tests and directory imports
    pub fn new(email: impl Into<String>, provider: Provider, connection_type: ConnectionType) -> Self {
        Self {
            email: email.into(),
            display_name: None,
            provider,
            connection_type,
            credentials: None,
            token_expires_at: None,
            emails_per_day: 20,
            use_gradual_increase: false,
            gradual_start_volume: 5,
            gradual_target_volume: 40,
            gradual_duration_weeks: 4,
        }
    }
}

/// Denormalized live health fields written on every recompute
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveHealth {
    pub health_score: f64,
    pub inbox_rate: f64,
    pub spam_rate: f64,
    pub open_rate: f64,
    pub reply_rate: f64,
    pub bounce_rate: f64,
}

/// Conversation between two accounts
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub sender_id: AccountId,
    pub receiver_id: AccountId,
    pub thread_id: String,
    pub subject: String,
    pub template_id: Option<TemplateId>,
    pub current_step: i32,
    pub max_steps: i32,
    pub status: String,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_reply_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn status_enum(&self) -> Option<ConversationStatus> {
        self.status.parse().ok()
    }

    pub fn is_active(&self) -> bool {
        self.status == ConversationStatus::Active.as_str()
    }
}

/// Create conversation input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConversation {
    pub sender_id: AccountId,
    pub receiver_id: AccountId,
    pub thread_id: String,
    pub subject: String,
    pub template_id: Option<TemplateId>,
    pub max_steps: i32,
}

/// A single warmup email
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WarmupMessage {
    pub id: WarmupMessageId,
    pub conversation_id: ConversationId,
    pub step: i32,
    pub sender_id: AccountId,
    pub receiver_id: AccountId,
    pub template_id: Option<TemplateId>,
    pub subject: String,
    pub body: String,
    /// Value of the correlation marker header
    pub correlation_id: Uuid,
    /// RFC 5322 Message-ID we generated for the send
    pub rfc_message_id: String,
    pub in_reply_to: Option<String>,
    pub provider_message_id: Option<String>,
    pub provider_thread_id: Option<String>,
    pub status: String,
    pub landed_in_inbox: bool,
    pub landed_in_spam: bool,
    pub was_opened: bool,
    pub was_replied: bool,
    pub was_bounced: bool,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub replied_at: Option<DateTime<Utc>>,
    pub bounced_at: Option<DateTime<Utc>>,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WarmupMessage {
    pub fn status_enum(&self) -> Option<MessageStatus> {
        self.status.parse().ok()
    }

    pub fn is_queued(&self) -> bool {
        self.status == MessageStatus::Queued.as_str()
    }
}

/// Create message input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMessage {
    pub conversation_id: ConversationId,
    pub step: i32,
    pub sender_id: AccountId,
    pub receiver_id: AccountId,
    pub template_id: Option<TemplateId>,
    pub subject: String,
    pub body: String,
    pub correlation_id: Uuid,
    pub rfc_message_id: String,
    pub in_reply_to: Option<String>,
}

/// Fields recorded when a provider accepts a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentUpdate {
    pub provider_message_id: String,
    pub provider_thread_id: Option<String>,
    pub sent_at: DateTime<Utc>,
}

/// Message outcome counts for one account, restricted to delivered-class statuses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryCounts {
    pub inbound_total: i64,
    pub inbox_landed: i64,
    pub spam_landed: i64,
    pub opened: i64,
    pub replied: i64,
    pub outbound_total: i64,
    pub bounced: i64,
}

/// Message template
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    pub category: String,
    pub subject: String,
    pub body: String,
    pub language: String,
    pub is_initial: bool,
    pub reply_to_template_id: Option<TemplateId>,
    pub variables: Vec<String>,
    pub usage_count: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Template {
    pub fn category_enum(&self) -> Option<TemplateCategory> {
        self.category.parse().ok()
    }
}

/// Create template input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTemplate {
    pub name: String,
    pub category: TemplateCategory,
    pub subject: String,
    pub body: String,
    pub language: String,
    pub is_initial: bool,
    pub reply_to_template_id: Option<TemplateId>,
    pub variables: Vec<String>,
}

/// Template lookup filter
#[derive(Debug, Clone, Default)]
pub struct TemplateFilter {
    /// `Some(true)` for opening messages, `Some(false)` for replies
    pub is_initial: Option<bool>,
    pub category: Option<TemplateCategory>,
    pub language: Option<String>,
}

/// Immutable point-in-time health record
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub id: Uuid,
    pub account_id: AccountId,
    pub health_score: f64,
    pub inbox_rate: f64,
    pub spam_rate: f64,
    pub open_rate: f64,
    pub reply_rate: f64,
    pub bounce_rate: f64,
    pub inbound_sample: i64,
    pub outbound_sample: i64,
    pub total_sent: i64,
    pub total_received: i64,
    pub recorded_at: DateTime<Utc>,
}

/// New health snapshot input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewHealthSnapshot {
    pub account_id: AccountId,
    pub live: LiveHealth,
    pub inbound_sample: i64,
    pub outbound_sample: i64,
    pub total_sent: i64,
    pub total_received: i64,
}

/// Job model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub deferrals: i32,
    pub dedupe_key: Option<String>,
    pub last_error: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn status_enum(&self) -> Option<JobStatus> {
        self.status.parse().ok()
    }
}

/// New job input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
    pub dedupe_key: Option<String>,
    pub scheduled_at: DateTime<Utc>,
}

/// Queue statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Recurring job definition
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RecurringJob {
    pub name: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub schedule: String,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// New recurring job input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRecurringJob {
    pub name: String,
    pub queue: String,
    pub payload: serde_json::Value,
    pub schedule: String,
    pub next_run_at: DateTime<Utc>,
}

/// Audit event
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub action: String,
    pub entity: String,
    pub entity_id: Option<Uuid>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// New audit event input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAuditEvent {
    pub action: String,
    pub entity: String,
    pub entity_id: Option<Uuid>,
    pub details: serde_json::Value,
}

impl NewAuditEvent {
    pub fn new(action: &str, entity: &str, entity_id: Option<Uuid>) -> Self {
        Self {
            action: action.to_string(),
            entity: entity.to_string(),
            entity_id,
            details: serde_json::json!({}),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}
