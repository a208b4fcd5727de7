//! Common types for Kindling

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for enrolled accounts
pub type AccountId = Uuid;

/// Unique identifier for conversations
pub type ConversationId = Uuid;

/// Unique identifier for warmup messages
pub type WarmupMessageId = Uuid;

/// Unique identifier for templates
pub type TemplateId = Uuid;

/// Unique identifier for queued jobs
pub type JobId = Uuid;

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

/// Defines a string-backed enum with `as_str`, `Display` and `FromStr`.
/// Rows store these as TEXT.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(crate::Error::Validation(format!(
                        "Invalid {}: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum! {
    /// Mailbox provider
    Provider {
        Gmail => "gmail",
        Outlook => "outlook",
        Custom => "custom",
    }
}

string_enum! {
    /// How the engine reaches the mailbox
    ConnectionType {
        OAuth => "oauth",
        Smtp => "smtp",
        AppPassword => "app_password",
        DomainWide => "domain_wide",
    }
}

string_enum! {
    /// Operational status of an account
    AccountStatus {
        Active => "active",
        Paused => "paused",
        Error => "error",
        Disconnected => "disconnected",
    }
}

string_enum! {
    /// Conversation lifecycle: active -> completed -> archived, or error
    ConversationStatus {
        Active => "active",
        Completed => "completed",
        Archived => "archived",
        Error => "error",
    }
}

string_enum! {
    /// Delivery status of a warmup message
    MessageStatus {
        Queued => "queued",
        Sent => "sent",
        Delivered => "delivered",
        Opened => "opened",
        Replied => "replied",
        Bounced => "bounced",
        Spam => "spam",
        Archived => "archived",
    }
}

string_enum! {
    /// Template category
    TemplateCategory {
        Business => "business",
        Networking => "networking",
        Feedback => "feedback",
        Collaboration => "collaboration",
        Casual => "casual",
    }
}

string_enum! {
    /// Job lifecycle in the queue table
    JobStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
}

impl MessageStatus {
    /// Statuses counted as "delivered-class" when computing inbound rates
    pub const DELIVERED_CLASS: &'static [MessageStatus] = &[
        MessageStatus::Sent,
        MessageStatus::Delivered,
        MessageStatus::Opened,
        MessageStatus::Replied,
        MessageStatus::Spam,
        MessageStatus::Archived,
    ];

    /// Statuses counted for outbound (bounce) rates
    pub const OUTBOUND_CLASS: &'static [MessageStatus] = &[
        MessageStatus::Sent,
        MessageStatus::Delivered,
        MessageStatus::Opened,
        MessageStatus::Replied,
        MessageStatus::Spam,
        MessageStatus::Archived,
        MessageStatus::Bounced,
    ];
}

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address from a string
    pub fn parse(s: &str) -> Option<Self> {
        let (local, domain) = s.trim().split_once('@')?;
        if local.is_empty()
            || domain.is_empty()
            || domain.contains('@')
            || !domain.contains('.')
            || local.contains(char::is_whitespace)
            || domain.contains(char::is_whitespace)
        {
            return None;
        }
        Some(Self::new(local, domain.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
            .ok_or_else(|| crate::Error::Validation(format!("Invalid email address: {}", s)))
    }
}
