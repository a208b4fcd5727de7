//! Kindling Core - warmup orchestration engine
//!
//! Pairs enrolled mailboxes, runs scripted conversations between them
//! through each provider's transport, and keeps per-account quota, ramp
//! and health bookkeeping. All work is driven by the persistent job queue.

pub mod archiver;
pub mod content;
pub mod conversation;
pub mod engine;
pub mod health;
pub mod matcher;
pub mod onboarding;
pub mod queue;
pub mod quota;
pub mod seeds;
pub mod transport;
pub mod vault;

#[cfg(test)]
mod testing;

pub use archiver::Archiver;
pub use content::ContentGenerator;
pub use conversation::ConversationMachine;
pub use engine::{Collaborators, Engine};
pub use health::{DeliverabilityTracker, HealthCalculator};
pub use matcher::PoolMatcher;
pub use onboarding::{EnrollmentRequest, Onboarding, SendingLimits};
pub use queue::{JobKind, JobQueue, QueueWorker, RecurringScheduler};
pub use quota::QuotaEnforcer;
pub use seeds::seed_templates;
pub use transport::{Transport, TransportFactory};
pub use vault::{ChaChaVault, CredentialVault};
