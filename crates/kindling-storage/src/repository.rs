//! Repository layer for data access

pub mod accounts;
pub mod audit;
pub mod conversations;
pub mod health;
pub mod jobs;
pub mod messages;
pub mod templates;

use std::sync::Arc;

use crate::db::DatabasePool;
use kindling_common::Error;

pub use accounts::{AccountRepository, DbAccountRepository};
pub use audit::{AuditRepository, DbAuditRepository};
pub use conversations::{ConversationRepository, DbConversationRepository};
pub use health::{DbHealthRepository, HealthRepository};
pub use jobs::{DbJobRepository, JobRepository};
pub use messages::{DbMessageRepository, MessageRepository};
pub use templates::{DbTemplateRepository, TemplateRepository};

/// Handles to every repository, injected into the engine as one unit
#[derive(Clone)]
pub struct Repositories {
    pub accounts: Arc<dyn AccountRepository>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub templates: Arc<dyn TemplateRepository>,
    pub health: Arc<dyn HealthRepository>,
    pub jobs: Arc<dyn JobRepository>,
    pub audit: Arc<dyn AuditRepository>,
}

impl Repositories {
    /// PostgreSQL-backed repositories sharing one pool
    pub fn postgres(pool: DatabasePool) -> Self {
        Self {
            accounts: Arc::new(DbAccountRepository::new(pool.clone())),
            conversations: Arc::new(DbConversationRepository::new(pool.clone())),
            messages: Arc::new(DbMessageRepository::new(pool.clone())),
            templates: Arc::new(DbTemplateRepository::new(pool.clone())),
            health: Arc::new(DbHealthRepository::new(pool.clone())),
            jobs: Arc::new(DbJobRepository::new(pool.clone())),
            audit: Arc::new(DbAuditRepository::new(pool)),
        }
    }

    /// Repositories backed by a single in-memory store
    #[cfg(feature = "memory")]
    pub fn memory(store: Arc<crate::memory::MemoryStore>) -> Self {
        Self {
            accounts: store.clone(),
            conversations: store.clone(),
            messages: store.clone(),
            templates: store.clone(),
            health: store.clone(),
            jobs: store.clone(),
            audit: store,
        }
    }
}

pub(crate) fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}
