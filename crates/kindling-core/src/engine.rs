//! Composition root
//!
//! Builds every engine component from configuration and a set of
//! repositories. Nothing in the engine is constructed at module load.

use std::sync::Arc;
use std::time::Duration;

use kindling_common::config::Config;
use kindling_common::Result;
use kindling_storage::Repositories;

use crate::archiver::Archiver;
use crate::conversation::ConversationMachine;
use crate::health::HealthCalculator;
use crate::onboarding::Onboarding;
use crate::queue::{JobHandlers, JobQueue, QueueWorker, RecurringScheduler, WARMUP_QUEUE};
use crate::seeds::{self, SeedSummary};
use crate::transport::delegation::DelegatedTokenSource;
use crate::transport::{
    DirectoryClient, GoogleDirectoryClient, ProviderTransportFactory, TransportFactory,
};
use crate::vault::{ChaChaVault, CredentialVault};

/// Interval of the recurring scheduler's ticker
const RECURRING_TICK: Duration = Duration::from_secs(30);

/// External collaborators the engine talks to
pub struct Collaborators {
    pub vault: Arc<dyn CredentialVault>,
    pub transports: Arc<dyn TransportFactory>,
    pub directory: Arc<dyn DirectoryClient>,
    pub http: reqwest::Client,
}

impl Collaborators {
    /// Real providers, with the vault key from configuration
    pub fn from_config(config: &Config, repos: &Repositories) -> Result<Self> {
        let vault: Arc<dyn CredentialVault> = Arc::new(ChaChaVault::from_config(&config.vault)?);
        let factory =
            ProviderTransportFactory::new(config.oauth.clone(), vault.clone(), repos.accounts.clone())?;
        let http = factory.http().clone();
        let directory = GoogleDirectoryClient::new(
            http.clone(),
            config.oauth.directory_api_base.clone(),
            Arc::new(DelegatedTokenSource::new(http.clone())),
        );

        Ok(Self {
            vault,
            transports: Arc::new(factory),
            directory: Arc::new(directory),
            http,
        })
    }
}

#[derive(Clone)]
pub struct Engine {
    pub repos: Repositories,
    pub queue: JobQueue,
    pub conversations: Arc<ConversationMachine>,
    pub health: Arc<HealthCalculator>,
    pub archiver: Arc<Archiver>,
    pub handlers: Arc<JobHandlers>,
    pub onboarding: Arc<Onboarding>,
    config: Arc<Config>,
}

impl Engine {
    pub fn new(config: Config, repos: Repositories, collaborators: Collaborators) -> Result<Self> {
        let queue = JobQueue::new(repos.jobs.clone(), WARMUP_QUEUE, config.queue.max_attempts);

        let conversations = Arc::new(ConversationMachine::new(
            repos.conversations.clone(),
            repos.audit.clone(),
            queue.clone(),
            &config.warmup,
        ));
        let health = Arc::new(HealthCalculator::new(
            repos.accounts.clone(),
            repos.messages.clone(),
            repos.health.clone(),
        ));
        let archiver = Arc::new(Archiver::new(
            repos.accounts.clone(),
            repos.messages.clone(),
            collaborators.transports.clone(),
            conversations.clone(),
            config.warmup.archive_delay_ms,
        ));
        let handlers = Arc::new(JobHandlers::new(
            &repos,
            collaborators.transports.clone(),
            queue.clone(),
            conversations.clone(),
            health.clone(),
            archiver.clone(),
            &config.warmup,
        )?);
        let onboarding = Arc::new(Onboarding::new(
            repos.accounts.clone(),
            repos.audit.clone(),
            collaborators.vault,
            collaborators.transports,
            collaborators.directory,
            collaborators.http,
            config.oauth.clone(),
        ));

        Ok(Self {
            repos,
            queue,
            conversations,
            health,
            archiver,
            handlers,
            onboarding,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A worker loop over the warmup queue
    pub fn worker(&self) -> QueueWorker {
        QueueWorker::new(
            self.repos.jobs.clone(),
            self.handlers.clone(),
            WARMUP_QUEUE,
            self.config.queue.clone(),
        )
    }

    pub fn recurring(&self) -> RecurringScheduler {
        RecurringScheduler::new(self.queue.clone(), RECURRING_TICK)
    }

    /// Insert any missing built-in templates
    pub async fn seed_templates(&self) -> Result<SeedSummary> {
        seeds::seed_templates(self.repos.templates.as_ref()).await
    }
}
