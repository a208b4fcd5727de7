//! Archiver
//!
//! Moves finished warmup threads out of the sender's inbox so they do not
//! clutter the mailbox, then closes the conversation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kindling_common::types::{ConversationId, ConversationStatus, MessageStatus, WarmupMessageId};
use kindling_common::{Error, Result};
use kindling_storage::{AccountRepository, MessageRepository, WarmupMessage};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::conversation::ConversationMachine;
use crate::transport::{ArchiveOutcome, ArchiveTarget, TransportFactory};

/// Counts from one conversation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveSummary {
    pub archived: u32,
    pub skipped: u32,
    pub failed: u32,
}

pub struct Archiver {
    accounts: Arc<dyn AccountRepository>,
    messages: Arc<dyn MessageRepository>,
    transports: Arc<dyn TransportFactory>,
    conversations: Arc<ConversationMachine>,
    delay: Duration,
}

impl Archiver {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        messages: Arc<dyn MessageRepository>,
        transports: Arc<dyn TransportFactory>,
        conversations: Arc<ConversationMachine>,
        delay_ms: u64,
    ) -> Self {
        Self {
            accounts,
            messages,
            transports,
            conversations,
            delay: Duration::from_millis(delay_ms),
        }
    }

    /// Archive one message in its sender's mailbox
    pub async fn archive_message(&self, message_id: WarmupMessageId) -> Result<ArchiveOutcome> {
        let message = self
            .messages
            .get(message_id)
            .await?
            .ok_or_else(|| Error::not_found("message", message_id))?;
        self.archive(&message).await
    }

    async fn archive(&self, message: &WarmupMessage) -> Result<ArchiveOutcome> {
        match message.status_enum() {
            Some(MessageStatus::Archived) => {
                debug!(message_id = %message.id, "Message already archived");
                return Ok(ArchiveOutcome::Archived);
            }
            Some(MessageStatus::Queued) | Some(MessageStatus::Bounced) => {
                debug!(message_id = %message.id, status = %message.status, "Nothing to archive");
                return Ok(ArchiveOutcome::NotFound);
            }
            _ => {}
        }

        let account = self
            .accounts
            .get(message.sender_id)
            .await?
            .ok_or_else(|| Error::not_found("account", message.sender_id))?;
        let transport = self.transports.for_account(&account).await?;

        let target = ArchiveTarget {
            provider_message_id: message.provider_message_id.clone(),
            provider_thread_id: message.provider_thread_id.clone(),
            rfc_message_id: message.rfc_message_id.clone(),
        };

        let outcome = transport.archive_thread(&target).await?;
        match outcome {
            ArchiveOutcome::Archived => {
                self.messages.mark_archived(message.id, Utc::now()).await?;
                debug!(message_id = %message.id, email = %account.email, "Message archived");
            }
            ArchiveOutcome::NotFound => {
                debug!(message_id = %message.id, email = %account.email, "Message not found in mailbox");
            }
            ArchiveOutcome::Unsupported => {
                info!(
                    email = %account.email,
                    connection = %account.connection_type,
                    "Archiving not supported for connection, skipping"
                );
            }
        }
        Ok(outcome)
    }

    /// Archive every message of a completed conversation, then mark it
    /// archived. Per-message failures are logged and skipped.
    pub async fn archive_conversation(&self, id: ConversationId) -> Result<ArchiveSummary> {
        let conversation = self.conversations.get(id).await?;
        if conversation.status_enum() != Some(ConversationStatus::Completed) {
            debug!(conversation_id = %id, status = %conversation.status, "Conversation not archivable");
            return Ok(ArchiveSummary::default());
        }

        let messages = self.messages.list_by_conversation(id).await?;
        let mut summary = ArchiveSummary::default();

        for (i, message) in messages.iter().enumerate() {
            if i > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.archive(message).await {
                Ok(ArchiveOutcome::Archived) => summary.archived += 1,
                Ok(_) => summary.skipped += 1,
                Err(e) => {
                    warn!(message_id = %message.id, error = %e, "Failed to archive message");
                    summary.failed += 1;
                }
            }
        }

        self.conversations.mark_archived(id).await?;
        info!(
            conversation_id = %id,
            archived = summary.archived,
            skipped = summary.skipped,
            failed = summary.failed,
            "Conversation archived"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Advance;
    use crate::queue::{JobQueue, WARMUP_QUEUE};
    use crate::testing::{FakeFactory, FakeTransport};
    use kindling_common::config::WarmupConfig;
    use kindling_common::types::{ConnectionType, Provider};
    use kindling_storage::memory::MemoryStore;
    use kindling_storage::{Account, CreateAccount, CreateMessage, SentUpdate};
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<MemoryStore>,
        machine: Arc<ConversationMachine>,
        alice: Account,
        bob: Account,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let queue = JobQueue::new(store.clone(), WARMUP_QUEUE, 3);
        let config = WarmupConfig {
            min_steps: 2,
            max_steps: 2,
            ..Default::default()
        };
        let machine = Arc::new(ConversationMachine::new(store.clone(), store.clone(), queue, &config));
        let alice = AccountRepository::create(
            store.as_ref(),
            CreateAccount::new("alice@example.com", Provider::Gmail, ConnectionType::OAuth),
        )
        .await
        .unwrap();
        let bob = AccountRepository::create(
            store.as_ref(),
            CreateAccount::new("bob@example.org", Provider::Custom, ConnectionType::Smtp),
        )
        .await
        .unwrap();
        Fixture { store, machine, alice, bob }
    }

    async fn sent(store: &MemoryStore, conversation: ConversationId, step: i32, from: &Account, to: &Account) -> WarmupMessage {
        let message = MessageRepository::create(
            store,
            CreateMessage {
                conversation_id: conversation,
                step,
                sender_id: from.id,
                receiver_id: to.id,
                template_id: None,
                subject: "Hi".to_string(),
                body: "Hello".to_string(),
                correlation_id: Uuid::new_v4(),
                rfc_message_id: format!("{}@example.com", Uuid::new_v4()),
                in_reply_to: None,
            },
        )
        .await
        .unwrap()
        .unwrap();
        store
            .mark_sent(
                message.id,
                SentUpdate {
                    provider_message_id: format!("p-{}", step),
                    provider_thread_id: Some("t-1".to_string()),
                    sent_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        message
    }

    #[tokio::test]
    async fn test_archive_conversation_continues_past_failures() {
        let f = fixture().await;
        let mut rng = StdRng::seed_from_u64(1);
        let c = f.machine.start(&f.alice, &f.bob, "Hi", None, &mut rng).await.unwrap();
        let first = sent(&f.store, c.id, 1, &f.alice, &f.bob).await;
        let reply = sent(&f.store, c.id, 2, &f.bob, &f.alice).await;
        assert!(matches!(f.machine.advance(c.id, 1).await.unwrap(), Advance::Completed(_)));

        let alice_box = FakeTransport::default();
        let bob_box = FakeTransport::default();
        bob_box.fail_archive_with(|| Error::Transient("timeout".to_string()));
        let factory = FakeFactory::default()
            .with(f.alice.id, alice_box.clone())
            .with(f.bob.id, bob_box.clone());

        let archiver = Archiver::new(f.store.clone(), f.store.clone(), Arc::new(factory), f.machine.clone(), 0);
        let summary = archiver.archive_conversation(c.id).await.unwrap();
        assert_eq!(summary, ArchiveSummary { archived: 1, skipped: 0, failed: 1 });

        let first = MessageRepository::get(f.store.as_ref(), first.id).await.unwrap().unwrap();
        let reply = MessageRepository::get(f.store.as_ref(), reply.id).await.unwrap().unwrap();
        assert_eq!(first.status_enum(), Some(MessageStatus::Archived));
        assert_eq!(reply.status_enum(), Some(MessageStatus::Sent));
        assert_eq!(alice_box.archived().len(), 1);
        assert_eq!(alice_box.archived()[0].provider_message_id.as_deref(), Some("p-1"));

        let conversation = f.machine.get(c.id).await.unwrap();
        assert_eq!(conversation.status_enum(), Some(ConversationStatus::Archived));
    }

    #[tokio::test]
    async fn test_unsupported_archive_is_skipped() {
        let f = fixture().await;
        let mut rng = StdRng::seed_from_u64(1);
        let c = f.machine.start(&f.alice, &f.bob, "Hi", None, &mut rng).await.unwrap();
        let message = sent(&f.store, c.id, 1, &f.alice, &f.bob).await;

        let transport = FakeTransport::default();
        transport.set_archive_outcome(ArchiveOutcome::Unsupported);
        let factory = FakeFactory::default().with(f.alice.id, transport);
        let archiver = Archiver::new(f.store.clone(), f.store.clone(), Arc::new(factory), f.machine.clone(), 0);

        let outcome = archiver.archive_message(message.id).await.unwrap();
        assert_eq!(outcome, ArchiveOutcome::Unsupported);
        let message = MessageRepository::get(f.store.as_ref(), message.id).await.unwrap().unwrap();
        assert_eq!(message.status_enum(), Some(MessageStatus::Sent));
    }

    #[tokio::test]
    async fn test_active_conversation_is_left_alone() {
        let f = fixture().await;
        let mut rng = StdRng::seed_from_u64(1);
        let c = f.machine.start(&f.alice, &f.bob, "Hi", None, &mut rng).await.unwrap();
        sent(&f.store, c.id, 1, &f.alice, &f.bob).await;

        let transport = FakeTransport::default();
        let factory = FakeFactory::default().with(f.alice.id, transport.clone());
        let archiver = Archiver::new(f.store.clone(), f.store.clone(), Arc::new(factory), f.machine.clone(), 0);

        assert_eq!(archiver.archive_conversation(c.id).await.unwrap(), ArchiveSummary::default());
        assert!(transport.archived().is_empty());
    }

    #[tokio::test]
    async fn test_missing_message_is_not_found() {
        let f = fixture().await;
        let archiver = Archiver::new(
            f.store.clone(),
            f.store.clone(),
            Arc::new(FakeFactory::default()),
            f.machine.clone(),
            0,
        );
        let err = archiver.archive_message(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
