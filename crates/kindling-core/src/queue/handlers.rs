//! Job handlers
//!
//! One method per job contract. Every handler re-reads the rows it acts on
//! and exits quietly when the work was already done, so a redelivered job
//! never sends twice.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use kindling_common::config::WarmupConfig;
use kindling_common::types::{
    AccountId, AccountStatus, ConversationStatus, EmailAddress, MessageStatus, WarmupMessageId,
};
use kindling_common::{Error, Result};
use kindling_storage::{
    Account, AccountRepository, AuditRepository, Conversation, CreateMessage, MessageRepository,
    NewAuditEvent, Repositories, SentUpdate, WarmupMessage,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::worker::JobRunner;
use super::{JobKind, JobQueue};
use crate::archiver::Archiver;
use crate::content::{reply_delay, ContentGenerator};
use crate::conversation::{Advance, ConversationMachine};
use crate::health::{DeliverabilityTracker, HealthCalculator};
use crate::matcher::{Pair, PoolMatcher};
use crate::quota::QuotaEnforcer;
use crate::transport::{OutgoingMessage, ProviderMessageRef, SentMessage, Transport, TransportFactory};

/// Seconds per inbox poll slot; one check per account per slot
const POLL_SLOT_SECS: i64 = 900;

/// Tries at marking a message sent once the provider has accepted it
const RECORD_ATTEMPTS: u32 = 3;
const RECORD_BACKOFF: StdDuration = StdDuration::from_millis(50);

/// Counts from one warmup batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub eligible: usize,
    pub started: u32,
    pub failed: u32,
}

/// Dedupe key of the reply that answers `message`
pub fn reply_key(message: &WarmupMessage) -> String {
    format!("send-reply:{}:{}", message.conversation_id, message.step)
}

/// Fresh Message-ID in the sender's domain
pub fn rfc_message_id(sender_email: &str) -> String {
    let domain = EmailAddress::parse(sender_email)
        .map(|a| a.domain)
        .unwrap_or_else(|| "kindling.invalid".to_string());
    format!("{}@{}", Uuid::new_v4(), domain)
}

pub struct JobHandlers {
    accounts: Arc<dyn AccountRepository>,
    messages: Arc<dyn MessageRepository>,
    audit: Arc<dyn AuditRepository>,
    transports: Arc<dyn TransportFactory>,
    queue: JobQueue,
    conversations: Arc<ConversationMachine>,
    health: Arc<HealthCalculator>,
    archiver: Arc<Archiver>,
    matcher: PoolMatcher,
    content: ContentGenerator,
    quota: QuotaEnforcer,
    tracker: DeliverabilityTracker,
    warmup: WarmupConfig,
}

impl JobHandlers {
    pub fn new(
        repos: &Repositories,
        transports: Arc<dyn TransportFactory>,
        queue: JobQueue,
        conversations: Arc<ConversationMachine>,
        health: Arc<HealthCalculator>,
        archiver: Arc<Archiver>,
        warmup: &WarmupConfig,
    ) -> Result<Self> {
        Ok(Self {
            accounts: repos.accounts.clone(),
            messages: repos.messages.clone(),
            audit: repos.audit.clone(),
            transports,
            queue,
            conversations,
            health,
            archiver,
            matcher: PoolMatcher::new(
                repos.accounts.clone(),
                repos.messages.clone(),
                warmup.recent_pair_window_hours,
            ),
            content: ContentGenerator::new(repos.templates.clone(), warmup.language.clone())?,
            quota: QuotaEnforcer::new(repos.accounts.clone()),
            tracker: DeliverabilityTracker::new(repos.messages.clone()),
            warmup: warmup.clone(),
        })
    }

    async fn account(&self, id: AccountId) -> Result<Account> {
        self.accounts
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found("account", id))
    }

    async fn message(&self, id: WarmupMessageId) -> Result<WarmupMessage> {
        self.messages
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found("message", id))
    }

    /// Flag an account whose credentials were rejected; it leaves the pool
    /// until reconnected
    async fn flag_account(&self, account: &Account, reason: &str) {
        if let Err(e) = self
            .accounts
            .update_status(account.id, AccountStatus::Error, Some(reason))
            .await
        {
            warn!(account_id = %account.id, error = %e, "Failed to flag account");
            return;
        }
        let event = NewAuditEvent::new("account.error", "account", Some(account.id))
            .with_details(serde_json::json!({ "reason": reason }));
        if let Err(e) = self.audit.append(event).await {
            warn!(account_id = %account.id, error = %e, "Failed to write audit event");
        }
        warn!(email = %account.email, reason, "Account flagged as error");
    }

    async fn transport_for(&self, account: &Account) -> Result<Arc<dyn Transport>> {
        match self.transports.for_account(account).await {
            Ok(transport) => Ok(transport),
            Err(e) => {
                if let Error::Auth(reason) = &e {
                    self.flag_account(account, reason).await;
                }
                Err(e)
            }
        }
    }

    /// Pair eligible accounts and open one conversation per pair
    pub async fn schedule_batch(&self) -> Result<BatchSummary> {
        let now = Utc::now();
        let accounts = self.matcher.active_eligible_accounts(now.date_naive()).await?;
        let mut summary = BatchSummary {
            eligible: accounts.len(),
            ..Default::default()
        };
        if accounts.len() < 2 {
            info!(eligible = accounts.len(), "Not enough eligible accounts for a batch");
            return Ok(summary);
        }

        let mut rng = StdRng::from_entropy();
        let pairs = self.matcher.build_pairs(&accounts, now, &mut rng).await?;

        for pair in &pairs {
            match self.start_conversation(pair, &mut rng).await {
                Ok(()) => summary.started += 1,
                Err(e) => {
                    warn!(
                        sender = %pair.sender.email,
                        receiver = %pair.receiver.email,
                        error = %e,
                        "Failed to start conversation"
                    );
                    summary.failed += 1;
                }
            }
        }

        info!(
            eligible = summary.eligible,
            started = summary.started,
            failed = summary.failed,
            "Warmup batch scheduled"
        );
        Ok(summary)
    }

    async fn start_conversation(&self, pair: &Pair, rng: &mut StdRng) -> Result<()> {
        let content = self
            .content
            .compose_initial(&pair.sender.email, &pair.receiver.email)
            .await;
        let conversation = self
            .conversations
            .start(&pair.sender, &pair.receiver, &content.subject, content.template_id, rng)
            .await?;

        let message = self
            .messages
            .create(CreateMessage {
                conversation_id: conversation.id,
                step: 1,
                sender_id: pair.sender.id,
                receiver_id: pair.receiver.id,
                template_id: content.template_id,
                subject: content.subject,
                body: content.body,
                correlation_id: Uuid::new_v4(),
                rfc_message_id: rfc_message_id(&pair.sender.email),
                in_reply_to: None,
            })
            .await?
            .ok_or_else(|| {
                Error::Internal(format!("Conversation {} already has a first message", conversation.id))
            })?;

        self.queue
            .enqueue_unique(
                &JobKind::SendInitialMessage { message_id: message.id },
                format!("send-initial-message:{}", message.id),
                Duration::zero(),
            )
            .await?;
        Ok(())
    }

    /// Enqueue an inbox check for every account in the pool
    pub async fn poll_all_inboxes(&self) -> Result<u32> {
        let slot = Utc::now().timestamp().div_euclid(POLL_SLOT_SECS);
        let mut enqueued = 0;

        for account in self.accounts.list_warmup_candidates().await? {
            let job = JobKind::CheckInbox { account_id: account.id };
            match self
                .queue
                .enqueue_unique(&job, format!("check-inbox:{}:{}", account.id, slot), Duration::zero())
                .await
            {
                Ok(Some(_)) => enqueued += 1,
                Ok(None) => {}
                Err(e) => warn!(account_id = %account.id, error = %e, "Failed to enqueue inbox check"),
            }
        }

        debug!(enqueued, "Inbox checks enqueued");
        Ok(enqueued)
    }

    /// Scan one mailbox for tagged, unread warmup mail. Returns the number
    /// of messages seen for the first time.
    pub async fn check_inbox(&self, account_id: AccountId) -> Result<u32> {
        let account = self.account(account_id).await?;
        if account.status_enum() != Some(AccountStatus::Active) {
            debug!(email = %account.email, status = %account.status, "Skipping inbox check");
            return Ok(0);
        }

        let transport = self.transport_for(&account).await?;
        let found = match transport.list_tagged_unread(self.warmup.inbox_scan_limit).await {
            Ok(found) => found,
            Err(e) => {
                if let Error::Auth(reason) = &e {
                    self.flag_account(&account, reason).await;
                }
                return Err(e);
            }
        };

        let mut detected = 0;
        for item in &found {
            match self.process_incoming(&account, transport.as_ref(), item).await {
                Ok(true) => detected += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(email = %account.email, provider_id = %item.id, error = %e, "Failed to process incoming message")
                }
            }
        }

        debug!(email = %account.email, scanned = found.len(), detected, "Inbox checked");
        Ok(detected)
    }

    async fn process_incoming(
        &self,
        account: &Account,
        transport: &dyn Transport,
        item: &ProviderMessageRef,
    ) -> Result<bool> {
        let Some(correlation_id) = item.correlation_id else {
            debug!(provider_id = %item.id, "Tagged message without correlation id");
            return Ok(false);
        };
        let Some(message) = self.messages.get_by_correlation(correlation_id).await? else {
            debug!(%correlation_id, "Unknown correlation id");
            return Ok(false);
        };
        if message.receiver_id != account.id {
            debug!(message_id = %message.id, "Message belongs to another receiver");
            return Ok(false);
        }

        if message.delivered_at.is_some() {
            transport.mark_read(item).await?;
            return Ok(false);
        }

        self.tracker.record_landing(message.id, item.in_spam).await?;
        transport.mark_read(item).await?;
        self.tracker.record_open(message.id).await?;
        self.accounts
            .record_received(account.id, Utc::now().date_naive())
            .await?;

        let conversation = self.conversations.get(message.conversation_id).await?;
        if conversation.is_active() && message.step < conversation.max_steps {
            self.enqueue_reply(&message).await?;
        }

        debug!(
            message_id = %message.id,
            email = %account.email,
            in_spam = item.in_spam,
            "Warmup message detected"
        );
        Ok(true)
    }

    async fn enqueue_reply(&self, message: &WarmupMessage) -> Result<()> {
        let delay = reply_delay(&self.warmup, &mut StdRng::from_entropy());
        self.queue
            .enqueue_unique(
                &JobKind::SendReply { original_message_id: message.id },
                reply_key(message),
                delay,
            )
            .await?;
        Ok(())
    }

    /// Reserve quota and hand a message to the sender's transport. Failed
    /// sends give the reservation back.
    async fn deliver(
        &self,
        sender: &Account,
        message: &WarmupMessage,
        outgoing: &OutgoingMessage,
    ) -> Result<SentMessage> {
        let today = Utc::now().date_naive();
        self.quota.reserve(sender.id, today).await?;

        let result = match self.transport_for(sender).await {
            Ok(transport) => transport.send(outgoing).await,
            Err(e) => Err(e),
        };

        let err = match result {
            Ok(sent) => return Ok(sent),
            Err(e) => e,
        };

        self.quota.release(sender.id, today).await;
        if let Err(e) = self.messages.record_failure(message.id, &err.to_string()).await {
            warn!(message_id = %message.id, error = %e, "Failed to record send failure");
        }

        match &err {
            Error::Auth(reason) => {
                self.flag_account(sender, reason).await;
                self.conversations
                    .fail(message.conversation_id, &err.to_string())
                    .await?;
            }
            Error::Transport(reason) => {
                self.tracker.record_bounce(message.id, reason).await?;
                self.conversations
                    .fail(message.conversation_id, &err.to_string())
                    .await?;
            }
            _ => {}
        }
        Err(err)
    }

    /// Record a send the provider accepted. The row update is retried in
    /// place; false means it is still `queued` and the caller must stop
    /// without failing the job.
    async fn record_send(&self, message: &WarmupMessage, sent: SentMessage, is_reply: bool) -> bool {
        let update = SentUpdate {
            provider_message_id: sent.provider_message_id,
            provider_thread_id: sent.provider_thread_id,
            sent_at: Utc::now(),
        };

        let mut attempt = 1;
        while let Err(e) = self.messages.mark_sent(message.id, update.clone()).await {
            if attempt >= RECORD_ATTEMPTS {
                error!(message_id = %message.id, error = %e, "Message sent but could not be recorded");
                return false;
            }
            warn!(message_id = %message.id, attempt, error = %e, "Failed to mark message sent, retrying");
            tokio::time::sleep(RECORD_BACKOFF * attempt).await;
            attempt += 1;
        }

        if let Err(e) = self.accounts.record_sent(message.sender_id, is_reply).await {
            warn!(account_id = %message.sender_id, error = %e, "Failed to update sent counters");
        }
        true
    }

    /// Follow-up owed by a reply job whose step already moved on: the
    /// archive job of a completed conversation, or the next reply of an
    /// active one. Both are deduped, so replays enqueue nothing new.
    async fn resume_after_step(&self, conversation: &Conversation, original: &WarmupMessage) -> Result<()> {
        match conversation.status_enum() {
            Some(ConversationStatus::Completed) => {
                self.conversations.ensure_archive_job(conversation).await?;
            }
            Some(ConversationStatus::Active) if conversation.current_step == original.step + 1 => {
                let reply = self
                    .messages
                    .get_by_step(conversation.id, conversation.current_step)
                    .await?;
                if let Some(reply) = reply.filter(|r| {
                    !r.is_queued() && r.status_enum() != Some(MessageStatus::Bounced)
                }) {
                    self.enqueue_reply(&reply).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Send the opening message of a conversation
    pub async fn send_initial(&self, message_id: WarmupMessageId) -> Result<()> {
        let message = self.message(message_id).await?;
        if !message.is_queued() {
            debug!(message_id = %message.id, status = %message.status, "Initial message already handled");
            return Ok(());
        }
        let conversation = self.conversations.get(message.conversation_id).await?;
        if !conversation.is_active() {
            debug!(conversation_id = %conversation.id, status = %conversation.status, "Conversation no longer active");
            return Ok(());
        }

        let sender = self.account(message.sender_id).await?;
        let receiver = self.account(message.receiver_id).await?;
        let outgoing = OutgoingMessage {
            from: sender.email.clone(),
            from_name: sender.display_name.clone(),
            to: receiver.email.clone(),
            subject: message.subject.clone(),
            body: message.body.clone(),
            correlation_id: message.correlation_id,
            rfc_message_id: message.rfc_message_id.clone(),
            in_reply_to: None,
            references: Vec::new(),
        };

        let sent = self.deliver(&sender, &message, &outgoing).await?;
        if !self.record_send(&message, sent, false).await {
            return Ok(());
        }
        self.enqueue_reply(&message).await?;

        info!(
            conversation_id = %message.conversation_id,
            from = %sender.email,
            to = %receiver.email,
            "Initial message sent"
        );
        Ok(())
    }

    /// Answer `original_id` from its receiver, then advance the conversation
    pub async fn send_reply(&self, original_id: WarmupMessageId) -> Result<()> {
        let original = self.message(original_id).await?;
        let conversation = self.conversations.get(original.conversation_id).await?;
        if !conversation.is_active() || conversation.current_step != original.step {
            self.resume_after_step(&conversation, &original).await?;
            debug!(
                conversation_id = %conversation.id,
                status = %conversation.status,
                current_step = conversation.current_step,
                original_step = original.step,
                "Reply no longer needed"
            );
            return Ok(());
        }

        let step = original.step + 1;
        let sender = self.account(original.receiver_id).await?;
        let receiver = self.account(original.sender_id).await?;

        let reply = match self.messages.get_by_step(conversation.id, step).await? {
            Some(existing) => existing,
            None => {
                let content = self
                    .content
                    .render_reply(&original, original.step, &sender.email, &receiver.email)
                    .await;
                let created = self
                    .messages
                    .create(CreateMessage {
                        conversation_id: conversation.id,
                        step,
                        sender_id: sender.id,
                        receiver_id: receiver.id,
                        template_id: content.template_id,
                        subject: content.subject,
                        body: content.body,
                        correlation_id: Uuid::new_v4(),
                        rfc_message_id: rfc_message_id(&sender.email),
                        in_reply_to: Some(original.rfc_message_id.clone()),
                    })
                    .await?;
                match created {
                    Some(reply) => reply,
                    None => self
                        .messages
                        .get_by_step(conversation.id, step)
                        .await?
                        .ok_or_else(|| Error::not_found("message", format!("{}#{}", conversation.id, step)))?,
                }
            }
        };

        match reply.status_enum() {
            Some(MessageStatus::Queued) => {
                let references = self
                    .messages
                    .list_by_conversation(conversation.id)
                    .await?
                    .into_iter()
                    .filter(|m| m.step < step)
                    .map(|m| m.rfc_message_id)
                    .collect();
                let outgoing = OutgoingMessage {
                    from: sender.email.clone(),
                    from_name: sender.display_name.clone(),
                    to: receiver.email.clone(),
                    subject: reply.subject.clone(),
                    body: reply.body.clone(),
                    correlation_id: reply.correlation_id,
                    rfc_message_id: reply.rfc_message_id.clone(),
                    in_reply_to: Some(original.rfc_message_id.clone()),
                    references,
                };

                let sent = self.deliver(&sender, &reply, &outgoing).await?;
                if !self.record_send(&reply, sent, true).await {
                    return Ok(());
                }
                info!(
                    conversation_id = %conversation.id,
                    step,
                    from = %sender.email,
                    to = %receiver.email,
                    "Reply sent"
                );
            }
            Some(MessageStatus::Bounced) => {
                debug!(message_id = %reply.id, "Reply bounced earlier");
                return Ok(());
            }
            _ => debug!(message_id = %reply.id, "Reply already sent, finishing step"),
        }

        self.messages.mark_replied(original.id, Utc::now()).await?;
        match self.conversations.advance(conversation.id, original.step).await? {
            Advance::Advanced(_) => self.enqueue_reply(&reply).await?,
            Advance::Completed(_) | Advance::AlreadyAdvanced => {}
        }
        Ok(())
    }
}

#[async_trait]
impl JobRunner for JobHandlers {
    async fn run(&self, job: &JobKind) -> Result<()> {
        match job {
            JobKind::ScheduleWarmupBatch {} => self.schedule_batch().await.map(|_| ()),
            JobKind::PollAllInboxes {} => self.poll_all_inboxes().await.map(|_| ()),
            JobKind::CheckInbox { account_id } => self.check_inbox(*account_id).await.map(|_| ()),
            JobKind::SendInitialMessage { message_id } => self.send_initial(*message_id).await,
            JobKind::SendReply { original_message_id } => self.send_reply(*original_message_id).await,
            JobKind::ArchiveMessage { message_id } => {
                self.archiver.archive_message(*message_id).await.map(|_| ())
            }
            JobKind::ArchiveConversation { conversation_id } => {
                self.archiver.archive_conversation(*conversation_id).await.map(|_| ())
            }
            JobKind::UpdateAccountHealth { account_id } => {
                self.health.recompute(*account_id).await.map(|_| ())
            }
            JobKind::UpdateAllHealthScores {} => self.health.recompute_all().await.map(|_| ()),
            JobKind::ResetDailyCounters {} => self
                .quota
                .reset_daily_counters(Utc::now().date_naive())
                .await
                .map(|_| ()),
            JobKind::AdjustGradualVolume {} => {
                self.quota.adjust_gradual_volume(Utc::now()).await.map(|_| ())
            }
        }
    }
}
