//! In-memory store
//!
//! Implements every repository trait over one mutex-guarded state with the
//! same conditional-update semantics as the PostgreSQL repositories. Used by
//! engine and API tests that run without a database.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use kindling_common::types::{
    AccountId, AccountStatus, ConversationId, ConversationStatus, JobId, JobStatus,
    MessageStatus, TemplateId, WarmupMessageId,
};
use kindling_common::{Error, Result};
use uuid::Uuid;

use crate::models::*;
use crate::repository::{
    AccountRepository, AuditRepository, ConversationRepository, HealthRepository, JobRepository,
    MessageRepository, TemplateRepository,
};

#[derive(Default)]
struct State {
    accounts: HashMap<AccountId, Account>,
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<WarmupMessageId, WarmupMessage>,
    templates: HashMap<TemplateId, Template>,
    snapshots: Vec<HealthSnapshot>,
    jobs: HashMap<JobId, Job>,
    recurring: HashMap<String, RecurringJob>,
    audit: Vec<AuditEvent>,
    faults: Vec<(&'static str, Error)>,
}

impl State {
    /// Pop the queued failure for `operation`, if any
    fn fault(&mut self, operation: &str) -> Result<()> {
        match self.faults.iter().position(|(op, _)| *op == operation) {
            Some(i) => Err(self.faults.remove(i).1),
            None => Ok(()),
        }
    }
}

/// In-memory implementation of all repositories
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply an arbitrary change to an account, for test setup
    pub fn update_account(&self, id: AccountId, f: impl FnOnce(&mut Account)) {
        if let Some(account) = self.state().accounts.get_mut(&id) {
            f(account);
        }
    }

    /// Apply an arbitrary change to a message, for test setup
    pub fn update_message(&self, id: WarmupMessageId, f: impl FnOnce(&mut WarmupMessage)) {
        if let Some(message) = self.state().messages.get_mut(&id) {
            f(message);
        }
    }

    /// Every job row, oldest first
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.state().jobs.values().cloned().collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs
    }

    /// Make every pending job due now
    pub fn release_all_jobs(&self) {
        let now = Utc::now();
        for job in self.state().jobs.values_mut() {
            if job.status == JobStatus::Pending.as_str() && job.scheduled_at > now {
                job.scheduled_at = now;
            }
        }
    }

    /// Every message row, ordered by conversation and step
    pub fn messages(&self) -> Vec<WarmupMessage> {
        let mut messages: Vec<WarmupMessage> = self.state().messages.values().cloned().collect();
        messages.sort_by_key(|m| (m.conversation_id, m.step));
        messages
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        let mut conversations: Vec<Conversation> =
            self.state().conversations.values().cloned().collect();
        conversations.sort_by_key(|c| c.created_at);
        conversations
    }

    pub fn templates(&self) -> Vec<Template> {
        let mut templates: Vec<Template> = self.state().templates.values().cloned().collect();
        templates.sort_by_key(|t| (t.created_at, t.id));
        templates
    }

    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.state().audit.clone()
    }

    /// Fail the next call of `operation` (`"enqueue"` or `"mark_sent"`)
    /// with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, operation: &'static str, error: Error) {
        self.state().faults.push((operation, error));
    }
}

fn not_found(kind: &str, id: Uuid) -> Error {
    Error::not_found(kind, id)
}

#[async_trait]
impl AccountRepository for MemoryStore {
    async fn create(&self, input: CreateAccount) -> Result<Account> {
        let mut state = self.state();
        if state
            .accounts
            .values()
            .any(|a| a.email.eq_ignore_ascii_case(&input.email))
        {
            return Err(Error::Validation(format!(
                "Account {} is already enrolled",
                input.email
            )));
        }

        let now = Utc::now();
        let account = Account {
            id: Uuid::now_v7(),
            email: input.email,
            display_name: input.display_name,
            provider: input.provider.as_str().to_string(),
            connection_type: input.connection_type.as_str().to_string(),
            credentials: input.credentials,
            token_expires_at: input.token_expires_at,
            status: AccountStatus::Active.as_str().to_string(),
            last_error: None,
            last_tested_at: None,
            warmup_enabled: true,
            emails_per_day: input.emails_per_day,
            use_gradual_increase: input.use_gradual_increase,
            gradual_start_volume: input.gradual_start_volume,
            gradual_target_volume: input.gradual_target_volume,
            gradual_duration_weeks: input.gradual_duration_weeks,
            gradual_current_volume: None,
            gradual_start_date: None,
            daily_emails_sent: 0,
            daily_emails_received: 0,
            last_reset_date: now.date_naive(),
            total_sent: 0,
            total_received: 0,
            replies_sent: 0,
            health_score: 0.0,
            inbox_rate: 0.0,
            spam_rate: 0.0,
            open_rate: 0.0,
            reply_rate: 0.0,
            bounce_rate: 0.0,
            health_updated_at: None,
            created_at: now,
            updated_at: now,
        };
        state.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get(&self, id: AccountId) -> Result<Option<Account>> {
        Ok(self.state().accounts.get(&id).cloned())
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<Account>> {
        Ok(self
            .state()
            .accounts
            .values()
            .find(|a| a.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Account>> {
        let mut accounts: Vec<Account> = self.state().accounts.values().cloned().collect();
        accounts.sort_by_key(|a| (a.created_at, a.id));
        Ok(accounts)
    }

    async fn list_by_status(&self, status: AccountStatus) -> Result<Vec<Account>> {
        let mut accounts = AccountRepository::list(self).await?;
        accounts.retain(|a| a.status == status.as_str());
        Ok(accounts)
    }

    async fn list_warmup_candidates(&self) -> Result<Vec<Account>> {
        let mut accounts = AccountRepository::list(self).await?;
        accounts.retain(|a| a.status == AccountStatus::Active.as_str() && a.warmup_enabled);
        Ok(accounts)
    }

    async fn list_ramping(&self) -> Result<Vec<Account>> {
        let mut accounts = AccountRepository::list(self).await?;
        accounts.retain(|a| a.use_gradual_increase);
        Ok(accounts)
    }

    async fn try_reserve_send(&self, id: AccountId, today: NaiveDate) -> Result<bool> {
        let mut state = self.state();
        let Some(account) = state.accounts.get_mut(&id) else {
            return Err(Error::not_found("account", id));
        };

        if account.sent_today(today) >= account.current_limit() {
            return Ok(false);
        }

        if account.last_reset_date < today {
            account.daily_emails_sent = 0;
            account.daily_emails_received = 0;
            account.last_reset_date = today;
        }
        account.daily_emails_sent += 1;
        account.updated_at = Utc::now();
        Ok(true)
    }

    async fn release_send(&self, id: AccountId, today: NaiveDate) -> Result<()> {
        if let Some(account) = self.state().accounts.get_mut(&id) {
            if account.last_reset_date == today {
                account.daily_emails_sent = (account.daily_emails_sent - 1).max(0);
            }
        }
        Ok(())
    }

    async fn record_sent(&self, id: AccountId, is_reply: bool) -> Result<()> {
        if let Some(account) = self.state().accounts.get_mut(&id) {
            account.total_sent += 1;
            if is_reply {
                account.replies_sent += 1;
            }
        }
        Ok(())
    }

    async fn record_received(&self, id: AccountId, today: NaiveDate) -> Result<()> {
        if let Some(account) = self.state().accounts.get_mut(&id) {
            if account.last_reset_date < today {
                account.daily_emails_sent = 0;
                account.daily_emails_received = 0;
                account.last_reset_date = today;
            }
            account.daily_emails_received += 1;
            account.total_received += 1;
        }
        Ok(())
    }

    async fn reset_daily_counters(&self, today: NaiveDate) -> Result<u64> {
        let mut count = 0;
        for account in self.state().accounts.values_mut() {
            if account.last_reset_date < today {
                account.daily_emails_sent = 0;
                account.daily_emails_received = 0;
                account.last_reset_date = today;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn update_ramp(
        &self,
        id: AccountId,
        current_volume: Option<i32>,
        start_date: Option<NaiveDate>,
        enabled: bool,
    ) -> Result<()> {
        let mut state = self.state();
        let account = state
            .accounts
            .get_mut(&id)
            .ok_or_else(|| not_found("account", id))?;
        account.gradual_current_volume = current_volume;
        account.gradual_start_date = start_date;
        account.use_gradual_increase = enabled;
        Ok(())
    }

    async fn update_status(
        &self,
        id: AccountId,
        status: AccountStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        if let Some(account) = self.state().accounts.get_mut(&id) {
            account.status = status.as_str().to_string();
            account.last_error = last_error.map(str::to_string);
        }
        Ok(())
    }

    async fn record_connection_test(
        &self,
        id: AccountId,
        status: AccountStatus,
        last_error: Option<&str>,
        tested_at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(account) = self.state().accounts.get_mut(&id) {
            account.status = status.as_str().to_string();
            account.last_error = last_error.map(str::to_string);
            account.last_tested_at = Some(tested_at);
        }
        Ok(())
    }

    async fn set_warmup_enabled(
        &self,
        id: AccountId,
        enabled: bool,
        status: AccountStatus,
    ) -> Result<()> {
        if let Some(account) = self.state().accounts.get_mut(&id) {
            account.warmup_enabled = enabled;
            account.status = status.as_str().to_string();
        }
        Ok(())
    }

    async fn update_credentials(
        &self,
        id: AccountId,
        credentials: &str,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if let Some(account) = self.state().accounts.get_mut(&id) {
            account.credentials = Some(credentials.to_string());
            account.token_expires_at = token_expires_at;
        }
        Ok(())
    }

    async fn update_health(
        &self,
        id: AccountId,
        live: LiveHealth,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(account) = self.state().accounts.get_mut(&id) {
            account.health_score = live.health_score;
            account.inbox_rate = live.inbox_rate;
            account.spam_rate = live.spam_rate;
            account.open_rate = live.open_rate;
            account.reply_rate = live.reply_rate;
            account.bounce_rate = live.bounce_rate;
            account.health_updated_at = Some(at);
        }
        Ok(())
    }

    async fn delete(&self, id: AccountId) -> Result<()> {
        let mut state = self.state();
        state.accounts.remove(&id);
        state
            .conversations
            .retain(|_, c| c.sender_id != id && c.receiver_id != id);
        let conversations: HashSet<ConversationId> = state.conversations.keys().copied().collect();
        state.messages.retain(|_, m| {
            m.sender_id != id && m.receiver_id != id && conversations.contains(&m.conversation_id)
        });
        state.snapshots.retain(|s| s.account_id != id);
        Ok(())
    }
}

#[async_trait]
impl ConversationRepository for MemoryStore {
    async fn create(&self, input: CreateConversation) -> Result<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::now_v7(),
            sender_id: input.sender_id,
            receiver_id: input.receiver_id,
            thread_id: input.thread_id,
            subject: input.subject,
            template_id: input.template_id,
            current_step: 1,
            max_steps: input.max_steps,
            status: ConversationStatus::Active.as_str().to_string(),
            error_message: None,
            started_at: now,
            last_reply_at: None,
            completed_at: None,
            archived_at: None,
            created_at: now,
            updated_at: now,
        };
        self.state()
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn get(&self, id: ConversationId) -> Result<Option<Conversation>> {
        Ok(self.state().conversations.get(&id).cloned())
    }

    async fn list_by_status(
        &self,
        status: ConversationStatus,
        limit: i64,
    ) -> Result<Vec<Conversation>> {
        let mut conversations = self.conversations();
        conversations.retain(|c| c.status == status.as_str());
        conversations.truncate(limit.max(0) as usize);
        Ok(conversations)
    }

    async fn advance(
        &self,
        id: ConversationId,
        from_step: i32,
        at: DateTime<Utc>,
    ) -> Result<Option<Conversation>> {
        let mut state = self.state();
        let Some(conversation) = state.conversations.get_mut(&id) else {
            return Ok(None);
        };

        if !conversation.is_active()
            || conversation.current_step != from_step
            || conversation.current_step >= conversation.max_steps
        {
            return Ok(None);
        }

        conversation.current_step += 1;
        conversation.last_reply_at = Some(at);
        conversation.updated_at = at;
        if conversation.current_step >= conversation.max_steps {
            conversation.status = ConversationStatus::Completed.as_str().to_string();
            conversation.completed_at = Some(at);
        }
        Ok(Some(conversation.clone()))
    }

    async fn mark_error(&self, id: ConversationId, reason: &str) -> Result<bool> {
        let mut state = self.state();
        match state.conversations.get_mut(&id) {
            Some(c) if c.is_active() => {
                c.status = ConversationStatus::Error.as_str().to_string();
                c.error_message = Some(reason.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_archived(&self, id: ConversationId, at: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state();
        match state.conversations.get_mut(&id) {
            Some(c) if c.status == ConversationStatus::Completed.as_str() => {
                c.status = ConversationStatus::Archived.as_str().to_string();
                c.archived_at = Some(at);
                c.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

fn set_status(message: &mut WarmupMessage, status: MessageStatus, at: DateTime<Utc>) {
    message.status = status.as_str().to_string();
    message.updated_at = at;
}

fn status_in(message: &WarmupMessage, statuses: &[MessageStatus]) -> bool {
    statuses.iter().any(|s| message.status == s.as_str())
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn create(&self, input: CreateMessage) -> Result<Option<WarmupMessage>> {
        let mut state = self.state();
        if state
            .messages
            .values()
            .any(|m| m.conversation_id == input.conversation_id && m.step == input.step)
        {
            return Ok(None);
        }

        let now = Utc::now();
        let message = WarmupMessage {
            id: Uuid::now_v7(),
            conversation_id: input.conversation_id,
            step: input.step,
            sender_id: input.sender_id,
            receiver_id: input.receiver_id,
            template_id: input.template_id,
            subject: input.subject,
            body: input.body,
            correlation_id: input.correlation_id,
            rfc_message_id: input.rfc_message_id,
            in_reply_to: input.in_reply_to,
            provider_message_id: None,
            provider_thread_id: None,
            status: MessageStatus::Queued.as_str().to_string(),
            landed_in_inbox: false,
            landed_in_spam: false,
            was_opened: false,
            was_replied: false,
            was_bounced: false,
            error_message: None,
            retry_count: 0,
            sent_at: None,
            delivered_at: None,
            opened_at: None,
            replied_at: None,
            bounced_at: None,
            archived_at: None,
            created_at: now,
            updated_at: now,
        };
        state.messages.insert(message.id, message.clone());
        Ok(Some(message))
    }

    async fn get(&self, id: WarmupMessageId) -> Result<Option<WarmupMessage>> {
        Ok(self.state().messages.get(&id).cloned())
    }

    async fn get_by_step(
        &self,
        conversation_id: ConversationId,
        step: i32,
    ) -> Result<Option<WarmupMessage>> {
        Ok(self
            .state()
            .messages
            .values()
            .find(|m| m.conversation_id == conversation_id && m.step == step)
            .cloned())
    }

    async fn get_by_correlation(&self, correlation_id: Uuid) -> Result<Option<WarmupMessage>> {
        Ok(self
            .state()
            .messages
            .values()
            .find(|m| m.correlation_id == correlation_id)
            .cloned())
    }

    async fn list_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<WarmupMessage>> {
        let mut messages = self.messages();
        messages.retain(|m| m.conversation_id == conversation_id);
        Ok(messages)
    }

    async fn mark_sent(&self, id: WarmupMessageId, update: SentUpdate) -> Result<()> {
        let mut state = self.state();
        state.fault("mark_sent")?;
        if let Some(m) = state.messages.get_mut(&id) {
            if m.is_queued() {
                m.provider_message_id = Some(update.provider_message_id);
                m.provider_thread_id = update.provider_thread_id;
                m.sent_at = Some(update.sent_at);
                m.error_message = None;
                set_status(m, MessageStatus::Sent, update.sent_at);
            }
        }
        Ok(())
    }

    async fn record_failure(&self, id: WarmupMessageId, error: &str) -> Result<()> {
        if let Some(m) = self.state().messages.get_mut(&id) {
            m.error_message = Some(error.to_string());
            m.retry_count += 1;
        }
        Ok(())
    }

    async fn mark_bounced(
        &self,
        id: WarmupMessageId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(m) = self.state().messages.get_mut(&id) {
            m.was_bounced = true;
            m.bounced_at = Some(at);
            m.error_message = Some(reason.to_string());
            set_status(m, MessageStatus::Bounced, at);
        }
        Ok(())
    }

    async fn mark_landed(
        &self,
        id: WarmupMessageId,
        in_spam: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(m) = self.state().messages.get_mut(&id) {
            if in_spam {
                m.landed_in_spam = true;
            } else {
                m.landed_in_inbox = true;
            }
            if in_spam && status_in(m, &[MessageStatus::Sent, MessageStatus::Delivered]) {
                set_status(m, MessageStatus::Spam, at);
            } else if m.status == MessageStatus::Sent.as_str() {
                set_status(m, MessageStatus::Delivered, at);
            }
            m.delivered_at.get_or_insert(at);
        }
        Ok(())
    }

    async fn mark_opened(&self, id: WarmupMessageId, at: DateTime<Utc>) -> Result<()> {
        if let Some(m) = self.state().messages.get_mut(&id) {
            m.was_opened = true;
            m.opened_at.get_or_insert(at);
            if status_in(m, &[MessageStatus::Sent, MessageStatus::Delivered]) {
                set_status(m, MessageStatus::Opened, at);
            }
        }
        Ok(())
    }

    async fn mark_replied(&self, id: WarmupMessageId, at: DateTime<Utc>) -> Result<()> {
        if let Some(m) = self.state().messages.get_mut(&id) {
            m.was_replied = true;
            m.replied_at.get_or_insert(at);
            if status_in(
                m,
                &[
                    MessageStatus::Sent,
                    MessageStatus::Delivered,
                    MessageStatus::Opened,
                    MessageStatus::Spam,
                ],
            ) {
                set_status(m, MessageStatus::Replied, at);
            }
        }
        Ok(())
    }

    async fn mark_archived(&self, id: WarmupMessageId, at: DateTime<Utc>) -> Result<()> {
        if let Some(m) = self.state().messages.get_mut(&id) {
            if m.status != MessageStatus::Bounced.as_str() {
                m.archived_at = Some(at);
                set_status(m, MessageStatus::Archived, at);
            }
        }
        Ok(())
    }

    async fn recent_partners(
        &self,
        account_id: AccountId,
        since: DateTime<Utc>,
    ) -> Result<Vec<AccountId>> {
        let partners: HashSet<AccountId> = self
            .state()
            .messages
            .values()
            .filter(|m| m.created_at >= since)
            .filter_map(|m| {
                if m.sender_id == account_id {
                    Some(m.receiver_id)
                } else if m.receiver_id == account_id {
                    Some(m.sender_id)
                } else {
                    None
                }
            })
            .collect();
        Ok(partners.into_iter().collect())
    }

    async fn delivery_counts(&self, account_id: AccountId) -> Result<DeliveryCounts> {
        let state = self.state();
        let mut counts = DeliveryCounts::default();

        for m in state.messages.values() {
            if m.receiver_id == account_id && status_in(m, MessageStatus::DELIVERED_CLASS) {
                counts.inbound_total += 1;
                counts.inbox_landed += i64::from(m.landed_in_inbox);
                counts.spam_landed += i64::from(m.landed_in_spam);
                counts.opened += i64::from(m.was_opened);
                counts.replied += i64::from(m.was_replied);
            }
            if m.sender_id == account_id && status_in(m, MessageStatus::OUTBOUND_CLASS) {
                counts.outbound_total += 1;
                counts.bounced += i64::from(m.was_bounced);
            }
        }
        Ok(counts)
    }
}

fn new_template(input: CreateTemplate) -> Template {
    Template {
        id: Uuid::now_v7(),
        name: input.name,
        category: input.category.as_str().to_string(),
        subject: input.subject,
        body: input.body,
        language: input.language,
        is_initial: input.is_initial,
        reply_to_template_id: input.reply_to_template_id,
        variables: input.variables,
        usage_count: 0,
        is_active: true,
        created_at: Utc::now(),
    }
}

#[async_trait]
impl TemplateRepository for MemoryStore {
    async fn create(&self, input: CreateTemplate) -> Result<Template> {
        let template = new_template(input);
        self.state().templates.insert(template.id, template.clone());
        Ok(template)
    }

    async fn create_if_absent(&self, input: CreateTemplate) -> Result<Option<Template>> {
        let mut state = self.state();
        if state
            .templates
            .values()
            .any(|t| t.category == input.category.as_str() && t.subject == input.subject)
        {
            return Ok(None);
        }
        let template = new_template(input);
        state.templates.insert(template.id, template.clone());
        Ok(Some(template))
    }

    async fn get(&self, id: TemplateId) -> Result<Option<Template>> {
        Ok(self.state().templates.get(&id).cloned())
    }

    async fn find(&self, filter: TemplateFilter) -> Result<Vec<Template>> {
        let mut templates: Vec<Template> = self
            .state()
            .templates
            .values()
            .filter(|t| t.is_active)
            .filter(|t| filter.is_initial.map_or(true, |i| t.is_initial == i))
            .filter(|t| filter.category.map_or(true, |c| t.category == c.as_str()))
            .filter(|t| filter.language.as_ref().map_or(true, |l| &t.language == l))
            .cloned()
            .collect();
        templates.sort_by_key(|t| (t.created_at, t.id));
        Ok(templates)
    }

    async fn increment_usage(&self, id: TemplateId) -> Result<()> {
        if let Some(t) = self.state().templates.get_mut(&id) {
            t.usage_count += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl HealthRepository for MemoryStore {
    async fn append(&self, input: NewHealthSnapshot) -> Result<HealthSnapshot> {
        let snapshot = HealthSnapshot {
            id: Uuid::now_v7(),
            account_id: input.account_id,
            health_score: input.live.health_score,
            inbox_rate: input.live.inbox_rate,
            spam_rate: input.live.spam_rate,
            open_rate: input.live.open_rate,
            reply_rate: input.live.reply_rate,
            bounce_rate: input.live.bounce_rate,
            inbound_sample: input.inbound_sample,
            outbound_sample: input.outbound_sample,
            total_sent: input.total_sent,
            total_received: input.total_received,
            recorded_at: Utc::now(),
        };
        self.state().snapshots.push(snapshot.clone());
        Ok(snapshot)
    }

    async fn history(&self, account_id: AccountId, limit: i64) -> Result<Vec<HealthSnapshot>> {
        Ok(self
            .state()
            .snapshots
            .iter()
            .rev()
            .filter(|s| s.account_id == account_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn enqueue(&self, input: NewJob) -> Result<Option<Job>> {
        let mut state = self.state();
        state.fault("enqueue")?;
        if let Some(key) = &input.dedupe_key {
            if state
                .jobs
                .values()
                .any(|j| j.dedupe_key.as_deref() == Some(key.as_str()))
            {
                return Ok(None);
            }
        }

        let job = Job {
            id: Uuid::now_v7(),
            queue: input.queue,
            name: input.name,
            payload: input.payload,
            status: JobStatus::Pending.as_str().to_string(),
            attempts: 0,
            max_attempts: input.max_attempts,
            deferrals: 0,
            dedupe_key: input.dedupe_key,
            last_error: None,
            scheduled_at: input.scheduled_at,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        };
        state.jobs.insert(job.id, job.clone());
        Ok(Some(job))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.state().jobs.get(&id).cloned())
    }

    async fn claim_due(&self, queue: &str, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let mut state = self.state();
        let mut due: Vec<&mut Job> = state
            .jobs
            .values_mut()
            .filter(|j| {
                j.queue == queue
                    && j.status == JobStatus::Pending.as_str()
                    && j.scheduled_at <= now
            })
            .collect();
        due.sort_by_key(|j| (j.scheduled_at, j.id));

        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|job| {
                job.status = JobStatus::Processing.as_str().to_string();
                job.started_at = Some(now);
                job.clone()
            })
            .collect())
    }

    async fn complete(&self, id: JobId, at: DateTime<Utc>) -> Result<()> {
        if let Some(job) = self.state().jobs.get_mut(&id) {
            job.status = JobStatus::Completed.as_str().to_string();
            job.completed_at = Some(at);
        }
        Ok(())
    }

    async fn retry(
        &self,
        id: JobId,
        attempts: i32,
        error: &str,
        run_at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(job) = self.state().jobs.get_mut(&id) {
            job.status = JobStatus::Pending.as_str().to_string();
            job.attempts = attempts;
            job.last_error = Some(error.to_string());
            job.scheduled_at = run_at;
            job.started_at = None;
        }
        Ok(())
    }

    async fn defer(&self, id: JobId, error: &str, run_at: DateTime<Utc>) -> Result<()> {
        if let Some(job) = self.state().jobs.get_mut(&id) {
            job.status = JobStatus::Pending.as_str().to_string();
            job.deferrals += 1;
            job.last_error = Some(error.to_string());
            job.scheduled_at = run_at;
            job.started_at = None;
        }
        Ok(())
    }

    async fn fail(&self, id: JobId, attempts: i32, error: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(job) = self.state().jobs.get_mut(&id) {
            job.status = JobStatus::Failed.as_str().to_string();
            job.attempts = attempts;
            job.last_error = Some(error.to_string());
            job.completed_at = Some(at);
        }
        Ok(())
    }

    async fn release_stale(&self, started_before: DateTime<Utc>) -> Result<u64> {
        let mut count = 0;
        for job in self.state().jobs.values_mut() {
            if job.status == JobStatus::Processing.as_str()
                && job.started_at.map_or(false, |s| s < started_before)
            {
                job.status = JobStatus::Pending.as_str().to_string();
                job.started_at = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn stats(&self, queue: &str) -> Result<JobStats> {
        let mut stats = JobStats::default();
        for job in self.state().jobs.values().filter(|j| j.queue == queue) {
            match job.status_enum() {
                Some(JobStatus::Pending) => stats.pending += 1,
                Some(JobStatus::Processing) => stats.processing += 1,
                Some(JobStatus::Completed) => stats.completed += 1,
                Some(JobStatus::Failed) => stats.failed += 1,
                None => {}
            }
        }
        Ok(stats)
    }

    async fn list_failed(&self, queue: &str, limit: i64) -> Result<Vec<Job>> {
        let mut jobs = self.jobs();
        jobs.retain(|j| j.queue == queue && j.status == JobStatus::Failed.as_str());
        jobs.truncate(limit.max(0) as usize);
        Ok(jobs)
    }

    async fn register_recurring(&self, input: NewRecurringJob) -> Result<bool> {
        let mut state = self.state();
        if state.recurring.contains_key(&input.name) {
            return Ok(false);
        }
        state.recurring.insert(
            input.name.clone(),
            RecurringJob {
                name: input.name,
                queue: input.queue,
                payload: input.payload,
                schedule: input.schedule,
                next_run_at: input.next_run_at,
                last_run_at: None,
                created_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn due_recurring(&self, now: DateTime<Utc>) -> Result<Vec<RecurringJob>> {
        let mut due: Vec<RecurringJob> = self
            .state()
            .recurring
            .values()
            .filter(|r| r.next_run_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|r| r.next_run_at);
        Ok(due)
    }

    async fn advance_recurring(
        &self,
        name: &str,
        expected_next: DateTime<Utc>,
        next: DateTime<Utc>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state();
        match state.recurring.get_mut(name) {
            Some(r) if r.next_run_at == expected_next => {
                r.next_run_at = next;
                r.last_run_at = Some(fired_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl AuditRepository for MemoryStore {
    async fn append(&self, event: NewAuditEvent) -> Result<()> {
        self.state().audit.push(AuditEvent {
            id: Uuid::now_v7(),
            action: event.action,
            entity: event.entity,
            entity_id: event.entity_id,
            details: event.details,
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_for_entity(
        &self,
        entity: &str,
        entity_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AuditEvent>> {
        Ok(self
            .state()
            .audit
            .iter()
            .rev()
            .filter(|e| e.entity == entity && e.entity_id == Some(entity_id))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindling_common::types::{ConnectionType, Provider};
    use pretty_assertions::assert_eq;

    async fn account(store: &MemoryStore, email: &str, limit: i32) -> Account {
        let mut input = CreateAccount::new(email, Provider::Gmail, ConnectionType::OAuth);
        input.emails_per_day = limit;
        AccountRepository::create(store, input).await.unwrap()
    }

    #[tokio::test]
    async fn test_reserve_send_stops_at_limit() {
        let store = MemoryStore::new();
        let a = account(&store, "a@example.com", 2).await;
        let today = Utc::now().date_naive();

        assert!(store.try_reserve_send(a.id, today).await.unwrap());
        assert!(store.try_reserve_send(a.id, today).await.unwrap());
        assert!(!store.try_reserve_send(a.id, today).await.unwrap());

        store.release_send(a.id, today).await.unwrap();
        assert!(store.try_reserve_send(a.id, today).await.unwrap());
    }

    #[tokio::test]
    async fn test_reserve_send_for_missing_account_is_not_found() {
        let store = MemoryStore::new();
        let today = Utc::now().date_naive();

        let err = store.try_reserve_send(Uuid::new_v4(), today).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_reserve_send_rolls_stale_counter() {
        let store = MemoryStore::new();
        let a = account(&store, "a@example.com", 1).await;
        let today = Utc::now().date_naive();
        store.update_account(a.id, |acc| {
            acc.daily_emails_sent = 1;
            acc.last_reset_date = today.pred_opt().unwrap();
        });

        assert!(store.try_reserve_send(a.id, today).await.unwrap());
        let after = AccountRepository::get(&store, a.id).await.unwrap().unwrap();
        assert_eq!(after.daily_emails_sent, 1);
        assert_eq!(after.last_reset_date, today);
    }

    #[tokio::test]
    async fn test_duplicate_step_is_rejected() {
        let store = MemoryStore::new();
        let a = account(&store, "a@example.com", 5).await;
        let b = account(&store, "b@example.com", 5).await;
        let conv = ConversationRepository::create(
            &store,
            CreateConversation {
                sender_id: a.id,
                receiver_id: b.id,
                thread_id: "t".into(),
                subject: "Hello".into(),
                template_id: None,
                max_steps: 3,
            },
        )
        .await
        .unwrap();

        let input = CreateMessage {
            conversation_id: conv.id,
            step: 2,
            sender_id: b.id,
            receiver_id: a.id,
            template_id: None,
            subject: "Re: Hello".into(),
            body: "Thanks".into(),
            correlation_id: Uuid::new_v4(),
            rfc_message_id: "<x@test>".into(),
            in_reply_to: None,
        };
        assert!(MessageRepository::create(&store, input.clone())
            .await
            .unwrap()
            .is_some());
        let mut again = input;
        again.correlation_id = Uuid::new_v4();
        assert!(MessageRepository::create(&store, again).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dedupe_key_blocks_second_job() {
        let store = MemoryStore::new();
        let job = NewJob {
            queue: "warmup".into(),
            name: "archive-conversation".into(),
            payload: serde_json::json!({}),
            max_attempts: 3,
            dedupe_key: Some("archive-conversation:1".into()),
            scheduled_at: Utc::now(),
        };
        assert!(store.enqueue(job.clone()).await.unwrap().is_some());
        assert!(store.enqueue(job).await.unwrap().is_none());
        assert_eq!(store.jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_marks_processing_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        for _ in 0..3 {
            store
                .enqueue(NewJob {
                    queue: "warmup".into(),
                    name: "poll-all-inboxes".into(),
                    payload: serde_json::json!({}),
                    max_attempts: 3,
                    dedupe_key: None,
                    scheduled_at: now,
                })
                .await
                .unwrap();
        }

        assert_eq!(store.claim_due("warmup", now, 2).await.unwrap().len(), 2);
        assert_eq!(store.claim_due("warmup", now, 10).await.unwrap().len(), 1);
        assert!(store.claim_due("warmup", now, 10).await.unwrap().is_empty());
        assert_eq!(store.stats("warmup").await.unwrap().processing, 3);
    }
}
