//! Conversation state machine
//!
//! `active -> completed -> archived`, with a side transition to `error`.
//! The step counter only moves through [`ConversationMachine::advance`], a
//! compare-and-set on `(id, from_step)`, so replayed triggers are no-ops.

use std::sync::Arc;

use chrono::{Duration, Utc};
use kindling_common::config::WarmupConfig;
use kindling_common::types::{ConversationId, ConversationStatus, TemplateId};
use kindling_common::{Error, Result};
use kindling_storage::{
    Account, AuditRepository, Conversation, ConversationRepository, CreateConversation,
    NewAuditEvent,
};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::queue::{JobKind, JobQueue};

/// Result of an advance attempt
#[derive(Debug, Clone)]
pub enum Advance {
    /// Moved one step; more replies to come
    Advanced(Conversation),
    /// Reached `max_steps`; the archive job has been enqueued
    Completed(Conversation),
    /// Someone else already moved past `from_step`, or the conversation is
    /// no longer active
    AlreadyAdvanced,
}

/// Provider-agnostic thread id for a new conversation
pub fn thread_id(sender: &Account, receiver: &Account, now_millis: i64) -> String {
    format!("warmup-{}-{}-{}", now_millis, sender.id, receiver.id)
}

/// Dedupe key for the single archive job of a conversation
pub fn archive_key(conversation_id: ConversationId) -> String {
    format!("archive-conversation:{}", conversation_id)
}

pub struct ConversationMachine {
    conversations: Arc<dyn ConversationRepository>,
    audit: Arc<dyn AuditRepository>,
    queue: JobQueue,
    min_steps: i32,
    max_steps: i32,
}

impl ConversationMachine {
    pub fn new(
        conversations: Arc<dyn ConversationRepository>,
        audit: Arc<dyn AuditRepository>,
        queue: JobQueue,
        config: &WarmupConfig,
    ) -> Self {
        let min_steps = config.min_steps.max(2);
        Self {
            conversations,
            audit,
            queue,
            min_steps,
            max_steps: config.max_steps.max(min_steps),
        }
    }

    /// Open a conversation at step 1
    pub async fn start<R: Rng + Send>(
        &self,
        sender: &Account,
        receiver: &Account,
        subject: &str,
        template_id: Option<TemplateId>,
        rng: &mut R,
    ) -> Result<Conversation> {
        if sender.id == receiver.id {
            return Err(Error::Validation(format!(
                "Account {} cannot converse with itself",
                sender.email
            )));
        }

        let max_steps = rng.gen_range(self.min_steps..=self.max_steps);
        let conversation = self
            .conversations
            .create(CreateConversation {
                sender_id: sender.id,
                receiver_id: receiver.id,
                thread_id: thread_id(sender, receiver, Utc::now().timestamp_millis()),
                subject: subject.to_string(),
                template_id,
                max_steps,
            })
            .await?;

        debug!(
            conversation_id = %conversation.id,
            sender = %sender.email,
            receiver = %receiver.email,
            max_steps,
            "Conversation started"
        );
        Ok(conversation)
    }

    pub async fn get(&self, id: ConversationId) -> Result<Conversation> {
        self.conversations
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found("conversation", id))
    }

    /// Move `current_step` from `from_step` to `from_step + 1`. Completion
    /// enqueues exactly one archive job. A no-op on a completed conversation
    /// re-issues the archive job, so a completion whose enqueue failed is
    /// repaired by the replay.
    pub async fn advance(&self, id: ConversationId, from_step: i32) -> Result<Advance> {
        let Some(conversation) = self.conversations.advance(id, from_step, Utc::now()).await?
        else {
            if let Some(current) = self.conversations.get(id).await? {
                if current.status_enum() == Some(ConversationStatus::Completed)
                    && self.ensure_archive_job(&current).await?
                {
                    info!(conversation_id = %id, "Archive job restored for completed conversation");
                }
            }
            debug!(conversation_id = %id, from_step, "Advance was a no-op");
            return Ok(Advance::AlreadyAdvanced);
        };

        if conversation.current_step < conversation.max_steps {
            debug!(conversation_id = %id, step = conversation.current_step, "Conversation advanced");
            return Ok(Advance::Advanced(conversation));
        }

        self.ensure_archive_job(&conversation).await?;
        info!(conversation_id = %id, steps = conversation.current_step, "Conversation completed");
        Ok(Advance::Completed(conversation))
    }

    /// Enqueue the archive job of a completed conversation. Idempotent by
    /// dedupe key; returns true when the job was new, in which case the
    /// completion is audited.
    pub async fn ensure_archive_job(&self, conversation: &Conversation) -> Result<bool> {
        let id = conversation.id;
        let created = self
            .queue
            .enqueue_unique(
                &JobKind::ArchiveConversation { conversation_id: id },
                archive_key(id),
                Duration::zero(),
            )
            .await?
            .is_some();

        if created {
            self.audit
                .append(
                    NewAuditEvent::new("conversation.completed", "conversation", Some(id))
                        .with_details(serde_json::json!({ "steps": conversation.current_step })),
                )
                .await?;
        }
        Ok(created)
    }

    /// Side transition to `error`. Returns false when the conversation was
    /// not active.
    pub async fn fail(&self, id: ConversationId, reason: &str) -> Result<bool> {
        let failed = self.conversations.mark_error(id, reason).await?;
        if failed {
            warn!(conversation_id = %id, reason, "Conversation failed");
            self.audit
                .append(
                    NewAuditEvent::new("conversation.error", "conversation", Some(id))
                        .with_details(serde_json::json!({ "reason": reason })),
                )
                .await?;
        }
        Ok(failed)
    }

    /// `completed -> archived`
    pub async fn mark_archived(&self, id: ConversationId) -> Result<bool> {
        let archived = self.conversations.mark_archived(id, Utc::now()).await?;
        if archived {
            self.audit
                .append(NewAuditEvent::new("conversation.archived", "conversation", Some(id)))
                .await?;
        }
        Ok(archived)
    }
}
