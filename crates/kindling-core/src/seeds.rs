//! Built-in template library
//!
//! Seeded at startup. Templates are keyed by `(category, subject)`, so a
//! second run inserts nothing and edits made to seeded rows survive.

use std::collections::HashMap;

use kindling_common::types::{TemplateCategory, TemplateId};
use kindling_common::Result;
use kindling_storage::{CreateTemplate, TemplateFilter, TemplateRepository};
use serde::Serialize;
use tracing::{debug, info};

use crate::content::Placeholders;

const SEED_LANGUAGE: &str = "en";

struct Seed {
    category: TemplateCategory,
    subject: &'static str,
    body: &'static str,
    /// Subject of the opening template this one answers
    answers: Option<&'static str>,
}

const fn opening(category: TemplateCategory, subject: &'static str, body: &'static str) -> Seed {
    Seed {
        category,
        subject,
        body,
        answers: None,
    }
}

const fn reply(
    category: TemplateCategory,
    answers: &'static str,
    subject: &'static str,
    body: &'static str,
) -> Seed {
    Seed {
        category,
        subject,
        body,
        answers: Some(answers),
    }
}

const OPENINGS: &[Seed] = &[
    opening(
        TemplateCategory::Business,
        "Quick question about {{productName}}",
        "Hi {{firstName}},\n\nI hope this email finds you well. I came across your work at {{company}} and had a quick question about your {{productName}}.\n\nWould you have a few minutes to share your thoughts?\n\nBest regards,\n{{senderFirstName}}",
    ),
    opening(
        TemplateCategory::Business,
        "Following up from {{meetingDay}}",
        "Hi {{firstName}},\n\nI wanted to follow up on what we touched on last {{meetingDay}}. I've given it some more thought and have a few ideas to share.\n\nWould a quick call this week work for you?\n\nBest,\n{{senderName}}",
    ),
    opening(
        TemplateCategory::Networking,
        "Great connecting with you",
        "Hi {{firstName}},\n\nIt was great to connect recently. I enjoyed hearing about what the team at {{company}} is working on.\n\nLet's keep in touch. I'd love to swap notes again sometime.\n\nCheers,\n{{senderFirstName}}",
    ),
    opening(
        TemplateCategory::Networking,
        "Coffee on {{meetingDay}}?",
        "Hi {{firstName}},\n\nAre you free for a coffee on {{meetingDay}}? I'd like to hear how things are going at {{company}}.\n\nLet me know what suits you.\n\n{{senderFirstName}}",
    ),
    opening(
        TemplateCategory::Feedback,
        "Your thoughts on the new {{productName}}",
        "Hi {{firstName}},\n\nWe rolled out a new version of our {{productName}} this week and I'd value your honest opinion.\n\nAnything that stood out, good or bad?\n\nThanks,\n{{senderName}}",
    ),
    opening(
        TemplateCategory::Feedback,
        "Ticket {{ticketNum}} follow-up",
        "Hi {{firstName}},\n\nI'm checking in on ticket {{ticketNum}}. Did the fix we shipped resolve the issue on your side?\n\nBest,\n{{senderFirstName}}",
    ),
    opening(
        TemplateCategory::Collaboration,
        "Working together on {{productName}}",
        "Hi {{firstName}},\n\nI think there's a good fit between our {{productName}} and what {{company}} is building. Would you be open to exploring a small joint project?\n\nBest regards,\n{{senderName}}",
    ),
    opening(
        TemplateCategory::Collaboration,
        "Invoice {{invoiceNum}} for the shared project",
        "Hi {{firstName}},\n\nAttached details for invoice {{invoiceNum}}, dated {{date}}, cover the work we did together last month.\n\nLet me know if anything needs adjusting.\n\nThanks,\n{{senderFirstName}}",
    ),
    opening(
        TemplateCategory::Casual,
        "Hope your week is going well",
        "Hey {{firstName}},\n\nJust wanted to say hi and see how things are going. Anything fun planned for the weekend?\n\n{{senderFirstName}}",
    ),
    opening(
        TemplateCategory::Casual,
        "Long time no talk",
        "Hi {{firstName}},\n\nIt's been a while! How have you been? Would be great to catch up soon.\n\nTalk soon,\n{{senderFirstName}}",
    ),
];

const REPLIES: &[Seed] = &[
    reply(
        TemplateCategory::Business,
        "Quick question about {{productName}}",
        "Re: Quick question about {{productName}}",
        "Hi {{firstName}},\n\nThanks for reaching out. Happy to share what I know about it. I'm free on {{meetingDay}} if a short call is easier.\n\nBest,\n{{senderFirstName}}",
    ),
    reply(
        TemplateCategory::Business,
        "Following up from {{meetingDay}}",
        "Re: Following up from {{meetingDay}}",
        "Hi {{firstName}},\n\nGood to hear from you. This week works. Send over a time and I'll make it happen.\n\nRegards,\n{{senderName}}",
    ),
    reply(
        TemplateCategory::Networking,
        "Great connecting with you",
        "Re: Great connecting with you",
        "Hi {{firstName}},\n\nLikewise, it was a pleasure. Definitely keen to stay in touch.\n\nCheers,\n{{senderFirstName}}",
    ),
    reply(
        TemplateCategory::Feedback,
        "Your thoughts on the new {{productName}}",
        "Re: Your thoughts on the new {{productName}}",
        "Hi {{firstName}},\n\nI've had a look and overall it feels faster. I'll send a few notes by the end of the week.\n\nThanks,\n{{senderFirstName}}",
    ),
    reply(
        TemplateCategory::Collaboration,
        "Working together on {{productName}}",
        "Re: Working together on {{productName}}",
        "Hi {{firstName}},\n\nThat sounds interesting. Let's set up a call to go over the details.\n\nBest,\n{{senderName}}",
    ),
    reply(
        TemplateCategory::Casual,
        "Hope your week is going well",
        "Re: Hope your week is going well",
        "Hey {{firstName}},\n\nAll good here, thanks for asking! Nothing big planned, just catching up on some reading.\n\n{{senderFirstName}}",
    ),
    reply(
        TemplateCategory::Casual,
        "Long time no talk",
        "Re: Long time no talk",
        "Hi {{firstName}},\n\nGreat to hear from you! Things have been busy but good. Let's find a time soon.\n\n{{senderFirstName}}",
    ),
];

/// Outcome of a seeding run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub created: u32,
    pub skipped: u32,
}

fn create_input(
    seed: &Seed,
    placeholders: &Placeholders,
    reply_to_template_id: Option<TemplateId>,
) -> CreateTemplate {
    let mut variables = placeholders.tokens(seed.subject);
    for token in placeholders.tokens(seed.body) {
        if !variables.contains(&token) {
            variables.push(token);
        }
    }

    CreateTemplate {
        name: format!("{}: {}", seed.category, seed.subject),
        category: seed.category,
        subject: seed.subject.to_string(),
        body: seed.body.to_string(),
        language: SEED_LANGUAGE.to_string(),
        is_initial: seed.answers.is_none(),
        reply_to_template_id,
        variables,
    }
}

async fn insert(
    templates: &dyn TemplateRepository,
    input: CreateTemplate,
    summary: &mut SeedSummary,
) -> Result<()> {
    match templates.create_if_absent(input).await? {
        Some(template) => {
            debug!(category = %template.category, subject = %template.subject, "Template seeded");
            summary.created += 1;
        }
        None => summary.skipped += 1,
    }
    Ok(())
}

/// Insert the built-in opening and reply templates that are not there yet
pub async fn seed_templates(templates: &dyn TemplateRepository) -> Result<SeedSummary> {
    let placeholders = Placeholders::new()?;
    let mut summary = SeedSummary::default();

    for seed in OPENINGS {
        insert(templates, create_input(seed, &placeholders, None), &mut summary).await?;
    }

    let parents: HashMap<String, TemplateId> = templates
        .find(TemplateFilter {
            is_initial: Some(true),
            category: None,
            language: Some(SEED_LANGUAGE.to_string()),
        })
        .await?
        .into_iter()
        .map(|t| (t.subject, t.id))
        .collect();

    for seed in REPLIES {
        let parent = seed.answers.and_then(|subject| parents.get(subject).copied());
        insert(templates, create_input(seed, &placeholders, parent), &mut summary).await?;
    }

    info!(created = summary.created, skipped = summary.skipped, "Templates seeded");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::template_variables;
    use chrono::Utc;
    use crate::content::ContentGenerator;
    use kindling_storage::memory::MemoryStore;
    use kindling_storage::{Template, WarmupMessage};
    use std::sync::Arc;
    use uuid::Uuid;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn seeded(store: &MemoryStore, is_initial: bool) -> Vec<Template> {
        store
            .templates()
            .into_iter()
            .filter(|t| t.is_initial == is_initial)
            .collect()
    }

    #[tokio::test]
    async fn test_seeding_is_idempotent() {
        let store = MemoryStore::new();

        let first = seed_templates(&store).await.unwrap();
        assert_eq!(
            first,
            SeedSummary {
                created: (OPENINGS.len() + REPLIES.len()) as u32,
                skipped: 0
            }
        );

        let second = seed_templates(&store).await.unwrap();
        assert_eq!(
            second,
            SeedSummary {
                created: 0,
                skipped: (OPENINGS.len() + REPLIES.len()) as u32
            }
        );
        assert_eq!(store.templates().len(), OPENINGS.len() + REPLIES.len());
    }

    #[tokio::test]
    async fn test_every_reply_is_linked_to_its_opening() {
        let store = MemoryStore::new();
        seed_templates(&store).await.unwrap();

        let openings = seeded(&store, true);
        let replies = seeded(&store, false);
        assert_eq!(replies.len(), REPLIES.len());
        for reply in &replies {
            let parent = openings
                .iter()
                .find(|t| Some(t.id) == reply.reply_to_template_id)
                .unwrap();
            assert_eq!(parent.category, reply.category);
            assert_eq!(reply.subject, format!("Re: {}", parent.subject));
        }
    }

    #[tokio::test]
    async fn test_seeded_library_replaces_fallback_content() {
        let store = Arc::new(MemoryStore::new());
        seed_templates(store.as_ref()).await.unwrap();
        let content = ContentGenerator::new(store.clone(), SEED_LANGUAGE).unwrap();

        let opening = content.compose_initial("sam@example.com", "ana@example.org").await;
        let opening_id = opening.template_id.unwrap();
        assert!(!opening.body.contains("{{"));

        let now = Utc::now();
        let original = WarmupMessage {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            step: 1,
            sender_id: Uuid::new_v4(),
            receiver_id: Uuid::new_v4(),
            template_id: Some(opening_id),
            subject: opening.subject,
            body: opening.body,
            correlation_id: Uuid::new_v4(),
            rfc_message_id: "x@example.com".to_string(),
            in_reply_to: None,
            provider_message_id: None,
            provider_thread_id: None,
            status: "delivered".to_string(),
            landed_in_inbox: true,
            landed_in_spam: false,
            was_opened: false,
            was_replied: false,
            was_bounced: false,
            error_message: None,
            retry_count: 0,
            sent_at: Some(now),
            delivered_at: Some(now),
            opened_at: None,
            replied_at: None,
            bounced_at: None,
            archived_at: None,
            created_at: now,
            updated_at: now,
        };
        let reply = content
            .render_reply(&original, 1, "ana@example.org", "sam@example.com")
            .await;
        let reply_id = reply.template_id.unwrap();
        let chosen = TemplateRepository::get(store.as_ref(), reply_id).await.unwrap().unwrap();
        assert!(!chosen.is_initial);
        assert!(reply.subject.starts_with("Re: "));
    }

    #[test]
    fn test_seeds_only_use_known_tokens() {
        let placeholders = Placeholders::new().unwrap();
        let vars = template_variables(
            "sam.lee@example.com",
            "ana@example.org",
            Utc::now(),
            &mut StdRng::seed_from_u64(7),
        );

        for seed in OPENINGS.iter().chain(REPLIES) {
            let input = create_input(seed, &placeholders, None);
            for token in &input.variables {
                assert!(vars.contains_key(token), "unknown token {} in {}", token, seed.subject);
            }
        }
    }
}
