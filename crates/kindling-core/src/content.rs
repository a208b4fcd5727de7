//! Content generator
//!
//! Fills warmup templates with synthetic variables and produces step-aware
//! replies. Selection never fails a job: when no template can be found the
//! generator falls back to a fixed-form acknowledgement.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use kindling_common::config::WarmupConfig;
use kindling_common::types::{TemplateCategory, TemplateId};
use kindling_common::{Error, Result};
use kindling_storage::{Template, TemplateFilter, TemplateRepository, WarmupMessage};
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use tracing::{debug, warn};

const COMPANIES: &[&str] = &[
    "Acme Corp",
    "TechStart Inc",
    "Global Solutions",
    "Innovation Labs",
    "Digital Ventures",
    "NextGen Systems",
    "Prime Industries",
    "Elite Services",
];

const PRODUCTS: &[&str] = &[
    "Platform",
    "Software",
    "Solution",
    "Service",
    "Tool",
    "System",
    "Application",
    "Dashboard",
    "Portal",
];

const MEETING_DAYS: &[&str] = &["Monday", "Tuesday", "Wednesday", "Thursday", "Friday"];

const FALLBACK_LAST_NAME: &str = "Smith";

/// Subject and body ready to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContent {
    pub subject: String,
    pub body: String,
    pub template_id: Option<TemplateId>,
}

/// `{{name}}` placeholder substitution
pub struct Placeholders {
    pattern: Regex,
}

impl Placeholders {
    pub fn new() -> Result<Self> {
        let pattern = Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}")
            .map_err(|e| Error::Internal(format!("Invalid placeholder pattern: {}", e)))?;
        Ok(Self { pattern })
    }

    /// Token names in order of first appearance
    pub fn tokens(&self, text: &str) -> Vec<String> {
        let mut tokens: Vec<String> = Vec::new();
        for caps in self.pattern.captures_iter(text) {
            if !tokens.iter().any(|t| t == &caps[1]) {
                tokens.push(caps[1].to_string());
            }
        }
        tokens
    }

    /// Replace every token. Tokens without a value are dropped.
    pub fn fill(&self, text: &str, vars: &HashMap<String, String>) -> String {
        self.pattern
            .replace_all(text, |caps: &regex::Captures<'_>| {
                let name = &caps[1];
                match vars.get(name) {
                    Some(value) => value.clone(),
                    None => {
                        warn!(token = name, "Template token has no value");
                        String::new()
                    }
                }
            })
            .into_owned()
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}

/// First and last name guessed from an address's local part
pub fn names_from_email(email: &str) -> (String, Option<String>) {
    let local = email.split('@').next().unwrap_or(email);
    let mut parts = local
        .split(['.', '_', '-'])
        .filter(|p| !p.is_empty())
        .map(capitalize);

    let first = parts.next().unwrap_or_else(|| capitalize(local));
    (first, parts.next())
}

/// Synthetic variables for one sender/receiver pair
pub fn template_variables<R: Rng + ?Sized>(
    sender_email: &str,
    receiver_email: &str,
    now: DateTime<Utc>,
    rng: &mut R,
) -> HashMap<String, String> {
    let (first_name, last_name) = names_from_email(receiver_email);
    let (sender_first, sender_last) = names_from_email(sender_email);
    let sender_name = match sender_last {
        Some(last) => format!("{} {}", sender_first, last),
        None => sender_first.clone(),
    };

    let pick = |pool: &[&str], rng: &mut R| pool.choose(rng).copied().unwrap_or_default().to_string();

    let mut vars = HashMap::new();
    vars.insert("firstName".to_string(), first_name);
    vars.insert(
        "lastName".to_string(),
        last_name.unwrap_or_else(|| FALLBACK_LAST_NAME.to_string()),
    );
    vars.insert("senderName".to_string(), sender_name);
    vars.insert("senderFirstName".to_string(), sender_first);
    vars.insert("company".to_string(), pick(COMPANIES, &mut *rng));
    vars.insert("productName".to_string(), pick(PRODUCTS, &mut *rng));
    vars.insert("meetingDay".to_string(), pick(MEETING_DAYS, &mut *rng));
    vars.insert("date".to_string(), now.format("%B %-d, %Y").to_string());
    vars.insert("time".to_string(), now.format("%-I:%M %p").to_string());
    vars.insert(
        "invoiceNum".to_string(),
        format!("INV-{:04}", rng.gen_range(0..10_000)),
    );
    vars.insert(
        "ticketNum".to_string(),
        format!("TKT-{:04}", rng.gen_range(0..10_000)),
    );
    vars
}

/// Prefix `Re: ` once
pub fn reply_subject(subject: &str) -> String {
    if subject.get(..3).map_or(false, |p| p.eq_ignore_ascii_case("re:")) {
        subject.to_string()
    } else {
        format!("Re: {}", subject)
    }
}

/// Short acknowledgement for later steps of a conversation
pub fn canned_reply<R: Rng + ?Sized>(recipient_first_name: &str, rng: &mut R) -> String {
    let replies = [
        format!("Sounds good, {}!", recipient_first_name),
        "Perfect, thanks!".to_string(),
        "Great, appreciate it!".to_string(),
        "Understood, thank you.".to_string(),
        "Thanks for the update!".to_string(),
        "Got it, thanks!".to_string(),
        "All set, thank you!".to_string(),
    ];
    let index = rng.gen_range(0..replies.len());
    replies[index].clone()
}

/// Fixed-form acknowledgement used when no template is available
pub fn fallback_reply<R: Rng + ?Sized>(recipient_first_name: &str, rng: &mut R) -> String {
    let name = recipient_first_name;
    let replies = [
        format!("Hi {name},\n\nThank you for reaching out. I've received your email and will get back to you shortly.\n\nBest regards"),
        format!("Hello {name},\n\nThanks for your message. I appreciate you taking the time to connect.\n\nBest"),
        format!("Hi {name},\n\nI got your email. Let me review the details and I'll respond soon.\n\nThanks"),
        "Hello,\n\nThanks for getting in touch. I'll review your message and get back to you.\n\nRegards".to_string(),
        format!("Hi {name},\n\nReceived your email. I'll take a look and respond shortly.\n\nBest regards"),
    ];
    let index = rng.gen_range(0..replies.len());
    replies[index].clone()
}

/// Delay before a reply is sent
pub fn reply_delay<R: Rng + ?Sized>(config: &WarmupConfig, rng: &mut R) -> Duration {
    let (low, high) = if config.testing_mode {
        (60, 180)
    } else {
        let low = config.min_reply_delay_hours.saturating_mul(3600);
        let high = config.max_reply_delay_hours.saturating_mul(3600).max(low);
        (low, high)
    };
    let secs = rng.gen_range(low..=high);
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
}

/// Template-backed content generator
pub struct ContentGenerator {
    templates: Arc<dyn TemplateRepository>,
    placeholders: Placeholders,
    language: String,
}

impl ContentGenerator {
    pub fn new(templates: Arc<dyn TemplateRepository>, language: impl Into<String>) -> Result<Self> {
        Ok(Self {
            templates,
            placeholders: Placeholders::new()?,
            language: language.into(),
        })
    }

    pub fn placeholders(&self) -> &Placeholders {
        &self.placeholders
    }

    /// Fill a template for a sender/receiver pair
    pub fn render_initial(
        &self,
        template: &Template,
        sender_email: &str,
        receiver_email: &str,
    ) -> RenderedContent {
        let vars = template_variables(sender_email, receiver_email, Utc::now(), &mut rand::thread_rng());
        RenderedContent {
            subject: self.placeholders.fill(&template.subject, &vars),
            body: self.placeholders.fill(&template.body, &vars),
            template_id: Some(template.id),
        }
    }

    /// Opening message for a new conversation
    pub async fn compose_initial(&self, sender_email: &str, receiver_email: &str) -> RenderedContent {
        let candidates = self
            .find(TemplateFilter {
                is_initial: Some(true),
                category: None,
                language: Some(self.language.clone()),
            })
            .await;

        let chosen = candidates.choose(&mut rand::thread_rng()).cloned();
        match chosen {
            Some(template) => {
                self.note_usage(template.id).await;
                self.render_initial(&template, sender_email, receiver_email)
            }
            None => {
                warn!("No initial templates available, using fallback content");
                let (first, _) = names_from_email(receiver_email);
                let (sender_first, _) = names_from_email(sender_email);
                RenderedContent {
                    subject: format!("Quick hello from {}", sender_first),
                    body: format!(
                        "Hi {},\n\nHope your week is going well. I wanted to reach out and say hello.\n\nBest,\n{}",
                        first, sender_first
                    ),
                    template_id: None,
                }
            }
        }
    }

    /// Reply to `original`. `step` is the reply's ordinal: 1 is the first reply.
    pub async fn render_reply(
        &self,
        original: &WarmupMessage,
        step: i32,
        sender_email: &str,
        receiver_email: &str,
    ) -> RenderedContent {
        let subject = reply_subject(&original.subject);
        let (recipient_first, _) = names_from_email(receiver_email);

        if step >= 2 {
            return RenderedContent {
                subject,
                body: canned_reply(&recipient_first, &mut rand::thread_rng()),
                template_id: None,
            };
        }

        match self.reply_template(original.template_id).await {
            Some(template) => {
                self.note_usage(template.id).await;
                let vars = template_variables(
                    sender_email,
                    receiver_email,
                    Utc::now(),
                    &mut rand::thread_rng(),
                );
                let filled_subject = self.placeholders.fill(&template.subject, &vars);
                RenderedContent {
                    subject: if filled_subject.trim().is_empty() {
                        subject
                    } else {
                        reply_subject(&filled_subject)
                    },
                    body: self.placeholders.fill(&template.body, &vars),
                    template_id: Some(template.id),
                }
            }
            None => {
                debug!(message_id = %original.id, "No reply template, using fallback reply");
                RenderedContent {
                    subject,
                    body: fallback_reply(&recipient_first, &mut rand::thread_rng()),
                    template_id: None,
                }
            }
        }
    }

    /// Reply template for a parent: a direct follow-up, then the parent's
    /// category, then any reply template
    async fn reply_template(&self, parent_template: Option<TemplateId>) -> Option<Template> {
        let replies = self
            .find(TemplateFilter {
                is_initial: Some(false),
                category: None,
                language: Some(self.language.clone()),
            })
            .await;
        if replies.is_empty() {
            return None;
        }

        let parent = match parent_template {
            Some(id) => self.templates.get(id).await.ok().flatten(),
            None => None,
        };
        let category: Option<TemplateCategory> = parent.as_ref().and_then(|t| t.category_enum());

        let direct: Vec<&Template> = replies
            .iter()
            .filter(|t| parent_template.is_some() && t.reply_to_template_id == parent_template)
            .collect();
        let same_category: Vec<&Template> = replies
            .iter()
            .filter(|t| category.is_some() && t.category_enum() == category)
            .collect();

        let mut rng = rand::thread_rng();
        let pool: Vec<&Template> = if !direct.is_empty() {
            direct
        } else if !same_category.is_empty() {
            same_category
        } else {
            replies.iter().collect()
        };
        pool.choose(&mut rng).map(|t| (*t).clone())
    }

    async fn find(&self, filter: TemplateFilter) -> Vec<Template> {
        match self.templates.find(filter).await {
            Ok(templates) => templates,
            Err(e) => {
                warn!(error = %e, "Template lookup failed");
                Vec::new()
            }
        }
    }

    async fn note_usage(&self, id: TemplateId) {
        if let Err(e) = self.templates.increment_usage(id).await {
            warn!(template_id = %id, error = %e, "Failed to record template usage");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindling_storage::memory::MemoryStore;
    use kindling_storage::CreateTemplate;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use uuid::Uuid;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn template(name: &str, is_initial: bool, category: TemplateCategory) -> CreateTemplate {
        CreateTemplate {
            name: name.to_string(),
            category,
            subject: format!("{} for {{{{firstName}}}}", name),
            body: "Hi {{firstName}}, about {{productName}} at {{company}}.\n{{senderName}}".to_string(),
            language: "en".to_string(),
            is_initial,
            reply_to_template_id: None,
            variables: vec![
                "firstName".to_string(),
                "productName".to_string(),
                "company".to_string(),
                "senderName".to_string(),
            ],
        }
    }

    fn original(template_id: Option<TemplateId>) -> WarmupMessage {
        let now = Utc::now();
        WarmupMessage {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            step: 1,
            sender_id: Uuid::new_v4(),
            receiver_id: Uuid::new_v4(),
            template_id,
            subject: "Project update".to_string(),
            body: "Hello".to_string(),
            correlation_id: Uuid::new_v4(),
            rfc_message_id: "a@example.com".to_string(),
            in_reply_to: None,
            provider_message_id: None,
            provider_thread_id: None,
            status: "sent".to_string(),
            landed_in_inbox: false,
            landed_in_spam: false,
            was_opened: false,
            was_replied: false,
            was_bounced: false,
            error_message: None,
            retry_count: 0,
            sent_at: Some(now),
            delivered_at: None,
            opened_at: None,
            replied_at: None,
            bounced_at: None,
            archived_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_fill_replaces_every_token() {
        let placeholders = Placeholders::new().unwrap();
        let out = placeholders.fill(
            "Hi {{firstName}}, re {{topic}}",
            &vars(&[("firstName", "Sam"), ("topic", "pricing")]),
        );
        assert_eq!(out, "Hi Sam, re pricing");
    }

    #[test]
    fn test_fill_tolerates_whitespace_and_drops_unknown() {
        let placeholders = Placeholders::new().unwrap();
        let out = placeholders.fill("{{ firstName }} {{missing}}!", &vars(&[("firstName", "Sam")]));
        assert_eq!(out, "Sam !");
        assert!(!out.contains("{{"));
    }

    #[test]
    fn test_names_from_email() {
        assert_eq!(
            names_from_email("jane.doe@example.com"),
            ("Jane".to_string(), Some("Doe".to_string()))
        );
        assert_eq!(names_from_email("BOB@example.com"), ("Bob".to_string(), None));
        assert_eq!(
            names_from_email("ana_maria-lopez@example.com"),
            ("Ana".to_string(), Some("Maria".to_string()))
        );
    }

    #[test]
    fn test_variables_cover_template_vocabulary() {
        let mut rng = StdRng::seed_from_u64(7);
        let vars = template_variables("alice.jones@a.com", "bob@b.com", Utc::now(), &mut rng);

        assert_eq!(vars["firstName"], "Bob");
        assert_eq!(vars["lastName"], "Smith");
        assert_eq!(vars["senderName"], "Alice Jones");
        assert_eq!(vars["senderFirstName"], "Alice");
        assert!(COMPANIES.contains(&vars["company"].as_str()));
        assert!(PRODUCTS.contains(&vars["productName"].as_str()));
        assert!(vars["invoiceNum"].starts_with("INV-"));
        assert_eq!(vars["ticketNum"].len(), "TKT-0000".len());
    }

    #[test]
    fn test_reply_subject_not_doubled() {
        assert_eq!(reply_subject("Hello"), "Re: Hello");
        assert_eq!(reply_subject("Re: Hello"), "Re: Hello");
        assert_eq!(reply_subject("RE: Hello"), "RE: Hello");
    }

    #[test]
    fn test_reply_delay_bounds() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut config = WarmupConfig::default();
        for _ in 0..50 {
            let d = reply_delay(&config, &mut rng);
            assert!(d >= Duration::hours(2) && d <= Duration::hours(8));
        }

        config.testing_mode = true;
        for _ in 0..50 {
            let d = reply_delay(&config, &mut rng);
            assert!(d >= Duration::minutes(1) && d <= Duration::minutes(3));
        }
    }

    #[tokio::test]
    async fn test_compose_initial_uses_template_and_counts_usage() {
        let store = Arc::new(MemoryStore::new());
        let created = TemplateRepository::create(
            store.as_ref(),
            template("Intro", true, TemplateCategory::Business),
        )
        .await
        .unwrap();

        let generator = ContentGenerator::new(store.clone(), "en").unwrap();
        let content = generator.compose_initial("alice@a.com", "bob.stone@b.com").await;

        assert_eq!(content.subject, "Intro for Bob");
        assert!(content.body.starts_with("Hi Bob, about "));
        assert!(content.body.ends_with("\nAlice"));
        assert_eq!(content.template_id, Some(created.id));

        let stored = TemplateRepository::get(store.as_ref(), created.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.usage_count, 1);
    }

    #[tokio::test]
    async fn test_first_reply_prefers_parent_category() {
        let store = Arc::new(MemoryStore::new());
        let parent = TemplateRepository::create(
            store.as_ref(),
            template("Intro", true, TemplateCategory::Feedback),
        )
        .await
        .unwrap();
        TemplateRepository::create(store.as_ref(), template("Casual reply", false, TemplateCategory::Casual))
            .await
            .unwrap();
        let feedback = TemplateRepository::create(
            store.as_ref(),
            template("Feedback reply", false, TemplateCategory::Feedback),
        )
        .await
        .unwrap();

        let generator = ContentGenerator::new(store.clone(), "en").unwrap();
        for _ in 0..10 {
            let reply = generator
                .render_reply(&original(Some(parent.id)), 1, "bob@b.com", "alice@a.com")
                .await;
            assert_eq!(reply.template_id, Some(feedback.id));
            assert_eq!(reply.subject, "Re: Feedback reply for Alice");
        }
    }

    #[tokio::test]
    async fn test_later_replies_are_canned() {
        let store = Arc::new(MemoryStore::new());
        TemplateRepository::create(store.as_ref(), template("Reply", false, TemplateCategory::Business))
            .await
            .unwrap();
        let generator = ContentGenerator::new(store, "en").unwrap();

        let reply = generator
            .render_reply(&original(None), 2, "bob@b.com", "alice@a.com")
            .await;
        assert_eq!(reply.subject, "Re: Project update");
        assert_eq!(reply.template_id, None);
        assert!(reply.body.len() < 40);
    }

    #[tokio::test]
    async fn test_missing_templates_fall_back() {
        let store = Arc::new(MemoryStore::new());
        let generator = ContentGenerator::new(store, "en").unwrap();

        let reply = generator
            .render_reply(&original(None), 1, "bob@b.com", "alice@a.com")
            .await;
        assert_eq!(reply.subject, "Re: Project update");
        assert_eq!(reply.template_id, None);
        assert!(!reply.body.is_empty());

        let initial = generator.compose_initial("alice@a.com", "bob@b.com").await;
        assert_eq!(initial.subject, "Quick hello from Alice");
        assert_eq!(initial.template_id, None);
    }
}
