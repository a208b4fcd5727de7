//! SMTP + IMAP transport
//!
//! Sends through lettre's async SMTP transport and reads, flags and archives
//! through the IMAP client. IMAP has no thread ids, so the RFC Message-ID
//! doubles as the thread reference.

use std::time::Duration;

use async_trait::async_trait;
use kindling_common::types::Provider;
use kindling_common::{Error, Result};
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use mail_parser::MessageParser;
use tracing::{debug, info, warn};

use super::imap::ImapClient;
use super::{
    marker_from_headers, ArchiveOutcome, ArchiveTarget, OutgoingMessage, ProviderMessage,
    ProviderMessageRef, SentMessage, Transport,
};
use crate::vault::{MailboxLogin, Security};

const INBOX: &str = "INBOX";

/// Archive folder for a provider's IMAP layout
pub fn archive_folder(provider: Provider) -> &'static str {
    match provider {
        Provider::Gmail => "[Gmail]/All Mail",
        _ => "Archive",
    }
}

/// Spam folder for a provider's IMAP layout
pub fn spam_folder(provider: Provider) -> &'static str {
    match provider {
        Provider::Gmail => "[Gmail]/Spam",
        _ => "Junk",
    }
}

/// Classify an SMTP failure by reply code and text
pub fn classify_smtp_error(code: Option<u16>, message: &str) -> Error {
    let lower = message.to_ascii_lowercase();
    match code {
        Some(530 | 534 | 535) => Error::Auth(message.to_string()),
        Some(550 | 551 | 553) => Error::Transport(message.to_string()),
        Some(c) if (400..500).contains(&c) => Error::Transient(message.to_string()),
        _ if lower.contains("5.1.1") || lower.contains("user unknown") => {
            Error::Transport(message.to_string())
        }
        _ if lower.contains("authentication") || lower.contains("5.7.8") => {
            Error::Auth(message.to_string())
        }
        Some(c) if c >= 500 => Error::Transport(message.to_string()),
        _ => Error::Transient(message.to_string()),
    }
}

fn smtp_error(e: lettre::transport::smtp::Error) -> Error {
    let code = e.status().and_then(|c| c.to_string().parse().ok());
    if e.is_timeout() {
        return Error::Transient(format!("SMTP timeout: {}", e));
    }
    classify_smtp_error(code, &e.to_string())
}

/// Folder and UID packed into a provider message id
fn message_ref(folder: &str, uid: u32) -> String {
    format!("{}/{}", folder, uid)
}

fn parse_message_ref(id: &str) -> Result<(&str, u32)> {
    id.rsplit_once('/')
        .and_then(|(folder, uid)| Some((folder, uid.parse().ok()?)))
        .ok_or_else(|| Error::Validation(format!("Invalid IMAP message reference {}", id)))
}

fn header_pairs(raw: &[u8]) -> Vec<(String, String)> {
    let Some(parsed) = MessageParser::default().parse_headers(raw) else {
        return Vec::new();
    };
    parsed
        .headers()
        .iter()
        .filter_map(|h| {
            let value = std::str::from_utf8(raw.get(h.offset_start..h.offset_end)?).ok()?;
            Some((h.name().to_string(), value.trim().to_string()))
        })
        .collect()
}

fn strip_brackets(id: &str) -> &str {
    id.trim().trim_start_matches('<').trim_end_matches('>')
}

/// SMTP for sending, IMAP for everything else
pub struct SmtpImapTransport {
    login: MailboxLogin,
    provider: Provider,
}

impl SmtpImapTransport {
    pub fn new(login: MailboxLogin, provider: Provider) -> Self {
        Self { login, provider }
    }

    fn mailer(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let host = &self.login.smtp.host;
        let builder = match self.login.smtp.security {
            Security::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(host),
            Security::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host),
            Security::None => Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)),
        }
        .map_err(|e| Error::Validation(format!("Invalid SMTP host {}: {}", host, e)))?;

        Ok(builder
            .port(self.login.smtp.port)
            .credentials(Credentials::new(
                self.login.username.clone(),
                self.login.password.clone(),
            ))
            .timeout(Some(Duration::from_secs(30)))
            .build())
    }

    async fn imap(&self) -> Result<ImapClient> {
        let mut client = ImapClient::connect(&self.login.imap).await?;
        client
            .login(&self.login.username, &self.login.password)
            .await?;
        Ok(client)
    }

    async fn scan_folder(
        client: &mut ImapClient,
        folder: &str,
        in_spam: bool,
        limit: usize,
    ) -> Result<Vec<ProviderMessageRef>> {
        client.select(folder).await?;
        let mut uids = client
            .uid_search("UNSEEN HEADER X-Warmup-Email \"true\"")
            .await?;
        uids.truncate(limit);

        let refs = client
            .uid_fetch_headers(&uids)
            .await?
            .into_iter()
            .filter_map(|(uid, raw)| {
                let headers = header_pairs(&raw);
                let (is_warmup, correlation_id) = marker_from_headers(&headers);
                if !is_warmup {
                    return None;
                }
                let thread_id = super::header_value(&headers, "Message-ID")
                    .map(|id| strip_brackets(id).to_string());
                Some(ProviderMessageRef {
                    id: message_ref(folder, uid),
                    thread_id,
                    correlation_id,
                    in_spam,
                })
            })
            .collect();
        Ok(refs)
    }
}

#[async_trait]
impl Transport for SmtpImapTransport {
    async fn send(&self, message: &OutgoingMessage) -> Result<SentMessage> {
        let from: Address = message
            .from
            .parse()
            .map_err(|e| Error::Validation(format!("Invalid sender {}: {}", message.from, e)))?;
        let to: Address = message
            .to
            .parse()
            .map_err(|e| Error::Transport(format!("Invalid recipient {}: {}", message.to, e)))?;
        let envelope = Envelope::new(Some(from), vec![to])
            .map_err(|e| Error::Validation(format!("Invalid envelope: {}", e)))?;

        let raw = message.to_rfc5322()?;
        let response = self
            .mailer()?
            .send_raw(&envelope, &raw)
            .await
            .map_err(smtp_error)?;

        debug!(code = %response.code(), to = %message.to, "SMTP accepted message");
        Ok(SentMessage {
            provider_message_id: message.rfc_message_id.clone(),
            provider_thread_id: Some(message.rfc_message_id.clone()),
        })
    }

    async fn list_tagged_unread(&self, limit: usize) -> Result<Vec<ProviderMessageRef>> {
        let mut client = self.imap().await?;
        let mut found = Self::scan_folder(&mut client, INBOX, false, limit).await?;

        let spam = spam_folder(self.provider);
        match Self::scan_folder(&mut client, spam, true, limit).await {
            Ok(refs) => found.extend(refs),
            Err(e) => warn!(folder = spam, error = %e, "Spam folder scan failed"),
        }

        client.logout().await?;
        found.truncate(limit);
        Ok(found)
    }

    async fn archive_thread(&self, target: &ArchiveTarget) -> Result<ArchiveOutcome> {
        let id = strip_brackets(&target.rfc_message_id);
        let mut client = self.imap().await?;
        client.select(INBOX).await?;
        let uids = client
            .uid_search(&format!(
                "OR HEADER Message-ID \"<{id}>\" HEADER References \"<{id}>\""
            ))
            .await?;

        if uids.is_empty() {
            client.logout().await?;
            return Ok(ArchiveOutcome::NotFound);
        }

        let folder = archive_folder(self.provider);
        client.uid_move(&uids, folder).await?;
        client.logout().await?;

        info!(count = uids.len(), folder, "Archived IMAP messages");
        Ok(ArchiveOutcome::Archived)
    }

    async fn get_message(&self, id: &str) -> Result<ProviderMessage> {
        let (folder, uid) = parse_message_ref(id)?;
        let mut client = self.imap().await?;
        client.select(folder).await?;
        let fetched = client.uid_fetch_headers(&[uid]).await?;
        client.logout().await?;

        let (_, raw) = fetched
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("message", id))?;
        let headers = header_pairs(&raw);
        let (is_warmup, correlation_id) = marker_from_headers(&headers);

        Ok(ProviderMessage {
            id: id.to_string(),
            thread_id: super::header_value(&headers, "Message-ID")
                .map(|v| strip_brackets(v).to_string()),
            subject: super::header_value(&headers, "Subject").map(str::to_string),
            from: super::header_value(&headers, "From").map(str::to_string),
            is_warmup,
            correlation_id,
            in_spam: folder == spam_folder(self.provider),
            unread: true,
        })
    }

    async fn mark_read(&self, message: &ProviderMessageRef) -> Result<()> {
        let (folder, uid) = parse_message_ref(&message.id)?;
        let mut client = self.imap().await?;
        client.select(folder).await?;
        client.uid_mark_seen(uid).await?;
        client.logout().await
    }

    async fn test_connection(&self) -> Result<()> {
        let ok = self
            .mailer()?
            .test_connection()
            .await
            .map_err(smtp_error)?;
        if !ok {
            return Err(Error::Transient(format!(
                "SMTP server {} did not answer",
                self.login.smtp.host
            )));
        }

        let client = self.imap().await?;
        client.logout().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_provider_folders() {
        assert_eq!(archive_folder(Provider::Gmail), "[Gmail]/All Mail");
        assert_eq!(spam_folder(Provider::Gmail), "[Gmail]/Spam");
        assert_eq!(archive_folder(Provider::Custom), "Archive");
        assert_eq!(spam_folder(Provider::Outlook), "Junk");
    }

    #[test]
    fn test_smtp_error_classification() {
        assert!(matches!(
            classify_smtp_error(Some(535), "5.7.8 Username and Password not accepted"),
            Error::Auth(_)
        ));
        assert!(matches!(
            classify_smtp_error(Some(550), "5.1.1 The email account does not exist"),
            Error::Transport(_)
        ));
        assert!(matches!(
            classify_smtp_error(Some(421), "4.7.0 Try again later"),
            Error::Transient(_)
        ));
        assert!(matches!(
            classify_smtp_error(None, "Connection refused"),
            Error::Transient(_)
        ));
        assert!(matches!(
            classify_smtp_error(Some(554), "Transaction failed"),
            Error::Transport(_)
        ));
    }

    #[test]
    fn test_message_ref_keeps_nested_folder() {
        let id = message_ref("[Gmail]/Spam", 17);
        assert_eq!(id, "[Gmail]/Spam/17");
        assert_eq!(parse_message_ref(&id).unwrap(), ("[Gmail]/Spam", 17));
        assert!(parse_message_ref("INBOX").is_err());
    }

    #[test]
    fn test_header_pairs_reads_markers() {
        let raw = b"Message-ID: <a@b>\r\nX-Warmup-Email: true\r\nX-Warmup-Id: 00000000-0000-0000-0000-000000000000\r\n\r\n";
        let headers = header_pairs(raw);
        let (is_warmup, correlation) = marker_from_headers(&headers);

        assert!(is_warmup);
        assert_eq!(correlation, Some(uuid::Uuid::nil()));
        assert_eq!(
            super::super::header_value(&headers, "message-id").map(strip_brackets),
            Some("a@b")
        );
    }
}
