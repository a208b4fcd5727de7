//! Gmail API transport
//!
//! Used for OAuth-connected Gmail accounts and, with a delegated token
//! source, for Workspace mailboxes reached through domain-wide delegation.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use kindling_common::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::oauth::TokenSource;
use super::{
    check_status, http_error, marker_from_headers, ArchiveOutcome, ArchiveTarget,
    OutgoingMessage, ProviderMessage, ProviderMessageRef, SentMessage, Transport,
    CORRELATION_HEADER, WARMUP_HEADER,
};

const METADATA_HEADERS: [&str; 5] = [WARMUP_HEADER, CORRELATION_HEADER, "Message-ID", "Subject", "From"];

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest<'a> {
    raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyRequest<'a> {
    remove_label_ids: &'a [&'a str],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageId {
    id: String,
    #[serde(default)]
    thread_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageId>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct Payload {
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageMetadata {
    id: String,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    label_ids: Vec<String>,
    #[serde(default)]
    payload: Payload,
}

impl MessageMetadata {
    fn headers(&self) -> Vec<(String, String)> {
        self.payload
            .headers
            .iter()
            .map(|h| (h.name.clone(), h.value.clone()))
            .collect()
    }

    fn has_label(&self, label: &str) -> bool {
        self.label_ids.iter().any(|l| l == label)
    }
}

/// Gmail REST client for one mailbox
pub struct GmailTransport {
    http: reqwest::Client,
    base: String,
    tokens: Arc<dyn TokenSource>,
}

impl GmailTransport {
    pub fn new(http: reqwest::Client, base: String, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/users/me/{}", self.base, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(http_error)?;
        check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Transport(format!("Malformed Gmail response: {}", e)))
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        let token = self.tokens.access_token().await?;
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(http_error)?;
        check_status(response).await
    }

    /// Find a message in this mailbox by its RFC Message-ID
    async fn find_by_rfc_id(&self, rfc_message_id: &str) -> Result<Option<MessageId>> {
        let query = format!("rfc822msgid:{}", rfc_message_id);
        let list: MessageList = self
            .get_json("messages", &[("q", query.as_str()), ("maxResults", "1")])
            .await?;
        Ok(list.messages.into_iter().next())
    }

    async fn metadata(&self, id: &str) -> Result<MessageMetadata> {
        let mut query = vec![("format", "metadata")];
        query.extend(METADATA_HEADERS.iter().map(|h| ("metadataHeaders", *h)));
        self.get_json(&format!("messages/{}", id), &query).await
    }

    async fn scan(&self, search: &str, in_spam: bool, limit: usize) -> Result<Vec<ProviderMessageRef>> {
        let max = limit.to_string();
        let list: MessageList = self
            .get_json("messages", &[("q", search), ("maxResults", max.as_str())])
            .await?;

        let mut found = Vec::new();
        for entry in list.messages {
            let meta = self.metadata(&entry.id).await?;
            let (is_warmup, correlation_id) = marker_from_headers(&meta.headers());
            if !is_warmup {
                continue;
            }
            found.push(ProviderMessageRef {
                id: meta.id,
                thread_id: meta.thread_id.or(entry.thread_id),
                correlation_id,
                in_spam,
            });
        }
        Ok(found)
    }
}

#[async_trait]
impl Transport for GmailTransport {
    async fn send(&self, message: &OutgoingMessage) -> Result<SentMessage> {
        // Gmail only threads a reply when the thread id is given explicitly
        let thread_id = match &message.in_reply_to {
            Some(parent) => self
                .find_by_rfc_id(parent)
                .await?
                .and_then(|m| m.thread_id),
            None => None,
        };

        let raw = URL_SAFE_NO_PAD.encode(message.to_rfc5322()?);
        let request = SendRequest {
            raw,
            thread_id: thread_id.as_deref(),
        };
        let sent: MessageId = self
            .post_json("messages/send", &request)
            .await?
            .json()
            .await
            .map_err(|e| Error::Transport(format!("Malformed Gmail send response: {}", e)))?;

        debug!(id = %sent.id, to = %message.to, "Gmail accepted message");
        Ok(SentMessage {
            provider_message_id: sent.id,
            provider_thread_id: sent.thread_id.or(thread_id),
        })
    }

    async fn list_tagged_unread(&self, limit: usize) -> Result<Vec<ProviderMessageRef>> {
        let mut found = self.scan("in:inbox is:unread", false, limit).await?;
        match self.scan("in:spam is:unread", true, limit).await {
            Ok(refs) => found.extend(refs),
            Err(e) => warn!(error = %e, "Gmail spam scan failed"),
        }
        found.truncate(limit);
        Ok(found)
    }

    async fn archive_thread(&self, target: &ArchiveTarget) -> Result<ArchiveOutcome> {
        let thread_id = match &target.provider_thread_id {
            Some(id) => Some(id.clone()),
            None => self
                .find_by_rfc_id(&target.rfc_message_id)
                .await?
                .and_then(|m| m.thread_id),
        };
        let Some(thread_id) = thread_id else {
            return Ok(ArchiveOutcome::NotFound);
        };

        let request = ModifyRequest {
            remove_label_ids: &["INBOX"],
        };
        match self
            .post_json(&format!("threads/{}/modify", thread_id), &request)
            .await
        {
            Ok(_) => Ok(ArchiveOutcome::Archived),
            Err(Error::NotFound(_)) => Ok(ArchiveOutcome::NotFound),
            Err(e) => Err(e),
        }
    }

    async fn get_message(&self, id: &str) -> Result<ProviderMessage> {
        let meta = self.metadata(id).await?;
        let headers = meta.headers();
        let (is_warmup, correlation_id) = marker_from_headers(&headers);

        Ok(ProviderMessage {
            subject: super::header_value(&headers, "Subject").map(str::to_string),
            from: super::header_value(&headers, "From").map(str::to_string),
            in_spam: meta.has_label("SPAM"),
            unread: meta.has_label("UNREAD"),
            id: meta.id,
            thread_id: meta.thread_id,
            is_warmup,
            correlation_id,
        })
    }

    async fn mark_read(&self, message: &ProviderMessageRef) -> Result<()> {
        let request = ModifyRequest {
            remove_label_ids: &["UNREAD"],
        };
        self.post_json(&format!("messages/{}/modify", message.id), &request)
            .await?;
        Ok(())
    }

    async fn test_connection(&self) -> Result<()> {
        let _: serde_json::Value = self.get_json("profile", &[]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::oauth::StaticToken;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport(server: &MockServer) -> GmailTransport {
        GmailTransport::new(
            reqwest::Client::new(),
            server.uri(),
            Arc::new(StaticToken("tok".to_string())),
        )
    }

    fn outgoing(in_reply_to: Option<&str>) -> OutgoingMessage {
        OutgoingMessage {
            from: "alice@example.com".to_string(),
            from_name: None,
            to: "bob@example.org".to_string(),
            subject: "Re: Hello".to_string(),
            body: "Thanks!".to_string(),
            correlation_id: Uuid::nil(),
            rfc_message_id: "m2@example.com".to_string(),
            in_reply_to: in_reply_to.map(str::to_string),
            references: in_reply_to.map(|p| vec![p.to_string()]).unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn test_send_posts_raw_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/users/me/messages/send"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "g1", "threadId": "t1"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let sent = transport(&server).send(&outgoing(None)).await.unwrap();
        assert_eq!(
            sent,
            SentMessage {
                provider_message_id: "g1".to_string(),
                provider_thread_id: Some("t1".to_string()),
            }
        );

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = requests[0].body_json().unwrap();
        let raw = URL_SAFE_NO_PAD
            .decode(body["raw"].as_str().unwrap())
            .unwrap();
        assert!(String::from_utf8(raw).unwrap().contains("X-Warmup-Email: true"));
        assert!(body.get("threadId").is_none());
    }

    #[tokio::test]
    async fn test_reply_joins_parent_thread() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/me/messages"))
            .and(query_param("q", "rfc822msgid:m1@example.org"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": [{"id": "in1", "threadId": "t9"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/users/me/messages/send"))
            .and(body_string_contains("\"threadId\":\"t9\""))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"id": "g2", "threadId": "t9"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let sent = transport(&server)
            .send(&outgoing(Some("m1@example.org")))
            .await
            .unwrap();
        assert_eq!(sent.provider_thread_id.as_deref(), Some("t9"));
    }

    #[tokio::test]
    async fn test_list_keeps_only_tagged_messages() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("GET"))
            .and(path("/users/me/messages"))
            .and(query_param("q", "in:inbox is:unread"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "messages": [{"id": "a", "threadId": "ta"}, {"id": "b", "threadId": "tb"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/me/messages"))
            .and(query_param("q", "in:spam is:unread"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resultSizeEstimate": 0
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/me/messages/a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "a",
                "threadId": "ta",
                "labelIds": ["INBOX", "UNREAD"],
                "payload": {"headers": [
                    {"name": "X-Warmup-Email", "value": "true"},
                    {"name": "X-Warmup-Id", "value": id.to_string()}
                ]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/me/messages/b"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "b",
                "threadId": "tb",
                "labelIds": ["INBOX", "UNREAD"],
                "payload": {"headers": [{"name": "Subject", "value": "Newsletter"}]}
            })))
            .mount(&server)
            .await;

        let found = transport(&server).list_tagged_unread(10).await.unwrap();
        assert_eq!(
            found,
            vec![ProviderMessageRef {
                id: "a".to_string(),
                thread_id: Some("ta".to_string()),
                correlation_id: Some(id),
                in_spam: false,
            }]
        );
    }

    #[tokio::test]
    async fn test_archive_removes_inbox_label() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/users/me/threads/t1/modify"))
            .and(body_string_contains("INBOX"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "t1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/users/me/threads/gone/modify"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let gmail = transport(&server);
        let mut target = ArchiveTarget {
            provider_message_id: Some("g1".to_string()),
            provider_thread_id: Some("t1".to_string()),
            rfc_message_id: "m1@example.com".to_string(),
        };
        assert_eq!(gmail.archive_thread(&target).await.unwrap(), ArchiveOutcome::Archived);

        target.provider_thread_id = Some("gone".to_string());
        assert_eq!(gmail.archive_thread(&target).await.unwrap(), ArchiveOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_revoked_token_surfaces_as_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/me/profile"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid credentials"))
            .mount(&server)
            .await;

        assert!(matches!(
            transport(&server).test_connection().await,
            Err(Error::Auth(_))
        ));
    }
}
