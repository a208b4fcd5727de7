//! Microsoft Graph transport for OAuth-connected Outlook accounts

use std::sync::Arc;

use async_trait::async_trait;
use kindling_common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::oauth::TokenSource;
use super::{
    check_status, http_error, marker_from_headers, ArchiveOutcome, ArchiveTarget,
    OutgoingMessage, ProviderMessage, ProviderMessageRef, SentMessage, Transport,
    CORRELATION_HEADER, WARMUP_HEADER,
};

const MESSAGE_FIELDS: &str =
    "id,conversationId,subject,from,isRead,parentFolderId,internetMessageHeaders";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct EmailAddress {
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Recipient {
    email_address: EmailAddress,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    from: Option<Recipient>,
    #[serde(default)]
    is_read: bool,
    #[serde(default)]
    parent_folder_id: Option<String>,
    #[serde(default)]
    internet_message_headers: Vec<MessageHeader>,
}

impl GraphMessage {
    fn headers(&self) -> Vec<(String, String)> {
        self.internet_message_headers
            .iter()
            .map(|h| (h.name.clone(), h.value.clone()))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct Collection<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ItemId {
    id: String,
}

/// Graph client for one mailbox
pub struct GraphTransport {
    http: reqwest::Client,
    base: String,
    tokens: Arc<dyn TokenSource>,
}

impl GraphTransport {
    pub fn new(http: reqwest::Client, base: String, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            tokens,
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let token = self.tokens.access_token().await?;
        let mut request = self
            .http
            .request(method, format!("{}/me{}", self.base, path))
            .bearer_auth(token)
            .query(query);
        if let Some(body) = body {
            request = request.json(&body);
        }
        check_status(request.send().await.map_err(http_error)?).await
    }

    async fn json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("Malformed Graph response: {}", e)))
    }

    async fn find_by_rfc_id(&self, rfc_message_id: &str) -> Result<Option<GraphMessage>> {
        let filter = format!("internetMessageId eq '<{}>'", rfc_message_id);
        let response = self
            .request(
                reqwest::Method::GET,
                "/messages",
                &[("$filter", filter.as_str()), ("$select", MESSAGE_FIELDS), ("$top", "1")],
                None,
            )
            .await?;
        let found: Collection<GraphMessage> = Self::json(response).await?;
        Ok(found.value.into_iter().next())
    }

    async fn scan(&self, folder: &str, in_spam: bool, limit: usize) -> Result<Vec<ProviderMessageRef>> {
        let top = limit.to_string();
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/mailFolders/{}/messages", folder),
                &[
                    ("$filter", "isRead eq false"),
                    ("$select", MESSAGE_FIELDS),
                    ("$top", top.as_str()),
                ],
                None,
            )
            .await?;
        let page: Collection<GraphMessage> = Self::json(response).await?;

        Ok(page
            .value
            .into_iter()
            .filter_map(|m| {
                let (is_warmup, correlation_id) = marker_from_headers(&m.headers());
                is_warmup.then(|| ProviderMessageRef {
                    id: m.id,
                    thread_id: m.conversation_id,
                    correlation_id,
                    in_spam,
                })
            })
            .collect())
    }

    fn message_body(message: &OutgoingMessage) -> serde_json::Value {
        json!({
            "subject": message.subject,
            "body": { "contentType": "Text", "content": message.body },
            "toRecipients": [{ "emailAddress": { "address": message.to } }],
            "internetMessageHeaders": [
                { "name": WARMUP_HEADER, "value": "true" },
                { "name": CORRELATION_HEADER, "value": message.correlation_id.to_string() },
            ],
        })
    }
}

#[async_trait]
impl Transport for GraphTransport {
    async fn send(&self, message: &OutgoingMessage) -> Result<SentMessage> {
        let parent = match &message.in_reply_to {
            Some(rfc_id) => self.find_by_rfc_id(rfc_id).await?,
            None => None,
        };

        let response = match &parent {
            Some(parent) => {
                self.request(
                    reqwest::Method::POST,
                    &format!("/messages/{}/createReply", parent.id),
                    &[],
                    Some(json!({ "message": Self::message_body(message) })),
                )
                .await?
            }
            None => {
                self.request(
                    reqwest::Method::POST,
                    "/messages",
                    &[],
                    Some(Self::message_body(message)),
                )
                .await?
            }
        };
        let draft: GraphMessage = Self::json(response).await?;

        self.request(
            reqwest::Method::POST,
            &format!("/messages/{}/send", draft.id),
            &[],
            None,
        )
        .await?;

        debug!(id = %draft.id, to = %message.to, "Graph accepted message");
        Ok(SentMessage {
            provider_message_id: draft.id,
            provider_thread_id: draft.conversation_id,
        })
    }

    async fn list_tagged_unread(&self, limit: usize) -> Result<Vec<ProviderMessageRef>> {
        let mut found = self.scan("inbox", false, limit).await?;
        match self.scan("junkemail", true, limit).await {
            Ok(refs) => found.extend(refs),
            Err(e) => warn!(error = %e, "Graph junk folder scan failed"),
        }
        found.truncate(limit);
        Ok(found)
    }

    async fn archive_thread(&self, target: &ArchiveTarget) -> Result<ArchiveOutcome> {
        let conversation_id = match &target.provider_thread_id {
            Some(id) => Some(id.clone()),
            None => self
                .find_by_rfc_id(&target.rfc_message_id)
                .await?
                .and_then(|m| m.conversation_id),
        };
        let Some(conversation_id) = conversation_id else {
            return Ok(ArchiveOutcome::NotFound);
        };

        let filter = format!("conversationId eq '{}'", conversation_id);
        let response = self
            .request(
                reqwest::Method::GET,
                "/mailFolders/inbox/messages",
                &[("$filter", filter.as_str()), ("$select", "id")],
                None,
            )
            .await?;
        let page: Collection<ItemId> = Self::json(response).await?;
        if page.value.is_empty() {
            return Ok(ArchiveOutcome::NotFound);
        }

        for message in &page.value {
            self.request(
                reqwest::Method::POST,
                &format!("/messages/{}/move", message.id),
                &[],
                Some(json!({ "destinationId": "archive" })),
            )
            .await?;
        }
        Ok(ArchiveOutcome::Archived)
    }

    async fn get_message(&self, id: &str) -> Result<ProviderMessage> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/messages/{}", id),
                &[("$select", MESSAGE_FIELDS)],
                None,
            )
            .await?;
        let message: GraphMessage = Self::json(response).await?;

        let junk: ItemId = Self::json(
            self.request(reqwest::Method::GET, "/mailFolders/junkemail", &[], None)
                .await?,
        )
        .await?;

        let (is_warmup, correlation_id) = marker_from_headers(&message.headers());
        Ok(ProviderMessage {
            in_spam: message.parent_folder_id.as_deref() == Some(junk.id.as_str()),
            from: message.from.and_then(|r| r.email_address.address),
            id: message.id,
            thread_id: message.conversation_id,
            subject: message.subject,
            is_warmup,
            correlation_id,
            unread: !message.is_read,
        })
    }

    async fn mark_read(&self, message: &ProviderMessageRef) -> Result<()> {
        self.request(
            reqwest::Method::PATCH,
            &format!("/messages/{}", message.id),
            &[],
            Some(json!({ "isRead": true })),
        )
        .await?;
        Ok(())
    }

    async fn test_connection(&self) -> Result<()> {
        self.request(reqwest::Method::GET, "", &[], None).await?;
        Ok(())
    }
}
