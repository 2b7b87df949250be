// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::GenAiError;

/// Byte stream of an SSE response body.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, GenAiError>> + Send>>;

/// Final message state as reported by the poll endpoint.
#[derive(Debug, Clone, Default)]
pub struct MessageStatus {
    pub content: Option<String>,
    pub status: Option<String>,
    pub response_code: Option<String>,
}

/// The GenAI provider's REST + SSE surface.
///
/// Implemented over reqwest in production ([`HttpGenAiTransport`]) and by a
/// scripted mock in driver tests. Session auth rides on cookies owned by the
/// injected HTTP client.
#[async_trait]
pub trait GenAiTransport: Send + Sync {
    /// `GET /api/account/auth/session` — liveness probe. `true` when the
    /// session cookie is valid.
    async fn check_session(&self) -> anyhow::Result<bool>;

    /// `POST /api/chat/v1/chats` — create a conversation, returning its guid.
    async fn create_chat(&self) -> anyhow::Result<String>;

    /// `DELETE /api/chat/v1/chats` with `{chatGuids: [...]}`.
    async fn delete_chats(&self, chat_ids: &[String]) -> anyhow::Result<()>;

    /// `POST /api/chat/v1/messages` — send a user turn. HTTP 422 with
    /// `errorCode: "CHAT_ERROR_4"` maps to [`GenAiError::PendingResponse`].
    async fn send_message(
        &self,
        chat_id: &str,
        content: &str,
        parent_message_id: Option<&str>,
    ) -> Result<String, GenAiError>;

    /// `POST /api/chat/v1/messages-response` — open the assistant SSE stream
    /// for a user message.
    async fn open_stream(
        &self,
        chat_id: &str,
        user_message_id: &str,
        model_id: &str,
    ) -> Result<ByteStream, GenAiError>;

    /// `POST /api/chat/v1/messages-response/cancel` — stop streaming.
    /// Best-effort; callers ignore the outcome.
    async fn cancel_response(&self, message_guid: &str) -> anyhow::Result<()>;

    /// `GET /api/chat/v1/messages/{id}` — poll final content. 404/410 maps
    /// to [`GenAiError::ChatGone`].
    async fn get_message(&self, message_id: &str) -> Result<MessageStatus, GenAiError>;
}

/// reqwest-backed transport. The client is injected so cookie/session
/// handling, proxies and TLS policy stay with the embedding application.
pub struct HttpGenAiTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGenAiTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { client, base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

fn transport_err(e: reqwest::Error) -> GenAiError {
    GenAiError::Transport(e.to_string())
}

/// Pull a string out of a response body, looking at the top level first and
/// then under `data` (the API wraps most payloads).
fn body_string(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .or_else(|| v.get("data").and_then(|d| d.get(key)))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[async_trait]
impl GenAiTransport for HttpGenAiTransport {
    async fn check_session(&self) -> anyhow::Result<bool> {
        let resp = self
            .client
            .get(self.url("/api/account/auth/session"))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Ok(false);
        }
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        // Authenticated iff the payload carries non-empty data.
        Ok(body
            .get("data")
            .map(|d| !d.is_null() && d.as_object().map_or(true, |o| !o.is_empty()))
            .unwrap_or(false))
    }

    async fn create_chat(&self) -> anyhow::Result<String> {
        let resp = self
            .client
            .post(self.url("/api/chat/v1/chats"))
            .json(&json!({}))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("chat creation failed with HTTP {status}");
        }
        let body: Value = resp.json().await?;
        body_string(&body, "guid")
            .ok_or_else(|| anyhow::anyhow!("chat creation response carried no guid"))
    }

    async fn delete_chats(&self, chat_ids: &[String]) -> anyhow::Result<()> {
        let resp = self
            .client
            .delete(self.url("/api/chat/v1/chats"))
            .json(&json!({ "chatGuids": chat_ids }))
            .send()
            .await?;
        debug!(count = chat_ids.len(), status = %resp.status(), "remote chats deleted");
        Ok(())
    }

    async fn send_message(
        &self,
        chat_id: &str,
        content: &str,
        parent_message_id: Option<&str>,
    ) -> Result<String, GenAiError> {
        let mut body = json!({ "chatGuid": chat_id, "content": content });
        if let Some(parent) = parent_message_id {
            body["parentMessageGuid"] = json!(parent);
        }
        let resp = self
            .client
            .post(self.url("/api/chat/v1/messages"))
            .json(&body)
            .send()
            .await
            .map_err(transport_err)?;

        let status = resp.status();
        if status.as_u16() == 422 {
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            if body_string(&body, "errorCode").as_deref() == Some("CHAT_ERROR_4") {
                return Err(GenAiError::PendingResponse);
            }
            return Err(GenAiError::Http {
                status: 422,
                endpoint: "/api/chat/v1/messages".into(),
            });
        }
        if !status.is_success() {
            return Err(GenAiError::Http {
                status: status.as_u16(),
                endpoint: "/api/chat/v1/messages".into(),
            });
        }
        let body: Value = resp.json().await.map_err(transport_err)?;
        body_string(&body, "guid").ok_or_else(|| {
            GenAiError::Transport("message response carried no guid".into())
        })
    }

    async fn open_stream(
        &self,
        chat_id: &str,
        user_message_id: &str,
        model_id: &str,
    ) -> Result<ByteStream, GenAiError> {
        let resp = self
            .client
            .post(self.url("/api/chat/v1/messages-response"))
            .header("accept", "text/event-stream")
            .json(&json!({
                "chatGuid": chat_id,
                "messageGuid": user_message_id,
                "modelId": model_id,
            }))
            .send()
            .await
            .map_err(transport_err)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(GenAiError::Http {
                status: status.as_u16(),
                endpoint: "/api/chat/v1/messages-response".into(),
            });
        }
        Ok(Box::pin(resp.bytes_stream().map(|r| r.map_err(transport_err))))
    }

    async fn cancel_response(&self, message_guid: &str) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(self.url("/api/chat/v1/messages-response/cancel"))
            .json(&json!({ "messageGuid": message_guid }))
            .send()
            .await;
        match resp {
            Ok(r) => debug!(message_guid, status = %r.status(), "stream cancel posted"),
            Err(e) => warn!(message_guid, error = %e, "stream cancel failed"),
        }
        Ok(())
    }

    async fn get_message(&self, message_id: &str) -> Result<MessageStatus, GenAiError> {
        let resp = self
            .client
            .get(self.url(&format!("/api/chat/v1/messages/{message_id}")))
            .send()
            .await
            .map_err(transport_err)?;

        let status = resp.status();
        if matches!(status.as_u16(), 404 | 410) {
            return Err(GenAiError::ChatGone);
        }
        if !status.is_success() {
            return Err(GenAiError::Http {
                status: status.as_u16(),
                endpoint: "/api/chat/v1/messages".into(),
            });
        }
        let body: Value = resp.json().await.map_err(transport_err)?;
        Ok(MessageStatus {
            content: body_string(&body, "content"),
            status: body_string(&body, "status")
                .or_else(|| body_string(&body, "eventStatus"))
                .or_else(|| body_string(&body, "event_status")),
            response_code: body_string(&body, "responseCode")
                .or_else(|| body_string(&body, "response_code")),
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
