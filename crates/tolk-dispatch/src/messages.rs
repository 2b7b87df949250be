// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Wire protocol between callers (content scripts, tooling) and the
//! dispatcher. Encoded as JSON, one object per message:
//!
//! ```text
//! Caller                                Dispatcher
//!    │                                      │
//!    │── enqueueTranslateRequest ──────────►│  cache / queue / provider
//!    │◄─ translation {text} ────────────────│
//!    │                                      │
//!    │── enqueueGenAiBatch ────────────────►│  one combined GenAI prompt
//!    │◄─ batch {results[]} ─────────────────│  positionally aligned
//!    │                                      │
//!    │── notifyTabClosed ──────────────────►│  fan-out cancellation
//!    │◄─ ok ────────────────────────────────│
//! ```

use serde::{Deserialize, Serialize};

use tolk_config::{BatchConfigPatch, ChunkMetadata, LangConfig, ProviderConfig, QueueConfigPatch};

use crate::dispatcher::{Dispatcher, GenAiBatchRequest, TranslateRequest};

/// One snippet inside an `enqueueGenAiBatch` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchChunkPayload {
    pub text: String,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub chunk_metadata: Option<ChunkMetadata>,
}

/// Requests accepted by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DispatchRequest {
    #[serde(rename_all = "camelCase")]
    EnqueueTranslateRequest {
        text: String,
        lang_config: LangConfig,
        provider_config: ProviderConfig,
        #[serde(default)]
        schedule_at: Option<u64>,
        #[serde(default)]
        hash: Option<String>,
        #[serde(default)]
        article_title: Option<String>,
        #[serde(default)]
        article_text_content: Option<String>,
        client_request_id: String,
        #[serde(default)]
        tab_id: Option<u64>,
        #[serde(default)]
        chunk_metadata: Option<ChunkMetadata>,
    },
    #[serde(rename = "enqueueGenAIBatch", rename_all = "camelCase")]
    EnqueueGenAiBatch {
        chunks: Vec<BatchChunkPayload>,
        lang_config: LangConfig,
        provider_config: ProviderConfig,
        #[serde(default)]
        schedule_at: Option<u64>,
        client_request_id: String,
        #[serde(default)]
        tab_id: Option<u64>,
        #[serde(default)]
        article_title: Option<String>,
        #[serde(default)]
        article_text_content: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SetTranslateRequestQueueConfig {
        #[serde(flatten)]
        patch: QueueConfigPatch,
    },
    #[serde(rename_all = "camelCase")]
    SetTranslateBatchQueueConfig {
        #[serde(flatten)]
        patch: BatchConfigPatch,
    },
    #[serde(rename_all = "camelCase")]
    NotifyTabClosed { tab_id: u64 },
    #[serde(rename_all = "camelCase")]
    CancelClientRequest { client_request_id: String },
}

/// Per-chunk outcome of a batch message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Responses produced by [`Dispatcher::handle`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DispatchResponse {
    Translation { text: String },
    Batch { results: Vec<ChunkResult> },
    Ok,
    Error { message: String },
}

impl Dispatcher {
    /// Serve one wire message.
    pub async fn handle(&self, request: DispatchRequest) -> DispatchResponse {
        match request {
            DispatchRequest::EnqueueTranslateRequest {
                text,
                lang_config,
                provider_config,
                schedule_at,
                hash,
                article_title,
                article_text_content,
                client_request_id,
                tab_id,
                chunk_metadata,
            } => {
                let req = TranslateRequest {
                    text,
                    lang: lang_config,
                    provider: provider_config,
                    schedule_at_ms: schedule_at,
                    hash,
                    article_title,
                    article_text_content,
                    client_request_id,
                    tab_id,
                    chunk_metadata,
                };
                match self.enqueue_translate_request(req).await {
                    Ok(text) => DispatchResponse::Translation { text },
                    Err(e) => DispatchResponse::Error {
                        message: format!("{e:#}"),
                    },
                }
            }
            DispatchRequest::EnqueueGenAiBatch {
                chunks,
                lang_config,
                provider_config,
                schedule_at,
                client_request_id,
                tab_id,
                article_title,
                article_text_content,
            } => {
                let req = GenAiBatchRequest {
                    chunks,
                    lang: lang_config,
                    provider: provider_config,
                    schedule_at_ms: schedule_at,
                    client_request_id,
                    tab_id,
                    article_title,
                    article_text_content,
                };
                match self.enqueue_genai_batch(req).await {
                    Ok(results) => DispatchResponse::Batch {
                        results: results
                            .into_iter()
                            .map(|r| match r {
                                Ok(text) => ChunkResult {
                                    ok: true,
                                    text: Some(text),
                                    error: None,
                                },
                                Err(e) => ChunkResult {
                                    ok: false,
                                    text: None,
                                    error: Some(format!("{e:#}")),
                                },
                            })
                            .collect(),
                    },
                    Err(e) => DispatchResponse::Error {
                        message: format!("{e:#}"),
                    },
                }
            }
            DispatchRequest::SetTranslateRequestQueueConfig { patch } => {
                self.set_request_queue_config(&patch);
                DispatchResponse::Ok
            }
            DispatchRequest::SetTranslateBatchQueueConfig { patch } => {
                self.set_batch_queue_config(&patch);
                DispatchResponse::Ok
            }
            DispatchRequest::NotifyTabClosed { tab_id } => {
                self.notify_tab_closed(tab_id);
                DispatchResponse::Ok
            }
            DispatchRequest::CancelClientRequest { client_request_id } => {
                self.cancel_client_request(&client_request_id);
                DispatchResponse::Ok
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
