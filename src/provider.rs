// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use tolk_dispatch::{ProviderRequest, TranslateProvider};
use tolk_queue::{retryable, BATCH_SEPARATOR};

/// Generic LLM provider over an OpenAI-compatible chat-completions
/// endpoint. Handles both single snippets and separator-joined batch
/// payloads; the instructions tell the model to echo the separators back.
pub struct LlmHttpProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl LlmHttpProvider {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            client,
            base_url,
            api_key,
            model: model.into(),
        }
    }

    fn system_prompt(req: &ProviderRequest) -> String {
        let mut prompt = format!(
            "You are a translation engine. Translate the user's text from {} to {}. \
             Reply with the translation only, preserving the original line structure.",
            req.source_lang, req.target_lang,
        );
        if req.text.contains(BATCH_SEPARATOR) {
            prompt.push_str(&format!(
                " The text contains multiple segments separated by lines with {sep}; \
                 translate each segment and keep the {sep} separators between them.",
                sep = BATCH_SEPARATOR,
            ));
        }
        prompt
    }
}

#[async_trait]
impl TranslateProvider for LlmHttpProvider {
    async fn translate(&self, req: ProviderRequest) -> anyhow::Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": Self::system_prompt(&req) },
                { "role": "user", "content": req.text },
            ],
            "stream": false,
        });

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| retryable(anyhow::anyhow!("LLM request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let err = anyhow::anyhow!("LLM error {status}: {text}");
            // Overload and server-side faults are worth a retry; the rest
            // (auth, malformed request) are terminal.
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                retryable(err)
            } else {
                err
            });
        }

        let v: Value = resp.json().await.context("parsing LLM response")?;
        let content = v["choices"][0]["message"]["content"]
            .as_str()
            .filter(|s| !s.trim().is_empty())
            .context("LLM response carried no content")?;
        debug!(
            provider = %req.provider_id,
            chars_in = req.text.len(),
            chars_out = content.len(),
            "LLM translation completed"
        );
        Ok(content.trim().to_string())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
