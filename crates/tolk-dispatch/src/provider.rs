// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use tolk_queue::{BatchExecutor, BatchPayload, BatchTask, BATCH_SEPARATOR};

/// One provider invocation: the (possibly separator-joined) text plus the
/// identity needed to pick wire format and endpoint.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub provider_id: String,
    pub source_lang: String,
    pub target_lang: String,
    pub text: String,
}

/// The generic LLM / simple provider seam.
///
/// The network transport is the embedding application's concern; the core
/// only needs "text in, translation out". A batch payload arrives as one
/// request whose text joins the chunk texts with the separator protocol,
/// and the implementation must echo the separators back between the
/// translated fragments.
#[async_trait]
pub trait TranslateProvider: Send + Sync {
    async fn translate(&self, req: ProviderRequest) -> anyhow::Result<String>;
}

/// Adapts a [`TranslateProvider`] to the batch queue's executor seam.
pub struct ProviderBatchExecutor {
    provider: Arc<dyn TranslateProvider>,
}

impl ProviderBatchExecutor {
    pub fn new(provider: Arc<dyn TranslateProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl BatchExecutor for ProviderBatchExecutor {
    async fn run_batch(&self, payload: &BatchPayload) -> anyhow::Result<String> {
        self.provider
            .translate(ProviderRequest {
                provider_id: payload.provider_id.clone(),
                source_lang: payload.source_lang.clone(),
                target_lang: payload.target_lang.clone(),
                text: payload.joined_text.clone(),
            })
            .await
    }

    async fn run_single(&self, task: &BatchTask) -> anyhow::Result<String> {
        self.provider
            .translate(ProviderRequest {
                provider_id: task.provider_id.clone(),
                source_lang: task.source_lang.clone(),
                target_lang: task.target_lang.clone(),
                text: task.text.clone(),
            })
            .await
    }
}

/// Deterministic provider for tests: uppercases every fragment, preserves
/// separators, counts invocations, and can be scripted to fail.
pub struct MockTranslateProvider {
    calls: AtomicU32,
    requests: Mutex<Vec<ProviderRequest>>,
    fail_next: AtomicU32,
    retryable_failures: bool,
}

impl MockTranslateProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
            fail_next: AtomicU32::new(0),
            retryable_failures: false,
        })
    }

    /// Fail the next `n` invocations with a transient (retryable) error.
    pub fn failing(n: u32) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
            fail_next: AtomicU32::new(n),
            retryable_failures: true,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl TranslateProvider for MockTranslateProvider {
    async fn translate(&self, req: ProviderRequest) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(req.clone());
        if self.fail_next.load(Ordering::SeqCst) > 0 {
            self.fail_next.fetch_sub(1, Ordering::SeqCst);
            let err = anyhow::anyhow!("mock provider unavailable");
            return Err(if self.retryable_failures {
                tolk_queue::retryable(err)
            } else {
                err
            });
        }
        let translated: Vec<String> = req
            .text
            .split(BATCH_SEPARATOR)
            .map(|f| f.trim().to_uppercase())
            .collect();
        Ok(translated.join(&format!(" {BATCH_SEPARATOR} ")))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_translates_fragments_and_keeps_separators() {
        let p = MockTranslateProvider::new();
        let out = p
            .translate(ProviderRequest {
                provider_id: "llm".into(),
                source_lang: "en".into(),
                target_lang: "sv".into(),
                text: format!("hi\n\n{BATCH_SEPARATOR}\n\nthere"),
            })
            .await
            .unwrap();
        assert_eq!(out, format!("HI {BATCH_SEPARATOR} THERE"));
        assert_eq!(p.calls(), 1);
    }

    #[tokio::test]
    async fn failing_mock_recovers_after_n_calls() {
        let p = MockTranslateProvider::failing(1);
        assert!(p
            .translate(ProviderRequest {
                provider_id: "llm".into(),
                source_lang: "en".into(),
                target_lang: "sv".into(),
                text: "x".into(),
            })
            .await
            .is_err());
        assert!(p
            .translate(ProviderRequest {
                provider_id: "llm".into(),
                source_lang: "en".into(),
                target_lang: "sv".into(),
                text: "x".into(),
            })
            .await
            .is_ok());
    }
}
