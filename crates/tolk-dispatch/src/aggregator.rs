// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use tolk_config::{AggregatorConfig, ChunkMetadata, LangConfig, ProviderConfig};
use tolk_queue::QueueError;

use crate::messages::BatchChunkPayload;

/// One flushed batch, ready to cross the IPC boundary.
#[derive(Debug, Clone)]
pub struct AggregatedBatch {
    pub chunks: Vec<BatchChunkPayload>,
    pub lang: LangConfig,
    pub provider: ProviderConfig,
    pub client_request_id: String,
    pub article_title: Option<String>,
    pub article_text_content: Option<String>,
}

/// Where flushed batches go — in production the background dispatcher,
/// reached over messaging; in tests an in-process recorder.
#[async_trait]
pub trait GenAiBatchSink: Send + Sync {
    async fn enqueue_genai_batch(
        &self,
        batch: AggregatedBatch,
    ) -> anyhow::Result<Vec<anyhow::Result<String>>>;
}

/// Caller-side aggregator: collects per-snippet GenAI requests, groups them
/// by (language, provider) context, and flushes one combined message per
/// batch — on context change, on budget, or after a short debounce window.
#[derive(Clone)]
pub struct GenAiBatchAggregator {
    inner: Arc<AggInner>,
}

struct AggInner {
    sink: Arc<dyn GenAiBatchSink>,
    cfg: AggregatorConfig,
    state: Mutex<AggState>,
    /// Chunks whose batch is already in flight, still reachable by
    /// [`GenAiBatchAggregator::cancel_chunk`].
    inflight: Mutex<HashMap<Uuid, Arc<Mutex<Option<String>>>>>,
}

/// Identity + framing shared by every chunk in one pending batch.
#[derive(Debug, Clone)]
struct AggContext {
    context_key: String,
    lang: LangConfig,
    provider: ProviderConfig,
    client_request_id: String,
    article_title: Option<String>,
    article_text_content: Option<String>,
}

struct PendingChunk {
    id: Uuid,
    text: String,
    chars: usize,
    hash: Option<String>,
    metadata: Option<ChunkMetadata>,
    resolver: oneshot::Sender<anyhow::Result<String>>,
    cancelled: Arc<Mutex<Option<String>>>,
}

#[derive(Default)]
struct AggState {
    pending: Vec<PendingChunk>,
    context: Option<AggContext>,
    chars: usize,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// Deterministic grouping key over the language pair and provider identity.
fn context_key(lang: &LangConfig, provider: &ProviderConfig) -> String {
    let mut hasher = Sha256::new();
    hasher.update(lang.source_lang.as_bytes());
    hasher.update([0x1f]);
    hasher.update(lang.target_lang.as_bytes());
    hasher.update([0x1f]);
    hasher.update(provider.id.as_bytes());
    hex::encode(hasher.finalize())
}

impl GenAiBatchAggregator {
    pub fn new(sink: Arc<dyn GenAiBatchSink>, cfg: AggregatorConfig) -> Self {
        Self {
            inner: Arc::new(AggInner {
                sink,
                cfg,
                state: Mutex::new(AggState::default()),
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Queue one snippet; resolves with its translation once the batch
    /// containing it settles. Returns the chunk id usable with
    /// [`cancel_chunk`](Self::cancel_chunk).
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue(
        &self,
        text: String,
        hash: Option<String>,
        metadata: Option<ChunkMetadata>,
        lang: LangConfig,
        provider: ProviderConfig,
        client_request_id: String,
        article_title: Option<String>,
        article_text_content: Option<String>,
    ) -> (Uuid, oneshot::Receiver<anyhow::Result<String>>) {
        let (resolver, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        let key = context_key(&lang, &provider);
        let chunk = PendingChunk {
            id,
            hash,
            metadata,
            resolver,
            cancelled: Arc::new(Mutex::new(None)),
            chars: text.chars().count(),
            text,
        };

        let mut to_flush = Vec::new();
        {
            let mut st = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());

            // A context switch flushes whatever the old context accumulated.
            if st
                .context
                .as_ref()
                .is_some_and(|c| c.context_key != key)
            {
                if let Some(batch) = detach(&mut st) {
                    to_flush.push(batch);
                }
            }
            if st.context.is_none() {
                st.context = Some(AggContext {
                    context_key: key,
                    lang,
                    provider,
                    client_request_id,
                    article_title,
                    article_text_content,
                });
            }

            st.chars += chunk.chars;
            st.pending.push(chunk);

            if st.pending.len() >= self.inner.cfg.max_items_per_batch
                || st.chars >= self.inner.cfg.max_characters_per_batch
            {
                if let Some(batch) = detach(&mut st) {
                    to_flush.push(batch);
                }
            } else {
                self.arm_timer(&mut st);
            }
        }

        for batch in to_flush {
            self.spawn_flush(batch, "budget or context switch");
        }
        (id, rx)
    }

    /// Flush whatever is pending right now.
    pub fn flush(&self, reason: &str) {
        let batch = {
            let mut st = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            detach(&mut st)
        };
        if let Some(batch) = batch {
            self.spawn_flush(batch, reason);
        }
    }

    /// Cancel one chunk. Pending chunks are removed and rejected
    /// immediately; in-flight chunks are marked so the settling batch
    /// rejects them. Unknown ids are a no-op.
    pub fn cancel_chunk(&self, id: Uuid, reason: &str) {
        {
            let mut st = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(pos) = st.pending.iter().position(|c| c.id == id) {
                let chunk = st.pending.remove(pos);
                st.chars -= chunk.chars;
                let _ = chunk.resolver.send(Err(anyhow::Error::new(
                    QueueError::Cancelled(reason.to_string()),
                )));
                if st.pending.is_empty() {
                    st.context = None;
                    st.generation += 1;
                    if let Some(t) = st.timer.take() {
                        t.abort();
                    }
                }
                return;
            }
        }
        let inflight = self.inner.inflight.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cell) = inflight.get(&id) {
            let mut cell = cell.lock().unwrap_or_else(|e| e.into_inner());
            if cell.is_none() {
                *cell = Some(reason.to_string());
            }
        }
    }

    /// Number of chunks waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .len()
    }

    fn arm_timer(&self, st: &mut AggState) {
        st.generation += 1;
        let generation = st.generation;
        let this = self.clone();
        let delay = Duration::from_millis(self.inner.cfg.flush_delay_ms);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let batch = {
                let mut st = this.inner.state.lock().unwrap_or_else(|e| e.into_inner());
                if st.generation == generation {
                    detach(&mut st)
                } else {
                    None
                }
            };
            if let Some(batch) = batch {
                this.spawn_flush(batch, "delay elapsed");
            }
        });
        if let Some(old) = st.timer.replace(handle) {
            old.abort();
        }
    }

    fn spawn_flush(&self, batch: (AggContext, Vec<PendingChunk>), reason: &str) {
        let (ctx, chunks) = batch;
        debug!(
            chunks = chunks.len(),
            client_request_id = %ctx.client_request_id,
            reason,
            "flushing aggregated GenAI batch"
        );
        let inner = self.inner.clone();
        tokio::spawn(async move {
            for chunk in &chunks {
                inner
                    .inflight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(chunk.id, chunk.cancelled.clone());
            }

            let payload = AggregatedBatch {
                chunks: chunks
                    .iter()
                    .map(|c| BatchChunkPayload {
                        text: c.text.clone(),
                        hash: c.hash.clone(),
                        chunk_metadata: c.metadata.clone(),
                    })
                    .collect(),
                lang: ctx.lang,
                provider: ctx.provider,
                client_request_id: ctx.client_request_id,
                article_title: ctx.article_title,
                article_text_content: ctx.article_text_content,
            };

            let outcome = inner.sink.enqueue_genai_batch(payload).await;

            {
                let mut inflight = inner.inflight.lock().unwrap_or_else(|e| e.into_inner());
                for chunk in &chunks {
                    inflight.remove(&chunk.id);
                }
            }

            match outcome {
                Ok(results) if results.len() == chunks.len() => {
                    for (chunk, result) in chunks.into_iter().zip(results) {
                        resolve(chunk, result);
                    }
                }
                Ok(results) => {
                    let msg = format!(
                        "batch returned {} results for {} chunks",
                        results.len(),
                        chunks.len()
                    );
                    for chunk in chunks {
                        resolve(chunk, Err(anyhow::anyhow!("{msg}")));
                    }
                }
                Err(e) => {
                    let msg = format!("{e:#}");
                    for chunk in chunks {
                        resolve(chunk, Err(anyhow::anyhow!("{msg}")));
                    }
                }
            }
        });
    }
}

fn detach(st: &mut AggState) -> Option<(AggContext, Vec<PendingChunk>)> {
    if st.pending.is_empty() {
        return None;
    }
    st.generation += 1;
    if let Some(t) = st.timer.take() {
        t.abort();
    }
    st.chars = 0;
    let ctx = st.context.take().expect("pending implies context");
    Some((ctx, std::mem::take(&mut st.pending)))
}

fn resolve(chunk: PendingChunk, result: anyhow::Result<String>) {
    let reason = chunk
        .cancelled
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    let outcome = match reason {
        Some(reason) => Err(anyhow::Error::new(QueueError::Cancelled(reason))),
        None => result,
    };
    let _ = chunk.resolver.send(outcome);
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tolk_config::ProviderKind;

    struct RecordingSink {
        batches: Mutex<Vec<AggregatedBatch>>,
        fail: bool,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                fail: true,
            })
        }

        fn batches(&self) -> Vec<AggregatedBatch> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl GenAiBatchSink for RecordingSink {
        async fn enqueue_genai_batch(
            &self,
            batch: AggregatedBatch,
        ) -> anyhow::Result<Vec<anyhow::Result<String>>> {
            self.batches.lock().unwrap().push(batch.clone());
            if self.fail {
                anyhow::bail!("dispatcher unreachable");
            }
            Ok(batch
                .chunks
                .iter()
                .map(|c| Ok(c.text.to_uppercase()))
                .collect())
        }
    }

    fn lang() -> LangConfig {
        LangConfig {
            source_lang: "en".into(),
            target_lang: "sv".into(),
        }
    }

    fn provider(id: &str) -> ProviderConfig {
        ProviderConfig {
            id: id.into(),
            kind: ProviderKind::GenAi,
            base_url: "https://genai.example.com".into(),
            model: None,
            options: Default::default(),
        }
    }

    fn cfg() -> AggregatorConfig {
        AggregatorConfig {
            max_items_per_batch: 3,
            max_characters_per_batch: 1000,
            flush_delay_ms: 30,
        }
    }

    fn agg(sink: Arc<RecordingSink>) -> GenAiBatchAggregator {
        GenAiBatchAggregator::new(sink, cfg())
    }

    #[tokio::test]
    async fn item_budget_flushes_one_combined_batch() {
        let sink = RecordingSink::new();
        let a = agg(sink.clone());
        let mut rxs = Vec::new();
        for text in ["ett", "två", "tre"] {
            let (_, rx) = a.enqueue(
                text.into(),
                None,
                None,
                lang(),
                provider("genai"),
                "req-1".into(),
                None,
                None,
            );
            rxs.push(rx);
        }
        let mut results = Vec::new();
        for rx in rxs {
            results.push(rx.await.unwrap().unwrap());
        }
        assert_eq!(results, vec!["ETT", "TVÅ", "TRE"]);
        assert_eq!(sink.batches().len(), 1, "three chunks, one IPC message");
    }

    #[tokio::test]
    async fn delay_flushes_an_under_budget_batch() {
        let sink = RecordingSink::new();
        let a = agg(sink.clone());
        let (_, rx) = a.enqueue(
            "ensam".into(),
            None,
            None,
            lang(),
            provider("genai"),
            "req-1".into(),
            None,
            None,
        );
        assert_eq!(rx.await.unwrap().unwrap(), "ENSAM");
        assert_eq!(sink.batches().len(), 1);
    }

    #[tokio::test]
    async fn context_switch_flushes_the_previous_context() {
        let sink = RecordingSink::new();
        let a = agg(sink.clone());
        let (_, rx1) = a.enqueue(
            "first".into(),
            None,
            None,
            lang(),
            provider("genai-a"),
            "req-1".into(),
            None,
            None,
        );
        let (_, rx2) = a.enqueue(
            "second".into(),
            None,
            None,
            lang(),
            provider("genai-b"),
            "req-1".into(),
            None,
            None,
        );
        assert_eq!(rx1.await.unwrap().unwrap(), "FIRST");
        assert_eq!(rx2.await.unwrap().unwrap(), "SECOND");
        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].provider.id, "genai-a");
        assert_eq!(batches[1].provider.id, "genai-b");
    }

    #[tokio::test]
    async fn cancel_pending_chunk_rejects_it_and_spares_the_rest() {
        let sink = RecordingSink::new();
        let a = agg(sink.clone());
        let (id1, rx1) = a.enqueue(
            "doomed".into(),
            None,
            None,
            lang(),
            provider("genai"),
            "req-1".into(),
            None,
            None,
        );
        let (_, rx2) = a.enqueue(
            "kept".into(),
            None,
            None,
            lang(),
            provider("genai"),
            "req-1".into(),
            None,
            None,
        );
        a.cancel_chunk(id1, "tab closed");
        let err = rx1.await.unwrap().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<QueueError>(),
            Some(QueueError::Cancelled(_))
        ));
        assert_eq!(rx2.await.unwrap().unwrap(), "KEPT");
        assert_eq!(sink.batches()[0].chunks.len(), 1);
    }

    #[tokio::test]
    async fn sink_failure_rejects_every_chunk() {
        let sink = RecordingSink::failing();
        let a = agg(sink);
        let (_, rx1) = a.enqueue(
            "a".into(),
            None,
            None,
            lang(),
            provider("genai"),
            "req-1".into(),
            None,
            None,
        );
        let (_, rx2) = a.enqueue(
            "b".into(),
            None,
            None,
            lang(),
            provider("genai"),
            "req-1".into(),
            None,
            None,
        );
        a.flush("test");
        assert!(rx1.await.unwrap().is_err());
        assert!(rx2.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn double_cancel_is_a_no_op() {
        let sink = RecordingSink::new();
        let a = agg(sink);
        let (id, rx) = a.enqueue(
            "x".into(),
            None,
            None,
            lang(),
            provider("genai"),
            "req-1".into(),
            None,
            None,
        );
        a.cancel_chunk(id, "first");
        a.cancel_chunk(id, "second");
        let err = rx.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("first"));
    }

    #[test]
    fn context_key_separates_languages_and_providers() {
        let base = context_key(&lang(), &provider("genai"));
        let mut other_lang = lang();
        other_lang.target_lang = "de".into();
        assert_ne!(base, context_key(&other_lang, &provider("genai")));
        assert_ne!(base, context_key(&lang(), &provider("other")));
        assert_eq!(base, context_key(&lang(), &provider("genai")));
    }
}
