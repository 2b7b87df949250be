// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use tolk_config::{
    BatchConfigPatch, ChunkMetadata, Config, GenAiConfig, LangConfig, ProviderConfig,
    ProviderKind, QueueConfigPatch,
};
use tolk_genai::{
    abort_pair, AbortHandle, BatchContext, ChatPurpose, GenAiBatchChunk, GenAiBatcher,
    GenAiDriver, GenAiTransport, PoolKey,
};
use tolk_queue::{BatchQueue, BatchTask, RequestQueue, TaskThunk};
use tolk_store::{CacheEntry, ChunkMetrics, KvStore, StoreCache, TranslationCache};

use crate::aggregator::{AggregatedBatch, GenAiBatchSink};
use crate::messages::BatchChunkPayload;
use crate::provider::{ProviderBatchExecutor, ProviderRequest, TranslateProvider};
use crate::registry::ClientRegistry;

/// One translation request as received from a caller.
#[derive(Debug, Clone)]
pub struct TranslateRequest {
    pub text: String,
    pub lang: LangConfig,
    pub provider: ProviderConfig,
    /// Epoch milliseconds before which the request must not run.
    pub schedule_at_ms: Option<u64>,
    /// Content hash over cleaned text and provider fingerprint; the cache key.
    pub hash: Option<String>,
    pub article_title: Option<String>,
    pub article_text_content: Option<String>,
    pub client_request_id: String,
    pub tab_id: Option<u64>,
    pub chunk_metadata: Option<ChunkMetadata>,
}

/// A batched GenAI request: several snippets translated in one prompt.
#[derive(Debug, Clone)]
pub struct GenAiBatchRequest {
    pub chunks: Vec<BatchChunkPayload>,
    pub lang: LangConfig,
    pub provider: ProviderConfig,
    pub schedule_at_ms: Option<u64>,
    pub client_request_id: String,
    pub tab_id: Option<u64>,
    pub article_title: Option<String>,
    pub article_text_content: Option<String>,
}

/// The translation dispatch core's front door.
pub struct Dispatcher {
    cache: Arc<dyn TranslationCache>,
    request_queue: RequestQueue,
    batch_queue: BatchQueue,
    provider: Arc<dyn TranslateProvider>,
    genai: Arc<GenAiBatcher>,
    registry: ClientRegistry,
    /// Abort handles for in-flight GenAI work, keyed by client-request id.
    aborts: Mutex<HashMap<String, Vec<AbortHandle>>>,
    /// Queued-or-running GenAI snippet count, used for pool warm-up sizing.
    genai_backlog: AtomicUsize,
    genai_cfg: GenAiConfig,
}

impl Dispatcher {
    /// Wire up the whole core. The store backs both the translation cache
    /// and the chat pool snapshot; the provider and transport are the two
    /// injected network seams.
    pub async fn new(
        config: &Config,
        provider: Arc<dyn TranslateProvider>,
        genai_transport: Arc<dyn GenAiTransport>,
        store: Arc<dyn KvStore>,
    ) -> Self {
        let cache: Arc<dyn TranslationCache> = Arc::new(StoreCache::new(store.clone(), 1024));
        let request_queue = RequestQueue::new(config.queue.clone());
        let batch_queue = BatchQueue::new(
            request_queue.clone(),
            Arc::new(ProviderBatchExecutor::new(provider.clone())),
            config.batch.clone(),
        );
        let pool = tolk_genai::ChatPool::new(store, &config.genai).await;
        let driver = Arc::new(GenAiDriver::new(genai_transport, pool, config.genai.clone()));
        let genai = Arc::new(GenAiBatcher::new(driver, cache.clone()));
        Self {
            cache,
            request_queue,
            batch_queue,
            provider,
            genai,
            registry: ClientRegistry::new(),
            aborts: Mutex::new(HashMap::new()),
            genai_backlog: AtomicUsize::new(0),
            genai_cfg: config.genai.clone(),
        }
    }

    pub fn cache(&self) -> &Arc<dyn TranslationCache> {
        &self.cache
    }

    pub fn genai(&self) -> &Arc<GenAiBatcher> {
        &self.genai
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Translate one snippet. Resolves with the translated text, from cache
    /// when possible.
    pub async fn enqueue_translate_request(
        &self,
        req: TranslateRequest,
    ) -> anyhow::Result<String> {
        self.registry
            .register(&req.client_request_id, req.tab_id);
        let result = self.dispatch(&req).await;
        self.registry.release(&req.client_request_id);
        result
    }

    async fn dispatch(&self, req: &TranslateRequest) -> anyhow::Result<String> {
        if let Some(hash) = &req.hash {
            if let Some(hit) = self.cache.get(hash).await {
                debug!(hash = %hash, "translation served from cache");
                return Ok(hit.translation);
            }
        }

        let started = std::time::Instant::now();
        let (text, completed) = match req.provider.kind {
            ProviderKind::Llm => (self.batch_queue.enqueue(self.batch_task(req)).await?, true),
            ProviderKind::Simple => (self.submit_simple(req).await?, true),
            ProviderKind::GenAi => {
                let out = self.dispatch_genai_single(req).await?;
                (out.text, out.completed)
            }
        };

        if completed {
            if let Some(hash) = &req.hash {
                self.write_cache(hash, &text, req, started.elapsed().as_millis() as u64)
                    .await;
            }
        }
        Ok(text)
    }

    /// Translate a batch of snippets through the GenAI provider. Results are
    /// positionally aligned; each chunk resolves or fails independently.
    pub async fn enqueue_genai_batch(
        &self,
        req: GenAiBatchRequest,
    ) -> anyhow::Result<Vec<anyhow::Result<String>>> {
        self.registry
            .register(&req.client_request_id, req.tab_id);
        let result = self.genai_batch_inner(&req).await;
        self.registry.release(&req.client_request_id);
        result
    }

    async fn genai_batch_inner(
        &self,
        req: &GenAiBatchRequest,
    ) -> anyhow::Result<Vec<anyhow::Result<String>>> {
        let n = req.chunks.len();
        let mut outputs: Vec<Option<anyhow::Result<String>>> = Vec::new();
        outputs.resize_with(n, || None);

        // Cache consult per chunk before anything reaches the provider.
        let mut misses: Vec<(usize, GenAiBatchChunk)> = Vec::new();
        for (i, chunk) in req.chunks.iter().enumerate() {
            let cached = match &chunk.hash {
                Some(hash) => self.cache.get(hash).await,
                None => None,
            };
            match cached {
                Some(hit) => outputs[i] = Some(Ok(hit.translation)),
                None => misses.push((
                    i,
                    GenAiBatchChunk {
                        text: chunk.text.clone(),
                        hash: chunk.hash.clone(),
                        metadata: chunk.chunk_metadata.clone(),
                    },
                )),
            }
        }

        if !misses.is_empty() {
            let (handle, signal) = abort_pair();
            self.register_abort(&req.client_request_id, handle);
            self.genai_backlog.fetch_add(misses.len(), Ordering::SeqCst);
            self.warm_pool(&req.provider).await;

            let ctx = self.batch_context(
                &req.provider,
                &req.lang,
                req.article_title.clone(),
                req.article_text_content.clone(),
            );
            let miss_chunks: Vec<GenAiBatchChunk> =
                misses.iter().map(|(_, c)| c.clone()).collect();
            let results = self.genai.translate_chunks(&ctx, &miss_chunks, &signal).await;

            self.genai_backlog.fetch_sub(misses.len(), Ordering::SeqCst);
            self.unregister_abort(&req.client_request_id);

            for ((i, chunk), result) in misses.into_iter().zip(results) {
                outputs[i] = Some(match result {
                    Ok(out) => {
                        if out.completed {
                            if let Some(hash) = &chunk.hash {
                                self.cache.put(hash, CacheEntry::new(out.text.clone())).await;
                            }
                        }
                        Ok(out.text)
                    }
                    Err(e) => Err(e),
                });
            }
        }

        Ok(outputs
            .into_iter()
            .map(|o| o.expect("every index is filled"))
            .collect())
    }

    /// Cancel everything belonging to one client-request id: pending batch
    /// entries are rejected, in-flight GenAI work is aborted (which fires
    /// the server-side cancel endpoint), and the registration is dropped.
    /// Cancelling an already-finished id is a no-op.
    pub fn cancel_client_request(&self, client_request_id: &str) {
        let removed = self.batch_queue.cancel_tasks(
            |t| t.client_request_id == client_request_id,
            "client request cancelled",
        );
        let handles = self
            .aborts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(client_request_id);
        let fired = handles.as_ref().map(Vec::len).unwrap_or(0);
        for handle in handles.into_iter().flatten() {
            handle.fire();
        }
        self.registry.release(client_request_id);
        if removed > 0 || fired > 0 {
            info!(
                client_request_id,
                batch_tasks = removed,
                aborted = fired,
                "client request cancelled"
            );
        }
    }

    /// A closed tab cancels every client request it owned.
    pub fn notify_tab_closed(&self, tab_id: u64) {
        let ids = self.registry.take_tab(tab_id);
        if !ids.is_empty() {
            info!(tab_id, requests = ids.len(), "tab closed, cancelling its requests");
        }
        for id in ids {
            self.cancel_client_request(&id);
        }
    }

    pub fn set_request_queue_config(&self, patch: &QueueConfigPatch) {
        self.request_queue.apply_patch(patch);
    }

    pub fn set_batch_queue_config(&self, patch: &BatchConfigPatch) {
        self.batch_queue.apply_patch(patch);
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn batch_task(&self, req: &TranslateRequest) -> BatchTask {
        BatchTask {
            id: Uuid::new_v4(),
            text: req.text.clone(),
            source_lang: req.lang.source_lang.clone(),
            target_lang: req.lang.target_lang.clone(),
            provider_id: req.provider.id.clone(),
            hash: req.hash.clone(),
            client_request_id: req.client_request_id.clone(),
            char_budget: None,
            earliest: earliest_from_epoch_ms(req.schedule_at_ms),
        }
    }

    async fn submit_simple(&self, req: &TranslateRequest) -> anyhow::Result<String> {
        let provider = self.provider.clone();
        let provider_req = ProviderRequest {
            provider_id: req.provider.id.clone(),
            source_lang: req.lang.source_lang.clone(),
            target_lang: req.lang.target_lang.clone(),
            text: req.text.clone(),
        };
        let thunk: TaskThunk = Arc::new(move || {
            let provider = provider.clone();
            let provider_req = provider_req.clone();
            Box::pin(async move { provider.translate(provider_req).await })
        });
        self.request_queue
            .enqueue(
                thunk,
                earliest_from_epoch_ms(req.schedule_at_ms),
                req.hash.as_deref(),
            )
            .await
    }

    async fn dispatch_genai_single(
        &self,
        req: &TranslateRequest,
    ) -> anyhow::Result<tolk_genai::GenAiOutput> {
        let (handle, signal) = abort_pair();
        self.register_abort(&req.client_request_id, handle);
        self.genai_backlog.fetch_add(1, Ordering::SeqCst);
        self.warm_pool(&req.provider).await;

        let ctx = self.batch_context(
            &req.provider,
            &req.lang,
            req.article_title.clone(),
            req.article_text_content.clone(),
        );
        let chunk = GenAiBatchChunk {
            text: req.text.clone(),
            hash: req.hash.clone(),
            metadata: req.chunk_metadata.clone(),
        };
        let result = self.genai.translate_single(&ctx, &chunk, &signal).await;

        self.genai_backlog.fetch_sub(1, Ordering::SeqCst);
        self.unregister_abort(&req.client_request_id);
        result
    }

    /// Backlog-aware warm-up: `clamp(ceil(backlog / 2), 1, max_slots)`.
    async fn warm_pool(&self, provider: &ProviderConfig) {
        let backlog = self.genai_backlog.load(Ordering::SeqCst);
        let desired = backlog
            .div_ceil(2)
            .clamp(1, self.genai_cfg.max_slots_per_key);
        let key = self.pool_key(provider);
        let driver = self.genai.driver();
        driver.pool().scale(&key, desired, driver.chat_factory()).await;
    }

    fn pool_key(&self, provider: &ProviderConfig) -> PoolKey {
        PoolKey::new(
            provider.id.clone(),
            ChatPurpose::Translate,
            provider.base_url.clone(),
        )
    }

    fn batch_context(
        &self,
        provider: &ProviderConfig,
        lang: &LangConfig,
        article_title: Option<String>,
        article_context: Option<String>,
    ) -> BatchContext {
        BatchContext {
            key: self.pool_key(provider),
            lang: lang.clone(),
            article_title,
            article_context,
        }
    }

    fn register_abort(&self, client_request_id: &str, handle: AbortHandle) {
        self.aborts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(client_request_id.to_string())
            .or_default()
            .push(handle);
    }

    fn unregister_abort(&self, client_request_id: &str) {
        self.aborts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(client_request_id);
    }

    async fn write_cache(&self, hash: &str, text: &str, req: &TranslateRequest, latency_ms: u64) {
        let mut entry = CacheEntry::new(text);
        if let Some(meta) = &req.chunk_metadata {
            entry = entry.with_metrics(ChunkMetrics {
                raw_chars: meta.raw_chars,
                clean_chars: meta.clean_chars,
                stripped_markup: meta.stripped_markup,
                provider_id: req.provider.id.clone(),
                latency_ms,
                hostname: None,
                mode: None,
            });
        }
        self.cache.put(hash, entry).await;
    }
}

/// In-process sink: lets a [`crate::GenAiBatchAggregator`] feed the
/// dispatcher directly when no IPC boundary separates them.
#[async_trait::async_trait]
impl GenAiBatchSink for Dispatcher {
    async fn enqueue_genai_batch(
        &self,
        batch: AggregatedBatch,
    ) -> anyhow::Result<Vec<anyhow::Result<String>>> {
        Dispatcher::enqueue_genai_batch(
            self,
            GenAiBatchRequest {
                chunks: batch.chunks,
                lang: batch.lang,
                provider: batch.provider,
                schedule_at_ms: None,
                client_request_id: batch.client_request_id,
                tab_id: None,
                article_title: batch.article_title,
                article_text_content: batch.article_text_content,
            },
        )
        .await
    }
}

/// Convert a caller-supplied epoch-ms schedule time into a queue deadline.
/// Times in the past (or unset) mean "run as soon as admitted".
fn earliest_from_epoch_ms(schedule_at_ms: Option<u64>) -> Option<Instant> {
    let at = schedule_at_ms? as i64;
    let now = chrono::Utc::now().timestamp_millis();
    let delta = at.saturating_sub(now);
    if delta <= 0 {
        return None;
    }
    Some(Instant::now() + std::time::Duration::from_millis(delta as u64))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
