// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use tracing::{debug, warn};

use tolk_config::{ChunkMetadata, LangConfig};
use tolk_queue::{join_batch_texts, split_batch_output, QueueError, BATCH_SEPARATOR};
use tolk_store::TranslationCache;

use crate::abort::AbortSignal;
use crate::driver::{GenAiDriver, GenAiOutput};
use crate::error::{is_recoverable_batch_error, GenAiError};
use crate::pool::PoolKey;

/// One snippet inside a batched GenAI request.
#[derive(Debug, Clone)]
pub struct GenAiBatchChunk {
    pub text: String,
    pub hash: Option<String>,
    pub metadata: Option<ChunkMetadata>,
}

/// Shared context for a batch: which pool partition to use, the language
/// pair, and optional article framing for the prompt.
#[derive(Debug, Clone)]
pub struct BatchContext {
    pub key: PoolKey,
    pub lang: LangConfig,
    pub article_title: Option<String>,
    pub article_context: Option<String>,
}

/// Aggregates per-snippet requests into one GenAI prompt, classifies batch
/// failures, and falls back to per-chunk requests when a batch cannot be
/// saved.
pub struct GenAiBatcher {
    driver: Arc<GenAiDriver>,
    cache: Arc<dyn TranslationCache>,
}

impl GenAiBatcher {
    pub fn new(driver: Arc<GenAiDriver>, cache: Arc<dyn TranslationCache>) -> Self {
        Self { driver, cache }
    }

    pub fn driver(&self) -> &Arc<GenAiDriver> {
        &self.driver
    }

    /// Translate `chunks` with one combined prompt.
    ///
    /// Recoverable batch failures (`R50004`, known server message patterns,
    /// fragment-count mismatch) earn exactly one retry; if the retry also
    /// fails, each chunk is retried individually through the single-request
    /// path, reusing cache entries that appeared in the meantime. Results
    /// are positionally aligned with the input.
    pub async fn translate_chunks(
        &self,
        ctx: &BatchContext,
        chunks: &[GenAiBatchChunk],
        abort: &AbortSignal,
    ) -> Vec<anyhow::Result<GenAiOutput>> {
        if chunks.is_empty() {
            return Vec::new();
        }

        let prompt = batch_prompt(ctx, chunks);
        let mut recoverable_failure = None;
        for attempt in 0..2 {
            match self.attempt_batch(ctx, &prompt, chunks.len(), abort).await {
                Ok((texts, completed)) => {
                    return texts
                        .into_iter()
                        .map(|text| Ok(GenAiOutput { text, completed }))
                        .collect();
                }
                Err(err) => {
                    if abort.is_fired()
                        || matches!(
                            err.downcast_ref::<GenAiError>(),
                            Some(GenAiError::Aborted(_))
                        )
                    {
                        return share_error(err, chunks.len());
                    }
                    if !is_recoverable_batch_error(&err) {
                        return share_error(err, chunks.len());
                    }
                    if attempt == 0 {
                        warn!(error = %err, "recoverable batch failure, retrying once");
                        continue;
                    }
                    recoverable_failure = Some(err);
                }
            }
        }

        let err = recoverable_failure.expect("loop exits early unless retry failed");
        debug!(error = %err, chunks = chunks.len(), "batch unrecoverable, falling back per chunk");
        self.fallback_per_chunk(ctx, chunks, abort).await
    }

    /// Translate one chunk through the single-request path (the legacy
    /// per-snippet flow and the fallback path share this).
    pub async fn translate_single(
        &self,
        ctx: &BatchContext,
        chunk: &GenAiBatchChunk,
        abort: &AbortSignal,
    ) -> anyhow::Result<GenAiOutput> {
        if let Some(hash) = &chunk.hash {
            if let Some(hit) = self.cache.get(hash).await {
                return Ok(GenAiOutput {
                    text: hit.translation,
                    completed: true,
                });
            }
        }
        let prompt = single_prompt(ctx, chunk);
        self.driver.generate(&ctx.key, &prompt, abort).await
    }

    async fn attempt_batch(
        &self,
        ctx: &BatchContext,
        prompt: &str,
        expected: usize,
        abort: &AbortSignal,
    ) -> anyhow::Result<(Vec<String>, bool)> {
        let output = self.driver.generate(&ctx.key, prompt, abort).await?;
        let fragments = split_batch_output(&output.text, expected).map_err(|e| match e {
            QueueError::CountMismatch { expected, actual } => {
                anyhow::Error::new(GenAiError::CountMismatch { expected, actual })
            }
            other => anyhow::Error::new(other),
        })?;
        Ok((fragments, output.completed))
    }

    /// Per-chunk fallback through the single-request path. Chunks whose
    /// hashes already landed in the cache are answered from it without
    /// another provider round-trip.
    async fn fallback_per_chunk(
        &self,
        ctx: &BatchContext,
        chunks: &[GenAiBatchChunk],
        abort: &AbortSignal,
    ) -> Vec<anyhow::Result<GenAiOutput>> {
        let mut results = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if abort.is_fired() {
                results.push(Err(anyhow::Error::new(GenAiError::Aborted(
                    "batch fallback cancelled".into(),
                ))));
                continue;
            }
            if let Some(hash) = &chunk.hash {
                if let Some(hit) = self.cache.get(hash).await {
                    debug!(hash = %hash, "fallback chunk served from cache");
                    results.push(Ok(GenAiOutput {
                        text: hit.translation,
                        completed: true,
                    }));
                    continue;
                }
            }
            let prompt = single_prompt(ctx, chunk);
            results.push(self.driver.generate(&ctx.key, &prompt, abort).await);
        }
        results
    }
}

/// Spread one failure across every chunk's resolver.
fn share_error(err: anyhow::Error, n: usize) -> Vec<anyhow::Result<GenAiOutput>> {
    (0..n)
        .map(|_| match err.downcast_ref::<GenAiError>() {
            Some(genai) => Err(anyhow::Error::new(genai.clone())),
            None => Err(anyhow::anyhow!("{err:#}")),
        })
        .collect()
}

/// Combined prompt: translation instructions, article framing, chunk
/// metadata context, then the separator-joined payload.
fn batch_prompt(ctx: &BatchContext, chunks: &[GenAiBatchChunk]) -> String {
    let mut prompt = format!(
        "Translate the following {count} text segments from {src} to {tgt}.\n\
         Segments are separated by lines containing {sep}. Reply with exactly \
         {count} translated segments in the same order, separated by the same \
         {sep} lines. Do not add commentary or numbering.",
        count = chunks.len(),
        src = ctx.lang.source_lang,
        tgt = ctx.lang.target_lang,
        sep = BATCH_SEPARATOR,
    );
    push_article_context(&mut prompt, ctx);
    for chunk in chunks {
        if let Some(meta) = &chunk.metadata {
            prompt.push_str(&format!(
                "\nSegment {}/{} of group {}: {} clean chars{}",
                meta.index,
                meta.total,
                meta.group_id,
                meta.clean_chars,
                if meta.stripped_markup {
                    ", markup stripped"
                } else {
                    ""
                },
            ));
        }
    }
    prompt.push_str("\n\n");
    let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
    prompt.push_str(&join_batch_texts(&texts));
    prompt
}

fn single_prompt(ctx: &BatchContext, chunk: &GenAiBatchChunk) -> String {
    let mut prompt = format!(
        "Translate the following text from {src} to {tgt}. Reply with the \
         translation only.",
        src = ctx.lang.source_lang,
        tgt = ctx.lang.target_lang,
    );
    push_article_context(&mut prompt, ctx);
    prompt.push_str("\n\n");
    prompt.push_str(&chunk.text);
    prompt
}

fn push_article_context(prompt: &mut String, ctx: &BatchContext) {
    if let Some(title) = ctx.article_title.as_deref().filter(|t| !t.is_empty()) {
        prompt.push_str(&format!("\nArticle title: {title}"));
    }
    if let Some(summary) = ctx.article_context.as_deref().filter(|s| !s.is_empty()) {
        prompt.push_str(&format!("\nArticle context: {summary}"));
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedTransport;
    use crate::pool::{ChatPool, ChatPurpose};
    use crate::protocol::MessageStatus;
    use tolk_config::GenAiConfig;
    use tolk_store::{CacheEntry, MemoryCache, MemoryStore};

    fn ctx() -> BatchContext {
        BatchContext {
            key: PoolKey::new("genai", ChatPurpose::Translate, "https://genai.example.com"),
            lang: LangConfig {
                source_lang: "en".into(),
                target_lang: "sv".into(),
            },
            article_title: Some("On Batching".into()),
            article_context: None,
        }
    }

    fn chunk(text: &str, hash: Option<&str>) -> GenAiBatchChunk {
        GenAiBatchChunk {
            text: text.into(),
            hash: hash.map(str::to_string),
            metadata: None,
        }
    }

    fn test_cfg() -> GenAiConfig {
        let mut cfg = GenAiConfig::default();
        cfg.max_recovery_attempts = 2;
        cfg.poll_base_interval_ms = 5;
        cfg.poll_timeout_ms = 150;
        cfg
    }

    async fn batcher(
        transport: Arc<ScriptedTransport>,
    ) -> (GenAiBatcher, Arc<MemoryCache>) {
        let pool = ChatPool::new(Arc::new(MemoryStore::new()), &test_cfg()).await;
        let driver = Arc::new(GenAiDriver::new(transport, pool, test_cfg()));
        let cache = Arc::new(MemoryCache::new(16));
        (GenAiBatcher::new(driver, cache.clone()), cache)
    }

    fn done(content: &str) -> MessageStatus {
        MessageStatus {
            content: Some(content.into()),
            status: Some("SUCCESS".into()),
            response_code: None,
        }
    }

    #[tokio::test]
    async fn batch_success_is_positionally_aligned() {
        let t = ScriptedTransport::new();
        t.push_send(Ok("u-1".into()));
        t.push_stream_completion("a-1", "");
        t.push_message(Ok(done("HEJ [[SEP]] VÄRLDEN")));

        let (b, _) = batcher(t.clone()).await;
        let results = b
            .translate_chunks(
                &ctx(),
                &[chunk("hello", None), chunk("world", None)],
                &AbortSignal::never(),
            )
            .await;
        let texts: Vec<String> = results
            .into_iter()
            .map(|r| r.unwrap().text)
            .collect();
        assert_eq!(texts, vec!["HEJ", "VÄRLDEN"]);
        // One combined send carrying both segments and the instructions.
        let sends = t.sends();
        assert_eq!(sends.len(), 1);
        assert!(sends[0].1.contains("2 text segments"));
        assert!(sends[0].1.contains("hello\n\n[[SEP]]\n\nworld"));
        assert!(sends[0].1.contains("Article title: On Batching"));
    }

    #[tokio::test]
    async fn recoverable_code_earns_exactly_one_retry() {
        let t = ScriptedTransport::new();
        // Attempt 1: R50004 on poll.
        t.push_send(Ok("u-1".into()));
        t.push_stream_completion("a-1", "");
        t.push_message(Ok(MessageStatus {
            content: None,
            status: None,
            response_code: Some("R50004".into()),
        }));
        // Attempt 2 (retry) succeeds.
        t.push_send(Ok("u-2".into()));
        t.push_stream_completion("a-2", "");
        t.push_message(Ok(done("ETT [[SEP]] TVÅ")));

        let (b, _) = batcher(t.clone()).await;
        let results = b
            .translate_chunks(
                &ctx(),
                &[chunk("one", None), chunk("two", None)],
                &AbortSignal::never(),
            )
            .await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(t.sends().len(), 2, "one batch attempt + one retry");
    }

    #[tokio::test]
    async fn exhausted_retries_fall_back_per_chunk_reusing_cache() {
        let t = ScriptedTransport::new();
        for _ in 0..2 {
            t.push_send(Ok("u".into()));
            t.push_stream_completion("a", "");
            t.push_message(Ok(MessageStatus {
                content: None,
                status: None,
                response_code: Some("R50004".into()),
            }));
        }
        // Individual fallback for the second (uncached) chunk.
        t.push_send(Ok("u-f".into()));
        t.push_stream_completion("a-f", "");
        t.push_message(Ok(done("ANDRA")));

        let (b, cache) = batcher(t.clone()).await;
        cache.put("h1", CacheEntry::new("FRÅN CACHE")).await;

        let results = b
            .translate_chunks(
                &ctx(),
                &[chunk("first", Some("h1")), chunk("second", Some("h2"))],
                &AbortSignal::never(),
            )
            .await;
        let outs: Vec<GenAiOutput> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(outs[0].text, "FRÅN CACHE");
        assert!(outs[0].completed);
        assert_eq!(outs[1].text, "ANDRA");
        // 2 batch attempts + 1 individual call; the cached chunk never
        // reached the provider.
        assert_eq!(t.sends().len(), 3);
        let last = &t.sends()[2].1;
        assert!(last.contains("second"));
        assert!(!last.contains(BATCH_SEPARATOR));
    }

    #[tokio::test]
    async fn count_mismatch_is_recoverable() {
        let t = ScriptedTransport::new();
        // Both attempts return a single fragment for two chunks.
        for tag in ["a-1", "a-2"] {
            t.push_send(Ok(format!("u-{tag}")));
            t.push_stream_completion(tag, "");
            t.push_message(Ok(done("bara en bit")));
        }
        // Fallback singles.
        for tag in ["a-3", "a-4"] {
            t.push_send(Ok(format!("u-{tag}")));
            t.push_stream_completion(tag, "");
            t.push_message(Ok(done("EN")));
        }

        let (b, _) = batcher(t.clone()).await;
        let results = b
            .translate_chunks(
                &ctx(),
                &[chunk("x", None), chunk("y", None)],
                &AbortSignal::never(),
            )
            .await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(t.sends().len(), 4, "2 batch attempts + 2 singles");
    }

    #[tokio::test]
    async fn non_recoverable_errors_propagate_to_every_chunk() {
        let t = ScriptedTransport::new();
        t.push_send(Err(GenAiError::Http {
            status: 500,
            endpoint: "/api/chat/v1/messages".into(),
        }));

        let (b, _) = batcher(t.clone()).await;
        let results = b
            .translate_chunks(
                &ctx(),
                &[chunk("x", None), chunk("y", None)],
                &AbortSignal::never(),
            )
            .await;
        assert_eq!(results.len(), 2);
        for r in results {
            let err = r.unwrap_err();
            assert!(matches!(
                err.downcast_ref::<GenAiError>(),
                Some(GenAiError::Http { status: 500, .. })
            ));
        }
        assert_eq!(t.sends().len(), 1, "no retry, no fallback");
    }

    #[test]
    fn batch_prompt_appends_chunk_metadata() {
        let meta = ChunkMetadata {
            group_id: "g-1".into(),
            index: 2,
            total: 3,
            raw_chars: 64,
            clean_chars: 48,
            stripped_markup: true,
        };
        let chunks = [GenAiBatchChunk {
            text: "body".into(),
            hash: None,
            metadata: Some(meta),
        }];
        let prompt = batch_prompt(&ctx(), &chunks);
        assert!(prompt.contains("Segment 2/3 of group g-1: 48 clean chars, markup stripped"));
    }
}
