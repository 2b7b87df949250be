// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::KvStore;

/// Instrumentation record attached to a cache entry when chunk metadata was
/// present on the originating request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetrics {
    pub raw_chars: usize,
    pub clean_chars: usize,
    pub stripped_markup: bool,
    pub provider_id: String,
    pub latency_ms: u64,
    pub hostname: Option<String>,
    pub mode: Option<String>,
}

/// One cached translation. Entries are write-once: the hash is a function of
/// the cleaned text and provider identity, so a second write of the same key
/// must carry an equal translation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub translation: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_metrics: Option<ChunkMetrics>,
}

impl CacheEntry {
    pub fn new(translation: impl Into<String>) -> Self {
        Self {
            translation: translation.into(),
            created_at: Utc::now(),
            chunk_metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ChunkMetrics) -> Self {
        self.chunk_metrics = Some(metrics);
        self
    }
}

/// Content-addressed translation cache, read before dispatch and written on
/// definitive success only.
#[async_trait]
pub trait TranslationCache: Send + Sync {
    async fn get(&self, hash: &str) -> Option<CacheEntry>;
    async fn put(&self, hash: &str, entry: CacheEntry);
}

/// Purely in-memory cache. Used by tests and as the fallback when no durable
/// store is configured.
pub struct MemoryCache {
    entries: Mutex<lru::LruCache<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        Self {
            entries: Mutex::new(lru::LruCache::new(cap)),
        }
    }
}

#[async_trait]
impl TranslationCache for MemoryCache {
    async fn get(&self, hash: &str) -> Option<CacheEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(hash)
            .cloned()
    }

    async fn put(&self, hash: &str, entry: CacheEntry) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(hash.to_string(), entry);
    }
}

/// Write-through cache: LRU in front, durable [`KvStore`] behind.
///
/// Store keys are prefixed `cache:` so cache entries and other persisted
/// records can share one store. A store failure degrades to memory-only
/// operation with a warning; translation delivery never depends on the
/// durable layer.
pub struct StoreCache {
    memory: MemoryCache,
    store: Arc<dyn KvStore>,
}

const CACHE_KEY_PREFIX: &str = "cache:";

impl StoreCache {
    pub fn new(store: Arc<dyn KvStore>, memory_capacity: usize) -> Self {
        Self {
            memory: MemoryCache::new(memory_capacity),
            store,
        }
    }
}

#[async_trait]
impl TranslationCache for StoreCache {
    async fn get(&self, hash: &str) -> Option<CacheEntry> {
        if let Some(hit) = self.memory.get(hash).await {
            return Some(hit);
        }
        let key = format!("{CACHE_KEY_PREFIX}{hash}");
        match self.store.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<CacheEntry>(&raw) {
                Ok(entry) => {
                    self.memory.put(hash, entry.clone()).await;
                    Some(entry)
                }
                Err(e) => {
                    warn!(hash, error = %e, "discarding unreadable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(hash, error = %e, "cache store read failed");
                None
            }
        }
    }

    async fn put(&self, hash: &str, entry: CacheEntry) {
        self.memory.put(hash, entry.clone()).await;
        let key = format!("{CACHE_KEY_PREFIX}{hash}");
        match serde_json::to_string(&entry) {
            Ok(raw) => {
                if let Err(e) = self.store.set(&key, &raw).await {
                    warn!(hash, error = %e, "cache store write failed");
                }
            }
            Err(e) => warn!(hash, error = %e, "cache entry serialization failed"),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
