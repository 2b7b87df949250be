// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless explicitly
/// disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub genai: GenAiConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
}

/// Admission control for the rate-limited request queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Token regeneration rate, tasks per second.
    #[serde(default = "QueueConfig::default_rate")]
    pub rate: f64,
    /// Burst capacity — the bucket never holds more than this many tokens.
    #[serde(default = "QueueConfig::default_capacity")]
    pub capacity: u32,
    /// Wall-clock deadline per attempt, measured from admission.
    #[serde(default = "QueueConfig::default_timeout_ms")]
    pub timeout_ms: u64,
    /// Additional attempts after the first failure.
    #[serde(default = "QueueConfig::default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential retry backoff (`base · 2^attempt`).
    #[serde(default = "QueueConfig::default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,
    /// Upper clamp for the retry delay.
    #[serde(default = "QueueConfig::default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
}

impl QueueConfig {
    fn default_rate() -> f64 {
        5.0
    }
    fn default_capacity() -> u32 {
        5
    }
    fn default_timeout_ms() -> u64 {
        30_000
    }
    fn default_max_retries() -> u32 {
        2
    }
    fn default_base_retry_delay_ms() -> u64 {
        500
    }
    fn default_max_retry_delay_ms() -> u64 {
        30_000
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            rate: Self::default_rate(),
            capacity: Self::default_capacity(),
            timeout_ms: Self::default_timeout_ms(),
            max_retries: Self::default_max_retries(),
            base_retry_delay_ms: Self::default_base_retry_delay_ms(),
            max_retry_delay_ms: Self::default_max_retry_delay_ms(),
        }
    }
}

/// Partial update for [`QueueConfig`], applied at runtime.
///
/// Only tasks submitted after the patch observe the new values. Field names
/// are camelCase because patches arrive over the wire, not from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfigPatch {
    pub rate: Option<f64>,
    pub capacity: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub base_retry_delay_ms: Option<u64>,
}

impl QueueConfig {
    pub fn apply(&mut self, patch: &QueueConfigPatch) {
        if let Some(v) = patch.rate {
            self.rate = v;
        }
        if let Some(v) = patch.capacity {
            self.capacity = v;
        }
        if let Some(v) = patch.timeout_ms {
            self.timeout_ms = v;
        }
        if let Some(v) = patch.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = patch.base_retry_delay_ms {
            self.base_retry_delay_ms = v;
        }
    }
}

/// Coalescing limits for the per-key batch queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "BatchConfig::default_max_characters_per_batch")]
    pub max_characters_per_batch: usize,
    #[serde(default = "BatchConfig::default_max_items_per_batch")]
    pub max_items_per_batch: usize,
    /// How long an under-budget batch waits for more tasks before flushing.
    #[serde(default = "BatchConfig::default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    /// Retry each task individually after the batch exhausts its retries.
    #[serde(default = "default_true")]
    pub fallback_to_individual: bool,
}

impl BatchConfig {
    fn default_max_characters_per_batch() -> usize {
        4000
    }
    fn default_max_items_per_batch() -> usize {
        10
    }
    fn default_batch_delay_ms() -> u64 {
        50
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_characters_per_batch: Self::default_max_characters_per_batch(),
            max_items_per_batch: Self::default_max_items_per_batch(),
            batch_delay_ms: Self::default_batch_delay_ms(),
            fallback_to_individual: true,
        }
    }
}

/// Partial update for [`BatchConfig`]. Wire type, hence camelCase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConfigPatch {
    pub max_characters_per_batch: Option<usize>,
    pub max_items_per_batch: Option<usize>,
}

impl BatchConfig {
    pub fn apply(&mut self, patch: &BatchConfigPatch) {
        if let Some(v) = patch.max_characters_per_batch {
            self.max_characters_per_batch = v;
        }
        if let Some(v) = patch.max_items_per_batch {
            self.max_items_per_batch = v;
        }
    }
}

/// Conversational GenAI provider tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenAiConfig {
    /// Live conversation slots per (provider, purpose, base-URL) key.
    #[serde(default = "GenAiConfig::default_max_slots_per_key")]
    pub max_slots_per_key: usize,
    /// Idle conversations older than this are evicted on acquire.
    #[serde(default = "GenAiConfig::default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
    /// Outer chat-reset loop bound in the driver.
    #[serde(default = "GenAiConfig::default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
    /// Base interval between message-status polls.
    #[serde(default = "GenAiConfig::default_poll_base_interval_ms")]
    pub poll_base_interval_ms: u64,
    /// Poll interval grows as `base · min(attempt, this)`.
    #[serde(default = "GenAiConfig::default_poll_max_backoff_multiplier")]
    pub poll_max_backoff_multiplier: u32,
    /// Give up polling a message after this long.
    #[serde(default = "GenAiConfig::default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Deadline for the assistant SSE stream.
    #[serde(default = "GenAiConfig::default_stream_timeout_ms")]
    pub stream_timeout_ms: u64,
    /// Model id sent with the messages-response stream request.
    #[serde(default = "GenAiConfig::default_model_id")]
    pub model_id: String,
}

impl GenAiConfig {
    fn default_max_slots_per_key() -> usize {
        3
    }
    fn default_idle_ttl_secs() -> u64 {
        600
    }
    fn default_max_recovery_attempts() -> u32 {
        3
    }
    fn default_poll_base_interval_ms() -> u64 {
        500
    }
    fn default_poll_max_backoff_multiplier() -> u32 {
        6
    }
    fn default_poll_timeout_ms() -> u64 {
        60_000
    }
    fn default_stream_timeout_ms() -> u64 {
        120_000
    }
    fn default_model_id() -> String {
        "genai-default".into()
    }
}

impl Default for GenAiConfig {
    fn default() -> Self {
        Self {
            max_slots_per_key: Self::default_max_slots_per_key(),
            idle_ttl_secs: Self::default_idle_ttl_secs(),
            max_recovery_attempts: Self::default_max_recovery_attempts(),
            poll_base_interval_ms: Self::default_poll_base_interval_ms(),
            poll_max_backoff_multiplier: Self::default_poll_max_backoff_multiplier(),
            poll_timeout_ms: Self::default_poll_timeout_ms(),
            stream_timeout_ms: Self::default_stream_timeout_ms(),
            model_id: Self::default_model_id(),
        }
    }
}

/// Client-side GenAI batch aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default = "AggregatorConfig::default_max_items_per_batch")]
    pub max_items_per_batch: usize,
    #[serde(default = "AggregatorConfig::default_max_characters_per_batch")]
    pub max_characters_per_batch: usize,
    /// Debounce window before an under-budget batch is flushed.
    #[serde(default = "AggregatorConfig::default_flush_delay_ms")]
    pub flush_delay_ms: u64,
}

impl AggregatorConfig {
    fn default_max_items_per_batch() -> usize {
        10
    }
    fn default_max_characters_per_batch() -> usize {
        4000
    }
    fn default_flush_delay_ms() -> u64 {
        60
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_items_per_batch: Self::default_max_items_per_batch(),
            max_characters_per_batch: Self::default_max_characters_per_batch(),
            flush_delay_ms: Self::default_flush_delay_ms(),
        }
    }
}

// ── Request descriptors ───────────────────────────────────────────────────────

/// What kind of pipeline a provider routes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Generic LLM endpoint — translate calls are coalesced into batches.
    Llm,
    /// Stateful conversational GenAI provider (chat pool + SSE).
    GenAi,
    /// Stateless provider submitted directly to the request queue.
    Simple,
}

/// Provider identity and connection parameters, supplied per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Free-form provider options forwarded verbatim.
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

/// Source and target language of a translation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LangConfig {
    pub source_lang: String,
    pub target_lang: String,
}

/// Position of a snippet within a larger extracted block, carried through
/// for prompt context and instrumentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub group_id: String,
    /// 1-based position within the group.
    pub index: usize,
    pub total: usize,
    pub raw_chars: usize,
    pub clean_chars: usize,
    pub stripped_markup: bool,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert!(c.queue.rate > 0.0);
        assert!(c.queue.capacity >= 1);
        assert!(c.batch.max_items_per_batch >= 1);
        assert!(c.genai.max_slots_per_key >= 1);
        assert!(c.batch.fallback_to_individual);
    }

    #[test]
    fn empty_yaml_yields_defaults() {
        let c: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(c.queue.max_retries, QueueConfig::default().max_retries);
        assert_eq!(
            c.batch.max_characters_per_batch,
            BatchConfig::default().max_characters_per_batch
        );
    }

    #[test]
    fn partial_yaml_overrides_only_named_fields() {
        let c: Config = serde_yaml::from_str("queue:\n  rate: 10.5\n").unwrap();
        assert_eq!(c.queue.rate, 10.5);
        assert_eq!(c.queue.capacity, QueueConfig::default().capacity);
    }

    #[test]
    fn queue_patch_leaves_unset_fields() {
        let mut cfg = QueueConfig::default();
        cfg.apply(&QueueConfigPatch {
            rate: Some(1.0),
            ..Default::default()
        });
        assert_eq!(cfg.rate, 1.0);
        assert_eq!(cfg.timeout_ms, QueueConfig::default().timeout_ms);
    }

    #[test]
    fn batch_patch_updates_both_budgets() {
        let mut cfg = BatchConfig::default();
        cfg.apply(&BatchConfigPatch {
            max_characters_per_batch: Some(1000),
            max_items_per_batch: Some(3),
        });
        assert_eq!(cfg.max_characters_per_batch, 1000);
        assert_eq!(cfg.max_items_per_batch, 3);
    }

    #[test]
    fn provider_kind_round_trips_snake_case() {
        let json = serde_json::to_string(&ProviderKind::GenAi).unwrap();
        assert_eq!(json, "\"gen_ai\"");
        let back: ProviderKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ProviderKind::GenAi);
    }
}
