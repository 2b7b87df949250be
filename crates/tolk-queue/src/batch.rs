// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use tolk_config::{BatchConfig, BatchConfigPatch};

use crate::error::QueueError;
use crate::request::RequestQueue;
use crate::scheduler::TaskThunk;

/// Separator token between chunk texts in a combined batch payload.
pub const BATCH_SEPARATOR: &str = "[[SEP]]";

/// Join chunk texts into one payload. The blank lines around the separator
/// keep providers from gluing fragments to it.
pub fn join_batch_texts<S: AsRef<str>>(texts: &[S]) -> String {
    texts
        .iter()
        .map(|t| t.as_ref())
        .collect::<Vec<_>>()
        .join(&format!("\n\n{BATCH_SEPARATOR}\n\n"))
}

/// Split a combined response back into per-chunk fragments.
///
/// Splitting is on the bare separator token (providers do not reliably
/// reproduce the surrounding blank lines) and each fragment is trimmed.
/// A fragment-count mismatch is a hard error.
pub fn split_batch_output(combined: &str, expected: usize) -> Result<Vec<String>, QueueError> {
    let fragments: Vec<String> = combined
        .split(BATCH_SEPARATOR)
        .map(|f| f.trim().to_string())
        .collect();
    if fragments.len() != expected {
        return Err(QueueError::CountMismatch {
            expected,
            actual: fragments.len(),
        });
    }
    Ok(fragments)
}

/// One translation task awaiting batching.
#[derive(Debug, Clone)]
pub struct BatchTask {
    pub id: Uuid,
    pub text: String,
    pub source_lang: String,
    pub target_lang: String,
    pub provider_id: String,
    /// Content hash for dedupe/caching of the individual task.
    pub hash: Option<String>,
    pub client_request_id: String,
    /// Per-task character budget; the batch budget is the max of these and
    /// the global limit.
    pub char_budget: Option<usize>,
    /// Do not execute before this instant.
    pub earliest: Option<Instant>,
}

impl BatchTask {
    /// Tasks sharing a key may be coalesced into one provider call.
    pub fn batch_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.source_lang, self.target_lang, self.provider_id
        )
    }

    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }
}

/// Combined payload handed to the executor for one flush.
#[derive(Debug, Clone)]
pub struct BatchPayload {
    pub joined_text: String,
    pub source_lang: String,
    pub target_lang: String,
    pub provider_id: String,
    pub compound_hash: String,
    pub item_count: usize,
}

/// The provider seam: how a combined batch and an individual fallback task
/// are actually executed. Network access lives behind this trait.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn run_batch(&self, payload: &BatchPayload) -> anyhow::Result<String>;
    async fn run_single(&self, task: &BatchTask) -> anyhow::Result<String>;
}

/// `None` while live; `Some(reason)` once cancelled. Shared between the
/// pending/in-flight registries and the distribution path.
type CancelCell = Arc<Mutex<Option<String>>>;

struct PendingEntry {
    task: BatchTask,
    resolver: oneshot::Sender<anyhow::Result<String>>,
    cancelled: CancelCell,
}

struct PendingBatch {
    id: Uuid,
    entries: Vec<PendingEntry>,
    total_chars: usize,
    budget: usize,
    timer: Option<JoinHandle<()>>,
}

impl PendingBatch {
    fn new(budget: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            entries: Vec::new(),
            total_chars: 0,
            budget,
            timer: None,
        }
    }
}

struct Inner {
    request_queue: RequestQueue,
    executor: Arc<dyn BatchExecutor>,
    config: RwLock<BatchConfig>,
    pending: Mutex<HashMap<String, PendingBatch>>,
    /// Batches currently executing: batch id → the tasks it carries, so that
    /// cancellation can still reach them.
    inflight: Mutex<HashMap<Uuid, Vec<(BatchTask, CancelCell)>>>,
}

/// Coalesces tasks sharing a batch key into combined provider calls under
/// character and item budgets, with per-task fallback when a batch dies.
#[derive(Clone)]
pub struct BatchQueue {
    inner: Arc<Inner>,
}

impl BatchQueue {
    pub fn new(
        request_queue: RequestQueue,
        executor: Arc<dyn BatchExecutor>,
        config: BatchConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                request_queue,
                executor,
                config: RwLock::new(config),
                pending: Mutex::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn apply_patch(&self, patch: &BatchConfigPatch) {
        let mut cfg = self.inner.config.write().unwrap_or_else(|e| e.into_inner());
        cfg.apply(patch);
        debug!(?cfg, "batch queue reconfigured");
    }

    /// Add a task; resolves with its individual translation once the batch
    /// containing it (or its fallback retry) completes.
    pub async fn enqueue(&self, task: BatchTask) -> anyhow::Result<String> {
        let (resolver, rx) = oneshot::channel();
        let entry = PendingEntry {
            task,
            resolver,
            cancelled: Arc::new(Mutex::new(None)),
        };

        let cfg = self
            .inner
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let key = entry.task.batch_key();
        let mut to_flush: Vec<PendingBatch> = Vec::new();

        {
            let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            let batch = pending
                .entry(key.clone())
                .or_insert_with(|| PendingBatch::new(cfg.max_characters_per_batch));

            // The effective budget only ever grows: max of the per-task
            // budget, the batch's current budget and the global limit.
            batch.budget = batch
                .budget
                .max(entry.task.char_budget.unwrap_or(0))
                .max(cfg.max_characters_per_batch);

            let chars = entry.task.char_count();
            if !batch.entries.is_empty() && batch.total_chars + chars > batch.budget {
                // The incoming task would cross the char budget: flush what
                // we have and start fresh with just this task.
                let budget = batch.budget;
                let mut full = std::mem::replace(batch, PendingBatch::new(budget));
                if let Some(t) = full.timer.take() {
                    t.abort();
                }
                to_flush.push(full);
                batch.budget = batch.budget.max(entry.task.char_budget.unwrap_or(0));
            }

            batch.total_chars += chars;
            batch.entries.push(entry);

            if batch.entries.len() >= cfg.max_items_per_batch
                || batch.total_chars >= batch.budget
            {
                let mut full = pending.remove(&key).expect("batch just inserted");
                if let Some(t) = full.timer.take() {
                    t.abort();
                }
                to_flush.push(full);
            } else {
                // Start (or restart) the flush timer for the open batch.
                let handle = spawn_timer(
                    self.inner.clone(),
                    key.clone(),
                    batch.id,
                    Duration::from_millis(cfg.batch_delay_ms),
                );
                if let Some(old) = batch.timer.replace(handle) {
                    old.abort();
                }
            }
        }

        for batch in to_flush {
            spawn_execute(self.inner.clone(), batch);
        }

        rx.await
            .map_err(|_| anyhow::Error::new(QueueError::Shutdown))?
    }

    /// Cancel every task matching `predicate`.
    ///
    /// Pending tasks are removed from their batches (budgets adjusted) and
    /// rejected immediately; in-flight tasks are marked so the distribution
    /// path rejects them when the batch settles. Returns how many tasks were
    /// touched.
    pub fn cancel_tasks(&self, predicate: impl Fn(&BatchTask) -> bool, reason: &str) -> usize {
        let mut touched = 0;

        {
            let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            let cfg = self.inner.config.read().unwrap_or_else(|e| e.into_inner());
            let mut emptied = Vec::new();
            for (key, batch) in pending.iter_mut() {
                let mut kept = Vec::with_capacity(batch.entries.len());
                for entry in batch.entries.drain(..) {
                    if predicate(&entry.task) {
                        touched += 1;
                        batch.total_chars -= entry.task.char_count();
                        let _ = entry.resolver.send(Err(anyhow::Error::new(
                            QueueError::Cancelled(reason.to_string()),
                        )));
                    } else {
                        kept.push(entry);
                    }
                }
                batch.entries = kept;
                if batch.entries.is_empty() {
                    if let Some(t) = batch.timer.take() {
                        t.abort();
                    }
                    emptied.push(key.clone());
                } else {
                    // Reschedule the remaining tasks on a fresh delay window.
                    let handle = spawn_timer(
                        self.inner.clone(),
                        key.clone(),
                        batch.id,
                        Duration::from_millis(cfg.batch_delay_ms),
                    );
                    if let Some(old) = batch.timer.replace(handle) {
                        old.abort();
                    }
                }
            }
            for key in emptied {
                pending.remove(&key);
            }
        }

        {
            let inflight = self.inner.inflight.lock().unwrap_or_else(|e| e.into_inner());
            for tasks in inflight.values() {
                for (task, cell) in tasks {
                    if predicate(task) {
                        let mut cell = cell.lock().unwrap_or_else(|e| e.into_inner());
                        if cell.is_none() {
                            *cell = Some(reason.to_string());
                            touched += 1;
                        }
                    }
                }
            }
        }

        touched
    }

    /// Number of tasks waiting in open batches.
    pub fn pending_len(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|b| b.entries.len())
            .sum()
    }
}

fn spawn_timer(
    inner: Arc<Inner>,
    key: String,
    batch_id: Uuid,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let detached = {
            let mut pending = inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.get(&key) {
                Some(batch) if batch.id == batch_id => pending.remove(&key),
                _ => None,
            }
        };
        if let Some(batch) = detached {
            debug!(key = %key, items = batch.entries.len(), "batch delay elapsed, flushing");
            spawn_execute(inner, batch);
        }
    })
}

fn spawn_execute(inner: Arc<Inner>, batch: PendingBatch) {
    tokio::spawn(execute_batch(inner, batch));
}

async fn execute_batch(inner: Arc<Inner>, batch: PendingBatch) {
    let entries = batch.entries;
    if entries.is_empty() {
        return;
    }

    inner
        .inflight
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(
            batch.id,
            entries
                .iter()
                .map(|e| (e.task.clone(), e.cancelled.clone()))
                .collect(),
        );

    let first = &entries[0].task;
    let texts: Vec<&str> = entries.iter().map(|e| e.task.text.as_str()).collect();
    let joined = join_batch_texts(&texts);
    let payload = Arc::new(BatchPayload {
        compound_hash: compound_hash(&joined, first),
        joined_text: joined,
        source_lang: first.source_lang.clone(),
        target_lang: first.target_lang.clone(),
        provider_id: first.provider_id.clone(),
        item_count: entries.len(),
    });

    // Honour every task's earliest-start constraint.
    let earliest = entries.iter().filter_map(|e| e.task.earliest).max();

    let thunk: TaskThunk = {
        let executor = inner.executor.clone();
        let payload = payload.clone();
        Arc::new(move || {
            let executor = executor.clone();
            let payload = payload.clone();
            Box::pin(async move { executor.run_batch(&payload).await })
        })
    };

    let result = inner
        .request_queue
        .enqueue(thunk, earliest, Some(&payload.compound_hash))
        .await;

    inner
        .inflight
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&batch.id);

    match result {
        Ok(combined) => match split_batch_output(&combined, entries.len()) {
            Ok(fragments) => {
                for (entry, fragment) in entries.into_iter().zip(fragments) {
                    resolve_unless_cancelled(entry, Ok(fragment));
                }
            }
            Err(mismatch) => {
                warn!(
                    expected = payload.item_count,
                    error = %mismatch,
                    "batch output fragment mismatch"
                );
                fallback_or_reject(inner, entries, anyhow::Error::new(mismatch)).await;
            }
        },
        Err(err) => {
            fallback_or_reject(inner, entries, err).await;
        }
    }
}

/// Terminal batch failure: retry each task individually through the request
/// queue (never back through the batch queue), or reject everything when
/// fallback is disabled.
async fn fallback_or_reject(inner: Arc<Inner>, entries: Vec<PendingEntry>, err: anyhow::Error) {
    let fallback = inner
        .config
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .fallback_to_individual;

    if !fallback {
        let shared = err.to_string();
        for entry in entries {
            resolve_unless_cancelled(entry, Err(anyhow::anyhow!("{shared}")));
        }
        return;
    }

    debug!(error = %err, tasks = entries.len(), "batch failed, retrying tasks individually");
    for entry in entries {
        if is_cancelled(&entry) {
            // Deliver the cancellation instead of a fallback attempt.
            resolve_unless_cancelled(entry, Err(anyhow::anyhow!("cancelled")));
            continue;
        }
        let inner = inner.clone();
        tokio::spawn(async move {
            let task = entry.task.clone();
            let executor = inner.executor.clone();
            let thunk: TaskThunk = Arc::new(move || {
                let executor = executor.clone();
                let task = task.clone();
                Box::pin(async move { executor.run_single(&task).await })
            });
            let result = inner
                .request_queue
                .enqueue(thunk, None, entry.task.hash.as_deref())
                .await;
            resolve_unless_cancelled(entry, result);
        });
    }
}

fn is_cancelled(entry: &PendingEntry) -> bool {
    let reason = entry
        .cancelled
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    reason.is_some()
}

fn resolve_unless_cancelled(entry: PendingEntry, result: anyhow::Result<String>) {
    let reason = entry
        .cancelled
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    let outcome = match reason {
        Some(reason) => Err(anyhow::Error::new(QueueError::Cancelled(reason))),
        None => result,
    };
    let _ = entry.resolver.send(outcome);
}

/// Content hash of a combined payload: the joined text plus the provider
/// fingerprint, so identical batches to different providers never collide.
fn compound_hash(joined: &str, task: &BatchTask) -> String {
    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    hasher.update([0x1f]);
    hasher.update(task.provider_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(task.source_lang.as_bytes());
    hasher.update([0x1f]);
    hasher.update(task.target_lang.as_bytes());
    hex::encode(hasher.finalize())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
