// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::time::Instant;
use tracing::debug;

use tolk_config::{QueueConfig, QueueConfigPatch};

use crate::error::QueueError;
use crate::scheduler::{Scheduler, TaskThunk};

type SharedAttempt = Shared<BoxFuture<'static, Result<String, Arc<anyhow::Error>>>>;

/// Scheduler wrapper that deduplicates concurrent submissions by content
/// hash and supports runtime reconfiguration.
///
/// Two requests carrying the same hash resolve to the same result; the
/// underlying thunk executes at most once while the first submission is in
/// flight. The dedupe entry is removed by a task attached to the shared
/// future, so late arrivers always observe either the live future or a clean
/// slot for a fresh submission.
#[derive(Clone)]
pub struct RequestQueue {
    scheduler: Scheduler,
    config: Arc<RwLock<QueueConfig>>,
    inflight: Arc<Mutex<HashMap<String, (u64, SharedAttempt)>>>,
    generation: Arc<AtomicU64>,
}

impl RequestQueue {
    pub fn new(config: QueueConfig) -> Self {
        let config = Arc::new(RwLock::new(config));
        Self {
            scheduler: Scheduler::new(config.clone()),
            config,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Update rate/capacity/timeout/retry limits. Tasks already submitted
    /// keep the limits they were submitted under.
    pub fn apply_patch(&self, patch: &QueueConfigPatch) {
        let mut cfg = self.config.write().unwrap_or_else(|e| e.into_inner());
        cfg.apply(patch);
        debug!(?cfg, "request queue reconfigured");
    }

    pub fn config_snapshot(&self) -> QueueConfig {
        self.config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Submit `thunk`, deduplicating against in-flight work when `hash` is
    /// given. A deduplicated caller never re-executes the thunk; it attaches
    /// to the existing attempt and observes the same outcome, success or
    /// terminal failure alike.
    pub async fn enqueue(
        &self,
        thunk: TaskThunk,
        earliest: Option<Instant>,
        hash: Option<&str>,
    ) -> anyhow::Result<String> {
        let Some(hash) = hash else {
            return self.scheduler.submit(thunk, earliest).await;
        };

        let (shared, owner) = {
            let mut map = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((_, existing)) = map.get(hash) {
                debug!(hash, "attaching to in-flight request");
                (existing.clone(), None)
            } else {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let scheduler = self.scheduler.clone();
                let fut = async move {
                    scheduler
                        .submit(thunk, earliest)
                        .await
                        .map_err(Arc::new)
                }
                .boxed()
                .shared();
                map.insert(hash.to_string(), (generation, fut.clone()));
                (fut, Some(generation))
            }
        };

        if let Some(generation) = owner {
            // Drive the attempt and clean the table from a detached task so
            // neither depends on this caller staying polled.
            let inflight = self.inflight.clone();
            let key = hash.to_string();
            let fut = shared.clone();
            tokio::spawn(async move {
                let _ = fut.await;
                let mut map = inflight.lock().unwrap_or_else(|e| e.into_inner());
                if map.get(&key).map(|(g, _)| *g) == Some(generation) {
                    map.remove(&key);
                }
            });
        }

        shared.await.map_err(|e| clone_shared_error(&e))
    }

    /// Number of distinct hashes currently in flight.
    pub fn inflight_len(&self) -> usize {
        self.inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Reconstruct an owned error from the shared `Arc`. Queue-level errors keep
/// their type so callers can still match on them; anything else degrades to
/// its rendered chain.
fn clone_shared_error(err: &Arc<anyhow::Error>) -> anyhow::Error {
    if let Some(q) = err.downcast_ref::<QueueError>() {
        return anyhow::Error::new(q.clone());
    }
    anyhow::anyhow!("{err:#}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
