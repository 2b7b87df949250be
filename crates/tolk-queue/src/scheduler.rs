// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use tolk_config::QueueConfig;

use crate::error::{is_retryable, QueueError};

/// A re-invocable unit of work. The scheduler calls the thunk once per
/// attempt, so retries re-execute from scratch.
pub type TaskThunk = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;

/// Per-attempt limits, snapshotted when the task is submitted so that a
/// runtime reconfiguration never changes the rules for tasks already queued.
#[derive(Debug, Clone, Copy)]
struct AttemptLimits {
    timeout_ms: u64,
    max_retries: u32,
    base_retry_delay_ms: u64,
    max_retry_delay_ms: u64,
}

impl From<&QueueConfig> for AttemptLimits {
    fn from(c: &QueueConfig) -> Self {
        Self {
            timeout_ms: c.timeout_ms,
            max_retries: c.max_retries,
            base_retry_delay_ms: c.base_retry_delay_ms,
            max_retry_delay_ms: c.max_retry_delay_ms,
        }
    }
}

struct Submission {
    thunk: TaskThunk,
    earliest: Instant,
    attempt: u32,
    resolver: oneshot::Sender<anyhow::Result<String>>,
    limits: AttemptLimits,
}

/// Heap entry for tasks whose earliest-start has not elapsed yet.
/// Ordered so that `BinaryHeap` (a max-heap) pops the soonest entry first,
/// ties broken by submission order.
struct Parked {
    earliest: Instant,
    seq: u64,
    sub: Submission,
}

impl PartialEq for Parked {
    fn eq(&self, other: &Self) -> bool {
        self.earliest == other.earliest && self.seq == other.seq
    }
}
impl Eq for Parked {}
impl PartialOrd for Parked {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Parked {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.earliest, other.seq).cmp(&(self.earliest, self.seq))
    }
}

/// Token-bucket admission: one token per task, regenerating at
/// `rate` tokens/second up to `capacity`. Among tasks whose earliest-start
/// has elapsed, admission is strictly FIFO by submission order.
///
/// Cheap to clone; all clones feed the same background dispatch loop.
#[derive(Clone)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<Submission>,
    config: Arc<RwLock<QueueConfig>>,
}

impl Scheduler {
    pub fn new(config: Arc<RwLock<QueueConfig>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(rx, tx.clone(), config.clone()));
        Self { tx, config }
    }

    /// Submit a task, optionally holding it back until `earliest`.
    ///
    /// Resolves with the thunk's result after admission, timeout handling and
    /// retries. Transient failures (see [`crate::is_retryable`]) are retried
    /// up to `max_retries` times at `base · 2^attempt`, clamped.
    pub async fn submit(
        &self,
        thunk: TaskThunk,
        earliest: Option<Instant>,
    ) -> anyhow::Result<String> {
        let (resolver, rx) = oneshot::channel();
        let limits = {
            let cfg = self.config.read().unwrap_or_else(|e| e.into_inner());
            AttemptLimits::from(&*cfg)
        };
        let sub = Submission {
            thunk,
            earliest: earliest.unwrap_or_else(Instant::now),
            attempt: 0,
            resolver,
            limits,
        };
        self.tx
            .send(sub)
            .map_err(|_| anyhow::Error::new(QueueError::Shutdown))?;
        rx.await.map_err(|_| anyhow::Error::new(QueueError::Shutdown))?
    }
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<Submission>,
    retry_tx: mpsc::UnboundedSender<Submission>,
    config: Arc<RwLock<QueueConfig>>,
) {
    let mut seq: u64 = 0;
    let mut ready: BTreeMap<u64, Submission> = BTreeMap::new();
    let mut parked: BinaryHeap<Parked> = BinaryHeap::new();
    let mut tokens = {
        let cfg = config.read().unwrap_or_else(|e| e.into_inner());
        cfg.capacity.max(1) as f64
    };
    let mut last_refill = Instant::now();

    loop {
        // Rate and capacity are read live so a reconfiguration takes effect
        // from the next refill; tasks already admitted are unaffected.
        let (rate, capacity) = {
            let cfg = config.read().unwrap_or_else(|e| e.into_inner());
            (cfg.rate, cfg.capacity.max(1))
        };

        let now = Instant::now();
        if rate > 0.0 {
            let regen = now.duration_since(last_refill).as_secs_f64() * rate;
            tokens = (tokens + regen).min(capacity as f64);
        }
        last_refill = now;

        while parked.peek().is_some_and(|p| p.earliest <= now) {
            let p = parked.pop().expect("peeked entry exists");
            ready.insert(p.seq, p.sub);
        }

        while tokens >= 1.0 {
            let Some(first) = ready.keys().next().copied() else {
                break;
            };
            let sub = ready.remove(&first).expect("key just observed");
            tokens -= 1.0;
            tokio::spawn(run_attempt(sub, retry_tx.clone()));
        }

        // Sleep until something can change: the next token when work is
        // waiting, else the next parked task maturing, else a new submission.
        let deadline = if !ready.is_empty() && rate > 0.0 {
            Some(now + Duration::from_secs_f64((1.0 - tokens).max(0.0) / rate))
        } else {
            parked.peek().map(|p| p.earliest)
        };

        tokio::select! {
            next = rx.recv() => match next {
                Some(sub) => {
                    seq += 1;
                    if sub.earliest <= Instant::now() {
                        ready.insert(seq, sub);
                    } else {
                        parked.push(Parked { earliest: sub.earliest, seq, sub });
                    }
                }
                // Every sender (scheduler handles and in-flight retries) is
                // gone; dropping the queues rejects the remaining resolvers.
                None => break,
            },
            _ = wait_until(deadline) => {}
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => futures::future::pending().await,
    }
}

/// Execute one attempt of a task: enforce the wall-clock timeout, requeue
/// transient failures with backoff, resolve everything else.
async fn run_attempt(sub: Submission, retry_tx: mpsc::UnboundedSender<Submission>) {
    let Submission {
        thunk,
        attempt,
        resolver,
        limits,
        ..
    } = sub;

    let outcome = match tokio::time::timeout(
        Duration::from_millis(limits.timeout_ms),
        (thunk)(),
    )
    .await
    {
        Ok(res) => res,
        Err(_) => Err(anyhow::Error::new(QueueError::Timeout(limits.timeout_ms))),
    };

    match outcome {
        Ok(text) => {
            let _ = resolver.send(Ok(text));
        }
        Err(err) if is_retryable(&err) && attempt < limits.max_retries => {
            let delay = retry_delay(&limits, attempt);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient task failure, requeueing"
            );
            let requeued = Submission {
                thunk,
                earliest: Instant::now() + delay,
                attempt: attempt + 1,
                resolver,
                limits,
            };
            if let Err(send_err) = retry_tx.send(requeued) {
                let _ = send_err.0.resolver.send(Err(anyhow::Error::new(QueueError::Shutdown)));
            }
        }
        Err(err) => {
            let _ = resolver.send(Err(err));
        }
    }
}

/// `base · 2^attempt`, clamped. Integer arithmetic with saturation so a
/// hostile attempt count cannot overflow.
fn retry_delay(limits: &AttemptLimits, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
    let ms = limits
        .base_retry_delay_ms
        .saturating_mul(factor)
        .min(limits.max_retry_delay_ms);
    Duration::from_millis(ms)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
