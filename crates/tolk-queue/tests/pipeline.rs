// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Cross-layer behavior of the queue stack: batching on top of dedupe on
//! top of token-bucket admission.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use tolk_config::{BatchConfig, QueueConfig, QueueConfigPatch};
use tolk_queue::{
    BatchExecutor, BatchPayload, BatchQueue, BatchTask, RequestQueue, BATCH_SEPARATOR,
};

struct EchoExecutor {
    batch_calls: AtomicU32,
    single_calls: AtomicU32,
    joined: Mutex<Vec<String>>,
}

impl EchoExecutor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            batch_calls: AtomicU32::new(0),
            single_calls: AtomicU32::new(0),
            joined: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl BatchExecutor for EchoExecutor {
    async fn run_batch(&self, payload: &BatchPayload) -> anyhow::Result<String> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.joined.lock().unwrap().push(payload.joined_text.clone());
        // Long enough for concurrent identical flushes to overlap.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let out: Vec<String> = payload
            .joined_text
            .split(BATCH_SEPARATOR)
            .map(|f| format!("<{}>", f.trim()))
            .collect();
        Ok(out.join(&format!(" {BATCH_SEPARATOR} ")))
    }

    async fn run_single(&self, task: &BatchTask) -> anyhow::Result<String> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("<{}>", task.text))
    }
}

fn task(text: &str, target: &str) -> BatchTask {
    BatchTask {
        id: Uuid::new_v4(),
        text: text.into(),
        source_lang: "en".into(),
        target_lang: target.into(),
        provider_id: "llm".into(),
        hash: None,
        client_request_id: "req".into(),
        char_budget: None,
        earliest: None,
    }
}

fn queues(max_items: usize) -> (BatchQueue, Arc<EchoExecutor>) {
    let mut qcfg = QueueConfig::default();
    qcfg.rate = 500.0;
    qcfg.capacity = 50;
    qcfg.base_retry_delay_ms = 5;
    let bcfg = BatchConfig {
        max_items_per_batch: max_items,
        max_characters_per_batch: 1000,
        batch_delay_ms: 20,
        fallback_to_individual: true,
    };
    let exec = EchoExecutor::new();
    (
        BatchQueue::new(RequestQueue::new(qcfg), exec.clone(), bcfg),
        exec,
    )
}

#[tokio::test]
async fn distinct_batch_keys_never_share_a_flush() {
    let (q, exec) = queues(2);
    let (a, b, c, d) = tokio::join!(
        q.enqueue(task("a", "sv")),
        q.enqueue(task("b", "sv")),
        q.enqueue(task("c", "de")),
        q.enqueue(task("d", "de")),
    );
    assert_eq!(a.unwrap(), "<a>");
    assert_eq!(b.unwrap(), "<b>");
    assert_eq!(c.unwrap(), "<c>");
    assert_eq!(d.unwrap(), "<d>");
    assert_eq!(exec.batch_calls.load(Ordering::SeqCst), 2);
    for joined in exec.joined.lock().unwrap().iter() {
        let langs_mixed = joined.contains('a') && joined.contains('c');
        assert!(!langs_mixed, "batch mixed languages: {joined}");
    }
}

#[tokio::test]
async fn identical_flushes_are_deduplicated_downstream() {
    // Two batches with identical content and key, produced sequentially but
    // close enough that the first is still in flight: the compound hash
    // lets the request queue collapse them into one provider call.
    let (q, exec) = queues(1);
    let first = q.enqueue(task("same", "sv"));
    let second = q.enqueue(task("same", "sv"));
    let (first, second) = tokio::join!(first, second);
    assert_eq!(first.unwrap(), "<same>");
    assert_eq!(second.unwrap(), "<same>");
    assert_eq!(
        exec.batch_calls.load(Ordering::SeqCst),
        1,
        "identical payloads must collapse via the dedupe table"
    );
}

#[tokio::test]
async fn rate_limit_spaces_out_batch_flushes() {
    let mut qcfg = QueueConfig::default();
    qcfg.rate = 50.0;
    qcfg.capacity = 1;
    let bcfg = BatchConfig {
        max_items_per_batch: 1,
        max_characters_per_batch: 1000,
        batch_delay_ms: 5,
        fallback_to_individual: true,
    };
    let exec = EchoExecutor::new();
    let q = BatchQueue::new(RequestQueue::new(qcfg), exec.clone(), bcfg);

    let started = tokio::time::Instant::now();
    let (a, b, c) = tokio::join!(
        q.enqueue(task("x", "sv")),
        q.enqueue(task("y", "de")),
        q.enqueue(task("z", "fr")),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();
    assert!(
        started.elapsed() >= Duration::from_millis(35),
        "three single-item batches through a 1-token bucket at 50/s \
         cannot finish in {}ms",
        started.elapsed().as_millis()
    );
}

#[tokio::test]
async fn reconfiguration_reaches_the_shared_scheduler() {
    let (q, _exec) = queues(1);
    // Tighten retries to zero through the batch queue's request queue; the
    // patch applies to everything submitted afterwards.
    let rq = {
        let mut qcfg = QueueConfig::default();
        qcfg.rate = 500.0;
        RequestQueue::new(qcfg)
    };
    rq.apply_patch(&QueueConfigPatch {
        max_retries: Some(0),
        ..Default::default()
    });
    assert_eq!(rq.config_snapshot().max_retries, 0);
    // The batch queue still works after its own patch.
    q.apply_patch(&tolk_config::BatchConfigPatch {
        max_items_per_batch: Some(4),
        max_characters_per_batch: None,
    });
    assert_eq!(q.enqueue(task("ok", "sv")).await.unwrap(), "<ok>");
}
