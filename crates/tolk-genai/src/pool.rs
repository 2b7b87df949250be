// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use tolk_config::GenAiConfig;
use tolk_store::KvStore;

/// Store key under which the whole pool snapshot is persisted.
const POOL_STORE_KEY: &str = "genai_chat_pool";

/// What a pooled conversation is for. Separate purposes never share chats:
/// translation chats carry a translation system context, read chats carry a
/// summarization context, and mixing them poisons parent chaining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatPurpose {
    Translate,
    Read,
}

impl ChatPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatPurpose::Translate => "translate",
            ChatPurpose::Read => "read",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "translate" => Some(ChatPurpose::Translate),
            "read" => Some(ChatPurpose::Read),
            _ => None,
        }
    }
}

/// Pool partition key. Slots are only shared within one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub provider_id: String,
    pub purpose: ChatPurpose,
    pub base_url: String,
}

impl PoolKey {
    pub fn new(
        provider_id: impl Into<String>,
        purpose: ChatPurpose,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            purpose,
            base_url: base_url.into(),
        }
    }

    /// `providerId ":" purpose ":" baseURL`. The base URL may itself contain
    /// colons, which is why parsing splits at most twice.
    pub fn storage_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.provider_id,
            self.purpose.as_str(),
            self.base_url
        )
    }

    pub fn from_storage_key(key: &str) -> Option<Self> {
        let mut parts = key.splitn(3, ':');
        let provider_id = parts.next()?.to_string();
        let purpose = ChatPurpose::parse(parts.next()?)?;
        let base_url = parts.next()?.to_string();
        Some(Self {
            provider_id,
            purpose,
            base_url,
        })
    }
}

/// Creates a fresh server-side conversation. Passed as a trait object so the
/// pool can provision replacements for waiters without capturing closures.
#[async_trait]
pub trait ChatFactory: Send + Sync {
    async fn create_chat(&self) -> anyhow::Result<String>;
}

/// Slot state as persisted. The in-memory `busy` flag is deliberately
/// excluded: after a restart no caller can be holding the slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSlot {
    pub chat_id: String,
    pub last_used: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedEntry {
    slots: Vec<PersistedSlot>,
}

#[derive(Debug, Clone)]
struct Slot {
    id: Uuid,
    chat_id: String,
    last_used: DateTime<Utc>,
    parent_message_id: Option<String>,
    pending_message_id: Option<String>,
    pending_since: Option<DateTime<Utc>>,
    busy: bool,
}

impl Slot {
    fn new_busy(chat_id: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id,
            last_used: Utc::now(),
            parent_message_id: None,
            pending_message_id: None,
            pending_since: None,
            busy: true,
        }
    }

    fn persisted(&self) -> PersistedSlot {
        PersistedSlot {
            chat_id: self.chat_id.clone(),
            last_used: self.last_used,
            parent_message_id: self.parent_message_id.clone(),
            pending_message_id: self.pending_message_id.clone(),
            pending_since: self.pending_since,
        }
    }

    fn from_persisted(p: PersistedSlot) -> Self {
        Self {
            id: Uuid::new_v4(),
            chat_id: p.chat_id,
            last_used: p.last_used,
            parent_message_id: p.parent_message_id,
            pending_message_id: p.pending_message_id,
            pending_since: p.pending_since,
            busy: false,
        }
    }
}

/// Everything a lease needs to know about its slot at grant time.
#[derive(Debug, Clone)]
struct Grant {
    slot_id: Uuid,
    chat_id: String,
    parent_message_id: Option<String>,
    pending_message_id: Option<String>,
}

impl Grant {
    fn of(slot: &Slot) -> Self {
        Self {
            slot_id: slot.id,
            chat_id: slot.chat_id.clone(),
            parent_message_id: slot.parent_message_id.clone(),
            pending_message_id: slot.pending_message_id.clone(),
        }
    }
}

type Waiter = oneshot::Sender<Result<Grant, String>>;

#[derive(Default)]
struct KeyState {
    slots: Vec<Slot>,
    waiters: VecDeque<Waiter>,
    pending_provisions: usize,
    /// Most recent factory seen for this key; used when the pool must
    /// provision a replacement slot for a waiter on its own.
    factory: Option<Arc<dyn ChatFactory>>,
}

struct PoolInner {
    max_slots_per_key: usize,
    idle_ttl: Duration,
    keys: Mutex<HashMap<PoolKey, Arc<Mutex<KeyState>>>>,
    /// Persistence mirror: always reflects the latest slot lists (sans busy
    /// flags). The writer task serializes this, so no snapshot is ever lost
    /// even when triggers coalesce.
    mirror: StdMutex<HashMap<String, PersistedEntry>>,
    persist_tx: mpsc::UnboundedSender<()>,
    store: Arc<dyn KvStore>,
}

/// Bounded pool of server-side conversations, keyed by
/// (provider, purpose, base URL), persisted through a single-writer queue.
#[derive(Clone)]
pub struct ChatPool {
    inner: Arc<PoolInner>,
}

impl ChatPool {
    /// Hydrate the pool from the store, dropping slots that outlived the
    /// idle TTL or lack a chat id. Slots with a pending message id survive
    /// hydration; the driver reconciles them before reuse.
    pub async fn new(store: Arc<dyn KvStore>, cfg: &GenAiConfig) -> Self {
        let idle_ttl = Duration::from_secs(cfg.idle_ttl_secs);
        let mut keys = HashMap::new();
        let mut mirror = HashMap::new();

        let persisted: HashMap<String, PersistedEntry> = match store.get(POOL_STORE_KEY).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "discarding unreadable chat pool snapshot");
                HashMap::new()
            }),
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!(error = %e, "chat pool hydration read failed");
                HashMap::new()
            }
        };

        let min_last_used = Utc::now()
            - chrono::Duration::from_std(idle_ttl).unwrap_or_else(|_| chrono::Duration::zero());
        for (key_str, entry) in persisted {
            let Some(key) = PoolKey::from_storage_key(&key_str) else {
                warn!(key = %key_str, "skipping unparseable pool key");
                continue;
            };
            let slots: Vec<Slot> = entry
                .slots
                .into_iter()
                .filter(|s| !s.chat_id.is_empty() && s.last_used >= min_last_used)
                .map(Slot::from_persisted)
                .collect();
            if slots.is_empty() {
                continue;
            }
            debug!(key = %key_str, count = slots.len(), "hydrated chat slots");
            mirror.insert(
                key_str,
                PersistedEntry {
                    slots: slots.iter().map(Slot::persisted).collect(),
                },
            );
            keys.insert(
                key,
                Arc::new(Mutex::new(KeyState {
                    slots,
                    ..KeyState::default()
                })),
            );
        }

        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            max_slots_per_key: cfg.max_slots_per_key.max(1),
            idle_ttl,
            keys: Mutex::new(keys),
            mirror: StdMutex::new(mirror),
            persist_tx,
            store,
        });
        spawn_writer(inner.clone(), persist_rx);
        Self { inner }
    }

    async fn key_state(&self, key: &PoolKey) -> Arc<Mutex<KeyState>> {
        let mut keys = self.inner.keys.lock().await;
        keys.entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(KeyState::default())))
            .clone()
    }

    /// Refresh the persistence mirror for `key` and nudge the writer.
    /// Called with the key lock held; the mirror has its own short lock.
    fn schedule_persist(&self, key: &PoolKey, st: &KeyState) {
        let entry = PersistedEntry {
            slots: st.slots.iter().map(Slot::persisted).collect(),
        };
        {
            let mut mirror = self.inner.mirror.lock().unwrap_or_else(|e| e.into_inner());
            if entry.slots.is_empty() {
                mirror.remove(&key.storage_key());
            } else {
                mirror.insert(key.storage_key(), entry);
            }
        }
        let _ = self.inner.persist_tx.send(());
    }

    fn prune_idle(&self, key: &PoolKey, st: &mut KeyState) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.inner.idle_ttl)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let before = st.slots.len();
        st.slots.retain(|s| s.busy || s.last_used >= cutoff);
        if st.slots.len() != before {
            debug!(
                key = %key.storage_key(),
                evicted = before - st.slots.len(),
                "pruned idle chat slots"
            );
            self.schedule_persist(key, st);
        }
    }

    /// Acquire an exclusive lease on a conversation slot.
    ///
    /// Reuses a free slot when one exists, provisions a new chat while under
    /// capacity, and otherwise joins the FIFO wait list until a holder
    /// releases or invalidates.
    pub async fn acquire(
        &self,
        key: &PoolKey,
        factory: Arc<dyn ChatFactory>,
    ) -> anyhow::Result<ChatLease> {
        let key_state = self.key_state(key).await;

        let wait_rx = {
            let mut st = key_state.lock().await;
            st.factory = Some(factory.clone());
            self.prune_idle(key, &mut st);

            if let Some(slot) = st.slots.iter_mut().find(|s| !s.busy) {
                slot.busy = true;
                slot.last_used = Utc::now();
                let grant = Grant::of(slot);
                self.schedule_persist(key, &st);
                return Ok(ChatLease::new(self.clone(), key.clone(), grant));
            }

            if st.slots.len() + st.pending_provisions < self.inner.max_slots_per_key {
                st.pending_provisions += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                st.waiters.push_back(tx);
                Some(rx)
            }
        };

        match wait_rx {
            Some(rx) => {
                let grant = rx
                    .await
                    .map_err(|_| anyhow::anyhow!("chat pool shut down"))?
                    .map_err(|e| anyhow::anyhow!(e))?;
                Ok(ChatLease::new(self.clone(), key.clone(), grant))
            }
            None => {
                // Provision outside the lock; network I/O must not block the key.
                match factory.create_chat().await {
                    Ok(chat_id) => {
                        let mut st = key_state.lock().await;
                        st.pending_provisions -= 1;
                        let slot = Slot::new_busy(chat_id);
                        let grant = Grant::of(&slot);
                        st.slots.push(slot);
                        self.schedule_persist(key, &st);
                        Ok(ChatLease::new(self.clone(), key.clone(), grant))
                    }
                    Err(e) => {
                        let mut st = key_state.lock().await;
                        st.pending_provisions -= 1;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Warm the pool up to `min(desired, capacity)` slots. Best-effort:
    /// creation failures are logged and ignored.
    pub async fn scale(&self, key: &PoolKey, desired: usize, factory: Arc<dyn ChatFactory>) {
        let key_state = self.key_state(key).await;
        let mut st = key_state.lock().await;
        st.factory = Some(factory.clone());
        self.prune_idle(key, &mut st);

        let target = desired.min(self.inner.max_slots_per_key);
        while st.slots.len() + st.pending_provisions < target {
            st.pending_provisions += 1;
            let pool = self.clone();
            let key = key.clone();
            let key_state = key_state.clone();
            let factory = factory.clone();
            tokio::spawn(async move {
                match factory.create_chat().await {
                    Ok(chat_id) => {
                        let mut st = key_state.lock().await;
                        st.pending_provisions -= 1;
                        let mut slot = Slot::new_busy(chat_id);
                        slot.busy = false;
                        st.slots.push(slot);
                        let idx = st.slots.len() - 1;
                        hand_to_waiter_or_free(&mut st, idx);
                        pool.schedule_persist(&key, &st);
                    }
                    Err(e) => {
                        let mut st = key_state.lock().await;
                        st.pending_provisions -= 1;
                        warn!(error = %e, "chat warm-up failed");
                    }
                }
            });
        }
    }

    async fn release_slot(&self, key: &PoolKey, slot_id: Uuid) {
        let key_state = self.key_state(key).await;
        let mut st = key_state.lock().await;
        let Some(idx) = st.slots.iter().position(|s| s.id == slot_id) else {
            return;
        };
        st.slots[idx].last_used = Utc::now();
        hand_to_waiter_or_free(&mut st, idx);
        self.schedule_persist(key, &st);
    }

    async fn invalidate_slot(&self, key: &PoolKey, slot_id: Uuid) {
        let key_state = self.key_state(key).await;
        let mut st = key_state.lock().await;
        st.slots.retain(|s| s.id != slot_id);
        self.schedule_persist(key, &st);

        // Waiters were queued against full capacity; the removal freed one
        // ticket, so provision a fresh chat for the head of the queue.
        if st.waiters.is_empty() {
            return;
        }
        let Some(factory) = st.factory.clone() else {
            return;
        };
        if st.slots.len() + st.pending_provisions >= self.inner.max_slots_per_key {
            return;
        }
        st.pending_provisions += 1;
        let waiter = st.waiters.pop_front().expect("checked non-empty");
        let pool = self.clone();
        let key = key.clone();
        let key_state_task = key_state.clone();
        drop(st);
        tokio::spawn(async move {
            match factory.create_chat().await {
                Ok(chat_id) => {
                    let mut st = key_state_task.lock().await;
                    st.pending_provisions -= 1;
                    let slot = Slot::new_busy(chat_id);
                    let grant = Grant::of(&slot);
                    st.slots.push(slot);
                    if waiter.send(Ok(grant)).is_err() {
                        // Waiter gave up while we were provisioning.
                        let idx = st.slots.len() - 1;
                        hand_to_waiter_or_free(&mut st, idx);
                    }
                    pool.schedule_persist(&key, &st);
                }
                Err(e) => {
                    let mut st = key_state_task.lock().await;
                    st.pending_provisions -= 1;
                    let _ = waiter.send(Err(format!("chat provisioning failed: {e:#}")));
                }
            }
        });
    }

    async fn update_slot(&self, key: &PoolKey, slot_id: Uuid, f: impl FnOnce(&mut Slot)) {
        let key_state = self.key_state(key).await;
        let mut st = key_state.lock().await;
        if let Some(slot) = st.slots.iter_mut().find(|s| s.id == slot_id) {
            f(slot);
            self.schedule_persist(key, &st);
        }
    }

    /// Force a synchronous snapshot write. Shutdown/test helper; normal
    /// operation relies on the background writer.
    pub async fn persist_now(&self) {
        let snapshot = {
            self.inner
                .mirror
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        };
        write_snapshot(&self.inner.store, &snapshot).await;
    }

    /// Number of slots currently held by callers (test/metrics helper).
    pub async fn busy_count(&self, key: &PoolKey) -> usize {
        let key_state = self.key_state(key).await;
        let st = key_state.lock().await;
        st.slots.iter().filter(|s| s.busy).count()
    }

    /// Total slots for a key, busy or not.
    pub async fn slot_count(&self, key: &PoolKey) -> usize {
        let key_state = self.key_state(key).await;
        let st = key_state.lock().await;
        st.slots.len()
    }
}

/// Hand the slot at `idx` to the first live waiter (keeping it busy), or
/// mark it free when nobody is waiting.
fn hand_to_waiter_or_free(st: &mut KeyState, idx: usize) {
    while let Some(waiter) = st.waiters.pop_front() {
        st.slots[idx].busy = true;
        st.slots[idx].last_used = Utc::now();
        if waiter.send(Ok(Grant::of(&st.slots[idx]))).is_ok() {
            return;
        }
    }
    st.slots[idx].busy = false;
}

fn spawn_writer(inner: Arc<PoolInner>, mut rx: mpsc::UnboundedReceiver<()>) {
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            // Coalesce queued triggers; the mirror already holds the latest
            // state so intermediate snapshots can be skipped safely.
            while rx.try_recv().is_ok() {}
            let snapshot = {
                inner
                    .mirror
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
            };
            write_snapshot(&inner.store, &snapshot).await;
        }
    });
}

async fn write_snapshot(store: &Arc<dyn KvStore>, snapshot: &HashMap<String, PersistedEntry>) {
    match serde_json::to_string(snapshot) {
        Ok(json) => {
            if let Err(e) = store.set(POOL_STORE_KEY, &json).await {
                warn!(error = %e, "chat pool persistence failed");
            }
        }
        Err(e) => warn!(error = %e, "chat pool snapshot serialization failed"),
    }
}

/// Exclusive hold on one conversation slot.
///
/// The holder must settle the lease through [`release`](Self::release) or
/// [`invalidate`](Self::invalidate); the driver does so on every exit path.
pub struct ChatLease {
    pool: ChatPool,
    key: PoolKey,
    slot_id: Uuid,
    chat_id: String,
    parent_message_id: Option<String>,
    pending_message_id: Option<String>,
}

impl ChatLease {
    fn new(pool: ChatPool, key: PoolKey, grant: Grant) -> Self {
        Self {
            pool,
            key,
            slot_id: grant.slot_id,
            chat_id: grant.chat_id,
            parent_message_id: grant.parent_message_id,
            pending_message_id: grant.pending_message_id,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn parent_message_id(&self) -> Option<&str> {
        self.parent_message_id.as_deref()
    }

    pub fn pending_message_id(&self) -> Option<&str> {
        self.pending_message_id.as_deref()
    }

    /// Record the id of the latest assistant reply; it becomes the parent of
    /// the next user turn in this conversation.
    pub async fn set_parent_message_id(&mut self, id: Option<String>) {
        self.parent_message_id = id.clone();
        self.pool
            .update_slot(&self.key, self.slot_id, move |slot| {
                slot.parent_message_id = id;
            })
            .await;
    }

    /// Record (or clear) an in-flight user turn whose completion is unknown.
    pub async fn set_pending_message_id(&mut self, id: Option<String>) {
        self.pending_message_id = id.clone();
        self.pool
            .update_slot(&self.key, self.slot_id, move |slot| {
                slot.pending_since = id.as_ref().map(|_| Utc::now());
                slot.pending_message_id = id;
            })
            .await;
    }

    /// Return the slot to the pool for reuse.
    pub async fn release(self) {
        self.pool.release_slot(&self.key, self.slot_id).await;
    }

    /// Remove the slot entirely; the conversation is poisoned.
    pub async fn invalidate(self) {
        self.pool.invalidate_slot(&self.key, self.slot_id).await;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tolk_store::MemoryStore;

    struct CountingFactory {
        calls: AtomicU32,
        fail: bool,
    }

    impl CountingFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail: true,
            })
        }

        fn count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatFactory for CountingFactory {
        async fn create_chat(&self) -> anyhow::Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("no session");
            }
            Ok(format!("chat-{n}"))
        }
    }

    fn key() -> PoolKey {
        PoolKey::new("genai", ChatPurpose::Translate, "https://genai.example.com")
    }

    fn cfg(max_slots: usize) -> GenAiConfig {
        let mut c = GenAiConfig::default();
        c.max_slots_per_key = max_slots;
        c
    }

    async fn pool(max_slots: usize) -> (ChatPool, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let p = ChatPool::new(store.clone(), &cfg(max_slots)).await;
        (p, store)
    }

    #[tokio::test]
    async fn acquire_provisions_then_reuses() {
        let (pool, _) = pool(2).await;
        let factory = CountingFactory::new();
        let lease = pool.acquire(&key(), factory.clone()).await.unwrap();
        let chat = lease.chat_id().to_string();
        lease.release().await;
        let lease2 = pool.acquire(&key(), factory.clone()).await.unwrap();
        assert_eq!(lease2.chat_id(), chat);
        assert_eq!(factory.count(), 1, "second acquire must reuse the slot");
        lease2.release().await;
    }

    #[tokio::test]
    async fn capacity_is_respected_and_waiters_get_handoffs() {
        let (pool, _) = pool(1).await;
        let factory = CountingFactory::new();
        let lease = pool.acquire(&key(), factory.clone()).await.unwrap();

        let pool2 = pool.clone();
        let factory2 = factory.clone();
        let waiter = tokio::spawn(async move {
            pool2.acquire(&key(), factory2).await.unwrap()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "second acquire must wait at capacity");
        assert_eq!(pool.busy_count(&key()).await, 1);

        let chat = lease.chat_id().to_string();
        lease.release().await;
        let handed = waiter.await.unwrap();
        // Hand-off keeps the same conversation and never re-provisions.
        assert_eq!(handed.chat_id(), chat);
        assert_eq!(factory.count(), 1);
        assert_eq!(pool.busy_count(&key()).await, 1);
        handed.release().await;
    }

    #[tokio::test]
    async fn waiters_are_served_fifo() {
        let (pool, _) = pool(1).await;
        let factory = CountingFactory::new();
        let lease = pool.acquire(&key(), factory.clone()).await.unwrap();

        let order = Arc::new(StdMutex::new(Vec::new()));
        let mut handles = Vec::new();
        for tag in ["first", "second"] {
            let pool = pool.clone();
            let factory = factory.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let l = pool.acquire(&key(), factory).await.unwrap();
                order.lock().unwrap().push(tag);
                l.release().await;
            }));
            // Deterministic queue order.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        lease.release().await;
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn invalidate_discards_the_conversation() {
        let (pool, _) = pool(2).await;
        let factory = CountingFactory::new();
        let lease = pool.acquire(&key(), factory.clone()).await.unwrap();
        lease.invalidate().await;
        assert_eq!(pool.slot_count(&key()).await, 0);
        let lease2 = pool.acquire(&key(), factory.clone()).await.unwrap();
        assert_eq!(factory.count(), 2, "invalidate must force a fresh chat");
        lease2.release().await;
    }

    #[tokio::test]
    async fn invalidate_provisions_replacement_for_waiter() {
        let (pool, _) = pool(1).await;
        let factory = CountingFactory::new();
        let lease = pool.acquire(&key(), factory.clone()).await.unwrap();

        let pool2 = pool.clone();
        let factory2 = factory.clone();
        let waiter = tokio::spawn(async move {
            pool2.acquire(&key(), factory2).await.unwrap()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        lease.invalidate().await;
        let handed = waiter.await.unwrap();
        assert_eq!(handed.chat_id(), "chat-1", "waiter must get a fresh chat");
        assert_eq!(factory.count(), 2);
        handed.release().await;
    }

    #[tokio::test]
    async fn provisioning_failure_propagates_and_frees_the_ticket() {
        let (pool, _) = pool(1).await;
        assert!(pool.acquire(&key(), CountingFactory::failing()).await.is_err());
        // The failed provision must not leak its capacity ticket.
        let ok = CountingFactory::new();
        let lease = pool.acquire(&key(), ok).await.unwrap();
        lease.release().await;
    }

    #[tokio::test]
    async fn parent_and_pending_ids_survive_persistence() {
        let store = Arc::new(MemoryStore::new());
        let pool = ChatPool::new(store.clone(), &cfg(2)).await;
        let factory = CountingFactory::new();
        let mut lease = pool.acquire(&key(), factory).await.unwrap();
        lease.set_pending_message_id(Some("u-1".into())).await;
        lease.set_parent_message_id(Some("a-1".into())).await;
        lease.set_pending_message_id(None).await;
        lease.release().await;
        pool.persist_now().await;

        let raw = store.get("genai_chat_pool").await.unwrap().unwrap();
        assert!(raw.contains("\"parent_message_id\":\"a-1\""), "raw: {raw}");
        assert!(!raw.contains("pending_message_id"), "cleared field persisted: {raw}");
        assert!(!raw.contains("busy"), "busy flag must never be persisted");

        // A second pool hydrates the slot with its chaining state intact.
        let pool2 = ChatPool::new(store, &cfg(2)).await;
        let lease2 = pool2
            .acquire(&key(), CountingFactory::new())
            .await
            .unwrap();
        assert_eq!(lease2.parent_message_id(), Some("a-1"));
        assert!(lease2.pending_message_id().is_none());
        lease2.release().await;
    }

    #[tokio::test]
    async fn hydration_drops_expired_and_chatless_slots() {
        let store = Arc::new(MemoryStore::new());
        let stale = Utc::now() - chrono::Duration::hours(2);
        let snapshot = serde_json::json!({
            "genai:translate:https://genai.example.com": { "slots": [
                { "chat_id": "old", "last_used": stale },
                { "chat_id": "", "last_used": Utc::now() },
                { "chat_id": "fresh", "last_used": Utc::now(),
                  "pending_message_id": "u-9", "pending_since": Utc::now() },
            ]}
        });
        store
            .set("genai_chat_pool", &snapshot.to_string())
            .await
            .unwrap();

        let pool = ChatPool::new(store, &cfg(3)).await;
        assert_eq!(pool.slot_count(&key()).await, 1);
        let lease = pool.acquire(&key(), CountingFactory::new()).await.unwrap();
        assert_eq!(lease.chat_id(), "fresh");
        // Suspect slot: the pending turn is surfaced for reconciliation.
        assert_eq!(lease.pending_message_id(), Some("u-9"));
        lease.release().await;
    }

    #[tokio::test]
    async fn scale_warms_up_to_capacity() {
        let (pool, _) = pool(3).await;
        let factory = CountingFactory::new();
        pool.scale(&key(), 5, factory.clone()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pool.slot_count(&key()).await, 3, "capped at max slots");
        assert_eq!(pool.busy_count(&key()).await, 0, "warmed slots are free");
        assert_eq!(factory.count(), 3);
        // Scaling again is a no-op while the slots are warm.
        pool.scale(&key(), 3, factory.clone()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(factory.count(), 3);
    }

    #[test]
    fn pool_key_storage_round_trip_with_colons_in_url() {
        let k = PoolKey::new("genai", ChatPurpose::Read, "https://host:8443/api");
        let parsed = PoolKey::from_storage_key(&k.storage_key()).unwrap();
        assert_eq!(parsed, k);
    }
}
