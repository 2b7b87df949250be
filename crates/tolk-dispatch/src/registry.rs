// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Maps live client-request ids to their owning tabs so a tab close can
/// fan out to every request it started.
///
/// Entries are removed when a request completes or is cancelled; both
/// directions of the index stay consistent under one lock.
#[derive(Default)]
pub struct ClientRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    by_request: HashMap<String, Option<u64>>,
    by_tab: HashMap<u64, HashSet<String>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client_request_id: &str, tab_id: Option<u64>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .by_request
            .insert(client_request_id.to_string(), tab_id);
        if let Some(tab) = tab_id {
            inner
                .by_tab
                .entry(tab)
                .or_default()
                .insert(client_request_id.to_string());
        }
    }

    /// Drop a registration. Idempotent.
    pub fn release(&self, client_request_id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(Some(tab)) = inner.by_request.remove(client_request_id) {
            if let Some(set) = inner.by_tab.get_mut(&tab) {
                set.remove(client_request_id);
                if set.is_empty() {
                    inner.by_tab.remove(&tab);
                }
            }
        }
    }

    /// Remove and return every request id owned by `tab_id`.
    pub fn take_tab(&self, tab_id: u64) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let ids: Vec<String> = inner
            .by_tab
            .remove(&tab_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for id in &ids {
            inner.by_request.remove(id);
        }
        ids
    }

    pub fn contains(&self, client_request_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_request
            .contains_key(client_request_id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_request
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
