// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use tokio::sync::watch;

/// Create a linked abort handle/signal pair.
///
/// One pair exists per client request; the signal side is cloned into every
/// async operation belonging to that request and selected over at each await
/// point. Firing is idempotent and sticky: signals created or checked after
/// the fact still observe the abort.
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    let tx = Arc::new(tx);
    (
        AbortHandle { tx: tx.clone() },
        AbortSignal {
            rx,
            _handle: Some(tx),
        },
    )
}

/// The firing side of an abort pair.
#[derive(Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    /// Fire the signal. Subsequent calls are no-ops.
    pub fn fire(&self) {
        // send_replace never fails even with no live receivers.
        self.tx.send_replace(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }
}

/// The observing side of an abort pair. Cheap to clone.
#[derive(Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
    // Keeps the channel open so a signal outliving its handle still works.
    _handle: Option<Arc<watch::Sender<bool>>>,
}

impl AbortSignal {
    /// A signal that can never fire, for call sites without cancellation.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _handle: Some(Arc::new(tx)),
        }
    }

    pub fn is_fired(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the signal fires; pend forever if it never does.
    pub async fn fired(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        loop {
            if self.rx.changed().await.is_err() {
                // Sender gone without firing: this signal can never fire.
                futures::future::pending::<()>().await;
            }
            if *self.rx.borrow() {
                return;
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
