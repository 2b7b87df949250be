// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Rate-limited dispatch queues.
//!
//! Three layers, each wrapping the one below:
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │ BatchQueue      per-key coalescing, separator   │
//! │                 protocol, individual fallback   │
//! ├─────────────────────────────────────────────────┤
//! │ RequestQueue    dedupe by content hash,         │
//! │                 runtime reconfiguration         │
//! ├─────────────────────────────────────────────────┤
//! │ Scheduler       token bucket, FIFO admission,   │
//! │                 timeouts, retry with backoff    │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! Tasks are opaque async thunks returning `anyhow::Result<String>`. A thunk
//! that fails with a [`Retryable`]-wrapped error (or a timeout) is retried by
//! the scheduler with exponential backoff; anything else is terminal.

mod batch;
mod error;
mod request;
mod scheduler;

pub use batch::{
    join_batch_texts, split_batch_output, BatchExecutor, BatchPayload, BatchQueue, BatchTask,
    BATCH_SEPARATOR,
};
pub use error::{is_retryable, retryable, QueueError, Retryable};
pub use request::RequestQueue;
pub use scheduler::{Scheduler, TaskThunk};
