// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Driver for a stateful conversational GenAI translation provider.
//!
//! The provider exposes chats as server-side conversations reached over REST
//! plus SSE. Each user turn must name its parent (the previous assistant
//! reply), which forces strict serialization per conversation. This crate
//! owns everything needed to ride that protocol safely:
//!
//! - [`SseParser`] / [`decode_sse_stream`] — tolerant event-stream decoding
//!   with regex fallback for malformed JSON frames.
//! - [`ChatPool`] — a capacity-bounded, store-persisted pool of conversation
//!   slots keyed by (provider, purpose, base URL).
//! - [`GenAiDriver`] — the recovery state machine around
//!   createChat → sendMessage → openStream → pollMessage.
//! - [`GenAiBatcher`] — combined multi-chunk prompts with recoverable-error
//!   classification and per-chunk fallback.
//! - [`abort_pair`] — the cancellation signal threaded through every await.

mod abort;
mod batch;
mod driver;
mod error;
pub mod mock;
mod pool;
mod protocol;
mod sse;

pub use abort::{abort_pair, AbortHandle, AbortSignal};
pub use batch::{BatchContext, GenAiBatchChunk, GenAiBatcher};
pub use driver::{GenAiDriver, GenAiOutput};
pub use error::{is_recoverable_batch_error, GenAiError};
pub use pool::{ChatFactory, ChatLease, ChatPool, ChatPurpose, PersistedSlot, PoolKey};
pub use protocol::{ByteStream, GenAiTransport, HttpGenAiTransport, MessageStatus};
pub use sse::{decode_sse_stream, SseParser, StreamOutcome};
