// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use tolk_config::GenAiConfig;

use crate::abort::AbortSignal;
use crate::error::GenAiError;
use crate::pool::{ChatFactory, ChatLease, ChatPool, PoolKey};
use crate::protocol::{GenAiTransport, MessageStatus};
use crate::sse::{decode_sse_stream, is_completion_word};

/// Result of one GenAI generation.
///
/// `completed` is true only for definitive success (the poll endpoint
/// confirmed the reply). Fallback text recovered from the stream after an
/// ambiguous poll is delivered with `completed == false` and must not be
/// cached.
#[derive(Debug, Clone, PartialEq)]
pub struct GenAiOutput {
    pub text: String,
    pub completed: bool,
}

/// Statuses on the poll endpoint that mean the reply failed outright.
const FAILURE_STATUSES: [&str; 3] = ["FAIL", "FAILED", "ERROR"];

fn is_failure(status: &MessageStatus) -> Option<String> {
    if let Some(code) = &status.response_code {
        if code.to_ascii_uppercase().starts_with("R5") {
            return Some(code.clone());
        }
    }
    if let Some(s) = &status.status {
        let upper = s.trim().to_ascii_uppercase();
        if FAILURE_STATUSES.contains(&upper.as_str()) {
            return Some(upper);
        }
    }
    None
}

fn is_done(status: &MessageStatus) -> bool {
    status
        .status
        .as_deref()
        .map(is_completion_word)
        .unwrap_or(false)
        || status
            .response_code
            .as_deref()
            .map(is_completion_word)
            .unwrap_or(false)
}

/// How a finished turn leaves its slot.
enum SlotDisposition {
    /// Chat is healthy; slot goes back to the pool.
    Release,
    /// Chat is gone or unusable on the server side; drop the slot locally.
    Invalidate,
    /// Conversational fault: delete the remote chat, then drop the slot.
    Reset,
}

enum TurnOutcome {
    /// Definitive success, reply confirmed by the poll endpoint.
    Completed(String),
    /// Usable text recovered from the stream, but the poll never confirmed
    /// it. The chat is not trusted afterwards.
    Fallback(String),
    /// Conversational fault worth a fresh chat and another attempt.
    Retry,
}

struct Fatal {
    error: anyhow::Error,
    slot: SlotDisposition,
}

impl Fatal {
    fn new(error: impl Into<anyhow::Error>, slot: SlotDisposition) -> Self {
        Self {
            error: error.into(),
            slot,
        }
    }
}

struct TransportChatFactory {
    transport: Arc<dyn GenAiTransport>,
}

#[async_trait]
impl ChatFactory for TransportChatFactory {
    async fn create_chat(&self) -> anyhow::Result<String> {
        self.transport.create_chat().await
    }
}

/// Recovery state machine around createChat → sendMessage → openStream →
/// pollMessage. Bounded to `max_recovery_attempts` consecutive chat resets.
pub struct GenAiDriver {
    transport: Arc<dyn GenAiTransport>,
    pool: ChatPool,
    cfg: GenAiConfig,
}

impl GenAiDriver {
    pub fn new(transport: Arc<dyn GenAiTransport>, pool: ChatPool, cfg: GenAiConfig) -> Self {
        Self {
            transport,
            pool,
            cfg,
        }
    }

    pub fn pool(&self) -> &ChatPool {
        &self.pool
    }

    pub fn chat_factory(&self) -> Arc<dyn ChatFactory> {
        Arc::new(TransportChatFactory {
            transport: self.transport.clone(),
        })
    }

    /// Generate a reply for `prompt` inside a pooled conversation.
    ///
    /// Conversational faults (busy parents that never settle, failed
    /// replies, lost messages) reset the chat — remote delete plus local
    /// invalidation — and try again on a fresh one, up to the configured
    /// bound. Aborts fire the server-side cancel endpoint without awaiting
    /// it and surface as [`GenAiError::Aborted`].
    pub async fn generate(
        &self,
        key: &PoolKey,
        prompt: &str,
        abort: &AbortSignal,
    ) -> anyhow::Result<GenAiOutput> {
        let factory = self.chat_factory();
        for attempt in 0..self.cfg.max_recovery_attempts {
            if abort.is_fired() {
                return Err(GenAiError::Aborted("cancelled before dispatch".into()).into());
            }
            let mut lease = self.pool.acquire(key, factory.clone()).await?;
            match self.run_turn(&mut lease, prompt, abort).await {
                Ok(TurnOutcome::Completed(text)) => {
                    lease.release().await;
                    return Ok(GenAiOutput {
                        text,
                        completed: true,
                    });
                }
                Ok(TurnOutcome::Fallback(text)) => {
                    self.reset(lease).await;
                    return Ok(GenAiOutput {
                        text,
                        completed: false,
                    });
                }
                Ok(TurnOutcome::Retry) => {
                    debug!(attempt, chat = lease.chat_id(), "conversation fault, resetting chat");
                    self.reset(lease).await;
                }
                Err(fatal) => {
                    match fatal.slot {
                        SlotDisposition::Release => lease.release().await,
                        SlotDisposition::Invalidate => lease.invalidate().await,
                        SlotDisposition::Reset => self.reset(lease).await,
                    }
                    return Err(fatal.error);
                }
            }
        }
        Err(GenAiError::ExhaustedRecovery.into())
    }

    /// Remote delete (best-effort, errors swallowed) followed by local
    /// invalidation.
    async fn reset(&self, lease: ChatLease) {
        let chat_id = lease.chat_id().to_string();
        if let Err(e) = self.transport.delete_chats(&[chat_id.clone()]).await {
            debug!(chat = %chat_id, error = %e, "remote chat delete failed");
        }
        lease.invalidate().await;
    }

    /// Eagerly stop the assistant stream server-side; never awaited.
    fn spawn_cancel(&self, user_message_id: &str) {
        let transport = self.transport.clone();
        let id = user_message_id.to_string();
        tokio::spawn(async move {
            let _ = transport.cancel_response(&id).await;
        });
    }

    async fn run_turn(
        &self,
        lease: &mut ChatLease,
        prompt: &str,
        abort: &AbortSignal,
    ) -> Result<TurnOutcome, Fatal> {
        // A pending user turn left behind by a crash or abort makes the slot
        // suspect: wait for the server to settle it, or start over.
        if let Some(pending) = lease.pending_message_id().map(str::to_string) {
            debug!(chat = lease.chat_id(), pending = %pending, "reconciling suspect slot");
            match self.wait_for_completion(&pending, abort).await {
                Ok(()) => lease.set_pending_message_id(None).await,
                Err(e) if matches!(e, GenAiError::Aborted(_)) => {
                    return Err(Fatal::new(e, SlotDisposition::Reset));
                }
                Err(_) => return Ok(TurnOutcome::Retry),
            }
        }

        // Send the user turn; a busy parent earns exactly one completion
        // wait before the chat is given up on.
        let mut parent_wait_attempted = false;
        let user_id = loop {
            let parent = lease.parent_message_id().map(str::to_string);
            match self
                .transport
                .send_message(lease.chat_id(), prompt, parent.as_deref())
                .await
            {
                Ok(id) => break id,
                Err(GenAiError::PendingResponse) => {
                    if let Some(parent) = parent.filter(|_| !parent_wait_attempted) {
                        parent_wait_attempted = true;
                        match self.wait_for_completion(&parent, abort).await {
                            Ok(()) => continue,
                            Err(e) if matches!(e, GenAiError::Aborted(_)) => {
                                return Err(Fatal::new(e, SlotDisposition::Reset));
                            }
                            Err(_) => return Ok(TurnOutcome::Retry),
                        }
                    }
                    return Ok(TurnOutcome::Retry);
                }
                Err(e) if e.invalidates_chat() => {
                    return Err(Fatal::new(e, SlotDisposition::Invalidate));
                }
                Err(e) => return Err(Fatal::new(e, SlotDisposition::Release)),
            }
        };
        lease.set_pending_message_id(Some(user_id.clone())).await;

        // Stream the assistant reply.
        let stream_result = match self
            .transport
            .open_stream(lease.chat_id(), &user_id, &self.cfg.model_id)
            .await
        {
            Ok(stream) => {
                match tokio::time::timeout(
                    Duration::from_millis(self.cfg.stream_timeout_ms),
                    decode_sse_stream(stream, abort.clone()),
                )
                .await
                {
                    Ok(res) => res,
                    Err(_) => {
                        warn!(chat = lease.chat_id(), "assistant stream timed out");
                        return Ok(TurnOutcome::Retry);
                    }
                }
            }
            Err(e) if e.invalidates_chat() => {
                return Err(Fatal::new(e, SlotDisposition::Invalidate))
            }
            Err(e) => return Err(Fatal::new(e, SlotDisposition::Release)),
        };

        let outcome = match stream_result {
            Ok(o) => o,
            Err(GenAiError::Aborted(msg)) => {
                self.spawn_cancel(&user_id);
                return Err(Fatal::new(
                    GenAiError::Aborted(msg),
                    SlotDisposition::Reset,
                ));
            }
            Err(GenAiError::StreamMissingId) => {
                // The chat itself may still be fine; only this call is lost.
                return Err(Fatal::new(
                    GenAiError::StreamMissingId,
                    SlotDisposition::Release,
                ));
            }
            Err(e) if e.invalidates_chat() => {
                return Err(Fatal::new(e, SlotDisposition::Invalidate))
            }
            Err(e) => {
                debug!(error = %e, "stream failed mid-reply, resetting");
                return Ok(TurnOutcome::Retry);
            }
        };

        // Confirm via the poll endpoint.
        match self
            .poll_message_content(&outcome.response_id, abort)
            .await
        {
            PollVerdict::Completed(text) => {
                lease.set_pending_message_id(None).await;
                lease
                    .set_parent_message_id(Some(outcome.response_id.clone()))
                    .await;
                Ok(TurnOutcome::Completed(normalize(&text)))
            }
            PollVerdict::Deleted => {
                if outcome.fallback_content.trim().is_empty() {
                    Err(Fatal::new(GenAiError::ChatGone, SlotDisposition::Invalidate))
                } else {
                    // The message vanished but the stream already gave us the
                    // reply; deliver it uncached and drop the chat.
                    Ok(TurnOutcome::Fallback(normalize(&outcome.fallback_content)))
                }
            }
            PollVerdict::TimedOut => {
                if outcome.fallback_content.trim().is_empty() {
                    Ok(TurnOutcome::Retry)
                } else {
                    Ok(TurnOutcome::Fallback(normalize(&outcome.fallback_content)))
                }
            }
            PollVerdict::Failed(code) => Err(Fatal::new(
                GenAiError::ResponseFailed(code),
                SlotDisposition::Reset,
            )),
            PollVerdict::Aborted => {
                self.spawn_cancel(&user_id);
                Err(Fatal::new(
                    GenAiError::Aborted("poll cancelled".into()),
                    SlotDisposition::Reset,
                ))
            }
        }
    }

    /// Wait until a message id reaches a terminal state. Used both for
    /// suspect-slot reconciliation and for the one parent-busy retry.
    async fn wait_for_completion(
        &self,
        message_id: &str,
        abort: &AbortSignal,
    ) -> Result<(), GenAiError> {
        match self.poll_message(message_id, abort, |status| is_done(status)).await {
            PollStep::Done(_) => Ok(()),
            PollStep::Deleted => Err(GenAiError::ChatGone),
            PollStep::TimedOut => Err(GenAiError::PollTimeout(self.cfg.poll_timeout_ms)),
            PollStep::Failed(code) => Err(GenAiError::ResponseFailed(code)),
            PollStep::Aborted => Err(GenAiError::Aborted("wait cancelled".into())),
        }
    }

    /// Poll `GET /messages/{id}` until the reply text is confirmed complete.
    async fn poll_message_content(&self, message_id: &str, abort: &AbortSignal) -> PollVerdict {
        let step = self
            .poll_message(message_id, abort, |status| {
                is_done(status)
                    && status
                        .content
                        .as_deref()
                        .is_some_and(|c| !c.trim().is_empty())
            })
            .await;
        match step {
            PollStep::Done(status) => {
                PollVerdict::Completed(status.content.unwrap_or_default())
            }
            PollStep::Deleted => PollVerdict::Deleted,
            PollStep::TimedOut => PollVerdict::TimedOut,
            PollStep::Failed(code) => PollVerdict::Failed(code),
            PollStep::Aborted => PollVerdict::Aborted,
        }
    }

    /// Shared poll loop. Interval grows as `base · min(attempt, max_mult)`;
    /// the whole loop is bounded by `poll_timeout_ms`.
    async fn poll_message(
        &self,
        message_id: &str,
        abort: &AbortSignal,
        mut done: impl FnMut(&MessageStatus) -> bool,
    ) -> PollStep {
        let deadline = Instant::now() + Duration::from_millis(self.cfg.poll_timeout_ms);
        let base = self.cfg.poll_base_interval_ms.max(1);
        let mut abort = abort.clone();
        let mut attempt: u32 = 0;

        loop {
            if abort.is_fired() {
                return PollStep::Aborted;
            }
            let status = tokio::select! {
                _ = abort.fired() => return PollStep::Aborted,
                res = self.transport.get_message(message_id) => res,
            };
            match status {
                Ok(status) => {
                    if let Some(code) = is_failure(&status) {
                        return PollStep::Failed(code);
                    }
                    if done(&status) {
                        return PollStep::Done(status);
                    }
                }
                Err(GenAiError::ChatGone) => return PollStep::Deleted,
                Err(e) => {
                    debug!(message_id, error = %e, "message poll attempt failed");
                }
            }

            attempt += 1;
            let multiplier = attempt.min(self.cfg.poll_max_backoff_multiplier) as u64;
            let delay = Duration::from_millis(base.saturating_mul(multiplier));
            if Instant::now() + delay >= deadline {
                return PollStep::TimedOut;
            }
            tokio::select! {
                _ = abort.fired() => return PollStep::Aborted,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

enum PollStep {
    Done(MessageStatus),
    Deleted,
    TimedOut,
    Failed(String),
    Aborted,
}

enum PollVerdict {
    Completed(String),
    Deleted,
    TimedOut,
    Failed(String),
    Aborted,
}

fn normalize(text: &str) -> String {
    text.trim().to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
