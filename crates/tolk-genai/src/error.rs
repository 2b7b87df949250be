// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

/// Faults specific to the conversational GenAI protocol.
#[derive(Debug, Clone, Error)]
pub enum GenAiError {
    /// HTTP 422 with `errorCode: "CHAT_ERROR_4"` — the parent message is
    /// still being answered. The driver waits once, then resets the chat.
    #[error("parent message is still processing")]
    PendingResponse,

    /// The server reported a terminal failure status or `R5xxxx` code.
    #[error("response failed with code {0}")]
    ResponseFailed(String),

    /// The SSE stream ended without ever naming a response id. The chat
    /// itself may still be healthy, so the slot is released rather than
    /// invalidated.
    #[error("stream ended without a response id")]
    StreamMissingId,

    /// The message or chat no longer exists on the server (HTTP 404/410).
    #[error("chat or message no longer exists on the server")]
    ChatGone,

    #[error("request aborted: {0}")]
    Aborted(String),

    /// All recovery attempts consumed by consecutive chat resets.
    #[error("chat recovery attempts exhausted")]
    ExhaustedRecovery,

    #[error("batch returned {actual} fragments, expected {expected}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("unexpected HTTP status {status} from {endpoint}")]
    Http { status: u16, endpoint: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("message did not complete within {0}ms")]
    PollTimeout(u64),
}

impl GenAiError {
    /// Statuses on chat endpoints that poison the slot immediately.
    pub fn invalidates_chat(&self) -> bool {
        match self {
            GenAiError::ChatGone => true,
            GenAiError::Http { status, .. } => matches!(status, 401 | 403 | 404 | 410),
            _ => false,
        }
    }
}

fn recoverable_patterns() -> &'static [Regex; 2] {
    static PATTERNS: OnceLock<[Regex; 2]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"(?i)Unexpected token\s+200007").expect("static regex"),
            Regex::new(r"(?i)Model Execution Error").expect("static regex"),
        ]
    })
}

/// Whether a failed batch attempt warrants one retry followed by per-chunk
/// fallback: the `R50004` response code, known transient server message
/// patterns, or a fragment-count mismatch.
pub fn is_recoverable_batch_error(err: &anyhow::Error) -> bool {
    if let Some(genai) = err.downcast_ref::<GenAiError>() {
        match genai {
            GenAiError::ResponseFailed(code) if code == "R50004" => return true,
            GenAiError::CountMismatch { .. } => return true,
            _ => {}
        }
    }
    let rendered = format!("{err:#}");
    recoverable_patterns().iter().any(|re| re.is_match(&rendered))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn r50004_is_recoverable() {
        let err = anyhow::Error::new(GenAiError::ResponseFailed("R50004".into()));
        assert!(is_recoverable_batch_error(&err));
    }

    #[test]
    fn other_response_codes_are_not() {
        let err = anyhow::Error::new(GenAiError::ResponseFailed("R50001".into()));
        assert!(!is_recoverable_batch_error(&err));
    }

    #[test]
    fn count_mismatch_is_recoverable() {
        let err = anyhow::Error::new(GenAiError::CountMismatch {
            expected: 3,
            actual: 2,
        });
        assert!(is_recoverable_batch_error(&err));
    }

    #[test]
    fn token_pattern_matches_case_insensitively() {
        let err = anyhow::anyhow!("parse failed: unexpected TOKEN  200007 at offset 3");
        assert!(is_recoverable_batch_error(&err));
    }

    #[test]
    fn model_execution_pattern_matches() {
        let err = anyhow::anyhow!("upstream said: Model Execution Error (code 7)");
        assert!(is_recoverable_batch_error(&err));
    }

    #[test]
    fn unrelated_errors_are_terminal() {
        let err = anyhow::anyhow!("connection refused");
        assert!(!is_recoverable_batch_error(&err));
    }

    #[test]
    fn auth_statuses_invalidate_the_chat() {
        for status in [401u16, 403, 404, 410] {
            let err = GenAiError::Http {
                status,
                endpoint: "/api/chat/v1/messages".into(),
            };
            assert!(err.invalidates_chat(), "status {status}");
        }
        let err = GenAiError::Http {
            status: 500,
            endpoint: "/api/chat/v1/messages".into(),
        };
        assert!(!err.invalidates_chat());
    }
}
