// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Failures produced by the queue layers themselves (as opposed to errors
/// returned by the task thunks, which pass through untouched).
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("task timed out after {0}ms")]
    Timeout(u64),

    #[error("task cancelled: {0}")]
    Cancelled(String),

    #[error("batch response had {actual} fragments, expected {expected}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("queue shut down")]
    Shutdown,
}

/// Marker wrapper that tags an error as transient.
///
/// The scheduler retries a failed attempt only when the thunk's error
/// downcasts to `Retryable` (network flakes, 5xx responses, …) or was a
/// queue-level timeout. Terminal errors propagate to every attached waiter
/// unchanged.
#[derive(Debug)]
pub struct Retryable(pub anyhow::Error);

impl std::fmt::Display for Retryable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for Retryable {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Wrap `err` so the scheduler treats the failure as transient.
pub fn retryable(err: impl Into<anyhow::Error>) -> anyhow::Error {
    anyhow::Error::new(Retryable(err.into()))
}

/// Whether the scheduler should retry after this error.
///
/// Timeouts count as transient per the recovery policy; everything else must
/// opt in through the [`Retryable`] marker.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    if err.downcast_ref::<Retryable>().is_some() {
        return true;
    }
    matches!(err.downcast_ref::<QueueError>(), Some(QueueError::Timeout(_)))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_errors_are_terminal() {
        let err = anyhow::anyhow!("provider rejected the request");
        assert!(!is_retryable(&err));
    }

    #[test]
    fn wrapped_errors_are_transient() {
        let err = retryable(anyhow::anyhow!("connection reset"));
        assert!(is_retryable(&err));
    }

    #[test]
    fn timeouts_are_transient() {
        let err = anyhow::Error::new(QueueError::Timeout(500));
        assert!(is_retryable(&err));
    }

    #[test]
    fn cancellation_is_terminal() {
        let err = anyhow::Error::new(QueueError::Cancelled("tab closed".into()));
        assert!(!is_retryable(&err));
    }

    #[test]
    fn retryable_display_passes_through() {
        let err = retryable(anyhow::anyhow!("boom"));
        assert_eq!(err.to_string(), "boom");
    }
}
