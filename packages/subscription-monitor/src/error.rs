//! Typed errors for the subscription monitor.
//!
//! Uses `thiserror` for library errors (not `anyhow`). Two families:
//! - `ExtractionFailure`: per-item, recoverable via retry, never escapes a run
//! - `MonitorError`: run-level errors surfaced to the caller

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{SessionId, SubscriptionId};

/// Failure reported by an extractor for a single visit.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionFailure {
    /// The page did not produce a result within the per-item timeout
    #[error("extraction timed out: {0}")]
    Timeout(String),

    /// Transport or HTTP level failure
    #[error("network error: {0}")]
    Network(String),

    /// The page loaded but fields could not be extracted
    #[error("parse error: {0}")]
    Parse(String),
}

/// Coarse classification of an `ExtractionFailure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Network,
    Parse,
}

impl ExtractionFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            ExtractionFailure::Timeout(_) => FailureKind::Timeout,
            ExtractionFailure::Network(_) => FailureKind::Network,
            ExtractionFailure::Parse(_) => FailureKind::Parse,
        }
    }
}

/// Errors that abort a run or indicate misuse of the API.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Storage backend failed; the active run cannot continue
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// An outcome was recorded twice for the same subscription in one session
    #[error("outcome already recorded for subscription {subscription_id}")]
    DuplicateOutcome { subscription_id: SubscriptionId },

    /// A sealed session was written to
    #[error("session {session_id} is sealed")]
    SessionSealed { session_id: SessionId },

    /// Referenced subscription does not exist
    #[error("unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),

    /// Referenced session does not exist
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    /// A worker task panicked or was aborted
    #[error("worker task failed: {0}")]
    Worker(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),
}

impl MonitorError {
    /// Wrap any backend error as `StoreUnavailable`.
    pub fn store(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        MonitorError::StoreUnavailable(err.into())
    }

    /// Programming errors are fatal and never recovered.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            MonitorError::DuplicateOutcome { .. } | MonitorError::SessionSealed { .. }
        )
    }
}

impl From<sqlx::Error> for MonitorError {
    fn from(err: sqlx::Error) -> Self {
        MonitorError::StoreUnavailable(Box::new(err))
    }
}

/// Result type alias for monitor operations.
pub type Result<T> = std::result::Result<T, MonitorError>;
