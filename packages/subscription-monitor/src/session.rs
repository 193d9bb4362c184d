//! Session tracking: one orchestration run as an auditable unit.
//!
//! A `SessionTracker` is the explicit run value threaded through the
//! scheduler. It owns the in-progress counters; the store only sees the
//! session twice, once when it is opened and once when it is sealed.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{MonitorError, Result};
use crate::traits::ResultStore;
use crate::types::*;

/// Per-item outcome reported by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded { is_new: bool },
    Failed,
}

impl From<&ExtractionResult> for Outcome {
    fn from(result: &ExtractionResult) -> Self {
        if result.is_success() {
            Outcome::Succeeded {
                is_new: result.is_new,
            }
        } else {
            Outcome::Failed
        }
    }
}

/// Why a session is being closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The scheduler drained every dispatched item
    Finished,
    /// External cancellation stopped dispatch
    Cancelled,
    /// A run-level error aborted the run
    Failed(String),
}

pub struct SessionTracker<S: ResultStore> {
    store: Arc<S>,
    session: ScrapeSession,
    reported: HashSet<SubscriptionId>,
}

impl<S: ResultStore> SessionTracker<S> {
    /// Create the session row with status `running`.
    pub async fn open(store: Arc<S>, planned: u32) -> Result<Self> {
        let session = ScrapeSession::open(planned);
        store.create_session(&session).await?;

        info!(session_id = %session.id, planned, "Opened scrape session");

        Ok(Self {
            store,
            session,
            reported: HashSet::new(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.session.id
    }

    pub fn planned(&self) -> u32 {
        self.session.planned
    }

    pub fn counts(&self) -> SessionCounts {
        self.session.counts
    }

    /// True once every planned item has reported.
    pub fn is_settled(&self) -> bool {
        self.session.counts.attempted >= self.session.planned
    }

    /// Count one completed item. Reporting the same subscription twice is a
    /// programming error.
    pub fn record_outcome(&mut self, subscription_id: SubscriptionId, outcome: Outcome) -> Result<()> {
        if !self.reported.insert(subscription_id) {
            return Err(MonitorError::DuplicateOutcome { subscription_id });
        }

        let counts = &mut self.session.counts;
        counts.attempted += 1;
        match outcome {
            Outcome::Succeeded { is_new } => {
                counts.succeeded += 1;
                if is_new {
                    counts.new_content += 1;
                }
            }
            Outcome::Failed => counts.failed += 1,
        }

        Ok(())
    }

    /// Seal the session and return its final state.
    ///
    /// `Finished` only yields `completed` when every planned item reported;
    /// anything else seals as `aborted` with the partial counts kept.
    pub async fn close(self, reason: CloseReason) -> Result<ScrapeSession> {
        let SessionTracker {
            store, mut session, ..
        } = self;
        let counts = session.counts;

        let (status, notes) = match reason {
            CloseReason::Finished if counts.attempted >= session.planned => (
                SessionStatus::Completed,
                format!(
                    "{} succeeded, {} failed, {} with new content",
                    counts.succeeded, counts.failed, counts.new_content
                ),
            ),
            CloseReason::Finished => (
                SessionStatus::Aborted,
                format!(
                    "{} of {} items outstanding",
                    session.planned - counts.attempted,
                    session.planned
                ),
            ),
            CloseReason::Cancelled => (
                SessionStatus::Aborted,
                format!(
                    "cancelled after {} of {} items",
                    counts.attempted, session.planned
                ),
            ),
            CloseReason::Failed(message) => (SessionStatus::Aborted, format!("aborted: {}", message)),
        };

        let ended_at = Utc::now();
        store
            .seal_session(session.id, status, counts, ended_at, Some(notes.clone()))
            .await?;

        session.status = status;
        session.ended_at = Some(ended_at);
        session.notes = Some(notes);

        match status {
            SessionStatus::Completed => info!(
                session_id = %session.id,
                attempted = counts.attempted,
                succeeded = counts.succeeded,
                failed = counts.failed,
                new_content = counts.new_content,
                "Sealed scrape session"
            ),
            _ => warn!(
                session_id = %session.id,
                status = status.as_str(),
                attempted = counts.attempted,
                planned = session.planned,
                notes = session.notes.as_deref().unwrap_or_default(),
                "Sealed scrape session"
            ),
        }

        Ok(session)
    }
}
