//! Entry point tying the store, the extractor and the scheduler together.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::SchedulerConfig;
use crate::detector::ChangeDetector;
use crate::error::Result;
use crate::progress::{ProgressReporter, RunProgress};
use crate::scheduler::{select_due, RunSummary, Scheduler};
use crate::session::{CloseReason, SessionTracker};
use crate::traits::{Extractor, ResultStore};
use crate::types::*;

/// Outcome of `Monitor::run_once`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunReport {
    /// No enabled subscription was due; no session was opened
    NothingDue { enabled: usize },
    Finished {
        session: ScrapeSession,
        summary: RunSummary,
    },
}

impl RunReport {
    /// Process exit status: 0 completed, 1 aborted, 2 nothing due or enabled.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunReport::NothingDue { .. } => 2,
            RunReport::Finished { session, .. } => match session.status {
                SessionStatus::Completed => 0,
                SessionStatus::Running | SessionStatus::Aborted => 1,
            },
        }
    }

    pub fn session(&self) -> Option<&ScrapeSession> {
        match self {
            RunReport::NothingDue { .. } => None,
            RunReport::Finished { session, .. } => Some(session),
        }
    }
}

pub struct Monitor<S, E> {
    store: Arc<S>,
    scheduler: Scheduler<S, E>,
    progress: Arc<ProgressReporter>,
    failure_ceiling: u32,
}

impl<S, E> Monitor<S, E>
where
    S: ResultStore + 'static,
    E: Extractor + 'static,
{
    pub fn new(store: S, extractor: E, config: SchedulerConfig) -> Self {
        Self::from_shared(Arc::new(store), Arc::new(extractor), config)
    }

    pub fn from_shared(store: Arc<S>, extractor: Arc<E>, config: SchedulerConfig) -> Self {
        let progress = Arc::new(ProgressReporter::new());
        let failure_ceiling = config.failure_ceiling;
        let scheduler =
            Scheduler::new(store.clone(), extractor, config).with_progress(progress.clone());

        Self {
            store,
            scheduler,
            progress,
            failure_ceiling,
        }
    }

    pub fn with_detector(mut self, detector: ChangeDetector) -> Self {
        self.scheduler = self.scheduler.with_detector(detector);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        self.scheduler.config()
    }

    /// Run one session over every due subscription.
    ///
    /// Store failures abort the run: the session is sealed `aborted` when the
    /// store still accepts the seal, and the error is returned.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<RunReport> {
        let enabled = self.store.list_enabled_subscriptions().await?;
        let due = select_due(&enabled, Utc::now());

        if due.is_empty() {
            info!(enabled = enabled.len(), "No subscriptions due");
            self.progress.finish("Nothing due");
            return Ok(RunReport::NothingDue {
                enabled: enabled.len(),
            });
        }

        let mut tracker = SessionTracker::open(self.store.clone(), due.len() as u32).await?;

        match self.scheduler.run(&mut tracker, due, cancel).await {
            Ok(summary) => {
                let reason = if summary.cancelled {
                    CloseReason::Cancelled
                } else {
                    CloseReason::Finished
                };
                let session = tracker.close(reason).await?;
                Ok(RunReport::Finished { session, summary })
            }
            Err(err) => {
                let session_id = tracker.id();
                if let Err(seal_err) = tracker.close(CloseReason::Failed(err.to_string())).await {
                    error!(session_id = %session_id, error = %seal_err, "Failed to seal aborted session");
                }
                Err(err)
            }
        }
    }

    // Operator configuration

    pub async fn upsert_subscription(&self, subscription: NewSubscription) -> Result<Subscription> {
        self.store.upsert_subscription(subscription).await
    }

    /// Upsert every entry, returning the stored subscriptions in input order.
    pub async fn sync_subscriptions(
        &self,
        subscriptions: Vec<NewSubscription>,
    ) -> Result<Vec<Subscription>> {
        let mut stored = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            stored.push(self.store.upsert_subscription(subscription).await?);
        }
        info!(count = stored.len(), "Synced subscriptions");
        Ok(stored)
    }

    pub async fn set_enabled(&self, id: SubscriptionId, enabled: bool) -> Result<()> {
        self.store.set_subscription_enabled(id, enabled).await
    }

    // Read-only queries

    pub async fn subscriptions(&self) -> Result<Vec<Subscription>> {
        self.store.list_subscriptions().await
    }

    pub async fn last_session(&self) -> Result<Option<ScrapeSession>> {
        self.store.latest_session().await
    }

    pub async fn sessions(&self, limit: usize) -> Result<Vec<ScrapeSession>> {
        self.store.list_sessions(limit).await
    }

    pub async fn session(&self, id: SessionId) -> Result<Option<ScrapeSession>> {
        self.store.get_session(id).await
    }

    pub async fn latest_result(&self, id: SubscriptionId) -> Result<Option<ExtractionResult>> {
        self.store.latest_result(id).await
    }

    pub async fn results(&self, id: SubscriptionId, limit: usize) -> Result<Vec<ExtractionResult>> {
        self.store.list_results(id, limit).await
    }

    pub async fn stats(&self) -> Result<MonitorStats> {
        self.store.stats().await
    }

    /// Subscriptions over the configured failure ceiling.
    pub async fn flagged(&self) -> Result<Vec<Subscription>> {
        self.store.list_flagged_subscriptions(self.failure_ceiling).await
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<RunProgress> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> RunProgress {
        self.progress.snapshot()
    }
}
