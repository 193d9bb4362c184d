//! Scrape scheduler: due selection and bounded, fault-tolerant dispatch.
//!
//! One run dispatches each due subscription at most once. A dispatched task
//! holds its concurrency permit across every retry, so retries never widen
//! the pool. Per-task retry state lives in a `TaskArena` keyed by
//! subscription id, and the fingerprint lookup-then-write sequence is
//! serialized per subscription through `SubscriptionLocks`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::detector::ChangeDetector;
use crate::error::{ExtractionFailure, FailureKind, MonitorError, Result};
use crate::progress::ProgressReporter;
use crate::session::{Outcome, SessionTracker};
use crate::traits::{Extractor, ResultStore};
use crate::types::*;

// ============================================================================
// DUE SELECTION
// ============================================================================

/// Enabled subscriptions whose polling interval has elapsed, oldest attempt
/// first. Never-attempted subscriptions lead; ties break on id.
pub fn select_due(subscriptions: &[Subscription], now: DateTime<Utc>) -> Vec<Subscription> {
    let mut seen = HashSet::new();
    let mut due: Vec<Subscription> = subscriptions
        .iter()
        .filter(|s| s.enabled && s.is_due(now))
        .filter(|s| seen.insert(s.id))
        .cloned()
        .collect();

    due.sort_by(|a, b| {
        a.last_attempted_at
            .cmp(&b.last_attempted_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    due
}

// ============================================================================
// RETRY POLICY
// ============================================================================

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total extractor calls per task, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after the given failed attempt (1-based): min(base * 2^(n-1), max).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

// ============================================================================
// TASK ARENA
// ============================================================================

/// Retry state of one in-flight task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskState {
    pub attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_failure: Option<ExtractionFailure>,
}

/// In-flight task state indexed by subscription id.
#[derive(Debug, Default)]
pub struct TaskArena {
    tasks: Mutex<HashMap<SubscriptionId, TaskState>>,
}

impl TaskArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<SubscriptionId, TaskState>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the next attempt and return its 1-based number.
    pub fn begin_attempt(&self, id: SubscriptionId) -> u32 {
        let mut tasks = self.tasks();
        let state = tasks.entry(id).or_default();
        state.attempts += 1;
        state.next_retry_at = None;
        state.attempts
    }

    pub fn record_failure(
        &self,
        id: SubscriptionId,
        failure: ExtractionFailure,
        next_retry_at: Option<DateTime<Utc>>,
    ) {
        let mut tasks = self.tasks();
        let state = tasks.entry(id).or_default();
        state.last_failure = Some(failure);
        state.next_retry_at = next_retry_at;
    }

    pub fn get(&self, id: SubscriptionId) -> Option<TaskState> {
        self.tasks().get(&id).cloned()
    }

    /// Remove the task once its outcome is final.
    pub fn finish(&self, id: SubscriptionId) -> Option<TaskState> {
        self.tasks().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks().is_empty()
    }
}

// ============================================================================
// PER-SUBSCRIPTION LOCKS
// ============================================================================

type LockTable = Arc<Mutex<HashMap<SubscriptionId, Arc<tokio::sync::Mutex<()>>>>>;

/// Keyed async mutexes. Cloning shares the same lock table.
///
/// An entry lives only while someone holds or waits on it.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionLocks {
    locks: LockTable,
}

impl SubscriptionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, id: SubscriptionId) -> SubscriptionGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(id).or_default().clone()
        };
        SubscriptionGuard {
            id,
            guard: Some(lock.lock_owned().await),
            locks: self.locks.clone(),
        }
    }

    /// Number of subscriptions currently held or waited on.
    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held lock on one subscription; evicts its table entry on release when no
/// other task is waiting for it.
#[derive(Debug)]
pub struct SubscriptionGuard {
    id: SubscriptionId,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockTable,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Waiters clone the Arc under the table lock, so a count of one
        // means only the table still refers to it
        if locks
            .get(&self.id)
            .map_or(false, |lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.id);
        }
    }
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// What one call to `Scheduler::run` did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub dispatched: u32,
    /// Due subscriptions never dispatched because the run stopped early
    pub undispatched: u32,
    pub cancelled: bool,
    pub new_content: Vec<SubscriptionId>,
    /// Subscriptions over the failure ceiling after this run's visit
    pub flagged: Vec<SubscriptionId>,
}

struct VisitOutput {
    result: ExtractionResult,
    flagged: bool,
}

type Joined = std::result::Result<(Subscription, Result<VisitOutput>), JoinError>;

/// Shared by every task of one run.
struct Worker<S, E> {
    store: Arc<S>,
    extractor: Arc<E>,
    detector: ChangeDetector,
    item_timeout: Duration,
    retry: RetryPolicy,
    failure_ceiling: u32,
    locks: SubscriptionLocks,
    arena: TaskArena,
    session_id: SessionId,
    stop: CancellationToken,
}

impl<S: ResultStore, E: Extractor> Worker<S, E> {
    async fn visit(&self, subscription: &Subscription) -> Result<VisitOutput> {
        let id = subscription.id;
        let extracted = self.extract_with_retry(subscription).await;
        let attempts = self.arena.finish(id).map_or(1, |state| state.attempts);

        let _guard = self.locks.lock(id).await;

        let result = match extracted {
            Ok(fields) => {
                let prior = self.store.get_latest_successful_fingerprint(id).await?;
                let detection = self.detector.classify(&fields, prior.as_ref());
                ExtractionResult::success(
                    id,
                    self.session_id,
                    fields,
                    detection.fingerprint,
                    detection.is_new,
                    attempts,
                )
            }
            Err(failure) => {
                let status = match failure.kind() {
                    FailureKind::Timeout => ExtractionStatus::Timeout,
                    FailureKind::Network | FailureKind::Parse => ExtractionStatus::Failure,
                };
                ExtractionResult::failed(id, self.session_id, status, failure.to_string(), attempts)
            }
        };

        // The store re-checks novelty atomically against other writers
        let classified_new = result.is_new;
        let result = self.store.record_detected_result(result).await?;
        if result.is_new != classified_new {
            debug!(
                subscription_id = %id,
                is_new = result.is_new,
                "Novelty changed by a concurrent writer"
            );
        }

        self.store
            .update_subscription_attempt(id, result.visited_at, result.is_success())
            .await?;

        let flagged = !result.is_success()
            && self
                .store
                .get_subscription(id)
                .await?
                .map_or(false, |s| s.is_flagged(self.failure_ceiling));

        Ok(VisitOutput { result, flagged })
    }

    async fn extract_with_retry(
        &self,
        subscription: &Subscription,
    ) -> std::result::Result<FieldSet, ExtractionFailure> {
        let id = subscription.id;

        loop {
            let attempt = self.arena.begin_attempt(id);
            debug!(subscription_id = %id, url = %subscription.url, attempt, "Extracting");

            let call = self.extractor.extract(&subscription.url, self.item_timeout);
            let failure = match tokio::time::timeout(self.item_timeout, call).await {
                Ok(Ok(fields)) => return Ok(fields),
                Ok(Err(failure)) => failure,
                Err(_) => ExtractionFailure::Timeout(format!(
                    "no result within {}ms",
                    self.item_timeout.as_millis()
                )),
            };

            if !self.retry.should_retry(attempt) || self.stop.is_cancelled() {
                warn!(
                    subscription_id = %id,
                    url = %subscription.url,
                    attempts = attempt,
                    error = %failure,
                    "Extraction failed"
                );
                self.arena.record_failure(id, failure.clone(), None);
                return Err(failure);
            }

            let delay = self.retry.delay_for(attempt);
            let next_retry_at =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            warn!(
                subscription_id = %id,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %failure,
                "Extraction attempt failed, retrying"
            );
            self.arena.record_failure(id, failure.clone(), Some(next_retry_at));

            tokio::select! {
                _ = self.stop.cancelled() => {
                    debug!(subscription_id = %id, "Run stopping, abandoning retries");
                    return Err(failure);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Drives extraction for one run at a time.
pub struct Scheduler<S, E> {
    store: Arc<S>,
    extractor: Arc<E>,
    detector: ChangeDetector,
    config: SchedulerConfig,
    locks: SubscriptionLocks,
    progress: Arc<ProgressReporter>,
}

impl<S, E> Scheduler<S, E>
where
    S: ResultStore + 'static,
    E: Extractor + 'static,
{
    pub fn new(store: Arc<S>, extractor: Arc<E>, config: SchedulerConfig) -> Self {
        Self {
            store,
            extractor,
            detector: ChangeDetector::default(),
            config,
            locks: SubscriptionLocks::new(),
            progress: Arc::new(ProgressReporter::new()),
        }
    }

    pub fn with_detector(mut self, detector: ChangeDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_locks(mut self, locks: SubscriptionLocks) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_progress(mut self, progress: Arc<ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Visit every subscription in `due` under the concurrency limit and
    /// report each outcome to `session`.
    ///
    /// Cancellation stops dispatch and pending retries; attempts already
    /// running finish or time out and are still recorded. A store failure
    /// stops dispatch the same way, drains in-flight tasks, and is returned.
    pub async fn run(
        &self,
        session: &mut SessionTracker<S>,
        due: Vec<Subscription>,
        cancel: &CancellationToken,
    ) -> Result<RunSummary> {
        self.config.validate()?;

        let total = due.len() as u32;
        let stop = cancel.child_token();
        let worker = Arc::new(Worker {
            store: self.store.clone(),
            extractor: self.extractor.clone(),
            detector: self.detector.clone(),
            item_timeout: self.config.item_timeout,
            retry: self.config.retry,
            failure_ceiling: self.config.failure_ceiling,
            locks: self.locks.clone(),
            arena: TaskArena::new(),
            session_id: session.id(),
            stop: stop.clone(),
        });

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut workers: JoinSet<(Subscription, Result<VisitOutput>)> = JoinSet::new();
        let mut dispatched_ids = HashSet::new();
        let mut pending = due.into_iter();
        let mut next = pending.next();
        let mut summary = RunSummary::default();
        let mut first_error: Option<MonitorError> = None;

        self.progress.start(total);
        info!(
            session_id = %session.id(),
            due = total,
            concurrency = self.config.concurrency,
            "Dispatching scrape tasks"
        );

        loop {
            tokio::select! {
                biased;

                _ = stop.cancelled(), if next.is_some() => {
                    let remaining = 1 + pending.len() as u32;
                    info!(remaining, "Dispatch stopped, leaving subscriptions unvisited");
                    summary.undispatched += remaining;
                    next = None;
                }

                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(err) = self.settle(joined, session, &mut summary) {
                        error!(session_id = %session.id(), error = %err, "Run failed, stopping dispatch");
                        first_error.get_or_insert(err);
                        stop.cancel();
                    }
                }

                permit = semaphore.clone().acquire_owned(), if next.is_some() => {
                    let Ok(permit) = permit else {
                        stop.cancel();
                        continue;
                    };
                    let Some(subscription) = next.take() else {
                        continue;
                    };
                    next = pending.next();

                    if !dispatched_ids.insert(subscription.id) {
                        warn!(subscription_id = %subscription.id, "Subscription listed twice, skipping");
                        continue;
                    }

                    self.progress.item_started(&subscription.label);
                    summary.dispatched += 1;

                    let worker = worker.clone();
                    workers.spawn(async move {
                        let _permit = permit;
                        let output = worker.visit(&subscription).await;
                        (subscription, output)
                    });
                }

                else => break,
            }
        }

        summary.cancelled = cancel.is_cancelled();

        match first_error {
            Some(err) => {
                self.progress.finish(format!("Run aborted: {}", err));
                Err(err)
            }
            None => {
                self.progress.finish(if summary.cancelled {
                    "Run cancelled"
                } else {
                    "Run completed"
                });
                Ok(summary)
            }
        }
    }

    fn settle(
        &self,
        joined: Joined,
        session: &mut SessionTracker<S>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let (subscription, output) = joined.map_err(|e| MonitorError::Worker(e.to_string()))?;

        let output = match output {
            Ok(output) => output,
            Err(err) => {
                self.progress.item_finished(&subscription.label, false);
                return Err(err);
            }
        };
        let result = &output.result;

        session.record_outcome(subscription.id, Outcome::from(result))?;
        self.progress
            .item_finished(&subscription.label, result.is_success());

        if result.is_new {
            summary.new_content.push(subscription.id);
        }
        if output.flagged {
            warn!(
                subscription_id = %subscription.id,
                url = %subscription.url,
                ceiling = self.config.failure_ceiling,
                "Subscription exceeded failure ceiling"
            );
            summary.flagged.push(subscription.id);
        }

        debug!(
            subscription_id = %subscription.id,
            status = result.status.as_str(),
            is_new = result.is_new,
            attempts = result.attempts,
            "Recorded outcome"
        );
        Ok(())
    }
}
