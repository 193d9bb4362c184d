//! In-memory result store for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::detector::is_new_content;
use crate::error::{MonitorError, Result};
use crate::traits::ResultStore;
use crate::types::*;

/// In-memory storage for subscriptions, results, and sessions.
///
/// Not suitable for production as data is lost on restart. Each collection
/// sits behind its own lock so writes to one key never wait on a reader of
/// another collection.
#[derive(Default)]
pub struct MemoryStore {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    /// Append-only, in recording order
    results: RwLock<Vec<ExtractionResult>>,
    /// Creation order, for most-recent-first listing
    sessions: RwLock<Vec<ScrapeSession>>,
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|e| MonitorError::store(format!("memory store lock poisoned: {}", e)))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|e| MonitorError::store(format!("memory store lock poisoned: {}", e)))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded extraction results.
    pub fn result_count(&self) -> usize {
        self.results.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Every recorded result for a subscription, oldest first.
    pub fn results_for(&self, id: SubscriptionId) -> Vec<ExtractionResult> {
        self.results
            .read()
            .map(|results| {
                results
                    .iter()
                    .filter(|r| r.subscription_id == id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn upsert_subscription(&self, new: NewSubscription) -> Result<Subscription> {
        let mut subscriptions = write(&self.subscriptions)?;

        if let Some(existing) = subscriptions.values_mut().find(|s| s.url == new.url) {
            existing.label = new.label;
            existing.poll_interval_secs = new.poll_interval_secs;
            return Ok(existing.clone());
        }

        let subscription = Subscription::new(new.url, new.label, new.poll_interval_secs);
        subscriptions.insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    async fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        Ok(read(&self.subscriptions)?.get(&id).cloned())
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let mut subscriptions: Vec<_> = read(&self.subscriptions)?.values().cloned().collect();
        subscriptions.sort_by_key(|s| s.created_at);
        Ok(subscriptions)
    }

    async fn list_enabled_subscriptions(&self) -> Result<Vec<Subscription>> {
        Ok(self
            .list_subscriptions()
            .await?
            .into_iter()
            .filter(|s| s.enabled)
            .collect())
    }

    async fn set_subscription_enabled(&self, id: SubscriptionId, enabled: bool) -> Result<()> {
        let mut subscriptions = write(&self.subscriptions)?;
        let subscription = subscriptions
            .get_mut(&id)
            .ok_or(MonitorError::UnknownSubscription(id))?;
        subscription.enabled = enabled;
        Ok(())
    }

    async fn update_subscription_attempt(
        &self,
        id: SubscriptionId,
        at: DateTime<Utc>,
        succeeded: bool,
    ) -> Result<()> {
        let mut subscriptions = write(&self.subscriptions)?;
        let subscription = subscriptions
            .get_mut(&id)
            .ok_or(MonitorError::UnknownSubscription(id))?;

        subscription.last_attempted_at = Some(at);
        if succeeded {
            subscription.last_succeeded_at = Some(at);
            subscription.consecutive_failures = 0;
        } else {
            subscription.consecutive_failures += 1;
        }
        Ok(())
    }

    async fn list_flagged_subscriptions(&self, ceiling: u32) -> Result<Vec<Subscription>> {
        let mut flagged: Vec<_> = read(&self.subscriptions)?
            .values()
            .filter(|s| s.is_flagged(ceiling))
            .cloned()
            .collect();
        flagged.sort_by(|a, b| b.consecutive_failures.cmp(&a.consecutive_failures));
        Ok(flagged)
    }

    async fn get_latest_successful_fingerprint(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<Fingerprint>> {
        Ok(read(&self.results)?
            .iter()
            .rev()
            .find(|r| r.subscription_id == id && r.is_success())
            .and_then(|r| r.fingerprint.clone()))
    }

    async fn record_extraction_result(&self, result: &ExtractionResult) -> Result<()> {
        if !read(&self.subscriptions)?.contains_key(&result.subscription_id) {
            return Err(MonitorError::UnknownSubscription(result.subscription_id));
        }
        write(&self.results)?.push(result.clone());
        Ok(())
    }

    async fn record_detected_result(
        &self,
        mut result: ExtractionResult,
    ) -> Result<ExtractionResult> {
        if !read(&self.subscriptions)?.contains_key(&result.subscription_id) {
            return Err(MonitorError::UnknownSubscription(result.subscription_id));
        }

        // Lookup and append under one write lock
        let mut results = write(&self.results)?;
        result.is_new = match result.fingerprint.as_ref().filter(|_| result.is_success()) {
            Some(fingerprint) => {
                let prior = results
                    .iter()
                    .rev()
                    .find(|r| r.subscription_id == result.subscription_id && r.is_success())
                    .and_then(|r| r.fingerprint.as_ref());
                is_new_content(fingerprint, prior)
            }
            None => false,
        };
        results.push(result.clone());
        Ok(result)
    }

    async fn latest_result(&self, id: SubscriptionId) -> Result<Option<ExtractionResult>> {
        Ok(read(&self.results)?
            .iter()
            .rev()
            .find(|r| r.subscription_id == id)
            .cloned())
    }

    async fn list_results(
        &self,
        id: SubscriptionId,
        limit: usize,
    ) -> Result<Vec<ExtractionResult>> {
        Ok(read(&self.results)?
            .iter()
            .rev()
            .filter(|r| r.subscription_id == id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn create_session(&self, session: &ScrapeSession) -> Result<SessionId> {
        write(&self.sessions)?.push(session.clone());
        Ok(session.id)
    }

    async fn seal_session(
        &self,
        id: SessionId,
        status: SessionStatus,
        counts: SessionCounts,
        ended_at: DateTime<Utc>,
        notes: Option<String>,
    ) -> Result<()> {
        let mut sessions = write(&self.sessions)?;
        let session = sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(MonitorError::UnknownSession(id))?;

        if session.status.is_sealed() {
            return Err(MonitorError::SessionSealed { session_id: id });
        }

        session.status = status;
        session.counts = counts;
        session.ended_at = Some(ended_at);
        session.notes = notes;
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<ScrapeSession>> {
        Ok(read(&self.sessions)?.iter().find(|s| s.id == id).cloned())
    }

    async fn list_sessions(&self, limit: usize) -> Result<Vec<ScrapeSession>> {
        Ok(read(&self.sessions)?
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<MonitorStats> {
        let subscriptions = read(&self.subscriptions)?;
        let results = read(&self.results)?;
        let sessions = read(&self.sessions)?;

        Ok(MonitorStats {
            total_subscriptions: subscriptions.len() as u64,
            enabled_subscriptions: subscriptions.values().filter(|s| s.enabled).count() as u64,
            total_results: results.len() as u64,
            new_content_results: results.iter().filter(|r| r.is_new).count() as u64,
            total_sessions: sessions.len() as u64,
            last_visit_at: results.iter().map(|r| r.visited_at).max(),
        })
    }
}
