use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use url::Url;

use crate::error::{ExtractionFailure, Result};
use crate::types::*;

// ============================================================================
// EXTRACTOR: page loading + field extraction (black box)
// ============================================================================

/// Given a URL and a timeout, returns extracted fields or a typed failure.
///
/// One call is one attempt. Implementations must not panic; every failure
/// mode surfaces as an `ExtractionFailure`.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        url: &Url,
        timeout: Duration,
    ) -> std::result::Result<FieldSet, ExtractionFailure>;
}

#[async_trait]
impl<T: Extractor + ?Sized> Extractor for std::sync::Arc<T> {
    async fn extract(
        &self,
        url: &Url,
        timeout: Duration,
    ) -> std::result::Result<FieldSet, ExtractionFailure> {
        (**self).extract(url, timeout).await
    }
}

// ============================================================================
// RESULT STORE: durable subscriptions, results and sessions
// ============================================================================

#[async_trait]
pub trait ResultStore: Send + Sync {
    // Subscriptions (operator configuration)

    /// Insert or update a subscription keyed by URL. Health state is kept.
    async fn upsert_subscription(&self, subscription: NewSubscription) -> Result<Subscription>;

    async fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>>;

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>>;

    async fn list_enabled_subscriptions(&self) -> Result<Vec<Subscription>>;

    /// Disabling is the only way a subscription stops being polled.
    async fn set_subscription_enabled(&self, id: SubscriptionId, enabled: bool) -> Result<()>;

    /// Stamp an attempt. Success resets the failure count, failure increments it.
    async fn update_subscription_attempt(
        &self,
        id: SubscriptionId,
        at: DateTime<Utc>,
        succeeded: bool,
    ) -> Result<()>;

    /// Subscriptions whose consecutive failures exceed `ceiling`.
    async fn list_flagged_subscriptions(&self, ceiling: u32) -> Result<Vec<Subscription>>;

    // Extraction results (append-only)

    async fn get_latest_successful_fingerprint(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<Fingerprint>>;

    async fn record_extraction_result(&self, result: &ExtractionResult) -> Result<()>;

    /// Append a result, recomputing `is_new` for successes against the latest
    /// successful fingerprint as one atomic step. Returns the stored result.
    ///
    /// Concurrent writers to the same subscription, in this process or
    /// another, never both record the same content as new.
    async fn record_detected_result(&self, result: ExtractionResult) -> Result<ExtractionResult>;

    async fn latest_result(&self, id: SubscriptionId) -> Result<Option<ExtractionResult>>;

    /// Most recent first.
    async fn list_results(&self, id: SubscriptionId, limit: usize)
        -> Result<Vec<ExtractionResult>>;

    // Sessions

    async fn create_session(&self, session: &ScrapeSession) -> Result<SessionId>;

    /// Seal a running session. Sealing an already sealed session is an error.
    async fn seal_session(
        &self,
        id: SessionId,
        status: SessionStatus,
        counts: SessionCounts,
        ended_at: DateTime<Utc>,
        notes: Option<String>,
    ) -> Result<()>;

    async fn get_session(&self, id: SessionId) -> Result<Option<ScrapeSession>>;

    /// Most recent first.
    async fn list_sessions(&self, limit: usize) -> Result<Vec<ScrapeSession>>;

    async fn latest_session(&self) -> Result<Option<ScrapeSession>> {
        Ok(self.list_sessions(1).await?.into_iter().next())
    }

    // Aggregates

    async fn stats(&self) -> Result<MonitorStats>;
}

#[async_trait]
impl<T: ResultStore + ?Sized> ResultStore for std::sync::Arc<T> {
    async fn upsert_subscription(&self, subscription: NewSubscription) -> Result<Subscription> {
        (**self).upsert_subscription(subscription).await
    }

    async fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        (**self).get_subscription(id).await
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        (**self).list_subscriptions().await
    }

    async fn list_enabled_subscriptions(&self) -> Result<Vec<Subscription>> {
        (**self).list_enabled_subscriptions().await
    }

    async fn set_subscription_enabled(&self, id: SubscriptionId, enabled: bool) -> Result<()> {
        (**self).set_subscription_enabled(id, enabled).await
    }

    async fn update_subscription_attempt(
        &self,
        id: SubscriptionId,
        at: DateTime<Utc>,
        succeeded: bool,
    ) -> Result<()> {
        (**self).update_subscription_attempt(id, at, succeeded).await
    }

    async fn list_flagged_subscriptions(&self, ceiling: u32) -> Result<Vec<Subscription>> {
        (**self).list_flagged_subscriptions(ceiling).await
    }

    async fn get_latest_successful_fingerprint(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<Fingerprint>> {
        (**self).get_latest_successful_fingerprint(id).await
    }

    async fn record_extraction_result(&self, result: &ExtractionResult) -> Result<()> {
        (**self).record_extraction_result(result).await
    }

    async fn record_detected_result(&self, result: ExtractionResult) -> Result<ExtractionResult> {
        (**self).record_detected_result(result).await
    }

    async fn latest_result(&self, id: SubscriptionId) -> Result<Option<ExtractionResult>> {
        (**self).latest_result(id).await
    }

    async fn list_results(
        &self,
        id: SubscriptionId,
        limit: usize,
    ) -> Result<Vec<ExtractionResult>> {
        (**self).list_results(id, limit).await
    }

    async fn create_session(&self, session: &ScrapeSession) -> Result<SessionId> {
        (**self).create_session(session).await
    }

    async fn seal_session(
        &self,
        id: SessionId,
        status: SessionStatus,
        counts: SessionCounts,
        ended_at: DateTime<Utc>,
        notes: Option<String>,
    ) -> Result<()> {
        (**self)
            .seal_session(id, status, counts, ended_at, notes)
            .await
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<ScrapeSession>> {
        (**self).get_session(id).await
    }

    async fn list_sessions(&self, limit: usize) -> Result<Vec<ScrapeSession>> {
        (**self).list_sessions(limit).await
    }

    async fn stats(&self) -> Result<MonitorStats> {
        (**self).stats().await
    }
}
