//! Testing utilities including mock implementations.
//!
//! Useful for exercising the scheduler and the monitor without network
//! access: `MockExtractor` replays scripted outcomes per URL and records
//! every call, `FlakyStore` wraps a real store and can be switched offline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use url::Url;

use crate::error::{ExtractionFailure, MonitorError, Result};
use crate::traits::{Extractor, ResultStore};
use crate::types::*;

/// One scripted extractor response.
#[derive(Debug, Clone)]
pub enum MockResponse {
    Fields(FieldSet),
    Failure(ExtractionFailure),
    /// Wait, then behave like the inner response
    Delayed(Duration, Box<MockResponse>),
    /// Never resolve; only the caller's timeout ends the call
    Hang,
}

impl MockResponse {
    pub fn fields<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<FieldValue>,
    {
        MockResponse::Fields(pairs.into_iter().collect())
    }

    pub fn timeout() -> Self {
        MockResponse::Failure(ExtractionFailure::Timeout("mock timeout".into()))
    }

    pub fn network() -> Self {
        MockResponse::Failure(ExtractionFailure::Network("mock connection refused".into()))
    }

    pub fn after(self, delay: Duration) -> Self {
        MockResponse::Delayed(delay, Box::new(self))
    }
}

/// A mock extractor with per-URL scripts.
///
/// Each URL has a queue of responses consumed one per call; once a queue
/// runs dry its last response repeats. URLs without a script get
/// `{"title": <url>}`.
#[derive(Default)]
pub struct MockExtractor {
    scripts: RwLock<HashMap<String, VecDeque<MockResponse>>>,
    last: RwLock<HashMap<String, MockResponse>>,
    calls: RwLock<Vec<Url>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue responses for a URL, consumed in order.
    pub fn with_script(self, url: &Url, responses: Vec<MockResponse>) -> Self {
        self.scripts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string(), responses.into());
        self
    }

    /// Respond the same way to every call for a URL.
    pub fn with_response(self, url: &Url, response: MockResponse) -> Self {
        self.with_script(url, vec![response])
    }

    /// Every call made so far, in call order.
    pub fn calls(&self) -> Vec<Url> {
        self.calls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self, url: &Url) -> usize {
        self.calls().iter().filter(|u| *u == url).count()
    }

    /// Calls currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_response(&self, url: &Url) -> MockResponse {
        let key = url.to_string();
        let mut scripts = self.scripts.write().unwrap_or_else(PoisonError::into_inner);
        let mut last = self.last.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(response) = scripts.get_mut(&key).and_then(VecDeque::pop_front) {
            last.insert(key, response.clone());
            return response;
        }

        last.get(&key)
            .cloned()
            .unwrap_or_else(|| MockResponse::fields([("title", url.as_str())]))
    }
}

/// Decrements the in-flight counter even when the call is dropped by a timeout.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn respond(response: MockResponse) -> std::result::Result<FieldSet, ExtractionFailure> {
    let mut response = response;
    loop {
        match response {
            MockResponse::Fields(fields) => return Ok(fields),
            MockResponse::Failure(failure) => return Err(failure),
            MockResponse::Delayed(delay, inner) => {
                tokio::time::sleep(delay).await;
                response = *inner;
            }
            MockResponse::Hang => std::future::pending::<()>().await,
        }
    }
}

#[async_trait]
impl Extractor for MockExtractor {
    async fn extract(
        &self,
        url: &Url,
        _timeout: Duration,
    ) -> std::result::Result<FieldSet, ExtractionFailure> {
        self.calls
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let response = self.next_response(url);
        respond(response).await
    }
}

/// Store wrapper whose writes can be switched off to simulate an outage.
pub struct FlakyStore<S> {
    inner: S,
    offline: AtomicBool,
    /// Result writes allowed before going offline automatically
    writes_before_outage: Option<AtomicUsize>,
}

impl<S: ResultStore> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            offline: AtomicBool::new(false),
            writes_before_outage: None,
        }
    }

    /// Go offline after `count` successful result writes.
    pub fn fail_after(mut self, count: usize) -> Self {
        self.writes_before_outage = Some(AtomicUsize::new(count));
        self
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn check(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(MonitorError::store("store offline"));
        }
        Ok(())
    }

    fn check_result_write(&self) -> Result<()> {
        self.check()?;
        if let Some(remaining) = &self.writes_before_outage {
            let allowed = remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !allowed {
                self.set_offline(true);
                return Err(MonitorError::store("store offline"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S: ResultStore> ResultStore for FlakyStore<S> {
    async fn upsert_subscription(&self, subscription: NewSubscription) -> Result<Subscription> {
        self.check()?;
        self.inner.upsert_subscription(subscription).await
    }

    async fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        self.check()?;
        self.inner.get_subscription(id).await
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        self.check()?;
        self.inner.list_subscriptions().await
    }

    async fn list_enabled_subscriptions(&self) -> Result<Vec<Subscription>> {
        self.check()?;
        self.inner.list_enabled_subscriptions().await
    }

    async fn set_subscription_enabled(&self, id: SubscriptionId, enabled: bool) -> Result<()> {
        self.check()?;
        self.inner.set_subscription_enabled(id, enabled).await
    }

    async fn update_subscription_attempt(
        &self,
        id: SubscriptionId,
        at: DateTime<Utc>,
        succeeded: bool,
    ) -> Result<()> {
        self.check()?;
        self.inner.update_subscription_attempt(id, at, succeeded).await
    }

    async fn list_flagged_subscriptions(&self, ceiling: u32) -> Result<Vec<Subscription>> {
        self.check()?;
        self.inner.list_flagged_subscriptions(ceiling).await
    }

    async fn get_latest_successful_fingerprint(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<Fingerprint>> {
        self.check()?;
        self.inner.get_latest_successful_fingerprint(id).await
    }

    async fn record_extraction_result(&self, result: &ExtractionResult) -> Result<()> {
        self.check_result_write()?;
        self.inner.record_extraction_result(result).await
    }

    async fn record_detected_result(&self, result: ExtractionResult) -> Result<ExtractionResult> {
        self.check_result_write()?;
        self.inner.record_detected_result(result).await
    }

    async fn latest_result(&self, id: SubscriptionId) -> Result<Option<ExtractionResult>> {
        self.check()?;
        self.inner.latest_result(id).await
    }

    async fn list_results(
        &self,
        id: SubscriptionId,
        limit: usize,
    ) -> Result<Vec<ExtractionResult>> {
        self.check()?;
        self.inner.list_results(id, limit).await
    }

    async fn create_session(&self, session: &ScrapeSession) -> Result<SessionId> {
        self.check()?;
        self.inner.create_session(session).await
    }

    // Sealing stays available so an aborted run can still be closed out
    async fn seal_session(
        &self,
        id: SessionId,
        status: SessionStatus,
        counts: SessionCounts,
        ended_at: DateTime<Utc>,
        notes: Option<String>,
    ) -> Result<()> {
        self.inner
            .seal_session(id, status, counts, ended_at, notes)
            .await
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<ScrapeSession>> {
        self.inner.get_session(id).await
    }

    async fn list_sessions(&self, limit: usize) -> Result<Vec<ScrapeSession>> {
        self.inner.list_sessions(limit).await
    }

    async fn stats(&self) -> Result<MonitorStats> {
        self.inner.stats().await
    }
}

/// Shorthand for building test subscriptions.
pub fn new_subscription(url: &str, label: &str, poll_interval_secs: u64) -> NewSubscription {
    let url = Url::parse(url).unwrap_or_else(|e| panic!("invalid test url {}: {}", url, e));
    NewSubscription::new(url, label, poll_interval_secs)
}
