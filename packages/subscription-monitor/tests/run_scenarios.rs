//! Integration tests for a full monitor run against the in-memory store.
//!
//! Each test seeds subscriptions, scripts the mock extractor per URL, runs
//! one or more sessions and checks what landed in the store.

use std::sync::Arc;
use std::time::Duration;

use subscription_monitor::testing::{new_subscription, FlakyStore, MockExtractor, MockResponse};
use subscription_monitor::{
    fingerprint, ExtractionStatus, FieldSet, MemoryStore, Monitor, MonitorError, ResultStore,
    RetryPolicy, RunReport, RunSummary, SchedulerConfig, ScrapeSession, SessionStatus,
    Subscription,
};
use tokio_util::sync::CancellationToken;

/// Short timeouts and near-instant backoff so tests stay fast.
fn fast_config() -> SchedulerConfig {
    SchedulerConfig::new()
        .with_concurrency(3)
        .with_item_timeout(Duration::from_millis(100))
        .with_retry(RetryPolicy::new(
            3,
            Duration::from_millis(5),
            Duration::from_millis(20),
        ))
}

/// Subscriptions with a zero interval are due on every run.
async fn seed(store: &MemoryStore, count: usize) -> Vec<Subscription> {
    let mut subscriptions = Vec::new();
    for i in 0..count {
        let sub = store
            .upsert_subscription(new_subscription(
                &format!("https://site{}.example.com/", i),
                &format!("site-{}", i),
                0,
            ))
            .await
            .unwrap();
        subscriptions.push(sub);
    }
    subscriptions
}

fn finished(report: &RunReport) -> (&ScrapeSession, &RunSummary) {
    match report {
        RunReport::Finished { session, summary } => (session, summary),
        RunReport::NothingDue { .. } => panic!("expected a finished run, got {:?}", report),
    }
}

#[tokio::test]
async fn test_first_extraction_is_new_content() {
    let store = MemoryStore::new();
    let subs = seed(&store, 1).await;
    let a = &subs[0];

    let mock = Arc::new(
        MockExtractor::new().with_response(&a.url, MockResponse::fields([("title", "X")])),
    );
    let monitor = Monitor::from_shared(Arc::new(store), mock, fast_config());

    let report = monitor.run_once(&CancellationToken::new()).await.unwrap();
    let (session, summary) = finished(&report);

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(summary.new_content, vec![a.id]);

    let result = monitor.latest_result(a.id).await.unwrap().unwrap();
    assert!(result.is_new);
    assert_eq!(
        result.fingerprint,
        Some(fingerprint(&FieldSet::new().with("title", "X")))
    );
    assert_eq!(result.session_id, session.id);
}

#[tokio::test]
async fn test_identical_content_is_not_new() {
    let store = MemoryStore::new();
    let subs = seed(&store, 1).await;
    let a = &subs[0];

    let mock = Arc::new(
        MockExtractor::new().with_response(&a.url, MockResponse::fields([("title", "X")])),
    );
    let monitor = Monitor::from_shared(Arc::new(store), mock, fast_config());

    monitor.run_once(&CancellationToken::new()).await.unwrap();
    let d1 = monitor
        .latest_result(a.id)
        .await
        .unwrap()
        .unwrap()
        .fingerprint;

    let report = monitor.run_once(&CancellationToken::new()).await.unwrap();
    let (session, summary) = finished(&report);
    let second = monitor.latest_result(a.id).await.unwrap().unwrap();

    assert!(!second.is_new);
    assert_eq!(second.fingerprint, d1);
    assert_eq!(session.counts.new_content, 0);
    assert!(summary.new_content.is_empty());
}

#[tokio::test]
async fn test_changed_content_is_new_again() {
    let store = MemoryStore::new();
    let subs = seed(&store, 1).await;
    let a = &subs[0];

    let mock = Arc::new(MockExtractor::new().with_script(
        &a.url,
        vec![
            MockResponse::fields([("title", "X")]),
            MockResponse::fields([("title", "Y")]),
        ],
    ));
    let monitor = Monitor::from_shared(Arc::new(store), mock, fast_config());

    monitor.run_once(&CancellationToken::new()).await.unwrap();
    monitor.run_once(&CancellationToken::new()).await.unwrap();

    let results = monitor.results(a.id, 10).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].is_new);
    assert_ne!(results[0].fingerprint, results[1].fingerprint);
}

#[tokio::test]
async fn test_exhausted_timeouts_record_timeout() {
    let store = MemoryStore::new();
    let subs = seed(&store, 1).await;
    let b = &subs[0];

    let mock = Arc::new(MockExtractor::new().with_response(&b.url, MockResponse::Hang));
    let monitor = Monitor::from_shared(Arc::new(store), mock.clone(), fast_config());

    let report = monitor.run_once(&CancellationToken::new()).await.unwrap();
    let (session, _) = finished(&report);

    assert_eq!(mock.call_count(&b.url), 3);
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.counts.failed, 1);
    assert_eq!(session.counts.succeeded, 0);

    let results = monitor.results(b.id, 10).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ExtractionStatus::Timeout);
    assert_eq!(results[0].attempts, 3);
    assert!(results.iter().all(|r| r.status != ExtractionStatus::Success));

    let updated = monitor.store().get_subscription(b.id).await.unwrap().unwrap();
    assert_eq!(updated.consecutive_failures, 1);
    assert!(updated.last_attempted_at.is_some());
    assert!(updated.last_succeeded_at.is_none());
}

#[tokio::test]
async fn test_network_failure_is_recorded_as_failure() {
    let store = MemoryStore::new();
    let subs = seed(&store, 1).await;
    let a = &subs[0];

    let mock = Arc::new(MockExtractor::new().with_response(&a.url, MockResponse::network()));
    let monitor = Monitor::from_shared(Arc::new(store), mock, fast_config());

    monitor.run_once(&CancellationToken::new()).await.unwrap();

    let result = monitor.latest_result(a.id).await.unwrap().unwrap();
    assert_eq!(result.status, ExtractionStatus::Failure);
    assert!(result.fields.is_none());
    assert!(result.error.is_some());
}

#[tokio::test]
async fn test_retry_then_success_resets_failures() {
    let store = MemoryStore::new();
    let subs = seed(&store, 1).await;
    let a = &subs[0];

    let mock = Arc::new(MockExtractor::new().with_script(
        &a.url,
        vec![
            MockResponse::network(),
            MockResponse::network(),
            MockResponse::fields([("title", "X")]),
        ],
    ));
    let monitor = Monitor::from_shared(Arc::new(store), mock.clone(), fast_config());

    let report = monitor.run_once(&CancellationToken::new()).await.unwrap();
    let (session, _) = finished(&report);

    assert_eq!(session.counts.succeeded, 1);
    let result = monitor.latest_result(a.id).await.unwrap().unwrap();
    assert_eq!(result.status, ExtractionStatus::Success);
    assert_eq!(result.attempts, 3);
    assert_eq!(mock.call_count(&a.url), 3);

    let updated = monitor.store().get_subscription(a.id).await.unwrap().unwrap();
    assert_eq!(updated.consecutive_failures, 0);
    assert!(updated.last_succeeded_at.is_some());
}

#[tokio::test]
async fn test_hung_item_does_not_block_others() {
    let store = MemoryStore::new();
    let subs = seed(&store, 10).await;

    let mut mock = MockExtractor::new();
    for sub in &subs[1..] {
        mock = mock.with_response(
            &sub.url,
            MockResponse::fields([("title", sub.label.as_str())]).after(Duration::from_millis(10)),
        );
    }
    mock = mock.with_response(&subs[0].url, MockResponse::Hang);
    let mock = Arc::new(mock);

    let config = fast_config().with_max_attempts(1);
    let monitor = Monitor::from_shared(Arc::new(store), mock.clone(), config);

    let report = monitor.run_once(&CancellationToken::new()).await.unwrap();
    let (session, summary) = finished(&report);

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.counts.attempted, 10);
    assert_eq!(session.counts.succeeded, 9);
    assert_eq!(session.counts.failed, 1);
    assert_eq!(summary.dispatched, 10);
    assert!(mock.max_in_flight() <= 3);
    assert_eq!(mock.in_flight(), 0);
}

#[tokio::test]
async fn test_concurrency_limit_holds_under_retries() {
    let store = MemoryStore::new();
    let subs = seed(&store, 8).await;

    let mut mock = MockExtractor::new();
    for sub in &subs {
        mock = mock.with_script(
            &sub.url,
            vec![
                MockResponse::network().after(Duration::from_millis(5)),
                MockResponse::fields([("title", "ok")]).after(Duration::from_millis(5)),
            ],
        );
    }
    let mock = Arc::new(mock);
    let monitor = Monitor::from_shared(Arc::new(store), mock.clone(), fast_config());

    let report = monitor.run_once(&CancellationToken::new()).await.unwrap();
    let (session, _) = finished(&report);

    assert_eq!(session.counts.succeeded, 8);
    assert!(mock.max_in_flight() <= 3);
    // Retries reuse the task: exactly two calls and one result per subscription
    for sub in &subs {
        assert_eq!(mock.call_count(&sub.url), 2);
        assert_eq!(monitor.results(sub.id, 10).await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn test_monitors_sharing_a_store_agree_on_new_content() {
    let store = Arc::new(MemoryStore::new());
    let subs = seed(&store, 2).await;

    let extractor = || {
        let mut mock = MockExtractor::new();
        for sub in &subs {
            mock = mock.with_response(
                &sub.url,
                MockResponse::fields([("title", "X")]).after(Duration::from_millis(10)),
            );
        }
        Arc::new(mock)
    };
    let first = Monitor::from_shared(store.clone(), extractor(), fast_config());
    let second = Monitor::from_shared(store.clone(), extractor(), fast_config());

    let cancel = CancellationToken::new();
    let (a, b) = tokio::join!(first.run_once(&cancel), second.run_once(&cancel));
    a.unwrap();
    b.unwrap();

    for sub in &subs {
        let results = first.results(sub.id, 10).await.unwrap();
        assert_eq!(results.iter().filter(|r| r.is_new).count(), 1);
        assert!(results.last().unwrap().is_new);
    }
}

#[tokio::test]
async fn test_cancellation_aborts_with_partial_counts() {
    let store = MemoryStore::new();
    let subs = seed(&store, 10).await;

    let mut mock = MockExtractor::new();
    for sub in &subs {
        mock = mock.with_response(
            &sub.url,
            MockResponse::fields([("title", "X")]).after(Duration::from_millis(300)),
        );
    }
    let mock = Arc::new(mock);

    let config = fast_config()
        .with_concurrency(4)
        .with_item_timeout(Duration::from_secs(2));
    let monitor = Monitor::from_shared(Arc::new(store), mock.clone(), config);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let report = monitor.run_once(&cancel).await.unwrap();
    let (session, summary) = finished(&report);

    assert_eq!(session.status, SessionStatus::Aborted);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(session.counts.attempted, 4);
    assert_eq!(session.counts.succeeded, 4);
    assert_eq!(summary.dispatched, 4);
    assert_eq!(summary.undispatched, 6);
    assert!(summary.cancelled);
    assert_eq!(mock.calls().len(), 4);

    let stats = monitor.stats().await.unwrap();
    assert_eq!(stats.total_results, 4);

    let stored = monitor.last_session().await.unwrap().unwrap();
    assert_eq!(stored.status, SessionStatus::Aborted);
    assert_eq!(stored.counts.attempted, 4);
}

#[tokio::test]
async fn test_nothing_due_opens_no_session() {
    let store = MemoryStore::new();
    let monitor = Monitor::new(store, MockExtractor::new(), fast_config());

    let report = monitor.run_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(report, RunReport::NothingDue { enabled: 0 });
    assert_eq!(report.exit_code(), 2);
    assert!(monitor.last_session().await.unwrap().is_none());
}

#[tokio::test]
async fn test_disabled_and_recent_subscriptions_are_skipped() {
    let store = MemoryStore::new();
    let disabled = store
        .upsert_subscription(new_subscription("https://off.example.com/", "off", 0))
        .await
        .unwrap();
    store
        .set_subscription_enabled(disabled.id, false)
        .await
        .unwrap();
    store
        .upsert_subscription(new_subscription("https://hourly.example.com/", "hourly", 3600))
        .await
        .unwrap();

    let mock = Arc::new(MockExtractor::new());
    let monitor = Monitor::from_shared(Arc::new(store), mock.clone(), fast_config());

    // The hourly subscription has never been attempted, so it is due once
    let first = monitor.run_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(finished(&first).0.planned, 1);

    let second = monitor.run_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(second, RunReport::NothingDue { enabled: 1 });
    assert_eq!(mock.calls().len(), 1);
}

#[tokio::test]
async fn test_repeated_failures_flag_but_keep_polling() {
    let store = MemoryStore::new();
    let subs = seed(&store, 1).await;
    let a = &subs[0];

    let mock = Arc::new(MockExtractor::new().with_response(&a.url, MockResponse::network()));
    let config = fast_config().with_max_attempts(1).with_failure_ceiling(1);
    let monitor = Monitor::from_shared(Arc::new(store), mock.clone(), config);

    let first = monitor.run_once(&CancellationToken::new()).await.unwrap();
    assert!(finished(&first).1.flagged.is_empty());
    assert!(monitor.flagged().await.unwrap().is_empty());

    let second = monitor.run_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(finished(&second).1.flagged, vec![a.id]);

    let flagged = monitor.flagged().await.unwrap();
    assert_eq!(flagged.len(), 1);
    assert_eq!(flagged[0].consecutive_failures, 2);
    assert!(flagged[0].enabled);

    monitor.run_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(mock.call_count(&a.url), 3);
}

#[tokio::test]
async fn test_store_outage_aborts_run() {
    let flaky = FlakyStore::new(MemoryStore::new()).fail_after(2);
    seed(flaky.inner(), 5).await;

    let config = fast_config().with_concurrency(1);
    let monitor = Monitor::new(flaky, MockExtractor::new(), config);

    let err = monitor
        .run_once(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, MonitorError::StoreUnavailable(_)));

    let session = monitor.last_session().await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Aborted);
    assert_eq!(session.counts.attempted, 2);
    assert!(session.counts.is_consistent());
    assert!(session.notes.unwrap().starts_with("aborted:"));
}

#[tokio::test]
async fn test_counts_always_balance() {
    let store = MemoryStore::new();
    let subs = seed(&store, 6).await;

    let mock = MockExtractor::new()
        .with_response(&subs[0].url, MockResponse::network())
        .with_response(&subs[1].url, MockResponse::timeout())
        .with_response(&subs[2].url, MockResponse::Hang);
    let config = fast_config().with_max_attempts(2);
    let monitor = Monitor::new(store, mock, config);

    let report = monitor.run_once(&CancellationToken::new()).await.unwrap();
    let (session, _) = finished(&report);

    assert!(session.counts.is_consistent());
    assert_eq!(session.counts.attempted, 6);
    assert_eq!(session.counts.failed, 3);
    assert_eq!(session.counts.succeeded, 3);
    assert_eq!(session.counts.new_content, 3);
}

#[tokio::test]
async fn test_progress_reflects_finished_run() {
    let store = MemoryStore::new();
    seed(&store, 2).await;
    let monitor = Monitor::new(store, MockExtractor::new(), fast_config());

    monitor.run_once(&CancellationToken::new()).await.unwrap();

    let progress = monitor.progress();
    assert!(!progress.running);
    assert_eq!(progress.total, 2);
    assert_eq!(progress.completed, 2);
    assert_eq!(progress.message, "Run completed");
}
