//! End-to-end runs against the SQLite store.

use std::sync::Arc;
use std::time::Duration;

use subscription_monitor::testing::{MockExtractor, MockResponse};
use subscription_monitor::{
    parse_subscription_list, ExtractionStatus, Monitor, ResultStore, RetryPolicy, RunReport,
    SchedulerConfig, SessionStatus, SqliteStore,
};
use tokio_util::sync::CancellationToken;

fn config() -> SchedulerConfig {
    SchedulerConfig::new()
        .with_item_timeout(Duration::from_millis(100))
        .with_retry(RetryPolicy::new(
            2,
            Duration::from_millis(5),
            Duration::from_millis(10),
        ))
}

#[tokio::test]
async fn test_sync_run_and_query() {
    let store = SqliteStore::in_memory().await.unwrap();
    let list = "# pages\n\
                dashboard\thttps://dash.example.com/\n\
                https://news.example.com/\n\
                https://down.example.com/\n";
    let entries = parse_subscription_list(list, 0).unwrap();

    let dashboard = entries[0].url.clone();
    let news = entries[1].url.clone();
    let down = entries[2].url.clone();

    let mock = Arc::new(
        MockExtractor::new()
            .with_script(
                &dashboard,
                vec![
                    MockResponse::fields([("title", "Dashboard"), ("status", "green")]),
                    MockResponse::fields([("title", "Dashboard"), ("status", "red")]),
                ],
            )
            .with_response(&news, MockResponse::fields([("title", "News")]))
            .with_response(&down, MockResponse::network()),
    );
    let monitor = Monitor::from_shared(Arc::new(store), mock, config());

    let synced = monitor.sync_subscriptions(entries).await.unwrap();
    assert_eq!(synced.len(), 3);
    assert_eq!(synced[0].label, "dashboard");

    let first = monitor.run_once(&CancellationToken::new()).await.unwrap();
    let second = monitor.run_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(first.exit_code(), 0);
    assert_eq!(second.exit_code(), 0);

    let RunReport::Finished { session, .. } = second else {
        panic!("expected a finished run");
    };
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.counts.attempted, 3);
    assert_eq!(session.counts.succeeded, 2);
    assert_eq!(session.counts.failed, 1);
    // Dashboard changed, news did not
    assert_eq!(session.counts.new_content, 1);

    let dashboard_results = monitor.results(synced[0].id, 10).await.unwrap();
    assert_eq!(dashboard_results.len(), 2);
    assert!(dashboard_results.iter().all(|r| r.is_new));

    let news_latest = monitor.latest_result(synced[1].id).await.unwrap().unwrap();
    assert!(!news_latest.is_new);

    let down_latest = monitor.latest_result(synced[2].id).await.unwrap().unwrap();
    assert_eq!(down_latest.status, ExtractionStatus::Failure);
    assert_eq!(down_latest.attempts, 2);

    let sessions = monitor.sessions(10).await.unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].id, session.id);

    let stats = monitor.stats().await.unwrap();
    assert_eq!(stats.total_subscriptions, 3);
    assert_eq!(stats.total_results, 6);
    assert_eq!(stats.new_content_results, 3);
    assert_eq!(stats.total_sessions, 2);

    let down = monitor.store().get_subscription(synced[2].id).await.unwrap().unwrap();
    assert_eq!(down.consecutive_failures, 2);
}

#[tokio::test]
async fn test_resync_keeps_history() {
    let store = SqliteStore::in_memory().await.unwrap();
    let monitor = Monitor::new(store, MockExtractor::new(), config());

    let entries = parse_subscription_list("https://a.example.com/\n", 0).unwrap();
    let first = monitor.sync_subscriptions(entries.clone()).await.unwrap();
    monitor.run_once(&CancellationToken::new()).await.unwrap();

    let second = monitor.sync_subscriptions(entries).await.unwrap();
    assert_eq!(first[0].id, second[0].id);
    assert!(second[0].last_attempted_at.is_some());
    assert_eq!(monitor.results(second[0].id, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_monitors_record_identical_content_once_as_new() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let entries = parse_subscription_list("https://shared.example.com/\n", 0).unwrap();
    let url = entries[0].url.clone();

    let extractor = || {
        Arc::new(MockExtractor::new().with_response(
            &url,
            MockResponse::fields([("title", "X")]).after(Duration::from_millis(10)),
        ))
    };
    let first = Monitor::from_shared(store.clone(), extractor(), config());
    let second = Monitor::from_shared(store.clone(), extractor(), config());
    let synced = first.sync_subscriptions(entries).await.unwrap();

    for _ in 0..3 {
        let cancel = CancellationToken::new();
        let (a, b) = tokio::join!(first.run_once(&cancel), second.run_once(&cancel));
        a.unwrap();
        b.unwrap();
    }

    let results = first.results(synced[0].id, 100).await.unwrap();
    assert!(results.len() >= 3);
    assert_eq!(results.iter().filter(|r| r.is_new).count(), 1);
    assert!(results.last().unwrap().is_new);
}
