//! SQLite storage implementation.
//!
//! A file-based backend for the CLI and single-host deployments. Ids are
//! stored as TEXT, timestamps as fixed-width RFC3339 so that lexical order is
//! chronological. Insertion order is tracked with an autoincrement `seq`.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::str::FromStr;
use url::Url;

use crate::error::{MonitorError, Result};
use crate::traits::ResultStore;
use crate::types::*;

/// SQLite-based result store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `database_url`.
    ///
    /// # Example URLs
    /// - `sqlite://monitor.db?mode=rwc` - File-based, create if not exists
    /// - `sqlite::memory:` - Use [`SqliteStore::in_memory`] instead
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(database_url, 5).await
    }

    /// Create an in-memory SQLite store (for testing).
    ///
    /// Every connection to `:memory:` is a separate database, so the pool is
    /// pinned to one long-lived connection.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL UNIQUE,
                label TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                poll_interval_secs INTEGER NOT NULL,
                last_attempted_at TEXT,
                last_succeeded_at TEXT,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_subscriptions_enabled ON subscriptions(enabled);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS extraction_results (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                subscription_id TEXT NOT NULL REFERENCES subscriptions(id),
                session_id TEXT NOT NULL,
                visited_at TEXT NOT NULL,
                status TEXT NOT NULL,
                fields TEXT,
                fingerprint TEXT,
                is_new INTEGER NOT NULL,
                attempts INTEGER NOT NULL,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_results_subscription
                ON extraction_results(subscription_id, seq);
            CREATE INDEX IF NOT EXISTS idx_results_session ON extraction_results(session_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scrape_sessions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                started_at TEXT NOT NULL,
                ended_at TEXT,
                status TEXT NOT NULL,
                planned INTEGER NOT NULL,
                attempted INTEGER NOT NULL DEFAULT 0,
                succeeded INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                new_content INTEGER NOT NULL DEFAULT 0,
                notes TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MonitorError::store(format!("Invalid date {:?}: {}", value, e)))
}

fn parse_optional_timestamp(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_timestamp).transpose()
}

fn parse_id<T: FromStr<Err = uuid::Error>>(value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|e| MonitorError::store(format!("Invalid id {:?}: {}", value, e)))
}

fn to_u32(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| MonitorError::store(format!("{} out of range: {}", column, value)))
}

// Row types for sqlx queries

const SUBSCRIPTION_COLUMNS: &str = "id, url, label, enabled, poll_interval_secs, \
     last_attempted_at, last_succeeded_at, consecutive_failures, created_at";

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: String,
    url: String,
    label: String,
    enabled: bool,
    poll_interval_secs: i64,
    last_attempted_at: Option<String>,
    last_succeeded_at: Option<String>,
    consecutive_failures: i64,
    created_at: String,
}

impl SubscriptionRow {
    fn into_subscription(self) -> Result<Subscription> {
        let url = Url::parse(&self.url)
            .map_err(|e| MonitorError::store(format!("Invalid url {:?}: {}", self.url, e)))?;

        Ok(Subscription {
            id: parse_id(&self.id)?,
            url,
            label: self.label,
            enabled: self.enabled,
            poll_interval_secs: u64::try_from(self.poll_interval_secs).unwrap_or(0),
            last_attempted_at: parse_optional_timestamp(self.last_attempted_at)?,
            last_succeeded_at: parse_optional_timestamp(self.last_succeeded_at)?,
            consecutive_failures: to_u32(self.consecutive_failures, "consecutive_failures")?,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

const RESULT_COLUMNS: &str = "id, subscription_id, session_id, visited_at, status, \
     fields, fingerprint, is_new, attempts, error";

#[derive(Debug, FromRow)]
struct ResultRow {
    id: String,
    subscription_id: String,
    session_id: String,
    visited_at: String,
    status: String,
    fields: Option<String>,
    fingerprint: Option<String>,
    is_new: bool,
    attempts: i64,
    error: Option<String>,
}

impl ResultRow {
    fn into_result(self) -> Result<ExtractionResult> {
        let status = self.status.parse::<ExtractionStatus>().map_err(MonitorError::store)?;
        let fields = self
            .fields
            .as_deref()
            .map(serde_json::from_str::<FieldSet>)
            .transpose()
            .map_err(|e| MonitorError::store(format!("Invalid fields JSON: {}", e)))?;

        Ok(ExtractionResult {
            id: parse_id(&self.id)?,
            subscription_id: parse_id(&self.subscription_id)?,
            session_id: parse_id(&self.session_id)?,
            visited_at: parse_timestamp(&self.visited_at)?,
            status,
            fields,
            fingerprint: self.fingerprint.map(Fingerprint),
            is_new: self.is_new,
            attempts: to_u32(self.attempts, "attempts")?,
            error: self.error,
        })
    }
}

const SESSION_COLUMNS: &str = "id, started_at, ended_at, status, planned, \
     attempted, succeeded, failed, new_content, notes";

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    started_at: String,
    ended_at: Option<String>,
    status: String,
    planned: i64,
    attempted: i64,
    succeeded: i64,
    failed: i64,
    new_content: i64,
    notes: Option<String>,
}

impl SessionRow {
    fn into_session(self) -> Result<ScrapeSession> {
        Ok(ScrapeSession {
            id: parse_id(&self.id)?,
            started_at: parse_timestamp(&self.started_at)?,
            ended_at: parse_optional_timestamp(self.ended_at)?,
            status: self.status.parse().map_err(MonitorError::store)?,
            planned: to_u32(self.planned, "planned")?,
            counts: SessionCounts {
                attempted: to_u32(self.attempted, "attempted")?,
                succeeded: to_u32(self.succeeded, "succeeded")?,
                failed: to_u32(self.failed, "failed")?,
                new_content: to_u32(self.new_content, "new_content")?,
            },
            notes: self.notes,
        })
    }
}

#[async_trait]
impl ResultStore for SqliteStore {
    async fn upsert_subscription(&self, new: NewSubscription) -> Result<Subscription> {
        let candidate = Subscription::new(new.url, new.label, new.poll_interval_secs);

        sqlx::query(
            r#"
            INSERT INTO subscriptions (id, url, label, enabled, poll_interval_secs, consecutive_failures, created_at)
            VALUES (?, ?, ?, 1, ?, 0, ?)
            ON CONFLICT(url) DO UPDATE SET
                label = excluded.label,
                poll_interval_secs = excluded.poll_interval_secs
            "#,
        )
        .bind(candidate.id.to_string())
        .bind(candidate.url.as_str())
        .bind(&candidate.label)
        .bind(i64::try_from(candidate.poll_interval_secs).unwrap_or(i64::MAX))
        .bind(timestamp(candidate.created_at))
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM subscriptions WHERE url = ?",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(candidate.url.as_str())
        .fetch_one(&self.pool)
        .await?;

        row.into_subscription()
    }

    async fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM subscriptions WHERE id = ?",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionRow::into_subscription).transpose()
    }

    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM subscriptions ORDER BY created_at, id",
            SUBSCRIPTION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SubscriptionRow::into_subscription).collect()
    }

    async fn list_enabled_subscriptions(&self) -> Result<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM subscriptions WHERE enabled = 1 ORDER BY created_at, id",
            SUBSCRIPTION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SubscriptionRow::into_subscription).collect()
    }

    async fn set_subscription_enabled(&self, id: SubscriptionId, enabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE subscriptions SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(MonitorError::UnknownSubscription(id));
        }
        Ok(())
    }

    async fn update_subscription_attempt(
        &self,
        id: SubscriptionId,
        at: DateTime<Utc>,
        succeeded: bool,
    ) -> Result<()> {
        // Single statement so concurrent writers never lose an increment
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                last_attempted_at = ?1,
                last_succeeded_at = CASE WHEN ?2 THEN ?1 ELSE last_succeeded_at END,
                consecutive_failures = CASE WHEN ?2 THEN 0 ELSE consecutive_failures + 1 END
            WHERE id = ?3
            "#,
        )
        .bind(timestamp(at))
        .bind(succeeded)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MonitorError::UnknownSubscription(id));
        }
        Ok(())
    }

    async fn list_flagged_subscriptions(&self, ceiling: u32) -> Result<Vec<Subscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {} FROM subscriptions WHERE consecutive_failures > ? \
             ORDER BY consecutive_failures DESC, created_at",
            SUBSCRIPTION_COLUMNS
        ))
        .bind(i64::from(ceiling))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SubscriptionRow::into_subscription).collect()
    }

    async fn get_latest_successful_fingerprint(
        &self,
        id: SubscriptionId,
    ) -> Result<Option<Fingerprint>> {
        let fingerprint: Option<Option<String>> = sqlx::query_scalar(
            r#"
            SELECT fingerprint FROM extraction_results
            WHERE subscription_id = ? AND status = 'success'
            ORDER BY seq DESC
            LIMIT 1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(fingerprint.flatten().map(Fingerprint))
    }

    async fn record_extraction_result(&self, result: &ExtractionResult) -> Result<()> {
        let known: Option<i64> = sqlx::query_scalar("SELECT 1 FROM subscriptions WHERE id = ?")
            .bind(result.subscription_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        if known.is_none() {
            return Err(MonitorError::UnknownSubscription(result.subscription_id));
        }

        let fields = result
            .fields
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(MonitorError::store)?;

        sqlx::query(
            r#"
            INSERT INTO extraction_results
                (id, subscription_id, session_id, visited_at, status, fields, fingerprint, is_new, attempts, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(result.id.to_string())
        .bind(result.subscription_id.to_string())
        .bind(result.session_id.to_string())
        .bind(timestamp(result.visited_at))
        .bind(result.status.as_str())
        .bind(fields)
        .bind(result.fingerprint.as_ref().map(Fingerprint::as_str))
        .bind(result.is_new)
        .bind(i64::from(result.attempts))
        .bind(&result.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_detected_result(
        &self,
        mut result: ExtractionResult,
    ) -> Result<ExtractionResult> {
        let known: Option<i64> = sqlx::query_scalar("SELECT 1 FROM subscriptions WHERE id = ?")
            .bind(result.subscription_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        if known.is_none() {
            return Err(MonitorError::UnknownSubscription(result.subscription_id));
        }

        let fields = result
            .fields
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(MonitorError::store)?;

        // A single INSERT takes the write lock before its subquery reads, so
        // the prior-fingerprint lookup cannot interleave with another writer.
        let is_new: bool = sqlx::query_scalar(
            r#"
            INSERT INTO extraction_results
                (id, subscription_id, session_id, visited_at, status, fields, fingerprint, is_new, attempts, error)
            VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                CASE
                    WHEN ?5 = 'success' AND ?7 IS NOT NULL THEN
                        (SELECT fingerprint FROM extraction_results
                         WHERE subscription_id = ?2 AND status = 'success'
                         ORDER BY seq DESC
                         LIMIT 1) IS NOT ?7
                    ELSE 0
                END,
                ?8, ?9
            )
            RETURNING is_new
            "#,
        )
        .bind(result.id.to_string())
        .bind(result.subscription_id.to_string())
        .bind(result.session_id.to_string())
        .bind(timestamp(result.visited_at))
        .bind(result.status.as_str())
        .bind(fields)
        .bind(result.fingerprint.as_ref().map(Fingerprint::as_str))
        .bind(i64::from(result.attempts))
        .bind(&result.error)
        .fetch_one(&self.pool)
        .await?;

        result.is_new = is_new;
        Ok(result)
    }

    async fn latest_result(&self, id: SubscriptionId) -> Result<Option<ExtractionResult>> {
        Ok(self.list_results(id, 1).await?.into_iter().next())
    }

    async fn list_results(
        &self,
        id: SubscriptionId,
        limit: usize,
    ) -> Result<Vec<ExtractionResult>> {
        let rows = sqlx::query_as::<_, ResultRow>(&format!(
            "SELECT {} FROM extraction_results WHERE subscription_id = ? ORDER BY seq DESC LIMIT ?",
            RESULT_COLUMNS
        ))
        .bind(id.to_string())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ResultRow::into_result).collect()
    }

    async fn create_session(&self, session: &ScrapeSession) -> Result<SessionId> {
        sqlx::query(
            r#"
            INSERT INTO scrape_sessions
                (id, started_at, ended_at, status, planned, attempted, succeeded, failed, new_content, notes)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session.id.to_string())
        .bind(timestamp(session.started_at))
        .bind(session.ended_at.map(timestamp))
        .bind(session.status.as_str())
        .bind(i64::from(session.planned))
        .bind(i64::from(session.counts.attempted))
        .bind(i64::from(session.counts.succeeded))
        .bind(i64::from(session.counts.failed))
        .bind(i64::from(session.counts.new_content))
        .bind(&session.notes)
        .execute(&self.pool)
        .await?;

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
        let result = sqlx::query(
            r#"
            UPDATE scrape_sessions SET
                status = ?, ended_at = ?, attempted = ?, succeeded = ?, failed = ?, new_content = ?, notes = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(status.as_str())
        .bind(timestamp(ended_at))
        .bind(i64::from(counts.attempted))
        .bind(i64::from(counts.succeeded))
        .bind(i64::from(counts.failed))
        .bind(i64::from(counts.new_content))
        .bind(notes)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_session(id).await? {
                Some(_) => Err(MonitorError::SessionSealed { session_id: id }),
                None => Err(MonitorError::UnknownSession(id)),
            };
        }
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<Option<ScrapeSession>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM scrape_sessions WHERE id = ?",
            SESSION_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(SessionRow::into_session).transpose()
    }

    async fn list_sessions(&self, limit: usize) -> Result<Vec<ScrapeSession>> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {} FROM scrape_sessions ORDER BY seq DESC LIMIT ?",
            SESSION_COLUMNS
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SessionRow::into_session).collect()
    }

    async fn stats(&self) -> Result<MonitorStats> {
        let (total_subscriptions, enabled_subscriptions): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(enabled), 0) FROM subscriptions",
        )
        .fetch_one(&self.pool)
        .await?;

        let (total_results, new_content_results, last_visit_at): (i64, i64, Option<String>) =
            sqlx::query_as(
                "SELECT COUNT(*), COALESCE(SUM(is_new), 0), MAX(visited_at) FROM extraction_results",
            )
            .fetch_one(&self.pool)
            .await?;

        let total_sessions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scrape_sessions")
            .fetch_one(&self.pool)
            .await?;

        Ok(MonitorStats {
            total_subscriptions: total_subscriptions.max(0) as u64,
            enabled_subscriptions: enabled_subscriptions.max(0) as u64,
            total_results: total_results.max(0) as u64,
            new_content_results: new_content_results.max(0) as u64,
            total_sessions: total_sessions.max(0) as u64,
            last_visit_at: parse_optional_timestamp(last_visit_at)?,
        })
    }
}
