use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use url::Url;
use uuid::Uuid;

// ============================================================================
// IDS
// ============================================================================

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a subscription
    SubscriptionId
);
uuid_id!(
    /// Unique identifier for an extraction result
    ResultId
);
uuid_id!(
    /// Unique identifier for a scrape session
    SessionId
);

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

/// A monitored URL with its polling policy and health state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub url: Url,
    pub label: String,
    pub enabled: bool,
    pub poll_interval_secs: u64,
    pub last_attempted_at: Option<DateTime<Utc>>,
    pub last_succeeded_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(url: Url, label: impl Into<String>, poll_interval_secs: u64) -> Self {
        Self {
            id: SubscriptionId::new(),
            url,
            label: label.into(),
            enabled: true,
            poll_interval_secs,
            last_attempted_at: None,
            last_succeeded_at: None,
            consecutive_failures: 0,
            created_at: Utc::now(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        // chrono caps durations at i64::MAX milliseconds
        let max_secs = (i64::MAX / 1000) as u64;
        Duration::seconds(self.poll_interval_secs.min(max_secs) as i64)
    }

    /// Due when never attempted or when the polling interval has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_attempted_at {
            None => true,
            Some(last) => now.signed_duration_since(last) >= self.poll_interval(),
        }
    }

    /// Flagged subscriptions keep being polled; the flag is for operators.
    pub fn is_flagged(&self, failure_ceiling: u32) -> bool {
        self.consecutive_failures > failure_ceiling
    }
}

/// Operator-supplied subscription definition (upserted by URL).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSubscription {
    pub url: Url,
    pub label: String,
    pub poll_interval_secs: u64,
}

impl NewSubscription {
    pub fn new(url: Url, label: impl Into<String>, poll_interval_secs: u64) -> Self {
        Self {
            url,
            label: label.into(),
            poll_interval_secs,
        }
    }
}

// ============================================================================
// EXTRACTED CONTENT
// ============================================================================

/// A single extracted field: scalar text or an ordered sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    List(Vec<String>),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(value: Vec<String>) -> Self {
        FieldValue::List(value)
    }
}

/// Mapping of field name to extracted value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldSet(HashMap<String, FieldValue>);

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for FieldSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Hex-encoded SHA-256 digest of a normalized field set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// EXTRACTION RESULTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Success,
    Failure,
    Timeout,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStatus::Success => "success",
            ExtractionStatus::Failure => "failure",
            ExtractionStatus::Timeout => "timeout",
        }
    }
}

impl FromStr for ExtractionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ExtractionStatus::Success),
            "failure" => Ok(ExtractionStatus::Failure),
            "timeout" => Ok(ExtractionStatus::Timeout),
            other => Err(format!("unknown extraction status: {}", other)),
        }
    }
}

/// One visit to a subscription. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub id: ResultId,
    pub subscription_id: SubscriptionId,
    pub session_id: SessionId,
    pub visited_at: DateTime<Utc>,
    pub status: ExtractionStatus,
    pub fields: Option<FieldSet>,
    pub fingerprint: Option<Fingerprint>,
    pub is_new: bool,
    pub attempts: u32,
    pub error: Option<String>,
}

impl ExtractionResult {
    pub fn success(
        subscription_id: SubscriptionId,
        session_id: SessionId,
        fields: FieldSet,
        fingerprint: Fingerprint,
        is_new: bool,
        attempts: u32,
    ) -> Self {
        Self {
            id: ResultId::new(),
            subscription_id,
            session_id,
            visited_at: Utc::now(),
            status: ExtractionStatus::Success,
            fields: Some(fields),
            fingerprint: Some(fingerprint),
            is_new,
            attempts,
            error: None,
        }
    }

    pub fn failed(
        subscription_id: SubscriptionId,
        session_id: SessionId,
        status: ExtractionStatus,
        error: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            id: ResultId::new(),
            subscription_id,
            session_id,
            visited_at: Utc::now(),
            status,
            fields: None,
            fingerprint: None,
            is_new: false,
            attempts,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExtractionStatus::Success
    }
}

// ============================================================================
// SESSIONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Aborted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Aborted => "aborted",
        }
    }

    pub fn is_sealed(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "aborted" => Ok(SessionStatus::Aborted),
            other => Err(format!("unknown session status: {}", other)),
        }
    }
}

/// Aggregate outcome counters for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounts {
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub new_content: u32,
}

impl SessionCounts {
    /// attempted == succeeded + failed, new content only among successes
    pub fn is_consistent(&self) -> bool {
        self.attempted == self.succeeded + self.failed && self.new_content <= self.succeeded
    }
}

/// One orchestration run over all due subscriptions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeSession {
    pub id: SessionId,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub planned: u32,
    pub counts: SessionCounts,
    pub notes: Option<String>,
}

impl ScrapeSession {
    pub fn open(planned: u32) -> Self {
        Self {
            id: SessionId::new(),
            started_at: Utc::now(),
            ended_at: None,
            status: SessionStatus::Running,
            planned,
            counts: SessionCounts::default(),
            notes: None,
        }
    }
}

/// Aggregate statistics exposed to read-only consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStats {
    pub total_subscriptions: u64,
    pub enabled_subscriptions: u64,
    pub total_results: u64,
    pub new_content_results: u64,
    pub total_sessions: u64,
    pub last_visit_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription() -> Subscription {
        Subscription::new(
            Url::parse("https://example.com/a").unwrap(),
            "a",
            3600,
        )
    }

    #[test]
    fn test_never_attempted_is_due() {
        assert!(subscription().is_due(Utc::now()));
    }

    #[test]
    fn test_due_after_interval() {
        let now = Utc::now();
        let mut sub = subscription();

        sub.last_attempted_at = Some(now - Duration::seconds(3599));
        assert!(!sub.is_due(now));

        sub.last_attempted_at = Some(now - Duration::seconds(3600));
        assert!(sub.is_due(now));
    }

    #[test]
    fn test_flag_requires_exceeding_ceiling() {
        let mut sub = subscription();
        sub.consecutive_failures = 3;
        assert!(!sub.is_flagged(3));
        sub.consecutive_failures = 4;
        assert!(sub.is_flagged(3));
    }

    #[test]
    fn test_field_value_serializes_untagged() {
        let fields = FieldSet::new()
            .with("title", "X")
            .with("tags", vec!["a".to_string(), "b".to_string()]);
        let json = serde_json::to_value(&fields).unwrap();

        assert_eq!(json["title"], "X");
        assert_eq!(json["tags"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            SessionStatus::Running,
            SessionStatus::Completed,
            SessionStatus::Aborted,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<ExtractionStatus>().is_err());
    }

    #[test]
    fn test_counts_consistency() {
        let counts = SessionCounts {
            attempted: 3,
            succeeded: 2,
            failed: 1,
            new_content: 1,
        };
        assert!(counts.is_consistent());
        assert!(!SessionCounts {
            attempted: 4,
            ..counts
        }
        .is_consistent());
    }
}
