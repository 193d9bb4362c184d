//! Scheduler knobs and process configuration from the environment.

use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::error::{MonitorError, Result};
use crate::scheduler::RetryPolicy;
use crate::types::NewSubscription;

/// Knobs for one scheduler run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of extractions in flight at once
    pub concurrency: usize,
    /// Per-attempt extraction timeout
    pub item_timeout: Duration,
    pub retry: RetryPolicy,
    /// Consecutive failures above this flag a subscription for operators
    pub failure_ceiling: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            item_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            failure_ceiling: 3,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = max_attempts;
        self
    }

    pub fn with_failure_ceiling(mut self, ceiling: u32) -> Self {
        self.failure_ceiling = ceiling;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(MonitorError::Config("concurrency must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(MonitorError::Config("max attempts must be at least 1".into()));
        }
        if self.item_timeout.is_zero() {
            return Err(MonitorError::Config("item timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub database_url: String,
    pub scheduler: SchedulerConfig,
    /// Polling interval given to subscriptions registered without one
    pub default_interval_secs: u64,
    pub dashboard_url: Option<Url>,
    pub subscriptions_file: Option<PathBuf>,
    /// Field name to CSS selector for the HTTP extractor
    pub selectors: BTreeMap<String, String>,
}

impl MonitorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset variables take their
    /// defaults; set but malformed values are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = SchedulerConfig::default();

        let scheduler = SchedulerConfig {
            concurrency: parse_var(&lookup, "MONITOR_CONCURRENCY")?.unwrap_or(defaults.concurrency),
            item_timeout: parse_var(&lookup, "MONITOR_ITEM_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.item_timeout),
            retry: RetryPolicy {
                max_attempts: parse_var(&lookup, "MONITOR_MAX_ATTEMPTS")?
                    .unwrap_or(defaults.retry.max_attempts),
                base_delay: parse_var(&lookup, "MONITOR_RETRY_BASE_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.base_delay),
                max_delay: parse_var(&lookup, "MONITOR_RETRY_MAX_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry.max_delay),
            },
            failure_ceiling: parse_var(&lookup, "MONITOR_FAILURE_CEILING")?
                .unwrap_or(defaults.failure_ceiling),
        };
        scheduler.validate()?;

        let dashboard_url = lookup("DASHBOARD_URL")
            .filter(|value| !value.trim().is_empty())
            .map(|value| {
                Url::parse(value.trim()).map_err(|e| {
                    MonitorError::Config(format!("DASHBOARD_URL must be a valid URL: {}", e))
                })
            })
            .transpose()?;

        let selectors = match lookup("MONITOR_SELECTORS") {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                MonitorError::Config(format!(
                    "MONITOR_SELECTORS must be a JSON object of field to selector: {}",
                    e
                ))
            })?,
            None => BTreeMap::from([("title".to_string(), "title".to_string())]),
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://monitor.db?mode=rwc".to_string()),
            scheduler,
            default_interval_secs: parse_var(&lookup, "MONITOR_DEFAULT_INTERVAL_SECS")?
                .unwrap_or(3600),
            dashboard_url,
            subscriptions_file: lookup("SUBSCRIPTIONS_FILE").map(PathBuf::from),
            selectors,
        })
    }
}

/// Parse a subscription list: one `url` or `label<TAB>url` per line.
///
/// Blank lines and `#` comments are skipped. Entries without a label are
/// labelled with their URL.
pub fn parse_subscription_list(text: &str, poll_interval_secs: u64) -> Result<Vec<NewSubscription>> {
    let mut subscriptions = Vec::new();

    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (label, raw_url) = match line.split_once('\t') {
            Some((label, url)) => (label.trim(), url.trim()),
            None => ("", line),
        };
        let url = Url::parse(raw_url).map_err(|e| {
            MonitorError::Config(format!("line {}: invalid URL {:?}: {}", index + 1, raw_url, e))
        })?;
        let label = if label.is_empty() {
            url.to_string()
        } else {
            label.to_string()
        };

        subscriptions.push(NewSubscription::new(url, label, poll_interval_secs));
    }

    Ok(subscriptions)
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| MonitorError::Config(format!("{} must be a valid number, got {:?}", key, raw)))
        })
        .transpose()
}
