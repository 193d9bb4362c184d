//! Scrape orchestration and change detection for monitored web pages.
//!
//! Periodically visits subscribed URLs, extracts structured fields, and
//! records only what changed since the last successful visit. Each run is a
//! session with aggregate counts; failing subscriptions are flagged for
//! operators but keep being polled.
//!
//! # Usage
//!
//! ```rust,ignore
//! use subscription_monitor::{Monitor, SchedulerConfig, SqliteStore, HttpExtractor};
//! use tokio_util::sync::CancellationToken;
//!
//! let store = SqliteStore::new("sqlite://monitor.db?mode=rwc").await?;
//! let extractor = HttpExtractor::new(selectors)?;
//! let monitor = Monitor::new(store, extractor, SchedulerConfig::default());
//!
//! let report = monitor.run_once(&CancellationToken::new()).await?;
//! std::process::exit(report.exit_code());
//! ```
//!
//! # Modules
//!
//! - [`traits`] - Extractor and ResultStore ports
//! - [`detector`] - Fingerprinting and new-content classification
//! - [`scheduler`] - Due selection, bounded dispatch, retry/backoff
//! - [`session`] - Session lifecycle and aggregate counts
//! - [`storage`] - MemoryStore and SqliteStore
//! - [`extractors`] - HTTP strategy and URL-pattern routing
//! - [`testing`] - Mock extractor and failing store wrapper

pub mod config;
pub mod detector;
pub mod error;
pub mod extractors;
pub mod monitor;
pub mod progress;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod testing;
pub mod traits;
pub mod types;

pub use config::{parse_subscription_list, MonitorConfig, SchedulerConfig};
pub use detector::{fingerprint, ChangeDetector, Detection};
pub use error::{ExtractionFailure, FailureKind, MonitorError, Result};
pub use extractors::{HttpExtractor, StrategyRouter};
pub use monitor::{Monitor, RunReport};
pub use progress::{ProgressReporter, RunProgress};
pub use scheduler::{
    select_due, RetryPolicy, RunSummary, Scheduler, SubscriptionGuard, SubscriptionLocks, TaskArena,
};
pub use session::{CloseReason, Outcome, SessionTracker};
pub use storage::{MemoryStore, SqliteStore};
pub use traits::{Extractor, ResultStore};
pub use types::*;
