//! Live run progress for status displays.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Snapshot of the active run, or of the last one once it has finished.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub running: bool,
    pub completed: u32,
    pub total: u32,
    /// Label of the most recently started item
    pub current: Option<String>,
    pub message: String,
}

/// Publishes `RunProgress` to any number of subscribers.
#[derive(Debug)]
pub struct ProgressReporter {
    tx: watch::Sender<RunProgress>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RunProgress {
            message: "Idle".to_string(),
            ..RunProgress::default()
        });
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<RunProgress> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> RunProgress {
        self.tx.borrow().clone()
    }

    pub fn start(&self, total: u32) {
        self.tx.send_replace(RunProgress {
            running: true,
            completed: 0,
            total,
            current: None,
            message: format!("Starting run over {} subscriptions", total),
        });
    }

    pub fn item_started(&self, label: &str) {
        self.tx.send_modify(|progress| {
            progress.current = Some(label.to_string());
            progress.message = format!("Visiting {}", label);
        });
    }

    pub fn item_finished(&self, label: &str, succeeded: bool) {
        self.tx.send_modify(|progress| {
            progress.completed += 1;
            progress.message = if succeeded {
                format!("Finished {} ({}/{})", label, progress.completed, progress.total)
            } else {
                format!("Failed {} ({}/{})", label, progress.completed, progress.total)
            };
        });
    }

    pub fn finish(&self, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_modify(|progress| {
            progress.running = false;
            progress.current = None;
            progress.message = message;
        });
    }
}
