//! Append-only activity log shown to the participant.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

/// One human-readable line in the activity feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Local wall-clock time, `HH:MM:SS`.
    pub timestamp: String,
    pub message: String,
}

/// Activity feed in emission order. Unbounded; the presentation layer decides
/// how much of the tail to show.
pub struct ActivityLog {
    records: Vec<ActivityRecord>,
    tx: broadcast::Sender<ActivityRecord>,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityLog {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            records: Vec::new(),
            tx,
        }
    }

    /// Append a record stamped with the current local time.
    pub fn push(&mut self, message: impl Into<String>) {
        let record = ActivityRecord {
            timestamp: chrono::Local::now().format("%H:%M:%S").to_string(),
            message: message.into(),
        };
        info!(target: "midi_relay::activity", "{}", record.message);
        // No subscribers is fine.
        let _ = self.tx.send(record.clone());
        self.records.push(record);
    }

    pub fn records(&self) -> &[ActivityRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Receive every record appended after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ActivityRecord> {
        self.tx.subscribe()
    }
}
