//! Presence tracking: participant count from transport presence signals.
//!
//! Only `sync` changes the count. `join` and `leave` produce log lines and
//! nothing else, so a join/leave line can briefly disagree with the count
//! until the transport's next `sync` arrives.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::ParticipantId;

/// Metadata a participant announces when it tracks itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMeta {
    #[serde(alias = "userId", default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<ParticipantId>,
    #[serde(alias = "joinedAt", default)]
    pub joined_at_iso: String,
}

impl PresenceMeta {
    pub fn now(participant_id: &ParticipantId) -> Self {
        Self {
            participant_id: Some(participant_id.clone()),
            joined_at_iso: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Authoritative membership as last reported by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSnapshot {
    members: BTreeMap<ParticipantId, PresenceMeta>,
}

impl PresenceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ParticipantId, meta: PresenceMeta) {
        self.members.insert(id, meta);
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<PresenceMeta> {
        self.members.remove(id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.members.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.members.len()
    }

    pub fn participants(&self) -> impl Iterator<Item = &ParticipantId> {
        self.members.keys()
    }
}

impl FromIterator<(ParticipantId, PresenceMeta)> for PresenceSnapshot {
    fn from_iter<I: IntoIterator<Item = (ParticipantId, PresenceMeta)>>(iter: I) -> Self {
        Self {
            members: iter.into_iter().collect(),
        }
    }
}

/// Presence signals as delivered by a transport channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceSignal {
    Sync(PresenceSnapshot),
    Join { key: ParticipantId },
    Leave { key: ParticipantId },
}

/// Result of applying one presence signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUpdate {
    /// New participant count, only set on `sync`.
    pub count: Option<usize>,
    /// Activity line describing the signal.
    pub activity: String,
}

#[derive(Debug, Default)]
pub struct PresenceTracker {
    snapshot: PresenceSnapshot,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, signal: PresenceSignal) -> PresenceUpdate {
        match signal {
            PresenceSignal::Sync(snapshot) => {
                self.snapshot = snapshot;
                let count = self.snapshot.count();
                PresenceUpdate {
                    count: Some(count),
                    activity: format!("Participants: {}", count),
                }
            }
            PresenceSignal::Join { .. } => PresenceUpdate {
                count: None,
                activity: "A participant joined".to_string(),
            },
            PresenceSignal::Leave { .. } => PresenceUpdate {
                count: None,
                activity: "A participant left".to_string(),
            },
        }
    }

    pub fn count(&self) -> usize {
        self.snapshot.count()
    }

    pub fn snapshot(&self) -> &PresenceSnapshot {
        &self.snapshot
    }
}
