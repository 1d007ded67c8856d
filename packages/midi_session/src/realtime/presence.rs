//! Server presence folded into full snapshots.
//!
//! The backend keys presence by participant id, but one key can hold several
//! connections at once, each identified by its `phx_ref`. A participant who
//! reconnects briefly has two; the old one's leave may arrive after the new
//! one's join. A key only goes away once its last connection has left.

use std::collections::BTreeMap;

use midi_relay::ParticipantId;
use midi_relay::presence::{PresenceSignal, PresenceSnapshot};

use super::protocol::{PresenceEntries, PresenceRef};

#[derive(Debug, Default)]
pub struct PresenceMap {
    members: BTreeMap<String, Vec<PresenceRef>>,
}

impl PresenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything with a `presence_state` frame.
    pub fn reset(&mut self, state: PresenceEntries) -> Vec<PresenceSignal> {
        self.members = state
            .into_iter()
            .map(|(key, refs)| {
                let refs = or_anonymous(&key, refs);
                (key, refs)
            })
            .collect();
        vec![self.sync()]
    }

    /// Apply a `presence_diff`. Emits `Join`/`Leave` for keys that appear or
    /// disappear entirely, then a `Sync` of the result.
    pub fn apply_diff(
        &mut self,
        joins: PresenceEntries,
        leaves: PresenceEntries,
    ) -> Vec<PresenceSignal> {
        let mut signals = Vec::new();

        for (key, refs) in joins {
            let refs = or_anonymous(&key, refs);
            match self.members.get_mut(&key) {
                Some(current) => {
                    for joined in refs {
                        let known = joined.phx_ref.is_some()
                            && current.iter().any(|c| c.phx_ref == joined.phx_ref);
                        if !known {
                            current.push(joined);
                        }
                    }
                }
                None => {
                    self.members.insert(key.clone(), refs);
                    signals.push(PresenceSignal::Join {
                        key: ParticipantId::from(key),
                    });
                }
            }
        }

        for (key, refs) in leaves {
            let Some(current) = self.members.get_mut(&key) else {
                continue;
            };
            let gone: Vec<&str> = refs.iter().filter_map(|r| r.phx_ref.as_deref()).collect();
            // A leave that names no connection takes the whole key.
            if gone.is_empty() {
                current.clear();
            } else {
                current.retain(|c| !c.phx_ref.as_deref().is_some_and(|r| gone.contains(&r)));
            }
            if current.is_empty() {
                self.members.remove(&key);
                signals.push(PresenceSignal::Leave {
                    key: ParticipantId::from(key),
                });
            }
        }

        signals.push(self.sync());
        signals
    }

    pub fn count(&self) -> usize {
        self.members.len()
    }

    fn sync(&self) -> PresenceSignal {
        let snapshot: PresenceSnapshot = self
            .members
            .iter()
            .filter_map(|(key, refs)| {
                let first = refs.first()?;
                Some((ParticipantId::from(key.as_str()), first.meta.clone()))
            })
            .collect();
        PresenceSignal::Sync(snapshot)
    }
}

/// An entry with no metas still counts as one connection.
fn or_anonymous(key: &str, refs: Vec<PresenceRef>) -> Vec<PresenceRef> {
    if refs.is_empty() {
        vec![PresenceRef::anonymous(key)]
    } else {
        refs
    }
}
