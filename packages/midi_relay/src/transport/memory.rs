//! In-process pub/sub hub.
//!
//! Behaves like a hosted real-time backend closely enough to drive sessions
//! end to end inside one process: subscribe acknowledgements, broadcast fan-out,
//! presence `sync`/`join`/`leave`. Broadcasts are delivered to every member of
//! the topic including the sender, so loopback suppression is always exercised.
//!
//! Fault injection hooks let tests break channels on purpose.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Channel, ChannelEvent, ChannelEvents, ChannelState, SubscribeStatus, Transport};
use crate::error::TransportError;
use crate::ids::ParticipantId;
use crate::presence::{PresenceMeta, PresenceSignal, PresenceSnapshot};

struct Member {
    id: u64,
    participant: ParticipantId,
    tx: mpsc::UnboundedSender<ChannelEvent>,
    state: Arc<AtomicU8>,
    meta: Option<PresenceMeta>,
}

#[derive(Default)]
struct HubInner {
    next_member_id: u64,
    topics: HashMap<String, Vec<Member>>,
    subscribe_failures: VecDeque<SubscribeStatus>,
    unavailable: Option<String>,
    opened: usize,
}

impl HubInner {
    fn snapshot(&self, topic: &str) -> PresenceSnapshot {
        self.topics
            .get(topic)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|m| m.meta.clone().map(|meta| (m.participant.clone(), meta)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn send_all(&self, topic: &str, event: &ChannelEvent) {
        if let Some(members) = self.topics.get(topic) {
            for member in members {
                let _ = member.tx.send(event.clone());
            }
        }
    }

    /// Remove one member and tell the rest of the topic it left.
    fn remove_member(&mut self, topic: &str, member_id: u64) -> Option<Member> {
        let members = self.topics.get_mut(topic)?;
        let pos = members.iter().position(|m| m.id == member_id)?;
        let member = members.remove(pos);
        if member.meta.is_some() {
            self.send_all(
                topic,
                &ChannelEvent::Presence(PresenceSignal::Leave {
                    key: member.participant.clone(),
                }),
            );
            let snapshot = self.snapshot(topic);
            self.send_all(topic, &ChannelEvent::Presence(PresenceSignal::Sync(snapshot)));
        }
        Some(member)
    }
}

/// Shared in-process backend. Clones refer to the same hub.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose channels live on this hub.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport { hub: self.clone() }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The next subscribe request (from anyone) fails with `status`.
    /// Queued failures are consumed in order.
    pub fn fail_next_subscribe(&self, status: SubscribeStatus) {
        self.lock().subscribe_failures.push_back(status);
    }

    /// Make every subsequent `open` fail as unconfigured.
    pub fn set_unavailable(&self, reason: impl Into<String>) {
        self.lock().unavailable = Some(reason.into());
    }

    /// Kick a participant off every topic with a channel error.
    pub fn drop_participant(&self, participant: &ParticipantId) {
        self.detach(participant, true);
    }

    /// Detach a participant without telling it: its channel stops being
    /// joined but no error is pushed. Only a liveness check notices.
    pub fn silently_detach(&self, participant: &ParticipantId) {
        self.detach(participant, false);
    }

    fn detach(&self, participant: &ParticipantId, notify: bool) {
        let mut inner = self.lock();
        let mut targets: Vec<(String, u64)> = Vec::new();
        for (topic, members) in &inner.topics {
            for member in members.iter().filter(|m| &m.participant == participant) {
                targets.push((topic.clone(), member.id));
            }
        }

        for (topic, member_id) in targets {
            if let Some(member) = inner.remove_member(&topic, member_id) {
                if notify {
                    member.state.store(ChannelState::Errored.as_u8(), Ordering::SeqCst);
                    let _ = member.tx.send(ChannelEvent::Status(SubscribeStatus::ChannelError(
                        "dropped by hub".to_string(),
                    )));
                } else {
                    member.state.store(ChannelState::Closed.as_u8(), Ordering::SeqCst);
                }
                debug!(participant = %participant, topic = %topic, notify, "detached from hub");
            }
        }
    }

    /// Number of joined members on `topic`.
    pub fn member_count(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map(Vec::len).unwrap_or(0)
    }

    /// Total number of channels opened on this hub.
    pub fn opened_channels(&self) -> usize {
        self.lock().opened
    }
}

pub struct MemoryTransport {
    hub: MemoryHub,
}

impl Transport for MemoryTransport {
    type Channel = MemoryChannel;

    fn open(
        &mut self,
        topic: &str,
        participant: &ParticipantId,
    ) -> Result<(MemoryChannel, ChannelEvents), TransportError> {
        let mut inner = self.hub.lock();
        if let Some(reason) = &inner.unavailable {
            return Err(TransportError::Unavailable(reason.clone()));
        }
        inner.next_member_id += 1;
        inner.opened += 1;
        let member_id = inner.next_member_id;
        drop(inner);

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = MemoryChannel {
            hub: self.hub.clone(),
            topic: topic.to_string(),
            participant: participant.clone(),
            member_id,
            tx,
            state: Arc::new(AtomicU8::new(ChannelState::Closed.as_u8())),
        };
        Ok((channel, rx))
    }
}

pub struct MemoryChannel {
    hub: MemoryHub,
    topic: String,
    participant: ParticipantId,
    member_id: u64,
    tx: mpsc::UnboundedSender<ChannelEvent>,
    state: Arc<AtomicU8>,
}

impl MemoryChannel {
    fn set_state(&self, state: ChannelState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }
}

impl Channel for MemoryChannel {
    fn subscribe(&mut self) {
        let mut inner = self.hub.lock();
        if let Some(status) = inner.subscribe_failures.pop_front() {
            self.set_state(ChannelState::Errored);
            let _ = self.tx.send(ChannelEvent::Status(status));
            return;
        }

        self.set_state(ChannelState::Joined);
        inner
            .topics
            .entry(self.topic.clone())
            .or_default()
            .push(Member {
                id: self.member_id,
                participant: self.participant.clone(),
                tx: self.tx.clone(),
                state: self.state.clone(),
                meta: None,
            });

        let _ = self
            .tx
            .send(ChannelEvent::Status(SubscribeStatus::Subscribed));
        let snapshot = inner.snapshot(&self.topic);
        let _ = self
            .tx
            .send(ChannelEvent::Presence(PresenceSignal::Sync(snapshot)));
    }

    fn unsubscribe(&mut self) {
        if self.state() == ChannelState::Closed {
            return;
        }
        self.set_state(ChannelState::Leaving);
        self.hub.lock().remove_member(&self.topic, self.member_id);
        self.set_state(ChannelState::Closed);
    }

    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn broadcast(&mut self, event: &str, payload: Value) -> Result<(), TransportError> {
        if self.state() != ChannelState::Joined {
            return Err(TransportError::NotJoined);
        }
        let inner = self.hub.lock();
        inner.send_all(
            &self.topic,
            &ChannelEvent::Broadcast {
                event: event.to_string(),
                payload,
            },
        );
        Ok(())
    }

    fn track(&mut self, meta: PresenceMeta) -> Result<(), TransportError> {
        if self.state() != ChannelState::Joined {
            return Err(TransportError::NotJoined);
        }
        let mut inner = self.hub.lock();
        let member = inner
            .topics
            .get_mut(&self.topic)
            .and_then(|members| members.iter_mut().find(|m| m.id == self.member_id))
            .ok_or(TransportError::NotJoined)?;
        let newly_tracked = member.meta.is_none();
        member.meta = Some(meta);

        if newly_tracked {
            inner.send_all(
                &self.topic,
                &ChannelEvent::Presence(PresenceSignal::Join {
                    key: self.participant.clone(),
                }),
            );
        }
        let snapshot = inner.snapshot(&self.topic);
        inner.send_all(&self.topic, &ChannelEvent::Presence(PresenceSignal::Sync(snapshot)));
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
