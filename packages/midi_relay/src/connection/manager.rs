//! Connection driver.
//!
//! Owns the live channel, its event receiver, the heartbeat interval and the
//! reconnect timer, and executes the effects the state machine asks for.
//! [`ConnectionManager::next`] is cancel-safe so it can sit in a `select!`
//! next to other work.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep, interval_at, sleep};
use tracing::{debug, info, warn};

use super::ConnectionState;
use super::policy::{HEARTBEAT_INTERVAL, ReconnectPolicy};
use super::state::{ConnectionEvent, ConnectionStateMachine, Effect};
use crate::envelope::{self, MIDI_EVENT, MidiEventEnvelope};
use crate::error::{SessionError, TransportError};
use crate::ids::ParticipantId;
use crate::presence::{PresenceMeta, PresenceSignal};
use crate::transport::{
    Channel, ChannelEvent, ChannelEvents, ChannelState, SubscribeStatus, Transport,
};

/// Application-level traffic from the current channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Broadcast { event: String, payload: Value },
    Presence(PresenceSignal),
}

/// One step of the driver: either something for the state machine or
/// traffic for the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Driven {
    Event(ConnectionEvent),
    Incoming(Incoming),
}

pub struct ConnectionManager<T: Transport> {
    machine: ConnectionStateMachine,
    transport: T,
    topic: String,
    participant: ParticipantId,
    channel: Option<T::Channel>,
    events: Option<ChannelEvents>,
    heartbeat_period: Duration,
    heartbeat: Option<Interval>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, topic: impl Into<String>, participant: ParticipantId) -> Self {
        Self {
            machine: ConnectionStateMachine::new(ReconnectPolicy::default()),
            transport,
            topic: topic.into(),
            participant,
            channel: None,
            events: None,
            heartbeat_period: HEARTBEAT_INTERVAL,
            heartbeat: None,
            reconnect_timer: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn attempts_used(&self) -> u32 {
        self.machine.attempts_used()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn heartbeat_armed(&self) -> bool {
        self.heartbeat.is_some()
    }

    pub fn reconnect_scheduled(&self) -> bool {
        self.reconnect_timer.is_some()
    }

    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    /// Feed an event to the state machine and carry out its effects.
    ///
    /// Returns the activity lines produced along the way, including those of
    /// follow-up events (a channel that cannot even be opened).
    pub fn handle(&mut self, event: ConnectionEvent) -> Vec<String> {
        let mut activity = Vec::new();
        let mut queue = vec![event];

        while let Some(event) = queue.pop() {
            for effect in self.machine.handle(event) {
                match effect {
                    Effect::OpenChannel => {
                        if let Err(err) = self.open_channel() {
                            queue.push(ConnectionEvent::Failure(SessionError::from(err)));
                        }
                    }
                    Effect::CloseChannel => self.close_channel(),
                    Effect::TrackPresence => self.track_presence(),
                    Effect::ArmHeartbeat => {
                        let mut heartbeat = interval_at(
                            Instant::now() + self.heartbeat_period,
                            self.heartbeat_period,
                        );
                        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        self.heartbeat = Some(heartbeat);
                    }
                    Effect::DisarmHeartbeat => self.heartbeat = None,
                    Effect::ScheduleReconnect(delay) => {
                        info!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                        self.reconnect_timer = Some(Box::pin(sleep(delay)));
                    }
                    Effect::CancelReconnect => self.reconnect_timer = None,
                    Effect::Activity(line) => activity.push(line),
                }
            }
        }
        activity
    }

    /// Wait for the next thing that needs handling.
    ///
    /// With no channel and no timers this never resolves.
    pub async fn next(&mut self) -> Driven {
        tokio::select! {
            biased;

            event = recv_event(&mut self.events) => match event {
                Some(event) => self.classify(event),
                None => {
                    self.events = None;
                    Driven::Event(ConnectionEvent::Failure(SessionError::ChannelError(
                        "channel event stream ended".to_string(),
                    )))
                }
            },

            _ = reconnect_due(&mut self.reconnect_timer) => {
                self.reconnect_timer = None;
                Driven::Event(ConnectionEvent::ReconnectDue)
            }

            _ = heartbeat_tick(&mut self.heartbeat) => {
                let joined = self
                    .channel
                    .as_ref()
                    .is_some_and(|c| c.state() == ChannelState::Joined);
                Driven::Event(ConnectionEvent::HeartbeatCheck { joined })
            }
        }
    }

    /// Broadcast an envelope on the live channel. Fails unless connected.
    pub fn broadcast(&mut self, envelope: &MidiEventEnvelope) -> Result<(), TransportError> {
        if self.machine.state() != ConnectionState::Connected {
            return Err(TransportError::NotJoined);
        }
        let channel = self.channel.as_mut().ok_or(TransportError::NotJoined)?;
        channel.broadcast(MIDI_EVENT, envelope::encode(envelope))
    }

    fn classify(&self, event: ChannelEvent) -> Driven {
        match event {
            ChannelEvent::Status(SubscribeStatus::Subscribed) => {
                Driven::Event(ConnectionEvent::Subscribed)
            }
            ChannelEvent::Status(SubscribeStatus::ChannelError(reason)) => {
                Driven::Event(ConnectionEvent::Failure(SessionError::ChannelError(reason)))
            }
            ChannelEvent::Status(SubscribeStatus::TimedOut) => {
                Driven::Event(ConnectionEvent::Failure(SessionError::TimedOut))
            }
            ChannelEvent::Status(SubscribeStatus::Closed) => Driven::Event(
                ConnectionEvent::Failure(SessionError::ChannelError("channel closed".to_string())),
            ),
            ChannelEvent::Broadcast { event, payload } => {
                Driven::Incoming(Incoming::Broadcast { event, payload })
            }
            ChannelEvent::Presence(signal) => Driven::Incoming(Incoming::Presence(signal)),
        }
    }

    fn open_channel(&mut self) -> Result<(), TransportError> {
        self.close_channel();
        let (mut channel, events) = self.transport.open(&self.topic, &self.participant)?;
        debug!(topic = %self.topic, "channel opened, subscribing");
        channel.subscribe();
        self.channel = Some(channel);
        self.events = Some(events);
        Ok(())
    }

    fn close_channel(&mut self) {
        // Dropping the receiver first discards anything the old channel
        // still had in flight.
        self.events = None;
        if let Some(mut channel) = self.channel.take() {
            channel.unsubscribe();
            debug!(topic = %self.topic, "channel closed");
        }
    }

    fn track_presence(&mut self) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };
        if let Err(err) = channel.track(PresenceMeta::now(&self.participant)) {
            warn!(error = %err, "failed to track presence");
        }
    }
}

async fn recv_event(events: &mut Option<ChannelEvents>) -> Option<ChannelEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn reconnect_due(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => pending().await,
    }
}

async fn heartbeat_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryHub, MemoryTransport};

    const TOPIC: &str = "midi-session-test";

    fn manager(hub: &MemoryHub, participant: &str) -> ConnectionManager<MemoryTransport> {
        ConnectionManager::new(hub.transport(), TOPIC, ParticipantId::from(participant))
    }

    /// Drive until the state machine reaches `want`, feeding every
    /// connection event back in.
    async fn drive_until(
        manager: &mut ConnectionManager<MemoryTransport>,
        want: ConnectionState,
    ) -> Vec<String> {
        let mut activity = Vec::new();
        while manager.state() != want {
            if let Driven::Event(event) = manager.next().await {
                activity.extend(manager.handle(event));
            }
        }
        activity
    }

    #[tokio::test(start_paused = true)]
    async fn connects_and_arms_heartbeat() {
        let hub = MemoryHub::new();
        let mut manager = manager(&hub, "user_a");
        assert!(manager.handle(ConnectionEvent::Start).is_empty());
        assert_eq!(manager.state(), ConnectionState::Connecting);

        let activity = drive_until(&mut manager, ConnectionState::Connected).await;
        assert_eq!(activity, vec!["Connected"]);
        assert!(manager.heartbeat_armed());
        assert!(!manager.reconnect_scheduled());
        assert_eq!(hub.member_count(TOPIC), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_drop() {
        let hub = MemoryHub::new();
        let mut manager = manager(&hub, "user_a");
        manager.handle(ConnectionEvent::Start);
        drive_until(&mut manager, ConnectionState::Connected).await;

        hub.drop_participant(&ParticipantId::from("user_a"));
        let started = Instant::now();
        let activity = drive_until(&mut manager, ConnectionState::Reconnecting).await;
        assert_eq!(activity.len(), 1);
        assert!(!manager.heartbeat_armed());

        let activity = drive_until(&mut manager, ConnectionState::Connected).await;
        assert_eq!(activity, vec!["Reconnected after 1 attempt"]);
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert_eq!(manager.attempts_used(), 0);
        assert_eq!(hub.opened_channels(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_notices_silent_detach() {
        let hub = MemoryHub::new();
        let mut manager = manager(&hub, "user_a");
        manager.handle(ConnectionEvent::Start);
        drive_until(&mut manager, ConnectionState::Connected).await;

        hub.silently_detach(&ParticipantId::from("user_a"));
        let started = Instant::now();
        let activity = drive_until(&mut manager, ConnectionState::Reconnecting).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(5000) && elapsed < Duration::from_millis(6000));
        assert!(activity[0].contains("heartbeat"));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_five_attempts() {
        let hub = MemoryHub::new();
        let mut manager = manager(&hub, "user_a");
        manager.handle(ConnectionEvent::Start);
        drive_until(&mut manager, ConnectionState::Connected).await;

        for _ in 0..6 {
            hub.fail_next_subscribe(SubscribeStatus::TimedOut);
        }
        hub.drop_participant(&ParticipantId::from("user_a"));

        let started = Instant::now();
        drive_until(&mut manager, ConnectionState::Failed).await;
        // 1 + 2 + 4 + 8 + 16 seconds of backoff.
        assert!(started.elapsed() >= Duration::from_millis(31_000));
        assert!(!manager.heartbeat_armed());
        assert!(!manager.reconnect_scheduled());
        assert!(!manager.has_channel());
        assert_eq!(hub.opened_channels(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_transport_stays_disconnected() {
        let hub = MemoryHub::new();
        hub.set_unavailable("no realtime url configured");
        let mut manager = manager(&hub, "user_a");

        let activity = manager.handle(ConnectionEvent::Start);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(
            activity,
            vec!["Cannot connect: transport unavailable: no realtime url configured"]
        );
        assert!(!manager.reconnect_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_requires_connection() {
        let hub = MemoryHub::new();
        let mut manager = manager(&hub, "user_a");
        let envelope =
            MidiEventEnvelope::new(ParticipantId::from("user_a"), vec![0x90, 0x40, 0x7f], 0)
                .unwrap();
        assert_eq!(manager.broadcast(&envelope), Err(TransportError::NotJoined));

        manager.handle(ConnectionEvent::Start);
        drive_until(&mut manager, ConnectionState::Connected).await;
        assert_eq!(manager.broadcast(&envelope), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_leaves_the_topic() {
        let hub = MemoryHub::new();
        let mut manager = manager(&hub, "user_a");
        manager.handle(ConnectionEvent::Start);
        drive_until(&mut manager, ConnectionState::Connected).await;

        manager.handle(ConnectionEvent::Stop);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(hub.member_count(TOPIC), 0);
        assert!(!manager.heartbeat_armed());
    }
}
