//! Connection state machine.
//!
//! Takes [`ConnectionEvent`]s and answers with the [`Effect`]s the driver has
//! to perform. It owns the attempt counter and the "reconnect already
//! scheduled" flag, so a burst of failures arriving together (a channel error
//! right behind a timeout, say) schedules exactly one reconnect.

use std::time::Duration;

use tracing::debug;

use super::ConnectionState;
use super::policy::ReconnectPolicy;
use crate::error::SessionError;

/// Everything that can move the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Begin connecting. Ignored unless disconnected.
    Start,
    /// The channel reported a successful subscribe.
    Subscribed,
    /// The channel or transport failed.
    Failure(SessionError),
    /// Periodic liveness check; `joined` is the channel's membership state.
    HeartbeatCheck { joined: bool },
    /// The scheduled reconnect delay elapsed.
    ReconnectDue,
    /// Tear everything down. Nothing is retried afterwards.
    Stop,
    /// Start over with a fresh attempt budget, from any state.
    Restart,
}

/// Work for the driver, in the order it must be done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Close any current channel, open a new one and subscribe.
    OpenChannel,
    CloseChannel,
    TrackPresence,
    ArmHeartbeat,
    DisarmHeartbeat,
    ScheduleReconnect(Duration),
    CancelReconnect,
    /// Append a line to the activity log.
    Activity(String),
}

#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    policy: ReconnectPolicy,
    attempts_used: u32,
    reconnect_pending: bool,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

impl ConnectionStateMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            attempts_used: 0,
            reconnect_pending: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts_used(&self) -> u32 {
        self.attempts_used
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn handle(&mut self, event: ConnectionEvent) -> Vec<Effect> {
        let old_state = self.state;

        let effects = match event {
            ConnectionEvent::Start => {
                if self.state != ConnectionState::Disconnected {
                    debug!(state = %self.state, "start ignored");
                    return Vec::new();
                }
                self.state = ConnectionState::Connecting;
                vec![Effect::OpenChannel]
            }

            ConnectionEvent::Restart => {
                self.attempts_used = 0;
                self.reconnect_pending = false;
                self.state = ConnectionState::Connecting;
                vec![
                    Effect::CancelReconnect,
                    Effect::DisarmHeartbeat,
                    Effect::CloseChannel,
                    Effect::Activity("Restarting connection".to_string()),
                    Effect::OpenChannel,
                ]
            }

            ConnectionEvent::Stop => {
                if self.state == ConnectionState::Disconnected {
                    return Vec::new();
                }
                self.reconnect_pending = false;
                self.state = ConnectionState::Disconnected;
                vec![
                    Effect::CancelReconnect,
                    Effect::DisarmHeartbeat,
                    Effect::CloseChannel,
                    Effect::Activity("Disconnected".to_string()),
                ]
            }

            ConnectionEvent::Subscribed => {
                if self.state != ConnectionState::Connecting {
                    debug!(state = %self.state, "late subscribe ignored");
                    return Vec::new();
                }
                let recovered_after = self.attempts_used;
                self.attempts_used = 0;
                self.state = ConnectionState::Connected;
                let line = if recovered_after > 0 {
                    format!(
                        "Reconnected after {} attempt{}",
                        recovered_after,
                        if recovered_after == 1 { "" } else { "s" }
                    )
                } else {
                    "Connected".to_string()
                };
                vec![
                    Effect::ArmHeartbeat,
                    Effect::TrackPresence,
                    Effect::Activity(line),
                ]
            }

            ConnectionEvent::Failure(SessionError::TransportUnavailable(err)) => {
                if matches!(
                    self.state,
                    ConnectionState::Disconnected | ConnectionState::Failed
                ) {
                    return Vec::new();
                }
                self.reconnect_pending = false;
                self.state = ConnectionState::Disconnected;
                vec![
                    Effect::CancelReconnect,
                    Effect::DisarmHeartbeat,
                    Effect::CloseChannel,
                    Effect::Activity(format!("Cannot connect: {err}")),
                ]
            }

            ConnectionEvent::Failure(cause) if cause.is_transient() => match self.state {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    self.request_reconnect(&cause)
                }
                _ => {
                    debug!(state = %self.state, %cause, "failure ignored");
                    Vec::new()
                }
            },

            // Malformed payloads and device problems never move the connection.
            ConnectionEvent::Failure(_) => Vec::new(),

            ConnectionEvent::HeartbeatCheck { joined } => {
                if self.state == ConnectionState::Connected && !joined {
                    self.request_reconnect(&SessionError::HeartbeatLivenessFailure)
                } else {
                    Vec::new()
                }
            }

            ConnectionEvent::ReconnectDue => {
                if self.state != ConnectionState::Reconnecting || !self.reconnect_pending {
                    return Vec::new();
                }
                self.reconnect_pending = false;
                self.state = ConnectionState::Connecting;
                debug!(
                    attempt = self.attempts_used,
                    max = self.policy.max_attempts(),
                    "reconnect attempt"
                );
                vec![Effect::CloseChannel, Effect::OpenChannel]
            }
        };

        if self.state != old_state {
            debug!("connection state: {} -> {}", old_state, self.state);
        }
        effects
    }

    /// Schedule the next reconnect, or give up once the budget is spent.
    fn request_reconnect(&mut self, cause: &SessionError) -> Vec<Effect> {
        if self.reconnect_pending {
            debug!(%cause, "reconnect already scheduled");
            return Vec::new();
        }

        let max = self.policy.max_attempts();
        if self.attempts_used >= max {
            self.state = ConnectionState::Failed;
            return vec![
                Effect::DisarmHeartbeat,
                Effect::CancelReconnect,
                Effect::CloseChannel,
                Effect::Activity(format!(
                    "Connection lost ({cause}); gave up after {max} reconnect attempts, restart required"
                )),
            ];
        }

        self.attempts_used += 1;
        self.reconnect_pending = true;
        self.state = ConnectionState::Reconnecting;
        let delay = self.policy.delay_for(self.attempts_used);
        vec![
            Effect::DisarmHeartbeat,
            Effect::ScheduleReconnect(delay),
            Effect::Activity(format!(
                "Connection lost ({cause}); retrying in {} ms (attempt {}/{})",
                delay.as_millis(),
                self.attempts_used,
                max
            )),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> ConnectionStateMachine {
        let mut machine = ConnectionStateMachine::default();
        machine.handle(ConnectionEvent::Start);
        machine.handle(ConnectionEvent::Subscribed);
        machine
    }

    fn channel_error() -> ConnectionEvent {
        ConnectionEvent::Failure(SessionError::ChannelError("reset".into()))
    }

    fn scheduled_delay(effects: &[Effect]) -> Option<Duration> {
        effects.iter().find_map(|e| match e {
            Effect::ScheduleReconnect(d) => Some(*d),
            _ => None,
        })
    }

    fn activity_lines(effects: &[Effect]) -> Vec<&str> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Activity(line) => Some(line.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn start_opens_channel() {
        let mut machine = ConnectionStateMachine::default();
        assert_eq!(machine.handle(ConnectionEvent::Start), vec![Effect::OpenChannel]);
        assert_eq!(machine.state(), ConnectionState::Connecting);

        // A second start while connecting does nothing.
        assert!(machine.handle(ConnectionEvent::Start).is_empty());
    }

    #[test]
    fn subscribe_connects_and_tracks_presence() {
        let mut machine = ConnectionStateMachine::default();
        machine.handle(ConnectionEvent::Start);
        let effects = machine.handle(ConnectionEvent::Subscribed);
        assert_eq!(machine.state(), ConnectionState::Connected);
        assert!(effects.contains(&Effect::ArmHeartbeat));
        assert!(effects.contains(&Effect::TrackPresence));
        assert_eq!(activity_lines(&effects), vec!["Connected"]);
    }

    #[test]
    fn backoff_doubles_until_failed() {
        let mut machine = connected();
        let mut delays = Vec::new();

        for _ in 0..5 {
            let effects = machine.handle(channel_error());
            assert_eq!(machine.state(), ConnectionState::Reconnecting);
            delays.push(scheduled_delay(&effects).unwrap().as_millis());

            machine.handle(ConnectionEvent::ReconnectDue);
            assert_eq!(machine.state(), ConnectionState::Connecting);
        }
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
        assert_eq!(machine.attempts_used(), 5);

        // Sixth failure: no more attempts.
        let effects = machine.handle(ConnectionEvent::Failure(SessionError::TimedOut));
        assert_eq!(machine.state(), ConnectionState::Failed);
        assert_eq!(scheduled_delay(&effects), None);
        assert!(effects.contains(&Effect::CloseChannel));
        assert!(activity_lines(&effects)[0].contains("restart required"));
    }

    #[test]
    fn failed_is_terminal_until_restart() {
        let mut machine = connected();
        for _ in 0..5 {
            machine.handle(channel_error());
            machine.handle(ConnectionEvent::ReconnectDue);
        }
        machine.handle(channel_error());
        assert_eq!(machine.state(), ConnectionState::Failed);

        for event in [
            ConnectionEvent::Start,
            ConnectionEvent::Subscribed,
            channel_error(),
            ConnectionEvent::HeartbeatCheck { joined: false },
            ConnectionEvent::ReconnectDue,
        ] {
            assert!(machine.handle(event).is_empty());
            assert_eq!(machine.state(), ConnectionState::Failed);
        }

        let effects = machine.handle(ConnectionEvent::Restart);
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(machine.attempts_used(), 0);
        assert_eq!(effects.last(), Some(&Effect::OpenChannel));
    }

    #[test]
    fn success_resets_attempts() {
        let mut machine = connected();
        machine.handle(channel_error());
        machine.handle(ConnectionEvent::ReconnectDue);
        machine.handle(channel_error());
        machine.handle(ConnectionEvent::ReconnectDue);
        assert_eq!(machine.attempts_used(), 2);

        let effects = machine.handle(ConnectionEvent::Subscribed);
        assert_eq!(machine.attempts_used(), 0);
        assert_eq!(activity_lines(&effects), vec!["Reconnected after 2 attempts"]);

        // Budget is full again: next drop starts over at the base delay.
        let effects = machine.handle(channel_error());
        assert_eq!(scheduled_delay(&effects), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn burst_of_failures_schedules_one_reconnect() {
        let mut machine = connected();
        let first = machine.handle(ConnectionEvent::Failure(SessionError::TimedOut));
        assert!(scheduled_delay(&first).is_some());

        assert!(machine.handle(channel_error()).is_empty());
        assert!(machine
            .handle(ConnectionEvent::Failure(SessionError::ChannelError("closed".into())))
            .is_empty());
        assert_eq!(machine.attempts_used(), 1);
        assert!(machine.reconnect_pending());
    }

    #[test]
    fn heartbeat_detects_silent_drop() {
        let mut machine = connected();
        assert!(machine.handle(ConnectionEvent::HeartbeatCheck { joined: true }).is_empty());

        let effects = machine.handle(ConnectionEvent::HeartbeatCheck { joined: false });
        assert_eq!(machine.state(), ConnectionState::Reconnecting);
        assert!(effects.contains(&Effect::DisarmHeartbeat));
        let lines = activity_lines(&effects);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("heartbeat"));
        assert!(lines[0].contains("retrying in 1000 ms"));
    }

    #[test]
    fn heartbeat_ignored_outside_connected() {
        let mut machine = ConnectionStateMachine::default();
        machine.handle(ConnectionEvent::Start);
        assert!(machine.handle(ConnectionEvent::HeartbeatCheck { joined: false }).is_empty());
        assert_eq!(machine.state(), ConnectionState::Connecting);
    }

    #[test]
    fn stop_cancels_everything() {
        let mut machine = connected();
        machine.handle(channel_error());
        let effects = machine.handle(ConnectionEvent::Stop);
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert!(effects.contains(&Effect::CancelReconnect));
        assert!(effects.contains(&Effect::DisarmHeartbeat));
        assert!(effects.contains(&Effect::CloseChannel));
        assert!(!machine.reconnect_pending());

        // The timer firing after stop changes nothing.
        assert!(machine.handle(ConnectionEvent::ReconnectDue).is_empty());
        assert!(machine.handle(channel_error()).is_empty());
        assert_eq!(machine.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn transport_unavailable_is_not_retried() {
        let mut machine = ConnectionStateMachine::default();
        machine.handle(ConnectionEvent::Start);
        let effects = machine.handle(ConnectionEvent::Failure(SessionError::from(
            crate::error::TransportError::Unavailable("missing url".into()),
        )));
        assert_eq!(machine.state(), ConnectionState::Disconnected);
        assert_eq!(scheduled_delay(&effects), None);
        assert_eq!(machine.attempts_used(), 0);
        assert_eq!(
            activity_lines(&effects),
            vec!["Cannot connect: transport unavailable: missing url"]
        );
    }

    #[test]
    fn non_connection_failures_are_ignored() {
        let mut machine = connected();
        let malformed = SessionError::from(crate::error::DecodeError::MalformedEnvelope(
            "bad".into(),
        ));
        assert!(machine.handle(ConnectionEvent::Failure(malformed)).is_empty());
        assert_eq!(machine.state(), ConnectionState::Connected);
    }

    #[test]
    fn drop_line_is_single_and_descriptive() {
        let mut machine = connected();
        let effects = machine.handle(channel_error());
        assert_eq!(
            activity_lines(&effects),
            vec!["Connection lost (channel error: reset); retrying in 1000 ms (attempt 1/5)"]
        );
    }
}
