//! One websocket per channel, driven by a background task.
//!
//! The sync [`Channel`] methods only queue commands; the task owns the socket
//! and reports everything back as [`ChannelEvent`]s. Presence frames are
//! folded into a [`PresenceMap`] so the session always receives full snapshots.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until, timeout_at};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use midi_relay::error::TransportError;
use midi_relay::presence::{PresenceMeta, PresenceSignal};
use midi_relay::transport::{Channel, ChannelEvent, ChannelState, SubscribeStatus};
use midi_relay::ParticipantId;

use super::presence::PresenceMap;
use super::protocol::{PhoenixMessage, ServerFrame};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketWriter = SplitSink<Socket, Message>;

pub(crate) enum ChannelCommand {
    Subscribe,
    Broadcast { event: String, payload: Value },
    Track(PresenceMeta),
    Leave,
}

/// Handle to a channel task. Dropping it leaves the channel.
pub struct RealtimeChannel {
    commands: mpsc::UnboundedSender<ChannelCommand>,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
    left: bool,
}

impl RealtimeChannel {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<ChannelCommand>,
        state: Arc<AtomicU8>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            commands,
            state,
            cancel,
            left: false,
        }
    }

    fn queue(&self, command: ChannelCommand) -> Result<(), TransportError> {
        if self.state() != ChannelState::Joined {
            return Err(TransportError::NotJoined);
        }
        self.commands
            .send(command)
            .map_err(|_| TransportError::Channel("socket task stopped".to_string()))
    }
}

impl Channel for RealtimeChannel {
    fn subscribe(&mut self) {
        let _ = self.commands.send(ChannelCommand::Subscribe);
    }

    fn unsubscribe(&mut self) {
        if !self.left {
            self.left = true;
            let _ = self.commands.send(ChannelCommand::Leave);
        }
    }

    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn broadcast(&mut self, event: &str, payload: Value) -> Result<(), TransportError> {
        self.queue(ChannelCommand::Broadcast {
            event: event.to_string(),
            payload,
        })
    }

    fn track(&mut self, meta: PresenceMeta) -> Result<(), TransportError> {
        self.queue(ChannelCommand::Track(meta))
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        self.unsubscribe();
        // Queued commands, the leave included, are handled before this.
        self.cancel.cancel();
    }
}

pub(crate) struct ChannelTask {
    pub url: String,
    pub topic: String,
    pub participant: ParticipantId,
    pub join_timeout: Duration,
    pub heartbeat: Duration,
    pub commands: mpsc::UnboundedReceiver<ChannelCommand>,
    pub events: mpsc::UnboundedSender<ChannelEvent>,
    pub state: Arc<AtomicU8>,
    pub cancel: CancellationToken,
    pub presence: PresenceMap,
    pub next_ref: u64,
}

impl ChannelTask {
    fn set_state(&self, state: ChannelState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn emit(&self, event: ChannelEvent) {
        // The owner dropping its receiver means it no longer cares.
        let _ = self.events.send(event);
    }

    fn fail(&self, status: SubscribeStatus) {
        self.set_state(ChannelState::Errored);
        warn!(topic = %self.topic, ?status, "realtime channel failed");
        self.emit(ChannelEvent::Status(status));
    }

    fn next_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    pub async fn run(mut self) {
        if !self.wait_for_subscribe().await {
            self.set_state(ChannelState::Closed);
            return;
        }

        self.set_state(ChannelState::Joining);
        let deadline = Instant::now() + self.join_timeout;

        let socket = tokio::select! {
            result = timeout_at(deadline, connect_async(self.url.as_str())) => match result {
                Ok(Ok((socket, _))) => socket,
                Ok(Err(err)) => {
                    self.fail(SubscribeStatus::ChannelError(err.to_string()));
                    return;
                }
                Err(_) => {
                    self.fail(SubscribeStatus::TimedOut);
                    return;
                }
            },
            _ = self.cancel.cancelled() => {
                self.set_state(ChannelState::Closed);
                return;
            }
        };
        debug!(topic = %self.topic, "socket connected, joining");

        let (mut writer, mut reader) = socket.split();
        let join_ref = self.next_ref();
        let join = PhoenixMessage::join(&self.topic, &self.participant, join_ref.clone());
        if let Err(err) = send(&mut writer, &join).await {
            self.fail(SubscribeStatus::ChannelError(err));
            return;
        }

        let join_deadline = sleep_until(deadline);
        tokio::pin!(join_deadline);
        let mut joined = false;
        let mut heartbeat = interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(ChannelCommand::Broadcast { event, payload }) => {
                        let msg_ref = self.next_ref();
                        let msg = PhoenixMessage::broadcast(&self.topic, &event, payload, msg_ref);
                        if let Err(err) = send(&mut writer, &msg).await {
                            self.fail(SubscribeStatus::ChannelError(err));
                            return;
                        }
                    }
                    Some(ChannelCommand::Track(meta)) => {
                        let msg_ref = self.next_ref();
                        let msg = PhoenixMessage::track(&self.topic, &meta, msg_ref);
                        if let Err(err) = send(&mut writer, &msg).await {
                            self.fail(SubscribeStatus::ChannelError(err));
                            return;
                        }
                    }
                    Some(ChannelCommand::Subscribe) => {}
                    Some(ChannelCommand::Leave) | None => {
                        self.set_state(ChannelState::Leaving);
                        let leave_ref = self.next_ref();
                        let leave = PhoenixMessage::leave(&self.topic, leave_ref);
                        let _ = send(&mut writer, &leave).await;
                        let _ = writer.close().await;
                        self.set_state(ChannelState::Closed);
                        info!(topic = %self.topic, "left realtime channel");
                        return;
                    }
                },

                _ = self.cancel.cancelled() => {
                    let _ = writer.close().await;
                    self.set_state(ChannelState::Closed);
                    return;
                }

                _ = &mut join_deadline, if !joined => {
                    self.fail(SubscribeStatus::TimedOut);
                    return;
                }

                _ = heartbeat.tick() => {
                    let msg = PhoenixMessage::heartbeat(self.next_ref());
                    if let Err(err) = send(&mut writer, &msg).await {
                        self.fail(SubscribeStatus::ChannelError(err));
                        return;
                    }
                }

                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !self.handle_text(text.as_str(), &join_ref, &mut joined) {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        self.fail(SubscribeStatus::Closed);
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        self.fail(SubscribeStatus::ChannelError(err.to_string()));
                        return;
                    }
                },
            }
        }
    }

    /// Block until asked to subscribe. False if the channel was dropped first.
    async fn wait_for_subscribe(&mut self) -> bool {
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(ChannelCommand::Subscribe) => return true,
                    Some(ChannelCommand::Leave) | None => return false,
                    Some(_) => debug!("channel not joined yet, command dropped"),
                },
                _ = self.cancel.cancelled() => return false,
            }
        }
    }

    /// Handle one text frame. Returns false when the channel is finished.
    fn handle_text(&mut self, text: &str, join_ref: &str, joined: &mut bool) -> bool {
        let message = match PhoenixMessage::parse(text) {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "unparseable frame ignored");
                return true;
            }
        };

        match ServerFrame::from_message(&self.topic, message) {
            ServerFrame::Reply { msg_ref, ok, reason } => {
                if *joined || msg_ref.as_deref() != Some(join_ref) {
                    return true;
                }
                if ok {
                    *joined = true;
                    self.set_state(ChannelState::Joined);
                    info!(topic = %self.topic, "joined realtime channel");
                    self.emit(ChannelEvent::Status(SubscribeStatus::Subscribed));
                    true
                } else {
                    self.fail(SubscribeStatus::ChannelError(reason));
                    false
                }
            }
            ServerFrame::Broadcast { event, payload } => {
                self.emit(ChannelEvent::Broadcast { event, payload });
                true
            }
            ServerFrame::PresenceState(state) => {
                let signals = self.presence.reset(state);
                self.emit_presence(signals);
                true
            }
            ServerFrame::PresenceDiff { joins, leaves } => {
                let signals = self.presence.apply_diff(joins, leaves);
                self.emit_presence(signals);
                true
            }
            ServerFrame::Error(reason) => {
                self.fail(SubscribeStatus::ChannelError(reason));
                false
            }
            ServerFrame::Closed => {
                self.fail(SubscribeStatus::Closed);
                false
            }
            ServerFrame::Ignored => true,
        }
    }

    fn emit_presence(&self, signals: Vec<PresenceSignal>) {
        for signal in signals {
            self.emit(ChannelEvent::Presence(signal));
        }
    }
}

async fn send(writer: &mut SocketWriter, message: &PhoenixMessage) -> Result<(), String> {
    writer
        .send(Message::Text(message.to_json().into()))
        .await
        .map_err(|e| e.to_string())
}
