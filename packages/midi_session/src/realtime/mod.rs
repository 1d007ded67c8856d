//! Transport over the hosted backend's realtime websocket.
//!
//! Submodules:
//! - `protocol` — frame shapes and the socket URL
//! - `presence` — per-connection presence folded into snapshots
//! - `channel` — the per-channel socket task

pub mod channel;
pub mod presence;
pub mod protocol;

use std::sync::Arc;
use std::sync::atomic::AtomicU8;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use midi_relay::error::TransportError;
use midi_relay::transport::{ChannelEvents, ChannelState, Transport};
use midi_relay::ParticipantId;

use crate::config::RealtimeConfig;

pub use channel::RealtimeChannel;
use channel::ChannelTask;
use presence::PresenceMap;
use protocol::{channel_topic, socket_url};

/// Opens one websocket per channel against the configured backend.
#[derive(Clone, Debug)]
pub struct RealtimeTransport {
    config: RealtimeConfig,
}

impl RealtimeTransport {
    pub fn new(config: RealtimeConfig) -> Self {
        Self { config }
    }
}

impl Transport for RealtimeTransport {
    type Channel = RealtimeChannel;

    /// Must be called from inside a tokio runtime; the socket task is spawned here.
    fn open(
        &mut self,
        topic: &str,
        participant: &ParticipantId,
    ) -> Result<(RealtimeChannel, ChannelEvents), TransportError> {
        if !self.config.is_configured() {
            return Err(TransportError::Unavailable(
                "realtime url and api key are not configured".to_string(),
            ));
        }
        let url = socket_url(&self.config.url, &self.config.api_key).ok_or_else(|| {
            TransportError::Unavailable(format!("unsupported realtime url: {}", self.config.url))
        })?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicU8::new(ChannelState::Closed.as_u8()));
        let cancel = CancellationToken::new();

        let task = ChannelTask {
            url,
            topic: channel_topic(topic),
            participant: participant.clone(),
            join_timeout: self.config.join_timeout,
            heartbeat: self.config.socket_heartbeat,
            commands: command_rx,
            events: event_tx,
            state: state.clone(),
            cancel: cancel.clone(),
            presence: PresenceMap::new(),
            next_ref: 0,
        };
        debug!(topic, "opening realtime channel");
        tokio::spawn(task.run());

        Ok((RealtimeChannel::new(command_tx, state, cancel), event_rx))
    }
}
