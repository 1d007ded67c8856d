//! Pub/sub transport boundary.
//!
//! A [`Transport`] opens one [`Channel`] per session topic. Every call on a
//! channel is non-blocking; results come back asynchronously as
//! [`ChannelEvent`]s on the receiver handed out by [`Transport::open`].
//! Each open yields a fresh receiver, so events from a channel that has been
//! torn down are never seen by whoever dropped it.
//!
//! Submodules:
//! - `memory` — in-process hub used by tests and offline sessions

pub mod memory;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::ids::ParticipantId;
use crate::presence::{PresenceMeta, PresenceSignal};

/// Outcome of a subscribe request, or a later change in subscription health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    /// The channel closed without being asked to.
    Closed,
}

/// Membership state of a channel, readable synchronously for heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Joining,
    Joined,
    Leaving,
    Errored,
}

impl ChannelState {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Joining => 1,
            Self::Joined => 2,
            Self::Leaving => 3,
            Self::Errored => 4,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Joining,
            2 => Self::Joined,
            3 => Self::Leaving,
            4 => Self::Errored,
            _ => Self::Closed,
        }
    }
}

/// Everything a channel reports back to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Status(SubscribeStatus),
    Broadcast { event: String, payload: Value },
    Presence(PresenceSignal),
}

pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// One subscription to a session topic.
pub trait Channel: Send {
    /// Ask the backend to join. The result arrives as `ChannelEvent::Status`.
    fn subscribe(&mut self);

    /// Leave the topic. No further events are delivered.
    fn unsubscribe(&mut self);

    /// Current membership state, without waiting on the network.
    fn state(&self) -> ChannelState;

    /// Fire-and-forget broadcast to the other members of the topic.
    fn broadcast(&mut self, event: &str, payload: Value) -> Result<(), TransportError>;

    /// Announce this participant in the topic's presence set.
    fn track(&mut self, meta: PresenceMeta) -> Result<(), TransportError>;
}

/// Factory for channels on one pub/sub backend.
pub trait Transport: Send + 'static {
    type Channel: Channel + 'static;

    /// Open a channel on `topic` for `participant`.
    ///
    /// Returns [`TransportError::Unavailable`] when the backend cannot be
    /// reached by construction (missing configuration). That error is not
    /// retried.
    fn open(
        &mut self,
        topic: &str,
        participant: &ParticipantId,
    ) -> Result<(Self::Channel, ChannelEvents), TransportError>;
}
