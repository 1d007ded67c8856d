//! MIDI relay protocol: what to do with each local and each remote event.
//!
//! Outbound events are only broadcast while connected. MIDI is a live stream,
//! so anything produced while disconnected is dropped, never queued for later.
//! Inbound events from this participant are discarded (loopback suppression).

use crate::connection::ConnectionState;
use crate::envelope::{MidiEventEnvelope, format_midi_bytes};
use crate::ids::ParticipantId;

/// Decision for a locally produced event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Broadcast(MidiEventEnvelope),
    /// Not connected, or nothing to send.
    Dropped,
}

/// Decision for a received envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Sent by this participant. No side effects at all.
    Loopback,
    /// Dispatch the payload to the selected output.
    Play,
    /// No output selected: log it, play nothing.
    LogOnly,
}

#[derive(Debug, Clone)]
pub struct RelayProtocol {
    participant: ParticipantId,
}

impl RelayProtocol {
    pub fn new(participant: ParticipantId) -> Self {
        Self { participant }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn outbound(&self, bytes: Vec<u8>, state: ConnectionState, now_millis: u64) -> Outbound {
        if state != ConnectionState::Connected {
            return Outbound::Dropped;
        }
        match MidiEventEnvelope::new(self.participant.clone(), bytes, now_millis) {
            Some(envelope) => Outbound::Broadcast(envelope),
            None => Outbound::Dropped,
        }
    }

    pub fn inbound(&self, envelope: &MidiEventEnvelope, output_selected: bool) -> Inbound {
        if envelope.sender_id() == &self.participant {
            Inbound::Loopback
        } else if output_selected {
            Inbound::Play
        } else {
            Inbound::LogOnly
        }
    }
}

pub fn sent_activity(bytes: &[u8]) -> String {
    format!("MIDI sent: {}", format_midi_bytes(bytes))
}

pub fn received_activity(bytes: &[u8], played: bool) -> String {
    if played {
        format!("MIDI received: {}", format_midi_bytes(bytes))
    } else {
        format!(
            "MIDI received (no output selected): {}",
            format_midi_bytes(bytes)
        )
    }
}

/// Producer-side timestamp for new envelopes.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
