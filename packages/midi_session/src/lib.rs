//! MIDI Session - join shared MIDI sessions over a hosted realtime backend
//!
//! Wires the transport-agnostic core in `midi_relay` to the outside world:
//!
//! - [`config`] — figment-layered settings under `~/.midi-session`
//! - [`realtime`] — the Phoenix-websocket transport
//! - [`hardware`] — platform MIDI through midir (feature `midi-hardware`)

pub mod config;
#[cfg(feature = "midi-hardware")]
pub mod hardware;
pub mod realtime;

pub use config::{MidiConfig, RealtimeConfig, SessionConfig};
pub use realtime::RealtimeTransport;
