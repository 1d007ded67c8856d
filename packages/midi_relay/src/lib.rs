//! MIDI Relay - session connection and relay layer
//!
//! Keeps a resilient channel to a real-time pub/sub backend, tracks who is in
//! the session, and relays raw MIDI bytes between participants without ever
//! echoing a participant's own events back to it.
//!
//! The crate has no network or hardware dependencies. Both sides are traits:
//! [`transport::Transport`] for the pub/sub backend and [`midi::MidiBackend`]
//! for local MIDI devices. [`transport::memory::MemoryHub`] is an in-process
//! transport for tests and offline use.
//!
//! # Example
//!
//! ```no_run
//! use midi_relay::transport::memory::MemoryHub;
//! use midi_relay::{DeviceError, Session, SessionKey};
//!
//! #[tokio::main]
//! async fn main() {
//!     let hub = MemoryHub::new();
//!     let key = SessionKey::generate();
//!
//!     let no_midi = Err(DeviceError::Unavailable("offline".into()));
//!     let handle = Session::spawn(key, hub.transport(), no_midi);
//!
//!     let mut status = handle.watch_status();
//!     let _ = status.wait_for(|s| s.connected).await;
//!
//!     handle.submit_local_midi_event(vec![0x90, 0x40, 0x7f]).await;
//!
//!     for record in handle.activity().await {
//!         println!("{} {}", record.timestamp, record.message);
//!     }
//!
//!     handle.shutdown().await;
//! }
//! ```

pub mod activity;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod midi;
pub mod presence;
pub mod relay;
pub mod session;
pub mod transport;

pub use activity::{ActivityLog, ActivityRecord};
pub use connection::{ConnectionState, ReconnectPolicy};
pub use envelope::MidiEventEnvelope;
pub use error::{DecodeError, DeviceError, SessionError, TransportError};
pub use ids::{ParticipantId, SessionKey};
pub use midi::{MidiBackend, MidiDevice, MidiSink};
pub use presence::{PresenceMeta, PresenceSnapshot};
pub use session::{DeviceLists, Session, SessionHandle, SessionStatus};
