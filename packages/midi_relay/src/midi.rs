//! Local MIDI capability, as seen by the session.
//!
//! The session never polls hardware. It reacts to input callbacks and
//! hot-plug notifications and calls [`MidiSink::send`] for playback.
//! Enumeration and sending must return without waiting on the device.

use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

/// An input or output port with a stable id and a display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MidiDevice {
    pub id: String,
    pub name: String,
}

impl MidiDevice {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Callback receiving raw bytes from an opened input.
pub type InputCallback = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// Callback told about playback failures found after `send` returned.
pub type OutputErrorCallback = Box<dyn FnMut(DeviceError) + Send + 'static>;

/// Playback side of an opened output device.
pub trait MidiSink: Send {
    /// Queue bytes for playback. An error here means the output is unusable;
    /// failures found later go to the output's [`OutputErrorCallback`].
    fn send(&mut self, bytes: &[u8]) -> Result<(), DeviceError>;
}

/// Keeps an input connection open. Dropping it disconnects the input.
pub trait MidiInputGuard: Send {}

/// Platform MIDI access: enumeration plus opening ports.
pub trait MidiBackend: Send {
    fn inputs(&self) -> Vec<MidiDevice>;

    fn outputs(&self) -> Vec<MidiDevice>;

    fn open_input(
        &mut self,
        id: &str,
        on_message: InputCallback,
    ) -> Result<Box<dyn MidiInputGuard>, DeviceError>;

    fn open_output(
        &mut self,
        id: &str,
        on_error: OutputErrorCallback,
    ) -> Result<Box<dyn MidiSink>, DeviceError>;
}

/// Find a device by exact id, falling back to a case-insensitive name match.
pub fn find_device<'a>(devices: &'a [MidiDevice], id_or_name: &str) -> Option<&'a MidiDevice> {
    devices
        .iter()
        .find(|d| d.id == id_or_name)
        .or_else(|| {
            devices
                .iter()
                .find(|d| d.name.eq_ignore_ascii_case(id_or_name))
        })
}
