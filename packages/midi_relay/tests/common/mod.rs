#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use midi_relay::midi::{InputCallback, MidiInputGuard, OutputErrorCallback};
use midi_relay::{
    ActivityRecord, DeviceError, MidiBackend, MidiDevice, MidiSink, SessionHandle, SessionStatus,
};

#[derive(Default)]
struct FakeMidiInner {
    inputs: Vec<MidiDevice>,
    outputs: Vec<MidiDevice>,
    played: Vec<(String, Vec<u8>)>,
    callbacks: HashMap<String, InputCallback>,
    output_errors: HashMap<String, OutputErrorCallback>,
    broken_outputs: Vec<String>,
}

/// Scriptable MIDI backend. Clones share state, so a test keeps one clone
/// to press keys and inspect playback while the session owns the other.
#[derive(Clone, Default)]
pub struct FakeMidi {
    inner: Arc<Mutex<FakeMidiInner>>,
}

impl FakeMidi {
    pub fn new(inputs: &[(&str, &str)], outputs: &[(&str, &str)]) -> Self {
        let midi = Self::default();
        {
            let mut inner = midi.lock();
            inner.inputs = inputs.iter().map(|(id, name)| MidiDevice::new(*id, *name)).collect();
            inner.outputs = outputs.iter().map(|(id, name)| MidiDevice::new(*id, *name)).collect();
        }
        midi
    }

    fn lock(&self) -> MutexGuard<'_, FakeMidiInner> {
        self.inner.lock().unwrap()
    }

    pub fn backend(&self) -> Result<Box<dyn MidiBackend>, DeviceError> {
        Ok(Box::new(self.clone()))
    }

    /// Everything played on any output, in order.
    pub fn played(&self) -> Vec<Vec<u8>> {
        self.lock().played.iter().map(|(_, bytes)| bytes.clone()).collect()
    }

    /// Emit bytes from an opened input, as the hardware would.
    pub fn press(&self, input_id: &str, bytes: &[u8]) {
        let callback = self.lock().callbacks.remove(input_id);
        if let Some(mut callback) = callback {
            callback(bytes);
            self.lock().callbacks.insert(input_id.to_string(), callback);
        }
    }

    pub fn input_open(&self, input_id: &str) -> bool {
        self.lock().callbacks.contains_key(input_id)
    }

    pub fn unplug_output(&self, id: &str) {
        self.lock().outputs.retain(|d| d.id != id);
    }

    pub fn unplug_input(&self, id: &str) {
        self.lock().inputs.retain(|d| d.id != id);
    }

    /// Make every later send to `id` fail.
    pub fn break_output(&self, id: &str) {
        self.lock().broken_outputs.push(id.to_string());
    }

    /// Report a playback failure on `id` the way a device thread would,
    /// after the send that caused it already returned.
    pub fn fail_output_later(&self, id: &str, reason: &str) {
        let callback = self.lock().output_errors.remove(id);
        if let Some(mut callback) = callback {
            callback(DeviceError::SendFailed(reason.to_string()));
            self.lock().output_errors.insert(id.to_string(), callback);
        }
    }
}

impl MidiBackend for FakeMidi {
    fn inputs(&self) -> Vec<MidiDevice> {
        self.lock().inputs.clone()
    }

    fn outputs(&self) -> Vec<MidiDevice> {
        self.lock().outputs.clone()
    }

    fn open_input(
        &mut self,
        id: &str,
        on_message: InputCallback,
    ) -> Result<Box<dyn MidiInputGuard>, DeviceError> {
        let mut inner = self.lock();
        if !inner.inputs.iter().any(|d| d.id == id) {
            return Err(DeviceError::NotFound(id.to_string()));
        }
        inner.callbacks.insert(id.to_string(), on_message);
        Ok(Box::new(FakeInputGuard {
            midi: self.clone(),
            id: id.to_string(),
        }))
    }

    fn open_output(
        &mut self,
        id: &str,
        on_error: OutputErrorCallback,
    ) -> Result<Box<dyn MidiSink>, DeviceError> {
        let mut inner = self.lock();
        if !inner.outputs.iter().any(|d| d.id == id) {
            return Err(DeviceError::NotFound(id.to_string()));
        }
        inner.output_errors.insert(id.to_string(), on_error);
        Ok(Box::new(FakeSink {
            midi: self.clone(),
            id: id.to_string(),
        }))
    }
}

struct FakeSink {
    midi: FakeMidi,
    id: String,
}

impl MidiSink for FakeSink {
    fn send(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        let mut inner = self.midi.lock();
        if inner.broken_outputs.contains(&self.id) {
            return Err(DeviceError::SendFailed(format!("{} is gone", self.id)));
        }
        inner.played.push((self.id.clone(), bytes.to_vec()));
        Ok(())
    }
}

struct FakeInputGuard {
    midi: FakeMidi,
    id: String,
}

impl MidiInputGuard for FakeInputGuard {}

impl Drop for FakeInputGuard {
    fn drop(&mut self) {
        self.midi.lock().callbacks.remove(&self.id);
    }
}

pub fn no_midi() -> Result<Box<dyn MidiBackend>, DeviceError> {
    Err(DeviceError::Unavailable("not supported here".to_string()))
}

/// Wait until the published status satisfies `pred`.
pub async fn wait_status(
    handle: &SessionHandle,
    pred: impl FnMut(&SessionStatus) -> bool,
) -> SessionStatus {
    let mut status = handle.watch_status();
    let seen = tokio::time::timeout(Duration::from_secs(120), status.wait_for(pred))
        .await
        .expect("status never reached")
        .expect("session stopped");
    seen.clone()
}

pub async fn wait_connected(handle: &SessionHandle) {
    wait_status(handle, |s| s.connected).await;
}

/// Poll the activity log until some record satisfies `pred`.
pub async fn wait_activity(
    handle: &SessionHandle,
    mut pred: impl FnMut(&ActivityRecord) -> bool,
) -> Vec<ActivityRecord> {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            let records = handle.activity().await;
            if records.iter().any(&mut pred) {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("activity never appeared")
}

pub fn count_matching(records: &[ActivityRecord], needle: &str) -> usize {
    records.iter().filter(|r| r.message.contains(needle)).count()
}
