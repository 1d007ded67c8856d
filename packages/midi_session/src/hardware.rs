//! Local MIDI hardware through midir.
//!
//! Platform MIDI connections are not safe to move between threads on every
//! backend, so one dedicated thread owns all of them. [`MidirBackend`],
//! its sinks and its input guards only talk to that thread over a
//! crossbeam channel. The thread exits once every handle is dropped.
//!
//! Nothing here waits on the device from the caller's thread except opening
//! a port. Sends are queued and their failures come back through the
//! output's error callback. Port lists are served from a [`DeviceCache`]
//! that [`watch_devices`] keeps current.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use midi_relay::midi::{InputCallback, MidiInputGuard, OutputErrorCallback};
use midi_relay::{DeviceError, DeviceLists, MidiBackend, MidiDevice, MidiSink, SessionHandle};

const COMMAND_BUFFER: usize = 256;

/// How long opening a port may take before the thread is considered stuck.
const OPEN_TIMEOUT: Duration = Duration::from_secs(2);

type Reply = Sender<Result<(), DeviceError>>;

enum HardwareCommand {
    OpenInput {
        id: String,
        handle: u64,
        on_message: InputCallback,
        reply: Reply,
    },
    OpenOutput {
        id: String,
        handle: u64,
        on_error: OutputErrorCallback,
        reply: Reply,
    },
    CloseInput(u64),
    CloseOutput(u64),
    Send {
        handle: u64,
        bytes: Vec<u8>,
    },
}

/// Last known port lists, shared between the backend and the device watcher.
#[derive(Clone)]
pub struct DeviceCache {
    lists: Arc<ArcSwap<DeviceLists>>,
}

impl DeviceCache {
    pub fn new(lists: DeviceLists) -> Self {
        Self {
            lists: Arc::new(ArcSwap::from_pointee(lists)),
        }
    }

    pub fn load(&self) -> Arc<DeviceLists> {
        self.lists.load_full()
    }

    /// Store `lists`. True when they differ from what was cached.
    pub fn replace(&self, lists: DeviceLists) -> bool {
        if *self.lists.load_full() == lists {
            return false;
        }
        self.lists.store(Arc::new(lists));
        true
    }
}

/// MIDI access backed by the platform's MIDI API.
pub struct MidirBackend {
    commands: Sender<HardwareCommand>,
    devices: DeviceCache,
    next_handle: u64,
}

impl MidirBackend {
    /// Open platform MIDI once to check access, take a first look at the ports and start the
    /// hardware thread.
    pub fn new(client_name: &str) -> Result<Self, DeviceError> {
        MidiInput::new(client_name).map_err(|e| DeviceError::Unavailable(e.to_string()))?;

        let (commands, receiver) = bounded(COMMAND_BUFFER);
        let name = client_name.to_string();
        thread::Builder::new()
            .name("midi-hardware".to_string())
            .spawn(move || hardware_thread(name, receiver))
            .map_err(|e| DeviceError::Unavailable(format!("cannot start MIDI thread: {e}")))?;

        info!(client_name, "MIDI hardware ready");
        Ok(Self {
            commands,
            devices: DeviceCache::new(list_devices(client_name)),
            next_handle: 0,
        })
    }

    /// The cache this backend enumerates from. Hand it to [`watch_devices`].
    pub fn device_cache(&self) -> DeviceCache {
        self.devices.clone()
    }

    fn allocate(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

impl MidiBackend for MidirBackend {
    fn inputs(&self) -> Vec<MidiDevice> {
        self.devices.load().inputs.clone()
    }

    fn outputs(&self) -> Vec<MidiDevice> {
        self.devices.load().outputs.clone()
    }

    fn open_input(
        &mut self,
        id: &str,
        on_message: InputCallback,
    ) -> Result<Box<dyn MidiInputGuard>, DeviceError> {
        let handle = self.allocate();
        request(&self.commands, |reply| HardwareCommand::OpenInput {
            id: id.to_string(),
            handle,
            on_message,
            reply,
        })?;
        Ok(Box::new(MidirInputGuard {
            handle,
            commands: self.commands.clone(),
        }))
    }

    fn open_output(
        &mut self,
        id: &str,
        on_error: OutputErrorCallback,
    ) -> Result<Box<dyn MidiSink>, DeviceError> {
        let handle = self.allocate();
        request(&self.commands, |reply| HardwareCommand::OpenOutput {
            id: id.to_string(),
            handle,
            on_error,
            reply,
        })?;
        Ok(Box::new(MidirSink {
            handle,
            commands: self.commands.clone(),
        }))
    }
}

struct MidirSink {
    handle: u64,
    commands: Sender<HardwareCommand>,
}

impl MidiSink for MidirSink {
    fn send(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        let command = HardwareCommand::Send {
            handle: self.handle,
            bytes: bytes.to_vec(),
        };
        match self.commands.try_send(command) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!(handle = self.handle, "MIDI output queue full, message dropped");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(thread_gone()),
        }
    }
}

impl Drop for MidirSink {
    fn drop(&mut self) {
        let _ = self.commands.send(HardwareCommand::CloseOutput(self.handle));
    }
}

struct MidirInputGuard {
    handle: u64,
    commands: Sender<HardwareCommand>,
}

impl MidiInputGuard for MidirInputGuard {}

impl Drop for MidirInputGuard {
    fn drop(&mut self) {
        let _ = self.commands.send(HardwareCommand::CloseInput(self.handle));
    }
}

fn thread_gone() -> DeviceError {
    DeviceError::Unavailable("MIDI thread stopped".to_string())
}

/// Send an open command and wait, bounded, for the thread's answer.
fn request(
    commands: &Sender<HardwareCommand>,
    build: impl FnOnce(Reply) -> HardwareCommand,
) -> Result<(), DeviceError> {
    let (reply, answer) = bounded(1);
    commands
        .send_timeout(build(reply), OPEN_TIMEOUT)
        .map_err(|_| thread_gone())?;
    answer.recv_timeout(OPEN_TIMEOUT).map_err(|_| {
        DeviceError::Unavailable("MIDI thread did not answer".to_string())
    })?
}

struct OpenOutput {
    conn: MidiOutputConnection,
    on_error: OutputErrorCallback,
}

fn hardware_thread(client_name: String, receiver: Receiver<HardwareCommand>) {
    let mut inputs: HashMap<u64, MidiInputConnection<()>> = HashMap::new();
    let mut outputs: HashMap<u64, OpenOutput> = HashMap::new();

    // Runs until every sender (backend, sinks, guards) is gone.
    while let Ok(command) = receiver.recv() {
        match command {
            HardwareCommand::OpenInput {
                id,
                handle,
                on_message,
                reply,
            } => {
                let result = connect_input(&client_name, &id, on_message).map(|conn| {
                    inputs.insert(handle, conn);
                });
                let _ = reply.send(result);
            }
            HardwareCommand::OpenOutput {
                id,
                handle,
                on_error,
                reply,
            } => {
                let result = connect_output(&client_name, &id).map(|conn| {
                    outputs.insert(handle, OpenOutput { conn, on_error });
                });
                let _ = reply.send(result);
            }
            HardwareCommand::CloseInput(handle) => {
                if let Some(conn) = inputs.remove(&handle) {
                    conn.close();
                    debug!(handle, "MIDI input closed");
                }
            }
            HardwareCommand::CloseOutput(handle) => {
                if let Some(output) = outputs.remove(&handle) {
                    output.conn.close();
                    debug!(handle, "MIDI output closed");
                }
            }
            HardwareCommand::Send { handle, bytes } => {
                // Sends racing a close land here after the sink is gone.
                let Some(output) = outputs.get_mut(&handle) else {
                    continue;
                };
                if let Err(e) = output.conn.send(&bytes) {
                    (output.on_error)(DeviceError::SendFailed(e.to_string()));
                }
            }
        }
    }
    debug!("MIDI hardware thread exiting");
}

fn connect_input(
    client_name: &str,
    id: &str,
    mut on_message: InputCallback,
) -> Result<MidiInputConnection<()>, DeviceError> {
    let mut midi_in =
        MidiInput::new(client_name).map_err(|e| DeviceError::Unavailable(e.to_string()))?;
    // Sysex, timing and active sensing are relayed like everything else.
    midi_in.ignore(Ignore::None);

    let ports = midi_in.ports();
    let names = ports.iter().map(|p| midi_in.port_name(p).unwrap_or_default());
    let index = port_ids(names)
        .iter()
        .position(|d| d.id == id)
        .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;

    midi_in
        .connect(
            &ports[index],
            &format!("{client_name}-in"),
            move |_stamp, message, _| on_message(message),
            (),
        )
        .map_err(|e| DeviceError::Unavailable(e.to_string()))
}

fn connect_output(client_name: &str, id: &str) -> Result<MidiOutputConnection, DeviceError> {
    let midi_out =
        MidiOutput::new(client_name).map_err(|e| DeviceError::Unavailable(e.to_string()))?;

    let ports = midi_out.ports();
    let names = ports.iter().map(|p| midi_out.port_name(p).unwrap_or_default());
    let index = port_ids(names)
        .iter()
        .position(|d| d.id == id)
        .ok_or_else(|| DeviceError::NotFound(id.to_string()))?;

    midi_out
        .connect(&ports[index], &format!("{client_name}-out"))
        .map_err(|e| DeviceError::Unavailable(e.to_string()))
}

/// Enumerate the ports now. Empty lists if platform MIDI cannot be opened.
pub fn list_devices(client_name: &str) -> DeviceLists {
    let inputs = match MidiInput::new(client_name) {
        Ok(midi_in) => port_ids(
            midi_in
                .ports()
                .iter()
                .map(|p| midi_in.port_name(p).unwrap_or_default()),
        ),
        Err(e) => {
            warn!(error = %e, "cannot enumerate MIDI inputs");
            Vec::new()
        }
    };
    let outputs = match MidiOutput::new(client_name) {
        Ok(midi_out) => port_ids(
            midi_out
                .ports()
                .iter()
                .map(|p| midi_out.port_name(p).unwrap_or_default()),
        ),
        Err(e) => {
            warn!(error = %e, "cannot enumerate MIDI outputs");
            Vec::new()
        }
    };
    DeviceLists { inputs, outputs }
}

/// Assign ids to port names. Ids are the names, with repeats numbered
/// `"Name #2"`, `"Name #3"` in enumeration order.
pub fn port_ids(names: impl IntoIterator<Item = String>) -> Vec<MidiDevice> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    names
        .into_iter()
        .map(|name| {
            let count = seen.entry(name.clone()).or_insert(0);
            *count += 1;
            let id = if *count == 1 {
                name.clone()
            } else {
                format!("{name} #{count}")
            };
            MidiDevice::new(id, name)
        })
        .collect()
}

/// Poll the port lists off the async threads, refresh `cache` and tell the
/// session when they change.
pub fn watch_devices(
    handle: SessionHandle,
    cache: DeviceCache,
    client_name: String,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let name = client_name.clone();
                    let current = match tokio::task::spawn_blocking(move || list_devices(&name)).await {
                        Ok(current) => current,
                        Err(e) => {
                            warn!(error = %e, "device poll failed");
                            continue;
                        }
                    };
                    let (inputs, outputs) = (current.inputs.len(), current.outputs.len());
                    if cache.replace(current) {
                        debug!(inputs, outputs, "MIDI devices changed");
                        handle.devices_changed().await;
                    }
                }
            }
        }
    })
}
