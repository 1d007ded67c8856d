//! Session facade.
//!
//! One actor task per joined session owns the connection manager, the relay
//! protocol, the presence tracker, the selected devices and the activity log.
//! All inputs (local MIDI, hot-plug notices, channel traffic, timers) are
//! handled on that task one at a time, so none of them need locking.
//!
//! [`SessionHandle`] is the cheap, cloneable way in. Connection state is
//! published on a watch channel and activity on a broadcast channel.

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::activity::{ActivityLog, ActivityRecord};
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionState, Driven, Incoming};
use crate::envelope::{self, MIDI_EVENT};
use crate::error::DeviceError;
use crate::ids::{ParticipantId, SessionKey};
use crate::midi::{
    InputCallback, MidiBackend, MidiDevice, MidiInputGuard, MidiSink, OutputErrorCallback,
    find_device,
};
use crate::presence::PresenceTracker;
use crate::relay::{self, Inbound, Outbound, RelayProtocol};
use crate::transport::Transport;

const COMMAND_BUFFER: usize = 256;

/// Snapshot of what the presentation layer shows about the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub connected: bool,
    pub reconnecting: bool,
    pub failed: bool,
    pub participant_count: usize,
    pub attempts_used: u32,
}

impl SessionStatus {
    fn new(state: ConnectionState, participant_count: usize, attempts_used: u32) -> Self {
        Self {
            state,
            connected: state == ConnectionState::Connected,
            reconnecting: state == ConnectionState::Reconnecting,
            failed: state == ConnectionState::Failed,
            participant_count,
            attempts_used,
        }
    }
}

/// Input and output ports currently visible to the session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceLists {
    pub inputs: Vec<MidiDevice>,
    pub outputs: Vec<MidiDevice>,
}

enum SessionCommand {
    SubmitMidi {
        bytes: Vec<u8>,
    },
    SelectOutput {
        id: Option<String>,
        respond_to: oneshot::Sender<Result<(), DeviceError>>,
    },
    SelectInput {
        id: Option<String>,
        respond_to: oneshot::Sender<Result<(), DeviceError>>,
    },
    DevicesChanged,
    /// Playback on selection `serial` failed after the send returned.
    OutputFailed {
        serial: u64,
        error: DeviceError,
    },
    Devices {
        respond_to: oneshot::Sender<DeviceLists>,
    },
    Activity {
        respond_to: oneshot::Sender<Vec<ActivityRecord>>,
    },
    SubscribeActivity {
        respond_to: oneshot::Sender<(Vec<ActivityRecord>, broadcast::Receiver<ActivityRecord>)>,
    },
    Restart,
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
    key: SessionKey,
    participant: ParticipantId,
}

impl SessionHandle {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant
    }

    /// Latest published status.
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Relay bytes produced locally. Dropped unless connected.
    pub async fn submit_local_midi_event(&self, bytes: Vec<u8>) {
        let _ = self.sender.send(SessionCommand::SubmitMidi { bytes }).await;
    }

    /// Select the output that remote events are played on. `None` clears it.
    pub async fn select_output_device(&self, id: Option<&str>) -> Result<(), DeviceError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::SelectOutput {
                id: id.map(str::to_string),
                respond_to: tx,
            })
            .await
            .map_err(|_| session_gone())?;
        rx.await.map_err(|_| session_gone())?
    }

    /// Select the input whose events are relayed. `None` disconnects it.
    pub async fn select_input_device(&self, id: Option<&str>) -> Result<(), DeviceError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::SelectInput {
                id: id.map(str::to_string),
                respond_to: tx,
            })
            .await
            .map_err(|_| session_gone())?;
        rx.await.map_err(|_| session_gone())?
    }

    /// Tell the session the set of MIDI ports changed.
    pub async fn devices_changed(&self) {
        let _ = self.sender.send(SessionCommand::DevicesChanged).await;
    }

    pub async fn devices(&self) -> DeviceLists {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .sender
            .send(SessionCommand::Devices { respond_to: tx })
            .await;
        rx.await.unwrap_or_default()
    }

    /// Every activity record so far, oldest first.
    pub async fn activity(&self) -> Vec<ActivityRecord> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .sender
            .send(SessionCommand::Activity { respond_to: tx })
            .await;
        rx.await.unwrap_or_default()
    }

    /// Every record so far plus a receiver for the ones that follow, with
    /// nothing lost or repeated in between. `None` once the session has stopped.
    pub async fn subscribe_activity(
        &self,
    ) -> Option<(Vec<ActivityRecord>, broadcast::Receiver<ActivityRecord>)> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::SubscribeActivity { respond_to: tx })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Start over with a fresh reconnect budget. The only way out of `Failed`.
    pub async fn restart(&self) {
        let _ = self.sender.send(SessionCommand::Restart).await;
    }

    /// Leave the session and stop the actor. Idempotent.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SessionCommand::Shutdown { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

fn session_gone() -> DeviceError {
    DeviceError::Unavailable("session has stopped".to_string())
}

struct SelectedOutput {
    device: MidiDevice,
    sink: Box<dyn MidiSink>,
    serial: u64,
}

struct SelectedInput {
    device: MidiDevice,
    _guard: Box<dyn MidiInputGuard>,
}

/// The session actor.
pub struct Session<T: Transport> {
    key: SessionKey,
    connection: ConnectionManager<T>,
    relay: RelayProtocol,
    presence: PresenceTracker,
    activity: ActivityLog,
    midi: Option<Box<dyn MidiBackend>>,
    output: Option<SelectedOutput>,
    output_serial: u64,
    input: Option<SelectedInput>,
    commands: mpsc::Receiver<SessionCommand>,
    self_sender: mpsc::WeakSender<SessionCommand>,
    status_tx: watch::Sender<SessionStatus>,
}

impl<T: Transport> Session<T> {
    /// Join `key` over `transport` and start connecting immediately.
    ///
    /// `midi` is the local MIDI capability. When it failed to initialise the
    /// session still relays, logs the failure once, and plays nothing.
    pub fn spawn(
        key: SessionKey,
        transport: T,
        midi: Result<Box<dyn MidiBackend>, DeviceError>,
    ) -> SessionHandle {
        Self::spawn_as(ParticipantId::generate(), key, transport, midi)
    }

    /// Like [`Session::spawn`] with a caller-chosen participant id.
    pub fn spawn_as(
        participant: ParticipantId,
        key: SessionKey,
        transport: T,
        midi: Result<Box<dyn MidiBackend>, DeviceError>,
    ) -> SessionHandle {
        let (sender, commands) = mpsc::channel(COMMAND_BUFFER);
        let (status_tx, status) =
            watch::channel(SessionStatus::new(ConnectionState::Disconnected, 0, 0));

        let mut activity = ActivityLog::new();
        let midi = match midi {
            Ok(backend) => {
                activity.push(format!(
                    "MIDI ready: {} inputs, {} outputs",
                    backend.inputs().len(),
                    backend.outputs().len()
                ));
                Some(backend)
            }
            Err(err) => {
                warn!(error = %err, "continuing without local MIDI");
                activity.push(err.to_string());
                None
            }
        };

        let session = Session {
            key: key.clone(),
            connection: ConnectionManager::new(transport, key.topic(), participant.clone()),
            relay: RelayProtocol::new(participant.clone()),
            presence: PresenceTracker::new(),
            activity,
            midi,
            output: None,
            output_serial: 0,
            input: None,
            commands,
            self_sender: sender.downgrade(),
            status_tx,
        };
        tokio::spawn(session.run());

        SessionHandle {
            sender,
            status,
            key,
            participant,
        }
    }

    async fn run(mut self) {
        info!(session = %self.key, participant = %self.relay.participant(), "joining session");
        self.activity.push(format!("Connecting to session {}", self.key));
        self.dispatch(ConnectionEvent::Start);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Shutdown { respond_to }) => {
                        self.teardown();
                        let _ = respond_to.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.teardown();
                        break;
                    }
                },

                driven = self.connection.next() => match driven {
                    Driven::Event(event) => self.dispatch(event),
                    Driven::Incoming(incoming) => self.handle_incoming(incoming),
                },
            }
        }
        info!(session = %self.key, "session stopped");
    }

    fn teardown(&mut self) {
        self.input = None;
        self.output = None;
        self.dispatch(ConnectionEvent::Stop);
    }

    fn dispatch(&mut self, event: ConnectionEvent) {
        let restart = matches!(event, ConnectionEvent::Restart);
        for line in self.connection.handle(event) {
            self.activity.push(line);
        }
        // Membership is only known while a channel is live or being recovered.
        let down = matches!(
            self.connection.state(),
            ConnectionState::Disconnected | ConnectionState::Failed
        );
        if restart || down {
            self.presence = PresenceTracker::new();
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        let next = SessionStatus::new(
            self.connection.state(),
            self.presence.count(),
            self.connection.attempts_used(),
        );
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SubmitMidi { bytes } => self.relay_local(bytes),
            SessionCommand::SelectOutput { id, respond_to } => {
                let _ = respond_to.send(self.select_output(id));
            }
            SessionCommand::SelectInput { id, respond_to } => {
                let _ = respond_to.send(self.select_input(id));
            }
            SessionCommand::DevicesChanged => self.refresh_devices(),
            SessionCommand::OutputFailed { serial, error } => self.output_failed(serial, error),
            SessionCommand::Devices { respond_to } => {
                let _ = respond_to.send(self.device_lists());
            }
            SessionCommand::Activity { respond_to } => {
                let _ = respond_to.send(self.activity.records().to_vec());
            }
            SessionCommand::SubscribeActivity { respond_to } => {
                let backlog = self.activity.records().to_vec();
                let _ = respond_to.send((backlog, self.activity.subscribe()));
            }
            SessionCommand::Restart => self.dispatch(ConnectionEvent::Restart),
            // Handled by the run loop.
            SessionCommand::Shutdown { respond_to } => {
                let _ = respond_to.send(());
            }
        }
    }

    fn relay_local(&mut self, bytes: Vec<u8>) {
        let decision = self
            .relay
            .outbound(bytes, self.connection.state(), relay::now_millis());
        match decision {
            Outbound::Broadcast(envelope) => match self.connection.broadcast(&envelope) {
                Ok(()) => self.activity.push(relay::sent_activity(envelope.payload())),
                Err(err) => debug!(error = %err, "outbound MIDI dropped"),
            },
            Outbound::Dropped => {
                debug!(state = %self.connection.state(), "outbound MIDI dropped")
            }
        }
    }

    fn handle_incoming(&mut self, incoming: Incoming) {
        match incoming {
            Incoming::Broadcast { event, payload } => {
                if event != MIDI_EVENT {
                    debug!(%event, "ignoring unknown broadcast event");
                    return;
                }
                match envelope::decode(&payload) {
                    Ok(envelope) => self.relay_remote(&envelope),
                    Err(err) => {
                        warn!(error = %err, "dropping malformed MIDI message");
                        self.activity
                            .push(format!("Dropped malformed MIDI message: {err}"));
                    }
                }
            }
            Incoming::Presence(signal) => {
                let update = self.presence.apply(signal);
                self.activity.push(update.activity);
                if update.count.is_some() {
                    self.publish_status();
                }
            }
        }
    }

    fn relay_remote(&mut self, envelope: &crate::envelope::MidiEventEnvelope) {
        match self.relay.inbound(envelope, self.output.is_some()) {
            Inbound::Loopback => {}
            Inbound::Play => {
                let Some(output) = self.output.as_mut() else {
                    return;
                };
                match output.sink.send(envelope.payload()) {
                    Ok(()) => self
                        .activity
                        .push(relay::received_activity(envelope.payload(), true)),
                    Err(err) => {
                        let serial = output.serial;
                        self.activity.push(relay::received_activity(envelope.payload(), false));
                        self.output_failed(serial, err);
                    }
                }
            }
            Inbound::LogOnly => self
                .activity
                .push(relay::received_activity(envelope.payload(), false)),
        }
    }

    /// Deselect the output if `serial` is still the current selection.
    fn output_failed(&mut self, serial: u64, err: DeviceError) {
        let Some(output) = self.output.take_if(|o| o.serial == serial) else {
            debug!(serial, error = %err, "failure from a previous output ignored");
            return;
        };
        warn!(device = %output.device.name, error = %err, "playback failed");
        self.activity.push(format!(
            "Output device {} deselected: {err}",
            output.device.name
        ));
    }

    fn device_lists(&self) -> DeviceLists {
        match &self.midi {
            Some(midi) => DeviceLists {
                inputs: midi.inputs(),
                outputs: midi.outputs(),
            },
            None => DeviceLists::default(),
        }
    }

    fn select_output(&mut self, id: Option<String>) -> Result<(), DeviceError> {
        let Some(id) = id else {
            if let Some(previous) = self.output.take() {
                self.activity
                    .push(format!("Output device cleared: {}", previous.device.name));
            }
            return Ok(());
        };
        let midi = self
            .midi
            .as_mut()
            .ok_or_else(|| DeviceError::Unavailable("no MIDI access".to_string()))?;
        let device = find_device(&midi.outputs(), &id)
            .cloned()
            .ok_or_else(|| DeviceError::NotFound(id.clone()))?;

        // Release the old port before opening, the same port may be reselected.
        self.output = None;
        self.output_serial += 1;
        let serial = self.output_serial;
        let self_sender = self.self_sender.clone();
        let on_error: OutputErrorCallback = Box::new(move |error: DeviceError| {
            let Some(sender) = self_sender.upgrade() else {
                return;
            };
            if sender
                .try_send(SessionCommand::OutputFailed { serial, error })
                .is_err()
            {
                debug!("session busy, output failure dropped");
            }
        });
        let sink = midi.open_output(&device.id, on_error)?;
        self.activity
            .push(format!("Output device selected: {}", device.name));
        self.output = Some(SelectedOutput {
            device,
            sink,
            serial,
        });
        Ok(())
    }

    fn select_input(&mut self, id: Option<String>) -> Result<(), DeviceError> {
        let Some(id) = id else {
            if let Some(previous) = self.input.take() {
                self.activity
                    .push(format!("Input device disconnected: {}", previous.device.name));
            }
            return Ok(());
        };
        let midi = self
            .midi
            .as_mut()
            .ok_or_else(|| DeviceError::Unavailable("no MIDI access".to_string()))?;
        let device = find_device(&midi.inputs(), &id)
            .cloned()
            .ok_or_else(|| DeviceError::NotFound(id.clone()))?;

        self.input = None;
        let self_sender = self.self_sender.clone();
        let callback: InputCallback = Box::new(move |bytes: &[u8]| {
            let Some(sender) = self_sender.upgrade() else {
                return;
            };
            if sender
                .try_send(SessionCommand::SubmitMidi {
                    bytes: bytes.to_vec(),
                })
                .is_err()
            {
                debug!("session busy, local MIDI event dropped");
            }
        });
        let guard = midi.open_input(&device.id, callback)?;
        self.activity
            .push(format!("Input device connected: {}", device.name));
        self.input = Some(SelectedInput {
            device,
            _guard: guard,
        });
        Ok(())
    }

    /// Re-read the port lists and drop selections whose device went away.
    fn refresh_devices(&mut self) {
        let Some(midi) = self.midi.as_ref() else {
            return;
        };
        let lists = DeviceLists {
            inputs: midi.inputs(),
            outputs: midi.outputs(),
        };
        debug!(
            inputs = lists.inputs.len(),
            outputs = lists.outputs.len(),
            "MIDI devices changed"
        );

        let output_gone = self
            .output
            .as_ref()
            .filter(|o| !lists.outputs.iter().any(|d| d.id == o.device.id))
            .map(|o| o.device.name.clone());
        if let Some(name) = output_gone {
            self.output = None;
            self.activity.push(format!("Output device removed: {name}"));
        }

        let input_gone = self
            .input
            .as_ref()
            .filter(|i| !lists.inputs.iter().any(|d| d.id == i.device.id))
            .map(|i| i.device.name.clone());
        if let Some(name) = input_gone {
            self.input = None;
            self.activity.push(format!("Input device removed: {name}"));
        }
    }
}
