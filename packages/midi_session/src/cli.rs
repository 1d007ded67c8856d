use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use midi_relay::transport::memory::MemoryHub;
use midi_relay::{
    ActivityRecord, DeviceError, MidiBackend, Session, SessionHandle, SessionKey,
    SessionStatus,
};
use midi_session::{MidiConfig, RealtimeTransport, SessionConfig};

use crate::JoinArgs;

pub fn new_session_command() -> Result<()> {
    println!("{}", SessionKey::generate());
    Ok(())
}

#[cfg(feature = "midi-hardware")]
pub fn devices_command(config: &SessionConfig, json: bool) -> Result<()> {
    let (_, midi) = config.load()?;
    let lists = midi_session::hardware::list_devices(&midi.client_name);

    if json {
        println!("{}", serde_json::to_string_pretty(&lists)?);
    } else {
        print_devices("Inputs", &lists.inputs);
        print_devices("Outputs", &lists.outputs);
    }
    Ok(())
}

#[cfg(not(feature = "midi-hardware"))]
pub fn devices_command(_config: &SessionConfig, _json: bool) -> Result<()> {
    anyhow::bail!("built without MIDI hardware support (feature `midi-hardware`)")
}

#[cfg(feature = "midi-hardware")]
fn print_devices(title: &str, devices: &[midi_relay::MidiDevice]) {
    println!("{title}:");
    if devices.is_empty() {
        println!("  (none)");
    }
    for device in devices {
        if device.id == device.name {
            println!("  {}", device.name);
        } else {
            println!("  {:<30} id: {}", device.name, device.id);
        }
    }
}

#[cfg(feature = "midi-hardware")]
type DeviceCache = midi_session::hardware::DeviceCache;

#[cfg(not(feature = "midi-hardware"))]
type DeviceCache = ();

type LocalMidi = Result<(Box<dyn MidiBackend>, DeviceCache), DeviceError>;

#[cfg(feature = "midi-hardware")]
fn open_midi(config: &MidiConfig) -> LocalMidi {
    if !config.enabled {
        return Err(DeviceError::Unavailable("disabled in configuration".to_string()));
    }
    let backend = midi_session::hardware::MidirBackend::new(&config.client_name)?;
    let cache = backend.device_cache();
    let backend: Box<dyn MidiBackend> = Box::new(backend);
    Ok((backend, cache))
}

#[cfg(not(feature = "midi-hardware"))]
fn open_midi(_config: &MidiConfig) -> LocalMidi {
    Err(DeviceError::Unavailable(
        "built without MIDI hardware support".to_string(),
    ))
}

pub async fn join_command(config: &SessionConfig, args: JoinArgs) -> Result<()> {
    let (realtime, midi_config) = config.load()?;

    let key = match args.session {
        Some(key) => SessionKey::new(key).context("Session key must not be blank")?,
        None => SessionKey::generate(),
    };
    eprintln!("Session key: {key}  (share it to play together)");

    let (midi, cache) = match open_midi(&midi_config) {
        Ok((backend, cache)) => (Ok(backend), Some(cache)),
        Err(err) => (Err(err), None),
    };

    let handle = if args.offline {
        info!("offline mode: using an in-process loopback");
        Session::spawn(key, MemoryHub::new().transport(), midi)
    } else {
        if !realtime.is_configured() {
            warn!(
                "realtime backend not configured; set [realtime] url and api_key in {}",
                config.config_toml_path().display()
            );
        }
        Session::spawn(key, RealtimeTransport::new(realtime), midi)
    };

    let (backlog, mut records) = handle
        .subscribe_activity()
        .await
        .context("Session stopped before it started")?;
    for record in &backlog {
        print_record(record);
    }

    if let Some(id) = args.input.as_deref() {
        if let Err(e) = handle.select_input_device(Some(id)).await {
            eprintln!("Cannot use input {id}: {e}");
        }
    }
    if let Some(id) = args.output.as_deref() {
        if let Err(e) = handle.select_output_device(Some(id)).await {
            eprintln!("Cannot use output {id}: {e}");
        }
    }

    let watcher = CancellationToken::new();
    if let Some(cache) = cache {
        spawn_device_watcher(&handle, cache, &midi_config, watcher.clone());
    }

    eprintln!("Commands: send <hex bytes> | restart | quit");
    let mut status = handle.watch_status();
    let mut last_status = status.borrow().clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,

            record = records.recv() => match record {
                Ok(record) => print_record(&record),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "activity output fell behind"),
                Err(RecvError::Closed) => break,
            },

            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if current != last_status {
                    eprintln!("[{}]", describe_status(&current));
                    last_status = current;
                }
            }

            // Once stdin closes, keep relaying until Ctrl-C.
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !run_line(&handle, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "stdin read failed");
                    stdin_open = false;
                }
            },
        }
    }

    watcher.cancel();
    handle.shutdown().await;
    eprintln!("Left session {}", handle.key());
    Ok(())
}

#[cfg(feature = "midi-hardware")]
fn spawn_device_watcher(
    handle: &SessionHandle,
    cache: DeviceCache,
    config: &MidiConfig,
    cancel: CancellationToken,
) {
    midi_session::hardware::watch_devices(
        handle.clone(),
        cache,
        config.client_name.clone(),
        config.device_poll,
        cancel,
    );
}

#[cfg(not(feature = "midi-hardware"))]
fn spawn_device_watcher(
    _handle: &SessionHandle,
    _cache: DeviceCache,
    _config: &MidiConfig,
    _cancel: CancellationToken,
) {
}

/// Run one interactive command. False means quit.
async fn run_line(handle: &SessionHandle, line: &str) -> bool {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "" => {}
        "quit" | "exit" => return false,
        "restart" => handle.restart().await,
        "send" => match parse_hex_bytes(rest) {
            Some(bytes) => handle.submit_local_midi_event(bytes).await,
            None => eprintln!("usage: send 90 40 7f"),
        },
        other => eprintln!("unknown command: {other}"),
    }
    true
}

fn print_record(record: &ActivityRecord) {
    println!("{}  {}", record.timestamp, record.message);
}

fn describe_status(status: &SessionStatus) -> String {
    let mut text = status.state.to_string();
    if status.connected {
        text.push_str(&format!(", {} participant(s)", status.participant_count));
    }
    if status.reconnecting {
        text.push_str(&format!(", attempt {}", status.attempts_used));
    }
    if status.failed {
        text.push_str(", type `restart` to try again");
    }
    text
}

/// `"90 40 7f"` or `"90407f"` into bytes.
fn parse_hex_bytes(text: &str) -> Option<Vec<u8>> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(digits.get(i..i + 2)?, 16).ok())
        .collect()
}
