use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [realtime]
//                    url = "https://project.supabase.co"
//
//   env var:         MIDI_SESSION_REALTIME__URL=...   (double underscore = nesting)
//
//   hosted-backend:  SUPABASE_URL / SUPABASE_ANON_KEY are honoured as a
//                    fallback below the MIDI_SESSION_* variables.

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub realtime: RealtimeFileConfig,
    #[serde(default)]
    pub midi: MidiFileConfig,
}

/// Backend tunables (lives under `[realtime]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealtimeFileConfig {
    /// Project URL of the hosted backend. Empty means not configured.
    #[serde(default)]
    pub url: String,
    /// Public (anon) API key. Empty means not configured.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_join_timeout_secs")]
    pub join_timeout_secs: u64,
    /// Socket-level keepalive, separate from the session's channel heartbeat.
    #[serde(default = "default_socket_heartbeat_secs")]
    pub socket_heartbeat_secs: u64,
}

impl Default for RealtimeFileConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            join_timeout_secs: default_join_timeout_secs(),
            socket_heartbeat_secs: default_socket_heartbeat_secs(),
        }
    }
}

/// Local MIDI tunables (lives under `[midi]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MidiFileConfig {
    #[serde(default = "default_midi_enabled")]
    pub enabled: bool,
    /// Client name shown to other MIDI software.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// How often the port lists are re-read to notice hot-plugging.
    #[serde(default = "default_device_poll_ms")]
    pub device_poll_ms: u64,
}

impl Default for MidiFileConfig {
    fn default() -> Self {
        Self {
            enabled: default_midi_enabled(),
            client_name: default_client_name(),
            device_poll_ms: default_device_poll_ms(),
        }
    }
}

fn default_join_timeout_secs() -> u64 {
    10
}
fn default_socket_heartbeat_secs() -> u64 {
    25
}
fn default_midi_enabled() -> bool {
    true
}
fn default_client_name() -> String {
    "midi-session".to_string()
}
fn default_device_poll_ms() -> u64 {
    2000
}

/// Build a figment that layers: defaults → config.toml → SUPABASE_* → MIDI_SESSION_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `MIDI_SESSION_REALTIME__API_KEY=...`  →  `realtime.api_key = "..."`
///   `MIDI_SESSION_MIDI__ENABLED=false`    →  `midi.enabled = false`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let hosted_backend = Env::raw()
        .only(&["SUPABASE_URL", "SUPABASE_ANON_KEY"])
        .map(|key| {
            if key.as_str().eq_ignore_ascii_case("SUPABASE_URL") {
                "realtime.url".into()
            } else {
                "realtime.api_key".into()
            }
        });

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(hosted_backend)
        .merge(Env::prefixed("MIDI_SESSION_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Resolved backend settings (runtime view).
#[derive(Clone, Debug)]
pub struct RealtimeConfig {
    pub url: String,
    pub api_key: String,
    pub join_timeout: Duration,
    pub socket_heartbeat: Duration,
}

impl RealtimeConfig {
    pub fn from_file(fc: &RealtimeFileConfig) -> Self {
        Self {
            url: fc.url.trim().to_string(),
            api_key: fc.api_key.trim().to_string(),
            join_timeout: Duration::from_secs(fc.join_timeout_secs.max(1)),
            socket_heartbeat: Duration::from_secs(fc.socket_heartbeat_secs.max(1)),
        }
    }

    /// Both the URL and the key are present.
    pub fn is_configured(&self) -> bool {
        !self.url.is_empty() && !self.api_key.is_empty()
    }
}

/// Resolved MIDI settings (runtime view).
#[derive(Clone, Debug)]
pub struct MidiConfig {
    pub enabled: bool,
    pub client_name: String,
    pub device_poll: Duration,
}

impl MidiConfig {
    pub fn from_file(fc: &MidiFileConfig) -> Self {
        let client_name = if fc.client_name.trim().is_empty() {
            default_client_name()
        } else {
            fc.client_name.trim().to_string()
        };
        Self {
            enabled: fc.enabled,
            client_name,
            device_poll: Duration::from_millis(fc.device_poll_ms.max(100)),
        }
    }
}

// =============================================================================
// Directory layout config (not tunable via figment — derived from --data-dir)
// =============================================================================

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub data_dir: PathBuf,
}

impl SessionConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".midi-session"),
        };

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

        info!("Data directory: {}", data_dir.display());

        Ok(Self { data_dir })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    /// Load and resolve the layered configuration for this data directory.
    pub fn load(&self) -> Result<(RealtimeConfig, MidiConfig)> {
        let fc: FileConfig = load_config(&self.data_dir)
            .extract()
            .context("Invalid configuration")?;
        Ok((
            RealtimeConfig::from_file(&fc.realtime),
            MidiConfig::from_file(&fc.midi),
        ))
    }
}
