use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::prelude::*;

use midi_session::SessionConfig;

mod cli;

#[derive(Parser)]
#[command(name = "midi-session")]
#[command(about = "Play MIDI together over a shared session")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.midi-session)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List local MIDI inputs and outputs
    Devices(DevicesArgs),

    /// Print a fresh session key to share
    NewSession,

    /// Join a session and relay MIDI until Ctrl-C
    Join(JoinArgs),
}

#[derive(Parser)]
struct DevicesArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
pub(crate) struct JoinArgs {
    /// Session key to join (default: generate a new one)
    pub session: Option<String>,

    /// Input device to relay from, by id or name
    #[arg(short, long)]
    pub input: Option<String>,

    /// Output device to play remote events on, by id or name
    #[arg(short, long)]
    pub output: Option<String>,

    /// Use an in-process loopback instead of the realtime backend
    #[arg(long)]
    pub offline: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

fn init_logging(debug: bool) {
    let default_directive = if debug {
        "midi_session=debug,midi_relay=debug,warn"
    } else {
        "midi_session=info,midi_relay=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    // Activity goes to stdout; logs stay on stderr.
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // wss needs a process-wide TLS provider; a second install is harmless.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let debug = matches!(&cli.command, Commands::Join(args) if args.debug);
    init_logging(debug);

    let config = SessionConfig::new(cli.data_dir.clone())?;

    match cli.command {
        Commands::Devices(args) => cli::devices_command(&config, args.json),
        Commands::NewSession => cli::new_session_command(),
        Commands::Join(args) => cli::join_command(&config, args).await,
    }
}
