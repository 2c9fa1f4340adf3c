//! ATLAS console
//!
//! Interactive session with the voice core. `voice` listens on the microphone,
//! `hybrid` takes typed input and answers aloud, `text` never touches audio.
//! Typing a line while ATLAS is talking cuts it off.

use anyhow::Context;
use atlas_voice::collaborators::JsonFileArchiver;
use atlas_voice::speaker::TranscriptHook;
use atlas_voice::{Backends, MicrophoneSource, Mode, TextInput, VoiceConfig, VoiceOrchestrator};
use clap::{Parser, ValueEnum};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Voice,
    Hybrid,
    Text,
}

impl From<ModeArg> for Mode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Voice => Mode::Voice,
            ModeArg::Hybrid => Mode::Hybrid,
            ModeArg::Text => Mode::Text,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "atlas", about = "ATLAS spoken-dialogue console", version)]
struct Cli {
    /// How you talk to ATLAS
    #[arg(long, value_enum, default_value_t = ModeArg::Hybrid)]
    mode: ModeArg,

    /// Config file (extension optional)
    #[arg(long, env = "ATLAS_CONFIG")]
    config: Option<String>,

    /// Never speak unprompted
    #[arg(long = "no-idle", default_value_t = false)]
    no_idle: bool,

    /// Print input devices and exit
    #[arg(long = "list-devices", default_value_t = false)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[atlas] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();

    if cli.list_devices {
        for name in MicrophoneSource::list_input_devices()? {
            println!("{}", name);
        }
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => VoiceConfig::load_from(path),
        None => VoiceConfig::load(),
    }
    .context("loading configuration")?;
    let mode = Mode::from(cli.mode);
    let exit_word = config
        .dialogue
        .exit_commands
        .first()
        .cloned()
        .unwrap_or_else(|| "exit".to_string());

    let mut backends = Backends::from_config(&config, mode);
    backends.collaborators.archiver =
        Arc::new(JsonFileArchiver::new(PathBuf::from(&config.storage_path).join("sessions")));

    let hook: TranscriptHook = Arc::new(|sentence: &str| {
        println!("ATLAS: {}", sentence);
        let _ = io::stdout().flush();
    });
    let mut orchestrator = VoiceOrchestrator::with_transcript_hook(config, mode, backends, Some(hook))
        .context("initializing ATLAS")?;
    let shutdown = orchestrator.shutdown_signal();
    let arbiter = orchestrator.arbiter();

    if mode != Mode::Voice {
        spawn_stdin_reader(orchestrator.text_input(), exit_word);
        println!("Type your message and press ENTER. Type 'exit' or 'sleep' to shut down.");
    } else {
        println!("Listening. Press Ctrl-C to shut down.");
    }

    let idle = !cli.no_idle;
    let session = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        orchestrator.start(idle)?;
        orchestrator.run();
        orchestrator.stop();
        Ok(())
    });
    tokio::pin!(session);

    tokio::select! {
        res = &mut session => {
            res.context("session thread")??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("CTRL-C received; shutting down");
            shutdown.raise();
            arbiter.explicit_interrupt();
            session.await.context("session thread")??;
        }
    }

    tracing::info!("ATLAS offline");
    Ok(())
}

/// Reads stdin on its own thread. End of input counts as an exit command.
fn spawn_stdin_reader(input: TextInput, exit_word: String) {
    let spawned = std::thread::Builder::new()
        .name("atlas-stdin".into())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                if !input.submit(line) {
                    return;
                }
            }
            input.submit(exit_word);
        });
    if let Err(e) = spawned {
        tracing::error!(error = %e, "could not start stdin reader");
    }
}
