//! Live Voice CLI
//!
//! Opens one voice session on the default microphone and speaker against Gemini Live.
//! Type `m` + Enter to toggle mute, `q` + Enter (or Ctrl+C) to hang up.
//! `--list-devices` prints the available input devices and exits; `--print-config` prints
//! the effective configuration (API key omitted) and exits.

use anyhow::{bail, Context};
use live_voice::{
    CpalBackend, GeminiConnector, LiveVoiceConfig, NavigateHandler, SessionStatus,
    ToolCallRouter, VoiceSession,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often the transcript and level are checked for display.
const DISPLAY_TICK_MS: u64 = 250;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[live-voice] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if std::env::args().any(|a| a == "--list-devices") {
        for name in CpalBackend::list_input_devices().context("listing input devices")? {
            println!("{}", name);
        }
        return Ok(());
    }

    let config = LiveVoiceConfig::load().context("loading live voice config")?;
    if std::env::args().any(|a| a == "--print-config") {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }
    let backend = CpalBackend::new(config.audio.input_device.clone());

    let router = ToolCallRouter::new().with_handler(Arc::new(NavigateHandler::new(Arc::new(
        |destination: String| {
            tracing::info!(destination = %destination, "Navigation requested");
        },
    ))));

    let mut session = VoiceSession::open(
        config,
        Arc::new(GeminiConnector::new()),
        Arc::new(backend),
        router,
    )
    .context("opening voice session")?;

    let mut status = session.subscribe_status();
    let mut commands = BufReader::new(tokio::io::stdin()).lines();
    let mut display = tokio::time::interval(Duration::from_millis(DISPLAY_TICK_MS));
    let mut last_transcript = String::new();
    let mut stdin_open = true;

    loop {
        if session.status().is_terminal() {
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; hanging up");
                session.close();
            }
            changed = status.changed() => {
                let current = *status.borrow_and_update();
                if changed.is_err() || current.is_terminal() {
                    break;
                }
                if current == SessionStatus::Active {
                    println!("Connected. Speak now (m = mute, q = hang up).");
                }
            }
            line = commands.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match line.trim() {
                    "m" => {
                        let muted = session.toggle_mute();
                        println!("{}", if muted { "Muted" } else { "Unmuted" });
                    }
                    "q" => session.close(),
                    "" => {}
                    other => println!("Unknown command: {}", other),
                },
                // stdin closed; keep running until Ctrl+C.
                Ok(None) => stdin_open = false,
                Err(e) => tracing::warn!(error = %e, "stdin read failed"),
            },
            _ = display.tick() => {
                let transcript = session.transcript();
                if transcript != last_transcript {
                    println!("» {}", transcript);
                    last_transcript = transcript;
                }
                tracing::trace!(level = session.audio_level(), "Input level");
            }
        }
    }

    match session.wait().await {
        SessionStatus::Error => bail!(
            "session failed: {}",
            session.error().unwrap_or_else(|| "unknown error".to_string())
        ),
        final_status => {
            tracing::info!(status = %final_status, "Session ended");
            Ok(())
        }
    }
}
