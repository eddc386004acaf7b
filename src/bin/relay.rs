//! Voice Relay Application
//!
//! Streams the default (or chosen) microphone to a speech backend over
//! WebSocket and plays back the audio the backend streams in return.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_relay::{
    audio::{device::list_devices, AudioPlayback, CpalMicrophone},
    config::{default_config_path, AppConfig},
    events::RelayEvent,
    session::StreamCoordinator,
};

/// Realtime duplex audio relay
#[derive(Parser, Debug)]
#[command(name = "voice-relay", version, about)]
struct Args {
    /// Config file (TOML); defaults to the platform config directory
    #[arg(short, long, env = "VOICE_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Backend WebSocket URL
    #[arg(short, long, env = "VOICE_RELAY_URL")]
    url: Option<String>,

    /// API key sent as a bearer token
    #[arg(long, env = "VOICE_RELAY_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Input device name
    #[arg(short, long)]
    device: Option<String>,

    #[arg(long)]
    sample_rate: Option<u32>,

    /// Capture frame duration in milliseconds
    #[arg(long)]
    frame_ms: Option<u32>,

    /// Do not reconnect after the connection drops
    #[arg(long)]
    no_reconnect: bool,

    /// Capture and send only
    #[arg(long)]
    no_playback: bool,

    /// Print audio devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Write the effective configuration to the config file and exit
    #[arg(long)]
    write_config: bool,
}

impl Args {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(url) = &self.url {
            config.relay.url = url.clone();
        }
        if let Some(key) = &self.api_key {
            config.relay.api_key = Some(key.clone());
        }
        if let Some(device) = &self.device {
            config.audio.input_device = Some(device.clone());
        }
        if let Some(rate) = self.sample_rate {
            config.audio.sample_rate = rate;
        }
        if let Some(ms) = self.frame_ms {
            config.audio.frame_duration_ms = ms;
        }
        if self.no_reconnect {
            config.relay.auto_reconnect = false;
        }
    }
}

fn print_devices() {
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}", device.name, device_type, default_marker);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
}

fn log_event(event: RelayEvent) {
    match event {
        RelayEvent::Connected => tracing::info!("Connected to backend"),
        RelayEvent::Disconnected => tracing::warn!("Disconnected from backend"),
        RelayEvent::StateChanged(state) => tracing::debug!(%state, "Connection state"),
        RelayEvent::TalkingChanged(talking) => tracing::info!(talking, "Microphone"),
        RelayEvent::AudioReceived(frame) => {
            tracing::trace!(samples = frame.len(), sequence = frame.sequence, "Audio received")
        }
        RelayEvent::TextReceived(text) => tracing::info!("Backend: {}", text),
        RelayEvent::Error { kind, message } => tracing::warn!(?kind, "{}", message),
        RelayEvent::Overrun { dropped_samples } => tracing::warn!(dropped_samples, "Playback overrun"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    if args.list_devices {
        print_devices();
        return Ok(());
    }

    let mut config = AppConfig::load_or_default(args.config.as_deref()).context("failed to load config")?;
    args.apply(&mut config);
    config.validate()?;

    if args.write_config {
        let path = args
            .config
            .clone()
            .or_else(default_config_path)
            .context("no config directory on this platform")?;
        config.save(&path)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    tracing::info!("Starting voice relay");

    let mut coordinator = StreamCoordinator::new(config.coordinator_config(), Box::new(CpalMicrophone::new()));
    tracing::info!("Input devices: {:?}", coordinator.list_microphones());

    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(event),
                Err(RecvError::Lagged(skipped)) => tracing::debug!(skipped, "Event log lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let playback = if args.no_playback {
        None
    } else {
        let mut output = AudioPlayback::new(coordinator.playback_ring(), config.audio.sample_rate);
        match output.start() {
            Ok(()) => Some(output),
            Err(e) => {
                tracing::warn!("Playback unavailable, continuing capture-only: {}", e);
                None
            }
        }
    };

    coordinator.start().await.context("failed to start stream")?;

    let stop = coordinator.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down");
            stop.request_stop();
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_millis(config.audio.frame_duration_ms as u64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_stats = Instant::now();

    tracing::info!("Streaming - press Ctrl+C to stop");

    loop {
        ticker.tick().await;
        coordinator.on_tick();
        if !coordinator.is_running() {
            break;
        }

        if let Some(error) = playback.as_ref().and_then(|p| p.check_errors()) {
            tracing::warn!("Playback error: {}", error);
        }

        // Periodic stats logging
        if last_stats.elapsed() >= Duration::from_secs(10) {
            last_stats = Instant::now();
            let stats = coordinator.transport_stats();
            let ring = coordinator.playback_ring().stats();
            tracing::info!(
                "Stats: {} sent, {} dropped, {:.1} KB out, {:.1} KB in, ring {}/{} ({} overruns, {} underruns)",
                stats.frames_sent,
                stats.frames_dropped,
                stats.bytes_sent as f64 / 1024.0,
                stats.bytes_received as f64 / 1024.0,
                ring.buffered,
                ring.capacity,
                ring.overruns,
                ring.underruns
            );
        }
    }

    drop(playback);
    tracing::info!("Voice relay stopped");
    Ok(())
}
