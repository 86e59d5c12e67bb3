//! Depthcam Daemon - Main entry point
//!
//! Tracks attached depth cameras, follows hot-plug events and keeps the
//! capture mode selection valid as devices come and go.

mod config;
mod state;

use anyhow::Result;
use clap::Parser;
use depthcam_core::Menus;
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "depthcam")]
#[command(about = "Depth camera registry and capture mode selection daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "depthcam.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Print the device list and resolved selection, then exit
    #[arg(long)]
    list_once: bool,

    /// Print JSON instead of text (with --list-once)
    #[arg(long)]
    json: bool,

    /// Write an example configuration file and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Depthcam v{}", env!("CARGO_PKG_VERSION"));

    if args.init_config {
        config::save_default_config(&args.config)?;
        return Ok(());
    }

    let config = config::load_config(&args.config)?;
    info!(
        library_dir = %config.sdk.library_dir,
        poll_ms = config.sdk.poll_interval_ms,
        "Configuration loaded"
    );

    let state = state::AppState::new(config.clone()).await?;

    if args.list_once {
        state.poll().await?;
        let menus = state.menus().await.unwrap_or_default();
        if args.json {
            let report = json!({
                "devices": state.devices().await?,
                "menus": menus,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_menus(&menus);
        }
        return Ok(());
    }

    // Daemon mode - play the hot-plug script and keep the menus current
    tokio::spawn(state.clone().run_script());

    let mut watcher = config::ConfigWatcher::new(&args.config);
    let mut events = state.registry.subscribe();
    let mut ticker = interval(Duration::from_millis(config.sdk.poll_interval_ms.max(1)));

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if watcher.changed() {
                    apply_config_change(&state, watcher.path()).await;
                }
                if let Some(menus) = state.poll().await? {
                    info!(
                        devices = menus.devices.len(),
                        device = ?menus.selection.device,
                        sensor = ?menus.selection.sensor,
                        fps = ?menus.selection.fps,
                        resolution = ?menus.selection.resolution,
                        pixel_format = ?menus.selection.pixel_format,
                        "Capture mode menus updated"
                    );
                }
            }
            Ok(event) = events.recv() => {
                debug!(?event, "Registry event");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Treat a config edit like the host's parameter change and reload action
async fn apply_config_change(state: &state::AppState, path: &Path) {
    match config::load_config(path) {
        Ok(updated) => {
            state.select(updated.selection).await;
            match state.reload().await {
                Ok(added) => info!(added, "Reloaded devices after configuration change"),
                Err(e) => warn!(error = %e, "Reload failed"),
            }
        }
        Err(e) => warn!(path = %path.display(), error = %e, "Ignoring unreadable configuration"),
    }
}

fn print_menus(menus: &Menus) {
    println!("Tracked {} devices:", menus.devices.len());
    for device in &menus.devices {
        println!("  - {}", device.label);
    }

    let selection = &menus.selection;
    if let Some(device) = &selection.device {
        println!("Selected: {}", device);
        let levels = [
            ("Sensor", &selection.sensor),
            ("FPS", &selection.fps),
            ("Resolution", &selection.resolution),
            ("Pixel Format", &selection.pixel_format),
        ];
        for (name, value) in levels {
            if let Some(value) = value {
                println!("    {}: {}", name, value);
            }
        }
    }
}
