//! xbeed - Radio Link Arbiter Daemon
//!
//! Single owner of the shared robot radio:
//! - Claim/release admission for AI, tester and firmware-upload clients
//! - Short address and telemetry slot leasing
//! - Bring-up/bring-down handshake sequencing
//! - Fair scheduling of one-shot requests against the drive broadcast

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use xbeed::{serve_clients, Daemon, DaemonConfig, Event, GatewayLink};

#[derive(Parser)]
#[command(name = "xbeed")]
#[command(about = "Radio link arbiter daemon for the robot fleet")]
#[command(version)]
struct Args {
    /// Path to the daemon configuration file
    #[arg(short, long)]
    config: Option<String>,
}

impl Args {
    fn get_config_path(&self) -> String {
        self.config
            .clone()
            .or_else(|| std::env::var("XBEED_CONFIG_PATH").ok())
            .unwrap_or_else(|| "config/xbeed.yaml".to_string())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = args.get_config_path();

    // Initialize tracing subscriber
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    info!("xbeed radio link arbiter");
    info!("{}", "=".repeat(50));
    info!("Using config: {}", config_path);

    let config = DaemonConfig::load_from_path(&config_path)
        .context("Failed to load daemon configuration")?;

    // All traffic fans into one channel; the daemon drains it on one task.
    let (events_tx, events_rx) = mpsc::unbounded_channel::<Event>();

    let (link_tx, mut link_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let link = match GatewayLink::connect(&config.link.host, config.link.port, link_tx).await {
        Ok(link) => link,
        Err(e) => {
            error!("Radio gateway unavailable: {}", e);
            error!("Make sure:");
            error!("   - The gateway is running at {}:{}", config.link.host, config.link.port);
            error!("   - The serial device is attached");
            return Err(e.into());
        }
    };

    // Forward inbound link packets into the event stream.
    let link_events = events_tx.clone();
    tokio::spawn(async move {
        while let Some(packet) = link_rx.recv().await {
            if link_events.send(Event::LinkPacket(packet)).is_err() {
                break;
            }
        }
    });

    let mut daemon =
        Daemon::new(&config, Box::new(link)).context("Failed to initialize daemon")?;

    serve_clients(&config.socket_path, events_tx)
        .await
        .context("Failed to open client socket")?;

    info!("Daemon ready");
    let result = daemon.run(events_rx).await;

    // The socket file is ours; leave nothing behind.
    let _ = std::fs::remove_file(&config.socket_path);

    match result {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Daemon failed: {}", e);
            Err(e.into())
        }
    }
}
