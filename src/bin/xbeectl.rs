//! xbeectl - xbeed control client
//!
//! Command-line interface for poking a running xbeed daemon: claim and
//! release robots, watch the meta event stream, and drive a claimed robot
//! with constant setpoints through the shared telemetry block.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use xbeed::{
    now_monotonic_ns, wire, FeedbackData, MetaPacket, RunData, SharedTelemetryBlock,
};

#[derive(Parser)]
#[command(name = "xbeectl")]
#[command(about = "Send claim/release commands to a running xbeed daemon")]
#[command(version)]
struct Args {
    /// Daemon socket path
    #[arg(short, long, default_value = "/tmp/xbeed.sock")]
    socket: String,

    /// Shared telemetry block name (for the drive subcommand)
    #[arg(long, default_value = "telemetry")]
    shm_name: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Claim a robot and report the outcome
    Claim {
        /// 64-bit hardware address, hex
        address: String,
        /// Claim in drive mode (full handshake + telemetry slot)
        #[arg(long)]
        drive: bool,
    },
    /// Release a previously claimed robot
    Release {
        /// 64-bit hardware address, hex
        address: String,
    },
    /// Claim in drive mode, wait for aliveness, then hold a constant
    /// wheel setpoint and print feedback as it arrives
    Drive {
        /// 64-bit hardware address, hex
        address: String,
        /// Wheel setpoint applied to all four wheels
        #[arg(long, default_value = "200")]
        wheels: i16,
        /// How long to drive before releasing, seconds
        #[arg(long, default_value = "10")]
        seconds: u64,
    },
    /// Print every meta event the daemon sends on this connection
    Watch,
}

struct Connection {
    stream: UnixStream,
}

impl Connection {
    async fn open(socket: &str) -> Result<Self> {
        let stream = UnixStream::connect(socket)
            .await
            .with_context(|| format!("Failed to connect to daemon at {}", socket))?;
        Ok(Self { stream })
    }

    async fn send(&mut self, packet: &[u8]) -> Result<()> {
        let len = (packet.len() as u32).to_le_bytes();
        self.stream.write_all(&len).await?;
        self.stream.write_all(packet).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        let mut len_bytes = [0u8; 4];
        self.stream.read_exact(&mut len_bytes).await?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut packet = vec![0u8; len];
        self.stream.read_exact(&mut packet).await?;
        Ok(packet)
    }

    /// Wait for the next meta packet, passing other traffic by.
    async fn recv_meta(&mut self) -> Result<MetaPacket> {
        loop {
            let packet = self.recv().await?;
            if let Ok(meta) = MetaPacket::decode(&packet) {
                return Ok(meta);
            }
        }
    }
}

fn parse_address(address: &str) -> Result<u64> {
    u64::from_str_radix(address.trim_start_matches("0x"), 16)
        .with_context(|| format!("'{}' is not a hex hardware address", address))
}

fn describe(meta: &MetaPacket) -> String {
    match meta {
        MetaPacket::Claim { address64, drive } => {
            format!("claim {:016x} drive={}", address64, drive)
        }
        MetaPacket::ClaimFailed { address64, reason } => {
            format!("claim of {:016x} FAILED: {:?}", address64, reason)
        }
        MetaPacket::Alive {
            address64,
            address16,
            slot,
        } => {
            if *slot == wire::SLOT_NONE {
                format!("{:016x} claimed raw, address16={:#06x}", address64, address16)
            } else {
                format!(
                    "{:016x} ALIVE, address16={:#06x} slot={}",
                    address64, address16, slot
                )
            }
        }
        MetaPacket::Dead { address64 } => format!("{:016x} DEAD", address64),
        MetaPacket::Feedback { address64 } => format!("{:016x} feedback", address64),
        MetaPacket::Release { address64 } => format!("release {:016x}", address64),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Claim { address, drive } => {
            let address64 = parse_address(&address)?;
            let mut conn = Connection::open(&args.socket).await?;
            conn.send(&MetaPacket::Claim { address64, drive }.encode())
                .await?;

            let meta = conn.recv_meta().await?;
            println!("{}", describe(&meta));
            if matches!(meta, MetaPacket::ClaimFailed { .. }) {
                bail!("claim rejected");
            }
            // The claim dies with this process; hold the connection open so
            // the robot stays ours until the user interrupts.
            println!("Holding claim; ctrl-c releases it.");
            tokio::signal::ctrl_c().await?;
            conn.send(&MetaPacket::Release { address64 }.encode()).await?;
            Ok(())
        }
        Commands::Release { address } => {
            let address64 = parse_address(&address)?;
            let mut conn = Connection::open(&args.socket).await?;
            conn.send(&MetaPacket::Release { address64 }.encode()).await?;
            println!("release sent for {:016x}", address64);
            Ok(())
        }
        Commands::Drive {
            address,
            wheels,
            seconds,
        } => {
            let address64 = parse_address(&address)?;
            let mut conn = Connection::open(&args.socket).await?;
            conn.send(&MetaPacket::Claim {
                address64,
                drive: true,
            }
            .encode())
            .await?;

            // Wait for the handshake to finish and learn our slot.
            let slot = loop {
                match conn.recv_meta().await? {
                    MetaPacket::Alive { slot, .. } => break slot as usize,
                    MetaPacket::ClaimFailed { reason, .. } => {
                        bail!("claim rejected: {:?}", reason)
                    }
                    other => println!("{}", describe(&other)),
                }
            };
            println!("alive on slot {}, driving", slot);

            let shm = SharedTelemetryBlock::open(&args.shm_name)
                .context("Failed to open the shared telemetry block")?;
            let run_data = RunData {
                flags: wire::RUN_FLAG_RUNNING | wire::RUN_FLAG_DRIVE,
                wheels: [wheels; 4],
                dribbler: 0,
                chicker: 0,
            };

            let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
            let mut refresh = tokio::time::interval(Duration::from_millis(100));
            loop {
                tokio::select! {
                    _ = refresh.tick() => {
                        // Slot writers take the read lock; disjoint slots
                        // never contend with each other.
                        let mut frame = shm.lock_slot_writer(slot);
                        frame.set_run_data(&run_data, now_monotonic_ns());
                    }
                    packet = conn.recv() => {
                        let packet = packet?;
                        if let Ok(MetaPacket::Feedback { .. }) = MetaPacket::decode(&packet) {
                            let frame = shm.lock_slot_writer(slot);
                            let feedback = FeedbackData::decode(&frame.feedback);
                            println!(
                                "battery {} dribbler {} faults {:#04x} latency {}us",
                                feedback.battery,
                                feedback.dribbler_speed,
                                feedback.faults,
                                frame.latency_ns / 1000,
                            );
                        }
                    }
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = tokio::signal::ctrl_c() => break,
                }
            }

            conn.send(&MetaPacket::Release { address64 }.encode()).await?;
            println!("released {:016x}", address64);
            Ok(())
        }
        Commands::Watch => {
            let mut conn = Connection::open(&args.socket).await?;
            println!("watching meta events (ctrl-c to stop)");
            loop {
                tokio::select! {
                    meta = conn.recv_meta() => println!("{}", describe(&meta?)),
                    _ = tokio::signal::ctrl_c() => return Ok(()),
                }
            }
        }
    }
}
