//! xbeed - radio link arbiter for a fleet of small mobile robots
//!
//! One half-duplex radio, many client processes. The daemon is the single
//! owner of the serial link: it admits claims on robots, leases the bounded
//! resources behind each claim (16-bit short addresses, telemetry slots,
//! link frame numbers), sequences the bring-up and bring-down handshakes,
//! and schedules the shared link fairly between one-shot configuration
//! requests and the periodic aggregated drive broadcast. Drive-mode clients
//! exchange motor setpoints and feedback with the daemon through a shared
//! memory block, never through the socket.
//!
//! # Architecture
//!
//! - **Daemon**: the explicit context owning every component; one event
//!   loop, no internal concurrency
//! - **LinkScheduler**: one outstanding item on the link at a time,
//!   queued/bulk round-robin, timeouts and retransmission
//! - **RobotRecord**: per-robot resource state machine
//! - **SharedTelemetryBlock**: process-shared slot array with the inverted
//!   reader/writer discipline
//! - **ClientTable**: frame-number translation and atomic disconnect
//!   teardown
//! - **NumberAllocator**: the bounded pools behind all of the above

pub mod allocator;
pub mod clients;
pub mod config;
pub mod daemon;
pub mod error;
pub mod link;
pub mod robot;
pub mod scheduler;
pub mod shm;
pub mod wire;

// High-level exports for the binaries and tests
pub use allocator::NumberAllocator;
pub use clients::{ClientId, ClientTable};
pub use config::{DaemonConfig, LinkConfig, RadioConfig, TimingConfig};
pub use daemon::{serve_clients, Daemon, Event};
pub use error::{Result, XbeedError};
pub use link::{GatewayLink, Link, MockLink};
pub use robot::{Action, RobotRecord, RobotState};
pub use scheduler::{LinkScheduler, Origin, QueuedRequest};
pub use shm::{now_monotonic_ns, SharedTelemetryBlock, TelemetryFrame, SLOT_COUNT};
pub use wire::{ApiPacket, AtStatus, ClaimDenied, FeedbackData, MetaPacket, RunData};
