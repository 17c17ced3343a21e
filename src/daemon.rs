//! Daemon core
//!
//! [`Daemon`] is the explicit context that owns every component: the link
//! scheduler, the robot records, the resource pools, the shared telemetry
//! block and the client table. All logic runs on a single task; auxiliary
//! tasks only shuttle bytes between sockets and the event channel, so no
//! two events are ever processed concurrently.

use crate::clients::{ClientId, ClientTable, CLIENT_QUEUE_DEPTH};
use crate::config::DaemonConfig;
use crate::link::Link;
use crate::robot::{Action, RobotRecord, RobotState};
use crate::scheduler::{Completion, LinkScheduler, Origin, QueuedRequest};
use crate::shm::{now_monotonic_ns, SharedTelemetryBlock, TelemetryFrame, SLOT_COUNT};
use crate::wire::{
    self, ApiPacket, AtStatus, ClaimDenied, MetaPacket, RunData, RUN_FLAG_FEEDBACK,
    RUN_FLAG_RUNNING,
};
use crate::{allocator::NumberAllocator, Result, XbeedError};
use bytemuck::Zeroable;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Largest packet accepted from a client connection.
pub const MAX_CLIENT_PACKET: usize = 4096;

/// Everything the daemon reacts to, fanned in from the pump tasks.
#[derive(Debug)]
pub enum Event {
    ClientConnected {
        client: ClientId,
        tx: mpsc::Sender<Vec<u8>>,
    },
    ClientPacket {
        client: ClientId,
        packet: Vec<u8>,
    },
    ClientDisconnected {
        client: ClientId,
    },
    LinkPacket(Vec<u8>),
}

pub struct Daemon {
    link: Box<dyn Link>,
    scheduler: LinkScheduler,
    robots: HashMap<u64, RobotRecord>,
    clients: ClientTable,
    addresses: NumberAllocator,
    slots: NumberAllocator,
    shm: SharedTelemetryBlock,
    /// Slot -> owning robot, for feedback routing
    slot_owner: HashMap<u16, u64>,
    /// Leased short address -> robot, for inbound unicast routing
    address16_index: HashMap<u16, u64>,
    scram_ns: u64,
    status_interval: Duration,
    shutdown_grace: Duration,
    channel: u8,
    pan_id: u16,
    frames_received: u64,
}

impl Daemon {
    pub fn new(config: &DaemonConfig, link: Box<dyn Link>) -> Result<Self> {
        let radio = config.radio();
        let timing = config.timing();

        let shm = SharedTelemetryBlock::create(&config.shm_name)?;
        info!(
            "Shared telemetry block '{}' created with {} slots",
            config.shm_name, SLOT_COUNT
        );

        Ok(Self {
            link,
            scheduler: LinkScheduler::new(Duration::from_millis(timing.request_timeout_ms())),
            robots: HashMap::new(),
            clients: ClientTable::new(),
            addresses: NumberAllocator::new(
                radio.short_address_low(),
                radio.short_address_high(),
            ),
            slots: NumberAllocator::new(0, SLOT_COUNT as u16 - 1),
            shm,
            slot_owner: HashMap::new(),
            address16_index: HashMap::new(),
            scram_ns: timing.scram_ms() * 1_000_000,
            status_interval: Duration::from_secs(timing.status_interval_secs()),
            shutdown_grace: Duration::from_millis(timing.shutdown_grace_ms()),
            channel: radio.channel(),
            pan_id: radio.pan_id(),
            frames_received: 0,
        })
    }

    /// Queue the local modem configuration ahead of any client traffic.
    fn configure_modem(&mut self) -> Result<()> {
        info!(
            "Configuring modem: channel {:#04x}, PAN {:#06x}",
            self.channel, self.pan_id
        );
        for (command, value) in [
            (wire::AT_CHANNEL, vec![self.channel]),
            (wire::AT_PAN_ID, self.pan_id.to_be_bytes().to_vec()),
        ] {
            let frame_id = self
                .scheduler
                .alloc_frame_id()
                .expect("frame ID pool exhausted before startup");
            self.scheduler.enqueue(QueuedRequest {
                bytes: wire::local_at_request(frame_id, command, &value),
                frame_id: Some(frame_id),
                origin: Origin::Daemon,
            });
        }
        Ok(())
    }

    /// Run until the event sources close or ctrl-c arrives, then drain.
    pub async fn run(&mut self, mut events: mpsc::UnboundedReceiver<Event>) -> Result<()> {
        self.configure_modem()?;
        self.pump_link()?;

        let mut status = tokio::time::interval(self.status_interval);
        status.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        status.reset();

        loop {
            let deadline = self
                .scheduler
                .deadline()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event)?,
                    None => {
                        info!("Event sources closed");
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline) => self.on_link_deadline()?,
                _ = status.tick() => self.log_status(),
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received, shutting down");
                    break;
                }
            }
        }

        self.shutdown(&mut events).await
    }

    /// Release every claim and give the teardown sequences a bounded drain.
    async fn shutdown(&mut self, events: &mut mpsc::UnboundedReceiver<Event>) -> Result<()> {
        let claimed: Vec<u64> = self
            .robots
            .values()
            .filter(|robot| robot.is_claimed())
            .map(|robot| robot.address64)
            .collect();
        info!("Releasing {} claimed robots", claimed.len());
        for address64 in claimed {
            if let Some(client) = self.robots[&address64].client {
                self.clients.release_address(client, address64);
            }
            let actions = self
                .robots
                .get_mut(&address64)
                .expect("claimed robot must exist")
                .release();
            self.apply_actions(address64, actions);
        }
        self.pump_link()?;

        let grace_end = Instant::now() + self.shutdown_grace;
        while !self.quiescent() && Instant::now() < grace_end {
            let deadline = self
                .scheduler
                .deadline()
                .map(|d| d.min(grace_end))
                .unwrap_or(grace_end);
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event)?,
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    if Instant::now() >= grace_end {
                        break;
                    }
                    self.on_link_deadline()?;
                }
            }
        }

        if self.quiescent() {
            info!("Shutdown complete, all robots idle");
        } else {
            warn!("Shutdown grace expired with teardowns still pending");
        }
        Ok(())
    }

    fn quiescent(&self) -> bool {
        self.robots
            .values()
            .all(|robot| matches!(robot.state, RobotState::Idle))
    }

    fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::ClientConnected { client, tx } => {
                self.clients.register(client, tx);
            }
            Event::ClientPacket { client, packet } => {
                self.on_client_packet(client, packet)?;
            }
            Event::ClientDisconnected { client } => {
                self.on_client_disconnected(client);
            }
            Event::LinkPacket(bytes) => {
                self.on_link_packet(bytes)?;
            }
        }
        self.pump_link()
    }

    /// Send whatever the pump can, assembling the bulk broadcast on demand.
    fn pump_link(&mut self) -> Result<()> {
        let Self {
            link,
            scheduler,
            robots,
            shm,
            scram_ns,
            ..
        } = self;

        let mut eligible: Vec<u16> = robots.values().filter_map(|r| r.active_slot()).collect();
        eligible.sort_unstable();

        scheduler.pump(link.as_mut(), &eligible, |fb_slot| {
            build_bulk_payload(shm, &eligible, fb_slot, *scram_ns)
        })
    }

    /// The outstanding link item's deadline passed.
    fn on_link_deadline(&mut self) -> Result<()> {
        if let Some(slot) = self.scheduler.on_timeout(self.link.as_mut())? {
            let mask_after = {
                let mut frames = self.shm.lock_aggregate();
                let frame = &mut frames[slot as usize];
                frame.delivery_mask <<= 1;
                frame.delivery_mask
            };
            if let Some(&address64) = self.slot_owner.get(&slot) {
                let actions = self
                    .robots
                    .get_mut(&address64)
                    .expect("slot owner must exist")
                    .feedback_timeout(mask_after);
                self.apply_actions(address64, actions);
            }
        }
        self.pump_link()
    }

    fn on_link_packet(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.frames_received += 1;

        let (status, is_receive) = match wire::parse_api_packet(&bytes) {
            Ok(ApiPacket::Receive16 { .. }) => (None, true),
            Ok(ApiPacket::LocalAtResponse { status, .. })
            | Ok(ApiPacket::RemoteAtResponse { status, .. })
            | Ok(ApiPacket::TransmitStatus { status, .. }) => (Some(status), false),
            Err(e) => {
                debug!("Dropping unparseable link packet: {}", e);
                return Ok(());
            }
        };

        if is_receive {
            return self.on_receive16(bytes);
        }

        let packet = wire::parse_api_packet(&bytes).expect("parsed once already");
        let completion = self.scheduler.on_response(&packet, self.link.as_mut())?;
        drop(packet);

        match completion {
            Completion::Completed {
                origin,
                frame_id,
                request_bytes,
            } => self.on_request_completed(origin, frame_id, request_bytes, status, bytes),
            Completion::Retransmitted | Completion::Ignored => Ok(()),
        }
    }

    fn on_request_completed(
        &mut self,
        origin: Origin,
        frame_id: u8,
        request_bytes: Vec<u8>,
        status: Option<u8>,
        mut response_bytes: Vec<u8>,
    ) -> Result<()> {
        match origin {
            Origin::Daemon => {
                let status = status.unwrap_or(0);
                if status != AtStatus::Ok as u8 {
                    // A misconfigured modem must not serve claims.
                    return Err(XbeedError::Link(format!(
                        "modem rejected configuration with status {}",
                        status
                    )));
                }
                debug!("Modem configuration step acknowledged");
                Ok(())
            }
            Origin::Robot { address64 } => {
                if request_bytes.first() != Some(&wire::API_REMOTE_AT_REQUEST) {
                    return Ok(());
                }
                let command = [request_bytes[13], request_bytes[14]];
                let value = request_bytes[15..].to_vec();
                let status_byte = status.expect("response kinds carry a status byte");
                let status = AtStatus::from_byte(status_byte).unwrap_or_else(|| {
                    panic!(
                        "robot {:016x} returned status {:#04x} outside the documented set",
                        address64, status_byte
                    )
                });

                let actions = self
                    .robots
                    .get_mut(&address64)
                    .expect("robot with in-flight command must exist")
                    .at_completed(command, &value, status);
                self.apply_actions(address64, actions);
                Ok(())
            }
            Origin::Client { .. } => {
                // Map the global frame number back to the client's own.
                if let Some((owner, local)) = self.clients.complete_frame(frame_id) {
                    wire::set_frame_id(&mut response_bytes, local);
                    self.clients.send(owner, response_bytes);
                }
                Ok(())
            }
        }
    }

    /// Inbound unicast: feedback for the slot last solicited, or a raw
    /// robot's packet forwarded to its claiming client.
    fn on_receive16(&mut self, bytes: Vec<u8>) -> Result<()> {
        let Ok(ApiPacket::Receive16 {
            address16,
            rssi,
            payload,
            ..
        }) = wire::parse_api_packet(&bytes)
        else {
            unreachable!("caller checked the packet type");
        };

        if let Some(slot) = self.scheduler.pending_feedback_slot() {
            let solicited = self
                .slot_owner
                .get(&slot)
                .and_then(|address64| self.robots.get(address64));
            if payload.len() == wire::FeedbackData::SIZE
                && solicited.and_then(|robot| robot.address16()) == Some(address16)
            {
                let feedback: [u8; wire::FeedbackData::SIZE] = payload.try_into().unwrap();
                let (slot, latency) = self
                    .scheduler
                    .feedback_received()
                    .expect("pending feedback just checked");
                let address64 = self.slot_owner[&slot];

                let mask_after = {
                    let mut frames = self.shm.lock_aggregate();
                    let frame = &mut frames[slot as usize];
                    frame.delivery_mask = (frame.delivery_mask << 1) | 1;
                    frame.feedback = feedback;
                    frame.latency_ns = latency.as_nanos() as u64;
                    frame.inbound_rssi = rssi;
                    frame.delivery_mask
                };

                let actions = self
                    .robots
                    .get_mut(&address64)
                    .expect("slot owner must exist")
                    .feedback_received(mask_after);
                self.apply_actions(address64, actions);
                return Ok(());
            }
        }

        // Not the solicited feedback: forward to whoever claims the sender.
        if let Some(&address64) = self.address16_index.get(&address16) {
            if let Some(client) = self.robots.get(&address64).and_then(|robot| robot.client) {
                self.clients.send(client, bytes);
                return Ok(());
            }
        }
        debug!("Dropping unattributed RX from {:#06x}", address16);
        Ok(())
    }

    fn on_client_packet(&mut self, client: ClientId, packet: Vec<u8>) -> Result<()> {
        if !self.clients.contains(client) {
            return Ok(());
        }
        let Some(&kind) = packet.first() else {
            return Ok(());
        };

        match kind {
            wire::META_CLAIM => match MetaPacket::decode(&packet) {
                Ok(MetaPacket::Claim { address64, drive }) => {
                    self.handle_claim(client, address64, drive)
                }
                other => {
                    warn!("Client {} sent malformed claim: {:?}", client, other);
                }
            },
            wire::META_RELEASE => match MetaPacket::decode(&packet) {
                Ok(MetaPacket::Release { address64 }) => {
                    self.handle_release(client, address64)
                }
                other => {
                    warn!("Client {} sent malformed release: {:?}", client, other);
                }
            },
            wire::API_LOCAL_AT_REQUEST | wire::API_REMOTE_AT_REQUEST | wire::API_TRANSMIT16 => {
                self.forward_client_request(client, packet);
            }
            other => {
                warn!(
                    "Client {} sent unknown packet kind {:#04x}, ignoring",
                    client, other
                );
            }
        }
        Ok(())
    }

    /// Translate a client's own frame number onto the global pool and queue
    /// the request.
    fn forward_client_request(&mut self, client: ClientId, mut packet: Vec<u8>) {
        if packet.len() < 2 || packet.len() > MAX_CLIENT_PACKET {
            warn!("Client {} sent malformed request, ignoring", client);
            return;
        }

        let Some(local) = wire::request_frame_id(&packet) else {
            warn!("Client {} sent malformed request, ignoring", client);
            return;
        };
        let frame_id = if local == wire::FRAME_ID_NONE {
            None
        } else {
            let Some(global) = self.scheduler.alloc_frame_id() else {
                warn!(
                    "Frame ID pool exhausted, dropping client {} request",
                    client
                );
                return;
            };
            self.clients.map_frame(client, global, local);
            wire::set_frame_id(&mut packet, global);
            Some(global)
        };

        self.scheduler.enqueue(QueuedRequest {
            bytes: packet,
            frame_id,
            origin: Origin::Client { client },
        });
    }

    fn handle_claim(&mut self, client: ClientId, address64: u64, drive: bool) {
        // Admission: a robot already routed to a client is simply locked.
        // (Claims that get past admission onto a claimed state machine are
        // a daemon bug and abort the process there.)
        if self.clients.address_client(address64).is_some() {
            debug!(
                "Client {} claim of {:016x} rejected: locked",
                client, address64
            );
            self.clients.send(
                client,
                MetaPacket::ClaimFailed {
                    address64,
                    reason: ClaimDenied::Locked,
                }
                .encode(),
            );
            return;
        }

        let robot = self
            .robots
            .entry(address64)
            .or_insert_with(|| RobotRecord::new(address64));
        let admitted = if drive {
            robot.admits_drive_claim()
        } else {
            robot.admits_raw_claim()
        };
        if !admitted {
            debug!(
                "Client {} claim of {:016x} rejected in {:?}",
                client, address64, robot.state
            );
            self.clients.send(
                client,
                MetaPacket::ClaimFailed {
                    address64,
                    reason: ClaimDenied::Locked,
                }
                .encode(),
            );
            return;
        }

        let needs_resources = matches!(robot.state, RobotState::Idle);
        let fresh = if needs_resources {
            let Some(address16) = self.addresses.alloc() else {
                self.clients.send(
                    client,
                    MetaPacket::ClaimFailed {
                        address64,
                        reason: ClaimDenied::Resource,
                    }
                    .encode(),
                );
                return;
            };
            if drive {
                let Some(slot) = self.slots.alloc() else {
                    // No partial allocation survives a failed claim.
                    self.addresses.free(address16);
                    self.clients.send(
                        client,
                        MetaPacket::ClaimFailed {
                            address64,
                            reason: ClaimDenied::Resource,
                        }
                        .encode(),
                    );
                    return;
                };
                Some((address16, Some(slot)))
            } else {
                Some((address16, None))
            }
        } else {
            None
        };

        let actions = {
            let robot = self.robots.get_mut(&address64).expect("inserted above");
            match fresh {
                Some((address16, Some(slot))) => {
                    self.address16_index.insert(address16, address64);
                    self.slot_owner.insert(slot, address64);
                    robot.claim_drive(client, Some((address16, slot)))
                }
                Some((address16, None)) => {
                    self.address16_index.insert(address16, address64);
                    robot.claim_raw(client, address16)
                }
                None => robot.claim_drive(client, None),
            }
        };

        self.clients.claim_address(client, address64);
        self.apply_actions(address64, actions);
    }

    fn handle_release(&mut self, client: ClientId, address64: u64) {
        if self.clients.address_client(address64) != Some(client) {
            warn!(
                "Client {} released {:016x} it does not own, ignoring",
                client, address64
            );
            return;
        }

        self.clients.release_address(client, address64);
        let actions = self
            .robots
            .get_mut(&address64)
            .expect("claimed robot must exist")
            .release();
        self.apply_actions(address64, actions);
    }

    /// Disconnect teardown: every claim and frame number the client still
    /// holds is unwound before the next event is processed.
    fn on_client_disconnected(&mut self, client: ClientId) {
        let (addresses, _frames) = self.clients.unregister(client);
        for address64 in addresses {
            let actions = self
                .robots
                .get_mut(&address64)
                .expect("claimed robot must exist")
                .release();
            self.apply_actions(address64, actions);
        }
        // Queued requests die here; an in-flight one is orphaned and frees
        // its number on its next completion or timeout.
        self.scheduler.purge_client(client);
    }

    fn apply_actions(&mut self, address64: u64, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::SendAt { command, value } => {
                    self.queue_robot_command(address64, command, value);
                }
                Action::Notify(meta) => {
                    if let Some(client) =
                        self.robots.get(&address64).and_then(|robot| robot.client)
                    {
                        self.clients.send(client, meta.encode());
                    }
                }
                Action::FreeResources { address16, slot } => {
                    self.addresses.free(address16);
                    self.slots.free(slot);
                    self.address16_index.remove(&address16);
                    self.slot_owner.remove(&slot);
                }
                Action::FreeAddress { address16 } => {
                    self.addresses.free(address16);
                    self.address16_index.remove(&address16);
                }
                Action::ScrubSlot { slot } => {
                    let mut frames = self.shm.lock_aggregate();
                    frames[slot as usize] = TelemetryFrame::zeroed();
                }
            }
        }
    }

    fn queue_robot_command(&mut self, address64: u64, command: [u8; 2], value: Vec<u8>) {
        let frame_id = self
            .scheduler
            .alloc_frame_id()
            .expect("frame ID pool exhausted by handshake traffic");
        let bytes = wire::remote_at_request(
            frame_id,
            address64,
            wire::ADDRESS16_UNKNOWN,
            0,
            command,
            &value,
        );
        self.scheduler.enqueue(QueuedRequest {
            bytes,
            frame_id: Some(frame_id),
            origin: Origin::Robot { address64 },
        });
    }

    fn log_status(&self) {
        let alive = self
            .robots
            .values()
            .filter(|robot| matches!(robot.state, RobotState::Alive { .. }))
            .count();
        let claimed = self.robots.values().filter(|r| r.is_claimed()).count();
        info!(
            "Status: {} clients, {} robots known ({} claimed, {} alive), \
             addresses {}/{}, slots {}/{}, frames {}/255, \
             link tx {} rx {} retx {} fb-timeouts {}",
            self.clients.len(),
            self.robots.len(),
            claimed,
            alive,
            self.addresses.available(),
            self.addresses.capacity(),
            self.slots.available(),
            self.slots.capacity(),
            self.scheduler.free_frame_ids(),
            self.scheduler.stats.frames_sent,
            self.frames_received,
            self.scheduler.stats.retransmissions,
            self.scheduler.stats.feedback_timeouts,
        );
    }
}

/// Assemble the bulk broadcast under the aggregate lock. The packet covers
/// slots up to the highest active one so every robot's byte offset stays
/// where the handshake promised; inactive slots in between are zeroed.
fn build_bulk_payload(
    shm: &SharedTelemetryBlock,
    eligible: &[u16],
    fb_slot: u16,
    scram_ns: u64,
) -> Vec<u8> {
    let now = now_monotonic_ns();
    let frames = shm.lock_aggregate();
    let max_slot = *eligible.last().expect("bulk built with no eligible slots");
    let mut payload = vec![0u8; (max_slot as usize + 1) * RunData::SIZE];

    for &slot in eligible {
        let frame = &frames[slot as usize];
        let mut run_data = frame.run_data();
        if now.saturating_sub(frame.timestamp_ns) > scram_ns {
            run_data = run_data.scrammed();
        }
        run_data.flags |= RUN_FLAG_RUNNING;
        if slot == fb_slot {
            run_data.flags |= RUN_FLAG_FEEDBACK;
        } else {
            run_data.flags &= !RUN_FLAG_FEEDBACK;
        }
        let offset = slot as usize * RunData::SIZE;
        payload[offset..offset + RunData::SIZE].copy_from_slice(&run_data.encode());
    }

    payload
}

/// Accept client connections and fan their traffic into the event channel.
pub async fn serve_clients(
    socket_path: &str,
    events: mpsc::UnboundedSender<Event>,
) -> Result<()> {
    // A leftover socket file from an unclean exit would block the bind.
    if std::path::Path::new(socket_path).exists() {
        std::fs::remove_file(socket_path)?;
    }
    let listener = UnixListener::bind(socket_path)
        .map_err(|e| XbeedError::Client(format!("bind {}: {}", socket_path, e)))?;
    info!("Listening for clients on {}", socket_path);

    tokio::spawn(async move {
        let mut next_id: ClientId = 1;
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };
            let client = next_id;
            next_id += 1;

            let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(CLIENT_QUEUE_DEPTH);
            if events
                .send(Event::ClientConnected {
                    client,
                    tx: outbound_tx,
                })
                .is_err()
            {
                return;
            }

            let (mut read_half, mut write_half) = stream.into_split();

            tokio::spawn(async move {
                while let Some(packet) = outbound_rx.recv().await {
                    let len = (packet.len() as u32).to_le_bytes();
                    if write_half.write_all(&len).await.is_err()
                        || write_half.write_all(&packet).await.is_err()
                    {
                        break;
                    }
                }
            });

            let events = events.clone();
            tokio::spawn(async move {
                loop {
                    let mut len_bytes = [0u8; 4];
                    if read_half.read_exact(&mut len_bytes).await.is_err() {
                        break;
                    }
                    let len = u32::from_le_bytes(len_bytes) as usize;
                    if len == 0 || len > MAX_CLIENT_PACKET {
                        warn!("Client {} framed a {}-byte packet, closing", client, len);
                        break;
                    }
                    let mut packet = vec![0u8; len];
                    if read_half.read_exact(&mut packet).await.is_err() {
                        break;
                    }
                    if events
                        .send(Event::ClientPacket { client, packet })
                        .is_err()
                    {
                        return;
                    }
                }
                let _ = events.send(Event::ClientDisconnected { client });
            });
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::link::MockLink;
    use crate::wire::{
        remote_at_request, AT_RUN_OFFSET, AT_SHORT_ADDRESS, SLOT_NONE,
    };
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicU32, Ordering};

    const ROBOT_A: u64 = 0x0000000000001234;

    static SHM_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn test_config() -> DaemonConfig {
        DaemonConfig {
            link: LinkConfig {
                host: "localhost".to_string(),
                port: 0,
            },
            socket_path: "/tmp/xbeed-test.sock".to_string(),
            shm_name: format!(
                "daemon_test_{}_{}",
                std::process::id(),
                SHM_COUNTER.fetch_add(1, Ordering::Relaxed)
            ),
            radio: None,
            timing: None,
        }
    }

    struct Harness {
        daemon: Daemon,
        sent: Rc<RefCell<Vec<Vec<u8>>>>,
        client_rx: mpsc::Receiver<Vec<u8>>,
    }

    fn harness() -> Harness {
        let link = MockLink::new();
        let sent = link.sent_handle();
        let mut daemon = Daemon::new(&test_config(), Box::new(link)).unwrap();

        let (tx, client_rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        daemon
            .handle_event(Event::ClientConnected { client: 1, tx })
            .unwrap();

        Harness {
            daemon,
            sent,
            client_rx,
        }
    }

    impl Harness {
        fn claim(&mut self, client: ClientId, address64: u64, drive: bool) {
            self.daemon
                .handle_event(Event::ClientPacket {
                    client,
                    packet: MetaPacket::Claim { address64, drive }.encode(),
                })
                .unwrap();
        }

        /// Feed the daemon the response to the last remote AT it sent.
        fn answer_last_at(&mut self, status: u8) {
            let last = self
                .sent
                .borrow()
                .iter()
                .rev()
                .find(|p| p[0] == wire::API_REMOTE_AT_REQUEST)
                .cloned()
                .expect("no remote AT sent");
            let mut response = vec![wire::API_REMOTE_AT_RESPONSE, last[1]];
            response.extend_from_slice(&last[2..12]); // addr64 + addr16
            response.extend_from_slice(&last[13..15]); // command
            response.push(status);
            self.daemon
                .handle_event(Event::LinkPacket(response))
                .unwrap();
        }

        /// Deliver feedback from the robot currently solicited.
        fn deliver_feedback(&mut self, address16: u16) {
            let mut packet = vec![wire::API_RECEIVE16];
            packet.extend_from_slice(&address16.to_be_bytes());
            packet.push(0x30); // rssi
            packet.push(0);
            packet.extend_from_slice(&wire::FeedbackData::default().encode());
            self.daemon.handle_event(Event::LinkPacket(packet)).unwrap();
        }

        fn robot_state(&self, address64: u64) -> RobotState {
            self.daemon.robots[&address64].state
        }

        fn metas(&mut self) -> Vec<MetaPacket> {
            let mut metas = Vec::new();
            while let Ok(packet) = self.client_rx.try_recv() {
                if packet[0] >= 0xF0 {
                    metas.push(MetaPacket::decode(&packet).unwrap());
                }
            }
            metas
        }

        /// Bring robot A from claim to Alive through the full handshake.
        fn drive_to_alive(&mut self) -> u16 {
            self.claim(1, ROBOT_A, true);
            self.answer_last_at(AtStatus::Ok as u8); // MY set -> SettingRdo
            self.answer_last_at(AtStatus::Ok as u8); // RO set, bulk flowing
            let address16 = self.daemon.robots[&ROBOT_A].address16().unwrap();
            self.deliver_feedback(address16);
            assert!(matches!(self.robot_state(ROBOT_A), RobotState::Alive { .. }));
            address16
        }
    }

    #[test]
    fn test_drive_claim_queues_short_address_set() {
        let mut h = harness();
        h.claim(1, ROBOT_A, true);

        assert!(matches!(
            h.robot_state(ROBOT_A),
            RobotState::Setting16 { .. }
        ));

        let sent = h.sent.borrow();
        let at = sent
            .iter()
            .find(|p| p[0] == wire::API_REMOTE_AT_REQUEST)
            .expect("short-address command not sent");
        assert_eq!(&at[13..15], &AT_SHORT_ADDRESS);
        assert_eq!(&at[2..10], &ROBOT_A.to_be_bytes());
    }

    #[test]
    fn test_claim_of_claimed_robot_is_rejected_locked() {
        let mut h = harness();
        h.claim(1, ROBOT_A, true);
        h.metas();

        h.claim(1, ROBOT_A, true);
        let metas = h.metas();
        assert_eq!(
            metas,
            vec![MetaPacket::ClaimFailed {
                address64: ROBOT_A,
                reason: ClaimDenied::Locked,
            }]
        );
        // The state machine never saw the second claim.
        assert!(matches!(
            h.robot_state(ROBOT_A),
            RobotState::Setting16 { .. }
        ));
    }

    #[test]
    fn test_handshake_reaches_alive_and_notifies_client() {
        let mut h = harness();
        let address16 = h.drive_to_alive();

        let metas = h.metas();
        assert!(metas.iter().any(|m| matches!(
            m,
            MetaPacket::Alive {
                address64: ROBOT_A,
                address16: a16,
                ..
            } if *a16 == address16
        )));
    }

    #[test]
    fn test_sixteen_feedback_timeouts_emit_one_dead_and_rehandshake() {
        let mut h = harness();
        h.drive_to_alive();
        h.metas();

        for i in 1..=16 {
            // The bulk solicitation is outstanding; expire it.
            h.daemon.on_link_deadline().unwrap();
            let dead_now = h
                .metas()
                .iter()
                .any(|m| matches!(m, MetaPacket::Dead { .. }));
            if i < 16 {
                assert!(!dead_now, "dead fired early at timeout {}", i);
                assert!(matches!(h.robot_state(ROBOT_A), RobotState::Alive { .. }));
            } else {
                assert!(dead_now, "dead did not fire at timeout 16");
                assert!(matches!(
                    h.robot_state(ROBOT_A),
                    RobotState::Setting16 { .. }
                ));
            }
        }

        // Still claimed; the handshake restarts on its own.
        assert!(h.daemon.robots[&ROBOT_A].is_claimed());
    }

    #[test]
    fn test_slot_exhaustion_fails_claim_without_leaking() {
        let mut h = harness();

        let addresses_before = h.daemon.addresses.available();
        for i in 0..SLOT_COUNT as u64 {
            h.claim(1, 0x9000 + i, true);
        }
        assert_eq!(h.daemon.slots.available(), 0);
        h.metas();

        h.claim(1, ROBOT_A, true);
        let metas = h.metas();
        assert_eq!(
            metas,
            vec![MetaPacket::ClaimFailed {
                address64: ROBOT_A,
                reason: ClaimDenied::Resource,
            }]
        );
        // The short address tentatively taken for the failed claim is back.
        assert_eq!(
            h.daemon.addresses.available(),
            addresses_before - SLOT_COUNT
        );
        assert!(matches!(h.robot_state(ROBOT_A), RobotState::Idle));
    }

    #[test]
    fn test_raw_claim_acks_immediately_and_forwards_unicast() {
        let mut h = harness();
        h.claim(1, ROBOT_A, false);

        let metas = h.metas();
        let address16 = match metas.as_slice() {
            [MetaPacket::Alive {
                address64: ROBOT_A,
                address16,
                slot: SLOT_NONE,
            }] => *address16,
            other => panic!("expected raw-claim ack, got {:?}", other),
        };

        // An inbound unicast from the raw robot reaches the client verbatim.
        let mut rx = vec![wire::API_RECEIVE16];
        rx.extend_from_slice(&address16.to_be_bytes());
        rx.extend_from_slice(&[0x20, 0x00, 0xAB, 0xCD]);
        h.daemon
            .handle_event(Event::LinkPacket(rx.clone()))
            .unwrap();
        assert_eq!(h.client_rx.try_recv().unwrap(), rx);
    }

    #[test]
    fn test_client_request_translation_and_response_rewrite() {
        let mut h = harness();
        h.claim(1, ROBOT_A, false);
        h.metas();

        // The client uses its own frame number 9.
        let request = remote_at_request(
            9,
            ROBOT_A,
            wire::ADDRESS16_UNKNOWN,
            0,
            AT_RUN_OFFSET,
            &[0x01],
        );
        h.daemon
            .handle_event(Event::ClientPacket {
                client: 1,
                packet: request,
            })
            .unwrap();

        let global = {
            let sent = h.sent.borrow();
            let at = sent
                .iter()
                .rev()
                .find(|p| p[0] == wire::API_REMOTE_AT_REQUEST && p[13..15] == AT_RUN_OFFSET)
                .expect("client request not forwarded")
                .clone();
            at[1]
        };
        assert_ne!(global, 9, "global frame number must come from the pool");

        h.answer_last_at(AtStatus::Ok as u8);
        let response = h.client_rx.try_recv().expect("response not forwarded");
        assert_eq!(response[0], wire::API_REMOTE_AT_RESPONSE);
        assert_eq!(response[1], 9, "frame number must be the client's own");
    }

    #[test]
    fn test_disconnect_releases_claims_and_numbers_for_reuse() {
        let mut h = harness();
        h.claim(1, ROBOT_A, true);

        h.daemon
            .handle_event(Event::ClientDisconnected { client: 1 })
            .unwrap();

        // The robot entered teardown and the claim is gone.
        assert!(!h.daemon.robots[&ROBOT_A].is_claimed());
        assert!(matches!(
            h.robot_state(ROBOT_A),
            RobotState::Releasing16 { .. }
        ));
        assert_eq!(h.daemon.clients.address_client(ROBOT_A), None);

        // Walk the teardown to Idle. The first answer completes the
        // address-set that was still in flight when the disconnect hit;
        // the teardown ignores it as stale and proceeds.
        h.answer_last_at(AtStatus::Ok as u8); // stale MY set
        h.answer_last_at(AtStatus::Ok as u8); // MY clear
        h.answer_last_at(AtStatus::Ok as u8); // line high
        h.answer_last_at(AtStatus::Ok as u8); // line low
        assert!(matches!(h.robot_state(ROBOT_A), RobotState::Idle));
        assert_eq!(h.daemon.slots.available(), SLOT_COUNT);

        let (tx, _rx2) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        h.daemon
            .handle_event(Event::ClientConnected { client: 2, tx })
            .unwrap();
        h.claim(2, ROBOT_A, true);
        assert!(matches!(
            h.robot_state(ROBOT_A),
            RobotState::Setting16 { .. }
        ));
    }

    #[test]
    fn test_reclaim_during_teardown_reuses_held_resources() {
        let mut h = harness();
        h.claim(1, ROBOT_A, true);
        h.daemon
            .handle_event(Event::ClientPacket {
                client: 1,
                packet: MetaPacket::Release { address64: ROBOT_A }.encode(),
            })
            .unwrap();
        h.answer_last_at(AtStatus::Ok as u8); // stale MY set from the claim
        h.answer_last_at(AtStatus::Ok as u8); // MY clear -> BootloadingHigh
        h.answer_last_at(AtStatus::Ok as u8); // raise -> BootloadingLow
        assert!(matches!(
            h.robot_state(ROBOT_A),
            RobotState::BootloadingLow { .. }
        ));

        let slots_free = h.daemon.slots.available();
        h.claim(1, ROBOT_A, true);
        assert!(matches!(
            h.robot_state(ROBOT_A),
            RobotState::Setting16 { .. }
        ));
        // No fresh allocation happened; the held pair was reused.
        assert_eq!(h.daemon.slots.available(), slots_free);
    }

    #[test]
    fn test_bulk_scrams_stale_slots() {
        let mut h = harness();
        h.drive_to_alive();

        // Write fresh run data, then age it past the scram threshold.
        let slot = h.daemon.robots[&ROBOT_A].active_slot().unwrap();
        {
            let mut frames = h.daemon.shm.lock_aggregate();
            frames[slot as usize].set_run_data(
                &RunData {
                    flags: RUN_FLAG_RUNNING,
                    wheels: [100, 100, 100, 100],
                    dribbler: 500,
                    chicker: 0,
                },
                now_monotonic_ns(),
            );
        }

        h.daemon.on_link_deadline().unwrap(); // completes pending bulk, sends next
        {
            let sent = h.sent.borrow();
            let bulk = sent
                .iter()
                .rev()
                .find(|p| p[0] == wire::API_TRANSMIT16 && p[2..4] == [0xFF, 0xFF])
                .unwrap()
                .clone();
            let offset = 5 + slot as usize * RunData::SIZE;
            let rd = RunData::decode(&bulk[offset..offset + RunData::SIZE].try_into().unwrap());
            assert_eq!(rd.wheels, [100, 100, 100, 100], "fresh data must be sent");
        }

        {
            let mut frames = h.daemon.shm.lock_aggregate();
            frames[slot as usize].timestamp_ns = 0; // stale forever
        }
        h.daemon.on_link_deadline().unwrap();
        let sent = h.sent.borrow();
        let bulk = sent
            .iter()
            .rev()
            .find(|p| p[0] == wire::API_TRANSMIT16 && p[2..4] == [0xFF, 0xFF])
            .unwrap()
            .clone();
        let offset = 5 + slot as usize * RunData::SIZE;
        let rd = RunData::decode(&bulk[offset..offset + RunData::SIZE].try_into().unwrap());
        assert_eq!(rd.wheels, [0; 4], "stale data must be scrammed");
        assert_ne!(rd.flags & RUN_FLAG_RUNNING, 0, "scram still drives running");
    }
}
