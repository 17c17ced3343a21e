//! Client multiplexer tables
//!
//! Each connected client chooses its own frame numbers; the daemon remaps
//! them onto the global 1-255 pool so two clients can never collide, and
//! keeps per-client reverse sets so a disconnect can strip every mapping
//! and claim the client still holds in one transaction.

use std::collections::{HashMap, HashSet};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type ClientId = u32;

/// Outbound queue depth per client; overflow drops packets (delivery to
/// clients is best-effort and must never block the daemon).
pub const CLIENT_QUEUE_DEPTH: usize = 64;

/// Book-keeping for one connected client.
pub struct ClientRecord {
    pub id: ClientId,
    tx: mpsc::Sender<Vec<u8>>,
    /// Global frame IDs currently routed back to this client
    frames: HashSet<u8>,
    /// Robots this client has claimed
    addresses: HashSet<u64>,
    /// Global frame ID -> the client's own frame number
    frame_back: HashMap<u8, u8>,
    dropped: u64,
}

/// All connected clients plus the global routing maps. Invariant: the
/// per-client sets are always the exact inverse of `frame_owner` and
/// `address_owner`; every method here updates both sides together.
#[derive(Default)]
pub struct ClientTable {
    clients: HashMap<ClientId, ClientRecord>,
    frame_owner: HashMap<u8, ClientId>,
    address_owner: HashMap<u64, ClientId>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: ClientId, tx: mpsc::Sender<Vec<u8>>) {
        debug!("Client {} connected", id);
        let previous = self.clients.insert(
            id,
            ClientRecord {
                id,
                tx,
                frames: HashSet::new(),
                addresses: HashSet::new(),
                frame_back: HashMap::new(),
                dropped: 0,
            },
        );
        assert!(previous.is_none(), "client id {} registered twice", id);
    }

    /// Remove a client, returning the addresses it still claimed and the
    /// global frame IDs still routed to it. The caller unwinds those.
    pub fn unregister(&mut self, id: ClientId) -> (Vec<u64>, Vec<u8>) {
        let Some(record) = self.clients.remove(&id) else {
            return (Vec::new(), Vec::new());
        };

        for frame in &record.frames {
            self.frame_owner.remove(frame);
        }
        for address in &record.addresses {
            self.address_owner.remove(address);
        }

        if record.dropped > 0 {
            warn!(
                "Client {} disconnected with {} dropped packets",
                id, record.dropped
            );
        } else {
            debug!("Client {} disconnected", id);
        }

        (
            record.addresses.into_iter().collect(),
            record.frames.into_iter().collect(),
        )
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    /// Record a local->global frame translation for an in-flight request.
    pub fn map_frame(&mut self, id: ClientId, global: u8, local: u8) {
        let record = self.clients.get_mut(&id).expect("mapping frame for unknown client");
        record.frames.insert(global);
        record.frame_back.insert(global, local);
        let previous = self.frame_owner.insert(global, id);
        assert!(previous.is_none(), "global frame {} double-mapped", global);
    }

    /// Complete a global frame: drop the mapping and return the owner and
    /// the client's own frame number for the response rewrite.
    pub fn complete_frame(&mut self, global: u8) -> Option<(ClientId, u8)> {
        let id = self.frame_owner.remove(&global)?;
        let record = self.clients.get_mut(&id)?;
        record.frames.remove(&global);
        let local = record.frame_back.remove(&global)?;
        Some((id, local))
    }

    pub fn frame_client(&self, global: u8) -> Option<ClientId> {
        self.frame_owner.get(&global).copied()
    }

    pub fn claim_address(&mut self, id: ClientId, address64: u64) {
        let record = self.clients.get_mut(&id).expect("claim for unknown client");
        record.addresses.insert(address64);
        let previous = self.address_owner.insert(address64, id);
        assert!(
            previous.is_none(),
            "address {:016x} claimed while already owned",
            address64
        );
    }

    pub fn release_address(&mut self, id: ClientId, address64: u64) {
        if let Some(record) = self.clients.get_mut(&id) {
            record.addresses.remove(&address64);
        }
        self.address_owner.remove(&address64);
    }

    pub fn address_client(&self, address64: u64) -> Option<ClientId> {
        self.address_owner.get(&address64).copied()
    }

    /// Best-effort delivery; a full queue drops the packet.
    pub fn send(&mut self, id: ClientId, packet: Vec<u8>) {
        if let Some(record) = self.clients.get_mut(&id) {
            if record.tx.try_send(packet).is_err() {
                record.dropped += 1;
                if record.dropped == 1 || record.dropped % 100 == 0 {
                    warn!(
                        "Client {} queue full, dropped {} packets total",
                        record.id, record.dropped
                    );
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_client(id: ClientId) -> (ClientTable, mpsc::Receiver<Vec<u8>>) {
        let mut table = ClientTable::new();
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        table.register(id, tx);
        (table, rx)
    }

    #[test]
    fn test_frame_translation_roundtrip() {
        let (mut table, _rx) = table_with_client(1);

        table.map_frame(1, 42, 7);
        assert_eq!(table.frame_client(42), Some(1));
        assert_eq!(table.complete_frame(42), Some((1, 7)));
        assert_eq!(table.frame_client(42), None);
        // completing twice is a no-op
        assert_eq!(table.complete_frame(42), None);
    }

    #[test]
    fn test_unregister_strips_every_mapping() {
        let (mut table, _rx) = table_with_client(1);

        table.map_frame(1, 10, 1);
        table.map_frame(1, 11, 2);
        table.claim_address(1, 0x1234);
        table.claim_address(1, 0x5678);

        let (addresses, frames) = table.unregister(1);
        assert_eq!(addresses.len(), 2);
        assert_eq!(frames.len(), 2);
        assert_eq!(table.frame_client(10), None);
        assert_eq!(table.frame_client(11), None);
        assert_eq!(table.address_client(0x1234), None);

        // a fresh client can immediately reuse the same numbers
        let (tx, _rx2) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        table.register(2, tx);
        table.map_frame(2, 10, 9);
        table.claim_address(2, 0x1234);
        assert_eq!(table.frame_client(10), Some(2));
        assert_eq!(table.address_client(0x1234), Some(2));
    }

    #[test]
    #[should_panic(expected = "claimed while already owned")]
    fn test_double_claim_is_a_logic_error() {
        let (mut table, _rx) = table_with_client(1);
        let (tx, _rx2) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        table.register(2, tx);

        table.claim_address(1, 0x1234);
        table.claim_address(2, 0x1234);
    }

    #[test]
    fn test_send_drops_on_full_queue_without_blocking() {
        let mut table = ClientTable::new();
        let (tx, mut rx) = mpsc::channel(2);
        table.register(1, tx);

        table.send(1, vec![1]);
        table.send(1, vec![2]);
        table.send(1, vec![3]); // dropped

        assert_eq!(rx.try_recv().unwrap(), vec![1]);
        assert_eq!(rx.try_recv().unwrap(), vec![2]);
        assert!(rx.try_recv().is_err());
    }
}
