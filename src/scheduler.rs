//! Link scheduler
//!
//! Owns the single physical link. All traffic funnels through a pump that
//! keeps at most one item outstanding — a one-shot queued request or the
//! aggregated bulk broadcast — so the half-duplex radio is never driven
//! from both ends. When both classes have data the pump alternates between
//! them strictly; a sole active class is never starved.
//!
//! Queued requests that expect a response hold a frame number from the
//! 1-255 pool until the response arrives; on timeout the identical bytes go
//! out again and the number stays leased. Each bulk broadcast solicits
//! feedback from exactly one eligible slot, chosen round-robin, with a
//! single timeout of its own.

use crate::allocator::NumberAllocator;
use crate::clients::ClientId;
use crate::link::Link;
use crate::wire::{self, ApiPacket};
use crate::Result;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Where a queued request came from, for response routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A robot state machine's handshake command
    Robot { address64: u64 },
    /// A client's own request, already translated to a global frame number
    Client { client: ClientId },
    /// Daemon-internal modem configuration
    Daemon,
}

#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub bytes: Vec<u8>,
    /// Leased global frame number; `None` when no response is expected
    pub frame_id: Option<u8>,
    pub origin: Origin,
}

#[derive(Debug)]
enum Outstanding {
    Queued {
        request: QueuedRequest,
        deadline: Instant,
        /// Owner disconnected; drop instead of retransmitting
        orphaned: bool,
    },
    Bulk {
        fb_slot: u16,
        sent_at: Instant,
        deadline: Instant,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrafficClass {
    Queued,
    Bulk,
}

/// What became of an inbound response packet.
#[derive(Debug)]
pub enum Completion {
    /// It answered the outstanding request
    Completed {
        origin: Origin,
        frame_id: u8,
        request_bytes: Vec<u8>,
    },
    /// Mnemonic/address did not match what was sent: noise; the original
    /// request went out again
    Retransmitted,
    /// Nothing outstanding matched it
    Ignored,
}

#[derive(Debug, Default)]
pub struct LinkStats {
    pub frames_sent: u64,
    pub bulk_sent: u64,
    pub retransmissions: u64,
    pub feedback_timeouts: u64,
}

pub struct LinkScheduler {
    frame_ids: NumberAllocator,
    queue: VecDeque<QueuedRequest>,
    outstanding: Option<Outstanding>,
    next_class: TrafficClass,
    /// Last slot solicited for feedback
    feedback_cursor: u16,
    timeout: Duration,
    pub stats: LinkStats,
}

impl LinkScheduler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            // Frame number 0 is reserved for "no response expected".
            frame_ids: NumberAllocator::new(1, 255),
            queue: VecDeque::new(),
            outstanding: None,
            next_class: TrafficClass::Queued,
            feedback_cursor: 0,
            timeout,
            stats: LinkStats::default(),
        }
    }

    pub fn alloc_frame_id(&mut self) -> Option<u8> {
        self.frame_ids.alloc().map(|id| id as u8)
    }

    pub fn free_frame_ids(&self) -> usize {
        self.frame_ids.available()
    }

    pub fn enqueue(&mut self, request: QueuedRequest) {
        trace!(
            "Queued {:?} request, {} bytes, frame {:?}",
            request.origin,
            request.bytes.len(),
            request.frame_id
        );
        self.queue.push_back(request);
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding.is_none()
    }

    pub fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Deadline of the outstanding item, if any.
    pub fn deadline(&self) -> Option<Instant> {
        match &self.outstanding {
            Some(Outstanding::Queued { deadline, .. }) | Some(Outstanding::Bulk { deadline, .. }) => {
                Some(*deadline)
            }
            None => None,
        }
    }

    /// Drive the pump until something is outstanding or nothing is sendable.
    ///
    /// `eligible_slots` must be the sorted slots currently in an active
    /// lifecycle; `build_bulk` assembles the broadcast payload with the
    /// given slot flagged for feedback.
    pub fn pump(
        &mut self,
        link: &mut dyn Link,
        eligible_slots: &[u16],
        mut build_bulk: impl FnMut(u16) -> Vec<u8>,
    ) -> Result<()> {
        loop {
            if self.outstanding.is_some() {
                return Ok(());
            }

            let class = match (!self.queue.is_empty(), !eligible_slots.is_empty()) {
                (false, false) => return Ok(()),
                (true, false) => TrafficClass::Queued,
                (false, true) => TrafficClass::Bulk,
                (true, true) => {
                    let class = self.next_class;
                    self.next_class = match class {
                        TrafficClass::Queued => TrafficClass::Bulk,
                        TrafficClass::Bulk => TrafficClass::Queued,
                    };
                    class
                }
            };

            match class {
                TrafficClass::Queued => {
                    let request = self.queue.pop_front().expect("queued class chosen empty");
                    link.send(&request.bytes)?;
                    self.stats.frames_sent += 1;
                    if request.frame_id.is_some() {
                        self.outstanding = Some(Outstanding::Queued {
                            request,
                            deadline: Instant::now() + self.timeout,
                            orphaned: false,
                        });
                    }
                    // Requests with no expected response never block the pump.
                }
                TrafficClass::Bulk => {
                    let fb_slot = Self::next_feedback_slot(eligible_slots, self.feedback_cursor);
                    self.feedback_cursor = fb_slot;
                    let payload = build_bulk(fb_slot);
                    let packet = wire::transmit16(
                        wire::FRAME_ID_NONE,
                        wire::BROADCAST_ADDRESS,
                        wire::TX_OPTION_NO_ACK,
                        &payload,
                    );
                    link.send(&packet)?;
                    self.stats.frames_sent += 1;
                    self.stats.bulk_sent += 1;
                    let now = Instant::now();
                    self.outstanding = Some(Outstanding::Bulk {
                        fb_slot,
                        sent_at: now,
                        deadline: now + self.timeout,
                    });
                }
            }
        }
    }

    /// The first eligible slot after `cursor`, wrapping; visits every
    /// eligible slot infinitely often as long as it stays eligible.
    fn next_feedback_slot(eligible: &[u16], cursor: u16) -> u16 {
        debug_assert!(!eligible.is_empty());
        eligible
            .iter()
            .copied()
            .find(|&slot| slot > cursor)
            .unwrap_or(eligible[0])
    }

    /// Route a response-class packet against the outstanding request.
    pub fn on_response(&mut self, packet: &ApiPacket<'_>, link: &mut dyn Link) -> Result<Completion> {
        let Some(response_id) = packet.frame_id() else {
            return Ok(Completion::Ignored);
        };

        let Some(Outstanding::Queued { request, .. }) = &self.outstanding else {
            return Ok(Completion::Ignored);
        };
        if request.frame_id != Some(response_id) {
            return Ok(Completion::Ignored);
        }

        if !Self::response_matches(packet, &request.bytes) {
            // Noise wearing our frame number; send the original again.
            warn!(
                "Response for frame {} does not match the request, retransmitting",
                response_id
            );
            let bytes = request.bytes.clone();
            link.send(&bytes)?;
            self.stats.frames_sent += 1;
            self.stats.retransmissions += 1;
            if let Some(Outstanding::Queued { deadline, .. }) = &mut self.outstanding {
                *deadline = Instant::now() + self.timeout;
            }
            return Ok(Completion::Retransmitted);
        }

        let Some(Outstanding::Queued { request, .. }) = self.outstanding.take() else {
            unreachable!();
        };
        self.frame_ids.free(response_id as u16);
        debug!("Frame {} completed for {:?}", response_id, request.origin);
        Ok(Completion::Completed {
            origin: request.origin,
            frame_id: response_id,
            request_bytes: request.bytes,
        })
    }

    /// Whether a response's command/address agree with the request bytes.
    fn response_matches(packet: &ApiPacket<'_>, request: &[u8]) -> bool {
        match packet {
            ApiPacket::LocalAtResponse { command, .. } => {
                request.first() == Some(&wire::API_LOCAL_AT_REQUEST)
                    && request.get(2..4) == Some(&command[..])
            }
            ApiPacket::RemoteAtResponse {
                address64, command, ..
            } => {
                request.first() == Some(&wire::API_REMOTE_AT_REQUEST)
                    && request.get(2..10) == Some(&address64.to_be_bytes()[..])
                    && request.get(13..15) == Some(&command[..])
            }
            ApiPacket::TransmitStatus { .. } => {
                request.first() == Some(&wire::API_TRANSMIT16)
            }
            ApiPacket::Receive16 { .. } => false,
        }
    }

    /// The outstanding item's deadline passed. Returns the slot whose
    /// feedback solicitation timed out, if that is what expired.
    pub fn on_timeout(&mut self, link: &mut dyn Link) -> Result<Option<u16>> {
        match self.outstanding.take() {
            Some(Outstanding::Queued {
                request,
                orphaned: false,
                ..
            }) => {
                trace!("Frame {:?} timed out, retransmitting", request.frame_id);
                link.send(&request.bytes)?;
                self.stats.frames_sent += 1;
                self.stats.retransmissions += 1;
                self.outstanding = Some(Outstanding::Queued {
                    request,
                    deadline: Instant::now() + self.timeout,
                    orphaned: false,
                });
                Ok(None)
            }
            Some(Outstanding::Queued {
                request,
                orphaned: true,
                ..
            }) => {
                // The owner is gone; stop the retransmit loop and return the
                // frame number.
                if let Some(frame_id) = request.frame_id {
                    self.frame_ids.free(frame_id as u16);
                }
                debug!("Dropped orphaned frame {:?}", request.frame_id);
                Ok(None)
            }
            Some(Outstanding::Bulk { fb_slot, .. }) => {
                self.stats.feedback_timeouts += 1;
                Ok(Some(fb_slot))
            }
            None => Ok(None),
        }
    }

    /// The slot whose feedback solicitation is outstanding, if any.
    pub fn pending_feedback_slot(&self) -> Option<u16> {
        match &self.outstanding {
            Some(Outstanding::Bulk { fb_slot, .. }) => Some(*fb_slot),
            _ => None,
        }
    }

    /// Feedback arrived; completes the bulk item if one is outstanding.
    /// Returns the solicited slot and the round-trip time.
    pub fn feedback_received(&mut self) -> Option<(u16, Duration)> {
        match self.outstanding.take() {
            Some(Outstanding::Bulk {
                fb_slot, sent_at, ..
            }) => Some((fb_slot, sent_at.elapsed())),
            other => {
                self.outstanding = other;
                None
            }
        }
    }

    /// A client disconnected: its queued requests are dropped and their
    /// frame numbers freed. An in-flight request is not cancelled (nothing
    /// on the link ever is) but is orphaned so its next timeout retires it.
    pub fn purge_client(&mut self, client: ClientId) {
        let target = Origin::Client { client };
        self.queue.retain(|request| {
            if request.origin != target {
                return true;
            }
            if let Some(frame_id) = request.frame_id {
                self.frame_ids.free(frame_id as u16);
            }
            false
        });

        if let Some(Outstanding::Queued {
            request, orphaned, ..
        }) = &mut self.outstanding
        {
            if request.origin == target {
                *orphaned = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockLink;
    use crate::wire::{parse_api_packet, remote_at_request, AT_SHORT_ADDRESS};

    const TIMEOUT: Duration = Duration::from_millis(75);

    fn scheduler() -> LinkScheduler {
        LinkScheduler::new(TIMEOUT)
    }

    fn remote_request(sched: &mut LinkScheduler, address64: u64) -> (QueuedRequest, u8) {
        let frame_id = sched.alloc_frame_id().unwrap();
        let bytes = remote_at_request(
            frame_id,
            address64,
            wire::ADDRESS16_UNKNOWN,
            0,
            AT_SHORT_ADDRESS,
            &[0x00, 0x2A],
        );
        (
            QueuedRequest {
                bytes,
                frame_id: Some(frame_id),
                origin: Origin::Robot { address64 },
            },
            frame_id,
        )
    }

    fn remote_response(frame_id: u8, address64: u64) -> Vec<u8> {
        let mut raw = vec![wire::API_REMOTE_AT_RESPONSE, frame_id];
        raw.extend_from_slice(&address64.to_be_bytes());
        raw.extend_from_slice(&[0x00, 0x2A]);
        raw.extend_from_slice(&AT_SHORT_ADDRESS);
        raw.push(0);
        raw
    }

    #[test]
    fn test_single_outstanding_item() {
        let mut sched = scheduler();
        let mut link = MockLink::new();
        let sent = link.sent_handle();

        let (first, first_id) = remote_request(&mut sched, 0x1111);
        let (second, _) = remote_request(&mut sched, 0x2222);
        sched.enqueue(first);
        sched.enqueue(second);

        sched.pump(&mut link, &[], |_| unreachable!()).unwrap();
        assert_eq!(sent.borrow().len(), 1, "only one item may be on the link");
        assert!(!sched.is_idle());

        // Pumping again while outstanding sends nothing.
        sched.pump(&mut link, &[], |_| unreachable!()).unwrap();
        assert_eq!(sent.borrow().len(), 1);

        // The response releases the pump.
        let raw = remote_response(first_id, 0x1111);
        let packet = parse_api_packet(&raw).unwrap();
        let completion = sched.on_response(&packet, &mut link).unwrap();
        assert!(matches!(
            completion,
            Completion::Completed {
                origin: Origin::Robot { address64: 0x1111 },
                ..
            }
        ));
        assert!(sched.is_idle());

        sched.pump(&mut link, &[], |_| unreachable!()).unwrap();
        assert_eq!(sent.borrow().len(), 2);
    }

    #[test]
    fn test_no_response_request_does_not_block_pump() {
        let mut sched = scheduler();
        let mut link = MockLink::new();
        let sent = link.sent_handle();

        sched.enqueue(QueuedRequest {
            bytes: wire::transmit16(wire::FRAME_ID_NONE, 0x2A, 0, &[1, 2, 3]),
            frame_id: None,
            origin: Origin::Client { client: 1 },
        });
        let (req, _) = remote_request(&mut sched, 0x1111);
        sched.enqueue(req);

        sched.pump(&mut link, &[], |_| unreachable!()).unwrap();
        // Both went out back to back; only the second is outstanding.
        assert_eq!(sent.borrow().len(), 2);
        assert!(!sched.is_idle());
    }

    #[test]
    fn test_round_robin_alternation_when_both_classes_have_data() {
        let mut sched = scheduler();
        let mut link = MockLink::new();
        let sent = link.sent_handle();
        let eligible = [0u16];

        for _ in 0..2 {
            let (req, _) = remote_request(&mut sched, 0x1111);
            sched.enqueue(req);
        }

        let mut classes = Vec::new();
        for _ in 0..4 {
            sched.pump(&mut link, &eligible, |_| vec![0; 9]).unwrap();
            let last = sent.borrow().last().unwrap().clone();
            classes.push(if last[0] == wire::API_TRANSMIT16 && last[2..4] == [0xFF, 0xFF] {
                "bulk"
            } else {
                "queued"
            });
            // Complete whatever is outstanding via timeout-free paths.
            if sched.feedback_received().is_none() {
                let raw = remote_response(last[1], 0x1111);
                let packet = parse_api_packet(&raw).unwrap();
                sched.on_response(&packet, &mut link).unwrap();
            }
        }

        assert_eq!(classes, vec!["queued", "bulk", "queued", "bulk"]);
    }

    #[test]
    fn test_timeout_retransmits_identical_bytes_and_keeps_frame_id() {
        let mut sched = scheduler();
        let mut link = MockLink::new();
        let sent = link.sent_handle();

        let before = sched.free_frame_ids();
        let (req, _) = remote_request(&mut sched, 0x1111);
        sched.enqueue(req);
        sched.pump(&mut link, &[], |_| unreachable!()).unwrap();

        assert!(sched.on_timeout(&mut link).unwrap().is_none());
        assert!(sched.on_timeout(&mut link).unwrap().is_none());

        let sent = sent.borrow();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], sent[1]);
        assert_eq!(sent[1], sent[2]);
        // The frame number stays leased across retransmissions.
        assert_eq!(sched.free_frame_ids(), before - 1);
        assert_eq!(sched.stats.retransmissions, 2);
    }

    #[test]
    fn test_mismatched_response_is_noise_and_retransmits() {
        let mut sched = scheduler();
        let mut link = MockLink::new();
        let sent = link.sent_handle();

        let (req, frame_id) = remote_request(&mut sched, 0x1111);
        sched.enqueue(req);
        sched.pump(&mut link, &[], |_| unreachable!()).unwrap();

        // Right frame number, wrong robot.
        let raw = remote_response(frame_id, 0xBAD);
        let packet = parse_api_packet(&raw).unwrap();
        let completion = sched.on_response(&packet, &mut link).unwrap();
        assert!(matches!(completion, Completion::Retransmitted));
        assert!(!sched.is_idle());
        assert_eq!(sent.borrow().len(), 2);

        // The genuine response still completes it.
        let raw = remote_response(frame_id, 0x1111);
        let packet = parse_api_packet(&raw).unwrap();
        assert!(matches!(
            sched.on_response(&packet, &mut link).unwrap(),
            Completion::Completed { .. }
        ));
    }

    #[test]
    fn test_feedback_round_robin_visits_all_eligible_slots() {
        let mut sched = scheduler();
        let mut link = MockLink::new();
        let eligible = [1u16, 3, 7];

        let mut visited = Vec::new();
        for _ in 0..9 {
            sched.pump(&mut link, &eligible, |_| vec![0; 9]).unwrap();
            let (slot, _) = sched.feedback_received().unwrap();
            visited.push(slot);
        }

        assert_eq!(visited, vec![1, 3, 7, 1, 3, 7, 1, 3, 7]);
    }

    #[test]
    fn test_feedback_timeout_reports_solicited_slot() {
        let mut sched = scheduler();
        let mut link = MockLink::new();

        sched.pump(&mut link, &[4], |_| vec![0; 9]).unwrap();
        assert_eq!(sched.on_timeout(&mut link).unwrap(), Some(4));
        assert!(sched.is_idle());
        assert_eq!(sched.stats.feedback_timeouts, 1);
    }

    #[test]
    fn test_purge_client_frees_queued_frames_and_orphans_inflight() {
        let mut sched = scheduler();
        let mut link = MockLink::new();
        let sent = link.sent_handle();
        let capacity = sched.free_frame_ids();

        // One in flight, one still queued, both from client 9.
        for _ in 0..2 {
            let frame_id = sched.alloc_frame_id().unwrap();
            sched.enqueue(QueuedRequest {
                bytes: remote_at_request(
                    frame_id,
                    0x1111,
                    wire::ADDRESS16_UNKNOWN,
                    0,
                    AT_SHORT_ADDRESS,
                    &[],
                ),
                frame_id: Some(frame_id),
                origin: Origin::Client { client: 9 },
            });
        }
        sched.pump(&mut link, &[], |_| unreachable!()).unwrap();
        assert_eq!(sched.free_frame_ids(), capacity - 2);

        sched.purge_client(9);
        // The queued one is gone already; the in-flight one retires at its
        // next timeout without a retransmission.
        assert_eq!(sched.free_frame_ids(), capacity - 1);
        let sends_before = sent.borrow().len();
        assert!(sched.on_timeout(&mut link).unwrap().is_none());
        assert_eq!(sent.borrow().len(), sends_before);
        assert_eq!(sched.free_frame_ids(), capacity);
        assert!(sched.is_idle());
    }
}
