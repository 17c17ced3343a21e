//! Per-robot resource state machine
//!
//! One [`RobotRecord`] per 64-bit hardware address ever mentioned, created
//! lazily and never destroyed. A record owns the robot's leased short
//! address and telemetry slot across the claimed lifecycle and drives the
//! bring-up and bring-down handshakes.
//!
//! Transition handlers return [`Action`]s for the daemon to apply (queue a
//! radio command, notify the claiming client, free resources, scrub a
//! slot). Keeping the machine free of I/O makes the race-prone transitions
//! directly testable.
//!
//! Retry policy is asymmetric on purpose: bring-up commands (`Setting16`,
//! `SettingRdo`) resend forever because a powered-off robot is not an error
//! and the client is waiting; teardown commands (`Releasing16`, the two
//! bootload-line states) give up after [`TEARDOWN_MAX_ATTEMPTS`] so the
//! leased resources always come back even if the robot is gone for good.

use crate::clients::ClientId;
use crate::wire::{
    AtStatus, MetaPacket, RunData, AT_BOOTLOAD_LINE, AT_RUN_OFFSET, AT_SHORT_ADDRESS,
    BOOTLOAD_LINE_HIGH, BOOTLOAD_LINE_LOW, SHORT_ADDRESS_NONE, SLOT_NONE,
};
use tracing::{debug, info};

/// Bound on teardown command retries before the step is assumed done.
pub const TEARDOWN_MAX_ATTEMPTS: u32 = 20;

/// The 16 most recent delivery outcomes; all-zero means the robot is dead.
pub const DEAD_WINDOW: u64 = 0xFFFF;

/// Lifecycle states. Each arm carries only the data valid in that state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotState {
    Idle,
    Raw {
        address16: u16,
    },
    Setting16 {
        address16: u16,
        slot: u16,
    },
    SettingRdo {
        address16: u16,
        slot: u16,
    },
    Alive {
        address16: u16,
        slot: u16,
    },
    Releasing16 {
        address16: u16,
        slot: u16,
        attempts: u32,
    },
    BootloadingHigh {
        address16: u16,
        slot: u16,
        attempts: u32,
    },
    BootloadingLow {
        address16: u16,
        slot: u16,
        attempts: u32,
    },
    BootloadingLowToSetting16 {
        address16: u16,
        slot: u16,
        attempts: u32,
    },
}

/// Side effects for the daemon to apply after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Queue a remote AT command to this robot
    SendAt { command: [u8; 2], value: Vec<u8> },
    /// Send a meta packet to the claiming client
    Notify(MetaPacket),
    /// Return both leased resources to their pools
    FreeResources { address16: u16, slot: u16 },
    /// Return a raw-mode short address to its pool
    FreeAddress { address16: u16 },
    /// Zero the telemetry slot before reuse
    ScrubSlot { slot: u16 },
}

pub struct RobotRecord {
    pub address64: u64,
    pub state: RobotState,
    /// The claiming client; absent while unclaimed (including teardown)
    pub client: Option<ClientId>,
}

fn set_address_value(address16: u16) -> Vec<u8> {
    address16.to_be_bytes().to_vec()
}

fn run_offset_value(slot: u16) -> Vec<u8> {
    vec![(slot as usize * RunData::SIZE) as u8]
}

impl RobotRecord {
    pub fn new(address64: u64) -> Self {
        Self {
            address64,
            state: RobotState::Idle,
            client: None,
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.client.is_some()
    }

    /// The slot while it participates in the bulk broadcast.
    pub fn active_slot(&self) -> Option<u16> {
        match self.state {
            RobotState::SettingRdo { slot, .. } | RobotState::Alive { slot, .. } => Some(slot),
            _ => None,
        }
    }

    /// The short address held in any state that has one.
    pub fn address16(&self) -> Option<u16> {
        match self.state {
            RobotState::Idle => None,
            RobotState::Raw { address16 }
            | RobotState::Setting16 { address16, .. }
            | RobotState::SettingRdo { address16, .. }
            | RobotState::Alive { address16, .. }
            | RobotState::Releasing16 { address16, .. }
            | RobotState::BootloadingHigh { address16, .. }
            | RobotState::BootloadingLow { address16, .. }
            | RobotState::BootloadingLowToSetting16 { address16, .. } => Some(address16),
        }
    }

    /// Whether a new drive-mode claim may attach in the current state.
    /// The multiplexer consults this before touching the machine.
    pub fn admits_drive_claim(&self) -> bool {
        !self.is_claimed()
            && matches!(
                self.state,
                RobotState::Idle
                    | RobotState::BootloadingHigh { .. }
                    | RobotState::BootloadingLow { .. }
            )
    }

    pub fn admits_raw_claim(&self) -> bool {
        !self.is_claimed() && matches!(self.state, RobotState::Idle)
    }

    /// Raw-mode claim. The short address comes freshly allocated.
    pub fn claim_raw(&mut self, client: ClientId, address16: u16) -> Vec<Action> {
        assert!(
            !self.is_claimed(),
            "claim of already-claimed robot {:016x}",
            self.address64
        );
        assert!(
            matches!(self.state, RobotState::Idle),
            "raw claim of robot {:016x} in {:?}",
            self.address64,
            self.state
        );

        info!("Robot {:016x} claimed raw, address16={:#06x}", self.address64, address16);
        self.state = RobotState::Raw { address16 };
        self.client = Some(client);

        // Raw mode has no handshake; acknowledge right away.
        vec![Action::Notify(MetaPacket::Alive {
            address64: self.address64,
            address16,
            slot: SLOT_NONE,
        })]
    }

    /// Drive-mode claim. `fresh` carries newly allocated resources for an
    /// Idle robot; a robot caught mid-teardown reuses the pair it still
    /// holds and `fresh` must be `None`.
    pub fn claim_drive(&mut self, client: ClientId, fresh: Option<(u16, u16)>) -> Vec<Action> {
        assert!(
            !self.is_claimed(),
            "claim of already-claimed robot {:016x}",
            self.address64
        );

        match self.state {
            RobotState::Idle => {
                let (address16, slot) = fresh.expect("drive claim from Idle needs resources");
                info!(
                    "Robot {:016x} claimed drive, address16={:#06x} slot={}",
                    self.address64, address16, slot
                );
                self.state = RobotState::Setting16 { address16, slot };
                self.client = Some(client);
                vec![
                    Action::ScrubSlot { slot },
                    Action::SendAt {
                        command: AT_SHORT_ADDRESS,
                        value: set_address_value(address16),
                    },
                ]
            }
            RobotState::BootloadingHigh {
                address16,
                slot,
                attempts,
            } => {
                assert!(fresh.is_none(), "mid-teardown claim must reuse held resources");
                info!(
                    "Robot {:016x} reclaimed during bootload raise, slot={}",
                    self.address64, slot
                );
                // The raise is still in flight; the line must come back down
                // before the handshake restarts.
                self.state = RobotState::BootloadingLowToSetting16 {
                    address16,
                    slot,
                    attempts,
                };
                self.client = Some(client);
                vec![Action::ScrubSlot { slot }]
            }
            RobotState::BootloadingLow {
                address16,
                slot,
                attempts: _,
            } => {
                assert!(fresh.is_none(), "mid-teardown claim must reuse held resources");
                info!(
                    "Robot {:016x} reclaimed during bootload lower, slot={}",
                    self.address64, slot
                );
                // The lower is already in flight; no second line cycle. Its
                // stale completion is ignored once we are in Setting16.
                self.state = RobotState::Setting16 { address16, slot };
                self.client = Some(client);
                vec![
                    Action::ScrubSlot { slot },
                    Action::SendAt {
                        command: AT_SHORT_ADDRESS,
                        value: set_address_value(address16),
                    },
                ]
            }
            _ => panic!(
                "drive claim of robot {:016x} in {:?} not rejected by admission",
                self.address64, self.state
            ),
        }
    }

    /// Drop the claim. Drive lifecycles enter the teardown branch; raw
    /// claims return to Idle at once.
    pub fn release(&mut self) -> Vec<Action> {
        self.client = None;

        match self.state {
            RobotState::Raw { address16 } => {
                info!("Robot {:016x} released (raw)", self.address64);
                self.state = RobotState::Idle;
                // Raw mode leases no slot and has no bring-down handshake,
                // so the address goes straight back to the pool.
                vec![Action::FreeAddress { address16 }]
            }
            RobotState::Setting16 { address16, slot }
            | RobotState::SettingRdo { address16, slot }
            | RobotState::Alive { address16, slot } => {
                info!("Robot {:016x} released, tearing down", self.address64);
                self.state = RobotState::Releasing16 {
                    address16,
                    slot,
                    attempts: 1,
                };
                vec![Action::SendAt {
                    command: AT_SHORT_ADDRESS,
                    value: set_address_value(SHORT_ADDRESS_NONE),
                }]
            }
            RobotState::BootloadingLowToSetting16 {
                address16,
                slot,
                attempts,
            } => {
                // The pending reclaim is withdrawn; resume the plain
                // teardown that was already under way.
                debug!("Robot {:016x} reclaim withdrawn", self.address64);
                self.state = RobotState::BootloadingLow {
                    address16,
                    slot,
                    attempts,
                };
                Vec::new()
            }
            _ => panic!(
                "release of robot {:016x} in {:?} not rejected by admission",
                self.address64, self.state
            ),
        }
    }

    /// A queued AT command for this robot completed with `status`. Stale
    /// completions (command/value not expected by the current state, e.g.
    /// after a mid-flight claim or release) are ignored; in-flight traffic
    /// is never cancelled, only outlived.
    pub fn at_completed(
        &mut self,
        command: [u8; 2],
        sent_value: &[u8],
        status: AtStatus,
    ) -> Vec<Action> {
        match self.state {
            RobotState::Setting16 { address16, slot } => {
                if command != AT_SHORT_ADDRESS || sent_value != set_address_value(address16) {
                    return Vec::new();
                }
                match status {
                    AtStatus::Ok => {
                        debug!("Robot {:016x} short address set", self.address64);
                        self.state = RobotState::SettingRdo { address16, slot };
                        vec![Action::SendAt {
                            command: AT_RUN_OFFSET,
                            value: run_offset_value(slot),
                        }]
                    }
                    // Powered-off robot: keep knocking until the claim ends.
                    AtStatus::NoResponse => vec![Action::SendAt {
                        command: AT_SHORT_ADDRESS,
                        value: set_address_value(address16),
                    }],
                    other => panic!(
                        "robot {:016x} rejected short-address assignment: {:?}",
                        self.address64, other
                    ),
                }
            }
            RobotState::SettingRdo { slot, .. } => {
                if command != AT_RUN_OFFSET || sent_value != run_offset_value(slot) {
                    return Vec::new();
                }
                match status {
                    // The slot is broadcasting; aliveness arrives as feedback.
                    AtStatus::Ok => Vec::new(),
                    AtStatus::NoResponse => vec![Action::SendAt {
                        command: AT_RUN_OFFSET,
                        value: run_offset_value(slot),
                    }],
                    other => panic!(
                        "robot {:016x} rejected run-data offset: {:?}",
                        self.address64, other
                    ),
                }
            }
            RobotState::Releasing16 {
                address16,
                slot,
                attempts,
            } => {
                if command != AT_SHORT_ADDRESS
                    || sent_value != set_address_value(SHORT_ADDRESS_NONE)
                {
                    return Vec::new();
                }
                match status {
                    AtStatus::NoResponse if attempts < TEARDOWN_MAX_ATTEMPTS => {
                        self.state = RobotState::Releasing16 {
                            address16,
                            slot,
                            attempts: attempts + 1,
                        };
                        vec![Action::SendAt {
                            command: AT_SHORT_ADDRESS,
                            value: set_address_value(SHORT_ADDRESS_NONE),
                        }]
                    }
                    AtStatus::Ok | AtStatus::NoResponse => {
                        // Cleared, or the robot is gone; either way move on.
                        self.state = RobotState::BootloadingHigh {
                            address16,
                            slot,
                            attempts: 1,
                        };
                        vec![Action::SendAt {
                            command: AT_BOOTLOAD_LINE,
                            value: vec![BOOTLOAD_LINE_HIGH],
                        }]
                    }
                    other => panic!(
                        "robot {:016x} rejected short-address clear: {:?}",
                        self.address64, other
                    ),
                }
            }
            RobotState::BootloadingHigh {
                address16,
                slot,
                attempts,
            } => {
                if command != AT_BOOTLOAD_LINE || sent_value != [BOOTLOAD_LINE_HIGH] {
                    return Vec::new();
                }
                match status {
                    AtStatus::NoResponse if attempts < TEARDOWN_MAX_ATTEMPTS => {
                        self.state = RobotState::BootloadingHigh {
                            address16,
                            slot,
                            attempts: attempts + 1,
                        };
                        vec![Action::SendAt {
                            command: AT_BOOTLOAD_LINE,
                            value: vec![BOOTLOAD_LINE_HIGH],
                        }]
                    }
                    AtStatus::Ok | AtStatus::NoResponse => {
                        self.state = RobotState::BootloadingLow {
                            address16,
                            slot,
                            attempts: 1,
                        };
                        vec![Action::SendAt {
                            command: AT_BOOTLOAD_LINE,
                            value: vec![BOOTLOAD_LINE_LOW],
                        }]
                    }
                    other => panic!(
                        "robot {:016x} rejected bootload raise: {:?}",
                        self.address64, other
                    ),
                }
            }
            RobotState::BootloadingLow {
                address16,
                slot,
                attempts,
            } => {
                if command != AT_BOOTLOAD_LINE {
                    return Vec::new();
                }
                // A release out of BootloadingLowToSetting16 can land here
                // with the raise still in flight; finish it, then lower.
                if sent_value == [BOOTLOAD_LINE_HIGH] {
                    return match status {
                        AtStatus::NoResponse if attempts < TEARDOWN_MAX_ATTEMPTS => {
                            self.state = RobotState::BootloadingLow {
                                address16,
                                slot,
                                attempts: attempts + 1,
                            };
                            vec![Action::SendAt {
                                command: AT_BOOTLOAD_LINE,
                                value: vec![BOOTLOAD_LINE_HIGH],
                            }]
                        }
                        AtStatus::Ok | AtStatus::NoResponse => {
                            self.state = RobotState::BootloadingLow {
                                address16,
                                slot,
                                attempts: 1,
                            };
                            vec![Action::SendAt {
                                command: AT_BOOTLOAD_LINE,
                                value: vec![BOOTLOAD_LINE_LOW],
                            }]
                        }
                        other => panic!(
                            "robot {:016x} rejected bootload raise: {:?}",
                            self.address64, other
                        ),
                    };
                }
                if sent_value != [BOOTLOAD_LINE_LOW] {
                    return Vec::new();
                }
                match status {
                    AtStatus::NoResponse if attempts < TEARDOWN_MAX_ATTEMPTS => {
                        self.state = RobotState::BootloadingLow {
                            address16,
                            slot,
                            attempts: attempts + 1,
                        };
                        vec![Action::SendAt {
                            command: AT_BOOTLOAD_LINE,
                            value: vec![BOOTLOAD_LINE_LOW],
                        }]
                    }
                    AtStatus::Ok | AtStatus::NoResponse => {
                        info!("Robot {:016x} teardown complete", self.address64);
                        self.state = RobotState::Idle;
                        // The single point where the leased pair goes back.
                        vec![
                            Action::FreeResources { address16, slot },
                            Action::ScrubSlot { slot },
                        ]
                    }
                    other => panic!(
                        "robot {:016x} rejected bootload lower: {:?}",
                        self.address64, other
                    ),
                }
            }
            RobotState::BootloadingLowToSetting16 {
                address16,
                slot,
                attempts,
            } => {
                if command != AT_BOOTLOAD_LINE {
                    return Vec::new();
                }
                if sent_value == [BOOTLOAD_LINE_HIGH] {
                    return match status {
                        AtStatus::NoResponse if attempts < TEARDOWN_MAX_ATTEMPTS => {
                            self.state = RobotState::BootloadingLowToSetting16 {
                                address16,
                                slot,
                                attempts: attempts + 1,
                            };
                            vec![Action::SendAt {
                                command: AT_BOOTLOAD_LINE,
                                value: vec![BOOTLOAD_LINE_HIGH],
                            }]
                        }
                        AtStatus::Ok | AtStatus::NoResponse => {
                            self.state = RobotState::BootloadingLowToSetting16 {
                                address16,
                                slot,
                                attempts: 1,
                            };
                            vec![Action::SendAt {
                                command: AT_BOOTLOAD_LINE,
                                value: vec![BOOTLOAD_LINE_LOW],
                            }]
                        }
                        other => panic!(
                            "robot {:016x} rejected bootload raise: {:?}",
                            self.address64, other
                        ),
                    };
                }
                if sent_value != [BOOTLOAD_LINE_LOW] {
                    return Vec::new();
                }
                match status {
                    AtStatus::NoResponse if attempts < TEARDOWN_MAX_ATTEMPTS => {
                        self.state = RobotState::BootloadingLowToSetting16 {
                            address16,
                            slot,
                            attempts: attempts + 1,
                        };
                        vec![Action::SendAt {
                            command: AT_BOOTLOAD_LINE,
                            value: vec![BOOTLOAD_LINE_LOW],
                        }]
                    }
                    AtStatus::Ok | AtStatus::NoResponse => {
                        info!(
                            "Robot {:016x} line lowered, serving pending claim",
                            self.address64
                        );
                        self.state = RobotState::Setting16 { address16, slot };
                        vec![Action::SendAt {
                            command: AT_SHORT_ADDRESS,
                            value: set_address_value(address16),
                        }]
                    }
                    other => panic!(
                        "robot {:016x} rejected bootload lower: {:?}",
                        self.address64, other
                    ),
                }
            }
            // Idle, Raw and Alive expect no AT completions of their own;
            // anything arriving is a stale remnant of an earlier state.
            RobotState::Idle | RobotState::Raw { .. } | RobotState::Alive { .. } => Vec::new(),
        }
    }

    /// Feedback arrived for this robot's slot.
    pub fn feedback_received(&mut self, _mask_after: u64) -> Vec<Action> {
        match self.state {
            RobotState::SettingRdo { address16, slot } => {
                info!("Robot {:016x} alive on slot {}", self.address64, slot);
                self.state = RobotState::Alive { address16, slot };
                vec![Action::Notify(MetaPacket::Alive {
                    address64: self.address64,
                    address16,
                    slot: slot as u8,
                })]
            }
            RobotState::Alive { .. } => vec![Action::Notify(MetaPacket::Feedback {
                address64: self.address64,
            })],
            // Feedback solicited before a release landed; teardown goes on.
            _ => Vec::new(),
        }
    }

    /// The feedback solicitation for this robot's slot timed out.
    /// `mask_after` is the delivery mask with the failure already shifted in.
    pub fn feedback_timeout(&mut self, mask_after: u64) -> Vec<Action> {
        match self.state {
            RobotState::SettingRdo { address16, slot } => {
                // Handshake didn't stick; start over from the address.
                debug!("Robot {:016x} no feedback, re-handshaking", self.address64);
                self.state = RobotState::Setting16 { address16, slot };
                vec![Action::SendAt {
                    command: AT_SHORT_ADDRESS,
                    value: set_address_value(address16),
                }]
            }
            RobotState::Alive { address16, slot } => {
                if mask_after & DEAD_WINDOW != 0 {
                    return Vec::new();
                }
                info!("Robot {:016x} dead, re-handshaking", self.address64);
                self.state = RobotState::Setting16 { address16, slot };
                vec![
                    Action::Notify(MetaPacket::Dead {
                        address64: self.address64,
                    }),
                    Action::SendAt {
                        command: AT_SHORT_ADDRESS,
                        value: set_address_value(address16),
                    },
                ]
            }
            _ => Vec::new(),
        }
    }
}
