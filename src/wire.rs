//! Wire packet shapes shared with the radio and the robots
//!
//! Everything on the link is an API packet: a type byte followed by a fixed
//! header and an optional payload. The same packet shapes travel over the
//! client socket, prefixed with a little-endian u32 length, together with a
//! handful of daemon-private meta packet kinds for claim management.
//!
//! All multi-byte link fields are big-endian. The packed `RUN_DATA` bitfield
//! block is little-endian bit order, matching the robot firmware's layout.

use crate::{Result, XbeedError};

// API packet type bytes
pub const API_LOCAL_AT_REQUEST: u8 = 0x08;
pub const API_LOCAL_AT_RESPONSE: u8 = 0x88;
pub const API_REMOTE_AT_REQUEST: u8 = 0x17;
pub const API_REMOTE_AT_RESPONSE: u8 = 0x97;
pub const API_TRANSMIT16: u8 = 0x01;
pub const API_TRANSMIT_STATUS: u8 = 0x89;
pub const API_RECEIVE16: u8 = 0x81;

// Daemon-private meta packet kinds, carried over the client socket only
pub const META_CLAIM: u8 = 0xF0;
pub const META_CLAIM_FAILED: u8 = 0xF1;
pub const META_ALIVE: u8 = 0xF2;
pub const META_DEAD: u8 = 0xF3;
pub const META_FEEDBACK: u8 = 0xF4;
pub const META_RELEASE: u8 = 0xF5;

// AT command mnemonics used by the handshake sequences
pub const AT_CHANNEL: [u8; 2] = *b"CH";
pub const AT_PAN_ID: [u8; 2] = *b"ID";
pub const AT_SHORT_ADDRESS: [u8; 2] = *b"MY";
pub const AT_RUN_OFFSET: [u8; 2] = *b"RO";
pub const AT_BOOTLOAD_LINE: [u8; 2] = *b"D0";

/// Pin states for the bootload line (digital output high/low)
pub const BOOTLOAD_LINE_HIGH: u8 = 0x05;
pub const BOOTLOAD_LINE_LOW: u8 = 0x04;

/// Short-address value that clears a robot's assignment
pub const SHORT_ADDRESS_NONE: u16 = 0xFFFF;

/// Broadcast short address for the bulk packet
pub const BROADCAST_ADDRESS: u16 = 0xFFFF;

/// 16-bit address field value meaning "route by the 64-bit address"
pub const ADDRESS16_UNKNOWN: u16 = 0xFFFE;

/// Transmit option: do not wait for a MAC-level acknowledgement
pub const TX_OPTION_NO_ACK: u8 = 0x01;

/// Frame ID meaning "no response expected"; never allocated from the pool
pub const FRAME_ID_NONE: u8 = 0;

/// Outbound payload budget of one link packet, in bytes
pub const LINK_PAYLOAD_BUDGET: usize = 100;

/// AT command response status bytes documented by the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtStatus {
    Ok = 0,
    Error = 1,
    InvalidCommand = 2,
    InvalidParameter = 3,
    NoResponse = 4,
}

impl AtStatus {
    /// Decode a status byte; `None` means the byte is outside the documented
    /// set, which callers must treat as a protocol-contract violation.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(AtStatus::Ok),
            1 => Some(AtStatus::Error),
            2 => Some(AtStatus::InvalidCommand),
            3 => Some(AtStatus::InvalidParameter),
            4 => Some(AtStatus::NoResponse),
            _ => None,
        }
    }
}

// Run-data flag bits
pub const RUN_FLAG_RUNNING: u8 = 0x01;
pub const RUN_FLAG_DRIVE: u8 = 0x02;
pub const RUN_FLAG_CHICK: u8 = 0x04;
pub const RUN_FLAG_FEEDBACK: u8 = 0x08;

/// Motor setpoints for one robot, one record per telemetry slot.
///
/// Packed form is 9 bytes: the flags byte, then 8 bytes holding four signed
/// 11-bit wheel setpoints, an unsigned 11-bit dribbler setpoint and an
/// unsigned 9-bit chicker power, packed LSB-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunData {
    pub flags: u8,
    pub wheels: [i16; 4],
    pub dribbler: u16,
    pub chicker: u16,
}

impl RunData {
    pub const SIZE: usize = 9;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut bits: u64 = 0;
        for (i, wheel) in self.wheels.iter().enumerate() {
            bits |= ((*wheel as u16 as u64) & 0x7FF) << (11 * i);
        }
        bits |= ((self.dribbler & 0x7FF) as u64) << 44;
        bits |= ((self.chicker & 0x1FF) as u64) << 55;

        let mut out = [0u8; Self::SIZE];
        out[0] = self.flags;
        out[1..9].copy_from_slice(&bits.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8; Self::SIZE]) -> Self {
        let bits = u64::from_le_bytes(bytes[1..9].try_into().unwrap());
        let mut wheels = [0i16; 4];
        for (i, wheel) in wheels.iter_mut().enumerate() {
            let raw = ((bits >> (11 * i)) & 0x7FF) as u16;
            // sign-extend from 11 bits
            *wheel = ((raw << 5) as i16) >> 5;
        }
        Self {
            flags: bytes[0],
            wheels,
            dribbler: ((bits >> 44) & 0x7FF) as u16,
            chicker: ((bits >> 55) & 0x1FF) as u16,
        }
    }

    /// The scram form of this record: still running, zero actuation.
    pub fn scrammed(&self) -> Self {
        Self {
            flags: self.flags & (RUN_FLAG_RUNNING | RUN_FLAG_FEEDBACK),
            wheels: [0; 4],
            dribbler: 0,
            chicker: 0,
        }
    }
}

/// Feedback record a robot returns when solicited; 7 packed bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeedbackData {
    pub flags: u8,
    pub outbound_rssi: u8,
    pub dribbler_speed: u16,
    pub battery: u16,
    pub faults: u8,
}

impl FeedbackData {
    pub const SIZE: usize = 7;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.flags;
        out[1] = self.outbound_rssi;
        out[2..4].copy_from_slice(&self.dribbler_speed.to_be_bytes());
        out[4..6].copy_from_slice(&self.battery.to_be_bytes());
        out[6] = self.faults;
        out
    }

    pub fn decode(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            flags: bytes[0],
            outbound_rssi: bytes[1],
            dribbler_speed: u16::from_be_bytes(bytes[2..4].try_into().unwrap()),
            battery: u16::from_be_bytes(bytes[4..6].try_into().unwrap()),
            faults: bytes[6],
        }
    }
}

/// Build a local AT command request packet.
pub fn local_at_request(frame_id: u8, command: [u8; 2], value: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(4 + value.len());
    packet.push(API_LOCAL_AT_REQUEST);
    packet.push(frame_id);
    packet.extend_from_slice(&command);
    packet.extend_from_slice(value);
    packet
}

/// Build a remote AT command request packet addressed by 64-bit address.
pub fn remote_at_request(
    frame_id: u8,
    address64: u64,
    address16: u16,
    options: u8,
    command: [u8; 2],
    value: &[u8],
) -> Vec<u8> {
    let mut packet = Vec::with_capacity(15 + value.len());
    packet.push(API_REMOTE_AT_REQUEST);
    packet.push(frame_id);
    packet.extend_from_slice(&address64.to_be_bytes());
    packet.extend_from_slice(&address16.to_be_bytes());
    packet.push(options);
    packet.extend_from_slice(&command);
    packet.extend_from_slice(value);
    packet
}

/// Build a transmit-by-short-address packet.
pub fn transmit16(frame_id: u8, address16: u16, options: u8, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(5 + payload.len());
    packet.push(API_TRANSMIT16);
    packet.push(frame_id);
    packet.extend_from_slice(&address16.to_be_bytes());
    packet.push(options);
    packet.extend_from_slice(payload);
    packet
}

/// A parsed inbound API packet, borrowing the raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiPacket<'a> {
    LocalAtResponse {
        frame_id: u8,
        command: [u8; 2],
        status: u8,
        value: &'a [u8],
    },
    RemoteAtResponse {
        frame_id: u8,
        address64: u64,
        address16: u16,
        command: [u8; 2],
        status: u8,
        value: &'a [u8],
    },
    TransmitStatus {
        frame_id: u8,
        status: u8,
    },
    Receive16 {
        address16: u16,
        rssi: u8,
        options: u8,
        payload: &'a [u8],
    },
}

impl<'a> ApiPacket<'a> {
    /// The frame ID carried by response-type packets.
    pub fn frame_id(&self) -> Option<u8> {
        match self {
            ApiPacket::LocalAtResponse { frame_id, .. } => Some(*frame_id),
            ApiPacket::RemoteAtResponse { frame_id, .. } => Some(*frame_id),
            ApiPacket::TransmitStatus { frame_id, .. } => Some(*frame_id),
            ApiPacket::Receive16 { .. } => None,
        }
    }
}

/// Parse an inbound packet from the link.
pub fn parse_api_packet(bytes: &[u8]) -> Result<ApiPacket<'_>> {
    let short = || XbeedError::Protocol(format!("truncated API packet: {:02x?}", bytes));

    match *bytes.first().ok_or_else(&short)? {
        API_LOCAL_AT_RESPONSE => {
            if bytes.len() < 5 {
                return Err(short());
            }
            Ok(ApiPacket::LocalAtResponse {
                frame_id: bytes[1],
                command: [bytes[2], bytes[3]],
                status: bytes[4],
                value: &bytes[5..],
            })
        }
        API_REMOTE_AT_RESPONSE => {
            if bytes.len() < 15 {
                return Err(short());
            }
            Ok(ApiPacket::RemoteAtResponse {
                frame_id: bytes[1],
                address64: u64::from_be_bytes(bytes[2..10].try_into().unwrap()),
                address16: u16::from_be_bytes(bytes[10..12].try_into().unwrap()),
                command: [bytes[12], bytes[13]],
                status: bytes[14],
                value: &bytes[15..],
            })
        }
        API_TRANSMIT_STATUS => {
            if bytes.len() < 3 {
                return Err(short());
            }
            Ok(ApiPacket::TransmitStatus {
                frame_id: bytes[1],
                status: bytes[2],
            })
        }
        API_RECEIVE16 => {
            if bytes.len() < 5 {
                return Err(short());
            }
            Ok(ApiPacket::Receive16 {
                address16: u16::from_be_bytes(bytes[1..3].try_into().unwrap()),
                rssi: bytes[3],
                options: bytes[4],
                payload: &bytes[5..],
            })
        }
        other => Err(XbeedError::Protocol(format!(
            "unknown API packet type 0x{:02x}",
            other
        ))),
    }
}

/// The frame ID position in outbound request packets, for translation.
pub fn request_frame_id(packet: &[u8]) -> Option<u8> {
    match packet.first()? {
        &API_LOCAL_AT_REQUEST | &API_REMOTE_AT_REQUEST | &API_TRANSMIT16 => packet.get(1).copied(),
        _ => None,
    }
}

/// Rewrite the frame ID byte of a request or response packet in place.
pub fn set_frame_id(packet: &mut [u8], frame_id: u8) {
    debug_assert!(packet.len() >= 2);
    packet[1] = frame_id;
}

/// Why a claim was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimDenied {
    /// Another client (or a teardown in progress) holds the robot
    Locked = 0,
    /// A short address or telemetry slot could not be allocated
    Resource = 1,
}

/// Sentinel slot value in `META_ALIVE` acknowledging a raw-mode claim.
pub const SLOT_NONE: u8 = 0xFF;

/// Daemon-private packets exchanged with clients over the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaPacket {
    Claim { address64: u64, drive: bool },
    ClaimFailed { address64: u64, reason: ClaimDenied },
    Alive { address64: u64, address16: u16, slot: u8 },
    Dead { address64: u64 },
    Feedback { address64: u64 },
    Release { address64: u64 },
}

impl MetaPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(12);
        match *self {
            MetaPacket::Claim { address64, drive } => {
                packet.push(META_CLAIM);
                packet.extend_from_slice(&address64.to_be_bytes());
                packet.push(drive as u8);
            }
            MetaPacket::ClaimFailed { address64, reason } => {
                packet.push(META_CLAIM_FAILED);
                packet.extend_from_slice(&address64.to_be_bytes());
                packet.push(reason as u8);
            }
            MetaPacket::Alive {
                address64,
                address16,
                slot,
            } => {
                packet.push(META_ALIVE);
                packet.extend_from_slice(&address64.to_be_bytes());
                packet.extend_from_slice(&address16.to_be_bytes());
                packet.push(slot);
            }
            MetaPacket::Dead { address64 } => {
                packet.push(META_DEAD);
                packet.extend_from_slice(&address64.to_be_bytes());
            }
            MetaPacket::Feedback { address64 } => {
                packet.push(META_FEEDBACK);
                packet.extend_from_slice(&address64.to_be_bytes());
            }
            MetaPacket::Release { address64 } => {
                packet.push(META_RELEASE);
                packet.extend_from_slice(&address64.to_be_bytes());
            }
        }
        packet
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let short = || XbeedError::Client(format!("truncated meta packet: {:02x?}", bytes));
        let addr = || -> Result<u64> {
            Ok(u64::from_be_bytes(
                bytes.get(1..9).ok_or_else(&short)?.try_into().unwrap(),
            ))
        };

        match *bytes.first().ok_or_else(&short)? {
            META_CLAIM => Ok(MetaPacket::Claim {
                address64: addr()?,
                drive: *bytes.get(9).ok_or_else(&short)? != 0,
            }),
            META_CLAIM_FAILED => {
                let reason = match *bytes.get(9).ok_or_else(&short)? {
                    0 => ClaimDenied::Locked,
                    1 => ClaimDenied::Resource,
                    other => {
                        return Err(XbeedError::Client(format!(
                            "unknown claim-denied reason {}",
                            other
                        )))
                    }
                };
                Ok(MetaPacket::ClaimFailed {
                    address64: addr()?,
                    reason,
                })
            }
            META_ALIVE => Ok(MetaPacket::Alive {
                address64: addr()?,
                address16: u16::from_be_bytes(
                    bytes.get(9..11).ok_or_else(&short)?.try_into().unwrap(),
                ),
                slot: *bytes.get(11).ok_or_else(&short)?,
            }),
            META_DEAD => Ok(MetaPacket::Dead {
                address64: addr()?,
            }),
            META_FEEDBACK => Ok(MetaPacket::Feedback {
                address64: addr()?,
            }),
            META_RELEASE => Ok(MetaPacket::Release {
                address64: addr()?,
            }),
            other => Err(XbeedError::Client(format!(
                "unknown meta packet kind 0x{:02x}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_data_packs_to_known_bytes() {
        let rd = RunData {
            flags: RUN_FLAG_RUNNING | RUN_FLAG_DRIVE,
            wheels: [1, -1, 0, 255],
            dribbler: 0x7FF,
            chicker: 0x100,
        };
        let bytes = rd.encode();

        assert_eq!(bytes.len(), RunData::SIZE);
        assert_eq!(bytes[0], 0x03);
        // wheel0 = 0x001 at bit 0, wheel1 = 0x7FF at bit 11,
        // wheel2 = 0 at bit 22, wheel3 = 0x0FF at bit 33,
        // dribbler = 0x7FF at bit 44, chicker = 0x100 at bit 55
        let bits = 0x001u64
            | (0x7FFu64 << 11)
            | (0x0FFu64 << 33)
            | (0x7FFu64 << 44)
            | (0x100u64 << 55);
        assert_eq!(&bytes[1..9], &bits.to_le_bytes());
    }

    #[test]
    fn test_run_data_sign_extension() {
        let rd = RunData {
            flags: RUN_FLAG_RUNNING,
            wheels: [-1023, 1023, -512, 7],
            dribbler: 300,
            chicker: 511,
        };
        assert_eq!(RunData::decode(&rd.encode()), rd);
    }

    #[test]
    fn test_run_data_scram_keeps_running_flag_only() {
        let rd = RunData {
            flags: RUN_FLAG_RUNNING | RUN_FLAG_DRIVE | RUN_FLAG_CHICK | RUN_FLAG_FEEDBACK,
            wheels: [100, 200, -300, 400],
            dribbler: 500,
            chicker: 200,
        };
        let scrammed = rd.scrammed();
        assert_eq!(scrammed.flags, RUN_FLAG_RUNNING | RUN_FLAG_FEEDBACK);
        assert_eq!(scrammed.wheels, [0; 4]);
        assert_eq!(scrammed.dribbler, 0);
        assert_eq!(scrammed.chicker, 0);
    }

    #[test]
    fn test_feedback_data_layout() {
        let fb = FeedbackData {
            flags: 0x01,
            outbound_rssi: 0x28,
            dribbler_speed: 0x1234,
            battery: 0xABCD,
            faults: 0x05,
        };
        let bytes = fb.encode();
        assert_eq!(bytes, [0x01, 0x28, 0x12, 0x34, 0xAB, 0xCD, 0x05]);
        assert_eq!(FeedbackData::decode(&bytes), fb);
    }

    #[test]
    fn test_remote_at_request_layout() {
        let packet = remote_at_request(
            7,
            0x0011223344556677,
            ADDRESS16_UNKNOWN,
            0,
            AT_SHORT_ADDRESS,
            &[0x00, 0x2A],
        );
        assert_eq!(
            packet,
            vec![
                0x17, 7, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0xFF, 0xFE, 0x00, b'M',
                b'Y', 0x00, 0x2A,
            ]
        );
    }

    #[test]
    fn test_parse_remote_at_response() {
        let raw = vec![
            0x97, 7, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x00, 0x2A, b'M', b'Y', 0x00,
        ];
        match parse_api_packet(&raw).unwrap() {
            ApiPacket::RemoteAtResponse {
                frame_id,
                address64,
                address16,
                command,
                status,
                value,
            } => {
                assert_eq!(frame_id, 7);
                assert_eq!(address64, 0x0011223344556677);
                assert_eq!(address16, 0x002A);
                assert_eq!(command, AT_SHORT_ADDRESS);
                assert_eq!(status, 0);
                assert!(value.is_empty());
            }
            other => panic!("parsed wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_parse_receive16_carries_rssi_and_payload() {
        let fb = FeedbackData {
            flags: 1,
            outbound_rssi: 40,
            dribbler_speed: 9000,
            battery: 14200,
            faults: 0,
        };
        let mut raw = vec![0x81, 0x00, 0x2A, 0x33, 0x00];
        raw.extend_from_slice(&fb.encode());

        match parse_api_packet(&raw).unwrap() {
            ApiPacket::Receive16 {
                address16,
                rssi,
                payload,
                ..
            } => {
                assert_eq!(address16, 0x002A);
                assert_eq!(rssi, 0x33);
                assert_eq!(
                    FeedbackData::decode(payload.try_into().unwrap()),
                    fb
                );
            }
            other => panic!("parsed wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_truncated_packet_is_rejected() {
        assert!(parse_api_packet(&[0x97, 1, 2]).is_err());
        assert!(parse_api_packet(&[]).is_err());
    }

    #[test]
    fn test_meta_packets_roundtrip() {
        let packets = [
            MetaPacket::Claim {
                address64: 0x1234,
                drive: true,
            },
            MetaPacket::ClaimFailed {
                address64: 0x1234,
                reason: ClaimDenied::Resource,
            },
            MetaPacket::Alive {
                address64: 0x1234,
                address16: 0x2A,
                slot: 3,
            },
            MetaPacket::Dead { address64: 0x1234 },
        ];
        for packet in packets {
            assert_eq!(MetaPacket::decode(&packet.encode()).unwrap(), packet);
        }
    }

    #[test]
    fn test_status_bytes_outside_documented_set() {
        assert_eq!(AtStatus::from_byte(0), Some(AtStatus::Ok));
        assert_eq!(AtStatus::from_byte(4), Some(AtStatus::NoResponse));
        assert_eq!(AtStatus::from_byte(5), None);
        assert_eq!(AtStatus::from_byte(0xFF), None);
    }
}
