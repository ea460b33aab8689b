//! Wire protocol: constants, the twelve command kinds, and the big-endian
//! command codec.
//!
//! Nothing here relies on native struct layout; every field is read and
//! written explicitly so the wire format is identical on every platform.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Protocol constants. The wire-visible ones must match across
/// implementations; the rest are tuning defaults.
pub mod constants {
    /// Smallest MTU a peer may negotiate.
    pub const MINIMUM_MTU: u32 = 576;
    /// Largest MTU a peer may negotiate.
    pub const MAXIMUM_MTU: u32 = 4096;
    /// Most commands a single datagram may carry.
    pub const MAXIMUM_PACKET_COMMANDS: usize = 32;
    pub const MINIMUM_WINDOW_SIZE: u32 = 4096;
    pub const MAXIMUM_WINDOW_SIZE: u32 = 65536;
    pub const MINIMUM_CHANNEL_COUNT: usize = 1;
    pub const MAXIMUM_CHANNEL_COUNT: usize = 255;
    /// Peer ids occupy the low 12 bits of the datagram header; this value
    /// doubles as the "no peer yet" marker on an initial CONNECT.
    pub const MAXIMUM_PEER_ID: u16 = 0xFFF;
    pub const MAXIMUM_FRAGMENT_COUNT: u32 = 1024 * 1024;

    /// Command byte: the receiver must acknowledge this command.
    pub const COMMAND_FLAG_ACKNOWLEDGE: u8 = 1 << 7;
    /// Command byte: this command bypasses sequencing entirely.
    pub const COMMAND_FLAG_UNSEQUENCED: u8 = 1 << 6;
    /// Command byte: low nibble selects the opcode.
    pub const COMMAND_MASK: u8 = 0x0F;

    /// Datagram header: payload after the header is compressed.
    pub const HEADER_FLAG_COMPRESSED: u16 = 1 << 14;
    /// Datagram header: the 16-bit sent time field is present.
    pub const HEADER_FLAG_SENT_TIME: u16 = 1 << 15;
    pub const HEADER_FLAG_MASK: u16 = HEADER_FLAG_COMPRESSED | HEADER_FLAG_SENT_TIME;
    pub const HEADER_SESSION_MASK: u16 = 3 << 12;
    pub const HEADER_SESSION_SHIFT: u16 = 12;

    /// Reliable sequence space is divided into this many windows.
    pub const RELIABLE_WINDOWS: u16 = 16;
    /// Sequence numbers per reliable window.
    pub const RELIABLE_WINDOW_SIZE: u16 = 0x1000;
    /// Windows the receiver accepts ahead of its current one; the
    /// remainder is reserved so a sender can never lap the receiver.
    pub const FREE_RELIABLE_WINDOWS: u16 = 15;

    /// Unsequenced duplicate-rejection window, in groups (= bits).
    pub const UNSEQUENCED_WINDOW_SIZE: u32 = 1024;
    pub const FREE_UNSEQUENCED_WINDOWS: u32 = 32;

    /// Unreliable-drop probability is expressed out of this scale.
    pub const PACKET_THROTTLE_SCALE: u32 = 32;
    pub const PACKET_THROTTLE_ACCELERATION: u32 = 2;
    pub const PACKET_THROTTLE_DECELERATION: u32 = 2;
    pub const PACKET_THROTTLE_INTERVAL: u32 = 5000;
    pub const DEFAULT_PACKET_THROTTLE: u32 = 32;

    pub const PACKET_LOSS_SCALE: u32 = 1 << 16;
    pub const PACKET_LOSS_INTERVAL: u32 = 10_000;

    pub const DEFAULT_ROUND_TRIP_TIME: u32 = 500;
    pub const WINDOW_SIZE_SCALE: u32 = 64 * 1024;

    pub const TIMEOUT_LIMIT: u32 = 32;
    pub const TIMEOUT_MINIMUM: u32 = 5000;
    pub const TIMEOUT_MAXIMUM: u32 = 30_000;
    pub const PING_INTERVAL: u32 = 500;

    pub const DEFAULT_MTU: u32 = 1400;
    pub const BANDWIDTH_THROTTLE_INTERVAL: u32 = 1000;
    pub const RECEIVE_BUFFER_SIZE: usize = 256 * 1024;
    pub const SEND_BUFFER_SIZE: usize = 256 * 1024;
    pub const DEFAULT_MAXIMUM_PACKET_SIZE: usize = 32 * 1024 * 1024;
    pub const DEFAULT_MAXIMUM_WAITING_DATA: usize = 32 * 1024 * 1024;
}

use constants::*;

/// Size of the per-command header: command byte, channel id, reliable
/// sequence number.
pub const COMMAND_HEADER_SIZE: usize = 4;

/// Size of the datagram header with the sent-time field present.
pub const PROTOCOL_HEADER_SIZE: usize = 4;
/// Size of the datagram header without it.
pub const PROTOCOL_HEADER_SIZE_MINIMAL: usize = 2;
/// Size of the optional checksum that follows the datagram header.
pub const CHECKSUM_SIZE: usize = 4;

/// The twelve wire command opcodes (low nibble of the command byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CommandKind {
    Acknowledge = 1,
    Connect = 2,
    VerifyConnect = 3,
    Disconnect = 4,
    Ping = 5,
    SendReliable = 6,
    SendUnreliable = 7,
    SendFragment = 8,
    SendUnsequenced = 9,
    BandwidthLimit = 10,
    ThrottleConfigure = 11,
    SendUnreliableFragment = 12,
}

/// Fixed wire size of each command, header included. Payload bytes of the
/// send family follow the command and are not counted here.
pub fn command_size(kind: CommandKind) -> usize {
    match kind {
        CommandKind::Acknowledge => 8,
        CommandKind::Connect => 48,
        CommandKind::VerifyConnect => 44,
        CommandKind::Disconnect => 8,
        CommandKind::Ping => 4,
        CommandKind::SendReliable => 6,
        CommandKind::SendUnreliable => 8,
        CommandKind::SendFragment => 24,
        CommandKind::SendUnsequenced => 8,
        CommandKind::BandwidthLimit => 12,
        CommandKind::ThrottleConfigure => 16,
        CommandKind::SendUnreliableFragment => 24,
    }
}

/// Four-byte header shared by every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    /// Opcode in the low nibble, ACKNOWLEDGE/UNSEQUENCED flags in the high
    /// bits.
    pub command: u8,
    /// Target channel, or 0xFF for the peer-level system channel.
    pub channel_id: u8,
    pub reliable_sequence_number: u16,
}

impl CommandHeader {
    #[inline]
    pub fn kind(&self) -> Option<CommandKind> {
        CommandKind::try_from(self.command & COMMAND_MASK).ok()
    }

    #[inline]
    pub fn wants_acknowledge(&self) -> bool {
        self.command & COMMAND_FLAG_ACKNOWLEDGE != 0
    }

    #[inline]
    pub fn is_unsequenced(&self) -> bool {
        self.command & COMMAND_FLAG_UNSEQUENCED != 0
    }
}

/// Handshake parameters carried by CONNECT and VERIFY_CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectParams {
    pub outgoing_peer_id: u16,
    pub incoming_session_id: u8,
    pub outgoing_session_id: u8,
    pub mtu: u32,
    pub window_size: u32,
    pub channel_count: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub packet_throttle_interval: u32,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
    pub connect_id: u32,
}

/// Fragment bookkeeping shared by the reliable and unreliable fragment
/// commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentParams {
    pub start_sequence_number: u16,
    pub data_length: u16,
    pub fragment_count: u32,
    pub fragment_number: u32,
    pub total_length: u32,
    pub fragment_offset: u32,
}

/// Command body, one variant per opcode. The two fragment opcodes share a
/// body and are told apart by the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBody {
    Acknowledge {
        received_reliable_sequence_number: u16,
        received_sent_time: u16,
    },
    Connect {
        params: ConnectParams,
        data: u32,
    },
    VerifyConnect(ConnectParams),
    Disconnect {
        data: u32,
    },
    Ping,
    SendReliable {
        data_length: u16,
    },
    SendUnreliable {
        unreliable_sequence_number: u16,
        data_length: u16,
    },
    SendUnsequenced {
        unsequenced_group: u16,
        data_length: u16,
    },
    SendFragment(FragmentParams),
    BandwidthLimit {
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    },
    ThrottleConfigure {
        packet_throttle_interval: u32,
        packet_throttle_acceleration: u32,
        packet_throttle_deceleration: u32,
    },
}

/// A decoded (or to-be-encoded) wire command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub header: CommandHeader,
    pub body: CommandBody,
}

impl Command {
    pub fn new(command: u8, channel_id: u8, body: CommandBody) -> Self {
        Self {
            header: CommandHeader {
                command,
                channel_id,
                reliable_sequence_number: 0,
            },
            body,
        }
    }

    /// Wire size of this command, payload excluded.
    pub fn size(&self) -> usize {
        // The header always carries a valid opcode for an encodable command.
        self.header.kind().map(command_size).unwrap_or(COMMAND_HEADER_SIZE)
    }

    /// Number of payload bytes that follow this command on the wire.
    pub fn payload_length(&self) -> usize {
        match self.body {
            CommandBody::SendReliable { data_length } => data_length as usize,
            CommandBody::SendUnreliable { data_length, .. } => data_length as usize,
            CommandBody::SendUnsequenced { data_length, .. } => data_length as usize,
            CommandBody::SendFragment(params) => params.data_length as usize,
            _ => 0,
        }
    }

    /// Append the command to `buf` in network byte order.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.header.command);
        buf.put_u8(self.header.channel_id);
        buf.put_u16(self.header.reliable_sequence_number);

        match self.body {
            CommandBody::Acknowledge {
                received_reliable_sequence_number,
                received_sent_time,
            } => {
                buf.put_u16(received_reliable_sequence_number);
                buf.put_u16(received_sent_time);
            }
            CommandBody::Connect { params, data } => {
                encode_connect_params(buf, &params);
                buf.put_u32(data);
            }
            CommandBody::VerifyConnect(params) => encode_connect_params(buf, &params),
            CommandBody::Disconnect { data } => buf.put_u32(data),
            CommandBody::Ping => {}
            CommandBody::SendReliable { data_length } => buf.put_u16(data_length),
            CommandBody::SendUnreliable {
                unreliable_sequence_number,
                data_length,
            } => {
                buf.put_u16(unreliable_sequence_number);
                buf.put_u16(data_length);
            }
            CommandBody::SendUnsequenced {
                unsequenced_group,
                data_length,
            } => {
                buf.put_u16(unsequenced_group);
                buf.put_u16(data_length);
            }
            CommandBody::SendFragment(params) => {
                buf.put_u16(params.start_sequence_number);
                buf.put_u16(params.data_length);
                buf.put_u32(params.fragment_count);
                buf.put_u32(params.fragment_number);
                buf.put_u32(params.total_length);
                buf.put_u32(params.fragment_offset);
            }
            CommandBody::BandwidthLimit {
                incoming_bandwidth,
                outgoing_bandwidth,
            } => {
                buf.put_u32(incoming_bandwidth);
                buf.put_u32(outgoing_bandwidth);
            }
            CommandBody::ThrottleConfigure {
                packet_throttle_interval,
                packet_throttle_acceleration,
                packet_throttle_deceleration,
            } => {
                buf.put_u32(packet_throttle_interval);
                buf.put_u32(packet_throttle_acceleration);
                buf.put_u32(packet_throttle_deceleration);
            }
        }
    }

    /// Decode one command from the front of `buf`, advancing past it.
    ///
    /// Returns `None` on an unknown opcode or a truncated command; both
    /// end processing of the datagram.
    pub fn decode(buf: &mut Bytes) -> Option<Command> {
        if buf.remaining() < COMMAND_HEADER_SIZE {
            return None;
        }

        let command = buf.get_u8();
        let channel_id = buf.get_u8();
        let reliable_sequence_number = buf.get_u16();

        let kind = CommandKind::try_from(command & COMMAND_MASK).ok()?;
        if buf.remaining() < command_size(kind) - COMMAND_HEADER_SIZE {
            return None;
        }

        let body = match kind {
            CommandKind::Acknowledge => CommandBody::Acknowledge {
                received_reliable_sequence_number: buf.get_u16(),
                received_sent_time: buf.get_u16(),
            },
            CommandKind::Connect => {
                let params = decode_connect_params(buf);
                CommandBody::Connect {
                    params,
                    data: buf.get_u32(),
                }
            }
            CommandKind::VerifyConnect => CommandBody::VerifyConnect(decode_connect_params(buf)),
            CommandKind::Disconnect => CommandBody::Disconnect {
                data: buf.get_u32(),
            },
            CommandKind::Ping => CommandBody::Ping,
            CommandKind::SendReliable => CommandBody::SendReliable {
                data_length: buf.get_u16(),
            },
            CommandKind::SendUnreliable => CommandBody::SendUnreliable {
                unreliable_sequence_number: buf.get_u16(),
                data_length: buf.get_u16(),
            },
            CommandKind::SendUnsequenced => CommandBody::SendUnsequenced {
                unsequenced_group: buf.get_u16(),
                data_length: buf.get_u16(),
            },
            CommandKind::SendFragment | CommandKind::SendUnreliableFragment => {
                CommandBody::SendFragment(FragmentParams {
                    start_sequence_number: buf.get_u16(),
                    data_length: buf.get_u16(),
                    fragment_count: buf.get_u32(),
                    fragment_number: buf.get_u32(),
                    total_length: buf.get_u32(),
                    fragment_offset: buf.get_u32(),
                })
            }
            CommandKind::BandwidthLimit => CommandBody::BandwidthLimit {
                incoming_bandwidth: buf.get_u32(),
                outgoing_bandwidth: buf.get_u32(),
            },
            CommandKind::ThrottleConfigure => CommandBody::ThrottleConfigure {
                packet_throttle_interval: buf.get_u32(),
                packet_throttle_acceleration: buf.get_u32(),
                packet_throttle_deceleration: buf.get_u32(),
            },
        };

        Some(Command {
            header: CommandHeader {
                command,
                channel_id,
                reliable_sequence_number,
            },
            body,
        })
    }
}

fn encode_connect_params(buf: &mut BytesMut, params: &ConnectParams) {
    buf.put_u16(params.outgoing_peer_id);
    buf.put_u8(params.incoming_session_id);
    buf.put_u8(params.outgoing_session_id);
    buf.put_u32(params.mtu);
    buf.put_u32(params.window_size);
    buf.put_u32(params.channel_count);
    buf.put_u32(params.incoming_bandwidth);
    buf.put_u32(params.outgoing_bandwidth);
    buf.put_u32(params.packet_throttle_interval);
    buf.put_u32(params.packet_throttle_acceleration);
    buf.put_u32(params.packet_throttle_deceleration);
    buf.put_u32(params.connect_id);
}

fn decode_connect_params(buf: &mut Bytes) -> ConnectParams {
    ConnectParams {
        outgoing_peer_id: buf.get_u16(),
        incoming_session_id: buf.get_u8(),
        outgoing_session_id: buf.get_u8(),
        mtu: buf.get_u32(),
        window_size: buf.get_u32(),
        channel_count: buf.get_u32(),
        incoming_bandwidth: buf.get_u32(),
        outgoing_bandwidth: buf.get_u32(),
        packet_throttle_interval: buf.get_u32(),
        packet_throttle_acceleration: buf.get_u32(),
        packet_throttle_deceleration: buf.get_u32(),
        connect_id: buf.get_u32(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(command: Command) {
        let mut buf = BytesMut::new();
        command.encode(&mut buf);
        assert_eq!(buf.len(), command.size());

        let mut bytes = buf.freeze();
        let decoded = Command::decode(&mut bytes).expect("decode");
        assert_eq!(decoded, command);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_roundtrip_connect() {
        let mut command = Command::new(
            CommandKind::Connect as u8 | COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            CommandBody::Connect {
                params: ConnectParams {
                    outgoing_peer_id: 3,
                    incoming_session_id: 1,
                    outgoing_session_id: 2,
                    mtu: 1400,
                    window_size: 32768,
                    channel_count: 4,
                    incoming_bandwidth: 0,
                    outgoing_bandwidth: 56_000,
                    packet_throttle_interval: 5000,
                    packet_throttle_acceleration: 2,
                    packet_throttle_deceleration: 2,
                    connect_id: 0xCAFE_F00D,
                },
                data: 0xDEAD_BEEF,
            },
        );
        command.header.reliable_sequence_number = 1;
        roundtrip(command);
    }

    #[test]
    fn test_roundtrip_fragment() {
        let mut command = Command::new(
            CommandKind::SendFragment as u8 | COMMAND_FLAG_ACKNOWLEDGE,
            2,
            CommandBody::SendFragment(FragmentParams {
                start_sequence_number: 17,
                data_length: 548,
                fragment_count: 19,
                fragment_number: 18,
                total_length: 10_000,
                fragment_offset: 9864,
            }),
        );
        command.header.reliable_sequence_number = 35;
        roundtrip(command);
    }

    #[test]
    fn test_roundtrip_small_commands() {
        roundtrip(Command::new(
            CommandKind::Acknowledge as u8,
            1,
            CommandBody::Acknowledge {
                received_reliable_sequence_number: 0xFFFF,
                received_sent_time: 0x1234,
            },
        ));
        roundtrip(Command::new(
            CommandKind::SendUnsequenced as u8 | COMMAND_FLAG_UNSEQUENCED,
            0,
            CommandBody::SendUnsequenced {
                unsequenced_group: 1023,
                data_length: 5,
            },
        ));
        roundtrip(Command::new(
            CommandKind::ThrottleConfigure as u8 | COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            CommandBody::ThrottleConfigure {
                packet_throttle_interval: 5000,
                packet_throttle_acceleration: 4,
                packet_throttle_deceleration: 1,
            },
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_opcode() {
        let mut bytes = Bytes::from_static(&[0x0D, 0, 0, 0, 0, 0, 0, 0]);
        assert!(Command::decode(&mut bytes).is_none());
        let mut bytes = Bytes::from_static(&[0x00, 0, 0, 0]);
        assert!(Command::decode(&mut bytes).is_none());
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let command = Command::new(
            CommandKind::VerifyConnect as u8,
            0xFF,
            CommandBody::VerifyConnect(ConnectParams {
                outgoing_peer_id: 0,
                incoming_session_id: 0,
                outgoing_session_id: 0,
                mtu: 576,
                window_size: 4096,
                channel_count: 1,
                incoming_bandwidth: 0,
                outgoing_bandwidth: 0,
                packet_throttle_interval: 5000,
                packet_throttle_acceleration: 2,
                packet_throttle_deceleration: 2,
                connect_id: 7,
            }),
        );
        let mut buf = BytesMut::new();
        command.encode(&mut buf);
        let mut truncated = buf.freeze().slice(..20);
        assert!(Command::decode(&mut truncated).is_none());
    }

    #[test]
    fn test_wire_is_big_endian() {
        let mut command = Command::new(
            CommandKind::SendReliable as u8 | COMMAND_FLAG_ACKNOWLEDGE,
            0,
            CommandBody::SendReliable { data_length: 0x0102 },
        );
        command.header.reliable_sequence_number = 0x0A0B;
        let mut buf = BytesMut::new();
        command.encode(&mut buf);
        assert_eq!(&buf[..], &[0x86, 0x00, 0x0A, 0x0B, 0x01, 0x02]);
    }
}
