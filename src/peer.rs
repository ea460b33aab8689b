//! Peer session state: the connection state machine, outgoing queues,
//! incoming reassembly, and the RTT-driven packet throttle.
//!
//! A peer never touches the socket. It turns application sends into
//! queued commands and incoming commands into dispatchable packets; the
//! host's service loop moves bytes.

use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::BytesMut;
use tracing::trace;

use crate::channel::Channel;
use crate::common::Millis;
use crate::error::{Error, Result};
use crate::host::HostCtx;
use crate::packet::{Packet, PacketFlags};
use crate::protocol::constants::*;
use crate::protocol::{
    command_size, Command, CommandBody, CommandHeader, CommandKind, FragmentParams, CHECKSUM_SIZE,
    PROTOCOL_HEADER_SIZE,
};

/// Index of a peer slot within its host. Stable for the peer's lifetime
/// and reused across sessions.
pub type PeerId = u16;

/// Connection state of a peer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerState {
    Disconnected,
    Connecting,
    AcknowledgingConnect,
    ConnectionPending,
    ConnectionSucceeded,
    Connected,
    DisconnectLater,
    Disconnecting,
    AcknowledgingDisconnect,
    Zombie,
}

impl PeerState {
    /// States that participate in bandwidth accounting and broadcast.
    pub(crate) fn is_session(self) -> bool {
        matches!(self, PeerState::Connected | PeerState::DisconnectLater)
    }
}

/// A queued wire command, possibly carrying (a slice of) a packet.
#[derive(Debug)]
pub(crate) struct OutgoingCommand {
    pub command: Command,
    pub fragment_offset: u32,
    pub fragment_length: u16,
    pub reliable_sequence_number: u16,
    pub unreliable_sequence_number: u16,
    pub sent_time: Millis,
    pub round_trip_timeout: u32,
    /// Host-wide FIFO position, used to interleave the two outgoing
    /// queues in submission order.
    pub queue_time: u32,
    pub send_attempts: u16,
    pub packet: Option<Packet>,
}

/// A received command pending acknowledgement.
#[derive(Debug)]
pub(crate) struct Acknowledgement {
    pub sent_time: u16,
    pub command: CommandHeader,
}

/// Payload of an incoming command: a fragment set under assembly, or a
/// finished packet.
#[derive(Debug)]
pub(crate) enum IncomingPayload {
    Assembling(BytesMut),
    Complete(Packet),
}

/// Reassembly entry in a channel's reorder queue.
#[derive(Debug)]
pub(crate) struct IncomingCommand {
    /// Raw command byte (opcode plus flags) of the originating command.
    pub command: u8,
    pub channel_id: u8,
    pub reliable_sequence_number: u16,
    pub unreliable_sequence_number: u16,
    pub fragment_count: u32,
    pub fragments_remaining: u32,
    /// One bit per fragment already applied; empty for unfragmented
    /// commands.
    pub fragments: Vec<u32>,
    pub flags: PacketFlags,
    pub payload: IncomingPayload,
}

impl IncomingCommand {
    pub fn is_unsequenced(&self) -> bool {
        self.command & COMMAND_FLAG_UNSEQUENCED != 0
    }

    pub fn total_length(&self) -> usize {
        match &self.payload {
            IncomingPayload::Assembling(buffer) => buffer.len(),
            IncomingPayload::Complete(packet) => packet.len(),
        }
    }

    /// Record one fragment's payload, clamping the copy against the total
    /// length. Idempotent per fragment number. Returns whether the set
    /// just completed.
    pub fn apply_fragment(&mut self, fragment_number: u32, fragment_offset: usize, data: &[u8]) -> bool {
        let word = fragment_number as usize / 32;
        let bit = 1u32 << (fragment_number % 32);
        if self.fragments[word] & bit != 0 {
            return false;
        }
        self.fragments[word] |= bit;
        self.fragments_remaining -= 1;

        if let IncomingPayload::Assembling(buffer) = &mut self.payload {
            let length = data.len().min(buffer.len() - fragment_offset);
            buffer[fragment_offset..fragment_offset + length].copy_from_slice(&data[..length]);
        }

        if self.fragments_remaining == 0 {
            if let IncomingPayload::Assembling(buffer) = &mut self.payload {
                let data = std::mem::take(buffer).freeze();
                self.payload = IncomingPayload::Complete(Packet::new(data, self.flags));
            }
            true
        } else {
            false
        }
    }
}

/// One endpoint's view of a remote session.
#[derive(Debug)]
pub struct Peer {
    pub(crate) incoming_peer_id: PeerId,
    pub(crate) outgoing_peer_id: u16,
    pub(crate) connect_id: u32,
    pub(crate) incoming_session_id: u8,
    pub(crate) outgoing_session_id: u8,
    pub(crate) address: Option<SocketAddr>,
    pub(crate) state: PeerState,
    pub(crate) channels: Vec<Channel>,
    pub(crate) mtu: u32,
    pub(crate) window_size: u32,

    pub(crate) incoming_bandwidth: u32,
    pub(crate) outgoing_bandwidth: u32,
    pub(crate) incoming_bandwidth_throttle_epoch: Millis,
    pub(crate) outgoing_bandwidth_throttle_epoch: Millis,
    pub(crate) incoming_data_total: u32,
    pub(crate) outgoing_data_total: u32,

    pub(crate) last_send_time: Millis,
    pub(crate) last_receive_time: Millis,
    pub(crate) next_timeout: Millis,
    pub(crate) earliest_timeout: Millis,

    pub(crate) packet_loss_epoch: Millis,
    pub(crate) packets_sent: u32,
    pub(crate) packets_lost: u32,
    pub(crate) packet_loss: u32,
    pub(crate) packet_loss_variance: u32,

    pub(crate) packet_throttle: u32,
    pub(crate) packet_throttle_limit: u32,
    /// Unreliable drops within the current throttle epoch.
    pub(crate) packet_throttle_counter: u32,
    pub(crate) packet_throttle_epoch: Millis,
    pub(crate) packet_throttle_acceleration: u32,
    pub(crate) packet_throttle_deceleration: u32,
    pub(crate) packet_throttle_interval: u32,

    pub(crate) ping_interval: u32,
    pub(crate) timeout_limit: u32,
    pub(crate) timeout_minimum: u32,
    pub(crate) timeout_maximum: u32,

    pub(crate) last_round_trip_time: u32,
    pub(crate) lowest_round_trip_time: u32,
    pub(crate) last_round_trip_time_variance: u32,
    pub(crate) highest_round_trip_time_variance: u32,
    pub(crate) round_trip_time: u32,
    pub(crate) round_trip_time_variance: u32,

    pub(crate) reliable_data_in_transit: u32,
    /// Sequence space for system-channel (0xFF) commands.
    pub(crate) outgoing_reliable_sequence_number: u16,

    pub(crate) incoming_unsequenced_group: u16,
    pub(crate) outgoing_unsequenced_group: u16,
    pub(crate) unsequenced_window: [u32; (UNSEQUENCED_WINDOW_SIZE / 32) as usize],

    pub(crate) event_data: u32,
    pub(crate) total_waiting_data: usize,
    pub(crate) needs_dispatch: bool,
    pub(crate) continue_sending: bool,

    pub(crate) acknowledgements: VecDeque<Acknowledgement>,
    pub(crate) sent_reliable_commands: VecDeque<OutgoingCommand>,
    pub(crate) outgoing_commands: VecDeque<OutgoingCommand>,
    /// Reliable commands with payloads, held back until the reliable
    /// window admits them.
    pub(crate) outgoing_send_reliable_commands: VecDeque<OutgoingCommand>,
    pub(crate) dispatched_commands: VecDeque<IncomingCommand>,
}

/// Outcome of inserting a received command into a channel queue.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum QueueOutcome {
    /// Inserted; an acknowledgement may be sent.
    Queued,
    /// Duplicate or out of window; dropped, but still acknowledged so the
    /// sender stops retransmitting.
    Discarded,
    /// Dropped without acknowledgement (buffer limit, or a discarded
    /// fragment start that would corrupt reassembly). Ends the datagram.
    Refused,
}

impl Peer {
    pub(crate) fn new(incoming_peer_id: PeerId, host_mtu: u32) -> Self {
        Self {
            incoming_peer_id,
            outgoing_peer_id: MAXIMUM_PEER_ID,
            connect_id: 0,
            incoming_session_id: 0xFF,
            outgoing_session_id: 0xFF,
            address: None,
            state: PeerState::Disconnected,
            channels: Vec::new(),
            mtu: host_mtu,
            window_size: MAXIMUM_WINDOW_SIZE,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            incoming_bandwidth_throttle_epoch: 0,
            outgoing_bandwidth_throttle_epoch: 0,
            incoming_data_total: 0,
            outgoing_data_total: 0,
            last_send_time: 0,
            last_receive_time: 0,
            next_timeout: 0,
            earliest_timeout: 0,
            packet_loss_epoch: 0,
            packets_sent: 0,
            packets_lost: 0,
            packet_loss: 0,
            packet_loss_variance: 0,
            packet_throttle: DEFAULT_PACKET_THROTTLE,
            packet_throttle_limit: PACKET_THROTTLE_SCALE,
            packet_throttle_counter: 0,
            packet_throttle_epoch: 0,
            packet_throttle_acceleration: PACKET_THROTTLE_ACCELERATION,
            packet_throttle_deceleration: PACKET_THROTTLE_DECELERATION,
            packet_throttle_interval: PACKET_THROTTLE_INTERVAL,
            ping_interval: PING_INTERVAL,
            timeout_limit: TIMEOUT_LIMIT,
            timeout_minimum: TIMEOUT_MINIMUM,
            timeout_maximum: TIMEOUT_MAXIMUM,
            last_round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            lowest_round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            last_round_trip_time_variance: 0,
            highest_round_trip_time_variance: 0,
            round_trip_time: DEFAULT_ROUND_TRIP_TIME,
            round_trip_time_variance: 0,
            reliable_data_in_transit: 0,
            outgoing_reliable_sequence_number: 0,
            incoming_unsequenced_group: 0,
            outgoing_unsequenced_group: 0,
            unsequenced_window: [0; (UNSEQUENCED_WINDOW_SIZE / 32) as usize],
            event_data: 0,
            total_waiting_data: 0,
            needs_dispatch: false,
            continue_sending: false,
            acknowledgements: VecDeque::new(),
            sent_reliable_commands: VecDeque::new(),
            outgoing_commands: VecDeque::new(),
            outgoing_send_reliable_commands: VecDeque::new(),
            dispatched_commands: VecDeque::new(),
        }
    }

    // --- public introspection ---------------------------------------------

    pub fn id(&self) -> PeerId {
        self.incoming_peer_id
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Remote address, once known.
    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// Session nonce established during the handshake.
    pub fn connect_id(&self) -> u32 {
        self.connect_id
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// Smoothed round-trip time in milliseconds.
    pub fn round_trip_time(&self) -> u32 {
        self.round_trip_time
    }

    pub fn round_trip_time_variance(&self) -> u32 {
        self.round_trip_time_variance
    }

    /// Mean packet loss, expressed out of `PACKET_LOSS_SCALE`.
    pub fn packet_loss(&self) -> u32 {
        self.packet_loss
    }

    pub fn packet_throttle_interval(&self) -> u32 {
        self.packet_throttle_interval
    }

    pub fn packet_throttle_acceleration(&self) -> u32 {
        self.packet_throttle_acceleration
    }

    pub fn packet_throttle_deceleration(&self) -> u32 {
        self.packet_throttle_deceleration
    }

    /// Bytes of received data queued for the application.
    pub fn total_waiting_data(&self) -> usize {
        self.total_waiting_data
    }

    // --- lifecycle --------------------------------------------------------

    /// Return the slot to `Disconnected`, freeing all per-session state.
    /// The remote side is not notified.
    pub(crate) fn reset(&mut self, ctx: &mut HostCtx) {
        self.on_disconnect(ctx);
        self.reset_queues(ctx);

        self.outgoing_peer_id = MAXIMUM_PEER_ID;
        self.connect_id = 0;
        self.state = PeerState::Disconnected;
        self.incoming_bandwidth = 0;
        self.outgoing_bandwidth = 0;
        self.incoming_bandwidth_throttle_epoch = 0;
        self.outgoing_bandwidth_throttle_epoch = 0;
        self.incoming_data_total = 0;
        self.outgoing_data_total = 0;
        self.last_send_time = 0;
        self.last_receive_time = 0;
        self.next_timeout = 0;
        self.earliest_timeout = 0;
        self.packet_loss_epoch = 0;
        self.packets_sent = 0;
        self.packets_lost = 0;
        self.packet_loss = 0;
        self.packet_loss_variance = 0;
        self.packet_throttle = DEFAULT_PACKET_THROTTLE;
        self.packet_throttle_limit = PACKET_THROTTLE_SCALE;
        self.packet_throttle_counter = 0;
        self.packet_throttle_epoch = 0;
        self.packet_throttle_acceleration = PACKET_THROTTLE_ACCELERATION;
        self.packet_throttle_deceleration = PACKET_THROTTLE_DECELERATION;
        self.packet_throttle_interval = PACKET_THROTTLE_INTERVAL;
        self.ping_interval = PING_INTERVAL;
        self.timeout_limit = TIMEOUT_LIMIT;
        self.timeout_minimum = TIMEOUT_MINIMUM;
        self.timeout_maximum = TIMEOUT_MAXIMUM;
        self.last_round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.lowest_round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.last_round_trip_time_variance = 0;
        self.highest_round_trip_time_variance = 0;
        self.round_trip_time = DEFAULT_ROUND_TRIP_TIME;
        self.round_trip_time_variance = 0;
        self.mtu = ctx.mtu;
        self.reliable_data_in_transit = 0;
        self.outgoing_reliable_sequence_number = 0;
        self.window_size = MAXIMUM_WINDOW_SIZE;
        self.incoming_unsequenced_group = 0;
        self.outgoing_unsequenced_group = 0;
        self.event_data = 0;
        self.total_waiting_data = 0;
        self.unsequenced_window.fill(0);
    }

    /// Drop every queue and the channel array; keeps identity, session
    /// ids, and negotiated parameters.
    pub(crate) fn reset_queues(&mut self, ctx: &mut HostCtx) {
        if self.needs_dispatch {
            let id = self.incoming_peer_id;
            ctx.dispatch_queue.retain(|queued| *queued != id);
            self.needs_dispatch = false;
        }

        self.acknowledgements.clear();
        self.sent_reliable_commands.clear();
        self.outgoing_commands.clear();
        self.outgoing_send_reliable_commands.clear();
        self.dispatched_commands.clear();
        self.channels.clear();
    }

    pub(crate) fn allocate_channels(&mut self, count: usize) {
        self.channels.clear();
        self.channels.resize_with(count, Channel::new);
    }

    pub(crate) fn on_connect(&mut self, ctx: &mut HostCtx) {
        if !self.state.is_session() {
            if self.incoming_bandwidth != 0 {
                ctx.bandwidth_limited_peers += 1;
            }
            ctx.connected_peers += 1;
        }
    }

    pub(crate) fn on_disconnect(&mut self, ctx: &mut HostCtx) {
        if self.state.is_session() {
            if self.incoming_bandwidth != 0 {
                ctx.bandwidth_limited_peers -= 1;
            }
            ctx.connected_peers -= 1;
        }
    }

    /// Transition while keeping the host's connected-peer accounting
    /// consistent.
    pub(crate) fn change_state(&mut self, ctx: &mut HostCtx, state: PeerState) {
        if state.is_session() {
            self.on_connect(ctx);
        } else {
            self.on_disconnect(ctx);
        }
        self.state = state;
    }

    /// Transition and enqueue the peer for event dispatch.
    pub(crate) fn dispatch_state(&mut self, ctx: &mut HostCtx, state: PeerState) {
        self.change_state(ctx, state);
        self.enlist_for_dispatch(ctx);
    }

    pub(crate) fn enlist_for_dispatch(&mut self, ctx: &mut HostCtx) {
        if !self.needs_dispatch {
            ctx.dispatch_queue.push_back(self.incoming_peer_id);
            self.needs_dispatch = true;
        }
    }

    pub(crate) fn has_outgoing_commands(&self) -> bool {
        !self.outgoing_commands.is_empty()
            || !self.outgoing_send_reliable_commands.is_empty()
            || !self.sent_reliable_commands.is_empty()
    }

    // --- application operations -------------------------------------------

    /// Queue a packet for delivery on `channel_id`, fragmenting it if it
    /// exceeds the negotiated MTU.
    pub(crate) fn send(&mut self, ctx: &mut HostCtx, channel_id: u8, packet: Packet) -> Result<()> {
        if self.state != PeerState::Connected {
            return Err(Error::invalid_argument("peer is not connected"));
        }
        if channel_id as usize >= self.channels.len() {
            return Err(Error::invalid_argument(format!(
                "channel {channel_id} out of range"
            )));
        }
        if packet.len() > ctx.maximum_packet_size {
            return Err(Error::invalid_argument("packet exceeds maximum packet size"));
        }

        // Payload bytes per fragment datagram: the MTU less the datagram
        // header, the fragment command, and the checksum when enabled.
        let mut fragment_length = self.mtu as usize
            - PROTOCOL_HEADER_SIZE
            - command_size(CommandKind::SendFragment);
        if ctx.checksum_enabled {
            fragment_length -= CHECKSUM_SIZE;
        }

        if packet.len() > fragment_length {
            return self.send_fragments(ctx, channel_id, packet, fragment_length);
        }

        let data_length = packet.len() as u16;
        let flags = packet.flags();
        let channel = &self.channels[channel_id as usize];

        let command = if flags.contains(PacketFlags::UNSEQUENCED)
            && !flags.contains(PacketFlags::RELIABLE)
        {
            Command::new(
                CommandKind::SendUnsequenced as u8 | COMMAND_FLAG_UNSEQUENCED,
                channel_id,
                CommandBody::SendUnsequenced {
                    unsequenced_group: 0,
                    data_length,
                },
            )
        } else if flags.contains(PacketFlags::RELIABLE)
            || channel.outgoing_unreliable_sequence_number >= 0xFFFF
        {
            Command::new(
                CommandKind::SendReliable as u8 | COMMAND_FLAG_ACKNOWLEDGE,
                channel_id,
                CommandBody::SendReliable { data_length },
            )
        } else {
            Command::new(
                CommandKind::SendUnreliable as u8,
                channel_id,
                CommandBody::SendUnreliable {
                    unreliable_sequence_number: 0,
                    data_length,
                },
            )
        };

        self.queue_outgoing_command(ctx, command, Some(packet), 0, data_length);
        Ok(())
    }

    fn send_fragments(
        &mut self,
        ctx: &mut HostCtx,
        channel_id: u8,
        packet: Packet,
        fragment_length: usize,
    ) -> Result<()> {
        let fragment_count = packet.len().div_ceil(fragment_length);
        if fragment_count as u32 > MAXIMUM_FRAGMENT_COUNT {
            return Err(Error::invalid_argument("packet requires too many fragments"));
        }

        let channel = &self.channels[channel_id as usize];
        let flags = packet.flags();
        let (command_byte, start_sequence_number) = if flags
            .contains(PacketFlags::UNRELIABLE_FRAGMENT)
            && !flags.contains(PacketFlags::RELIABLE)
            && channel.outgoing_unreliable_sequence_number < 0xFFFF
        {
            (
                CommandKind::SendUnreliableFragment as u8,
                channel.outgoing_unreliable_sequence_number.wrapping_add(1),
            )
        } else {
            (
                CommandKind::SendFragment as u8 | COMMAND_FLAG_ACKNOWLEDGE,
                channel.outgoing_reliable_sequence_number.wrapping_add(1),
            )
        };

        trace!(
            peer = self.incoming_peer_id,
            channel = channel_id,
            fragments = fragment_count,
            total = packet.len(),
            "fragmenting packet"
        );

        let mut fragment_number = 0u32;
        let mut fragment_offset = 0usize;
        while fragment_offset < packet.len() {
            let length = fragment_length.min(packet.len() - fragment_offset);
            let command = Command::new(
                command_byte,
                channel_id,
                CommandBody::SendFragment(FragmentParams {
                    start_sequence_number,
                    data_length: length as u16,
                    fragment_count: fragment_count as u32,
                    fragment_number,
                    total_length: packet.len() as u32,
                    fragment_offset: fragment_offset as u32,
                }),
            );
            self.queue_outgoing_command(
                ctx,
                command,
                Some(packet.clone()),
                fragment_offset as u32,
                length as u16,
            );
            fragment_number += 1;
            fragment_offset += length;
        }

        Ok(())
    }

    /// Hand the next dispatched packet to the application.
    pub(crate) fn receive(&mut self) -> Option<(u8, Packet)> {
        let incoming = self.dispatched_commands.pop_front()?;
        let channel_id = incoming.channel_id;
        let packet = match incoming.payload {
            IncomingPayload::Complete(packet) => packet,
            // Only completed commands are ever promoted to the dispatch
            // list.
            IncomingPayload::Assembling(buffer) => Packet::new(buffer.freeze(), incoming.flags),
        };
        self.total_waiting_data -= packet.len().min(self.total_waiting_data);
        Some((channel_id, packet))
    }

    /// Queue a PING on the system channel.
    pub(crate) fn ping(&mut self, ctx: &mut HostCtx) {
        if self.state != PeerState::Connected {
            return;
        }
        let command = Command::new(
            CommandKind::Ping as u8 | COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            CommandBody::Ping,
        );
        self.queue_outgoing_command(ctx, command, None, 0, 0);
    }

    pub(crate) fn set_ping_interval(&mut self, interval: u32) {
        self.ping_interval = if interval != 0 { interval } else { PING_INTERVAL };
    }

    pub(crate) fn set_timeout(&mut self, limit: u32, minimum: u32, maximum: u32) {
        self.timeout_limit = if limit != 0 { limit } else { TIMEOUT_LIMIT };
        self.timeout_minimum = if minimum != 0 { minimum } else { TIMEOUT_MINIMUM };
        self.timeout_maximum = if maximum != 0 { maximum } else { TIMEOUT_MAXIMUM };
    }

    /// Install new throttle parameters and announce them to the remote.
    pub(crate) fn throttle_configure(
        &mut self,
        ctx: &mut HostCtx,
        interval: u32,
        acceleration: u32,
        deceleration: u32,
    ) {
        self.packet_throttle_interval = interval;
        self.packet_throttle_acceleration = acceleration;
        self.packet_throttle_deceleration = deceleration;

        let command = Command::new(
            CommandKind::ThrottleConfigure as u8 | COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            CommandBody::ThrottleConfigure {
                packet_throttle_interval: interval,
                packet_throttle_acceleration: acceleration,
                packet_throttle_deceleration: deceleration,
            },
        );
        self.queue_outgoing_command(ctx, command, None, 0, 0);
    }

    /// Adjust the unreliable send probability from a fresh RTT sample.
    pub(crate) fn throttle(&mut self, round_trip_time: u32) {
        if self.last_round_trip_time <= self.last_round_trip_time_variance {
            self.packet_throttle = self.packet_throttle_limit;
        } else if round_trip_time <= self.last_round_trip_time {
            self.packet_throttle = (self.packet_throttle + self.packet_throttle_acceleration)
                .min(self.packet_throttle_limit);
        } else if round_trip_time
            > self.last_round_trip_time + 2 * self.last_round_trip_time_variance
        {
            self.packet_throttle = self
                .packet_throttle
                .saturating_sub(self.packet_throttle_deceleration);
        }
    }

    /// Begin a graceful disconnect from a connected state: flush queues,
    /// send DISCONNECT reliably, and wait for its acknowledgement.
    pub(crate) fn start_disconnect(&mut self, ctx: &mut HostCtx, data: u32) {
        debug_assert!(self.state.is_session());

        self.reset_queues(ctx);

        let command = Command::new(
            CommandKind::Disconnect as u8 | COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            CommandBody::Disconnect { data },
        );
        self.queue_outgoing_command(ctx, command, None, 0, 0);

        self.on_disconnect(ctx);
        self.state = PeerState::Disconnecting;
    }

    // --- outgoing queues --------------------------------------------------

    /// Wrap a command into a queue entry and assign its sequencing.
    pub(crate) fn queue_outgoing_command(
        &mut self,
        ctx: &mut HostCtx,
        command: Command,
        packet: Option<Packet>,
        offset: u32,
        length: u16,
    ) {
        let outgoing = OutgoingCommand {
            command,
            fragment_offset: offset,
            fragment_length: length,
            reliable_sequence_number: 0,
            unreliable_sequence_number: 0,
            sent_time: 0,
            round_trip_timeout: 0,
            queue_time: 0,
            send_attempts: 0,
            packet,
        };
        self.setup_outgoing_command(ctx, outgoing);
    }

    fn setup_outgoing_command(&mut self, ctx: &mut HostCtx, mut outgoing: OutgoingCommand) {
        self.outgoing_data_total +=
            outgoing.command.size() as u32 + outgoing.fragment_length as u32;

        if outgoing.command.header.channel_id == 0xFF {
            self.outgoing_reliable_sequence_number =
                self.outgoing_reliable_sequence_number.wrapping_add(1);
            outgoing.reliable_sequence_number = self.outgoing_reliable_sequence_number;
            outgoing.unreliable_sequence_number = 0;
        } else {
            let channel = &mut self.channels[outgoing.command.header.channel_id as usize];

            if outgoing.command.header.wants_acknowledge() {
                channel.outgoing_reliable_sequence_number =
                    channel.outgoing_reliable_sequence_number.wrapping_add(1);
                channel.outgoing_unreliable_sequence_number = 0;
                outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
                outgoing.unreliable_sequence_number = 0;
            } else if outgoing.command.header.is_unsequenced() {
                self.outgoing_unsequenced_group = self.outgoing_unsequenced_group.wrapping_add(1);
                outgoing.reliable_sequence_number = 0;
                outgoing.unreliable_sequence_number = 0;
            } else {
                if outgoing.fragment_offset == 0 {
                    channel.outgoing_unreliable_sequence_number =
                        channel.outgoing_unreliable_sequence_number.wrapping_add(1);
                }
                outgoing.reliable_sequence_number = channel.outgoing_reliable_sequence_number;
                outgoing.unreliable_sequence_number = channel.outgoing_unreliable_sequence_number;
            }
        }

        outgoing.send_attempts = 0;
        outgoing.sent_time = 0;
        outgoing.round_trip_timeout = 0;
        outgoing.command.header.reliable_sequence_number = outgoing.reliable_sequence_number;
        outgoing.queue_time = ctx.next_queue_time();

        match &mut outgoing.command.body {
            CommandBody::SendUnreliable {
                unreliable_sequence_number,
                ..
            } => *unreliable_sequence_number = outgoing.unreliable_sequence_number,
            CommandBody::SendUnsequenced {
                unsequenced_group, ..
            } => *unsequenced_group = self.outgoing_unsequenced_group,
            _ => {}
        }

        if outgoing.command.header.wants_acknowledge() && outgoing.packet.is_some() {
            self.outgoing_send_reliable_commands.push_back(outgoing);
        } else {
            self.outgoing_commands.push_back(outgoing);
        }
    }

    /// Queue an acknowledgement for a received command, unless its
    /// sequence number falls in the window band reserved against
    /// sender wrap-around.
    pub(crate) fn queue_acknowledgement(&mut self, header: &CommandHeader, sent_time: u16) {
        if (header.channel_id as usize) < self.channels.len() {
            let channel = &self.channels[header.channel_id as usize];
            let reliable_window = channel.incoming_window_of(header.reliable_sequence_number);
            if reliable_window >= channel.current_incoming_window() + FREE_RELIABLE_WINDOWS {
                return;
            }
        }

        self.outgoing_data_total += command_size(CommandKind::Acknowledge) as u32;
        self.acknowledgements.push_back(Acknowledgement {
            sent_time,
            command: *header,
        });
    }

    /// Drop an acknowledged reliable command from the retransmission
    /// queues, returning its opcode.
    pub(crate) fn remove_sent_reliable_command(
        &mut self,
        reliable_sequence_number: u16,
        channel_id: u8,
    ) -> Option<CommandKind> {
        let mut was_sent = true;

        let outgoing = match self.sent_reliable_commands.iter().position(|command| {
            command.reliable_sequence_number == reliable_sequence_number
                && command.command.header.channel_id == channel_id
        }) {
            Some(index) => self.sent_reliable_commands.remove(index).unwrap(),
            None => {
                was_sent = false;
                let found = Self::take_unsent_reliable_command(
                    &mut self.outgoing_commands,
                    reliable_sequence_number,
                    channel_id,
                )
                .or_else(|| {
                    Self::take_unsent_reliable_command(
                        &mut self.outgoing_send_reliable_commands,
                        reliable_sequence_number,
                        channel_id,
                    )
                });
                found?
            }
        };

        if (channel_id as usize) < self.channels.len() {
            let channel = &mut self.channels[channel_id as usize];
            let reliable_window = (reliable_sequence_number / RELIABLE_WINDOW_SIZE) as usize;
            if channel.reliable_windows[reliable_window] > 0 {
                channel.reliable_windows[reliable_window] -= 1;
                if channel.reliable_windows[reliable_window] == 0 {
                    channel.used_reliable_windows &= !(1 << reliable_window);
                }
            }
        }

        let kind = outgoing.command.header.kind();

        if outgoing.packet.is_some() && was_sent {
            self.reliable_data_in_transit -= outgoing.fragment_length as u32;
        }

        if let Some(front) = self.sent_reliable_commands.front() {
            self.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
        }

        kind
    }

    /// Find an acknowledged command that was never transmitted (its
    /// acknowledgement raced a retransmission move). The search stops at
    /// the first never-sent command, which cannot have been acknowledged.
    fn take_unsent_reliable_command(
        queue: &mut VecDeque<OutgoingCommand>,
        reliable_sequence_number: u16,
        channel_id: u8,
    ) -> Option<OutgoingCommand> {
        let mut index = None;
        for (i, command) in queue.iter().enumerate() {
            if !command.command.header.wants_acknowledge() {
                continue;
            }
            if command.send_attempts < 1 {
                break;
            }
            if command.reliable_sequence_number == reliable_sequence_number
                && command.command.header.channel_id == channel_id
            {
                index = Some(i);
                break;
            }
        }
        index.and_then(|i| queue.remove(i))
    }

    // --- incoming reassembly ----------------------------------------------

    /// Insert a received send command into its channel's reorder queue,
    /// maintaining wrap-aware sort order and rejecting duplicates and
    /// out-of-window sequence numbers.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn queue_incoming_command(
        &mut self,
        ctx: &mut HostCtx,
        header: &CommandHeader,
        unreliable_sequence_number: u16,
        payload: Option<bytes::Bytes>,
        total_length: usize,
        flags: PacketFlags,
        fragment_count: u32,
    ) -> QueueOutcome {
        let discard = || {
            if fragment_count > 0 {
                QueueOutcome::Refused
            } else {
                QueueOutcome::Discarded
            }
        };

        if self.state == PeerState::DisconnectLater {
            return discard();
        }

        let kind = match header.kind() {
            Some(kind) => kind,
            None => return discard(),
        };
        let channel_index = header.channel_id as usize;
        let reliable_sequence_number = header.reliable_sequence_number;

        if kind != CommandKind::SendUnsequenced {
            let channel = &self.channels[channel_index];
            let reliable_window = channel.incoming_window_of(reliable_sequence_number);
            let current_window = channel.current_incoming_window();
            if reliable_window < current_window
                || reliable_window >= current_window + FREE_RELIABLE_WINDOWS
            {
                return discard();
            }
        }

        let insert_index = match kind {
            CommandKind::SendFragment | CommandKind::SendReliable => {
                let channel = &self.channels[channel_index];
                if reliable_sequence_number == channel.incoming_reliable_sequence_number {
                    return discard();
                }
                match Self::reliable_insert_index(channel, reliable_sequence_number) {
                    Some(index) => index,
                    None => return discard(),
                }
            }
            CommandKind::SendUnreliable | CommandKind::SendUnreliableFragment => {
                let channel = &self.channels[channel_index];
                if reliable_sequence_number == channel.incoming_reliable_sequence_number
                    && unreliable_sequence_number <= channel.incoming_unreliable_sequence_number
                {
                    return discard();
                }
                match Self::unreliable_insert_index(
                    channel,
                    reliable_sequence_number,
                    unreliable_sequence_number,
                ) {
                    Some(index) => index,
                    None => return discard(),
                }
            }
            CommandKind::SendUnsequenced => {
                self.channels[channel_index].incoming_unreliable_commands.len()
            }
            _ => return discard(),
        };

        if self.total_waiting_data >= ctx.maximum_waiting_data {
            return QueueOutcome::Refused;
        }

        let payload_size;
        let incoming_payload = match payload {
            Some(data) => {
                payload_size = data.len();
                IncomingPayload::Complete(Packet::new(data, flags))
            }
            None => {
                payload_size = total_length;
                IncomingPayload::Assembling(BytesMut::zeroed(total_length))
            }
        };

        let incoming = IncomingCommand {
            command: header.command,
            channel_id: header.channel_id,
            reliable_sequence_number,
            unreliable_sequence_number,
            fragment_count,
            fragments_remaining: fragment_count,
            fragments: vec![0u32; (fragment_count as usize).div_ceil(32)],
            flags,
            payload: incoming_payload,
        };

        self.total_waiting_data += payload_size;

        match kind {
            CommandKind::SendFragment | CommandKind::SendReliable => {
                self.channels[channel_index]
                    .incoming_reliable_commands
                    .insert(insert_index, incoming);
                self.dispatch_incoming_reliable_commands(ctx, channel_index);
            }
            _ => {
                self.channels[channel_index]
                    .incoming_unreliable_commands
                    .insert(insert_index, incoming);
                self.dispatch_incoming_unreliable_commands(ctx, channel_index);
            }
        }

        QueueOutcome::Queued
    }

    /// Position for a reliable command in the channel's reorder queue,
    /// or `None` for a duplicate of an already-queued entry. The scan
    /// runs back to front since in-order arrival inserts at the tail.
    fn reliable_insert_index(channel: &Channel, reliable_sequence_number: u16) -> Option<usize> {
        let queue = &channel.incoming_reliable_commands;
        let current = channel.incoming_reliable_sequence_number;

        let mut i = queue.len();
        while i > 0 {
            i -= 1;
            let incoming = &queue[i];

            if reliable_sequence_number >= current {
                if incoming.reliable_sequence_number < current {
                    continue;
                }
            } else if incoming.reliable_sequence_number >= current {
                return Some(i + 1);
            }

            if incoming.reliable_sequence_number <= reliable_sequence_number {
                if incoming.reliable_sequence_number < reliable_sequence_number {
                    return Some(i + 1);
                }
                return None;
            }
        }

        Some(0)
    }

    /// Position for an unreliable command, keyed by (reliable,
    /// unreliable) sequence numbers, or `None` for a duplicate.
    fn unreliable_insert_index(
        channel: &Channel,
        reliable_sequence_number: u16,
        unreliable_sequence_number: u16,
    ) -> Option<usize> {
        let queue = &channel.incoming_unreliable_commands;
        let current = channel.incoming_reliable_sequence_number;

        let mut i = queue.len();
        while i > 0 {
            i -= 1;
            let incoming = &queue[i];

            if reliable_sequence_number >= current {
                if incoming.reliable_sequence_number < current {
                    continue;
                }
            } else if incoming.reliable_sequence_number >= current {
                return Some(i + 1);
            }

            if incoming.reliable_sequence_number < reliable_sequence_number {
                return Some(i + 1);
            }
            if incoming.reliable_sequence_number > reliable_sequence_number {
                continue;
            }

            if incoming.unreliable_sequence_number <= unreliable_sequence_number {
                if incoming.unreliable_sequence_number < unreliable_sequence_number {
                    return Some(i + 1);
                }
                return None;
            }
        }

        Some(0)
    }

    /// Promote the in-order prefix of the reliable reorder queue to the
    /// dispatch list, advancing the channel's incoming sequence number
    /// (by the whole span for completed fragment sets).
    pub(crate) fn dispatch_incoming_reliable_commands(
        &mut self,
        ctx: &mut HostCtx,
        channel_index: usize,
    ) {
        let ready = {
            let channel = &mut self.channels[channel_index];
            let mut ready = 0;
            for incoming in &channel.incoming_reliable_commands {
                if incoming.fragments_remaining > 0
                    || incoming.reliable_sequence_number
                        != channel.incoming_reliable_sequence_number.wrapping_add(1)
                {
                    break;
                }
                channel.incoming_reliable_sequence_number = incoming.reliable_sequence_number;
                if incoming.fragment_count > 0 {
                    channel.incoming_reliable_sequence_number = channel
                        .incoming_reliable_sequence_number
                        .wrapping_add(incoming.fragment_count as u16 - 1);
                }
                ready += 1;
            }
            ready
        };

        if ready == 0 {
            return;
        }

        self.channels[channel_index].incoming_unreliable_sequence_number = 0;
        self.dispatched_commands
            .extend(self.channels[channel_index].incoming_reliable_commands.drain(..ready));
        self.enlist_for_dispatch(ctx);

        if !self.channels[channel_index]
            .incoming_unreliable_commands
            .is_empty()
        {
            self.dispatch_incoming_unreliable_commands(ctx, channel_index);
        }
    }

    /// Walk the unreliable reorder queue: promote entries deliverable at
    /// the current reliable sequence number, drop entries from stale
    /// windows, and stop at entries from future windows.
    pub(crate) fn dispatch_incoming_unreliable_commands(
        &mut self,
        ctx: &mut HostCtx,
        channel_index: usize,
    ) {
        let mut promoted = false;
        {
            let Self {
                channels,
                dispatched_commands,
                ..
            } = self;
            let channel = &mut channels[channel_index];
            let mut queue = std::mem::take(&mut channel.incoming_unreliable_commands);
            // Elements deliverable at the current reliable sequence
            // number accumulate here until a non-deliverable entry forces
            // the range out.
            let mut pending: Vec<IncomingCommand> = Vec::new();

            while let Some(incoming) = queue.pop_front() {
                if incoming.is_unsequenced() {
                    pending.push(incoming);
                    continue;
                }

                if incoming.reliable_sequence_number == channel.incoming_reliable_sequence_number {
                    if incoming.fragments_remaining == 0 {
                        channel.incoming_unreliable_sequence_number =
                            incoming.unreliable_sequence_number;
                        pending.push(incoming);
                        continue;
                    }

                    // An incomplete fragment set blocks everything after
                    // it but releases what came before.
                    if !pending.is_empty() {
                        dispatched_commands.extend(pending.drain(..));
                        promoted = true;
                    }
                    channel.incoming_unreliable_commands.push_back(incoming);
                } else {
                    let reliable_window =
                        channel.incoming_window_of(incoming.reliable_sequence_number);
                    let current_window = channel.current_incoming_window();

                    if reliable_window >= current_window
                        && reliable_window < current_window + FREE_RELIABLE_WINDOWS
                    {
                        // Future reliable window: nothing beyond this
                        // point can be ready yet.
                        if !pending.is_empty() {
                            dispatched_commands.extend(pending.drain(..));
                            promoted = true;
                        }
                        channel.incoming_unreliable_commands.push_back(incoming);
                        while let Some(rest) = queue.pop_front() {
                            channel.incoming_unreliable_commands.push_back(rest);
                        }
                        break;
                    }

                    // Stale window: the reliable stream moved past this
                    // entry, so it can never be delivered.
                    trace!(
                        channel = channel_index,
                        sequence = incoming.reliable_sequence_number,
                        "dropping unreliable command from stale window"
                    );
                    if !pending.is_empty() {
                        dispatched_commands.extend(pending.drain(..));
                        promoted = true;
                    }
                }
            }

            if !pending.is_empty() {
                dispatched_commands.extend(pending.drain(..));
                promoted = true;
            }
        }

        if promoted {
            self.enlist_for_dispatch(ctx);
        }
    }

    // --- unsequenced window -----------------------------------------------

    /// Check an unsequenced group against the duplicate-rejection window,
    /// advancing the window base when the group lands beyond it. Returns
    /// the bit index to mark on acceptance, or `None` for a duplicate or
    /// an out-of-range group.
    pub(crate) fn unsequenced_group_accept(&mut self, unsequenced_group: u16) -> Option<usize> {
        let index = (unsequenced_group as u32 % UNSEQUENCED_WINDOW_SIZE) as usize;
        let mut group = unsequenced_group as u32;

        if group < self.incoming_unsequenced_group as u32 {
            group += 0x10000;
        }
        if group
            >= self.incoming_unsequenced_group as u32
                + FREE_UNSEQUENCED_WINDOWS * UNSEQUENCED_WINDOW_SIZE
        {
            return None;
        }

        let group = (group & 0xFFFF) as u16;
        if group.wrapping_sub(index as u16) != self.incoming_unsequenced_group {
            self.incoming_unsequenced_group = group.wrapping_sub(index as u16);
            self.unsequenced_window.fill(0);
        } else if self.unsequenced_window[index / 32] & (1 << (index % 32)) != 0 {
            return None;
        }

        Some(index)
    }

    pub(crate) fn mark_unsequenced(&mut self, index: usize) {
        self.unsequenced_window[index / 32] |= 1 << (index % 32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostCtx;
    use bytes::Bytes;

    fn connected_peer() -> (Peer, HostCtx) {
        let ctx = HostCtx::for_tests();
        let mut peer = Peer::new(0, DEFAULT_MTU);
        peer.state = PeerState::Connected;
        peer.allocate_channels(2);
        (peer, ctx)
    }

    fn reliable_header(sequence: u16) -> CommandHeader {
        CommandHeader {
            command: CommandKind::SendReliable as u8 | COMMAND_FLAG_ACKNOWLEDGE,
            channel_id: 0,
            reliable_sequence_number: sequence,
        }
    }

    fn queue_reliable(peer: &mut Peer, ctx: &mut HostCtx, sequence: u16) -> QueueOutcome {
        peer.queue_incoming_command(
            ctx,
            &reliable_header(sequence),
            0,
            Some(Bytes::from(vec![sequence as u8])),
            1,
            PacketFlags::RELIABLE,
            0,
        )
    }

    #[test]
    fn test_reliable_commands_dispatch_in_order() {
        let (mut peer, mut ctx) = connected_peer();

        assert_eq!(queue_reliable(&mut peer, &mut ctx, 2), QueueOutcome::Queued);
        assert!(peer.dispatched_commands.is_empty());

        assert_eq!(queue_reliable(&mut peer, &mut ctx, 3), QueueOutcome::Queued);
        assert!(peer.dispatched_commands.is_empty());

        assert_eq!(queue_reliable(&mut peer, &mut ctx, 1), QueueOutcome::Queued);
        assert_eq!(peer.dispatched_commands.len(), 3);
        assert!(peer.needs_dispatch);
        assert_eq!(ctx.dispatch_queue.front(), Some(&0));

        let order: Vec<u16> = peer
            .dispatched_commands
            .iter()
            .map(|c| c.reliable_sequence_number)
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(peer.channels[0].incoming_reliable_sequence_number, 3);
    }

    #[test]
    fn test_duplicate_reliable_commands_discarded() {
        let (mut peer, mut ctx) = connected_peer();

        assert_eq!(queue_reliable(&mut peer, &mut ctx, 1), QueueOutcome::Queued);
        // Already delivered.
        assert_eq!(
            queue_reliable(&mut peer, &mut ctx, 1),
            QueueOutcome::Discarded
        );

        // Still queued, not yet delivered.
        assert_eq!(queue_reliable(&mut peer, &mut ctx, 3), QueueOutcome::Queued);
        assert_eq!(
            queue_reliable(&mut peer, &mut ctx, 3),
            QueueOutcome::Discarded
        );
    }

    #[test]
    fn test_out_of_window_reliable_rejected() {
        let (mut peer, mut ctx) = connected_peer();

        // The reserved window keeps a sender 15 windows ahead at most.
        let beyond = FREE_RELIABLE_WINDOWS * RELIABLE_WINDOW_SIZE;
        assert_eq!(
            queue_reliable(&mut peer, &mut ctx, beyond),
            QueueOutcome::Discarded
        );
        assert!(peer.channels[0].incoming_reliable_commands.is_empty());
    }

    #[test]
    fn test_sequence_rollover_accepted() {
        let (mut peer, mut ctx) = connected_peer();
        peer.channels[0].incoming_reliable_sequence_number = 0xFFFE;

        // 0xFFFF then 0x0000 continue the stream across the wrap.
        assert_eq!(
            queue_reliable(&mut peer, &mut ctx, 0xFFFF),
            QueueOutcome::Queued
        );
        assert_eq!(queue_reliable(&mut peer, &mut ctx, 0), QueueOutcome::Queued);
        assert_eq!(peer.dispatched_commands.len(), 2);
        assert_eq!(peer.channels[0].incoming_reliable_sequence_number, 0);
    }

    #[test]
    fn test_unsequenced_window_rejects_duplicates() {
        let (mut peer, _ctx) = connected_peer();

        let index = peer.unsequenced_group_accept(7).expect("fresh group");
        peer.mark_unsequenced(index);
        assert_eq!(peer.unsequenced_group_accept(7), None);

        // A later group in the same window is unaffected.
        assert!(peer.unsequenced_group_accept(8).is_some());
    }

    #[test]
    fn test_unsequenced_window_advances_and_bounds() {
        let (mut peer, _ctx) = connected_peer();

        let index = peer.unsequenced_group_accept(3).expect("accept");
        peer.mark_unsequenced(index);

        // Far beyond the free windows: rejected outright.
        assert_eq!(
            peer.unsequenced_group_accept(
                (FREE_UNSEQUENCED_WINDOWS * UNSEQUENCED_WINDOW_SIZE) as u16
            ),
            None
        );

        // A group in the next window advances the base and clears the
        // bitmap, so the old group becomes acceptable again.
        let next_window = UNSEQUENCED_WINDOW_SIZE as u16 + 3;
        let index = peer.unsequenced_group_accept(next_window).expect("advance");
        peer.mark_unsequenced(index);
        assert_eq!(peer.incoming_unsequenced_group, UNSEQUENCED_WINDOW_SIZE as u16);
    }

    #[test]
    fn test_send_rejects_wrong_state() {
        let (mut peer, mut ctx) = connected_peer();
        peer.state = PeerState::Disconnected;
        assert!(peer
            .send(&mut ctx, 0, Packet::reliable(&b"x"[..]))
            .is_err());
    }

    #[test]
    fn test_send_fragments_share_payload() {
        let (mut peer, mut ctx) = connected_peer();
        let payload = vec![0xA5u8; 4000];
        peer.send(&mut ctx, 0, Packet::reliable(payload)).unwrap();

        let fragments = &peer.outgoing_send_reliable_commands;
        assert!(fragments.len() > 1);

        let mut covered = 0usize;
        for (number, fragment) in fragments.iter().enumerate() {
            let CommandBody::SendFragment(params) = fragment.command.body else {
                panic!("expected fragment command");
            };
            assert_eq!(params.fragment_number, number as u32);
            assert_eq!(params.total_length, 4000);
            assert_eq!(params.start_sequence_number, 1);
            covered += params.data_length as usize;
        }
        assert_eq!(covered, 4000);

        // Consecutive reliable sequence numbers, one per fragment.
        let sequences: Vec<u16> = fragments
            .iter()
            .map(|f| f.reliable_sequence_number)
            .collect();
        let expected: Vec<u16> = (1..=fragments.len() as u16).collect();
        assert_eq!(sequences, expected);
    }

    #[test]
    fn test_small_send_picks_mode_from_flags() {
        let (mut peer, mut ctx) = connected_peer();

        peer.send(&mut ctx, 0, Packet::reliable(&b"r"[..])).unwrap();
        peer.send(&mut ctx, 0, Packet::unreliable(&b"u"[..])).unwrap();
        peer.send(&mut ctx, 0, Packet::unsequenced(&b"s"[..])).unwrap();

        // Reliable-with-payload is window-managed; the rest flow through
        // the plain outgoing queue.
        assert_eq!(peer.outgoing_send_reliable_commands.len(), 1);
        assert_eq!(peer.outgoing_commands.len(), 2);

        let kinds: Vec<CommandKind> = peer
            .outgoing_commands
            .iter()
            .filter_map(|c| c.command.header.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![CommandKind::SendUnreliable, CommandKind::SendUnsequenced]
        );
    }
}
