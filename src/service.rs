//! The host service loop: demultiplexing received datagrams into peer
//! protocol handlers, coalescing queued commands into outgoing datagrams,
//! and timed maintenance (retransmission, keepalive, throttling).

use std::net::SocketAddr;
use std::result::Result as StdResult;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, trace, warn};

use crate::channel::Channel;
use crate::common::{
    time_difference, time_greater_equal, time_less, time_now,
};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::host::{Host, HostCtx, Intercept};
use crate::packet::PacketFlags;
use crate::peer::{OutgoingCommand, Peer, PeerState, QueueOutcome};
use crate::protocol::constants::*;
use crate::protocol::{
    command_size, Command, CommandBody, CommandKind, ConnectParams, CHECKSUM_SIZE,
    PROTOCOL_HEADER_SIZE, PROTOCOL_HEADER_SIZE_MINIMAL,
};

/// Aborts processing of the remainder of a datagram.
struct CommandError;

/// One outgoing datagram under assembly for a peer.
struct OutgoingDatagram {
    /// Encoded commands and payloads; headers are prepended at transmit.
    commands: BytesMut,
    command_count: usize,
    /// Projected wire size including the header reserve.
    packet_size: usize,
    include_sent_time: bool,
    sent_unreliable: bool,
}

enum TimeoutOutcome {
    Alive,
    Disconnected(Option<Event>),
}

impl Host {
    /// Drive the protocol: dispatch pending events, transmit queued
    /// commands, receive and demultiplex datagrams, and wait up to
    /// `timeout_ms` for socket activity.
    ///
    /// Returns the next application event, or `None` when the timeout
    /// elapses without one.
    pub fn service(&mut self, timeout_ms: u32) -> Result<Option<Event>> {
        if let Some(event) = self.dispatch_incoming_commands() {
            return Ok(Some(event));
        }

        self.ctx.service_time = time_now();
        let timeout_at = self.ctx.service_time.wrapping_add(timeout_ms);

        loop {
            if let Some(event) = self.send_outgoing_commands(true, true)? {
                return Ok(Some(event));
            }
            if let Some(event) = self.receive_incoming_commands()? {
                return Ok(Some(event));
            }
            // Acknowledgements generated while receiving go out without
            // waiting for the next service call.
            if let Some(event) = self.send_outgoing_commands(true, true)? {
                return Ok(Some(event));
            }
            if self.bandwidth_throttle_due() {
                self.bandwidth_throttle();
            }
            if let Some(event) = self.dispatch_incoming_commands() {
                return Ok(Some(event));
            }

            if time_greater_equal(self.ctx.service_time, timeout_at) {
                return Ok(None);
            }

            loop {
                self.ctx.service_time = time_now();
                if time_greater_equal(self.ctx.service_time, timeout_at) {
                    return Ok(None);
                }
                let remaining = time_difference(timeout_at, self.ctx.service_time);
                if self.socket.wait(remaining)? {
                    break;
                }
            }
            self.ctx.service_time = time_now();
        }
    }

    /// Dispatch pending events without touching the socket.
    pub fn check_events(&mut self) -> Option<Event> {
        self.dispatch_incoming_commands()
    }

    /// Transmit everything queued without receiving or waiting.
    pub fn flush(&mut self) -> Result<()> {
        self.ctx.service_time = time_now();
        self.send_outgoing_commands(false, false)?;
        Ok(())
    }

    // --- event dispatch ---------------------------------------------------

    /// Convert the next completed command or state transition into an
    /// application event.
    pub(crate) fn dispatch_incoming_commands(&mut self) -> Option<Event> {
        while let Some(id) = self.ctx.dispatch_queue.pop_front() {
            let Host { peers, ctx, .. } = self;
            let peer = &mut peers[id as usize];
            peer.needs_dispatch = false;

            match peer.state {
                PeerState::ConnectionPending | PeerState::ConnectionSucceeded => {
                    peer.change_state(ctx, PeerState::Connected);
                    info!(peer = id, "connected");
                    return Some(Event::Connect {
                        peer: id,
                        data: peer.event_data,
                    });
                }
                PeerState::Zombie => {
                    ctx.recalculate_bandwidth_limits = true;
                    let data = peer.event_data;
                    peer.reset(ctx);
                    info!(peer = id, "disconnected");
                    return Some(Event::Disconnect { peer: id, data });
                }
                PeerState::Connected => {
                    let Some((channel_id, packet)) = peer.receive() else {
                        continue;
                    };
                    if !peer.dispatched_commands.is_empty() {
                        peer.enlist_for_dispatch(ctx);
                    }
                    return Some(Event::Receive {
                        peer: id,
                        channel_id,
                        packet,
                    });
                }
                _ => continue,
            }
        }
        None
    }

    // --- outgoing path ----------------------------------------------------

    /// One full send sweep over all peers; peers that filled a datagram
    /// get further passes until their queues fit.
    fn send_outgoing_commands(
        &mut self,
        check_for_timeouts: bool,
        produce_events: bool,
    ) -> Result<Option<Event>> {
        let mut first_pass = true;
        loop {
            let mut resend = false;
            for index in 0..self.peers.len() {
                {
                    let peer = &mut self.peers[index];
                    if peer.state == PeerState::Disconnected || peer.state == PeerState::Zombie {
                        continue;
                    }
                    if !first_pass && !peer.continue_sending {
                        continue;
                    }
                    peer.continue_sending = false;
                }

                if let Some(event) =
                    self.service_peer_send(index, check_for_timeouts, produce_events)?
                {
                    return Ok(Some(event));
                }
                if self.peers[index].continue_sending {
                    resend = true;
                }
            }
            first_pass = false;
            if !resend {
                return Ok(None);
            }
        }
    }

    /// Assemble and transmit one datagram for one peer.
    fn service_peer_send(
        &mut self,
        index: usize,
        check_for_timeouts: bool,
        produce_events: bool,
    ) -> Result<Option<Event>> {
        let mut dg = OutgoingDatagram {
            commands: BytesMut::new(),
            command_count: 0,
            packet_size: PROTOCOL_HEADER_SIZE
                + if self.ctx.checksum_enabled { CHECKSUM_SIZE } else { 0 },
            include_sent_time: false,
            sent_unreliable: false,
        };

        {
            let Host { peers, ctx, .. } = self;
            let peer = &mut peers[index];

            if !peer.acknowledgements.is_empty() {
                send_acknowledgements(peer, ctx, &mut dg);
            }

            if check_for_timeouts
                && !peer.sent_reliable_commands.is_empty()
                && time_greater_equal(ctx.service_time, peer.next_timeout)
            {
                if let TimeoutOutcome::Disconnected(event) =
                    check_timeouts(peer, ctx, produce_events)
                {
                    return Ok(event);
                }
            }

            let can_ping = check_outgoing_commands(peer, ctx, &mut dg);

            // Keepalive: an idle connection still measures RTT and proves
            // liveness.
            if can_ping
                && peer.state == PeerState::Connected
                && !peer.has_outgoing_commands()
                && time_difference(ctx.service_time, peer.last_receive_time) >= peer.ping_interval
                && peer.mtu as usize >= dg.packet_size + command_size(CommandKind::Ping)
            {
                peer.ping(ctx);
                check_outgoing_commands(peer, ctx, &mut dg);
            }

            if dg.command_count == 0 {
                return Ok(None);
            }

            // Rolling packet-loss statistics over a fixed interval.
            if peer.packet_loss_epoch == 0 {
                peer.packet_loss_epoch = ctx.service_time;
            } else if time_difference(ctx.service_time, peer.packet_loss_epoch)
                >= PACKET_LOSS_INTERVAL
                && peer.packets_sent > 0
            {
                let packet_loss = peer.packets_lost * PACKET_LOSS_SCALE / peer.packets_sent;
                peer.packet_loss_variance =
                    (peer.packet_loss_variance * 3 + packet_loss.abs_diff(peer.packet_loss)) / 4;
                peer.packet_loss = (peer.packet_loss * 7 + packet_loss) / 8;
                peer.packet_loss_epoch = ctx.service_time;
                peer.packets_sent = 0;
                peer.packets_lost = 0;
            }
        }

        self.transmit(index, &dg)?;

        if dg.sent_unreliable {
            let Host { peers, ctx, .. } = self;
            let peer = &mut peers[index];
            if peer.state == PeerState::DisconnectLater && !peer.has_outgoing_commands() {
                let data = peer.event_data;
                peer.start_disconnect(ctx, data);
            }
        }

        Ok(None)
    }

    /// Prepend the datagram header (and optional checksum), compress if
    /// profitable, and put the datagram on the wire.
    fn transmit(&mut self, index: usize, dg: &OutgoingDatagram) -> Result<()> {
        let Host {
            socket,
            peers,
            ctx,
            compressor,
            checksum,
            scratch,
            total_sent_data,
            total_sent_packets,
            ..
        } = self;
        let peer = &mut peers[index];
        let Some(address) = peer.address else {
            return Ok(());
        };

        let mut header_flags = 0u16;
        if dg.include_sent_time {
            header_flags |= HEADER_FLAG_SENT_TIME;
        }

        let mut command_area: &[u8] = &dg.commands;
        if let Some(compressor) = compressor {
            if let Some(compressed) = compressor.compress(&dg.commands, &mut scratch[..]) {
                if compressed > 0 && compressed < dg.commands.len() {
                    header_flags |= HEADER_FLAG_COMPRESSED;
                    command_area = &scratch[..compressed];
                }
            }
        }

        if peer.outgoing_peer_id < MAXIMUM_PEER_ID {
            header_flags |= (peer.outgoing_session_id as u16) << HEADER_SESSION_SHIFT;
        }

        let mut datagram =
            BytesMut::with_capacity(PROTOCOL_HEADER_SIZE + CHECKSUM_SIZE + command_area.len());
        datagram.put_u16(peer.outgoing_peer_id | header_flags);
        if dg.include_sent_time {
            datagram.put_u16((ctx.service_time & 0xFFFF) as u16);
        }

        if let Some(checksum) = checksum {
            // The checksum field doubles as the seed slot: the connect
            // nonce goes in before computing, the digest replaces it.
            let offset = datagram.len();
            let seed = if peer.outgoing_peer_id < MAXIMUM_PEER_ID {
                peer.connect_id
            } else {
                0
            };
            datagram.put_u32(seed);
            datagram.extend_from_slice(command_area);
            let digest = checksum(&datagram);
            datagram[offset..offset + CHECKSUM_SIZE].copy_from_slice(&digest.to_be_bytes());
        } else {
            datagram.extend_from_slice(command_area);
        }

        peer.last_send_time = ctx.service_time;
        peer.packets_sent += 1;

        match socket.send_to(&datagram, address) {
            Ok(sent) => {
                *total_sent_data += sent as u64;
                *total_sent_packets += 1;
            }
            // A full send buffer costs this datagram like any other
            // network loss; reliable traffic retransmits.
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }

    // --- incoming path ----------------------------------------------------

    /// Drain up to 256 datagrams from the socket through the protocol.
    fn receive_incoming_commands(&mut self) -> Result<Option<Event>> {
        for _ in 0..256 {
            let received = self.socket.recv_from(&mut self.received_data[..])?;
            let Some((length, from)) = received else {
                break;
            };

            self.total_received_data += length as u64;
            self.total_received_packets += 1;

            if let Some(intercept) = self.intercept.as_mut() {
                match intercept(from, &self.received_data[..length]) {
                    Intercept::Pass => {}
                    Intercept::Consume(event) => {
                        if event.is_some() {
                            return Ok(event);
                        }
                        continue;
                    }
                    Intercept::Error => {
                        return Err(Error::protocol("datagram rejected by intercept callback"))
                    }
                }
            }

            if let Some(event) = self.handle_datagram(length, from)? {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    /// Parse one datagram: resolve the peer, verify the checksum,
    /// decompress, then feed each command to its handler.
    fn handle_datagram(&mut self, length: usize, from: SocketAddr) -> Result<Option<Event>> {
        if length < PROTOCOL_HEADER_SIZE_MINIMAL {
            return Ok(None);
        }

        let peer_id_field = u16::from_be_bytes([self.received_data[0], self.received_data[1]]);
        let flags = peer_id_field & HEADER_FLAG_MASK;
        let session_id = ((peer_id_field & HEADER_SESSION_MASK) >> HEADER_SESSION_SHIFT) as u8;
        let peer_id = peer_id_field & !(HEADER_FLAG_MASK | HEADER_SESSION_MASK);
        let has_sent_time = flags & HEADER_FLAG_SENT_TIME != 0;

        let mut header_size = if has_sent_time {
            PROTOCOL_HEADER_SIZE
        } else {
            PROTOCOL_HEADER_SIZE_MINIMAL
        };
        if self.checksum.is_some() {
            header_size += CHECKSUM_SIZE;
        }
        if length < header_size {
            return Ok(None);
        }

        let sent_time = if has_sent_time {
            u16::from_be_bytes([self.received_data[2], self.received_data[3]])
        } else {
            0
        };

        let peer_index = if peer_id == MAXIMUM_PEER_ID {
            None
        } else if peer_id as usize >= self.peers.len() {
            return Ok(None);
        } else {
            let peer = &self.peers[peer_id as usize];
            if peer.state == PeerState::Disconnected || peer.state == PeerState::Zombie {
                return Ok(None);
            }
            if peer.address != Some(from) {
                return Ok(None);
            }
            if peer.outgoing_peer_id < MAXIMUM_PEER_ID && session_id != peer.incoming_session_id {
                debug!(peer = peer_id, "dropping datagram from stale session");
                return Ok(None);
            }
            Some(peer_id as usize)
        };

        if self.checksum.is_some() {
            let offset = header_size - CHECKSUM_SIZE;
            let stored = u32::from_be_bytes(
                self.received_data[offset..offset + CHECKSUM_SIZE]
                    .try_into()
                    .expect("checksum slice"),
            );
            let seed = peer_index.map_or(0, |i| self.peers[i].connect_id);
            self.received_data[offset..offset + CHECKSUM_SIZE]
                .copy_from_slice(&seed.to_be_bytes());
            let digest =
                (self.checksum.as_mut().expect("checksum present"))(&self.received_data[..length]);
            if digest != stored {
                debug!(from = %from, "dropping datagram with bad checksum");
                return Ok(None);
            }
        }

        let mut commands: Bytes = if flags & HEADER_FLAG_COMPRESSED != 0 {
            let Some(compressor) = self.compressor.as_mut() else {
                return Ok(None);
            };
            match compressor
                .decompress(&self.received_data[header_size..length], &mut self.scratch[..])
            {
                Some(size) if size > 0 && size <= MAXIMUM_MTU as usize => {
                    Bytes::copy_from_slice(&self.scratch[..size])
                }
                _ => {
                    debug!(from = %from, "dropping datagram that failed to decompress");
                    return Ok(None);
                }
            }
        } else {
            Bytes::copy_from_slice(&self.received_data[header_size..length])
        };

        if let Some(index) = peer_index {
            let peer = &mut self.peers[index];
            // Follow address changes of a validated session (NAT rebind).
            peer.address = Some(from);
            peer.incoming_data_total += length as u32;
        }

        let mut current_peer = peer_index;
        let mut event: Option<Event> = None;

        while !commands.is_empty() {
            let Some(command) = Command::decode(&mut commands) else {
                break;
            };
            let kind = match command.header.kind() {
                Some(kind) => kind,
                None => break,
            };

            let payload_length = command.payload_length();
            if payload_length > commands.len() || payload_length > self.ctx.maximum_packet_size {
                debug!(from = %from, "dropping truncated command");
                break;
            }
            let payload = commands.split_to(payload_length);

            let outcome: StdResult<(), CommandError> = if kind == CommandKind::Connect {
                if current_peer.is_some() {
                    break;
                }
                match self.handle_connect(from, &command) {
                    Some(index) => {
                        current_peer = Some(index);
                        Ok(())
                    }
                    None => break,
                }
            } else {
                let Some(index) = current_peer else { break };
                match kind {
                    CommandKind::Acknowledge => {
                        self.handle_acknowledge(index, &command, &mut event)
                    }
                    CommandKind::VerifyConnect => {
                        self.handle_verify_connect(index, &command, &mut event)
                    }
                    CommandKind::Disconnect => self.handle_disconnect(index, &command),
                    CommandKind::Ping => self.handle_ping(index),
                    CommandKind::SendReliable => {
                        self.handle_send_reliable(index, &command, payload)
                    }
                    CommandKind::SendUnreliable => {
                        self.handle_send_unreliable(index, &command, payload)
                    }
                    CommandKind::SendUnsequenced => {
                        self.handle_send_unsequenced(index, &command, payload)
                    }
                    CommandKind::SendFragment => {
                        self.handle_send_fragment(index, &command, payload)
                    }
                    CommandKind::SendUnreliableFragment => {
                        self.handle_send_unreliable_fragment(index, &command, payload)
                    }
                    CommandKind::BandwidthLimit => self.handle_bandwidth_limit(index, &command),
                    CommandKind::ThrottleConfigure => {
                        self.handle_throttle_configure(index, &command)
                    }
                    CommandKind::Connect => unreachable!("handled above"),
                }
            };

            if outcome.is_err() {
                break;
            }

            if command.header.wants_acknowledge() {
                let Some(index) = current_peer else { break };
                if !has_sent_time {
                    break;
                }
                let peer = &mut self.peers[index];
                match peer.state {
                    PeerState::Disconnecting
                    | PeerState::AcknowledgingConnect
                    | PeerState::Disconnected
                    | PeerState::Zombie => {}
                    PeerState::AcknowledgingDisconnect => {
                        if kind == CommandKind::Disconnect {
                            peer.queue_acknowledgement(&command.header, sent_time);
                        }
                    }
                    _ => peer.queue_acknowledgement(&command.header, sent_time),
                }
            }
        }

        Ok(event)
    }

    // --- command handlers -------------------------------------------------

    /// Accept (or reject) a connection request from an unknown peer,
    /// assigning it a slot and answering with VERIFY_CONNECT.
    fn handle_connect(&mut self, from: SocketAddr, command: &Command) -> Option<usize> {
        let CommandBody::Connect { params, data } = command.body else {
            return None;
        };

        let channel_count = params.channel_count as usize;
        if !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&channel_count) {
            return None;
        }

        let mut slot = None;
        let mut duplicate_peers = 0usize;
        for (index, peer) in self.peers.iter().enumerate() {
            if peer.state == PeerState::Disconnected {
                if slot.is_none() {
                    slot = Some(index);
                }
            } else if let Some(address) = peer.address {
                if address.ip() == from.ip() {
                    if address.port() == from.port() && peer.connect_id == params.connect_id {
                        // Replay of a connect we already accepted.
                        return None;
                    }
                    duplicate_peers += 1;
                }
            }
        }

        let slot = slot?;
        if duplicate_peers >= self.ctx.duplicate_peers {
            debug!(from = %from, "rejecting connect: per-address peer limit");
            return None;
        }

        let channel_count = channel_count.min(self.ctx.channel_limit);
        let Host { peers, ctx, .. } = self;
        let peer = &mut peers[slot];

        peer.state = PeerState::AcknowledgingConnect;
        peer.connect_id = params.connect_id;
        peer.address = Some(from);
        peer.outgoing_peer_id = params.outgoing_peer_id;
        peer.incoming_bandwidth = params.incoming_bandwidth;
        peer.outgoing_bandwidth = params.outgoing_bandwidth;
        peer.packet_throttle_interval = params.packet_throttle_interval;
        peer.packet_throttle_acceleration = params.packet_throttle_acceleration;
        peer.packet_throttle_deceleration = params.packet_throttle_deceleration;
        peer.event_data = data;
        peer.allocate_channels(channel_count);

        // Each side rotates its session id, skipping the value the other
        // side is currently using, so datagrams from an abandoned session
        // fail the header check.
        let mut incoming_session = if params.incoming_session_id == 0xFF {
            peer.outgoing_session_id
        } else {
            params.incoming_session_id
        };
        incoming_session = (incoming_session.wrapping_add(1))
            & (HEADER_SESSION_MASK >> HEADER_SESSION_SHIFT) as u8;
        if incoming_session == peer.outgoing_session_id {
            incoming_session = (incoming_session.wrapping_add(1))
                & (HEADER_SESSION_MASK >> HEADER_SESSION_SHIFT) as u8;
        }
        peer.outgoing_session_id = incoming_session;

        let mut outgoing_session = if params.outgoing_session_id == 0xFF {
            peer.incoming_session_id
        } else {
            params.outgoing_session_id
        };
        outgoing_session = (outgoing_session.wrapping_add(1))
            & (HEADER_SESSION_MASK >> HEADER_SESSION_SHIFT) as u8;
        if outgoing_session == peer.incoming_session_id {
            outgoing_session = (outgoing_session.wrapping_add(1))
                & (HEADER_SESSION_MASK >> HEADER_SESSION_SHIFT) as u8;
        }
        peer.incoming_session_id = outgoing_session;

        let mtu = params.mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU);
        if mtu < peer.mtu {
            peer.mtu = mtu;
        }

        peer.window_size = negotiated_window_size(ctx.outgoing_bandwidth, peer.incoming_bandwidth);

        // Advertise a receive window bounded by our own incoming
        // bandwidth and the requested window.
        let mut window_size = if ctx.incoming_bandwidth == 0 {
            MAXIMUM_WINDOW_SIZE
        } else {
            (ctx.incoming_bandwidth / WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE
        };
        window_size = window_size
            .min(params.window_size)
            .clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE);

        info!(peer = slot, from = %from, channels = channel_count, "incoming connection");

        let verify = Command::new(
            CommandKind::VerifyConnect as u8 | COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            CommandBody::VerifyConnect(ConnectParams {
                outgoing_peer_id: peer.incoming_peer_id,
                incoming_session_id: peer.outgoing_session_id,
                outgoing_session_id: peer.incoming_session_id,
                mtu: peer.mtu,
                window_size,
                channel_count: channel_count as u32,
                incoming_bandwidth: ctx.incoming_bandwidth,
                outgoing_bandwidth: ctx.outgoing_bandwidth,
                packet_throttle_interval: peer.packet_throttle_interval,
                packet_throttle_acceleration: peer.packet_throttle_acceleration,
                packet_throttle_deceleration: peer.packet_throttle_deceleration,
                connect_id: peer.connect_id,
            }),
        );
        peer.queue_outgoing_command(ctx, verify, None, 0, 0);

        Some(slot)
    }

    /// Complete the handshake on the connecting side.
    fn handle_verify_connect(
        &mut self,
        index: usize,
        command: &Command,
        event: &mut Option<Event>,
    ) -> StdResult<(), CommandError> {
        let CommandBody::VerifyConnect(params) = command.body else {
            return Err(CommandError);
        };
        let Host { peers, ctx, .. } = self;
        let peer = &mut peers[index];

        if peer.state != PeerState::Connecting {
            return Ok(());
        }

        let channel_count = params.channel_count as usize;
        if !(MINIMUM_CHANNEL_COUNT..=MAXIMUM_CHANNEL_COUNT).contains(&channel_count)
            || params.packet_throttle_interval != peer.packet_throttle_interval
            || params.packet_throttle_acceleration != peer.packet_throttle_acceleration
            || params.packet_throttle_deceleration != peer.packet_throttle_deceleration
            || params.connect_id != peer.connect_id
        {
            warn!(peer = index, "handshake verification mismatch");
            peer.event_data = 0;
            peer.dispatch_state(ctx, PeerState::Zombie);
            return Err(CommandError);
        }

        peer.remove_sent_reliable_command(1, 0xFF);

        if channel_count < peer.channels.len() {
            peer.channels.truncate(channel_count);
        }
        peer.outgoing_peer_id = params.outgoing_peer_id;
        peer.incoming_session_id = params.incoming_session_id;
        peer.outgoing_session_id = params.outgoing_session_id;

        let mtu = params.mtu.clamp(MINIMUM_MTU, MAXIMUM_MTU);
        if mtu < peer.mtu {
            peer.mtu = mtu;
        }

        let window_size = params
            .window_size
            .clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE);
        if window_size < peer.window_size {
            peer.window_size = window_size;
        }

        peer.incoming_bandwidth = params.incoming_bandwidth;
        peer.outgoing_bandwidth = params.outgoing_bandwidth;

        notify_connect(peer, ctx, event);
        Ok(())
    }

    fn handle_disconnect(&mut self, index: usize, command: &Command) -> StdResult<(), CommandError> {
        let CommandBody::Disconnect { data } = command.body else {
            return Err(CommandError);
        };
        let Host { peers, ctx, .. } = self;
        let peer = &mut peers[index];

        if matches!(
            peer.state,
            PeerState::Zombie | PeerState::Disconnected | PeerState::AcknowledgingDisconnect
        ) {
            return Ok(());
        }

        peer.reset_queues(ctx);

        match peer.state {
            PeerState::ConnectionSucceeded | PeerState::Disconnecting | PeerState::Connecting => {
                peer.dispatch_state(ctx, PeerState::Zombie);
            }
            PeerState::Connected | PeerState::DisconnectLater => {
                if command.header.wants_acknowledge() {
                    peer.change_state(ctx, PeerState::AcknowledgingDisconnect);
                } else {
                    peer.dispatch_state(ctx, PeerState::Zombie);
                }
            }
            PeerState::ConnectionPending => {
                ctx.recalculate_bandwidth_limits = true;
                peer.reset(ctx);
            }
            _ => {
                peer.reset(ctx);
            }
        }

        if peer.state != PeerState::Disconnected {
            peer.event_data = data;
        }
        Ok(())
    }

    fn handle_ping(&mut self, index: usize) -> StdResult<(), CommandError> {
        if self.peers[index].state.is_session() {
            Ok(())
        } else {
            Err(CommandError)
        }
    }

    /// Fold a returned acknowledgement into RTT statistics, the packet
    /// throttle, and the retransmission queues.
    fn handle_acknowledge(
        &mut self,
        index: usize,
        command: &Command,
        event: &mut Option<Event>,
    ) -> StdResult<(), CommandError> {
        let CommandBody::Acknowledge {
            received_reliable_sequence_number,
            received_sent_time,
        } = command.body
        else {
            return Err(CommandError);
        };
        let Host { peers, ctx, .. } = self;
        let peer = &mut peers[index];

        if peer.state == PeerState::Disconnected || peer.state == PeerState::Zombie {
            return Ok(());
        }

        // Widen the echoed 16-bit timestamp against the current service
        // time; an apparently-future value belongs to the previous epoch.
        let mut received_sent_time = received_sent_time as u32 | (ctx.service_time & 0xFFFF_0000);
        if time_less(ctx.service_time, received_sent_time) {
            received_sent_time = received_sent_time.wrapping_sub(0x10000);
        }
        if time_less(ctx.service_time, received_sent_time) {
            return Ok(());
        }

        let round_trip_time = time_difference(ctx.service_time, received_sent_time).max(1);

        if peer.last_receive_time > 0 {
            peer.throttle(round_trip_time);

            peer.round_trip_time_variance -= peer.round_trip_time_variance / 4;
            if round_trip_time >= peer.round_trip_time {
                let diff = round_trip_time - peer.round_trip_time;
                peer.round_trip_time_variance += diff / 4;
                peer.round_trip_time += diff / 8;
            } else {
                let diff = peer.round_trip_time - round_trip_time;
                peer.round_trip_time_variance += diff / 4;
                peer.round_trip_time -= diff / 8;
            }
        } else {
            peer.round_trip_time = round_trip_time;
            peer.round_trip_time_variance = (round_trip_time + 1) / 2;
        }

        if peer.round_trip_time < peer.lowest_round_trip_time {
            peer.lowest_round_trip_time = peer.round_trip_time;
        }
        if peer.round_trip_time_variance > peer.highest_round_trip_time_variance {
            peer.highest_round_trip_time_variance = peer.round_trip_time_variance;
        }

        if peer.packet_throttle_epoch == 0
            || time_difference(ctx.service_time, peer.packet_throttle_epoch)
                >= peer.packet_throttle_interval
        {
            peer.last_round_trip_time = peer.lowest_round_trip_time;
            peer.last_round_trip_time_variance = peer.highest_round_trip_time_variance.max(1);
            peer.lowest_round_trip_time = peer.round_trip_time;
            peer.highest_round_trip_time_variance = peer.round_trip_time_variance;
            peer.packet_throttle_epoch = ctx.service_time;
            peer.packet_throttle_counter = 0;
        }

        peer.last_receive_time = ctx.service_time.max(1);
        peer.earliest_timeout = 0;

        let kind = peer
            .remove_sent_reliable_command(received_reliable_sequence_number, command.header.channel_id);

        trace!(peer = index, rtt = round_trip_time, "acknowledged");

        match peer.state {
            PeerState::AcknowledgingConnect => {
                if kind != Some(CommandKind::VerifyConnect) {
                    return Err(CommandError);
                }
                notify_connect(peer, ctx, event);
            }
            PeerState::Disconnecting => {
                if kind != Some(CommandKind::Disconnect) {
                    return Err(CommandError);
                }
                if let Some(disconnect) = notify_disconnect(peer, ctx, event.is_none()) {
                    *event = Some(disconnect);
                }
            }
            PeerState::DisconnectLater => {
                if !peer.has_outgoing_commands() {
                    let data = peer.event_data;
                    peer.start_disconnect(ctx, data);
                }
            }
            _ => {}
        }

        Ok(())
    }

    fn handle_send_reliable(
        &mut self,
        index: usize,
        command: &Command,
        payload: Bytes,
    ) -> StdResult<(), CommandError> {
        let Host { peers, ctx, .. } = self;
        let peer = &mut peers[index];

        if command.header.channel_id as usize >= peer.channels.len() || !peer.state.is_session() {
            return Err(CommandError);
        }

        match peer.queue_incoming_command(
            ctx,
            &command.header,
            0,
            Some(payload),
            0,
            PacketFlags::RELIABLE,
            0,
        ) {
            QueueOutcome::Refused => Err(CommandError),
            _ => Ok(()),
        }
    }

    fn handle_send_unreliable(
        &mut self,
        index: usize,
        command: &Command,
        payload: Bytes,
    ) -> StdResult<(), CommandError> {
        let CommandBody::SendUnreliable {
            unreliable_sequence_number,
            ..
        } = command.body
        else {
            return Err(CommandError);
        };
        let Host { peers, ctx, .. } = self;
        let peer = &mut peers[index];

        if command.header.channel_id as usize >= peer.channels.len() || !peer.state.is_session() {
            return Err(CommandError);
        }

        match peer.queue_incoming_command(
            ctx,
            &command.header,
            unreliable_sequence_number,
            Some(payload),
            0,
            PacketFlags::empty(),
            0,
        ) {
            QueueOutcome::Refused => Err(CommandError),
            _ => Ok(()),
        }
    }

    fn handle_send_unsequenced(
        &mut self,
        index: usize,
        command: &Command,
        payload: Bytes,
    ) -> StdResult<(), CommandError> {
        let CommandBody::SendUnsequenced {
            unsequenced_group, ..
        } = command.body
        else {
            return Err(CommandError);
        };
        let Host { peers, ctx, .. } = self;
        let peer = &mut peers[index];

        if command.header.channel_id as usize >= peer.channels.len() || !peer.state.is_session() {
            return Err(CommandError);
        }

        let Some(window_index) = peer.unsequenced_group_accept(unsequenced_group) else {
            return Ok(());
        };

        match peer.queue_incoming_command(
            ctx,
            &command.header,
            0,
            Some(payload),
            0,
            PacketFlags::UNSEQUENCED,
            0,
        ) {
            QueueOutcome::Refused => Err(CommandError),
            QueueOutcome::Discarded => Ok(()),
            QueueOutcome::Queued => {
                peer.mark_unsequenced(window_index);
                Ok(())
            }
        }
    }

    /// Reassemble one fragment of a reliably-delivered packet.
    fn handle_send_fragment(
        &mut self,
        index: usize,
        command: &Command,
        payload: Bytes,
    ) -> StdResult<(), CommandError> {
        let CommandBody::SendFragment(params) = command.body else {
            return Err(CommandError);
        };
        let Host { peers, ctx, .. } = self;
        let peer = &mut peers[index];
        let channel_index = command.header.channel_id as usize;

        if channel_index >= peer.channels.len() || !peer.state.is_session() {
            return Err(CommandError);
        }

        let start_sequence_number = params.start_sequence_number;
        {
            let channel = &peer.channels[channel_index];
            let start_window = channel.incoming_window_of(start_sequence_number);
            let current_window = channel.current_incoming_window();
            if start_window < current_window
                || start_window >= current_window + FREE_RELIABLE_WINDOWS
            {
                return Ok(());
            }
        }

        if validate_fragment(&params, ctx.maximum_packet_size, payload.len()).is_err() {
            return Err(CommandError);
        }

        let existing = find_reliable_fragment_start(
            &peer.channels[channel_index],
            start_sequence_number,
        );

        let found = match existing {
            FragmentSearch::Found(at) => {
                let incoming = &peer.channels[channel_index].incoming_reliable_commands[at];
                if incoming.command & COMMAND_MASK != CommandKind::SendFragment as u8
                    || params.total_length as usize != incoming.total_length()
                    || params.fragment_count != incoming.fragment_count
                {
                    // Conflicting fragment metadata cannot come from
                    // reordering; the stream is corrupt beyond recovery.
                    warn!(peer = index, "fragment metadata mismatch, dropping peer");
                    peer.event_data = 0;
                    peer.dispatch_state(ctx, PeerState::Zombie);
                    return Err(CommandError);
                }
                Some(at)
            }
            FragmentSearch::Missing => {
                let mut header = command.header;
                header.reliable_sequence_number = start_sequence_number;
                match peer.queue_incoming_command(
                    ctx,
                    &header,
                    0,
                    None,
                    params.total_length as usize,
                    PacketFlags::RELIABLE,
                    params.fragment_count,
                ) {
                    QueueOutcome::Queued => peer.channels[channel_index]
                        .incoming_reliable_commands
                        .iter()
                        .position(|incoming| {
                            incoming.fragment_count > 0
                                && incoming.reliable_sequence_number == start_sequence_number
                        }),
                    QueueOutcome::Discarded => None,
                    QueueOutcome::Refused => return Err(CommandError),
                }
            }
        };

        let Some(at) = found else { return Ok(()) };

        let completed = peer.channels[channel_index].incoming_reliable_commands[at]
            .apply_fragment(params.fragment_number, params.fragment_offset as usize, &payload);
        if completed {
            peer.dispatch_incoming_reliable_commands(ctx, channel_index);
        }
        Ok(())
    }

    /// Reassemble one fragment of an unreliably-delivered packet.
    fn handle_send_unreliable_fragment(
        &mut self,
        index: usize,
        command: &Command,
        payload: Bytes,
    ) -> StdResult<(), CommandError> {
        let CommandBody::SendFragment(params) = command.body else {
            return Err(CommandError);
        };
        let Host { peers, ctx, .. } = self;
        let peer = &mut peers[index];
        let channel_index = command.header.channel_id as usize;

        if channel_index >= peer.channels.len() || !peer.state.is_session() {
            return Err(CommandError);
        }

        let reliable_sequence_number = command.header.reliable_sequence_number;
        let start_sequence_number = params.start_sequence_number;
        {
            let channel = &peer.channels[channel_index];
            let reliable_window = channel.incoming_window_of(reliable_sequence_number);
            let current_window = channel.current_incoming_window();
            if reliable_window < current_window
                || reliable_window >= current_window + FREE_RELIABLE_WINDOWS
            {
                return Ok(());
            }
            if reliable_sequence_number == channel.incoming_reliable_sequence_number
                && start_sequence_number <= channel.incoming_unreliable_sequence_number
            {
                return Ok(());
            }
        }

        if validate_fragment(&params, ctx.maximum_packet_size, payload.len()).is_err() {
            return Err(CommandError);
        }

        let existing = find_unreliable_fragment_start(
            &peer.channels[channel_index],
            reliable_sequence_number,
            start_sequence_number,
        );

        let found = match existing {
            FragmentSearch::Found(at) => {
                let incoming = &peer.channels[channel_index].incoming_unreliable_commands[at];
                if incoming.command & COMMAND_MASK != CommandKind::SendUnreliableFragment as u8
                    || params.total_length as usize != incoming.total_length()
                    || params.fragment_count != incoming.fragment_count
                {
                    warn!(peer = index, "fragment metadata mismatch, dropping peer");
                    peer.event_data = 0;
                    peer.dispatch_state(ctx, PeerState::Zombie);
                    return Err(CommandError);
                }
                Some(at)
            }
            FragmentSearch::Missing => {
                match peer.queue_incoming_command(
                    ctx,
                    &command.header,
                    start_sequence_number,
                    None,
                    params.total_length as usize,
                    PacketFlags::UNRELIABLE_FRAGMENT,
                    params.fragment_count,
                ) {
                    QueueOutcome::Queued => peer.channels[channel_index]
                        .incoming_unreliable_commands
                        .iter()
                        .position(|incoming| {
                            incoming.fragment_count > 0
                                && incoming.reliable_sequence_number == reliable_sequence_number
                                && incoming.unreliable_sequence_number == start_sequence_number
                        }),
                    QueueOutcome::Discarded => None,
                    QueueOutcome::Refused => return Err(CommandError),
                }
            }
        };

        let Some(at) = found else { return Ok(()) };

        let completed = peer.channels[channel_index].incoming_unreliable_commands[at]
            .apply_fragment(params.fragment_number, params.fragment_offset as usize, &payload);
        if completed {
            peer.dispatch_incoming_unreliable_commands(ctx, channel_index);
        }
        Ok(())
    }

    fn handle_bandwidth_limit(
        &mut self,
        index: usize,
        command: &Command,
    ) -> StdResult<(), CommandError> {
        let CommandBody::BandwidthLimit {
            incoming_bandwidth,
            outgoing_bandwidth,
        } = command.body
        else {
            return Err(CommandError);
        };
        let Host { peers, ctx, .. } = self;
        let peer = &mut peers[index];

        if !peer.state.is_session() {
            return Err(CommandError);
        }

        if peer.incoming_bandwidth != 0 {
            ctx.bandwidth_limited_peers -= 1;
        }
        peer.incoming_bandwidth = incoming_bandwidth;
        peer.outgoing_bandwidth = outgoing_bandwidth;
        if peer.incoming_bandwidth != 0 {
            ctx.bandwidth_limited_peers += 1;
        }

        peer.window_size = negotiated_window_size(ctx.outgoing_bandwidth, peer.incoming_bandwidth);
        Ok(())
    }

    fn handle_throttle_configure(
        &mut self,
        index: usize,
        command: &Command,
    ) -> StdResult<(), CommandError> {
        let CommandBody::ThrottleConfigure {
            packet_throttle_interval,
            packet_throttle_acceleration,
            packet_throttle_deceleration,
        } = command.body
        else {
            return Err(CommandError);
        };
        let peer = &mut self.peers[index];

        if !peer.state.is_session() {
            return Err(CommandError);
        }

        peer.packet_throttle_interval = packet_throttle_interval;
        peer.packet_throttle_acceleration = packet_throttle_acceleration;
        peer.packet_throttle_deceleration = packet_throttle_deceleration;
        Ok(())
    }
}

/// Window size derived from the slower direction of a link; either side
/// being unlimited defers to the other.
fn negotiated_window_size(outgoing_bandwidth: u32, incoming_bandwidth: u32) -> u32 {
    if outgoing_bandwidth == 0 && incoming_bandwidth == 0 {
        return MAXIMUM_WINDOW_SIZE;
    }
    let window_size = if outgoing_bandwidth == 0 || incoming_bandwidth == 0 {
        (outgoing_bandwidth.max(incoming_bandwidth) / WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE
    } else {
        (outgoing_bandwidth.min(incoming_bandwidth) / WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE
    };
    window_size.clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE)
}

fn validate_fragment(
    params: &crate::protocol::FragmentParams,
    maximum_packet_size: usize,
    payload_length: usize,
) -> StdResult<(), ()> {
    if params.fragment_count > MAXIMUM_FRAGMENT_COUNT
        || params.fragment_number >= params.fragment_count
        || params.total_length as usize > maximum_packet_size
        || params.total_length < params.fragment_count
        || params.fragment_offset >= params.total_length
        || payload_length == 0
        || payload_length as u32 > params.total_length - params.fragment_offset
    {
        return Err(());
    }
    Ok(())
}

enum FragmentSearch {
    Found(usize),
    Missing,
}

/// Locate a reliable fragment set's start entry by its start sequence
/// number, scanning the wrap-ordered queue from the back.
fn find_reliable_fragment_start(channel: &Channel, start_sequence_number: u16) -> FragmentSearch {
    let queue = &channel.incoming_reliable_commands;
    let current = channel.incoming_reliable_sequence_number;

    let mut i = queue.len();
    while i > 0 {
        i -= 1;
        let incoming = &queue[i];

        if start_sequence_number >= current {
            if incoming.reliable_sequence_number < current {
                continue;
            }
        } else if incoming.reliable_sequence_number >= current {
            break;
        }

        if incoming.reliable_sequence_number <= start_sequence_number {
            if incoming.reliable_sequence_number < start_sequence_number {
                break;
            }
            return FragmentSearch::Found(i);
        }
    }
    FragmentSearch::Missing
}

/// Locate an unreliable fragment set's start entry by (reliable, start)
/// sequence numbers.
fn find_unreliable_fragment_start(
    channel: &Channel,
    reliable_sequence_number: u16,
    start_sequence_number: u16,
) -> FragmentSearch {
    let queue = &channel.incoming_unreliable_commands;
    let current = channel.incoming_reliable_sequence_number;

    let mut i = queue.len();
    while i > 0 {
        i -= 1;
        let incoming = &queue[i];

        if incoming.is_unsequenced() {
            continue;
        }

        if reliable_sequence_number >= current {
            if incoming.reliable_sequence_number < current {
                continue;
            }
        } else if incoming.reliable_sequence_number >= current {
            break;
        }

        if incoming.reliable_sequence_number < reliable_sequence_number {
            break;
        }
        if incoming.reliable_sequence_number > reliable_sequence_number {
            continue;
        }

        if incoming.unreliable_sequence_number <= start_sequence_number {
            if incoming.unreliable_sequence_number < start_sequence_number {
                break;
            }
            return FragmentSearch::Found(i);
        }
    }
    FragmentSearch::Missing
}

/// Complete the handshake: either surface the CONNECT event directly or
/// park the peer for dispatch.
fn notify_connect(peer: &mut Peer, ctx: &mut HostCtx, event: &mut Option<Event>) {
    ctx.recalculate_bandwidth_limits = true;

    if event.is_none() {
        peer.change_state(ctx, PeerState::Connected);
        *event = Some(Event::Connect {
            peer: peer.incoming_peer_id,
            data: peer.event_data,
        });
    } else {
        let next = if peer.state == PeerState::Connecting {
            PeerState::ConnectionSucceeded
        } else {
            PeerState::ConnectionPending
        };
        peer.dispatch_state(ctx, next);
    }
}

/// Tear a session down: surface the DISCONNECT event directly when
/// allowed, otherwise park the peer as a zombie for dispatch.
fn notify_disconnect(peer: &mut Peer, ctx: &mut HostCtx, allow_event: bool) -> Option<Event> {
    if peer.state >= PeerState::ConnectionPending {
        ctx.recalculate_bandwidth_limits = true;
    }

    if peer.state != PeerState::Connecting && peer.state < PeerState::ConnectionSucceeded {
        peer.reset(ctx);
        None
    } else if allow_event {
        let event = Event::Disconnect {
            peer: peer.incoming_peer_id,
            data: 0,
        };
        peer.reset(ctx);
        Some(event)
    } else {
        peer.event_data = 0;
        peer.dispatch_state(ctx, PeerState::Zombie);
        None
    }
}

/// Emit one ACKNOWLEDGE command per queued acknowledgement, as many as
/// the datagram has room for.
fn send_acknowledgements(peer: &mut Peer, ctx: &mut HostCtx, dg: &mut OutgoingDatagram) {
    while !peer.acknowledgements.is_empty() {
        let size = command_size(CommandKind::Acknowledge);
        if dg.command_count >= MAXIMUM_PACKET_COMMANDS
            || (peer.mtu as usize) < dg.packet_size + size
        {
            peer.continue_sending = true;
            break;
        }

        let acknowledgement = peer.acknowledgements.pop_front().expect("non-empty");

        let mut command = Command::new(
            CommandKind::Acknowledge as u8,
            acknowledgement.command.channel_id,
            CommandBody::Acknowledge {
                received_reliable_sequence_number: acknowledgement
                    .command
                    .reliable_sequence_number,
                received_sent_time: acknowledgement.sent_time,
            },
        );
        command.header.reliable_sequence_number =
            acknowledgement.command.reliable_sequence_number;
        command.encode(&mut dg.commands);
        dg.command_count += 1;
        dg.packet_size += size;

        // The final ack of a DISCONNECT ends the session on this side.
        if acknowledgement.command.kind() == Some(CommandKind::Disconnect) {
            peer.dispatch_state(ctx, PeerState::Zombie);
        }
    }
}

/// Retransmit overdue reliable commands with exponential backoff, giving
/// up on the peer once the configured bounds are exceeded.
fn check_timeouts(peer: &mut Peer, ctx: &mut HostCtx, produce_events: bool) -> TimeoutOutcome {
    let mut insert_plain = 0usize;
    let mut insert_with_payload = 0usize;
    let mut i = 0usize;

    while i < peer.sent_reliable_commands.len() {
        {
            let command = &peer.sent_reliable_commands[i];
            if time_difference(ctx.service_time, command.sent_time) < command.round_trip_timeout {
                i += 1;
                continue;
            }
            if peer.earliest_timeout == 0 || time_less(command.sent_time, peer.earliest_timeout) {
                peer.earliest_timeout = command.sent_time;
            }
        }

        let command = &peer.sent_reliable_commands[i];
        let elapsed = time_difference(ctx.service_time, peer.earliest_timeout);
        let backoff_exhausted = command.send_attempts > 0
            && 1u32
                .checked_shl(u32::from(command.send_attempts) - 1)
                .map_or(true, |doublings| doublings >= peer.timeout_limit);

        if peer.earliest_timeout != 0
            && (elapsed >= peer.timeout_maximum
                || (backoff_exhausted && elapsed >= peer.timeout_minimum))
        {
            debug!(
                peer = peer.incoming_peer_id,
                elapsed, "reliable delivery timed out"
            );
            return TimeoutOutcome::Disconnected(notify_disconnect(peer, ctx, produce_events));
        }

        let mut command = peer.sent_reliable_commands.remove(i).expect("index in range");
        peer.packets_lost += 1;
        command.round_trip_timeout = command.round_trip_timeout.saturating_mul(2);

        trace!(
            peer = peer.incoming_peer_id,
            sequence = command.reliable_sequence_number,
            timeout = command.round_trip_timeout,
            "retransmitting"
        );

        if command.packet.is_some() {
            peer.reliable_data_in_transit -= command.fragment_length as u32;
            peer.outgoing_send_reliable_commands
                .insert(insert_with_payload, command);
            insert_with_payload += 1;
        } else {
            peer.outgoing_commands.insert(insert_plain, command);
            insert_plain += 1;
        }

        if i == 0 {
            if let Some(front) = peer.sent_reliable_commands.front() {
                peer.next_timeout = front.sent_time.wrapping_add(front.round_trip_timeout);
            }
        }
    }

    TimeoutOutcome::Alive
}

/// Move queued commands into the datagram, interleaving the two outgoing
/// queues in submission order, subject to the reliable window, the
/// in-transit data window, and the unreliable packet throttle.
///
/// Returns whether a keepalive ping would be meaningful (no reliable
/// command was placed in flight).
fn check_outgoing_commands(peer: &mut Peer, ctx: &mut HostCtx, dg: &mut OutgoingDatagram) -> bool {
    let mut can_ping = true;
    let mut window_wrap = false;
    let mut window_exceeded = false;
    let mut plain = 0usize;
    let mut with_payload = 0usize;

    while plain < peer.outgoing_commands.len()
        || with_payload < peer.outgoing_send_reliable_commands.len()
    {
        let use_send_reliable = if plain >= peer.outgoing_commands.len() {
            true
        } else if with_payload >= peer.outgoing_send_reliable_commands.len() {
            false
        } else {
            time_less(
                peer.outgoing_send_reliable_commands[with_payload].queue_time,
                peer.outgoing_commands[plain].queue_time,
            )
        };

        let (is_reliable, has_packet, fragment_length, sequence, attempts, size, channel_index) = {
            let command = if use_send_reliable {
                &peer.outgoing_send_reliable_commands[with_payload]
            } else {
                &peer.outgoing_commands[plain]
            };
            (
                command.command.header.wants_acknowledge(),
                command.packet.is_some(),
                command.fragment_length,
                command.reliable_sequence_number,
                command.send_attempts,
                command.command.size(),
                command.command.header.channel_id as usize,
            )
        };

        if is_reliable {
            if channel_index < peer.channels.len() {
                let channel = &peer.channels[channel_index];
                let reliable_window = sequence / RELIABLE_WINDOW_SIZE;

                // Entering a fresh window is held back while the window
                // it would collide with is still occupied, so the sender
                // cannot lap the receiver's free-window span.
                if !window_wrap && attempts < 1 && sequence % RELIABLE_WINDOW_SIZE == 0 {
                    let previous =
                        ((reliable_window + RELIABLE_WINDOWS - 1) % RELIABLE_WINDOWS) as usize;
                    let guard = 1u16 << ((reliable_window + 1) % RELIABLE_WINDOWS);
                    if peer.channels[channel_index].reliable_windows[previous]
                        >= RELIABLE_WINDOW_SIZE
                        || channel.used_reliable_windows & guard != 0
                    {
                        window_wrap = true;
                    }
                }
                if window_wrap {
                    if use_send_reliable {
                        with_payload += 1;
                    } else {
                        plain += 1;
                    }
                    continue;
                }
            }

            if has_packet {
                if !window_exceeded {
                    let window_size =
                        (peer.packet_throttle * peer.window_size) / PACKET_THROTTLE_SCALE;
                    if peer.reliable_data_in_transit + fragment_length as u32
                        > window_size.max(peer.mtu)
                    {
                        window_exceeded = true;
                    }
                }
                if window_exceeded {
                    if use_send_reliable {
                        with_payload += 1;
                    } else {
                        plain += 1;
                    }
                    continue;
                }
            }

            can_ping = false;
        }

        if dg.command_count >= MAXIMUM_PACKET_COMMANDS
            || (peer.mtu as usize) < dg.packet_size + size
            || (has_packet
                && (peer.mtu as usize) < dg.packet_size + size + fragment_length as usize)
        {
            peer.continue_sending = true;
            break;
        }

        let mut command = if use_send_reliable {
            peer.outgoing_send_reliable_commands
                .remove(with_payload)
                .expect("cursor in range")
        } else {
            peer.outgoing_commands.remove(plain).expect("cursor in range")
        };

        if is_reliable {
            if channel_index < peer.channels.len() && command.send_attempts < 1 {
                let channel = &mut peer.channels[channel_index];
                let reliable_window =
                    (command.reliable_sequence_number / RELIABLE_WINDOW_SIZE) as usize;
                channel.used_reliable_windows |= 1 << reliable_window;
                channel.reliable_windows[reliable_window] += 1;
            }

            command.send_attempts += 1;
            if command.round_trip_timeout == 0 {
                command.round_trip_timeout = (peer.round_trip_time
                    + 4 * peer.round_trip_time_variance)
                    .max(peer.timeout_minimum);
            }
            if peer.sent_reliable_commands.is_empty() {
                peer.next_timeout = ctx.service_time.wrapping_add(command.round_trip_timeout);
            }
            command.sent_time = ctx.service_time;
            dg.include_sent_time = true;

            if command.packet.is_some() {
                peer.reliable_data_in_transit += command.fragment_length as u32;
            }

            append_command(dg, &command);
            peer.sent_reliable_commands.push_back(command);
        } else {
            if command.packet.is_some() && command.fragment_offset == 0 {
                // Sender-side throttle: shed unreliable traffic in
                // proportion to measured congestion.
                if ctx.random.next() % PACKET_THROTTLE_SCALE > peer.packet_throttle {
                    if peer.packet_throttle_counter == 0 {
                        peer.packets_lost += 1;
                    }
                    peer.packet_throttle_counter += 1;

                    let dropped_reliable = command.reliable_sequence_number;
                    let dropped_unreliable = command.unreliable_sequence_number;
                    drop(command);

                    // The rest of the packet's fragments are useless
                    // without this one.
                    while plain < peer.outgoing_commands.len() {
                        let next = &peer.outgoing_commands[plain];
                        if next.reliable_sequence_number != dropped_reliable
                            || next.unreliable_sequence_number != dropped_unreliable
                        {
                            break;
                        }
                        peer.outgoing_commands.remove(plain);
                    }
                    continue;
                }
            }

            if command.packet.is_some() {
                dg.sent_unreliable = true;
            }
            append_command(dg, &command);
        }

        dg.command_count += 1;
        dg.packet_size += size
            + if has_packet {
                fragment_length as usize
            } else {
                0
            };
    }

    can_ping
}

fn append_command(dg: &mut OutgoingDatagram, command: &OutgoingCommand) {
    command.command.encode(&mut dg.commands);
    if let Some(packet) = &command.packet {
        let start = command.fragment_offset as usize;
        dg.commands
            .extend_from_slice(&packet.data()[start..start + command.fragment_length as usize]);
    }
}
