//! The host: one datagram socket multiplexing many peer sessions.
//!
//! All protocol state lives behind `&mut Host`; every operation happens on
//! the thread driving [`Host::service`]. The split between [`Host`] and
//! [`HostCtx`] exists so peer methods can mutate host-wide counters while
//! the host holds a mutable borrow of the peer itself.

use std::collections::VecDeque;
use std::net::SocketAddr;

use tracing::{debug, info};

use crate::common::{time_difference, Millis, Mulberry32};
use crate::config::HostConfig;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::packet::Packet;
use crate::peer::{Peer, PeerId, PeerState};
use crate::protocol::constants::*;
use crate::protocol::{Command, CommandBody, CommandKind, ConnectParams};
use crate::transport::{HostSocket, Socket};

/// Host-wide mutable state shared with peer-level protocol code.
#[derive(Debug)]
pub(crate) struct HostCtx {
    pub service_time: Millis,
    pub total_queued: u32,
    pub random: Mulberry32,
    pub mtu: u32,
    pub channel_limit: usize,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub maximum_packet_size: usize,
    pub maximum_waiting_data: usize,
    pub duplicate_peers: usize,
    pub checksum_enabled: bool,
    pub connected_peers: usize,
    pub bandwidth_limited_peers: usize,
    pub recalculate_bandwidth_limits: bool,
    pub bandwidth_throttle_epoch: Millis,
    /// Peers with events awaiting conversion; a peer appears here exactly
    /// when its `needs_dispatch` flag is set.
    pub dispatch_queue: VecDeque<PeerId>,
}

impl HostCtx {
    fn new(config: &HostConfig, seed: u32) -> Self {
        Self {
            service_time: 0,
            total_queued: 0,
            random: Mulberry32::new(seed),
            mtu: config.mtu,
            channel_limit: config.effective_channel_limit(),
            incoming_bandwidth: config.incoming_bandwidth,
            outgoing_bandwidth: config.outgoing_bandwidth,
            maximum_packet_size: config.maximum_packet_size,
            maximum_waiting_data: config.maximum_waiting_data,
            duplicate_peers: config.duplicate_peers,
            checksum_enabled: false,
            connected_peers: 0,
            bandwidth_limited_peers: 0,
            recalculate_bandwidth_limits: false,
            bandwidth_throttle_epoch: 0,
            dispatch_queue: VecDeque::new(),
        }
    }

    /// Host-wide FIFO stamp for outgoing commands.
    pub fn next_queue_time(&mut self) -> u32 {
        self.total_queued = self.total_queued.wrapping_add(1);
        self.total_queued
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::new(&HostConfig::default(), 0x5EED_5EED)
    }
}

/// Optional per-datagram compression hook.
///
/// `compress` may return `None` (or a length not smaller than the input)
/// to send the datagram uncompressed.
pub trait Compressor {
    fn compress(&mut self, input: &[u8], output: &mut [u8]) -> Option<usize>;
    fn decompress(&mut self, input: &[u8], output: &mut [u8]) -> Option<usize>;
}

/// Verdict of the raw-datagram intercept hook.
pub enum Intercept {
    /// Hand the datagram to the protocol as usual.
    Pass,
    /// Swallow the datagram, optionally surfacing a synthesized event.
    Consume(Option<Event>),
    /// Abort the service call with a protocol error.
    Error,
}

/// Per-datagram checksum callback. The buffer it sees has the peer's
/// connect nonce spliced into the checksum field as a seed.
pub type ChecksumFn = Box<dyn FnMut(&[u8]) -> u32>;

/// Raw-datagram filter invoked before protocol dispatch.
pub type InterceptFn = Box<dyn FnMut(SocketAddr, &[u8]) -> Intercept>;

/// A ready-made CRC-32 checksum for [`Host::checksum`].
pub fn crc32_checksum() -> ChecksumFn {
    const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    Box::new(|data| CRC32.checksum(data))
}

/// An endpoint multiplexing up to `peer_count` sessions over one socket.
pub struct Host {
    pub(crate) socket: Box<dyn Socket>,
    pub(crate) peers: Vec<Peer>,
    pub(crate) ctx: HostCtx,

    pub(crate) compressor: Option<Box<dyn Compressor>>,
    pub(crate) checksum: Option<ChecksumFn>,
    pub(crate) intercept: Option<InterceptFn>,

    /// Scratch for raw received datagrams.
    pub(crate) received_data: Box<[u8; MAXIMUM_MTU as usize]>,
    /// Scratch for decompressed and compressed command areas.
    pub(crate) scratch: Box<[u8; MAXIMUM_MTU as usize]>,

    pub(crate) total_sent_data: u64,
    pub(crate) total_sent_packets: u64,
    pub(crate) total_received_data: u64,
    pub(crate) total_received_packets: u64,
}

impl Host {
    /// Create a host bound to `address`, or to an ephemeral port when
    /// `None` (a client that accepts no incoming connections).
    pub fn create(config: HostConfig, address: Option<SocketAddr>) -> Result<Self> {
        let socket = HostSocket::bind(address)?;
        Self::with_socket(config, Box::new(socket))
    }

    /// Create a host over a caller-supplied transport. This is how tests
    /// run the full protocol over in-memory socket pairs.
    pub fn with_socket(config: HostConfig, socket: Box<dyn Socket>) -> Result<Self> {
        config.validate()?;

        let seed: u32 = rand::random();
        let ctx = HostCtx::new(&config, seed);
        let peers = (0..config.peer_count)
            .map(|index| Peer::new(index as PeerId, config.mtu))
            .collect();

        info!(
            peer_count = config.peer_count,
            channel_limit = ctx.channel_limit,
            mtu = config.mtu,
            "host created"
        );

        Ok(Self {
            socket,
            peers,
            ctx,
            compressor: None,
            checksum: None,
            intercept: None,
            received_data: Box::new([0; MAXIMUM_MTU as usize]),
            scratch: Box::new([0; MAXIMUM_MTU as usize]),
            total_sent_data: 0,
            total_sent_packets: 0,
            total_received_data: 0,
            total_received_packets: 0,
        })
    }

    // --- accessors --------------------------------------------------------

    /// Address the underlying socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peer(&self, peer: PeerId) -> Option<&Peer> {
        self.peers.get(peer as usize)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn connected_peers(&self) -> usize {
        self.ctx.connected_peers
    }

    pub fn channel_limit(&self) -> usize {
        self.ctx.channel_limit
    }

    pub fn total_sent_data(&self) -> u64 {
        self.total_sent_data
    }

    pub fn total_sent_packets(&self) -> u64 {
        self.total_sent_packets
    }

    pub fn total_received_data(&self) -> u64 {
        self.total_received_data
    }

    pub fn total_received_packets(&self) -> u64 {
        self.total_received_packets
    }

    // --- configuration ----------------------------------------------------

    /// Install or remove the per-datagram compressor.
    pub fn compress(&mut self, compressor: Option<Box<dyn Compressor>>) {
        self.compressor = compressor;
    }

    /// Install or remove the per-datagram checksum. Both endpoints must
    /// agree on its presence and algorithm.
    pub fn checksum(&mut self, checksum: Option<ChecksumFn>) {
        self.ctx.checksum_enabled = checksum.is_some();
        self.checksum = checksum;
    }

    /// Install or remove the raw-datagram intercept callback.
    pub fn intercept(&mut self, intercept: Option<InterceptFn>) {
        self.intercept = intercept;
    }

    /// Limit the number of channels future incoming connections may open.
    pub fn set_channel_limit(&mut self, limit: usize) {
        self.ctx.channel_limit = if limit == 0 || limit > MAXIMUM_CHANNEL_COUNT {
            MAXIMUM_CHANNEL_COUNT
        } else {
            limit.max(MINIMUM_CHANNEL_COUNT)
        };
    }

    /// Adjust the advertised bandwidth limits; peers are informed at the
    /// next bandwidth-throttle tick.
    pub fn bandwidth_limit(&mut self, incoming: u32, outgoing: u32) {
        self.ctx.incoming_bandwidth = incoming;
        self.ctx.outgoing_bandwidth = outgoing;
        self.ctx.recalculate_bandwidth_limits = true;
    }

    // --- connection management --------------------------------------------

    /// Begin connecting to a remote host. The returned peer completes (or
    /// fails) the handshake during subsequent `service` calls.
    pub fn connect(
        &mut self,
        address: SocketAddr,
        channel_count: usize,
        data: u32,
    ) -> Result<PeerId> {
        let channel_count = channel_count.clamp(MINIMUM_CHANNEL_COUNT, MAXIMUM_CHANNEL_COUNT);

        let index = self
            .peers
            .iter()
            .position(|peer| peer.state == PeerState::Disconnected)
            .ok_or_else(|| Error::invalid_argument("no peer slot available"))?;

        let ctx = &mut self.ctx;
        let peer = &mut self.peers[index];

        peer.allocate_channels(channel_count);
        peer.state = PeerState::Connecting;
        peer.address = Some(address);
        peer.connect_id = ctx.random.next();
        peer.mtu = ctx.mtu;

        peer.window_size = if ctx.outgoing_bandwidth == 0 {
            MAXIMUM_WINDOW_SIZE
        } else {
            ((ctx.outgoing_bandwidth / WINDOW_SIZE_SCALE) * MINIMUM_WINDOW_SIZE)
                .clamp(MINIMUM_WINDOW_SIZE, MAXIMUM_WINDOW_SIZE)
        };

        info!(peer = index, remote = %address, channels = channel_count, "connecting");

        let command = Command::new(
            CommandKind::Connect as u8 | COMMAND_FLAG_ACKNOWLEDGE,
            0xFF,
            CommandBody::Connect {
                params: ConnectParams {
                    outgoing_peer_id: peer.incoming_peer_id,
                    incoming_session_id: peer.incoming_session_id,
                    outgoing_session_id: peer.outgoing_session_id,
                    mtu: peer.mtu,
                    window_size: peer.window_size,
                    channel_count: channel_count as u32,
                    incoming_bandwidth: ctx.incoming_bandwidth,
                    outgoing_bandwidth: ctx.outgoing_bandwidth,
                    packet_throttle_interval: peer.packet_throttle_interval,
                    packet_throttle_acceleration: peer.packet_throttle_acceleration,
                    packet_throttle_deceleration: peer.packet_throttle_deceleration,
                    connect_id: peer.connect_id,
                },
                data,
            },
        );
        peer.queue_outgoing_command(ctx, command, None, 0, 0);

        Ok(index as PeerId)
    }

    /// Queue a packet to every connected peer.
    pub fn broadcast(&mut self, channel_id: u8, packet: Packet) {
        for index in 0..self.peers.len() {
            if self.peers[index].state != PeerState::Connected {
                continue;
            }
            // Clones share the payload buffer; failures on individual
            // peers (bad channel, oversized) do not stop the broadcast.
            let _ = self.peers[index].send(&mut self.ctx, channel_id, packet.clone());
        }
    }

    // --- per-peer operations ----------------------------------------------

    fn peer_checked(&mut self, peer: PeerId) -> Result<usize> {
        let index = peer as usize;
        if index >= self.peers.len() {
            return Err(Error::invalid_argument(format!("no such peer {peer}")));
        }
        Ok(index)
    }

    /// Queue a packet for delivery on a peer's channel.
    pub fn send(&mut self, peer: PeerId, channel_id: u8, packet: Packet) -> Result<()> {
        let index = self.peer_checked(peer)?;
        self.peers[index].send(&mut self.ctx, channel_id, packet)
    }

    /// Dequeue the next received packet on a peer, if any.
    pub fn receive(&mut self, peer: PeerId) -> Option<(u8, Packet)> {
        self.peers.get_mut(peer as usize)?.receive()
    }

    /// Send a ping immediately; pings also flow automatically at the
    /// peer's ping interval.
    pub fn ping(&mut self, peer: PeerId) -> Result<()> {
        let index = self.peer_checked(peer)?;
        self.peers[index].ping(&mut self.ctx);
        Ok(())
    }

    /// Adjust a peer's keepalive ping interval (0 restores the default).
    pub fn ping_interval(&mut self, peer: PeerId, interval: u32) -> Result<()> {
        let index = self.peer_checked(peer)?;
        self.peers[index].set_ping_interval(interval);
        Ok(())
    }

    /// Adjust a peer's retransmission give-up parameters (0 restores each
    /// default).
    pub fn timeout(&mut self, peer: PeerId, limit: u32, minimum: u32, maximum: u32) -> Result<()> {
        let index = self.peer_checked(peer)?;
        self.peers[index].set_timeout(limit, minimum, maximum);
        Ok(())
    }

    /// Reconfigure a peer's unreliable-throttle parameters and announce
    /// them to the remote side.
    pub fn throttle_configure(
        &mut self,
        peer: PeerId,
        interval: u32,
        acceleration: u32,
        deceleration: u32,
    ) -> Result<()> {
        let index = self.peer_checked(peer)?;
        self.peers[index].throttle_configure(&mut self.ctx, interval, acceleration, deceleration);
        Ok(())
    }

    /// Request a graceful disconnect; a `Disconnect` event follows once
    /// the remote acknowledges (or the attempt times out).
    pub fn disconnect(&mut self, peer: PeerId, data: u32) -> Result<()> {
        let index = self.peer_checked(peer)?;
        match self.peers[index].state {
            PeerState::Disconnecting
            | PeerState::Disconnected
            | PeerState::AcknowledgingDisconnect
            | PeerState::Zombie => Ok(()),
            PeerState::Connected | PeerState::DisconnectLater => {
                self.peers[index].start_disconnect(&mut self.ctx, data);
                Ok(())
            }
            _ => {
                // Mid-handshake: tell the remote on a best-effort basis
                // and drop the session immediately.
                self.peers[index].reset_queues(&mut self.ctx);
                self.queue_unsequenced_disconnect(index, data);
                self.flush()?;
                self.peers[index].reset(&mut self.ctx);
                Ok(())
            }
        }
    }

    /// Disconnect once every queued outgoing packet has been delivered.
    pub fn disconnect_later(&mut self, peer: PeerId, data: u32) -> Result<()> {
        let index = self.peer_checked(peer)?;
        let state = self.peers[index].state;
        if state.is_session() && self.peers[index].has_outgoing_commands() {
            self.peers[index].state = PeerState::DisconnectLater;
            self.peers[index].event_data = data;
            Ok(())
        } else {
            self.disconnect(peer, data)
        }
    }

    /// Notify the remote once, then reset the peer without waiting. No
    /// `Disconnect` event is generated locally.
    pub fn disconnect_now(&mut self, peer: PeerId, data: u32) -> Result<()> {
        let index = self.peer_checked(peer)?;
        match self.peers[index].state {
            PeerState::Disconnected => Ok(()),
            PeerState::Zombie | PeerState::Disconnecting => {
                self.peers[index].reset(&mut self.ctx);
                Ok(())
            }
            _ => {
                self.peers[index].reset_queues(&mut self.ctx);
                self.queue_unsequenced_disconnect(index, data);
                self.flush()?;
                self.peers[index].reset(&mut self.ctx);
                Ok(())
            }
        }
    }

    /// Forcefully return a peer slot to `Disconnected`. The remote is not
    /// notified and will time out on its own.
    pub fn reset_peer(&mut self, peer: PeerId) -> Result<()> {
        let index = self.peer_checked(peer)?;
        self.peers[index].reset(&mut self.ctx);
        Ok(())
    }

    fn queue_unsequenced_disconnect(&mut self, index: usize, data: u32) {
        let command = Command::new(
            CommandKind::Disconnect as u8 | COMMAND_FLAG_UNSEQUENCED,
            0xFF,
            CommandBody::Disconnect { data },
        );
        self.peers[index].queue_outgoing_command(&mut self.ctx, command, None, 0, 0);
    }

    // --- bandwidth throttle -----------------------------------------------

    /// Redistribute the host's outgoing bandwidth across peers and refresh
    /// each peer's packet-throttle limit. Runs once per
    /// `BANDWIDTH_THROTTLE_INTERVAL`.
    pub(crate) fn bandwidth_throttle(&mut self) {
        let time_current = self.ctx.service_time;
        let elapsed = time_current.wrapping_sub(self.ctx.bandwidth_throttle_epoch);
        if elapsed < BANDWIDTH_THROTTLE_INTERVAL {
            return;
        }
        self.ctx.bandwidth_throttle_epoch = time_current;

        let mut peers_remaining = self.ctx.connected_peers as u32;
        if peers_remaining == 0 {
            return;
        }

        let mut data_total = u64::MAX;
        let mut bandwidth = u64::MAX;
        let mut needs_adjustment = self.ctx.bandwidth_limited_peers > 0;
        let mut throttle;

        if self.ctx.outgoing_bandwidth != 0 {
            data_total = 0;
            bandwidth = self.ctx.outgoing_bandwidth as u64 * elapsed as u64 / 1000;

            for peer in &self.peers {
                if peer.state.is_session() {
                    data_total += peer.outgoing_data_total as u64;
                }
            }
        }

        // Peers whose own receive bandwidth is the bottleneck get their
        // throttle limit pinned to it; the rest share what remains.
        while peers_remaining > 0 && needs_adjustment {
            needs_adjustment = false;

            throttle = if data_total <= bandwidth {
                PACKET_THROTTLE_SCALE as u64
            } else {
                bandwidth * PACKET_THROTTLE_SCALE as u64 / data_total
            };

            for peer in &mut self.peers {
                if !peer.state.is_session()
                    || peer.incoming_bandwidth == 0
                    || peer.outgoing_bandwidth_throttle_epoch == time_current
                {
                    continue;
                }

                let peer_bandwidth = peer.incoming_bandwidth as u64 * elapsed as u64 / 1000;
                if throttle * peer.outgoing_data_total as u64
                    <= peer_bandwidth * PACKET_THROTTLE_SCALE as u64
                {
                    continue;
                }

                peer.packet_throttle_limit = ((peer_bandwidth
                    * PACKET_THROTTLE_SCALE as u64)
                    / peer.outgoing_data_total.max(1) as u64)
                    .max(1) as u32;
                peer.packet_throttle = peer.packet_throttle.min(peer.packet_throttle_limit);

                peer.outgoing_bandwidth_throttle_epoch = time_current;
                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;

                needs_adjustment = true;
                peers_remaining -= 1;
                bandwidth = bandwidth.saturating_sub(peer_bandwidth);
                data_total = data_total.saturating_sub(peer_bandwidth);
            }
        }

        if peers_remaining > 0 {
            throttle = if data_total <= bandwidth {
                PACKET_THROTTLE_SCALE as u64
            } else {
                bandwidth * PACKET_THROTTLE_SCALE as u64 / data_total
            };

            for peer in &mut self.peers {
                if !peer.state.is_session()
                    || peer.outgoing_bandwidth_throttle_epoch == time_current
                {
                    continue;
                }

                peer.packet_throttle_limit = throttle as u32;
                peer.packet_throttle = peer.packet_throttle.min(peer.packet_throttle_limit);
                peer.incoming_data_total = 0;
                peer.outgoing_data_total = 0;
            }
        }

        if self.ctx.recalculate_bandwidth_limits {
            self.recalculate_bandwidth_limits(time_current);
        }
    }

    /// Re-advertise per-peer incoming bandwidth after connects,
    /// disconnects, or a local limit change.
    fn recalculate_bandwidth_limits(&mut self, time_current: Millis) {
        self.ctx.recalculate_bandwidth_limits = false;

        let mut peers_remaining = self.ctx.connected_peers as u32;
        let mut bandwidth = self.ctx.incoming_bandwidth;
        let mut bandwidth_limit = 0u32;
        let mut needs_adjustment = true;

        if bandwidth != 0 {
            while peers_remaining > 0 && needs_adjustment {
                needs_adjustment = false;
                bandwidth_limit = bandwidth / peers_remaining;

                for peer in &mut self.peers {
                    if !peer.state.is_session()
                        || peer.incoming_bandwidth_throttle_epoch == time_current
                    {
                        continue;
                    }
                    if peer.outgoing_bandwidth > 0 && peer.outgoing_bandwidth >= bandwidth_limit {
                        continue;
                    }

                    peer.incoming_bandwidth_throttle_epoch = time_current;
                    needs_adjustment = true;
                    peers_remaining -= 1;
                    bandwidth -= peer.outgoing_bandwidth;
                }
            }
        }

        let ctx = &mut self.ctx;
        for peer in &mut self.peers {
            if !peer.state.is_session() {
                continue;
            }

            let incoming = if peer.incoming_bandwidth_throttle_epoch == time_current {
                peer.outgoing_bandwidth
            } else {
                bandwidth_limit
            };

            debug!(peer = peer.incoming_peer_id, limit = incoming, "advertising bandwidth limit");

            let command = Command::new(
                CommandKind::BandwidthLimit as u8 | COMMAND_FLAG_ACKNOWLEDGE,
                0xFF,
                CommandBody::BandwidthLimit {
                    incoming_bandwidth: incoming,
                    outgoing_bandwidth: ctx.outgoing_bandwidth,
                },
            );
            peer.queue_outgoing_command(ctx, command, None, 0, 0);
        }
    }

    /// Whether the periodic bandwidth throttle is due.
    pub(crate) fn bandwidth_throttle_due(&self) -> bool {
        time_difference(self.ctx.service_time, self.ctx.bandwidth_throttle_epoch)
            >= BANDWIDTH_THROTTLE_INTERVAL
    }
}
