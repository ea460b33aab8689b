//! Host configuration.

use crate::error::{Error, Result};
use crate::protocol::constants::*;

/// Builder-style configuration for [`Host::create`](crate::Host::create).
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Number of peer slots to allocate. Fixed for the host's lifetime.
    pub peer_count: usize,
    /// Most channels an incoming connection may negotiate; 0 means the
    /// protocol maximum.
    pub channel_limit: usize,
    /// Downstream bandwidth in bytes/second; 0 means unlimited.
    pub incoming_bandwidth: u32,
    /// Upstream bandwidth in bytes/second; 0 means unlimited.
    pub outgoing_bandwidth: u32,
    /// Starting MTU offered to peers.
    pub mtu: u32,
    /// Largest packet the host will accept for sending or reassembly.
    pub maximum_packet_size: usize,
    /// Cap on buffered incoming data per peer; insertions beyond it are
    /// dropped unacknowledged so the sender retransmits later.
    pub maximum_waiting_data: usize,
    /// Most simultaneous connections accepted from one address.
    pub duplicate_peers: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            peer_count: 32,
            channel_limit: 0,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            mtu: DEFAULT_MTU,
            maximum_packet_size: DEFAULT_MAXIMUM_PACKET_SIZE,
            maximum_waiting_data: DEFAULT_MAXIMUM_WAITING_DATA,
            duplicate_peers: MAXIMUM_PEER_ID as usize,
        }
    }
}

impl HostConfig {
    pub fn new(peer_count: usize) -> Self {
        Self {
            peer_count,
            ..Self::default()
        }
    }

    /// Set the channel limit for incoming connections.
    pub fn channel_limit(mut self, limit: usize) -> Self {
        self.channel_limit = limit;
        self
    }

    /// Set the advertised bandwidth limits in bytes/second (0 = unlimited).
    pub fn bandwidth(mut self, incoming: u32, outgoing: u32) -> Self {
        self.incoming_bandwidth = incoming;
        self.outgoing_bandwidth = outgoing;
        self
    }

    /// Set the starting MTU offered during the handshake.
    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the largest accepted packet size.
    pub fn maximum_packet_size(mut self, size: usize) -> Self {
        self.maximum_packet_size = size;
        self
    }

    /// Set the per-peer cap on buffered incoming data.
    pub fn maximum_waiting_data(mut self, size: usize) -> Self {
        self.maximum_waiting_data = size;
        self
    }

    /// Set the per-address connection cap.
    pub fn duplicate_peers(mut self, count: usize) -> Self {
        self.duplicate_peers = count;
        self
    }

    /// Clamp the channel limit into the protocol's valid range.
    pub(crate) fn effective_channel_limit(&self) -> usize {
        if self.channel_limit == 0 || self.channel_limit > MAXIMUM_CHANNEL_COUNT {
            MAXIMUM_CHANNEL_COUNT
        } else {
            self.channel_limit.max(MINIMUM_CHANNEL_COUNT)
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.peer_count == 0 || self.peer_count > MAXIMUM_PEER_ID as usize {
            return Err(Error::invalid_argument(format!(
                "peer count must be in 1..={}",
                MAXIMUM_PEER_ID
            )));
        }

        if self.mtu < MINIMUM_MTU || self.mtu > MAXIMUM_MTU {
            return Err(Error::invalid_argument(format!(
                "mtu must be in {MINIMUM_MTU}..={MAXIMUM_MTU}"
            )));
        }

        if self.duplicate_peers == 0 {
            return Err(Error::invalid_argument(
                "duplicate peer limit must be at least 1",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(HostConfig::default().validate().is_ok());
    }

    #[test]
    fn test_peer_count_bounds() {
        assert!(HostConfig::new(0).validate().is_err());
        assert!(HostConfig::new(0x1000).validate().is_err());
        assert!(HostConfig::new(0xFFF).validate().is_ok());
    }

    #[test]
    fn test_channel_limit_clamping() {
        assert_eq!(
            HostConfig::new(1).effective_channel_limit(),
            MAXIMUM_CHANNEL_COUNT
        );
        assert_eq!(
            HostConfig::new(1).channel_limit(500).effective_channel_limit(),
            MAXIMUM_CHANNEL_COUNT
        );
        assert_eq!(HostConfig::new(1).channel_limit(8).effective_channel_limit(), 8);
    }
}
