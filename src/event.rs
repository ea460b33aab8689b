//! Events surfaced to the application by [`Host::service`](crate::Host::service).

use crate::packet::Packet;
use crate::peer::PeerId;

/// Something that happened on a peer since the last service call.
#[derive(Debug)]
pub enum Event {
    /// A connection attempt completed. `data` carries the 32-bit word the
    /// connecting side supplied to `connect`; it is 0 on the initiator.
    Connect { peer: PeerId, data: u32 },

    /// The peer disconnected, timed out, or was reset. `data` carries the
    /// value the remote passed to its disconnect call, when one was sent.
    Disconnect { peer: PeerId, data: u32 },

    /// A complete packet arrived on `channel_id`. Ownership of the packet
    /// transfers to the application.
    Receive {
        peer: PeerId,
        channel_id: u8,
        packet: Packet,
    },
}

impl Event {
    /// The peer this event concerns.
    pub fn peer(&self) -> PeerId {
        match self {
            Event::Connect { peer, .. }
            | Event::Disconnect { peer, .. }
            | Event::Receive { peer, .. } => *peer,
        }
    }
}
