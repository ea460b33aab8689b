//! # lanes: reliable, ordered, multi-channel datagram transport
//!
//! A connection-oriented transport layered over plain UDP datagrams. One
//! [`Host`] multiplexes many peer sessions over a single socket; each
//! session carries independent channels with four delivery modes:
//! reliable-ordered, unreliable-sequenced, unsequenced, and fragmented
//! variants of the first two.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use lanes::{Event, Host, HostConfig, Packet};
//!
//! fn main() -> lanes::Result<()> {
//!     // A server with 32 peer slots on a fixed port.
//!     let server_addr = "127.0.0.1:12345".parse().unwrap();
//!     let mut server = Host::create(HostConfig::new(32), Some(server_addr))?;
//!
//!     // A client connecting with 2 channels.
//!     let mut client = Host::create(HostConfig::new(1), None)?;
//!     let peer = client.connect(server_addr, 2, 0)?;
//!
//!     loop {
//!         if let Some(event) = client.service(10)? {
//!             match event {
//!                 Event::Connect { .. } => {
//!                     client.send(peer, 0, Packet::reliable(&b"hello"[..]))?;
//!                 }
//!                 Event::Receive { packet, .. } => {
//!                     println!("received {} bytes", packet.len());
//!                 }
//!                 Event::Disconnect { .. } => break,
//!             }
//!         }
//!         server.service(10)?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────┐
//! │  host / service loop      │  demux, coalesce, throttle, events
//! ├───────────────────────────┤
//! │  peer state machine       │  handshake, queues, RTT, reassembly
//! ├───────────────────────────┤
//! │  channels                 │  per-channel ordering and windows
//! ├───────────────────────────┤
//! │  protocol codec           │   12 commands, big-endian wire format
//! ├───────────────────────────┤
//! │  socket trait             │  non-blocking UDP + bounded wait
//! └───────────────────────────┘
//! ```
//!
//! The protocol state machine is pure and single-threaded: every
//! operation happens on the thread driving [`Host::service`], and the
//! bounded socket wait inside `service` is the only blocking point.
//! Custom transports (including in-memory ones for tests) plug in via
//! the [`Socket`] trait.

mod channel;
pub mod common;
pub mod config;
pub mod error;
pub mod event;
pub mod host;
pub mod packet;
pub mod peer;
pub mod protocol;
mod service;
pub mod transport;

pub use config::HostConfig;
pub use error::{Error, Result};
pub use event::Event;
pub use host::{crc32_checksum, ChecksumFn, Compressor, Host, Intercept, InterceptFn};
pub use packet::{Packet, PacketFlags};
pub use peer::{Peer, PeerId, PeerState};
pub use transport::{HostSocket, Socket};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
