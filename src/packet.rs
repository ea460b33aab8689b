//! Application payloads.
//!
//! A [`Packet`] is a cheaply cloneable handle to an immutable byte buffer.
//! Queued fragments, retransmission entries, and the dispatched event all
//! share the same buffer; it is freed when the last handle drops.

use bitflags::bitflags;
use bytes::Bytes;

bitflags! {
    /// Delivery-mode flags attached to a packet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlags: u32 {
        /// Deliver exactly once, in order; retransmit until acknowledged.
        const RELIABLE = 1 << 0;
        /// Deliver at most once, in no particular order.
        const UNSEQUENCED = 1 << 1;
        /// If the packet exceeds the MTU, fragment it unreliably instead
        /// of falling back to reliable fragments.
        const UNRELIABLE_FRAGMENT = 1 << 3;
        /// Reserved marker for packets the host has finished sending.
        /// Payload buffers are freed by reference counting, so this is
        /// informational only.
        const SENT = 1 << 8;
    }
}

/// A reference-counted payload exchanged with the application.
#[derive(Debug, Clone)]
pub struct Packet {
    data: Bytes,
    flags: PacketFlags,
}

impl Packet {
    /// Wrap an owned buffer. Use [`PacketFlags::RELIABLE`] for guaranteed
    /// in-order delivery; empty flags give unreliable sequenced delivery.
    pub fn new(data: impl Into<Bytes>, flags: PacketFlags) -> Self {
        Self {
            data: data.into(),
            flags,
        }
    }

    /// Wrap a static buffer without copying.
    pub fn from_static(data: &'static [u8], flags: PacketFlags) -> Self {
        Self {
            data: Bytes::from_static(data),
            flags,
        }
    }

    /// Convenience constructor for a reliable packet.
    pub fn reliable(data: impl Into<Bytes>) -> Self {
        Self::new(data, PacketFlags::RELIABLE)
    }

    /// Convenience constructor for an unreliable sequenced packet.
    pub fn unreliable(data: impl Into<Bytes>) -> Self {
        Self::new(data, PacketFlags::empty())
    }

    /// Convenience constructor for an unsequenced packet.
    pub fn unsequenced(data: impl Into<Bytes>) -> Self {
        Self::new(data, PacketFlags::UNSEQUENCED)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    /// Share the underlying buffer without copying.
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_flags_and_data() {
        let packet = Packet::reliable(&b"hello"[..]);
        assert_eq!(packet.data(), b"hello");
        assert_eq!(packet.len(), 5);
        assert!(packet.flags().contains(PacketFlags::RELIABLE));
        assert!(!packet.flags().contains(PacketFlags::UNSEQUENCED));
    }

    #[test]
    fn test_clones_share_storage() {
        let packet = Packet::unreliable(vec![7u8; 64]);
        let clone = packet.clone();
        assert_eq!(packet.bytes().as_ptr(), clone.bytes().as_ptr());
    }
}
