//! Packet header, type tags, and flags for the framed wire protocol.
//!
//! Every packet starts with a fixed 16-byte header, exactly one cipher
//! block, so the header can be encrypted standalone. All multi-byte fields
//! are little-endian.

use veil_crypto::BLOCK_SIZE;

/// Packet type tag. Values below [`packet_type::FIRST_USER_TYPE`] are
/// reserved for the protocol.
pub type PacketType = u16;

/// Per-sender packet identifier, assigned monotonically starting at 1.
pub type PacketId = u32;

/// Reserved packet types.
pub mod packet_type {
    use super::PacketType;

    /// Matches any type in queries; never sent on the wire.
    pub const UNDEFINED: PacketType = 0;
    /// Latency probe.
    pub const PING: PacketType = 1;
    /// Answer to [`PING`].
    pub const PING_REPLY: PacketType = 2;
    /// Reserved for re-keying; currently unused.
    pub const CHANGE_KEY: PacketType = 3;
    /// Liveness probe, answered automatically by every session.
    pub const KEEP_ALIVE_REQUEST: PacketType = 4;
    /// Automatic answer to [`KEEP_ALIVE_REQUEST`].
    pub const KEEP_ALIVE_REPLY: PacketType = 5;
    /// First tag available to applications.
    pub const FIRST_USER_TYPE: PacketType = 6;
}

/// Packet flags bitmap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// Receiver discards all queued packets of the same type before
    /// appending this one.
    pub const REMOVE_PREVIOUS: u8 = 0b0000_0001;

    /// Create empty flags.
    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    /// Reconstruct from a wire byte.
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Add REMOVE_PREVIOUS.
    #[must_use]
    pub fn with_remove_previous(mut self) -> Self {
        self.0 |= Self::REMOVE_PREVIOUS;
        self
    }

    /// Check if REMOVE_PREVIOUS is set.
    #[must_use]
    pub fn removes_previous(&self) -> bool {
        self.0 & Self::REMOVE_PREVIOUS != 0
    }

    /// Get raw byte value.
    #[must_use]
    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

/// Fixed 16-byte packet header.
///
/// `size` is the unpadded body length; the wire transfer carries the body
/// padded up to the cipher block size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet type tag.
    pub packet_type: PacketType,
    /// Flags bitmap.
    pub flags: PacketFlags,
    /// Reserved, zero on the wire.
    pub reserved: u8,
    /// Sender-assigned monotonic id.
    pub id: PacketId,
    /// Unpadded body length in bytes.
    pub size: u64,
}

impl PacketHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 16;

    /// Encode to the 16-byte little-endian wire layout.
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.packet_type.to_le_bytes());
        buf[2] = self.flags.as_u8();
        buf[3] = self.reserved;
        buf[4..8].copy_from_slice(&self.id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Decode from the 16-byte wire layout.
    #[must_use]
    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            packet_type: u16::from_le_bytes([buf[0], buf[1]]),
            flags: PacketFlags::from_bits(buf[2]),
            reserved: buf[3],
            id: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            size: u64::from_le_bytes(buf[8..16].try_into().expect("fixed slice")),
        }
    }
}

// The header travels as exactly one cipher block.
const _: () = assert!(PacketHeader::SIZE % BLOCK_SIZE == 0);

/// A typed packet: header plus optional payload. Header-only packets carry
/// `size == 0` and no buffer.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    /// Wire header.
    pub header: PacketHeader,
    /// Payload region, shared across pipeline stages.
    pub buffer: Option<crate::buffer::PacketBuffer>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = PacketHeader {
            packet_type: 100,
            flags: PacketFlags::new().with_remove_previous(),
            reserved: 0,
            id: 0xDEAD_BEEF,
            size: 0x0102_0304_0506_0708,
        };
        let buf = header.encode();
        assert_eq!(PacketHeader::decode(&buf), header);
    }

    #[test]
    fn header_layout_is_little_endian() {
        let header = PacketHeader {
            packet_type: 0x0201,
            flags: PacketFlags::from_bits(0x01),
            reserved: 0,
            id: 0x0605_0403,
            size: 0x0E0D_0C0B_0A09_0807,
        };
        assert_eq!(
            header.encode(),
            [0x01, 0x02, 0x01, 0x00, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C,
             0x0D, 0x0E]
        );
    }

    #[test]
    fn flags_bits() {
        assert!(!PacketFlags::new().removes_previous());
        assert!(PacketFlags::new().with_remove_previous().removes_previous());
        assert_eq!(PacketFlags::new().with_remove_previous().as_u8(), 1);
    }

    #[test]
    fn default_packet_is_empty() {
        let packet = Packet::default();
        assert_eq!(packet.header.packet_type, packet_type::UNDEFINED);
        assert_eq!(packet.header.id, 0);
        assert_eq!(packet.header.size, 0);
        assert!(packet.buffer.is_none());
    }
}
