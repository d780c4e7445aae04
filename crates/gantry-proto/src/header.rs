//! Packet header implementation with zero-copy parsing.
//!
//! The `PacketHeader` is a fixed 9-byte structure serialized as raw binary
//! (Little Endian). Field order on the wire is `magic, opcode, flags,
//! priority, transport`; parsing a header never copies the buffer.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    PacketFlags, Priority, Transport,
    errors::{ProtocolError, Result},
};

/// Fixed 9-byte packet header (Little Endian wire order).
///
/// Multi-byte integers are stored as raw byte arrays to avoid alignment
/// requirements, letting the struct be cast directly from an untrusted
/// network buffer. Every 9-byte pattern is a structurally valid header:
/// magic-number validity is a catalog lookup, not a parse check, and
/// unknown flag/priority/transport values are preserved verbatim.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PacketHeader {
    magic: [u8; 4],  // u32 packet type identifier
    opcode: [u8; 2], // u16 operation code
    flags: u8,       // PacketFlags bitfield
    priority: u8,    // Priority rank
    transport: u8,   // Transport hint
}

impl PacketHeader {
    /// Size of the serialized header (9 bytes).
    pub const SIZE: usize = 9;

    /// Create a header with the given identity and default field values.
    #[must_use]
    pub fn new(magic: u32, opcode: u16) -> Self {
        Self {
            magic: magic.to_le_bytes(),
            opcode: opcode.to_le_bytes(),
            flags: 0,
            priority: 0,
            transport: 0,
        }
    }

    /// Parse a header from the start of `bytes` (zero-copy).
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::HeaderTooShort`] if fewer than [`Self::SIZE`] bytes
    ///   are available.
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::HeaderTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            })?
            .0;
        Ok(header)
    }

    /// Serialize the header into its 9-byte wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.magic);
        out[4..6].copy_from_slice(&self.opcode);
        out[6] = self.flags;
        out[7] = self.priority;
        out[8] = self.transport;
        out
    }

    /// Magic number identifying the packet type.
    #[must_use]
    pub fn magic(&self) -> u32 {
        u32::from_le_bytes(self.magic)
    }

    /// Operation code identifying the handler.
    #[must_use]
    pub fn opcode(&self) -> u16 {
        u16::from_le_bytes(self.opcode)
    }

    /// Flags bitset.
    #[must_use]
    pub fn flags(&self) -> PacketFlags {
        PacketFlags::from_bits(self.flags)
    }

    /// Priority rank.
    #[must_use]
    pub fn priority(&self) -> Priority {
        Priority::from_raw(self.priority)
    }

    /// Transport hint.
    #[must_use]
    pub fn transport(&self) -> Transport {
        Transport::from_raw(self.transport)
    }

    /// Replace the flags byte.
    pub fn set_flags(&mut self, flags: PacketFlags) {
        self.flags = flags.bits();
    }

    /// Replace the priority byte.
    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority.as_raw();
    }

    /// Replace the transport byte.
    pub fn set_transport(&mut self, transport: Transport) {
        self.transport = transport.as_raw();
    }
}

impl std::fmt::Debug for PacketHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketHeader")
            .field("magic", &format_args!("{:#010x}", self.magic()))
            .field("opcode", &format_args!("{:#06x}", self.opcode()))
            .field("flags", &self.flags())
            .field("priority", &self.priority())
            .field("transport", &self.transport())
            .finish()
    }
}

impl PartialEq for PacketHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PacketHeader {}
