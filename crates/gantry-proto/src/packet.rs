//! Packet value combining header and payload.
//!
//! A `Packet` is the in-memory unit the dispatcher and handlers operate on:
//! the five header fields plus an owned payload. Packets are immutable after
//! construction; every change (flag updates, transformed payloads) produces a
//! new packet via the `with_*` methods. Framing (the `u16` length prefix) is
//! the connection channel's concern and never appears here.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    PacketFlags, PacketHeader, Priority, Transport,
    errors::{ProtocolError, Result},
};

/// Maximum serialized body size (header + payload).
///
/// The wire frame length is a `u16` that counts its own two bytes, so the
/// body may never exceed this.
pub const MAX_BODY_SIZE: usize = u16::MAX as usize - 2;

/// An immutable packet: 9-byte header fields plus payload bytes.
///
/// # Invariants
///
/// - `serialize()` always emits exactly [`PacketHeader::SIZE`] header bytes
///   followed by the payload, little-endian multi-byte fields.
/// - Construction does not bound the payload; the size limit is enforced at
///   [`Packet::serialize`] (and again by the channel's frame cap), so tests
///   can build oversized packets to exercise rejection paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    magic: u32,
    opcode: u16,
    flags: PacketFlags,
    priority: Priority,
    transport: Transport,
    payload: Bytes,
}

impl Packet {
    /// Create a packet with default flags, priority, and transport.
    #[must_use]
    pub fn new(magic: u32, opcode: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            magic,
            opcode,
            flags: PacketFlags::NONE,
            priority: Priority::NORMAL,
            transport: Transport::NULL,
            payload: payload.into(),
        }
    }

    /// Magic number identifying the packet type.
    #[must_use]
    pub fn magic(&self) -> u32 {
        self.magic
    }

    /// Operation code identifying the handler.
    #[must_use]
    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    /// Flags bitset.
    #[must_use]
    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    /// Priority rank.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Transport hint.
    #[must_use]
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Payload bytes (cheaply cloneable).
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Serialized body length: header plus payload.
    #[must_use]
    pub fn body_len(&self) -> usize {
        PacketHeader::SIZE + self.payload.len()
    }

    /// A new packet with the given flags.
    #[must_use]
    pub fn with_flags(&self, flags: PacketFlags) -> Self {
        Self { flags, payload: self.payload.clone(), ..*self }
    }

    /// A new packet with the given priority.
    #[must_use]
    pub fn with_priority(&self, priority: Priority) -> Self {
        Self { priority, payload: self.payload.clone(), ..*self }
    }

    /// A new packet with the given transport hint.
    #[must_use]
    pub fn with_transport(&self, transport: Transport) -> Self {
        Self { transport, payload: self.payload.clone(), ..*self }
    }

    /// A new packet carrying `payload`, all header fields kept.
    ///
    /// This is the primitive transformers build on: compress/encrypt replace
    /// the payload and flip the matching flag via [`Packet::with_flags`].
    #[must_use]
    pub fn with_payload(&self, payload: impl Into<Bytes>) -> Self {
        Self { payload: payload.into(), ..*self }
    }

    /// Serialize into wire body form: 9-byte header followed by payload.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::PacketTooLarge`] if the body exceeds
    ///   [`MAX_BODY_SIZE`].
    pub fn serialize(&self) -> Result<Bytes> {
        let body_len = self.body_len();
        if body_len > MAX_BODY_SIZE {
            return Err(ProtocolError::PacketTooLarge { size: body_len, max: MAX_BODY_SIZE });
        }

        let mut header = PacketHeader::new(self.magic, self.opcode);
        header.set_flags(self.flags);
        header.set_priority(self.priority);
        header.set_transport(self.transport);

        let mut out = BytesMut::with_capacity(body_len);
        out.put_slice(&header.to_bytes());
        out.put_slice(&self.payload);
        Ok(out.freeze())
    }

    /// Deserialize a wire body: parse the header, copy the rest as payload.
    ///
    /// This is the generic deserializer; packet types with richer payload
    /// validation register their own function in the catalog and typically
    /// call this first.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::HeaderTooShort`] if `bytes` cannot hold a header.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let header = PacketHeader::from_bytes(bytes)?;

        let (magic, opcode, flags, priority, transport) = (
            header.magic(),
            header.opcode(),
            header.flags(),
            header.priority(),
            header.transport(),
        );

        // INVARIANT: from_bytes succeeded, so bytes.len() >= SIZE and this
        // slice cannot be out of bounds.
        let payload = Bytes::copy_from_slice(&bytes[PacketHeader::SIZE..]);

        Ok(Self { magic, opcode, flags, priority, transport, payload })
    }
}
