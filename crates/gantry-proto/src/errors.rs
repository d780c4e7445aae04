//! Protocol error types.
//!
//! Errors are split by where they surface: parse/serialize failures come out
//! of [`crate::PacketHeader`] and [`crate::Packet`], lookup failures out of
//! [`crate::PacketCatalog`], and transformer failures out of the embedder's
//! compress/encrypt functions. Catalog *construction* failures are a separate
//! type ([`crate::CatalogError`]) because they are configuration mistakes that
//! must abort startup, not runtime conditions.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while parsing, serializing, or transforming packets.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer is too short to contain a packet header.
    ///
    /// Returned by header parsing when fewer than
    /// [`crate::PacketHeader::SIZE`] bytes are available. The caller decides
    /// whether this is a truncated frame (fatal for the connection) or an
    /// incomplete read (retry).
    #[error("packet header too short: expected {expected} bytes, got {actual}")]
    HeaderTooShort {
        /// Bytes required for a full header
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Packet body exceeds the maximum encodable size.
    ///
    /// The wire frame length is a `u16` that includes its own two bytes, so a
    /// packet body may never exceed `u16::MAX - 2`. Surfaced to the caller;
    /// never logged at error level.
    #[error("packet too large: {size} bytes exceeds maximum of {max}")]
    PacketTooLarge {
        /// Serialized body size
        size: usize,
        /// Hard limit for this channel
        max: usize,
    },

    /// No deserializer is registered for this magic number.
    ///
    /// Logged at warn by the dispatcher; the packet is discarded and the
    /// connection kept.
    #[error("unknown magic number: {magic:#010x}")]
    UnknownMagic {
        /// Magic number read from the wire
        magic: u32,
    },

    /// The packet type has no transformer for the requested operation.
    ///
    /// A type registered without a [`crate::TransformerSet`] can still be
    /// deserialized, but any compress/decompress/encrypt/decrypt request
    /// fails with this error at dispatch time.
    #[error("transform '{transform}' not supported for magic {magic:#010x}")]
    TransformNotSupported {
        /// Magic number of the packet type
        magic: u32,
        /// Operation that was requested
        transform: &'static str,
    },

    /// Cryptographic verification failed during decrypt.
    ///
    /// Logged at warn; the packet is discarded. Policy may additionally
    /// disconnect the sender.
    #[error("packet authentication failed for magic {magic:#010x}")]
    AuthenticationFailed {
        /// Magic number of the packet type
        magic: u32,
    },

    /// A registered deserializer or transformer rejected the bytes.
    #[error("malformed packet: {reason}")]
    MalformedPacket {
        /// What the deserializer objected to
        reason: String,
    },
}
