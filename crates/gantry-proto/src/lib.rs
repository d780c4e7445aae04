//! Wire-level packet model and packet catalog for the Gantry framework.
//!
//! This crate defines the binary packet format shared by every Gantry
//! transport and the frozen catalog used to turn raw bytes back into typed
//! packets:
//!
//! - [`PacketHeader`]: the fixed 9-byte little-endian wire header
//! - [`Packet`]: an immutable header + payload value
//! - [`PacketFlags`], [`Priority`], [`Transport`]: header field wrappers that
//!   preserve unknown wire values verbatim
//! - [`PacketCatalog`]: magic-number → deserializer and magic-number →
//!   transformer lookup, built once at startup
//!
//! The crate is I/O-free: framing (length prefixes, sockets, buffering) lives
//! in the server crate; cryptography and compression are opaque transformer
//! functions supplied by the embedder.

pub mod catalog;
pub mod errors;
mod flags;
mod header;
mod packet;

pub use catalog::{CatalogBuilder, CatalogError, CipherAlgorithm, PacketCatalog, PacketSpec, TransformerSet};
pub use errors::{ProtocolError, Result};
pub use flags::{PacketFlags, Priority, Transport};
pub use header::PacketHeader;
pub use packet::{MAX_BODY_SIZE, Packet};
