//! Packet catalog: magic-number → deserializer and transformer lookup.
//!
//! The catalog is built once at startup from explicit [`PacketSpec`]
//! registrations and is immutable afterwards, so it can be shared across
//! every connection task behind an `Arc` with no locking. Registration
//! replaces runtime type discovery: each packet type states its magic
//! number, a deserializer, and (optionally) the transformer set used for
//! compression and encryption.

use std::{collections::HashMap, fmt, sync::Arc};

use thiserror::Error;

use crate::{
    Packet,
    errors::{ProtocolError, Result},
};

/// Deserializer: wire body bytes (header included) → packet.
pub type DeserializeFn = Arc<dyn Fn(&[u8]) -> Result<Packet> + Send + Sync>;

/// Payload transformer: packet → packet (compress / decompress).
pub type TransformFn = Arc<dyn Fn(&Packet) -> Result<Packet> + Send + Sync>;

/// Keyed transformer: packet + key material + algorithm → packet
/// (encrypt / decrypt).
pub type CipherFn = Arc<dyn Fn(&Packet, &[u8], CipherAlgorithm) -> Result<Packet> + Send + Sync>;

/// Opaque cipher selector passed through to the embedder's crypto.
///
/// The core never interprets these beyond equality; key and nonce handling
/// belongs to the registered transformer functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherAlgorithm {
    /// ChaCha20-Poly1305 AEAD.
    ChaCha20Poly1305,
    /// AES in counter mode with a separate MAC.
    AesCtr,
}

/// The four payload transformers for one packet type.
///
/// All four must be provided together; a type that supports none of them
/// registers without a set and any transform request fails with
/// [`ProtocolError::TransformNotSupported`] at dispatch.
#[derive(Clone)]
pub struct TransformerSet {
    /// Compress the payload, set the compressed flag.
    pub compress: TransformFn,
    /// Inverse of `compress`.
    pub decompress: TransformFn,
    /// Encrypt the payload under the given key and algorithm.
    pub encrypt: CipherFn,
    /// Inverse of `encrypt`; fails with
    /// [`ProtocolError::AuthenticationFailed`] when verification fails.
    pub decrypt: CipherFn,
}

impl fmt::Debug for TransformerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformerSet").finish_non_exhaustive()
    }
}

/// Registration record for one packet type.
#[derive(Clone)]
pub struct PacketSpec {
    /// Magic number, unique across the catalog.
    pub magic: u32,
    /// Human-readable type name for logs and reports.
    pub name: &'static str,
    /// Deserializer invoked by [`PacketCatalog::try_deserialize`].
    pub deserialize: DeserializeFn,
    /// Optional transformer set; `None` disables compress/encrypt support.
    pub transformers: Option<TransformerSet>,
}

impl PacketSpec {
    /// A spec using the generic [`Packet::deserialize`] and no transformers.
    #[must_use]
    pub fn opaque(magic: u32, name: &'static str) -> Self {
        Self { magic, name, deserialize: Arc::new(Packet::deserialize), transformers: None }
    }

    /// Attach a transformer set.
    #[must_use]
    pub fn with_transformers(mut self, transformers: TransformerSet) -> Self {
        self.transformers = Some(transformers);
        self
    }
}

impl fmt::Debug for PacketSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketSpec")
            .field("magic", &format_args!("{:#010x}", self.magic))
            .field("name", &self.name)
            .field("transformers", &self.transformers.is_some())
            .finish()
    }
}

/// Catalog construction failure.
///
/// These are configuration mistakes: the process must not start accepting
/// traffic when construction fails.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// Two packet types registered the same magic number.
    #[error("duplicate magic {magic:#010x}: '{duplicate}' collides with '{existing}'")]
    DuplicateMagic {
        /// The colliding magic number
        magic: u32,
        /// Name of the type registered first
        existing: &'static str,
        /// Name of the type that collided
        duplicate: &'static str,
    },
}

/// Builder collecting [`PacketSpec`] registrations.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    specs: HashMap<u32, PacketSpec>,
}

impl CatalogBuilder {
    /// Start an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one packet type.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::DuplicateMagic`] if the magic number is already
    ///   registered. The builder is left unchanged.
    pub fn register(&mut self, spec: PacketSpec) -> std::result::Result<&mut Self, CatalogError> {
        if let Some(existing) = self.specs.get(&spec.magic) {
            return Err(CatalogError::DuplicateMagic {
                magic: spec.magic,
                existing: existing.name,
                duplicate: spec.name,
            });
        }
        self.specs.insert(spec.magic, spec);
        Ok(self)
    }

    /// Freeze the registrations into an immutable catalog.
    #[must_use]
    pub fn build(self) -> PacketCatalog {
        PacketCatalog { specs: self.specs }
    }
}

/// Immutable magic-number → packet type lookup.
///
/// Safe for concurrent reads; construction happens once at startup via
/// [`CatalogBuilder`].
#[derive(Debug)]
pub struct PacketCatalog {
    specs: HashMap<u32, PacketSpec>,
}

impl PacketCatalog {
    /// Read the magic from `bytes` and run the registered deserializer.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::HeaderTooShort`] if `bytes` cannot hold a magic.
    /// - [`ProtocolError::UnknownMagic`] if no type registered this magic.
    /// - Whatever the registered deserializer returns.
    pub fn try_deserialize(&self, bytes: &[u8]) -> Result<Packet> {
        let magic_bytes: [u8; 4] =
            bytes.get(0..4).and_then(|b| b.try_into().ok()).ok_or(ProtocolError::HeaderTooShort {
                expected: 4,
                actual: bytes.len(),
            })?;
        let magic = u32::from_le_bytes(magic_bytes);

        let spec = self.specs.get(&magic).ok_or(ProtocolError::UnknownMagic { magic })?;
        (spec.deserialize)(bytes)
    }

    /// Transformer set for a magic number, if the type registered one.
    #[must_use]
    pub fn transformers(&self, magic: u32) -> Option<&TransformerSet> {
        self.specs.get(&magic).and_then(|spec| spec.transformers.as_ref())
    }

    /// Registered type name for a magic number.
    #[must_use]
    pub fn name_of(&self, magic: u32) -> Option<&'static str> {
        self.specs.get(&magic).map(|spec| spec.name)
    }

    /// `true` if the magic number is registered.
    #[must_use]
    pub fn contains(&self, magic: u32) -> bool {
        self.specs.contains_key(&magic)
    }

    /// Number of registered packet types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// `true` if no packet types are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::PacketFlags;

    fn identity_transformers() -> TransformerSet {
        TransformerSet {
            compress: Arc::new(|p| Ok(p.with_flags(p.flags().with(PacketFlags::COMPRESSED)))),
            decompress: Arc::new(|p| Ok(p.with_flags(p.flags().without(PacketFlags::COMPRESSED)))),
            encrypt: Arc::new(|p, _key, _algo| {
                Ok(p.with_flags(p.flags().with(PacketFlags::ENCRYPTED)))
            }),
            decrypt: Arc::new(|p, _key, _algo| {
                Ok(p.with_flags(p.flags().without(PacketFlags::ENCRYPTED)))
            }),
        }
    }

    #[test]
    fn deserializes_registered_magic() {
        let mut builder = CatalogBuilder::new();
        builder.register(PacketSpec::opaque(0x0000_0001, "Echo")).unwrap();
        let catalog = builder.build();

        let wire = Packet::new(0x0000_0001, 0x0100, Bytes::from_static(b"x"))
            .serialize()
            .unwrap();
        let packet = catalog.try_deserialize(&wire).unwrap();
        assert_eq!(packet.magic(), 0x0000_0001);
        assert_eq!(packet.opcode(), 0x0100);
    }

    #[test]
    fn unknown_magic_is_reported() {
        let catalog = CatalogBuilder::new().build();
        let wire = Packet::new(0xDEAD_BEEF, 1, Bytes::new()).serialize().unwrap();
        let result = catalog.try_deserialize(&wire);
        assert_eq!(result, Err(ProtocolError::UnknownMagic { magic: 0xDEAD_BEEF }));
    }

    #[test]
    fn duplicate_magic_fails_construction() {
        let mut builder = CatalogBuilder::new();
        builder.register(PacketSpec::opaque(0x0000_0001, "Echo")).unwrap();
        let err = builder.register(PacketSpec::opaque(0x0000_0001, "Chat")).unwrap_err();
        assert_eq!(
            err,
            CatalogError::DuplicateMagic {
                magic: 0x0000_0001,
                existing: "Echo",
                duplicate: "Chat"
            }
        );
    }

    #[test]
    fn transformer_lookup_distinguishes_absent_set() {
        let mut builder = CatalogBuilder::new();
        builder.register(PacketSpec::opaque(1, "Plain")).unwrap();
        builder
            .register(PacketSpec::opaque(2, "Rich").with_transformers(identity_transformers()))
            .unwrap();
        let catalog = builder.build();

        assert!(catalog.transformers(1).is_none());
        assert!(catalog.transformers(2).is_some());
        assert!(catalog.transformers(3).is_none());
    }

    #[test]
    fn short_buffer_cannot_be_deserialized() {
        let catalog = CatalogBuilder::new().build();
        let result = catalog.try_deserialize(&[0x01, 0x02]);
        assert!(matches!(result, Err(ProtocolError::HeaderTooShort { .. })));
    }
}
