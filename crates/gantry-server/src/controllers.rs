//! Built-in system controller and default catalogs.
//!
//! The binary ships one controller: `Echo` returns the request packet
//! unchanged and `Ping` answers with a short payload. Embedding applications
//! register their own controllers next to (or instead of) this one.

use std::sync::Arc;

use bytes::Bytes;
use gantry_core::{
    ConfigError, HandlerCatalog, HandlerCatalogBuilder, HandlerRegistry, PacketController,
    PacketMetadata, RateLimitLevel,
};
use gantry_proto::{CatalogBuilder, CatalogError, Packet, PacketCatalog, PacketSpec};

/// Magic number of the built-in system packet type.
pub const SYSTEM_MAGIC: u32 = 0x0000_0001;

/// Echo opcode: reply with the request packet.
pub const ECHO_OPCODE: u16 = 0x0100;

/// Ping opcode: reply with a `pong` payload.
pub const PING_OPCODE: u16 = 0x0101;

/// The built-in controller.
pub struct SystemController;

impl PacketController for SystemController {
    fn name(&self) -> &'static str {
        "System"
    }

    fn register(self: Arc<Self>, registry: &mut HandlerRegistry) -> Result<(), ConfigError> {
        registry.handle(ECHO_OPCODE, PacketMetadata::new(), |ctx| async move {
            Ok(Some(ctx.packet))
        })?;

        registry.handle(
            PING_OPCODE,
            PacketMetadata::new().with_rate_limit(RateLimitLevel::Standard),
            |_ctx| async {
                Ok(Some(Packet::new(SYSTEM_MAGIC, PING_OPCODE, Bytes::from_static(b"pong"))))
            },
        )?;

        Ok(())
    }
}

/// Packet catalog containing the built-in system packet type.
pub fn default_packet_catalog() -> Result<PacketCatalog, CatalogError> {
    let mut builder = CatalogBuilder::new();
    builder.register(PacketSpec::opaque(SYSTEM_MAGIC, "System"))?;
    Ok(builder.build())
}

/// Handler catalog containing the built-in system controller.
pub fn default_handler_catalog() -> Result<HandlerCatalog, ConfigError> {
    let mut builder = HandlerCatalogBuilder::new();
    builder.register_controller(Arc::new(SystemController))?;
    Ok(builder.build())
}
