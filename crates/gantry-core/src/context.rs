//! Per-invocation handler context.

use std::{net::SocketAddr, sync::Arc};

use gantry_proto::Packet;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionHandle;

/// Everything a handler receives for one packet.
///
/// The token is linked to the connection's token and, when the handler has a
/// timeout, to a cancel-after; long-running handlers observe it.
#[derive(Clone)]
pub struct PacketContext {
    /// The decoded (and decompressed/decrypted) packet.
    pub packet: Packet,
    /// The originating connection.
    pub connection: Arc<dyn ConnectionHandle>,
    /// Cooperative cancellation for this invocation.
    pub token: CancellationToken,
}

impl PacketContext {
    /// Remote endpoint shorthand.
    #[must_use]
    pub fn endpoint(&self) -> SocketAddr {
        self.connection.endpoint()
    }
}

impl std::fmt::Debug for PacketContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketContext")
            .field("packet", &self.packet)
            .field("endpoint", &self.connection.endpoint())
            .finish_non_exhaustive()
    }
}
