//! Connection capability trait.
//!
//! Handlers and the dispatcher never see a socket type; they see this trait.
//! The production implementation wraps a TCP channel, test implementations
//! record calls. The trait is deliberately narrow: identity, authority, key
//! material, cancellation, and framed sends.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

/// Authority levels a connection can hold, ordered from least to most.
///
/// Handlers state a minimum level in their metadata; the dispatcher compares
/// with `<` on this ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum AuthorityLevel {
    /// Unauthenticated connection.
    #[default]
    Anonymous,
    /// Authenticated user.
    User,
    /// Elevated operator.
    Operator,
    /// Full administrative authority.
    Administrator,
}

/// Capabilities the pipeline requires from a connection.
///
/// Implementations must be cheap to share (`Arc`) and safe to call from any
/// task. Sends on one connection are serialized by the implementation.
#[async_trait::async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// Remote endpoint address.
    fn endpoint(&self) -> SocketAddr;

    /// Current authority level.
    fn authority(&self) -> AuthorityLevel;

    /// Per-session key material for packet encryption, if established.
    fn session_key(&self) -> Option<Bytes>;

    /// `true` until the connection has disconnected.
    fn is_open(&self) -> bool;

    /// Token cancelled when the connection goes away.
    fn cancel_token(&self) -> CancellationToken;

    /// Start the framed receive loop. Idempotent.
    fn start_receiving(&self);

    /// Frame and send `body` (length prefix added by the implementation).
    ///
    /// Whole-frame semantics: either every byte is written or an error is
    /// returned. Concurrent callers are serialized.
    async fn send_bytes(&self, body: Bytes, token: &CancellationToken) -> std::io::Result<()>;

    /// Disconnect, firing the disconnect event exactly once.
    async fn disconnect(&self, reason: &str);
}
