//! Protocol lifecycle base.
//!
//! A concrete protocol owns the accept/process/post-process lifecycle for its
//! connections. The shared state — acceptance gate, disposal latch, message
//! and error counters — lives in [`ProtocolCore`]; behavior hooks live on the
//! [`PacketProtocol`] trait, whose provided methods implement the lifecycle
//! once so concrete protocols only fill in validation and per-packet
//! processing.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use tokio_util::sync::CancellationToken;

use crate::{buffer::BufferLease, connection::ConnectionHandle, error::DispatchError};

/// Point-in-time view of protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolSnapshot {
    /// `true` while new connections are being accepted.
    pub is_listening: bool,
    /// Errors recorded since startup.
    pub total_errors: u64,
    /// Messages fully processed since startup.
    pub total_messages: u64,
    /// Policy rejections since startup.
    pub total_rejections: u64,
}

/// Shared lifecycle state every protocol carries.
///
/// All fields are atomics with acquire/release ordering; disposal is a
/// one-shot CAS so cleanup runs exactly once no matter how many owners call
/// it.
#[derive(Debug)]
pub struct ProtocolCore {
    disposed: AtomicBool,
    accepting: AtomicBool,
    keep_connection_open: AtomicBool,
    total_errors: AtomicU64,
    total_messages: AtomicU64,
    total_rejections: AtomicU64,
}

impl ProtocolCore {
    /// Create core state; `keep_connection_open` decides whether connections
    /// survive past one processed message.
    #[must_use]
    pub fn new(keep_connection_open: bool) -> Self {
        Self {
            disposed: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            keep_connection_open: AtomicBool::new(keep_connection_open),
            total_errors: AtomicU64::new(0),
            total_messages: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// `true` while new connections are admitted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Toggle connection acceptance (maintenance mode).
    pub fn set_connection_acceptance(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Release);
    }

    /// `true` if connections stay open after a processed message.
    #[must_use]
    pub fn keep_connection_open(&self) -> bool {
        self.keep_connection_open.load(Ordering::Acquire)
    }

    /// Change the keep-open policy.
    pub fn set_keep_connection_open(&self, keep_open: bool) {
        self.keep_connection_open.store(keep_open, Ordering::Release);
    }

    /// `true` once disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Latch disposal. Returns `true` exactly once, for the caller that must
    /// perform cleanup; later calls are no-ops.
    pub fn dispose(&self) -> bool {
        self.disposed.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Record one error.
    pub fn record_error(&self) {
        self.total_errors.fetch_add(1, Ordering::AcqRel);
    }

    /// Record one fully processed message.
    pub fn record_message(&self) {
        self.total_messages.fetch_add(1, Ordering::AcqRel);
    }

    /// Record one policy rejection.
    pub fn record_rejection(&self) {
        self.total_rejections.fetch_add(1, Ordering::AcqRel);
    }

    /// Counter/flag snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ProtocolSnapshot {
        ProtocolSnapshot {
            is_listening: self.is_accepting() && !self.is_disposed(),
            total_errors: self.total_errors.load(Ordering::Acquire),
            total_messages: self.total_messages.load(Ordering::Acquire),
            total_rejections: self.total_rejections.load(Ordering::Acquire),
        }
    }
}

/// One framed message pulled from a connection's incoming queue.
pub struct MessageArgs {
    /// The connection the bytes arrived on.
    pub connection: Arc<dyn ConnectionHandle>,
    /// The framed packet body (header + payload, length prefix stripped).
    pub lease: BufferLease,
}

impl std::fmt::Debug for MessageArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageArgs")
            .field("endpoint", &self.connection.endpoint())
            .field("len", &self.lease.len())
            .finish_non_exhaustive()
    }
}

/// Behavior hooks plus the provided lifecycle.
///
/// Concrete protocols implement `core` (state storage), `process_message`
/// (usually delegating into a dispatcher), and optionally override
/// `validate_connection` / `on_post_process` / `on_connection_error`.
#[async_trait::async_trait]
pub trait PacketProtocol: Send + Sync + 'static {
    /// Shared lifecycle state.
    fn core(&self) -> &ProtocolCore;

    /// Admission check beyond the limiter; default accepts everything.
    fn validate_connection(&self, connection: &dyn ConnectionHandle) -> bool {
        let _ = connection;
        true
    }

    /// Per-packet processing.
    async fn process_message(&self, args: MessageArgs) -> Result<(), DispatchError>;

    /// Hook after each processed message; default does nothing.
    fn on_post_process(&self, connection: &dyn ConnectionHandle) {
        let _ = connection;
    }

    /// Hook for accept-path errors; default logs at error level.
    fn on_connection_error(&self, connection: &dyn ConnectionHandle, error: &DispatchError) {
        tracing::error!(endpoint = %connection.endpoint(), %error, "connection error");
    }

    /// Accept lifecycle: gate, validate, start receiving.
    ///
    /// Rejected or failed connections are disconnected here; errors are
    /// routed to [`PacketProtocol::on_connection_error`] and counted.
    async fn on_accept(&self, connection: Arc<dyn ConnectionHandle>, token: &CancellationToken) {
        if !self.core().is_accepting() || self.core().is_disposed() {
            connection.disconnect("not accepting connections").await;
            return;
        }
        if token.is_cancelled() {
            connection.disconnect("accept cancelled").await;
            return;
        }

        if !self.validate_connection(connection.as_ref()) {
            tracing::debug!(endpoint = %connection.endpoint(), "connection failed validation");
            connection.disconnect("validation failed").await;
            return;
        }

        connection.start_receiving();
        tracing::debug!(endpoint = %connection.endpoint(), "connection accepted");
    }

    /// Post-process lifecycle: count, hook, optionally disconnect.
    async fn post_process_message(&self, connection: &Arc<dyn ConnectionHandle>) {
        self.core().record_message();
        self.on_post_process(connection.as_ref());

        if !self.core().keep_connection_open() {
            connection.disconnect("request complete").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::atomic::AtomicU32};

    use bytes::Bytes;

    use super::*;
    use crate::{
        buffer::{BufferPool, BufferPoolConfig},
        connection::AuthorityLevel,
    };

    #[derive(Default)]
    struct RecordingConnection {
        disconnects: AtomicU32,
        receives: AtomicU32,
    }

    #[async_trait::async_trait]
    impl ConnectionHandle for RecordingConnection {
        fn endpoint(&self) -> SocketAddr {
            "10.0.0.1:4000".parse().unwrap()
        }

        fn authority(&self) -> AuthorityLevel {
            AuthorityLevel::Anonymous
        }

        fn session_key(&self) -> Option<Bytes> {
            None
        }

        fn is_open(&self) -> bool {
            true
        }

        fn cancel_token(&self) -> CancellationToken {
            CancellationToken::new()
        }

        fn start_receiving(&self) {
            self.receives.fetch_add(1, Ordering::SeqCst);
        }

        async fn send_bytes(&self, _body: Bytes, _token: &CancellationToken) -> std::io::Result<()> {
            Ok(())
        }

        async fn disconnect(&self, _reason: &str) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct TestProtocol {
        core: ProtocolCore,
        accept_valid: bool,
    }

    #[async_trait::async_trait]
    impl PacketProtocol for TestProtocol {
        fn core(&self) -> &ProtocolCore {
            &self.core
        }

        fn validate_connection(&self, _connection: &dyn ConnectionHandle) -> bool {
            self.accept_valid
        }

        async fn process_message(&self, _args: MessageArgs) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    fn lease() -> BufferLease {
        let pool = BufferPool::new(BufferPoolConfig::default()).unwrap();
        BufferLease::copy_from(&pool, b"body").unwrap()
    }

    #[tokio::test]
    async fn accept_starts_receive_loop() {
        let protocol = TestProtocol { core: ProtocolCore::new(true), accept_valid: true };
        let conn = Arc::new(RecordingConnection::default());

        protocol.on_accept(conn.clone(), &CancellationToken::new()).await;

        assert_eq!(conn.receives.load(Ordering::SeqCst), 1);
        assert_eq!(conn.disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn accept_rejects_when_not_accepting() {
        let protocol = TestProtocol { core: ProtocolCore::new(true), accept_valid: true };
        protocol.core().set_connection_acceptance(false);
        let conn = Arc::new(RecordingConnection::default());

        protocol.on_accept(conn.clone(), &CancellationToken::new()).await;

        assert_eq!(conn.receives.load(Ordering::SeqCst), 0);
        assert_eq!(conn.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn accept_rejects_cancelled_token() {
        let protocol = TestProtocol { core: ProtocolCore::new(true), accept_valid: true };
        let conn = Arc::new(RecordingConnection::default());
        let token = CancellationToken::new();
        token.cancel();

        protocol.on_accept(conn.clone(), &token).await;

        assert_eq!(conn.receives.load(Ordering::SeqCst), 0);
        assert_eq!(conn.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn accept_disconnects_invalid_connection() {
        let protocol = TestProtocol { core: ProtocolCore::new(true), accept_valid: false };
        let conn = Arc::new(RecordingConnection::default());

        protocol.on_accept(conn.clone(), &CancellationToken::new()).await;

        assert_eq!(conn.receives.load(Ordering::SeqCst), 0);
        assert_eq!(conn.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn post_process_counts_and_closes_one_shot_connections() {
        let protocol = TestProtocol { core: ProtocolCore::new(false), accept_valid: true };
        let conn: Arc<dyn ConnectionHandle> = Arc::new(RecordingConnection::default());

        protocol.post_process_message(&conn).await;

        assert_eq!(protocol.core().snapshot().total_messages, 1);
    }

    #[tokio::test]
    async fn post_process_keeps_connection_when_configured() {
        let protocol = TestProtocol { core: ProtocolCore::new(true), accept_valid: true };
        let recording = Arc::new(RecordingConnection::default());
        let conn: Arc<dyn ConnectionHandle> = recording.clone();

        protocol.post_process_message(&conn).await;

        assert_eq!(recording.disconnects.load(Ordering::SeqCst), 0);
        assert_eq!(protocol.core().snapshot().total_messages, 1);
    }

    #[test]
    fn dispose_latches_exactly_once() {
        let core = ProtocolCore::new(true);
        assert!(!core.is_disposed());
        assert!(core.dispose());
        assert!(!core.dispose());
        assert!(core.is_disposed());
    }

    #[test]
    fn snapshot_reflects_counters() {
        let core = ProtocolCore::new(true);
        core.record_error();
        core.record_message();
        core.record_message();
        core.record_rejection();

        let snap = core.snapshot();
        assert!(snap.is_listening);
        assert_eq!(snap.total_errors, 1);
        assert_eq!(snap.total_messages, 2);
        assert_eq!(snap.total_rejections, 1);

        core.set_connection_acceptance(false);
        assert!(!core.snapshot().is_listening);
    }

    #[tokio::test]
    async fn message_args_debug_includes_len() {
        let conn: Arc<dyn ConnectionHandle> = Arc::new(RecordingConnection::default());
        let args = MessageArgs { connection: conn, lease: lease() };
        let rendered = format!("{args:?}");
        assert!(rendered.contains("len: 4"));
    }
}
