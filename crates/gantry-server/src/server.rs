//! Server wiring.
//!
//! Ties the transport, the protocol, the dispatcher, and both limiters
//! together: the accept loop admits sockets through the connection limiter,
//! hands them to the protocol, and runs one pump task per connection that
//! drains the channel's incoming queue into the dispatcher. The protocol
//! owns connections in an endpoint-keyed table; connections never point back
//! at the protocol.

use std::{net::SocketAddr, sync::Arc};

use dashmap::DashMap;
use gantry_core::{
    BufferPool, BufferPoolConfig, ConnectionHandle, ConnectionLimiter, DispatchError, Dispatcher,
    HandlerCatalog, MessageArgs, PacketProtocol, ProtocolCore, ProtocolSnapshot, RecurringScheduler,
    RequestLimiterSet,
};
use gantry_proto::PacketCatalog;
use tokio_util::sync::CancellationToken;

use crate::{
    channel::ConnectionChannel, config::ServerOptions, connection::ServerConnection,
    error::ServerError, transport::TcpTransport,
};

/// The production protocol: every framed packet goes through the dispatcher.
pub struct GantryProtocol {
    core: ProtocolCore,
    dispatcher: Arc<Dispatcher>,
}

#[async_trait::async_trait]
impl PacketProtocol for GantryProtocol {
    fn core(&self) -> &ProtocolCore {
        &self.core
    }

    async fn process_message(&self, args: MessageArgs) -> Result<(), DispatchError> {
        self.dispatcher.dispatch(self, args).await
    }
}

/// A bound, ready-to-run packet server.
pub struct Server {
    transport: TcpTransport,
    protocol: Arc<GantryProtocol>,
    pool: Arc<BufferPool>,
    connection_limiter: Arc<ConnectionLimiter>,
    rate_limits: Arc<RequestLimiterSet>,
    scheduler: RecurringScheduler,
    connections: Arc<DashMap<SocketAddr, Arc<ServerConnection>>>,
    options: ServerOptions,
    shutdown: CancellationToken,
}

impl Server {
    /// Validate configuration, bind the listener, and assemble the pipeline.
    ///
    /// Catalog construction failures (duplicate magic, duplicate opcode)
    /// happen before this call; nothing starts accepting traffic until both
    /// catalogs are frozen.
    pub async fn bind(
        options: ServerOptions,
        packets: Arc<PacketCatalog>,
        handlers: Arc<HandlerCatalog>,
    ) -> Result<Self, ServerError> {
        options.validate()?;

        let transport = TcpTransport::bind(&options.bind_address).await?;

        let pool = BufferPool::new(BufferPoolConfig {
            max_buffer_size: options.channel.max_buffer_size,
            ..Default::default()
        })?;

        let connection_limiter =
            Arc::new(ConnectionLimiter::new(options.connection_limits.clone())?);
        let rate_limits = Arc::new(RequestLimiterSet::new(options.request_limits.clone())?);

        let dispatcher = Arc::new(Dispatcher::new(
            packets,
            handlers,
            Arc::clone(&rate_limits),
            options.dispatcher.clone(),
        ));

        let protocol = Arc::new(GantryProtocol {
            core: ProtocolCore::new(options.keep_connection_open),
            dispatcher,
        });

        Ok(Self {
            transport,
            protocol,
            pool,
            connection_limiter,
            rate_limits,
            scheduler: RecurringScheduler::new(),
            connections: Arc::new(DashMap::new()),
            options,
            shutdown: CancellationToken::new(),
        })
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.transport.local_addr()
    }

    /// Token that stops [`Server::run`] when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Protocol counter snapshot.
    #[must_use]
    pub fn snapshot(&self) -> ProtocolSnapshot {
        self.protocol.core().snapshot()
    }

    /// Live connection count.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Connection limiter load report.
    #[must_use]
    pub fn limiter_report(&self, top_n: usize) -> String {
        self.connection_limiter.generate_report(top_n)
    }

    /// Stop admitting new connections without dropping existing ones.
    pub fn set_connection_acceptance(&self, accepting: bool) {
        self.protocol.core().set_connection_acceptance(accepting);
    }

    /// Accept loop; returns after the shutdown token fires.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.rate_limits.spawn_cleanup();

        let limiter = Arc::clone(&self.connection_limiter);
        self.scheduler
            .schedule_recurring(
                "connection-limiter-cleanup",
                self.connection_limiter.cleanup_interval(),
                move || {
                    let limiter = Arc::clone(&limiter);
                    async move {
                        limiter.cleanup_stale();
                    }
                },
            )
            .map_err(|e| ServerError::Internal(e.to_string()))?;

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = self.transport.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.admit(stream, peer).await,
                        Err(err) => {
                            // Transient accept failures keep the loop alive.
                            tracing::warn!(%err, "accept failed");
                        },
                    }
                }
            }
        }

        self.shutdown_gracefully().await;
        Ok(())
    }

    async fn admit(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        if !self.connection_limiter.is_connection_allowed(peer.ip()) {
            tracing::debug!(%peer, "connection rejected by limiter");
            drop(stream);
            return;
        }

        let channel = match ConnectionChannel::new(
            stream,
            &self.shutdown,
            Arc::clone(&self.pool),
            self.options.channel.clone(),
        ) {
            Ok(channel) => channel,
            Err(err) => {
                self.protocol.core().record_error();
                tracing::warn!(%peer, %err, "channel setup failed");
                self.connection_limiter.on_connection_closed(peer.ip());
                return;
            },
        };

        let connection = ServerConnection::new(channel);
        self.connections.insert(peer, Arc::clone(&connection));

        let as_handle: Arc<dyn ConnectionHandle> = Arc::clone(&connection) as _;
        self.protocol.on_accept(Arc::clone(&as_handle), &self.shutdown).await;

        let protocol = Arc::clone(&self.protocol);
        let channel = Arc::clone(connection.channel());
        let limiter = Arc::clone(&self.connection_limiter);
        let connections = Arc::clone(&self.connections);

        tokio::spawn(async move {
            // One pump per connection: packets dispatch in arrival order
            // within the connection, in parallel across connections.
            while let Some(lease) = channel.recv_incoming().await {
                let args = MessageArgs { connection: Arc::clone(&as_handle), lease };
                if let Err(error) = protocol.process_message(args).await {
                    if error.disconnects() {
                        as_handle.disconnect("unrecoverable dispatch error").await;
                    }
                }
            }

            connections.remove(&peer);
            limiter.on_connection_closed(peer.ip());
            tracing::debug!(%peer, "connection closed");
        });
    }

    async fn shutdown_gracefully(&self) {
        tracing::info!("server shutting down");

        let open: Vec<Arc<ServerConnection>> =
            self.connections.iter().map(|e| Arc::clone(e.value())).collect();
        for connection in open {
            connection.disconnect("server shutting down").await;
        }

        self.scheduler.shutdown();
        self.rate_limits.dispose().await;
        self.protocol.core().dispose();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("bind_address", &self.options.bind_address)
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}
