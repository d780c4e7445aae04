//! Handler catalog: opcode → compiled async invoker with policy metadata.
//!
//! Controllers register their handlers explicitly at startup — an async
//! closure per opcode, wrapped into the uniform [`HandlerFn`] shape — and the
//! result is frozen into a [`HandlerCatalog`] before the first packet is
//! dispatched. Duplicate opcodes, whether within one controller or across
//! controllers, abort startup.

use std::{collections::HashMap, fmt, future::Future, pin::Pin, sync::Arc, time::Duration};

use gantry_proto::Packet;

use crate::{
    connection::AuthorityLevel,
    context::PacketContext,
    error::{ConfigError, HandlerError},
};

/// Boxed future every invoker returns.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Option<Packet>, HandlerError>> + Send>>;

/// The uniform invoker shape: context in, optional reply packet out.
pub type HandlerFn = Arc<dyn Fn(PacketContext) -> HandlerFuture + Send + Sync>;

/// Encryption requirement a handler states for its packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionPolicy {
    /// Accept packets in either state.
    #[default]
    Any,
    /// The packet must have arrived encrypted.
    Required,
    /// The packet must have arrived clear.
    Forbidden,
}

/// Named rate-limit tier; each tier maps to its own sliding-window config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitLevel {
    /// Generous budget for chatty endpoints.
    Lenient,
    /// Default budget.
    Standard,
    /// Tight budget for expensive operations.
    Strict,
}

/// Per-(endpoint, opcode) concurrency cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyLimit {
    /// Maximum in-flight invocations per endpoint for this opcode.
    pub max_concurrent: u32,
    /// `true`: reject with `Busy` when no slot is free; `false`: wait for a
    /// slot or cancellation.
    pub try_acquire_immediately: bool,
}

/// Policy metadata attached to one handler.
#[derive(Debug, Clone, Default)]
pub struct PacketMetadata {
    /// Cancel the invocation after this long.
    pub timeout: Option<Duration>,
    /// Minimum authority level.
    pub permission: Option<AuthorityLevel>,
    /// Encryption requirement.
    pub encryption: EncryptionPolicy,
    /// Rate-limit tier, if this opcode is rate limited.
    pub rate_limit: Option<RateLimitLevel>,
    /// Concurrency cap, if this opcode is capped.
    pub concurrency: Option<ConcurrencyLimit>,
}

impl PacketMetadata {
    /// Metadata with no policy attached.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the invocation after `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Require at least `level` authority.
    #[must_use]
    pub fn require_permission(mut self, level: AuthorityLevel) -> Self {
        self.permission = Some(level);
        self
    }

    /// Set the encryption requirement.
    #[must_use]
    pub fn with_encryption(mut self, policy: EncryptionPolicy) -> Self {
        self.encryption = policy;
        self
    }

    /// Rate limit this opcode at `level`.
    #[must_use]
    pub fn with_rate_limit(mut self, level: RateLimitLevel) -> Self {
        self.rate_limit = Some(level);
        self
    }

    /// Cap concurrent invocations per endpoint.
    #[must_use]
    pub fn with_concurrency(mut self, limit: ConcurrencyLimit) -> Self {
        self.concurrency = Some(limit);
        self
    }
}

/// One compiled handler: invoker plus metadata plus provenance.
#[derive(Clone)]
pub struct HandlerDescriptor {
    /// Opcode this handler serves.
    pub opcode: u16,
    /// Name of the controller that registered it.
    pub controller: &'static str,
    /// Policy metadata.
    pub metadata: PacketMetadata,
    invoker: HandlerFn,
}

impl HandlerDescriptor {
    /// Run the compiled invoker.
    pub fn invoke(&self, context: PacketContext) -> HandlerFuture {
        (self.invoker)(context)
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("opcode", &format_args!("{:#06x}", self.opcode))
            .field("controller", &self.controller)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Registration surface a controller fills in.
///
/// Scoped to one controller; the builder merges registries and re-checks
/// opcode uniqueness across controllers.
#[derive(Debug)]
pub struct HandlerRegistry {
    controller: &'static str,
    handlers: HashMap<u16, HandlerDescriptor>,
}

impl HandlerRegistry {
    fn new(controller: &'static str) -> Self {
        Self { controller, handlers: HashMap::new() }
    }

    /// Register one handler.
    ///
    /// The closure is compiled into the uniform [`HandlerFn`] shape; a
    /// handler with no reply returns `Ok(None)`.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::DuplicateOpcode`] if this controller already
    ///   registered `opcode`.
    pub fn handle<F, Fut>(
        &mut self,
        opcode: u16,
        metadata: PacketMetadata,
        handler: F,
    ) -> Result<&mut Self, ConfigError>
    where
        F: Fn(PacketContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Packet>, HandlerError>> + Send + 'static,
    {
        if self.handlers.contains_key(&opcode) {
            return Err(ConfigError::DuplicateOpcode {
                opcode,
                existing: self.controller.to_string(),
                controller: self.controller.to_string(),
            });
        }

        let invoker: HandlerFn = Arc::new(move |ctx| Box::pin(handler(ctx)));
        self.handlers.insert(opcode, HandlerDescriptor {
            opcode,
            controller: self.controller,
            metadata,
            invoker,
        });
        Ok(self)
    }

    /// Number of handlers registered so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// `true` if nothing is registered yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// A controller: a named bundle of opcode handlers.
///
/// Implementing this trait is the controller marker; `register` is called
/// once at startup with a registry scoped to this controller.
pub trait PacketController: Send + Sync + 'static {
    /// Stable controller name used in logs and duplicate-opcode errors.
    fn name(&self) -> &'static str;

    /// Register this controller's handlers.
    fn register(self: Arc<Self>, registry: &mut HandlerRegistry) -> Result<(), ConfigError>;
}

/// Builder collecting controllers into a frozen catalog.
#[derive(Debug, Default)]
pub struct HandlerCatalogBuilder {
    handlers: HashMap<u16, HandlerDescriptor>,
}

impl HandlerCatalogBuilder {
    /// Start an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every handler of `controller`.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::DuplicateOpcode`] if the controller registers an
    ///   opcode twice, or an opcode another controller already claimed.
    pub fn register_controller<C>(&mut self, controller: Arc<C>) -> Result<&mut Self, ConfigError>
    where
        C: PacketController,
    {
        let mut registry = HandlerRegistry::new(controller.name());
        controller.register(&mut registry)?;

        for (opcode, descriptor) in registry.handlers {
            if let Some(existing) = self.handlers.get(&opcode) {
                return Err(ConfigError::DuplicateOpcode {
                    opcode,
                    existing: existing.controller.to_string(),
                    controller: descriptor.controller.to_string(),
                });
            }
            self.handlers.insert(opcode, descriptor);
        }
        Ok(self)
    }

    /// Freeze into an immutable catalog.
    #[must_use]
    pub fn build(self) -> HandlerCatalog {
        HandlerCatalog { handlers: self.handlers }
    }
}

/// Immutable opcode → handler lookup shared by the dispatcher.
#[derive(Debug)]
pub struct HandlerCatalog {
    handlers: HashMap<u16, HandlerDescriptor>,
}

impl HandlerCatalog {
    /// Handler for `opcode`, if registered.
    #[must_use]
    pub fn get(&self, opcode: u16) -> Option<&HandlerDescriptor> {
        self.handlers.get(&opcode)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// `true` if no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// All registered opcodes, unordered.
    pub fn opcodes(&self) -> impl Iterator<Item = u16> + '_ {
        self.handlers.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::atomic::{AtomicU32, Ordering},
    };

    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::connection::ConnectionHandle;

    struct NullConnection;

    #[async_trait::async_trait]
    impl ConnectionHandle for NullConnection {
        fn endpoint(&self) -> SocketAddr {
            "127.0.0.1:9".parse().unwrap()
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

        fn start_receiving(&self) {}

        async fn send_bytes(&self, _body: Bytes, _token: &CancellationToken) -> std::io::Result<()> {
            Ok(())
        }

        async fn disconnect(&self, _reason: &str) {}
    }

    struct CountingController {
        calls: AtomicU32,
    }

    impl PacketController for CountingController {
        fn name(&self) -> &'static str {
            "Counting"
        }

        fn register(self: Arc<Self>, registry: &mut HandlerRegistry) -> Result<(), ConfigError> {
            let me = Arc::clone(&self);
            registry.handle(0x0001, PacketMetadata::new(), move |ctx| {
                let me = Arc::clone(&me);
                async move {
                    me.calls.fetch_add(1, Ordering::Relaxed);
                    Ok(Some(ctx.packet))
                }
            })?;

            registry.handle(0x0002, PacketMetadata::new(), |_ctx| async { Ok(None) })?;
            Ok(())
        }
    }

    fn context(packet: Packet) -> PacketContext {
        PacketContext {
            packet,
            connection: Arc::new(NullConnection),
            token: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn registered_handler_is_invocable() {
        let controller = Arc::new(CountingController { calls: AtomicU32::new(0) });
        let mut builder = HandlerCatalogBuilder::new();
        builder.register_controller(Arc::clone(&controller)).unwrap();
        let catalog = builder.build();

        let descriptor = catalog.get(0x0001).unwrap();
        let packet = Packet::new(1, 0x0001, Bytes::from_static(b"ping"));
        let reply = descriptor.invoke(context(packet.clone())).await.unwrap();

        assert_eq!(reply, Some(packet));
        assert_eq!(controller.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn void_handler_returns_none() {
        let controller = Arc::new(CountingController { calls: AtomicU32::new(0) });
        let mut builder = HandlerCatalogBuilder::new();
        builder.register_controller(controller).unwrap();
        let catalog = builder.build();

        let descriptor = catalog.get(0x0002).unwrap();
        let reply = descriptor.invoke(context(Packet::new(1, 2, Bytes::new()))).await.unwrap();
        assert_eq!(reply, None);
    }

    #[test]
    fn duplicate_opcode_within_controller_fails() {
        let mut registry = HandlerRegistry::new("Dup");
        registry.handle(7, PacketMetadata::new(), |_ctx| async { Ok(None) }).unwrap();
        let err = registry.handle(7, PacketMetadata::new(), |_ctx| async { Ok(None) }).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateOpcode { opcode: 7, .. }));
    }

    #[test]
    fn duplicate_opcode_across_controllers_fails() {
        struct A;
        struct B;

        impl PacketController for A {
            fn name(&self) -> &'static str {
                "A"
            }

            fn register(self: Arc<Self>, r: &mut HandlerRegistry) -> Result<(), ConfigError> {
                r.handle(9, PacketMetadata::new(), |_ctx| async { Ok(None) })?;
                Ok(())
            }
        }

        impl PacketController for B {
            fn name(&self) -> &'static str {
                "B"
            }

            fn register(self: Arc<Self>, r: &mut HandlerRegistry) -> Result<(), ConfigError> {
                r.handle(9, PacketMetadata::new(), |_ctx| async { Ok(None) })?;
                Ok(())
            }
        }

        let mut builder = HandlerCatalogBuilder::new();
        builder.register_controller(Arc::new(A)).unwrap();
        let err = builder.register_controller(Arc::new(B)).unwrap_err();
        assert_eq!(err, ConfigError::DuplicateOpcode {
            opcode: 9,
            existing: "A".to_string(),
            controller: "B".to_string(),
        });
    }

    #[test]
    fn metadata_builder_composes() {
        let metadata = PacketMetadata::new()
            .with_timeout(Duration::from_secs(5))
            .require_permission(AuthorityLevel::Operator)
            .with_encryption(EncryptionPolicy::Required)
            .with_rate_limit(RateLimitLevel::Strict)
            .with_concurrency(ConcurrencyLimit { max_concurrent: 2, try_acquire_immediately: true });

        assert_eq!(metadata.timeout, Some(Duration::from_secs(5)));
        assert_eq!(metadata.permission, Some(AuthorityLevel::Operator));
        assert_eq!(metadata.encryption, EncryptionPolicy::Required);
        assert_eq!(metadata.rate_limit, Some(RateLimitLevel::Strict));
        assert!(metadata.concurrency.is_some());
    }
}
