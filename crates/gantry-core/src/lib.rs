//! Runtime-independent packet pipeline for the Gantry framework.
//!
//! Everything between the socket and the handler body lives here, with no
//! dependency on a concrete transport:
//!
//! - [`buffer`]: bucketed byte-buffer pool and single-owner leases
//! - [`protocol`]: the accept/process/post-process lifecycle base
//! - [`handler`]: controller registration compiled into a frozen opcode
//!   catalog
//! - [`dispatcher`]: the decode → policy → invoke → reply pipeline
//! - [`limiter`]: per-endpoint connection caps and sliding-window rate
//!   limits
//! - [`scheduler`]: named recurring background tasks
//!
//! The server crate supplies the TCP channel that feeds this pipeline;
//! handlers and the dispatcher only ever see the
//! [`connection::ConnectionHandle`] capability trait.

pub mod buffer;
pub mod connection;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod limiter;
pub mod protocol;
pub mod scheduler;

pub use buffer::{BufferError, BufferLease, BufferPool, BufferPoolConfig, PoolMetrics, PooledBuf};
pub use connection::{AuthorityLevel, ConnectionHandle};
pub use context::PacketContext;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{ConfigError, DispatchError, HandlerError};
pub use handler::{
    ConcurrencyLimit, EncryptionPolicy, HandlerCatalog, HandlerCatalogBuilder, HandlerDescriptor,
    HandlerFn, HandlerFuture, HandlerRegistry, PacketController, PacketMetadata, RateLimitLevel,
};
pub use limiter::{
    ConnectionLimitConfig, ConnectionLimiter, ConnectionLimiterMetrics, RequestLimitConfig,
    RequestLimiter, RequestLimiterMetrics, RequestLimiterSet, RequestLimiterSetConfig,
};
pub use protocol::{MessageArgs, PacketProtocol, ProtocolCore, ProtocolSnapshot};
pub use scheduler::{RecurringScheduler, ScheduleError};
