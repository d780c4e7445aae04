//! Gantry production packet server.
//!
//! Production runtime over [`gantry_core`]'s pipeline: plain-TCP framed
//! channels, an accept loop gated by the connection limiter, and one
//! dispatch pump per connection. The core stays transport-agnostic; this
//! crate supplies the sockets.
//!
//! # Components
//!
//! - [`ConnectionChannel`]: length-prefixed framing over one TCP socket
//! - [`ServerConnection`]: the [`gantry_core::ConnectionHandle`] capability
//!   over a channel
//! - [`TcpTransport`]: listener bind/accept
//! - [`Server`]: accept loop, connection table, limiter wiring
//! - [`controllers`]: the built-in system controller and default catalogs

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod channel;
mod config;
mod connection;
pub mod controllers;
mod error;
mod server;
mod transport;

pub use channel::{ChannelError, ConnectionChannel, DisconnectedFn, PacketCachedFn};
pub use config::{ChannelOptions, ServerOptions};
pub use connection::ServerConnection;
pub use error::ServerError;
pub use server::{GantryProtocol, Server};
pub use transport::TcpTransport;
