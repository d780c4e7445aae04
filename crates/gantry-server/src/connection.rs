//! Production [`ConnectionHandle`] over a [`ConnectionChannel`].
//!
//! Adds the session state the pipeline consults — authority level and key
//! material — on top of the channel's framed I/O. The protocol owns these in
//! its endpoint-keyed table; nothing here points back at the protocol.

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, Ordering},
    },
};

use bytes::Bytes;
use gantry_core::{AuthorityLevel, ConnectionHandle};
use tokio_util::sync::CancellationToken;

use crate::channel::ConnectionChannel;

/// A connected session: channel plus mutable session state.
pub struct ServerConnection {
    channel: Arc<ConnectionChannel>,
    authority: AtomicU8,
    session_key: Mutex<Option<Bytes>>,
}

impl ServerConnection {
    /// Wrap a channel with anonymous authority and no key material.
    #[must_use]
    pub fn new(channel: Arc<ConnectionChannel>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            authority: AtomicU8::new(authority_to_raw(AuthorityLevel::Anonymous)),
            session_key: Mutex::new(None),
        })
    }

    /// The underlying channel.
    #[must_use]
    pub fn channel(&self) -> &Arc<ConnectionChannel> {
        &self.channel
    }

    /// Grant a new authority level (e.g. after authentication).
    pub fn set_authority(&self, level: AuthorityLevel) {
        self.authority.store(authority_to_raw(level), Ordering::Release);
    }

    /// Install per-session key material for encrypted packets.
    pub fn set_session_key(&self, key: Bytes) {
        #[allow(clippy::unwrap_used)] // session mutex is never poisoned: no panics while held
        let mut slot = self.session_key.lock().unwrap();
        *slot = Some(key);
    }
}

fn authority_to_raw(level: AuthorityLevel) -> u8 {
    match level {
        AuthorityLevel::Anonymous => 0,
        AuthorityLevel::User => 1,
        AuthorityLevel::Operator => 2,
        AuthorityLevel::Administrator => 3,
    }
}

fn authority_from_raw(raw: u8) -> AuthorityLevel {
    match raw {
        1 => AuthorityLevel::User,
        2 => AuthorityLevel::Operator,
        3 => AuthorityLevel::Administrator,
        _ => AuthorityLevel::Anonymous,
    }
}

#[async_trait::async_trait]
impl ConnectionHandle for ServerConnection {
    fn endpoint(&self) -> SocketAddr {
        self.channel.peer()
    }

    fn authority(&self) -> AuthorityLevel {
        authority_from_raw(self.authority.load(Ordering::Acquire))
    }

    fn session_key(&self) -> Option<Bytes> {
        #[allow(clippy::unwrap_used)] // session mutex is never poisoned: no panics while held
        let slot = self.session_key.lock().unwrap();
        slot.clone()
    }

    fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    fn cancel_token(&self) -> CancellationToken {
        self.channel.cancel_token()
    }

    fn start_receiving(&self) {
        self.channel.start_receiving();
    }

    async fn send_bytes(&self, body: Bytes, token: &CancellationToken) -> std::io::Result<()> {
        self.channel.send_async(&body, token).await.map_err(std::io::Error::from)
    }

    async fn disconnect(&self, reason: &str) {
        self.channel.disconnect(reason).await;
    }
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("endpoint", &self.channel.peer())
            .field("authority", &self.authority())
            .field("open", &self.channel.is_open())
            .finish_non_exhaustive()
    }
}
