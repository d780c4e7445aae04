//! Framed TCP connection channel.
//!
//! One channel per accepted socket. The receive loop frames length-prefixed
//! packets off the stream into pooled buffer leases and pushes them onto a
//! bounded incoming queue, firing the cached packet callback on every push;
//! a pump task (the dispatcher side) drains the queue. Sends are serialized
//! through an async mutex on the write half and always write whole frames.
//!
//! # Wire frame
//!
//! `u16` little-endian total length `L` (including those two bytes),
//! followed by `L - 2` bytes of packet body. `L < 2` or `L` above the
//! configured cap is a hard receive error: the connection is closed and the
//! disconnect event fires exactly once.
//!
//! # Cancellation
//!
//! The channel token is a child of the caller's token; cancelling either
//! unblocks in-flight reads and writes and shuts the socket down both ways.

use std::{
    collections::VecDeque,
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use gantry_core::{BufferError, BufferLease, BufferPool, PooledBuf};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex as AsyncMutex, Notify},
};
use tokio_util::sync::CancellationToken;

use crate::config::ChannelOptions;

/// Length prefix size: one `u16`.
const FRAME_PREFIX: usize = 2;

/// Upper bound for the stack send buffer regardless of configuration.
const STACK_ALLOC_CEILING: usize = 512;

/// Initial receive-buffer rent; grows on demand up to the configured cap.
const INITIAL_RECV_BUFFER: usize = 2048;

/// Callback invoked after every push to the incoming queue (pre-bound; the
/// closure captures whatever sender/args it needs).
pub type PacketCachedFn = Arc<dyn Fn() + Send + Sync>;

/// Callback fired exactly once when the channel disconnects.
pub type DisconnectedFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Channel errors.
#[derive(Debug)]
pub enum ChannelError {
    /// Outgoing data cannot fit a `u16`-prefixed frame or exceeds the cap.
    ///
    /// Surfaced to the caller; never logged at error level.
    PacketTooLarge {
        /// Body size requested
        size: usize,
        /// Largest sendable body
        max: usize,
    },

    /// Incoming length prefix outside `2..=max_buffer_size`.
    ///
    /// Fatal for the connection.
    InvalidFrame {
        /// Length the peer announced
        length: usize,
        /// Configured cap
        max: usize,
    },

    /// The peer closed mid-frame.
    IncompletePacket,

    /// The channel is closed.
    Closed,

    /// The operation was cancelled.
    Cancelled,

    /// Buffer pool failure.
    Buffer(BufferError),

    /// Socket I/O failure.
    Io(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge { size, max } => {
                write!(f, "packet of {size} bytes exceeds sendable maximum of {max}")
            },
            Self::InvalidFrame { length, max } => {
                write!(f, "frame length {length} outside valid range 2..={max}")
            },
            Self::IncompletePacket => write!(f, "peer closed mid-frame"),
            Self::Closed => write!(f, "channel closed"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Buffer(err) => write!(f, "buffer pool: {err}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<BufferError> for ChannelError {
    fn from(err: BufferError) -> Self {
        Self::Buffer(err)
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<ChannelError> for std::io::Error {
    fn from(err: ChannelError) -> Self {
        std::io::Error::other(err.to_string())
    }
}

/// Outcome of one exact-length cancellable read.
enum ReadOutcome {
    /// Buffer filled.
    Full,
    /// Zero-byte read before the first byte: orderly peer close.
    CleanClose,
    /// Zero-byte read or reset mid-buffer.
    DirtyClose,
    /// Channel token cancelled.
    Cancelled,
    /// Unclassified I/O failure.
    Failed(std::io::Error),
}

/// Bidirectional framed channel over one TCP socket.
pub struct ConnectionChannel {
    peer: SocketAddr,
    pool: Arc<BufferPool>,
    options: ChannelOptions,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: AsyncMutex<OwnedWriteHalf>,
    incoming: Mutex<VecDeque<BufferLease>>,
    incoming_notify: Notify,
    packet_cached: Mutex<Option<PacketCachedFn>>,
    disconnected: Mutex<Option<DisconnectedFn>>,
    disconnect_fired: AtomicBool,
    receive_started: AtomicBool,
    cancel: CancellationToken,
    started_at: Instant,
    last_ping_offset_ms: AtomicU64,
}

impl ConnectionChannel {
    /// Wrap an accepted stream. The channel token is a child of `parent`.
    pub fn new(
        stream: TcpStream,
        parent: &CancellationToken,
        pool: Arc<BufferPool>,
        options: ChannelOptions,
    ) -> Result<Arc<Self>, ChannelError> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        Ok(Arc::new(Self {
            peer,
            pool,
            options,
            reader: Mutex::new(Some(read_half)),
            writer: AsyncMutex::new(write_half),
            incoming: Mutex::new(VecDeque::new()),
            incoming_notify: Notify::new(),
            packet_cached: Mutex::new(None),
            disconnected: Mutex::new(None),
            disconnect_fired: AtomicBool::new(false),
            receive_started: AtomicBool::new(false),
            cancel: parent.child_token(),
            started_at: Instant::now(),
            last_ping_offset_ms: AtomicU64::new(0),
        }))
    }

    /// Remote endpoint.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// `true` until the disconnect event has fired.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.disconnect_fired.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    /// The channel's cancellation token (child of the caller's).
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// When the channel was created.
    #[must_use]
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Last time a complete frame arrived.
    #[must_use]
    pub fn last_ping_at(&self) -> Instant {
        self.started_at + Duration::from_millis(self.last_ping_offset_ms.load(Ordering::Acquire))
    }

    /// Subscribe the cached packet callback (replaces any previous one).
    pub fn set_packet_cached(&self, callback: PacketCachedFn) {
        #[allow(clippy::unwrap_used)] // channel mutexes are never poisoned: no panics while held
        let mut slot = self.packet_cached.lock().unwrap();
        *slot = Some(callback);
    }

    /// Unsubscribe the cached packet callback.
    pub fn remove_packet_cached(&self) {
        #[allow(clippy::unwrap_used)] // channel mutexes are never poisoned: no panics while held
        let mut slot = self.packet_cached.lock().unwrap();
        *slot = None;
    }

    /// Register the one-shot disconnect callback.
    pub fn on_disconnected(&self, callback: DisconnectedFn) {
        #[allow(clippy::unwrap_used)] // channel mutexes are never poisoned: no panics while held
        let mut slot = self.disconnected.lock().unwrap();
        *slot = Some(callback);
    }

    /// Start the receive loop. Idempotent; later calls are no-ops.
    pub fn start_receiving(self: &Arc<Self>) {
        if self
            .receive_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let read_half = {
            #[allow(clippy::unwrap_used)] // channel mutexes are never poisoned: no panics while held
            let mut reader = self.reader.lock().unwrap();
            reader.take()
        };

        let Some(read_half) = read_half else {
            return;
        };

        let channel = Arc::clone(self);
        tokio::spawn(async move {
            channel.receive_loop(read_half).await;
        });
    }

    /// Non-blocking pop from the incoming queue.
    #[must_use]
    pub fn pop_incoming(&self) -> Option<BufferLease> {
        #[allow(clippy::unwrap_used)] // channel mutexes are never poisoned: no panics while held
        let mut queue = self.incoming.lock().unwrap();
        queue.pop_front()
    }

    /// Await the next framed packet; `None` once the channel is closed and
    /// drained.
    pub async fn recv_incoming(&self) -> Option<BufferLease> {
        loop {
            if let Some(lease) = self.pop_incoming() {
                return Some(lease);
            }
            if self.cancel.is_cancelled() {
                // Final drain: a push may have raced the cancellation.
                return self.pop_incoming();
            }

            let notified = self.incoming_notify.notified();
            tokio::select! {
                () = notified => {},
                () = self.cancel.cancelled() => {},
            }
        }
    }

    /// Copy `bytes` into a fresh lease and push it, as if it had arrived on
    /// the wire. Test/simulated ingress.
    pub fn inject_incoming(&self, bytes: &[u8]) -> Result<(), ChannelError> {
        let lease = BufferLease::copy_from(&self.pool, bytes)?;
        self.push_incoming(lease);
        Ok(())
    }

    /// Depth of the incoming queue.
    #[must_use]
    pub fn incoming_len(&self) -> usize {
        #[allow(clippy::unwrap_used)] // channel mutexes are never poisoned: no panics while held
        let queue = self.incoming.lock().unwrap();
        queue.len()
    }

    /// Frame and send `data` (whole frame or error).
    pub async fn send(&self, data: &[u8]) -> Result<(), ChannelError> {
        self.send_inner(data, None).await
    }

    /// Frame and send `data`, abortable through `token`.
    pub async fn send_async(
        &self,
        data: &[u8],
        token: &CancellationToken,
    ) -> Result<(), ChannelError> {
        self.send_inner(data, Some(token)).await
    }

    /// Close the channel: cancel the token, shut the socket down both ways,
    /// fire the disconnect event. Exactly one caller performs the close.
    pub async fn disconnect(&self, reason: &str) {
        if self
            .disconnect_fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.cancel.cancel();
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }

        tracing::debug!(peer = %self.peer, reason, "channel disconnected");
        self.fire_disconnected(reason);
    }

    async fn receive_loop(self: Arc<Self>, mut read_half: OwnedReadHalf) {
        let max_total = self.options.max_buffer_size.min(usize::from(u16::MAX));
        let mut body_buf = match self.pool.rent(INITIAL_RECV_BUFFER.min(max_total)) {
            Ok(buf) => buf,
            Err(err) => {
                tracing::error!(peer = %self.peer, %err, "receive buffer rent failed");
                self.disconnect("receive buffer unavailable").await;
                return;
            },
        };

        loop {
            let mut prefix = [0u8; FRAME_PREFIX];
            match self.read_full(&mut read_half, &mut prefix).await {
                ReadOutcome::Full => {},
                ReadOutcome::CleanClose => {
                    self.disconnect("peer closed").await;
                    return;
                },
                ReadOutcome::DirtyClose => {
                    self.disconnect("connection reset").await;
                    return;
                },
                ReadOutcome::Cancelled => {
                    self.disconnect("receive cancelled").await;
                    return;
                },
                ReadOutcome::Failed(err) => {
                    tracing::warn!(peer = %self.peer, %err, "receive failed");
                    self.disconnect("receive error").await;
                    return;
                },
            }

            let total = usize::from(u16::from_le_bytes(prefix));
            if total < FRAME_PREFIX || total > max_total {
                let err = ChannelError::InvalidFrame { length: total, max: max_total };
                tracing::warn!(peer = %self.peer, %err, "closing connection");
                self.disconnect("invalid frame length").await;
                return;
            }

            let body_len = total - FRAME_PREFIX;
            if body_len > body_buf.capacity() {
                // Grow: the old region returns to its bucket on drop.
                body_buf = match self.pool.rent(body_len) {
                    Ok(buf) => buf,
                    Err(err) => {
                        tracing::error!(peer = %self.peer, %err, "receive buffer grow failed");
                        self.disconnect("receive buffer unavailable").await;
                        return;
                    },
                };
            }

            match self.read_full(&mut read_half, &mut body_buf.as_mut_slice()[..body_len]).await {
                ReadOutcome::Full => {},
                ReadOutcome::CleanClose | ReadOutcome::DirtyClose => {
                    tracing::warn!(
                        peer = %self.peer,
                        announced = total,
                        error = %ChannelError::IncompletePacket,
                        "closing connection",
                    );
                    self.disconnect("incomplete packet").await;
                    return;
                },
                ReadOutcome::Cancelled => {
                    self.disconnect("receive cancelled").await;
                    return;
                },
                ReadOutcome::Failed(err) => {
                    tracing::warn!(peer = %self.peer, %err, "receive failed");
                    self.disconnect("receive error").await;
                    return;
                },
            }

            let lease = match BufferLease::copy_from(&self.pool, &body_buf.as_slice()[..body_len]) {
                Ok(lease) => lease,
                Err(err) => {
                    tracing::error!(peer = %self.peer, %err, "lease copy failed");
                    self.disconnect("receive buffer unavailable").await;
                    return;
                },
            };

            self.touch_ping();
            self.push_incoming(lease);
        }
    }

    async fn read_full(&self, read_half: &mut OwnedReadHalf, buf: &mut [u8]) -> ReadOutcome {
        let mut filled = 0;
        while filled < buf.len() {
            let result = tokio::select! {
                () = self.cancel.cancelled() => return ReadOutcome::Cancelled,
                result = read_half.read(&mut buf[filled..]) => result,
            };

            match result {
                Ok(0) => {
                    return if filled == 0 {
                        ReadOutcome::CleanClose
                    } else {
                        ReadOutcome::DirtyClose
                    };
                },
                Ok(n) => filled += n,
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::ConnectionReset
                            | std::io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    return ReadOutcome::DirtyClose;
                },
                Err(err) => return ReadOutcome::Failed(err),
            }
        }
        ReadOutcome::Full
    }

    async fn send_inner(
        &self,
        data: &[u8],
        token: Option<&CancellationToken>,
    ) -> Result<(), ChannelError> {
        let max_total = self.options.max_buffer_size.min(usize::from(u16::MAX));
        let max_body = max_total - FRAME_PREFIX;
        if data.len() > max_body {
            return Err(ChannelError::PacketTooLarge { size: data.len(), max: max_body });
        }
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }

        let total = data.len() + FRAME_PREFIX;
        let prefix = (total as u16).to_le_bytes();

        let stack_limit = self.options.stack_alloc_limit.min(STACK_ALLOC_CEILING);
        let mut stack_buf = [0u8; STACK_ALLOC_CEILING];
        let mut pooled: Option<PooledBuf> = None;

        let frame: &[u8] = if total <= stack_limit {
            stack_buf[..FRAME_PREFIX].copy_from_slice(&prefix);
            stack_buf[FRAME_PREFIX..total].copy_from_slice(data);
            &stack_buf[..total]
        } else {
            let buf = pooled.insert(self.pool.rent(total)?);
            let slice = buf.as_mut_slice();
            slice[..FRAME_PREFIX].copy_from_slice(&prefix);
            slice[FRAME_PREFIX..total].copy_from_slice(data);
            &buf.as_slice()[..total]
        };

        let mut writer = self.writer.lock().await;
        let write = writer.write_all(frame);

        let result = match token {
            Some(token) => {
                tokio::select! {
                    result = write => result,
                    () = token.cancelled() => return Err(ChannelError::Cancelled),
                    () = self.cancel.cancelled() => return Err(ChannelError::Closed),
                }
            },
            None => {
                tokio::select! {
                    result = write => result,
                    () = self.cancel.cancelled() => return Err(ChannelError::Closed),
                }
            },
        };

        result.map_err(|err| match err.kind() {
            std::io::ErrorKind::WriteZero => ChannelError::Closed,
            _ => ChannelError::Io(err.to_string()),
        })
    }

    fn push_incoming(&self, lease: BufferLease) {
        let callback = {
            #[allow(clippy::unwrap_used)] // channel mutexes are never poisoned: no panics while held
            let slot = self.packet_cached.lock().unwrap();
            slot.clone()
        };

        {
            #[allow(clippy::unwrap_used)] // channel mutexes are never poisoned: no panics while held
            let mut queue = self.incoming.lock().unwrap();
            if queue.len() >= self.options.incoming_capacity {
                drop(queue);
                tracing::warn!(peer = %self.peer, "incoming queue full; dropping packet");
                lease.release();
                return;
            }
            queue.push_back(lease);
        }

        self.incoming_notify.notify_one();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn touch_ping(&self) {
        let offset = self.started_at.elapsed().as_millis() as u64;
        self.last_ping_offset_ms.store(offset, Ordering::Release);
    }

    fn fire_disconnected(&self, reason: &str) {
        let callback = {
            #[allow(clippy::unwrap_used)] // channel mutexes are never poisoned: no panics while held
            let mut slot = self.disconnected.lock().unwrap();
            slot.take()
        };
        if let Some(callback) = callback {
            callback(reason);
        }
        // Wake any pump blocked on the queue so it can observe the close.
        self.incoming_notify.notify_waiters();
    }
}

impl fmt::Debug for ConnectionChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionChannel")
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .field("incoming", &self.incoming_len())
            .finish_non_exhaustive()
    }
}
