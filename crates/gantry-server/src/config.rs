//! Server configuration.
//!
//! Plain validated structs; the embedding application (or `main.rs` via CLI
//! flags) fills them in. Validation happens once at startup and failures are
//! fatal: the server never starts with a half-valid configuration.

use gantry_core::{
    ConfigError, ConnectionLimitConfig, DispatcherConfig, RequestLimitConfig,
    RequestLimiterSetConfig,
};

/// Connection channel tuning.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Hard cap on a framed packet (length prefix included); also the
    /// buffer pool's maximum buffer size.
    pub max_buffer_size: usize,
    /// Sends up to this many bytes use a stack buffer instead of a pooled
    /// one.
    pub stack_alloc_limit: usize,
    /// Bounded capacity of the per-connection incoming queue.
    pub incoming_capacity: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self { max_buffer_size: 64 * 1024, stack_alloc_limit: 512, incoming_capacity: 256 }
    }
}

impl ChannelOptions {
    /// Validate the options.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_buffer_size < 2 {
            return Err(ConfigError::InvalidOption {
                field: "max_buffer_size",
                reason: "must be at least 2 (the frame length prefix)".to_string(),
            });
        }
        if self.stack_alloc_limit == 0 {
            return Err(ConfigError::must_be_positive("stack_alloc_limit"));
        }
        if self.incoming_capacity == 0 {
            return Err(ConfigError::must_be_positive("incoming_capacity"));
        }
        Ok(())
    }
}

/// Everything the server needs to start.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address to bind the TCP listener to.
    pub bind_address: String,
    /// Channel framing and queueing.
    pub channel: ChannelOptions,
    /// Per-endpoint concurrent connection cap.
    pub connection_limits: ConnectionLimitConfig,
    /// Per-endpoint sliding-window budgets, one per rate-limit tier.
    pub request_limits: RequestLimiterSetConfig,
    /// Dispatcher tuning (cipher, auth-failure policy).
    pub dispatcher: DispatcherConfig,
    /// Keep connections open across processed messages.
    pub keep_connection_open: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7420".to_string(),
            channel: ChannelOptions::default(),
            connection_limits: ConnectionLimitConfig::default(),
            request_limits: RequestLimiterSetConfig::tiered(RequestLimitConfig::default()),
            dispatcher: DispatcherConfig::default(),
            keep_connection_open: true,
        }
    }
}

impl ServerOptions {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.channel.validate()?;
        self.connection_limits.validate()?;
        self.request_limits.lenient.validate()?;
        self.request_limits.standard.validate()?;
        self.request_limits.strict.validate()?;
        Ok(())
    }
}
