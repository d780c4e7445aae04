//! Per-endpoint admission and rate control.
//!
//! Two independent limiters gate traffic:
//!
//! - [`ConnectionLimiter`] caps concurrent connections per endpoint at
//!   accept time.
//! - [`RequestLimiter`] enforces a sliding-window request budget with
//!   lockout at dispatch time, with one instance per
//!   [`crate::handler::RateLimitLevel`] bundled in a [`RequestLimiterSet`].
//!
//! Both keep their hot path lock-free (atomic entries in concurrent maps)
//! and push expiry work into background cleanup.

mod connection;
mod request;

pub use connection::{
    ConnectionLimitConfig, ConnectionLimiter, ConnectionLimiterMetrics, MAX_CAS_RETRIES,
    MAX_CLEANUP_KEYS_PER_RUN,
};
pub use request::{
    RequestLimitConfig, RequestLimiter, RequestLimiterMetrics, RequestLimiterSet,
    RequestLimiterSetConfig,
};
