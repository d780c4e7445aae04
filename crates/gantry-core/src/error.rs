//! Pipeline error taxonomy.
//!
//! Dispatch never uses errors for ordinary control flow: every rejection the
//! pipeline can produce is a [`DispatchError`] variant, classified by what
//! the connection owner should do next ([`DispatchError::disconnects`]) and
//! how loudly to log it. Configuration mistakes are a separate type
//! ([`ConfigError`]) because they must abort startup.

use std::net::IpAddr;

use gantry_proto::ProtocolError;
use thiserror::Error;

use crate::connection::AuthorityLevel;

/// Errors a handler body may return.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler failed; the message is logged and counted.
    #[error("{0}")]
    Failed(String),

    /// The handler observed its cancellation token and stopped early.
    #[error("handler cancelled")]
    Cancelled,
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Failed`].
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Everything that can go wrong between a framed packet leaving the incoming
/// queue and its reply (if any) being written back.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Parse/deserialize/transform failure from the proto layer.
    ///
    /// Covers `UnknownMagic`, `TransformNotSupported`, and
    /// `AuthenticationFailed` among others; see [`ProtocolError`].
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No handler registered for this opcode.
    #[error("unknown opcode {opcode:#06x}")]
    UnknownOpcode {
        /// Opcode read from the packet
        opcode: u16,
    },

    /// Fragmented packets are not supported; no reassembly is defined.
    #[error("fragmented packet rejected for magic {magic:#010x}")]
    FragmentationUnsupported {
        /// Magic number of the rejected packet
        magic: u32,
    },

    /// The connection's authority level is below the handler's requirement.
    #[error("forbidden: opcode {opcode:#06x} requires {required:?}, connection has {actual:?}")]
    Forbidden {
        /// Opcode that was attempted
        opcode: u16,
        /// Authority the handler demands
        required: AuthorityLevel,
        /// Authority the connection holds
        actual: AuthorityLevel,
    },

    /// The packet's encryption state contradicts the handler's policy.
    #[error("encryption policy violation on opcode {opcode:#06x} (packet encrypted: {encrypted})")]
    EncryptionPolicyViolation {
        /// Opcode that was attempted
        opcode: u16,
        /// Whether the packet arrived encrypted
        encrypted: bool,
    },

    /// The endpoint exceeded its sliding-window request budget.
    #[error("rate limited: {endpoint}")]
    RateLimited {
        /// Offending endpoint
        endpoint: IpAddr,
    },

    /// The per-endpoint concurrency cap for this opcode is exhausted.
    #[error("busy: opcode {opcode:#06x} concurrency limit reached")]
    Busy {
        /// Opcode that was attempted
        opcode: u16,
    },

    /// Cooperative cancellation (including handler timeouts).
    ///
    /// Neither logged as an error nor counted.
    #[error("dispatch cancelled")]
    Cancelled,

    /// The handler body failed.
    #[error("handler for opcode {opcode:#06x} failed: {source}")]
    Handler {
        /// Opcode whose handler failed
        opcode: u16,
        /// The handler's error
        source: HandlerError,
    },

    /// Writing the reply frame failed.
    #[error("reply send failed: {reason}")]
    ReplySend {
        /// I/O error description
        reason: String,
    },
}

impl DispatchError {
    /// `true` if the connection must be closed after this error.
    ///
    /// Policy rejections and unknown magics/opcodes discard the packet and
    /// keep the connection; I/O failures on the reply path end it.
    #[must_use]
    pub fn disconnects(&self) -> bool {
        matches!(self, Self::ReplySend { .. })
    }

    /// `true` for policy rejections (counted, not error-logged).
    #[must_use]
    pub fn is_policy_rejection(&self) -> bool {
        matches!(
            self,
            Self::Forbidden { .. }
                | Self::EncryptionPolicyViolation { .. }
                | Self::RateLimited { .. }
                | Self::Busy { .. }
                | Self::FragmentationUnsupported { .. }
        )
    }
}

/// Configuration mistakes detected at startup.
///
/// The process must not begin accepting traffic after any of these.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Two handlers registered the same opcode.
    #[error(
        "duplicate opcode {opcode:#06x}: controller '{controller}' collides with '{existing}'"
    )]
    DuplicateOpcode {
        /// The colliding opcode
        opcode: u16,
        /// Controller that registered it first
        existing: String,
        /// Controller that collided
        controller: String,
    },

    /// A configuration value failed validation.
    #[error("invalid option '{field}': {reason}")]
    InvalidOption {
        /// Option name
        field: &'static str,
        /// Why validation rejected it
        reason: String,
    },
}

impl ConfigError {
    /// Helper for the common "must be greater than zero" validation.
    #[must_use]
    pub fn must_be_positive(field: &'static str) -> Self {
        Self::InvalidOption { field, reason: "must be greater than zero".to_string() }
    }
}
