//! Packet dispatch pipeline.
//!
//! For each framed packet pulled off a connection's incoming queue the
//! dispatcher runs one ordered pipeline: decode by magic, undo transport
//! transforms, look up the opcode handler, apply the handler's policy
//! (permission, encryption, rate limit, concurrency, timeout), invoke it,
//! and send back whatever it returned. The first failing step wins; every
//! failure is a [`DispatchError`] variant, not an exception.
//!
//! Packets from one connection are dispatched in arrival order by the
//! connection's single pump task; packets from different connections run in
//! parallel. No per-connection lock is held across an await.

use std::{net::IpAddr, sync::Arc};

use dashmap::DashMap;
use gantry_proto::{CipherAlgorithm, Packet, PacketCatalog, PacketFlags, ProtocolError, TransformerSet};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{
    context::PacketContext,
    error::{DispatchError, HandlerError},
    handler::{EncryptionPolicy, HandlerCatalog, HandlerDescriptor},
    limiter::RequestLimiterSet,
    protocol::{MessageArgs, PacketProtocol},
};

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Cipher the transformer chain is invoked with.
    pub cipher: CipherAlgorithm,
    /// Disconnect a connection whose packet failed authentication.
    pub disconnect_on_auth_failure: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { cipher: CipherAlgorithm::ChaCha20Poly1305, disconnect_on_auth_failure: false }
    }
}

/// The decode → policy → invoke → reply pipeline.
///
/// Frozen catalogs and concurrent limiter state only; safe to share behind
/// an `Arc` across every connection task.
pub struct Dispatcher {
    packets: Arc<PacketCatalog>,
    handlers: Arc<HandlerCatalog>,
    rate_limits: Arc<RequestLimiterSet>,
    /// One bounded semaphore per (endpoint, opcode) pair that declared a
    /// concurrency cap.
    concurrency: DashMap<(IpAddr, u16), Arc<Semaphore>>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Assemble a dispatcher over frozen catalogs.
    #[must_use]
    pub fn new(
        packets: Arc<PacketCatalog>,
        handlers: Arc<HandlerCatalog>,
        rate_limits: Arc<RequestLimiterSet>,
        config: DispatcherConfig,
    ) -> Self {
        Self { packets, handlers, rate_limits, concurrency: DashMap::new(), config }
    }

    /// Run the pipeline for one framed packet.
    ///
    /// Outcome classification (logging, counters, auth-failure disconnect)
    /// happens here; the caller only decides whether the connection
    /// survives, via [`DispatchError::disconnects`].
    pub async fn dispatch(
        &self,
        protocol: &dyn PacketProtocol,
        args: MessageArgs,
    ) -> Result<(), DispatchError> {
        let result = self.run_pipeline(protocol, &args).await;

        if let Err(error) = &result {
            self.record_outcome(protocol, &args, error).await;
        }

        // Incoming lease released here, on every path.
        drop(args);
        result
    }

    async fn run_pipeline(
        &self,
        protocol: &dyn PacketProtocol,
        args: &MessageArgs,
    ) -> Result<(), DispatchError> {
        let connection = &args.connection;

        // Decode: header parse and magic lookup in one step.
        let mut packet = self.packets.try_deserialize(args.lease.as_slice())?;
        let wire_flags = packet.flags();

        if wire_flags.contains(PacketFlags::FRAGMENTED) {
            return Err(DispatchError::FragmentationUnsupported { magic: packet.magic() });
        }

        if wire_flags.contains(PacketFlags::COMPRESSED) {
            let set = self.transformer_set(packet.magic(), "decompress")?;
            packet = (set.decompress)(&packet)?;
        }

        if wire_flags.contains(PacketFlags::ENCRYPTED) {
            let set = self.transformer_set(packet.magic(), "decrypt")?;
            let key = connection
                .session_key()
                .ok_or(ProtocolError::AuthenticationFailed { magic: packet.magic() })?;
            packet = (set.decrypt)(&packet, &key, self.config.cipher)?;
        }

        let opcode = packet.opcode();
        let descriptor =
            self.handlers.get(opcode).ok_or(DispatchError::UnknownOpcode { opcode })?;

        if let Some(required) = descriptor.metadata.permission {
            let actual = connection.authority();
            if actual < required {
                return Err(DispatchError::Forbidden { opcode, required, actual });
            }
        }

        let arrived_encrypted = wire_flags.contains(PacketFlags::ENCRYPTED);
        match descriptor.metadata.encryption {
            EncryptionPolicy::Any => {},
            EncryptionPolicy::Required if !arrived_encrypted => {
                return Err(DispatchError::EncryptionPolicyViolation {
                    opcode,
                    encrypted: arrived_encrypted,
                });
            },
            EncryptionPolicy::Forbidden if arrived_encrypted => {
                return Err(DispatchError::EncryptionPolicyViolation {
                    opcode,
                    encrypted: arrived_encrypted,
                });
            },
            EncryptionPolicy::Required | EncryptionPolicy::Forbidden => {},
        }

        let endpoint = connection.endpoint().ip();
        if let Some(level) = descriptor.metadata.rate_limit {
            if !self.rate_limits.check(endpoint, level) {
                return Err(DispatchError::RateLimited { endpoint });
            }
        }

        let token = connection.cancel_token().child_token();

        let _permit = match descriptor.metadata.concurrency {
            Some(limit) => Some(self.acquire_slot(endpoint, opcode, limit, &token).await?),
            None => None,
        };

        let reply = self.invoke(descriptor, packet, args, &token).await?;

        protocol.post_process_message(connection).await;

        if let Some(reply) = reply {
            let body = self.prepare_reply(reply, connection.session_key())?;
            connection
                .send_bytes(body, &token)
                .await
                .map_err(|e| DispatchError::ReplySend { reason: e.to_string() })?;
        }

        Ok(())
    }

    async fn invoke(
        &self,
        descriptor: &HandlerDescriptor,
        packet: Packet,
        args: &MessageArgs,
        token: &CancellationToken,
    ) -> Result<Option<Packet>, DispatchError> {
        let opcode = descriptor.opcode;
        let context = PacketContext {
            packet,
            connection: Arc::clone(&args.connection),
            token: token.clone(),
        };

        let invocation = descriptor.invoke(context);

        let outcome = match descriptor.metadata.timeout {
            Some(limit) => {
                tokio::select! {
                    result = invocation => result,
                    () = token.cancelled() => Err(HandlerError::Cancelled),
                    () = tokio::time::sleep(limit) => {
                        // Give the handler a chance to observe the timeout
                        // before the invocation is dropped.
                        token.cancel();
                        Err(HandlerError::Cancelled)
                    }
                }
            },
            None => {
                tokio::select! {
                    result = invocation => result,
                    () = token.cancelled() => Err(HandlerError::Cancelled),
                }
            },
        };

        outcome.map_err(|source| match source {
            HandlerError::Cancelled => DispatchError::Cancelled,
            failed @ HandlerError::Failed(_) => DispatchError::Handler { opcode, source: failed },
        })
    }

    /// Mirror the inbound transform order for a reply: encrypt first, then
    /// compress, as requested by the reply packet's own flags.
    fn prepare_reply(
        &self,
        reply: Packet,
        session_key: Option<bytes::Bytes>,
    ) -> Result<bytes::Bytes, DispatchError> {
        let mut outgoing = reply;

        if outgoing.flags().contains(PacketFlags::ENCRYPTED) {
            let set = self.transformer_set(outgoing.magic(), "encrypt")?;
            let key = session_key
                .ok_or(ProtocolError::AuthenticationFailed { magic: outgoing.magic() })?;
            outgoing = (set.encrypt)(&outgoing, &key, self.config.cipher)?;
        }

        if outgoing.flags().contains(PacketFlags::COMPRESSED) {
            let set = self.transformer_set(outgoing.magic(), "compress")?;
            outgoing = (set.compress)(&outgoing)?;
        }

        Ok(outgoing.serialize()?)
    }

    async fn acquire_slot(
        &self,
        endpoint: IpAddr,
        opcode: u16,
        limit: crate::handler::ConcurrencyLimit,
        token: &CancellationToken,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, DispatchError> {
        let semaphore = self
            .concurrency
            .entry((endpoint, opcode))
            .or_insert_with(|| Arc::new(Semaphore::new(limit.max_concurrent as usize)))
            .value()
            .clone();

        if limit.try_acquire_immediately {
            semaphore.try_acquire_owned().map_err(|_| DispatchError::Busy { opcode })
        } else {
            tokio::select! {
                permit = semaphore.acquire_owned() => {
                    permit.map_err(|_| DispatchError::Busy { opcode })
                }
                () = token.cancelled() => Err(DispatchError::Cancelled),
            }
        }
    }

    fn transformer_set(
        &self,
        magic: u32,
        transform: &'static str,
    ) -> Result<&TransformerSet, ProtocolError> {
        self.packets
            .transformers(magic)
            .ok_or(ProtocolError::TransformNotSupported { magic, transform })
    }

    async fn record_outcome(
        &self,
        protocol: &dyn PacketProtocol,
        args: &MessageArgs,
        error: &DispatchError,
    ) {
        let endpoint = args.connection.endpoint();

        match error {
            DispatchError::Cancelled => {
                // Cooperative cancellation: neither logged nor counted.
            },
            DispatchError::Protocol(ProtocolError::AuthenticationFailed { magic }) => {
                protocol.core().record_rejection();
                tracing::warn!(%endpoint, magic = format_args!("{magic:#010x}"), "packet authentication failed");
                if self.config.disconnect_on_auth_failure {
                    args.connection.disconnect("authentication failed").await;
                }
            },
            DispatchError::Protocol(inner) => {
                protocol.core().record_rejection();
                tracing::warn!(%endpoint, error = %inner, "packet discarded");
            },
            DispatchError::UnknownOpcode { opcode } => {
                protocol.core().record_rejection();
                tracing::warn!(%endpoint, opcode = format_args!("{opcode:#06x}"), "no handler for opcode");
            },
            rejection if rejection.is_policy_rejection() => {
                protocol.core().record_rejection();
                tracing::debug!(%endpoint, error = %rejection, "packet rejected by policy");
            },
            DispatchError::Handler { opcode, source } => {
                protocol.core().record_error();
                tracing::error!(%endpoint, opcode = format_args!("{opcode:#06x}"), error = %source, "handler failed");
                if !protocol.core().keep_connection_open() {
                    args.connection.disconnect("handler failed").await;
                }
            },
            DispatchError::ReplySend { reason } => {
                protocol.core().record_error();
                tracing::error!(%endpoint, %reason, "reply send failed");
            },
            other => {
                protocol.core().record_error();
                tracing::error!(%endpoint, error = %other, "dispatch failed");
            },
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handlers.len())
            .field("packet_types", &self.packets.len())
            .finish_non_exhaustive()
    }
}
