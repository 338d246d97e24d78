//! Opaque TLS engine interface
//!
//! The conduit, the SNI dispatcher and the ALPN shims only ever talk to a TLS
//! implementation through [`TlsEngine`]: a synchronous wrap/unwrap state
//! machine that may hand CPU-heavy work back to the caller as delegated
//! tasks. Engines are created per connection by a [`TlsContext`].

use std::fmt;

use crate::alpn::transcript::TranscriptHash;
use crate::error::Result;

#[cfg(test)]
pub mod testing;

// ============= Status Types =============

/// Outcome of a single wrap/unwrap call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// The engine side in question is closed
    Closed,
    /// Not enough input to make progress; supply more bytes and retry
    BufferUnderflow,
    /// Output buffer too small for the next unit of output
    BufferOverflow,
}

/// What the handshake needs next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    NeedTask,
    NeedWrap,
    NeedUnwrap,
    /// Returned exactly once, by the call that completed the handshake
    Finished,
    NotHandshaking,
}

impl HandshakeStatus {
    pub fn is_handshaking(self) -> bool {
        matches!(self, Self::NeedTask | Self::NeedWrap | Self::NeedUnwrap)
    }
}

impl fmt::Display for HandshakeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NeedTask => "NEED_TASK",
            Self::NeedWrap => "NEED_WRAP",
            Self::NeedUnwrap => "NEED_UNWRAP",
            Self::Finished => "FINISHED",
            Self::NotHandshaking => "NOT_HANDSHAKING",
        };
        f.write_str(name)
    }
}

/// Result of [`TlsEngine::wrap`] / [`TlsEngine::unwrap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
    pub status: Status,
    pub handshake_status: HandshakeStatus,
    pub bytes_consumed: usize,
    pub bytes_produced: usize,
}

impl EngineResult {
    pub fn new(status: Status, handshake_status: HandshakeStatus, bytes_consumed: usize, bytes_produced: usize) -> Self {
        Self { status, handshake_status, bytes_consumed, bytes_produced }
    }

    /// Nothing consumed, nothing produced
    pub fn idle(status: Status, handshake_status: HandshakeStatus) -> Self {
        Self::new(status, handshake_status, 0, 0)
    }
}

/// Client certificate policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientAuth {
    #[default]
    None,
    Want,
    Need,
}

/// Negotiated session parameters, for `PeerInfo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub protocol: String,
    pub cipher_suite: String,
}

/// CPU-bound unit of handshake work handed back to the caller
pub type DelegatedTask = Box<dyn FnOnce() + Send + 'static>;

// ============= Engine =============

pub trait TlsEngine: Send {
    /// Encrypt plaintext from `src` into records in `dst`. During the
    /// handshake this produces handshake records and ignores `src`.
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult>;

    /// Consume at most one record from `src`, writing plaintext into `dst`.
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult>;

    /// Next pending delegated task, if any
    fn delegated_task(&mut self) -> Option<DelegatedTask>;

    fn handshake_status(&self) -> HandshakeStatus;

    fn begin_handshake(&mut self) -> Result<()>;

    fn close_inbound(&mut self) -> Result<()>;

    fn close_outbound(&mut self);

    fn is_inbound_done(&self) -> bool;

    fn is_outbound_done(&self) -> bool;

    /// Largest record this engine will produce or accept
    fn packet_buffer_size(&self) -> usize;

    /// Largest plaintext a single record decrypts to
    fn application_buffer_size(&self) -> usize;

    fn set_enabled_cipher_suites(&mut self, suites: &[String]);

    fn set_enabled_protocols(&mut self, protocols: &[String]);

    fn set_client_auth(&mut self, mode: ClientAuth);

    fn set_enable_session_creation(&mut self, enabled: bool);

    fn use_client_mode(&self) -> bool;

    fn session_info(&self) -> Option<SessionInfo> {
        None
    }

    /// Application protocol negotiated by the engine itself (or a shim)
    fn application_protocol(&self) -> Option<String> {
        None
    }

    /// Handshake transcript hash hook. Engines that do not expose one cannot
    /// be wrapped by the ALPN shims; the shims then pass bytes through.
    fn transcript(&mut self) -> Option<&mut dyn TranscriptHash> {
        None
    }
}

impl<E: TlsEngine + ?Sized> TlsEngine for Box<E> {
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult> {
        (**self).wrap(src, dst)
    }
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult> {
        (**self).unwrap(src, dst)
    }
    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        (**self).delegated_task()
    }
    fn handshake_status(&self) -> HandshakeStatus {
        (**self).handshake_status()
    }
    fn begin_handshake(&mut self) -> Result<()> {
        (**self).begin_handshake()
    }
    fn close_inbound(&mut self) -> Result<()> {
        (**self).close_inbound()
    }
    fn close_outbound(&mut self) {
        (**self).close_outbound()
    }
    fn is_inbound_done(&self) -> bool {
        (**self).is_inbound_done()
    }
    fn is_outbound_done(&self) -> bool {
        (**self).is_outbound_done()
    }
    fn packet_buffer_size(&self) -> usize {
        (**self).packet_buffer_size()
    }
    fn application_buffer_size(&self) -> usize {
        (**self).application_buffer_size()
    }
    fn set_enabled_cipher_suites(&mut self, suites: &[String]) {
        (**self).set_enabled_cipher_suites(suites)
    }
    fn set_enabled_protocols(&mut self, protocols: &[String]) {
        (**self).set_enabled_protocols(protocols)
    }
    fn set_client_auth(&mut self, mode: ClientAuth) {
        (**self).set_client_auth(mode)
    }
    fn set_enable_session_creation(&mut self, enabled: bool) {
        (**self).set_enable_session_creation(enabled)
    }
    fn use_client_mode(&self) -> bool {
        (**self).use_client_mode()
    }
    fn session_info(&self) -> Option<SessionInfo> {
        (**self).session_info()
    }
    fn application_protocol(&self) -> Option<String> {
        (**self).application_protocol()
    }
    fn transcript(&mut self) -> Option<&mut dyn TranscriptHash> {
        (**self).transcript()
    }
}

// ============= Queued Options =============

/// Security options set before a concrete engine exists.
///
/// Only options that were actually set are replayed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOptions {
    pub cipher_suites: Option<Vec<String>>,
    pub protocols: Option<Vec<String>>,
    pub client_auth: Option<ClientAuth>,
    pub session_creation: Option<bool>,
}

impl EngineOptions {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply<E: TlsEngine + ?Sized>(&self, engine: &mut E) {
        if let Some(ref suites) = self.cipher_suites {
            engine.set_enabled_cipher_suites(suites);
        }
        if let Some(ref protocols) = self.protocols {
            engine.set_enabled_protocols(protocols);
        }
        if let Some(mode) = self.client_auth {
            engine.set_client_auth(mode);
        }
        if let Some(enabled) = self.session_creation {
            engine.set_enable_session_creation(enabled);
        }
    }
}

// ============= Context =============

/// Factory for per-connection engines (one certificate/key configuration)
pub trait TlsContext: Send + Sync {
    type Engine: TlsEngine;

    fn create_engine(&self) -> Result<Self::Engine>;
}

impl<C: TlsContext + ?Sized> TlsContext for std::sync::Arc<C> {
    type Engine = C::Engine;

    fn create_engine(&self) -> Result<Self::Engine> {
        (**self).create_engine()
    }
}
