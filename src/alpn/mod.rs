//! ALPN for engines that cannot negotiate it themselves
//!
//! The client shim appends an ALPN offer to the outgoing ClientHello and
//! strips the answer out of the ServerHello before the engine sees it. The
//! server shim reads the offer from the incoming ClientHello and injects the
//! selection into the outgoing ServerHello. Both halves then replay the
//! engine's transcript hash over the bytes that actually crossed the wire,
//! so the Finished exchange still verifies.
//!
//! When a rewrite cannot be done safely the shims log a warning and pass the
//! original bytes through; the connection proceeds without ALPN.

/// Forward the parts of [`TlsEngine`](crate::engine::TlsEngine) a shim does
/// not intercept to `self.inner`
macro_rules! forward_to_inner {
    () => {
        fn delegated_task(&mut self) -> Option<crate::engine::DelegatedTask> {
            self.inner.delegated_task()
        }

        fn begin_handshake(&mut self) -> crate::error::Result<()> {
            self.inner.begin_handshake()
        }

        fn close_inbound(&mut self) -> crate::error::Result<()> {
            self.inner.close_inbound()
        }

        fn close_outbound(&mut self) {
            self.inner.close_outbound()
        }

        fn is_inbound_done(&self) -> bool {
            self.inner.is_inbound_done()
        }

        fn is_outbound_done(&self) -> bool {
            self.inner.is_outbound_done()
        }

        fn application_buffer_size(&self) -> usize {
            self.inner.application_buffer_size()
        }

        fn set_enabled_cipher_suites(&mut self, suites: &[String]) {
            self.inner.set_enabled_cipher_suites(suites)
        }

        fn set_enabled_protocols(&mut self, protocols: &[String]) {
            self.inner.set_enabled_protocols(protocols)
        }

        fn set_client_auth(&mut self, mode: crate::engine::ClientAuth) {
            self.inner.set_client_auth(mode)
        }

        fn set_enable_session_creation(&mut self, enabled: bool) {
            self.inner.set_enable_session_creation(enabled)
        }

        fn use_client_mode(&self) -> bool {
            self.inner.use_client_mode()
        }

        fn session_info(&self) -> Option<crate::engine::SessionInfo> {
            self.inner.session_info()
        }

        fn transcript(&mut self) -> Option<&mut dyn crate::alpn::transcript::TranscriptHash> {
            self.inner.transcript()
        }
    };
}

pub mod client;
pub mod server;
pub mod transcript;

pub use client::{AlpnClientContext, AlpnClientEngine};
pub use server::{AlpnServerContext, AlpnServerEngine};
pub use transcript::{replay, Sha256Transcript, TranscriptHash};

use crate::engine::{EngineResult, HandshakeStatus, Status};
use crate::error::{ConduitError, Result};
use crate::protocol::record::ProtocolVersion;

/// First protocol in `server_preferences` that the client also offered.
///
/// Server order wins over client order.
pub fn select_protocol<S: AsRef<str>, T: AsRef<str>>(server_preferences: &[S], client_offer: &[T]) -> Option<String> {
    server_preferences
        .iter()
        .map(AsRef::as_ref)
        .find(|wanted| client_offer.iter().any(|offered| offered.as_ref() == *wanted))
        .map(str::to_string)
}

/// Application protocol of one connection; set at most once
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiatedProtocol {
    value: Option<String>,
}

impl NegotiatedProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    pub fn set(&mut self, protocol: impl Into<String>) -> Result<()> {
        if let Some(ref existing) = self.value {
            return Err(ConduitError::ProtocolAlreadySet { existing: existing.clone() });
        }
        self.value = Some(protocol.into());
        Ok(())
    }
}

/// Hellos other than TLS 1.2 are never rewritten
pub(crate) fn check_rewritable_version(version: ProtocolVersion) -> Result<()> {
    if version != ProtocolVersion::TLS_V1_2 {
        return Err(ConduitError::NegotiationAbandoned(format!("hello version {} is not TLS 1.2", version.name())));
    }
    Ok(())
}

/// Any failure while preparing a rewrite abandons negotiation
pub(crate) fn abandoned(reason: impl std::fmt::Display) -> ConduitError {
    ConduitError::NegotiationAbandoned(reason.to_string())
}

/// A rewritten handshake record waiting for an output buffer large enough
#[derive(Debug)]
pub(crate) struct StagedRecord {
    record: Vec<u8>,
    handshake_status: HandshakeStatus,
}

impl StagedRecord {
    /// Copy `record` into `dst`, or stage it and report overflow
    pub(crate) fn emit(
        record: Vec<u8>,
        handshake_status: HandshakeStatus,
        dst: &mut [u8],
        slot: &mut Option<StagedRecord>,
    ) -> EngineResult {
        if dst.len() < record.len() {
            *slot = Some(StagedRecord { record, handshake_status });
            return EngineResult::idle(Status::BufferOverflow, HandshakeStatus::NeedWrap);
        }
        dst[..record.len()].copy_from_slice(&record);
        EngineResult::new(Status::Ok, handshake_status, 0, record.len())
    }

    /// Retry a staged record
    pub(crate) fn flush(slot: &mut Option<StagedRecord>, dst: &mut [u8]) -> Option<EngineResult> {
        let staged = slot.take()?;
        Some(Self::emit(staged.record, staged.handshake_status, dst, slot))
    }
}
