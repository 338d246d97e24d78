//! Server half: select from the ClientHello offer, answer in the ServerHello

use tracing::{debug, warn};

use super::transcript::replay;
use super::{abandoned, check_rewritable_version, select_protocol, NegotiatedProtocol, StagedRecord};
use crate::engine::{EngineResult, HandshakeStatus, TlsContext, TlsEngine};
use crate::error::{ConduitError, Result};
use crate::protocol::constants::*;
use crate::protocol::extensions::encode_alpn_extension;
use crate::protocol::hello::{parse_client_hello, parse_server_hello};
use crate::protocol::record::{handshake_messages, split_record};
use crate::protocol::rewrite::{append_extension, encode_handshake_record};

#[derive(Debug)]
enum ServerPhase {
    /// ClientHello not seen yet
    AwaitOffer,
    /// Protocol selected; the ServerHello has not gone out
    Answer { client_hello: Vec<u8>, protocol: String },
    /// Negotiated, nothing to negotiate, or abandoned
    PassThrough,
}

/// Server engine wrapper answering ALPN offers for engines without ALPN support
pub struct AlpnServerEngine<E> {
    inner: E,
    /// Supported protocols in preference order
    protocols: Vec<String>,
    phase: ServerPhase,
    negotiated: NegotiatedProtocol,
    staged: Option<StagedRecord>,
}

impl<E: TlsEngine> AlpnServerEngine<E> {
    pub fn new(inner: E, protocols: Vec<String>) -> Self {
        let phase = if protocols.is_empty() { ServerPhase::PassThrough } else { ServerPhase::AwaitOffer };
        Self { inner, protocols, phase, negotiated: NegotiatedProtocol::new(), staged: None }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn negotiated(&self) -> &NegotiatedProtocol {
        &self.negotiated
    }

    fn abandon(&mut self, reason: &str) {
        warn!(reason, "ALPN negotiation abandoned, continuing without it");
        self.phase = ServerPhase::PassThrough;
    }

    /// The received ClientHello and the protocol to answer with, if any
    fn read_offer(&mut self, fragment: &[u8]) -> Result<Option<(Vec<u8>, String)>> {
        let messages = handshake_messages(fragment).map_err(abandoned)?;
        let Some(client_hello) = messages.first() else {
            return Err(abandoned("empty handshake record"));
        };
        let parsed = parse_client_hello(client_hello).map_err(abandoned)?;
        let Some(offer) = parsed.alpn_protocols().map_err(abandoned)? else {
            return Ok(None);
        };
        check_rewritable_version(parsed.version)?;

        let Some(protocol) = select_protocol(&self.protocols, &offer) else {
            debug!(offered = ?offer, supported = ?self.protocols, "no common application protocol");
            return Ok(None);
        };
        if self.inner.transcript().is_none() {
            return Err(abandoned("engine exposes no transcript hook"));
        }
        Ok(Some((client_hello.to_vec(), protocol)))
    }

    /// Inject the selection into the ServerHello flight in `output`
    fn answer(&mut self, output: &[u8], client_hello: &[u8], protocol: &str) -> Result<Vec<u8>> {
        let (header, fragment) = split_record(output).map_err(abandoned)?;
        if header.content_type != TLS_RECORD_HANDSHAKE {
            return Err(abandoned("first server record is not a handshake record"));
        }
        if header.record_len() != output.len() {
            return Err(abandoned("ServerHello flight spans records"));
        }
        let messages = handshake_messages(fragment).map_err(abandoned)?;
        let Some((server_hello, rest)) = messages.split_first() else {
            return Err(abandoned("empty handshake record"));
        };
        let parsed = parse_server_hello(server_hello).map_err(abandoned)?;
        check_rewritable_version(parsed.version)?;
        if parsed.has_extension(extension_type::ALPN) {
            return Err(abandoned("ServerHello already carries ALPN"));
        }

        let extension = encode_alpn_extension(&[protocol]).map_err(abandoned)?;
        let rewritten = append_extension(server_hello, &extension).map_err(abandoned)?;
        let mut flight: Vec<&[u8]> = Vec::with_capacity(messages.len());
        flight.push(&rewritten);
        flight.extend(rest.iter().copied());
        let record = encode_handshake_record(header.version, &flight).map_err(abandoned)?;

        let transcript = self.inner.transcript().ok_or_else(|| abandoned("engine exposes no transcript hook"))?;
        self.negotiated.set(protocol)?;
        let mut wire: Vec<&[u8]> = Vec::with_capacity(flight.len() + 1);
        wire.push(client_hello);
        wire.extend(flight.iter().copied());
        replay(transcript, &wire);
        Ok(record)
    }
}

impl<E: TlsEngine> TlsEngine for AlpnServerEngine<E> {
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult> {
        if let Some(result) = StagedRecord::flush(&mut self.staged, dst) {
            return Ok(result);
        }
        if !matches!(self.phase, ServerPhase::Answer { .. }) {
            return self.inner.wrap(src, dst);
        }

        let result = self.inner.wrap(src, dst)?;
        if result.bytes_produced == 0 {
            return Ok(result);
        }
        let ServerPhase::Answer { client_hello, protocol } = std::mem::replace(&mut self.phase, ServerPhase::PassThrough)
        else {
            return Ok(result);
        };
        match self.answer(&dst[..result.bytes_produced], &client_hello, &protocol) {
            Ok(record) => {
                debug!(protocol = %protocol, "ALPN selection added to ServerHello");
                Ok(StagedRecord::emit(record, result.handshake_status, dst, &mut self.staged))
            }
            Err(ConduitError::NegotiationAbandoned(reason)) => {
                self.abandon(&reason);
                Ok(result)
            }
            Err(e) => Err(e),
        }
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult> {
        if !matches!(self.phase, ServerPhase::AwaitOffer) {
            return self.inner.unwrap(src, dst);
        }
        let fragment = match split_record(src) {
            Ok((header, fragment)) if header.content_type == TLS_RECORD_HANDSHAKE => fragment,
            _ => return self.inner.unwrap(src, dst),
        };

        let decision = self.read_offer(fragment);
        let result = self.inner.unwrap(src, dst)?;
        if result.bytes_consumed == 0 {
            return Ok(result);
        }
        match decision {
            Ok(Some((client_hello, protocol))) => {
                debug!(protocol = %protocol, "application protocol selected");
                self.phase = ServerPhase::Answer { client_hello, protocol };
            }
            Ok(None) => self.phase = ServerPhase::PassThrough,
            Err(ConduitError::NegotiationAbandoned(reason)) => self.abandon(&reason),
            Err(e) => return Err(e),
        }
        Ok(result)
    }

    fn handshake_status(&self) -> HandshakeStatus {
        if self.staged.is_some() {
            return HandshakeStatus::NeedWrap;
        }
        self.inner.handshake_status()
    }

    fn packet_buffer_size(&self) -> usize {
        // extensions block length, extension header, list length, one name
        let longest = self.protocols.iter().map(String::len).max().unwrap_or(0);
        self.inner.packet_buffer_size() + longest + 9
    }

    fn application_protocol(&self) -> Option<String> {
        self.negotiated.get().map(str::to_string).or_else(|| self.inner.application_protocol())
    }

    forward_to_inner!();
}

// ============= Context =============

/// Wraps every engine of `inner` in an [`AlpnServerEngine`]
pub struct AlpnServerContext<C> {
    inner: C,
    protocols: Vec<String>,
}

impl<C: TlsContext> AlpnServerContext<C> {
    pub fn new(inner: C, protocols: Vec<String>) -> Self {
        Self { inner, protocols }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: TlsContext> TlsContext for AlpnServerContext<C> {
    type Engine = AlpnServerEngine<C::Engine>;

    fn create_engine(&self) -> Result<Self::Engine> {
        Ok(AlpnServerEngine::new(self.inner.create_engine()?, self.protocols.clone()))
    }
}
