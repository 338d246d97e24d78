//! Client half: offer protocols in the ClientHello, read the ServerHello answer

use tracing::{debug, warn};

use super::transcript::replay;
use super::{abandoned, check_rewritable_version, NegotiatedProtocol, StagedRecord};
use crate::engine::{EngineResult, HandshakeStatus, TlsContext, TlsEngine};
use crate::error::{ConduitError, Result};
use crate::protocol::constants::*;
use crate::protocol::extensions::{encode_alpn_extension, parse_alpn};
use crate::protocol::hello::{parse_client_hello, parse_server_hello};
use crate::protocol::record::{handshake_messages, split_record, ProtocolVersion};
use crate::protocol::rewrite::{append_extension, encode_handshake_record, remove_extension};

#[derive(Debug)]
enum ClientPhase {
    /// ClientHello not sent yet
    Offer,
    /// Offer sent; holds the ClientHello exactly as it went out
    AwaitAnswer { sent_hello: Vec<u8> },
    /// Negotiated, declined or abandoned
    PassThrough,
}

/// ServerHello answer with the ALPN extension taken out
struct Answer {
    /// Record as the engine gets to see it
    record: Vec<u8>,
    /// Handshake messages as they arrived
    received: Vec<Vec<u8>>,
    protocol: String,
}

/// Client engine wrapper adding an ALPN offer to engines without ALPN support
pub struct AlpnClientEngine<E> {
    inner: E,
    protocols: Vec<String>,
    phase: ClientPhase,
    negotiated: NegotiatedProtocol,
    staged: Option<StagedRecord>,
}

impl<E: TlsEngine> AlpnClientEngine<E> {
    pub fn new(inner: E, protocols: Vec<String>) -> Self {
        let phase = if protocols.is_empty() { ClientPhase::PassThrough } else { ClientPhase::Offer };
        Self { inner, protocols, phase, negotiated: NegotiatedProtocol::new(), staged: None }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    pub fn negotiated(&self) -> &NegotiatedProtocol {
        &self.negotiated
    }

    fn abandon(&mut self, reason: &str) {
        warn!(reason, "ALPN negotiation abandoned, continuing without it");
        self.phase = ClientPhase::PassThrough;
    }

    /// Append the offer to the ClientHello record in `output`. Returns the
    /// rewritten record and the rewritten hello message.
    fn offer(&mut self, output: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let (header, fragment) = split_record(output).map_err(abandoned)?;
        if header.content_type != TLS_RECORD_HANDSHAKE {
            return Err(abandoned("first client record is not a handshake record"));
        }
        if header.record_len() != output.len() {
            return Err(abandoned("ClientHello output spans records"));
        }
        let messages = handshake_messages(fragment).map_err(abandoned)?;
        let [hello] = messages.as_slice() else {
            return Err(abandoned("record carries more than the ClientHello"));
        };
        let parsed = parse_client_hello(hello).map_err(abandoned)?;
        check_rewritable_version(parsed.version)?;
        if parsed.has_extension(extension_type::ALPN) {
            return Err(abandoned("ClientHello already offers ALPN"));
        }

        let extension = encode_alpn_extension(&self.protocols).map_err(abandoned)?;
        let rewritten = append_extension(hello, &extension).map_err(abandoned)?;
        let record = encode_handshake_record(header.version, &[&rewritten]).map_err(abandoned)?;

        let transcript = self.inner.transcript().ok_or_else(|| abandoned("engine exposes no transcript hook"))?;
        replay(transcript, &[&rewritten]);
        Ok((record, rewritten))
    }

    /// Inspect the ServerHello record at the front of `fragment`.
    /// `None` when the server did not answer the offer.
    fn read_answer(&self, version: ProtocolVersion, fragment: &[u8]) -> Result<Option<Answer>> {
        let messages = handshake_messages(fragment).map_err(abandoned)?;
        let Some((server_hello, rest)) = messages.split_first() else {
            return Err(abandoned("empty handshake record"));
        };
        let parsed = parse_server_hello(server_hello).map_err(abandoned)?;
        check_rewritable_version(parsed.version)?;

        let Some((stripped, body)) = remove_extension(server_hello, extension_type::ALPN).map_err(abandoned)? else {
            return Ok(None);
        };
        let mut selected = parse_alpn(&body)?;
        if selected.len() != 1 {
            return Err(ConduitError::Protocol(format!("server selected {} ALPN protocols", selected.len())));
        }
        let protocol = selected.remove(0);
        if !self.protocols.contains(&protocol) {
            return Err(ConduitError::Protocol(format!("server selected unoffered protocol {:?}", protocol)));
        }

        let mut forwarded: Vec<&[u8]> = Vec::with_capacity(messages.len());
        forwarded.push(&stripped);
        forwarded.extend(rest.iter().copied());
        let record = encode_handshake_record(version, &forwarded)?;

        Ok(Some(Answer { record, received: messages.iter().map(|m| m.to_vec()).collect(), protocol }))
    }
}

impl<E: TlsEngine> TlsEngine for AlpnClientEngine<E> {
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult> {
        if let Some(result) = StagedRecord::flush(&mut self.staged, dst) {
            return Ok(result);
        }
        if !matches!(self.phase, ClientPhase::Offer) {
            return self.inner.wrap(src, dst);
        }

        let result = self.inner.wrap(src, dst)?;
        if result.bytes_produced == 0 {
            return Ok(result);
        }
        match self.offer(&dst[..result.bytes_produced]) {
            Ok((record, sent_hello)) => {
                debug!(protocols = ?self.protocols, "ALPN offer added to ClientHello");
                self.phase = ClientPhase::AwaitAnswer { sent_hello };
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
        let sent_hello = match self.phase {
            ClientPhase::AwaitAnswer { ref sent_hello } => sent_hello.clone(),
            _ => return self.inner.unwrap(src, dst),
        };
        let (header, fragment) = match split_record(src) {
            Ok(parts) if parts.0.content_type == TLS_RECORD_HANDSHAKE => parts,
            // incomplete or not ours: the engine decides
            _ => return self.inner.unwrap(src, dst),
        };

        let answer = match self.read_answer(header.version, fragment) {
            Ok(Some(answer)) => answer,
            Ok(None) => {
                debug!("server did not select an application protocol");
                self.phase = ClientPhase::PassThrough;
                return self.inner.unwrap(src, dst);
            }
            Err(ConduitError::NegotiationAbandoned(reason)) => {
                self.abandon(&reason);
                return self.inner.unwrap(src, dst);
            }
            Err(e) => return Err(e),
        };

        let result = self.inner.unwrap(&answer.record, dst)?;
        if result.bytes_consumed == 0 {
            return Ok(result);
        }
        if result.bytes_consumed != answer.record.len() {
            return Err(ConduitError::Protocol("engine consumed part of a rewritten ServerHello record".into()));
        }

        let transcript = self
            .inner
            .transcript()
            .ok_or_else(|| ConduitError::Protocol("transcript hook disappeared mid-handshake".into()))?;
        let mut wire: Vec<&[u8]> = Vec::with_capacity(answer.received.len() + 1);
        wire.push(&sent_hello);
        wire.extend(answer.received.iter().map(Vec::as_slice));
        replay(transcript, &wire);

        self.negotiated.set(answer.protocol.as_str())?;
        debug!(protocol = %answer.protocol, "ALPN negotiated");
        self.phase = ClientPhase::PassThrough;
        Ok(EngineResult { bytes_consumed: header.record_len(), ..result })
    }

    fn handshake_status(&self) -> HandshakeStatus {
        if self.staged.is_some() {
            return HandshakeStatus::NeedWrap;
        }
        self.inner.handshake_status()
    }

    fn packet_buffer_size(&self) -> usize {
        // extensions block length, extension header, list length, names
        let offer: usize = self.protocols.iter().map(|p| p.len() + 1).sum();
        self.inner.packet_buffer_size() + offer + 8
    }

    fn application_protocol(&self) -> Option<String> {
        self.negotiated.get().map(str::to_string).or_else(|| self.inner.application_protocol())
    }

    forward_to_inner!();
}

// ============= Context =============

/// Wraps every engine of `inner` in an [`AlpnClientEngine`]
pub struct AlpnClientContext<C> {
    inner: C,
    protocols: Vec<String>,
}

impl<C: TlsContext> AlpnClientContext<C> {
    pub fn new(inner: C, protocols: Vec<String>) -> Self {
        Self { inner, protocols }
    }
}

impl<C: TlsContext> TlsContext for AlpnClientContext<C> {
    type Engine = AlpnClientEngine<C::Engine>;

    fn create_engine(&self) -> Result<Self::Engine> {
        Ok(AlpnClientEngine::new(self.inner.create_engine()?, self.protocols.clone()))
    }
}
