//! Test doubles: a toy TLS engine, in-memory transports, a manual executor
//!
//! The toy engine speaks real ClientHello/ServerHello bytes in plaintext
//! handshake records and authenticates the handshake with a Finished message
//! carrying the SHA-256 transcript, so any disagreement between what the two
//! sides hashed fails the handshake. Application records are "protected"
//! with a XOR mask.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{
    ClientAuth, DelegatedTask, EngineOptions, EngineResult, HandshakeStatus, SessionInfo, Status, TlsContext,
    TlsEngine,
};
use crate::alpn::transcript::{Sha256Transcript, TranscriptHash};
use crate::conduit::executor::{Job, TaskExecutor};
use crate::error::{CodecError, ConduitError, Result};
use crate::protocol::constants::*;
use crate::protocol::extensions::{encode_alpn_extension, encode_server_name_extension};
use crate::protocol::hello::{build_client_hello, build_server_hello, parse_client_hello, parse_server_hello};
use crate::protocol::record::{encode_handshake, expect_handshake, handshake_messages, split_record, ProtocolVersion};
use crate::protocol::rewrite::encode_handshake_record;
use crate::transport::Transport;

pub const TOY_CIPHER_SUITE: u16 = 0xc02f;
const XOR_MASK: u8 = 0x5a;

// ============= Toy Engine =============

#[derive(Debug, Clone)]
pub struct ToyConfig {
    /// Identifies the context an engine came from
    pub label: String,
    /// Client only: host name sent in the SNI extension
    pub server_name: Option<String>,
    /// Client only: version field of the ClientHello
    pub hello_version: ProtocolVersion,
    /// Delegated tasks required once per handshake
    pub delegated_tasks: usize,
    /// Largest application fragment per record
    pub max_fragment: usize,
    pub packet_size: usize,
    pub expose_transcript: bool,
    pub certificate_len: usize,
}

impl Default for ToyConfig {
    fn default() -> Self {
        Self {
            label: "default".to_string(),
            server_name: None,
            hello_version: ProtocolVersion::TLS_V1_2,
            delegated_tasks: 0,
            max_fragment: MAX_PLAINTEXT_LEN,
            packet_size: MAX_PACKET_LEN,
            expose_transcript: true,
            certificate_len: 64,
        }
    }
}

impl ToyConfig {
    pub fn labeled(label: &str) -> Self {
        Self { label: label.to_string(), ..Self::default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    SendHello,
    AwaitHello,
    AwaitFlight,
    SendFlight,
    SendFinished,
    AwaitFinished,
    Tasks,
    Done,
    Failed,
}

pub struct ToyEngine {
    config: ToyConfig,
    client: bool,
    phase: Phase,
    after_tasks: Phase,
    pending_tasks: Vec<DelegatedTask>,
    tasks_remaining: Arc<AtomicUsize>,
    transcript: Sha256Transcript,
    staged: Option<Vec<u8>>,
    alert: Option<u8>,
    close_pending: bool,
    inbound_done: bool,
    outbound_done: bool,
    options: EngineOptions,
    server_names: Vec<String>,
    offered_alpn: Option<Vec<String>>,
}

impl ToyEngine {
    pub fn client(config: ToyConfig) -> Self {
        Self::new(config, true)
    }

    pub fn server(config: ToyConfig) -> Self {
        Self::new(config, false)
    }

    fn new(config: ToyConfig, client: bool) -> Self {
        Self {
            config,
            client,
            phase: Phase::Idle,
            after_tasks: Phase::Idle,
            pending_tasks: Vec::new(),
            tasks_remaining: Arc::new(AtomicUsize::new(0)),
            transcript: Sha256Transcript::new(),
            staged: None,
            alert: None,
            close_pending: false,
            inbound_done: false,
            outbound_done: false,
            options: EngineOptions::default(),
            server_names: Vec::new(),
            offered_alpn: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    pub fn applied_options(&self) -> &EngineOptions {
        &self.options
    }

    /// Server only: SNI names seen in the ClientHello
    pub fn received_server_names(&self) -> &[String] {
        &self.server_names
    }

    /// Server only: ALPN list seen in the ClientHello
    pub fn received_alpn(&self) -> Option<&[String]> {
        self.offered_alpn.as_deref()
    }

    pub fn is_established(&self) -> bool {
        self.phase == Phase::Done
    }

    fn phase_status(&self, phase: Phase) -> HandshakeStatus {
        match phase {
            Phase::SendHello | Phase::SendFlight | Phase::SendFinished => HandshakeStatus::NeedWrap,
            Phase::AwaitHello | Phase::AwaitFlight | Phase::AwaitFinished => HandshakeStatus::NeedUnwrap,
            Phase::Tasks => {
                if self.tasks_remaining.load(Ordering::SeqCst) > 0 {
                    HandshakeStatus::NeedTask
                } else {
                    self.phase_status(self.after_tasks)
                }
            }
            Phase::Idle | Phase::Done | Phase::Failed => HandshakeStatus::NotHandshaking,
        }
    }

    fn resolve_tasks(&mut self) {
        if self.phase == Phase::Tasks && self.tasks_remaining.load(Ordering::SeqCst) == 0 {
            self.phase = self.after_tasks;
        }
    }

    fn enter_tasks_or(&mut self, next: Phase) {
        let count = self.config.delegated_tasks;
        if count == 0 {
            self.phase = next;
            return;
        }
        self.tasks_remaining.store(count, Ordering::SeqCst);
        for _ in 0..count {
            let remaining = self.tasks_remaining.clone();
            self.pending_tasks.push(Box::new(move || {
                remaining.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        self.phase = Phase::Tasks;
        self.after_tasks = next;
    }

    fn fail(&mut self, alert_desc: u8, err: impl Into<ConduitError>) -> ConduitError {
        self.phase = Phase::Failed;
        self.alert = Some(alert_desc);
        err.into()
    }

    fn build_output(&mut self) -> Result<Vec<u8>> {
        let record = match self.phase {
            Phase::SendHello => {
                let extensions = match self.config.server_name {
                    Some(ref host) => Some(encode_server_name_extension(host)?),
                    None => None,
                };
                let hello = build_client_hello(
                    self.config.hello_version,
                    &[0xC1; RANDOM_LEN],
                    &[],
                    &[TOY_CIPHER_SUITE, 0x009c],
                    extensions.as_deref(),
                )?;
                self.transcript.update(&hello);
                encode_handshake_record(ProtocolVersion::TLS_V1_0, &[&hello])?
            }
            Phase::SendFlight => {
                let hello = build_server_hello(ProtocolVersion::TLS_V1_2, &[0x5E; RANDOM_LEN], &[], TOY_CIPHER_SUITE, None)?;
                let certificate = encode_handshake(handshake_type::CERTIFICATE, &vec![0xCE; self.config.certificate_len])?;
                let done = encode_handshake(handshake_type::SERVER_HELLO_DONE, &[])?;
                for message in [&hello, &certificate, &done] {
                    self.transcript.update(message);
                }
                encode_handshake_record(ProtocolVersion::TLS_V1_2, &[&hello, &certificate, &done])?
            }
            Phase::SendFinished => {
                let finished = encode_handshake(handshake_type::FINISHED, &self.transcript.current_hash())?;
                self.transcript.update(&finished);
                encode_handshake_record(ProtocolVersion::TLS_V1_2, &[&finished])?
            }
            other => {
                return Err(ConduitError::Protocol(format!("nothing to send in {:?}", other)));
            }
        };
        Ok(record)
    }

    /// Returns true when this record completed the handshake
    fn process_handshake(&mut self, fragment: &[u8]) -> Result<bool> {
        let messages = handshake_messages(fragment).map_err(|e| self.fail(alert::DECODE_ERROR, e))?;
        let Some(first) = messages.first().copied() else {
            return Err(self.fail(alert::DECODE_ERROR, ConduitError::Protocol("empty handshake record".into())));
        };

        match self.phase {
            Phase::AwaitHello => {
                let hello = parse_client_hello(first).map_err(|e| self.fail(alert::DECODE_ERROR, e))?;
                self.server_names = hello
                    .server_names()
                    .map_err(|e| self.fail(alert::DECODE_ERROR, e))?
                    .into_iter()
                    .map(|n| n.as_str().to_string())
                    .collect();
                self.offered_alpn = hello.alpn_protocols().map_err(|e| self.fail(alert::DECODE_ERROR, e))?;
                self.transcript.update(first);
                self.enter_tasks_or(Phase::SendFlight);
                Ok(false)
            }
            Phase::AwaitFlight => {
                let hello = parse_server_hello(first).map_err(|e| self.fail(alert::DECODE_ERROR, e))?;
                if hello.has_extension(extension_type::ALPN) {
                    return Err(self.fail(
                        alert::HANDSHAKE_FAILURE,
                        ConduitError::Protocol("unsolicited ALPN extension in ServerHello".into()),
                    ));
                }
                let last = messages[messages.len() - 1];
                if last[0] != handshake_type::SERVER_HELLO_DONE {
                    return Err(self.fail(
                        alert::UNEXPECTED_MESSAGE,
                        CodecError::UnexpectedMessageType {
                            expected: handshake_type::SERVER_HELLO_DONE,
                            got: last[0],
                        },
                    ));
                }
                for message in &messages {
                    self.transcript.update(message);
                }
                self.enter_tasks_or(Phase::SendFinished);
                Ok(false)
            }
            Phase::AwaitFinished => {
                let header = expect_handshake(first, handshake_type::FINISHED)
                    .map_err(|e| self.fail(alert::UNEXPECTED_MESSAGE, e))?;
                let verify = &first[HANDSHAKE_HEADER_SIZE..header.message_len()];
                if verify != self.transcript.current_hash().as_slice() {
                    return Err(self.fail(
                        alert::HANDSHAKE_FAILURE,
                        ConduitError::Protocol("Finished verify data mismatch".into()),
                    ));
                }
                self.transcript.update(first);
                if self.client {
                    self.phase = Phase::Done;
                    Ok(true)
                } else {
                    self.phase = Phase::SendFinished;
                    Ok(false)
                }
            }
            other => Err(self.fail(
                alert::UNEXPECTED_MESSAGE,
                ConduitError::Protocol(format!("unexpected handshake record in {:?}", other)),
            )),
        }
    }

    fn emit_alert(&mut self, level: u8, desc: u8, dst: &mut [u8]) -> EngineResult {
        let record = crate::protocol::record::encode_alert(ProtocolVersion::TLS_V1_2, level, desc);
        if dst.len() < record.len() {
            return EngineResult::idle(Status::BufferOverflow, self.handshake_status());
        }
        dst[..record.len()].copy_from_slice(&record);
        self.outbound_done = true;
        EngineResult::new(Status::Closed, HandshakeStatus::NotHandshaking, 0, record.len())
    }
}

impl TlsEngine for ToyEngine {
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult> {
        self.resolve_tasks();

        if let Some(desc) = self.alert {
            let result = self.emit_alert(alert::LEVEL_FATAL, desc, dst);
            if result.status == Status::Closed {
                self.alert = None;
            }
            return Ok(result);
        }
        if self.close_pending {
            let result = self.emit_alert(alert::LEVEL_WARNING, alert::CLOSE_NOTIFY, dst);
            if result.status == Status::Closed {
                self.close_pending = false;
            }
            return Ok(result);
        }
        if self.outbound_done {
            return Ok(EngineResult::idle(Status::Closed, self.handshake_status()));
        }
        if self.phase == Phase::Idle && self.client {
            self.begin_handshake()?;
        }

        match self.phase {
            Phase::SendHello | Phase::SendFlight | Phase::SendFinished => {
                let output = match self.staged.take() {
                    Some(output) => output,
                    None => self.build_output()?,
                };
                if dst.len() < output.len() {
                    self.staged = Some(output);
                    return Ok(EngineResult::idle(Status::BufferOverflow, HandshakeStatus::NeedWrap));
                }
                dst[..output.len()].copy_from_slice(&output);

                let finished = self.phase == Phase::SendFinished && !self.client;
                self.phase = match self.phase {
                    Phase::SendHello => Phase::AwaitFlight,
                    Phase::SendFlight => Phase::AwaitFinished,
                    _ if self.client => Phase::AwaitFinished,
                    _ => Phase::Done,
                };
                let status = if finished { HandshakeStatus::Finished } else { self.handshake_status() };
                Ok(EngineResult::new(Status::Ok, status, 0, output.len()))
            }
            Phase::Done => {
                if src.is_empty() {
                    return Ok(EngineResult::idle(Status::Ok, HandshakeStatus::NotHandshaking));
                }
                let n = src.len().min(self.config.max_fragment);
                if dst.len() < TLS_HEADER_SIZE + n {
                    return Ok(EngineResult::idle(Status::BufferOverflow, HandshakeStatus::NotHandshaking));
                }
                dst[0] = TLS_RECORD_APPLICATION;
                dst[1..3].copy_from_slice(&TLS_VERSION);
                dst[3..5].copy_from_slice(&(n as u16).to_be_bytes());
                for (out, byte) in dst[TLS_HEADER_SIZE..TLS_HEADER_SIZE + n].iter_mut().zip(&src[..n]) {
                    *out = byte ^ XOR_MASK;
                }
                Ok(EngineResult::new(Status::Ok, HandshakeStatus::NotHandshaking, n, TLS_HEADER_SIZE + n))
            }
            _ => Ok(EngineResult::idle(Status::Ok, self.handshake_status())),
        }
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult> {
        self.resolve_tasks();

        if self.inbound_done {
            return Ok(EngineResult::idle(Status::Closed, self.handshake_status()));
        }

        let (header, fragment) = match split_record(src) {
            Ok(parts) => parts,
            Err(e) if e.is_underflow() => {
                return Ok(EngineResult::idle(Status::BufferUnderflow, self.handshake_status()));
            }
            Err(e) => return Err(self.fail(alert::DECODE_ERROR, e)),
        };
        let consumed = header.record_len();

        match header.content_type {
            TLS_RECORD_ALERT => {
                self.inbound_done = true;
                if fragment == [alert::LEVEL_WARNING, alert::CLOSE_NOTIFY] {
                    Ok(EngineResult::new(Status::Closed, self.handshake_status(), consumed, 0))
                } else {
                    self.phase = Phase::Failed;
                    Err(ConduitError::Protocol(format!("received alert {:?}", fragment)))
                }
            }
            TLS_RECORD_HANDSHAKE => {
                if self.phase == Phase::Idle && !self.client {
                    self.begin_handshake()?;
                }
                let finished = self.process_handshake(fragment)?;
                let status = if finished { HandshakeStatus::Finished } else { self.handshake_status() };
                Ok(EngineResult::new(Status::Ok, status, consumed, 0))
            }
            TLS_RECORD_APPLICATION => {
                if self.phase != Phase::Done {
                    return Err(self.fail(
                        alert::UNEXPECTED_MESSAGE,
                        ConduitError::Protocol("application data before handshake completion".into()),
                    ));
                }
                if dst.len() < fragment.len() {
                    return Ok(EngineResult::idle(Status::BufferOverflow, HandshakeStatus::NotHandshaking));
                }
                for (out, byte) in dst.iter_mut().zip(fragment) {
                    *out = byte ^ XOR_MASK;
                }
                Ok(EngineResult::new(Status::Ok, HandshakeStatus::NotHandshaking, consumed, fragment.len()))
            }
            TLS_RECORD_CHANGE_CIPHER => Ok(EngineResult::new(Status::Ok, self.handshake_status(), consumed, 0)),
            other => Err(self.fail(
                alert::UNEXPECTED_MESSAGE,
                ConduitError::Protocol(format!("unknown content type 0x{:02x}", other)),
            )),
        }
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        self.pending_tasks.pop()
    }

    fn handshake_status(&self) -> HandshakeStatus {
        if self.close_pending || self.alert.is_some() {
            return HandshakeStatus::NeedWrap;
        }
        self.phase_status(self.phase)
    }

    fn begin_handshake(&mut self) -> Result<()> {
        if self.phase == Phase::Idle {
            self.phase = if self.client { Phase::SendHello } else { Phase::AwaitHello };
        }
        Ok(())
    }

    fn close_inbound(&mut self) -> Result<()> {
        self.inbound_done = true;
        Ok(())
    }

    fn close_outbound(&mut self) {
        if !self.outbound_done {
            self.close_pending = true;
        }
    }

    fn is_inbound_done(&self) -> bool {
        self.inbound_done
    }

    fn is_outbound_done(&self) -> bool {
        self.outbound_done
    }

    fn packet_buffer_size(&self) -> usize {
        self.config.packet_size
    }

    fn application_buffer_size(&self) -> usize {
        self.config.max_fragment
    }

    fn set_enabled_cipher_suites(&mut self, suites: &[String]) {
        self.options.cipher_suites = Some(suites.to_vec());
    }

    fn set_enabled_protocols(&mut self, protocols: &[String]) {
        self.options.protocols = Some(protocols.to_vec());
    }

    fn set_client_auth(&mut self, mode: ClientAuth) {
        self.options.client_auth = Some(mode);
    }

    fn set_enable_session_creation(&mut self, enabled: bool) {
        self.options.session_creation = Some(enabled);
    }

    fn use_client_mode(&self) -> bool {
        self.client
    }

    fn session_info(&self) -> Option<SessionInfo> {
        (self.phase == Phase::Done).then(|| SessionInfo {
            protocol: ProtocolVersion::TLS_V1_2.name().to_string(),
            cipher_suite: "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256".to_string(),
        })
    }

    fn transcript(&mut self) -> Option<&mut dyn TranscriptHash> {
        if self.config.expose_transcript {
            Some(&mut self.transcript)
        } else {
            None
        }
    }
}

// ============= Toy Context =============

pub struct ToyContext {
    config: ToyConfig,
    client: bool,
    created: Arc<AtomicUsize>,
}

impl ToyContext {
    pub fn server(config: ToyConfig) -> Self {
        Self { config, client: false, created: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn client(config: ToyConfig) -> Self {
        Self { config, client: true, created: Arc::new(AtomicUsize::new(0)) }
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    /// Engines created so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl TlsContext for ToyContext {
    type Engine = ToyEngine;

    fn create_engine(&self) -> Result<ToyEngine> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(ToyEngine::new(self.config.clone(), self.client))
    }
}

/// Drive two engines against each other until neither is handshaking.
///
/// Delegated tasks run inline. Returns the number of records exchanged.
pub fn run_handshake<C: TlsEngine + ?Sized, S: TlsEngine + ?Sized>(client: &mut C, server: &mut S) -> Result<usize> {
    let mut to_server: Vec<u8> = Vec::new();
    let mut to_client: Vec<u8> = Vec::new();
    let mut scratch = vec![0u8; MAX_PACKET_LEN * 2];
    let mut records = 0;
    let mut client_done = false;
    let mut server_done = false;

    client.begin_handshake()?;
    server.begin_handshake()?;

    for _ in 0..64 {
        if client_done && server_done {
            return Ok(records);
        }
        client_done |= step(client, &mut to_client, &mut to_server, &mut scratch, &mut records)?;
        server_done |= step(server, &mut to_server, &mut to_client, &mut scratch, &mut records)?;
    }
    if client_done && server_done {
        return Ok(records);
    }
    Err(ConduitError::Protocol("handshake did not converge".into()))
}

fn step<E: TlsEngine + ?Sized>(
    engine: &mut E,
    inbox: &mut Vec<u8>,
    outbox: &mut Vec<u8>,
    scratch: &mut [u8],
    records: &mut usize,
) -> Result<bool> {
    match engine.handshake_status() {
        HandshakeStatus::NeedTask => {
            while let Some(task) = engine.delegated_task() {
                task();
            }
            Ok(false)
        }
        HandshakeStatus::NeedWrap => {
            let result = engine.wrap(&[], scratch)?;
            outbox.extend_from_slice(&scratch[..result.bytes_produced]);
            *records += 1;
            Ok(result.handshake_status == HandshakeStatus::Finished)
        }
        HandshakeStatus::NeedUnwrap => {
            if inbox.is_empty() {
                return Ok(false);
            }
            let result = engine.unwrap(inbox, scratch)?;
            inbox.drain(..result.bytes_consumed);
            Ok(result.handshake_status == HandshakeStatus::Finished)
        }
        HandshakeStatus::Finished | HandshakeStatus::NotHandshaking => Ok(true),
    }
}

/// ClientHello record with optional SNI and ALPN, as a browser would send
pub fn client_hello_record(server_name: Option<&str>, alpn: Option<&[&str]>) -> Vec<u8> {
    let mut extensions = Vec::new();
    if let Some(host) = server_name {
        extensions.extend_from_slice(&encode_server_name_extension(host).unwrap());
    }
    if let Some(protocols) = alpn {
        extensions.extend_from_slice(&encode_alpn_extension(protocols).unwrap());
    }
    // padding-style opaque extension that must pass through untouched
    extensions.extend_from_slice(&[0x00, 0x15, 0x00, 0x02, 0x00, 0x00]);
    let hello = build_client_hello(ProtocolVersion::TLS_V1_2, &[0xAB; 32], &[0x01; 32], &[0xc02f, 0xc030], Some(&extensions))
        .unwrap();
    encode_handshake_record(ProtocolVersion::TLS_V1_0, &[&hello]).unwrap()
}

// ============= In-Memory Transport =============

#[derive(Default)]
struct Pipe {
    data: Mutex<VecDeque<u8>>,
    writer_closed: AtomicBool,
}

/// One end of an in-memory duplex channel with fragmentation control
pub struct MemoryTransport {
    inbound: Arc<Pipe>,
    outbound: Arc<Pipe>,
    read_chunk: AtomicUsize,
    write_limit: AtomicUsize,
    write_blocked: AtomicBool,
    reads_resumed: AtomicBool,
    writes_resumed: AtomicBool,
    read_wakeups: AtomicUsize,
    write_wakeups: AtomicUsize,
    read_shut: AtomicBool,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(Pipe::default());
        let b_to_a = Arc::new(Pipe::default());
        (Self::new(b_to_a.clone(), a_to_b.clone()), Self::new(a_to_b, b_to_a))
    }

    fn new(inbound: Arc<Pipe>, outbound: Arc<Pipe>) -> Self {
        Self {
            inbound,
            outbound,
            read_chunk: AtomicUsize::new(usize::MAX),
            write_limit: AtomicUsize::new(usize::MAX),
            write_blocked: AtomicBool::new(false),
            reads_resumed: AtomicBool::new(false),
            writes_resumed: AtomicBool::new(false),
            read_wakeups: AtomicUsize::new(0),
            write_wakeups: AtomicUsize::new(0),
            read_shut: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Deliver at most `n` bytes per `try_read`
    pub fn set_read_chunk(&self, n: usize) {
        self.read_chunk.store(n, Ordering::SeqCst);
    }

    /// Accept at most `n` bytes per `try_write`
    pub fn set_write_limit(&self, n: usize) {
        self.write_limit.store(n, Ordering::SeqCst);
    }

    pub fn set_write_blocked(&self, blocked: bool) {
        self.write_blocked.store(blocked, Ordering::SeqCst);
    }

    /// Bytes waiting to be read by this end
    pub fn available(&self) -> usize {
        self.inbound.data.lock().len()
    }

    /// Take everything waiting to be read by this end
    pub fn drain(&self) -> Vec<u8> {
        self.inbound.data.lock().drain(..).collect()
    }

    /// Queue bytes as if the peer wrote them
    pub fn inject(&self, bytes: &[u8]) {
        self.inbound.data.lock().extend(bytes.iter().copied());
    }

    /// Peer closes its write side
    pub fn inject_eof(&self) {
        self.inbound.writer_closed.store(true, Ordering::SeqCst);
    }

    pub fn reads_armed(&self) -> bool {
        self.reads_resumed.load(Ordering::SeqCst)
    }

    pub fn writes_armed(&self) -> bool {
        self.writes_resumed.load(Ordering::SeqCst)
    }

    pub fn read_wakeups(&self) -> usize {
        self.read_wakeups.load(Ordering::SeqCst)
    }

    pub fn write_wakeups(&self) -> usize {
        self.write_wakeups.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_write_shutdown(&self) -> bool {
        self.outbound.writer_closed.load(Ordering::SeqCst)
    }
}

impl Transport for MemoryTransport {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.read_shut.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let mut data = self.inbound.data.lock();
        if data.is_empty() {
            if self.inbound.writer_closed.load(Ordering::SeqCst) {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(data.len()).min(self.read_chunk.load(Ordering::SeqCst));
        for (slot, byte) in buf.iter_mut().zip(data.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) || self.outbound.writer_closed.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = buf.len().min(self.write_limit.load(Ordering::SeqCst));
        if self.write_blocked.load(Ordering::SeqCst) || (n == 0 && !buf.is_empty()) {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.outbound.data.lock().extend(buf[..n].iter().copied());
        Ok(n)
    }

    fn resume_reads(&self) {
        self.reads_resumed.store(true, Ordering::SeqCst);
    }

    fn suspend_reads(&self) {
        self.reads_resumed.store(false, Ordering::SeqCst);
    }

    fn wake_up_reads(&self) {
        self.resume_reads();
        self.read_wakeups.fetch_add(1, Ordering::SeqCst);
    }

    fn resume_writes(&self) {
        self.writes_resumed.store(true, Ordering::SeqCst);
    }

    fn suspend_writes(&self) {
        self.writes_resumed.store(false, Ordering::SeqCst);
    }

    fn wake_up_writes(&self) {
        self.resume_writes();
        self.write_wakeups.fetch_add(1, Ordering::SeqCst);
    }

    fn shutdown_read(&self) -> io::Result<()> {
        self.read_shut.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown_write(&self) -> io::Result<()> {
        self.outbound.writer_closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        self.read_shut.store(true, Ordering::SeqCst);
        self.outbound.writer_closed.store(true, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::from(([127, 0, 0, 1], 4433)))
    }
}

// ============= Manual Executor =============

/// Queues jobs until the test runs them
#[derive(Clone, Default)]
pub struct ManualExecutor {
    jobs: Arc<Mutex<VecDeque<Job>>>,
    rejecting: Arc<AtomicBool>,
}

impl ManualExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Run the oldest queued job outside the queue lock
    pub fn run_one(&self) -> bool {
        let job = self.jobs.lock().pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Run jobs until the queue stays empty; returns how many ran
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }
}

impl TaskExecutor for ManualExecutor {
    fn execute(&self, job: Job) -> Result<()> {
        if self.rejecting.load(Ordering::SeqCst) {
            return Err(ConduitError::DelegatedTaskRejected);
        }
        self.jobs.lock().push_back(job);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toy_engines_complete_handshake() {
        let mut client = ToyEngine::client(ToyConfig { server_name: Some("a.example".into()), ..Default::default() });
        let mut server = ToyEngine::server(ToyConfig::default());
        let records = run_handshake(&mut client, &mut server).unwrap();
        assert_eq!(records, 4);
        assert!(client.is_established());
        assert!(server.is_established());
        assert_eq!(server.received_server_names(), &["a.example".to_string()]);
        assert_eq!(client.session_info().unwrap().protocol, "TLSv1.2");
    }

    #[test]
    fn test_toy_engines_with_tasks() {
        let config = ToyConfig { delegated_tasks: 3, ..Default::default() };
        let mut client = ToyEngine::client(config.clone());
        let mut server = ToyEngine::server(config);
        run_handshake(&mut client, &mut server).unwrap();
        assert!(client.is_established() && server.is_established());
    }

    #[test]
    fn test_finished_detects_transcript_mismatch() {
        let mut client = ToyEngine::client(ToyConfig::default());
        let mut server = ToyEngine::server(ToyConfig::default());
        client.begin_handshake().unwrap();
        server.begin_handshake().unwrap();

        let mut buf = vec![0u8; MAX_PACKET_LEN];
        let mut scratch = vec![0u8; MAX_PACKET_LEN];
        let hello = client.wrap(&[], &mut buf).unwrap();
        server.unwrap(&buf[..hello.bytes_produced], &mut scratch).unwrap();

        // Corrupt the server's view of the transcript
        server.transcript().unwrap().update(b"tampered");

        let flight = server.wrap(&[], &mut buf).unwrap();
        client.unwrap(&buf[..flight.bytes_produced], &mut scratch).unwrap();
        let finished = client.wrap(&[], &mut buf).unwrap();
        let err = server.unwrap(&buf[..finished.bytes_produced], &mut scratch).unwrap_err();
        assert!(err.to_string().contains("Finished"));

        // The failure queues a fatal alert for the next wrap
        let alert_out = server.wrap(&[], &mut buf).unwrap();
        assert_eq!(alert_out.status, Status::Closed);
        assert_eq!(&buf[..alert_out.bytes_produced], &[0x15, 3, 3, 0, 2, alert::LEVEL_FATAL, alert::HANDSHAKE_FAILURE]);
    }

    #[test]
    fn test_application_records_roundtrip() {
        let mut client = ToyEngine::client(ToyConfig { max_fragment: 4, ..Default::default() });
        let mut server = ToyEngine::server(ToyConfig::default());
        run_handshake(&mut client, &mut server).unwrap();

        let mut record = [0u8; 64];
        let wrapped = client.wrap(b"hello", &mut record).unwrap();
        assert_eq!(wrapped.bytes_consumed, 4);
        assert_eq!(record[0], TLS_RECORD_APPLICATION);

        let mut plain = [0u8; 16];
        let unwrapped = server.unwrap(&record[..wrapped.bytes_produced], &mut plain).unwrap();
        assert_eq!(&plain[..unwrapped.bytes_produced], b"hell");

        let short = server.unwrap(&record[..wrapped.bytes_produced - 1], &mut plain).unwrap();
        assert_eq!(short.status, Status::BufferUnderflow);
    }

    #[test]
    fn test_memory_transport_fragmentation() {
        let (a, b) = MemoryTransport::pair();
        a.try_write(b"abcdef").unwrap();
        b.set_read_chunk(2);
        let mut buf = [0u8; 8];
        assert_eq!(b.try_read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ab");
        assert_eq!(b.available(), 4);

        a.set_write_blocked(true);
        assert_eq!(a.try_write(b"x").unwrap_err().kind(), io::ErrorKind::WouldBlock);

        a.shutdown_write().unwrap();
        assert_eq!(b.drain(), b"cdef".to_vec());
        assert_eq!(b.try_read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_manual_executor() {
        let executor = ManualExecutor::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            executor
                .execute(Box::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        assert_eq!(executor.pending(), 3);
        assert_eq!(executor.run_all(), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        executor.set_rejecting(true);
        assert!(executor.execute(Box::new(|| {})).is_err());
    }
}
