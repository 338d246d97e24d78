//! EncryptedConduit: drives a TLS engine over a non-blocking transport
//!
//! Callers see plaintext `read`/`write` plus readiness listeners. Underneath,
//! ciphertext flows through three pooled buffers (inbound records, outbound
//! records, decrypted overflow) and the engine's handshake status decides
//! which transport direction has to make progress before the other can.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::executor::{Job, TaskExecutor};
use super::listener::{ListenerSlot, ReadLoopBreaker, DEFAULT_MAX_READ_LISTENER_INVOCATIONS};
use super::state::{HandshakeDeps, Interest, Lifecycle};
use crate::engine::{DelegatedTask, EngineResult, HandshakeStatus, SessionInfo, Status, TlsEngine};
use crate::error::{ConduitError, Result};
use crate::protocol::record::split_record;
use crate::stream::{BufferPool, PooledBuffer, StreamState};
use crate::transport::Transport;

// ============= Public Types =============

/// Per-connection tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConduitSettings {
    /// Consecutive read-listener re-invocations without progress before the
    /// connection is closed
    pub max_read_listener_invocations: usize,
}

impl Default for ConduitSettings {
    fn default() -> Self {
        Self { max_read_listener_invocations: DEFAULT_MAX_READ_LISTENER_INVOCATIONS }
    }
}

/// Peer address plus negotiated session parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_addr: Option<SocketAddr>,
    pub session: Option<SessionInfo>,
    pub application_protocol: Option<String>,
}

pub type ConduitListener<T, E> = dyn FnMut(&EncryptedConduit<T, E>) + Send;
pub type HandshakeListener<T, E> = dyn FnOnce(&EncryptedConduit<T, E>) + Send;

// ============= Internal State =============

enum Drive {
    /// Engine is not handshaking
    Done,
    /// Waiting on transport readiness or delegated tasks
    Blocked,
    /// The side the handshake needs is closed
    Closed,
}

enum Outcome {
    Bytes(usize),
    WouldBlock,
    Eof,
}

enum Fill {
    Filled,
    WouldBlock,
    Eof,
}

/// Work collected under the lock and run after it is released
struct Ctx<'a, T> {
    transport: &'a T,
    pool: &'a BufferPool,
    tasks: Vec<DelegatedTask>,
    handshake_finished: bool,
}

impl<'a, T: Transport> Ctx<'a, T> {
    fn new(transport: &'a T, pool: &'a BufferPool) -> Self {
        Self { transport, pool, tasks: Vec::new(), handshake_finished: false }
    }
}

struct Inner<E> {
    engine: E,
    lifecycle: Lifecycle,
    deps: HandshakeDeps,
    interest: Interest,
    handshake_started: bool,
    handshake_complete: bool,
    /// Ciphertext received but not yet unwrapped
    inbound: Option<PooledBuffer>,
    /// Ciphertext produced but not yet written
    outbound: Option<PooledBuffer>,
    /// Plaintext that did not fit the caller's buffer
    plaintext: Option<PooledBuffer>,
    outstanding_tasks: usize,
    release_deferred: bool,
    transport_eof: bool,
    write_shutdown_sent: bool,
    breaker: ReadLoopBreaker,
}

struct Shared<T: Transport, E: TlsEngine + 'static> {
    transport: T,
    executor: Arc<dyn TaskExecutor>,
    pool: BufferPool,
    state: Mutex<Inner<E>>,
    read_listener: ListenerSlot<ConduitListener<T, E>>,
    write_listener: ListenerSlot<ConduitListener<T, E>>,
    handshake_listener: ListenerSlot<HandshakeListener<T, E>>,
}

impl<E: TlsEngine> Inner<E> {
    fn new(engine: E, settings: ConduitSettings) -> Self {
        Self {
            engine,
            lifecycle: Lifecycle::Handshaking,
            deps: HandshakeDeps::default(),
            interest: Interest::default(),
            handshake_started: false,
            handshake_complete: false,
            inbound: None,
            outbound: None,
            plaintext: None,
            outstanding_tasks: 0,
            release_deferred: false,
            transport_eof: false,
            write_shutdown_sent: false,
            breaker: ReadLoopBreaker::new(settings.max_read_listener_invocations),
        }
    }

    fn ensure_started(&mut self) -> Result<()> {
        if !self.handshake_started {
            self.handshake_started = true;
            self.engine.begin_handshake()?;
        }
        Ok(())
    }

    fn outbound_pending(&self) -> bool {
        self.outbound.as_ref().is_some_and(|b| !b.is_empty())
    }

    fn inbound_pending(&self) -> bool {
        self.inbound.as_ref().is_some_and(|b| !b.is_empty())
    }

    /// Decrypted bytes waiting, or at least one whole record buffered
    fn has_buffered_read_data(&self) -> bool {
        self.plaintext.as_ref().is_some_and(|b| !b.is_empty())
            || self.inbound.as_ref().is_some_and(|b| split_record(b.readable()).is_ok())
    }

    fn drain_plaintext(&mut self, dst: &mut [u8]) -> Option<usize> {
        let plaintext = self.plaintext.as_mut()?;
        if plaintext.is_empty() {
            return None;
        }
        Some(plaintext.drain_into(dst))
    }

    fn release_buffers(&mut self) {
        self.inbound = None;
        self.outbound = None;
        self.plaintext = None;
    }

    // ============= Readiness =============

    /// Arm the transport for what the caller asked for, translated through
    /// the current handshake dependencies.
    fn rearm<T: Transport>(&self, transport: &T) {
        if self.outstanding_tasks > 0 || self.lifecycle.is_closed() {
            return;
        }
        let Interest { reads_resumed, writes_resumed } = self.interest;
        let reads = !self.lifecycle.is_read_closed()
            && ((reads_resumed && !self.deps.read_requires_write) || (writes_resumed && self.deps.write_requires_read));
        let writes = self.outbound_pending()
            || (!self.lifecycle.is_write_closed()
                && ((writes_resumed && !self.deps.write_requires_read)
                    || (reads_resumed && self.deps.read_requires_write)));

        if reads {
            transport.resume_reads();
        } else {
            transport.suspend_reads();
        }
        if writes {
            transport.resume_writes();
        } else {
            transport.suspend_writes();
        }
    }

    fn apply_handshake_status<T: Transport>(&mut self, status: HandshakeStatus, cx: &mut Ctx<'_, T>) {
        match status {
            HandshakeStatus::NeedWrap => self.deps.need_wrap(),
            HandshakeStatus::NeedUnwrap => self.deps.need_unwrap(),
            HandshakeStatus::NeedTask => return,
            HandshakeStatus::Finished => {
                self.complete_handshake(cx);
                return;
            }
            HandshakeStatus::NotHandshaking => {
                if !self.handshake_complete && self.handshake_started {
                    self.complete_handshake(cx);
                    return;
                }
                self.deps.clear();
            }
        }
        self.rearm(cx.transport);
    }

    fn complete_handshake<T: Transport>(&mut self, cx: &mut Ctx<'_, T>) {
        self.deps.clear();
        if !self.handshake_complete {
            self.handshake_complete = true;
            self.lifecycle.finish_handshake();
            cx.handshake_finished = true;
            debug!(
                protocol = ?self.engine.application_protocol(),
                state = self.lifecycle.state_name(),
                "TLS handshake finished"
            );
        }
        self.rearm(cx.transport);
    }

    fn collect_tasks<T: Transport>(&mut self, cx: &mut Ctx<'_, T>) {
        let before = cx.tasks.len();
        while let Some(task) = self.engine.delegated_task() {
            cx.tasks.push(task);
        }
        let count = cx.tasks.len() - before;
        self.outstanding_tasks += count;
        cx.transport.suspend_reads();
        cx.transport.suspend_writes();
        debug!(tasks = count, "dispatching delegated handshake tasks");
    }

    // ============= Transport I/O =============

    /// Write buffered ciphertext; true once nothing is left
    fn flush<T: Transport>(&mut self, cx: &mut Ctx<'_, T>) -> Result<bool> {
        let Some(out) = self.outbound.as_mut() else {
            return Ok(true);
        };
        while !out.is_empty() {
            match cx.transport.try_write(out.readable()) {
                Ok(0) => return Err(ConduitError::TransportClosed),
                Ok(n) => {
                    trace!(bytes = n, "ciphertext written");
                    out.consume(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    cx.transport.resume_writes();
                    return Ok(false);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    fn fill_inbound<T: Transport>(&mut self, cx: &mut Ctx<'_, T>) -> Result<Fill> {
        if self.transport_eof {
            return Ok(Fill::Eof);
        }
        let packet_size = self.engine.packet_buffer_size();
        let inbound = self.inbound.get_or_insert_with(|| cx.pool.get());
        if inbound.space() == 0 {
            inbound.compact();
        }
        if inbound.space() == 0 {
            // Callers unwrap before filling, so a full buffer holds a partial record
            debug_assert!(split_record(inbound.readable()).is_err(), "filling over a complete record");
            if inbound.capacity() >= packet_size {
                return Err(ConduitError::Protocol(format!(
                    "record larger than the {}-byte packet buffer",
                    inbound.capacity()
                )));
            }
            debug!(from = inbound.capacity(), to = packet_size, "growing inbound buffer");
            inbound.grow(cx.pool, packet_size);
        }

        loop {
            match cx.transport.try_read(inbound.writable()) {
                Ok(0) => {
                    self.transport_eof = true;
                    return Ok(Fill::Eof);
                }
                Ok(n) => {
                    inbound.commit(n);
                    trace!(bytes = n, buffered = inbound.len(), "ciphertext read");
                    return Ok(Fill::Filled);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    // ============= Engine Calls =============

    /// Wrap into the outbound buffer. `None` means no room could be made
    /// without blocking on the transport.
    fn wrap_into_outbound<T: Transport>(&mut self, src: &[u8], cx: &mut Ctx<'_, T>) -> Result<Option<EngineResult>> {
        let mut grown = false;
        loop {
            let out = self.outbound.get_or_insert_with(|| cx.pool.get());
            out.compact();
            let result = self.engine.wrap(src, out.writable())?;
            if result.status != Status::BufferOverflow {
                out.commit(result.bytes_produced);
                return Ok(Some(result));
            }

            if !out.is_empty() {
                if !self.flush(cx)? {
                    return Ok(None);
                }
                continue;
            }
            if grown {
                return Err(ConduitError::BufferOverflow { capacity: out.capacity() });
            }
            let size = self.engine.packet_buffer_size();
            debug!(from = out.capacity(), to = size, "growing outbound buffer after overflow");
            out.grow(cx.pool, size);
            grown = true;
        }
    }

    /// Unwrap straight into the caller's buffer
    fn unwrap_into(&mut self, dst: &mut [u8]) -> Result<EngineResult> {
        let src: &[u8] = match self.inbound.as_ref() {
            Some(inbound) => inbound.readable(),
            None => &[],
        };
        let result = self.engine.unwrap(src, dst)?;
        if result.status != Status::BufferOverflow {
            if let Some(inbound) = self.inbound.as_mut() {
                inbound.consume(result.bytes_consumed);
            }
        }
        Ok(result)
    }

    /// Unwrap into the plaintext overflow buffer, growing it once to the
    /// engine's application size.
    fn unwrap_into_plaintext<T: Transport>(&mut self, cx: &mut Ctx<'_, T>) -> Result<EngineResult> {
        let mut grown = false;
        loop {
            let plaintext = self.plaintext.get_or_insert_with(|| cx.pool.get());
            plaintext.compact();
            let src: &[u8] = match self.inbound.as_ref() {
                Some(inbound) => inbound.readable(),
                None => &[],
            };
            let result = self.engine.unwrap(src, plaintext.writable())?;
            if result.status != Status::BufferOverflow {
                plaintext.commit(result.bytes_produced);
                if let Some(inbound) = self.inbound.as_mut() {
                    inbound.consume(result.bytes_consumed);
                }
                return Ok(result);
            }

            if !plaintext.is_empty() {
                // caller has to drain first
                return Ok(result);
            }
            if grown {
                return Err(ConduitError::BufferOverflow { capacity: plaintext.capacity() });
            }
            let size = self.engine.application_buffer_size();
            debug!(from = plaintext.capacity(), to = size, "growing plaintext buffer after overflow");
            plaintext.grow(cx.pool, size);
            grown = true;
        }
    }

    // ============= Handshake Pump =============

    fn drive_handshake<T: Transport>(&mut self, cx: &mut Ctx<'_, T>) -> Result<Drive> {
        loop {
            if self.outstanding_tasks > 0 {
                return Ok(Drive::Blocked);
            }
            match self.engine.handshake_status() {
                HandshakeStatus::NeedTask => {
                    self.collect_tasks(cx);
                    return Ok(Drive::Blocked);
                }
                HandshakeStatus::NeedWrap => {
                    if self.lifecycle.is_write_closed() {
                        return Ok(Drive::Closed);
                    }
                    let Some(result) = self.wrap_into_outbound(&[], cx)? else {
                        self.apply_handshake_status(HandshakeStatus::NeedWrap, cx);
                        return Ok(Drive::Blocked);
                    };
                    trace!(bytes = result.bytes_produced, next = %result.handshake_status, "handshake wrap");
                    if !self.flush(cx)? {
                        self.apply_handshake_status(HandshakeStatus::NeedWrap, cx);
                        return Ok(Drive::Blocked);
                    }
                    if result.status == Status::Closed {
                        return Ok(Drive::Closed);
                    }
                    if result.bytes_produced == 0 && result.handshake_status == HandshakeStatus::NeedWrap {
                        return Err(ConduitError::Protocol("engine produced no handshake output".into()));
                    }
                    self.apply_handshake_status(result.handshake_status, cx);
                }
                HandshakeStatus::NeedUnwrap => {
                    self.flush(cx)?;
                    if self.lifecycle.is_read_closed() {
                        return Ok(Drive::Closed);
                    }
                    if self.inbound_pending() {
                        let mut result = self.unwrap_into(&mut [])?;
                        if result.status == Status::BufferOverflow {
                            result = self.unwrap_into_plaintext(cx)?;
                        }
                        trace!(consumed = result.bytes_consumed, next = %result.handshake_status, "handshake unwrap");
                        match result.status {
                            Status::Closed => {
                                self.inbound_closed(cx);
                                return Ok(Drive::Closed);
                            }
                            Status::BufferOverflow => return Ok(Drive::Blocked),
                            Status::Ok
                                if result.bytes_consumed > 0
                                    || result.handshake_status != HandshakeStatus::NeedUnwrap =>
                            {
                                self.apply_handshake_status(result.handshake_status, cx);
                                continue;
                            }
                            _ => {}
                        }
                    }
                    match self.fill_inbound(cx)? {
                        Fill::Filled => continue,
                        Fill::WouldBlock => {
                            self.apply_handshake_status(HandshakeStatus::NeedUnwrap, cx);
                            return Ok(Drive::Blocked);
                        }
                        Fill::Eof => {
                            debug!("transport EOF during handshake");
                            self.inbound_closed(cx);
                            return Ok(Drive::Closed);
                        }
                    }
                }
                HandshakeStatus::Finished | HandshakeStatus::NotHandshaking => {
                    if !self.handshake_complete {
                        self.complete_handshake(cx);
                    } else if self.deps.any() {
                        self.deps.clear();
                        self.rearm(cx.transport);
                    }
                    return Ok(Drive::Done);
                }
            }
        }
    }

    // ============= Application I/O =============

    fn read<T: Transport>(&mut self, dst: &mut [u8], cx: &mut Ctx<'_, T>) -> Result<Outcome> {
        if dst.is_empty() {
            return Ok(Outcome::Bytes(0));
        }
        if let Some(n) = self.drain_plaintext(dst) {
            self.breaker.reset();
            return Ok(Outcome::Bytes(n));
        }
        if self.lifecycle.is_read_closed() {
            return Ok(Outcome::Eof);
        }
        if self.outstanding_tasks > 0 {
            return Ok(Outcome::WouldBlock);
        }

        self.ensure_started()?;
        match self.drive_handshake(cx)? {
            Drive::Done => {}
            Drive::Blocked => return Ok(Outcome::WouldBlock),
            Drive::Closed => return Ok(Outcome::Eof),
        }
        if let Some(n) = self.drain_plaintext(dst) {
            self.breaker.reset();
            return Ok(Outcome::Bytes(n));
        }

        loop {
            if self.inbound_pending() {
                let result = self.unwrap_into(dst)?;
                match result.status {
                    Status::Ok => {
                        if result.handshake_status != HandshakeStatus::NotHandshaking {
                            self.apply_handshake_status(result.handshake_status, cx);
                            if result.bytes_produced == 0 {
                                match self.drive_handshake(cx)? {
                                    Drive::Done => continue,
                                    Drive::Blocked => return Ok(Outcome::WouldBlock),
                                    Drive::Closed => return Ok(Outcome::Eof),
                                }
                            }
                        }
                        if result.bytes_produced > 0 {
                            self.breaker.reset();
                            trace!(bytes = result.bytes_produced, "plaintext read");
                            return Ok(Outcome::Bytes(result.bytes_produced));
                        }
                        if result.bytes_consumed > 0 {
                            continue;
                        }
                    }
                    Status::BufferOverflow => {
                        let result = self.unwrap_into_plaintext(cx)?;
                        if result.status == Status::Closed {
                            self.inbound_closed(cx);
                        }
                        if let Some(n) = self.drain_plaintext(dst) {
                            self.breaker.reset();
                            return Ok(Outcome::Bytes(n));
                        }
                        if result.status == Status::Closed {
                            return Ok(Outcome::Eof);
                        }
                        continue;
                    }
                    Status::Closed => {
                        debug!("close_notify received");
                        self.inbound_closed(cx);
                        return Ok(Outcome::Eof);
                    }
                    Status::BufferUnderflow => {}
                }
            }

            match self.fill_inbound(cx)? {
                Fill::Filled => continue,
                Fill::WouldBlock => {
                    self.rearm(cx.transport);
                    return Ok(Outcome::WouldBlock);
                }
                Fill::Eof => {
                    let truncated = self.inbound.as_ref().map_or(0, |b| b.len());
                    debug!(truncated, "transport EOF");
                    self.inbound_closed(cx);
                    return Ok(Outcome::Eof);
                }
            }
        }
    }

    fn write<T: Transport>(&mut self, src: &[u8], cx: &mut Ctx<'_, T>) -> Result<Outcome> {
        if self.lifecycle.is_write_closed() {
            return Err(ConduitError::ChannelClosed);
        }
        if self.outstanding_tasks > 0 {
            return Ok(Outcome::WouldBlock);
        }

        self.ensure_started()?;
        match self.drive_handshake(cx)? {
            Drive::Done => {}
            Drive::Blocked => return Ok(Outcome::WouldBlock),
            Drive::Closed => return Err(ConduitError::ChannelClosed),
        }
        if !self.flush(cx)? {
            return Ok(Outcome::WouldBlock);
        }
        if src.is_empty() {
            return Ok(Outcome::Bytes(0));
        }

        let mut consumed = 0;
        while consumed < src.len() {
            let Some(result) = self.wrap_into_outbound(&src[consumed..], cx)? else {
                break;
            };
            consumed += result.bytes_consumed;
            if result.status == Status::Closed {
                if consumed == 0 {
                    return Err(ConduitError::ChannelClosed);
                }
                break;
            }
            if result.handshake_status.is_handshaking() {
                self.apply_handshake_status(result.handshake_status, cx);
                break;
            }
            if result.bytes_consumed == 0 || !self.flush(cx)? {
                break;
            }
        }
        self.flush(cx)?;
        self.rearm(cx.transport);

        if consumed == 0 {
            return Ok(Outcome::WouldBlock);
        }
        trace!(bytes = consumed, "plaintext written");
        Ok(Outcome::Bytes(consumed))
    }

    // ============= Closure =============

    fn inbound_closed<T: Transport>(&mut self, cx: &mut Ctx<'_, T>) {
        if let Err(e) = self.engine.close_inbound() {
            debug!(error = %e, "inbound closed without close_notify");
        }
        let _ = cx.transport.shutdown_read();
        if self.lifecycle.close_read().is_closed() {
            self.finish_close(cx);
        }
        debug!(state = self.lifecycle.state_name(), "read side closed");
    }

    /// Queue and try to flush a close_notify
    fn send_close_notify<T: Transport>(&mut self, cx: &mut Ctx<'_, T>) {
        self.engine.close_outbound();
        if self.outstanding_tasks > 0 {
            return;
        }
        if let Ok(Some(_)) = self.wrap_into_outbound(&[], cx) {
            let _ = self.flush(cx);
        }
    }

    fn shutdown_writes<T: Transport>(&mut self, cx: &mut Ctx<'_, T>) {
        if self.lifecycle.is_write_closed() {
            return;
        }
        self.send_close_notify(cx);
        if !self.outbound_pending() {
            self.write_shutdown_sent = true;
            let _ = cx.transport.shutdown_write();
        }
        if self.lifecycle.close_write().is_closed() {
            self.finish_close(cx);
        }
        debug!(state = self.lifecycle.state_name(), "write side closed");
    }

    fn close<T: Transport>(&mut self, cx: &mut Ctx<'_, T>) {
        if self.lifecycle.is_closed() {
            return;
        }
        if !self.lifecycle.is_write_closed() {
            self.send_close_notify(cx);
        }
        if let Err(e) = self.engine.close_inbound() {
            trace!(error = %e, "engine inbound close");
        }
        self.finish_close(cx);
    }

    /// Fatal error: flush the engine's alert once, then close without
    /// waiting for the peer.
    fn fail<T: Transport>(&mut self, err: &ConduitError, cx: &mut Ctx<'_, T>) {
        if self.lifecycle.is_closed() {
            return;
        }
        debug!(error = %err, state = self.lifecycle.state_name(), "closing conduit after failure");
        if self.outstanding_tasks == 0 && !self.lifecycle.is_write_closed() {
            if let Ok(Some(_)) = self.wrap_into_outbound(&[], cx) {
                let _ = self.flush(cx);
            }
        }
        self.engine.close_outbound();
        let _ = self.engine.close_inbound();
        self.finish_close(cx);
    }

    fn finish_close<T: Transport>(&mut self, cx: &mut Ctx<'_, T>) {
        self.lifecycle.close();
        self.deps.clear();
        self.interest = Interest::default();
        cx.transport.suspend_reads();
        cx.transport.suspend_writes();
        if self.outstanding_tasks > 0 {
            self.release_deferred = true;
            debug!(tasks = self.outstanding_tasks, "buffer release deferred until delegated tasks finish");
        } else {
            self.release_buffers();
        }
        if let Err(e) = cx.transport.close() {
            debug!(error = %e, "transport close failed");
        }
        debug!("conduit closed");
    }

    fn on_writable<T: Transport>(&mut self, cx: &mut Ctx<'_, T>) -> Result<bool> {
        let flushed = self.flush(cx)?;
        if flushed && self.lifecycle.is_write_closed() && !self.write_shutdown_sent {
            self.write_shutdown_sent = true;
            let _ = cx.transport.shutdown_write();
        }
        self.ensure_started()?;
        let drive = self.drive_handshake(cx)?;
        Ok(flushed && !matches!(drive, Drive::Blocked))
    }
}

// ============= EncryptedConduit =============

/// Plaintext duplex channel over a TLS engine and a non-blocking transport.
///
/// Cloning yields another handle to the same connection.
pub struct EncryptedConduit<T: Transport, E: TlsEngine + 'static> {
    shared: Arc<Shared<T, E>>,
}

impl<T: Transport, E: TlsEngine + 'static> Clone for EncryptedConduit<T, E> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<T: Transport, E: TlsEngine + 'static> EncryptedConduit<T, E> {
    pub fn new(transport: T, engine: E, executor: Arc<dyn TaskExecutor>, pool: BufferPool) -> Self {
        Self::with_settings(transport, engine, executor, pool, ConduitSettings::default())
    }

    pub fn with_settings(
        transport: T,
        engine: E,
        executor: Arc<dyn TaskExecutor>,
        pool: BufferPool,
        settings: ConduitSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                executor,
                pool,
                state: Mutex::new(Inner::new(engine, settings)),
                read_listener: ListenerSlot::new(),
                write_listener: ListenerSlot::new(),
                handshake_listener: ListenerSlot::new(),
            }),
        }
    }

    /// Run `f` under the state lock, then dispatch collected tasks and
    /// fire the handshake listener with the lock released.
    fn with_state<R>(&self, f: impl FnOnce(&mut Inner<E>, &mut Ctx<'_, T>) -> R) -> R {
        let mut cx = Ctx::new(&self.shared.transport, &self.shared.pool);
        let out = {
            let mut inner = self.shared.state.lock();
            f(&mut *inner, &mut cx)
        };
        let Ctx { tasks, handshake_finished, .. } = cx;
        if !tasks.is_empty() {
            self.submit_tasks(tasks);
        }
        if handshake_finished {
            if let Some(listener) = self.shared.handshake_listener.take() {
                listener(self);
            }
        }
        out
    }

    /// Like `with_state`, closing the conduit when `f` fails
    fn guarded<R>(&self, f: impl FnOnce(&mut Inner<E>, &mut Ctx<'_, T>) -> Result<R>) -> Result<R> {
        self.with_state(|inner, cx| {
            let result = f(inner, cx);
            if let Err(ref e) = result {
                inner.fail(e, cx);
            }
            result
        })
    }

    // ============= Delegated Tasks =============

    fn submit_tasks(&self, tasks: Vec<DelegatedTask>) {
        let mut tasks = tasks.into_iter();
        while let Some(task) = tasks.next() {
            let conduit = self.clone();
            let job: Job = Box::new(move || {
                task();
                conduit.on_task_complete();
            });
            if let Err(e) = self.shared.executor.execute(job) {
                debug!(error = %e, "executor refused delegated task");
                self.on_tasks_rejected(1 + tasks.len());
                return;
            }
        }
    }

    fn on_task_complete(&self) {
        let resumed = self.with_state(|inner, cx| {
            inner.outstanding_tasks = inner.outstanding_tasks.saturating_sub(1);
            if inner.outstanding_tasks > 0 {
                return None;
            }
            if inner.lifecycle.is_closed() {
                if inner.release_deferred {
                    inner.release_deferred = false;
                    inner.release_buffers();
                    debug!("delegated tasks finished, buffers released");
                }
                return None;
            }
            trace!("delegated tasks finished, resuming handshake");
            if let Err(e) = inner.drive_handshake(cx) {
                inner.fail(&e, cx);
                return None;
            }
            inner.rearm(cx.transport);
            Some(inner.interest)
        });

        // The event loop then re-polls whichever side the caller wants
        if let Some(interest) = resumed {
            if interest.reads_resumed {
                self.shared.transport.wake_up_reads();
            }
            if interest.writes_resumed {
                self.shared.transport.wake_up_writes();
            }
        }
    }

    fn on_tasks_rejected(&self, abandoned: usize) {
        self.with_state(|inner, cx| {
            inner.outstanding_tasks = inner.outstanding_tasks.saturating_sub(abandoned);
            inner.fail(&ConduitError::DelegatedTaskRejected, cx);
        });
    }

    // ============= Plaintext I/O =============

    /// Read decrypted bytes. `Ok(0)` is end of stream; `WouldBlock` means
    /// wait for read readiness (or a wake-up after delegated tasks).
    pub fn read(&self, dst: &mut [u8]) -> io::Result<usize> {
        match self.guarded(|inner, cx| inner.read(dst, cx))? {
            Outcome::Bytes(n) => Ok(n),
            Outcome::Eof => Ok(0),
            Outcome::WouldBlock => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    /// Encrypt and send bytes; returns how many were accepted.
    pub fn write(&self, src: &[u8]) -> io::Result<usize> {
        match self.guarded(|inner, cx| inner.write(src, cx))? {
            Outcome::Bytes(n) => Ok(n),
            Outcome::WouldBlock => Err(io::ErrorKind::WouldBlock.into()),
            Outcome::Eof => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    /// Push out retained ciphertext; true once nothing is pending
    pub fn flush(&self) -> io::Result<bool> {
        Ok(self.guarded(|inner, cx| inner.flush(cx))?)
    }

    /// Begin the handshake and push it as far as the transport allows
    pub fn start_handshake(&self) -> io::Result<()> {
        self.guarded(|inner, cx| {
            inner.ensure_started()?;
            inner.drive_handshake(cx)?;
            Ok(())
        })?;
        Ok(())
    }

    /// Send close_notify and shut the transport's write side; reads continue
    pub fn shutdown_writes(&self) -> io::Result<()> {
        self.with_state(|inner, cx| inner.shutdown_writes(cx));
        Ok(())
    }

    /// Close both directions. Calling it again is a no-op.
    pub fn close(&self) {
        self.with_state(|inner, cx| inner.close(cx));
    }

    // ============= Readiness =============

    /// Transport became readable (or was woken up)
    pub fn handle_readable(&self) {
        let (notify_read, notify_write) = self.with_state(|inner, cx| {
            if inner.lifecycle.is_closed() || inner.outstanding_tasks > 0 {
                return (false, false);
            }
            let write_was_blocked = inner.deps.write_requires_read;
            let drive = match inner.ensure_started().and_then(|_| inner.drive_handshake(cx)) {
                Ok(drive) => drive,
                Err(e) => {
                    inner.fail(&e, cx);
                    return (false, false);
                }
            };
            let ready = !matches!(drive, Drive::Blocked);
            let notify_write =
                ready && write_was_blocked && !inner.deps.write_requires_read && inner.interest.writes_resumed;
            (ready && inner.interest.reads_resumed, notify_write)
        });
        if notify_write {
            self.invoke_write_listener();
        }
        if notify_read {
            self.run_read_listener();
        }
    }

    /// Transport became writable (or was woken up)
    pub fn handle_writable(&self) {
        let (notify_read, notify_write) = self.with_state(|inner, cx| {
            if inner.lifecycle.is_closed() || inner.outstanding_tasks > 0 {
                return (false, false);
            }
            let read_was_blocked = inner.deps.read_requires_write;
            let ready = match inner.on_writable(cx) {
                Ok(ready) => ready,
                Err(e) => {
                    inner.fail(&e, cx);
                    return (false, false);
                }
            };
            inner.rearm(cx.transport);
            let notify_read =
                read_was_blocked && !inner.deps.read_requires_write && inner.interest.reads_resumed;
            let notify_write = ready && inner.interest.writes_resumed && !inner.lifecycle.is_write_closed();
            (notify_read, notify_write)
        });
        if notify_write {
            self.invoke_write_listener();
        }
        if notify_read {
            self.run_read_listener();
        }
    }

    /// Invoke the read listener, re-invoking while decrypted data stays
    /// buffered and reads stay resumed. Re-invocations that never drain
    /// anything are capped; past the cap the connection is closed.
    fn run_read_listener(&self) {
        loop {
            let Some(mut running) = self.shared.read_listener.check_out() else {
                return;
            };
            (running.listener)(self);
            self.shared.read_listener.check_in(running);

            let again = self.with_state(|inner, cx| {
                if inner.lifecycle.is_closed() || !inner.interest.reads_resumed || !inner.has_buffered_read_data() {
                    return false;
                }
                if !inner.breaker.admit() {
                    warn!(
                        invocations = inner.breaker.count(),
                        "read listener keeps leaving data unread, closing connection"
                    );
                    inner.close(cx);
                    return false;
                }
                true
            });
            if !again {
                return;
            }
        }
    }

    fn invoke_write_listener(&self) {
        if let Some(mut running) = self.shared.write_listener.check_out() {
            (running.listener)(self);
            self.shared.write_listener.check_in(running);
        }
    }

    pub fn resume_reads(&self) {
        self.with_state(|inner, cx| {
            inner.interest.reads_resumed = true;
            inner.rearm(cx.transport);
        });
    }

    pub fn suspend_reads(&self) {
        self.with_state(|inner, cx| {
            inner.interest.reads_resumed = false;
            inner.rearm(cx.transport);
        });
    }

    /// Resume reads and force a read notification
    pub fn wake_up_reads(&self) {
        self.resume_reads();
        self.shared.transport.wake_up_reads();
    }

    pub fn resume_writes(&self) {
        self.with_state(|inner, cx| {
            inner.interest.writes_resumed = true;
            inner.rearm(cx.transport);
        });
    }

    pub fn suspend_writes(&self) {
        self.with_state(|inner, cx| {
            inner.interest.writes_resumed = false;
            inner.rearm(cx.transport);
        });
    }

    /// Resume writes and force a write notification
    pub fn wake_up_writes(&self) {
        self.resume_writes();
        self.shared.transport.wake_up_writes();
    }

    pub fn is_read_resumed(&self) -> bool {
        self.shared.state.lock().interest.reads_resumed
    }

    pub fn is_write_resumed(&self) -> bool {
        self.shared.state.lock().interest.writes_resumed
    }

    // ============= Listeners =============

    pub fn set_read_listener<F>(&self, listener: F)
    where
        F: FnMut(&Self) + Send + 'static,
    {
        self.shared.read_listener.set(Some(Box::new(listener)));
    }

    pub fn clear_read_listener(&self) {
        self.shared.read_listener.set(None);
    }

    pub fn set_write_listener<F>(&self, listener: F)
    where
        F: FnMut(&Self) + Send + 'static,
    {
        self.shared.write_listener.set(Some(Box::new(listener)));
    }

    pub fn clear_write_listener(&self) {
        self.shared.write_listener.set(None);
    }

    /// Called once when the handshake completes; immediately if it already has
    pub fn set_handshake_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Self) + Send + 'static,
    {
        self.shared.handshake_listener.set(Some(Box::new(listener)));
        if self.is_handshake_complete() {
            if let Some(listener) = self.shared.handshake_listener.take() {
                listener(self);
            }
        }
    }

    // ============= Introspection =============

    pub fn negotiated_protocol(&self) -> Option<String> {
        self.shared.state.lock().engine.application_protocol()
    }

    pub fn peer_info(&self) -> PeerInfo {
        let inner = self.shared.state.lock();
        PeerInfo {
            peer_addr: self.shared.transport.peer_addr(),
            session: inner.engine.session_info(),
            application_protocol: inner.engine.application_protocol(),
        }
    }

    pub fn is_open(&self) -> bool {
        !self.shared.state.lock().lifecycle.is_closed()
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.shared.state.lock().handshake_complete
    }

    pub fn state_name(&self) -> &'static str {
        self.shared.state.lock().lifecycle.state_name()
    }

    pub fn outstanding_tasks(&self) -> usize {
        self.shared.state.lock().outstanding_tasks
    }

    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    /// Run `f` against the engine under the state lock
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut E) -> R) -> R {
        f(&mut self.shared.state.lock().engine)
    }
}

impl<T: Transport, E: TlsEngine + 'static> std::fmt::Debug for EncryptedConduit<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.state.lock();
        f.debug_struct("EncryptedConduit")
            .field("state", &inner.lifecycle.state_name())
            .field("deps", &inner.deps)
            .field("interest", &inner.interest)
            .field("outstanding_tasks", &inner.outstanding_tasks)
            .finish()
    }
}
