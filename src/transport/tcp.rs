//! TCP transport over tokio, plus an async driver for a conduit on top of it

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, trace};

use super::Transport;
use crate::conduit::EncryptedConduit;
use crate::engine::TlsEngine;

// ============= TcpTransport =============

/// Non-blocking TCP stream with readiness interest flags.
///
/// The flags only record what the conduit wants; [`ConduitDriver`] polls the
/// socket for the armed directions and reacts to wake-ups.
pub struct TcpTransport {
    stream: TcpStream,
    reads_armed: AtomicBool,
    writes_armed: AtomicBool,
    read_woken: AtomicBool,
    write_woken: AtomicBool,
    wakeup: Notify,
    closed: AtomicBool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            reads_armed: AtomicBool::new(false),
            writes_armed: AtomicBool::new(false),
            read_woken: AtomicBool::new(false),
            write_woken: AtomicBool::new(false),
            wakeup: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Disable Nagle and optionally enable keepalive before wrapping
    pub fn configured(stream: TcpStream, keepalive: Option<Duration>) -> io::Result<Self> {
        let socket = SockRef::from(&stream);
        socket.set_nodelay(true)?;
        if let Some(interval) = keepalive {
            let keepalive = TcpKeepalive::new().with_time(interval);
            #[cfg(any(target_os = "linux", target_os = "macos", target_os = "ios"))]
            let keepalive = keepalive.with_interval(interval);
            socket.set_tcp_keepalive(&keepalive)?;
        }
        Ok(Self::new(stream))
    }

    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::configured(stream, None)
    }

    pub fn reads_armed(&self) -> bool {
        self.reads_armed.load(Ordering::Acquire)
    }

    pub fn writes_armed(&self) -> bool {
        self.writes_armed.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until the socket may have bytes to read
    pub async fn readable(&self) -> io::Result<()> {
        self.stream.readable().await
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match SockRef::from(&self.stream).shutdown(how) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

impl Transport for TcpTransport {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.stream.try_write(buf)
    }

    fn resume_reads(&self) {
        self.reads_armed.store(true, Ordering::Release);
    }

    fn suspend_reads(&self) {
        self.reads_armed.store(false, Ordering::Release);
    }

    fn wake_up_reads(&self) {
        self.resume_reads();
        self.read_woken.store(true, Ordering::Release);
        self.wakeup.notify_one();
    }

    fn resume_writes(&self) {
        self.writes_armed.store(true, Ordering::Release);
    }

    fn suspend_writes(&self) {
        self.writes_armed.store(false, Ordering::Release);
    }

    fn wake_up_writes(&self) {
        self.resume_writes();
        self.write_woken.store(true, Ordering::Release);
        self.wakeup.notify_one();
    }

    fn shutdown_read(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Read)
    }

    fn shutdown_write(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.wakeup.notify_one();
        self.shutdown(Shutdown::Both)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }
}

// ============= ConduitDriver =============

/// Async event loop for one conduit on a [`TcpTransport`]
pub struct ConduitDriver<E: TlsEngine + 'static> {
    conduit: EncryptedConduit<TcpTransport, E>,
}

impl<E: TlsEngine + 'static> ConduitDriver<E> {
    pub fn new(conduit: EncryptedConduit<TcpTransport, E>) -> Self {
        Self { conduit }
    }

    pub fn conduit(&self) -> &EncryptedConduit<TcpTransport, E> {
        &self.conduit
    }

    /// Wait for one armed readiness event or wake-up and dispatch it.
    /// Returns false once the conduit is closed.
    pub async fn poll_once(&self) -> io::Result<bool> {
        if !self.conduit.is_open() {
            return Ok(false);
        }
        let transport = self.conduit.transport();
        let want_read = transport.reads_armed();
        let want_write = transport.writes_armed();
        let woken = transport.read_woken.load(Ordering::Acquire) || transport.write_woken.load(Ordering::Acquire);
        if !want_read && !want_write && !woken && self.conduit.outstanding_tasks() == 0 {
            // Nothing could ever complete the select below
            trace!("poll with no armed direction");
            return Ok(true);
        }

        tokio::select! {
            ready = transport.stream.readable(), if want_read => {
                ready?;
                self.conduit.handle_readable();
            }
            ready = transport.stream.writable(), if want_write => {
                ready?;
                self.conduit.handle_writable();
            }
            _ = transport.wakeup.notified() => {
                if transport.read_woken.swap(false, Ordering::AcqRel) {
                    self.conduit.handle_readable();
                }
                if transport.write_woken.swap(false, Ordering::AcqRel) {
                    self.conduit.handle_writable();
                }
            }
        }
        Ok(self.conduit.is_open())
    }

    /// Drive the handshake to completion
    pub async fn handshake(&self) -> io::Result<()> {
        self.conduit.resume_reads();
        self.conduit.start_handshake()?;
        while !self.conduit.is_handshake_complete() {
            if !self.poll_once().await? {
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "closed during handshake"));
            }
        }
        debug!(peer = ?self.conduit.transport().peer_addr(), "handshake complete");
        Ok(())
    }

    /// Read plaintext, waiting for the transport as needed. `Ok(0)` is EOF.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.conduit.resume_reads();
        loop {
            match self.conduit.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !self.poll_once().await? {
                        return Ok(0);
                    }
                }
                other => return other,
            }
        }
    }

    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        self.conduit.resume_writes();
        while !buf.is_empty() {
            match self.conduit.write(buf) {
                Ok(n) => {
                    trace!(bytes = n, "driver wrote");
                    buf = &buf[n..];
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !self.poll_once().await? {
                        return Err(io::ErrorKind::BrokenPipe.into());
                    }
                }
                Err(e) => return Err(e),
            }
        }
        self.flush().await
    }

    /// Push out retained ciphertext, then drop write interest
    pub async fn flush(&self) -> io::Result<()> {
        self.conduit.resume_writes();
        while !self.conduit.flush()? {
            if !self.poll_once().await? {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
        }
        self.conduit.suspend_writes();
        Ok(())
    }

    pub fn close(&self) {
        self.conduit.close();
    }
}
