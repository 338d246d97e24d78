//! Transport layer: the non-blocking duplex byte channel under a conduit

use std::io;
use std::net::SocketAddr;

pub mod tcp;

pub use tcp::{ConduitDriver, TcpTransport};

/// Non-blocking duplex byte channel.
///
/// `try_read`/`try_write` never block: they report
/// `io::ErrorKind::WouldBlock` instead. `try_read` returning `Ok(0)` means
/// the peer closed its write side. Readiness methods only record interest;
/// the event loop driving the conduit decides when to deliver readiness.
pub trait Transport: Send + Sync + 'static {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;

    fn resume_reads(&self);

    fn suspend_reads(&self);

    /// Deliver a read notification even if the socket is not readable
    fn wake_up_reads(&self);

    fn resume_writes(&self);

    fn suspend_writes(&self);

    fn wake_up_writes(&self);

    fn shutdown_read(&self) -> io::Result<()>;

    fn shutdown_write(&self) -> io::Result<()>;

    fn close(&self) -> io::Result<()>;

    fn peer_addr(&self) -> Option<SocketAddr>;
}
