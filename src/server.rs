//! Dispatch-only listener
//!
//! Accepts TCP connections, reads the first TLS record through the
//! non-blocking transport, resolves the SNI context name and the ALPN
//! selection, logs the decision, then refuses the handshake with a fatal
//! `handshake_failure` alert. No TLS engine is involved.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::alpn::select_protocol;
use crate::config::ConduitConfig;
use crate::error::{ConduitError, Result};
use crate::protocol::constants::alert;
use crate::protocol::record::{encode_alert, ProtocolVersion};
use crate::sni::{explore_hello, SniTable};
use crate::stream::{BufferPool, PooledBuffer};
use crate::transport::{TcpTransport, Transport};

/// What the first record of a connection resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchDecision {
    pub peer: Option<SocketAddr>,
    pub server_names: Vec<String>,
    /// Configured context name the connection would be handed to
    pub context: String,
    pub offered_protocols: Option<Vec<String>>,
    pub protocol: Option<String>,
}

pub struct DispatchServer {
    table: SniTable<String>,
    server_protocols: Vec<String>,
    pool: BufferPool,
    keepalive: Option<Duration>,
    first_record_timeout: Duration,
}

impl DispatchServer {
    pub fn from_config(config: &ConduitConfig) -> Self {
        Self {
            table: SniTable::from_config(&config.sni),
            server_protocols: config.alpn.server_protocols.clone(),
            pool: config.buffer_pool(),
            keepalive: config.keepalive(),
            first_record_timeout: Duration::from_secs(config.server.first_record_timeout_secs),
        }
    }

    pub fn table(&self) -> &SniTable<String> {
        &self.table
    }

    /// Accept loop; each connection runs on its own task under `max_connections`
    pub async fn run(self: Arc<Self>, listener: TcpListener, max_connections: Arc<Semaphore>) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let permit = match max_connections.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            error!("Connection limiter is closed");
                            break;
                        }
                    };
                    let server = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = server.handle(stream).await {
                            debug!(peer = %peer, error = %e, "Connection dropped before dispatch");
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Dispatch one connection and refuse its handshake
    pub async fn handle(&self, stream: TcpStream) -> Result<DispatchDecision> {
        let transport = TcpTransport::configured(stream, self.keepalive)?;
        let mut buf = self.pool.get();

        let decision = match timeout(self.first_record_timeout, self.read_first_record(&transport, &mut buf)).await {
            Ok(result) => result.and_then(|()| self.decide(&transport, &buf)),
            Err(_) => Err(ConduitError::Io(io::Error::new(io::ErrorKind::TimedOut, "no ClientHello in time"))),
        };

        let description = match decision {
            Ok(_) => alert::HANDSHAKE_FAILURE,
            Err(ConduitError::Codec(_)) => alert::DECODE_ERROR,
            Err(ConduitError::NoContext { .. }) => alert::UNRECOGNIZED_NAME,
            Err(_) => alert::INTERNAL_ERROR,
        };
        let refusal = encode_alert(ProtocolVersion::TLS_V1_2, alert::LEVEL_FATAL, description);
        // best effort; the peer may already be gone
        let _ = transport.try_write(&refusal);
        let _ = transport.close();
        decision
    }

    /// Buffer bytes until the explorer sees one complete first record
    async fn read_first_record(&self, transport: &TcpTransport, buf: &mut PooledBuffer) -> Result<()> {
        loop {
            match explore_hello(buf.readable()) {
                Ok(_) => return Ok(()),
                Err(e) if e.is_underflow() => {}
                Err(e) => return Err(e.into()),
            }
            if buf.is_full() {
                return Err(ConduitError::BufferOverflow { capacity: buf.capacity() });
            }
            match transport.try_read(buf.writable()) {
                Ok(0) => return Err(ConduitError::TransportClosed),
                Ok(n) => buf.commit(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => transport.readable().await?,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn decide(&self, transport: &TcpTransport, buf: &PooledBuffer) -> Result<DispatchDecision> {
        let exploration = explore_hello(buf.readable())?;
        let server_names = exploration.host_names();
        let context = self.table.resolve(&server_names)?.clone();
        let protocol = exploration
            .protocols
            .as_deref()
            .and_then(|offer| select_protocol(&self.server_protocols, offer));

        let decision = DispatchDecision {
            peer: transport.peer_addr(),
            server_names,
            context,
            offered_protocols: exploration.protocols,
            protocol,
        };
        info!(
            peer = ?decision.peer,
            names = ?decision.server_names,
            context = %decision.context,
            protocol = ?decision.protocol,
            "Dispatched ClientHello"
        );
        Ok(decision)
    }
}
