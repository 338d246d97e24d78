//! tlsconduit: a non-blocking TLS conduit over an opaque engine, with SNI
//! based context dispatch and an ALPN negotiation shim for engines that
//! cannot negotiate protocols themselves.

pub mod alpn;
pub mod conduit;
pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod server;
pub mod sni;
pub mod stream;
pub mod transport;

pub use conduit::{ConduitSettings, EncryptedConduit, PeerInfo};
pub use engine::{TlsContext, TlsEngine};
pub use error::{ConduitError, Result};
