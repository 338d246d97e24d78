//! TLS handshake record codec: record/handshake headers, hellos, extensions

pub mod constants;
pub mod extensions;
pub mod hello;
pub mod record;
pub mod rewrite;

pub use constants::*;
pub use extensions::{Extension, ServerName, encode_alpn_extension, parse_alpn, parse_server_name};
pub use hello::{ClientHello, ServerHello, parse_client_hello, parse_server_hello};
pub use record::{HandshakeHeader, ProtocolVersion, RecordHeader, parse_record_header, split_record};
