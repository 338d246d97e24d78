//! Read-only peek at a buffered ClientHello
//!
//! Used before any TLS engine exists: the bytes are parsed but never
//! consumed, so the same buffer is handed to the engine afterwards.

use crate::error::{CodecError, CodecResult};
use crate::protocol::constants::*;
use crate::protocol::extensions::ServerName;
use crate::protocol::hello::parse_client_hello;
use crate::protocol::record::{expect_handshake, split_record, ProtocolVersion};

/// What the first ClientHello record reveals
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exploration {
    pub server_names: Vec<ServerName>,
    /// Offered ALPN protocols, `None` if the extension is absent
    pub protocols: Option<Vec<String>>,
    /// Version field of the ClientHello (not the record)
    pub hello_version: Option<ProtocolVersion>,
    /// Size of the first record on the wire, 0 for SSLv2-style hellos
    pub record_len: usize,
}

impl Exploration {
    pub fn host_names(&self) -> Vec<String> {
        self.server_names.iter().map(|n| n.as_str().to_string()).collect()
    }
}

/// Server names requested by the ClientHello at the start of `buf`.
///
/// Empty when the hello has no extensions or is an SSLv2-style hello.
/// `Underflow` until the whole first record is buffered.
pub fn explore(buf: &[u8]) -> CodecResult<Vec<ServerName>> {
    Ok(explore_hello(buf)?.server_names)
}

/// Like [`explore`], also reporting ALPN offer and hello version
pub fn explore_hello(buf: &[u8]) -> CodecResult<Exploration> {
    let Some(&first) = buf.first() else {
        return Err(CodecError::underflow(1, 0));
    };
    // SSLv2-compatible hello: two-byte length with the top bit set; no SNI
    if first & 0x80 != 0 {
        return Ok(Exploration::default());
    }
    if first != TLS_RECORD_HANDSHAKE {
        return Err(CodecError::NotHandshakeRecord { content_type: first });
    }

    let (header, fragment) = split_record(buf)?;
    let message_len = expect_handshake(fragment, handshake_type::CLIENT_HELLO)?.message_len();
    let hello = parse_client_hello(&fragment[..message_len])?;

    Ok(Exploration {
        server_names: hello.server_names()?,
        protocols: hello.alpn_protocols()?,
        hello_version: Some(hello.version),
        record_len: header.record_len(),
    })
}
