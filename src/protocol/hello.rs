//! ClientHello / ServerHello parsing
//!
//! Parsers take one complete handshake message (including its 4-byte
//! header) and borrow from it. They also record where the extensions block
//! starts so the rewrite helpers can patch it in place.

use super::constants::*;
use super::extensions::{check_unique, find_extension, parse_alpn, parse_extensions, parse_server_name, Extension, ServerName};
use super::record::{expect_handshake, ByteReader, ProtocolVersion};
use crate::error::{CodecError, CodecResult};

/// Parsed ClientHello
#[derive(Debug, Clone)]
pub struct ClientHello<'a> {
    pub version: ProtocolVersion,
    pub random: &'a [u8],
    pub session_id: &'a [u8],
    pub cipher_suites: Vec<u16>,
    pub compression_methods: &'a [u8],
    /// `None` when the hello carries no extensions block at all
    pub extensions: Option<Vec<Extension<'a>>>,
    /// Offset (within the message) of the extensions u16 length field, or
    /// of the message end when the block is absent
    pub extensions_offset: usize,
}

impl<'a> ClientHello<'a> {
    pub fn extension(&self, ext_type: u16) -> Option<Extension<'a>> {
        self.extensions.as_deref().and_then(|exts| find_extension(exts, ext_type))
    }

    pub fn has_extension(&self, ext_type: u16) -> bool {
        self.extension(ext_type).is_some()
    }

    /// Host names from the SNI extension (empty if absent)
    pub fn server_names(&self) -> CodecResult<Vec<ServerName>> {
        match self.extension(extension_type::SERVER_NAME) {
            Some(ext) => parse_server_name(ext.data),
            None => Ok(Vec::new()),
        }
    }

    /// Offered ALPN protocols, `None` if the extension is absent
    pub fn alpn_protocols(&self) -> CodecResult<Option<Vec<String>>> {
        self.extension(extension_type::ALPN)
            .map(|ext| parse_alpn(ext.data))
            .transpose()
    }
}

/// Parsed ServerHello
#[derive(Debug, Clone)]
pub struct ServerHello<'a> {
    pub version: ProtocolVersion,
    pub random: &'a [u8],
    pub session_id: &'a [u8],
    pub cipher_suite: u16,
    pub compression_method: u8,
    pub extensions: Option<Vec<Extension<'a>>>,
    pub extensions_offset: usize,
}

impl<'a> ServerHello<'a> {
    pub fn extension(&self, ext_type: u16) -> Option<Extension<'a>> {
        self.extensions.as_deref().and_then(|exts| find_extension(exts, ext_type))
    }

    pub fn has_extension(&self, ext_type: u16) -> bool {
        self.extension(ext_type).is_some()
    }

    /// The single protocol the server selected, `None` if no ALPN extension.
    pub fn selected_protocol(&self) -> CodecResult<Option<String>> {
        let Some(ext) = self.extension(extension_type::ALPN) else {
            return Ok(None);
        };
        let mut protocols = parse_alpn(ext.data)?;
        if protocols.len() != 1 {
            return Err(CodecError::invalid_extension(format!(
                "ServerHello ALPN must carry exactly one protocol, got {}",
                protocols.len()
            )));
        }
        Ok(protocols.pop())
    }
}

/// Read the optional trailing extensions block.
///
/// Returns the parsed extensions (or `None` when the body ends right after
/// the fixed fields) and the offset of the block's length field relative to
/// the body start.
fn read_extensions<'a>(reader: &mut ByteReader<'a>) -> CodecResult<(Option<Vec<Extension<'a>>>, usize)> {
    let offset = reader.position();
    if reader.is_empty() {
        return Ok((None, offset));
    }

    let block = reader.read_vec16("extensions block")?;
    if !reader.is_empty() {
        return Err(CodecError::protocol(format!(
            "{} bytes after extensions block",
            reader.remaining()
        )));
    }

    let extensions = parse_extensions(block)?;
    check_unique(&extensions)?;
    Ok((Some(extensions), offset))
}

fn read_session_id<'a>(reader: &mut ByteReader<'a>) -> CodecResult<&'a [u8]> {
    let session_id = reader.read_vec8("session id")?;
    if session_id.len() > MAX_SESSION_ID_LEN {
        return Err(CodecError::protocol(format!(
            "session id of {} bytes exceeds {}",
            session_id.len(),
            MAX_SESSION_ID_LEN
        )));
    }
    Ok(session_id)
}

/// Narrow `message` to exactly the declared handshake message
fn message_body(message: &[u8], expected: u8) -> CodecResult<&[u8]> {
    let header = expect_handshake(message, expected)?;
    Ok(&message[HANDSHAKE_HEADER_SIZE..header.message_len()])
}

/// Parse a ClientHello handshake message (header included)
pub fn parse_client_hello(message: &[u8]) -> CodecResult<ClientHello<'_>> {
    let body = message_body(message, handshake_type::CLIENT_HELLO)?;
    let mut reader = ByteReader::new(body);

    let version_bytes = reader.read_bytes(2, "client version")?;
    let version = ProtocolVersion::new(version_bytes[0], version_bytes[1]);
    let random = reader.read_bytes(RANDOM_LEN, "client random")?;
    let session_id = read_session_id(&mut reader)?;

    let suites = reader.read_vec16("cipher suites")?;
    if suites.is_empty() || suites.len() % 2 != 0 {
        return Err(CodecError::protocol(format!(
            "cipher suite list has invalid length {}",
            suites.len()
        )));
    }
    let cipher_suites = suites
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();

    let compression_methods = reader.read_vec8("compression methods")?;
    if compression_methods.is_empty() {
        return Err(CodecError::protocol("empty compression method list"));
    }

    let (extensions, offset) = read_extensions(&mut reader)?;

    Ok(ClientHello {
        version,
        random,
        session_id,
        cipher_suites,
        compression_methods,
        extensions,
        extensions_offset: HANDSHAKE_HEADER_SIZE + offset,
    })
}

/// Parse a ServerHello handshake message (header included)
pub fn parse_server_hello(message: &[u8]) -> CodecResult<ServerHello<'_>> {
    let body = message_body(message, handshake_type::SERVER_HELLO)?;
    let mut reader = ByteReader::new(body);

    let version_bytes = reader.read_bytes(2, "server version")?;
    let version = ProtocolVersion::new(version_bytes[0], version_bytes[1]);
    let random = reader.read_bytes(RANDOM_LEN, "server random")?;
    let session_id = read_session_id(&mut reader)?;
    let cipher_suite = reader.read_u16("cipher suite")?;
    let compression_method = reader.read_u8("compression method")?;

    let (extensions, offset) = read_extensions(&mut reader)?;

    Ok(ServerHello {
        version,
        random,
        session_id,
        cipher_suite,
        compression_method,
        extensions,
        extensions_offset: HANDSHAKE_HEADER_SIZE + offset,
    })
}

// ============= Builders =============

/// Assemble a ClientHello message from parts. `extensions` is the raw
/// concatenation of encoded extensions; `None` omits the block entirely.
pub fn build_client_hello(
    version: ProtocolVersion,
    random: &[u8; RANDOM_LEN],
    session_id: &[u8],
    cipher_suites: &[u16],
    extensions: Option<&[u8]>,
) -> CodecResult<Vec<u8>> {
    let mut body = Vec::with_capacity(128);
    body.extend_from_slice(&version.to_bytes());
    body.extend_from_slice(random);
    body.push(session_id.len() as u8);
    body.extend_from_slice(session_id);
    body.extend_from_slice(&((cipher_suites.len() * 2) as u16).to_be_bytes());
    for suite in cipher_suites {
        body.extend_from_slice(&suite.to_be_bytes());
    }
    // null compression only
    body.push(1);
    body.push(0);
    if let Some(exts) = extensions {
        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(exts);
    }
    super::record::encode_handshake(handshake_type::CLIENT_HELLO, &body)
}

/// Assemble a ServerHello message from parts
pub fn build_server_hello(
    version: ProtocolVersion,
    random: &[u8; RANDOM_LEN],
    session_id: &[u8],
    cipher_suite: u16,
    extensions: Option<&[u8]>,
) -> CodecResult<Vec<u8>> {
    let mut body = Vec::with_capacity(80);
    body.extend_from_slice(&version.to_bytes());
    body.extend_from_slice(random);
    body.push(session_id.len() as u8);
    body.extend_from_slice(session_id);
    body.extend_from_slice(&cipher_suite.to_be_bytes());
    body.push(0);
    if let Some(exts) = extensions {
        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(exts);
    }
    super::record::encode_handshake(handshake_type::SERVER_HELLO, &body)
}
