//! TLS record and handshake header codec
//!
//! Pure functions over byte slices: nothing here performs I/O or keeps state.
//! Every parser either consumes a complete length-delimited region or fails
//! with `Underflow` (need more bytes) / `Protocol` (lengths disagree).

use std::fmt;

use super::constants::*;
use crate::error::{CodecError, CodecResult};

// ============= Protocol Version =============

/// Two-byte TLS protocol version as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const SSL_V3: Self = Self { major: 3, minor: 0 };
    pub const TLS_V1_0: Self = Self { major: 3, minor: 1 };
    pub const TLS_V1_1: Self = Self { major: 3, minor: 2 };
    pub const TLS_V1_2: Self = Self { major: 3, minor: 3 };
    pub const TLS_V1_3: Self = Self { major: 3, minor: 4 };

    pub fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    pub fn to_bytes(self) -> [u8; 2] {
        [self.major, self.minor]
    }

    pub fn name(self) -> &'static str {
        match (self.major, self.minor) {
            (3, 0) => "SSLv3",
            (3, 1) => "TLSv1",
            (3, 2) => "TLSv1.1",
            (3, 3) => "TLSv1.2",
            (3, 4) => "TLSv1.3",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}.{})", self.name(), self.major, self.minor)
    }
}

// ============= Byte Reader =============

/// Big-endian cursor over a borrowed slice.
///
/// Running off the end is reported as a protocol error: callers only hand it
/// regions whose outer length has already been checked.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn short(&self, what: &str, need: usize) -> CodecError {
        CodecError::protocol(format!(
            "truncated {}: need {} bytes at offset {}, {} left",
            what,
            need,
            self.pos,
            self.remaining()
        ))
    }

    pub fn read_u8(&mut self, what: &str) -> CodecResult<u8> {
        let b = *self.data.get(self.pos).ok_or_else(|| self.short(what, 1))?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self, what: &str) -> CodecResult<u16> {
        let bytes = self.read_bytes(2, what)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u24(&mut self, what: &str) -> CodecResult<u32> {
        let bytes = self.read_bytes(3, what)?;
        Ok(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
    }

    pub fn read_bytes(&mut self, len: usize, what: &str) -> CodecResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(self.short(what, len));
        }
        let data: &'a [u8] = self.data;
        let out = &data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Read a u8-length-prefixed vector
    pub fn read_vec8(&mut self, what: &str) -> CodecResult<&'a [u8]> {
        let len = self.read_u8(what)? as usize;
        self.read_bytes(len, what)
    }

    /// Read a u16-length-prefixed vector
    pub fn read_vec16(&mut self, what: &str) -> CodecResult<&'a [u8]> {
        let len = self.read_u16(what)? as usize;
        self.read_bytes(len, what)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let data: &'a [u8] = self.data;
        let out = &data[self.pos..];
        self.pos = data.len();
        out
    }
}

// ============= Record Header =============

/// Parsed TLS record header (5 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Content type (0x16 = Handshake, 0x17 = Application Data, ...)
    pub content_type: u8,
    pub version: ProtocolVersion,
    /// Fragment length
    pub length: u16,
}

impl RecordHeader {
    pub fn new(content_type: u8, version: ProtocolVersion, length: u16) -> Self {
        Self { content_type, version, length }
    }

    /// Total on-the-wire size of the record (header + fragment)
    pub fn record_len(&self) -> usize {
        TLS_HEADER_SIZE + self.length as usize
    }

    pub fn is_handshake(&self) -> bool {
        self.content_type == TLS_RECORD_HANDSHAKE
    }

    pub fn to_bytes(self) -> [u8; 5] {
        [
            self.content_type,
            self.version.major,
            self.version.minor,
            (self.length >> 8) as u8,
            self.length as u8,
        ]
    }
}

/// Parse the 5-byte record header at the start of `buf`.
///
/// Fails with `Underflow` if fewer than 5 bytes are available and with
/// `Protocol` if the declared length exceeds the practical cap.
pub fn parse_record_header(buf: &[u8]) -> CodecResult<RecordHeader> {
    if buf.len() < TLS_HEADER_SIZE {
        return Err(CodecError::underflow(TLS_HEADER_SIZE, buf.len()));
    }

    let header = RecordHeader {
        content_type: buf[0],
        version: ProtocolVersion::new(buf[1], buf[2]),
        length: u16::from_be_bytes([buf[3], buf[4]]),
    };

    if header.length as usize > MAX_RECORD_LEN {
        return Err(CodecError::protocol(format!(
            "TLS record too large: {} bytes (max {})",
            header.length, MAX_RECORD_LEN
        )));
    }

    Ok(header)
}

/// Split one complete record off the front of `buf`.
///
/// Returns the header and the fragment; `Underflow` if the record is not
/// complete yet. Nothing is consumed: the caller advances by `record_len()`.
pub fn split_record(buf: &[u8]) -> CodecResult<(RecordHeader, &[u8])> {
    let header = parse_record_header(buf)?;
    let total = header.record_len();
    if buf.len() < total {
        return Err(CodecError::underflow(total, buf.len()));
    }
    Ok((header, &buf[TLS_HEADER_SIZE..total]))
}

/// Build a complete record from a fragment
pub fn encode_record(content_type: u8, version: ProtocolVersion, fragment: &[u8]) -> CodecResult<Vec<u8>> {
    if fragment.len() > MAX_RECORD_LEN {
        return Err(CodecError::protocol(format!(
            "fragment of {} bytes exceeds record cap {}",
            fragment.len(),
            MAX_RECORD_LEN
        )));
    }

    let header = RecordHeader::new(content_type, version, fragment.len() as u16);
    let mut record = Vec::with_capacity(TLS_HEADER_SIZE + fragment.len());
    record.extend_from_slice(&header.to_bytes());
    record.extend_from_slice(fragment);
    Ok(record)
}

// ============= Handshake Header =============

/// Parsed handshake message header (type + u24 length)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeHeader {
    pub msg_type: u8,
    pub length: u32,
}

impl HandshakeHeader {
    /// Total size of the message including its 4-byte header
    pub fn message_len(&self) -> usize {
        HANDSHAKE_HEADER_SIZE + self.length as usize
    }
}

/// Parse a handshake header and check the body fits in `buf`.
///
/// `buf` is a record fragment (or slice of one). A message longer than what
/// is present is a protocol error: handshake messages spanning several
/// records are not supported.
pub fn parse_handshake_header(buf: &[u8]) -> CodecResult<HandshakeHeader> {
    if buf.len() < HANDSHAKE_HEADER_SIZE {
        return Err(CodecError::protocol(format!(
            "handshake header truncated: {} of {} bytes",
            buf.len(),
            HANDSHAKE_HEADER_SIZE
        )));
    }

    let header = HandshakeHeader {
        msg_type: buf[0],
        length: u32::from_be_bytes([0, buf[1], buf[2], buf[3]]),
    };

    if header.message_len() > buf.len() {
        return Err(CodecError::protocol(format!(
            "handshake message spans records: declared {} bytes, {} present",
            header.length,
            buf.len() - HANDSHAKE_HEADER_SIZE
        )));
    }

    Ok(header)
}

/// Like [`parse_handshake_header`] but also checks the message type.
pub fn expect_handshake(buf: &[u8], expected: u8) -> CodecResult<HandshakeHeader> {
    let header = parse_handshake_header(buf)?;
    if header.msg_type != expected {
        return Err(CodecError::UnexpectedMessageType {
            expected,
            got: header.msg_type,
        });
    }
    Ok(header)
}

/// Split a handshake record fragment into its complete messages (each
/// including its 4-byte header). Every byte must belong to a message.
pub fn handshake_messages(fragment: &[u8]) -> CodecResult<Vec<&[u8]>> {
    let mut messages = Vec::new();
    let mut pos = 0;

    while pos < fragment.len() {
        let header = parse_handshake_header(&fragment[pos..])?;
        let end = pos + header.message_len();
        messages.push(&fragment[pos..end]);
        pos = end;
    }

    Ok(messages)
}

/// Encode a u24 length, failing for values above 2^24 - 1
pub fn u24_bytes(value: usize) -> CodecResult<[u8; 3]> {
    if value > 0x00ff_ffff {
        return Err(CodecError::protocol(format!("length {} does not fit in 24 bits", value)));
    }
    Ok([
        ((value >> 16) & 0xff) as u8,
        ((value >> 8) & 0xff) as u8,
        (value & 0xff) as u8,
    ])
}

/// Build a handshake message from type and body
pub fn encode_handshake(msg_type: u8, body: &[u8]) -> CodecResult<Vec<u8>> {
    let mut message = Vec::with_capacity(HANDSHAKE_HEADER_SIZE + body.len());
    message.push(msg_type);
    message.extend_from_slice(&u24_bytes(body.len())?);
    message.extend_from_slice(body);
    Ok(message)
}

/// Build a 2-byte alert record
pub fn encode_alert(version: ProtocolVersion, level: u8, description: u8) -> Vec<u8> {
    let header = RecordHeader::new(TLS_RECORD_ALERT, version, 2);
    let mut record = Vec::with_capacity(TLS_HEADER_SIZE + 2);
    record.extend_from_slice(&header.to_bytes());
    record.push(level);
    record.push(description);
    record
}
