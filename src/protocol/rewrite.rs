//! In-place length patching and extension rewriting for hello messages
//!
//! Every helper here returns bytes whose record length equals the fragment
//! length and whose handshake length equals the message length minus 4.

use super::constants::*;
use super::extensions::parse_extensions;
use super::hello::{parse_client_hello, parse_server_hello};
use super::record::{parse_handshake_header, u24_bytes, ProtocolVersion};
use crate::error::{CodecError, CodecResult};

pub use super::record::encode_record;

/// Rewrite the 3-byte length of a handshake message to match its actual size
pub fn patch_handshake_length(message: &mut [u8]) -> CodecResult<()> {
    if message.len() < HANDSHAKE_HEADER_SIZE {
        return Err(CodecError::protocol("handshake message shorter than its header"));
    }
    let len = u24_bytes(message.len() - HANDSHAKE_HEADER_SIZE)?;
    message[1..4].copy_from_slice(&len);
    Ok(())
}

/// Rewrite the 2-byte length of a record to match its actual fragment size
pub fn patch_record_length(record: &mut [u8]) -> CodecResult<()> {
    if record.len() < TLS_HEADER_SIZE {
        return Err(CodecError::protocol("record shorter than its header"));
    }
    let len = record.len() - TLS_HEADER_SIZE;
    if len > MAX_RECORD_LEN {
        return Err(CodecError::protocol(format!(
            "rewritten fragment of {} bytes exceeds record cap {}",
            len, MAX_RECORD_LEN
        )));
    }
    record[3..5].copy_from_slice(&(len as u16).to_be_bytes());
    Ok(())
}

/// Where a hello's extensions block sits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExtensionsLayout {
    /// Offset of the u16 length field (or message end if absent)
    offset: usize,
    present: bool,
}

fn hello_layout(message: &[u8]) -> CodecResult<ExtensionsLayout> {
    let header = parse_handshake_header(message)?;
    let (offset, present) = match header.msg_type {
        handshake_type::CLIENT_HELLO => {
            let hello = parse_client_hello(message)?;
            (hello.extensions_offset, hello.extensions.is_some())
        }
        handshake_type::SERVER_HELLO => {
            let hello = parse_server_hello(message)?;
            (hello.extensions_offset, hello.extensions.is_some())
        }
        other => {
            return Err(CodecError::UnexpectedMessageType {
                expected: handshake_type::CLIENT_HELLO,
                got: other,
            })
        }
    };
    Ok(ExtensionsLayout { offset, present })
}

/// Append an encoded extension (type + length + body) to a hello message.
///
/// Creates the extensions block when the hello has none. The message must be
/// exactly one complete ClientHello or ServerHello; the result has its
/// handshake length patched.
pub fn append_extension(message: &[u8], extension: &[u8]) -> CodecResult<Vec<u8>> {
    let message = &message[..parse_handshake_header(message)?.message_len()];
    let layout = hello_layout(message)?;

    let mut out = Vec::with_capacity(message.len() + extension.len() + 2);
    out.extend_from_slice(message);

    if layout.present {
        let block_len = u16::from_be_bytes([message[layout.offset], message[layout.offset + 1]]) as usize;
        let new_len = block_len + extension.len();
        if new_len > u16::MAX as usize {
            return Err(CodecError::invalid_extension("extensions block would exceed 65535 bytes"));
        }
        out[layout.offset..layout.offset + 2].copy_from_slice(&(new_len as u16).to_be_bytes());
    } else {
        if extension.len() > u16::MAX as usize {
            return Err(CodecError::invalid_extension("extension larger than an extensions block"));
        }
        out.extend_from_slice(&(extension.len() as u16).to_be_bytes());
    }
    // The extensions block is always the tail of a hello
    out.extend_from_slice(extension);

    patch_handshake_length(&mut out)?;
    Ok(out)
}

/// Remove every extension of `ext_type` from a hello message.
///
/// Returns `None` when the extension is absent. Otherwise returns the
/// rewritten message and the removed extension body. When the block becomes
/// empty it is dropped entirely, so the result looks like a hello that never
/// carried extensions.
pub fn remove_extension(message: &[u8], ext_type: u16) -> CodecResult<Option<(Vec<u8>, Vec<u8>)>> {
    let message = &message[..parse_handshake_header(message)?.message_len()];
    let layout = hello_layout(message)?;
    if !layout.present {
        return Ok(None);
    }

    let block_start = layout.offset + 2;
    let block = &message[block_start..];
    let extensions = parse_extensions(block)?;
    let Some(removed) = extensions.iter().find(|e| e.ext_type == ext_type).map(|e| e.data.to_vec()) else {
        return Ok(None);
    };

    let kept: Vec<u8> = extensions
        .iter()
        .filter(|e| e.ext_type != ext_type)
        .flat_map(|e| {
            let mut raw = Vec::with_capacity(e.encoded_len());
            raw.extend_from_slice(&e.ext_type.to_be_bytes());
            raw.extend_from_slice(&(e.data.len() as u16).to_be_bytes());
            raw.extend_from_slice(e.data);
            raw
        })
        .collect();

    let mut out = Vec::with_capacity(message.len());
    out.extend_from_slice(&message[..layout.offset]);
    if !kept.is_empty() {
        out.extend_from_slice(&(kept.len() as u16).to_be_bytes());
        out.extend_from_slice(&kept);
    }

    patch_handshake_length(&mut out)?;
    Ok(Some((out, removed)))
}

/// Wrap handshake messages into one handshake record
pub fn encode_handshake_record(version: ProtocolVersion, messages: &[&[u8]]) -> CodecResult<Vec<u8>> {
    let fragment: Vec<u8> = messages.concat();
    encode_record(TLS_RECORD_HANDSHAKE, version, &fragment)
}
