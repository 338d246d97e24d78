//! Hello extension blocks: iteration, SNI and ALPN bodies

use std::collections::HashSet;
use std::fmt;

use super::constants::*;
use super::record::ByteReader;
use crate::error::{CodecError, CodecResult};

/// One `{type, length, data}` entry of an extensions block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extension<'a> {
    pub ext_type: u16,
    pub data: &'a [u8],
}

impl Extension<'_> {
    /// Encoded size including the 4-byte type/length prefix
    pub fn encoded_len(&self) -> usize {
        4 + self.data.len()
    }
}

/// Walk an extensions block (without its own u16 length prefix).
///
/// Each step reads `(type, u16 length)` and consumes exactly `length` bytes;
/// the remainder must reach exactly zero.
pub fn parse_extensions(block: &[u8]) -> CodecResult<Vec<Extension<'_>>> {
    let mut extensions = Vec::new();
    let mut remaining = block.len();
    let mut pos = 0;

    while remaining > 0 {
        if remaining < 4 {
            return Err(CodecError::invalid_extension(format!(
                "{} trailing bytes cannot hold an extension header",
                remaining
            )));
        }
        let ext_type = u16::from_be_bytes([block[pos], block[pos + 1]]);
        let length = u16::from_be_bytes([block[pos + 2], block[pos + 3]]) as usize;
        if length + 4 > remaining {
            return Err(CodecError::invalid_extension(format!(
                "extension 0x{:04x} declares {} bytes, {} left",
                ext_type,
                length,
                remaining - 4
            )));
        }
        extensions.push(Extension {
            ext_type,
            data: &block[pos + 4..pos + 4 + length],
        });
        pos += length + 4;
        remaining -= length + 4;
    }

    Ok(extensions)
}

/// First extension of the given type, if any
pub fn find_extension<'a>(extensions: &[Extension<'a>], ext_type: u16) -> Option<Extension<'a>> {
    extensions.iter().copied().find(|e| e.ext_type == ext_type)
}

/// Reject blocks where the same extension type appears twice
pub fn check_unique(extensions: &[Extension<'_>]) -> CodecResult<()> {
    let mut seen = HashSet::with_capacity(extensions.len());
    for ext in extensions {
        if !seen.insert(ext.ext_type) {
            return Err(CodecError::DuplicateExtension { ext_type: ext.ext_type });
        }
    }
    Ok(())
}

// ============= Server Name Indication =============

/// Requested server name from the SNI extension
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServerName {
    HostName(String),
}

impl ServerName {
    pub fn host_name(name: impl Into<String>) -> Self {
        Self::HostName(name.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::HostName(name) => name,
        }
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a server_name extension body.
///
/// Only `host_name` entries are returned; entries of other types are
/// skipped. A name type appearing twice is rejected.
pub fn parse_server_name(data: &[u8]) -> CodecResult<Vec<ServerName>> {
    // An empty body is legal in a ServerHello acknowledging SNI
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let mut reader = ByteReader::new(data);
    let list = reader.read_vec16("server name list")?;
    if !reader.is_empty() {
        return Err(CodecError::invalid_extension(format!(
            "server_name: {} bytes after name list",
            reader.remaining()
        )));
    }

    let mut names = Vec::new();
    let mut seen_types = HashSet::new();
    let mut list_reader = ByteReader::new(list);

    while !list_reader.is_empty() {
        let name_type = list_reader.read_u8("server name type")?;
        let name = list_reader.read_vec16("server name")?;

        if !seen_types.insert(name_type) {
            return Err(CodecError::DuplicateExtension { ext_type: name_type as u16 });
        }

        if name_type != SNI_HOST_NAME {
            continue;
        }
        if name.is_empty() {
            return Err(CodecError::invalid_extension("server_name: empty host name"));
        }
        let host = std::str::from_utf8(name)
            .ok()
            .filter(|h| h.is_ascii())
            .ok_or_else(|| CodecError::invalid_extension("server_name: host name is not ASCII"))?;
        names.push(ServerName::HostName(host.to_string()));
    }

    Ok(names)
}

/// Encode a complete server_name extension (type + length + body) for one host
pub fn encode_server_name_extension(host: &str) -> CodecResult<Vec<u8>> {
    let name = host.as_bytes();
    if name.is_empty() || name.len() > u16::MAX as usize - 5 {
        return Err(CodecError::invalid_extension(format!(
            "server_name: unusable host name length {}",
            name.len()
        )));
    }

    let list_len = 3 + name.len();
    let ext_len = 2 + list_len;
    let mut ext = Vec::with_capacity(4 + ext_len);
    ext.extend_from_slice(&extension_type::SERVER_NAME.to_be_bytes());
    ext.extend_from_slice(&(ext_len as u16).to_be_bytes());
    ext.extend_from_slice(&(list_len as u16).to_be_bytes());
    ext.push(SNI_HOST_NAME);
    ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
    ext.extend_from_slice(name);
    Ok(ext)
}

// ============= ALPN =============

/// Parse an ALPN extension body: `u16 list length, (u8 len, bytes)*`.
///
/// The declared list length must equal the sum of `protoLength + 1`.
pub fn parse_alpn(data: &[u8]) -> CodecResult<Vec<String>> {
    let mut reader = ByteReader::new(data);
    let list = reader.read_vec16("ALPN protocol list")?;
    if !reader.is_empty() {
        return Err(CodecError::invalid_extension(format!(
            "ALPN: list length {} disagrees with extension length {}",
            list.len(),
            data.len()
        )));
    }
    if list.is_empty() {
        return Err(CodecError::invalid_extension("ALPN: empty protocol list"));
    }

    let mut protocols = Vec::new();
    let mut list_reader = ByteReader::new(list);
    while !list_reader.is_empty() {
        let name = list_reader
            .read_vec8("ALPN protocol name")
            .map_err(|e| CodecError::invalid_extension(e.to_string()))?;
        if name.is_empty() {
            return Err(CodecError::invalid_extension("ALPN: empty protocol name"));
        }
        let proto = std::str::from_utf8(name)
            .ok()
            .filter(|p| p.is_ascii())
            .ok_or_else(|| CodecError::invalid_extension("ALPN: protocol name is not ASCII"))?;
        protocols.push(proto.to_string());
    }

    Ok(protocols)
}

/// Encode an ALPN extension body (list length + entries)
pub fn encode_alpn_body<S: AsRef<str>>(protocols: &[S]) -> CodecResult<Vec<u8>> {
    if protocols.is_empty() {
        return Err(CodecError::invalid_extension("ALPN: no protocols to encode"));
    }

    let mut list = Vec::new();
    for proto in protocols {
        let name = proto.as_ref().as_bytes();
        if name.is_empty() || name.len() > MAX_ALPN_PROTOCOL_LEN {
            return Err(CodecError::invalid_extension(format!(
                "ALPN: protocol name length {} outside 1..=255",
                name.len()
            )));
        }
        list.push(name.len() as u8);
        list.extend_from_slice(name);
    }

    if list.len() > u16::MAX as usize - 2 {
        return Err(CodecError::invalid_extension("ALPN: protocol list too long"));
    }

    let mut body = Vec::with_capacity(2 + list.len());
    body.extend_from_slice(&(list.len() as u16).to_be_bytes());
    body.extend_from_slice(&list);
    Ok(body)
}

/// Encode a complete ALPN extension (type + length + body)
pub fn encode_alpn_extension<S: AsRef<str>>(protocols: &[S]) -> CodecResult<Vec<u8>> {
    let body = encode_alpn_body(protocols)?;
    let mut ext = Vec::with_capacity(4 + body.len());
    ext.extend_from_slice(&extension_type::ALPN.to_be_bytes());
    ext.extend_from_slice(&(body.len() as u16).to_be_bytes());
    ext.extend_from_slice(&body);
    Ok(ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_ext(ext_type: u16, data: &[u8]) -> Vec<u8> {
        let mut out = ext_type.to_be_bytes().to_vec();
        out.extend_from_slice(&(data.len() as u16).to_be_bytes());
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn test_parse_extensions_walks_block() {
        let mut block = raw_ext(0x0a0a, &[]);
        block.extend_from_slice(&raw_ext(0x0010, &[0, 3, 2, b'h', b'2']));
        block.extend_from_slice(&raw_ext(0x1234, &[1, 2, 3]));

        let exts = parse_extensions(&block).unwrap();
        assert_eq!(exts.len(), 3);
        assert_eq!(exts[0].ext_type, 0x0a0a);
        assert!(exts[0].data.is_empty());
        assert_eq!(exts[2].data, &[1, 2, 3]);
        assert_eq!(exts.iter().map(|e| e.encoded_len()).sum::<usize>(), block.len());
    }

    #[test]
    fn test_parse_extensions_rejects_nonzero_remainder() {
        let mut block = raw_ext(0x0001, &[9, 9]);
        block.extend_from_slice(&[0x00, 0x02]);
        assert!(matches!(
            parse_extensions(&block),
            Err(CodecError::InvalidExtensionData { .. })
        ));

        let mut block = raw_ext(0x0001, &[9, 9]);
        block[3] = 5; // declares more than present
        assert!(matches!(
            parse_extensions(&block),
            Err(CodecError::InvalidExtensionData { .. })
        ));
    }

    #[test]
    fn test_check_unique() {
        let mut block = raw_ext(0x0010, &[0]);
        block.extend_from_slice(&raw_ext(0x0010, &[1]));
        let exts = parse_extensions(&block).unwrap();
        assert_eq!(check_unique(&exts), Err(CodecError::DuplicateExtension { ext_type: 0x0010 }));
    }

    #[test]
    fn test_server_name_roundtrip_through_encoder() {
        let ext = encode_server_name_extension("api.example.com").unwrap();
        let exts = parse_extensions(&ext).unwrap();
        assert_eq!(exts[0].ext_type, extension_type::SERVER_NAME);
        let names = parse_server_name(exts[0].data).unwrap();
        assert_eq!(names, vec![ServerName::host_name("api.example.com")]);
    }

    #[test]
    fn test_server_name_skips_unknown_types_and_rejects_duplicates() {
        // list: (type 7, "xx"), (type 0, "a.b")
        let list = [7, 0, 2, b'x', b'x', 0, 0, 3, b'a', b'.', b'b'];
        let mut data = (list.len() as u16).to_be_bytes().to_vec();
        data.extend_from_slice(&list);
        assert_eq!(parse_server_name(&data).unwrap(), vec![ServerName::host_name("a.b")]);

        let list = [0, 0, 1, b'a', 0, 0, 1, b'b'];
        let mut data = (list.len() as u16).to_be_bytes().to_vec();
        data.extend_from_slice(&list);
        assert!(matches!(
            parse_server_name(&data),
            Err(CodecError::DuplicateExtension { ext_type: 0 })
        ));
    }

    #[test]
    fn test_server_name_empty_body() {
        assert!(parse_server_name(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_alpn_encode_layout() {
        let body = encode_alpn_body(&["h2", "http/1.1"]).unwrap();
        // list length == sum(protoLength + 1)
        assert_eq!(u16::from_be_bytes([body[0], body[1]]) as usize, 3 + 9);
        assert_eq!(body.len(), 2 + 12);

        let ext = encode_alpn_extension(&["h2"]).unwrap();
        assert_eq!(ext, vec![0x00, 0x10, 0x00, 0x05, 0x00, 0x03, 0x02, b'h', b'2']);
    }

    #[test]
    fn test_alpn_parse() {
        let body = encode_alpn_body(&["h2", "spdy", "h3"]).unwrap();
        assert_eq!(parse_alpn(&body).unwrap(), vec!["h2", "spdy", "h3"]);
    }

    #[test]
    fn test_alpn_parse_rejects_length_mismatch() {
        let mut body = encode_alpn_body(&["h2"]).unwrap();
        body[1] += 1;
        assert!(parse_alpn(&body).is_err());

        let mut body = encode_alpn_body(&["h2"]).unwrap();
        body.push(0);
        assert!(parse_alpn(&body).is_err());

        // entry overruns the list
        let body = [0x00, 0x03, 0x05, b'h', b'2'];
        assert!(matches!(parse_alpn(&body), Err(CodecError::InvalidExtensionData { .. })));
    }

    #[test]
    fn test_alpn_encode_rejects_bad_names() {
        assert!(encode_alpn_body::<&str>(&[]).is_err());
        assert!(encode_alpn_body(&[""]).is_err());
        let long = "x".repeat(256);
        assert!(encode_alpn_body(&[long.as_str()]).is_err());
    }
}
