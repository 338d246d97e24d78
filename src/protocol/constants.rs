//! TLS wire constants

// ============= Record Layer =============

/// TLS record header size (type + version + length)
pub const TLS_HEADER_SIZE: usize = 5;

/// Handshake message header size (type + u24 length)
pub const HANDSHAKE_HEADER_SIZE: usize = 4;

/// Maximum plaintext fragment (2^14)
pub const MAX_PLAINTEXT_LEN: usize = 16384;

/// Practical cap for a record fragment on the wire (2^14 + 2048).
pub const MAX_RECORD_LEN: usize = MAX_PLAINTEXT_LEN + 2048;

/// Largest complete record including header
pub const MAX_PACKET_LEN: usize = TLS_HEADER_SIZE + MAX_RECORD_LEN;

pub const TLS_RECORD_CHANGE_CIPHER: u8 = 0x14;
pub const TLS_RECORD_ALERT: u8 = 0x15;
pub const TLS_RECORD_HANDSHAKE: u8 = 0x16;
pub const TLS_RECORD_APPLICATION: u8 = 0x17;

/// TLS 1.2 version bytes
pub const TLS_VERSION: [u8; 2] = [0x03, 0x03];

// ============= Handshake Types =============

pub mod handshake_type {
    pub const CLIENT_HELLO: u8 = 1;
    pub const SERVER_HELLO: u8 = 2;
    pub const CERTIFICATE: u8 = 11;
    pub const SERVER_KEY_EXCHANGE: u8 = 12;
    pub const SERVER_HELLO_DONE: u8 = 14;
    pub const FINISHED: u8 = 20;
}

// ============= Extension Types =============

pub mod extension_type {
    pub const SERVER_NAME: u16 = 0x0000;
    pub const ALPN: u16 = 0x0010;
}

/// SNI name type for DNS host names
pub const SNI_HOST_NAME: u8 = 0;

// ============= Alerts =============

pub mod alert {
    pub const LEVEL_WARNING: u8 = 1;
    pub const LEVEL_FATAL: u8 = 2;

    pub const CLOSE_NOTIFY: u8 = 0;
    pub const UNEXPECTED_MESSAGE: u8 = 10;
    pub const HANDSHAKE_FAILURE: u8 = 40;
    pub const DECODE_ERROR: u8 = 50;
    pub const INTERNAL_ERROR: u8 = 80;
    pub const UNRECOGNIZED_NAME: u8 = 112;
    pub const NO_APPLICATION_PROTOCOL: u8 = 120;
}

// ============= Limits =============

/// ALPN protocol names are 1..=255 bytes
pub const MAX_ALPN_PROTOCOL_LEN: usize = 255;

/// Session id is at most 32 bytes
pub const MAX_SESSION_ID_LEN: usize = 32;

/// Handshake random length
pub const RANDOM_LEN: usize = 32;
