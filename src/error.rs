//! Error Types

use std::fmt;
use thiserror::Error;

// ============= Codec Errors =============

/// Errors raised while parsing or rewriting TLS record/handshake bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Not enough bytes yet; retry once more data has arrived
    Underflow {
        needed: usize,
        available: usize,
    },
    /// A length or field disagrees with the bytes actually present
    Protocol {
        details: String,
    },
    /// Handshake message of the wrong type at this point
    UnexpectedMessageType {
        expected: u8,
        got: u8,
    },
    /// Extension block or extension body is malformed
    InvalidExtensionData {
        details: String,
    },
    /// First record is not a handshake record
    NotHandshakeRecord {
        content_type: u8,
    },
    /// Same extension (or SNI name type) seen twice in one hello
    DuplicateExtension {
        ext_type: u16,
    },
    /// Record or hello version outside what we handle
    UnsupportedVersion {
        major: u8,
        minor: u8,
    },
}

impl CodecError {
    pub fn protocol(details: impl Into<String>) -> Self {
        Self::Protocol { details: details.into() }
    }

    pub fn invalid_extension(details: impl Into<String>) -> Self {
        Self::InvalidExtensionData { details: details.into() }
    }

    pub fn underflow(needed: usize, available: usize) -> Self {
        Self::Underflow { needed, available }
    }

    pub fn is_underflow(&self) -> bool {
        matches!(self, Self::Underflow { .. })
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Underflow { needed, available } => {
                write!(f, "buffer underflow: need {} bytes, have {}", needed, available)
            }
            Self::Protocol { details } => {
                write!(f, "protocol error: {}", details)
            }
            Self::UnexpectedMessageType { expected, got } => {
                write!(
                    f,
                    "unexpected handshake message: expected type {}, got {}",
                    expected, got
                )
            }
            Self::InvalidExtensionData { details } => {
                write!(f, "invalid extension data: {}", details)
            }
            Self::NotHandshakeRecord { content_type } => {
                write!(f, "not a handshake record: content type 0x{:02x}", content_type)
            }
            Self::DuplicateExtension { ext_type } => {
                write!(f, "duplicate extension or name type: 0x{:04x}", ext_type)
            }
            Self::UnsupportedVersion { major, minor } => {
                write!(f, "unsupported version {}.{}", major, minor)
            }
        }
    }
}

impl std::error::Error for CodecError {}

impl From<CodecError> for std::io::Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Underflow { .. } => {
                std::io::Error::new(std::io::ErrorKind::WouldBlock, err)
            }
            _ => std::io::Error::new(std::io::ErrorKind::InvalidData, err),
        }
    }
}

/// Result type for codec operations
pub type CodecResult<T> = std::result::Result<T, CodecError>;

// ============= Recoverable Trait =============

/// Trait for errors that may be recoverable
pub trait Recoverable {
    /// Check if error is recoverable (can retry operation)
    fn is_recoverable(&self) -> bool;

    /// Check if connection can continue after this error
    fn can_continue(&self) -> bool;
}

impl Recoverable for CodecError {
    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Underflow { .. })
    }

    fn can_continue(&self) -> bool {
        self.is_recoverable()
    }
}

impl Recoverable for std::io::Error {
    fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::TimedOut
        )
    }

    fn can_continue(&self) -> bool {
        !matches!(
            self.kind(),
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
        )
    }
}

// ============= Main Conduit Errors =============

#[derive(Error, Debug)]
pub enum ConduitError {
    // ============= Codec / Protocol Errors =============

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("TLS protocol error: {0}")]
    Protocol(String),

    #[error("Buffer overflow after growing to {capacity} bytes")]
    BufferOverflow { capacity: usize },

    #[error("ALPN negotiation abandoned: {0}")]
    NegotiationAbandoned(String),

    #[error("Application protocol already negotiated: {existing}")]
    ProtocolAlreadySet { existing: String },

    // ============= Channel Errors =============

    #[error("Transport closed")]
    TransportClosed,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Delegated task rejected")]
    DelegatedTaskRejected,

    // ============= Dispatch / Config Errors =============

    #[error("No TLS context for server names {names:?} and no default configured")]
    NoContext { names: Vec<String> },

    #[error("Unsupported engine operation: {0}")]
    Unsupported(&'static str),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConduitError {
    /// Fatal errors close the connection after a best-effort alert flush.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Codec(e) => !e.is_recoverable(),
            Self::Protocol(_) | Self::BufferOverflow { .. } | Self::ProtocolAlreadySet { .. } => true,
            Self::Io(e) => !e.can_continue(),
            _ => false,
        }
    }
}

impl Recoverable for ConduitError {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Codec(e) => e.is_recoverable(),
            Self::Io(e) => e.is_recoverable(),
            Self::NegotiationAbandoned(_) => true,
            _ => false,
        }
    }

    fn can_continue(&self) -> bool {
        match self {
            Self::Codec(e) => e.can_continue(),
            Self::Io(e) => e.can_continue(),
            Self::NegotiationAbandoned(_) => true,
            _ => false,
        }
    }
}

impl From<ConduitError> for std::io::Error {
    fn from(err: ConduitError) -> Self {
        match err {
            ConduitError::Io(e) => e,
            ConduitError::Codec(e) => e.into(),
            ConduitError::TransportClosed | ConduitError::ChannelClosed => {
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, err)
            }
            ConduitError::BufferOverflow { .. } => {
                std::io::Error::new(std::io::ErrorKind::OutOfMemory, err)
            }
            ConduitError::Protocol(_) | ConduitError::ProtocolAlreadySet { .. } => {
                std::io::Error::new(std::io::ErrorKind::InvalidData, err)
            }
            ConduitError::Unsupported(_) => {
                std::io::Error::new(std::io::ErrorKind::Unsupported, err)
            }
            _ => std::io::Error::other(err),
        }
    }
}

/// Convenient Result type alias
pub type Result<T> = std::result::Result<T, ConduitError>;
