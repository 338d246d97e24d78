//! Conduit lifecycle state machine and orthogonal flags
//!
//! ```text
//! Handshaking ──finish──> Open ──read EOF──> ReadClosed ──┐
//!      │                    └───write shut──> WriteClosed ─┴──> Closed
//!      └──────────── any half/full close ──────────────────────────^
//! ```

use crate::stream::StreamState;

/// Where the connection is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Handshaking,
    Open,
    /// Inbound side done (close_notify or EOF); writes still allowed
    ReadClosed,
    /// Outbound side done (close_notify sent); reads still allowed
    WriteClosed,
    Closed,
}

impl Lifecycle {
    /// Handshake completed. Returns false when the transition already
    /// happened (or can no longer happen), so callers fire
    /// completion hooks exactly once.
    pub fn finish_handshake(&mut self) -> bool {
        if *self == Self::Handshaking {
            *self = Self::Open;
            true
        } else {
            false
        }
    }

    /// Mark the read side closed; returns the new state
    pub fn close_read(&mut self) -> Self {
        *self = match *self {
            Self::Handshaking | Self::Open | Self::ReadClosed => Self::ReadClosed,
            Self::WriteClosed | Self::Closed => Self::Closed,
        };
        *self
    }

    /// Mark the write side closed; returns the new state
    pub fn close_write(&mut self) -> Self {
        *self = match *self {
            Self::Handshaking | Self::Open | Self::WriteClosed => Self::WriteClosed,
            Self::ReadClosed | Self::Closed => Self::Closed,
        };
        *self
    }

    pub fn close(&mut self) {
        *self = Self::Closed;
    }

    pub fn is_handshaking(self) -> bool {
        self == Self::Handshaking
    }

    pub fn is_read_closed(self) -> bool {
        matches!(self, Self::ReadClosed | Self::Closed)
    }

    pub fn is_write_closed(self) -> bool {
        matches!(self, Self::WriteClosed | Self::Closed)
    }

    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}

impl StreamState for Lifecycle {
    fn is_terminal(&self) -> bool {
        self.is_closed()
    }

    fn is_poisoned(&self) -> bool {
        false
    }

    fn state_name(&self) -> &'static str {
        match self {
            Self::Handshaking => "Handshaking",
            Self::Open => "Open",
            Self::ReadClosed => "ReadClosed",
            Self::WriteClosed => "WriteClosed",
            Self::Closed => "Closed",
        }
    }
}

/// Cross-direction handshake dependencies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeDeps {
    /// A read cannot progress until the engine has wrapped (NEED_WRAP)
    pub read_requires_write: bool,
    /// A write cannot progress until the engine has unwrapped (NEED_UNWRAP)
    pub write_requires_read: bool,
}

impl HandshakeDeps {
    pub fn need_wrap(&mut self) {
        self.read_requires_write = true;
        self.write_requires_read = false;
    }

    pub fn need_unwrap(&mut self) {
        self.write_requires_read = true;
        self.read_requires_write = false;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn any(&self) -> bool {
        self.read_requires_write || self.write_requires_read
    }
}

/// Readiness the caller asked for, independent of what the transport is
/// currently armed for while handshake dependencies are in effect
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    pub reads_resumed: bool,
    pub writes_resumed: bool,
}
