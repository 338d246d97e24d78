use std::fmt;

use serde::{Deserialize, Serialize};

use super::defaults::*;

// ============= Log Level =============

/// Verbosity of the `tlsconduit` targets. Other crates stay at `warn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Per-record and per-state-transition trace output
    Debug,
    /// Dispatch decisions, ALPN outcomes and conduit state changes
    Verbose,
    /// One line per connection plus warnings
    #[default]
    Normal,
    /// Warnings and errors only
    Silent,
}

impl LogLevel {
    /// `EnvFilter` directives for this level
    pub fn to_filter_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "warn,tlsconduit=trace",
            LogLevel::Verbose => "warn,tlsconduit=debug",
            LogLevel::Normal => "warn,tlsconduit=info",
            LogLevel::Silent => "warn",
        }
    }

    /// Lenient parse for `--log-level`; unknown names fall back to `Normal`
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" | "debug" => LogLevel::Debug,
            "verbose" => LogLevel::Verbose,
            "warn" | "warning" | "error" | "silent" | "quiet" => LogLevel::Silent,
            _ => LogLevel::Normal,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Verbose => "verbose",
            LogLevel::Normal => "normal",
            LogLevel::Silent => "silent",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============= Sections =============

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default)]
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConduitSection {
    /// Read listener re-invocations without progress before the connection
    /// is closed.
    #[serde(default = "default_max_read_listener_invocations")]
    pub max_read_listener_invocations: usize,

    /// Pooled ciphertext buffer size.
    #[serde(default = "default_packet_buffer_size")]
    pub packet_buffer_size: usize,

    /// Buffers retained per pool once returned.
    #[serde(default = "default_pooled_buffers")]
    pub pooled_buffers: usize,

    /// Delegated tasks admitted to the worker pool at once.
    #[serde(default = "default_max_outstanding_tasks")]
    pub max_outstanding_tasks: usize,
}

impl Default for ConduitSection {
    fn default() -> Self {
        Self {
            max_read_listener_invocations: default_max_read_listener_invocations(),
            packet_buffer_size: default_packet_buffer_size(),
            pooled_buffers: default_pooled_buffers(),
            max_outstanding_tasks: default_max_outstanding_tasks(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// TCP keepalive; 0 disables.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// How long an accepted connection may take to send its first record.
    #[serde(default = "default_first_record_timeout_secs")]
    pub first_record_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            keepalive_secs: default_keepalive_secs(),
            first_record_timeout_secs: default_first_record_timeout_secs(),
        }
    }
}

/// One host pattern bound to a named TLS context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SniBinding {
    /// Exact host name or `*` glob
    pub pattern: String,
    pub context: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SniSection {
    /// Context used when no binding matches.
    #[serde(default = "default_sni_context")]
    pub default: String,

    #[serde(default)]
    pub bindings: Vec<SniBinding>,
}

impl Default for SniSection {
    fn default() -> Self {
        Self {
            default: default_sni_context(),
            bindings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlpnSection {
    /// Server preference order.
    #[serde(default = "default_protocols")]
    pub server_protocols: Vec<String>,

    #[serde(default = "default_protocols")]
    pub client_protocols: Vec<String>,
}

impl Default for AlpnSection {
    fn default() -> Self {
        Self {
            server_protocols: default_protocols(),
            client_protocols: default_protocols(),
        }
    }
}
