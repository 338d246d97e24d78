use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::conduit::{BlockingPoolExecutor, ConduitSettings};
use crate::error::{ConduitError, Result};
use crate::protocol::constants::{MAX_ALPN_PROTOCOL_LEN, MAX_PLAINTEXT_LEN, TLS_HEADER_SIZE};
use crate::stream::BufferPool;

use super::types::*;

fn preprocess_includes(content: &str, base_dir: &Path, depth: u8) -> Result<String> {
    if depth > 10 {
        return Err(ConduitError::Config("Include depth > 10".into()));
    }
    let mut output = String::with_capacity(content.len());
    for line in content.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("include") {
            let rest = rest.trim();
            if let Some(rest) = rest.strip_prefix('=') {
                let path_str = rest.trim().trim_matches('"');
                let resolved = base_dir.join(path_str);
                let included = std::fs::read_to_string(&resolved)
                    .map_err(|e| ConduitError::Config(format!("{}: {}", resolved.display(), e)))?;
                let included_dir = resolved.parent().unwrap_or(base_dir);
                output.push_str(&preprocess_includes(&included, included_dir, depth + 1)?);
                output.push('\n');
                continue;
            }
        }
        output.push_str(line);
        output.push('\n');
    }
    Ok(output)
}

fn validate_protocol_names(section: &str, protocols: &[String]) -> Result<()> {
    for name in protocols {
        if name.is_empty() || name.len() > MAX_ALPN_PROTOCOL_LEN {
            return Err(ConduitError::Config(format!(
                "alpn.{}: protocol name must be 1..={} bytes, got {:?}",
                section, MAX_ALPN_PROTOCOL_LEN, name
            )));
        }
        if !name.is_ascii() {
            return Err(ConduitError::Config(format!(
                "alpn.{}: protocol name {:?} is not ASCII",
                section, name
            )));
        }
    }
    Ok(())
}

// ============= Main Config =============

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConduitConfig {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub conduit: ConduitSection,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub sni: SniSection,

    #[serde(default)]
    pub alpn: AlpnSection,
}

impl ConduitConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            std::fs::read_to_string(&path).map_err(|e| ConduitError::Config(e.to_string()))?;
        let base_dir = path.as_ref().parent().unwrap_or(Path::new("."));
        let processed = preprocess_includes(&content, base_dir, 0)?;

        let config: ConduitConfig =
            toml::from_str(&processed).map_err(|e| ConduitError::Config(e.to_string()))?;

        let mut seen = HashSet::new();
        for binding in &config.sni.bindings {
            if !seen.insert(binding.pattern.to_ascii_lowercase()) {
                warn!(pattern = %binding.pattern, "Duplicate sni.bindings pattern; the last binding wins");
            }
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sni.default.trim().is_empty() {
            return Err(ConduitError::Config("sni.default cannot be empty".to_string()));
        }

        for binding in &self.sni.bindings {
            if binding.pattern.trim().is_empty() || binding.context.trim().is_empty() {
                return Err(ConduitError::Config(
                    "sni.bindings entries need a pattern and a context".to_string(),
                ));
            }
        }

        validate_protocol_names("server_protocols", &self.alpn.server_protocols)?;
        validate_protocol_names("client_protocols", &self.alpn.client_protocols)?;

        if self.conduit.max_read_listener_invocations == 0 {
            return Err(ConduitError::Config(
                "conduit.max_read_listener_invocations must be > 0".to_string(),
            ));
        }

        if self.conduit.packet_buffer_size < MAX_PLAINTEXT_LEN + TLS_HEADER_SIZE {
            return Err(ConduitError::Config(format!(
                "conduit.packet_buffer_size must be >= {} (one full TLS record)",
                MAX_PLAINTEXT_LEN + TLS_HEADER_SIZE
            )));
        }

        if self.conduit.max_outstanding_tasks == 0 {
            return Err(ConduitError::Config(
                "conduit.max_outstanding_tasks must be > 0".to_string(),
            ));
        }

        if self.server.first_record_timeout_secs == 0 {
            return Err(ConduitError::Config(
                "server.first_record_timeout_secs must be > 0".to_string(),
            ));
        }

        self.listen_addr()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server.listen.parse().map_err(|e| {
            ConduitError::Config(format!("Invalid server.listen '{}': {}", self.server.listen, e))
        })
    }

    pub fn keepalive(&self) -> Option<Duration> {
        (self.server.keepalive_secs > 0).then(|| Duration::from_secs(self.server.keepalive_secs))
    }

    pub fn conduit_settings(&self) -> ConduitSettings {
        ConduitSettings {
            max_read_listener_invocations: self.conduit.max_read_listener_invocations,
        }
    }

    /// Pool of ciphertext buffers sized from `[conduit]`
    pub fn buffer_pool(&self) -> BufferPool {
        BufferPool::with_config(self.conduit.packet_buffer_size, self.conduit.pooled_buffers)
    }

    /// Delegated-task executor on the current tokio runtime
    pub fn task_executor(&self) -> Result<BlockingPoolExecutor> {
        BlockingPoolExecutor::current(self.conduit.max_outstanding_tasks)
    }
}
