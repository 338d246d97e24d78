use crate::conduit::DEFAULT_MAX_READ_LISTENER_INVOCATIONS;
use crate::protocol::constants::MAX_PACKET_LEN;

// Helper defaults kept private to the config module.
pub(crate) fn default_max_read_listener_invocations() -> usize {
    DEFAULT_MAX_READ_LISTENER_INVOCATIONS
}

pub(crate) fn default_packet_buffer_size() -> usize {
    MAX_PACKET_LEN
}

pub(crate) fn default_pooled_buffers() -> usize {
    64
}

pub(crate) fn default_max_outstanding_tasks() -> usize {
    256
}

pub(crate) fn default_listen() -> String {
    "0.0.0.0:8443".to_string()
}

pub(crate) fn default_keepalive_secs() -> u64 {
    60
}

pub(crate) fn default_first_record_timeout_secs() -> u64 {
    10
}

pub(crate) fn default_sni_context() -> String {
    "default".to_string()
}

pub(crate) fn default_protocols() -> Vec<String> {
    vec!["h2".to_string(), "http/1.1".to_string()]
}
