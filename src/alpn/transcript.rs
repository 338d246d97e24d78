//! Handshake transcript hash hook
//!
//! Engines that hash handshake messages incrementally expose the running
//! state through [`TranscriptHash`] so the ALPN shims can reset it and
//! replay it over the bytes that actually crossed the wire.

use sha2::{Digest, Sha256};

pub trait TranscriptHash: Send {
    /// Drop everything hashed so far
    fn reset(&mut self);

    /// Feed one or more complete handshake messages
    fn update(&mut self, bytes: &[u8]);

    /// Digest of everything fed since the last reset, without consuming state
    fn current_hash(&self) -> Vec<u8>;
}

/// Reset `transcript` and feed `messages` in order
pub fn replay(transcript: &mut dyn TranscriptHash, messages: &[&[u8]]) {
    transcript.reset();
    for message in messages {
        transcript.update(message);
    }
}

/// Running SHA-256 over handshake messages
#[derive(Clone, Default)]
pub struct Sha256Transcript {
    hasher: Sha256,
}

impl Sha256Transcript {
    pub fn new() -> Self {
        Self { hasher: Sha256::new() }
    }
}

impl TranscriptHash for Sha256Transcript {
    fn reset(&mut self) {
        self.hasher = Sha256::new();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    fn current_hash(&self) -> Vec<u8> {
        self.hasher.clone().finalize().to_vec()
    }
}

impl std::fmt::Debug for Sha256Transcript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sha256Transcript").finish_non_exhaustive()
    }
}
