//! Stream plumbing: pooled buffers and state-machine helpers

pub mod buffer_pool;
pub mod state;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use state::StreamState;
