//! Non-blocking encrypted conduit over a TLS engine

pub mod core;
pub mod executor;
pub mod listener;
pub mod state;

pub use self::core::{ConduitListener, ConduitSettings, EncryptedConduit, HandshakeListener, PeerInfo};
pub use executor::{BlockingPoolExecutor, InlineExecutor, Job, TaskExecutor};
pub use listener::DEFAULT_MAX_READ_LISTENER_INVOCATIONS;
pub use state::{HandshakeDeps, Interest, Lifecycle};
