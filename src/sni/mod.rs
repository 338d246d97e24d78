//! SNI-based context selection for server-side conduits

pub mod dispatcher;
pub mod explorer;
pub mod table;

pub use dispatcher::{SniContext, SniDispatcher};
pub use explorer::{explore, explore_hello, Exploration};
pub use table::{SniTable, SniTableBuilder};
