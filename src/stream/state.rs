//! State-machine plumbing shared by stream wrappers

/// Common introspection for explicit state-machine enums
pub trait StreamState: std::fmt::Debug {
    /// No further transitions are possible
    fn is_terminal(&self) -> bool;

    /// Entered because of an error rather than an orderly close
    fn is_poisoned(&self) -> bool;

    /// Short name for logs
    fn state_name(&self) -> &'static str;
}
