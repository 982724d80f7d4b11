pub mod controller;
pub mod scheduler;
#[cfg(test)]
pub(crate) mod testkit;

pub use controller::Controller;

/// Sentinel errors the engine surfaces typed so callers can match on them.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("run loop cancelled")]
    Cancelled,

    #[error("expected a schedule condition for task '{0}'")]
    NotScheduled(String),

    #[error("task '{0}' is already registered")]
    AlreadyRegistered(String),
}
