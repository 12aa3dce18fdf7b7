//! Error types for the runtime
//!
//! All fallible runtime operations return [`RuntimeError`]. Errors raised at a
//! suspension point (timeouts, cancellations) surface as the `Err` result of
//! the suspended call; channel and selector errors surface at the operation
//! site.

use std::time::Duration;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors produced by the runtime and its primitives
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// A blocking primitive's deadline elapsed before the awaited event.
    #[error("operation timed out")]
    Timeout,

    /// The task was cancelled while suspended.
    #[error("task was cancelled")]
    Cancelled,

    /// A write met a closed channel, or a queued writer was woken by close.
    #[error("channel is closed")]
    ChannelClosed,

    /// Cancellation targeted a task that is not suspended in a wait structure.
    #[error("task is not blocked on a runtime wait")]
    NotBlocked,

    /// A second task tried to register I/O interest on the same handle.
    #[error("another task is already waiting on this handle")]
    AlreadyWaiting,

    /// Awaiting this task would close a cycle in the awaiter graph.
    #[error("cyclic await between tasks")]
    CyclicAwait,

    /// Every owner of the awaited flag identity was dropped.
    #[error("flag source is gone")]
    FlagSourceGone,

    /// The API was misused (e.g. a blocking call outside the runtime).
    #[error("usage error: {0}")]
    UsageError(String),

    /// An underlying I/O or multiplexer failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// Invalid runtime configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl RuntimeError {
    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        RuntimeError::UsageError(msg.into())
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        RuntimeError::Io(err.to_string())
    }
}

/// How a suspension primitive's deadline is determined.
///
/// `Default(None)` resolves to the configured default timeout; internal waits
/// (scope drain, publisher demand) park with `Never` and rely on their wake
/// source.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Deadline {
    /// Explicit timeout, or the configured default when `None`.
    Default(Option<Duration>),
    /// Absolute deadline shared across several waits (used by `select`).
    At(std::time::Instant),
    /// No deadline; the wait is only ended by its wake source.
    Never,
}
