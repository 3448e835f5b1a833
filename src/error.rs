//! Error types for FernSonic

use thiserror::Error;

/// Errors surfaced by the FernSonic API.
///
/// Every variant carries a display string; the enum is `Clone` so failures
/// recorded during asynchronous loads can be re-surfaced by later lookups of
/// the same buffer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FernSonicError {
    /// The operation requires its context to be current, and it is not.
    #[error("context is not current: {0}")]
    ContextMismatch(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Duplicate(String),

    /// Removal or release was attempted while the object is referenced.
    #[error("in use: {0}")]
    InUse(String),

    /// No backend voices are available and none can be evicted.
    #[error("no voices available: {0}")]
    Capacity(String),

    #[error("format not supported: {0}")]
    FormatUnsupported(String),

    #[error("backend error: {0}")]
    Backend(String),

    /// Reparenting a source group would create a cycle.
    #[error("source group cycle: {0}")]
    Cycle(String),

    /// The operation needs a backend capability that is absent.
    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("decode error: {0}")]
    Decode(String),

    /// A handle outlived the object it referred to.
    #[error("stale handle: {0}")]
    StaleHandle(String),

    #[error("I/O error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FernSonicError>;
