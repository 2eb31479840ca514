use thiserror::Error;

/// Errors surfaced by this crate.
///
/// Redundant `resolve`/`fail`/`cancel` calls are not errors; they report
/// `false` and leave the future untouched.
#[derive(Debug, Error)]
pub enum Error {
    /// Every handle to a still-pending future was dropped while it was
    /// being awaited.
    #[error("future was abandoned before reaching a terminal state")]
    Abandoned,

    /// The worker thread of a serial queue could not be started.
    #[error("failed to spawn queue worker: {0}")]
    Spawn(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
