use thiserror::Error;

/// Crate-wide error type.
///
/// `Write` and `Read` carry the underlying store or transport failure as a
/// source but present a generic message: callers surface them to the user
/// verbatim and never retry automatically.
#[derive(Error, Debug)]
pub enum AppError {
    /// Rejected before any network call (empty content, self-messaging).
    #[error("invalid message: {0}")]
    Validation(&'static str),
    /// Durable write failed, including a store-level policy rejection.
    #[error("message not delivered, you may not be connected")]
    Write(#[source] anyhow::Error),
    /// Durable read failed.
    #[error("could not load messages")]
    Read(#[source] anyhow::Error),
    /// Pub/sub channel failure (subscribe or publish).
    #[error("transport error: {0}")]
    Transport(String),
    /// A thread fetch resolved after the user selected a different thread.
    /// Internal bookkeeping, never shown to the user and never logged as an
    /// error.
    #[error("selection changed before the thread loaded")]
    StaleSelection,
    /// The coordinator task has shut down and no longer accepts commands.
    #[error("coordinator is closed")]
    Closed,
}

impl AppError {
    pub fn write(source: impl Into<anyhow::Error>) -> Self {
        Self::Write(source.into())
    }

    pub fn read(source: impl Into<anyhow::Error>) -> Self {
        Self::Read(source.into())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
