//! Crate-wide error type.
//!
//! Mirrors the shape of the teacher's `DaqError`: one variant per external failure
//! surface, with `#[from]` conversions wired up for the boundaries that have a clean
//! underlying error type.

use thiserror::Error;

pub type AppResult<T> = std::result::Result<T, SupervisorError>;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("the output buffer has been closed")]
    BufferClosed,

    #[error("the program has already started")]
    AlreadyStarted,

    #[error("the program has not started")]
    NotStarted,

    #[error("callback API error: {0}")]
    Callback(String),

    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("file watcher error: {0}")]
    Watcher(String),
}
