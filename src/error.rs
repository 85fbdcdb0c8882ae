//! Errors surfaced to callers of the sentinel's exposed surface.
//!
//! Internal plumbing uses `anyhow`; only the conditions the HTTP layer has to
//! map onto a status code get a dedicated variant here.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("index out of range: {index} (buffered frames: {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("disk disabled")]
    DiskDisabled,

    #[error("invalid path component: {0}")]
    InvalidPath(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SentinelError {
    /// HTTP status code the control surface answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            SentinelError::IndexOutOfRange { .. }
            | SentinelError::InvalidSettings(_)
            | SentinelError::InvalidPath(_) => 400,
            SentinelError::DiskDisabled | SentinelError::NotFound(_) => 404,
            SentinelError::Io(_) => 500,
        }
    }
}
