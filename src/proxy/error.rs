//! Page fetch failures

use thiserror::Error;

/// Why a single page request did not yield a usable page
#[derive(Debug, Error)]
pub enum PageError {
    /// Source answered with a non-success status
    #[error("HTTP status: {0}")]
    Status(u16),

    /// Connection, TLS or timeout failure
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Body did not have the expected shape
    #[error("decode error: {0}")]
    Decode(String),
}

impl PageError {
    /// Transient failures are retried; a decode failure is not
    pub fn is_transient(&self) -> bool {
        matches!(self, PageError::Status(_) | PageError::Transport(_))
    }
}
