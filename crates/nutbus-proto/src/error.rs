//! Bus error kinds

use thiserror::Error;

/// Errors surfaced by the bus client.
///
/// `Communication` and `Timeout` are transient: callers retry on the next
/// cycle. `Malformed` means the offending message must be dropped.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection failed: {0}")]
    Connect(String),

    #[error("bus communication error: {0}")]
    Communication(String),

    #[error("bus request timed out")]
    Timeout,

    #[error("malformed message: {0}")]
    Malformed(String),
}

impl BusError {
    /// True when retrying on the next cycle is reasonable.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Communication(_) | BusError::Timeout)
    }
}
