//! NUT adapter errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NutError {
    /// TCP session down or the daemon is unreachable. The adapter does
    /// not reconnect; the caller retries on its next cycle.
    #[error("NUT communication error: {0}")]
    Communication(String),

    /// Device, variable or command absent on the daemon side.
    #[error("NUT object not found: {0}")]
    NotFound(String),

    /// The daemon answered something the protocol does not allow.
    #[error("NUT protocol error: {0}")]
    Protocol(String),

    /// Access denied by the daemon (command path credentials).
    #[error("NUT access denied: {0}")]
    AccessDenied(String),
}

impl From<std::io::Error> for NutError {
    fn from(err: std::io::Error) -> Self {
        NutError::Communication(err.to_string())
    }
}

impl NutError {
    /// Map an `ERR <code>` reply onto an error kind.
    pub fn from_daemon_code(code: &str) -> Self {
        match code {
            "UNKNOWN-UPS" | "VAR-NOT-SUPPORTED" | "CMD-NOT-SUPPORTED" | "UNKNOWN-COMMAND" => {
                NutError::NotFound(code.to_string())
            }
            "ACCESS-DENIED" | "USERNAME-REQUIRED" | "PASSWORD-REQUIRED" => {
                NutError::AccessDenied(code.to_string())
            }
            "DRIVER-NOT-CONNECTED" | "DATA-STALE" => NutError::Communication(code.to_string()),
            other => NutError::Protocol(other.to_string()),
        }
    }
}
