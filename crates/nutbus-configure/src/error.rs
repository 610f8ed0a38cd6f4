//! Configuration pipeline errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigureError {
    #[error("no suitable configuration found for {0}")]
    NoCandidate(String),

    #[error("asset {0} has no IP address")]
    NoAddress(String),

    #[error("credential document {0} not found")]
    CredentialNotFound(String),

    #[error("scanner failed: {0}")]
    Scanner(String),

    #[error("candidate store error: {0}")]
    Store(#[from] sled::Error),

    #[error("repository I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bus error: {0}")]
    Bus(#[from] nutbus_proto::BusError),

    #[error("malformed record: {0}")]
    Malformed(String),
}
