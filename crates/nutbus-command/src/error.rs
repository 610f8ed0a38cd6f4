//! Command path errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CommandError {
    /// The command-path NUT session is gone. Fatal: the supervisor is
    /// expected to exit.
    #[error("NUT command session lost: {0}")]
    SessionLost(String),

    #[error("NUT error: {0}")]
    Nut(#[from] nutbus_client::NutError),

    #[error("bus error: {0}")]
    Bus(#[from] nutbus_proto::BusError),

    #[error("tracker is shut down")]
    TrackerGone,
}
