//! Monitoring errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("mapping file error: {0}")]
    Mapping(String),

    #[error("NUT error: {0}")]
    Nut(#[from] nutbus_client::NutError),

    #[error("bus error: {0}")]
    Bus(#[from] nutbus_proto::BusError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
