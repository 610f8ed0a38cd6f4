//! nutbus message-bus surface
//!
//! Typed asset/metric/alert/inventory messages, the frame-based mailbox
//! protocol used for request/reply exchanges, and a thin client wrapper
//! over the NATS connection.

pub mod bus;
pub mod error;
pub mod message;
pub mod subject;

pub use bus::BusClient;
pub use error::BusError;
pub use message::{
    AlertMessage, AlertState, AssetMessage, AssetOperation, InventoryMessage, MetricMessage,
};
