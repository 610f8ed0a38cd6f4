//! nutbus polling engines
//!
//! Periodic NUT reads turned into metric, alert, status and sensor
//! streams: the device polling engine (measurements, status bitfields,
//! inventory), the alert scanner (threshold rules and alert events) and
//! the sensor topology resolver and poller.

pub mod alarm;
pub mod alert;
pub mod device;
pub mod engine;
pub mod error;
pub mod mapping;
pub mod sensor;
pub mod sensors;
pub mod status;

pub use engine::NutAgent;
pub use error::MonitorError;
pub use mapping::Mapping;
