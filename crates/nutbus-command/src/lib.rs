//! nutbus power-command tracking
//!
//! A logical command request fans out into NUT instant commands; the
//! tracker polls the returned tracking IDs and reports one aggregated
//! completion per request.

pub mod connector;
pub mod error;
pub mod tracker;

pub use connector::CommandConnector;
pub use error::CommandError;
pub use tracker::{CommandItem, CommandTracker};
