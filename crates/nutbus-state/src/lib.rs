//! nutbus asset state
//!
//! The catalog is an immutable snapshot of the monitored fleet. One writer
//! consumes asset events; any number of readers observe committed
//! snapshots through the [`snapshot::StateManager`] queue.

pub mod asset;
pub mod catalog;
pub mod protect;
pub mod snapshot;

pub use asset::Asset;
pub use catalog::AssetCatalog;
pub use protect::ProtectAsset;
pub use snapshot::{Reader, StateManager, Writer};
