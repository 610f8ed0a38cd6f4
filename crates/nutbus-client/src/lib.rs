//! nutbus NUT daemon adapter
//!
//! A small verb set over the NUT network protocol on `localhost:3493`:
//! device enumeration, variable reads, and tracking-ID-bearing instant
//! commands. The adapter never reconnects silently; on a communication
//! error the caller decides whether to retry on the next cycle.

pub mod client;
pub mod error;
pub mod protocol;

pub use client::{NutClient, TrackingId, TrackingResult};
pub use error::NutError;
