//! Common types for the diskwatch storage health monitor.
//!
//! This crate holds the error taxonomy and the handful of core types
//! shared by the device layer, the monitoring engine and the daemon.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{format_capacity, Protocol, WarnType, NUM_WARN_TYPES};
