//! Device access layer for diskwatch
//!
//! Provides:
//! - The transport facade: a uniform open/close/command surface over
//!   ATA, SCSI and NVMe devices, returning typed errors
//! - Pure protocol decoders for SMART attribute tables, self-test logs,
//!   error logs and health pages
//! - A scripted in-memory transport for tests
//!
//! The facade never interprets device semantics; interpretation belongs
//! to the decoders and to the monitoring engine above.

pub mod ata;
pub mod mock;
pub mod nvme;
pub mod scsi;
pub mod transport;

pub use transport::{
    AnyDevice, AtaDevice, AtaSetting, AtaTest, Device, DeviceFactory, HealthStatus, NvmeDevice,
    PowerMode, ScannedDevice, ScsiDevice, SelectiveMode,
};
