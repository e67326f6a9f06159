//! Monitoring engine for diskwatch
//!
//! Everything between the device layer and the daemon loop:
//! - the monitoring configuration parser (per-device directives)
//! - per-device persistent state and attribute logs
//! - the device registrar (probe, dedupe, enroll)
//! - the per-cycle check engine
//! - the calendar-regex self-test scheduler
//! - the rate-limited warning pipeline

pub mod check;
pub mod config;
pub mod registrar;
pub mod scheduler;
pub mod state;
pub mod warning;

pub use check::{check_device, standby_check, CheckContext, StandbyDisable, DEFAULT_CHECK_INTERVAL};
pub use config::{parse_config_file, parse_config_text, ConfigParse, DevConfig, EmailFreq};
pub use registrar::{
    register_devices, MonitoredDevice, Notifier, NullNotifier, RegistrarOptions,
};
pub use state::{append_attrlog, write_state, DevState, PersistState};
pub use warning::Warner;
