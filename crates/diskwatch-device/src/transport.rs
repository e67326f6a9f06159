//! Transport facade
//!
//! A uniform open/close/command surface over ATA, SCSI and NVMe devices.
//! The facade carries decoded structures and typed errors; it never
//! interprets their meaning. The OS pass-through adapters implement
//! these traits; `mock` provides a scripted in-memory implementation.

use crate::ata::{AtaIdentity, SelfTestLog, SmartThresholds, SmartValues};
use crate::nvme::{NvmeErrorEntry, NvmeIdentity, NvmeSelfTestLog, NvmeSmartLog};
use crate::scsi::{EcKind, ErrorCounters, IeStatus, LogPageSupport, ScsiIdentity};
use diskwatch_common::{Protocol, Result};

/// Power state reported by ATA CHECK POWER MODE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Sleep,
    Standby,
    StandbyY,
    Idle,
    IdleA,
    IdleB,
    IdleC,
    Active,
    ActiveOrIdle,
    /// Not an ATA compliant answer.
    Unknown(u8),
}

impl PowerMode {
    /// Name used in "is in X mode" log lines.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerMode::Sleep => "SLEEP",
            PowerMode::Standby => "STANDBY",
            PowerMode::StandbyY => "STANDBY_Y",
            PowerMode::Idle => "IDLE",
            PowerMode::IdleA => "IDLE_A",
            PowerMode::IdleB => "IDLE_B",
            PowerMode::IdleC => "IDLE_C",
            PowerMode::Active | PowerMode::ActiveOrIdle => "ACTIVE or IDLE",
            PowerMode::Unknown(_) => "UNKNOWN",
        }
    }

    /// Map the CHECK POWER MODE result byte.
    #[must_use]
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => PowerMode::Standby,
            0x01 => PowerMode::StandbyY,
            0x40 | 0x41 => PowerMode::Active,
            0x80 => PowerMode::Idle,
            0x81 => PowerMode::IdleA,
            0x82 => PowerMode::IdleB,
            0x83 => PowerMode::IdleC,
            0xff => PowerMode::ActiveOrIdle,
            other => PowerMode::Unknown(other),
        }
    }

    /// Rank used against the `-n` policy: 1 sleep, 2 standby, 3 idle,
    /// 4 active, `None` for non-compliant answers.
    #[must_use]
    pub fn rank(&self) -> Option<u8> {
        match self {
            PowerMode::Sleep => Some(1),
            PowerMode::Standby | PowerMode::StandbyY => Some(2),
            PowerMode::Idle | PowerMode::IdleA | PowerMode::IdleB | PowerMode::IdleC => Some(3),
            PowerMode::Active | PowerMode::ActiveOrIdle => Some(4),
            PowerMode::Unknown(_) => None,
        }
    }
}

/// SMART overall health verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Passed,
    Failed,
}

/// One-shot ATA device setting applied at registration (`-e`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtaSetting {
    /// `None` disables, `Some(level)` enables with 0..=254.
    Aam(Option<u8>),
    /// `None` disables, `Some(level)` enables with 1..=254.
    Apm(Option<u8>),
    LookAhead(bool),
    WriteCache(bool),
    Dsn(bool),
    /// `None` disables the standby timer, `Some(period)` sets it.
    StandbyTimer(Option<u8>),
    SecurityFreeze,
}

impl AtaSetting {
    /// Label used in the combined "ATA settings applied" message.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            AtaSetting::Aam(_) => "AAM",
            AtaSetting::Apm(_) => "APM",
            AtaSetting::LookAhead(_) => "Rd-ahead",
            AtaSetting::WriteCache(_) => "Wr-cache",
            AtaSetting::Dsn(_) => "DSN",
            AtaSetting::StandbyTimer(_) => "Standby",
            AtaSetting::SecurityFreeze => "Security freeze",
        }
    }
}

/// ATA self-test kind for EXECUTE OFFLINE IMMEDIATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtaTest {
    OfflineImmediate,
    Short,
    Extended,
    Conveyance,
    Selective,
}

/// Span selection mode for a selective self-test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectiveMode {
    /// Test the next span after the last one.
    Next,
    /// Continue an interrupted span.
    Continue,
    /// Redo the last span.
    Redo,
}

/// Common device surface.
pub trait Device {
    /// Open the device for commands.
    fn open(&mut self) -> Result<()>;

    /// Close the device. The OS/user may want it between cycles.
    fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;
}

/// ATA/SATA command surface.
pub trait AtaDevice: Device {
    fn identify(&mut self) -> Result<AtaIdentity>;
    fn read_smart_values(&mut self) -> Result<SmartValues>;
    fn read_smart_thresholds(&mut self) -> Result<SmartThresholds>;
    /// SMART RETURN STATUS.
    fn smart_status(&mut self) -> Result<HealthStatus>;
    fn enable_smart(&mut self) -> Result<()>;
    /// 1 = disable attribute autosave, 2 = enable.
    fn set_attribute_autosave(&mut self, enable: bool) -> Result<()>;
    /// Enable/disable the automatic offline test timer.
    fn set_auto_offline(&mut self, enable: bool) -> Result<()>;
    fn read_selftest_log(&mut self) -> Result<SelfTestLog>;
    /// Error count from the summary or extended comprehensive log.
    /// Zero when the log pointer says the log is empty.
    fn read_error_count(&mut self, extended: bool) -> Result<u64>;
    fn check_power_mode(&mut self) -> Result<PowerMode>;
    fn apply_setting(&mut self, setting: AtaSetting) -> Result<()>;
    /// SCT Error Recovery Control times, in deciseconds.
    fn set_sct_erc(&mut self, read_time: u16, write_time: u16) -> Result<()>;
    fn start_selftest(&mut self, test: AtaTest) -> Result<()>;
    /// Write the selective self-test span descriptor; returns the span
    /// (start, end) actually selected for the log.
    fn write_selective_span(
        &mut self,
        mode: SelectiveMode,
        prev_span: (u64, u64),
    ) -> Result<(u64, u64)>;
}

/// SCSI/SAS command surface.
pub trait ScsiDevice: Device {
    fn inquiry(&mut self) -> Result<ScsiIdentity>;
    fn test_unit_ready(&mut self) -> Result<()>;
    /// Informational Exceptions reporting enabled (MODE SENSE IE page).
    fn ie_enabled(&mut self) -> Result<bool>;
    /// Informational Exceptions status (IE page, falling back to the
    /// temperature page for readings).
    fn check_ie(&mut self) -> Result<IeStatus>;
    fn supported_log_pages(&mut self) -> Result<LogPageSupport>;
    fn error_counters(&mut self, kind: EcKind) -> Result<ErrorCounters>;
    fn non_medium_errors(&mut self) -> Result<u64>;
    /// (failed self-test count, hour of most recent failure).
    fn count_failed_selftests(&mut self) -> Result<(u8, u16)>;
    fn selftest_in_progress(&mut self) -> Result<bool>;
    fn set_gltsd(&mut self, disable_save: bool) -> Result<()>;
    /// `extended` selects the long test.
    fn start_selftest(&mut self, extended: bool) -> Result<()>;
}

/// NVMe admin command surface.
pub trait NvmeDevice: Device {
    fn identify_controller(&mut self) -> Result<NvmeIdentity>;
    /// Namespace this handle addresses, `BROADCAST_NSID` for the whole
    /// controller.
    fn nsid(&self) -> u32;
    fn smart_log(&mut self) -> Result<NvmeSmartLog>;
    fn error_log(&mut self, max_entries: usize) -> Result<Vec<NvmeErrorEntry>>;
    fn selftest_log(&mut self) -> Result<NvmeSelfTestLog>;
    /// Self-test code: 1 = short, 2 = extended.
    fn start_selftest(&mut self, code: u8) -> Result<()>;
}

/// A monitored device of any protocol.
pub enum AnyDevice {
    Ata(Box<dyn AtaDevice>),
    Scsi(Box<dyn ScsiDevice>),
    Nvme(Box<dyn NvmeDevice>),
}

impl AnyDevice {
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        match self {
            AnyDevice::Ata(_) => Protocol::Ata,
            AnyDevice::Scsi(_) => Protocol::Scsi,
            AnyDevice::Nvme(_) => Protocol::Nvme,
        }
    }

    fn device(&mut self) -> &mut dyn Device {
        match self {
            AnyDevice::Ata(dev) => dev.as_mut(),
            AnyDevice::Scsi(dev) => dev.as_mut(),
            AnyDevice::Nvme(dev) => dev.as_mut(),
        }
    }

    pub fn open(&mut self) -> Result<()> {
        self.device().open()
    }

    pub fn close(&mut self) -> Result<()> {
        self.device().close()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        match self {
            AnyDevice::Ata(dev) => dev.is_open(),
            AnyDevice::Scsi(dev) => dev.is_open(),
            AnyDevice::Nvme(dev) => dev.is_open(),
        }
    }
}

/// A device discovered by scanning.
pub struct ScannedDevice {
    /// Device node path.
    pub name: String,
    /// Type string for `SMARTD_DEVICETYPE` when scanning was filtered.
    pub dev_type: String,
    pub device: AnyDevice,
}

/// Constructs transport instances. The OS pass-through implementations
/// live outside this crate; tests and the default build use the mock.
pub trait DeviceFactory {
    /// Build a device for a configured name and `-d` type hint
    /// (empty = autodetect).
    fn device(&self, name: &str, type_hint: &str) -> Result<AnyDevice>;

    /// Enumerate devices for a DEVICESCAN entry, optionally restricted
    /// to the listed type hints.
    fn scan(&self, types: &[String]) -> Result<Vec<ScannedDevice>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_mode_mapping() {
        assert_eq!(PowerMode::from_code(0x00), PowerMode::Standby);
        assert_eq!(PowerMode::from_code(0x80), PowerMode::Idle);
        assert_eq!(PowerMode::from_code(0xff), PowerMode::ActiveOrIdle);
        assert_eq!(PowerMode::from_code(0x42), PowerMode::Unknown(0x42));
        assert_eq!(PowerMode::Sleep.rank(), Some(1));
        assert_eq!(PowerMode::IdleB.rank(), Some(3));
        assert_eq!(PowerMode::Unknown(0x42).rank(), None);
    }

    #[test]
    fn test_setting_labels() {
        assert_eq!(AtaSetting::Aam(Some(128)).label(), "AAM");
        assert_eq!(AtaSetting::StandbyTimer(None).label(), "Standby");
    }
}
