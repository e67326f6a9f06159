//! Core types shared across the diskwatch crates.

use std::fmt;

/// Device protocol family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Ata,
    Scsi,
    Nvme,
}

impl Protocol {
    /// Name used in log lines and state file suffixes.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ata => "ATA",
            Protocol::Scsi => "SCSI",
            Protocol::Nvme => "NVMe",
        }
    }

    /// Suffix used for state and attribute log file names.
    #[must_use]
    pub fn file_suffix(&self) -> &'static str {
        match self {
            Protocol::Ata => "ata",
            Protocol::Scsi => "scsi",
            Protocol::Nvme => "nvme",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Warning message types.
///
/// The numeric order is load-bearing: it indexes the per-device throttle
/// records in the persistent state file (`mail.<N>.*` keys), so variants
/// must never be reordered. Type 0 is reserved for test messages and is
/// never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WarnType {
    EmailTest = 0,
    Health = 1,
    Usage = 2,
    SelfTest = 3,
    ErrorCount = 4,
    FailedHealthCheck = 5,
    FailedReadSmartData = 6,
    FailedReadSmartErrorLog = 7,
    FailedReadSmartSelfTestLog = 8,
    FailedOpenDevice = 9,
    CurrentPendingSector = 10,
    OfflineUncorrectableSector = 11,
    Temperature = 12,
}

/// Number of warning message types.
pub const NUM_WARN_TYPES: usize = 13;

impl WarnType {
    /// All types, in index order.
    pub const ALL: [WarnType; NUM_WARN_TYPES] = [
        WarnType::EmailTest,
        WarnType::Health,
        WarnType::Usage,
        WarnType::SelfTest,
        WarnType::ErrorCount,
        WarnType::FailedHealthCheck,
        WarnType::FailedReadSmartData,
        WarnType::FailedReadSmartErrorLog,
        WarnType::FailedReadSmartSelfTestLog,
        WarnType::FailedOpenDevice,
        WarnType::CurrentPendingSector,
        WarnType::OfflineUncorrectableSector,
        WarnType::Temperature,
    ];

    /// Index into the throttle record array.
    #[must_use]
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Name exported to the warning script as `SMARTD_FAILTYPE`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            WarnType::EmailTest => "EmailTest",
            WarnType::Health => "Health",
            WarnType::Usage => "Usage",
            WarnType::SelfTest => "SelfTest",
            WarnType::ErrorCount => "ErrorCount",
            WarnType::FailedHealthCheck => "FailedHealthCheck",
            WarnType::FailedReadSmartData => "FailedReadSmartData",
            WarnType::FailedReadSmartErrorLog => "FailedReadSmartErrorLog",
            WarnType::FailedReadSmartSelfTestLog => "FailedReadSmartSelfTestLog",
            WarnType::FailedOpenDevice => "FailedOpenDevice",
            WarnType::CurrentPendingSector => "CurrentPendingSector",
            WarnType::OfflineUncorrectableSector => "OfflineUncorrectableSector",
            WarnType::Temperature => "Temperature",
        }
    }

    /// Test messages are never recorded in persistent state.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        !matches!(self, WarnType::EmailTest)
    }
}

impl fmt::Display for WarnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format a byte capacity with an SI unit, e.g. `2.00 TB` or `500 GB`.
/// Used in canonical device identity strings.
#[must_use]
pub fn format_capacity(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit + 1 < UNITS.len() {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else if value >= 100.0 {
        format!("{value:.0} {}", UNITS[unit])
    } else if value >= 10.0 {
        format!("{value:.1} {}", UNITS[unit])
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warn_type_indices() {
        for (i, t) in WarnType::ALL.iter().enumerate() {
            assert_eq!(t.index(), i);
        }
        assert_eq!(WarnType::Temperature.index(), 12);
        assert!(!WarnType::EmailTest.is_persistent());
        assert!(WarnType::Health.is_persistent());
    }

    #[test]
    fn test_format_capacity() {
        assert_eq!(format_capacity(500), "500 B");
        assert_eq!(format_capacity(500_107_862_016), "500 GB");
        assert_eq!(format_capacity(2_000_398_934_016), "2.00 TB");
        assert_eq!(format_capacity(64_000_000_000), "64.0 GB");
    }

    #[test]
    fn test_protocol_names() {
        assert_eq!(Protocol::Ata.as_str(), "ATA");
        assert_eq!(Protocol::Nvme.file_suffix(), "nvme");
    }
}
