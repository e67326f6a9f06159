//! ATA protocol decoders
//!
//! Pure functions over the raw 512-byte blocks returned by the ATA SMART
//! command set:
//! - SMART attribute value and threshold tables
//! - the 21-entry self-test ring log
//! - offline-data-collection and self-test execution status codes
//!
//! The transport layer carries the bytes; everything here interprets them.

use diskwatch_common::{format_capacity, Error, Result};

/// Number of rows in the SMART attribute table.
pub const NUM_ATTRIBUTES: usize = 30;

/// Number of entries in the self-test ring log.
pub const SELFTEST_LOG_ENTRIES: usize = 21;

/// One row of the SMART attribute table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmartAttr {
    pub id: u8,
    pub flags: u16,
    pub current: u8,
    pub worst: u8,
    pub raw: [u8; 6],
    pub reserved: u8,
}

impl SmartAttr {
    /// Assemble the 48-bit raw value, little-endian.
    #[must_use]
    pub fn raw48(&self) -> u64 {
        u64::from(self.raw[0])
            | u64::from(self.raw[1]) << 8
            | u64::from(self.raw[2]) << 16
            | u64::from(self.raw[3]) << 24
            | u64::from(self.raw[4]) << 32
            | u64::from(self.raw[5]) << 40
    }

    /// Prefailure bit: set means the attribute predicts imminent failure
    /// when the normalized value crosses the threshold.
    #[must_use]
    pub fn is_prefail(&self) -> bool {
        self.flags & 0x01 != 0
    }
}

/// Decoded SMART READ DATA block.
#[derive(Debug, Clone, Default)]
pub struct SmartValues {
    pub revision: u16,
    pub attrs: [SmartAttr; NUM_ATTRIBUTES],
    pub offline_collection_status: u8,
    pub selftest_exec_status: u8,
    pub offline_collection_capability: u8,
    pub smart_capability: u16,
    pub errorlog_capability: u8,
}

impl SmartValues {
    /// Decode a 512-byte SMART READ DATA response.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 512 {
            return Err(Error::bad_response(format!(
                "SMART data block too short: {} bytes",
                buf.len()
            )));
        }
        if checksum(&buf[..512]) != 0 {
            return Err(Error::bad_response("invalid SMART data checksum"));
        }

        let mut values = SmartValues {
            revision: u16::from_le_bytes([buf[0], buf[1]]),
            offline_collection_status: buf[362],
            selftest_exec_status: buf[363],
            offline_collection_capability: buf[367],
            smart_capability: u16::from_le_bytes([buf[368], buf[369]]),
            errorlog_capability: buf[370],
            ..Default::default()
        };
        for (i, attr) in values.attrs.iter_mut().enumerate() {
            let row = &buf[2 + i * 12..2 + (i + 1) * 12];
            attr.id = row[0];
            attr.flags = u16::from_le_bytes([row[1], row[2]]);
            attr.current = row[3];
            attr.worst = row[4];
            attr.raw.copy_from_slice(&row[5..11]);
            attr.reserved = row[11];
        }
        Ok(values)
    }

    /// Index of the attribute with the given id, if present.
    #[must_use]
    pub fn find_attr(&self, id: u8) -> Option<usize> {
        if id == 0 {
            return None;
        }
        self.attrs.iter().position(|a| a.id == id)
    }

    #[must_use]
    pub fn supports_offline_immediate(&self) -> bool {
        self.offline_collection_capability & 0x01 != 0
    }

    #[must_use]
    pub fn supports_selftest(&self) -> bool {
        self.offline_collection_capability & 0x10 != 0
    }

    #[must_use]
    pub fn supports_conveyance(&self) -> bool {
        self.offline_collection_capability & 0x20 != 0
    }

    #[must_use]
    pub fn supports_selective(&self) -> bool {
        self.offline_collection_capability & 0x40 != 0
    }

    /// Error and self-test logging share one capability bit.
    #[must_use]
    pub fn supports_error_log(&self) -> bool {
        self.errorlog_capability & 0x01 != 0
    }
}

/// Decoded SMART READ THRESHOLDS block: threshold byte per table index.
#[derive(Debug, Clone, Default)]
pub struct SmartThresholds {
    pub revision: u16,
    pub entries: [(u8, u8); NUM_ATTRIBUTES], // (id, threshold)
}

impl SmartThresholds {
    /// Decode a 512-byte SMART READ THRESHOLDS response.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 512 {
            return Err(Error::bad_response(format!(
                "SMART threshold block too short: {} bytes",
                buf.len()
            )));
        }
        if checksum(&buf[..512]) != 0 {
            return Err(Error::bad_response("invalid SMART threshold checksum"));
        }
        let mut thres = SmartThresholds {
            revision: u16::from_le_bytes([buf[0], buf[1]]),
            ..Default::default()
        };
        for (i, entry) in thres.entries.iter_mut().enumerate() {
            let row = &buf[2 + i * 12..2 + (i + 1) * 12];
            *entry = (row[0], row[1]);
        }
        Ok(thres)
    }

    /// Threshold for the attribute at table index `idx`, matched by id.
    #[must_use]
    pub fn for_attr(&self, idx: usize, id: u8) -> Option<u8> {
        let (tid, thresh) = *self.entries.get(idx)?;
        (tid == id && id != 0).then_some(thresh)
    }
}

/// Classification of one attribute against its threshold. The order is
/// meaningful: states past `NoNormVal` carry a valid normalized value
/// (`NoThreshold` included, so those attributes are still tracked).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AttrState {
    NonExisting,
    NoNormVal,
    NoThreshold,
    Passing,
    FailedPast,
    FailedNow,
}

/// Classify an attribute per the vendor rules: normalized values 0x00,
/// 0xfe and 0xff carry no meaning, a zero threshold can never fail.
#[must_use]
pub fn classify_attr(attr: &SmartAttr, idx: usize, thresholds: &SmartThresholds) -> AttrState {
    if attr.id == 0 {
        return AttrState::NonExisting;
    }
    if matches!(attr.current, 0x00 | 0xfe | 0xff) {
        return AttrState::NoNormVal;
    }
    let Some(threshold) = thresholds.for_attr(idx, attr.id) else {
        return AttrState::NoThreshold;
    };
    if threshold == 0 {
        return AttrState::Passing;
    }
    if attr.current <= threshold {
        AttrState::FailedNow
    } else if attr.worst <= threshold {
        AttrState::FailedPast
    } else {
        AttrState::Passing
    }
}

/// Well-known attribute names, used in log lines and warning messages.
#[must_use]
pub fn attr_name(id: u8) -> &'static str {
    match id {
        1 => "Raw_Read_Error_Rate",
        2 => "Throughput_Performance",
        3 => "Spin_Up_Time",
        4 => "Start_Stop_Count",
        5 => "Reallocated_Sector_Ct",
        7 => "Seek_Error_Rate",
        9 => "Power_On_Hours",
        10 => "Spin_Retry_Count",
        12 => "Power_Cycle_Count",
        177 => "Wear_Leveling_Count",
        184 => "End-to-End_Error",
        187 => "Reported_Uncorrect",
        188 => "Command_Timeout",
        190 => "Airflow_Temperature_Cel",
        192 => "Power-Off_Retract_Count",
        193 => "Load_Cycle_Count",
        194 => "Temperature_Celsius",
        196 => "Reallocated_Event_Count",
        197 => "Current_Pending_Sector",
        198 => "Offline_Uncorrectable",
        199 => "UDMA_CRC_Error_Count",
        231 => "SSD_Life_Left",
        233 => "Media_Wearout_Indicator",
        241 => "Total_LBAs_Written",
        242 => "Total_LBAs_Read",
        _ => "Unknown_Attribute",
    }
}

/// Extract the drive temperature in Celsius from attribute 194 (or 190
/// as a fallback). The lowest raw byte carries the current value.
#[must_use]
pub fn temperature_value(values: &SmartValues) -> Option<u8> {
    for id in [194u8, 190] {
        if let Some(idx) = values.find_attr(id) {
            let t = values.attrs[idx].raw[0];
            if t > 0 && t < 255 {
                return Some(t);
            }
        }
    }
    None
}

/// One entry of the self-test ring log.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfTestEntry {
    pub number: u8,
    pub status: u8,
    pub hour: u16,
    pub checkpoint: u8,
    pub first_fail_lba: u32,
}

impl SelfTestEntry {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.number == 0
            && self.status == 0
            && self.hour == 0
            && self.checkpoint == 0
            && self.first_fail_lba == 0
    }
}

/// Decoded SMART self-test log (a 21-entry ring).
#[derive(Debug, Clone, Default)]
pub struct SelfTestLog {
    pub revision: u16,
    pub entries: [SelfTestEntry; SELFTEST_LOG_ENTRIES],
    pub most_recent: u8,
}

impl SelfTestLog {
    /// Decode the 512-byte self-test log sector.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 512 {
            return Err(Error::bad_response(format!(
                "self-test log too short: {} bytes",
                buf.len()
            )));
        }
        let mut log = SelfTestLog {
            revision: u16::from_le_bytes([buf[0], buf[1]]),
            most_recent: buf[508],
            ..Default::default()
        };
        for (i, entry) in log.entries.iter_mut().enumerate() {
            let row = &buf[2 + i * 24..2 + (i + 1) * 24];
            entry.number = row[0];
            entry.status = row[1];
            entry.hour = u16::from_le_bytes([row[2], row[3]]);
            entry.checkpoint = row[4];
            entry.first_fail_lba = u32::from_le_bytes([row[5], row[6], row[7], row[8]]);
        }
        Ok(log)
    }

    /// Count failed self-tests, walking from the newest entry toward the
    /// oldest. The count stops at the first successful extended test;
    /// `hour` is the power-on-hour stamp of the most recent failure.
    #[must_use]
    pub fn count_errors(&self) -> (u8, u64) {
        if self.most_recent == 0 {
            return (0, 0);
        }
        let mut errcnt: u8 = 0;
        let mut hour: u64 = 0;
        for i in (0..=20u32).rev() {
            let j = ((i + u32::from(self.most_recent)) % 21) as usize;
            let entry = &self.entries[j];
            if entry.is_empty() {
                continue;
            }
            let status = entry.status >> 4;
            if status == 0x0 && (entry.number & 0x7f) == 0x02 {
                // First successful extended self-test, stop count
                break;
            }
            if (0x3..=0x8).contains(&status) {
                errcnt = errcnt.saturating_add(1);
                if hour == 0 {
                    hour = u64::from(entry.hour);
                }
            }
        }
        (errcnt, hour)
    }
}

/// Offline data collection is running.
#[must_use]
pub fn offline_in_progress(status: u8) -> bool {
    status & 0x7f == 0x03
}

/// A self-test is running.
#[must_use]
pub fn selftest_in_progress(status: u8) -> bool {
    status >> 4 == 0xf
}

/// Text and criticality for an offline-data-collection status code.
/// Returns `None` for codes without a defined meaning.
#[must_use]
pub fn offline_status_text(status: u8) -> Option<(&'static str, bool)> {
    let msg = match status & 0x7f {
        0x00 => "was never started",
        0x02 => "was completed without error",
        0x03 => "is in progress",
        0x04 => "was suspended by an interrupting command from host",
        0x05 => "was aborted by an interrupting command from host",
        0x06 => "was aborted by the device with a fatal error",
        _ => return None,
    };
    Some((msg, status & 0x7f == 0x06))
}

/// Text and criticality for a self-test execution status high nibble.
/// Codes >= 4 are critical. In-progress (0xf) is handled by the caller.
#[must_use]
pub fn selftest_status_text(status: u8) -> Option<(&'static str, bool)> {
    let nibble = status >> 4;
    let msg = match nibble {
        0x0 => "completed without error",
        0x1 => "was aborted by the host",
        0x2 => "was interrupted by the host with a reset",
        0x3 => "could not complete due to a fatal or unknown error",
        0x4 => "completed with error (unknown test element)",
        0x5 => "completed with error (electrical test element)",
        0x6 => "completed with error (servo/seek test element)",
        0x7 => "completed with error (read test element)",
        0x8 => "completed with error (handling damage?)",
        _ => return None,
    };
    Some((msg, nibble >= 0x4))
}

/// Drive identity as read from IDENTIFY DEVICE.
#[derive(Debug, Clone, Default)]
pub struct AtaIdentity {
    pub model: String,
    pub serial: String,
    pub firmware: String,
    /// (naa, oui, unique id) when the drive reports a world wide name.
    pub wwn: Option<(u8, u32, u64)>,
    pub capacity: u64,
    pub sectors: u64,
    /// 0 = unknown, 1 = SSD, > 1 = rotation rate in RPM.
    pub rotation_rate: i32,
    pub smart_supported: bool,
    pub smart_enabled: bool,
    pub security_locked: bool,
    pub gp_logging: bool,
    pub sct_erc_capable: bool,
}

impl AtaIdentity {
    /// Canonical identity string used for warning mails and duplicate
    /// detection: model, serial, WWN, firmware, capacity.
    #[must_use]
    pub fn idinfo(&self) -> String {
        let wwn = match self.wwn {
            Some((naa, oui, id)) => format!("WWN:{naa:x}-{oui:06x}-{id:09x}, "),
            None => String::new(),
        };
        format!(
            "{}, S/N:{}, {}FW:{}, {}",
            self.model,
            self.serial,
            wwn,
            self.firmware,
            format_capacity(self.capacity)
        )
    }
}

/// Sum of a 512-byte block, used to validate SMART data checksums.
fn checksum(buf: &[u8]) -> u8 {
    buf.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}
