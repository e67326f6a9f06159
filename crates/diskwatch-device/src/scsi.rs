//! SCSI protocol decoders
//!
//! Log Sense page decoding for the Informational Exceptions page,
//! error-counter pages, the self-test results page and the temperature
//! page, plus the identity string built from INQUIRY/VPD data.

use diskwatch_common::{format_capacity, Error, Result};

pub const SUPPORTED_LPAGES: u8 = 0x00;
pub const WRITE_ERROR_COUNTER_LPAGE: u8 = 0x02;
pub const READ_ERROR_COUNTER_LPAGE: u8 = 0x03;
pub const VERIFY_ERROR_COUNTER_LPAGE: u8 = 0x05;
pub const NON_MEDIUM_ERROR_LPAGE: u8 = 0x06;
pub const SELFTEST_RESULTS_LPAGE: u8 = 0x10;
pub const TEMPERATURE_LPAGE: u8 = 0x0d;
pub const IE_LPAGE: u8 = 0x2f;

/// Informational Exceptions status: the device's own health verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IeStatus {
    pub asc: u8,
    pub ascq: u8,
    /// Most recent temperature reading, 0 if not reported.
    pub temperature: u8,
    /// Temperature trip limit, 0 if not reported.
    pub trip_temperature: u8,
}

impl IeStatus {
    /// A self-test is running (asc 0x04, ascq 0x09).
    #[must_use]
    pub fn selftest_in_progress(&self) -> bool {
        self.asc == 0x04 && self.ascq == 0x09
    }
}

/// Which error-counter page to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcKind {
    Read,
    Write,
    Verify,
}

impl EcKind {
    pub const ALL: [EcKind; 3] = [EcKind::Read, EcKind::Write, EcKind::Verify];

    #[must_use]
    pub fn page_code(&self) -> u8 {
        match self {
            EcKind::Read => READ_ERROR_COUNTER_LPAGE,
            EcKind::Write => WRITE_ERROR_COUNTER_LPAGE,
            EcKind::Verify => VERIFY_ERROR_COUNTER_LPAGE,
        }
    }

    /// Label used in attribute log rows.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            EcKind::Read => "read",
            EcKind::Write => "write",
            EcKind::Verify => "verify",
        }
    }
}

/// The seven counters of an error-counter log page, indexed by parameter
/// code: corrected-fast, corrected-delayed, corrected-by-retry,
/// total-corrected, algorithm-invocations, bytes-processed, uncorrected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorCounters {
    pub counters: [u64; 7],
}

/// Log pages advertised by the device.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPageSupport {
    pub ie: bool,
    pub temperature: bool,
    pub read_ecounter: bool,
    pub write_ecounter: bool,
    pub verify_ecounter: bool,
    pub non_medium: bool,
    pub selftest: bool,
}

/// Walk the parameters of a log page: (code, data) pairs.
fn log_params(buf: &[u8]) -> Result<Vec<(u16, &[u8])>> {
    if buf.len() < 4 {
        return Err(Error::bad_response("log page shorter than header"));
    }
    let page_len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
    let end = (4 + page_len).min(buf.len());
    let mut params = Vec::new();
    let mut off = 4;
    while off + 4 <= end {
        let code = u16::from_be_bytes([buf[off], buf[off + 1]]);
        let len = usize::from(buf[off + 3]);
        if off + 4 + len > end {
            break;
        }
        params.push((code, &buf[off + 4..off + 4 + len]));
        off += 4 + len;
    }
    Ok(params)
}

/// Big-endian integer of up to 8 bytes.
fn be_value(data: &[u8]) -> u64 {
    data.iter()
        .take(8)
        .fold(0u64, |acc, b| acc << 8 | u64::from(*b))
}

/// Decode the list of supported log pages (page 0x00).
pub fn decode_supported_pages(buf: &[u8]) -> Result<LogPageSupport> {
    if buf.len() < 4 {
        return Err(Error::bad_response("supported-pages response too short"));
    }
    let len = usize::from(buf[3]);
    let mut support = LogPageSupport::default();
    for &code in buf.iter().skip(4).take(len) {
        match code {
            IE_LPAGE => support.ie = true,
            TEMPERATURE_LPAGE => support.temperature = true,
            READ_ERROR_COUNTER_LPAGE => support.read_ecounter = true,
            WRITE_ERROR_COUNTER_LPAGE => support.write_ecounter = true,
            VERIFY_ERROR_COUNTER_LPAGE => support.verify_ecounter = true,
            NON_MEDIUM_ERROR_LPAGE => support.non_medium = true,
            SELFTEST_RESULTS_LPAGE => support.selftest = true,
            _ => {}
        }
    }
    Ok(support)
}

/// Decode the Informational Exceptions log page (0x2f).
pub fn decode_ie_page(buf: &[u8]) -> Result<IeStatus> {
    for (code, data) in log_params(buf)? {
        if code == 0 {
            if data.len() < 3 {
                return Err(Error::bad_response("IE page parameter too short"));
            }
            return Ok(IeStatus {
                asc: data[0],
                ascq: data[1],
                temperature: data[2],
                trip_temperature: 0,
            });
        }
    }
    Err(Error::bad_response("IE page has no parameter 0"))
}

/// Decode the temperature log page (0x0d): (current, trip).
pub fn decode_temperature_page(buf: &[u8]) -> Result<(u8, u8)> {
    let mut current = 0;
    let mut trip = 0;
    for (code, data) in log_params(buf)? {
        if data.len() >= 2 {
            match code {
                0 => current = data[1],
                1 => trip = data[1],
                _ => {}
            }
        }
    }
    Ok((current, trip))
}

/// Decode an error-counter log page (0x02/0x03/0x05).
pub fn decode_error_counter_page(buf: &[u8]) -> Result<ErrorCounters> {
    let mut counters = ErrorCounters::default();
    for (code, data) in log_params(buf)? {
        if let Some(slot) = counters.counters.get_mut(usize::from(code)) {
            *slot = be_value(data);
        }
    }
    Ok(counters)
}

/// Decode the non-medium-error log page (0x06): the parameter-0 counter.
pub fn decode_non_medium_page(buf: &[u8]) -> Result<u64> {
    for (code, data) in log_params(buf)? {
        if code == 0 {
            return Ok(be_value(data));
        }
    }
    Err(Error::bad_response("non-medium page has no parameter 0"))
}

/// Decode the self-test results log page (0x10): failed-test count and
/// the power-on-hour stamp of the most recent failure. Parameters are
/// ordered most recent first; results 0x3..=0x7 are failures.
pub fn decode_selftest_results_page(buf: &[u8]) -> Result<(u8, u16)> {
    let mut count: u8 = 0;
    let mut hour: u16 = 0;
    for (code, data) in log_params(buf)? {
        if !(1..=20).contains(&code) || data.len() < 4 {
            continue;
        }
        let result = data[0] & 0x0f;
        if result == 0 && data[2] == 0 && data[3] == 0 {
            continue; // unused entry
        }
        if (0x3..=0x7).contains(&result) {
            count = count.saturating_add(1);
            if hour == 0 {
                hour = u16::from_be_bytes([data[2], data[3]]);
            }
        }
    }
    Ok((count, hour))
}

/// Warning text for an Informational Exceptions asc/ascq pair, `None`
/// when the pair does not describe a SMART condition.
#[must_use]
pub fn ie_string(asc: u8, ascq: u8) -> Option<String> {
    match asc {
        0x5d => {
            let detail = match ascq {
                0x00 => "FAILURE PREDICTION THRESHOLD EXCEEDED",
                0x01 => "MEDIA FAILURE PREDICTION THRESHOLD EXCEEDED",
                0x02 => "LOGICAL UNIT FAILURE PREDICTION THRESHOLD EXCEEDED",
                0x10..=0x1d => "HARDWARE IMPENDING FAILURE",
                0x20..=0x2c => "CONTROLLER IMPENDING FAILURE",
                0x30..=0x3c => "DATA CHANNEL IMPENDING FAILURE",
                0x40..=0x4c => "SERVO IMPENDING FAILURE",
                0x50..=0x5c => "SPINDLE IMPENDING FAILURE",
                0x60..=0x6c => "FIRMWARE IMPENDING FAILURE",
                0xff => "FAILURE PREDICTION THRESHOLD EXCEEDED (FALSE)",
                _ => return Some(format!("FAILURE PREDICTION (asc=0x5d, ascq=0x{ascq:02x})")),
            };
            Some(detail.to_string())
        }
        0x0b => {
            let detail = match ascq {
                0x00 => "WARNING",
                0x01 => "WARNING - SPECIFIED TEMPERATURE EXCEEDED",
                0x02 => "WARNING - ENCLOSURE DEGRADED",
                _ => return Some(format!("WARNING (asc=0x0b, ascq=0x{ascq:02x})")),
            };
            Some(detail.to_string())
        }
        _ => None,
    }
}

/// Device identity as read from INQUIRY, VPD pages and READ CAPACITY.
#[derive(Debug, Clone, Default)]
pub struct ScsiIdentity {
    pub vendor: String,
    pub product: String,
    pub revision: String,
    pub lu_id: Option<String>,
    pub serial: Option<String>,
    pub capacity: u64,
}

impl ScsiIdentity {
    /// Canonical identity string: `[vendor product rev], lu id, S/N, capacity`.
    #[must_use]
    pub fn idinfo(&self) -> String {
        let mut s = format!("[{} {} {}]", self.vendor, self.product, self.revision);
        if let Some(lu_id) = &self.lu_id {
            s.push_str(&format!(", lu id: {lu_id}"));
        }
        if let Some(serial) = &self.serial {
            s.push_str(&format!(", S/N: {serial}"));
        }
        if self.capacity > 0 {
            s.push_str(&format!(", {}", format_capacity(self.capacity)));
        }
        s
    }

    /// Identity carries a serial or logical-unit id, so it is unique.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.lu_id.is_some() || self.serial.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(code: u8, params: &[(u16, &[u8])]) -> Vec<u8> {
        let mut buf = vec![code, 0, 0, 0];
        for (pcode, data) in params {
            buf.extend_from_slice(&pcode.to_be_bytes());
            buf.push(0);
            buf.push(data.len() as u8);
            buf.extend_from_slice(data);
        }
        let len = (buf.len() - 4) as u16;
        buf[2..4].copy_from_slice(&len.to_be_bytes());
        buf
    }

    #[test]
    fn test_decode_ie_page() {
        let buf = page(IE_LPAGE, &[(0, &[0x5d, 0x10, 38])]);
        let ie = decode_ie_page(&buf).unwrap();
        assert_eq!(ie.asc, 0x5d);
        assert_eq!(ie.ascq, 0x10);
        assert_eq!(ie.temperature, 38);
        assert!(!ie.selftest_in_progress());

        let busy = IeStatus {
            asc: 0x04,
            ascq: 0x09,
            ..Default::default()
        };
        assert!(busy.selftest_in_progress());
    }

    #[test]
    fn test_decode_temperature_page() {
        let buf = page(TEMPERATURE_LPAGE, &[(0, &[0, 41]), (1, &[0, 68])]);
        assert_eq!(decode_temperature_page(&buf).unwrap(), (41, 68));
    }

    #[test]
    fn test_decode_error_counters() {
        let buf = page(
            READ_ERROR_COUNTER_LPAGE,
            &[
                (0, &[0, 0, 0, 5]),
                (3, &[0, 0, 1, 0]),
                (6, &[0, 0, 0, 2]),
                (0x8000, &[1, 2]), // vendor parameter, ignored
            ],
        );
        let counters = decode_error_counter_page(&buf).unwrap();
        assert_eq!(counters.counters[0], 5);
        assert_eq!(counters.counters[3], 256);
        assert_eq!(counters.counters[6], 2);
        assert_eq!(counters.counters[1], 0);
    }

    #[test]
    fn test_decode_selftest_results() {
        // Most recent first: one failed (result 0x7, hour 1234), one clean.
        let failed = [0x07u8, 1, 0x04, 0xd2, 0, 0, 0, 0, 0, 0, 0, 0];
        let clean = [0x00u8, 2, 0x03, 0xe8, 0, 0, 0, 0, 0, 0, 0, 0];
        let buf = page(SELFTEST_RESULTS_LPAGE, &[(1, &failed), (2, &clean)]);
        assert_eq!(decode_selftest_results_page(&buf).unwrap(), (1, 1234));
    }

    #[test]
    fn test_supported_pages() {
        let mut buf = vec![SUPPORTED_LPAGES, 0, 0, 4];
        buf.extend_from_slice(&[IE_LPAGE, TEMPERATURE_LPAGE, READ_ERROR_COUNTER_LPAGE, 0x18]);
        let support = decode_supported_pages(&buf).unwrap();
        assert!(support.ie);
        assert!(support.temperature);
        assert!(support.read_ecounter);
        assert!(!support.write_ecounter);
        assert!(!support.non_medium);
    }

    #[test]
    fn test_ie_string() {
        assert_eq!(
            ie_string(0x5d, 0x00).as_deref(),
            Some("FAILURE PREDICTION THRESHOLD EXCEEDED")
        );
        assert_eq!(ie_string(0x5d, 0x43).as_deref(), Some("SERVO IMPENDING FAILURE"));
        assert_eq!(
            ie_string(0x0b, 0x01).as_deref(),
            Some("WARNING - SPECIFIED TEMPERATURE EXCEEDED")
        );
        assert!(ie_string(0x04, 0x09).is_none());
        assert!(ie_string(0x00, 0x00).is_none());
    }

    #[test]
    fn test_idinfo() {
        let identity = ScsiIdentity {
            vendor: "SEAGATE".into(),
            product: "ST8000NM0075".into(),
            revision: "E001".into(),
            lu_id: Some("0x5000c500a1b2c3d4".into()),
            serial: Some("ZA1234AB".into()),
            capacity: 8_001_563_222_016,
        };
        assert_eq!(
            identity.idinfo(),
            "[SEAGATE ST8000NM0075 E001], lu id: 0x5000c500a1b2c3d4, S/N: ZA1234AB, 8.00 TB"
        );
        assert!(identity.is_unique());
        assert!(!ScsiIdentity::default().is_unique());
    }
}
