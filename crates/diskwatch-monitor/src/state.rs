//! Per-device persistent state and attribute logs
//!
//! The state file is a line-oriented `key = integer` format. Zero
//! values are omitted on write; unknown keys are tolerated on read so
//! newer daemons can add keys without breaking older files. The live
//! file is replaced atomically and the previous generation is kept as a
//! `~`-suffixed sibling.
//!
//! Attribute log files are strict-append: one timestamped row per check
//! cycle, with protocol-specific tab-separated `;`-tuples.

use chrono::{DateTime, Local};
use diskwatch_common::{Error, Result, NUM_WARN_TYPES};
use diskwatch_device::ata::{SmartAttr, SmartThresholds, SmartValues, NUM_ATTRIBUTES};
use diskwatch_device::nvme::NvmeSmartLog;
use diskwatch_device::scsi::{EcKind, ErrorCounters, LogPageSupport};
use diskwatch_device::PowerMode;
use regex::Regex;
use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Warning throttle record for one message type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleRecord {
    /// Number of warnings dispatched.
    pub count: u32,
    /// Epoch seconds of the first dispatch.
    pub first_sent: i64,
    /// Epoch seconds of the most recent dispatch.
    pub last_sent: i64,
}

/// Persistent snapshot of one SMART attribute row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AtaAttrSnapshot {
    pub id: u8,
    pub val: u8,
    pub worst: u8,
    pub raw: u64,
    pub resvd: u8,
}

/// Persistent state data for a device, keyed by its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistState {
    pub tempmin: u8,
    pub tempmax: u8,
    /// Total number of self-test errors.
    pub selftest_errors: u8,
    /// Lifetime hour stamp of the latest self-test error.
    pub selftest_last_err_hour: u64,
    /// Epoch seconds of the next scheduled-test check.
    pub scheduled_test_next_check: i64,
    pub selective_test_last_start: u64,
    pub selective_test_last_end: u64,
    pub mail: [ThrottleRecord; NUM_WARN_TYPES],
    // ATA only
    pub ata_error_count: u64,
    pub ata_attributes: [AtaAttrSnapshot; NUM_ATTRIBUTES],
    // NVMe only
    pub nvme_err_log_entries: u64,
    pub nvme_available_spare: u8,
    pub nvme_percentage_used: u8,
    pub nvme_media_errors: u64,
}

impl Default for PersistState {
    fn default() -> Self {
        PersistState {
            tempmin: 0,
            tempmax: 0,
            selftest_errors: 0,
            selftest_last_err_hour: 0,
            scheduled_test_next_check: 0,
            selective_test_last_start: 0,
            selective_test_last_end: 0,
            mail: [ThrottleRecord::default(); NUM_WARN_TYPES],
            ata_error_count: 0,
            ata_attributes: [AtaAttrSnapshot::default(); NUM_ATTRIBUTES],
            nvme_err_log_entries: 0,
            nvme_available_spare: 0,
            nvme_percentage_used: 0,
            nvme_media_errors: 0,
        }
    }
}

impl PersistState {
    /// Copy the current ATA attribute table into the persistent snapshot.
    pub fn sync_attributes(&mut self, values: &SmartValues) {
        for (snapshot, attr) in self.ata_attributes.iter_mut().zip(values.attrs.iter()) {
            snapshot.id = attr.id;
            if attr.id == 0 {
                *snapshot = AtaAttrSnapshot::default();
                continue;
            }
            snapshot.val = attr.current;
            snapshot.worst = attr.worst;
            snapshot.raw = attr.raw48();
            snapshot.resvd = attr.reserved;
        }
    }

    /// Rebuild an attribute table from the persistent snapshot, for
    /// diffing against the first fresh reading after a restart.
    #[must_use]
    pub fn attributes_as_values(&self) -> SmartValues {
        let mut values = SmartValues::default();
        for (attr, snapshot) in values.attrs.iter_mut().zip(self.ata_attributes.iter()) {
            if snapshot.id == 0 {
                continue;
            }
            *attr = SmartAttr {
                id: snapshot.id,
                flags: 0,
                current: snapshot.val,
                worst: snapshot.worst,
                raw: [
                    snapshot.raw as u8,
                    (snapshot.raw >> 8) as u8,
                    (snapshot.raw >> 16) as u8,
                    (snapshot.raw >> 24) as u8,
                    (snapshot.raw >> 32) as u8,
                    (snapshot.raw >> 40) as u8,
                ],
                reserved: snapshot.resvd,
            };
        }
        values
    }
}

fn push_line(out: &mut String, key: &str, value: u64) {
    if value != 0 {
        let _ = writeln!(out, "{key} = {value}");
    }
}

/// Serialize a state to its file format. Zero values are omitted.
#[must_use]
pub fn serialize_state(state: &PersistState) -> String {
    let mut out = String::from("# diskwatchd state file\n");
    push_line(&mut out, "temperature-min", u64::from(state.tempmin));
    push_line(&mut out, "temperature-max", u64::from(state.tempmax));
    push_line(&mut out, "self-test-errors", u64::from(state.selftest_errors));
    push_line(
        &mut out,
        "self-test-last-err-hour",
        state.selftest_last_err_hour,
    );
    push_line(
        &mut out,
        "scheduled-test-next-check",
        state.scheduled_test_next_check.max(0) as u64,
    );
    push_line(
        &mut out,
        "selective-test-last-start",
        state.selective_test_last_start,
    );
    push_line(
        &mut out,
        "selective-test-last-end",
        state.selective_test_last_end,
    );

    for (i, record) in state.mail.iter().enumerate() {
        if i == 0 || record.count == 0 {
            // Test mails are never suppressed, so never recorded
            continue;
        }
        push_line(&mut out, &format!("mail.{i}.count"), u64::from(record.count));
        push_line(
            &mut out,
            &format!("mail.{i}.first-sent-time"),
            record.first_sent.max(0) as u64,
        );
        push_line(
            &mut out,
            &format!("mail.{i}.last-sent-time"),
            record.last_sent.max(0) as u64,
        );
    }

    // ATA only
    push_line(&mut out, "ata-error-count", state.ata_error_count);
    for (i, attr) in state.ata_attributes.iter().enumerate() {
        if attr.id == 0 {
            continue;
        }
        push_line(&mut out, &format!("ata-smart-attribute.{i}.id"), u64::from(attr.id));
        push_line(&mut out, &format!("ata-smart-attribute.{i}.val"), u64::from(attr.val));
        push_line(
            &mut out,
            &format!("ata-smart-attribute.{i}.worst"),
            u64::from(attr.worst),
        );
        push_line(&mut out, &format!("ata-smart-attribute.{i}.raw"), attr.raw);
        push_line(
            &mut out,
            &format!("ata-smart-attribute.{i}.resvd"),
            u64::from(attr.resvd),
        );
    }

    // NVMe only
    push_line(&mut out, "nvme-err-log-entries", state.nvme_err_log_entries);
    push_line(
        &mut out,
        "nvme-available-spare",
        u64::from(state.nvme_available_spare),
    );
    push_line(
        &mut out,
        "nvme-percentage-used",
        u64::from(state.nvme_percentage_used),
    );
    push_line(&mut out, "nvme-media-errors", state.nvme_media_errors);
    out
}

fn state_line_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(
            r"(?x)^\s*
              (?:
                (?P<scalar>temperature-min|temperature-max|self-test-errors
                  |self-test-last-err-hour|scheduled-test-next-check
                  |selective-test-last-start|selective-test-last-end
                  |ata-error-count|nvme-err-log-entries|nvme-available-spare
                  |nvme-percentage-used|nvme-media-errors)
                |mail\.(?P<mailidx>[0-9]+)\.(?P<mailfield>count|first-sent-time|last-sent-time)
                |ata-smart-attribute\.(?P<attridx>[0-9]+)\.(?P<attrfield>id|val|worst|raw|resvd)
              )
              \s*=\s*(?P<value>[0-9]+)\s*$",
        )
        .expect("state line grammar")
    })
}

/// Parse one state-file line into `state`. Returns false when the line
/// does not match the key grammar.
fn parse_state_line(line: &str, state: &mut PersistState) -> bool {
    let Some(captures) = state_line_regex().captures(line) else {
        return false;
    };
    let Ok(value) = captures["value"].parse::<u64>() else {
        return false;
    };

    if let Some(key) = captures.name("scalar") {
        match key.as_str() {
            "temperature-min" => state.tempmin = value as u8,
            "temperature-max" => state.tempmax = value as u8,
            "self-test-errors" => state.selftest_errors = value as u8,
            "self-test-last-err-hour" => state.selftest_last_err_hour = value,
            "scheduled-test-next-check" => state.scheduled_test_next_check = value as i64,
            "selective-test-last-start" => state.selective_test_last_start = value,
            "selective-test-last-end" => state.selective_test_last_end = value,
            "ata-error-count" => state.ata_error_count = value,
            "nvme-err-log-entries" => state.nvme_err_log_entries = value,
            "nvme-available-spare" => state.nvme_available_spare = value as u8,
            "nvme-percentage-used" => state.nvme_percentage_used = value as u8,
            "nvme-media-errors" => state.nvme_media_errors = value,
            _ => return false,
        }
        return true;
    }

    if let (Some(idx), Some(field)) = (captures.name("mailidx"), captures.name("mailfield")) {
        let Ok(i) = idx.as_str().parse::<usize>() else {
            return false;
        };
        if i >= NUM_WARN_TYPES {
            return false;
        }
        if i == 0 {
            // Don't suppress test mails
            return true;
        }
        match field.as_str() {
            "count" => state.mail[i].count = value as u32,
            "first-sent-time" => state.mail[i].first_sent = value as i64,
            "last-sent-time" => state.mail[i].last_sent = value as i64,
            _ => return false,
        }
        return true;
    }

    if let (Some(idx), Some(field)) = (captures.name("attridx"), captures.name("attrfield")) {
        let Ok(i) = idx.as_str().parse::<usize>() else {
            return false;
        };
        if i >= NUM_ATTRIBUTES {
            return false;
        }
        let attr = &mut state.ata_attributes[i];
        match field.as_str() {
            "id" => attr.id = value as u8,
            "val" => attr.val = value as u8,
            "worst" => attr.worst = value as u8,
            "raw" => attr.raw = value,
            "resvd" => attr.resvd = value as u8,
            _ => return false,
        }
        return true;
    }

    false
}

/// Parse state-file text. Invalid lines are tolerated as long as at
/// least one line parses; a wholly-unparseable file is rejected.
pub fn parse_state(text: &str, origin: &str) -> Result<PersistState> {
    let mut state = PersistState::default();
    let mut good = 0u32;
    let mut bad = 0u32;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if parse_state_line(line, &mut state) {
            good += 1;
        } else {
            bad += 1;
        }
    }
    if bad > 0 {
        if good == 0 {
            return Err(Error::state(format!("{origin}: format error")));
        }
        warn!("{origin}: {bad} invalid line(s) ignored");
    }
    Ok(state)
}

/// Read a state file. `Ok(None)` when the file does not exist.
pub fn read_state(path: &Path) -> Result<Option<PersistState>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    };
    parse_state(&text, &path.to_string_lossy()).map(Some)
}

/// Write a state file: the new content lands in a temporary sibling,
/// the previous live file becomes the `~` backup, then the temporary is
/// renamed into place. A crash mid-write never leaves a partial live
/// file. Owner-readable only.
pub fn write_state(path: &Path, state: &PersistState) -> Result<()> {
    let tmp_path = path.with_extension("state.tmp");
    {
        let mut file = fs::File::create(&tmp_path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(serialize_state(state).as_bytes())?;
        file.flush()?;
        file.sync_all()?;
    }

    let mut backup = path.as_os_str().to_owned();
    backup.push("~");
    let backup = PathBuf::from(backup);
    let _ = fs::remove_file(&backup);
    let _ = fs::rename(path, &backup);

    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Protocol-specific attribute log data for one cycle.
#[derive(Debug, Clone)]
pub enum AttrlogData {
    /// (id, normalized, raw) per present attribute.
    Ata(Vec<(u8, u8, u64)>),
    Scsi {
        /// Labeled error-counter groups, in read/write/verify order.
        counters: Vec<(EcKind, ErrorCounters)>,
        non_medium_errors: Option<u64>,
        temperature: Option<u8>,
    },
    Nvme(NvmeSmartLog),
}

/// Format one attribute-log row: local timestamp, then tab-separated
/// `;`-terminated tuples.
#[must_use]
pub fn format_attrlog_row(now: DateTime<Local>, data: &AttrlogData) -> String {
    let mut row = now.format("%Y-%m-%d %H:%M:%S;").to_string();
    match data {
        AttrlogData::Ata(attrs) => {
            for (id, val, raw) in attrs {
                let _ = write!(row, "\t{id};{val};{raw};");
            }
        }
        AttrlogData::Scsi {
            counters,
            non_medium_errors,
            temperature,
        } => {
            for (kind, ec) in counters {
                let label = kind.label();
                let c = &ec.counters;
                let _ = write!(
                    row,
                    "\t{label}-corr-by-ecc-fast;{};\t{label}-corr-by-ecc-delayed;{};\
                     \t{label}-corr-by-retry;{};\t{label}-total-err-corrected;{};\
                     \t{label}-corr-algorithm-invocations;{};\t{label}-gb-processed;{:.3};\
                     \t{label}-total-unc-errors;{};",
                    c[0],
                    c[1],
                    c[2],
                    c[3],
                    c[4],
                    c[5] as f64 / 1_000_000_000.0,
                    c[6]
                );
            }
            if let Some(count) = non_medium_errors {
                let _ = write!(row, "\tnon-medium-errors;{count};");
            }
            if let Some(temp) = temperature {
                let _ = write!(row, "\ttemperature;{temp};");
            }
        }
        AttrlogData::Nvme(log) => {
            let temp = log.temperature_celsius().map_or(0, i64::from);
            let _ = write!(
                row,
                "\tcritical-warning;{};\ttemperature;{};\tavailable-spare;{};\
                 \tavailable-spare-threshold;{};\tpercentage-used;{};\
                 \tdata-units-read;{};\tdata-units-written;{};\thost-reads;{};\
                 \thost-writes;{};\tcontroller-busy-time;{};\tpower-cycles;{};\
                 \tpower-on-hours;{};\tunsafe-shutdowns;{};\tmedia-errors;{};\
                 \tnum-err-log-entries;{};",
                log.critical_warning,
                temp,
                log.available_spare,
                log.spare_threshold,
                log.percentage_used,
                log.data_units_read.to_u64(),
                log.data_units_written.to_u64(),
                log.host_reads.to_u64(),
                log.host_writes.to_u64(),
                log.controller_busy_time.to_u64(),
                log.power_cycles.to_u64(),
                log.power_on_hours.to_u64(),
                log.unsafe_shutdowns.to_u64(),
                log.media_errors.to_u64(),
                log.num_err_log_entries.to_u64()
            );
        }
    }
    row.push('\n');
    row
}

/// Append one row to an attribute log file. World-readable: operators
/// grep these.
pub fn append_attrlog(path: &Path, now: DateTime<Local>, data: &AttrlogData) -> Result<()> {
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = file.metadata()?.permissions();
        if perms.mode() & 0o777 != 0o644 {
            file.set_permissions(fs::Permissions::from_mode(0o644))?;
        }
    }
    file.write_all(format_attrlog_row(now, data).as_bytes())?;
    Ok(())
}

/// Replace characters not allowed in state file names.
#[must_use]
pub fn sanitize_filename_part(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Non-persistent per-device state, rebuilt at each (re)registration.
#[derive(Debug, Default)]
pub struct TempState {
    /// Persistent part should be flushed.
    pub must_write: bool,
    /// Skip during the next check cycle.
    pub skip: bool,
    /// Next wakeup time, 0 if unknown or global.
    pub wakeuptime: i64,

    // Self-test capability cache
    pub not_cap_offline: bool,
    pub not_cap_conveyance: bool,
    pub not_cap_short: bool,
    pub not_cap_long: bool,
    pub not_cap_selective: bool,

    /// Last recorded temperature, Celsius.
    pub temperature: u8,
    /// Epoch until which the minimum temperature is not updated.
    pub tempmin_delay: i64,

    /// Open failed for a removable device.
    pub removed: bool,

    pub powermodefail: bool,
    pub powerskipcnt: u32,
    pub lastpowermodeskipped: Option<PowerMode>,

    /// Attribute log data produced by this cycle, tagged by protocol.
    pub attrlog: Option<AttrlogData>,

    // SCSI only
    pub log_pages: LogPageSupport,
    pub suppress_report: bool,

    // ATA only
    pub num_sectors: u64,
    /// Previous cycle's attribute table.
    pub smartval: Option<SmartValues>,
    pub smartthres: SmartThresholds,
    pub offline_started: bool,

    // ATA and NVMe
    pub selftest_started: bool,

    // NVMe only
    pub selftest_op: u8,
    pub selftest_compl: u8,
}

/// Full per-device state: the persisted part plus the transient part.
#[derive(Debug, Default)]
pub struct DevState {
    pub persist: PersistState,
    pub temp: TempState,
}

impl DevState {
    /// Load persisted state from the file, if present. A parse failure
    /// is logged and the state reset; it never aborts registration.
    pub fn load(&mut self, path: &Path, name: &str) {
        match read_state(path) {
            Ok(Some(persist)) => {
                self.persist = persist;
                self.temp.smartval = Some(self.persist.attributes_as_values());
                info!("Device: {name}, state read from {}", path.display());
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Device: {name}, cannot read state file: {e}");
                self.persist = PersistState::default();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use diskwatch_device::nvme::Le128;
    use tempfile::tempdir;

    fn sample_state() -> PersistState {
        let mut state = PersistState {
            tempmin: 24,
            tempmax: 47,
            selftest_errors: 2,
            selftest_last_err_hour: 1234,
            scheduled_test_next_check: 1_700_000_000,
            selective_test_last_start: 1000,
            selective_test_last_end: 2000,
            ata_error_count: 3,
            nvme_err_log_entries: 17,
            nvme_available_spare: 100,
            nvme_percentage_used: 4,
            nvme_media_errors: 1,
            ..Default::default()
        };
        state.mail[2] = ThrottleRecord {
            count: 3,
            first_sent: 1_600_000_000,
            last_sent: 1_600_200_000,
        };
        state.ata_attributes[0] = AtaAttrSnapshot {
            id: 5,
            val: 100,
            worst: 98,
            raw: 12,
            resvd: 1,
        };
        state.ata_attributes[7] = AtaAttrSnapshot {
            id: 194,
            val: 64,
            worst: 50,
            raw: 36,
            resvd: 0,
        };
        state
    }

    #[test]
    fn test_state_round_trip() {
        let state = sample_state();
        let text = serialize_state(&state);
        let parsed = parse_state(&text, "test").unwrap();
        assert_eq!(parsed, state);
    }

    #[test]
    fn test_zero_fields_not_serialized() {
        let text = serialize_state(&PersistState::default());
        assert_eq!(text, "# diskwatchd state file\n");
    }

    #[test]
    fn test_unknown_keys_tolerated() {
        let text = "temperature-min = 20\nshiny-new-key = 7\nnonsense line\n";
        let state = parse_state(text, "test").unwrap();
        assert_eq!(state.tempmin, 20);
    }

    #[test]
    fn test_unparseable_file_rejected() {
        assert!(parse_state("not a state file\nat all\n", "test").is_err());
    }

    #[test]
    fn test_mail_type_zero_ignored() {
        let text = "mail.0.count = 5\nmail.1.count = 2\n";
        let state = parse_state(text, "test").unwrap();
        assert_eq!(state.mail[0].count, 0);
        assert_eq!(state.mail[1].count, 2);
    }

    #[test]
    fn test_out_of_range_indices_are_invalid() {
        let text = "temperature-max = 40\nmail.99.count = 1\nata-smart-attribute.30.id = 5\n";
        let state = parse_state(text, "test").unwrap();
        assert_eq!(state.tempmax, 40);
        assert!(state.mail.iter().all(|m| m.count == 0));
    }

    #[test]
    fn test_write_read_and_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.ata.state");

        let mut state = sample_state();
        write_state(&path, &state).unwrap();
        assert_eq!(read_state(&path).unwrap().unwrap(), state);

        state.tempmax = 50;
        write_state(&path, &state).unwrap();
        assert_eq!(read_state(&path).unwrap().unwrap().tempmax, 50);

        // Previous generation is retained as a sibling
        let backup = dir.path().join("dev.ata.state~");
        assert_eq!(read_state(&backup).unwrap().unwrap().tempmax, 47);
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempdir().unwrap();
        assert!(read_state(&dir.path().join("absent.state"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_attribute_snapshot_sync() {
        let mut values = SmartValues::default();
        values.attrs[0] = SmartAttr {
            id: 5,
            flags: 0x33,
            current: 99,
            worst: 98,
            raw: [12, 0, 0, 0, 0, 0],
            reserved: 1,
        };
        let mut state = PersistState::default();
        state.sync_attributes(&values);
        assert_eq!(state.ata_attributes[0].id, 5);
        assert_eq!(state.ata_attributes[0].raw, 12);

        let rebuilt = state.attributes_as_values();
        assert_eq!(rebuilt.attrs[0].id, 5);
        assert_eq!(rebuilt.attrs[0].current, 99);
        assert_eq!(rebuilt.attrs[0].raw48(), 12);
    }

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 8, 2, 14, 30, 5).unwrap()
    }

    #[test]
    fn test_ata_attrlog_row() {
        let row = format_attrlog_row(
            fixed_time(),
            &AttrlogData::Ata(vec![(5, 100, 0), (194, 64, 36)]),
        );
        assert_eq!(row, "2025-08-02 14:30:05;\t5;100;0;\t194;64;36;\n");
    }

    #[test]
    fn test_scsi_attrlog_row() {
        let mut ec = ErrorCounters::default();
        ec.counters[3] = 7;
        ec.counters[5] = 2_500_000_000;
        let row = format_attrlog_row(
            fixed_time(),
            &AttrlogData::Scsi {
                counters: vec![(EcKind::Read, ec)],
                non_medium_errors: Some(4),
                temperature: Some(33),
            },
        );
        assert!(row.starts_with("2025-08-02 14:30:05;"));
        assert!(row.contains("\tread-total-err-corrected;7;"));
        assert!(row.contains("\tread-gb-processed;2.500;"));
        assert!(row.contains("\tnon-medium-errors;4;"));
        assert!(row.ends_with("\ttemperature;33;\n"));
    }

    #[test]
    fn test_nvme_attrlog_row() {
        let log = NvmeSmartLog {
            critical_warning: 0,
            temperature_kelvin: 310,
            available_spare: 100,
            spare_threshold: 10,
            percentage_used: 3,
            media_errors: Le128::from(2),
            ..Default::default()
        };
        let row = format_attrlog_row(fixed_time(), &AttrlogData::Nvme(log));
        assert!(row.contains("\ttemperature;37;"));
        assert!(row.contains("\tavailable-spare;100;"));
        assert!(row.contains("\tmedia-errors;2;"));
        assert!(row.ends_with("\tnum-err-log-entries;0;\n"));
    }

    #[test]
    fn test_attrlog_append_only() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.ata.csv");
        append_attrlog(&path, fixed_time(), &AttrlogData::Ata(vec![(5, 100, 0)])).unwrap();
        append_attrlog(&path, fixed_time(), &AttrlogData::Ata(vec![(5, 99, 1)])).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_sanitize_filename_part() {
        assert_eq!(
            sanitize_filename_part("WDC WD40EFRX-68N32N0"),
            "WDC_WD40EFRX_68N32N0"
        );
    }
}
