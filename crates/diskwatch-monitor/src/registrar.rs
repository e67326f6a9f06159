//! Device registrar
//!
//! Turns configuration entries into monitored devices: builds a
//! transport instance, probes identity, rejects duplicates, evaluates
//! protocol capabilities (downgrading directives the device cannot
//! honor), applies one-shot ATA settings, computes state file paths and
//! loads prior state.

use crate::config::{ConfigParse, DevConfig};
use crate::state::{sanitize_filename_part, DevState};
use chrono::Utc;
use diskwatch_common::{Error, Protocol, Result};
use diskwatch_device::ata::temperature_value;
use diskwatch_device::nvme::BROADCAST_NSID;
use diskwatch_device::{AnyDevice, AtaSetting, DeviceFactory};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

/// Startup-progress hook: lets a service-manager integration extend its
/// start timeout while many devices are probed, and receive status
/// lines. The default implementation does nothing.
pub trait Notifier {
    /// Called before each device probe.
    fn extend_timeout(&self) {}
    /// Free-form status message.
    fn status(&self, _msg: &str) {}
    /// Initial device registration finished; the daemon is live.
    fn ready(&self, _msg: &str) {}
}

/// No-op notifier.
pub struct NullNotifier;

impl Notifier for NullNotifier {}

/// A fully registered device: immutable configuration, mutable state,
/// and its transport handle.
pub struct MonitoredDevice {
    pub cfg: DevConfig,
    pub state: DevState,
    pub dev: AnyDevice,
}

/// Registrar inputs shared across all entries.
pub struct RegistrarOptions {
    /// Path prefix for persistent state files, `None` disables them.
    pub state_prefix: Option<String>,
    /// Path prefix for attribute log files, `None` disables them.
    pub attrlog_prefix: Option<String>,
    /// Quit policy `never`: registration failures are never fatal.
    pub quit_never: bool,
}

enum Probe {
    Registered,
    /// Same identity as an enrolled device; never fatal.
    Duplicate,
    /// Device not suitable or nothing to monitor.
    Skipped,
}

/// Replace characters that could act as command escapes in warning
/// mails. Returns true if anything was replaced.
fn sanitize_idinfo(s: &mut String) -> bool {
    let mut changed = false;
    *s = s
        .chars()
        .enumerate()
        .map(|(i, c)| {
            if (' '..='~').contains(&c) && !(i == 0 && c == '~') {
                c
            } else {
                changed = true;
                '?'
            }
        })
        .collect();
    changed
}

/// True if the entry's identity is already enrolled.
fn is_duplicate(cfg: &DevConfig, enrolled: &[MonitoredDevice]) -> bool {
    if !cfg.id_is_unique {
        return false;
    }
    for prev in enrolled {
        if !prev.cfg.id_is_unique {
            continue;
        }
        let same = cfg.dev_idinfo == prev.cfg.dev_idinfo
            || (!cfg.dev_idinfo_bc.is_empty() && cfg.dev_idinfo_bc == prev.cfg.dev_idinfo)
            || (!prev.cfg.dev_idinfo_bc.is_empty() && cfg.dev_idinfo == prev.cfg.dev_idinfo_bc);
        if same {
            info!(
                "Device: {}, same identity as {}, ignored",
                cfg.dev_name, prev.cfg.dev_name
            );
            return true;
        }
    }
    false
}

/// Post-probe bookkeeping shared by all protocols.
fn finish_device(cfg: &mut DevConfig, state: &mut DevState, now: i64) {
    // Pick a warning frequency if the user set none: with no state file
    // warnings would be suppressed forever under `daily` persistence,
    // so fall back to `once`.
    if cfg.warns() && cfg.emailfreq == crate::config::EmailFreq::Unknown {
        cfg.emailfreq = if cfg.state_file.is_none() {
            crate::config::EmailFreq::Once
        } else {
            crate::config::EmailFreq::Daily
        };
    }

    // Start the schedule walk now unless the state file had a watermark
    if cfg.test_regex.is_some() && state.persist.scheduled_test_next_check == 0 {
        state.persist.scheduled_test_next_check = now;
    }
}

fn state_paths(
    opts: &RegistrarOptions,
    protocol: Protocol,
    parts: &[&str],
    cfg: &mut DevConfig,
    state: &mut DevState,
) {
    let stem = parts
        .iter()
        .map(|p| sanitize_filename_part(p))
        .collect::<Vec<_>>()
        .join("-");
    let suffix = protocol.file_suffix();
    if let Some(prefix) = &opts.state_prefix {
        let path = PathBuf::from(format!("{prefix}{stem}.{suffix}.state"));
        state.load(&path, &cfg.name);
        cfg.state_file = Some(path);
    }
    if let Some(prefix) = &opts.attrlog_prefix {
        cfg.attrlog_file = Some(PathBuf::from(format!("{prefix}{stem}.{suffix}.csv")));
    }
}

fn probe_ata(
    cfg: &mut DevConfig,
    state: &mut DevState,
    dev: &mut dyn diskwatch_device::AtaDevice,
    enrolled: &[MonitoredDevice],
    opts: &RegistrarOptions,
) -> Result<Probe> {
    let name = cfg.name.clone();

    let identity = match dev.identify() {
        Ok(identity) => identity,
        Err(e) => {
            info!("Device: {name}, not ATA, no IDENTIFY DEVICE Structure: {e}");
            return Ok(Probe::Skipped);
        }
    };
    state.temp.num_sectors = identity.sectors;
    cfg.dev_rpm = identity.rotation_rate;
    cfg.dev_idinfo = identity.idinfo();
    cfg.id_is_unique = !sanitize_idinfo(&mut cfg.dev_idinfo);
    info!("Device: {name}, {}", cfg.dev_idinfo);

    if is_duplicate(cfg, enrolled) {
        return Ok(Probe::Duplicate);
    }

    if identity.security_locked {
        info!("Device: {name}, ATA Security is **LOCKED**");
    }

    // Default pending-sector attributes unless the user chose ids
    if !cfg.curr_pending_set {
        cfg.curr_pending_id = 197;
    }
    if !cfg.offl_pending_set {
        cfg.offl_pending_id = 198;
    }

    if !identity.smart_supported {
        info!("Device: {name}, lacks SMART capability");
        if !cfg.permissive {
            info!("Device: {name}, to proceed anyway, use '-T permissive' Directive.");
            return Ok(Probe::Skipped);
        }
        info!("Device: {name}, proceeding since '-T permissive' Directive given.");
    }

    if dev.enable_smart().is_err() {
        info!("Device: {name}, could not enable SMART capability");
        if !identity.smart_enabled && !cfg.permissive {
            info!("Device: {name}, to proceed anyway, use '-T permissive' Directive.");
            return Ok(Probe::Skipped);
        }
    }

    if let Some(enable) = cfg.autosave {
        let what = if enable { "enable" } else { "disable" };
        match dev.set_attribute_autosave(enable) {
            Ok(()) => info!("Device: {name}, {what}d SMART Attribute Autosave."),
            Err(_) => info!("Device: {name}, could not {what} SMART Attribute Autosave."),
        }
    }

    // Capability check: SMART status
    if cfg.smartcheck && dev.smart_status().is_err() {
        info!("Device: {name}, not capable of SMART Health Status check");
        cfg.smartcheck = false;
    }

    // SMART values are needed for most checks and for capability bits
    let needs_values = cfg.usagefailed
        || cfg.prefail
        || cfg.usage
        || cfg.selftest
        || cfg.errorlog
        || cfg.xerrorlog
        || cfg.offlinests
        || cfg.selfteststs
        || cfg.auto_offline.is_some()
        || cfg.tempdiff != 0
        || cfg.tempinfo != 0
        || cfg.tempcrit != 0
        || cfg.curr_pending_id != 0
        || cfg.offl_pending_id != 0;
    if needs_values {
        match dev.read_smart_values() {
            Ok(values) => {
                match dev.read_smart_thresholds() {
                    Ok(thresholds) => state.temp.smartthres = thresholds,
                    Err(_) => {
                        info!(
                            "Device: {name}, Read SMART Thresholds failed{}",
                            if cfg.usagefailed {
                                ", ignoring -f Directive"
                            } else {
                                ""
                            }
                        );
                        cfg.usagefailed = false;
                        state.temp.smartthres = Default::default();
                    }
                }

                // Are the pending-sector attributes actually there?
                for (id, set_msg) in [
                    (&mut cfg.curr_pending_id, "Current_Pending_Sector"),
                    (&mut cfg.offl_pending_id, "Offline_Uncorrectable"),
                ] {
                    if *id == 0 {
                        continue;
                    }
                    match values.find_attr(*id) {
                        None => {
                            info!(
                                "Device: {name}, can't monitor {set_msg} count - no Attribute {id}"
                            );
                            *id = 0;
                        }
                        Some(idx) => {
                            let raw = values.attrs[idx].raw48();
                            let limit = if state.temp.num_sectors != 0 {
                                state.temp.num_sectors
                            } else {
                                0xffff_ffff
                            };
                            if raw >= limit {
                                info!(
                                    "Device: {name}, ignoring {set_msg} count - bogus Attribute {id} value {raw} (0x{raw:x})"
                                );
                                *id = 0;
                            }
                        }
                    }
                }

                if (cfg.tempdiff != 0 || cfg.tempinfo != 0 || cfg.tempcrit != 0)
                    && temperature_value(&values).is_none()
                {
                    info!(
                        "Device: {name}, can't monitor Temperature, ignoring -W {},{},{}",
                        cfg.tempdiff, cfg.tempinfo, cfg.tempcrit
                    );
                    cfg.tempdiff = 0;
                    cfg.tempinfo = 0;
                    cfg.tempcrit = 0;
                }

                // Capability check: self-test log
                if cfg.selftest {
                    if !(cfg.permissive || values.supports_error_log()) {
                        info!("Device: {name}, no SMART Self-test Log, ignoring -l selftest (override with -T permissive)");
                        cfg.selftest = false;
                    } else {
                        match dev.read_selftest_log() {
                            Ok(log) => {
                                let (errcnt, hour) = log.count_errors();
                                state.persist.selftest_errors = errcnt;
                                state.persist.selftest_last_err_hour = hour;
                            }
                            Err(_) => {
                                info!("Device: {name}, no SMART Self-test Log, ignoring -l selftest");
                                cfg.selftest = false;
                            }
                        }
                    }
                }

                // Capability check: error logs
                if cfg.errorlog {
                    if !(cfg.permissive || values.supports_error_log()) {
                        info!("Device: {name}, no SMART Error Log, ignoring -l error (override with -T permissive)");
                        cfg.errorlog = false;
                    } else {
                        match dev.read_error_count(false) {
                            Ok(count) => state.persist.ata_error_count = count,
                            Err(_) => {
                                info!("Device: {name}, no SMART Error Log, ignoring -l error");
                                cfg.errorlog = false;
                            }
                        }
                    }
                }
                if cfg.xerrorlog {
                    match dev.read_error_count(true) {
                        Ok(count) => {
                            if count > state.persist.ata_error_count {
                                state.persist.ata_error_count = count;
                            }
                        }
                        Err(_) => {
                            info!("Device: {name}, no Extended Comprehensive SMART Error Log, ignoring -l xerror");
                            cfg.xerrorlog = false;
                        }
                    }
                }

                // Capability check: status monitoring
                if (cfg.offlinests || cfg.selfteststs)
                    && !(cfg.permissive || values.offline_collection_capability != 0)
                {
                    if cfg.offlinests {
                        info!("Device: {name}, no SMART Offline Data Collection capability, ignoring -l offlinests (override with -T permissive)");
                    }
                    if cfg.selfteststs {
                        info!("Device: {name}, no SMART Self-test capability, ignoring -l selfteststs (override with -T permissive)");
                    }
                    cfg.offlinests = false;
                    cfg.selfteststs = false;
                }

                // Enable or disable the automatic offline test timer
                if let Some(enable) = cfg.auto_offline {
                    let what = if enable { "enable" } else { "disable" };
                    match dev.set_auto_offline(enable) {
                        Ok(()) => {
                            info!("Device: {name}, {what}d SMART Automatic Offline Testing.")
                        }
                        Err(_) => {
                            info!("Device: {name}, {what} SMART Automatic Offline Testing failed.")
                        }
                    }
                }

                state.temp.smartval = Some(values);
            }
            Err(_) => {
                info!("Device: {name}, Read SMART Values failed");
                cfg.usagefailed = false;
                cfg.prefail = false;
                cfg.usage = false;
                cfg.tempdiff = 0;
                cfg.tempinfo = 0;
                cfg.tempcrit = 0;
                cfg.curr_pending_id = 0;
                cfg.offl_pending_id = 0;
            }
        }
    }
    // Capability check: power mode
    if cfg.powermode != 0 {
        match dev.check_power_mode() {
            Ok(mode) if mode.rank().is_some() => {}
            Ok(mode) => {
                error!(
                    "Device: {name}, CHECK POWER STATUS returned {:?}, not ATA compliant, ignoring -n Directive",
                    mode
                );
                cfg.powermode = 0;
            }
            Err(_) => {
                error!("Device: {name}, no ATA CHECK POWER STATUS support, ignoring -n Directive");
                cfg.powermode = 0;
            }
        }
    }

    apply_ata_settings(cfg, dev, &name);

    if let Some((read_time, write_time)) = cfg.sct_erc {
        if !identity.sct_erc_capable {
            info!("Device: {name}, no SCT Error Recovery Control support, ignoring -l scterc");
        } else if identity.security_locked {
            info!("Device: {name}, no SCT support if ATA Security is LOCKED, ignoring -l scterc");
        } else if dev.set_sct_erc(read_time, write_time).is_err() {
            info!("Device: {name}, set of SCT Error Recovery Control failed");
        } else {
            info!(
                "Device: {name}, SCT Error Recovery Control set to: Read: {read_time}, Write: {write_time}"
            );
        }
    }

    // Anything left to monitor?
    if !(cfg.smartcheck
        || cfg.selftest
        || cfg.errorlog
        || cfg.xerrorlog
        || cfg.offlinests
        || cfg.selfteststs
        || cfg.usagefailed
        || cfg.prefail
        || cfg.usage
        || cfg.tempdiff != 0
        || cfg.tempinfo != 0
        || cfg.tempcrit != 0)
    {
        return Ok(Probe::Skipped);
    }

    info!("Device: {name}, is SMART capable. Adding to \"monitor\" list.");

    state_paths(
        opts,
        Protocol::Ata,
        &[&identity.model, &identity.serial],
        cfg,
        state,
    );
    Ok(Probe::Registered)
}

/// Apply `-e` settings, reporting the results as one log entry.
fn apply_ata_settings(cfg: &DevConfig, dev: &mut dyn diskwatch_device::AtaDevice, name: &str) {
    let mut msg = String::new();
    let mut record = |label: &str, ok: bool, text: String| {
        if !msg.is_empty() {
            msg.push_str(", ");
        }
        msg.push_str(label);
        if ok {
            msg.push_str(&text);
        } else {
            msg.push_str(":--");
        }
    };

    if let Some(level) = cfg.set_aam {
        let ok = dev.apply_setting(AtaSetting::Aam(level)).is_ok();
        let text = level.map_or(":off".into(), |v| format!(":{v}"));
        record("AAM", ok, text);
    }
    if let Some(level) = cfg.set_apm {
        let ok = dev.apply_setting(AtaSetting::Apm(level)).is_ok();
        let text = level.map_or(":off".into(), |v| format!(":{v}"));
        record("APM", ok, text);
    }
    if let Some(enable) = cfg.set_lookahead {
        let ok = dev.apply_setting(AtaSetting::LookAhead(enable)).is_ok();
        record("Rd-ahead", ok, if enable { ":on".into() } else { ":off".into() });
    }
    if let Some(enable) = cfg.set_wcache {
        let ok = dev.apply_setting(AtaSetting::WriteCache(enable)).is_ok();
        record("Wr-cache", ok, if enable { ":on".into() } else { ":off".into() });
    }
    if let Some(enable) = cfg.set_dsn {
        let ok = dev.apply_setting(AtaSetting::Dsn(enable)).is_ok();
        record("DSN", ok, if enable { ":on".into() } else { ":off".into() });
    }
    if cfg.set_security_freeze {
        let ok = dev.apply_setting(AtaSetting::SecurityFreeze).is_ok();
        record("Security freeze", ok, String::new());
    }
    if let Some(period) = cfg.set_standby {
        let ok = dev.apply_setting(AtaSetting::StandbyTimer(period)).is_ok();
        let text = period.map_or(":off".into(), |v| format!(":{v}"));
        record("Standby", ok, text);
    }

    if !msg.is_empty() {
        info!("Device: {name}, ATA settings applied: {msg}");
    }
}

fn probe_scsi(
    cfg: &mut DevConfig,
    state: &mut DevState,
    dev: &mut dyn diskwatch_device::ScsiDevice,
    enrolled: &[MonitoredDevice],
    opts: &RegistrarOptions,
) -> Result<Probe> {
    let name = cfg.name.clone();

    let identity = match dev.inquiry() {
        Ok(identity) => identity,
        Err(e) => {
            info!("Device: {name}, INQUIRY failed; skip device [{e}]");
            return Ok(Probe::Skipped);
        }
    };
    cfg.dev_idinfo = identity.idinfo();
    cfg.id_is_unique = identity.is_unique() && !sanitize_idinfo(&mut cfg.dev_idinfo);
    info!("Device: {name}, {}", cfg.dev_idinfo);

    if is_duplicate(cfg, enrolled) {
        return Ok(Probe::Duplicate);
    }

    if let Err(e) = dev.test_unit_ready() {
        match e {
            Error::NotReady => info!("Device: {name}, NOT READY (e.g. spun down); skip device"),
            Error::NoMedium => info!("Device: {name}, NO MEDIUM present; skip device"),
            Error::BecomingReady => {
                info!("Device: {name}, BECOMING (but not yet) READY; skip device")
            }
            other => error!("Device: {name}, failed Test Unit Ready [{other}]"),
        }
        return Ok(Probe::Skipped);
    }

    match dev.ie_enabled() {
        Ok(true) => {}
        Ok(false) => {
            info!("Device: {name}, IE (SMART) not enabled, skip device");
            return Ok(Probe::Skipped);
        }
        // Not supporting the IE mode page is acceptable
        Err(Error::UnsupportedCommand(_) | Error::Capability(_)) => {}
        Err(e) => {
            info!("Device: {name}, Bad IEC (SMART) mode page, skip device [{e}]");
            return Ok(Probe::Skipped);
        }
    }

    state.temp.log_pages = dev.supported_log_pages().unwrap_or_default();

    // Will health reads work at all?
    match dev.check_ie() {
        Ok(ie) => {
            if ie.temperature == 0 && (cfg.tempdiff != 0 || cfg.tempinfo != 0 || cfg.tempcrit != 0)
            {
                info!(
                    "Device: {name}, can't monitor Temperature, ignoring -W {},{},{}",
                    cfg.tempdiff, cfg.tempinfo, cfg.tempcrit
                );
                cfg.tempdiff = 0;
                cfg.tempinfo = 0;
                cfg.tempcrit = 0;
            }
        }
        Err(_) => {
            info!("Device: {name}, unexpectedly failed to read SMART values");
            state.temp.suppress_report = true;
            cfg.tempdiff = 0;
            cfg.tempinfo = 0;
            cfg.tempcrit = 0;
        }
    }

    // Capability check: self-test log
    if cfg.selftest {
        match dev.count_failed_selftests() {
            Ok((count, hour)) => {
                state.persist.selftest_errors = count;
                state.persist.selftest_last_err_hour = u64::from(hour);
            }
            Err(_) => {
                info!("Device: {name}, does not support SMART Self-Test Log.");
                cfg.selftest = false;
            }
        }
    }

    if let Some(enable) = cfg.autosave {
        // GLTSD bit is set to disable saving
        let what = if enable { "enable" } else { "disable" };
        match dev.set_gltsd(!enable) {
            Ok(()) => info!("Device: {name}, {what}d autosave (GLTSD bit)."),
            Err(_) => info!("Device: {name}, could not {what} autosave (GLTSD bit)."),
        }
    }

    info!("Device: {name}, is SMART capable. Adding to \"monitor\" list.");

    // ATA specific self-tests don't apply
    state.temp.not_cap_conveyance = true;
    state.temp.not_cap_offline = true;
    state.temp.not_cap_selective = true;
    cfg.offlinests_ns = false;
    cfg.selfteststs_ns = false;

    let serial = identity.serial.clone().unwrap_or_default();
    state_paths(
        opts,
        Protocol::Scsi,
        &[&identity.vendor, &identity.product, &serial],
        cfg,
        state,
    );
    Ok(Probe::Registered)
}

fn probe_nvme(
    cfg: &mut DevConfig,
    state: &mut DevState,
    dev: &mut dyn diskwatch_device::NvmeDevice,
    enrolled: &[MonitoredDevice],
    opts: &RegistrarOptions,
) -> Result<Probe> {
    let name = cfg.name.clone();

    let identity = match dev.identify_controller() {
        Ok(identity) => identity,
        Err(e) => {
            info!("Device: {name}, NVMe Identify Controller failed: {e}");
            return Ok(Probe::Skipped);
        }
    };
    let nsid = dev.nsid();
    cfg.dev_idinfo = identity.idinfo(Some(nsid));
    // Keep a version without the namespace id for duplicate detection
    // when the controller supports only one namespace.
    if nsid != BROADCAST_NSID && identity.num_namespaces == 1 {
        cfg.dev_idinfo_bc = identity.idinfo(None);
    }
    cfg.id_is_unique = !sanitize_idinfo(&mut cfg.dev_idinfo);
    info!("Device: {name}, {}", cfg.dev_idinfo);

    if is_duplicate(cfg, enrolled) {
        return Ok(Probe::Duplicate);
    }

    let smart_log = match dev.smart_log() {
        Ok(log) => log,
        Err(_) => {
            info!("Device: {name}, failed to read NVMe SMART/Health Information");
            return Ok(Probe::Skipped);
        }
    };

    if (cfg.tempdiff != 0 || cfg.tempinfo != 0 || cfg.tempcrit != 0)
        && smart_log.temperature_kelvin == 0
    {
        info!(
            "Device: {name}, no Temperature sensors, ignoring -W {},{},{}",
            cfg.tempdiff, cfg.tempinfo, cfg.tempcrit
        );
        cfg.tempdiff = 0;
        cfg.tempinfo = 0;
        cfg.tempcrit = 0;
    }

    // Seed the change-tracking baseline from this first reading; a
    // loaded state file overrides it below.
    state.persist.nvme_available_spare = smart_log.available_spare;
    state.persist.nvme_percentage_used = smart_log.percentage_used;
    state.persist.nvme_media_errors = smart_log.media_errors.to_u64();

    cfg.nvme_err_log_max_entries = identity.max_error_log_entries();
    if cfg.errorlog || cfg.xerrorlog {
        let want = cfg.nvme_err_log_max_entries.min(64);
        if dev.error_log(want).is_err() {
            info!("Device: {name}, Error Information unavailable, ignoring -l [x]error");
            cfg.errorlog = false;
            cfg.xerrorlog = false;
        } else {
            state.persist.nvme_err_log_entries = smart_log.num_err_log_entries.to_u64();
        }
    }

    // Capability check: self-tests
    state.temp.not_cap_short = !identity.selftest_capable;
    state.temp.not_cap_long = !identity.selftest_capable;
    state.persist.selftest_errors = 0;
    state.persist.selftest_last_err_hour = 0;
    if cfg.selftest || cfg.selfteststs || cfg.test_regex.is_some() {
        if !state.temp.not_cap_short && dev.selftest_log().is_err() {
            info!("Device: {name}, Read NVMe Self-test Log failed");
            state.temp.not_cap_short = true;
            state.temp.not_cap_long = true;
        }
        if state.temp.not_cap_short {
            info!(
                "Device: {name}, does not support NVMe Self-tests, ignoring{}{}{}",
                if cfg.selftest { " -l selftest" } else { "" },
                if cfg.selfteststs { " -l selfteststs" } else { "" },
                cfg.test_regex
                    .as_ref()
                    .map(|r| format!(" -s {}", r.pattern()))
                    .unwrap_or_default()
            );
            cfg.selftest = false;
            cfg.selfteststs = false;
            cfg.test_regex = None;
        }
    }

    // Anything left to monitor?
    if !(cfg.smartcheck_nvme != 0 && cfg.smartcheck
        || cfg.prefail
        || cfg.usage
        || cfg.usagefailed
        || cfg.errorlog
        || cfg.xerrorlog
        || cfg.selftest
        || cfg.selfteststs
        || cfg.test_regex.is_some()
        || cfg.tempdiff != 0
        || cfg.tempinfo != 0
        || cfg.tempcrit != 0)
    {
        return Ok(Probe::Skipped);
    }

    info!("Device: {name}, is SMART capable. Adding to \"monitor\" list.");

    // ATA specific self-tests don't apply
    state.temp.not_cap_conveyance = true;
    state.temp.not_cap_offline = true;
    state.temp.not_cap_selective = true;
    cfg.offlinests_ns = false;
    cfg.selfteststs_ns = false;

    let ns_part = if nsid != BROADCAST_NSID {
        format!("-n{nsid}")
    } else {
        String::new()
    };
    let stem = format!(
        "{}-{}{}",
        sanitize_filename_part(&identity.model),
        sanitize_filename_part(&identity.serial),
        ns_part
    );
    if let Some(prefix) = &opts.state_prefix {
        let path = PathBuf::from(format!("{prefix}{stem}.nvme.state"));
        state.load(&path, &cfg.name);
        cfg.state_file = Some(path);
    }
    if let Some(prefix) = &opts.attrlog_prefix {
        cfg.attrlog_file = Some(PathBuf::from(format!("{prefix}{stem}.nvme.csv")));
    }
    Ok(Probe::Registered)
}

/// Outcome of registering one entry.
enum Registration {
    Enrolled(Box<MonitoredDevice>),
    Duplicate,
    Failed,
}

fn register_one(
    mut cfg: DevConfig,
    mut dev: AnyDevice,
    enrolled: &[MonitoredDevice],
    opts: &RegistrarOptions,
    now: i64,
) -> Result<Registration> {
    if let Err(e) = dev.open() {
        info!("Device: {}, open() failed: {e}", cfg.name);
        return Ok(Registration::Failed);
    }
    info!("Device: {}, opened", cfg.name);

    let mut state = DevState::default();
    let probe = match &mut dev {
        AnyDevice::Ata(handle) => probe_ata(&mut cfg, &mut state, handle.as_mut(), enrolled, opts),
        AnyDevice::Scsi(handle) => {
            probe_scsi(&mut cfg, &mut state, handle.as_mut(), enrolled, opts)
        }
        AnyDevice::Nvme(handle) => {
            probe_nvme(&mut cfg, &mut state, handle.as_mut(), enrolled, opts)
        }
    };
    let _ = dev.close();

    match probe? {
        Probe::Duplicate => Ok(Registration::Duplicate),
        Probe::Skipped => Ok(Registration::Failed),
        Probe::Registered => {
            finish_device(&mut cfg, &mut state, now);
            Ok(Registration::Enrolled(Box::new(MonitoredDevice {
                cfg,
                state,
                dev,
            })))
        }
    }
}

/// Register all configured devices. Explicit entries that fail to
/// register are fatal unless marked removable or the quit policy is
/// `never`; devices found by scan fail softly.
pub fn register_devices(
    parse: ConfigParse,
    factory: &dyn DeviceFactory,
    opts: &RegistrarOptions,
    notifier: &dyn Notifier,
) -> Result<Vec<MonitoredDevice>> {
    let now = Utc::now().timestamp();
    let mut enrolled: Vec<MonitoredDevice> = Vec::new();
    // Device names already handled, for DEVICESCAN suppression
    let mut seen_names: HashMap<String, String> = HashMap::new();

    for cfg in parse.entries {
        if cfg.ignore {
            info!(
                "Device: {}{}, ignored",
                cfg.name,
                if cfg.dev_type.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", cfg.dev_type)
                }
            );
            seen_names.insert(cfg.dev_name.clone(), cfg.name.clone());
            continue;
        }

        // Prevent service-manager startup timeouts while probing
        notifier.extend_timeout();

        let dev = match factory.device(&cfg.dev_name, &cfg.dev_type) {
            Ok(dev) => dev,
            Err(e) => {
                info!("Device: {}, {e}", cfg.name);
                if !(cfg.removable || opts.quit_never) {
                    error!(
                        "Unable to register device {} (no Directive -d removable). Exiting.",
                        cfg.name
                    );
                    return Err(Error::Resource(format!(
                        "unable to register device {}",
                        cfg.name
                    )));
                }
                info!("Device: {}, not available", cfg.name);
                seen_names.insert(cfg.dev_name.clone(), cfg.name.clone());
                continue;
            }
        };

        let dev_name = cfg.dev_name.clone();
        let display_name = cfg.name.clone();
        let removable = cfg.removable;
        match register_one(cfg, dev, &enrolled, opts, now)? {
            Registration::Enrolled(monitored) => {
                seen_names.insert(dev_name, display_name);
                enrolled.push(*monitored);
            }
            Registration::Duplicate => {
                seen_names.insert(dev_name, display_name);
            }
            Registration::Failed => {
                if !(removable || opts.quit_never) {
                    error!(
                        "Unable to register device {} (no Directive -d removable). Exiting.",
                        display_name
                    );
                    return Err(Error::Resource(format!(
                        "unable to register device {display_name}"
                    )));
                }
                info!("Device: {display_name}, not available");
                seen_names.insert(dev_name, display_name);
            }
        }
    }

    if let Some((base, types)) = parse.scan {
        let scanned = factory.scan(&types)?;
        if scanned.is_empty() {
            warn!("In the system's table of devices NO devices found to scan");
        }
        for found in scanned {
            // A preceding explicit entry for the same device wins
            if let Some(prev) = seen_names.get(&found.name) {
                let same_name = prev == &found.name;
                info!(
                    "Device: {}, {}{}, ignored",
                    found.name,
                    if same_name { "duplicate" } else { "same as " },
                    if same_name { "" } else { prev }
                );
                continue;
            }
            notifier.extend_timeout();

            let mut cfg = base.clone();
            cfg.name = found.name.clone();
            cfg.dev_name = found.name.clone();
            cfg.dev_type = if types.is_empty() {
                String::new()
            } else {
                found.dev_type.clone()
            };
            match register_one(cfg, found.device, &enrolled, opts, now)? {
                Registration::Enrolled(monitored) => {
                    seen_names.insert(found.name, monitored.cfg.name.clone());
                    enrolled.push(*monitored);
                }
                Registration::Duplicate | Registration::Failed => {
                    debug!("Device: {}, not registered", found.name);
                }
            }
        }
    }

    // Assign stagger factors for scheduled tests, in enrollment order
    let mut factor = 0u32;
    for monitored in &mut enrolled {
        if monitored.cfg.test_regex.is_some() {
            monitored.cfg.test_offset_factor = factor;
            factor += 1;
        }
    }

    Ok(enrolled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config_text;
    use diskwatch_device::ata::AtaIdentity;
    use diskwatch_device::mock::{AtaScript, MockAta, MockFactory, MockNvme, NvmeScript};
    use diskwatch_device::nvme::NvmeIdentity;
    use diskwatch_device::HealthStatus;

    fn ata_identity(serial: &str) -> AtaIdentity {
        AtaIdentity {
            model: "TESTDISK 2000".into(),
            serial: serial.into(),
            firmware: "1.0".into(),
            capacity: 2_000_000_000_000,
            sectors: 3_907_029_168,
            smart_supported: true,
            smart_enabled: true,
            ..Default::default()
        }
    }

    fn ata_device(serial: &str) -> AnyDevice {
        let (dev, _) = MockAta::new(AtaScript {
            identity: Some(ata_identity(serial)),
            health: Some(HealthStatus::Passed),
            ..Default::default()
        });
        AnyDevice::Ata(Box::new(dev))
    }

    fn opts() -> RegistrarOptions {
        RegistrarOptions {
            state_prefix: None,
            attrlog_prefix: None,
            quit_never: false,
        }
    }

    #[test]
    fn test_register_health_only_entry() {
        let factory = MockFactory::new();
        factory.add("/dev/sda", ata_device("SER123"));
        let parse = parse_config_text("/dev/sda -H\n", "t.conf").unwrap();
        let devices = register_devices(parse, &factory, &opts(), &NullNotifier).unwrap();
        assert_eq!(devices.len(), 1);
        assert!(devices[0].cfg.smartcheck);
        assert!(devices[0].cfg.dev_idinfo.contains("SER123"));
    }

    #[test]
    fn test_missing_device_is_fatal_without_removable() {
        let factory = MockFactory::new();
        let parse = parse_config_text("/dev/sda -H\n", "t.conf").unwrap();
        assert!(register_devices(parse, &factory, &opts(), &NullNotifier).is_err());
    }

    #[test]
    fn test_missing_removable_device_is_skipped() {
        let factory = MockFactory::new();
        let parse = parse_config_text("/dev/sda -H -d removable\n", "t.conf").unwrap();
        let devices = register_devices(parse, &factory, &opts(), &NullNotifier).unwrap();
        assert!(devices.is_empty());
    }

    #[test]
    fn test_duplicate_identity_enrolls_once() {
        let factory = MockFactory::new();
        factory.add("/dev/sda", ata_device("SAME"));
        factory.add("/dev/disk-alias", ata_device("SAME"));
        let parse =
            parse_config_text("/dev/sda -H\n/dev/disk-alias -H\n", "t.conf").unwrap();
        let devices = register_devices(parse, &factory, &opts(), &NullNotifier).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].cfg.dev_name, "/dev/sda");
    }

    #[test]
    fn test_devicescan_expansion() {
        let factory = MockFactory::new();
        factory.add_scanned("/dev/sda", "sat", ata_device("A1"));
        factory.add_scanned("/dev/sdb", "sat", ata_device("B2"));
        let parse = parse_config_text("DEVICESCAN -H -m root@host\n", "t.conf").unwrap();
        let devices = register_devices(parse, &factory, &opts(), &NullNotifier).unwrap();
        assert_eq!(devices.len(), 2);
        assert!(devices.iter().all(|d| d.cfg.smartcheck));
        assert!(devices.iter().all(|d| d.cfg.emailaddress == "root@host"));
    }

    #[test]
    fn test_scan_skips_explicit_entries() {
        let factory = MockFactory::new();
        factory.add("/dev/sda", ata_device("A1"));
        factory.add_scanned("/dev/sda", "", ata_device("A1"));
        factory.add_scanned("/dev/sdb", "", ata_device("B2"));
        let parse = parse_config_text("/dev/sda -H -W 0,0,60\nDEVICESCAN -H\n", "t.conf").unwrap();
        let devices = register_devices(parse, &factory, &opts(), &NullNotifier).unwrap();
        assert_eq!(devices.len(), 2);
        // The explicit entry's directives win for /dev/sda
        assert_eq!(devices[0].cfg.tempcrit, 60);
        assert_eq!(devices[1].cfg.tempcrit, 0);
    }

    #[test]
    fn test_stagger_factors_assigned_in_order() {
        let factory = MockFactory::new();
        factory.add("/dev/sda", ata_device("A1"));
        factory.add("/dev/sdb", ata_device("B2"));
        factory.add("/dev/sdc", ata_device("C3"));
        let parse = parse_config_text(
            "/dev/sda -H -s L/../../7/02\n/dev/sdb -H\n/dev/sdc -H -s L/../../7/02\n",
            "t.conf",
        )
        .unwrap();
        let devices = register_devices(parse, &factory, &opts(), &NullNotifier).unwrap();
        assert_eq!(devices[0].cfg.test_offset_factor, 0);
        assert_eq!(devices[2].cfg.test_offset_factor, 1);
    }

    #[test]
    fn test_schedule_watermark_seeded() {
        let factory = MockFactory::new();
        factory.add("/dev/sda", ata_device("A1"));
        let parse = parse_config_text("/dev/sda -H -s L/../../7/02\n", "t.conf").unwrap();
        let devices = register_devices(parse, &factory, &opts(), &NullNotifier).unwrap();
        assert!(devices[0].state.persist.scheduled_test_next_check > 0);
    }

    #[test]
    fn test_email_freq_defaults() {
        let factory = MockFactory::new();
        factory.add("/dev/sda", ata_device("A1"));
        let parse = parse_config_text("/dev/sda -H -m root@host\n", "t.conf").unwrap();
        let devices = register_devices(parse, &factory, &opts(), &NullNotifier).unwrap();
        // No state file: default to `once`
        assert_eq!(devices[0].cfg.emailfreq, crate::config::EmailFreq::Once);
    }

    #[test]
    fn test_state_file_loaded_and_paths_set() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = format!("{}/", dir.path().display());
        let state_path = dir.path().join("TESTDISK_2000-A1.ata.state");
        std::fs::write(&state_path, "temperature-max = 44\n").unwrap();

        let factory = MockFactory::new();
        factory.add("/dev/sda", ata_device("A1"));
        let parse = parse_config_text("/dev/sda -H -m root@host\n", "t.conf").unwrap();
        let opts = RegistrarOptions {
            state_prefix: Some(prefix.clone()),
            attrlog_prefix: Some(prefix),
            quit_never: false,
        };
        let devices = register_devices(parse, &factory, &opts, &NullNotifier).unwrap();
        let monitored = &devices[0];
        assert_eq!(monitored.state.persist.tempmax, 44);
        assert_eq!(monitored.cfg.state_file.as_deref(), Some(state_path.as_path()));
        assert!(monitored
            .cfg
            .attrlog_file
            .as_ref()
            .unwrap()
            .to_string_lossy()
            .ends_with("TESTDISK_2000-A1.ata.csv"));
        // With a state file the warning frequency defaults to daily
        assert_eq!(monitored.cfg.emailfreq, crate::config::EmailFreq::Daily);
    }

    #[test]
    fn test_nvme_capability_downgrade() {
        let (dev, _) = MockNvme::new(NvmeScript {
            identity: Some(NvmeIdentity {
                model: "NVMe Disk".into(),
                serial: "N1".into(),
                firmware: "1".into(),
                selftest_capable: false,
                num_namespaces: 1,
                error_log_entries: 63,
                ..Default::default()
            }),
            nsid: 1,
            smart_log: Some(Default::default()),
            error_log: Some(Vec::new()),
            ..Default::default()
        });
        let factory = MockFactory::new();
        factory.add("/dev/nvme0n1", AnyDevice::Nvme(Box::new(dev)));
        let parse = parse_config_text(
            "/dev/nvme0n1 -H -l selftest -s L/../../7/02 -l error\n",
            "t.conf",
        )
        .unwrap();
        let devices = register_devices(parse, &factory, &opts(), &NullNotifier).unwrap();
        let cfg = &devices[0].cfg;
        // Self-test monitoring downgraded, health check kept
        assert!(!cfg.selftest);
        assert!(cfg.test_regex.is_none());
        assert!(cfg.smartcheck);
        assert!(cfg.errorlog);
        assert_eq!(cfg.nvme_err_log_max_entries, 64);
    }
}
