//! Check engine
//!
//! One health-interrogation cycle for one device: power-mode policy,
//! health status, attribute diffing against the previous snapshot,
//! pending-sector and temperature evaluation, self-test and error log
//! rechecks, status-transition logging, and scheduled self-test starts.
//!
//! Anomalies are routed into the warning pipeline; persistent state is
//! mutated and flagged for flushing by the supervisor.

use crate::config::{
    DevConfig, MONITOR_AS_CRIT, MONITOR_IGNORE, MONITOR_IGN_FAILUSE, MONITOR_RAW,
    MONITOR_RAW_AS_CRIT, MONITOR_RAW_PRINT,
};
use crate::registrar::MonitoredDevice;
use crate::scheduler::{next_scheduled_test, ScheduleInput, TestCaps};
use crate::state::{AttrlogData, DevState};
use crate::warning::Warner;
use diskwatch_common::WarnType;
use diskwatch_device::ata::{
    classify_attr, offline_status_text, selftest_in_progress, selftest_status_text,
    temperature_value, AttrState, SmartAttr, SmartValues,
};
use diskwatch_device::nvme::{
    format_critical_warning, selftest_op_text, selftest_result_text, status_is_device_error,
    status_text, NvmeSelfTestLog,
};
use diskwatch_device::scsi::{ie_string, EcKind};
use diskwatch_device::{
    AnyDevice, AtaDevice, AtaTest, NvmeDevice, PowerMode, ScsiDevice, SelectiveMode,
};
use tracing::{debug, error, info};

/// Default global check interval, seconds. Also sizes the startup grace
/// period before the minimum temperature may narrow.
pub const DEFAULT_CHECK_INTERVAL: u32 = 1800;

/// Shared inputs for one check cycle.
pub struct CheckContext<'a> {
    pub warner: &'a Warner,
    /// First pass after (re)registration: status codes get logged even
    /// without a transition, self-tests are normally suppressed.
    pub firstpass: bool,
    pub allow_selftests: bool,
    pub debug: bool,
    /// Wall clock for throttle, temperature and schedule decisions.
    pub now: i64,
}

/// Run one check cycle for one device.
pub async fn check_device(monitored: &mut MonitoredDevice, ctx: &CheckContext<'_>) {
    let MonitoredDevice { cfg, state, dev } = monitored;
    match dev {
        AnyDevice::Ata(handle) => check_ata(cfg, state, handle.as_mut(), ctx).await,
        AnyDevice::Scsi(handle) => check_scsi(cfg, state, handle.as_mut(), ctx).await,
        AnyDevice::Nvme(handle) => check_nvme(cfg, state, handle.as_mut(), ctx).await,
    }
}

/// Open the device for a check. Returns false when the cycle should be
/// skipped; warning/removal bookkeeping is handled here.
async fn open_device(
    cfg: &DevConfig,
    state: &mut DevState,
    dev: &mut dyn diskwatch_device::Device,
    type_name: &str,
    ctx: &CheckContext<'_>,
) -> bool {
    // A test message is requested once per registration generation
    if cfg.emailtest {
        ctx.warner
            .warn_at(
                ctx.now,
                cfg,
                state,
                WarnType::EmailTest,
                &format!("TEST EMAIL from diskwatchd for device: {}", cfg.name),
            )
            .await;
    }

    if let Err(e) = dev.open() {
        if !cfg.removable {
            info!(
                "Device: {}, open() of {type_name} device failed: {e}",
                cfg.name
            );
            ctx.warner
                .warn_at(
                    ctx.now,
                    cfg,
                    state,
                    WarnType::FailedOpenDevice,
                    &format!("Device: {}, unable to open {type_name} device", cfg.name),
                )
                .await;
        } else if !state.temp.removed {
            info!("Device: {}, removed {type_name} device: {e}", cfg.name);
            state.temp.removed = true;
        } else if ctx.debug {
            info!("Device: {}, {type_name} device still removed: {e}", cfg.name);
        }
        return false;
    }

    if ctx.debug {
        info!("Device: {}, opened {type_name} device", cfg.name);
    }
    if !cfg.removable {
        ctx.warner.reset(
            cfg,
            state,
            WarnType::FailedOpenDevice,
            &format!("open of {type_name} device worked again"),
        );
    } else if state.temp.removed {
        info!("Device: {}, reconnected {type_name} device", cfg.name);
        state.temp.removed = false;
    }
    true
}

fn close_device(cfg: &DevConfig, dev: &mut dyn diskwatch_device::Device) {
    if let Err(e) = dev.close() {
        info!("Device: {}, close() failed: {e}", cfg.name);
    }
}

/// Format a temperature byte, `??` when unset.
fn fmt_temp(value: u8) -> String {
    if value == 0 {
        "??".to_string()
    } else {
        value.to_string()
    }
}

/// Temperature tracking and limits: the maximum rises monotonically,
/// the minimum only narrows after the startup grace interval, changes
/// of at least `tempdiff` are logged, limit crossings warn, and a drop
/// below `min(tempinfo, tempcrit - 5)` clears the throttle.
async fn check_temperature(
    cfg: &DevConfig,
    state: &mut DevState,
    warner: &Warner,
    now: i64,
    currtemp: u8,
    triptemp: u8,
) {
    if currtemp == 0 || currtemp == 255 {
        info!("Device: {}, failed to read Temperature", cfg.name);
        return;
    }

    let mut minchg = "";
    let mut maxchg = "";
    if currtemp > state.persist.tempmax {
        if state.persist.tempmax != 0 {
            maxchg = "!";
        }
        state.persist.tempmax = currtemp;
        state.temp.must_write = true;
    }

    if state.temp.temperature == 0 {
        // First reading: a cold-start value must not latch the minimum
        if state.persist.tempmin == 0 || currtemp < state.persist.tempmin {
            state.temp.tempmin_delay = now + i64::from(DEFAULT_CHECK_INTERVAL) - 60;
        }
        info!(
            "Device: {}, initial Temperature is {currtemp} Celsius (Min/Max {}/{}{maxchg})",
            cfg.name,
            fmt_temp(state.persist.tempmin),
            state.persist.tempmax
        );
        if triptemp != 0 {
            info!("    [trip Temperature is {triptemp} Celsius]");
        }
        state.temp.temperature = currtemp;
    } else {
        if state.temp.tempmin_delay != 0 {
            // End the delay if the reading already exceeds the stored
            // minimum, or the grace interval is over
            if (state.persist.tempmin != 0 && currtemp > state.persist.tempmin)
                || state.temp.tempmin_delay <= now
            {
                state.temp.tempmin_delay = 0;
                if state.persist.tempmin == 0 {
                    state.persist.tempmin = 255;
                }
            }
        }

        if state.temp.tempmin_delay == 0 && currtemp < state.persist.tempmin {
            state.persist.tempmin = currtemp;
            state.temp.must_write = true;
            if currtemp != state.temp.temperature {
                minchg = "!";
            }
        }

        let diff = i32::from(currtemp) - i32::from(state.temp.temperature);
        if cfg.tempdiff != 0
            && (!minchg.is_empty() || !maxchg.is_empty() || diff.unsigned_abs() >= u32::from(cfg.tempdiff))
        {
            info!(
                "Device: {}, Temperature changed {diff:+} Celsius to {currtemp} Celsius (Min/Max {}{minchg}/{}{maxchg})",
                cfg.name,
                fmt_temp(state.persist.tempmin),
                state.persist.tempmax
            );
            state.temp.temperature = currtemp;
        }
    }

    if cfg.tempcrit != 0 && currtemp >= cfg.tempcrit {
        let msg = format!(
            "Device: {}, Temperature {currtemp} Celsius reached critical limit of {} Celsius (Min/Max {}{minchg}/{}{maxchg})",
            cfg.name,
            cfg.tempcrit,
            fmt_temp(state.persist.tempmin),
            state.persist.tempmax
        );
        error!("{msg}");
        warner
            .warn_at(now, cfg, state, WarnType::Temperature, &msg)
            .await;
    } else if cfg.tempinfo != 0 && currtemp >= cfg.tempinfo {
        info!(
            "Device: {}, Temperature {currtemp} Celsius reached limit of {} Celsius (Min/Max {}{minchg}/{}{maxchg})",
            cfg.name,
            cfg.tempinfo,
            fmt_temp(state.persist.tempmin),
            state.persist.tempmax
        );
    } else if cfg.tempcrit != 0 {
        let limit = if cfg.tempinfo != 0 {
            cfg.tempinfo
        } else {
            cfg.tempcrit - 5
        };
        if currtemp < limit {
            warner.reset(
                cfg,
                state,
                WarnType::Temperature,
                &format!("Temperature {currtemp} Celsius dropped below {limit} Celsius"),
            );
        }
    }
}

/// Compare one attribute against the previous snapshot and the
/// thresholds; report failures and tracked changes.
async fn check_attribute(
    cfg: &DevConfig,
    state: &mut DevState,
    warner: &Warner,
    now: i64,
    attr: &SmartAttr,
    prev: &SmartAttr,
    idx: usize,
) {
    let attrstate = classify_attr(attr, idx, &state.temp.smartthres);
    if attrstate == AttrState::NonExisting {
        return;
    }

    // Newly failed usage attribute
    if cfg.usagefailed
        && attrstate == AttrState::FailedNow
        && !cfg.monitor_attr_flags.is_set(attr.id, MONITOR_IGN_FAILUSE)
    {
        let msg = format!(
            "Device: {}, Failed SMART usage Attribute: {} {}.",
            cfg.name,
            attr.id,
            cfg.attr_name(attr.id)
        );
        error!("{msg}");
        warner.warn_at(now, cfg, state, WarnType::Usage, &msg).await;
        state.temp.must_write = true;
    }

    // Is this type of attribute being tracked?
    let prefail = attr.is_prefail();
    if !((prefail && cfg.prefail) || (!prefail && cfg.usage)) {
        return;
    }
    if cfg.monitor_attr_flags.is_set(attr.id, MONITOR_IGNORE) {
        return;
    }

    if attr.id != prev.id {
        info!(
            "Device: {}, same Attribute has different ID numbers: {} = {}",
            cfg.name, attr.id, prev.id
        );
        return;
    }

    let valchanged = attrstate > AttrState::NoNormVal && attr.current != prev.current;
    let rawchanged =
        cfg.monitor_attr_flags.is_set(attr.id, MONITOR_RAW) && attr.raw48() != prev.raw48();
    if !(valchanged || rawchanged) {
        return;
    }

    let (currstr, prevstr) = if attrstate == AttrState::NoNormVal {
        (
            format!("{} (Raw)", attr.raw48()),
            format!("{} (Raw)", prev.raw48()),
        )
    } else if cfg.monitor_attr_flags.is_set(attr.id, MONITOR_RAW_PRINT) {
        (
            format!("{} [Raw {}]", attr.current, attr.raw48()),
            format!("{} [Raw {}]", prev.current, prev.raw48()),
        )
    } else {
        (attr.current.to_string(), prev.current.to_string())
    };

    let msg = format!(
        "Device: {}, SMART {} Attribute: {} {} changed from {} to {}",
        cfg.name,
        if prefail { "Prefailure" } else { "Usage" },
        attr.id,
        cfg.attr_name(attr.id),
        prevstr,
        currstr
    );

    let critical = (valchanged && cfg.monitor_attr_flags.is_set(attr.id, MONITOR_AS_CRIT))
        || (rawchanged && cfg.monitor_attr_flags.is_set(attr.id, MONITOR_RAW_AS_CRIT));
    if critical {
        error!("{msg}");
        warner.warn_at(now, cfg, state, WarnType::Usage, &msg).await;
    } else {
        info!("{msg}");
    }
    state.temp.must_write = true;
}

/// Evaluate a pending-sector attribute (`-C`/`-U`).
async fn check_pending(
    cfg: &DevConfig,
    state: &mut DevState,
    warner: &Warner,
    now: i64,
    values: &SmartValues,
    id: u8,
    increase_only: bool,
    which: WarnType,
    msg: &str,
) {
    let Some(idx) = values.find_attr(id) else {
        return;
    };
    let prev_values = state.temp.smartval.as_ref();
    if prev_values.and_then(|p| p.find_attr(id)) != Some(idx) {
        return;
    }

    let rawval = values.attrs[idx].raw48();
    if rawval == 0 {
        warner.reset(cfg, state, which, &format!("No more {msg}"));
        return;
    }

    let prev_rawval = prev_values.map_or(0, |p| p.attrs[idx].raw48());
    if increase_only && prev_rawval >= rawval {
        return;
    }

    let mut text = format!("Device: {}, {rawval} {msg}", cfg.name);
    if prev_rawval > 0 && rawval != prev_rawval {
        text.push_str(&format!(" (changed {:+})", rawval as i64 - prev_rawval as i64));
    }
    error!("{text}");
    warner.warn_at(now, cfg, state, which, &text).await;
    state.temp.must_write = true;
}

/// Update stored self-test error count/hour and report changes. `None`
/// means the log read failed.
async fn report_selftest_changes(
    cfg: &DevConfig,
    state: &mut DevState,
    warner: &Warner,
    now: i64,
    result: Option<(u8, u64)>,
) {
    let name = &cfg.name;
    let Some((errcnt, hour)) = result else {
        warner
            .warn_at(
                now,
                cfg,
                state,
                WarnType::FailedReadSmartSelfTestLog,
                &format!("Device: {name}, Read SMART Self-Test Log Failed"),
            )
            .await;
        return;
    };
    warner.reset(
        cfg,
        state,
        WarnType::FailedReadSmartSelfTestLog,
        "Read SMART Self-Test Log worked again",
    );

    if state.persist.selftest_errors < errcnt {
        let msg = format!(
            "Device: {name}, Self-Test Log error count increased from {} to {errcnt}",
            state.persist.selftest_errors
        );
        error!("{msg}");
        warner.warn_at(now, cfg, state, WarnType::SelfTest, &msg).await;
        state.temp.must_write = true;
    } else if errcnt > 0 && state.persist.selftest_last_err_hour != hour {
        // A more recent error may carry a smaller hour number if the
        // 16-bit hour counter wrapped
        let msg =
            format!("Device: {name}, new Self-Test Log error at hour timestamp {hour}");
        error!("{msg}");
        warner.warn_at(now, cfg, state, WarnType::SelfTest, &msg).await;
        state.temp.must_write = true;
    }

    if state.persist.selftest_errors > errcnt {
        info!(
            "Device: {name}, Self-Test Log error count decreased from {} to {errcnt}",
            state.persist.selftest_errors
        );
        if errcnt == 0 {
            warner.reset(
                cfg,
                state,
                WarnType::SelfTest,
                "Self-Test Log does no longer report errors",
            );
        }
    }

    state.persist.selftest_errors = errcnt;
    state.persist.selftest_last_err_hour = hour;
}

fn schedule_caps(state: &DevState) -> TestCaps {
    TestCaps {
        offline: !state.temp.not_cap_offline,
        short: !state.temp.not_cap_short,
        long: !state.temp.not_cap_long,
        conveyance: !state.temp.not_cap_conveyance,
        selective: !state.temp.not_cap_selective,
    }
}

/// Consult the scheduler for this device.
fn pick_scheduled_test(
    cfg: &DevConfig,
    state: &mut DevState,
    ctx: &CheckContext<'_>,
) -> Option<char> {
    let regex = cfg.test_regex.as_ref()?;
    if !ctx.allow_selftests {
        return None;
    }
    let input = ScheduleInput {
        regex,
        offset_factor: cfg.test_offset_factor,
        caps: schedule_caps(state),
    };
    let watermark = &mut state.persist.scheduled_test_next_check;
    let before = *watermark;
    let test = next_scheduled_test(&cfg.name, &input, watermark, ctx.now, false);
    if *watermark != before || test.is_some() {
        state.temp.must_write = true;
    }
    test
}

/// Start an ATA self-test chosen by the scheduler.
fn do_ata_selftest(
    cfg: &DevConfig,
    state: &mut DevState,
    dev: &mut dyn AtaDevice,
    testtype: char,
) {
    let name = &cfg.name;

    let values = match dev.read_smart_values() {
        Ok(values) => values,
        Err(_) => {
            error!("Device: {name}, not capable of Offline or Self-Testing.");
            return;
        }
    };

    let (testname, test) = match testtype {
        'O' if values.supports_offline_immediate() => {
            ("Offline Immediate ", Some(AtaTest::OfflineImmediate))
        }
        'O' => {
            state.temp.not_cap_offline = true;
            ("Offline Immediate ", None)
        }
        'C' if values.supports_conveyance() => ("Conveyance Self-", Some(AtaTest::Conveyance)),
        'C' => {
            state.temp.not_cap_conveyance = true;
            ("Conveyance Self-", None)
        }
        'S' if values.supports_selftest() => ("Short Self-", Some(AtaTest::Short)),
        'S' => {
            state.temp.not_cap_short = true;
            ("Short Self-", None)
        }
        'L' if values.supports_selftest() => ("Long Self-", Some(AtaTest::Extended)),
        'L' => {
            state.temp.not_cap_long = true;
            ("Long Self-", None)
        }
        'c' | 'n' | 'r' if values.supports_selective() => {
            ("Selective Self-", Some(AtaTest::Selective))
        }
        'c' | 'n' | 'r' => {
            state.temp.not_cap_selective = true;
            ("Selective Self-", None)
        }
        _ => return,
    };
    let Some(test) = test else {
        error!("Device: {name}, not capable of {testname}Test");
        return;
    };

    // Never interrupt a test that is already running
    if selftest_in_progress(values.selftest_exec_status) {
        info!(
            "Device: {name}, skip scheduled {testname}Test; {}0% remaining of current Self-Test.",
            values.selftest_exec_status & 0x0f
        );
        return;
    }

    if test == AtaTest::Selective {
        let mode = match testtype {
            'c' => SelectiveMode::Continue,
            'r' => SelectiveMode::Redo,
            _ => SelectiveMode::Next,
        };
        let prev_span = (
            state.persist.selective_test_last_start,
            state.persist.selective_test_last_end,
        );
        match dev.write_selective_span(mode, prev_span) {
            Ok((start, end)) => {
                let sectors = state.temp.num_sectors.max(1);
                info!(
                    "Device: {name}, {} test span at LBA {start} - {end} ({} sectors, {}% - {}% of disk).",
                    if testtype == 'n' { "next" } else { "redo" },
                    end - start + 1,
                    (100 * start + sectors / 2) / sectors,
                    (100 * end + sectors / 2) / sectors
                );
                state.persist.selective_test_last_start = start;
                state.persist.selective_test_last_end = end;
                state.temp.must_write = true;
            }
            Err(_) => {
                error!("Device: {name}, prepare {testname}Test failed");
                return;
            }
        }
    }

    if dev.start_selftest(test).is_err() {
        error!("Device: {name}, execute {testname}Test failed.");
        return;
    }

    // Report the start to the auto-standby bookkeeping and force a log
    // of the next test status
    if testtype == 'O' {
        state.temp.offline_started = true;
    } else {
        state.temp.selftest_started = true;
    }
    info!("Device: {name}, starting scheduled {testname}Test.");
}

async fn check_ata(
    cfg: &DevConfig,
    state: &mut DevState,
    dev: &mut dyn AtaDevice,
    ctx: &CheckContext<'_>,
) {
    if !open_device(cfg, state, dev, "ATA", ctx).await {
        return;
    }
    let name = cfg.name.clone();

    // Power-mode policy: leave sleeping disks alone
    if cfg.powermode != 0 && !state.temp.powermodefail {
        let mode = dev.check_power_mode().unwrap_or(PowerMode::Sleep);
        let mut dontcheck = false;
        match mode.rank() {
            Some(rank) => dontcheck = rank <= cfg.powermode,
            None => {
                error!(
                    "Device: {name}, CHECK POWER STATUS returned {mode:?}, not ATA compliant, ignoring -n Directive"
                );
                state.temp.powermodefail = true;
            }
        }

        if dontcheck {
            if cfg.powerskipmax == 0 || state.temp.powerskipcnt < cfg.powerskipmax {
                close_device(cfg, dev);
                // Report the first skip only, except when the mode changed
                if (state.temp.powerskipcnt == 0
                    || state.temp.lastpowermodeskipped != Some(mode))
                    && !cfg.powerquiet
                {
                    info!(
                        "Device: {name}, is in {} mode, suspending checks",
                        mode.as_str()
                    );
                    state.temp.lastpowermodeskipped = Some(mode);
                }
                state.temp.powerskipcnt += 1;
                return;
            }
            info!(
                "Device: {name}, {} mode ignored due to reached limit of skipped checks ({} check{} skipped)",
                mode.as_str(),
                state.temp.powerskipcnt,
                if state.temp.powerskipcnt == 1 { "" } else { "s" }
            );
            state.temp.powerskipcnt = 0;
            state.temp.tempmin_delay = ctx.now + i64::from(DEFAULT_CHECK_INTERVAL) - 60;
        } else if state.temp.powerskipcnt > 0 {
            info!(
                "Device: {name}, is back in {} mode, resuming checks ({} check{} skipped)",
                mode.as_str(),
                state.temp.powerskipcnt,
                if state.temp.powerskipcnt == 1 { "" } else { "s" }
            );
            state.temp.powerskipcnt = 0;
            state.temp.tempmin_delay = ctx.now + i64::from(DEFAULT_CHECK_INTERVAL) - 60;
        }
    }

    // Overall health status
    if cfg.smartcheck {
        match dev.smart_status() {
            Err(_) => {
                info!("Device: {name}, not capable of SMART self-check");
                ctx.warner
                    .warn_at(
                        ctx.now,
                        cfg,
                        state,
                        WarnType::FailedHealthCheck,
                        &format!("Device: {name}, not capable of SMART self-check"),
                    )
                    .await;
                state.temp.must_write = true;
            }
            Ok(diskwatch_device::HealthStatus::Failed) => {
                let msg = format!("Device: {name}, FAILED SMART self-check. BACK UP DATA NOW!");
                error!("{msg}");
                ctx.warner
                    .warn_at(ctx.now, cfg, state, WarnType::Health, &msg)
                    .await;
                state.temp.must_write = true;
            }
            Ok(diskwatch_device::HealthStatus::Passed) => {
                if ctx.debug {
                    debug!("Device: {name}, SMART health: passed");
                }
            }
        }
    }

    // Everything that depends on SMART data
    if cfg.usagefailed
        || cfg.prefail
        || cfg.usage
        || cfg.curr_pending_id != 0
        || cfg.offl_pending_id != 0
        || cfg.tempdiff != 0
        || cfg.tempinfo != 0
        || cfg.tempcrit != 0
        || cfg.selftest
        || cfg.offlinests
        || cfg.selfteststs
    {
        match dev.read_smart_values() {
            Err(_) => {
                let msg = format!("Device: {name}, failed to read SMART Attribute Data");
                error!("{msg}");
                ctx.warner
                    .warn_at(ctx.now, cfg, state, WarnType::FailedReadSmartData, &msg)
                    .await;
                state.temp.must_write = true;
            }
            Ok(curval) => {
                ctx.warner.reset(
                    cfg,
                    state,
                    WarnType::FailedReadSmartData,
                    "read SMART Attribute Data worked again",
                );

                if cfg.curr_pending_id != 0 {
                    check_pending(
                        cfg,
                        state,
                        ctx.warner,
                        ctx.now,
                        &curval,
                        cfg.curr_pending_id,
                        cfg.curr_pending_incr,
                        WarnType::CurrentPendingSector,
                        if cfg.curr_pending_incr {
                            "Total unreadable (pending) sectors"
                        } else {
                            "Currently unreadable (pending) sectors"
                        },
                    )
                    .await;
                }
                if cfg.offl_pending_id != 0 {
                    check_pending(
                        cfg,
                        state,
                        ctx.warner,
                        ctx.now,
                        &curval,
                        cfg.offl_pending_id,
                        cfg.offl_pending_incr,
                        WarnType::OfflineUncorrectableSector,
                        if cfg.offl_pending_incr {
                            "Total offline uncorrectable sectors"
                        } else {
                            "Offline uncorrectable sectors"
                        },
                    )
                    .await;
                }

                if cfg.tempdiff != 0 || cfg.tempinfo != 0 || cfg.tempcrit != 0 {
                    let temp = temperature_value(&curval).unwrap_or(0);
                    check_temperature(cfg, state, ctx.warner, ctx.now, temp, 0).await;
                }

                if cfg.usagefailed || cfg.prefail || cfg.usage {
                    let prev = state
                        .temp
                        .smartval
                        .clone()
                        .unwrap_or_else(|| curval.clone());
                    for i in 0..curval.attrs.len() {
                        check_attribute(
                            cfg,
                            state,
                            ctx.warner,
                            ctx.now,
                            &curval.attrs[i],
                            &prev.attrs[i],
                            i,
                        )
                        .await;
                    }
                }

                // Status transitions (forced on first pass when active)
                let prev_offline = state
                    .temp
                    .smartval
                    .as_ref()
                    .map_or(0, |v| v.offline_collection_status);
                if cfg.offlinests
                    && (curval.offline_collection_status != prev_offline
                        || state.temp.offline_started
                        || (ctx.firstpass
                            && (ctx.debug || curval.offline_collection_status & 0x7d != 0)))
                {
                    log_offline_status(&name, curval.offline_collection_status);
                }
                let prev_selftest = state
                    .temp
                    .smartval
                    .as_ref()
                    .map_or(0, |v| v.selftest_exec_status);
                if cfg.selfteststs
                    && (curval.selftest_exec_status != prev_selftest
                        || state.temp.selftest_started
                        || (ctx.firstpass
                            && (ctx.debug || curval.selftest_exec_status & 0xf0 != 0)))
                {
                    log_selftest_status(&name, curval.selftest_exec_status);
                }

                // Keep the new values for the next cycle
                state.persist.sync_attributes(&curval);
                state.temp.attrlog = Some(AttrlogData::Ata(
                    curval
                        .attrs
                        .iter()
                        .filter(|a| a.id != 0)
                        .map(|a| (a.id, a.current, a.raw48()))
                        .collect(),
                ));
                state.temp.smartval = Some(curval);
            }
        }
    }
    state.temp.offline_started = false;
    state.temp.selftest_started = false;

    // Self-test log: error count may rise or fall
    if cfg.selftest {
        let result = dev.read_selftest_log().ok().map(|log| {
            let (errcnt, hour) = log.count_errors();
            (errcnt, hour)
        });
        if result.is_none() {
            info!("Device: {name}, Read SMART Self Test Log Failed");
        }
        report_selftest_changes(cfg, state, ctx.warner, ctx.now, result).await;
    }

    // ATA error logs
    if cfg.errorlog || cfg.xerrorlog {
        let mut newcnt: i64 = -1;
        let mut failed = false;
        if cfg.errorlog {
            match dev.read_error_count(false) {
                Ok(count) => newcnt = newcnt.max(count as i64),
                Err(_) => {
                    info!("Device: {name}, Read Summary SMART Error Log failed");
                    failed = true;
                }
            }
        }
        if cfg.xerrorlog {
            match dev.read_error_count(true) {
                Ok(count) => newcnt = newcnt.max(count as i64),
                Err(_) => {
                    info!("Device: {name}, Read Extended Comprehensive SMART Error Log failed");
                    failed = true;
                }
            }
        }
        if newcnt < 0 && failed {
            ctx.warner
                .warn_at(
                    ctx.now,
                    cfg,
                    state,
                    WarnType::FailedReadSmartErrorLog,
                    &format!("Device: {name}, Read SMART Error Log Failed"),
                )
                .await;
        } else if newcnt >= 0 {
            let oldcnt = state.persist.ata_error_count;
            if newcnt as u64 > oldcnt {
                let msg = format!(
                    "Device: {name}, ATA error count increased from {oldcnt} to {newcnt}"
                );
                error!("{msg}");
                ctx.warner
                    .warn_at(ctx.now, cfg, state, WarnType::ErrorCount, &msg)
                    .await;
                state.temp.must_write = true;
            }
            state.persist.ata_error_count = newcnt as u64;
        }
    }

    // Time for a scheduled self-test?
    if let Some(testtype) = pick_scheduled_test(cfg, state, ctx) {
        do_ata_selftest(cfg, state, dev, testtype);
    }

    // Don't leave the device open between cycles
    close_device(cfg, dev);
}

fn log_offline_status(name: &str, status: u8) {
    let auto_on = if status & 0x80 != 0 { " (auto:on)" } else { "" };
    match offline_status_text(status) {
        Some((msg, true)) => {
            error!("Device: {name}, offline data collection {msg}{auto_on}")
        }
        Some((msg, false)) => {
            info!("Device: {name}, offline data collection {msg}{auto_on}")
        }
        None => info!("Device: {name}, unknown offline data collection status 0x{status:02x}"),
    }
}

fn log_selftest_status(name: &str, status: u8) {
    match selftest_status_text(status) {
        Some((msg, true)) => error!("Device: {name}, previous self-test {msg}"),
        Some((msg, false)) => info!("Device: {name}, previous self-test {msg}"),
        None if selftest_in_progress(status) => info!(
            "Device: {name}, self-test in progress, {}0% remaining",
            status & 0x0f
        ),
        None => info!("Device: {name}, unknown self-test status 0x{status:02x}"),
    }
}

async fn check_scsi(
    cfg: &DevConfig,
    state: &mut DevState,
    dev: &mut dyn ScsiDevice,
    ctx: &CheckContext<'_>,
) {
    if !open_device(cfg, state, dev, "SCSI", ctx).await {
        return;
    }
    let name = cfg.name.clone();

    let mut currenttemp = 0;
    let mut triptemp = 0;
    if !state.temp.suppress_report {
        match dev.check_ie() {
            Err(_) => {
                info!("Device: {name}, failed to read SMART values");
                ctx.warner
                    .warn_at(
                        ctx.now,
                        cfg,
                        state,
                        WarnType::FailedReadSmartData,
                        &format!("Device: {name}, failed to read SMART values"),
                    )
                    .await;
                state.temp.suppress_report = true;
            }
            Ok(ie) => {
                currenttemp = ie.temperature;
                triptemp = ie.trip_temperature;
                if ie.asc > 0 {
                    match ie_string(ie.asc, ie.ascq) {
                        Some(text) => {
                            let msg = format!("Device: {name}, SMART Failure: {text}");
                            error!("{msg}");
                            ctx.warner
                                .warn_at(ctx.now, cfg, state, WarnType::Health, &msg)
                                .await;
                            state.temp.must_write = true;
                        }
                        None if ie.selftest_in_progress() => {
                            info!("Device: {name}, self-test in progress")
                        }
                        None => {
                            if ctx.debug {
                                info!(
                                    "Device: {name}, non-SMART asc,ascq: {},{}",
                                    ie.asc, ie.ascq
                                );
                            }
                        }
                    }
                } else if ctx.debug {
                    debug!("Device: {name}, SMART health: passed");
                }
            }
        }
    }

    if cfg.tempdiff != 0 || cfg.tempinfo != 0 || cfg.tempcrit != 0 {
        check_temperature(cfg, state, ctx.warner, ctx.now, currenttemp, triptemp).await;
    }

    if cfg.selftest {
        let result = dev
            .count_failed_selftests()
            .ok()
            .map(|(count, hour)| (count, u64::from(hour)));
        if result.is_none() {
            info!("Device: {name}, Read SMART Self Test Log Failed");
        }
        report_selftest_changes(cfg, state, ctx.warner, ctx.now, result).await;
    }

    if let Some(testtype) = pick_scheduled_test(cfg, state, ctx) {
        do_scsi_selftest(cfg, state, dev, testtype);
    }

    // Collect error counters for the attribute log
    if cfg.attrlog_file.is_some() {
        let mut counters = Vec::new();
        for kind in EcKind::ALL {
            let supported = match kind {
                EcKind::Read => state.temp.log_pages.read_ecounter,
                EcKind::Write => state.temp.log_pages.write_ecounter,
                EcKind::Verify => state.temp.log_pages.verify_ecounter,
            };
            if !supported {
                continue;
            }
            if let Ok(ec) = dev.error_counters(kind) {
                counters.push((kind, ec));
            }
        }
        let non_medium = if state.temp.log_pages.non_medium {
            dev.non_medium_errors().ok()
        } else {
            None
        };
        if currenttemp != 0 {
            state.temp.temperature = currenttemp;
        }
        let temperature = (state.temp.temperature != 0).then_some(state.temp.temperature);
        if !counters.is_empty() || non_medium.is_some() || temperature.is_some() {
            state.temp.attrlog = Some(AttrlogData::Scsi {
                counters,
                non_medium_errors: non_medium,
                temperature,
            });
        }
    }

    close_device(cfg, dev);
}

fn do_scsi_selftest(
    cfg: &DevConfig,
    state: &mut DevState,
    dev: &mut dyn ScsiDevice,
    testtype: char,
) {
    let name = &cfg.name;

    match dev.selftest_in_progress() {
        Ok(true) => {
            info!("Device: {name}, skip since Self-Test already in progress.");
            return;
        }
        Ok(false) => {}
        Err(_) => {
            error!("Device: {name}, does not support Self-Tests");
            state.temp.not_cap_short = true;
            state.temp.not_cap_long = true;
            return;
        }
    }

    let (testname, extended) = match testtype {
        'S' => ("Short Self", false),
        'L' => ("Long Self", true),
        _ => {
            error!("Device: {name}, not capable of {testtype} Self-Test");
            return;
        }
    };

    match dev.start_selftest(extended) {
        Ok(()) => {
            state.temp.selftest_started = true;
            info!("Device: {name}, starting scheduled {testname}-Test.");
        }
        Err(e) if e.is_capability() => {
            error!("Device: {name}, not capable of {testname}-Test");
            if testtype == 'L' {
                state.temp.not_cap_long = true;
            } else {
                state.temp.not_cap_short = true;
            }
        }
        Err(e) => error!("Device: {name}, execute {testname}-Test failed ({e})"),
    }
}

/// Log a change of one NVMe SMART/Health value.
async fn log_nvme_smart_change(
    cfg: &DevConfig,
    state: &mut DevState,
    warner: &Warner,
    now: i64,
    valname: &str,
    oldval: u64,
    newval: u64,
    critical: bool,
    informational: bool,
) {
    if newval == oldval || !(critical || informational) {
        return;
    }
    let msg = format!(
        "Device: {}, SMART/Health value: {valname} changed from {oldval} to {newval}",
        cfg.name
    );
    if critical {
        error!("{msg}");
        warner.warn_at(now, cfg, state, WarnType::Usage, &msg).await;
    } else {
        info!("{msg}");
    }
    state.temp.must_write = true;
}

/// Log NVMe self-test execution status changes.
fn log_nvme_selftest_status(
    name: &str,
    state: &mut DevState,
    firstpass: bool,
    debug: bool,
    log: &NvmeSelfTestLog,
) {
    let curr_op = log.current_operation & 0xf;
    let curr_compl = log.current_completion & 0x7f;

    if !(curr_op != state.temp.selftest_op
        || curr_compl != state.temp.selftest_compl
        || state.temp.selftest_started
        || (firstpass && (debug || curr_op != 0)))
    {
        return;
    }
    state.temp.selftest_op = curr_op;
    state.temp.selftest_compl = curr_compl;

    let first = &log.results[0];
    let op0 = first.operation();
    let res0 = first.result();
    let op_name = selftest_op_text(if curr_op != 0 { curr_op } else { op0 });

    if curr_op != 0 {
        info!(
            "Device: {name}, {op_name} self-test in progress, {}% remaining",
            100 - curr_compl
        );
    } else if op0 == 0 || res0 == 0xf {
        info!("Device: {name}, no self-test has ever been run");
    } else {
        let (text, critical) = selftest_result_text(res0);
        let ns = if first.nsid_valid() {
            format!(" of NSID 0x{:x}", first.nsid)
        } else {
            String::new()
        };
        if critical {
            error!("Device: {name}, previous {op_name} self-test{ns} {text}");
        } else {
            info!("Device: {name}, previous {op_name} self-test{ns} {text}");
        }
    }
}

/// Check the NVMe Error Information log for device related errors.
async fn check_nvme_error_log(
    cfg: &DevConfig,
    state: &mut DevState,
    dev: &mut dyn NvmeDevice,
    warner: &Warner,
    now: i64,
    mut newcnt: u64,
) {
    let name = &cfg.name;
    // One transfer page caps the read; low MDTS values choke on more
    let want = cfg.nvme_err_log_max_entries.min(64);
    let entries = match dev.error_log(want) {
        Ok(entries) => entries,
        Err(_) => {
            info!("Device: {name}, Read {want} entries from Error Information Log failed");
            warn_error_log_read_failed(cfg, state, warner, now).await;
            return;
        }
    };

    let oldcnt = state.persist.nvme_err_log_entries;
    let mut mincnt = newcnt;
    let mut device_errors = 0u32;
    let mut ignored = 0u32;
    for (i, entry) in entries.iter().enumerate() {
        if entry.error_count == 0 {
            continue; // unused slot
        }
        if entry.error_count <= oldcnt {
            break; // reached the previously seen entries
        }
        mincnt = mincnt.min(entry.error_count);
        newcnt = newcnt.max(entry.error_count);
        let status = entry.status();
        if !status_is_device_error(status) {
            ignored += 1;
            continue;
        }
        device_errors += 1;
        // Log the most recent 8 errors
        if device_errors <= 8 {
            info!(
                "Device: {name}, NVMe error [{i}], count {}, status 0x{:04x}: {}",
                entry.error_count,
                entry.status_field,
                status_text(status)
            );
        }
    }

    let unknown = if mincnt > oldcnt + 1 {
        mincnt - oldcnt - 1
    } else {
        0
    };
    let msg = format!(
        "Device: {name}, NVMe error count increased from {oldcnt} to {newcnt} ({device_errors} new, {ignored} ignored, {unknown} unknown)"
    );
    if device_errors == 0 {
        info!("{msg}");
    } else {
        error!("{msg}");
        warner.warn_at(now, cfg, state, WarnType::ErrorCount, &msg).await;
    }

    state.persist.nvme_err_log_entries = newcnt;
    state.temp.must_write = true;
}

async fn warn_error_log_read_failed(cfg: &DevConfig, state: &mut DevState, warner: &Warner, now: i64) {
    warner
        .warn_at(
            now,
            cfg,
            state,
            WarnType::FailedReadSmartErrorLog,
            &format!("Device: {}, Read SMART Error Log Failed", cfg.name),
        )
        .await;
}

async fn check_nvme(
    cfg: &DevConfig,
    state: &mut DevState,
    dev: &mut dyn NvmeDevice,
    ctx: &CheckContext<'_>,
) {
    if !open_device(cfg, state, dev, "NVMe", ctx).await {
        return;
    }
    let name = cfg.name.clone();

    let smart_log = match dev.smart_log() {
        Ok(log) => log,
        Err(_) => {
            close_device(cfg, dev);
            info!("Device: {name}, failed to read NVMe SMART/Health Information");
            ctx.warner
                .warn_at(
                    ctx.now,
                    cfg,
                    state,
                    WarnType::FailedReadSmartData,
                    &format!(
                        "Device: {name}, failed to read NVMe SMART/Health Information"
                    ),
                )
                .await;
            state.temp.must_write = true;
            return;
        }
    };

    // Critical Warning bits selected by -H MASK
    let warning = smart_log.critical_warning;
    if warning & cfg.smartcheck_nvme != 0 {
        let bits = format_critical_warning(warning, cfg.smartcheck_nvme);
        let msg = format!("Device: {name}, Critical Warning (0x{warning:02x}): {bits}");
        error!("{msg}");
        ctx.warner
            .warn_at(ctx.now, cfg, state, WarnType::Health, &msg)
            .await;
        state.temp.must_write = true;
    }

    // Value change tracking, names similar to inspection tool output
    if cfg.prefail {
        let critical = smart_log.available_spare < smart_log.spare_threshold
            && smart_log.spare_threshold <= 100; // 101-255: reserved
        log_nvme_smart_change(
            cfg,
            state,
            ctx.warner,
            ctx.now,
            "Available Spare",
            u64::from(state.persist.nvme_available_spare),
            u64::from(smart_log.available_spare),
            critical,
            true,
        )
        .await;
    }
    if cfg.usage || cfg.usagefailed {
        log_nvme_smart_change(
            cfg,
            state,
            ctx.warner,
            ctx.now,
            "Percentage Used",
            u64::from(state.persist.nvme_percentage_used),
            u64::from(smart_log.percentage_used),
            cfg.usagefailed && smart_log.percentage_used > 95,
            cfg.usage,
        )
        .await;

        let old_me = state.persist.nvme_media_errors;
        let new_me = smart_log.media_errors.to_u64();
        log_nvme_smart_change(
            cfg,
            state,
            ctx.warner,
            ctx.now,
            "Media and Data Integrity Errors",
            old_me,
            new_me,
            cfg.usagefailed && new_me > old_me,
            cfg.usage,
        )
        .await;
    }

    if cfg.tempdiff != 0 || cfg.tempinfo != 0 || cfg.tempcrit != 0 {
        let temp = smart_log.temperature_celsius().unwrap_or(0);
        check_temperature(cfg, state, ctx.warner, ctx.now, temp, 0).await;
    }

    let mut testtype = pick_scheduled_test(cfg, state, ctx);

    // The self-test log serves status logging, error counting and the
    // already-running check before a new test start
    let mut selftest_log = None;
    if testtype.is_some() || cfg.selftest || cfg.selfteststs {
        match dev.selftest_log() {
            Err(_) => {
                let msg = format!("Device: {name}, Read Self-test Log failed");
                error!("{msg}");
                ctx.warner
                    .warn_at(
                        ctx.now,
                        cfg,
                        state,
                        WarnType::FailedReadSmartSelfTestLog,
                        &msg,
                    )
                    .await;
                testtype = None;
            }
            Ok(log) => {
                ctx.warner.reset(
                    cfg,
                    state,
                    WarnType::FailedReadSmartSelfTestLog,
                    "Read Self-Test Log worked again",
                );
                if cfg.selfteststs {
                    log_nvme_selftest_status(&name, state, ctx.firstpass, ctx.debug, &log);
                }
                if cfg.selftest {
                    let (errcnt, hour) = log.count_errors(dev.nsid());
                    report_selftest_changes(cfg, state, ctx.warner, ctx.now, Some((errcnt, hour)))
                        .await;
                }
                selftest_log = Some(log);
            }
        }
    }
    state.temp.selftest_started = false;

    // Error Information log: warn only on device related errors
    if cfg.errorlog || cfg.xerrorlog {
        let newcnt = smart_log.num_err_log_entries.to_u64();
        if newcnt > state.persist.nvme_err_log_entries {
            check_nvme_error_log(cfg, state, dev, ctx.warner, ctx.now, newcnt).await;
        }
    }

    // Start a scheduled self-test
    if let Some(testtype) = testtype {
        let (testname, code) = match testtype {
            'L' => ("Extended", 2u8),
            _ => ("Short", 1u8),
        };
        let running = selftest_log.as_ref().is_some_and(NvmeSelfTestLog::in_progress);
        if running {
            info!(
                "Device: {name}, skip scheduled {testname} Self-Test; {}% remaining of current Self-Test.",
                selftest_log.as_ref().map_or(0, |l| 100 - l.percent_remaining())
            );
        } else if dev.start_selftest(code).is_err() {
            error!("Device: {name}, execute {testname} Self-Test failed.");
        } else {
            state.temp.selftest_started = true;
            info!("Device: {name}, starting scheduled {testname} Self-Test.");
        }
    }

    close_device(cfg, dev);

    // Preserve the new SMART/Health info for state file and attrlog
    state.persist.nvme_available_spare = smart_log.available_spare;
    state.persist.nvme_percentage_used = smart_log.percentage_used;
    state.persist.nvme_media_errors = smart_log.media_errors.to_u64();
    state.temp.attrlog = Some(AttrlogData::Nvme(smart_log));
}

/// Auto-standby suppression bookkeeping across all devices (`,ns`
/// suffixes of `-l offlinests` / `-l selfteststs`): while a monitored
/// test is running the system should not drop into standby. The OS hook
/// lives outside this crate, so transitions are reported here.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum StandbyDisable {
    #[default]
    NotUsed,
    NotDisabled,
    Disabled,
}

/// Evaluate the standby-disable state after a check pass.
pub fn standby_check(
    devices: &[MonitoredDevice],
    current: StandbyDisable,
) -> StandbyDisable {
    let used = devices
        .iter()
        .any(|m| m.cfg.offlinests_ns || m.cfg.selfteststs_ns);
    if !used {
        return StandbyDisable::NotUsed;
    }

    let running = devices.iter().any(|m| {
        let values = m.state.temp.smartval.as_ref();
        (m.cfg.offlinests_ns
            && (m.state.temp.offline_started
                || values.is_some_and(|v| {
                    diskwatch_device::ata::offline_in_progress(v.offline_collection_status)
                })))
            || (m.cfg.selfteststs_ns
                && (m.state.temp.selftest_started
                    || values.is_some_and(|v| selftest_in_progress(v.selftest_exec_status))))
    });

    if running {
        if current != StandbyDisable::Disabled {
            info!("Self-test(s) in progress, system auto standby disabled");
        }
        StandbyDisable::Disabled
    } else {
        if current == StandbyDisable::Disabled {
            info!("Self-test(s) completed, system auto standby enabled");
        }
        StandbyDisable::NotDisabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config_text;
    use chrono::TimeZone;
    use crate::registrar::{register_devices, NullNotifier, RegistrarOptions};
    use crate::state::ThrottleRecord;
    use diskwatch_device::ata::{AtaIdentity, SmartThresholds};
    use diskwatch_device::mock::{
        AtaHandle, AtaScript, MockAta, MockFactory, MockNvme, NvmeHandle, NvmeScript,
    };
    use diskwatch_device::nvme::{Le128, NvmeIdentity, NvmeSmartLog};
    use diskwatch_device::HealthStatus;

    const NOW: i64 = 1_700_000_000;

    fn warner() -> Warner {
        // Always-present, silent executable: attempts count as dispatch
        Warner::new("/bin/true")
    }

    fn ctx<'a>(warner: &'a Warner) -> CheckContext<'a> {
        CheckContext {
            warner,
            firstpass: false,
            allow_selftests: true,
            debug: false,
            now: NOW,
        }
    }

    fn ata_values(attrs: &[(u8, u16, u8, u64)]) -> SmartValues {
        let mut values = SmartValues::default();
        for (i, (id, flags, current, raw)) in attrs.iter().enumerate() {
            values.attrs[i] = SmartAttr {
                id: *id,
                flags: *flags,
                current: *current,
                worst: *current,
                raw: [
                    *raw as u8,
                    (*raw >> 8) as u8,
                    (*raw >> 16) as u8,
                    (*raw >> 24) as u8,
                    (*raw >> 32) as u8,
                    (*raw >> 40) as u8,
                ],
                reserved: 0,
            };
        }
        values.offline_collection_capability = 0x7f;
        values.errorlog_capability = 0x01;
        values
    }

    fn thresholds(entries: &[(u8, u8)]) -> SmartThresholds {
        let mut thresholds = SmartThresholds::default();
        for (i, entry) in entries.iter().enumerate() {
            thresholds.entries[i] = *entry;
        }
        thresholds
    }

    fn ata_monitored(config_line: &str, script: AtaScript) -> (MonitoredDevice, AtaHandle) {
        let (dev, handle) = MockAta::new(script);
        let factory = MockFactory::new();
        factory.add("/dev/sda", AnyDevice::Ata(Box::new(dev)));
        let parse = parse_config_text(config_line, "t.conf").unwrap();
        let opts = RegistrarOptions {
            state_prefix: None,
            attrlog_prefix: None,
            quit_never: false,
        };
        let mut devices = register_devices(parse, &factory, &opts, &NullNotifier).unwrap();
        assert_eq!(devices.len(), 1);
        (devices.remove(0), handle)
    }

    fn base_ata_script() -> AtaScript {
        AtaScript {
            identity: Some(AtaIdentity {
                model: "TESTDISK".into(),
                serial: "S1".into(),
                firmware: "1.0".into(),
                capacity: 1_000_000_000_000,
                sectors: 1_953_525_168,
                smart_supported: true,
                smart_enabled: true,
                ..Default::default()
            }),
            health: Some(HealthStatus::Passed),
            values: Some(ata_values(&[
                (5, 0x0033, 100, 0),
                (197, 0x0032, 100, 0),
                (198, 0x0030, 100, 0),
            ])),
            thresholds: Some(thresholds(&[(5, 36), (197, 0), (198, 0)])),
            selftest_log: Some(Default::default()),
            error_count: Some(0),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_attribute_degradation_informational() {
        let (mut monitored, handle) =
            ata_monitored("/dev/sda -H -t -m root@host -M daily\n", base_ata_script());
        let warner = warner();

        // No change: nothing dispatched, snapshot unchanged
        check_device(&mut monitored, &ctx(&warner)).await;
        assert_eq!(
            monitored.state.persist.mail[WarnType::Usage.index()].count,
            0
        );

        // Attribute 5 drops 100 -> 99: tracked change, informational
        handle.borrow_mut().values = Some(ata_values(&[
            (5, 0x0033, 99, 0),
            (197, 0x0032, 100, 0),
            (198, 0x0030, 100, 0),
        ]));
        check_device(&mut monitored, &ctx(&warner)).await;
        assert_eq!(monitored.state.persist.ata_attributes[0].val, 99);
        assert!(monitored.state.temp.must_write);
        // Without -r!, no warning dispatch
        assert_eq!(
            monitored.state.persist.mail[WarnType::Usage.index()].count,
            0
        );
    }

    #[tokio::test]
    async fn test_attribute_degradation_critical_with_flag() {
        let (mut monitored, handle) = ata_monitored(
            "/dev/sda -H -t -r 5! -m root@host -M always\n",
            base_ata_script(),
        );
        let warner = warner();
        check_device(&mut monitored, &ctx(&warner)).await;

        handle.borrow_mut().values = Some(ata_values(&[
            (5, 0x0033, 99, 0),
            (197, 0x0032, 100, 0),
            (198, 0x0030, 100, 0),
        ]));
        check_device(&mut monitored, &ctx(&warner)).await;
        assert_eq!(
            monitored.state.persist.mail[WarnType::Usage.index()].count,
            1
        );
    }

    #[tokio::test]
    async fn test_pending_sectors_increase_only() {
        let (mut monitored, handle) = ata_monitored(
            "/dev/sda -H -t -C 197+ -m root@host -M always\n",
            base_ata_script(),
        );
        let warner = warner();
        check_device(&mut monitored, &ctx(&warner)).await;
        assert_eq!(
            monitored.state.persist.mail[WarnType::CurrentPendingSector.index()].count,
            0
        );

        // Raw value rises 0 -> 3: critical warning
        handle.borrow_mut().values = Some(ata_values(&[
            (5, 0x0033, 100, 0),
            (197, 0x0032, 100, 3),
            (198, 0x0030, 100, 0),
        ]));
        check_device(&mut monitored, &ctx(&warner)).await;
        assert_eq!(
            monitored.state.persist.mail[WarnType::CurrentPendingSector.index()].count,
            1
        );

        // Same count next cycle: with '+' only increases warn
        check_device(&mut monitored, &ctx(&warner)).await;
        assert_eq!(
            monitored.state.persist.mail[WarnType::CurrentPendingSector.index()].count,
            1
        );

        // Back to zero: throttle record reset
        handle.borrow_mut().values = Some(ata_values(&[
            (5, 0x0033, 100, 0),
            (197, 0x0032, 100, 0),
            (198, 0x0030, 100, 0),
        ]));
        check_device(&mut monitored, &ctx(&warner)).await;
        assert_eq!(
            monitored.state.persist.mail[WarnType::CurrentPendingSector.index()],
            ThrottleRecord::default()
        );
    }

    #[tokio::test]
    async fn test_failed_health_check_dispatches() {
        let (mut monitored, handle) =
            ata_monitored("/dev/sda -H -m root@host -M always\n", base_ata_script());
        let warner = warner();

        handle.borrow_mut().health = Some(HealthStatus::Failed);
        check_device(&mut monitored, &ctx(&warner)).await;
        assert_eq!(
            monitored.state.persist.mail[WarnType::Health.index()].count,
            1
        );
    }

    #[tokio::test]
    async fn test_temperature_critical_and_recovery() {
        let mut script = base_ata_script();
        script.values = Some(ata_values(&[(194, 0x0022, 64, 62)]));
        script.thresholds = Some(thresholds(&[(194, 0)]));
        let (mut monitored, handle) = ata_monitored(
            "/dev/sda -H -W 0,0,60 -m root@host -M always\n",
            script,
        );
        let warner = warner();

        // 62 >= 60: critical warning
        check_device(&mut monitored, &ctx(&warner)).await;
        assert_eq!(
            monitored.state.persist.mail[WarnType::Temperature.index()].count,
            1
        );
        assert_eq!(monitored.state.persist.tempmax, 62);

        // Drop to 54 (< 60 - 5 = 55): informational recovery + reset
        handle.borrow_mut().values = Some(ata_values(&[(194, 0x0022, 64, 54)]));
        check_device(&mut monitored, &ctx(&warner)).await;
        assert_eq!(
            monitored.state.persist.mail[WarnType::Temperature.index()],
            ThrottleRecord::default()
        );
        // Max is retained
        assert_eq!(monitored.state.persist.tempmax, 62);
    }

    #[tokio::test]
    async fn test_tempmin_grace_interval() {
        let mut script = base_ata_script();
        script.values = Some(ata_values(&[(194, 0x0022, 64, 30)]));
        script.thresholds = Some(thresholds(&[(194, 0)]));
        let (mut monitored, handle) =
            ata_monitored("/dev/sda -H -W 1,0,0\n", script);
        let warner = warner();
        let context = ctx(&warner);

        // First reading arms the grace delay; the minimum stays unset
        check_device(&mut monitored, &context).await;
        assert_eq!(monitored.state.persist.tempmin, 0);
        assert!(monitored.state.temp.tempmin_delay > NOW);

        // Within the grace period a lower reading does not latch
        handle.borrow_mut().values = Some(ata_values(&[(194, 0x0022, 64, 28)]));
        check_device(&mut monitored, &context).await;
        assert_eq!(monitored.state.persist.tempmin, 0);

        // After the grace period the minimum narrows
        let late = CheckContext {
            now: NOW + i64::from(DEFAULT_CHECK_INTERVAL) + 120,
            ..ctx(&warner)
        };
        check_device(&mut monitored, &late).await;
        assert_eq!(monitored.state.persist.tempmin, 28);

        // And never widens
        handle.borrow_mut().values = Some(ata_values(&[(194, 0x0022, 64, 35)]));
        check_device(&mut monitored, &late).await;
        assert_eq!(monitored.state.persist.tempmin, 28);
        assert_eq!(monitored.state.persist.tempmax, 35);
    }

    #[tokio::test]
    async fn test_selftest_log_error_increase() {
        let (mut monitored, handle) = ata_monitored(
            "/dev/sda -H -l selftest -m root@host -M always\n",
            base_ata_script(),
        );
        let warner = warner();
        check_device(&mut monitored, &ctx(&warner)).await;

        // Inject a failed short test at hour 500
        let mut log = diskwatch_device::ata::SelfTestLog {
            most_recent: 1,
            ..Default::default()
        };
        log.entries[0] = diskwatch_device::ata::SelfTestEntry {
            number: 0x01,
            status: 0x70,
            hour: 500,
            checkpoint: 0,
            first_fail_lba: 0,
        };
        handle.borrow_mut().selftest_log = Some(log);
        check_device(&mut monitored, &ctx(&warner)).await;
        assert_eq!(monitored.state.persist.selftest_errors, 1);
        assert_eq!(monitored.state.persist.selftest_last_err_hour, 500);
        assert_eq!(
            monitored.state.persist.mail[WarnType::SelfTest.index()].count,
            1
        );
    }

    #[tokio::test]
    async fn test_ata_error_count_increase() {
        let (mut monitored, handle) = ata_monitored(
            "/dev/sda -H -l error -m root@host -M always\n",
            base_ata_script(),
        );
        let warner = warner();
        check_device(&mut monitored, &ctx(&warner)).await;
        assert_eq!(
            monitored.state.persist.mail[WarnType::ErrorCount.index()].count,
            0
        );

        handle.borrow_mut().error_count = Some(4);
        check_device(&mut monitored, &ctx(&warner)).await;
        assert_eq!(monitored.state.persist.ata_error_count, 4);
        assert_eq!(
            monitored.state.persist.mail[WarnType::ErrorCount.index()].count,
            1
        );
    }

    #[tokio::test]
    async fn test_power_mode_skip_and_cap() {
        let mut script = base_ata_script();
        script.power_mode = Some(PowerMode::Standby);
        let (mut monitored, handle) =
            ata_monitored("/dev/sda -H -n standby,2\n", script);
        let warner = warner();

        // Two skips allowed
        check_device(&mut monitored, &ctx(&warner)).await;
        check_device(&mut monitored, &ctx(&warner)).await;
        assert_eq!(monitored.state.temp.powerskipcnt, 2);
        assert!(monitored.state.temp.attrlog.is_none());

        // Cap reached: the check proceeds and the counter resets
        check_device(&mut monitored, &ctx(&warner)).await;
        assert_eq!(monitored.state.temp.powerskipcnt, 0);
        assert!(monitored.state.temp.attrlog.is_some());

        // Device active again: normal checking resumes
        handle.borrow_mut().power_mode = Some(PowerMode::Active);
        monitored.state.temp.attrlog = None;
        check_device(&mut monitored, &ctx(&warner)).await;
        assert!(monitored.state.temp.attrlog.is_some());
    }

    #[tokio::test]
    async fn test_scheduled_selftest_started() {
        // Sunday 2025-08-03, 02:10 local
        let now = chrono::Local
            .with_ymd_and_hms(2025, 8, 3, 2, 10, 0)
            .unwrap()
            .timestamp();
        let (mut monitored, handle) =
            ata_monitored("/dev/sda -H -s L/../../7/02\n", base_ata_script());
        monitored.state.persist.scheduled_test_next_check = now - 3600;
        let warner = warner();
        let context = CheckContext {
            now,
            ..ctx(&warner)
        };
        check_device(&mut monitored, &context).await;
        assert_eq!(handle.borrow().started_tests, vec![AtaTest::Extended]);

        // The same hour does not double-start: watermark advanced
        check_device(&mut monitored, &context).await;
        assert_eq!(handle.borrow().started_tests.len(), 1);
    }

    #[tokio::test]
    async fn test_selftest_not_started_while_running() {
        let mut script = base_ata_script();
        let mut values = ata_values(&[(5, 0x0033, 100, 0)]);
        values.selftest_exec_status = 0xf5; // in progress, 50% remaining
        script.values = Some(values);
        let now = chrono::Local
            .with_ymd_and_hms(2025, 8, 3, 2, 10, 0)
            .unwrap()
            .timestamp();
        let (mut monitored, handle) =
            ata_monitored("/dev/sda -H -s L/../../7/02\n", script);
        monitored.state.persist.scheduled_test_next_check = now - 3600;
        let warner = warner();
        let context = CheckContext {
            now,
            ..ctx(&warner)
        };
        check_device(&mut monitored, &context).await;
        assert!(handle.borrow().started_tests.is_empty());
    }

    #[tokio::test]
    async fn test_removable_device_absence() {
        let (mut monitored, handle) =
            ata_monitored("/dev/sda -H -d removable -m root@host -M always\n", base_ata_script());
        let warner = warner();

        handle.borrow_mut().open_fails = true;
        check_device(&mut monitored, &ctx(&warner)).await;
        assert!(monitored.state.temp.removed);
        // Removable: no FailedOpenDevice warning
        assert_eq!(
            monitored.state.persist.mail[WarnType::FailedOpenDevice.index()].count,
            0
        );

        handle.borrow_mut().open_fails = false;
        check_device(&mut monitored, &ctx(&warner)).await;
        assert!(!monitored.state.temp.removed);
    }

    #[tokio::test]
    async fn test_open_failure_warns_for_fixed_device() {
        let (mut monitored, handle) =
            ata_monitored("/dev/sda -H -m root@host -M always\n", base_ata_script());
        let warner = warner();

        handle.borrow_mut().open_fails = true;
        check_device(&mut monitored, &ctx(&warner)).await;
        assert_eq!(
            monitored.state.persist.mail[WarnType::FailedOpenDevice.index()].count,
            1
        );

        // Recovery clears the record
        handle.borrow_mut().open_fails = false;
        check_device(&mut monitored, &ctx(&warner)).await;
        assert_eq!(
            monitored.state.persist.mail[WarnType::FailedOpenDevice.index()].count,
            0
        );
    }

    #[tokio::test]
    async fn test_reload_preserves_throttle() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = format!("{}/", dir.path().display());
        let opts = RegistrarOptions {
            state_prefix: Some(prefix.clone()),
            attrlog_prefix: None,
            quit_never: false,
        };

        let register = |factory: &MockFactory| {
            let parse = parse_config_text(
                "/dev/sda -H -f -t -m root@host -M daily\n",
                "t.conf",
            )
            .unwrap();
            register_devices(parse, factory, &opts, &NullNotifier).unwrap()
        };

        // A usage attribute below threshold fails on every cycle
        let failing = || {
            let mut script = base_ata_script();
            script.values = Some(ata_values(&[(5, 0x0032, 20, 0)]));
            script.thresholds = Some(thresholds(&[(5, 36)]));
            script
        };

        let factory = MockFactory::new();
        let (dev, _h) = MockAta::new(failing());
        factory.add("/dev/sda", AnyDevice::Ata(Box::new(dev)));
        let mut devices = register(&factory);
        let warner = warner();
        check_device(&mut devices[0], &ctx(&warner)).await;
        assert_eq!(
            devices[0].state.persist.mail[WarnType::Usage.index()].count,
            1
        );

        // Flush state, tear down, re-register (as a SIGHUP reload does)
        crate::state::write_state(
            devices[0].cfg.state_file.as_ref().unwrap(),
            &devices[0].state.persist,
        )
        .unwrap();
        drop(devices);

        let factory = MockFactory::new();
        let (dev, _h) = MockAta::new(failing());
        factory.add("/dev/sda", AnyDevice::Ata(Box::new(dev)));
        let mut devices = register(&factory);
        assert_eq!(
            devices[0].state.persist.mail[WarnType::Usage.index()].count,
            1
        );

        // Same condition within 24h: `daily` suppresses the dispatch
        check_device(&mut devices[0], &ctx(&warner)).await;
        assert_eq!(
            devices[0].state.persist.mail[WarnType::Usage.index()].count,
            1
        );
    }

    fn nvme_monitored(config_line: &str, script: NvmeScript) -> (MonitoredDevice, NvmeHandle) {
        let (dev, handle) = MockNvme::new(script);
        let factory = MockFactory::new();
        factory.add("/dev/nvme0n1", AnyDevice::Nvme(Box::new(dev)));
        let parse = parse_config_text(config_line, "t.conf").unwrap();
        let opts = RegistrarOptions {
            state_prefix: None,
            attrlog_prefix: None,
            quit_never: false,
        };
        let mut devices = register_devices(parse, &factory, &opts, &NullNotifier).unwrap();
        assert_eq!(devices.len(), 1);
        (devices.remove(0), handle)
    }

    fn base_nvme_script() -> NvmeScript {
        NvmeScript {
            identity: Some(NvmeIdentity {
                model: "NVMe Disk".into(),
                serial: "N1".into(),
                firmware: "1".into(),
                num_namespaces: 1,
                error_log_entries: 63,
                selftest_capable: true,
                ..Default::default()
            }),
            nsid: 1,
            smart_log: Some(NvmeSmartLog {
                temperature_kelvin: 310,
                available_spare: 100,
                spare_threshold: 10,
                ..Default::default()
            }),
            error_log: Some(Vec::new()),
            selftest_log: Some(Default::default()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_nvme_critical_warning_mask() {
        let (mut monitored, handle) = nvme_monitored(
            "/dev/nvme0n1 -H 0x01 -m root@host -M always\n",
            base_nvme_script(),
        );
        let warner = warner();

        // Unmasked bit alone (Temperature, bit 1): no warning
        handle.borrow_mut().smart_log = Some(NvmeSmartLog {
            critical_warning: 0x02,
            temperature_kelvin: 310,
            available_spare: 100,
            spare_threshold: 10,
            ..Default::default()
        });
        check_device(&mut monitored, &ctx(&warner)).await;
        assert_eq!(
            monitored.state.persist.mail[WarnType::Health.index()].count,
            0
        );

        // Masked bit set (LowSpare): critical warning
        handle.borrow_mut().smart_log = Some(NvmeSmartLog {
            critical_warning: 0x03,
            temperature_kelvin: 310,
            available_spare: 100,
            spare_threshold: 10,
            ..Default::default()
        });
        check_device(&mut monitored, &ctx(&warner)).await;
        assert_eq!(
            monitored.state.persist.mail[WarnType::Health.index()].count,
            1
        );
    }

    #[tokio::test]
    async fn test_nvme_error_log_device_related() {
        let (mut monitored, handle) = nvme_monitored(
            "/dev/nvme0n1 -H -l error -m root@host -M always\n",
            base_nvme_script(),
        );
        let warner = warner();
        check_device(&mut monitored, &ctx(&warner)).await;

        // Two new entries: one unrecovered read error (device related),
        // one invalid field (ignored)
        let mut smart_log = base_nvme_script().smart_log.unwrap();
        smart_log.num_err_log_entries = Le128::from(2);
        let entries = vec![
            diskwatch_device::nvme::NvmeErrorEntry {
                error_count: 2,
                status_field: 0x281 << 1,
                ..Default::default()
            },
            diskwatch_device::nvme::NvmeErrorEntry {
                error_count: 1,
                status_field: 0x002 << 1,
                ..Default::default()
            },
        ];
        {
            let mut script = handle.borrow_mut();
            script.smart_log = Some(smart_log);
            script.error_log = Some(entries);
        }
        check_device(&mut monitored, &ctx(&warner)).await;
        assert_eq!(monitored.state.persist.nvme_err_log_entries, 2);
        assert_eq!(
            monitored.state.persist.mail[WarnType::ErrorCount.index()].count,
            1
        );
    }

    #[tokio::test]
    async fn test_nvme_transport_errors_only_no_warning() {
        let (mut monitored, handle) = nvme_monitored(
            "/dev/nvme0n1 -H -l error -m root@host -M always\n",
            base_nvme_script(),
        );
        let warner = warner();
        check_device(&mut monitored, &ctx(&warner)).await;

        let mut smart_log = base_nvme_script().smart_log.unwrap();
        smart_log.num_err_log_entries = Le128::from(1);
        {
            let mut script = handle.borrow_mut();
            script.smart_log = Some(smart_log);
            script.error_log = Some(vec![diskwatch_device::nvme::NvmeErrorEntry {
                error_count: 1,
                status_field: 0x002 << 1, // invalid field
                ..Default::default()
            }]);
        }
        check_device(&mut monitored, &ctx(&warner)).await;
        // Count advances, but no warning for non-device errors
        assert_eq!(monitored.state.persist.nvme_err_log_entries, 1);
        assert_eq!(
            monitored.state.persist.mail[WarnType::ErrorCount.index()].count,
            0
        );
    }

    #[tokio::test]
    async fn test_standby_check_transitions() {
        let (mut monitored, _handle) = ata_monitored(
            "/dev/sda -H -t -l selfteststs,ns\n",
            base_ata_script(),
        );
        let warner = warner();
        check_device(&mut monitored, &ctx(&warner)).await;

        let devices = vec![monitored];
        // No test running
        assert_eq!(
            standby_check(&devices, StandbyDisable::NotUsed),
            StandbyDisable::NotDisabled
        );

        // Mark a started test
        let mut devices = devices;
        devices[0].state.temp.selftest_started = true;
        assert_eq!(
            standby_check(&devices, StandbyDisable::NotDisabled),
            StandbyDisable::Disabled
        );
        devices[0].state.temp.selftest_started = false;
        assert_eq!(
            standby_check(&devices, StandbyDisable::Disabled),
            StandbyDisable::NotDisabled
        );
    }
}
