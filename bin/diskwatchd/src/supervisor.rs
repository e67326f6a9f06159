//! Supervisor loop
//!
//! The single cooperative loop of the daemon: (re)load configuration,
//! register devices, run check cycles, flush state and attribute logs,
//! compute the next wakeup and sleep on it while listening for signals.
//! Signal handlers only feed streams that are polled at sleep
//! boundaries; devices are checked strictly sequentially.

use chrono::{Local, TimeZone, Utc};
use diskwatch_common::{Error, Protocol};
use diskwatch_device::DeviceFactory;
use diskwatch_monitor::scheduler::{next_scheduled_test, ScheduleInput, TestCaps};
use diskwatch_monitor::{
    append_attrlog, check_device, parse_config_text, register_devices, standby_check,
    write_state, CheckContext, ConfigParse, MonitoredDevice, Notifier, NullNotifier,
    RegistrarOptions, StandbyDisable, Warner,
};
use std::io::Read;
use std::path::PathBuf;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::time::{sleep, Duration};
use tracing::{error, info};

// Exit codes
pub const EXIT_BADCMD: i32 = 1; // command line did not parse
pub const EXIT_BADCONF: i32 = 2; // syntax error in config file
pub const EXIT_PID: i32 = 4; // problem creating pid file
pub const EXIT_NOCONF: i32 = 5; // config file does not exist
pub const EXIT_READCONF: i32 = 6; // config file exists but cannot be read
pub const EXIT_BADDEV: i32 = 16; // a listed device cannot be monitored
pub const EXIT_NODEV: i32 = 17; // no devices to monitor
pub const EXIT_SIGNAL: i32 = 254; // abort on signal

/// When should the daemon exit?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuitPolicy {
    NoDev,
    NoDevStartup,
    Never,
    OneCheck,
    ShowTests,
    Errors,
}

/// Parse a `-q` argument; the second value is the `nodev0` modifier.
pub fn parse_quit(arg: &str) -> Option<(QuitPolicy, bool)> {
    match arg {
        "nodev" => Some((QuitPolicy::NoDev, false)),
        "nodev0" => Some((QuitPolicy::NoDev, true)),
        "nodevstartup" => Some((QuitPolicy::NoDevStartup, false)),
        "nodev0startup" => Some((QuitPolicy::NoDevStartup, true)),
        "errors" => Some((QuitPolicy::Errors, false)),
        "errors,nodev0" => Some((QuitPolicy::Errors, true)),
        "never" => Some((QuitPolicy::Never, false)),
        "onecheck" => Some((QuitPolicy::OneCheck, false)),
        "showtests" => Some((QuitPolicy::ShowTests, false)),
        _ => None,
    }
}

/// Where the configuration comes from.
pub enum ConfigSource {
    /// Default path; a missing file falls back to `DEVICESCAN -a`.
    DefaultFile(PathBuf),
    /// User-specified path; a missing file is fatal.
    File(PathBuf),
    Stdin,
}

pub struct Options {
    pub config: ConfigSource,
    pub state_prefix: Option<String>,
    pub attrlog_prefix: Option<String>,
    pub interval: u32,
    pub debug: bool,
    pub pid_file: Option<PathBuf>,
    pub quit: QuitPolicy,
    pub quit_nodev0: bool,
    pub warn_script: PathBuf,
    pub warn_as: Option<(u32, u32)>,
}

/// Next multiple of the check interval after `wakeuptime`.
fn calc_next_wakeuptime(wakeuptime: i64, timenow: i64, interval: i64) -> i64 {
    if timenow < wakeuptime {
        wakeuptime
    } else {
        timenow + interval - (timenow - wakeuptime) % interval
    }
}

/// Read the configuration, classifying failures into exit codes.
fn load_config(source: &ConfigSource) -> Result<ConfigParse, i32> {
    let (text, name) = match source {
        ConfigSource::Stdin => {
            let mut text = String::new();
            if std::io::stdin().read_to_string(&mut text).is_err() {
                error!("Unable to read configuration from stdin");
                return Err(EXIT_READCONF);
            }
            (text, "<stdin>".to_string())
        }
        ConfigSource::DefaultFile(path) | ConfigSource::File(path) => {
            match std::fs::read_to_string(path) {
                Ok(text) => {
                    info!("Opened configuration file {}", path.display());
                    (text, path.to_string_lossy().to_string())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if matches!(source, ConfigSource::File(_)) {
                        error!("Unable to open configuration file {}", path.display());
                        return Err(EXIT_NOCONF);
                    }
                    info!(
                        "No configuration file {} found, scanning devices",
                        path.display()
                    );
                    ("DEVICESCAN -a".to_string(), path.to_string_lossy().to_string())
                }
                Err(e) => {
                    error!("{e}: Unable to read configuration file {}", path.display());
                    return Err(EXIT_READCONF);
                }
            }
        }
    };

    match parse_config_text(&text, &name) {
        Ok(parse) => {
            info!("Configuration file {name} parsed.");
            Ok(parse)
        }
        Err(e) => {
            error!("{e}");
            error!("Configuration file {name} has fatal syntax errors.");
            Err(EXIT_BADCONF)
        }
    }
}

fn write_all_states(devices: &mut [MonitoredDevice], write_always: bool, debug: bool) {
    for monitored in devices.iter_mut() {
        let Some(path) = &monitored.cfg.state_file else {
            continue;
        };
        if !write_always && !monitored.state.temp.must_write {
            continue;
        }
        if let Err(e) = write_state(path, &monitored.state.persist) {
            error!("Cannot create state file {}: {e}", path.display());
            continue;
        }
        monitored.state.temp.must_write = false;
        if write_always || debug {
            info!(
                "Device: {}, state written to {}",
                monitored.cfg.name,
                path.display()
            );
        }
    }
}

fn write_all_attrlogs(devices: &mut [MonitoredDevice], debug: bool) {
    for monitored in devices.iter_mut() {
        let Some(path) = &monitored.cfg.attrlog_file else {
            monitored.state.temp.attrlog = None;
            continue;
        };
        let Some(data) = monitored.state.temp.attrlog.take() else {
            continue;
        };
        if let Err(e) = append_attrlog(path, Local::now(), &data) {
            error!("Cannot create attribute log file {}: {e}", path.display());
            continue;
        }
        if debug {
            info!(
                "Device: {}, attribute log written to {}",
                monitored.cfg.name,
                path.display()
            );
        }
    }
}

/// Print the forecast of scheduled self-tests over the next 90 days,
/// at most 5 of each type per device.
fn print_test_schedule(devices: &mut [MonitoredDevice], interval: u32) {
    const TEST_TYPE_CHARS: [char; 7] = ['L', 'n', 'c', 'r', 'S', 'C', 'O'];
    if devices.is_empty() {
        return;
    }
    info!("Next scheduled self tests (at most 5 of each type per device):");

    let now = Utc::now().timestamp();
    let mut counts = vec![[0u32; 7]; devices.len()];
    let mut seconds = i64::from(interval);
    while seconds < 3600 * 24 * 90 {
        let testtime = now + seconds;
        for (i, monitored) in devices.iter_mut().enumerate() {
            let Some(regex) = &monitored.cfg.test_regex else {
                continue;
            };
            let input = ScheduleInput {
                regex,
                offset_factor: monitored.cfg.test_offset_factor,
                caps: TestCaps {
                    offline: !monitored.state.temp.not_cap_offline,
                    short: !monitored.state.temp.not_cap_short,
                    long: !monitored.state.temp.not_cap_long,
                    conveyance: !monitored.state.temp.not_cap_conveyance,
                    selective: !monitored.state.temp.not_cap_selective,
                },
            };
            let watermark = &mut monitored.state.persist.scheduled_test_next_check;
            if let Some(test_char) =
                next_scheduled_test(&monitored.cfg.name, &input, watermark, testtime, true)
            {
                let idx = TEST_TYPE_CHARS.iter().position(|c| *c == test_char).unwrap();
                counts[i][idx] += 1;
                if counts[i][idx] <= 5 {
                    let when = Local
                        .timestamp_opt(testtime, 0)
                        .single()
                        .map(|t| t.format("%a %b %e %H:%M:%S %Y %Z").to_string())
                        .unwrap_or_default();
                    info!(
                        "Device: {}, will do test {} of type {test_char} at {when}",
                        monitored.cfg.name, counts[i][idx]
                    );
                }
            }
        }
        seconds += i64::from(interval);
    }

    info!("Totals [next 90 days]:");
    for (i, monitored) in devices.iter().enumerate() {
        let is_ata = monitored.dev.protocol() == Protocol::Ata;
        for (t, test_char) in TEST_TYPE_CHARS.iter().enumerate() {
            let cnt = counts[i][t];
            let relevant = if is_ata {
                "LncrSCO".contains(*test_char)
            } else {
                matches!(test_char, 'L' | 'S')
            };
            if cnt == 0 && !relevant {
                continue;
            }
            info!(
                "Device: {}, will do {cnt:3} test{} of type {test_char}",
                monitored.cfg.name,
                if cnt == 1 { "" } else { "s" }
            );
        }
    }
}

struct Signals {
    hup: Signal,
    term: Signal,
    quit: Signal,
    int: Signal,
    usr1: Signal,
    usr2: Signal,
}

impl Signals {
    fn install() -> std::io::Result<Self> {
        Ok(Signals {
            hup: signal(SignalKind::hangup())?,
            term: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
            int: signal(SignalKind::interrupt())?,
            usr1: signal(SignalKind::user_defined1())?,
            usr2: signal(SignalKind::user_defined2())?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Timer,
    /// USR1: check now, no device skipped.
    CheckNow,
    /// HUP (or INT in debug mode): reload the configuration.
    Reload,
    /// Graceful exit on the given signal number.
    Exit(i32),
}

pub struct Supervisor<'a> {
    opts: Options,
    factory: &'a dyn DeviceFactory,
    /// Service-manager integration point; the default does nothing.
    notifier: Box<dyn Notifier>,
    warner: Warner,
    devices: Vec<MonitoredDevice>,
    checktime_min: i64,
    standby: StandbyDisable,
    pid_written: bool,
}

impl<'a> Supervisor<'a> {
    pub fn new(opts: Options, factory: &'a dyn DeviceFactory) -> Self {
        let mut warner = Warner::new(&opts.warn_script);
        if let Some((uid, gid)) = opts.warn_as {
            warner = warner.run_as(uid, gid);
        }
        Supervisor {
            opts,
            factory,
            notifier: Box::new(NullNotifier),
            warner,
            devices: Vec::new(),
            checktime_min: 0,
            standby: StandbyDisable::NotUsed,
            pid_written: false,
        }
    }

    fn registrar_options(&self) -> RegistrarOptions {
        RegistrarOptions {
            state_prefix: self.opts.state_prefix.clone(),
            attrlog_prefix: self.opts.attrlog_prefix.clone(),
            quit_never: self.opts.quit == QuitPolicy::Never,
        }
    }

    /// (Re)load the configuration and rebuild the enrolled set.
    /// Returns an exit status on fatal errors.
    fn reconfigure(&mut self, firstpass: bool) -> Result<(), i32> {
        if !firstpass {
            // Persisted history survives the reload through state files
            write_all_states(&mut self.devices, true, self.opts.debug);
        }

        let parse = match load_config(&self.opts.config) {
            Ok(parse) => parse,
            Err(exit_status) => {
                // Configuration errors found on reload leave the
                // previous configuration in force, except under the
                // `errors` quit policy
                let tolerate = self.opts.quit == QuitPolicy::Never
                    || (!firstpass
                        && matches!(self.opts.quit, QuitPolicy::NoDev | QuitPolicy::NoDevStartup));
                if tolerate {
                    if !firstpass {
                        info!("Reusing previous configuration");
                        return Ok(());
                    }
                    // `-q never` at startup: run with no devices
                    self.devices = Vec::new();
                    return Ok(());
                }
                return Err(exit_status);
            }
        };

        self.notifier
            .status(if firstpass { "Initializing ..." } else { "Reloading ..." });
        let enrolled = match register_devices(
            parse,
            self.factory,
            &self.registrar_options(),
            self.notifier.as_ref(),
        ) {
            Ok(enrolled) => enrolled,
            Err(Error::Resource(_)) => return Err(EXIT_BADDEV),
            Err(e) => {
                error!("Device registration failed: {e}");
                return Err(EXIT_BADDEV);
            }
        };
        self.devices = enrolled;

        // Minimum individual check interval, for per-device wakeups
        let mut checktime_min = self
            .devices
            .iter()
            .filter(|m| m.cfg.checktime != 0)
            .map(|m| i64::from(m.cfg.checktime))
            .min()
            .unwrap_or(0);
        if checktime_min > i64::from(self.opts.interval) {
            checktime_min = i64::from(self.opts.interval);
        }
        self.checktime_min = checktime_min;

        let tolerated = self.opts.quit == QuitPolicy::Never
            || (self.opts.quit == QuitPolicy::NoDevStartup && !firstpass);
        if self.devices.is_empty() && !tolerated {
            let status = if self.opts.quit_nodev0 { 0 } else { EXIT_NODEV };
            if status == 0 {
                info!("Unable to monitor any SMART enabled devices. Exiting.");
            } else {
                error!("Unable to monitor any SMART enabled devices. Exiting.");
            }
            return Err(status);
        }

        let ata = self
            .devices
            .iter()
            .filter(|m| m.dev.protocol() == Protocol::Ata)
            .count();
        let scsi = self
            .devices
            .iter()
            .filter(|m| m.dev.protocol() == Protocol::Scsi)
            .count();
        let nvme = self.devices.len() - ata - scsi;
        info!("Monitoring {ata} ATA/SATA, {scsi} SCSI/SAS and {nvme} NVMe devices");
        Ok(())
    }

    fn write_pid_file(&mut self) -> Result<(), i32> {
        let Some(path) = &self.opts.pid_file else {
            return Ok(());
        };
        let pid = std::process::id();
        if std::fs::write(path, format!("{pid}\n")).is_err() {
            error!("unable to write PID file {} - exiting.", path.display());
            return Err(EXIT_PID);
        }
        info!("file {} written containing PID {pid}", path.display());
        self.pid_written = true;
        Ok(())
    }

    fn remove_pid_file(&self) {
        if self.pid_written {
            if let Some(path) = &self.opts.pid_file {
                if let Err(e) = std::fs::remove_file(path) {
                    error!("Can't unlink PID file {} ({e}).", path.display());
                }
            }
        }
    }

    /// Sleep until the next wakeup time or a signal. Returns the
    /// adjusted wakeup time and the reason for waking.
    async fn dosleep(&mut self, signals: &mut Signals, mut wakeuptime: i64) -> (i64, Wake) {
        let mut timenow = Utc::now().timestamp();
        let interval = i64::from(self.opts.interval);

        let ct = if self.checktime_min == 0 {
            wakeuptime = calc_next_wakeuptime(wakeuptime, timenow, interval);
            interval
        } else {
            // Determine the wakeup time of the nearest device(s)
            wakeuptime = 0;
            for monitored in &mut self.devices {
                let state = &mut monitored.state.temp;
                if !state.skip {
                    let own = if monitored.cfg.checktime != 0 {
                        i64::from(monitored.cfg.checktime)
                    } else {
                        interval
                    };
                    let base = if state.wakeuptime != 0 {
                        state.wakeuptime
                    } else {
                        timenow
                    };
                    state.wakeuptime = calc_next_wakeuptime(base, timenow, own);
                }
                if wakeuptime == 0 || state.wakeuptime < wakeuptime {
                    wakeuptime = state.wakeuptime;
                }
            }
            self.checktime_min
        };

        let mut wake = Wake::Timer;
        let mut no_skip = false;
        let mut addtime: i64 = 0;
        while timenow < wakeuptime + addtime {
            // Clock adjusted to the past: restart the interval
            if wakeuptime > timenow + ct {
                info!("System clock time adjusted to the past. Resetting next wakeup time.");
                wakeuptime = timenow + ct;
                for monitored in &mut self.devices {
                    monitored.state.temp.wakeuptime = 0;
                }
                no_skip = true;
            }

            let span = Duration::from_secs((wakeuptime + addtime - timenow).max(0) as u64);
            tokio::select! {
                () = sleep(span) => {}
                _ = signals.term.recv() => {
                    wake = Wake::Exit(libc_signum::SIGTERM);
                    break;
                }
                _ = signals.quit.recv() => {
                    wake = Wake::Exit(libc_signum::SIGQUIT);
                    break;
                }
                _ = signals.int.recv() => {
                    if self.opts.debug {
                        info!("Signal INT - rereading configuration file");
                        wake = Wake::Reload;
                    } else {
                        wake = Wake::Exit(libc_signum::SIGINT);
                    }
                    break;
                }
                _ = signals.hup.recv() => {
                    info!("Signal HUP - rereading configuration file");
                    wake = Wake::Reload;
                    break;
                }
                _ = signals.usr1.recv() => {
                    let remaining = (wakeuptime - Utc::now().timestamp()).max(0);
                    info!(
                        "Signal USR1 - checking devices now rather than in {remaining} seconds."
                    );
                    wake = Wake::CheckNow;
                    no_skip = true;
                    break;
                }
                _ = signals.usr2.recv() => {
                    info!("Signal USR2 - debug mode toggling is not supported on this platform");
                    continue;
                }
            }

            timenow = Utc::now().timestamp();

            // Actual sleep time too long: assume a resume from standby
            // and give devices time to settle
            if addtime == 0 && timenow > wakeuptime + 60 {
                if self.opts.debug {
                    info!(
                        "Sleep time was {} seconds too long, assuming wakeup from standby mode.",
                        timenow - wakeuptime
                    );
                }
                addtime = timenow - wakeuptime + 20;
                // Merge with the next wakeup if it is close
                let nextcheck = ct - addtime % ct;
                if nextcheck <= 20 {
                    addtime += nextcheck;
                }
            }
        }

        // Mark devices whose individual wakeup has not come yet
        if self.checktime_min != 0 {
            let timenow = Utc::now().timestamp();
            for monitored in &mut self.devices {
                monitored.state.temp.skip = !no_skip && timenow < monitored.state.temp.wakeuptime;
            }
        }

        (wakeuptime, wake)
    }

    /// Run the daemon. Returns the process exit status.
    pub async fn run(mut self) -> i32 {
        let mut signals = match Signals::install() {
            Ok(signals) => signals,
            Err(e) => {
                error!("Unable to install signal handlers: {e}");
                return EXIT_BADCMD;
            }
        };

        let mut firstpass = true;
        let mut write_states_always = true;
        let mut reload = true;
        let mut wakeuptime = 0i64;
        let mut status: i32 = 0;
        let mut exit_signal: Option<i32> = None;

        loop {
            if reload {
                if let Err(exit_status) = self.reconfigure(firstpass) {
                    status = exit_status;
                    break;
                }
                reload = false;
                write_states_always = true;

                if self.opts.quit == QuitPolicy::ShowTests {
                    print_test_schedule(&mut self.devices, self.opts.interval);
                    return 0;
                }
            }

            // Check all devices once; self-tests are suppressed on the
            // first pass unless '-q onecheck' asked for a single run
            let allow_selftests = !firstpass || self.opts.quit == QuitPolicy::OneCheck;
            let now = Utc::now().timestamp();
            for i in 0..self.devices.len() {
                if self.devices[i].state.temp.skip {
                    if self.opts.debug {
                        let interval = if self.devices[i].cfg.checktime != 0 {
                            self.devices[i].cfg.checktime
                        } else {
                            self.opts.interval
                        };
                        info!(
                            "Device: {}, skipped (interval={interval})",
                            self.devices[i].cfg.name
                        );
                    }
                    continue;
                }
                let ctx = CheckContext {
                    warner: &self.warner,
                    firstpass,
                    allow_selftests,
                    debug: self.opts.debug,
                    now,
                };
                check_device(&mut self.devices[i], &ctx).await;
            }
            self.standby = standby_check(&self.devices, self.standby);

            write_all_states(&mut self.devices, write_states_always, self.opts.debug);
            write_states_always = false;
            write_all_attrlogs(&mut self.devices, self.opts.debug);

            if self.opts.quit == QuitPolicy::OneCheck {
                info!(
                    "Started with '-q onecheck' option. All devices successfully checked once."
                );
                info!("diskwatchd is exiting (exit status 0)");
                return 0;
            }

            if firstpass {
                if !self.opts.debug {
                    if let Err(exit_status) = self.write_pid_file() {
                        return exit_status;
                    }
                }
                wakeuptime = Utc::now().timestamp();
                firstpass = false;
                // Readiness only after the initial probing succeeded
                self.notifier.ready(&format!(
                    "Monitoring {} device(s)",
                    self.devices.len()
                ));
            }

            self.notifier.status(&format!(
                "Next check of {} device(s) pending",
                self.devices.len()
            ));
            let (new_wakeuptime, wake) = self.dosleep(&mut signals, wakeuptime).await;
            wakeuptime = new_wakeuptime;
            match wake {
                Wake::Timer => {}
                Wake::CheckNow => {
                    write_states_always = true;
                }
                Wake::Reload => {
                    reload = true;
                }
                Wake::Exit(sig) => {
                    exit_signal = Some(sig);
                    break;
                }
            }
        }

        if let Some(sig) = exit_signal {
            if sig == libc_signum::SIGTERM || (self.opts.debug && sig == libc_signum::SIGQUIT) {
                info!("diskwatchd received signal {sig}");
            } else {
                error!("diskwatchd received unexpected signal {sig}");
                status = EXIT_SIGNAL;
            }
        }

        if !firstpass {
            // Write state files only on normal exit
            if status == 0 {
                write_all_states(&mut self.devices, true, self.opts.debug);
            }
            self.remove_pid_file();
        }

        if status == 0 {
            info!("diskwatchd is exiting (exit status {status})");
        } else {
            error!("diskwatchd is exiting (exit status {status})");
        }
        status
    }
}

/// Signal numbers for exit reporting, kept local to avoid a libc
/// dependency for three constants.
mod libc_signum {
    pub const SIGINT: i32 = 2;
    pub const SIGQUIT: i32 = 3;
    pub const SIGTERM: i32 = 15;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calc_next_wakeuptime() {
        // Still in the future: unchanged
        assert_eq!(calc_next_wakeuptime(1000, 900, 300), 1000);
        // Exactly reached: one interval ahead
        assert_eq!(calc_next_wakeuptime(1000, 1000, 300), 1300);
        // Past by one and a half intervals: snaps to the grid
        assert_eq!(calc_next_wakeuptime(1000, 1450, 300), 1600);
    }

    #[test]
    fn test_parse_quit_modes() {
        assert_eq!(parse_quit("nodev"), Some((QuitPolicy::NoDev, false)));
        assert_eq!(parse_quit("nodev0"), Some((QuitPolicy::NoDev, true)));
        assert_eq!(
            parse_quit("nodev0startup"),
            Some((QuitPolicy::NoDevStartup, true))
        );
        assert_eq!(parse_quit("errors,nodev0"), Some((QuitPolicy::Errors, true)));
        assert_eq!(parse_quit("onecheck"), Some((QuitPolicy::OneCheck, false)));
        assert_eq!(parse_quit("sometimes"), None);
    }

    #[test]
    fn test_load_config_missing_default_scans() {
        let dir = tempfile::tempdir().unwrap();
        let source = ConfigSource::DefaultFile(dir.path().join("absent.conf"));
        let parse = load_config(&source).unwrap();
        assert!(parse.scan.is_some());
        assert!(parse.entries.is_empty());
    }

    #[test]
    fn test_load_config_missing_explicit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let source = ConfigSource::File(dir.path().join("absent.conf"));
        assert_eq!(load_config(&source).unwrap_err(), EXIT_NOCONF);
    }

    #[test]
    fn test_load_config_syntax_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.conf");
        std::fs::write(&path, "/dev/sda -Z\n").unwrap();
        assert_eq!(
            load_config(&ConfigSource::File(path)).unwrap_err(),
            EXIT_BADCONF
        );
    }
}
