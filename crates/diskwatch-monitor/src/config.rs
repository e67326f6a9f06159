//! Configuration file parser
//!
//! Reads the line-oriented monitoring configuration: `#` comments,
//! backslash continuation, a `DEFAULT` pseudo-entry that resets running
//! defaults, the `DEVICESCAN` sentinel, and per-device directives.
//! Unknown directives, missing arguments and out-of-range integers are
//! fatal with a file/line-numbered diagnostic.

use diskwatch_common::{Error, Result};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use tracing::{info, warn};

/// Scan sentinel device name.
pub const SCAN_DIRECTIVE: &str = "DEVICESCAN";

/// Attribute monitoring flags, one byte per attribute id.
pub const MONITOR_IGN_FAILUSE: u8 = 0x01;
pub const MONITOR_IGNORE: u8 = 0x02;
pub const MONITOR_RAW_PRINT: u8 = 0x04;
pub const MONITOR_RAW: u8 = 0x08;
pub const MONITOR_AS_CRIT: u8 = 0x10;
pub const MONITOR_RAW_AS_CRIT: u8 = 0x20;

/// Per-attribute flag table for `-r`/`-R`/`-i`/`-I` directives.
#[derive(Clone, Copy)]
pub struct AttrFlags {
    flags: [u8; 256],
}

impl Default for AttrFlags {
    fn default() -> Self {
        AttrFlags { flags: [0; 256] }
    }
}

impl AttrFlags {
    #[must_use]
    pub fn is_set(&self, id: u8, flag: u8) -> bool {
        id != 0 && self.flags[usize::from(id)] & flag != 0
    }

    pub fn set(&mut self, id: u8, flags: u8) {
        if id != 0 {
            self.flags[usize::from(id)] |= flags;
        }
    }
}

impl fmt::Debug for AttrFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set: Vec<(usize, u8)> = self
            .flags
            .iter()
            .enumerate()
            .filter(|(_, f)| **f != 0)
            .map(|(i, f)| (i, *f))
            .collect();
        f.debug_struct("AttrFlags").field("set", &set).finish()
    }
}

/// Warning dispatch frequency (`-M`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EmailFreq {
    #[default]
    Unknown,
    Once,
    Always,
    Daily,
    Diminishing,
}

/// Compiled self-test schedule expression.
#[derive(Clone)]
pub struct TestRegex {
    pattern: String,
    compiled: Regex,
}

impl TestRegex {
    /// Compile the user expression; matching is always whole-string.
    pub fn compile(pattern: &str) -> std::result::Result<Self, String> {
        let compiled = Regex::new(&format!("^(?:{pattern})$")).map_err(|e| e.to_string())?;
        Ok(TestRegex {
            pattern: pattern.to_string(),
            compiled,
        })
    }

    #[must_use]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    #[must_use]
    pub fn full_match(&self, text: &str) -> bool {
        self.compiled.is_match(text)
    }
}

impl fmt::Debug for TestRegex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TestRegex").field(&self.pattern).finish()
    }
}

/// Configuration data for one device entry. Immutable for the lifetime
/// of one configured-set generation; the registrar fills in the
/// identity and file-path fields after probing.
#[derive(Debug, Clone, Default)]
pub struct DevConfig {
    pub lineno: u32,
    /// Device name with optional extra info, for log lines.
    pub name: String,
    /// Plain device path, for the SMARTD_DEVICE variable.
    pub dev_name: String,
    /// `-d` type hint, empty means autodetect.
    pub dev_type: String,
    /// Canonical identity string, built after probe.
    pub dev_idinfo: String,
    /// Identity without namespace id, for duplicate detection.
    pub dev_idinfo_bc: String,
    /// Identity includes a serial or WWN.
    pub id_is_unique: bool,
    pub state_file: Option<PathBuf>,
    pub attrlog_file: Option<PathBuf>,
    /// Individual check interval, 0 = use global.
    pub checktime: u32,
    pub ignore: bool,
    pub removable: bool,
    pub permissive: bool,

    pub smartcheck: bool,
    /// NVMe Critical Warning bits monitored by `-H`.
    pub smartcheck_nvme: u8,
    pub usagefailed: bool,
    pub prefail: bool,
    pub usage: bool,
    pub selftest: bool,
    pub errorlog: bool,
    pub xerrorlog: bool,
    pub offlinests: bool,
    pub offlinests_ns: bool,
    pub selfteststs: bool,
    pub selfteststs_ns: bool,

    /// `-S on/off`.
    pub autosave: Option<bool>,
    /// `-o on/off`.
    pub auto_offline: Option<bool>,

    /// `-n`: 0 never, 1 sleep, 2 standby, 3 idle.
    pub powermode: u8,
    pub powerquiet: bool,
    pub powerskipmax: u32,

    pub tempdiff: u8,
    pub tempinfo: u8,
    pub tempcrit: u8,

    pub test_regex: Option<TestRegex>,
    /// Factor for staggering scheduled tests across devices.
    pub test_offset_factor: u32,

    pub emailaddress: String,
    pub emailcmdline: String,
    pub emailfreq: EmailFreq,
    pub emailtest: bool,

    // ATA settings applied once at registration (-e, -l scterc)
    pub set_aam: Option<Option<u8>>,
    pub set_apm: Option<Option<u8>>,
    pub set_lookahead: Option<bool>,
    pub set_wcache: Option<bool>,
    pub set_dsn: Option<bool>,
    pub set_standby: Option<Option<u8>>,
    pub set_security_freeze: bool,
    pub sct_erc: Option<(u16, u16)>,

    pub curr_pending_id: u8,
    pub offl_pending_id: u8,
    pub curr_pending_incr: bool,
    pub offl_pending_incr: bool,
    pub curr_pending_set: bool,
    pub offl_pending_set: bool,

    pub monitor_attr_flags: AttrFlags,
    /// `-v ID,FORMAT[,NAME]` attribute-name remapping.
    pub attr_names: HashMap<u8, String>,
    /// `-P ignore`.
    pub ignore_presets: bool,
    /// `-F` firmware-bug workarounds, recorded by name.
    pub firmwarebugs: Vec<String>,

    /// 0 = unknown, 1 = SSD, > 1 = rotation rate (filled by registrar).
    pub dev_rpm: i32,
    /// Size of the NVMe error log (filled by registrar).
    pub nvme_err_log_max_entries: usize,
}

impl DevConfig {
    /// Enable the canonical `-a` set of monitoring directives.
    fn enable_all(&mut self) {
        self.smartcheck = true;
        self.smartcheck_nvme = 0xff;
        self.usagefailed = true;
        self.prefail = true;
        self.usage = true;
        self.selftest = true;
        self.errorlog = true;
        self.selfteststs = true;
    }

    /// Any monitoring directive set?
    fn monitors_anything(&self) -> bool {
        self.smartcheck
            || self.selftest
            || self.errorlog
            || self.xerrorlog
            || self.offlinests
            || self.selfteststs
            || self.usagefailed
            || self.prefail
            || self.usage
            || self.tempdiff != 0
            || self.tempinfo != 0
            || self.tempcrit != 0
    }

    /// Name of the attribute, honoring `-v` remaps.
    #[must_use]
    pub fn attr_name(&self, id: u8) -> String {
        match self.attr_names.get(&id) {
            Some(name) => name.clone(),
            None => diskwatch_device::ata::attr_name(id).to_string(),
        }
    }

    /// A warning destination is configured.
    #[must_use]
    pub fn warns(&self) -> bool {
        !self.emailaddress.is_empty() || !self.emailcmdline.is_empty()
    }
}

/// Result of parsing one configuration file.
#[derive(Debug, Default)]
pub struct ConfigParse {
    /// Explicit device entries, in file order.
    pub entries: Vec<DevConfig>,
    /// DEVICESCAN base entry and its `-d` type filters, if present.
    pub scan: Option<(DevConfig, Vec<String>)>,
}

struct Parser<'a> {
    file: &'a str,
}

impl<'a> Parser<'a> {
    fn err(&self, lineno: u32, msg: impl Into<String>) -> Error {
        Error::config(self.file, lineno, msg)
    }

    fn int_arg(
        &self,
        arg: Option<&str>,
        cfg: &DevConfig,
        token: &str,
        min: i64,
        max: i64,
        suffix: Option<char>,
    ) -> Result<(i64, bool)> {
        let Some(arg) = arg else {
            return Err(self.err(
                cfg.lineno,
                format!(
                    "(drive {}): Directive: {token} takes integer argument from {min} to {max}",
                    cfg.name
                ),
            ));
        };
        let (body, suffixed) = match suffix {
            Some(s) if arg.ends_with(s) => (&arg[..arg.len() - s.len_utf8()], true),
            _ => (arg, false),
        };
        match body.parse::<i64>() {
            Ok(val) if (min..=max).contains(&val) => Ok((val, suffixed)),
            _ => Err(self.err(
                cfg.lineno,
                format!(
                    "(drive {}): Directive: {token} has argument: {arg}; needs integer from {min} to {max}",
                    cfg.name
                ),
            )),
        }
    }

    /// Parse the directives of one entry line.
    fn parse_directives(
        &self,
        cfg: &mut DevConfig,
        tokens: &[&str],
        scan_types: &mut Vec<String>,
    ) -> Result<()> {
        let lineno = cfg.lineno;
        let entry = cfg.name.clone();
        let missing = |what: &str| {
            self.err(
                lineno,
                format!("(drive {entry}): Missing argument to {what} Directive"),
            )
        };
        let bad = |what: &str, arg: &str| {
            self.err(
                lineno,
                format!("(drive {entry}): Invalid argument to {what} Directive: {arg}"),
            )
        };

        let mut iter = tokens.iter().copied().peekable();
        while let Some(token) = iter.next() {
            if token.starts_with('#') {
                break;
            }
            if !token.starts_with('-') || token.len() != 2 {
                return Err(self.err(
                    lineno,
                    format!("(drive {entry}): unknown Directive: {token}"),
                ));
            }
            match token {
                "-d" => {
                    let arg = iter.next().ok_or_else(|| missing("-d"))?;
                    match arg {
                        "ignore" => cfg.ignore = true,
                        "removable" => cfg.removable = true,
                        "auto" => {
                            cfg.dev_type.clear();
                            scan_types.clear();
                        }
                        other => {
                            cfg.dev_type = other.to_string();
                            scan_types.push(other.to_string());
                        }
                    }
                }
                "-T" => match iter.next().ok_or_else(|| missing("-T"))? {
                    "normal" => cfg.permissive = false,
                    "permissive" => cfg.permissive = true,
                    other => return Err(bad("-T", other)),
                },
                "-H" => {
                    cfg.smartcheck = true;
                    cfg.smartcheck_nvme = 0xff;
                    // Optional NVMe critical-warning bitmask
                    if let Some(next) = iter.peek() {
                        if !next.starts_with('-') {
                            let arg = iter.next().unwrap();
                            let mask = arg
                                .strip_prefix("0x")
                                .and_then(|h| u8::from_str_radix(h, 16).ok());
                            match mask {
                                Some(m) => cfg.smartcheck_nvme = m,
                                None => return Err(bad("-H", arg)),
                            }
                        }
                    }
                }
                "-f" => cfg.usagefailed = true,
                "-t" => {
                    cfg.prefail = true;
                    cfg.usage = true;
                }
                "-p" => cfg.prefail = true,
                "-u" => cfg.usage = true,
                "-l" => {
                    let arg = iter.next().ok_or_else(|| missing("-l"))?;
                    match arg {
                        "selftest" => cfg.selftest = true,
                        "error" => cfg.errorlog = true,
                        "xerror" => cfg.xerrorlog = true,
                        "offlinests" => cfg.offlinests = true,
                        "offlinests,ns" => {
                            cfg.offlinests = true;
                            cfg.offlinests_ns = true;
                        }
                        "selfteststs" => cfg.selfteststs = true,
                        "selfteststs,ns" => {
                            cfg.selfteststs = true;
                            cfg.selfteststs_ns = true;
                        }
                        other if other.starts_with("scterc,") => {
                            let mut parts = other["scterc,".len()..].split(',');
                            let rt = parts.next().and_then(|s| s.parse::<u16>().ok());
                            let wt = parts.next().and_then(|s| s.parse::<u16>().ok());
                            match (rt, wt, parts.next()) {
                                (Some(rt), Some(wt), None) if rt <= 999 && wt <= 999 => {
                                    cfg.sct_erc = Some((rt, wt));
                                }
                                _ => return Err(bad("-l", other)),
                            }
                        }
                        other => return Err(bad("-l", other)),
                    }
                }
                "-a" => cfg.enable_all(),
                "-o" => match iter.next().ok_or_else(|| missing("-o"))? {
                    "on" => cfg.auto_offline = Some(true),
                    "off" => cfg.auto_offline = Some(false),
                    other => return Err(bad("-o", other)),
                },
                "-S" => match iter.next().ok_or_else(|| missing("-S"))? {
                    "on" => cfg.autosave = Some(true),
                    "off" => cfg.autosave = Some(false),
                    other => return Err(bad("-S", other)),
                },
                "-n" => {
                    let arg = iter.next().ok_or_else(|| missing("-n"))?;
                    let mut parts = arg.split(',');
                    cfg.powermode = match parts.next().unwrap_or("") {
                        "never" => 0,
                        "sleep" => 1,
                        "standby" => 2,
                        "idle" => 3,
                        _ => return Err(bad("-n", arg)),
                    };
                    cfg.powerquiet = false;
                    cfg.powerskipmax = 0;
                    for part in parts {
                        if part == "q" {
                            cfg.powerquiet = true;
                        } else {
                            match part.parse::<u32>() {
                                Ok(n) if n > 0 => cfg.powerskipmax = n,
                                _ => return Err(bad("-n", arg)),
                            }
                        }
                    }
                }
                "-s" => {
                    let arg = iter.next().ok_or_else(|| missing("-s"))?;
                    if let Some(prev) = &cfg.test_regex {
                        info!(
                            "file {} line {} (drive {}): ignoring previous Test Directive -s {}",
                            self.file,
                            cfg.lineno,
                            cfg.name,
                            prev.pattern()
                        );
                    }
                    let regex = TestRegex::compile(arg).map_err(|e| {
                        self.err(
                            cfg.lineno,
                            format!(
                                "(drive {}): -s argument \"{arg}\" is INVALID extended regular expression: {e}",
                                cfg.name
                            ),
                        )
                    })?;
                    if let Some(odd) = odd_schedule_syntax(arg) {
                        info!(
                            "file {} line {} (drive {}): warning, \"{odd}\" looks odd in extended regular expression \"{arg}\"",
                            self.file, cfg.lineno, cfg.name
                        );
                    }
                    cfg.test_regex = Some(regex);
                }
                "-m" => {
                    let arg = iter.next().ok_or_else(|| missing("-m"))?;
                    if !cfg.emailaddress.is_empty() {
                        info!(
                            "file {} line {} (drive {}): ignoring previous Address Directive -m {}",
                            self.file, cfg.lineno, cfg.name, cfg.emailaddress
                        );
                    }
                    cfg.emailaddress = arg.to_string();
                }
                "-M" => {
                    let arg = iter.next().ok_or_else(|| missing("-M"))?;
                    match arg {
                        "once" => cfg.emailfreq = EmailFreq::Once,
                        "always" => cfg.emailfreq = EmailFreq::Always,
                        "daily" => cfg.emailfreq = EmailFreq::Daily,
                        "diminishing" => cfg.emailfreq = EmailFreq::Diminishing,
                        "test" => cfg.emailtest = true,
                        "exec" => {
                            let path = iter.next().ok_or_else(|| {
                                self.err(
                                    cfg.lineno,
                                    format!(
                                        "(drive {}): Directive -M 'exec' argument must be followed by executable path",
                                        cfg.name
                                    ),
                                )
                            })?;
                            if !cfg.emailcmdline.is_empty() {
                                info!(
                                    "file {} line {} (drive {}): ignoring previous mail Directive -M exec {}",
                                    self.file, cfg.lineno, cfg.name, cfg.emailcmdline
                                );
                            }
                            cfg.emailcmdline = path.to_string();
                        }
                        other => return Err(bad("-M", other)),
                    }
                }
                "-i" => {
                    let (id, _) = self.int_arg(iter.next(), cfg, "-i", 1, 255, None)?;
                    cfg.monitor_attr_flags.set(id as u8, MONITOR_IGN_FAILUSE);
                }
                "-I" => {
                    let (id, _) = self.int_arg(iter.next(), cfg, "-I", 1, 255, None)?;
                    cfg.monitor_attr_flags.set(id as u8, MONITOR_IGNORE);
                }
                "-r" => {
                    let (id, crit) = self.int_arg(iter.next(), cfg, "-r", 1, 255, Some('!'))?;
                    cfg.monitor_attr_flags.set(id as u8, MONITOR_RAW_PRINT);
                    if crit {
                        cfg.monitor_attr_flags.set(id as u8, MONITOR_AS_CRIT);
                    }
                }
                "-R" => {
                    let (id, crit) = self.int_arg(iter.next(), cfg, "-R", 1, 255, Some('!'))?;
                    cfg.monitor_attr_flags
                        .set(id as u8, MONITOR_RAW_PRINT | MONITOR_RAW);
                    if crit {
                        cfg.monitor_attr_flags.set(id as u8, MONITOR_RAW_AS_CRIT);
                    }
                }
                "-C" => {
                    let (id, incr) = self.int_arg(iter.next(), cfg, "-C", 0, 255, Some('+'))?;
                    cfg.curr_pending_id = id as u8;
                    cfg.curr_pending_incr = incr;
                    cfg.curr_pending_set = true;
                }
                "-U" => {
                    let (id, incr) = self.int_arg(iter.next(), cfg, "-U", 0, 255, Some('+'))?;
                    cfg.offl_pending_id = id as u8;
                    cfg.offl_pending_incr = incr;
                    cfg.offl_pending_set = true;
                }
                "-W" => {
                    let arg = iter.next().ok_or_else(|| missing("-W"))?;
                    let mut vals = [0u16; 3];
                    let parts: Vec<&str> = arg.split(',').collect();
                    if parts.is_empty() || parts.len() > 3 {
                        return Err(bad("-W", arg));
                    }
                    for (i, part) in parts.iter().enumerate() {
                        match part.parse::<u16>() {
                            Ok(v) if v <= 255 => vals[i] = v,
                            _ => return Err(bad("-W", arg)),
                        }
                    }
                    cfg.tempdiff = vals[0] as u8;
                    cfg.tempinfo = vals[1] as u8;
                    cfg.tempcrit = vals[2] as u8;
                }
                "-v" => {
                    let arg = iter.next().ok_or_else(|| missing("-v"))?;
                    let mut parts = arg.splitn(3, ',');
                    let id = parts.next().and_then(|s| s.parse::<u8>().ok());
                    let format = parts.next();
                    match (id, format) {
                        (Some(id), Some(format)) if id > 0 && !format.is_empty() => {
                            if let Some(name) = parts.next() {
                                cfg.attr_names.insert(id, name.to_string());
                            }
                        }
                        _ => return Err(bad("-v", arg)),
                    }
                }
                "-P" => match iter.next().ok_or_else(|| missing("-P"))? {
                    "use" => cfg.ignore_presets = false,
                    "ignore" => cfg.ignore_presets = true,
                    "show" | "showall" => {
                        // Presets database is external; nothing to show here.
                        warn!(
                            "file {} line {} (drive {}): no drive presets database loaded, -P show has no effect",
                            self.file, cfg.lineno, cfg.name
                        );
                    }
                    other => return Err(bad("-P", other)),
                },
                "-F" => {
                    let arg = iter.next().ok_or_else(|| missing("-F"))?;
                    match arg {
                        "none" | "nologdir" | "samsung" | "samsung2" | "samsung3"
                        | "xerrorlba" | "swapid" => cfg.firmwarebugs.push(arg.to_string()),
                        other => return Err(bad("-F", other)),
                    }
                }
                "-e" => {
                    let arg = iter.next().ok_or_else(|| missing("-e"))?;
                    self.parse_ata_setting(cfg, arg)
                        .map_err(|()| bad("-e", arg))?;
                }
                "-c" => {
                    let arg = iter.next().ok_or_else(|| missing("-c"))?;
                    let value = arg
                        .strip_prefix("i=")
                        .or_else(|| arg.strip_prefix("interval="));
                    match value.and_then(|v| v.parse::<u32>().ok()) {
                        Some(n) if n >= 10 => cfg.checktime = n,
                        _ => return Err(bad("-c", arg)),
                    }
                }
                other => {
                    return Err(self.err(
                        cfg.lineno,
                        format!("(drive {}): unknown Directive: {other}", cfg.name),
                    ));
                }
            }
        }
        Ok(())
    }

    fn parse_ata_setting(&self, cfg: &mut DevConfig, arg: &str) -> std::result::Result<(), ()> {
        let (name, value) = match arg.split_once([',', '=']) {
            Some((n, v)) => (n, Some(v)),
            None => (arg, None),
        };
        let num = value.and_then(|v| v.parse::<u16>().ok());
        let on = value == Some("on");
        let off = value == Some("off");
        match name {
            "aam" => {
                cfg.set_aam = if off {
                    Some(None)
                } else {
                    match num {
                        Some(n) if n <= 254 => Some(Some(n as u8)),
                        _ => return Err(()),
                    }
                }
            }
            "apm" => {
                cfg.set_apm = if off {
                    Some(None)
                } else {
                    match num {
                        Some(n) if (1..=254).contains(&n) => Some(Some(n as u8)),
                        _ => return Err(()),
                    }
                }
            }
            "lookahead" => {
                cfg.set_lookahead = match (on, off) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => return Err(()),
                }
            }
            "wcache" => {
                cfg.set_wcache = match (on, off) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => return Err(()),
                }
            }
            "dsn" => {
                cfg.set_dsn = match (on, off) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => return Err(()),
                }
            }
            "standby" => {
                cfg.set_standby = if off {
                    Some(None)
                } else {
                    match num {
                        Some(n) if n <= 255 => Some(Some(n as u8)),
                        _ => return Err(()),
                    }
                }
            }
            "security-freeze" if value.is_none() => cfg.set_security_freeze = true,
            _ => return Err(()),
        }
        Ok(())
    }
}

/// Flag subsequences of a schedule expression that suggest shell-glob
/// confusion or a malformed `:NNN[-LLL]` suffix.
fn odd_schedule_syntax(pattern: &str) -> Option<String> {
    let odd_chars: String = pattern
        .chars()
        .filter(|c| {
            !matches!(c,
                ']' | '$' | '(' | ')' | '*' | '+' | '.' | '/' | ':' | '?' | '^' | '[' | '|'
                | '0'..='9' | 'L' | 'S' | 'C' | 'O' | 'n' | 'c' | 'r' | '-')
        })
        .collect();
    if !odd_chars.is_empty() {
        return Some(odd_chars);
    }
    // ':' must be followed by exactly three digits
    let bytes = pattern.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b':' {
            let digits = bytes[i + 1..].iter().take_while(|c| c.is_ascii_digit()).count();
            if digits != 3 {
                return Some(pattern[i..].chars().take(digits + 1).collect());
            }
        }
    }
    None
}

/// Splice continuation lines and strip comments, preserving line
/// numbers: returns (first line number, logical line) pairs.
fn logical_lines(text: &str) -> Vec<(u32, String)> {
    let mut out = Vec::new();
    let mut pending = String::new();
    let mut first_lineno = 0u32;
    for (i, raw) in text.lines().enumerate() {
        let lineno = i as u32 + 1;
        let line = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        };
        if pending.is_empty() {
            first_lineno = lineno;
        }
        // A trailing backslash with nothing after it splices the next line
        let trimmed = line.trim_end();
        if let Some(stripped) = trimmed.strip_suffix('\\') {
            pending.push_str(stripped);
            pending.push(' ');
            continue;
        }
        pending.push_str(line);
        if !pending.trim().is_empty() {
            out.push((first_lineno, std::mem::take(&mut pending)));
        } else {
            pending.clear();
        }
    }
    if !pending.trim().is_empty() {
        out.push((first_lineno, pending));
    }
    out
}

/// Parse configuration text. `file` names the source for diagnostics.
pub fn parse_config_text(text: &str, file: &str) -> Result<ConfigParse> {
    let parser = Parser { file };
    let mut parse = ConfigParse::default();
    let mut defaults = DevConfig::default();

    for (lineno, line) in logical_lines(text) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&name) = tokens.first() else {
            continue;
        };
        if name.starts_with('#') {
            continue;
        }

        let is_default = name == "DEFAULT";
        let is_scan = name == SCAN_DIRECTIVE;

        // A DEFAULT line restarts from empty defaults
        let mut cfg = if is_default {
            DevConfig::default()
        } else {
            defaults.clone()
        };
        cfg.name = name.to_string();
        cfg.dev_name = name.to_string();
        cfg.lineno = lineno;

        let mut scan_types = Vec::new();
        parser.parse_directives(&mut cfg, &tokens[1..], &mut scan_types)?;

        if is_default {
            cfg.name.clear();
            cfg.dev_name.clear();
            defaults = cfg;
            continue;
        }

        if !is_scan && scan_types.len() > 1 {
            return Err(parser.err(
                lineno,
                format!(
                    "(drive {}): invalid multiple -d TYPE Directives",
                    cfg.name
                ),
            ));
        }

        if !cfg.monitors_anything() {
            info!(
                "drive {}, implied '-a' Directive on line {} of file {}",
                cfg.name, cfg.lineno, file
            );
            cfg.enable_all();
        }

        if cfg.emailaddress.is_empty()
            && (!cfg.emailcmdline.is_empty() || cfg.emailfreq != EmailFreq::Unknown || cfg.emailtest)
        {
            return Err(parser.err(
                lineno,
                format!(
                    "(drive {}): -M Directive(s) need -m ADDRESS Directive",
                    cfg.name
                ),
            ));
        }

        if cfg.emailaddress == "<nomailer>" {
            if cfg.emailcmdline.is_empty() {
                return Err(parser.err(
                    lineno,
                    format!(
                        "(drive {}): -m <nomailer> Directive needs -M exec Directive",
                        cfg.name
                    ),
                ));
            }
            // From here on <nomailer> means: empty address, exec set
            cfg.emailaddress.clear();
        }

        if is_scan {
            // DEVICESCAN ends the file: it expands into one entry per
            // discovered device at registration
            parse.scan = Some((cfg, scan_types));
            return Ok(parse);
        }
        parse.entries.push(cfg);
    }

    Ok(parse)
}

/// Parse a configuration file from disk.
pub fn parse_config_file(path: &std::path::Path) -> Result<ConfigParse> {
    let text = std::fs::read_to_string(path).map_err(Error::Io)?;
    parse_config_text(&text, &path.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_entry() {
        let parse =
            parse_config_text("/dev/sda -a -m root@example.com -M daily\n", "test.conf").unwrap();
        assert_eq!(parse.entries.len(), 1);
        let cfg = &parse.entries[0];
        assert_eq!(cfg.name, "/dev/sda");
        assert!(cfg.smartcheck);
        assert!(cfg.selftest);
        assert!(cfg.errorlog);
        assert_eq!(cfg.smartcheck_nvme, 0xff);
        assert_eq!(cfg.emailaddress, "root@example.com");
        assert_eq!(cfg.emailfreq, EmailFreq::Daily);
        assert!(parse.scan.is_none());
    }

    #[test]
    fn test_implied_all() {
        let parse = parse_config_text("/dev/sdb -m admin@host\n", "test.conf").unwrap();
        let cfg = &parse.entries[0];
        assert!(cfg.smartcheck && cfg.prefail && cfg.usage && cfg.usagefailed);
    }

    #[test]
    fn test_comments_and_continuation() {
        let text = "# header comment\n/dev/sda -H \\\n  -l selftest # trailing\n";
        let parse = parse_config_text(text, "test.conf").unwrap();
        assert_eq!(parse.entries.len(), 1);
        let cfg = &parse.entries[0];
        assert_eq!(cfg.lineno, 2);
        assert!(cfg.smartcheck);
        assert!(cfg.selftest);
        assert!(!cfg.errorlog);
    }

    #[test]
    fn test_default_entry() {
        let text = "DEFAULT -m ops@example.com -M diminishing\n\
                    /dev/sda -H\n\
                    DEFAULT\n\
                    /dev/sdb -H\n";
        let parse = parse_config_text(text, "test.conf").unwrap();
        assert_eq!(parse.entries[0].emailaddress, "ops@example.com");
        assert_eq!(parse.entries[0].emailfreq, EmailFreq::Diminishing);
        assert!(parse.entries[1].emailaddress.is_empty());
    }

    #[test]
    fn test_devicescan() {
        let text = "/dev/sda -H\nDEVICESCAN -d sat -a\n/dev/never -H\n";
        let parse = parse_config_text(text, "test.conf").unwrap();
        assert_eq!(parse.entries.len(), 1);
        let (base, types) = parse.scan.unwrap();
        assert!(base.smartcheck);
        assert_eq!(types, vec!["sat".to_string()]);
    }

    #[test]
    fn test_attribute_directives() {
        let text = "/dev/sda -t -r 5! -R 197+\n"; // -R takes '!' suffix, not '+'
        assert!(parse_config_text(text, "t.conf").is_err());

        let parse =
            parse_config_text("/dev/sda -t -r 5! -R 10! -i 194 -I 231\n", "t.conf").unwrap();
        let flags = &parse.entries[0].monitor_attr_flags;
        assert!(flags.is_set(5, MONITOR_RAW_PRINT));
        assert!(flags.is_set(5, MONITOR_AS_CRIT));
        assert!(!flags.is_set(5, MONITOR_RAW));
        assert!(flags.is_set(10, MONITOR_RAW | MONITOR_RAW_AS_CRIT));
        assert!(flags.is_set(194, MONITOR_IGN_FAILUSE));
        assert!(flags.is_set(231, MONITOR_IGNORE));
    }

    #[test]
    fn test_pending_directives() {
        let parse = parse_config_text("/dev/sda -a -C 197+ -U 198\n", "t.conf").unwrap();
        let cfg = &parse.entries[0];
        assert_eq!(cfg.curr_pending_id, 197);
        assert!(cfg.curr_pending_incr);
        assert!(cfg.curr_pending_set);
        assert_eq!(cfg.offl_pending_id, 198);
        assert!(!cfg.offl_pending_incr);
    }

    #[test]
    fn test_temperature_directive() {
        let parse = parse_config_text("/dev/sda -a -W 4,40,55\n", "t.conf").unwrap();
        let cfg = &parse.entries[0];
        assert_eq!((cfg.tempdiff, cfg.tempinfo, cfg.tempcrit), (4, 40, 55));

        // 1..3 values accepted
        let parse = parse_config_text("/dev/sda -a -W 0,0,60\n", "t.conf").unwrap();
        assert_eq!(parse.entries[0].tempcrit, 60);
        assert!(parse_config_text("/dev/sda -a -W 4,400\n", "t.conf").is_err());
    }

    #[test]
    fn test_powermode_directive() {
        let parse = parse_config_text("/dev/sda -a -n standby,10,q\n", "t.conf").unwrap();
        let cfg = &parse.entries[0];
        assert_eq!(cfg.powermode, 2);
        assert_eq!(cfg.powerskipmax, 10);
        assert!(cfg.powerquiet);
        assert!(parse_config_text("/dev/sda -a -n napping\n", "t.conf").is_err());
    }

    #[test]
    fn test_schedule_directive() {
        let parse = parse_config_text("/dev/sda -a -s L/../../7/02\n", "t.conf").unwrap();
        let regex = parse.entries[0].test_regex.as_ref().unwrap();
        assert!(regex.full_match("L/08/03/7/02"));
        assert!(!regex.full_match("S/08/03/7/02"));
        assert!(parse_config_text("/dev/sda -a -s (L|S\n", "t.conf").is_err());
    }

    #[test]
    fn test_scterc_directive() {
        let parse = parse_config_text("/dev/sda -a -l scterc,70,70\n", "t.conf").unwrap();
        assert_eq!(parse.entries[0].sct_erc, Some((70, 70)));
        assert!(parse_config_text("/dev/sda -a -l scterc,1000,70\n", "t.conf").is_err());
    }

    #[test]
    fn test_ata_settings_directive() {
        let parse = parse_config_text(
            "/dev/sda -a -e aam,128 -e apm,off -e wcache,on -e security-freeze -e standby,242\n",
            "t.conf",
        )
        .unwrap();
        let cfg = &parse.entries[0];
        assert_eq!(cfg.set_aam, Some(Some(128)));
        assert_eq!(cfg.set_apm, Some(None));
        assert_eq!(cfg.set_wcache, Some(true));
        assert!(cfg.set_security_freeze);
        assert_eq!(cfg.set_standby, Some(Some(242)));
        assert!(parse_config_text("/dev/sda -a -e apm,0\n", "t.conf").is_err());
    }

    #[test]
    fn test_interval_directive() {
        let parse = parse_config_text("/dev/sda -a -c i=600\n", "t.conf").unwrap();
        assert_eq!(parse.entries[0].checktime, 600);
        assert!(parse_config_text("/dev/sda -a -c i=5\n", "t.conf").is_err());
        assert!(parse_config_text("/dev/sda -a -c x=600\n", "t.conf").is_err());
    }

    #[test]
    fn test_mail_validation() {
        // -M without -m is fatal
        assert!(parse_config_text("/dev/sda -a -M daily\n", "t.conf").is_err());
        // <nomailer> requires -M exec
        assert!(parse_config_text("/dev/sda -a -m <nomailer>\n", "t.conf").is_err());
        let parse = parse_config_text(
            "/dev/sda -a -m <nomailer> -M exec /usr/local/bin/alert\n",
            "t.conf",
        )
        .unwrap();
        let cfg = &parse.entries[0];
        assert!(cfg.emailaddress.is_empty());
        assert_eq!(cfg.emailcmdline, "/usr/local/bin/alert");
        assert!(cfg.warns());
    }

    #[test]
    fn test_unknown_directive() {
        let err = parse_config_text("/dev/sda -Z\n", "t.conf").unwrap_err();
        assert!(err.to_string().contains("line 1"));
        assert!(err.to_string().contains("unknown Directive"));
    }

    #[test]
    fn test_nvme_health_mask() {
        let parse = parse_config_text("/dev/nvme0 -H 0x01 -l selftest\n", "t.conf").unwrap();
        assert_eq!(parse.entries[0].smartcheck_nvme, 0x01);
        assert!(parse_config_text("/dev/nvme0 -H 0x1ff\n", "t.conf").is_err());
    }

    #[test]
    fn test_multiple_type_hints_rejected() {
        assert!(parse_config_text("/dev/sda -d sat -d scsi -a\n", "t.conf").is_err());
    }

    #[test]
    fn test_odd_schedule_syntax() {
        assert!(odd_schedule_syntax("L/../../7/02").is_none());
        assert!(odd_schedule_syntax("L/../../7/02:123").is_none());
        assert!(odd_schedule_syntax("L/../../sun/02").is_some()); // day name, not 1..7
        assert!(odd_schedule_syntax("S/../../../01:12").is_some()); // two-digit offset
    }
}
