//! diskwatchd - storage device SMART monitoring daemon
//!
//! Periodically interrogates the self-monitoring facilities of local
//! ATA/SATA, SCSI/SAS and NVMe storage devices, tracks degradation in
//! persistent per-device state, and notifies operators through a
//! configurable warning channel.

mod factory;
mod supervisor;

use clap::Parser;
use factory::UnlinkedFactory;
use std::path::PathBuf;
use supervisor::{parse_quit, ConfigSource, Options, QuitPolicy, Supervisor, EXIT_BADCMD};
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG: &str = "/etc/diskwatchd.conf";
const DEFAULT_WARN_SCRIPT: &str = "/usr/libexec/diskwatchd/diskwatchd_warning.sh";

#[derive(Parser, Debug)]
#[command(name = "diskwatchd")]
#[command(about = "Storage device SMART monitoring daemon")]
#[command(version)]
struct Args {
    /// Configuration file path, '-' reads standard input
    #[arg(short = 'c', long = "configfile")]
    configfile: Option<String>,

    /// Path prefix for attribute log files, '-' disables them
    #[arg(short = 'A', long = "attributelog")]
    attributelog: Option<String>,

    /// Path prefix for persistent state files, '-' disables them
    #[arg(short = 's', long = "savestates")]
    savestates: Option<String>,

    /// Drive presets database file, '+FILE' adds to the default
    #[arg(short = 'B', long = "drivedb")]
    drivedb: Option<String>,

    /// Debug mode: log to the console, SIGINT reloads
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Print a list of valid configuration Directives and exit
    #[arg(short = 'D', long = "showdirectives")]
    showdirectives: bool,

    /// Global check interval in seconds (minimum 10)
    #[arg(short = 'i', long = "interval", default_value_t = 1800)]
    interval: u32,

    /// Log facility: daemon, local0 .. local7
    #[arg(short = 'l', long = "logfacility", default_value = "daemon")]
    logfacility: String,

    /// Do not fork (the daemon never forks; accepted for service files)
    #[arg(short = 'n', long = "no-fork")]
    no_fork: bool,

    /// Write the process id to this file, removed on clean exit
    #[arg(short = 'p', long = "pidfile")]
    pidfile: Option<PathBuf>,

    /// When to exit: nodev, nodev0, nodevstartup, nodev0startup,
    /// errors, errors,nodev0, never, onecheck, showtests
    #[arg(short = 'q', long = "quit", default_value = "nodev")]
    quit: String,

    /// Report transport transactions: TYPE[,N] with TYPE one of
    /// ioctl, ataioctl, scsiioctl, nvmeioctl and N in 1..=4
    #[arg(short = 'r', long = "report")]
    report: Vec<String>,

    /// Warning script to execute on warning conditions
    #[arg(short = 'w', long = "warnexec", default_value = DEFAULT_WARN_SCRIPT)]
    warnexec: PathBuf,

    /// Run warning scripts as 'UID[:GID]' (numeric), '-' disables
    #[arg(short = 'u', long = "warn-as-user")]
    warn_as_user: Option<String>,
}

fn parse_report(arg: &str) -> Option<(&str, u8)> {
    let (kind, level) = match arg.split_once(',') {
        Some((kind, level)) => (kind, level.parse::<u8>().ok()?),
        None => (arg, 1),
    };
    if !(1..=4).contains(&level) {
        return None;
    }
    matches!(kind, "ioctl" | "ataioctl" | "scsiioctl" | "nvmeioctl").then_some((kind, level))
}

fn parse_warn_as(arg: &str) -> Option<Option<(u32, u32)>> {
    if arg == "-" {
        return Some(None);
    }
    let (uid, gid) = match arg.split_once(':') {
        Some((uid, gid)) => (uid.parse().ok()?, gid.parse().ok()?),
        None => {
            let uid: u32 = arg.parse().ok()?;
            (uid, uid)
        }
    };
    Some(Some((uid, gid)))
}

fn print_directives() {
    println!("Configuration file Directives (after device name):");
    println!("  -d TYPE Set the device type: auto, ignore, removable, or a transport type");
    println!("  -T TYPE Set the tolerance to one of: normal, permissive");
    println!("  -o VAL  Enable/disable automatic offline tests (on/off)");
    println!("  -S VAL  Enable/disable attribute autosave (on/off)");
    println!("  -n MODE No check if: never, sleep[,N][,q], standby[,N][,q], idle[,N][,q]");
    println!("  -H      Monitor SMART Health Status, report if failed");
    println!("  -H MASK Monitor specific NVMe Critical Warning bits");
    println!("  -s REG  Do Self-Test at time(s) given by regular expression REG");
    println!("  -l TYPE Monitor SMART log or self-test status:");
    println!("          error, selftest, xerror, offlinests[,ns], selfteststs[,ns]");
    println!("  -l scterc,R,W  Set SCT Error Recovery Control");
    println!("  -e      Change device setting: aam,[N|off], apm,[N|off], dsn,[on|off],");
    println!("          lookahead,[on|off], security-freeze, standby,[N|off], wcache,[on|off]");
    println!("  -f      Monitor 'Usage' Attributes, report failures");
    println!("  -m ADD  Send warning email to address ADD");
    println!("  -M TYPE Modify email warning behavior: once, always, daily,");
    println!("          diminishing, test, exec PATH");
    println!("  -p      Report changes in 'Prefailure' Attributes");
    println!("  -u      Report changes in 'Usage' Attributes");
    println!("  -t      Equivalent to -p and -u Directives");
    println!("  -r ID   Also report Raw values of Attribute ID with -p, -u or -t");
    println!("  -R ID   Track changes in Attribute ID Raw value with -p, -u or -t");
    println!("  -i ID   Ignore Attribute ID for -f Directive");
    println!("  -I ID   Ignore Attribute ID for -p, -u or -t Directive");
    println!("  -C ID[+] Monitor [increases of] Current Pending Sectors in Attribute ID");
    println!("  -U ID[+] Monitor [increases of] Offline Uncorrectable Sectors in Attribute ID");
    println!("  -W D,I,C Monitor Temperature D)ifference, I)nformal limit, C)ritical limit");
    println!("  -v N,SPEC Modifies labeling of Attribute N");
    println!("  -P TYPE Drive-specific presets: use, ignore, show, showall");
    println!("  -F TYPE Use firmware bug workaround");
    println!("  -c i=N  Set individual check interval to N seconds");
    println!("  -a      Default: equivalent to -H -f -t -l error -l selftest -l selfteststs");
    println!("   #      Comment: text after a hash sign is ignored");
    println!("   \\      Line continuation character");
    println!("Attribute ID is a decimal integer 1 <= ID <= 255");
    println!("All but -d, -m and -M Directives are only implemented for ATA/SATA devices");
}

fn badcmd(msg: &str) -> i32 {
    eprintln!("diskwatchd: {msg}");
    eprintln!("Use diskwatchd -h to get a usage summary");
    EXIT_BADCMD
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if e.use_stderr() => {
            // Command line did not parse
            let _ = e.print();
            return EXIT_BADCMD;
        }
        Err(e) => {
            // --help / --version
            let _ = e.print();
            return 0;
        }
    };

    // Logging goes through tracing; debug mode raises the default level
    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.showdirectives {
        print_directives();
        return 0;
    }

    if args.interval < 10 {
        return badcmd(&format!(
            "invalid interval: {}; must be at least 10 seconds",
            args.interval
        ));
    }

    if !matches!(
        args.logfacility.as_str(),
        "daemon" | "local0" | "local1" | "local2" | "local3" | "local4" | "local5" | "local6"
            | "local7"
    ) {
        return badcmd(&format!("invalid log facility: {}", args.logfacility));
    }

    for report in &args.report {
        match parse_report(report) {
            Some((kind, level)) => {
                info!("Transport report level for {kind} set to {level}")
            }
            None => return badcmd(&format!("invalid argument to -r: {report}")),
        }
    }

    let Some((quit, quit_nodev0)) = parse_quit(&args.quit) else {
        return badcmd(&format!("invalid argument to -q: {}", args.quit));
    };
    let debug = args.debug || matches!(quit, QuitPolicy::OneCheck | QuitPolicy::ShowTests);

    let warn_as = match &args.warn_as_user {
        None => None,
        Some(spec) => match parse_warn_as(spec) {
            Some(parsed) => parsed,
            None => {
                return badcmd(&format!(
                    "invalid argument to -u: {spec}; expected numeric UID[:GID] or '-'"
                ))
            }
        },
    };

    if args.no_fork {
        // The daemon always runs in the foreground for its service
        // manager; the flag is accepted for unit-file compatibility
        debug!("running in foreground");
    }

    if let Some(db) = &args.drivedb {
        // The presets database and its updater are a separate tool set
        warn!(
            "drive presets database {} not loaded: database support is not built in",
            db.trim_start_matches('+')
        );
    }

    if args.pidfile.is_some() && debug {
        return badcmd("pid file not written in debug (-d) mode");
    }

    if !debug {
        // chdir-to-root semantics of classic daemons: relative paths
        // would silently land elsewhere
        for (flag, path) in [
            ('p', args.pidfile.as_ref().map(|p| p.to_string_lossy().to_string())),
            ('s', args.savestates.clone()),
            ('A', args.attributelog.clone()),
        ] {
            if let Some(path) = path {
                if !(path.is_empty() || path == "-" || path.starts_with('/')) {
                    return badcmd(&format!(
                        "invalid argument to -{flag}: {path}; relative path names are not allowed"
                    ));
                }
            }
        }
    }

    let config = match args.configfile.as_deref() {
        None => ConfigSource::DefaultFile(PathBuf::from(DEFAULT_CONFIG)),
        Some("-") => ConfigSource::Stdin,
        Some(path) => ConfigSource::File(PathBuf::from(path)),
    };

    let none_if_dash = |prefix: Option<String>| prefix.filter(|p| p != "-");
    let opts = Options {
        config,
        state_prefix: none_if_dash(args.savestates),
        attrlog_prefix: none_if_dash(args.attributelog),
        interval: args.interval,
        debug,
        pid_file: args.pidfile,
        quit,
        quit_nodev0,
        warn_script: args.warnexec,
        warn_as,
    };

    let factory = UnlinkedFactory;
    Supervisor::new(opts, &factory).run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_report() {
        assert_eq!(parse_report("ioctl"), Some(("ioctl", 1)));
        assert_eq!(parse_report("ataioctl,2"), Some(("ataioctl", 2)));
        assert_eq!(parse_report("nvmeioctl,4"), Some(("nvmeioctl", 4)));
        assert_eq!(parse_report("ioctl,5"), None);
        assert_eq!(parse_report("ioctls"), None);
    }

    #[test]
    fn test_parse_warn_as() {
        assert_eq!(parse_warn_as("-"), Some(None));
        assert_eq!(parse_warn_as("1000"), Some(Some((1000, 1000))));
        assert_eq!(parse_warn_as("1000:100"), Some(Some((1000, 100))));
        assert_eq!(parse_warn_as("nobody"), None);
    }

    #[test]
    fn test_cli_parses_short_flags() {
        let args = Args::try_parse_from([
            "diskwatchd",
            "-c",
            "/etc/alt.conf",
            "-i",
            "600",
            "-q",
            "never",
            "-s",
            "/var/lib/diskwatchd/",
            "-A",
            "/var/log/diskwatchd/",
            "-d",
        ])
        .unwrap();
        assert_eq!(args.configfile.as_deref(), Some("/etc/alt.conf"));
        assert_eq!(args.interval, 600);
        assert_eq!(args.quit, "never");
        assert!(args.debug);
    }

    #[test]
    fn test_cli_rejects_unknown_flag() {
        assert!(Args::try_parse_from(["diskwatchd", "-Z"]).is_err());
    }
}
