//! Warning pipeline
//!
//! Rate-limited dispatch of warning messages through an external
//! script. Each device carries one throttle record per warning type in
//! its persistent state; the record only advances when a dispatch is
//! actually attempted, and is reset when the triggering condition
//! clears.

use crate::config::{DevConfig, EmailFreq};
use crate::state::DevState;
use chrono::{Local, TimeZone, Utc};
use diskwatch_common::WarnType;
use std::path::PathBuf;
use std::process::Stdio;
use tracing::{debug, error, info};

/// Most output bytes from a warning child that get logged.
const MAX_CHILD_OUTPUT: usize = 1024 * 1024;

/// Current and next reminder intervals in days for a throttled type:
/// `days` gates this dispatch, `nextdays` is exported to the script.
/// Negative means "never again".
fn reminder_days(freq: EmailFreq, which: WarnType, count: u32) -> (i64, i64) {
    if which == WarnType::EmailTest {
        return (-1, -1);
    }
    match freq {
        EmailFreq::Once => (-1, -1),
        EmailFreq::Always => (0, 0),
        EmailFreq::Daily => (1, 1),
        EmailFreq::Diminishing => {
            // count 0, 1, 2, 3, 4, 5, 6, ... => next gap 1, 2, 4, 8, 16, 32, 32, ...
            let nextdays = 1i64 << count.min(5);
            let days = if count <= 5 { nextdays >> 1 } else { nextdays };
            (days, nextdays)
        }
        EmailFreq::Unknown => (-1, -1),
    }
}

/// Whether a warning of this type may be dispatched now.
fn throttle_allows(freq: EmailFreq, which: WarnType, state: &DevState, now: i64) -> Option<i64> {
    let record = &state.persist.mail[which.index()];
    let (days, nextdays) = reminder_days(freq, which, record.count);
    if record.count > 0 {
        if days < 0 {
            return None; // once, or test mail
        }
        if days > 0 && now < record.last_sent + days * 24 * 3600 {
            return None; // too early for a reminder
        }
    }
    Some(nextdays)
}

/// Dispatches warnings by spawning the configured warning script.
pub struct Warner {
    script: PathBuf,
    /// Drop the child to this uid/gid before exec.
    run_as: Option<(u32, u32)>,
}

impl Warner {
    #[must_use]
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Warner {
            script: script.into(),
            run_as: None,
        }
    }

    /// Run warning children as a non-privileged user.
    #[must_use]
    pub fn run_as(mut self, uid: u32, gid: u32) -> Self {
        self.run_as = Some((uid, gid));
        self
    }

    /// Send a warning of the given type if the per-device destination
    /// and throttle allow it. Mutates the throttle record on attempt.
    pub async fn warn(
        &self,
        cfg: &DevConfig,
        state: &mut DevState,
        which: WarnType,
        message: &str,
    ) {
        self.warn_at(Utc::now().timestamp(), cfg, state, which, message)
            .await;
    }

    /// `warn` with an explicit clock, for tests.
    pub async fn warn_at(
        &self,
        now: i64,
        cfg: &DevConfig,
        state: &mut DevState,
        which: WarnType,
        message: &str,
    ) {
        // Does the user want warnings at all?
        if !cfg.warns() {
            return;
        }

        let Some(nextdays) = throttle_allows(cfg.emailfreq, which, state, now) else {
            return;
        };

        if !self.script.exists() {
            debug!(
                "Device: {}, warning script {} not present, skipping dispatch",
                cfg.name,
                self.script.display()
            );
            return;
        }

        {
            let record = &mut state.persist.mail[which.index()];
            if record.count == 0 {
                record.first_sent = now;
            }
            record.last_sent = now;
        }
        let record = state.persist.mail[which.index()];

        let executable = if cfg.emailcmdline.is_empty() {
            "<mail>"
        } else {
            &cfg.emailcmdline
        };
        // Commas separate recipients for the script's mailer
        let address = cfg.emailaddress.replace(',', " ");
        let to = if address.is_empty() {
            "<nomailer>".to_string()
        } else {
            address.clone()
        };
        let verb = if which == WarnType::EmailTest {
            "Executing test of"
        } else {
            "Sending warning via"
        };
        info!("{verb} {executable} to {to} ...");

        let first_sent_text = Local
            .timestamp_opt(record.first_sent, 0)
            .single()
            .map(|t| t.format("%a %b %e %H:%M:%S %Y %Z").to_string())
            .unwrap_or_default();
        let nextdays_text = if nextdays >= 0 {
            nextdays.to_string()
        } else {
            String::new()
        };
        let dev_type = if cfg.dev_type.is_empty() {
            "auto"
        } else {
            &cfg.dev_type
        };

        let mut command = tokio::process::Command::new(&self.script);
        #[cfg(unix)]
        if let Some((uid, gid)) = self.run_as {
            command.uid(uid).gid(gid);
        }
        let child = command
            .env("SMARTD_MAILER", &cfg.emailcmdline)
            .env("SMARTD_MESSAGE", message)
            .env("SMARTD_PREVCNT", record.count.to_string())
            .env("SMARTD_TFIRST", first_sent_text)
            .env("SMARTD_TFIRSTEPOCH", record.first_sent.to_string())
            .env("SMARTD_FAILTYPE", which.as_str())
            .env("SMARTD_ADDRESS", &address)
            .env("SMARTD_DEVICESTRING", &cfg.name)
            .env("SMARTD_DEVICETYPE", dev_type)
            .env("SMARTD_DEVICE", &cfg.dev_name)
            .env("SMARTD_DEVICEINFO", &cfg.dev_idinfo)
            .env("SMARTD_NEXTDAYS", nextdays_text)
            // Avoid false positive recursion detection in the script
            .env("SMARTD_SUBJECT", "")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        match child {
            Err(e) => {
                error!("{verb} {executable} to {to}: failed to execute: {e}");
            }
            Ok(child) => match child.wait_with_output().await {
                Err(e) => {
                    error!("{verb} {executable} to {to}: wait failed: {e}");
                }
                Ok(output) => {
                    let mut combined = output.stdout;
                    combined.extend_from_slice(&output.stderr);
                    if !combined.is_empty() {
                        let truncated = combined.len() > MAX_CHILD_OUTPUT;
                        combined.truncate(MAX_CHILD_OUTPUT);
                        error!(
                            "{verb} {executable} to {to} produced unexpected output ({}{} bytes) to STDOUT/STDERR:\n{}",
                            if truncated { "here truncated to " } else { "" },
                            combined.len(),
                            String::from_utf8_lossy(&combined)
                        );
                    }
                    log_exit_status(verb, executable, &to, &output.status);
                }
            },
        }

        // The dispatch attempt counts against the throttle either way
        state.persist.mail[which.index()].count += 1;
        if which.is_persistent() {
            state.temp.must_write = true;
        }
    }

    /// Clear the throttle record when a warning condition no longer
    /// holds, so a recurrence warns again immediately.
    pub fn reset(&self, cfg: &DevConfig, state: &mut DevState, which: WarnType, reason: &str) {
        let record = &mut state.persist.mail[which.index()];
        if record.count == 0 {
            return;
        }
        info!(
            "Device: {}, {}, warning condition reset after {} message{}",
            cfg.name,
            reason,
            record.count,
            if record.count == 1 { "" } else { "s" }
        );
        *record = Default::default();
        state.temp.must_write = true;
    }
}

fn log_exit_status(verb: &str, executable: &str, to: &str, status: &std::process::ExitStatus) {
    match status.code() {
        Some(0) => info!("{verb} {executable} to {to}: successful"),
        Some(code) if code > 128 => error!(
            "{verb} {executable} to {to}: failed (exit status: {code}) perhaps caught signal {}",
            code - 128
        ),
        Some(code) => error!("{verb} {executable} to {to}: failed (exit status: {code})"),
        None => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                if let Some(signal) = status.signal() {
                    info!(
                        "{verb} {executable} to {to}: exited because of uncaught signal {signal}"
                    );
                    return;
                }
            }
            error!("{verb} {executable} to {to}: terminated abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ThrottleRecord;

    const DAY: i64 = 24 * 3600;

    fn cfg(freq: EmailFreq) -> DevConfig {
        DevConfig {
            name: "/dev/sda".into(),
            dev_name: "/dev/sda".into(),
            emailaddress: "root@localhost".into(),
            emailfreq: freq,
            ..Default::default()
        }
    }

    fn state_with(count: u32, last_sent: i64) -> DevState {
        let mut state = DevState::default();
        state.persist.mail[WarnType::Usage.index()] = ThrottleRecord {
            count,
            first_sent: 1000,
            last_sent,
        };
        state
    }

    #[test]
    fn test_once_allows_first_only() {
        let state = DevState::default();
        assert!(throttle_allows(EmailFreq::Once, WarnType::Usage, &state, 5000).is_some());
        let state = state_with(1, 1000);
        assert!(throttle_allows(EmailFreq::Once, WarnType::Usage, &state, 5000).is_none());
    }

    #[test]
    fn test_always_allows_every_time() {
        let state = state_with(10, 4999);
        assert!(throttle_allows(EmailFreq::Always, WarnType::Usage, &state, 5000).is_some());
    }

    #[test]
    fn test_daily_gate() {
        let state = state_with(1, 1000);
        assert!(throttle_allows(EmailFreq::Daily, WarnType::Usage, &state, 1000 + DAY - 1).is_none());
        assert!(throttle_allows(EmailFreq::Daily, WarnType::Usage, &state, 1000 + DAY).is_some());
    }

    #[test]
    fn test_diminishing_gaps() {
        // After the n-th dispatch the next is allowed after
        // 2^min(n-1,5) days: 1, 2, 4, 8, 16, 32, 32, ...
        for (count, gap_days) in [(1u32, 1i64), (2, 2), (3, 4), (4, 8), (5, 16), (6, 32), (9, 32)]
        {
            let state = state_with(count, 1000);
            let early = 1000 + gap_days * DAY - 1;
            let on_time = 1000 + gap_days * DAY;
            assert!(
                throttle_allows(EmailFreq::Diminishing, WarnType::Usage, &state, early).is_none(),
                "count {count} should be throttled before {gap_days} days"
            );
            assert!(
                throttle_allows(EmailFreq::Diminishing, WarnType::Usage, &state, on_time)
                    .is_some(),
                "count {count} should pass at {gap_days} days"
            );
        }
    }

    #[test]
    fn test_test_mail_sent_once() {
        let mut state = DevState::default();
        assert!(throttle_allows(EmailFreq::Daily, WarnType::EmailTest, &state, 1000).is_some());
        state.persist.mail[WarnType::EmailTest.index()].count = 1;
        assert!(throttle_allows(EmailFreq::Daily, WarnType::EmailTest, &state, 99_000).is_none());
    }

    #[test]
    fn test_nextdays_exported_value() {
        let state = state_with(2, 0);
        assert_eq!(
            throttle_allows(EmailFreq::Diminishing, WarnType::Usage, &state, DAY * 40),
            Some(4)
        );
        let state = DevState::default();
        assert_eq!(
            throttle_allows(EmailFreq::Always, WarnType::Usage, &state, 0),
            Some(0)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dispatch_runs_script_with_environment() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("captured");
        let script_path = dir.path().join("warn.sh");
        {
            let mut script = std::fs::File::create(&script_path).unwrap();
            writeln!(
                script,
                "#!/bin/sh\necho \"$SMARTD_FAILTYPE $SMARTD_PREVCNT $SMARTD_ADDRESS\" > {}",
                out_path.display()
            )
            .unwrap();
            script
                .set_permissions(std::fs::Permissions::from_mode(0o755))
                .unwrap();
        }

        let warner = Warner::new(&script_path);
        let cfg = DevConfig {
            emailaddress: "a@x,b@y".into(),
            ..cfg(EmailFreq::Always)
        };
        let mut state = DevState::default();

        warner
            .warn_at(10_000, &cfg, &mut state, WarnType::Health, "failing")
            .await;

        let captured = std::fs::read_to_string(&out_path).unwrap();
        assert_eq!(captured.trim(), "Health 0 a@x b@y");
        let record = state.persist.mail[WarnType::Health.index()];
        assert_eq!(record.count, 1);
        assert_eq!(record.first_sent, 10_000);
        assert_eq!(record.last_sent, 10_000);
        assert!(state.temp.must_write);

        // Second dispatch advances last-sent but not first-sent
        warner
            .warn_at(20_000, &cfg, &mut state, WarnType::Health, "failing")
            .await;
        let record = state.persist.mail[WarnType::Health.index()];
        assert_eq!(record.count, 2);
        assert_eq!(record.first_sent, 10_000);
        assert_eq!(record.last_sent, 20_000);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_script_skips_silently() {
        let warner = Warner::new("/nonexistent/warn.sh");
        let cfg = cfg(EmailFreq::Always);
        let mut state = DevState::default();
        warner
            .warn_at(10_000, &cfg, &mut state, WarnType::Health, "failing")
            .await;
        // No attempt: counter untouched
        assert_eq!(state.persist.mail[WarnType::Health.index()].count, 0);
    }

    #[tokio::test]
    async fn test_no_destination_no_dispatch() {
        let warner = Warner::new("/bin/true");
        let cfg = DevConfig::default();
        let mut state = DevState::default();
        warner
            .warn_at(10_000, &cfg, &mut state, WarnType::Health, "failing")
            .await;
        assert_eq!(state.persist.mail[WarnType::Health.index()].count, 0);
    }

    #[test]
    fn test_reset_clears_record() {
        let warner = Warner::new("/bin/true");
        let cfg = cfg(EmailFreq::Daily);
        let mut state = state_with(3, 5000);
        warner.reset(&cfg, &mut state, WarnType::Usage, "condition cleared");
        assert_eq!(
            state.persist.mail[WarnType::Usage.index()],
            ThrottleRecord::default()
        );
        assert!(state.temp.must_write);

        // Resetting an empty record is a no-op
        let mut state = DevState::default();
        warner.reset(&cfg, &mut state, WarnType::Usage, "nothing");
        assert!(!state.temp.must_write);
    }
}
