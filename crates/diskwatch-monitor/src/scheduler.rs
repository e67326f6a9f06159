//! Self-test scheduler
//!
//! Each device owns a regular expression matched against the canonical
//! pattern `T/MM/DD/d/HH[:OOO[-LLL]]`, where `T` is the test type,
//! `MM`/`DD`/`d`/`HH` are month, day-of-month, weekday (1 = Monday) and
//! hour, and `:OOO` is a per-device staggered offset in hours with an
//! optional `-LLL` wrap limit. Evaluation walks hour by hour from the
//! stored watermark up to the present and picks the highest-priority
//! matching test.

use crate::config::TestRegex;
use chrono::{DateTime, Datelike, Local, TimeZone, Timelike};
use tracing::info;

/// Test types in priority order: long, selective (next/continue/redo),
/// short, conveyance, offline-immediate.
pub const TEST_TYPE_CHARS: [char; 7] = ['L', 'n', 'c', 'r', 'S', 'C', 'O'];

/// Which self-test kinds the device is capable of.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestCaps {
    pub offline: bool,
    pub short: bool,
    pub long: bool,
    pub conveyance: bool,
    pub selective: bool,
}

impl TestCaps {
    #[must_use]
    pub fn any(&self) -> bool {
        self.offline || self.short || self.long || self.conveyance || self.selective
    }

    #[must_use]
    fn supports(&self, test_char: char) -> bool {
        match test_char {
            'L' => self.long,
            'S' => self.short,
            'C' => self.conveyance,
            'O' => self.offline,
            'n' | 'c' | 'r' => self.selective,
            _ => false,
        }
    }
}

/// Inputs for one scheduling decision.
pub struct ScheduleInput<'a> {
    pub regex: &'a TestRegex,
    /// Factor multiplied into each `:OOO` offset for staggering.
    pub offset_factor: u32,
    pub caps: TestCaps,
}

fn local(t: i64) -> DateTime<Local> {
    Local
        .timestamp_opt(t, 0)
        .single()
        .unwrap_or_else(|| Local.timestamp_opt(0, 0).unwrap())
}

/// Extract `:OOO[-LLL]` offset/limit pairs from the schedule pattern.
/// The implicit zero offset is always first.
fn schedule_offsets(pattern: &str) -> Vec<(u32, u32)> {
    let mut offsets = vec![(0u32, 0u32)];
    let bytes = pattern.as_bytes();
    let mut i = 0;
    while let Some(pos) = pattern[i..].find(':') {
        i += pos + 1;
        if offsets.len() > TEST_TYPE_CHARS.len() {
            break;
        }
        let digits: String = pattern[i..].chars().take_while(char::is_ascii_digit).collect();
        if digits.len() != 3 {
            continue;
        }
        let offset: u32 = digits.parse().unwrap_or(0);
        let mut limit = 0u32;
        let rest = &bytes[i + 3..];
        if rest.first() == Some(&b'-') {
            let limit_digits: String = pattern[i + 4..]
                .chars()
                .take_while(char::is_ascii_digit)
                .collect();
            if limit_digits.len() == 3 {
                limit = limit_digits.parse().unwrap_or(0);
                if limit == 0 {
                    continue;
                }
            }
        }
        offsets.push((offset, limit));
    }
    offsets
}

/// Decide whether a self-test is due. Walks the interval
/// `[watermark, now]` one hour at a time, advances the watermark to the
/// next hour boundary, and returns the chosen test type, if any.
/// Deterministic for a fixed (regex, factor, clock) triple.
pub fn next_scheduled_test(
    name: &str,
    input: &ScheduleInput<'_>,
    watermark: &mut i64,
    now: i64,
    forecast: bool,
) -> Option<char> {
    if !input.caps.any() {
        return None;
    }

    if now < *watermark {
        if *watermark <= now + 3600 {
            return None; // next check within one hour
        }
        // More than one hour ahead: clock was adjusted to the past
        *watermark = now;
    } else if *watermark + 3600 * 24 * 90 < now {
        // Limit the check interval to 90 days
        *watermark = now - 3600 * 24 * 90;
    }

    let offsets = schedule_offsets(input.regex.pattern());

    let mut testtype: Option<char> = None;
    let mut testtime = 0i64;
    let mut maxtest = TEST_TYPE_CHARS.len() as i32 - 1;

    let mut t = *watermark;
    loop {
        for (i, (offset, limit)) in offsets.iter().enumerate() {
            let mut delay = u64::from(input.offset_factor) * u64::from(*offset);
            if *limit > 0 && u64::from(*limit) < delay {
                delay %= u64::from(*limit) + 1;
            }
            let tm = local(t - delay as i64 * 3600);
            let weekday = tm.weekday().number_from_monday();

            for j in 0..=maxtest {
                let test_char = TEST_TYPE_CHARS[j as usize];
                if !input.caps.supports(test_char) {
                    continue;
                }
                let mut pattern = format!(
                    "{}/{:02}/{:02}/{}/{:02}",
                    test_char,
                    tm.month(),
                    tm.day(),
                    weekday,
                    tm.hour()
                );
                if i > 0 {
                    pattern.push_str(&format!(":{offset:03}"));
                    if *limit > 0 {
                        pattern.push_str(&format!("-{limit:03}"));
                    }
                }
                if input.regex.full_match(&pattern) {
                    testtype = Some(test_char);
                    testtime = t;
                    // Limit further matches to higher priority tests
                    maxtest = j - 1;
                    break;
                }
            }
        }

        if maxtest < 0 || t >= now {
            break;
        }
        t += 3600;
        if t > now {
            t = now;
        }
    }

    // Do the next check not before the next hour boundary
    let tm_now = local(now);
    *watermark = now + 3600 - i64::from(tm_now.minute()) * 60 - i64::from(tm_now.second());

    if let Some(test_char) = testtype {
        if !forecast && testtime / 3600 < now / 3600 {
            info!(
                "Device: {name}, old test of type {test_char} not run at {}, starting now.",
                local(testtime).format("%Y-%m-%d %H:%M:%S %Z")
            );
        }
    }

    testtype
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TestRegex;

    fn all_caps() -> TestCaps {
        TestCaps {
            offline: true,
            short: true,
            long: true,
            conveyance: true,
            selective: true,
        }
    }

    fn epoch(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        Local
            .with_ymd_and_hms(y, mo, d, h, mi, s)
            .unwrap()
            .timestamp()
    }

    fn input(pattern: &str, factor: u32) -> (TestRegex, u32) {
        (TestRegex::compile(pattern).unwrap(), factor)
    }

    fn run(
        pattern: &str,
        factor: u32,
        caps: TestCaps,
        watermark: &mut i64,
        now: i64,
    ) -> Option<char> {
        let (regex, offset_factor) = input(pattern, factor);
        let sched = ScheduleInput {
            regex: &regex,
            offset_factor,
            caps,
        };
        next_scheduled_test("/dev/sda", &sched, watermark, now, true)
    }

    #[test]
    fn test_sunday_long_test() {
        // 2025-08-03 is a Sunday; the watermark sits at 01:00 and the
        // clock at 02:17. The long test scheduled for hour 02 fires.
        let mut watermark = epoch(2025, 8, 3, 1, 0, 0);
        let now = epoch(2025, 8, 3, 2, 17, 0);
        let result = run("L/../../7/02", 0, all_caps(), &mut watermark, now);
        assert_eq!(result, Some('L'));
        // Watermark advanced to the next hour boundary
        assert_eq!(watermark, epoch(2025, 8, 3, 3, 0, 0));
    }

    #[test]
    fn test_not_sunday() {
        // 2025-08-04 is a Monday
        let mut watermark = epoch(2025, 8, 4, 1, 0, 0);
        let now = epoch(2025, 8, 4, 2, 17, 0);
        assert_eq!(run("L/../../7/02", 0, all_caps(), &mut watermark, now), None);
    }

    #[test]
    fn test_priority_order() {
        // Both L and S match hour 02: the long test wins
        let mut watermark = epoch(2025, 8, 3, 1, 30, 0);
        let now = epoch(2025, 8, 3, 2, 10, 0);
        let result = run("(L|S)/../.././02", 0, all_caps(), &mut watermark, now);
        assert_eq!(result, Some('L'));
    }

    #[test]
    fn test_capability_masking() {
        // The drive cannot run long tests, so the short test is chosen
        let mut watermark = epoch(2025, 8, 3, 1, 30, 0);
        let now = epoch(2025, 8, 3, 2, 10, 0);
        let caps = TestCaps {
            short: true,
            ..Default::default()
        };
        let result = run("(L|S)/../.././02", 0, caps, &mut watermark, now);
        assert_eq!(result, Some('S'));
    }

    #[test]
    fn test_determinism() {
        let now = epoch(2025, 8, 3, 2, 17, 0);
        let start = epoch(2025, 8, 3, 1, 0, 0);
        let mut w1 = start;
        let mut w2 = start;
        let r1 = run("(L|S|C)/../.././02", 3, all_caps(), &mut w1, now);
        let r2 = run("(L|S|C)/../.././02", 3, all_caps(), &mut w2, now);
        assert_eq!(r1, r2);
        assert_eq!(w1, w2);
    }

    #[test]
    fn test_no_capability_no_test() {
        let mut watermark = epoch(2025, 8, 3, 1, 0, 0);
        let now = epoch(2025, 8, 3, 2, 17, 0);
        assert_eq!(
            run("L/../../7/02", 0, TestCaps::default(), &mut watermark, now),
            None
        );
        // Watermark untouched when nothing is capable
        assert_eq!(watermark, epoch(2025, 8, 3, 1, 0, 0));
    }

    #[test]
    fn test_staggered_offset() {
        // ':024' delays by offset_factor * 24 hours. With factor 1, the
        // hour-10 slot named for Saturday fires on Sunday at hour 10.
        let mut watermark = epoch(2025, 8, 3, 9, 30, 0);
        let now = epoch(2025, 8, 3, 10, 10, 0);
        let result = run("S/08/02/./10:024", 1, all_caps(), &mut watermark, now);
        assert_eq!(result, Some('S'));

        // With factor 0 the delay collapses to zero: the pattern names
        // Saturday, the clock says Sunday, nothing fires.
        let mut watermark = epoch(2025, 8, 3, 9, 30, 0);
        let result = run("S/08/02/./10:024", 0, all_caps(), &mut watermark, now);
        assert_eq!(result, None);
    }

    #[test]
    fn test_backward_clock_jump() {
        // Watermark far in the future: clock went backward, snap to now
        let now = epoch(2025, 8, 3, 2, 17, 0);
        let mut watermark = now + 7200;
        let result = run("L/../../7/02", 0, all_caps(), &mut watermark, now);
        assert_eq!(result, Some('L'));
    }

    #[test]
    fn test_small_future_watermark_waits() {
        let now = epoch(2025, 8, 3, 2, 17, 0);
        let mut watermark = now + 1800;
        assert_eq!(run("L/../../7/02", 0, all_caps(), &mut watermark, now), None);
        assert_eq!(watermark, now + 1800);
    }

    #[test]
    fn test_forward_clamp_90_days() {
        let now = epoch(2025, 8, 3, 2, 17, 0);
        let mut watermark = now - 3600 * 24 * 200;
        // A daily short test at hour 02 fires once per walked day; the
        // walk is clamped to the last 90 days.
        let result = run("S/../.././02", 0, all_caps(), &mut watermark, now);
        assert_eq!(result, Some('S'));
    }

    #[test]
    fn test_offsets_parsing() {
        assert_eq!(schedule_offsets("L/../../7/02"), vec![(0, 0)]);
        assert_eq!(
            schedule_offsets("L/../../7/02:003"),
            vec![(0, 0), (3, 0)]
        );
        assert_eq!(
            schedule_offsets("(L/../../7/02:010-167|S/../.././01:002)"),
            vec![(0, 0), (10, 167), (2, 0)]
        );
        // Malformed suffixes are ignored
        assert_eq!(schedule_offsets("L/../../7/02:12"), vec![(0, 0)]);
    }
}
