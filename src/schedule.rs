//! Crontab-style schedule parsing and next-run calculation (§4.1).
//!
//! Grounded directly in `original_source/src/cron/Schedule.cxx`: the same
//! five range-bitsets (minute/hour/day-of-month/month/day-of-week), the same
//! macro table, and the same `Next()` algorithm. `Next()` is deliberately
//! timezone-naive — per `CalculateNextRun.cxx`, the `AT TIME ZONE` rotation
//! into a job's configured wall-clock happens in SQL (`db/cron.rs`); this
//! module only ever sees wall-clock `NaiveDateTime`s.

use chrono::{Datelike, Duration as ChronoDuration, NaiveDateTime, Timelike};
use std::time::Duration;

use crate::error::{Error, ScheduleError};

/// A closed `[min, max]` range of valid values with a bit per value.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RangeBitSet {
    min: u32,
    max: u32,
    bits: Vec<bool>,
}

impl RangeBitSet {
    fn new(min: u32, max: u32) -> Self {
        Self {
            min,
            max,
            bits: vec![false; (max - min + 1) as usize],
        }
    }

    fn set(&mut self, value: u32, state: bool) {
        self.bits[(value - self.min) as usize] = state;
    }

    fn get(&self, value: u32) -> bool {
        if value < self.min || value > self.max {
            return false;
        }
        self.bits[(value - self.min) as usize]
    }

    fn none(&self) -> bool {
        self.bits.iter().all(|b| !b)
    }

    /// Mirrors `original_source`'s `NextBit`: the next set bit strictly
    /// after `pos`, wrapping around to the start of the range; `pos`
    /// itself if nothing else is set.
    fn next_bit(&self, pos: u32) -> u32 {
        for i in (pos + 1)..=self.max {
            if self.get(i) {
                return i;
            }
        }
        for i in self.min..pos {
            if self.get(i) {
                return i;
            }
        }
        pos
    }
}

/// A parsed crontab-style schedule.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    minutes: RangeBitSet,
    hours: RangeBitSet,
    days_of_month: RangeBitSet,
    months: RangeBitSet,
    days_of_week: RangeBitSet,

    /// Maximum random jitter to apply on top of the computed next-run time
    /// (§4.1, §A.5 macro table; `@once` forces this to zero).
    pub delay_range: Duration,
}

/// Mirrors `original_source`'s `CronSchedule::operator==`: two schedules are
/// equal when they select the same run times, regardless of `delay_range`
/// (macro expansions and their spelled-out equivalents differ only in
/// jitter, per §4.1's macro table).
impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.minutes == other.minutes
            && self.hours == other.hours
            && self.days_of_month == other.days_of_month
            && self.months == other.months
            && self.days_of_week == other.days_of_week
    }
}

impl Eq for CronSchedule {}

/// Result of [`CronSchedule::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextRun {
    /// Run at this wall-clock time (may be in the past: run immediately).
    At(NaiveDateTime),
    /// Never run again (an `@once` job that already ran).
    Never,
}

struct SpecialSchedule {
    name: &'static str,
    regular: &'static str,
    delay_range: Duration,
}

const SPECIAL_SCHEDULES: &[SpecialSchedule] = &[
    SpecialSchedule { name: "yearly", regular: "0 0 1 1 *", delay_range: Duration::from_secs(24 * 365 * 3600) },
    SpecialSchedule { name: "annually", regular: "0 0 1 1 *", delay_range: Duration::from_secs(24 * 365 * 3600) },
    SpecialSchedule { name: "monthly", regular: "0 0 1 * *", delay_range: Duration::from_secs(24 * 28 * 3600) },
    SpecialSchedule { name: "weekly", regular: "0 0 * * 0", delay_range: Duration::from_secs(24 * 7 * 3600) },
    SpecialSchedule { name: "daily", regular: "0 0 * * *", delay_range: Duration::from_secs(24 * 3600) },
    SpecialSchedule { name: "midnight", regular: "0 0 * * *", delay_range: Duration::from_secs(3600) },
    SpecialSchedule { name: "hourly", regular: "0 * * * *", delay_range: Duration::from_secs(3600) },
];

const MONTH_NAMES: &[(&str, u32)] = &[
    ("jan", 1), ("feb", 2), ("mar", 3), ("apr", 4), ("may", 5), ("jun", 6),
    ("jul", 7), ("aug", 8), ("sep", 9), ("oct", 10), ("nov", 11), ("dec", 12),
];

/// `mon=1 .. sun=7`, per B.3: folded into the `0..6` `Sunday=0` convention
/// after parsing.
const WEEKDAY_NAMES: &[(&str, u32)] = &[
    ("mon", 1), ("tue", 2), ("wed", 3), ("thu", 4), ("fri", 5), ("sat", 6), ("sun", 7),
];

fn invalid(source: &str, reason: &str) -> Error {
    ScheduleError::InvalidSchedule {
        source: source.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(s: &'a str) -> Self {
        Self { rest: s }
    }

    fn strip_leading_ws(&mut self) {
        self.rest = self.rest.trim_start_matches(' ');
    }

    fn peek(&self) -> Option<char> {
        self.rest.chars().next()
    }

    fn advance(&mut self, n: usize) {
        self.rest = &self.rest[n..];
    }

    fn parse_number(&mut self, min: u32, max: u32, dict: Option<&[(&str, u32)]>) -> Result<u32, &'static str> {
        let digits = self.rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits > 0 {
            let (num, rest) = self.rest.split_at(digits);
            let value: u64 = num.parse().map_err(|_| "number too large to parse")?;
            self.rest = rest;
            if value < min as u64 {
                return Err("number is too small");
            }
            if value > max as u64 {
                return Err("number is too large");
            }
            return Ok(value as u32);
        }

        if let Some(dict) = dict {
            for (name, value) in dict {
                if self.rest.len() >= name.len() && self.rest[..name.len()].eq_ignore_ascii_case(name) {
                    self.rest = &self.rest[name.len()..];
                    return Ok(*value);
                }
            }
        }

        Err("failed to parse number")
    }
}

fn parse_numeric_range_bitset(
    bitset: &mut RangeBitSet,
    cursor: &mut Cursor,
    dict: Option<&[(&str, u32)]>,
) -> Result<(), &'static str> {
    let (first, last) = if cursor.peek() == Some('*') {
        cursor.advance(1);
        (bitset.min, bitset.max)
    } else {
        let first = cursor.parse_number(bitset.min, bitset.max, dict)?;
        if cursor.peek() == Some('-') {
            cursor.advance(1);
            let last = cursor.parse_number(bitset.min, bitset.max, dict)?;
            if last < first {
                return Err("malformed range");
            }
            (first, last)
        } else {
            (first, first)
        }
    };

    let step = if cursor.peek() == Some('/') {
        cursor.advance(1);
        cursor.parse_number(1, bitset.max, dict)?
    } else {
        1
    };

    let mut i = first;
    while i <= last {
        bitset.set(i, true);
        i += step;
    }
    Ok(())
}

fn parse_numeric_bitset(
    bitset: &mut RangeBitSet,
    cursor: &mut Cursor,
    dict: Option<&[(&str, u32)]>,
) -> Result<(), &'static str> {
    cursor.strip_leading_ws();
    loop {
        parse_numeric_range_bitset(bitset, cursor, dict)?;
        if cursor.peek() != Some(',') {
            break;
        }
        cursor.advance(1);
    }
    Ok(())
}

impl CronSchedule {
    /// Parses a crontab(5)-style schedule, including the `@yearly` /
    /// `@monthly` / `@weekly` / `@daily` / `@midnight` / `@hourly` / `@once`
    /// macros and the `*/N` minute-interval jitter shortcut (§4.1).
    pub fn parse(s: &str) -> Result<Self, Error> {
        let mut delay_range = Duration::from_secs(60);
        let mut rest = s;

        if let Some(stripped) = s.strip_prefix('@') {
            if stripped == "once" {
                return Ok(Self {
                    minutes: RangeBitSet::new(0, 59),
                    hours: RangeBitSet::new(0, 23),
                    days_of_month: RangeBitSet::new(1, 31),
                    months: RangeBitSet::new(1, 12),
                    days_of_week: RangeBitSet::new(0, 6),
                    delay_range: Duration::from_secs(0),
                });
            }

            let special = SPECIAL_SCHEDULES
                .iter()
                .find(|sp| sp.name == stripped)
                .ok_or_else(|| invalid(s, "unsupported 'special' cron schedule"))?;
            rest = special.regular;
            delay_range = special.delay_range;
        } else if let Some(t) = s.strip_prefix("*/") {
            let digits = t.chars().take_while(|c| c.is_ascii_digit()).count();
            if digits > 0 {
                let after = &t[digits..];
                if after.chars().next() != Some(',') {
                    if let Ok(value) = t[..digits].parse::<u64>() {
                        delay_range = Duration::from_secs(value * 60);
                    }
                }
            }
        }

        let mut cursor = Cursor::new(rest);
        let mut minutes = RangeBitSet::new(0, 59);
        let mut hours = RangeBitSet::new(0, 23);
        let mut days_of_month = RangeBitSet::new(1, 31);
        let mut months = RangeBitSet::new(1, 12);

        parse_numeric_bitset(&mut minutes, &mut cursor, None).map_err(|e| invalid(s, e))?;
        parse_numeric_bitset(&mut hours, &mut cursor, None).map_err(|e| invalid(s, e))?;
        parse_numeric_bitset(&mut days_of_month, &mut cursor, None).map_err(|e| invalid(s, e))?;
        parse_numeric_bitset(&mut months, &mut cursor, Some(MONTH_NAMES)).map_err(|e| invalid(s, e))?;

        let mut raw_dow = RangeBitSet::new(0, 7);
        parse_numeric_bitset(&mut raw_dow, &mut cursor, Some(WEEKDAY_NAMES)).map_err(|e| invalid(s, e))?;

        let mut days_of_week = RangeBitSet::new(0, 6);
        for i in 0..=6 {
            days_of_week.set(i, raw_dow.get(i));
        }
        if raw_dow.get(7) {
            days_of_week.set(0, true);
        }

        cursor.strip_leading_ws();
        if !cursor.rest.is_empty() {
            return Err(invalid(s, "garbage at end of schedule"));
        }

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            delay_range,
        })
    }

    /// `@once` jobs: no recurring fields set at all.
    pub fn is_once(&self) -> bool {
        self.minutes.none()
            && self.hours.none()
            && self.days_of_month.none()
            && self.months.none()
            && self.days_of_week.none()
    }

    fn check_date(&self, date: NaiveDateTime) -> bool {
        self.days_of_month.get(date.day())
            && self.months.get(date.month())
            && self.days_of_week.get(date.weekday().num_days_from_sunday())
    }

    /// Determines when this job should next run, given the last time it ran
    /// (`None` if never) and the current time. Both timestamps are
    /// wall-clock, already rotated into the job's configured timezone by the
    /// caller.
    pub fn next(&self, last: Option<NaiveDateTime>, now: NaiveDateTime) -> NextRun {
        if self.is_once() {
            return match last {
                None => NextRun::At(now),
                Some(_) => NextRun::Never,
            };
        }

        let last = last.unwrap_or_else(|| now - ChronoDuration::minutes(1));

        let mut next = last.with_second(0).and_then(|d| d.with_nanosecond(0)).unwrap_or(last);

        let mut last_min = last.minute();
        let last_hour = last.hour();

        if !self.hours.get(last_hour) {
            // Last hour is no longer valid (e.g. schedule changed): force a
            // skip to the next valid hour by pretending we're past the end
            // of the minute range.
            last_min = 60;
        }

        let next_min = self.minutes.next_bit(last_min);
        if next_min <= last_min {
            let next_hour = self.hours.next_bit(last_hour);
            next = next.with_minute(next_min).unwrap_or(next);
            if next_hour <= last_hour {
                next = next.with_hour(next_hour).unwrap_or(next);
                next += ChronoDuration::days(1);
            } else {
                next = next.with_hour(next_hour).unwrap_or(next);
            }
        } else {
            next = next.with_minute(next_min).unwrap_or(next);
        }

        while !self.check_date(next) {
            next += ChronoDuration::days(1);
        }

        NextRun::At(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, min, 0).unwrap()
    }

    #[test]
    fn parses_star_everything() {
        let s = CronSchedule::parse("* * * * *").unwrap();
        assert!(!s.is_once());
        assert!(s.minutes.get(0));
        assert!(s.minutes.get(59));
        assert!(s.hours.get(23));
        assert!(s.days_of_week.get(0));
        assert!(s.days_of_week.get(6));
    }

    #[test]
    fn parses_step_and_range() {
        let s = CronSchedule::parse("*/15 9-17 * * mon-fri").unwrap();
        assert!(s.minutes.get(0));
        assert!(s.minutes.get(15));
        assert!(s.minutes.get(30));
        assert!(s.minutes.get(45));
        assert!(!s.minutes.get(1));
        assert!(s.hours.get(9));
        assert!(s.hours.get(17));
        assert!(!s.hours.get(8));
        // mon..fri = 1..5
        assert!(s.days_of_week.get(1));
        assert!(s.days_of_week.get(5));
        assert!(!s.days_of_week.get(0));
        assert_eq!(s.delay_range, Duration::from_secs(15 * 60));
    }

    #[test]
    fn sunday_symbolic_and_numeric_fold_together() {
        let symbolic = CronSchedule::parse("0 0 * * sun").unwrap();
        let numeric = CronSchedule::parse("0 0 * * 0").unwrap();
        let seven = CronSchedule::parse("0 0 * * 7").unwrap();
        assert_eq!(symbolic, numeric);
        assert_eq!(symbolic, seven);
    }

    #[test]
    fn once_has_zero_delay_and_runs_immediately_then_never() {
        let s = CronSchedule::parse("@once").unwrap();
        assert_eq!(s.delay_range, Duration::from_secs(0));
        assert!(s.is_once());
        let now = dt(2026, 7, 29, 12, 0);
        assert_eq!(s.next(None, now), NextRun::At(now));
        assert_eq!(s.next(Some(now), now), NextRun::Never);
    }

    #[test]
    fn macros_expand_to_documented_regular_schedules() {
        assert_eq!(CronSchedule::parse("@hourly").unwrap(), CronSchedule::parse("0 * * * *").unwrap());
        assert_eq!(CronSchedule::parse("@daily").unwrap(), CronSchedule::parse("0 0 * * *").unwrap());
        assert_eq!(CronSchedule::parse("@weekly").unwrap(), CronSchedule::parse("0 0 * * 0").unwrap());
        assert_eq!(CronSchedule::parse("@monthly").unwrap(), CronSchedule::parse("0 0 1 * *").unwrap());
        assert_eq!(CronSchedule::parse("@yearly").unwrap(), CronSchedule::parse("0 0 1 1 *").unwrap());

        let hourly = CronSchedule::parse("@hourly").unwrap();
        assert_eq!(hourly.delay_range, Duration::from_secs(3600));
        let midnight = CronSchedule::parse("@midnight").unwrap();
        assert_eq!(midnight.delay_range, Duration::from_secs(3600));
        let daily = CronSchedule::parse("@daily").unwrap();
        assert_eq!(daily.delay_range, Duration::from_secs(86400));
    }

    #[test]
    fn next_advances_to_next_matching_minute_same_hour() {
        let s = CronSchedule::parse("30 * * * *").unwrap();
        let last = dt(2026, 7, 29, 10, 30);
        let now = dt(2026, 7, 29, 10, 31);
        assert_eq!(s.next(Some(last), now), NextRun::At(dt(2026, 7, 29, 11, 30)));
    }

    #[test]
    fn next_rolls_into_following_day_when_date_fields_restrict() {
        // Only the 1st of the month qualifies; running on day 2 must roll to
        // next month's 1st.
        let s = CronSchedule::parse("0 0 1 * *").unwrap();
        let last = dt(2026, 7, 1, 0, 0);
        let now = dt(2026, 7, 2, 0, 0);
        assert_eq!(s.next(Some(last), now), NextRun::At(dt(2026, 8, 1, 0, 0)));
    }

    #[test]
    fn next_with_no_last_run_uses_now_minus_a_minute_as_baseline() {
        let s = CronSchedule::parse("* * * * *").unwrap();
        let now = dt(2026, 7, 29, 12, 0);
        assert_eq!(s.next(None, now), NextRun::At(now));
    }

    #[test]
    fn rejects_garbage_and_bad_ranges() {
        assert!(CronSchedule::parse("60 * * * *").is_err());
        assert!(CronSchedule::parse("5-1 * * * *").is_err());
        assert!(CronSchedule::parse("* * * * * extra").is_err());
        assert!(CronSchedule::parse("@bogus").is_err());
    }
}
