// Five-field cron expressions evaluated in UTC.
use chrono::{DateTime, Datelike, Duration as ChronoDuration, DurationRound, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

use crate::errors::{AppError, Result};

/// Upper bound for the forward search; covers a leap year plus slack.
const SEARCH_DAYS: i64 = 366 * 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    /// Sunday is bit 0.
    days_of_week: u64,
    day_of_month_restricted: bool,
    day_of_week_restricted: bool,
}

fn expand_alias(expression: &str) -> &str {
    match expression {
        "@hourly" => "0 * * * *",
        "@daily" | "@midnight" => "0 0 * * *",
        "@weekly" => "0 0 * * 0",
        "@monthly" => "0 0 1 * *",
        "@yearly" | "@annually" => "0 0 1 1 *",
        other => other,
    }
}

fn invalid(expression: &str, detail: impl fmt::Display) -> AppError {
    AppError::InvalidSchedule(format!("'{}': {}", expression, detail))
}

fn parse_number(expression: &str, raw: &str, min: u32, max: u32) -> Result<u32> {
    let value: u32 = raw
        .parse()
        .map_err(|_| invalid(expression, format!("'{}' is not a number", raw)))?;
    if value < min || value > max {
        return Err(invalid(
            expression,
            format!("{} is outside {}-{}", value, min, max),
        ));
    }
    Ok(value)
}

/// Parses one field into a bit set of allowed values.
fn parse_field(expression: &str, field: &str, min: u32, max: u32) -> Result<u64> {
    let mut bits = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step = parse_number(expression, step, 1, max)?;
                (range, step)
            }
            None => (part, 1),
        };
        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let a = parse_number(expression, a, min, max)?;
            let b = parse_number(expression, b, min, max)?;
            if a > b {
                return Err(invalid(expression, format!("range {}-{} is reversed", a, b)));
            }
            (a, b)
        } else {
            let start = parse_number(expression, range, min, max)?;
            // "5/15" means from 5 to the end of the field
            (start, if part.contains('/') { max } else { start })
        };
        for value in (start..=end).step_by(step as usize) {
            bits |= 1 << value;
        }
    }
    Ok(bits)
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        let expanded = expand_alias(trimmed);
        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(
                trimmed,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }

        let mut days_of_week = parse_field(trimmed, fields[4], 0, 7)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week | 1) & !(1 << 7);
        }

        Ok(Self {
            expression: trimmed.to_string(),
            minutes: parse_field(trimmed, fields[0], 0, 59)?,
            hours: parse_field(trimmed, fields[1], 0, 23)?,
            days_of_month: parse_field(trimmed, fields[2], 1, 31)?,
            months: parse_field(trimmed, fields[3], 1, 12)?,
            days_of_week,
            day_of_month_restricted: !fields[2].starts_with('*'),
            day_of_week_restricted: !fields[4].starts_with('*'),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn day_matches(&self, at: DateTime<Utc>) -> bool {
        if self.months & (1 << at.month()) == 0 {
            return false;
        }
        let dom = self.days_of_month & (1 << at.day()) != 0;
        let dow = self.days_of_week & (1 << at.weekday().num_days_from_sunday()) != 0;
        // classic cron: when both day fields are restricted either may match
        if self.day_of_month_restricted && self.day_of_week_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// First matching minute strictly after `after`, or `None` if there is none
    /// within a few years (e.g. `0 0 31 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = after.duration_trunc(ChronoDuration::minutes(1)).ok()? + ChronoDuration::minutes(1);
        let limit = after + ChronoDuration::days(SEARCH_DAYS);

        while candidate <= limit {
            if !self.day_matches(candidate) {
                let midnight = candidate.duration_trunc(ChronoDuration::days(1)).ok()?;
                candidate = midnight + ChronoDuration::days(1);
                continue;
            }
            if self.hours & (1 << candidate.hour()) == 0 {
                let hour = candidate.duration_trunc(ChronoDuration::hours(1)).ok()?;
                candidate = hour + ChronoDuration::hours(1);
                continue;
            }
            if self.minutes & (1 << candidate.minute()) == 0 {
                candidate += ChronoDuration::minutes(1);
                continue;
            }
            return Some(candidate);
        }
        None
    }
}

impl FromStr for CronSchedule {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn daily_at_two() {
        let cron = CronSchedule::parse("0 2 * * *").unwrap();
        assert_eq!(cron.next_after(at(2026, 10, 18, 1, 30)), Some(at(2026, 10, 18, 2, 0)));
        assert_eq!(cron.next_after(at(2026, 10, 18, 2, 0)), Some(at(2026, 10, 19, 2, 0)));
    }

    #[test]
    fn seconds_are_ignored_when_searching() {
        let cron = CronSchedule::parse("*/15 * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 10, 18, 10, 14, 59).unwrap();
        assert_eq!(cron.next_after(after), Some(at(2026, 10, 18, 10, 15)));
    }

    #[test]
    fn lists_ranges_and_steps() {
        let cron = CronSchedule::parse("5,35 9-17/4 * * 1-5").unwrap();
        // 2026-10-17 is a Saturday
        assert_eq!(cron.next_after(at(2026, 10, 17, 12, 0)), Some(at(2026, 10, 19, 9, 5)));
        assert_eq!(cron.next_after(at(2026, 10, 19, 9, 5)), Some(at(2026, 10, 19, 9, 35)));
        assert_eq!(cron.next_after(at(2026, 10, 19, 9, 35)), Some(at(2026, 10, 19, 13, 5)));
        assert_eq!(cron.next_after(at(2026, 10, 19, 17, 35)), Some(at(2026, 10, 20, 9, 5)));
    }

    #[test]
    fn aliases_expand() {
        let weekly = CronSchedule::parse("@weekly").unwrap();
        // Sunday midnight
        assert_eq!(weekly.next_after(at(2026, 10, 18, 0, 0)), Some(at(2026, 10, 25, 0, 0)));
        let monthly: CronSchedule = "@monthly".parse().unwrap();
        assert_eq!(monthly.next_after(at(2026, 12, 15, 0, 0)), Some(at(2027, 1, 1, 0, 0)));
        assert_eq!(monthly.expression(), "@monthly");
    }

    #[test]
    fn sunday_as_seven() {
        let cron = CronSchedule::parse("0 3 * * 7").unwrap();
        assert_eq!(cron.next_after(at(2026, 10, 19, 0, 0)), Some(at(2026, 10, 25, 3, 0)));
    }

    #[test]
    fn restricted_day_fields_are_ored() {
        // the 1st of the month or any Friday
        let cron = CronSchedule::parse("0 0 1 * 5").unwrap();
        assert_eq!(cron.next_after(at(2026, 10, 18, 0, 0)), Some(at(2026, 10, 23, 0, 0)));
        assert_eq!(cron.next_after(at(2026, 10, 30, 0, 0)), Some(at(2026, 11, 1, 0, 0)));
    }

    #[test]
    fn leap_day() {
        let cron = CronSchedule::parse("0 12 29 2 *").unwrap();
        assert_eq!(cron.next_after(at(2026, 10, 18, 0, 0)), Some(at(2028, 2, 29, 12, 0)));
    }

    #[test]
    fn impossible_date_has_no_next() {
        let cron = CronSchedule::parse("0 0 31 2 *").unwrap();
        assert_eq!(cron.next_after(at(2026, 1, 1, 0, 0)), None);
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in ["", "* * * *", "60 * * * *", "* 24 * * *", "0 0 0 * *", "*/0 * * * *", "5-1 * * * *", "a * * * *", "@fortnightly"] {
            let err = CronSchedule::parse(bad).unwrap_err();
            assert!(matches!(err, AppError::InvalidSchedule(_)), "{}", bad);
        }
    }
}
