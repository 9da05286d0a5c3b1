//! 5-field cron evaluation.
//!
//! Patterns use the standard `minute hour dom month dow` form with `*`,
//! ranges, steps and lists; day-of-week is `0-7` with both `0` and `7`
//! meaning Sunday. Evaluation delegates to the [`cron`] crate, which
//! expects a leading seconds field (a `0` is prefixed) and counts days of
//! week Quartz-style (`1` = Sunday), so numeric day-of-week values are
//! remapped before parsing.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid cron pattern `{pattern}`: {reason}")]
pub struct InvalidCron {
    pub pattern: String,
    pub reason: String,
}

/// A parsed 5-field cron pattern.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: Schedule,
    pattern: String,
}

impl CronSchedule {
    pub fn parse(pattern: &str) -> Result<Self, InvalidCron> {
        let invalid = |reason: String| InvalidCron {
            pattern: pattern.to_owned(),
            reason,
        };

        let fields: Vec<&str> = pattern.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(
                "expected 5 fields (minute hour day-of-month month day-of-week)".to_owned(),
            ));
        }
        let dow = rewrite_dow_field(fields[4]);
        let translated = format!(
            "0 {} {} {} {} {}",
            fields[0], fields[1], fields[2], fields[3], dow
        );
        let schedule =
            Schedule::from_str(&translated).map_err(|err| invalid(err.to_string()))?;
        Ok(Self {
            schedule,
            pattern: pattern.to_owned(),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// The smallest instant strictly greater than `from` satisfying the
    /// pattern, or `None` if the schedule has no future occurrence.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }
}

impl FromStr for CronSchedule {
    type Err = InvalidCron;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Shifts standard numeric day-of-week values (`0`/`7` = Sunday) onto the
/// delegate's `1` = Sunday scheme, preserving lists, ranges and steps.
/// Named days and out-of-range numbers pass through for the delegate to
/// validate.
fn rewrite_dow_field(field: &str) -> String {
    if field == "*" {
        return field.to_owned();
    }
    field
        .split(',')
        .map(rewrite_dow_item)
        .collect::<Vec<_>>()
        .join(",")
}

fn rewrite_dow_item(item: &str) -> String {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (item, None),
    };
    let mapped = rewrite_dow_range(range);
    match step {
        Some(step) => format!("{mapped}/{step}"),
        None => mapped,
    }
}

fn rewrite_dow_range(range: &str) -> String {
    if range == "*" {
        return range.to_owned();
    }
    match range.split_once('-') {
        Some((start, end)) => match (dow_number(start), dow_number(end)) {
            // A range ending on 7 wraps back onto Sunday; split it.
            (Some(start), Some(7)) if start <= 6 => format!("{}-7,1", start % 7 + 1),
            (Some(start), Some(end)) => format!("{}-{}", start % 7 + 1, end % 7 + 1),
            _ => range.to_owned(),
        },
        None => match dow_number(range) {
            Some(day) => (day % 7 + 1).to_string(),
            None => range.to_owned(),
        },
    }
}

fn dow_number(value: &str) -> Option<u8> {
    value.parse::<u8>().ok().filter(|day| *day <= 7)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Weekday};

    #[test]
    fn every_five_minutes() {
        let schedule = CronSchedule::parse("*/5 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2026, 1, 1, 10, 2, 0).unwrap();
        assert_eq!(
            schedule.next_after(from),
            Some(Utc.with_ymd_and_hms(2026, 1, 1, 10, 5, 0).unwrap())
        );
    }

    #[test]
    fn next_is_strictly_greater_than_reference() {
        let schedule = CronSchedule::parse("*/5 * * * *").unwrap();
        // Reference sits exactly on a fire time.
        let from = Utc.with_ymd_and_hms(2026, 1, 1, 10, 5, 0).unwrap();
        let next = schedule.next_after(from).unwrap();
        assert!(next > from);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 1, 10, 10, 0).unwrap());
    }

    #[test]
    fn ranges_steps_and_lists() {
        let schedule = CronSchedule::parse("0,30 9-17 * * 1-5").unwrap();
        // Friday evening rolls over to Monday morning.
        let from = Utc.with_ymd_and_hms(2026, 1, 2, 18, 0, 0).unwrap();
        assert_eq!(
            schedule.next_after(from),
            Some(Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn numeric_day_of_week_uses_standard_numbering() {
        // 0 is Sunday.
        let schedule = CronSchedule::parse("0 12 * * 0").unwrap();
        let from = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = schedule.next_after(from).unwrap();
        assert_eq!(next.weekday(), Weekday::Sun);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 4, 12, 0, 0).unwrap());

        // 7 is Sunday too.
        let schedule = CronSchedule::parse("0 12 * * 7").unwrap();
        assert_eq!(schedule.next_after(from).unwrap().weekday(), Weekday::Sun);

        // 5 is Friday.
        let schedule = CronSchedule::parse("0 12 * * 5").unwrap();
        assert_eq!(schedule.next_after(from).unwrap().weekday(), Weekday::Fri);
    }

    #[test]
    fn named_days_pass_through() {
        let schedule = CronSchedule::parse("0 8 * * mon-fri").unwrap();
        let from = Utc.with_ymd_and_hms(2026, 1, 3, 0, 0, 0).unwrap();
        assert_eq!(schedule.next_after(from).unwrap().weekday(), Weekday::Mon);
    }

    #[test]
    fn hourly_on_the_hour() {
        let schedule = CronSchedule::parse("0 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2026, 6, 15, 23, 30, 0).unwrap();
        assert_eq!(
            schedule.next_after(from),
            Some(Utc.with_ymd_and_hms(2026, 6, 16, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn rejects_wrong_field_count() {
        let err = CronSchedule::parse("* * * *").unwrap_err();
        assert!(err.reason.contains("5 fields"));
        assert!(CronSchedule::parse("* * * * * *").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(CronSchedule::parse("not a cron pattern at all").is_err());
        assert!(CronSchedule::parse("61 * * * *").is_err());
        assert!(CronSchedule::parse("* * * * 8").is_err());
    }

    #[test]
    fn parse_via_from_str() {
        let schedule: CronSchedule = "*/10 * * * *".parse().unwrap();
        assert_eq!(schedule.pattern(), "*/10 * * * *");
    }

    #[test]
    fn dow_rewrite_shapes() {
        assert_eq!(rewrite_dow_field("*"), "*");
        assert_eq!(rewrite_dow_field("0"), "1");
        assert_eq!(rewrite_dow_field("7"), "1");
        assert_eq!(rewrite_dow_field("1-5"), "2-6");
        assert_eq!(rewrite_dow_field("0,3,6"), "1,4,7");
        assert_eq!(rewrite_dow_field("1-5/2"), "2-6/2");
        assert_eq!(rewrite_dow_field("5-7"), "6-7,1");
        assert_eq!(rewrite_dow_field("mon-fri"), "mon-fri");
        // Out of range values pass through and fail in the delegate.
        assert_eq!(rewrite_dow_field("8"), "8");
    }
}
