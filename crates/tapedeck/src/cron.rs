//! Five-field cron expressions.
//!
//! `minute hour day-of-month month day-of-week`, numeric only. Each field is
//! `*`, a value, a range `a-b`, a step `*/n` or `a-b/n`, or a comma list of
//! those. Day-of-week runs 0 (Sunday) through 6.
//!
//! When both day fields are restricted a time matches if either matches,
//! following classic cron.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Search horizon for the next fire; covers leap-day schedules.
const MAX_SEARCH_YEARS: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronField {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl CronField {
    const ALL: [CronField; 5] = [
        CronField::Minute,
        CronField::Hour,
        CronField::DayOfMonth,
        CronField::Month,
        CronField::DayOfWeek,
    ];

    pub fn range(&self) -> (u32, u32) {
        match self {
            CronField::Minute => (0, 59),
            CronField::Hour => (0, 23),
            CronField::DayOfMonth => (1, 31),
            CronField::Month => (1, 12),
            CronField::DayOfWeek => (0, 6),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CronField::Minute => "minute",
            CronField::Hour => "hour",
            CronField::DayOfMonth => "day",
            CronField::Month => "month",
            CronField::DayOfWeek => "weekday",
        }
    }
}

impl fmt::Display for CronField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("Cron expression must have exactly 5 fields (minute hour day month weekday), got {0}")]
    FieldCount(usize),

    #[error("Invalid {field} field in cron expression: {value} ({reason})")]
    InvalidField {
        field: CronField,
        value: String,
        reason: String,
    },
}

/// Bitset of allowed values for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    bits: u64,
    /// Parsed from a bare `*`; matters for the day-of-month/day-of-week rule.
    star: bool,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1u64 << value) != 0
    }

    fn parse(field: CronField, text: &str) -> Result<Self, CronError> {
        let invalid = |reason: &str| CronError::InvalidField {
            field,
            value: text.to_string(),
            reason: reason.to_string(),
        };
        let (min, max) = field.range();
        let mut bits = 0u64;

        for item in text.split(',') {
            if item.is_empty() {
                return Err(invalid("empty list item"));
            }

            let (span, step) = match item.split_once('/') {
                Some((span, step)) => {
                    let step: u32 = step.parse().map_err(|_| invalid("step is not a number"))?;
                    if step == 0 {
                        return Err(invalid("step must be positive"));
                    }
                    (span, step)
                }
                None => (item, 1),
            };

            let (lo, hi) = if span == "*" {
                (min, max)
            } else if let Some((a, b)) = span.split_once('-') {
                let a = parse_value(a).ok_or_else(|| invalid("range start is not a number"))?;
                let b = parse_value(b).ok_or_else(|| invalid("range end is not a number"))?;
                if a > b {
                    return Err(invalid("range start is after range end"));
                }
                (a, b)
            } else {
                let v = parse_value(span).ok_or_else(|| invalid("not a number"))?;
                if v < min || v > max {
                    return Err(invalid(&format!("values must be within {}-{}", min, max)));
                }
                if step != 1 {
                    // `5/10` means every 10 starting at 5
                    (v, max)
                } else {
                    (v, v)
                }
            };

            if lo < min || hi > max {
                return Err(invalid(&format!("values must be within {}-{}", min, max)));
            }

            let mut v = lo;
            while v <= hi {
                bits |= 1u64 << v;
                match v.checked_add(step) {
                    Some(next) => v = next,
                    None => break,
                }
            }
        }

        Ok(Self {
            bits,
            star: text == "*",
        })
    }
}

fn parse_value(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: FieldSet,
    hours: FieldSet,
    days: FieldSet,
    months: FieldSet,
    weekdays: FieldSet,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronError::FieldCount(parts.len()));
        }

        let mut sets = [FieldSet { bits: 0, star: false }; 5];
        for (slot, (field, part)) in sets.iter_mut().zip(CronField::ALL.iter().zip(parts.iter())) {
            *slot = FieldSet::parse(*field, part)?;
        }

        Ok(Self {
            source: parts.join(" "),
            minutes: sets[0],
            hours: sets[1],
            days: sets[2],
            months: sets[3],
            weekdays: sets[4],
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days.contains(date.day());
        let dow = self.weekdays.contains(date.weekday().num_days_from_sunday());
        match (self.days.star, self.weekdays.star) {
            (false, false) => dom || dow,
            _ => dom && dow,
        }
    }

    /// First wall-clock time matching the expression strictly after `base`.
    ///
    /// Candidates that fall in a DST gap are skipped; ambiguous ones resolve
    /// to the earlier instant. Returns `None` for expressions that can never
    /// fire (e.g. February 30th).
    pub fn next_after<Tz: TimeZone>(&self, base: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = base.timezone();
        let start = base.naive_local().with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let limit_year = start.year() + MAX_SEARCH_YEARS;
        let mut t = start;

        while t.year() <= limit_year {
            if !self.months.contains(t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = (t.date() + Duration::days(1)).and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }

            let resolved = match tz.from_local_datetime(&t) {
                LocalResult::Single(dt) => Some(dt),
                LocalResult::Ambiguous(earliest, _) => Some(earliest),
                LocalResult::None => None,
            };
            if let Some(dt) = resolved {
                if dt > *base {
                    return Some(dt);
                }
            }
            t += Duration::minutes(1);
        }

        None
    }
}

fn first_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

impl FromStr for CronExpr {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Returns true if `expr` is a well-formed five-field expression.
pub fn validate_cron(expr: &str) -> bool {
    CronExpr::parse(expr).is_ok()
}

/// Calendar used to interpret trigger expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronZone {
    /// The host's local time zone (honours `TZ`).
    #[default]
    Local,
    Utc,
}

impl CronZone {
    /// Next fire of `expr` after `after`, evaluated in this zone.
    pub fn next_fire(&self, expr: &CronExpr, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            CronZone::Utc => expr.next_after(&after),
            CronZone::Local => expr
                .next_after(&after.with_timezone(&chrono::Local))
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn next(expr: &str, base: &str) -> DateTime<Utc> {
        CronExpr::parse(expr).unwrap().next_after(&at(base)).unwrap()
    }

    #[test]
    fn test_top_of_hour() {
        assert_eq!(next("0 * * * *", "2024-03-10T10:00:00Z"), at("2024-03-10T11:00:00Z"));
        assert_eq!(next("0 * * * *", "2024-03-10T10:59:59Z"), at("2024-03-10T11:00:00Z"));
        assert_eq!(next("0 * * * *", "2024-03-10T09:30:00Z"), at("2024-03-10T10:00:00Z"));
    }

    #[test]
    fn test_next_is_strictly_after_base() {
        let exprs = ["* * * * *", "*/15 * * * *", "30 2 * * 1-5", "0 0 1 * *", "5,35 8-18/2 * 6 0"];
        let bases = ["2024-01-01T00:00:00Z", "2024-02-29T23:59:30Z", "2024-12-31T23:59:00Z"];
        for expr in exprs {
            let parsed = CronExpr::parse(expr).unwrap();
            for base in bases {
                let base = at(base);
                let fire = parsed.next_after(&base).unwrap();
                assert!(fire > base, "{} from {} gave {}", expr, base, fire);
                assert_eq!(fire.second(), 0);
            }
        }
    }

    #[test]
    fn test_steps_and_lists() {
        assert_eq!(next("*/15 * * * *", "2024-05-01T10:16:00Z"), at("2024-05-01T10:30:00Z"));
        assert_eq!(next("5,35 * * * *", "2024-05-01T10:05:00Z"), at("2024-05-01T10:35:00Z"));
        assert_eq!(next("0 9-17/4 * * *", "2024-05-01T13:00:00Z"), at("2024-05-01T17:00:00Z"));
    }

    #[test]
    fn test_weekday_and_month_rollover() {
        // 2024-06-01 is a Saturday; next Monday 08:00 is 06-03
        assert_eq!(next("0 8 * * 1", "2024-06-01T12:00:00Z"), at("2024-06-03T08:00:00Z"));
        assert_eq!(next("0 0 1 * *", "2024-12-15T00:00:00Z"), at("2025-01-01T00:00:00Z"));
    }

    #[test]
    fn test_restricted_day_fields_are_ored() {
        // the 15th, or any Sunday; 2024-06-02 is a Sunday
        assert_eq!(next("0 0 15 * 0", "2024-06-01T01:00:00Z"), at("2024-06-02T00:00:00Z"));
    }

    #[test]
    fn test_leap_day() {
        assert_eq!(next("0 12 29 2 *", "2024-03-01T00:00:00Z"), at("2028-02-29T12:00:00Z"));
    }

    #[test]
    fn test_impossible_date_never_fires() {
        let expr = CronExpr::parse("0 0 30 2 *").unwrap();
        assert!(expr.next_after(&at("2024-01-01T00:00:00Z")).is_none());
    }

    #[test]
    fn test_field_count() {
        assert_eq!(CronExpr::parse("* * * *"), Err(CronError::FieldCount(4)));
        assert_eq!(CronExpr::parse("* * * * * *"), Err(CronError::FieldCount(6)));
        assert!(!validate_cron(""));
    }

    #[test]
    fn test_out_of_range_names_the_field() {
        let cases = [
            ("60 * * * *", CronField::Minute),
            ("* 24 * * *", CronField::Hour),
            ("* * 0 * *", CronField::DayOfMonth),
            ("* * 32 * *", CronField::DayOfMonth),
            ("* * * 13 *", CronField::Month),
            ("* * * * 7", CronField::DayOfWeek),
            ("*/0 * * * *", CronField::Minute),
            ("* 5-2 * * *", CronField::Hour),
            ("* * * jan *", CronField::Month),
            ("1,,2 * * * *", CronField::Minute),
        ];
        for (expr, expected) in cases {
            match CronExpr::parse(expr) {
                Err(CronError::InvalidField { field, .. }) => assert_eq!(field, expected, "{}", expr),
                other => panic!("{} parsed as {:?}", expr, other),
            }
            assert!(!validate_cron(expr));
        }
    }

    #[test]
    fn test_stepped_start_out_of_range() {
        let cases = [
            ("60/5 * * * *", CronField::Minute),
            ("* 24/2 * * *", CronField::Hour),
            ("* * 32/2 * *", CronField::DayOfMonth),
            ("* * 0/2 * *", CronField::DayOfMonth),
        ];
        for (expr, expected) in cases {
            match CronExpr::parse(expr) {
                Err(CronError::InvalidField { field, .. }) => assert_eq!(field, expected, "{}", expr),
                other => panic!("{} parsed as {:?}", expr, other),
            }
            assert!(!validate_cron(expr));
        }
    }

    #[test]
    fn test_huge_step_stops_after_first_value() {
        let expr = CronExpr::parse("1-5/4294967295 * * * *").unwrap();
        assert!(expr.minutes.contains(1));
        assert!(!expr.minutes.contains(2));
        assert!(validate_cron("*/4294967295 * * * *"));

        let expr = CronExpr::parse("59/4294967295 * * * *").unwrap();
        assert!(expr.minutes.contains(59));
    }

    #[test]
    fn test_error_message_mentions_field_and_value() {
        let err = CronExpr::parse("* 25 * * *").unwrap_err();
        assert!(err.to_string().starts_with("Invalid hour field in cron expression: 25"));
    }

    #[test]
    fn test_fixed_offset_zone() {
        let tz = chrono::FixedOffset::west_opt(7 * 3600).unwrap();
        let base = tz.with_ymd_and_hms(2024, 7, 1, 5, 0, 0).unwrap();
        let fire = CronExpr::parse("0 6 * * *").unwrap().next_after(&base).unwrap();
        assert_eq!(fire, tz.with_ymd_and_hms(2024, 7, 1, 6, 0, 0).unwrap());
        assert_eq!(fire.with_timezone(&Utc), at("2024-07-01T13:00:00Z"));
    }

    #[test]
    fn test_utc_zone_matches_direct_evaluation() {
        let expr = CronExpr::parse("*/10 * * * *").unwrap();
        let base = at("2024-01-01T00:03:00Z");
        assert_eq!(CronZone::Utc.next_fire(&expr, base), expr.next_after(&base));
    }
}
