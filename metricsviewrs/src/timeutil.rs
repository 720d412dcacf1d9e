//! Time grains and calendar-aware truncation.
//!
//! All functions take and return UTC instants. Truncation happens in the
//! wall-clock time of the supplied zone and is converted back afterwards.

use std::fmt;
use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, LocalResult, Months, NaiveDate, NaiveDateTime, TimeZone,
    Timelike, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{MetricsViewError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeGrain {
    Unspecified,
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Default for TimeGrain {
    fn default() -> Self {
        TimeGrain::Unspecified
    }
}

impl TimeGrain {
    pub const ALL: [TimeGrain; 9] = [
        TimeGrain::Millisecond,
        TimeGrain::Second,
        TimeGrain::Minute,
        TimeGrain::Hour,
        TimeGrain::Day,
        TimeGrain::Week,
        TimeGrain::Month,
        TimeGrain::Quarter,
        TimeGrain::Year,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeGrain::Unspecified => "unspecified",
            TimeGrain::Millisecond => "millisecond",
            TimeGrain::Second => "second",
            TimeGrain::Minute => "minute",
            TimeGrain::Hour => "hour",
            TimeGrain::Day => "day",
            TimeGrain::Week => "week",
            TimeGrain::Month => "month",
            TimeGrain::Quarter => "quarter",
            TimeGrain::Year => "year",
        }
    }

    /// Grains of a day or coarser truncate on calendar boundaries.
    pub fn is_calendar(&self) -> bool {
        matches!(
            self,
            TimeGrain::Day | TimeGrain::Week | TimeGrain::Month | TimeGrain::Quarter | TimeGrain::Year
        )
    }
}

impl fmt::Display for TimeGrain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeGrain {
    type Err = MetricsViewError;

    /// Accepts both `day` and the prefixed `TIME_GRAIN_DAY` spelling.
    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        let name = lower.strip_prefix("time_grain_").unwrap_or(&lower);
        let grain = match name {
            "" | "unspecified" => TimeGrain::Unspecified,
            "millisecond" | "ms" => TimeGrain::Millisecond,
            "second" | "s" => TimeGrain::Second,
            "minute" | "m" => TimeGrain::Minute,
            "hour" | "h" => TimeGrain::Hour,
            "day" | "d" => TimeGrain::Day,
            "week" | "w" => TimeGrain::Week,
            "month" | "mo" => TimeGrain::Month,
            "quarter" | "q" => TimeGrain::Quarter,
            "year" | "y" => TimeGrain::Year,
            other => {
                return Err(MetricsViewError::Validation(format!(
                    "invalid time grain '{other}'"
                )))
            }
        };
        Ok(grain)
    }
}

/// Parse an IANA zone name. Empty means UTC.
pub fn parse_time_zone(name: &str) -> Result<Tz> {
    if name.is_empty() {
        return Ok(Tz::UTC);
    }
    name.parse::<Tz>()
        .map_err(|e| MetricsViewError::Validation(format!("invalid time zone {name:?}: {e}")))
}

/// Whether a zone name selects the UTC fast path.
pub fn is_utc(name: &str) -> bool {
    matches!(name, "" | "UTC" | "Etc/UTC")
}

/// Reset an out-of-range first day of week (1=Monday..7=Sunday) to Monday.
pub fn clamp_first_day_of_week(day: u32) -> u32 {
    if (1..=7).contains(&day) {
        day
    } else {
        1
    }
}

/// Reset an out-of-range first month of year (1..12) to January.
pub fn clamp_first_month_of_year(month: u32) -> u32 {
    if (1..=12).contains(&month) {
        month
    } else {
        1
    }
}

/// Truncate `t` to the start of its `grain` bucket in zone `tz`.
///
/// Weeks start on `first_day_of_week` (clamped to 1..=7). Quarters and years
/// are aligned to `first_month_of_year` (clamped to 1..=12).
pub fn truncate_time(
    t: DateTime<Utc>,
    grain: TimeGrain,
    tz: Tz,
    first_day_of_week: u32,
    first_month_of_year: u32,
) -> DateTime<Utc> {
    let local = t.with_timezone(&tz);
    match grain {
        TimeGrain::Unspecified => t,
        TimeGrain::Millisecond => t - Duration::nanoseconds(i64::from(local.nanosecond() % 1_000_000)),
        TimeGrain::Second => t - Duration::nanoseconds(i64::from(local.nanosecond())),
        TimeGrain::Minute => {
            t - Duration::seconds(i64::from(local.second()))
                - Duration::nanoseconds(i64::from(local.nanosecond()))
        }
        TimeGrain::Hour => {
            let candidate = t
                - Duration::minutes(i64::from(local.minute()))
                - Duration::seconds(i64::from(local.second()))
                - Duration::nanoseconds(i64::from(local.nanosecond()));
            let check = candidate.with_timezone(&tz);
            if check.minute() == 0 && check.second() == 0 {
                candidate
            } else {
                // Offset changed inside the hour (half-hour DST zones).
                let naive = local
                    .naive_local()
                    .date()
                    .and_hms_opt(local.hour(), 0, 0)
                    .unwrap_or_else(|| local.naive_local());
                resolve_local(tz, naive)
            }
        }
        TimeGrain::Day => local_midnight(tz, local.date_naive()),
        TimeGrain::Week => {
            let first = first_day_of_week.clamp(1, 7) as i64;
            let weekday = i64::from(local.weekday().number_from_monday());
            let mut back = weekday - first;
            if back < 0 {
                back += 7;
            }
            local_midnight(tz, local.date_naive() - Duration::days(back))
        }
        TimeGrain::Month => local_midnight(tz, first_of_month(local.year(), local.month())),
        TimeGrain::Quarter => {
            let first = first_month_of_year.clamp(1, 12);
            let back = (3 + local.month() - first % 3) % 3;
            let start = first_of_month(local.year(), local.month());
            let start = start.checked_sub_months(Months::new(back)).unwrap_or(start);
            local_midnight(tz, start)
        }
        TimeGrain::Year => {
            let first = first_month_of_year.clamp(1, 12);
            let year = if local.month() < first {
                local.year() - 1
            } else {
                local.year()
            };
            local_midnight(tz, first_of_month(year, first))
        }
    }
}

/// Smallest grain boundary strictly after `t`: `truncate(t + 1 grain)`.
///
/// `Unspecified` is the identity.
pub fn ceil_time(
    t: DateTime<Utc>,
    grain: TimeGrain,
    tz: Tz,
    first_day_of_week: u32,
    first_month_of_year: u32,
) -> DateTime<Utc> {
    if grain == TimeGrain::Unspecified {
        return t;
    }
    let mut next = t;
    let mut out = t;
    // A single step suffices except around sub-hour DST shifts.
    for _ in 0..4 {
        next = offset_time(next, grain, 1, tz);
        out = truncate_time(next, grain, tz, first_day_of_week, first_month_of_year);
        if out > t {
            return out;
        }
    }
    out.max(next)
}

/// Shift `t` by `n` grain units. Calendar grains move in local wall time and
/// clamp to the last day of shorter months.
pub fn offset_time(t: DateTime<Utc>, grain: TimeGrain, n: i32, tz: Tz) -> DateTime<Utc> {
    let n64 = i64::from(n);
    match grain {
        TimeGrain::Unspecified => t,
        TimeGrain::Millisecond => t + Duration::milliseconds(n64),
        TimeGrain::Second => t + Duration::seconds(n64),
        TimeGrain::Minute => t + Duration::minutes(n64),
        TimeGrain::Hour => t + Duration::hours(n64),
        TimeGrain::Day => shift_local(t, tz, |d| Some(d + Duration::days(n64))),
        TimeGrain::Week => shift_local(t, tz, |d| Some(d + Duration::weeks(n64))),
        TimeGrain::Month => shift_local(t, tz, |d| add_months(d, n)),
        TimeGrain::Quarter => shift_local(t, tz, |d| add_months(d, n.saturating_mul(3))),
        TimeGrain::Year => shift_local(t, tz, |d| add_months(d, n.saturating_mul(12))),
    }
}

fn add_months(d: NaiveDateTime, n: i32) -> Option<NaiveDateTime> {
    if n >= 0 {
        d.checked_add_months(Months::new(n.unsigned_abs()))
    } else {
        d.checked_sub_months(Months::new(n.unsigned_abs()))
    }
}

fn shift_local<F>(t: DateTime<Utc>, tz: Tz, shift: F) -> DateTime<Utc>
where
    F: FnOnce(NaiveDateTime) -> Option<NaiveDateTime>,
{
    let local = t.with_timezone(&tz).naive_local();
    match shift(local) {
        Some(shifted) => resolve_local(tz, shifted),
        None => t,
    }
}

fn first_of_month(year: i32, month: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(NaiveDate::MIN)
}

fn local_midnight(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    resolve_local(tz, date.and_time(chrono::NaiveTime::MIN))
}

/// Map a wall-clock time to UTC. Ambiguous times take the earlier instant;
/// times inside a DST gap move forward to the first valid instant.
fn resolve_local(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => t.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let mut probe = naive;
            for _ in 0..24 * 4 {
                probe += Duration::minutes(15);
                if let Some(t) = tz.from_local_datetime(&probe).earliest() {
                    return t.with_timezone(&Utc);
                }
            }
            Utc.from_utc_datetime(&naive)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn truncates_week_with_first_day() {
        let t = ts("2023-10-10T13:04:00Z");
        assert_eq!(
            truncate_time(t, TimeGrain::Week, Tz::UTC, 1, 1),
            ts("2023-10-09T00:00:00Z")
        );
        assert_eq!(
            truncate_time(t, TimeGrain::Week, Tz::UTC, 7, 1),
            ts("2023-10-08T00:00:00Z")
        );
        assert_eq!(
            truncate_time(t, TimeGrain::Week, Tz::UTC, 2, 1),
            ts("2023-10-10T00:00:00Z")
        );
    }

    #[test]
    fn truncates_quarter_and_year_with_first_month() {
        let t = ts("2023-10-01T00:20:00Z");
        assert_eq!(
            truncate_time(t, TimeGrain::Quarter, Tz::UTC, 1, 2),
            ts("2023-08-01T00:00:00Z")
        );
        assert_eq!(
            truncate_time(t, TimeGrain::Year, Tz::UTC, 1, 2),
            ts("2023-02-01T00:00:00Z")
        );
        assert_eq!(
            truncate_time(t, TimeGrain::Year, Tz::UTC, 1, 12),
            ts("2022-12-01T00:00:00Z")
        );
        assert_eq!(
            truncate_time(t, TimeGrain::Year, Tz::UTC, 1, 0),
            ts("2023-01-01T00:00:00Z")
        );
        assert_eq!(
            truncate_time(t, TimeGrain::Year, Tz::UTC, 1, 13),
            ts("2022-12-01T00:00:00Z")
        );
    }

    #[test]
    fn truncates_day_in_local_zone() {
        let ny: Tz = "America/New_York".parse().unwrap();
        assert_eq!(
            truncate_time(ts("2023-11-05T05:20:00Z"), TimeGrain::Day, ny, 1, 1),
            ts("2023-11-05T04:00:00Z")
        );
        let kathmandu: Tz = "Asia/Kathmandu".parse().unwrap();
        assert_eq!(
            truncate_time(ts("2019-01-07T04:20:00Z"), TimeGrain::Day, kathmandu, 1, 1),
            ts("2019-01-06T18:15:00Z")
        );
    }

    #[test]
    fn hour_follows_local_offset() {
        let kathmandu: Tz = "Asia/Kathmandu".parse().unwrap();
        assert_eq!(
            truncate_time(ts("2019-01-07T04:20:00Z"), TimeGrain::Hour, kathmandu, 1, 1),
            ts("2019-01-07T04:15:00Z")
        );
    }

    #[test]
    fn offset_clamps_month_end() {
        assert_eq!(
            offset_time(ts("2025-03-31T00:00:00Z"), TimeGrain::Month, -1, Tz::UTC),
            ts("2025-02-28T00:00:00Z")
        );
        assert_eq!(
            offset_time(ts("2024-01-31T00:00:00Z"), TimeGrain::Month, 1, Tz::UTC),
            ts("2024-02-29T00:00:00Z")
        );
    }

    #[test]
    fn unspecified_is_identity() {
        let t = ts("2023-10-10T13:04:05Z");
        assert_eq!(truncate_time(t, TimeGrain::Unspecified, Tz::UTC, 1, 1), t);
        assert_eq!(ceil_time(t, TimeGrain::Unspecified, Tz::UTC, 1, 1), t);
    }

    #[test]
    fn truncate_then_ceil_brackets_every_instant() {
        let zones: Vec<Tz> = ["UTC", "America/New_York", "Asia/Kathmandu", "Europe/London", "Australia/Sydney"]
            .iter()
            .map(|z| z.parse().unwrap())
            .collect();
        let base = ts("2023-01-01T00:00:00Z");
        for tz in zones {
            // Every 7h13m for roughly two years crosses both DST transitions.
            for step in 0..2400 {
                let t = base + Duration::minutes(433 * step);
                for grain in TimeGrain::ALL {
                    for (fdow, fmoy) in [(1, 1), (7, 4)] {
                        let lo = truncate_time(t, grain, tz, fdow, fmoy);
                        let hi = ceil_time(lo, grain, tz, fdow, fmoy);
                        assert!(lo <= t, "{grain} {tz} {t}: {lo} > t");
                        assert!(hi > t, "{grain} {tz} {t}: ceil {hi} <= t");
                    }
                }
            }
        }
    }

    #[test]
    fn parses_grain_spellings() {
        assert_eq!("TIME_GRAIN_DAY".parse::<TimeGrain>().unwrap(), TimeGrain::Day);
        assert_eq!("week".parse::<TimeGrain>().unwrap(), TimeGrain::Week);
        assert!("fortnight".parse::<TimeGrain>().is_err());
    }

    #[test]
    fn clamps_calendar_settings() {
        assert_eq!(clamp_first_day_of_week(0), 1);
        assert_eq!(clamp_first_day_of_week(7), 7);
        assert_eq!(clamp_first_month_of_year(13), 1);
        assert_eq!(clamp_first_month_of_year(6), 6);
    }
}
