//! Quota window calendar math.
//!
//! Reset boundaries are calendar-aware, matching real subscription billing
//! semantics, never pure 30-day arithmetic.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// How the start of the next monthly period is derived.
///
/// The source schema leaves the calendar semantics open, so the policy is
/// explicit configuration. There is no library default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum WindowPolicy {
    /// Windows reset at midnight UTC on the first of each month.
    FirstOfMonth,

    /// Windows reset on a fixed day of the month (billing anniversary).
    /// Days past the end of a month clamp to its last day.
    Anniversary {
        /// Day of month, 1-based.
        day: u32,
    },
}

/// The start of the next period strictly after `after`, per `policy`.
#[must_use]
pub fn next_reset(after: DateTime<Utc>, policy: WindowPolicy) -> DateTime<Utc> {
    match policy {
        WindowPolicy::FirstOfMonth => {
            let (year, month) = next_month(after.year(), after.month());
            midnight_utc(year, month, 1)
        }
        WindowPolicy::Anniversary { day } => {
            let candidate = midnight_utc(
                after.year(),
                after.month(),
                clamp_day(after.year(), after.month(), day),
            );
            if candidate > after {
                candidate
            } else {
                let (year, month) = next_month(after.year(), after.month());
                midnight_utc(year, month, clamp_day(year, month, day))
            }
        }
    }
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

fn clamp_day(year: i32, month: u32, day: u32) -> u32 {
    day.clamp(1, days_in_month(year, month))
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = next_month(year, month);
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map_or(28, |d| d.day())
}

fn midnight_utc(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    // Day is pre-clamped to the month length, so construction cannot fail.
    let date = NaiveDate::from_ymd_opt(year, month, day).unwrap_or(NaiveDate::MIN);
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn first_of_month_mid_month() {
        let next = next_reset(utc(2026, 8, 14, 9), WindowPolicy::FirstOfMonth);
        assert_eq!(next, utc(2026, 9, 1, 0));
    }

    #[test]
    fn first_of_month_rolls_over_year() {
        let next = next_reset(utc(2026, 12, 31, 23), WindowPolicy::FirstOfMonth);
        assert_eq!(next, utc(2027, 1, 1, 0));
    }

    #[test]
    fn first_of_month_exactly_at_boundary_moves_forward() {
        // A reset boundary is strictly after `after`; at midnight on the
        // first, the next boundary is a full month later.
        let next = next_reset(utc(2026, 9, 1, 0), WindowPolicy::FirstOfMonth);
        assert_eq!(next, utc(2026, 10, 1, 0));
    }

    #[test]
    fn anniversary_later_this_month() {
        let next = next_reset(utc(2026, 8, 10, 12), WindowPolicy::Anniversary { day: 20 });
        assert_eq!(next, utc(2026, 8, 20, 0));
    }

    #[test]
    fn anniversary_already_passed_goes_to_next_month() {
        let next = next_reset(utc(2026, 8, 25, 0), WindowPolicy::Anniversary { day: 20 });
        assert_eq!(next, utc(2026, 9, 20, 0));
    }

    #[test]
    fn anniversary_clamps_to_short_months() {
        // Day 31 anniversary from late January lands on the last day of
        // February, not March 3rd.
        let next = next_reset(utc(2026, 1, 31, 12), WindowPolicy::Anniversary { day: 31 });
        assert_eq!(next, utc(2026, 2, 28, 0));

        let leap = next_reset(utc(2028, 1, 31, 12), WindowPolicy::Anniversary { day: 31 });
        assert_eq!(leap, utc(2028, 2, 29, 0));
    }
}
