//! Calendar periods used for range caches and the hydration window.
//!
//! Field-service activity is reported per calendar month, so the period is a
//! month, evaluated in the user's own time zone rather than UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A calendar month, displayed as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(|_| Self { year, month })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn last_day(&self) -> NaiveDate {
        self.next().first_day().pred_opt().unwrap_or(NaiveDate::MAX)
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Step back `months` calendar months.
    pub fn minus(&self, months: u32) -> Self {
        self.first_day()
            .checked_sub_months(Months::new(months))
            .map(Self::from_date)
            .unwrap_or(*self)
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let last = self.last_day();
        self.first_day().iter_days().take_while(move |d| *d <= last)
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| format!("expected YYYY-MM, got '{}'", s))?;
        let year: i32 = year.parse().map_err(|_| format!("invalid year in '{}'", s))?;
        let month: u32 = month.parse().map_err(|_| format!("invalid month in '{}'", s))?;
        Self::new(year, month).ok_or_else(|| format!("month out of range in '{}'", s))
    }
}

/// Inclusive date range covering one or more whole months.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub first: YearMonth,
    pub last: YearMonth,
}

impl Window {
    /// The month containing `now` in `tz`, extended back by `lookback_months`.
    pub fn current(now: DateTime<Utc>, tz: Tz, lookback_months: u32) -> Self {
        let local = now.with_timezone(&tz).date_naive();
        let last = YearMonth::from_date(local);
        Self {
            first: last.minus(lookback_months),
            last,
        }
    }

    pub fn start(&self) -> NaiveDate {
        self.first.first_day()
    }

    pub fn end(&self) -> NaiveDate {
        self.last.last_day()
    }

    pub fn months(&self) -> Vec<YearMonth> {
        let mut months = Vec::new();
        let mut month = self.first;
        while month <= self.last {
            months.push(month);
            month = month.next();
        }
        months
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start() && date <= self.end()
    }
}

/// Resolve the zone to evaluate periods in: the user's zone, then the
/// configured default, then UTC. Unknown names are logged and skipped.
pub fn resolve_time_zone(user_zone: Option<&str>, default_zone: Option<&str>) -> Tz {
    for name in [user_zone, default_zone].into_iter().flatten() {
        match name.parse::<Tz>() {
            Ok(tz) => return tz,
            Err(_) => warn!(zone = name, "Unknown time zone, falling back"),
        }
    }
    Tz::UTC
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_year_month_bounds() {
        let feb = YearMonth::new(2024, 2).expect("valid month");
        assert_eq!(feb.first_day(), NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert_eq!(feb.last_day(), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert_eq!(feb.days().count(), 29);

        let dec = YearMonth::new(2024, 12).expect("valid month");
        assert_eq!(dec.next().to_string(), "2025-01");
        assert_eq!(dec.last_day(), NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());
    }

    #[test]
    fn test_year_month_parse() {
        assert_eq!("2025-03".parse::<YearMonth>(), Ok(YearMonth { year: 2025, month: 3 }));
        assert!("2025-13".parse::<YearMonth>().is_err());
        assert!("march".parse::<YearMonth>().is_err());
    }

    #[test]
    fn test_minus_crosses_year() {
        let jan = YearMonth::new(2025, 1).expect("valid month");
        assert_eq!(jan.minus(2).to_string(), "2024-11");
        assert_eq!(jan.minus(0), jan);
    }

    #[test]
    fn test_window_uses_local_month() {
        // 2025-03-01 03:00 UTC is still February 28th in Chicago
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 3, 0, 0).unwrap();
        let chicago: Tz = "America/Chicago".parse().unwrap();

        let window = Window::current(now, chicago, 0);
        assert_eq!(window.start(), NaiveDate::from_ymd_opt(2025, 2, 1).unwrap());
        assert_eq!(window.end(), NaiveDate::from_ymd_opt(2025, 2, 28).unwrap());

        let utc_window = Window::current(now, Tz::UTC, 0);
        assert_eq!(utc_window.start(), NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());
    }

    #[test]
    fn test_window_lookback() {
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();
        let window = Window::current(now, Tz::UTC, 1);
        assert_eq!(window.months().len(), 2);
        assert_eq!(window.start(), NaiveDate::from_ymd_opt(2024, 12, 1).unwrap());
        assert!(window.contains(NaiveDate::from_ymd_opt(2025, 1, 31).unwrap()));
        assert!(!window.contains(NaiveDate::from_ymd_opt(2025, 2, 1).unwrap()));
    }

    #[test]
    fn test_resolve_time_zone_fallbacks() {
        assert_eq!(resolve_time_zone(Some("Europe/Berlin"), None), Tz::Europe__Berlin);
        assert_eq!(resolve_time_zone(Some("Mars/Olympus"), Some("Asia/Tokyo")), Tz::Asia__Tokyo);
        assert_eq!(resolve_time_zone(None, None), Tz::UTC);
    }
}
