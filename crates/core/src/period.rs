//! Accounting periods (calendar months) used by closures and period locks.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// A calendar month.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> DomainResult<Self> {
        if !(1..=12).contains(&month) {
            return Err(DomainError::validation(format!("invalid month {month}")));
        }
        if NaiveDate::from_ymd_opt(year, month, 1).is_none() {
            return Err(DomainError::validation(format!("invalid year {year}")));
        }
        Ok(Self { year, month })
    }

    /// Period containing the given instant (UTC).
    pub fn containing(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn previous(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
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

    /// First day of the period.
    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    /// Last day of the period.
    pub fn last_day(&self) -> NaiveDate {
        self.next()
            .first_day()
            .pred_opt()
            .unwrap_or(NaiveDate::MAX)
    }

    /// Inclusive lower bound of the period window.
    pub fn starts_at(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.first_day().and_time(chrono::NaiveTime::MIN))
    }

    /// Exclusive upper bound of the period window.
    pub fn ends_before(&self) -> DateTime<Utc> {
        self.next().starts_at()
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.starts_at() && at < self.ends_before()
    }
}

impl core::fmt::Display for Period {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_month() {
        assert!(Period::new(2024, 0).is_err());
        assert!(Period::new(2024, 13).is_err());
    }

    #[test]
    fn window_bounds_and_neighbours() {
        let p = Period::new(2024, 2).unwrap();
        assert_eq!(p.last_day(), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert_eq!(p.previous(), Period::new(2024, 1).unwrap());
        assert_eq!(Period::new(2024, 12).unwrap().next(), Period::new(2025, 1).unwrap());
        assert_eq!(Period::new(2024, 1).unwrap().previous(), Period::new(2023, 12).unwrap());

        let inside = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap();
        let outside = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert!(p.contains(inside));
        assert!(!p.contains(outside));
        assert_eq!(Period::containing(outside), Period::new(2024, 3).unwrap());
        assert_eq!(p.to_string(), "2024-02");
    }
}
