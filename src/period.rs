//! Bucket periods and series keys.
//!
//! A [`Period`] partitions the timeline into calendar buckets and names each
//! bucket with a sortable series key: `2026010523` for the hourly bucket
//! covering 2026-01-05 05:00 UTC, `20260105` for the daily one, `202601` and
//! `2026` for month and year. The reference calendar is UTC, always.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Days, Duration, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// File name suffix for bucket store files.
pub const STORE_FILE_SUFFIX: &str = ".db";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PeriodError {
    /// A period name that is none of `hourly`, `daily`, `monthly`, `yearly`.
    #[error("unknown period {0:?}")]
    UnknownPeriod(String),

    /// A series key that does not parse back into a calendar bucket.
    #[error("malformed series key {0:?}")]
    InvalidSeries(String),
}

/// Granularity of the time-bucketed store rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Hourly,
    Daily,
    Monthly,
    Yearly,
}

impl Period {
    /// The series key of the bucket containing `t`. Pure: equal timestamps
    /// always yield equal keys, and keys sort chronologically.
    pub fn series(&self, t: DateTime<Utc>) -> String {
        t.format(self.series_format()).to_string()
    }

    /// The series key of the bucket immediately after `series`.
    pub fn next_series(&self, series: &str) -> Result<String, PeriodError> {
        self.step(series, true)
    }

    /// The series key of the bucket immediately before `series`.
    pub fn prev_series(&self, series: &str) -> Result<String, PeriodError> {
        self.step(series, false)
    }

    /// Where the bucket's store file lives. Hour and day files nest under
    /// their `YYYYMM` directory to bound fan-out; month and year files sit
    /// directly under `base_dir`.
    ///
    /// `series` must be a key produced by [`Period::series`] or stepped from
    /// one with the same period.
    pub fn bucket_path(&self, base_dir: &Utf8Path, series: &str) -> Utf8PathBuf {
        let file = format!("{series}{STORE_FILE_SUFFIX}");
        match self {
            Period::Hourly | Period::Daily => base_dir.join(&series[..6]).join(file),
            Period::Monthly | Period::Yearly => base_dir.join(file),
        }
    }

    fn series_format(&self) -> &'static str {
        match self {
            Period::Hourly => "%Y%m%d%H",
            Period::Daily => "%Y%m%d",
            Period::Monthly => "%Y%m",
            Period::Yearly => "%Y",
        }
    }

    /// Step one bucket forward or backward, recomputing from a real calendar
    /// date so month lengths and leap years are honored.
    fn step(&self, series: &str, forward: bool) -> Result<String, PeriodError> {
        let invalid = || PeriodError::InvalidSeries(series.to_string());
        if !series.is_ascii() || series.len() != self.series_len() {
            return Err(invalid());
        }
        match self {
            Period::Hourly => {
                let date =
                    NaiveDate::parse_from_str(&series[..8], "%Y%m%d").map_err(|_| invalid())?;
                let hour: u32 = series[8..].parse().map_err(|_| invalid())?;
                let t = date.and_hms_opt(hour, 0, 0).ok_or_else(invalid)?;
                let t = if forward {
                    t + Duration::hours(1)
                } else {
                    t - Duration::hours(1)
                };
                Ok(t.format("%Y%m%d%H").to_string())
            }
            Period::Daily => {
                let date = NaiveDate::parse_from_str(series, "%Y%m%d").map_err(|_| invalid())?;
                let date = if forward {
                    date.checked_add_days(Days::new(1))
                } else {
                    date.checked_sub_days(Days::new(1))
                }
                .ok_or_else(invalid)?;
                Ok(date.format("%Y%m%d").to_string())
            }
            Period::Monthly => {
                let year: i32 = series[..4].parse().map_err(|_| invalid())?;
                let month: u32 = series[4..].parse().map_err(|_| invalid())?;
                let date = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)?;
                let date = if forward {
                    date.checked_add_months(Months::new(1))
                } else {
                    date.checked_sub_months(Months::new(1))
                }
                .ok_or_else(invalid)?;
                Ok(date.format("%Y%m").to_string())
            }
            Period::Yearly => {
                let year: i32 = series.parse().map_err(|_| invalid())?;
                let year = if forward { year + 1 } else { year - 1 };
                Ok(format!("{year:04}"))
            }
        }
    }

    fn series_len(&self) -> usize {
        match self {
            Period::Hourly => 10,
            Period::Daily => 8,
            Period::Monthly => 6,
            Period::Yearly => 4,
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Period::Hourly => "hourly",
            Period::Daily => "daily",
            Period::Monthly => "monthly",
            Period::Yearly => "yearly",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Period {
    type Err = PeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(Period::Hourly),
            "daily" => Ok(Period::Daily),
            "monthly" => Ok(Period::Monthly),
            "yearly" => Ok(Period::Yearly),
            other => Err(PeriodError::UnknownPeriod(other.to_string())),
        }
    }
}
