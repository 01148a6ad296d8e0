use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CsdmError;

pub const REQUEST_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Start of the TAI93 time base used by CloudSat `UTC_start` and `Profile_time`.
pub fn tai93_epoch() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(1993, 1, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Leap seconds are not applied; offsets are plain elapsed seconds.
///
/// Fill values and anything else outside the representable range give `None`.
pub fn tai93_to_utc(seconds: f64) -> Option<DateTime<Utc>> {
    let millis = (seconds * 1000.0).round();
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return None;
    }
    let offset = TimeDelta::try_milliseconds(millis as i64)?;
    tai93_epoch().checked_add_signed(offset)
}

pub fn parse_request_time(value: &str) -> Result<NaiveDateTime, CsdmError> {
    let trimmed = value.trim();
    NaiveDateTime::parse_from_str(trimmed, REQUEST_TIME_FORMAT)
        .or_else(|_| {
            NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .map(|date| date.and_time(chrono::NaiveTime::MIN))
        })
        .map_err(|_| CsdmError::InvalidDate(value.to_string()))
}

/// Archive path convention for one day: `YYYY/DDD`.
pub fn day_dir(date: NaiveDate) -> String {
    format!("{:04}/{:03}", date.year(), date.ordinal())
}

/// Date encoded by the rightmost `YYYY/DDD` pair of a remote path.
pub fn path_date(path: &str) -> Option<NaiveDate> {
    let segments = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();
    segments.windows(2).rev().find_map(|pair| {
        let (year, day) = (pair[0], pair[1]);
        let is_year = year.len() == 4 && year.chars().all(|ch| ch.is_ascii_digit());
        let is_day = day.len() == 3 && day.chars().all(|ch| ch.is_ascii_digit());
        if !is_year || !is_day {
            return None;
        }
        NaiveDate::from_yo_opt(year.parse().ok()?, day.parse().ok()?)
    })
}

/// Acquisition start encoded in a granule name, e.g. `2012034161842_30691_CS_...`.
pub fn granule_timestamp(file_name: &str) -> Option<NaiveDateTime> {
    let name = file_name.rsplit('/').next().unwrap_or(file_name);
    let stamp = name.get(..13)?;
    if !stamp.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    let date = NaiveDate::from_yo_opt(stamp[..4].parse().ok()?, stamp[4..7].parse().ok()?)?;
    date.and_hms_opt(
        stamp[7..9].parse().ok()?,
        stamp[9..11].parse().ok()?,
        stamp[11..13].parse().ok()?,
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "[String; 2]", into = "[String; 2]")]
pub struct DateRange {
    start: NaiveDateTime,
    end: NaiveDateTime,
}

impl DateRange {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self, CsdmError> {
        if end < start {
            return Err(CsdmError::InvalidDate(format!(
                "range end {end} precedes start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    pub fn end(&self) -> NaiveDateTime {
        self.end
    }

    /// Inclusive at day granularity, which is the resolution of the archive layout.
    pub fn contains_date(&self, date: NaiveDate) -> bool {
        self.start.date() <= date && date <= self.end.date()
    }

    pub fn contains_path(&self, path: &str) -> bool {
        path_date(path)
            .map(|date| self.contains_date(date))
            .unwrap_or(false)
    }

    pub fn days(&self) -> Vec<NaiveDate> {
        self.start
            .date()
            .iter_days()
            .take_while(|day| *day <= self.end.date())
            .collect()
    }

    pub fn day_dirs(&self) -> Vec<String> {
        self.days().into_iter().map(day_dir).collect()
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{}",
            self.start.format(REQUEST_TIME_FORMAT),
            self.end.format(REQUEST_TIME_FORMAT)
        )
    }
}

impl FromStr for DateRange {
    type Err = CsdmError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (start, end) = value
            .split_once("..")
            .ok_or_else(|| CsdmError::InvalidDate(value.to_string()))?;
        Self::new(parse_request_time(start)?, parse_request_time(end)?)
    }
}

impl TryFrom<[String; 2]> for DateRange {
    type Error = CsdmError;

    fn try_from(value: [String; 2]) -> Result<Self, Self::Error> {
        Self::new(parse_request_time(&value[0])?, parse_request_time(&value[1])?)
    }
}

impl From<DateRange> for [String; 2] {
    fn from(value: DateRange) -> Self {
        [
            value.start.format(REQUEST_TIME_FORMAT).to_string(),
            value.end.format(REQUEST_TIME_FORMAT).to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn path_date_reads_year_and_day_of_year() {
        let path = "//Data/2B-GEOPROF.P1_R05/2012/034/2012034161842_30691_CS_2B-GEOPROF_GRANULE_P1_R05_E05_F00.hdf";
        assert_eq!(path_date(path), NaiveDate::from_ymd_opt(2012, 2, 3));
        assert_eq!(path_date("//Data/2B-GEOPROF.P1_R05/readme.txt"), None);
    }

    #[test]
    fn day_dir_pads_day_of_year() {
        let date = NaiveDate::from_ymd_opt(2012, 1, 9).unwrap();
        assert_eq!(day_dir(date), "2012/009");
    }

    #[test]
    fn range_is_inclusive_by_day() {
        let range: DateRange = "2012-02-03T00:00:00..2012-02-04T00:00:00".parse().unwrap();
        assert_eq!(range.day_dirs(), vec!["2012/034", "2012/035"]);
        assert!(range.contains_path("/Data/P/2012/035/x.hdf"));
        assert!(!range.contains_path("/Data/P/2012/036/x.hdf"));
        assert!(!range.contains_path("/Data/P/2012/033/x.hdf"));
    }

    #[test]
    fn reversed_range_is_rejected() {
        let err = "2012-02-04T00:00:00..2012-02-03T00:00:00"
            .parse::<DateRange>()
            .unwrap_err();
        assert_matches!(err, CsdmError::InvalidDate(_));
    }

    #[test]
    fn range_deserializes_from_request_pair() {
        let range: DateRange =
            serde_json::from_str(r#"["2012-02-03T00:00:00", "2012-02-04T12:30:00"]"#).unwrap();
        assert_eq!(range.end().format(REQUEST_TIME_FORMAT).to_string(), "2012-02-04T12:30:00");
    }

    #[test]
    fn granule_timestamp_parses_prefix() {
        let stamp = granule_timestamp("2012034161842_30691_CS_2B-GEOPROF_GRANULE_P1_R05_E05_F00.hdf")
            .unwrap();
        assert_eq!(stamp.to_string(), "2012-02-03 16:18:42");
        assert_eq!(granule_timestamp("readme.txt"), None);
    }

    #[test]
    fn tai93_offsets_count_from_1993() {
        assert_eq!(tai93_to_utc(0.0), Some(tai93_epoch()));
        let time = tai93_to_utc(604_800.5).unwrap();
        assert_eq!(time.to_rfc3339(), "1993-01-08T00:00:00.500+00:00");
    }

    #[test]
    fn tai93_fill_values_are_rejected() {
        assert_eq!(tai93_to_utc(9.96921e36), None);
        assert_eq!(tai93_to_utc(-9999.0e20), None);
        assert_eq!(tai93_to_utc(f64::NAN), None);
        assert_eq!(tai93_to_utc(f64::INFINITY), None);
    }
}
