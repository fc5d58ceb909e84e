//! Time handling utilities for meteorological data.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::RunId;

/// Represents a valid time for meteorological data.
///
/// Combines reference time (model run time) and forecast offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidTime {
    /// Model run/reference time
    pub reference_time: DateTime<Utc>,
    /// Forecast hour offset from reference time
    pub forecast_hour: u32,
}

impl ValidTime {
    pub fn new(reference_time: DateTime<Utc>, forecast_hour: u32) -> Self {
        Self {
            reference_time,
            forecast_hour,
        }
    }

    /// Valid time for a run id, or `None` when the run id is not a real date.
    pub fn for_run(run: &RunId, forecast_hour: u32) -> Option<Self> {
        run.reference_time().map(|t| Self::new(t, forecast_hour))
    }

    /// Calculate the actual valid time (reference + forecast offset)
    pub fn valid_datetime(&self) -> DateTime<Utc> {
        self.reference_time + Duration::hours(self.forecast_hour as i64)
    }

    /// ISO 8601 rendering used in manifests, e.g. `2026-02-07T07:00:00Z`.
    pub fn to_iso8601(&self) -> String {
        self.valid_datetime()
            .to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Cache path component for this time: `YYYYMMDD/HH`.
    pub fn cache_path(&self) -> String {
        self.reference_time.format("%Y%m%d/%H").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_valid_time_iso() {
        let run = RunId::parse("20260207_01z").unwrap();
        let vt = ValidTime::for_run(&run, 5).unwrap();
        assert_eq!(vt.to_iso8601(), "2026-02-07T06:00:00Z");
    }

    #[test]
    fn test_valid_time_crosses_day() {
        let vt = ValidTime::new(Utc.with_ymd_and_hms(2026, 2, 7, 18, 0, 0).unwrap(), 12);
        assert_eq!(vt.to_iso8601(), "2026-02-08T06:00:00Z");
        assert_eq!(vt.cache_path(), "20260207/18");
    }

    #[test]
    fn test_invalid_calendar_date() {
        let run = RunId::parse("20261340_00z").unwrap();
        assert!(ValidTime::for_run(&run, 0).is_none());
    }
}
