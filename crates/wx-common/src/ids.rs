//! Identifier grammars for runs, frames and externally visible path segments.
//!
//! Every identifier that ends up as a directory or file name is validated here
//! before it touches the filesystem.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{WxError, WxResult};

/// Largest forecast hour representable by a 3-digit frame id.
pub const MAX_FORECAST_HOUR: u32 = 999;

/// Validate a model/run/variable segment against `^[a-z0-9_-]+$`.
pub fn validate_segment(segment: &str) -> WxResult<&str> {
    let ok = !segment.is_empty()
        && segment
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if ok {
        Ok(segment)
    } else {
        Err(WxError::InvalidSegment(segment.to_string()))
    }
}

/// A model cycle identifier, `YYYYMMDD_HHz`.
///
/// The fixed-width format means string order equals chronological order,
/// so `Ord` is derived from the underlying string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Parse and validate a run id.
    pub fn parse(s: &str) -> WxResult<Self> {
        if Self::is_valid(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(WxError::InvalidRunId(s.to_string()))
        }
    }

    /// Check a string against `^\d{8}_\d{2}z$` without allocating.
    pub fn is_valid(s: &str) -> bool {
        let b = s.as_bytes();
        b.len() == 12
            && b[..8].iter().all(u8::is_ascii_digit)
            && b[8] == b'_'
            && b[9..11].iter().all(u8::is_ascii_digit)
            && b[11] == b'z'
    }

    /// Build a run id from a `YYYYMMDD` date string and a cycle hour.
    pub fn from_parts(date: &str, hour: u32) -> WxResult<Self> {
        Self::parse(&format!("{}_{:02}z", date, hour))
    }

    /// Build a run id from a reference time (minutes and seconds are dropped).
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.format("%Y%m%d_%Hz").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `YYYYMMDD` part.
    pub fn date(&self) -> &str {
        &self.0[..8]
    }

    /// The cycle hour.
    pub fn hour(&self) -> u32 {
        self.0[9..11].parse().unwrap_or(0)
    }

    /// Model initialization time, if the date is a real calendar date.
    pub fn reference_time(&self) -> Option<DateTime<Utc>> {
        let date = NaiveDate::parse_from_str(self.date(), "%Y%m%d").ok()?;
        let naive = date.and_hms_opt(self.hour(), 0, 0)?;
        Some(Utc.from_utc_datetime(&naive))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RunId {
    type Err = WxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RunId {
    type Error = WxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if Self::is_valid(&value) {
            Ok(Self(value))
        } else {
            Err(WxError::InvalidRunId(value))
        }
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

/// Either a concrete run or the literal `latest`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RunSelector {
    Latest,
    Run(RunId),
}

impl RunSelector {
    pub fn parse(s: &str) -> WxResult<Self> {
        if s.eq_ignore_ascii_case("latest") {
            Ok(RunSelector::Latest)
        } else {
            RunId::parse(s).map(RunSelector::Run)
        }
    }
}

impl FromStr for RunSelector {
    type Err = WxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<RunId> for RunSelector {
    fn from(run: RunId) -> Self {
        RunSelector::Run(run)
    }
}

impl fmt::Display for RunSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunSelector::Latest => f.write_str("latest"),
            RunSelector::Run(run) => run.fmt(f),
        }
    }
}

/// Frame identifier: the forecast hour as a zero-padded 3-digit string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(u16);

impl FrameId {
    pub fn from_hour(fhr: u32) -> WxResult<Self> {
        if fhr > MAX_FORECAST_HOUR {
            return Err(WxError::ForecastHourOutOfRange(fhr));
        }
        Ok(Self(fhr as u16))
    }

    /// Parse `"000"`..`"999"`; anything else is rejected.
    pub fn parse(s: &str) -> WxResult<Self> {
        let b = s.as_bytes();
        if b.len() != 3 || !b.iter().all(u8::is_ascii_digit) {
            return Err(WxError::InvalidFrameId(s.to_string()));
        }
        s.parse::<u16>()
            .map(Self)
            .map_err(|_| WxError::InvalidFrameId(s.to_string()))
    }

    pub fn forecast_hour(&self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}
