use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::{DeviceKind, Field, Reading, Series};
use crate::time::{parse_timestamp, Clock};

pub const TEMP_MIN_C: f64 = -40.0;
pub const TEMP_MAX_C: f64 = 85.0;
pub const HUMIDITY_MIN_PCT: f64 = 0.0;
pub const HUMIDITY_MAX_PCT: f64 = 100.0;
pub const SOIL_MOISTURE_MIN_PCT: f64 = 0.0;
pub const SOIL_MOISTURE_MAX_PCT: f64 = 100.0;
pub const LIGHT_MIN: f64 = 0.0;
pub const ACTUATOR_MIN: f64 = 0.0;
pub const ACTUATOR_MAX: f64 = 100.0;

/// Readings older than this are reported as stale
pub const DEFAULT_FRESHNESS_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingStatus {
    Ok,
    Missing,
    Stale,
    OutOfRange,
}

impl ReadingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingStatus::Ok => "ok",
            ReadingStatus::Missing => "missing",
            ReadingStatus::Stale => "stale",
            ReadingStatus::OutOfRange => "out_of_range",
        }
    }
}

impl fmt::Display for ReadingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Plausible bounds of a series; light has no upper bound
pub fn plausible_range(series: Series) -> (f64, Option<f64>) {
    match series {
        Series::Temperature => (TEMP_MIN_C, Some(TEMP_MAX_C)),
        Series::Humidity => (HUMIDITY_MIN_PCT, Some(HUMIDITY_MAX_PCT)),
        Series::SoilMoisture => (SOIL_MOISTURE_MIN_PCT, Some(SOIL_MOISTURE_MAX_PCT)),
        Series::Light => (LIGHT_MIN, None),
        Series::Fan | Series::Led | Series::Pump => (ACTUATOR_MIN, Some(ACTUATOR_MAX)),
    }
}

pub fn is_in_range(series: Series, value: f64) -> bool {
    let (min, max) = plausible_range(series);
    value.is_finite() && value >= min && max.map(|max| value <= max).unwrap_or(true)
}

/// Classify the newest reading of a series
/// An unparseable timestamp cannot prove freshness and counts as stale
pub fn classify(
    series: Series,
    reading: Option<&Reading>,
    now: DateTime<Utc>,
    freshness_secs: i64,
) -> ReadingStatus {
    let Some(reading) = reading else {
        return ReadingStatus::Missing;
    };
    if !is_in_range(series, reading.value) {
        return ReadingStatus::OutOfRange;
    }
    match parse_timestamp(&reading.timestamp) {
        Some(at) if (now - at).num_seconds() <= freshness_secs => ReadingStatus::Ok,
        _ => ReadingStatus::Stale,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSnapshot {
    pub series: Series,
    pub latest: Option<Reading>,
    pub status: ReadingStatus,
    /// Seconds since the newest reading, when its timestamp parses
    pub age_secs: Option<i64>,
}

/// Latest-value summary of one field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSnapshot {
    pub series: Vec<SeriesSnapshot>,
}

impl FieldSnapshot {
    pub fn build(field: &Field, clock: &dyn Clock, freshness_secs: i64) -> Self {
        let now = clock.now();
        let series = Series::ALL
            .into_iter()
            .map(|series| {
                let latest = field.latest(series);
                SeriesSnapshot {
                    series,
                    status: classify(series, latest, now, freshness_secs),
                    age_secs: latest
                        .and_then(|r| parse_timestamp(&r.timestamp))
                        .map(|at| (now - at).num_seconds()),
                    latest: latest.cloned(),
                }
            })
            .collect();
        Self { series }
    }

    pub fn get(&self, series: Series) -> Option<&SeriesSnapshot> {
        self.series.iter().find(|s| s.series == series)
    }

    /// A device is on when its newest status value is above zero
    pub fn is_on(&self, device: DeviceKind) -> bool {
        self.get(device.status_series())
            .and_then(|s| s.latest.as_ref())
            .map(|r| r.value > 0.0)
            .unwrap_or(false)
    }

    /// True when every series has a fresh in-range reading
    pub fn all_ok(&self) -> bool {
        self.series.iter().all(|s| s.status == ReadingStatus::Ok)
    }
}
