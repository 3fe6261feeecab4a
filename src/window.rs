//! Prediction-window bucketing on the 10-minute UTC grid.

use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const WINDOW_GRID_MINUTES: u32 = 10;
pub const WINDOW_SPAN_HOURS: i64 = 1;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WindowError {
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// One-hour prediction window `[start, start + 1h)` aligned to the 10-minute grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PredictionWindow {
    start: DateTime<Utc>,
}

impl PredictionWindow {
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::hours(WINDOW_SPAN_HOURS)
    }

    pub fn date(&self) -> NaiveDate {
        self.start.date_naive()
    }

    pub fn time(&self) -> NaiveTime {
        self.start.time()
    }

    pub fn id(&self) -> WindowId {
        WindowId(format!(
            "{}_{}",
            self.date_token(),
            self.start.format("%H_%M_%S")
        ))
    }

    /// `YYYY_MM_DD`, used to address per-window output units by date.
    pub fn date_token(&self) -> String {
        self.start.format("%Y_%m_%d").to_string()
    }
}

impl fmt::Display for PredictionWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.start.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

/// Composite-key half shared by every row of one window, e.g. `2025_01_06_14_10_00`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(String);

impl WindowId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn floor_window(ts: DateTime<Utc>) -> PredictionWindow {
    let floored_minute = (ts.minute() / WINDOW_GRID_MINUTES) * WINDOW_GRID_MINUTES;
    let naive = ts.date_naive().and_time(
        NaiveTime::from_hms_opt(ts.hour(), floored_minute, 0)
            .unwrap_or(NaiveTime::MIN),
    );
    PredictionWindow {
        start: Utc.from_utc_datetime(&naive),
    }
}

pub fn window_at(date: NaiveDate, time: NaiveTime) -> PredictionWindow {
    floor_window(Utc.from_utc_datetime(&NaiveDateTime::new(date, time)))
}

pub fn parse_window(date_str: &str, time_str: &str) -> Result<PredictionWindow, WindowError> {
    let date = parse_date(date_str)?;
    let time = parse_time(time_str)?;
    Ok(window_at(date, time))
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, WindowError> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
        .map_err(|_| WindowError::InvalidTimestamp(raw.to_string()))
}

pub fn parse_time(raw: &str) -> Result<NaiveTime, WindowError> {
    NaiveTime::parse_from_str(raw.trim(), TIME_FORMAT)
        .map_err(|_| WindowError::InvalidTimestamp(raw.to_string()))
}
