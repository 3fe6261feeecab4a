//! Month-addressed raw trip log loading into an indexed [`EventLog`].

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::{Event, EventLog, SpatialError, SpatialIndexer};

const MAX_REPORTED_REJECTS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordPolicy {
    Strict,
    ReportAndSkip,
}

impl RecordPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "strict" => Some(Self::Strict),
            "skip" | "report_and_skip" => Some(Self::ReportAndSkip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryConfig {
    pub data_dir: PathBuf,
    pub record_policy: RecordPolicy,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            record_policy: RecordPolicy::Strict,
        }
    }
}

/// One raw trip as exported in the monthly JSON files; unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripRecord {
    #[serde(rename = "SpecifiedStartDate", default)]
    pub specified_start_date: Option<String>,
    #[serde(rename = "LatitudeStart", default)]
    pub latitude_start: Option<f64>,
    #[serde(rename = "LongitudeStart", default)]
    pub longitude_start: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthRef {
    pub month_start: NaiveDate,
    pub relative_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryLoadRequest {
    pub first_date: NaiveDate,
    /// Events dated after this day are discarded.
    pub cutoff_date: NaiveDate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryLoadReport {
    pub months_planned: u64,
    pub months_missing: Vec<PathBuf>,
    pub records_read: u64,
    pub records_rejected: u64,
    pub records_after_cutoff: u64,
    pub events_loaded: u64,
    pub rejects: Vec<String>,
}

#[derive(Debug, Error)]
pub enum HistoryLoadError {
    #[error("invalid history load request: {0}")]
    InvalidRequest(String),
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid timestamp '{value}' in {path}")]
    InvalidTimestamp { path: PathBuf, value: String },
    #[error("invalid coordinate in {path}: {source}")]
    InvalidCoordinate {
        path: PathBuf,
        #[source]
        source: SpatialError,
    },
}

pub fn month_file_name(month_start: NaiveDate) -> String {
    format!(
        "data-{:04}-{:02}-01.json",
        month_start.year(),
        month_start.month()
    )
}

/// Every calendar month touching `[first_date, cutoff_date]`, oldest first.
pub fn plan_required_months(req: &HistoryLoadRequest) -> Vec<MonthRef> {
    if req.cutoff_date < req.first_date {
        return Vec::new();
    }

    let mut out = Vec::new();
    let mut month = month_start(req.first_date);
    let end_month = month_start(req.cutoff_date);
    while month <= end_month {
        out.push(MonthRef {
            month_start: month,
            relative_path: PathBuf::from(month_file_name(month)),
        });
        match next_month(month) {
            Some(next) => month = next,
            None => break,
        }
    }
    out
}

/// Loads, indexes and snapshots every month file for the request.
///
/// Missing month files are warned about and skipped. Record-level faults follow
/// `cfg.record_policy`.
pub fn load_event_log(
    req: &HistoryLoadRequest,
    cfg: &HistoryConfig,
    indexer: &SpatialIndexer,
) -> Result<(EventLog, HistoryLoadReport), HistoryLoadError> {
    if req.cutoff_date < req.first_date {
        return Err(HistoryLoadError::InvalidRequest(
            "cutoff_date must not precede first_date".to_string(),
        ));
    }

    let months = plan_required_months(req);
    info!(
        component = "history",
        event = "history.load.start",
        data_dir = %cfg.data_dir.display(),
        first_date = %req.first_date,
        cutoff_date = %req.cutoff_date,
        month_count = months.len(),
        record_policy = ?cfg.record_policy
    );

    let mut report = HistoryLoadReport {
        months_planned: months.len() as u64,
        ..HistoryLoadReport::default()
    };
    let mut events = Vec::new();

    for month in &months {
        let path = cfg.data_dir.join(&month.relative_path);
        if !path.exists() {
            warn!(
                component = "history",
                event = "history.month.missing",
                path = %path.display()
            );
            report.months_missing.push(path);
            continue;
        }

        let records = read_month_file(&path)?;
        let read = records.len();
        report.records_read += read as u64;
        for record in records {
            match record_to_event(&record, indexer, &path) {
                Ok(event) if event.event_date > req.cutoff_date => {
                    report.records_after_cutoff += 1;
                }
                Ok(event) => events.push(event),
                Err(err) => handle_rejected_record(err, cfg.record_policy, &mut report)?,
            }
        }

        info!(
            component = "history",
            event = "history.month.read",
            path = %path.display(),
            records = read
        );
    }

    let log = EventLog::new(events);
    report.events_loaded = log.len() as u64;

    if log.is_empty() {
        warn!(
            component = "history",
            event = "history.load.empty",
            months_planned = report.months_planned,
            months_missing = report.months_missing.len()
        );
    }

    info!(
        component = "history",
        event = "history.load.finish",
        records_read = report.records_read,
        records_rejected = report.records_rejected,
        records_after_cutoff = report.records_after_cutoff,
        events_loaded = report.events_loaded
    );

    Ok((log, report))
}

/// Parses an ISO-8601 start timestamp; naive values are taken as UTC.
pub fn parse_event_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in [
        "%Y-%m-%d %H:%M:%S%.f%:z",
        "%Y-%m-%dT%H:%M:%S%.f%z",
        "%Y-%m-%d %H:%M:%S%.f%z",
    ] {
        if let Ok(ts) = DateTime::parse_from_str(trimmed, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

fn read_month_file(path: &Path) -> Result<Vec<TripRecord>, HistoryLoadError> {
    let bytes = fs::read(path).map_err(|source| HistoryLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| HistoryLoadError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn record_to_event(
    record: &TripRecord,
    indexer: &SpatialIndexer,
    path: &Path,
) -> Result<Event, HistoryLoadError> {
    let raw_start = record.specified_start_date.as_deref().unwrap_or_default();
    let event_time =
        parse_event_timestamp(raw_start).ok_or_else(|| HistoryLoadError::InvalidTimestamp {
            path: path.to_path_buf(),
            value: raw_start.to_string(),
        })?;

    let latitude = record.latitude_start.unwrap_or(f64::NAN);
    let longitude = record.longitude_start.unwrap_or(f64::NAN);
    let cell = indexer
        .index(latitude, longitude)
        .map_err(|source| HistoryLoadError::InvalidCoordinate {
            path: path.to_path_buf(),
            source,
        })?;

    Ok(Event::new(cell, event_time))
}

fn handle_rejected_record(
    err: HistoryLoadError,
    policy: RecordPolicy,
    report: &mut HistoryLoadReport,
) -> Result<(), HistoryLoadError> {
    match policy {
        RecordPolicy::Strict => Err(err),
        RecordPolicy::ReportAndSkip => {
            let details = err.to_string();
            warn!(
                component = "history",
                event = "history.record.rejected",
                details = %details
            );
            report.records_rejected += 1;
            if report.rejects.len() < MAX_REPORTED_REJECTS {
                report.rejects.push(details);
            }
            Ok(())
        }
    }
}

fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}
