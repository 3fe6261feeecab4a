//! Per-window feature table: calendar fields, label merge, schema and persistence.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::calendar::{is_sunday, is_weekend, part_of_day, season_of_year, weekday_one_hot};
use crate::{
    CellFeatures, CellId, FeatureKey, LabelTable, PredictionWindow, WindowAggregate, WindowId,
};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;
pub const LABEL_COLUMN: &str = "trip_count";

const FEATURE_COLUMNS: [(&str, ColumnType); 24] = [
    ("h3_cell", ColumnType::Text),
    ("id_timestamp", ColumnType::Text),
    ("prev_1_hour_cnt", ColumnType::Int),
    ("prev_2_hour_cnt", ColumnType::Int),
    ("prev_3_hour_cnt", ColumnType::Int),
    ("1_weeks_back_moving_avg", ColumnType::Float),
    ("2_weeks_back_moving_avg", ColumnType::Float),
    ("3_weeks_back_moving_avg", ColumnType::Float),
    ("4_weeks_back_moving_avg", ColumnType::Float),
    ("h3_cell_1_month_popularity", ColumnType::Float),
    ("h3_cell_1_week_popularity", ColumnType::Float),
    ("trip_count_1_year_back", ColumnType::Int),
    ("prediction_date_time_start", ColumnType::Timestamp),
    ("prediction_date_time_end", ColumnType::Timestamp),
    ("is_weekend", ColumnType::Int),
    ("is_monday", ColumnType::Int),
    ("is_tuesday", ColumnType::Int),
    ("is_wednesday", ColumnType::Int),
    ("is_thursday", ColumnType::Int),
    ("is_friday", ColumnType::Int),
    ("is_saturday", ColumnType::Int),
    ("is_sunday", ColumnType::Int),
    ("part_of_day", ColumnType::Int),
    ("season", ColumnType::Int),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Train,
    Score,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Score => "score",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "train" => Some(Self::Train),
            "score" => Some(Self::Score),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Text,
    Int,
    Float,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: ColumnType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub mode: Mode,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// One persisted row. Field names follow the column names so units can be read back with serde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub h3_cell: CellId,
    pub id_timestamp: WindowId,
    pub prev_1_hour_cnt: u32,
    pub prev_2_hour_cnt: u32,
    pub prev_3_hour_cnt: u32,
    #[serde(rename = "1_weeks_back_moving_avg")]
    pub weeks_back_1_moving_avg: f64,
    #[serde(rename = "2_weeks_back_moving_avg")]
    pub weeks_back_2_moving_avg: f64,
    #[serde(rename = "3_weeks_back_moving_avg")]
    pub weeks_back_3_moving_avg: f64,
    #[serde(rename = "4_weeks_back_moving_avg")]
    pub weeks_back_4_moving_avg: f64,
    pub h3_cell_1_month_popularity: f64,
    pub h3_cell_1_week_popularity: f64,
    pub trip_count_1_year_back: u32,
    pub prediction_date_time_start: DateTime<Utc>,
    pub prediction_date_time_end: DateTime<Utc>,
    pub is_weekend: u8,
    pub is_monday: u8,
    pub is_tuesday: u8,
    pub is_wednesday: u8,
    pub is_thursday: u8,
    pub is_friday: u8,
    pub is_saturday: u8,
    pub is_sunday: u8,
    pub part_of_day: u8,
    pub season: u8,
    #[serde(default)]
    pub trip_count: Option<u32>,
}

impl FeatureRow {
    /// Values in schema order; the label is appended only when present.
    pub fn record(&self) -> Vec<String> {
        let mut out = vec![
            self.h3_cell.to_string(),
            self.id_timestamp.to_string(),
            self.prev_1_hour_cnt.to_string(),
            self.prev_2_hour_cnt.to_string(),
            self.prev_3_hour_cnt.to_string(),
            self.weeks_back_1_moving_avg.to_string(),
            self.weeks_back_2_moving_avg.to_string(),
            self.weeks_back_3_moving_avg.to_string(),
            self.weeks_back_4_moving_avg.to_string(),
            self.h3_cell_1_month_popularity.to_string(),
            self.h3_cell_1_week_popularity.to_string(),
            self.trip_count_1_year_back.to_string(),
            format_ts(self.prediction_date_time_start),
            format_ts(self.prediction_date_time_end),
            self.is_weekend.to_string(),
            self.is_monday.to_string(),
            self.is_tuesday.to_string(),
            self.is_wednesday.to_string(),
            self.is_thursday.to_string(),
            self.is_friday.to_string(),
            self.is_saturday.to_string(),
            self.is_sunday.to_string(),
            self.part_of_day.to_string(),
            self.season.to_string(),
        ];
        if let Some(label) = self.trip_count {
            out.push(label.to_string());
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub window: PredictionWindow,
    pub mode: Mode,
    pub schema: FeatureSchema,
    pub rows: Vec<FeatureRow>,
    /// Label-only keys, which have no window start and never reach persistence.
    pub dropped_rows: usize,
}

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("cannot write output for window {window_id} to {path}: {source}")]
    MissingOutputTarget {
        window_id: WindowId,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode table for window {window_id}: {message}")]
    Encode { window_id: WindowId, message: String },
}

#[derive(Debug, Clone, Copy)]
struct CalendarFields {
    is_weekend: u8,
    is_sunday: u8,
    weekdays: [u8; 7],
    part_of_day: u8,
    season: u8,
}

impl CalendarFields {
    fn for_start(start: DateTime<Utc>) -> Self {
        Self {
            is_weekend: u8::from(is_weekend(start)),
            is_sunday: u8::from(is_sunday(start)),
            weekdays: weekday_one_hot(start).map(u8::from),
            part_of_day: part_of_day(start),
            season: season_of_year(start.month()),
        }
    }
}

#[derive(Debug, Default)]
struct MergedRow {
    features: Option<CellFeatures>,
    label: Option<u32>,
}

pub fn build_feature_schema(mode: Mode) -> FeatureSchema {
    let mut columns: Vec<FeatureColumn> = FEATURE_COLUMNS
        .iter()
        .map(|(name, dtype)| FeatureColumn {
            name: (*name).to_string(),
            dtype: *dtype,
        })
        .collect();
    if mode == Mode::Train {
        columns.push(FeatureColumn {
            name: LABEL_COLUMN.to_string(),
            dtype: ColumnType::Int,
        });
    }

    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    let fingerprint = schema_fingerprint(FEATURE_SCHEMA_VERSION, mode, &names);

    FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        mode,
        fingerprint,
        columns,
    }
}

pub fn schema_fingerprint(version: u32, mode: Mode, column_names: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{version};"));
    hasher.update(format!("mode:{};", mode.as_str()));
    hasher.update("columns:");
    for name in column_names {
        hasher.update(name.as_bytes());
        hasher.update(";");
    }
    hex::encode(hasher.finalize())
}

/// Merges the aggregate with the label table (training only) and attaches calendar fields.
///
/// In training mode labels are outer-joined on `(cell, window_id)`: feature rows
/// without a label get `0`, label-only keys lack a window start and are dropped.
pub fn assemble_window_table(
    aggregate: WindowAggregate,
    labels: Option<&LabelTable>,
    mode: Mode,
) -> FeatureTable {
    let window = aggregate.window;
    let start = window.start();
    let end = window.end();
    let calendar = CalendarFields::for_start(start);

    let mut merged: BTreeMap<FeatureKey, MergedRow> = aggregate
        .rows
        .into_iter()
        .map(|(key, features)| {
            (
                key,
                MergedRow {
                    features: Some(features),
                    label: None,
                },
            )
        })
        .collect();

    if mode == Mode::Train {
        if let Some(labels) = labels {
            for (key, count) in &labels.counts {
                merged.entry(key.clone()).or_default().label = Some(*count);
            }
        }
    }

    let mut rows = Vec::with_capacity(merged.len());
    let mut dropped_rows = 0usize;
    for (key, row) in merged {
        let Some(features) = row.features else {
            dropped_rows += 1;
            continue;
        };
        let trip_count = match mode {
            Mode::Train => Some(row.label.unwrap_or(0)),
            Mode::Score => None,
        };
        rows.push(feature_row(key, features, start, end, calendar, trip_count));
    }

    if dropped_rows > 0 {
        debug!(
            component = "assemble",
            event = "assemble.rows.dropped",
            window_id = %window.id(),
            dropped_rows,
            reason = "missing_prediction_window_start"
        );
    }

    FeatureTable {
        window,
        mode,
        schema: build_feature_schema(mode),
        rows,
        dropped_rows,
    }
}

pub fn window_table_file_name(mode: Mode, window: &PredictionWindow) -> String {
    format!("{}_{}.csv", mode.as_str(), window.id())
}

/// Writes the table as one CSV unit, replacing any earlier unit for the same window.
pub fn write_window_table(table: &FeatureTable, output_dir: &Path) -> Result<PathBuf, OutputError> {
    let window_id = table.window.id();
    let path = output_dir.join(window_table_file_name(table.mode, &table.window));
    let missing_target = |source: std::io::Error| OutputError::MissingOutputTarget {
        window_id: window_id.clone(),
        path: path.clone(),
        source,
    };

    fs::create_dir_all(output_dir).map_err(missing_target)?;

    let bytes = encode_csv(&table.schema, &table.rows).map_err(|message| OutputError::Encode {
        window_id: window_id.clone(),
        message,
    })?;
    write_atomic(&path, &bytes).map_err(missing_target)?;

    info!(
        component = "assemble",
        event = "assemble.window.persisted",
        window_id = %window_id,
        mode = table.mode.as_str(),
        path = %path.display(),
        rows = table.rows.len(),
        dropped_rows = table.dropped_rows
    );

    Ok(path)
}

pub(crate) fn encode_csv(schema: &FeatureSchema, rows: &[FeatureRow]) -> Result<Vec<u8>, String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(schema.column_names())
        .map_err(|err| err.to_string())?;
    for row in rows {
        writer.write_record(row.record()).map_err(|err| err.to_string())?;
    }
    writer.into_inner().map_err(|err| err.to_string())
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid output path: {}", path.display()),
            )
        })?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)
}

fn feature_row(
    key: FeatureKey,
    features: CellFeatures,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    calendar: CalendarFields,
    trip_count: Option<u32>,
) -> FeatureRow {
    let [prev_1, prev_2, prev_3] = features.prev_hour_counts;
    let [ma_1, ma_2, ma_3, ma_4] = features.weeks_back_moving_avg;
    let [mon, tue, wed, thu, fri, sat, _sun] = calendar.weekdays;

    FeatureRow {
        h3_cell: key.cell,
        id_timestamp: key.window_id,
        prev_1_hour_cnt: prev_1,
        prev_2_hour_cnt: prev_2,
        prev_3_hour_cnt: prev_3,
        weeks_back_1_moving_avg: ma_1,
        weeks_back_2_moving_avg: ma_2,
        weeks_back_3_moving_avg: ma_3,
        weeks_back_4_moving_avg: ma_4,
        h3_cell_1_month_popularity: features.month_popularity,
        h3_cell_1_week_popularity: features.week_popularity,
        trip_count_1_year_back: features.trip_count_1_year_back,
        prediction_date_time_start: start,
        prediction_date_time_end: end,
        is_weekend: calendar.is_weekend,
        is_monday: mon,
        is_tuesday: tue,
        is_wednesday: wed,
        is_thursday: thu,
        is_friday: fri,
        is_saturday: sat,
        is_sunday: calendar.is_sunday,
        part_of_day: calendar.part_of_day,
        season: calendar.season,
        trip_count,
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
