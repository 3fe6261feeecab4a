//! Tripcast core crate.
//!
//! Current implemented scope:
//! - H3 cell indexing of trip start points
//! - month-addressed history loading into a shared event log
//! - per-window temporal feature aggregation and label counts
//! - feature table assembly, per-window CSV units and dataset concatenation
//! - parallel batch driver with per-window retry and reporting

pub mod calendar;

mod aggregate;
mod assemble;
mod batch;
mod config;
mod dataset;
mod events;
mod history;
mod observability;
mod spatial;
mod window;

pub use aggregate::{
    aggregate_window, label_counts, CellFeatures, FeatureKey, GroupSizes, LabelTable,
    WindowAggregate, MONTH_POPULARITY_DAYS, MOVING_AVERAGE_SPAN_WEEKS, MOVING_AVERAGE_STEPS,
    SHORT_LAG_HOURS, WEEK_POPULARITY_DAYS, YEAR_LAG_MONTHS,
};
pub use assemble::{
    assemble_window_table, build_feature_schema, schema_fingerprint, window_table_file_name,
    write_window_table, ColumnType, FeatureColumn, FeatureRow, FeatureSchema, FeatureTable, Mode,
    OutputError, FEATURE_SCHEMA_VERSION, LABEL_COLUMN,
};
pub use batch::{
    collect_window, run_batch, run_batch_with, scoring_plan, training_plan, BatchConfig,
    BatchError, BatchPlan, BatchReport, BatchRequest, WindowOutcome, WindowStatus, WindowSummary,
    SCORING_HISTORY_MONTHS, TRAINING_HISTORY_MONTHS, TRAINING_TARGET_MONTHS,
};
pub use config::{
    default_check_times, pipeline_config_from_env, pipeline_config_from_lookup, ConfigError,
    PipelineConfig,
};
pub use dataset::{
    clear_window_tables, concat_window_table_files, concat_window_tables, dataset_file_name,
    is_window_table_name, read_window_table, window_table_paths, write_dataset, DatasetError,
};
pub use events::{Event, EventLog};
pub use history::{
    load_event_log, month_file_name, parse_event_timestamp, plan_required_months, HistoryConfig,
    HistoryLoadError, HistoryLoadReport, HistoryLoadRequest, MonthRef, RecordPolicy, TripRecord,
};
pub use observability::{
    init_logging, log_app_start, log_plan_selected, log_run_summary, logging_config_from_env,
    logging_config_from_lookup, LogFormat, LoggingConfig, LoggingInitError,
};
pub use spatial::{CellId, SpatialError, SpatialIndexer, DEFAULT_H3_RESOLUTION};
pub use window::{
    floor_window, parse_date, parse_time, parse_window, window_at, PredictionWindow, WindowError,
    WindowId, WINDOW_GRID_MINUTES, WINDOW_SPAN_HOURS,
};
