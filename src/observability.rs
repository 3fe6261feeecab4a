//! Shared logging configuration and initialization.

use std::env;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{BatchPlan, BatchReport, HistoryLoadReport, PipelineConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    logging_config_from_lookup(|key| env::var(key).ok())
}

/// Unset, blank or unparseable values keep their defaults.
pub fn logging_config_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Some(level) = lookup("TRIPCAST_LOG_LEVEL").filter(|raw| !raw.trim().is_empty()) {
        config.level = level.trim().to_string();
    }
    if let Some(format) = lookup("TRIPCAST_LOG_FORMAT").as_deref().and_then(parse_log_format) {
        config.format = format;
    }
    if let Some(target) = lookup("TRIPCAST_LOG_TARGET").as_deref().and_then(parse_bool) {
        config.include_target = target;
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(logging: &LoggingConfig, pipeline: &PipelineConfig) {
    info!(
        component = "collect_features",
        event = "app.start",
        log_level = %logging.level,
        log_format = ?logging.format,
        mode = pipeline.mode.as_str(),
        data_dir = %pipeline.data_dir.display(),
        output_dir = %pipeline.output_dir.display(),
        h3_resolution = pipeline.h3_resolution,
        workers = pipeline.workers
    );
}

pub fn log_plan_selected(plan: &BatchPlan, check_times: usize) {
    info!(
        component = "collect_features",
        event = "plan.selected",
        mode = plan.mode.as_str(),
        history_first_date = %plan.history.first_date,
        history_cutoff_date = %plan.history.cutoff_date,
        target_dates = plan.target_dates.len(),
        check_times
    );
}

pub fn log_run_summary(history: &HistoryLoadReport, batch: &BatchReport) {
    info!(
        component = "collect_features",
        event = "app.summary",
        mode = batch.mode.as_str(),
        events_loaded = history.events_loaded,
        records_rejected = history.records_rejected,
        months_missing = history.months_missing.len(),
        windows_planned = batch.windows_planned,
        succeeded = batch.succeeded,
        failed = batch.failed,
        empty_history = batch.empty_history
    );
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
