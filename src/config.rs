//! Pipeline configuration read from `TRIPCAST_*` environment variables.

use std::env;
use std::path::PathBuf;

use chrono::{NaiveDate, NaiveTime};
use thiserror::Error;

use crate::window::{parse_date, parse_time};
use crate::{
    scoring_plan, training_plan, BatchConfig, BatchPlan, HistoryConfig, Mode, RecordPolicy,
    DEFAULT_H3_RESOLUTION,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub dataset_dir: PathBuf,
    pub mode: Mode,
    pub h3_resolution: u8,
    pub workers: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub record_policy: RecordPolicy,
    pub check_times: Vec<NaiveTime>,
    /// Model id date for training runs; today when unset.
    pub id_date: Option<NaiveDate>,
    pub score_dates: Vec<NaiveDate>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let batch = BatchConfig::default();
        Self {
            data_dir: PathBuf::from("data"),
            output_dir: batch.output_dir,
            dataset_dir: PathBuf::from("datasets"),
            mode: Mode::Train,
            h3_resolution: DEFAULT_H3_RESOLUTION,
            workers: batch.workers,
            max_retries: batch.max_retries,
            retry_backoff_ms: batch.retry_backoff_ms,
            record_policy: RecordPolicy::Strict,
            check_times: default_check_times(),
            id_date: None,
            score_dates: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn history_config(&self) -> HistoryConfig {
        HistoryConfig {
            data_dir: self.data_dir.clone(),
            record_policy: self.record_policy,
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            output_dir: self.output_dir.clone(),
            workers: self.workers,
            max_retries: self.max_retries,
            retry_backoff_ms: self.retry_backoff_ms,
        }
    }

    /// Training runs plan from `id_date` (or `today`); scoring runs need explicit dates.
    pub fn plan(&self, today: NaiveDate) -> Result<BatchPlan, ConfigError> {
        match self.mode {
            Mode::Train => {
                let id_date = self.id_date.unwrap_or(today);
                training_plan(id_date).ok_or(ConfigError::InvalidValue {
                    key: "TRIPCAST_ID_DATE",
                    value: id_date.to_string(),
                })
            }
            Mode::Score => scoring_plan(&self.score_dates).ok_or(ConfigError::Missing {
                key: "TRIPCAST_SCORE_DATES",
            }),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },
    #[error("{key} is required in this mode")]
    Missing { key: &'static str },
}

/// Top of every hour.
pub fn default_check_times() -> Vec<NaiveTime> {
    (0..24)
        .filter_map(|hour| NaiveTime::from_hms_opt(hour, 0, 0))
        .collect()
}

pub fn pipeline_config_from_env() -> Result<PipelineConfig, ConfigError> {
    pipeline_config_from_lookup(|key| env::var(key).ok())
}

pub fn pipeline_config_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<PipelineConfig, ConfigError> {
    let mut cfg = PipelineConfig::default();
    let get = |key: &str| {
        lookup(key)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    };

    if let Some(raw) = get("TRIPCAST_DATA_DIR") {
        cfg.data_dir = PathBuf::from(raw);
    }
    if let Some(raw) = get("TRIPCAST_OUTPUT_DIR") {
        cfg.output_dir = PathBuf::from(raw);
    }
    if let Some(raw) = get("TRIPCAST_DATASET_DIR") {
        cfg.dataset_dir = PathBuf::from(raw);
    }
    if let Some(raw) = get("TRIPCAST_MODE") {
        cfg.mode = Mode::parse(&raw).ok_or_else(|| invalid("TRIPCAST_MODE", &raw))?;
    }
    if let Some(raw) = get("TRIPCAST_H3_RESOLUTION") {
        cfg.h3_resolution = parse_number("TRIPCAST_H3_RESOLUTION", &raw)?;
    }
    if let Some(raw) = get("TRIPCAST_WORKERS") {
        let workers: usize = parse_number("TRIPCAST_WORKERS", &raw)?;
        if workers == 0 {
            return Err(invalid("TRIPCAST_WORKERS", &raw));
        }
        cfg.workers = workers;
    }
    if let Some(raw) = get("TRIPCAST_MAX_RETRIES") {
        cfg.max_retries = parse_number("TRIPCAST_MAX_RETRIES", &raw)?;
    }
    if let Some(raw) = get("TRIPCAST_RETRY_BACKOFF_MS") {
        cfg.retry_backoff_ms = parse_number("TRIPCAST_RETRY_BACKOFF_MS", &raw)?;
    }
    if let Some(raw) = get("TRIPCAST_RECORD_POLICY") {
        cfg.record_policy =
            RecordPolicy::parse(&raw).ok_or_else(|| invalid("TRIPCAST_RECORD_POLICY", &raw))?;
    }
    if let Some(raw) = get("TRIPCAST_CHECK_TIMES") {
        cfg.check_times = raw
            .split(',')
            .map(|item| parse_time(item).map_err(|_| invalid("TRIPCAST_CHECK_TIMES", item)))
            .collect::<Result<_, _>>()?;
    }
    if let Some(raw) = get("TRIPCAST_ID_DATE") {
        cfg.id_date = Some(parse_date(&raw).map_err(|_| invalid("TRIPCAST_ID_DATE", &raw))?);
    }
    if let Some(raw) = get("TRIPCAST_SCORE_DATES") {
        cfg.score_dates = parse_date_list(&raw)?;
    }

    Ok(cfg)
}

/// Comma-separated dates, each either `YYYY-MM-DD` or an inclusive `YYYY-MM-DD..YYYY-MM-DD`.
fn parse_date_list(raw: &str) -> Result<Vec<NaiveDate>, ConfigError> {
    let mut out = Vec::new();
    for item in raw.split(',') {
        let parse = |s: &str| parse_date(s).map_err(|_| invalid("TRIPCAST_SCORE_DATES", item));
        match item.split_once("..") {
            Some((from, to)) => {
                let (from, to) = (parse(from)?, parse(to)?);
                if to < from {
                    return Err(invalid("TRIPCAST_SCORE_DATES", item));
                }
                out.extend(from.iter_days().take_while(|d| *d <= to));
            }
            None => out.push(parse(item)?),
        }
    }
    Ok(out)
}

fn parse_number<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse::<T>().map_err(|_| invalid(key, raw))
}

fn invalid(key: &'static str, raw: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: raw.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<PipelineConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        pipeline_config_from_lookup(|key| vars.get(key).cloned())
    }

    fn date(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = from_pairs(&[]).unwrap();
        assert_eq!(cfg, PipelineConfig::default());
        assert_eq!(cfg.check_times.len(), 24);
        assert_eq!(cfg.h3_resolution, 9);
    }

    #[test]
    fn parses_overrides() {
        let cfg = from_pairs(&[
            ("TRIPCAST_MODE", "score"),
            ("TRIPCAST_WORKERS", "3"),
            ("TRIPCAST_RECORD_POLICY", "skip"),
            ("TRIPCAST_CHECK_TIMES", "08:00:00, 17:30:00"),
            ("TRIPCAST_SCORE_DATES", "2025-01-30..2025-02-02,2025-03-01"),
            ("TRIPCAST_OUTPUT_DIR", "/tmp/out"),
        ])
        .unwrap();

        assert_eq!(cfg.mode, Mode::Score);
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.record_policy, RecordPolicy::ReportAndSkip);
        assert_eq!(cfg.check_times.len(), 2);
        assert_eq!(cfg.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(
            cfg.score_dates,
            vec![
                date("2025-01-30"),
                date("2025-01-31"),
                date("2025-02-01"),
                date("2025-02-02"),
                date("2025-03-01")
            ]
        );
    }

    #[test]
    fn invalid_values_are_errors() {
        assert_eq!(
            from_pairs(&[("TRIPCAST_MODE", "predict")]).unwrap_err(),
            ConfigError::InvalidValue {
                key: "TRIPCAST_MODE",
                value: "predict".to_string()
            }
        );
        assert!(from_pairs(&[("TRIPCAST_WORKERS", "0")]).is_err());
        assert!(from_pairs(&[("TRIPCAST_CHECK_TIMES", "8am")]).is_err());
        assert!(from_pairs(&[("TRIPCAST_SCORE_DATES", "2025-02-02..2025-01-01")]).is_err());
    }

    #[test]
    fn score_mode_requires_dates() {
        let cfg = from_pairs(&[("TRIPCAST_MODE", "score")]).unwrap();
        assert_eq!(
            cfg.plan(date("2025-04-01")).unwrap_err(),
            ConfigError::Missing {
                key: "TRIPCAST_SCORE_DATES"
            }
        );

        let train = from_pairs(&[("TRIPCAST_ID_DATE", "2025-04-01")]).unwrap();
        let plan = train.plan(date("2030-01-01")).unwrap();
        assert_eq!(plan.history.cutoff_date, date("2025-03-31"));
    }
}
