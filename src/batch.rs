//! Batch driver: plans windows, runs them on a worker pool and reports per-window outcomes.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{Days, Months, NaiveDate, NaiveTime};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    aggregate_window, assemble_window_table, label_counts, window_at, write_window_table,
    EventLog, HistoryLoadRequest, Mode, OutputError, PredictionWindow, WindowId,
};

pub const TRAINING_HISTORY_MONTHS: u32 = 24;
pub const TRAINING_TARGET_MONTHS: u32 = 3;
/// Year lag plus one month of slack for the popularity and moving-average lookbacks.
pub const SCORING_HISTORY_MONTHS: u32 = 13;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub output_dir: PathBuf,
    pub workers: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("temp"),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            max_retries: 1,
            retry_backoff_ms: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub mode: Mode,
    pub dates: Vec<NaiveDate>,
    pub times: Vec<NaiveTime>,
}

impl BatchRequest {
    /// Every `date x time` pair floored to its window, deduplicated and ordered.
    ///
    /// Two requested times in the same 10-minute slot map to one output unit, so
    /// they are collapsed before any worker starts.
    pub fn windows(&self) -> Vec<PredictionWindow> {
        let mut out = BTreeSet::new();
        for date in &self.dates {
            for time in &self.times {
                out.insert(window_at(*date, *time));
            }
        }
        out.into_iter().collect()
    }
}

/// History range and target dates for one batch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPlan {
    pub mode: Mode,
    pub history: HistoryLoadRequest,
    pub target_dates: Vec<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSummary {
    pub path: PathBuf,
    pub rows: usize,
    pub dropped_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowStatus {
    Written { summary: WindowSummary },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowOutcome {
    pub window_id: WindowId,
    pub attempts: u32,
    pub status: WindowStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub mode: Mode,
    pub windows_planned: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// The event log had no events at all; every unit is an empty table.
    pub empty_history: bool,
    pub outcomes: Vec<WindowOutcome>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }

    /// Units written by this run, in window order.
    pub fn written_paths(&self) -> Vec<PathBuf> {
        self.outcomes
            .iter()
            .filter_map(|o| match &o.status {
                WindowStatus::Written { summary } => Some(summary.path.clone()),
                WindowStatus::Failed { .. } => None,
            })
            .collect()
    }

    pub fn failed_windows(&self) -> Vec<&WindowId> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, WindowStatus::Failed { .. }))
            .map(|o| &o.window_id)
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("invalid batch request: {0}")]
    InvalidRequest(String),
    #[error("failed to build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// Training plan for model id date `id_date`.
///
/// The cutoff is the day before `id_date`; history reaches 24 months back from
/// the cutoff and the targets are every day of the last 3 months up to it.
pub fn training_plan(id_date: NaiveDate) -> Option<BatchPlan> {
    let cutoff = id_date.checked_sub_days(Days::new(1))?;
    let history_start = cutoff.checked_sub_months(Months::new(TRAINING_HISTORY_MONTHS))?;
    let first_target = cutoff.checked_sub_months(Months::new(TRAINING_TARGET_MONTHS))?;

    Some(BatchPlan {
        mode: Mode::Train,
        history: HistoryLoadRequest {
            first_date: history_start,
            cutoff_date: cutoff,
        },
        target_dates: first_target.iter_days().take_while(|d| *d <= cutoff).collect(),
    })
}

pub fn scoring_plan(dates: &[NaiveDate]) -> Option<BatchPlan> {
    let first = *dates.iter().min()?;
    let last = *dates.iter().max()?;
    let history_start = first.checked_sub_months(Months::new(SCORING_HISTORY_MONTHS))?;

    let mut target_dates = dates.to_vec();
    target_dates.sort();
    target_dates.dedup();

    Some(BatchPlan {
        mode: Mode::Score,
        history: HistoryLoadRequest {
            first_date: history_start,
            cutoff_date: last,
        },
        target_dates,
    })
}

/// Aggregates, assembles and persists one window.
pub fn collect_window(
    log: &EventLog,
    window: &PredictionWindow,
    mode: Mode,
    output_dir: &Path,
) -> Result<WindowSummary, OutputError> {
    let aggregate = aggregate_window(log, window);
    let labels = match mode {
        Mode::Train => Some(label_counts(log, window)),
        Mode::Score => None,
    };
    let table = assemble_window_table(aggregate, labels.as_ref(), mode);
    let path = write_window_table(&table, output_dir)?;

    Ok(WindowSummary {
        path,
        rows: table.rows.len(),
        dropped_rows: table.dropped_rows,
    })
}

pub fn run_batch(
    log: &EventLog,
    req: &BatchRequest,
    cfg: &BatchConfig,
) -> Result<BatchReport, BatchError> {
    run_batch_with(log, req, cfg, collect_window)
}

/// Runs `collect` for every window of `req` on a pool of `cfg.workers` threads.
///
/// A failing window is retried up to `cfg.max_retries` times and then reported;
/// it never stops sibling windows.
pub fn run_batch_with<F>(
    log: &EventLog,
    req: &BatchRequest,
    cfg: &BatchConfig,
    collect: F,
) -> Result<BatchReport, BatchError>
where
    F: Fn(&EventLog, &PredictionWindow, Mode, &Path) -> Result<WindowSummary, OutputError> + Sync,
{
    if cfg.workers == 0 {
        return Err(BatchError::InvalidRequest(
            "workers must be > 0".to_string(),
        ));
    }

    let windows = req.windows();
    let empty_history = log.is_empty();

    info!(
        component = "batch",
        event = "batch.start",
        mode = req.mode.as_str(),
        windows = windows.len(),
        events = log.len(),
        workers = cfg.workers,
        output_dir = %cfg.output_dir.display()
    );
    if empty_history {
        warn!(
            component = "batch",
            event = "batch.history.empty",
            mode = req.mode.as_str(),
            windows = windows.len()
        );
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cfg.workers)
        .thread_name(|idx| format!("tripcast-worker-{idx}"))
        .build()?;

    let outcomes: Vec<WindowOutcome> = pool.install(|| {
        windows
            .par_iter()
            .map(|window| run_window(log, window, req.mode, cfg, &collect))
            .collect()
    });

    let succeeded = outcomes
        .iter()
        .filter(|o| matches!(o.status, WindowStatus::Written { .. }))
        .count();
    let report = BatchReport {
        mode: req.mode,
        windows_planned: windows.len(),
        succeeded,
        failed: outcomes.len() - succeeded,
        empty_history,
        outcomes,
    };

    info!(
        component = "batch",
        event = "batch.finish",
        mode = req.mode.as_str(),
        windows_planned = report.windows_planned,
        succeeded = report.succeeded,
        failed = report.failed
    );

    Ok(report)
}

fn run_window<F>(
    log: &EventLog,
    window: &PredictionWindow,
    mode: Mode,
    cfg: &BatchConfig,
    collect: &F,
) -> WindowOutcome
where
    F: Fn(&EventLog, &PredictionWindow, Mode, &Path) -> Result<WindowSummary, OutputError> + Sync,
{
    let window_id = window.id();
    let mut attempts: u32 = 0;

    let result = retry(cfg, || {
        attempts += 1;
        let result = collect(log, window, mode, &cfg.output_dir);
        if let Err(err) = &result {
            warn!(
                component = "batch",
                event = "batch.window.attempt_failed",
                window_id = %window_id,
                attempt = attempts,
                error = %err
            );
        }
        result
    });

    let status = match result {
        Ok(summary) => WindowStatus::Written { summary },
        Err(err) => {
            error!(
                component = "batch",
                event = "batch.window.failed",
                window_id = %window_id,
                attempts,
                error = %err
            );
            WindowStatus::Failed {
                error: err.to_string(),
            }
        }
    };

    WindowOutcome {
        window_id,
        attempts,
        status,
    }
}

fn retry<T>(
    cfg: &BatchConfig,
    mut f: impl FnMut() -> Result<T, OutputError>,
) -> Result<T, OutputError> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= cfg.max_retries => return Err(err),
            Err(_) => {
                attempt = attempt.saturating_add(1);
                let shift = attempt.saturating_sub(1).min(10);
                let factor = 1u64 << shift;
                let sleep_ms = cfg.retry_backoff_ms.saturating_mul(factor);
                std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
            }
        }
    }
}
