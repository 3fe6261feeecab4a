use std::fs;
use std::io;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, NaiveTime};
use serde_json::Value;
use tempfile::tempdir;
use tracing::Level;
use tripcast::{
    aggregate_window, load_event_log, log_app_start, log_plan_selected, parse_window, run_batch,
    training_plan, BatchConfig, BatchRequest, EventLog, HistoryConfig, HistoryLoadRequest,
    LoggingConfig, Mode, PipelineConfig, RecordPolicy, SpatialIndexer,
};

struct Sink(Arc<Mutex<Vec<u8>>>);

impl io::Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Runs `f` under a JSON subscriber and returns the `fields` object of every event.
fn capture_fields(max_level: Level, f: impl FnOnce()) -> Vec<Value> {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&buffer);
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_max_level(max_level)
        .with_writer(move || Sink(Arc::clone(&sink)))
        .finish();
    tracing::subscriber::with_default(subscriber, f);

    let bytes = buffer.lock().unwrap().clone();
    String::from_utf8(bytes)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).unwrap()["fields"].clone())
        .collect()
}

fn event_names(fields: &[Value]) -> Vec<&str> {
    fields.iter().filter_map(|f| f["event"].as_str()).collect()
}

fn find<'a>(fields: &'a [Value], event: &str) -> &'a Value {
    fields
        .iter()
        .find(|f| f["event"] == event)
        .unwrap_or_else(|| panic!("no {event} event in {fields:?}"))
}

fn date(raw: &str) -> NaiveDate {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").unwrap()
}

#[test]
fn history_load_logs_missing_months_and_rejected_records() {
    let data = tempdir().unwrap();
    fs::write(
        data.path().join("data-2025-01-01.json"),
        r#"[
            {"SpecifiedStartDate": "2025-01-06T13:20:00Z", "LatitudeStart": 14.7645, "LongitudeStart": -17.3660},
            {"SpecifiedStartDate": "2025-01-06T13:25:00Z", "LatitudeStart": 91.0, "LongitudeStart": -17.3660}
        ]"#,
    )
    .unwrap();

    let fields = capture_fields(Level::INFO, || {
        let (log, report) = load_event_log(
            &HistoryLoadRequest {
                first_date: date("2024-12-01"),
                cutoff_date: date("2025-01-31"),
            },
            &HistoryConfig {
                data_dir: data.path().to_path_buf(),
                record_policy: RecordPolicy::ReportAndSkip,
            },
            &SpatialIndexer::default(),
        )
        .unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(report.records_rejected, 1);
    });

    let names = event_names(&fields);
    assert_eq!(names.first(), Some(&"history.load.start"));
    assert_eq!(names.last(), Some(&"history.load.finish"));
    assert!(names.contains(&"history.month.missing"));
    assert!(names.contains(&"history.record.rejected"));
}

#[test]
fn aggregation_logs_group_sizes_at_debug() {
    let window = parse_window("2025-01-06", "14:10:00").unwrap();
    let fields = capture_fields(Level::DEBUG, || {
        let aggregate = aggregate_window(&EventLog::default(), &window);
        assert!(aggregate.is_empty());
    });

    find(&fields, "aggregate.groups.built");
    let finish = find(&fields, "aggregate.window.finish");
    assert_eq!(finish["window_id"], "2025_01_06_14_10_00");
}

#[test]
fn batch_run_emits_start_empty_history_and_finish_events() {
    let out = tempdir().unwrap();
    let req = BatchRequest {
        mode: Mode::Score,
        dates: vec![date("2025-01-06")],
        times: vec![NaiveTime::from_hms_opt(9, 0, 0).unwrap()],
    };
    let cfg = BatchConfig {
        output_dir: out.path().to_path_buf(),
        workers: 1,
        max_retries: 0,
        retry_backoff_ms: 0,
    };

    let fields = capture_fields(Level::INFO, || {
        let report = run_batch(&EventLog::default(), &req, &cfg).unwrap();
        assert!(report.is_complete());
    });

    let names = event_names(&fields);
    assert!(names.contains(&"batch.start"));
    assert!(names.contains(&"batch.history.empty"));
    assert_eq!(names.last(), Some(&"batch.finish"));
}

#[test]
fn app_lifecycle_helpers_emit_baseline_events() {
    let plan = training_plan(date("2025-04-01")).unwrap();
    let fields = capture_fields(Level::INFO, || {
        log_app_start(&LoggingConfig::default(), &PipelineConfig::default());
        log_plan_selected(&plan, 24);
    });

    assert_eq!(event_names(&fields), vec!["app.start", "plan.selected"]);
    assert_eq!(find(&fields, "app.start")["mode"], "train");
    assert_eq!(find(&fields, "plan.selected")["history_cutoff_date"], "2025-03-31");
}
