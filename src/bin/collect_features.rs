use chrono::Utc;
use tripcast::{
    clear_window_tables, concat_window_table_files, dataset_file_name, init_logging,
    load_event_log, log_app_start, log_plan_selected, log_run_summary, logging_config_from_env,
    pipeline_config_from_env, run_batch, write_dataset, BatchRequest, Mode, SpatialIndexer,
    WindowStatus,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging = logging_config_from_env();
    init_logging(&logging)?;

    let cfg = pipeline_config_from_env()?;
    log_app_start(&logging, &cfg);

    let today = Utc::now().date_naive();
    let plan = cfg.plan(today)?;
    log_plan_selected(&plan, cfg.check_times.len());

    let indexer = SpatialIndexer::new(cfg.h3_resolution)?;
    let (log, history) = load_event_log(&plan.history, &cfg.history_config(), &indexer)?;

    let batch_cfg = cfg.batch_config();
    if plan.mode == Mode::Train {
        clear_window_tables(&batch_cfg.output_dir)?;
    }

    let request = BatchRequest {
        mode: plan.mode,
        dates: plan.target_dates.clone(),
        times: cfg.check_times.clone(),
    };
    let report = run_batch(&log, &request, &batch_cfg)?;
    log_run_summary(&history, &report);

    println!(
        "Collected {} | windows={} written={} failed={} events={} history={}..{}",
        plan.mode.as_str(),
        report.windows_planned,
        report.succeeded,
        report.failed,
        history.events_loaded,
        plan.history.first_date,
        plan.history.cutoff_date
    );
    for outcome in &report.outcomes {
        if let WindowStatus::Failed { error } = &outcome.status {
            println!(
                "  failed window={} attempts={} error={}",
                outcome.window_id, outcome.attempts, error
            );
        }
    }

    if report.windows_planned > 0 && report.succeeded == 0 {
        return Err(format!("all {} windows failed", report.windows_planned).into());
    }

    // Only this run's units; earlier runs may have left others for the same dates.
    let rows = concat_window_table_files(&report.written_paths(), plan.mode)?;
    let dataset_date = match plan.mode {
        Mode::Train => cfg.id_date.unwrap_or(today),
        Mode::Score => plan.history.cutoff_date,
    };
    let dataset_path = cfg
        .dataset_dir
        .join(dataset_file_name(plan.mode, dataset_date));
    write_dataset(&rows, plan.mode, &dataset_path)?;

    println!(
        "Dataset written | path={} rows={} complete={}",
        dataset_path.display(),
        rows.len(),
        report.is_complete()
    );
    Ok(())
}
