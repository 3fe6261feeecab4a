//! Windowed aggregation of the event log into per-cell lookback features.
//!
//! Every group is computed as filter-by-time, bucket-by-cell, reduce. The groups
//! are then reconciled in one ordered multi-map keyed by `(cell, window_id)`:
//! short lags and the weekly moving averages decide which keys exist, popularity
//! and the year lag only contribute values to keys that already exist, and a
//! final pass fills everything missing with zero.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Days, Duration, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{CellId, Event, EventLog, PredictionWindow, WindowId};

pub const SHORT_LAG_HOURS: usize = 3;
pub const MOVING_AVERAGE_STEPS: usize = 4;
/// Same-clock-hour spans looked at for the moving averages: 7, 14, ..., 49 days back.
pub const MOVING_AVERAGE_SPAN_WEEKS: i64 = 7;
pub const MONTH_POPULARITY_DAYS: u64 = 30;
pub const WEEK_POPULARITY_DAYS: u64 = 7;
pub const YEAR_LAG_MONTHS: u32 = 12;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeatureKey {
    pub cell: CellId,
    pub window_id: WindowId,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellFeatures {
    /// Counts for `[T-1h,T)`, `[T-2h,T-1h)` and `[T-3h,T-2h)`.
    pub prev_hour_counts: [u32; SHORT_LAG_HOURS],
    /// Indexed by `step - 1`.
    pub weeks_back_moving_avg: [f64; MOVING_AVERAGE_STEPS],
    pub month_popularity: f64,
    pub week_popularity: f64,
    pub trip_count_1_year_back: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSizes {
    pub short_lag_cells: usize,
    pub moving_average_cells: usize,
    pub month_popularity_cells: usize,
    pub week_popularity_cells: usize,
    pub year_lag_cells: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowAggregate {
    pub window: PredictionWindow,
    pub rows: BTreeMap<FeatureKey, CellFeatures>,
    pub group_sizes: GroupSizes,
}

impl WindowAggregate {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, cell: &CellId) -> Option<&CellFeatures> {
        self.rows.get(&FeatureKey {
            cell: cell.clone(),
            window_id: self.window.id(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelTable {
    pub window: PredictionWindow,
    pub counts: BTreeMap<FeatureKey, u32>,
}

impl LabelTable {
    pub fn get(&self, cell: &CellId) -> Option<u32> {
        self.counts
            .get(&FeatureKey {
                cell: cell.clone(),
                window_id: self.window.id(),
            })
            .copied()
    }
}

type CellCounts<'a> = BTreeMap<&'a CellId, u32>;

pub fn aggregate_window(log: &EventLog, window: &PredictionWindow) -> WindowAggregate {
    let t = window.start();
    let window_id = window.id();

    let short_lags = short_lag_counts(log, t);
    let moving_averages = weekly_moving_averages(log, t);
    let month_popularity = popularity(log, window.date(), MONTH_POPULARITY_DAYS);
    let week_popularity = popularity(log, window.date(), WEEK_POPULARITY_DAYS);
    let year_lag = year_lag_counts(log, t);

    // Older lag hours, popularity and year lag only fill rows that exist.
    let mut anchor: BTreeSet<&CellId> = short_lags[0].keys().copied().collect();
    let short_lag_cells = anchor.len();
    anchor.extend(moving_averages.keys().copied());

    let group_sizes = GroupSizes {
        short_lag_cells,
        moving_average_cells: moving_averages.len(),
        month_popularity_cells: month_popularity.len(),
        week_popularity_cells: week_popularity.len(),
        year_lag_cells: year_lag.len(),
    };

    debug!(
        component = "aggregate",
        event = "aggregate.groups.built",
        window_id = %window_id,
        short_lag_cells = group_sizes.short_lag_cells,
        moving_average_cells = group_sizes.moving_average_cells,
        month_popularity_cells = group_sizes.month_popularity_cells,
        week_popularity_cells = group_sizes.week_popularity_cells,
        year_lag_cells = group_sizes.year_lag_cells
    );

    let mut rows = BTreeMap::new();
    for cell in anchor {
        let mut features = CellFeatures::default();
        for (slot, counts) in features.prev_hour_counts.iter_mut().zip(&short_lags) {
            *slot = counts.get(cell).copied().unwrap_or(0);
        }
        if let Some(steps) = moving_averages.get(cell) {
            for (slot, mean) in features.weeks_back_moving_avg.iter_mut().zip(steps) {
                *slot = mean.unwrap_or(0.0);
            }
        }
        features.month_popularity = month_popularity.get(cell).copied().unwrap_or(0.0);
        features.week_popularity = week_popularity.get(cell).copied().unwrap_or(0.0);
        features.trip_count_1_year_back = year_lag.get(cell).copied().unwrap_or(0);

        rows.insert(
            FeatureKey {
                cell: cell.clone(),
                window_id: window_id.clone(),
            },
            features,
        );
    }

    info!(
        component = "aggregate",
        event = "aggregate.window.finish",
        window_id = %window_id,
        cells = rows.len()
    );

    WindowAggregate {
        window: *window,
        rows,
        group_sizes,
    }
}

/// Ground-truth counts for `[T, T+1h)`; only ever used in training mode.
pub fn label_counts(log: &EventLog, window: &PredictionWindow) -> LabelTable {
    let window_id = window.id();
    let counts = count_by_cell(log.between(window.start(), window.end()))
        .into_iter()
        .map(|(cell, count)| {
            (
                FeatureKey {
                    cell: cell.clone(),
                    window_id: window_id.clone(),
                },
                count,
            )
        })
        .collect();

    LabelTable {
        window: *window,
        counts,
    }
}

fn count_by_cell(events: &[Event]) -> CellCounts<'_> {
    let mut counts = BTreeMap::new();
    for event in events {
        *counts.entry(&event.cell).or_insert(0) += 1;
    }
    counts
}

fn short_lag_counts(log: &EventLog, t: DateTime<Utc>) -> [CellCounts<'_>; SHORT_LAG_HOURS] {
    std::array::from_fn(|idx| {
        let hours_back = idx as i64 + 1;
        let start = t - Duration::hours(hours_back);
        let end = t - Duration::hours(hours_back - 1);
        count_by_cell(log.between(start, end))
    })
}

/// Per-cell count over `[date(T) - days, date(T))` divided by the busiest cell's count.
fn popularity(log: &EventLog, window_date: NaiveDate, days: u64) -> BTreeMap<&CellId, f64> {
    let Some(range_start) = window_date.checked_sub_days(Days::new(days)) else {
        return BTreeMap::new();
    };
    let counts = count_by_cell(log.on_dates(range_start, window_date));
    let max = counts.values().copied().max().unwrap_or(0);
    if max == 0 {
        return BTreeMap::new();
    }

    counts
        .into_iter()
        .map(|(cell, count)| (cell, f64::from(count) / f64::from(max)))
        .collect()
}

fn year_lag_counts(log: &EventLog, t: DateTime<Utc>) -> CellCounts<'_> {
    match t.checked_sub_months(Months::new(YEAR_LAG_MONTHS)) {
        Some(start) => count_by_cell(log.between(start, start + Duration::hours(1))),
        None => BTreeMap::new(),
    }
}

/// Mean per-day counts over four same-weekday dates per step.
///
/// Candidate events are those inside any of the closed spans
/// `[T - 7k days, T - 7k days + 1h]` for k in 1..=7. For step `s` the candidates
/// are restricted to dates `date(T) - 7(s+3)` ..= `date(T) - 7s`, counted per
/// (cell, date) and averaged per cell over the dates that had events.
fn weekly_moving_averages(
    log: &EventLog,
    t: DateTime<Utc>,
) -> BTreeMap<&CellId, [Option<f64>; MOVING_AVERAGE_STEPS]> {
    let mut candidates: Vec<&Event> = Vec::new();
    for weeks_back in 1..=MOVING_AVERAGE_SPAN_WEEKS {
        let span_start = t - Duration::days(7 * weeks_back);
        let span_end = span_start + Duration::hours(1);
        candidates.extend(log.between_inclusive(span_start, span_end));
    }

    let window_date = t.date_naive();
    let mut out: BTreeMap<&CellId, [Option<f64>; MOVING_AVERAGE_STEPS]> = BTreeMap::new();

    for step in 1..=MOVING_AVERAGE_STEPS as u64 {
        let (Some(newest), Some(oldest)) = (
            window_date.checked_sub_days(Days::new(7 * step)),
            window_date.checked_sub_days(Days::new(7 * (step + 3))),
        ) else {
            continue;
        };

        let mut daily: BTreeMap<(&CellId, NaiveDate), u32> = BTreeMap::new();
        for event in candidates.iter().copied() {
            if event.event_date >= oldest && event.event_date <= newest {
                *daily.entry((&event.cell, event.event_date)).or_insert(0) += 1;
            }
        }

        let mut per_cell: BTreeMap<&CellId, (u64, u32)> = BTreeMap::new();
        for ((cell, _date), count) in daily {
            let entry = per_cell.entry(cell).or_insert((0, 0));
            entry.0 += u64::from(count);
            entry.1 += 1;
        }

        let idx = step as usize - 1;
        for (cell, (sum, days)) in per_cell {
            let mean = sum as f64 / f64::from(days);
            out.entry(cell).or_insert([None; MOVING_AVERAGE_STEPS])[idx] = Some(mean);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_window;

    fn utc(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw).unwrap().with_timezone(&Utc)
    }

    fn log_of(events: &[(&str, &str)]) -> EventLog {
        events
            .iter()
            .map(|(cell, ts)| Event::new(*cell, utc(ts)))
            .collect()
    }

    #[test]
    fn short_lags_are_half_open_hour_buckets() {
        let log = log_of(&[
            ("a", "2025-01-06T13:10:00Z"),
            ("a", "2025-01-06T14:09:59Z"),
            ("a", "2025-01-06T12:10:00Z"),
            ("a", "2025-01-06T11:10:00Z"),
            ("a", "2025-01-06T11:09:59Z"),
        ]);
        let window = parse_window("2025-01-06", "14:10:00").unwrap();
        let agg = aggregate_window(&log, &window);

        let row = agg.get(&CellId::from("a")).unwrap();
        assert_eq!(row.prev_hour_counts, [2, 1, 1]);
    }

    #[test]
    fn older_lag_hours_fill_rows_but_do_not_start_them() {
        let log = log_of(&[
            ("late", "2025-01-06T12:30:00Z"),
            ("recent", "2025-01-06T13:40:00Z"),
            ("recent", "2025-01-06T11:20:00Z"),
        ]);
        let window = parse_window("2025-01-06", "14:10:00").unwrap();
        let agg = aggregate_window(&log, &window);

        assert_eq!(agg.len(), 1);
        assert!(agg.get(&CellId::from("late")).is_none());
        assert_eq!(
            agg.get(&CellId::from("recent")).unwrap().prev_hour_counts,
            [1, 0, 1]
        );
        assert_eq!(agg.group_sizes.short_lag_cells, 1);
    }

    #[test]
    fn popularity_and_year_lag_do_not_create_rows() {
        let log = log_of(&[
            ("pop_only", "2025-01-01T08:00:00Z"),
            ("year_only", "2024-01-06T14:30:00Z"),
        ]);
        let window = parse_window("2025-01-06", "14:10:00").unwrap();
        let agg = aggregate_window(&log, &window);

        assert!(agg.is_empty());
        assert_eq!(agg.group_sizes.month_popularity_cells, 1);
        assert_eq!(agg.group_sizes.year_lag_cells, 1);
    }

    #[test]
    fn side_tables_fill_anchor_rows() {
        let log = log_of(&[
            ("a", "2025-01-06T13:30:00Z"),
            ("a", "2025-01-01T08:00:00Z"),
            ("a", "2025-01-02T08:00:00Z"),
            ("b", "2025-01-06T13:40:00Z"),
            ("b", "2025-01-03T08:00:00Z"),
            ("a", "2024-01-06T14:10:00Z"),
            ("a", "2024-01-06T15:09:59Z"),
            ("a", "2024-01-06T15:10:00Z"),
        ]);
        let window = parse_window("2025-01-06", "14:10:00").unwrap();
        let agg = aggregate_window(&log, &window);

        let a = agg.get(&CellId::from("a")).unwrap();
        let b = agg.get(&CellId::from("b")).unwrap();
        assert_eq!(a.week_popularity, 1.0);
        assert_eq!(b.week_popularity, 0.5);
        assert_eq!(a.trip_count_1_year_back, 2);
        assert_eq!(b.trip_count_1_year_back, 0);
    }

    #[test]
    fn month_popularity_covers_thirty_days_before_window_date() {
        let log = log_of(&[
            ("a", "2025-01-06T13:30:00Z"),
            ("a", "2024-12-07T00:00:00Z"),
            ("a", "2024-12-06T23:59:59Z"),
            ("b", "2025-01-06T13:31:00Z"),
            ("b", "2025-01-05T10:00:00Z"),
            ("b", "2025-01-05T11:00:00Z"),
        ]);
        let window = parse_window("2025-01-06", "14:10:00").unwrap();
        let agg = aggregate_window(&log, &window);

        assert_eq!(agg.get(&CellId::from("a")).unwrap().month_popularity, 0.5);
        assert_eq!(agg.get(&CellId::from("b")).unwrap().month_popularity, 1.0);
    }

    #[test]
    fn year_lag_clamps_leap_day() {
        let log = log_of(&[
            ("a", "2025-02-28T10:00:00Z"),
            ("a", "2025-02-28T10:59:59Z"),
            ("a", "2024-02-29T10:00:00Z"),
            ("a", "2026-02-28T09:30:00Z"),
        ]);
        // 2026-02-28 minus 12 months is 2025-02-28.
        let window = parse_window("2026-02-28", "10:00:00").unwrap();
        let agg = aggregate_window(&log, &window);

        assert_eq!(
            agg.get(&CellId::from("a")).unwrap().trip_count_1_year_back,
            2
        );
    }

    #[test]
    fn moving_average_is_mean_over_days_present() {
        // Window Monday 2025-03-03 10:00. Step 1 covers dates
        // 2025-02-03 ..= 2025-02-24 (7, 14, 21, 28 days back).
        let log = log_of(&[
            ("a", "2025-02-24T10:00:00Z"),
            ("a", "2025-02-24T10:30:00Z"),
            ("a", "2025-02-24T11:00:00Z"),
            ("a", "2025-02-24T11:00:01Z"),
            ("a", "2025-02-17T10:15:00Z"),
            ("a", "2025-02-03T10:59:00Z"),
            ("a", "2025-02-03T10:20:00Z"),
            ("a", "2025-02-03T10:40:00Z"),
            ("a", "2025-02-25T10:00:00Z"),
        ]);
        let window = parse_window("2025-03-03", "10:00:00").unwrap();
        let agg = aggregate_window(&log, &window);
        let row = agg.get(&CellId::from("a")).unwrap();

        // Step 1: days present 02-24 (3), 02-17 (1), 02-03 (3) -> 7 / 3.
        assert!((row.weeks_back_moving_avg[0] - 7.0 / 3.0).abs() < 1e-12);
        // Step 2: 02-17 (1), 02-03 (3) -> 2.
        assert_eq!(row.weeks_back_moving_avg[1], 2.0);
        // Steps 3 and 4 only reach 02-03.
        assert_eq!(row.weeks_back_moving_avg[2], 3.0);
        assert_eq!(row.weeks_back_moving_avg[3], 3.0);
        assert_eq!(row.prev_hour_counts, [0, 0, 0]);
    }

    #[test]
    fn moving_average_only_cell_gets_zero_for_missing_steps() {
        // 49 days before 2025-03-03 is 2025-01-13; only step 4 reaches it.
        let log = log_of(&[("old", "2025-01-13T10:05:00Z")]);
        let window = parse_window("2025-03-03", "10:00:00").unwrap();
        let agg = aggregate_window(&log, &window);

        let row = agg.get(&CellId::from("old")).unwrap();
        assert_eq!(row.weeks_back_moving_avg, [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn labels_count_the_window_itself() {
        let log = log_of(&[
            ("a", "2025-01-06T14:10:00Z"),
            ("a", "2025-01-06T15:09:59Z"),
            ("a", "2025-01-06T15:10:00Z"),
            ("b", "2025-01-06T14:09:59Z"),
        ]);
        let window = parse_window("2025-01-06", "14:10:00").unwrap();
        let labels = label_counts(&log, &window);

        assert_eq!(labels.get(&CellId::from("a")), Some(2));
        assert_eq!(labels.get(&CellId::from("b")), None);
    }
}
