//! Immutable, time-ordered snapshot of indexed trip events.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::CellId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub cell: CellId,
    pub event_time: DateTime<Utc>,
    pub event_date: NaiveDate,
}

impl Event {
    pub fn new(cell: impl Into<CellId>, event_time: DateTime<Utc>) -> Self {
        Self {
            cell: cell.into(),
            event_time,
            event_date: event_time.date_naive(),
        }
    }
}

/// Read-only event log shared by every window worker of a batch run.
///
/// Events are kept sorted by `event_time`, so each lookback filter is a pair of
/// binary searches instead of a full scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    pub fn new(mut events: Vec<Event>) -> Self {
        events.sort_by(|a, b| {
            a.event_time
                .cmp(&b.event_time)
                .then_with(|| a.cell.cmp(&b.cell))
        });
        Self { events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn first_time(&self) -> Option<DateTime<Utc>> {
        self.events.first().map(|e| e.event_time)
    }

    pub fn last_time(&self) -> Option<DateTime<Utc>> {
        self.events.last().map(|e| e.event_time)
    }

    /// Events with `start <= event_time < end`.
    pub fn between(&self, start: DateTime<Utc>, end_exclusive: DateTime<Utc>) -> &[Event] {
        if end_exclusive <= start {
            return &[];
        }
        let lo = self.events.partition_point(|e| e.event_time < start);
        let hi = self.events.partition_point(|e| e.event_time < end_exclusive);
        &self.events[lo..hi]
    }

    /// Events with `start <= event_time <= end`.
    pub fn between_inclusive(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> &[Event] {
        if end < start {
            return &[];
        }
        let lo = self.events.partition_point(|e| e.event_time < start);
        let hi = self.events.partition_point(|e| e.event_time <= end);
        &self.events[lo..hi]
    }

    /// Events with `start <= event_date < end`.
    pub fn on_dates(&self, start: NaiveDate, end_exclusive: NaiveDate) -> &[Event] {
        self.between(day_start(start), day_start(end_exclusive))
    }

    /// Keeps events dated on or before `cutoff`.
    pub fn truncate_after(mut self, cutoff: NaiveDate) -> Self {
        let keep = self.events.partition_point(|e| e.event_date <= cutoff);
        self.events.truncate(keep);
        self
    }
}

impl FromIterator<Event> for EventLog {
    fn from_iter<I: IntoIterator<Item = Event>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

pub(crate) fn day_start(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}
