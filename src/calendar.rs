//! Calendar buckets derived from a window start.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};

pub const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// 1 = late night (00:00-02:59) through 8 = late evening (21:00-23:59), three hours each.
pub fn part_of_day(ts: DateTime<Utc>) -> u8 {
    let total_minutes = ts.hour() * 60 + ts.minute();
    (total_minutes / (3 * 60)).min(7) as u8 + 1
}

/// 1 = winter (Dec-Feb), 2 = spring, 3 = summer, 4 = autumn.
pub fn season_of_year(month: u32) -> u8 {
    match month {
        12 | 1 | 2 => 1,
        3..=5 => 2,
        6..=8 => 3,
        _ => 4,
    }
}

pub fn is_weekend(ts: DateTime<Utc>) -> bool {
    matches!(ts.weekday(), Weekday::Sat | Weekday::Sun)
}

pub fn is_sunday(ts: DateTime<Utc>) -> bool {
    ts.weekday() == Weekday::Sun
}

pub fn weekday_one_hot(ts: DateTime<Utc>) -> [bool; 7] {
    let today = ts.weekday();
    WEEKDAYS.map(|day| day == today)
}
