//! Attendance time rules: debounce window and business-day cutoff.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

/// Seconds still to wait before `now` may record again, or `None` if the
/// window since `last` has elapsed. Partial seconds are truncated.
pub fn debounce_remaining(last: NaiveDateTime, now: NaiveDateTime, window: Duration) -> Option<u64> {
    let elapsed = now - last;
    if elapsed >= window {
        return None;
    }
    // A clock step backwards leaves `elapsed` negative; the full window applies.
    let remaining = window - elapsed.max(Duration::zero());
    Some(remaining.num_seconds().max(0) as u64)
}

/// Timestamp for a backfilled event on business day `date` at clock `time`.
///
/// The business day runs until `cutoff_hour` of the next calendar day, so a
/// time before the cutoff lands on `date + 1`.
pub fn resolve_backfill_timestamp(date: NaiveDate, time: NaiveTime, cutoff_hour: u32) -> NaiveDateTime {
    let day = if time.hour() < cutoff_hour {
        date.succ_opt().unwrap_or(date)
    } else {
        date
    };
    day.and_time(time)
}

/// The business day a timestamp belongs to.
pub fn logical_day(timestamp: NaiveDateTime, cutoff_hour: u32) -> NaiveDate {
    let date = timestamp.date();
    if timestamp.hour() < cutoff_hour {
        date.pred_opt().unwrap_or(date)
    } else {
        date
    }
}
