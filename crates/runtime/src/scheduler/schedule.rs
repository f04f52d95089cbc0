//! Schedule kinds and next-occurrence math, timezone-aware.

use anyhow::{Result, bail};
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Minimum interval for interval-schedules.
pub const MIN_INTERVAL_MINUTES: u32 = 5;

/// When a local task runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Every day at a local wall-clock time.
    Daily { time: NaiveTime },
    /// Once a week.
    Weekly { day: Weekday, time: NaiveTime },
    /// Top of every hour.
    Hourly,
    /// Every N minutes, N ≥ 5.
    Interval { minutes: u32 },
}

impl Schedule {
    pub fn validate(&self) -> Result<()> {
        if let Schedule::Interval { minutes } = self {
            if *minutes < MIN_INTERVAL_MINUTES {
                bail!("interval must be at least {MIN_INTERVAL_MINUTES} minutes, got {minutes}");
            }
        }
        Ok(())
    }

    /// First occurrence strictly after `after`, computed in `tz`.
    pub fn next_occurrence(&self, after: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
        match self {
            Schedule::Daily { time } => {
                let local = after.with_timezone(&tz);
                let mut candidate_date = local.date_naive();
                if local.time() >= *time {
                    candidate_date += Duration::days(1);
                }
                local_datetime(tz, candidate_date, *time)
            }
            Schedule::Weekly { day, time } => {
                let local = after.with_timezone(&tz);
                let mut candidate_date = local.date_naive();
                // Walk forward to the requested weekday; same-day only if the
                // time has not passed yet.
                for _ in 0..8 {
                    if candidate_date.weekday() == *day
                        && (candidate_date != local.date_naive() || local.time() < *time)
                    {
                        break;
                    }
                    candidate_date += Duration::days(1);
                }
                local_datetime(tz, candidate_date, *time)
            }
            Schedule::Hourly => {
                let truncated = after
                    .with_minute(0)
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_nanosecond(0))
                    .unwrap_or(after);
                truncated + Duration::hours(1)
            }
            Schedule::Interval { minutes } => after + Duration::minutes(i64::from(*minutes)),
        }
    }
}

/// Resolve a local wall-clock instant to UTC, biasing forward across DST
/// gaps.
fn local_datetime(tz: Tz, date: chrono::NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&date.and_time(time)) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(first, _) => first.with_timezone(&Utc),
        chrono::LocalResult::None => {
            // Spring-forward gap: push an hour later.
            match tz.from_local_datetime(&(date.and_time(time) + Duration::hours(1))) {
                chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
                chrono::LocalResult::Ambiguous(first, _) => first.with_timezone(&Utc),
                chrono::LocalResult::None => Utc::now(),
            }
        }
    }
}

/// Returns `true` when `now` falls inside `[start_hour, end_hour)` local
/// hours in `tz`. Handles windows that wrap midnight (e.g. 22 → 06).
pub fn is_in_window(now: DateTime<Utc>, tz: Tz, start_hour: u32, end_hour: u32) -> bool {
    let hour = now.with_timezone(&tz).hour();
    if start_hour <= end_hour {
        hour >= start_hour && hour < end_hour
    } else {
        hour >= start_hour || hour < end_hour
    }
}
