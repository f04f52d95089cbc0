//! Natural-language time parsing for deferred tasks.
//!
//! Accepted shapes: `"in 30 minutes"`, `"at 1:15 PM"`, `"tomorrow 10am"`,
//! and ISO-8601 timestamps. Relative phrases resolve against the supplied
//! clock in the supplied timezone.

use anyhow::{Result, bail};
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use std::sync::LazyLock;

static IN_RELATIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^in\s+(\d+)\s*(minutes?|mins?|hours?|hrs?|days?)$").expect("static regex")
});
static AT_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^at\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?$").expect("static regex")
});
static TOMORROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^tomorrow\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?$").expect("static regex")
});

/// Parse a scheduling phrase into a UTC instant.
pub fn parse_schedule_time(input: &str, now: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>> {
    let input = input.trim();

    // ISO-8601 round-trips exactly.
    if let Ok(instant) = DateTime::parse_from_rfc3339(input) {
        return Ok(instant.with_timezone(&Utc));
    }

    if let Some(captures) = IN_RELATIVE.captures(input) {
        let amount: i64 = captures[1].parse()?;
        let unit = captures[2].to_lowercase();
        let delta = if unit.starts_with("min") {
            Duration::minutes(amount)
        } else if unit.starts_with("h") {
            Duration::hours(amount)
        } else {
            Duration::days(amount)
        };
        return Ok(now + delta);
    }

    if let Some(captures) = AT_TIME.captures(input) {
        let time = clock_time(&captures)?;
        let local_now = now.with_timezone(&tz);
        let mut date = local_now.date_naive();
        // Already past today's slot → tomorrow.
        if local_now.time() >= time {
            date += Duration::days(1);
        }
        return to_utc(tz, date, time);
    }

    if let Some(captures) = TOMORROW.captures(input) {
        let time = clock_time(&captures)?;
        let date = now.with_timezone(&tz).date_naive() + Duration::days(1);
        return to_utc(tz, date, time);
    }

    bail!("unrecognized schedule time: {input:?}")
}

fn clock_time(captures: &regex::Captures<'_>) -> Result<NaiveTime> {
    let mut hour: u32 = captures[1].parse()?;
    let minute: u32 = captures
        .get(2)
        .map(|m| m.as_str().parse())
        .transpose()?
        .unwrap_or(0);
    match captures.get(3).map(|m| m.as_str().to_lowercase()) {
        Some(ref meridiem) if meridiem == "pm" && hour < 12 => hour += 12,
        Some(ref meridiem) if meridiem == "am" && hour == 12 => hour = 0,
        _ => {}
    }
    NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| anyhow::anyhow!("invalid clock time {hour}:{minute:02}"))
}

fn to_utc(tz: Tz, date: chrono::NaiveDate, time: NaiveTime) -> Result<DateTime<Utc>> {
    match tz.from_local_datetime(&date.and_time(time)) {
        chrono::LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        chrono::LocalResult::Ambiguous(first, _) => Ok(first.with_timezone(&Utc)),
        chrono::LocalResult::None => bail!("time {time} does not exist on {date} in {tz}"),
    }
}
