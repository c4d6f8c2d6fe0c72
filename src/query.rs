//! Parsing of command-line query arguments.

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::{Error, Result};
use crate::vehicle::VehicleFilter;

/// Which end of a range a bare date stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Start,
    End,
}

/// Parses a range endpoint.
///
/// Accepts RFC 3339 (`2024-02-16T08:00:00Z`), a local date-time without an
/// offset (`2024-02-16T08:00:00`, read in `timezone`), or a bare date, which
/// covers the whole local day: its first second for [`Bound::Start`] and its
/// last for [`Bound::End`].
pub fn parse_instant(input: &str, timezone: Tz, bound: Bound) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S") {
        return local_instant(naive, timezone, bound)
            .ok_or_else(|| Error::Config(format!("'{input}' does not exist in {timezone}")));
    }
    if let Ok(day) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        let (start, end) = local_day_bounds(day, timezone)?;
        return Ok(match bound {
            Bound::Start => start,
            Bound::End => end,
        });
    }
    Err(Error::Config(format!(
        "'{input}' is not a date (YYYY-MM-DD) or RFC 3339 timestamp"
    )))
}

/// First and last second of `day` in `timezone`, as UTC instants.
pub fn local_day_bounds(day: NaiveDate, timezone: Tz) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let invalid = || Error::Config(format!("no local midnight for {day} in {timezone}"));
    let next = day.checked_add_days(Days::new(1)).ok_or_else(invalid)?;

    let start = local_instant(day.and_time(NaiveTime::MIN), timezone, Bound::Start)
        .ok_or_else(invalid)?;
    let next_start = local_instant(next.and_time(NaiveTime::MIN), timezone, Bound::Start)
        .ok_or_else(invalid)?;
    Ok((start, next_start - chrono::Duration::seconds(1)))
}

/// Resolves a local wall-clock time. Ambiguous times take the earlier
/// instant for a start and the later for an end; times inside a DST gap
/// move to the first instant after it.
fn local_instant(naive: NaiveDateTime, timezone: Tz, bound: Bound) -> Option<DateTime<Utc>> {
    let local = timezone.from_local_datetime(&naive);
    let resolved = match bound {
        Bound::Start => local.earliest(),
        Bound::End => local.latest(),
    };
    match resolved {
        Some(dt) => Some(dt.with_timezone(&Utc)),
        // Gaps are at most an hour; step forward until the clock exists.
        None => (1..=4)
            .map(|q| naive + chrono::Duration::minutes(15 * q))
            .find_map(|later| timezone.from_local_datetime(&later).earliest())
            .map(|dt| dt.with_timezone(&Utc)),
    }
}

/// Splits one `field=value` argument.
pub fn parse_filter_arg(arg: &str) -> Result<(String, String)> {
    match arg.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(Error::Config(format!(
            "filter '{arg}' must look like field=value"
        ))),
    }
}

/// Builds a [`VehicleFilter`] from repeated `field=value` arguments.
pub fn parse_filters<S: AsRef<str>>(args: &[S]) -> Result<VehicleFilter> {
    let pairs = args
        .iter()
        .map(|arg| parse_filter_arg(arg.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    VehicleFilter::from_pairs(pairs)
}
