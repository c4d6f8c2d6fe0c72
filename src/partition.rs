//! Date-partitioned archive layout.
//!
//! Every snapshot lives at
//! `<base>/<kind>/<YYYY>/<MM>/<DD>/<unix-ts>.<kind>.pb.gz`, where the day is
//! the UTC calendar day of the feed's own header timestamp.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};

use crate::error::{Error, Result};
use crate::kind::FeedKind;

/// Compressed-binary suffix shared by every snapshot file.
pub const SNAPSHOT_EXTENSION: &str = "pb.gz";

/// Directory holding all snapshots of `kind` for one UTC day.
pub fn base_path(kind: FeedKind, base_dir: &Path, day: NaiveDate) -> PathBuf {
    base_dir
        .join(kind.as_str())
        .join(format!("{:04}", day.year()))
        .join(format!("{:02}", day.month()))
        .join(format!("{:02}", day.day()))
}

/// Destination of a snapshot whose header carries `timestamp`.
pub fn output_path(kind: FeedKind, base_dir: &Path, timestamp: u64) -> Result<PathBuf> {
    let day = utc_day(timestamp)?;
    Ok(base_path(kind, base_dir, day).join(snapshot_file_name(kind, timestamp)))
}

pub fn snapshot_file_name(kind: FeedKind, timestamp: u64) -> String {
    format!("{timestamp}.{kind}.{SNAPSHOT_EXTENSION}")
}

/// Suffix matched when listing a partition, the `*.{kind}.pb.gz` glob.
pub fn snapshot_suffix(kind: FeedKind) -> String {
    format!(".{kind}.{SNAPSHOT_EXTENSION}")
}

/// Recovers `(kind, timestamp)` from a snapshot file name, or `None` if the
/// name does not follow the archive convention.
pub fn parse_snapshot_file_name(name: &str) -> Option<(FeedKind, u64)> {
    let stem = name.strip_suffix(SNAPSHOT_EXTENSION)?.strip_suffix('.')?;
    let (timestamp, segment) = stem.split_once('.')?;
    if timestamp.is_empty() || !timestamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let kind: FeedKind = segment.parse().ok()?;
    if kind.as_str() != segment {
        return None;
    }
    Some((kind, timestamp.parse().ok()?))
}

/// UTC calendar day containing the Unix timestamp.
pub fn utc_day(timestamp: u64) -> Result<NaiveDate> {
    let secs = i64::try_from(timestamp).map_err(|_| Error::InvalidTimestamp(timestamp))?;
    DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.date_naive())
        .ok_or(Error::InvalidTimestamp(timestamp))
}

/// Inclusive, chronological range of UTC days.
#[derive(Debug, Clone)]
pub struct DayRange {
    next: Option<NaiveDate>,
    last: NaiveDate,
}

impl DayRange {
    pub fn new(first: NaiveDate, last: NaiveDate) -> Self {
        Self {
            next: (first <= last).then_some(first),
            last,
        }
    }

    /// UTC days overlapped by the closed interval `[start, end]`.
    pub fn covering<Tz: TimeZone>(start: &DateTime<Tz>, end: &DateTime<Tz>) -> Self {
        Self::new(
            start.with_timezone(&Utc).date_naive(),
            end.with_timezone(&Utc).date_naive(),
        )
    }
}

impl Iterator for DayRange {
    type Item = NaiveDate;

    fn next(&mut self) -> Option<NaiveDate> {
        let day = self.next?;
        self.next = day.succ_opt().filter(|d| *d <= self.last);
        Some(day)
    }
}
