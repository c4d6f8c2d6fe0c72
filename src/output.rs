//! Output formatting for retrieval results and snapshot reports.
//!
//! Records are written as JSON lines, one object per line, so the output can
//! be piped straight into `jq` or a loader.

use std::io::Write;

use serde::Serialize;
use tracing::debug;

use crate::archive::{SnapshotReport, SnapshotStatus};
use crate::gtfs_rt::{FeedEntity, FeedMessage};

/// One-line summary of an archived feed snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedSummary {
    pub timestamp: Option<u64>,
    pub gtfs_realtime_version: String,
    pub entity_count: usize,
    pub trip_updates: usize,
    pub vehicles: usize,
    pub alerts: usize,
}

impl FeedSummary {
    pub fn from_feed(feed: &FeedMessage) -> Self {
        let count = |has: fn(&FeedEntity) -> bool| feed.entity.iter().filter(|e| has(e)).count();
        Self {
            timestamp: feed.header.timestamp,
            gtfs_realtime_version: feed.header.gtfs_realtime_version.clone(),
            entity_count: feed.entity.len(),
            trip_updates: count(|e| e.trip_update.is_some()),
            vehicles: count(|e| e.vehicle.is_some()),
            alerts: count(|e| e.alert.is_some()),
        }
    }
}

/// Serializes `record` as compact JSON followed by a newline.
pub fn write_json_line<W: Write, T: Serialize>(writer: &mut W, record: &T) -> std::io::Result<()> {
    serde_json::to_writer(&mut *writer, record)?;
    writer.write_all(b"\n")
}

/// Human-readable line for a snapshot report.
pub fn snapshot_line(report: &SnapshotReport) -> String {
    let line = format!(
        "Snapshotting {} {} to {}",
        report.entity_count,
        report.kind,
        report.destination.display()
    );
    debug!(status = ?report.status, "Formatted snapshot report");
    match report.status {
        SnapshotStatus::Written => line,
        SnapshotStatus::DryRun => format!("{line} (dry run)"),
        SnapshotStatus::AlreadyArchived => format!("{line} (already archived, skipped)"),
    }
}
