//! Reading archived snapshots back over a time range.
//!
//! Retrieval is pull-based: a cursor lists one UTC-day partition at a time
//! and reads one snapshot file per step, so stopping early (on a limit, or
//! because the caller dropped the cursor) never leaves a file half-read.
//!
//! Unreadable or undecodable snapshot files are skipped with a warning, and
//! so are entities that do not decode as vehicle positions. Both are counted
//! in [`RetrievalStats`].

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeZone};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::{debug, warn};

use crate::codec::decode_snapshot;
use crate::error::Result;
use crate::gtfs_rt::{FeedEntity, FeedMessage};
use crate::kind::FeedKind;
use crate::partition::{DayRange, base_path, snapshot_suffix};
use crate::storage::Storage;
use crate::vehicle::{VehicleFilter, VehiclePosition};

/// Counters describing what a cursor has scanned so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetrievalStats {
    pub partitions_listed: usize,
    pub files_read: usize,
    pub files_skipped: usize,
    pub entities_scanned: usize,
    pub entities_skipped: usize,
    pub records_yielded: usize,
}

pub struct Retriever {
    storage: Arc<dyn Storage>,
    base_dir: PathBuf,
    timezone: Tz,
}

impl Retriever {
    /// `timezone` is the agency zone used to derive `start_datetime` on
    /// decoded vehicle positions.
    pub fn new(storage: Arc<dyn Storage>, base_dir: impl Into<PathBuf>, timezone: Tz) -> Self {
        Self {
            storage,
            base_dir: base_dir.into(),
            timezone,
        }
    }

    /// Snapshots of `kind` in every UTC-day partition overlapped by
    /// `[start, end]`, oldest day first.
    pub fn feeds<T: TimeZone>(
        &self,
        kind: FeedKind,
        start: &DateTime<T>,
        end: &DateTime<T>,
        limit: Option<usize>,
    ) -> FeedCursor {
        FeedCursor {
            files: SnapshotFiles::new(self.storage.clone(), &self.base_dir, kind, start, end),
            limit,
        }
    }

    /// Decoded vehicle positions from the vehicles partitions overlapped by
    /// `[start, end]`, keeping only records that satisfy `filter`. `limit`
    /// bounds the records yielded, not the entities scanned.
    pub fn vehicle_positions<T: TimeZone>(
        &self,
        start: &DateTime<T>,
        end: &DateTime<T>,
        filter: Option<VehicleFilter>,
        limit: Option<usize>,
    ) -> VehicleCursor {
        VehicleCursor {
            files: SnapshotFiles::new(
                self.storage.clone(),
                &self.base_dir,
                FeedKind::Vehicles,
                start,
                end,
            ),
            entities: VecDeque::new(),
            filter: filter.unwrap_or_default(),
            timezone: self.timezone,
            limit,
        }
    }
}

/// Walks day partitions and decodes one snapshot file per call.
struct SnapshotFiles {
    storage: Arc<dyn Storage>,
    base_dir: PathBuf,
    kind: FeedKind,
    suffix: String,
    days: DayRange,
    pending: VecDeque<PathBuf>,
    stats: RetrievalStats,
}

impl SnapshotFiles {
    fn new<T: TimeZone>(
        storage: Arc<dyn Storage>,
        base_dir: &Path,
        kind: FeedKind,
        start: &DateTime<T>,
        end: &DateTime<T>,
    ) -> Self {
        Self {
            storage,
            base_dir: base_dir.to_path_buf(),
            kind,
            suffix: snapshot_suffix(kind),
            days: DayRange::covering(start, end),
            pending: VecDeque::new(),
            stats: RetrievalStats::default(),
        }
    }

    /// Next decodable snapshot, `Some(Err)` when a partition cannot be
    /// listed, or `None` once every partition is exhausted.
    async fn next_feed(&mut self) -> Option<Result<FeedMessage>> {
        loop {
            if let Some(path) = self.pending.pop_front() {
                match self.load(&path).await {
                    Ok(feed) => {
                        self.stats.files_read += 1;
                        return Some(Ok(feed));
                    }
                    Err(e) => {
                        self.stats.files_skipped += 1;
                        warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot");
                        continue;
                    }
                }
            }

            let day = self.days.next()?;
            let dir = base_path(self.kind, &self.base_dir, day);
            self.stats.partitions_listed += 1;
            match self.storage.list(&dir, &self.suffix).await {
                Ok(paths) => {
                    debug!(dir = %dir.display(), files = paths.len(), "Listed partition");
                    self.pending.extend(paths);
                }
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Failed to list partition");
                    return Some(Err(e));
                }
            }
        }
    }

    async fn load(&self, path: &Path) -> Result<FeedMessage> {
        let compressed = self.storage.read(path).await?;
        decode_snapshot(&compressed)
    }
}

fn limit_reached(limit: Option<usize>, yielded: usize) -> bool {
    limit.is_some_and(|limit| yielded >= limit)
}

/// Cursor over archived [`FeedMessage`]s.
pub struct FeedCursor {
    files: SnapshotFiles,
    limit: Option<usize>,
}

impl FeedCursor {
    pub async fn next(&mut self) -> Option<Result<FeedMessage>> {
        if limit_reached(self.limit, self.files.stats.records_yielded) {
            return None;
        }
        let item = self.files.next_feed().await?;
        if item.is_ok() {
            self.files.stats.records_yielded += 1;
        }
        Some(item)
    }

    pub fn stats(&self) -> RetrievalStats {
        self.files.stats
    }

    /// Drains the cursor, stopping at the first partition listing error.
    pub async fn collect(mut self) -> Result<Vec<FeedMessage>> {
        let mut feeds = Vec::new();
        while let Some(feed) = self.next().await {
            feeds.push(feed?);
        }
        Ok(feeds)
    }
}

/// Cursor over decoded, filtered [`VehiclePosition`]s.
pub struct VehicleCursor {
    files: SnapshotFiles,
    entities: VecDeque<FeedEntity>,
    filter: VehicleFilter,
    timezone: Tz,
    limit: Option<usize>,
}

impl VehicleCursor {
    pub async fn next(&mut self) -> Option<Result<VehiclePosition>> {
        loop {
            if limit_reached(self.limit, self.files.stats.records_yielded) {
                return None;
            }

            let Some(entity) = self.entities.pop_front() else {
                match self.files.next_feed().await? {
                    Ok(feed) => self.entities.extend(feed.entity),
                    Err(e) => return Some(Err(e)),
                }
                continue;
            };

            self.files.stats.entities_scanned += 1;
            let record = match VehiclePosition::from_entity(&entity, self.timezone) {
                Ok(record) => record,
                Err(e) => {
                    self.files.stats.entities_skipped += 1;
                    debug!(entity_id = %entity.id, error = %e, "Skipping entity");
                    continue;
                }
            };

            if self.filter.matches(&record) {
                self.files.stats.records_yielded += 1;
                return Some(Ok(record));
            }
        }
    }

    pub fn stats(&self) -> RetrievalStats {
        self.files.stats
    }

    /// Drains the cursor, stopping at the first partition listing error.
    pub async fn collect(mut self) -> Result<Vec<VehiclePosition>> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await {
            records.push(record?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_snapshot;
    use crate::error::Error;
    use crate::gtfs_rt::{self, FeedHeader};
    use crate::partition::output_path;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{FixedOffset, Utc};
    use chrono_tz::America::Los_Angeles;

    const FEB_16: u64 = 1708041600;

    fn vehicle(id: &str, route: Option<&str>) -> FeedEntity {
        FeedEntity {
            id: id.to_string(),
            vehicle: Some(gtfs_rt::VehiclePosition {
                trip: route.map(|r| gtfs_rt::TripDescriptor {
                    route_id: Some(r.to_string()),
                    ..Default::default()
                }),
                vehicle: Some(gtfs_rt::VehicleDescriptor {
                    id: Some(id.to_string()),
                    ..Default::default()
                }),
                position: Some(gtfs_rt::Position {
                    latitude: Some(37.8),
                    longitude: Some(-122.27),
                    ..Default::default()
                }),
                timestamp: Some(FEB_16),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn feed(timestamp: u64, entity: Vec<FeedEntity>) -> FeedMessage {
        FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "2.0".to_string(),
                timestamp: Some(timestamp),
                ..Default::default()
            },
            entity,
        }
    }

    async fn archive(storage: &MemoryStorage, kind: FeedKind, message: &FeedMessage) {
        let timestamp = message.header.timestamp.unwrap();
        let path = output_path(kind, Path::new("/data"), timestamp).unwrap();
        storage.create_dir_all(path.parent().unwrap()).await.unwrap();
        storage
            .write(&path, Bytes::from(encode_snapshot(message).unwrap()))
            .await
            .unwrap();
    }

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_feeds_across_days_in_order() {
        let storage = Arc::new(MemoryStorage::new());
        for ts in [FEB_16 + 86400 + 60, FEB_16 + 60, FEB_16 + 30, FEB_16 - 30] {
            archive(&storage, FeedKind::Alerts, &feed(ts, vec![])).await;
        }
        archive(&storage, FeedKind::TripUpdates, &feed(FEB_16 + 10, vec![])).await;

        let retriever = Retriever::new(storage, "/data", Los_Angeles);
        let feeds = retriever
            .feeds(
                FeedKind::Alerts,
                &utc("2024-02-16T00:00:00Z"),
                &utc("2024-02-17T23:59:59Z"),
                None,
            )
            .collect()
            .await
            .unwrap();

        let timestamps: Vec<_> = feeds.iter().map(|f| f.header.timestamp.unwrap()).collect();
        assert_eq!(timestamps, vec![FEB_16 + 30, FEB_16 + 60, FEB_16 + 86400 + 60]);
    }

    #[tokio::test]
    async fn test_feeds_limit_stops_mid_day() {
        let storage = Arc::new(MemoryStorage::new());
        for i in 0..5 {
            archive(&storage, FeedKind::TripUpdates, &feed(FEB_16 + i * 30, vec![])).await;
        }

        let retriever = Retriever::new(storage, "/data", Los_Angeles);
        let mut cursor = retriever.feeds(
            FeedKind::TripUpdates,
            &utc("2024-02-16T00:00:00Z"),
            &utc("2024-02-16T23:59:59Z"),
            Some(2),
        );
        assert!(cursor.next().await.is_some());
        assert!(cursor.next().await.is_some());
        assert!(cursor.next().await.is_none());
        assert_eq!(cursor.stats().files_read, 2);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_skipped_not_fatal() {
        let storage = Arc::new(MemoryStorage::new());
        archive(&storage, FeedKind::Alerts, &feed(FEB_16 + 10, vec![])).await;
        archive(&storage, FeedKind::Alerts, &feed(FEB_16 + 30, vec![])).await;
        let bad = output_path(FeedKind::Alerts, Path::new("/data"), FEB_16 + 20).unwrap();
        storage
            .write(&bad, Bytes::from_static(b"not gzip"))
            .await
            .unwrap();

        let retriever = Retriever::new(storage, "/data", Los_Angeles);
        let mut cursor = retriever.feeds(
            FeedKind::Alerts,
            &utc("2024-02-16T00:00:00Z"),
            &utc("2024-02-16T00:10:00Z"),
            None,
        );
        let mut timestamps = Vec::new();
        while let Some(feed) = cursor.next().await {
            timestamps.push(feed.unwrap().header.timestamp.unwrap());
        }

        assert_eq!(timestamps, vec![FEB_16 + 10, FEB_16 + 30]);
        assert_eq!(cursor.stats().files_skipped, 1);
        assert_eq!(cursor.stats().files_read, 2);
    }

    #[tokio::test]
    async fn test_vehicle_positions_filter_and_limit() {
        let storage = Arc::new(MemoryStorage::new());
        archive(
            &storage,
            FeedKind::Vehicles,
            &feed(
                FEB_16,
                vec![
                    vehicle("1", Some("97")),
                    vehicle("2", Some("12")),
                    vehicle("3", None),
                    vehicle("4", Some("97")),
                ],
            ),
        )
        .await;
        archive(
            &storage,
            FeedKind::Vehicles,
            &feed(FEB_16 + 30, vec![vehicle("5", Some("97")), vehicle("6", Some("97"))]),
        )
        .await;

        let retriever = Retriever::new(storage, "/data", Los_Angeles);
        let start = utc("2024-02-16T00:00:00Z");
        let end = utc("2024-02-16T23:59:59Z");
        let filter = VehicleFilter::from_pairs([("route_id", "97")]).unwrap();

        let all: Vec<_> = retriever
            .vehicle_positions(&start, &end, Some(filter.clone()), None)
            .collect()
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.entity_id)
            .collect();
        assert_eq!(all, vec!["1", "4", "5", "6"]);

        let mut cursor = retriever.vehicle_positions(&start, &end, Some(filter), Some(3));
        let mut ids = Vec::new();
        while let Some(v) = cursor.next().await {
            ids.push(v.unwrap().entity_id);
        }
        assert_eq!(ids, vec!["1", "4", "5"]);
        assert_eq!(cursor.stats().records_yielded, 3);
        assert_eq!(cursor.stats().entities_scanned, 5);

        let unfiltered = retriever
            .vehicle_positions(&start, &end, None, Some(5))
            .collect()
            .await
            .unwrap();
        assert_eq!(unfiltered.len(), 5);
    }

    #[tokio::test]
    async fn test_vehicle_positions_skip_bad_entities() {
        let mut no_position = vehicle("2", Some("97"));
        no_position.vehicle.as_mut().unwrap().position = None;
        let alert = FeedEntity {
            id: "a".into(),
            alert: Some(gtfs_rt::Alert::default()),
            ..Default::default()
        };

        let storage = Arc::new(MemoryStorage::new());
        archive(
            &storage,
            FeedKind::Vehicles,
            &feed(FEB_16, vec![vehicle("1", None), no_position, alert, vehicle("3", None)]),
        )
        .await;

        let retriever = Retriever::new(storage, "/data", Los_Angeles);
        let mut cursor = retriever.vehicle_positions(
            &utc("2024-02-16T00:00:00Z"),
            &utc("2024-02-16T01:00:00Z"),
            None,
            None,
        );
        let mut ids = Vec::new();
        while let Some(v) = cursor.next().await {
            ids.push(v.unwrap().entity_id);
        }
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(cursor.stats().entities_skipped, 2);
    }

    #[tokio::test]
    async fn test_zero_limit_yields_nothing() {
        let storage = Arc::new(MemoryStorage::new());
        archive(&storage, FeedKind::Vehicles, &feed(FEB_16, vec![vehicle("1", None)])).await;

        let retriever = Retriever::new(storage, "/data", Los_Angeles);
        let records = retriever
            .vehicle_positions(
                &utc("2024-02-16T00:00:00Z"),
                &utc("2024-02-16T01:00:00Z"),
                None,
                Some(0),
            )
            .collect()
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_offset_range_lists_utc_partitions() {
        let storage = Arc::new(MemoryStorage::new());
        // 2024-02-15T23:30:00Z and 2024-02-16T00:30:00Z
        archive(&storage, FeedKind::Alerts, &feed(FEB_16 - 1800, vec![])).await;
        archive(&storage, FeedKind::Alerts, &feed(FEB_16 + 1800, vec![])).await;

        let pst = FixedOffset::west_opt(8 * 3600).unwrap();
        let retriever = Retriever::new(storage, "/data", Los_Angeles);
        let cursor = retriever.feeds(
            FeedKind::Alerts,
            &pst.with_ymd_and_hms(2024, 2, 15, 15, 0, 0).unwrap(),
            &pst.with_ymd_and_hms(2024, 2, 15, 17, 0, 0).unwrap(),
            None,
        );
        let feeds = cursor.collect().await.unwrap();
        assert_eq!(feeds.len(), 2);
    }

    struct BrokenListing;

    #[async_trait]
    impl Storage for BrokenListing {
        async fn create_dir_all(&self, _dir: &Path) -> Result<()> {
            Ok(())
        }
        async fn list(&self, dir: &Path, _suffix: &str) -> Result<Vec<PathBuf>> {
            Err(Error::storage(dir, "access denied"))
        }
        async fn exists(&self, _path: &Path) -> Result<bool> {
            Ok(false)
        }
        async fn read(&self, path: &Path) -> Result<Bytes> {
            Err(Error::storage(path, "access denied"))
        }
        async fn write(&self, path: &Path, _contents: Bytes) -> Result<()> {
            Err(Error::storage(path, "access denied"))
        }
    }

    #[tokio::test]
    async fn test_listing_error_surfaces_per_partition() {
        let retriever = Retriever::new(Arc::new(BrokenListing), "/data", Los_Angeles);
        let mut cursor = retriever.feeds(
            FeedKind::Alerts,
            &utc("2024-02-16T00:00:00Z"),
            &utc("2024-02-17T00:00:00Z"),
            None,
        );
        assert!(matches!(cursor.next().await, Some(Err(Error::Storage { .. }))));
        assert!(matches!(cursor.next().await, Some(Err(Error::Storage { .. }))));
        assert!(cursor.next().await.is_none());
        assert_eq!(cursor.stats().partitions_listed, 2);
    }
}
