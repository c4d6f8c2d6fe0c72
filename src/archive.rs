//! Snapshotting live feeds into the partitioned archive.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::{Instrument, info, info_span, warn};

use crate::codec::compress;
use crate::config::ExistingPolicy;
use crate::error::{Error, Result};
use crate::fetch::{FeedSource, Fetched};
use crate::kind::FeedKind;
use crate::partition::output_path;
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Written,
    DryRun,
    /// The destination already held a snapshot and was left untouched.
    AlreadyArchived,
}

/// What one snapshot did, or would have done.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotReport {
    pub kind: FeedKind,
    pub entity_count: usize,
    pub destination: PathBuf,
    pub status: SnapshotStatus,
}

pub struct Archiver<F> {
    source: F,
    storage: Arc<dyn Storage>,
    base_dir: PathBuf,
    on_existing: ExistingPolicy,
}

impl<F: FeedSource> Archiver<F> {
    pub fn new(source: F, storage: Arc<dyn Storage>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            storage,
            base_dir: base_dir.into(),
            on_existing: ExistingPolicy::default(),
        }
    }

    pub fn with_existing_policy(mut self, policy: ExistingPolicy) -> Self {
        self.on_existing = policy;
        self
    }

    /// Fails with [`Error::Config`] when the archive root cannot hold
    /// partitions.
    pub async fn validate(&self) -> Result<()> {
        self.storage.check_base(&self.base_dir).await
    }

    /// Fetches `kind` and archives the upstream body, unchanged, under the
    /// UTC day of its header timestamp. A dry run stops once the destination
    /// is known.
    #[tracing::instrument(skip(self), fields(kind = %kind))]
    pub async fn snapshot_one(&self, kind: FeedKind, dry_run: bool) -> Result<SnapshotReport> {
        self.validate().await?;
        let Fetched { bytes, feed } = self.source.fetch(kind).await?;
        let timestamp = feed
            .header
            .timestamp
            .ok_or(Error::MissingHeaderTimestamp { kind })?;
        let destination = output_path(kind, &self.base_dir, timestamp)?;
        let entity_count = feed.entity.len();

        info!(
            entity_count,
            destination = %destination.display(),
            dry_run,
            "Snapshotting {entity_count} {kind} to {}",
            destination.display()
        );

        let report = |status| SnapshotReport {
            kind,
            entity_count,
            destination: destination.clone(),
            status,
        };

        if dry_run {
            return Ok(report(SnapshotStatus::DryRun));
        }

        if let Some(parent) = destination.parent() {
            self.storage.create_dir_all(parent).await?;
        }

        if self.storage.exists(&destination).await? {
            match self.on_existing {
                ExistingPolicy::Skip => {
                    warn!(destination = %destination.display(), "Snapshot already archived, skipping");
                    return Ok(report(SnapshotStatus::AlreadyArchived));
                }
                ExistingPolicy::Error => return Err(Error::AlreadyArchived(destination.clone())),
                ExistingPolicy::Overwrite => {
                    warn!(destination = %destination.display(), "Overwriting archived snapshot");
                }
            }
        }

        let compressed = compress(&bytes)?;
        self.storage
            .write(&destination, Bytes::from(compressed))
            .await?;

        Ok(report(SnapshotStatus::Written))
    }

    /// Snapshots every kind concurrently. Each kind succeeds or fails on its
    /// own; results come back in [`FeedKind::ALL`] order.
    pub async fn snapshot_all(&self, dry_run: bool) -> Vec<(FeedKind, Result<SnapshotReport>)> {
        let [first, second, third] = FeedKind::ALL;
        let run = move |kind: FeedKind| {
            self.snapshot_one(kind, dry_run)
                .instrument(info_span!("snapshot_all", kind = %kind))
        };

        let (a, b, c) = tokio::join!(run(first), run(second), run(third));
        let results = vec![(first, a), (second, b), (third, c)];

        for (kind, result) in &results {
            if let Err(e) = result {
                warn!(kind = %kind, error = %e, "Snapshot failed");
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_snapshot, decompress};
    use crate::gtfs_rt::{FeedEntity, FeedHeader, FeedMessage};
    use crate::storage::{LocalStorage, MemoryStorage};
    use async_trait::async_trait;
    use prost::Message;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves canned feeds per kind; kinds without one are unavailable.
    #[derive(Default)]
    struct CannedSource {
        feeds: HashMap<FeedKind, Bytes>,
        calls: AtomicUsize,
    }

    impl CannedSource {
        fn with(mut self, kind: FeedKind, timestamp: Option<u64>, entities: usize) -> Self {
            let entity = (0..entities)
                .map(|i| FeedEntity {
                    id: format!("{kind}-{i}"),
                    ..Default::default()
                })
                .collect();
            let feed = FeedMessage {
                header: FeedHeader {
                    gtfs_realtime_version: "2.0".into(),
                    timestamp,
                    ..Default::default()
                },
                entity,
            };
            self.with_body(kind, feed.encode_to_vec())
        }

        fn with_body(mut self, kind: FeedKind, body: Vec<u8>) -> Self {
            self.feeds.insert(kind, Bytes::from(body));
            self
        }
    }

    #[async_trait]
    impl FeedSource for CannedSource {
        async fn fetch(&self, kind: FeedKind) -> Result<Fetched> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let body = self
                .feeds
                .get(&kind)
                .cloned()
                .ok_or_else(|| Error::FeedUnavailable {
                    kind,
                    reason: "upstream returned status 503 Service Unavailable".into(),
                })?;
            Fetched::from_bytes(body)
        }
    }

    const TS: u64 = 1708041600;

    fn archiver(source: CannedSource) -> (Archiver<CannedSource>, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (Archiver::new(source, storage.clone(), "/data"), storage)
    }

    #[tokio::test]
    async fn test_snapshot_one_writes_partitioned_file() {
        let source = CannedSource::default().with(FeedKind::Vehicles, Some(TS), 42);
        let (archiver, storage) = archiver(source);

        let report = archiver
            .snapshot_one(FeedKind::Vehicles, false)
            .await
            .unwrap();
        let expected = PathBuf::from("/data/vehicles/2024/02/16/1708041600.vehicles.pb.gz");
        assert_eq!(report.destination, expected);
        assert_eq!(report.entity_count, 42);
        assert_eq!(report.status, SnapshotStatus::Written);

        let stored = decode_snapshot(&storage.read(&expected).await.unwrap()).unwrap();
        assert_eq!(stored.entity.len(), 42);
        assert_eq!(stored.header.timestamp, Some(TS));
    }

    #[tokio::test]
    async fn test_dry_run_fetches_but_writes_nothing() {
        let source = CannedSource::default().with(FeedKind::Alerts, Some(TS), 3);
        let (archiver, storage) = archiver(source);

        let report = archiver.snapshot_one(FeedKind::Alerts, true).await.unwrap();
        assert_eq!(report.status, SnapshotStatus::DryRun);
        assert_eq!(
            report.destination,
            Path::new("/data/alerts/2024/02/16/1708041600.alerts.pb.gz")
        );
        assert_eq!(archiver.source.calls.load(Ordering::SeqCst), 1);
        assert!(storage.paths().await.is_empty());
        assert!(storage.dirs().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_header_timestamp_is_an_error() {
        let source = CannedSource::default().with(FeedKind::TripUpdates, None, 1);
        let (archiver, storage) = archiver(source);

        let err = archiver
            .snapshot_one(FeedKind::TripUpdates, false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::MissingHeaderTimestamp {
                kind: FeedKind::TripUpdates
            }
        ));
        assert!(storage.paths().await.is_empty());
    }

    #[tokio::test]
    async fn test_existing_destination_skip_is_default() {
        let source = CannedSource::default().with(FeedKind::Alerts, Some(TS), 1);
        let (archiver, storage) = archiver(source);
        archiver.snapshot_one(FeedKind::Alerts, false).await.unwrap();

        let report = archiver.snapshot_one(FeedKind::Alerts, false).await.unwrap();
        assert_eq!(report.status, SnapshotStatus::AlreadyArchived);
        assert_eq!(storage.paths().await.len(), 1);
    }

    #[tokio::test]
    async fn test_existing_destination_error_policy() {
        let source = CannedSource::default().with(FeedKind::Alerts, Some(TS), 1);
        let (archiver, _storage) = archiver(source);
        let archiver = archiver.with_existing_policy(ExistingPolicy::Error);
        archiver.snapshot_one(FeedKind::Alerts, false).await.unwrap();

        let err = archiver
            .snapshot_one(FeedKind::Alerts, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyArchived(_)));
    }

    #[tokio::test]
    async fn test_existing_destination_overwrite_policy() {
        let storage = Arc::new(MemoryStorage::new());
        let first = Archiver::new(
            CannedSource::default().with(FeedKind::Alerts, Some(TS), 1),
            storage.clone(),
            "/data",
        );
        first.snapshot_one(FeedKind::Alerts, false).await.unwrap();

        let second = Archiver::new(
            CannedSource::default().with(FeedKind::Alerts, Some(TS), 5),
            storage.clone(),
            "/data",
        )
        .with_existing_policy(ExistingPolicy::Overwrite);
        let report = second.snapshot_one(FeedKind::Alerts, false).await.unwrap();
        assert_eq!(report.status, SnapshotStatus::Written);

        let stored = decode_snapshot(&storage.read(&report.destination).await.unwrap()).unwrap();
        assert_eq!(stored.entity.len(), 5);
    }

    #[tokio::test]
    async fn test_snapshot_all_tolerates_partial_failure() {
        let source = CannedSource::default()
            .with(FeedKind::TripUpdates, Some(TS), 2)
            .with(FeedKind::Vehicles, Some(TS + 1), 4);
        let (archiver, storage) = archiver(source);

        let results = archiver.snapshot_all(false).await;
        let kinds: Vec<_> = results.iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, FeedKind::ALL.to_vec());

        for (kind, result) in &results {
            match kind {
                FeedKind::Alerts => assert!(matches!(result, Err(Error::FeedUnavailable { .. }))),
                _ => assert_eq!(result.as_ref().unwrap().status, SnapshotStatus::Written),
            }
        }
        assert_eq!(storage.paths().await.len(), 2);
    }

    #[tokio::test]
    async fn test_archive_keeps_upstream_bytes_verbatim() {
        let mut body = FeedMessage {
            header: FeedHeader {
                gtfs_realtime_version: "2.0".into(),
                timestamp: Some(TS),
                ..Default::default()
            },
            entity: vec![],
        }
        .encode_to_vec();
        // Extension field 1000, varint 5: unknown to the generated types.
        body.extend_from_slice(&[0xC0, 0x3E, 0x05]);

        let source = CannedSource::default().with_body(FeedKind::TripUpdates, body.clone());
        let (archiver, storage) = archiver(source);
        let report = archiver
            .snapshot_one(FeedKind::TripUpdates, false)
            .await
            .unwrap();

        let stored = storage.read(&report.destination).await.unwrap();
        assert_eq!(decompress(&stored).unwrap(), body);
    }

    #[tokio::test]
    async fn test_unusable_base_is_config_error_before_fetch() {
        let file = tempfile::NamedTempFile::new().unwrap();
        for base in [file.path().to_path_buf(), file.path().join("archive")] {
            let source = CannedSource::default().with(FeedKind::Alerts, Some(TS), 1);
            let archiver = Archiver::new(source, Arc::new(LocalStorage::new()), base);

            assert!(archiver.validate().await.unwrap_err().is_config());
            let err = archiver
                .snapshot_one(FeedKind::Alerts, false)
                .await
                .unwrap_err();
            assert!(err.is_config());
            assert_eq!(archiver.source.calls.load(Ordering::SeqCst), 0);
        }
    }
}
