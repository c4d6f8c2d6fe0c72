//! The three realtime feed categories that get archived.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    TripUpdates,
    Vehicles,
    Alerts,
}

impl FeedKind {
    /// Snapshot order used by `snapshot_all`.
    pub const ALL: [FeedKind; 3] = [FeedKind::TripUpdates, FeedKind::Alerts, FeedKind::Vehicles];

    /// Name shared by the upstream URL suffix, the partition directory, and
    /// the snapshot file suffix.
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedKind::TripUpdates => "tripupdates",
            FeedKind::Vehicles => "vehicles",
            FeedKind::Alerts => "alerts",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tripupdates" | "trip-updates" | "trip_updates" => Ok(FeedKind::TripUpdates),
            "vehicles" | "vehicle-positions" | "vehicle_positions" => Ok(FeedKind::Vehicles),
            "alerts" => Ok(FeedKind::Alerts),
            other => Err(Error::Config(format!("unknown feed kind '{other}'"))),
        }
    }
}
