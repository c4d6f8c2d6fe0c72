//! Error taxonomy for fetching, archiving, and retrieving feeds.

use std::path::PathBuf;

use crate::kind::FeedKind;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Upstream returned a non-success status, or the request never completed.
    #[error("{kind} feed unavailable: {reason}")]
    FeedUnavailable { kind: FeedKind, reason: String },

    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error at {path}: {reason}")]
    Storage { path: PathBuf, reason: String },

    #[error("Entity {entity_id} does not carry a vehicle position")]
    NotAVehicleEntity { entity_id: String },

    #[error("Entity {entity_id} is missing required field {field}")]
    MissingRequiredField {
        entity_id: String,
        field: &'static str,
    },

    #[error("Invalid start date/time: {date} {time}")]
    InvalidTimeFormat { date: String, time: String },

    #[error("Invalid value {value} for {field}")]
    InvalidEnumValue { field: &'static str, value: i32 },

    #[error("Timestamp {0} is out of range")]
    InvalidTimestamp(u64),

    #[error("{kind} feed header has no timestamp")]
    MissingHeaderTimestamp { kind: FeedKind },

    #[error("Snapshot already archived at {0}")]
    AlreadyArchived(PathBuf),

    #[error("Unknown vehicle position field: {0}")]
    UnknownField(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Configuration errors are raised before any I/O is attempted.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config(_) | Error::UnknownField(_))
    }

    pub(crate) fn storage(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Error::Storage {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
