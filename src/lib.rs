//! Archiver and retriever for AC Transit GTFS-realtime feeds.
//!
//! Live snapshots are fetched with [`fetch::FeedClient`], written by
//! [`archive::Archiver`] into a UTC-day partitioned layout, and read back
//! with [`retrieve::Retriever`] as raw feeds or decoded vehicle positions.

pub mod archive;
pub mod codec;
pub mod config;
pub mod error;
pub mod fetch;
pub mod kind;
pub mod output;
pub mod partition;
pub mod query;
pub mod retrieve;
pub mod storage;
pub mod vehicle;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}

pub use error::{Error, Result};
pub use kind::FeedKind;
