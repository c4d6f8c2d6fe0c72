//! Protobuf and gzip codec for live feeds and archived snapshots.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use prost::Message;

use crate::error::Result;
use crate::gtfs_rt::FeedMessage;

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
///
/// # Errors
///
/// Returns [`crate::Error::Decode`] if the bytes are not valid protobuf for a
/// `FeedMessage`.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage> {
    Ok(FeedMessage::decode(bytes)?)
}

/// Gzip-compresses a feed body exactly as received.
pub fn compress(raw: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw)?;
    Ok(encoder.finish()?)
}

/// Inverse of [`compress`].
pub fn decompress(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    GzDecoder::new(compressed).read_to_end(&mut raw)?;
    Ok(raw)
}

/// Serializes `feed` to its canonical binary form and gzip-compresses it.
///
/// Unknown fields are not kept by the decoded types; archive the upstream
/// body with [`compress`] instead when it is available.
pub fn encode_snapshot(feed: &FeedMessage) -> Result<Vec<u8>> {
    compress(&feed.encode_to_vec())
}

/// Decompresses and decodes an archived snapshot.
pub fn decode_snapshot(compressed: &[u8]) -> Result<FeedMessage> {
    parse_feed(&decompress(compressed)?)
}
