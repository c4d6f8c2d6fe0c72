//! Feed client for the agency's realtime endpoints.
//!
//! `GET {base}/gtfsrt/{tripupdates|vehicles|alerts}` returns a binary
//! `FeedMessage`. Requests go through an [`HttpClient`] so the token can be
//! attached by a wrapper from [`auth`].

mod basic;
mod client;
pub mod auth;

pub use basic::BasicClient;
pub use client::HttpClient;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, StatusCode, Url};
use tracing::debug;

use crate::codec::parse_feed;
use crate::config::{ApiConfig, TokenPlacement};
use crate::error::{Error, Result};
use crate::gtfs_rt::FeedMessage;
use crate::kind::FeedKind;

/// A feed as served upstream: the untouched response body plus its decoded
/// form. Archives store `bytes`, so fields and extensions the local schema
/// does not know about survive.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub bytes: Bytes,
    pub feed: FeedMessage,
}

impl Fetched {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Result<Self> {
        let bytes = bytes.into();
        let feed = parse_feed(&bytes)?;
        Ok(Self { bytes, feed })
    }
}

/// Anything that can produce the current snapshot of a feed kind.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, kind: FeedKind) -> Result<Fetched>;
}

pub struct FeedClient<C> {
    http: C,
    base_url: String,
}

impl<C: HttpClient> FeedClient<C> {
    pub fn new(http: C, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn feed_url(&self, kind: FeedKind) -> String {
        format!("{}/gtfsrt/{}", self.base_url.trim_end_matches('/'), kind)
    }
}

/// Builds the client described by `config`, with the token attached the way
/// the config asks for.
pub fn client_from_config(config: &ApiConfig) -> Result<FeedClient<Box<dyn HttpClient>>> {
    config.validate()?;
    let basic = BasicClient::with_timeout(config.timeout)?;
    let http: Box<dyn HttpClient> = match config.token_placement {
        TokenPlacement::Query => Box::new(auth::UrlParam::token(basic, config.token.clone())),
        TokenPlacement::Header => Box::new(auth::ApiKey::bearer(basic, &config.token)?),
    };
    Ok(FeedClient::new(http, config.base_url.clone()))
}

#[async_trait]
impl<C: HttpClient> FeedSource for FeedClient<C> {
    /// One request, no retries. Transport failures and non-200 statuses are
    /// both reported as [`Error::FeedUnavailable`].
    #[tracing::instrument(skip(self), fields(kind = %kind))]
    async fn fetch(&self, kind: FeedKind) -> Result<Fetched> {
        let url = self.feed_url(kind);
        let url = Url::parse(&url)
            .map_err(|e| Error::Config(format!("invalid feed URL '{url}': {e}")))?;
        let unavailable = |reason: String| Error::FeedUnavailable { kind, reason };

        let resp = self
            .http
            .execute(reqwest::Request::new(Method::GET, url))
            .await
            .map_err(|e| unavailable(e.without_url().to_string()))?;

        let status = resp.status();
        if status != StatusCode::OK {
            return Err(unavailable(format!("upstream returned status {status}")));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| unavailable(e.without_url().to_string()))?;
        debug!(bytes = bytes.len(), "Feed bytes received, parsing");

        Fetched::from_bytes(bytes)
    }
}
