//! Deployment configuration.
//!
//! Values are read once, validated, and passed explicitly to the feed client,
//! archiver, and retriever. Nothing in the library reads the environment on
//! its own.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;

use crate::error::{Error, Result};

pub const DEFAULT_API_BASE_URL: &str = "https://api.actransit.org/transit";
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::America::Los_Angeles;
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub const ENV_API_TOKEN: &str = "ACTRANSIT_API_TOKEN";
pub const ENV_API_BASE_URL: &str = "ACTRANSIT_API_BASE_URL";
pub const ENV_TOKEN_PLACEMENT: &str = "ACTRANSIT_TOKEN_PLACEMENT";
pub const ENV_HTTP_TIMEOUT_SECS: &str = "ACTRANSIT_HTTP_TIMEOUT_SECS";
pub const ENV_TIMEZONE: &str = "ACTRANSIT_TIMEZONE";
pub const ENV_ON_EXISTING: &str = "ACTRANSIT_ON_EXISTING";

/// Where the API token travels on each feed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenPlacement {
    /// `?token=<token>`
    #[default]
    Query,
    /// `Authorization: Bearer <token>`
    Header,
}

impl FromStr for TokenPlacement {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "query" => Ok(TokenPlacement::Query),
            "header" | "bearer" => Ok(TokenPlacement::Header),
            other => Err(Error::Config(format!("unknown token placement '{other}'"))),
        }
    }
}

/// What a snapshot does when its destination already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExistingPolicy {
    #[default]
    Skip,
    Overwrite,
    Error,
}

impl FromStr for ExistingPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(ExistingPolicy::Skip),
            "overwrite" => Ok(ExistingPolicy::Overwrite),
            "error" => Ok(ExistingPolicy::Error),
            other => Err(Error::Config(format!("unknown existing-file policy '{other}'"))),
        }
    }
}

/// Upstream feed API settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: String,
    pub token_placement: TokenPlacement,
    pub timeout: Duration,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key/value source, failing on a missing
    /// token or malformed values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let token = lookup(ENV_API_TOKEN).unwrap_or_default();
        let base_url = lookup(ENV_API_BASE_URL).unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        let token_placement = lookup(ENV_TOKEN_PLACEMENT)
            .map(|v| v.parse::<TokenPlacement>())
            .transpose()?
            .unwrap_or_default();
        let timeout = match lookup(ENV_HTTP_TIMEOUT_SECS) {
            Some(secs) => Duration::from_secs(secs.parse().map_err(|_| {
                Error::Config(format!("{ENV_HTTP_TIMEOUT_SECS} must be whole seconds, got '{secs}'"))
            })?),
            None => DEFAULT_HTTP_TIMEOUT,
        };

        let config = Self {
            base_url,
            token,
            token_placement,
            timeout,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.token.trim().is_empty() {
            return Err(Error::Config(format!(
                "API token is required (set {ENV_API_TOKEN} or pass --api-token)"
            )));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "API base URL must be http(s), got '{}'",
                self.base_url
            )));
        }
        Ok(())
    }
}

/// Agency-wide settings that do not depend on the upstream API.
#[derive(Debug, Clone)]
pub struct AgencyConfig {
    pub timezone: Tz,
    pub on_existing: ExistingPolicy,
}

impl Default for AgencyConfig {
    fn default() -> Self {
        Self {
            timezone: DEFAULT_TIMEZONE,
            on_existing: ExistingPolicy::default(),
        }
    }
}

impl AgencyConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let timezone = match lookup(ENV_TIMEZONE) {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| Error::Config(format!("unknown timezone '{name}'")))?,
            None => DEFAULT_TIMEZONE,
        };
        let on_existing = lookup(ENV_ON_EXISTING)
            .map(|v| v.parse::<ExistingPolicy>())
            .transpose()?
            .unwrap_or_default();
        Ok(Self {
            timezone,
            on_existing,
        })
    }
}

/// Root of an archive: a local directory or an S3 bucket prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveUri {
    Local(PathBuf),
    S3 { bucket: String, prefix: PathBuf },
}

impl ArchiveUri {
    /// Directory the partition layout is rooted at, relative to the backend.
    pub fn base_dir(&self) -> PathBuf {
        match self {
            ArchiveUri::Local(path) => path.clone(),
            ArchiveUri::S3 { prefix, .. } => prefix.clone(),
        }
    }
}

impl FromStr for ArchiveUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Err(Error::Config("archive location must not be empty".into()));
        }
        match s.strip_prefix("s3://") {
            Some(rest) => {
                let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(Error::Config(format!("missing bucket in '{s}'")));
                }
                Ok(ArchiveUri::S3 {
                    bucket: bucket.to_string(),
                    prefix: PathBuf::from(prefix.trim_matches('/')),
                })
            }
            None if s.contains("://") => Err(Error::Config(format!(
                "unsupported archive scheme in '{s}'"
            ))),
            None => Ok(ArchiveUri::Local(PathBuf::from(s))),
        }
    }
}
