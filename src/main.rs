//! CLI entry point for the AC Transit realtime archiver.
//!
//! Provides subcommands for fetching a live feed, snapshotting feeds into a
//! local or S3 archive, and reading archived feeds and vehicle positions
//! back out as JSON lines.

use std::ffi::OsStr;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use actransit_rt::archive::Archiver;
use actransit_rt::config::{
    AgencyConfig, ApiConfig, ArchiveUri, ENV_API_BASE_URL, ENV_API_TOKEN, ENV_ON_EXISTING,
    ENV_TIMEZONE,
};
use actransit_rt::fetch::{FeedSource, client_from_config};
use actransit_rt::output::{FeedSummary, snapshot_line, write_json_line};
use actransit_rt::query::{Bound, parse_filters, parse_instant};
use actransit_rt::retrieve::Retriever;
use actransit_rt::storage::{LocalStorage, S3Storage, Storage};
use actransit_rt::FeedKind;
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "actransit_rt")]
#[command(about = "Archive and query AC Transit GTFS-realtime feeds", long_about = None)]
struct Cli {
    /// API token (overrides ACTRANSIT_API_TOKEN)
    #[arg(long, global = true)]
    api_token: Option<String>,

    /// API base URL (overrides ACTRANSIT_API_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// IANA timezone of the agency (overrides ACTRANSIT_TIMEZONE)
    #[arg(long, global = true)]
    timezone: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the version and exit
    Version,
    /// Fetch one live feed
    Fetch {
        /// tripupdates, vehicles, or alerts
        kind: FeedKind,

        /// Write the upstream bytes to this file or s3://bucket/key instead
        /// of printing the feed
        #[arg(short, long)]
        output: Option<ArchiveUri>,
    },
    /// Snapshot live feeds into the archive
    Snapshot {
        /// Only snapshot this kind (default: all three)
        #[arg(short, long)]
        kind: Option<FeedKind>,

        /// Archive root: a directory or s3://bucket/prefix
        #[arg(short, long)]
        output: ArchiveUri,

        /// Fetch and report, but write nothing
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// skip, overwrite, or error (overrides ACTRANSIT_ON_EXISTING)
        #[arg(long)]
        on_existing: Option<String>,
    },
    /// Print a summary line per archived snapshot
    Feeds {
        /// tripupdates or alerts (vehicles also works)
        kind: FeedKind,

        /// Archive root: a directory or s3://bucket/prefix
        #[arg(short, long)]
        input: ArchiveUri,

        /// Range start: YYYY-MM-DD (local) or RFC 3339
        #[arg(long)]
        start: String,

        /// Range end: YYYY-MM-DD (local, inclusive) or RFC 3339
        #[arg(long)]
        end: String,

        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Print archived vehicle positions as JSON lines
    Vehicles {
        /// Archive root: a directory or s3://bucket/prefix
        #[arg(short, long)]
        input: ArchiveUri,

        /// Range start: YYYY-MM-DD (local) or RFC 3339
        #[arg(long)]
        start: String,

        /// Range end: YYYY-MM-DD (local, inclusive) or RFC 3339
        #[arg(long)]
        end: String,

        /// Keep records whose field equals the value, e.g. route_id=97
        #[arg(short, long = "filter", value_name = "FIELD=VALUE")]
        filters: Vec<String>,

        #[arg(short, long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_tracing()?;

    let cli = Cli::parse();

    match &cli.command {
        Commands::Version => {
            println!("actransit_rt {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Fetch { kind, output } => {
            let client = client_from_config(&api_config(&cli)?)?;
            let fetched = client.fetch(*kind).await?;
            info!(kind = %kind, entity_count = fetched.feed.entity.len(), "Feed fetched");
            match output {
                Some(uri) => {
                    let path = uri.base_dir();
                    if path.as_os_str().is_empty() {
                        bail!("--output needs a file name or object key");
                    }
                    let storage = open_archive(uri).await;
                    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                        storage.create_dir_all(parent).await?;
                    }
                    storage
                        .write(&path, fetched.bytes)
                        .await
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), "Raw feed written");
                }
                None => println!("{:#?}", fetched.feed),
            }
        }
        Commands::Snapshot {
            kind,
            output,
            dry_run,
            on_existing,
        } => {
            let agency = agency_config(&cli, on_existing.as_deref())?;
            let client = client_from_config(&api_config(&cli)?)?;
            let storage = open_archive(output).await;
            let archiver = Archiver::new(client, storage, output.base_dir())
                .with_existing_policy(agency.on_existing);
            archiver.validate().await?;

            let results = match kind {
                Some(kind) => vec![(*kind, archiver.snapshot_one(*kind, *dry_run).await)],
                None => archiver.snapshot_all(*dry_run).await,
            };

            let mut failed = 0;
            for (kind, result) in &results {
                match result {
                    Ok(report) => println!("{}", snapshot_line(report)),
                    Err(e) => {
                        failed += 1;
                        error!(kind = %kind, error = %e, "Snapshot failed");
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {} snapshots failed", results.len());
            }
        }
        Commands::Feeds {
            kind,
            input,
            start,
            end,
            limit,
        } => {
            let agency = agency_config(&cli, None)?;
            let start = parse_instant(start, agency.timezone, Bound::Start)?;
            let end = parse_instant(end, agency.timezone, Bound::End)?;
            let retriever =
                Retriever::new(open_archive(input).await, input.base_dir(), agency.timezone);

            let mut cursor = retriever.feeds(*kind, &start, &end, *limit);
            let mut out = std::io::stdout().lock();
            while let Some(feed) = cursor.next().await {
                match feed {
                    Ok(feed) => write_json_line(&mut out, &FeedSummary::from_feed(&feed))?,
                    Err(e) => error!(error = %e, "Partition could not be listed"),
                }
            }
            out.flush()?;
            info!(stats = ?cursor.stats(), "Retrieval finished");
        }
        Commands::Vehicles {
            input,
            start,
            end,
            filters,
            limit,
        } => {
            let agency = agency_config(&cli, None)?;
            let filter = parse_filters(filters)?;
            let start = parse_instant(start, agency.timezone, Bound::Start)?;
            let end = parse_instant(end, agency.timezone, Bound::End)?;
            let retriever =
                Retriever::new(open_archive(input).await, input.base_dir(), agency.timezone);

            let mut cursor = retriever.vehicle_positions(&start, &end, Some(filter), *limit);
            let mut out = std::io::stdout().lock();
            while let Some(record) = cursor.next().await {
                match record {
                    Ok(record) => write_json_line(&mut out, &record)?,
                    Err(e) => error!(error = %e, "Partition could not be listed"),
                }
            }
            out.flush()?;
            info!(stats = ?cursor.stats(), "Retrieval finished");
        }
    }

    Ok(())
}

/// Colored stderr output plus a daily-rolling JSON log file. The returned
/// guard flushes the file writer when dropped.
fn init_tracing() -> Result<WorkerGuard> {
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/actransit_rt.log".to_string());
    let log_path = Path::new(&log_file_path);
    let log_dir = log_path.parent().unwrap_or(Path::new("logs"));
    let log_file_name = log_path
        .file_name()
        .unwrap_or(OsStr::new("actransit_rt.log"));

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, log_file_name));

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(file_writer)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    Ok(guard)
}

/// Environment config with CLI flags layered on top.
fn api_config(cli: &Cli) -> Result<ApiConfig> {
    let config = ApiConfig::from_lookup(|key| match key {
        ENV_API_TOKEN if cli.api_token.is_some() => cli.api_token.clone(),
        ENV_API_BASE_URL if cli.base_url.is_some() => cli.base_url.clone(),
        _ => std::env::var(key).ok(),
    })?;
    Ok(config)
}

fn agency_config(cli: &Cli, on_existing: Option<&str>) -> Result<AgencyConfig> {
    let config = AgencyConfig::from_lookup(|key| match key {
        ENV_TIMEZONE if cli.timezone.is_some() => cli.timezone.clone(),
        ENV_ON_EXISTING if on_existing.is_some() => on_existing.map(str::to_string),
        _ => std::env::var(key).ok(),
    })?;
    Ok(config)
}

async fn open_archive(uri: &ArchiveUri) -> Arc<dyn Storage> {
    match uri {
        ArchiveUri::Local(_) => Arc::new(LocalStorage::new()),
        ArchiveUri::S3 { bucket, .. } => {
            info!(bucket = %bucket, "Using S3 archive");
            Arc::new(S3Storage::from_env(bucket.clone()).await)
        }
    }
}
