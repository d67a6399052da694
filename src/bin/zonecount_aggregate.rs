//! zonecount_aggregate - Aggregate stored detections over a time window.
//!
//! Reads the minute partitions of one event source between `--start` and
//! `--end`, reconstructs one-second frames, and prints totals and peaks for
//! the configured zones. Ctrl-C cancels the run between partitions.

use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;

use zonecount::config::{parse_instant, StorageKind, ZonecountConfig};
use zonecount::{AggregateReport, AggregationController, AggregationError, CancelToken, TimeRange};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Aggregate zone collisions over a time window"
)]
struct Args {
    /// End of the window (RFC 3339 or YYYY-MM-DD). Defaults to now.
    #[arg(long)]
    end: Option<String>,

    /// Start of the window. Defaults to `--minutes` before `--end`.
    #[arg(long, conflicts_with = "minutes")]
    start: Option<String>,

    /// Window length in minutes when `--start` is not given.
    #[arg(long)]
    minutes: Option<u32>,

    /// Event Hubs connection string or bare event-source id.
    #[arg(long, env = "ZONECOUNT_EVENT_HUB")]
    event_hub: Option<String>,

    /// Aggregator file (JSON or base64 JSON).
    #[arg(long, value_name = "PATH")]
    aggregator: Option<PathBuf>,

    /// Blob store location; overrides the configured storage path.
    #[arg(long, value_name = "PATH")]
    store: Option<String>,

    /// Blob store backend: filesystem or sqlite.
    #[arg(long, value_name = "KIND")]
    store_kind: Option<StorageKind>,

    /// Print the full report as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = ZonecountConfig::load()?;
    if let Some(path) = args.aggregator {
        cfg.aggregator_path = Some(path);
    }
    if let Some(path) = args.store {
        cfg.storage.path = path;
    }
    if let Some(kind) = args.store_kind {
        cfg.storage.kind = kind;
    }
    if let Some(hub) = args.event_hub.as_deref() {
        cfg.event_source_id = zonecount::resolve::parse_event_source_id(hub);
    }
    let event_source_id = cfg
        .event_source_id
        .clone()
        .ok_or_else(|| anyhow!("no event source: set --event-hub or ZONECOUNT_EVENT_HUB"))?;

    let end = match args.end.as_deref() {
        Some(raw) => parse_instant(raw)?,
        None => Utc::now(),
    };
    let range = match args.start.as_deref() {
        Some(raw) => TimeRange::new(parse_instant(raw)?, end)?,
        None => TimeRange::ending_at(end, args.minutes.unwrap_or(cfg.window_minutes))?,
    };

    let aggregator = cfg.aggregator()?;
    let store = cfg.storage.open()?;
    log::info!(
        "Aggregating {} ({} zones) from {:?} store at {}",
        event_source_id,
        aggregator.zones.len(),
        cfg.storage.kind,
        cfg.storage.path
    );

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        log::warn!("Interrupt received, cancelling aggregation");
        handler_token.cancel();
    })?;

    let controller = AggregationController::new(store)
        .with_container(cfg.container.clone())
        .with_earliest(cfg.earliest);
    let report = match controller
        .run(&range, &aggregator, &event_source_id, &cancel)
        .await
    {
        Ok(report) => report,
        Err(AggregationError::Cancelled) => {
            log::warn!("Aggregation cancelled; no report produced");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&range, &report);
    }
    Ok(())
}

fn print_summary(range: &TimeRange, report: &AggregateReport) {
    println!(
        "Window: {} .. {}",
        range.start().to_rfc3339(),
        range.end().to_rfc3339()
    );
    println!("Frames: {}", report.frames);
    println!("Total detections: {}", report.total_detections);
    println!("Total collisions: {}", report.total_collisions);
    println!(
        "Max detections per second: {}",
        report.max_detections_per_second
    );
    println!(
        "Max collisions per second: {}",
        report.max_collisions_per_second
    );
    println!("Partitions read: {}", report.partitions_read);
    if report.skipped_records > 0 {
        println!("Skipped records: {}", report.skipped_records);
    }
    for failure in &report.skipped_partitions {
        println!("Skipped partition {}: {}", failure.partition, failure.reason);
    }
}
