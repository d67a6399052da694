//! Historical aggregation over a time range.
//!
//! `AggregationController::run` walks the partitions of the range in order,
//! downloads and decodes every blob under each present minute, reconstructs
//! one-second frames over the whole accumulated record list, and folds the
//! per-frame maxima into totals, peaks, and a chart series.

use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{AggregationError, AggregationResult};
use crate::frame::{reconstruct, DetectionRecord, Frame};
use crate::ingest::decode_blob;
use crate::resolve::{BlobRangeResolver, PartitionKey, PartitionProbe, TimeRange};
use crate::storage::BlobStore;
use crate::zones::Aggregator;

pub const DEFAULT_CONTAINER: &str = "detectoroutput";

/// Earliest capture the dashboards ever accepted: 2020-06-27T00:00:00Z.
pub fn default_earliest() -> DateTime<Utc> {
    Utc.timestamp_opt(1_593_216_000, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn check(&self) -> AggregationResult<()> {
        if self.is_cancelled() {
            return Err(AggregationError::Cancelled);
        }
        Ok(())
    }
}

/// Chart series, one entry per frame in frame order.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Metrics {
    pub times: Vec<i64>,
    pub collisions: Vec<usize>,
    pub detections: Vec<usize>,
}

/// A partition that contributed nothing because it could not be read.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PartitionFailure {
    pub partition: String,
    pub reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AggregateReport {
    /// Sum over frames of each frame's peak collision count.
    pub total_collisions: usize,
    /// Sum over frames of each frame's peak detection count.
    pub total_detections: usize,
    pub max_collisions_per_second: usize,
    pub max_detections_per_second: usize,
    pub metrics: Metrics,
    pub frames: usize,
    pub partitions_read: usize,
    pub skipped_partitions: Vec<PartitionFailure>,
    pub skipped_records: usize,
}

impl AggregateReport {
    pub fn from_frames(frames: &[Frame]) -> Self {
        let mut report = Self {
            frames: frames.len(),
            ..Self::default()
        };
        for frame in frames {
            report.total_collisions += frame.max_collisions;
            report.total_detections += frame.max_detections;
            report.max_collisions_per_second =
                report.max_collisions_per_second.max(frame.max_collisions);
            report.max_detections_per_second =
                report.max_detections_per_second.max(frame.max_detections);
            report.metrics.times.push(frame.time);
            report.metrics.collisions.push(frame.max_collisions);
            report.metrics.detections.push(frame.max_detections);
        }
        report
    }
}

pub struct AggregationController {
    store: Arc<dyn BlobStore>,
    container: String,
    earliest: DateTime<Utc>,
}

impl AggregationController {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            container: DEFAULT_CONTAINER.to_string(),
            earliest: default_earliest(),
        }
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.container = container.into();
        self
    }

    pub fn with_earliest(mut self, earliest: DateTime<Utc>) -> Self {
        self.earliest = earliest;
        self
    }

    /// Runs one aggregation.
    ///
    /// Fails only with `InvalidRange` (before any I/O) or `Cancelled`. Once
    /// the token trips, nothing more is merged and no report is produced.
    pub async fn run(
        &self,
        range: &TimeRange,
        aggregator: &Aggregator,
        event_source_id: &str,
        cancel: &CancelToken,
    ) -> AggregationResult<AggregateReport> {
        range.check_bounds(Utc::now(), self.earliest)?;

        let resolver = BlobRangeResolver::new(event_source_id);
        let keys = resolver.resolve(range);
        log::info!(
            "aggregating {} minute partitions of {} from {} to {}",
            keys.len(),
            event_source_id,
            range.start().to_rfc3339(),
            range.end().to_rfc3339()
        );

        let store: &dyn BlobStore = self.store.as_ref();
        let mut probe = PartitionProbe::new(store, &self.container);
        let mut records: Vec<DetectionRecord> = Vec::new();
        let mut failures = Vec::new();
        let mut skipped_records = 0;
        let mut partitions_read = 0;

        for key in &keys {
            cancel.check()?;
            let exists = match probe.hour_exists(key).await {
                Ok(exists) => exists,
                Err(e) => {
                    log::warn!("partition {} existence check failed: {}", key.hour, e);
                    failures.push(PartitionFailure {
                        partition: key.minute.clone(),
                        reason: format!("{:#}", e),
                    });
                    continue;
                }
            };
            if !exists {
                continue;
            }

            match self.fetch_partition(store, key).await {
                Ok((partition_records, skipped)) => {
                    // a cancel that arrived mid-fetch must not leak this partition
                    cancel.check()?;
                    partitions_read += 1;
                    skipped_records += skipped;
                    records.extend(partition_records);
                }
                Err(e) => {
                    log::warn!("{}", e);
                    if let AggregationError::PartitionFetch { partition, source } = e {
                        failures.push(PartitionFailure {
                            partition,
                            reason: format!("{:#}", source),
                        });
                    }
                }
            }
        }
        cancel.check()?;

        let frames = reconstruct(records, &aggregator.zones);
        let mut report = AggregateReport::from_frames(&frames);
        report.partitions_read = partitions_read;
        report.skipped_partitions = failures;
        report.skipped_records = skipped_records;
        log::info!(
            "aggregated {} frames: total detections {}, total collisions {}, peak {}/{} per second",
            report.frames,
            report.total_detections,
            report.total_collisions,
            report.max_detections_per_second,
            report.max_collisions_per_second
        );
        Ok(report)
    }

    /// Every blob under the minute path, decoded. All-or-nothing per partition.
    async fn fetch_partition(
        &self,
        store: &dyn BlobStore,
        key: &PartitionKey,
    ) -> AggregationResult<(Vec<DetectionRecord>, usize)> {
        let fetch_err = |source: anyhow::Error| AggregationError::PartitionFetch {
            partition: key.minute.clone(),
            source,
        };

        let mut records = Vec::new();
        let mut skipped = 0;
        let mut blobs = store.list_by_prefix(&self.container, &key.minute);
        while let Some(blob) = blobs.next().await {
            let blob = blob.map_err(fetch_err)?;
            let content = store
                .download(&self.container, &blob.name)
                .await
                .map_err(fetch_err)?;
            let decoded = decode_blob(&content);
            log::debug!(
                "blob {} ({} bytes): {} records, {} skipped",
                blob.name,
                blob.size,
                decoded.records.len(),
                decoded.skipped
            );
            skipped += decoded.skipped;
            records.extend(decoded.records);
        }
        Ok((records, skipped))
    }
}

/// One-shot convenience over `AggregationController` with default settings.
pub async fn run_aggregation(
    store: Arc<dyn BlobStore>,
    range: &TimeRange,
    aggregator: &Aggregator,
    event_source_id: &str,
    cancel: &CancelToken,
) -> AggregationResult<AggregateReport> {
    AggregationController::new(store)
        .run(range, aggregator, event_source_id, cancel)
        .await
}
