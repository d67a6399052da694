use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::stream::BoxStream;

use zonecount::frame::RawRecord;
use zonecount::ingest::encode_line;
use zonecount::storage::BlobDescriptor;
use zonecount::{
    run_aggregation, AggregationController, AggregationError, Aggregator, BlobStore, CancelToken,
    Detection, FilesystemBlobStore, InMemoryBlobStore, Point, SqliteBlobStore, TimeRange, Zone,
};

const CONTAINER: &str = "detectoroutput";
const SOURCE: &str = "people-counter";

fn at(h: u32, m: u32, s: u32, ms: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 7, 1, h, m, s).unwrap() + Duration::milliseconds(i64::from(ms))
}

fn window() -> TimeRange {
    TimeRange::new(at(9, 58, 0, 0), at(10, 1, 0, 0)).unwrap()
}

fn left_half() -> Aggregator {
    Aggregator {
        lines: Vec::new(),
        zones: vec![Zone {
            name: "queue".to_string(),
            polygon: vec![
                Point::new(0.0, 0.0),
                Point::new(0.5, 0.0),
                Point::new(0.5, 1.0),
                Point::new(0.0, 1.0),
            ],
            threshold: 10.0,
        }],
    }
}

fn inside() -> Detection {
    Detection::with_bbox([0.1, 0.1, 0.2, 0.2])
}

fn outside() -> Detection {
    Detection::with_bbox([0.7, 0.7, 0.8, 0.8])
}

fn line(t: DateTime<Utc>, detections: Vec<Detection>) -> String {
    encode_line(&RawRecord {
        image_name: format!("{}Z", t.format("%Y-%m-%dT%H:%M:%S%.6f")),
        detections,
    })
    .unwrap()
}

fn minute_path(h: u32, m: u32) -> String {
    format!("{}/00/2020/07/01/{:02}/{:02}", SOURCE, h, m)
}

/// Three minutes straddling 10:00, one blob per minute plus one garbage line.
fn fixture_blobs() -> Vec<(String, String)> {
    vec![
        (
            format!("{}/0.json", minute_path(9, 58)),
            [
                line(at(9, 58, 0, 100), vec![inside(), outside()]),
                "not an envelope".to_string(),
                line(at(9, 58, 0, 600), vec![inside(), inside(), outside()]),
            ]
            .join("\r\n"),
        ),
        (
            format!("{}/0.json", minute_path(9, 59)),
            line(at(9, 59, 30, 0), vec![inside()]),
        ),
        (
            format!("{}/3.json", minute_path(10, 0)),
            line(
                at(10, 0, 10, 0),
                vec![outside(), outside(), outside(), outside()],
            ),
        ),
    ]
}

fn seeded_store() -> InMemoryBlobStore {
    let store = InMemoryBlobStore::new();
    for (path, body) in fixture_blobs() {
        store.put(CONTAINER, &path, body).unwrap();
    }
    store
}

/// Records every existence probe, optionally failing or cancelling on download.
struct InstrumentedStore {
    inner: InMemoryBlobStore,
    exists_calls: Mutex<Vec<String>>,
    fail_under: Option<String>,
    cancel_under: Option<(String, CancelToken)>,
}

impl InstrumentedStore {
    fn new(inner: InMemoryBlobStore) -> Self {
        Self {
            inner,
            exists_calls: Mutex::new(Vec::new()),
            fail_under: None,
            cancel_under: None,
        }
    }

    fn exists_calls(&self) -> Vec<String> {
        self.exists_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlobStore for InstrumentedStore {
    async fn exists(&self, container: &str, path: &str) -> Result<bool> {
        self.exists_calls.lock().unwrap().push(path.to_string());
        self.inner.exists(container, path).await
    }

    fn list_by_prefix<'a>(
        &'a self,
        container: &'a str,
        prefix: &'a str,
    ) -> BoxStream<'a, Result<BlobDescriptor>> {
        self.inner.list_by_prefix(container, prefix)
    }

    async fn download(&self, container: &str, path: &str) -> Result<Vec<u8>> {
        if let Some(prefix) = &self.fail_under {
            if path.starts_with(prefix.as_str()) {
                return Err(anyhow!("connection reset"));
            }
        }
        if let Some((prefix, token)) = &self.cancel_under {
            if path.starts_with(prefix.as_str()) {
                token.cancel();
            }
        }
        self.inner.download(container, path).await
    }
}

#[tokio::test]
async fn aggregates_window_across_hour_boundary() {
    let store = Arc::new(InstrumentedStore::new(seeded_store()));
    let controller = AggregationController::new(store.clone());

    let report = controller
        .run(&window(), &left_half(), SOURCE, &CancelToken::new())
        .await
        .expect("aggregation");

    assert_eq!(report.frames, 3);
    assert_eq!(report.total_detections, 3 + 1 + 4);
    assert_eq!(report.total_collisions, 2 + 1);
    assert_eq!(report.max_detections_per_second, 4);
    assert_eq!(report.max_collisions_per_second, 2);
    assert_eq!(report.metrics.detections, vec![3, 1, 4]);
    assert_eq!(report.metrics.collisions, vec![2, 1, 0]);
    assert_eq!(
        report.metrics.times,
        vec![
            at(9, 58, 0, 600).timestamp_millis(),
            at(9, 59, 30, 0).timestamp_millis(),
            at(10, 0, 10, 0).timestamp_millis(),
        ]
    );
    assert_eq!(report.partitions_read, 3);
    assert_eq!(report.skipped_records, 1);
    assert!(report.skipped_partitions.is_empty());

    assert_eq!(
        store.exists_calls(),
        vec![
            format!("{}/00/2020/07/01/09", SOURCE),
            format!("{}/00/2020/07/01/10", SOURCE),
        ]
    );
}

#[tokio::test]
async fn missing_hour_is_skipped_without_listing() {
    let inner = InMemoryBlobStore::new();
    for (path, body) in fixture_blobs().into_iter().take(2) {
        inner.put(CONTAINER, &path, body).unwrap();
    }
    let store = Arc::new(InstrumentedStore::new(inner));

    let report = run_aggregation(store.clone(), &window(), &left_half(), SOURCE, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(report.frames, 2);
    assert_eq!(report.partitions_read, 2);
    assert_eq!(store.exists_calls().len(), 2);
}

#[tokio::test]
async fn failed_partition_contributes_nothing() {
    let mut store = InstrumentedStore::new(seeded_store());
    store.fail_under = Some(minute_path(9, 59));
    let store = Arc::new(store);

    let report = run_aggregation(store, &window(), &left_half(), SOURCE, &CancelToken::new())
        .await
        .expect("a failed partition is not fatal");

    assert_eq!(report.frames, 2);
    assert_eq!(report.total_detections, 3 + 4);
    assert_eq!(report.total_collisions, 2);
    assert_eq!(report.partitions_read, 2);
    assert_eq!(report.skipped_partitions.len(), 1);
    assert_eq!(report.skipped_partitions[0].partition, minute_path(9, 59));
    assert!(report.skipped_partitions[0]
        .reason
        .contains("connection reset"));
}

#[tokio::test]
async fn cancellation_mid_run_yields_no_report() {
    let cancel = CancelToken::new();
    let mut store = InstrumentedStore::new(seeded_store());
    store.cancel_under = Some((minute_path(9, 59), cancel.clone()));
    let store = Arc::new(store);

    let result = run_aggregation(store.clone(), &window(), &left_half(), SOURCE, &cancel).await;

    assert!(matches!(result, Err(AggregationError::Cancelled)));
    // hour 10 is never reached
    assert_eq!(
        store.exists_calls(),
        vec![format!("{}/00/2020/07/01/09", SOURCE)]
    );
}

#[tokio::test]
async fn cancelled_before_start_touches_nothing() {
    let cancel = CancelToken::new();
    cancel.cancel();
    let store = Arc::new(InstrumentedStore::new(seeded_store()));

    let result = run_aggregation(store.clone(), &window(), &left_half(), SOURCE, &cancel).await;

    assert!(matches!(result, Err(AggregationError::Cancelled)));
    assert!(store.exists_calls().is_empty());
}

#[tokio::test]
async fn invalid_ranges_are_rejected_before_io() {
    assert!(matches!(
        TimeRange::new(at(10, 0, 0, 0), at(9, 0, 0, 0)),
        Err(AggregationError::InvalidRange(_))
    ));
    assert!(matches!(
        TimeRange::new(at(10, 0, 0, 0), at(10, 0, 0, 0)),
        Err(AggregationError::InvalidRange(_))
    ));

    let store = Arc::new(InstrumentedStore::new(seeded_store()));
    let controller = AggregationController::new(store.clone());

    let future_end = Utc::now() + Duration::hours(1);
    let future = TimeRange::ending_at(future_end, 15).unwrap();
    let result = controller
        .run(&future, &left_half(), SOURCE, &CancelToken::new())
        .await;
    assert!(matches!(result, Err(AggregationError::InvalidRange(_))));

    let too_early = TimeRange::ending_at(Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap(), 15)
        .unwrap();
    let result = controller
        .run(&too_early, &left_half(), SOURCE, &CancelToken::new())
        .await;
    assert!(matches!(result, Err(AggregationError::InvalidRange(_))));

    assert!(store.exists_calls().is_empty());
}

#[tokio::test]
async fn empty_window_reports_zeros() {
    let store = Arc::new(InMemoryBlobStore::new());
    let report = run_aggregation(store, &window(), &left_half(), SOURCE, &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(report.frames, 0);
    assert_eq!(report.total_detections, 0);
    assert_eq!(report.max_collisions_per_second, 0);
    assert!(report.metrics.times.is_empty());
}

#[tokio::test]
async fn reads_blobs_mirrored_to_disk() {
    let dir = tempfile::tempdir().expect("temp dir");
    for (path, body) in fixture_blobs() {
        let full = dir.path().join("archive").join(&path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, body).unwrap();
    }
    let store = Arc::new(FilesystemBlobStore::new(dir.path()));

    let report = AggregationController::new(store)
        .with_container("archive")
        .run(&window(), &left_half(), SOURCE, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(report.frames, 3);
    assert_eq!(report.total_detections, 8);
    assert_eq!(report.total_collisions, 3);
}

#[tokio::test]
async fn partial_trailing_minute_is_not_read() {
    let store = Arc::new(InstrumentedStore::new(seeded_store()));
    // 10:00:30 truncates to 10:00, so the 10:00 partition is outside the walk
    let range = TimeRange::new(at(9, 58, 20, 0), at(10, 0, 30, 0)).unwrap();

    let report = run_aggregation(store.clone(), &range, &left_half(), SOURCE, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(report.frames, 2);
    assert_eq!(report.partitions_read, 2);
    assert_eq!(report.total_detections, 3 + 1);
    assert_eq!(report.max_detections_per_second, 3);
    assert_eq!(
        store.exists_calls(),
        vec![format!("{}/00/2020/07/01/09", SOURCE)]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reads_blobs_from_sqlite() {
    let dir = tempfile::tempdir().expect("temp dir");
    let db = dir.path().join("blobs.db");
    let store = SqliteBlobStore::open(db.to_str().unwrap()).unwrap();
    for (path, body) in fixture_blobs() {
        store.put(CONTAINER, &path, body.as_bytes()).unwrap();
    }

    let report = run_aggregation(Arc::new(store), &window(), &left_half(), SOURCE, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(report.frames, 3);
    assert_eq!(report.total_detections, 8);
    assert_eq!(report.total_collisions, 3);
    assert_eq!(report.skipped_records, 1);
}
