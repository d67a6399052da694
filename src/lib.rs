//! Zone collision counting for people-counter cameras.
//!
//! Cameras report object detections per captured image. This crate answers two
//! questions about them:
//!
//! - **Live**: which detections in this image overlap a configured zone?
//! - **Historical**: over a time window, how many people were seen and how many
//!   of them stood in a zone, second by second?
//!
//! # Module Structure
//!
//! - `geometry`: points, polygons, and the bbox/zone intersection test
//! - `zones`: zone sets (`Aggregator`) and per-image classification
//! - `frame`: one-second frame reconstruction from timestamped records
//! - `ingest`: the line-oriented base64 blob format written by the capture pipeline
//! - `storage`: blob store backends (memory, filesystem, sqlite)
//! - `resolve`: time ranges and their hour/minute partition paths
//! - `aggregate`: the historical pipeline and its report
//! - `live`, `transport`: the live path and its event sources (MQTT, channel)
//! - `config`: file and environment configuration for the binaries

pub mod aggregate;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod live;
pub mod resolve;
pub mod storage;
pub mod transport;
pub mod zones;

pub use aggregate::{
    run_aggregation, AggregateReport, AggregationController, CancelToken, Metrics,
    PartitionFailure,
};
pub use detect::{Detection, Geometry, Rectangle};
pub use error::{AggregationError, AggregationResult};
pub use frame::{reconstruct, DetectionRecord, Frame, FrameReconstructor};
pub use geometry::{bbox_intersects_any_zone, point_in_polygon, Point};
pub use live::{classify_live_frame, pump_live_events, LiveFrame};
pub use resolve::{BlobRangeResolver, PartitionKey, TimeRange};
pub use storage::{BlobStore, FilesystemBlobStore, InMemoryBlobStore, SqliteBlobStore};
pub use transport::{ChannelEventSource, EventSource};
pub use zones::{calculate_collisions, Aggregator, Classification, Zone};
