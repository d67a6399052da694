//! Zone configuration and per-frame zone classification.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::detect::Detection;
use crate::geometry::{bbox_intersects_any_zone, Point};

const DEFAULT_ZONE_NAME: &str = "queue";
const DEFAULT_ZONE_THRESHOLD: f64 = 10.0;

/// Named region of interest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    /// Ordered vertices; empty means the zone matches nothing.
    #[serde(default)]
    pub polygon: Vec<Point>,
    /// Occupancy threshold. Carried for the UI, not used in counting.
    #[serde(default)]
    pub threshold: f64,
}

/// Zone set plus counting lines.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aggregator {
    /// Counting lines are passed through untouched.
    #[serde(default)]
    pub lines: Vec<serde_json::Value>,
    #[serde(default)]
    pub zones: Vec<Zone>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self {
            lines: Vec::new(),
            zones: vec![Zone {
                name: DEFAULT_ZONE_NAME.to_string(),
                polygon: Vec::new(),
                threshold: DEFAULT_ZONE_THRESHOLD,
            }],
        }
    }
}

impl Aggregator {
    /// Base64 of the JSON form, the way dashboards persist it.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(BASE64.encode(json))
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let json = BASE64
            .decode(encoded.trim())
            .map_err(|e| anyhow!("aggregator is not valid base64: {}", e))?;
        serde_json::from_slice(&json).context("aggregator JSON")
    }

    /// Reads plain JSON, falling back to the base64 form.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read aggregator {}: {}", path.display(), e))?;
        if raw.trim_start().starts_with('{') {
            return serde_json::from_str(&raw)
                .map_err(|e| anyhow!("invalid aggregator {}: {}", path.display(), e));
        }
        Self::decode(&raw)
    }
}

/// Decorated detections of one live frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Classification {
    pub detections: Vec<Detection>,
    pub collisions: usize,
    pub detection_count: usize,
}

/// Live-frame classification.
///
/// Only `bbox` detections are zone tested and get `collides` set. Rectangle
/// and geometry-less detections are passed through and still counted in
/// `detection_count`.
pub fn classify(detections: &[Detection], zones: &[Zone]) -> Classification {
    let mut collisions = 0;
    let decorated = detections
        .iter()
        .cloned()
        .map(|mut det| {
            if let Some(bbox) = det.bbox() {
                let hit = bbox_intersects_any_zone(bbox, zones);
                if hit {
                    collisions += 1;
                }
                det.collides = Some(hit);
            }
            det
        })
        .collect::<Vec<_>>();
    Classification {
        detection_count: decorated.len(),
        detections: decorated,
        collisions,
    }
}

/// Collision count used by historical aggregation; `bbox` detections only.
pub fn calculate_collisions(detections: &[Detection], zones: &[Zone]) -> usize {
    detections
        .iter()
        .filter_map(Detection::bbox)
        .filter(|bbox| bbox_intersects_any_zone(bbox, zones))
        .count()
}
