//! Point and box containment tests against zone polygons.
//!
//! All coordinates are normalized to the image (0..1, top-left origin). A box
//! collides with a zone when any of its four corners lies inside the zone's
//! polygon under the even-odd ray-casting rule.

use serde::{Deserialize, Serialize};

use crate::detect::bbox_corners;
use crate::zones::Zone;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "WirePoint")]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Polygons are stored either as `[x, y]` pairs or `{x, y}` objects.
#[derive(Deserialize)]
#[serde(untagged)]
enum WirePoint {
    Pair([f64; 2]),
    Object { x: f64, y: f64 },
}

impl From<WirePoint> for Point {
    fn from(wire: WirePoint) -> Self {
        match wire {
            WirePoint::Pair([x, y]) => Point::new(x, y),
            WirePoint::Object { x, y } => Point::new(x, y),
        }
    }
}

/// Even-odd ray casting. Empty polygons contain nothing.
pub fn point_in_polygon(point: Point, polygon: &[Point]) -> bool {
    let mut inside = false;
    let Some(last) = polygon.len().checked_sub(1) else {
        return false;
    };
    let mut j = last;
    for (i, vi) in polygon.iter().enumerate() {
        let vj = polygon[j];
        let crosses = (vi.y > point.y) != (vj.y > point.y)
            && point.x < (vj.x - vi.x) * (point.y - vi.y) / (vj.y - vi.y) + vi.x;
        if crosses {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// True when any corner lies inside the polygon.
pub fn corners_in_polygon(corners: &[Point; 4], polygon: &[Point]) -> bool {
    corners
        .iter()
        .any(|corner| point_in_polygon(*corner, polygon))
}

pub fn corners_intersect_any_zone(corners: &[Point; 4], zones: &[Zone]) -> bool {
    zones
        .iter()
        .any(|zone| corners_in_polygon(corners, &zone.polygon))
}

/// `bbox` is `[x1, y1, x2, y2]`.
pub fn bbox_intersects_any_zone(bbox: &[f64; 4], zones: &[Zone]) -> bool {
    corners_intersect_any_zone(&bbox_corners(bbox), zones)
}
