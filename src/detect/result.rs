use serde::{Deserialize, Serialize};

use crate::geometry::Point;

/// Axis-aligned box in `{left, top, width, height}` form (normalized 0..1).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rectangle {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Rectangle {
    /// Corners in the same order as a `bbox` expands to.
    pub fn corners(&self) -> [Point; 4] {
        let right = self.left + self.width;
        let bottom = self.top + self.height;
        [
            Point::new(self.left, self.top),
            Point::new(right, self.top),
            Point::new(self.left, bottom),
            Point::new(right, bottom),
        ]
    }
}

/// Where a detection sits in the frame.
///
/// Producers emit either a `bbox` (`[x1, y1, x2, y2]`, top-left origin) or a
/// `rectangle`; some emit neither (label-only detections).
#[derive(Clone, Debug, PartialEq)]
pub enum Geometry {
    BBox([f64; 4]),
    Rectangle(Rectangle),
    None,
}

impl Geometry {
    /// Four-corner representation used by the zone tests.
    pub fn corners(&self) -> Option<[Point; 4]> {
        match self {
            Geometry::BBox(b) => Some(bbox_corners(b)),
            Geometry::Rectangle(r) => Some(r.corners()),
            Geometry::None => None,
        }
    }
}

pub fn bbox_corners(bbox: &[f64; 4]) -> [Point; 4] {
    let [x1, y1, x2, y2] = *bbox;
    [
        Point::new(x1, y1),
        Point::new(x2, y1),
        Point::new(x1, y2),
        Point::new(x2, y2),
    ]
}

/// One recognized object in one captured image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireDetection", into = "WireDetection")]
pub struct Detection {
    pub geometry: Geometry,
    pub label: Option<String>,
    pub confidence: Option<f64>,
    pub class: Option<i64>,
    /// Set by live classification; `None` until a zone test ran.
    pub collides: Option<bool>,
}

impl Detection {
    pub fn with_bbox(bbox: [f64; 4]) -> Self {
        Self::from_geometry(Geometry::BBox(bbox))
    }

    pub fn with_rectangle(rectangle: Rectangle) -> Self {
        Self::from_geometry(Geometry::Rectangle(rectangle))
    }

    pub fn without_geometry() -> Self {
        Self::from_geometry(Geometry::None)
    }

    fn from_geometry(geometry: Geometry) -> Self {
        Self {
            geometry,
            label: None,
            confidence: None,
            class: None,
            collides: None,
        }
    }

    pub fn bbox(&self) -> Option<&[f64; 4]> {
        match &self.geometry {
            Geometry::BBox(b) => Some(b),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct WireDetection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bbox: Option<[f64; 4]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rectangle: Option<Rectangle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    class: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    collides: Option<bool>,
}

impl From<WireDetection> for Detection {
    fn from(wire: WireDetection) -> Self {
        // bbox wins when a producer sends both forms
        let geometry = match (wire.bbox, wire.rectangle) {
            (Some(b), _) => Geometry::BBox(b),
            (None, Some(r)) => Geometry::Rectangle(r),
            (None, None) => Geometry::None,
        };
        Self {
            geometry,
            label: wire.label,
            confidence: wire.confidence,
            class: wire.class,
            collides: wire.collides,
        }
    }
}

impl From<Detection> for WireDetection {
    fn from(det: Detection) -> Self {
        let (bbox, rectangle) = match det.geometry {
            Geometry::BBox(b) => (Some(b), None),
            Geometry::Rectangle(r) => (None, Some(r)),
            Geometry::None => (None, None),
        };
        Self {
            bbox,
            rectangle,
            label: det.label,
            confidence: det.confidence,
            class: det.class,
            collides: det.collides,
        }
    }
}
