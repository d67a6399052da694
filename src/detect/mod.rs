mod result;

pub use result::{bbox_corners, Detection, Geometry, Rectangle};
