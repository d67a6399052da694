//! One-second frame reconstruction from raw detection records.
//!
//! Records are folded in input order; nothing is sorted. A record joins the
//! open frame when its timestamp is within `FRAME_WINDOW_MS` of the frame's
//! anchor, and every merge moves the anchor to the merged record. Gaps that
//! each stay under the window therefore chain into a single frame.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::detect::Detection;
use crate::zones::{calculate_collisions, Zone};

pub const FRAME_WINDOW_MS: i64 = 1000;

/// Decoded body of one historical envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub image_name: String,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

/// A raw record with its image timestamp resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionRecord {
    /// Epoch milliseconds.
    pub time: i64,
    pub detections: Vec<Detection>,
}

impl DetectionRecord {
    pub fn new(time: i64, detections: Vec<Detection>) -> Self {
        Self { time, detections }
    }
}

impl TryFrom<RawRecord> for DetectionRecord {
    type Error = String;

    fn try_from(raw: RawRecord) -> Result<Self, Self::Error> {
        let time = parse_image_time(&raw.image_name)
            .ok_or_else(|| format!("unparseable image_name '{}'", raw.image_name))?;
        Ok(Self::new(time, raw.detections))
    }
}

/// Epoch milliseconds from an image name such as `2020-06-27T10:15:02.513000Z`.
///
/// Accepts a directory prefix, a trailing `.jpg`, RFC 3339 offsets, and naive
/// timestamps (taken as UTC).
pub fn parse_image_time(image_name: &str) -> Option<i64> {
    let name = image_name.rsplit('/').next().unwrap_or(image_name).trim();
    let name = name
        .strip_suffix(".jpg")
        .or_else(|| name.strip_suffix(".jpeg"))
        .unwrap_or(name);

    if let Ok(ts) = DateTime::parse_from_rfc3339(name) {
        return Some(ts.timestamp_millis());
    }
    let naive = name.trim_end_matches('Z');
    NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|ts| Utc.from_utc_datetime(&ts).timestamp_millis())
}

/// One reconstructed second of detections.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Frame {
    /// Anchor timestamp: the last record merged into this frame.
    pub time: i64,
    pub detections: Vec<Detection>,
    pub max_detections: usize,
    pub max_collisions: usize,
}

impl Frame {
    fn open(record: DetectionRecord, collisions: usize) -> Self {
        Self {
            time: record.time,
            max_detections: record.detections.len(),
            max_collisions: collisions,
            detections: record.detections,
        }
    }

    fn merge(&mut self, record: DetectionRecord, collisions: usize) {
        self.max_detections = self.max_detections.max(record.detections.len());
        self.max_collisions = self.max_collisions.max(collisions);
        self.time = record.time;
        self.detections.extend(record.detections);
    }
}

pub struct FrameReconstructor<'z> {
    zones: &'z [Zone],
    closed: Vec<Frame>,
    open: Option<Frame>,
}

impl<'z> FrameReconstructor<'z> {
    pub fn new(zones: &'z [Zone]) -> Self {
        Self {
            zones,
            closed: Vec::new(),
            open: None,
        }
    }

    pub fn push(&mut self, record: DetectionRecord) {
        let collisions = calculate_collisions(&record.detections, self.zones);
        match self.open.as_mut() {
            Some(frame) if (record.time - frame.time).abs() < FRAME_WINDOW_MS => {
                frame.merge(record, collisions);
            }
            _ => {
                if let Some(done) = self.open.replace(Frame::open(record, collisions)) {
                    self.closed.push(done);
                }
            }
        }
    }

    /// Frames that no later record can change.
    pub fn closed(&self) -> &[Frame] {
        &self.closed
    }

    /// Closes the open frame, if any, and returns every frame in order.
    pub fn finish(mut self) -> Vec<Frame> {
        if let Some(done) = self.open.take() {
            self.closed.push(done);
        }
        self.closed
    }
}

pub fn reconstruct<I>(records: I, zones: &[Zone]) -> Vec<Frame>
where
    I: IntoIterator<Item = DetectionRecord>,
{
    let mut rec = FrameReconstructor::new(zones);
    for record in records {
        rec.push(record);
    }
    rec.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point;

    const T: i64 = 1_593_252_000_000;

    fn people(n: usize) -> Vec<Detection> {
        (0..n)
            .map(|_| Detection::with_bbox([0.1, 0.1, 0.2, 0.2]))
            .collect()
    }

    fn rec(time: i64, n: usize) -> DetectionRecord {
        DetectionRecord::new(time, people(n))
    }

    fn everything_zone() -> Vec<Zone> {
        vec![Zone {
            name: "all".to_string(),
            polygon: vec![
                Point::new(0.0, 0.0),
                Point::new(1.0, 0.0),
                Point::new(1.0, 1.0),
                Point::new(0.0, 1.0),
            ],
            threshold: 1.0,
        }]
    }

    #[test]
    fn anchor_drifts_with_each_merge() {
        // t+1300 is 900ms from the drifted anchor at t+400, so all three merge
        let frames = reconstruct(vec![rec(T, 1), rec(T + 400, 1), rec(T + 1300, 1)], &[]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].time, T + 1300);
        assert_eq!(frames[0].detections.len(), 3);
    }

    #[test]
    fn gap_of_a_full_second_splits() {
        let frames = reconstruct(vec![rec(T, 1), rec(T + 1000, 2), rec(T + 1999, 3)], &[]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].time, T);
        assert_eq!(frames[1].time, T + 1999);
        assert_eq!(frames[1].max_detections, 3);
    }

    #[test]
    fn sub_second_gaps_chain_without_bound() {
        let records = (0..120).map(|i| rec(T + i * 999, 1)).collect::<Vec<_>>();
        let frames = reconstruct(records, &[]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].detections.len(), 120);
        assert_eq!(frames[0].time, T + 119 * 999);
    }

    #[test]
    fn bucket_keeps_maxima_not_sums() {
        let zones = everything_zone();
        let frames = reconstruct(vec![rec(T, 2), rec(T + 200, 4), rec(T + 400, 1)], &zones);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].max_detections, 4);
        assert_eq!(frames[0].max_collisions, 4);
        assert_eq!(frames[0].detections.len(), 7);
    }

    #[test]
    fn single_record_yields_one_frame() {
        let frames = reconstruct(vec![rec(T, 5)], &[]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].max_detections, 5);
        assert!(reconstruct(Vec::new(), &[]).is_empty());
    }

    #[test]
    fn input_order_is_not_resorted() {
        let frames = reconstruct(vec![rec(T + 5000, 1), rec(T, 1), rec(T + 300, 1)], &[]);
        let times = frames.iter().map(|f| f.time).collect::<Vec<_>>();
        assert_eq!(times, vec![T + 5000, T + 300]);
    }

    #[test]
    fn backward_step_under_a_second_still_merges() {
        let frames = reconstruct(vec![rec(T + 500, 1), rec(T, 2)], &[]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].time, T);
    }

    #[test]
    fn reconstruction_is_deterministic() {
        let input = vec![rec(T, 1), rec(T + 2500, 3), rec(T + 2600, 0), rec(T + 9000, 2)];
        assert_eq!(reconstruct(input.clone(), &[]), reconstruct(input, &[]));
    }

    #[test]
    fn closed_frames_are_stable() {
        let mut r = FrameReconstructor::new(&[]);
        r.push(rec(T, 1));
        r.push(rec(T + 3000, 2));
        let closed = r.closed().to_vec();
        assert_eq!(closed.len(), 1);
        let all = r.finish();
        assert_eq!(all[0], closed[0]);
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn parses_image_names() {
        assert_eq!(
            parse_image_time("2020-06-27T10:00:00.250000Z"),
            Some(1_593_252_000_250)
        );
        assert_eq!(
            parse_image_time("cam1/2020-06-27/2020-06-27T10:00:00.250000Z.jpg"),
            Some(1_593_252_000_250)
        );
        assert_eq!(
            parse_image_time("2020-06-27T10:00:00.250"),
            Some(1_593_252_000_250)
        );
        assert_eq!(
            parse_image_time("2020-06-27T12:00:00+02:00"),
            Some(1_593_252_000_000)
        );
        assert_eq!(parse_image_time("frame-0001.jpg"), None);
    }

    #[test]
    fn raw_record_conversion_reports_bad_names() {
        let raw = RawRecord {
            image_name: "nope".to_string(),
            detections: Vec::new(),
        };
        assert!(DetectionRecord::try_from(raw).is_err());
    }
}
