//! Live detection events.
//!
//! Edge cameras publish `{cameraId, detections, image_name?}` per captured
//! image, optionally wrapped as `{"body": {...}}` by the relay. Each event is
//! classified on its own against the current aggregator; nothing is shared
//! between events besides the read-only zone set.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::detect::Detection;
use crate::transport::EventSource;
use crate::zones::{classify, Aggregator, Classification};

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct LiveEnvelope {
    #[serde(rename = "cameraId", deserialize_with = "camera_id")]
    pub camera_id: String,
    #[serde(default)]
    pub detections: Option<Vec<Detection>>,
    #[serde(default)]
    pub image_name: Option<String>,
}

fn camera_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }
    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

#[derive(Deserialize)]
struct Relayed {
    body: LiveEnvelope,
}

/// Parses a bare or relay-wrapped live event.
pub fn parse_live_event(payload: &[u8]) -> Result<LiveEnvelope> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| anyhow!("parse error: {}", e))?;
    if value.get("body").is_some() {
        let relayed: Relayed =
            serde_json::from_value(value).map_err(|e| anyhow!("relayed event: {}", e))?;
        return Ok(relayed.body);
    }
    serde_json::from_value(value).map_err(|e| anyhow!("live event: {}", e))
}

/// Classified live event, ready for overlay rendering.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LiveFrame {
    pub camera_id: String,
    pub image_name: Option<String>,
    #[serde(flatten)]
    pub classification: Classification,
}

/// Decorates detections with `collides` and counts them against the zones.
pub fn classify_live_frame(detections: &[Detection], aggregator: &Aggregator) -> Classification {
    classify(detections, &aggregator.zones)
}

/// Full live path for one event. Events without `detections` yield `None`.
pub fn process_live_event(envelope: LiveEnvelope, aggregator: &Aggregator) -> Option<LiveFrame> {
    let detections = envelope.detections?;
    Some(LiveFrame {
        camera_id: envelope.camera_id,
        image_name: envelope.image_name,
        classification: classify_live_frame(&detections, aggregator),
    })
}

/// Reads events until the source closes, handing each classified frame to
/// `on_frame`. Malformed events are logged and skipped. Returns the number of
/// frames delivered.
pub async fn pump_live_events<E, F>(
    source: &mut E,
    aggregator: &Aggregator,
    mut on_frame: F,
) -> Result<usize>
where
    E: EventSource + ?Sized,
    F: FnMut(LiveFrame) + Send,
{
    let mut delivered = 0;
    while let Some(payload) = source.next_event().await? {
        let envelope = match parse_live_event(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Skipping live event: {}", e);
                continue;
            }
        };
        match process_live_event(envelope, aggregator) {
            Some(frame) => {
                delivered += 1;
                on_frame(frame);
            }
            None => log::debug!("live event without detections"),
        }
    }
    Ok(delivered)
}
