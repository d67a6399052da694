use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;

use crate::error::{AggregationError, AggregationResult};
use crate::frame::{DetectionRecord, RawRecord};

/// One line of a captured blob: `{"Body": "<base64 JSON>", ...}`.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "Body")]
    body: String,
}

/// Records decoded from one blob plus the count of lines that were dropped.
#[derive(Debug, Default)]
pub struct DecodedBlob {
    pub records: Vec<DetectionRecord>,
    pub skipped: usize,
}

pub fn decode_line(line: &str) -> AggregationResult<DetectionRecord> {
    let envelope: Envelope = serde_json::from_str(line)
        .map_err(|e| AggregationError::Decode(format!("envelope: {}", e)))?;
    let body = BASE64
        .decode(envelope.body.trim())
        .map_err(|e| AggregationError::Decode(format!("body base64: {}", e)))?;
    let raw: RawRecord = serde_json::from_slice(&body)
        .map_err(|e| AggregationError::Decode(format!("body JSON: {}", e)))?;
    DetectionRecord::try_from(raw).map_err(AggregationError::Decode)
}

/// Decodes every non-empty line; a bad line never spoils its siblings.
pub fn decode_blob(content: &[u8]) -> DecodedBlob {
    let text = String::from_utf8_lossy(content);
    let mut out = DecodedBlob::default();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match decode_line(line) {
            Ok(record) => out.records.push(record),
            Err(e) => {
                log::warn!("skipping line {}: {}", idx + 1, e);
                out.skipped += 1;
            }
        }
    }
    out
}

/// Wraps a record body the way the capture pipeline does. Used to build fixtures.
pub fn encode_line(record: &RawRecord) -> serde_json::Result<String> {
    let body = BASE64.encode(serde_json::to_vec(record)?);
    serde_json::to_string(&serde_json::json!({ "Body": body }))
}
