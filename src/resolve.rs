//! Time range to storage partition resolution.
//!
//! Captured detections are stored under
//! `<event source>/00/YYYY/MM/DD/HH/mm/...`, one directory per minute. A range
//! is walked minute by minute; each step yields the hour path (probed for
//! existence) and the minute path (listed).

use anyhow::Result;
use chrono::{DateTime, Duration, DurationRound, TimeZone, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::{AggregationError, AggregationResult};
use crate::storage::BlobStore;

/// Shard segment written by the capture pipeline.
pub const SHARD_SEGMENT: &str = "00";

/// Half-open wall-clock interval `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> AggregationResult<Self> {
        if start >= end {
            return Err(AggregationError::InvalidRange(format!(
                "start {} is not before end {}",
                start.to_rfc3339(),
                end.to_rfc3339()
            )));
        }
        Ok(Self { start, end })
    }

    /// `[end - minutes, end)`.
    pub fn ending_at(end: DateTime<Utc>, minutes: u32) -> AggregationResult<Self> {
        Self::new(end - Duration::minutes(i64::from(minutes)), end)
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Rejects ranges ending in the future or before the earliest captured data.
    pub fn check_bounds(&self, now: DateTime<Utc>, earliest: DateTime<Utc>) -> AggregationResult<()> {
        if self.end > now {
            return Err(AggregationError::InvalidRange(format!(
                "end {} is in the future",
                self.end.to_rfc3339()
            )));
        }
        if self.end < earliest {
            return Err(AggregationError::InvalidRange(format!(
                "end {} is before the earliest capture {}",
                self.end.to_rfc3339(),
                earliest.to_rfc3339()
            )));
        }
        Ok(())
    }

    /// Minute starts of the range with both ends truncated to whole minutes.
    pub fn minutes(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        let first = truncate_minute(self.start);
        let end = truncate_minute(self.end);
        std::iter::successors(Some(first), |t| Some(*t + Duration::minutes(1)))
            .take_while(move |t| *t < end)
    }
}

fn truncate_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(Duration::minutes(1)).unwrap_or_else(|_| {
        // out-of-range timestamps only; fall back to second-level arithmetic
        let secs = t.timestamp() - t.timestamp().rem_euclid(60);
        Utc.timestamp_opt(secs, 0).single().unwrap_or(t)
    })
}

/// Hour and minute paths for one minute step.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub hour: String,
    pub minute: String,
}

impl PartitionKey {
    pub fn at(event_source: &str, t: DateTime<Utc>) -> Self {
        let hour = format!(
            "{}/{}/{}",
            event_source,
            SHARD_SEGMENT,
            t.format("%Y/%m/%d/%H")
        );
        let minute = format!("{}/{}", hour, t.format("%M"));
        Self { hour, minute }
    }
}

pub struct BlobRangeResolver {
    event_source: String,
}

impl BlobRangeResolver {
    pub fn new(event_source: impl Into<String>) -> Self {
        Self {
            event_source: event_source.into(),
        }
    }

    /// One key per minute step; hour paths repeat within an hour.
    pub fn resolve(&self, range: &TimeRange) -> Vec<PartitionKey> {
        range
            .minutes()
            .map(|t| PartitionKey::at(&self.event_source, t))
            .collect()
    }
}

/// Hour-level existence checks, memoized for one run.
///
/// Each distinct hour is checked once. A negative answer skips every minute
/// of that hour, so an eventually consistent store can hide fresh data.
pub struct PartitionProbe<'a> {
    store: &'a dyn BlobStore,
    container: &'a str,
    hours: HashMap<String, bool>,
}

impl<'a> PartitionProbe<'a> {
    pub fn new(store: &'a dyn BlobStore, container: &'a str) -> Self {
        Self {
            store,
            container,
            hours: HashMap::new(),
        }
    }

    pub async fn hour_exists(&mut self, key: &PartitionKey) -> Result<bool> {
        if let Some(&known) = self.hours.get(&key.hour) {
            return Ok(known);
        }
        let exists = self.store.exists(self.container, &key.hour).await?;
        log::debug!("partition {} exists: {}", key.hour, exists);
        self.hours.insert(key.hour.clone(), exists);
        Ok(exists)
    }
}

/// Event-source id from an Event Hubs connection string.
///
/// `Endpoint=sb://people-counter.servicebus.windows.net/;...` yields
/// `people-counter`. A bare name is returned unchanged.
pub fn parse_event_source_id(connection: &str) -> Option<String> {
    static ENDPOINT_RE: OnceLock<Regex> = OnceLock::new();
    let re = ENDPOINT_RE.get_or_init(|| {
        Regex::new(r"^[^=]*=(?:[a-z]+://)?([^./;]+)").expect("endpoint pattern is valid")
    });

    let trimmed = connection.trim();
    if trimmed.is_empty() {
        return None;
    }
    if !trimmed.contains('=') {
        return Some(trimmed.to_string());
    }
    re.captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
