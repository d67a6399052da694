//! Live event transport.
//!
//! `EventSource` is the push channel the live path reads from. The MQTT source
//! talks to the camera relay; the channel source feeds events in-process.

mod mqtt;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use mqtt::{parse_mqtt_endpoint, MqttCredentials, MqttEndpoint, MqttEventSource};

#[async_trait]
pub trait EventSource: Send {
    /// Next raw JSON envelope; `None` once the source has closed.
    async fn next_event(&mut self) -> Result<Option<Vec<u8>>>;
}

/// In-process event source backed by a bounded channel.
pub struct ChannelEventSource {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl ChannelEventSource {
    pub fn channel(capacity: usize) -> (mpsc::Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn next_event(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }
}
