use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use std::time::Duration;

use super::EventSource;

const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const PLAIN_PORT: u16 = 1883;
const TLS_PORT: u16 = 8883;

/// Where the camera relay's broker listens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parses a broker address.
///
/// Accepts `host`, `host:port`, `[v6]:port`, optionally behind an `mqtt://`,
/// `tcp://`, `mqtts://` or `ssl://` scheme. A TLS scheme or `force_tls`
/// enables TLS. A missing port falls back to 1883, or 8883 with TLS.
pub fn parse_mqtt_endpoint(addr: &str, force_tls: bool) -> Result<MqttEndpoint> {
    let addr = addr.trim();
    let (scheme_tls, authority) = match addr.split_once("://") {
        Some(("mqtt" | "tcp", rest)) => (false, rest),
        Some(("mqtts" | "ssl", rest)) => (true, rest),
        Some((scheme, _)) => return Err(anyhow!("unsupported MQTT scheme '{}'", scheme)),
        None => (false, addr),
    };
    let use_tls = force_tls || scheme_tls;
    let authority = authority.trim_end_matches('/');

    let (host, port) = split_authority(authority)?;
    if host.is_empty() {
        return Err(anyhow!("broker address '{}' has no host", addr));
    }
    let port = match port {
        Some(raw) => raw
            .parse::<u16>()
            .with_context(|| format!("invalid port in broker address '{}'", addr))?,
        None if use_tls => TLS_PORT,
        None => PLAIN_PORT,
    };
    Ok(MqttEndpoint {
        host: host.to_string(),
        port,
        use_tls,
    })
}

/// Host and optional port text; brackets are stripped from IPv6 literals.
fn split_authority(authority: &str) -> Result<(&str, Option<&str>)> {
    if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, tail) = bracketed
            .split_once(']')
            .ok_or_else(|| anyhow!("unterminated IPv6 literal in '{}'", authority))?;
        return match tail {
            "" => Ok((host, None)),
            _ => tail
                .strip_prefix(':')
                .map(|port| (host, Some(port)))
                .ok_or_else(|| anyhow!("unexpected '{}' after IPv6 literal", tail)),
        };
    }
    Ok(match authority.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (authority, None),
    })
}

#[derive(Clone, Debug, Default)]
pub struct MqttCredentials {
    pub username: String,
    pub password: String,
}

/// What the event source does with one polled MQTT event.
#[derive(Debug, PartialEq)]
enum Step {
    Subscribe,
    Deliver(Vec<u8>),
    Wait,
}

fn step_for(event: Event) -> Step {
    match event {
        Event::Incoming(Packet::ConnAck(_)) => Step::Subscribe,
        Event::Incoming(Packet::Publish(publish)) => Step::Deliver(publish.payload.to_vec()),
        Event::Incoming(Packet::Disconnect) => {
            // the next poll reconnects and the ConnAck resubscribes
            log::warn!("MQTT broker sent DISCONNECT; reconnecting");
            Step::Wait
        }
        _ => Step::Wait,
    }
}

/// Live detection events delivered over an MQTT topic.
///
/// The feed never ends on its own: connection loss and broker-initiated
/// disconnects are followed by a reconnect, and the subscription is reissued
/// on every CONNACK.
pub struct MqttEventSource {
    client: AsyncClient,
    eventloop: EventLoop,
    topic: String,
}

impl MqttEventSource {
    pub fn connect(
        endpoint: &MqttEndpoint,
        client_id: &str,
        topic: &str,
        credentials: Option<&MqttCredentials>,
    ) -> Result<Self> {
        let mut options = MqttOptions::new(client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        if let Some(creds) = credentials {
            options.set_credentials(&creds.username, &creds.password);
        }
        if endpoint.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, eventloop) = AsyncClient::new(options, 10);
        log::info!(
            "MQTT event source for {}:{} (TLS: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            credentials.is_some()
        );
        Ok(Self {
            client,
            eventloop,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl EventSource for MqttEventSource {
    async fn next_event(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let event = match self.eventloop.poll().await {
                Ok(event) => event,
                Err(e) => {
                    log::error!("MQTT connection error: {}. Reconnecting...", e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };
            match step_for(event) {
                Step::Subscribe => {
                    self.client
                        .subscribe(&self.topic, QoS::AtMostOnce)
                        .await
                        .with_context(|| format!("subscribe to {}", self.topic))?;
                    log::info!("Subscribed to {}", self.topic);
                }
                Step::Deliver(payload) => return Ok(Some(payload)),
                Step::Wait => {}
            }
        }
    }
}
