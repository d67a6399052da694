//! zonecount_live - Classify live detection events against the zones.
//!
//! Subscribes to the camera relay topic, marks each detection with whether it
//! overlaps a zone, and prints one JSON line per classified image.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use zonecount::config::ZonecountConfig;
use zonecount::pump_live_events;
use zonecount::transport::{parse_mqtt_endpoint, MqttCredentials, MqttEventSource};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Mark live detections that fall inside configured zones"
)]
struct Args {
    /// MQTT broker address. Overrides the configured broker.
    #[arg(long, env = "MQTT_BROKER_ADDR")]
    mqtt_broker_addr: Option<String>,

    /// Topic the camera relay publishes detections on.
    #[arg(long, env = "ZONECOUNT_MQTT_TOPIC")]
    topic: Option<String>,

    /// MQTT client identifier.
    #[arg(long, env = "MQTT_CLIENT_ID")]
    mqtt_client_id: Option<String>,

    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD")]
    mqtt_password: Option<String>,

    /// Force TLS even for a bare host:port address.
    #[arg(long, env = "MQTT_USE_TLS")]
    mqtt_use_tls: bool,

    /// Aggregator file (JSON or base64 JSON).
    #[arg(long, value_name = "PATH")]
    aggregator: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = ZonecountConfig::load()?;
    if let Some(broker) = args.mqtt_broker_addr {
        cfg.mqtt.broker = broker;
    }
    if let Some(topic) = args.topic {
        cfg.mqtt.topic = topic;
    }
    if let Some(client_id) = args.mqtt_client_id {
        cfg.mqtt.client_id = client_id;
    }
    if let Some(path) = args.aggregator {
        cfg.aggregator_path = Some(path);
    }

    let aggregator = cfg.aggregator()?;
    let endpoint = parse_mqtt_endpoint(&cfg.mqtt.broker, args.mqtt_use_tls)?;
    let credentials = match (args.mqtt_username, args.mqtt_password) {
        (Some(username), password) => Some(MqttCredentials {
            username,
            password: password.unwrap_or_default(),
        }),
        (None, _) => None,
    };

    log::info!("Live zone classifier starting");
    log::info!("  Topic: {}", cfg.mqtt.topic);
    log::info!(
        "  Zones: {}",
        aggregator
            .zones
            .iter()
            .map(|z| z.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let mut source = MqttEventSource::connect(
        &endpoint,
        &cfg.mqtt.client_id,
        &cfg.mqtt.topic,
        credentials.as_ref(),
    )?;

    let delivered = pump_live_events(&mut source, &aggregator, |frame| {
        match serde_json::to_string(&frame) {
            Ok(line) => println!("{}", line),
            Err(e) => log::warn!("failed to encode frame for {}: {}", frame.camera_id, e),
        }
        log::debug!(
            "{}: {} of {} detections in zone",
            frame.camera_id,
            frame.classification.collisions,
            frame.classification.detection_count
        );
    })
    .await?;

    log::info!("Event source closed after {} frames", delivered);
    Ok(())
}
