use std::io::Write;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use zonecount::config::{StorageKind, ZonecountConfig};
use zonecount::Aggregator;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "ZONECOUNT_CONFIG",
        "ZONECOUNT_CONTAINER",
        "ZONECOUNT_EVENT_HUB",
        "ZONECOUNT_STORAGE_KIND",
        "ZONECOUNT_STORAGE_PATH",
        "ZONECOUNT_AGGREGATOR",
        "ZONECOUNT_WINDOW_MINUTES",
        "MQTT_BROKER_ADDR",
        "ZONECOUNT_MQTT_TOPIC",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = ZonecountConfig::load().expect("load defaults");
    assert_eq!(cfg.container, "detectoroutput");
    assert_eq!(cfg.window_minutes, 15);
    assert_eq!(cfg.earliest.to_rfc3339(), "2020-06-27T00:00:00+00:00");
    assert_eq!(cfg.storage.kind, StorageKind::Filesystem);
    assert_eq!(cfg.mqtt.broker, "127.0.0.1:1883");
    assert!(cfg.event_source_id.is_none());
    assert_eq!(cfg.aggregator().unwrap(), Aggregator::default());
}

#[test]
fn loads_json_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "container": "archive",
        "event_hub": "Endpoint=sb://lobby-cam.servicebus.windows.net/;SharedAccessKeyName=listen",
        "window_minutes": 30,
        "earliest": "2021-01-01",
        "storage": { "kind": "sqlite", "path": "blobs.db" },
        "mqtt": { "broker": "mqtts://relay:8883", "topic": "cams/live" }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("ZONECOUNT_CONFIG", file.path());
    std::env::set_var("ZONECOUNT_WINDOW_MINUTES", "5");
    std::env::set_var("ZONECOUNT_MQTT_TOPIC", "cams/entrance");

    let cfg = ZonecountConfig::load().expect("load config");
    assert_eq!(cfg.container, "archive");
    assert_eq!(cfg.event_source_id.as_deref(), Some("lobby-cam"));
    assert_eq!(cfg.window_minutes, 5);
    assert_eq!(cfg.earliest.to_rfc3339(), "2021-01-01T00:00:00+00:00");
    assert_eq!(cfg.storage.kind, StorageKind::Sqlite);
    assert_eq!(cfg.storage.path, "blobs.db");
    assert_eq!(cfg.mqtt.broker, "mqtts://relay:8883");
    assert_eq!(cfg.mqtt.topic, "cams/entrance");

    clear_env();
}

#[test]
fn loads_toml_config_and_aggregator_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let dir = tempfile::tempdir().expect("temp dir");
    let aggregator = Aggregator::default();
    let aggregator_path = dir.path().join("aggregator.b64");
    std::fs::write(&aggregator_path, aggregator.encode().unwrap()).unwrap();

    let config_path = dir.path().join("zonecount.toml");
    let toml = format!(
        "event_hub = \"front-door\"\naggregator_path = \"{}\"\n\n[storage]\npath = \"/srv/blobs\"\n",
        aggregator_path.display()
    );
    std::fs::write(&config_path, toml).unwrap();

    std::env::set_var("ZONECOUNT_CONFIG", &config_path);
    std::env::set_var("ZONECOUNT_STORAGE_KIND", "filesystem");

    let cfg = ZonecountConfig::load().expect("load toml config");
    assert_eq!(cfg.event_source_id.as_deref(), Some("front-door"));
    assert_eq!(cfg.storage.path, "/srv/blobs");
    assert_eq!(cfg.storage.kind, StorageKind::Filesystem);
    assert_eq!(cfg.aggregator().unwrap(), aggregator);

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("ZONECOUNT_WINDOW_MINUTES", "0");
    assert!(ZonecountConfig::load().is_err());

    std::env::set_var("ZONECOUNT_WINDOW_MINUTES", "quarter");
    assert!(ZonecountConfig::load().is_err());

    clear_env();
    std::env::set_var("ZONECOUNT_STORAGE_KIND", "s3");
    assert!(ZonecountConfig::load().is_err());

    clear_env();
    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(b"{ not json").expect("write config");
    std::env::set_var("ZONECOUNT_CONFIG", file.path());
    assert!(ZonecountConfig::load().is_err());

    clear_env();
}
