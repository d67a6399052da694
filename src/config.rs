use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::aggregate::{default_earliest, DEFAULT_CONTAINER};
use crate::resolve::parse_event_source_id;
use crate::storage::{BlobStore, FilesystemBlobStore, SqliteBlobStore};
use crate::zones::Aggregator;

const DEFAULT_STORAGE_PATH: &str = "blobs";
const DEFAULT_WINDOW_MINUTES: u32 = 15;
const DEFAULT_MQTT_BROKER: &str = "127.0.0.1:1883";
const DEFAULT_MQTT_TOPIC: &str = "detections/live";
const DEFAULT_MQTT_CLIENT_ID: &str = "zonecount";

#[derive(Debug, Deserialize, Default)]
struct ZonecountConfigFile {
    container: Option<String>,
    event_hub: Option<String>,
    window_minutes: Option<u32>,
    earliest: Option<String>,
    aggregator_path: Option<PathBuf>,
    storage: Option<StorageConfigFile>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    kind: Option<String>,
    path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker: Option<String>,
    topic: Option<String>,
    client_id: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageKind {
    Filesystem,
    Sqlite,
}

impl std::str::FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "filesystem" | "fs" | "dir" => Ok(Self::Filesystem),
            "sqlite" | "db" => Ok(Self::Sqlite),
            other => Err(anyhow!(
                "unknown storage kind '{}': expected 'filesystem' or 'sqlite'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub kind: StorageKind,
    pub path: String,
}

impl StorageSettings {
    pub fn open(&self) -> Result<Arc<dyn BlobStore>> {
        Ok(match self.kind {
            StorageKind::Filesystem => Arc::new(FilesystemBlobStore::new(&self.path)),
            StorageKind::Sqlite => Arc::new(
                SqliteBlobStore::open(&self.path)
                    .with_context(|| format!("open blob database {}", self.path))?,
            ),
        })
    }
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub topic: String,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct ZonecountConfig {
    pub container: String,
    /// Event-source id derived from the configured connection string.
    pub event_source_id: Option<String>,
    pub window_minutes: u32,
    pub earliest: DateTime<Utc>,
    pub aggregator_path: Option<PathBuf>,
    pub storage: StorageSettings,
    pub mqtt: MqttSettings,
}

impl ZonecountConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ZONECOUNT_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ZonecountConfigFile) -> Result<Self> {
        let container = file
            .container
            .unwrap_or_else(|| DEFAULT_CONTAINER.to_string());
        let event_source_id = file.event_hub.as_deref().and_then(parse_event_source_id);
        let earliest = match file.earliest.as_deref() {
            Some(raw) => parse_instant(raw)?,
            None => default_earliest(),
        };
        let storage = StorageSettings {
            kind: match file.storage.as_ref().and_then(|s| s.kind.as_deref()) {
                Some(kind) => kind.parse()?,
                None => StorageKind::Filesystem,
            },
            path: file
                .storage
                .and_then(|s| s.path)
                .unwrap_or_else(|| DEFAULT_STORAGE_PATH.to_string()),
        };
        let mqtt = MqttSettings {
            broker: file
                .mqtt
                .as_ref()
                .and_then(|m| m.broker.clone())
                .unwrap_or_else(|| DEFAULT_MQTT_BROKER.to_string()),
            topic: file
                .mqtt
                .as_ref()
                .and_then(|m| m.topic.clone())
                .unwrap_or_else(|| DEFAULT_MQTT_TOPIC.to_string()),
            client_id: file
                .mqtt
                .and_then(|m| m.client_id)
                .unwrap_or_else(|| DEFAULT_MQTT_CLIENT_ID.to_string()),
        };
        Ok(Self {
            container,
            event_source_id,
            window_minutes: file.window_minutes.unwrap_or(DEFAULT_WINDOW_MINUTES),
            earliest,
            aggregator_path: file.aggregator_path,
            storage,
            mqtt,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(container) = std::env::var("ZONECOUNT_CONTAINER") {
            if !container.trim().is_empty() {
                self.container = container.trim().to_string();
            }
        }
        if let Ok(hub) = std::env::var("ZONECOUNT_EVENT_HUB") {
            if let Some(id) = parse_event_source_id(&hub) {
                self.event_source_id = Some(id);
            }
        }
        if let Ok(kind) = std::env::var("ZONECOUNT_STORAGE_KIND") {
            if !kind.trim().is_empty() {
                self.storage.kind = kind.parse()?;
            }
        }
        if let Ok(path) = std::env::var("ZONECOUNT_STORAGE_PATH") {
            if !path.trim().is_empty() {
                self.storage.path = path;
            }
        }
        if let Ok(path) = std::env::var("ZONECOUNT_AGGREGATOR") {
            if !path.trim().is_empty() {
                self.aggregator_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(minutes) = std::env::var("ZONECOUNT_WINDOW_MINUTES") {
            self.window_minutes = minutes
                .trim()
                .parse()
                .map_err(|_| anyhow!("ZONECOUNT_WINDOW_MINUTES must be a whole number of minutes"))?;
        }
        if let Ok(broker) = std::env::var("MQTT_BROKER_ADDR") {
            if !broker.trim().is_empty() {
                self.mqtt.broker = broker;
            }
        }
        if let Ok(topic) = std::env::var("ZONECOUNT_MQTT_TOPIC") {
            if !topic.trim().is_empty() {
                self.mqtt.topic = topic;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.window_minutes == 0 {
            return Err(anyhow!("window_minutes must be greater than zero"));
        }
        if self.container.is_empty() {
            return Err(anyhow!("container must not be empty"));
        }
        if self.mqtt.topic.trim().is_empty() {
            return Err(anyhow!("mqtt topic must not be empty"));
        }
        Ok(())
    }

    /// Configured aggregator, or the single empty `queue` zone.
    pub fn aggregator(&self) -> Result<Aggregator> {
        match &self.aggregator_path {
            Some(path) => Aggregator::load(path),
            None => Ok(Aggregator::default()),
        }
    }
}

/// RFC 3339 instant, or a bare `YYYY-MM-DD` date taken as UTC midnight.
pub fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| anyhow!("invalid timestamp '{}': expected RFC 3339 or YYYY-MM-DD", raw))?;
    date.and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .ok_or_else(|| anyhow!("invalid timestamp '{}'", raw))
}

fn read_config_file(path: &Path) -> Result<ZonecountConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
