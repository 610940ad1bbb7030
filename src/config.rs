use std::path::{Path, PathBuf};

use figment::{
    providers::{Format, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{alert::Rectangle, mqtt::MqttQoS};

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub system: ConfigSystem,
    pub mqtt: ConfigMqtt,
    pub zone: ConfigZone,
    pub detection: ConfigDetection,
    pub alert: ConfigAlert,
    pub evidence: ConfigEvidence,
    pub feed: ConfigFeed,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConfigSystem {
    /// `EnvFilter` directive, e.g. `info` or `intrusion_sentinel=debug,rumqttc=warn`
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ConfigSystem {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConfigMqtt {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub keepalive_secs: u16,
    pub client_id_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: MqttQoS,
    /// How long to wait for the broker to acknowledge a connection attempt
    pub connect_timeout_secs: u64,
    /// Pause between reconnection attempts on the monitor
    pub reconnect_delay_secs: u64,
}

impl Default for ConfigMqtt {
    fn default() -> Self {
        Self {
            host: "test.mosquitto.org".into(),
            port: 1883,
            topic: "home/security/alert".into(),
            keepalive_secs: 60,
            client_id_prefix: "sentinel".into(),
            username: None,
            password: None,
            qos: MqttQoS::AtMostOnce,
            connect_timeout_secs: 10,
            reconnect_delay_secs: 5,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConfigZone {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    /// Free text label sent with every alert
    pub location: String,
}

impl ConfigZone {
    pub fn rectangle(&self) -> Rectangle {
        Rectangle::new(self.x1, self.y1, self.x2, self.y2)
    }
}

impl Default for ConfigZone {
    fn default() -> Self {
        Self {
            x1: 100.0,
            y1: 100.0,
            x2: 500.0,
            y2: 400.0,
            location: "Living Room".into(),
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConfigDetection {
    pub target_label: String,
    pub confidence_threshold: f32,
}

impl Default for ConfigDetection {
    fn default() -> Self {
        Self {
            target_label: "person".into(),
            confidence_threshold: 0.5,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConfigAlert {
    pub cooldown_seconds: u64,
}

impl Default for ConfigAlert {
    fn default() -> Self {
        Self {
            cooldown_seconds: 5,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConfigEvidence {
    pub directory: PathBuf,
}

impl Default for ConfigEvidence {
    fn default() -> Self {
        Self {
            directory: "evidence".into(),
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConfigFeed {
    /// Detection feed file, `-` for stdin
    pub source: String,
    /// Pause after a frame could not be read
    pub retry_delay_ms: u64,
    /// Pacing between frames, 0 to run as fast as the feed delivers
    pub frame_interval_ms: u64,
}

impl Default for ConfigFeed {
    fn default() -> Self {
        Self {
            source: "-".into(),
            retry_delay_ms: 500,
            frame_interval_ms: 0,
        }
    }
}

/// rumqttc refuses shorter keepalive intervals
const MIN_KEEPALIVE_SECS: u16 = 5;

/// Defaults, then the TOML file if present, then `SENTINEL_` environment variables
/// (`__` separates sections, e.g. `SENTINEL_MQTT__HOST`).
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, String> {
    let cfg: Config = Figment::from(Serialized::defaults(Config::default()))
        .merge(figment::providers::Toml::file(path))
        .merge(figment::providers::Env::prefixed("SENTINEL_").split("__"))
        .extract()
        .map_err(|e| e.to_string())?;

    if !cfg.zone.rectangle().is_ordered() {
        return Err(format!(
            "Zone corners are out of order: ({}, {}) must be above and left of ({}, {})",
            cfg.zone.x1, cfg.zone.y1, cfg.zone.x2, cfg.zone.y2
        ));
    }
    if !(0.0..=1.0).contains(&cfg.detection.confidence_threshold) {
        return Err(format!(
            "Confidence threshold must be between 0 and 1, got {}",
            cfg.detection.confidence_threshold
        ));
    }
    if cfg.mqtt.topic.is_empty() {
        return Err("MQTT topic can't be empty".to_string());
    }
    if cfg.mqtt.keepalive_secs < MIN_KEEPALIVE_SECS {
        return Err(format!(
            "MQTT keepalive must be at least {} seconds, got {}",
            MIN_KEEPALIVE_SECS, cfg.mqtt.keepalive_secs
        ));
    }
    if cfg.mqtt.username.is_some() != cfg.mqtt.password.is_some() {
        return Err("MQTT username and password must be set together".to_string());
    }
    Ok(cfg)
}
