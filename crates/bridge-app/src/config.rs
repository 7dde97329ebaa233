use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use bridge_actor::ActorConfig;
use eagle_client::EagleConfig;
use mqtt_publisher::MqttConfig;

#[derive(Clone, Debug, Default)]
pub struct BridgeConfig {
    pub eagle: EagleConfig,
    pub mqtt: MqttConfig,
    pub actor: ActorConfig,
}

impl BridgeConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    /// Layered load: defaults, then the config file (TOML or JSON), then
    /// `BRIDGE_*` environment overrides.
    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Startup-time validation; the process must not reach discovery with a
    /// bad configuration.
    pub fn validate(&self) -> Result<()> {
        if self.eagle.host.trim().is_empty() {
            anyhow::bail!("eagle.host is required");
        }
        if self.eagle.cloud_id.trim().is_empty() {
            anyhow::bail!("eagle.cloud_id is required");
        }
        if self.eagle.install_code.trim().is_empty() {
            anyhow::bail!("eagle.install_code is required");
        }
        if self.eagle.timeout_ms == 0 {
            anyhow::bail!("eagle.timeout_ms must be >= 1");
        }
        if self.mqtt.host.trim().is_empty() {
            anyhow::bail!("mqtt.host is required");
        }
        if self.mqtt.port == 0 {
            anyhow::bail!("mqtt.port must be between 1 and 65535");
        }
        if self.mqtt.client_id.trim().is_empty() {
            anyhow::bail!("mqtt.client_id must be non-empty");
        }
        if self.mqtt.keep_alive_secs == 0 {
            anyhow::bail!("mqtt.keep_alive_secs must be >= 1");
        }
        if self.mqtt.op_timeout_ms == 0 {
            anyhow::bail!("mqtt.op_timeout_ms must be >= 1");
        }
        if self.actor.poll_interval.as_secs() == 0 {
            anyhow::bail!("poll.interval_secs must be >= 1");
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    eagle: Option<FileEagleConfig>,
    mqtt: Option<FileMqttConfig>,
    poll: Option<FilePollConfig>,
}

#[derive(Debug, Deserialize)]
struct FileEagleConfig {
    host: Option<String>,
    cloud_id: Option<String>,
    install_code: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileMqttConfig {
    host: Option<String>,
    port: Option<u16>,
    client_id: Option<String>,
    keep_alive_secs: Option<u64>,
    op_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FilePollConfig {
    interval_secs: Option<u64>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("BRIDGE_CONFIG") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content =
        fs::read_to_string(&path).with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn apply_file_config(config: &mut BridgeConfig, file: FileConfig) {
    if let Some(eagle) = file.eagle {
        if let Some(host) = eagle.host {
            config.eagle.host = host;
        }
        if let Some(cloud_id) = eagle.cloud_id {
            config.eagle.cloud_id = cloud_id;
        }
        if let Some(install_code) = eagle.install_code {
            config.eagle.install_code = install_code;
        }
        if let Some(timeout_ms) = eagle.timeout_ms {
            config.eagle.timeout_ms = timeout_ms;
        }
    }

    if let Some(mqtt) = file.mqtt {
        if let Some(host) = mqtt.host {
            config.mqtt.host = host;
        }
        if let Some(port) = mqtt.port {
            config.mqtt.port = port;
        }
        if let Some(client_id) = mqtt.client_id {
            config.mqtt.client_id = client_id;
        }
        if let Some(keep_alive_secs) = mqtt.keep_alive_secs {
            config.mqtt.keep_alive_secs = keep_alive_secs;
        }
        if let Some(op_timeout_ms) = mqtt.op_timeout_ms {
            config.mqtt.op_timeout_ms = op_timeout_ms;
        }
    }

    if let Some(poll) = file.poll {
        if let Some(interval_secs) = poll.interval_secs {
            config.actor.poll_interval = Duration::from_secs(interval_secs);
        }
    }
}

fn apply_env_overrides(config: &mut BridgeConfig) {
    if let Ok(value) = env::var("BRIDGE_EAGLE_HOST") {
        config.eagle.host = value;
    }
    if let Ok(value) = env::var("BRIDGE_EAGLE_CLOUD_ID") {
        config.eagle.cloud_id = value;
    }
    if let Ok(value) = env::var("BRIDGE_EAGLE_INSTALL_CODE") {
        config.eagle.install_code = value;
    }
    if let Some(timeout_ms) = parse_env_u64("BRIDGE_EAGLE_TIMEOUT_MS") {
        config.eagle.timeout_ms = timeout_ms;
    }

    if let Ok(value) = env::var("BRIDGE_MQTT_HOST") {
        config.mqtt.host = value;
    }
    if let Some(port) = parse_env_u16("BRIDGE_MQTT_PORT") {
        config.mqtt.port = port;
    }
    if let Ok(value) = env::var("BRIDGE_MQTT_CLIENT_ID") {
        config.mqtt.client_id = value;
    }
    if let Some(keep_alive_secs) = parse_env_u64("BRIDGE_MQTT_KEEP_ALIVE_SECS") {
        config.mqtt.keep_alive_secs = keep_alive_secs;
    }
    if let Some(op_timeout_ms) = parse_env_u64("BRIDGE_MQTT_OP_TIMEOUT_MS") {
        config.mqtt.op_timeout_ms = op_timeout_ms;
    }

    if let Some(interval_secs) = parse_env_u64("BRIDGE_POLL_INTERVAL_SECS") {
        config.actor.poll_interval = Duration::from_secs(interval_secs);
    }
}

fn parse_env_u16(key: &str) -> Option<u16> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}
