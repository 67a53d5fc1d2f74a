//! Agent configuration
//!
//! Handles:
//! - Loading `config.yaml` (path from argv, `EINKFRAME_CONFIG`, or the default)
//! - Broker, device, screen and timing settings
//! - Validation of required fields before anything starts
//! - Topic template resolution (done once, at startup)

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const CONFIG_ENV: &str = "EINKFRAME_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
pub const DEFAULT_PLACEHOLDER: &str = "{device_id}";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub mqtt: MqttConfig,
    pub device: DeviceConfig,
    #[serde(default)]
    pub screen: ScreenConfig,
    #[serde(default)]
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)] // Never write the password back out
    pub password: Option<String>,
    /// Defaults to "on" whenever a password is configured
    #[serde(default)]
    pub tls: Option<bool>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_placeholder")]
    pub device_id_placeholder: String,
    pub topic_device_status: String,
    pub topic_image_display: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Published as `mac` in status reports. Discovered from the primary
    /// network interface when left out.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub led_pin: Option<u8>,
    #[serde(default)]
    pub should_shutdown_on_battery: bool,
    #[serde(default)]
    pub halt_host_on_shutdown: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PanelDriver {
    /// No panel attached, frames are only logged
    Log,
    /// Last frame is written to `output_path`
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenConfig {
    pub width: u32,
    pub height: u32,
    pub driver: PanelDriver,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_dedup_ttl")]
    pub dedup_ttl_secs: u64,
    #[serde(default = "default_settle")]
    pub render_settle_secs: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_reconnect")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_keep_alive() -> u64 {
    30
}
fn default_placeholder() -> String {
    DEFAULT_PLACEHOLDER.to_string()
}
fn default_dedup_ttl() -> u64 {
    300
}
fn default_settle() -> u64 {
    5
}
fn default_heartbeat() -> u64 {
    60
}
fn default_reconnect() -> u64 {
    5
}
fn default_grace() -> u64 {
    3
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            width: 1600,
            height: 1200,
            driver: PanelDriver::Log,
            output_path: None,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            dedup_ttl_secs: default_dedup_ttl(),
            render_settle_secs: default_settle(),
            heartbeat_secs: default_heartbeat(),
            reconnect_delay_secs: default_reconnect(),
            shutdown_grace_secs: default_grace(),
        }
    }
}

impl TimingConfig {
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn render_settle(&self) -> Duration {
        Duration::from_secs(self.render_settle_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl MqttConfig {
    pub fn use_tls(&self) -> bool {
        self.tls.unwrap_or(self.password.is_some())
    }
}

/// Status and display topics with the device id substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub status: String,
    pub display: String,
}

impl Topics {
    pub fn resolve(mqtt: &MqttConfig, device_id: &str) -> Self {
        let placeholder = mqtt.device_id_placeholder.as_str();
        Self {
            status: mqtt.topic_device_status.replace(placeholder, device_id),
            display: mqtt.topic_image_display.replace(placeholder, device_id),
        }
    }
}

impl AgentConfig {
    /// Resolve the config path: first CLI argument, then env, then default
    pub fn config_file_path(arg: Option<String>) -> PathBuf {
        arg.or_else(|| std::env::var(CONFIG_ENV).ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
            .into()
    }

    /// Load and validate a config file
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;

        let config = Self::from_yaml(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Err(ConfigError::Missing("mqtt"));
        }
        let config: AgentConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject incomplete or contradictory settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mqtt = &self.mqtt;

        if mqtt.broker.trim().is_empty() {
            return Err(ConfigError::Missing("mqtt.broker"));
        }
        if mqtt.port == 0 {
            return Err(invalid("mqtt.port", "port must be non-zero"));
        }
        if mqtt.password.is_some() && mqtt.username.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::Missing("mqtt.username"));
        }
        if mqtt.keep_alive_secs < 5 {
            return Err(invalid("mqtt.keep_alive_secs", "must be at least 5 seconds"));
        }
        if mqtt.topic_device_status.trim().is_empty() {
            return Err(ConfigError::Missing("mqtt.topic_device_status"));
        }
        if mqtt.topic_image_display.trim().is_empty() {
            return Err(ConfigError::Missing("mqtt.topic_image_display"));
        }
        if mqtt.topic_device_status == mqtt.topic_image_display {
            return Err(invalid(
                "mqtt.topic_image_display",
                "status and display topics must differ",
            ));
        }
        if mqtt.device_id_placeholder.is_empty() {
            return Err(invalid("mqtt.device_id_placeholder", "must not be empty"));
        }
        if let Some(id) = &self.device.id {
            if id.trim().is_empty() {
                return Err(invalid("device.id", "must not be blank"));
            }
        }

        if self.screen.width == 0 || self.screen.height == 0 {
            return Err(invalid("screen", "width and height must be non-zero"));
        }
        if self.screen.driver == PanelDriver::File && self.screen.output_path.is_none() {
            return Err(ConfigError::Missing("screen.output_path"));
        }

        if self.timing.dedup_ttl_secs == 0 {
            return Err(invalid("timing.dedup_ttl_secs", "must be non-zero"));
        }
        if self.timing.heartbeat_secs == 0 {
            return Err(invalid("timing.heartbeat_secs", "must be non-zero"));
        }

        debug!("Configuration validated");
        Ok(())
    }

    /// Configured device id, or the primary MAC when none is set
    pub fn resolve_device_id(&self) -> Result<String, ConfigError> {
        match &self.device.id {
            Some(id) => Ok(id.clone()),
            None => crate::discovery::NetworkInfo::discover()
                .map(|network| network.primary_mac)
                .map_err(|e| ConfigError::DeviceId(e.to_string())),
        }
    }

    /// Client id, generated once per process when not configured
    pub fn client_id(&self) -> String {
        self.mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| format!("einkframe-{}", uuid::Uuid::new_v4()))
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}
