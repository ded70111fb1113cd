//! YAML configuration file parsing and validation.
//!
//! The schema is strict (`deny_unknown_fields` everywhere); a typo in a key
//! is a startup error, not a silently ignored setting.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing_subscriber::filter::LevelFilter;

/// Placeholder in default topic templates, replaced with the lowercased
/// thing key.
pub const THING_KEY_PATTERN: &str = "{THING_KEY}";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub hue_bridge: HueBridgeConfig,
    pub mqtt: MqttConfig,
    pub things: BTreeMap<String, ThingConfig>,
    #[serde(default)]
    pub thing_defaults: ThingDefaults,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HueBridgeConfig {
    /// Hostname or IP of the Hue bridge
    pub host: String,

    /// Application key created via the bridge link button
    pub app_key: String,

    /// Quiet interval for coalescing group child updates (1-5000 ms)
    #[serde(default = "default_group_debounce_ms")]
    pub group_debounce_ms: u64,

    /// Interval between full state refreshes (60-5000 s)
    #[serde(default = "default_refresh_interval_s")]
    pub refresh_interval_s: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    /// Hostname or IP of the MQTT broker
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default)]
    pub client_id: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_keepalive_s")]
    pub keepalive_s: u64,

    /// Quality of service for subscriptions and publishes (0-2)
    #[serde(default = "default_qos")]
    pub qos: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThingConfig {
    /// Hue resource id (UUID) of the light or room/zone
    pub hue_id: String,

    /// MQTT command topic (listen to)
    #[serde(default)]
    pub cmd_topic: Option<String>,

    /// MQTT state topic (send to)
    #[serde(default)]
    pub state_topic: Option<String>,

    #[serde(default)]
    pub retain: Option<bool>,

    /// Published on the state topic when the thing is closed
    #[serde(default)]
    pub last_will: Option<String>,

    /// Dim levels below this floor switch the thing off instead (1-100)
    #[serde(default)]
    pub min_brightness: Option<f64>,

    /// Quiet interval for coalescing state updates (1-5000 ms)
    #[serde(default)]
    pub state_debounce_ms: Option<u64>,
}

/// Fallbacks applied to every thing that does not set the field itself.
/// Topic templates may contain [`THING_KEY_PATTERN`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThingDefaults {
    #[serde(default)]
    pub cmd_topic: Option<String>,

    #[serde(default)]
    pub state_topic: Option<String>,

    #[serde(default)]
    pub retain: Option<bool>,

    #[serde(default)]
    pub last_will: Option<String>,

    #[serde(default)]
    pub min_brightness: Option<f64>,

    #[serde(default)]
    pub state_debounce_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Debug, Default, Deserialize, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("{0}")]
    Invalid(String),
}

impl AppConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        let config: Self = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "hue_bridge.group_debounce_ms",
            self.hue_bridge.group_debounce_ms,
            1,
            5000,
        )?;
        check_range(
            "hue_bridge.refresh_interval_s",
            self.hue_bridge.refresh_interval_s,
            60,
            5000,
        )?;
        check_range("mqtt.qos", u64::from(self.mqtt.qos), 0, 2)?;

        validate_thing_fields(
            "thing_defaults",
            self.thing_defaults.min_brightness,
            self.thing_defaults.state_debounce_ms,
        )?;
        for (name, thing) in &self.things {
            validate_thing_fields(
                &format!("things.{name}"),
                thing.min_brightness,
                thing.state_debounce_ms,
            )?;
        }

        Ok(())
    }
}

fn validate_thing_fields(
    context: &str,
    min_brightness: Option<f64>,
    state_debounce_ms: Option<u64>,
) -> Result<(), ConfigError> {
    if let Some(min) = min_brightness {
        if !(1.0..=100.0).contains(&min) {
            return Err(ConfigError::Invalid(format!(
                "{context}.min_brightness must be within 1..=100 (got {min})"
            )));
        }
    }
    if let Some(debounce) = state_debounce_ms {
        check_range(&format!("{context}.state_debounce_ms"), debounce, 1, 5000)?;
    }
    Ok(())
}

fn check_range(field: &str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{field} must be within {min}..={max} (got {value})"
        )))
    }
}

/// Expand a topic template for a given thing key.
pub fn expand_topic(template: &str, thing_key: &str) -> String {
    template.replace(THING_KEY_PATTERN, &thing_key.to_lowercase())
}

const fn default_group_debounce_ms() -> u64 {
    300
}

const fn default_refresh_interval_s() -> u64 {
    1800
}

const fn default_mqtt_port() -> u16 {
    1883
}

const fn default_keepalive_s() -> u64 {
    60
}

const fn default_qos() -> u8 {
    2
}
