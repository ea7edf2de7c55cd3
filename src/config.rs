// Configuration module for the Bean bridge

use std::env;

use config::{Environment, File};
use serde::{Deserialize, Serialize};

use crate::plugin::Options;

const DEFAULT_CONFIG_PATH: &str = "/config/options.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub bluetooth: BluetoothConfig,
    /// Device options applied at startup, until the hub sends its own.
    #[serde(default)]
    pub device: Options,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// Hub identifier of this device, used in every topic.
    pub device: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BluetoothConfig {
    #[serde(default)]
    pub adapter: Option<String>,
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "meshblu-bean".to_string()
}

fn default_topic_prefix() -> String {
    "meshblu".to_string()
}

/// `BEAN_CONFIG`, or the add-on options file.
pub fn config_path() -> String {
    env::var("BEAN_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
}

/// Load the file at `path` (if present), overridden by `BEAN_*` variables
/// such as `BEAN_MQTT__HOST`.
pub fn load_config(path: &str) -> Result<Config, config::ConfigError> {
    config::Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("BEAN")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}
