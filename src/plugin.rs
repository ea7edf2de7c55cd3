//! The hub-facing surface: device options, inbound envelopes, emitted
//! events and the JSON schemas advertised to the hub.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::color::ColorMessage;
use crate::protocol::ScratchBank;
use crate::transport::Target;

/// Shortest polling interval; a zero interval would keep the radio busy.
pub const MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Device options, as pushed by the hub in a config message.
///
/// The `config` crate lowercases keys, hence the lowercase aliases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    #[serde(alias = "beanuuid")]
    pub bean_uuid: String,
    #[serde(alias = "localname")]
    pub local_name: String,
    #[serde(alias = "broadcastaccel")]
    pub broadcast_accel: bool,
    #[serde(alias = "broadcasttemp")]
    pub broadcast_temp: bool,
    #[serde(rename = "broadcastRSSI", alias = "broadcastrssi")]
    pub broadcast_rssi: bool,
    #[serde(alias = "notifyscratch1")]
    pub notify_scratch1: bool,
    #[serde(alias = "notifyscratch2")]
    pub notify_scratch2: bool,
    #[serde(alias = "notifyscratch3")]
    pub notify_scratch3: bool,
    #[serde(alias = "notifyscratch4")]
    pub notify_scratch4: bool,
    #[serde(alias = "notifyscratch5")]
    pub notify_scratch5: bool,
    #[serde(alias = "broadcastaccelinterval")]
    pub broadcast_accel_interval: u64,
    #[serde(alias = "broadcasttempinterval")]
    pub broadcast_temp_interval: u64,
    #[serde(rename = "broadcastRSSIInterval", alias = "broadcastrssiinterval")]
    pub broadcast_rssi_interval: u64,
    pub timeout: u64,
    #[serde(alias = "blinkonconnect")]
    pub blink_on_connect: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            bean_uuid: String::new(),
            local_name: String::new(),
            broadcast_accel: false,
            broadcast_temp: false,
            broadcast_rssi: false,
            notify_scratch1: false,
            notify_scratch2: false,
            notify_scratch3: false,
            notify_scratch4: false,
            notify_scratch5: false,
            broadcast_accel_interval: 1000,
            broadcast_temp_interval: 1000,
            broadcast_rssi_interval: 1000,
            timeout: 30_000,
            blink_on_connect: true,
        }
    }
}

impl Options {
    pub fn target(&self) -> Target {
        Target::new(&self.bean_uuid, &self.local_name)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn accel_interval(&self) -> Duration {
        interval(self.broadcast_accel_interval)
    }

    pub fn temp_interval(&self) -> Duration {
        interval(self.broadcast_temp_interval)
    }

    pub fn rssi_interval(&self) -> Duration {
        interval(self.broadcast_rssi_interval)
    }

    pub fn scratch_banks(&self) -> Vec<ScratchBank> {
        let enabled = [
            self.notify_scratch1,
            self.notify_scratch2,
            self.notify_scratch3,
            self.notify_scratch4,
            self.notify_scratch5,
        ];
        ScratchBank::ALL
            .into_iter()
            .zip(enabled)
            .filter_map(|(bank, on)| on.then_some(bank))
            .collect()
    }
}

fn interval(millis: u64) -> Duration {
    Duration::from_millis(millis).max(MIN_INTERVAL)
}

/// What the plugin emits towards the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Data(Value),
    Error(String),
}

/// `{"payload": {...}}` as delivered on the message topic.
#[derive(Debug, Deserialize)]
pub struct MessageEnvelope {
    pub payload: ColorMessage,
}

/// `{"options": {...}}` as delivered on the config topic.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigEnvelope {
    #[serde(default)]
    pub options: Options,
}

pub fn message_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "color": { "type": "string", "required": true },
            "on": { "type": "boolean", "required": false }
        }
    })
}

pub fn options_schema() -> Value {
    let defaults = Options::default();
    let mut properties = serde_json::Map::new();
    let string = |default: &str| json!({ "type": "string", "required": true, "default": default });
    let boolean = |default: bool| json!({ "type": "boolean", "required": true, "default": default });
    let integer = |default: u64| json!({ "type": "integer", "required": true, "default": default });

    properties.insert("beanUuid".into(), string(&defaults.bean_uuid));
    properties.insert("localName".into(), string(&defaults.local_name));
    properties.insert("broadcastAccel".into(), boolean(defaults.broadcast_accel));
    properties.insert("broadcastTemp".into(), boolean(defaults.broadcast_temp));
    properties.insert("broadcastRSSI".into(), boolean(defaults.broadcast_rssi));
    for bank in ScratchBank::ALL {
        properties.insert(format!("notifyScratch{}", bank.number()), boolean(false));
    }
    properties.insert(
        "broadcastAccelInterval".into(),
        integer(defaults.broadcast_accel_interval),
    );
    properties.insert(
        "broadcastTempInterval".into(),
        integer(defaults.broadcast_temp_interval),
    );
    properties.insert(
        "broadcastRSSIInterval".into(),
        integer(defaults.broadcast_rssi_interval),
    );
    properties.insert("timeout".into(), integer(defaults.timeout));
    properties.insert("blinkOnConnect".into(), boolean(defaults.blink_on_connect));

    json!({ "type": "object", "properties": properties })
}
