use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::HardwareAddress;
use crate::config::PresenceKind;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
}

/// Publishing half of the message bus.
///
/// Like the transport, publishing only enqueues; delivery happens on the
/// bus client's own task.
pub trait MessageBus: Send + Sync {
    fn publish(&self, topic: &str, payload: String) -> Result<(), BusError>;
}

/// Inbound message from one of our subscriptions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

pub fn restaurant_topic(family: &str, id: u32, option: &str) -> String {
    format!("restaurant/{family}/{id}/{option}")
}

pub fn table_topic(table_id: u32, option: &str) -> String {
    restaurant_topic("tables", table_id, option)
}

/// Control topic filter for one bus-owned output across all tables.
pub fn table_control_filter(output: &str) -> String {
    format!("restaurant/tables/+/{output}")
}

/// `restaurant/tables/{id}/{output}` -> `(id, output)`.
pub fn parse_table_topic(topic: &str) -> Option<(u32, &str)> {
    let mut parts = topic.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("restaurant"), Some("tables"), Some(id), Some(output), None) => {
            Some((id.parse().ok()?, output))
        }
        _ => None,
    }
}

/// Topic names for one presence sensor class.
pub struct PresenceTopics {
    pub state: String,
    pub timer: String,
}

impl PresenceTopics {
    pub fn new(kind: PresenceKind, id: u32) -> Self {
        let (family, state, timer) = match kind {
            PresenceKind::Bin => ("buffet", "active", "timer"),
            PresenceKind::Glass => ("tables", "active", "timer"),
            PresenceKind::Seat => ("tables", "occupied", "occupied_timer"),
        };
        PresenceTopics {
            state: restaurant_topic(family, id, state),
            timer: restaurant_topic(family, id, timer),
        }
    }
}

pub fn on_off(on: bool) -> &'static str {
    if on { "on" } else { "off" }
}

/// Payload published on `restaurant/tables/{id}/{output}`.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct LedStateMessage {
    pub table: u32,
    pub led: String,
    pub state: String,
    pub xbee_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Control payload. `state` may be `"on"`/`"off"`, `"true"`/`"false"` or a bool.
#[derive(Debug, Deserialize)]
pub struct ControlMessage {
    pub state: serde_json::Value,
    pub table: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorCommandMessage {
    #[serde(alias = "targetAddress")]
    pub sensor_id: String,
    pub command: String,
    #[serde(default)]
    pub parameters: Vec<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleControlMessage {
    pub module_id: Option<String>,
    pub action: String,
    #[serde(default)]
    pub parameters: Vec<u8>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatusMessage<T> {
    pub module_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: T,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status")]
pub enum CommandStatus {
    #[serde(rename = "command_sent", rename_all = "camelCase")]
    CommandSent {
        command: String,
        sensor_type: String,
    },
    #[serde(rename = "control_command_sent")]
    ControlCommandSent { action: String },
    #[serde(rename = "error")]
    Error { error: String },
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SensorAvailability {
    pub address: HardwareAddress,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub last_check: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityReport {
    pub status: &'static str,
    pub serial_connected: bool,
    pub sensors: BTreeMap<String, SensorAvailability>,
}

impl AvailabilityReport {
    pub fn new(serial_connected: bool, sensors: BTreeMap<String, SensorAvailability>) -> Self {
        AvailabilityReport {
            status: "sensor_availability",
            serial_connected,
            sensors,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorData<'a> {
    pub sensor_id: HardwareAddress,
    pub timestamp: DateTime<Utc>,
    pub data: SampleData<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleData<'a> {
    pub analog_samples: &'a BTreeMap<String, u16>,
    pub digital_samples: &'a BTreeMap<String, u8>,
    pub source_address: HardwareAddress,
}
