//! Bus -> transport direction.
//!
//! Three subscriptions: sensor commands (validated against an allow-list and
//! forwarded as AT commands), module control (availability checks and common
//! commands) and one control topic per bus-owned table output.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use log::{debug, info, warn};
use thiserror::Error;

use crate::address::HardwareAddress;
use crate::button::{self, ControlError};
use crate::config::{AppConfig, CommandSpec, OutputOwner, SensorConfig};
use crate::frame::OutboundFrame;
use crate::gateway::Core;
use crate::messages::{
    self, BusMessage, CommandStatus, ControlMessage, ModuleControlMessage, SensorAvailability,
    SensorCommandMessage,
};
use crate::registry::TableId;
use crate::transport::TransportError;

/// Commands every target accepts, with their AT mnemonics.
pub const COMMON_COMMANDS: [(&str, &str); 3] =
    [("RESET", "FR"), ("GET_STATUS", "AI"), ("GET_CONFIG", "IS")];

pub const CHECK_AVAILABILITY: &str = "CHECK_AVAILABILITY";

/// Command class for modules known only through association.
pub const TABLE_CLASS: &str = "table";

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("malformed command payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("unknown sensor: {0}")]
    UnknownTarget(String),
    #[error("command {command} is not permitted for {class} sensors")]
    NotPermitted { command: String, class: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug)]
struct Target {
    address: HardwareAddress,
    class: String,
}

pub struct BusBridge {
    sensor_command_topic: String,
    module_control_topic: String,
    bus_outputs: Vec<String>,
    sensors: Vec<SensorConfig>,
    commands: HashMap<String, Vec<CommandSpec>>,
}

impl BusBridge {
    pub fn new(config: &AppConfig) -> Self {
        let topics = config.topics();
        BusBridge {
            sensor_command_topic: topics
                .sensor_command
                .unwrap_or_else(|| "restaurant/sensors/command".to_string()),
            module_control_topic: topics
                .module_control
                .unwrap_or_else(|| "restaurant/modules/control".to_string()),
            bus_outputs: config
                .outputs()
                .into_iter()
                .filter(|o| o.owner == OutputOwner::Bus)
                .map(|o| o.name)
                .collect(),
            sensors: config.sensors(),
            commands: config.commands(),
        }
    }

    /// Topic filters the bus client must subscribe to.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut filters = vec![
            self.sensor_command_topic.clone(),
            self.module_control_topic.clone(),
        ];
        filters.extend(self.bus_outputs.iter().map(|o| messages::table_control_filter(o)));
        filters
    }

    pub fn handle(&self, core: &mut Core, message: BusMessage) {
        debug!("Bus message on {}: {}", message.topic, message.payload);
        if message.topic == self.sensor_command_topic {
            self.on_sensor_command(core, &message.payload);
        } else if message.topic == self.module_control_topic {
            self.on_module_control(core, &message.payload);
        } else if let Some((table_id, output)) = messages::parse_table_topic(&message.topic) {
            if !self.bus_outputs.iter().any(|o| o == output) {
                debug!("Ignoring {}: not a bus-owned output", message.topic);
                return;
            }
            if let Err(err) = self.on_table_control(core, table_id, output, &message.payload) {
                warn!("Control message on {} rejected: {}", message.topic, err);
            }
        } else {
            debug!("No handler for {}", message.topic);
        }
    }

    fn on_sensor_command(&self, core: &mut Core, payload: &str) {
        let sensor_id = serde_json::from_str::<serde_json::Value>(payload)
            .ok()
            .and_then(|v| {
                ["sensorId", "targetAddress"]
                    .iter()
                    .find_map(|field| v.get(*field)?.as_str().map(str::to_string))
            })
            .unwrap_or_else(|| "unknown".to_string());

        match self.forward_sensor_command(core, payload) {
            Ok((command, class)) => {
                info!("Sent {} to sensor {}", command, sensor_id);
                core.publish_status(
                    &sensor_id,
                    CommandStatus::CommandSent {
                        command,
                        sensor_type: class,
                    },
                );
            }
            Err(err) => {
                warn!("Sensor command for {} failed: {}", sensor_id, err);
                core.publish_status(
                    &sensor_id,
                    CommandStatus::Error {
                        error: err.to_string(),
                    },
                );
            }
        }
    }

    /// Validate and send; returns the command name and the target's class.
    fn forward_sensor_command(
        &self,
        core: &Core,
        payload: &str,
    ) -> Result<(String, String), CommandError> {
        let message: SensorCommandMessage = serde_json::from_str(payload)?;
        let target = self.target(core, &message.sensor_id)?;
        let command = message.command.trim().to_uppercase();
        let at = self
            .allowed(&target.class, &command)
            .ok_or_else(|| CommandError::NotPermitted {
                command: command.clone(),
                class: target.class.clone(),
            })?;
        core.transport
            .send(OutboundFrame::at(target.address, &at, message.parameters))?;
        Ok((command, target.class))
    }

    /// Configured sensors by name or address, then associated tables by address.
    fn target(&self, core: &Core, sensor_id: &str) -> Result<Target, CommandError> {
        let parsed = sensor_id.parse::<HardwareAddress>().ok();
        if let Some(sensor) = self
            .sensors
            .iter()
            .find(|s| s.name == sensor_id || Some(s.address) == parsed)
        {
            return Ok(Target {
                address: sensor.address,
                class: sensor.class.clone(),
            });
        }
        match parsed {
            Some(address) if core.registry.resolve(&address).is_some() => Ok(Target {
                address,
                class: TABLE_CLASS.to_string(),
            }),
            _ => Err(CommandError::UnknownTarget(sensor_id.to_string())),
        }
    }

    /// AT mnemonic for `command` if `class` may receive it.
    fn allowed(&self, class: &str, command: &str) -> Option<String> {
        COMMON_COMMANDS
            .iter()
            .find(|(name, _)| *name == command)
            .map(|(_, at)| at.to_string())
            .or_else(|| {
                self.commands
                    .get(class)?
                    .iter()
                    .find(|allowed| allowed.name.eq_ignore_ascii_case(command))
                    .map(|allowed| allowed.at.clone())
            })
    }

    fn on_module_control(&self, core: &mut Core, payload: &str) {
        let message: ModuleControlMessage = match serde_json::from_str(payload) {
            Ok(message) => message,
            Err(err) => {
                warn!("Malformed module control payload: {}", err);
                core.publish_status(
                    "system",
                    CommandStatus::Error {
                        error: CommandError::Payload(err).to_string(),
                    },
                );
                return;
            }
        };
        let action = message.action.trim().to_uppercase();

        if action == CHECK_AVAILABILITY {
            self.check_availability(core);
            return;
        }

        let module_id = message.module_id.unwrap_or_default();
        let result = self
            .target(core, &module_id)
            .and_then(|target| {
                let at = COMMON_COMMANDS
                    .iter()
                    .find(|(name, _)| *name == action)
                    .map(|(_, at)| *at)
                    .ok_or_else(|| CommandError::NotPermitted {
                        command: action.clone(),
                        class: target.class.clone(),
                    })?;
                core.transport
                    .send(OutboundFrame::at(target.address, at, message.parameters))?;
                Ok(())
            });
        match result {
            Ok(()) => core.publish_status(
                &module_id,
                CommandStatus::ControlCommandSent {
                    action: action.clone(),
                },
            ),
            Err(err) => {
                warn!("Module control {} for {:?} failed: {}", action, module_id, err);
                core.publish_status(
                    &module_id,
                    CommandStatus::Error {
                        error: err.to_string(),
                    },
                );
            }
        }
    }

    /// Every configured sensor plus every associated table.
    fn probe_targets(&self, core: &Core) -> Vec<(String, HardwareAddress)> {
        let mut targets: Vec<(String, HardwareAddress)> = self
            .sensors
            .iter()
            .map(|s| (s.name.clone(), s.address))
            .collect();
        let mut tables: Vec<_> = core
            .registry
            .associations()
            .map(|a| (format!("table_{}", a.table_id), a.hardware_address))
            .collect();
        tables.sort();
        targets.extend(tables);
        targets
    }

    fn check_availability(&self, core: &mut Core) {
        let targets = self.probe_targets(core);
        if !core.transport_online {
            let now = Utc::now();
            let sensors: BTreeMap<String, SensorAvailability> = targets
                .into_iter()
                .map(|(identity, address)| {
                    (
                        identity,
                        SensorAvailability {
                            address,
                            available: false,
                            node_id: None,
                            error: Some(TransportError::Unavailable.to_string()),
                            last_check: now,
                        },
                    )
                })
                .collect();
            core.publish_availability(sensors);
            return;
        }
        if core.probes.in_progress() {
            debug!("Availability check already running");
            return;
        }
        let transport = core.transport.clone();
        if let Some(report) = core.probes.begin(targets, transport.as_ref()) {
            core.publish_availability(report);
        }
    }

    /// Drive a bus-owned output. An explicit `table` in the payload wins over
    /// the table id in the topic.
    fn on_table_control(
        &self,
        core: &mut Core,
        topic_table: TableId,
        output: &str,
        payload: &str,
    ) -> Result<(), ControlError> {
        let (state, payload_table) = match serde_json::from_str::<ControlMessage>(payload) {
            Ok(message) => (message.state, message.table),
            Err(_) if !payload.trim_start().starts_with('{') => {
                (serde_json::Value::String(payload.to_string()), None)
            }
            Err(err) => return Err(ControlError::Payload(err.to_string())),
        };
        let on = button::parse_state(&state)?;
        let table_id = match payload_table {
            Some(value) => parse_table_id(&value)?,
            None => topic_table,
        };
        if table_id != topic_table {
            debug!(
                "Payload table {} overrides topic table {}",
                table_id, topic_table
            );
        }
        let address = core
            .registry
            .address_of(table_id)
            .ok_or(ControlError::UnknownTable(table_id))?;
        core.table(table_id, address).on_control_command(output, on)
    }
}

fn parse_table_id(value: &serde_json::Value) -> Result<TableId, ControlError> {
    let parsed = match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| TableId::try_from(n).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| ControlError::Payload(format!("invalid table id {value}")))
}
