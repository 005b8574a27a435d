//! Per-table push button and status LEDs.
//!
//! Outputs are split by owner. Button-owned outputs change only on presses
//! and are announced on the bus; bus-owned outputs change only on control
//! messages and are never echoed back. Neither path can reach the other's pins.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, info, warn};
use thiserror::Error;

use crate::address::HardwareAddress;
use crate::config::{AppConfig, OutputConfig, OutputOwner, PressPolicyKind};
use crate::frame::{self, OutboundFrame};
use crate::messages::{self, LedStateMessage, MessageBus};
use crate::registry::TableId;
use crate::transport::FrameTransport;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("output `{0}` does not exist")]
    UnknownOutput(String),
    #[error("output `{0}` is driven by the table button")]
    ButtonOwned(String),
    #[error("unrecognised state {0}")]
    State(String),
    #[error("no module is associated with table {0}")]
    UnknownTable(TableId),
    #[error("malformed control payload: {0}")]
    Payload(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PressPolicy {
    /// Each accepted press toggles the first button-owned output.
    Toggle,
    /// Measured on release: short press lights the next button-owned output,
    /// a hold of at least `long_press` turns all of them off.
    Hold { long_press: Duration },
}

#[derive(Clone, Debug)]
pub struct ButtonSettings {
    pub pins: Vec<String>,
    pub lockout: Duration,
    pub policy: PressPolicy,
    pub announce: bool,
    pub button_outputs: Vec<OutputConfig>,
    pub bus_outputs: Vec<OutputConfig>,
    pub settle: Duration,
}

impl ButtonSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let button = config.button();
        let device = config.device();
        let policy = match button.policy.unwrap_or_default() {
            PressPolicyKind::Toggle => PressPolicy::Toggle,
            PressPolicyKind::Hold => PressPolicy::Hold {
                long_press: Duration::from_millis(button.long_press_ms.unwrap_or(1000)),
            },
        };
        let (button_outputs, bus_outputs) = config
            .outputs()
            .into_iter()
            .partition(|o| o.owner == OutputOwner::Button);
        ButtonSettings {
            pins: frame::sample_names(device.button_pin.as_deref().unwrap_or("D0")),
            lockout: Duration::from_millis(button.lockout_ms.unwrap_or(500)),
            policy,
            announce: button.announce.unwrap_or(true),
            button_outputs,
            bus_outputs,
            settle: config.transport().settle(),
        }
    }
}

/// What an accepted button edge did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PressAction {
    Toggled { output: String, on: bool },
    Advanced { output: String },
    AllOff,
}

pub struct ButtonLedController {
    table_id: TableId,
    address: HardwareAddress,
    settings: Arc<ButtonSettings>,
    transport: Arc<dyn FrameTransport>,
    bus: Arc<dyn MessageBus>,
    led_states: BTreeMap<String, bool>,
    /// Pull-up input: high while released.
    button_level_high: bool,
    button_held: bool,
    press_started_at: Option<Instant>,
    last_press: Option<Instant>,
    cursor: usize,
}

impl ButtonLedController {
    /// Configure every output pin as a low digital output before any writes.
    pub fn new(
        table_id: TableId,
        address: HardwareAddress,
        settings: Arc<ButtonSettings>,
        transport: Arc<dyn FrameTransport>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        let led_states = settings
            .button_outputs
            .iter()
            .chain(settings.bus_outputs.iter())
            .map(|o| (o.name.clone(), false))
            .collect();
        let controller = ButtonLedController {
            table_id,
            address,
            settings,
            transport,
            bus,
            led_states,
            button_level_high: true,
            button_held: false,
            press_started_at: None,
            last_press: None,
            cursor: 0,
        };
        controller.configure_outputs();
        controller
    }

    fn configure_outputs(&self) {
        let pins = self
            .settings
            .button_outputs
            .iter()
            .chain(self.settings.bus_outputs.iter())
            .map(|o| o.pin.as_str());
        for pin in pins {
            let command =
                OutboundFrame::at(self.address, pin, vec![frame::PIN_OUTPUT_LOW]);
            if let Err(err) = self.transport.submit(command, self.settings.settle) {
                warn!("Could not configure {} on table {}: {}", pin, self.table_id, err);
                return;
            }
        }
        let apply = OutboundFrame::query(self.address, frame::APPLY_CHANGES);
        if let Err(err) = self.transport.submit(apply, self.settings.settle) {
            warn!("Could not apply output setup on table {}: {}", self.table_id, err);
        }
    }

    pub fn led_state(&self, output: &str) -> Option<bool> {
        self.led_states.get(output).copied()
    }

    #[cfg(test)]
    pub fn button_held(&self) -> bool {
        self.button_held
    }

    /// Feed one raw button level (0 = pressed, pull-up).
    pub fn on_button_sample(&mut self, level: u8, now: Instant) -> Option<PressAction> {
        let high = level != 0;
        let was_high = std::mem::replace(&mut self.button_level_high, high);
        match (was_high, high) {
            (true, false) => self.on_press(now),
            (false, true) => self.on_release(now),
            _ => None,
        }
    }

    fn on_press(&mut self, now: Instant) -> Option<PressAction> {
        if self.button_held {
            return None;
        }
        if let Some(last) = self.last_press {
            if now.saturating_duration_since(last) < self.settings.lockout {
                debug!("Table {}: press inside lockout ignored", self.table_id);
                return None;
            }
        }
        self.last_press = Some(now);

        match self.settings.policy {
            PressPolicy::Toggle => {
                let output = self.settings.button_outputs.first()?.clone();
                let on = !self.led_state(&output.name).unwrap_or(false);
                self.drive_button_output(&output, on);
                Some(PressAction::Toggled {
                    output: output.name,
                    on,
                })
            }
            PressPolicy::Hold { .. } => {
                self.button_held = true;
                self.press_started_at = Some(now);
                None
            }
        }
    }

    fn on_release(&mut self, now: Instant) -> Option<PressAction> {
        let PressPolicy::Hold { long_press } = self.settings.policy else {
            return None;
        };
        if !self.button_held {
            return None;
        }
        self.button_held = false;
        let held = self
            .press_started_at
            .take()
            .map(|started| now.saturating_duration_since(started))
            .unwrap_or_default();

        if held >= long_press {
            info!("Table {}: long press ({:?}), all outputs off", self.table_id, held);
            for output in self.settings.button_outputs.clone() {
                if self.led_state(&output.name) == Some(true) {
                    self.drive_button_output(&output, false);
                }
            }
            Some(PressAction::AllOff)
        } else {
            self.advance()
        }
    }

    /// Turn off the lit output and light the next one.
    fn advance(&mut self) -> Option<PressAction> {
        let outputs = self.settings.button_outputs.clone();
        if outputs.is_empty() {
            return None;
        }
        let current = &outputs[self.cursor % outputs.len()];
        if self.led_state(&current.name) == Some(true) {
            self.drive_button_output(current, false);
            self.cursor = (self.cursor + 1) % outputs.len();
        }
        let next = &outputs[self.cursor % outputs.len()];
        self.drive_button_output(next, true);
        Some(PressAction::Advanced {
            output: next.name.clone(),
        })
    }

    fn drive_button_output(&mut self, output: &OutputConfig, on: bool) {
        self.write(output, on);
        if self.settings.announce {
            self.announce(output, on);
        }
    }

    /// Apply a bus control message to a bus-owned output. Never publishes.
    pub fn on_control_command(&mut self, output: &str, on: bool) -> Result<(), ControlError> {
        let Some(target) = self
            .settings
            .bus_outputs
            .iter()
            .find(|o| o.name == output)
            .cloned()
        else {
            if self.settings.button_outputs.iter().any(|o| o.name == output) {
                return Err(ControlError::ButtonOwned(output.to_string()));
            }
            return Err(ControlError::UnknownOutput(output.to_string()));
        };
        self.write(&target, on);
        Ok(())
    }

    fn write(&mut self, output: &OutputConfig, on: bool) {
        debug!(
            "Table {}: {} ({}) -> {}",
            self.table_id,
            output.name,
            output.pin,
            messages::on_off(on)
        );
        if let Err(err) = self
            .transport
            .send(OutboundFrame::pin_level(self.address, &output.pin, on))
        {
            warn!(
                "Could not drive {} on table {}: {}",
                output.pin, self.table_id, err
            );
        }
        self.led_states.insert(output.name.clone(), on);
    }

    fn announce(&self, output: &OutputConfig, on: bool) {
        let message = LedStateMessage {
            table: self.table_id,
            led: output.pin.clone(),
            state: messages::on_off(on).to_string(),
            xbee_id: self.address.to_string(),
            timestamp: Utc::now(),
        };
        let topic = messages::table_topic(self.table_id, &output.name);
        match serde_json::to_string(&message) {
            Ok(payload) => {
                if let Err(err) = self.bus.publish(&topic, payload) {
                    warn!("{}", err);
                }
            }
            Err(err) => warn!("Could not encode LED state for {}: {}", topic, err),
        }
    }
}

/// Parse a control state: `"on"`/`"off"`, `"true"`/`"false"`, `1`/`0` or a bool.
pub fn parse_state(value: &serde_json::Value) -> Result<bool, ControlError> {
    match value {
        serde_json::Value::Bool(b) => Ok(*b),
        serde_json::Value::Number(n) => match n.as_u64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(ControlError::State(n.to_string())),
        },
        serde_json::Value::String(s) => match s.trim().to_lowercase().as_str() {
            "on" | "true" | "1" => Ok(true),
            "off" | "false" | "0" => Ok(false),
            other => Err(ControlError::State(other.to_string())),
        },
        other => Err(ControlError::State(other.to_string())),
    }
}
