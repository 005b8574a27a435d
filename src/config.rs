use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde_derive::Deserialize;

use crate::address::HardwareAddress;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub transport: Option<TransportConfig>,
    pub store: Option<StoreConfig>,
    pub device: Option<DeviceConfig>,
    pub button: Option<ButtonConfig>,
    pub outputs: Option<Vec<OutputConfig>>,
    pub presence: Option<Vec<PresenceConfig>>,
    pub sensors: Option<Vec<SensorConfig>>,
    pub commands: Option<HashMap<String, Vec<CommandSpec>>>,
    pub topics: Option<TopicConfig>,
    pub probe: Option<ProbeConfig>,
    pub timers: Option<TimerConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub keep_alive_seconds: Option<u64>,
    pub channel_capacity: Option<usize>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct TransportConfig {
    /// `host:port` of the frame codec speaking JSON lines.
    pub address: Option<String>,
    pub settle_ms: Option<u64>,
}

impl TransportConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms.unwrap_or(300))
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
}

/// Pin setup written to every newly associated module.
#[derive(Deserialize, Debug, Default, Clone)]
pub struct DeviceConfig {
    pub button_pin: Option<String>,
    pub pull_up_mask: Option<u16>,
    pub change_detect_mask: Option<u16>,
    pub sample_rate_ms: Option<u16>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PressPolicyKind {
    /// Every press toggles the primary button output.
    #[default]
    Toggle,
    /// Short press advances to the next output, long press turns all off.
    Hold,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ButtonConfig {
    pub lockout_ms: Option<u64>,
    pub policy: Option<PressPolicyKind>,
    pub long_press_ms: Option<u64>,
    pub announce: Option<bool>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputOwner {
    Button,
    Bus,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    /// Topic leaf, e.g. `order_ready`.
    pub name: String,
    pub pin: String,
    pub owner: OutputOwner,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PresenceKind {
    Bin,
    Glass,
    Seat,
}

impl PresenceKind {
    pub fn default_threshold(&self) -> u16 {
        match self {
            PresenceKind::Bin | PresenceKind::Glass => 200,
            PresenceKind::Seat => 0,
        }
    }

    pub fn default_countdown(&self) -> u32 {
        match self {
            PresenceKind::Bin => 10,
            PresenceKind::Glass => 20,
            PresenceKind::Seat => 300,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct PresenceConfig {
    /// Analog channel as reported in samples, e.g. `AD0`.
    pub channel: String,
    pub kind: PresenceKind,
    /// Table or bin number the channel is wired to.
    pub id: u32,
    pub threshold: Option<u16>,
    pub countdown_seconds: Option<u32>,
    /// Only samples from this module, when set.
    pub address: Option<HardwareAddress>,
}

impl PresenceConfig {
    pub fn threshold(&self) -> u16 {
        self.threshold.unwrap_or(self.kind.default_threshold())
    }

    pub fn countdown(&self) -> u32 {
        self.countdown_seconds
            .unwrap_or(self.kind.default_countdown())
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct SensorConfig {
    pub name: String,
    pub class: String,
    pub address: HardwareAddress,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: String,
    /// Two-letter AT mnemonic sent to the module.
    pub at: String,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct TopicConfig {
    pub sensor_command: Option<String>,
    pub module_control: Option<String>,
    pub module_status: Option<String>,
    pub sensor_data: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ProbeConfig {
    pub timeout_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct TimerConfig {
    pub tick_ms: Option<u64>,
}

impl AppConfig {
    pub fn transport(&self) -> TransportConfig {
        self.transport.clone().unwrap_or_default()
    }

    pub fn store_path(&self) -> PathBuf {
        self.store
            .as_ref()
            .and_then(|s| s.path.clone())
            .unwrap_or_else(|| PathBuf::from("associations.json"))
    }

    pub fn device(&self) -> DeviceConfig {
        self.device.clone().unwrap_or_default()
    }

    pub fn button(&self) -> ButtonConfig {
        self.button.clone().unwrap_or_default()
    }

    pub fn outputs(&self) -> Vec<OutputConfig> {
        self.outputs.clone().unwrap_or_else(|| {
            vec![
                OutputConfig {
                    name: "ready_to_order".to_string(),
                    pin: "D1".to_string(),
                    owner: OutputOwner::Button,
                },
                OutputConfig {
                    name: "order_ready".to_string(),
                    pin: "D2".to_string(),
                    owner: OutputOwner::Bus,
                },
            ]
        })
    }

    pub fn presence(&self) -> Vec<PresenceConfig> {
        self.presence.clone().unwrap_or_default()
    }

    pub fn sensors(&self) -> Vec<SensorConfig> {
        self.sensors.clone().unwrap_or_default()
    }

    pub fn commands(&self) -> HashMap<String, Vec<CommandSpec>> {
        self.commands.clone().unwrap_or_default()
    }

    pub fn topics(&self) -> TopicConfig {
        self.topics.clone().unwrap_or_default()
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(
            self.probe
                .as_ref()
                .and_then(|p| p.timeout_ms)
                .unwrap_or(2000),
        )
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(
            self.timers
                .as_ref()
                .and_then(|t| t.tick_ms)
                .unwrap_or(1000),
        )
    }
}
