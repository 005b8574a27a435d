//! Inbound frame dispatch.

use std::time::Instant;

use chrono::Utc;
use log::{debug, info, trace, warn};

use crate::address::HardwareAddress;
use crate::config::{AppConfig, PresenceConfig, PresenceKind};
use crate::frame::{self, CommandResponse, InboundFrame, IoSample};
use crate::gateway::Core;
use crate::messages::{PresenceTopics, SampleData, SensorData};
use crate::presence::{PresenceEvent, SensorKey};
use crate::registry::{DeviceAssociation, RegistryError};

pub struct FrameRouter {
    presence: Vec<PresenceConfig>,
    sensor_data_topic: Option<String>,
}

impl FrameRouter {
    pub fn new(config: &AppConfig) -> Self {
        let sensor_data_topic = match config.topics().sensor_data {
            Some(topic) if topic.is_empty() => None,
            Some(topic) => Some(topic),
            None => Some("restaurant/sensors/data".to_string()),
        };
        FrameRouter {
            presence: config.presence(),
            sensor_data_topic,
        }
    }

    pub fn route(&self, core: &mut Core, frame: InboundFrame, now: Instant) {
        trace!("Routing {} frame", frame.kind());
        match frame {
            InboundFrame::Join {
                source,
                node_identifier,
            } => {
                let label = node_identifier.as_deref();
                if let Some(association) = self.associate(core, source, label) {
                    info!("Module {} joined as table {}", source, association.table_id);
                }
            }
            InboundFrame::IoSample(sample) => self.on_sample(core, sample, now),
            InboundFrame::CommandResponse(response) => self.on_response(core, response),
            InboundFrame::TransmitStatus {
                frame_id,
                delivery_status,
            } => {
                if delivery_status != 0 {
                    warn!(
                        "Frame {:?} was not delivered (status 0x{:02X})",
                        frame_id, delivery_status
                    );
                } else {
                    trace!("Frame {:?} delivered", frame_id);
                }
            }
            InboundFrame::Other { frame_type } => {
                debug!("Dropping unhandled frame type 0x{:02X}", frame_type);
            }
        }
    }

    /// Resolve `source`, creating the association and the table controller
    /// on first sight.
    fn associate(
        &self,
        core: &mut Core,
        source: HardwareAddress,
        label: Option<&str>,
    ) -> Option<DeviceAssociation> {
        match core.registry.resolve_or_create(source, label) {
            Ok(resolved) => {
                if resolved.created {
                    debug!("Setting up outputs for new table {}", resolved.association.table_id);
                }
                core.table(resolved.association.table_id, source);
                Some(resolved.association)
            }
            Err(err @ RegistryError::Broadcast(_)) => {
                debug!("{}", err);
                None
            }
            Err(err) => {
                warn!("Cannot associate {}: {}", source, err);
                None
            }
        }
    }

    fn on_sample(&self, core: &mut Core, sample: IoSample, now: Instant) {
        let Some(association) = self.associate(core, sample.source, None) else {
            return;
        };

        if let Some(topic) = &self.sensor_data_topic {
            let data = SensorData {
                sensor_id: sample.source,
                timestamp: Utc::now(),
                data: SampleData {
                    analog_samples: &sample.analog,
                    digital_samples: &sample.digital,
                    source_address: sample.source,
                },
            };
            core.publish_json(topic, &data);
        }

        let pins = core.button.pins.clone();
        if let Some(level) = sample.digital_any(&pins) {
            let controller = core.table(association.table_id, sample.source);
            if let Some(action) = controller.on_button_sample(level, now) {
                info!("Table {}: {:?}", association.table_id, action);
            }
        }

        for (channel, raw) in &sample.analog {
            let Some(route) = self.presence_route(sample.source, channel) else {
                continue;
            };
            let key = SensorKey::new(sample.source, channel);
            let event = core
                .presence
                .sample(&key, *raw, route.threshold(), route.countdown());
            if let Some(event) = event {
                publish_presence(core, route, &event);
            }
        }
    }

    fn on_response(&self, core: &mut Core, response: CommandResponse) {
        let Some(source) = response.source else {
            if !response.is_ok() {
                warn!(
                    "Local command {} failed with status 0x{:02X}",
                    response.command, response.status
                );
            }
            return;
        };
        if !response.is_ok() {
            warn!(
                "Module {} rejected {} (status 0x{:02X})",
                source, response.command, response.status
            );
        }
        if response.command != frame::NODE_IDENTIFIER {
            return;
        }

        let node_id = Some(response.text()).filter(|t| !t.is_empty());
        if response.is_ok() {
            if let Some(label) = &node_id {
                core.registry.set_label(&source, label);
            }
        }
        if let Some(report) = core.probes.on_response(source, node_id) {
            core.publish_availability(report);
        }
    }

    /// One countdown tick from the timer task.
    pub fn on_tick(&self, core: &mut Core, key: &SensorKey, episode: u64) {
        let Some(event) = core.presence.tick(key, episode) else {
            return;
        };
        match self.presence_route(key.address, &key.channel) {
            Some(route) => publish_presence(core, route, &event),
            None => debug!("No presence route for {}", key),
        }
    }

    /// Presence entry for a channel; one pinned to `address` beats a generic one.
    fn presence_route(&self, address: HardwareAddress, channel: &str) -> Option<&PresenceConfig> {
        let matching = |p: &&PresenceConfig| p.channel.eq_ignore_ascii_case(channel);
        self.presence
            .iter()
            .filter(matching)
            .find(|p| p.address == Some(address))
            .or_else(|| {
                self.presence
                    .iter()
                    .filter(matching)
                    .find(|p| p.address.is_none())
            })
    }
}

fn publish_presence(core: &Core, route: &PresenceConfig, event: &PresenceEvent) {
    let topics = PresenceTopics::new(route.kind, route.id);
    match event {
        PresenceEvent::Started { remaining } => {
            core.publish(&topics.state, "true");
            core.publish(&topics.timer, remaining.to_string());
        }
        PresenceEvent::Tick { remaining } => {
            core.publish(&topics.timer, remaining.to_string());
        }
        // The last tick already published a zero timer.
        PresenceEvent::Expired => {
            // A seat stays occupied after its countdown runs out.
            if route.kind != PresenceKind::Seat {
                core.publish(&topics.state, "false");
            }
        }
        PresenceEvent::Cleared { after_expiry } => {
            if !after_expiry || route.kind == PresenceKind::Seat {
                core.publish(&topics.state, "false");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestRig, rig};
    use std::time::Duration;

    const ADDR: HardwareAddress = HardwareAddress::new(0x0013_A200_41FB_6063);

    fn io(source: HardwareAddress, digital: &[(&str, u8)], analog: &[(&str, u16)]) -> InboundFrame {
        InboundFrame::IoSample(IoSample {
            source,
            digital: digital.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            analog: analog.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        })
    }

    const PRESENCE: &str = r#"
        [topics]
        sensor_data = ""

        [[presence]]
        channel = "AD0"
        kind = "glass"
        id = 1

        [[presence]]
        channel = "AD2"
        kind = "seat"
        id = 1

        [[presence]]
        channel = "AD2"
        kind = "seat"
        id = 2
        address = "0013A20041FB6064"
    "#;

    #[tokio::test]
    async fn test_unknown_address_is_associated_once() {
        let TestRig {
            config,
            mut core,
            transport,
            ..
        } = rig("");
        let router = FrameRouter::new(&config);
        let unknown: HardwareAddress = "AA:00:00:00:00:00:00:01".parse().unwrap();
        let expected = core.registry.next_table_id();
        let t0 = Instant::now();

        router.route(&mut core, io(unknown, &[("DIO0", 1)], &[]), t0);
        let table = core.registry.resolve(&unknown);
        assert_eq!(table, Some(expected));
        let configured = transport.sent().len();
        // Device setup (D0, PR, IC, AC) then output setup (D1, D2, AC).
        let commands: Vec<String> = transport.commands().into_iter().map(|(c, _)| c).collect();
        assert_eq!(commands, vec!["D0", "PR", "IC", "AC", "D1", "D2", "AC"]);

        router.route(&mut core, io(unknown, &[("DIO0", 1)], &[]), t0 + Duration::from_millis(50));
        router.route(&mut core, io(unknown, &[("D0", 1)], &[]), t0 + Duration::from_millis(90));
        assert_eq!(core.registry.resolve(&unknown), table);
        assert_eq!(core.registry.len(), 1);
        assert_eq!(transport.sent().len(), configured);
    }

    #[tokio::test]
    async fn test_button_sample_reaches_controller_under_either_name() {
        let TestRig {
            config,
            mut core,
            transport,
            bus,
            ..
        } = rig("");
        let router = FrameRouter::new(&config);
        let t0 = Instant::now();

        router.route(&mut core, io(ADDR, &[("DIO0", 1)], &[]), t0);
        transport.clear();
        router.route(&mut core, io(ADDR, &[("D0", 0)], &[]), t0 + Duration::from_millis(10));

        assert_eq!(transport.commands(), vec![("D1".to_string(), vec![frame::PIN_OUTPUT_HIGH])]);
        assert_eq!(bus.json_on("restaurant/tables/1/ready_to_order").len(), 1);
        assert_eq!(
            bus.json_on("restaurant/sensors/data")[0]["sensorId"],
            "0013A20041FB6063"
        );
    }

    #[tokio::test]
    async fn test_broadcast_frames_are_not_associated() {
        let TestRig {
            config,
            mut core,
            transport,
            ..
        } = rig("");
        let router = FrameRouter::new(&config);
        router.route(
            &mut core,
            io(HardwareAddress::UNKNOWN, &[("DIO0", 0)], &[]),
            Instant::now(),
        );
        router.route(
            &mut core,
            InboundFrame::Join {
                source: HardwareAddress::BROADCAST,
                node_identifier: None,
            },
            Instant::now(),
        );
        assert_eq!(core.registry.len(), 0);
        assert!(core.tables.is_empty());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_join_records_label() {
        let TestRig { config, mut core, .. } = rig("");
        let router = FrameRouter::new(&config);
        router.route(
            &mut core,
            InboundFrame::Join {
                source: ADDR,
                node_identifier: Some("TABLE-7".to_string()),
            },
            Instant::now(),
        );
        let association = core.registry.get(&ADDR).unwrap();
        assert_eq!(association.human_label.as_deref(), Some("TABLE-7"));
        assert!(core.tables.contains_key(&association.table_id));
    }

    #[tokio::test]
    async fn test_node_identifier_response_updates_label() {
        let TestRig { config, mut core, .. } = rig("");
        let router = FrameRouter::new(&config);
        router.route(&mut core, io(ADDR, &[("DIO0", 1)], &[]), Instant::now());
        router.route(
            &mut core,
            InboundFrame::CommandResponse(CommandResponse {
                source: Some(ADDR),
                frame_id: Some(3),
                command: "NI".to_string(),
                status: 0,
                data: b"BAR".to_vec(),
            }),
            Instant::now(),
        );
        assert_eq!(core.registry.get(&ADDR).unwrap().human_label.as_deref(), Some("BAR"));
    }

    #[tokio::test]
    async fn test_analog_channels_use_their_route() {
        let TestRig {
            config,
            mut core,
            bus,
            ..
        } = rig(PRESENCE);
        let router = FrameRouter::new(&config);
        let other: HardwareAddress = "0013A20041FB6064".parse().unwrap();
        let now = Instant::now();

        router.route(&mut core, io(ADDR, &[], &[("AD0", 250), ("AD2", 1)]), now);
        router.route(&mut core, io(other, &[], &[("AD2", 1)]), now);

        assert_eq!(bus.on("restaurant/tables/1/active"), vec!["true"]);
        assert_eq!(bus.on("restaurant/tables/1/timer"), vec!["20"]);
        assert_eq!(bus.on("restaurant/tables/1/occupied"), vec!["true"]);
        assert_eq!(bus.on("restaurant/tables/1/occupied_timer"), vec!["300"]);
        assert_eq!(bus.on("restaurant/tables/2/occupied"), vec!["true"]);
        assert_eq!(core.presence.active_countdowns(), 3);

        router.route(&mut core, io(ADDR, &[], &[("AD0", 10), ("AD2", 0)]), now);
        assert_eq!(bus.on("restaurant/tables/1/active"), vec!["true", "false"]);
        assert_eq!(bus.on("restaurant/tables/1/occupied"), vec!["true", "false"]);
        assert_eq!(core.presence.active_countdowns(), 1);
    }

    #[tokio::test]
    async fn test_seat_expiry_keeps_occupied() {
        let TestRig {
            config,
            mut core,
            bus,
            ..
        } = rig(
            r#"
            [[presence]]
            channel = "AD2"
            kind = "seat"
            id = 4
            countdown_seconds = 0
            "#,
        );
        let router = FrameRouter::new(&config);
        router.route(&mut core, io(ADDR, &[], &[("AD2", 5)]), Instant::now());
        let key = SensorKey::new(ADDR, "AD2");
        let episode = 1;
        router.on_tick(&mut core, &key, episode);

        assert_eq!(bus.on("restaurant/tables/4/occupied"), vec!["true"]);
        assert_eq!(bus.on("restaurant/tables/4/occupied_timer"), vec!["0"]);
        assert!(core.presence.state(&key).unwrap().expired);

        router.route(&mut core, io(ADDR, &[], &[("AD2", 0)]), Instant::now());
        assert_eq!(bus.on("restaurant/tables/4/occupied"), vec!["true", "false"]);
    }

    #[tokio::test]
    async fn test_bin_episode_publishes_each_value_once() {
        let TestRig {
            config,
            mut core,
            bus,
            ..
        } = rig(
            r#"
            [topics]
            sensor_data = ""

            [[presence]]
            channel = "AD0"
            kind = "bin"
            id = 5
            countdown_seconds = 1
            "#,
        );
        let router = FrameRouter::new(&config);
        let key = SensorKey::new(ADDR, "AD0");

        router.route(&mut core, io(ADDR, &[], &[("AD0", 300)]), Instant::now());
        router.on_tick(&mut core, &key, 1);
        router.on_tick(&mut core, &key, 1);
        router.route(&mut core, io(ADDR, &[], &[("AD0", 10)]), Instant::now());

        assert_eq!(bus.on("restaurant/buffet/5/timer"), vec!["1", "0"]);
        assert_eq!(bus.on("restaurant/buffet/5/active"), vec!["true", "false"]);
    }

    #[tokio::test]
    async fn test_failed_and_unknown_frames_are_dropped() {
        let TestRig {
            config,
            mut core,
            bus,
            transport,
            ..
        } = rig("");
        let router = FrameRouter::new(&config);
        router.route(&mut core, InboundFrame::Other { frame_type: 0x90 }, Instant::now());
        router.route(
            &mut core,
            InboundFrame::TransmitStatus {
                frame_id: Some(1),
                delivery_status: 0x21,
            },
            Instant::now(),
        );
        router.route(
            &mut core,
            InboundFrame::CommandResponse(CommandResponse {
                source: Some(ADDR),
                frame_id: Some(2),
                command: "D1".to_string(),
                status: 4,
                data: Vec::new(),
            }),
            Instant::now(),
        );
        assert_eq!(bus.count(), 0);
        assert!(transport.sent().is_empty());
        assert_eq!(core.registry.len(), 0);
    }
}
