use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::address::HardwareAddress;
use crate::bridge::BusBridge;
use crate::button::{ButtonLedController, ButtonSettings};
use crate::config::AppConfig;
use crate::frame::InboundFrame;
use crate::messages::{
    AvailabilityReport, BusMessage, MessageBus, ModuleStatusMessage, SensorAvailability,
};
use crate::presence::{PresenceEngine, SensorKey};
use crate::probe::ProbeTracker;
use crate::registry::{AssociationRegistry, TableId};
use crate::router::FrameRouter;
use crate::timers::TimerManager;
use crate::transport::FrameTransport;

/// Everything the gateway loop reacts to.
#[derive(Debug)]
pub enum GatewayEvent {
    Frame(InboundFrame),
    Bus(BusMessage),
    PresenceTick { key: SensorKey, episode: u64 },
    ProbeTimeout { round: u64, address: HardwareAddress },
    TransportClosed(String),
}

/// State shared by the frame router and the bus bridge. Only the gateway
/// loop holds it, so no locking is needed.
pub struct Core {
    pub registry: AssociationRegistry,
    pub presence: PresenceEngine<TimerManager>,
    pub tables: HashMap<TableId, ButtonLedController>,
    pub probes: ProbeTracker,
    pub button: Arc<ButtonSettings>,
    pub transport: Arc<dyn FrameTransport>,
    pub bus: Arc<dyn MessageBus>,
    pub transport_online: bool,
    pub status_topic: String,
}

impl Core {
    pub fn new(
        config: &AppConfig,
        registry: AssociationRegistry,
        transport: Arc<dyn FrameTransport>,
        transport_online: bool,
        bus: Arc<dyn MessageBus>,
        events: mpsc::UnboundedSender<GatewayEvent>,
    ) -> Self {
        Core {
            registry,
            presence: PresenceEngine::new(TimerManager::new(events.clone(), config.tick_period())),
            tables: HashMap::new(),
            probes: ProbeTracker::new(events, config.probe_timeout()),
            button: Arc::new(ButtonSettings::from_config(config)),
            transport,
            bus,
            transport_online,
            status_topic: config
                .topics()
                .module_status
                .unwrap_or_else(|| "restaurant/modules/status".to_string()),
        }
    }

    /// Controller for `table_id`, created (and its outputs configured) on first use.
    pub fn table(
        &mut self,
        table_id: TableId,
        address: HardwareAddress,
    ) -> &mut ButtonLedController {
        self.tables.entry(table_id).or_insert_with(|| {
            ButtonLedController::new(
                table_id,
                address,
                self.button.clone(),
                self.transport.clone(),
                self.bus.clone(),
            )
        })
    }

    pub fn publish(&self, topic: &str, payload: impl Into<String>) {
        if let Err(err) = self.bus.publish(topic, payload.into()) {
            warn!("{}", err);
        }
    }

    pub fn publish_json<T: Serialize>(&self, topic: &str, message: &T) {
        match serde_json::to_string(message) {
            Ok(payload) => self.publish(topic, payload),
            Err(err) => error!("Could not encode message for {}: {}", topic, err),
        }
    }

    pub fn publish_status<T: Serialize>(&self, module_id: &str, status: T) {
        let message = ModuleStatusMessage {
            module_id: module_id.to_string(),
            timestamp: Utc::now(),
            status,
        };
        self.publish_json(&self.status_topic, &message);
    }

    pub fn publish_availability(&self, sensors: BTreeMap<String, SensorAvailability>) {
        let report = AvailabilityReport::new(self.transport_online, sensors);
        self.publish_status("system", report);
    }

    /// Cancel timers and probes, then flush the registry.
    pub async fn shutdown(mut self) {
        debug!(
            "Stopping {} countdowns and {} pending probes",
            self.presence.active_countdowns(),
            self.probes.pending_count()
        );
        self.presence.shutdown();
        self.probes.cancel_all();
        self.registry.close().await;
    }
}

pub struct Gateway {
    core: Core,
    router: FrameRouter,
    bridge: BusBridge,
    events: mpsc::UnboundedReceiver<GatewayEvent>,
}

impl Gateway {
    pub fn new(
        config: &AppConfig,
        core: Core,
        events: mpsc::UnboundedReceiver<GatewayEvent>,
    ) -> Self {
        Gateway {
            core,
            router: FrameRouter::new(config),
            bridge: BusBridge::new(config),
            events,
        }
    }

    #[cfg(test)]
    pub fn core(&self) -> &Core {
        &self.core
    }

    /// Handle one event. Failures are logged inside the handlers and never
    /// stop the loop.
    pub fn handle(&mut self, event: GatewayEvent) {
        match event {
            GatewayEvent::Frame(frame) => {
                self.router.route(&mut self.core, frame, Instant::now());
            }
            GatewayEvent::Bus(message) => self.bridge.handle(&mut self.core, message),
            GatewayEvent::PresenceTick { key, episode } => {
                self.router.on_tick(&mut self.core, &key, episode);
            }
            GatewayEvent::ProbeTimeout { round, address } => {
                if let Some(report) = self.core.probes.on_timeout(round, address) {
                    self.core.publish_availability(report);
                }
            }
            GatewayEvent::TransportClosed(reason) => {
                if self.core.transport_online {
                    error!("Frame transport lost ({}); running degraded until restart", reason);
                }
                self.core.transport_online = false;
            }
        }
    }

    pub async fn run_loop(mut self, shutdown: impl Future<Output = ()>) {
        info!(
            "Gateway running with {} known tables (transport {})",
            self.core.registry.len(),
            if self.core.transport_online { "online" } else { "offline" }
        );
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        debug!("All event sources closed");
                        break;
                    }
                }
            }
        }
        self.core.shutdown().await;
        info!("Gateway stopped");
    }
}
