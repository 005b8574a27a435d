//! Recording doubles for the transport and the bus.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::frame::OutboundFrame;
use crate::gateway::{Core, GatewayEvent};
use crate::messages::{BusError, MessageBus};
use crate::registry::{AssociationRegistry, DeviceProfile};
use crate::transport::{FrameTransport, TransportError};

#[derive(Default)]
pub struct RecordingTransport {
    pub frames: Mutex<Vec<(OutboundFrame, Duration)>>,
    pub offline: bool,
}

impl RecordingTransport {
    pub fn offline() -> Self {
        RecordingTransport {
            offline: true,
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<OutboundFrame> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .map(|(f, _)| f.clone())
            .collect()
    }

    /// `(command, parameter)` pairs, in order.
    pub fn commands(&self) -> Vec<(String, Vec<u8>)> {
        self.sent()
            .into_iter()
            .map(|f| (f.command, f.parameter))
            .collect()
    }

    pub fn clear(&self) {
        self.frames.lock().unwrap().clear();
    }
}

impl FrameTransport for RecordingTransport {
    fn submit(&self, frame: OutboundFrame, settle: Duration) -> Result<(), TransportError> {
        if self.offline {
            return Err(TransportError::Unavailable);
        }
        self.frames.lock().unwrap().push((frame, settle));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingBus {
    pub published: Mutex<Vec<(String, String)>>,
}

impl RecordingBus {
    pub fn on(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn json_on(&self, topic: &str) -> Vec<serde_json::Value> {
        self.on(topic)
            .iter()
            .map(|p| serde_json::from_str(p).unwrap())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.published.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.published.lock().unwrap().clear();
    }
}

impl MessageBus for RecordingBus {
    fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }
}

pub fn config(extra: &str) -> AppConfig {
    toml::de::from_str(&format!("[mqtt]\nhost = \"localhost\"\n{extra}")).unwrap()
}

/// A gateway core wired to recording doubles.
pub struct TestRig {
    pub config: AppConfig,
    pub core: Core,
    pub transport: Arc<RecordingTransport>,
    pub bus: Arc<RecordingBus>,
    pub events: mpsc::UnboundedReceiver<GatewayEvent>,
}

pub fn rig(extra: &str) -> TestRig {
    build_rig(extra, RecordingTransport::default(), true)
}

pub fn offline_rig(extra: &str) -> TestRig {
    build_rig(extra, RecordingTransport::offline(), false)
}

fn build_rig(extra: &str, transport: RecordingTransport, online: bool) -> TestRig {
    let config = config(extra);
    let transport = Arc::new(transport);
    let bus = Arc::new(RecordingBus::default());
    let (tx, events) = mpsc::unbounded_channel();
    let registry =
        AssociationRegistry::in_memory(DeviceProfile::from_config(&config), transport.clone());
    let core = Core::new(&config, registry, transport.clone(), online, bus.clone(), tx);
    TestRig {
        config,
        core,
        transport,
        bus,
        events,
    }
}
