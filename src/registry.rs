//! Hardware address -> table association.
//!
//! The registry is owned by the gateway loop, so every mutation is already
//! serialized. Persistence runs on its own task: mutations publish a snapshot
//! into a `watch` channel and the writer stores the newest one it sees.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::address::HardwareAddress;
use crate::config::AppConfig;
use crate::frame::{self, OutboundFrame};
use crate::transport::FrameTransport;

pub type TableId = u32;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAssociation {
    pub hardware_address: HardwareAddress,
    pub table_id: TableId,
    pub human_label: Option<String>,
    pub last_seen: DateTime<Utc>,
}

/// On-disk layout of the association store.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub associations: BTreeMap<HardwareAddress, DeviceAssociation>,
    pub next_table_id: TableId,
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        StoreSnapshot {
            associations: BTreeMap::new(),
            next_table_id: 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store is corrupt: {0}")]
    Format(#[from] serde_json::Error),
    #[error("store is inconsistent: {0}")]
    Invalid(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("broadcast address {0} cannot be associated")]
    Broadcast(HardwareAddress),
    #[error("no table ids left to assign")]
    Exhausted,
}

/// Pin setup written to a module the first time it is seen.
#[derive(Clone, Debug)]
pub struct DeviceProfile {
    pub button_pin: String,
    pub pull_up_mask: u16,
    pub change_detect_mask: u16,
    pub analog_pins: Vec<String>,
    pub sample_rate_ms: Option<u16>,
    pub settle: Duration,
}

impl DeviceProfile {
    pub fn from_config(config: &AppConfig) -> Self {
        let device = config.device();
        let mut analog_pins: Vec<String> = config
            .presence()
            .iter()
            .filter_map(|p| frame::analog_pin(&p.channel))
            .collect();
        analog_pins.sort();
        analog_pins.dedup();
        DeviceProfile {
            button_pin: device.button_pin.unwrap_or_else(|| "D0".to_string()),
            pull_up_mask: device.pull_up_mask.unwrap_or(0x10),
            change_detect_mask: device.change_detect_mask.unwrap_or(0x01),
            analog_pins,
            sample_rate_ms: device.sample_rate_ms,
            settle: config.transport().settle(),
        }
    }

    /// Configuration commands in the order they must be applied.
    pub fn commands(&self, destination: HardwareAddress) -> Vec<OutboundFrame> {
        let mut commands = vec![
            OutboundFrame::at(destination, &self.button_pin, vec![frame::PIN_DIGITAL_INPUT]),
            OutboundFrame::at(
                destination,
                frame::PULL_UP,
                self.pull_up_mask.to_be_bytes().to_vec(),
            ),
        ];
        for pin in &self.analog_pins {
            commands.push(OutboundFrame::at(
                destination,
                pin,
                vec![frame::PIN_ANALOG_INPUT],
            ));
        }
        commands.push(OutboundFrame::at(
            destination,
            frame::CHANGE_DETECTION,
            self.change_detect_mask.to_be_bytes().to_vec(),
        ));
        if let Some(rate) = self.sample_rate_ms {
            commands.push(OutboundFrame::at(
                destination,
                frame::SAMPLE_RATE,
                rate.to_be_bytes().to_vec(),
            ));
        }
        commands.push(OutboundFrame::query(destination, frame::APPLY_CHANGES));
        commands
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Resolved {
    pub association: DeviceAssociation,
    pub created: bool,
}

struct StoreWriter {
    path: PathBuf,
    tx: watch::Sender<StoreSnapshot>,
    task: JoinHandle<()>,
}

pub struct AssociationRegistry {
    associations: HashMap<HardwareAddress, DeviceAssociation>,
    next_table_id: TableId,
    profile: DeviceProfile,
    transport: Arc<dyn FrameTransport>,
    store: Option<StoreWriter>,
}

impl AssociationRegistry {
    /// Registry without a backing store.
    pub fn in_memory(profile: DeviceProfile, transport: Arc<dyn FrameTransport>) -> Self {
        AssociationRegistry {
            associations: HashMap::new(),
            next_table_id: 1,
            profile,
            transport,
            store: None,
        }
    }

    /// Load the store at `path` and start its writer task.
    ///
    /// A missing or unreadable store is not fatal: the registry starts empty
    /// with the counter at 1.
    pub async fn restore(
        path: impl Into<PathBuf>,
        profile: DeviceProfile,
        transport: Arc<dyn FrameTransport>,
    ) -> Self {
        let path = path.into();
        let snapshot = match load(&path).await.and_then(|s| s.map(validate).transpose()) {
            Ok(Some(snapshot)) => {
                info!(
                    "Restored {} associations from {}",
                    snapshot.associations.len(),
                    path.display()
                );
                snapshot
            }
            Ok(None) => {
                info!("No association store at {}, starting empty", path.display());
                StoreSnapshot::default()
            }
            Err(err) => {
                warn!(
                    "Ignoring association store {}: {}; starting empty",
                    path.display(),
                    err
                );
                StoreSnapshot::default()
            }
        };

        let next_table_id = snapshot.next_table_id;
        let associations = snapshot
            .associations
            .into_values()
            .map(|a| (a.hardware_address, a))
            .collect();

        let mut registry = AssociationRegistry {
            associations,
            next_table_id,
            profile,
            transport,
            store: None,
        };
        let (tx, rx) = watch::channel(registry.snapshot());
        let task = tokio::spawn(run_writer(path.clone(), rx));
        registry.store = Some(StoreWriter { path, tx, task });
        registry
    }

    pub fn resolve(&self, address: &HardwareAddress) -> Option<TableId> {
        self.associations.get(address).map(|a| a.table_id)
    }

    pub fn get(&self, address: &HardwareAddress) -> Option<&DeviceAssociation> {
        self.associations.get(address)
    }

    pub fn address_of(&self, table_id: TableId) -> Option<HardwareAddress> {
        self.associations
            .values()
            .find(|a| a.table_id == table_id)
            .map(|a| a.hardware_address)
    }

    pub fn associations(&self) -> impl Iterator<Item = &DeviceAssociation> {
        self.associations.values()
    }

    pub fn next_table_id(&self) -> TableId {
        self.next_table_id
    }

    pub fn len(&self) -> usize {
        self.associations.len()
    }

    /// Look up `address`, creating and configuring a new association on
    /// first sight.
    pub fn resolve_or_create(
        &mut self,
        address: HardwareAddress,
        label: Option<&str>,
    ) -> Result<Resolved, RegistryError> {
        if address.is_broadcast() {
            return Err(RegistryError::Broadcast(address));
        }
        let now = Utc::now();

        if let Some(existing) = self.associations.get_mut(&address) {
            existing.last_seen = now;
            if let Some(l) = label {
                existing.human_label = Some(l.to_string());
            }
            let association = existing.clone();
            // Flushes last_seen too.
            self.persist();
            return Ok(Resolved {
                association,
                created: false,
            });
        }

        let table_id = self.next_table_id;
        self.next_table_id = table_id.checked_add(1).ok_or(RegistryError::Exhausted)?;
        let association = DeviceAssociation {
            hardware_address: address,
            table_id,
            human_label: label.map(str::to_string),
            last_seen: now,
        };
        self.associations.insert(address, association.clone());
        info!(
            "Associated {} with table {}{}",
            address,
            association.table_id,
            label.map(|l| format!(" ({l})")).unwrap_or_default()
        );

        self.configure(address);
        self.persist();
        Ok(Resolved {
            association,
            created: true,
        })
    }

    /// Record the label a module reports for itself. Unknown addresses are ignored.
    pub fn set_label(&mut self, address: &HardwareAddress, label: &str) -> bool {
        let Some(existing) = self.associations.get_mut(address) else {
            return false;
        };
        if label.is_empty() || existing.human_label.as_deref() == Some(label) {
            return false;
        }
        debug!("Table {} is labelled {:?}", existing.table_id, label);
        existing.human_label = Some(label.to_string());
        self.persist();
        true
    }

    fn configure(&self, address: HardwareAddress) {
        for command in self.profile.commands(address) {
            if let Err(err) = self.transport.submit(command, self.profile.settle) {
                warn!("Could not configure {}: {}", address, err);
                return;
            }
        }
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            associations: self
                .associations
                .values()
                .map(|a| (a.hardware_address, a.clone()))
                .collect(),
            next_table_id: self.next_table_id,
        }
    }

    /// Hand the current state to the writer task. Never waits on disk.
    pub fn persist(&self) {
        if let Some(store) = &self.store {
            store.tx.send_replace(self.snapshot());
        }
    }

    /// Flush the current state and wait for the writer task to finish.
    pub async fn close(mut self) {
        let snapshot = self.snapshot();
        let Some(store) = self.store.take() else {
            return;
        };
        store.tx.send_replace(snapshot);
        drop(store.tx);
        if let Err(err) = store.task.await {
            warn!("Association writer for {} failed: {}", store.path.display(), err);
        }
    }
}

async fn load(path: &Path) -> Result<Option<StoreSnapshot>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Reject stores that would break table id uniqueness, and lift the counter
/// above every stored id.
fn validate(mut snapshot: StoreSnapshot) -> Result<StoreSnapshot, StoreError> {
    let mut seen = HashMap::new();
    for association in snapshot.associations.values() {
        if association.table_id == 0 {
            return Err(StoreError::Invalid(format!(
                "{} has table id 0",
                association.hardware_address
            )));
        }
        if let Some(other) = seen.insert(association.table_id, association.hardware_address) {
            return Err(StoreError::Invalid(format!(
                "table {} is held by both {} and {}",
                association.table_id, other, association.hardware_address
            )));
        }
    }
    let highest = seen.keys().copied().max().unwrap_or(0);
    let above_highest = highest
        .checked_add(1)
        .ok_or_else(|| StoreError::Invalid(format!("table id {highest} leaves no room")))?;
    snapshot.next_table_id = snapshot.next_table_id.max(above_highest);
    Ok(snapshot)
}

/// Write to a sibling temp file, then rename over the store.
async fn write_snapshot(path: &Path, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(snapshot)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn run_writer(path: PathBuf, mut rx: watch::Receiver<StoreSnapshot>) {
    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();
        match write_snapshot(&path, &snapshot).await {
            Ok(()) => debug!(
                "Saved {} associations to {}",
                snapshot.associations.len(),
                path.display()
            ),
            // The next mutation sends a fresh snapshot, which retries.
            Err(err) => warn!("Failed to save associations to {}: {}", path.display(), err),
        }
    }
}
