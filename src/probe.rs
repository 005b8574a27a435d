//! Availability probes.
//!
//! A probe sends `NI` to a module and waits for either its response or a
//! timeout, whichever comes first. The loser is deregistered: a response
//! aborts the timeout task, and a timeout removes the pending entry so a late
//! response has nothing left to resolve.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::address::HardwareAddress;
use crate::frame::{self, OutboundFrame};
use crate::gateway::GatewayEvent;
use crate::messages::SensorAvailability;
use crate::transport::FrameTransport;

struct PendingProbe {
    identities: Vec<String>,
    timeout: JoinHandle<()>,
}

pub struct ProbeTracker {
    round: u64,
    pending: HashMap<HardwareAddress, PendingProbe>,
    results: BTreeMap<String, SensorAvailability>,
    timeout: Duration,
    event_tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl ProbeTracker {
    pub fn new(event_tx: mpsc::UnboundedSender<GatewayEvent>, timeout: Duration) -> Self {
        ProbeTracker {
            round: 0,
            pending: HashMap::new(),
            results: BTreeMap::new(),
            timeout,
            event_tx,
        }
    }

    pub fn in_progress(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Probe every `(identity, address)` target.
    ///
    /// Returns the finished report straight away when nothing is left
    /// waiting, e.g. no targets or every send failed.
    pub fn begin(
        &mut self,
        targets: Vec<(String, HardwareAddress)>,
        transport: &dyn FrameTransport,
    ) -> Option<BTreeMap<String, SensorAvailability>> {
        self.cancel_all();
        self.round += 1;
        self.results.clear();
        info!("Checking availability of {} sensors", targets.len());

        for (identity, address) in targets {
            if let Some(pending) = self.pending.get_mut(&address) {
                pending.identities.push(identity);
                continue;
            }
            let probe = OutboundFrame::query(address, frame::NODE_IDENTIFIER);
            if let Err(err) = transport.send(probe) {
                warn!("Probe to {} not sent: {}", address, err);
                self.record(vec![identity], address, false, None, Some(err.to_string()));
                continue;
            }
            let timeout = self.spawn_timeout(address);
            self.pending.insert(
                address,
                PendingProbe {
                    identities: vec![identity],
                    timeout,
                },
            );
        }
        self.finish_if_done()
    }

    fn spawn_timeout(&self, address: HardwareAddress) -> JoinHandle<()> {
        let tx = self.event_tx.clone();
        let round = self.round;
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(GatewayEvent::ProbeTimeout { round, address });
        })
    }

    /// A `NI` response arrived. Returns the report if this settled the round.
    pub fn on_response(
        &mut self,
        address: HardwareAddress,
        node_id: Option<String>,
    ) -> Option<BTreeMap<String, SensorAvailability>> {
        let pending = self.pending.remove(&address)?;
        pending.timeout.abort();
        debug!("Probe answered by {}", address);
        self.record(pending.identities, address, true, node_id, None);
        self.finish_if_done()
    }

    pub fn on_timeout(
        &mut self,
        round: u64,
        address: HardwareAddress,
    ) -> Option<BTreeMap<String, SensorAvailability>> {
        if round != self.round {
            return None;
        }
        let pending = self.pending.remove(&address)?;
        debug!("Probe to {} timed out", address);
        self.record(pending.identities, address, false, None, None);
        self.finish_if_done()
    }

    pub fn cancel_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.timeout.abort();
        }
    }

    fn record(
        &mut self,
        identities: Vec<String>,
        address: HardwareAddress,
        available: bool,
        node_id: Option<String>,
        error: Option<String>,
    ) {
        let now = Utc::now();
        for identity in identities {
            self.results.insert(
                identity,
                SensorAvailability {
                    address,
                    available,
                    node_id: node_id.clone(),
                    error: error.clone(),
                    last_check: now,
                },
            );
        }
    }

    fn finish_if_done(&mut self) -> Option<BTreeMap<String, SensorAvailability>> {
        if self.pending.is_empty() {
            Some(std::mem::take(&mut self.results))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTransport;

    fn addr(n: u64) -> HardwareAddress {
        HardwareAddress::new(0x0013_A200_0000_0000 | n)
    }

    async fn next_timeout(
        rx: &mut mpsc::UnboundedReceiver<GatewayEvent>,
    ) -> (u64, HardwareAddress) {
        match rx.recv().await {
            Some(GatewayEvent::ProbeTimeout { round, address }) => (round, address),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_probe_is_unavailable_and_deregistered() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = RecordingTransport::default();
        let mut probes = ProbeTracker::new(tx, Duration::from_millis(2000));

        let started = tokio::time::Instant::now();
        assert!(probes.begin(vec![("seat".to_string(), addr(1))], &transport).is_none());
        assert_eq!(transport.commands(), vec![("NI".to_string(), vec![])]);

        let (round, address) = next_timeout(&mut rx).await;
        assert_eq!(started.elapsed(), Duration::from_millis(2000));
        let report = probes.on_timeout(round, address).unwrap();
        assert!(!report["seat"].available);
        assert!(!probes.in_progress());

        // A late answer resolves nothing.
        assert!(probes.on_response(addr(1), Some("SEAT".to_string())).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_wins_race_and_cancels_timeout() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = RecordingTransport::default();
        let mut probes = ProbeTracker::new(tx, Duration::from_millis(2000));

        probes.begin(
            vec![("bin".to_string(), addr(1)), ("seat".to_string(), addr(2))],
            &transport,
        );
        assert!(probes.on_response(addr(1), Some("BIN-1".to_string())).is_none());
        assert_eq!(probes.pending_count(), 1);

        let (round, address) = next_timeout(&mut rx).await;
        assert_eq!(address, addr(2));
        let report = probes.on_timeout(round, address).unwrap();
        assert!(report["bin"].available);
        assert_eq!(report["bin"].node_id.as_deref(), Some("BIN-1"));
        assert!(!report["seat"].available);

        // The answered probe's timeout was aborted and never fires.
        let extra = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn test_offline_transport_reports_at_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = RecordingTransport::offline();
        let mut probes = ProbeTracker::new(tx, Duration::from_millis(2000));

        let report = probes
            .begin(vec![("bin".to_string(), addr(1))], &transport)
            .unwrap();
        assert!(!report["bin"].available);
        assert!(report["bin"].error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_from_previous_round_is_ignored() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = RecordingTransport::default();
        let mut probes = ProbeTracker::new(tx, Duration::from_millis(2000));

        probes.begin(vec![("bin".to_string(), addr(1))], &transport);
        probes.begin(vec![("bin".to_string(), addr(1))], &transport);
        assert!(probes.on_timeout(1, addr(1)).is_none());
        assert!(probes.in_progress());
    }
}
