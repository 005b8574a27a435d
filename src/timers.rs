//! Tokio-backed countdown tickers.
//!
//! Each ticker is a task that sends a [`GatewayEvent::PresenceTick`] into the
//! gateway loop once per period. Tasks never touch sensor state themselves.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, trace};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::gateway::GatewayEvent;
use crate::presence::{SensorKey, TickScheduler};

pub struct TimerManager {
    timers: HashMap<SensorKey, JoinHandle<()>>,
    period: Duration,
    event_tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl TimerManager {
    pub fn new(event_tx: mpsc::UnboundedSender<GatewayEvent>, period: Duration) -> Self {
        TimerManager {
            timers: HashMap::new(),
            period,
            event_tx,
        }
    }

    #[cfg(test)]
    pub fn active_count(&self) -> usize {
        self.timers.len()
    }
}

impl TickScheduler for TimerManager {
    fn start(&mut self, key: &SensorKey, episode: u64) {
        self.cancel(key);

        let event_tx = self.event_tx.clone();
        let period = self.period;
        let tick_key = key.clone();
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let event = GatewayEvent::PresenceTick {
                    key: tick_key.clone(),
                    episode,
                };
                if event_tx.send(event).is_err() {
                    break;
                }
            }
        });

        self.timers.insert(key.clone(), handle);
        debug!("Ticker started for {} (episode {})", key, episode);
    }

    fn cancel(&mut self, key: &SensorKey) {
        if let Some(handle) = self.timers.remove(key) {
            handle.abort();
            debug!("Ticker cancelled for {}", key);
        }
    }

    fn cancel_all(&mut self) {
        for (key, handle) in self.timers.drain() {
            handle.abort();
            trace!("Ticker cancelled for {} (shutdown)", key);
        }
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
