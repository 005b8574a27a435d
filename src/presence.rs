//! Debounced presence detection with a one-shot countdown per sensor.
//!
//! Each sensor instance moves through `Idle -> Counting -> Expired`; a falling
//! edge from either active state returns it to `Idle`. Ticks come from a
//! [`TickScheduler`] and carry the episode they were started for, so a tick
//! that was already queued when its countdown got cancelled is dropped.

use std::collections::HashMap;
use std::fmt;

use log::{debug, trace};

use crate::address::HardwareAddress;

/// One analog channel on one module.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SensorKey {
    pub address: HardwareAddress,
    pub channel: String,
}

impl SensorKey {
    pub fn new(address: HardwareAddress, channel: &str) -> Self {
        SensorKey {
            address,
            channel: channel.to_uppercase(),
        }
    }
}

impl fmt::Display for SensorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.channel)
    }
}

/// Cancellable periodic callback, one per sensor key.
pub trait TickScheduler {
    /// Start ticking for `key`. Replaces any ticker already running for it.
    fn start(&mut self, key: &SensorKey, episode: u64);
    fn cancel(&mut self, key: &SensorKey);
    fn cancel_all(&mut self);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PresenceEvent {
    /// Rising edge; countdown starts at `remaining`.
    Started { remaining: u32 },
    Tick { remaining: u32 },
    /// Countdown ran out while the object is still present.
    Expired,
    /// Falling edge. `after_expiry` is set when the countdown had already
    /// run out.
    Cleared { after_expiry: bool },
}

#[cfg(test)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Counting,
    Expired,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceTimerState {
    pub present: bool,
    pub countdown_remaining: i64,
    pub countdown_active: bool,
    pub expired: bool,
    initial: u32,
    episode: u64,
}

impl PresenceTimerState {
    fn new(initial: u32) -> Self {
        PresenceTimerState {
            present: false,
            countdown_remaining: i64::from(initial),
            countdown_active: false,
            expired: false,
            initial,
            episode: 0,
        }
    }

    #[cfg(test)]
    pub fn phase(&self) -> Phase {
        match (self.countdown_active, self.expired) {
            (true, _) => Phase::Counting,
            (false, true) => Phase::Expired,
            (false, false) => Phase::Idle,
        }
    }
}

pub struct PresenceEngine<S> {
    states: HashMap<SensorKey, PresenceTimerState>,
    scheduler: S,
    episodes: u64,
}

impl<S: TickScheduler> PresenceEngine<S> {
    pub fn new(scheduler: S) -> Self {
        PresenceEngine {
            states: HashMap::new(),
            scheduler,
            episodes: 0,
        }
    }

    /// Feed one raw sample. `initial` is the countdown length for this
    /// sensor class and is only read on a rising edge.
    pub fn sample(
        &mut self,
        key: &SensorKey,
        raw: u16,
        threshold: u16,
        initial: u32,
    ) -> Option<PresenceEvent> {
        let above = raw > threshold;
        let state = self
            .states
            .entry(key.clone())
            .or_insert_with(|| PresenceTimerState::new(initial));

        match (above, state.present) {
            (true, false) => {
                // At most one countdown per sensor.
                if state.expired || state.countdown_active {
                    return None;
                }
                self.episodes += 1;
                state.present = true;
                state.initial = initial;
                state.countdown_remaining = i64::from(initial);
                state.countdown_active = true;
                state.episode = self.episodes;
                self.scheduler.start(key, state.episode);
                debug!("{} present, counting down from {}s", key, initial);
                Some(PresenceEvent::Started { remaining: initial })
            }
            (false, true) => {
                if state.countdown_active {
                    self.scheduler.cancel(key);
                }
                let after_expiry = state.expired;
                state.present = false;
                state.countdown_active = false;
                state.expired = false;
                state.countdown_remaining = i64::from(state.initial);
                debug!("{} cleared", key);
                Some(PresenceEvent::Cleared { after_expiry })
            }
            _ => None,
        }
    }

    /// One scheduler tick for `key`. Ticks from a cancelled episode are ignored.
    pub fn tick(&mut self, key: &SensorKey, episode: u64) -> Option<PresenceEvent> {
        let Some(state) = self.states.get_mut(key) else {
            return None;
        };
        if !state.countdown_active || state.episode != episode {
            trace!("Dropping stale tick for {} (episode {})", key, episode);
            return None;
        }
        state.countdown_remaining -= 1;
        if state.countdown_remaining < 0 {
            self.scheduler.cancel(key);
            state.countdown_active = false;
            state.expired = true;
            debug!("{} countdown expired", key);
            return Some(PresenceEvent::Expired);
        }
        Some(PresenceEvent::Tick {
            remaining: state.countdown_remaining as u32,
        })
    }

    #[cfg(test)]
    pub fn state(&self, key: &SensorKey) -> Option<&PresenceTimerState> {
        self.states.get(key)
    }

    pub fn active_countdowns(&self) -> usize {
        self.states.values().filter(|s| s.countdown_active).count()
    }

    /// Stop every running countdown. States are kept.
    pub fn shutdown(&mut self) {
        self.scheduler.cancel_all();
        for state in self.states.values_mut() {
            state.countdown_active = false;
        }
    }

    #[cfg(test)]
    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }
}
