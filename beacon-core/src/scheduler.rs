//! Refresh scheduler: one armed wake per beacon for its next payload change.

use std::collections::HashMap;

use tracing::debug;
use uuid::Uuid;

use crate::beacon::{BeaconDefinition, BeaconKey, BeaconKind};
use crate::config::CoreConfig;
use crate::eid;
use crate::host::WakeHost;

/// Outcome of a wake delivered by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The armed instant has passed; the timer is consumed.
    Due,
    /// Delivered before the armed instant; re-armed.
    Early,
    /// Nothing armed for this beacon (cancelled or superseded).
    NotArmed,
}

pub struct RefreshScheduler {
    wake: Box<dyn WakeHost>,
    armed: HashMap<Uuid, (BeaconKey, u64)>,
}

impl RefreshScheduler {
    pub fn new(wake: Box<dyn WakeHost>) -> Self {
        Self {
            wake,
            armed: HashMap::new(),
        }
    }

    /// Arm the wake for `beacon`, replacing any earlier one. `at_ms == 0` cancels.
    pub fn schedule(&mut self, beacon: Uuid, key: BeaconKey, at_ms: u64) {
        if at_ms == 0 {
            self.cancel(beacon);
            return;
        }
        if let Some((old_key, _)) = self.armed.insert(beacon, (key, at_ms)) {
            if old_key != key {
                self.wake.cancel(old_key);
            }
        }
        self.wake.arm(at_ms, key);
        debug!(beacon = %key, at_ms, "refresh armed");
    }

    /// Returns whether a timer was armed.
    pub fn cancel(&mut self, beacon: Uuid) -> bool {
        match self.armed.remove(&beacon) {
            Some((key, _)) => {
                self.wake.cancel(key);
                debug!(beacon = %key, "refresh cancelled");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (key, _)) in self.armed.drain() {
            self.wake.cancel(key);
        }
    }

    /// Consume the timer for `beacon` if its instant has been reached.
    pub fn fire(&mut self, beacon: Uuid, now_ms: u64) -> Wake {
        match self.armed.get(&beacon) {
            None => Wake::NotArmed,
            Some(&(key, at_ms)) if now_ms < at_ms => {
                self.wake.arm(at_ms, key);
                Wake::Early
            }
            Some(_) => {
                self.armed.remove(&beacon);
                Wake::Due
            }
        }
    }

    pub fn next_at(&self, beacon: Uuid) -> Option<u64> {
        self.armed.get(&beacon).map(|&(_, at)| at)
    }

    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }
}

/// Wall-clock instant (ms) at which `definition`'s payload must next be
/// recomputed, or 0 if it never changes on its own.
pub fn next_refresh_ms(definition: &BeaconDefinition, now_ms: u64, config: &CoreConfig) -> u64 {
    match &definition.kind {
        BeaconKind::EddystoneEid(e) => {
            let counter = eid::time_counter_at(now_ms / 1000, e.clock_offset);
            eid::next_rotation_s(counter, e.rotation_exponent, e.clock_offset) * 1000
        }
        BeaconKind::EphemeralUrl(eph) if eph.short_url.is_some() => eph
            .expire_time_ms
            .saturating_sub(config.short_url_refresh_lead_ms),
        BeaconKind::EddystoneTlm(tlm) => now_ms + u64::from(tlm.refresh_interval_ms),
        _ => 0,
    }
}
