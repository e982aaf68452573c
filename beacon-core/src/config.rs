//! Core tunables. Hosts embed this as a `[core]` table in their own config.

use serde::Deserialize;

use crate::beacon::{TLM_INTERVAL_MAX_MS, TLM_INTERVAL_MIN_MS};

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    /// Reissue a short URL this long before it expires.
    #[serde(default = "default_short_url_refresh_lead_ms")]
    pub short_url_refresh_lead_ms: u64,
    /// Short URLs requested per issue call.
    #[serde(default = "default_short_url_batch")]
    pub short_url_batch: u32,
    #[serde(default = "default_tlm_interval_ms")]
    pub default_tlm_interval_ms: u32,
    /// Reported in the GATT capabilities characteristic.
    #[serde(default = "default_gatt_max_slots")]
    pub gatt_max_slots: u8,
    #[serde(default = "default_gatt_max_eid_slots")]
    pub gatt_max_eid_slots: u8,
}

fn default_short_url_refresh_lead_ms() -> u64 {
    7_000
}

fn default_short_url_batch() -> u32 {
    1
}

fn default_tlm_interval_ms() -> u32 {
    10_000
}

fn default_gatt_max_slots() -> u8 {
    2
}

fn default_gatt_max_eid_slots() -> u8 {
    1
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            short_url_refresh_lead_ms: default_short_url_refresh_lead_ms(),
            short_url_batch: default_short_url_batch(),
            default_tlm_interval_ms: default_tlm_interval_ms(),
            gatt_max_slots: default_gatt_max_slots(),
            gatt_max_eid_slots: default_gatt_max_eid_slots(),
        }
    }
}

impl CoreConfig {
    /// Copy with out-of-range values pulled into their valid windows.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.default_tlm_interval_ms = self
            .default_tlm_interval_ms
            .clamp(TLM_INTERVAL_MIN_MS, TLM_INTERVAL_MAX_MS);
        self.short_url_batch = self.short_url_batch.max(1);
        self
    }
}
