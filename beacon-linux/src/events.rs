//! Events posted to the registry's owning task. Timers, the issuer and the
//! radio never touch the registry directly; they send one of these.

use std::time::{SystemTime, UNIX_EPOCH};

use beacon_core::{AdvertiseHandle, AdvertiseSettings, BeaconKey, ShortUrl};
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug)]
pub enum HostEvent {
    Wake(BeaconKey),
    AdvertiseStarted(AdvertiseHandle, AdvertiseSettings),
    AdvertiseFailed(AdvertiseHandle, i32),
    ShortUrls {
        ticket: u64,
        result: Result<Vec<ShortUrl>, String>,
    },
    RadioEnabled,
    RadioDisabled,
}

pub type EventSender = UnboundedSender<HostEvent>;

/// Wall clock in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
