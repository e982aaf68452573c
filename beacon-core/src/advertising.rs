//! Advertising manager: multiplexes logical advertisers onto the one radio.
//!
//! Only the context that owns the registry calls into this module. Start and
//! stop requests go out through [`RadioAdapter`]; outcomes come back as
//! `on_start_success` / `on_start_failure` carrying the handle the request was
//! made with, so an outcome for a superseded request is recognised and dropped.

use std::collections::HashMap;

use tracing::{debug, info};
use uuid::Uuid;

use crate::beacon::{AdvertiseMode, BeaconDefinition, BeaconKind, TxPowerLevel};
use crate::codec::{self, FrameError, Telemetry, EDDYSTONE_SERVICE_UUID16};
use crate::eid;
use crate::error::RadioUnavailable;
use crate::gatt::CONFIG_SERVICE_UUID;

/// Identifies one start request to the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdvertiseHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvertiseSettings {
    pub mode: AdvertiseMode,
    pub tx_power_level: TxPowerLevel,
    pub connectable: bool,
    /// 0 means advertise until stopped.
    pub timeout_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertisePayload {
    ServiceData { service_uuid16: u16, data: Vec<u8> },
    ManufacturerData { company_id: u16, data: Vec<u8> },
    ServiceUuid(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertiseRequest {
    pub settings: AdvertiseSettings,
    pub data: AdvertisePayload,
    pub scan_response: Option<AdvertisePayload>,
}

/// Physical radio. `start` and `stop` dispatch only; the result of a start
/// arrives later through the registry's `on_advertise_started` /
/// `on_advertise_failed`.
pub trait RadioAdapter: Send {
    fn is_enabled(&self) -> bool;
    fn supports_multi_advertise(&self) -> bool;
    /// Ask the platform to power the radio on. Completion is reported as an
    /// adapter-on event.
    fn request_enable(&mut self);
    fn start(&mut self, handle: AdvertiseHandle, request: &AdvertiseRequest);
    fn stop(&mut self, handle: AdvertiseHandle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertiserState {
    Starting,
    Running(AdvertiseSettings),
}

/// One logical broadcast.
#[derive(Debug, Clone)]
pub struct Advertiser {
    pub handle: AdvertiseHandle,
    pub request: AdvertiseRequest,
    pub state: AdvertiserState,
}

pub struct AdvertisingManager {
    adapter: Box<dyn RadioAdapter>,
    acquired: bool,
    advertisers: HashMap<Uuid, Advertiser>,
    next_handle: u64,
}

impl AdvertisingManager {
    pub fn new(adapter: Box<dyn RadioAdapter>) -> Self {
        Self {
            adapter,
            acquired: false,
            advertisers: HashMap::new(),
            next_handle: 1,
        }
    }

    pub fn request_radio(&mut self) {
        if !self.adapter.is_enabled() {
            debug!("requesting radio enable");
            self.adapter.request_enable();
        }
    }

    fn acquire(&mut self) -> Result<(), RadioUnavailable> {
        if self.acquired {
            return Ok(());
        }
        if !self.adapter.is_enabled() {
            return Err(RadioUnavailable::Disabled);
        }
        if !self.adapter.supports_multi_advertise() {
            return Err(RadioUnavailable::MultiAdvertiseUnsupported);
        }
        self.acquired = true;
        debug!("radio acquired");
        Ok(())
    }

    /// Start broadcasting `request` for `beacon`, replacing any advertiser it
    /// already has.
    pub fn start(
        &mut self,
        beacon: Uuid,
        request: AdvertiseRequest,
    ) -> Result<AdvertiseHandle, RadioUnavailable> {
        self.acquire()?;
        self.stop(beacon);
        let handle = AdvertiseHandle(self.next_handle);
        self.next_handle += 1;
        self.adapter.start(handle, &request);
        debug!(handle = handle.0, %beacon, "advertise start requested");
        self.advertisers.insert(
            beacon,
            Advertiser {
                handle,
                request,
                state: AdvertiserState::Starting,
            },
        );
        Ok(handle)
    }

    /// Stop the advertiser for `beacon`. Returns whether one existed. With no
    /// radio handle only bookkeeping is dropped.
    pub fn stop(&mut self, beacon: Uuid) -> bool {
        let Some(advertiser) = self.advertisers.remove(&beacon) else {
            return false;
        };
        if self.acquired {
            self.adapter.stop(advertiser.handle);
            debug!(handle = advertiser.handle.0, %beacon, "advertise stopped");
        }
        true
    }

    /// Record a successful start. `None` when the handle is no longer current.
    pub fn on_start_success(
        &mut self,
        handle: AdvertiseHandle,
        settings: AdvertiseSettings,
    ) -> Option<Uuid> {
        let (beacon, advertiser) = self
            .advertisers
            .iter_mut()
            .find(|(_, a)| a.handle == handle)?;
        advertiser.state = AdvertiserState::Running(settings);
        Some(*beacon)
    }

    /// Drop the advertiser whose start failed. `None` when the handle is no
    /// longer current.
    pub fn on_start_failure(&mut self, handle: AdvertiseHandle) -> Option<Uuid> {
        let beacon = self
            .advertisers
            .iter()
            .find(|(_, a)| a.handle == handle)
            .map(|(b, _)| *b)?;
        self.advertisers.remove(&beacon);
        Some(beacon)
    }

    /// Forget the radio and every advertiser without issuing stop requests.
    /// Used when the adapter has gone away underneath us.
    pub fn release(&mut self) {
        if self.acquired || !self.advertisers.is_empty() {
            info!(advertisers = self.advertisers.len(), "radio released");
        }
        self.acquired = false;
        self.advertisers.clear();
    }

    pub fn advertiser(&self, beacon: Uuid) -> Option<&Advertiser> {
        self.advertisers.get(&beacon)
    }

    pub fn is_advertising(&self, beacon: Uuid) -> bool {
        self.advertisers.contains_key(&beacon)
    }

    pub fn advertiser_count(&self) -> usize {
        self.advertisers.len()
    }
}

/// Build the adapter request for `definition` at `now_ms`. TLM beacons need a
/// telemetry sample; ephemeral URL beacons need an issued short URL.
pub fn build_request(
    definition: &BeaconDefinition,
    now_ms: u64,
    telemetry: Option<&Telemetry>,
) -> Result<AdvertiseRequest, FrameError> {
    let tx = definition.tx_power_level;
    let data = match &definition.kind {
        BeaconKind::EddystoneUrl(url) => {
            let url = url
                .url
                .as_deref()
                .ok_or_else(|| FrameError::Invalid("URL beacon has no URL".into()))?;
            service_data(codec::url_frame(tx, url)?)
        }
        BeaconKind::EphemeralUrl(eph) => {
            let url = eph
                .short_url
                .as_deref()
                .ok_or_else(|| FrameError::Invalid("no short URL issued yet".into()))?;
            service_data(codec::url_frame(tx, url)?)
        }
        BeaconKind::EddystoneUid(uid) => service_data(codec::uid_frame(tx, &uid.namespace_instance)),
        BeaconKind::EddystoneEid(e) => {
            let id = eid::current_eid(&e.identity_key, e.rotation_exponent, e.clock_offset, now_ms / 1000);
            service_data(codec::eid_frame(tx, &id))
        }
        BeaconKind::EddystoneTlm(_) => {
            let telemetry =
                telemetry.ok_or_else(|| FrameError::Invalid("no telemetry sample".into()))?;
            service_data(codec::tlm_frame(telemetry))
        }
        BeaconKind::Proximity(p) => {
            let (company_id, data) = codec::proximity_frame(p.frame_flavor, tx, &p.uuid, p.major, p.minor);
            AdvertisePayload::ManufacturerData { company_id, data }
        }
    };
    let scan_response = (definition.connectable && definition.kind.is_eddystone())
        .then_some(AdvertisePayload::ServiceUuid(CONFIG_SERVICE_UUID));
    Ok(AdvertiseRequest {
        settings: AdvertiseSettings {
            mode: definition.advertise_mode,
            tx_power_level: tx,
            connectable: definition.connectable,
            timeout_ms: 0,
        },
        data,
        scan_response,
    })
}

fn service_data(data: Vec<u8>) -> AdvertisePayload {
    AdvertisePayload::ServiceData {
        service_uuid16: EDDYSTONE_SERVICE_UUID16,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beacon::{
        EidBeacon, EphemeralUrlBeacon, FrameFlavor, ProximityBeacon, TlmBeacon, UidBeacon, UrlBeacon,
    };
    use crate::testing::MockRadio;

    fn request() -> AdvertiseRequest {
        let def = BeaconDefinition::new(BeaconKind::EddystoneUid(UidBeacon {
            namespace_instance: [1; 16],
            domain_hint: None,
        }));
        build_request(&def, 0, None).unwrap()
    }

    #[test]
    fn start_fails_cleanly_without_radio() {
        let radio = MockRadio::new();
        radio.set_enabled(false);
        let mut mgr = AdvertisingManager::new(Box::new(radio.clone()));
        assert_eq!(
            mgr.start(Uuid::new_v4(), request()),
            Err(RadioUnavailable::Disabled)
        );
        assert_eq!(radio.started_count(), 0);

        let radio = MockRadio::new();
        radio.set_multi_advertise(false);
        let mut mgr = AdvertisingManager::new(Box::new(radio));
        assert_eq!(
            mgr.start(Uuid::new_v4(), request()),
            Err(RadioUnavailable::MultiAdvertiseUnsupported)
        );
    }

    #[test]
    fn restart_stops_previous_advertiser() {
        let radio = MockRadio::new();
        let mut mgr = AdvertisingManager::new(Box::new(radio.clone()));
        let beacon = Uuid::new_v4();
        let first = mgr.start(beacon, request()).unwrap();
        let second = mgr.start(beacon, request()).unwrap();
        assert_ne!(first, second);
        assert_eq!(radio.stopped(), vec![first]);
        assert_eq!(mgr.advertiser_count(), 1);
    }

    #[test]
    fn stale_outcomes_ignored() {
        let radio = MockRadio::new();
        let mut mgr = AdvertisingManager::new(Box::new(radio));
        let beacon = Uuid::new_v4();
        let first = mgr.start(beacon, request()).unwrap();
        let second = mgr.start(beacon, request()).unwrap();
        let settings = request().settings;
        assert_eq!(mgr.on_start_success(first, settings), None);
        assert_eq!(mgr.on_start_failure(first), None);
        assert_eq!(mgr.on_start_success(second, settings), Some(beacon));
        assert_eq!(
            mgr.advertiser(beacon).map(|a| a.state),
            Some(AdvertiserState::Running(settings))
        );
    }

    #[test]
    fn release_skips_stop_calls() {
        let radio = MockRadio::new();
        let mut mgr = AdvertisingManager::new(Box::new(radio.clone()));
        let beacon = Uuid::new_v4();
        mgr.start(beacon, request()).unwrap();
        mgr.release();
        assert_eq!(mgr.advertiser_count(), 0);
        assert!(!mgr.stop(beacon));
        assert!(radio.stopped().is_empty());
    }

    #[test]
    fn eddystone_payloads_use_service_data() {
        let def = BeaconDefinition::new(BeaconKind::EddystoneUrl(UrlBeacon {
            url: Some("https://goo.gl/x".into()),
        }));
        let req = build_request(&def, 0, None).unwrap();
        assert!(matches!(
            req.data,
            AdvertisePayload::ServiceData { service_uuid16: EDDYSTONE_SERVICE_UUID16, ref data } if data[0] == codec::FRAME_TYPE_URL
        ));
        assert!(req.scan_response.is_none());
    }

    #[test]
    fn connectable_eddystone_advertises_config_service() {
        let mut def = BeaconDefinition::new(BeaconKind::EddystoneEid(EidBeacon {
            identity_key: [2; 16],
            rotation_exponent: 4,
            clock_offset: 0,
        }));
        def.connectable = true;
        let req = build_request(&def, 100_000, None).unwrap();
        assert_eq!(req.scan_response, Some(AdvertisePayload::ServiceUuid(CONFIG_SERVICE_UUID)));
        assert!(req.settings.connectable);
    }

    #[test]
    fn proximity_uses_manufacturer_data() {
        let def = BeaconDefinition::new(BeaconKind::Proximity(ProximityBeacon {
            uuid: [3; 16],
            major: 1,
            minor: 2,
            frame_flavor: FrameFlavor::Native,
        }));
        let req = build_request(&def, 0, None).unwrap();
        assert!(matches!(
            req.data,
            AdvertisePayload::ManufacturerData { company_id: codec::APPLE_COMPANY_ID, .. }
        ));
    }

    #[test]
    fn missing_inputs_are_encoding_failures() {
        let eph = BeaconDefinition::new(BeaconKind::EphemeralUrl(EphemeralUrlBeacon {
            url: None,
            url_id: "id".into(),
            url_token: "tok".into(),
            time_to_live_s: 60,
            short_url: None,
            expire_time_ms: 0,
        }));
        assert!(matches!(build_request(&eph, 0, None), Err(FrameError::Invalid(_))));

        let tlm = BeaconDefinition::new(BeaconKind::EddystoneTlm(TlmBeacon {
            refresh_interval_ms: 10_000,
        }));
        assert!(build_request(&tlm, 0, None).is_err());
        assert!(build_request(&tlm, 0, Some(&Telemetry::default())).is_ok());

        let bad = BeaconDefinition::new(BeaconKind::EddystoneUrl(UrlBeacon {
            url: Some("ftp://x".into()),
        }));
        assert_eq!(build_request(&bad, 0, None), Err(FrameError::UnsupportedUrl));
    }
}
