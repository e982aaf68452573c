//! Recording doubles for the collaborator traits. Each double is a cheap
//! handle over shared state so a test can keep one clone and give the other
//! to the code under test.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::advertising::{AdvertiseHandle, AdvertiseRequest, RadioAdapter};
use crate::beacon::{ActiveState, BeaconDefinition, BeaconKey};
use crate::codec::Telemetry;
use crate::config::CoreConfig;
use crate::host::{
    Collaborators, MemoryStore, PersistentStore, ShortUrlIssuer, ShortUrlRequest, StateNotifier,
    StoreError, TelemetrySource, WakeHost,
};
use crate::registry::BeaconRegistry;

#[derive(Debug)]
struct RadioLog {
    enabled: bool,
    multi_advertise: bool,
    enable_requests: u32,
    started: Vec<(AdvertiseHandle, AdvertiseRequest)>,
    stopped: Vec<AdvertiseHandle>,
}

#[derive(Debug, Clone)]
pub struct MockRadio(Arc<Mutex<RadioLog>>);

impl MockRadio {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(RadioLog {
            enabled: true,
            multi_advertise: true,
            enable_requests: 0,
            started: Vec::new(),
            stopped: Vec::new(),
        })))
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.0.lock().unwrap().enabled = enabled;
    }

    pub fn set_multi_advertise(&self, supported: bool) {
        self.0.lock().unwrap().multi_advertise = supported;
    }

    pub fn enable_requests(&self) -> u32 {
        self.0.lock().unwrap().enable_requests
    }

    pub fn started_count(&self) -> usize {
        self.0.lock().unwrap().started.len()
    }

    pub fn started(&self) -> Vec<(AdvertiseHandle, AdvertiseRequest)> {
        self.0.lock().unwrap().started.clone()
    }

    pub fn last_start(&self) -> Option<(AdvertiseHandle, AdvertiseRequest)> {
        self.0.lock().unwrap().started.last().cloned()
    }

    pub fn stopped(&self) -> Vec<AdvertiseHandle> {
        self.0.lock().unwrap().stopped.clone()
    }
}

impl RadioAdapter for MockRadio {
    fn is_enabled(&self) -> bool {
        self.0.lock().unwrap().enabled
    }

    fn supports_multi_advertise(&self) -> bool {
        self.0.lock().unwrap().multi_advertise
    }

    fn request_enable(&mut self) {
        self.0.lock().unwrap().enable_requests += 1;
    }

    fn start(&mut self, handle: AdvertiseHandle, request: &AdvertiseRequest) {
        self.0.lock().unwrap().started.push((handle, request.clone()));
    }

    fn stop(&mut self, handle: AdvertiseHandle) {
        self.0.lock().unwrap().stopped.push(handle);
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingWake(Arc<Mutex<HashMap<BeaconKey, u64>>>);

impl RecordingWake {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn armed_at(&self, key: BeaconKey) -> Option<u64> {
        self.0.lock().unwrap().get(&key).copied()
    }

    pub fn armed_count(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl WakeHost for RecordingWake {
    fn arm(&mut self, at_ms: u64, beacon: BeaconKey) {
        self.0.lock().unwrap().insert(beacon, at_ms);
    }

    fn cancel(&mut self, beacon: BeaconKey) {
        self.0.lock().unwrap().remove(&beacon);
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier(Arc<Mutex<Vec<(BeaconKey, ActiveState)>>>);

impl RecordingNotifier {
    pub fn events(&self) -> Vec<(BeaconKey, ActiveState)> {
        self.0.lock().unwrap().clone()
    }
}

impl StateNotifier for RecordingNotifier {
    fn notify(&mut self, beacon: BeaconKey, state: ActiveState) {
        self.0.lock().unwrap().push((beacon, state));
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingIssuer(Arc<Mutex<Vec<ShortUrlRequest>>>);

impl RecordingIssuer {
    pub fn requests(&self) -> Vec<ShortUrlRequest> {
        self.0.lock().unwrap().clone()
    }
}

impl ShortUrlIssuer for RecordingIssuer {
    fn issue(&mut self, request: ShortUrlRequest) {
        self.0.lock().unwrap().push(request);
    }
}

pub struct FixedTelemetry;

impl TelemetrySource for FixedTelemetry {
    fn sample(&mut self, now_ms: u64) -> Telemetry {
        Telemetry {
            battery_millivolts: 3_000,
            temperature_celsius: Some(20.0),
            advertising_count: 0,
            uptime_deciseconds: (now_ms / 100) as u32,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SharedStore(Arc<Mutex<MemoryStore>>);

impl SharedStore {
    pub fn get(&self, id: u64) -> Option<BeaconDefinition> {
        self.0.lock().unwrap().load(id).unwrap()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl PersistentStore for SharedStore {
    fn insert(&mut self, definition: &BeaconDefinition) -> Result<u64, StoreError> {
        self.0.lock().unwrap().insert(definition)
    }

    fn update(&mut self, definition: &BeaconDefinition) -> Result<(), StoreError> {
        self.0.lock().unwrap().update(definition)
    }

    fn delete(&mut self, id: u64) -> Result<(), StoreError> {
        self.0.lock().unwrap().delete(id)
    }

    fn load_all(&self, active_only: bool) -> Result<Vec<BeaconDefinition>, StoreError> {
        self.0.lock().unwrap().load_all(active_only)
    }

    fn load(&self, id: u64) -> Result<Option<BeaconDefinition>, StoreError> {
        self.0.lock().unwrap().load(id)
    }
}

/// Test-side handles onto a registry's collaborators.
pub struct Rig {
    pub radio: MockRadio,
    pub wake: RecordingWake,
    pub notifier: RecordingNotifier,
    pub issuer: RecordingIssuer,
    pub store: SharedStore,
}

impl Rig {
    pub fn new() -> Self {
        Self {
            radio: MockRadio::new(),
            wake: RecordingWake::new(),
            notifier: RecordingNotifier::default(),
            issuer: RecordingIssuer::default(),
            store: SharedStore::default(),
        }
    }

    pub fn registry(&self) -> BeaconRegistry {
        BeaconRegistry::new(
            CoreConfig::default(),
            Collaborators {
                store: Box::new(self.store.clone()),
                issuer: Box::new(self.issuer.clone()),
                wake: Box::new(self.wake.clone()),
                notifier: Box::new(self.notifier.clone()),
                telemetry: Box::new(FixedTelemetry),
            },
            Box::new(self.radio.clone()),
        )
    }
}
