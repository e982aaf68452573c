//! Collaborator interfaces the core calls out through. The host implements
//! these; the core never performs I/O itself.

use std::collections::BTreeMap;

use crate::beacon::{ActiveState, BeaconDefinition, BeaconKey};
use crate::codec::Telemetry;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("no stored beacon with id {0}")]
    NotFound(u64),
    #[error("store backend: {0}")]
    Backend(String),
}

/// Durable beacon storage. Ids are assigned by the store and never reused.
pub trait PersistentStore: Send {
    fn insert(&mut self, definition: &BeaconDefinition) -> Result<u64, StoreError>;
    fn update(&mut self, definition: &BeaconDefinition) -> Result<(), StoreError>;
    fn delete(&mut self, id: u64) -> Result<(), StoreError>;
    /// All rows, or only those whose `active_state` is not `Stopped`.
    fn load_all(&self, active_only: bool) -> Result<Vec<BeaconDefinition>, StoreError>;
    fn load(&self, id: u64) -> Result<Option<BeaconDefinition>, StoreError>;
}

/// One short-URL mint request. The answer comes back through
/// `BeaconRegistry::on_short_urls_issued` carrying the same `ticket`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortUrlRequest {
    pub ticket: u64,
    pub beacon: BeaconKey,
    pub url_id: String,
    pub token: String,
    pub ttl_s: u32,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortUrl {
    pub url: String,
    /// Absolute wall-clock expiry, milliseconds.
    pub expire_time_ms: u64,
}

/// Remote short-link minting service. `issue` only dispatches; it must not block.
pub trait ShortUrlIssuer: Send {
    fn issue(&mut self, request: ShortUrlRequest);
}

/// One-shot wake delivery at or after an absolute instant. Arming a key that is
/// already armed replaces the earlier instant.
pub trait WakeHost: Send {
    fn arm(&mut self, at_ms: u64, beacon: BeaconKey);
    fn cancel(&mut self, beacon: BeaconKey);
}

/// Fire-and-forget broadcast of active-state changes.
pub trait StateNotifier: Send {
    fn notify(&mut self, beacon: BeaconKey, state: ActiveState);
}

pub trait TelemetrySource: Send {
    fn sample(&mut self, now_ms: u64) -> Telemetry;
}

/// Everything the registry talks to besides the radio.
pub struct Collaborators {
    pub store: Box<dyn PersistentStore>,
    pub issuer: Box<dyn ShortUrlIssuer>,
    pub wake: Box<dyn WakeHost>,
    pub notifier: Box<dyn StateNotifier>,
    pub telemetry: Box<dyn TelemetrySource>,
}

/// In-memory store. Useful for hosts without persistence and for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: BTreeMap<u64, BeaconDefinition>,
    next_id: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl PersistentStore for MemoryStore {
    fn insert(&mut self, definition: &BeaconDefinition) -> Result<u64, StoreError> {
        self.next_id += 1;
        let id = self.next_id;
        let mut row = definition.clone();
        row.assign_id(id);
        self.rows.insert(id, row);
        Ok(id)
    }

    fn update(&mut self, definition: &BeaconDefinition) -> Result<(), StoreError> {
        let row = self
            .rows
            .get_mut(&definition.id())
            .ok_or(StoreError::NotFound(definition.id()))?;
        *row = definition.clone();
        Ok(())
    }

    fn delete(&mut self, id: u64) -> Result<(), StoreError> {
        self.rows.remove(&id);
        Ok(())
    }

    fn load_all(&self, active_only: bool) -> Result<Vec<BeaconDefinition>, StoreError> {
        Ok(self
            .rows
            .values()
            .filter(|d| !active_only || d.active_state != ActiveState::Stopped)
            .cloned()
            .collect())
    }

    fn load(&self, id: u64) -> Result<Option<BeaconDefinition>, StoreError> {
        Ok(self.rows.get(&id).cloned())
    }
}
