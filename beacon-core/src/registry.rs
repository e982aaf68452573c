//! Beacon registry: the single owner of every tracked definition.
//!
//! Host-driven. User commands, adapter events, advertise outcomes, wakes and
//! issuer results all come in through `&mut self` methods on one execution
//! context; the registry drives the advertising manager and the scheduler and
//! calls out through [`Collaborators`].

use std::collections::HashMap;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::advertising::{build_request, AdvertiseHandle, AdvertiseSettings, AdvertisingManager, RadioAdapter};
use crate::beacon::{
    commit, ActiveState, AdvertiseStatus, BeaconDefinition, BeaconKey, BeaconKind, BeaconPatch,
    EidBeacon,
};
use crate::config::CoreConfig;
use crate::eid::{EidRegistration, PublicKey, RegisteredEid};
use crate::error::{BeaconError, BeaconFailure, Result};
use crate::gatt::{GattConfigService, SessionOutcome, SessionResult};
use crate::host::{
    Collaborators, PersistentStore, ShortUrl, ShortUrlIssuer, ShortUrlRequest, StateNotifier,
    TelemetrySource,
};
use crate::scheduler::{next_refresh_ms, RefreshScheduler, Wake};

pub struct BeaconRegistry {
    config: CoreConfig,
    store: Box<dyn PersistentStore>,
    issuer: Box<dyn ShortUrlIssuer>,
    notifier: Box<dyn StateNotifier>,
    telemetry: Box<dyn TelemetrySource>,
    advertising: AdvertisingManager,
    scheduler: RefreshScheduler,
    beacons: Vec<BeaconDefinition>,
    /// Outstanding issuer tickets.
    pending_issues: HashMap<u64, Uuid>,
    next_ticket: u64,
    configuring: Option<Uuid>,
}

impl BeaconRegistry {
    pub fn new(config: CoreConfig, collaborators: Collaborators, radio: Box<dyn RadioAdapter>) -> Self {
        let Collaborators {
            store,
            issuer,
            wake,
            notifier,
            telemetry,
        } = collaborators;
        Self {
            config: config.normalized(),
            store,
            issuer,
            notifier,
            telemetry,
            advertising: AdvertisingManager::new(radio),
            scheduler: RefreshScheduler::new(wake),
            beacons: Vec::new(),
            pending_issues: HashMap::new(),
            next_ticket: 1,
            configuring: None,
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Tracked definitions (every one has `active_state != Stopped`).
    pub fn beacons(&self) -> &[BeaconDefinition] {
        &self.beacons
    }

    pub fn get(&self, key: BeaconKey) -> Option<&BeaconDefinition> {
        self.beacons.iter().find(|b| b.matches_key(key))
    }

    pub fn advertising(&self) -> &AdvertisingManager {
        &self.advertising
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.scheduler
    }

    fn index_of(&self, key: BeaconKey) -> Result<usize> {
        self.beacons
            .iter()
            .position(|b| b.matches_key(key))
            .ok_or(BeaconError::UnknownBeacon(key))
    }

    fn index_of_uuid(&self, beacon: Uuid) -> Option<usize> {
        self.beacons.iter().position(|b| b.ephemeral_id() == beacon)
    }

    /// Rehydrate active definitions from the store and drive the enabled ones.
    /// Returns how many were loaded.
    pub fn load(&mut self, now_ms: u64) -> Result<usize> {
        let rows = self.store.load_all(true)?;
        let mut loaded = 0;
        for mut row in rows {
            if self.beacons.iter().any(|b| b.same_identity(&row)) {
                continue;
            }
            row.normalize();
            self.beacons.push(row);
            loaded += 1;
        }
        info!(loaded, "beacons loaded");
        if self
            .beacons
            .iter()
            .any(|b| b.active_state == ActiveState::Enabled)
        {
            self.advertising.request_radio();
        }
        for idx in 0..self.beacons.len() {
            if self.beacons[idx].active_state == ActiveState::Enabled {
                if let Err(e) = self.advertise_enabled(idx, now_ms) {
                    warn!(beacon = %self.beacons[idx].key(), code = e.error_code(), "start after load failed: {e}");
                }
            }
        }
        Ok(loaded)
    }

    /// Persist `definition`, assigning its store id the first time.
    ///
    /// When the beacon is tracked, the tracked copy is what gets written and
    /// `definition` is refreshed from it.
    pub fn save(&mut self, definition: &mut BeaconDefinition) -> Result<u64> {
        let tracked = self.beacons.iter().position(|b| b.same_identity(definition));
        if let Some(idx) = tracked {
            *definition = self.beacons[idx].clone();
        }
        if definition.is_saved() {
            self.store.update(definition)?;
            return Ok(definition.id());
        }
        let id = self.store.insert(definition)?;
        definition.assign_id(id);
        if let Some(idx) = tracked {
            self.beacons[idx].assign_id(id);
        }
        debug!(beacon = %definition.key(), "beacon saved");
        Ok(id)
    }

    fn persist(&mut self, idx: usize) -> Result<()> {
        let def = &self.beacons[idx];
        if def.is_saved() {
            self.store.update(def)?;
        }
        Ok(())
    }

    fn set_active_state(&mut self, idx: usize, state: ActiveState) -> Result<()> {
        self.beacons[idx].active_state = state;
        let key = self.beacons[idx].key();
        info!(beacon = %key, ?state, "active state changed");
        self.notifier.notify(key, state);
        self.persist(idx)
    }

    fn has_active(&self) -> bool {
        !self.beacons.is_empty()
    }

    /// Enable `definition`, tracking it if it is new. A definition already
    /// tracked under the same identity is enabled in place.
    ///
    /// A beacon whose start fails stays tracked, with the failure recorded on
    /// its definition.
    pub fn start(&mut self, definition: BeaconDefinition, now_ms: u64) -> Result<BeaconKey> {
        if !self.has_active() {
            self.advertising.request_radio();
        }
        let idx = match self.beacons.iter().position(|b| b.same_identity(&definition)) {
            Some(idx) => idx,
            None => {
                let mut definition = definition;
                definition.advertise_status = AdvertiseStatus::Stopped;
                definition.failure = None;
                self.beacons.push(definition);
                self.beacons.len() - 1
            }
        };
        self.set_active_state(idx, ActiveState::Enabled)?;
        self.advertise_enabled(idx, now_ms)?;
        Ok(self.beacons[idx].key())
    }

    /// Finish EID registration against `authority` and start the resulting
    /// beacon. Returns the first identifier for the authority to verify.
    /// A failed key exchange tracks nothing; start errors are as for
    /// [`BeaconRegistry::start`].
    pub fn start_registered_eid(
        &mut self,
        registration: &EidRegistration,
        authority: &PublicKey,
        now_ms: u64,
    ) -> Result<(BeaconKey, RegisteredEid)> {
        let registered = registration.complete(authority, now_ms / 1000)?;
        let definition = BeaconDefinition::new(BeaconKind::EddystoneEid(EidBeacon {
            identity_key: registered.identity_key,
            rotation_exponent: registered.rotation_exponent,
            clock_offset: registered.clock_offset,
        }));
        info!(time_counter = registered.time_counter, "EID registration complete");
        let key = self.start(definition, now_ms)?;
        Ok((key, registered))
    }

    /// Re-enable a tracked beacon (typically a paused or failed one).
    pub fn enable(&mut self, key: BeaconKey, now_ms: u64) -> Result<()> {
        let idx = self.index_of(key)?;
        self.advertising.request_radio();
        self.set_active_state(idx, ActiveState::Enabled)?;
        self.advertise_enabled(idx, now_ms)
    }

    pub fn pause(&mut self, key: BeaconKey) -> Result<()> {
        let idx = self.index_of(key)?;
        self.halt(idx);
        self.set_active_state(idx, ActiveState::Paused)
    }

    /// Stop and untrack a beacon, deleting its row when `delete` is set.
    pub fn stop(&mut self, key: BeaconKey, delete: bool) -> Result<BeaconDefinition> {
        let idx = self.index_of(key)?;
        self.halt(idx);
        let uuid = self.beacons[idx].ephemeral_id();
        self.pending_issues.retain(|_, b| *b != uuid);
        if self.configuring == Some(uuid) {
            self.configuring = None;
        }
        let mut def = self.beacons.remove(idx);
        def.active_state = ActiveState::Stopped;
        let key = def.key();
        info!(beacon = %key, delete, "beacon stopped");
        self.notifier.notify(key, ActiveState::Stopped);
        if def.is_saved() {
            if delete {
                self.store.delete(def.id())?;
            } else {
                self.store.update(&def)?;
            }
        }
        Ok(def)
    }

    /// Cancel the refresh timer and stop any advertiser. Never calls the
    /// adapter for a beacon that has no advertiser.
    fn halt(&mut self, idx: usize) {
        let uuid = self.beacons[idx].ephemeral_id();
        self.scheduler.cancel(uuid);
        self.advertising.stop(uuid);
        let def = &mut self.beacons[idx];
        if def.advertise_status != AdvertiseStatus::NoRadio {
            def.advertise_status = AdvertiseStatus::Stopped;
        }
    }

    /// Apply `patch`. The live advertiser is recreated only when the edit
    /// requires it. Returns whether a restart was required.
    pub fn edit(&mut self, key: BeaconKey, patch: BeaconPatch, now_ms: u64) -> Result<bool> {
        let idx = self.index_of(key)?;
        let (next, restart_required) = commit(&self.beacons[idx], patch);
        self.beacons[idx] = next;
        self.persist(idx)?;
        debug!(beacon = %key, restart_required, "beacon edited");
        if restart_required && self.beacons[idx].active_state == ActiveState::Enabled {
            self.advertise_enabled(idx, now_ms)?;
        }
        Ok(restart_required)
    }

    /// (Re)start the advertiser for an enabled beacon with a fresh payload and
    /// arm its next refresh.
    fn advertise_enabled(&mut self, idx: usize, now_ms: u64) -> Result<()> {
        let uuid = self.beacons[idx].ephemeral_id();
        let key = self.beacons[idx].key();

        if let BeaconKind::EphemeralUrl(eph) = &self.beacons[idx].kind {
            let lead = self.config.short_url_refresh_lead_ms;
            if eph.short_url.is_none() || eph.expire_time_ms <= now_ms.saturating_add(lead) {
                self.request_short_url(idx);
                return Ok(());
            }
        }

        let telemetry = matches!(self.beacons[idx].kind, BeaconKind::EddystoneTlm(_))
            .then(|| self.telemetry.sample(now_ms));
        let request = match build_request(&self.beacons[idx], now_ms, telemetry.as_ref()) {
            Ok(request) => request,
            Err(e) => {
                self.scheduler.cancel(uuid);
                self.advertising.stop(uuid);
                let def = &mut self.beacons[idx];
                def.advertise_status = AdvertiseStatus::Failed;
                def.failure = Some(BeaconFailure::Encoding(e.to_string()));
                warn!(beacon = %key, "payload encoding failed: {e}");
                return Err(e.into());
            }
        };

        match self.advertising.start(uuid, request) {
            Ok(_) => {
                let def = &mut self.beacons[idx];
                def.advertise_status = AdvertiseStatus::Waiting;
                def.failure = None;
            }
            Err(unavailable) => {
                self.scheduler.cancel(uuid);
                self.beacons[idx].advertise_status = AdvertiseStatus::NoRadio;
                info!(beacon = %key, "radio unavailable: {unavailable}");
                return Err(unavailable.into());
            }
        }

        let next = next_refresh_ms(&self.beacons[idx], now_ms, &self.config);
        self.scheduler.schedule(uuid, key, next);
        Ok(())
    }

    fn request_short_url(&mut self, idx: usize) {
        let def = &mut self.beacons[idx];
        let uuid = def.ephemeral_id();
        let key = def.key();
        let BeaconKind::EphemeralUrl(eph) = &def.kind else {
            return;
        };
        if def.advertise_status != AdvertiseStatus::Running {
            def.advertise_status = AdvertiseStatus::Waiting;
        }
        if self.pending_issues.values().any(|b| *b == uuid) {
            debug!(beacon = %key, "short URL already requested");
            return;
        }
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        let request = ShortUrlRequest {
            ticket,
            beacon: key,
            url_id: eph.url_id.clone(),
            token: eph.url_token.clone(),
            ttl_s: eph.time_to_live_s,
            count: self.config.short_url_batch,
        };
        self.pending_issues.insert(ticket, uuid);
        info!(beacon = %key, ticket, "requesting short URL");
        self.issuer.issue(request);
    }

    /// Issuer answer for `ticket`. Answers for stopped beacons or superseded
    /// tickets are dropped.
    pub fn on_short_urls_issued(
        &mut self,
        ticket: u64,
        result: std::result::Result<Vec<ShortUrl>, String>,
        now_ms: u64,
    ) -> Result<()> {
        let Some(uuid) = self.pending_issues.remove(&ticket) else {
            debug!(ticket, "stale issuer result");
            return Ok(());
        };
        let Some(idx) = self.index_of_uuid(uuid) else {
            return Ok(());
        };
        let lead = self.config.short_url_refresh_lead_ms;
        let issued = result.and_then(|urls| {
            urls.into_iter()
                .next()
                .ok_or_else(|| "issuer returned no URLs".to_string())
        });
        let issued = issued.and_then(|short| {
            if short.expire_time_ms <= now_ms.saturating_add(lead) {
                Err(format!(
                    "short URL expires at {} ms, inside the {lead} ms refresh lead",
                    short.expire_time_ms
                ))
            } else {
                Ok(short)
            }
        });
        let key = self.beacons[idx].key();
        let short = match issued {
            Ok(short) => short,
            Err(message) => {
                self.scheduler.cancel(uuid);
                self.advertising.stop(uuid);
                let def = &mut self.beacons[idx];
                def.advertise_status = AdvertiseStatus::Failed;
                def.failure = Some(BeaconFailure::Issuer(message.clone()));
                warn!(beacon = %key, "short URL issue failed: {message}");
                return Err(BeaconError::Issuer(message));
            }
        };
        if let BeaconKind::EphemeralUrl(eph) = &mut self.beacons[idx].kind {
            info!(beacon = %key, url = %short.url, expire_time_ms = short.expire_time_ms, "short URL issued");
            eph.short_url = Some(short.url);
            eph.expire_time_ms = short.expire_time_ms;
        }
        self.persist(idx)?;
        if self.beacons[idx].active_state == ActiveState::Enabled {
            self.advertise_enabled(idx, now_ms)?;
        }
        Ok(())
    }

    /// Radio went off. No stop requests are sent to it.
    pub fn on_adapter_disabled(&mut self) {
        info!("radio adapter disabled");
        for def in &mut self.beacons {
            if matches!(
                def.advertise_status,
                AdvertiseStatus::Running | AdvertiseStatus::Waiting
            ) {
                def.advertise_status = AdvertiseStatus::NoRadio;
            }
        }
        self.scheduler.cancel_all();
        self.advertising.release();
    }

    /// Radio came back. Every enabled beacon is started again; paused ones
    /// are left alone.
    pub fn on_adapter_enabled(&mut self, now_ms: u64) {
        info!("radio adapter enabled");
        for idx in 0..self.beacons.len() {
            if self.beacons[idx].active_state != ActiveState::Enabled {
                continue;
            }
            if let Err(e) = self.advertise_enabled(idx, now_ms) {
                warn!(beacon = %self.beacons[idx].key(), code = e.error_code(), "restart failed: {e}");
            }
        }
    }

    pub fn on_advertise_started(&mut self, handle: AdvertiseHandle, settings: AdvertiseSettings) {
        let Some(uuid) = self.advertising.on_start_success(handle, settings) else {
            debug!(handle = handle.0, "stale advertise success");
            return;
        };
        if let Some(idx) = self.index_of_uuid(uuid) {
            let def = &mut self.beacons[idx];
            def.advertise_status = AdvertiseStatus::Running;
            def.failure = None;
            info!(beacon = %def.key(), mode = ?settings.mode, tx = ?settings.tx_power_level, "advertising");
        }
    }

    /// Adapter refused a start. The beacon is marked failed and not retried;
    /// the error is returned for the host to surface.
    pub fn on_advertise_failed(&mut self, handle: AdvertiseHandle, code: i32) -> Result<()> {
        let Some(uuid) = self.advertising.on_start_failure(handle) else {
            debug!(handle = handle.0, code, "stale advertise failure");
            return Ok(());
        };
        self.scheduler.cancel(uuid);
        if let Some(idx) = self.index_of_uuid(uuid) {
            let def = &mut self.beacons[idx];
            def.advertise_status = AdvertiseStatus::Failed;
            def.failure = Some(BeaconFailure::Rejected { code });
            warn!(beacon = %def.key(), code, "advertise rejected");
        }
        Err(BeaconError::AdvertiseRejected { code })
    }

    /// Wake delivered by the host for `key`.
    pub fn on_wake(&mut self, key: BeaconKey, now_ms: u64) -> Result<()> {
        let Some(idx) = self.beacons.iter().position(|b| b.matches_key(key)) else {
            debug!(beacon = %key, "wake for untracked beacon");
            return Ok(());
        };
        let uuid = self.beacons[idx].ephemeral_id();
        match self.scheduler.fire(uuid, now_ms) {
            Wake::Due => {}
            Wake::Early | Wake::NotArmed => return Ok(()),
        }
        debug!(beacon = %key, "refresh due");
        if self.beacons[idx].active_state != ActiveState::Enabled {
            return Ok(());
        }
        if self.configuring == Some(uuid) {
            // Restarting would drop the configuration link; the session end restarts it.
            debug!(beacon = %key, "refresh deferred during configuration");
            return Ok(());
        }
        self.advertise_enabled(idx, now_ms)
    }

    /// Make a tracked Eddystone beacon connectable and open a configuration
    /// session on it.
    pub fn begin_configuration(&mut self, key: BeaconKey, now_ms: u64) -> Result<GattConfigService> {
        let idx = self.index_of(key)?;
        let def = &self.beacons[idx];
        if !def.kind.is_eddystone() || def.lock_key().is_none() {
            return Err(BeaconError::NotConfigurable(key));
        }
        let uuid = def.ephemeral_id();
        let opened = self.edit(
            key,
            BeaconPatch {
                connectable: Some(true),
                ..Default::default()
            },
            now_ms,
        );
        if let Err(e) = opened {
            // No session will follow, so nothing would ever clear the flag.
            let idx = self.index_of(key)?;
            let (next, _) = commit(
                &self.beacons[idx],
                BeaconPatch {
                    connectable: Some(false),
                    ..Default::default()
                },
            );
            self.beacons[idx] = next;
            self.persist(idx)?;
            warn!(beacon = %key, code = e.error_code(), "configuration session not opened: {e}");
            return Err(e);
        }
        self.configuring = Some(uuid);
        info!(beacon = %key, "configuration session opened");
        let idx = self.index_of(key)?;
        Ok(GattConfigService::new(self.beacons[idx].clone(), &self.config))
    }

    /// Apply the result of a finished configuration session.
    pub fn end_configuration(&mut self, outcome: SessionOutcome, now_ms: u64) -> Result<()> {
        self.configuring = None;
        let key = outcome.original.key();
        match outcome.result {
            SessionResult::Unchanged => {
                self.edit(
                    key,
                    BeaconPatch {
                        connectable: Some(false),
                        ..Default::default()
                    },
                    now_ms,
                )?;
            }
            SessionResult::Replaced(candidate) => {
                let patch = BeaconPatch {
                    connectable: Some(false),
                    ..BeaconPatch::replace_with(&candidate)
                };
                self.edit(key, patch, now_ms)?;
                info!(beacon = %key, "configuration applied");
            }
            SessionResult::Cleared => {
                self.stop(key, true)?;
                info!(beacon = %key, "beacon cleared by configurator");
            }
        }
        Ok(())
    }
}
