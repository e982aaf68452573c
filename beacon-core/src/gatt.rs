//! Eddystone-GATT configuration service.
//!
//! One session per service value. The host forwards connection events and
//! characteristic reads/writes; each call returns the ATT status, the value to
//! send back, and any peers to disconnect. Edits land on a candidate copy of
//! the beacon and take effect only when the session ends, through
//! [`SessionOutcome`].

use rand::RngCore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::beacon::{
    commit, AdvertiseMode, BeaconDefinition, BeaconKind, BeaconPatch, EidBeacon, TlmBeacon,
    TxPowerLevel, UidBeacon, UrlBeacon, LOCK_KEY_LEN, MAX_ROTATION_EXPONENT,
};
use crate::codec::{
    self, Telemetry, FRAME_TYPE_EID, FRAME_TYPE_TLM, FRAME_TYPE_UID, FRAME_TYPE_URL,
    MAX_ENCODED_URL_LEN,
};
use crate::config::CoreConfig;
use crate::eid::{self, Keypair, PublicKey};

pub const CONFIG_SERVICE_UUID: Uuid = Uuid::from_u128(0xa3c87500_8ed3_4bdf_8a39_a01bebede295);

const GATT_VERSION: u8 = 0x00;
/// Variable advertising interval and variable TX power.
const CAPABILITY_BITMAP: u8 = 0x03;
/// UID, URL, TLM and EID.
const SUPPORTED_FRAME_TYPES: u16 = 0x000F;
const FACTORY_RESET: u8 = 0x0B;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    Capabilities,
    ActiveSlot,
    AdvertisingInterval,
    RadioTxPower,
    AdvertisedTxPower,
    LockState,
    Unlock,
    PublicEcdhKey,
    EidIdentityKey,
    SlotData,
    FactoryReset,
    RemainConnectable,
}

impl Characteristic {
    pub const ALL: [Characteristic; 12] = [
        Self::Capabilities,
        Self::ActiveSlot,
        Self::AdvertisingInterval,
        Self::RadioTxPower,
        Self::AdvertisedTxPower,
        Self::LockState,
        Self::Unlock,
        Self::PublicEcdhKey,
        Self::EidIdentityKey,
        Self::SlotData,
        Self::FactoryReset,
        Self::RemainConnectable,
    ];

    pub fn uuid(self) -> Uuid {
        let index = Self::ALL.iter().position(|c| *c == self).unwrap_or(0) as u128 + 1;
        Uuid::from_u128(CONFIG_SERVICE_UUID.as_u128() + (index << 96))
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }
}

/// ATT status returned with every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidOffset,
    InsufficientAuthorization,
    InvalidAttributeValueLength,
    UnlikelyError,
}

impl GattStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0x00,
            Self::ReadNotPermitted => 0x02,
            Self::WriteNotPermitted => 0x03,
            Self::InvalidOffset => 0x07,
            Self::InsufficientAuthorization => 0x08,
            Self::InvalidAttributeValueLength => 0x0D,
            Self::UnlikelyError => 0x0E,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Locked,
    Unlocked,
    /// Unlocked, and a relock was not requested on the next disconnect.
    UnlockedNoAutoRelock,
}

impl LockState {
    pub fn byte(self) -> u8 {
        match self {
            Self::Locked => 0x00,
            Self::Unlocked => 0x01,
            Self::UnlockedNoAutoRelock => 0x02,
        }
    }

    fn is_locked(self) -> bool {
        self == Self::Locked
    }
}

/// Host-side identifier of a connected central (usually its address).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerId(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattAction {
    Disconnect(PeerId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattResponse {
    pub status: GattStatus,
    pub value: Vec<u8>,
    pub actions: Vec<GattAction>,
}

impl GattResponse {
    fn ok(value: Vec<u8>) -> Self {
        Self {
            status: GattStatus::Success,
            value,
            actions: Vec::new(),
        }
    }

    fn status(status: GattStatus) -> Self {
        Self {
            status,
            value: Vec::new(),
            actions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionResult {
    Unchanged,
    Replaced(BeaconDefinition),
    Cleared,
}

/// What the registry should do with the configured beacon.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub original: BeaconDefinition,
    pub result: SessionResult,
}

#[derive(Debug)]
pub struct GattConfigService {
    original: BeaconDefinition,
    candidate: BeaconDefinition,
    cleared: bool,
    lock_state: LockState,
    challenge: Option<[u8; 16]>,
    owner: Option<PeerId>,
    connected: Vec<PeerId>,
    beacon_public_key: Option<PublicKey>,
    max_slots: u8,
    max_eid_slots: u8,
    default_tlm_interval_ms: u32,
}

impl GattConfigService {
    pub fn new(original: BeaconDefinition, config: &CoreConfig) -> Self {
        Self {
            candidate: original.clone(),
            original,
            cleared: false,
            lock_state: LockState::Locked,
            challenge: None,
            owner: None,
            connected: Vec::new(),
            beacon_public_key: None,
            max_slots: config.gatt_max_slots,
            max_eid_slots: config.gatt_max_eid_slots,
            default_tlm_interval_ms: config.default_tlm_interval_ms,
        }
    }

    pub fn lock_state(&self) -> LockState {
        self.lock_state
    }

    pub fn owner(&self) -> Option<&PeerId> {
        self.owner.as_ref()
    }

    pub fn candidate(&self) -> &BeaconDefinition {
        &self.candidate
    }

    /// A peer connected. While a session is owned any other peer is turned away.
    pub fn on_peer_connected(&mut self, peer: PeerId) -> Vec<GattAction> {
        if self.owner.as_ref().is_some_and(|o| *o != peer) {
            debug!(peer = %peer.0, "session owned; disconnecting newcomer");
            return vec![GattAction::Disconnect(peer)];
        }
        if !self.connected.contains(&peer) {
            self.connected.push(peer);
        }
        Vec::new()
    }

    /// A peer went away. When it was the owner the session ends and relocks.
    pub fn on_peer_disconnected(&mut self, peer: &PeerId) -> Option<SessionOutcome> {
        self.connected.retain(|p| p != peer);
        if self.owner.as_ref() != Some(peer) {
            return None;
        }
        self.owner = None;
        self.relock();
        info!(peer = %peer.0, "configuration session closed");
        Some(self.outcome())
    }

    /// End the session without a disconnect event (service torn down by the host).
    pub fn finish(mut self) -> SessionOutcome {
        self.relock();
        self.outcome()
    }

    fn relock(&mut self) {
        self.lock_state = LockState::Locked;
        self.challenge = None;
    }

    fn outcome(&self) -> SessionOutcome {
        let result = if self.cleared {
            SessionResult::Cleared
        } else if self.candidate.same_configuration(&self.original) {
            SessionResult::Unchanged
        } else {
            SessionResult::Replaced(self.candidate.clone())
        };
        SessionOutcome {
            original: self.original.clone(),
            result,
        }
    }

    fn lock_key(&self) -> Option<[u8; LOCK_KEY_LEN]> {
        self.candidate.lock_key().copied()
    }

    fn authorized(&self, peer: &PeerId) -> bool {
        !self.lock_state.is_locked() && self.owner.as_ref() == Some(peer)
    }

    /// Read `characteristic` starting at `offset` (ATT read blob).
    pub fn read(
        &mut self,
        peer: &PeerId,
        characteristic: Characteristic,
        offset: usize,
        now_ms: u64,
    ) -> GattResponse {
        let value = match characteristic {
            Characteristic::Unlock => {
                let mut challenge = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut challenge);
                self.challenge = Some(challenge);
                challenge.to_vec()
            }
            Characteristic::LockState => vec![self.lock_state.byte()],
            _ if !self.authorized(peer) => {
                return GattResponse::status(GattStatus::InsufficientAuthorization)
            }
            other => match self.read_unlocked(other, now_ms) {
                Ok(value) => value,
                Err(status) => return GattResponse::status(status),
            },
        };
        if offset > value.len() {
            return GattResponse::status(GattStatus::InvalidOffset);
        }
        GattResponse::ok(value[offset..].to_vec())
    }

    fn read_unlocked(&self, characteristic: Characteristic, now_ms: u64) -> Result<Vec<u8>, GattStatus> {
        match characteristic {
            Characteristic::Capabilities => {
                let mut out = vec![GATT_VERSION, self.max_slots, self.max_eid_slots, CAPABILITY_BITMAP];
                out.extend_from_slice(&SUPPORTED_FRAME_TYPES.to_be_bytes());
                out.extend(TxPowerLevel::ALL.iter().map(|l| l.radiated_dbm() as u8));
                Ok(out)
            }
            Characteristic::ActiveSlot => Ok(vec![0]),
            Characteristic::AdvertisingInterval => {
                Ok(self.candidate.advertise_mode.interval_ms().to_be_bytes().to_vec())
            }
            Characteristic::RadioTxPower => Ok(vec![self.candidate.tx_power_level.radiated_dbm() as u8]),
            Characteristic::AdvertisedTxPower => {
                Ok(vec![self.candidate.tx_power_level.zero_meter_dbm() as u8])
            }
            Characteristic::PublicEcdhKey => self
                .beacon_public_key
                .filter(|_| matches!(self.candidate.kind, BeaconKind::EddystoneEid(_)))
                .map(|k| k.as_bytes().to_vec())
                .ok_or(GattStatus::ReadNotPermitted),
            Characteristic::EidIdentityKey => match (&self.candidate.kind, self.lock_key()) {
                (BeaconKind::EddystoneEid(e), Some(lock)) => {
                    Ok(eid::aes_encrypt_block(&lock, &e.identity_key).to_vec())
                }
                _ => Err(GattStatus::ReadNotPermitted),
            },
            Characteristic::SlotData => Ok(self.slot_data(now_ms)),
            Characteristic::RemainConnectable => Ok(vec![0x00]),
            Characteristic::FactoryReset | Characteristic::LockState | Characteristic::Unlock => {
                Err(GattStatus::ReadNotPermitted)
            }
        }
    }

    fn slot_data(&self, now_ms: u64) -> Vec<u8> {
        if self.cleared {
            return Vec::new();
        }
        let tx = self.candidate.tx_power_level;
        match &self.candidate.kind {
            BeaconKind::EddystoneUid(uid) => codec::uid_frame(tx, &uid.namespace_instance),
            BeaconKind::EddystoneUrl(UrlBeacon { url: Some(url) }) => {
                codec::url_frame(tx, url).unwrap_or_default()
            }
            BeaconKind::EphemeralUrl(eph) => eph
                .short_url
                .as_deref()
                .and_then(|url| codec::url_frame(tx, url).ok())
                .unwrap_or_default(),
            BeaconKind::EddystoneEid(e) => {
                let counter = eid::time_counter_at(now_ms / 1000, e.clock_offset);
                let id = eid::compute_eid(&e.identity_key, counter, e.rotation_exponent);
                let mut out = vec![FRAME_TYPE_EID, e.rotation_exponent];
                out.extend_from_slice(&counter.to_be_bytes());
                out.extend_from_slice(&id);
                out
            }
            // Telemetry is sampled at broadcast time; only the header is known here.
            BeaconKind::EddystoneTlm(_) => codec::tlm_frame(&Telemetry::default())[..2].to_vec(),
            BeaconKind::EddystoneUrl(UrlBeacon { url: None }) | BeaconKind::Proximity(_) => Vec::new(),
        }
    }

    /// Write `value` to `characteristic`.
    pub fn write(
        &mut self,
        peer: &PeerId,
        characteristic: Characteristic,
        value: &[u8],
        now_ms: u64,
    ) -> GattResponse {
        if characteristic == Characteristic::Unlock {
            return self.unlock(peer, value);
        }
        if !self.authorized(peer) {
            return GattResponse::status(GattStatus::InsufficientAuthorization);
        }
        let status = match characteristic {
            Characteristic::ActiveSlot => match value {
                [0] => GattStatus::Success,
                [_] => GattStatus::WriteNotPermitted,
                _ => GattStatus::InvalidAttributeValueLength,
            },
            Characteristic::AdvertisingInterval => match value {
                [hi, lo] => {
                    let mode = AdvertiseMode::nearest(u16::from_be_bytes([*hi, *lo]));
                    self.edit(BeaconPatch {
                        advertise_mode: Some(mode),
                        ..Default::default()
                    })
                }
                _ => GattStatus::InvalidAttributeValueLength,
            },
            Characteristic::RadioTxPower => match value {
                [dbm] => self.edit(BeaconPatch {
                    tx_power_level: Some(TxPowerLevel::nearest_radiated(*dbm as i8)),
                    ..Default::default()
                }),
                _ => GattStatus::InvalidAttributeValueLength,
            },
            Characteristic::AdvertisedTxPower => match value {
                [dbm] => self.edit(BeaconPatch {
                    tx_power_level: Some(TxPowerLevel::nearest_zero_meter(*dbm as i8)),
                    ..Default::default()
                }),
                _ => GattStatus::InvalidAttributeValueLength,
            },
            Characteristic::LockState => self.write_lock_state(value),
            Characteristic::SlotData => self.write_slot(value, now_ms),
            Characteristic::FactoryReset => match value {
                [FACTORY_RESET] => {
                    info!("factory reset requested");
                    self.cleared = true;
                    GattStatus::Success
                }
                [_] => GattStatus::WriteNotPermitted,
                _ => GattStatus::InvalidAttributeValueLength,
            },
            Characteristic::RemainConnectable => match value {
                [0] => GattStatus::Success,
                [_] => GattStatus::WriteNotPermitted,
                _ => GattStatus::InvalidAttributeValueLength,
            },
            Characteristic::Capabilities
            | Characteristic::PublicEcdhKey
            | Characteristic::EidIdentityKey
            | Characteristic::Unlock => GattStatus::WriteNotPermitted,
        };
        GattResponse::status(status)
    }

    fn unlock(&mut self, peer: &PeerId, value: &[u8]) -> GattResponse {
        let Ok(token) = <[u8; 16]>::try_from(value) else {
            return GattResponse::status(GattStatus::InvalidAttributeValueLength);
        };
        // Every attempt consumes the outstanding challenge.
        let (Some(challenge), Some(lock)) = (self.challenge.take(), self.lock_key()) else {
            return GattResponse::status(GattStatus::InsufficientAuthorization);
        };
        if self.owner.as_ref().is_some_and(|o| o != peer)
            || eid::aes_encrypt_block(&lock, &challenge) != token
        {
            warn!(peer = %peer.0, "unlock rejected");
            return GattResponse::status(GattStatus::InsufficientAuthorization);
        }
        self.lock_state = LockState::Unlocked;
        self.owner = Some(peer.clone());
        let actions = self
            .connected
            .iter()
            .filter(|p| *p != peer)
            .cloned()
            .map(GattAction::Disconnect)
            .collect();
        self.connected.retain(|p| p == peer);
        if !self.connected.contains(peer) {
            self.connected.push(peer.clone());
        }
        info!(peer = %peer.0, "configuration session unlocked");
        GattResponse {
            status: GattStatus::Success,
            value: Vec::new(),
            actions,
        }
    }

    fn write_lock_state(&mut self, value: &[u8]) -> GattStatus {
        let next = match value.first() {
            Some(0x00) => LockState::Locked,
            Some(0x02) => LockState::UnlockedNoAutoRelock,
            Some(_) => return GattStatus::WriteNotPermitted,
            None => return GattStatus::InvalidAttributeValueLength,
        };
        match value.len() {
            1 => {}
            17 => {
                let Some(lock) = self.lock_key() else {
                    return GattStatus::UnlikelyError;
                };
                let mut wrapped = [0u8; 16];
                wrapped.copy_from_slice(&value[1..]);
                let new_key = eid::aes_decrypt_block(&lock, &wrapped);
                let status = self.edit(BeaconPatch {
                    lock_key: Some(new_key),
                    ..Default::default()
                });
                info!("lock key rotated");
                if status != GattStatus::Success {
                    return status;
                }
            }
            _ => return GattStatus::InvalidAttributeValueLength,
        }
        if next == LockState::Locked {
            self.relock();
        } else {
            self.lock_state = next;
        }
        GattStatus::Success
    }

    fn write_slot(&mut self, value: &[u8], now_ms: u64) -> GattStatus {
        let Some((&frame_type, body)) = value.split_first() else {
            debug!("slot cleared");
            self.cleared = true;
            return GattStatus::Success;
        };
        let kind = match frame_type {
            FRAME_TYPE_UID => {
                let Ok(namespace_instance) = <[u8; 16]>::try_from(body) else {
                    return GattStatus::InvalidAttributeValueLength;
                };
                let domain_hint = match &self.candidate.kind {
                    BeaconKind::EddystoneUid(uid) => uid.domain_hint.clone(),
                    _ => None,
                };
                BeaconKind::EddystoneUid(UidBeacon {
                    namespace_instance,
                    domain_hint,
                })
            }
            FRAME_TYPE_URL => {
                if body.is_empty() || body.len() > MAX_ENCODED_URL_LEN {
                    return GattStatus::InvalidAttributeValueLength;
                }
                match codec::decode_url(body) {
                    Some(url) => BeaconKind::EddystoneUrl(UrlBeacon { url: Some(url) }),
                    None => return GattStatus::WriteNotPermitted,
                }
            }
            FRAME_TYPE_TLM => {
                if !body.is_empty() {
                    return GattStatus::InvalidAttributeValueLength;
                }
                let refresh_interval_ms = match &self.candidate.kind {
                    BeaconKind::EddystoneTlm(tlm) => tlm.refresh_interval_ms,
                    _ => self.default_tlm_interval_ms,
                };
                BeaconKind::EddystoneTlm(TlmBeacon { refresh_interval_ms })
            }
            FRAME_TYPE_EID => match self.eid_from_write(body, now_ms) {
                Ok(kind) => kind,
                Err(status) => return status,
            },
            _ => return GattStatus::WriteNotPermitted,
        };
        let status = self.edit(BeaconPatch {
            kind: Some(kind),
            ..Default::default()
        });
        if status == GattStatus::Success {
            self.cleared = false;
        }
        status
    }

    /// EID slot write: either the configurator's public key (ECDH) or an
    /// identity key wrapped under the lock key, followed by the exponent.
    fn eid_from_write(&mut self, body: &[u8], now_ms: u64) -> Result<BeaconKind, GattStatus> {
        let (identity_key, exponent) = match body.len() {
            33 => {
                let mut peer_key = [0u8; 32];
                peer_key.copy_from_slice(&body[..32]);
                let server = PublicKey::from_bytes(peer_key);
                let keypair = Keypair::generate();
                let shared = keypair.shared_secret(&server);
                let derived =
                    eid::compute_identity_key(&shared, server.as_bytes(), keypair.public_key().as_bytes())
                        .map_err(|e| {
                            warn!(error = %e, "EID key agreement failed");
                            GattStatus::UnlikelyError
                        })?;
                self.beacon_public_key = Some(*keypair.public_key());
                (eid::identity_key_from(&derived), body[32])
            }
            17 => {
                let lock = self.lock_key().ok_or(GattStatus::UnlikelyError)?;
                let mut wrapped = [0u8; 16];
                wrapped.copy_from_slice(&body[..16]);
                (eid::aes_decrypt_block(&lock, &wrapped), body[16])
            }
            _ => return Err(GattStatus::InvalidAttributeValueLength),
        };
        if exponent > MAX_ROTATION_EXPONENT {
            return Err(GattStatus::WriteNotPermitted);
        }
        let now_s = now_ms / 1000;
        let clock_offset = eid::clock_offset_for(now_s, eid::align_time_counter(now_s));
        debug!(exponent, "EID slot configured");
        Ok(BeaconKind::EddystoneEid(EidBeacon {
            identity_key,
            rotation_exponent: exponent,
            clock_offset,
        }))
    }

    fn edit(&mut self, patch: BeaconPatch) -> GattStatus {
        let (next, _) = commit(&self.candidate, patch);
        self.candidate = next;
        GattStatus::Success
    }
}
