//! Beacon data model: definitions, lifecycle states, and the patch/commit editor.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BeaconFailure;

/// Lock keys (and every AES key in the protocol) are one AES block.
pub const LOCK_KEY_LEN: usize = 16;
pub const MAX_ROTATION_EXPONENT: u8 = 15;
pub const CLOCK_OFFSET_MIN: i32 = -65280;
pub const CLOCK_OFFSET_MAX: i32 = 255;
pub const TLM_INTERVAL_MIN_MS: u32 = 5_000;
pub const TLM_INTERVAL_MAX_MS: u32 = 300_000;

/// Advertising cadence requested from the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdvertiseMode {
    LowPower,
    Balanced,
    LowLatency,
}

impl AdvertiseMode {
    pub const ALL: [AdvertiseMode; 3] = [Self::LowLatency, Self::Balanced, Self::LowPower];

    /// Nominal advertising interval for this mode, in milliseconds.
    pub fn interval_ms(self) -> u16 {
        match self {
            Self::LowLatency => 100,
            Self::Balanced => 250,
            Self::LowPower => 1000,
        }
    }

    /// Mode whose interval is closest to `interval_ms` (ties go to the faster mode).
    pub fn nearest(interval_ms: u16) -> Self {
        Self::ALL
            .into_iter()
            .min_by_key(|m| m.interval_ms().abs_diff(interval_ms))
            .unwrap_or(Self::Balanced)
    }
}

/// Transmit power step requested from the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxPowerLevel {
    UltraLow,
    Low,
    Medium,
    High,
}

/// Radiated power per level, dBm.
const RADIATED_DBM: [i8; 4] = [-21, -15, -7, 1];
/// Received power at 0 m per level, dBm (Eddystone calibration).
const ZERO_METER_DBM: [i8; 4] = [-41, -35, -27, -19];
/// Path loss between 0 m and 1 m.
const ONE_METER_LOSS_DB: i8 = 41;

impl TxPowerLevel {
    pub const ALL: [TxPowerLevel; 4] = [Self::UltraLow, Self::Low, Self::Medium, Self::High];

    fn index(self) -> usize {
        match self {
            Self::UltraLow => 0,
            Self::Low => 1,
            Self::Medium => 2,
            Self::High => 3,
        }
    }

    pub fn radiated_dbm(self) -> i8 {
        RADIATED_DBM[self.index()]
    }

    /// Calibrated power at 0 m, the byte carried in Eddystone frames.
    pub fn zero_meter_dbm(self) -> i8 {
        ZERO_METER_DBM[self.index()]
    }

    /// Measured power at 1 m, the byte carried in proximity beacon frames.
    pub fn one_meter_dbm(self) -> i8 {
        self.zero_meter_dbm() - ONE_METER_LOSS_DB
    }

    /// Supported level whose radiated power is closest to `dbm` (ties go low).
    pub fn nearest_radiated(dbm: i8) -> Self {
        Self::nearest_by(dbm, Self::radiated_dbm)
    }

    /// Supported level whose 0 m calibration is closest to `dbm` (ties go low).
    pub fn nearest_zero_meter(dbm: i8) -> Self {
        Self::nearest_by(dbm, Self::zero_meter_dbm)
    }

    fn nearest_by(dbm: i8, table: fn(Self) -> i8) -> Self {
        Self::ALL
            .into_iter()
            .min_by_key(|l| (i16::from(table(*l)) - i16::from(dbm)).unsigned_abs())
            .unwrap_or(Self::Medium)
    }
}

/// What the user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActiveState {
    Enabled,
    Paused,
    Stopped,
}

/// What the radio is actually doing for a beacon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdvertiseStatus {
    /// Start requested; waiting on the adapter or the short-URL issuer.
    Waiting,
    Running,
    Failed,
    #[default]
    Stopped,
    NoRadio,
}

/// Manufacturer-data layout for proximity beacons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameFlavor {
    /// Apple layout (`0x02 0x15` prefix under company 0x004C).
    Native,
    /// AltBeacon layout (`0xBE 0xAC` prefix).
    Alt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlBeacon {
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidBeacon {
    /// 10-byte namespace followed by 6-byte instance.
    pub namespace_instance: [u8; 16],
    pub domain_hint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EidBeacon {
    pub identity_key: [u8; 16],
    pub rotation_exponent: u8,
    /// Wall-clock seconds minus the EID time counter.
    pub clock_offset: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlmBeacon {
    pub refresh_interval_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProximityBeacon {
    pub uuid: [u8; 16],
    pub major: u16,
    pub minor: u16,
    pub frame_flavor: FrameFlavor,
}

/// URL beacon whose broadcast URL is a short link minted by a remote issuer
/// and reissued before it expires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EphemeralUrlBeacon {
    /// Destination the short links resolve to (informational).
    pub url: Option<String>,
    pub url_id: String,
    pub url_token: String,
    pub time_to_live_s: u32,
    pub short_url: Option<String>,
    pub expire_time_ms: u64,
}

/// Per-variant payload configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeaconKind {
    EddystoneUrl(UrlBeacon),
    EddystoneUid(UidBeacon),
    EddystoneEid(EidBeacon),
    EddystoneTlm(TlmBeacon),
    Proximity(ProximityBeacon),
    EphemeralUrl(EphemeralUrlBeacon),
}

impl BeaconKind {
    pub fn is_eddystone(&self) -> bool {
        !matches!(self, Self::Proximity(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::EddystoneUrl(_) => "eddystone-url",
            Self::EddystoneUid(_) => "eddystone-uid",
            Self::EddystoneEid(_) => "eddystone-eid",
            Self::EddystoneTlm(_) => "eddystone-tlm",
            Self::Proximity(_) => "proximity",
            Self::EphemeralUrl(_) => "ephemeral-url",
        }
    }

    /// Clamp ranged fields into their valid windows.
    pub fn normalized(mut self) -> Self {
        match &mut self {
            Self::EddystoneEid(eid) => {
                eid.rotation_exponent = eid.rotation_exponent.min(MAX_ROTATION_EXPONENT);
                eid.clock_offset = eid.clock_offset.clamp(CLOCK_OFFSET_MIN, CLOCK_OFFSET_MAX);
            }
            Self::EddystoneTlm(tlm) => {
                tlm.refresh_interval_ms = tlm
                    .refresh_interval_ms
                    .clamp(TLM_INTERVAL_MIN_MS, TLM_INTERVAL_MAX_MS);
            }
            _ => {}
        }
        self
    }

    /// Copy with the fields that never reach the air blanked out.
    fn broadcast_view(&self) -> Self {
        match self {
            Self::EddystoneUid(uid) => Self::EddystoneUid(UidBeacon {
                domain_hint: None,
                ..uid.clone()
            }),
            Self::EphemeralUrl(eph) => Self::EphemeralUrl(EphemeralUrlBeacon {
                url: None,
                ..eph.clone()
            }),
            other => other.clone(),
        }
    }
}

/// Addresses a beacon from outside the core: by store row once saved,
/// by process-local id before that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BeaconKey {
    Persisted(u64),
    Ephemeral(Uuid),
}

impl fmt::Display for BeaconKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Persisted(id) => write!(f, "#{id}"),
            Self::Ephemeral(uuid) => write!(f, "~{uuid}"),
        }
    }
}

/// One logical beacon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeaconDefinition {
    id: u64,
    #[serde(skip, default = "Uuid::new_v4")]
    ephemeral_id: Uuid,
    pub name: Option<String>,
    pub advertise_mode: AdvertiseMode,
    pub tx_power_level: TxPowerLevel,
    pub connectable: bool,
    lock_key: Option<[u8; LOCK_KEY_LEN]>,
    pub active_state: ActiveState,
    #[serde(skip)]
    pub advertise_status: AdvertiseStatus,
    #[serde(skip)]
    pub failure: Option<BeaconFailure>,
    pub kind: BeaconKind,
}

impl BeaconDefinition {
    /// New unsaved definition. Eddystone variants get a random lock key.
    pub fn new(kind: BeaconKind) -> Self {
        let lock_key = kind.is_eddystone().then(random_lock_key);
        Self {
            id: 0,
            ephemeral_id: Uuid::new_v4(),
            name: None,
            advertise_mode: AdvertiseMode::Balanced,
            tx_power_level: TxPowerLevel::Medium,
            connectable: false,
            lock_key,
            active_state: ActiveState::Stopped,
            advertise_status: AdvertiseStatus::Stopped,
            failure: None,
            kind: kind.normalized(),
        }
    }

    /// Replace the generated lock key. Ignored for non-Eddystone variants.
    #[must_use]
    pub fn with_lock_key(mut self, key: [u8; LOCK_KEY_LEN]) -> Self {
        if self.kind.is_eddystone() {
            self.lock_key = Some(key);
        }
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Store row id, 0 while unsaved.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ephemeral_id(&self) -> Uuid {
        self.ephemeral_id
    }

    pub fn is_saved(&self) -> bool {
        self.id != 0
    }

    pub fn key(&self) -> BeaconKey {
        if self.id != 0 {
            BeaconKey::Persisted(self.id)
        } else {
            BeaconKey::Ephemeral(self.ephemeral_id)
        }
    }

    pub fn matches_key(&self, key: BeaconKey) -> bool {
        match key {
            BeaconKey::Persisted(id) => id != 0 && self.id == id,
            BeaconKey::Ephemeral(uuid) => self.ephemeral_id == uuid,
        }
    }

    /// Same logical beacon: by store id when `other` is saved, else by ephemeral id.
    pub fn same_identity(&self, other: &BeaconDefinition) -> bool {
        if other.id != 0 {
            self.id == other.id
        } else {
            self.ephemeral_id == other.ephemeral_id
        }
    }

    /// Assign the store id. Only the first assignment sticks.
    pub fn assign_id(&mut self, id: u64) {
        if self.id == 0 {
            self.id = id;
        }
    }

    pub fn lock_key(&self) -> Option<&[u8; LOCK_KEY_LEN]> {
        self.lock_key.as_ref()
    }

    /// Fields a user configures compare equal (runtime status ignored).
    pub fn same_configuration(&self, other: &BeaconDefinition) -> bool {
        self.name == other.name
            && self.advertise_mode == other.advertise_mode
            && self.tx_power_level == other.tx_power_level
            && self.connectable == other.connectable
            && self.lock_key == other.lock_key
            && self.kind == other.kind
    }

    /// Apply the invariants that loading from storage may have violated.
    pub(crate) fn normalize(&mut self) {
        self.kind = self.kind.clone().normalized();
        if self.kind.is_eddystone() && self.lock_key.is_none() {
            self.lock_key = Some(random_lock_key());
        }
        self.advertise_status = AdvertiseStatus::Stopped;
        self.failure = None;
    }
}

fn random_lock_key() -> [u8; LOCK_KEY_LEN] {
    let mut key = [0u8; LOCK_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Batched edit of a definition. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct BeaconPatch {
    pub name: Option<Option<String>>,
    pub advertise_mode: Option<AdvertiseMode>,
    pub tx_power_level: Option<TxPowerLevel>,
    pub connectable: Option<bool>,
    pub lock_key: Option<[u8; LOCK_KEY_LEN]>,
    pub kind: Option<BeaconKind>,
}

impl BeaconPatch {
    /// Patch that turns any definition's configuration into `target`'s.
    pub fn replace_with(target: &BeaconDefinition) -> Self {
        Self {
            name: Some(target.name.clone()),
            advertise_mode: Some(target.advertise_mode),
            tx_power_level: Some(target.tx_power_level),
            connectable: Some(target.connectable),
            lock_key: target.lock_key,
            kind: Some(target.kind.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.advertise_mode.is_none()
            && self.tx_power_level.is_none()
            && self.connectable.is_none()
            && self.lock_key.is_none()
            && self.kind.is_none()
    }
}

/// Apply `patch` to `definition`. Returns the edited copy and whether the
/// live advertiser must be torn down and recreated for the edit to take effect.
pub fn commit(definition: &BeaconDefinition, patch: BeaconPatch) -> (BeaconDefinition, bool) {
    let mut next = definition.clone();
    let mut restart_required = false;

    if let Some(name) = patch.name {
        next.name = name;
    }
    if let Some(mode) = patch.advertise_mode {
        restart_required |= mode != definition.advertise_mode;
        next.advertise_mode = mode;
    }
    if let Some(level) = patch.tx_power_level {
        restart_required |= level != definition.tx_power_level;
        next.tx_power_level = level;
    }
    if let Some(connectable) = patch.connectable {
        restart_required |= connectable != definition.connectable;
        next.connectable = connectable;
    }
    if let Some(kind) = patch.kind {
        let mut kind = kind.normalized();
        if let (BeaconKind::EphemeralUrl(old), BeaconKind::EphemeralUrl(new)) =
            (&definition.kind, &mut kind)
        {
            // A different remote resource invalidates the minted short link.
            if old.url_id != new.url_id
                || old.url_token != new.url_token
                || old.time_to_live_s != new.time_to_live_s
            {
                new.short_url = None;
                new.expire_time_ms = 0;
            }
        }
        restart_required |= kind.broadcast_view() != definition.kind.broadcast_view();
        next.kind = kind;
    }

    if next.kind.is_eddystone() {
        if let Some(key) = patch.lock_key {
            next.lock_key = Some(key);
        } else if next.lock_key.is_none() {
            next.lock_key = Some(random_lock_key());
        }
    } else {
        next.lock_key = None;
    }

    (next, restart_required)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url_beacon(url: &str) -> BeaconDefinition {
        BeaconDefinition::new(BeaconKind::EddystoneUrl(UrlBeacon {
            url: Some(url.to_string()),
        }))
    }

    #[test]
    fn eddystone_gets_lock_key_proximity_does_not() {
        assert!(url_beacon("https://example.com").lock_key().is_some());
        let prox = BeaconDefinition::new(BeaconKind::Proximity(ProximityBeacon {
            uuid: [7; 16],
            major: 1,
            minor: 2,
            frame_flavor: FrameFlavor::Native,
        }));
        assert!(prox.lock_key().is_none());
    }

    #[test]
    fn assign_id_only_once() {
        let mut b = url_beacon("https://example.com");
        assert_eq!(b.key(), BeaconKey::Ephemeral(b.ephemeral_id()));
        b.assign_id(4);
        b.assign_id(9);
        assert_eq!(b.id(), 4);
        assert_eq!(b.key(), BeaconKey::Persisted(4));
        assert!(b.matches_key(BeaconKey::Ephemeral(b.ephemeral_id())));
    }

    #[test]
    fn ranges_are_clamped() {
        let eid = BeaconDefinition::new(BeaconKind::EddystoneEid(EidBeacon {
            identity_key: [1; 16],
            rotation_exponent: 22,
            clock_offset: -100_000,
        }));
        match eid.kind {
            BeaconKind::EddystoneEid(e) => {
                assert_eq!(e.rotation_exponent, 15);
                assert_eq!(e.clock_offset, CLOCK_OFFSET_MIN);
            }
            _ => panic!("expected EID"),
        }
        let tlm = BeaconDefinition::new(BeaconKind::EddystoneTlm(TlmBeacon {
            refresh_interval_ms: 10,
        }));
        assert!(matches!(
            tlm.kind,
            BeaconKind::EddystoneTlm(TlmBeacon { refresh_interval_ms: TLM_INTERVAL_MIN_MS })
        ));
    }

    #[test]
    fn name_change_does_not_restart() {
        let b = url_beacon("https://example.com");
        let (next, restart) = commit(
            &b,
            BeaconPatch {
                name: Some(Some("lobby".into())),
                ..Default::default()
            },
        );
        assert!(!restart);
        assert_eq!(next.name.as_deref(), Some("lobby"));
    }

    #[test]
    fn payload_and_settings_changes_restart() {
        let b = url_beacon("https://example.com");
        let (_, restart) = commit(
            &b,
            BeaconPatch {
                kind: Some(BeaconKind::EddystoneUrl(UrlBeacon {
                    url: Some("https://example.org".into()),
                })),
                ..Default::default()
            },
        );
        assert!(restart);

        let (_, restart) = commit(
            &b,
            BeaconPatch {
                tx_power_level: Some(TxPowerLevel::High),
                ..Default::default()
            },
        );
        assert!(restart);

        let (_, restart) = commit(
            &b,
            BeaconPatch {
                tx_power_level: Some(b.tx_power_level),
                ..Default::default()
            },
        );
        assert!(!restart, "same value is not a change");
    }

    #[test]
    fn domain_hint_is_not_broadcast() {
        let b = BeaconDefinition::new(BeaconKind::EddystoneUid(UidBeacon {
            namespace_instance: [3; 16],
            domain_hint: None,
        }));
        let (_, restart) = commit(
            &b,
            BeaconPatch {
                kind: Some(BeaconKind::EddystoneUid(UidBeacon {
                    namespace_instance: [3; 16],
                    domain_hint: Some("example.com".into()),
                })),
                ..Default::default()
            },
        );
        assert!(!restart);
    }

    #[test]
    fn ephemeral_resource_change_drops_short_url() {
        let b = BeaconDefinition::new(BeaconKind::EphemeralUrl(EphemeralUrlBeacon {
            url: None,
            url_id: "a".into(),
            url_token: "t".into(),
            time_to_live_s: 60,
            short_url: Some("https://goo.gl/x".into()),
            expire_time_ms: 10_000,
        }));
        let mut kind = b.kind.clone();
        if let BeaconKind::EphemeralUrl(e) = &mut kind {
            e.url_id = "b".into();
        }
        let (next, restart) = commit(
            &b,
            BeaconPatch {
                kind: Some(kind),
                ..Default::default()
            },
        );
        assert!(restart);
        match next.kind {
            BeaconKind::EphemeralUrl(e) => {
                assert!(e.short_url.is_none());
                assert_eq!(e.expire_time_ms, 0);
            }
            _ => panic!("expected ephemeral URL"),
        }
    }

    #[test]
    fn switching_to_proximity_drops_lock_key() {
        let b = url_beacon("https://example.com");
        let (next, restart) = commit(
            &b,
            BeaconPatch {
                kind: Some(BeaconKind::Proximity(ProximityBeacon {
                    uuid: [0; 16],
                    major: 0,
                    minor: 0,
                    frame_flavor: FrameFlavor::Alt,
                })),
                ..Default::default()
            },
        );
        assert!(restart);
        assert!(next.lock_key().is_none());
    }

    #[test]
    fn nearest_resolution() {
        assert_eq!(AdvertiseMode::nearest(120), AdvertiseMode::LowLatency);
        assert_eq!(AdvertiseMode::nearest(600), AdvertiseMode::Balanced);
        assert_eq!(AdvertiseMode::nearest(5000), AdvertiseMode::LowPower);
        assert_eq!(TxPowerLevel::nearest_radiated(-30), TxPowerLevel::UltraLow);
        assert_eq!(TxPowerLevel::nearest_radiated(-8), TxPowerLevel::Medium);
        assert_eq!(TxPowerLevel::nearest_radiated(20), TxPowerLevel::High);
        assert_eq!(TxPowerLevel::nearest_zero_meter(-36), TxPowerLevel::Low);
    }

    #[test]
    fn serde_skips_runtime_fields() {
        let mut b = url_beacon("https://example.com");
        b.assign_id(3);
        b.advertise_status = AdvertiseStatus::Running;
        let json = serde_json::to_string(&b).unwrap();
        let back: BeaconDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id(), 3);
        assert_eq!(back.advertise_status, AdvertiseStatus::Stopped);
        assert_ne!(back.ephemeral_id(), b.ephemeral_id());
        assert!(back.same_configuration(&b));
    }
}
