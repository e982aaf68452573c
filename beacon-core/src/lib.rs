//! Beacon lifecycle core: payload codecs, EID cryptography, advertising-slot
//! multiplexing, refresh scheduling and the Eddystone-GATT configuration service.
//! Host-driven: no I/O; the host passes events in and the core calls out
//! through the collaborator traits in [`host`] and [`advertising::RadioAdapter`].
//!
//! The GATT attribute server itself is host territory: the host opens a
//! session with [`BeaconRegistry::begin_configuration`], forwards connection
//! events and characteristic access to the returned [`GattConfigService`], and
//! hands the session outcome to [`BeaconRegistry::end_configuration`].

pub mod advertising;
pub mod beacon;
pub mod codec;
pub mod config;
pub mod eid;
pub mod error;
pub mod gatt;
pub mod host;
pub mod registry;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use advertising::{
    AdvertiseHandle, AdvertisePayload, AdvertiseRequest, AdvertiseSettings, RadioAdapter,
};
pub use beacon::{
    commit, ActiveState, AdvertiseMode, AdvertiseStatus, BeaconDefinition, BeaconKey, BeaconKind,
    BeaconPatch, TxPowerLevel,
};
pub use codec::{decode_url, encode_url, FrameError, Telemetry};
pub use config::CoreConfig;
pub use eid::{
    compute_eid, compute_identity_key, CryptoError, EidRegistration, Keypair, PublicKey, RegisteredEid,
};
pub use error::{BeaconError, BeaconFailure, RadioUnavailable, Result};
pub use gatt::{
    Characteristic, GattAction, GattConfigService, GattResponse, GattStatus, PeerId, SessionOutcome,
};
pub use host::{
    Collaborators, MemoryStore, PersistentStore, ShortUrl, ShortUrlIssuer, ShortUrlRequest,
    StateNotifier, StoreError, TelemetrySource, WakeHost,
};
pub use registry::BeaconRegistry;
