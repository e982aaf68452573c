//! Error taxonomy for the beacon core.
//!
//! Module-level errors (`FrameError`, `CryptoError`, `StoreError`) convert into
//! [`BeaconError`], which is what the registry hands back to the host.
//! [`BeaconFailure`] is the cloneable record kept on a definition whose
//! advertise status is `Failed`, so the reason survives until the next retry.

use crate::beacon::BeaconKey;
use crate::codec::FrameError;
use crate::eid::CryptoError;
use crate::host::StoreError;

/// Why the radio could not be used for a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RadioUnavailable {
    #[error("adapter is off")]
    Disabled,
    #[error("adapter does not support multiple advertisements")]
    MultiAdvertiseUnsupported,
}

/// Failure recorded on a beacon that could not broadcast.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BeaconFailure {
    #[error("payload encoding failed: {0}")]
    Encoding(String),
    #[error("adapter rejected advertisement (code {code}: {})", rejected_name(.code))]
    Rejected { code: i32 },
    #[error("short URL issuer failed: {0}")]
    Issuer(String),
}

/// Errors returned by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum BeaconError {
    #[error("payload encoding failed: {0}")]
    Encoding(#[from] FrameError),

    #[error("radio unavailable: {0}")]
    RadioUnavailable(#[from] RadioUnavailable),

    #[error("adapter rejected advertisement (code {code}: {})", rejected_name(.code))]
    AdvertiseRejected { code: i32 },

    #[error("crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("short URL issuer failed: {0}")]
    Issuer(String),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("unknown beacon {0}")]
    UnknownBeacon(BeaconKey),

    #[error("beacon {0} has no lock key and cannot be configured over GATT")]
    NotConfigurable(BeaconKey),
}

pub type Result<T> = std::result::Result<T, BeaconError>;

impl BeaconError {
    /// Machine-readable code for host logs and status reporting.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Encoding(_) => "ENCODING_FAILURE",
            Self::RadioUnavailable(_) => "RADIO_UNAVAILABLE",
            Self::AdvertiseRejected { .. } => "ADVERTISE_REJECTED",
            Self::Crypto(_) => "CRYPTO_FAILURE",
            Self::Issuer(_) => "ISSUER_FAILURE",
            Self::Store(_) => "STORE_FAILURE",
            Self::UnknownBeacon(_) => "UNKNOWN_BEACON",
            Self::NotConfigurable(_) => "NOT_CONFIGURABLE",
        }
    }

    /// True when the core retries on its own once the triggering condition
    /// clears (the adapter coming back on). Everything else waits for an
    /// explicit start.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::RadioUnavailable(_))
    }
}

impl From<BeaconFailure> for BeaconError {
    fn from(failure: BeaconFailure) -> Self {
        match failure {
            BeaconFailure::Encoding(reason) => Self::Encoding(FrameError::Invalid(reason)),
            BeaconFailure::Rejected { code } => Self::AdvertiseRejected { code },
            BeaconFailure::Issuer(message) => Self::Issuer(message),
        }
    }
}

fn rejected_name(code: &i32) -> &'static str {
    describe_advertise_error(*code)
}

/// Human-readable name for an adapter advertise error code.
pub fn describe_advertise_error(code: i32) -> &'static str {
    match code {
        1 => "data too large",
        2 => "too many advertisers",
        3 => "already started",
        4 => "internal error",
        5 => "feature unsupported",
        _ => "unknown error",
    }
}
