//! Payload codecs: Eddystone-URL compression and the per-type frame layouts.

use crate::beacon::{FrameFlavor, TxPowerLevel};

/// 16-bit service UUID all Eddystone frames are broadcast under.
pub const EDDYSTONE_SERVICE_UUID16: u16 = 0xFEAA;

pub const FRAME_TYPE_UID: u8 = 0x00;
pub const FRAME_TYPE_URL: u8 = 0x10;
pub const FRAME_TYPE_TLM: u8 = 0x20;
pub const FRAME_TYPE_EID: u8 = 0x30;

pub const APPLE_COMPANY_ID: u16 = 0x004C;
pub const ALTBEACON_COMPANY_ID: u16 = 0x0118;

/// Longest encoded URL (scheme byte included) that fits a URL frame.
pub const MAX_ENCODED_URL_LEN: usize = 18;

const TLM_VERSION_UNENCRYPTED: u8 = 0x00;
const TLM_TEMPERATURE_UNKNOWN: i16 = i16::MIN;

/// Scheme prefixes, indexed by their code byte. Longer prefixes are tried first.
const URL_SCHEMES: [&str; 4] = ["http://www.", "https://www.", "http://", "https://"];

/// Expansion tokens, indexed by their code byte. Slash variants precede the
/// bare ones so first match is longest match.
const URL_EXPANSIONS: [&str; 14] = [
    ".com/", ".org/", ".edu/", ".net/", ".info/", ".biz/", ".gov/", ".com", ".org", ".edu",
    ".net", ".info", ".biz", ".gov",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("URL uses an unsupported scheme or character")]
    UnsupportedUrl,
    #[error("encoded URL is {len} bytes, limit is {MAX_ENCODED_URL_LEN}")]
    UrlTooLong { len: usize },
    #[error("{0}")]
    Invalid(String),
}

fn is_literal_url_byte(b: u8) -> bool {
    (0x21..=0x7E).contains(&b) && b != b'"'
}

/// Compress a URL with the Eddystone-URL scheme. `None` when the scheme is not
/// one of the four supported prefixes or the URL contains a byte outside
/// printable ASCII (space and `"` excluded).
pub fn encode_url(url: &str) -> Option<Vec<u8>> {
    let (scheme, rest) = [1usize, 0, 3, 2]
        .into_iter()
        .find_map(|i| url.strip_prefix(URL_SCHEMES[i]).map(|rest| (i, rest)))?;
    let bytes = rest.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() + 1);
    out.push(scheme as u8);
    let mut i = 0;
    while i < bytes.len() {
        let expansion = URL_EXPANSIONS
            .iter()
            .position(|token| bytes[i..].starts_with(token.as_bytes()));
        if let Some(code) = expansion {
            out.push(code as u8);
            i += URL_EXPANSIONS[code].len();
            continue;
        }
        if !is_literal_url_byte(bytes[i]) {
            return None;
        }
        out.push(bytes[i]);
        i += 1;
    }
    Some(out)
}

/// Expand an Eddystone-URL byte sequence back to text.
pub fn decode_url(bytes: &[u8]) -> Option<String> {
    let (&scheme, rest) = bytes.split_first()?;
    let mut out = Vec::with_capacity(bytes.len() + 16);
    out.extend_from_slice(URL_SCHEMES.get(usize::from(scheme))?.as_bytes());
    for &b in rest {
        if b <= 0x20 {
            out.extend_from_slice(URL_EXPANSIONS.get(usize::from(b))?.as_bytes());
        } else {
            out.push(b);
        }
    }
    String::from_utf8(out).ok()
}

/// UID frame: type, 0 m power, 10-byte namespace, 6-byte instance, 2 reserved bytes.
pub fn uid_frame(tx: TxPowerLevel, namespace_instance: &[u8; 16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(20);
    out.push(FRAME_TYPE_UID);
    out.push(tx.zero_meter_dbm() as u8);
    out.extend_from_slice(namespace_instance);
    out.extend_from_slice(&[0, 0]);
    out
}

/// URL frame: type, 0 m power, encoded URL.
pub fn url_frame(tx: TxPowerLevel, url: &str) -> Result<Vec<u8>, FrameError> {
    let encoded = encode_url(url).ok_or(FrameError::UnsupportedUrl)?;
    if encoded.len() > MAX_ENCODED_URL_LEN {
        return Err(FrameError::UrlTooLong { len: encoded.len() });
    }
    let mut out = Vec::with_capacity(2 + encoded.len());
    out.push(FRAME_TYPE_URL);
    out.push(tx.zero_meter_dbm() as u8);
    out.extend_from_slice(&encoded);
    Ok(out)
}

/// EID frame: type, 0 m power, 8-byte ephemeral identifier.
pub fn eid_frame(tx: TxPowerLevel, eid: &[u8; 8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    out.push(FRAME_TYPE_EID);
    out.push(tx.zero_meter_dbm() as u8);
    out.extend_from_slice(eid);
    out
}

/// Local sensor snapshot carried by a TLM frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Telemetry {
    pub battery_millivolts: u16,
    pub temperature_celsius: Option<f32>,
    pub advertising_count: u32,
    /// Time since boot in 0.1 s units.
    pub uptime_deciseconds: u32,
}

/// Unencrypted TLM frame. Temperature is signed 8.8 fixed point, 0x8000 when unknown.
pub fn tlm_frame(telemetry: &Telemetry) -> Vec<u8> {
    let temperature = telemetry
        .temperature_celsius
        .map_or(TLM_TEMPERATURE_UNKNOWN, |c| {
            (c * 256.0).round().clamp(f32::from(i16::MIN + 1), f32::from(i16::MAX)) as i16
        });
    let mut out = Vec::with_capacity(14);
    out.push(FRAME_TYPE_TLM);
    out.push(TLM_VERSION_UNENCRYPTED);
    out.extend_from_slice(&telemetry.battery_millivolts.to_be_bytes());
    out.extend_from_slice(&temperature.to_be_bytes());
    out.extend_from_slice(&telemetry.advertising_count.to_be_bytes());
    out.extend_from_slice(&telemetry.uptime_deciseconds.to_be_bytes());
    out
}

/// Proximity beacon manufacturer data. Returns (company id, data).
pub fn proximity_frame(
    flavor: FrameFlavor,
    tx: TxPowerLevel,
    uuid: &[u8; 16],
    major: u16,
    minor: u16,
) -> (u16, Vec<u8>) {
    let mut out = Vec::with_capacity(24);
    let company = match flavor {
        FrameFlavor::Native => {
            out.extend_from_slice(&[0x02, 0x15]);
            APPLE_COMPANY_ID
        }
        FrameFlavor::Alt => {
            out.extend_from_slice(&[0xBE, 0xAC]);
            ALTBEACON_COMPANY_ID
        }
    };
    out.extend_from_slice(uuid);
    out.extend_from_slice(&major.to_be_bytes());
    out.extend_from_slice(&minor.to_be_bytes());
    out.push(tx.one_meter_dbm() as u8);
    if flavor == FrameFlavor::Alt {
        // manufacturer reserved
        out.push(0x00);
    }
    (company, out)
}
