//! EID engine: X25519 key agreement, identity-key derivation, rotating identifiers.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::beacon::{CLOCK_OFFSET_MAX, CLOCK_OFFSET_MIN, MAX_ROTATION_EXPONENT};

type HmacSha256 = Hmac<Sha256>;

/// X25519 public key (32 bytes) as exchanged with a registration authority or
/// a GATT configurator.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// X25519 keypair. The secret never leaves this struct.
pub struct Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Raw ECDH output with `other`. May be all zeros for low-order points;
    /// [`compute_identity_key`] rejects that case.
    pub fn shared_secret(&self, other: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(other.0);
        self.secret.diffie_hellman(&other).to_bytes()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("ECDH produced an all-zero shared secret")]
    DegenerateSharedSecret,
    #[error("cipher initialization failed")]
    Cipher,
}

/// AES-128-ECB encryption of one block.
pub fn aes_encrypt_block(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut buf = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut buf);
    buf.into()
}

/// AES-128-ECB decryption of one block.
pub fn aes_decrypt_block(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut buf = GenericArray::clone_from_slice(block);
    cipher.decrypt_block(&mut buf);
    buf.into()
}

/// HKDF-SHA256 with the two public keys (server first) as salt and a single
/// `0x01` info/counter byte. Callers use the first 16 bytes as the identity key.
pub fn compute_identity_key(
    shared_secret: &[u8; 32],
    server_public_key: &[u8; 32],
    beacon_public_key: &[u8; 32],
) -> Result<[u8; 32], CryptoError> {
    if shared_secret.iter().all(|&b| b == 0) {
        return Err(CryptoError::DegenerateSharedSecret);
    }
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(server_public_key);
    salt[32..].copy_from_slice(beacon_public_key);

    let mut extract = <HmacSha256 as Mac>::new_from_slice(&salt).map_err(|_| CryptoError::Cipher)?;
    extract.update(shared_secret);
    let prk = extract.finalize().into_bytes();

    let mut expand = <HmacSha256 as Mac>::new_from_slice(&prk).map_err(|_| CryptoError::Cipher)?;
    expand.update(&[0x01]);
    Ok(expand.finalize().into_bytes().into())
}

/// Truncate a derived key to the 16-byte identity key Eddystone uses.
pub fn identity_key_from(derived: &[u8; 32]) -> [u8; 16] {
    let mut key = [0u8; 16];
    key.copy_from_slice(&derived[..16]);
    key
}

/// 8-byte ephemeral identifier for `time_counter` (seconds). The low
/// `rotation_exponent` bits of the counter are ignored.
pub fn compute_eid(identity_key: &[u8; 16], time_counter: u32, rotation_exponent: u8) -> [u8; 8] {
    let exponent = rotation_exponent.min(MAX_ROTATION_EXPONENT);

    let mut temp_block = [0u8; 16];
    temp_block[11] = 0xFF;
    temp_block[14..16].copy_from_slice(&((time_counter >> 16) as u16).to_be_bytes());
    let temporary_key = aes_encrypt_block(identity_key, &temp_block);

    let masked = (time_counter >> exponent) << exponent;
    let mut eid_block = [0u8; 16];
    eid_block[11] = exponent;
    eid_block[12..16].copy_from_slice(&masked.to_be_bytes());
    let out = aes_encrypt_block(&temporary_key, &eid_block);

    let mut eid = [0u8; 8];
    eid.copy_from_slice(&out[..8]);
    eid
}

/// Starting counter for a fresh registration: keeps the upper 16 bits of
/// `now_s` and pins the lower ones at 0xFF00.
pub fn align_time_counter(now_s: u64) -> u32 {
    ((now_s as u32) & !0xFFFF) | 0xFF00
}

/// `clock_offset` that maps wall-clock `now_s` onto `time_counter`.
pub fn clock_offset_for(now_s: u64, time_counter: u32) -> i32 {
    let delta = i64::from(now_s as u32) - i64::from(time_counter);
    delta.clamp(i64::from(CLOCK_OFFSET_MIN), i64::from(CLOCK_OFFSET_MAX)) as i32
}

/// EID time counter at wall-clock `now_s`.
pub fn time_counter_at(now_s: u64, clock_offset: i32) -> u32 {
    (now_s as i64 - i64::from(clock_offset)) as u32
}

/// Wall-clock second at which the identifier current at `time_counter` stops
/// being valid: the next rotation boundary, translated back through the offset.
pub fn next_rotation_s(time_counter: u32, rotation_exponent: u8, clock_offset: i32) -> u64 {
    let exponent = u32::from(rotation_exponent.min(MAX_ROTATION_EXPONENT));
    let boundary = ((u64::from(time_counter) >> exponent) + 1) << exponent;
    (boundary as i64 + i64::from(clock_offset)).max(0) as u64
}

/// Identifier the beacon broadcasts at wall-clock `now_s`.
pub fn current_eid(identity_key: &[u8; 16], rotation_exponent: u8, clock_offset: i32, now_s: u64) -> [u8; 8] {
    compute_eid(identity_key, time_counter_at(now_s, clock_offset), rotation_exponent)
}

/// Result of a completed registration, ready to store on an EID beacon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredEid {
    pub identity_key: [u8; 16],
    pub rotation_exponent: u8,
    pub clock_offset: i32,
    pub time_counter: u32,
    /// First identifier, sent to the authority for verification.
    pub initial_eid: [u8; 8],
}

/// Beacon side of EID registration: publish [`EidRegistration::public_key`] to
/// the authority, then complete with the authority's public key.
pub struct EidRegistration {
    keypair: Keypair,
    rotation_exponent: u8,
}

impl EidRegistration {
    pub fn new(rotation_exponent: u8) -> Self {
        Self {
            keypair: Keypair::generate(),
            rotation_exponent: rotation_exponent.min(MAX_ROTATION_EXPONENT),
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }

    pub fn complete(&self, authority: &PublicKey, now_s: u64) -> Result<RegisteredEid, CryptoError> {
        let shared = self.keypair.shared_secret(authority);
        let derived = compute_identity_key(&shared, authority.as_bytes(), self.public_key().as_bytes())?;
        let identity_key = identity_key_from(&derived);
        let time_counter = align_time_counter(now_s);
        Ok(RegisteredEid {
            identity_key,
            rotation_exponent: self.rotation_exponent,
            clock_offset: clock_offset_for(now_s, time_counter),
            time_counter,
            initial_eid: compute_eid(&identity_key, time_counter, self.rotation_exponent),
        })
    }
}

/// Authority side: derive the same identity key from its own secret and the
/// beacon's published public key.
pub fn authority_identity_key(authority: &Keypair, beacon: &PublicKey) -> Result<[u8; 16], CryptoError> {
    let shared = authority.shared_secret(beacon);
    let derived = compute_identity_key(&shared, authority.public_key().as_bytes(), beacon.as_bytes())?;
    Ok(identity_key_from(&derived))
}

/// Authority check that a beacon's first identifier matches the derived key.
pub fn verify_registered_eid(identity_key: &[u8; 16], time_counter: u32, rotation_exponent: u8, eid: &[u8; 8]) -> bool {
    compute_eid(identity_key, time_counter, rotation_exponent) == *eid
}
