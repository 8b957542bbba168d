//! Value encryption and the password ring
//!
//! Stored form: salt (16) || nonce (12) || ciphertext || tag (16).
//! The key is PBKDF2-HMAC-SHA256 over the password and the per-value salt.

use std::num::NonZeroU32;
use std::path::Path;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{StoreError, StoreResult};

/// Value of the `crypt` attribute on encrypted entries
pub const CRYPT_TAG: &[u8] = b"aes256gcm";

const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;
const PBKDF2_ITERATIONS: u32 = 4096;

fn derive_key(password: &str, salt: &[u8]) -> StoreResult<LessSafeKey> {
    let iterations = NonZeroU32::new(PBKDF2_ITERATIONS)
        .ok_or_else(|| StoreError::Config("pbkdf2 iteration count is zero".into()))?;
    let mut key = [0u8; KEY_LEN];
    pbkdf2::derive(pbkdf2::PBKDF2_HMAC_SHA256, iterations, salt, password.as_bytes(), &mut key);
    let unbound = UnboundKey::new(&AES_256_GCM, &key)
        .map_err(|_| StoreError::Config("failed to build AES-256-GCM key".into()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `plaintext` under `password`.
pub fn seal(password: &str, plaintext: &[u8]) -> StoreResult<Vec<u8>> {
    let rng = SystemRandom::new();
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill(&mut salt)
        .and_then(|_| rng.fill(&mut nonce))
        .map_err(|_| StoreError::Config("system random source unavailable".into()))?;

    let key = derive_key(password, &salt)?;
    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
        .map_err(|_| StoreError::Config("value encryption failed".into()))?;

    let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + in_out.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&in_out);
    Ok(out)
}

/// Decrypt a sealed value. `None` when the password does not fit or the
/// value is malformed.
pub fn open(password: &str, stored: &[u8]) -> Option<Vec<u8>> {
    if stored.len() < SALT_LEN + NONCE_LEN + AES_256_GCM.tag_len() {
        return None;
    }
    let (salt, rest) = stored.split_at(SALT_LEN);
    let (nonce, sealed) = rest.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce).ok()?;
    let key = derive_key(password, salt).ok()?;

    let mut buf = sealed.to_vec();
    let plain_len = key.open_in_place(nonce, Aad::empty(), &mut buf).ok()?.len();
    buf.truncate(plain_len);
    Some(buf)
}

/// Default encryption password plus the decryption ring.
#[derive(Default, Clone)]
pub struct PasswordRing {
    default: Option<String>,
    ring: Vec<String>,
}

impl std::fmt::Debug for PasswordRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordRing")
            .field("has_default", &self.default.is_some())
            .field("ring_len", &self.ring.len())
            .finish()
    }
}

impl PasswordRing {
    pub fn set_default(&mut self, password: impl Into<String>) {
        self.default = Some(password.into());
    }

    pub fn default_password(&self) -> Option<&str> {
        self.default.as_deref()
    }

    /// Append to the ring; a password already present is not added twice.
    pub fn add(&mut self, password: impl Into<String>) {
        let password = password.into();
        if !self.ring.contains(&password) {
            self.ring.push(password);
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len() + usize::from(self.default.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load a password file: one password per line, blank lines skipped.
    /// The first password becomes the default, the rest join the ring.
    pub fn load_file(&mut self, path: &Path) -> StoreResult<usize> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| StoreError::io_at(path, &e, "failed to read password file"))?;
        let mut loaded = 0;
        for line in text.lines().map(str::trim_end).filter(|l| !l.is_empty()) {
            if loaded == 0 {
                self.set_default(line);
            } else {
                self.add(line);
            }
            loaded += 1;
        }
        if loaded == 0 {
            return Err(StoreError::Config(format!("password file {} is empty", path.display())));
        }
        Ok(loaded)
    }

    /// An explicit password is the only one tried. Otherwise the default
    /// goes first, then the ring in registration order.
    pub fn decrypt(&self, stored: &[u8], explicit: Option<&str>) -> StoreResult<Vec<u8>> {
        if let Some(password) = explicit {
            return open(password, stored)
                .ok_or_else(|| StoreError::Decrypt("supplied password does not decrypt the value".into()));
        }
        self.default
            .iter()
            .chain(self.ring.iter())
            .find_map(|p| open(p, stored))
            .ok_or_else(|| {
                StoreError::Decrypt(format!("none of {} registered password(s) decrypts the value", self.len()))
            })
    }
}
