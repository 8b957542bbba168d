//! Entry model and its binary encoding
//!
//! An [`Entry`] is what one key owns: its stored value, the ordered subkey
//! list, attribute pairs and an optional expiration. On pages an entry is
//! framed as a record: a 24-byte header carrying a sequence number and a
//! CRC32C, followed by the entry body. Archives and transaction snapshots
//! reuse the body encoding.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{StoreError, StoreResult};
use crate::format::{put_bytes, PayloadReader};

/// Record magic: 'K','H','R','C'
pub const RECORD_MAGIC: [u8; 4] = [0x4B, 0x48, 0x52, 0x43];

/// Record header size in bytes
pub const RECORD_HEADER_SIZE: usize = 24;

const RECORD_VERSION: u8 = 1;

/// One key's complete state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Entry {
    pub key: Vec<u8>,
    /// Value in stored form (ciphertext when the `crypt` attribute is set)
    pub value: Vec<u8>,
    /// Child key references, duplicates excluded, in insertion order
    pub subkeys: Vec<Vec<u8>>,
    /// Attribute pairs in insertion order
    pub attrs: Vec<(Vec<u8>, Vec<u8>)>,
    /// Expiration in whole seconds since the Unix epoch
    pub expire_at: Option<u64>,
}

impl Entry {
    pub fn new(key: &[u8]) -> Self {
        Self { key: key.to_vec(), ..Self::default() }
    }

    pub fn is_expired(&self, now_secs: u64) -> bool {
        matches!(self.expire_at, Some(at) if at <= now_secs)
    }

    pub fn attr(&self, name: &[u8]) -> Option<&[u8]> {
        self.attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_slice())
    }

    /// Overwrite in place when present, append otherwise.
    pub fn set_attr(&mut self, name: &[u8], value: Vec<u8>) {
        match self.attrs.iter_mut().find(|(k, _)| k == name) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((name.to_vec(), value)),
        }
    }

    pub fn remove_attr(&mut self, name: &[u8]) -> Option<Vec<u8>> {
        let pos = self.attrs.iter().position(|(k, _)| k == name)?;
        Some(self.attrs.remove(pos).1)
    }

    /// Append `sub` unless already listed. Returns true when appended.
    pub fn add_subkey(&mut self, sub: &[u8]) -> bool {
        if self.subkeys.iter().any(|s| s == sub) {
            return false;
        }
        self.subkeys.push(sub.to_vec());
        true
    }

    /// Detach `sub`. Returns true when it was listed.
    pub fn remove_subkey(&mut self, sub: &[u8]) -> bool {
        let before = self.subkeys.len();
        self.subkeys.retain(|s| s != sub);
        before != self.subkeys.len()
    }

    /// Size of [`Entry::encode_body`] without encoding.
    pub fn encoded_len(&self) -> usize {
        8 + 4 + self.key.len()
            + 4 + self.value.len()
            + 4 + self.subkeys.iter().map(|s| 4 + s.len()).sum::<usize>()
            + 4 + self.attrs.iter().map(|(k, v)| 8 + k.len() + v.len()).sum::<usize>()
    }

    /// Encode the entry body (no record header).
    pub fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.expire_at.unwrap_or(0).to_le_bytes());
        put_bytes(&mut out, &self.key);
        put_bytes(&mut out, &self.value);
        out.extend_from_slice(&(self.subkeys.len() as u32).to_le_bytes());
        for sub in &self.subkeys {
            put_bytes(&mut out, sub);
        }
        out.extend_from_slice(&(self.attrs.len() as u32).to_le_bytes());
        for (k, v) in &self.attrs {
            put_bytes(&mut out, k);
            put_bytes(&mut out, v);
        }
        out
    }

    /// Decode an entry body produced by [`Entry::encode_body`].
    pub fn decode_body(body: &[u8]) -> StoreResult<Self> {
        let mut r = PayloadReader::new(body);
        let expire = r.u64()?;
        let key = r.bytes()?;
        let value = r.bytes()?;
        let n_sub = r.u32()? as usize;
        let mut subkeys = Vec::with_capacity(n_sub.min(1024));
        for _ in 0..n_sub {
            subkeys.push(r.bytes()?);
        }
        let n_attr = r.u32()? as usize;
        let mut attrs = Vec::with_capacity(n_attr.min(64));
        for _ in 0..n_attr {
            let k = r.bytes()?;
            let v = r.bytes()?;
            attrs.push((k, v));
        }
        if !r.is_exhausted() {
            return Err(StoreError::Corrupt {
                path: None,
                offset: 0,
                reason: "trailing bytes after entry body".into(),
            });
        }
        Ok(Self {
            key,
            value,
            subkeys,
            attrs,
            expire_at: if expire == 0 { None } else { Some(expire) },
        })
    }
}

/// Frame an entry as an on-page record.
///
/// Layout:
///   [0..4]   magic "KHRC"
///   [4]      version
///   [5..8]   reserved
///   [8..16]  sequence: u64 LE
///   [16..20] body length: u32 LE
///   [20..24] CRC32C of body
pub fn encode_record(entry: &Entry, seq: u64) -> Vec<u8> {
    let body = entry.encode_body();
    let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + body.len());
    out.extend_from_slice(&RECORD_MAGIC);
    out.push(RECORD_VERSION);
    out.extend_from_slice(&[0u8; 3]);
    out.extend_from_slice(&seq.to_le_bytes());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32c::crc32c(&body).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

/// Parse an on-page record, returning the entry and its sequence number.
/// `Corrupt` errors carry offset 0; the pager fills in the page location.
pub fn decode_record(bytes: &[u8]) -> StoreResult<(Entry, u64)> {
    let corrupt = |reason: String| StoreError::Corrupt { path: None, offset: 0, reason };

    if bytes.len() < RECORD_HEADER_SIZE {
        return Err(corrupt(format!("record too short: {} bytes", bytes.len())));
    }
    if bytes[0..4] != RECORD_MAGIC {
        return Err(corrupt("bad record magic".into()));
    }
    if bytes[4] != RECORD_VERSION {
        return Err(corrupt(format!("unsupported record version {}", bytes[4])));
    }
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&bytes[8..16]);
    let seq = u64::from_le_bytes(seq);
    let len = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]) as usize;
    let checksum = u32::from_le_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]);

    let body = bytes
        .get(RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + len)
        .ok_or_else(|| corrupt(format!("record body truncated: need {} bytes", len)))?;
    let computed = crc32c::crc32c(body);
    if computed != checksum {
        return Err(corrupt(format!(
            "record checksum mismatch: expected 0x{:08x}, got 0x{:08x}",
            checksum, computed
        )));
    }
    Ok((Entry::decode_body(body)?, seq))
}

/// Whole seconds since the Unix epoch; times before it clamp to zero.
pub fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Render a key for log and error messages.
pub fn printable(key: &[u8]) -> String {
    String::from_utf8_lossy(key).escape_debug().to_string()
}
