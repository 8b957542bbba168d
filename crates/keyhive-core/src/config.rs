//! Configuration management for Keyhive
//!
//! `Config` describes how a store is opened: table geometry, page size and
//! the handle flags. Per-call options (`WriteOptions`, `ReadOptions`,
//! `QueueOptions`, `TxOptions`) are plain structs with documented defaults.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::error::{StoreError, StoreResult};

/// Smallest page the allocator accepts (header + a useful payload).
pub const MIN_PAGE_SIZE: usize = 128;

/// Largest page the allocator accepts.
pub const MAX_PAGE_SIZE: usize = 1024 * 1024;

/// Upper bound on mask bits; growth past this is `Full`.
pub const MAX_MASK_BITS: u8 = 24;

/// Upper bound on collision mask bits.
pub const MAX_COLLISION_MASK_BITS: u8 = 8;

/// Store configuration with geometry presets
#[derive(Debug, Clone)]
pub struct Config {
    /// Open without write access; every mutation fails `ReadOnly`
    pub read_only: bool,
    /// Delete the backing file once the store is closed
    pub remove_on_close: bool,
    /// Memory-map the whole file instead of positional reads/writes
    pub full_map: bool,
    /// Low hash bits selecting the primary bucket
    pub mask_bits: u8,
    /// Further hash bits selecting the sub-bucket inside a primary bucket
    pub collision_mask_bits: u8,
    /// Longest allowed sub-bucket chain before the table grows
    pub max_elements: usize,
    /// Size of one page in bytes
    pub page_size: usize,
    /// Default wait for in-flight calls when the store is dropped
    pub close_wait: Duration,
    /// Sync the file after every mutation
    pub sync_writes: bool,
}

impl Config {
    /// Small tables for embedded use and tests.
    pub fn small() -> Self {
        Self {
            mask_bits: 4,
            collision_mask_bits: 2,
            max_elements: 32,
            page_size: 256,
            ..Self::base()
        }
    }

    /// Large tables for stores expected to hold millions of keys.
    pub fn large() -> Self {
        Self {
            mask_bits: 16,
            collision_mask_bits: 6,
            max_elements: 4096,
            page_size: 4096,
            ..Self::base()
        }
    }

    fn base() -> Self {
        Self {
            read_only: false,
            remove_on_close: false,
            full_map: false,
            mask_bits: 8,
            collision_mask_bits: 4,
            max_elements: 1024,
            page_size: 512,
            close_wait: Duration::ZERO,
            sync_writes: false,
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> StoreResult<()> {
        if self.mask_bits == 0 || self.mask_bits > MAX_MASK_BITS {
            return Err(StoreError::Config(format!(
                "mask_bits must be in [1, {}], got {}",
                MAX_MASK_BITS, self.mask_bits
            )));
        }
        if self.collision_mask_bits == 0 || self.collision_mask_bits > MAX_COLLISION_MASK_BITS {
            return Err(StoreError::Config(format!(
                "collision_mask_bits must be in [1, {}], got {}",
                MAX_COLLISION_MASK_BITS, self.collision_mask_bits
            )));
        }
        if self.max_elements == 0 {
            return Err(StoreError::Config("max_elements must be > 0".into()));
        }
        if self.page_size < MIN_PAGE_SIZE || self.page_size > MAX_PAGE_SIZE {
            return Err(StoreError::Config(format!(
                "page_size must be in [{}, {}], got {}",
                MIN_PAGE_SIZE, MAX_PAGE_SIZE, self.page_size
            )));
        }
        if self.read_only && self.remove_on_close {
            return Err(StoreError::Config("remove_on_close requires write access".into()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::base() }
}

/// When a written value stops being readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expire {
    /// Relative to the time of the write. Zero is rejected.
    After(Duration),
    /// Absolute point in time; a moment in the past is accepted.
    At(SystemTime),
}

impl Expire {
    /// Resolve to whole seconds since the Unix epoch.
    pub(crate) fn resolve(&self, now: SystemTime) -> StoreResult<u64> {
        let at = match self {
            Expire::After(d) => {
                if d.is_zero() {
                    return Err(StoreError::Config(
                        "expiration duration of zero is not allowed; omit it for no expiration".into(),
                    ));
                }
                now + *d
            }
            Expire::At(t) => *t,
        };
        // zero encodes "no expiration" on disk
        Ok(crate::record::unix_secs(at).max(1))
    }
}

/// Options for value writes (`set`, `add_subkey`, queue pushes).
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Encrypt the value with this password
    pub password: Option<String>,
    /// Expiration; `None` falls back to the store default
    pub expire: Option<Expire>,
}

impl WriteOptions {
    pub fn with_password(password: impl Into<String>) -> Self {
        Self { password: Some(password.into()), expire: None }
    }

    pub fn with_expire(expire: Expire) -> Self {
        Self { password: None, expire: Some(expire) }
    }
}

/// Options for value reads.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Try only this password when the value is encrypted
    pub password: Option<String>,
}

impl ReadOptions {
    pub fn with_password(password: impl Into<String>) -> Self {
        Self { password: Some(password.into()) }
    }
}

/// Options for acquiring a queue handle.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// First-in first-out when true, last-in first-out otherwise
    pub fifo: bool,
    /// Namespace for the queue's reserved keys
    pub prefix: Vec<u8>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self { fifo: true, prefix: Vec::new() }
    }
}

/// Options for attaching a transaction log.
#[derive(Debug, Clone, Default)]
pub struct TxOptions {
    /// Bytes embedded in every record
    pub prefix: Vec<u8>,
    /// Free-form parameter bytes embedded in every record
    pub params: Vec<u8>,
    /// Records older than this are skipped on replay
    pub expire: Option<Duration>,
}

/// Best-effort abort signal checked between units of work (one archive
/// entry, one queue node). Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
