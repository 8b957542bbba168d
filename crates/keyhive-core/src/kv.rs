//! Key/value, subkey and attribute operations on the engine.
//!
//! Every method here registers as an in-flight call. Mutations take the
//! writer lock for their whole duration, so a mutation touching several
//! keys (cascade removal, history copies) is never interleaved with another.

use std::time::SystemTime;

use hashbrown::HashSet;

use crate::attr::{is_reserved, AttrContext, ATTR_HISTORY};
use crate::config::{ReadOptions, WriteOptions};
use crate::engine::Engine;
use crate::error::{StoreError, StoreResult};
use crate::record::{printable, unix_secs, Entry};
use crate::txlog::TxOp;

/// What `remove` takes away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveMode {
    /// The entry alone; its children stay and references to it dangle
    ValueOnly,
    /// The entry and every key reachable through its subkeys
    All,
    /// Detach one child reference from the entry; the child is kept
    Subkey(Vec<u8>),
}

/// Hidden key holding the version of `key` stored under sequence `seq`.
pub fn history_key(key: &[u8], seq: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 26);
    out.extend_from_slice(b"\0history\0");
    out.extend_from_slice(key);
    out.push(0);
    out.extend_from_slice(format!("{:016x}", seq).as_bytes());
    out
}

fn check_key(key: &[u8]) -> StoreResult<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidArgument("keys must not be empty".into()));
    }
    Ok(())
}

impl Engine {
    /// Stored entry of `key` unless absent or expired. An expired entry is
    /// evicted on the way. Caller holds the writer lock.
    pub(crate) fn load_live_locked(&self, key: &[u8], now: SystemTime) -> StoreResult<Option<(Entry, u64)>> {
        match self.load(key)? {
            Some((entry, _)) if entry.is_expired(unix_secs(now)) => {
                if !self.is_read_only() {
                    self.remove_one_locked(&entry)?;
                    tracing::debug!(key = %printable(key), "evicted expired entry");
                }
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Read path variant of [`Engine::load_live_locked`]: the writer lock is
    /// only taken when an expired entry must be evicted.
    fn load_live(&self, key: &[u8], now: SystemTime) -> StoreResult<Option<Entry>> {
        match self.load(key)? {
            Some((entry, seq)) if entry.is_expired(unix_secs(now)) => {
                if !self.is_read_only() {
                    let _w = self.writer.lock();
                    // re-check: the key may have been rewritten meanwhile
                    if let Some((current, current_seq)) = self.load(key)? {
                        if current_seq == seq {
                            self.remove_one_locked(&current)?;
                            tracing::debug!(key = %printable(key), "evicted expired entry");
                        } else if !current.is_expired(unix_secs(now)) {
                            return Ok(Some(current));
                        }
                    }
                }
                Ok(None)
            }
            Some((entry, _)) => Ok(Some(entry)),
            None => Ok(None),
        }
    }

    /// Run the write pipeline over `entry` and persist it. Caller holds the
    /// writer lock.
    pub(crate) fn put_encoded(
        &self,
        mut entry: Entry,
        opts: &WriteOptions,
        history_link: Option<Vec<u8>>,
        now: SystemTime,
    ) -> StoreResult<Entry> {
        self.run_write_pipeline(&mut entry, opts, history_link, now)?;
        self.store_entry(&entry)?;
        self.log_tx(TxOp::SetValue, &entry.key, b"", Some(&entry))?;
        Ok(entry)
    }

    fn run_write_pipeline(
        &self,
        entry: &mut Entry,
        opts: &WriteOptions,
        history_link: Option<Vec<u8>>,
        now: SystemTime,
    ) -> StoreResult<()> {
        let attrs = self.attrs.read();
        entry.expire_at = attrs.resolve_expire(opts.expire.as_ref(), now)?;
        let mut ctx = AttrContext { entry, password: opts.password.as_deref(), now };
        attrs.encode(&mut ctx, history_link)
    }

    /// Overwrite the value of `key`, keeping its subkeys and attributes.
    /// Caller holds the writer lock.
    pub(crate) fn write_value_locked(
        &self,
        key: &[u8],
        value: &[u8],
        opts: &WriteOptions,
        now: SystemTime,
    ) -> StoreResult<Entry> {
        let previous = self.load_live_locked(key, now)?;
        let history = self.attrs.read().history_enabled();

        let mut entry = Entry::new(key);
        entry.value = value.to_vec();
        let mut saved = None;
        if let Some((prev, seq)) = previous {
            if history {
                saved = Some(Entry {
                    key: history_key(key, seq),
                    value: prev.value.clone(),
                    subkeys: Vec::new(),
                    attrs: prev.attrs.clone(),
                    expire_at: None,
                });
            }
            entry.subkeys = prev.subkeys;
            entry.attrs = prev.attrs;
        }
        let link = saved.as_ref().map(|s| s.key.clone());
        self.run_write_pipeline(&mut entry, opts, link, now)?;
        // the saved version must not outlive a rejected write
        self.check_entry_size(&entry, 0)?;

        if let Some(saved) = saved {
            self.store_entry(&saved)?;
            self.log_tx(TxOp::SetValue, &saved.key, b"", Some(&saved))?;
        }
        self.store_entry(&entry)?;
        self.log_tx(TxOp::SetValue, &entry.key, b"", Some(&entry))?;
        Ok(entry)
    }

    /// Decode the stored value through the read pipeline.
    pub(crate) fn decode_value(&self, mut entry: Entry, opts: &ReadOptions, now: SystemTime) -> StoreResult<Vec<u8>> {
        let attrs = self.attrs.read();
        let mut ctx = AttrContext { entry: &mut entry, password: opts.password.as_deref(), now };
        attrs.decode(&mut ctx)?;
        Ok(entry.value)
    }

    pub(crate) fn get(&self, key: &[u8], opts: &ReadOptions) -> StoreResult<Vec<u8>> {
        let _op = self.enter()?;
        let now = SystemTime::now();
        let entry = self.load_live(key, now)?.ok_or_else(|| StoreError::not_found_key(key))?;
        self.decode_value(entry, opts, now)
    }

    pub(crate) fn set(&self, key: &[u8], value: &[u8], opts: &WriteOptions) -> StoreResult<()> {
        let _op = self.enter()?;
        check_key(key)?;
        self.check_writable()?;
        let _w = self.writer.lock();
        self.write_value_locked(key, value, opts, SystemTime::now())?;
        Ok(())
    }

    pub(crate) fn remove(&self, key: &[u8], mode: &RemoveMode) -> StoreResult<()> {
        let _op = self.enter()?;
        self.check_writable()?;
        let _w = self.writer.lock();
        let now = SystemTime::now();

        match mode {
            RemoveMode::ValueOnly => {
                let (entry, _) = self.load_live_locked(key, now)?.ok_or_else(|| StoreError::not_found_key(key))?;
                self.remove_one_locked(&entry)
            }
            RemoveMode::All => {
                let (root, _) = self.load_live_locked(key, now)?.ok_or_else(|| StoreError::not_found_key(key))?;
                let mut visited: HashSet<Vec<u8>> = HashSet::new();
                visited.insert(root.key.clone());
                let mut stack = vec![root];
                let mut removed = 0usize;
                while let Some(entry) = stack.pop() {
                    for sub in &entry.subkeys {
                        if visited.insert(sub.clone()) {
                            if let Some((child, _)) = self.load_live_locked(sub, now)? {
                                stack.push(child);
                            }
                        }
                    }
                    self.remove_one_locked(&entry)?;
                    removed += 1;
                }
                tracing::debug!(key = %printable(key), removed, "cascade removal");
                Ok(())
            }
            RemoveMode::Subkey(sub) => {
                let (mut entry, _) =
                    self.load_live_locked(key, now)?.ok_or_else(|| StoreError::not_found_key(key))?;
                if !entry.remove_subkey(sub) {
                    return Err(StoreError::NotFound(format!(
                        "subkey {} of {}",
                        printable(sub),
                        printable(key)
                    )));
                }
                self.store_entry(&entry)?;
                self.log_tx(TxOp::SetSubkeys, key, b"", Some(&entry))
            }
        }
    }

    /// Drop one entry and its saved history versions. Caller holds the
    /// writer lock.
    pub(crate) fn remove_one_locked(&self, entry: &Entry) -> StoreResult<()> {
        for hidden in self.history_chain(entry)? {
            self.delete_entry(&hidden)?;
            self.log_tx(TxOp::Remove, &hidden, b"", None)?;
        }
        self.delete_entry(&entry.key)?;
        self.log_tx(TxOp::Remove, &entry.key, b"", None)
    }

    /// Keys of the saved versions behind `entry`, newest first.
    fn history_chain(&self, entry: &Entry) -> StoreResult<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        let mut seen: HashSet<Vec<u8>> = HashSet::new();
        let mut next = entry.attr(ATTR_HISTORY).map(<[u8]>::to_vec);
        while let Some(hidden) = next.take() {
            if !seen.insert(hidden.clone()) {
                break;
            }
            match self.load(&hidden)? {
                Some((saved, _)) => {
                    next = saved.attr(ATTR_HISTORY).map(<[u8]>::to_vec);
                    keys.push(hidden);
                }
                None => break,
            }
        }
        Ok(keys)
    }

    pub(crate) fn rename(&self, old: &[u8], new: &[u8]) -> StoreResult<()> {
        let _op = self.enter()?;
        check_key(new)?;
        self.check_writable()?;
        let _w = self.writer.lock();
        let (mut entry, _) = self
            .load_live_locked(old, SystemTime::now())?
            .ok_or_else(|| StoreError::not_found_key(old))?;
        if old == new {
            return Ok(());
        }
        // the entry replacing `new` takes over its slot, not its saved versions
        if let Some((target, _)) = self.load(new)? {
            for hidden in self.history_chain(&target)? {
                self.delete_entry(&hidden)?;
                self.log_tx(TxOp::Remove, &hidden, b"", None)?;
            }
        }
        entry.key = new.to_vec();
        self.move_entry(&entry, old)?;
        self.log_tx(TxOp::Rename, new, old, Some(&entry))
    }

    pub(crate) fn set_subkeys(&self, key: &[u8], subkeys: &[Vec<u8>]) -> StoreResult<()> {
        let _op = self.enter()?;
        check_key(key)?;
        self.check_writable()?;
        let _w = self.writer.lock();
        let mut entry = match self.load_live_locked(key, SystemTime::now())? {
            Some((entry, _)) => entry,
            None => Entry::new(key),
        };
        entry.subkeys.clear();
        for sub in subkeys {
            entry.add_subkey(sub);
        }
        self.store_entry(&entry)?;
        self.log_tx(TxOp::SetSubkeys, key, b"", Some(&entry))
    }

    pub(crate) fn add_subkey(&self, key: &[u8], sub: &[u8], value: &[u8], opts: &WriteOptions) -> StoreResult<()> {
        let _op = self.enter()?;
        check_key(key)?;
        check_key(sub)?;
        self.check_writable()?;
        let _w = self.writer.lock();
        let now = SystemTime::now();

        self.write_value_locked(sub, value, opts, now)?;
        let (mut parent, existed) = match self.load_live_locked(key, now)? {
            Some((entry, _)) => (entry, true),
            None => (Entry::new(key), false),
        };
        if parent.add_subkey(sub) || !existed {
            self.store_entry(&parent)?;
            self.log_tx(TxOp::SetSubkeys, key, b"", Some(&parent))?;
        }
        Ok(())
    }

    pub(crate) fn get_subkeys(&self, key: &[u8]) -> StoreResult<Vec<Vec<u8>>> {
        let _op = self.enter()?;
        self.load_live(key, SystemTime::now())?
            .map(|e| e.subkeys)
            .ok_or_else(|| StoreError::not_found_key(key))
    }

    /// Every key reachable from `key` through subkey references, depth
    /// first, `key` itself excluded. A key listing itself is a caller error;
    /// other cycles are followed once.
    pub(crate) fn walk_subkeys(&self, key: &[u8]) -> StoreResult<Vec<Vec<u8>>> {
        let _op = self.enter()?;
        let now = SystemTime::now();
        let root = self.load_live(key, now)?.ok_or_else(|| StoreError::not_found_key(key))?;

        let mut out = Vec::new();
        let mut visited: HashSet<Vec<u8>> = HashSet::new();
        visited.insert(key.to_vec());
        let mut stack: Vec<Entry> = vec![root];
        while let Some(entry) = stack.pop() {
            if entry.subkeys.iter().any(|s| *s == entry.key) {
                return Err(StoreError::InvalidArgument(format!(
                    "key {} lists itself as a subkey",
                    printable(&entry.key)
                )));
            }
            for sub in entry.subkeys.iter().rev() {
                if visited.insert(sub.clone()) {
                    if let Some(child) = self.load_live(sub, now)? {
                        stack.push(child);
                    }
                }
            }
            if entry.key != key {
                out.push(entry.key);
            }
        }
        Ok(out)
    }

    pub(crate) fn add_attr(&self, key: &[u8], name: &[u8], value: &[u8]) -> StoreResult<()> {
        let _op = self.enter()?;
        if name.is_empty() {
            return Err(StoreError::InvalidArgument("attribute names must not be empty".into()));
        }
        if is_reserved(name) {
            return Err(StoreError::InvalidArgument(format!(
                "attribute name '{}' is reserved",
                printable(name)
            )));
        }
        self.check_writable()?;
        let _w = self.writer.lock();
        let (mut entry, _) = self
            .load_live_locked(key, SystemTime::now())?
            .ok_or_else(|| StoreError::not_found_key(key))?;
        entry.set_attr(name, value.to_vec());
        self.store_entry(&entry)?;
        self.log_tx(TxOp::AddAttr, key, name, Some(&entry))
    }

    pub(crate) fn get_attrs(&self, key: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let _op = self.enter()?;
        self.load_live(key, SystemTime::now())?
            .map(|e| e.attrs)
            .ok_or_else(|| StoreError::not_found_key(key))
    }

    /// Earlier values of `key`, newest first, decoded through the pipeline.
    pub(crate) fn get_history(&self, key: &[u8], opts: &ReadOptions) -> StoreResult<Vec<Vec<u8>>> {
        let _op = self.enter()?;
        let now = SystemTime::now();
        let entry = self.load_live(key, now)?.ok_or_else(|| StoreError::not_found_key(key))?;
        let mut values = Vec::new();
        for hidden in self.history_chain(&entry)? {
            if let Some((saved, _)) = self.load(&hidden)? {
                values.push(self.decode_value(saved, opts, now)?);
            }
        }
        Ok(values)
    }
}
