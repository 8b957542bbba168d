//! FIFO/LIFO queues built from hidden keys
//!
//! A queue under `prefix` owns a marker key and one node key per item:
//!
//! ```text
//!   <prefix>\0queue\0marker         head seq | tail seq | count | next seq
//!   <prefix>\0queue\0<seq as hex>   value, subkeys = [successor node]
//! ```
//!
//! Pops always take the head node. FIFO pushes append after the tail,
//! LIFO pushes become the new head. All handles on one prefix share a lock,
//! so pushes and pops on that queue are linearizable.

use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::config::{CancelFlag, QueueOptions, ReadOptions, WriteOptions};
use crate::engine::Engine;
use crate::error::{StoreError, StoreResult};
use crate::record::{printable, unix_secs, Entry};
use crate::txlog::TxOp;

const MARKER_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Marker {
    /// 0 when the queue is empty
    head: u64,
    tail: u64,
    count: u64,
    next_seq: u64,
}

impl Marker {
    fn to_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MARKER_SIZE);
        for v in [self.head, self.tail, self.count, self.next_seq] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() != MARKER_SIZE {
            return None;
        }
        let word = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[i * 8..i * 8 + 8]);
            u64::from_le_bytes(b)
        };
        Some(Self { head: word(0), tail: word(1), count: word(2), next_seq: word(3) })
    }
}

fn queue_key(prefix: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 7 + suffix.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(b"\0queue\0");
    key.extend_from_slice(suffix);
    key
}

/// Handle to one queue of a store. Releasing (or dropping) the handle
/// leaves the queued items in place.
pub struct Queue {
    engine: Arc<Engine>,
    fifo: bool,
    prefix: Vec<u8>,
    lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("prefix", &printable(&self.prefix))
            .field("fifo", &self.fifo)
            .finish()
    }
}

impl Queue {
    pub(crate) fn acquire(engine: Arc<Engine>, options: &QueueOptions) -> StoreResult<Self> {
        let _op = engine.enter()?;
        let lock = engine.register_queue(&options.prefix);
        drop(_op);
        tracing::debug!(prefix = %printable(&options.prefix), fifo = options.fifo, "queue handle acquired");
        Ok(Self { engine, fifo: options.fifo, prefix: options.prefix.clone(), lock })
    }

    pub fn is_fifo(&self) -> bool {
        self.fifo
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    fn marker_key(&self) -> Vec<u8> {
        queue_key(&self.prefix, b"marker")
    }

    fn node_key(&self, seq: u64) -> Vec<u8> {
        queue_key(&self.prefix, format!("{:016x}", seq).as_bytes())
    }

    fn node_seq(&self, key: &[u8]) -> StoreResult<u64> {
        let base = queue_key(&self.prefix, b"");
        key.strip_prefix(base.as_slice())
            .and_then(|hex| std::str::from_utf8(hex).ok())
            .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            .ok_or_else(|| StoreError::Corrupt {
                path: self.engine.path().map(|p| p.to_path_buf()),
                offset: 0,
                reason: format!("queue node link {} is malformed", printable(key)),
            })
    }

    fn read_marker(&self) -> StoreResult<Marker> {
        match self.engine.load(&self.marker_key())? {
            None => Ok(Marker { next_seq: 1, ..Marker::default() }),
            Some((entry, _)) => Marker::from_bytes(&entry.value).ok_or_else(|| StoreError::Corrupt {
                path: self.engine.path().map(|p| p.to_path_buf()),
                offset: 0,
                reason: format!("queue marker under {} is malformed", printable(&self.prefix)),
            }),
        }
    }

    /// Caller holds the writer lock.
    fn write_marker(&self, marker: Marker) -> StoreResult<()> {
        let mut entry = Entry::new(&self.marker_key());
        entry.value = marker.to_bytes();
        self.engine.store_entry(&entry)?;
        self.engine.log_tx(TxOp::SetValue, &entry.key, b"", Some(&entry))
    }

    /// Caller holds the queue and writer locks.
    fn push_locked(&self, value: &[u8], opts: &WriteOptions) -> StoreResult<()> {
        let now = SystemTime::now();
        let mut marker = self.read_marker()?;
        let seq = marker.next_seq;
        marker.next_seq += 1;

        let mut node = Entry::new(&self.node_key(seq));
        node.value = value.to_vec();
        if self.fifo {
            self.engine.put_encoded(node, opts, None, now)?;
            if marker.tail != 0 {
                let tail_key = self.node_key(marker.tail);
                let (mut tail, _) = self.engine.load(&tail_key)?.ok_or_else(|| self.missing_node(&tail_key))?;
                tail.subkeys = vec![self.node_key(seq)];
                self.engine.store_entry(&tail)?;
                self.engine.log_tx(TxOp::SetSubkeys, &tail_key, b"", Some(&tail))?;
            } else {
                marker.head = seq;
            }
            marker.tail = seq;
        } else {
            if marker.head != 0 {
                node.subkeys = vec![self.node_key(marker.head)];
            } else {
                marker.tail = seq;
            }
            self.engine.put_encoded(node, opts, None, now)?;
            marker.head = seq;
        }
        marker.count += 1;
        self.write_marker(marker)
    }

    fn missing_node(&self, key: &[u8]) -> StoreError {
        StoreError::Corrupt {
            path: self.engine.path().map(|p| p.to_path_buf()),
            offset: 0,
            reason: format!("queue node {} is missing", printable(key)),
        }
    }

    /// Live head node without detaching it. Expired heads are discarded on
    /// the way, each one committed to the marker before the next is looked
    /// at. Caller holds the queue and writer locks.
    fn peek_head_locked(&self, marker: &mut Marker, now: SystemTime) -> StoreResult<Option<(Vec<u8>, Entry)>> {
        while marker.count > 0 && marker.head != 0 {
            let head_key = self.node_key(marker.head);
            let (node, _) = self.engine.load(&head_key)?.ok_or_else(|| self.missing_node(&head_key))?;
            if !node.is_expired(unix_secs(now)) {
                return Ok(Some((head_key, node)));
            }
            self.detach_head_locked(marker, &head_key, &node)?;
            tracing::debug!(node = %printable(&head_key), "discarded expired queue node");
        }
        Ok(None)
    }

    /// Delete the head node and persist the advanced marker. Caller holds
    /// the queue and writer locks.
    fn detach_head_locked(&self, marker: &mut Marker, head_key: &[u8], node: &Entry) -> StoreResult<()> {
        let successor = match node.subkeys.first() {
            Some(next) => self.node_seq(next)?,
            None => 0,
        };
        self.engine.delete_entry(head_key)?;
        self.engine.log_tx(TxOp::Remove, head_key, b"", None)?;
        marker.head = successor;
        marker.count = marker.count.saturating_sub(1);
        if successor == 0 || marker.count == 0 {
            marker.head = 0;
            marker.tail = 0;
        }
        self.write_marker(*marker)
    }

    /// Detach the head node and return it, decoded through the attribute
    /// pipeline when `decode` is given. A node that fails to decode stays
    /// at the head. Caller holds the queue and writer locks.
    fn pop_node_locked(&self, decode: Option<&ReadOptions>) -> StoreResult<Option<Entry>> {
        let now = SystemTime::now();
        let mut marker = self.read_marker()?;
        let Some((head_key, mut node)) = self.peek_head_locked(&mut marker, now)? else {
            return Ok(None);
        };
        let value = match decode {
            Some(opts) => Some(self.engine.decode_value(node.clone(), opts, now)?),
            None => None,
        };
        self.detach_head_locked(&mut marker, &head_key, &node)?;
        if let Some(v) = value {
            node.value = v;
        }
        Ok(Some(node))
    }

    fn empty(&self) -> StoreError {
        StoreError::Empty(format!("queue {}", printable(&self.prefix)))
    }

    pub fn push(&self, value: &[u8]) -> StoreResult<()> {
        self.push_with(value, &WriteOptions::default())
    }

    pub fn push_with(&self, value: &[u8], opts: &WriteOptions) -> StoreResult<()> {
        let _op = self.engine.enter()?;
        self.engine.check_writable()?;
        let _q = self.lock.lock();
        let _w = self.engine.writer.lock();
        self.push_locked(value, opts)
    }

    pub fn pop(&self) -> StoreResult<Vec<u8>> {
        self.pop_with(&ReadOptions::default())
    }

    /// Pop the head item, decrypting with `opts.password` when given.
    /// A value that fails to decode stays queued.
    pub fn pop_with(&self, opts: &ReadOptions) -> StoreResult<Vec<u8>> {
        let _op = self.engine.enter()?;
        self.engine.check_writable()?;
        let _q = self.lock.lock();
        let _w = self.engine.writer.lock();
        self.pop_node_locked(Some(opts))?.map(|n| n.value).ok_or_else(|| self.empty())
    }

    /// Write `value` under the store key `key` and queue a reference to it.
    pub fn push_keyed(&self, key: &[u8], value: &[u8], opts: &WriteOptions) -> StoreResult<()> {
        let _op = self.engine.enter()?;
        if key.is_empty() {
            return Err(StoreError::InvalidArgument("keys must not be empty".into()));
        }
        self.engine.check_writable()?;
        let _q = self.lock.lock();
        let _w = self.engine.writer.lock();
        self.engine.write_value_locked(key, value, opts, SystemTime::now())?;
        self.push_locked(key, &WriteOptions::default())
    }

    /// Pop a key reference, returning the key with its value. The key is
    /// removed from the store. References to keys that no longer exist are
    /// skipped.
    pub fn pop_keyed(&self, opts: &ReadOptions) -> StoreResult<(Vec<u8>, Vec<u8>)> {
        let _op = self.engine.enter()?;
        self.engine.check_writable()?;
        let _q = self.lock.lock();
        let _w = self.engine.writer.lock();
        let now = SystemTime::now();
        let mut marker = self.read_marker()?;
        loop {
            let (head_key, node) = self.peek_head_locked(&mut marker, now)?.ok_or_else(|| self.empty())?;
            let key = node.value.clone();
            match self.engine.load_live_locked(&key, now)? {
                Some((entry, _)) => {
                    // decode before anything is detached so a failure keeps the item queued
                    let value = self.engine.decode_value(entry.clone(), opts, now)?;
                    self.detach_head_locked(&mut marker, &head_key, &node)?;
                    self.engine.remove_one_locked(&entry)?;
                    return Ok((key, value));
                }
                None => {
                    tracing::debug!(key = %printable(&key), "queued key no longer exists");
                    self.detach_head_locked(&mut marker, &head_key, &node)?;
                }
            }
        }
    }

    /// Number of queued items.
    pub fn count(&self) -> StoreResult<usize> {
        let _op = self.engine.enter()?;
        let _q = self.lock.lock();
        Ok(self.read_marker()?.count as usize)
    }

    /// Discard every queued item, checking `cancel` between nodes. Returns
    /// the number of nodes removed.
    pub fn drain(&self, cancel: Option<&CancelFlag>) -> StoreResult<usize> {
        let _op = self.engine.enter()?;
        self.engine.check_writable()?;
        let _q = self.lock.lock();
        let mut removed = 0usize;
        loop {
            if cancel.is_some_and(CancelFlag::is_cancelled) {
                return Err(StoreError::Cancelled { completed: removed });
            }
            let _w = self.engine.writer.lock();
            match self.pop_node_locked(None)? {
                Some(_) => removed += 1,
                None => return Ok(removed),
            }
        }
    }

    /// End the handle. Queued items stay in the store.
    pub fn release(self) {}
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.engine.release_queue();
        tracing::debug!(prefix = %printable(&self.prefix), "queue handle released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Expire};
    use std::time::Duration;

    fn engine() -> Arc<Engine> {
        Arc::new(Engine::open_memory(Config::small()).unwrap())
    }

    fn queue(engine: &Arc<Engine>, fifo: bool, prefix: &[u8]) -> Queue {
        Queue::acquire(Arc::clone(engine), &QueueOptions { fifo, prefix: prefix.to_vec() }).unwrap()
    }

    #[test]
    fn test_fifo_order() {
        let e = engine();
        let q = queue(&e, true, b"");
        q.push(b"x").unwrap();
        q.push(b"y").unwrap();
        q.push(b"z").unwrap();
        assert_eq!(q.count().unwrap(), 3);
        assert_eq!(q.pop().unwrap(), b"x");
        assert_eq!(q.pop().unwrap(), b"y");
        q.push(b"w").unwrap();
        assert_eq!(q.pop().unwrap(), b"z");
        assert_eq!(q.pop().unwrap(), b"w");
        assert!(matches!(q.pop(), Err(StoreError::Empty(_))));
        assert_eq!(q.count().unwrap(), 0);
    }

    #[test]
    fn test_lifo_order() {
        let e = engine();
        let q = queue(&e, false, b"stack");
        q.push(b"x").unwrap();
        q.push(b"y").unwrap();
        assert_eq!(q.pop().unwrap(), b"y");
        assert_eq!(q.pop().unwrap(), b"x");
        assert!(matches!(q.pop(), Err(StoreError::Empty(_))));
    }

    #[test]
    fn test_prefixes_are_independent() {
        let e = engine();
        let a = queue(&e, true, b"a");
        let b = queue(&e, true, b"b");
        a.push(b"1").unwrap();
        assert_eq!(b.count().unwrap(), 0);
        assert!(b.pop().is_err());
        assert_eq!(a.pop().unwrap(), b"1");
    }

    #[test]
    fn test_encrypted_item_needs_password() {
        let e = engine();
        let q = queue(&e, true, b"");
        q.push_with(b"secret", &WriteOptions::with_password("pw")).unwrap();
        assert!(matches!(q.pop(), Err(StoreError::Decrypt(_))));
        assert_eq!(q.count().unwrap(), 1);
        assert_eq!(q.pop_with(&ReadOptions::with_password("pw")).unwrap(), b"secret");
    }

    #[test]
    fn test_expired_items_are_skipped() {
        let e = engine();
        let q = queue(&e, true, b"");
        let past = WriteOptions::with_expire(Expire::At(SystemTime::now() - Duration::from_secs(5)));
        q.push_with(b"stale", &past).unwrap();
        q.push(b"fresh").unwrap();
        assert_eq!(q.pop().unwrap(), b"fresh");
        assert_eq!(q.count().unwrap(), 0);
    }

    #[test]
    fn test_failed_decode_after_expired_head_keeps_queue_intact() {
        let e = engine();
        let q = queue(&e, true, b"");
        let past = WriteOptions::with_expire(Expire::At(SystemTime::now() - Duration::from_secs(5)));
        q.push_with(b"stale", &past).unwrap();
        q.push_with(b"secret", &WriteOptions::with_password("pw")).unwrap();

        assert!(matches!(q.pop(), Err(StoreError::Decrypt(_))));
        // the expired head is gone for good, the encrypted item is still queued
        assert_eq!(q.count().unwrap(), 1);
        assert_eq!(q.pop_with(&ReadOptions::with_password("pw")).unwrap(), b"secret");
        assert!(matches!(q.pop(), Err(StoreError::Empty(_))));
    }

    #[test]
    fn test_keyed_pop_that_fails_decode_stays_queued() {
        let e = engine();
        let q = queue(&e, true, b"kq");
        q.push_keyed(b"job", b"payload", &WriteOptions::with_password("pw")).unwrap();

        assert!(matches!(q.pop_keyed(&ReadOptions::default()), Err(StoreError::Decrypt(_))));
        assert_eq!(q.count().unwrap(), 1);
        assert!(e.load(b"job").unwrap().is_some());

        let (k, v) = q.pop_keyed(&ReadOptions::with_password("pw")).unwrap();
        assert_eq!((k.as_slice(), v.as_slice()), (&b"job"[..], &b"payload"[..]));
        assert_eq!(q.count().unwrap(), 0);
        assert!(e.load(b"job").unwrap().is_none());
    }

    #[test]
    fn test_keyed_pop_skips_vanished_keys() {
        let e = engine();
        let q = queue(&e, true, b"kq");
        q.push_keyed(b"gone", b"1", &WriteOptions::default()).unwrap();
        q.push_keyed(b"kept", b"2", &WriteOptions::default()).unwrap();
        e.remove(b"gone", &crate::kv::RemoveMode::ValueOnly).unwrap();

        let (k, _) = q.pop_keyed(&ReadOptions::default()).unwrap();
        assert_eq!(k, b"kept");
        assert_eq!(q.count().unwrap(), 0);
    }

    #[test]
    fn test_keyed_queue() {
        let e = engine();
        let q = queue(&e, true, b"kq");
        q.push_keyed(b"job-1", b"payload-1", &WriteOptions::default()).unwrap();
        q.push_keyed(b"job-2", b"payload-2", &WriteOptions::default()).unwrap();
        assert_eq!(e.get(b"job-1", &ReadOptions::default()).unwrap(), b"payload-1");

        let (k, v) = q.pop_keyed(&ReadOptions::default()).unwrap();
        assert_eq!((k.as_slice(), v.as_slice()), (&b"job-1"[..], &b"payload-1"[..]));
        assert!(e.get(b"job-1", &ReadOptions::default()).is_err());
        assert_eq!(q.count().unwrap(), 1);
    }

    #[test]
    fn test_drain_and_cancel() {
        let e = engine();
        let q = queue(&e, true, b"");
        for i in 0..5u8 {
            q.push(&[i]).unwrap();
        }
        let cancel = CancelFlag::new();
        cancel.cancel();
        assert!(matches!(q.drain(Some(&cancel)), Err(StoreError::Cancelled { completed: 0 })));
        assert_eq!(q.drain(None).unwrap(), 5);
        assert_eq!(q.count().unwrap(), 0);
        assert_eq!(e.state().entries, 1);
    }

    #[test]
    fn test_release_unregisters() {
        let e = engine();
        let q = queue(&e, true, b"");
        assert_eq!(e.live_queues(), 1);
        q.release();
        assert_eq!(e.live_queues(), 0);
    }
}
