//! Core storage engine: page allocator + key table + attribute state.
//!
//! **Read path**: key table read lock held while the record chain is read,
//! so a concurrent writer can never free pages out from under a reader.
//! **Write path**: serialized by the writer mutex. The new record chain is
//! written first, swapped into the table under a brief write lock, and only
//! then is the old chain freed.
//!
//! Lock order: queue lock, writer, attrs, pager, table. The writer never
//! holds the pager lock while taking the table lock.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};

use crate::attr::AttrManager;
use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::format::MAX_PAYLOAD_SIZE;
use crate::hash::{KeyHasher, Murmur3};
use crate::page::{FileIo, MemIo, MmapIo, PageIo, PageId, Pager, Superblock, HASHER_NAME_LEN};
use crate::platform_durability::{durable_sync_dir, FileLock};
use crate::record::{decode_record, encode_record, printable, Entry};
use crate::table::HashTable;
use crate::txlog::{TxLog, TxOp, TxSink, TxSummary};

/// Outcome of closing a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReport {
    /// In-flight calls were still running when the wait ran out
    pub timed_out: bool,
    /// Calls still in flight when the store was released
    pub inflight: usize,
    /// Final counters of the transaction log detached by the close
    pub tx: Option<TxSummary>,
}

/// Point-in-time description of a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreState {
    pub path: Option<PathBuf>,
    pub read_only: bool,
    pub full_map: bool,
    pub mask_bits: u8,
    pub collision_mask_bits: u8,
    pub max_elements: usize,
    pub hash_function: String,
    pub page_size: usize,
    pub page_count: u64,
    pub free_pages: u64,
    pub entries: usize,
    pub occupied_slots: usize,
    pub longest_chain: usize,
    pub queues: usize,
    pub tx_log: Option<PathBuf>,
}

impl std::fmt::Display for StoreState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(p) => writeln!(f, "store: {}", p.display())?,
            None => writeln!(f, "store: <memory>")?,
        }
        writeln!(f, "  mode:           {}{}", if self.read_only { "read-only" } else { "read-write" },
            if self.full_map { ", mapped" } else { "" })?;
        writeln!(f, "  mask bits:      {} (collision {})", self.mask_bits, self.collision_mask_bits)?;
        writeln!(f, "  max elements:   {}", self.max_elements)?;
        writeln!(f, "  hash function:  {}", self.hash_function)?;
        writeln!(f, "  pages:          {} x {} bytes, {} free", self.page_count, self.page_size, self.free_pages)?;
        writeln!(f, "  entries:        {} in {} slots, longest chain {}", self.entries, self.occupied_slots, self.longest_chain)?;
        writeln!(f, "  queue handles:  {}", self.queues)?;
        match &self.tx_log {
            Some(p) => writeln!(f, "  transaction log: {}", p.display()),
            None => writeln!(f, "  transaction log: none"),
        }
    }
}

/// Registers a public call as in flight for the close wait.
pub(crate) struct OpGuard<'a> {
    engine: &'a Engine,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.engine.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(crate) struct Engine {
    path: Option<PathBuf>,
    config: Config,
    pub(crate) pager: RwLock<Pager>,
    pub(crate) table: RwLock<HashTable>,
    /// Serializes every mutation
    pub(crate) writer: Mutex<()>,
    pub(crate) attrs: RwLock<AttrManager>,
    tx: Mutex<Option<TxLog>>,
    tx_threads: AtomicUsize,
    queues: AtomicUsize,
    queue_locks: Mutex<HashMap<Vec<u8>, Arc<Mutex<()>>>>,
    closed: AtomicBool,
    inflight: AtomicUsize,
    next_seq: AtomicU64,
    lock: Mutex<Option<FileLock>>,
}

fn io_err(path: &Path, e: &io::Error, context: &str) -> StoreError {
    StoreError::io_at(path, e, context)
}

impl Engine {
    /// Open the store file at `path`, creating it when missing (unless
    /// read-only). With `create_new` an existing file is an error.
    pub(crate) fn open_file(path: &Path, config: Config, create_new: bool) -> StoreResult<Self> {
        Self::open_file_with(path, config, create_new, Arc::new(Murmur3))
    }

    /// [`Engine::open_file`] with the table hashed by `hasher`. An existing
    /// store must have been built with a hasher of the same name.
    pub(crate) fn open_file_with(
        path: &Path,
        config: Config,
        create_new: bool,
        hasher: Arc<dyn KeyHasher>,
    ) -> StoreResult<Self> {
        config.validate()?;
        let hasher_field = Superblock::hasher_field(hasher.name())?;
        let path = path.to_path_buf();

        let mut options = OpenOptions::new();
        options.read(true);
        if !config.read_only {
            options.write(true);
            if create_new {
                options.create_new(true);
            } else {
                options.create(true);
            }
        }
        let file = options.open(&path).map_err(|e| io_err(&path, &e, "failed to open store file"))?;

        let lock = FileLock::acquire(&file, !config.read_only).map_err(|e| {
            if e.kind() == io::ErrorKind::WouldBlock {
                StoreError::Io {
                    path: Some(path.clone()),
                    kind: e.kind(),
                    message: "store file is locked by another handle".into(),
                }
            } else {
                io_err(&path, &e, "failed to lock store file")
            }
        })?;

        let fresh = file.metadata().map_err(|e| io_err(&path, &e, "failed to stat store file"))?.len() == 0;
        if fresh && config.read_only {
            return Err(StoreError::Config(format!(
                "{} is empty and cannot be initialized read-only",
                path.display()
            )));
        }

        let io: Box<dyn PageIo> = if config.full_map {
            if fresh {
                file.set_len(config.page_size as u64)
                    .map_err(|e| io_err(&path, &e, "failed to size new store"))?;
            }
            Box::new(MmapIo::new(file, !config.read_only).map_err(|e| io_err(&path, &e, "failed to map store file"))?)
        } else {
            Box::new(FileIo::new(file))
        };

        let engine = Self::attach(io, Some(path.clone()), config, fresh, hasher, hasher_field)?;
        *engine.lock.lock() = Some(lock);
        if fresh {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                durable_sync_dir(dir).map_err(|e| io_err(dir, &e, "failed to sync store directory"))?;
            }
        }
        Ok(engine)
    }

    /// Anonymous-memory store; nothing outlives the handle.
    pub(crate) fn open_memory(config: Config) -> StoreResult<Self> {
        Self::open_memory_with(config, Arc::new(Murmur3))
    }

    pub(crate) fn open_memory_with(mut config: Config, hasher: Arc<dyn KeyHasher>) -> StoreResult<Self> {
        config.read_only = false;
        config.remove_on_close = false;
        config.full_map = false;
        config.validate()?;
        let hasher_field = Superblock::hasher_field(hasher.name())?;
        Self::attach(Box::new(MemIo::default()), None, config, true, hasher, hasher_field)
    }

    fn attach(
        io: Box<dyn PageIo>,
        path: Option<PathBuf>,
        mut config: Config,
        fresh: bool,
        hasher: Arc<dyn KeyHasher>,
        hasher_field: [u8; HASHER_NAME_LEN],
    ) -> StoreResult<Self> {
        let (pager, table, next_seq) = if fresh {
            let sb = Superblock {
                page_size: config.page_size as u32,
                mask_bits: config.mask_bits,
                collision_mask_bits: config.collision_mask_bits,
                max_elements: config.max_elements as u32,
                hasher: hasher_field,
            };
            let pager = Pager::create(io, path.clone(), sb)?;
            let table = HashTable::new(config.mask_bits, config.collision_mask_bits, config.max_elements, hasher);
            tracing::info!(
                path = ?path,
                mask_bits = config.mask_bits,
                page_size = config.page_size,
                hasher = %sb.hasher_name(),
                "created store"
            );
            (pager, table, 1)
        } else {
            let (mut pager, sb) = Pager::open(io, path.clone(), config.read_only)?;
            if sb.hasher != hasher_field {
                return Err(StoreError::Config(format!(
                    "store was built with hash function {:?}, opened with {:?}",
                    sb.hasher_name(),
                    hasher.name()
                )));
            }
            // stored geometry wins over the requested one
            config.page_size = sb.page_size as usize;
            config.collision_mask_bits = sb.collision_mask_bits;
            config.max_elements = sb.max_elements as usize;
            let (table, next_seq) = recover(&mut pager, &sb, config.read_only, hasher)?;
            config.mask_bits = table.mask_bits();
            tracing::info!(
                path = ?path,
                entries = table.len(),
                mask_bits = table.mask_bits(),
                pages = pager.page_count(),
                "opened store"
            );
            (pager, table, next_seq)
        };

        Ok(Self {
            path,
            config,
            pager: RwLock::new(pager),
            table: RwLock::new(table),
            writer: Mutex::new(()),
            attrs: RwLock::new(AttrManager::default()),
            tx: Mutex::new(None),
            tx_threads: AtomicUsize::new(0),
            queues: AtomicUsize::new(0),
            queue_locks: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            inflight: AtomicUsize::new(0),
            next_seq: AtomicU64::new(next_seq),
            lock: Mutex::new(None),
        })
    }

    pub(crate) fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    /// Register a call; fails once the store is closed.
    pub(crate) fn enter(&self) -> StoreResult<OpGuard<'_>> {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        let guard = OpGuard { engine: self };
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::InvalidHandle("store is closed".into()));
        }
        Ok(guard)
    }

    pub(crate) fn check_writable(&self) -> StoreResult<()> {
        if self.config.read_only {
            return Err(StoreError::ReadOnly(match &self.path {
                Some(p) => format!("{} was opened read-only", p.display()),
                None => "store was opened read-only".into(),
            }));
        }
        Ok(())
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    /// Stored entry for `key` and its sequence number, expired or not.
    pub(crate) fn load(&self, key: &[u8]) -> StoreResult<Option<(Entry, u64)>> {
        let table = self.table.read();
        let Some(element) = table.get(key) else {
            return Ok(None);
        };
        let head = element.head;
        let pager = self.pager.read();
        let bytes = pager.read_chain(head)?;
        let (entry, seq) = decode_record(&bytes).map_err(|e| match e {
            StoreError::Corrupt { reason, .. } => pager.corrupt(head, reason),
            other => other,
        })?;
        if entry.key != key {
            return Err(pager.corrupt(head, "record key does not match its table entry"));
        }
        Ok(Some((entry, seq)))
    }

    /// Reject `entry` when its body, or the log record it will produce with
    /// an aux field of `aux_len` bytes, exceeds the chunk payload limit.
    /// Runs before any page is written.
    pub(crate) fn check_entry_size(&self, entry: &Entry, aux_len: usize) -> StoreResult<()> {
        let body = entry.encoded_len();
        let record = self
            .tx
            .lock()
            .as_ref()
            .map_or(0, |log| log.record_len(entry.key.len(), aux_len, body));
        let largest = body.max(record);
        if largest > MAX_PAYLOAD_SIZE {
            return Err(StoreError::InvalidArgument(format!(
                "entry for key {} encodes to {} bytes, limit is {}",
                printable(&entry.key),
                largest,
                MAX_PAYLOAD_SIZE
            )));
        }
        Ok(())
    }

    /// Persist `entry` as the current record of its key. Caller holds the
    /// writer lock.
    pub(crate) fn store_entry(&self, entry: &Entry) -> StoreResult<()> {
        self.check_writable()?;
        self.check_entry_size(entry, 0)?;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let bytes = encode_record(entry, seq);
        let head = self.pager.write().write_chain(&bytes)?;

        let outcome = {
            let mut table = self.table.write();
            let element = table.element(&entry.key, head, seq);
            table.insert(element)
        };
        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                self.pager.write().free_chain(head)?;
                return Err(e);
            }
        };
        if let Some(old) = outcome.replaced {
            self.pager.write().free_chain(old.head)?;
        }
        if outcome.grew {
            self.persist_geometry()?;
        }
        self.sync_if_configured()
    }

    /// Drop the record of `key`. Caller holds the writer lock.
    pub(crate) fn delete_entry(&self, key: &[u8]) -> StoreResult<bool> {
        self.check_writable()?;
        let removed = self.table.write().remove(key);
        match removed {
            Some(element) => {
                self.pager.write().free_chain(element.head)?;
                self.sync_if_configured()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Store `entry` under its key and drop `old_key` in one table update.
    /// Caller holds the writer lock.
    pub(crate) fn move_entry(&self, entry: &Entry, old_key: &[u8]) -> StoreResult<()> {
        self.check_writable()?;
        self.check_entry_size(entry, old_key.len())?;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let head = self.pager.write().write_chain(&encode_record(entry, seq))?;

        let (outcome, old) = {
            let mut table = self.table.write();
            let element = table.element(&entry.key, head, seq);
            match table.insert(element) {
                Ok(o) => {
                    let old = table.remove(old_key);
                    (o, old)
                }
                Err(e) => {
                    drop(table);
                    self.pager.write().free_chain(head)?;
                    return Err(e);
                }
            }
        };
        {
            let mut pager = self.pager.write();
            for element in outcome.replaced.iter().chain(old.iter()) {
                pager.free_chain(element.head)?;
            }
        }
        if outcome.grew {
            self.persist_geometry()?;
        }
        self.sync_if_configured()
    }

    fn persist_geometry(&self) -> StoreResult<()> {
        let (mask_bits, hasher) = {
            let table = self.table.read();
            (table.mask_bits(), Superblock::hasher_field(table.hasher().name())?)
        };
        let mut pager = self.pager.write();
        let page_size = pager.page_size() as u32;
        pager.write_superblock(Superblock {
            page_size,
            mask_bits,
            collision_mask_bits: self.config.collision_mask_bits,
            max_elements: self.config.max_elements as u32,
            hasher,
        })
    }

    fn sync_if_configured(&self) -> StoreResult<()> {
        if self.config.sync_writes {
            self.pager.read().sync()?;
        }
        Ok(())
    }

    pub(crate) fn sync(&self) -> StoreResult<()> {
        if self.config.read_only {
            return Ok(());
        }
        self.pager.read().sync()
    }

    /// Keys currently in the table, sorted.
    pub(crate) fn keys(&self) -> Vec<Vec<u8>> {
        self.table.read().sorted_keys()
    }

    // ---- transaction log ----

    /// Append a record when a log is attached. Caller holds the writer lock.
    pub(crate) fn log_tx(&self, op: TxOp, key: &[u8], aux: &[u8], entry: Option<&Entry>) -> StoreResult<()> {
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(log) => log.append(op, key, aux, entry.map(Entry::encode_body).unwrap_or_default()),
            None => Ok(()),
        }
    }

    /// Attach a log, detaching (and draining) any previous one first.
    pub(crate) fn begin_tx(&self, path: &Path, options: &crate::config::TxOptions) -> StoreResult<()> {
        let durable = self.config.sync_writes;
        self.install_tx(|threads| TxLog::begin(path, options, threads, durable))
    }

    /// Attach `sink` as the log, named `target` in status output.
    pub(crate) fn begin_tx_sink(
        &self,
        target: &Path,
        sink: Arc<dyn TxSink>,
        options: &crate::config::TxOptions,
    ) -> StoreResult<()> {
        self.install_tx(|threads| TxLog::with_sink(target, sink, options, threads))
    }

    fn install_tx(&self, open: impl FnOnce(usize) -> StoreResult<TxLog>) -> StoreResult<()> {
        self.check_writable()?;
        let _w = self.writer.lock();
        let log = open(self.tx_threads.load(Ordering::Acquire))?;
        let previous = self.tx.lock().replace(log);
        if let Some(prev) = previous {
            tracing::info!("replacing attached transaction log");
            prev.stop()?;
        }
        Ok(())
    }

    pub(crate) fn stop_tx(&self) -> StoreResult<Option<TxSummary>> {
        let _w = self.writer.lock();
        let log = self.tx.lock().take();
        log.map(TxLog::stop).transpose()
    }

    pub(crate) fn tx_log_path(&self) -> Option<PathBuf> {
        self.tx.lock().as_ref().map(TxLog::path)
    }

    pub(crate) fn set_tx_threads(&self, threads: usize) -> StoreResult<()> {
        if threads > crate::txlog::MAX_TX_THREADS {
            return Err(StoreError::Config(format!(
                "transaction thread pool of {} exceeds limit of {}",
                threads,
                crate::txlog::MAX_TX_THREADS
            )));
        }
        self.tx_threads.store(threads, Ordering::Release);
        Ok(())
    }

    pub(crate) fn tx_threads(&self) -> usize {
        self.tx_threads.load(Ordering::Acquire)
    }

    // ---- dependents ----

    pub(crate) fn register_queue(&self, prefix: &[u8]) -> Arc<Mutex<()>> {
        self.queues.fetch_add(1, Ordering::AcqRel);
        Arc::clone(self.queue_locks.lock().entry(prefix.to_vec()).or_default())
    }

    pub(crate) fn release_queue(&self) {
        self.queues.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn live_queues(&self) -> usize {
        self.queues.load(Ordering::Acquire)
    }

    // ---- lifecycle ----

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the store. Fails with `ResourceInUse` while queue handles are
    /// alive; the store stays open in that case.
    pub(crate) fn close(&self, wait: Duration) -> StoreResult<CloseReport> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(StoreError::InvalidHandle("store is already closed".into()));
        }
        let queues = self.live_queues();
        if queues > 0 {
            self.closed.store(false, Ordering::Release);
            return Err(StoreError::ResourceInUse { what: "queue handles".into(), count: queues });
        }
        self.shutdown(wait)
    }

    /// Release everything. `closed` is already set.
    fn shutdown(&self, wait: Duration) -> StoreResult<CloseReport> {
        let deadline = Instant::now() + wait;
        let mut inflight = self.inflight.load(Ordering::Acquire);
        while inflight > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
            inflight = self.inflight.load(Ordering::Acquire);
        }
        let timed_out = inflight > 0;
        if timed_out {
            tracing::warn!(inflight, wait_ms = wait.as_millis() as u64, "closing store with calls still in flight");
        }

        let tx = self.tx.lock().take().map(TxLog::stop).transpose();
        let synced = self.sync();
        *self.lock.lock() = None;

        if self.config.remove_on_close {
            if let Some(path) = &self.path {
                std::fs::remove_file(path).map_err(|e| io_err(path, &e, "failed to remove store file"))?;
                tracing::info!(path = %path.display(), "removed store file on close");
            }
        }
        synced?;
        let tx = tx?;
        tracing::debug!(path = ?self.path, "store closed");
        Ok(CloseReport { timed_out, inflight, tx })
    }

    pub(crate) fn state(&self) -> StoreState {
        let table = self.table.read();
        let stats = self.pager.read().stats();
        StoreState {
            path: self.path.clone(),
            read_only: self.config.read_only,
            full_map: self.config.full_map,
            mask_bits: table.mask_bits(),
            collision_mask_bits: table.collision_mask_bits(),
            max_elements: table.max_elements(),
            hash_function: table.hasher().name().to_string(),
            page_size: stats.page_size,
            page_count: stats.page_count,
            free_pages: stats.free_pages,
            entries: table.len(),
            occupied_slots: table.occupied_slots(),
            longest_chain: table.longest_chain(),
            queues: self.live_queues(),
            tx_log: self.tx_log_path(),
        }
    }

    pub(crate) fn dump_key_table(&self, w: &mut dyn Write) -> io::Result<()> {
        write!(w, "{}", self.state())?;
        self.table.read().dump(w)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.shutdown(Duration::ZERO) {
                tracing::error!(error = %e, "failed to close store on drop");
            }
        }
    }
}

/// Rebuild the key table from record heads. The highest sequence number
/// per key wins; every page not reachable from a winner becomes free.
fn recover(
    pager: &mut Pager,
    sb: &Superblock,
    read_only: bool,
    hasher: Arc<dyn KeyHasher>,
) -> StoreResult<(HashTable, u64)> {
    let mut winners: HashMap<Vec<u8>, (PageId, u64)> = HashMap::new();
    let mut damaged = 0usize;
    let mut stale = 0usize;

    for head in pager.scan_heads()? {
        let decoded = pager.read_chain(head).and_then(|bytes| decode_record(&bytes));
        match decoded {
            Ok((entry, seq)) => match winners.entry(entry.key) {
                hashbrown::hash_map::Entry::Occupied(mut o) => {
                    stale += 1;
                    if seq > o.get().1 {
                        o.insert((head, seq));
                    }
                }
                hashbrown::hash_map::Entry::Vacant(v) => {
                    v.insert((head, seq));
                }
            },
            Err(e) => {
                tracing::warn!(page = head, error = %e, "skipping damaged record");
                damaged += 1;
            }
        }
    }

    let mut table = HashTable::new(sb.mask_bits, sb.collision_mask_bits, sb.max_elements as usize, hasher);
    let mut live: HashSet<PageId> = HashSet::new();
    let mut max_seq = 0u64;
    for (key, (head, seq)) in winners {
        for page in pager.chain_pages(head)? {
            if !live.insert(page) {
                return Err(pager.corrupt(page, "page belongs to two records"));
            }
        }
        max_seq = max_seq.max(seq);
        let element = table.element(&key, head, seq);
        table.insert(element)?;
    }

    let reclaimed = pager.rebuild_free_list(&live)?;
    if damaged > 0 || stale > 0 {
        tracing::info!(damaged, stale, reclaimed, "recovered store with leftover records");
    }
    if !read_only && table.mask_bits() != sb.mask_bits {
        pager.write_superblock(Superblock { mask_bits: table.mask_bits(), ..*sb })?;
    }
    Ok((table, max_seq + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn put(engine: &Engine, key: &[u8], value: &[u8]) {
        let _w = engine.writer.lock();
        let mut e = Entry::new(key);
        e.value = value.to_vec();
        engine.store_entry(&e).unwrap();
    }

    #[test]
    fn test_store_load_delete() {
        let engine = Engine::open_memory(Config::small()).unwrap();
        put(&engine, b"k", b"v1");
        put(&engine, b"k", b"v2");
        let (entry, _) = engine.load(b"k").unwrap().unwrap();
        assert_eq!(entry.value, b"v2");

        let _w = engine.writer.lock();
        assert!(engine.delete_entry(b"k").unwrap());
        assert!(!engine.delete_entry(b"k").unwrap());
        assert!(engine.load(b"k").unwrap().is_none());
    }

    #[test]
    fn test_reopen_recovers_latest_and_frees_the_rest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.khv");
        {
            let engine = Engine::open_file(&path, Config::small(), false).unwrap();
            put(&engine, b"a", &[1u8; 700]);
            put(&engine, b"a", &[2u8; 10]);
            put(&engine, b"b", b"bee");
            let _w = engine.writer.lock();
            engine.delete_entry(b"b").unwrap();
        }
        let engine = Engine::open_file(&path, Config::default(), false).unwrap();
        assert_eq!(engine.config().page_size, Config::small().page_size);
        assert_eq!(engine.load(b"a").unwrap().unwrap().0.value, vec![2u8; 10]);
        assert!(engine.load(b"b").unwrap().is_none());
        let state = engine.state();
        assert_eq!(state.entries, 1);
        assert_eq!(state.free_pages, state.page_count - 2);
    }

    #[test]
    fn test_duplicate_heads_resolve_by_sequence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.khv");
        {
            let engine = Engine::open_file(&path, Config::small(), false).unwrap();
            put(&engine, b"k", b"old");
            // simulate a crash between writing the new chain and freeing the
            // old one: write a second head for the same key by hand
            let mut e = Entry::new(b"k");
            e.value = b"new".to_vec();
            let mut pager = engine.pager.write();
            pager.write_chain(&encode_record(&e, 99)).unwrap();
            pager.sync().unwrap();
        }
        let engine = Engine::open_file(&path, Config::small(), false).unwrap();
        let (entry, seq) = engine.load(b"k").unwrap().unwrap();
        assert_eq!((entry.value.as_slice(), seq), (&b"new"[..], 99));
        assert_eq!(engine.next_seq.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_growth_persists_mask() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.khv");
        let mut cfg = Config::small();
        cfg.mask_bits = 1;
        cfg.collision_mask_bits = 1;
        cfg.max_elements = 2;
        {
            let engine = Engine::open_file(&path, cfg.clone(), false).unwrap();
            for i in 0..64u32 {
                put(&engine, format!("key{}", i).as_bytes(), b"v");
            }
            assert!(engine.state().mask_bits > 1);
        }
        let engine = Engine::open_file(&path, Config::default(), false).unwrap();
        let state = engine.state();
        assert!(state.mask_bits > 1);
        assert_eq!(state.entries, 64);
        assert!(state.longest_chain <= 2);
    }

    struct Fnv1a;

    impl KeyHasher for Fnv1a {
        fn name(&self) -> &str {
            "fnv1a"
        }
        fn hash(&self, key: &[u8]) -> u64 {
            key.iter().fold(0xcbf29ce484222325, |h, &b| (h ^ b as u64).wrapping_mul(0x100000001b3))
        }
    }

    #[test]
    fn test_store_reopens_only_with_its_hasher() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.khv");
        let mut cfg = Config::small();
        cfg.mask_bits = 1;
        cfg.max_elements = 2;
        {
            let engine = Engine::open_file_with(&path, cfg.clone(), false, Arc::new(Fnv1a)).unwrap();
            for i in 0..40u32 {
                put(&engine, format!("key{}", i).as_bytes(), b"v");
            }
            assert!(engine.state().mask_bits > 1);
        }
        assert!(matches!(
            Engine::open_file(&path, Config::small(), false),
            Err(StoreError::Config(_))
        ));

        let engine = Engine::open_file_with(&path, Config::small(), false, Arc::new(Fnv1a)).unwrap();
        let state = engine.state();
        assert_eq!(state.hash_function, "fnv1a");
        assert_eq!(state.entries, 40);
        assert_eq!(engine.load(b"key17").unwrap().unwrap().0.value, b"v");
    }

    #[test]
    fn test_read_only_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.khv");
        {
            let engine = Engine::open_file(&path, Config::small(), false).unwrap();
            put(&engine, b"k", b"v");
        }
        let mut cfg = Config::small();
        cfg.read_only = true;
        let engine = Engine::open_file(&path, cfg, false).unwrap();
        assert_eq!(engine.load(b"k").unwrap().unwrap().0.value, b"v");
        let _w = engine.writer.lock();
        assert!(matches!(engine.store_entry(&Entry::new(b"x")), Err(StoreError::ReadOnly(_))));
    }

    #[test]
    fn test_create_new_refuses_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.khv");
        drop(Engine::open_file(&path, Config::small(), true).unwrap());
        assert!(matches!(
            Engine::open_file(&path, Config::small(), true),
            Err(StoreError::Io { kind: io::ErrorKind::AlreadyExists, .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_second_writer_is_locked_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.khv");
        let _first = Engine::open_file(&path, Config::small(), false).unwrap();
        assert!(matches!(
            Engine::open_file(&path, Config::small(), false),
            Err(StoreError::Io { kind: io::ErrorKind::WouldBlock, .. })
        ));
    }

    #[test]
    fn test_full_map_backing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mapped.khv");
        let mut cfg = Config::small();
        cfg.full_map = true;
        {
            let engine = Engine::open_file(&path, cfg.clone(), false).unwrap();
            for i in 0..50u32 {
                put(&engine, format!("m{}", i).as_bytes(), &[i as u8; 300]);
            }
            engine.sync().unwrap();
        }
        let engine = Engine::open_file(&path, cfg, false).unwrap();
        assert_eq!(engine.load(b"m7").unwrap().unwrap().0.value, vec![7u8; 300]);
    }

    #[test]
    fn test_close_is_final() {
        let engine = Engine::open_memory(Config::small()).unwrap();
        let report = engine.close(Duration::ZERO).unwrap();
        assert!(!report.timed_out);
        assert!(matches!(engine.enter(), Err(StoreError::InvalidHandle(_))));
        assert!(matches!(engine.close(Duration::ZERO), Err(StoreError::InvalidHandle(_))));
    }

    #[test]
    fn test_close_refused_with_live_queue() {
        let engine = Engine::open_memory(Config::small()).unwrap();
        let _lock = engine.register_queue(b"q");
        assert!(matches!(
            engine.close(Duration::ZERO),
            Err(StoreError::ResourceInUse { count: 1, .. })
        ));
        assert!(engine.enter().is_ok());
        engine.release_queue();
        assert!(engine.close(Duration::ZERO).is_ok());
    }

    #[test]
    fn test_close_wait_times_out_on_inflight_call() {
        let engine = Engine::open_memory(Config::small()).unwrap();
        let guard = engine.enter().unwrap();
        let report = engine.close(Duration::from_millis(20)).unwrap();
        assert!(report.timed_out);
        assert_eq!(report.inflight, 1);
        drop(guard);
    }

    #[test]
    fn test_remove_on_close() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tmp.khv");
        let mut cfg = Config::small();
        cfg.remove_on_close = true;
        let engine = Engine::open_file(&path, cfg, false).unwrap();
        assert!(path.exists());
        engine.close(Duration::ZERO).unwrap();
        assert!(!path.exists());
    }
}
