//! Transaction log
//!
//! Every mutation of an attached store appends one chunk to the log file,
//! or to a [`TxSink`] supplied by a plugin loader.
//! With a pool size of 0 the calling thread writes the chunk itself. With a
//! pool of N workers each worker drains its own bounded channel and keys are
//! routed by hash, so records of one key are written in order. Records also
//! carry a log-wide sequence number; replay sorts by it.
//!
//! Record payload:
//!   seq u64 | timestamp u64 | expire_at u64 (0 = never)
//!   | prefix | params | key | aux | snapshot   (u32-length-prefixed)
//!
//! `snapshot` is the entry body after the mutation (empty for removals);
//! `aux` is the old key of a rename.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;

use crate::config::TxOptions;
use crate::error::{StoreError, StoreResult};
use crate::format::{encode_chunk, put_bytes, scan_chunks, ChunkType, PayloadReader};
use crate::hash::hash_key;
use crate::platform_durability::durable_sync;
use crate::record::unix_secs;

/// Capacity of each worker's channel
const WORKER_QUEUE_DEPTH: usize = 1024;

/// Largest worker pool accepted by `set_tx_thread_pool`
pub const MAX_TX_THREADS: usize = 64;

/// Kind of mutation a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOp {
    SetValue,
    SetSubkeys,
    AddAttr,
    Remove,
    Rename,
}

impl TxOp {
    fn chunk_type(self) -> ChunkType {
        match self {
            TxOp::SetValue => ChunkType::TxSetValue,
            TxOp::SetSubkeys => ChunkType::TxSetSubkeys,
            TxOp::AddAttr => ChunkType::TxAddAttr,
            TxOp::Remove => ChunkType::TxRemove,
            TxOp::Rename => ChunkType::TxRename,
        }
    }

    fn from_chunk_type(t: ChunkType) -> Option<Self> {
        match t {
            ChunkType::TxSetValue => Some(TxOp::SetValue),
            ChunkType::TxSetSubkeys => Some(TxOp::SetSubkeys),
            ChunkType::TxAddAttr => Some(TxOp::AddAttr),
            ChunkType::TxRemove => Some(TxOp::Remove),
            ChunkType::TxRename => Some(TxOp::Rename),
            _ => None,
        }
    }
}

/// One decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRecord {
    pub op: TxOp,
    pub seq: u64,
    pub timestamp: u64,
    pub expire_at: Option<u64>,
    pub prefix: Vec<u8>,
    pub params: Vec<u8>,
    pub key: Vec<u8>,
    pub aux: Vec<u8>,
    pub snapshot: Vec<u8>,
}

impl TxRecord {
    fn encode(&self) -> StoreResult<Vec<u8>> {
        let mut payload = Vec::with_capacity(
            24 + 20 + self.prefix.len() + self.params.len() + self.key.len() + self.aux.len() + self.snapshot.len(),
        );
        payload.extend_from_slice(&self.seq.to_le_bytes());
        payload.extend_from_slice(&self.timestamp.to_le_bytes());
        payload.extend_from_slice(&self.expire_at.unwrap_or(0).to_le_bytes());
        put_bytes(&mut payload, &self.prefix);
        put_bytes(&mut payload, &self.params);
        put_bytes(&mut payload, &self.key);
        put_bytes(&mut payload, &self.aux);
        put_bytes(&mut payload, &self.snapshot);
        encode_chunk(self.op.chunk_type(), &payload)
    }

    fn decode(op: TxOp, payload: &[u8]) -> StoreResult<Self> {
        let mut r = PayloadReader::new(payload);
        let seq = r.u64()?;
        let timestamp = r.u64()?;
        let expire_at = r.u64()?;
        let record = Self {
            op,
            seq,
            timestamp,
            expire_at: if expire_at == 0 { None } else { Some(expire_at) },
            prefix: r.bytes()?,
            params: r.bytes()?,
            key: r.bytes()?,
            aux: r.bytes()?,
            snapshot: r.bytes()?,
        };
        if !r.is_exhausted() {
            return Err(StoreError::Corrupt {
                path: None,
                offset: 0,
                reason: "trailing bytes after transaction record".into(),
            });
        }
        Ok(record)
    }
}

/// Destination of encoded transaction records. `append` receives one
/// complete chunk per call; chunks of one key arrive in order.
pub trait TxSink: Send + Sync {
    fn append(&self, chunk: &[u8]) -> StoreResult<()>;

    /// Make appended chunks durable. Called when the log is detached.
    fn sync(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Append-only log file.
struct FileSink {
    file: Mutex<File>,
    path: PathBuf,
    durable: bool,
}

impl FileSink {
    /// Open for append, returning the sink and the bytes already present.
    fn open(path: &Path, durable: bool) -> StoreResult<(Self, u64)> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| StoreError::io_at(path, &e, "failed to open transaction log"))?;
        let size = file
            .metadata()
            .map_err(|e| StoreError::io_at(path, &e, "failed to stat transaction log"))?
            .len();
        Ok((Self { file: Mutex::new(file), path: path.to_path_buf(), durable }, size))
    }
}

impl TxSink for FileSink {
    fn append(&self, chunk: &[u8]) -> StoreResult<()> {
        let mut file = self.file.lock();
        file.write_all(chunk)
            .map_err(|e| StoreError::io_at(&self.path, &e, "transaction log write failed"))?;
        if self.durable {
            durable_sync(&file).map_err(|e| StoreError::io_at(&self.path, &e, "transaction log sync failed"))?;
        }
        Ok(())
    }

    fn sync(&self) -> StoreResult<()> {
        durable_sync(&self.file.lock())
            .map_err(|e| StoreError::io_at(&self.path, &e, "transaction log sync failed"))
    }
}

/// State shared with the worker threads.
struct Shared {
    sink: Arc<dyn TxSink>,
    target: PathBuf,
    pending: AtomicUsize,
    written: AtomicU64,
    bytes: AtomicU64,
    failure: Mutex<Option<StoreError>>,
}

impl Shared {
    fn write(&self, chunk: &[u8]) -> StoreResult<()> {
        self.sink.append(chunk)?;
        self.written.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

struct Worker {
    sender: Sender<Vec<u8>>,
    thread: thread::JoinHandle<()>,
}

/// An attached transaction log.
pub struct TxLog {
    shared: Arc<Shared>,
    workers: Vec<Worker>,
    prefix: Vec<u8>,
    params: Vec<u8>,
    expire: Option<Duration>,
    seq: AtomicU64,
}

/// Counters reported when a log is detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxSummary {
    pub written: u64,
    /// Log file size, or bytes handed to a sink
    pub bytes: u64,
}

impl TxLog {
    /// Open (or append to) the log at `path` with `threads` workers.
    pub fn begin(path: &Path, options: &TxOptions, threads: usize, durable: bool) -> StoreResult<Self> {
        validate(options, threads)?;

        // resume after the highest sequence already in the file
        let next_seq = match std::fs::read(path) {
            Ok(buf) => {
                let outcome = scan_chunks(&buf, path);
                outcome
                    .chunks
                    .iter()
                    .filter_map(|c| PayloadReader::new(&c.payload).u64().ok())
                    .max()
                    .map_or(0, |s| s + 1)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(StoreError::io_at(path, &e, "failed to read transaction log")),
        };

        let (sink, size) = FileSink::open(path, durable)?;
        Self::start(path, Arc::new(sink), size, next_seq, options, threads)
    }

    /// Send records to `sink` instead of a file. `target` names the sink in
    /// status output.
    pub fn with_sink(target: &Path, sink: Arc<dyn TxSink>, options: &TxOptions, threads: usize) -> StoreResult<Self> {
        validate(options, threads)?;
        Self::start(target, sink, 0, 0, options, threads)
    }

    fn start(
        target: &Path,
        sink: Arc<dyn TxSink>,
        bytes: u64,
        next_seq: u64,
        options: &TxOptions,
        threads: usize,
    ) -> StoreResult<Self> {
        let shared = Arc::new(Shared {
            sink,
            target: target.to_path_buf(),
            pending: AtomicUsize::new(0),
            written: AtomicU64::new(0),
            bytes: AtomicU64::new(bytes),
            failure: Mutex::new(None),
        });

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let (sender, receiver) = bounded::<Vec<u8>>(WORKER_QUEUE_DEPTH);
            let shared_clone = Arc::clone(&shared);
            let thread = thread::Builder::new()
                .name(format!("keyhive-tx-{}", i))
                .spawn(move || {
                    for bytes in receiver.iter() {
                        if let Err(e) = shared_clone.write(&bytes) {
                            tracing::error!(error = %e, "transaction worker write failed");
                            shared_clone.failure.lock().get_or_insert(e);
                        }
                        shared_clone.pending.fetch_sub(1, Ordering::AcqRel);
                    }
                })
                .map_err(|e| StoreError::Io {
                    path: Some(target.to_path_buf()),
                    kind: std::io::ErrorKind::Other,
                    message: format!("failed to spawn transaction worker: {}", e),
                })?;
            workers.push(Worker { sender, thread });
        }

        tracing::info!(path = %target.display(), threads, next_seq, "transaction log attached");
        Ok(Self {
            shared,
            workers,
            prefix: options.prefix.clone(),
            params: options.params.clone(),
            expire: options.expire,
            seq: AtomicU64::new(next_seq),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.shared.target.clone()
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Records handed to workers and not yet written.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Encoded payload size of a record for `key` with the given aux and
    /// snapshot lengths.
    pub fn record_len(&self, key_len: usize, aux_len: usize, snapshot_len: usize) -> usize {
        24 + 20 + self.prefix.len() + self.params.len() + key_len + aux_len + snapshot_len
    }

    /// Append one record. With workers the write happens asynchronously and
    /// a failure is reported by [`TxLog::stop`].
    pub fn append(&self, op: TxOp, key: &[u8], aux: &[u8], snapshot: Vec<u8>) -> StoreResult<()> {
        let now = SystemTime::now();
        let record = TxRecord {
            op,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            timestamp: unix_secs(now),
            expire_at: self.expire.map(|d| unix_secs(now + d).max(1)),
            prefix: self.prefix.clone(),
            params: self.params.clone(),
            key: key.to_vec(),
            aux: aux.to_vec(),
            snapshot,
        };
        let bytes = record.encode()?;

        if self.workers.is_empty() {
            return self.shared.write(&bytes);
        }
        let worker = &self.workers[(hash_key(key) % self.workers.len() as u64) as usize];
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if worker.sender.send(bytes).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(StoreError::InvalidHandle("transaction worker has exited".into()));
        }
        Ok(())
    }

    /// Detach: close the channels, wait for every queued record to be
    /// written, and sync the sink.
    pub fn stop(self) -> StoreResult<TxSummary> {
        let TxLog { shared, workers, .. } = self;
        for worker in workers {
            drop(worker.sender);
            if worker.thread.join().is_err() {
                tracing::error!("transaction worker panicked");
            }
        }
        shared.sink.sync()?;
        if let Some(e) = shared.failure.lock().take() {
            return Err(e);
        }
        let summary = TxSummary {
            written: shared.written.load(Ordering::Relaxed),
            bytes: shared.bytes.load(Ordering::Relaxed),
        };
        tracing::info!(path = %shared.target.display(), written = summary.written, "transaction log detached");
        Ok(summary)
    }
}

fn validate(options: &TxOptions, threads: usize) -> StoreResult<()> {
    if options.expire.is_some_and(|d| d.is_zero()) {
        return Err(StoreError::Config("transaction expiration of zero is not allowed".into()));
    }
    if threads > MAX_TX_THREADS {
        return Err(StoreError::Config(format!(
            "transaction thread pool of {} exceeds limit of {}",
            threads, MAX_TX_THREADS
        )));
    }
    Ok(())
}

/// Records read back from a log file.
#[derive(Debug, Default)]
pub struct TxReplay {
    /// Live records in sequence order
    pub records: Vec<TxRecord>,
    /// Damaged regions or undecodable records passed over
    pub skipped: usize,
    /// Records past their expiration
    pub expired: usize,
}

/// Read a log file. Without `ignore_errors` the first damaged region or
/// undecodable record fails the whole read.
pub fn read_log(path: &Path, ignore_errors: bool) -> StoreResult<TxReplay> {
    let buf = std::fs::read(path).map_err(|e| StoreError::io_at(path, &e, "failed to read transaction log"))?;
    let outcome = scan_chunks(&buf, path);

    let mut replay = TxReplay::default();
    if let Some(e) = outcome.errors.first() {
        if !ignore_errors {
            return Err(e.clone());
        }
        replay.skipped += outcome.errors.len();
    }

    let now = unix_secs(SystemTime::now());
    for chunk in outcome.chunks {
        let decoded = TxOp::from_chunk_type(chunk.chunk_type)
            .ok_or_else(|| StoreError::Corrupt {
                path: Some(path.to_path_buf()),
                offset: chunk.offset,
                reason: format!("{:?} chunk in transaction log", chunk.chunk_type),
            })
            .and_then(|op| {
                TxRecord::decode(op, &chunk.payload).map_err(|e| match e {
                    StoreError::Corrupt { reason, .. } => StoreError::Corrupt {
                        path: Some(path.to_path_buf()),
                        offset: chunk.offset,
                        reason,
                    },
                    other => other,
                })
            });
        match decoded {
            Ok(record) if record.expire_at.is_some_and(|at| at <= now) => replay.expired += 1,
            Ok(record) => replay.records.push(record),
            Err(e) if ignore_errors => {
                tracing::warn!(error = %e, "skipping undecodable transaction record");
                replay.skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }
    replay.records.sort_by_key(|r| r.seq);
    Ok(replay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn opts() -> TxOptions {
        TxOptions { prefix: b"pfx".to_vec(), params: b"param".to_vec(), expire: None }
    }

    #[test]
    fn test_sync_log_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tx.log");
        let log = TxLog::begin(&path, &opts(), 0, false).unwrap();
        log.append(TxOp::SetValue, b"a", b"", b"snap-a".to_vec()).unwrap();
        log.append(TxOp::Rename, b"b", b"a", b"snap-b".to_vec()).unwrap();
        log.append(TxOp::Remove, b"b", b"", Vec::new()).unwrap();
        assert_eq!(log.stop().unwrap().written, 3);

        let replay = read_log(&path, false).unwrap();
        let ops: Vec<TxOp> = replay.records.iter().map(|r| r.op).collect();
        assert_eq!(ops, vec![TxOp::SetValue, TxOp::Rename, TxOp::Remove]);
        assert_eq!(replay.records[1].aux, b"a");
        assert_eq!(replay.records[0].prefix, b"pfx");
        assert_eq!(replay.records[0].params, b"param");
    }

    #[test]
    fn test_pool_drains_on_stop_and_orders_by_seq() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tx.log");
        let log = TxLog::begin(&path, &opts(), 4, false).unwrap();
        assert_eq!(log.threads(), 4);
        for i in 0..500u32 {
            let key = format!("k{}", i % 17);
            log.append(TxOp::SetValue, key.as_bytes(), b"", i.to_le_bytes().to_vec()).unwrap();
        }
        let summary = log.stop().unwrap();
        assert_eq!(summary.written, 500);

        let replay = read_log(&path, false).unwrap();
        assert_eq!(replay.records.len(), 500);
        for (i, r) in replay.records.iter().enumerate() {
            assert_eq!(r.seq, i as u64);
            assert_eq!(r.snapshot, (i as u32).to_le_bytes());
        }
    }

    #[test]
    fn test_sequence_resumes_across_sessions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tx.log");
        let first = TxLog::begin(&path, &opts(), 0, false).unwrap();
        first.append(TxOp::SetValue, b"a", b"", Vec::new()).unwrap();
        first.stop().unwrap();
        let second = TxLog::begin(&path, &opts(), 0, false).unwrap();
        second.append(TxOp::SetValue, b"a", b"", Vec::new()).unwrap();
        second.stop().unwrap();

        let seqs: Vec<u64> = read_log(&path, false).unwrap().records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[test]
    fn test_expired_records_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tx.log");
        let (file, _) = FileSink::open(&path, false).unwrap();
        let record = TxRecord {
            op: TxOp::SetValue,
            seq: 0,
            timestamp: 1,
            expire_at: Some(2),
            prefix: Vec::new(),
            params: Vec::new(),
            key: b"old".to_vec(),
            aux: Vec::new(),
            snapshot: Vec::new(),
        };
        file.append(&record.encode().unwrap()).unwrap();
        let replay = read_log(&path, false).unwrap();
        assert!(replay.records.is_empty());
        assert_eq!(replay.expired, 1);
    }

    #[test]
    fn test_corrupt_region_needs_ignore_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tx.log");
        let log = TxLog::begin(&path, &opts(), 0, false).unwrap();
        log.append(TxOp::SetValue, b"a", b"", b"one".to_vec()).unwrap();
        log.append(TxOp::SetValue, b"b", b"", b"two".to_vec()).unwrap();
        log.stop().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[crate::format::HEADER_SIZE + 2] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(read_log(&path, false), Err(StoreError::Corrupt { .. })));
        let replay = read_log(&path, true).unwrap();
        assert_eq!(replay.records.len(), 1);
        assert_eq!(replay.records[0].key, b"b");
        assert_eq!(replay.skipped, 1);
    }

    #[derive(Default)]
    struct MemorySink {
        buf: Mutex<Vec<u8>>,
        synced: AtomicUsize,
    }

    impl TxSink for MemorySink {
        fn append(&self, chunk: &[u8]) -> StoreResult<()> {
            self.buf.lock().extend_from_slice(chunk);
            Ok(())
        }

        fn sync(&self) -> StoreResult<()> {
            self.synced.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn test_sink_receives_every_record() {
        let sink = Arc::new(MemorySink::default());
        let log = TxLog::with_sink(Path::new("memory://tx"), sink.clone(), &opts(), 2).unwrap();
        assert_eq!(log.path(), PathBuf::from("memory://tx"));
        for i in 0..50u32 {
            log.append(TxOp::SetValue, format!("k{}", i).as_bytes(), b"", Vec::new()).unwrap();
        }
        let summary = log.stop().unwrap();
        assert_eq!(summary.written, 50);
        assert_eq!(summary.bytes, sink.buf.lock().len() as u64);
        assert_eq!(sink.synced.load(Ordering::Relaxed), 1);

        // the chunks are the same a log file holds
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("copy.log");
        std::fs::write(&path, &*sink.buf.lock()).unwrap();
        let replay = read_log(&path, false).unwrap();
        assert_eq!(replay.records.len(), 50);
        assert_eq!(replay.records[49].seq, 49);
    }

    #[test]
    fn test_zero_expire_and_oversized_pool_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tx.log");
        let mut o = opts();
        o.expire = Some(Duration::ZERO);
        assert!(matches!(TxLog::begin(&path, &o, 0, false), Err(StoreError::Config(_))));
        assert!(matches!(TxLog::begin(&path, &opts(), MAX_TX_THREADS + 1, false), Err(StoreError::Config(_))));
    }
}
