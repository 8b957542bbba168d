//! Integration tests: the public `Store` API end to end.
//!
//! These tests exercise file-backed stores across reopen, the queue,
//! transaction log and archive paths, and multi-threaded access.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use tempfile::TempDir;

use keyhive_core::{
    Config, ErrorKind, Expire, KeyHasher, PluginLoader, PluginRegistry, QueueOptions, ReadOptions, RemoveMode, Store,
    StoreError, StoreResult, TxOptions, TxSink, WriteOptions,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_store() -> (Store, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path().join("store.khs"), Config::small()).unwrap();
    (store, dir)
}

fn no_opts() -> ReadOptions {
    ReadOptions::default()
}

fn expired() -> WriteOptions {
    WriteOptions::with_expire(Expire::At(SystemTime::now() - Duration::from_secs(1)))
}

// ---------------------------------------------------------------------------
// Key/value round trips
// ---------------------------------------------------------------------------

#[test]
fn test_set_get_roundtrip() {
    let (store, _dir) = test_store();
    let big = vec![0x5au8; 10_000];
    store.set("small", "v").unwrap();
    store.set(b"bin\0key", &big).unwrap();
    store.set("empty-value", b"").unwrap();

    assert_eq!(store.get("small").unwrap(), b"v");
    assert_eq!(store.get(b"bin\0key").unwrap(), big);
    assert_eq!(store.get("empty-value").unwrap(), b"");
    assert_eq!(store.get("missing").unwrap_err().kind(), ErrorKind::NotFound);
}

#[test]
fn test_remove_value_only_then_not_found() {
    let (store, _dir) = test_store();
    store.set("k", "v").unwrap();
    store.add_subkey("k", "child", "c").unwrap();
    store.remove("k", &RemoveMode::ValueOnly).unwrap();

    assert!(matches!(store.get("k"), Err(StoreError::NotFound(_))));
    assert_eq!(store.get("child").unwrap(), b"c");
}

#[test]
fn test_set_subkeys_replaces() {
    let (store, _dir) = test_store();
    store.set("k", "v").unwrap();
    store.set_subkeys("k", &["a", "b"]).unwrap();
    store.set_subkeys("k", &["c"]).unwrap();
    assert_eq!(store.get_subkeys("k").unwrap(), vec![b"c".to_vec()]);
}

#[test]
fn test_add_subkey_is_idempotent_and_overwrites() {
    let (store, _dir) = test_store();
    store.add_subkey("k", "a", "v1").unwrap();
    store.add_subkey("k", "a", "v2").unwrap();
    assert_eq!(store.get_subkeys("k").unwrap(), vec![b"a".to_vec()]);
    assert_eq!(store.get("a").unwrap(), b"v2");
}

#[test]
fn test_expired_value_keeps_dangling_reference() {
    let (store, _dir) = test_store();
    store.set("parent", "p").unwrap();
    store.add_subkey_with("parent", "k", "v", &expired()).unwrap();

    assert!(matches!(store.get("k"), Err(StoreError::NotFound(_))));
    assert_eq!(store.get_subkeys("parent").unwrap(), vec![b"k".to_vec()]);
}

#[test]
fn test_default_expiration_duration() {
    let (store, _dir) = test_store();
    assert!(matches!(store.set_expiration_duration(Some(Duration::ZERO)), Err(StoreError::Config(_))));
    store.set_expiration_duration(Some(Duration::from_secs(3600))).unwrap();
    store.set("k", "v").unwrap();
    assert_eq!(store.get("k").unwrap(), b"v");
    store.set_expiration_duration(None).unwrap();
}

#[test]
fn test_rename_and_cascade() {
    let (store, _dir) = test_store();
    store.add_subkey("root", "a", "1").unwrap();
    store.add_subkey("a", "b", "2").unwrap();
    store.add_subkey("b", "root", "back").unwrap();
    store.rename("root", "top").unwrap();
    assert!(store.get("root").is_err());
    assert_eq!(store.get("top").unwrap(), b"back");

    store.remove("top", &RemoveMode::All).unwrap();
    for key in ["top", "a", "b"] {
        assert!(store.get(key).is_err(), "{} should be gone", key);
    }
}

// ---------------------------------------------------------------------------
// Attributes and encryption
// ---------------------------------------------------------------------------

#[test]
fn test_password_ring() {
    let (store, _dir) = test_store();
    store.set_default_encryption_password("p1").unwrap();
    store.set("k", "secret").unwrap();
    store.add_decryption_password("p2").unwrap();

    assert_eq!(store.get("k").unwrap(), b"secret");
    let err = store.get_with("k", &ReadOptions::with_password("wrong")).unwrap_err();
    assert!(matches!(err, StoreError::Decrypt(_)));
    assert_eq!(store.get_with("k", &ReadOptions::with_password("p1")).unwrap(), b"secret");
}

#[test]
fn test_encrypted_value_survives_reopen_with_ring() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.khs");
    {
        let store = Store::open(&path, Config::small()).unwrap();
        store.set_with("k", "secret", &WriteOptions::with_password("old")).unwrap();
        store.close(Duration::ZERO).unwrap();
    }
    let store = Store::open(&path, Config::small()).unwrap();
    assert!(matches!(store.get("k"), Err(StoreError::Decrypt(_))));
    store.add_decryption_password("other").unwrap();
    store.add_decryption_password("old").unwrap();
    assert_eq!(store.get("k").unwrap(), b"secret");
}

#[test]
fn test_mtime_and_history() {
    let (store, _dir) = test_store();
    store.enable_mtime(true).unwrap();
    store.enable_history(true).unwrap();
    store.set("k", "v1").unwrap();
    store.set("k", "v2").unwrap();
    store.set("k", "v3").unwrap();

    let attrs = store.get_attrs("k").unwrap();
    assert!(attrs.iter().any(|(name, _)| name == b"mtime"));
    assert_eq!(store.get_history("k", &no_opts()).unwrap(), vec![b"v2".to_vec(), b"v1".to_vec()]);
    assert!(matches!(store.add_attr("k", "mtime", "0"), Err(StoreError::InvalidArgument(_))));

    let names: Vec<String> = store.attr_information().unwrap().into_iter().map(|i| i.name).collect();
    assert!(names.contains(&"mtime".to_string()));
    assert!(names.contains(&"history".to_string()));
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[test]
fn test_reopen_persists_everything() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.khs");
    {
        let store = Store::open(&path, Config::small()).unwrap();
        for i in 0..200u32 {
            store.set(format!("key-{}", i), i.to_le_bytes()).unwrap();
        }
        store.add_subkey("key-0", "key-1", 1u32.to_le_bytes()).unwrap();
        store.add_attr("key-0", "owner", "tests").unwrap();
        store.remove("key-199", &RemoveMode::ValueOnly).unwrap();
        store.close(Duration::ZERO).unwrap();
    }

    // geometry comes from the file, not the passed config
    let mut other = Config::large();
    other.read_only = true;
    let store = Store::open(&path, other).unwrap();
    let state = store.state().unwrap();
    assert_eq!(state.entries, 199);
    assert_eq!(state.page_size, Config::small().page_size);

    for i in 0..199u32 {
        assert_eq!(store.get(format!("key-{}", i)).unwrap(), i.to_le_bytes());
    }
    assert!(store.get("key-199").is_err());
    assert_eq!(store.get_subkeys("key-0").unwrap(), vec![b"key-1".to_vec()]);
    assert_eq!(store.get_attrs("key-0").unwrap(), vec![(b"owner".to_vec(), b"tests".to_vec())]);
    assert!(matches!(store.set("x", "y"), Err(StoreError::ReadOnly(_))));
}

#[test]
fn test_full_map_store_reopens() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mapped.khs");
    let mut config = Config::small();
    config.full_map = true;
    {
        let store = Store::open(&path, config.clone()).unwrap();
        for i in 0..100u32 {
            store.set(format!("m{}", i), vec![i as u8; 700]).unwrap();
        }
    }
    let store = Store::open(&path, config).unwrap();
    assert_eq!(store.get("m42").unwrap(), vec![42u8; 700]);
    assert!(store.state().unwrap().full_map);
}

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

#[test]
fn test_queue_fifo_and_lifo() {
    let (store, _dir) = test_store();
    let fifo = store.acquire_queue(QueueOptions { fifo: true, prefix: b"f".to_vec() }).unwrap();
    fifo.push(b"x").unwrap();
    fifo.push(b"y").unwrap();
    assert_eq!(fifo.count().unwrap(), 2);
    assert_eq!(fifo.pop().unwrap(), b"x");
    assert_eq!(fifo.pop().unwrap(), b"y");
    assert_eq!(fifo.count().unwrap(), 0);
    assert!(matches!(fifo.pop(), Err(StoreError::Empty(_))));

    let lifo = store.acquire_queue(QueueOptions { fifo: false, prefix: b"l".to_vec() }).unwrap();
    lifo.push(b"x").unwrap();
    lifo.push(b"y").unwrap();
    assert_eq!(lifo.pop().unwrap(), b"y");
    assert_eq!(lifo.pop().unwrap(), b"x");
}

#[test]
fn test_queue_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.khs");
    {
        let store = Store::open(&path, Config::small()).unwrap();
        let q = store.acquire_queue(QueueOptions::default()).unwrap();
        q.push(b"first").unwrap();
        q.push(b"second").unwrap();
        q.release();
        store.close(Duration::ZERO).unwrap();
    }
    let store = Store::open(&path, Config::small()).unwrap();
    let q = store.acquire_queue(QueueOptions::default()).unwrap();
    assert_eq!(q.count().unwrap(), 2);
    assert_eq!(q.pop().unwrap(), b"first");
}

#[test]
fn test_concurrent_pushes_lose_nothing() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 25;

    let (store, _dir) = test_store();
    let store = Arc::new(store);
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let q = store.acquire_queue(QueueOptions { fifo: true, prefix: b"shared".to_vec() }).unwrap();
                for i in 0..PER_THREAD {
                    q.push(format!("{}-{}", t, i).as_bytes()).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let q = store.acquire_queue(QueueOptions { fifo: true, prefix: b"shared".to_vec() }).unwrap();
    assert_eq!(q.count().unwrap(), THREADS * PER_THREAD);

    let mut seen = Vec::new();
    while let Ok(item) = q.pop() {
        seen.push(String::from_utf8(item).unwrap());
    }
    assert_eq!(seen.len(), THREADS * PER_THREAD);
    // per-thread order is preserved in a FIFO
    for t in 0..THREADS {
        let mine: Vec<&String> = seen.iter().filter(|s| s.starts_with(&format!("{}-", t))).collect();
        let expected: Vec<String> = (0..PER_THREAD).map(|i| format!("{}-{}", t, i)).collect();
        assert_eq!(mine.into_iter().cloned().collect::<Vec<_>>(), expected);
    }
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[test]
fn test_parallel_writers_and_readers() {
    let (store, _dir) = test_store();
    let store = Arc::new(store);
    store.set("shared", "0").unwrap();

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for i in 0..50 {
                    store.set(format!("w{}-{}", t, i), format!("{}", i)).unwrap();
                    store.set("shared", format!("{}", i)).unwrap();
                }
            })
        })
        .collect();
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for _ in 0..200 {
                    // every read sees a complete value
                    let v = store.get("shared").unwrap();
                    let n: u32 = std::str::from_utf8(&v).unwrap().parse().unwrap();
                    assert!(n < 50);
                }
            })
        })
        .collect();
    for h in writers.into_iter().chain(readers) {
        h.join().unwrap();
    }
    assert_eq!(store.state().unwrap().entries, 4 * 50 + 1);
}

// ---------------------------------------------------------------------------
// Transaction log and archives
// ---------------------------------------------------------------------------

#[test]
fn test_tx_log_with_pool_replays() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("tx.log");
    let (store, _sdir) = test_store();
    store.set_tx_thread_pool(3).unwrap();
    store
        .begin_tx(&log, &TxOptions { prefix: b"app".to_vec(), params: b"v1".to_vec(), expire: None })
        .unwrap();
    assert_eq!(store.tx_log_path().unwrap().as_deref(), Some(log.as_path()));

    for i in 0..40u32 {
        store.set(format!("k{}", i % 10), i.to_le_bytes()).unwrap();
    }
    store.set_subkeys("k0", &["k1", "k2"]).unwrap();
    store.add_attr("k1", "tag", "t").unwrap();
    store.rename("k9", "k10").unwrap();
    store.remove("k8", &RemoveMode::ValueOnly).unwrap();
    let summary = store.stop_tx().unwrap().unwrap();
    assert_eq!(summary.written, 44);
    assert!(store.tx_log_path().unwrap().is_none());

    let replica = Store::open_memory(Config::small()).unwrap();
    let report = replica.replay_tx_log(&log, false).unwrap();
    assert_eq!(report.entries, 44);
    for i in 0..8u32 {
        assert_eq!(replica.get(format!("k{}", i)).unwrap(), store.get(format!("k{}", i)).unwrap());
    }
    assert!(replica.get("k8").is_err());
    assert!(replica.get("k9").is_err());
    assert_eq!(replica.get("k10").unwrap(), 39u32.to_le_bytes());
    assert_eq!(replica.get_subkeys("k0").unwrap(), vec![b"k1".to_vec(), b"k2".to_vec()]);
    assert_eq!(replica.get_attrs("k1").unwrap(), store.get_attrs("k1").unwrap());
}

struct ReversedMurmur;

impl KeyHasher for ReversedMurmur {
    fn name(&self) -> &str {
        "rev-murmur3"
    }
    fn hash(&self, key: &[u8]) -> u64 {
        keyhive_core::hash::hash_key(key).swap_bytes()
    }
}

#[derive(Default)]
struct CollectingSink {
    chunks: parking_lot::Mutex<Vec<Vec<u8>>>,
}

impl TxSink for CollectingSink {
    fn append(&self, chunk: &[u8]) -> StoreResult<()> {
        self.chunks.lock().push(chunk.to_vec());
        Ok(())
    }
}

#[test]
fn test_plugin_hasher_and_tx_sink() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.khs");
    let sink = Arc::new(CollectingSink::default());
    let registry = Arc::new(PluginRegistry::new());
    registry.register_hasher("/plugins/hash.so", Arc::new(ReversedMurmur));
    registry.register_tx_sink("/plugins/tx.so", sink.clone());

    let hasher = registry.load_hasher(std::path::Path::new("/plugins/hash.so")).unwrap();
    let store = Store::open_with_hasher(&path, Config::small(), hasher.clone()).unwrap();
    store.set_plugin_loader(registry.clone()).unwrap();
    store.begin_tx_plugin("/plugins/tx.so", &TxOptions::default()).unwrap();
    assert_eq!(
        store.tx_log_path().unwrap().as_deref(),
        Some(std::path::Path::new("/plugins/tx.so"))
    );
    store.set("a", "1").unwrap();
    store.set("b", "2").unwrap();
    store.remove("a", &RemoveMode::ValueOnly).unwrap();
    assert_eq!(store.stop_tx().unwrap().unwrap().written, 3);
    assert_eq!(sink.chunks.lock().len(), 3);
    assert_eq!(store.state().unwrap().hash_function, "rev-murmur3");
    store.close(Duration::from_secs(1)).unwrap();

    let err = Store::open(&path, Config::small()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    let store = Store::open_with_hasher(&path, Config::small(), hasher).unwrap();
    assert_eq!(store.get("b").unwrap(), b"2");

    assert!(matches!(
        store.begin_tx_plugin("/plugins/missing.so", &TxOptions::default()),
        Err(StoreError::Config(_))
    ));
}

#[test]
fn test_archive_roundtrip_into_fresh_store() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("dump.ark");
    let (store, _sdir) = test_store();
    store.set("a", "1").unwrap();
    store.set_subkeys("a", &["z", "b", "m"]).unwrap();
    store.add_attr("a", "color", "red").unwrap();
    store.set_with("secret", "s", &WriteOptions::with_password("pw")).unwrap();
    store.set_with("gone", "x", &expired()).unwrap();

    let report = store.dump_to_file(&archive, false).unwrap();
    assert_eq!(report.entries, 2);
    assert_eq!(report.skipped, 0);

    let fresh = Store::open(dir.path().join("fresh.khs"), Config::small()).unwrap();
    fresh.load_from_file(&archive, false).unwrap();
    assert_eq!(fresh.get("a").unwrap(), b"1");
    assert_eq!(fresh.get_subkeys("a").unwrap(), vec![b"z".to_vec(), b"b".to_vec(), b"m".to_vec()]);
    assert_eq!(fresh.get_attrs("a").unwrap(), store.get_attrs("a").unwrap());
    assert_eq!(fresh.get_with("secret", &ReadOptions::with_password("pw")).unwrap(), b"s");
    assert!(fresh.get("gone").is_err());
}

#[test]
fn test_cancelled_load_reports_progress() {
    let dir = TempDir::new().unwrap();
    let archive = dir.path().join("dump.ark");
    let (store, _sdir) = test_store();
    store.set("a", "1").unwrap();
    store.dump_to_file(&archive, false).unwrap();

    let cancel = keyhive_core::CancelFlag::new();
    cancel.cancel();
    let fresh = Store::open_memory(Config::small()).unwrap();
    let err = fresh.load_from_file_with_cancel(&archive, false, &cancel).unwrap_err();
    assert!(matches!(err, StoreError::Cancelled { completed: 0 }));
    assert!(fresh.get("a").is_err());
}

// ---------------------------------------------------------------------------
// Close semantics
// ---------------------------------------------------------------------------

#[test]
fn test_close_refused_with_live_queue() {
    let (store, _dir) = test_store();
    let q = store.acquire_queue(QueueOptions::default()).unwrap();
    let err = store.close(Duration::ZERO).unwrap_err();
    assert!(matches!(err, StoreError::ResourceInUse { count: 1, .. }));
    // still usable
    q.push(b"x").unwrap();
    q.release();
    let report = store.close(Duration::from_millis(10)).unwrap();
    assert!(!report.timed_out);
    assert!(matches!(store.get("x"), Err(StoreError::InvalidHandle(_))));
}

#[test]
fn test_close_drains_tx_log() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("tx.log");
    let (store, _sdir) = test_store();
    store.set_tx_thread_pool(2).unwrap();
    store.begin_tx(&log, &TxOptions::default()).unwrap();
    for i in 0..20u32 {
        store.set(format!("k{}", i), "v").unwrap();
    }
    let report = store.close(Duration::ZERO).unwrap();
    assert_eq!(report.tx.map(|s| s.written), Some(20));
}

#[test]
fn test_remove_on_close_deletes_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("scratch.khs");
    let mut config = Config::small();
    config.remove_on_close = true;
    let store = Store::open(&path, config).unwrap();
    store.set("k", "v").unwrap();
    assert!(path.exists());
    store.close(Duration::ZERO).unwrap();
    assert!(!path.exists());
}

#[test]
fn test_invalid_config_rejected() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::small();
    config.mask_bits = 0;
    let err = Store::open(dir.path().join("bad.khs"), config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(!dir.path().join("bad.khs").exists());
}
