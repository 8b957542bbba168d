//! Public store handle

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::archive::ArchiveReport;
use crate::attr::{AttrInfo, PluginLoader};
use crate::config::{CancelFlag, Config, QueueOptions, ReadOptions, TxOptions, WriteOptions};
use crate::engine::{CloseReport, Engine, StoreState};
use crate::error::{StoreError, StoreResult};
use crate::hash::KeyHasher;
use crate::kv::RemoveMode;
use crate::queue::Queue;
use crate::txlog::TxSummary;

/// Owned handle to one store.
///
/// All methods take `&self`; share a store between threads with `Arc`.
/// After [`Store::close`] every call fails with `InvalidHandle`. Dropping
/// an open store closes it, waiting up to `Config::close_wait`.
///
/// ```no_run
/// use keyhive_core::{Config, ReadOptions, Store};
///
/// let store = Store::open("/tmp/example.khs", Config::default())?;
/// store.set("greeting", "hello")?;
/// assert_eq!(store.get_string("greeting", &ReadOptions::default())?, "hello");
/// store.close(std::time::Duration::from_secs(1))?;
/// # Ok::<(), keyhive_core::StoreError>(())
/// ```
pub struct Store {
    engine: Arc<Engine>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.engine.path()).finish()
    }
}

impl Store {
    /// Open the store at `path`, creating it when missing.
    pub fn open(path: impl AsRef<Path>, config: Config) -> StoreResult<Self> {
        let engine = Engine::open_file(path.as_ref(), config, false)?;
        Ok(Self { engine: Arc::new(engine) })
    }

    /// Create a new store at `path`; an existing file is an error.
    pub fn create(path: impl AsRef<Path>, config: Config) -> StoreResult<Self> {
        if config.read_only {
            return Err(StoreError::Config("cannot create a store read-only".into()));
        }
        let engine = Engine::open_file(path.as_ref(), config, true)?;
        Ok(Self { engine: Arc::new(engine) })
    }

    /// Store backed by anonymous memory.
    pub fn open_memory(config: Config) -> StoreResult<Self> {
        Ok(Self { engine: Arc::new(Engine::open_memory(config)?) })
    }

    /// [`Store::open`] with the key table hashed by `hasher` instead of the
    /// built-in murmur3. The hasher's name is recorded when the store is
    /// created; reopening under a differently named hasher fails `Config`.
    /// Plugin hashers come from [`PluginLoader::load_hasher`].
    pub fn open_with_hasher(path: impl AsRef<Path>, config: Config, hasher: Arc<dyn KeyHasher>) -> StoreResult<Self> {
        let engine = Engine::open_file_with(path.as_ref(), config, false, hasher)?;
        Ok(Self { engine: Arc::new(engine) })
    }

    pub fn open_memory_with_hasher(config: Config, hasher: Arc<dyn KeyHasher>) -> StoreResult<Self> {
        Ok(Self { engine: Arc::new(Engine::open_memory_with(config, hasher)?) })
    }

    pub fn path(&self) -> Option<&Path> {
        self.engine.path()
    }

    pub fn config(&self) -> &Config {
        self.engine.config()
    }

    /// Close the handle. See [`CloseReport`] for what a late close looks like.
    pub fn close(&self, wait: Duration) -> StoreResult<CloseReport> {
        self.engine.close(wait)
    }

    pub fn is_closed(&self) -> bool {
        self.engine.is_closed()
    }

    pub fn sync(&self) -> StoreResult<()> {
        let _op = self.engine.enter()?;
        self.engine.sync()
    }

    pub fn state(&self) -> StoreResult<StoreState> {
        let _op = self.engine.enter()?;
        Ok(self.engine.state())
    }

    pub fn dump_key_table(&self, w: &mut dyn io::Write) -> StoreResult<()> {
        let _op = self.engine.enter()?;
        self.engine.dump_key_table(w).map_err(StoreError::from)
    }

    // ---- values ----

    pub fn get(&self, key: impl AsRef<[u8]>) -> StoreResult<Vec<u8>> {
        self.engine.get(key.as_ref(), &ReadOptions::default())
    }

    pub fn get_with(&self, key: impl AsRef<[u8]>, opts: &ReadOptions) -> StoreResult<Vec<u8>> {
        self.engine.get(key.as_ref(), opts)
    }

    /// Value decoded as UTF-8.
    pub fn get_string(&self, key: impl AsRef<[u8]>, opts: &ReadOptions) -> StoreResult<String> {
        let value = self.engine.get(key.as_ref(), opts)?;
        String::from_utf8(value).map_err(|_| StoreError::InvalidArgument("value is not valid UTF-8".into()))
    }

    pub fn set(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> StoreResult<()> {
        self.engine.set(key.as_ref(), value.as_ref(), &WriteOptions::default())
    }

    pub fn set_with(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>, opts: &WriteOptions) -> StoreResult<()> {
        self.engine.set(key.as_ref(), value.as_ref(), opts)
    }

    pub fn remove(&self, key: impl AsRef<[u8]>, mode: &RemoveMode) -> StoreResult<()> {
        self.engine.remove(key.as_ref(), mode)
    }

    /// Move an entry to a new key. Readers see the entry under one of the
    /// two keys at every point.
    pub fn rename(&self, old: impl AsRef<[u8]>, new: impl AsRef<[u8]>) -> StoreResult<()> {
        self.engine.rename(old.as_ref(), new.as_ref())
    }

    // ---- subkeys ----

    /// Replace the whole subkey list of `key`.
    pub fn set_subkeys<K: AsRef<[u8]>>(&self, key: impl AsRef<[u8]>, subkeys: &[K]) -> StoreResult<()> {
        let subkeys: Vec<Vec<u8>> = subkeys.iter().map(|s| s.as_ref().to_vec()).collect();
        self.engine.set_subkeys(key.as_ref(), &subkeys)
    }

    /// Write `sub` with `value` and append it to the subkey list of `key`.
    pub fn add_subkey(&self, key: impl AsRef<[u8]>, sub: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> StoreResult<()> {
        self.engine.add_subkey(key.as_ref(), sub.as_ref(), value.as_ref(), &WriteOptions::default())
    }

    pub fn add_subkey_with(
        &self,
        key: impl AsRef<[u8]>,
        sub: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
        opts: &WriteOptions,
    ) -> StoreResult<()> {
        self.engine.add_subkey(key.as_ref(), sub.as_ref(), value.as_ref(), opts)
    }

    pub fn get_subkeys(&self, key: impl AsRef<[u8]>) -> StoreResult<Vec<Vec<u8>>> {
        self.engine.get_subkeys(key.as_ref())
    }

    /// Every key reachable from `key` through subkeys, depth first.
    pub fn walk_subkeys(&self, key: impl AsRef<[u8]>) -> StoreResult<Vec<Vec<u8>>> {
        self.engine.walk_subkeys(key.as_ref())
    }

    // ---- attributes ----

    pub fn add_attr(&self, key: impl AsRef<[u8]>, name: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> StoreResult<()> {
        self.engine.add_attr(key.as_ref(), name.as_ref(), value.as_ref())
    }

    pub fn get_attrs(&self, key: impl AsRef<[u8]>) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.engine.get_attrs(key.as_ref())
    }

    /// Previous values of `key`, newest first. Empty unless history was
    /// enabled when the key was overwritten.
    pub fn get_history(&self, key: impl AsRef<[u8]>, opts: &ReadOptions) -> StoreResult<Vec<Vec<u8>>> {
        self.engine.get_history(key.as_ref(), opts)
    }

    pub fn enable_mtime(&self, on: bool) -> StoreResult<()> {
        let _op = self.engine.enter()?;
        self.engine.attrs.write().enable_mtime(on);
        Ok(())
    }

    pub fn enable_history(&self, on: bool) -> StoreResult<()> {
        let _op = self.engine.enter()?;
        self.engine.attrs.write().enable_history(on);
        Ok(())
    }

    /// Turn value encryption on or off. `pass_file` loads passwords one per
    /// line; the first becomes the default.
    pub fn enable_encryption(&self, on: bool, pass_file: Option<&Path>) -> StoreResult<()> {
        let _op = self.engine.enter()?;
        self.engine.attrs.write().enable_encryption(on, pass_file)
    }

    /// Set the password used for writes without an explicit one. Also
    /// turns encryption on.
    pub fn set_default_encryption_password(&self, password: &str) -> StoreResult<()> {
        let _op = self.engine.enter()?;
        self.engine.attrs.write().set_default_password(password);
        Ok(())
    }

    pub fn add_decryption_password(&self, password: &str) -> StoreResult<()> {
        let _op = self.engine.enter()?;
        self.engine.attrs.write().add_decryption_password(password);
        Ok(())
    }

    /// Default lifetime of values written without an explicit expiration.
    pub fn set_expiration_duration(&self, duration: Option<Duration>) -> StoreResult<()> {
        let _op = self.engine.enter()?;
        self.engine.attrs.write().set_expiration_duration(duration)
    }

    pub fn set_plugin_loader(&self, loader: Arc<dyn PluginLoader>) -> StoreResult<()> {
        let _op = self.engine.enter()?;
        self.engine.attrs.write().set_plugin_loader(loader);
        Ok(())
    }

    pub fn add_attr_plugin(&self, path: impl AsRef<Path>) -> StoreResult<()> {
        let _op = self.engine.enter()?;
        self.engine.attrs.write().add_plugin(path.as_ref())
    }

    pub fn attr_information(&self) -> StoreResult<Vec<AttrInfo>> {
        let _op = self.engine.enter()?;
        Ok(self.engine.attrs.read().information())
    }

    // ---- queues ----

    /// Queue handle over keys under `options.prefix`. The store cannot be
    /// closed while handles are alive.
    pub fn acquire_queue(&self, options: QueueOptions) -> StoreResult<Queue> {
        Queue::acquire(Arc::clone(&self.engine), &options)
    }

    // ---- transaction log ----

    pub fn begin_tx(&self, path: impl AsRef<Path>, options: &TxOptions) -> StoreResult<()> {
        let _op = self.engine.enter()?;
        self.engine.begin_tx(path.as_ref(), options)?;
        tracing::info!(path = %path.as_ref().display(), threads = self.engine.tx_threads(), "transaction log attached");
        Ok(())
    }

    /// Attach a transaction sink resolved through the plugin loader in
    /// place of a log file. `reference` is what [`Store::tx_log_path`]
    /// reports while the sink is attached.
    pub fn begin_tx_plugin(&self, reference: impl AsRef<Path>, options: &TxOptions) -> StoreResult<()> {
        let _op = self.engine.enter()?;
        let sink = self.engine.attrs.read().load_tx_sink(reference.as_ref())?;
        self.engine.begin_tx_sink(reference.as_ref(), sink, options)?;
        tracing::info!(sink = %reference.as_ref().display(), threads = self.engine.tx_threads(), "transaction sink attached");
        Ok(())
    }

    /// Detach the log once every pending record is written.
    pub fn stop_tx(&self) -> StoreResult<Option<TxSummary>> {
        let _op = self.engine.enter()?;
        self.engine.stop_tx()
    }

    pub fn tx_log_path(&self) -> StoreResult<Option<PathBuf>> {
        let _op = self.engine.enter()?;
        Ok(self.engine.tx_log_path())
    }

    /// Worker threads for the next `begin_tx`; 0 writes synchronously.
    pub fn set_tx_thread_pool(&self, threads: usize) -> StoreResult<()> {
        let _op = self.engine.enter()?;
        self.engine.set_tx_threads(threads)
    }

    pub fn tx_thread_pool(&self) -> usize {
        self.engine.tx_threads()
    }

    pub fn unset_tx_thread_pool(&self) -> StoreResult<()> {
        self.set_tx_thread_pool(0)
    }

    pub fn replay_tx_log(&self, path: impl AsRef<Path>, ignore_errors: bool) -> StoreResult<ArchiveReport> {
        self.engine.replay_tx_log(path.as_ref(), ignore_errors)
    }

    // ---- archives ----

    pub fn dump_to_file(&self, path: impl AsRef<Path>, ignore_errors: bool) -> StoreResult<ArchiveReport> {
        self.engine.dump_to_file(path.as_ref(), ignore_errors, None)
    }

    pub fn dump_to_file_with_cancel(
        &self,
        path: impl AsRef<Path>,
        ignore_errors: bool,
        cancel: &CancelFlag,
    ) -> StoreResult<ArchiveReport> {
        self.engine.dump_to_file(path.as_ref(), ignore_errors, Some(cancel))
    }

    /// Load an archive written by [`Store::dump_to_file`]. With
    /// `ignore_errors` damaged or rejected entries are skipped and counted,
    /// but an I/O error still aborts the load.
    pub fn load_from_file(&self, path: impl AsRef<Path>, ignore_errors: bool) -> StoreResult<ArchiveReport> {
        self.engine.load_from_file(path.as_ref(), ignore_errors, None)
    }

    pub fn load_from_file_with_cancel(
        &self,
        path: impl AsRef<Path>,
        ignore_errors: bool,
        cancel: &CancelFlag,
    ) -> StoreResult<ArchiveReport> {
        self.engine.load_from_file(path.as_ref(), ignore_errors, Some(cancel))
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if self.engine.is_closed() {
            return;
        }
        match self.engine.close(self.engine.config().close_wait) {
            Ok(report) if report.timed_out => {
                tracing::warn!(inflight = report.inflight, "store dropped with calls in flight");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "failed to close store on drop"),
        }
    }
}
