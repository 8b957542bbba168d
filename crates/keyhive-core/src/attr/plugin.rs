//! Plugins resolved by reference
//!
//! A `PluginLoader` turns a path into an [`AttrHandler`], a [`KeyHasher`]
//! for the bucket table, or a [`TxSink`] that receives transaction records.
//! Loading happens once, when the plugin is attached; a failure there is a
//! configuration error and never surfaces on reads or writes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use super::AttrHandler;
use crate::error::{StoreError, StoreResult};
use crate::hash::KeyHasher;
use crate::txlog::TxSink;

/// Resolves plugin references. Loaders that only provide attribute
/// handlers keep the default hasher and sink methods, which refuse.
pub trait PluginLoader: Send + Sync {
    fn load(&self, path: &Path) -> StoreResult<Arc<dyn AttrHandler>>;

    fn load_hasher(&self, path: &Path) -> StoreResult<Arc<dyn KeyHasher>> {
        Err(StoreError::Config(format!("loader provides no hash function at {}", path.display())))
    }

    fn load_tx_sink(&self, path: &Path) -> StoreResult<Arc<dyn TxSink>> {
        Err(StoreError::Config(format!("loader provides no transaction sink at {}", path.display())))
    }
}

/// In-process loader: plugins are registered under the path callers later
/// pass to `Store::add_attr_plugin`, `Store::begin_tx_plugin` or
/// [`PluginLoader::load_hasher`].
#[derive(Default)]
pub struct PluginRegistry {
    handlers: RwLock<HashMap<PathBuf, Arc<dyn AttrHandler>>>,
    hashers: RwLock<HashMap<PathBuf, Arc<dyn KeyHasher>>>,
    sinks: RwLock<HashMap<PathBuf, Arc<dyn TxSink>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: impl Into<PathBuf>, handler: Arc<dyn AttrHandler>) {
        self.handlers.write().insert(path.into(), handler);
    }

    pub fn register_hasher(&self, path: impl Into<PathBuf>, hasher: Arc<dyn KeyHasher>) {
        self.hashers.write().insert(path.into(), hasher);
    }

    pub fn register_tx_sink(&self, path: impl Into<PathBuf>, sink: Arc<dyn TxSink>) {
        self.sinks.write().insert(path.into(), sink);
    }

    /// Registered plugins of every kind.
    pub fn len(&self) -> usize {
        self.handlers.read().len() + self.hashers.read().len() + self.sinks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PluginLoader for PluginRegistry {
    fn load(&self, path: &Path) -> StoreResult<Arc<dyn AttrHandler>> {
        self.handlers
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::Config(format!("no attribute plugin registered at {}", path.display())))
    }

    fn load_hasher(&self, path: &Path) -> StoreResult<Arc<dyn KeyHasher>> {
        self.hashers
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::Config(format!("no hash function registered at {}", path.display())))
    }

    fn load_tx_sink(&self, path: &Path) -> StoreResult<Arc<dyn TxSink>> {
        self.sinks
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::Config(format!("no transaction sink registered at {}", path.display())))
    }
}
