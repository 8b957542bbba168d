//! Keyhive Core: embeddable file-backed key-value engine
//!
//! One store is one file of fixed-size pages. Each entry holds a value, an
//! ordered list of subkeys and a set of attributes, and lives in a page
//! chain indexed by an in-memory masked-hash table rebuilt on open.
//!
//! # Architecture
//!
//! - **Pages**: superblock plus record chains; freed pages are reused
//! - **Hash table**: masked primary buckets with collision sub-buckets,
//!   grown one mask bit at a time
//! - **Attributes**: mtime, history, AES-256-GCM encryption, expiration
//!   and plugin handlers layered over every value write and read
//! - **Queues**: FIFO/LIFO chains of hidden keys under a prefix
//! - **Transaction log**: every mutation appended to a chunk log, written
//!   inline or by a worker pool, and replayable into any store
//! - **Archives**: whole-store dump and load

pub mod archive;
pub mod attr;
pub mod config;
pub mod debug;
pub mod engine;
pub mod error;
pub mod format;
pub mod hash;
pub mod kv;
pub mod page;
pub mod platform_durability;
pub mod queue;
pub mod record;
pub mod store;
pub mod table;
pub mod txlog;

// Re-export key types for convenience
pub use archive::ArchiveReport;
pub use attr::{AttrContext, AttrHandler, AttrInfo, PluginLoader, PluginRegistry};
pub use config::{CancelFlag, Config, Expire, QueueOptions, ReadOptions, TxOptions, WriteOptions};
pub use debug::DebugLevel;
pub use engine::{CloseReport, StoreState};
pub use error::{ErrorKind, StoreError, StoreResult};
pub use hash::{KeyHasher, Murmur3};
pub use kv::RemoveMode;
pub use queue::Queue;
pub use record::Entry;
pub use store::Store;
pub use txlog::{TxSink, TxSummary};
