//! Archive dump/load and transaction log replay
//!
//! An archive is a chunk file: one `ArchiveHeader` chunk, then one
//! `ArchiveEntry` chunk per entry holding the entry body in stored form
//! (encrypted values stay encrypted).
//!
//! Header payload:
//!   version u32 | created secs u64 | page_size u32 | mask_bits u8
//!   | collision_mask_bits u8 | max_elements u32 | entry count u64

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::config::CancelFlag;
use crate::engine::Engine;
use crate::error::{StoreError, StoreResult};
use crate::format::{encode_chunk, scan_chunks, ChunkType, PayloadReader};
use crate::platform_durability::{durable_sync, durable_sync_dir};
use crate::record::{printable, unix_secs, Entry};
use crate::txlog::{read_log, TxOp, TxRecord};

pub const ARCHIVE_VERSION: u32 = 1;

/// Outcome of an archive dump, archive load or log replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    /// Entries written (dump) or applied (load, replay)
    pub entries: usize,
    /// Entries or damaged regions passed over with `ignore_errors`
    pub skipped: usize,
}

fn cancelled(cancel: Option<&CancelFlag>) -> bool {
    cancel.is_some_and(CancelFlag::is_cancelled)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

impl Engine {
    /// Write every live entry to an archive at `path`. The archive is built
    /// in a temporary file and renamed into place, so a failed or cancelled
    /// dump leaves any previous archive untouched.
    pub(crate) fn dump_to_file(
        &self,
        path: &Path,
        ignore_errors: bool,
        cancel: Option<&CancelFlag>,
    ) -> StoreResult<ArchiveReport> {
        let _op = self.enter()?;
        let tmp = temp_path(path);
        let result = self.write_archive(&tmp, ignore_errors, cancel);
        let report = match result {
            Ok(report) => report,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
        };

        fs::rename(&tmp, path).map_err(|e| StoreError::io_at(path, &e, "failed to rename archive into place"))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            durable_sync_dir(parent)
                .map_err(|e| StoreError::io_at(parent, &e, "failed to sync directory after archive dump"))?;
        }
        tracing::info!(path = %path.display(), entries = report.entries, skipped = report.skipped, "archive written");
        Ok(report)
    }

    fn write_archive(
        &self,
        tmp: &Path,
        ignore_errors: bool,
        cancel: Option<&CancelFlag>,
    ) -> StoreResult<ArchiveReport> {
        let mut file: File = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(tmp)
            .map_err(|e| StoreError::io_at(tmp, &e, "failed to create archive"))?;

        let keys = self.keys();
        let state = self.state();
        let mut header = Vec::with_capacity(34);
        header.extend_from_slice(&ARCHIVE_VERSION.to_le_bytes());
        header.extend_from_slice(&unix_secs(SystemTime::now()).to_le_bytes());
        header.extend_from_slice(&(state.page_size as u32).to_le_bytes());
        header.push(state.mask_bits);
        header.push(state.collision_mask_bits);
        header.extend_from_slice(&(state.max_elements as u32).to_le_bytes());
        header.extend_from_slice(&(keys.len() as u64).to_le_bytes());
        let chunk = encode_chunk(ChunkType::ArchiveHeader, &header)?;
        file.write_all(&chunk).map_err(|e| StoreError::io_at(tmp, &e, "failed to write archive header"))?;

        let now = unix_secs(SystemTime::now());
        let mut report = ArchiveReport::default();
        for key in keys {
            if cancelled(cancel) {
                return Err(StoreError::Cancelled { completed: report.entries });
            }
            let entry = match self.load(&key) {
                Ok(Some((entry, _))) => entry,
                // removed since the key list was taken
                Ok(None) => continue,
                Err(e) if ignore_errors => {
                    tracing::warn!(key = %printable(&key), error = %e, "skipping unreadable entry in dump");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if entry.is_expired(now) {
                continue;
            }
            let chunk = encode_chunk(ChunkType::ArchiveEntry, &entry.encode_body());
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) if ignore_errors => {
                    tracing::warn!(key = %printable(&key), error = %e, "skipping oversized entry in dump");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            file.write_all(&chunk).map_err(|e| StoreError::io_at(tmp, &e, "failed to write archive entry"))?;
            report.entries += 1;
        }

        durable_sync(&file).map_err(|e| StoreError::io_at(tmp, &e, "failed to sync archive"))?;
        Ok(report)
    }

    /// Store every entry of the archive at `path`, overwriting keys that
    /// already exist. Entries already applied stay applied on failure or
    /// cancellation. `ignore_errors` skips damaged chunks and entries the
    /// store rejects; I/O errors always abort the load.
    pub(crate) fn load_from_file(
        &self,
        path: &Path,
        ignore_errors: bool,
        cancel: Option<&CancelFlag>,
    ) -> StoreResult<ArchiveReport> {
        let _op = self.enter()?;
        self.check_writable()?;
        let buf = fs::read(path).map_err(|e| StoreError::io_at(path, &e, "failed to read archive"))?;
        let outcome = scan_chunks(&buf, path);

        let mut report = ArchiveReport::default();
        if let Some(e) = outcome.errors.first() {
            if !ignore_errors {
                return Err(e.clone());
            }
            report.skipped += outcome.errors.len();
        }

        let mut chunks = outcome.chunks.into_iter();
        match chunks.next() {
            Some(c) if c.chunk_type == ChunkType::ArchiveHeader => {
                let version = PayloadReader::new(&c.payload).u32()?;
                if version != ARCHIVE_VERSION {
                    return Err(StoreError::Corrupt {
                        path: Some(path.to_path_buf()),
                        offset: c.offset,
                        reason: format!("unsupported archive version {}", version),
                    });
                }
            }
            _ => {
                return Err(StoreError::Corrupt {
                    path: Some(path.to_path_buf()),
                    offset: 0,
                    reason: "archive header missing".into(),
                })
            }
        }

        let now = unix_secs(SystemTime::now());
        for chunk in chunks {
            if cancelled(cancel) {
                return Err(StoreError::Cancelled { completed: report.entries });
            }
            let decoded = if chunk.chunk_type == ChunkType::ArchiveEntry {
                Entry::decode_body(&chunk.payload)
            } else {
                Err(StoreError::Corrupt {
                    path: Some(path.to_path_buf()),
                    offset: chunk.offset,
                    reason: format!("{:?} chunk inside archive", chunk.chunk_type),
                })
            };
            let entry = match decoded {
                Ok(entry) => entry,
                Err(e) if ignore_errors => {
                    tracing::warn!(offset = chunk.offset, error = %e, "skipping undecodable archive entry");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            if entry.is_expired(now) {
                continue;
            }

            let _w = self.writer.lock();
            let stored = self
                .store_entry(&entry)
                .and_then(|_| self.log_tx(TxOp::SetValue, &entry.key, b"", Some(&entry)));
            match stored {
                Ok(()) => report.entries += 1,
                Err(e) if ignore_errors && !matches!(e, StoreError::Io { .. }) => {
                    tracing::warn!(key = %printable(&entry.key), error = %e, "skipping archive entry");
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!(path = %path.display(), entries = report.entries, skipped = report.skipped, "archive loaded");
        Ok(report)
    }

    /// Apply the records of a transaction log in sequence order. Applied
    /// records are not logged again.
    pub(crate) fn replay_tx_log(&self, path: &Path, ignore_errors: bool) -> StoreResult<ArchiveReport> {
        let _op = self.enter()?;
        self.check_writable()?;
        let replay = read_log(path, ignore_errors)?;
        let mut report = ArchiveReport { entries: 0, skipped: replay.skipped };

        let _w = self.writer.lock();
        for record in &replay.records {
            match self.apply_tx_record(record) {
                Ok(()) => report.entries += 1,
                Err(e) if ignore_errors => {
                    tracing::warn!(seq = record.seq, key = %printable(&record.key), error = %e, "skipping transaction record");
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!(
            path = %path.display(),
            applied = report.entries,
            skipped = report.skipped,
            expired = replay.expired,
            "transaction log replayed"
        );
        Ok(report)
    }

    /// Caller holds the writer lock.
    fn apply_tx_record(&self, record: &TxRecord) -> StoreResult<()> {
        match record.op {
            TxOp::Remove => {
                self.delete_entry(&record.key)?;
            }
            TxOp::SetValue | TxOp::SetSubkeys | TxOp::AddAttr | TxOp::Rename => {
                let entry = Entry::decode_body(&record.snapshot)?;
                if entry.key != record.key {
                    return Err(StoreError::Corrupt {
                        path: None,
                        offset: record.seq,
                        reason: format!(
                            "record for {} carries a snapshot of {}",
                            printable(&record.key),
                            printable(&entry.key)
                        ),
                    });
                }
                if record.op == TxOp::Rename {
                    self.move_entry(&entry, &record.aux)?;
                } else {
                    self.store_entry(&entry)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ReadOptions, TxOptions, WriteOptions};
    use tempfile::TempDir;

    fn engine() -> Engine {
        Engine::open_memory(Config::small()).unwrap()
    }

    fn fill(e: &Engine) {
        e.set(b"alpha", b"1", &WriteOptions::default()).unwrap();
        e.set(b"beta", b"2", &WriteOptions::with_password("pw")).unwrap();
        e.add_subkey(b"alpha", b"alpha/child", b"c", &WriteOptions::default()).unwrap();
        e.add_attr(b"alpha", b"color", b"blue").unwrap();
    }

    #[test]
    fn test_dump_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.ark");
        let src = engine();
        fill(&src);
        let report = src.dump_to_file(&path, false, None).unwrap();
        assert_eq!(report, ArchiveReport { entries: 3, skipped: 0 });
        assert!(!temp_path(&path).exists());

        let dst = engine();
        assert_eq!(dst.load_from_file(&path, false, None).unwrap().entries, 3);
        assert_eq!(dst.get(b"alpha", &ReadOptions::default()).unwrap(), b"1");
        assert_eq!(dst.get(b"beta", &ReadOptions::with_password("pw")).unwrap(), b"2");
        assert_eq!(dst.get_subkeys(b"alpha").unwrap(), vec![b"alpha/child".to_vec()]);
        assert_eq!(dst.get_attrs(b"alpha").unwrap(), src.get_attrs(b"alpha").unwrap());
    }

    #[test]
    fn test_load_requires_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.ark");
        let body = Entry::new(b"k").encode_body();
        fs::write(&path, encode_chunk(ChunkType::ArchiveEntry, &body).unwrap()).unwrap();
        assert!(matches!(engine().load_from_file(&path, true, None), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_damaged_entry_skipped_with_ignore_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.ark");
        let src = engine();
        fill(&src);
        src.dump_to_file(&path, false, None).unwrap();

        // flip one payload byte of the last chunk
        let mut buf = fs::read(&path).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        fs::write(&path, &buf).unwrap();

        assert!(engine().load_from_file(&path, false, None).is_err());
        let report = engine().load_from_file(&path, true, None).unwrap();
        assert_eq!(report, ArchiveReport { entries: 2, skipped: 1 });
    }

    #[test]
    fn test_io_error_aborts_load_despite_ignore_errors() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent.ark");
        assert!(matches!(engine().load_from_file(&missing, true, None), Err(StoreError::Io { .. })));
    }

    #[test]
    fn test_cancelled_dump_keeps_previous_archive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.ark");
        let src = engine();
        fill(&src);
        src.dump_to_file(&path, false, None).unwrap();
        let before = fs::read(&path).unwrap();

        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = src.dump_to_file(&path, false, Some(&cancel)).unwrap_err();
        assert!(matches!(err, StoreError::Cancelled { completed: 0 }));
        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_replay_rebuilds_state() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("tx.log");
        let src = engine();
        src.begin_tx(&log, &TxOptions::default()).unwrap();
        src.set(b"a", b"1", &WriteOptions::default()).unwrap();
        src.set(b"b", b"2", &WriteOptions::default()).unwrap();
        src.rename(b"a", b"c").unwrap();
        src.remove(b"b", &crate::kv::RemoveMode::ValueOnly).unwrap();
        src.stop_tx().unwrap();

        let dst = engine();
        let report = dst.replay_tx_log(&log, false).unwrap();
        assert_eq!(report, ArchiveReport { entries: 4, skipped: 0 });
        assert_eq!(dst.keys(), vec![b"c".to_vec()]);
        assert_eq!(dst.get(b"c", &ReadOptions::default()).unwrap(), b"1");
    }
}
