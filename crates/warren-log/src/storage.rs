//! Durable log storage.
//!
//! # File layout
//!
//! ```text
//! {data_dir}/
//! ├── log/
//! │   ├── wal.log      <- append-only length-prefixed entries
//! │   └── meta.bin     <- view + commit point
//! └── snapshots/
//!     └── snapshot.bin <- latest FSM snapshot (base op + bytes)
//! ```
//!
//! Appends are fsynced before the caller proceeds; a `PrepareOk` never
//! leaves this node for an entry that is not durable. Rewrites (view
//! change, compaction) and snapshot installs go through temp-file + atomic
//! rename, so a crash mid-write leaves the previous file intact. A
//! truncated tail record on load is discarded: it was never acked.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{LogEntry, OpNumber, ViewNumber};

const WAL_FILE: &str = "wal.log";
const META_FILE: &str = "meta.bin";
const SNAPSHOT_FILE: &str = "snapshot.bin";

/// Durable metadata beside the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LogMeta {
    pub view: ViewNumber,
    pub commit: OpNumber,
}

/// A persisted FSM snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    /// Op number covered by the snapshot.
    pub base: OpNumber,
    pub bytes: Vec<u8>,
}

/// The on-disk log: wal, metadata, snapshot.
#[derive(Debug)]
pub struct LogStore {
    log_dir: PathBuf,
    snapshot_dir: PathBuf,
    wal: File,
}

impl LogStore {
    /// Opens (or creates) the log under `data_dir`.
    pub fn open(data_dir: &Path) -> std::io::Result<Self> {
        let log_dir = data_dir.join("log");
        let snapshot_dir = data_dir.join("snapshots");
        fs::create_dir_all(&log_dir)?;
        fs::create_dir_all(&snapshot_dir)?;

        let wal = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(log_dir.join(WAL_FILE))?;

        Ok(Self {
            log_dir,
            snapshot_dir,
            wal,
        })
    }

    /// Appends entries and fsyncs before returning.
    pub fn append(&mut self, entries: &[LogEntry]) -> std::io::Result<()> {
        for entry in entries {
            let bytes = postcard::to_allocvec(entry).map_err(std::io::Error::other)?;
            let len = u32::try_from(bytes.len()).map_err(std::io::Error::other)?;
            self.wal.write_all(&len.to_le_bytes())?;
            self.wal.write_all(&bytes)?;
        }
        self.wal.sync_all()
    }

    /// Replaces the wal contents wholesale (view change or compaction).
    pub fn rewrite(&mut self, entries: &[LogEntry]) -> std::io::Result<()> {
        let path = self.log_dir.join(WAL_FILE);
        let tmp = self.log_dir.join(format!("{WAL_FILE}.tmp"));
        {
            let mut file = File::create(&tmp)?;
            for entry in entries {
                let bytes = postcard::to_allocvec(entry).map_err(std::io::Error::other)?;
                let len = u32::try_from(bytes.len()).map_err(std::io::Error::other)?;
                file.write_all(&len.to_le_bytes())?;
                file.write_all(&bytes)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        self.wal = OpenOptions::new().append(true).read(true).open(&path)?;
        Ok(())
    }

    /// Loads every complete entry from the wal.
    ///
    /// A truncated tail (torn write at crash) is silently dropped.
    pub fn load_entries(&self) -> std::io::Result<Vec<LogEntry>> {
        let mut file = File::open(self.log_dir.join(WAL_FILE))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let mut entries = Vec::new();
        let mut cursor = 0usize;
        while cursor + 4 <= buf.len() {
            let len =
                u32::from_le_bytes(buf[cursor..cursor + 4].try_into().expect("4-byte slice"))
                    as usize;
            cursor += 4;
            if cursor + len > buf.len() {
                break;
            }
            match postcard::from_bytes::<LogEntry>(&buf[cursor..cursor + len]) {
                Ok(entry) => entries.push(entry),
                Err(_) => break,
            }
            cursor += len;
        }
        Ok(entries)
    }

    /// Persists view and commit metadata atomically.
    pub fn save_meta(&self, meta: &LogMeta) -> std::io::Result<()> {
        let bytes = postcard::to_allocvec(meta).map_err(std::io::Error::other)?;
        atomic_write(&self.log_dir.join(META_FILE), &bytes)
    }

    /// Loads metadata; defaults on first boot.
    pub fn load_meta(&self) -> std::io::Result<LogMeta> {
        match fs::read(self.log_dir.join(META_FILE)) {
            Ok(bytes) => postcard::from_bytes(&bytes).map_err(std::io::Error::other),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(LogMeta::default()),
            Err(e) => Err(e),
        }
    }

    /// Persists a snapshot atomically.
    pub fn save_snapshot(&self, snapshot: &SnapshotFile) -> std::io::Result<()> {
        let bytes = postcard::to_allocvec(snapshot).map_err(std::io::Error::other)?;
        atomic_write(&self.snapshot_dir.join(SNAPSHOT_FILE), &bytes)
    }

    /// Loads the latest snapshot, if one exists.
    pub fn load_snapshot(&self) -> std::io::Result<Option<SnapshotFile>> {
        match fs::read(self.snapshot_dir.join(SNAPSHOT_FILE)) {
            Ok(bytes) => postcard::from_bytes(&bytes)
                .map(Some)
                .map_err(std::io::Error::other),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use warren_fsm::Command;
    use warren_types::{Member, RequestId};

    fn entry(op: u64) -> LogEntry {
        LogEntry {
            op: OpNumber::new(op),
            view: ViewNumber::ZERO,
            command: Command::AddVoter {
                request_id: RequestId::new(format!("r{op}")),
                member: Member {
                    id: op as u8,
                    address: format!("10.0.0.{op}:7700"),
                    rpc_address: format!("10.0.0.{op}:7421"),
                },
            },
        }
    }

    #[test]
    fn append_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(dir.path()).unwrap();
        store.append(&[entry(1), entry(2)]).unwrap();
        store.append(&[entry(3)]).unwrap();

        let loaded = store.load_entries().unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[2].op, OpNumber::new(3));
    }

    #[test]
    fn rewrite_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(dir.path()).unwrap();
        store.append(&[entry(1), entry(2), entry(3)]).unwrap();
        store.rewrite(&[entry(3)]).unwrap();

        let loaded = store.load_entries().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].op, OpNumber::new(3));

        // Appends keep working after a rewrite.
        store.append(&[entry(4)]).unwrap();
        assert_eq!(store.load_entries().unwrap().len(), 2);
    }

    #[test]
    fn truncated_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = LogStore::open(dir.path()).unwrap();
        store.append(&[entry(1)]).unwrap();

        // Simulate a torn write: a length prefix with no body.
        let wal_path = dir.path().join("log").join(WAL_FILE);
        let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
        file.write_all(&99u32.to_le_bytes()).unwrap();
        drop(file);

        let loaded = store.load_entries().unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn meta_round_trip_and_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path()).unwrap();
        assert_eq!(store.load_meta().unwrap(), LogMeta::default());

        let meta = LogMeta {
            view: ViewNumber::new(3),
            commit: OpNumber::new(17),
        };
        store.save_meta(&meta).unwrap();
        assert_eq!(store.load_meta().unwrap(), meta);
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::open(dir.path()).unwrap();
        assert!(store.load_snapshot().unwrap().is_none());

        let snapshot = SnapshotFile {
            base: OpNumber::new(4096),
            bytes: vec![1, 2, 3],
        };
        store.save_snapshot(&snapshot).unwrap();
        assert_eq!(store.load_snapshot().unwrap(), Some(snapshot));
    }
}
