//! On-disk snapshot files
//!
//! One file per snapshot, named `<term>-<index>.snap` (zero-padded hex) so
//! lexical order matches log order. Each file is a bincode record carrying
//! a CRC32 of its payload. Writes go to a temp file that is fsynced and
//! renamed into place; only the newest `retain` files are kept.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const SNAPSHOT_EXT: &str = "snap";
const TMP_EXT: &str = "tmp";

/// A snapshot as persisted: Raft metadata plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub index: u64,
    pub term: u64,
    pub voters: Vec<u64>,
    pub learners: Vec<u64>,
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    index: u64,
    term: u64,
    voters: Vec<u64>,
    learners: Vec<u64>,
    checksum: u32,
    data: Vec<u8>,
}

pub struct SnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotStore {
    pub fn open(dir: impl Into<PathBuf>, retain: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| Error::SnapshotIo(format!("create {}: {}", dir.display(), e)))?;
        Ok(Self {
            dir,
            retain: retain.max(1),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist `snapshot` and prune older files.
    pub fn save(&self, snapshot: &StoredSnapshot) -> Result<PathBuf> {
        let name = format!("{:016x}-{:016x}", snapshot.term, snapshot.index);
        let path = self.dir.join(format!("{}.{}", name, SNAPSHOT_EXT));
        let tmp = self.dir.join(format!("{}.{}", name, TMP_EXT));

        let record = SnapshotFile {
            index: snapshot.index,
            term: snapshot.term,
            voters: snapshot.voters.clone(),
            learners: snapshot.learners.clone(),
            checksum: crc32fast::hash(&snapshot.data),
            data: snapshot.data.clone(),
        };
        let bytes = bincode::serialize(&record)
            .map_err(|e| Error::SnapshotIo(format!("encode snapshot: {}", e)))?;

        let write = || -> std::io::Result<()> {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)?;
            // Make the rename itself durable.
            File::open(&self.dir)?.sync_all()
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(Error::SnapshotIo(format!("write {}: {}", path.display(), e)));
        }

        debug!(index = snapshot.index, term = snapshot.term, path = %path.display(), "Snapshot persisted");
        self.prune()?;
        Ok(path)
    }

    /// Newest snapshot that decodes and passes its checksum.
    ///
    /// `Ok(None)` means there are no snapshot files at all. If files exist
    /// but none is readable the error is returned rather than starting empty.
    pub fn latest(&self) -> Result<Option<StoredSnapshot>> {
        let files = self.list()?;
        if files.is_empty() {
            return Ok(None);
        }

        let mut last_err = None;
        for path in files.iter().rev() {
            match Self::read(path) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::SnapshotIo("no readable snapshot".into())))
    }

    /// Snapshot files, oldest first.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| Error::SnapshotIo(format!("read {}: {}", self.dir.display(), e)))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(SNAPSHOT_EXT))
            .collect();
        files.sort_by_key(|path| Self::sort_key(path));
        Ok(files)
    }

    fn sort_key(path: &Path) -> (u64, u64) {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        let mut parts = stem.splitn(2, '-');
        let term = parts.next().and_then(|t| u64::from_str_radix(t, 16).ok());
        let index = parts.next().and_then(|i| u64::from_str_radix(i, 16).ok());
        (index.unwrap_or(0), term.unwrap_or(0))
    }

    fn read(path: &Path) -> Result<StoredSnapshot> {
        let bytes = fs::read(path)
            .map_err(|e| Error::SnapshotIo(format!("read {}: {}", path.display(), e)))?;
        let record: SnapshotFile = bincode::deserialize(&bytes)
            .map_err(|e| Error::SnapshotIo(format!("decode {}: {}", path.display(), e)))?;

        let actual = crc32fast::hash(&record.data);
        if actual != record.checksum {
            return Err(Error::SnapshotIo(format!(
                "checksum mismatch in {}: expected {:08x}, got {:08x}",
                path.display(),
                record.checksum,
                actual
            )));
        }

        Ok(StoredSnapshot {
            index: record.index,
            term: record.term,
            voters: record.voters,
            learners: record.learners,
            data: record.data,
        })
    }

    fn prune(&self) -> Result<()> {
        let files = self.list()?;
        if files.len() <= self.retain {
            return Ok(());
        }
        for path in &files[..files.len() - self.retain] {
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "Failed to remove old snapshot");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(index: u64, term: u64) -> StoredSnapshot {
        StoredSnapshot {
            index,
            term,
            voters: vec![1, 2, 3],
            learners: vec![],
            data: format!("state@{}", index).into_bytes(),
        }
    }

    #[test]
    fn test_empty_dir_has_no_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().join("snapshots"), 2).unwrap();
        assert!(store.latest().unwrap().is_none());
    }

    #[test]
    fn test_latest_and_retention() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path(), 2).unwrap();

        store.save(&snapshot(10, 1)).unwrap();
        store.save(&snapshot(20, 1)).unwrap();
        store.save(&snapshot(30, 2)).unwrap();

        assert_eq!(store.list().unwrap().len(), 2);
        assert_eq!(store.latest().unwrap(), Some(snapshot(30, 2)));
    }

    #[test]
    fn test_corrupt_newest_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path(), 2).unwrap();

        store.save(&snapshot(10, 1)).unwrap();
        let newest = store.save(&snapshot(20, 1)).unwrap();

        let mut bytes = fs::read(&newest).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&newest, bytes).unwrap();

        assert_eq!(store.latest().unwrap(), Some(snapshot(10, 1)));
    }

    #[test]
    fn test_all_corrupt_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path(), 2).unwrap();
        fs::write(dir.path().join("0000000000000001-0000000000000005.snap"), b"junk").unwrap();

        assert!(matches!(store.latest(), Err(Error::SnapshotIo(_))));
    }
}
