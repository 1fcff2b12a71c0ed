//! Raft log storage
//!
//! `MemStorage` keeps entries, hard state and conf state for raft-rs to
//! read. Every write also goes to the write-ahead file so a restart can
//! rebuild the log past the newest snapshot. `MemStorage::snapshot()`
//! carries no application data, so this wrapper answers snapshot requests
//! with the last snapshot the worker cut or installed.

use crate::common::Result;
use crate::consensus::wal::{Wal, WalRecord};
use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use raft::storage::MemStorage;
use raft::{GetEntriesContext, RaftState, Storage, StorageError};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};

#[derive(Clone)]
pub struct LogStore {
    mem: MemStorage,
    latest: Arc<RwLock<Option<Snapshot>>>,
    wal: Option<Arc<Mutex<Wal>>>,
}

impl LogStore {
    /// Empty storage with no write-ahead file.
    #[cfg(test)]
    pub fn new() -> Self {
        Self {
            mem: MemStorage::new(),
            latest: Arc::new(RwLock::new(None)),
            wal: None,
        }
    }

    /// Rebuild the log from `snapshot` plus the records replayed from `wal`.
    ///
    /// Entries the snapshot covers are skipped. Replay stops at a gap in the
    /// indices, and the recovered commit index never passes the last entry.
    pub fn recover(wal: Wal, records: Vec<WalRecord>, snapshot: Option<Snapshot>) -> Result<Self> {
        let store = Self {
            mem: MemStorage::new(),
            latest: Arc::new(RwLock::new(None)),
            wal: Some(Arc::new(Mutex::new(wal))),
        };
        if let Some(snapshot) = snapshot {
            store.mem.wl().apply_snapshot(snapshot.clone())?;
            store.set_latest(snapshot);
        }

        let mut hard_state = None;
        let mut replayed = 0usize;
        for record in records {
            match record {
                WalRecord::Entries(entries) => {
                    let first = store.mem.first_index()?;
                    let last = store.mem.last_index()?;
                    let entries: Vec<Entry> =
                        entries.into_iter().filter(|e| e.index >= first).collect();
                    let Some(head) = entries.first() else {
                        continue;
                    };
                    if head.index > last + 1 {
                        warn!(expected = last + 1, found = head.index, "Gap in raft log, replay stopped");
                        break;
                    }
                    replayed += entries.len();
                    store.mem.wl().append(&entries)?;
                }
                WalRecord::HardState(hs) => hard_state = Some(hs),
            }
        }

        if let Some(mut hs) = hard_state {
            let floor = store.mem.first_index()? - 1;
            let last = store.mem.last_index()?;
            let current = store.mem.initial_state()?.hard_state;
            hs.term = hs.term.max(current.term);
            hs.commit = hs.commit.clamp(floor, last);
            store.mem.wl().set_hardstate(hs);
        }
        if replayed > 0 {
            info!(
                entries = replayed,
                last_index = store.mem.last_index()?,
                "Replayed raft log"
            );
        }
        Ok(store)
    }

    pub fn append(&self, entries: &[Entry]) -> Result<()> {
        self.with_wal(|wal| wal.append_entries(entries))?;
        self.mem.wl().append(entries)?;
        Ok(())
    }

    pub fn set_hardstate(&self, hs: HardState) -> Result<()> {
        self.with_wal(|wal| wal.append_hard_state(&hs))?;
        self.mem.wl().set_hardstate(hs);
        Ok(())
    }

    pub fn set_commit(&self, commit: u64) -> Result<()> {
        let hs = {
            let mut core = self.mem.wl();
            core.mut_hard_state().set_commit(commit);
            core.hard_state().clone()
        };
        self.with_wal(|wal| wal.append_hard_state(&hs))
    }

    /// Make everything written so far durable.
    pub fn sync(&self) -> Result<()> {
        self.with_wal(|wal| wal.sync())
    }

    pub fn set_conf_state(&self, cs: ConfState) {
        self.mem.wl().set_conf_state(cs);
    }

    pub fn conf_state(&self) -> raft::Result<ConfState> {
        Ok(self.mem.initial_state()?.conf_state)
    }

    /// Install `snapshot` as the log base and serve it to lagging peers.
    /// The write-ahead file is cut down to match.
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        self.mem.wl().apply_snapshot(snapshot.clone())?;
        self.set_latest(snapshot);
        self.rewrite_log()
    }

    /// Record a snapshot cut locally and drop the entries it covers.
    ///
    /// The write-ahead file keeps them until [`LogStore::rewrite_log`] runs
    /// after the snapshot reaches disk.
    pub fn compact_to(&self, snapshot: Snapshot) -> raft::Result<()> {
        let index = snapshot.get_metadata().index;
        self.set_latest(snapshot);
        self.mem.wl().compact(index)
    }

    /// Rewrite the write-ahead file with the entries still in memory.
    pub fn rewrite_log(&self) -> Result<()> {
        let (entries, hs) = {
            let first = self.mem.first_index()?;
            let last = self.mem.last_index()?;
            let entries = if last >= first {
                self.mem
                    .entries(first, last + 1, u64::MAX, GetEntriesContext::empty(false))?
            } else {
                Vec::new()
            };
            (entries, self.mem.initial_state()?.hard_state)
        };
        self.with_wal(|wal| wal.rewrite(&entries, &hs))
    }

    fn set_latest(&self, snapshot: Snapshot) {
        *self.latest.write().unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
    }

    fn with_wal(&self, f: impl FnOnce(&mut Wal) -> Result<()>) -> Result<()> {
        match &self.wal {
            Some(wal) => f(&mut *wal.lock().unwrap_or_else(|e| e.into_inner())),
            None => Ok(()),
        }
    }
}

impl Storage for LogStore {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.mem.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.mem.last_index()
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let latest = self.latest.read().unwrap_or_else(|e| e.into_inner());
        match latest.as_ref() {
            Some(snapshot) if snapshot.get_metadata().index >= request_index => {
                Ok(snapshot.clone())
            }
            _ => Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            )),
        }
    }
}
