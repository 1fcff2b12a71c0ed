//! Raft log write-ahead file
//!
//! Entries and hard state are appended as framed records:
//! [MAGIC][LEN][CRC32][PAYLOAD], where the payload is a bincode frame of
//! prost-encoded raft structures. Replay stops at the first torn or corrupt
//! record and the file is cut back to the last good one. Once a snapshot is
//! on disk the file is rewritten with only the entries past it.

use crate::common::{Error, Result};
use prost::Message as ProstMessage;
use raft::prelude::{Entry, HardState};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const WAL_MAGIC: [u8; 4] = *b"RWL1";
const WAL_FILE: &str = "raft.wal";
const TMP_FILE: &str = "raft.wal.tmp";
/// Larger lengths are treated as corruption.
const MAX_RECORD_LEN: usize = 256 << 20;

#[derive(Serialize, Deserialize)]
enum Frame {
    Entries(Vec<Vec<u8>>),
    HardState(Vec<u8>),
}

/// A replayed record, in the order it was written.
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    Entries(Vec<Entry>),
    HardState(HardState),
}

pub struct Wal {
    path: PathBuf,
    writer: BufWriter<File>,
    dirty: bool,
}

impl Wal {
    /// Open or create the log under `dir` and return what it holds.
    pub fn open(dir: impl AsRef<Path>) -> Result<(Self, Vec<WalRecord>)> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(WAL_FILE);

        let (records, valid_len) = Self::replay(&path)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        if file.metadata()?.len() > valid_len {
            warn!(path = %path.display(), valid_len, "Truncating raft log after last good record");
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        debug!(path = %path.display(), records = records.len(), "Raft log opened");

        Ok((
            Self {
                path,
                writer: BufWriter::new(file),
                dirty: false,
            },
            records,
        ))
    }

    pub fn append_entries(&mut self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let frame = Frame::Entries(entries.iter().map(|e| e.encode_to_vec()).collect());
        write_frame(&mut self.writer, &frame)?;
        self.dirty = true;
        Ok(())
    }

    pub fn append_hard_state(&mut self, hs: &HardState) -> Result<()> {
        write_frame(&mut self.writer, &Frame::HardState(hs.encode_to_vec()))?;
        self.dirty = true;
        Ok(())
    }

    /// Flush and fsync everything appended since the last sync.
    pub fn sync(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.dirty = false;
        Ok(())
    }

    /// Replace the file with `entries` followed by `hs`.
    pub fn rewrite(&mut self, entries: &[Entry], hs: &HardState) -> Result<()> {
        self.writer.flush()?;
        let tmp = self.path.with_file_name(TMP_FILE);
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            if !entries.is_empty() {
                let frame = Frame::Entries(entries.iter().map(|e| e.encode_to_vec()).collect());
                write_frame(&mut out, &frame)?;
            }
            write_frame(&mut out, &Frame::HardState(hs.encode_to_vec()))?;
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        if let Some(parent) = self.path.parent() {
            File::open(parent)?.sync_all()?;
        }

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.dirty = false;
        debug!(path = %self.path.display(), entries = entries.len(), "Raft log rewritten");
        Ok(())
    }

    fn replay(path: &Path) -> Result<(Vec<WalRecord>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut valid_len = 0u64;
        loop {
            match read_frame(&mut reader) {
                Ok(Some((record, len))) => {
                    records.push(record);
                    valid_len += len;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(path = %path.display(), offset = valid_len, error = %e, "Raft log replay stopped at corrupted record");
                    break;
                }
            }
        }
        Ok((records, valid_len))
    }
}

fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<()> {
    let payload = bincode::serialize(frame)?;
    writer.write_all(&WAL_MAGIC)?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Next record and its size on disk. `Ok(None)` at a clean or torn end of
/// the header.
fn read_frame<R: Read>(reader: &mut R) -> Result<Option<(WalRecord, u64)>> {
    let mut header = [0u8; 12];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if header[..4] != WAL_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let checksum = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    if len > MAX_RECORD_LEN {
        return Err(corrupt(format!("record length {}", len)));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    if crc32fast::hash(&payload) != checksum {
        return Err(corrupt("checksum mismatch"));
    }

    let record = match bincode::deserialize(&payload)? {
        Frame::Entries(raw) => WalRecord::Entries(
            raw.iter()
                .map(|bytes| Entry::decode(&bytes[..]).map_err(|e| corrupt(e.to_string())))
                .collect::<Result<_>>()?,
        ),
        Frame::HardState(bytes) => WalRecord::HardState(
            HardState::decode(&bytes[..]).map_err(|e| corrupt(e.to_string()))?,
        ),
    };
    Ok(Some((record, (header.len() + len) as u64)))
}

fn corrupt(reason: impl Into<String>) -> Error {
    Error::Internal(format!("raft log: {}", reason.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e.data = data.to_vec().into();
        e
    }

    fn hard_state(term: u64, vote: u64, commit: u64) -> HardState {
        let mut hs = HardState::default();
        hs.term = term;
        hs.vote = vote;
        hs.commit = commit;
        hs
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut wal, records) = Wal::open(dir.path()).unwrap();
            assert!(records.is_empty());
            wal.append_entries(&[entry(2, 1, b"a"), entry(3, 1, b"b")]).unwrap();
            wal.append_hard_state(&hard_state(1, 7, 3)).unwrap();
            wal.sync().unwrap();
        }

        let (_, records) = Wal::open(dir.path()).unwrap();
        assert_eq!(
            records,
            vec![
                WalRecord::Entries(vec![entry(2, 1, b"a"), entry(3, 1, b"b")]),
                WalRecord::HardState(hard_state(1, 7, 3)),
            ]
        );
    }

    #[test]
    fn test_torn_tail_is_cut_and_appends_continue() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut wal, _) = Wal::open(dir.path()).unwrap();
            wal.append_entries(&[entry(2, 1, b"a")]).unwrap();
            wal.sync().unwrap();
        }
        let path = dir.path().join(WAL_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&WAL_MAGIC).unwrap();
        file.write_all(&[9, 0]).unwrap();
        drop(file);

        {
            let (mut wal, records) = Wal::open(dir.path()).unwrap();
            assert_eq!(records.len(), 1);
            wal.append_entries(&[entry(3, 1, b"b")]).unwrap();
            wal.sync().unwrap();
        }

        let (_, records) = Wal::open(dir.path()).unwrap();
        assert_eq!(
            records,
            vec![
                WalRecord::Entries(vec![entry(2, 1, b"a")]),
                WalRecord::Entries(vec![entry(3, 1, b"b")]),
            ]
        );
    }

    #[test]
    fn test_flipped_byte_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut wal, _) = Wal::open(dir.path()).unwrap();
            wal.append_entries(&[entry(2, 1, b"a")]).unwrap();
            wal.append_entries(&[entry(3, 1, b"b")]).unwrap();
            wal.sync().unwrap();
        }
        let path = dir.path().join(WAL_FILE);
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes).unwrap();

        let (_, records) = Wal::open(dir.path()).unwrap();
        assert_eq!(records, vec![WalRecord::Entries(vec![entry(2, 1, b"a")])]);
    }

    #[test]
    fn test_rewrite_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (mut wal, _) = Wal::open(dir.path()).unwrap();
            wal.append_entries(&[entry(2, 1, b"a"), entry(3, 1, b"b")]).unwrap();
            wal.append_hard_state(&hard_state(1, 1, 3)).unwrap();
            wal.rewrite(&[entry(3, 1, b"b")], &hard_state(1, 1, 3)).unwrap();
            wal.append_entries(&[entry(4, 2, b"c")]).unwrap();
            wal.sync().unwrap();
        }

        let (_, records) = Wal::open(dir.path()).unwrap();
        assert_eq!(
            records,
            vec![
                WalRecord::Entries(vec![entry(3, 1, b"b")]),
                WalRecord::HardState(hard_state(1, 1, 3)),
                WalRecord::Entries(vec![entry(4, 2, b"c")]),
            ]
        );
        assert!(!dir.path().join(TMP_FILE).exists());
    }
}
