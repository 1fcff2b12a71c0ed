//! Replicated state machine over a [`KvStore`]
//!
//! Applies committed commands to the store and converts the store to and
//! from a snapshot stream:
//!
//! ```text
//! "KVSM" | version u8 | count u64 | (klen u32 | key | vlen u32 | value)* | crc32 u32
//! ```
//!
//! Integers are big-endian, keys sorted, and the CRC covers every byte
//! before it.

use crate::common::command::Command;
use crate::common::storage::KvStore;
use crate::common::{Error, Result};
use crate::consensus::{ApplyOutcome, StateMachine, StateSnapshot};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

const MAGIC: &[u8; 4] = b"KVSM";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 8;

pub struct ReplicatedStateMachine {
    store: Arc<dyn KvStore>,
    /// Last applied index. Held across apply and snapshot.
    gate: Mutex<u64>,
}

impl ReplicatedStateMachine {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            gate: Mutex::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    fn gate(&self) -> MutexGuard<'_, u64> {
        self.gate.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StateMachine for ReplicatedStateMachine {
    fn apply(&self, index: u64, data: &[u8]) -> Result<ApplyOutcome> {
        let mut last_applied = self.gate();
        if index <= *last_applied {
            return Err(Error::Halted(format!(
                "entry {} delivered after {} was applied",
                index, *last_applied
            )));
        }

        let command = Command::decode(data)?;
        match &command {
            Command::Set { key, value } => self.store.set(key, value)?,
            Command::Delete { key } => self.store.delete(key)?,
        }
        *last_applied = index;

        debug!(index, op = command.op(), key = command.key(), "Applied command");
        Ok(ApplyOutcome {
            index,
            op: command.op(),
        })
    }

    fn snapshot(&self) -> Result<StateSnapshot> {
        let last_applied = self.gate();
        let state = self.store.snapshot()?;
        Ok(StateSnapshot {
            index: *last_applied,
            data: encode_stream(&state),
        })
    }

    fn restore(&self, index: u64, data: &[u8]) -> Result<()> {
        let mut last_applied = self.gate();
        let state = decode_stream(data)?;
        let keys = state.len();
        self.store.restore(state)?;
        *last_applied = index;
        debug!(index, keys, "Restored state machine");
        Ok(())
    }

    fn applied_index(&self) -> u64 {
        *self.gate()
    }
}

pub fn encode_stream(state: &BTreeMap<String, String>) -> Vec<u8> {
    let body: usize = state.iter().map(|(k, v)| 8 + k.len() + v.len()).sum();
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body + 4);

    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u64(state.len() as u64);
    for (key, value) in state {
        buf.put_u32(key.len() as u32);
        buf.put_slice(key.as_bytes());
        buf.put_u32(value.len() as u32);
        buf.put_slice(value.as_bytes());
    }
    let crc = crc32fast::hash(&buf);
    buf.put_u32(crc);
    buf.to_vec()
}

pub fn decode_stream(data: &[u8]) -> Result<BTreeMap<String, String>> {
    let corrupt = |what: &str| Error::SnapshotIo(format!("corrupt snapshot stream: {}", what));

    if data.len() < HEADER_LEN + 4 {
        return Err(corrupt("truncated header"));
    }
    let (body, trailer) = data.split_at(data.len() - 4);
    let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    if crc32fast::hash(body) != expected {
        return Err(corrupt("checksum mismatch"));
    }

    let mut buf = body;
    if &buf[..4] != MAGIC {
        return Err(corrupt("bad magic"));
    }
    buf.advance(4);
    let version = buf.get_u8();
    if version != VERSION {
        return Err(corrupt(&format!("unsupported version {}", version)));
    }
    let count = buf.get_u64();

    let mut state = BTreeMap::new();
    for _ in 0..count {
        let key = read_string(&mut buf).ok_or_else(|| corrupt("truncated key"))?;
        let value = read_string(&mut buf).ok_or_else(|| corrupt("truncated value"))?;
        state.insert(key, value);
    }
    if buf.has_remaining() {
        return Err(corrupt("trailing bytes"));
    }
    Ok(state)
}

fn read_string(buf: &mut &[u8]) -> Option<String> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return None;
    }
    let s = String::from_utf8(buf[..len].to_vec()).ok()?;
    buf.advance(len);
    Some(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::storage::MemStore;

    fn machine() -> ReplicatedStateMachine {
        ReplicatedStateMachine::new(Arc::new(MemStore::new()))
    }

    fn set(key: &str, value: &str) -> Vec<u8> {
        Command::set(key, value).encode().unwrap()
    }

    fn delete(key: &str) -> Vec<u8> {
        Command::delete(key).encode().unwrap()
    }

    #[test]
    fn test_set_stores_value_not_key() {
        let sm = machine();
        let outcome = sm.apply(1, &set("x", "1")).unwrap();
        assert_eq!(outcome, ApplyOutcome { index: 1, op: "set" });
        assert_eq!(sm.store().get("x").unwrap(), Some("1".to_string()));
        assert_eq!(sm.applied_index(), 1);
    }

    #[test]
    fn test_same_sequence_same_state() {
        let log = vec![set("a", "1"), set("b", "2"), delete("a"), set("c", "3"), set("b", "4")];
        let left = machine();
        let right = machine();
        for (i, entry) in log.iter().enumerate() {
            left.apply(i as u64 + 1, entry).unwrap();
            right.apply(i as u64 + 1, entry).unwrap();
        }

        assert_eq!(left.store().snapshot().unwrap(), right.store().snapshot().unwrap());
        assert_eq!(left.snapshot().unwrap().data, right.snapshot().unwrap().data);
    }

    #[test]
    fn test_redelivery_is_rejected() {
        let sm = machine();
        sm.apply(1, &set("a", "1")).unwrap();
        sm.apply(2, &set("a", "2")).unwrap();

        let err = sm.apply(2, &set("a", "3")).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(sm.store().get("a").unwrap(), Some("2".to_string()));
    }

    #[test]
    fn test_unknown_op_is_malformed() {
        let sm = machine();
        let err = sm
            .apply(1, br#"{"op":"increment","key":"n"}"#)
            .unwrap_err();
        assert!(matches!(err, Error::MalformedCommand(_)));
        assert_eq!(sm.applied_index(), 0);
        assert!(sm.store().is_empty().unwrap());
    }

    #[test]
    fn test_restore_of_snapshot_reproduces_state() {
        let sm = machine();
        sm.apply(1, &set("x", "1")).unwrap();
        sm.apply(2, &set("y", "with spaces and ünïcode")).unwrap();
        sm.apply(3, &delete("x")).unwrap();
        let snapshot = sm.snapshot().unwrap();
        assert_eq!(snapshot.index, 3);

        let other = machine();
        other.apply(1, &set("stale", "gone")).unwrap();
        other.restore(snapshot.index, &snapshot.data).unwrap();

        assert_eq!(other.store().snapshot().unwrap(), sm.store().snapshot().unwrap());
        assert_eq!(other.applied_index(), 3);
        other.apply(4, &set("z", "26")).unwrap();
    }

    #[test]
    fn test_corrupt_stream_is_rejected() {
        let mut state = BTreeMap::new();
        state.insert("k".to_string(), "v".to_string());
        let mut data = encode_stream(&state);
        data[HEADER_LEN + 4] ^= 0x01;

        let sm = machine();
        assert!(matches!(sm.restore(9, &data), Err(Error::SnapshotIo(_))));
        assert!(matches!(decode_stream(b"KV"), Err(Error::SnapshotIo(_))));
        assert_eq!(sm.applied_index(), 0);
    }

    #[test]
    fn test_empty_state_stream() {
        let data = encode_stream(&BTreeMap::new());
        assert_eq!(&data[..4], b"KVSM");
        assert!(decode_stream(&data).unwrap().is_empty());
    }
}
