//! Commands replicated through the consensus log
//!
//! The wire form is a JSON record `{"op": .., "key": .., "value": ..}`.
//! Decoding is split in two steps so that bytes which are not a command at
//! all and commands with an unknown `op` are reported separately.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};

/// A single mutation of the key-value state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Set { key: String, value: String },
    Delete { key: String },
}

/// Raw log record. Unknown fields are ignored on decode.
#[derive(Debug, Serialize, Deserialize)]
struct Record {
    op: String,
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

impl Command {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Command::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Command::Delete { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            Command::Set { key, .. } | Command::Delete { key } => key,
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            Command::Set { .. } => "set",
            Command::Delete { .. } => "delete",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let record = match self {
            Command::Set { key, value } => Record {
                op: "set".into(),
                key: key.clone(),
                value: Some(value.clone()),
            },
            Command::Delete { key } => Record {
                op: "delete".into(),
                key: key.clone(),
                value: None,
            },
        };
        serde_json::to_vec(&record).map_err(|e| Error::Internal(format!("encode command: {}", e)))
    }

    /// Decode a log entry. Both failure modes are `MalformedCommand`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let record: Record = serde_json::from_slice(bytes)
            .map_err(|e| Error::MalformedCommand(format!("undecodable entry: {}", e)))?;

        match record.op.as_str() {
            "set" => {
                let value = record.value.ok_or_else(|| {
                    Error::MalformedCommand(format!("set without value for key {}", record.key))
                })?;
                Ok(Command::Set {
                    key: record.key,
                    value,
                })
            }
            "delete" => Ok(Command::Delete { key: record.key }),
            other => Err(Error::MalformedCommand(format!(
                "unrecognized command op: {}",
                other
            ))),
        }
    }
}
