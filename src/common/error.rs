//! Error types for kvmesh

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Consensus Errors ===
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("Apply timeout: entry not committed within {0:?}")]
    ApplyTimeout(Duration),

    #[error("Leadership lost before the entry was applied")]
    LeadershipLost,

    #[error("Raft error: {0}")]
    Raft(String),

    // === State Machine Errors ===
    #[error("Malformed command: {0}")]
    MalformedCommand(String),

    #[error("Apply loop halted: {0}")]
    Halted(String),

    #[error("Snapshot I/O error: {0}")]
    SnapshotIo(String),

    // === Membership Errors ===
    #[error("Membership conflict: {id} at {address} overlaps an existing member")]
    MembershipConflict { id: String, address: String },

    #[error("Membership error: {0}")]
    Membership(String),

    // === Placement Errors ===
    #[error("Insufficient replicas: need {needed}, have {available}")]
    InsufficientReplicas { needed: usize, available: usize },

    #[error("Empty ring: no members")]
    EmptyRing,

    // === Network Errors ===
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotLeader(_)
                | Error::ApplyTimeout(_)
                | Error::LeadershipLost
                | Error::Transport(_)
                | Error::SnapshotIo(_)
        )
    }

    /// Is this error fatal for the node's apply loop?
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::MalformedCommand(_) | Error::Halted(_))
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotLeader(_) => StatusCode::TEMPORARY_REDIRECT,
            Error::ApplyTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            Error::LeadershipLost | Error::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::InvalidConfig(_) | Error::MalformedCommand(_) => StatusCode::BAD_REQUEST,
            Error::EmptyRing | Error::InsufficientReplicas { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<raft::Error> for Error {
    fn from(e: raft::Error) -> Self {
        Error::Raft(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Internal(format!("bincode: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::NotLeader("10.0.0.1:7000".into()).is_retryable());
        assert!(Error::ApplyTimeout(Duration::from_secs(1)).is_retryable());
        assert!(!Error::MalformedCommand("bad op".into()).is_retryable());
        assert!(Error::MalformedCommand("bad op".into()).is_fatal());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(
            Error::NotLeader("unknown".into()).to_http_status(),
            StatusCode::TEMPORARY_REDIRECT
        );
        assert_eq!(
            Error::ApplyTimeout(Duration::from_millis(5)).to_http_status(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            Error::Internal("boom".into()).to_http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
