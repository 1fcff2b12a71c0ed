//! Raft message transport
//!
//! Messages are fire-and-forget: Raft retries on its own, so a dropped
//! message only costs a heartbeat interval. Each envelope carries the
//! sender's id and address so receivers can reply before the sender's
//! conf change has reached them.

use crate::common::{Error, Result};
use crate::consensus::ClusterNode;
use prost::Message as ProstMessage;
use raft_proto::eraftpb::Message;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: ClusterNode,
    pub message: Message,
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    from: ClusterNode,
    message: Vec<u8>,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let wire = WireEnvelope {
            from: self.from.clone(),
            message: self.message.encode_to_vec(),
        };
        Ok(bincode::serialize(&wire)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let wire: WireEnvelope = bincode::deserialize(bytes)
            .map_err(|e| Error::Transport(format!("bad envelope: {}", e)))?;
        let message = Message::decode(&wire.message[..])
            .map_err(|e| Error::Transport(format!("bad raft message: {}", e)))?;
        Ok(Self {
            from: wire.from,
            message,
        })
    }
}

pub trait Transport: Send + Sync + 'static {
    /// Queue `envelope` for delivery to `to`. Never blocks.
    fn send(&self, to: &ClusterNode, envelope: Envelope);
}

/// In-process transport keyed by node address.
#[derive(Default)]
pub struct LocalRouter {
    routes: Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>,
    isolated: Mutex<HashSet<String>>,
}

impl LocalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: impl Into<String>, inbox: mpsc::UnboundedSender<Envelope>) {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address.into(), inbox);
    }

    pub fn unregister(&self, address: &str) {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(address);
    }

    /// Drop all traffic to and from `address` until [`heal`](Self::heal).
    pub fn isolate(&self, address: impl Into<String>) {
        self.isolated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address.into());
    }

    pub fn heal(&self, address: &str) {
        self.isolated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(address);
    }
}

impl Transport for LocalRouter {
    fn send(&self, to: &ClusterNode, envelope: Envelope) {
        {
            let isolated = self.isolated.lock().unwrap_or_else(|e| e.into_inner());
            if isolated.contains(&to.address) || isolated.contains(&envelope.from.address) {
                return;
            }
        }
        let routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(inbox) = routes.get(&to.address) {
            let _ = inbox.send(envelope);
        }
    }
}

/// Posts envelopes to `http://<address>/raft` on the peer's gateway.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn send(&self, to: &ClusterNode, envelope: Envelope) {
        let body = match envelope.encode() {
            Ok(body) => body,
            Err(e) => {
                debug!(to = %to, error = %e, "Dropping unencodable raft message");
                return;
            }
        };
        let url = format!("http://{}/raft", to.address);
        let client = self.client.clone();
        let peer = to.id.clone();
        tokio::spawn(async move {
            let result = client
                .post(&url)
                .header("content-type", "application/octet-stream")
                .body(body)
                .send()
                .await
                .and_then(|resp| resp.error_for_status());
            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "Raft message not delivered");
            }
        });
    }
}
