//! Logical request/response fields exchanged between workers and the
//! parameter server. Wire framing belongs to the transport.

use crate::model::{FeatureId, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Control head meaning "stop the server".
pub const HEAD_STOP_SERVER: i32 = -1;
/// Control head meaning "enter synchronous mode".
pub const HEAD_SYNC_MODE: i32 = -2;

/// Semantics of the values carried by a data request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    /// Feature occurrence counts
    FeaCount,
    /// Full weight values (assigned)
    Weight,
    /// Gradient contributions; synchronizable across workers
    Gradient,
    /// A code the server does not know; handled asynchronously
    Other(i32),
}

/// Numeric `cmd` codes of each value kind. Both ends must agree on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValueCodes {
    pub fea_count: i32,
    pub weight: i32,
    pub gradient: i32,
}

impl Default for ValueCodes {
    fn default() -> Self {
        Self {
            fea_count: 1,
            weight: 2,
            gradient: 3,
        }
    }
}

impl ValueCodes {
    pub fn decode(&self, cmd: i32) -> ValueKind {
        if cmd == self.gradient {
            ValueKind::Gradient
        } else if cmd == self.weight {
            ValueKind::Weight
        } else if cmd == self.fea_count {
            ValueKind::FeaCount
        } else {
            ValueKind::Other(cmd)
        }
    }

    pub fn encode(&self, kind: ValueKind) -> i32 {
        match kind {
            ValueKind::FeaCount => self.fea_count,
            ValueKind::Weight => self.weight,
            ValueKind::Gradient => self.gradient,
            ValueKind::Other(code) => code,
        }
    }
}

/// Request metadata delivered by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestMeta {
    pub sender: NodeId,
    /// Per-sender request timestamp; identifies the request for the reply
    pub timestamp: u64,
    pub cmd: i32,
    pub push: bool,
}

/// Keys with flattened values; `lens` is empty when every key has the same
/// number of values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KvPairs {
    pub keys: Vec<FeatureId>,
    pub vals: Vec<f32>,
    pub lens: Vec<u32>,
}

impl KvPairs {
    pub fn new(keys: Vec<FeatureId>, vals: Vec<f32>) -> Self {
        Self {
            keys,
            vals,
            lens: Vec::new(),
        }
    }

    pub fn keys_only(keys: Vec<FeatureId>) -> Self {
        Self::new(keys, Vec::new())
    }
}

/// Out-of-band control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Control {
    pub head: i32,
    pub body: String,
}

/// Decoded control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Stop,
    SyncMode,
    Unknown(i32),
}

impl Command {
    pub fn from_head(head: i32) -> Self {
        match head {
            HEAD_STOP_SERVER => Command::Stop,
            HEAD_SYNC_MODE => Command::SyncMode,
            other => Command::Unknown(other),
        }
    }
}

/// Errors reported to a requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerError {
    /// The request violates the protocol and was rejected
    Protocol(String),
    /// The updater failed to apply or serve the request
    Updater(String),
    /// The server stopped before the request could be served
    Shutdown,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Protocol(msg) => write!(f, "protocol violation: {msg}"),
            ServerError::Updater(msg) => write!(f, "updater error: {msg}"),
            ServerError::Shutdown => write!(f, "server is shut down"),
        }
    }
}

impl std::error::Error for ServerError {}

pub type Reply = Result<KvPairs, ServerError>;

/// Delivers replies back to requesters. Implemented by the transport.
///
/// Called from the server's executor thread, so implementations must not
/// block on the requester.
pub trait Responder: Send + Sync {
    fn respond(&self, meta: &RequestMeta, reply: Reply);
}
