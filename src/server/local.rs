//! In-process transport: workers call the server directly on their own
//! thread and wait on a channel for the reply.

use super::front::ParameterServer;
use super::protocol::{KvPairs, Reply, RequestMeta, Responder, ValueCodes, ValueKind};
use super::ModelStore;
use crate::model::{FeatureId, NodeId};
use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Routes replies to the requests waiting on them.
#[derive(Debug, Default)]
pub struct LocalTransport {
    pending: Mutex<FxHashMap<(NodeId, u64), Sender<Reply>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request before it is sent, so a reply produced on the
    /// sending thread is not lost.
    fn register(&self, meta: &RequestMeta) -> Receiver<Reply> {
        let (tx, rx) = bounded(1);
        self.pending.lock().insert((meta.sender, meta.timestamp), tx);
        rx
    }

    pub fn num_pending(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Responder for LocalTransport {
    fn respond(&self, meta: &RequestMeta, reply: Reply) {
        let waiter = self.pending.lock().remove(&(meta.sender, meta.timestamp));
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => warn!(
                sender = %meta.sender,
                timestamp = meta.timestamp,
                "reply for a request nobody waits on"
            ),
        }
    }
}

/// The model-store handle a worker holds.
pub struct LocalClient {
    node: NodeId,
    server: Arc<ParameterServer>,
    transport: Arc<LocalTransport>,
    codes: ValueCodes,
    clock: AtomicU64,
}

impl LocalClient {
    pub fn new(
        node: NodeId,
        server: Arc<ParameterServer>,
        transport: Arc<LocalTransport>,
        codes: ValueCodes,
    ) -> Self {
        Self {
            node,
            server,
            transport,
            codes,
            clock: AtomicU64::new(0),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    fn request(&self, kind: ValueKind, push: bool, payload: KvPairs) -> Result<KvPairs> {
        let meta = RequestMeta {
            sender: self.node,
            timestamp: self.clock.fetch_add(1, Ordering::Relaxed),
            cmd: self.codes.encode(kind),
            push,
        };
        let rx = self.transport.register(&meta);
        // Rejections are answered through the transport as well.
        let _ = self.server.handle_data(meta, payload);
        let reply = rx
            .recv()
            .map_err(|_| anyhow!("{}: server dropped request {}", self.node, meta.timestamp))?;
        reply.map_err(|err| anyhow!("{}: request {} failed: {err}", self.node, meta.timestamp))
    }
}

impl ModelStore for LocalClient {
    fn push(&self, kind: ValueKind, kv: KvPairs) -> Result<()> {
        self.request(kind, true, kv).map(|_| ())
    }

    fn pull(&self, kind: ValueKind, keys: Vec<FeatureId>) -> Result<KvPairs> {
        self.request(kind, false, KvPairs::keys_only(keys))
    }
}
