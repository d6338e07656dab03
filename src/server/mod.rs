//! Parameter server: request protocol, merge engine and front end, plus the
//! in-process transport used by local clusters.

pub mod front;
pub mod local;
pub mod merge;
pub mod protocol;

pub use front::ParameterServer;
pub use local::{LocalClient, LocalTransport};
pub use merge::{MergeEngine, MergeRound, MergeStats};
pub use protocol::{Control, KvPairs, RequestMeta, Responder, ServerError, ValueCodes, ValueKind};

use crate::model::FeatureId;
use anyhow::Result;

/// Worker-side access to the model held by the parameter server.
///
/// Both calls block until the server has answered. A gradient push in
/// synchronous mode returns only after the whole round was applied.
pub trait ModelStore: Send + Sync {
    fn push(&self, kind: ValueKind, kv: KvPairs) -> Result<()>;

    fn pull(&self, kind: ValueKind, keys: Vec<FeatureId>) -> Result<KvPairs>;
}
