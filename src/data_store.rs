//! # Data Store
//!
//! Blob-keyed store used by a worker to hand shards and feature accumulators
//! from one job invocation to the next. Once pushed, a blob is owned by the
//! store and only referenced through its key.

use crate::model::{FeatureId, RowBlock};
use anyhow::{anyhow, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::sync::Arc;

/// Values the store can hold. Payloads are reference counted so a pull hands
/// out a read-only view without copying.
#[derive(Debug, Clone)]
pub enum Blob {
    Block(Arc<RowBlock<u32>>),
    FeatureIds(Arc<Vec<FeatureId>>),
    Reals(Arc<Vec<f32>>),
}

impl Blob {
    fn kind(&self) -> &'static str {
        match self {
            Blob::Block(_) => "block",
            Blob::FeatureIds(_) => "feature-ids",
            Blob::Reals(_) => "reals",
        }
    }
}

/// Key of a per-shard field, `"{shard_index}_{field}"`.
pub fn shard_key(shard_index: usize, field: &str) -> String {
    format!("{shard_index}_{field}")
}

/// Push/pull-by-key storage contract.
pub trait DataStore: Send + Sync {
    fn push(&self, key: &str, blob: Blob) -> Result<()>;
    fn pull(&self, key: &str) -> Result<Blob>;
    fn remove(&self, key: &str) -> Result<()>;
    fn contains(&self, key: &str) -> bool;

    fn pull_block(&self, key: &str) -> Result<Arc<RowBlock<u32>>> {
        match self.pull(key)? {
            Blob::Block(b) => Ok(b),
            other => Err(anyhow!("{key} holds {}, expected block", other.kind())),
        }
    }

    fn pull_feature_ids(&self, key: &str) -> Result<Arc<Vec<FeatureId>>> {
        match self.pull(key)? {
            Blob::FeatureIds(ids) => Ok(ids),
            other => Err(anyhow!("{key} holds {}, expected feature-ids", other.kind())),
        }
    }

    fn pull_reals(&self, key: &str) -> Result<Arc<Vec<f32>>> {
        match self.pull(key)? {
            Blob::Reals(vals) => Ok(vals),
            other => Err(anyhow!("{key} holds {}, expected reals", other.kind())),
        }
    }
}

/// In-memory data store.
#[derive(Debug, Default)]
pub struct MemDataStore {
    blobs: RwLock<HashMap<String, Blob>>,
}

impl MemDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl DataStore for MemDataStore {
    fn push(&self, key: &str, blob: Blob) -> Result<()> {
        self.blobs.write().insert(key.to_string(), blob);
        Ok(())
    }

    fn pull(&self, key: &str) -> Result<Blob> {
        self.blobs
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("no blob stored under {key}"))
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.blobs.write().remove(key);
        Ok(())
    }

    fn contains(&self, key: &str) -> bool {
        self.blobs.read().contains_key(key)
    }
}
