//! # Data Model
//!
//! Core data structures shared by the scheduler, the workers and the
//! parameter server: node identities, jobs, job results and sparse row blocks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Raw feature identifier. The raw id space is high-cardinality (typically
/// hashed 64-bit values).
pub type FeatureId = u64;

/// Id kept out of the data; workers use it as the anchor key of empty
/// feature blocks.
pub const RESERVED_FEATURE_ID: FeatureId = FeatureId::MAX;

/// Compact identifier for a node of the worker group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    /// The node id of the worker with the given rank.
    pub fn worker(rank: usize) -> Self {
        NodeId(rank as u32)
    }

    pub fn rank(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "W{}", self.0)
    }
}

/// What a job asks a worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    PrepareTrain,
    PrepareVal,
    Train,
    Validate,
}

impl JobKind {
    pub fn is_prepare(&self) -> bool {
        matches!(self, JobKind::PrepareTrain | JobKind::PrepareVal)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobKind::PrepareTrain => "prepare-train",
            JobKind::PrepareVal => "prepare-val",
            JobKind::Train => "train",
            JobKind::Validate => "validate",
        };
        f.write_str(name)
    }
}

/// One unit of work for exactly one worker. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub kind: JobKind,
    /// Source reference for preparation jobs, empty otherwise
    pub source_ref: String,
    /// Partition handled by this worker (its rank)
    pub part_index: usize,
    /// Total number of partitions (the worker count)
    pub part_count: usize,
    pub worker: NodeId,
    /// Epoch the job belongs to (0 for preparation jobs)
    pub epoch: usize,
}

/// Statistics reported by a preparation job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrepareStats {
    /// Average occurrences per sampled row of each feature bucket
    pub feablk_avg: Vec<f32>,
    /// Number of rows that contributed to the histogram
    pub rows_sampled: u64,
    /// Number of rows read
    pub rows_read: u64,
    /// Number of shards pushed to the data store
    pub num_shards: usize,
}

/// Scalar metrics reported by training and validation jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// Sum of the per-example objective
    pub objective: f64,
    /// Number of examples evaluated
    pub num_examples: u64,
    /// Number of correctly classified examples
    pub num_correct: u64,
}

impl Metrics {
    pub fn merge(&mut self, other: &Metrics) {
        self.objective += other.objective;
        self.num_examples += other.num_examples;
        self.num_correct += other.num_correct;
    }

    pub fn mean_objective(&self) -> f64 {
        if self.num_examples == 0 {
            0.0
        } else {
            self.objective / self.num_examples as f64
        }
    }

    pub fn accuracy(&self) -> f64 {
        if self.num_examples == 0 {
            0.0
        } else {
            self.num_correct as f64 / self.num_examples as f64
        }
    }
}

/// Kind-specific job payload, consumed once by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobResult {
    Prepare(PrepareStats),
    Train(Metrics),
    Validate(Metrics),
}

/// A block of sparse rows in CSR layout.
///
/// Row `i` covers `index[offset[i]..offset[i + 1]]`. `value` is `None` for
/// binary features (every present entry has value 1.0).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowBlock<I> {
    pub offset: Vec<usize>,
    pub label: Vec<f32>,
    pub index: Vec<I>,
    pub value: Option<Vec<f32>>,
}

impl<I> Default for RowBlock<I> {
    fn default() -> Self {
        Self {
            offset: vec![0],
            label: Vec::new(),
            index: Vec::new(),
            value: None,
        }
    }
}

impl<I: Copy> RowBlock<I> {
    /// Number of rows
    pub fn size(&self) -> usize {
        self.offset.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of stored entries
    pub fn nnz(&self) -> usize {
        self.index.len()
    }

    /// Entries of row `i` as `(index, value)` pairs.
    pub fn row(&self, i: usize) -> impl Iterator<Item = (I, f32)> + '_ {
        let range = self.offset[i]..self.offset[i + 1];
        range.map(move |j| {
            let v = self.value.as_ref().map_or(1.0, |vals| vals[j]);
            (self.index[j], v)
        })
    }

    /// Append a row; `values` must be empty for binary blocks.
    pub fn push_row(&mut self, label: f32, indices: &[I], values: &[f32]) {
        let prior = self.index.len();
        self.label.push(label);
        self.index.extend_from_slice(indices);
        if !values.is_empty() || self.value.is_some() {
            let vals = self.value.get_or_insert_with(|| vec![1.0; prior]);
            if values.is_empty() {
                vals.extend(std::iter::repeat(1.0).take(indices.len()));
            } else {
                vals.extend_from_slice(values);
            }
        }
        self.offset.push(self.index.len());
    }

    /// Approximate in-memory size, used for chunk bounds.
    pub fn mem_bytes(&self) -> usize {
        self.offset.len() * std::mem::size_of::<usize>()
            + self.label.len() * std::mem::size_of::<f32>()
            + self.index.len() * std::mem::size_of::<I>()
            + self.value.as_ref().map_or(0, |v| v.len() * std::mem::size_of::<f32>())
    }
}
