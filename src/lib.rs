//! # sparsebcd-rs
//!
//! Distributed training core of a sparse-model learner based on block
//! coordinate descent over a parameter server.
//!
//! The scheduler drives workers through data preparation, training and
//! validation epochs. Workers turn their data partition into column-major
//! shards, then repeatedly pull weights, compute gradients for one feature
//! block at a time and push them to the parameter server. The server applies
//! pushes immediately, or in synchronous mode merges one push per worker into
//! a single update.
//!
//! Everything can run in one process through [`cluster::LocalCluster`].

pub mod cluster;
pub mod config;
pub mod data_store;
pub mod executor;
pub mod feature_map;
pub mod kv_union;
pub mod localizer;
pub mod loss;
pub mod model;
pub mod reader;
pub mod scheduler;
pub mod server;
pub mod shard_builder;
pub mod spmt;
#[doc(hidden)]
pub mod test_support;
pub mod tracker;
pub mod updater;
pub mod worker;

// Re-export main types for convenience
pub use cluster::LocalCluster;
pub use config::{ConfigError, LearnerConfig};
pub use executor::{Executor, ExecutorError};
pub use feature_map::{FeatureMap, GlobalFeatureTable};
pub use kv_union::{kv_match, kv_union, AssignOp, KvError, KvMerged, KvSlice};
pub use model::{FeatureId, Job, JobKind, JobResult, Metrics, NodeId, PrepareStats, RowBlock};
pub use scheduler::{EpochController, ScheduleReport};
pub use server::{ModelStore, ParameterServer, ServerError};
pub use worker::{BcdWorker, JobHandler};
