//! # Shard Builder
//!
//! Turns one partition of a raw data source into column-major shards in the
//! data store, and reports a sampled histogram of feature-bucket frequencies.
//!
//! For every row block read:
//! 1. every 10th row is counted into the bucket histogram,
//! 2. feature ids are compacted into a dense local numbering,
//! 3. the compacted block is transposed,
//! 4. `{i}_data`, `{i}_feaids` and `{i}_label` are pushed to the store,
//! 5. for training data, the shard's `(feaids, feacnt)` are folded into the
//!    worker's feature accumulator, kept under `feaids` / `feacnt`.

use crate::data_store::{shard_key, Blob, DataStore};
use crate::feature_map::{bucket_of, validate_nbit, GlobalFeatureTable};
use crate::localizer::Localizer;
use crate::model::{Job, JobKind, PrepareStats};
use crate::reader::SourceOpener;
use crate::spmt::transpose;
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Only one row in this many contributes to the bucket histogram.
pub const SAMPLE_STRIDE: usize = 10;

pub const DATA_FIELD: &str = "data";
pub const FEAIDS_FIELD: &str = "feaids";
pub const LABEL_FIELD: &str = "label";
pub const ACC_FEAIDS_KEY: &str = "feaids";
pub const ACC_FEACNT_KEY: &str = "feacnt";

/// Where a shard lives and how big it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardInfo {
    pub index: usize,
    pub num_rows: usize,
    pub num_cols: usize,
}

pub struct ShardBuilder {
    store: Arc<dyn DataStore>,
    nbit: u32,
    chunk_bytes: usize,
    next_shard: usize,
    train: Vec<ShardInfo>,
    val: Vec<ShardInfo>,
    accumulator: GlobalFeatureTable,
}

impl ShardBuilder {
    pub fn new(store: Arc<dyn DataStore>, nbit: u32, chunk_bytes: usize) -> Result<Self> {
        validate_nbit(nbit)?;
        Ok(Self {
            store,
            nbit,
            chunk_bytes,
            next_shard: 0,
            train: Vec::new(),
            val: Vec::new(),
            accumulator: GlobalFeatureTable::new(),
        })
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub fn train_shards(&self) -> &[ShardInfo] {
        &self.train
    }

    pub fn val_shards(&self) -> &[ShardInfo] {
        &self.val
    }

    /// Feature ids and counts over every training shard built so far.
    pub fn accumulator(&self) -> &GlobalFeatureTable {
        &self.accumulator
    }

    /// Build the shards of `job`'s partition.
    ///
    /// On error the shards pushed by this job are removed again and the
    /// accumulator is left as it was.
    pub fn build(&mut self, job: &Job, opener: &dyn SourceOpener) -> Result<PrepareStats> {
        if !job.kind.is_prepare() {
            bail!("{} is not a preparation job", job.kind);
        }
        let first_shard = self.next_shard;
        let mut built = Vec::new();
        let mut acc = self.accumulator.clone();

        match self.build_inner(job, opener, &mut built, &mut acc) {
            Ok(stats) => {
                if job.kind == JobKind::PrepareTrain {
                    self.publish_accumulator(&acc)?;
                    self.accumulator = acc;
                    self.train.extend(built);
                } else {
                    self.val.extend(built);
                }
                info!(
                    worker = %job.worker,
                    kind = %job.kind,
                    shards = stats.num_shards,
                    rows = stats.rows_read,
                    sampled = stats.rows_sampled,
                    "prepared data"
                );
                Ok(stats)
            }
            Err(err) => {
                for shard in &built {
                    for field in [DATA_FIELD, FEAIDS_FIELD, LABEL_FIELD] {
                        let key = shard_key(shard.index, field);
                        if let Err(remove_err) = self.store.remove(&key) {
                            warn!(worker = %job.worker, key = %key, error = %remove_err, "rollback could not remove shard field");
                        }
                    }
                }
                self.next_shard = first_shard;
                warn!(worker = %job.worker, kind = %job.kind, error = %err, "preparation failed");
                Err(err)
            }
        }
    }

    fn build_inner(
        &mut self,
        job: &Job,
        opener: &dyn SourceOpener,
        built: &mut Vec<ShardInfo>,
        acc: &mut GlobalFeatureTable,
    ) -> Result<PrepareStats> {
        let blocks = opener
            .open(&job.source_ref, job.part_index, job.part_count, self.chunk_bytes)
            .with_context(|| format!("open {} part {}", job.source_ref, job.part_index))?;

        let mut hist = vec![0f32; 1usize << self.nbit];
        let mut rows_sampled = 0u64;
        let mut rows_read = 0u64;
        let mut localizer = Localizer::new();

        for block in blocks {
            let block = block?;
            if block.is_empty() {
                continue;
            }
            for i in (0..block.size()).step_by(SAMPLE_STRIDE) {
                for (id, _) in block.row(i) {
                    hist[bucket_of(id, self.nbit)] += 1.0;
                }
                rows_sampled += 1;
            }
            rows_read += block.size() as u64;

            let compacted = localizer.compact(&block);
            let num_cols = compacted.feaids.len();
            let transposed = transpose(&compacted.block, num_cols);

            let index = self.next_shard;
            self.next_shard += 1;
            let feaids = Arc::new(compacted.feaids);
            self.store
                .push(&shard_key(index, DATA_FIELD), Blob::Block(Arc::new(transposed)))?;
            self.store
                .push(&shard_key(index, FEAIDS_FIELD), Blob::FeatureIds(Arc::clone(&feaids)))?;
            self.store
                .push(&shard_key(index, LABEL_FIELD), Blob::Reals(Arc::new(block.label.clone())))?;
            built.push(ShardInfo {
                index,
                num_rows: block.size(),
                num_cols,
            });

            if job.kind == JobKind::PrepareTrain {
                acc.fold(&feaids, &compacted.feacnt)
                    .with_context(|| format!("fold shard {index}"))?;
            }
            debug!(shard = index, rows = block.size(), cols = num_cols, "built shard");
        }

        if rows_sampled > 0 {
            for h in hist.iter_mut() {
                *h /= rows_sampled as f32;
            }
        }

        Ok(PrepareStats {
            feablk_avg: hist,
            rows_sampled,
            rows_read,
            num_shards: built.len(),
        })
    }

    fn publish_accumulator(&self, acc: &GlobalFeatureTable) -> Result<()> {
        self.store
            .push(ACC_FEAIDS_KEY, Blob::FeatureIds(Arc::new(acc.ids().to_vec())))?;
        self.store
            .push(ACC_FEACNT_KEY, Blob::Reals(Arc::new(acc.counts().to_vec())))?;
        Ok(())
    }
}
