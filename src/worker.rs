//! # Worker
//!
//! Block coordinate descent on one worker. A worker keeps its shards in the
//! data store between jobs and talks to the parameter server through a
//! [`ModelStore`].
//!
//! Training walks the feature blocks in order. For each block the worker
//! pulls the current weights of the block's keys, computes the loss gradient
//! of every local column in the block, pushes the union of those gradients
//! and pulls the updated weights. Cached margins are corrected whenever a
//! pulled weight differs from the last one seen.

use crate::config::LearnerSection;
use crate::data_store::{shard_key, DataStore};
use crate::feature_map::{FeatureMap, FILTERED};
use crate::kv_union::{key_union, kv_union, AssignOp, KvMerged, KvSlice};
use crate::loss::Loss;
use crate::model::{FeatureId, Job, JobKind, JobResult, Metrics, NodeId, RowBlock, RESERVED_FEATURE_ID};
use crate::reader::SourceOpener;
use crate::server::{KvPairs, ModelStore, ValueKind};
use crate::shard_builder::{ShardBuilder, ShardInfo, DATA_FIELD, FEAIDS_FIELD, LABEL_FIELD};
use anyhow::{bail, ensure, Context, Result};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Key pushed with a zero gradient for a block that has no local keys, so a
/// synchronous round still gets one push from every worker.
pub const ANCHOR_KEY: FeatureId = RESERVED_FEATURE_ID;

/// Runs the jobs issued to one worker node.
pub trait JobHandler: Send {
    fn process(&mut self, job: &Job) -> Result<JobResult>;
}

/// A training shard with its cached margins.
struct TrainShard {
    columns: Arc<RowBlock<u32>>,
    labels: Arc<Vec<f32>>,
    feaids: Arc<Vec<FeatureId>>,
    /// Dense index of each column, [`FILTERED`] when dropped
    dense: Vec<u32>,
    /// Columns of each feature block, increasing
    block_cols: Vec<Vec<u32>>,
    margins: Vec<f32>,
}

impl TrainShard {
    fn load(store: &dyn DataStore, info: &ShardInfo, map: &FeatureMap) -> Result<Self> {
        let columns = store.pull_block(&shard_key(info.index, DATA_FIELD))?;
        let feaids = store.pull_feature_ids(&shard_key(info.index, FEAIDS_FIELD))?;
        let labels = store.pull_reals(&shard_key(info.index, LABEL_FIELD))?;
        ensure!(
            columns.size() == feaids.len(),
            "shard {} has {} columns but {} feature ids",
            info.index,
            columns.size(),
            feaids.len()
        );

        let dense = map
            .remap(&feaids)
            .with_context(|| format!("remap shard {}", info.index))?;
        let mut block_cols = vec![Vec::new(); map.num_blocks()];
        for (col, &d) in dense.iter().enumerate() {
            if let Some(block) = map.block_of(d) {
                block_cols[block].push(col as u32);
            }
        }
        let margins = vec![0.0; labels.len()];
        Ok(Self {
            columns,
            labels,
            feaids,
            dense,
            block_cols,
            margins,
        })
    }

    fn block_keys(&self, block: usize) -> Vec<FeatureId> {
        self.block_cols[block]
            .iter()
            .map(|&c| self.feaids[c as usize])
            .collect()
    }

    /// Scaled loss gradient of each column of `block`.
    fn block_gradient(&self, block: usize, loss: &dyn Loss, scale: f32) -> KvMerged<FeatureId, f32> {
        let cols = &self.block_cols[block];
        let mut out = KvMerged {
            keys: Vec::with_capacity(cols.len()),
            vals: Vec::with_capacity(cols.len()),
            lens: Vec::new(),
        };
        for &c in cols {
            let mut g = 0.0;
            for (row, x) in self.columns.row(c as usize) {
                let r = row as usize;
                g += loss.gradient(self.labels[r], self.margins[r]) * x;
            }
            out.keys.push(self.feaids[c as usize]);
            out.vals.push(g * scale);
        }
        out
    }

    fn apply_deltas(&mut self, block: usize, deltas: &FxHashMap<u32, f32>) {
        for &c in &self.block_cols[block] {
            if let Some(&delta) = deltas.get(&self.dense[c as usize]) {
                for (row, x) in self.columns.row(c as usize) {
                    self.margins[row as usize] += delta * x;
                }
            }
        }
    }

    fn metrics(&self, loss: &dyn Loss) -> Metrics {
        evaluate(&self.labels, &self.margins, loss)
    }
}

fn evaluate(labels: &[f32], margins: &[f32], loss: &dyn Loss) -> Metrics {
    let mut m = Metrics::default();
    for (&y, &margin) in labels.iter().zip(margins) {
        m.objective += f64::from(loss.objective(y, margin));
        m.num_examples += 1;
        if loss.is_correct(y, margin) {
            m.num_correct += 1;
        }
    }
    m
}

/// Training state that exists once the feature map was built.
struct Trainer {
    map: FeatureMap,
    shards: Vec<TrainShard>,
    /// Last weight seen per dense index; slot 0 is unused
    seen: Vec<f32>,
    num_rows: usize,
}

pub struct BcdWorker {
    node: NodeId,
    tail_feature_filter: f32,
    nbit: u32,
    builder: ShardBuilder,
    opener: Arc<dyn SourceOpener>,
    model: Arc<dyn ModelStore>,
    loss: Arc<dyn Loss>,
    trainer: Option<Trainer>,
}

impl BcdWorker {
    pub fn new(
        node: NodeId,
        config: &LearnerSection,
        store: Arc<dyn DataStore>,
        opener: Arc<dyn SourceOpener>,
        model: Arc<dyn ModelStore>,
        loss: Arc<dyn Loss>,
    ) -> Result<Self> {
        let builder = ShardBuilder::new(store, config.num_feature_group_bits, config.chunk_bytes)?;
        Ok(Self {
            node,
            tail_feature_filter: config.tail_feature_filter,
            nbit: config.num_feature_group_bits,
            builder,
            opener,
            model,
            loss,
            trainer: None,
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    fn prepare(&mut self, job: &Job) -> Result<JobResult> {
        let stats = self.builder.build(job, self.opener.as_ref())?;
        if job.kind == JobKind::PrepareTrain {
            // New training data invalidates the feature map.
            self.trainer = None;
            let acc = self.builder.accumulator();
            if !acc.is_empty() {
                self.model
                    .push(
                        ValueKind::FeaCount,
                        KvPairs::new(acc.ids().to_vec(), acc.counts().to_vec()),
                    )
                    .context("push feature counts")?;
            }
        }
        Ok(JobResult::Prepare(stats))
    }

    /// Pull the global counts of local features and remap every shard.
    fn build_trainer(&self) -> Result<Trainer> {
        let acc = self.builder.accumulator();
        let counts = if acc.is_empty() {
            Vec::new()
        } else {
            let pulled = self
                .model
                .pull(ValueKind::FeaCount, acc.ids().to_vec())
                .context("pull feature counts")?;
            ensure!(
                pulled.vals.len() == acc.len(),
                "pulled {} counts for {} features",
                pulled.vals.len(),
                acc.len()
            );
            pulled.vals
        };
        let map = FeatureMap::build(acc.ids(), &counts, self.tail_feature_filter, self.nbit)?;

        let store = self.builder.store();
        let shards = self
            .builder
            .train_shards()
            .iter()
            .map(|info| TrainShard::load(store.as_ref(), info, &map))
            .collect::<Result<Vec<_>>>()?;
        let num_rows = shards.iter().map(|s| s.labels.len()).sum();
        info!(
            worker = %self.node,
            local = acc.len(),
            kept = map.len(),
            blocks = map.num_blocks(),
            shards = shards.len(),
            "built feature map"
        );
        Ok(Trainer {
            seen: vec![0.0; map.len() + 1],
            map,
            shards,
            num_rows,
        })
    }

    fn train(&mut self) -> Result<JobResult> {
        if self.trainer.is_none() {
            self.trainer = Some(self.build_trainer()?);
        }
        let Some(trainer) = self.trainer.as_mut() else {
            bail!("{}: trainer unavailable", self.node);
        };
        let loss = self.loss.as_ref();
        let model = self.model.as_ref();
        let scale = 1.0 / trainer.num_rows.max(1) as f32;

        for block in 0..trainer.map.num_blocks() {
            let keys = trainer
                .shards
                .iter()
                .fold(Vec::new(), |acc, s| key_union(&acc, &s.block_keys(block)));
            if keys.is_empty() {
                model
                    .push(ValueKind::Gradient, KvPairs::new(vec![ANCHOR_KEY], vec![0.0]))
                    .with_context(|| format!("push anchor of block {block}"))?;
                continue;
            }

            let current = model.pull(ValueKind::Weight, keys.clone())?;
            trainer.apply_weights(block, &current)?;

            let grads = trainer
                .shards
                .par_iter()
                .map(|s| s.block_gradient(block, loss, scale))
                .collect::<Vec<_>>();
            let mut merged = KvMerged::default();
            for g in &grads {
                merged = kv_union(
                    KvSlice::new(&merged.keys, &merged.vals, &merged.lens),
                    KvSlice::new(&g.keys, &g.vals, &g.lens),
                    AssignOp::Plus,
                )?;
            }
            model
                .push(ValueKind::Gradient, KvPairs::new(merged.keys, merged.vals))
                .with_context(|| format!("push gradient of block {block}"))?;

            let updated = model.pull(ValueKind::Weight, keys)?;
            trainer.apply_weights(block, &updated)?;
            debug!(worker = %self.node, block, keys = updated.keys.len(), "updated block");
        }

        let metrics = trainer
            .shards
            .par_iter()
            .map(|s| s.metrics(loss))
            .reduce(Metrics::default, |mut a, b| {
                a.merge(&b);
                a
            });
        Ok(JobResult::Train(metrics))
    }

    fn validate(&self) -> Result<JobResult> {
        let store = self.builder.store();
        let loss = self.loss.as_ref();
        let model = self.model.as_ref();
        let per_shard = self
            .builder
            .val_shards()
            .par_iter()
            .map(|info| -> Result<Metrics> {
                let columns = store.pull_block(&shard_key(info.index, DATA_FIELD))?;
                let feaids = store.pull_feature_ids(&shard_key(info.index, FEAIDS_FIELD))?;
                let labels = store.pull_reals(&shard_key(info.index, LABEL_FIELD))?;
                let mut margins = vec![0.0f32; labels.len()];
                if !feaids.is_empty() {
                    let weights = model.pull(ValueKind::Weight, feaids.to_vec())?;
                    for (c, &w) in weights.vals.iter().enumerate() {
                        if w == 0.0 {
                            continue;
                        }
                        for (row, x) in columns.row(c) {
                            margins[row as usize] += w * x;
                        }
                    }
                }
                Ok(evaluate(&labels, &margins, loss))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut metrics = Metrics::default();
        for m in &per_shard {
            metrics.merge(m);
        }
        Ok(JobResult::Validate(metrics))
    }
}

impl Trainer {
    /// Record pulled weights and shift the margins by any change.
    fn apply_weights(&mut self, block: usize, pulled: &KvPairs) -> Result<()> {
        ensure!(
            pulled.keys.len() == pulled.vals.len(),
            "pulled {} weights for {} keys",
            pulled.vals.len(),
            pulled.keys.len()
        );
        let mut deltas = FxHashMap::default();
        for (&key, &w) in pulled.keys.iter().zip(&pulled.vals) {
            let d = self.map.local_index(key);
            if d == FILTERED {
                continue;
            }
            let delta = w - self.seen[d as usize];
            if delta != 0.0 {
                self.seen[d as usize] = w;
                deltas.insert(d, delta);
            }
        }
        if !deltas.is_empty() {
            self.shards
                .par_iter_mut()
                .for_each(|s| s.apply_deltas(block, &deltas));
        }
        Ok(())
    }
}

impl JobHandler for BcdWorker {
    #[instrument(skip(self, job), fields(worker = %self.node, kind = %job.kind, epoch = job.epoch))]
    fn process(&mut self, job: &Job) -> Result<JobResult> {
        match job.kind {
            JobKind::PrepareTrain | JobKind::PrepareVal => self.prepare(job),
            JobKind::Train => self.train(),
            JobKind::Validate => self.validate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_store::MemDataStore;
    use crate::loss::LogitLoss;
    use crate::reader::MemorySource;
    use crate::server::ServerError;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// A model held in the test, with SGD applied on gradient pushes.
    #[derive(Default)]
    struct FakeModel {
        weights: Mutex<BTreeMap<FeatureId, f32>>,
        counts: Mutex<BTreeMap<FeatureId, f32>>,
        pushes: Mutex<Vec<(ValueKind, Vec<FeatureId>)>>,
    }

    impl ModelStore for FakeModel {
        fn push(&self, kind: ValueKind, kv: KvPairs) -> Result<()> {
            self.pushes.lock().push((kind, kv.keys.clone()));
            let target = match kind {
                ValueKind::FeaCount => &self.counts,
                _ => &self.weights,
            };
            let mut map = target.lock();
            for (k, v) in kv.keys.into_iter().zip(kv.vals) {
                let entry = map.entry(k).or_default();
                match kind {
                    ValueKind::Gradient => *entry -= v,
                    _ => *entry += v,
                }
            }
            Ok(())
        }

        fn pull(&self, kind: ValueKind, keys: Vec<FeatureId>) -> Result<KvPairs> {
            if keys.is_empty() {
                return Err(ServerError::Protocol("no keys".into()).into());
            }
            let map = match kind {
                ValueKind::FeaCount => self.counts.lock(),
                _ => self.weights.lock(),
            };
            let vals = keys.iter().map(|k| map.get(k).copied().unwrap_or(0.0)).collect();
            Ok(KvPairs::new(keys, vals))
        }
    }

    fn job(kind: JobKind, source: &str) -> Job {
        Job {
            kind,
            source_ref: source.to_string(),
            part_index: 0,
            part_count: 1,
            worker: NodeId(0),
            epoch: 0,
        }
    }

    fn separable_block() -> RowBlock<FeatureId> {
        // feature 16 marks positives, 33 negatives, 50 is shared noise
        let mut b = RowBlock::default();
        for i in 0..40 {
            if i % 2 == 0 {
                b.push_row(1.0, &[16, 50], &[]);
            } else {
                b.push_row(-1.0, &[33, 50], &[]);
            }
        }
        b
    }

    fn worker(nbit: u32, filter: f32) -> (BcdWorker, Arc<FakeModel>, Arc<MemorySource>) {
        let config = LearnerSection {
            num_feature_group_bits: nbit,
            tail_feature_filter: filter,
            ..LearnerSection::default()
        };
        let model = Arc::new(FakeModel::default());
        let source = Arc::new(MemorySource::new());
        let worker = BcdWorker::new(
            NodeId(0),
            &config,
            Arc::new(MemDataStore::new()),
            source.clone(),
            model.clone(),
            Arc::new(LogitLoss),
        )
        .unwrap();
        (worker, model, source)
    }

    #[test]
    fn test_prepare_train_pushes_feature_counts() {
        let (mut worker, model, source) = worker(0, 0.0);
        source.insert("train", vec![separable_block()]);
        let result = worker.process(&job(JobKind::PrepareTrain, "train")).unwrap();
        assert!(matches!(result, JobResult::Prepare(ref s) if s.rows_read == 40));
        assert_eq!(model.counts.lock().get(&50), Some(&40.0));
        assert_eq!(model.pushes.lock()[0].0, ValueKind::FeaCount);
    }

    #[test]
    fn test_training_reduces_objective_and_validates() {
        let (mut worker, model, source) = worker(4, 0.0);
        source.insert("train", vec![separable_block()]);
        source.insert("val", vec![separable_block()]);
        worker.process(&job(JobKind::PrepareTrain, "train")).unwrap();
        worker.process(&job(JobKind::PrepareVal, "val")).unwrap();

        let mut objectives = Vec::new();
        for _ in 0..5 {
            match worker.process(&job(JobKind::Train, "")).unwrap() {
                JobResult::Train(m) => objectives.push(m.mean_objective()),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(objectives.windows(2).all(|w| w[1] < w[0]), "{objectives:?}");
        assert!(*model.weights.lock().get(&16).unwrap() > 0.0);
        assert!(*model.weights.lock().get(&33).unwrap() < 0.0);

        match worker.process(&job(JobKind::Validate, "")).unwrap() {
            JobResult::Validate(m) => {
                assert_eq!(m.num_examples, 40);
                assert_eq!(m.accuracy(), 1.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_every_block_pushes_once_with_anchor_for_empty_blocks() {
        let (mut worker, model, source) = worker(4, 0.0);
        source.insert("train", vec![separable_block()]);
        worker.process(&job(JobKind::PrepareTrain, "train")).unwrap();
        worker.process(&job(JobKind::Train, "")).unwrap();

        let pushes = model.pushes.lock();
        let grads: Vec<_> = pushes.iter().filter(|(k, _)| *k == ValueKind::Gradient).collect();
        assert_eq!(grads.len(), 16);
        // ids 16 and 33 and 50 fall into buckets 0, 1 and 2
        assert_eq!(grads[0].1, vec![16]);
        assert_eq!(grads[1].1, vec![33]);
        assert_eq!(grads[2].1, vec![50]);
        assert!(grads[3..].iter().all(|(_, keys)| keys == &vec![ANCHOR_KEY]));
    }

    #[test]
    fn test_tail_filter_drops_rare_features() {
        let (mut worker, model, source) = worker(0, 0.0);
        let mut block = separable_block();
        block.push_row(1.0, &[99], &[]);
        source.insert("train", vec![block]);
        worker.process(&job(JobKind::PrepareTrain, "train")).unwrap();
        // raise the global counts of everything but 99 past the filter
        worker.tail_feature_filter = 1.0;
        worker.process(&job(JobKind::Train, "")).unwrap();
        let pushes = model.pushes.lock();
        let (_, keys) = pushes.iter().find(|(k, _)| *k == ValueKind::Gradient).unwrap();
        assert_eq!(keys, &vec![16, 33, 50]);
    }
}
