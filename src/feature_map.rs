//! # Feature Map
//!
//! Feature statistics and the dense renumbering used by block coordinate
//! descent.
//!
//! * [`GlobalFeatureTable`] accumulates `(feature id, count)` pairs as the
//!   sorted union of every shard folded into it.
//! * [`FeatureMap`] keeps the ids whose count passes the tail filter and
//!   numbers them densely from 1, ordered by feature bucket so that each of
//!   the `2^nbit` buckets is a contiguous range. Local index 0 is reserved for
//!   absent or filtered ids.

use crate::config::MAX_FEATURE_GROUP_BITS;
use crate::kv_union::{kv_match, kv_union, AssignOp, KvError, KvMerged, KvSlice};
use crate::model::FeatureId;
use anyhow::{ensure, Result};

/// Local index of a filtered or unknown feature.
pub const FILTERED: u32 = 0;

/// Check that `nbit` is a supported bucket width.
pub fn validate_nbit(nbit: u32) -> Result<()> {
    ensure!(nbit % 4 == 0, "num_feature_group_bits must be a multiple of 4, got {nbit}");
    ensure!(
        nbit <= MAX_FEATURE_GROUP_BITS,
        "num_feature_group_bits must be at most {MAX_FEATURE_GROUP_BITS}, got {nbit}"
    );
    Ok(())
}

/// Bucket of a feature id: its `nbit` low-order bits.
#[inline]
pub fn bucket_of(id: FeatureId, nbit: u32) -> usize {
    (id & ((1u64 << nbit) - 1)) as usize
}

/// Sorted union of feature ids with summed occurrence counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalFeatureTable {
    ids: Vec<FeatureId>,
    counts: Vec<f32>,
}

impl GlobalFeatureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an already sorted, duplicate-free pair of sequences.
    pub fn from_parts(ids: Vec<FeatureId>, counts: Vec<f32>) -> Result<Self, KvError> {
        if ids.len() != counts.len() {
            return Err(KvError::LengthMismatch {
                keys: ids.len(),
                vals: counts.len(),
            });
        }
        if let Some(position) = (1..ids.len()).find(|&i| ids[i - 1] >= ids[i]) {
            return Err(KvError::Unsorted { position });
        }
        Ok(Self { ids, counts })
    }

    /// Fold one shard's `(ids, counts)` into the table.
    pub fn fold(&mut self, ids: &[FeatureId], counts: &[f32]) -> Result<(), KvError> {
        if self.ids.is_empty() {
            *self = Self::from_parts(ids.to_vec(), counts.to_vec())?;
            return Ok(());
        }
        let KvMerged { keys, vals, .. } = kv_union(
            KvSlice::new(&self.ids, &self.counts, &[]),
            KvSlice::new(ids, counts, &[]),
            AssignOp::Plus,
        )?;
        self.ids = keys;
        self.counts = vals;
        Ok(())
    }

    pub fn ids(&self) -> &[FeatureId] {
        &self.ids
    }

    pub fn counts(&self) -> &[f32] {
        &self.counts
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Dense renumbering of the surviving features, grouped by bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureMap {
    /// Surviving ids in increasing raw order
    ids: Vec<FeatureId>,
    /// Local index of `ids[i]`, starting at 1
    local: Vec<u32>,
    /// `block_start[b]..block_start[b + 1]` are the local indices of bucket `b`
    block_start: Vec<u32>,
}

impl FeatureMap {
    /// Keep features with `count > threshold` and number them densely.
    ///
    /// `ids` must be strictly increasing and aligned with `counts`.
    pub fn build(ids: &[FeatureId], counts: &[f32], threshold: f32, nbit: u32) -> Result<Self> {
        validate_nbit(nbit)?;
        ensure!(
            ids.len() == counts.len(),
            "{} feature ids but {} counts",
            ids.len(),
            counts.len()
        );

        let survivors: Vec<FeatureId> = ids
            .iter()
            .zip(counts)
            .filter(|&(_, &c)| c > threshold)
            .map(|(&id, _)| id)
            .collect();
        if let Some(position) = (1..survivors.len()).find(|&i| survivors[i - 1] >= survivors[i]) {
            return Err(KvError::Unsorted { position }.into());
        }

        let num_buckets = 1usize << nbit;
        let mut block_start = vec![0u32; num_buckets + 1];
        for &id in &survivors {
            block_start[bucket_of(id, nbit) + 1] += 1;
        }
        for b in 0..num_buckets {
            block_start[b + 1] += block_start[b];
        }
        // Local numbering starts at 1.
        for start in block_start.iter_mut() {
            *start += 1;
        }

        let mut cursor = block_start.clone();
        let mut local = Vec::with_capacity(survivors.len());
        for &id in &survivors {
            let b = bucket_of(id, nbit);
            local.push(cursor[b]);
            cursor[b] += 1;
        }

        Ok(Self {
            ids: survivors,
            local,
            block_start,
        })
    }

    pub fn num_blocks(&self) -> usize {
        self.block_start.len() - 1
    }

    /// Number of surviving features.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Local index of `id`, or [`FILTERED`].
    pub fn local_index(&self, id: FeatureId) -> u32 {
        match self.ids.binary_search(&id) {
            Ok(pos) => self.local[pos],
            Err(_) => FILTERED,
        }
    }

    /// Feature block holding local index `local`, `None` for [`FILTERED`]
    /// and out-of-range indices.
    pub fn block_of(&self, local: u32) -> Option<usize> {
        if local == FILTERED || local as usize > self.ids.len() {
            return None;
        }
        // Empty blocks share their start with the next block.
        Some(self.block_start.partition_point(|&start| start <= local) - 1)
    }

    /// Map a shard's strictly increasing feature ids to local indices, with
    /// [`FILTERED`] for ids that did not survive.
    pub fn remap(&self, shard_ids: &[FeatureId]) -> Result<Vec<u32>, KvError> {
        kv_match(&self.ids, &self.local, shard_ids, FILTERED)
    }
}
