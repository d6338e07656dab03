//! # Localizer
//!
//! Compacts a row block whose feature ids live in the raw (sparse, 64-bit)
//! id space into a block indexed by dense local column numbers.

use crate::model::{FeatureId, RowBlock};
use rustc_hash::FxHashMap;

/// Result of compacting one row block.
#[derive(Debug, Clone, PartialEq)]
pub struct Compacted {
    /// The block with every index replaced by its local column number
    pub block: RowBlock<u32>,
    /// Original feature id of each local column, strictly increasing
    pub feaids: Vec<FeatureId>,
    /// Number of occurrences of each local column in the block
    pub feacnt: Vec<f32>,
}

/// Maps raw feature ids of one row block onto `0..n` local columns.
///
/// Local column `c` corresponds to `feaids[c]`, so the numbering preserves
/// the order of the raw ids.
#[derive(Debug, Default)]
pub struct Localizer {
    lookup: FxHashMap<FeatureId, u32>,
}

impl Localizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compact(&mut self, block: &RowBlock<FeatureId>) -> Compacted {
        let mut ids = block.index.clone();
        ids.sort_unstable();

        let mut feaids: Vec<FeatureId> = Vec::new();
        let mut feacnt: Vec<f32> = Vec::new();
        for id in ids {
            if feaids.last() == Some(&id) {
                if let Some(cnt) = feacnt.last_mut() {
                    *cnt += 1.0;
                }
            } else {
                feaids.push(id);
                feacnt.push(1.0);
            }
        }

        self.lookup.clear();
        self.lookup.reserve(feaids.len());
        for (col, &id) in feaids.iter().enumerate() {
            self.lookup.insert(id, col as u32);
        }

        let index = block.index.iter().map(|id| self.lookup[id]).collect();

        Compacted {
            block: RowBlock {
                offset: block.offset.clone(),
                label: block.label.clone(),
                index,
                value: block.value.clone(),
            },
            feaids,
            feacnt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_dense_ordered_numbering() {
        let mut block: RowBlock<FeatureId> = RowBlock::default();
        block.push_row(1.0, &[900, 5, 1 << 40], &[]);
        block.push_row(-1.0, &[5, 77], &[]);

        let compacted = Localizer::new().compact(&block);
        assert_eq!(compacted.feaids, vec![5, 77, 900, 1 << 40]);
        assert_eq!(compacted.feacnt, vec![2.0, 1.0, 1.0, 1.0]);
        assert_eq!(compacted.block.index, vec![2, 0, 3, 0, 1]);
        assert_eq!(compacted.block.offset, block.offset);
        assert_eq!(compacted.block.label, vec![1.0, -1.0]);
    }

    #[test]
    fn test_compact_empty_block() {
        let block: RowBlock<FeatureId> = RowBlock::default();
        let compacted = Localizer::new().compact(&block);
        assert!(compacted.feaids.is_empty());
        assert!(compacted.block.is_empty());
    }
}
