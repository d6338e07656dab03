//! Sparse matrix transpose.

use crate::model::RowBlock;

/// Transpose a CSR block with `num_cols` columns into column-major layout.
///
/// In the result, "row" `c` lists the rows that have an entry in column `c`,
/// in increasing row order. Labels are not carried over since they belong to
/// rows, not columns.
pub fn transpose(block: &RowBlock<u32>, num_cols: usize) -> RowBlock<u32> {
    let mut offset = vec![0usize; num_cols + 1];
    for &col in &block.index {
        offset[col as usize + 1] += 1;
    }
    for c in 0..num_cols {
        offset[c + 1] += offset[c];
    }

    let nnz = block.nnz();
    let mut index = vec![0u32; nnz];
    let mut value = block.value.as_ref().map(|_| vec![0f32; nnz]);
    let mut cursor = offset.clone();

    for row in 0..block.size() {
        for j in block.offset[row]..block.offset[row + 1] {
            let col = block.index[j] as usize;
            let pos = cursor[col];
            index[pos] = row as u32;
            if let (Some(dst), Some(src)) = (value.as_mut(), block.value.as_ref()) {
                dst[pos] = src[j];
            }
            cursor[col] += 1;
        }
    }

    RowBlock {
        offset,
        label: Vec::new(),
        index,
        value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transpose_small_block() {
        // rows: [0:1.0, 2:2.0], [1:3.0], [0:4.0, 1:5.0]
        let block = RowBlock {
            offset: vec![0, 2, 3, 5],
            label: vec![1.0, -1.0, 1.0],
            index: vec![0, 2, 1, 0, 1],
            value: Some(vec![1.0, 2.0, 3.0, 4.0, 5.0]),
        };
        let t = transpose(&block, 3);
        assert_eq!(t.offset, vec![0, 2, 4, 5]);
        assert_eq!(t.index, vec![0, 2, 1, 2, 0]);
        assert_eq!(t.value, Some(vec![1.0, 4.0, 3.0, 5.0, 2.0]));
    }

    #[test]
    fn test_transpose_twice_restores_binary_block() {
        let block = RowBlock {
            offset: vec![0, 1, 3],
            label: vec![1.0, 1.0],
            index: vec![1, 0, 1],
            value: None,
        };
        let back = transpose(&transpose(&block, 2), 2);
        assert_eq!(back.offset, block.offset);
        assert_eq!(back.index, block.index);
        assert!(back.value.is_none());
    }
}
