//! # Data Source Readers
//!
//! A source is opened for one partition and yields its rows as a lazy,
//! single-pass sequence of row blocks, each bounded by a byte budget.
//!
//! Two sources are provided: libsvm text files split into line-aligned byte
//! ranges, and an in-memory source used by tests and local runs.

use crate::model::{FeatureId, RowBlock, RESERVED_FEATURE_ID};
use anyhow::{anyhow, Context, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;
use tracing::{debug, warn};

pub type BlockIter = Box<dyn Iterator<Item = Result<RowBlock<FeatureId>>> + Send>;

/// Opens a partition of a data source.
pub trait SourceOpener: Send + Sync {
    fn open(
        &self,
        source_ref: &str,
        part_index: usize,
        part_count: usize,
        chunk_bytes: usize,
    ) -> Result<BlockIter>;
}

/// Reads libsvm formatted text files: `label id[:value] id[:value] ...`.
#[derive(Debug, Default, Clone)]
pub struct LibsvmOpener;

impl SourceOpener for LibsvmOpener {
    fn open(
        &self,
        source_ref: &str,
        part_index: usize,
        part_count: usize,
        chunk_bytes: usize,
    ) -> Result<BlockIter> {
        if part_count == 0 || part_index >= part_count {
            return Err(anyhow!(
                "invalid partition {part_index} of {part_count} for {source_ref}"
            ));
        }
        let path = PathBuf::from(source_ref);
        let file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
        let size = file.metadata()?.len();
        let start = size * part_index as u64 / part_count as u64;
        let end = size * (part_index as u64 + 1) / part_count as u64;

        let mut reader = BufReader::new(file);
        let mut pos = start;
        if start > 0 {
            // A line belongs to the partition holding its first byte.
            reader.seek(SeekFrom::Start(start - 1))?;
            let mut partial = Vec::new();
            let n = reader.read_until(b'\n', &mut partial)?;
            pos = start - 1 + n as u64;
        }
        debug!(
            path = %path.display(),
            part_index,
            part_count,
            start = pos,
            end,
            "opened libsvm partition"
        );

        Ok(Box::new(LibsvmChunks {
            reader,
            path,
            pos,
            end,
            chunk_bytes: chunk_bytes.max(1),
            done: false,
            skipped: 0,
        }))
    }
}

struct LibsvmChunks {
    reader: BufReader<File>,
    path: PathBuf,
    pos: u64,
    end: u64,
    chunk_bytes: usize,
    done: bool,
    skipped: u64,
}

impl LibsvmChunks {
    fn read_chunk(&mut self) -> Result<RowBlock<FeatureId>> {
        let mut block = RowBlock::default();
        let mut consumed = 0usize;
        let mut line = Vec::new();
        let mut indices = Vec::new();
        let mut values = Vec::new();

        while self.pos < self.end && consumed < self.chunk_bytes {
            line.clear();
            let n = self.reader.read_until(b'\n', &mut line)?;
            if n == 0 {
                self.pos = self.end;
                break;
            }
            self.pos += n as u64;
            consumed += n;

            let Ok(text) = std::str::from_utf8(&line) else {
                self.skipped += 1;
                warn!(path = %self.path.display(), offset = self.pos - n as u64, "skipping row that is not utf-8");
                continue;
            };
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match parse_libsvm_line(trimmed, &mut indices, &mut values) {
                Some(label) => {
                    let vals: &[f32] = if values.iter().all(|&v| v == 1.0) {
                        &[]
                    } else {
                        &values
                    };
                    block.push_row(label, &indices, vals);
                }
                None => {
                    self.skipped += 1;
                    warn!(path = %self.path.display(), line = trimmed, "skipping malformed row");
                }
            }
        }
        Ok(block)
    }
}

impl Iterator for LibsvmChunks {
    type Item = Result<RowBlock<FeatureId>>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            if self.pos >= self.end {
                self.done = true;
                if self.skipped > 0 {
                    warn!(path = %self.path.display(), skipped = self.skipped, "partition had malformed rows");
                }
                return None;
            }
            match self.read_chunk() {
                Ok(block) if block.is_empty() => continue,
                Ok(block) => return Some(Ok(block)),
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

/// Parse one libsvm row into `indices` / `values`, returning the label.
/// Rows using [`RESERVED_FEATURE_ID`] are malformed.
fn parse_libsvm_line(line: &str, indices: &mut Vec<FeatureId>, values: &mut Vec<f32>) -> Option<f32> {
    indices.clear();
    values.clear();
    let mut tokens = line.split_whitespace();
    let label: f32 = tokens.next()?.parse().ok()?;
    for token in tokens {
        let (id, value) = match token.split_once(':') {
            Some((id, value)) => (id.parse().ok()?, value.parse().ok()?),
            None => (token.parse().ok()?, 1.0),
        };
        if id == RESERVED_FEATURE_ID {
            return None;
        }
        indices.push(id);
        values.push(value);
    }
    Some(label)
}

/// Serves pre-built row blocks registered under a source name.
///
/// Block `i` of a source belongs to partition `i % part_count`.
#[derive(Debug, Default)]
pub struct MemorySource {
    sources: RwLock<HashMap<String, Vec<RowBlock<FeatureId>>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, blocks: Vec<RowBlock<FeatureId>>) {
        self.sources.write().insert(name.into(), blocks);
    }
}

impl SourceOpener for MemorySource {
    fn open(
        &self,
        source_ref: &str,
        part_index: usize,
        part_count: usize,
        _chunk_bytes: usize,
    ) -> Result<BlockIter> {
        if part_count == 0 || part_index >= part_count {
            return Err(anyhow!(
                "invalid partition {part_index} of {part_count} for {source_ref}"
            ));
        }
        let sources = self.sources.read();
        let blocks = sources
            .get(source_ref)
            .ok_or_else(|| anyhow!("unknown source {source_ref}"))?;
        let part: Vec<RowBlock<FeatureId>> = blocks
            .iter()
            .enumerate()
            .filter(|(i, _)| i % part_count == part_index)
            .map(|(_, b)| b.clone())
            .collect();
        Ok(Box::new(part.into_iter().map(Ok)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_source(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    fn collect_rows(opener: &LibsvmOpener, path: &str, part: usize, parts: usize, chunk: usize) -> Vec<RowBlock<FeatureId>> {
        opener
            .open(path, part, parts, chunk)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_parse_line_forms() {
        let mut idx = Vec::new();
        let mut val = Vec::new();
        assert_eq!(parse_libsvm_line("1 3:0.5 7", &mut idx, &mut val), Some(1.0));
        assert_eq!(idx, vec![3, 7]);
        assert_eq!(val, vec![0.5, 1.0]);
        assert_eq!(parse_libsvm_line("x 3:1", &mut idx, &mut val), None);
        assert_eq!(parse_libsvm_line("1 3:abc", &mut idx, &mut val), None);
        assert_eq!(parse_libsvm_line("1 18446744073709551615:1", &mut idx, &mut val), None);
    }

    #[test]
    fn test_invalid_utf8_row_is_skipped() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"1 1:1\n-1 2\xff:1\n1 3:1\n").unwrap();
        let path = file.path().to_str().unwrap();
        let blocks = collect_rows(&LibsvmOpener, path, 0, 1, 1 << 20);
        let ids: Vec<FeatureId> = blocks.iter().flat_map(|b| b.index.iter().copied()).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(blocks.iter().map(|b| b.size()).sum::<usize>(), 2);
    }

    #[test]
    fn test_partitions_cover_every_row_once() {
        let lines: Vec<String> = (0..37).map(|i| format!("{} {}:1 {}:1", i % 2, i, i + 100)).collect();
        let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
        let file = write_source(&refs);
        let path = file.path().to_str().unwrap();
        let opener = LibsvmOpener;

        let mut seen = Vec::new();
        for part in 0..4 {
            for block in collect_rows(&opener, path, part, 4, 64) {
                for row in 0..block.size() {
                    seen.push(block.row(row).next().unwrap().0);
                }
            }
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..37).collect::<Vec<u64>>());
    }

    #[test]
    fn test_chunk_bound_splits_blocks_and_skips_malformed() {
        let file = write_source(&["1 1:1", "bad row", "-1 2", "1 3:2.5", "", "-1 4"]);
        let path = file.path().to_str().unwrap();
        let blocks = collect_rows(&LibsvmOpener, path, 0, 1, 8);
        let rows: usize = blocks.iter().map(|b| b.size()).sum();
        assert_eq!(rows, 4);
        assert!(blocks.len() > 1);
        assert!(blocks.iter().any(|b| b.value.as_ref().map_or(false, |v| v.contains(&2.5))));
    }

    #[test]
    fn test_memory_source_partitions_by_block() {
        let source = MemorySource::new();
        let blocks: Vec<RowBlock<FeatureId>> = (0..5)
            .map(|i| {
                let mut b = RowBlock::default();
                b.push_row(1.0, &[i], &[]);
                b
            })
            .collect();
        source.insert("train", blocks);

        let part1: Vec<_> = source
            .open("train", 1, 2, 0)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(part1.len(), 2);
        assert_eq!(part1[0].index, vec![1]);
        assert!(source.open("missing", 0, 1, 0).is_err());
    }
}
