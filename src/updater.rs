//! # Updater
//!
//! The update rule applied by the parameter server. The merge engine is the
//! only caller and only calls it from the executor thread.

use crate::model::FeatureId;
use crate::server::protocol::ValueKind;
use anyhow::{anyhow, bail, ensure, Context, Result};
use hashbrown::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::debug;

/// Mutable parameter state behind the parameter server.
pub trait Updater: Send {
    /// Apply `vals` (flattened per `lens`, or uniform when empty) to `keys`.
    fn update(&mut self, keys: &[FeatureId], kind: ValueKind, vals: &[f32], lens: &[u32]) -> Result<()>;

    /// Read the values of `keys`, returning `(vals, lens)`.
    fn get(&mut self, keys: &[FeatureId], kind: ValueKind) -> Result<(Vec<f32>, Vec<u32>)>;

    /// Emit metrics after an update.
    fn report(&mut self) {}

    fn load(&mut self, reader: &mut dyn Read) -> Result<()>;

    /// Write the model; `aux` adds auxiliary state, `reverse` byte-reverses ids.
    fn dump(&self, aux: bool, reverse: bool, writer: &mut dyn Write) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Entry {
    weight: f32,
    count: f32,
}

/// Plain SGD with L2 regularization, one value per key.
#[derive(Debug, Clone)]
pub struct SgdUpdater {
    learning_rate: f32,
    l2: f32,
    entries: HashMap<FeatureId, Entry>,
    num_updates: u64,
    num_reported: u64,
}

impl SgdUpdater {
    pub fn new(learning_rate: f32, l2: f32) -> Self {
        Self {
            learning_rate,
            l2,
            entries: HashMap::new(),
            num_updates: 0,
            num_reported: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn weight(&self, id: FeatureId) -> f32 {
        self.entries.get(&id).map_or(0.0, |e| e.weight)
    }

    pub fn count(&self, id: FeatureId) -> f32 {
        self.entries.get(&id).map_or(0.0, |e| e.count)
    }

    fn check_scalar(keys: &[FeatureId], vals: &[f32], lens: &[u32]) -> Result<()> {
        ensure!(
            lens.is_empty() || lens.iter().all(|&l| l == 1),
            "sgd updater stores one value per key"
        );
        ensure!(
            keys.len() == vals.len(),
            "{} keys but {} values",
            keys.len(),
            vals.len()
        );
        Ok(())
    }
}

impl Updater for SgdUpdater {
    fn update(&mut self, keys: &[FeatureId], kind: ValueKind, vals: &[f32], lens: &[u32]) -> Result<()> {
        Self::check_scalar(keys, vals, lens)?;
        match kind {
            ValueKind::FeaCount => {
                for (&k, &v) in keys.iter().zip(vals) {
                    self.entries.entry(k).or_default().count += v;
                }
            }
            ValueKind::Gradient => {
                for (&k, &g) in keys.iter().zip(vals) {
                    let entry = self.entries.entry(k).or_default();
                    entry.weight -= self.learning_rate * (g + self.l2 * entry.weight);
                }
            }
            ValueKind::Weight => {
                for (&k, &w) in keys.iter().zip(vals) {
                    self.entries.entry(k).or_default().weight = w;
                }
            }
            ValueKind::Other(code) => bail!("unsupported value kind {code}"),
        }
        self.num_updates += 1;
        Ok(())
    }

    fn get(&mut self, keys: &[FeatureId], kind: ValueKind) -> Result<(Vec<f32>, Vec<u32>)> {
        let vals = match kind {
            ValueKind::FeaCount => keys.iter().map(|&k| self.count(k)).collect(),
            ValueKind::Weight | ValueKind::Gradient => keys.iter().map(|&k| self.weight(k)).collect(),
            ValueKind::Other(code) => bail!("unsupported value kind {code}"),
        };
        Ok((vals, Vec::new()))
    }

    fn report(&mut self) {
        if self.num_updates - self.num_reported >= 100 {
            debug!(
                updates = self.num_updates,
                entries = self.entries.len(),
                "sgd updater progress"
            );
            self.num_reported = self.num_updates;
        }
    }

    fn load(&mut self, reader: &mut dyn Read) -> Result<()> {
        let reader = BufReader::new(reader);
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split('\t');
            let id: FeatureId = fields
                .next()
                .ok_or_else(|| anyhow!("line {}: missing id", lineno + 1))?
                .parse()
                .with_context(|| format!("line {}: bad id", lineno + 1))?;
            let weight: f32 = fields
                .next()
                .ok_or_else(|| anyhow!("line {}: missing weight", lineno + 1))?
                .parse()
                .with_context(|| format!("line {}: bad weight", lineno + 1))?;
            let count: f32 = match fields.next() {
                Some(c) => c
                    .parse()
                    .with_context(|| format!("line {}: bad count", lineno + 1))?,
                None => 0.0,
            };
            self.entries.insert(id, Entry { weight, count });
        }
        Ok(())
    }

    fn dump(&self, aux: bool, reverse: bool, writer: &mut dyn Write) -> Result<()> {
        let mut ids: Vec<FeatureId> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let entry = self.entries[&id];
            if entry.weight == 0.0 && !aux {
                continue;
            }
            let out_id = if reverse { id.swap_bytes() } else { id };
            if aux {
                writeln!(writer, "{out_id}\t{}\t{}", entry.weight, entry.count)?;
            } else {
                writeln!(writer, "{out_id}\t{}", entry.weight)?;
            }
        }
        Ok(())
    }
}

/// Load a model written by [`SgdUpdater::dump`] with auxiliary state and
/// write it again to `name_dump`.
pub fn dump_model_file(model_in: &Path, name_dump: &Path, aux: bool, reverse: bool) -> Result<()> {
    let mut updater = SgdUpdater::new(0.0, 0.0);
    let mut input = File::open(model_in).with_context(|| format!("open {}", model_in.display()))?;
    updater.load(&mut input)?;
    let output = File::create(name_dump).with_context(|| format!("create {}", name_dump.display()))?;
    let mut writer = BufWriter::new(output);
    updater.dump(aux, reverse, &mut writer)?;
    writer.flush()?;
    debug!(entries = updater.len(), out = %name_dump.display(), "dumped model file");
    Ok(())
}
