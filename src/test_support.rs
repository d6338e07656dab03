//! Recording fakes shared by unit tests, integration tests and benches.

use crate::model::FeatureId;
use crate::server::protocol::{Reply, RequestMeta, Responder, ValueKind};
use crate::updater::Updater;
use anyhow::Result;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::sync::Arc;

/// One call to [`Updater::update`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedUpdate {
    pub keys: Vec<FeatureId>,
    pub kind: ValueKind,
    pub vals: Vec<f32>,
    pub lens: Vec<u32>,
}

#[derive(Debug, Default)]
struct UpdaterLog {
    updates: Vec<RecordedUpdate>,
    reports: usize,
    values: HashMap<FeatureId, f32>,
}

/// Updater that records every call. Clones share the same log, so a test
/// can keep one handle while the server owns the other.
#[derive(Debug, Clone, Default)]
pub struct RecordingUpdater {
    log: Arc<Mutex<UpdaterLog>>,
}

impl RecordingUpdater {
    pub fn updates(&self) -> Vec<RecordedUpdate> {
        self.log.lock().updates.clone()
    }

    pub fn reports(&self) -> usize {
        self.log.lock().reports
    }

    pub fn set_value(&self, key: FeatureId, value: f32) {
        self.log.lock().values.insert(key, value);
    }
}

impl Updater for RecordingUpdater {
    fn update(&mut self, keys: &[FeatureId], kind: ValueKind, vals: &[f32], lens: &[u32]) -> Result<()> {
        self.log.lock().updates.push(RecordedUpdate {
            keys: keys.to_vec(),
            kind,
            vals: vals.to_vec(),
            lens: lens.to_vec(),
        });
        Ok(())
    }

    fn get(&mut self, keys: &[FeatureId], _kind: ValueKind) -> Result<(Vec<f32>, Vec<u32>)> {
        let log = self.log.lock();
        let vals = keys
            .iter()
            .map(|k| log.values.get(k).copied().unwrap_or(0.0))
            .collect();
        Ok((vals, Vec::new()))
    }

    fn report(&mut self) {
        self.log.lock().reports += 1;
    }

    fn load(&mut self, _reader: &mut dyn Read) -> Result<()> {
        Ok(())
    }

    fn dump(&self, _aux: bool, _reverse: bool, _writer: &mut dyn Write) -> Result<()> {
        Ok(())
    }
}

/// Responder that keeps every reply in arrival order.
#[derive(Debug, Default)]
pub struct RecordingResponder {
    replies: Mutex<Vec<(RequestMeta, Reply)>>,
}

impl RecordingResponder {
    pub fn replies(&self) -> Vec<(RequestMeta, Reply)> {
        self.replies.lock().clone()
    }
}

impl Responder for RecordingResponder {
    fn respond(&self, meta: &RequestMeta, reply: Reply) {
        self.replies.lock().push((*meta, reply));
    }
}
