//! # Merge Engine
//!
//! Owns the updater and the buffer of the open synchronous round. Every
//! method runs on the server's executor thread, so nothing here is locked.
//!
//! Pushes are applied immediately unless the server is in synchronous mode
//! and the push carries gradients. Synchronous gradient pushes are folded
//! into the open round and their requesters are answered only when the round
//! has one push from each of the expected workers.

use super::protocol::{KvPairs, RequestMeta, Responder, ServerError, ValueCodes, ValueKind};
use crate::kv_union::{kv_union, AssignOp, KvSlice};
use crate::model::NodeId;
use crate::updater::Updater;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The pending pushes of one synchronous round.
#[derive(Debug, Clone, Default)]
pub struct MergeRound {
    data: KvPairs,
    requests: Vec<RequestMeta>,
}

impl MergeRound {
    pub fn is_open(&self) -> bool {
        !self.requests.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.requests.len()
    }

    pub fn contains(&self, sender: NodeId) -> bool {
        self.requests.iter().any(|r| r.sender == sender)
    }

    pub fn data(&self) -> &KvPairs {
        &self.data
    }

    fn reset(&mut self) -> (KvPairs, Vec<RequestMeta>) {
        let data = std::mem::take(&mut self.data);
        let requests = std::mem::take(&mut self.requests);
        (data, requests)
    }
}

/// Counters kept by the merge engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeStats {
    pub pulls: u64,
    pub async_pushes: u64,
    pub sync_pushes: u64,
    pub flushes: u64,
    pub rejected: u64,
    pub push_time: Duration,
    pub pull_time: Duration,
}

pub struct MergeEngine {
    updater: Box<dyn Updater>,
    responder: Arc<dyn Responder>,
    codes: ValueCodes,
    expected_workers: usize,
    sync_mode: bool,
    /// Set by [`MergeEngine::shutdown`]; later requests are refused
    stopping: bool,
    round: MergeRound,
    stats: MergeStats,
}

impl MergeEngine {
    pub fn new(
        updater: Box<dyn Updater>,
        responder: Arc<dyn Responder>,
        codes: ValueCodes,
        expected_workers: usize,
    ) -> Self {
        Self {
            updater,
            responder,
            codes,
            expected_workers: expected_workers.max(1),
            sync_mode: false,
            stopping: false,
            round: MergeRound::default(),
            stats: MergeStats::default(),
        }
    }

    /// Enter synchronous mode; idempotent.
    pub fn set_sync_mode(&mut self) {
        if !self.sync_mode {
            info!(expected_workers = self.expected_workers, "parameter server enters sync mode");
        }
        self.sync_mode = true;
    }

    pub fn sync_mode(&self) -> bool {
        self.sync_mode
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub fn round(&self) -> &MergeRound {
        &self.round
    }

    pub fn stats(&self) -> &MergeStats {
        &self.stats
    }

    /// Serve one data request. Every outcome except buffering answers the
    /// requester; the returned error is for the caller's logging only.
    pub fn handle(&mut self, meta: RequestMeta, payload: KvPairs) -> Result<(), ServerError> {
        let kind = self.codes.decode(meta.cmd);
        let result = if self.stopping {
            Err(ServerError::Shutdown)
        } else if !meta.push {
            self.pull(&meta, kind, payload)
        } else if self.sync_mode && kind == ValueKind::Gradient {
            self.push_sync(meta, payload)
        } else {
            self.push_async(&meta, kind, payload)
        };
        if let Err(err) = &result {
            self.stats.rejected += 1;
            self.responder.respond(&meta, Err(err.clone()));
        }
        result
    }

    fn pull(&mut self, meta: &RequestMeta, kind: ValueKind, payload: KvPairs) -> Result<(), ServerError> {
        let start = Instant::now();
        let (vals, lens) = self
            .updater
            .get(&payload.keys, kind)
            .map_err(|err| ServerError::Updater(err.to_string()))?;
        self.responder.respond(
            meta,
            Ok(KvPairs {
                keys: payload.keys,
                vals,
                lens,
            }),
        );
        self.stats.pulls += 1;
        self.stats.pull_time += start.elapsed();
        Ok(())
    }

    fn push_async(&mut self, meta: &RequestMeta, kind: ValueKind, payload: KvPairs) -> Result<(), ServerError> {
        let start = Instant::now();
        self.updater
            .update(&payload.keys, kind, &payload.vals, &payload.lens)
            .map_err(|err| ServerError::Updater(err.to_string()))?;
        self.responder.respond(meta, Ok(KvPairs::default()));
        self.stats.async_pushes += 1;
        self.stats.push_time += start.elapsed();
        self.updater.report();
        Ok(())
    }

    fn push_sync(&mut self, meta: RequestMeta, payload: KvPairs) -> Result<(), ServerError> {
        if self.round.pending() >= self.expected_workers {
            return Err(ServerError::Protocol(format!(
                "round already holds {} pushes for {} workers",
                self.round.pending(),
                self.expected_workers
            )));
        }
        if self.round.contains(meta.sender) {
            return Err(ServerError::Protocol(format!(
                "{} pushed twice in the same round",
                meta.sender
            )));
        }

        let merged = kv_union(
            KvSlice::new(&self.round.data.keys, &self.round.data.vals, &self.round.data.lens),
            KvSlice::new(&payload.keys, &payload.vals, &payload.lens),
            AssignOp::Plus,
        )
        .map_err(|err| ServerError::Protocol(err.to_string()))?;
        self.round.data = KvPairs {
            keys: merged.keys,
            vals: merged.vals,
            lens: merged.lens,
        };
        self.round.requests.push(meta);
        self.stats.sync_pushes += 1;

        debug!(
            sender = %meta.sender,
            timestamp = meta.timestamp,
            pending = self.round.pending(),
            expected = self.expected_workers,
            "buffered sync push"
        );

        if self.round.pending() == self.expected_workers {
            self.flush();
        }
        Ok(())
    }

    /// Apply the completed round once and answer every buffered requester.
    fn flush(&mut self) {
        let start = Instant::now();
        let (data, requests) = self.round.reset();
        let kind = ValueKind::Gradient;
        let reply = self
            .updater
            .update(&data.keys, kind, &data.vals, &data.lens)
            .map(|_| KvPairs::default())
            .map_err(|err| ServerError::Updater(err.to_string()));
        if let Err(err) = &reply {
            warn!(error = %err, "updater rejected merged round");
        }
        for req in &requests {
            self.responder.respond(req, reply.clone());
        }
        self.stats.flushes += 1;
        self.stats.push_time += start.elapsed();
        debug!(keys = data.keys.len(), requesters = requests.len(), "flushed sync round");
    }

    /// Write the updater's model.
    pub fn dump_model(&self, aux: bool, reverse: bool, writer: &mut dyn Write) -> anyhow::Result<()> {
        self.updater.dump(aux, reverse, writer)
    }

    /// Answer any requester still waiting in the open round with a
    /// shutdown error and refuse every request handled after this one.
    /// Called before the executor stops.
    pub fn shutdown(&mut self) {
        self.stopping = true;
        let (_, requests) = self.round.reset();
        if !requests.is_empty() {
            warn!(pending = requests.len(), "stopping with an incomplete sync round");
        }
        for req in &requests {
            self.responder.respond(req, Err(ServerError::Shutdown));
        }
        info!(
            pulls = self.stats.pulls,
            async_pushes = self.stats.async_pushes,
            sync_pushes = self.stats.sync_pushes,
            flushes = self.stats.flushes,
            rejected = self.stats.rejected,
            push_secs = self.stats.push_time.as_secs_f64(),
            pull_secs = self.stats.pull_time.as_secs_f64(),
            "parameter server handled requests"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingResponder, RecordingUpdater};

    fn meta(sender: u32, cmd: i32, push: bool) -> RequestMeta {
        RequestMeta {
            sender: NodeId(sender),
            timestamp: 1,
            cmd,
            push,
        }
    }

    fn engine(workers: usize) -> (MergeEngine, RecordingUpdater, Arc<RecordingResponder>) {
        let updater = RecordingUpdater::default();
        let responder = Arc::new(RecordingResponder::default());
        let engine = MergeEngine::new(
            Box::new(updater.clone()),
            responder.clone(),
            ValueCodes::default(),
            workers,
        );
        (engine, updater, responder)
    }

    #[test]
    fn test_async_push_applies_immediately() {
        let (mut engine, updater, responder) = engine(3);
        engine
            .handle(meta(0, 3, true), KvPairs::new(vec![1, 2], vec![1.0, 1.0]))
            .unwrap();
        assert_eq!(updater.updates().len(), 1);
        assert_eq!(updater.reports(), 1);
        assert_eq!(responder.replies().len(), 1);
    }

    #[test]
    fn test_sync_round_flushes_once_with_merged_payload() {
        let (mut engine, updater, responder) = engine(3);
        engine.set_sync_mode();

        engine
            .handle(meta(0, 3, true), KvPairs::new(vec![1, 2], vec![1.0, 1.0]))
            .unwrap();
        engine
            .handle(meta(1, 3, true), KvPairs::new(vec![2, 3], vec![1.0, 1.0]))
            .unwrap();
        assert!(updater.updates().is_empty());
        assert!(responder.replies().is_empty());
        assert_eq!(engine.round().pending(), 2);

        engine
            .handle(meta(2, 3, true), KvPairs::new(vec![1, 3], vec![1.0, 1.0]))
            .unwrap();
        let updates = updater.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].keys, vec![1, 2, 3]);
        assert_eq!(updates[0].vals, vec![2.0, 2.0, 2.0]);
        assert_eq!(updates[0].kind, ValueKind::Gradient);
        assert_eq!(responder.replies().len(), 3);
        assert!(responder.replies().iter().all(|(_, r)| r.is_ok()));
        assert!(!engine.round().is_open());
    }

    #[test]
    fn test_sync_duplicate_requester_rejected_without_merging() {
        let (mut engine, updater, responder) = engine(2);
        engine.set_sync_mode();
        engine
            .handle(meta(0, 3, true), KvPairs::new(vec![1], vec![1.0]))
            .unwrap();
        let err = engine
            .handle(meta(0, 3, true), KvPairs::new(vec![1], vec![5.0]))
            .unwrap_err();
        assert!(matches!(err, ServerError::Protocol(_)));
        assert_eq!(engine.round().data().vals, vec![1.0]);
        assert_eq!(engine.round().pending(), 1);
        assert!(updater.updates().is_empty());
        // only the duplicate got an answer, an error
        let replies = responder.replies();
        assert_eq!(replies.len(), 1);
        assert!(replies[0].1.is_err());
    }

    #[test]
    fn test_non_gradient_push_in_sync_mode_is_async() {
        let (mut engine, updater, responder) = engine(4);
        engine.set_sync_mode();
        engine.set_sync_mode();
        engine
            .handle(meta(0, 1, true), KvPairs::new(vec![7], vec![2.0]))
            .unwrap();
        assert_eq!(updater.updates().len(), 1);
        assert_eq!(updater.updates()[0].kind, ValueKind::FeaCount);
        assert_eq!(responder.replies().len(), 1);
        assert!(!engine.round().is_open());
    }

    #[test]
    fn test_pull_returns_updater_values() {
        let (mut engine, updater, responder) = engine(1);
        updater.set_value(5, 0.5);
        engine
            .handle(meta(0, 2, false), KvPairs::keys_only(vec![5, 6]))
            .unwrap();
        let replies = responder.replies();
        let reply = replies[0].1.as_ref().unwrap();
        assert_eq!(reply.keys, vec![5, 6]);
        assert_eq!(reply.vals, vec![0.5, 0.0]);
    }

    #[test]
    fn test_unsorted_sync_push_rejected() {
        let (mut engine, _updater, responder) = engine(2);
        engine.set_sync_mode();
        assert!(engine
            .handle(meta(0, 3, true), KvPairs::new(vec![3, 1], vec![1.0, 1.0]))
            .is_err());
        assert!(!engine.round().is_open());
        assert_eq!(responder.replies().len(), 1);
        assert_eq!(engine.stats().rejected, 1);
    }

    #[test]
    fn test_shutdown_answers_open_round() {
        let (mut engine, updater, responder) = engine(3);
        engine.set_sync_mode();
        engine
            .handle(meta(0, 3, true), KvPairs::new(vec![1], vec![1.0]))
            .unwrap();
        engine.shutdown();
        assert!(updater.updates().is_empty());
        let replies = responder.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].1, Err(ServerError::Shutdown));
    }

    #[test]
    fn test_requests_after_shutdown_are_answered_with_shutdown() {
        let (mut engine, updater, responder) = engine(2);
        engine.set_sync_mode();
        engine.shutdown();
        assert!(engine.is_stopping());

        let err = engine
            .handle(meta(1, 3, true), KvPairs::new(vec![4], vec![1.0]))
            .unwrap_err();
        assert_eq!(err, ServerError::Shutdown);
        assert!(engine
            .handle(meta(0, 2, false), KvPairs::keys_only(vec![4]))
            .is_err());
        assert!(!engine.round().is_open());
        assert!(updater.updates().is_empty());
        let replies = responder.replies();
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|(_, r)| r == &Err(ServerError::Shutdown)));
        assert_eq!(engine.stats().rejected, 2);
    }
}
