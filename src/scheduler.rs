//! # Epoch Controller
//!
//! Drives the job protocol from the scheduler side: data preparation, then
//! `max_num_epochs` rounds of training and optional validation. Each batch
//! goes to every worker and the controller blocks until all of them have
//! reported before it moves on.

use crate::config::{LearnerSection, SchedulerConfig};
use crate::model::{Job, JobKind, JobResult, Metrics, NodeId, PrepareStats};
use crate::tracker::JobTracker;
use anyhow::{bail, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Called with the batch kind and epoch before and after every batch.
pub type EpochHook = Box<dyn FnMut(JobKind, usize) + Send>;

/// Aggregated outcome of one batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchOutcome {
    /// Histogram averaged over workers, weighted by sampled rows
    Prepare(PrepareStats),
    /// Metrics summed over workers
    Metrics(Metrics),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub kind: JobKind,
    pub epoch: usize,
    pub jobs: usize,
    pub outcome: BatchOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScheduleReport {
    pub batches: Vec<BatchSummary>,
}

impl ScheduleReport {
    /// Summed metrics of every batch of `kind`, in epoch order.
    pub fn metrics(&self, kind: JobKind) -> Vec<Metrics> {
        self.batches
            .iter()
            .filter(|b| b.kind == kind)
            .filter_map(|b| match &b.outcome {
                BatchOutcome::Metrics(m) => Some(*m),
                BatchOutcome::Prepare(_) => None,
            })
            .collect()
    }

    pub fn prepare_stats(&self, kind: JobKind) -> Option<&PrepareStats> {
        self.batches.iter().find(|b| b.kind == kind).and_then(|b| match &b.outcome {
            BatchOutcome::Prepare(s) => Some(s),
            BatchOutcome::Metrics(_) => None,
        })
    }
}

pub struct EpochController {
    tracker: Arc<dyn JobTracker>,
    num_workers: usize,
    data_in: String,
    data_val: Option<String>,
    max_num_epochs: usize,
    policy: SchedulerConfig,
    before_epoch: Vec<EpochHook>,
    after_epoch: Vec<EpochHook>,
}

impl EpochController {
    pub fn new(
        tracker: Arc<dyn JobTracker>,
        num_workers: usize,
        learner: &LearnerSection,
        policy: &SchedulerConfig,
    ) -> Self {
        Self {
            tracker,
            num_workers,
            data_in: learner.data_in.clone(),
            data_val: learner.data_val.clone().filter(|v| !v.is_empty()),
            max_num_epochs: learner.max_num_epochs,
            policy: policy.clone(),
            before_epoch: Vec::new(),
            after_epoch: Vec::new(),
        }
    }

    pub fn add_before_epoch_hook(&mut self, hook: EpochHook) {
        self.before_epoch.push(hook);
    }

    pub fn add_after_epoch_hook(&mut self, hook: EpochHook) {
        self.after_epoch.push(hook);
    }

    pub fn run_schedule(&mut self) -> Result<ScheduleReport> {
        if self.data_in.is_empty() {
            bail!("learner.data_in is not set");
        }
        let mut report = ScheduleReport::default();
        let data_in = self.data_in.clone();
        report
            .batches
            .push(self.issue_job_to_workers(JobKind::PrepareTrain, &data_in, 0)?);
        if let Some(data_val) = self.data_val.clone() {
            report
                .batches
                .push(self.issue_job_to_workers(JobKind::PrepareVal, &data_val, 0)?);
        }

        for epoch in 0..self.max_num_epochs {
            let train = self.issue_job_to_workers(JobKind::Train, "", epoch)?;
            report.batches.push(train);
            if self.data_val.is_some() {
                let val = self.issue_job_to_workers(JobKind::Validate, "", epoch)?;
                report.batches.push(val);
            }
        }
        Ok(report)
    }

    /// Issue one job of `kind` to every worker and wait for all of them.
    pub fn issue_job_to_workers(&mut self, kind: JobKind, source_ref: &str, epoch: usize) -> Result<BatchSummary> {
        for hook in &mut self.before_epoch {
            hook(kind, epoch);
        }
        let start = Instant::now();
        let jobs: Vec<Job> = (0..self.num_workers)
            .map(|rank| Job {
                kind,
                source_ref: source_ref.to_string(),
                part_index: rank,
                part_count: self.num_workers,
                worker: NodeId::worker(rank),
                epoch,
            })
            .collect();

        let results = self.run_batch(jobs)?;
        let outcome = aggregate(kind, &results);
        for hook in &mut self.after_epoch {
            hook(kind, epoch);
        }

        match &outcome {
            BatchOutcome::Prepare(stats) => info!(
                kind = %kind,
                rows = stats.rows_read,
                shards = stats.num_shards,
                secs = start.elapsed().as_secs_f64(),
                "batch done"
            ),
            BatchOutcome::Metrics(m) => info!(
                kind = %kind,
                epoch,
                examples = m.num_examples,
                objective = m.mean_objective(),
                accuracy = m.accuracy(),
                secs = start.elapsed().as_secs_f64(),
                "batch done"
            ),
        }
        Ok(BatchSummary {
            kind,
            epoch,
            jobs: results.len(),
            outcome,
        })
    }

    /// Run `jobs`, retrying failed ones per the policy. Results come back in
    /// rank order.
    fn run_batch(&self, jobs: Vec<Job>) -> Result<Vec<JobResult>> {
        let count = jobs.len();
        let mut results: Vec<Option<JobResult>> = vec![None; count];
        let mut attempts = vec![0u32; count];
        let timeout = self.policy.job_timeout();
        self.tracker.add(jobs)?;

        while results.iter().any(Option::is_none) {
            if !self.tracker.wait_idle(timeout) {
                bail!(
                    "{} jobs still outstanding after {}s",
                    self.tracker.num_remaining(),
                    timeout.map_or(0, |t| t.as_secs())
                );
            }
            let mut retry = Vec::new();
            for outcome in self.tracker.take_results() {
                let rank = outcome.job.part_index;
                if rank >= count {
                    warn!(rank, "result of a job from another batch");
                    continue;
                }
                match outcome.result {
                    Ok(result) => results[rank] = Some(result),
                    Err(err) if attempts[rank] < self.policy.max_job_retries => {
                        attempts[rank] += 1;
                        warn!(
                            worker = %outcome.job.worker,
                            kind = %outcome.job.kind,
                            attempt = attempts[rank],
                            error = %err,
                            "retrying job"
                        );
                        retry.push(outcome.job);
                    }
                    Err(err) => {
                        return Err(err.context(format!(
                            "{} job on {} failed",
                            outcome.job.kind, outcome.job.worker
                        )));
                    }
                }
            }
            if !retry.is_empty() {
                self.tracker.add(retry)?;
            } else if results.iter().any(Option::is_none) {
                bail!("tracker went idle with jobs unaccounted for");
            }
        }
        Ok(results.into_iter().flatten().collect())
    }
}

fn aggregate(kind: JobKind, results: &[JobResult]) -> BatchOutcome {
    if kind.is_prepare() {
        let mut sampled = 0u64;
        let mut rows_read = 0u64;
        let mut num_shards = 0usize;
        let mut weighted: Vec<f64> = Vec::new();
        for result in results {
            if let JobResult::Prepare(s) = result {
                if weighted.len() < s.feablk_avg.len() {
                    weighted.resize(s.feablk_avg.len(), 0.0);
                }
                for (w, &h) in weighted.iter_mut().zip(&s.feablk_avg) {
                    *w += f64::from(h) * s.rows_sampled as f64;
                }
                sampled += s.rows_sampled;
                rows_read += s.rows_read;
                num_shards += s.num_shards;
            }
        }
        let feablk_avg = weighted
            .into_iter()
            .map(|w| if sampled == 0 { 0.0 } else { (w / sampled as f64) as f32 })
            .collect();
        BatchOutcome::Prepare(PrepareStats {
            feablk_avg,
            rows_sampled: sampled,
            rows_read,
            num_shards,
        })
    } else {
        let mut total = Metrics::default();
        for result in results {
            if let JobResult::Train(m) | JobResult::Validate(m) = result {
                total.merge(m);
            }
        }
        BatchOutcome::Metrics(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{JobOutcome, LocalJobTracker};
    use crate::worker::JobHandler;
    use anyhow::anyhow;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Records every job it receives; fails the first `failures` jobs.
    struct Scripted {
        log: Arc<Mutex<Vec<(JobKind, usize)>>>,
        failures: usize,
        delay: Duration,
    }

    impl JobHandler for Scripted {
        fn process(&mut self, job: &Job) -> Result<JobResult> {
            self.log.lock().push((job.kind, job.part_index));
            std::thread::sleep(self.delay);
            if self.failures > 0 {
                self.failures -= 1;
                return Err(anyhow!("transient"));
            }
            Ok(match job.kind {
                JobKind::PrepareTrain | JobKind::PrepareVal => JobResult::Prepare(PrepareStats {
                    feablk_avg: vec![job.part_index as f32, 1.0],
                    rows_sampled: 1 + job.part_index as u64,
                    rows_read: 10,
                    num_shards: 1,
                }),
                JobKind::Train => JobResult::Train(Metrics {
                    objective: 1.0,
                    num_examples: 2,
                    num_correct: 1,
                }),
                JobKind::Validate => JobResult::Validate(Metrics {
                    objective: 0.5,
                    num_examples: 1,
                    num_correct: 1,
                }),
            })
        }
    }

    fn controller(
        workers: usize,
        val: bool,
        failures: usize,
        policy: SchedulerConfig,
    ) -> (EpochController, Arc<Mutex<Vec<(JobKind, usize)>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handlers: Vec<Box<dyn JobHandler>> = (0..workers)
            .map(|_| {
                Box::new(Scripted {
                    log: log.clone(),
                    failures,
                    delay: Duration::ZERO,
                }) as Box<dyn JobHandler>
            })
            .collect();
        let tracker = Arc::new(LocalJobTracker::start(handlers).unwrap());
        let learner = LearnerSection {
            data_in: "train".to_string(),
            data_val: val.then(|| "val".to_string()),
            max_num_epochs: 2,
            ..LearnerSection::default()
        };
        (EpochController::new(tracker, workers, &learner, &policy), log)
    }

    #[test]
    fn test_schedule_order_without_validation() {
        let (mut controller, log) = controller(3, false, 0, SchedulerConfig::default());
        let hooks = Arc::new(Mutex::new(Vec::new()));
        let seen = hooks.clone();
        controller.add_before_epoch_hook(Box::new(move |kind, epoch| seen.lock().push((kind, epoch))));

        let report = controller.run_schedule().unwrap();
        let kinds: Vec<JobKind> = report.batches.iter().map(|b| b.kind).collect();
        assert_eq!(kinds, vec![JobKind::PrepareTrain, JobKind::Train, JobKind::Train]);
        assert!(report.batches.iter().all(|b| b.jobs == 3));
        assert_eq!(log.lock().len(), 9);
        assert_eq!(
            *hooks.lock(),
            vec![(JobKind::PrepareTrain, 0), (JobKind::Train, 0), (JobKind::Train, 1)]
        );

        let train = report.metrics(JobKind::Train);
        assert_eq!(train.len(), 2);
        assert_eq!(train[0].num_examples, 6);
        assert_eq!(train[0].objective, 3.0);
    }

    #[test]
    fn test_schedule_interleaves_validation() {
        let (mut controller, _log) = controller(2, true, 0, SchedulerConfig::default());
        let report = controller.run_schedule().unwrap();
        let kinds: Vec<JobKind> = report.batches.iter().map(|b| b.kind).collect();
        assert_eq!(
            kinds,
            vec![
                JobKind::PrepareTrain,
                JobKind::PrepareVal,
                JobKind::Train,
                JobKind::Validate,
                JobKind::Train,
                JobKind::Validate,
            ]
        );
        // rows sampled 1 and 2: (0*1 + 1*2) / 3
        let stats = report.prepare_stats(JobKind::PrepareTrain).unwrap();
        assert!((stats.feablk_avg[0] - 2.0 / 3.0).abs() < 1e-6);
        assert!((stats.feablk_avg[1] - 1.0).abs() < 1e-6);
        assert_eq!(stats.rows_read, 20);
        assert_eq!(report.metrics(JobKind::Validate)[1].num_correct, 2);
    }

    #[test]
    fn test_failed_job_aborts_without_retries() {
        let (mut controller, _log) = controller(2, false, 1, SchedulerConfig::default());
        let err = controller.run_schedule().unwrap_err();
        assert!(err.to_string().contains("prepare-train"), "{err}");
    }

    #[test]
    fn test_failed_job_is_retried() {
        let policy = SchedulerConfig {
            max_job_retries: 1,
            ..SchedulerConfig::default()
        };
        let (mut controller, log) = controller(2, false, 1, policy);
        let report = controller.run_schedule().unwrap();
        assert_eq!(report.batches.len(), 3);
        // two failed first attempts plus 3 batches of 2
        assert_eq!(log.lock().len(), 8);
    }

    #[test]
    fn test_batch_timeout_aborts() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let tracker = Arc::new(
            LocalJobTracker::start(vec![Box::new(Scripted {
                log,
                failures: 0,
                delay: Duration::from_millis(1500),
            }) as Box<dyn JobHandler>])
            .unwrap(),
        );
        let learner = LearnerSection {
            data_in: "train".to_string(),
            ..LearnerSection::default()
        };
        let policy = SchedulerConfig {
            job_timeout_secs: Some(1),
            ..SchedulerConfig::default()
        };
        let mut controller = EpochController::new(tracker, 1, &learner, &policy);
        let err = controller.run_schedule().unwrap_err();
        assert!(err.to_string().contains("outstanding"), "{err}");
    }

    #[test]
    fn test_missing_training_data_rejected() {
        struct Idle;
        impl JobTracker for Idle {
            fn add(&self, _jobs: Vec<Job>) -> Result<()> {
                Ok(())
            }
            fn num_remaining(&self) -> usize {
                0
            }
            fn wait_idle(&self, _timeout: Option<Duration>) -> bool {
                true
            }
            fn take_results(&self) -> Vec<JobOutcome> {
                Vec::new()
            }
        }
        let mut controller = EpochController::new(
            Arc::new(Idle),
            1,
            &LearnerSection::default(),
            &SchedulerConfig::default(),
        );
        assert!(controller.run_schedule().is_err());
    }
}
