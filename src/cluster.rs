//! # Local Cluster
//!
//! Runs the scheduler, every worker and the parameter server in one process.
//! Workers get their own data store and reach the server through the
//! in-process transport.

use crate::config::LearnerConfig;
use crate::data_store::{DataStore, MemDataStore};
use crate::loss::{LogitLoss, Loss};
use crate::model::NodeId;
use crate::reader::SourceOpener;
use crate::scheduler::{EpochController, ScheduleReport};
use crate::server::protocol::{Control, HEAD_STOP_SERVER, HEAD_SYNC_MODE};
use crate::server::{LocalClient, LocalTransport, MergeStats, ModelStore, ParameterServer};
use crate::tracker::{JobTracker, LocalJobTracker};
use crate::updater::SgdUpdater;
use crate::worker::{BcdWorker, JobHandler};
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct LocalCluster {
    config: LearnerConfig,
    server: Arc<ParameterServer>,
    tracker: Arc<LocalJobTracker>,
}

impl LocalCluster {
    /// Start the server and `server.num_workers` workers reading from `opener`.
    pub fn start(config: LearnerConfig, opener: Arc<dyn SourceOpener>) -> Result<Self> {
        config.validate()?;
        let transport = Arc::new(LocalTransport::new());
        let updater = SgdUpdater::new(config.server.learning_rate, config.server.l2);
        let server = Arc::new(
            ParameterServer::start(&config.server, Box::new(updater), transport.clone())
                .context("start parameter server")?,
        );
        if config.server.sync_mode {
            server.handle_command(&Control {
                head: HEAD_SYNC_MODE,
                body: String::new(),
            });
        }

        let loss: Arc<dyn Loss> = Arc::new(LogitLoss);
        let mut handlers: Vec<Box<dyn JobHandler>> = Vec::with_capacity(config.server.num_workers);
        for rank in 0..config.server.num_workers {
            let node = NodeId::worker(rank);
            let client: Arc<dyn ModelStore> = Arc::new(LocalClient::new(
                node,
                server.clone(),
                transport.clone(),
                config.server.value_codes,
            ));
            let store: Arc<dyn DataStore> = Arc::new(MemDataStore::new());
            let worker = BcdWorker::new(node, &config.learner, store, opener.clone(), client, loss.clone())?;
            handlers.push(Box::new(worker));
        }
        let tracker = Arc::new(LocalJobTracker::start(handlers).context("start workers")?);

        info!(
            workers = config.server.num_workers,
            sync = config.server.sync_mode,
            "local cluster started"
        );
        Ok(Self {
            config,
            server,
            tracker,
        })
    }

    pub fn config(&self) -> &LearnerConfig {
        &self.config
    }

    pub fn server(&self) -> &Arc<ParameterServer> {
        &self.server
    }

    /// Run the full schedule, then dump the model if `learner.model_out` is set.
    pub fn run(&self) -> Result<ScheduleReport> {
        let tracker: Arc<dyn JobTracker> = self.tracker.clone();
        let mut controller = EpochController::new(
            tracker,
            self.config.server.num_workers,
            &self.config.learner,
            &self.config.scheduler,
        );
        let report = controller.run_schedule()?;
        if let Some(path) = &self.config.learner.model_out {
            self.dump_model(path)?;
        }
        Ok(report)
    }

    pub fn dump_model(&self, path: &Path) -> Result<()> {
        self.server
            .dump_model(path, self.config.learner.dump_aux, self.config.learner.need_reverse)
    }

    /// Stop the server, then wait for the workers. Any worker still blocked
    /// in a synchronous round is released with a shutdown error.
    pub fn shutdown(&self) -> Option<MergeStats> {
        self.server.handle_command(&Control {
            head: HEAD_STOP_SERVER,
            body: String::new(),
        });
        self.tracker.shutdown();
        self.server.join()
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        if !self.server.is_stopped() {
            self.shutdown();
        }
    }
}
