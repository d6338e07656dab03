//! # Parameter Server Front
//!
//! Entry point for the transport. Control messages and data requests are
//! validated here and then handed to the merge engine on its executor.

use super::merge::{MergeEngine, MergeStats};
use super::protocol::{Command, Control, KvPairs, RequestMeta, Responder, ServerError};
use crate::config::ServerConfig;
use crate::executor::{Executor, ExecutorError};
use crate::updater::Updater;
use anyhow::Context;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct ParameterServer {
    executor: Executor<MergeEngine>,
    responder: Arc<dyn Responder>,
}

impl ParameterServer {
    /// Start the server's executor thread with `updater` as its model state.
    pub fn start(
        config: &ServerConfig,
        updater: Box<dyn Updater>,
        responder: Arc<dyn Responder>,
    ) -> std::io::Result<Self> {
        let engine = MergeEngine::new(
            updater,
            Arc::clone(&responder),
            config.value_codes,
            config.num_workers,
        );
        let executor = Executor::spawn("sparsebcd-server", engine)?;
        info!(workers = config.num_workers, "parameter server started");
        Ok(Self { executor, responder })
    }

    /// Handle one control message and return its acknowledgement.
    pub fn handle_command(&self, control: &Control) -> Control {
        match Command::from_head(control.head) {
            Command::Stop => {
                if let Err(err) = self.executor.exec(MergeEngine::shutdown) {
                    debug!(error = %err, "stop received by a stopped server");
                }
                if let Err(err) = self.executor.stop() {
                    warn!(error = %err, "failed to stop server executor");
                }
                info!("parameter server stopped");
            }
            Command::SyncMode => {
                if let Err(err) = self.executor.exec(MergeEngine::set_sync_mode) {
                    warn!(error = %err, "sync mode ignored");
                }
            }
            Command::Unknown(head) => {
                debug!(head, "ignoring unknown control command");
            }
        }
        Control {
            head: control.head,
            body: String::new(),
        }
    }

    /// Handle one data request. The requester is always answered, though a
    /// synchronous push is answered only once its round completes.
    pub fn handle_data(&self, meta: RequestMeta, payload: KvPairs) -> Result<(), ServerError> {
        if let Err(err) = validate(&meta, &payload) {
            return Err(self.reject(&meta, err));
        }
        match self.executor.exec(move |engine| engine.handle(meta, payload)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                warn!(sender = %meta.sender, timestamp = meta.timestamp, error = %err, "request rejected");
                Err(err)
            }
            Err(ExecutorError::Stopped | ExecutorError::Reentrant) => {
                Err(self.reject(&meta, ServerError::Shutdown))
            }
        }
    }

    /// Write the current model to `path`, between requests.
    pub fn dump_model(&self, path: &Path, aux: bool, reverse: bool) -> anyhow::Result<()> {
        let target = path.to_path_buf();
        self.executor.exec(move |engine| -> anyhow::Result<()> {
            let file = File::create(&target).with_context(|| format!("create {}", target.display()))?;
            let mut writer = BufWriter::new(file);
            engine.dump_model(aux, reverse, &mut writer)?;
            writer.flush()?;
            Ok(())
        })??;
        info!(path = %path.display(), "dumped model");
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.executor.is_stopped()
    }

    /// Wait until the server has been stopped and return its counters.
    pub fn join(&self) -> Option<MergeStats> {
        self.executor.join().map(|engine| engine.stats().clone())
    }

    fn reject(&self, meta: &RequestMeta, err: ServerError) -> ServerError {
        warn!(sender = %meta.sender, timestamp = meta.timestamp, error = %err, "request rejected");
        self.responder.respond(meta, Err(err.clone()));
        err
    }
}

fn validate(meta: &RequestMeta, payload: &KvPairs) -> Result<(), ServerError> {
    if payload.keys.is_empty() {
        return Err(ServerError::Protocol("request carries no keys".to_string()));
    }
    if meta.push && payload.vals.is_empty() {
        return Err(ServerError::Protocol("push carries no values".to_string()));
    }
    Ok(())
}
