//! Engine: the owned registry of executions.
//!
//! One [`Engine`] is constructed at process start and passed by reference.
//! It maps orchestration names to their current execution and lifecycle
//! phase. Lifecycle transitions are decided under the table mutex, but the
//! slow parts (resolving stages, joining workers) run with the mutex
//! released. An entry is marked busy for their duration, so a name can never
//! have two live executions and a stalled endpoint only blocks its own
//! orchestration.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::definition::Phase;
use crate::error::{EngineError, Result};
use crate::execution::{Execution, ExecutionState, StageError};
use crate::graph::GraphBuilder;
use crate::resolver::Resolver;
use crate::storage::DefinitionStore;
use crate::transport::Transport;

#[cfg(test)]
mod tests;

/// Registry slot for one orchestration.
#[derive(Default)]
struct Entry {
    phase: Phase,
    execution: Option<Execution>,
    last_error: Option<EngineError>,
    /// A build or stop is in flight outside the table mutex.
    busy: bool,
}

impl Entry {
    fn ensure_idle(&self, name: &str) -> Result<()> {
        if self.busy {
            return Err(EngineError::failed_precondition(format!(
                "orchestration '{}' is being built or stopped",
                name
            )));
        }
        Ok(())
    }

    /// Record how a stopped execution ended.
    fn settle(&mut self, outcome: std::result::Result<(), StageError>) -> Phase {
        self.phase = match outcome {
            Ok(()) => Phase::Succeeded,
            Err(failure) => {
                self.last_error = Some(failure.error.context(format!(
                    "stage '{}' on flow {}",
                    failure.stage, failure.flow_id
                )));
                Phase::Failed
            }
        };
        self.phase
    }
}

/// Builds, starts and stops orchestrations by name.
pub struct Engine {
    builder: GraphBuilder,
    table: Mutex<HashMap<String, Entry>>,
}

impl Engine {
    pub fn new(store: Arc<dyn DefinitionStore>, transport: Arc<dyn Transport>, config: &EngineConfig) -> Self {
        let resolver = Resolver::new(transport).with_invoke_timeout(config.invoke_timeout());
        let builder = GraphBuilder::new(store, resolver).with_options(config.build_options());
        Self::with_builder(builder)
    }

    pub fn with_builder(builder: GraphBuilder) -> Self {
        Self {
            builder,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Build an orchestration and keep it ready to start.
    ///
    /// Fails FailedPrecondition if the name already has a built or running
    /// execution, or another build of it is in flight. A failed build leaves
    /// the phase at Failed.
    pub async fn build(&self, name: &str) -> Result<Uuid> {
        {
            let mut table = self.table.lock().await;
            let entry = table.entry(name.to_string()).or_default();
            reap(name, entry).await;
            entry.ensure_idle(name)?;
            if entry.execution.is_some() {
                return Err(EngineError::failed_precondition(format!(
                    "orchestration '{}' is already {}",
                    name, entry.phase
                )));
            }
            entry.busy = true;
        }

        let built = self.builder.build(name).await;

        let mut table = self.table.lock().await;
        let entry = table.entry(name.to_string()).or_default();
        entry.busy = false;
        match built {
            Ok(execution) => {
                let id = execution.id();
                entry.phase = Phase::Pending;
                entry.last_error = None;
                entry.execution = Some(execution);
                Ok(id)
            }
            Err(e) => {
                warn!(orchestration = %name, error = %e, "Build failed");
                entry.phase = Phase::Failed;
                entry.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Start a previously built orchestration.
    pub async fn start(&self, name: &str) -> Result<Uuid> {
        let mut table = self.table.lock().await;
        let entry = table
            .get_mut(name)
            .ok_or_else(|| EngineError::not_found(format!("orchestration '{}' was never built", name)))?;
        entry.ensure_idle(name)?;
        let execution = entry.execution.as_mut().ok_or_else(|| {
            EngineError::failed_precondition(format!("orchestration '{}' has no built execution", name))
        })?;
        if execution.state() != ExecutionState::Built {
            return Err(EngineError::failed_precondition(format!(
                "orchestration '{}' is already running",
                name
            )));
        }

        execution.start()?;
        entry.phase = Phase::Running;
        info!(orchestration = %name, execution = %execution.id(), "Orchestration running");
        Ok(execution.id())
    }

    /// Build and start in one step.
    pub async fn build_and_start(&self, name: &str) -> Result<Uuid> {
        self.build(name).await?;
        self.start(name).await
    }

    /// Stop an orchestration and wait for all of its workers.
    pub async fn stop(&self, name: &str) -> Result<Phase> {
        let execution = {
            let mut table = self.table.lock().await;
            let entry = table
                .get_mut(name)
                .ok_or_else(|| EngineError::not_found(format!("orchestration '{}'", name)))?;
            entry.ensure_idle(name)?;
            let execution = entry.execution.take().ok_or_else(|| {
                EngineError::failed_precondition(format!("orchestration '{}' is not running", name))
            })?;
            entry.busy = true;
            execution
        };

        let outcome = execution.stop().await;

        let mut table = self.table.lock().await;
        let entry = table.entry(name.to_string()).or_default();
        entry.busy = false;
        let phase = entry.settle(outcome);
        info!(orchestration = %name, phase = %phase, "Orchestration stopped");
        Ok(phase)
    }

    /// Current phase. Executions that finished on their own are settled first.
    pub async fn phase(&self, name: &str) -> Result<Phase> {
        let mut table = self.table.lock().await;
        let entry = table
            .get_mut(name)
            .ok_or_else(|| EngineError::not_found(format!("orchestration '{}'", name)))?;
        reap(name, entry).await;
        Ok(entry.phase)
    }

    /// The error behind the last Failed phase, if any.
    pub async fn last_error(&self, name: &str) -> Option<EngineError> {
        let table = self.table.lock().await;
        table.get(name).and_then(|e| e.last_error.clone())
    }

    /// Names of the orchestrations currently running, sorted.
    pub async fn running(&self) -> Vec<String> {
        let mut table = self.table.lock().await;
        let mut names = Vec::new();
        for (name, entry) in table.iter_mut() {
            reap(name, entry).await;
            if entry.phase == Phase::Running {
                names.push(name.clone());
            }
        }
        names.sort();
        names
    }

    /// Stop everything, e.g. on process exit.
    ///
    /// Executions are stopped concurrently. Builds still in flight are left
    /// to finish and are not started.
    pub async fn shutdown(&self) {
        let executions: Vec<(String, Execution)> = {
            let mut table = self.table.lock().await;
            table
                .iter_mut()
                .filter(|(_, entry)| !entry.busy)
                .filter_map(|(name, entry)| {
                    let execution = entry.execution.take()?;
                    entry.busy = true;
                    Some((name.clone(), execution))
                })
                .collect()
        };

        let outcomes = join_all(executions.into_iter().map(|(name, execution)| async move {
            let outcome = execution.stop().await;
            (name, outcome)
        }))
        .await;

        let mut table = self.table.lock().await;
        for (name, outcome) in outcomes {
            let entry = table.entry(name.clone()).or_default();
            entry.busy = false;
            let phase = entry.settle(outcome);
            info!(orchestration = %name, phase = %phase, "Orchestration stopped on shutdown");
        }
    }
}

/// Settle a running execution whose workers have all returned.
async fn reap(name: &str, entry: &mut Entry) {
    let finished = entry
        .execution
        .as_ref()
        .is_some_and(|e| e.state() == ExecutionState::Running && e.is_finished());
    if !finished {
        return;
    }
    if let Some(execution) = entry.execution.take() {
        let phase = entry.settle(execution.stop().await);
        if phase == Phase::Failed {
            error!(orchestration = %name, "Orchestration failed");
        } else {
            info!(orchestration = %name, "Orchestration finished");
        }
    }
}
