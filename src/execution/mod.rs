//! Running graphs.
//!
//! An [`Execution`] owns the workers of one built orchestration. It moves
//! through three states:
//!
//! ```text
//! Built --start()--> Running --stop()--> Stopped
//! ```
//!
//! `start` spawns every worker as its own task. `stop` broadcasts the
//! shutdown signal and waits until every task has returned. Stopped is
//! terminal; `stop` consumes the execution so it cannot be reused.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::flow::FlowId;

pub(crate) mod worker;


pub use worker::WorkerKind;
pub(crate) use worker::{MergeWorker, Outlet, SinkWorker, SourceWorker, UnaryWorker, Worker};

/// Default capacity of the shared error channel.
pub const DEFAULT_ERROR_CAPACITY: usize = 64;

/// Observer channel capacity for error subscribers.
const OBSERVER_CAPACITY: usize = 256;

// ============================================================================
// Errors and policy
// ============================================================================

/// A runtime failure of one stage on one flow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("stage '{stage}' failed on flow {flow_id}: {error}")]
pub struct StageError {
    pub stage: String,
    pub flow_id: FlowId,
    pub error: EngineError,
}

/// What the execution does with invocation failures read from the shared
/// error channel. The failing flow unit is always dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the execution on an error no subscriber is keeping up with.
    #[default]
    Escalate,
    /// Log and keep running.
    Absorb,
    /// Stop the execution on any error, observed or not.
    FailFast,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailurePolicy::Escalate => "escalate",
            FailurePolicy::Absorb => "absorb",
            FailurePolicy::FailFast => "fail_fast",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Shutdown signal
// ============================================================================

/// Receiving side of the shared termination broadcast.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// Resolves once termination is signaled or the sender is gone.
    pub async fn signaled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_signaled(&self) -> bool {
        *self.rx.borrow()
    }
}

// ============================================================================
// Execution
// ============================================================================

/// Lifecycle state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Built,
    Running,
    Stopped,
}

/// Options an execution is built with.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionOptions {
    pub failure_policy: FailurePolicy,
    pub error_capacity: usize,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            error_capacity: DEFAULT_ERROR_CAPACITY,
        }
    }
}

/// A spawned worker task.
struct Task {
    stage: String,
    kind: WorkerKind,
    handle: JoinHandle<()>,
}

/// The live worker set of one orchestration.
pub struct Execution {
    id: Uuid,
    orchestration: String,
    options: ExecutionOptions,
    state: ExecutionState,
    workers: Vec<Worker>,
    layout: BTreeMap<String, Vec<WorkerKind>>,
    shutdown: Option<Arc<watch::Sender<bool>>>,
    tasks: Vec<Task>,
    supervisor: Option<JoinHandle<()>>,
    failure: Arc<Mutex<Option<StageError>>>,
    observers: broadcast::Sender<StageError>,
}

impl Execution {
    pub(crate) fn new(orchestration: impl Into<String>, workers: Vec<Worker>, options: ExecutionOptions) -> Self {
        let mut layout: BTreeMap<String, Vec<WorkerKind>> = BTreeMap::new();
        for worker in &workers {
            layout
                .entry(worker.stage().to_string())
                .or_default()
                .push(worker.kind());
        }
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);

        Self {
            id: Uuid::new_v4(),
            orchestration: orchestration.into(),
            options,
            state: ExecutionState::Built,
            workers,
            layout,
            shutdown: None,
            tasks: Vec::new(),
            supervisor: None,
            failure: Arc::new(Mutex::new(None)),
            observers,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn orchestration(&self) -> &str {
        &self.orchestration
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Worker kinds per stage name.
    pub fn layout(&self) -> &BTreeMap<String, Vec<WorkerKind>> {
        &self.layout
    }

    /// Total number of workers, synthetic ones included.
    pub fn worker_count(&self) -> usize {
        self.layout.values().map(Vec::len).sum()
    }

    /// Subscribe to every stage error from now on.
    ///
    /// Under [`FailurePolicy::Escalate`] an error counts as handled when it
    /// was delivered to at least one subscriber and no subscriber has fallen
    /// a full buffer (256 errors) behind. Subscribing and never reading
    /// therefore escalates once that buffer fills.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<StageError> {
        self.observers.subscribe()
    }

    /// The error that forced this execution to stop, if any.
    pub fn failure(&self) -> Option<StageError> {
        self.failure.lock().ok().and_then(|f| f.clone())
    }

    /// True when every worker task has returned.
    pub fn is_finished(&self) -> bool {
        match self.state {
            ExecutionState::Built => false,
            ExecutionState::Running => self.tasks.iter().all(|t| t.handle.is_finished()),
            ExecutionState::Stopped => true,
        }
    }

    /// Launch every worker. Only valid once, from Built.
    pub fn start(&mut self) -> crate::error::Result<()> {
        if self.state != ExecutionState::Built {
            return Err(EngineError::failed_precondition(format!(
                "execution {} of '{}' cannot start from {:?}",
                self.id, self.orchestration, self.state
            )));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);
        let (error_tx, error_rx) = mpsc::channel(self.options.error_capacity.max(1));

        for worker in self.workers.drain(..) {
            let stage = worker.stage().to_string();
            let kind = worker.kind();
            let handle = tokio::spawn(worker.run(Shutdown::new(shutdown_rx.clone()), error_tx.clone()));
            self.tasks.push(Task {
                stage,
                kind,
                handle,
            });
        }
        // Workers hold the only senders now, so the supervisor ends with them.
        drop(error_tx);

        self.supervisor = Some(tokio::spawn(supervise(
            self.orchestration.clone(),
            self.options.failure_policy,
            error_rx,
            self.observers.clone(),
            shutdown_tx.clone(),
            self.failure.clone(),
        )));
        self.shutdown = Some(shutdown_tx);
        self.state = ExecutionState::Running;

        info!(
            orchestration = %self.orchestration,
            execution = %self.id,
            workers = self.tasks.len(),
            policy = %self.options.failure_policy,
            "Execution started"
        );
        Ok(())
    }

    /// Wait for every worker to return on its own (finite sources, or an
    /// escalated failure). Returns the escalated failure, if any.
    pub async fn wait(&mut self) -> Result<(), StageError> {
        self.join().await;
        self.outcome()
    }

    /// Signal termination and wait until every worker acknowledged it.
    pub async fn stop(mut self) -> Result<(), StageError> {
        if let Some(shutdown) = &self.shutdown {
            shutdown.send_replace(true);
        }
        self.join().await;
        info!(
            orchestration = %self.orchestration,
            execution = %self.id,
            "Execution stopped"
        );
        self.outcome()
    }

    async fn join(&mut self) {
        for task in self.tasks.drain(..) {
            if let Err(e) = task.handle.await {
                error!(
                    orchestration = %self.orchestration,
                    stage = %task.stage,
                    kind = %task.kind,
                    error = %e,
                    "Worker task failed"
                );
            }
        }
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(e) = supervisor.await {
                error!(orchestration = %self.orchestration, error = %e, "Supervisor task failed");
            }
        }
        self.state = ExecutionState::Stopped;
    }

    fn outcome(&self) -> Result<(), StageError> {
        match self.failure() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("id", &self.id)
            .field("orchestration", &self.orchestration)
            .field("state", &self.state)
            .field("layout", &self.layout)
            .finish()
    }
}

impl Drop for Execution {
    fn drop(&mut self) {
        // Never leave detached workers behind an execution nobody can stop.
        if self.state == ExecutionState::Running {
            if let Some(shutdown) = &self.shutdown {
                shutdown.send_replace(true);
            }
        }
    }
}

/// Reads the shared error channel and applies the failure policy.
async fn supervise(
    orchestration: String,
    policy: FailurePolicy,
    mut errors: mpsc::Receiver<StageError>,
    observers: broadcast::Sender<StageError>,
    shutdown: Arc<watch::Sender<bool>>,
    failure: Arc<Mutex<Option<StageError>>>,
) {
    while let Some(err) = errors.recv().await {
        // A full buffer means this send evicts an error someone never read.
        let lagging = observers.len() >= OBSERVER_CAPACITY;
        let observed = observers.send(err.clone()).is_ok() && !lagging;
        let escalate = match policy {
            FailurePolicy::Escalate => !observed,
            FailurePolicy::Absorb => false,
            FailurePolicy::FailFast => true,
        };

        if !escalate {
            debug!(
                orchestration = %orchestration,
                stage = %err.stage,
                flow_id = err.flow_id,
                observed,
                "Stage error handled"
            );
            continue;
        }

        error!(
            orchestration = %orchestration,
            stage = %err.stage,
            flow_id = err.flow_id,
            error = %err.error,
            "Unhandled stage error, stopping execution"
        );
        if let Ok(mut slot) = failure.lock() {
            if slot.is_none() {
                *slot = Some(err);
            }
        } else {
            warn!(orchestration = %orchestration, "Failure slot poisoned");
        }
        shutdown.send_replace(true);
    }
}
