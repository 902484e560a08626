//! Workers: one concurrent task per stage plus synthetic source, sink and
//! merge shims.
//!
//! Workers only talk through the channels handed to them at build time.
//! Every suspension point races the shared shutdown signal.

use std::collections::HashMap;
use std::fmt;

use prost_reflect::{DynamicMessage, FieldDescriptor};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, trace, warn};

use super::{Shutdown, StageError};
use crate::flow::{Flow, FlowId};
use crate::graph::Route;
use crate::resolver::MethodHandle;
use crate::schema::MessageSchema;

/// Producer end of a channel, with the link routing to apply before sending.
pub(crate) struct Outlet {
    tx: mpsc::Sender<Flow>,
    route: Option<Route>,
}

impl Outlet {
    /// Send payloads unchanged.
    pub(crate) fn direct(tx: mpsc::Sender<Flow>) -> Self {
        Self { tx, route: None }
    }

    /// Route payloads through a link before sending.
    pub(crate) fn routed(tx: mpsc::Sender<Flow>, route: Route) -> Self {
        Self {
            tx,
            route: Some(route),
        }
    }
}

/// A runnable worker.
pub(crate) enum Worker {
    Source(SourceWorker),
    Sink(SinkWorker),
    Unary(UnaryWorker),
    Merge(MergeWorker),
}

impl Worker {
    /// Stage this worker belongs to.
    pub(crate) fn stage(&self) -> &str {
        match self {
            Worker::Source(w) => &w.stage,
            Worker::Sink(w) => &w.stage,
            Worker::Unary(w) => &w.stage,
            Worker::Merge(w) => &w.stage,
        }
    }

    pub(crate) fn kind(&self) -> WorkerKind {
        match self {
            Worker::Source(_) => WorkerKind::Source,
            Worker::Sink(_) => WorkerKind::Sink,
            Worker::Unary(_) => WorkerKind::Unary,
            Worker::Merge(_) => WorkerKind::Merge,
        }
    }

    pub(crate) async fn run(self, shutdown: Shutdown, errors: mpsc::Sender<StageError>) {
        match self {
            Worker::Source(w) => w.run(shutdown).await,
            Worker::Sink(w) => w.run(shutdown).await,
            Worker::Unary(w) => w.run(shutdown, errors).await,
            Worker::Merge(w) => w.run(shutdown).await,
        }
    }
}

/// Worker kinds, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Source,
    Sink,
    Unary,
    Merge,
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerKind::Source => "source",
            WorkerKind::Sink => "sink",
            WorkerKind::Unary => "unary",
            WorkerKind::Merge => "merge",
        };
        f.write_str(name)
    }
}

/// Send a flow unless shutdown wins the race. Returns false when the worker
/// should exit.
async fn send_or_shutdown(tx: &mpsc::Sender<Flow>, flow: Flow, shutdown: &mut Shutdown) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.signaled() => false,
        sent = tx.send(flow) => sent.is_ok(),
    }
}

// ============================================================================
// Source
// ============================================================================

/// Feeds a stage with no upstream link: empty input messages, ids from 1.
pub(crate) struct SourceWorker {
    pub(crate) stage: String,
    pub(crate) schema: MessageSchema,
    pub(crate) output: mpsc::Sender<Flow>,
    /// Emit this many flows, then a terminal. `None` runs until shutdown.
    pub(crate) limit: Option<u64>,
}

impl SourceWorker {
    async fn run(self, mut shutdown: Shutdown) {
        let SourceWorker {
            stage,
            schema,
            output,
            limit,
        } = self;

        let mut next: FlowId = 1;
        loop {
            let exhausted = limit.is_some_and(|max| next > max);
            let flow = if exhausted {
                Flow::terminal(next)
            } else {
                Flow::data(next, schema.new_empty())
            };

            if !send_or_shutdown(&output, flow, &mut shutdown).await {
                debug!(stage = %stage, emitted = next - 1, "Source stopped");
                return;
            }
            if exhausted {
                debug!(stage = %stage, emitted = next - 1, "Source exhausted");
                return;
            }
            next += 1;
        }
    }
}

// ============================================================================
// Sink
// ============================================================================

/// Drains a stage with no downstream link.
pub(crate) struct SinkWorker {
    pub(crate) stage: String,
    pub(crate) input: mpsc::Receiver<Flow>,
}

impl SinkWorker {
    async fn run(self, mut shutdown: Shutdown) {
        let SinkWorker { stage, mut input } = self;
        let mut drained: u64 = 0;

        loop {
            let flow = tokio::select! {
                biased;
                _ = shutdown.signaled() => break,
                flow = input.recv() => flow,
            };
            match flow {
                Some(flow) if !flow.is_terminal() => {
                    trace!(stage = %stage, flow_id = flow.id(), "Sink discarded flow");
                    drained += 1;
                }
                _ => break,
            }
        }

        debug!(stage = %stage, drained, "Sink stopped");
    }
}

// ============================================================================
// Unary
// ============================================================================

/// Calls a stage's remote method once per flow, keeping the flow id.
pub(crate) struct UnaryWorker {
    pub(crate) stage: String,
    pub(crate) method: MethodHandle,
    pub(crate) input: mpsc::Receiver<Flow>,
    pub(crate) output: Outlet,
}

impl UnaryWorker {
    async fn run(self, mut shutdown: Shutdown, errors: mpsc::Sender<StageError>) {
        let UnaryWorker {
            stage,
            method,
            mut input,
            output,
        } = self;
        let mut last_id: FlowId = 0;

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.signaled() => break,
                flow = input.recv() => flow,
            };

            // A closed input means the producer is gone: same as a terminal.
            let flow = match received {
                Some(flow) if !flow.is_terminal() => flow,
                received => {
                    let end = received.map_or(last_id + 1, |end| end.id());
                    debug!(stage = %stage, end, "Upstream finished, forwarding terminal");
                    send_or_shutdown(&output.tx, Flow::terminal(end), &mut shutdown).await;
                    break;
                }
            };

            let id = flow.id();
            last_id = id;
            let Some(request) = flow.into_payload() else {
                continue;
            };

            let result = tokio::select! {
                biased;
                _ = shutdown.signaled() => break,
                result = method.invoke(request) => result,
            };

            let routed = result.and_then(|reply| match &output.route {
                Some(route) => route.apply(&reply),
                None => Ok(reply),
            });

            match routed {
                Ok(payload) => {
                    trace!(stage = %stage, flow_id = id, "Invocation succeeded");
                    if !send_or_shutdown(&output.tx, Flow::data(id, payload), &mut shutdown).await {
                        break;
                    }
                }
                Err(error) => {
                    warn!(
                        stage = %stage,
                        flow_id = id,
                        error = %error,
                        "Invocation failed, dropping flow"
                    );
                    let report = StageError {
                        stage: stage.clone(),
                        flow_id: id,
                        error,
                    };
                    let reported = tokio::select! {
                        biased;
                        _ = shutdown.signaled() => false,
                        sent = errors.send(report) => sent.is_ok(),
                    };
                    if !reported && shutdown.is_signaled() {
                        break;
                    }
                }
            }
        }

        debug!(stage = %stage, last_flow = last_id, "Unary worker stopped");
    }
}

// ============================================================================
// Merge
// ============================================================================

/// Joins field-targeted inputs that share a flow id into one message.
pub(crate) struct MergeWorker {
    pub(crate) stage: String,
    pub(crate) schema: MessageSchema,
    /// Declared input fields and the channel each arrives on.
    pub(crate) inputs: Vec<(FieldDescriptor, mpsc::Receiver<Flow>)>,
    pub(crate) output: mpsc::Sender<Flow>,
}

/// A composite under assembly.
struct Pending {
    message: DynamicMessage,
    filled: Vec<bool>,
    remaining: usize,
}

impl Pending {
    fn new(message: DynamicMessage, fields: usize) -> Self {
        Self {
            message,
            filled: vec![false; fields],
            remaining: fields,
        }
    }

    fn fill(&mut self, slot: usize, field: &FieldDescriptor, partial: &DynamicMessage) -> bool {
        let value = partial.get_field(field).into_owned();
        if self.message.try_set_field(field, value).is_err() {
            return false;
        }
        if !self.filled[slot] {
            self.filled[slot] = true;
            self.remaining -= 1;
        }
        true
    }

    fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

impl MergeWorker {
    async fn run(self, mut shutdown: Shutdown) {
        let MergeWorker {
            stage,
            schema,
            inputs,
            output,
        } = self;

        let mut fields = Vec::with_capacity(inputs.len());
        let mut streams = StreamMap::new();
        for (slot, (field, rx)) in inputs.into_iter().enumerate() {
            fields.push(field);
            streams.insert(slot, ReceiverStream::new(rx));
        }

        let mut pending: HashMap<FlowId, Pending> = HashMap::new();
        let mut last_id: FlowId = 0;
        let mut end_id: Option<FlowId> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.signaled() => break,
                next = streams.next() => next,
            };

            let Some((slot, flow)) = next else {
                // Every input closed.
                let end = end_id.unwrap_or(last_id + 1);
                send_or_shutdown(&output, Flow::terminal(end), &mut shutdown).await;
                break;
            };

            if flow.is_terminal() {
                streams.remove(&slot);
                end_id = Some(end_id.map_or(flow.id(), |end| end.max(flow.id())));
                debug!(stage = %stage, field = %fields[slot].name(), "Merge input finished");
                if streams.is_empty() {
                    let end = end_id.unwrap_or(last_id + 1);
                    send_or_shutdown(&output, Flow::terminal(end), &mut shutdown).await;
                    break;
                }
                continue;
            }

            let id = flow.id();
            let Some(partial) = flow.into_payload() else {
                continue;
            };

            let entry = pending
                .entry(id)
                .or_insert_with(|| Pending::new(schema.new_empty(), fields.len()));
            if !entry.fill(slot, &fields[slot], &partial) {
                warn!(
                    stage = %stage,
                    flow_id = id,
                    field = %fields[slot].name(),
                    "Merge input does not fit its field, ignoring"
                );
                continue;
            }
            if !entry.is_complete() {
                continue;
            }

            if let Some(done) = pending.remove(&id) {
                last_id = last_id.max(id);
                trace!(stage = %stage, flow_id = id, "Merge emitted composite");
                if !send_or_shutdown(&output, Flow::data(id, done.message), &mut shutdown).await {
                    break;
                }
            }
        }

        if !pending.is_empty() {
            warn!(
                stage = %stage,
                incomplete = pending.len(),
                "Merge stopped with incomplete flows"
            );
        }
        debug!(stage = %stage, "Merge worker stopped");
    }
}
