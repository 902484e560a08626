//! Graph builder: turns a declared orchestration into a runnable
//! [`Execution`].
//!
//! Building is all-or-nothing. Every stage is resolved and every link is
//! checked before a single channel is created, and no worker runs until the
//! caller starts the returned execution.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use prost_reflect::FieldDescriptor;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::definition::{LinkDef, StageDef};
use crate::error::{EngineError, Result};
use crate::execution::{
    Execution, ExecutionOptions, MergeWorker, Outlet, SinkWorker, SourceWorker, UnaryWorker,
    Worker,
};
use crate::flow::Flow;
use crate::resolver::{MethodHandle, Resolver};
use crate::schema::MessageSchema;
use crate::storage::DefinitionStore;

mod ports;
mod route;

#[cfg(test)]
mod tests;

use ports::{InputPorts, OutputPorts};
pub use route::Route;

/// Default per-link channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1;

/// Knobs applied to every graph a builder produces.
#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    /// Slots per link channel. Zero is raised to one.
    pub channel_capacity: usize,
    /// Sources emit this many flows, then a terminal.
    pub source_limit: Option<u64>,
    pub execution: ExecutionOptions,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            source_limit: None,
            execution: ExecutionOptions::default(),
        }
    }
}

/// A stage after resolution, collecting its link registrations.
struct Node {
    def: StageDef,
    method: MethodHandle,
    inputs: InputPorts,
    outputs: OutputPorts,
}

/// A checked link with its routing.
struct Edge {
    route: Route,
}

/// Builds executions from stored definitions.
#[derive(Clone)]
pub struct GraphBuilder {
    store: Arc<dyn DefinitionStore>,
    resolver: Resolver,
    options: BuildOptions,
}

impl GraphBuilder {
    pub fn new(store: Arc<dyn DefinitionStore>, resolver: Resolver) -> Self {
        Self {
            store,
            resolver,
            options: BuildOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Build the orchestration named `name`.
    pub async fn build(&self, name: &str) -> Result<Execution> {
        let orchestration = self.store.load_orchestration(name).await?;
        debug!(
            orchestration = %name,
            stages = orchestration.stages.len(),
            links = orchestration.links.len(),
            "Building graph"
        );

        let stages = try_join_all(orchestration.stages.iter().map(|s| self.store.load_stage(s))).await?;
        let links = try_join_all(orchestration.links.iter().map(|l| self.store.load_link(l))).await?;

        let methods = try_join_all(stages.iter().map(|stage| self.resolve(stage))).await?;

        let mut nodes: Vec<Node> = Vec::with_capacity(stages.len());
        let mut index: HashMap<String, usize> = HashMap::new();
        for (def, method) in stages.into_iter().zip(methods) {
            if index.insert(def.name.clone(), nodes.len()).is_some() {
                return Err(EngineError::invalid_argument(format!(
                    "stage '{}' is declared twice in orchestration '{}'",
                    def.name, name
                )));
            }
            nodes.push(Node {
                inputs: InputPorts::new(&def.name),
                outputs: OutputPorts::new(&def.name),
                def,
                method,
            });
        }

        let mut edges: HashMap<String, Edge> = HashMap::new();
        for link in &links {
            let (source, target, edge) = check_link(link, &nodes, &index)?;
            nodes[target]
                .inputs
                .register(&link.name, link.target.field.as_deref())?;
            nodes[source].outputs.register(&link.name)?;
            edges.insert(link.name.clone(), edge);
        }

        let workers = self.wire(nodes, edges)?;
        let execution = Execution::new(name, workers, self.options.execution);
        info!(
            orchestration = %name,
            execution = %execution.id(),
            workers = execution.worker_count(),
            "Graph built"
        );
        Ok(execution)
    }

    async fn resolve(&self, stage: &StageDef) -> Result<MethodHandle> {
        let method = self
            .resolver
            .resolve(&stage.address, stage.service.as_deref(), stage.method.as_deref())
            .await
            .map_err(|e| e.context(format!("stage '{}'", stage.name)))?;
        if !method.is_unary() {
            return Err(EngineError::invalid_argument(format!(
                "stage '{}': {} is not unary",
                stage.name,
                method.path()
            )));
        }
        debug!(stage = %stage.name, path = %method.path(), "Stage resolved");
        Ok(method)
    }

    fn channel(&self) -> (mpsc::Sender<Flow>, mpsc::Receiver<Flow>) {
        mpsc::channel(self.options.channel_capacity.max(1))
    }

    /// Create channels and workers for a fully checked graph.
    fn wire(&self, nodes: Vec<Node>, mut edges: HashMap<String, Edge>) -> Result<Vec<Worker>> {
        let mut senders: HashMap<String, mpsc::Sender<Flow>> = HashMap::new();
        let mut receivers: HashMap<String, mpsc::Receiver<Flow>> = HashMap::new();
        for link in edges.keys() {
            let (tx, rx) = self.channel();
            senders.insert(link.clone(), tx);
            receivers.insert(link.clone(), rx);
        }

        let mut workers = Vec::new();
        for node in nodes {
            let stage = node.def.name.clone();

            let input = match node.inputs.len() {
                0 => {
                    let (tx, rx) = self.channel();
                    workers.push(Worker::Source(SourceWorker {
                        stage: stage.clone(),
                        schema: node.method.input().clone(),
                        output: tx,
                        limit: self.options.source_limit,
                    }));
                    rx
                }
                1 => take(&mut receivers, &node.inputs.ports()[0].link)?,
                n if node.def.merge => {
                    let mut inputs: Vec<(FieldDescriptor, mpsc::Receiver<Flow>)> = Vec::with_capacity(n);
                    for port in node.inputs.ports() {
                        let field = port
                            .field
                            .as_deref()
                            .and_then(|name| node.method.input().projectable_field(name))
                            .ok_or_else(|| {
                                EngineError::invalid_argument(format!(
                                    "stage '{}' merges {} links, link '{}' must name a target field",
                                    stage, n, port.link
                                ))
                            })?;
                        inputs.push((field, take(&mut receivers, &port.link)?));
                    }
                    let (tx, rx) = self.channel();
                    workers.push(Worker::Merge(MergeWorker {
                        stage: stage.clone(),
                        schema: node.method.input().clone(),
                        inputs,
                        output: tx,
                    }));
                    rx
                }
                n => {
                    return Err(EngineError::invalid_argument(format!(
                        "stage '{}' has {} input links; joining them requires merge",
                        stage, n
                    )))
                }
            };

            let output = match node.outputs.len() {
                0 => {
                    let (tx, rx) = self.channel();
                    workers.push(Worker::Sink(SinkWorker {
                        stage: stage.clone(),
                        input: rx,
                    }));
                    Outlet::direct(tx)
                }
                1 => {
                    let link = &node.outputs.links()[0];
                    let tx = senders
                        .remove(link)
                        .ok_or_else(|| EngineError::unknown(format!("link '{}' wired twice", link)))?;
                    let edge = edges
                        .remove(link)
                        .ok_or_else(|| EngineError::unknown(format!("link '{}' has no route", link)))?;
                    Outlet::routed(tx, edge.route)
                }
                n => {
                    return Err(EngineError::invalid_argument(format!(
                        "stage '{}' has {} output links; at most one is supported",
                        stage, n
                    )))
                }
            };

            debug!(stage = %stage, path = %node.method.path(), "Stage wired");
            workers.push(Worker::Unary(UnaryWorker {
                stage,
                method: node.method,
                input,
                output,
            }));
        }

        Ok(workers)
    }
}

/// Index of the stage a link end refers to.
fn lookup(link: &LinkDef, index: &HashMap<String, usize>, stage: &str) -> Result<usize> {
    index.get(stage).copied().ok_or_else(|| {
        EngineError::not_found(format!(
            "link '{}' refers to stage '{}' outside the orchestration",
            link.name, stage
        ))
    })
}

/// Project both ends of a link and check they are compatible. Returns the
/// source and target stage indices with the link's route.
fn check_link(link: &LinkDef, nodes: &[Node], index: &HashMap<String, usize>) -> Result<(usize, usize, Edge)> {
    let source_index = lookup(link, index, &link.source.stage)?;
    let target_index = lookup(link, index, &link.target.stage)?;
    let (source, target) = (&nodes[source_index], &nodes[target_index]);

    let (source_schema, source_field) = project(source.method.output(), link.source.field.as_deref())?;
    let (target_schema, target_field) = project(target.method.input(), link.target.field.as_deref())?;

    if !source_schema.compatible(&target_schema) {
        return Err(EngineError::invalid_argument(format!(
            "link '{}': {} ({}) is not compatible with {} ({})",
            link.name, link.source, source_schema, link.target, target_schema
        )));
    }

    let mut route = Route::whole(target.method.input().clone());
    if let Some(field) = source_field {
        route = route.from_field(field);
    }
    if let Some(field) = target_field {
        route = route.into_field(field)?;
    }
    debug!(link = %link.name, source = %link.source, target = %link.target, "Link checked");
    Ok((source_index, target_index, Edge { route }))
}

/// Schema at one end of a link, plus the projected field if any.
fn project(schema: &MessageSchema, field: Option<&str>) -> Result<(MessageSchema, Option<FieldDescriptor>)> {
    match field {
        None => Ok((schema.clone(), None)),
        Some(name) => {
            let projected = schema.project(name)?;
            let descriptor = schema
                .projectable_field(name)
                .ok_or_else(|| EngineError::not_found(format!("field '{}' of {}", name, schema)))?;
            Ok((projected, Some(descriptor)))
        }
    }
}

fn take(receivers: &mut HashMap<String, mpsc::Receiver<Flow>>, link: &str) -> Result<mpsc::Receiver<Flow>> {
    receivers
        .remove(link)
        .ok_or_else(|| EngineError::unknown(format!("link '{}' wired twice", link)))
}
