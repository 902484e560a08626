//! rpcflow - gRPC stage pipelines
//!
//! Builds a declared graph of remote unary RPC methods into concurrent
//! workers and pumps correlated messages through it. Schemas come from
//! server reflection; nothing is compiled in ahead of time.

pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod execution;
pub mod flow;
pub mod graph;
pub mod resolver;
pub mod schema;
pub mod storage;
pub mod transport;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use definition::{LinkDef, LinkEnd, OrchestrationDef, Phase, StageDef};
pub use engine::Engine;
pub use error::{EngineError, ErrorKind, Result};
pub use execution::{Execution, FailurePolicy, StageError};
pub use graph::GraphBuilder;
pub use resolver::{MethodHandle, Resolver};
pub use schema::MessageSchema;
