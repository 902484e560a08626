//! Engine runtime configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::execution::{ExecutionOptions, FailurePolicy, DEFAULT_ERROR_CAPACITY};
use crate::graph::{BuildOptions, DEFAULT_CHANNEL_CAPACITY};

/// Default per-call invocation timeout in milliseconds.
pub const DEFAULT_INVOKE_TIMEOUT_MS: u64 = 1000;
/// Default dial timeout for stage endpoints in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
/// Default bound on one reflection exchange in milliseconds.
pub const DEFAULT_REFLECTION_TIMEOUT_MS: u64 = 5000;

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-call RPC timeout.
    pub invoke_timeout_ms: u64,
    /// Dial timeout for stage endpoints.
    pub connect_timeout_ms: u64,
    /// Bound on each reflection exchange while resolving stages.
    pub reflection_timeout_ms: u64,
    /// Slots per link channel.
    pub channel_capacity: usize,
    /// Slots in the shared error channel.
    pub error_capacity: usize,
    /// What to do with invocation failures.
    pub failure_policy: FailurePolicy,
    /// Sources emit this many flows, then finish. None = run until stopped.
    pub source_limit: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            invoke_timeout_ms: DEFAULT_INVOKE_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            reflection_timeout_ms: DEFAULT_REFLECTION_TIMEOUT_MS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            error_capacity: DEFAULT_ERROR_CAPACITY,
            failure_policy: FailurePolicy::default(),
            source_limit: None,
        }
    }
}

impl EngineConfig {
    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reflection_timeout(&self) -> Duration {
        Duration::from_millis(self.reflection_timeout_ms)
    }

    /// Options handed to the graph builder.
    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            channel_capacity: self.channel_capacity,
            source_limit: self.source_limit,
            execution: ExecutionOptions {
                failure_policy: self.failure_policy,
                error_capacity: self.error_capacity,
            },
        }
    }
}
