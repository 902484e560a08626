//! RPC method resolution through server reflection.
//!
//! Given an address and optional service/method names, the [`Resolver`]
//! discovers the single method a stage refers to and returns a
//! [`MethodHandle`]: its schemas plus the means to invoke it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use prost_reflect::{DynamicMessage, MethodDescriptor};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::schema::MessageSchema;
use crate::transport::{Connection, Transport};


/// Reflection services never count as candidates.
pub const REFLECTION_SERVICES: &[&str] = &[
    "grpc.reflection.v1alpha.ServerReflection",
    "grpc.reflection.v1.ServerReflection",
];

/// Default per-call invocation timeout.
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(1);

/// A resolved remote method: schemas and an invoker.
#[derive(Clone)]
pub struct MethodHandle {
    name: String,
    path: String,
    input: MessageSchema,
    output: MessageSchema,
    client_streaming: bool,
    server_streaming: bool,
    connection: Arc<dyn Connection>,
    timeout: Duration,
}

impl MethodHandle {
    fn new(method: &MethodDescriptor, connection: Arc<dyn Connection>, timeout: Duration) -> Self {
        Self {
            name: method.name().to_string(),
            path: format!("/{}/{}", method.parent_service().full_name(), method.name()),
            input: MessageSchema::new(method.input()),
            output: MessageSchema::new(method.output()),
            client_streaming: method.is_client_streaming(),
            server_streaming: method.is_server_streaming(),
            connection,
            timeout,
        }
    }

    /// Method name, e.g. `Double`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invocation path, e.g. `/demo.Doubler/Double`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn input(&self) -> &MessageSchema {
        &self.input
    }

    pub fn output(&self) -> &MessageSchema {
        &self.output
    }

    /// Neither side streams.
    pub fn is_unary(&self) -> bool {
        !self.client_streaming && !self.server_streaming
    }

    /// Invoke the method, bounded by the per-call timeout.
    pub async fn invoke(&self, request: DynamicMessage) -> Result<DynamicMessage> {
        let call = self
            .connection
            .invoke(&self.path, request, self.output.descriptor());
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::unknown(format!(
                "{} timed out after {:?}",
                self.path, self.timeout
            ))),
        }
    }
}

impl fmt::Debug for MethodHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodHandle")
            .field("path", &self.path)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("client_streaming", &self.client_streaming)
            .field("server_streaming", &self.server_streaming)
            .finish()
    }
}

/// Resolves stage declarations into method handles.
#[derive(Clone)]
pub struct Resolver {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl Resolver {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            timeout: DEFAULT_INVOKE_TIMEOUT,
        }
    }

    /// Per-call timeout given to every handle this resolver creates.
    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Dial `address` and resolve the method it refers to.
    pub async fn resolve(
        &self,
        address: &str,
        service: Option<&str>,
        method: Option<&str>,
    ) -> Result<MethodHandle> {
        let connection = self.transport.connect(address).await?;
        self.resolve_on(connection, service, method).await
    }

    /// Resolve on an already open connection.
    pub async fn resolve_on(
        &self,
        connection: Arc<dyn Connection>,
        service: Option<&str>,
        method: Option<&str>,
    ) -> Result<MethodHandle> {
        let services: Vec<String> = connection
            .list_services()
            .await?
            .into_iter()
            .filter(|s| !REFLECTION_SERVICES.contains(&s.as_str()))
            .collect();

        let service_name = choose("service", service, &services)?;
        let descriptor = connection.service_descriptor(&service_name).await?;

        let methods: Vec<String> = descriptor.methods().map(|m| m.name().to_string()).collect();
        let method_name = choose("method", method, &methods)?;
        let method = descriptor
            .methods()
            .find(|m| m.name() == method_name)
            .ok_or_else(|| EngineError::not_found(format!("method {}", method_name)))?;

        let handle = MethodHandle::new(&method, connection, self.timeout);
        debug!(
            path = %handle.path(),
            input = %handle.input(),
            output = %handle.output(),
            unary = handle.is_unary(),
            "Resolved method"
        );
        Ok(handle)
    }
}

/// Pick the requested candidate, or the only one when none was requested.
fn choose(what: &str, requested: Option<&str>, candidates: &[String]) -> Result<String> {
    match requested {
        Some(name) => candidates
            .iter()
            .find(|c| c.as_str() == name)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("{} '{}'", what, name))),
        None => match candidates {
            [only] => Ok(only.clone()),
            _ => Err(EngineError::invalid_argument(format!(
                "ambiguous {}: {} candidates ({})",
                what,
                candidates.len(),
                candidates.join(", ")
            ))),
        },
    }
}
