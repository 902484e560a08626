//! Test utilities and in-memory implementations.
//!
//! Builds descriptor pools from hand-assembled `FileDescriptorProto`s and
//! provides [`MemoryTransport`], a transport whose "servers" are closures over
//! dynamic messages, so graphs can be built and run without sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use prost_reflect::{
    DescriptorPool, DynamicMessage, MessageDescriptor, ReflectMessage, ServiceDescriptor, Value,
};
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
    MethodDescriptorProto, ServiceDescriptorProto,
};
use tonic::Status;

use crate::error::{EngineError, Result};
use crate::transport::{Connection, Transport};

// ============================================================================
// Descriptor builders
// ============================================================================

/// Assembles a single proto3 file into a descriptor pool.
pub struct FileBuilder {
    proto: FileDescriptorProto,
}

impl FileBuilder {
    pub fn new(package: &str) -> Self {
        Self {
            proto: FileDescriptorProto {
                name: Some(format!("{}.proto", package.replace('.', "/"))),
                package: Some(package.to_string()),
                syntax: Some("proto3".to_string()),
                ..Default::default()
            },
        }
    }

    pub fn message(mut self, name: &str, fields: Vec<FieldDescriptorProto>) -> Self {
        self.proto.message_type.push(DescriptorProto {
            name: Some(name.to_string()),
            field: fields,
            ..Default::default()
        });
        self
    }

    pub fn service(mut self, name: &str, methods: Vec<MethodDescriptorProto>) -> Self {
        self.proto.service.push(ServiceDescriptorProto {
            name: Some(name.to_string()),
            method: methods,
            ..Default::default()
        });
        self
    }

    pub fn build(self) -> DescriptorPool {
        DescriptorPool::from_file_descriptor_set(FileDescriptorSet {
            file: vec![self.proto],
        })
        .expect("test descriptors must be valid")
    }
}

fn field(name: &str, number: i32, label: Label, ty: Type, type_name: Option<&str>) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        number: Some(number),
        label: Some(label as i32),
        r#type: Some(ty as i32),
        type_name: type_name.map(|t| format!(".{}", t)),
        json_name: Some(name.to_string()),
        ..Default::default()
    }
}

/// A singular scalar field.
pub fn scalar(name: &str, number: i32, ty: Type) -> FieldDescriptorProto {
    field(name, number, Label::Optional, ty, None)
}

/// A repeated scalar field.
pub fn repeated(name: &str, number: i32, ty: Type) -> FieldDescriptorProto {
    field(name, number, Label::Repeated, ty, None)
}

/// A singular message field; `type_name` is fully qualified without the dot.
pub fn message_field(name: &str, number: i32, type_name: &str) -> FieldDescriptorProto {
    field(name, number, Label::Optional, Type::Message, Some(type_name))
}

/// A repeated message field.
pub fn repeated_message(name: &str, number: i32, type_name: &str) -> FieldDescriptorProto {
    field(name, number, Label::Repeated, Type::Message, Some(type_name))
}

/// A unary method.
pub fn unary(name: &str, input: &str, output: &str) -> MethodDescriptorProto {
    streaming(name, input, output, false, false)
}

/// A method with explicit streaming flags.
pub fn streaming(
    name: &str,
    input: &str,
    output: &str,
    client_streaming: bool,
    server_streaming: bool,
) -> MethodDescriptorProto {
    MethodDescriptorProto {
        name: Some(name.to_string()),
        input_type: Some(format!(".{}", input)),
        output_type: Some(format!(".{}", output)),
        client_streaming: Some(client_streaming),
        server_streaming: Some(server_streaming),
        ..Default::default()
    }
}

/// Look up a message descriptor, panicking if it does not exist.
pub fn message(pool: &DescriptorPool, name: &str) -> MessageDescriptor {
    pool.get_message_by_name(name)
        .unwrap_or_else(|| panic!("message {} not in pool", name))
}

/// Shorthand for a message with a single `int64 value = 1`.
pub fn int_message(descriptor: &MessageDescriptor, value: i64) -> DynamicMessage {
    let mut msg = DynamicMessage::new(descriptor.clone());
    msg.set_field_by_name("value", Value::I64(value));
    msg
}

/// Read `int64 value = 1` back out of a message.
pub fn int_value(msg: &DynamicMessage) -> i64 {
    msg.get_field_by_name("value")
        .and_then(|v| v.as_i64())
        .unwrap_or_default()
}

/// Pool used by most engine tests.
///
/// ```text
/// package demo;
/// message Empty {}
/// message Number { int64 value = 1; }
/// message Pair { Number left = 1; Number right = 2; }
/// message Sum { int64 value = 1; }
/// service Counter { rpc Next(Empty) returns (Number); }
/// service Doubler { rpc Double(Number) returns (Number); }
/// service Adder { rpc Add(Pair) returns (Sum); }
/// service Splitter { rpc Split(Number) returns (Pair); }
/// ```
pub fn demo_pool() -> DescriptorPool {
    FileBuilder::new("demo")
        .message("Empty", vec![])
        .message("Number", vec![scalar("value", 1, Type::Int64)])
        .message(
            "Pair",
            vec![
                message_field("left", 1, "demo.Number"),
                message_field("right", 2, "demo.Number"),
            ],
        )
        .message("Sum", vec![scalar("value", 1, Type::Int64)])
        .service("Counter", vec![unary("Next", "demo.Empty", "demo.Number")])
        .service("Doubler", vec![unary("Double", "demo.Number", "demo.Number")])
        .service("Adder", vec![unary("Add", "demo.Pair", "demo.Sum")])
        .service("Splitter", vec![unary("Split", "demo.Number", "demo.Pair")])
        .build()
}

/// Nested `Number` field of a message, as an integer.
pub fn nested_int(msg: &DynamicMessage, field: &str) -> i64 {
    msg.get_field_by_name(field)
        .and_then(|v| v.as_message().map(int_value))
        .unwrap_or_default()
}

/// Transport serving the [`demo_pool`] services, one per address:
///
/// - `counter:1` answers `Next` with 1, 2, 3, ...
/// - `doubler:1` answers `Double` with twice its input
/// - `adder:1` answers `Add` with `left + right`
/// - `splitter:1` answers `Split(n)` with `{left: n, right: 10 * n}`
pub fn demo_transport() -> MemoryTransport {
    let pool = demo_pool();
    let number = message(&pool, "demo.Number");
    let sum = message(&pool, "demo.Sum");
    let pair = message(&pool, "demo.Pair");
    let transport = MemoryTransport::new();

    let counter = Arc::new(AtomicI64::new(0));
    let next_number = number.clone();
    transport.serve(
        "counter:1",
        MemoryServer::new(pool.clone()).handle("demo.Counter", "Next", move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(int_message(&next_number, n))
        }),
    );
    transport.serve(
        "doubler:1",
        MemoryServer::new(pool.clone()).handle("demo.Doubler", "Double", |req| {
            Ok(int_message(&req.descriptor(), int_value(&req) * 2))
        }),
    );
    transport.serve(
        "adder:1",
        MemoryServer::new(pool.clone()).handle("demo.Adder", "Add", move |req| {
            Ok(int_message(&sum, nested_int(&req, "left") + nested_int(&req, "right")))
        }),
    );
    transport.serve(
        "splitter:1",
        MemoryServer::new(pool).handle("demo.Splitter", "Split", move |req| {
            let n = int_value(&req);
            let mut out = DynamicMessage::new(pair.clone());
            out.set_field_by_name("left", Value::Message(int_message(&number, n)));
            out.set_field_by_name("right", Value::Message(int_message(&number, n * 10)));
            Ok(out)
        }),
    );
    transport
}

// ============================================================================
// In-memory transport
// ============================================================================

/// Handler for one unary method.
pub type Handler = Arc<dyn Fn(DynamicMessage) -> std::result::Result<DynamicMessage, Status> + Send + Sync>;

/// A recorded invocation.
#[derive(Debug, Clone)]
pub struct Call {
    pub path: String,
    pub request: DynamicMessage,
    pub response: Option<DynamicMessage>,
}

/// An in-process server: a descriptor pool exposed over "reflection" plus
/// handlers keyed by invocation path.
#[derive(Clone)]
pub struct MemoryServer {
    pool: DescriptorPool,
    services: Vec<String>,
    handlers: HashMap<String, Handler>,
    reflection: bool,
    delay: Option<Duration>,
}

impl MemoryServer {
    pub fn new(pool: DescriptorPool) -> Self {
        Self {
            pool,
            services: Vec::new(),
            handlers: HashMap::new(),
            reflection: true,
            delay: None,
        }
    }

    /// Expose a service over reflection.
    pub fn expose(mut self, service: &str) -> Self {
        self.services.push(service.to_string());
        self
    }

    /// Register a handler for `/{service}/{method}`; exposes the service too.
    pub fn handle<F>(mut self, service: &str, method: &str, handler: F) -> Self
    where
        F: Fn(DynamicMessage) -> std::result::Result<DynamicMessage, Status> + Send + Sync + 'static,
    {
        if !self.services.iter().any(|s| s == service) {
            self.services.push(service.to_string());
        }
        self.handlers
            .insert(format!("/{}/{}", service, method), Arc::new(handler));
        self
    }

    /// Answer reflection calls with Unimplemented.
    pub fn without_reflection(mut self) -> Self {
        self.reflection = false;
        self
    }

    /// Sleep before answering every invocation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Transport backed by [`MemoryServer`]s keyed by address.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    servers: Arc<Mutex<HashMap<String, MemoryServer>>>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, address: &str, server: MemoryServer) {
        self.servers
            .lock()
            .expect("servers lock")
            .insert(address.to_string(), server);
    }

    /// Every invocation so far, in arrival order.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Invocations of one path, in arrival order.
    pub fn calls_to(&self, path: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.path == path)
            .collect()
    }

    /// Wait until `path` has at least `count` successful responses.
    pub async fn wait_for_responses(&self, path: &str, count: usize, timeout: Duration) -> Vec<Call> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let calls: Vec<Call> = self
                .calls_to(path)
                .into_iter()
                .filter(|c| c.response.is_some())
                .collect();
            if calls.len() >= count || tokio::time::Instant::now() >= deadline {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Connection>> {
        let server = self
            .servers
            .lock()
            .expect("servers lock")
            .get(address)
            .cloned()
            .ok_or_else(|| {
                EngineError::failed_precondition(format!("{}: connection refused", address))
            })?;
        Ok(Arc::new(MemoryConnection {
            server,
            calls: self.calls.clone(),
        }))
    }
}

struct MemoryConnection {
    server: MemoryServer,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl MemoryConnection {
    fn check_reflection(&self) -> Result<()> {
        if self.server.reflection {
            Ok(())
        } else {
            Err(EngineError::from(Status::unimplemented(
                "unknown service grpc.reflection.v1alpha.ServerReflection",
            )))
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn list_services(&self) -> Result<Vec<String>> {
        self.check_reflection()?;
        let mut services = self.server.services.clone();
        services.push("grpc.reflection.v1alpha.ServerReflection".to_string());
        Ok(services)
    }

    async fn service_descriptor(&self, service: &str) -> Result<ServiceDescriptor> {
        self.check_reflection()?;
        self.server
            .pool
            .get_service_by_name(service)
            .ok_or_else(|| EngineError::not_found(format!("symbol {}", service)))
    }

    async fn invoke(
        &self,
        path: &str,
        request: DynamicMessage,
        response: &MessageDescriptor,
    ) -> Result<DynamicMessage> {
        if let Some(delay) = self.server.delay {
            tokio::time::sleep(delay).await;
        }
        let handler = self
            .server
            .handlers
            .get(path)
            .cloned()
            .ok_or_else(|| EngineError::from(Status::unimplemented(format!("no handler for {}", path))))?;

        // Cross the "wire" the way a real server would: decode into the
        // server's own input type and re-read the reply as the caller's type.
        let (service, method) = path
            .trim_start_matches('/')
            .split_once('/')
            .ok_or_else(|| EngineError::invalid_argument(format!("malformed path {}", path)))?;
        let input = self
            .server
            .pool
            .get_service_by_name(service)
            .and_then(|s| s.methods().find(|m| m.name() == method))
            .map(|m| m.input())
            .ok_or_else(|| EngineError::not_found(format!("method {}", path)))?;
        let server_request = DynamicMessage::decode(input, request.encode_to_vec().as_slice())
            .map_err(|e| EngineError::unknown(e.to_string()))?;

        let mut call = Call {
            path: path.to_string(),
            request: server_request.clone(),
            response: None,
        };
        let result = handler(server_request);
        let reply = match result {
            Ok(reply) => {
                call.response = Some(reply.clone());
                Ok(reply)
            }
            Err(status) => Err(EngineError::from(status)),
        };
        self.calls.lock().expect("calls lock").push(call);

        let reply = reply?;
        DynamicMessage::decode(response.clone(), reply.encode_to_vec().as_slice())
            .map_err(|e| EngineError::unknown(e.to_string()))
    }
}
