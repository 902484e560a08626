//! Remote transport.
//!
//! A [`Transport`] dials an address and yields a [`Connection`] that can
//! answer reflection queries and invoke unary methods with dynamic messages.
//! The production implementation speaks gRPC through tonic; tests use an
//! in-memory one.

use std::sync::Arc;

use async_trait::async_trait;
use prost_reflect::{DynamicMessage, MessageDescriptor, ServiceDescriptor};

use crate::error::Result;

pub mod codec;
pub mod grpc;


pub use codec::DynamicCodec;
pub use grpc::{GrpcConnection, GrpcTransport};

/// Connection factory.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dial `address`. Unreachable endpoints fail FailedPrecondition.
    async fn connect(&self, address: &str) -> Result<Arc<dyn Connection>>;
}

/// A live connection to one server.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Names of every service the server exposes through reflection.
    async fn list_services(&self) -> Result<Vec<String>>;

    /// Descriptor of one service, with every type it references resolvable.
    async fn service_descriptor(&self, service: &str) -> Result<ServiceDescriptor>;

    /// Invoke a unary method by its path (`/package.Service/Method`).
    ///
    /// The reply is decoded as `response`.
    async fn invoke(
        &self,
        path: &str,
        request: DynamicMessage,
        response: &MessageDescriptor,
    ) -> Result<DynamicMessage>;
}

/// Turn a stage address into a URI tonic can dial.
///
/// Bare `host:port` addresses are treated as plaintext HTTP/2.
pub fn endpoint_uri(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}
