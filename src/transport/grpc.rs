//! gRPC transport over tonic.
//!
//! Schemas are discovered with the server reflection protocol
//! (`grpc.reflection.v1alpha`), and methods are invoked with
//! [`DynamicCodec`] so no generated code is needed for the target services.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::uri::PathAndQuery;
use prost::Message;
use prost_reflect::{DescriptorPool, DynamicMessage, MessageDescriptor, ServiceDescriptor};
use prost_types::FileDescriptorProto;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tonic_reflection::pb::v1alpha::server_reflection_client::ServerReflectionClient;
use tonic_reflection::pb::v1alpha::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1alpha::server_reflection_response::MessageResponse;
use tonic_reflection::pb::v1alpha::ServerReflectionRequest;
use tracing::{debug, info};

use super::{endpoint_uri, Connection, DynamicCodec, Transport};
use crate::error::{EngineError, Result};

/// Default bound on one reflection exchange.
pub const DEFAULT_REFLECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Dials stage endpoints as plaintext or TLS gRPC channels.
#[derive(Debug, Clone)]
pub struct GrpcTransport {
    connect_timeout: Duration,
    reflection_timeout: Duration,
}

impl GrpcTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            reflection_timeout: DEFAULT_REFLECTION_TIMEOUT,
        }
    }

    /// Bound every reflection exchange on connections this transport opens.
    pub fn with_reflection_timeout(mut self, timeout: Duration) -> Self {
        self.reflection_timeout = timeout;
        self
    }
}

impl Default for GrpcTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Connection>> {
        let uri = endpoint_uri(address);
        let endpoint = Endpoint::from_shared(uri)
            .map_err(|e| EngineError::invalid_argument(format!("invalid address '{}': {}", address, e)))?
            .connect_timeout(self.connect_timeout);

        // Bound the whole dial, handshake included.
        let channel = match tokio::time::timeout(self.connect_timeout, endpoint.connect()).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => {
                return Err(EngineError::failed_precondition(format!(
                    "cannot reach {}: {}",
                    address, e
                )))
            }
            Err(_) => {
                return Err(EngineError::failed_precondition(format!(
                    "cannot reach {}: timed out after {:?}",
                    address, self.connect_timeout
                )))
            }
        };

        info!(address = %address, "Connected to stage endpoint");

        Ok(Arc::new(
            GrpcConnection::new(address, channel).with_reflection_timeout(self.reflection_timeout),
        ))
    }
}

/// A tonic channel to one server.
#[derive(Debug, Clone)]
pub struct GrpcConnection {
    address: String,
    channel: Channel,
    reflection_timeout: Duration,
}

impl GrpcConnection {
    pub fn new(address: impl Into<String>, channel: Channel) -> Self {
        Self {
            address: address.into(),
            channel,
            reflection_timeout: DEFAULT_REFLECTION_TIMEOUT,
        }
    }

    pub fn with_reflection_timeout(mut self, timeout: Duration) -> Self {
        self.reflection_timeout = timeout;
        self
    }

    /// Send one reflection request and return its response body.
    ///
    /// A server that accepts the call but never answers fails
    /// FailedPrecondition once the reflection timeout expires.
    async fn reflect(&self, request: MessageRequest) -> Result<MessageResponse> {
        match tokio::time::timeout(self.reflection_timeout, self.exchange(request)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::failed_precondition(format!(
                "reflection at {} timed out after {:?}",
                self.address, self.reflection_timeout
            ))),
        }
    }

    async fn exchange(&self, request: MessageRequest) -> Result<MessageResponse> {
        let mut client = ServerReflectionClient::new(self.channel.clone());
        let request = ServerReflectionRequest {
            host: String::new(),
            message_request: Some(request),
        };

        let mut responses = client
            .server_reflection_info(tokio_stream::once(request))
            .await
            .map_err(|status| self.reflection_error(status))?
            .into_inner();

        let response = responses
            .message()
            .await
            .map_err(|status| self.reflection_error(status))?
            .ok_or_else(|| {
                EngineError::unknown(format!(
                    "reflection stream from {} closed without a response",
                    self.address
                ))
            })?;

        match response.message_response {
            Some(MessageResponse::ErrorResponse(err)) => Err(EngineError::from(Status::new(
                Code::from(err.error_code),
                err.error_message,
            ))),
            Some(body) => Ok(body),
            None => Err(EngineError::unknown(format!(
                "empty reflection response from {}",
                self.address
            ))),
        }
    }

    fn reflection_error(&self, status: Status) -> EngineError {
        match status.code() {
            Code::Unimplemented | Code::Unavailable => EngineError::failed_precondition(format!(
                "reflection unavailable at {}: {}",
                self.address,
                status.message()
            )),
            _ => EngineError::from(status).context(format!("reflection at {}", self.address)),
        }
    }

    /// Fold a file descriptor response into `files`, queueing unseen imports.
    fn collect_files(
        &self,
        response: MessageResponse,
        files: &mut HashMap<String, FileDescriptorProto>,
        pending: &mut Vec<String>,
    ) -> Result<()> {
        let MessageResponse::FileDescriptorResponse(body) = response else {
            return Err(EngineError::unknown(format!(
                "unexpected reflection response from {}",
                self.address
            )));
        };

        for bytes in body.file_descriptor_proto {
            let file = FileDescriptorProto::decode(bytes.as_slice()).map_err(|e| {
                EngineError::unknown(format!("bad file descriptor from {}: {}", self.address, e))
            })?;
            for dependency in &file.dependency {
                if !files.contains_key(dependency) {
                    pending.push(dependency.clone());
                }
            }
            files.insert(file.name().to_string(), file);
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for GrpcConnection {
    async fn list_services(&self) -> Result<Vec<String>> {
        match self.reflect(MessageRequest::ListServices(String::new())).await? {
            MessageResponse::ListServicesResponse(body) => {
                Ok(body.service.into_iter().map(|s| s.name).collect())
            }
            _ => Err(EngineError::unknown(format!(
                "unexpected reflection response from {}",
                self.address
            ))),
        }
    }

    async fn service_descriptor(&self, service: &str) -> Result<ServiceDescriptor> {
        let mut files = HashMap::new();
        let mut pending = Vec::new();

        let response = self
            .reflect(MessageRequest::FileContainingSymbol(service.to_string()))
            .await?;
        self.collect_files(response, &mut files, &mut pending)?;

        while let Some(filename) = pending.pop() {
            if files.contains_key(&filename) {
                continue;
            }
            debug!(address = %self.address, file = %filename, "Fetching imported descriptor");
            let response = self
                .reflect(MessageRequest::FileByFilename(filename))
                .await?;
            self.collect_files(response, &mut files, &mut pending)?;
        }

        // Add files after their imports.
        let mut pool = DescriptorPool::new();
        let mut remaining: Vec<FileDescriptorProto> = files.into_values().collect();
        while !remaining.is_empty() {
            let (ready, blocked): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|file| {
                file.dependency
                    .iter()
                    .all(|dep| pool.get_file_by_name(dep).is_some())
            });
            if ready.is_empty() {
                return Err(EngineError::unknown(format!(
                    "descriptors for {} from {} have unresolvable imports",
                    service, self.address
                )));
            }
            pool.add_file_descriptor_protos(ready).map_err(|e| {
                EngineError::unknown(format!(
                    "descriptors for {} from {} do not link: {}",
                    service, self.address, e
                ))
            })?;
            remaining = blocked;
        }

        pool.get_service_by_name(service).ok_or_else(|| {
            EngineError::not_found(format!("service {} at {}", service, self.address))
        })
    }

    async fn invoke(
        &self,
        path: &str,
        request: DynamicMessage,
        response: &MessageDescriptor,
    ) -> Result<DynamicMessage> {
        let path = PathAndQuery::try_from(path)
            .map_err(|e| EngineError::invalid_argument(format!("invalid method path '{}': {}", path, e)))?;

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await.map_err(|e| {
            EngineError::failed_precondition(format!("{} not ready: {}", self.address, e))
        })?;

        let reply = grpc
            .unary(
                tonic::Request::new(request),
                path,
                DynamicCodec::new(response.clone()),
            )
            .await?;
        Ok(reply.into_inner())
    }
}
