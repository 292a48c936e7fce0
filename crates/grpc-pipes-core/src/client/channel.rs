//! Client entry point: connects to a named pipe, one connection per call.

use super::context::{CallOptions, ClientCall};
use crate::config::TransportConfig;
use crate::message::{Marshaller, MessageReader};
use crate::pipe::{self, ClientPipeStream};
use crate::status::Status;
use std::sync::Arc;
use std::time::Duration;

/// Calls methods served by a [`PipeServer`](crate::server::PipeServer).
#[derive(Debug, Clone)]
pub struct PipeChannel {
    name: String,
    connect_timeout: Duration,
}

impl PipeChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connect_timeout: TransportConfig::CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a new connection to the server.
    ///
    /// Fails with `Unavailable` when no server accepts within the connect timeout.
    pub async fn connect(&self) -> Result<ClientPipeStream, Status> {
        tokio::time::timeout(self.connect_timeout, pipe::connect(&self.name))
            .await
            .map_err(|_| {
                Status::unavailable(format!(
                    "Timed out connecting to '{}' after {:?}",
                    self.name, self.connect_timeout
                ))
            })?
            .map_err(|e| Status::unavailable(format!("Failed to connect to '{}': {}", self.name, e)))
    }

    /// Start a call of any shape on a new connection.
    pub async fn start_call(&self, method: &str, options: CallOptions) -> Result<ClientCall, Status> {
        let stream = self.connect().await?;
        ClientCall::start(stream, method, options).await
    }

    /// One request, one response.
    pub async fn unary<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        request_marshaller: impl Marshaller<Req>,
        response_marshaller: impl Marshaller<Resp> + 'static,
        options: CallOptions,
    ) -> Result<Resp, Status> {
        let payload = request_marshaller.serialize(request)?;
        let call = self.start_call(method, options).await?;
        if let Err(status) = call.send_request(&payload).await {
            return Err(final_error(&call, status).await);
        }

        let response = call
            .response_reader::<Resp>(Arc::new(response_marshaller))
            .read_message()
            .await;
        finish_single(&call, response).await
    }

    /// A stream of requests, one response.
    pub async fn client_streaming<Req, Resp>(
        &self,
        method: &str,
        requests: impl IntoIterator<Item = Req>,
        request_marshaller: impl Marshaller<Req>,
        response_marshaller: impl Marshaller<Resp> + 'static,
        options: CallOptions,
    ) -> Result<Resp, Status> {
        let call = self.start_call(method, options).await?;
        for request in requests {
            let payload = request_marshaller.serialize(&request)?;
            if let Err(status) = call.send_message(&payload).await {
                // The server may have finished early; its status is more telling.
                return Err(final_error(&call, status).await);
            }
        }
        if let Err(status) = call.complete_request().await {
            return Err(final_error(&call, status).await);
        }

        let response = call
            .response_reader::<Resp>(Arc::new(response_marshaller))
            .read_message()
            .await;
        finish_single(&call, response).await
    }

    /// One request, a stream of responses.
    ///
    /// The returned call must be kept alive while reading; its
    /// [`status`](ClientCall::status) reports how the stream ended.
    pub async fn server_streaming<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        request_marshaller: impl Marshaller<Req>,
        response_marshaller: impl Marshaller<Resp> + 'static,
        options: CallOptions,
    ) -> Result<(ClientCall, MessageReader<Resp>), Status> {
        let payload = request_marshaller.serialize(request)?;
        let call = self.start_call(method, options).await?;
        if let Err(status) = call.send_request(&payload).await {
            return Err(final_error(&call, status).await);
        }
        let responses = call.response_reader::<Resp>(Arc::new(response_marshaller));
        Ok((call, responses))
    }
}

async fn finish_single<Resp>(call: &ClientCall, response: Result<Option<Resp>, Status>) -> Result<Resp, Status> {
    let status = call.status().await;
    if !status.is_ok() {
        return Err(status);
    }
    response?.ok_or_else(|| Status::internal("Server completed the call without a response"))
}

async fn final_error(call: &ClientCall, local: Status) -> Status {
    let status = tokio::time::timeout(TransportConfig::STATUS_GRACE_PERIOD, call.status()).await;
    match status {
        Ok(status) if !status.is_ok() => status,
        _ => local,
    }
}
