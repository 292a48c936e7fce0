//! Method registry: method name to async handler.
//!
//! Handlers return the serialized unary response (if any) and the server
//! context turns the outcome into trailers. The typed adapters cover the four
//! gRPC call shapes on top of a [`Marshaller`].

use super::context::ServerConnectionContext;
use crate::error::HandlerError;
use crate::message::{Marshaller, MessageReader, MessageWriter};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Outcome of a method handler: an optional response payload sent with OK trailers.
pub type HandlerResult = Result<Option<Bytes>, HandlerError>;

/// A registered method implementation.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(&self, context: Arc<ServerConnectionContext>) -> HandlerResult;
}

type HandlerFn =
    Box<dyn Fn(Arc<ServerConnectionContext>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

struct FnHandler(HandlerFn);

#[async_trait]
impl MethodHandler for FnHandler {
    async fn handle(&self, context: Arc<ServerConnectionContext>) -> HandlerResult {
        (self.0)(context).await
    }
}

/// Lookup table of method handlers, built before the server starts.
#[derive(Clone, Default)]
pub struct ServerMethods {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
}

impl ServerMethods {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `method`, replacing any previous one.
    pub fn add_handler(mut self, method: impl Into<String>, handler: impl MethodHandler + 'static) -> Self {
        self.handlers.insert(method.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn MethodHandler>> {
        self.handlers.get(method).cloned()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Register a handler that drives the context directly.
    pub fn raw<F, Fut>(self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<ServerConnectionContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.add_handler(method, FnHandler(Box::new(move |context| handler(context).boxed())))
    }

    /// One request message in, one response message out.
    pub fn unary<Req, Resp, F, Fut>(
        self,
        method: impl Into<String>,
        request_marshaller: impl Marshaller<Req> + 'static,
        response_marshaller: impl Marshaller<Resp> + 'static,
        handler: F,
    ) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(Req, Arc<ServerConnectionContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        let request_marshaller: Arc<dyn Marshaller<Req>> = Arc::new(request_marshaller);
        let response_marshaller: Arc<dyn Marshaller<Resp>> = Arc::new(response_marshaller);
        let handler = Arc::new(handler);

        self.raw(method, move |context| {
            let request_marshaller = request_marshaller.clone();
            let response_marshaller = response_marshaller.clone();
            let handler = handler.clone();
            async move {
                let request = context.message_reader(request_marshaller).read_single().await?;
                let response = handler(request, context).await?;
                Ok::<_, HandlerError>(Some(response_marshaller.serialize(&response)?))
            }
        })
    }

    /// One request message in, a stream of response messages out.
    pub fn server_streaming<Req, Resp, F, Fut>(
        self,
        method: impl Into<String>,
        request_marshaller: impl Marshaller<Req> + 'static,
        response_marshaller: impl Marshaller<Resp> + 'static,
        handler: F,
    ) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(Req, MessageWriter<Resp>, Arc<ServerConnectionContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let request_marshaller: Arc<dyn Marshaller<Req>> = Arc::new(request_marshaller);
        let response_marshaller: Arc<dyn Marshaller<Resp>> = Arc::new(response_marshaller);
        let handler = Arc::new(handler);

        self.raw(method, move |context| {
            let request_marshaller = request_marshaller.clone();
            let responses = context.response_writer(response_marshaller.clone());
            let handler = handler.clone();
            async move {
                let request = context.message_reader(request_marshaller).read_single().await?;
                handler(request, responses, context).await?;
                Ok::<_, HandlerError>(None)
            }
        })
    }

    /// A stream of request messages in, one response message out.
    pub fn client_streaming<Req, Resp, F, Fut>(
        self,
        method: impl Into<String>,
        request_marshaller: impl Marshaller<Req> + 'static,
        response_marshaller: impl Marshaller<Resp> + 'static,
        handler: F,
    ) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(MessageReader<Req>, Arc<ServerConnectionContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, HandlerError>> + Send + 'static,
    {
        let request_marshaller: Arc<dyn Marshaller<Req>> = Arc::new(request_marshaller);
        let response_marshaller: Arc<dyn Marshaller<Resp>> = Arc::new(response_marshaller);
        let handler = Arc::new(handler);

        self.raw(method, move |context| {
            let requests = context.message_reader(request_marshaller.clone());
            let response_marshaller = response_marshaller.clone();
            let handler = handler.clone();
            async move {
                let response = handler(requests, context).await?;
                Ok::<_, HandlerError>(Some(response_marshaller.serialize(&response)?))
            }
        })
    }

    /// Request and response streams running side by side.
    pub fn duplex_streaming<Req, Resp, F, Fut>(
        self,
        method: impl Into<String>,
        request_marshaller: impl Marshaller<Req> + 'static,
        response_marshaller: impl Marshaller<Resp> + 'static,
        handler: F,
    ) -> Self
    where
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Fn(MessageReader<Req>, MessageWriter<Resp>, Arc<ServerConnectionContext>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let request_marshaller: Arc<dyn Marshaller<Req>> = Arc::new(request_marshaller);
        let response_marshaller: Arc<dyn Marshaller<Resp>> = Arc::new(response_marshaller);
        let handler = Arc::new(handler);

        self.raw(method, move |context| {
            let requests = context.message_reader(request_marshaller.clone());
            let responses = context.response_writer(response_marshaller.clone());
            let handler = handler.clone();
            async move {
                handler(requests, responses, context).await?;
                Ok::<_, HandlerError>(None)
            }
        })
    }
}

impl std::fmt::Debug for ServerMethods {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("ServerMethods").field("methods", &names).finish()
    }
}
