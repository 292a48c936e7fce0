//! Server side of one connection: the call state machine.
//!
//! The read loop feeds frames into [`ServerConnectionContext`] through its
//! [`FrameHandler`] impl. A RequestInit frame launches the registered method
//! handler on its own task, so Payload, StreamEnd and Cancel frames keep
//! flowing into the context while the handler runs.
//!
//! Every call ends with exactly one Trailers frame, written by
//! [`success`](ServerConnectionContext::success) or
//! [`error`](ServerConnectionContext::error), whichever runs first.

use super::methods::{MethodHandler, ServerMethods};
use crate::cancel::CancellationToken;
use crate::deadline::Deadline;
use crate::error::{HandlerError, Result, TransportError};
use crate::logging::{ConnectionLogger, Role};
use crate::message::{HeaderLatch, Marshaller, MessageReader, MessageWriter};
use crate::metadata::{Metadata, MetadataValue};
use crate::payload_queue::PayloadQueue;
use crate::read_loop::ReadLoop;
use crate::status::Status;
use crate::transport::{FrameHandler, FrameKind, FrameReader, Transport};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::io::{AsyncRead, AsyncWrite};

const UNKNOWN_ERROR_DETAIL: &str = "Exception was thrown by handler.";

#[derive(Debug, Default)]
struct CallState {
    method: Option<String>,
    deadline: Deadline,
    request_headers: Option<Metadata>,
    response_trailers: Metadata,
    /// Status chosen by the handler; wins over a plain success.
    status: Option<Status>,
}

/// Per-connection call context on the server.
pub struct ServerConnectionContext {
    this: Weak<ServerConnectionContext>,
    logger: ConnectionLogger,
    transport: Arc<Transport>,
    payload_queue: Arc<PayloadQueue>,
    cancellation: CancellationToken,
    completed: Arc<AtomicBool>,
    disposed: AtomicBool,
    response_headers: HeaderLatch,
    methods: Arc<ServerMethods>,
    state: Mutex<CallState>,
}

impl ServerConnectionContext {
    pub fn new(transport: Arc<Transport>, methods: Arc<ServerMethods>) -> Arc<Self> {
        let logger = transport.logger();
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            logger,
            transport,
            payload_queue: Arc::new(PayloadQueue::new()),
            cancellation: CancellationToken::new(),
            completed: Arc::new(AtomicBool::new(false)),
            disposed: AtomicBool::new(false),
            response_headers: HeaderLatch::default(),
            methods,
            state: Mutex::new(CallState::default()),
        })
    }

    pub fn logger(&self) -> ConnectionLogger {
        self.logger
    }

    /// Method name from the RequestInit frame, once received.
    pub fn method(&self) -> Option<String> {
        self.lock().method.clone()
    }

    pub fn deadline(&self) -> Deadline {
        self.lock().deadline
    }

    /// Request headers sent by the client, once received.
    pub fn request_headers(&self) -> Option<Metadata> {
        self.lock().request_headers.clone()
    }

    /// Fires when the client cancels or the connection goes away.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// The status a successful completion will report.
    pub fn status(&self) -> Status {
        self.lock().status.clone().unwrap_or_default()
    }

    /// Override the status reported when the handler completes successfully.
    pub fn set_status(&self, status: Status) {
        self.lock().status = Some(status);
    }

    pub fn response_trailers(&self) -> Metadata {
        self.lock().response_trailers.clone()
    }

    /// Add a trailing metadata entry. Entries added after completion are never sent.
    pub fn add_response_trailer(&self, key: impl Into<String>, value: impl Into<MetadataValue>) {
        self.lock().response_trailers.push(key, value);
    }

    /// Send response headers ahead of any response message.
    ///
    /// Fails with `Internal` if headers already went out, either explicitly or
    /// implicitly with the first response message.
    pub async fn write_response_headers(&self, headers: &Metadata) -> std::result::Result<(), Status> {
        if self.is_completed() {
            return Err(Status::internal("Call is already complete"));
        }
        if !self.response_headers.claim() {
            return Err(Status::internal("Response headers have already been sent"));
        }
        self.transport.write().headers(headers).commit().await?;
        Ok(())
    }

    /// Reader over the request messages of this call.
    pub fn message_reader<T>(&self, marshaller: Arc<dyn Marshaller<T>>) -> MessageReader<T> {
        MessageReader::new(
            self.payload_queue.clone(),
            marshaller,
            self.cancellation.clone(),
            self.deadline(),
        )
    }

    /// Writer for streamed response messages. Fails once the call has completed.
    pub fn response_writer<T>(&self, marshaller: Arc<dyn Marshaller<T>>) -> MessageWriter<T> {
        MessageWriter::new(
            self.transport.clone(),
            marshaller,
            self.cancellation.clone(),
            self.completed.clone(),
        )
        .with_header_latch(self.response_headers.clone())
    }

    /// Complete the call successfully.
    ///
    /// A non-OK status set by the handler is reported as-is and `response` is
    /// not sent. Otherwise `response` (if any) and OK trailers are committed
    /// together. Only the first completion writes anything.
    pub async fn success(&self, response: Option<Bytes>) {
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.logger.trace("RPC successful");

        let (status, trailers) = {
            let state = self.lock();
            (state.status.clone(), state.response_trailers.clone())
        };

        let batch = match status {
            Some(status) if !status.is_ok() => self.transport.write().trailers(&status, &trailers),
            _ => {
                let mut batch = self.transport.write();
                if self.response_headers.claim() {
                    batch = batch.headers(&Metadata::new());
                }
                if let Some(response) = &response {
                    batch = batch.payload(response);
                }
                batch.trailers(&Status::ok(), &trailers)
            }
        };

        match batch.commit().await {
            Ok(()) => {}
            Err(e @ TransportError::FrameTooLarge { .. }) => {
                self.logger.error(format_args!("Response refused: {}", e));
                let status = Status::from(e);
                if let Err(e) = self.transport.write().trailers(&status, &trailers).commit().await {
                    self.logger.error(format_args!("Failed to write trailers: {}", e));
                }
            }
            Err(e) => self.logger.error(format_args!("Failed to write trailers: {}", e)),
        }
    }

    /// Complete the call with a failure.
    ///
    /// Status precedence: an expired deadline, then cancellation, then the
    /// handler's explicit status, then `Unknown`.
    pub async fn error(&self, err: impl Into<HandlerError>) {
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        let err = err.into();
        let status = self.failure_status(&err);
        let trailers = self.response_trailers();

        if let Err(e) = self.transport.write().trailers(&status, &trailers).commit().await {
            self.logger.error(format_args!("Failed to write trailers: {}", e));
        }
    }

    fn failure_status(&self, err: &HandlerError) -> Status {
        if self.deadline().is_expired() {
            self.logger.error("RPC warning: deadline exceeded");
            return Status::deadline_exceeded("");
        }
        if self.is_cancelled() {
            self.logger.error("RPC warning: cancelled");
            return Status::cancelled("");
        }
        match err {
            HandlerError::Rpc(status) => {
                self.logger.error(format_args!("RPC error: {}", status));
                status.clone()
            }
            HandlerError::Other(e) => {
                self.logger.error(format_args!("Handler failed: {:#}", e));
                Status::unknown(UNKNOWN_ERROR_DETAIL)
            }
        }
    }

    /// Tear the call down: cancel it if still running, release any blocked
    /// reader, and close the transport. Safe to call repeatedly and from any task.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.logger.trace("Disposing server context");
        if !self.is_completed() {
            self.cancellation.cancel();
        }
        self.payload_queue.dispose();
        self.transport.close();
    }

    fn dispatch(&self, method: String, handler: Option<Arc<dyn MethodHandler>>) -> Result<()> {
        let context = self.this.upgrade().ok_or(TransportError::Closed)?;

        tokio::spawn(async move {
            let Some(handler) = handler else {
                context.logger.warn(format_args!("Unknown method '{}'", method));
                context
                    .error(Status::unimplemented(format!("Method '{}' is not implemented", method)))
                    .await;
                return;
            };

            // Run on a nested task so a panicking handler still yields trailers.
            let task = tokio::spawn({
                let context = context.clone();
                async move { handler.handle(context).await }
            });

            match task.await {
                Ok(Ok(response)) => context.success(response).await,
                Ok(Err(err)) => context.error(err).await,
                Err(join_err) => {
                    context.logger.error(format_args!("Method handler aborted: {}", join_err));
                    context.error(anyhow::anyhow!("{}", join_err)).await;
                }
            }
        });
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, CallState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FrameHandler for ServerConnectionContext {
    fn role(&self) -> Role {
        Role::Server
    }

    fn handle_request_init(&self, method: String, deadline: Deadline) -> Result<()> {
        {
            let mut state = self.lock();
            if state.method.is_some() {
                return Err(self.unexpected(FrameKind::RequestInit));
            }
            state.method = Some(method.clone());
            state.deadline = deadline;
        }
        self.logger.trace(format_args!("Request for '{}'", method));

        let handler = self.methods.get(&method);
        self.dispatch(method, handler)
    }

    fn handle_headers(&self, headers: Metadata) -> Result<()> {
        let mut state = self.lock();
        if state.request_headers.is_some() {
            return Err(self.unexpected(FrameKind::Headers));
        }
        state.request_headers = Some(headers);
        Ok(())
    }

    fn handle_payload(&self, payload: Bytes) -> Result<()> {
        self.payload_queue.append_payload(payload)
    }

    fn handle_stream_end(&self) -> Result<()> {
        self.payload_queue.set_completed();
        Ok(())
    }

    fn handle_cancel(&self) -> Result<()> {
        self.logger.trace("Cancel requested by client");
        self.cancellation.cancel();
        Ok(())
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// One accepted connection: its read loop plus its call context.
pub struct ServerConnection {
    read_loop: ReadLoop<BoxedReader>,
    context: Arc<ServerConnectionContext>,
}

impl ServerConnection {
    pub fn new<S>(stream: S, methods: Arc<ServerMethods>, id: u64) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let logger = ConnectionLogger::server(id);
        let (read_half, write_half) = tokio::io::split(stream);
        let transport = Arc::new(Transport::new(write_half, logger));
        let context = ServerConnectionContext::new(transport.clone(), methods);
        let reader: BoxedReader = Box::new(read_half);
        let read_loop = ReadLoop::new(FrameReader::new(reader), transport.closed().clone(), logger);

        Self { read_loop, context }
    }

    pub fn context(&self) -> &Arc<ServerConnectionContext> {
        &self.context
    }

    /// Pump frames into the context until the client goes away, then dispose it.
    pub async fn run(self) {
        let Self { read_loop, context } = self;
        read_loop.run(&*context, || context.dispose()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;
    use crate::transport::Frame;
    use std::time::Duration;

    fn new_context() -> (Arc<ServerConnectionContext>, FrameReader<tokio::io::DuplexStream>) {
        let (peer, local) = tokio::io::duplex(4096);
        let transport = Arc::new(Transport::new(local, ConnectionLogger::server(1)));
        let context = ServerConnectionContext::new(transport, Arc::new(ServerMethods::new()));
        (context, FrameReader::new(peer))
    }

    async fn trailers_status(reader: &mut FrameReader<tokio::io::DuplexStream>) -> Status {
        loop {
            match reader.read_frame().await.unwrap() {
                Some(Frame::Trailers { status, .. }) => return status,
                Some(_) => continue,
                None => panic!("stream closed before trailers"),
            }
        }
    }

    #[tokio::test]
    async fn test_success_writes_headers_payload_and_ok_trailers() {
        let (context, mut reader) = new_context();
        context.add_response_trailer("rows", "3");

        context.success(Some(Bytes::from_static(b"done"))).await;

        assert_eq!(reader.read_frame().await.unwrap(), Some(Frame::Headers(Metadata::new())));
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Some(Frame::Payload(Bytes::from_static(b"done")))
        );
        assert_eq!(
            reader.read_frame().await.unwrap(),
            Some(Frame::Trailers {
                status: Status::ok(),
                trailers: Metadata::new().with("rows", "3"),
            })
        );
    }

    #[tokio::test]
    async fn test_handler_status_wins_and_drops_payload() {
        let (context, mut reader) = new_context();
        context.set_status(Status::not_found("no such row"));

        context.success(Some(Bytes::from_static(b"ignored"))).await;

        assert_eq!(
            reader.read_frame().await.unwrap(),
            Some(Frame::Trailers {
                status: Status::not_found("no such row"),
                trailers: Metadata::new(),
            })
        );
    }

    #[tokio::test]
    async fn test_oversized_response_reports_resource_exhausted() {
        let (peer, local) = tokio::io::duplex(4096);
        let transport = Arc::new(Transport::with_max_frame_size(local, ConnectionLogger::server(1), 256));
        let context = ServerConnectionContext::new(transport, Arc::new(ServerMethods::new()));
        let mut reader = FrameReader::new(peer);

        context.success(Some(Bytes::from(vec![0u8; 1024]))).await;

        match reader.read_frame().await.unwrap() {
            Some(Frame::Trailers { status, .. }) => assert_eq!(status.code(), Code::ResourceExhausted),
            other => panic!("Expected Trailers, got: {:?}", other),
        }
        assert!(context.is_completed());
    }

    #[tokio::test]
    async fn test_oversized_streamed_message_fails_the_write() {
        let (peer, local) = tokio::io::duplex(4096);
        let transport = Arc::new(Transport::with_max_frame_size(local, ConnectionLogger::server(1), 256));
        let context = ServerConnectionContext::new(transport, Arc::new(ServerMethods::new()));
        let writer = context.response_writer::<Bytes>(Arc::new(crate::message::BytesMarshaller));
        let mut reader = FrameReader::new(peer);

        let err = writer.write_message(&Bytes::from(vec![0u8; 1024])).await.unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
        context.error(err).await;

        assert_eq!(trailers_status(&mut reader).await.code(), Code::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_second_completion_is_noop() {
        let (context, mut reader) = new_context();

        context.success(None).await;
        context.error(Status::internal("late")).await;
        context.success(None).await;
        context.dispose();

        let mut trailers = 0;
        while let Some(frame) = reader.read_frame().await.unwrap() {
            if matches!(frame, Frame::Trailers { .. }) {
                trailers += 1;
            }
        }
        assert_eq!(trailers, 1);
    }

    #[tokio::test]
    async fn test_error_precedence_deadline_first() {
        let (context, mut reader) = new_context();
        context
            .handle_request_init("/svc/Missing".to_string(), Deadline::after(Duration::ZERO))
            .unwrap();
        context.handle_cancel().unwrap();

        // The unknown method is answered on a spawned task; deadline wins over everything.
        let status = trailers_status(&mut reader).await;
        assert_eq!(status.code(), Code::DeadlineExceeded);
        assert_eq!(status.detail(), "");
    }

    #[tokio::test]
    async fn test_error_precedence_cancelled_over_explicit() {
        let (context, mut reader) = new_context();
        context.handle_cancel().unwrap();

        context.error(Status::not_found("missing")).await;

        assert_eq!(trailers_status(&mut reader).await, Status::cancelled(""));
    }

    #[tokio::test]
    async fn test_error_precedence_explicit_over_unknown() {
        let (context, mut reader) = new_context();
        context.error(Status::invalid_argument("bad id")).await;
        assert_eq!(trailers_status(&mut reader).await, Status::invalid_argument("bad id"));

        let (context, mut reader) = new_context();
        context.error(anyhow::anyhow!("disk on fire")).await;
        assert_eq!(
            trailers_status(&mut reader).await,
            Status::unknown(UNKNOWN_ERROR_DETAIL)
        );
    }

    #[tokio::test]
    async fn test_unknown_method_is_unimplemented() {
        let (context, mut reader) = new_context();
        context
            .handle_request_init("/svc/Nope".to_string(), Deadline::none())
            .unwrap();

        let status = trailers_status(&mut reader).await;
        assert_eq!(status.code(), Code::Unimplemented);
        assert!(context.is_completed());
    }

    #[tokio::test]
    async fn test_duplicate_init_and_headers_are_protocol_errors() {
        let (context, _reader) = new_context();
        context.handle_headers(Metadata::new()).unwrap();
        assert!(matches!(
            context.handle_headers(Metadata::new()),
            Err(TransportError::UnexpectedFrame { frame: FrameKind::Headers, .. })
        ));

        context
            .handle_request_init("/svc/A".to_string(), Deadline::none())
            .unwrap();
        assert!(matches!(
            context.handle_request_init("/svc/A".to_string(), Deadline::none()),
            Err(TransportError::UnexpectedFrame { frame: FrameKind::RequestInit, .. })
        ));
    }

    #[tokio::test]
    async fn test_dispose_cancels_and_releases_reader() {
        let (context, _reader) = new_context();
        let mut messages = context.message_reader::<Bytes>(Arc::new(crate::message::BytesMarshaller));

        let blocked = tokio::spawn(async move { messages.read_message().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        context.dispose();
        context.dispose();

        let result = tokio::time::timeout(Duration::from_secs(2), blocked)
            .await
            .expect("reader should be released")
            .unwrap();
        assert_eq!(result.unwrap_err().code(), Code::Cancelled);
        assert!(context.is_cancelled());
    }

    #[tokio::test]
    async fn test_writes_after_completion_fail() {
        let (context, _reader) = new_context();
        let writer = context.response_writer::<Bytes>(Arc::new(crate::message::BytesMarshaller));

        context.success(None).await;

        let err = writer.write_message(&Bytes::from_static(b"late")).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        let err = context.write_response_headers(&Metadata::new()).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[tokio::test]
    async fn test_explicit_response_headers_are_sent_once() {
        let (context, mut reader) = new_context();
        let headers = Metadata::new().with("x-served-by", "test");

        context.write_response_headers(&headers).await.unwrap();
        assert!(context.write_response_headers(&headers).await.is_err());
        context.success(None).await;

        assert_eq!(reader.read_frame().await.unwrap(), Some(Frame::Headers(headers)));
        assert!(matches!(
            reader.read_frame().await.unwrap(),
            Some(Frame::Trailers { .. })
        ));
    }
}
