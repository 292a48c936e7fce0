//! Client side of one connection.
//!
//! A [`ClientCall`] owns the connection for a single call. It writes
//! RequestInit and Headers up front, then streams request payloads while a
//! background read loop feeds response Headers, Payload and Trailers frames
//! into its [`ClientConnectionContext`].

use crate::cancel::CancellationToken;
use crate::deadline::Deadline;
use crate::error::Result;
use crate::logging::{ConnectionLogger, Role};
use crate::message::{Marshaller, MessageReader, MessageWriter};
use crate::metadata::Metadata;
use crate::payload_queue::PayloadQueue;
use crate::read_loop::ReadLoop;
use crate::status::Status;
use crate::transport::{FrameHandler, FrameKind, FrameReader, Transport};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub deadline: Deadline,
    pub headers: Metadata,
    pub cancellation: Option<CancellationToken>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Deadline::after(timeout))
    }

    pub fn with_headers(mut self, headers: Metadata) -> Self {
        self.headers = headers;
        self
    }

    /// Cancel the call when `token` fires.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

#[derive(Debug, Clone, Default)]
struct CallProgress {
    response_headers: Option<Metadata>,
    status: Option<Status>,
    trailers: Metadata,
}

/// Receives response frames for one call.
pub struct ClientConnectionContext {
    logger: ConnectionLogger,
    transport: Arc<Transport>,
    payload_queue: Arc<PayloadQueue>,
    progress: watch::Sender<CallProgress>,
}

impl ClientConnectionContext {
    fn new(transport: Arc<Transport>) -> Self {
        let (progress, _) = watch::channel(CallProgress::default());
        Self {
            logger: transport.logger(),
            transport,
            payload_queue: Arc::new(PayloadQueue::new()),
            progress,
        }
    }

    /// Record `status` as final unless the call already has one.
    fn finish(&self, status: Status) -> bool {
        self.progress.send_if_modified(|progress| {
            if progress.status.is_some() {
                return false;
            }
            progress.status = Some(status);
            true
        })
    }

    /// The connection dropped. Calls that never saw trailers become `Unavailable`.
    fn connection_lost(&self) {
        if self.finish(Status::unavailable("Connection to the server was lost")) {
            self.logger.debug("Connection lost before trailers");
        }
        self.payload_queue.set_completed();
    }

    /// End the call locally with `status` and tell the server to stop.
    async fn abort(&self, status: Status) {
        if !self.finish(status) {
            return;
        }
        self.logger.debug("Aborting call");
        if let Err(e) = self.transport.write().cancel().commit().await {
            self.logger.debug(format_args!("Could not send cancel: {}", e));
        }
        self.payload_queue.dispose();
    }
}

impl FrameHandler for ClientConnectionContext {
    fn role(&self) -> Role {
        Role::Client
    }

    fn handle_headers(&self, headers: Metadata) -> Result<()> {
        let mut duplicate = false;
        self.progress.send_modify(|progress| {
            if progress.response_headers.is_some() {
                duplicate = true;
            } else {
                progress.response_headers = Some(headers);
            }
        });
        if duplicate {
            return Err(self.unexpected(FrameKind::Headers));
        }
        Ok(())
    }

    fn handle_payload(&self, payload: Bytes) -> Result<()> {
        self.payload_queue.append_payload(payload)
    }

    fn handle_trailers(&self, status: Status, trailers: Metadata) -> Result<()> {
        self.logger.trace(format_args!("Trailers received: {}", status));
        self.payload_queue.set_completed();
        self.progress.send_if_modified(|progress| {
            if progress.status.is_some() {
                return false;
            }
            progress.status = Some(status);
            progress.trailers = trailers;
            true
        });
        Ok(())
    }
}

/// One in-flight call on its own connection.
///
/// Dropping the call closes the connection; a server still running the
/// handler sees it as a cancellation.
pub struct ClientCall {
    context: Arc<ClientConnectionContext>,
    transport: Arc<Transport>,
    deadline: Deadline,
    cancellation: CancellationToken,
    request_completed: Arc<AtomicBool>,
}

impl ClientCall {
    /// Start `method` on a freshly connected stream.
    ///
    /// RequestInit and the request headers go out in one commit before this
    /// returns.
    pub async fn start<S>(stream: S, method: &str, options: CallOptions) -> std::result::Result<Self, Status>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let logger = ConnectionLogger::client();
        if options.deadline.is_expired() {
            logger.debug(format_args!("Deadline already passed for '{}'", method));
            return Err(Status::deadline_exceeded(""));
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let transport = Arc::new(Transport::new(write_half, logger));
        let context = Arc::new(ClientConnectionContext::new(transport.clone()));
        let cancellation = options.cancellation.unwrap_or_default();

        transport
            .write()
            .request_init(method, options.deadline)
            .headers(&options.headers)
            .commit()
            .await?;
        logger.trace(format_args!("Started call to '{}'", method));

        let read_loop = ReadLoop::new(FrameReader::new(read_half), transport.closed().clone(), logger);
        tokio::spawn({
            let context = context.clone();
            async move {
                read_loop.run(&*context, || context.connection_lost()).await;
            }
        });

        tokio::spawn(Self::watchdog(
            context.clone(),
            options.deadline,
            cancellation.clone(),
        ));

        Ok(Self {
            context,
            transport,
            deadline: options.deadline,
            cancellation,
            request_completed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Turns local deadline expiry and cancellation into a Cancel frame.
    async fn watchdog(context: Arc<ClientConnectionContext>, deadline: Deadline, cancellation: CancellationToken) {
        let mut progress = context.progress.subscribe();
        let finished = async move {
            let _ = progress.wait_for(|progress| progress.status.is_some()).await;
        };
        tokio::select! {
            _ = deadline.expired() => context.abort(Status::deadline_exceeded("")).await,
            _ = cancellation.cancelled() => context.abort(Status::cancelled("")).await,
            _ = finished => {}
        }
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Send one request payload.
    pub async fn send_message(&self, payload: &[u8]) -> std::result::Result<(), Status> {
        self.check_can_send()?;
        self.transport.write().payload(payload).commit().await?;
        Ok(())
    }

    /// Typed writer for the request stream.
    pub fn request_writer<T>(&self, marshaller: Arc<dyn Marshaller<T>>) -> MessageWriter<T> {
        MessageWriter::new(
            self.transport.clone(),
            marshaller,
            self.cancellation.clone(),
            self.request_completed.clone(),
        )
    }

    /// Signal that no more request messages follow. Idempotent.
    pub async fn complete_request(&self) -> std::result::Result<(), Status> {
        if self.request_completed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.transport.write().stream_end().commit().await?;
        Ok(())
    }

    /// Send the single request of a unary or server-streaming call together
    /// with the end of the request stream.
    pub async fn send_request(&self, payload: &[u8]) -> std::result::Result<(), Status> {
        self.check_can_send()?;
        self.request_completed.store(true, Ordering::SeqCst);
        self.transport
            .write()
            .payload(payload)
            .stream_end()
            .commit()
            .await?;
        Ok(())
    }

    /// Cancel the call. The server is told and the call ends `Cancelled`.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Response headers, once the server sent them.
    ///
    /// A call that ends without headers yields empty metadata on OK and its
    /// status otherwise.
    pub async fn response_headers(&self) -> std::result::Result<Metadata, Status> {
        let mut progress = self.context.progress.subscribe();
        let progress = progress
            .wait_for(|p| p.response_headers.is_some() || p.status.is_some())
            .await
            .map_err(|_| Status::unavailable("Call state is gone"))?;

        match (&progress.response_headers, &progress.status) {
            (Some(headers), _) => Ok(headers.clone()),
            (None, Some(status)) if !status.is_ok() => Err(status.clone()),
            _ => Ok(Metadata::new()),
        }
    }

    /// Typed reader over the response stream.
    ///
    /// The stream ends when trailers arrive or the connection drops; check
    /// [`status`](Self::status) afterwards to tell the two apart.
    pub fn response_reader<T>(&self, marshaller: Arc<dyn Marshaller<T>>) -> MessageReader<T> {
        MessageReader::new(
            self.context.payload_queue.clone(),
            marshaller,
            self.cancellation.clone(),
            self.deadline,
        )
    }

    /// Final status of the call. Waits for trailers or a local outcome.
    pub async fn status(&self) -> Status {
        let mut progress = self.context.progress.subscribe();
        let status = match progress.wait_for(|p| p.status.is_some()).await {
            Ok(progress) => progress.status.clone().unwrap_or_default(),
            Err(_) => Status::unavailable("Call state is gone"),
        };
        status
    }

    /// Trailing metadata, available once [`status`](Self::status) resolves.
    pub async fn trailers(&self) -> Metadata {
        let mut progress = self.context.progress.subscribe();
        let trailers = match progress.wait_for(|p| p.status.is_some()).await {
            Ok(progress) => progress.trailers.clone(),
            Err(_) => Metadata::new(),
        };
        trailers
    }

    fn check_can_send(&self) -> std::result::Result<(), Status> {
        self.cancellation.check()?;
        if self.request_completed.load(Ordering::SeqCst) {
            return Err(Status::internal("Request stream is already complete"));
        }
        Ok(())
    }
}

impl Drop for ClientCall {
    fn drop(&mut self) {
        self.transport.close();
    }
}
