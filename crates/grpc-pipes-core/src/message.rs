//! Message-level adapters over the payload queue and the transport.
//!
//! A [`MessageReader`] turns queued payload chunks into typed messages, and a
//! [`MessageWriter`] turns typed messages into committed payload frames. Both
//! go through a [`Marshaller`]; the transport itself only sees opaque bytes.

use crate::cancel::CancellationToken;
use crate::deadline::Deadline;
use crate::metadata::Metadata;
use crate::payload_queue::PayloadQueue;
use crate::status::Status;
use crate::transport::Transport;
use bytes::Bytes;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Converts messages to and from payload bytes.
pub trait Marshaller<T>: Send + Sync {
    fn serialize(&self, message: &T) -> Result<Bytes, Status>;
    fn deserialize(&self, payload: &[u8]) -> Result<T, Status>;
}

/// JSON encoding through `serde_json`.
pub struct JsonMarshaller<T>(PhantomData<fn() -> T>);

impl<T> JsonMarshaller<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonMarshaller<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonMarshaller<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T: Serialize + DeserializeOwned> Marshaller<T> for JsonMarshaller<T> {
    fn serialize(&self, message: &T) -> Result<Bytes, Status> {
        serde_json::to_vec(message)
            .map(Bytes::from)
            .map_err(|e| Status::internal(format!("Failed to serialize message: {}", e)))
    }

    fn deserialize(&self, payload: &[u8]) -> Result<T, Status> {
        serde_json::from_slice(payload)
            .map_err(|e| Status::internal(format!("Failed to deserialize message: {}", e)))
    }
}

/// Pass-through marshaller for callers that already work with bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesMarshaller;

impl Marshaller<Bytes> for BytesMarshaller {
    fn serialize(&self, message: &Bytes) -> Result<Bytes, Status> {
        Ok(message.clone())
    }

    fn deserialize(&self, payload: &[u8]) -> Result<Bytes, Status> {
        Ok(Bytes::copy_from_slice(payload))
    }
}

/// Reads typed messages from a call's payload queue.
///
/// Reads stop early when the call is cancelled or its deadline passes.
pub struct MessageReader<T> {
    queue: Arc<PayloadQueue>,
    marshaller: Arc<dyn Marshaller<T>>,
    cancellation: CancellationToken,
    deadline: Deadline,
}

impl<T> MessageReader<T> {
    pub(crate) fn new(
        queue: Arc<PayloadQueue>,
        marshaller: Arc<dyn Marshaller<T>>,
        cancellation: CancellationToken,
        deadline: Deadline,
    ) -> Self {
        Self {
            queue,
            marshaller,
            cancellation,
            deadline,
        }
    }

    /// Next message, or `None` once the peer has finished sending.
    pub async fn read_message(&mut self) -> Result<Option<T>, Status> {
        if self.deadline.is_expired() {
            return Err(Status::deadline_exceeded(""));
        }

        let next = tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => return Err(self.interrupted()),
            _ = self.deadline.expired() => return Err(Status::deadline_exceeded("")),
            next = self.queue.next() => next,
        };

        match next {
            Ok(Some(payload)) => self.marshaller.deserialize(&payload).map(Some),
            Ok(None) => Ok(None),
            Err(_) => Err(self.interrupted()),
        }
    }

    /// Exactly one message, as sent by a unary or server-streaming caller.
    pub async fn read_single(&mut self) -> Result<T, Status> {
        self.read_message()
            .await?
            .ok_or_else(|| Status::internal("Expected a message but the stream ended"))
    }

    /// Adapt the reader into a `Stream` of messages.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, Status>> {
        futures::stream::unfold(Some(self), |reader| async move {
            let mut reader = reader?;
            match reader.read_message().await {
                Ok(Some(message)) => Some((Ok(message), Some(reader))),
                Ok(None) => None,
                Err(status) => Some((Err(status), None)),
            }
        })
    }

    fn interrupted(&self) -> Status {
        if self.deadline.is_expired() {
            Status::deadline_exceeded("")
        } else {
            Status::cancelled("")
        }
    }
}

/// Set once the response Headers frame has gone out.
///
/// Whoever claims the latch first writes the headers; everyone after skips them.
#[derive(Debug, Clone, Default)]
pub(crate) struct HeaderLatch(Arc<AtomicBool>);

impl HeaderLatch {
    pub(crate) fn claim(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }
}

/// Writes typed messages as payload frames.
///
/// Refuses to write once the owning call has completed, so a stray write can
/// never land after the trailers.
pub struct MessageWriter<T> {
    transport: Arc<Transport>,
    marshaller: Arc<dyn Marshaller<T>>,
    cancellation: CancellationToken,
    completed: Arc<AtomicBool>,
    headers: Option<HeaderLatch>,
}

impl<T> MessageWriter<T> {
    pub(crate) fn new(
        transport: Arc<Transport>,
        marshaller: Arc<dyn Marshaller<T>>,
        cancellation: CancellationToken,
        completed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            transport,
            marshaller,
            cancellation,
            completed,
            headers: None,
        }
    }

    /// Send empty response headers ahead of the first message unless
    /// something else sent them already.
    pub(crate) fn with_header_latch(mut self, latch: HeaderLatch) -> Self {
        self.headers = Some(latch);
        self
    }

    pub async fn write_message(&self, message: &T) -> Result<(), Status> {
        if self.completed.load(Ordering::SeqCst) {
            return Err(Status::internal("Call is already complete"));
        }
        if self.cancellation.is_cancelled() {
            return Err(Status::cancelled(""));
        }

        let payload = self.marshaller.serialize(message)?;
        let mut batch = self.transport.write().unless_completed(&self.completed);
        if self.headers.as_ref().is_some_and(HeaderLatch::claim) {
            batch = batch.headers(&Metadata::new());
        }
        batch.payload(&payload).commit().await?;
        Ok(())
    }
}
