//! Per-connection read loop.
//!
//! Pulls one frame at a time off the stream and hands it to the connection's
//! [`FrameHandler`]. A frame is fully handled before the next one is read,
//! which is what keeps Headers, Payload and StreamEnd/Cancel in wire order.

use crate::cancel::CancellationToken;
use crate::error::TransportError;
use crate::logging::ConnectionLogger;
use crate::transport::{FrameHandler, FrameReader};
use tokio::io::AsyncRead;

type ErrorCallback = Box<dyn FnOnce(&TransportError) + Send>;

/// Runs `on_disconnected` exactly once when dropped, however the loop ended.
struct DisconnectGuard<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for DisconnectGuard<F> {
    fn drop(&mut self) {
        if let Some(on_disconnected) = self.0.take() {
            on_disconnected();
        }
    }
}

pub struct ReadLoop<R> {
    reader: FrameReader<R>,
    closed: CancellationToken,
    logger: ConnectionLogger,
    on_error: Option<ErrorCallback>,
}

impl<R: AsyncRead + Unpin> ReadLoop<R> {
    /// `closed` is the transport's close signal; the loop stops as soon as it fires.
    pub fn new(reader: FrameReader<R>, closed: CancellationToken, logger: ConnectionLogger) -> Self {
        Self {
            reader,
            closed,
            logger,
            on_error: None,
        }
    }

    /// Report read failures other than a clean end of pipe.
    pub fn on_error(mut self, callback: impl FnOnce(&TransportError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    /// Read and dispatch frames until the stream ends, fails, or is closed.
    ///
    /// `on_disconnected` runs exactly once on every exit path, including when
    /// this future is dropped before completion.
    pub async fn run<H, F>(mut self, handler: &H, on_disconnected: F)
    where
        H: FrameHandler + ?Sized,
        F: FnOnce(),
    {
        let _guard = DisconnectGuard(Some(on_disconnected));

        loop {
            if self.closed.is_cancelled() {
                self.logger.trace("Pipe is disconnected");
                break;
            }

            let result = tokio::select! {
                biased;
                _ = self.closed.cancelled() => Ok(false),
                result = self.reader.read(handler) => result,
            };

            match result {
                Ok(true) => continue,
                Ok(false) => {
                    self.logger.trace("Pipe is disconnected");
                    break;
                }
                Err(TransportError::EndOfPipe) => {
                    self.logger.error("End of pipe");
                    break;
                }
                Err(err) => {
                    self.logger.error(format_args!("Pipe read error: {}", err));
                    if let Some(on_error) = self.on_error.take() {
                        on_error(&err);
                    }
                    break;
                }
            }
        }
    }
}
