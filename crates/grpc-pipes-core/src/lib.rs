//! gRPC Pipes - gRPC-style calls over a local named pipe.
//!
//! Each accepted connection carries exactly one call. Frames (request init,
//! headers, payload chunks, stream end, cancel, trailers) are length-prefixed
//! on one duplex byte stream; the call contexts on both ends map them onto
//! gRPC semantics: deadlines, cancellation, metadata and status codes.
//!
//! On Unix the pipe is a Unix-domain socket; on Windows it is a named pipe.
//!
//! # Example
//!
//! ```rust,ignore
//! use grpc_pipes::{CallOptions, JsonMarshaller, PipeChannel, PipeServer, ServerMethods, ServerOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let methods = ServerMethods::new().unary(
//!         "/greeter.Greeter/Hello",
//!         JsonMarshaller::<String>::new(),
//!         JsonMarshaller::<String>::new(),
//!         |name: String, _context| async move { Ok(format!("Hello, {}", name)) },
//!     );
//!     let server = PipeServer::start("greeter", methods, ServerOptions::default()).await?;
//!
//!     let channel = PipeChannel::new("greeter");
//!     let reply: String = channel
//!         .unary(
//!             "/greeter.Greeter/Hello",
//!             &"pipes".to_string(),
//!             JsonMarshaller::new(),
//!             JsonMarshaller::new(),
//!             CallOptions::new(),
//!         )
//!         .await?;
//!     println!("{}", reply);
//!
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod client;
pub mod config;
pub mod deadline;
pub mod error;
pub mod logging;
pub mod message;
pub mod metadata;
pub mod payload_queue;
pub mod pipe;
pub mod read_loop;
pub mod server;
pub mod status;
pub mod transport;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use client::{CallOptions, ClientCall, PipeChannel};
pub use config::{ServerOptions, TransportConfig};
pub use deadline::Deadline;
pub use error::{HandlerError, Result, TransportError};
pub use logging::{ConnectionLogger, Role};
pub use message::{BytesMarshaller, JsonMarshaller, Marshaller, MessageReader, MessageWriter};
pub use metadata::{Metadata, MetadataValue};
pub use payload_queue::PayloadQueue;
pub use server::{
    HandlerResult, MethodHandler, PipeServer, PipeServerHandle, ServerConnection,
    ServerConnectionContext, ServerMethods,
};
pub use status::{Code, Status};
