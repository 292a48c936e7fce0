//! The echo service: message types and method registrations.

use grpc_pipes::{HandlerError, JsonMarshaller, MessageReader, Metadata, ServerMethods, Status};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const SAY: &str = "/echo.Echo/Say";
pub const REPEAT: &str = "/echo.Echo/Repeat";
pub const COLLECT: &str = "/echo.Echo/Collect";

/// Header a caller may set to have it echoed back as a trailer.
pub const TAG_HEADER: &str = "x-echo-tag";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoRequest {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoReply {
    pub message: String,
    /// Position within a streamed reply; 0 for unary calls.
    #[serde(default)]
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatRequest {
    pub message: String,
    pub count: u32,
    #[serde(default)]
    pub interval_ms: u64,
}

/// Upper bound on `RepeatRequest::count`.
pub const MAX_REPEAT: u32 = 10_000;

pub fn methods() -> ServerMethods {
    ServerMethods::new()
        .unary(
            SAY,
            JsonMarshaller::<EchoRequest>::new(),
            JsonMarshaller::<EchoReply>::new(),
            |request: EchoRequest, context| async move {
                if request.message.is_empty() {
                    return Err(HandlerError::from(Status::invalid_argument("message must not be empty")));
                }
                if let Some(tag) = context.request_headers().as_ref().and_then(echo_tag) {
                    context.add_response_trailer(TAG_HEADER, tag);
                }
                Ok::<_, HandlerError>(EchoReply {
                    message: request.message,
                    sequence: 0,
                })
            },
        )
        .server_streaming(
            REPEAT,
            JsonMarshaller::<RepeatRequest>::new(),
            JsonMarshaller::<EchoReply>::new(),
            |request: RepeatRequest, replies, context| async move {
                if request.count > MAX_REPEAT {
                    let detail = format!("count must be at most {}", MAX_REPEAT);
                    return Err(HandlerError::from(Status::invalid_argument(detail)));
                }
                for sequence in 0..request.count {
                    replies
                        .write_message(&EchoReply {
                            message: request.message.clone(),
                            sequence,
                        })
                        .await?;
                    if request.interval_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(request.interval_ms)).await;
                    }
                }
                debug!(
                    "Repeated {} messages for {}",
                    request.count,
                    context.method().unwrap_or_default()
                );
                Ok::<_, HandlerError>(())
            },
        )
        .client_streaming(
            COLLECT,
            JsonMarshaller::<EchoRequest>::new(),
            JsonMarshaller::<EchoReply>::new(),
            |mut requests: MessageReader<EchoRequest>, _context| async move {
                let mut parts = Vec::new();
                while let Some(request) = requests.read_message().await? {
                    parts.push(request.message);
                }
                Ok::<_, HandlerError>(EchoReply {
                    sequence: parts.len() as u32,
                    message: parts.join(" "),
                })
            },
        )
}

fn echo_tag(headers: &Metadata) -> Option<String> {
    headers.get(TAG_HEADER)?.as_str().map(str::to_string)
}
