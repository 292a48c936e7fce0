//! End-to-end tests of one server connection over an in-memory pipe.
//!
//! The client end is driven frame by frame so the exact wire sequence the
//! server produces can be asserted.

use bytes::Bytes;
use grpc_pipes::transport::{Frame, FrameReader, Transport};
use grpc_pipes::{
    BytesMarshaller, CallOptions, ClientCall, Code, ConnectionLogger, Deadline, HandlerError,
    JsonMarshaller, MessageReader, Metadata, ServerConnection, ServerConnectionContext, ServerMethods,
    Status,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{DuplexStream, ReadHalf};
use tokio::sync::oneshot;

struct TestClient {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: Transport,
    context: Arc<ServerConnectionContext>,
    server: tokio::task::JoinHandle<()>,
}

/// Serve `methods` on one end of a duplex stream and hand back the other end.
fn connect(methods: ServerMethods) -> TestClient {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let connection = ServerConnection::new(server, Arc::new(methods), 1);
    let context = connection.context().clone();
    let server = tokio::spawn(connection.run());

    let (read_half, write_half) = tokio::io::split(client);
    TestClient {
        reader: FrameReader::new(read_half),
        writer: Transport::new(write_half, ConnectionLogger::client()),
        context,
        server,
    }
}

impl TestClient {
    async fn start(&self, method: &str, deadline: Deadline) {
        self.writer
            .write()
            .request_init(method, deadline)
            .headers(&Metadata::new())
            .commit()
            .await
            .unwrap();
    }

    async fn next_frame(&mut self) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_frame())
            .await
            .expect("Timed out waiting for a frame")
            .unwrap()
            .expect("Server closed the stream")
    }

    async fn trailers(&mut self) -> Status {
        loop {
            if let Frame::Trailers { status, .. } = self.next_frame().await {
                return status;
            }
        }
    }
}

fn bytes_reader(context: &ServerConnectionContext) -> MessageReader<Bytes> {
    context.message_reader::<Bytes>(Arc::new(BytesMarshaller))
}

#[tokio::test]
async fn test_echo_scenario() {
    let methods = ServerMethods::new().raw("Echo", |context| async move {
        let request = bytes_reader(&context).read_single().await?;
        context
            .response_writer::<Bytes>(Arc::new(BytesMarshaller))
            .write_message(&request)
            .await?;
        context.success(None).await;
        Ok::<_, HandlerError>(None)
    });
    let mut client = connect(methods);

    client
        .writer
        .write()
        .request_init("Echo", Deadline::none())
        .headers(&Metadata::new())
        .payload(b"hi")
        .stream_end()
        .commit()
        .await
        .unwrap();

    assert_eq!(client.next_frame().await, Frame::Headers(Metadata::new()));
    assert_eq!(client.next_frame().await, Frame::Payload(Bytes::from_static(b"hi")));
    assert_eq!(
        client.next_frame().await,
        Frame::Trailers {
            status: Status::ok(),
            trailers: Metadata::new(),
        }
    );

    // The handler completed first; the dispatcher's own success must not add trailers.
    let extra = tokio::time::timeout(Duration::from_millis(50), client.reader.read_frame()).await;
    assert!(extra.is_err(), "unexpected frame after trailers: {:?}", extra);
    assert!(client.context.is_completed());
}

#[tokio::test]
async fn test_deadline_overrides_handler_error() {
    let methods = ServerMethods::new().raw("Slow", |_context| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Err::<Option<Bytes>, _>(HandlerError::from(Status::not_found("gone")))
    });
    let mut client = connect(methods);

    client.start("Slow", Deadline::after(Duration::from_millis(20))).await;

    let status = client.trailers().await;
    assert_eq!(status.code(), Code::DeadlineExceeded);
    assert_eq!(status.detail(), "");
}

#[tokio::test]
async fn test_client_cancel_releases_blocked_reader() {
    let (seen_tx, seen_rx) = oneshot::channel();
    let seen_tx = std::sync::Mutex::new(Some(seen_tx));
    let methods = ServerMethods::new().raw("Wait", move |context| {
        let seen_tx = seen_tx.lock().unwrap().take();
        async move {
            let result = bytes_reader(&context).read_message().await;
            if let Some(tx) = seen_tx {
                let _ = tx.send(result.clone().err());
            }
            result?;
            Ok::<_, HandlerError>(None)
        }
    });
    let mut client = connect(methods);

    client.start("Wait", Deadline::none()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.writer.send(&Frame::Cancel).await.unwrap();

    let seen = tokio::time::timeout(Duration::from_secs(5), seen_rx)
        .await
        .expect("Reader should be released by cancel")
        .unwrap();
    assert_eq!(seen.map(|s| s.code()), Some(Code::Cancelled));
    assert_eq!(client.trailers().await, Status::cancelled(""));
}

#[tokio::test]
async fn test_explicit_status_and_unknown_errors() {
    let methods = ServerMethods::new()
        .raw("Explicit", |_context| async {
            Err::<Option<Bytes>, _>(HandlerError::from(Status::invalid_argument("bad id")))
        })
        .raw("Opaque", |_context| async {
            Err::<Option<Bytes>, _>(HandlerError::from(anyhow::anyhow!("secret internals")))
        });

    let mut client = connect(methods.clone());
    client.start("Explicit", Deadline::none()).await;
    assert_eq!(client.trailers().await, Status::invalid_argument("bad id"));

    let mut client = connect(methods);
    client.start("Opaque", Deadline::none()).await;
    let status = client.trailers().await;
    assert_eq!(status.code(), Code::Unknown);
    assert_eq!(status.detail(), "Exception was thrown by handler.");
}

#[tokio::test]
async fn test_handler_status_wins_over_success() {
    let methods = ServerMethods::new().raw("Denied", |context| async move {
        context.set_status(Status::new(Code::PermissionDenied, "nope"));
        Ok(Some(Bytes::from_static(b"never sent")))
    });
    let mut client = connect(methods);

    client.start("Denied", Deadline::none()).await;

    assert_eq!(
        client.next_frame().await,
        Frame::Trailers {
            status: Status::new(Code::PermissionDenied, "nope"),
            trailers: Metadata::new(),
        }
    );
}

#[tokio::test]
async fn test_panicking_handler_reports_unknown() {
    let methods = ServerMethods::new().raw("Boom", |_context| async move {
        if true {
            panic!("handler exploded");
        }
        Ok(None)
    });
    let mut client = connect(methods);

    client.start("Boom", Deadline::none()).await;

    assert_eq!(client.trailers().await.code(), Code::Unknown);
}

#[tokio::test]
async fn test_unknown_method_is_unimplemented() {
    let mut client = connect(ServerMethods::new());
    client.start("Missing", Deadline::none()).await;
    assert_eq!(client.trailers().await.code(), Code::Unimplemented);
}

#[tokio::test]
async fn test_payload_after_stream_end_drops_connection() {
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let done_tx = std::sync::Mutex::new(Some(done_tx));
    let methods = ServerMethods::new().raw("Hold", move |context| {
        let done_tx = done_tx.lock().unwrap().take();
        async move {
            context.cancellation().cancelled().await;
            drop(done_tx);
            Ok(None)
        }
    });
    let mut client = connect(methods);

    client
        .writer
        .write()
        .request_init("Hold", Deadline::none())
        .stream_end()
        .payload(b"late")
        .commit()
        .await
        .unwrap();

    // The protocol error ends the read loop, which disposes and cancels the call.
    tokio::time::timeout(Duration::from_secs(5), done_rx)
        .await
        .expect("Handler should observe cancellation")
        .unwrap_err();
    assert!(client.context.is_cancelled());
    tokio::time::timeout(Duration::from_secs(5), client.server)
        .await
        .expect("Connection should end")
        .unwrap();
    assert!(client.reader.read_frame().await.unwrap().is_none());
}

#[tokio::test]
async fn test_client_disconnect_disposes_context() {
    let (seen_tx, seen_rx) = oneshot::channel();
    let seen_tx = std::sync::Mutex::new(Some(seen_tx));
    let methods = ServerMethods::new().raw("Wait", move |context| {
        let seen_tx = seen_tx.lock().unwrap().take();
        async move {
            let result = bytes_reader(&context).read_message().await;
            if let Some(tx) = seen_tx {
                let _ = tx.send(result.err().map(|s| s.code()));
            }
            Ok::<_, HandlerError>(None)
        }
    });
    let client = connect(methods);

    client.start("Wait", Deadline::none()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let TestClient {
        reader,
        writer,
        context,
        server,
    } = client;
    drop(reader);
    drop(writer);

    let seen = tokio::time::timeout(Duration::from_secs(5), seen_rx)
        .await
        .expect("Blocked reader should be released")
        .unwrap();
    assert_eq!(seen, Some(Code::Cancelled));
    server.await.unwrap();
    assert!(context.is_cancelled());
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Sum {
    total: i64,
}

#[tokio::test]
async fn test_client_call_against_server_connection() {
    let methods = ServerMethods::new().client_streaming(
        "/math.Math/Sum",
        JsonMarshaller::<i64>::new(),
        JsonMarshaller::<Sum>::new(),
        |mut numbers: MessageReader<i64>, context| async move {
            let mut total = 0;
            while let Some(n) = numbers.read_message().await? {
                total += n;
            }
            context.add_response_trailer("count-checked", "yes");
            Ok::<_, HandlerError>(Sum { total })
        },
    );

    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let connection = ServerConnection::new(server_end, Arc::new(methods), 7);
    tokio::spawn(connection.run());

    let call = ClientCall::start(client_end, "/math.Math/Sum", CallOptions::new())
        .await
        .unwrap();
    let numbers = call.request_writer::<i64>(Arc::new(JsonMarshaller::new()));
    for n in [1, 2, 3, 4] {
        numbers.write_message(&n).await.unwrap();
    }
    call.complete_request().await.unwrap();

    let sum = call
        .response_reader::<Sum>(Arc::new(JsonMarshaller::new()))
        .read_single()
        .await
        .unwrap();
    assert_eq!(sum, Sum { total: 10 });
    assert_eq!(call.status().await, Status::ok());
    assert_eq!(
        call.trailers().await.get("count-checked").and_then(|v| v.as_str()),
        Some("yes")
    );
    assert_eq!(call.response_headers().await.unwrap(), Metadata::new());
}
