//! gRPC Pipes echo - a small server and client for trying the transport.
//!
//! `grpc-pipes-echo serve` hosts the echo service on a pipe until Ctrl-C;
//! `grpc-pipes-echo call ...` makes one call against it.

mod service;

use anyhow::Result;
use clap::{Parser, Subcommand};
use grpc_pipes::config::TransportConfig;
use grpc_pipes::{CallOptions, JsonMarshaller, Metadata, PipeChannel, PipeServer, ServerOptions};
use service::{EchoReply, EchoRequest, RepeatRequest};
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "grpc-pipes-echo")]
#[command(about = "Echo service over gRPC Pipes")]
struct Args {
    /// Pipe name (or absolute socket path on Unix)
    #[arg(short, long, default_value = TransportConfig::DEFAULT_PIPE_NAME)]
    pipe: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the echo service until interrupted
    Serve {
        /// Maximum number of simultaneous connections
        #[arg(long, default_value_t = TransportConfig::MAX_CONNECTIONS)]
        max_connections: usize,
    },
    /// Call the echo service
    Call {
        /// Call deadline in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Tag sent as a request header and echoed back as a trailer
        #[arg(long)]
        tag: Option<String>,

        #[command(subcommand)]
        call: CallCommand,
    },
}

#[derive(Subcommand, Debug)]
enum CallCommand {
    /// Unary echo
    Say { message: String },
    /// Server-streaming echo
    Repeat {
        message: String,
        #[arg(short, long, default_value = "3")]
        count: u32,
        #[arg(long, default_value = "0")]
        interval_ms: u64,
    },
    /// Client-streaming echo: joins all messages into one reply
    Collect { messages: Vec<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    match args.command {
        Command::Serve { max_connections } => serve(&args.pipe, max_connections).await,
        Command::Call {
            timeout_ms,
            tag,
            call,
        } => {
            let mut options = CallOptions::new();
            if let Some(ms) = timeout_ms {
                options = options.with_timeout(Duration::from_millis(ms));
            }
            if let Some(tag) = tag {
                options = options.with_headers(Metadata::new().with(service::TAG_HEADER, tag));
            }
            run_call(&PipeChannel::new(args.pipe), call, options).await
        }
    }
}

async fn serve(pipe: &str, max_connections: usize) -> Result<()> {
    info!("Starting echo server");

    let server = PipeServer::start(pipe, service::methods(), ServerOptions { max_connections }).await?;

    // Print the pipe path for scripts to read (intentional stdout)
    println!("PIPE_PATH={}", server.path().display());

    info!("Echo server listening on {}", server.path().display());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping");
    server.stop().await;

    Ok(())
}

async fn run_call(channel: &PipeChannel, call: CallCommand, options: CallOptions) -> Result<()> {
    match call {
        CallCommand::Say { message } => {
            let reply: EchoReply = channel
                .unary(
                    service::SAY,
                    &EchoRequest { message },
                    JsonMarshaller::new(),
                    JsonMarshaller::new(),
                    options,
                )
                .await?;
            println!("{}", reply.message);
        }
        CallCommand::Repeat {
            message,
            count,
            interval_ms,
        } => {
            let request = RepeatRequest {
                message,
                count,
                interval_ms,
            };
            let (call, mut replies) = channel
                .server_streaming::<RepeatRequest, EchoReply>(
                    service::REPEAT,
                    &request,
                    JsonMarshaller::new(),
                    JsonMarshaller::new(),
                    options,
                )
                .await?;
            while let Some(reply) = replies.read_message().await? {
                println!("{}: {}", reply.sequence, reply.message);
            }
            let status = call.status().await;
            if !status.is_ok() {
                return Err(status.into());
            }
        }
        CallCommand::Collect { messages } => {
            let requests = messages.into_iter().map(|message| EchoRequest { message });
            let reply: EchoReply = channel
                .client_streaming(
                    service::COLLECT,
                    requests,
                    JsonMarshaller::new(),
                    JsonMarshaller::new(),
                    options,
                )
                .await?;
            println!("{} ({} messages)", reply.message, reply.sequence);
        }
    }
    Ok(())
}
