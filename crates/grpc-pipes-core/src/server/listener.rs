//! Pipe server accepting one call per connection.
//!
//! # Thread Safety
//!
//! The accept loop runs on its own tokio task and each accepted connection is
//! served on another. Method handlers are shared through `Arc<ServerMethods>`
//! and never mutated after start.

use super::context::ServerConnection;
use super::methods::ServerMethods;
use crate::config::ServerOptions;
use crate::error::Result;
use crate::pipe::{PipeListener, ServerPipeStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running pipe server. Dropping shuts the server down.
pub struct PipeServerHandle {
    path: PathBuf,
    active_connections: Arc<AtomicUsize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl PipeServerHandle {
    /// Filesystem path (or `\\.\pipe\` name) the server listens on.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Stop accepting connections and dispose every active one.
    ///
    /// In-flight calls are cancelled; their clients see the connection drop.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }

    /// Shut down and wait for the accept loop to exit.
    pub async fn stop(mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for PipeServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Serves registered methods on a named pipe.
pub struct PipeServer;

impl PipeServer {
    /// Bind `name` and start accepting connections in the background.
    pub async fn start(name: &str, methods: ServerMethods, options: ServerOptions) -> Result<PipeServerHandle> {
        let listener = PipeListener::bind(name).await?;
        let path = listener.path().to_path_buf();

        info!("Pipe server listening on {} ({} methods)", path.display(), methods.len());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            Arc::new(methods),
            options,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections.clone(),
        ));

        Ok(PipeServerHandle {
            path,
            active_connections,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        mut listener: PipeListener,
        methods: Arc<ServerMethods>,
        options: ServerOptions,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        let mut next_id: u64 = 0;
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Pipe server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok(stream) => {
                            next_id += 1;
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= options.max_connections {
                                warn!(
                                    "Rejecting pipe connection {}: at max capacity ({})",
                                    next_id, options.max_connections
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let methods = methods.clone();
                            let conns = active_connections.clone();
                            let conn_shutdown = conn_shutdown_rx.clone();
                            let id = next_id;

                            tokio::spawn(async move {
                                debug!("Pipe connection {} accepted", id);
                                Self::serve_connection(stream, methods, id, conn_shutdown).await;
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Pipe accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn serve_connection(
        stream: ServerPipeStream,
        methods: Arc<ServerMethods>,
        id: u64,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let connection = ServerConnection::new(stream, methods, id);
        let context = connection.context().clone();

        tokio::select! {
            _ = connection.run() => {}
            _ = shutdown_rx.changed() => {
                debug!("Pipe connection {} closed by server shutdown", id);
                context.dispose();
            }
        }
    }
}
