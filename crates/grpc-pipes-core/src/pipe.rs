//! Platform pipe endpoints.
//!
//! On Unix a pipe name maps to a Unix-domain socket (in the temp directory
//! unless the name is an absolute path). On Windows it maps to a named pipe
//! under `\\.\pipe\`. Both sides only ever see a duplex byte stream.

use crate::config::TransportConfig;
use std::io;

#[cfg(unix)]
pub use unix::{pipe_path, PipeListener};
#[cfg(windows)]
pub use windows::{pipe_path, PipeListener};

#[cfg(unix)]
pub type ServerPipeStream = tokio::net::UnixStream;
#[cfg(unix)]
pub type ClientPipeStream = tokio::net::UnixStream;

#[cfg(windows)]
pub type ServerPipeStream = tokio::net::windows::named_pipe::NamedPipeServer;
#[cfg(windows)]
pub type ClientPipeStream = tokio::net::windows::named_pipe::NamedPipeClient;

/// Connect to the pipe `name`, retrying while the server is not ready or busy.
///
/// Retries forever; callers bound the attempt with a timeout.
pub async fn connect(name: &str) -> io::Result<ClientPipeStream> {
    loop {
        match try_connect(name).await {
            Ok(stream) => return Ok(stream),
            Err(e) if is_retryable(&e) => {
                tracing::trace!("Pipe '{}' not ready: {}", name, e);
            }
            Err(e) => return Err(e),
        }
        tokio::time::sleep(TransportConfig::CONNECT_RETRY_INTERVAL).await;
    }
}

#[cfg(unix)]
async fn try_connect(name: &str) -> io::Result<ClientPipeStream> {
    tokio::net::UnixStream::connect(pipe_path(name)).await
}

#[cfg(unix)]
fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}

#[cfg(windows)]
async fn try_connect(name: &str) -> io::Result<ClientPipeStream> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(pipe_path(name))
}

#[cfg(windows)]
fn is_retryable(err: &io::Error) -> bool {
    use windows_sys::Win32::Foundation::ERROR_PIPE_BUSY;

    err.raw_os_error() == Some(ERROR_PIPE_BUSY as i32) || err.kind() == io::ErrorKind::NotFound
}

#[cfg(unix)]
mod unix {
    use super::ServerPipeStream;
    use std::io;
    use std::path::{Path, PathBuf};
    use tokio::net::{UnixListener, UnixStream};

    pub fn pipe_path(name: &str) -> PathBuf {
        let path = Path::new(name);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::temp_dir().join(format!("{}.sock", name))
        }
    }

    /// Accepts connections on a Unix-domain socket. Removes the socket file on drop.
    #[derive(Debug)]
    pub struct PipeListener {
        listener: UnixListener,
        path: PathBuf,
    }

    impl PipeListener {
        /// Bind `name`. A leftover socket file nobody listens on is replaced;
        /// a live one is `AddrInUse`.
        pub async fn bind(name: &str) -> io::Result<Self> {
            let path = pipe_path(name);
            if path.exists() {
                if UnixStream::connect(&path).await.is_ok() {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        format!("{} is already being served", path.display()),
                    ));
                }
                std::fs::remove_file(&path)?;
            }

            let listener = UnixListener::bind(&path)?;
            Ok(Self { listener, path })
        }

        pub async fn accept(&mut self) -> io::Result<ServerPipeStream> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(stream)
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Drop for PipeListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::ServerPipeStream;
    use std::io;
    use std::path::{Path, PathBuf};
    use tokio::net::windows::named_pipe::ServerOptions;

    pub fn pipe_path(name: &str) -> PathBuf {
        PathBuf::from(format!(r"\\.\pipe\{}", name))
    }

    /// Accepts connections on a named pipe, one instance per connection.
    #[derive(Debug)]
    pub struct PipeListener {
        next: ServerPipeStream,
        path: PathBuf,
    }

    impl PipeListener {
        pub async fn bind(name: &str) -> io::Result<Self> {
            let path = pipe_path(name);
            let next = ServerOptions::new().first_pipe_instance(true).create(&path)?;
            Ok(Self { next, path })
        }

        /// Wait for a client on the pending instance, then queue a fresh one.
        pub async fn accept(&mut self) -> io::Result<ServerPipeStream> {
            self.next.connect().await?;
            let fresh = ServerOptions::new().create(&self.path)?;
            Ok(std::mem::replace(&mut self.next, fresh))
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }
}
