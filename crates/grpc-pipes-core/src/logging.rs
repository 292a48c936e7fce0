//! Per-connection log prefixing.
//!
//! Every line is emitted through `tracing` as `[SERVER][3] message` or
//! `[CLIENT][?] message`. Without an installed subscriber these calls cost
//! nothing and print nothing.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Which end of a connection this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    fn tag(self) -> &'static str {
        match self {
            Role::Server => "SERVER",
            Role::Client => "CLIENT",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Server => write!(f, "server"),
            Role::Client => write!(f, "client"),
        }
    }
}

/// Log sink keyed by role and connection id. Id `0` means "not assigned".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLogger {
    role: Role,
    id: u64,
}

impl ConnectionLogger {
    pub fn new(role: Role, id: u64) -> Self {
        Self { role, id }
    }

    pub fn server(id: u64) -> Self {
        Self::new(Role::Server, id)
    }

    /// A client logger with the next process-wide connection id.
    pub fn client() -> Self {
        Self::new(Role::Client, NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn trace(&self, message: impl fmt::Display) {
        tracing::trace!("{} {}", self, message);
    }

    pub fn debug(&self, message: impl fmt::Display) {
        tracing::debug!("{} {}", self, message);
    }

    pub fn warn(&self, message: impl fmt::Display) {
        tracing::warn!("{} {}", self, message);
    }

    pub fn error(&self, message: impl fmt::Display) {
        tracing::error!("{} {}", self, message);
    }
}

impl fmt::Display for ConnectionLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id > 0 {
            write!(f, "[{}][{}]", self.role.tag(), self.id)
        } else {
            write!(f, "[{}][?]", self.role.tag())
        }
    }
}
