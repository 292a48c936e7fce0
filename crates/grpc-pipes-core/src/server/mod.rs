//! Server side: method registry, per-connection call context, and the listener.

pub mod context;
pub mod listener;
pub mod methods;

pub use context::{ServerConnection, ServerConnectionContext};
pub use listener::{PipeServer, PipeServerHandle};
pub use methods::{HandlerResult, MethodHandler, ServerMethods};
