//! Client side: per-call context and the channel that opens connections.

pub mod channel;
pub mod context;

pub use channel::PipeChannel;
pub use context::{CallOptions, ClientCall, ClientConnectionContext};
