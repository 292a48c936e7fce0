//! Frame transport over one duplex byte stream.
//!
//! - [`frame`]: the frame vocabulary and its binary encoding
//! - [`reader`]: reads one frame at a time and dispatches it to a [`FrameHandler`]
//! - [`writer`]: the [`Transport`] that commits batches of frames atomically

pub mod frame;
pub mod reader;
pub mod writer;

pub use frame::{Frame, FrameKind};
pub use reader::{FrameHandler, FrameReader};
pub use writer::{Transport, WriteBatch};
