//! Node channel protocol
//!
//! This crate defines the JSON frames exchanged between the relay and
//! connected nodes over the persistent control channel, and the codec that
//! turns them into text frames and back.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, Frame, FrameCodec};
pub use messages::*;

/// Maximum accepted text frame size (1MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;
