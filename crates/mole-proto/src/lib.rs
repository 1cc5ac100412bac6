//! Mole Protocol Definitions
//!
//! This crate defines the control commands exchanged between the broker and
//! its agents, and the length-prefixed framing used to put them on a byte stream.

pub mod codec;
pub mod duration;
pub mod messages;

pub use codec::{read_command, write_command, CodecError, CommandCodec};
pub use messages::*;

/// Maximum frame payload size (64KB). Commands are a handful of short strings.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Size of the big-endian length prefix in front of every frame
pub const FRAME_HEADER_SIZE: usize = 4;
