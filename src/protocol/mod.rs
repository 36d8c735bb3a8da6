//! Wire protocol for SiteWhere device frames
//!
//! Frames are delimited protocol-buffer records; topics follow the
//! `<prefix>/...` layout described in [`topics`].

pub mod codec;
pub mod commands;
pub mod messages;
pub mod topics;
pub mod wire;

pub use codec::{Frame, FrameCodec};
pub use commands::{
    dispatch_custom_command, CustomCommand, CustomCommandEnvelope, CustomCommandHandler,
};
pub use messages::*;
pub use topics::*;
pub use wire::{hex_dump, CodecError};
