//! Wire-level types for the DMR network hub.
//!
//! Everything in this crate is pure: codecs take byte slices and return
//! typed values or a [`FrameError`]. No sockets, no logging, no clocks.

pub mod command;
pub mod config_block;
pub mod id;
pub mod openbridge;
pub mod packet;

pub use command::Command;
pub use config_block::ConfigBlock;
pub use packet::{FrameType, Packet};

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("bad frame length: {0} bytes")]
    BadLength(usize),

    #[error("bad signature")]
    BadSignature,

    #[error("unknown command")]
    UnknownCommand,

    #[error("reserved frame type")]
    ReservedFrameType,

    #[error("authentication tag mismatch")]
    BadTag,

    #[error("invalid field: {0}")]
    BadField(&'static str),
}
