//! shmframe - Core Module
//!
//! Wire protocol, media formats, configuration and repacketization for
//! moving raw media frames between processes through shared memory.

pub mod codec;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod format;
pub mod packer;
pub mod pipeline;
pub mod stats;

pub use codec::*;
pub use config::*;
pub use descriptor::*;
pub use error::*;
pub use format::*;
pub use packer::*;
pub use pipeline::*;
pub use stats::*;

/// Re-export common types
pub mod prelude {
    pub use crate::{
        codec::{MetadataReader, MetadataWriter, ProtocolError},
        config::TransportConfig,
        descriptor::{Addressing, FrameDescriptor, FrameKind, SessionDescriptor, SessionId},
        error::{Result, TransportError},
        format::{AudioFormat, PixelFormat, Rational, SampleFormat, StreamFormat, StreamKind, VideoFormat},
        pipeline::{Frame, FrameSink, FrameSource, MediaUnit},
    };
}

/// Version of the metadata channel protocol
pub const PROTOCOL_VERSION: u32 = 1;

/// A session carries at most one video and one audio stream
pub const MAX_STREAMS: usize = 2;

/// Width of a name field in the session descriptor
pub const NAME_FIELD_LEN: usize = 64;

/// Longest name that still leaves a terminating NUL in its field
pub const MAX_NAME_LEN: usize = NAME_FIELD_LEN - 1;

/// Default number of slots per ring
pub const DEFAULT_SLOT_COUNT: u32 = 3;
