//! Error types for the shmframe transport

use thiserror::Error;

use crate::codec::ProtocolError;

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Segment or semaphore does not exist
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Segment or semaphore already exists
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Not enough shared memory to size the segment
    #[error("No space left for segment: {0}")]
    NoSpace(String),

    /// Opened segment is smaller than the negotiated layout
    #[error("Segment {name} size mismatch: expected at least {expected} bytes, found {actual}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// Any other platform failure while creating, opening or mapping
    #[error("Platform error: {0}")]
    Platform(String),

    /// Metadata channel framing errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Payload does not fit in one slot
    #[error("Frame of {size} bytes exceeds slot capacity of {capacity} bytes")]
    FrameTooLarge { size: usize, capacity: usize },

    /// Accumulation buffer would overflow
    #[error("Unit of {size} bytes overflows accumulation buffer ({buffered}/{capacity} bytes used)")]
    BufferOverflow {
        size: usize,
        buffered: usize,
        capacity: usize,
    },

    /// Descriptor points outside the mapped slot area
    #[error("Payload range {offset}+{size} is outside the slot area [{start}, {end})")]
    OutOfBounds {
        offset: u64,
        size: u64,
        start: u64,
        end: u64,
    },

    /// A semaphore wait exceeded its deadline
    #[error("Timed out after {waited_ms}ms waiting for {what}")]
    Timeout { what: &'static str, waited_ms: u64 },

    /// The peer process exited or detached
    #[error("Peer gone: {0}")]
    PeerGone(String),

    /// The stream has already ended
    #[error("End of stream")]
    EndOfStream,

    /// A frame descriptor was given up before its ready post arrived, so
    /// later descriptors no longer pair with later posts
    #[error("Channel out of step: {0}")]
    OutOfStep(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Convenience type alias for Results
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Check if the error is recoverable
    ///
    /// Recoverable errors concern a single frame; the session keeps going.
    pub fn is_recoverable(&self) -> bool {
        match self {
            TransportError::FrameTooLarge { .. } => true,
            TransportError::BufferOverflow { .. } => true,
            TransportError::OutOfBounds { .. } => true,
            TransportError::Io(err) => {
                matches!(
                    err.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                )
            }
            _ => false,
        }
    }

    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            TransportError::Io(_) => ErrorCategory::Io,
            TransportError::NotFound(_)
            | TransportError::AlreadyExists(_)
            | TransportError::PermissionDenied(_)
            | TransportError::NoSpace(_)
            | TransportError::SizeMismatch { .. }
            | TransportError::Platform(_) => ErrorCategory::Resource,
            TransportError::Protocol(_) => ErrorCategory::Protocol,
            TransportError::FrameTooLarge { .. } | TransportError::BufferOverflow { .. } => {
                ErrorCategory::Capacity
            }
            TransportError::OutOfBounds { .. } => ErrorCategory::Consistency,
            TransportError::Timeout { .. } | TransportError::PeerGone(_) => {
                ErrorCategory::Liveness
            }
            TransportError::EndOfStream | TransportError::OutOfStep(_) => ErrorCategory::Protocol,
            TransportError::Configuration(_) => ErrorCategory::Configuration,
        }
    }
}

/// Error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Io,
    /// Segment/semaphore create, open or map failures
    Resource,
    /// Short or garbled metadata records
    Protocol,
    /// Oversized frames and accumulation overflow
    Capacity,
    /// Offsets or sizes outside the segment
    Consistency,
    /// Wait timeouts and dead peers
    Liveness,
    Configuration,
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Configuration(err.to_string())
    }
}
