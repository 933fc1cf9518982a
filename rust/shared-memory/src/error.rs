//! Shared memory specific error types

use nix::errno::Errno;
use shmframe_core::TransportError;
use thiserror::Error;

/// Shared memory error types
#[derive(Error, Debug)]
pub enum SharedMemoryError {
    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(String),

    /// Segment or semaphore not found
    #[error("Shared memory object not found: {0}")]
    RegionNotFound(String),

    /// Segment or semaphore already exists
    #[error("Shared memory object already exists: {0}")]
    RegionExists(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Not enough memory to back the segment
    #[error("No space for shared memory object: {0}")]
    NoSpace(String),

    /// Opened segment is smaller than the negotiated layout
    #[error("Segment {name} holds {actual} bytes, expected at least {expected}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// Control block does not describe the negotiated layout
    #[error("Control block mismatch in {name}: {detail}")]
    LayoutMismatch { name: String, detail: String },

    /// Name unusable for a POSIX shared memory object
    #[error("Invalid object name {0:?}")]
    InvalidName(String),

    /// Memory mapping failed
    #[error("Memory mapping failed: {0}")]
    MappingFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias
pub type Result<T> = std::result::Result<T, SharedMemoryError>;

impl SharedMemoryError {
    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            SharedMemoryError::Io(err) => {
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

    /// Convert an errno from a failed system call
    pub fn from_errno(errno: Errno, context: impl Into<String>) -> Self {
        let context = context.into();
        match errno {
            Errno::EACCES | Errno::EPERM => SharedMemoryError::PermissionDenied(context),
            Errno::ENOENT => SharedMemoryError::RegionNotFound(context),
            Errno::EEXIST => SharedMemoryError::RegionExists(context),
            Errno::ENOSPC | Errno::ENOMEM | Errno::EFBIG => SharedMemoryError::NoSpace(context),
            Errno::EINVAL | Errno::ENAMETOOLONG => SharedMemoryError::InvalidName(context),
            other => SharedMemoryError::Platform(format!("{}: {}", context, other.desc())),
        }
    }

    /// Convert the calling thread's current errno
    pub fn last_os_error(context: impl Into<String>) -> Self {
        Self::from_errno(Errno::last(), context)
    }
}

impl From<SharedMemoryError> for TransportError {
    fn from(err: SharedMemoryError) -> Self {
        match err {
            SharedMemoryError::RegionNotFound(name) => TransportError::NotFound(name),
            SharedMemoryError::RegionExists(name) => TransportError::AlreadyExists(name),
            SharedMemoryError::PermissionDenied(name) => TransportError::PermissionDenied(name),
            SharedMemoryError::NoSpace(name) => TransportError::NoSpace(name),
            SharedMemoryError::SizeMismatch {
                name,
                expected,
                actual,
            } => TransportError::SizeMismatch {
                name,
                expected,
                actual,
            },
            SharedMemoryError::Io(err) => TransportError::Io(err),
            other => TransportError::Platform(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shmframe_core::ErrorCategory;

    #[test]
    fn test_errno_mapping() {
        assert!(matches!(
            SharedMemoryError::from_errno(Errno::ENOENT, "/x"),
            SharedMemoryError::RegionNotFound(_)
        ));
        assert!(matches!(
            SharedMemoryError::from_errno(Errno::EEXIST, "/x"),
            SharedMemoryError::RegionExists(_)
        ));
        assert!(matches!(
            SharedMemoryError::from_errno(Errno::EACCES, "/x"),
            SharedMemoryError::PermissionDenied(_)
        ));
        assert!(matches!(
            SharedMemoryError::from_errno(Errno::ENOSPC, "/x"),
            SharedMemoryError::NoSpace(_)
        ));
        assert!(matches!(
            SharedMemoryError::from_errno(Errno::EBADF, "/x"),
            SharedMemoryError::Platform(_)
        ));
    }

    #[test]
    fn test_conversion_keeps_resource_category() {
        let err: TransportError = SharedMemoryError::SizeMismatch {
            name: "/x".to_string(),
            expected: 4096,
            actual: 64,
        }
        .into();
        assert!(matches!(err, TransportError::SizeMismatch { expected: 4096, .. }));
        assert_eq!(err.category(), ErrorCategory::Resource);

        let err: TransportError = SharedMemoryError::MappingFailed("mmap".to_string()).into();
        assert_eq!(err.category(), ErrorCategory::Resource);
    }
}
