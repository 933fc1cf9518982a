//! Shared memory segment management

use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::FromRawFd;

use memmap2::{MmapOptions, MmapRaw};
use nix::errno::Errno;
use tracing::{debug, instrument, warn};

use crate::error::{Result, SharedMemoryError};
use crate::platform::PlatformUtils;

/// Owner read/write plus group read/write
const SEGMENT_MODE: libc::mode_t = 0o660;

/// A mapped POSIX shared memory segment.
///
/// The creating side unlinks the name when the handle drops; an opening
/// side only unmaps and closes.
pub struct SharedMemoryRegion {
    name: String,
    size: usize,
    map: MmapRaw,
    // Keeps the descriptor open for as long as the mapping lives
    _file: File,
    is_creator: bool,
}

impl std::fmt::Debug for SharedMemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryRegion")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("is_creator", &self.is_creator)
            .finish()
    }
}

impl SharedMemoryRegion {
    /// Create a new segment of `size` bytes.
    ///
    /// Creation is exclusive: an existing object of the same name is an
    /// error, see [`SharedMemoryRegion::remove_stale`].
    #[instrument(level = "debug")]
    pub fn create(name: &str, size: usize) -> Result<Self> {
        validate_region_name(name)?;
        if size == 0 {
            return Err(SharedMemoryError::MappingFailed(format!("{}: zero-sized segment", name)));
        }

        let file = shm_open(name, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR)?;

        // From here on the name exists; unlink it again if sizing or mapping fails
        let map = match size_and_map(&file, name, size) {
            Ok(map) => map,
            Err(err) => {
                if let Err(unlink_err) = unlink(name) {
                    warn!("Failed to unlink {} after setup error: {}", name, unlink_err);
                }
                return Err(err);
            }
        };

        debug!("Created segment {} ({} bytes)", name, size);

        Ok(Self {
            name: name.to_string(),
            size,
            map,
            _file: file,
            is_creator: true,
        })
    }

    /// Open an existing segment that must hold at least `expected` bytes
    #[instrument(level = "debug")]
    pub fn open(name: &str, expected: usize) -> Result<Self> {
        validate_region_name(name)?;

        let file = shm_open(name, libc::O_RDWR)?;
        let actual = file.metadata()?.len() as usize;
        if actual < expected || actual == 0 {
            return Err(SharedMemoryError::SizeMismatch {
                name: name.to_string(),
                expected,
                actual,
            });
        }

        let map = MmapOptions::new()
            .len(actual)
            .map_raw(&file)
            .map_err(|e| SharedMemoryError::MappingFailed(format!("{}: {}", name, e)))?;

        debug!("Opened segment {} ({} bytes)", name, actual);

        Ok(Self {
            name: name.to_string(),
            size: actual,
            map,
            _file: file,
            is_creator: false,
        })
    }

    /// Unlink a segment left behind by a session that never tore down.
    ///
    /// Returns whether anything was removed.
    pub fn remove_stale(name: &str) -> Result<bool> {
        validate_region_name(name)?;
        match unlink(name) {
            Ok(()) => {
                warn!("Removed stale segment {}", name);
                Ok(true)
            }
            Err(SharedMemoryError::RegionNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mapped size in bytes
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_creator(&self) -> bool {
        self.is_creator
    }

    /// Base of the mapping. The mapping is page aligned.
    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        // The mapping and descriptor are released by their own destructors
        if self.is_creator {
            match unlink(&self.name) {
                Ok(()) => debug!("Unlinked segment {}", self.name),
                Err(err) => warn!("Failed to unlink segment {}: {}", self.name, err),
            }
        }
    }
}

fn shm_open(name: &str, flags: libc::c_int) -> Result<File> {
    let c_name = CString::new(name).map_err(|_| SharedMemoryError::InvalidName(name.to_string()))?;

    // SAFETY: c_name is a valid NUL-terminated string for the duration of the call
    let fd = unsafe { libc::shm_open(c_name.as_ptr(), flags, SEGMENT_MODE as libc::c_uint) };
    if fd < 0 {
        return Err(SharedMemoryError::from_errno(Errno::last(), name));
    }

    // SAFETY: fd was just returned by shm_open and is owned by nothing else
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn size_and_map(file: &File, name: &str, size: usize) -> Result<MmapRaw> {
    file.set_len(size as u64).map_err(|e| match e.raw_os_error() {
        Some(code) => SharedMemoryError::from_errno(Errno::from_i32(code), name),
        None => SharedMemoryError::Io(e),
    })?;

    MmapOptions::new()
        .len(size)
        .map_raw(file)
        .map_err(|e| SharedMemoryError::MappingFailed(format!("{}: {}", name, e)))
}

fn unlink(name: &str) -> Result<()> {
    nix::sys::mman::shm_unlink(name).map_err(|errno| SharedMemoryError::from_errno(errno, name))
}

/// Validate region name
fn validate_region_name(name: &str) -> Result<()> {
    if !PlatformUtils::validate_object_name(name) {
        return Err(SharedMemoryError::InvalidName(name.to_string()));
    }
    Ok(())
}
