//! Platform-specific utilities

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Platform-specific utilities
pub struct PlatformUtils;

impl PlatformUtils {
    /// Get current process ID
    pub fn get_process_id() -> u32 {
        std::process::id()
    }

    /// Check whether a process exists.
    ///
    /// Uses signal 0, so nothing is delivered. A process owned by another
    /// user still counts as alive.
    pub fn process_alive(pid: u32) -> bool {
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }
        match kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    /// Validate a POSIX shared memory or semaphore name: a leading slash,
    /// no further slashes, no NUL bytes.
    pub fn validate_object_name(name: &str) -> bool {
        const NAME_MAX: usize = 255;

        name.len() > 1
            && name.len() <= NAME_MAX
            && name.starts_with('/')
            && !name[1..].contains('/')
            && !name.contains('\0')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(PlatformUtils::process_alive(PlatformUtils::get_process_id()));
        assert!(!PlatformUtils::process_alive(0));
        assert!(!PlatformUtils::process_alive(u32::MAX));
    }

    #[test]
    fn test_object_names() {
        assert!(PlatformUtils::validate_object_name("/sf0123v"));
        assert!(!PlatformUtils::validate_object_name("sf0123v"));
        assert!(!PlatformUtils::validate_object_name("/"));
        assert!(!PlatformUtils::validate_object_name("/a/b"));
        assert!(!PlatformUtils::validate_object_name("/a\0b"));
    }
}
