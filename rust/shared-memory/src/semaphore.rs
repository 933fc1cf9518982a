//! Counting semaphores for slot synchronization
//!
//! Two implementations share one trait: POSIX named semaphores for
//! cross-process use, and an in-process semaphore for tests and
//! single-process pipelines.

use std::collections::HashMap;
use std::ffi::CString;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{Result, SharedMemoryError};
use crate::platform::PlatformUtils;

/// Owner read/write plus group read/write
const SEMAPHORE_MODE: libc::c_uint = 0o660;

/// A counting semaphore shared between producer and consumer
pub trait CountingSemaphore: Send + Sync {
    /// Increment the count, waking one waiter
    fn post(&self) -> Result<()>;

    /// Decrement without blocking; `false` when the count is zero
    fn try_wait(&self) -> Result<bool>;

    /// Decrement, blocking for at most `timeout`; `false` on timeout
    fn wait_timeout(&self, timeout: Duration) -> Result<bool>;

    /// Current count, where the platform can report it
    fn value(&self) -> Option<u32>;
}

/// Creates and opens semaphores by name
pub trait SemaphoreProvider {
    type Semaphore: CountingSemaphore;

    /// Create a new semaphore; fails if the name is taken
    fn create(&self, name: &str, initial: u32) -> Result<Self::Semaphore>;

    /// Open a semaphore created by the peer
    fn open(&self, name: &str) -> Result<Self::Semaphore>;
}

/// POSIX named semaphore
pub struct NamedSemaphore {
    name: String,
    sem: *mut libc::sem_t,
    is_creator: bool,
}

// SAFETY: sem_t operations are thread-safe and the handle is only closed in Drop
unsafe impl Send for NamedSemaphore {}
// SAFETY: see above
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Create a semaphore exclusively
    pub fn create(name: &str, initial: u32) -> Result<Self> {
        let c_name = semaphore_name(name)?;
        // SAFETY: c_name is NUL-terminated; mode and value are passed as c_uint
        // as sem_open expects for its variadic arguments
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                SEMAPHORE_MODE,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(SharedMemoryError::last_os_error(name));
        }

        debug!("Created semaphore {} with count {}", name, initial);
        Ok(Self {
            name: name.to_string(),
            sem,
            is_creator: true,
        })
    }

    /// Open an existing semaphore
    pub fn open(name: &str) -> Result<Self> {
        let c_name = semaphore_name(name)?;
        // SAFETY: c_name is NUL-terminated
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(SharedMemoryError::last_os_error(name));
        }

        debug!("Opened semaphore {}", name);
        Ok(Self {
            name: name.to_string(),
            sem,
            is_creator: false,
        })
    }

    /// Unlink a semaphore left behind by a session that never tore down
    pub fn remove_stale(name: &str) -> Result<bool> {
        match unlink_semaphore(name) {
            Ok(()) => {
                warn!("Removed stale semaphore {}", name);
                Ok(true)
            }
            Err(SharedMemoryError::RegionNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(not(target_os = "linux"))]
    fn poll_wait(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_wait()? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(1)));
        }
    }
}

impl CountingSemaphore for NamedSemaphore {
    fn post(&self) -> Result<()> {
        // SAFETY: self.sem is a live handle from sem_open
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(SharedMemoryError::last_os_error(format!("sem_post {}", self.name)));
        }
        Ok(())
    }

    fn try_wait(&self) -> Result<bool> {
        loop {
            // SAFETY: self.sem is a live handle from sem_open
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(true);
            }
            match Errno::last() {
                Errno::EAGAIN => return Ok(false),
                Errno::EINTR => continue,
                errno => {
                    return Err(SharedMemoryError::from_errno(
                        errno,
                        format!("sem_trywait {}", self.name),
                    ))
                }
            }
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                let deadline = realtime_deadline(timeout)?;
                loop {
                    // SAFETY: self.sem is live and deadline is a valid timespec
                    if unsafe { libc::sem_timedwait(self.sem, &deadline) } == 0 {
                        return Ok(true);
                    }
                    match Errno::last() {
                        Errno::ETIMEDOUT => return Ok(false),
                        Errno::EINTR => continue,
                        errno => {
                            return Err(SharedMemoryError::from_errno(
                                errno,
                                format!("sem_timedwait {}", self.name),
                            ))
                        }
                    }
                }
            } else {
                // No sem_timedwait on this platform
                self.poll_wait(timeout)
            }
        }
    }

    fn value(&self) -> Option<u32> {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                let mut value: libc::c_int = 0;
                // SAFETY: self.sem is live and value is a valid out pointer
                if unsafe { libc::sem_getvalue(self.sem, &mut value) } == 0 {
                    Some(value.max(0) as u32)
                } else {
                    None
                }
            } else {
                None
            }
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        // SAFETY: self.sem came from sem_open and is closed exactly once
        if unsafe { libc::sem_close(self.sem) } != 0 {
            warn!("Failed to close semaphore {}", self.name);
        }
        if self.is_creator {
            if let Err(err) = unlink_semaphore(&self.name) {
                warn!("Failed to unlink semaphore {}: {}", self.name, err);
            }
        }
    }
}

impl std::fmt::Debug for NamedSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedSemaphore")
            .field("name", &self.name)
            .field("is_creator", &self.is_creator)
            .finish()
    }
}

fn semaphore_name(name: &str) -> Result<CString> {
    if !PlatformUtils::validate_object_name(name) {
        return Err(SharedMemoryError::InvalidName(name.to_string()));
    }
    CString::new(name).map_err(|_| SharedMemoryError::InvalidName(name.to_string()))
}

fn unlink_semaphore(name: &str) -> Result<()> {
    let c_name = semaphore_name(name)?;
    // SAFETY: c_name is NUL-terminated
    if unsafe { libc::sem_unlink(c_name.as_ptr()) } != 0 {
        return Err(SharedMemoryError::last_os_error(name));
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn realtime_deadline(timeout: Duration) -> Result<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: now is a valid out pointer
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
        return Err(SharedMemoryError::last_os_error("clock_gettime"));
    }

    let nanos = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
    Ok(libc::timespec {
        tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as _,
    })
}

/// Provider for [`NamedSemaphore`]
#[derive(Debug, Clone, Copy, Default)]
pub struct NamedSemaphores;

impl SemaphoreProvider for NamedSemaphores {
    type Semaphore = NamedSemaphore;

    fn create(&self, name: &str, initial: u32) -> Result<NamedSemaphore> {
        NamedSemaphore::create(name, initial)
    }

    fn open(&self, name: &str) -> Result<NamedSemaphore> {
        NamedSemaphore::open(name)
    }
}

#[derive(Debug)]
struct LocalState {
    count: Mutex<u32>,
    available: Condvar,
}

type Registry = Mutex<HashMap<String, Arc<LocalState>>>;

/// In-process counting semaphore
#[derive(Debug)]
pub struct LocalSemaphore {
    state: Arc<LocalState>,
    registration: Option<Registration>,
}

/// Removes a created semaphore from its registry when the creator drops
#[derive(Debug)]
struct Registration {
    registry: Weak<Registry>,
    name: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(&self.name);
        }
    }
}

impl LocalSemaphore {
    /// Standalone semaphore not reachable by name
    pub fn new(initial: u32) -> Self {
        Self {
            state: Arc::new(LocalState {
                count: Mutex::new(initial),
                available: Condvar::new(),
            }),
            registration: None,
        }
    }

    /// Another handle to the same count
    pub fn handle(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            registration: None,
        }
    }
}

impl CountingSemaphore for LocalSemaphore {
    fn post(&self) -> Result<()> {
        let mut count = self.state.count.lock();
        *count += 1;
        self.state.available.notify_one();
        Ok(())
    }

    fn try_wait(&self) -> Result<bool> {
        let mut count = self.state.count.lock();
        if *count > 0 {
            *count -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut count = self.state.count.lock();
        while *count == 0 {
            if self.state.available.wait_until(&mut count, deadline).timed_out() {
                break;
            }
        }
        if *count > 0 {
            *count -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn value(&self) -> Option<u32> {
        Some(*self.state.count.lock())
    }
}

/// Provider for [`LocalSemaphore`], backed by a shared name registry.
///
/// Clones share the registry, so a producer and a consumer on different
/// threads can rendezvous by name.
#[derive(Debug, Clone, Default)]
pub struct LocalSemaphores {
    registry: Arc<Registry>,
}

impl LocalSemaphores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live named semaphores
    pub fn len(&self) -> usize {
        self.registry.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.lock().is_empty()
    }
}

impl SemaphoreProvider for LocalSemaphores {
    type Semaphore = LocalSemaphore;

    fn create(&self, name: &str, initial: u32) -> Result<LocalSemaphore> {
        let mut registry = self.registry.lock();
        if registry.contains_key(name) {
            return Err(SharedMemoryError::RegionExists(name.to_string()));
        }

        let semaphore = LocalSemaphore::new(initial);
        registry.insert(name.to_string(), Arc::clone(&semaphore.state));
        Ok(LocalSemaphore {
            registration: Some(Registration {
                registry: Arc::downgrade(&self.registry),
                name: name.to_string(),
            }),
            ..semaphore
        })
    }

    fn open(&self, name: &str) -> Result<LocalSemaphore> {
        let registry = self.registry.lock();
        let state = registry
            .get(name)
            .ok_or_else(|| SharedMemoryError::RegionNotFound(name.to_string()))?;
        Ok(LocalSemaphore {
            state: Arc::clone(state),
            registration: None,
        })
    }
}

/// The free/ready pair guarding one ring.
///
/// `free` starts at the slot count and `ready` at zero; every slot is
/// always counted by exactly one of free, ready or in flight.
#[derive(Debug)]
pub struct Synchronizer<S> {
    pub free: S,
    pub ready: S,
}

impl<S: CountingSemaphore> Synchronizer<S> {
    /// Create both semaphores. If `ready` cannot be created, `free` is
    /// dropped (and unlinked) before returning.
    pub fn create<P>(provider: &P, free_name: &str, ready_name: &str, slot_count: u32) -> Result<Self>
    where
        P: SemaphoreProvider<Semaphore = S>,
    {
        let free = provider.create(free_name, slot_count)?;
        let ready = provider.create(ready_name, 0)?;
        Ok(Self { free, ready })
    }

    pub fn open<P>(provider: &P, free_name: &str, ready_name: &str) -> Result<Self>
    where
        P: SemaphoreProvider<Semaphore = S>,
    {
        let free = provider.open(free_name)?;
        let ready = provider.open(ready_name)?;
        Ok(Self { free, ready })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn unique_name(tag: &str) -> String {
        format!("/sfs{}{}", tag, &uuid::Uuid::new_v4().simple().to_string()[..12])
    }

    #[test]
    fn test_local_semaphore_counts() {
        let sem = LocalSemaphore::new(2);
        assert!(sem.try_wait().unwrap());
        assert!(sem.try_wait().unwrap());
        assert!(!sem.try_wait().unwrap());
        assert!(!sem.wait_timeout(Duration::from_millis(10)).unwrap());

        sem.post().unwrap();
        assert_eq!(sem.value(), Some(1));
        assert!(sem.wait_timeout(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_local_semaphore_wakes_waiter() {
        let sem = LocalSemaphore::new(0);
        let poster = sem.handle();

        let waiter = thread::spawn(move || sem.wait_timeout(Duration::from_secs(5)).unwrap());
        thread::sleep(Duration::from_millis(20));
        poster.post().unwrap();

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_local_registry() {
        let provider = LocalSemaphores::new();
        let created = provider.create("/a", 3).unwrap();
        assert!(matches!(provider.create("/a", 3), Err(SharedMemoryError::RegionExists(_))));

        let opened = provider.open("/a").unwrap();
        assert!(opened.try_wait().unwrap());
        assert_eq!(created.value(), Some(2));

        drop(created);
        assert!(provider.is_empty());
        assert!(matches!(provider.open("/a"), Err(SharedMemoryError::RegionNotFound(_))));
    }

    #[test]
    fn test_named_semaphore_round_trip() {
        let name = unique_name("n");
        let created = NamedSemaphore::create(&name, 1).unwrap();
        let opened = NamedSemaphore::open(&name).unwrap();

        assert!(opened.try_wait().unwrap());
        assert!(!opened.wait_timeout(Duration::from_millis(10)).unwrap());
        created.post().unwrap();
        assert!(opened.wait_timeout(Duration::from_millis(100)).unwrap());

        assert!(matches!(
            NamedSemaphore::create(&name, 0),
            Err(SharedMemoryError::RegionExists(_))
        ));

        drop(opened);
        drop(created);
        assert!(NamedSemaphore::open(&name).is_err());
    }

    #[test]
    fn test_named_semaphore_remove_stale() {
        let name = unique_name("s");
        std::mem::forget(NamedSemaphore::create(&name, 0).unwrap());
        assert!(NamedSemaphore::remove_stale(&name).unwrap());
        assert!(!NamedSemaphore::remove_stale(&name).unwrap());
    }

    #[test]
    fn test_synchronizer_initial_counts() {
        let provider = LocalSemaphores::new();
        let sync = Synchronizer::create(&provider, "/f", "/r", 3).unwrap();
        assert_eq!(sync.free.value(), Some(3));
        assert_eq!(sync.ready.value(), Some(0));

        let peer = Synchronizer::open(&provider, "/f", "/r").unwrap();
        assert!(peer.free.try_wait().unwrap());
        assert_eq!(sync.free.value(), Some(2));

        // A taken name unwinds the first semaphore
        let _blocker = provider.create("/r2", 0).unwrap();
        assert!(Synchronizer::create(&provider, "/f2", "/r2", 3).is_err());
        assert!(provider.open("/f2").is_err());
    }
}
