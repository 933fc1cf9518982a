//! shmframe - Shared Memory Module
//!
//! POSIX shared memory segments, cross-process slot synchronization and the
//! producer/consumer sessions built on them.

#[cfg(not(unix))]
compile_error!("shmframe-shared-memory requires POSIX shared memory and semaphores");

pub mod channel;
pub mod control;
pub mod error;
pub mod platform;
pub mod region;
pub mod ring;
pub mod semaphore;
pub mod session;

pub use channel::{remove_stale, ConsumerChannel, ProducerChannel, ReadySlot, Slot, WaitPolicy};
pub use control::{ControlBlock, SegmentLayout, CONTROL_BLOCK_SIZE, SEGMENT_MAGIC, SEGMENT_VERSION};
pub use error::SharedMemoryError;
pub use platform::PlatformUtils;
pub use region::SharedMemoryRegion;
pub use ring::SlotRing;
pub use semaphore::{
    CountingSemaphore, LocalSemaphore, LocalSemaphores, NamedSemaphore, NamedSemaphores,
    SemaphoreProvider, Synchronizer,
};
pub use session::{ConsumerSession, ProducerSession, SessionSummary};
