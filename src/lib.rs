//! shmframe
//!
//! Moves raw video pictures and PCM audio between two processes on one host.
//! Payloads travel through POSIX shared memory; an ordered byte stream (a
//! pipe or Unix socket) carries the session descriptor and one frame
//! descriptor per payload.
//!
//! ```no_run
//! use std::os::unix::net::UnixStream;
//! use shmframe::prelude::*;
//!
//! # fn main() -> shmframe::core::Result<()> {
//! let (tx, rx) = UnixStream::pair()?;
//! let config = TransportConfig::default();
//! let audio = StreamFormat::Audio(AudioFormat::with_default_cadence(48_000, 2, SampleFormat::S16));
//!
//! let producer_config = config.clone();
//! let producer = std::thread::spawn(move || {
//!     let mut session = ProducerSession::create(tx, &NamedSemaphores, &[audio], &producer_config)?;
//!     session.push_audio(&[0u8; 1000])?;
//!     session.finish()
//! });
//!
//! let mut consumer = ConsumerSession::open(rx, &NamedSemaphores, &config)?;
//! while let Some(frame) = consumer.next_frame()? {
//!     println!("{} frame at {}: {} bytes", frame.kind, frame.pts, frame.len());
//! }
//! # producer.join().unwrap()?;
//! # Ok(())
//! # }
//! ```

pub use shmframe_core as core;
pub use shmframe_shared_memory as shared_memory;

/// Re-export common types
pub mod prelude {
    pub use shmframe_core::prelude::*;
    pub use shmframe_core::{FramePacker, PushOutcome, StatsSnapshot};
    pub use shmframe_shared_memory::{
        ConsumerSession, LocalSemaphores, NamedSemaphores, ProducerSession, SessionSummary,
    };
}
