//! Producer and consumer endpoints of one stream
//!
//! A channel pairs a [`SlotRing`] with a [`Synchronizer`]. The producer
//! sequence is acquire free, copy payload, write descriptor, post ready. The
//! consumer sequence is read descriptor, wait ready, copy payload, post
//! free. Every wait is bounded and checks on the peer between polls.

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use shmframe_core::{
    Addressing, ChannelStats, Frame, FrameDescriptor, MetadataWriter, Result, StreamDescriptor,
    StreamKind, StreamNames, TransportConfig, TransportError,
};
use tracing::{debug, info, instrument, trace, warn};

use crate::control::{ControlBlock, SegmentLayout};
use crate::error::SharedMemoryError;
use crate::platform::PlatformUtils;
use crate::region::SharedMemoryRegion;
use crate::ring::SlotRing;
use crate::semaphore::{CountingSemaphore, NamedSemaphore, SemaphoreProvider, Synchronizer};

/// How long and how finely a semaphore wait may block
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    /// `None` waits for as long as the peer stays alive
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
}

impl WaitPolicy {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            timeout: config.wait_timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Wait on `sem`, consulting `check` after every poll interval.
    ///
    /// `check` returns `Ok(true)` to stop waiting without an error.
    fn wait<S, F>(&self, sem: &S, what: &'static str, mut check: F) -> Result<WaitOutcome>
    where
        S: CountingSemaphore,
        F: FnMut() -> Result<bool>,
    {
        let started = Instant::now();
        let deadline = self.timeout.map(|t| started + t);

        loop {
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        if sem.try_wait()? {
                            return Ok(WaitOutcome::Acquired);
                        }
                        return Err(TransportError::Timeout {
                            what,
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    self.poll_interval.min(deadline - now)
                }
                None => self.poll_interval,
            };

            if sem.wait_timeout(slice)? {
                return Ok(WaitOutcome::Acquired);
            }
            if check()? {
                return Ok(WaitOutcome::Abandoned);
            }
        }
    }
}

enum WaitOutcome {
    Acquired,
    Abandoned,
}

/// A slot the producer owns until it publishes.
///
/// The channel keeps the reservation, so a slot dropped unpublished is handed
/// out again by the next acquire.
#[derive(Debug)]
#[must_use = "an acquired slot stays reserved until it is published"]
pub struct Slot {
    sequence: u64,
    offset: u64,
    capacity: usize,
}

impl Slot {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A published slot the consumer owns until it releases
#[derive(Debug)]
#[must_use = "a ready slot must be released or the producer eventually stalls"]
pub struct ReadySlot {
    kind: StreamKind,
    sequence: u64,
    offset: u64,
    size: u32,
    pts: i64,
}

impl ReadySlot {
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn pts(&self) -> i64 {
        self.pts
    }
}

fn segment_layout(stream: &StreamDescriptor) -> SegmentLayout {
    SegmentLayout::new(stream.slot_count, stream.slot_size)
}

fn shm_err(err: SharedMemoryError) -> TransportError {
    err.into()
}

/// Producer end of one stream
#[derive(Debug)]
pub struct ProducerChannel<S: CountingSemaphore> {
    kind: StreamKind,
    // Dropped before the ring: semaphores first, then the segment
    sync: Synchronizer<S>,
    ring: SlotRing,
    next_sequence: u64,
    // Sequence of a slot acquired but not yet published
    reserved: Option<u64>,
    wait: WaitPolicy,
    stats: Arc<ChannelStats>,
}

impl<S: CountingSemaphore> ProducerChannel<S> {
    /// Create the segment and both semaphores of one stream.
    ///
    /// If a semaphore cannot be created, everything created before it is
    /// removed again before the error is returned.
    #[instrument(level = "debug", skip_all, fields(segment = %stream.names.segment))]
    pub fn create<P>(
        provider: &P,
        stream: &StreamDescriptor,
        addressing: Addressing,
        config: &TransportConfig,
    ) -> Result<Self>
    where
        P: SemaphoreProvider<Semaphore = S>,
    {
        let ring = SlotRing::create(&stream.names.segment, segment_layout(stream), addressing)
            .map_err(shm_err)?;
        let sync = Synchronizer::create(
            provider,
            &stream.names.free_semaphore,
            &stream.names.ready_semaphore,
            stream.slot_count,
        )
        .map_err(shm_err)?;

        info!(
            "Created {} channel {} ({} slots of {} bytes)",
            stream.kind(),
            stream.names.segment,
            stream.slot_count,
            stream.slot_size
        );

        Ok(Self {
            kind: stream.kind(),
            sync,
            ring,
            next_sequence: 0,
            reserved: None,
            wait: WaitPolicy::from_config(config),
            stats: Arc::new(ChannelStats::new()),
        })
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn slot_capacity(&self) -> usize {
        self.ring.slot_capacity()
    }

    pub fn stats(&self) -> &Arc<ChannelStats> {
        &self.stats
    }

    pub fn control(&self) -> &ControlBlock {
        self.ring.control()
    }

    fn slot(&self, sequence: u64) -> Slot {
        Slot {
            sequence,
            offset: self.ring.slot_offset(sequence),
            capacity: self.ring.slot_capacity(),
        }
    }

    fn take_slot(&mut self) -> Slot {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.reserved = Some(sequence);
        self.slot(sequence)
    }

    /// Block until a slot is free; slots are handed out strictly round robin
    pub fn acquire_slot(&mut self) -> Result<Slot> {
        if let Some(sequence) = self.reserved {
            return Ok(self.slot(sequence));
        }

        let control = self.ring.control();
        let outcome = self.wait.wait(&self.sync.free, "a free slot", || {
            if control.is_consumer_detached() {
                return Err(TransportError::PeerGone(format!(
                    "consumer detached from {}",
                    self.ring.name()
                )));
            }
            let consumer = control.consumer_pid();
            if consumer != 0 && !PlatformUtils::process_alive(consumer) {
                return Err(TransportError::PeerGone(format!("consumer {} exited", consumer)));
            }
            Ok(false)
        });

        match outcome {
            Ok(_) => Ok(self.take_slot()),
            Err(err) => {
                if matches!(err, TransportError::Timeout { .. }) {
                    self.stats.record_timeout();
                }
                Err(err)
            }
        }
    }

    /// Take a free slot if one is available right now
    pub fn try_acquire_slot(&mut self) -> Result<Option<Slot>> {
        if let Some(sequence) = self.reserved {
            return Ok(Some(self.slot(sequence)));
        }
        if self.sync.free.try_wait().map_err(shm_err)? {
            Ok(Some(self.take_slot()))
        } else {
            Ok(None)
        }
    }

    /// Copy the payload, write its descriptor, then post ready.
    ///
    /// An oversized payload fails with `FrameTooLarge` and the slot stays
    /// reserved for the next acquire. A slot that is no longer reserved,
    /// because another handle to it was already published, fails with
    /// `OutOfStep`.
    pub fn publish<W: Write>(
        &mut self,
        slot: Slot,
        data: &[u8],
        pts: i64,
        writer: &mut MetadataWriter<W>,
    ) -> Result<FrameDescriptor> {
        if self.reserved != Some(slot.sequence) {
            return Err(TransportError::OutOfStep(format!(
                "slot {} of {} is not reserved",
                slot.sequence,
                self.ring.name()
            )));
        }
        if data.len() > slot.capacity {
            return Err(TransportError::FrameTooLarge {
                size: data.len(),
                capacity: slot.capacity,
            });
        }

        self.ring.write(slot.offset, data)?;
        self.reserved = None;
        self.ring.control().advance_write();

        let descriptor = FrameDescriptor::new(self.kind, data.len() as u32, pts, slot.offset);
        writer.write_frame(&descriptor)?;
        self.sync.ready.post().map_err(shm_err)?;

        self.stats.record_send(data.len());
        trace!(
            kind = %self.kind,
            sequence = slot.sequence,
            size = data.len(),
            pts,
            "frame published"
        );
        Ok(descriptor)
    }

    /// Acquire a slot and publish `data` into it
    pub fn send<W: Write>(
        &mut self,
        data: &[u8],
        pts: i64,
        writer: &mut MetadataWriter<W>,
    ) -> Result<FrameDescriptor> {
        if data.len() > self.ring.slot_capacity() {
            return Err(TransportError::FrameTooLarge {
                size: data.len(),
                capacity: self.ring.slot_capacity(),
            });
        }
        let slot = self.acquire_slot()?;
        self.publish(slot, data, pts, writer)
    }

    /// Raise the advisory end-of-stream flag in the control block
    pub fn mark_end_of_stream(&self) {
        self.ring.control().set_end_of_stream();
    }

    /// Wait until the consumer has released every published slot.
    ///
    /// Returns `false` if the wait timed out or the consumer went away with
    /// slots still in flight. The channel cannot publish afterwards.
    pub fn drain(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let slot_count = self.ring.layout().slot_count;
        let control = self.ring.control();

        // A consumer that has not attached yet still needs the segment to exist
        while control.consumer_pid() == 0 && !control.is_consumer_detached() {
            if Instant::now() >= deadline {
                warn!("No consumer attached to {} before teardown", self.ring.name());
                return Ok(false);
            }
            std::thread::sleep(self.wait.poll_interval);
        }

        let policy = WaitPolicy {
            timeout: Some(deadline.saturating_duration_since(Instant::now())),
            poll_interval: self.wait.poll_interval,
        };

        // A reserved slot already holds its free post
        let mut reclaimed = u32::from(self.reserved.take().is_some());
        while reclaimed < slot_count {
            let outcome = policy.wait(&self.sync.free, "slot release", || {
                let consumer = control.consumer_pid();
                Ok(control.is_consumer_detached()
                    || (consumer != 0 && !PlatformUtils::process_alive(consumer)))
            });

            match outcome {
                Ok(WaitOutcome::Acquired) => reclaimed += 1,
                Ok(WaitOutcome::Abandoned) => {
                    debug!(
                        "Consumer left {} with {} slots in flight",
                        self.ring.name(),
                        slot_count - reclaimed
                    );
                    return Ok(false);
                }
                Err(TransportError::Timeout { .. }) => {
                    self.stats.record_timeout();
                    warn!(
                        "Drain of {} timed out with {} slots in flight",
                        self.ring.name(),
                        slot_count - reclaimed
                    );
                    return Ok(false);
                }
                Err(err) => return Err(err),
            }
        }

        debug!("Drained {}", self.ring.name());
        Ok(true)
    }
}

/// Consumer end of one stream
#[derive(Debug)]
pub struct ConsumerChannel<S: CountingSemaphore> {
    kind: StreamKind,
    sync: Synchronizer<S>,
    ring: SlotRing,
    next_sequence: u64,
    // Set once a descriptor is abandoned without its ready post
    out_of_step: bool,
    wait: WaitPolicy,
    stats: Arc<ChannelStats>,
}

impl<S: CountingSemaphore> ConsumerChannel<S> {
    /// Open the peer's segment and semaphores and register as its consumer
    #[instrument(level = "debug", skip_all, fields(segment = %stream.names.segment))]
    pub fn open<P>(
        provider: &P,
        stream: &StreamDescriptor,
        addressing: Addressing,
        config: &TransportConfig,
    ) -> Result<Self>
    where
        P: SemaphoreProvider<Semaphore = S>,
    {
        let ring = SlotRing::open(&stream.names.segment, segment_layout(stream), addressing)
            .map_err(shm_err)?;
        let sync = Synchronizer::open(
            provider,
            &stream.names.free_semaphore,
            &stream.names.ready_semaphore,
        )
        .map_err(shm_err)?;

        ring.control().attach_consumer(PlatformUtils::get_process_id());
        info!("Opened {} channel {}", stream.kind(), stream.names.segment);

        Ok(Self {
            kind: stream.kind(),
            sync,
            ring,
            next_sequence: 0,
            out_of_step: false,
            wait: WaitPolicy::from_config(config),
            stats: Arc::new(ChannelStats::new()),
        })
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn stats(&self) -> &Arc<ChannelStats> {
        &self.stats
    }

    pub fn control(&self) -> &ControlBlock {
        self.ring.control()
    }

    /// Whether an earlier wait gave up on its descriptor
    pub fn is_out_of_step(&self) -> bool {
        self.out_of_step
    }

    /// Wait for the slot announced by `descriptor` and validate its location.
    ///
    /// A location outside the slot area releases the slot and fails with
    /// `OutOfBounds`; nothing is read. A wait that fails without taking the
    /// ready post leaves that post unmatched, so every later call fails with
    /// `OutOfStep`.
    pub fn acquire_ready(&mut self, descriptor: &FrameDescriptor) -> Result<ReadySlot> {
        if self.out_of_step {
            return Err(TransportError::OutOfStep(format!(
                "{} gave up on frame {} before it was posted",
                self.ring.name(),
                self.next_sequence
            )));
        }

        let control = self.ring.control();
        let outcome = self.wait.wait(&self.sync.ready, "a ready slot", || {
            if control.is_end_of_stream() {
                return Err(TransportError::EndOfStream);
            }
            let producer = control.producer_pid();
            if !PlatformUtils::process_alive(producer) {
                return Err(TransportError::PeerGone(format!("producer {} exited", producer)));
            }
            Ok(false)
        });

        if let Err(err) = outcome {
            // The producer may have posted just before raising the flag or exiting
            let posted_late = matches!(err, TransportError::EndOfStream | TransportError::PeerGone(_))
                && self.sync.ready.try_wait().map_err(shm_err)?;
            if !posted_late {
                if matches!(err, TransportError::Timeout { .. }) {
                    self.stats.record_timeout();
                }
                self.out_of_step = true;
                return Err(err);
            }
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let offset = self.ring.locate(sequence, descriptor.offset);

        let slot = ReadySlot {
            kind: self.kind,
            sequence,
            offset,
            size: descriptor.size,
            pts: descriptor.pts,
        };

        if let Err(err) = self.ring.layout().checked_range(offset, u64::from(descriptor.size)) {
            self.release(slot)?;
            self.stats.record_skipped();
            return Err(err);
        }

        Ok(slot)
    }

    /// Copy the payload out of shared memory
    pub fn read(&self, slot: &ReadySlot) -> Result<Bytes> {
        self.ring.read(slot.offset, u64::from(slot.size))
    }

    /// Hand the slot back to the producer
    pub fn release(&mut self, slot: ReadySlot) -> Result<()> {
        self.ring.control().advance_read();
        self.sync.free.post().map_err(shm_err)?;
        trace!(kind = %self.kind, sequence = slot.sequence, "slot released");
        Ok(())
    }

    /// Wait, copy and release in one step
    pub fn receive(&mut self, descriptor: &FrameDescriptor) -> Result<Frame> {
        let slot = self.acquire_ready(descriptor)?;
        let data = match self.read(&slot) {
            Ok(data) => data,
            Err(err) => {
                self.release(slot)?;
                return Err(err);
            }
        };
        let pts = slot.pts;
        self.release(slot)?;

        self.stats.record_receive(data.len());
        Ok(Frame::new(self.kind, pts, data))
    }
}

impl<S: CountingSemaphore> Drop for ConsumerChannel<S> {
    fn drop(&mut self) {
        self.ring.control().detach_consumer();
        debug!("Detached from {}", self.ring.name());
    }
}

/// Remove the segment and named semaphores a crashed session left behind.
///
/// Returns whether anything was removed.
pub fn remove_stale(names: &StreamNames) -> Result<bool> {
    let segment = SharedMemoryRegion::remove_stale(&names.segment).map_err(shm_err)?;
    let free = NamedSemaphore::remove_stale(&names.free_semaphore).map_err(shm_err)?;
    let ready = NamedSemaphore::remove_stale(&names.ready_semaphore).map_err(shm_err)?;
    Ok(segment || free || ready)
}
