//! Control block at the head of every segment
//!
//! Memory layout of a segment:
//! ```text
//! 0-63:                       Control block
//! 64-(64 + slot_size):        Slot 0
//! ...
//! (64 + (N-1)*slot_size)-end: Slot N-1
//! ```
//!
//! Every control block field is an atomic. Fields are written by one side
//! and read by the other with release/acquire ordering; the slot payloads
//! themselves are published through the semaphore pair, not through these
//! fields.

use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use shmframe_core::{Result as TransportResult, TransportError};

use crate::error::{Result, SharedMemoryError};

/// Segment magic ("SFSG" in memory order)
pub const SEGMENT_MAGIC: u32 = 0x4753_4653;

/// Segment layout version
pub const SEGMENT_VERSION: u32 = 1;

/// Size of the control block, also the offset of slot 0
pub const CONTROL_BLOCK_SIZE: usize = 64;

/// Shared header of a segment
#[repr(C, align(64))]
#[derive(Debug)]
pub struct ControlBlock {
    magic: AtomicU32,
    version: AtomicU32,
    slot_count: AtomicU32,
    slot_size: AtomicU32,
    /// Frames published by the producer
    write_index: AtomicU64,
    /// Frames released by the consumer
    read_index: AtomicU64,
    producer_pid: AtomicU32,
    consumer_pid: AtomicU32,
    end_of_stream: AtomicU32,
    consumer_detached: AtomicU32,
}

const _: () = assert!(std::mem::size_of::<ControlBlock>() == CONTROL_BLOCK_SIZE);

impl ControlBlock {
    /// Fill in a freshly created block. The magic is stored last so an
    /// opener never sees a half-initialized header as valid.
    pub fn initialize(&self, layout: SegmentLayout, producer_pid: u32) {
        self.version.store(SEGMENT_VERSION, Ordering::Relaxed);
        self.slot_count.store(layout.slot_count, Ordering::Relaxed);
        self.slot_size.store(layout.slot_size, Ordering::Relaxed);
        self.write_index.store(0, Ordering::Relaxed);
        self.read_index.store(0, Ordering::Relaxed);
        self.producer_pid.store(producer_pid, Ordering::Relaxed);
        self.consumer_pid.store(0, Ordering::Relaxed);
        self.end_of_stream.store(0, Ordering::Relaxed);
        self.consumer_detached.store(0, Ordering::Relaxed);
        self.magic.store(SEGMENT_MAGIC, Ordering::Release);
    }

    /// Check the header against the layout announced in the session descriptor
    pub fn validate(&self, name: &str, layout: SegmentLayout) -> Result<()> {
        let mismatch = |detail: String| SharedMemoryError::LayoutMismatch {
            name: name.to_string(),
            detail,
        };

        let magic = self.magic.load(Ordering::Acquire);
        if magic != SEGMENT_MAGIC {
            return Err(mismatch(format!("bad magic 0x{:08x}", magic)));
        }

        let version = self.version.load(Ordering::Relaxed);
        if version != SEGMENT_VERSION {
            return Err(mismatch(format!("unsupported version {}", version)));
        }

        let slot_count = self.slot_count.load(Ordering::Relaxed);
        let slot_size = self.slot_size.load(Ordering::Relaxed);
        if slot_count != layout.slot_count || slot_size != layout.slot_size {
            return Err(mismatch(format!(
                "{} slots of {} bytes, expected {} of {}",
                slot_count, slot_size, layout.slot_count, layout.slot_size
            )));
        }

        Ok(())
    }

    pub fn producer_pid(&self) -> u32 {
        self.producer_pid.load(Ordering::Acquire)
    }

    pub fn consumer_pid(&self) -> u32 {
        self.consumer_pid.load(Ordering::Acquire)
    }

    pub fn attach_consumer(&self, pid: u32) {
        self.consumer_detached.store(0, Ordering::Release);
        self.consumer_pid.store(pid, Ordering::Release);
    }

    pub fn detach_consumer(&self) {
        self.consumer_detached.store(1, Ordering::Release);
    }

    pub fn is_consumer_detached(&self) -> bool {
        self.consumer_detached.load(Ordering::Acquire) != 0
    }

    pub fn set_end_of_stream(&self) {
        self.end_of_stream.store(1, Ordering::Release);
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream.load(Ordering::Acquire) != 0
    }

    pub fn advance_write(&self) -> u64 {
        self.write_index.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn advance_read(&self) -> u64 {
        self.read_index.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn write_index(&self) -> u64 {
        self.write_index.load(Ordering::Acquire)
    }

    pub fn read_index(&self) -> u64 {
        self.read_index.load(Ordering::Acquire)
    }
}

/// Slot geometry of one segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    pub slot_count: u32,
    pub slot_size: u32,
}

impl SegmentLayout {
    pub fn new(slot_count: u32, slot_size: u32) -> Self {
        Self {
            slot_count,
            slot_size,
        }
    }

    /// Total bytes: control block plus every slot
    pub fn segment_size(&self) -> usize {
        CONTROL_BLOCK_SIZE + self.slot_count as usize * self.slot_size as usize
    }

    /// Absolute offset of the slot used for the `sequence`-th frame
    pub fn slot_offset(&self, sequence: u64) -> u64 {
        CONTROL_BLOCK_SIZE as u64 + (sequence % u64::from(self.slot_count)) * u64::from(self.slot_size)
    }

    /// Byte range of the slot area
    pub fn slot_area(&self) -> Range<u64> {
        CONTROL_BLOCK_SIZE as u64..self.segment_size() as u64
    }

    /// Validate a payload location announced by the peer.
    ///
    /// The payload must lie inside the slot area and must not cross from one
    /// slot into the next.
    pub fn checked_range(&self, offset: u64, size: u64) -> TransportResult<Range<usize>> {
        let area = self.slot_area();
        let out_of_bounds = || TransportError::OutOfBounds {
            offset,
            size,
            start: area.start,
            end: area.end,
        };

        let end = offset.checked_add(size).ok_or_else(out_of_bounds)?;
        let slot_size = u64::from(self.slot_size);
        if offset < area.start || end > area.end || size > slot_size {
            return Err(out_of_bounds());
        }
        let within_slot = (offset - area.start)
            .checked_rem(slot_size)
            .ok_or_else(out_of_bounds)?;
        if within_slot + size > slot_size {
            return Err(out_of_bounds());
        }

        Ok(offset as usize..end as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shmframe_core::ErrorCategory;

    #[test]
    fn test_layout_offsets() {
        let layout = SegmentLayout::new(3, 128);
        assert_eq!(layout.segment_size(), 64 + 3 * 128);
        assert_eq!(layout.slot_offset(0), 64);
        assert_eq!(layout.slot_offset(2), 64 + 256);
        assert_eq!(layout.slot_offset(3), 64);
        assert_eq!(layout.slot_offset(7), 64 + 128);
    }

    #[test]
    fn test_checked_range() {
        let layout = SegmentLayout::new(3, 128);
        assert_eq!(layout.checked_range(64, 128).unwrap(), 64..192);
        assert_eq!(layout.checked_range(320, 128).unwrap(), 320..448);

        // Overlaps the control block
        assert!(layout.checked_range(0, 16).is_err());
        // Runs past the end of the segment
        let err = layout.checked_range(400, 128).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Consistency);
        // Larger than a slot
        assert!(layout.checked_range(64, 129).is_err());
        // Arithmetic overflow
        assert!(layout.checked_range(u64::MAX, 2).is_err());

        // Inside one slot but not at its start
        assert_eq!(layout.checked_range(64 + 100, 28).unwrap(), 164..192);
        // Starts in slot 0 and ends in slot 1
        let layout = SegmentLayout::new(3, 16);
        assert!(layout.checked_range(72, 16).is_err());
        assert!(layout.checked_range(79, 2).is_err());
        assert_eq!(layout.checked_range(80, 16).unwrap(), 80..96);

        // No slots at all
        assert!(SegmentLayout::new(0, 0).checked_range(64, 0).is_err());
    }

    #[test]
    fn test_control_block_validation() {
        let block: ControlBlock = unsafe { std::mem::zeroed() };
        let layout = SegmentLayout::new(3, 128);
        assert!(block.validate("/t", layout).is_err());

        block.initialize(layout, 42);
        assert!(block.validate("/t", layout).is_ok());
        assert!(block.validate("/t", SegmentLayout::new(4, 128)).is_err());
        assert_eq!(block.producer_pid(), 42);

        assert!(!block.is_end_of_stream());
        block.set_end_of_stream();
        assert!(block.is_end_of_stream());

        block.attach_consumer(7);
        assert_eq!(block.consumer_pid(), 7);
        block.detach_consumer();
        assert!(block.is_consumer_detached());

        assert_eq!(block.advance_write(), 1);
        assert_eq!(block.advance_read(), 1);
    }
}
