//! Fixed-slot ring inside one segment

use bytes::Bytes;
use shmframe_core::{Addressing, Result as TransportResult};
use tracing::debug;

use crate::control::{ControlBlock, SegmentLayout};
use crate::error::Result;
use crate::region::SharedMemoryRegion;

/// N equally sized slots behind a control block.
///
/// The ring holds no cursor of its own; callers pass the running frame
/// sequence and the addressing mode decides how a payload is located.
#[derive(Debug)]
pub struct SlotRing {
    region: SharedMemoryRegion,
    layout: SegmentLayout,
    addressing: Addressing,
}

impl SlotRing {
    /// Create the segment and initialize its control block
    pub fn create(name: &str, layout: SegmentLayout, addressing: Addressing) -> Result<Self> {
        let region = SharedMemoryRegion::create(name, layout.segment_size())?;
        let ring = Self {
            region,
            layout,
            addressing,
        };
        ring.control().initialize(layout, std::process::id());
        debug!(
            "Ring {} ready: {} slots of {} bytes",
            name, layout.slot_count, layout.slot_size
        );
        Ok(ring)
    }

    /// Open a segment created by the peer and check its control block
    pub fn open(name: &str, layout: SegmentLayout, addressing: Addressing) -> Result<Self> {
        let region = SharedMemoryRegion::open(name, layout.segment_size())?;
        let ring = Self {
            region,
            layout,
            addressing,
        };
        ring.control().validate(name, layout)?;
        Ok(ring)
    }

    pub fn control(&self) -> &ControlBlock {
        // SAFETY: the mapping is page aligned and at least segment_size()
        // bytes, which covers the 64-byte control block; all of its fields
        // are atomics, so shared access from both processes is sound
        unsafe { &*(self.region.as_ptr() as *const ControlBlock) }
    }

    pub fn layout(&self) -> SegmentLayout {
        self.layout
    }

    pub fn addressing(&self) -> Addressing {
        self.addressing
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn slot_capacity(&self) -> usize {
        self.layout.slot_size as usize
    }

    /// Offset of the slot for the `sequence`-th frame
    pub fn slot_offset(&self, sequence: u64) -> u64 {
        self.layout.slot_offset(sequence)
    }

    /// Where the consumer finds a payload: its own sequence in slot-index
    /// mode, the producer's announced offset in offset mode
    pub fn locate(&self, sequence: u64, announced_offset: u64) -> u64 {
        match self.addressing {
            Addressing::SlotIndex => self.slot_offset(sequence),
            Addressing::Offset => announced_offset,
        }
    }

    /// Copy `data` into the slot starting at `offset`
    pub fn write(&self, offset: u64, data: &[u8]) -> TransportResult<()> {
        let range = self.layout.checked_range(offset, data.len() as u64)?;
        // SAFETY: checked_range keeps the range inside the mapping, and the
        // free semaphore grants the producer exclusive use of this slot
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.region.as_ptr().add(range.start),
                range.len(),
            );
        }
        Ok(())
    }

    /// Copy `size` bytes out of the slot area starting at `offset`
    pub fn read(&self, offset: u64, size: u64) -> TransportResult<Bytes> {
        let range = self.layout.checked_range(offset, size)?;
        let mut out = vec![0u8; range.len()];
        // SAFETY: checked_range keeps the range inside the mapping, and the
        // ready semaphore grants the consumer exclusive use of this slot
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.region.as_ptr().add(range.start),
                out.as_mut_ptr(),
                range.len(),
            );
        }
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shmframe_core::TransportError;

    fn unique_name() -> String {
        format!("/sfg{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
    }

    #[test]
    fn test_ring_write_then_read_across_handles() {
        let name = unique_name();
        let layout = SegmentLayout::new(3, 16);
        let producer = SlotRing::create(&name, layout, Addressing::Offset).unwrap();
        let consumer = SlotRing::open(&name, layout, Addressing::Offset).unwrap();

        let offset = producer.slot_offset(4);
        producer.write(offset, b"hello").unwrap();
        assert_eq!(&consumer.read(offset, 5).unwrap()[..], b"hello");
        assert_eq!(consumer.control().producer_pid(), std::process::id());
    }

    #[test]
    fn test_locate_by_addressing() {
        let name = unique_name();
        let layout = SegmentLayout::new(3, 16);
        let ring = SlotRing::create(&name, layout, Addressing::SlotIndex).unwrap();
        assert_eq!(ring.locate(4, 9999), 64 + 16);

        let name = unique_name();
        let ring = SlotRing::create(&name, layout, Addressing::Offset).unwrap();
        assert_eq!(ring.locate(4, 96), 96);
    }

    #[test]
    fn test_open_rejects_other_layout() {
        let name = unique_name();
        let _producer = SlotRing::create(&name, SegmentLayout::new(3, 16), Addressing::Offset).unwrap();
        assert!(SlotRing::open(&name, SegmentLayout::new(2, 16), Addressing::Offset).is_err());
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let name = unique_name();
        let ring = SlotRing::create(&name, SegmentLayout::new(2, 16), Addressing::Offset).unwrap();
        assert!(matches!(ring.read(90, 16), Err(TransportError::OutOfBounds { .. })));
        assert!(matches!(ring.write(0, b"x"), Err(TransportError::OutOfBounds { .. })));
    }
}
