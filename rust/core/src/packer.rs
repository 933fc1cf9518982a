//! Repacketization of variable-sized units into fixed-size frames

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::format::{AudioFormat, StreamKind};
use crate::pipeline::Frame;
use crate::{Result, TransportError};

/// What happened to a pushed unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The unit was buffered and `emitted` complete frames were produced
    Accepted { emitted: usize },
    /// The unit would have overflowed the accumulation buffer
    Dropped,
}

/// Accumulates arbitrary units and emits frames of exactly `frame_size`
/// bytes.
///
/// Timestamps are generated here and advance by `pts_step` per emitted
/// frame; upstream timestamps are never used, since units and frames do not
/// line up.
#[derive(Debug)]
pub struct FramePacker {
    kind: StreamKind,
    frame_size: usize,
    capacity: usize,
    buffer: BytesMut,
    next_pts: i64,
    pts_step: i64,
    dropped: u64,
}

impl FramePacker {
    pub fn new(
        kind: StreamKind,
        frame_size: usize,
        capacity_frames: u32,
        pts_step: i64,
    ) -> Result<Self> {
        if frame_size == 0 {
            return Err(TransportError::Configuration(
                "packer frame size must be positive".to_string(),
            ));
        }
        if capacity_frames < 2 {
            return Err(TransportError::Configuration(format!(
                "packer capacity of {} frames is below the minimum of 2",
                capacity_frames
            )));
        }

        let capacity = frame_size
            .checked_mul(capacity_frames as usize)
            .ok_or_else(|| TransportError::Configuration("packer capacity overflows".to_string()))?;

        Ok(Self {
            kind,
            frame_size,
            capacity,
            buffer: BytesMut::with_capacity(capacity),
            next_pts: 0,
            pts_step,
            dropped: 0,
        })
    }

    /// Packer for one audio stream, stepping timestamps by samples per frame
    pub fn for_audio(format: &AudioFormat, capacity_frames: u32) -> Result<Self> {
        Self::new(
            StreamKind::Audio,
            format.frame_size()?,
            capacity_frames,
            i64::from(format.samples_per_frame),
        )
    }

    /// Append one unit and hand every completed frame to `emit`, in order.
    ///
    /// A unit that does not fit the remaining buffer space is dropped whole.
    pub fn push<F>(&mut self, unit: &[u8], mut emit: F) -> Result<PushOutcome>
    where
        F: FnMut(Frame) -> Result<()>,
    {
        let buffered = self.buffer.len();
        if buffered + unit.len() > self.capacity {
            self.dropped += 1;
            warn!(
                size = unit.len(),
                buffered,
                capacity = self.capacity,
                dropped = self.dropped,
                "accumulation buffer full, dropping unit"
            );
            return Ok(PushOutcome::Dropped);
        }

        self.buffer.extend_from_slice(unit);

        let mut emitted = 0;
        while self.buffer.len() >= self.frame_size {
            let data = self.buffer.split_to(self.frame_size).freeze();
            emit(self.take_frame(data))?;
            emitted += 1;
        }

        Ok(PushOutcome::Accepted { emitted })
    }

    /// Zero-pad and emit the residual partial frame, if any.
    ///
    /// Returns whether a frame was emitted.
    pub fn finish<F>(&mut self, mut emit: F) -> Result<bool>
    where
        F: FnMut(Frame) -> Result<()>,
    {
        if self.buffer.is_empty() {
            return Ok(false);
        }

        let residual = self.buffer.len();
        self.buffer.resize(self.frame_size, 0);
        let data = self.buffer.split().freeze();
        debug!(residual, frame_size = self.frame_size, "flushing padded final frame");
        emit(self.take_frame(data))?;
        Ok(true)
    }

    fn take_frame(&mut self, data: bytes::Bytes) -> Frame {
        let frame = Frame::new(self.kind, self.next_pts, data);
        self.next_pts += self.pts_step;
        frame
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Timestamp the next emitted frame will carry
    pub fn next_pts(&self) -> i64 {
        self.next_pts
    }

    /// Units dropped on overflow so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
