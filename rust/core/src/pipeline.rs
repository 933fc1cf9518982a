//! Seams to the media pipeline on either side of the transport

use bytes::Bytes;

use crate::format::StreamKind;
use crate::Result;

/// One unit pulled from upstream
///
/// Video units map to exactly one frame. Audio units may have any size and
/// are repacketized into fixed frames before transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaUnit {
    pub kind: StreamKind,
    pub pts: i64,
    pub data: Bytes,
}

impl MediaUnit {
    pub fn new(kind: StreamKind, pts: i64, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            pts,
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One frame delivered downstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: StreamKind,
    pub pts: i64,
    pub data: Bytes,
}

impl Frame {
    pub fn new(kind: StreamKind, pts: i64, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            pts,
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Upstream producer of media units
pub trait FrameSource {
    /// Next unit, `None` once upstream is exhausted
    fn next_unit(&mut self) -> Result<Option<MediaUnit>>;
}

/// Downstream consumer of frames
pub trait FrameSink {
    fn on_frame(&mut self, frame: Frame) -> Result<()>;

    /// Called once after the last frame
    fn on_end_of_stream(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<I> FrameSource for I
where
    I: Iterator<Item = MediaUnit>,
{
    fn next_unit(&mut self) -> Result<Option<MediaUnit>> {
        Ok(self.next())
    }
}

impl FrameSink for Vec<Frame> {
    fn on_frame(&mut self, frame: Frame) -> Result<()> {
        self.push(frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iterator_source_and_vec_sink() {
        let mut source = vec![
            MediaUnit::new(StreamKind::Video, 0, vec![1u8; 4]),
            MediaUnit::new(StreamKind::Audio, 0, vec![2u8; 2]),
        ]
        .into_iter();

        let mut sink: Vec<Frame> = Vec::new();
        while let Some(unit) = source.next_unit().unwrap() {
            sink.on_frame(Frame::new(unit.kind, unit.pts, unit.data)).unwrap();
        }
        sink.on_end_of_stream().unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink[1].kind, StreamKind::Audio);
        assert_eq!(sink[0].data.len(), 4);
    }
}
