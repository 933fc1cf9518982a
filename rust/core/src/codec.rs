//! Fixed-layout binary codec for the metadata channel
//!
//! Every record has a fixed size and every integer is little-endian, so a
//! reader never has to guess where a record ends:
//!
//! Session descriptor (488 bytes):
//! ```text
//! 0-3:     Magic "SHMF" (u32)
//! 4-7:     Protocol version (u32)
//! 8-15:    Session id (u64)
//! 16-19:   Addressing, 0 = slot index, 1 = offset (u32)
//! 20-23:   Stream count, 1 or 2 (u32)
//! 24-255:  Stream block 0
//! 256-487: Stream block 1 (zeroed when unused)
//! ```
//!
//! Stream block (232 bytes):
//! ```text
//! 0-3:     Kind, 0 = video, 1 = audio (u32)
//! 4-7:     Slot count (u32)
//! 8-11:    Slot size in bytes (u32)
//! 12-15:   Reserved (u32)
//! 16-39:   Six format parameters (u32 each)
//!            video: width, height, pixel format, rate num, rate den, 0
//!            audio: sample rate, channels, bit depth, sample format, samples per frame, 0
//! 40-103:  Segment name (NUL padded)
//! 104-167: Free semaphore name (NUL padded)
//! 168-231: Ready semaphore name (NUL padded)
//! ```
//!
//! Frame descriptor (24 bytes):
//! ```text
//! 0-3:   Kind, 0 = video, 1 = audio, 2 = end of stream (u32)
//! 4-7:   Payload size (u32)
//! 8-15:  Presentation timestamp (i64)
//! 16-23: Payload offset inside the segment (u64)
//! ```

use std::io::{ErrorKind, Read, Write};

use bytes::{Buf, BufMut, BytesMut};
use tracing::trace;

use crate::descriptor::{
    Addressing, FrameDescriptor, FrameKind, SessionDescriptor, SessionId, StreamDescriptor,
    StreamNames,
};
use crate::format::{
    AudioFormat, PixelFormat, Rational, SampleFormat, StreamFormat, StreamKind, VideoFormat,
};
use crate::{Result, MAX_STREAMS, NAME_FIELD_LEN, PROTOCOL_VERSION};

/// Session descriptor magic ("SHMF" in memory order)
pub const SESSION_MAGIC: u32 = 0x464D_4853;

/// Size of one encoded stream block
pub const STREAM_BLOCK_SIZE: usize = 16 + 6 * 4 + 3 * NAME_FIELD_LEN;

/// Size of an encoded session descriptor
pub const SESSION_RECORD_SIZE: usize = 24 + MAX_STREAMS * STREAM_BLOCK_SIZE;

/// Size of an encoded frame descriptor
pub const FRAME_RECORD_SIZE: usize = 24;

/// Metadata channel errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Metadata channel closed")]
    Closed,

    #[error("Truncated record: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Invalid magic number: 0x{0:08x}")]
    InvalidMagic(u32),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid stream count: {0}")]
    InvalidStreamCount(u32),

    #[error("Unknown addressing mode: {0}")]
    UnknownAddressing(u32),

    #[error("Unknown stream kind: {0}")]
    UnknownStreamKind(u32),

    #[error("Duplicate {0} stream")]
    DuplicateStream(StreamKind),

    #[error("Unknown frame kind: {0}")]
    UnknownFrameKind(u32),

    #[error("Unknown pixel format: {0}")]
    UnknownPixelFormat(u32),

    #[error("Unknown sample format: {0}")]
    UnknownSampleFormat(u32),

    #[error("Bit depth {bit_depth} does not match sample format {format:?}")]
    BitDepthMismatch { format: SampleFormat, bit_depth: u32 },

    #[error("Invalid name field")]
    InvalidName,

    #[error("Metadata channel IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode a session descriptor into its fixed-size record
pub fn encode_session(session: &SessionDescriptor) -> Result<BytesMut> {
    session.validate()?;

    let mut buf = BytesMut::with_capacity(SESSION_RECORD_SIZE);
    buf.put_u32_le(SESSION_MAGIC);
    buf.put_u32_le(session.version);
    buf.put_u64_le(session.session_id.as_u64());
    buf.put_u32_le(session.addressing.code());
    buf.put_u32_le(session.streams.len() as u32);

    for stream in &session.streams {
        put_stream_block(&mut buf, stream);
    }
    buf.put_bytes(0, SESSION_RECORD_SIZE - buf.len());

    debug_assert_eq!(buf.len(), SESSION_RECORD_SIZE);
    Ok(buf)
}

fn put_stream_block(buf: &mut BytesMut, stream: &StreamDescriptor) {
    buf.put_u32_le(stream.kind().code());
    buf.put_u32_le(stream.slot_count);
    buf.put_u32_le(stream.slot_size);
    buf.put_u32_le(0);

    let params = match stream.format {
        StreamFormat::Video(v) => [
            v.width,
            v.height,
            v.pixel_format.code(),
            v.frame_rate.num,
            v.frame_rate.den,
            0,
        ],
        StreamFormat::Audio(a) => [
            a.sample_rate,
            a.channels,
            a.bit_depth(),
            a.sample_format.code(),
            a.samples_per_frame,
            0,
        ],
    };
    for p in params {
        buf.put_u32_le(p);
    }

    put_name(buf, &stream.names.segment);
    put_name(buf, &stream.names.free_semaphore);
    put_name(buf, &stream.names.ready_semaphore);
}

fn put_name(buf: &mut BytesMut, name: &str) {
    // validate() already bounded the length below the field width
    let bytes = name.as_bytes();
    buf.put_slice(bytes);
    buf.put_bytes(0, NAME_FIELD_LEN - bytes.len());
}

/// Decode a session descriptor record
pub fn decode_session(bytes: &[u8]) -> std::result::Result<SessionDescriptor, ProtocolError> {
    if bytes.len() < SESSION_RECORD_SIZE {
        return Err(ProtocolError::Truncated {
            expected: SESSION_RECORD_SIZE,
            actual: bytes.len(),
        });
    }

    let mut buf = &bytes[..SESSION_RECORD_SIZE];
    let magic = buf.get_u32_le();
    if magic != SESSION_MAGIC {
        return Err(ProtocolError::InvalidMagic(magic));
    }
    let version = buf.get_u32_le();
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    let session_id = SessionId::from_raw(buf.get_u64_le());
    let addressing_code = buf.get_u32_le();
    let addressing =
        Addressing::from_code(addressing_code).ok_or(ProtocolError::UnknownAddressing(addressing_code))?;
    let stream_count = buf.get_u32_le();
    if stream_count == 0 || stream_count as usize > MAX_STREAMS {
        return Err(ProtocolError::InvalidStreamCount(stream_count));
    }

    let mut streams: Vec<StreamDescriptor> = Vec::with_capacity(stream_count as usize);
    for _ in 0..stream_count {
        let stream = get_stream_block(&mut buf)?;
        if streams.iter().any(|s| s.kind() == stream.kind()) {
            return Err(ProtocolError::DuplicateStream(stream.kind()));
        }
        streams.push(stream);
    }

    Ok(SessionDescriptor {
        version,
        session_id,
        addressing,
        streams,
    })
}

fn get_stream_block(buf: &mut &[u8]) -> std::result::Result<StreamDescriptor, ProtocolError> {
    let kind_code = buf.get_u32_le();
    let kind = StreamKind::from_code(kind_code).ok_or(ProtocolError::UnknownStreamKind(kind_code))?;
    let slot_count = buf.get_u32_le();
    let slot_size = buf.get_u32_le();
    let _reserved = buf.get_u32_le();

    let mut p = [0u32; 6];
    for v in p.iter_mut() {
        *v = buf.get_u32_le();
    }

    let format = match kind {
        StreamKind::Video => {
            let pixel_format = PixelFormat::from_code(p[2]).ok_or(ProtocolError::UnknownPixelFormat(p[2]))?;
            StreamFormat::Video(VideoFormat::new(p[0], p[1], pixel_format, Rational::new(p[3], p[4])))
        }
        StreamKind::Audio => {
            let sample_format =
                SampleFormat::from_code(p[3]).ok_or(ProtocolError::UnknownSampleFormat(p[3]))?;
            if sample_format.bit_depth() != p[2] {
                return Err(ProtocolError::BitDepthMismatch {
                    format: sample_format,
                    bit_depth: p[2],
                });
            }
            StreamFormat::Audio(AudioFormat::new(p[0], p[1], sample_format, p[4]))
        }
    };

    let names = StreamNames {
        segment: get_name(buf)?,
        free_semaphore: get_name(buf)?,
        ready_semaphore: get_name(buf)?,
    };

    Ok(StreamDescriptor {
        format,
        slot_count,
        slot_size,
        names,
    })
}

fn get_name(buf: &mut &[u8]) -> std::result::Result<String, ProtocolError> {
    let field = &buf[..NAME_FIELD_LEN];
    let len = field.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD_LEN);
    let name = std::str::from_utf8(&field[..len])
        .map_err(|_| ProtocolError::InvalidName)?
        .to_string();
    buf.advance(NAME_FIELD_LEN);
    Ok(name)
}

/// Encode a frame descriptor
pub fn encode_frame(frame: &FrameDescriptor) -> [u8; FRAME_RECORD_SIZE] {
    let mut out = [0u8; FRAME_RECORD_SIZE];
    let mut buf = &mut out[..];
    buf.put_u32_le(frame.kind.code());
    buf.put_u32_le(frame.size);
    buf.put_i64_le(frame.pts);
    buf.put_u64_le(frame.offset);
    out
}

/// Decode a frame descriptor record
pub fn decode_frame(bytes: &[u8]) -> std::result::Result<FrameDescriptor, ProtocolError> {
    if bytes.len() < FRAME_RECORD_SIZE {
        return Err(ProtocolError::Truncated {
            expected: FRAME_RECORD_SIZE,
            actual: bytes.len(),
        });
    }

    let mut buf = &bytes[..FRAME_RECORD_SIZE];
    let kind_code = buf.get_u32_le();
    let kind = FrameKind::from_code(kind_code).ok_or(ProtocolError::UnknownFrameKind(kind_code))?;

    Ok(FrameDescriptor {
        kind,
        size: buf.get_u32_le(),
        pts: buf.get_i64_le(),
        offset: buf.get_u64_le(),
    })
}

/// Producer end of the metadata channel
pub struct MetadataWriter<W: Write> {
    inner: W,
    frames_written: u64,
}

impl<W: Write> MetadataWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            frames_written: 0,
        }
    }

    /// Write the session descriptor and flush it
    pub fn write_session(&mut self, session: &SessionDescriptor) -> Result<()> {
        let record = encode_session(session)?;
        self.inner.write_all(&record)?;
        self.inner.flush()?;
        Ok(())
    }

    /// Write one frame descriptor and flush it
    pub fn write_frame(&mut self, frame: &FrameDescriptor) -> Result<()> {
        self.inner.write_all(&encode_frame(frame))?;
        self.inner.flush()?;
        self.frames_written += 1;
        trace!(kind = ?frame.kind, size = frame.size, pts = frame.pts, "frame descriptor written");
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Consumer end of the metadata channel
pub struct MetadataReader<R: Read> {
    inner: R,
}

impl<R: Read> MetadataReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read and decode the session descriptor
    pub fn read_session(&mut self) -> std::result::Result<SessionDescriptor, ProtocolError> {
        let mut record = [0u8; SESSION_RECORD_SIZE];
        self.read_record(&mut record)?;
        decode_session(&record)
    }

    /// Read and decode the next frame descriptor
    pub fn read_frame(&mut self) -> std::result::Result<FrameDescriptor, ProtocolError> {
        let mut record = [0u8; FRAME_RECORD_SIZE];
        self.read_record(&mut record)?;
        decode_frame(&record)
    }

    /// Fill `record` completely or fail; a short record is never resumed.
    fn read_record(&mut self, record: &mut [u8]) -> std::result::Result<(), ProtocolError> {
        let mut filled = 0;
        while filled < record.len() {
            match self.inner.read(&mut record[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(ProtocolError::Io(e)),
            }
        }

        match filled {
            0 => Err(ProtocolError::Closed),
            n if n < record.len() => Err(ProtocolError::Truncated {
                expected: record.len(),
                actual: n,
            }),
            _ => Ok(()),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}
