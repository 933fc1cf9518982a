//! Session and frame descriptors exchanged over the metadata channel

use serde::{Deserialize, Serialize};

use crate::format::{StreamFormat, StreamKind};
use crate::{Result, TransportError, MAX_NAME_LEN, MAX_STREAMS, PROTOCOL_VERSION};

/// How the consumer locates a frame's payload inside its segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Addressing {
    /// Both sides derive `slot[i % N]` from their own running index
    SlotIndex,
    /// The producer embeds the payload offset in each frame descriptor
    Offset,
}

impl Addressing {
    pub fn code(self) -> u32 {
        match self {
            Addressing::SlotIndex => 0,
            Addressing::Offset => 1,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Addressing::SlotIndex),
            1 => Some(Addressing::Offset),
            _ => None,
        }
    }
}

/// Identifier of one producer session.
///
/// The high half is the producer's process id, the low half a random nonce,
/// so a new session never reuses names left behind by a crashed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Create a fresh id for the current process
    pub fn generate() -> Self {
        let nonce = uuid::Uuid::new_v4().as_u128() as u32;
        Self::from_parts(std::process::id(), nonce)
    }

    pub const fn from_parts(pid: u32, nonce: u32) -> Self {
        Self(((pid as u64) << 32) | nonce as u64)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn pid(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Names of the system objects backing one stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamNames {
    pub segment: String,
    pub free_semaphore: String,
    pub ready_semaphore: String,
}

impl StreamNames {
    /// Derive per-stream names from the session id.
    ///
    /// Names stay under 31 bytes so they are valid semaphore names on every
    /// unix the crate targets.
    pub fn derive(prefix: &str, session: SessionId, kind: StreamKind) -> Self {
        let segment = format!("/{}{}{}", prefix, session, kind.tag());
        Self {
            free_semaphore: format!("{}f", segment),
            ready_semaphore: format!("{}r", segment),
            segment,
        }
    }
}

/// Negotiated layout and format of one carried stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub format: StreamFormat,
    pub slot_count: u32,
    pub slot_size: u32,
    pub names: StreamNames,
}

impl StreamDescriptor {
    pub fn kind(&self) -> StreamKind {
        self.format.kind()
    }
}

/// One-time record that opens a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub version: u32,
    pub session_id: SessionId,
    pub addressing: Addressing,
    pub streams: Vec<StreamDescriptor>,
}

impl SessionDescriptor {
    pub fn new(session_id: SessionId, addressing: Addressing, streams: Vec<StreamDescriptor>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            session_id,
            addressing,
            streams,
        }
    }

    /// Find the stream of a given kind
    pub fn stream(&self, kind: StreamKind) -> Option<&StreamDescriptor> {
        self.streams.iter().find(|s| s.kind() == kind)
    }

    /// Check the invariants both ends rely on
    pub fn validate(&self) -> Result<()> {
        if self.streams.is_empty() || self.streams.len() > MAX_STREAMS {
            return Err(TransportError::Configuration(format!(
                "session must carry 1..={} streams, got {}",
                MAX_STREAMS,
                self.streams.len()
            )));
        }

        for (i, stream) in self.streams.iter().enumerate() {
            if self.streams[..i].iter().any(|s| s.kind() == stream.kind()) {
                return Err(TransportError::Configuration(format!(
                    "duplicate {} stream",
                    stream.kind()
                )));
            }

            stream.format.validate()?;

            if stream.slot_count == 0 {
                return Err(TransportError::Configuration(format!(
                    "{} stream has no slots",
                    stream.kind()
                )));
            }

            let needed = stream.format.frame_size()?;
            if (stream.slot_size as usize) < needed {
                return Err(TransportError::Configuration(format!(
                    "{} slot of {} bytes cannot hold a {} byte frame",
                    stream.kind(),
                    stream.slot_size,
                    needed
                )));
            }

            for name in [
                &stream.names.segment,
                &stream.names.free_semaphore,
                &stream.names.ready_semaphore,
            ] {
                validate_name(name)?;
            }
        }

        Ok(())
    }
}

/// Check a system object name fits the fixed-width wire field
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(TransportError::Configuration(format!(
            "name {:?} must be 1..={} bytes",
            name, MAX_NAME_LEN
        )));
    }
    if name.contains('\0') {
        return Err(TransportError::Configuration(format!(
            "name {:?} contains a null byte",
            name
        )));
    }
    Ok(())
}

/// Tag of a frame descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    Video,
    Audio,
    EndOfStream,
}

impl FrameKind {
    pub fn code(self) -> u32 {
        match self {
            FrameKind::Video => 0,
            FrameKind::Audio => 1,
            FrameKind::EndOfStream => 2,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(FrameKind::Video),
            1 => Some(FrameKind::Audio),
            2 => Some(FrameKind::EndOfStream),
            _ => None,
        }
    }

    /// Stream the frame belongs to, `None` for end-of-stream
    pub fn stream_kind(self) -> Option<StreamKind> {
        match self {
            FrameKind::Video => Some(StreamKind::Video),
            FrameKind::Audio => Some(StreamKind::Audio),
            FrameKind::EndOfStream => None,
        }
    }
}

impl From<StreamKind> for FrameKind {
    fn from(kind: StreamKind) -> Self {
        match kind {
            StreamKind::Video => FrameKind::Video,
            StreamKind::Audio => FrameKind::Audio,
        }
    }
}

/// Per-frame metadata record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDescriptor {
    pub kind: FrameKind,
    /// Payload length in bytes
    pub size: u32,
    /// Presentation timestamp
    pub pts: i64,
    /// Absolute byte offset of the payload inside the stream's segment
    pub offset: u64,
}

impl FrameDescriptor {
    pub fn new(kind: StreamKind, size: u32, pts: i64, offset: u64) -> Self {
        Self {
            kind: kind.into(),
            size,
            pts,
            offset,
        }
    }

    pub fn end_of_stream() -> Self {
        Self {
            kind: FrameKind::EndOfStream,
            size: 0,
            pts: 0,
            offset: 0,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.kind == FrameKind::EndOfStream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{AudioFormat, SampleFormat};

    fn audio_stream(slot_size: u32) -> StreamDescriptor {
        let session = SessionId::from_parts(42, 7);
        StreamDescriptor {
            format: StreamFormat::Audio(AudioFormat::new(48_000, 2, SampleFormat::S16, 32)),
            slot_count: 3,
            slot_size,
            names: StreamNames::derive("sf", session, StreamKind::Audio),
        }
    }

    #[test]
    fn test_session_id_parts() {
        let id = SessionId::from_parts(0x1234, 0xdead_beef);
        assert_eq!(id.pid(), 0x1234);
        assert_eq!(id.to_string(), "00001234deadbeef");
        assert_eq!(SessionId::from_raw(id.as_u64()), id);
        assert_eq!(SessionId::generate().pid(), std::process::id());
    }

    #[test]
    fn test_stream_names_fit_semaphore_limits() {
        let names = StreamNames::derive("sf", SessionId::from_parts(u32::MAX, u32::MAX), StreamKind::Video);
        assert_eq!(names.segment, "/sfffffffffffffffffv");
        assert_eq!(names.free_semaphore, "/sfffffffffffffffffvf");
        assert_eq!(names.ready_semaphore, "/sfffffffffffffffffvr");
        assert!(names.ready_semaphore.len() <= 31);
    }

    #[test]
    fn test_session_validation() {
        let ok = SessionDescriptor::new(SessionId::from_parts(1, 2), Addressing::Offset, vec![audio_stream(128)]);
        assert!(ok.validate().is_ok());
        assert!(ok.stream(StreamKind::Audio).is_some());
        assert!(ok.stream(StreamKind::Video).is_none());

        let small_slot = SessionDescriptor::new(SessionId::from_parts(1, 2), Addressing::Offset, vec![audio_stream(64)]);
        assert!(small_slot.validate().is_err());

        let duplicate = SessionDescriptor::new(
            SessionId::from_parts(1, 2),
            Addressing::Offset,
            vec![audio_stream(128), audio_stream(128)],
        );
        assert!(duplicate.validate().is_err());

        let empty = SessionDescriptor::new(SessionId::from_parts(1, 2), Addressing::Offset, Vec::new());
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_frame_kinds() {
        assert_eq!(FrameKind::from_code(2), Some(FrameKind::EndOfStream));
        assert_eq!(FrameKind::from_code(3), None);
        assert_eq!(FrameKind::Audio.stream_kind(), Some(StreamKind::Audio));
        assert!(FrameDescriptor::end_of_stream().is_end_of_stream());
        assert_eq!(FrameDescriptor::new(StreamKind::Video, 4, 9, 64).kind, FrameKind::Video);
    }
}
