//! Sessions: one metadata channel routing to one or two streams
//!
//! The producer writes a single session descriptor, then frame descriptors
//! for both streams interleaved in publish order, then one end-of-stream
//! descriptor. The consumer dispatches each descriptor on its kind to the
//! matching channel.

use std::io::{Read, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shmframe_core::{
    ErrorCategory, Frame, FrameDescriptor, FramePacker, FrameSink, FrameSource, MediaUnit,
    MetadataReader, MetadataWriter, ProtocolError, PushOutcome, Result, SessionDescriptor,
    SessionId, StatsSnapshot, StreamDescriptor, StreamFormat, StreamKind, StreamNames,
    TransportConfig, TransportError,
};
use tracing::{debug, info, instrument, warn};

use crate::channel::{ConsumerChannel, ProducerChannel};
use crate::semaphore::SemaphoreProvider;

/// Per-stream counters at the end of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub video: Option<StatsSnapshot>,
    pub audio: Option<StatsSnapshot>,
}

fn route<'a, C>(video: &'a mut Option<C>, audio: &'a mut Option<C>, kind: StreamKind) -> Option<&'a mut C> {
    match kind {
        StreamKind::Video => video.as_mut(),
        StreamKind::Audio => audio.as_mut(),
    }
}

fn missing_stream(kind: StreamKind) -> TransportError {
    TransportError::Configuration(format!("session carries no {} stream", kind))
}

/// Producer side of a session
pub struct ProducerSession<W: Write, P: SemaphoreProvider> {
    writer: MetadataWriter<W>,
    descriptor: SessionDescriptor,
    video: Option<ProducerChannel<P::Semaphore>>,
    audio: Option<ProducerChannel<P::Semaphore>>,
    packer: Option<FramePacker>,
    drain_timeout: Duration,
    finished: bool,
}

impl<W: Write, P: SemaphoreProvider> ProducerSession<W, P> {
    /// Start a session under a freshly generated id
    pub fn create(writer: W, provider: &P, formats: &[StreamFormat], config: &TransportConfig) -> Result<Self> {
        Self::create_with_id(SessionId::generate(), writer, provider, formats, config)
    }

    /// Create every stream's segment and semaphores, then announce the
    /// session on the metadata channel.
    ///
    /// On failure, whatever was already created is torn down in reverse
    /// order and nothing is written.
    #[instrument(level = "info", skip(writer, provider, config))]
    pub fn create_with_id(
        session_id: SessionId,
        writer: W,
        provider: &P,
        formats: &[StreamFormat],
        config: &TransportConfig,
    ) -> Result<Self> {
        config.validate()?;

        let streams = formats
            .iter()
            .map(|format| {
                let frame_size = format.frame_size()?;
                let slot_size = u32::try_from(frame_size).map_err(|_| {
                    TransportError::Configuration(format!("{} byte frames do not fit a slot", frame_size))
                })?;
                Ok(StreamDescriptor {
                    format: *format,
                    slot_count: config.slot_count,
                    slot_size,
                    names: StreamNames::derive(&config.name_prefix, session_id, format.kind()),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let descriptor = SessionDescriptor::new(session_id, config.addressing, streams);
        descriptor.validate()?;

        let mut created: Vec<ProducerChannel<P::Semaphore>> = Vec::with_capacity(descriptor.streams.len());
        for stream in &descriptor.streams {
            match ProducerChannel::create(provider, stream, descriptor.addressing, config) {
                Ok(channel) => created.push(channel),
                Err(err) => {
                    warn!("Session {} setup failed on {} stream: {}", session_id, stream.kind(), err);
                    while let Some(channel) = created.pop() {
                        drop(channel);
                    }
                    return Err(err);
                }
            }
        }

        let mut video = None;
        let mut audio = None;
        for channel in created {
            match channel.kind() {
                StreamKind::Video => video = Some(channel),
                StreamKind::Audio => audio = Some(channel),
            }
        }

        let packer = match descriptor.stream(StreamKind::Audio).map(|s| s.format) {
            Some(StreamFormat::Audio(format)) => {
                Some(FramePacker::for_audio(&format, config.packer_capacity_frames)?)
            }
            _ => None,
        };

        let mut writer = MetadataWriter::new(writer);
        writer.write_session(&descriptor)?;

        info!(
            "Session {} started with {} stream(s), {:?} addressing",
            session_id,
            descriptor.streams.len(),
            descriptor.addressing
        );

        Ok(Self {
            writer,
            descriptor,
            video,
            audio,
            packer,
            drain_timeout: config.drain_timeout(),
            finished: false,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.descriptor.session_id
    }

    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    pub fn writer(&self) -> &W {
        self.writer.get_ref()
    }

    /// Publish one frame on the stream of `kind`
    pub fn send(&mut self, kind: StreamKind, data: &[u8], pts: i64) -> Result<FrameDescriptor> {
        let channel = route(&mut self.video, &mut self.audio, kind).ok_or_else(|| missing_stream(kind))?;
        let descriptor = channel.send(data, pts, &mut self.writer)?;
        debug!(kind = %kind, size = data.len(), pts, "frame sent");
        Ok(descriptor)
    }

    /// Feed an arbitrarily sized audio unit through the packer
    pub fn push_audio(&mut self, unit: &[u8]) -> Result<PushOutcome> {
        let (Some(packer), Some(channel)) = (self.packer.as_mut(), self.audio.as_mut()) else {
            return Err(missing_stream(StreamKind::Audio));
        };

        let writer = &mut self.writer;
        let outcome = packer.push(unit, |frame| {
            channel.send(&frame.data, frame.pts, writer)?;
            debug!(kind = %frame.kind, size = frame.len(), pts = frame.pts, "frame sent");
            Ok(())
        })?;

        if outcome == PushOutcome::Dropped {
            channel.stats().record_dropped();
        }
        Ok(outcome)
    }

    /// Route one upstream unit. A video unit larger than its slot is
    /// dropped with a warning and counted; the session continues.
    pub fn submit(&mut self, unit: MediaUnit) -> Result<()> {
        match unit.kind {
            StreamKind::Video => match self.send(StreamKind::Video, &unit.data, unit.pts) {
                Ok(_) => Ok(()),
                Err(err @ TransportError::FrameTooLarge { .. }) => {
                    warn!("Dropping video unit at pts {}: {}", unit.pts, err);
                    if let Some(channel) = self.video.as_ref() {
                        channel.stats().record_dropped();
                    }
                    Ok(())
                }
                Err(err) => Err(err),
            },
            StreamKind::Audio => self.push_audio(&unit.data).map(|_| ()),
        }
    }

    /// Pump `source` dry, then finish the session
    pub fn run<S: FrameSource>(mut self, source: &mut S) -> Result<SessionSummary> {
        while let Some(unit) = source.next_unit()? {
            self.submit(unit)?;
        }
        self.finish()
    }

    pub fn stats(&self, kind: StreamKind) -> Option<StatsSnapshot> {
        match kind {
            StreamKind::Video => self.video.as_ref(),
            StreamKind::Audio => self.audio.as_ref(),
        }
        .map(|channel| channel.stats().snapshot())
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id(),
            video: self.stats(StreamKind::Video),
            audio: self.stats(StreamKind::Audio),
        }
    }

    fn mark_end_of_stream(&self) {
        for channel in [self.video.as_ref(), self.audio.as_ref()].into_iter().flatten() {
            channel.mark_end_of_stream();
        }
    }

    /// Flush the packer, announce end of stream, wait for the consumer to
    /// release its slots and tear everything down.
    pub fn finish(mut self) -> Result<SessionSummary> {
        if let (Some(packer), Some(channel)) = (self.packer.as_mut(), self.audio.as_mut()) {
            let writer = &mut self.writer;
            packer.finish(|frame| channel.send(&frame.data, frame.pts, writer).map(|_| ()))?;
        }

        self.writer.write_frame(&FrameDescriptor::end_of_stream())?;
        self.mark_end_of_stream();

        let drain_timeout = self.drain_timeout;
        for channel in [self.video.as_mut(), self.audio.as_mut()].into_iter().flatten() {
            if !channel.drain(drain_timeout)? {
                warn!("Tearing down {} stream with slots still in flight", channel.kind());
            }
        }

        let summary = self.summary();
        self.finished = true;

        // Reverse creation order
        drop(self.audio.take());
        drop(self.video.take());

        info!("Session {} finished", summary.session_id);
        Ok(summary)
    }
}

impl<W: Write, P: SemaphoreProvider> Drop for ProducerSession<W, P> {
    fn drop(&mut self) {
        if !self.finished {
            // No end-of-stream descriptor was written; the flags keep the
            // consumer from waiting on slots that will never be posted
            self.mark_end_of_stream();
            warn!("Session {} dropped before finishing", self.descriptor.session_id);
        }
    }
}

impl<W: Write, P: SemaphoreProvider> std::fmt::Debug for ProducerSession<W, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerSession")
            .field("session_id", &self.descriptor.session_id)
            .field("video", &self.video.is_some())
            .field("audio", &self.audio.is_some())
            .field("finished", &self.finished)
            .finish()
    }
}

/// Consumer side of a session
pub struct ConsumerSession<R: Read, P: SemaphoreProvider> {
    reader: MetadataReader<R>,
    descriptor: SessionDescriptor,
    video: Option<ConsumerChannel<P::Semaphore>>,
    audio: Option<ConsumerChannel<P::Semaphore>>,
    ended: bool,
}

impl<R: Read, P: SemaphoreProvider> ConsumerSession<R, P> {
    /// Read the session descriptor completely, then open every stream
    #[instrument(level = "info", skip_all)]
    pub fn open(reader: R, provider: &P, config: &TransportConfig) -> Result<Self> {
        let mut reader = MetadataReader::new(reader);
        let descriptor = reader.read_session()?;
        descriptor.validate()?;

        let mut video = None;
        let mut audio = None;
        for stream in &descriptor.streams {
            let channel = ConsumerChannel::open(provider, stream, descriptor.addressing, config)?;
            match stream.kind() {
                StreamKind::Video => video = Some(channel),
                StreamKind::Audio => audio = Some(channel),
            }
        }

        info!(
            "Joined session {} with {} stream(s)",
            descriptor.session_id,
            descriptor.streams.len()
        );

        Ok(Self {
            reader,
            descriptor,
            video,
            audio,
            ended: false,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.descriptor.session_id
    }

    pub fn descriptor(&self) -> &SessionDescriptor {
        &self.descriptor
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    fn end(&mut self) -> Result<Option<Frame>> {
        self.ended = true;
        Ok(None)
    }

    /// Next frame of either stream, `None` once the stream has ended.
    ///
    /// A broken metadata channel counts as end of stream. A frame whose
    /// location fails validation is skipped. Any other receive failure is
    /// returned once and ends the session.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if self.ended {
                return Ok(None);
            }

            let descriptor = match self.reader.read_frame() {
                Ok(descriptor) => descriptor,
                Err(ProtocolError::Closed) => {
                    warn!("Metadata channel closed without end of stream");
                    return self.end();
                }
                Err(err) => {
                    warn!("Ending session on metadata error: {}", err);
                    return self.end();
                }
            };

            let Some(kind) = descriptor.kind.stream_kind() else {
                info!("End of stream for session {}", self.descriptor.session_id);
                return self.end();
            };

            let Some(channel) = route(&mut self.video, &mut self.audio, kind) else {
                warn!("Descriptor for absent {} stream, ending session", kind);
                return self.end();
            };

            match channel.receive(&descriptor) {
                Ok(frame) => {
                    debug!(kind = %kind, size = frame.len(), pts = frame.pts, "frame received");
                    return Ok(Some(frame));
                }
                Err(err) if err.category() == ErrorCategory::Consistency => {
                    warn!("Skipping {} frame: {}", kind, err);
                }
                Err(TransportError::EndOfStream) => {
                    info!("Producer ended {} stream before posting its last frame", kind);
                    return self.end();
                }
                Err(err) => {
                    // The descriptor is consumed but its slot never was
                    warn!("Ending session after {} receive failed: {}", kind, err);
                    self.ended = true;
                    return Err(err);
                }
            }
        }
    }

    /// Deliver every frame to `sink`, then signal end of stream
    pub fn run<K: FrameSink>(mut self, sink: &mut K) -> Result<SessionSummary> {
        while let Some(frame) = self.next_frame()? {
            sink.on_frame(frame)?;
        }
        sink.on_end_of_stream()?;
        Ok(self.summary())
    }

    pub fn stats(&self, kind: StreamKind) -> Option<StatsSnapshot> {
        match kind {
            StreamKind::Video => self.video.as_ref(),
            StreamKind::Audio => self.audio.as_ref(),
        }
        .map(|channel| channel.stats().snapshot())
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id(),
            video: self.stats(StreamKind::Video),
            audio: self.stats(StreamKind::Audio),
        }
    }
}

impl<R: Read, P: SemaphoreProvider> std::fmt::Debug for ConsumerSession<R, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerSession")
            .field("session_id", &self.descriptor.session_id)
            .field("video", &self.video.is_some())
            .field("audio", &self.audio.is_some())
            .field("ended", &self.ended)
            .finish()
    }
}
