//! shmframe loopback demo
//!
//! Runs a producer and a consumer in one process, connected by a Unix
//! socket pair and real shared memory, and streams a few seconds of
//! synthetic video and audio between them.
//!
//! Usage: `shmframe-loopback [config.json]`. Logging follows `RUST_LOG`.

use std::os::unix::net::UnixStream;
use std::thread;

use anyhow::{Context, Result};
use shmframe::prelude::*;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const SECONDS: i64 = 2;
const FPS: u32 = 25;

/// Synthetic upstream: a moving gradient plus audio chunks whose sizes do
/// not line up with the transport's frame size
struct TestPattern {
    video: VideoFormat,
    audio: AudioFormat,
    tick: i64,
    ticks: i64,
    pending_audio: bool,
}

impl TestPattern {
    fn new(video: VideoFormat, audio: AudioFormat, seconds: i64) -> Self {
        Self {
            video,
            audio,
            tick: 0,
            ticks: seconds * i64::from(video.frame_rate.num) / i64::from(video.frame_rate.den.max(1)),
            pending_audio: false,
        }
    }

    fn picture(&self) -> shmframe::core::Result<Vec<u8>> {
        let size = self.video.frame_size()?;
        let shift = self.tick as usize;
        Ok((0..size).map(|i| ((i + shift) % 251) as u8).collect())
    }

    fn audio_chunk(&self) -> Vec<u8> {
        // One video tick of audio, split unevenly to exercise repacketization
        let bytes_per_tick = self.audio.sample_rate as usize / FPS as usize
            * self.audio.channels as usize
            * self.audio.sample_format.bytes_per_sample();
        let jitter = (self.tick as usize * 37) % 64;
        vec![(self.tick % 256) as u8; bytes_per_tick + jitter]
    }
}

impl FrameSource for TestPattern {
    fn next_unit(&mut self) -> shmframe::core::Result<Option<MediaUnit>> {
        if self.tick >= self.ticks {
            return Ok(None);
        }

        if self.pending_audio {
            self.pending_audio = false;
            let chunk = self.audio_chunk();
            self.tick += 1;
            return Ok(Some(MediaUnit::new(StreamKind::Audio, self.tick, chunk)));
        }

        self.pending_audio = true;
        let picture = self.picture()?;
        Ok(Some(MediaUnit::new(StreamKind::Video, self.tick, picture)))
    }
}

/// Counts what arrives
#[derive(Default)]
struct Tally {
    video: u64,
    audio: u64,
    bytes: u64,
    ended: bool,
}

impl FrameSink for Tally {
    fn on_frame(&mut self, frame: Frame) -> shmframe::core::Result<()> {
        match frame.kind {
            StreamKind::Video => self.video += 1,
            StreamKind::Audio => self.audio += 1,
        }
        self.bytes += frame.len() as u64;
        Ok(())
    }

    fn on_end_of_stream(&mut self) -> shmframe::core::Result<()> {
        self.ended = true;
        Ok(())
    }
}

fn load_config() -> Result<TransportConfig> {
    match std::env::args().nth(1) {
        Some(path) => TransportConfig::from_file(&path)
            .with_context(|| format!("loading configuration from {}", path)),
        None => Ok(TransportConfig::default()),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;
    let video = VideoFormat::new(160, 90, PixelFormat::Yuv420p, Rational::new(FPS, 1));
    let audio = AudioFormat::with_default_cadence(48_000, 2, SampleFormat::S16);

    info!("shmframe loopback: {}x{} video, {} Hz audio", video.width, video.height, audio.sample_rate);

    let (producer_end, consumer_end) = UnixStream::pair().context("creating metadata socket pair")?;

    let producer_config = config.clone();
    let producer = thread::spawn(move || -> shmframe::core::Result<SessionSummary> {
        let session = ProducerSession::create(
            producer_end,
            &NamedSemaphores,
            &[StreamFormat::Video(video), StreamFormat::Audio(audio)],
            &producer_config,
        )?;
        let mut source = TestPattern::new(video, audio, SECONDS);
        session.run(&mut source)
    });

    let consumer = ConsumerSession::open(consumer_end, &NamedSemaphores, &config)
        .context("joining producer session")?;
    let mut tally = Tally::default();
    let received = consumer.run(&mut tally);

    let sent = match producer.join() {
        Ok(result) => result.context("producer failed")?,
        Err(_) => anyhow::bail!("producer thread panicked"),
    };
    let received = received.context("consumer failed")?;

    if !tally.ended {
        error!("Consumer stopped without seeing end of stream");
    }

    info!(
        "Received {} video and {} audio frames ({} bytes)",
        tally.video, tally.audio, tally.bytes
    );
    info!("Producer: {:?}", sent);
    info!("Consumer: {:?}", received);

    Ok(())
}
