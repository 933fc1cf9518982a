//! End-to-end sessions over real shared memory and a Unix socket pair

use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use shmframe_core::{
    encode_session, Addressing, AudioFormat, Frame, MediaUnit, PixelFormat, Rational,
    SampleFormat, SessionDescriptor, SessionId, StreamDescriptor, StreamFormat, StreamKind,
    StreamNames, TransportConfig, TransportError,
};
use shmframe_shared_memory::{
    ConsumerSession, NamedSemaphores, ProducerSession, SharedMemoryError, SharedMemoryRegion,
};

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn test_config() -> TransportConfig {
    TransportConfig {
        wait_timeout_ms: 5_000,
        poll_interval_ms: 2,
        drain_timeout_ms: 2_000,
        ..TransportConfig::default()
    }
}

/// 4x4 gray pictures, 16 bytes per frame
fn small_video() -> StreamFormat {
    StreamFormat::Video(shmframe_core::VideoFormat::new(
        4,
        4,
        PixelFormat::Gray8,
        Rational::new(25, 1),
    ))
}

/// Stereo s16 with 32 samples per frame, 128 bytes per frame
fn small_audio() -> StreamFormat {
    StreamFormat::Audio(AudioFormat::new(48_000, 2, SampleFormat::S16, 32))
}

fn picture(seed: u8) -> Vec<u8> {
    (0..16).map(|i| seed.wrapping_add(i)).collect()
}

#[test]
fn test_video_round_trip() -> TestResult {
    let (producer_end, consumer_end) = UnixStream::pair()?;
    let config = test_config();

    let producer_config = config.clone();
    let producer = thread::spawn(move || -> shmframe_core::Result<_> {
        let mut session =
            ProducerSession::create(producer_end, &NamedSemaphores, &[small_video()], &producer_config)?;
        for i in 0..10u8 {
            session.send(StreamKind::Video, &picture(i), i64::from(i) * 40)?;
        }
        session.finish()
    });

    let mut consumer = ConsumerSession::open(consumer_end, &NamedSemaphores, &config)?;
    let mut frames = Vec::new();
    while let Some(frame) = consumer.next_frame()? {
        frames.push(frame);
    }

    let summary = producer.join().expect("producer thread panicked")?;

    assert_eq!(frames.len(), 10);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.kind, StreamKind::Video);
        assert_eq!(frame.pts, i as i64 * 40);
        assert_eq!(&frame.data[..], &picture(i as u8)[..]);
    }
    assert!(consumer.is_ended());
    assert_eq!(summary.video.map(|s| s.frames_sent), Some(10));
    assert_eq!(consumer.stats(StreamKind::Video).map(|s| s.frames_received), Some(10));
    Ok(())
}

#[test]
fn test_dual_stream_interleaving() -> TestResult {
    let (producer_end, consumer_end) = UnixStream::pair()?;
    let config = test_config();
    let order = [
        StreamKind::Video,
        StreamKind::Audio,
        StreamKind::Video,
        StreamKind::Video,
        StreamKind::Audio,
    ];

    let producer_config = config.clone();
    let producer = thread::spawn(move || -> shmframe_core::Result<_> {
        let mut session = ProducerSession::create(
            producer_end,
            &NamedSemaphores,
            &[small_video(), small_audio()],
            &producer_config,
        )?;
        for (i, kind) in order.iter().enumerate() {
            let data = match kind {
                StreamKind::Video => vec![i as u8; 16],
                StreamKind::Audio => vec![i as u8; 128],
            };
            session.send(*kind, &data, i as i64)?;
        }
        session.finish()
    });

    let mut consumer = ConsumerSession::open(consumer_end, &NamedSemaphores, &config)?;
    let descriptor = consumer.descriptor().clone();
    let video_segment = &descriptor.stream(StreamKind::Video).expect("video stream").names.segment;
    let audio_segment = &descriptor.stream(StreamKind::Audio).expect("audio stream").names.segment;
    assert_ne!(video_segment, audio_segment);

    let mut frames = Vec::new();
    while let Some(frame) = consumer.next_frame()? {
        frames.push(frame);
    }
    producer.join().expect("producer thread panicked")?;

    let kinds: Vec<StreamKind> = frames.iter().map(|f| f.kind).collect();
    assert_eq!(kinds, order);
    for (i, frame) in frames.iter().enumerate() {
        assert_eq!(frame.pts, i as i64);
        assert!(frame.data.iter().all(|&b| b == i as u8));
    }

    assert_eq!(consumer.stats(StreamKind::Video).map(|s| s.frames_received), Some(3));
    assert_eq!(consumer.stats(StreamKind::Audio).map(|s| s.frames_received), Some(2));
    Ok(())
}

#[test]
fn test_slot_index_addressing_wraps_ring() -> TestResult {
    let (producer_end, consumer_end) = UnixStream::pair()?;
    let config = TransportConfig {
        addressing: Addressing::SlotIndex,
        ..test_config()
    };
    // Three full laps of the ring on each stream, plus one
    let per_stream = config.slot_count as usize * 3 + 1;

    let producer_config = config.clone();
    let producer = thread::spawn(move || -> shmframe_core::Result<_> {
        let mut session = ProducerSession::create(
            producer_end,
            &NamedSemaphores,
            &[small_video(), small_audio()],
            &producer_config,
        )?;
        for i in 0..per_stream {
            session.send(StreamKind::Video, &picture(i as u8), i as i64)?;
            session.send(StreamKind::Audio, &vec![i as u8; 128], i as i64)?;
        }
        session.finish()
    });

    let mut consumer = ConsumerSession::open(consumer_end, &NamedSemaphores, &config)?;
    assert_eq!(consumer.descriptor().addressing, Addressing::SlotIndex);

    let mut video = Vec::new();
    let mut audio = Vec::new();
    while let Some(frame) = consumer.next_frame()? {
        match frame.kind {
            StreamKind::Video => video.push(frame),
            StreamKind::Audio => audio.push(frame),
        }
    }
    let summary = producer.join().expect("producer thread panicked")?;

    assert_eq!(video.len(), per_stream);
    assert_eq!(audio.len(), per_stream);
    for (i, frame) in video.iter().enumerate() {
        assert_eq!(frame.pts, i as i64);
        assert_eq!(&frame.data[..], &picture(i as u8)[..]);
    }
    for (i, frame) in audio.iter().enumerate() {
        assert_eq!(frame.pts, i as i64);
        assert!(frame.data.iter().all(|&b| b == i as u8));
    }
    assert_eq!(summary.video.map(|s| s.frames_sent), Some(per_stream as u64));
    assert_eq!(consumer.stats(StreamKind::Audio).map(|s| s.skipped_frames), Some(0));
    Ok(())
}

#[test]
fn test_audio_repacketization_end_to_end() -> TestResult {
    let (producer_end, consumer_end) = UnixStream::pair()?;
    let config = test_config();

    let producer_config = config.clone();
    let producer = thread::spawn(move || -> shmframe_core::Result<_> {
        let session =
            ProducerSession::create(producer_end, &NamedSemaphores, &[small_audio()], &producer_config)?;
        let mut units = [100usize, 50, 300]
            .into_iter()
            .enumerate()
            // Upstream timestamps are ignored for packed audio
            .map(|(i, size)| MediaUnit::new(StreamKind::Audio, 1_000 + i as i64, vec![0x11u8; size]));
        session.run(&mut units)
    });

    let consumer = ConsumerSession::open(consumer_end, &NamedSemaphores, &config)?;
    let mut frames: Vec<Frame> = Vec::new();
    let summary = consumer.run(&mut frames)?;
    producer.join().expect("producer thread panicked")?;

    assert_eq!(frames.len(), 4);
    assert!(frames.iter().all(|f| f.data.len() == 128));
    assert_eq!(frames.iter().map(|f| f.pts).collect::<Vec<_>>(), vec![0, 32, 64, 96]);

    // 450 input bytes leave 66 real bytes in the padded last frame
    assert!(frames[3].data[..66].iter().all(|&b| b == 0x11));
    assert!(frames[3].data[66..].iter().all(|&b| b == 0));
    assert_eq!(summary.audio.map(|s| s.frames_received), Some(4));
    Ok(())
}

#[test]
fn test_end_of_stream_without_frames() -> TestResult {
    let (producer_end, consumer_end) = UnixStream::pair()?;
    let config = test_config();

    let producer_config = config.clone();
    let producer = thread::spawn(move || -> shmframe_core::Result<_> {
        let session =
            ProducerSession::create(producer_end, &NamedSemaphores, &[small_video()], &producer_config)?;
        session.finish()
    });

    let mut consumer = ConsumerSession::open(consumer_end, &NamedSemaphores, &config)?;
    assert!(consumer.next_frame()?.is_none());
    assert!(consumer.next_frame()?.is_none());
    producer.join().expect("producer thread panicked")?;
    Ok(())
}

#[test]
fn test_backpressure_blocks_until_release() -> TestResult {
    let (producer_end, consumer_end) = UnixStream::pair()?;
    let config = TransportConfig {
        slot_count: 2,
        wait_timeout_ms: 0,
        ..test_config()
    };

    let sent = Arc::new(AtomicUsize::new(0));
    let producer_sent = Arc::clone(&sent);
    let producer_config = config.clone();
    let producer = thread::spawn(move || -> shmframe_core::Result<_> {
        let mut session =
            ProducerSession::create(producer_end, &NamedSemaphores, &[small_video()], &producer_config)?;
        for i in 0..3u8 {
            session.send(StreamKind::Video, &picture(i), i64::from(i))?;
            producer_sent.fetch_add(1, Ordering::SeqCst);
        }
        session.finish()
    });

    let mut consumer = ConsumerSession::open(consumer_end, &NamedSemaphores, &config)?;

    // Two slots, nothing released yet: the third send must be waiting
    thread::sleep(Duration::from_millis(150));
    assert_eq!(sent.load(Ordering::SeqCst), 2);

    let first = consumer.next_frame()?.expect("first frame");
    assert_eq!(first.pts, 0);

    let mut rest = Vec::new();
    while let Some(frame) = consumer.next_frame()? {
        rest.push(frame.pts);
    }
    let summary = producer.join().expect("producer thread panicked")?;

    assert_eq!(sent.load(Ordering::SeqCst), 3);
    assert_eq!(rest, vec![1, 2]);
    assert_eq!(summary.video.map(|s| s.frames_sent), Some(3));
    Ok(())
}

#[test]
fn test_setup_failure_unwinds_created_streams() -> TestResult {
    let session_id = SessionId::generate();
    let config = test_config();
    let video_names = StreamNames::derive(&config.name_prefix, session_id, StreamKind::Video);
    let audio_names = StreamNames::derive(&config.name_prefix, session_id, StreamKind::Audio);

    // A crashed session left its audio segment behind
    std::mem::forget(SharedMemoryRegion::create(&audio_names.segment, 64)?);

    let result = ProducerSession::create_with_id(
        session_id,
        Vec::new(),
        &NamedSemaphores,
        &[small_video(), small_audio()],
        &config,
    );
    assert!(matches!(result, Err(TransportError::AlreadyExists(_))));

    // The video stream created before the failure is gone again
    assert!(matches!(
        SharedMemoryRegion::open(&video_names.segment, 1),
        Err(SharedMemoryError::RegionNotFound(_))
    ));

    assert!(shmframe_shared_memory::remove_stale(&audio_names)?);
    let session = ProducerSession::create_with_id(
        session_id,
        Vec::new(),
        &NamedSemaphores,
        &[small_video(), small_audio()],
        &config,
    )?;
    assert_eq!(session.session_id(), session_id);
    Ok(())
}

fn audio_only_descriptor(session_id: SessionId) -> SessionDescriptor {
    SessionDescriptor::new(
        session_id,
        Addressing::Offset,
        vec![StreamDescriptor {
            format: small_audio(),
            slot_count: 3,
            slot_size: 128,
            names: StreamNames::derive("sf", session_id, StreamKind::Audio),
        }],
    )
}

#[test]
fn test_consumer_open_missing_segment() -> TestResult {
    let descriptor = audio_only_descriptor(SessionId::generate());
    let record = encode_session(&descriptor)?.to_vec();

    let result = ConsumerSession::open(std::io::Cursor::new(record), &NamedSemaphores, &test_config());
    assert!(matches!(result, Err(TransportError::NotFound(_))));
    Ok(())
}

#[test]
fn test_consumer_open_undersized_segment() -> TestResult {
    let descriptor = audio_only_descriptor(SessionId::generate());
    let segment = &descriptor.streams[0].names.segment;
    let _region = SharedMemoryRegion::create(segment, 64)?;
    let record = encode_session(&descriptor)?.to_vec();

    let result = ConsumerSession::open(std::io::Cursor::new(record), &NamedSemaphores, &test_config());
    match result {
        Err(TransportError::SizeMismatch { expected, actual, .. }) => {
            assert_eq!(expected, 64 + 3 * 128);
            assert_eq!(actual, 64);
        }
        other => panic!("expected SizeMismatch, got {:?}", other),
    }
    Ok(())
}

#[test]
fn test_consumer_open_garbage_header() -> TestResult {
    let garbage = vec![0xFFu8; 600];
    let result = ConsumerSession::open(std::io::Cursor::new(garbage), &NamedSemaphores, &test_config());
    assert!(matches!(result, Err(TransportError::Protocol(_))));
    Ok(())
}
