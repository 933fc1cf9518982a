//! Stream kinds and the media format parameters needed to size slots

use serde::{Deserialize, Serialize};

use crate::{Result, TransportError};

/// Kind of media carried by a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum StreamKind {
    Video = 0,
    Audio = 1,
}

impl StreamKind {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(StreamKind::Video),
            1 => Some(StreamKind::Audio),
            _ => None,
        }
    }

    /// Single-letter tag used in segment and semaphore names
    pub fn tag(self) -> char {
        match self {
            StreamKind::Video => 'v',
            StreamKind::Audio => 'a',
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Video => f.write_str("video"),
            StreamKind::Audio => f.write_str("audio"),
        }
    }
}

/// Raw pixel layouts
///
/// Wire codes follow libav's `AVPixelFormat` numbering so a libav-based
/// peer can pass its format value straight through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Yuv420p,
    Rgb24,
    Bgr24,
    Yuv422p,
    Yuv444p,
    Gray8,
    Nv12,
    Argb,
    Rgba,
    Abgr,
    Bgra,
}

impl PixelFormat {
    pub fn code(self) -> u32 {
        match self {
            PixelFormat::Yuv420p => 0,
            PixelFormat::Rgb24 => 2,
            PixelFormat::Bgr24 => 3,
            PixelFormat::Yuv422p => 4,
            PixelFormat::Yuv444p => 5,
            PixelFormat::Gray8 => 8,
            PixelFormat::Nv12 => 23,
            PixelFormat::Argb => 25,
            PixelFormat::Rgba => 26,
            PixelFormat::Abgr => 27,
            PixelFormat::Bgra => 28,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(PixelFormat::Yuv420p),
            2 => Some(PixelFormat::Rgb24),
            3 => Some(PixelFormat::Bgr24),
            4 => Some(PixelFormat::Yuv422p),
            5 => Some(PixelFormat::Yuv444p),
            8 => Some(PixelFormat::Gray8),
            23 => Some(PixelFormat::Nv12),
            25 => Some(PixelFormat::Argb),
            26 => Some(PixelFormat::Rgba),
            27 => Some(PixelFormat::Abgr),
            28 => Some(PixelFormat::Bgra),
            _ => None,
        }
    }

    /// Size in bytes of one tightly packed picture.
    ///
    /// Subsampled chroma planes round odd dimensions up.
    pub fn frame_size(self, width: u32, height: u32) -> Option<usize> {
        let w = width as usize;
        let h = height as usize;
        let luma = w.checked_mul(h)?;
        let half_w = w.div_ceil(2);
        let half_h = h.div_ceil(2);

        match self {
            PixelFormat::Gray8 => Some(luma),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 | PixelFormat::Yuv444p => luma.checked_mul(3),
            PixelFormat::Argb | PixelFormat::Rgba | PixelFormat::Abgr | PixelFormat::Bgra => {
                luma.checked_mul(4)
            }
            PixelFormat::Yuv420p | PixelFormat::Nv12 => {
                luma.checked_add(half_w.checked_mul(half_h)?.checked_mul(2)?)
            }
            PixelFormat::Yuv422p => luma.checked_add(half_w.checked_mul(h)?.checked_mul(2)?),
        }
    }
}

/// Frame rate as a rational number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: u32,
    pub den: u32,
}

impl Rational {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub fn as_f64(self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }
}

/// Video stream parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub frame_rate: Rational,
}

impl VideoFormat {
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat, frame_rate: Rational) -> Self {
        Self {
            width,
            height,
            pixel_format,
            frame_rate,
        }
    }

    pub fn frame_size(&self) -> Result<usize> {
        self.pixel_format
            .frame_size(self.width, self.height)
            .ok_or_else(|| {
                TransportError::Configuration(format!(
                    "picture size {}x{} overflows",
                    self.width, self.height
                ))
            })
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(TransportError::Configuration(format!(
                "invalid video dimensions {}x{}",
                self.width, self.height
            )));
        }
        if self.frame_rate.num == 0 || self.frame_rate.den == 0 {
            return Err(TransportError::Configuration(format!(
                "invalid frame rate {}/{}",
                self.frame_rate.num, self.frame_rate.den
            )));
        }
        self.frame_size().map(|_| ())
    }
}

/// PCM sample encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    F32,
}

impl SampleFormat {
    pub fn code(self) -> u32 {
        match self {
            SampleFormat::U8 => 0,
            SampleFormat::S16 => 1,
            SampleFormat::S32 => 2,
            SampleFormat::F32 => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(SampleFormat::U8),
            1 => Some(SampleFormat::S16),
            2 => Some(SampleFormat::S32),
            3 => Some(SampleFormat::F32),
            _ => None,
        }
    }

    pub fn bit_depth(self) -> u32 {
        match self {
            SampleFormat::U8 => 8,
            SampleFormat::S16 => 16,
            SampleFormat::S32 | SampleFormat::F32 => 32,
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        (self.bit_depth() / 8) as usize
    }
}

/// Audio stream parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u32,
    pub sample_format: SampleFormat,
    /// Samples per channel carried by one slot-sized frame
    pub samples_per_frame: u32,
}

impl AudioFormat {
    pub fn new(
        sample_rate: u32,
        channels: u32,
        sample_format: SampleFormat,
        samples_per_frame: u32,
    ) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format,
            samples_per_frame,
        }
    }

    /// 20ms frames
    pub fn with_default_cadence(sample_rate: u32, channels: u32, sample_format: SampleFormat) -> Self {
        Self::new(sample_rate, channels, sample_format, (sample_rate / 50).max(1))
    }

    pub fn bit_depth(&self) -> u32 {
        self.sample_format.bit_depth()
    }

    pub fn frame_size(&self) -> Result<usize> {
        (self.samples_per_frame as usize)
            .checked_mul(self.channels as usize)
            .and_then(|n| n.checked_mul(self.sample_format.bytes_per_sample()))
            .ok_or_else(|| TransportError::Configuration("audio frame size overflows".to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.channels == 0 || self.samples_per_frame == 0 {
            return Err(TransportError::Configuration(format!(
                "invalid audio format: rate={} channels={} samples_per_frame={}",
                self.sample_rate, self.channels, self.samples_per_frame
            )));
        }
        self.frame_size().map(|_| ())
    }
}

/// Format of one carried stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StreamFormat {
    Video(VideoFormat),
    Audio(AudioFormat),
}

impl StreamFormat {
    pub fn kind(&self) -> StreamKind {
        match self {
            StreamFormat::Video(_) => StreamKind::Video,
            StreamFormat::Audio(_) => StreamKind::Audio,
        }
    }

    /// Bytes needed by one slot of this stream
    pub fn frame_size(&self) -> Result<usize> {
        match self {
            StreamFormat::Video(v) => v.frame_size(),
            StreamFormat::Audio(a) => a.frame_size(),
        }
    }

    /// Timestamp advance per emitted frame
    pub fn pts_step(&self) -> i64 {
        match self {
            StreamFormat::Video(_) => 1,
            StreamFormat::Audio(a) => a.samples_per_frame as i64,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            StreamFormat::Video(v) => v.validate(),
            StreamFormat::Audio(a) => a.validate(),
        }
    }
}
