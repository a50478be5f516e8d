mod capture;
mod live;

pub use capture::{CaptureSink, DecodeEvent};
pub use live::LiveSink;

use crate::error::{AudioError, Result};

/// Smallest buffer count a live sink will run with; requests below this
/// are raised.
pub const MIN_BUFFER_COUNT: usize = 4;

/// Frames per delivery period. The live track's queue holds
/// `buffer_count` periods.
pub const PERIOD_FRAMES: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleFormat {
    /// 16-bit signed little-endian PCM.
    Pcm16,
    /// 8-bit unsigned PCM.
    Pcm8,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::Pcm16 => 2,
            SampleFormat::Pcm8 => 1,
        }
    }
}

/// Advisory output hints; they trade latency against power but never change
/// correctness.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutputFlags {
    pub direct: bool,
    pub deep_buffer: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SinkConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub channel_mask: u32,
    pub format: SampleFormat,
    pub buffer_count: usize,
    pub flags: OutputFlags,
}

impl SinkConfig {
    pub fn new(sample_rate: u32, channels: u16, format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            channel_mask: (1u32 << channels) - 1,
            format,
            buffer_count: MIN_BUFFER_COUNT,
            flags: OutputFlags::default(),
        }
    }

    /// Bytes in one interleaved frame.
    pub fn frame_size(&self) -> usize {
        self.channels as usize * self.format.bytes_per_sample()
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate < 4_000 || self.sample_rate > 192_000 {
            return Err(AudioError::Config(format!(
                "sample rate {} Hz out of range",
                self.sample_rate
            )));
        }
        if self.channels == 0 || self.channels > 8 {
            return Err(AudioError::Config(format!(
                "unsupported channel count {}",
                self.channels
            )));
        }
        if self.channel_mask.count_ones() != u32::from(self.channels) {
            return Err(AudioError::Config(format!(
                "channel mask {:#x} does not describe {} channels",
                self.channel_mask, self.channels
            )));
        }
        Ok(())
    }

    /// Whether a hand-off from a sink opened with `self` can continue into a
    /// sink opened with `other` on the same device track.
    pub fn handoff_compatible(&self, other: &SinkConfig) -> bool {
        self.sample_rate == other.sample_rate
            && self.channels == other.channels
            && self.format == other.format
    }
}

/// Asynchronous write-completion callback, invoked on the device callback
/// thread with the number of frames delivered in that period. The opaque
/// cookie of the wire-level interface is whatever the closure captures.
pub type DeliveryCallback = Box<dyn FnMut(u64) + Send>;

/// Capability contract shared by the live and buffered sink variants.
pub trait AudioSink: Send + Sync {
    /// True once open() has succeeded and no terminal error is recorded.
    fn ready(&self) -> bool;

    /// True for sinks driven by a real-time device.
    fn realtime(&self) -> bool;

    fn open(&self, config: SinkConfig, delivery: Option<DeliveryCallback>) -> Result<()>;

    fn start(&self) -> Result<()>;
    fn pause(&self) -> Result<()>;
    fn flush(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn close(&self) -> Result<()>;

    /// Queue interleaved sample bytes. Returns the bytes accepted, which may
    /// be fewer than offered (backpressure); only whole frames are taken.
    fn write(&self, data: &[u8]) -> Result<usize>;

    /// Frames delivered to the underlying destination so far.
    fn position(&self) -> Result<u64>;

    /// Frames accepted from the writer so far.
    fn frames_written(&self) -> Result<u64>;

    fn latency_ms(&self) -> Result<u32>;
    fn msecs_per_frame(&self) -> Result<f32>;

    fn set_volume(&self, left: f32, right: f32) -> Result<()>;
    fn set_playback_rate_permille(&self, permille: u32) -> Result<()>;
    fn attach_aux_effect(&self, effect_id: i32) -> Result<()>;
    fn set_aux_effect_send_level(&self, level: f32) -> Result<()>;
}

/// A session's sink, one variant at a time.
#[derive(Clone)]
pub enum SinkHandle {
    Live(std::sync::Arc<LiveSink>),
    Capture(std::sync::Arc<CaptureSink>),
}

impl SinkHandle {
    pub fn as_sink(&self) -> &dyn AudioSink {
        match self {
            SinkHandle::Live(s) => s.as_ref(),
            SinkHandle::Capture(s) => s.as_ref(),
        }
    }

    pub fn as_live(&self) -> Option<&std::sync::Arc<LiveSink>> {
        match self {
            SinkHandle::Live(s) => Some(s),
            SinkHandle::Capture(_) => None,
        }
    }

    pub fn as_capture(&self) -> Option<&std::sync::Arc<CaptureSink>> {
        match self {
            SinkHandle::Capture(s) => Some(s),
            SinkHandle::Live(_) => None,
        }
    }
}
