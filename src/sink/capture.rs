use std::sync::{Condvar, Mutex};

use tracing::{debug, trace};

use crate::error::{AudioError, Result};
use crate::sink::{AudioSink, DeliveryCallback, SinkConfig};

/// Default growth ceiling for the capture region.
pub const DEFAULT_CAPTURE_LIMIT: usize = 64 * 1024 * 1024;

/// Terminal and progress events the decode engine reports to a capture
/// sink. This is the only path by which decode status reaches the sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeEvent {
    Complete,
    /// `ext1` carries the error code.
    Error,
    /// `ext1` carries a progress percentage.
    BufferingUpdate,
}

struct CaptureState {
    config: Option<SinkConfig>,
    region: Vec<u8>,
    frames_written: u64,
    complete: bool,
    error: Option<i32>,
}

/// In-memory sink for one-shot "decode whole source to a buffer" requests.
///
/// No device sits behind it: `write()` appends to a growable region, the
/// decode engine reports terminal status through [`notify`](Self::notify),
/// and [`wait`](Self::wait) blocks the caller until that happens. The region
/// is append-only for the producer and read-only for everyone else.
pub struct CaptureSink {
    state: Mutex<CaptureState>,
    done: Condvar,
    limit: usize,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_CAPTURE_LIMIT)
    }

    /// A sink with a custom growth ceiling, after which writes fail with
    /// [`AudioError::ResourceExhausted`].
    pub fn with_limit(limit: usize) -> Self {
        Self {
            state: Mutex::new(CaptureState {
                config: None,
                region: vec![],
                frames_written: 0,
                complete: false,
                error: None,
            }),
            done: Condvar::new(),
            limit,
        }
    }

    /// Decode-engine notification entry. Completion and errors wake every
    /// waiter; progress events are only logged.
    pub fn notify(&self, event: DecodeEvent, ext1: i32, ext2: i32) {
        match event {
            DecodeEvent::Complete => {
                let mut st = self.state.lock().unwrap();
                st.complete = true;
                debug!(bytes = st.region.len(), "capture complete");
                drop(st);
                self.done.notify_all();
            }
            DecodeEvent::Error => {
                let mut st = self.state.lock().unwrap();
                st.error = Some(ext1);
                debug!(code = ext1, "capture failed");
                drop(st);
                self.done.notify_all();
            }
            DecodeEvent::BufferingUpdate => {
                trace!(percent = ext1, detail = ext2, "capture progress");
            }
        }
    }

    /// Block until the decode engine signals completion or error. Returns
    /// the terminal status; never wakes early with success.
    pub fn wait(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        while !st.complete && st.error.is_none() {
            st = self.done.wait(st).unwrap();
        }
        match st.error {
            Some(code) => Err(AudioError::DecodeFailed { code }),
            None => Ok(()),
        }
    }

    /// Bytes captured so far; valid before completion.
    pub fn size(&self) -> usize {
        self.state.lock().unwrap().region.len()
    }

    /// Snapshot of the region for external readers.
    pub fn contents(&self) -> Vec<u8> {
        self.state.lock().unwrap().region.clone()
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.state.lock().unwrap().config.as_ref().map(|c| c.sample_rate)
    }

    pub fn channels(&self) -> Option<u16> {
        self.state.lock().unwrap().config.as_ref().map(|c| c.channels)
    }

    fn grow_for(state: &mut CaptureState, extra: usize, limit: usize) -> Result<()> {
        let needed = state.region.len() + extra;
        if needed > limit {
            return Err(AudioError::ResourceExhausted { limit });
        }
        if needed > state.region.capacity() {
            // double and copy forward, bounded by the ceiling
            let target = (state.region.capacity().max(4096) * 2).clamp(needed, limit);
            state.region.reserve_exact(target - state.region.len());
        }
        Ok(())
    }
}

impl Default for CaptureSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for CaptureSink {
    fn ready(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.config.is_some() && st.error.is_none()
    }

    fn realtime(&self) -> bool {
        false
    }

    fn open(&self, config: SinkConfig, _delivery: Option<DeliveryCallback>) -> Result<()> {
        config.validate()?;
        let mut st = self.state.lock().unwrap();
        if st.config.is_some() {
            return Err(AudioError::State {
                op: "open",
                state: "open",
            });
        }
        st.config = Some(config);
        Ok(())
    }

    // start/pause/flush/stop/close have no device work to do; the region
    // stays valid until the sink is dropped
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        let mut st = self.state.lock().unwrap();
        let config = match st.config.as_ref() {
            Some(config) => config.clone(),
            None => {
                return Err(AudioError::State {
                    op: "write",
                    state: "closed",
                })
            }
        };
        Self::grow_for(&mut st, data.len(), self.limit)?;
        st.region.extend_from_slice(data);
        st.frames_written += (data.len() / config.frame_size()) as u64;
        Ok(data.len())
    }

    fn position(&self) -> Result<u64> {
        self.frames_written()
    }

    fn frames_written(&self) -> Result<u64> {
        let st = self.state.lock().unwrap();
        if st.config.is_none() {
            return Err(AudioError::State {
                op: "query frames written",
                state: "closed",
            });
        }
        Ok(st.frames_written)
    }

    fn latency_ms(&self) -> Result<u32> {
        let st = self.state.lock().unwrap();
        if st.config.is_none() {
            return Err(AudioError::State {
                op: "query latency",
                state: "closed",
            });
        }
        Ok(0)
    }

    fn msecs_per_frame(&self) -> Result<f32> {
        let st = self.state.lock().unwrap();
        match st.config.as_ref() {
            Some(config) => Ok(1000.0 / config.sample_rate as f32),
            None => Err(AudioError::State {
                op: "query frame duration",
                state: "closed",
            }),
        }
    }

    fn set_volume(&self, _left: f32, _right: f32) -> Result<()> {
        // nothing plays out of a capture sink
        Ok(())
    }

    fn set_playback_rate_permille(&self, _permille: u32) -> Result<()> {
        Err(AudioError::Unsupported)
    }

    fn attach_aux_effect(&self, _effect_id: i32) -> Result<()> {
        Err(AudioError::Unsupported)
    }

    fn set_aux_effect_send_level(&self, _level: f32) -> Result<()> {
        Err(AudioError::Unsupported)
    }
}
