use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rb::{RbConsumer, RbProducer, RB};
use tracing::{debug, info};

use crate::device::{DeviceStream, ErrorCallback, OutputDevice, PullCallback};
use crate::error::{AudioError, Result};
use crate::sink::{
    AudioSink, DeliveryCallback, SampleFormat, SinkConfig, MIN_BUFFER_COUNT, PERIOD_FRAMES,
};

/// Hardware-backed audio sink.
///
/// The transferable unit is the *track*: the device stream, its sample queue,
/// and the delivered-frame counter. A hand-off moves the track to the
/// successor sink wholesale, so bytes queued before the switch play out with
/// no gap and no duplication. The device callback finds the sink that
/// currently owns delivery through a [`Router`] cell; a switch holds the
/// router lock for its whole duration, which is what orders deliveries
/// strictly before/after the switch.
pub struct LiveSink {
    session_id: i32,
    device: Arc<dyn OutputDevice>,
    target: Arc<RouterTarget>,
    state: Mutex<LiveState>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LivePhase {
    Closed,
    Open,
    Started,
    Paused,
    Stopped,
    Failed,
}

impl LivePhase {
    fn name(self) -> &'static str {
        match self {
            LivePhase::Closed => "closed",
            LivePhase::Open => "open",
            LivePhase::Started => "started",
            LivePhase::Paused => "paused",
            LivePhase::Stopped => "stopped",
            LivePhase::Failed => "failed",
        }
    }
}

struct LiveState {
    phase: LivePhase,
    config: Option<SinkConfig>,
    track: Option<Track>,
    next: Option<Arc<LiveSink>>,
    // successors adopt the predecessor's track at switch time instead of
    // allocating their own at open()
    defer_track: bool,
    volume: (f32, f32),
    rate_permille: u32,
    aux_effect: i32,
    send_level: f32,
    bytes_written: u64,
}

/// The stream, its queue, and the counters that ride along when the track is
/// handed to a successor.
struct Track {
    // handles stay valid while the rb itself is alive
    buffer: rb::SpscRb<u8>,
    producer: rb::Producer<u8>,
    shared: Arc<TrackShared>,
    stream: Box<dyn DeviceStream>,
    config: SinkConfig,
}

struct TrackShared {
    frames_played: AtomicU64,
    failed: AtomicBool,
    router: Arc<Router>,
}

/// The routing indirection the device callback dereferences on every
/// delivery to find the current owner. Two sinks share it only inside a
/// switch window.
struct Router {
    inner: Mutex<RouterInner>,
}

struct RouterInner {
    owner: Weak<RouterTarget>,
    switching: bool,
}

impl Router {
    fn new(owner: &Arc<RouterTarget>) -> Self {
        Self {
            inner: Mutex::new(RouterInner {
                owner: Arc::downgrade(owner),
                switching: false,
            }),
        }
    }
}

/// Per-sink parameters the callback reads through the router: volume and the
/// optional write-completion callback.
struct RouterTarget {
    volume_left: AtomicU32,
    volume_right: AtomicU32,
    delivery: Mutex<Option<DeliveryCallback>>,
}

impl RouterTarget {
    fn new() -> Self {
        Self {
            volume_left: AtomicU32::new(1.0f32.to_bits()),
            volume_right: AtomicU32::new(1.0f32.to_bits()),
            delivery: Mutex::new(None),
        }
    }

    fn volume(&self) -> (f32, f32) {
        (
            f32::from_bits(self.volume_left.load(Ordering::Relaxed)),
            f32::from_bits(self.volume_right.load(Ordering::Relaxed)),
        )
    }

    fn set_volume(&self, left: f32, right: f32) {
        self.volume_left.store(left.to_bits(), Ordering::Relaxed);
        self.volume_right.store(right.to_bits(), Ordering::Relaxed);
    }
}

impl LiveSink {
    pub fn new(device: Arc<dyn OutputDevice>, session_id: i32) -> Self {
        Self {
            session_id,
            device,
            target: Arc::new(RouterTarget::new()),
            state: Mutex::new(LiveState {
                phase: LivePhase::Closed,
                config: None,
                track: None,
                next: None,
                defer_track: false,
                volume: (1.0, 1.0),
                rate_permille: 1000,
                aux_effect: 0,
                send_level: 0.0,
                bytes_written: 0,
            }),
        }
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    /// Record the successor for a later hand-off. The successor defers its
    /// own track allocation until it is either switched to or started
    /// standalone.
    pub fn set_next_output(&self, next: &Arc<LiveSink>) -> Result<()> {
        if std::ptr::eq(self, next.as_ref()) {
            return Err(AudioError::Config("sink cannot chain to itself".into()));
        }
        // one state lock at a time; reciprocal registrations must not
        // deadlock
        {
            let mut st = self.state.lock().unwrap();
            st.next = Some(next.clone());
        }
        let mut nx = next.state.lock().unwrap();
        if nx.config.is_none() && nx.track.is_none() {
            nx.defer_track = true;
        }
        Ok(())
    }

    /// A sink with no declared successor must pad its final buffer with
    /// silence on stop so the tail is not clipped.
    pub fn needs_trailing_padding(&self) -> bool {
        self.state.lock().unwrap().next.is_none()
    }

    /// Atomically migrate delivery to the successor recorded by
    /// [`set_next_output`](Self::set_next_output).
    ///
    /// Holds the router lock across the whole transfer: deliveries already
    /// under way complete first, deliveries after the switch see the
    /// successor. On failure the current sink is left fully intact,
    /// including its `next` reference.
    pub fn switch_to_next_output(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let next = match st.next.clone() {
            Some(next) => next,
            None => {
                return Err(AudioError::State {
                    op: "switch output",
                    state: "no successor set",
                })
            }
        };
        let track = match st.track.take() {
            Some(track) => track,
            None => {
                return Err(AudioError::State {
                    op: "switch output",
                    state: st.phase.name(),
                })
            }
        };

        let router = track.shared.router.clone();
        let mut guard = router.inner.lock().unwrap();
        guard.switching = true;

        let mut nx = next.state.lock().unwrap();
        if nx.track.is_some() {
            guard.switching = false;
            st.track = Some(track);
            return Err(AudioError::State {
                op: "switch output",
                state: "successor already streaming",
            });
        }
        match nx.config.as_ref() {
            None => nx.config = Some(track.config.clone()),
            Some(config) if !config.handoff_compatible(&track.config) => {
                guard.switching = false;
                st.track = Some(track);
                return Err(AudioError::Config(
                    "successor opened with incompatible parameters".into(),
                ));
            }
            Some(_) => {}
        }

        // playback parameters and framework-level counters ride along
        nx.volume = st.volume;
        next.target.set_volume(nx.volume.0, nx.volume.1);
        nx.rate_permille = st.rate_permille;
        nx.aux_effect = st.aux_effect;
        nx.send_level = st.send_level;
        nx.bytes_written += st.bytes_written;
        st.bytes_written = 0;

        guard.owner = Arc::downgrade(&next.target);
        nx.phase = match st.phase {
            LivePhase::Started => LivePhase::Started,
            LivePhase::Paused => LivePhase::Paused,
            _ => LivePhase::Open,
        };
        nx.track = Some(track);
        nx.defer_track = false;

        st.phase = LivePhase::Stopped;
        st.next = None;
        guard.switching = false;
        info!(
            from = self.session_id,
            to = next.session_id,
            "audio output switched to successor"
        );
        Ok(())
    }

    fn build_track(&self, config: &SinkConfig) -> Result<Track> {
        let frame_size = config.frame_size();
        let capacity = config.buffer_count * PERIOD_FRAMES * frame_size;
        let buffer = rb::SpscRb::new(capacity);
        let producer = buffer.producer();
        let consumer = buffer.consumer();
        let shared = Arc::new(TrackShared {
            frames_played: AtomicU64::new(0),
            failed: AtomicBool::new(false),
            router: Arc::new(Router::new(&self.target)),
        });
        let pull = make_pull(consumer, shared.clone(), config);
        let on_error: ErrorCallback = {
            let shared = shared.clone();
            let session_id = self.session_id;
            Box::new(move |message| {
                shared.failed.store(true, Ordering::SeqCst);
                tracing::warn!(session = session_id, "output stream error: {}", message);
            })
        };
        let stream = self.device.open_stream(config, pull, on_error)?;
        Ok(Track {
            buffer,
            producer,
            shared,
            stream,
            config: config.clone(),
        })
    }

    fn write_silence(track: &Track, bytes: usize) {
        let zeros = vec![0u8; bytes];
        let _ = track.producer.write(&zeros);
    }
}

fn make_pull(consumer: rb::Consumer<u8>, shared: Arc<TrackShared>, config: &SinkConfig) -> PullCallback {
    let channels = config.channels as usize;
    let format = config.format;
    let frame_size = config.frame_size();
    let mut bytes: Vec<u8> = Vec::new();
    Box::new(move |out: &mut [i16]| {
        // blocks while a switch holds the router
        let guard = shared.router.inner.lock().unwrap();
        debug_assert!(!guard.switching);
        let owner = guard.owner.upgrade();
        let (vl, vr) = match owner.as_ref() {
            Some(owner) => owner.volume(),
            None => (0.0, 0.0),
        };

        let frames_wanted = out.len() / channels;
        let want = frames_wanted * frame_size;
        if bytes.len() < want {
            bytes.resize(want, 0);
        }
        let got = if want == 0 {
            0
        } else {
            consumer.read(&mut bytes[..want]).unwrap_or(0)
        };
        debug_assert_eq!(got % frame_size, 0, "producer writes whole frames");

        let samples = got / format.bytes_per_sample();
        for i in 0..samples {
            let raw = match format {
                SampleFormat::Pcm16 => i16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]]),
                SampleFormat::Pcm8 => ((bytes[i] as i16) - 128) << 8,
            };
            let gain = if channels == 1 {
                0.5 * (vl + vr)
            } else {
                match i % channels {
                    0 => vl,
                    1 => vr,
                    _ => 0.5 * (vl + vr),
                }
            };
            out[i] = (raw as f32 * gain) as i16;
        }
        for sample in out[samples..].iter_mut() {
            *sample = 0;
        }

        let frames = (samples / channels) as u64;
        if frames > 0 {
            shared.frames_played.fetch_add(frames, Ordering::SeqCst);
            if let Some(owner) = owner {
                if let Some(cb) = owner.delivery.lock().unwrap().as_mut() {
                    cb(frames);
                }
            }
        }
        samples
    })
}

impl AudioSink for LiveSink {
    fn ready(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.track.is_some() && st.phase != LivePhase::Failed
    }

    fn realtime(&self) -> bool {
        true
    }

    fn open(&self, config: SinkConfig, delivery: Option<DeliveryCallback>) -> Result<()> {
        config.validate()?;
        let mut config = config;
        if config.buffer_count < MIN_BUFFER_COUNT {
            config.buffer_count = MIN_BUFFER_COUNT;
        }

        let mut st = self.state.lock().unwrap();
        if st.config.is_some() {
            return Err(AudioError::State {
                op: "open",
                state: st.phase.name(),
            });
        }
        *self.target.delivery.lock().unwrap() = delivery;
        self.target.set_volume(st.volume.0, st.volume.1);
        if !st.defer_track {
            st.track = Some(self.build_track(&config)?);
        }
        debug!(
            session = self.session_id,
            rate = config.sample_rate,
            channels = config.channels,
            deferred = st.defer_track,
            "live sink opened"
        );
        st.config = Some(config);
        st.phase = LivePhase::Open;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        match st.phase {
            LivePhase::Open | LivePhase::Paused | LivePhase::Stopped => {}
            phase => {
                return Err(AudioError::State {
                    op: "start",
                    state: phase.name(),
                })
            }
        }
        if st.track.is_none() {
            // deferred successor that was never switched to
            let config = st.config.clone().ok_or(AudioError::State {
                op: "start",
                state: "closed",
            })?;
            st.track = Some(self.build_track(&config)?);
            st.defer_track = false;
        }
        if let Some(track) = st.track.as_mut() {
            track.stream.play()?;
        }
        st.phase = LivePhase::Started;
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        if st.phase != LivePhase::Started {
            return Err(AudioError::State {
                op: "pause",
                state: st.phase.name(),
            });
        }
        if let Some(track) = st.track.as_mut() {
            track.stream.pause()?;
        }
        st.phase = LivePhase::Paused;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let st = self.state.lock().unwrap();
        match st.track.as_ref() {
            Some(track) => {
                track.buffer.clear();
                Ok(())
            }
            None => Err(AudioError::State {
                op: "flush",
                state: st.phase.name(),
            }),
        }
    }

    fn stop(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        match st.phase {
            LivePhase::Started | LivePhase::Paused | LivePhase::Open => {}
            phase => {
                return Err(AudioError::State {
                    op: "stop",
                    state: phase.name(),
                })
            }
        }
        // the stream keeps draining what is queued; a successor continues
        // the stream instead, so padding would audibly stall it
        if st.next.is_none() {
            if let (Some(track), Some(config)) = (st.track.as_ref(), st.config.as_ref()) {
                LiveSink::write_silence(track, PERIOD_FRAMES * config.frame_size());
            }
        }
        st.phase = LivePhase::Stopped;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.track = None;
        st.config = None;
        st.defer_track = false;
        st.phase = LivePhase::Closed;
        *self.target.delivery.lock().unwrap() = None;
        Ok(())
    }

    fn write(&self, data: &[u8]) -> Result<usize> {
        let mut st = self.state.lock().unwrap();
        match st.phase {
            LivePhase::Open | LivePhase::Started | LivePhase::Paused => {}
            phase => {
                return Err(AudioError::State {
                    op: "write",
                    state: phase.name(),
                })
            }
        }
        let config = st.config.clone().ok_or(AudioError::State {
            op: "write",
            state: "closed",
        })?;
        let frame_size = config.frame_size();
        let whole = data.len() - data.len() % frame_size;
        if whole == 0 {
            return Ok(0);
        }
        let started = st.phase == LivePhase::Started;
        let failed = st
            .track
            .as_ref()
            .map(|t| t.shared.failed.load(Ordering::SeqCst))
            .unwrap_or(false);
        if failed {
            st.phase = LivePhase::Failed;
            return Err(AudioError::Io("output stream lost".into()));
        }
        let track = st.track.as_ref().ok_or(AudioError::State {
            op: "write",
            state: "closed",
        })?;
        let mut accepted = track.producer.write(&data[..whole]).unwrap_or(0);
        if accepted == 0 && started {
            // backpressure: wait at most one buffer period, then retry once
            drop(st);
            std::thread::sleep(Duration::from_secs_f64(
                PERIOD_FRAMES as f64 / config.sample_rate as f64,
            ));
            st = self.state.lock().unwrap();
            if st.phase != LivePhase::Started {
                return Err(AudioError::State {
                    op: "write",
                    state: st.phase.name(),
                });
            }
            let track = st.track.as_ref().ok_or(AudioError::State {
                op: "write",
                state: "closed",
            })?;
            accepted = track.producer.write(&data[..whole]).unwrap_or(0);
        }
        st.bytes_written += accepted as u64;
        Ok(accepted)
    }

    fn position(&self) -> Result<u64> {
        let st = self.state.lock().unwrap();
        match st.track.as_ref() {
            Some(track) => Ok(track.shared.frames_played.load(Ordering::SeqCst)),
            None => Err(AudioError::State {
                op: "query position",
                state: st.phase.name(),
            }),
        }
    }

    fn frames_written(&self) -> Result<u64> {
        let st = self.state.lock().unwrap();
        match st.config.as_ref() {
            Some(config) => Ok(st.bytes_written / config.frame_size() as u64),
            None => Err(AudioError::State {
                op: "query frames written",
                state: st.phase.name(),
            }),
        }
    }

    fn latency_ms(&self) -> Result<u32> {
        let st = self.state.lock().unwrap();
        let config = st.config.as_ref().ok_or(AudioError::State {
            op: "query latency",
            state: st.phase.name(),
        })?;
        let device_frames = st
            .track
            .as_ref()
            .map(|t| t.stream.latency_frames())
            .unwrap_or(0) as u64;
        let queue_frames = (config.buffer_count * PERIOD_FRAMES) as u64;
        Ok(((queue_frames + device_frames) * 1000 / config.sample_rate as u64) as u32)
    }

    fn msecs_per_frame(&self) -> Result<f32> {
        let st = self.state.lock().unwrap();
        let config = st.config.as_ref().ok_or(AudioError::State {
            op: "query frame duration",
            state: st.phase.name(),
        })?;
        Ok(1.0e6 / (config.sample_rate as f32 * st.rate_permille as f32))
    }

    fn set_volume(&self, left: f32, right: f32) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.volume = (left, right);
        self.target.set_volume(left, right);
        Ok(())
    }

    fn set_playback_rate_permille(&self, permille: u32) -> Result<()> {
        if permille == 0 || permille > 4000 {
            return Err(AudioError::Config(format!(
                "playback rate {} permille out of range",
                permille
            )));
        }
        self.state.lock().unwrap().rate_permille = permille;
        Ok(())
    }

    fn attach_aux_effect(&self, effect_id: i32) -> Result<()> {
        self.state.lock().unwrap().aux_effect = effect_id;
        Ok(())
    }

    fn set_aux_effect_send_level(&self, level: f32) -> Result<()> {
        self.state.lock().unwrap().send_level = level;
        Ok(())
    }
}
