use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{OutputCallbackInfo, Sample, SampleFormat as CpalFormat, StreamConfig};
use tracing::{debug, warn};

use crate::error::{AudioError, Result};
use crate::sink::SinkConfig;

/// Fills an interleaved i16 buffer on behalf of the device, zero-padding any
/// shortfall, and returns the number of samples actually sourced. Invoked on
/// the device callback thread.
pub type PullCallback = Box<dyn FnMut(&mut [i16]) -> usize + Send>;

/// Invoked when the underlying stream dies; the sink marks its track failed.
pub type ErrorCallback = Box<dyn Fn(String) + Send + Sync>;

/// Where live tracks come from. One implementation wraps the default cpal
/// host; another is driven explicitly for offline rendering and tests.
pub trait OutputDevice: Send + Sync {
    fn open_stream(
        &self,
        config: &SinkConfig,
        pull: PullCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn DeviceStream>>;
}

/// A running output stream. Dropping the handle tears the stream down.
pub trait DeviceStream: Send {
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;

    /// Extra frames of latency introduced by the device itself.
    fn latency_frames(&self) -> u32 {
        0
    }
}

// ---------------------------------------------------------------------------
// cpal-backed device

/// Hardware output through the default cpal host.
///
/// `cpal::Stream` is not `Send`, so each stream lives on its own thread and
/// the returned handle commands it over a channel.
pub struct CpalDevice;

enum StreamCmd {
    Play,
    Pause,
    Shutdown,
}

struct CpalStreamHandle {
    tx: mpsc::Sender<StreamCmd>,
}

impl DeviceStream for CpalStreamHandle {
    fn play(&mut self) -> Result<()> {
        self.tx
            .send(StreamCmd::Play)
            .map_err(|_| AudioError::Io("output device thread exited".into()))
    }

    fn pause(&mut self) -> Result<()> {
        self.tx
            .send(StreamCmd::Pause)
            .map_err(|_| AudioError::Io("output device thread exited".into()))
    }
}

impl Drop for CpalStreamHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(StreamCmd::Shutdown);
    }
}

struct StreamPump {
    pull: PullCallback,
    scratch: Vec<i16>,
}

impl StreamPump {
    fn callback<T>(&mut self, data: &mut [T], _: &OutputCallbackInfo)
    where
        T: Sample,
    {
        if self.scratch.len() < data.len() {
            self.scratch.resize(data.len(), 0);
        }
        (self.pull)(&mut self.scratch[..data.len()]);
        for (out, sample) in data.iter_mut().zip(self.scratch.iter()) {
            *out = Sample::from(sample);
        }
    }
}

impl OutputDevice for CpalDevice {
    fn open_stream(
        &self,
        config: &SinkConfig,
        pull: PullCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn DeviceStream>> {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let config = config.clone();

        std::thread::Builder::new()
            .name("tannoy-output".into())
            .spawn(move || stream_thread(config, pull, on_error, cmd_rx, ready_tx))
            .map_err(|e| AudioError::Resource(format!("could not spawn device thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalStreamHandle { tx: cmd_tx })),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AudioError::Resource(
                "device thread exited during setup".into(),
            )),
        }
    }
}

fn stream_thread(
    config: SinkConfig,
    pull: PullCallback,
    on_error: ErrorCallback,
    cmd_rx: mpsc::Receiver<StreamCmd>,
    ready_tx: mpsc::Sender<Result<()>>,
) {
    let built = build_stream(&config, pull, on_error);
    let stream = match built {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    for cmd in cmd_rx {
        match cmd {
            StreamCmd::Play => {
                if let Err(e) = stream.play() {
                    warn!("could not start output stream: {}", e);
                }
            }
            StreamCmd::Pause => {
                if let Err(e) = stream.pause() {
                    warn!("could not pause output stream: {}", e);
                }
            }
            StreamCmd::Shutdown => break,
        }
    }
    debug!("output stream thread exiting");
}

fn build_stream(
    config: &SinkConfig,
    pull: PullCallback,
    on_error: ErrorCallback,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::Resource("could not find default output device".into()))?;
    let supported = device
        .supported_output_configs()
        .map_err(|e| AudioError::Resource(e.to_string()))?;
    let range = supported
        .filter(|c| {
            c.channels() == config.channels
                && c.min_sample_rate().0 <= config.sample_rate
                && config.sample_rate <= c.max_sample_rate().0
        })
        .next()
        .ok_or_else(|| {
            AudioError::Config(format!(
                "no device mode for {} Hz x {} channels",
                config.sample_rate, config.channels
            ))
        })?;
    let supported = range.with_sample_rate(cpal::SampleRate(config.sample_rate));
    let err_fn = move |err: cpal::StreamError| on_error(err.to_string());
    let sample_format = supported.sample_format();
    let stream_config: StreamConfig = supported.into();

    let mut pump = StreamPump {
        pull,
        scratch: vec![],
    };
    let stream = match sample_format {
        CpalFormat::F32 => device.build_output_stream(
            &stream_config,
            move |d: &mut [f32], cb| pump.callback(d, cb),
            err_fn,
        ),
        CpalFormat::I16 => device.build_output_stream(
            &stream_config,
            move |d: &mut [i16], cb| pump.callback(d, cb),
            err_fn,
        ),
        CpalFormat::U16 => device.build_output_stream(
            &stream_config,
            move |d: &mut [u16], cb| pump.callback(d, cb),
            err_fn,
        ),
    }
    .map_err(|e| AudioError::Resource(e.to_string()))?;
    Ok(stream)
}

// ---------------------------------------------------------------------------
// manually driven device

struct ManualShared {
    pull: Option<PullCallback>,
    playing: bool,
    captured: Vec<i16>,
}

/// An output device with no hardware behind it: the owner pumps it with
/// [`ManualDevice::render`] and reads back what was delivered. Used for
/// offline rendering and throughout the test suite.
pub struct ManualDevice {
    shared: Arc<Mutex<ManualShared>>,
}

impl ManualDevice {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(ManualShared {
                pull: None,
                playing: false,
                captured: vec![],
            })),
        }
    }

    /// Pump `samples` interleaved samples out of the attached stream, as the
    /// hardware callback would. Returns the samples actually sourced (the
    /// remainder was silence). Renders nothing while the stream is paused.
    pub fn render(&self, samples: usize) -> usize {
        let mut shared = self.shared.lock().unwrap();
        if !shared.playing {
            return 0;
        }
        let mut chunk = vec![0i16; samples];
        let sourced = match shared.pull.as_mut() {
            Some(pull) => pull(&mut chunk),
            None => return 0,
        };
        shared.captured.extend_from_slice(&chunk);
        sourced
    }

    /// Everything delivered so far, silence padding included.
    pub fn captured(&self) -> Vec<i16> {
        self.shared.lock().unwrap().captured.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.shared.lock().unwrap().playing
    }
}

impl Default for ManualDevice {
    fn default() -> Self {
        Self::new()
    }
}

struct ManualStreamHandle {
    shared: Arc<Mutex<ManualShared>>,
}

impl DeviceStream for ManualStreamHandle {
    fn play(&mut self) -> Result<()> {
        self.shared.lock().unwrap().playing = true;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.shared.lock().unwrap().playing = false;
        Ok(())
    }
}

impl Drop for ManualStreamHandle {
    fn drop(&mut self) {
        let mut shared = self.shared.lock().unwrap();
        shared.pull = None;
        shared.playing = false;
    }
}

impl OutputDevice for ManualDevice {
    fn open_stream(
        &self,
        _config: &SinkConfig,
        pull: PullCallback,
        _on_error: ErrorCallback,
    ) -> Result<Box<dyn DeviceStream>> {
        let mut shared = self.shared.lock().unwrap();
        if shared.pull.is_some() {
            return Err(AudioError::Resource("output device is busy".into()));
        }
        shared.pull = Some(pull);
        Ok(Box::new(ManualStreamHandle {
            shared: self.shared.clone(),
        }))
    }
}
