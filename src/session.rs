use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, info, warn};

use crate::device::OutputDevice;
use crate::error::{AudioError, Result};
use crate::ledger::{DeviceClass, UsageLedger};
use crate::sink::{CaptureSink, LiveSink, SinkHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Prepared,
    Started,
    Paused,
    Stopped,
    TornDown,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Prepared => "prepared",
            SessionState::Started => "started",
            SessionState::Paused => "paused",
            SessionState::Stopped => "stopped",
            SessionState::TornDown => "torn down",
        }
    }
}

/// Audio stream category, advisory routing/attenuation metadata carried on
/// behalf of the platform audio policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamType {
    #[default]
    Music,
    Ring,
    Alarm,
    Notification,
    Voice,
    System,
}

/// Events delivered to the remote client, fire-and-forget.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    StateChanged(SessionState),
    PlaybackComplete,
    Error(String),
    MetadataUpdate(u32),
}

/// The far side of a session's control connection. Implementations forward
/// events over whatever transport registered the session.
pub trait ClientEndpoint: Send + Sync {
    fn notify(&self, event: ClientEvent);
}

/// Weak handle to a remote client, used both for liveness checks and for
/// asynchronous notification delivery. Events sent after the client has
/// gone away vanish silently.
#[derive(Clone)]
pub struct ClientHandle {
    endpoint: Weak<dyn ClientEndpoint>,
}

impl ClientHandle {
    pub fn new<E>(endpoint: &Arc<E>) -> Self
    where
        E: ClientEndpoint + 'static,
    {
        let endpoint = Arc::downgrade(endpoint);
        let endpoint: Weak<dyn ClientEndpoint> = endpoint;
        Self { endpoint }
    }

    pub fn alive(&self) -> bool {
        self.endpoint.strong_count() > 0
    }

    pub fn notify(&self, event: ClientEvent) {
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.notify(event);
        }
    }
}

/// What happened at natural end-of-stream.
#[derive(Debug, PartialEq, Eq)]
pub enum EosOutcome {
    /// Looping session keeps playing.
    Looped,
    /// No successor; playback completed.
    Completed,
    /// Control transferred to the successor with this connection id.
    Chained(i32),
}

struct SessionCore {
    state: SessionState,
    source: Option<String>,
    sink: Option<SinkHandle>,
    looping: bool,
    stream_type: StreamType,
    device_class: DeviceClass,
    next: Option<Arc<Session>>,
    volume: (f32, f32),
    metadata_updated: HashSet<u32>,
    retransmit: Option<SocketAddr>,
}

/// One client-controlled playback instance.
///
/// Identified by a registry-assigned connection id plus the caller-supplied
/// audio session id (used to correlate with external effects processing).
/// Holds at most one sink; sink state transitions drive the usage ledger for
/// the owning uid.
pub struct Session {
    conn_id: i32,
    audio_session_id: i32,
    uid: u32,
    pid: u32,
    client: ClientHandle,
    device: Arc<dyn OutputDevice>,
    ledger: Arc<UsageLedger>,
    core: Mutex<SessionCore>,
}

impl Session {
    pub(crate) fn new(
        conn_id: i32,
        audio_session_id: i32,
        uid: u32,
        pid: u32,
        client: ClientHandle,
        device: Arc<dyn OutputDevice>,
        ledger: Arc<UsageLedger>,
    ) -> Self {
        Self {
            conn_id,
            audio_session_id,
            uid,
            pid,
            client,
            device,
            ledger,
            core: Mutex::new(SessionCore {
                state: SessionState::Idle,
                source: None,
                sink: None,
                looping: false,
                stream_type: StreamType::default(),
                device_class: DeviceClass::Speaker,
                next: None,
                volume: (1.0, 1.0),
                metadata_updated: HashSet::new(),
                retransmit: None,
            }),
        }
    }

    pub fn conn_id(&self) -> i32 {
        self.conn_id
    }

    pub fn audio_session_id(&self) -> i32 {
        self.audio_session_id
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> SessionState {
        self.core.lock().unwrap().state
    }

    pub fn client_alive(&self) -> bool {
        self.client.alive()
    }

    /// Record the data source; stays Idle until prepare() succeeds.
    pub fn set_data_source(&self, descriptor: impl Into<String>) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        if core.state != SessionState::Idle {
            return Err(AudioError::State {
                op: "set data source",
                state: core.state.name(),
            });
        }
        core.source = Some(descriptor.into());
        Ok(())
    }

    /// Finish preparation (metadata probed, decoder selected by the external
    /// pipeline) and become startable.
    pub fn prepare(&self) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        if core.state != SessionState::Idle || core.source.is_none() {
            return Err(AudioError::State {
                op: "prepare",
                state: if core.source.is_none() {
                    "no data source"
                } else {
                    core.state.name()
                },
            });
        }
        core.state = SessionState::Prepared;
        drop(core);
        self.client.notify(ClientEvent::StateChanged(SessionState::Prepared));
        Ok(())
    }

    /// The session's live sink, created lazily.
    pub fn ensure_live_sink(&self) -> Result<Arc<LiveSink>> {
        let mut core = self.core.lock().unwrap();
        if core.state == SessionState::TornDown {
            return Err(AudioError::State {
                op: "create sink",
                state: "torn down",
            });
        }
        match &core.sink {
            Some(SinkHandle::Live(sink)) => Ok(sink.clone()),
            Some(SinkHandle::Capture(_)) => Err(AudioError::State {
                op: "create live sink",
                state: "capture sink attached",
            }),
            None => {
                let sink = Arc::new(LiveSink::new(self.device.clone(), self.audio_session_id));
                core.sink = Some(SinkHandle::Live(sink.clone()));
                Ok(sink)
            }
        }
    }

    /// The session's capture sink, created lazily.
    pub fn ensure_capture_sink(&self) -> Result<Arc<CaptureSink>> {
        let mut core = self.core.lock().unwrap();
        if core.state == SessionState::TornDown {
            return Err(AudioError::State {
                op: "create sink",
                state: "torn down",
            });
        }
        match &core.sink {
            Some(SinkHandle::Capture(sink)) => Ok(sink.clone()),
            Some(SinkHandle::Live(_)) => Err(AudioError::State {
                op: "create capture sink",
                state: "live sink attached",
            }),
            None => {
                let sink = Arc::new(CaptureSink::new());
                core.sink = Some(SinkHandle::Capture(sink.clone()));
                Ok(sink)
            }
        }
    }

    pub fn sink(&self) -> Option<SinkHandle> {
        self.core.lock().unwrap().sink.clone()
    }

    pub fn start(&self) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        match core.state {
            SessionState::Prepared | SessionState::Paused | SessionState::Stopped => {}
            state => {
                return Err(AudioError::State {
                    op: "start",
                    state: state.name(),
                })
            }
        }
        let sink = core.sink.clone().ok_or(AudioError::State {
            op: "start",
            state: "no sink attached",
        })?;
        sink.as_sink().start()?;
        self.ledger.note_start(self.uid, core.device_class);
        core.state = SessionState::Started;
        drop(core);
        self.client.notify(ClientEvent::StateChanged(SessionState::Started));
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        if core.state != SessionState::Started {
            return Err(AudioError::State {
                op: "pause",
                state: core.state.name(),
            });
        }
        let sink = core.sink.clone().ok_or(AudioError::State {
            op: "pause",
            state: "no sink attached",
        })?;
        sink.as_sink().pause()?;
        self.ledger.note_stop(self.uid);
        core.state = SessionState::Paused;
        drop(core);
        self.client.notify(ClientEvent::StateChanged(SessionState::Paused));
        Ok(())
    }

    /// Flush and release sink buffers; the sink itself stays allocated so
    /// the session can be replayed.
    pub fn stop(&self) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        match core.state {
            SessionState::Started | SessionState::Paused => {}
            state => {
                return Err(AudioError::State {
                    op: "stop",
                    state: state.name(),
                })
            }
        }
        let was_started = core.state == SessionState::Started;
        if let Some(sink) = core.sink.clone() {
            let _ = sink.as_sink().flush();
            sink.as_sink().stop()?;
        }
        if was_started {
            self.ledger.note_stop(self.uid);
        }
        core.state = SessionState::Stopped;
        drop(core);
        self.client.notify(ClientEvent::StateChanged(SessionState::Stopped));
        Ok(())
    }

    /// Feed decoded bytes to the sink. Device loss is reported to the caller
    /// and forwarded to the remote client.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let sink = self.sink().ok_or(AudioError::State {
            op: "write",
            state: "no sink attached",
        })?;
        match sink.as_sink().write(data) {
            Ok(accepted) => Ok(accepted),
            Err(e @ AudioError::Io(_)) => {
                warn!(conn = self.conn_id, "session write failed: {}", e);
                self.client.notify(ClientEvent::Error(e.to_string()));
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Pre-register the session that takes over at end-of-stream.
    ///
    /// Never holds two session locks at once: reciprocal registrations from
    /// different threads must not deadlock.
    pub fn set_next(&self, next: &Arc<Session>) -> Result<()> {
        if self.conn_id == next.conn_id {
            return Err(AudioError::Config("session cannot chain to itself".into()));
        }
        let successor = next.ensure_live_sink().ok();
        let ours = {
            let mut core = self.core.lock().unwrap();
            if core.state == SessionState::TornDown {
                return Err(AudioError::State {
                    op: "set next session",
                    state: "torn down",
                });
            }
            core.next = Some(next.clone());
            core.sink.clone()
        };
        // link the sinks when both exist already; a sink created after this
        // point is linked at end-of-stream instead
        if let (Some(SinkHandle::Live(current)), Some(successor)) = (ours, successor) {
            current.set_next_output(&successor)?;
        }
        Ok(())
    }

    /// Natural end-of-stream: loop, complete, or hand control (and, for live
    /// sinks, the device track) to the pre-registered successor.
    pub fn on_end_of_stream(&self) -> Result<EosOutcome> {
        let mut core = self.core.lock().unwrap();
        if core.state != SessionState::Started {
            return Err(AudioError::State {
                op: "finish stream",
                state: core.state.name(),
            });
        }
        if core.looping && core.next.is_none() {
            debug!(conn = self.conn_id, "looping at end of stream");
            return Ok(EosOutcome::Looped);
        }
        // cleared only once the hand-off has gone through
        match core.next.clone() {
            None => {
                if let Some(sink) = core.sink.clone() {
                    let _ = sink.as_sink().stop();
                }
                self.ledger.note_stop(self.uid);
                core.state = SessionState::Stopped;
                drop(core);
                self.client.notify(ClientEvent::PlaybackComplete);
                Ok(EosOutcome::Completed)
            }
            Some(next) => {
                let ours = core.sink.clone();
                drop(core);
                // everything that can fail happens before anything moves;
                // an error leaves this session Started with its track and
                // successor link intact
                next.ready_for_handoff()?;
                if let (Some(SinkHandle::Live(current)), Some(SinkHandle::Live(_)) | None) =
                    (&ours, next.sink())
                {
                    // the sink link may not be armed yet when the successor
                    // was registered before this sink existed
                    let successor = next.ensure_live_sink()?;
                    current.set_next_output(&successor)?;
                    current.switch_to_next_output()?;
                }
                let mut core = self.core.lock().unwrap();
                if core.state == SessionState::Started {
                    self.ledger.note_stop(self.uid);
                    core.state = SessionState::Stopped;
                }
                core.next = None;
                drop(core);
                self.client.notify(ClientEvent::PlaybackComplete);
                next.promote_after_handoff()?;
                info!(
                    from = self.conn_id,
                    to = next.conn_id,
                    "playback chained to successor session"
                );
                Ok(EosOutcome::Chained(next.conn_id))
            }
        }
    }

    // checked before the track moves so a failure cannot strand a running
    // switch
    fn ready_for_handoff(&self) -> Result<()> {
        let core = self.core.lock().unwrap();
        match core.state {
            SessionState::Prepared
            | SessionState::Started
            | SessionState::Paused
            | SessionState::Stopped => Ok(()),
            state => Err(AudioError::State {
                op: "take over playback",
                state: state.name(),
            }),
        }
    }

    // successor side of a chain: the hand-off already delivered a running
    // track, the session just has to account for it
    fn promote_after_handoff(&self) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        match core.state {
            SessionState::Prepared | SessionState::Stopped | SessionState::Paused => {}
            SessionState::Started => return Ok(()),
            state => {
                return Err(AudioError::State {
                    op: "promote successor",
                    state: state.name(),
                })
            }
        }
        self.ledger.note_start(self.uid, core.device_class);
        core.state = SessionState::Started;
        drop(core);
        self.client.notify(ClientEvent::StateChanged(SessionState::Started));
        Ok(())
    }

    /// Force the terminal state from anywhere: settle the ledger, release
    /// the sink, forget the successor.
    pub fn teardown(&self) {
        let mut core = self.core.lock().unwrap();
        if core.state == SessionState::TornDown {
            return;
        }
        if core.state == SessionState::Started {
            self.ledger.note_stop(self.uid);
        }
        if let Some(sink) = core.sink.take() {
            let _ = sink.as_sink().stop();
            let _ = sink.as_sink().close();
        }
        core.next = None;
        core.state = SessionState::TornDown;
        info!(conn = self.conn_id, uid = self.uid, "session torn down");
    }

    pub fn set_looping(&self, looping: bool) {
        self.core.lock().unwrap().looping = looping;
    }

    pub fn looping(&self) -> bool {
        self.core.lock().unwrap().looping
    }

    pub fn set_stream_type(&self, stream_type: StreamType) {
        self.core.lock().unwrap().stream_type = stream_type;
    }

    pub fn stream_type(&self) -> StreamType {
        self.core.lock().unwrap().stream_type
    }

    pub fn set_volume(&self, left: f32, right: f32) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        core.volume = (left, right);
        if let Some(sink) = core.sink.clone() {
            drop(core);
            sink.as_sink().set_volume(left, right)?;
        }
        Ok(())
    }

    /// Move the session's output to a different device class, settling the
    /// ledger across the change while playback continues.
    pub fn set_device_class(&self, class: DeviceClass) {
        let mut core = self.core.lock().unwrap();
        if core.device_class == class {
            return;
        }
        if core.state == SessionState::Started {
            self.ledger.note_device_change(self.uid, class);
        }
        core.device_class = class;
    }

    pub fn device_class(&self) -> DeviceClass {
        self.core.lock().unwrap().device_class
    }

    /// Record a metadata key as updated; duplicates collapse until drained.
    pub fn add_metadata_update(&self, key: u32) {
        let mut core = self.core.lock().unwrap();
        if core.metadata_updated.insert(key) {
            drop(core);
            self.client.notify(ClientEvent::MetadataUpdate(key));
        }
    }

    /// Drain the accumulated metadata-update set.
    pub fn take_metadata_updates(&self) -> Vec<u32> {
        let mut keys: Vec<u32> = self
            .core
            .lock()
            .unwrap()
            .metadata_updated
            .drain()
            .collect();
        keys.sort_unstable();
        keys
    }

    pub fn set_retransmit_endpoint(&self, endpoint: Option<SocketAddr>) {
        self.core.lock().unwrap().retransmit = endpoint;
    }

    pub fn retransmit_endpoint(&self) -> Option<SocketAddr> {
        self.core.lock().unwrap().retransmit
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}
