//! Test doubles for the device and network seams.

use crate::audio::capture::{CaptureDevice, CaptureHandle, FrameSink};
use crate::audio::output::{OutputDevice, OutputStream, PlaybackSink, SourceId};
use crate::audio::processor::AudioPayload;
use crate::audio::session::{StatusCallback, StatusEvent, VolumeCallback};
use crate::error::{SessionError, SessionResult};
use crate::websocket::{ChannelConnector, ChannelEvent, LiveChannel, SessionSetup};
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 2s");
}

pub fn status_recorder() -> (StatusCallback, Arc<Mutex<Vec<StatusEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    (Arc::new(move |event| sink.lock().unwrap().push(event)), events)
}

pub fn volume_recorder() -> (VolumeCallback, Arc<Mutex<Vec<f32>>>) {
    let levels = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&levels);
    (Arc::new(move |level| sink.lock().unwrap().push(level)), levels)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureBehaviour {
    Grant,
    Deny,
    Missing,
}

#[derive(Default)]
struct CaptureCounters {
    opens: AtomicUsize,
    open_streams: AtomicUsize,
    peak_streams: AtomicUsize,
}

/// Microphone that produces samples only when the test pushes them.
#[derive(Clone)]
pub struct FakeCaptureDevice {
    behaviour: CaptureBehaviour,
    sink: Arc<Mutex<Option<FrameSink>>>,
    counters: Arc<CaptureCounters>,
}

impl FakeCaptureDevice {
    pub fn new(behaviour: CaptureBehaviour) -> Self {
        Self {
            behaviour,
            sink: Arc::new(Mutex::new(None)),
            counters: Arc::new(CaptureCounters::default()),
        }
    }

    /// Deliver samples as if the device callback fired.
    pub fn push(&self, samples: &[f32]) {
        if let Some(sink) = self.sink.lock().unwrap().as_mut() {
            sink(samples);
        }
    }

    pub fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn open_streams(&self) -> usize {
        self.counters.open_streams.load(Ordering::SeqCst)
    }

    pub fn peak_streams(&self) -> usize {
        self.counters.peak_streams.load(Ordering::SeqCst)
    }
}

impl CaptureDevice for FakeCaptureDevice {
    fn open(&self, _sample_rate: u32, sink: FrameSink) -> SessionResult<CaptureHandle> {
        match self.behaviour {
            CaptureBehaviour::Deny => {
                return Err(SessionError::Permission("microphone access refused".to_string()))
            }
            CaptureBehaviour::Missing => {
                return Err(SessionError::Device("no microphone found".to_string()))
            }
            CaptureBehaviour::Grant => {}
        }

        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        let open = self.counters.open_streams.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_streams.fetch_max(open, Ordering::SeqCst);
        *self.sink.lock().unwrap() = Some(sink);

        let slot = Arc::clone(&self.sink);
        let counters = Arc::clone(&self.counters);
        Ok(CaptureHandle::new(move || {
            slot.lock().unwrap().take();
            counters.open_streams.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StartedSource {
    pub id: SourceId,
    pub start: f64,
    pub duration: f64,
}

#[derive(Default)]
struct ManualOutputState {
    now: f64,
    sample_rate: u32,
    playing: Vec<StartedSource>,
    started: Vec<StartedSource>,
    ended: Option<mpsc::UnboundedSender<SourceId>>,
    stopped_all: usize,
    closed: usize,
    open_streams: usize,
}

/// Output device whose clock only moves on `advance`.
#[derive(Clone, Default)]
pub struct ManualOutputDevice {
    state: Arc<Mutex<ManualOutputState>>,
}

impl ManualOutputDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the output clock and report every source that finished by then.
    pub fn advance(&self, secs: f64) {
        let mut state = self.state.lock().unwrap();
        state.now += secs;
        let now = state.now;
        let (finished, playing): (Vec<_>, Vec<_>) = state
            .playing
            .drain(..)
            .partition(|source| source.start + source.duration <= now + 1e-9);
        state.playing = playing;
        if let Some(ended) = &state.ended {
            for source in finished {
                let _ = ended.send(source.id);
            }
        }
    }

    pub fn now(&self) -> f64 {
        self.state.lock().unwrap().now
    }

    pub fn started(&self) -> Vec<StartedSource> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn playing(&self) -> usize {
        self.state.lock().unwrap().playing.len()
    }

    pub fn stopped_all(&self) -> usize {
        self.state.lock().unwrap().stopped_all
    }

    pub fn closed(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    pub fn open_streams(&self) -> usize {
        self.state.lock().unwrap().open_streams
    }
}

impl OutputDevice for ManualOutputDevice {
    fn open(&self, sample_rate: u32) -> SessionResult<OutputStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock().unwrap();
            state.sample_rate = sample_rate;
            state.ended = Some(tx);
            state.open_streams += 1;
        }
        Ok(OutputStream {
            sink: Box::new(ManualSink {
                state: Arc::clone(&self.state),
                closed: false,
            }),
            ended: rx,
        })
    }
}

struct ManualSink {
    state: Arc<Mutex<ManualOutputState>>,
    closed: bool,
}

impl PlaybackSink for ManualSink {
    fn now(&self) -> f64 {
        self.state.lock().unwrap().now
    }

    fn start(&mut self, id: SourceId, samples: Arc<[f32]>, at: f64) {
        let mut state = self.state.lock().unwrap();
        let source = StartedSource {
            id,
            start: at,
            duration: samples.len() as f64 / state.sample_rate as f64,
        };
        state.playing.push(source);
        state.started.push(source);
    }

    fn stop_all(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.playing.clear();
        state.stopped_all += 1;
    }

    fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.closed += 1;
        if !self.closed {
            self.closed = true;
            state.playing.clear();
            state.open_streams -= 1;
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConnectBehaviour {
    Accept,
    Fail(SessionError),
}

struct FakeRemote {
    frames: Option<mpsc::Receiver<AudioPayload>>,
    events: mpsc::Sender<ChannelEvent>,
    closer: CancellationToken,
}

#[derive(Default)]
struct ConnectorState {
    remotes: Vec<FakeRemote>,
    setups: Vec<SessionSetup>,
    peak_open: usize,
}

/// Remote agent scripted from the test.
#[derive(Clone)]
pub struct FakeConnector {
    behaviour: ConnectBehaviour,
    attempts: Arc<AtomicUsize>,
    hold: Option<Arc<Notify>>,
    state: Arc<Mutex<ConnectorState>>,
}

impl FakeConnector {
    pub fn new(behaviour: ConnectBehaviour) -> Self {
        Self {
            behaviour,
            attempts: Arc::new(AtomicUsize::new(0)),
            hold: None,
            state: Arc::new(Mutex::new(ConnectorState::default())),
        }
    }

    /// Handshakes stay pending until `release` is called.
    pub fn held(behaviour: ConnectBehaviour) -> (Self, Arc<Notify>) {
        let notify = Arc::new(Notify::new());
        let mut connector = Self::new(behaviour);
        connector.hold = Some(Arc::clone(&notify));
        (connector, notify)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn open_channels(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.remotes.iter().filter(|r| !r.closer.is_cancelled()).count()
    }

    pub fn peak_open_channels(&self) -> usize {
        self.state.lock().unwrap().peak_open
    }

    pub fn last_setup(&self) -> Option<SessionSetup> {
        self.state.lock().unwrap().setups.last().cloned()
    }

    /// Event sender of the most recent channel.
    pub fn events(&self) -> mpsc::Sender<ChannelEvent> {
        let state = self.state.lock().unwrap();
        state.remotes.last().expect("no channel opened").events.clone()
    }

    /// Frame receiver of the most recent channel.
    pub fn take_frames(&self) -> mpsc::Receiver<AudioPayload> {
        let mut state = self.state.lock().unwrap();
        state
            .remotes
            .last_mut()
            .and_then(|remote| remote.frames.take())
            .expect("no frames receiver available")
    }
}

impl ChannelConnector for FakeConnector {
    fn connect(&self, setup: SessionSetup) -> BoxFuture<'static, SessionResult<LiveChannel>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().setups.push(setup);

        let behaviour = self.behaviour.clone();
        let hold = self.hold.clone();
        let state = Arc::clone(&self.state);

        Box::pin(async move {
            if let Some(hold) = hold {
                hold.notified().await;
            }
            match behaviour {
                ConnectBehaviour::Fail(err) => Err(err),
                ConnectBehaviour::Accept => {
                    let (frames_tx, frames_rx) = mpsc::channel(16);
                    let (events_tx, events_rx) = mpsc::channel(64);
                    let closer = CancellationToken::new();

                    let mut state = state.lock().unwrap();
                    state.remotes.push(FakeRemote {
                        frames: Some(frames_rx),
                        events: events_tx,
                        closer: closer.clone(),
                    });
                    let open = state.remotes.iter().filter(|r| !r.closer.is_cancelled()).count();
                    state.peak_open = state.peak_open.max(open);

                    Ok(LiveChannel::new(frames_tx, events_rx, closer, None))
                }
            }
        })
    }
}
