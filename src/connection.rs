//! # Session Connection
//!
//! The state machine that binds microphone capture, the live channel, and the
//! playback scheduler for one session.
//!
//! ## Phases:
//! ```text
//! Idle → Connecting → Listening ⇄ Speaking → Closing → Closed
//!            │             │          │
//!            └─────────────┴──────────┴──→ Errored(kind)
//! ```
//!
//! ## Pipeline:
//! - Capture thread → bounded frame queue → session task → channel outbound queue
//! - Channel driver → bounded event queue → session task → scheduler
//! - Output device → ended notices → session task (drain detection)
//!
//! All scheduler state is touched only by the session task. A single
//! cancellation token stops the capture callback, the handshake, and the loop.

use crate::audio::capture::{AudioCaptureBridge, CaptureDevice};
use crate::audio::output::{OutputDevice, SourceId};
use crate::audio::playback::PlaybackScheduler;
use crate::audio::processor::AudioPayload;
use crate::audio::session::{
    SessionPhase, SessionStats, SessionSummary, StatusReporter, VolumeCallback,
};
use crate::config::AppConfig;
use crate::error::{SessionError, SessionResult};
use crate::persona::Persona;
use crate::websocket::{ChannelConnector, ChannelEvent, LiveChannel, SessionSetup};
use chrono::{DateTime, Utc};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Collaborators and settings for one session.
pub struct ConnectionParams {
    pub config: Arc<AppConfig>,
    pub persona: Arc<Persona>,
    pub capture: Arc<dyn CaptureDevice>,
    pub output: Arc<dyn OutputDevice>,
    pub connector: Arc<dyn ChannelConnector>,
    pub muted: Arc<AtomicBool>,
}

/// An open session, ready to `run`.
pub struct SessionConnection {
    id: Uuid,
    config: Arc<AppConfig>,
    reporter: StatusReporter,
    cancel: CancellationToken,
    capture: AudioCaptureBridge,
    frames: mpsc::Receiver<AudioPayload>,
    scheduler: PlaybackScheduler,
    ended: mpsc::UnboundedReceiver<SourceId>,
    channel: LiveChannel,
    stats: Arc<SessionStats>,
    started_at: DateTime<Utc>,
    started: Instant,
    consecutive_send_failures: u32,
}

enum LoopInput {
    Cancelled,
    Channel(Option<ChannelEvent>),
    SourceEnded(SourceId),
    Frame(AudioPayload),
}

enum Flow {
    Continue,
    Stop(String),
}

impl SessionConnection {
    /// Acquire the microphone, open the output, and complete the channel handshake.
    ///
    /// Returns `Ok(None)` if `cancel` fired first. On error everything acquired so
    /// far has been released; reporting the error is left to the caller.
    pub async fn establish(
        params: ConnectionParams,
        cancel: CancellationToken,
        reporter: StatusReporter,
        on_volume: VolumeCallback,
    ) -> SessionResult<Option<Self>> {
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let id = Uuid::new_v4();
        let config = params.config;
        let stats = Arc::new(SessionStats::default());

        let mut capture = AudioCaptureBridge::new(params.capture, params.muted);
        let (frames_tx, frames_rx) = mpsc::channel(config.live.outbound_queue);
        capture
            .start(&config.audio, cancel.clone(), frames_tx, on_volume, Arc::clone(&stats))
            .await?;

        reporter.transition(SessionPhase::Connecting);
        debug!(session_id = %id, voice = reporter.persona().voice, "Connecting live session");

        let output_rate = config.audio.output_sample_rate;
        let output = params.output;
        let stream = match tokio::task::spawn_blocking(move || output.open(output_rate)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                capture.shutdown().await;
                return Err(e);
            }
            Err(e) => {
                capture.shutdown().await;
                return Err(SessionError::Internal(format!("output start-up task failed: {}", e)));
            }
        };
        let mut scheduler = PlaybackScheduler::new(stream.sink, output_rate);

        let setup = SessionSetup::new(&config.live, &params.persona);
        let connected = tokio::select! {
            _ = cancel.cancelled() => None,
            result = params.connector.connect(setup) => Some(result),
        };

        let mut channel = match connected {
            None => {
                debug!(session_id = %id, "Handshake abandoned");
                capture.shutdown().await;
                scheduler.shutdown().await;
                return Ok(None);
            }
            Some(Err(e)) => {
                capture.shutdown().await;
                scheduler.shutdown().await;
                return Err(e);
            }
            Some(Ok(channel)) => channel,
        };

        if cancel.is_cancelled() {
            capture.shutdown().await;
            scheduler.shutdown().await;
            channel.close().await;
            return Ok(None);
        }

        capture.set_forwarding(true);
        reporter.transition(SessionPhase::Listening);
        info!(session_id = %id, "Live session open");

        Ok(Some(Self {
            id,
            config,
            reporter,
            cancel,
            capture,
            frames: frames_rx,
            scheduler,
            ended: stream.ended,
            channel,
            stats,
            started_at: Utc::now(),
            started: Instant::now(),
            consecutive_send_failures: 0,
        }))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Drive the session until it is cancelled, the remote side closes, or it fails.
    pub async fn run(mut self) -> SessionSummary {
        let outcome = loop {
            let input = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => LoopInput::Cancelled,
                event = self.channel.inbound.recv() => LoopInput::Channel(event),
                Some(id) = self.ended.recv() => LoopInput::SourceEnded(id),
                Some(frame) = self.frames.recv() => LoopInput::Frame(frame),
            };

            let step = match input {
                LoopInput::Cancelled => Ok(Flow::Stop("disconnect requested".to_string())),
                LoopInput::Channel(None) => Ok(Flow::Stop("channel dropped".to_string())),
                LoopInput::Channel(Some(event)) => self.handle_event(event),
                LoopInput::SourceEnded(id) => {
                    self.handle_source_ended(id);
                    Ok(Flow::Continue)
                }
                LoopInput::Frame(frame) => self.forward_frame(frame),
            };

            match step {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop(reason)) => break Ok(reason),
                Err(err) => break Err(err),
            }
        };

        match outcome {
            Ok(reason) => {
                info!(session_id = %self.id, reason = %reason, "Closing live session");
                self.reporter.transition(SessionPhase::Closing);
                self.teardown().await;
                self.reporter.transition(SessionPhase::Closed);
            }
            Err(err) => {
                error!(session_id = %self.id, "Live session failed: {}", err);
                self.teardown().await;
                self.reporter.fail(&err);
            }
        }

        let summary = SessionSummary::collect(
            self.id,
            self.started_at,
            self.started,
            &self.stats,
            self.reporter.phase(),
        );
        summary.log();
        summary
    }

    fn handle_event(&mut self, event: ChannelEvent) -> SessionResult<Flow> {
        match event {
            ChannelEvent::Audio(payload) => {
                SessionStats::record(&self.stats.payloads_received);
                match self.scheduler.enqueue(&payload) {
                    Ok(_) => {
                        self.reporter.transition(SessionPhase::Speaking);
                    }
                    Err(e) => warn!(session_id = %self.id, "Dropping unplayable audio payload: {}", e),
                }
            }
            ChannelEvent::Interrupted => {
                SessionStats::record(&self.stats.interruptions);
                let dropped = self.scheduler.flush();
                debug!(session_id = %self.id, dropped, "Barge-in");
                self.reporter.transition(SessionPhase::Listening);
            }
            ChannelEvent::TurnComplete => {
                debug!(session_id = %self.id, "Agent turn complete");
            }
            ChannelEvent::GoAway { time_left } => {
                warn!(session_id = %self.id, time_left = ?time_left, "Remote side is going away");
            }
            ChannelEvent::Closed { reason } => return Ok(Flow::Stop(reason)),
            ChannelEvent::Failed(err) => return Err(err),
        }
        Ok(Flow::Continue)
    }

    fn handle_source_ended(&mut self, id: SourceId) {
        let drained = self.scheduler.source_ended(id);
        if drained && self.reporter.phase() == SessionPhase::Speaking {
            self.reporter.transition(SessionPhase::Listening);
        }
    }

    fn forward_frame(&mut self, frame: AudioPayload) -> SessionResult<Flow> {
        match self.channel.outbound.try_send(frame) {
            Ok(()) => {
                SessionStats::record(&self.stats.frames_sent);
                self.consecutive_send_failures = 0;
                Ok(Flow::Continue)
            }
            Err(TrySendError::Full(_)) => {
                SessionStats::record(&self.stats.frames_dropped);
                self.consecutive_send_failures += 1;
                warn!(
                    session_id = %self.id,
                    failures = self.consecutive_send_failures,
                    "Channel not keeping up, dropping frame"
                );
                if self.consecutive_send_failures >= self.config.live.max_consecutive_send_failures {
                    return Err(SessionError::Network(format!(
                        "{} consecutive frames could not be sent",
                        self.consecutive_send_failures
                    )));
                }
                Ok(Flow::Continue)
            }
            Err(TrySendError::Closed(_)) => {
                Err(SessionError::Network("channel closed while sending audio".to_string()))
            }
        }
    }

    /// Release everything in order. Every step tolerates having already run.
    async fn teardown(&mut self) {
        self.cancel.cancel();
        self.capture.set_forwarding(false);
        self.frames.close();
        self.scheduler.flush();
        self.capture.shutdown().await;
        self.channel.close().await;
        self.scheduler.shutdown().await;
        debug!(session_id = %self.id, "Session resources released");
    }
}
