//! # Session Manager
//!
//! Public facade over the connection gate, microphone capture, live channel, and
//! playback. One manager runs at most one session at a time.
//!
//! ## Guarantees:
//! - `connect()` fully tears down any previous session before starting a new one
//! - `connect()` and `disconnect()` never return errors; failures are reported
//!   once through the status callback and leave nothing open
//! - `disconnect()` is idempotent and may race an in-flight `connect()`
//! - No automatic retry: a failed session needs a new `connect()` call
//!
//! ## Usage Example:
//! ```no_run
//! use lexai_live::config::AppConfig;
//! use lexai_live::manager::SessionManager;
//! use lexai_live::persona::{ConnectRequest, Mode};
//! use std::sync::Arc;
//!
//! # async fn demo() {
//! let manager = SessionManager::new(AppConfig::default());
//! manager
//!     .connect(
//!         ConnectRequest::new(Mode::Cruise),
//!         Arc::new(|status| println!("{}", status.text)),
//!         Arc::new(|_level| {}),
//!     )
//!     .await;
//! manager.disconnect().await;
//! # }
//! ```

use crate::audio::capture::{CaptureDevice, CpalCaptureDevice};
use crate::audio::output::{CpalOutputDevice, OutputDevice};
use crate::audio::session::{
    SessionPhase, SessionSummary, StatusCallback, StatusReporter, VolumeCallback,
};
use crate::config::AppConfig;
use crate::connection::{ConnectionParams, SessionConnection};
use crate::error::SessionError;
use crate::gate::{Clock, ConnectionGate, GateDecision, SystemClock};
use crate::persona::{self, ConnectRequest};
use crate::websocket::{ChannelConnector, GeminiLiveConnector};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The collaborators a manager drives.
pub struct SessionComponents {
    pub capture: Arc<dyn CaptureDevice>,
    pub output: Arc<dyn OutputDevice>,
    pub connector: Arc<dyn ChannelConnector>,
    pub gate: Arc<ConnectionGate>,
    pub clock: Arc<dyn Clock>,
}

impl SessionComponents {
    /// Default devices, the hosted live endpoint, and the process-wide gate.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            capture: Arc::new(CpalCaptureDevice),
            output: Arc::new(CpalOutputDevice),
            connector: Arc::new(GeminiLiveConnector::new(
                config.live.clone(),
                config.audio.output_sample_rate,
            )),
            gate: ConnectionGate::shared(&config.rate_limit),
            clock: Arc::new(SystemClock),
        }
    }
}

struct ActiveSession {
    cancel: CancellationToken,
    task: JoinHandle<SessionSummary>,
}

pub struct SessionManager {
    config: Arc<AppConfig>,
    components: SessionComponents,
    /// Held for the whole of connect and disconnect, which serialises them.
    slot: tokio::sync::Mutex<Option<ActiveSession>>,
    /// Token of the newest connect that has not finished establishing yet.
    pending: Mutex<Option<(u64, CancellationToken)>>,
    generation: AtomicU64,
    phase: Arc<RwLock<SessionPhase>>,
    muted: Arc<AtomicBool>,
}

impl SessionManager {
    pub fn new(config: AppConfig) -> Self {
        let components = SessionComponents::from_config(&config);
        Self::with_components(config, components)
    }

    pub fn with_components(config: AppConfig, components: SessionComponents) -> Self {
        Self {
            config: Arc::new(config),
            components,
            slot: tokio::sync::Mutex::new(None),
            pending: Mutex::new(None),
            generation: AtomicU64::new(0),
            phase: Arc::new(RwLock::new(SessionPhase::Idle)),
            muted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start a session, replacing any current one. Resolves once the session is
    /// open or the attempt has failed, and returns the resulting phase.
    pub async fn connect(
        &self,
        request: ConnectRequest,
        on_status: StatusCallback,
        on_volume: VolumeCallback,
    ) -> SessionPhase {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        if let Some((_, previous)) = self.pending_lock().replace((generation, cancel.clone())) {
            debug!("Superseding an in-flight connect");
            previous.cancel();
        }

        let mut slot = self.slot.lock().await;
        self.shutdown_active(&mut slot).await;

        if cancel.is_cancelled() {
            // A disconnect or a newer connect arrived while we waited.
            self.clear_pending(generation);
            return self.phase();
        }

        let persona = Arc::new(persona::resolve(&request));
        let reporter = StatusReporter::new(on_status, Arc::clone(&persona), Arc::clone(&self.phase));

        if let GateDecision::Denied { retry_after } =
            self.components.gate.try_acquire(self.components.clock.as_ref())
        {
            warn!(retry_after_secs = retry_after.as_secs_f64(), "Connection attempt rate limited");
            reporter.fail(&SessionError::RateLimited { retry_after });
            self.clear_pending(generation);
            return self.phase();
        }

        info!(mode = %request.mode, in_character = persona.in_character, "Starting live session");
        let params = ConnectionParams {
            config: Arc::clone(&self.config),
            persona,
            capture: Arc::clone(&self.components.capture),
            output: Arc::clone(&self.components.output),
            connector: Arc::clone(&self.components.connector),
            muted: Arc::clone(&self.muted),
        };

        match SessionConnection::establish(params, cancel.clone(), reporter.clone(), on_volume).await {
            Ok(Some(connection)) => {
                let task = tokio::spawn(connection.run());
                *slot = Some(ActiveSession { cancel, task });
            }
            Ok(None) => {
                reporter.transition(SessionPhase::Closed);
            }
            Err(err) => {
                warn!("Live session could not be started: {}", err);
                reporter.fail(&err);
            }
        }

        self.clear_pending(generation);
        self.phase()
    }

    /// End the current session, or abandon one that is still connecting.
    pub async fn disconnect(&self) {
        if let Some((_, pending)) = self.pending_lock().take() {
            pending.cancel();
        }
        let mut slot = self.slot.lock().await;
        self.shutdown_active(&mut slot).await;
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while a session is connecting or open.
    pub fn is_active(&self) -> bool {
        let phase = self.phase();
        phase.is_open() || phase == SessionPhase::Connecting
    }

    /// Stop forwarding microphone audio without closing the session.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
        info!(muted, "Microphone mute changed");
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    async fn shutdown_active(&self, slot: &mut Option<ActiveSession>) -> Option<SessionSummary> {
        let active = slot.take()?;
        active.cancel.cancel();
        match active.task.await {
            Ok(summary) => Some(summary),
            Err(e) => {
                error!("Session task ended abnormally: {}", e);
                *self.phase.write().unwrap_or_else(PoisonError::into_inner) = SessionPhase::Closed;
                None
            }
        }
    }

    fn pending_lock(&self) -> std::sync::MutexGuard<'_, Option<(u64, CancellationToken)>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn clear_pending(&self, generation: u64) {
        let mut pending = self.pending_lock();
        if matches!(pending.as_ref(), Some((current, _)) if *current == generation) {
            pending.take();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some((_, pending)) = self.pending_lock().take() {
            pending.cancel();
        }
        // The session task tears itself down once cancelled.
        if let Ok(slot) = self.slot.try_lock() {
            if let Some(active) = slot.as_ref() {
                active.cancel.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::processor::AudioPayload;
    use crate::audio::session::StatusEvent;
    use crate::error::ErrorKind;
    use crate::gate::ManualClock;
    use crate::persona::Mode;
    use crate::testing::*;
    use crate::websocket::ChannelEvent;
    use std::time::Duration;

    struct Harness {
        capture: FakeCaptureDevice,
        output: ManualOutputDevice,
        connector: FakeConnector,
        clock: Arc<ManualClock>,
        manager: Arc<SessionManager>,
        events: Arc<Mutex<Vec<StatusEvent>>>,
        levels: Arc<Mutex<Vec<f32>>>,
        on_status: StatusCallback,
        on_volume: VolumeCallback,
    }

    impl Harness {
        fn new(capture: CaptureBehaviour, connector: FakeConnector) -> Self {
            let capture = FakeCaptureDevice::new(capture);
            let output = ManualOutputDevice::new();
            let clock = Arc::new(ManualClock::new());
            let config = AppConfig::default();
            let components = SessionComponents {
                capture: Arc::new(capture.clone()),
                output: Arc::new(output.clone()),
                connector: Arc::new(connector.clone()),
                gate: Arc::new(ConnectionGate::new(&config.rate_limit)),
                clock: clock.clone(),
            };
            let (on_status, events) = status_recorder();
            let (on_volume, levels) = volume_recorder();
            Self {
                capture,
                output,
                connector,
                clock,
                manager: Arc::new(SessionManager::with_components(config, components)),
                events,
                levels,
                on_status,
                on_volume,
            }
        }

        fn accepting() -> Self {
            Self::new(CaptureBehaviour::Grant, FakeConnector::new(ConnectBehaviour::Accept))
        }

        async fn connect(&self) -> SessionPhase {
            self.manager
                .connect(
                    ConnectRequest::new(Mode::Cruise),
                    self.on_status.clone(),
                    self.on_volume.clone(),
                )
                .await
        }

        fn phases(&self) -> Vec<SessionPhase> {
            self.events.lock().unwrap().iter().map(|e| e.phase).collect()
        }

        fn assert_released(&self) {
            assert_eq!(self.capture.open_streams(), 0, "capture still open");
            assert_eq!(self.output.open_streams(), 0, "output still open");
            assert_eq!(self.connector.open_channels(), 0, "channel still open");
        }
    }

    fn half_second() -> AudioPayload {
        AudioPayload::from_samples(&vec![0.1; 12_000], 24_000)
    }

    #[tokio::test]
    async fn test_lifecycle_status_sequence() {
        let h = Harness::accepting();
        assert_eq!(h.connect().await, SessionPhase::Listening);
        assert_eq!(h.phases(), vec![SessionPhase::Connecting, SessionPhase::Listening]);

        h.connector.events().send(ChannelEvent::Audio(half_second())).await.unwrap();
        wait_for(|| h.manager.phase() == SessionPhase::Speaking).await;

        h.output.advance(0.5);
        wait_for(|| h.manager.phase() == SessionPhase::Listening).await;
        assert_eq!(
            h.phases(),
            vec![
                SessionPhase::Connecting,
                SessionPhase::Listening,
                SessionPhase::Speaking,
                SessionPhase::Listening,
            ]
        );

        h.manager.disconnect().await;
        assert_eq!(h.manager.phase(), SessionPhase::Closed);
        assert_eq!(
            &h.phases()[4..],
            &[SessionPhase::Closing, SessionPhase::Closed]
        );
        h.assert_released();
    }

    #[tokio::test]
    async fn test_permission_failure_never_reaches_network() {
        let h = Harness::new(CaptureBehaviour::Deny, FakeConnector::new(ConnectBehaviour::Accept));
        let phase = h.connect().await;

        assert_eq!(phase, SessionPhase::Errored(ErrorKind::Permission));
        assert_eq!(h.phases(), vec![SessionPhase::Errored(ErrorKind::Permission)]);
        assert_eq!(h.connector.attempts(), 0);
        assert!(!h.manager.is_active());
        h.assert_released();
    }

    #[tokio::test]
    async fn test_missing_microphone_is_device_error() {
        let h = Harness::new(CaptureBehaviour::Missing, FakeConnector::new(ConnectBehaviour::Accept));
        assert_eq!(h.connect().await, SessionPhase::Errored(ErrorKind::Device));
        assert_eq!(h.connector.attempts(), 0);
    }

    #[tokio::test]
    async fn test_sixth_connect_within_window_is_rate_limited() {
        let h = Harness::accepting();
        for _ in 0..5 {
            assert_eq!(h.connect().await, SessionPhase::Listening);
            h.manager.disconnect().await;
            h.clock.advance(Duration::from_secs(2));
        }

        assert_eq!(h.connect().await, SessionPhase::Errored(ErrorKind::RateLimited));
        let last = h.events.lock().unwrap().last().cloned().unwrap();
        let retry_after = last.retry_after.unwrap().as_secs_f64();
        assert!((retry_after - 50.0).abs() < 1.0, "retry_after = {}", retry_after);
        assert!(last.text.contains("50s"));
        assert_eq!(h.connector.attempts(), 5);
        assert_eq!(h.capture.opens(), 5);
        h.assert_released();
    }

    #[tokio::test]
    async fn test_second_connect_replaces_first_session() {
        let h = Harness::accepting();
        h.connect().await;
        h.connect().await;

        assert_eq!(h.capture.peak_streams(), 1);
        assert_eq!(h.connector.peak_open_channels(), 1);
        assert_eq!(h.capture.open_streams(), 1);
        assert_eq!(h.connector.open_channels(), 1);
        assert_eq!(
            h.phases(),
            vec![
                SessionPhase::Connecting,
                SessionPhase::Listening,
                SessionPhase::Closing,
                SessionPhase::Closed,
                SessionPhase::Connecting,
                SessionPhase::Listening,
            ]
        );

        h.manager.disconnect().await;
        h.assert_released();
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_concurrent_safe() {
        let h = Harness::accepting();
        h.manager.disconnect().await;
        assert_eq!(h.manager.phase(), SessionPhase::Idle);

        h.connect().await;
        tokio::join!(h.manager.disconnect(), h.manager.disconnect());
        h.manager.disconnect().await;

        assert_eq!(h.manager.phase(), SessionPhase::Closed);
        let closed = h.phases().iter().filter(|p| **p == SessionPhase::Closed).count();
        assert_eq!(closed, 1);
        h.assert_released();
    }

    #[tokio::test]
    async fn test_disconnect_during_handshake() {
        let (connector, release) = FakeConnector::held(ConnectBehaviour::Accept);
        let h = Harness::new(CaptureBehaviour::Grant, connector);

        let manager = Arc::clone(&h.manager);
        let (on_status, on_volume) = (h.on_status.clone(), h.on_volume.clone());
        let connecting = tokio::spawn(async move {
            manager
                .connect(ConnectRequest::new(Mode::Serious), on_status, on_volume)
                .await
        });

        wait_for(|| h.connector.attempts() == 1).await;
        assert_eq!(h.manager.phase(), SessionPhase::Connecting);

        h.manager.disconnect().await;
        assert_eq!(connecting.await.unwrap(), SessionPhase::Closed);
        assert_eq!(h.phases(), vec![SessionPhase::Connecting, SessionPhase::Closed]);

        // A late handshake completion has nothing to attach to.
        release.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.assert_released();
    }

    #[tokio::test]
    async fn test_overlapping_connects_keep_only_the_newest() {
        let (connector, release) = FakeConnector::held(ConnectBehaviour::Accept);
        let h = Harness::new(CaptureBehaviour::Grant, connector);

        let spawn_connect = |mode: Mode| {
            let manager = Arc::clone(&h.manager);
            let (on_status, on_volume) = (h.on_status.clone(), h.on_volume.clone());
            tokio::spawn(async move { manager.connect(ConnectRequest::new(mode), on_status, on_volume).await })
        };

        let first = spawn_connect(Mode::Cruise);
        wait_for(|| h.connector.attempts() == 1).await;

        let second = spawn_connect(Mode::Serious);
        wait_for(|| h.connector.attempts() == 2).await;
        release.notify_one();

        assert_eq!(first.await.unwrap(), SessionPhase::Closed);
        assert_eq!(second.await.unwrap(), SessionPhase::Listening);
        assert_eq!(h.manager.phase(), SessionPhase::Listening);
        assert_eq!(h.capture.peak_streams(), 1);
        assert!(h.connector.peak_open_channels() <= 1);
        assert_eq!(h.connector.open_channels(), 1);

        h.manager.disconnect().await;
        h.assert_released();
    }

    #[tokio::test]
    async fn test_barge_in_flushes_and_resets_cursor() {
        let h = Harness::accepting();
        h.connect().await;
        let events = h.connector.events();

        events.send(ChannelEvent::Audio(half_second())).await.unwrap();
        events.send(ChannelEvent::Audio(half_second())).await.unwrap();
        wait_for(|| h.output.started().len() == 2).await;
        assert_eq!(h.manager.phase(), SessionPhase::Speaking);

        h.output.advance(0.1);
        events.send(ChannelEvent::Interrupted).await.unwrap();
        wait_for(|| h.manager.phase() == SessionPhase::Listening).await;
        assert_eq!(h.output.playing(), 0);
        assert!(h.output.stopped_all() >= 1);

        events.send(ChannelEvent::Audio(half_second())).await.unwrap();
        wait_for(|| h.output.started().len() == 3).await;
        let third = h.output.started()[2];
        assert!((third.start - h.output.now()).abs() < 1e-9);
        assert!(third.start < 1.0);

        h.manager.disconnect().await;
        h.assert_released();
    }

    #[tokio::test]
    async fn test_service_unavailable_handshake() {
        let connector = FakeConnector::new(ConnectBehaviour::Fail(SessionError::ServiceUnavailable(
            "closed with code 1013".to_string(),
        )));
        let h = Harness::new(CaptureBehaviour::Grant, connector);

        assert_eq!(h.connect().await, SessionPhase::Errored(ErrorKind::ServiceUnavailable));
        assert_eq!(
            h.phases(),
            vec![SessionPhase::Connecting, SessionPhase::Errored(ErrorKind::ServiceUnavailable)]
        );
        h.assert_released();
    }

    #[tokio::test]
    async fn test_remote_close_tears_down() {
        let h = Harness::accepting();
        h.connect().await;
        h.connector
            .events()
            .send(ChannelEvent::Closed { reason: "bye".to_string() })
            .await
            .unwrap();

        wait_for(|| h.manager.phase() == SessionPhase::Closed).await;
        wait_for(|| h.capture.open_streams() == 0).await;
        h.assert_released();
        h.manager.disconnect().await;
        assert_eq!(h.phases().last(), Some(&SessionPhase::Closed));
    }

    #[tokio::test]
    async fn test_channel_failure_reports_once() {
        let h = Harness::accepting();
        h.connect().await;
        h.connector
            .events()
            .send(ChannelEvent::Failed(SessionError::Network("reset".to_string())))
            .await
            .unwrap();

        wait_for(|| h.manager.phase() == SessionPhase::Errored(ErrorKind::Network)).await;
        h.manager.disconnect().await;
        let errors = h
            .phases()
            .iter()
            .filter(|p| matches!(p, SessionPhase::Errored(_)))
            .count();
        assert_eq!(errors, 1);
        h.assert_released();
    }

    #[tokio::test]
    async fn test_frames_reach_channel_and_volume_is_reported() {
        let h = Harness::accepting();
        h.connect().await;
        let mut frames = h.connector.take_frames();

        h.capture.push(&vec![0.1; 4096]);
        let frame = tokio::time::timeout(Duration::from_secs(1), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.mime_type(), "audio/pcm;rate=16000");
        assert_eq!(frame.sample_count(), 4096);

        let levels = h.levels.lock().unwrap().clone();
        assert_eq!(levels.len(), 1);
        assert!((levels[0] - 0.5).abs() < 1e-3);

        h.manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_muted_microphone_sends_nothing() {
        let h = Harness::accepting();
        h.manager.set_muted(true);
        h.connect().await;
        let mut frames = h.connector.take_frames();

        h.capture.push(&vec![0.1; 4096]);
        let received = tokio::time::timeout(Duration::from_millis(50), frames.recv()).await;
        assert!(received.is_err());
        assert_eq!(*h.levels.lock().unwrap(), vec![0.0]);
        assert!(h.manager.is_muted());

        h.manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_override_persona_reaches_setup() {
        let h = Harness::accepting();
        h.manager
            .connect(
                ConnectRequest::new(Mode::Cruise).with_persona("Act as Chief the landlord"),
                h.on_status.clone(),
                h.on_volume.clone(),
            )
            .await;

        let setup = h.connector.last_setup().unwrap();
        assert_eq!(setup.voice_name(), "Fenrir");
        let text = setup.system_instruction.parts[0].text.clone().unwrap();
        assert!(text.contains("Act as Chief the landlord"));
        h.manager.disconnect().await;
    }
}
