//! # Session Phase and Status Reporting
//!
//! The explicit lifecycle phase of a live session, the status events emitted to
//! the UI, and the per-session statistics summarised at teardown.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: nothing running
//! 2. **Connecting**: device acquired, channel handshake in progress
//! 3. **Listening**: channel open, microphone frames flowing
//! 4. **Speaking**: agent audio is scheduled or playing
//! 5. **Closing**: teardown in progress
//! 6. **Closed**: everything released
//! 7. **Errored(kind)**: the attempt or session failed, everything released
//!
//! [`SessionPhase`] is the single source of truth. Status text is rendered from it
//! by the persona and is never parsed back.

use crate::error::{ErrorKind, SessionError};
use crate::persona::Persona;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// Lifecycle phase of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Listening,
    Speaking,
    Closing,
    Closed,
    Errored(ErrorKind),
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Connecting => "connecting",
            SessionPhase::Listening => "listening",
            SessionPhase::Speaking => "speaking",
            SessionPhase::Closing => "closing",
            SessionPhase::Closed => "closed",
            SessionPhase::Errored(_) => "errored",
        }
    }

    /// Channel open (Listening or Speaking).
    pub fn is_open(&self) -> bool {
        matches!(self, SessionPhase::Listening | SessionPhase::Speaking)
    }

    /// No session resources are held in this phase.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionPhase::Idle | SessionPhase::Closed | SessionPhase::Errored(_)
        )
    }
}

/// One observation delivered to the status callback.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub phase: SessionPhase,
    /// Human-readable, descriptive only
    pub text: String,
    pub retry_after: Option<Duration>,
    pub at: DateTime<Utc>,
}

pub type StatusCallback = Arc<dyn Fn(StatusEvent) + Send + Sync>;
pub type VolumeCallback = Arc<dyn Fn(f32) + Send + Sync>;

/// Publishes phase transitions for one session to the caller.
///
/// The phase cell is shared with the manager so `SessionManager::phase()` always
/// reflects the last emitted phase.
#[derive(Clone)]
pub struct StatusReporter {
    callback: StatusCallback,
    persona: Arc<Persona>,
    phase: Arc<RwLock<SessionPhase>>,
}

impl StatusReporter {
    pub fn new(callback: StatusCallback, persona: Arc<Persona>, phase: Arc<RwLock<SessionPhase>>) -> Self {
        Self {
            callback,
            persona,
            phase,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    /// Move to `phase` and notify. Returns false (and emits nothing) if already there.
    pub fn transition(&self, phase: SessionPhase) -> bool {
        {
            let mut current = self.phase.write().unwrap_or_else(PoisonError::into_inner);
            if *current == phase {
                return false;
            }
            debug!(from = current.as_str(), to = phase.as_str(), "Session phase change");
            *current = phase;
        }
        (self.callback)(StatusEvent {
            phase,
            text: self.persona.status_text(&phase),
            retry_after: None,
            at: Utc::now(),
        });
        true
    }

    /// Record a failure. Always emits, even if the phase was already errored.
    pub fn fail(&self, error: &SessionError) {
        let phase = SessionPhase::Errored(error.kind());
        {
            let mut current = self.phase.write().unwrap_or_else(PoisonError::into_inner);
            *current = phase;
        }
        (self.callback)(StatusEvent {
            phase,
            text: self.persona.error_text(error),
            retry_after: error.retry_after(),
            at: Utc::now(),
        });
    }
}

/// Counters updated from the capture thread and the session task.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub frames_sent: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub payloads_received: AtomicU64,
    pub interruptions: AtomicU64,
}

impl SessionStats {
    pub fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// What happened during one session, produced at teardown.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub payloads_received: u64,
    pub interruptions: u64,
    pub final_phase: SessionPhase,
}

impl SessionSummary {
    pub fn collect(
        session_id: Uuid,
        started_at: DateTime<Utc>,
        started: Instant,
        stats: &SessionStats,
        final_phase: SessionPhase,
    ) -> Self {
        Self {
            session_id,
            started_at,
            duration: started.elapsed(),
            frames_sent: stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: stats.frames_dropped.load(Ordering::Relaxed),
            payloads_received: stats.payloads_received.load(Ordering::Relaxed),
            interruptions: stats.interruptions.load(Ordering::Relaxed),
            final_phase,
        }
    }

    pub fn log(&self) {
        info!(
            session_id = %self.session_id,
            duration_ms = self.duration.as_millis() as u64,
            frames_sent = self.frames_sent,
            frames_dropped = self.frames_dropped,
            payloads_received = self.payloads_received,
            interruptions = self.interruptions,
            final_phase = self.final_phase.as_str(),
            "Live session ended"
        );
    }
}
