//! # Connection Gate
//!
//! Process-wide sliding-window rate limiter that decides whether a new live
//! session may be opened. The attempt log is shared by every `SessionManager`
//! in the process so that re-creating a manager does not reset the quota.
//!
//! ## Policy:
//! - The log keeps attempt timestamps younger than the window
//! - An attempt is denied when the pruned log already holds `max_attempts` entries
//! - Allowed attempts are recorded before the connection proceeds, so a failed
//!   connection still counts against the quota
//! - Denied attempts are not recorded and never queued

use crate::config::RateLimitConfig;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Shared gate for the whole process (see [`ConnectionGate::shared`]).
static SHARED_GATE: OnceLock<Arc<ConnectionGate>> = OnceLock::new();

/// Source of "now" for the gate, injectable for deterministic tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }

    /// Jump to `at` past the origin. Never moves backwards.
    pub fn set(&self, at: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        if at > *offset {
            *offset = at;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outcome of [`ConnectionGate::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allowed,
    /// Denied until the oldest in-window attempt expires.
    Denied { retry_after: Duration },
}

/// Sliding-window limiter over connection attempts.
#[derive(Debug)]
pub struct ConnectionGate {
    max_attempts: usize,
    window: Duration,
    attempts: Mutex<VecDeque<Instant>>,
}

impl ConnectionGate {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            window: config.window(),
            attempts: Mutex::new(VecDeque::with_capacity(config.max_attempts)),
        }
    }

    /// The process-wide gate.
    ///
    /// The first caller's limits win. Later callers asking for different limits
    /// get the existing gate and a warning.
    pub fn shared(config: &RateLimitConfig) -> Arc<ConnectionGate> {
        let gate = SHARED_GATE.get_or_init(|| Arc::new(ConnectionGate::new(config)));
        if gate.max_attempts != config.max_attempts || gate.window != config.window() {
            warn!(
                max_attempts = gate.max_attempts,
                window_secs = gate.window.as_secs(),
                "Connection gate already initialised with different limits; keeping the existing ones"
            );
        }
        Arc::clone(gate)
    }

    /// Try to take a connection slot at `clock.now()`.
    pub fn try_acquire(&self, clock: &dyn Clock) -> GateDecision {
        let now = clock.now();
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        self.prune(&mut attempts, now);

        if attempts.len() >= self.max_attempts {
            // Oldest entry is still inside the window after pruning.
            let oldest = attempts.front().copied().unwrap_or(now);
            let retry_after = self
                .window
                .saturating_sub(now.saturating_duration_since(oldest));
            debug!(
                in_window = attempts.len(),
                retry_after_ms = retry_after.as_millis() as u64,
                "Connection attempt denied"
            );
            return GateDecision::Denied { retry_after };
        }

        attempts.push_back(now);
        debug!(in_window = attempts.len(), "Connection attempt allowed");
        GateDecision::Allowed
    }

    /// Number of attempts currently inside the window.
    pub fn attempts_in_window(&self, clock: &dyn Clock) -> usize {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        self.prune(&mut attempts, clock.now());
        attempts.len()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn prune(&self, attempts: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = attempts.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                attempts.pop_front();
            } else {
                break;
            }
        }
    }
}
