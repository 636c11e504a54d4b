//! # Playback Timeline
//!
//! Sample-accurate mono mixing buffer behind the hardware output stream. Sources
//! are placed at absolute frame positions, at the stream rate, on a timeline that
//! advances only as the device pulls audio, so "now" is the device clock, not the
//! wall clock. Conversion to the device rate happens after mixing.
//!
//! ## Key Features:
//! - **Absolute scheduling**: a source starts at an exact frame, never "as soon as possible"
//! - **Completion notices**: finished sources are reported over an unbounded channel
//! - **Silent clear**: flushed sources are dropped without a completion notice
//! - **Thread safety**: rendered from the audio thread, scheduled from the session task

use crate::audio::output::SourceId;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

struct TimelineSource {
    id: SourceId,
    start_frame: u64,
    samples: Arc<[f32]>,
}

impl TimelineSource {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

#[derive(Default)]
struct TimelineState {
    /// Frames rendered so far
    position: u64,
    sources: Vec<TimelineSource>,
}

/// Mono mixing timeline at a fixed sample rate.
pub struct PlaybackTimeline {
    sample_rate: u32,
    state: Mutex<TimelineState>,
    ended: mpsc::UnboundedSender<SourceId>,
}

impl PlaybackTimeline {
    pub fn new(sample_rate: u32, ended: mpsc::UnboundedSender<SourceId>) -> Self {
        Self {
            sample_rate,
            state: Mutex::new(TimelineState::default()),
            ended,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Current timeline position in seconds.
    pub fn now_secs(&self) -> f64 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.position as f64 / self.sample_rate as f64
    }

    /// Convert seconds on this timeline to a frame index.
    pub fn frame_at(&self, secs: f64) -> u64 {
        (secs.max(0.0) * self.sample_rate as f64).round() as u64
    }

    /// Place `samples` so the first one plays at `start_frame`.
    ///
    /// A start in the past is clamped to the current position.
    pub fn schedule(&self, id: SourceId, samples: Arc<[f32]>, start_frame: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let start_frame = start_frame.max(state.position);
        state.sources.push(TimelineSource {
            id,
            start_frame,
            samples,
        });
    }

    /// Drop every source without reporting any as ended.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let count = state.sources.len();
        state.sources.clear();
        count
    }

    /// Mix the next `out.len()` frames and advance the timeline.
    ///
    /// Called from the audio thread.
    pub fn render(&self, out: &mut [f32]) {
        let frames = out.len();
        out.fill(0.0);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let window_start = state.position;
        let window_end = window_start + frames as u64;

        for source in &state.sources {
            if source.start_frame >= window_end || source.end_frame() <= window_start {
                continue;
            }
            let from = source.start_frame.max(window_start);
            let to = source.end_frame().min(window_end);
            for frame in from..to {
                out[(frame - window_start) as usize] += source.samples[(frame - source.start_frame) as usize];
            }
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        state.position = window_end;
        let ended = &self.ended;
        state.sources.retain(|source| {
            if source.end_frame() <= window_end {
                // Receiver gone means the session is over; nothing to notify.
                let _ = ended.send(source.id);
                false
            } else {
                true
            }
        });
    }
}
