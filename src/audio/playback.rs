//! # Playback Scheduler
//!
//! Gapless scheduling of agent speech on the output timeline.
//!
//! ## Key Features:
//! - **Single cursor**: `next_start` only moves forward while a turn plays, so
//!   consecutive buffers neither overlap nor leave a gap
//! - **Late start**: if the cursor has fallen behind the output clock, the next
//!   buffer starts "now" instead of in the past
//! - **Barge-in**: `flush()` stops everything and resets the cursor to the clock
//! - **Drain detection**: `source_ended` reports when the last active buffer finished
//!
//! Owned by the session task; all mutation happens on that task.

use crate::audio::output::{PlaybackSink, SourceId};
use crate::audio::processor::{resample, AudioPayload};
use crate::error::{SessionError, SessionResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// A buffer placed on the output timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub id: SourceId,
    /// Start time on the output clock, in seconds
    pub start: f64,
    pub duration: f64,
}

impl ScheduledSource {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

pub struct PlaybackScheduler {
    /// `None` once closed
    sink: Option<Box<dyn PlaybackSink>>,
    sample_rate: u32,
    next_start: f64,
    active: HashMap<SourceId, ScheduledSource>,
    next_id: SourceId,
}

impl PlaybackScheduler {
    /// `sample_rate` is the rate the sink was opened at.
    pub fn new(sink: Box<dyn PlaybackSink>, sample_rate: u32) -> Self {
        let next_start = sink.now();
        Self {
            sink: Some(sink),
            sample_rate,
            next_start,
            active: HashMap::new(),
            next_id: 1,
        }
    }

    /// Decode `payload` and schedule it right after everything already queued.
    pub fn enqueue(&mut self, payload: &AudioPayload) -> SessionResult<ScheduledSource> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(SessionError::Internal("playback scheduler is closed".to_string()));
        };

        let mut samples = payload.to_samples()?;
        if samples.is_empty() {
            return Err(SessionError::Network("received an empty audio payload".to_string()));
        }
        if payload.sample_rate != self.sample_rate {
            samples = resample(&samples, payload.sample_rate, self.sample_rate)?;
        }

        let duration = samples.len() as f64 / self.sample_rate as f64;
        let start = self.next_start.max(sink.now());
        let id = self.next_id;
        self.next_id += 1;

        sink.start(id, Arc::from(samples), start);
        self.next_start = start + duration;

        let source = ScheduledSource { id, start, duration };
        self.active.insert(id, source);
        trace!(id, start, duration, active = self.active.len(), "Scheduled playback source");
        Ok(source)
    }

    /// Stop and discard every scheduled buffer. Returns how many were dropped.
    pub fn flush(&mut self) -> usize {
        let dropped = self.active.len();
        if let Some(sink) = self.sink.as_mut() {
            sink.stop_all();
            self.next_start = sink.now();
        }
        self.active.clear();
        if dropped > 0 {
            debug!(dropped, "Flushed playback");
        }
        dropped
    }

    /// Completion notice for `id`. Returns true when this emptied the active set.
    ///
    /// Notices for unknown ids (already flushed) are ignored.
    pub fn source_ended(&mut self, id: SourceId) -> bool {
        if self.active.remove(&id).is_none() {
            return false;
        }
        self.active.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    /// Cursor position for the next buffer.
    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    /// Flush and release the output device. Idempotent.
    pub fn close(&mut self) {
        self.flush();
        if let Some(mut sink) = self.sink.take() {
            sink.close();
        }
    }

    /// Like [`close`](Self::close), but the device is released on the blocking pool.
    pub async fn shutdown(&mut self) {
        self.flush();
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = tokio::task::spawn_blocking(move || sink.close()).await {
                warn!("Output release task failed: {}", e);
            }
        }
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualOutputDevice;
    use crate::audio::output::OutputDevice;

    fn payload(secs: f64, rate: u32) -> AudioPayload {
        let samples = vec![0.1; (secs * rate as f64).round() as usize];
        AudioPayload::from_samples(&samples, rate)
    }

    fn scheduler() -> (PlaybackScheduler, ManualOutputDevice, tokio::sync::mpsc::UnboundedReceiver<SourceId>) {
        let device = ManualOutputDevice::new();
        let stream = device.open(24_000).unwrap();
        (PlaybackScheduler::new(stream.sink, 24_000), device, stream.ended)
    }

    #[test]
    fn test_back_to_back_buffers_are_gapless() {
        let (mut scheduler, _device, _ended) = scheduler();
        let first = scheduler.enqueue(&payload(0.40, 24_000)).unwrap();
        let second = scheduler.enqueue(&payload(0.25, 24_000)).unwrap();

        assert!((first.duration - 0.40).abs() < 1e-9);
        assert!((second.start - (first.start + 0.40)).abs() < 1e-9);
        assert!((scheduler.next_start() - (first.start + 0.65)).abs() < 1e-9);
    }

    #[test]
    fn test_late_enqueue_starts_at_clock() {
        let (mut scheduler, device, _ended) = scheduler();
        scheduler.enqueue(&payload(0.2, 24_000)).unwrap();
        device.advance(1.0);
        scheduler.source_ended(1);

        let next = scheduler.enqueue(&payload(0.2, 24_000)).unwrap();
        assert!((next.start - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_flush_discards_pending_and_resets_cursor() {
        let (mut scheduler, device, _ended) = scheduler();
        scheduler.enqueue(&payload(0.5, 24_000)).unwrap();
        scheduler.enqueue(&payload(0.5, 24_000)).unwrap();
        device.advance(0.1);

        assert_eq!(scheduler.flush(), 2);
        assert!(scheduler.is_idle());
        assert_eq!(device.stopped_all(), 1);

        let next = scheduler.enqueue(&payload(0.25, 24_000)).unwrap();
        assert!((next.start - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_drain_is_reported_once_for_last_source() {
        let (mut scheduler, _device, _ended) = scheduler();
        let a = scheduler.enqueue(&payload(0.1, 24_000)).unwrap();
        let b = scheduler.enqueue(&payload(0.1, 24_000)).unwrap();

        assert!(!scheduler.source_ended(a.id));
        assert!(scheduler.source_ended(b.id));
        assert!(!scheduler.source_ended(b.id));
        assert!(!scheduler.source_ended(999));
    }

    #[test]
    fn test_payload_at_other_rate_is_resampled() {
        let (mut scheduler, _device, _ended) = scheduler();
        let source = scheduler.enqueue(&payload(0.5, 16_000)).unwrap();
        assert!((source.duration - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_payload_is_rejected() {
        let (mut scheduler, _device, _ended) = scheduler();
        let empty = AudioPayload::from_samples(&[], 24_000);
        assert!(scheduler.enqueue(&empty).is_err());
        assert!(scheduler.is_idle());
    }

    #[tokio::test]
    async fn test_shutdown_releases_device_once() {
        let (mut scheduler, device, _ended) = scheduler();
        scheduler.enqueue(&payload(0.1, 24_000)).unwrap();
        scheduler.shutdown().await;
        scheduler.shutdown().await;
        scheduler.close();
        assert_eq!(device.closed(), 1);
        assert_eq!(device.open_streams(), 0);
        assert_eq!(device.playing(), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut scheduler, device, _ended) = scheduler();
        scheduler.close();
        scheduler.close();
        assert_eq!(device.closed(), 1);
        assert!(scheduler.enqueue(&payload(0.1, 24_000)).is_err());
    }
}
