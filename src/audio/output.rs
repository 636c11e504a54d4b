//! # Audio Output Device
//!
//! Playback seam used by the scheduler, plus the cpal-backed implementation.
//!
//! A [`PlaybackSink`] exposes an output clock (`now()`, in seconds) and lets the
//! caller start a mono buffer at an absolute time on that clock. When a started
//! buffer finishes on its own, its [`SourceId`] is sent on the `ended` channel of
//! the [`OutputStream`]. Buffers removed by `stop_all` are not reported.
//!
//! The cpal sink mixes on a [`PlaybackTimeline`] at the stream rate and converts
//! the mixed signal to the device rate with one stateful resampler, so buffer
//! boundaries stay frame-exact whatever the hardware runs at.
//!
//! cpal streams are `!Send`, so the hardware stream lives on a dedicated thread
//! that owns it until `close()` is called.

use crate::audio::buffer::PlaybackTimeline;
use crate::audio::processor::StreamResampler;
use crate::error::{SessionError, SessionResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Identifier of one scheduled playback buffer.
pub type SourceId = u64;

/// Timeline-addressable audio output.
pub trait PlaybackSink: Send {
    /// Output clock in seconds.
    fn now(&self) -> f64;

    /// Play `samples` (mono, at the stream's rate) starting at `at` seconds.
    fn start(&mut self, id: SourceId, samples: Arc<[f32]>, at: f64);

    /// Stop every playing and pending buffer.
    fn stop_all(&mut self);

    /// Release the output device. Idempotent.
    fn close(&mut self);
}

/// An opened output: the sink plus its completion notices.
pub struct OutputStream {
    pub sink: Box<dyn PlaybackSink>,
    pub ended: mpsc::UnboundedReceiver<SourceId>,
}

/// Factory for output streams.
pub trait OutputDevice: Send + Sync {
    fn open(&self, sample_rate: u32) -> SessionResult<OutputStream>;
}

/// Pulls the stream-rate mix from the timeline and hands out device-rate frames.
struct DeviceRenderer {
    timeline: Arc<PlaybackTimeline>,
    resampler: StreamResampler,
    mix: Vec<f32>,
    converted: Vec<f32>,
    ready: VecDeque<f32>,
}

impl DeviceRenderer {
    fn new(timeline: Arc<PlaybackTimeline>, device_rate: u32) -> SessionResult<Self> {
        let resampler = StreamResampler::new(timeline.sample_rate(), device_rate)?;
        Ok(Self {
            timeline,
            resampler,
            mix: Vec::new(),
            converted: Vec::new(),
            ready: VecDeque::new(),
        })
    }

    /// Fill an interleaved buffer, copying the mono mix into every channel.
    fn fill(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = out.len() / channels;

        while self.ready.len() < frames {
            let want = self
                .resampler
                .input_frames_next()
                .unwrap_or(frames - self.ready.len());
            self.mix.resize(want, 0.0);
            self.timeline.render(&mut self.mix);

            self.converted.clear();
            if let Err(e) = self.resampler.process(&self.mix, &mut self.converted) {
                error!("Output conversion failed: {}", e);
                out.fill(0.0);
                return;
            }
            self.ready.extend(self.converted.iter().copied());
        }

        for (frame, value) in out.chunks_mut(channels).zip(self.ready.drain(..frames)) {
            frame.fill(value);
        }
    }
}

/// The host's default output device.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalOutputDevice;

impl OutputDevice for CpalOutputDevice {
    fn open(&self, sample_rate: u32) -> SessionResult<OutputStream> {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        let timeline = Arc::new(PlaybackTimeline::new(sample_rate, ended_tx));
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<SessionResult<u32>>(1);
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let render_timeline = Arc::clone(&timeline);
        let worker = thread::Builder::new()
            .name("lexai-playback".to_string())
            .spawn(move || {
                let stream = match build_output_stream(render_timeline) {
                    Ok((stream, device_rate)) => {
                        let _ = ready_tx.send(Ok(device_rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Park until the sink is closed or dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!("Playback stream released");
            })
            .map_err(|e| SessionError::Internal(format!("failed to spawn playback thread: {}", e)))?;

        let device_rate = ready_rx
            .recv()
            .map_err(|_| SessionError::Internal("playback thread exited during start-up".to_string()))??;

        info!(device_rate, stream_rate = sample_rate, "Audio output opened");

        Ok(OutputStream {
            sink: Box::new(CpalSink {
                timeline,
                shutdown: Some(shutdown_tx),
                worker: Some(worker),
            }),
            ended: ended_rx,
        })
    }
}

fn build_output_stream(timeline: Arc<PlaybackTimeline>) -> SessionResult<(cpal::Stream, u32)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| SessionError::Device("no audio output device available".to_string()))?;
    let supported = device
        .default_output_config()
        .map_err(|e| SessionError::Device(format!("output device has no usable config: {}", e)))?;

    let config: cpal::StreamConfig = supported.config();
    let channels = config.channels as usize;
    let device_rate = config.sample_rate.0;
    let mut renderer = DeviceRenderer::new(timeline, device_rate)?;

    let on_error = |err: cpal::StreamError| error!("Audio output stream error: {}", err);

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| renderer.fill(data, channels),
            on_error,
            None,
        ),
        cpal::SampleFormat::I16 => {
            let mut scratch = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);
                    renderer.fill(&mut scratch, channels);
                    for (out, sample) in data.iter_mut().zip(&scratch) {
                        *out = (sample * 32767.0) as i16;
                    }
                },
                on_error,
                None,
            )
        }
        other => {
            return Err(SessionError::Device(format!(
                "unsupported output sample format {:?}",
                other
            )))
        }
    }
    .map_err(|e| SessionError::Device(format!("failed to open output stream: {}", e)))?;

    stream
        .play()
        .map_err(|e| SessionError::Device(format!("failed to start output stream: {}", e)))?;

    Ok((stream, device_rate))
}

struct CpalSink {
    timeline: Arc<PlaybackTimeline>,
    shutdown: Option<std_mpsc::Sender<()>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl PlaybackSink for CpalSink {
    fn now(&self) -> f64 {
        self.timeline.now_secs()
    }

    fn start(&mut self, id: SourceId, samples: Arc<[f32]>, at: f64) {
        self.timeline.schedule(id, samples, self.timeline.frame_at(at));
    }

    fn stop_all(&mut self) {
        let dropped = self.timeline.clear();
        if dropped > 0 {
            debug!(dropped, "Stopped all playback sources");
        }
    }

    fn close(&mut self) {
        self.timeline.clear();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Playback thread panicked during shutdown");
            }
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}
