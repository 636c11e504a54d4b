//! # Microphone Capture
//!
//! Acquires the capture device, cuts the signal into fixed-size frames, meters
//! each frame, and hands encoded frames to the session over a bounded channel.
//!
//! ## Pipeline:
//! ```text
//! device callback → downmix/resample → FrameChunker → level callback
//!                                                   → AudioPayload → mpsc (try_send)
//! ```
//!
//! The device callback never blocks: a full queue drops the frame with a warning.
//! Once the cancellation token fires the callback stops touching shared state.

use crate::audio::processor::{downmix_to_mono, rms_level, AudioPayload, StreamResampler};
use crate::audio::session::{SessionStats, VolumeCallback};
use crate::config::AudioConfig;
use crate::error::{SessionError, SessionResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receives mono samples at the requested rate, in whatever block size the device uses.
pub type FrameSink = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Source of microphone audio.
pub trait CaptureDevice: Send + Sync {
    /// Open the device and start delivering samples to `sink`.
    ///
    /// Fails with [`SessionError::Permission`] when access is refused and
    /// [`SessionError::Device`] when there is no usable device.
    fn open(&self, sample_rate: u32, sink: FrameSink) -> SessionResult<CaptureHandle>;
}

/// Keeps a capture stream alive. Stops it on `stop()` or drop.
pub struct CaptureHandle {
    stop: Option<Box<dyn FnOnce() + Send>>,
}

impl CaptureHandle {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            stop: Some(Box::new(stop)),
        }
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.stop.is_some()
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accumulates samples and yields frames of exactly `frame_samples`.
pub struct FrameChunker {
    frame_samples: usize,
    pending: Vec<f32>,
}

impl FrameChunker {
    pub fn new(frame_samples: usize) -> Self {
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples),
        }
    }

    /// Append samples and call `on_frame` for every completed frame.
    pub fn push(&mut self, samples: &[f32], mut on_frame: impl FnMut(&[f32])) {
        let mut rest = samples;
        while !rest.is_empty() {
            let take = (self.frame_samples - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == self.frame_samples {
                on_frame(&self.pending);
                self.pending.clear();
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Microphone side of a live session.
pub struct AudioCaptureBridge {
    device: Arc<dyn CaptureDevice>,
    handle: Option<CaptureHandle>,
    muted: Arc<AtomicBool>,
    forwarding: Arc<AtomicBool>,
}

impl AudioCaptureBridge {
    /// `muted` is shared with the manager and outlives the bridge.
    pub fn new(device: Arc<dyn CaptureDevice>, muted: Arc<AtomicBool>) -> Self {
        Self {
            device,
            handle: None,
            muted,
            forwarding: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Acquire the device and start metering.
    ///
    /// Frames are only queued on `frames` after `set_forwarding(true)`; until then
    /// they are metered and discarded.
    pub async fn start(
        &mut self,
        config: &AudioConfig,
        cancel: CancellationToken,
        frames: mpsc::Sender<AudioPayload>,
        on_level: VolumeCallback,
        stats: Arc<SessionStats>,
    ) -> SessionResult<()> {
        if self.handle.is_some() {
            return Err(SessionError::Internal("capture already running".to_string()));
        }

        let sample_rate = config.input_sample_rate;
        let gain = config.level_gain;
        let mut chunker = FrameChunker::new(config.frame_samples);
        let muted = Arc::clone(&self.muted);
        let forwarding = Arc::clone(&self.forwarding);

        let sink: FrameSink = Box::new(move |samples: &[f32]| {
            if cancel.is_cancelled() {
                return;
            }
            chunker.push(samples, |frame| {
                let is_muted = muted.load(Ordering::Relaxed);
                on_level(if is_muted { 0.0 } else { rms_level(frame, gain) });

                if is_muted || !forwarding.load(Ordering::Acquire) {
                    return;
                }
                match frames.try_send(AudioPayload::from_samples(frame, sample_rate)) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        SessionStats::record(&stats.frames_dropped);
                        warn!("Outbound audio queue full, dropping frame");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("Outbound audio queue closed, discarding frame");
                    }
                }
            });
        });

        let device = Arc::clone(&self.device);
        let handle = tokio::task::spawn_blocking(move || device.open(sample_rate, sink))
            .await
            .map_err(|e| SessionError::Internal(format!("capture start-up task failed: {}", e)))??;

        self.handle = Some(handle);
        info!(sample_rate, frame_samples = config.frame_samples, "Microphone capture started");
        Ok(())
    }

    /// Begin or stop queueing frames for transmission.
    pub fn set_forwarding(&self, enabled: bool) {
        self.forwarding.store(enabled, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(CaptureHandle::is_running).unwrap_or(false)
    }

    /// Release the device. Idempotent.
    pub fn stop(&mut self) {
        self.set_forwarding(false);
        if let Some(mut handle) = self.handle.take() {
            handle.stop();
            info!("Microphone capture stopped");
        }
    }

    /// Like [`stop`](Self::stop), but the device is released on the blocking pool.
    pub async fn shutdown(&mut self) {
        self.set_forwarding(false);
        if let Some(mut handle) = self.handle.take() {
            match tokio::task::spawn_blocking(move || handle.stop()).await {
                Ok(()) => info!("Microphone capture stopped"),
                Err(e) => warn!("Capture release task failed: {}", e),
            }
        }
    }
}

impl Drop for AudioCaptureBridge {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The host's default input device.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalCaptureDevice;

impl CaptureDevice for CpalCaptureDevice {
    fn open(&self, sample_rate: u32, sink: FrameSink) -> SessionResult<CaptureHandle> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<SessionResult<()>>(1);
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let worker = thread::Builder::new()
            .name("lexai-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(sample_rate, sink) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!("Capture stream released");
            })
            .map_err(|e| SessionError::Internal(format!("failed to spawn capture thread: {}", e)))?;

        ready_rx
            .recv()
            .map_err(|_| SessionError::Internal("capture thread exited during start-up".to_string()))??;

        Ok(CaptureHandle::new(move || {
            let _ = shutdown_tx.send(());
            if worker.join().is_err() {
                warn!("Capture thread panicked during shutdown");
            }
        }))
    }
}

fn classify_backend_error(context: &str, message: String) -> SessionError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        SessionError::Permission(format!("{}: {}", context, message))
    } else {
        SessionError::Device(format!("{}: {}", context, message))
    }
}

fn build_input_stream(target_rate: u32, mut sink: FrameSink) -> SessionResult<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| SessionError::Device("no microphone found".to_string()))?;
    let supported = device
        .default_input_config()
        .map_err(|e| classify_backend_error("microphone unavailable", e.to_string()))?;

    let config: cpal::StreamConfig = supported.config();
    let channels = config.channels as usize;
    let device_rate = config.sample_rate.0;
    debug!(
        device = %device.name().unwrap_or_default(),
        device_rate,
        channels,
        "Opening microphone"
    );

    let mut resampler = StreamResampler::new(device_rate, target_rate)?;
    let mut resampled = Vec::new();
    let mut normalise = move |interleaved: &[f32]| {
        let mono = downmix_to_mono(interleaved, channels);
        resampled.clear();
        if let Err(e) = resampler.process(&mono, &mut resampled) {
            error!("Microphone conversion failed: {}", e);
            return;
        }
        if !resampled.is_empty() {
            sink(&resampled);
        }
    };
    let on_error = |err: cpal::StreamError| error!("Audio input stream error: {}", err);

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| normalise(data),
            on_error,
            None,
        ),
        cpal::SampleFormat::I16 => {
            let mut scratch = Vec::new();
            device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    scratch.clear();
                    scratch.extend(data.iter().map(|s| *s as f32 / 32768.0));
                    normalise(&scratch);
                },
                on_error,
                None,
            )
        }
        other => {
            return Err(SessionError::Device(format!(
                "unsupported microphone sample format {:?}",
                other
            )))
        }
    }
    .map_err(|e| classify_backend_error("failed to open microphone", e.to_string()))?;

    stream
        .play()
        .map_err(|e| classify_backend_error("failed to start microphone", e.to_string()))?;

    Ok(stream)
}
