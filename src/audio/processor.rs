//! # Audio Processing and Transport Encoding
//!
//! PCM16 conversion, loudness measurement, and format normalisation for the
//! live pipeline.
//!
//! ## Key Functions:
//! - **Encoding**: float samples in [-1, 1] → 16-bit signed little-endian → base64
//! - **Decoding**: base64 → 16-bit signed little-endian → float samples
//! - **Level metering**: per-frame RMS, amplified and clamped for UI meters
//! - **Normalisation**: downmix to mono and stateful FFT resampling between device rates

use crate::error::{SessionError, SessionResult};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rubato::{FftFixedIn, Resampler};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Sample encoding of a transport payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    /// Signed 16-bit little-endian linear PCM, mono
    Pcm16,
}

/// A tagged audio payload as carried over the remote channel.
///
/// ## Wire form:
/// The tag is rendered as a MIME-like string (`audio/pcm;rate=16000`) next to the
/// base64 encoding of `bytes`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPayload {
    pub format: SampleFormat,
    pub sample_rate: u32,
    pub bytes: Vec<u8>,
}

impl AudioPayload {
    /// Encode float samples into a PCM16 payload.
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Self {
        Self {
            format: SampleFormat::Pcm16,
            sample_rate,
            bytes: encode_pcm16(samples),
        }
    }

    /// Build a payload from a MIME tag and base64 data.
    ///
    /// `default_rate` is used when the tag carries no `rate=` parameter.
    pub fn from_base64(mime_type: &str, data: &str, default_rate: u32) -> SessionResult<Self> {
        let (format, sample_rate) = parse_mime_type(mime_type, default_rate)?;
        let bytes = B64.decode(data)?;
        Ok(Self {
            format,
            sample_rate,
            bytes,
        })
    }

    pub fn mime_type(&self) -> String {
        match self.format {
            SampleFormat::Pcm16 => format!("audio/pcm;rate={}", self.sample_rate),
        }
    }

    pub fn to_base64(&self) -> String {
        B64.encode(&self.bytes)
    }

    pub fn sample_count(&self) -> usize {
        self.bytes.len() / 2
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.sample_count() as f64 / self.sample_rate as f64
    }

    /// Decode to float samples at the payload's own rate.
    pub fn to_samples(&self) -> SessionResult<Vec<f32>> {
        decode_pcm16(&self.bytes)
    }
}

/// Parse `audio/pcm;rate=24000` (parameters in any order, case-insensitive type).
fn parse_mime_type(mime_type: &str, default_rate: u32) -> SessionResult<(SampleFormat, u32)> {
    let mut parts = mime_type.split(';').map(str::trim);
    let media = parts.next().unwrap_or_default().to_ascii_lowercase();
    if media != "audio/pcm" && media != "audio/l16" {
        return Err(SessionError::Network(format!(
            "unsupported audio type '{}'",
            mime_type
        )));
    }

    let mut rate = default_rate;
    for param in parts {
        if let Some((key, value)) = param.split_once('=') {
            if key.trim().eq_ignore_ascii_case("rate") {
                rate = value.trim().parse().map_err(|_| {
                    SessionError::Network(format!("invalid sample rate in '{}'", mime_type))
                })?;
            }
        }
    }

    if rate == 0 {
        return Err(SessionError::Network(format!(
            "invalid sample rate in '{}'",
            mime_type
        )));
    }
    Ok((SampleFormat::Pcm16, rate))
}

/// Convert float samples to 16-bit signed little-endian bytes.
///
/// Samples outside [-1, 1] are clamped instead of wrapping.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let scaled = (sample * 32768.0).clamp(-32768.0, 32767.0) as i16;
        // Writing into a Vec cannot fail.
        let _ = bytes.write_i16::<LittleEndian>(scaled);
    }
    bytes
}

/// Convert 16-bit signed little-endian bytes to float samples in [-1, 1).
pub fn decode_pcm16(bytes: &[u8]) -> SessionResult<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(SessionError::Network(
            "audio payload length must be even for 16-bit samples".to_string(),
        ));
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample as f32 / 32768.0);
    }
    Ok(samples)
}

/// Root-mean-square amplitude of a frame, multiplied by `gain` and clamped to [0, 1].
pub fn rms_level(samples: &[f32], gain: f32) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    let rms = (sum / samples.len() as f32).sqrt();
    (rms * gain).clamp(0.0, 1.0)
}

/// Average interleaved channels into one.
pub fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Input chunk requested from the FFT resampler. rubato may round it.
const RESAMPLE_CHUNK: usize = 1024;
const RESAMPLE_SUB_CHUNKS: usize = 2;

/// Mono sample-rate converter that keeps its filter state across calls.
///
/// Input arrives in whatever block size the caller has; it is buffered until the
/// resampler has a full chunk, so block boundaries never show up in the output
/// and the long-run rate is exact.
pub struct StreamResampler {
    resampler: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    /// A pass-through converter when the rates match.
    pub fn new(from_rate: u32, to_rate: u32) -> SessionResult<Self> {
        let resampler = if from_rate == to_rate {
            None
        } else {
            Some(FftFixedIn::<f32>::new(
                from_rate as usize,
                to_rate as usize,
                RESAMPLE_CHUNK,
                RESAMPLE_SUB_CHUNKS,
                1,
            )?)
        };
        Ok(Self {
            resampler,
            pending: Vec::new(),
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Input samples needed to produce the next output chunk, or `None` when passing through.
    pub fn input_frames_next(&self) -> Option<usize> {
        self.resampler
            .as_ref()
            .map(|r| r.input_frames_next().saturating_sub(self.pending.len()).max(1))
    }

    /// Output frames of latency added by the filter.
    pub fn output_delay(&self) -> usize {
        self.resampler.as_ref().map(|r| r.output_delay()).unwrap_or(0)
    }

    /// Convert `input` and append whatever output is ready to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) -> SessionResult<()> {
        let Some(resampler) = self.resampler.as_mut() else {
            out.extend_from_slice(input);
            return Ok(());
        };

        self.pending.extend_from_slice(input);
        let mut consumed = 0;
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() - consumed < needed {
                break;
            }
            let frames = resampler.process(&[&self.pending[consumed..consumed + needed]], None)?;
            out.extend_from_slice(&frames[0]);
            consumed += needed;
        }
        self.pending.drain(..consumed);
        Ok(())
    }

    /// Drop buffered input and filter state.
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

/// Convert one self-contained buffer, with the filter delay trimmed and the
/// output length matched to the rate ratio.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> SessionResult<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let mut resampler = StreamResampler::new(from_rate, to_rate)?;
    let expected = (samples.len() as f64 * to_rate as f64 / from_rate as f64).round() as usize;
    let delay = resampler.output_delay();

    let mut out = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);
    resampler.process(samples, &mut out)?;
    // Push silence through until the tail has left the filter.
    let silence = vec![0.0; RESAMPLE_CHUNK];
    while out.len() < delay + expected {
        resampler.process(&silence, &mut out)?;
    }

    out.drain(..delay);
    out.truncate(expected);
    Ok(out)
}
