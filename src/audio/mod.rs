//! # Audio Module
//!
//! Everything between the sound card and the live channel.
//!
//! ## Key Components:
//! - **Capture**: microphone stream, framing, level metering (`capture`)
//! - **Output**: speaker stream and the `PlaybackSink` seam (`output`)
//! - **Playback Timeline**: sample-accurate mixing on the output thread (`buffer`)
//! - **Playback Scheduler**: gapless queueing and barge-in flush (`playback`)
//! - **Processor**: PCM16 codec, base64 payloads, resampling (`processor`)
//! - **Session**: phases, status events, per-session counters (`session`)
//!
//! ## Audio Format:
//! - **Upstream**: 16 kHz mono PCM16 little-endian, `audio/pcm;rate=16000`
//! - **Downstream**: 24 kHz mono PCM16 unless the MIME type says otherwise

pub mod buffer;     // Output-side mixing timeline
pub mod capture;    // Microphone bridge
pub mod output;     // Speaker device
pub mod playback;   // Gapless playback scheduling
pub mod processor;  // PCM conversion and payload encoding
pub mod session;    // Phases and status reporting
