//! # LexAI Live
//!
//! Real-time duplex voice sessions with a hosted conversational agent. Microphone
//! audio streams up over a WebSocket while the agent's synthesized speech is
//! scheduled for gapless playback.
//!
//! ## Modules:
//! - **manager**: `SessionManager`, the connect/disconnect facade
//! - **connection**: per-session state machine
//! - **gate**: sliding-window limit on connection attempts
//! - **websocket**: live channel protocol and connector
//! - **audio**: capture, playback scheduling, PCM codec, session status
//! - **persona**: modes, voices, and status wording
//! - **config**: TOML + environment configuration
//! - **error**: error kinds surfaced to the status callback

pub mod audio;
pub mod config;
pub mod connection;
pub mod error;
pub mod gate;
pub mod manager;
pub mod persona;
pub mod websocket;

#[cfg(test)]
pub(crate) mod testing;
