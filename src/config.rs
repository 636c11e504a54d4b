//! # Configuration Management
//!
//! Loads the live session configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables (APP_ prefix, `__` between section and key)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `GEMINI_API_KEY` / `API_KEY` for the service key
//! 2. Environment variables (APP_LIVE__MODEL, APP_RATE_LIMIT__MAX_ATTEMPTS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::persona::Mode;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main configuration that contains all settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub live: LiveConfig,
    pub audio: AudioConfig,
    pub rate_limit: RateLimitConfig,
    pub session: SessionConfig,
}

/// Remote conversational audio agent settings.
///
/// ## Fields:
/// - `endpoint`: websocket URL of the bidirectional streaming endpoint
/// - `model`: model identifier sent in the setup message
/// - `api_key`: service key, appended to the endpoint as `?key=`
/// - `outbound_queue` / `inbound_queue`: bounded channel capacities (frames / events)
/// - `max_consecutive_send_failures`: dropped frames in a row before the session is ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveConfig {
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub outbound_queue: usize,
    pub inbound_queue: usize,
    pub max_consecutive_send_failures: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub safety_settings: Vec<SafetySettingConfig>,
}

/// One harm-category threshold forwarded in the setup message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetySettingConfig {
    pub category: String,
    pub threshold: String,
}

/// Audio framing settings.
///
/// ## Reference values:
/// - Capture: 16 kHz mono, 4096-sample frames (≈256 ms per frame)
/// - Playback: 24 kHz mono
/// - `level_gain`: multiplier applied to frame RMS before clamping to [0, 1]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_samples: usize,
    pub level_gain: f32,
}

/// Sliding-window limits for opening new sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_attempts: usize,
    pub window_secs: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// What the binary connects with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub mode: Mode,
    #[serde(default)]
    pub custom_persona: Option<String>,
    /// Title of a built-in simulator preset, used when no custom persona is set
    #[serde(default)]
    pub preset: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            live: LiveConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                api_key: None,
                outbound_queue: 16,
                inbound_queue: 64,
                max_consecutive_send_failures: 8,
                temperature: None,
                safety_settings: Vec::new(),
            },
            audio: AudioConfig {
                input_sample_rate: 16_000,
                output_sample_rate: 24_000,
                frame_samples: 4096,
                level_gain: 5.0,
            },
            rate_limit: RateLimitConfig {
                max_attempts: 5,
                window_secs: 60,
            },
            session: SessionConfig {
                mode: Mode::Cruise,
                custom_persona: None,
                preset: None,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_LIVE__MODEL=models/other-model`: Override the model
    /// - `APP_SESSION__MODE=serious`: Start in the formal persona
    /// - `APP_RATE_LIMIT__WINDOW_SECS=120`: Widen the connection window
    /// - `GEMINI_API_KEY=...`: Service key (also accepted as `API_KEY`)
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Some(key) = ["GEMINI_API_KEY", "API_KEY"]
            .iter()
            .find_map(|name| env::var(name).ok())
        {
            settings = settings.set_override("live.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if !(self.live.endpoint.starts_with("ws://") || self.live.endpoint.starts_with("wss://")) {
            return Err(anyhow::anyhow!("Live endpoint must be a ws:// or wss:// URL"));
        }

        if self.live.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Live model cannot be empty"));
        }

        if self.live.outbound_queue == 0 || self.live.inbound_queue == 0 {
            return Err(anyhow::anyhow!("Channel queue capacities must be greater than 0"));
        }

        if self.live.max_consecutive_send_failures == 0 {
            return Err(anyhow::anyhow!("Max consecutive send failures must be greater than 0"));
        }

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.frame_samples == 0 {
            return Err(anyhow::anyhow!("Frame size must be greater than 0"));
        }

        if !(self.audio.level_gain > 0.0) {
            return Err(anyhow::anyhow!("Level gain must be positive"));
        }

        if self.rate_limit.max_attempts == 0 || self.rate_limit.window_secs == 0 {
            return Err(anyhow::anyhow!("Rate limit attempts and window must be greater than 0"));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML with the API key masked.
    pub fn to_toml(&self) -> Result<String> {
        let mut redacted = self.clone();
        if redacted.live.api_key.is_some() {
            redacted.live.api_key = Some("***".to_string());
        }
        Ok(toml::to_string_pretty(&redacted)?)
    }
}
