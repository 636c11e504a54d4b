//! # Persona Resolution
//!
//! Turns a connect request (mode selector or free-text override) into the
//! system instruction, voice, and status wording used for one live session.
//!
//! ## Modes:
//! - **Cruise**: playful Pidgin-speaking legal buddy, voice `Puck`
//! - **Serious**: formal legal counsel, voice `Zephyr`
//! - **Override**: caller-supplied character wrapped in a role-play template,
//!   voice `Fenrir`
//!
//! Voice and instruction are a pure function of `(mode, override present)`.
//! Status text is rendered from [`SessionPhase`] and is never parsed back.

use crate::audio::session::SessionPhase;
use crate::error::{ErrorKind, SessionError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const CRUISE_INSTRUCTION: &str = "You are LexAI, a funny Nigerian lawyer (Your Legal Padi). \
You speak in Nigerian Pidgin English. You are street-wise, hilarious, and give practical legal \
advice mixed with 'cruise' (humor). Keep responses relatively short and conversational for voice. \
Always sound confident.";

const SERIOUS_INSTRUCTION: &str = "You are a professional Nigerian Legal Counsel. Speak in clear, \
formal English. Be empathetic, authoritative, and concise. Provide accurate legal guidance based \
on the Nigerian Constitution.";

const CRUISE_VOICE: &str = "Puck";
const SERIOUS_VOICE: &str = "Zephyr";
const OVERRIDE_VOICE: &str = "Fenrir";

/// Built-in persona selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Cruise,
    Serious,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Cruise => "cruise",
            Mode::Serious => "serious",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cruise" => Ok(Mode::Cruise),
            "serious" => Ok(Mode::Serious),
            other => Err(SessionError::Config(format!("unknown mode '{}'", other))),
        }
    }
}

/// Input to `SessionManager::connect`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub mode: Mode,
    #[serde(default)]
    pub custom_persona: Option<String>,
}

impl ConnectRequest {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            custom_persona: None,
        }
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.custom_persona = Some(persona.into());
        self
    }

    /// The override text, if it has any content.
    pub fn override_text(&self) -> Option<&str> {
        self.custom_persona
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }
}

/// Everything the session needs to know about who the agent is.
#[derive(Debug, Clone, PartialEq)]
pub struct Persona {
    pub mode: Mode,
    pub system_instruction: String,
    pub voice: &'static str,
    /// Whether a caller-supplied character is being played
    pub in_character: bool,
}

/// Resolve the persona for a connect request.
pub fn resolve(request: &ConnectRequest) -> Persona {
    match request.override_text() {
        Some(text) => Persona {
            mode: request.mode,
            system_instruction: wrap_custom_persona(text),
            voice: OVERRIDE_VOICE,
            in_character: true,
        },
        None => match request.mode {
            Mode::Cruise => Persona {
                mode: Mode::Cruise,
                system_instruction: CRUISE_INSTRUCTION.to_string(),
                voice: CRUISE_VOICE,
                in_character: false,
            },
            Mode::Serious => Persona {
                mode: Mode::Serious,
                system_instruction: SERIOUS_INSTRUCTION.to_string(),
                voice: SERIOUS_VOICE,
                in_character: false,
            },
        },
    }
}

/// Wrap a free-text character description in the role-play template.
pub fn wrap_custom_persona(description: &str) -> String {
    format!(
        "You are playing a character in a role-play training simulation. \
Stay fully in character for the whole call and never break character or mention that you are an AI.\n\
CHARACTER:\n{}\n\
RULES:\n\
- A hostile, angry, or rude tone is allowed when the character calls for it; this is practice for \
a difficult real-life conversation.\n\
- Do not give real legal, medical, or financial guidance while in character.\n\
- Keep replies short and conversational, as in a phone call.",
        description.trim()
    )
}

impl Persona {
    /// Status wording for a phase.
    pub fn status_text(&self, phase: &SessionPhase) -> String {
        match phase {
            SessionPhase::Idle => "Ready".to_string(),
            SessionPhase::Connecting if self.in_character => "Dialling...".to_string(),
            SessionPhase::Connecting => "Connecting to Padi...".to_string(),
            SessionPhase::Listening if self.in_character => "On the line...".to_string(),
            SessionPhase::Listening => match self.mode {
                Mode::Cruise => "Oya talk, I dey hear...".to_string(),
                Mode::Serious => "Listening...".to_string(),
            },
            SessionPhase::Speaking if self.in_character => "They are talking...".to_string(),
            SessionPhase::Speaking => match self.mode {
                Mode::Cruise => "Padi dey talk...".to_string(),
                Mode::Serious => "Speaking...".to_string(),
            },
            SessionPhase::Closing => "Hanging up...".to_string(),
            SessionPhase::Closed => "Disconnected".to_string(),
            SessionPhase::Errored(kind) => self.kind_text(*kind, None),
        }
    }

    /// Status wording for an error, including the retry delay when known.
    pub fn error_text(&self, error: &SessionError) -> String {
        self.kind_text(error.kind(), error.retry_after().map(|d| d.as_secs_f64()))
    }

    fn kind_text(&self, kind: ErrorKind, retry_after_secs: Option<f64>) -> String {
        let cruise = self.mode == Mode::Cruise && !self.in_character;
        match kind {
            ErrorKind::Permission if cruise => "Abeg allow microphone make we talk.".to_string(),
            ErrorKind::Permission => "Microphone permission denied.".to_string(),
            ErrorKind::Device if cruise => "I no see any microphone for here.".to_string(),
            ErrorKind::Device => "No microphone found.".to_string(),
            ErrorKind::RateLimited => {
                let wait = retry_after_secs.map(|s| s.ceil() as u64);
                match (cruise, wait) {
                    (true, Some(secs)) => format!("Easy small! Try again in {}s.", secs),
                    (true, None) => "Easy small! Try again later.".to_string(),
                    (false, Some(secs)) => format!("Too many attempts. Try again in {}s.", secs),
                    (false, None) => "Too many attempts. Try again later.".to_string(),
                }
            }
            ErrorKind::ServiceUnavailable if cruise => "Padi dey busy. Try again small time.".to_string(),
            ErrorKind::ServiceUnavailable => "Service is busy. Please try again shortly.".to_string(),
            ErrorKind::Handshake => "Could not connect.".to_string(),
            ErrorKind::Network if cruise => "Network don cut. Check your connection.".to_string(),
            ErrorKind::Network => "Connection lost.".to_string(),
            ErrorKind::Config => "Configuration error.".to_string(),
            ErrorKind::Internal => "Error".to_string(),
        }
    }
}

/// A built-in role-play scenario for the call simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatorPreset {
    pub title: &'static str,
    pub prompt: &'static str,
}

pub const SIMULATOR_PRESETS: &[SimulatorPreset] = &[
    SimulatorPreset {
        title: "Angry Landlord",
        prompt: "Act as an angry Nigerian landlord named 'Chief'. You are demanding rent that is 3 months overdue. You are loud, unreasonable, and threatening to remove the roof. Speak in aggressive Pidgin. Refuse to listen to excuses.",
    },
    SimulatorPreset {
        title: "Police at Checkpoint",
        prompt: "Act as a Nigerian police officer at a night checkpoint. You are suspicious but not violent. You are asking for 'receipts for laptop' and 'tint permit'. You are looking for a bribe but won't say it directly. Speak in Pidgin.",
    },
    SimulatorPreset {
        title: "Stubborn Debtor",
        prompt: "Act as a friend named 'Emeka' who borrowed money 6 months ago. I am asking for it back. You have 1000 excuses. You are gaslighting me, saying I don't trust you. You are dramatic.",
    },
    SimulatorPreset {
        title: "Market Woman",
        prompt: "Act as a sharp-mouthed market woman in Balogun market. I am trying to price your goods too low. You are insulting me jokingly but standing your ground on price. Loud and funny.",
    },
];

/// Look up a simulator preset by title, ignoring case.
pub fn find_preset(title: &str) -> Option<&'static SimulatorPreset> {
    let title = title.trim();
    SIMULATOR_PRESETS
        .iter()
        .find(|preset| preset.title.eq_ignore_ascii_case(title))
}
