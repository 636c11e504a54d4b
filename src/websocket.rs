//! # Live Channel over WebSocket
//!
//! Wire protocol and transport for the persistent bidirectional channel to the
//! remote conversational audio agent.
//!
//! ## Protocol:
//! 1. **Connect**: websocket to the configured endpoint with `?key=<api key>`
//! 2. **Setup**: client sends `{"setup": {...}}` once (model, voice, system instruction)
//! 3. **Handshake**: the channel is open when the server answers `{"setupComplete": {}}`
//! 4. **Streaming**: client sends `{"realtimeInput": {"mediaChunks": [...]}}` per frame;
//!    server sends `{"serverContent": {...}}` with audio parts, `interrupted`, `turnComplete`
//! 5. **Close**: either side closes; close codes classify the outcome
//!
//! ## Message Format:
//! - Audio travels as base64 PCM16 with a `audio/pcm;rate=N` tag
//! - Server JSON may arrive in text or binary websocket messages
//!
//! A driver task owns the socket. The session talks to it through two bounded
//! queues (frames out, events in) and a cancellation token.

use crate::audio::processor::AudioPayload;
use crate::config::LiveConfig;
use crate::error::{is_busy_status, SessionError, SessionResult};
use crate::persona::Persona;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// How long `close()` waits for the driver before aborting it.
const DRIVER_STOP_GRACE: Duration = Duration::from_secs(2);
/// How long the driver tries to send a close frame.
const CLOSE_FRAME_GRACE: Duration = Duration::from_secs(1);

/// Client → server messages.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SessionSetup),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    pub fn audio(payload: &AudioPayload) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: payload.mime_type(),
                data: payload.to_base64(),
            }],
        })
    }
}

/// Session configuration sent once at open.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSetup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub safety_settings: Vec<SafetySetting>,
}

impl SessionSetup {
    pub fn new(config: &LiveConfig, persona: &Persona) -> Self {
        Self {
            model: config.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: persona.voice.to_string(),
                        },
                    },
                },
                temperature: config.temperature,
            },
            system_instruction: Content::text(&persona.system_instruction),
            safety_settings: config
                .safety_settings
                .iter()
                .map(|s| SafetySetting {
                    category: s.category.clone(),
                    threshold: s.threshold.clone(),
                })
                .collect(),
        }
    }

    pub fn voice_name(&self) -> &str {
        &self.generation_config.speech_config.voice_config.prebuilt_voice_config.voice_name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetySetting {
    pub category: String,
    pub threshold: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn text(text: &str) -> Self {
        Self {
            parts: vec![Part {
                text: Some(text.to_string()),
                inline_data: None,
            }],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

/// Base64 data with its MIME tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

/// Server → client message. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

impl ServerMessage {
    pub fn parse(bytes: &[u8]) -> SessionResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Flatten into channel events. An interruption always comes before any
    /// audio carried by the same message.
    pub fn into_events(self, default_rate: u32) -> SessionResult<Vec<ChannelEvent>> {
        let mut events = Vec::new();
        if let Some(content) = self.server_content {
            if content.interrupted {
                events.push(ChannelEvent::Interrupted);
            }
            let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
            for blob in parts.into_iter().filter_map(|part| part.inline_data) {
                if !blob.mime_type.starts_with("audio/") {
                    trace!(mime_type = %blob.mime_type, "Ignoring non-audio inline data");
                    continue;
                }
                events.push(ChannelEvent::Audio(AudioPayload::from_base64(
                    &blob.mime_type,
                    &blob.data,
                    default_rate,
                )?));
            }
            if content.turn_complete {
                events.push(ChannelEvent::TurnComplete);
            }
        }
        if let Some(go_away) = self.go_away {
            events.push(ChannelEvent::GoAway {
                time_left: go_away.time_left,
            });
        }
        Ok(events)
    }
}

/// What the channel delivers to the session, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Audio(AudioPayload),
    /// Barge-in: the user spoke over the agent
    Interrupted,
    TurnComplete,
    /// The server will close the channel soon
    GoAway { time_left: Option<String> },
    /// Orderly close by the remote side
    Closed { reason: String },
    Failed(SessionError),
}

/// An open channel. Dropping it closes the socket.
pub struct LiveChannel {
    pub outbound: mpsc::Sender<AudioPayload>,
    pub inbound: mpsc::Receiver<ChannelEvent>,
    closer: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl LiveChannel {
    pub fn new(
        outbound: mpsc::Sender<AudioPayload>,
        inbound: mpsc::Receiver<ChannelEvent>,
        closer: CancellationToken,
        driver: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            closer,
            driver,
        }
    }

    /// Close the socket and wait for the driver to finish. Idempotent.
    ///
    /// Always returns: a driver that does not stop within the grace period is aborted.
    pub async fn close(&mut self) {
        self.closer.cancel();
        self.inbound.close();
        if let Some(mut driver) = self.driver.take() {
            match tokio::time::timeout(DRIVER_STOP_GRACE, &mut driver).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Live channel driver ended abnormally: {}", e),
                Err(_) => {
                    warn!("Live channel driver did not stop, aborting it");
                    driver.abort();
                }
            }
        }
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        self.closer.cancel();
    }
}

/// Opens live channels.
pub trait ChannelConnector: Send + Sync {
    /// Resolve once the remote side acknowledged `setup`. No local timeout.
    fn connect(&self, setup: SessionSetup) -> BoxFuture<'static, SessionResult<LiveChannel>>;
}

/// Connector for the hosted live audio endpoint.
#[derive(Debug, Clone)]
pub struct GeminiLiveConnector {
    config: LiveConfig,
    output_sample_rate: u32,
}

impl GeminiLiveConnector {
    /// `output_sample_rate` is assumed for server audio that carries no rate tag.
    pub fn new(config: LiveConfig, output_sample_rate: u32) -> Self {
        Self {
            config,
            output_sample_rate,
        }
    }

    fn url(&self) -> SessionResult<String> {
        let key = self
            .config
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                SessionError::Config("API key is missing (set GEMINI_API_KEY or API_KEY)".to_string())
            })?;
        let separator = if self.config.endpoint.contains('?') { '&' } else { '?' };
        Ok(format!("{}{}key={}", self.config.endpoint, separator, key))
    }
}

impl ChannelConnector for GeminiLiveConnector {
    fn connect(&self, setup: SessionSetup) -> BoxFuture<'static, SessionResult<LiveChannel>> {
        let url = self.url();
        let outbound_queue = self.config.outbound_queue;
        let inbound_queue = self.config.inbound_queue;
        let default_rate = self.output_sample_rate;

        Box::pin(async move {
            let url = url?;
            debug!(model = %setup.model, voice = setup.voice_name(), "Opening live channel");

            let (ws, response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(classify_handshake_error)?;
            debug!(status = %response.status(), "WebSocket upgrade complete");

            let (mut sink, mut stream) = ws.split();
            let setup_json = serde_json::to_string(&ClientMessage::Setup(setup))
                .map_err(|e| SessionError::Internal(format!("failed to encode setup: {}", e)))?;
            sink.send(Message::Text(setup_json))
                .await
                .map_err(classify_handshake_error)?;

            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if ServerMessage::parse(text.as_bytes())?.is_setup_complete() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if ServerMessage::parse(&bytes)?.is_setup_complete() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = close_parts(frame.as_ref());
                        return Err(classify_close(code, &reason, false)
                            .unwrap_or_else(|| SessionError::Handshake("closed during setup".to_string())));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(classify_handshake_error(e)),
                    None => {
                        return Err(SessionError::Handshake(
                            "connection ended before setup completed".to_string(),
                        ))
                    }
                }
            }
            info!("Live channel open");

            let (outbound_tx, outbound_rx) = mpsc::channel(outbound_queue);
            let (inbound_tx, inbound_rx) = mpsc::channel(inbound_queue);
            let closer = CancellationToken::new();
            let driver = tokio::spawn(drive(
                sink,
                stream,
                outbound_rx,
                inbound_tx,
                closer.clone(),
                default_rate,
            ));

            Ok(LiveChannel::new(outbound_tx, inbound_rx, closer, Some(driver)))
        })
    }
}

/// Pump frames out and events in until either side closes.
///
/// Every await races the closer, so a stalled socket or a full event queue never
/// keeps the driver alive after `close()`.
async fn drive<S, R>(
    mut sink: S,
    mut stream: R,
    mut outbound: mpsc::Receiver<AudioPayload>,
    inbound: mpsc::Sender<ChannelEvent>,
    closer: CancellationToken,
    default_rate: u32,
) where
    S: futures_util::Sink<Message, Error = tungstenite::Error> + Unpin,
    R: futures_util::Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        tokio::select! {
            _ = closer.cancelled() => {
                let _ = tokio::time::timeout(CLOSE_FRAME_GRACE, sink.close()).await;
                debug!("Live channel closed locally");
                return;
            }
            frame = outbound.recv() => {
                let Some(payload) = frame else {
                    let _ = tokio::time::timeout(CLOSE_FRAME_GRACE, sink.close()).await;
                    return;
                };
                let text = match serde_json::to_string(&ClientMessage::audio(&payload)) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode audio frame: {}", e);
                        continue;
                    }
                };
                let sent = tokio::select! {
                    _ = closer.cancelled() => {
                        debug!("Live channel closed during a stalled send");
                        return;
                    }
                    sent = sink.send(Message::Text(text)) => sent,
                };
                if let Err(e) = sent {
                    deliver(&inbound, &closer, ChannelEvent::Failed(e.into())).await;
                    return;
                }
            }
            incoming = stream.next() => {
                let bytes = match incoming {
                    Some(Ok(Message::Text(text))) => text.into_bytes(),
                    Some(Ok(Message::Binary(bytes))) => bytes,
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = close_parts(frame.as_ref());
                        let event = match classify_close(code, &reason, true) {
                            Some(err) => ChannelEvent::Failed(err),
                            None => ChannelEvent::Closed { reason },
                        };
                        deliver(&inbound, &closer, event).await;
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        deliver(&inbound, &closer, ChannelEvent::Failed(e.into())).await;
                        return;
                    }
                    None => {
                        let closed = ChannelEvent::Closed { reason: "connection ended".to_string() };
                        deliver(&inbound, &closer, closed).await;
                        return;
                    }
                };

                let events = match ServerMessage::parse(&bytes).and_then(|m| m.into_events(default_rate)) {
                    Ok(events) => events,
                    Err(e) => {
                        warn!("Skipping unreadable server message: {}", e);
                        continue;
                    }
                };
                for event in events {
                    if !deliver(&inbound, &closer, event).await {
                        let _ = tokio::time::timeout(CLOSE_FRAME_GRACE, sink.close()).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Queue an event for the session. False once the channel is closing or the
/// session has stopped listening.
async fn deliver(
    inbound: &mpsc::Sender<ChannelEvent>,
    closer: &CancellationToken,
    event: ChannelEvent,
) -> bool {
    tokio::select! {
        _ = closer.cancelled() => false,
        sent = inbound.send(event) => sent.is_ok(),
    }
}

fn close_parts(frame: Option<&CloseFrame<'_>>) -> (u16, String) {
    match frame {
        Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
        None => (1005, String::new()),
    }
}

/// Map a close code to an error, or `None` for an orderly close of an open channel.
///
/// Before the channel is open every close is an error.
pub fn classify_close(code: u16, reason: &str, open: bool) -> Option<SessionError> {
    let detail = if reason.is_empty() {
        format!("closed with code {}", code)
    } else {
        format!("closed with code {}: {}", code, reason)
    };
    match code {
        1011 | 1012 | 1013 => Some(SessionError::ServiceUnavailable(detail)),
        _ if !open => Some(SessionError::Handshake(detail)),
        1000 | 1001 | 1005 => None,
        _ => Some(SessionError::Network(detail)),
    }
}

/// Classify a failure to open the socket.
pub fn classify_handshake_error(err: tungstenite::Error) -> SessionError {
    match &err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if is_busy_status(status.as_u16()) {
                SessionError::ServiceUnavailable(format!("HTTP {}", status))
            } else {
                SessionError::Handshake(format!("HTTP {}", status))
            }
        }
        tungstenite::Error::Url(e) => SessionError::Config(format!("invalid endpoint: {}", e)),
        _ => SessionError::Handshake(err.to_string()),
    }
}
