//! Gemini Live streaming session over WebSocket
//!
//! Text responses with input transcription and server-side voice activity
//! detection. User audio goes up as base64 PCM in `realtimeInput` messages.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::collab::{LlmConnector, LlmResponse, LlmSession, SessionPeer};
use super::tools::{ToolCall, ToolRegistry, ToolResult};
use crate::config::LlmSettings;
use crate::error::CollaboratorError;

const ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/\
                        google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
const AUDIO_MIME_TYPE: &str = "audio/pcm;rate=16000";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const TEMPERATURE: f64 = 0.85;
const SLIDING_WINDOW_TRIGGER_TOKENS: u32 = 32_000;

pub struct GeminiConnector {
    api_key: String,
    settings: LlmSettings,
}

impl GeminiConnector {
    pub fn new(api_key: String, settings: LlmSettings) -> Self {
        Self { api_key, settings }
    }
}

#[async_trait]
impl LlmConnector for GeminiConnector {
    async fn open(&self, tools: &ToolRegistry) -> Result<LlmSession, CollaboratorError> {
        let url = format!("{ENDPOINT}?key={}", self.api_key);
        let (mut ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| CollaboratorError::Connect("timed out connecting to Gemini".into()))??;

        let setup = setup_message(&self.settings, tools);
        ws.send(Message::Text(setup.to_string())).await?;

        // Nothing may be sent before the server acknowledges the setup
        loop {
            match ws.next().await {
                Some(Ok(message)) => {
                    if let Some(value) = decode(message)? {
                        if value.get("setupComplete").is_some() {
                            break;
                        }
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Err(CollaboratorError::Closed),
            }
        }
        info!(model = %self.settings.model, "gemini session opened");

        let (session, peer) = LlmSession::pair();
        let task = tokio::spawn(drive(ws, peer));
        Ok(session.with_task(task))
    }
}

type Socket = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn drive(ws: Socket, mut peer: SessionPeer) {
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            audio = peer.audio.recv() => match audio {
                Some(pcm) => {
                    if let Err(e) = sink.send(Message::Text(audio_message(&pcm).to_string())).await {
                        let _ = peer.responses.send(Err(e.into())).await;
                        break;
                    }
                }
                None => {
                    debug!("session closed by assistant");
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            Some(results) = peer.tool_results.recv() => {
                debug!(count = results.len(), "sending tool responses");
                let message = tool_response_message(&results).to_string();
                if let Err(e) = sink.send(Message::Text(message)).await {
                    let _ = peer.responses.send(Err(e.into())).await;
                    break;
                }
            }
            frame = source.next() => match frame {
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "gemini closed the session");
                    break;
                }
                Some(Ok(message)) => match decode(message) {
                    Ok(Some(value)) => {
                        if let Some(response) = parse_server_message(&value) {
                            if peer.responses.send(Ok(response)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "undecodable gemini message"),
                },
                Some(Err(e)) => {
                    let _ = peer.responses.send(Err(e.into())).await;
                    break;
                }
                None => break,
            },
        }
    }
}

/// Gemini sends JSON in both text and binary frames
fn decode(message: Message) -> Result<Option<Value>, CollaboratorError> {
    let bytes = match message {
        Message::Text(text) => text.into_bytes(),
        Message::Binary(bytes) => bytes,
        _ => return Ok(None),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| CollaboratorError::Protocol(e.to_string()))
}

fn setup_message(settings: &LlmSettings, tools: &ToolRegistry) -> Value {
    let mut setup = json!({
        "model": format!("models/{}", settings.model),
        "generationConfig": {
            "responseModalities": ["TEXT"],
            "temperature": TEMPERATURE,
        },
        "inputAudioTranscription": {},
        "contextWindowCompression": {
            "slidingWindow": {},
            "triggerTokens": SLIDING_WINDOW_TRIGGER_TOKENS,
        },
        "realtimeInputConfig": {
            "activityHandling": "NO_INTERRUPTION",
            "automaticActivityDetection": {
                "disabled": false,
                "startOfSpeechSensitivity": "START_SENSITIVITY_HIGH",
                "prefixPaddingMs": settings.vad_prefix_padding_ms,
                "silenceDurationMs": settings.vad_silence_duration_ms,
            },
        },
    });

    if !settings.system_prompt.is_empty() {
        setup["systemInstruction"] = json!({ "parts": [{ "text": settings.system_prompt }] });
    }
    if !tools.is_empty() {
        setup["tools"] = json!([{ "functionDeclarations": tools.declarations() }]);
    }

    json!({ "setup": setup })
}

fn audio_message(pcm: &[u8]) -> Value {
    json!({
        "realtimeInput": {
            "audio": {
                "data": base64::engine::general_purpose::STANDARD.encode(pcm),
                "mimeType": AUDIO_MIME_TYPE,
            }
        }
    })
}

fn tool_response_message(results: &[ToolResult]) -> Value {
    json!({ "toolResponse": { "functionResponses": results } })
}

/// Flatten a server message into a response; `None` for messages carrying nothing of interest
fn parse_server_message(value: &Value) -> Option<LlmResponse> {
    let mut response = LlmResponse::default();

    if let Some(content) = value.get("serverContent") {
        if let Some(parts) = content
            .pointer("/modelTurn/parts")
            .and_then(Value::as_array)
        {
            for text in parts.iter().filter_map(|p| p.get("text").and_then(Value::as_str)) {
                response.text.push_str(text);
            }
        }
        if let Some(transcription) = content.get("inputTranscription") {
            if let Some(text) = transcription.get("text").and_then(Value::as_str) {
                response.transcript.push_str(text);
            }
            response.transcript_finished = transcription
                .get("finished")
                .and_then(Value::as_bool)
                .unwrap_or(false);
        }
        response.turn_complete = content
            .get("turnComplete")
            .and_then(Value::as_bool)
            .unwrap_or(false);
    }

    if let Some(calls) = value
        .pointer("/toolCall/functionCalls")
        .and_then(Value::as_array)
    {
        response.tool_calls = calls
            .iter()
            .filter_map(|call| serde_json::from_value::<ToolCall>(call.clone()).ok())
            .collect();
    }

    (response != LlmResponse::default()).then_some(response)
}
