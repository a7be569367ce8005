//! JSON message model for the live conversational endpoint.
//!
//! ## Client → server
//!
//! ```text
//! { "setup": { "model", "generationConfig": { "responseModalities", "speechConfig" },
//!              "systemInstruction": { "parts": [ { "text" } ] } } }
//! { "realtimeInput": { "mediaChunks": [ { "mimeType": "audio/pcm;rate=16000", "data" } ] } }
//! ```
//!
//! ## Server → client
//!
//! ```text
//! { "setupComplete": {} }
//! { "serverContent": { "modelTurn": { "parts": [ { "inlineData": { "mimeType", "data" } } ] },
//!                      "interrupted": true, "turnComplete": true } }
//! ```
//!
//! Everything here is pure (de)serialisation; the socket lives in `ws`.

use serde::{Deserialize, Serialize};

use super::{ConnectConfig, ResponseModality, TransportEvent};
use crate::{
    codec::EncodedChunk,
    error::{Result, VoxError},
};

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupEnvelope<'a> {
    setup: Setup<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: &'a str,
    generation_config: GenerationConfig<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: [ResponseModality; 1],
    speech_config: SpeechConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    prebuilt_voice_config: PrebuiltVoice<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoice<'a> {
    voice_name: &'a str,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: Vec<TextPart<'a>>,
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeEnvelope<'a> {
    realtime_input: RealtimeInput<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput<'a> {
    media_chunks: [MediaChunk<'a>; 1],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk<'a> {
    mime_type: String,
    data: &'a str,
}

/// First message on a new connection.
pub fn setup_message(config: &ConnectConfig) -> String {
    let envelope = SetupEnvelope {
        setup: Setup {
            model: &config.model,
            generation_config: GenerationConfig {
                response_modalities: [config.response_modality],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoice {
                            voice_name: &config.voice_name,
                        },
                    },
                },
            },
            system_instruction: config
                .system_instruction
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(|text| Content {
                    parts: vec![TextPart { text }],
                }),
        },
    };
    // Plain structs of strings cannot fail to serialise.
    serde_json::to_string(&envelope).unwrap_or_default()
}

/// One outbound microphone chunk.
pub fn realtime_input_message(chunk: &EncodedChunk) -> String {
    let envelope = RealtimeEnvelope {
        realtime_input: RealtimeInput {
            media_chunks: [MediaChunk {
                mime_type: chunk.mime_type(),
                data: &chunk.data,
            }],
        },
    };
    serde_json::to_string(&envelope).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    interrupted: bool,
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModelTurn {
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct InlineData {
    mime_type: Option<String>,
    data: String,
}

/// Decoded contents of one server message.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ServerFrame {
    /// The message acknowledged the setup.
    pub setup_complete: bool,
    /// The model finished its turn.
    pub turn_complete: bool,
    /// Events in the order they must be applied.
    pub events: Vec<TransportEvent>,
}

/// Parse one server message.
///
/// Audio parts come out before the interrupt flag of the same message.
/// Parts whose MIME type is not audio are skipped. A `goAway` notice becomes
/// a `Closed` event.
///
/// # Errors
/// `VoxError::Remote` when the text is not a JSON object.
pub fn parse_server_message(text: &str, default_rate: u32) -> Result<ServerFrame> {
    let message: ServerMessage = serde_json::from_str(text)
        .map_err(|e| VoxError::Remote(format!("unparseable server message: {e}")))?;

    let mut frame = ServerFrame {
        setup_complete: message.setup_complete.is_some(),
        ..ServerFrame::default()
    };

    if let Some(content) = message.server_content {
        let parts = content.model_turn.map(|t| t.parts).unwrap_or_default();
        for inline in parts.into_iter().filter_map(|p| p.inline_data) {
            let mime = inline.mime_type.as_deref().unwrap_or("audio/pcm");
            if !mime.starts_with("audio/") {
                continue;
            }
            let rate = rate_from_mime(mime).unwrap_or(default_rate);
            frame
                .events
                .push(TransportEvent::AudioChunk(EncodedChunk::new(inline.data, rate)));
        }
        if content.interrupted {
            frame.events.push(TransportEvent::Interrupted);
        }
        frame.turn_complete = content.turn_complete;
    }

    if message.go_away.is_some() {
        frame.events.push(TransportEvent::Closed {
            reason: Some("server requested disconnect".into()),
        });
    }

    Ok(frame)
}

/// `audio/pcm;rate=24000` → `Some(24000)`.
pub fn rate_from_mime(mime: &str) -> Option<u32> {
    mime.split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|v| v.trim().parse().ok())
}
