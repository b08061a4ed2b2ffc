//! Realtime speech-to-speech protocol types
//!
//! JSON text frames exchanged with the voice service over the duplex
//! connection.
//!
//! # Protocol Overview
//!
//! 1. Connect; the server sends `session.created` (identity and session config
//!    are owned server-side, so no `session.update` is ever sent)
//! 2. Stream microphone audio via `input_audio_buffer.append`
//! 3. Server VAD reports `speech_started` / `speech_stopped`; the client answers
//!    each stop with one `response.create`
//! 4. Assistant audio arrives as `response.audio.delta` chunks per response,
//!    followed by `response.audio.done` and `response.done`
//! 5. Transcripts of both sides arrive as separate events

use serde::{Deserialize, Serialize};

use crate::error::VoiceError;

/// Default realtime endpoint
pub const REALTIME_API_URL: &str =
    "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview-2024-12-17";

/// Session information returned by the API
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    /// Unique session ID
    pub id: String,

    /// Model being used
    #[serde(default)]
    pub model: String,

    /// Voice the assistant speaks with
    #[serde(default)]
    pub voice: Option<String>,
}

/// Error information from the API
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    /// Error type/code
    #[serde(rename = "type", default)]
    pub error_type: String,

    /// Error code
    #[serde(default)]
    pub code: Option<String>,

    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

impl ErrorInfo {
    /// Most specific code available, for display
    pub fn code_or_type(&self) -> &str {
        self.code.as_deref().unwrap_or(&self.error_type)
    }
}

/// Response envelope carried by `response.created` / `response.done`
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseInfo {
    pub id: String,

    /// e.g. "in_progress", "completed", "cancelled"
    #[serde(default)]
    pub status: Option<String>,
}

// ============================================================================
// Client Messages (sent TO the service)
// ============================================================================

/// Content part of a user message item
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "input_text")]
    InputText { text: String },
}

/// Conversation item created by the client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub item_type: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

/// Messages sent from client to the realtime service
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Append audio data to the input buffer
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend {
        /// Base64-encoded PCM16 audio data
        audio: String,
    },

    /// Ask the service to produce a response now
    #[serde(rename = "response.create")]
    ResponseCreate,

    /// Add a typed user message to the conversation
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
}

impl ClientMessage {
    /// Create an audio append message from already-encoded transport text
    pub fn audio_append(audio: String) -> Self {
        Self::AudioAppend { audio }
    }

    pub fn response_create() -> Self {
        Self::ResponseCreate
    }

    /// A user text message
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::ConversationItemCreate {
            item: ConversationItem {
                item_type: "message".to_string(),
                role: "user".to_string(),
                content: vec![ContentPart::InputText { text: text.into() }],
            },
        }
    }

    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> Result<String, VoiceError> {
        serde_json::to_string(self).map_err(|e| VoiceError::ProtocolError(e.to_string()))
    }
}

// ============================================================================
// Server Messages (received FROM the service)
// ============================================================================

/// Messages received from the realtime service
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Session was created successfully
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },

    /// Session was updated (server-side)
    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionInfo },

    /// An error occurred
    #[serde(rename = "error")]
    Error { error: ErrorInfo },

    /// Input audio buffer was committed as a conversation item
    #[serde(rename = "input_audio_buffer.committed")]
    AudioCommitted {
        /// ID of the previous item
        #[serde(default)]
        previous_item_id: Option<String>,
        /// ID of the new item
        #[serde(default)]
        item_id: Option<String>,
    },

    /// Server VAD detected speech
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        #[serde(default)]
        event_id: Option<String>,
        /// Audio start time in ms
        #[serde(default)]
        audio_start_ms: Option<u64>,
        #[serde(default)]
        item_id: Option<String>,
    },

    /// Server VAD detected silence after speech
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        #[serde(default)]
        event_id: Option<String>,
        /// Audio end time in ms
        #[serde(default)]
        audio_end_ms: Option<u64>,
        #[serde(default)]
        item_id: Option<String>,
    },

    /// The service started producing a response
    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseInfo },

    /// Chunk of assistant audio
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        item_id: Option<String>,
        /// Base64-encoded PCM16
        delta: String,
    },

    /// All audio for the response item was sent
    #[serde(rename = "response.audio.done")]
    AudioDone {
        #[serde(default)]
        response_id: Option<String>,
        #[serde(default)]
        item_id: Option<String>,
    },

    /// Partial assistant transcript
    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta {
        #[serde(default)]
        response_id: Option<String>,
        delta: String,
    },

    /// Final assistant transcript
    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        #[serde(default)]
        response_id: Option<String>,
        transcript: String,
    },

    /// Transcription of the user's speech
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        #[serde(default)]
        item_id: Option<String>,
        transcript: String,
    },

    /// Partial function-call arguments
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        #[serde(default)]
        call_id: Option<String>,
        delta: String,
    },

    /// Complete function-call arguments
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        #[serde(default)]
        call_id: Option<String>,
        #[serde(default)]
        name: Option<String>,
        arguments: String,
    },

    /// The response finished
    #[serde(rename = "response.done")]
    ResponseDone { response: ResponseInfo },

    /// Catch-all for message types we don't handle
    /// This prevents deserialization failures for unknown types
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Parse a JSON text frame.
    ///
    /// Unknown `type`s parse as [`ServerMessage::Unknown`]; a known type with
    /// the wrong shape is a `ProtocolError`.
    pub fn parse(text: &str) -> Result<Self, VoiceError> {
        serde_json::from_str(text).map_err(|e| VoiceError::ProtocolError(e.to_string()))
    }

    /// Wire name, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::SessionCreated { .. } => "session.created",
            ServerMessage::SessionUpdated { .. } => "session.updated",
            ServerMessage::Error { .. } => "error",
            ServerMessage::AudioCommitted { .. } => "input_audio_buffer.committed",
            ServerMessage::SpeechStarted { .. } => "input_audio_buffer.speech_started",
            ServerMessage::SpeechStopped { .. } => "input_audio_buffer.speech_stopped",
            ServerMessage::ResponseCreated { .. } => "response.created",
            ServerMessage::AudioDelta { .. } => "response.audio.delta",
            ServerMessage::AudioDone { .. } => "response.audio.done",
            ServerMessage::AudioTranscriptDelta { .. } => "response.audio_transcript.delta",
            ServerMessage::AudioTranscriptDone { .. } => "response.audio_transcript.done",
            ServerMessage::InputTranscriptionCompleted { .. } => {
                "conversation.item.input_audio_transcription.completed"
            }
            ServerMessage::FunctionCallArgumentsDelta { .. } => {
                "response.function_call_arguments.delta"
            }
            ServerMessage::FunctionCallArgumentsDone { .. } => {
                "response.function_call_arguments.done"
            }
            ServerMessage::ResponseDone { .. } => "response.done",
            ServerMessage::Unknown => "unknown",
        }
    }

    /// Check if this is an error message
    pub fn is_error(&self) -> bool {
        matches!(self, ServerMessage::Error { .. })
    }

    /// Extract session ID if this is a session created/updated message
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerMessage::SessionCreated { session } => Some(&session.id),
            ServerMessage::SessionUpdated { session } => Some(&session.id),
            _ => None,
        }
    }

    /// Key identifying one speech-stop event, for duplicate suppression.
    ///
    /// A redelivered stop carries the same item (or event) id.
    pub fn stop_key(&self) -> Option<String> {
        match self {
            ServerMessage::SpeechStopped {
                item_id, event_id, ..
            } => item_id.clone().or_else(|| event_id.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_audio_append_serialization() {
        let msg = ClientMessage::audio_append("NBJ4Vg==".to_string());
        let json = msg.to_json().unwrap();

        assert_eq!(
            json,
            r#"{"type":"input_audio_buffer.append","audio":"NBJ4Vg=="}"#
        );
    }

    #[test]
    fn test_client_message_response_create_serialization() {
        let json = ClientMessage::response_create().to_json().unwrap();
        assert_eq!(json, r#"{"type":"response.create"}"#);
    }

    #[test]
    fn test_client_message_user_text_serialization() {
        let json = ClientMessage::user_text("hello").to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["type"], "conversation.item.create");
        assert_eq!(value["item"]["type"], "message");
        assert_eq!(value["item"]["role"], "user");
        assert_eq!(value["item"]["content"][0]["type"], "input_text");
        assert_eq!(value["item"]["content"][0]["text"], "hello");
    }

    #[test]
    fn test_server_message_session_created_deserialization() {
        let json = r#"{
            "type": "session.created",
            "event_id": "evt_1",
            "session": {
                "id": "sess_123",
                "model": "gpt-4o-realtime-preview",
                "voice": "alloy"
            }
        }"#;

        let msg = ServerMessage::parse(json).unwrap();
        assert_eq!(msg.session_id(), Some("sess_123"));
        match msg {
            ServerMessage::SessionCreated { session } => {
                assert_eq!(session.model, "gpt-4o-realtime-preview");
                assert_eq!(session.voice.as_deref(), Some("alloy"));
            }
            _ => panic!("Expected SessionCreated"),
        }
    }

    #[test]
    fn test_server_message_audio_delta_deserialization() {
        let json = r#"{
            "type": "response.audio.delta",
            "event_id": "evt_4",
            "response_id": "resp_1",
            "item_id": "item_9",
            "output_index": 0,
            "content_index": 0,
            "delta": "AAAA"
        }"#;

        match ServerMessage::parse(json).unwrap() {
            ServerMessage::AudioDelta {
                response_id, delta, ..
            } => {
                assert_eq!(response_id.as_deref(), Some("resp_1"));
                assert_eq!(delta, "AAAA");
            }
            other => panic!("Expected AudioDelta, got {:?}", other),
        }
    }

    #[test]
    fn test_server_message_speech_stopped_key() {
        let json = r#"{
            "type": "input_audio_buffer.speech_stopped",
            "event_id": "evt_7",
            "audio_end_ms": 1200,
            "item_id": "item_3"
        }"#;
        let msg = ServerMessage::parse(json).unwrap();
        assert_eq!(msg.stop_key().as_deref(), Some("item_3"));

        let bare = ServerMessage::parse(r#"{"type":"input_audio_buffer.speech_stopped"}"#).unwrap();
        assert_eq!(bare.stop_key(), None);
    }

    #[test]
    fn test_server_message_error_deserialization() {
        let json = r#"{
            "type": "error",
            "error": {
                "type": "invalid_request_error",
                "code": "invalid_api_key",
                "message": "Invalid API key"
            }
        }"#;

        let msg = ServerMessage::parse(json).unwrap();
        assert!(msg.is_error());
        match msg {
            ServerMessage::Error { error } => {
                assert_eq!(error.message, "Invalid API key");
                assert_eq!(error.code_or_type(), "invalid_api_key");
            }
            _ => panic!("Expected Error"),
        }
    }

    #[test]
    fn test_server_message_unknown_type() {
        let json = r#"{
            "type": "rate_limits.updated",
            "rate_limits": []
        }"#;

        let msg = ServerMessage::parse(json).unwrap();
        assert!(matches!(msg, ServerMessage::Unknown));
    }

    #[test]
    fn test_malformed_message_is_protocol_error() {
        // Known type, missing required field
        let err = ServerMessage::parse(r#"{"type":"response.audio.delta"}"#).unwrap_err();
        assert!(matches!(err, VoiceError::ProtocolError(_)));

        let err = ServerMessage::parse("not json").unwrap_err();
        assert!(matches!(err, VoiceError::ProtocolError(_)));
    }
}
