//! Error taxonomy for the voice client
//!
//! Every fallible operation in the crate returns [`VoiceError`]. The type is
//! `Clone` so device and transport failures can ride on the broadcast event
//! stream to the UI.

use thiserror::Error;

/// Errors surfaced by the voice client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoiceError {
    /// Microphone or speaker could not be opened (permission denied, no device)
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Another session is already connecting or connected
    #[error("A voice session is already active")]
    AlreadyActive,

    /// API misuse: the operation is not valid in the current state
    #[error("Cannot {action} while {state}")]
    InvalidStateTransition { action: String, state: String },

    /// Capture engine was armed before it was opened
    #[error("Audio capture is not open")]
    NotOpen,

    /// The service rejected this connection because another one is live
    #[error("Connection rejected as duplicate: {0}")]
    DuplicateConnection(String),

    /// The connection dropped or could not be established
    #[error("Connection lost: {0}")]
    TransportLost(String),

    /// Malformed base64 or PCM payload
    #[error("Failed to decode audio: {0}")]
    DecodeError(String),

    /// Unexpected message shape or out-of-order sequence number
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Output device could not render audio; voice continues as text-only
    #[error("Audio playback unavailable: {0}")]
    PlaybackUnavailable(String),

    /// The service reported an error event
    #[error("Service error ({code}): {message}")]
    Service { code: String, message: String },

    /// Settings or credentials problem
    #[error("Configuration error: {0}")]
    Config(String),
}

impl VoiceError {
    pub(crate) fn invalid(action: &str, state: impl std::fmt::Display) -> Self {
        VoiceError::InvalidStateTransition {
            action: action.to_string(),
            state: state.to_string(),
        }
    }

    /// Short category name for error history
    pub fn kind(&self) -> &'static str {
        match self {
            VoiceError::DeviceUnavailable(_) => "device",
            VoiceError::AlreadyActive => "already_active",
            VoiceError::InvalidStateTransition { .. } => "invalid_state",
            VoiceError::NotOpen => "not_open",
            VoiceError::DuplicateConnection(_) => "duplicate_connection",
            VoiceError::TransportLost(_) => "transport",
            VoiceError::DecodeError(_) => "decode",
            VoiceError::ProtocolError(_) => "protocol",
            VoiceError::PlaybackUnavailable(_) => "playback",
            VoiceError::Service { .. } => "service",
            VoiceError::Config(_) => "config",
        }
    }

    /// Whether the session survives this error.
    ///
    /// Transport and duplicate-connection errors end the connection; the user
    /// must reconnect explicitly. Everything else is reported and the session
    /// keeps running.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            VoiceError::TransportLost(_) | VoiceError::DuplicateConnection(_)
        )
    }
}
