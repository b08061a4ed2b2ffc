//! Voice session state machine
//!
//! This module implements the connection/conversation state machine using a
//! single-writer pattern. All state transitions go through the `reduce()`
//! function, which returns a new state and a list of effects to execute.
//! The session owns the only `State` and runs the effects in order.
//!
//! ```text
//! Disconnected ──Connect──▶ Connecting ──TransportOpened──▶ Connected{Idle}
//!      ▲                        │                               │
//!      │                 TransportFailed              StartConversation
//!      │                        ▼                               ▼
//!      └────Disconnect───── Failed ◀──TransportClosed── Connected{Listening ⇄ Processing ⇄ Speaking}
//! ```

use std::fmt;

use uuid::Uuid;

use crate::error::VoiceError;

/// Transport-level view of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The connection ended abnormally; reconnect explicitly
    Failed,
}

/// Conversation phase while connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Idle,
    /// Microphone streaming, waiting for the user
    Listening,
    /// A response is being produced
    Processing,
    /// Assistant audio is arriving
    Speaking,
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConversationState::Idle => "idle",
            ConversationState::Listening => "listening",
            ConversationState::Processing => "processing",
            ConversationState::Speaking => "speaking",
        };
        f.write_str(name)
    }
}

/// Duplicate `speech_stopped` suppression
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopGuard {
    /// Key of the last stop that triggered a response
    pub last_stop_key: Option<String>,
    /// A response was already triggered since the last `speech_started`
    pub triggered_since_start: bool,
}

impl StopGuard {
    /// A keyed stop is a duplicate when its key was already handled; an
    /// unkeyed one when nothing restarted speech since the last trigger.
    fn is_duplicate(&self, key: Option<&str>) -> bool {
        match key {
            Some(key) => self.last_stop_key.as_deref() == Some(key),
            None => self.triggered_since_start,
        }
    }
}

/// Internal state of the voice session.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum State {
    #[default]
    Disconnected,
    Connecting {
        attempt: Uuid,
    },
    Connected {
        conversation: ConversationState,
        /// Microphone open and armed
        capture_active: bool,
        user_speaking: bool,
        stop_guard: StopGuard,
    },
    Failed {
        reason: VoiceError,
    },
}

impl State {
    fn connected(conversation: ConversationState, capture_active: bool) -> Self {
        State::Connected {
            conversation,
            capture_active,
            user_speaking: false,
            stop_guard: StopGuard::default(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        match self {
            State::Disconnected => ConnectionState::Disconnected,
            State::Connecting { .. } => ConnectionState::Connecting,
            State::Connected { .. } => ConnectionState::Connected,
            State::Failed { .. } => ConnectionState::Failed,
        }
    }

    pub fn conversation_state(&self) -> Option<ConversationState> {
        match self {
            State::Connected { conversation, .. } => Some(*conversation),
            _ => None,
        }
    }

    /// Connecting or connected; holds the process-wide connection slot
    pub fn is_active(&self) -> bool {
        matches!(self, State::Connecting { .. } | State::Connected { .. })
    }

    pub fn user_speaking(&self) -> bool {
        matches!(self, State::Connected { user_speaking: true, .. })
    }

    pub fn capture_active(&self) -> bool {
        matches!(self, State::Connected { capture_active: true, .. })
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Disconnected => f.write_str("disconnected"),
            State::Connecting { .. } => f.write_str("connecting"),
            State::Connected { conversation, .. } => write!(f, "{}", conversation),
            State::Failed { .. } => f.write_str("failed"),
        }
    }
}

/// Events that can trigger state transitions.
/// Commands come from the public API; the rest from the transport and devices.
#[derive(Debug, Clone)]
pub enum Event {
    // Commands
    Connect {
        attempt: Uuid,
    },
    StartConversation,
    StopConversation,
    Disconnect,

    // Transport events (attempt id prevents stale handshakes)
    TransportOpened {
        attempt: Uuid,
    },
    TransportFailed {
        attempt: Uuid,
        error: VoiceError,
    },
    /// `error` is None for a normal close
    TransportClosed {
        error: Option<VoiceError>,
    },

    // Device events
    CaptureFailed {
        error: VoiceError,
    },
    CaptureLost {
        message: String,
    },

    // Protocol events
    SpeechStarted,
    SpeechStopped {
        key: Option<String>,
    },
    ResponseCreated,
    AudioDelta,
    ResponseDone,
}

/// Effects to be executed after a state transition, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    OpenPlayback,
    /// Open the microphone and arm it
    OpenCapture,
    CloseCapture,
    FlushPlayback,
    /// Let queued audio finish, then release the output device
    DrainPlayback,
    ClosePlayback,
    CloseTransport,
    SendResponseCreate,
    ReleaseGuard,
    AppendWelcome,
    ReportError(VoiceError),
    DuplicateStopSuppressed,
    /// Signal to emit UI state changes
    EmitUi,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Only commands can fail; transport and protocol events never do
/// - Events that make no sense in the current state are ignored
/// - Always emit EmitUi after state changes
pub fn reduce(state: &State, event: Event) -> Result<(State, Vec<Effect>), VoiceError> {
    use ConversationState::*;
    use Effect::*;

    let unchanged = || Ok((state.clone(), vec![]));

    match (state, event) {
        // -----------------
        // Commands
        // -----------------
        (State::Disconnected | State::Failed { .. }, Event::Connect { attempt }) => {
            Ok((State::Connecting { attempt }, vec![EmitUi]))
        }
        (State::Connecting { .. } | State::Connected { .. }, Event::Connect { .. }) => {
            Err(VoiceError::AlreadyActive)
        }

        (
            State::Connected {
                conversation: Idle,
                ..
            },
            Event::StartConversation,
        ) => Ok((
            State::connected(Listening, true),
            // Capture must be open before the UI hears about Listening
            vec![OpenCapture, EmitUi],
        )),
        (_, Event::StartConversation) => Err(VoiceError::invalid("start conversation", state)),

        (
            State::Connected {
                conversation: Idle,
                capture_active: false,
                ..
            },
            Event::StopConversation,
        ) => unchanged(),
        (State::Connected { .. }, Event::StopConversation) => Ok((
            State::connected(Idle, false),
            vec![CloseCapture, FlushPlayback, EmitUi],
        )),
        (_, Event::StopConversation) => Err(VoiceError::invalid("stop conversation", state)),

        (State::Disconnected, Event::Disconnect) => unchanged(),
        (State::Connecting { .. }, Event::Disconnect) => Ok((
            State::Disconnected,
            vec![CloseTransport, ReleaseGuard, EmitUi],
        )),
        (State::Connected { .. }, Event::Disconnect) => Ok((
            State::Disconnected,
            vec![
                CloseCapture,
                FlushPlayback,
                ClosePlayback,
                CloseTransport,
                ReleaseGuard,
                EmitUi,
            ],
        )),
        (State::Failed { .. }, Event::Disconnect) => Ok((State::Disconnected, vec![EmitUi])),

        // -----------------
        // Transport
        // -----------------
        (State::Connecting { attempt }, Event::TransportOpened { attempt: opened })
            if *attempt == opened =>
        {
            // No session configuration is sent: the server owns it
            Ok((
                State::connected(Idle, false),
                vec![OpenPlayback, AppendWelcome, EmitUi],
            ))
        }
        (State::Connecting { attempt }, Event::TransportFailed { attempt: failed, error })
            if *attempt == failed =>
        {
            Ok((
                State::Failed {
                    reason: error.clone(),
                },
                vec![ReleaseGuard, ReportError(error), EmitUi],
            ))
        }
        (State::Connected { .. }, Event::TransportClosed { error: None }) => Ok((
            State::Disconnected,
            vec![CloseCapture, DrainPlayback, CloseTransport, ReleaseGuard, EmitUi],
        )),
        (State::Connected { .. }, Event::TransportClosed { error: Some(error) }) => Ok((
            State::Failed {
                reason: error.clone(),
            },
            vec![
                CloseCapture,
                FlushPlayback,
                ClosePlayback,
                CloseTransport,
                ReleaseGuard,
                ReportError(error),
                EmitUi,
            ],
        )),

        // -----------------
        // Devices
        // -----------------
        (
            State::Connected {
                conversation,
                user_speaking,
                stop_guard,
                ..
            },
            Event::CaptureFailed { error },
        ) => {
            let conversation = if *conversation == Listening {
                Idle
            } else {
                *conversation
            };
            Ok((
                State::Connected {
                    conversation,
                    capture_active: false,
                    user_speaking: *user_speaking,
                    stop_guard: stop_guard.clone(),
                },
                vec![CloseCapture, ReportError(error), EmitUi],
            ))
        }
        (
            State::Connected {
                conversation,
                capture_active: true,
                stop_guard,
                ..
            },
            Event::CaptureLost { message },
        ) => {
            // Assistant output is unaffected by a lost microphone
            let conversation = match conversation {
                Listening => Idle,
                other => *other,
            };
            Ok((
                State::Connected {
                    conversation,
                    capture_active: false,
                    user_speaking: false,
                    stop_guard: stop_guard.clone(),
                },
                vec![
                    CloseCapture,
                    ReportError(VoiceError::DeviceUnavailable(message)),
                    EmitUi,
                ],
            ))
        }

        // -----------------
        // Protocol
        // -----------------
        (
            State::Connected {
                conversation,
                capture_active,
                stop_guard,
                ..
            },
            Event::SpeechStarted,
        ) => Ok((
            State::Connected {
                conversation: *conversation,
                capture_active: *capture_active,
                user_speaking: true,
                stop_guard: StopGuard {
                    last_stop_key: stop_guard.last_stop_key.clone(),
                    triggered_since_start: false,
                },
            },
            vec![EmitUi],
        )),
        (
            State::Connected {
                conversation,
                capture_active,
                stop_guard,
                ..
            },
            Event::SpeechStopped { key },
        ) => {
            let mut next_guard = stop_guard.clone();
            let mut effects = Vec::new();

            if *conversation == Idle {
                // Conversation was stopped; a late stop must not start a reply
            } else if stop_guard.is_duplicate(key.as_deref()) {
                effects.push(DuplicateStopSuppressed);
            } else {
                next_guard = StopGuard {
                    last_stop_key: key,
                    triggered_since_start: true,
                };
                effects.push(SendResponseCreate);
            }
            effects.push(EmitUi);

            Ok((
                State::Connected {
                    conversation: *conversation,
                    capture_active: *capture_active,
                    user_speaking: false,
                    stop_guard: next_guard,
                },
                effects,
            ))
        }
        (
            State::Connected {
                conversation: Idle | Listening,
                capture_active,
                user_speaking,
                stop_guard,
            },
            Event::ResponseCreated,
        ) => {
            Ok((
                State::Connected {
                    conversation: Processing,
                    capture_active: *capture_active,
                    user_speaking: *user_speaking,
                    stop_guard: stop_guard.clone(),
                },
                vec![EmitUi],
            ))
        }
        (
            State::Connected {
                conversation,
                capture_active,
                user_speaking,
                stop_guard,
            },
            Event::AudioDelta,
        ) if *conversation != Speaking => Ok((
            State::Connected {
                conversation: Speaking,
                capture_active: *capture_active,
                user_speaking: *user_speaking,
                stop_guard: stop_guard.clone(),
            },
            vec![EmitUi],
        )),
        (
            State::Connected {
                conversation: Processing | Speaking,
                capture_active,
                user_speaking,
                stop_guard,
            },
            Event::ResponseDone,
        ) => {
            let conversation = if *capture_active { Listening } else { Idle };
            Ok((
                State::Connected {
                    conversation,
                    capture_active: *capture_active,
                    user_speaking: *user_speaking,
                    stop_guard: stop_guard.clone(),
                },
                vec![EmitUi],
            ))
        }

        // -----------------
        // Fallback: ignore
        // -----------------
        (_, event) => {
            log::debug!("StateMachine: ignoring {:?} while {}", event, state);
            unchanged()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(conversation: ConversationState, capture_active: bool) -> State {
        State::connected(conversation, capture_active)
    }

    fn step(state: &State, event: Event) -> (State, Vec<Effect>) {
        reduce(state, event).unwrap()
    }

    fn has(effects: &[Effect], effect: Effect) -> bool {
        effects.contains(&effect)
    }

    #[test]
    fn connect_from_disconnected_starts_connecting() {
        let attempt = Uuid::new_v4();
        let (next, effects) = step(&State::Disconnected, Event::Connect { attempt });
        assert_eq!(next, State::Connecting { attempt });
        assert!(has(&effects, Effect::EmitUi));
    }

    #[test]
    fn connect_while_active_is_already_active() {
        let connecting = State::Connecting {
            attempt: Uuid::new_v4(),
        };
        for state in [connecting, connected(ConversationState::Speaking, true)] {
            let err = reduce(
                &state,
                Event::Connect {
                    attempt: Uuid::new_v4(),
                },
            )
            .unwrap_err();
            assert_eq!(err, VoiceError::AlreadyActive);
        }
    }

    #[test]
    fn transport_open_lands_in_idle_without_session_config() {
        let attempt = Uuid::new_v4();
        let (next, effects) = step(
            &State::Connecting { attempt },
            Event::TransportOpened { attempt },
        );
        assert_eq!(next.conversation_state(), Some(ConversationState::Idle));
        assert_eq!(
            effects,
            vec![Effect::OpenPlayback, Effect::AppendWelcome, Effect::EmitUi]
        );
    }

    #[test]
    fn stale_transport_open_is_ignored() {
        let state = State::Connecting {
            attempt: Uuid::new_v4(),
        };
        let (next, effects) = step(
            &state,
            Event::TransportOpened {
                attempt: Uuid::new_v4(),
            },
        );
        assert_eq!(next, state);
        assert!(effects.is_empty());
    }

    #[test]
    fn transport_failure_releases_guard() {
        let attempt = Uuid::new_v4();
        let error = VoiceError::TransportLost("refused".into());
        let (next, effects) = step(
            &State::Connecting { attempt },
            Event::TransportFailed {
                attempt,
                error: error.clone(),
            },
        );
        assert_eq!(next, State::Failed { reason: error });
        assert!(has(&effects, Effect::ReleaseGuard));
        assert!(!next.is_active());
    }

    #[test]
    fn start_conversation_only_from_idle() {
        let (next, effects) = step(
            &connected(ConversationState::Idle, false),
            Event::StartConversation,
        );
        assert_eq!(next.conversation_state(), Some(ConversationState::Listening));
        assert!(next.capture_active());
        assert_eq!(effects[0], Effect::OpenCapture);

        for state in [
            State::Disconnected,
            connected(ConversationState::Listening, true),
            connected(ConversationState::Speaking, true),
        ] {
            let err = reduce(&state, Event::StartConversation).unwrap_err();
            assert!(matches!(err, VoiceError::InvalidStateTransition { .. }));
        }
    }

    #[test]
    fn stop_conversation_keeps_transport() {
        let (next, effects) = step(
            &connected(ConversationState::Speaking, true),
            Event::StopConversation,
        );
        assert_eq!(next, connected(ConversationState::Idle, false));
        assert!(has(&effects, Effect::CloseCapture));
        assert!(has(&effects, Effect::FlushPlayback));
        assert!(!has(&effects, Effect::CloseTransport));
    }

    #[test]
    fn stop_conversation_when_idle_is_noop() {
        let state = connected(ConversationState::Idle, false);
        let (next, effects) = step(&state, Event::StopConversation);
        assert_eq!(next, state);
        assert!(effects.is_empty());

        let err = reduce(&State::Disconnected, Event::StopConversation).unwrap_err();
        assert!(matches!(err, VoiceError::InvalidStateTransition { .. }));
    }

    #[test]
    fn disconnect_is_always_safe() {
        let (next, effects) = step(&State::Disconnected, Event::Disconnect);
        assert_eq!(next, State::Disconnected);
        assert!(effects.is_empty());

        let (next, effects) = step(&connected(ConversationState::Listening, true), Event::Disconnect);
        assert_eq!(next, State::Disconnected);
        assert!(has(&effects, Effect::CloseCapture));
        assert!(has(&effects, Effect::CloseTransport));
        assert!(has(&effects, Effect::ReleaseGuard));

        let failed = State::Failed {
            reason: VoiceError::TransportLost("x".into()),
        };
        let (next, _) = step(&failed, Event::Disconnect);
        assert_eq!(next, State::Disconnected);
    }

    #[test]
    fn speech_events_toggle_user_flag_and_stay_listening() {
        let listening = connected(ConversationState::Listening, true);

        let (started, _) = step(&listening, Event::SpeechStarted);
        assert!(started.user_speaking());
        assert_eq!(started.conversation_state(), Some(ConversationState::Listening));

        let (stopped, effects) = step(&started, Event::SpeechStopped { key: None });
        assert!(!stopped.user_speaking());
        assert_eq!(stopped.conversation_state(), Some(ConversationState::Listening));
        assert!(has(&effects, Effect::SendResponseCreate));
    }

    #[test]
    fn duplicate_stop_sends_one_response_create() {
        let listening = connected(ConversationState::Listening, true);
        let (started, _) = step(&listening, Event::SpeechStarted);

        let (first, effects) = step(&started, Event::SpeechStopped { key: None });
        assert!(has(&effects, Effect::SendResponseCreate));

        let (_, effects) = step(&first, Event::SpeechStopped { key: None });
        assert!(!has(&effects, Effect::SendResponseCreate));
        assert!(has(&effects, Effect::DuplicateStopSuppressed));
    }

    #[test]
    fn redelivered_keyed_stop_is_suppressed() {
        let listening = connected(ConversationState::Listening, true);
        let key = Some("item_1".to_string());

        let (first, effects) = step(&listening, Event::SpeechStopped { key: key.clone() });
        assert!(has(&effects, Effect::SendResponseCreate));

        // Even after a new start, the same stop id must not trigger again
        let (restarted, _) = step(&first, Event::SpeechStarted);
        let (_, effects) = step(&restarted, Event::SpeechStopped { key });
        assert!(!has(&effects, Effect::SendResponseCreate));

        let (_, effects) = step(
            &restarted,
            Event::SpeechStopped {
                key: Some("item_2".to_string()),
            },
        );
        assert!(has(&effects, Effect::SendResponseCreate));
    }

    #[test]
    fn stop_after_conversation_stopped_does_not_trigger() {
        let (_, effects) = step(
            &connected(ConversationState::Idle, false),
            Event::SpeechStopped { key: None },
        );
        assert!(!has(&effects, Effect::SendResponseCreate));
    }

    #[test]
    fn response_lifecycle() {
        let listening = connected(ConversationState::Listening, true);

        let (processing, _) = step(&listening, Event::ResponseCreated);
        assert_eq!(processing.conversation_state(), Some(ConversationState::Processing));

        let (speaking, effects) = step(&processing, Event::AudioDelta);
        assert_eq!(speaking.conversation_state(), Some(ConversationState::Speaking));
        assert!(has(&effects, Effect::EmitUi));

        // Idempotent while already speaking
        let (again, effects) = step(&speaking, Event::AudioDelta);
        assert_eq!(again, speaking);
        assert!(effects.is_empty());

        let (done, _) = step(&speaking, Event::ResponseDone);
        assert_eq!(done.conversation_state(), Some(ConversationState::Listening));
    }

    #[test]
    fn text_only_response_returns_to_idle() {
        let idle = connected(ConversationState::Idle, false);
        let (processing, _) = step(&idle, Event::ResponseCreated);
        let (done, _) = step(&processing, Event::ResponseDone);
        assert_eq!(done.conversation_state(), Some(ConversationState::Idle));
    }

    #[test]
    fn normal_close_drains_playback() {
        let (next, effects) = step(
            &connected(ConversationState::Speaking, false),
            Event::TransportClosed { error: None },
        );
        assert_eq!(next, State::Disconnected);
        assert!(has(&effects, Effect::DrainPlayback));
        assert!(!has(&effects, Effect::FlushPlayback));
    }

    #[test]
    fn duplicate_close_is_distinct_failure() {
        let error = VoiceError::DuplicateConnection("close code 4409".into());
        let (next, effects) = step(
            &connected(ConversationState::Listening, true),
            Event::TransportClosed {
                error: Some(error.clone()),
            },
        );
        assert_eq!(
            next,
            State::Failed {
                reason: error.clone()
            }
        );
        assert!(has(&effects, Effect::ReportError(error)));
        assert!(has(&effects, Effect::ReleaseGuard));
    }

    #[test]
    fn capture_lost_keeps_assistant_speaking() {
        let (next, effects) = step(
            &connected(ConversationState::Speaking, true),
            Event::CaptureLost {
                message: "unplugged".into(),
            },
        );
        assert_eq!(next.conversation_state(), Some(ConversationState::Speaking));
        assert!(!next.capture_active());
        assert!(has(
            &effects,
            Effect::ReportError(VoiceError::DeviceUnavailable("unplugged".into()))
        ));

        let (next, _) = step(
            &connected(ConversationState::Listening, true),
            Event::CaptureLost {
                message: "unplugged".into(),
            },
        );
        assert_eq!(next.conversation_state(), Some(ConversationState::Idle));
    }

    #[test]
    fn protocol_events_ignored_when_disconnected() {
        let (next, effects) = step(&State::Disconnected, Event::AudioDelta);
        assert_eq!(next, State::Disconnected);
        assert!(effects.is_empty());
    }

    #[test]
    fn state_display_names() {
        assert_eq!(State::Disconnected.to_string(), "disconnected");
        assert_eq!(connected(ConversationState::Processing, true).to_string(), "processing");
    }
}
