//! Session core: the single owner of protocol state and the effect runner.
//!
//! Every mutation happens under `SessionInner::core`. Public calls and the
//! network loop both lock it, feed one event through the reducer, and run
//! the resulting effects before unlocking, so transitions never interleave.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::SessionEvent;
use crate::audio::{
    AudioCaptureEngine, AudioFrame, AudioPlaybackEngine, CaptureNotice, Direction, Utterance,
    UtteranceId, UtteranceLog,
};
use crate::error::VoiceError;
use crate::guard::{ConnectionGuard, GuardTicket, GuardedSession};
use crate::metrics::SessionMetrics;
use crate::settings::VoiceSettings;
use crate::state_machine::{reduce, ConnectionState, ConversationState, Effect, Event, State};
use crate::streaming::{ClientMessage, ConnectRequest, Connector, TranscriptAggregator};
use crate::transcript::TranscriptMessage;

/// Live half of the transport held by the session
pub(super) struct TransportLink {
    pub outgoing: mpsc::Sender<String>,
    pub shutdown: CancellationToken,
}

/// Bookkeeping for one assistant response
pub(super) struct InboundResponse {
    pub utterance: UtteranceId,
    pub next_sequence: u64,
    /// Flushed by a stop; later deltas are dropped
    pub discarded: bool,
}

/// Last UI-visible values, for change detection
#[derive(Debug, Clone, Copy, PartialEq)]
struct UiSnapshot {
    connection: ConnectionState,
    conversation: Option<ConversationState>,
    user_speaking: bool,
    assistant_speaking: bool,
}

impl UiSnapshot {
    fn of(state: &State) -> Self {
        let conversation = state.conversation_state();
        Self {
            connection: state.connection_state(),
            conversation,
            user_speaking: state.user_speaking(),
            assistant_speaking: conversation == Some(ConversationState::Speaking),
        }
    }
}

pub(super) struct SessionCore {
    pub state: State,
    pub ticket: Option<GuardTicket>,
    pub link: Option<TransportLink>,
    /// Bumped per connection; the network loop ignores other epochs
    pub epoch: u64,
    pub capture: AudioCaptureEngine,
    pub transcript: Vec<TranscriptMessage>,
    pub utterances: UtteranceLog,
    /// Keyed by service `response.id`
    pub responses: HashMap<String, InboundResponse>,
    pub current_response: Option<String>,
    pub outbound: Option<UtteranceId>,
    pub aggregator: TranscriptAggregator,
    pub server_session_id: Option<String>,
    /// PlaybackUnavailable already reported for this connection
    pub playback_warned: bool,
    emitted: UiSnapshot,
}

impl SessionCore {
    pub fn new(capture: AudioCaptureEngine) -> Self {
        Self {
            state: State::Disconnected,
            ticket: None,
            link: None,
            epoch: 0,
            capture,
            transcript: Vec::new(),
            utterances: UtteranceLog::new(),
            responses: HashMap::new(),
            current_response: None,
            outbound: None,
            aggregator: TranscriptAggregator::new(),
            server_session_id: None,
            playback_warned: false,
            emitted: UiSnapshot::of(&State::Disconnected),
        }
    }

    /// Whether `epoch` is the live connection
    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.link.is_some()
    }

    fn reset_connection(&mut self) {
        self.responses.clear();
        self.current_response = None;
        self.aggregator.reset();
        self.playback_warned = false;
    }
}

pub(crate) struct SessionInner {
    pub id: Uuid,
    pub settings: VoiceSettings,
    pub api_key: Option<String>,
    pub connector: Arc<dyn Connector>,
    pub guard: Arc<ConnectionGuard>,
    pub core: Mutex<SessionCore>,
    pub playback: AudioPlaybackEngine,
    pub frames_rx: tokio::sync::Mutex<mpsc::Receiver<AudioFrame>>,
    pub notices_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<CaptureNotice>>,
    pub events: broadcast::Sender<SessionEvent>,
    pub metrics: Arc<SessionMetrics>,
    pub this: Weak<SessionInner>,
}

impl SessionInner {
    pub fn lock_core(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connect_request(&self) -> ConnectRequest {
        let mut request = ConnectRequest::new(self.settings.effective_endpoint());
        request.outbound_queue_depth = self.settings.outbound_queue_depth;
        match self.api_key.as_deref() {
            Some(key) => request.with_api_key(key),
            None => request,
        }
    }

    /// Feed one event through the reducer and run its effects.
    ///
    /// Fails only for commands the current state rejects, or when opening
    /// the microphone fails (the state is rolled back via `CaptureFailed`).
    pub fn apply(&self, core: &mut SessionCore, event: Event) -> Result<(), VoiceError> {
        let before = core.state.to_string();
        let (next, effects) = reduce(&core.state, event)?;
        if next.to_string() != before {
            log::info!("Session {}: {} -> {}", self.id, before, next);
        }
        core.state = next;

        for effect in effects {
            if let Err(error) = self.run_effect(core, effect) {
                log::warn!("Session {}: {}", self.id, error);
                self.apply(core, Event::CaptureFailed { error: error.clone() })?;
                return Err(error);
            }
        }
        Ok(())
    }

    /// `apply` for events that come from the wire or devices
    pub fn dispatch(&self, core: &mut SessionCore, event: Event) {
        if let Err(e) = self.apply(core, event) {
            log::warn!("Session {}: {}", self.id, e);
        }
    }

    fn run_effect(&self, core: &mut SessionCore, effect: Effect) -> Result<(), VoiceError> {
        log::debug!("Session {}: effect {:?}", self.id, effect);
        match effect {
            Effect::OpenPlayback => {
                if let Err(e) = self.playback.open(&self.settings.playback_config()) {
                    core.playback_warned = true;
                    self.report(&e);
                }
            }
            Effect::OpenCapture => {
                core.capture.open(&self.settings.capture_config())?;
                let utterance = core.capture.arm()?;
                self.open_outbound(core, utterance);
            }
            Effect::CloseCapture => {
                core.capture.close();
                if let Some(utterance) = core.outbound.take() {
                    core.utterances.finalize(utterance);
                }
            }
            Effect::FlushPlayback => {
                for response in core.responses.values_mut() {
                    response.discarded = true;
                }
                self.playback.flush();
            }
            Effect::DrainPlayback => {
                let utterances: Vec<UtteranceId> =
                    core.responses.values().map(|r| r.utterance).collect();
                for utterance in &utterances {
                    self.playback.complete_utterance(*utterance);
                }
                self.spawn_drain(utterances);
            }
            Effect::ClosePlayback => self.playback.close(),
            Effect::CloseTransport => {
                if let Some(link) = core.link.take() {
                    link.shutdown.cancel();
                }
                core.epoch += 1;
                core.reset_connection();
            }
            Effect::SendResponseCreate => match self.send(core, ClientMessage::response_create()) {
                Ok(()) => {
                    self.metrics.response_triggered();
                    log::info!("Session {}: speech stopped, response requested", self.id);
                }
                Err(e) => self.report(&e),
            },
            Effect::ReleaseGuard => core.ticket = None,
            Effect::AppendWelcome => {
                let welcome = self.settings.welcome_message.trim();
                if !welcome.is_empty() {
                    self.append_message(core, TranscriptMessage::system(welcome));
                }
            }
            Effect::ReportError(error) => self.report(&error),
            Effect::DuplicateStopSuppressed => {
                self.metrics.duplicate_stop();
                log::debug!("Session {}: duplicate speech_stopped suppressed", self.id);
            }
            Effect::EmitUi => self.emit_ui(core),
        }
        Ok(())
    }

    /// Queue a control message. Control messages are never dropped: if the
    /// queue is full the send completes on a task.
    pub fn send(&self, core: &SessionCore, message: ClientMessage) -> Result<(), VoiceError> {
        let link = core
            .link
            .as_ref()
            .ok_or_else(|| VoiceError::TransportLost("not connected".to_string()))?;
        let json = message.to_json()?;

        match link.outgoing.try_send(json) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(json)) => {
                let outgoing = link.outgoing.clone();
                let handle = tokio::runtime::Handle::try_current().map_err(|_| {
                    VoiceError::TransportLost("outbound queue full".to_string())
                })?;
                handle.spawn(async move {
                    if outgoing.send(json).await.is_err() {
                        log::debug!("Session: connection closed before queued send");
                    }
                });
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(VoiceError::TransportLost("connection closed".to_string()))
            }
        }
    }

    pub fn open_outbound(&self, core: &mut SessionCore, utterance: UtteranceId) {
        if let Some(previous) = core.outbound.replace(utterance) {
            core.utterances.finalize(previous);
        }
        core.utterances
            .open(Utterance::new(utterance, Direction::Outbound, None));
        log::debug!("Session {}: outbound {}", self.id, utterance);
    }

    pub fn append_message(&self, core: &mut SessionCore, message: TranscriptMessage) {
        core.transcript.push(message.clone());
        self.broadcast(SessionEvent::MessageAdded(message));
    }

    /// Count an error and surface it to the UI.
    ///
    /// Decode and protocol errors concern a single message; they are counted
    /// and logged only.
    pub fn report(&self, error: &VoiceError) {
        match error {
            VoiceError::DecodeError(m) => self.metrics.decode_error(m.clone()),
            VoiceError::ProtocolError(m) => self.metrics.protocol_error(m.clone()),
            VoiceError::Service { .. } => self.metrics.service_error(error.to_string()),
            other => self.metrics.record_error(other.kind(), other.to_string()),
        }

        match error {
            VoiceError::DecodeError(_) | VoiceError::ProtocolError(_) => {
                log::warn!("Session {}: dropped message: {}", self.id, error);
            }
            _ => {
                log::warn!("Session {}: {}", self.id, error);
                self.broadcast(SessionEvent::Error(error.clone()));
            }
        }
    }

    pub fn broadcast(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_ui(&self, core: &mut SessionCore) {
        let now = UiSnapshot::of(&core.state);
        let was = core.emitted;
        if now == was {
            return;
        }

        if now.connection != was.connection {
            self.broadcast(SessionEvent::ConnectionChanged(now.connection));
        }
        if now.conversation != was.conversation {
            if let Some(conversation) = now.conversation {
                self.broadcast(SessionEvent::ConversationChanged(conversation));
            }
        }
        if now.user_speaking != was.user_speaking {
            self.broadcast(SessionEvent::UserSpeakingChanged(now.user_speaking));
        }
        if now.assistant_speaking != was.assistant_speaking {
            self.broadcast(SessionEvent::AssistantSpeakingChanged(now.assistant_speaking));
        }
        core.emitted = now;
    }

    /// Let the closing connection's audio finish, then release the device
    /// unless a new connection picked it up in the meantime.
    ///
    /// Only `utterances` are waited on and, on timeout, discarded. Audio of a
    /// later connection is never touched.
    fn spawn_drain(&self, utterances: Vec<UtteranceId>) {
        let Some(inner) = self.this.upgrade() else {
            self.playback.close();
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.playback.close();
            return;
        };

        handle.spawn(async move {
            let timeout = inner.settings.drain_timeout();
            if !inner.playback.drain_utterances(&utterances, timeout).await {
                inner.playback.discard(&utterances);
            }
            let core = inner.lock_core();
            if !core.state.is_active() {
                inner.playback.close();
            }
        });
    }

    pub fn disconnect(&self) {
        let mut core = self.lock_core();
        self.dispatch(&mut core, Event::Disconnect);
    }
}

impl GuardedSession for SessionInner {
    fn session_id(&self) -> Uuid {
        self.id
    }

    fn force_disconnect(&self) {
        self.disconnect();
    }
}
