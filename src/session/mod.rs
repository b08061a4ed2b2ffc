//! Voice session
//!
//! [`VoiceSession`] owns one duplex connection to the realtime service and
//! the two audio engines. The UI drives it with `connect`, `start_conversation`,
//! `stop_conversation`, `send_text` and `disconnect`, and listens on
//! [`VoiceSession::subscribe`].
//!
//! # Architecture
//!
//! ```text
//!            ┌────────────────────── VoiceSession ──────────────────────┐
//!  UI ──────▶│ command → reduce(State, Event) → effects                 │
//!            │                                                          │
//!  mic ─────▶│ capture queue ─┐                                         │
//!            │                ├─▶ network loop ─▶ reduce ─▶ effects ───▶│──▶ broadcast
//!  wire ────▶│ incoming ──────┘        │                                │     SessionEvent
//!            │                         └──▶ AudioPlaybackEngine ───────▶│──▶ speaker
//!            └──────────────────────────────────────────────────────────┘
//! ```

mod dispatch;
mod inner;

use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::audio::{
    AudioCaptureEngine, AudioPlaybackEngine, CpalInput, CpalOutput, InputBackend, OutputBackend,
};
use crate::error::VoiceError;
use crate::guard::{ConnectionGuard, GuardedSession};
use crate::metrics::{MetricsSnapshot, SessionMetrics};
use crate::settings::VoiceSettings;
use crate::state_machine::{ConnectionState, ConversationState, Event, State};
use crate::streaming::{connect_with_timeout, ClientMessage, Connector, WebSocketConnector};
use crate::transcript::TranscriptMessage;

use inner::{SessionCore, SessionInner, TransportLink};

/// Capacity of the UI event channel; slow subscribers see `Lagged`
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something the UI should react to
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A transcript line was appended
    MessageAdded(TranscriptMessage),
    UserSpeakingChanged(bool),
    /// Assistant audio started or stopped arriving
    AssistantSpeakingChanged(bool),
    ConnectionChanged(ConnectionState),
    ConversationChanged(ConversationState),
    /// Running text of an assistant response
    AssistantTranscriptDelta { response_id: String, text: String },
    /// The assistant called a tool; the host decides what to do with it
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    Error(VoiceError),
}

/// Builder for [`VoiceSession`]. Real devices and the WebSocket connector
/// are used unless replaced.
pub struct VoiceSessionBuilder {
    settings: VoiceSettings,
    api_key: Option<String>,
    connector: Option<Arc<dyn Connector>>,
    input: Option<Box<dyn InputBackend>>,
    output: Option<Box<dyn OutputBackend>>,
    guard: Option<Arc<ConnectionGuard>>,
}

impl VoiceSessionBuilder {
    pub fn new(settings: VoiceSettings) -> Self {
        Self {
            settings,
            api_key: None,
            connector: None,
            input: None,
            output: None,
            guard: None,
        }
    }

    pub fn api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn input(mut self, input: Box<dyn InputBackend>) -> Self {
        self.input = Some(input);
        self
    }

    pub fn output(mut self, output: Box<dyn OutputBackend>) -> Self {
        self.output = Some(output);
        self
    }

    /// Use a private guard instead of the process-wide one
    pub fn guard(mut self, guard: Arc<ConnectionGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn build(self) -> VoiceSession {
        let metrics = Arc::new(SessionMetrics::new());
        let (frames_tx, frames_rx) = mpsc::channel(self.settings.capture_queue_depth.max(1));
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let capture = AudioCaptureEngine::new(
            self.input.unwrap_or_else(|| Box::new(CpalInput::new())),
            frames_tx,
            notices_tx,
            metrics.clone(),
        );
        let playback = AudioPlaybackEngine::new(
            self.output.unwrap_or_else(|| Box::new(CpalOutput::new())),
            metrics.clone(),
        );

        let inner = Arc::new_cyclic(|this| SessionInner {
            id: Uuid::new_v4(),
            settings: self.settings,
            api_key: self.api_key,
            connector: self
                .connector
                .unwrap_or_else(|| Arc::new(WebSocketConnector::new())),
            guard: self.guard.unwrap_or_else(ConnectionGuard::global),
            core: Mutex::new(SessionCore::new(capture)),
            playback,
            frames_rx: tokio::sync::Mutex::new(frames_rx),
            notices_rx: tokio::sync::Mutex::new(notices_rx),
            events,
            metrics,
            this: this.clone(),
        });

        log::debug!("Session {}: created", inner.id);
        VoiceSession { inner }
    }
}

/// Handle to one voice session. Dropping it disconnects.
pub struct VoiceSession {
    inner: Arc<SessionInner>,
}

impl VoiceSession {
    pub fn builder(settings: VoiceSettings) -> VoiceSessionBuilder {
        VoiceSessionBuilder::new(settings)
    }

    /// Open the connection. Resolves once the transport is open.
    ///
    /// Fails fast with `AlreadyActive` if this or any other session is
    /// connecting or connected. No session configuration is sent on open.
    pub async fn connect(&self) -> Result<(), VoiceError> {
        let inner = &self.inner;
        let attempt = Uuid::new_v4();

        let request = {
            let mut core = inner.lock_core();
            if core.state.is_active() {
                return Err(VoiceError::AlreadyActive);
            }

            // Fails while the host is hidden
            let session: Arc<dyn GuardedSession> = inner.clone();
            let session = Arc::downgrade(&session);
            let ticket = inner.guard.try_acquire(inner.id, session)?;
            inner.apply(&mut core, Event::Connect { attempt })?;
            core.ticket = Some(ticket);
            inner.connect_request()
        };

        let result = connect_with_timeout(
            inner.connector.as_ref(),
            &request,
            inner.settings.connect_timeout(),
        )
        .await;

        let mut core = inner.lock_core();
        if core.state != (State::Connecting { attempt }) {
            // Disconnected (or hidden) while the handshake was in flight
            if let Ok(channels) = result {
                channels.shutdown.cancel();
            }
            log::info!("Session {}: connect abandoned ({})", inner.id, core.state);
            return Err(VoiceError::invalid("finish connecting", &core.state));
        }

        match result {
            Ok(channels) => {
                core.epoch += 1;
                let epoch = core.epoch;
                core.link = Some(TransportLink {
                    outgoing: channels.outgoing,
                    shutdown: channels.shutdown.clone(),
                });
                core.server_session_id = None;
                inner.apply(&mut core, Event::TransportOpened { attempt })?;
                drop(core);

                tokio::spawn(dispatch::run(
                    inner.clone(),
                    epoch,
                    channels.incoming,
                    channels.shutdown,
                ));
                Ok(())
            }
            Err(error) => {
                log::warn!("Session {}: connect failed: {}", inner.id, error);
                inner.apply(
                    &mut core,
                    Event::TransportFailed {
                        attempt,
                        error: error.clone(),
                    },
                )?;
                Err(error)
            }
        }
    }

    /// Close everything. Safe in any state.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Open and arm the microphone. Only valid while connected and idle.
    pub fn start_conversation(&self) -> Result<(), VoiceError> {
        let mut core = self.inner.lock_core();
        self.inner.apply(&mut core, Event::StartConversation)
    }

    /// Close the microphone and flush assistant audio. The connection stays open.
    pub fn stop_conversation(&self) -> Result<(), VoiceError> {
        let mut core = self.inner.lock_core();
        self.inner.apply(&mut core, Event::StopConversation)
    }

    /// Send a typed user message and ask for a response.
    ///
    /// Blank text is ignored.
    pub fn send_text(&self, text: &str) -> Result<(), VoiceError> {
        let mut core = self.inner.lock_core();
        if core.state.connection_state() != ConnectionState::Connected {
            return Err(VoiceError::invalid("send text", &core.state));
        }

        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        self.inner
            .append_message(&mut core, TranscriptMessage::user(text));
        self.inner.send(&core, ClientMessage::user_text(text))?;
        self.inner.send(&core, ClientMessage::response_create())?;
        self.inner.metrics.response_triggered();
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock_core().state.connection_state()
    }

    /// None unless connected
    pub fn conversation_state(&self) -> Option<ConversationState> {
        self.inner.lock_core().state.conversation_state()
    }

    pub fn is_user_speaking(&self) -> bool {
        self.inner.lock_core().state.user_speaking()
    }

    /// Reason for the last failed connection, while in `Failed`
    pub fn failure(&self) -> Option<VoiceError> {
        match &self.inner.lock_core().state {
            State::Failed { reason } => Some(reason.clone()),
            _ => None,
        }
    }

    /// Copy of the transcript so far, oldest first
    pub fn transcript(&self) -> Vec<TranscriptMessage> {
        self.inner.lock_core().transcript.clone()
    }

    pub fn server_session_id(&self) -> Option<String> {
        self.inner.lock_core().server_session_id.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Inbound frames waiting for the speaker
    pub fn pending_playback_frames(&self) -> usize {
        self.inner.playback.pending_frames()
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.inner.disconnect();
    }
}
