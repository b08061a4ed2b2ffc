//! Per-connection network loop
//!
//! One task per connection. It reads inbound events strictly in arrival
//! order, one at a time, and drains the capture hand-off queue onto the wire.
//!
//! Capture queues are polled before inbound traffic: a burst of inbound
//! deltas must not starve the microphone.
//!
//! ```text
//!            ┌──────────── select! (biased) ────────────┐
//! shutdown ──┤ exit                                     │
//! notices  ──┤ CaptureLost                              │
//! frames   ──┤ base64 → input_audio_buffer.append       │
//! incoming ──┤ parse ServerMessage → reducer + effects  │
//!            └──────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::inner::{InboundResponse, SessionCore, SessionInner};
use super::SessionEvent;
use crate::audio::{AudioFrame, CaptureNotice, Direction, FrameCodec, Utterance, UtteranceId};
use crate::error::VoiceError;
use crate::state_machine::Event;
use crate::streaming::{ClientMessage, ServerMessage, TransportEvent, CLOSE_NORMAL};
use crate::transcript::TranscriptMessage;

/// Key for audio that arrives without a response id
const UNNAMED_RESPONSE: &str = "response";

pub(super) async fn run(
    inner: Arc<SessionInner>,
    epoch: u64,
    mut incoming: mpsc::Receiver<TransportEvent>,
    shutdown: CancellationToken,
) {
    let mut frames = inner.frames_rx.lock().await;
    let mut notices = inner.notices_rx.lock().await;

    log::info!("Session {}: network loop started (epoch {})", inner.id, epoch);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            Some(notice) = notices.recv() => handle_notice(&inner, epoch, notice),

            Some(frame) = frames.recv() => forward_frame(&inner, epoch, frame),

            event = incoming.recv() => {
                let event = event.unwrap_or_else(|| TransportEvent::Closed {
                    code: None,
                    reason: "transport dropped".to_string(),
                });
                if !handle_transport_event(&inner, epoch, event) {
                    break;
                }
            }
        }
    }

    log::info!("Session {}: network loop exited (epoch {})", inner.id, epoch);
}

/// Returns false once the connection is gone
fn handle_transport_event(inner: &SessionInner, epoch: u64, event: TransportEvent) -> bool {
    let mut core = inner.lock_core();
    if !core.is_current(epoch) {
        return false;
    }

    match event {
        TransportEvent::Message(text) => {
            handle_message(inner, &mut core, &text);
            true
        }
        TransportEvent::Closed { code, reason } => {
            let error = classify_close(inner.settings.duplicate_close_code, code, &reason);
            match &error {
                None => log::info!("Session {}: server closed the connection", inner.id),
                Some(e) => log::warn!("Session {}: {}", inner.id, e),
            }
            inner.dispatch(&mut core, Event::TransportClosed { error });
            false
        }
        TransportEvent::Error(message) => {
            let error = if message.to_lowercase().contains("duplicate") {
                VoiceError::DuplicateConnection(message)
            } else {
                VoiceError::TransportLost(message)
            };
            inner.dispatch(&mut core, Event::TransportClosed { error: Some(error) });
            false
        }
    }
}

/// None for a normal close; otherwise the failure to surface
pub(super) fn classify_close(
    duplicate_code: u16,
    code: Option<u16>,
    reason: &str,
) -> Option<VoiceError> {
    if code == Some(CLOSE_NORMAL) {
        return None;
    }

    let describe = |fallback: String| {
        if reason.is_empty() {
            fallback
        } else {
            reason.to_string()
        }
    };

    if code == Some(duplicate_code) || reason.to_lowercase().contains("duplicate") {
        return Some(VoiceError::DuplicateConnection(describe(format!(
            "close code {}",
            duplicate_code
        ))));
    }

    Some(VoiceError::TransportLost(match code {
        Some(code) => describe(format!("closed with code {}", code)),
        None => describe("connection closed without a close frame".to_string()),
    }))
}

fn handle_notice(inner: &SessionInner, epoch: u64, notice: CaptureNotice) {
    let mut core = inner.lock_core();
    if !core.is_current(epoch) {
        return;
    }
    match notice {
        CaptureNotice::DeviceLost(message) => {
            inner.dispatch(&mut core, Event::CaptureLost { message });
        }
    }
}

fn forward_frame(inner: &SessionInner, epoch: u64, frame: AudioFrame) {
    let mut core = inner.lock_core();
    // Captured before a stop or a reconnect: it belongs to no live conversation
    if !core.is_current(epoch) || !core.capture.accepts(&frame) {
        inner.metrics.frame_dropped();
        log::trace!("Session {}: dropped stale frame {}", inner.id, frame.sequence());
        return;
    }

    let utterance = frame.utterance();
    let sequence = frame.sequence();
    let audio = FrameCodec::to_transport_text(&frame.into_pcm());
    let json = match ClientMessage::audio_append(audio).to_json() {
        Ok(json) => json,
        Err(e) => {
            inner.report(&e);
            return;
        }
    };

    let sent = match core.link.as_ref() {
        Some(link) => link.outgoing.try_send(json).is_ok(),
        None => false,
    };
    if sent {
        inner.metrics.frame_sent();
        if let Some(u) = core.utterances.get_mut(utterance) {
            u.frame_count += 1;
        }
    } else {
        inner.metrics.frame_dropped();
        log::trace!("Session {}: outbound queue full, dropped frame {}", inner.id, sequence);
    }
}

fn handle_message(inner: &SessionInner, core: &mut SessionCore, text: &str) {
    let message = match ServerMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            inner.report(&e);
            return;
        }
    };
    log::debug!("Session {}: received {}", inner.id, message.kind());

    match message {
        ServerMessage::SessionCreated { session } | ServerMessage::SessionUpdated { session } => {
            log::info!(
                "Session {}: server session {} ({})",
                inner.id,
                session.id,
                session.model
            );
            core.server_session_id = Some(session.id);
        }

        ServerMessage::Error { error } => {
            let error = VoiceError::Service {
                code: error.code_or_type().to_string(),
                message: error.message,
            };
            inner.append_message(core, TranscriptMessage::system(error.to_string()));
            inner.report(&error);
        }

        ServerMessage::AudioCommitted { item_id, .. } => {
            if let Some(id) = core.outbound {
                if let Some(utterance) = core.utterances.get_mut(id) {
                    utterance.remote_id = item_id;
                }
            }
        }

        ServerMessage::SpeechStarted { .. } => {
            if core.capture.is_armed() {
                let utterance = core.capture.begin_utterance();
                inner.open_outbound(core, utterance);
            }
            inner.dispatch(core, Event::SpeechStarted);
        }

        ref stopped @ ServerMessage::SpeechStopped { .. } => {
            let key = stopped.stop_key();
            if let Some(id) = core.outbound {
                core.utterances.finalize(id);
            }
            inner.dispatch(core, Event::SpeechStopped { key });
        }

        ServerMessage::ResponseCreated { response } => {
            open_response(core, &response.id);
            core.current_response = Some(response.id);
            inner.dispatch(core, Event::ResponseCreated);
        }

        ServerMessage::AudioDelta {
            response_id, delta, ..
        } => handle_audio_delta(inner, core, response_id, &delta),

        ServerMessage::AudioDone { response_id, .. } => {
            let key = response_key(core, response_id);
            if let Some(response) = core.responses.get(&key) {
                let utterance = response.utterance;
                inner.playback.complete_utterance(utterance);
                core.utterances.finalize(utterance);
            }
        }

        ServerMessage::AudioTranscriptDelta { response_id, delta } => {
            let key = response_key(core, response_id);
            let text = core.aggregator.process_delta(&key, &delta).to_string();
            inner.broadcast(SessionEvent::AssistantTranscriptDelta {
                response_id: key,
                text,
            });
        }

        ServerMessage::AudioTranscriptDone {
            response_id,
            transcript,
        } => {
            let key = response_key(core, response_id);
            let text = core.aggregator.process_completed(&key, &transcript);
            if let Some(utterance) = core.responses.get(&key).map(|r| r.utterance) {
                if let Some(u) = core.utterances.get_mut(utterance) {
                    u.transcript = Some(text.clone());
                }
            }
            if !text.trim().is_empty() {
                inner.append_message(core, TranscriptMessage::assistant(text));
            }
        }

        ServerMessage::InputTranscriptionCompleted {
            item_id,
            transcript,
        } => {
            let utterance = item_id
                .as_deref()
                .and_then(|item| core.utterances.by_remote_id(Direction::Outbound, item))
                .map(|u| u.id);
            if let Some(u) = utterance.and_then(|id| core.utterances.get_mut(id)) {
                u.transcript = Some(transcript.clone());
            }
            let transcript = transcript.trim();
            if !transcript.is_empty() {
                inner.append_message(core, TranscriptMessage::user(transcript));
            }
        }

        ServerMessage::FunctionCallArgumentsDelta { call_id, delta } => {
            log::trace!(
                "Session {}: function call {:?} +{} bytes",
                inner.id,
                call_id,
                delta.len()
            );
        }

        ServerMessage::FunctionCallArgumentsDone {
            call_id,
            name,
            arguments,
        } => {
            log::info!("Session {}: function call {:?} ({:?})", inner.id, name, call_id);
            inner.broadcast(SessionEvent::FunctionCall {
                call_id: call_id.unwrap_or_default(),
                name: name.unwrap_or_default(),
                arguments,
            });
        }

        ServerMessage::ResponseDone { response } => {
            if let Some(finished) = core.responses.remove(&response.id) {
                inner.playback.complete_utterance(finished.utterance);
                core.utterances.finalize(finished.utterance);
            }
            core.aggregator.discard(&response.id);
            if core.current_response.as_deref() == Some(response.id.as_str()) {
                core.current_response = None;
            }
            log::debug!(
                "Session {}: response {} done ({:?})",
                inner.id,
                response.id,
                response.status
            );
            inner.dispatch(core, Event::ResponseDone);
        }

        ServerMessage::Unknown => {}
    }
}

fn handle_audio_delta(
    inner: &SessionInner,
    core: &mut SessionCore,
    response_id: Option<String>,
    delta: &str,
) {
    let pcm = match FrameCodec::from_transport_text(delta) {
        Ok(pcm) if pcm.len() % 2 == 0 => pcm,
        Ok(pcm) => {
            inner.report(&VoiceError::DecodeError(format!(
                "PCM16 payload has odd length {}",
                pcm.len()
            )));
            return;
        }
        Err(e) => {
            inner.report(&e);
            return;
        }
    };

    let key = response_key(core, response_id);
    if !core.responses.contains_key(&key) {
        // Audio without response.created: track it anyway
        open_response(core, &key);
        core.current_response = Some(key.clone());
    }

    let Some(response) = core.responses.get_mut(&key) else {
        return;
    };
    if response.discarded {
        log::trace!("Session {}: dropping audio of flushed response {}", inner.id, key);
        return;
    }
    let utterance = response.utterance;
    let sequence = response.next_sequence;
    response.next_sequence += 1;

    inner.metrics.response_audio_started();
    match inner.playback.enqueue(AudioFrame::new(utterance, sequence, pcm)) {
        Ok(()) => {
            if let Some(u) = core.utterances.get_mut(utterance) {
                u.frame_count += 1;
            }
        }
        Err(e @ VoiceError::PlaybackUnavailable(_)) => {
            if !core.playback_warned {
                core.playback_warned = true;
                inner.report(&e);
            }
        }
        Err(e) => inner.report(&e),
    }

    inner.dispatch(core, Event::AudioDelta);
}

fn response_key(core: &SessionCore, response_id: Option<String>) -> String {
    response_id
        .or_else(|| core.current_response.clone())
        .unwrap_or_else(|| UNNAMED_RESPONSE.to_string())
}

fn open_response(core: &mut SessionCore, response_id: &str) -> UtteranceId {
    if let Some(existing) = core.responses.get(response_id) {
        return existing.utterance;
    }
    let utterance = UtteranceId::next();
    core.utterances.open(Utterance::new(
        utterance,
        Direction::Inbound,
        Some(response_id.to_string()),
    ));
    core.responses.insert(
        response_id.to_string(),
        InboundResponse {
            utterance,
            next_sequence: 0,
            discarded: false,
        },
    );
    utterance
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_close_is_not_an_error() {
        assert_eq!(classify_close(4409, Some(1000), "bye"), None);
    }

    #[test]
    fn test_duplicate_close_code() {
        assert_eq!(
            classify_close(4409, Some(4409), ""),
            Some(VoiceError::DuplicateConnection("close code 4409".to_string()))
        );
        // Reason surfaced verbatim
        assert_eq!(
            classify_close(4409, Some(4409), "Another session is active"),
            Some(VoiceError::DuplicateConnection(
                "Another session is active".to_string()
            ))
        );
    }

    #[test]
    fn test_duplicate_reason_with_other_code() {
        assert!(matches!(
            classify_close(4409, Some(1008), "duplicate connection"),
            Some(VoiceError::DuplicateConnection(_))
        ));
    }

    #[test]
    fn test_abnormal_close_is_transport_lost() {
        assert_eq!(
            classify_close(4409, Some(1011), ""),
            Some(VoiceError::TransportLost("closed with code 1011".to_string()))
        );
        assert!(matches!(
            classify_close(4409, None, ""),
            Some(VoiceError::TransportLost(_))
        ));
    }
}
