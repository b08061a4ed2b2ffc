//! End-to-end session scenarios against in-memory devices and transport.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use vokey_voice::audio::FrameCodec;
use vokey_voice::testing::{ChannelConnector, FakeInput, FakeOutput, FakeServer};
use vokey_voice::{
    ConnectionGuard, ConnectionState, ConversationState, Role, SessionEvent, VoiceError,
    VoiceSession, VoiceSettings,
};

struct Rig {
    session: VoiceSession,
    connector: ChannelConnector,
    input: FakeInput,
    output: FakeOutput,
    guard: Arc<ConnectionGuard>,
}

fn small_frames() -> VoiceSettings {
    VoiceSettings {
        capture_frame_size: 4,
        ..Default::default()
    }
}

fn rig_with_guard(guard: Arc<ConnectionGuard>) -> Rig {
    rig_with(small_frames(), guard)
}

fn rig_with(settings: VoiceSettings, guard: Arc<ConnectionGuard>) -> Rig {
    let connector = ChannelConnector::new();
    let input = FakeInput::new();
    let output = FakeOutput::new();
    let session = VoiceSession::builder(settings)
        .connector(Arc::new(connector.clone()))
        .input(Box::new(input.clone()))
        .output(Box::new(output.clone()))
        .guard(guard.clone())
        .build();
    Rig {
        session,
        connector,
        input,
        output,
        guard,
    }
}

fn rig() -> Rig {
    rig_with_guard(Arc::new(ConnectionGuard::new()))
}

async fn connected(rig: &Rig) -> FakeServer {
    rig.session.connect().await.unwrap();
    rig.connector.take_server().expect("server end of connection")
}

async fn next_matching(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut matches: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream ended: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

fn delta(response_id: &str, value: f32, samples: usize) -> serde_json::Value {
    let pcm = FrameCodec::encode(&vec![value; samples]);
    json!({
        "type": "response.audio.delta",
        "response_id": response_id,
        "item_id": format!("item_{}", response_id),
        "delta": FrameCodec::to_transport_text(&pcm),
    })
}

fn quantized(value: f32) -> f32 {
    FrameCodec::decode(&FrameCodec::encode(&[value])).unwrap()[0]
}

/// Sync point: the loop handles messages in order, so once this transcript
/// shows up everything sent before it has been processed.
async fn barrier(server: &FakeServer, events: &mut broadcast::Receiver<SessionEvent>, tag: &str) {
    server
        .send_json(json!({
            "type": "response.audio_transcript.done",
            "response_id": format!("barrier_{}", tag),
            "transcript": tag,
        }))
        .await;
    next_matching(events, |e| {
        matches!(e, SessionEvent::MessageAdded(m) if m.text == tag)
    })
    .await;
}

#[tokio::test]
async fn speech_stop_triggers_exactly_one_response() {
    let rig = rig();
    let mut events = rig.session.subscribe();
    let mut server = connected(&rig).await;

    let mut states = vec![rig.session.conversation_state()];
    rig.session.start_conversation().unwrap();
    states.push(rig.session.conversation_state());

    server
        .send_json(json!({ "type": "input_audio_buffer.speech_started", "audio_start_ms": 100 }))
        .await;
    next_matching(&mut events, |e| *e == SessionEvent::UserSpeakingChanged(true)).await;
    states.push(rig.session.conversation_state());

    // Delivered twice in succession
    let stop = json!({ "type": "input_audio_buffer.speech_stopped", "audio_end_ms": 900 });
    server.send_json(stop.clone()).await;
    server.send_json(stop).await;
    next_matching(&mut events, |e| *e == SessionEvent::UserSpeakingChanged(false)).await;
    eventually(|| rig.session.metrics().duplicate_stops == 1).await;
    states.push(rig.session.conversation_state());

    assert_eq!(
        states,
        vec![
            Some(ConversationState::Idle),
            Some(ConversationState::Listening),
            Some(ConversationState::Listening),
            Some(ConversationState::Listening),
        ]
    );
    assert_eq!(server.count_sent_of_type("response.create"), 1);
    assert_eq!(rig.session.metrics().responses_triggered, 1);
}

#[tokio::test]
async fn redelivered_stop_with_same_item_is_ignored() {
    let rig = rig();
    let mut events = rig.session.subscribe();
    let mut server = connected(&rig).await;
    rig.session.start_conversation().unwrap();

    let stop = json!({ "type": "input_audio_buffer.speech_stopped", "item_id": "item_7" });
    server
        .send_json(json!({ "type": "input_audio_buffer.speech_started", "item_id": "item_7" }))
        .await;
    server.send_json(stop.clone()).await;
    server
        .send_json(json!({ "type": "input_audio_buffer.speech_started", "item_id": "item_7" }))
        .await;
    server.send_json(stop).await;
    barrier(&server, &mut events, "after-stops").await;

    assert_eq!(server.count_sent_of_type("response.create"), 1);
}

#[tokio::test]
async fn next_utterance_plays_after_previous_finishes() {
    let rig = rig();
    let mut events = rig.session.subscribe();
    let server = connected(&rig).await;

    server
        .send_json(json!({ "type": "response.created", "response": { "id": "resp_a" } }))
        .await;
    server.send_json(delta("resp_a", 0.25, 2)).await;
    server.send_json(delta("resp_a", 0.5, 2)).await;
    server
        .send_json(json!({ "type": "response.created", "response": { "id": "resp_b" } }))
        .await;
    server.send_json(delta("resp_b", -0.5, 2)).await;
    barrier(&server, &mut events, "queued").await;

    assert_eq!(
        rig.session.conversation_state(),
        Some(ConversationState::Speaking)
    );

    // A is not done yet, so B must wait behind it
    let mut out = [0.0f32; 8];
    assert_eq!(rig.output.pull(&mut out), 4);
    let a1 = quantized(0.25);
    let a2 = quantized(0.5);
    assert_eq!(&out[..4], &[a1, a1, a2, a2]);

    server
        .send_json(json!({ "type": "response.audio.done", "response_id": "resp_a" }))
        .await;
    barrier(&server, &mut events, "a-done").await;

    let mut out = [0.0f32; 4];
    assert_eq!(rig.output.pull(&mut out), 2);
    let b1 = quantized(-0.5);
    assert_eq!(out, [b1, b1, 0.0, 0.0]);
}

#[tokio::test]
async fn connect_while_connected_is_already_active() {
    let rig = rig();
    let _server = connected(&rig).await;

    assert_eq!(rig.session.connect().await, Err(VoiceError::AlreadyActive));
    assert_eq!(rig.connector.connect_count(), 1);
    assert_eq!(rig.session.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn second_session_rejected_while_first_is_connecting() {
    let guard = Arc::new(ConnectionGuard::new());
    let first = rig_with_guard(guard.clone());
    let second = rig_with_guard(guard.clone());

    first.connector.hang_next_connect();
    let first_session = Arc::new(first.session);
    let pending = {
        let session = first_session.clone();
        tokio::spawn(async move { session.connect().await })
    };
    eventually(|| first_session.connection_state() == ConnectionState::Connecting).await;

    assert_eq!(second.session.connect().await, Err(VoiceError::AlreadyActive));
    assert_eq!(second.connector.connect_count(), 0);

    first_session.disconnect();
    assert!(!guard.is_active());
    second.session.connect().await.unwrap();
    assert_eq!(second.session.connection_state(), ConnectionState::Connected);

    pending.abort();
}

#[tokio::test]
async fn malformed_audio_delta_is_counted_and_dropped() {
    let rig = rig();
    let mut events = rig.session.subscribe();
    let server = connected(&rig).await;

    server.send_json(delta("resp_1", 0.1, 4)).await;
    barrier(&server, &mut events, "first").await;
    assert_eq!(
        rig.session.conversation_state(),
        Some(ConversationState::Speaking)
    );

    server
        .send_json(json!({ "type": "response.audio.delta", "response_id": "resp_1", "delta": "%%%not-base64%%%" }))
        .await;
    barrier(&server, &mut events, "second").await;

    assert_eq!(rig.session.connection_state(), ConnectionState::Connected);
    assert_eq!(
        rig.session.conversation_state(),
        Some(ConversationState::Speaking)
    );
    assert_eq!(rig.session.metrics().decode_errors, 1);
    assert_eq!(rig.session.pending_playback_frames(), 1);
}

#[tokio::test]
async fn duplicate_close_surfaces_reason_and_allows_reconnect() {
    let rig = rig();
    let mut events = rig.session.subscribe();
    let server = connected(&rig).await;
    rig.session.start_conversation().unwrap();

    server.close(4409, "Another tab is already connected").await;
    let event = next_matching(&mut events, |e| matches!(e, SessionEvent::Error(_))).await;
    assert_eq!(
        event,
        SessionEvent::Error(VoiceError::DuplicateConnection(
            "Another tab is already connected".to_string()
        ))
    );

    eventually(|| rig.session.connection_state() == ConnectionState::Failed).await;
    assert!(!rig.guard.is_active());
    assert!(!rig.input.is_open());
    assert!(!rig.output.is_open());

    // No automatic retry; an explicit connect works
    assert_eq!(rig.connector.connect_count(), 1);
    rig.session.connect().await.unwrap();
    assert_eq!(rig.session.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn transport_error_is_transport_lost() {
    let rig = rig();
    let mut events = rig.session.subscribe();
    let server = connected(&rig).await;

    server.fail("connection reset by peer").await;
    let event = next_matching(&mut events, |e| matches!(e, SessionEvent::Error(_))).await;
    assert!(matches!(
        event,
        SessionEvent::Error(VoiceError::TransportLost(_))
    ));
    eventually(|| rig.session.failure().is_some()).await;
}

#[tokio::test]
async fn hiding_the_host_disconnects() {
    let rig = rig();
    let server = connected(&rig).await;

    rig.guard.set_visible(false);
    assert_eq!(rig.session.connection_state(), ConnectionState::Disconnected);
    assert!(server.is_shutdown());

    assert!(matches!(
        rig.session.connect().await,
        Err(VoiceError::InvalidStateTransition { .. })
    ));

    rig.guard.set_visible(true);
    rig.session.connect().await.unwrap();
}

#[tokio::test]
async fn stop_conversation_flushes_and_keeps_connection() {
    let rig = rig();
    let mut events = rig.session.subscribe();
    let mut server = connected(&rig).await;
    rig.session.start_conversation().unwrap();

    server
        .send_json(json!({ "type": "response.created", "response": { "id": "resp_1" } }))
        .await;
    server.send_json(delta("resp_1", 0.3, 4)).await;
    barrier(&server, &mut events, "speaking").await;
    assert_eq!(rig.session.pending_playback_frames(), 1);

    rig.session.stop_conversation().unwrap();
    assert_eq!(rig.session.pending_playback_frames(), 0);
    assert_eq!(rig.session.conversation_state(), Some(ConversationState::Idle));

    // Capture callback right after stop must not forward anything
    rig.input.feed(&[0.9; 8]);

    // Late audio of the stopped response is discarded
    server.send_json(delta("resp_1", 0.3, 4)).await;
    barrier(&server, &mut events, "late").await;
    assert_eq!(rig.session.pending_playback_frames(), 0);
    assert_eq!(rig.session.conversation_state(), Some(ConversationState::Idle));
    assert_eq!(rig.session.connection_state(), ConnectionState::Connected);
    assert!(!server.is_shutdown());
    assert_eq!(server.count_sent_of_type("input_audio_buffer.append"), 0);
}

#[tokio::test]
async fn lost_microphone_is_recoverable() {
    let rig = rig();
    let mut events = rig.session.subscribe();
    let _server = connected(&rig).await;
    rig.session.start_conversation().unwrap();

    rig.input.lose_device("USB microphone unplugged");
    let event = next_matching(&mut events, |e| matches!(e, SessionEvent::Error(_))).await;
    assert!(matches!(
        event,
        SessionEvent::Error(VoiceError::DeviceUnavailable(_))
    ));

    eventually(|| rig.session.conversation_state() == Some(ConversationState::Idle)).await;
    assert_eq!(rig.session.connection_state(), ConnectionState::Connected);

    // The user can simply start again
    rig.session.start_conversation().unwrap();
    assert!(rig.input.is_open());
}

#[tokio::test]
async fn transcripts_are_appended_in_order() {
    let rig = rig();
    let mut events = rig.session.subscribe();
    let server = connected(&rig).await;
    rig.session.start_conversation().unwrap();

    server
        .send_json(json!({ "type": "input_audio_buffer.committed", "item_id": "item_u1" }))
        .await;
    server
        .send_json(json!({
            "type": "conversation.item.input_audio_transcription.completed",
            "item_id": "item_u1",
            "transcript": " Hello there "
        }))
        .await;
    server
        .send_json(json!({ "type": "response.audio_transcript.delta", "response_id": "resp_1", "delta": "Hi" }))
        .await;
    let partial = next_matching(&mut events, |e| {
        matches!(e, SessionEvent::AssistantTranscriptDelta { .. })
    })
    .await;
    assert_eq!(
        partial,
        SessionEvent::AssistantTranscriptDelta {
            response_id: "resp_1".to_string(),
            text: "Hi".to_string()
        }
    );

    server
        .send_json(json!({ "type": "response.audio_transcript.done", "response_id": "resp_1", "transcript": "Hi! How can I help?" }))
        .await;
    next_matching(&mut events, |e| {
        matches!(e, SessionEvent::MessageAdded(m) if m.role == Role::Assistant)
    })
    .await;

    let transcript: Vec<(Role, String)> = rig
        .session
        .transcript()
        .into_iter()
        .map(|m| (m.role, m.text))
        .collect();
    assert_eq!(
        transcript[1..],
        [
            (Role::User, "Hello there".to_string()),
            (Role::Assistant, "Hi! How can I help?".to_string()),
        ]
    );
    assert_eq!(transcript[0].0, Role::System);
}

#[tokio::test]
async fn function_call_is_forwarded() {
    let rig = rig();
    let mut events = rig.session.subscribe();
    let server = connected(&rig).await;

    server
        .send_json(json!({
            "type": "response.function_call_arguments.done",
            "call_id": "call_1",
            "name": "lookup_order",
            "arguments": "{\"id\":42}"
        }))
        .await;

    let event = next_matching(&mut events, |e| matches!(e, SessionEvent::FunctionCall { .. })).await;
    assert_eq!(
        event,
        SessionEvent::FunctionCall {
            call_id: "call_1".to_string(),
            name: "lookup_order".to_string(),
            arguments: "{\"id\":42}".to_string(),
        }
    );
}

#[tokio::test]
async fn disconnect_is_always_safe() {
    let rig = rig();
    rig.session.disconnect();
    assert_eq!(rig.session.connection_state(), ConnectionState::Disconnected);

    let server = connected(&rig).await;
    rig.session.start_conversation().unwrap();
    rig.session.disconnect();
    rig.session.disconnect();

    assert_eq!(rig.session.connection_state(), ConnectionState::Disconnected);
    assert!(server.is_shutdown());
    assert!(!rig.input.is_open());
    assert!(!rig.guard.is_active());
    assert!(matches!(
        rig.session.start_conversation(),
        Err(VoiceError::InvalidStateTransition { .. })
    ));
}

#[tokio::test]
async fn conversation_started_right_after_connect_streams_first_frames() {
    let rig = rig();
    rig.session.connect().await.unwrap();

    // No yield: the network loop has not run yet
    rig.session.start_conversation().unwrap();
    rig.input.feed(&[0.5; 4]);
    rig.input.feed(&[-0.5; 4]);

    let mut server = rig.connector.take_server().unwrap();
    server
        .next_sent_of_type("input_audio_buffer.append")
        .await
        .unwrap();
    server
        .next_sent_of_type("input_audio_buffer.append")
        .await
        .unwrap();
    eventually(|| rig.session.metrics().frames_sent == 2).await;
    assert_eq!(rig.session.metrics().frames_dropped, 0);
}

#[tokio::test]
async fn microphone_frames_go_out_ahead_of_queued_inbound_events() {
    let rig = rig();
    let mut server = connected(&rig).await;
    rig.session.start_conversation().unwrap();

    // Everything below is queued before the loop gets to run
    server
        .send_json(json!({ "type": "input_audio_buffer.speech_stopped", "item_id": "item_1" }))
        .await;
    for _ in 0..16 {
        server.send_json(delta("resp_1", 0.1, 2)).await;
    }
    rig.input.feed(&[0.5; 4]);

    let sent: Vec<serde_json::Value> = [
        server.next_sent().await.unwrap(),
        server.next_sent().await.unwrap(),
    ]
    .iter()
    .map(|text| serde_json::from_str(text).unwrap())
    .collect();
    assert_eq!(sent[0]["type"], "input_audio_buffer.append");
    assert_eq!(sent[1]["type"], "response.create");
}

#[tokio::test]
async fn old_connection_drain_leaves_new_connection_audio_alone() {
    let settings = VoiceSettings {
        drain_timeout_ms: 500,
        ..small_frames()
    };
    let rig = rig_with(settings, Arc::new(ConnectionGuard::new()));
    let mut events = rig.session.subscribe();

    let old = connected(&rig).await;
    old.send_json(delta("resp_old", 0.25, 4)).await;
    barrier(&old, &mut events, "old-queued").await;
    old.close(1000, "bye").await;
    eventually(|| rig.session.connection_state() == ConnectionState::Disconnected).await;
    assert_eq!(rig.session.pending_playback_frames(), 1);

    let new = connected(&rig).await;
    new.send_json(json!({ "type": "response.created", "response": { "id": "resp_new" } }))
        .await;
    new.send_json(delta("resp_new", 0.5, 4)).await;
    barrier(&new, &mut events, "new-queued").await;
    assert_eq!(rig.session.pending_playback_frames(), 2);

    // Past the old drain deadline: only the old audio is gone
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(rig.session.pending_playback_frames(), 1);
    assert!(rig.output.is_open());

    new.send_json(delta("resp_new", 0.5, 4)).await;
    barrier(&new, &mut events, "new-more").await;
    assert_eq!(rig.session.pending_playback_frames(), 2);
    assert_eq!(
        rig.session.conversation_state(),
        Some(ConversationState::Speaking)
    );

    let mut out = [0.0f32; 8];
    assert_eq!(rig.output.pull(&mut out), 8);
    assert_eq!(out, [quantized(0.5); 8]);
}

#[tokio::test]
async fn disconnect_during_handshake_is_not_a_transport_failure() {
    let rig = rig();
    rig.connector.delay_next_connect(Duration::from_millis(100));

    let session = Arc::new(rig.session);
    let pending = {
        let session = session.clone();
        tokio::spawn(async move { session.connect().await })
    };
    eventually(|| session.connection_state() == ConnectionState::Connecting).await;
    session.disconnect();

    let result = pending.await.unwrap();
    assert!(matches!(
        result,
        Err(VoiceError::InvalidStateTransition { .. })
    ));
    assert_eq!(session.connection_state(), ConnectionState::Disconnected);
    assert_eq!(session.failure(), None);
    assert!(rig.connector.take_server().unwrap().is_shutdown());
    assert!(!rig.guard.is_active());
}
