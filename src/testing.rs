//! Device-free and network-free fakes for the backend and transport seams.
//!
//! Used by the crate's own tests and by integration tests that drive a
//! [`VoiceSession`](crate::VoiceSession) end to end.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::{
    CaptureConfig, FrameAssembler, InputBackend, OutputBackend, PlaybackConfig, PlaybackSource,
};
use crate::error::VoiceError;
use crate::streaming::{ConnectRequest, Connector, TransportChannels, TransportEvent};

const INCOMING_DEPTH: usize = 256;
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Input
// ============================================================================

#[derive(Default)]
struct FakeInputState {
    assembler: Option<FrameAssembler>,
    fail_next: Option<String>,
    callbacks: usize,
    opens: usize,
    closes: usize,
}

/// Microphone that produces samples only when told to
#[derive(Clone, Default)]
pub struct FakeInput {
    state: Arc<Mutex<FakeInputState>>,
}

impl FakeInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `open` fails with `DeviceUnavailable(message)`
    pub fn fail_next_open(&self, message: &str) {
        lock(&self.state).fail_next = Some(message.to_string());
    }

    /// Simulate one device callback. Ignored while the device is closed.
    pub fn feed(&self, samples: &[f32]) {
        let mut state = lock(&self.state);
        let FakeInputState {
            assembler,
            callbacks,
            ..
        } = &mut *state;
        if let Some(assembler) = assembler.as_mut() {
            *callbacks += 1;
            assembler.push(samples);
        }
    }

    /// Simulate the device disappearing mid-stream
    pub fn lose_device(&self, message: &str) {
        let handle = lock(&self.state).assembler.as_ref().map(|a| a.handle());
        if let Some(handle) = handle {
            handle.device_lost(message);
        }
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).assembler.is_some()
    }

    /// Callbacks delivered while open
    pub fn callbacks(&self) -> usize {
        lock(&self.state).callbacks
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).opens
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).closes
    }
}

impl InputBackend for FakeInput {
    fn open(&mut self, _config: &CaptureConfig, assembler: FrameAssembler) -> Result<(), VoiceError> {
        let mut state = lock(&self.state);
        if let Some(message) = state.fail_next.take() {
            return Err(VoiceError::DeviceUnavailable(message));
        }
        state.assembler = Some(assembler);
        state.opens += 1;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = lock(&self.state);
        if state.assembler.take().is_some() {
            state.closes += 1;
        }
    }
}

// ============================================================================
// Output
// ============================================================================

#[derive(Default)]
struct FakeOutputState {
    source: Option<PlaybackSource>,
    fail_next: Option<String>,
}

/// Speaker whose render callback is driven by the test
#[derive(Clone, Default)]
pub struct FakeOutput {
    state: Arc<Mutex<FakeOutputState>>,
}

impl FakeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_open(&self, message: &str) {
        lock(&self.state).fail_next = Some(message.to_string());
    }

    /// Simulate one render callback. Returns samples taken from the queue.
    pub fn pull(&self, out: &mut [f32]) -> usize {
        let source = lock(&self.state).source.clone();
        match source {
            Some(source) => source.fill(out),
            None => {
                out.fill(0.0);
                0
            }
        }
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).source.is_some()
    }
}

impl OutputBackend for FakeOutput {
    fn open(&mut self, _config: &PlaybackConfig, source: PlaybackSource) -> Result<(), VoiceError> {
        let mut state = lock(&self.state);
        if let Some(message) = state.fail_next.take() {
            return Err(VoiceError::PlaybackUnavailable(message));
        }
        state.source = Some(source);
        Ok(())
    }

    fn close(&mut self) {
        lock(&self.state).source = None;
    }
}

// ============================================================================
// Transport
// ============================================================================

enum NextConnect {
    Open,
    Hang,
    /// Opens, but only after the delay
    Delay(std::time::Duration),
    Fail(VoiceError),
}

struct ConnectorState {
    next: NextConnect,
    connects: usize,
    server: Option<FakeServer>,
}

/// In-memory connector; each successful connect hands the test a [`FakeServer`]
#[derive(Clone)]
pub struct ChannelConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl ChannelConnector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ConnectorState {
                next: NextConnect::Open,
                connects: 0,
                server: None,
            })),
        }
    }

    /// The next handshake never completes
    pub fn hang_next_connect(&self) {
        lock(&self.state).next = NextConnect::Hang;
    }

    /// The next handshake succeeds after `delay`
    pub fn delay_next_connect(&self, delay: std::time::Duration) {
        lock(&self.state).next = NextConnect::Delay(delay);
    }

    pub fn fail_next_connect(&self, error: VoiceError) {
        lock(&self.state).next = NextConnect::Fail(error);
    }

    /// Handshakes attempted, successful or not
    pub fn connect_count(&self) -> usize {
        lock(&self.state).connects
    }

    /// Server end of the most recent successful connection
    pub fn take_server(&self) -> Option<FakeServer> {
        lock(&self.state).server.take()
    }
}

impl Default for ChannelConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for ChannelConnector {
    fn connect<'a>(
        &'a self,
        request: &'a ConnectRequest,
    ) -> BoxFuture<'a, Result<TransportChannels, VoiceError>> {
        let mut state = lock(&self.state);
        state.connects += 1;

        match std::mem::replace(&mut state.next, NextConnect::Open) {
            NextConnect::Hang => Box::pin(std::future::pending()),
            NextConnect::Fail(error) => Box::pin(async move { Err(error) }),
            NextConnect::Open => {
                let channels = open_channels(&mut state, request);
                Box::pin(async move { Ok(channels) })
            }
            NextConnect::Delay(delay) => {
                let channels = open_channels(&mut state, request);
                Box::pin(async move {
                    tokio::time::sleep(delay).await;
                    Ok(channels)
                })
            }
        }
    }
}

fn open_channels(state: &mut ConnectorState, request: &ConnectRequest) -> TransportChannels {
    let (outgoing_tx, outgoing_rx) = mpsc::channel(request.outbound_queue_depth.max(1));
    let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_DEPTH);
    let shutdown = CancellationToken::new();

    state.server = Some(FakeServer {
        sent: outgoing_rx,
        incoming: incoming_tx,
        shutdown: shutdown.clone(),
        headers: request.headers.clone(),
    });
    TransportChannels {
        outgoing: outgoing_tx,
        incoming: incoming_rx,
        shutdown,
    }
}

/// The service side of a [`ChannelConnector`] connection
pub struct FakeServer {
    sent: mpsc::Receiver<String>,
    incoming: mpsc::Sender<TransportEvent>,
    shutdown: CancellationToken,
    headers: std::collections::HashMap<String, String>,
}

impl FakeServer {
    /// Deliver a JSON message to the client
    pub async fn send_json(&self, message: serde_json::Value) {
        self.send_text(&message.to_string()).await;
    }

    /// Deliver a raw text frame (may be malformed)
    pub async fn send_text(&self, text: &str) {
        let _ = self
            .incoming
            .send(TransportEvent::Message(text.to_string()))
            .await;
    }

    pub async fn close(&self, code: u16, reason: &str) {
        let _ = self
            .incoming
            .send(TransportEvent::Closed {
                code: Some(code),
                reason: reason.to_string(),
            })
            .await;
    }

    pub async fn fail(&self, message: &str) {
        let _ = self
            .incoming
            .send(TransportEvent::Error(message.to_string()))
            .await;
    }

    /// Next message the client sent, waiting briefly
    pub async fn next_sent(&mut self) -> Option<String> {
        tokio::time::timeout(RECV_TIMEOUT, self.sent.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next sent message whose `type` is `kind`, skipping others
    pub async fn next_sent_of_type(&mut self, kind: &str) -> Option<serde_json::Value> {
        while let Some(text) = self.next_sent().await {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                if value["type"] == kind {
                    return Some(value);
                }
            }
        }
        None
    }

    /// Everything sent so far, without waiting
    pub fn drain_sent(&mut self) -> Vec<String> {
        std::iter::from_fn(|| self.sent.try_recv().ok()).collect()
    }

    /// Count of drained messages with the given `type`
    pub fn count_sent_of_type(&mut self, kind: &str) -> usize {
        self.drain_sent()
            .iter()
            .filter_map(|text| serde_json::from_str::<serde_json::Value>(text).ok())
            .filter(|value| value["type"] == kind)
            .count()
    }

    /// Whether the client closed the connection
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}
