//! Speaker playback engine
//!
//! Inbound frames are queued per utterance and rendered strictly in sequence
//! order. Utterances play back to back in arrival order: a new utterance that
//! shows up while the previous one is still playing waits its turn instead of
//! cutting it off. Only [`AudioPlaybackEngine::flush`] interrupts.
//!
//! The output device pulls samples through a [`PlaybackSource`] from its own
//! thread; `enqueue` only takes a short lock and never waits on the device.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::codec::FrameCodec;
use super::frame::{AudioFrame, UtteranceId, SAMPLE_RATE};
use crate::error::VoiceError;
use crate::metrics::SessionMetrics;

/// How many flushed/finished utterance ids are remembered to reject late frames
const RETIRED_HISTORY: usize = 32;

/// Poll interval while waiting for playback to drain
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Requested output device parameters
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Device name, or `None` for the system default
    pub device_name: Option<String>,
    pub sample_rate: u32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            sample_rate: SAMPLE_RATE,
        }
    }
}

/// A platform output device.
///
/// Implementations pull mono float samples from the source on their own
/// thread via [`PlaybackSource::fill`].
pub trait OutputBackend: Send {
    fn open(&mut self, config: &PlaybackConfig, source: PlaybackSource)
        -> Result<(), VoiceError>;

    /// Release the device. Must be idempotent.
    fn close(&mut self);
}

/// Frames of one inbound utterance waiting to be rendered
#[derive(Debug, Default)]
struct UtteranceStream {
    next_sequence: u64,
    pending: BTreeMap<u64, AudioFrame>,
    complete: bool,
}

/// Per-utterance reorder buffer with arrival-ordered utterances
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    order: VecDeque<UtteranceId>,
    streams: HashMap<UtteranceId, UtteranceStream>,
    retired: VecDeque<UtteranceId>,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame.
    ///
    /// Returns `Ok(false)` when the frame belongs to an utterance that was
    /// already flushed or finished and is silently discarded. Duplicate or
    /// already-rendered sequence numbers are a `ProtocolError`.
    pub fn push(&mut self, frame: AudioFrame) -> Result<bool, VoiceError> {
        let id = frame.utterance();
        if self.retired.contains(&id) {
            log::debug!(
                "Playback: discarding frame {} of retired {}",
                frame.sequence(),
                id
            );
            return Ok(false);
        }

        if !self.streams.contains_key(&id) {
            self.order.push_back(id);
        }
        let stream = self.streams.entry(id).or_default();

        if stream.complete {
            return Err(VoiceError::ProtocolError(format!(
                "frame {} arrived after {} completed",
                frame.sequence(),
                id
            )));
        }

        let sequence = frame.sequence();
        if sequence < stream.next_sequence || stream.pending.contains_key(&sequence) {
            return Err(VoiceError::ProtocolError(format!(
                "duplicate or stale sequence {} for {} (expecting {})",
                sequence, id, stream.next_sequence
            )));
        }

        stream.pending.insert(sequence, frame);
        Ok(true)
    }

    /// Mark an utterance as fully produced
    pub fn complete(&mut self, id: UtteranceId) {
        match self.streams.get_mut(&id) {
            Some(stream) => stream.complete = true,
            // Nothing queued yet; remember it so late frames are not replayed
            None => self.retire(id),
        }
    }

    /// Next frame in render order, if one is ready.
    ///
    /// The head utterance blocks everything behind it until it is complete
    /// and fully rendered.
    pub fn next_frame(&mut self) -> Option<AudioFrame> {
        loop {
            let id = *self.order.front()?;
            let Some(stream) = self.streams.get_mut(&id) else {
                self.order.pop_front();
                continue;
            };

            if let Some(frame) = stream.pending.remove(&stream.next_sequence) {
                stream.next_sequence += 1;
                return Some(frame);
            }

            if stream.complete {
                if let Some((&first, _)) = stream.pending.iter().next() {
                    // Producer is done, so the gap will never fill
                    log::warn!(
                        "Playback: {} skipping missing frames {}..{}",
                        id,
                        stream.next_sequence,
                        first
                    );
                    stream.next_sequence = first;
                    continue;
                }
                self.order.pop_front();
                self.streams.remove(&id);
                self.retire(id);
                continue;
            }

            return None;
        }
    }

    /// Drop the given utterances only. Returns the number of frames discarded.
    pub fn discard(&mut self, ids: &[UtteranceId]) -> usize {
        let mut dropped = 0;
        for id in ids {
            if let Some(stream) = self.streams.remove(id) {
                dropped += stream.pending.len();
            }
            self.retire(*id);
        }
        self.order.retain(|id| !ids.contains(id));
        dropped
    }

    /// Whether any of `ids` may still produce frames to render
    pub fn holds_any(&self, ids: &[UtteranceId]) -> bool {
        ids.iter().any(|id| {
            self.streams
                .get(id)
                .is_some_and(|s| !s.complete || !s.pending.is_empty())
        })
    }

    /// Drop everything queued. Returns the number of frames discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.streams.values().map(|s| s.pending.len()).sum();
        let ids: Vec<UtteranceId> = self.order.drain(..).collect();
        self.streams.clear();
        for id in ids {
            self.retire(id);
        }
        dropped
    }

    /// True when no utterance is waiting
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Frames waiting across all utterances
    pub fn pending_frames(&self) -> usize {
        self.streams.values().map(|s| s.pending.len()).sum()
    }

    fn retire(&mut self, id: UtteranceId) {
        if self.retired.contains(&id) {
            return;
        }
        if self.retired.len() >= RETIRED_HISTORY {
            self.retired.pop_front();
        }
        self.retired.push_back(id);
    }
}

/// Decoded samples of the frame currently being rendered
#[derive(Debug, Default)]
struct RenderCursor {
    utterance: Option<UtteranceId>,
    samples: Vec<f32>,
    position: usize,
}

impl RenderCursor {
    fn remaining(&self) -> usize {
        self.samples.len() - self.position
    }

    fn is_rendering_any(&self, ids: &[UtteranceId]) -> bool {
        self.remaining() > 0 && self.utterance.is_some_and(|u| ids.contains(&u))
    }
}

#[derive(Debug, Default)]
struct PlaybackState {
    queue: PlaybackQueue,
    cursor: RenderCursor,
}

struct PlaybackShared {
    state: Mutex<PlaybackState>,
    metrics: Arc<SessionMetrics>,
}

impl PlaybackShared {
    fn lock(&self) -> MutexGuard<'_, PlaybackState> {
        // Never panic on the audio thread
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Sample pump handed to the output device
#[derive(Clone)]
pub struct PlaybackSource {
    shared: Arc<PlaybackShared>,
}

impl PlaybackSource {
    /// Fill `out` with the next mono samples, padding with silence.
    ///
    /// Returns how many samples came from queued audio.
    pub fn fill(&self, out: &mut [f32]) -> usize {
        let mut state = self.shared.lock();
        let mut written = 0;

        while written < out.len() {
            if state.cursor.remaining() == 0 {
                let Some(frame) = state.queue.next_frame() else {
                    break;
                };
                let utterance = frame.utterance();
                let sequence = frame.sequence();
                match FrameCodec::decode(frame.pcm()) {
                    Ok(samples) => {
                        log::trace!("Playback: rendering {} frame {}", utterance, sequence);
                        state.cursor = RenderCursor {
                            utterance: Some(utterance),
                            samples,
                            position: 0,
                        };
                        self.shared.metrics.frame_played();
                    }
                    Err(e) => {
                        log::warn!("Playback: dropping {} frame {}: {}", utterance, sequence, e);
                        self.shared.metrics.playback_error();
                    }
                }
                continue;
            }

            let take = state.cursor.remaining().min(out.len() - written);
            let start = state.cursor.position;
            out[written..written + take].copy_from_slice(&state.cursor.samples[start..start + take]);
            state.cursor.position += take;
            written += take;
        }

        for sample in &mut out[written..] {
            *sample = 0.0;
        }
        written
    }

    fn is_idle(&self) -> bool {
        let state = self.shared.lock();
        state.queue.is_empty() && state.cursor.remaining() == 0
    }

    fn is_done_with(&self, ids: &[UtteranceId]) -> bool {
        let state = self.shared.lock();
        !state.queue.holds_any(ids) && !state.cursor.is_rendering_any(ids)
    }
}

/// Owns the output device and the inbound render queue
pub struct AudioPlaybackEngine {
    backend: Mutex<Box<dyn OutputBackend>>,
    source: PlaybackSource,
    open: Mutex<bool>,
}

impl AudioPlaybackEngine {
    pub fn new(backend: Box<dyn OutputBackend>, metrics: Arc<SessionMetrics>) -> Self {
        Self {
            backend: Mutex::new(backend),
            source: PlaybackSource {
                shared: Arc::new(PlaybackShared {
                    state: Mutex::new(PlaybackState::default()),
                    metrics,
                }),
            },
            open: Mutex::new(false),
        }
    }

    /// Open the output device. A no-op if it is already open.
    ///
    /// Failure is reported as `PlaybackUnavailable`; the session keeps going
    /// without audio output.
    pub fn open(&self, config: &PlaybackConfig) -> Result<(), VoiceError> {
        let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        if *open {
            return Ok(());
        }

        log::info!(
            "Playback: opening output device {:?} ({} Hz mono)",
            config.device_name.as_deref().unwrap_or("default"),
            config.sample_rate
        );

        let mut backend = self.backend.lock().unwrap_or_else(|e| e.into_inner());
        backend
            .open(config, self.source.clone())
            .map_err(|e| match e {
                VoiceError::PlaybackUnavailable(_) => e,
                other => VoiceError::PlaybackUnavailable(other.to_string()),
            })?;
        *open = true;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a frame for rendering
    pub fn enqueue(&self, frame: AudioFrame) -> Result<(), VoiceError> {
        if !self.is_open() {
            return Err(VoiceError::PlaybackUnavailable(
                "output device is not open".to_string(),
            ));
        }
        self.source.shared.lock().queue.push(frame).map(|_| ())
    }

    /// The producer finished this utterance
    pub fn complete_utterance(&self, id: UtteranceId) {
        self.source.shared.lock().queue.complete(id);
    }

    /// Drop all pending and in-flight audio. Returns frames discarded.
    pub fn flush(&self) -> usize {
        let mut state = self.source.shared.lock();
        let dropped = state.queue.clear();
        let in_flight = state.cursor.remaining() > 0;
        state.cursor = RenderCursor::default();
        drop(state);

        if dropped > 0 || in_flight {
            log::info!("Playback: flushed {} queued frame(s)", dropped);
        }
        dropped
    }

    /// Drop the given utterances, including a frame of theirs that is
    /// mid-render. Audio of other utterances is untouched.
    pub fn discard(&self, ids: &[UtteranceId]) -> usize {
        let mut state = self.source.shared.lock();
        let dropped = state.queue.discard(ids);
        if state.cursor.is_rendering_any(ids) {
            state.cursor = RenderCursor::default();
        }
        drop(state);

        if dropped > 0 {
            log::info!("Playback: discarded {} queued frame(s)", dropped);
        }
        dropped
    }

    /// Wait until everything queued has been rendered or `timeout` elapses.
    ///
    /// Returns true if playback drained.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.source.is_idle()).await
    }

    /// `drain` restricted to the given utterances; later audio does not
    /// hold it up.
    pub async fn drain_utterances(&self, ids: &[UtteranceId], timeout: Duration) -> bool {
        self.wait_until(timeout, || self.source.is_done_with(ids)).await
    }

    async fn wait_until(&self, timeout: Duration, done: impl Fn() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut interval = tokio::time::interval(DRAIN_POLL_INTERVAL);
        loop {
            if done() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                log::warn!("Playback: drain timed out after {:?}", timeout);
                return false;
            }
            interval.tick().await;
        }
    }

    pub fn is_idle(&self) -> bool {
        self.source.is_idle()
    }

    pub fn pending_frames(&self) -> usize {
        self.source.shared.lock().queue.pending_frames()
    }

    /// Release the output device. Idempotent.
    pub fn close(&self) {
        let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        if !*open {
            return;
        }
        self.backend
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .close();
        *open = false;
        log::info!("Playback: output device closed");
    }
}

impl Drop for AudioPlaybackEngine {
    fn drop(&mut self) {
        self.close();
    }
}
