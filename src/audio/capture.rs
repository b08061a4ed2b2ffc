//! Microphone capture engine
//!
//! The device callback is registered once, when the engine is opened, and
//! keeps firing for as long as the device is open. Whether its frames go
//! anywhere is decided per callback by an atomic "armed" flag, so arming and
//! disarming never touch the audio graph.
//!
//! # Architecture
//!
//! ```text
//! Audio Thread (sync)                          Tokio Runtime (async)
//! ┌───────────────────────────┐                ┌──────────────────────┐
//! │ device callback           │                │ session network loop │
//! │  FrameAssembler::push()   │                │  frames.recv()       │
//! │   ├─ armed? (atomic)      │──try_send──▶   │  base64 + append     │
//! │   ├─ 4096-sample frames   │  (bounded)     │  → WebSocket         │
//! │   └─ encode PCM16         │                └──────────────────────┘
//! └───────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use super::codec::{frame_level, FrameCodec};
use super::frame::{AudioFrame, UtteranceId, CAPTURE_FRAME_SIZE, SAMPLE_RATE};
use crate::error::VoiceError;
use crate::metrics::SessionMetrics;

/// Requested input device parameters
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Device name, or `None` for the system default
    pub device_name: Option<String>,
    pub sample_rate: u32,
    /// Samples per outbound frame
    pub frame_size: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            sample_rate: SAMPLE_RATE,
            frame_size: CAPTURE_FRAME_SIZE,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain: true,
        }
    }
}

/// Lifecycle of the input device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Closed,
    Open,
    /// The device disappeared mid-stream; must be closed before reopening
    Lost,
}

impl CaptureState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CaptureState::Open,
            2 => CaptureState::Lost,
            _ => CaptureState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CaptureState::Closed => 0,
            CaptureState::Open => 1,
            CaptureState::Lost => 2,
        }
    }
}

/// Out-of-band notifications from the capture device
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureNotice {
    DeviceLost(String),
}

/// A platform input device.
///
/// Implementations start delivering mono float samples to the assembler from
/// their own audio thread and report device failures through
/// [`CaptureHandle::device_lost`].
pub trait InputBackend: Send {
    fn open(&mut self, config: &CaptureConfig, assembler: FrameAssembler)
        -> Result<(), VoiceError>;

    /// Release the device. Must be idempotent.
    fn close(&mut self);
}

struct CaptureShared {
    armed: AtomicBool,
    utterance: AtomicU64,
    sequence: AtomicU64,
    /// First sequence number of the current armed period
    armed_from: AtomicU64,
    state: AtomicU8,
    frames: mpsc::Sender<AudioFrame>,
    notices: mpsc::UnboundedSender<CaptureNotice>,
    metrics: Arc<SessionMetrics>,
}

/// Cheap clonable handle the audio thread uses to talk to the engine
#[derive(Clone)]
pub struct CaptureHandle {
    shared: Arc<CaptureShared>,
}

impl CaptureHandle {
    /// Whether frames are currently forwarded
    pub fn is_armed(&self) -> bool {
        self.shared.armed.load(Ordering::Acquire)
    }

    /// Report that the device went away. Disarms immediately.
    pub fn device_lost(&self, message: impl Into<String>) {
        let message = message.into();
        self.shared.armed.store(false, Ordering::Release);
        let previous = self.shared.state.compare_exchange(
            CaptureState::Open.as_u8(),
            CaptureState::Lost.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if previous.is_ok() {
            log::warn!("Capture: input device lost: {}", message);
            let _ = self.shared.notices.send(CaptureNotice::DeviceLost(message));
        }
    }

    fn emit(&self, samples: &[f32]) {
        // Re-checked here: a disarm may land while a frame is being assembled
        if !self.is_armed() {
            return;
        }

        let level = frame_level(samples);
        let pcm = FrameCodec::encode(samples);
        let sequence = self.shared.sequence.fetch_add(1, Ordering::Relaxed);
        let utterance = UtteranceId::from_raw(self.shared.utterance.load(Ordering::Acquire));
        let frame = AudioFrame::new(utterance, sequence, pcm);

        log::trace!(
            "Capture: frame {} ({} samples, level {:.4})",
            sequence,
            samples.len(),
            level
        );

        self.shared.metrics.frame_captured();
        match self.shared.frames.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.shared.metrics.frame_dropped();
                log::trace!("Capture: hand-off queue full, dropped frame {}", sequence);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.shared.metrics.frame_dropped();
            }
        }
    }
}

/// Accumulates device callbacks into fixed-size frames.
///
/// Owned by the device callback closure; never shared.
pub struct FrameAssembler {
    handle: CaptureHandle,
    buffer: Vec<f32>,
    frame_size: usize,
}

impl FrameAssembler {
    fn new(handle: CaptureHandle, frame_size: usize) -> Self {
        Self {
            handle,
            buffer: Vec::with_capacity(frame_size * 2),
            frame_size: frame_size.max(1),
        }
    }

    /// Handle for reporting device errors from the error callback
    pub fn handle(&self) -> CaptureHandle {
        self.handle.clone()
    }

    /// Feed mono samples from one device callback
    pub fn push(&mut self, samples: &[f32]) {
        if !self.handle.is_armed() {
            // Stale audio must not leak into the next armed period
            self.buffer.clear();
            return;
        }

        self.buffer.extend_from_slice(samples);
        while self.buffer.len() >= self.frame_size {
            let frame: Vec<f32> = self.buffer.drain(..self.frame_size).collect();
            self.handle.emit(&frame);
        }
    }
}

/// Owns the microphone and produces outbound frames while armed
pub struct AudioCaptureEngine {
    backend: Box<dyn InputBackend>,
    shared: Arc<CaptureShared>,
}

impl AudioCaptureEngine {
    /// Create a closed engine.
    ///
    /// # Arguments
    /// * `backend` - Platform input device
    /// * `frames` - Bounded hand-off queue drained by the network loop
    /// * `notices` - Device-lost notifications
    pub fn new(
        backend: Box<dyn InputBackend>,
        frames: mpsc::Sender<AudioFrame>,
        notices: mpsc::UnboundedSender<CaptureNotice>,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        Self {
            backend,
            shared: Arc::new(CaptureShared {
                armed: AtomicBool::new(false),
                utterance: AtomicU64::new(0),
                sequence: AtomicU64::new(0),
                armed_from: AtomicU64::new(0),
                state: AtomicU8::new(CaptureState::Closed.as_u8()),
                frames,
                notices,
                metrics,
            }),
        }
    }

    /// Open the input device. A no-op if it is already open.
    pub fn open(&mut self, config: &CaptureConfig) -> Result<(), VoiceError> {
        match self.state() {
            CaptureState::Open => return Ok(()),
            CaptureState::Lost => self.close(),
            CaptureState::Closed => {}
        }

        log::info!(
            "Capture: opening input device {:?} ({} Hz mono, {} samples/frame, aec={} ns={} agc={})",
            config.device_name.as_deref().unwrap_or("default"),
            config.sample_rate,
            config.frame_size,
            config.echo_cancellation,
            config.noise_suppression,
            config.auto_gain
        );

        let assembler = FrameAssembler::new(self.handle(), config.frame_size);
        self.backend.open(config, assembler)?;
        self.set_state(CaptureState::Open);
        Ok(())
    }

    /// Start forwarding frames under a fresh outbound utterance
    pub fn arm(&self) -> Result<UtteranceId, VoiceError> {
        if self.state() != CaptureState::Open {
            return Err(VoiceError::NotOpen);
        }
        let utterance = self.begin_utterance();
        let armed_from = self.shared.sequence.load(Ordering::Acquire);
        self.shared.armed_from.store(armed_from, Ordering::Release);
        self.shared.armed.store(true, Ordering::Release);
        log::debug!("Capture: armed ({})", utterance);
        Ok(utterance)
    }

    /// Stop forwarding frames. The device keeps running.
    pub fn disarm(&self) {
        if self.shared.armed.swap(false, Ordering::AcqRel) {
            log::debug!("Capture: disarmed");
        }
    }

    /// Tag subsequent frames with a new outbound utterance id
    pub fn begin_utterance(&self) -> UtteranceId {
        let utterance = UtteranceId::next();
        self.shared
            .utterance
            .store(utterance.as_u64(), Ordering::Release);
        utterance
    }

    /// Current outbound utterance id
    pub fn current_utterance(&self) -> UtteranceId {
        UtteranceId::from_raw(self.shared.utterance.load(Ordering::Acquire))
    }

    /// Release the device. Idempotent.
    pub fn close(&mut self) {
        self.disarm();
        if self.state() != CaptureState::Closed {
            self.backend.close();
            self.set_state(CaptureState::Closed);
            log::info!("Capture: input device closed");
        }
    }

    pub fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_armed(&self) -> bool {
        self.shared.armed.load(Ordering::Acquire)
    }

    /// Whether a queued frame was captured during the current armed period.
    ///
    /// Frames still queued from an earlier period (a stopped conversation or
    /// a previous connection) are rejected.
    pub fn accepts(&self, frame: &AudioFrame) -> bool {
        self.is_armed() && frame.sequence() >= self.shared.armed_from.load(Ordering::Acquire)
    }

    fn handle(&self) -> CaptureHandle {
        CaptureHandle {
            shared: self.shared.clone(),
        }
    }

    fn set_state(&self, state: CaptureState) {
        self.shared.state.store(state.as_u8(), Ordering::Release);
    }
}

impl Drop for AudioCaptureEngine {
    fn drop(&mut self) {
        self.close();
    }
}
